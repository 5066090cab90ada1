//! # Configuration Store
//!
//! Process-wide configuration with an `init → periodic reload → read-mostly`
//! lifecycle. The file format is line-oriented `key = value`; lines starting
//! with `;` or `#` are comments.
//!
//! ## Snapshot Model
//!
//! Readers never lock the parse state: [`Config::snapshot`] hands out an
//! `Arc<Snapshot>` and every getter runs against that immutable snapshot.
//! A reload parses the file into a fresh map and publishes it atomically by
//! swapping the `Arc`. Command-line overrides are kept separately and
//! re-applied on top of every reload, so they survive file edits.
//!
//! ## Typed Getters
//!
//! Values are stored as strings and interpreted at the call site:
//! bool (`true/yes/on/1`), int, float, bytes (`4kb`, `1mb`), time
//! (`30s`, `5m`, `250ms`), and two-tier integer pairs (`a,b`, where a bare
//! `n` means `(n, n)`).

mod keys;

pub use keys::*;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::stoppable::{ShutdownRequest, Stoppable};

/// Immutable view of the configuration at one point in time.
#[derive(Debug, Default)]
pub struct Snapshot {
    values: HashMap<String, String>,
}

impl Snapshot {
    pub fn exists(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.values.get(key).map(String::as_str).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(v) => matches!(v.trim(), "true" | "yes" | "on" | "1"),
            None => default,
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(default)
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        self.values
            .get(key)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .unwrap_or(default)
    }

    /// Byte quantity with optional `b`/`kb`/`mb`/`gb` suffix.
    pub fn get_bytes(&self, key: &str, default: u64) -> u64 {
        self.values
            .get(key)
            .and_then(|v| parse_bytes(v))
            .unwrap_or(default)
    }

    /// Duration in seconds with optional `ms`/`s`/`m`/`h`/`d` suffix; a bare
    /// number is taken as seconds. Sub-second values round down to zero.
    pub fn get_time_secs(&self, key: &str, default: u64) -> u64 {
        self.values
            .get(key)
            .and_then(|v| parse_time_ms(v))
            .map(|ms| ms / 1000)
            .unwrap_or(default)
    }

    /// Two-tier integer: `a,b` yields `(a, b)`, a bare `n` yields `(n, n)`.
    pub fn get_int_pair(&self, key: &str, default: u32) -> (u32, u32) {
        match self.values.get(key) {
            Some(v) => {
                let mut parts = v.splitn(2, ',').map(|p| p.trim().parse::<u32>());
                match (parts.next(), parts.next()) {
                    (Some(Ok(a)), Some(Ok(b))) => (a, b),
                    (Some(Ok(a)), None) => (a, a),
                    _ => (default, default),
                }
            }
            None => (default, default),
        }
    }
}

fn parse_bytes(value: &str) -> Option<u64> {
    let v = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = if let Some(rest) = v.strip_suffix("gb") {
        (rest, 1024 * 1024 * 1024)
    } else if let Some(rest) = v.strip_suffix("mb") {
        (rest, 1024 * 1024)
    } else if let Some(rest) = v.strip_suffix("kb") {
        (rest, 1024)
    } else if let Some(rest) = v.strip_suffix('b') {
        (rest, 1)
    } else {
        (v.as_str(), 1)
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

fn parse_time_ms(value: &str) -> Option<u64> {
    let v = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = if let Some(rest) = v.strip_suffix("ms") {
        (rest, 1)
    } else if let Some(rest) = v.strip_suffix('s') {
        (rest, 1000)
    } else if let Some(rest) = v.strip_suffix('m') {
        (rest, 60 * 1000)
    } else if let Some(rest) = v.strip_suffix('h') {
        (rest, 60 * 60 * 1000)
    } else if let Some(rest) = v.strip_suffix('d') {
        (rest, 24 * 60 * 60 * 1000)
    } else {
        (v.as_str(), 1000)
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

/// Process-wide configuration store.
#[derive(Debug)]
pub struct Config {
    path: Option<PathBuf>,
    snapshot: RwLock<Arc<Snapshot>>,
    overrides: Mutex<HashMap<String, String>>,
}

impl Config {
    /// A store with no backing file; only overrides and defaults apply.
    pub fn empty() -> Self {
        Self {
            path: None,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Opens and parses a config file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self {
            path: Some(path.as_ref().to_path_buf()),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            overrides: Mutex::new(HashMap::new()),
        };
        config.reload()?;
        Ok(config)
    }

    /// Re-parses the backing file and publishes a new snapshot. Overrides
    /// are re-applied on top, so they take precedence and survive reloads.
    pub fn reload(&self) -> Result<()> {
        let mut values = match &self.path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("failed to read config file '{}'", path.display()))?;
                parse_config(&text)
            }
            None => HashMap::new(),
        };

        {
            let overrides = self.overrides.lock();
            for (key, value) in overrides.iter() {
                values.insert(key.clone(), value.clone());
            }
        }

        let count = values.len();
        *self.snapshot.write() = Arc::new(Snapshot { values });
        info!(properties = count, "configuration loaded");
        Ok(())
    }

    /// Records a command-line override and applies it to the live snapshot.
    pub fn set_override(&self, key: &str, value: &str) {
        self.overrides
            .lock()
            .insert(key.to_string(), value.to_string());

        let mut values = self.snapshot.read().values.clone();
        values.insert(key.to_string(), value.to_string());
        *self.snapshot.write() = Arc::new(Snapshot { values });
    }

    /// Current snapshot; cheap to clone and safe to hold across reloads.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }
}

fn parse_config(text: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!(line, "ignoring config line without '='");
            continue;
        };
        values.insert(key.trim().to_string(), value.trim().to_string());
    }
    values
}

/// Periodic reload task; runs on its own thread and honors the
/// `config.reload.*` keys at the time it is spawned.
pub struct ConfigReloader {
    stop: Arc<ReloadSignal>,
    handle: Option<std::thread::JoinHandle<()>>,
}

struct ReloadSignal {
    stopped: Mutex<bool>,
    condvar: parking_lot::Condvar,
}

impl ConfigReloader {
    /// Spawns the reload thread if `config.reload.enabled` is set; returns
    /// `None` otherwise.
    pub fn spawn(config: Arc<Config>) -> Option<Self> {
        let snapshot = config.snapshot();
        if !snapshot.get_bool(CFG_CONFIG_RELOAD_ENABLED, CFG_CONFIG_RELOAD_ENABLED_DEF) {
            return None;
        }
        let freq_secs = snapshot
            .get_time_secs(CFG_CONFIG_RELOAD_FREQUENCY, CFG_CONFIG_RELOAD_FREQUENCY_DEF)
            .max(1);

        let stop = Arc::new(ReloadSignal {
            stopped: Mutex::new(false),
            condvar: parking_lot::Condvar::new(),
        });
        let signal = stop.clone();
        let handle = std::thread::Builder::new()
            .name("config-reload".to_string())
            .spawn(move || {
                let period = std::time::Duration::from_secs(freq_secs);
                loop {
                    let mut stopped = signal.stopped.lock();
                    if !*stopped {
                        signal.condvar.wait_for(&mut stopped, period);
                    }
                    if *stopped {
                        break;
                    }
                    drop(stopped);
                    if let Err(err) = config.reload() {
                        warn!(error = %err, "config reload failed; keeping previous snapshot");
                    }
                }
            })
            .expect("failed to spawn config reload thread");

        Some(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the reload thread and joins it.
    pub fn stop(&mut self) {
        Stoppable::shutdown(self, ShutdownRequest::Asap);
        self.wait(std::time::Duration::from_secs(1));
    }
}

impl Stoppable for ConfigReloader {
    fn shutdown(&self, _request: ShutdownRequest) {
        *self.stop.stopped.lock() = true;
        self.stop.condvar.notify_all();
    }

    fn wait(&mut self, _timeout: std::time::Duration) -> bool {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        true
    }
}

impl Drop for ConfigReloader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulsedb.conf");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn parses_key_value_lines_and_comments() {
        let (_dir, path) = write_config(
            "; comment\n\
             # another comment\n\
             tsdb.page.count = 1024\n\
             tsdb.data.dir = /var/lib/pulsedb\n\
             \n\
             garbage line without equals\n",
        );

        let config = Config::open(&path).unwrap();
        let snap = config.snapshot();
        assert_eq!(snap.get_int(CFG_TSDB_PAGE_COUNT, 0), 1024);
        assert_eq!(snap.get_str(CFG_TSDB_DATA_DIR, ""), "/var/lib/pulsedb");
        assert!(!snap.exists("garbage line without equals"));
    }

    #[test]
    fn typed_getters() {
        let (_dir, path) = write_config(
            "tsdb.timestamp.resolution.ms = true\n\
             tsdb.page.size = 4kb\n\
             tsdb.rollup.interval = 5m\n\
             http.listener.count = 2,4\n\
             tcp.listener.count = 3\n",
        );

        let snap = Config::open(&path).unwrap().snapshot();
        assert!(snap.get_bool(CFG_TSDB_TIMESTAMP_RESOLUTION_MS, false));
        assert_eq!(snap.get_bytes(CFG_TSDB_PAGE_SIZE, 0), 4096);
        assert_eq!(snap.get_time_secs(CFG_TSDB_ROLLUP_INTERVAL, 0), 300);
        assert_eq!(snap.get_int_pair(CFG_HTTP_LISTENER_COUNT, 1), (2, 4));
        assert_eq!(snap.get_int_pair(CFG_TCP_LISTENER_COUNT, 1), (3, 3));
    }

    #[test]
    fn overrides_survive_reload() {
        let (_dir, path) = write_config("tsdb.page.count = 1024\n");

        let config = Config::open(&path).unwrap();
        config.set_override(CFG_TSDB_PAGE_COUNT, "64");
        assert_eq!(config.snapshot().get_int(CFG_TSDB_PAGE_COUNT, 0), 64);

        config.reload().unwrap();
        assert_eq!(config.snapshot().get_int(CFG_TSDB_PAGE_COUNT, 0), 64);
    }

    #[test]
    fn snapshot_is_stable_across_reload() {
        let (_dir, path) = write_config("tsdb.page.count = 1024\n");
        let config = Config::open(&path).unwrap();

        let before = config.snapshot();
        config.set_override(CFG_TSDB_PAGE_COUNT, "64");
        // the old snapshot still sees the old value
        assert_eq!(before.get_int(CFG_TSDB_PAGE_COUNT, 0), 1024);
    }

    #[test]
    fn cluster_mode_detected_by_presence() {
        let (_dir, path) = write_config("cluster.servers = 10.0.0.1:6182,10.0.0.2:6182\n");
        let snap = Config::open(&path).unwrap().snapshot();
        assert!(snap.exists(CFG_CLUSTER_SERVERS));
    }
}

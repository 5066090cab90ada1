//! # Recognized Configuration Keys
//!
//! All keys the engine and its (external) network layer read, with their
//! defaults. Co-locating keys and defaults keeps call sites honest: a getter
//! always names its default from here, so a key can never default to two
//! different values in two places.

pub const CFG_TSDB_PAGE_COUNT: &str = "tsdb.page.count";
pub const CFG_TSDB_PAGE_COUNT_DEF: u32 = 32_768;

pub const CFG_TSDB_PAGE_SIZE: &str = "tsdb.page.size";
pub const CFG_TSDB_PAGE_SIZE_DEF: u64 = 4096;

pub const CFG_TSDB_COMPRESSOR_VERSION: &str = "tsdb.compressor.version";
pub const CFG_TSDB_COMPRESSOR_VERSION_DEF: i64 = 1;

pub const CFG_TSDB_TIMESTAMP_RESOLUTION_MS: &str = "tsdb.timestamp.resolution.ms";
pub const CFG_TSDB_TIMESTAMP_RESOLUTION_MS_DEF: bool = false;

pub const CFG_TSDB_DATA_DIR: &str = "tsdb.data.dir";
pub const CFG_TSDB_DATA_DIR_DEF: &str = "/tmp/pulsedb";

pub const CFG_TSDB_ROLLUP_INTERVAL: &str = "tsdb.rollup.interval";
pub const CFG_TSDB_ROLLUP_INTERVAL_DEF: u64 = 600; // seconds

pub const CFG_TSDB_SELF_METER_ENABLED: &str = "tsdb.self.meter.enabled";
pub const CFG_TSDB_SELF_METER_ENABLED_DEF: bool = false;

pub const CFG_HTTP_LISTENER_COUNT: &str = "http.listener.count";
pub const CFG_HTTP_LISTENER_COUNT_DEF: u32 = 2;

pub const CFG_HTTP_RESPONDERS_PER_LISTENER: &str = "http.responders.per.listener";
pub const CFG_HTTP_RESPONDERS_PER_LISTENER_DEF: u32 = 2;

pub const CFG_TCP_LISTENER_COUNT: &str = "tcp.listener.count";
pub const CFG_TCP_LISTENER_COUNT_DEF: u32 = 2;

pub const CFG_TCP_RESPONDERS_PER_LISTENER: &str = "tcp.responders.per.listener";
pub const CFG_TCP_RESPONDERS_PER_LISTENER_DEF: u32 = 2;

pub const CFG_CLUSTER_SERVERS: &str = "cluster.servers";

pub const CFG_CONFIG_RELOAD_ENABLED: &str = "config.reload.enabled";
pub const CFG_CONFIG_RELOAD_ENABLED_DEF: bool = false;

pub const CFG_CONFIG_RELOAD_FREQUENCY: &str = "config.reload.frequency";
pub const CFG_CONFIG_RELOAD_FREQUENCY_DEF: u64 = 300; // seconds

//! # Memory-Mapped Data Files
//!
//! `MmapFile` is the low-level building block under the page manager: one
//! file, one read-write shared mapping. The OS page cache does the heavy
//! lifting; the engine only steers it with `madvise` hints.
//!
//! ## Open Protocol
//!
//! Opening creates the file if absent. A zero-length file is *new*: it is
//! truncated up to the caller's default length and the caller initializes
//! the header region. A non-zero file keeps its current length — the page
//! manager re-derives the real length from the header (`actual_pg_cnt`)
//! and resizes afterwards if they disagree.
//!
//! Data files are touched at page granularity in no predictable order, so
//! every mapping is opened with `MADV_RANDOM` to suppress read-ahead.
//! After a page is flushed the engine issues `MADV_DONTNEED` on it to keep
//! the resident set bounded by the live write set, not the file size.
//!
//! ## Safety Model
//!
//! Remapping invalidates the old mapping, so `resize` takes `&mut self`:
//! the borrow checker guarantees no window references survive a resize,
//! with zero runtime cost. Window accessors bounds-check every request.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use tracing::{debug, warn};

/// One mapped data file.
#[derive(Debug)]
pub struct MmapFile {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    len: u64,
}

impl MmapFile {
    /// Opens (creating if absent) and maps the file. Returns the mapping
    /// and whether the file was new. A new file is sized to `default_len`;
    /// an existing file keeps its on-disk length.
    pub fn open(path: &Path, default_len: u64) -> Result<(Self, bool)> {
        ensure!(default_len > 0, "mapped file length must be non-zero");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat data file '{}'", path.display()))?;
        let is_new = metadata.len() == 0;
        let len = if is_new { default_len } else { metadata.len() };

        file.set_len(len)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), len))?;

        // SAFETY: the mapping is private to this process in practice (data
        // files are owned by one engine), its lifetime is tied to MmapFile,
        // and all access goes through bounds-checked window accessors.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let this = Self {
            path: path.to_path_buf(),
            file,
            mmap,
            len,
        };
        this.advise(libc::MADV_RANDOM, 0, this.len as usize);
        debug!(path = %this.path.display(), len, is_new, "mapped data file");
        Ok((this, is_new))
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncates (or extends) the file and remaps it. Requires `&mut self`
    /// so the borrow checker proves no window references outlive the old
    /// mapping.
    pub fn resize(&mut self, new_len: u64) -> Result<()> {
        if new_len == self.len {
            return Ok(());
        }
        ensure!(new_len > 0, "cannot resize '{}' to zero", self.path.display());

        self.mmap
            .flush()
            .wrap_err("failed to flush mapping before resize")?;

        self.file.set_len(new_len).wrap_err_with(|| {
            format!(
                "failed to resize '{}' to {} bytes",
                self.path.display(),
                new_len
            )
        })?;

        // SAFETY: same invariants as in open(); the old mapping is dropped
        // on assignment and nothing can reference it past &mut self.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file)
                .wrap_err_with(|| format!("failed to remap '{}' after resize", self.path.display()))?
        };
        self.len = new_len;
        self.advise(libc::MADV_RANDOM, 0, new_len as usize);
        Ok(())
    }

    /// Flushes `[0, len)` to disk; synchronous when `sync` is set.
    pub fn flush_prefix(&self, len: u64, sync: bool) -> Result<()> {
        let len = len.min(self.len) as usize;
        if len == 0 {
            return Ok(());
        }
        if sync {
            self.mmap
                .flush_range(0, len)
                .wrap_err_with(|| format!("failed to msync '{}'", self.path.display()))
        } else {
            self.mmap
                .flush_async_range(0, len)
                .wrap_err_with(|| format!("failed to async msync '{}'", self.path.display()))
        }
    }

    /// Tells the OS the given byte range will not be needed; the kernel may
    /// drop the pages from the resident set. Purely advisory.
    pub fn advise_dont_need(&self, offset: usize, len: usize) {
        self.advise(libc::MADV_DONTNEED, offset, len);
    }

    fn advise(&self, advice: libc::c_int, offset: usize, len: usize) {
        if offset >= self.len as usize || len == 0 {
            return;
        }
        let len = len.min(self.len as usize - offset);

        // madvise wants a page-aligned address; round the window outward.
        let page = page_size();
        let aligned_offset = offset - (offset % page);
        let aligned_len = len + (offset - aligned_offset);

        // SAFETY: the range is clamped to the mapping and the advice calls
        // are hints; they do not change the mapping's validity.
        let rc = unsafe {
            libc::madvise(
                self.mmap.as_ptr().add(aligned_offset) as *mut libc::c_void,
                aligned_len,
                advice,
            )
        };
        if rc != 0 {
            warn!(
                path = %self.path.display(),
                advice,
                errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
                "madvise failed"
            );
        }
    }

    /// Immutable byte window; bounds-checked.
    pub fn window(&self, offset: usize, len: usize) -> Result<&[u8]> {
        ensure!(
            offset + len <= self.len as usize,
            "window {}+{} out of bounds for '{}' ({} bytes)",
            offset,
            len,
            self.path.display(),
            self.len
        );
        Ok(&self.mmap[offset..offset + len])
    }

    /// Mutable byte window; bounds-checked.
    pub fn window_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        ensure!(
            offset + len <= self.len as usize,
            "window {}+{} out of bounds for '{}' ({} bytes)",
            offset,
            len,
            self.path.display(),
            self.len
        );
        Ok(&mut self.mmap[offset..offset + len])
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn new_file_is_sized_to_default_len() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.0");

        let (file, is_new) = MmapFile::open(&path, 8192).unwrap();
        assert!(is_new);
        assert_eq!(file.len(), 8192);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);
    }

    #[test]
    fn existing_file_keeps_its_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.0");

        {
            let (mut file, _) = MmapFile::open(&path, 8192).unwrap();
            file.window_mut(0, 4).unwrap().copy_from_slice(b"puls");
            file.flush_prefix(8192, true).unwrap();
        }

        let (file, is_new) = MmapFile::open(&path, 4096).unwrap();
        assert!(!is_new);
        assert_eq!(file.len(), 8192);
        assert_eq!(file.window(0, 4).unwrap(), b"puls");
    }

    #[test]
    fn resize_shrinks_and_remaps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.0");

        let (mut file, _) = MmapFile::open(&path, 16384).unwrap();
        file.window_mut(0, 4).unwrap().copy_from_slice(b"keep");
        file.resize(4096).unwrap();

        assert_eq!(file.len(), 4096);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
        assert_eq!(file.window(0, 4).unwrap(), b"keep");
        assert!(file.window(4096, 1).is_err());
    }

    #[test]
    fn window_is_bounds_checked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.0");

        let (file, _) = MmapFile::open(&path, 4096).unwrap();
        assert!(file.window(0, 4096).is_ok());
        assert!(file.window(1, 4096).is_err());
    }
}

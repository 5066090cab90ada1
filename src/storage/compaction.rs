//! # Compaction Driver
//!
//! Offline reorganization of one data file. Ingest leaves every logical
//! page owning a whole physical page, mostly half-empty; compaction rebuilds
//! the file with pages packed back to back, shrinks it to fit, and installs
//! the result atomically.
//!
//! ## Procedure
//!
//! 1. Open a sibling file with a temporary suffix.
//! 2. Walk the source headers in order; skip empty pages; rehydrate each
//!    page's datapoints and re-compress them into pages allocated with
//!    [`PageManager::get_free_page_for_compaction`], which packs a new
//!    logical page into the previous page's trailing space whenever at
//!    least one datapoint fits there.
//! 3. Shrink every destination page to its used bytes, shrink the file to
//!    its last used physical page, and flush synchronously.
//! 4. Rename the temp file over the original and reopen it.
//!
//! A source page whose datapoints outgrow a packed window spills onto the
//! next allocation, so one source page can map to several destination
//! pages. The returned remap table records every `(source, destination)`
//! header pair for the engine to patch its in-memory series index.
//!
//! Out-of-order pages rehydrate sorted (the version-0 codec emits in
//! timestamp order), so their points re-compress cleanly with the file's
//! default codec.

use eyre::{ensure, Result, WrapErr};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::memory::MemoryPool;
use crate::storage::page::PageInfo;
use crate::storage::page_manager::{PageManager, PageManagerOptions};
use crate::types::HeaderIndex;

/// Compacts `pm`'s file through a temp sibling and an atomic rename.
/// Returns the reopened (compacted) manager and the header remap table.
pub fn compact(
    pm: PageManager,
    pool: &MemoryPool,
) -> Result<(PageManager, Vec<(HeaderIndex, HeaderIndex)>)> {
    if pm.is_compacted() {
        return Ok((pm, Vec::new()));
    }

    let path = pm.path().to_path_buf();
    let mut tmp_path = path.clone();
    tmp_path.as_mut_os_string().push(".tmp");
    if tmp_path.exists() {
        // leftover from an interrupted run; the rename never happened
        std::fs::remove_file(&tmp_path)
            .wrap_err_with(|| format!("failed to remove stale '{}'", tmp_path.display()))?;
    }

    let options = PageManagerOptions {
        page_count: pm.page_count(),
        page_size: pm.page_size(),
        compressor_version: pm.compressor_version(),
        millisecond: pm.is_millisecond(),
    };
    let mut dst = PageManager::open(&tmp_path, *pm.time_range(), pm.id(), &options)?;

    let mut remap = Vec::new();
    let mut dst_page: Option<Box<PageInfo>> = None;
    let mut dps = Vec::new();

    for src_index in 0..pm.header_index() {
        let Some(mut src) = pm.get_the_page_on_disk(pool, src_index)? else {
            break;
        };
        if src.is_empty() {
            pool.release_page_info(src);
            continue;
        }

        dps.clear();
        src.ensure_dp_available(&pm, pool, Some(&mut dps))?;
        src.recycle(pool);
        pool.release_page_info(src);

        for dp in &dps {
            loop {
                let page = match dst_page.as_mut() {
                    Some(page) => page,
                    None => dst_page.insert(dst.get_free_page_for_compaction(pool)?),
                };
                match page.add_data_point(&mut dst, dp.tstamp, dp.value) {
                    Ok(true) => break,
                    // window exhausted, or a source-page boundary stepped
                    // backwards in time: seal and spill onto a fresh page
                    Ok(false) => {}
                    Err(err) if StorageError::is(&err, StorageError::OutOfOrder) => {}
                    Err(err) => return Err(err),
                }
                seal(&mut dst, pool, dst_page.take().expect("page present"))?;
            }
            let page = dst_page.as_ref().expect("page present");
            if remap.last() != Some(&(src_index, page.header_index())) {
                remap.push((src_index, page.header_index()));
            }
        }

        // one destination logical page per source page; the next source
        // packs behind it (or spills to a fresh physical page)
        if let Some(page) = dst_page.take() {
            seal(&mut dst, pool, page)?;
        }

        debug!(
            src_index,
            points = dps.len(),
            "re-compressed source page"
        );
    }

    dst.shrink_to_fit()?;
    dst.flush(true)?;

    let (from_pages, to_pages) = (pm.page_index(), dst.page_index());
    let (id, range) = (pm.id(), *pm.time_range());
    drop(dst);
    drop(pm);

    std::fs::rename(&tmp_path, &path).wrap_err_with(|| {
        format!(
            "failed to rename '{}' over '{}'",
            tmp_path.display(),
            path.display()
        )
    })?;

    let compacted = PageManager::open(&path, range, id, &options)
        .wrap_err("failed to reopen compacted file")?;
    ensure!(compacted.is_compacted(), "compacted flag did not persist");

    info!(
        path = %path.display(),
        from_pages,
        to_pages,
        "compaction complete"
    );
    Ok((compacted, remap))
}

fn seal(dst: &mut PageManager, pool: &MemoryPool, mut page: Box<PageInfo>) -> Result<()> {
    page.shrink_to_fit(dst, pool)?;
    page.recycle(pool);
    pool.release_page_info(page);
    Ok(())
}

//! Writing dirty pages back: flush-list batches in oldest-modification
//! order, LRU tail batches that replenish the free list, and single-page
//! flushes for a thread that cannot find a replaceable frame.

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::{BufferPool, IoFix, PageLatch};
use crate::types::page;
use crate::types::{Lsn, PageId, RedoError, Result};

/// The two kinds of flush batch; at most one of each runs at a time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum FlushType {
    /// Oldest-modification order, advances the checkpoint.
    List,
    /// Cold end of the LRU list, frees frames.
    Lru,
}

impl FlushType {
    fn slot(self) -> usize {
        match self {
            FlushType::List => 0,
            FlushType::Lru => 1,
        }
    }
}

/// Result of a flush-list batch.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct FlushBatchOutcome {
    /// False when another batch of the same type was already running and
    /// this call did nothing; the caller may wait and retry.
    pub started: bool,
    /// Pages written.
    pub flushed: usize,
    /// Pages whose write failed and were moved off the flush list.
    pub failed: Vec<PageId>,
}

struct Candidate {
    idx: usize,
    id: PageId,
    oldest: Lsn,
    latch: parking_lot::lock_api::ArcRwLockReadGuard<parking_lot::RawRwLock, Box<[u8]>>,
}

impl BufferPool {
    fn start_batch(&self, ty: FlushType) -> bool {
        let mut inner = self.inner.lock();
        if inner.batch_running[ty.slot()] {
            return false;
        }
        inner.batch_running[ty.slot()] = true;
        match ty {
            FlushType::List => inner.stats.list_batches += 1,
            FlushType::Lru => inner.stats.lru_batches += 1,
        }
        true
    }

    fn end_batch(&self, ty: FlushType) {
        self.inner.lock().batch_running[ty.slot()] = false;
        self.batch_end[ty.slot()].set();
    }

    /// Blocks until no batch of type `ty` is running.
    pub fn wait_batch_end(&self, ty: FlushType) {
        loop {
            let count = {
                let inner = self.inner.lock();
                if !inner.batch_running[ty.slot()] {
                    return;
                }
                self.batch_end[ty.slot()].reset()
            };
            self.batch_end[ty.slot()].wait_low(count);
        }
    }

    /// Claims the first flushable page on the flush list older than
    /// `lsn_limit`, skipping pages whose latch is busy.
    fn next_list_candidate(&self, lsn_limit: Lsn, skip: &[PageId]) -> Option<Candidate> {
        let mut inner = self.inner.lock();
        let mut found = None;
        for &(oldest, id) in inner.flush_list.iter() {
            if oldest >= lsn_limit {
                break;
            }
            if skip.contains(&id) {
                continue;
            }
            let Some(&idx) = inner.page_table.get(&id) else {
                continue;
            };
            let frame = &inner.frames[idx];
            if frame.io_fix != IoFix::None {
                continue;
            }
            if let Some(latch) = frame.buf.try_read_arc() {
                found = Some(Candidate {
                    idx,
                    id,
                    oldest,
                    latch,
                });
                break;
            }
        }
        if let Some(c) = &found {
            inner.frames[c.idx].io_fix = IoFix::Write;
        }
        found
    }

    /// Writes one claimed page and updates the lists. Returns the write
    /// error, if any, after moving the page to the failed set.
    ///
    /// The read latch is held until the frame is marked clean, so a change
    /// made after the write always finds the page clean and re-lists it.
    fn write_candidate(&self, c: Candidate) -> std::result::Result<(), RedoError> {
        let result = self.write_page_image(c.id, &c.latch);
        // latch before pool mutex, as everywhere else
        let _latch = c.latch;
        let mut inner = self.inner.lock();
        let frame = &mut inner.frames[c.idx];
        frame.io_fix = IoFix::None;
        match result {
            Ok(()) => {
                frame.oldest_modification = Lsn::ZERO;
                frame.flush_error = None;
                inner.flush_list.remove(&(c.oldest, c.id));
                inner.flush_failed.remove(&c.id);
                inner.stats.pages_flushed += 1;
                drop(inner);
                self.free_event.set();
                trace!(page = %c.id, "buf.flush.page_written");
                Ok(())
            }
            Err(err) => {
                frame.flush_error = Some(err.to_string());
                inner.flush_list.remove(&(c.oldest, c.id));
                inner.flush_failed.insert(c.id);
                inner.stats.flush_failures += 1;
                drop(inner);
                warn!(page = %c.id, error = %err, "buf.flush.page_failed");
                Err(err)
            }
        }
    }

    /// Write-ahead rule, checksum stamp, doublewrite staging, in-place write.
    fn write_page_image(&self, id: PageId, src: &[u8]) -> Result<()> {
        let page_lsn = page::page_lsn(src);
        if let Some(log) = self.redo_log() {
            log.flush_up_to(page_lsn)?;
        }
        let mut image = src.to_vec();
        page::stamp_checksum(&mut image);
        if let Some(dw) = self.doublewrite() {
            dw.add(&image)?;
            dw.sync()?;
        }
        self.storage().write_page(id, &image)
    }

    /// Flushes dirty pages in ascending oldest-modification order until
    /// `min_n` pages are written or no remaining page is older than
    /// `lsn_limit`.
    pub fn flush_list(&self, min_n: usize, lsn_limit: Lsn) -> Result<FlushBatchOutcome> {
        if self.is_read_only() {
            return Err(RedoError::Invalid("flush on a read-only buffer pool"));
        }
        if !self.start_batch(FlushType::List) {
            return Ok(FlushBatchOutcome::default());
        }
        let mut outcome = FlushBatchOutcome {
            started: true,
            ..FlushBatchOutcome::default()
        };
        while outcome.flushed < min_n {
            let Some(c) = self.next_list_candidate(lsn_limit, &outcome.failed) else {
                break;
            };
            let id = c.id;
            match self.write_candidate(c) {
                Ok(()) => outcome.flushed += 1,
                Err(_) => outcome.failed.push(id),
            }
        }
        self.end_batch(FlushType::List);
        debug!(
            flushed = outcome.flushed,
            failed = outcome.failed.len(),
            lsn_limit = lsn_limit.0,
            "buf.flush.list_batch"
        );
        Ok(outcome)
    }

    /// Frees up to `max_n` frames from the cold end of the LRU list,
    /// writing dirty pages first. Returns the number of frames freed, or 0
    /// when an LRU batch is already running.
    pub fn lru_tail_flush(&self, max_n: usize) -> Result<usize> {
        if !self.start_batch(FlushType::Lru) {
            return Ok(0);
        }
        let depth = self.options().lru_scan_depth;
        let mut freed = 0usize;
        let dirty: Vec<(usize, PageId)> = {
            let mut inner = self.inner.lock();
            let tail: Vec<usize> = inner.lru.values().take(depth).copied().collect();
            let mut dirty = Vec::new();
            for idx in tail {
                if freed >= max_n {
                    break;
                }
                let frame = &inner.frames[idx];
                let Some(id) = frame.id else { continue };
                if frame.is_replaceable() {
                    if frame.buf.try_write_arc().is_some() {
                        inner.release_frame(idx);
                        inner.stats.evictions += 1;
                        freed += 1;
                    }
                } else if frame.is_flushable() && !self.is_read_only() {
                    dirty.push((idx, id));
                }
            }
            dirty
        };
        for (idx, id) in dirty {
            if freed >= max_n {
                break;
            }
            if self.flush_and_evict(idx, id)? {
                freed += 1;
            }
        }
        self.end_batch(FlushType::Lru);
        if freed > 0 {
            self.free_event.set();
            trace!(freed, "buf.flush.lru_batch");
        }
        Ok(freed)
    }

    /// Writes the coldest flushable page and frees its frame.
    pub(crate) fn flush_single_page(&self) -> Result<bool> {
        if self.is_read_only() {
            return Ok(false);
        }
        let victim = {
            let inner = self.inner.lock();
            inner
                .lru
                .values()
                .copied()
                .find(|&idx| inner.frames[idx].is_flushable())
                .and_then(|idx| inner.frames[idx].id.map(|id| (idx, id)))
        };
        let Some((idx, id)) = victim else {
            return Ok(false);
        };
        let freed = self.flush_and_evict(idx, id)?;
        if freed {
            self.inner.lock().stats.single_page_flushes += 1;
            self.free_event.set();
        }
        Ok(freed)
    }

    /// Flushes frame `idx` if it still holds dirty page `id`, then evicts it
    /// if it is still replaceable. A failed write is recorded on the page
    /// and reported as "not freed".
    fn flush_and_evict(&self, idx: usize, id: PageId) -> Result<bool> {
        let candidate = {
            let mut inner = self.inner.lock();
            let frame = &inner.frames[idx];
            if frame.id != Some(id) || !frame.is_flushable() {
                None
            } else if let Some(latch) = frame.buf.try_read_arc() {
                let oldest = frame.oldest_modification;
                inner.frames[idx].io_fix = IoFix::Write;
                Some(Candidate {
                    idx,
                    id,
                    oldest,
                    latch,
                })
            } else {
                None
            }
        };
        let Some(c) = candidate else {
            return Ok(false);
        };
        if self.write_candidate(c).is_err() {
            return Ok(false);
        }
        let mut inner = self.inner.lock();
        let frame = &inner.frames[idx];
        if frame.id == Some(id) && frame.is_replaceable() && frame.buf.try_write_arc().is_some() {
            inner.release_frame(idx);
            inner.stats.evictions += 1;
            return Ok(true);
        }
        Ok(false)
    }

    /// Flushes until no page on the flush list is older than `lsn`.
    ///
    /// Pages latched by other threads are waited out; a page whose write
    /// fails ends the call with [`RedoError::FlushFailed`].
    pub fn flush_until(&self, lsn: Lsn) -> Result<()> {
        loop {
            let oldest = self.inner.lock().flush_list.first().map(|(l, _)| *l);
            match oldest {
                Some(oldest) if oldest < lsn => {}
                _ => return Ok(()),
            }
            let outcome = self.flush_list(usize::MAX, lsn)?;
            if !outcome.started {
                self.wait_batch_end(FlushType::List);
                continue;
            }
            if let Some(&page) = outcome.failed.first() {
                let reason = self
                    .failed_flushes()
                    .into_iter()
                    .find(|(id, _)| *id == page)
                    .map(|(_, reason)| reason)
                    .unwrap_or_default();
                return Err(RedoError::FlushFailed { page, reason });
            }
            if outcome.flushed == 0 {
                std::thread::yield_now();
            }
        }
    }

    /// Writes every dirty page and waits for running batches to finish.
    pub fn flush_all(&self) -> Result<()> {
        self.flush_until(Lsn::MAX)?;
        self.wait_batch_end(FlushType::List);
        self.wait_batch_end(FlushType::Lru);
        Ok(())
    }
}

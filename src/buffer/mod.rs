#![forbid(unsafe_code)]
//! Buffer pool shared by recovery and the running engine.
//!
//! Each frame sits in exactly one of the free list or the LRU list; dirty
//! frames are additionally ordered on the flush list by their oldest
//! modification. The pool mutex only guards list membership and frame
//! metadata. Page contents are protected by per-frame latches, and a latch
//! is only ever *tried* while the pool mutex is held, so a thread holding a
//! page latch may block on the pool mutex but never the reverse.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::checkpoint::{DirtyPages, LogCapacity};
use crate::primitives::concurrency::Event;
use crate::storage::{DoublewriteBuffer, PageStorage};
use crate::types::page::{self, PageCheck};
use crate::types::{Lsn, PageId, RedoError, Result};

/// Background page cleaner thread.
pub mod cleaner;
/// Flush-list and LRU batches.
pub mod flush;
mod frame;

pub use cleaner::{FlushOptions, PageCleaner};
pub use flush::{FlushBatchOutcome, FlushType};
pub use frame::IoFix;

use frame::Frame;

/// What the pool needs from the redo log: the write-ahead rule and the
/// inputs of adaptive flushing.
pub trait RedoLogHandle: Send + Sync {
    /// LSN the next append will receive.
    fn current_lsn(&self) -> Lsn;
    /// Makes the log durable at least up to `lsn`.
    fn flush_up_to(&self, lsn: Lsn) -> Result<()>;
    /// Capacity thresholds of the log.
    fn capacity(&self) -> LogCapacity;
}

/// Buffer pool sizing and wait behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolOptions {
    /// Number of page frames.
    pub pool_pages: usize,
    /// How far from the cold end of the LRU list eviction and LRU flushing
    /// look for candidates.
    pub lru_scan_depth: usize,
    /// Rounds of freeing frames before a fetch gives up with
    /// [`RedoError::NoFreeFrames`].
    pub free_wait_attempts: u32,
    /// Upper bound of one wait for a frame to become free, in milliseconds.
    pub free_wait_timeout_ms: u64,
}

impl Default for BufferPoolOptions {
    fn default() -> Self {
        Self {
            pool_pages: 1024,
            lru_scan_depth: 1024,
            free_wait_attempts: 100,
            free_wait_timeout_ms: 10,
        }
    }
}

/// Counters describing pool activity.
#[derive(Default, Clone, Debug, Serialize)]
pub struct BufferPoolStats {
    /// Fetches served from a resident frame.
    pub hits: u64,
    /// Pages read from storage.
    pub reads: u64,
    /// Pages handed out zero-filled without a read.
    pub creates: u64,
    /// Clean frames reclaimed from the LRU list.
    pub evictions: u64,
    /// Pages written back.
    pub pages_flushed: u64,
    /// Page writes that failed.
    pub flush_failures: u64,
    /// Flush-list batches run.
    pub list_batches: u64,
    /// LRU batches run.
    pub lru_batches: u64,
    /// Dirty pages written to free a single frame.
    pub single_page_flushes: u64,
    /// Times a thread had to wait for a free frame.
    pub free_waits: u64,
}

pub(crate) struct PoolInner {
    pub frames: Vec<Frame>,
    pub page_table: HashMap<PageId, usize>,
    pub free: Vec<usize>,
    /// Recency stamp to frame; the first entry is the cold end.
    pub lru: BTreeMap<u64, usize>,
    pub next_stamp: u64,
    pub flush_list: BTreeSet<(Lsn, PageId)>,
    /// Dirty pages whose last write failed; kept off the flush list.
    pub flush_failed: BTreeSet<PageId>,
    pub batch_running: [bool; 2],
    pub stats: BufferPoolStats,
}

impl PoolInner {
    fn touch(&mut self, idx: usize) {
        if let Some(old) = self.frames[idx].lru_stamp.take() {
            self.lru.remove(&old);
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.lru.insert(stamp, idx);
        self.frames[idx].lru_stamp = Some(stamp);
    }

    /// Detaches a frame from the page table and LRU list and returns it to
    /// the free list.
    pub(crate) fn release_frame(&mut self, idx: usize) {
        let frame = &mut self.frames[idx];
        if let Some(id) = frame.id {
            if self.page_table.get(&id) == Some(&idx) {
                self.page_table.remove(&id);
            }
        }
        if let Some(stamp) = frame.lru_stamp {
            self.lru.remove(&stamp);
        }
        frame.reset();
        self.free.push(idx);
    }

    /// Takes a free frame or evicts a clean one from the cold end of the
    /// LRU list, returning it exclusively latched.
    fn acquire_frame(&mut self, scan_depth: usize) -> Option<(usize, PageLatch)> {
        while let Some(idx) = self.free.pop() {
            if let Some(latch) = self.frames[idx].buf.try_write_arc() {
                return Some((idx, latch));
            }
            warn!(frame = idx, "buf.free_list.latched_frame");
        }
        let victim = self
            .lru
            .values()
            .take(scan_depth)
            .copied()
            .find_map(|idx| {
                let frame = &self.frames[idx];
                if !frame.is_replaceable() {
                    return None;
                }
                frame.buf.try_write_arc().map(|latch| (idx, latch))
            });
        let (idx, latch) = victim?;
        trace!(frame = idx, page = ?self.frames[idx].id, "buf.lru.evict");
        self.release_frame(idx);
        self.free.pop();
        self.stats.evictions += 1;
        Some((idx, latch))
    }

    pub(crate) fn oldest_modification(&self) -> Option<Lsn> {
        let listed = self.flush_list.first().map(|(lsn, _)| *lsn);
        let failed = self
            .flush_failed
            .iter()
            .filter_map(|id| self.page_table.get(id))
            .map(|&idx| self.frames[idx].oldest_modification)
            .min();
        match (listed, failed) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn replaceable_near_tail(&self, scan_depth: usize) -> usize {
        self.lru
            .values()
            .take(scan_depth)
            .filter(|&&idx| self.frames[idx].is_replaceable())
            .count()
    }
}

pub(crate) type PageLatch = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// Fixed-size page cache with write-back flushing.
pub struct BufferPool {
    storage: Arc<dyn PageStorage>,
    doublewrite: Option<Arc<dyn DoublewriteBuffer>>,
    log: RwLock<Option<Arc<dyn RedoLogHandle>>>,
    options: BufferPoolOptions,
    page_size: usize,
    pub(crate) inner: Mutex<PoolInner>,
    pub(crate) free_event: Event,
    pub(crate) batch_end: [Event; 2],
    pub(crate) cleaner_wakeup: Event,
    flush_ahead_lsn: AtomicU64,
    flush_ahead_furious: AtomicBool,
    read_only: AtomicBool,
}

impl BufferPool {
    /// Creates a pool of `options.pool_pages` frames over `storage`.
    ///
    /// With a doublewrite buffer every page image is staged there before
    /// its in-place write.
    pub fn new(
        storage: Arc<dyn PageStorage>,
        doublewrite: Option<Arc<dyn DoublewriteBuffer>>,
        options: BufferPoolOptions,
    ) -> Result<Self> {
        if options.pool_pages == 0 {
            return Err(RedoError::Invalid("buffer pool needs at least one frame"));
        }
        let page_size = storage.page_size();
        page::check_page_size(page_size)?;
        let frames = (0..options.pool_pages)
            .map(|_| Frame::new(page_size))
            .collect();
        let free = (0..options.pool_pages).rev().collect();
        debug!(frames = options.pool_pages, page_size, "buf.pool.created");
        Ok(Self {
            storage,
            doublewrite,
            log: RwLock::new(None),
            options,
            page_size,
            inner: Mutex::new(PoolInner {
                frames,
                page_table: HashMap::new(),
                free,
                lru: BTreeMap::new(),
                next_stamp: 0,
                flush_list: BTreeSet::new(),
                flush_failed: BTreeSet::new(),
                batch_running: [false; 2],
                stats: BufferPoolStats::default(),
            }),
            free_event: Event::new(false),
            batch_end: [Event::new(true), Event::new(true)],
            cleaner_wakeup: Event::new(false),
            flush_ahead_lsn: AtomicU64::new(0),
            flush_ahead_furious: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
        })
    }

    /// Installs the log whose write-ahead rule page writes must respect.
    pub fn set_redo_log(&self, log: Arc<dyn RedoLogHandle>) {
        *self.log.write() = Some(log);
    }

    /// Stops the pool from writing pages. Dirty frames then stay resident
    /// and only clean frames are reclaimed.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Returns true when page writes are disabled.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn out_of_frames(&self) -> RedoError {
        if self.is_read_only() {
            RedoError::ReadOnlyPoolFull {
                frames: self.options.pool_pages,
            }
        } else {
            RedoError::NoFreeFrames
        }
    }

    pub(crate) fn redo_log(&self) -> Option<Arc<dyn RedoLogHandle>> {
        self.log.read().clone()
    }

    /// Storage the pool reads from and writes to.
    pub fn storage(&self) -> &Arc<dyn PageStorage> {
        &self.storage
    }

    pub(crate) fn doublewrite(&self) -> Option<&Arc<dyn DoublewriteBuffer>> {
        self.doublewrite.as_ref()
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Options the pool was created with.
    pub fn options(&self) -> &BufferPoolOptions {
        &self.options
    }

    /// Reads `id` (or finds it resident) and returns it exclusively latched.
    ///
    /// Fails with [`RedoError::PageBeyondEof`] or
    /// [`RedoError::SpaceNotFound`] as reported by storage, and with
    /// [`RedoError::PageCorrupted`] when the stored image fails its checksum.
    pub fn fetch(&self, id: PageId) -> Result<PageGuard<'_>> {
        self.get(id, false)
    }

    /// Returns `id` latched without reading it: the resident copy when there
    /// is one, otherwise a zero-filled frame the caller initializes.
    pub fn create(&self, id: PageId) -> Result<PageGuard<'_>> {
        self.get(id, true)
    }

    fn get(&self, id: PageId, create: bool) -> Result<PageGuard<'_>> {
        let mut rounds = 0u32;
        loop {
            let mut inner = self.inner.lock();
            if let Some(&idx) = inner.page_table.get(&id) {
                inner.frames[idx].fix_count += 1;
                inner.touch(idx);
                inner.stats.hits += 1;
                let buf = inner.frames[idx].buf.clone();
                drop(inner);
                // a concurrent reader holds the latch until the page is loaded
                let latch = buf.write_arc();
                if self.inner.lock().frames[idx].stale {
                    drop(latch);
                    self.unfix(idx);
                    continue;
                }
                return Ok(PageGuard::new(self, id, idx, latch));
            }

            let Some((idx, mut latch)) = inner.acquire_frame(self.options.lru_scan_depth) else {
                drop(inner);
                rounds += 1;
                if rounds > self.options.free_wait_attempts {
                    warn!(page = %id, "buf.fetch.no_free_frames");
                    return Err(self.out_of_frames());
                }
                self.make_room()?;
                continue;
            };
            {
                let frame = &mut inner.frames[idx];
                frame.id = Some(id);
                frame.fix_count = 1;
                frame.io_fix = if create { IoFix::None } else { IoFix::Read };
            }
            inner.page_table.insert(id, idx);
            inner.touch(idx);
            if create {
                inner.stats.creates += 1;
                drop(inner);
                latch.fill(0);
                return Ok(PageGuard::new(self, id, idx, latch));
            }
            drop(inner);

            match self.read_into(id, &mut latch) {
                Ok(()) => {
                    let mut inner = self.inner.lock();
                    inner.frames[idx].io_fix = IoFix::None;
                    inner.stats.reads += 1;
                    drop(inner);
                    return Ok(PageGuard::new(self, id, idx, latch));
                }
                Err(err) => {
                    drop(latch);
                    let mut inner = self.inner.lock();
                    inner.page_table.remove(&id);
                    let frame = &mut inner.frames[idx];
                    frame.io_fix = IoFix::None;
                    frame.fix_count -= 1;
                    if frame.fix_count == 0 {
                        inner.release_frame(idx);
                        drop(inner);
                        self.free_event.set();
                    } else {
                        frame.stale = true;
                    }
                    return Err(err);
                }
            }
        }
    }

    fn read_into(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        self.storage.read_page(id, dst)?;
        match page::validate(dst, id) {
            PageCheck::Valid | PageCheck::Empty => Ok(()),
            PageCheck::Corrupt(reason) => {
                warn!(page = %id, reason, "buf.fetch.corrupt_page");
                Err(RedoError::PageCorrupted(id))
            }
        }
    }

    fn unfix(&self, idx: usize) {
        let mut inner = self.inner.lock();
        let frame = &mut inner.frames[idx];
        frame.fix_count = frame.fix_count.saturating_sub(1);
        if frame.fix_count > 0 {
            return;
        }
        if frame.io_fix == IoFix::Pin {
            frame.io_fix = IoFix::None;
        }
        if frame.stale {
            inner.release_frame(idx);
            drop(inner);
            self.free_event.set();
        } else if !frame.is_dirty() {
            drop(inner);
            self.free_event.set();
        }
    }

    /// Marks a latched page as being under redo application; it cannot be
    /// evicted or flushed until the guard is dropped.
    pub fn pin(&self, guard: &PageGuard<'_>) {
        self.inner.lock().frames[guard.idx].io_fix = IoFix::Pin;
    }

    /// Records that the latched page was changed by the log range
    /// `start..end`, putting it on the flush list if it was clean.
    pub fn note_modification(&self, guard: &PageGuard<'_>, start: Lsn, end: Lsn) {
        let mut inner = self.inner.lock();
        let PoolInner {
            frames, flush_list, ..
        } = &mut *inner;
        let frame = &mut frames[guard.idx];
        if !frame.is_dirty() {
            frame.oldest_modification = start;
            flush_list.insert((start, guard.id));
        }
        if end > frame.newest_modification {
            frame.newest_modification = end;
        }
    }

    /// End LSN of the newest change made to the latched page in the pool.
    pub fn newest_modification(&self, guard: &PageGuard<'_>) -> Lsn {
        self.inner.lock().frames[guard.idx].newest_modification
    }

    /// Blocks until `n` frames are free or cleanly replaceable, flushing the
    /// LRU tail and waiting for eviction progress in between. No page latch
    /// may be held by the caller.
    ///
    /// A read-only pool fails with [`RedoError::ReadOnlyPoolFull`] as soon
    /// as every frame holds an unfixed dirty page.
    pub fn wait_for_free(&self, n: usize) -> Result<()> {
        let n = n.min(self.options.pool_pages);
        for _ in 0..=self.options.free_wait_attempts {
            {
                let inner = self.inner.lock();
                let available =
                    inner.free.len() + inner.replaceable_near_tail(self.options.lru_scan_depth);
                if available >= n {
                    return Ok(());
                }
                if self.is_read_only() && inner.frames.iter().all(Frame::is_idle) {
                    warn!(frames = self.options.pool_pages, "buf.read_only.pool_full");
                    return Err(self.out_of_frames());
                }
            }
            self.make_room()?;
        }
        Err(self.out_of_frames())
    }

    /// One round of freeing frames: an LRU batch, a single-page flush if
    /// that did nothing, and a bounded wait if neither made progress.
    fn make_room(&self) -> Result<()> {
        if self.lru_tail_flush(self.options.lru_scan_depth)? > 0 {
            return Ok(());
        }
        if self.flush_single_page()? {
            return Ok(());
        }
        let count = self.free_event.reset();
        self.inner.lock().stats.free_waits += 1;
        self.cleaner_wakeup.set();
        self.free_event.wait_timeout(
            count,
            Duration::from_millis(self.options.free_wait_timeout_ms),
        );
        Ok(())
    }

    /// Requests background flushing of pages older than `lsn`; `furious`
    /// drops the I/O capacity limit.
    pub fn ahead(&self, lsn: Lsn, furious: bool) {
        let prev = self.flush_ahead_lsn.fetch_max(lsn.0, Ordering::AcqRel);
        if furious {
            self.flush_ahead_furious.store(true, Ordering::Release);
        }
        if lsn.0 > prev || furious {
            trace!(lsn = lsn.0, furious, "buf.flush.ahead");
            self.cleaner_wakeup.set();
        }
    }

    /// Takes the pending flush-ahead request, if any.
    pub(crate) fn take_flush_ahead(&self) -> Option<(Lsn, bool)> {
        let lsn = self.flush_ahead_lsn.swap(0, Ordering::AcqRel);
        let furious = self.flush_ahead_furious.swap(false, Ordering::AcqRel);
        (lsn != 0).then_some((Lsn(lsn), furious))
    }

    /// Number of frames on the free list.
    pub fn free_len(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Number of dirty pages, including those whose flush failed.
    pub fn dirty_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.flush_list.len() + inner.flush_failed.len()
    }

    /// Returns true when `id` is resident.
    pub fn contains(&self, id: PageId) -> bool {
        self.inner.lock().page_table.contains_key(&id)
    }

    /// Returns true when `id` is resident and dirty.
    pub fn is_dirty(&self, id: PageId) -> bool {
        let inner = self.inner.lock();
        inner
            .page_table
            .get(&id)
            .map_or(false, |&idx| inner.frames[idx].is_dirty())
    }

    /// I/O state of a resident page.
    pub fn io_fix(&self, id: PageId) -> Option<IoFix> {
        let inner = self.inner.lock();
        inner.page_table.get(&id).map(|&idx| inner.frames[idx].io_fix)
    }

    /// Pages whose last flush failed, with the error text.
    pub fn failed_flushes(&self) -> Vec<(PageId, String)> {
        let inner = self.inner.lock();
        inner
            .flush_failed
            .iter()
            .filter_map(|id| {
                let idx = *inner.page_table.get(id)?;
                let reason = inner.frames[idx].flush_error.clone().unwrap_or_default();
                Some((*id, reason))
            })
            .collect()
    }

    /// Puts every page whose flush failed back on the flush list.
    pub fn retry_failed_flushes(&self) -> usize {
        let mut inner = self.inner.lock();
        let failed = std::mem::take(&mut inner.flush_failed);
        let mut requeued = 0;
        for id in failed {
            let Some(&idx) = inner.page_table.get(&id) else {
                continue;
            };
            let frame = &mut inner.frames[idx];
            frame.flush_error = None;
            let oldest = frame.oldest_modification;
            inner.flush_list.insert((oldest, id));
            requeued += 1;
        }
        if requeued > 0 {
            debug!(pages = requeued, "buf.flush.retry_failed");
        }
        requeued
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BufferPoolStats {
        self.inner.lock().stats.clone()
    }
}

impl DirtyPages for BufferPool {
    fn oldest_modification(&self) -> Option<Lsn> {
        self.inner.lock().oldest_modification()
    }
}

/// An exclusively latched, fixed page. Dropping the guard releases the
/// latch, then the fix.
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    id: PageId,
    idx: usize,
    latch: Option<PageLatch>,
}

impl<'a> PageGuard<'a> {
    fn new(pool: &'a BufferPool, id: PageId, idx: usize, latch: PageLatch) -> Self {
        Self {
            pool,
            id,
            idx,
            latch: Some(latch),
        }
    }

    /// Identifier of the page.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Page contents.
    pub fn data(&self) -> &[u8] {
        self.latch.as_deref().map_or(&[][..], |buf| &buf[..])
    }

    /// Mutable page contents.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.latch.as_deref_mut() {
            Some(buf) => &mut buf[..],
            None => &mut [],
        }
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.latch.take();
        self.pool.unfix(self.idx);
    }
}

//! Background page cleaner.
//!
//! Each round services a pending `ahead` request first; otherwise it picks
//! a flush rate from the dirty-page percentage and the checkpoint age, then
//! tops up the free list from the LRU tail before sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::BufferPool;
use crate::checkpoint::{DirtyPages, LogCapacity};
use crate::types::{Lsn, Result};

/// Page cleaner tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushOptions {
    /// Pages per round the cleaner writes at 100% pressure.
    pub io_capacity: usize,
    /// Hard cap on pages per round outside furious flushing.
    pub io_capacity_max: usize,
    /// Dirty percentage at which the cleaner flushes at full capacity.
    pub max_dirty_pages_pct: f64,
    /// Dirty percentage where proportional flushing starts; 0 disables it.
    pub max_dirty_pages_pct_lwm: f64,
    /// Checkpoint age, in percent of the async margin, below which the age
    /// does not drive flushing.
    pub adaptive_flushing_lwm: f64,
    /// Sleep between rounds, in milliseconds.
    pub interval_ms: u64,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            io_capacity: 200,
            io_capacity_max: 2000,
            max_dirty_pages_pct: 75.0,
            max_dirty_pages_pct_lwm: 0.0,
            adaptive_flushing_lwm: 10.0,
            interval_ms: 1000,
        }
    }
}

impl FlushOptions {
    fn pct_for_dirty(&self, dirty_pct: f64) -> f64 {
        if dirty_pct >= self.max_dirty_pages_pct {
            return 100.0;
        }
        if self.max_dirty_pages_pct_lwm > 0.0 && dirty_pct >= self.max_dirty_pages_pct_lwm {
            return dirty_pct * 100.0 / self.max_dirty_pages_pct.max(1.0);
        }
        0.0
    }

    fn pct_for_lsn(&self, age: u64, capacity: &LogCapacity) -> f64 {
        let margin = capacity.max_modified_age_async.max(1) as f64;
        let age_factor = age as f64 * 100.0 / margin;
        if age_factor < self.adaptive_flushing_lwm {
            return 0.0;
        }
        let ratio = self.io_capacity_max as f64 / self.io_capacity.max(1) as f64;
        ratio * age_factor * age_factor.sqrt() / 7.5
    }

    /// Pages to flush this round for the given pool state.
    pub fn recommendation(&self, dirty_pct: f64, age: u64, capacity: Option<&LogCapacity>) -> usize {
        let pct_lsn = capacity.map_or(0.0, |c| self.pct_for_lsn(age, c));
        let pct = self.pct_for_dirty(dirty_pct).max(pct_lsn);
        let pages = (self.io_capacity as f64 * pct / 100.0).round() as usize;
        pages.min(self.io_capacity_max)
    }
}

/// Handle to the running cleaner thread; dropping it stops the thread.
pub struct PageCleaner {
    pool: Arc<BufferPool>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PageCleaner {
    /// Starts the cleaner for `pool`.
    pub fn start(pool: Arc<BufferPool>, options: FlushOptions) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let pool = Arc::clone(&pool);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("page-cleaner".into())
                .spawn(move || run(&pool, &options, &shutdown))?
        };
        info!("buf.cleaner.started");
        Ok(Self {
            pool,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for its current round to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.pool.cleaner_wakeup.set();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("buf.cleaner.panicked");
            }
        }
    }
}

impl Drop for PageCleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(pool: &BufferPool, options: &FlushOptions, shutdown: &AtomicBool) {
    let interval = Duration::from_millis(options.interval_ms);
    while !shutdown.load(Ordering::Acquire) {
        let count = pool.cleaner_wakeup.reset();
        if let Err(err) = round(pool, options) {
            warn!(error = %err, "buf.cleaner.round_failed");
        }
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        pool.cleaner_wakeup.wait_timeout(count, interval);
    }
    debug!("buf.cleaner.stopped");
}

fn round(pool: &BufferPool, options: &FlushOptions) -> Result<()> {
    if let Some((lsn, furious)) = pool.take_flush_ahead() {
        let n = if furious {
            usize::MAX
        } else {
            options.io_capacity
        };
        let outcome = pool.flush_list(n, lsn)?;
        debug!(lsn = lsn.0, furious, flushed = outcome.flushed, "buf.cleaner.ahead");
        // more left below the target: keep going next round
        if pool.oldest_modification().map_or(false, |o| o < lsn) {
            pool.ahead(lsn, furious);
        }
    } else {
        let pool_pages = pool.options().pool_pages.max(1);
        let dirty_pct = pool.dirty_len() as f64 * 100.0 / pool_pages as f64;
        let log = pool.redo_log();
        let (age, capacity) = match (&log, pool.oldest_modification()) {
            (Some(log), Some(oldest)) => (
                log.current_lsn().0.saturating_sub(oldest.0),
                Some(log.capacity()),
            ),
            (Some(log), None) => (0, Some(log.capacity())),
            (None, _) => (0, None),
        };
        let n = options.recommendation(dirty_pct, age, capacity.as_ref());
        if n > 0 {
            pool.flush_list(n, Lsn::MAX)?;
        }
    }
    // refill the free list up to a quarter of the pool, capped by the scan depth
    let target = pool
        .options()
        .lru_scan_depth
        .min(pool.options().pool_pages / 4)
        .max(1);
    let free = pool.free_len();
    if free < target {
        pool.lru_tail_flush(target - free)?;
    }
    Ok(())
}

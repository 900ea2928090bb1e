//! Replaying stored redo records onto buffer-pool pages.
//!
//! A batch snapshots the pending page ids and hands them to worker threads
//! through a shared cursor. Each worker claims one page at a time, so no
//! entry is applied twice and every entry present at the snapshot is seen.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::store::{ClaimedPage, PageRedoStore};
use crate::buffer::{BufferPool, PageGuard};
use crate::types::page;
use crate::types::{Lsn, PageId, RedoError, Result};

/// Why a page could not be recovered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize)]
pub enum PageFailureKind {
    /// The stored image failed validation and no doublewrite copy existed.
    Corrupted,
    /// The page's tablespace is not known.
    MissingSpace,
    /// Reading or extending the tablespace failed.
    Io,
    /// A record did not fit the page it targets.
    CorruptRecord,
}

/// A page skipped by recovery.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PageFailure {
    /// The page.
    pub page: PageId,
    /// Failure class.
    pub kind: PageFailureKind,
    /// Human-readable detail.
    pub reason: String,
}

impl PageFailure {
    fn new(page: PageId, kind: PageFailureKind, reason: impl Into<String>) -> Self {
        Self {
            page,
            kind,
            reason: reason.into(),
        }
    }
}

/// Outcome of one [`RecoveryApplier::apply_batch`] call.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchReport {
    /// Pages whose records were replayed (including pages where every
    /// record was already present).
    pub pages_recovered: usize,
    /// Records written to pages.
    pub records_applied: usize,
    /// Records whose changes the page already contained.
    pub records_skipped: usize,
    /// Pages repaired from the doublewrite area.
    pub doublewrite_restores: usize,
    /// Highest number of pages held by workers at once.
    pub max_in_flight: usize,
    /// Pages that could not be recovered.
    pub failures: Vec<PageFailure>,
}

/// Totals over every batch of a recovery run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ApplyStats {
    /// Batches run, including the final one.
    pub batches: usize,
    /// Pages recovered.
    pub pages_recovered: usize,
    /// Pages skipped after a failure.
    pub pages_failed: usize,
    /// Records written to pages.
    pub records_applied: usize,
    /// Records already reflected in the page.
    pub records_skipped: usize,
    /// Pages repaired from the doublewrite area.
    pub doublewrite_restores: usize,
    /// Highest number of pages held by workers at once in any batch.
    pub max_in_flight: usize,
}

impl ApplyStats {
    /// Adds one batch to the totals.
    pub fn absorb(&mut self, batch: &BatchReport) {
        self.batches += 1;
        self.pages_recovered += batch.pages_recovered;
        self.pages_failed += batch.failures.len();
        self.records_applied += batch.records_applied;
        self.records_skipped += batch.records_skipped;
        self.doublewrite_restores += batch.doublewrite_restores;
        self.max_in_flight = self.max_in_flight.max(batch.max_in_flight);
    }
}

enum Loaded<'a> {
    Page { guard: PageGuard<'a>, restored: bool },
    Failed(PageFailure),
}

enum PageResult {
    Recovered {
        applied: usize,
        skipped: usize,
        restored: bool,
    },
    Failed {
        failure: PageFailure,
        restored: bool,
    },
}

struct Batch<'a> {
    store: &'a PageRedoStore,
    pool: &'a BufferPool,
    scanned_lsn: Lsn,
    read_only: bool,
    ids: Vec<PageId>,
    cursor: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    abort: AtomicBool,
    error: Mutex<Option<RedoError>>,
    report: Mutex<BatchReport>,
}

impl Batch<'_> {
    fn worker(&self) {
        while !self.abort.load(Ordering::Acquire) {
            let i = self.cursor.fetch_add(1, Ordering::Relaxed);
            let Some(&id) = self.ids.get(i) else {
                return;
            };
            if let Err(err) = self.page(id) {
                self.abort.store(true, Ordering::Release);
                let mut slot = self.error.lock();
                if slot.is_none() {
                    *slot = Some(err);
                }
                return;
            }
        }
    }

    fn page(&self, id: PageId) -> Result<()> {
        // no latch is held here
        self.pool.wait_for_free(1)?;
        let Some(claimed) = self.store.claim(id) else {
            return Ok(());
        };
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(now, Ordering::AcqRel);
        let result = self.recover(id, &claimed);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.store.complete(id);
        self.store.erase(id)?;
        self.tally(result?);
        Ok(())
    }

    fn tally(&self, result: PageResult) {
        let mut report = self.report.lock();
        match result {
            PageResult::Recovered {
                applied,
                skipped,
                restored,
            } => {
                report.pages_recovered += 1;
                report.records_applied += applied;
                report.records_skipped += skipped;
                report.doublewrite_restores += usize::from(restored);
            }
            PageResult::Failed { failure, restored } => {
                report.doublewrite_restores += usize::from(restored);
                report.failures.push(failure);
            }
        }
    }

    fn recover(&self, id: PageId, claimed: &ClaimedPage) -> Result<PageResult> {
        let (mut guard, restored) = match self.load(id, claimed.skip_read)? {
            Loaded::Page { guard, restored } => (guard, restored),
            Loaded::Failed(failure) => {
                warn!(page = %id, kind = ?failure.kind, reason = %failure.reason, "recv.apply.page_failed");
                return Ok(PageResult::Failed {
                    failure,
                    restored: false,
                });
            }
        };
        self.pool.pin(&guard);
        self.store.mark_read(id);

        let mut image = guard.data().to_vec();
        let mut gate = page::page_lsn(&image);
        let mut applied = 0;
        let mut skipped = 0;
        let mut first_start: Option<Lsn> = None;
        let mut last_end = Lsn::ZERO;
        for rec in &claimed.records {
            if rec.op.is_init() {
                gate = self.pool.newest_modification(&guard);
            }
            if rec.lsn <= gate {
                skipped += 1;
                continue;
            }
            if let Err(reason) = rec.op.apply(&mut image, id) {
                warn!(page = %id, lsn = rec.lsn.0, reason, "recv.apply.bad_record");
                return Ok(PageResult::Failed {
                    failure: PageFailure::new(id, PageFailureKind::CorruptRecord, reason),
                    restored,
                });
            }
            first_start.get_or_insert(rec.start_lsn);
            last_end = rec.lsn;
            applied += 1;
        }

        if let Some(start) = first_start {
            guard.data_mut().copy_from_slice(&image);
            page::set_page_lsn(guard.data_mut(), last_end);
            self.pool.note_modification(&guard, start, last_end);
        } else if restored {
            // the repaired image still has to reach the tablespace
            if let Some(first) = claimed.records.first() {
                let end = page::page_lsn(guard.data()).max(first.start_lsn);
                self.pool.note_modification(&guard, first.start_lsn, end);
            }
        }
        trace!(page = %id, applied, skipped, "recv.apply.page");
        Ok(PageResult::Recovered {
            applied,
            skipped,
            restored,
        })
    }

    fn load(&self, id: PageId, skip_read: bool) -> Result<Loaded<'_>> {
        if skip_read {
            if let Err(err) = self.pool.storage().space_size(id.space) {
                return self.failed(id, err);
            }
            let guard = self.pool.create(id)?;
            return Ok(Loaded::Page {
                guard,
                restored: false,
            });
        }
        match self.pool.fetch(id) {
            Ok(guard) => Ok(Loaded::Page {
                guard,
                restored: false,
            }),
            Err(RedoError::PageBeyondEof { size_pages, .. }) => {
                if !self.read_only {
                    if let Err(err) = self.pool.storage().extend(id.space, id.page_no + 1) {
                        return self.failed(id, err);
                    }
                }
                debug!(page = %id, size_pages, "recv.apply.beyond_eof");
                let guard = self.pool.create(id)?;
                Ok(Loaded::Page {
                    guard,
                    restored: false,
                })
            }
            Err(RedoError::PageCorrupted(_)) => {
                let copy = self
                    .pool
                    .doublewrite()
                    .and_then(|dw| dw.find_page(id, self.scanned_lsn))
                    .filter(|image| image.len() == self.pool.page_size());
                let Some(image) = copy else {
                    return Ok(Loaded::Failed(PageFailure::new(
                        id,
                        PageFailureKind::Corrupted,
                        "page failed checksum validation and has no doublewrite copy",
                    )));
                };
                let mut guard = self.pool.create(id)?;
                guard.data_mut().copy_from_slice(&image);
                info!(page = %id, lsn = page::page_lsn(&image).0, "recv.apply.doublewrite_restore");
                Ok(Loaded::Page {
                    guard,
                    restored: true,
                })
            }
            Err(err) => self.failed(id, err),
        }
    }

    fn failed(&self, id: PageId, err: RedoError) -> Result<Loaded<'_>> {
        let kind = match &err {
            RedoError::SpaceNotFound(_) => PageFailureKind::MissingSpace,
            RedoError::Io(_) => PageFailureKind::Io,
            RedoError::PageCorrupted(_) => PageFailureKind::Corrupted,
            _ => return Err(err),
        };
        Ok(Loaded::Failed(PageFailure::new(id, kind, err.to_string())))
    }
}

/// Applies the contents of a [`PageRedoStore`] with a fixed number of
/// worker threads.
#[derive(Clone, Debug)]
pub struct RecoveryApplier {
    threads: usize,
}

impl RecoveryApplier {
    /// Applier using `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    /// Worker count.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Processes every page pending in `store` once.
    ///
    /// Page-level problems are reported in the returned [`BatchReport`];
    /// only pool exhaustion and store misuse fail the call. With
    /// `last_batch` the call keeps going until nothing is pending.
    /// `scanned_lsn` bounds the doublewrite copies that may replace a
    /// corrupt page.
    pub fn apply_batch(
        &self,
        store: &PageRedoStore,
        pool: &BufferPool,
        scanned_lsn: Lsn,
        read_only: bool,
        last_batch: bool,
    ) -> Result<BatchReport> {
        let mut total = BatchReport::default();
        loop {
            let ids = store.pending_ids();
            if ids.is_empty() {
                break;
            }
            let pages = ids.len();
            let batch = Batch {
                store,
                pool,
                scanned_lsn,
                read_only,
                ids,
                cursor: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                abort: AtomicBool::new(false),
                error: Mutex::new(None),
                report: Mutex::new(BatchReport::default()),
            };
            // every worker may hold one frame while it waits for another
            let workers = self
                .threads
                .min(pages)
                .min((pool.options().pool_pages / 2).max(1));
            thread::scope(|s| {
                for _ in 0..workers {
                    s.spawn(|| batch.worker());
                }
            });
            if let Some(err) = batch.error.into_inner() {
                warn!(error = %err, "recv.apply.batch_aborted");
                return Err(err);
            }
            let mut report = batch.report.into_inner();
            report.max_in_flight = batch.max_in_flight.into_inner();
            debug!(
                pages,
                recovered = report.pages_recovered,
                applied = report.records_applied,
                failed = report.failures.len(),
                "recv.apply.batch"
            );
            total.pages_recovered += report.pages_recovered;
            total.records_applied += report.records_applied;
            total.records_skipped += report.records_skipped;
            total.doublewrite_restores += report.doublewrite_restores;
            total.max_in_flight = total.max_in_flight.max(report.max_in_flight);
            total.failures.append(&mut report.failures);
            if !last_batch {
                break;
            }
        }
        Ok(total)
    }
}

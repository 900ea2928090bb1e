//! Pending redo records grouped by page.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::log::record::PageOp;
use crate::types::{Lsn, PageId, RedoError, Result, SpaceId};

/// Bookkeeping bytes charged per record on top of its payload.
pub const RECORD_OVERHEAD: usize = 64;

/// Lifecycle of a page's pending records. Transitions only move forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum RecoveryState {
    /// Waiting for a batch.
    NotProcessed,
    /// Claimed; the old image is being read.
    BeingRead,
    /// Claimed; records are being applied.
    BeingProcessed,
    /// Done; the entry may be erased.
    Processed,
}

/// One record waiting to be applied.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecvRecord {
    /// Start of the mini-transaction that produced it.
    pub start_lsn: Lsn,
    /// End of that mini-transaction; the page LSN after applying it.
    pub lsn: Lsn,
    /// The change.
    pub op: PageOp,
}

impl RecvRecord {
    fn charge(&self) -> usize {
        RECORD_OVERHEAD + self.op.payload_len()
    }
}

/// All pending records of one page.
#[derive(Clone, Debug)]
pub struct PageRecoveryEntry {
    /// Records in log order.
    pub records: Vec<RecvRecord>,
    /// Current state.
    pub state: RecoveryState,
    /// The first record initializes the page, so the stored image is not
    /// needed.
    pub skip_read: bool,
    bytes: usize,
}

impl PageRecoveryEntry {
    fn new(first: &RecvRecord) -> Self {
        Self {
            records: Vec::new(),
            state: RecoveryState::NotProcessed,
            skip_read: first.op.is_init(),
            bytes: 0,
        }
    }
}

/// Result of [`PageRedoStore::add`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddResult {
    /// The record was stored.
    Added,
    /// Storing the record would exceed the memory budget; nothing was
    /// stored.
    OutOfMemory,
}

/// Records a worker took from the store with [`PageRedoStore::claim`].
#[derive(Debug)]
pub struct ClaimedPage {
    /// Records in log order.
    pub records: Vec<RecvRecord>,
    /// Whether the stored image can be ignored.
    pub skip_read: bool,
}

#[derive(Default)]
struct StoreInner {
    pages: BTreeMap<PageId, PageRecoveryEntry>,
    bytes: usize,
}

/// Map from page to pending records under one mutex. Workers own the
/// records of an entry once they have claimed it.
pub struct PageRedoStore {
    inner: Mutex<StoreInner>,
    budget: usize,
}

impl PageRedoStore {
    /// Store accepting records up to `budget` accounted bytes.
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            budget,
        }
    }

    /// Store without a memory limit.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Appends a record for `page`. Records must arrive in log order.
    pub fn add(&self, page: PageId, start_lsn: Lsn, lsn: Lsn, op: PageOp) -> Result<AddResult> {
        let rec = RecvRecord { start_lsn, lsn, op };
        let charge = rec.charge();
        let mut inner = self.inner.lock();
        if inner.bytes.saturating_add(charge) > self.budget {
            return Ok(AddResult::OutOfMemory);
        }
        let StoreInner { pages, bytes } = &mut *inner;
        let entry = pages
            .entry(page)
            .or_insert_with(|| PageRecoveryEntry::new(&rec));
        if entry.state == RecoveryState::Processed {
            // finished in an earlier batch but not erased yet
            *bytes -= entry.bytes;
            *entry = PageRecoveryEntry::new(&rec);
        } else if entry.state != RecoveryState::NotProcessed {
            return Err(RedoError::Invalid("record added to a page being applied"));
        }
        if entry.records.last().map_or(false, |last| last.lsn > rec.lsn) {
            return Err(RedoError::Invalid("redo records out of LSN order"));
        }
        entry.bytes += charge;
        entry.records.push(rec);
        *bytes += charge;
        Ok(AddResult::Added)
    }

    /// Removes the trailing records of `page` that belong to mini-
    /// transactions starting at or after `start_lsn`; drops the entry if it
    /// becomes empty.
    pub fn trim(&self, page: PageId, start_lsn: Lsn) {
        let mut inner = self.inner.lock();
        let StoreInner { pages, bytes } = &mut *inner;
        let Some(entry) = pages.get_mut(&page) else {
            return;
        };
        if entry.state != RecoveryState::NotProcessed {
            return;
        }
        let mut freed = 0;
        while let Some(last) = entry.records.last() {
            if last.start_lsn < start_lsn {
                break;
            }
            freed += last.charge();
            entry.records.pop();
        }
        entry.bytes -= freed;
        *bytes -= freed;
        match entry.records.first() {
            None => {
                pages.remove(&page);
            }
            Some(first) => entry.skip_read = first.op.is_init(),
        }
        if freed > 0 {
            trace!(page = %page, lsn = start_lsn.0, freed, "recv.store.trim");
        }
    }

    /// Takes the records of a `NotProcessed` page for application.
    pub fn claim(&self, page: PageId) -> Option<ClaimedPage> {
        let mut inner = self.inner.lock();
        let entry = inner.pages.get_mut(&page)?;
        if entry.state != RecoveryState::NotProcessed {
            return None;
        }
        entry.state = if entry.skip_read {
            RecoveryState::BeingProcessed
        } else {
            RecoveryState::BeingRead
        };
        Some(ClaimedPage {
            records: std::mem::take(&mut entry.records),
            skip_read: entry.skip_read,
        })
    }

    /// The old image of a claimed page has been read.
    pub fn mark_read(&self, page: PageId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.pages.get_mut(&page) {
            if entry.state == RecoveryState::BeingRead {
                entry.state = RecoveryState::BeingProcessed;
            }
        }
    }

    /// Marks a claimed page as done, whether or not its records applied.
    pub fn complete(&self, page: PageId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.pages.get_mut(&page) {
            entry.state = RecoveryState::Processed;
        }
    }

    /// Removes a `Processed` entry and releases its budget.
    pub fn erase(&self, page: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.pages.get(&page).map(|e| e.state) {
            None => Ok(()),
            Some(RecoveryState::Processed) => {
                if let Some(entry) = inner.pages.remove(&page) {
                    inner.bytes -= entry.bytes;
                }
                Ok(())
            }
            Some(_) => Err(RedoError::Invalid("erase of an unprocessed recovery entry")),
        }
    }

    /// Drops every not-yet-claimed entry of `space`; returns how many.
    pub fn discard_space(&self, space: SpaceId) -> usize {
        let mut inner = self.inner.lock();
        let doomed: Vec<PageId> = inner
            .pages
            .range(PageId::new(space, 0)..=PageId::new(space, u32::MAX))
            .filter(|(_, e)| e.state == RecoveryState::NotProcessed)
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            if let Some(entry) = inner.pages.remove(id) {
                inner.bytes -= entry.bytes;
            }
        }
        doomed.len()
    }

    /// Snapshot of the pages waiting for a batch, in page order.
    pub fn pending_ids(&self) -> Vec<PageId> {
        let inner = self.inner.lock();
        inner
            .pages
            .iter()
            .filter(|(_, e)| e.state == RecoveryState::NotProcessed)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Pending record count per page, in page order.
    pub fn pending_counts(&self) -> Vec<(PageId, usize)> {
        let inner = self.inner.lock();
        inner
            .pages
            .iter()
            .filter(|(_, e)| e.state == RecoveryState::NotProcessed)
            .map(|(id, e)| (*id, e.records.len()))
            .collect()
    }

    /// LSNs of the pending records of `page`, in stored order.
    pub fn record_lsns(&self, page: PageId) -> Vec<Lsn> {
        let inner = self.inner.lock();
        inner
            .pages
            .get(&page)
            .map(|e| e.records.iter().map(|r| r.lsn).collect())
            .unwrap_or_default()
    }

    /// State of the entry for `page`, if one exists.
    pub fn state(&self, page: PageId) -> Option<RecoveryState> {
        self.inner.lock().pages.get(&page).map(|e| e.state)
    }

    /// Number of entries in any state.
    pub fn len(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Returns true when no entry exists.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().pages.is_empty()
    }

    /// Accounted bytes currently held.
    pub fn bytes_used(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Releases every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.pages.clear();
        inner.bytes = 0;
    }
}

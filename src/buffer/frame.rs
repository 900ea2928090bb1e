use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

use crate::types::{Lsn, PageId};

/// In-flight operation on a frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum IoFix {
    /// Nothing in flight.
    None,
    /// The page is being read from storage.
    Read,
    /// The page is being written to storage.
    Write,
    /// Held in place while redo is applied; not evictable.
    Pin,
}

pub(crate) struct Frame {
    pub id: Option<PageId>,
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pub io_fix: IoFix,
    pub fix_count: u32,
    pub oldest_modification: Lsn,
    pub newest_modification: Lsn,
    pub lru_stamp: Option<u64>,
    pub flush_error: Option<String>,
    pub stale: bool,
}

impl Frame {
    pub fn new(page_size: usize) -> Self {
        Self {
            id: None,
            buf: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            io_fix: IoFix::None,
            fix_count: 0,
            oldest_modification: Lsn::ZERO,
            newest_modification: Lsn::ZERO,
            lru_stamp: None,
            flush_error: None,
            stale: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.oldest_modification.is_zero()
    }

    /// Clean, unfixed and idle: can be handed out again.
    pub fn is_replaceable(&self) -> bool {
        self.id.is_some() && self.fix_count == 0 && self.io_fix == IoFix::None && !self.is_dirty()
    }

    /// No thread holds or is reading the frame.
    pub fn is_idle(&self) -> bool {
        self.fix_count == 0 && self.io_fix == IoFix::None
    }

    /// Dirty but idle: a candidate for a single-page or LRU flush.
    pub fn is_flushable(&self) -> bool {
        self.id.is_some()
            && self.fix_count == 0
            && self.io_fix == IoFix::None
            && self.is_dirty()
            && self.flush_error.is_none()
    }

    pub fn reset(&mut self) {
        self.id = None;
        self.io_fix = IoFix::None;
        self.fix_count = 0;
        self.oldest_modification = Lsn::ZERO;
        self.newest_modification = Lsn::ZERO;
        self.lru_stamp = None;
        self.flush_error = None;
        self.stale = false;
    }
}

#![forbid(unsafe_code)]
//! Identifiers, the crate error type, and shared on-disk page layout.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Checksum helpers shared by the log and page formats.
pub mod checksum;
/// Fixed page header/trailer layout and page-level stamping helpers.
pub mod page;

/// Log sequence number: a byte position in the logical redo stream.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The zero LSN, used as "clean" for oldest-modification tracking.
    pub const ZERO: Lsn = Lsn(0);
    /// Largest representable LSN; used as an unbounded flush limit.
    pub const MAX: Lsn = Lsn(u64::MAX);

    /// Returns the LSN `n` bytes further along the stream.
    pub fn advance(self, n: u64) -> Lsn {
        Lsn(self.0.saturating_add(n))
    }

    /// Returns true for the zero LSN.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tablespace identifier.
pub type SpaceId = u32;

/// Page address: tablespace id plus page number within it.
///
/// Field order makes the derived ordering identical to the ordering of
/// [`PageId::to_u64`].
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct PageId {
    /// Tablespace the page belongs to.
    pub space: SpaceId,
    /// Page number within the tablespace.
    pub page_no: u32,
}

impl PageId {
    /// Builds a page id from its two components.
    pub const fn new(space: SpaceId, page_no: u32) -> Self {
        Self { space, page_no }
    }

    /// Packs the id into a single integer, space id in the high half.
    pub const fn to_u64(self) -> u64 {
        ((self.space as u64) << 32) | self.page_no as u64
    }

    /// Inverse of [`PageId::to_u64`].
    pub const fn from_u64(v: u64) -> Self {
        Self {
            space: (v >> 32) as u32,
            page_no: v as u32,
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.space, self.page_no)
    }
}

/// Errors surfaced by the redo, recovery and buffer layers.
#[derive(thiserror::Error, Debug)]
pub enum RedoError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("not found")]
    NotFound,
    #[error("no valid checkpoint found")]
    NoValidCheckpoint,
    #[error("tablespace {0} not found")]
    SpaceNotFound(SpaceId),
    #[error("page {page} is beyond the end of its tablespace ({size_pages} pages)")]
    PageBeyondEof { page: PageId, size_pages: u32 },
    #[error("page {0} failed checksum validation")]
    PageCorrupted(PageId),
    #[error("corrupt log record at lsn {lsn}: {reason}")]
    CorruptLogRecord { lsn: Lsn, reason: &'static str },
    #[error("redo record buffer exhausted while parsing the mini-transaction at lsn {0}")]
    LogBufferExhausted(Lsn),
    #[error("no free buffer frames available")]
    NoFreeFrames,
    #[error("buffer pool of {frames} frames is too small for a read-only replay")]
    ReadOnlyPoolFull { frames: usize },
    #[error("checkpoint lsn {new} precedes the current checkpoint {current}")]
    CheckpointRegression { current: Lsn, new: Lsn },
    #[error("checkpoint lsn {lsn} is past the oldest unflushed modification {oldest}")]
    CheckpointAhead { lsn: Lsn, oldest: Lsn },
    #[error("flush of page {page} failed: {reason}")]
    FlushFailed { page: PageId, reason: String },
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, RedoError>;

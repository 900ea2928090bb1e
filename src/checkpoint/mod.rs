#![forbid(unsafe_code)]
//! Checkpoint bookkeeping: slot format, choosing the checkpoint to recover
//! from, checkpoint monotonicity and the log-capacity margins that drive
//! preflushing.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::log::file::LogFile;
use crate::primitives::bytes::be;
use crate::types::checksum::crc32;
use crate::types::{Lsn, RedoError, Result};

/// Encoded size of a checkpoint slot, CRC included.
pub const CHECKPOINT_SLOT_LEN: usize = 36;

mod slot {
    pub const CHECKPOINT_NO: usize = 0;
    pub const LSN: usize = 8;
    pub const FILE_OFFSET: usize = 16;
    pub const END_LSN: usize = 24;
    pub const CRC: usize = 32;
}

/// A persisted checkpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Monotonic counter; selects the slot (`checkpoint_no % 2`).
    pub checkpoint_no: u64,
    /// Recovery starts scanning here.
    pub lsn: Lsn,
    /// Byte offset of `lsn` in the log file.
    pub file_offset: u64,
    /// End of the FILE_CHECKPOINT marker written for this checkpoint.
    pub end_lsn: Lsn,
}

impl Checkpoint {
    /// Slot index this checkpoint is written to.
    pub fn slot(&self) -> usize {
        (self.checkpoint_no % 2) as usize
    }

    /// Encodes the slot with its CRC.
    pub fn encode(&self) -> [u8; CHECKPOINT_SLOT_LEN] {
        let mut buf = [0u8; CHECKPOINT_SLOT_LEN];
        be::put_u64(&mut buf, slot::CHECKPOINT_NO, self.checkpoint_no);
        be::put_u64(&mut buf, slot::LSN, self.lsn.0);
        be::put_u64(&mut buf, slot::FILE_OFFSET, self.file_offset);
        be::put_u64(&mut buf, slot::END_LSN, self.end_lsn.0);
        let crc = crc32(&buf[..slot::CRC]);
        be::put_u32(&mut buf, slot::CRC, crc);
        buf
    }

    /// Decodes a slot; `None` when the CRC does not match or the slot was
    /// never written.
    pub fn decode(src: &[u8]) -> Option<Self> {
        if src.len() < CHECKPOINT_SLOT_LEN || src[..CHECKPOINT_SLOT_LEN].iter().all(|&b| b == 0) {
            return None;
        }
        if be::get_u32(src, slot::CRC) != crc32(&src[..slot::CRC]) {
            return None;
        }
        let cp = Checkpoint {
            checkpoint_no: be::get_u64(src, slot::CHECKPOINT_NO),
            lsn: Lsn(be::get_u64(src, slot::LSN)),
            file_offset: be::get_u64(src, slot::FILE_OFFSET),
            end_lsn: Lsn(be::get_u64(src, slot::END_LSN)),
        };
        if cp.end_lsn < cp.lsn {
            return None;
        }
        Some(cp)
    }
}

/// Anything that can report the oldest unflushed modification.
pub trait DirtyPages {
    /// Smallest `oldest_modification` over dirty pages, including pages
    /// whose last flush failed; `None` when every page is clean.
    fn oldest_modification(&self) -> Option<Lsn>;
}

/// Reads the checkpoint slots and picks the one to recover from: the highest
/// `lsn`, then the highest `checkpoint_no`; a full tie keeps the first slot.
pub fn find_checkpoint(log: &LogFile) -> Result<Checkpoint> {
    let mut best: Option<Checkpoint> = None;
    for idx in 0..LogFile::CHECKPOINT_SLOTS {
        let Some(cp) = log.read_checkpoint(idx)? else {
            debug!(slot = idx, "log.checkpoint.slot_invalid");
            continue;
        };
        match log.lsn_to_offset(cp.lsn) {
            Ok(offset) if offset == cp.file_offset => {}
            _ => {
                warn!(slot = idx, lsn = cp.lsn.0, "log.checkpoint.offset_mismatch");
                continue;
            }
        }
        let better = match &best {
            None => true,
            Some(cur) => (cp.lsn, cp.checkpoint_no) > (cur.lsn, cur.checkpoint_no),
        };
        if better {
            best = Some(cp);
        }
    }
    let cp = best.ok_or(RedoError::NoValidCheckpoint)?;
    debug!(
        checkpoint_no = cp.checkpoint_no,
        lsn = cp.lsn.0,
        end_lsn = cp.end_lsn.0,
        "log.checkpoint.found"
    );
    Ok(cp)
}

/// Evidence collected by the scan that decides whether the checkpoint is
/// usable.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanEvidence {
    /// End of the last complete mini-transaction.
    pub scanned_lsn: Lsn,
    /// End LSN of the FILE_CHECKPOINT marker naming the checkpoint LSN.
    pub marker_end: Option<Lsn>,
    /// A checksummed mini-transaction failed to parse.
    pub found_corrupt_log: bool,
}

/// Confirms the scan reached the point the checkpoint promises. Returns the
/// reason the database cannot be called consistent otherwise.
pub fn validate_checkpoint(
    cp: &Checkpoint,
    evidence: &ScanEvidence,
) -> std::result::Result<(), &'static str> {
    if evidence.found_corrupt_log {
        return Err("corrupt redo log before the end of the log");
    }
    if evidence.marker_end.is_none() {
        return Err("checkpoint marker not found in the redo log");
    }
    if evidence.scanned_lsn < cp.end_lsn {
        return Err("redo log ends before the checkpoint marker");
    }
    Ok(())
}

/// Preflush and checkpoint thresholds derived from the log capacity.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LogCapacity {
    /// Usable log bytes.
    pub capacity: u64,
    /// Checkpoint age beyond which dirty pages are flushed in the background.
    pub max_modified_age_async: u64,
    /// Checkpoint age beyond which writers flush synchronously.
    pub max_modified_age_sync: u64,
    /// Age beyond which a checkpoint is requested.
    pub max_checkpoint_age_async: u64,
    /// Age beyond which writers wait for a checkpoint.
    pub max_checkpoint_age: u64,
}

const PREFLUSH_RATIO_ASYNC: u64 = 8;
const PREFLUSH_RATIO_SYNC: u64 = 16;
const CHECKPOINT_RATIO_ASYNC: u64 = 32;

impl LogCapacity {
    /// Derives margins from the size of the log stream in bytes.
    pub fn new(log_bytes: u64) -> Self {
        let smallest = log_bytes - log_bytes / 10;
        let margin = smallest - smallest / 10;
        Self {
            capacity: smallest,
            max_modified_age_async: margin - margin / PREFLUSH_RATIO_ASYNC,
            max_modified_age_sync: margin - margin / PREFLUSH_RATIO_SYNC,
            max_checkpoint_age_async: margin - margin / CHECKPOINT_RATIO_ASYNC,
            max_checkpoint_age: margin,
        }
    }
}

/// How urgently a checkpoint is needed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CheckpointUrgency {
    /// Nothing to do.
    None,
    /// Write a checkpoint soon.
    Async,
    /// Writers must wait for a checkpoint.
    Sync,
}

/// What [`CheckpointLedger::margin`] recommends.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MarginAdvice {
    /// Flush pages older than this LSN; `true` means flush synchronously.
    pub preflush: Option<(Lsn, bool)>,
    /// Checkpoint pressure.
    pub checkpoint: CheckpointUrgency,
}

/// Tracks the current checkpoint and enforces that checkpoints only move
/// forward and never pass an unflushed change.
#[derive(Debug)]
pub struct CheckpointLedger {
    current: Checkpoint,
    capacity: LogCapacity,
}

impl CheckpointLedger {
    /// Ledger starting from an existing checkpoint.
    pub fn new(current: Checkpoint, capacity: LogCapacity) -> Self {
        Self { current, capacity }
    }

    /// The latest accepted checkpoint.
    pub fn current(&self) -> Checkpoint {
        self.current
    }

    /// Capacity thresholds in use.
    pub fn capacity(&self) -> LogCapacity {
        self.capacity
    }

    /// Number for the next checkpoint.
    pub fn next_checkpoint_no(&self) -> u64 {
        self.current.checkpoint_no + 1
    }

    /// Checks that a checkpoint at `lsn` is allowed.
    pub fn check(&self, lsn: Lsn, oldest_modification: Option<Lsn>) -> Result<()> {
        if lsn < self.current.lsn {
            return Err(RedoError::CheckpointRegression {
                current: self.current.lsn,
                new: lsn,
            });
        }
        if let Some(oldest) = oldest_modification {
            if lsn > oldest {
                return Err(RedoError::CheckpointAhead { lsn, oldest });
            }
        }
        Ok(())
    }

    /// Records a checkpoint that has been checked and persisted.
    pub fn accept(&mut self, cp: Checkpoint, oldest_modification: Option<Lsn>) -> Result<()> {
        self.check(cp.lsn, oldest_modification)?;
        if cp.checkpoint_no <= self.current.checkpoint_no {
            return Err(RedoError::Invalid("checkpoint number must increase"));
        }
        self.current = cp;
        Ok(())
    }

    /// Compares the log age against the capacity margins.
    ///
    /// `oldest_modification` falls back to `current_lsn` when the pool is
    /// clean, which yields no preflush.
    pub fn margin(&self, current_lsn: Lsn, oldest_modification: Option<Lsn>) -> MarginAdvice {
        let oldest = oldest_modification.unwrap_or(current_lsn);
        let age = current_lsn.0.saturating_sub(oldest.0);
        let preflush = if age > self.capacity.max_modified_age_sync {
            Some((
                Lsn(current_lsn.0 - self.capacity.max_modified_age_sync),
                true,
            ))
        } else if age > self.capacity.max_modified_age_async {
            Some((
                Lsn(current_lsn.0 - self.capacity.max_modified_age_async),
                false,
            ))
        } else {
            None
        };
        let checkpoint_age = current_lsn.0.saturating_sub(self.current.lsn.0);
        let checkpoint = if checkpoint_age > self.capacity.max_checkpoint_age {
            CheckpointUrgency::Sync
        } else if checkpoint_age > self.capacity.max_checkpoint_age_async {
            CheckpointUrgency::Async
        } else {
            CheckpointUrgency::None
        };
        MarginAdvice {
            preflush,
            checkpoint,
        }
    }
}

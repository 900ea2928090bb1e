#![forbid(unsafe_code)]
//! Append side of the redo log: LSN assignment, write-ahead flushing and
//! checkpoints.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::file::LogFile;
use super::mtr::encode_mtr;
use super::record::{FileOp, LogRecord};
use crate::buffer::{BufferPool, RedoLogHandle};
use crate::checkpoint::{
    Checkpoint, CheckpointLedger, CheckpointUrgency, DirtyPages, LogCapacity,
};
use crate::types::{Lsn, RedoError, Result};

/// Default log capacity used for the flush margins.
pub const DEFAULT_LOG_CAPACITY: u64 = 96 << 20;

/// Tuning for a [`RedoLog`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Bytes of log the margins are computed from.
    pub capacity_bytes: u64,
    /// Sync the log file after every append.
    pub sync_on_append: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_LOG_CAPACITY,
            sync_on_append: false,
        }
    }
}

#[derive(Debug)]
struct LogState {
    lsn: Lsn,
    flushed_lsn: Lsn,
}

/// Counters exposed for tests and reports.
#[derive(Default, Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct LogStats {
    /// Mini-transactions appended.
    pub appends: u64,
    /// Log file syncs issued by `flush_up_to`.
    pub syncs: u64,
    /// Checkpoints written.
    pub checkpoints: u64,
}

/// The redo log an engine appends mini-transactions to.
pub struct RedoLog {
    file: Arc<LogFile>,
    state: Mutex<LogState>,
    flush_lock: Mutex<()>,
    checkpoint_lock: Mutex<()>,
    /// Held shared from append until the pages are on the flush list.
    flush_order: RwLock<()>,
    ledger: Mutex<CheckpointLedger>,
    options: LogOptions,
    stats: Mutex<LogStats>,
}

fn checkpoint_marker(lsn: Lsn, seq_bit: u8) -> Result<Vec<u8>> {
    encode_mtr(&[LogRecord::File(FileOp::Checkpoint(lsn))], seq_bit)
}

impl RedoLog {
    /// Starts a fresh log: writes the first checkpoint marker and
    /// checkpoint number 1.
    pub fn create(file: Arc<LogFile>, options: LogOptions) -> Result<Self> {
        let start = file.start_lsn();
        let marker = checkpoint_marker(start, file.seq_bit())?;
        file.append(start, &marker)?;
        file.sync()?;
        let end = start.advance(marker.len() as u64);
        let cp = Checkpoint {
            checkpoint_no: 1,
            lsn: start,
            file_offset: file.lsn_to_offset(start)?,
            end_lsn: end,
        };
        file.write_checkpoint(&cp)?;
        info!(lsn = start.0, end_lsn = end.0, "log.create");
        Ok(Self::with_state(file, end, cp, options))
    }

    /// Continues an existing log whose valid stream ends at `end_lsn`.
    pub fn open(
        file: Arc<LogFile>,
        end_lsn: Lsn,
        checkpoint: Checkpoint,
        options: LogOptions,
    ) -> Result<Self> {
        if end_lsn < checkpoint.end_lsn {
            return Err(RedoError::Invalid("log end precedes the checkpoint"));
        }
        debug!(end_lsn = end_lsn.0, checkpoint = checkpoint.lsn.0, "log.open");
        Ok(Self::with_state(file, end_lsn, checkpoint, options))
    }

    fn with_state(file: Arc<LogFile>, lsn: Lsn, cp: Checkpoint, options: LogOptions) -> Self {
        let capacity = LogCapacity::new(options.capacity_bytes);
        Self {
            file,
            state: Mutex::new(LogState {
                lsn,
                flushed_lsn: lsn,
            }),
            flush_lock: Mutex::new(()),
            checkpoint_lock: Mutex::new(()),
            flush_order: RwLock::new(()),
            ledger: Mutex::new(CheckpointLedger::new(cp, capacity)),
            options,
            stats: Mutex::new(LogStats::default()),
        }
    }

    /// Underlying log file.
    pub fn file(&self) -> &Arc<LogFile> {
        &self.file
    }

    /// Sequence bit to terminate mini-transactions with.
    pub fn seq_bit(&self) -> u8 {
        self.file.seq_bit()
    }

    /// LSN the next append will receive.
    pub fn current_lsn(&self) -> Lsn {
        self.state.lock().lsn
    }

    /// Highest LSN known durable.
    pub fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed_lsn
    }

    /// Latest persisted checkpoint.
    pub fn last_checkpoint(&self) -> Checkpoint {
        self.ledger.lock().current()
    }

    /// Flush and checkpoint thresholds.
    pub fn capacity(&self) -> LogCapacity {
        self.ledger.lock().capacity()
    }

    /// Counters since open.
    pub fn stats(&self) -> LogStats {
        *self.stats.lock()
    }

    /// Keeps a checkpoint from being computed between an append and the
    /// matching [`BufferPool::note_modification`] calls.
    pub fn flush_order(&self) -> RwLockReadGuard<'_, ()> {
        self.flush_order.read()
    }

    /// Appends an encoded mini-transaction and returns its LSN range.
    pub fn append(&self, bytes: &[u8]) -> Result<(Lsn, Lsn)> {
        if bytes.is_empty() {
            return Err(RedoError::Invalid("empty log append"));
        }
        let (start, end) = {
            let mut state = self.state.lock();
            let start = state.lsn;
            self.file.append(start, bytes)?;
            state.lsn = start.advance(bytes.len() as u64);
            (start, state.lsn)
        };
        self.stats.lock().appends += 1;
        if self.options.sync_on_append {
            self.flush_up_to(end)?;
        }
        Ok((start, end))
    }

    /// Makes the log durable at least up to `lsn`.
    pub fn flush_up_to(&self, lsn: Lsn) -> Result<()> {
        if self.state.lock().flushed_lsn >= lsn {
            return Ok(());
        }
        let _flush = self.flush_lock.lock();
        let target = {
            let state = self.state.lock();
            if state.flushed_lsn >= lsn {
                return Ok(());
            }
            state.lsn
        };
        self.file.sync()?;
        let mut state = self.state.lock();
        if target > state.flushed_lsn {
            state.flushed_lsn = target;
        }
        drop(state);
        self.stats.lock().syncs += 1;
        Ok(())
    }

    /// Writes a checkpoint at the oldest modification still dirty in
    /// `pages`, or at the current LSN when nothing is dirty.
    ///
    /// A FILE_CHECKPOINT marker naming the checkpoint LSN is appended and
    /// synced before the slot is written, so recovery can confirm the log
    /// reaches past it.
    pub fn checkpoint(&self, pages: &dyn DirtyPages) -> Result<Checkpoint> {
        let _serial = self.checkpoint_lock.lock();
        let (oldest, current) = {
            let _order = self.flush_order.write();
            (pages.oldest_modification(), self.current_lsn())
        };
        let lsn = oldest.unwrap_or(current);
        let next_no = {
            let ledger = self.ledger.lock();
            ledger.check(lsn, oldest)?;
            if ledger.current().lsn == lsn {
                return Ok(ledger.current());
            }
            ledger.next_checkpoint_no()
        };
        let marker = checkpoint_marker(lsn, self.seq_bit())?;
        let (_, end) = self.append(&marker)?;
        self.flush_up_to(end)?;
        let cp = Checkpoint {
            checkpoint_no: next_no,
            lsn,
            file_offset: self.file.lsn_to_offset(lsn)?,
            end_lsn: end,
        };
        self.file.write_checkpoint(&cp)?;
        self.ledger.lock().accept(cp, oldest)?;
        self.stats.lock().checkpoints += 1;
        info!(
            checkpoint_no = cp.checkpoint_no,
            lsn = lsn.0,
            end_lsn = end.0,
            "log.checkpoint"
        );
        Ok(cp)
    }

    /// Keeps the log within its capacity before a writer starts a new
    /// mini-transaction: requests preflushing when dirty pages are too old
    /// and writes a checkpoint when the checkpoint lags too far.
    pub fn free_check(&self, pool: &BufferPool) -> Result<()> {
        let current = self.current_lsn();
        let advice = self.ledger.lock().margin(current, pool.oldest_modification());
        if let Some((lsn, sync)) = advice.preflush {
            debug!(lsn = lsn.0, sync, "log.free_check.preflush");
            pool.ahead(lsn, sync);
            if sync {
                pool.flush_until(lsn)?;
            }
        }
        if advice.checkpoint != CheckpointUrgency::None {
            self.checkpoint(pool)?;
        }
        Ok(())
    }
}

impl RedoLogHandle for RedoLog {
    fn current_lsn(&self) -> Lsn {
        RedoLog::current_lsn(self)
    }

    fn flush_up_to(&self, lsn: Lsn) -> Result<()> {
        RedoLog::flush_up_to(self, lsn)
    }

    fn capacity(&self) -> LogCapacity {
        RedoLog::capacity(self)
    }
}

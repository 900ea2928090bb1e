use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_data_dir;
use crate::admin::Result;
use crate::checkpoint::{find_checkpoint, Checkpoint, LogCapacity};
use crate::log::file::LogHeader;
use crate::log::LogFile;
use crate::types::{Lsn, RedoError};

/// Contents of one checkpoint slot.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSlotReport {
    /// Slot index.
    pub slot: usize,
    /// The checkpoint stored there, if the slot is valid.
    pub checkpoint: Option<Checkpoint>,
}

/// Report describing the redo log header and its checkpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    /// Log file header.
    pub header: LogHeader,
    /// End of the log stream in the file.
    pub log_end_lsn: Lsn,
    /// Every slot.
    pub slots: Vec<CheckpointSlotReport>,
    /// Checkpoint recovery would start from; `None` when no slot is valid.
    pub selected: Option<Checkpoint>,
    /// Bytes of log between the selected checkpoint and the end of file.
    pub checkpoint_age: Option<u64>,
    /// Flush and checkpoint thresholds for the configured capacity.
    pub capacity: LogCapacity,
}

/// Reads the checkpoint slots of a data directory's redo log.
///
/// # Errors
///
/// Returns an error if the directory or its log cannot be opened.
pub fn checkpoint_info(dir: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<CheckpointReport> {
    let data = open_data_dir(dir.as_ref(), opts, true)?;
    let log: &LogFile = &data.log;
    let mut slots = Vec::with_capacity(LogFile::CHECKPOINT_SLOTS);
    for slot in 0..LogFile::CHECKPOINT_SLOTS {
        slots.push(CheckpointSlotReport {
            slot,
            checkpoint: log.read_checkpoint(slot)?,
        });
    }
    let selected = match find_checkpoint(log) {
        Ok(cp) => Some(cp),
        Err(RedoError::NoValidCheckpoint) => None,
        Err(err) => return Err(err.into()),
    };
    let log_end_lsn = log.end_lsn()?;
    Ok(CheckpointReport {
        header: log.header(),
        log_end_lsn,
        slots,
        selected,
        checkpoint_age: selected.map(|cp| log_end_lsn.0.saturating_sub(cp.lsn.0)),
        capacity: LogCapacity::new(opts.log.capacity_bytes),
    })
}

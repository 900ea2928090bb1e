use serde::{Deserialize, Serialize};

use crate::buffer::{BufferPoolOptions, FlushOptions};
use crate::log::LogOptions;
use crate::recovery::RecoveryOptions;
use crate::storage::doublewrite::DEFAULT_DOUBLEWRITE_SLOTS;
use crate::types::page::DEFAULT_PAGE_SIZE;

/// Options used when opening a data directory for administrative commands.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminOpenOptions {
    /// Page size of every tablespace in the directory.
    pub page_size: usize,
    /// Page slots in the doublewrite file; 0 disables doublewrite.
    pub doublewrite_slots: u32,
    /// Redo log tuning.
    pub log: LogOptions,
    /// Buffer pool sizing.
    pub pool: BufferPoolOptions,
    /// Page cleaner tuning.
    pub flush: FlushOptions,
    /// Recovery tuning.
    pub recovery: RecoveryOptions,
}

impl Default for AdminOpenOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            doublewrite_slots: DEFAULT_DOUBLEWRITE_SLOTS,
            log: LogOptions::default(),
            pool: BufferPoolOptions::default(),
            flush: FlushOptions::default(),
            recovery: RecoveryOptions::default(),
        }
    }
}

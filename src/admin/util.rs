use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::log::LogFile;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::recovery::RecoveryEnv;
use crate::storage::{Doublewrite, DoublewriteBuffer, FileStorage};

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;

/// File name of the redo log inside a data directory.
pub const LOG_FILE_NAME: &str = "ib_logfile0";
/// File name of the doublewrite area inside a data directory.
pub const DOUBLEWRITE_FILE_NAME: &str = "ib_doublewrite";

/// Everything opened from one data directory.
pub struct DataDir {
    /// Tablespace files.
    pub storage: Arc<FileStorage>,
    /// Redo log.
    pub log: Arc<LogFile>,
    /// Doublewrite area, when enabled.
    pub doublewrite: Option<Arc<dyn DoublewriteBuffer>>,
}

impl DataDir {
    /// Builds a recovery environment over a fresh buffer pool.
    pub fn env(&self, opts: &AdminOpenOptions) -> Result<RecoveryEnv> {
        let pool = BufferPool::new(
            self.storage.clone(),
            self.doublewrite.clone(),
            opts.pool.clone(),
        )?;
        Ok(RecoveryEnv {
            log: Arc::clone(&self.log),
            pool: Arc::new(pool),
            dir: self.storage.clone(),
        })
    }
}

pub(crate) fn log_path(dir: &Path) -> PathBuf {
    dir.join(LOG_FILE_NAME)
}

pub(crate) fn doublewrite_path(dir: &Path) -> PathBuf {
    dir.join(DOUBLEWRITE_FILE_NAME)
}

/// Opens an initialized data directory.
///
/// # Errors
///
/// Returns [`AdminError::MissingDataDir`] when the directory has no redo
/// log, and core errors when a file cannot be opened or parsed.
pub fn open_data_dir(dir: &Path, opts: &AdminOpenOptions, read_only: bool) -> Result<DataDir> {
    let log_file = log_path(dir);
    if !log_file.is_file() {
        return Err(AdminError::missing_data_dir(dir));
    }
    let storage = Arc::new(FileStorage::open(dir, opts.page_size, read_only)?);
    let log_io: Arc<dyn FileIo> = Arc::new(StdFileIo::open_existing(&log_file, read_only)?);
    let log = Arc::new(LogFile::open(log_io)?);
    let doublewrite = open_doublewrite(dir, opts, read_only)?;
    Ok(DataDir {
        storage,
        log,
        doublewrite,
    })
}

fn open_doublewrite(
    dir: &Path,
    opts: &AdminOpenOptions,
    read_only: bool,
) -> Result<Option<Arc<dyn DoublewriteBuffer>>> {
    if opts.doublewrite_slots == 0 {
        return Ok(None);
    }
    let path = doublewrite_path(dir);
    let io: Arc<dyn FileIo> = if read_only {
        if !path.is_file() {
            return Ok(None);
        }
        Arc::new(StdFileIo::open_existing(&path, true)?)
    } else {
        Arc::new(StdFileIo::open(&path)?)
    };
    let dw = Doublewrite::new(io, opts.page_size, opts.doublewrite_slots)?;
    Ok(Some(Arc::new(dw)))
}

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;
use crate::admin::util::{ensure_dir, log_path};
use crate::buffer::BufferPool;
use crate::checkpoint::Checkpoint;
use crate::log::{LogFile, Mtr, RedoLog, DEFAULT_START_LSN};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::storage::{FileStorage, TablespaceDirectory};
use crate::types::SpaceId;

/// A tablespace to create while initializing a data directory.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SpaceSpec {
    /// Tablespace id.
    pub space: SpaceId,
    /// File name inside the data directory.
    pub name: String,
}

/// Report generated after initializing a data directory.
#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    /// The data directory.
    pub dir: PathBuf,
    /// Page size the directory was formatted for.
    pub page_size: usize,
    /// First checkpoint of the new log.
    pub checkpoint: Checkpoint,
    /// Tablespaces created.
    pub spaces: Vec<SpaceSpec>,
}

/// Creates a data directory with an empty redo log and the given
/// tablespaces. Tablespace creation is logged like any other file
/// operation.
///
/// # Errors
///
/// Fails with [`AdminError::AlreadyInitialized`] when the directory already
/// has a redo log.
pub fn init(dir: impl AsRef<Path>, opts: &AdminOpenOptions, spaces: &[SpaceSpec]) -> Result<InitReport> {
    let dir = dir.as_ref();
    ensure_dir(dir)?;
    let path = log_path(dir);
    if path.exists() {
        return Err(AdminError::AlreadyInitialized(dir.to_path_buf()));
    }
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path)?);
    let file = Arc::new(LogFile::create(io, DEFAULT_START_LSN)?);
    let redo = RedoLog::create(file, opts.log.clone())?;

    let storage = Arc::new(FileStorage::open(dir, opts.page_size, false)?);
    if !spaces.is_empty() {
        let pool = BufferPool::new(storage.clone(), None, opts.pool.clone())?;
        let mut mtr = Mtr::new();
        for spec in spaces {
            mtr.file_create(spec.space, &spec.name);
        }
        let lsns = mtr.commit(&redo, &pool)?;
        redo.flush_up_to(lsns.end)?;
        for spec in spaces {
            storage.create(spec.space, &spec.name)?;
        }
    }
    let checkpoint = redo.last_checkpoint();
    info!(dir = %dir.display(), spaces = spaces.len(), "admin.init");
    Ok(InitReport {
        dir: dir.to_path_buf(),
        page_size: opts.page_size,
        checkpoint,
        spaces: spaces.to_vec(),
    })
}

#![forbid(unsafe_code)]

//! Data-directory administration.
//!
//! A data directory holds the redo log (`ib_logfile0`), the doublewrite
//! area (`ib_doublewrite`) and one `*.ibd` file per tablespace. The
//! functions here open it, run recovery or inspect the log, and return
//! serializable reports for the CLI.

mod checkpoint;
mod error;
mod init;
mod options;
mod pending;
mod recover;
mod util;

/// Inspection of the log header and checkpoint slots.
pub use checkpoint::{checkpoint_info, CheckpointReport, CheckpointSlotReport};

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Creating a data directory.
pub use init::{init, InitReport, SpaceSpec};

/// Configuration options for opening a data directory.
pub use options::AdminOpenOptions;

/// Pending redo record dump.
pub use pending::pending;

/// Crash recovery of a data directory.
pub use recover::recover;

/// Opening the files of a data directory.
pub use util::{open_data_dir, DataDir, DOUBLEWRITE_FILE_NAME, LOG_FILE_NAME};

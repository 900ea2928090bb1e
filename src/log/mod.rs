//! Redo log: record codec, mini-transactions, the log file, the scanner
//! used by recovery and the append path used by a running engine.

/// Log file header, checkpoint slots and stream addressing.
pub mod file;
/// Mini-transaction framing and the commit path.
pub mod mtr;
/// Redo record codec.
pub mod record;
/// Incremental mini-transaction scanner.
pub mod scanner;
/// LSN assignment, log flushing and checkpoints.
pub mod writer;

pub use file::{LogFile, DEFAULT_START_LSN};
pub use mtr::{encode_mtr, Mtr, MtrLsns};
pub use record::{ExtendedOp, FileOp, LogRecord, PageOp};
pub use scanner::{LogScanner, ParsedMtr, ScanStep};
pub use writer::{LogOptions, RedoLog};

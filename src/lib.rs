//! Redo-log crash recovery and buffer-pool flush coordination for a paged
//! storage engine.
//!
//! Writers describe page changes as mini-transactions appended to a
//! circular redo log ([`log`]). The buffer pool ([`buffer`]) flushes dirty
//! pages in oldest-modification order so checkpoints ([`checkpoint`]) can
//! advance, and after a crash [`recovery`] replays the log from the newest
//! valid checkpoint onto the pages in [`storage`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
pub mod buffer;
pub mod checkpoint;
pub mod log;
pub mod primitives;
pub mod recovery;
pub mod storage;
pub mod types;

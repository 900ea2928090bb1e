//! Low-level building blocks: byte codecs, positioned file I/O and
//! wait primitives.

/// Varints, relative offsets and big-endian accessors.
pub mod bytes;

/// Manual-reset events used by flush and recovery waits.
pub mod concurrency;

/// Positioned file I/O (`FileIo`) with std-file and in-memory backends.
pub mod io;

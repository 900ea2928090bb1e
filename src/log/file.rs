#![forbid(unsafe_code)]
//! Redo log file layout.
//!
//! The first 2048 bytes hold the file header and the two checkpoint slots;
//! the log stream follows, with byte `n` of the stream holding LSN
//! `start_lsn + n`.

use std::ops::Range;
use std::sync::Arc;

use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, CHECKPOINT_SLOT_LEN};
use crate::primitives::bytes::be;
use crate::primitives::io::{is_eof, FileIo};
use crate::types::checksum::crc32;
use crate::types::{Lsn, RedoError, Result};

/// Size of the region before the log stream.
pub const LOG_HEADER_REGION: u64 = 2048;
/// Bytes covered by the file header block.
pub const LOG_HEADER_LEN: usize = 512;
/// LSN of the first stream byte in a fresh log.
pub const DEFAULT_START_LSN: Lsn = Lsn(8192);

const LOG_MAGIC: [u8; 4] = *b"RDLG";
const LOG_VERSION: u32 = 1;
const CHECKPOINT_SLOT_OFFSETS: [u64; 2] = [512, 1536];

mod hdr {
    use super::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const VERSION: usize = 4;
    pub const START_LSN: usize = 8;
    pub const SEQ_BIT: usize = 16;
    pub const SALT: usize = 24;
    pub const CRC: usize = 32;
    pub const END: usize = 36;
}

/// Decoded file header.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LogHeader {
    /// LSN of the first stream byte.
    pub start_lsn: Lsn,
    /// Terminator bit every mini-transaction of this log generation carries.
    pub seq_bit: u8,
    /// Random value identifying the log generation.
    pub salt: u64,
}

impl LogHeader {
    fn encode(&self) -> [u8; LOG_HEADER_LEN] {
        let mut buf = [0u8; LOG_HEADER_LEN];
        buf[hdr::MAGIC].copy_from_slice(&LOG_MAGIC);
        be::put_u32(&mut buf, hdr::VERSION, LOG_VERSION);
        be::put_u64(&mut buf, hdr::START_LSN, self.start_lsn.0);
        buf[hdr::SEQ_BIT] = self.seq_bit;
        be::put_u64(&mut buf, hdr::SALT, self.salt);
        let crc = crc32(&buf[..hdr::CRC]);
        be::put_u32(&mut buf, hdr::CRC, crc);
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < hdr::END {
            return Err(RedoError::Corruption("log header truncated"));
        }
        if src[hdr::MAGIC] != LOG_MAGIC {
            return Err(RedoError::Corruption("log header magic mismatch"));
        }
        if be::get_u32(src, hdr::CRC) != crc32(&src[..hdr::CRC]) {
            return Err(RedoError::Corruption("log header checksum mismatch"));
        }
        if be::get_u32(src, hdr::VERSION) != LOG_VERSION {
            return Err(RedoError::Invalid("unsupported log format version"));
        }
        let seq_bit = src[hdr::SEQ_BIT];
        if seq_bit > 1 {
            return Err(RedoError::Corruption("log header sequence bit out of range"));
        }
        Ok(Self {
            start_lsn: Lsn(be::get_u64(src, hdr::START_LSN)),
            seq_bit,
            salt: be::get_u64(src, hdr::SALT),
        })
    }
}

/// Redo log file: header, checkpoint slots and the append-only stream.
pub struct LogFile {
    io: Arc<dyn FileIo>,
    header: LogHeader,
}

impl LogFile {
    /// Number of checkpoint slots.
    pub const CHECKPOINT_SLOTS: usize = CHECKPOINT_SLOT_OFFSETS.len();

    /// Formats `io` as an empty log starting at `start_lsn`.
    ///
    /// When `io` already holds a log, the new generation flips its sequence
    /// bit so mini-transactions left from the old one never parse.
    pub fn create(io: Arc<dyn FileIo>, start_lsn: Lsn) -> Result<Self> {
        if start_lsn.is_zero() {
            return Err(RedoError::Invalid("log start LSN must be non-zero"));
        }
        let previous = Self::read_header(io.as_ref()).ok();
        let seq_bit = previous.map_or(1, |h| h.seq_bit ^ 1);
        let header = LogHeader {
            start_lsn,
            seq_bit,
            salt: OsRng.next_u64(),
        };
        io.truncate(0)?;
        let mut region = vec![0u8; LOG_HEADER_REGION as usize];
        region[..LOG_HEADER_LEN].copy_from_slice(&header.encode());
        io.write_at(0, &region)?;
        io.sync_all()?;
        info!(start_lsn = start_lsn.0, seq_bit, "log.file.created");
        Ok(Self { io, header })
    }

    /// Opens an existing log.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let header = Self::read_header(io.as_ref())?;
        if io.len()? < LOG_HEADER_REGION {
            return Err(RedoError::Corruption("log file shorter than its header region"));
        }
        debug!(
            start_lsn = header.start_lsn.0,
            seq_bit = header.seq_bit,
            "log.file.opened"
        );
        Ok(Self { io, header })
    }

    fn read_header(io: &dyn FileIo) -> Result<LogHeader> {
        let mut buf = [0u8; hdr::END];
        match io.read_at(0, &mut buf) {
            Ok(()) => LogHeader::decode(&buf),
            Err(err) if is_eof(&err) => Err(RedoError::Corruption("log header truncated")),
            Err(err) => Err(err),
        }
    }

    /// The decoded header.
    pub fn header(&self) -> LogHeader {
        self.header
    }

    /// LSN of the first stream byte.
    pub fn start_lsn(&self) -> Lsn {
        self.header.start_lsn
    }

    /// Sequence bit of this log generation.
    pub fn seq_bit(&self) -> u8 {
        self.header.seq_bit
    }

    /// File offset holding `lsn`.
    pub fn lsn_to_offset(&self, lsn: Lsn) -> Result<u64> {
        if lsn < self.header.start_lsn {
            return Err(RedoError::Invalid("LSN precedes the start of the log"));
        }
        Ok(LOG_HEADER_REGION + (lsn.0 - self.header.start_lsn.0))
    }

    /// LSN just past the last stream byte in the file.
    pub fn end_lsn(&self) -> Result<Lsn> {
        let len = self.io.len()?.max(LOG_HEADER_REGION);
        Ok(self.header.start_lsn.advance(len - LOG_HEADER_REGION))
    }

    /// Reads checkpoint slot `slot`; `None` when it holds no valid
    /// checkpoint.
    pub fn read_checkpoint(&self, slot: usize) -> Result<Option<Checkpoint>> {
        let offset = *CHECKPOINT_SLOT_OFFSETS
            .get(slot)
            .ok_or(RedoError::Invalid("checkpoint slot out of range"))?;
        let mut buf = [0u8; CHECKPOINT_SLOT_LEN];
        match self.io.read_at(offset, &mut buf) {
            Ok(()) => Ok(Checkpoint::decode(&buf)),
            Err(err) if is_eof(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Persists `cp` into its slot.
    pub fn write_checkpoint(&self, cp: &Checkpoint) -> Result<()> {
        let offset = CHECKPOINT_SLOT_OFFSETS[cp.slot()];
        self.io.write_at(offset, &cp.encode())?;
        self.io.sync_all()
    }

    /// Writes `bytes` at `lsn`.
    pub fn append(&self, lsn: Lsn, bytes: &[u8]) -> Result<()> {
        let offset = self.lsn_to_offset(lsn)?;
        self.io.write_at(offset, bytes)
    }

    /// Reads up to `max` stream bytes starting at `lsn`; shorter (possibly
    /// empty) at the end of the file.
    pub fn read_stream(&self, lsn: Lsn, max: usize) -> Result<Vec<u8>> {
        let offset = self.lsn_to_offset(lsn)?;
        let len = self.io.len()?;
        let available = len.saturating_sub(offset).min(max as u64) as usize;
        let mut buf = vec![0u8; available];
        if available > 0 {
            self.io.read_at(offset, &mut buf)?;
        }
        Ok(buf)
    }

    /// Drops every stream byte at or after `lsn`.
    pub fn truncate_after(&self, lsn: Lsn) -> Result<()> {
        let offset = self.lsn_to_offset(lsn)?;
        if self.io.len()? > offset {
            debug!(lsn = lsn.0, "log.file.truncate");
            self.io.truncate(offset)?;
        }
        Ok(())
    }

    /// Makes written bytes durable.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }
}

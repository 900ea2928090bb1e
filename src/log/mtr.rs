//! Mini-transactions: the atomic unit of redo logging.
//!
//! On disk a mini-transaction is its records, a terminator byte holding the
//! log sequence bit, and a big-endian CRC-32 of everything before the CRC.

use std::collections::BTreeMap;

use tracing::trace;

use super::record::{self, ExtendedOp, FileOp, LogRecord, PageOp, RecordContext};
use super::writer::RedoLog;
use crate::buffer::{BufferPool, PageGuard};
use crate::types::checksum::crc32;
use crate::types::page;
use crate::types::{Lsn, PageId, RedoError, Result, SpaceId};

/// Bytes added after the records: terminator plus CRC.
pub const MTR_TRAILER_LEN: usize = 5;

/// Encodes records as one mini-transaction.
pub fn encode_mtr(records: &[LogRecord], seq_bit: u8) -> Result<Vec<u8>> {
    if records.is_empty() {
        return Err(RedoError::Invalid("mini-transaction without records"));
    }
    if seq_bit > 1 {
        return Err(RedoError::Invalid("sequence bit must be 0 or 1"));
    }
    let mut out = Vec::new();
    let mut ctx = RecordContext::new();
    for rec in records {
        record::encode(rec, &mut ctx, &mut out)?;
    }
    out.push(seq_bit);
    let crc = crc32(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// LSN range occupied by a committed mini-transaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MtrLsns {
    /// LSN of the first byte.
    pub start: Lsn,
    /// LSN just past the CRC.
    pub end: Lsn,
}

/// Collects redo records for one atomic change.
#[derive(Default, Debug, Clone)]
pub struct Mtr {
    records: Vec<LogRecord>,
}

impl Mtr {
    /// Creates an empty mini-transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records collected so far.
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Returns true when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Appends an arbitrary record.
    pub fn push(&mut self, record: LogRecord) -> &mut Self {
        self.records.push(record);
        self
    }

    fn page_op(&mut self, page: PageId, op: PageOp) -> &mut Self {
        self.push(LogRecord::Page { page, op })
    }

    /// Copies `data` to `offset` of `page`.
    pub fn write(&mut self, page: PageId, offset: u32, data: &[u8]) -> &mut Self {
        self.page_op(
            page,
            PageOp::Write {
                offset,
                data: data.to_vec(),
            },
        )
    }

    /// Fills `len` bytes of `page` at `offset` with `pattern`.
    pub fn memset(&mut self, page: PageId, offset: u32, len: u32, pattern: &[u8]) -> &mut Self {
        self.page_op(
            page,
            PageOp::Memset {
                offset,
                len,
                pattern: pattern.to_vec(),
            },
        )
    }

    /// Moves `len` bytes within `page` from `source` to `offset`.
    pub fn memmove(&mut self, page: PageId, offset: u32, source: u32, len: u32) -> &mut Self {
        self.page_op(page, PageOp::Memmove { offset, len, source })
    }

    /// Initializes `page` from scratch.
    pub fn init_page(&mut self, page: PageId) -> &mut Self {
        self.page_op(page, PageOp::InitPage)
    }

    /// Frees `page`.
    pub fn free_page(&mut self, page: PageId) -> &mut Self {
        self.page_op(page, PageOp::FreePage)
    }

    /// Formats `page` as an empty undo page.
    pub fn undo_init(&mut self, page: PageId) -> &mut Self {
        self.page_op(page, PageOp::Extended(ExtendedOp::UndoInit))
    }

    /// Appends an undo record to `page`.
    pub fn undo_append(&mut self, page: PageId, data: &[u8]) -> &mut Self {
        self.page_op(page, PageOp::Extended(ExtendedOp::UndoAppend(data.to_vec())))
    }

    /// Logs the creation of a tablespace.
    pub fn file_create(&mut self, space: SpaceId, name: &str) -> &mut Self {
        self.push(LogRecord::File(FileOp::Create {
            space,
            name: name.to_owned(),
        }))
    }

    /// Logs the removal of a tablespace.
    pub fn file_delete(&mut self, space: SpaceId, name: &str) -> &mut Self {
        self.push(LogRecord::File(FileOp::Delete {
            space,
            name: name.to_owned(),
        }))
    }

    /// Logs a tablespace rename.
    pub fn file_rename(&mut self, space: SpaceId, from: &str, to: &str) -> &mut Self {
        self.push(LogRecord::File(FileOp::Rename {
            space,
            from: from.to_owned(),
            to: to.to_owned(),
        }))
    }

    /// Logs the first modification of a tablespace after a checkpoint.
    pub fn file_modify(&mut self, space: SpaceId, name: &str) -> &mut Self {
        self.push(LogRecord::File(FileOp::Modify {
            space,
            name: name.to_owned(),
        }))
    }

    /// Encodes the records with the given sequence bit.
    pub fn encode(&self, seq_bit: u8) -> Result<Vec<u8>> {
        encode_mtr(&self.records, seq_bit)
    }

    /// Applies the page records to buffer-pool pages, appends the
    /// mini-transaction to the log and marks the pages dirty.
    ///
    /// Every touched page stays write-latched from the first change until
    /// its LSN is stamped, so a flush never sees a page ahead of the log.
    /// File records are only logged; the caller performs the tablespace
    /// operation itself.
    pub fn commit(self, log: &RedoLog, pool: &BufferPool) -> Result<MtrLsns> {
        let bytes = self.encode(log.seq_bit())?;
        let mut guards: BTreeMap<PageId, PageGuard<'_>> = BTreeMap::new();
        let mut init_first: BTreeMap<PageId, bool> = BTreeMap::new();
        for rec in &self.records {
            if let LogRecord::Page { page, op } = rec {
                init_first.entry(*page).or_insert_with(|| op.is_init());
            }
        }
        // latch in page order
        for (&page, &init) in &init_first {
            let guard = if init {
                pool.create(page)?
            } else {
                pool.fetch(page)?
            };
            guards.insert(page, guard);
        }
        // changes land on copies first so a rejected record leaves no page half-modified
        let mut images: BTreeMap<PageId, Vec<u8>> = guards
            .iter()
            .map(|(&page, guard)| (page, guard.data().to_vec()))
            .collect();
        for rec in &self.records {
            if let LogRecord::Page { page, op } = rec {
                let image = images
                    .get_mut(page)
                    .ok_or(RedoError::Invalid("page guard missing"))?;
                op.apply(image, *page).map_err(RedoError::Invalid)?;
            }
        }
        let _order = log.flush_order();
        let (start, end) = log.append(&bytes)?;
        for (page, guard) in guards.iter_mut() {
            if let Some(image) = images.get(page) {
                guard.data_mut().copy_from_slice(image);
            }
            page::set_page_lsn(guard.data_mut(), end);
            pool.note_modification(guard, start, end);
        }
        trace!(start = start.0, end = end.0, pages = guards.len(), "mtr.commit");
        Ok(MtrLsns { start, end })
    }
}

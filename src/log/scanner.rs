#![forbid(unsafe_code)]
//! Incremental mini-transaction scanner.
//!
//! Bytes are fed in arbitrary chunks. Each mini-transaction is examined
//! twice: the first pass walks record headers to the terminator and checks
//! the sequence bit and CRC, so garbage past the end of the log stops the
//! scan quietly; only a checksummed mini-transaction that then fails to
//! decode counts as corruption.

use tracing::trace;

use super::mtr::MTR_TRAILER_LEN;
use super::record::{self, Decode, FrameLen, LogRecord, RecordContext};
use crate::primitives::bytes::be;
use crate::types::checksum::crc32;
use crate::types::Lsn;

/// Upper bound on the size of a single mini-transaction.
pub const MAX_MTR_LEN: usize = 16 << 20;

/// A mini-transaction that passed both scan passes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedMtr {
    /// LSN of its first byte.
    pub start_lsn: Lsn,
    /// LSN just past its CRC.
    pub end_lsn: Lsn,
    /// Decoded records in log order.
    pub records: Vec<LogRecord>,
}

/// Result of [`LogScanner::next_mtr`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScanStep {
    /// A complete mini-transaction.
    Mtr(ParsedMtr),
    /// Feed more bytes.
    NeedMore,
    /// No further valid mini-transaction; the log ends at
    /// [`LogScanner::scanned_lsn`].
    EndOfLog(&'static str),
    /// A mini-transaction with a valid checksum could not be decoded.
    Corrupt {
        /// LSN of the offending byte.
        lsn: Lsn,
        /// What was wrong.
        reason: &'static str,
    },
}

/// Splits the log stream into mini-transactions.
#[derive(Debug)]
pub struct LogScanner {
    buf: Vec<u8>,
    buf_lsn: Lsn,
    seq_bit: u8,
    stopped: Option<ScanStep>,
}

enum Frame {
    Complete { body_len: usize },
    NeedMore,
    End(&'static str),
}

impl LogScanner {
    /// Scanner positioned at `start_lsn` expecting terminators with
    /// `seq_bit`.
    pub fn new(start_lsn: Lsn, seq_bit: u8) -> Self {
        Self {
            buf: Vec::new(),
            buf_lsn: start_lsn,
            seq_bit,
            stopped: None,
        }
    }

    /// Appends the next chunk of the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// End of the last mini-transaction returned.
    pub fn scanned_lsn(&self) -> Lsn {
        self.buf_lsn
    }

    /// LSN of the next byte the scanner expects to be fed.
    pub fn next_read_lsn(&self) -> Lsn {
        self.buf_lsn.advance(self.buf.len() as u64)
    }

    /// Bytes buffered but not yet consumed.
    pub fn unconsumed(&self) -> usize {
        self.buf.len()
    }

    /// Restarts scanning at `lsn`, dropping buffered bytes.
    pub fn rewind(&mut self, lsn: Lsn) {
        trace!(lsn = lsn.0, "log.scan.rewind");
        self.buf.clear();
        self.buf_lsn = lsn;
        self.stopped = None;
    }

    /// Declares that no more bytes will be fed. A partially buffered
    /// mini-transaction becomes the end of the log.
    pub fn finish(&mut self) -> ScanStep {
        match self.next_mtr() {
            ScanStep::NeedMore => {
                let step = ScanStep::EndOfLog(if self.buf.is_empty() {
                    "end of log file"
                } else {
                    "log ends inside a mini-transaction"
                });
                self.stopped = Some(step.clone());
                step
            }
            other => other,
        }
    }

    fn frame(&self) -> Frame {
        let mut pos = 0usize;
        loop {
            if pos > MAX_MTR_LEN {
                return Frame::End("mini-transaction exceeds the size limit");
            }
            match record::frame_len(&self.buf[pos..]) {
                FrameLen::Record(len) => {
                    pos += len;
                    if pos > self.buf.len() {
                        return Frame::NeedMore;
                    }
                }
                FrameLen::MtrEnd(bit) => {
                    if pos == 0 {
                        return Frame::End("terminator at mini-transaction start");
                    }
                    if bit != self.seq_bit {
                        return Frame::End("sequence bit mismatch");
                    }
                    let total = pos + MTR_TRAILER_LEN;
                    if self.buf.len() < total {
                        return Frame::NeedMore;
                    }
                    let stored = be::get_u32(&self.buf, pos + 1);
                    if stored != crc32(&self.buf[..pos + 1]) {
                        return Frame::End("mini-transaction checksum mismatch");
                    }
                    return Frame::Complete { body_len: pos };
                }
                FrameLen::PrematureEof => return Frame::NeedMore,
                FrameLen::Corrupt(reason) => return Frame::End(reason),
            }
        }
    }

    /// Returns the next mini-transaction or why there is none.
    pub fn next_mtr(&mut self) -> ScanStep {
        if let Some(step) = &self.stopped {
            return step.clone();
        }
        let body_len = match self.frame() {
            Frame::Complete { body_len } => body_len,
            Frame::NeedMore => return ScanStep::NeedMore,
            Frame::End(reason) => {
                trace!(lsn = self.buf_lsn.0, reason, "log.scan.end");
                let step = ScanStep::EndOfLog(reason);
                self.stopped = Some(step.clone());
                return step;
            }
        };

        let mut ctx = RecordContext::new();
        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos < body_len {
            let reason = match record::decode(&self.buf[pos..body_len], &mut ctx) {
                Decode::Record(rec, used) => {
                    records.push(rec);
                    pos += used;
                    continue;
                }
                Decode::Corrupt(reason) => reason,
                Decode::PrematureEof => "record overruns the mini-transaction",
                Decode::MtrEnd { .. } => "terminator inside a mini-transaction",
            };
            let step = ScanStep::Corrupt {
                lsn: self.buf_lsn.advance(pos as u64),
                reason,
            };
            self.stopped = Some(step.clone());
            return step;
        }

        let total = body_len + MTR_TRAILER_LEN;
        let start_lsn = self.buf_lsn;
        let end_lsn = start_lsn.advance(total as u64);
        self.buf.drain(..total);
        self.buf_lsn = end_lsn;
        ScanStep::Mtr(ParsedMtr {
            start_lsn,
            end_lsn,
            records,
        })
    }
}

//! Redo record codec and the page-level meaning of each record.
//!
//! A record is `type byte | [length] | body`:
//!
//! * type byte: bit 7 = same page as the previous record of the
//!   mini-transaction, bits 4..=6 = record kind, bits 0..=3 = body length
//!   when it is 1..=15. A zero nibble means a varint length (16 or more)
//!   follows. A type byte of `0x00` or `0x01` is not a record but the
//!   mini-transaction terminator carrying the log sequence bit.
//! * body: unless same-page, varint space id and varint page number, then
//!   the kind-specific payload.
//!
//! WRITE, MEMSET and MEMMOVE store their page offset relative to the end of
//! the previous operation on the same page. The base is 0 after an explicit
//! page id and the page type offset after INIT_PAGE / FREE_PAGE.

use std::fmt;

use crate::primitives::bytes::{
    rel,
    var::{self, Decoded},
};
use crate::types::page::{self, header, page_type, undo, PAGE_TYPE_OFFSET};
use crate::types::{Lsn, PageId, Result, RedoError, SpaceId};

/// Record kinds stored in bits 4..=6 of the type byte.
pub mod kind {
    pub const FREE_PAGE: u8 = 0x00;
    pub const INIT_PAGE: u8 = 0x10;
    pub const EXTENDED: u8 = 0x20;
    pub const WRITE: u8 = 0x30;
    pub const MEMSET: u8 = 0x40;
    pub const MEMMOVE: u8 = 0x50;
    pub const OPTION: u8 = 0x60;
    pub const FILE: u8 = 0x70;
    pub const SAME_PAGE: u8 = 0x80;
    pub const KIND_MASK: u8 = 0x70;
    pub const LEN_MASK: u8 = 0x0F;
}

/// Subtypes of EXTENDED records.
pub mod extended {
    pub const UNDO_INIT: u8 = 1;
    pub const UNDO_APPEND: u8 = 2;
}

/// Subtypes of FILE records.
pub mod file_op {
    pub const CREATE: u8 = 1;
    pub const DELETE: u8 = 2;
    pub const RENAME: u8 = 3;
    pub const MODIFY: u8 = 4;
    pub const CHECKPOINT: u8 = 5;
}

/// Largest body length a record may carry.
pub const MAX_BODY_LEN: usize = var::MAX_3_BYTES as usize;

/// Undo-page operations carried by EXTENDED records.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExtendedOp {
    /// Formats the page as an empty undo page.
    UndoInit,
    /// Appends a length-prefixed undo record at the free offset.
    UndoAppend(Vec<u8>),
}

/// A change to a single page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PageOp {
    /// Page released; its previous contents no longer matter.
    FreePage,
    /// Page (re)initialized from scratch.
    InitPage,
    /// Copy `data` to `offset`.
    Write { offset: u32, data: Vec<u8> },
    /// Fill `len` bytes at `offset` with `pattern` repeated.
    Memset {
        offset: u32,
        len: u32,
        pattern: Vec<u8>,
    },
    /// Copy `len` bytes from `source` to `offset` within the page.
    Memmove { offset: u32, len: u32, source: u32 },
    /// Undo-page maintenance.
    Extended(ExtendedOp),
    /// Ignorable annotation.
    Option(Vec<u8>),
}

/// A tablespace-level operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FileOp {
    /// Tablespace created with a file name.
    Create { space: SpaceId, name: String },
    /// Tablespace dropped.
    Delete { space: SpaceId, name: String },
    /// Tablespace file renamed.
    Rename {
        space: SpaceId,
        from: String,
        to: String,
    },
    /// First change to a tablespace since the last checkpoint.
    Modify { space: SpaceId, name: String },
    /// Checkpoint marker for a checkpoint at the given LSN.
    Checkpoint(Lsn),
}

/// One decoded redo record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogRecord {
    /// Change to a page.
    Page { page: PageId, op: PageOp },
    /// Tablespace operation or checkpoint marker.
    File(FileOp),
}

impl LogRecord {
    /// WRITE record.
    pub fn write(page: PageId, offset: u32, data: impl Into<Vec<u8>>) -> Self {
        LogRecord::Page {
            page,
            op: PageOp::Write {
                offset,
                data: data.into(),
            },
        }
    }

    /// INIT_PAGE record.
    pub fn init_page(page: PageId) -> Self {
        LogRecord::Page {
            page,
            op: PageOp::InitPage,
        }
    }

    /// Target page, absent for file-level records.
    pub fn page(&self) -> Option<PageId> {
        match self {
            LogRecord::Page { page, .. } => Some(*page),
            LogRecord::File(_) => None,
        }
    }
}

impl PageOp {
    /// True for records that overwrite the whole page.
    pub fn is_init(&self) -> bool {
        matches!(self, PageOp::InitPage | PageOp::FreePage)
    }

    /// Payload bytes held in memory by this operation.
    pub fn payload_len(&self) -> usize {
        match self {
            PageOp::Write { data, .. } => data.len(),
            PageOp::Memset { pattern, .. } => pattern.len(),
            PageOp::Extended(ExtendedOp::UndoAppend(data)) | PageOp::Option(data) => data.len(),
            _ => 0,
        }
    }

    /// Applies the change to a page image. Bounds are checked before any
    /// byte is modified, so a rejected record leaves the page untouched.
    /// The page LSN is the caller's responsibility.
    pub fn apply(&self, image: &mut [u8], id: PageId) -> std::result::Result<(), &'static str> {
        let limit = image.len() - header::TRAILER_LEN;
        let span = |offset: u32, len: usize| -> std::result::Result<std::ops::Range<usize>, &'static str> {
            let start = offset as usize;
            let end = start.checked_add(len).ok_or("offset overflow")?;
            if end > limit {
                return Err("change extends past the page body");
            }
            Ok(start..end)
        };
        match self {
            PageOp::FreePage | PageOp::InitPage => {
                page::init_page(image, id);
            }
            PageOp::Write { offset, data } => {
                let range = span(*offset, data.len())?;
                image[range].copy_from_slice(data);
            }
            PageOp::Memset {
                offset,
                len,
                pattern,
            } => {
                let range = span(*offset, *len as usize)?;
                for (dst, src) in image[range].iter_mut().zip(pattern.iter().cycle()) {
                    *dst = *src;
                }
            }
            PageOp::Memmove {
                offset,
                len,
                source,
            } => {
                let dst = span(*offset, *len as usize)?;
                let src = span(*source, *len as usize)?;
                image.copy_within(src, dst.start);
            }
            PageOp::Extended(ExtendedOp::UndoInit) => {
                page::set_page_type(image, page_type::UNDO_LOG);
                let first = (undo::FIRST_RECORD as u16).to_be_bytes();
                image[undo::PAGE_TYPE].fill(0);
                image[undo::PAGE_START].copy_from_slice(&first);
                image[undo::PAGE_FREE].copy_from_slice(&first);
            }
            PageOp::Extended(ExtendedOp::UndoAppend(data)) => {
                if page::page_type(image) != page_type::UNDO_LOG {
                    return Err("undo append on a non-undo page");
                }
                let free = u16::from_be_bytes([image[undo::PAGE_FREE.start], image[undo::PAGE_FREE.start + 1]]);
                if (free as usize) < undo::FIRST_RECORD {
                    return Err("undo free offset below the undo header");
                }
                let len = u16::try_from(data.len()).map_err(|_| "undo record too long")?;
                let range = span(free as u32, 2 + data.len())?;
                let new_free = u16::try_from(range.end).map_err(|_| "undo free offset overflow")?;
                image[range.start..range.start + 2].copy_from_slice(&len.to_be_bytes());
                image[range.start + 2..range.end].copy_from_slice(data);
                image[undo::PAGE_FREE].copy_from_slice(&new_free.to_be_bytes());
            }
            PageOp::Option(_) => {}
        }
        Ok(())
    }

    fn end_offset(&self, offset_base: u32) -> u32 {
        match self {
            PageOp::FreePage | PageOp::InitPage => PAGE_TYPE_OFFSET as u32,
            PageOp::Write { offset, data } => offset.saturating_add(data.len() as u32),
            PageOp::Memset { offset, len, .. } | PageOp::Memmove { offset, len, .. } => {
                offset.saturating_add(*len)
            }
            PageOp::Extended(_) | PageOp::Option(_) => offset_base,
        }
    }

    fn offset(&self) -> Option<u32> {
        match self {
            PageOp::Write { offset, .. }
            | PageOp::Memset { offset, .. }
            | PageOp::Memmove { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogRecord::Page { page, op } => match op {
                PageOp::FreePage => write!(f, "FREE_PAGE {page}"),
                PageOp::InitPage => write!(f, "INIT_PAGE {page}"),
                PageOp::Write { offset, data } => write!(f, "WRITE {page} +{offset} len={}", data.len()),
                PageOp::Memset { offset, len, .. } => write!(f, "MEMSET {page} +{offset} len={len}"),
                PageOp::Memmove { offset, len, source } => {
                    write!(f, "MEMMOVE {page} +{offset} len={len} from={source}")
                }
                PageOp::Extended(ExtendedOp::UndoInit) => write!(f, "UNDO_INIT {page}"),
                PageOp::Extended(ExtendedOp::UndoAppend(d)) => write!(f, "UNDO_APPEND {page} len={}", d.len()),
                PageOp::Option(_) => write!(f, "OPTION {page}"),
            },
            LogRecord::File(op) => match op {
                FileOp::Create { space, name } => write!(f, "FILE_CREATE {space} {name}"),
                FileOp::Delete { space, name } => write!(f, "FILE_DELETE {space} {name}"),
                FileOp::Rename { space, from, to } => write!(f, "FILE_RENAME {space} {from} -> {to}"),
                FileOp::Modify { space, name } => write!(f, "FILE_MODIFY {space} {name}"),
                FileOp::Checkpoint(lsn) => write!(f, "FILE_CHECKPOINT {lsn}"),
            },
        }
    }
}

/// Same-page context threaded through consecutive records of one
/// mini-transaction, identically by the encoder and the decoder.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecordContext {
    page: Option<PageId>,
    last_offset: u32,
}

impl RecordContext {
    /// Context at the start of a mini-transaction.
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&mut self, page: PageId, same_page: bool, op: &PageOp) {
        let base = if same_page { self.last_offset } else { 0 };
        self.page = Some(page);
        self.last_offset = op.end_offset(base);
    }
}

/// Outcome of decoding at a cursor position.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Decode {
    /// A record and the number of bytes it occupied.
    Record(LogRecord, usize),
    /// Terminator byte: the mini-transaction ends here.
    MtrEnd { seq_bit: u8 },
    /// The buffer ends before the record does.
    PrematureEof,
    /// The bytes cannot be a valid record.
    Corrupt(&'static str),
}

/// Where a record frame ends, computed from its header alone.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameLen {
    /// Total bytes of the record (type byte, length and body).
    Record(usize),
    /// Terminator byte.
    MtrEnd(u8),
    /// Not enough bytes to tell.
    PrematureEof,
    /// Invalid header.
    Corrupt(&'static str),
}

/// Reads only the type byte and length of the record at the start of `buf`.
pub fn frame_len(buf: &[u8]) -> FrameLen {
    let Some(&type_byte) = buf.first() else {
        return FrameLen::PrematureEof;
    };
    if type_byte <= 1 {
        return FrameLen::MtrEnd(type_byte);
    }
    let nibble = (type_byte & kind::LEN_MASK) as usize;
    let (body_len, header_len) = if nibble != 0 {
        (nibble, 1)
    } else {
        match var::decode_u32(&buf[1..]) {
            Decoded::Value(len, used) => {
                if used > 3 {
                    return FrameLen::Corrupt("record length wider than three bytes");
                }
                if len < 16 {
                    return FrameLen::Corrupt("non-canonical record length");
                }
                (len as usize, 1 + used)
            }
            Decoded::Short => return FrameLen::PrematureEof,
            Decoded::Invalid => return FrameLen::Corrupt("invalid record length"),
        }
    };
    FrameLen::Record(header_len + body_len)
}

struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn varint(&mut self) -> std::result::Result<u32, &'static str> {
        match var::decode_u32(&self.buf[self.pos..]) {
            Decoded::Value(v, used) => {
                self.pos += used;
                Ok(v)
            }
            Decoded::Short => Err("varint runs past the record body"),
            Decoded::Invalid => Err("invalid varint"),
        }
    }

    fn byte(&mut self) -> std::result::Result<u8, &'static str> {
        let b = *self.buf.get(self.pos).ok_or("record body too short")?;
        self.pos += 1;
        Ok(b)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    fn finish(&self) -> std::result::Result<(), &'static str> {
        if self.pos != self.buf.len() {
            return Err("trailing bytes in record body");
        }
        Ok(())
    }
}

fn read_offset(r: &mut BodyReader<'_>, base: u32) -> std::result::Result<u32, &'static str> {
    let delta = r.varint()?;
    let offset = base.checked_add(delta).ok_or("offset overflow")?;
    if offset as usize >= page::MAX_PAGE_SIZE {
        return Err("offset beyond the largest page size");
    }
    Ok(offset)
}

/// Rejects a byte range that does not fit in the largest page.
fn check_extent(offset: u32, len: u64) -> std::result::Result<(), &'static str> {
    if u64::from(offset) + len > page::MAX_PAGE_SIZE as u64 {
        return Err("range beyond the largest page size");
    }
    Ok(())
}

fn utf8(bytes: &[u8]) -> std::result::Result<String, &'static str> {
    String::from_utf8(bytes.to_vec()).map_err(|_| "file name is not valid UTF-8")
}

/// Decodes the record at the start of `buf`. `ctx` is updated only when a
/// record is returned, so the call can be retried with more bytes after
/// [`Decode::PrematureEof`].
pub fn decode(buf: &[u8], ctx: &mut RecordContext) -> Decode {
    let total = match frame_len(buf) {
        FrameLen::Record(total) => total,
        FrameLen::MtrEnd(seq_bit) => return Decode::MtrEnd { seq_bit },
        FrameLen::PrematureEof => return Decode::PrematureEof,
        FrameLen::Corrupt(reason) => return Decode::Corrupt(reason),
    };
    if buf.len() < total {
        return Decode::PrematureEof;
    }
    let type_byte = buf[0];
    let body_len = if type_byte & kind::LEN_MASK != 0 {
        (type_byte & kind::LEN_MASK) as usize
    } else {
        match var::decode_u32(&buf[1..]) {
            Decoded::Value(len, _) => len as usize,
            _ => return Decode::Corrupt("invalid record length"),
        }
    };
    let body = &buf[total - body_len..total];
    match decode_body(type_byte, body, ctx) {
        Ok(record) => Decode::Record(record, total),
        Err(reason) => Decode::Corrupt(reason),
    }
}

fn decode_body(
    type_byte: u8,
    body: &[u8],
    ctx: &mut RecordContext,
) -> std::result::Result<LogRecord, &'static str> {
    let same_page = type_byte & kind::SAME_PAGE != 0;
    let record_kind = type_byte & kind::KIND_MASK;
    let mut r = BodyReader { buf: body, pos: 0 };

    if record_kind == kind::FILE {
        if same_page {
            return Err("file record flagged same-page");
        }
        let space = r.varint()?;
        let subtype = r.byte()?;
        let op = match subtype {
            file_op::CREATE => FileOp::Create {
                space,
                name: utf8(r.rest())?,
            },
            file_op::DELETE => FileOp::Delete {
                space,
                name: utf8(r.rest())?,
            },
            file_op::MODIFY => FileOp::Modify {
                space,
                name: utf8(r.rest())?,
            },
            file_op::RENAME => {
                let rest = r.rest();
                let split = rest
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or("rename record without separator")?;
                FileOp::Rename {
                    space,
                    from: utf8(&rest[..split])?,
                    to: utf8(&rest[split + 1..])?,
                }
            }
            file_op::CHECKPOINT => {
                let rest = r.rest();
                let raw: [u8; 8] = rest.try_into().map_err(|_| "checkpoint marker must carry 8 bytes")?;
                FileOp::Checkpoint(Lsn(u64::from_be_bytes(raw)))
            }
            _ => return Err("unknown file operation"),
        };
        if let FileOp::Create { name, .. }
        | FileOp::Delete { name, .. }
        | FileOp::Modify { name, .. } = &op
        {
            if name.is_empty() {
                return Err("file record without a name");
            }
        }
        return Ok(LogRecord::File(op));
    }

    let page = if same_page {
        if record_kind == kind::FREE_PAGE || record_kind == kind::INIT_PAGE {
            return Err("page init flagged same-page");
        }
        ctx.page.ok_or("same-page record without a previous page")?
    } else {
        let space = r.varint()?;
        let page_no = r.varint()?;
        PageId::new(space, page_no)
    };
    let base = if same_page { ctx.last_offset } else { 0 };
    let op = match record_kind {
        kind::FREE_PAGE => PageOp::FreePage,
        kind::INIT_PAGE => PageOp::InitPage,
        kind::WRITE => {
            let offset = read_offset(&mut r, base)?;
            let data = r.rest();
            if data.is_empty() {
                return Err("write record without data");
            }
            check_extent(offset, data.len() as u64)?;
            PageOp::Write {
                offset,
                data: data.to_vec(),
            }
        }
        kind::MEMSET => {
            let offset = read_offset(&mut r, base)?;
            let len = r.varint()?;
            let pattern = r.rest();
            if len == 0 || pattern.is_empty() || pattern.len() > len as usize {
                return Err("invalid memset length");
            }
            check_extent(offset, u64::from(len))?;
            PageOp::Memset {
                offset,
                len,
                pattern: pattern.to_vec(),
            }
        }
        kind::MEMMOVE => {
            let offset = read_offset(&mut r, base)?;
            let len = r.varint()?;
            let delta = rel::decode(r.varint()?);
            let source = offset as i64 + delta;
            if len == 0 || source < 0 || source as usize >= page::MAX_PAGE_SIZE {
                return Err("invalid memmove source");
            }
            check_extent(offset, u64::from(len))?;
            check_extent(source as u32, u64::from(len))?;
            PageOp::Memmove {
                offset,
                len,
                source: source as u32,
            }
        }
        kind::EXTENDED => match r.byte()? {
            extended::UNDO_INIT => PageOp::Extended(ExtendedOp::UndoInit),
            extended::UNDO_APPEND => {
                let data = r.rest();
                if data.is_empty() {
                    return Err("undo append without data");
                }
                PageOp::Extended(ExtendedOp::UndoAppend(data.to_vec()))
            }
            _ => return Err("unknown extended record subtype"),
        },
        kind::OPTION => {
            let data = r.rest();
            if data.is_empty() && same_page {
                return Err("empty option record");
            }
            PageOp::Option(data.to_vec())
        }
        _ => return Err("unknown record kind"),
    };
    r.finish()?;
    if same_page && op.offset().is_some_and(|o| o < ctx.last_offset) {
        return Err("same-page offset moved backwards");
    }
    ctx.advance(page, same_page, &op);
    Ok(LogRecord::Page { page, op })
}

fn push_page_id(out: &mut Vec<u8>, page: PageId) {
    var::encode_u32(page.space, out);
    var::encode_u32(page.page_no, out);
}

/// Appends the encoding of `record` to `out`, using the same-page form when
/// `ctx` allows it.
pub fn encode(record: &LogRecord, ctx: &mut RecordContext, out: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();
    let type_byte = match record {
        LogRecord::File(op) => {
            let (space, subtype) = match op {
                FileOp::Create { space, .. } => (*space, file_op::CREATE),
                FileOp::Delete { space, .. } => (*space, file_op::DELETE),
                FileOp::Rename { space, .. } => (*space, file_op::RENAME),
                FileOp::Modify { space, .. } => (*space, file_op::MODIFY),
                FileOp::Checkpoint(_) => (0, file_op::CHECKPOINT),
            };
            var::encode_u32(space, &mut body);
            body.push(subtype);
            match op {
                FileOp::Create { name, .. } | FileOp::Delete { name, .. } | FileOp::Modify { name, .. } => {
                    if name.is_empty() {
                        return Err(RedoError::Invalid("file record needs a name"));
                    }
                    body.extend_from_slice(name.as_bytes());
                }
                FileOp::Rename { from, to, .. } => {
                    if from.as_bytes().contains(&0) {
                        return Err(RedoError::Invalid("file name contains NUL"));
                    }
                    body.extend_from_slice(from.as_bytes());
                    body.push(0);
                    body.extend_from_slice(to.as_bytes());
                }
                FileOp::Checkpoint(lsn) => body.extend_from_slice(&lsn.0.to_be_bytes()),
            }
            kind::FILE
        }
        LogRecord::Page { page, op } => {
            let same_page = ctx.page == Some(*page)
                && !op.is_init()
                && op.offset().map_or(true, |o| o >= ctx.last_offset)
                && !matches!(op, PageOp::Option(d) if d.is_empty());
            if !same_page {
                push_page_id(&mut body, *page);
            }
            let base = if same_page { ctx.last_offset } else { 0 };
            if let Some(offset) = op.offset() {
                if offset as usize >= page::MAX_PAGE_SIZE {
                    return Err(RedoError::Invalid("offset beyond the largest page size"));
                }
                var::encode_u32(offset - base, &mut body);
            }
            let extent = match op {
                PageOp::Write { offset, data } => Some((*offset, data.len() as u64)),
                PageOp::Memset { offset, len, .. } => Some((*offset, u64::from(*len))),
                PageOp::Memmove { offset, len, source } => {
                    check_extent(*source, u64::from(*len)).map_err(RedoError::Invalid)?;
                    Some((*offset, u64::from(*len)))
                }
                _ => None,
            };
            if let Some((offset, len)) = extent {
                check_extent(offset, len).map_err(RedoError::Invalid)?;
            }
            let record_kind = match op {
                PageOp::FreePage => kind::FREE_PAGE,
                PageOp::InitPage => kind::INIT_PAGE,
                PageOp::Write { data, .. } => {
                    if data.is_empty() {
                        return Err(RedoError::Invalid("write record needs data"));
                    }
                    body.extend_from_slice(data);
                    kind::WRITE
                }
                PageOp::Memset { len, pattern, .. } => {
                    if *len == 0 || pattern.is_empty() || pattern.len() > *len as usize {
                        return Err(RedoError::Invalid("memset needs 1..=len pattern bytes"));
                    }
                    var::encode_u32(*len, &mut body);
                    body.extend_from_slice(pattern);
                    kind::MEMSET
                }
                PageOp::Memmove { offset, len, source } => {
                    let delta = i64::from(*source) - i64::from(*offset);
                    let delta = i32::try_from(delta).map_err(|_| RedoError::Invalid("memmove distance"))?;
                    let encoded = rel::encode(delta)
                        .ok_or(RedoError::Invalid("memmove source equals destination"))?;
                    if *len == 0 {
                        return Err(RedoError::Invalid("memmove needs a length"));
                    }
                    var::encode_u32(*len, &mut body);
                    var::encode_u32(encoded, &mut body);
                    kind::MEMMOVE
                }
                PageOp::Extended(ext) => {
                    match ext {
                        ExtendedOp::UndoInit => body.push(extended::UNDO_INIT),
                        ExtendedOp::UndoAppend(data) => {
                            if data.is_empty() {
                                return Err(RedoError::Invalid("undo append needs data"));
                            }
                            body.push(extended::UNDO_APPEND);
                            body.extend_from_slice(data);
                        }
                    }
                    kind::EXTENDED
                }
                PageOp::Option(data) => {
                    body.extend_from_slice(data);
                    kind::OPTION
                }
            };
            ctx.advance(*page, same_page, op);
            if same_page {
                record_kind | kind::SAME_PAGE
            } else {
                record_kind
            }
        }
    };
    if body.len() > MAX_BODY_LEN {
        return Err(RedoError::Invalid("redo record body too long"));
    }
    if (1..=15).contains(&body.len()) {
        out.push(type_byte | body.len() as u8);
    } else {
        out.push(type_byte);
        var::encode_u32(body.len() as u32, out);
    }
    out.extend_from_slice(&body);
    Ok(())
}

//! On-disk page layout shared by the buffer pool, the storage backends and
//! the redo apply path.
//!
//! Every page starts with a 38-byte file header and ends with an 8-byte
//! trailer. The header carries the checksum, the page address, the LSN of
//! the newest change written to the page and the page type; the trailer
//! repeats the checksum and the low 32 bits of the LSN so that a torn write
//! is detectable.

use core::convert::TryInto;

use super::checksum::crc32_parts;
use super::{Lsn, PageId, Result, RedoError};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;
/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 1024;
/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// "No page" marker used for sibling links.
pub const FIL_NULL: u32 = u32::MAX;

pub mod header {
    //! Byte offsets for fixed header fields.
    use core::ops::Range;

    pub const CHECKSUM: Range<usize> = 0..4;
    pub const PAGE_NO: Range<usize> = 4..8;
    pub const PREV: Range<usize> = 8..12;
    pub const NEXT: Range<usize> = 12..16;
    pub const LSN: Range<usize> = 16..24;
    pub const PAGE_TYPE: Range<usize> = 24..26;
    pub const FLUSH_LSN: Range<usize> = 26..34;
    pub const SPACE_ID: Range<usize> = 34..38;
    /// First byte of the page body.
    pub const DATA: usize = 38;
    /// Trailer length at the end of every page.
    pub const TRAILER_LEN: usize = 8;
}

/// Offset of the page type field; redo offsets restart here after an init.
pub const PAGE_TYPE_OFFSET: usize = header::PAGE_TYPE.start;

pub mod page_type {
    //! Values stored in the page type field.

    /// Freshly allocated or freed page.
    pub const ALLOCATED: u16 = 0;
    /// Undo log page maintained by the extended undo records.
    pub const UNDO_LOG: u16 = 2;
    /// Tablespace header page (page 0 of every space).
    pub const SPACE_HEADER: u16 = 8;
    /// Generic data page.
    pub const DATA: u16 = 0x45bf;
}

pub mod undo {
    //! Undo page header living at the start of the page body.
    use super::header::DATA;
    use core::ops::Range;

    pub const PAGE_TYPE: Range<usize> = DATA..DATA + 2;
    pub const PAGE_START: Range<usize> = DATA + 2..DATA + 4;
    pub const PAGE_FREE: Range<usize> = DATA + 4..DATA + 6;
    /// First byte available for undo records.
    pub const FIRST_RECORD: usize = DATA + 6;
}

fn trailer(page_size: usize) -> (core::ops::Range<usize>, core::ops::Range<usize>) {
    let start = page_size - header::TRAILER_LEN;
    (start..start + 4, start + 4..page_size)
}

fn read_u32(page: &[u8], range: core::ops::Range<usize>) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&page[range]);
    u32::from_be_bytes(raw)
}

/// Validates that a page size is a supported power of two.
pub fn check_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(RedoError::Invalid(
            "page size must be a power of two between 1 KiB and 64 KiB",
        ));
    }
    Ok(())
}

/// LSN of the newest change persisted in the page image.
pub fn page_lsn(page: &[u8]) -> Lsn {
    let raw: [u8; 8] = page[header::LSN].try_into().unwrap_or([0; 8]);
    Lsn(u64::from_be_bytes(raw))
}

/// Stamps the page LSN into the header and the trailer.
pub fn set_page_lsn(page: &mut [u8], lsn: Lsn) {
    page[header::LSN].copy_from_slice(&lsn.0.to_be_bytes());
    let (_, lsn_low) = trailer(page.len());
    page[lsn_low].copy_from_slice(&(lsn.0 as u32).to_be_bytes());
}

/// Page number recorded in the header.
pub fn page_no(page: &[u8]) -> u32 {
    read_u32(page, header::PAGE_NO)
}

/// Tablespace id recorded in the header.
pub fn space_id(page: &[u8]) -> u32 {
    read_u32(page, header::SPACE_ID)
}

/// Page address recorded in the header.
pub fn page_id(page: &[u8]) -> PageId {
    PageId::new(space_id(page), page_no(page))
}

/// Page type recorded in the header.
pub fn page_type(page: &[u8]) -> u16 {
    u16::from_be_bytes([page[header::PAGE_TYPE.start], page[header::PAGE_TYPE.start + 1]])
}

/// Overwrites the page type.
pub fn set_page_type(page: &mut [u8], kind: u16) {
    page[header::PAGE_TYPE].copy_from_slice(&kind.to_be_bytes());
}

/// Zero-fills a page and writes its address fields.
pub fn init_page(page: &mut [u8], id: PageId) {
    page.fill(0);
    page[header::PAGE_NO].copy_from_slice(&id.page_no.to_be_bytes());
    page[header::PREV].copy_from_slice(&FIL_NULL.to_be_bytes());
    page[header::NEXT].copy_from_slice(&FIL_NULL.to_be_bytes());
    page[header::SPACE_ID].copy_from_slice(&id.space.to_be_bytes());
}

/// Computes the page checksum, skipping both checksum fields, the flush LSN
/// and the space id.
pub fn compute_checksum(page: &[u8]) -> u32 {
    let end = page.len() - header::TRAILER_LEN;
    crc32_parts(&[
        &page[header::PAGE_NO.start..header::FLUSH_LSN.start],
        &page[header::DATA..end],
    ])
}

/// Writes the checksum into the header and the trailer before a page write.
pub fn stamp_checksum(page: &mut [u8]) {
    let crc = compute_checksum(page).to_be_bytes();
    page[header::CHECKSUM].copy_from_slice(&crc);
    let (crc_copy, _) = trailer(page.len());
    page[crc_copy].copy_from_slice(&crc);
}

/// Result of validating a page image read from storage.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageCheck {
    /// Checksums, trailer and address agree.
    Valid,
    /// All-zero page: allocated but never written.
    Empty,
    /// The image cannot be trusted.
    Corrupt(&'static str),
}

/// Validates a page image against the address it was read from.
pub fn validate(page: &[u8], expected: PageId) -> PageCheck {
    if page.iter().all(|&b| b == 0) {
        return PageCheck::Empty;
    }
    let stored = read_u32(page, header::CHECKSUM);
    let (crc_copy, lsn_low) = trailer(page.len());
    if stored != read_u32(page, crc_copy) {
        return PageCheck::Corrupt("checksum copies disagree");
    }
    if stored != compute_checksum(page) {
        return PageCheck::Corrupt("checksum mismatch");
    }
    if read_u32(page, lsn_low) != page_lsn(page).0 as u32 {
        return PageCheck::Corrupt("trailer lsn mismatch");
    }
    if page_id(page) != expected {
        return PageCheck::Corrupt("page address mismatch");
    }
    PageCheck::Valid
}

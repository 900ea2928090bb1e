//! Fixed-capacity ring of page images written ahead of in-place page writes.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::DoublewriteBuffer;
use crate::primitives::io::{is_eof, FileIo};
use crate::types::page::{self, PageCheck};
use crate::types::{Lsn, PageId, Result};

/// Default number of page slots, two 64-page blocks.
pub const DEFAULT_DOUBLEWRITE_SLOTS: u32 = 128;

/// Doublewrite area stored in any [`FileIo`].
pub struct Doublewrite {
    io: Arc<dyn FileIo>,
    page_size: usize,
    slots: u32,
    next_slot: Mutex<u32>,
}

impl Doublewrite {
    /// Opens a doublewrite area with `slots` page slots.
    pub fn new(io: Arc<dyn FileIo>, page_size: usize, slots: u32) -> Result<Self> {
        page::check_page_size(page_size)?;
        let slots = slots.max(1);
        let used = (io.len()? / page_size as u64).min(slots as u64) as u32;
        Ok(Self {
            io,
            page_size,
            slots,
            next_slot: Mutex::new(used % slots),
        })
    }

    fn slot_offset(&self, slot: u32) -> u64 {
        slot as u64 * self.page_size as u64
    }
}

impl DoublewriteBuffer for Doublewrite {
    fn add(&self, image: &[u8]) -> Result<()> {
        let mut next = self.next_slot.lock();
        self.io.write_at(self.slot_offset(*next), image)?;
        *next = (*next + 1) % self.slots;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    fn find_page(&self, id: PageId, max_lsn: Lsn) -> Option<Vec<u8>> {
        let mut best: Option<(Lsn, Vec<u8>)> = None;
        let mut image = vec![0u8; self.page_size];
        for slot in 0..self.slots {
            match self.io.read_at(self.slot_offset(slot), &mut image) {
                Ok(()) => {}
                Err(err) if is_eof(&err) => break,
                Err(err) => {
                    debug!(slot, error = %err, "dblwr.find_page.read_failed");
                    continue;
                }
            }
            if page::validate(&image, id) != PageCheck::Valid {
                continue;
            }
            let lsn = page::page_lsn(&image);
            if lsn > max_lsn {
                continue;
            }
            if best.as_ref().map_or(true, |(seen, _)| lsn > *seen) {
                best = Some((lsn, image.clone()));
            }
        }
        best.map(|(_, image)| image)
    }
}

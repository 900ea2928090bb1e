//! Heap-backed tablespaces implementing both [`PageStorage`] and
//! [`TablespaceDirectory`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::{check_space_name, PageStorage, TablespaceDirectory, TablespaceInfo};
use crate::types::page::{self, page_type};
use crate::types::{Lsn, PageId, RedoError, Result, SpaceId};

struct MemSpace {
    name: String,
    pages: Vec<Box<[u8]>>,
}

/// Counters of page I/O served by a [`MemStorage`].
#[derive(Default, Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemStorageStats {
    /// Successful page reads.
    pub reads: u64,
    /// Page writes.
    pub writes: u64,
}

/// In-memory tablespaces.
pub struct MemStorage {
    page_size: usize,
    spaces: RwLock<BTreeMap<SpaceId, MemSpace>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemStorage {
    /// Creates an empty store with the given page size.
    pub fn new(page_size: usize) -> Result<Self> {
        page::check_page_size(page_size)?;
        Ok(Self {
            page_size,
            spaces: RwLock::new(BTreeMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Copy of the stored image of a page, if it exists.
    pub fn page_image(&self, id: PageId) -> Option<Vec<u8>> {
        let spaces = self.spaces.read();
        spaces
            .get(&id.space)?
            .pages
            .get(id.page_no as usize)
            .map(|p| p.to_vec())
    }

    /// Overwrites a stored page image without any validation.
    pub fn put_raw(&self, id: PageId, image: &[u8]) -> Result<()> {
        let mut spaces = self.spaces.write();
        let space = spaces
            .get_mut(&id.space)
            .ok_or(RedoError::SpaceNotFound(id.space))?;
        let idx = id.page_no as usize;
        if idx >= space.pages.len() {
            space
                .pages
                .resize_with(idx + 1, || vec![0u8; self.page_size].into_boxed_slice());
        }
        space.pages[idx].copy_from_slice(image);
        Ok(())
    }

    /// I/O counters since creation.
    pub fn stats(&self) -> MemStorageStats {
        MemStorageStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    fn zero_page(&self) -> Box<[u8]> {
        vec![0u8; self.page_size].into_boxed_slice()
    }

    fn header_page(&self, space: SpaceId) -> Box<[u8]> {
        let mut header = self.zero_page();
        page::init_page(&mut header, PageId::new(space, 0));
        page::set_page_type(&mut header, page_type::SPACE_HEADER);
        page::set_page_lsn(&mut header, Lsn::ZERO);
        page::stamp_checksum(&mut header);
        header
    }
}

impl PageStorage for MemStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        let spaces = self.spaces.read();
        let space = spaces
            .get(&id.space)
            .ok_or(RedoError::SpaceNotFound(id.space))?;
        let image = space
            .pages
            .get(id.page_no as usize)
            .ok_or(RedoError::PageBeyondEof {
                page: id,
                size_pages: space.pages.len() as u32,
            })?;
        dst.copy_from_slice(image);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_page(&self, id: PageId, src: &[u8]) -> Result<()> {
        if src.len() != self.page_size {
            return Err(RedoError::Invalid("page image has the wrong size"));
        }
        self.put_raw(id, src)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn space_size(&self, space: SpaceId) -> Result<u32> {
        let spaces = self.spaces.read();
        spaces
            .get(&space)
            .map(|s| s.pages.len() as u32)
            .ok_or(RedoError::SpaceNotFound(space))
    }

    fn extend(&self, space: SpaceId, size_pages: u32) -> Result<()> {
        let mut spaces = self.spaces.write();
        let entry = spaces
            .get_mut(&space)
            .ok_or(RedoError::SpaceNotFound(space))?;
        while entry.pages.len() < size_pages as usize {
            entry.pages.push(vec![0u8; self.page_size].into_boxed_slice());
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl TablespaceDirectory for MemStorage {
    fn resolve(&self, space: SpaceId) -> Option<TablespaceInfo> {
        let spaces = self.spaces.read();
        spaces.get(&space).map(|s| TablespaceInfo {
            space,
            name: s.name.clone(),
            size_pages: s.pages.len() as u32,
        })
    }

    fn create(&self, space: SpaceId, name: &str) -> Result<()> {
        check_space_name(name)?;
        let header = self.header_page(space);
        let mut spaces = self.spaces.write();
        spaces.entry(space).or_insert_with(|| MemSpace {
            name: name.to_owned(),
            pages: vec![header],
        });
        Ok(())
    }

    fn rename(&self, space: SpaceId, new_name: &str) -> Result<()> {
        check_space_name(new_name)?;
        let mut spaces = self.spaces.write();
        let entry = spaces
            .get_mut(&space)
            .ok_or(RedoError::SpaceNotFound(space))?;
        entry.name = new_name.to_owned();
        Ok(())
    }

    fn delete(&self, space: SpaceId) -> Result<()> {
        self.spaces.write().remove(&space);
        Ok(())
    }

    fn spaces(&self) -> Vec<TablespaceInfo> {
        let spaces = self.spaces.read();
        spaces
            .iter()
            .map(|(&space, s)| TablespaceInfo {
                space,
                name: s.name.clone(),
                size_pages: s.pages.len() as u32,
            })
            .collect()
    }
}

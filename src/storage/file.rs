//! Tablespaces stored as `*.ibd` files in one directory.
//!
//! The directory is rebuilt at open time by reading the space id from the
//! header of page 0 of every file, so no separate catalog is needed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{check_space_name, PageStorage, TablespaceDirectory, TablespaceInfo};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::page::{self, header, page_type};
use crate::types::{Lsn, PageId, RedoError, Result, SpaceId};

/// File extension of tablespace files.
pub const SPACE_FILE_EXT: &str = "ibd";

struct SpaceFile {
    name: String,
    io: StdFileIo,
}

/// Directory of tablespace files.
pub struct FileStorage {
    dir: PathBuf,
    page_size: usize,
    read_only: bool,
    spaces: RwLock<BTreeMap<SpaceId, SpaceFile>>,
}

impl FileStorage {
    /// Opens `dir` and discovers its tablespaces.
    pub fn open(dir: impl AsRef<Path>, page_size: usize, read_only: bool) -> Result<Self> {
        page::check_page_size(page_size)?;
        let dir = dir.as_ref().to_path_buf();
        let mut spaces = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SPACE_FILE_EXT) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                continue;
            };
            let io = StdFileIo::open_existing(&path, read_only)?;
            let mut head = [0u8; header::DATA];
            if let Err(err) = io.read_at(0, &mut head) {
                warn!(file = %name, error = %err, "storage.open.unreadable_header");
                continue;
            }
            let space = page::space_id(&head);
            if let Some(existing) = spaces.insert(space, SpaceFile { name: name.clone(), io }) {
                warn!(
                    space,
                    first = %existing.name,
                    second = %name,
                    "storage.open.duplicate_space_id"
                );
            }
        }
        debug!(dir = %dir.display(), spaces = spaces.len(), "storage.open");
        Ok(Self {
            dir,
            page_size,
            read_only,
            spaces: RwLock::new(spaces),
        })
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(RedoError::Invalid("storage opened read-only"));
        }
        Ok(())
    }

    fn with_space<R>(&self, space: SpaceId, f: impl FnOnce(&SpaceFile) -> Result<R>) -> Result<R> {
        let spaces = self.spaces.read();
        let file = spaces.get(&space).ok_or(RedoError::SpaceNotFound(space))?;
        f(file)
    }

    fn size_of(&self, io: &StdFileIo) -> Result<u32> {
        Ok((io.len()? / self.page_size as u64) as u32)
    }
}

impl PageStorage for FileStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        self.with_space(id.space, |file| {
            let size_pages = self.size_of(&file.io)?;
            if id.page_no >= size_pages {
                return Err(RedoError::PageBeyondEof {
                    page: id,
                    size_pages,
                });
            }
            file.io
                .read_at(id.page_no as u64 * self.page_size as u64, dst)
        })
    }

    fn write_page(&self, id: PageId, src: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.with_space(id.space, |file| {
            file.io
                .write_at(id.page_no as u64 * self.page_size as u64, src)
        })
    }

    fn space_size(&self, space: SpaceId) -> Result<u32> {
        self.with_space(space, |file| self.size_of(&file.io))
    }

    fn extend(&self, space: SpaceId, size_pages: u32) -> Result<()> {
        self.check_writable()?;
        self.with_space(space, |file| {
            if self.size_of(&file.io)? < size_pages {
                file.io.truncate(size_pages as u64 * self.page_size as u64)?;
            }
            Ok(())
        })
    }

    fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let spaces = self.spaces.read();
        for file in spaces.values() {
            file.io.sync_all()?;
        }
        Ok(())
    }
}

impl TablespaceDirectory for FileStorage {
    fn resolve(&self, space: SpaceId) -> Option<TablespaceInfo> {
        let spaces = self.spaces.read();
        let file = spaces.get(&space)?;
        Some(TablespaceInfo {
            space,
            name: file.name.clone(),
            size_pages: self.size_of(&file.io).unwrap_or(0),
        })
    }

    fn create(&self, space: SpaceId, name: &str) -> Result<()> {
        check_space_name(name)?;
        if self.spaces.read().contains_key(&space) {
            return Ok(());
        }
        self.check_writable()?;
        let io = StdFileIo::open(self.dir.join(name))?;
        if io.is_empty()? {
            let mut head = vec![0u8; self.page_size];
            page::init_page(&mut head, PageId::new(space, 0));
            page::set_page_type(&mut head, page_type::SPACE_HEADER);
            page::set_page_lsn(&mut head, Lsn::ZERO);
            page::stamp_checksum(&mut head);
            io.write_at(0, &head)?;
            io.sync_all()?;
        }
        debug!(space, name, "storage.space.created");
        self.spaces.write().insert(
            space,
            SpaceFile {
                name: name.to_owned(),
                io,
            },
        );
        Ok(())
    }

    fn rename(&self, space: SpaceId, new_name: &str) -> Result<()> {
        check_space_name(new_name)?;
        let mut spaces = self.spaces.write();
        let file = spaces
            .get_mut(&space)
            .ok_or(RedoError::SpaceNotFound(space))?;
        if file.name == new_name {
            return Ok(());
        }
        self.check_writable()?;
        fs::rename(self.dir.join(&file.name), self.dir.join(new_name))?;
        debug!(space, from = %file.name, to = new_name, "storage.space.renamed");
        file.name = new_name.to_owned();
        Ok(())
    }

    fn delete(&self, space: SpaceId) -> Result<()> {
        let mut spaces = self.spaces.write();
        let Some(file) = spaces.get(&space) else {
            return Ok(());
        };
        self.check_writable()?;
        fs::remove_file(self.dir.join(&file.name))?;
        debug!(space, name = %file.name, "storage.space.deleted");
        spaces.remove(&space);
        Ok(())
    }

    fn spaces(&self) -> Vec<TablespaceInfo> {
        let spaces = self.spaces.read();
        spaces
            .iter()
            .map(|(&space, file)| TablespaceInfo {
                space,
                name: file.name.clone(),
                size_pages: self.size_of(&file.io).unwrap_or(0),
            })
            .collect()
    }
}

#![forbid(unsafe_code)]
//! Collaborator interfaces the recovery and flush code talk to: page I/O,
//! the tablespace directory and the doublewrite area.

use serde::Serialize;

use crate::types::{Lsn, PageId, Result, SpaceId};

/// Doublewrite area over any [`FileIo`](crate::primitives::io::FileIo).
pub mod doublewrite;
/// Directory of tablespace files on disk.
pub mod file;
/// Heap-backed tablespaces for tests and tools.
pub mod mem;

pub use doublewrite::Doublewrite;
pub use file::FileStorage;
pub use mem::MemStorage;

/// Page-granular reads and writes against tablespaces.
///
/// `read_page` distinguishes three failures callers react to differently:
/// [`RedoError::SpaceNotFound`](crate::types::RedoError::SpaceNotFound),
/// [`RedoError::PageBeyondEof`](crate::types::RedoError::PageBeyondEof)
/// and plain I/O errors.
pub trait PageStorage: Send + Sync {
    /// Size of every page in bytes.
    fn page_size(&self) -> usize;
    /// Reads one page into `dst` (`dst.len() == page_size`).
    fn read_page(&self, id: PageId, dst: &mut [u8]) -> Result<()>;
    /// Writes one page, growing the tablespace when the page lies past its end.
    fn write_page(&self, id: PageId, src: &[u8]) -> Result<()>;
    /// Current size of a tablespace in pages.
    fn space_size(&self, space: SpaceId) -> Result<u32>;
    /// Grows a tablespace to at least `size_pages` zero-filled pages.
    fn extend(&self, space: SpaceId, size_pages: u32) -> Result<()>;
    /// Makes all completed writes durable.
    fn sync(&self) -> Result<()>;
}

/// What the directory knows about one tablespace.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TablespaceInfo {
    /// Tablespace id.
    pub space: SpaceId,
    /// File name of the tablespace.
    pub name: String,
    /// Current size in pages.
    pub size_pages: u32,
}

/// Maps tablespace ids to files. Every mutation is idempotent because the
/// redo scan may replay the same file operation more than once.
pub trait TablespaceDirectory: Send + Sync {
    /// Looks a tablespace up by id.
    fn resolve(&self, space: SpaceId) -> Option<TablespaceInfo>;
    /// Creates an empty tablespace; succeeds if it already exists.
    fn create(&self, space: SpaceId, name: &str) -> Result<()>;
    /// Renames a tablespace; succeeds if it already has `new_name`.
    fn rename(&self, space: SpaceId, new_name: &str) -> Result<()>;
    /// Removes a tablespace; succeeds if it is already gone.
    fn delete(&self, space: SpaceId) -> Result<()>;
    /// Lists all known tablespaces ordered by id.
    fn spaces(&self) -> Vec<TablespaceInfo>;
}

/// Copies of recently flushed pages kept to repair torn writes.
pub trait DoublewriteBuffer: Send + Sync {
    /// Stages a stamped page image ahead of its in-place write.
    fn add(&self, page: &[u8]) -> Result<()>;
    /// Makes staged images durable.
    fn sync(&self) -> Result<()>;
    /// Newest intact copy of `id` whose page LSN does not exceed `max_lsn`.
    fn find_page(&self, id: PageId, max_lsn: Lsn) -> Option<Vec<u8>>;
}

/// Validates a tablespace file name: a single non-empty path component.
pub(crate) fn check_space_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(crate::types::RedoError::Invalid(
            "tablespace name must be a plain file name",
        ));
    }
    Ok(())
}

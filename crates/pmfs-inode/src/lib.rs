#![forbid(unsafe_code)]
//! Inode management.
//!
//! [`Inode`] is the persistent record. [`InodeTable`] owns every record in
//! the pool, each behind its own reader-writer lock. [`VinodeCache`] keeps
//! one reference-counted [`Vinode`] per inode in active use and hands out
//! [`VinodeRef`]s; multi-inode operations lock through a [`LockSet`].

pub mod atime;
pub mod cache;
pub mod lockset;
pub mod table;

pub use atime::{relatime_needs_update, update_atime};
pub use cache::{Vinode, VinodeCache, VinodeRef};
pub use lockset::LockSet;
pub use table::{InodeSlot, InodeTable};

use pmfs_dir::Directory;
use pmfs_error::{PmfsError, Result};
use pmfs_extent::ExtentList;
use pmfs_pool::AllocSite;
use pmfs_types::{FileType, InodeNumber, Timestamp};
use serde::{Deserialize, Serialize};

/// Pool bytes consumed by an inode record itself.
pub const INODE_FOOTPRINT: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeContent {
    Regular(ExtentList),
    Directory(Directory),
    Symlink(String),
}

impl InodeContent {
    #[must_use]
    pub fn kind(&self) -> FileType {
        match self {
            Self::Regular(_) => FileType::RegularFile,
            Self::Directory(_) => FileType::Directory,
            Self::Symlink(_) => FileType::Symlink,
        }
    }

    /// Pool bytes held by the content, excluding the record.
    #[must_use]
    pub fn storage_bytes(&self) -> u64 {
        match self {
            Self::Regular(extents) => extents.allocated_bytes(),
            Self::Directory(dir) => dir.byte_size(),
            Self::Symlink(target) => target.len() as u64,
        }
    }

    /// Allocation site charged for the content at creation.
    #[must_use]
    pub fn alloc_site(&self) -> AllocSite {
        match self {
            Self::Regular(_) => AllocSite::Extent,
            Self::Directory(_) => AllocSite::DirEntry,
            Self::Symlink(_) => AllocSite::Symlink,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub ino: InodeNumber,
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    /// Byte length for regular files and symlinks.
    pub size: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub content: InodeContent,
}

impl Inode {
    /// A new record with one link (two for directories) and all three
    /// timestamps set to `now`.
    #[must_use]
    pub fn new(
        ino: InodeNumber,
        content: InodeContent,
        perm: u32,
        owner: (u32, u32),
        now: Timestamp,
    ) -> Self {
        let (nlink, size) = match &content {
            InodeContent::Directory(_) => (2, 0),
            InodeContent::Symlink(target) => (1, target.len() as u64),
            InodeContent::Regular(_) => (1, 0),
        };
        Self {
            ino,
            perm,
            uid: owner.0,
            gid: owner.1,
            nlink,
            size,
            atime: now,
            mtime: now,
            ctime: now,
            content,
        }
    }

    #[must_use]
    pub fn kind(&self) -> FileType {
        self.content.kind()
    }

    /// Bytes returned to the pool when this inode is freed.
    #[must_use]
    pub fn storage_bytes(&self) -> u64 {
        INODE_FOOTPRINT + self.content.storage_bytes()
    }

    pub fn dir(&self) -> Result<&Directory> {
        match &self.content {
            InodeContent::Directory(dir) => Ok(dir),
            _ => Err(PmfsError::NotDirectory),
        }
    }

    pub fn dir_mut(&mut self) -> Result<&mut Directory> {
        match &mut self.content {
            InodeContent::Directory(dir) => Ok(dir),
            _ => Err(PmfsError::NotDirectory),
        }
    }

    pub fn extents(&self) -> Result<&ExtentList> {
        match &self.content {
            InodeContent::Regular(extents) => Ok(extents),
            InodeContent::Directory(_) => Err(PmfsError::IsDirectory),
            InodeContent::Symlink(_) => Err(PmfsError::InvalidArgument(
                "symlink has no data extents".into(),
            )),
        }
    }

    pub fn extents_mut(&mut self) -> Result<&mut ExtentList> {
        match &mut self.content {
            InodeContent::Regular(extents) => Ok(extents),
            InodeContent::Directory(_) => Err(PmfsError::IsDirectory),
            InodeContent::Symlink(_) => Err(PmfsError::InvalidArgument(
                "symlink has no data extents".into(),
            )),
        }
    }

    pub fn symlink_target(&self) -> Result<&str> {
        match &self.content {
            InodeContent::Symlink(target) => Ok(target),
            _ => Err(PmfsError::InvalidArgument("not a symlink".into())),
        }
    }

    /// Data changed: bump mtime and ctime.
    pub fn touch_modified(&mut self, now: Timestamp) {
        self.mtime = now;
        self.ctime = now;
    }

    /// Metadata changed: bump ctime.
    pub fn touch_changed(&mut self, now: Timestamp) {
        self.ctime = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_directory_starts_with_two_links() {
        let ino = InodeNumber(5);
        let dir = Inode::new(
            ino,
            InodeContent::Directory(Directory::new(ino, InodeNumber(1))),
            0o755,
            (0, 0),
            Timestamp::new(1, 0),
        );
        assert_eq!(dir.nlink, 2);
        assert_eq!(dir.kind(), FileType::Directory);
        assert!(dir.dir().expect("dir").is_empty());
        assert!(matches!(dir.extents(), Err(PmfsError::IsDirectory)));
    }

    #[test]
    fn symlink_size_is_target_length() {
        let link = Inode::new(
            InodeNumber(6),
            InodeContent::Symlink("../target".into()),
            0o777,
            (1, 2),
            Timestamp::EPOCH,
        );
        assert_eq!(link.size, 9);
        assert_eq!(link.symlink_target().expect("target"), "../target");
        assert_eq!(link.storage_bytes(), INODE_FOOTPRINT + 9);
        assert!(matches!(link.dir(), Err(PmfsError::NotDirectory)));
    }
}

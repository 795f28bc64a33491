//! Logical pool images.
//!
//! A [`PoolImage`] is the persistent content of a pool: its configuration,
//! the root table and every inode record. Images are what a pool is saved
//! as and rebuilt from, and what crash-consistency checks compare.

use crate::PoolFs;
use pmfs_error::{PmfsError, Result};
use pmfs_inode::{Inode, InodeContent, InodeTable};
use pmfs_pool::{Clock, Pool, PoolConfig, SystemClock};
use pmfs_types::InodeNumber;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolImage {
    pub config: PoolConfig,
    /// Root directories, indexed like [`PoolFs::open_root`].
    pub roots: Vec<InodeNumber>,
    /// Next inode number to hand out.
    pub next_ino: u64,
    /// Every stored inode, ordered by number.
    pub inodes: Vec<Inode>,
}

impl PoolImage {
    /// Pool bytes the stored inodes account for.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.inodes.iter().map(Inode::storage_bytes).sum()
    }

    /// Check that the roots exist and every directory entry names a
    /// stored inode.
    pub fn validate(&self) -> Result<()> {
        if self.roots.len() != self.config.root_count {
            return Err(PmfsError::Corruption {
                ino: 0,
                detail: format!(
                    "image has {} roots, config declares {}",
                    self.roots.len(),
                    self.config.root_count
                ),
            });
        }
        let mut by_ino: HashMap<InodeNumber, &Inode> = HashMap::with_capacity(self.inodes.len());
        for inode in &self.inodes {
            if by_ino.insert(inode.ino, inode).is_some() {
                return Err(PmfsError::Corruption {
                    ino: inode.ino.0,
                    detail: "inode stored twice".into(),
                });
            }
        }
        for root in &self.roots {
            if !by_ino.get(root).is_some_and(|inode| inode.kind().is_dir()) {
                return Err(PmfsError::Corruption {
                    ino: root.0,
                    detail: "root is missing or not a directory".into(),
                });
            }
        }
        for inode in &self.inodes {
            let InodeContent::Directory(dir) = &inode.content else {
                continue;
            };
            if let Some(entry) = dir.iter().find(|entry| !by_ino.contains_key(&entry.ino)) {
                return Err(PmfsError::Corruption {
                    ino: inode.ino.0,
                    detail: format!("entry {:?} names missing inode {}", entry.name, entry.ino),
                });
            }
        }
        Ok(())
    }
}

impl PoolFs {
    /// Snapshot the pool. Concurrent mutations may or may not be captured,
    /// so take images while the pool is quiescent.
    #[must_use]
    pub fn export_image(&self) -> PoolImage {
        PoolImage {
            config: self.config().clone(),
            roots: self.roots.iter().map(|root| root.ino()).collect(),
            next_ino: self.table.next_ino(),
            inodes: self.table.export(),
        }
    }

    /// Rebuild a pool from an image.
    pub fn from_image(image: PoolImage) -> Result<Self> {
        Self::from_image_with_clock(image, Arc::new(SystemClock))
    }

    /// Like [`PoolFs::from_image`], reading time from `clock`.
    ///
    /// Inodes with no links were only kept alive by handles of the pool
    /// that exported them; they are dropped.
    pub fn from_image_with_clock(mut image: PoolImage, clock: Arc<dyn Clock>) -> Result<Self> {
        let before = image.inodes.len();
        image.inodes.retain(|inode| inode.nlink > 0);
        if image.inodes.len() != before {
            info!(dropped = before - image.inodes.len(), "orphan inodes dropped from image");
        }
        image.validate()?;
        let pool = Arc::new(Pool::with_clock(image.config.clone(), clock)?);
        pool.restore_usage(image.used_bytes())?;
        let inodes = image.inodes.len();
        let table = Arc::new(InodeTable::from_inodes(image.inodes, image.next_ino));
        info!(
            inodes,
            used_bytes = pool.used_bytes(),
            roots = image.roots.len(),
            "pool image loaded"
        );
        Self::assemble(pool, table, &image.roots)
    }

    /// Write the pool image to `path` as JSON.
    pub fn save_image(&self, path: &Path) -> Result<()> {
        let image = self.export_image();
        let bytes = serde_json::to_vec_pretty(&image).map_err(|err| PmfsError::Corruption {
            ino: 0,
            detail: format!("serialize pool image: {err}"),
        })?;
        std::fs::write(path, bytes)?;
        info!(
            path = %path.display(),
            inodes = image.inodes.len(),
            "pool image saved"
        );
        Ok(())
    }

    /// Load a pool saved by [`PoolFs::save_image`].
    pub fn load_image(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let image: PoolImage =
            serde_json::from_slice(&bytes).map_err(|err| PmfsError::Corruption {
                ino: 0,
                detail: format!("pool image {}: {err}", path.display()),
            })?;
        Self::from_image(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpenFlags;

    fn populated() -> PoolFs {
        let fs = PoolFs::create(PoolConfig::default()).expect("create");
        fs.mkdir("/d", 0o755).expect("mkdir");
        let f = fs
            .open("/d/f", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .expect("create");
        fs.write(&f, b"persisted bytes").expect("write");
        fs.symlink("d/f", "/s").expect("symlink");
        fs
    }

    #[test]
    fn image_accounts_for_pool_usage() {
        let fs = populated();
        let image = fs.export_image();
        image.validate().expect("valid");
        assert_eq!(image.used_bytes(), fs.stats().used_bytes);
        assert_eq!(image.roots.len(), fs.root_count());
    }

    #[test]
    fn rebuilt_pool_serves_the_same_tree() {
        let fs = populated();
        let image = fs.export_image();
        let copy = PoolFs::from_image(image.clone()).expect("rebuild");
        assert_eq!(copy.export_image(), image);
        let f = copy.open("/s", OpenFlags::empty(), 0).expect("open via link");
        let mut buf = [0u8; 32];
        let n = copy.read(&f, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"persisted bytes");
        copy.mkdir("/d/new", 0o755).expect("new inode numbers still work");
    }

    #[test]
    fn orphans_are_dropped_on_load() {
        let fs = populated();
        let held = fs.open("/d/f", OpenFlags::empty(), 0).expect("hold");
        fs.unlink("/d/f").expect("unlink");
        let image = fs.export_image();
        assert!(image.inodes.iter().any(|inode| inode.nlink == 0));
        let copy = PoolFs::from_image(image).expect("rebuild");
        assert_eq!(copy.inode_count(), fs.inode_count() - 1);
        assert_eq!(copy.stats().used_bytes, copy.export_image().used_bytes());
        drop(held);
    }

    #[test]
    fn dangling_entries_are_corruption() {
        let fs = populated();
        let mut image = fs.export_image();
        let d = fs.stat("/d").expect("stat").ino;
        image.inodes.retain(|inode| inode.ino != d);
        assert!(matches!(
            PoolFs::from_image(image),
            Err(PmfsError::Corruption { .. })
        ));
    }
}

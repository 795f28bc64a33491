//! Creating and removing names: mkdir, symlink, link, unlink, rmdir.

use crate::path::{Anchor, ParentPath};
use crate::{PoolFs, check_mode, log_failure, reject_unknown};
use pmfs_dir::{DOT, DOTDOT, Directory, entry_footprint, is_dot_or_dotdot, validate_name};
use pmfs_error::{PmfsError, Result};
use pmfs_inode::{Inode, InodeContent, LockSet, VinodeRef};
use pmfs_pool::AllocSite;
use pmfs_types::{AtFlags, InodeNumber, PATH_MAX};
use tracing::debug;

/// The final component of a path that is about to be created.
pub(crate) fn creatable_name(parent: &ParentPath) -> Result<&str> {
    match parent.name.as_deref() {
        None => Err(PmfsError::Exists),
        Some(name) if is_dot_or_dotdot(name) => Err(PmfsError::Exists),
        Some(name) => {
            validate_name(name)?;
            Ok(name)
        }
    }
}

/// Inode `name` refers to in a locked directory.
pub(crate) fn entry_target(dir: &Inode, name: &str) -> Option<InodeNumber> {
    dir.dir().ok()?.lookup(name).map(|entry| entry.ino)
}

impl PoolFs {
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.mkdirat(Anchor::Cwd, path, mode)
    }

    pub fn mkdirat(&self, anchor: Anchor<'_>, path: &str, mode: u32) -> Result<()> {
        self.mkdir_inner(anchor, path, mode)
            .inspect_err(log_failure("mkdir", path))
    }

    fn mkdir_inner(&self, anchor: Anchor<'_>, path: &str, mode: u32) -> Result<()> {
        check_mode(mode)?;
        let parent = self.resolve_parent(anchor, path)?;
        let name = creatable_name(&parent)?;
        let parent_ino = parent.dir.ino();
        self.create_entry(&parent.dir, name, mode, |ino| {
            InodeContent::Directory(Directory::new(ino, parent_ino))
        })
        .map(drop)
    }

    /// Create `target` as the contents of a new symlink at `linkpath`.
    pub fn symlink(&self, target: &str, linkpath: &str) -> Result<()> {
        self.symlinkat(target, Anchor::Cwd, linkpath)
    }

    pub fn symlinkat(&self, target: &str, anchor: Anchor<'_>, linkpath: &str) -> Result<()> {
        self.symlink_inner(target, anchor, linkpath)
            .inspect_err(log_failure("symlink", linkpath))
    }

    fn symlink_inner(&self, target: &str, anchor: Anchor<'_>, linkpath: &str) -> Result<()> {
        if target.is_empty() {
            return Err(PmfsError::NotFound("empty symlink target".into()));
        }
        if target.len() >= PATH_MAX {
            return Err(PmfsError::NameTooLong);
        }
        let parent = self.resolve_parent(anchor, linkpath)?;
        let name = creatable_name(&parent)?;
        // A trailing slash names a directory, which a symlink never is.
        if parent.trailing_slash {
            return Err(if entry_target(&parent.dir.read(), name).is_some() {
                PmfsError::Exists
            } else {
                PmfsError::NotFound(format!("{linkpath}: trailing slash on a symlink"))
            });
        }
        self.create_entry(&parent.dir, name, 0o777, |_| {
            InodeContent::Symlink(target.to_owned())
        })
        .map(drop)
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        self.readlinkat(Anchor::Cwd, path)
    }

    pub fn readlinkat(&self, anchor: Anchor<'_>, path: &str) -> Result<String> {
        self.resolve(anchor, path, false)
            .and_then(|link| link.read().symlink_target().map(str::to_owned))
            .inspect_err(log_failure("readlink", path))
    }

    /// Allocate a new inode and link it into `dir` as `name`, in one
    /// transaction. Returns the new inode's vinode.
    pub(crate) fn create_entry(
        &self,
        dir: &VinodeRef,
        name: &str,
        perm: u32,
        content: impl FnOnce(InodeNumber) -> InodeContent,
    ) -> Result<VinodeRef> {
        let mut parent = dir.write();
        if parent.dir()?.lookup(name).is_some() {
            return Err(PmfsError::Exists);
        }
        if parent.nlink == 0 {
            return Err(PmfsError::NotFound(format!(
                "directory {} was removed",
                dir.ino()
            )));
        }
        let mut tx = self.pool.begin();
        tx.reserve(AllocSite::DirEntry, entry_footprint(name))?;
        let now = tx.now();
        let slot = self.table.create(&mut tx, |ino| {
            Inode::new(ino, content(ino), perm, (0, 0), now)
        })?;
        let (ino, kind) = (slot.ino(), slot.kind());
        parent.dir_mut()?.insert(name, ino, kind)?;
        if kind.is_dir() {
            parent.nlink += 1;
        }
        parent.touch_modified(now);
        tx.commit();
        debug!(dir = dir.ino().0, name, ino = ino.0, ?kind, "entry created");
        self.cache.materialize(ino, Some(dir))
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        self.unlinkat(Anchor::Cwd, path, AtFlags::empty())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.unlinkat(Anchor::Cwd, path, AtFlags::REMOVEDIR)
    }

    /// Remove a name; with [`AtFlags::REMOVEDIR`] it must be an empty
    /// directory.
    pub fn unlinkat(&self, anchor: Anchor<'_>, path: &str, flags: AtFlags) -> Result<()> {
        let (op, result) = if flags.contains(AtFlags::REMOVEDIR) {
            ("rmdir", self.remove_dir(anchor, path, flags))
        } else {
            ("unlink", self.remove_file(anchor, path, flags))
        };
        result.inspect_err(log_failure(op, path))
    }

    fn remove_file(&self, anchor: Anchor<'_>, path: &str, flags: AtFlags) -> Result<()> {
        reject_unknown(flags.bits(), AtFlags::REMOVEDIR.bits(), "unlinkat")?;
        let parent = self.resolve_parent(anchor, path)?;
        let name = match parent.name.as_deref() {
            Some(name) if !is_dot_or_dotdot(name) => name,
            _ => return Err(PmfsError::IsDirectory),
        };
        let dir = &parent.dir;
        loop {
            let child = self.lookup_child(dir, name)?;
            if child.is_dir() {
                return Err(PmfsError::IsDirectory);
            }
            if parent.trailing_slash {
                return Err(PmfsError::NotDirectory);
            }
            let mut locks = LockSet::lock([&**dir, &*child]);
            if entry_target(locks.get(dir.ino())?, name) != Some(child.ino()) {
                continue;
            }

            let mut tx = self.pool.begin();
            let now = tx.now();
            let dir_inode = locks.get_mut(dir.ino())?;
            dir_inode.dir_mut()?.remove(name)?;
            dir_inode.touch_modified(now);
            tx.release(entry_footprint(name));

            let inode = locks.get_mut(child.ino())?;
            inode.nlink = inode.nlink.saturating_sub(1);
            inode.touch_changed(now);
            let nlink = inode.nlink;
            // Our lookup holds the only reference: nobody can reach the
            // inode after this, so free it now. Otherwise it becomes an
            // orphan, reclaimed when the last reference drops.
            if nlink == 0 && child.ref_count() == 1 {
                self.table.free(&mut tx, inode);
            }
            tx.commit();
            debug!(dir = dir.ino().0, name, ino = child.ino().0, nlink, "unlinked");
            return Ok(());
        }
    }

    fn remove_dir(&self, anchor: Anchor<'_>, path: &str, flags: AtFlags) -> Result<()> {
        reject_unknown(flags.bits(), AtFlags::REMOVEDIR.bits(), "unlinkat")?;
        let parent = self.resolve_parent(anchor, path)?;
        let name = match parent.name.as_deref() {
            None => return Err(PmfsError::Busy),
            Some(DOT) => {
                return Err(PmfsError::InvalidArgument(
                    "cannot remove the directory through \".\"".into(),
                ));
            }
            Some(DOTDOT) => return Err(PmfsError::NotEmpty),
            Some(name) => name,
        };
        let dir = &parent.dir;
        loop {
            let child = self.lookup_child(dir, name)?;
            if !child.is_dir() {
                return Err(PmfsError::NotDirectory);
            }
            if child.is_root() {
                return Err(PmfsError::Busy);
            }
            let mut locks = LockSet::lock([&**dir, &*child]);
            if entry_target(locks.get(dir.ino())?, name) != Some(child.ino()) {
                continue;
            }
            if !locks.get(child.ino())?.dir()?.is_empty() {
                return Err(PmfsError::NotEmpty);
            }

            let mut tx = self.pool.begin();
            let now = tx.now();
            let dir_inode = locks.get_mut(dir.ino())?;
            dir_inode.dir_mut()?.remove(name)?;
            dir_inode.nlink = dir_inode.nlink.saturating_sub(1);
            dir_inode.touch_modified(now);
            tx.release(entry_footprint(name));

            let inode = locks.get_mut(child.ino())?;
            inode.nlink = 0;
            inode.touch_changed(now);
            if child.ref_count() == 1 {
                self.table.free(&mut tx, inode);
            }
            tx.commit();
            debug!(dir = dir.ino().0, name, ino = child.ino().0, "directory removed");
            return Ok(());
        }
    }

    pub fn link(&self, oldpath: &str, newpath: &str) -> Result<()> {
        self.linkat(Anchor::Cwd, oldpath, Anchor::Cwd, newpath, AtFlags::empty())
    }

    /// Add `newpath` as another name for the inode at `oldpath`.
    ///
    /// [`AtFlags::SYMLINK_FOLLOW`] links the symlink's target instead of the
    /// symlink; [`AtFlags::EMPTY_PATH`] with an empty `oldpath` links the
    /// anchor itself.
    pub fn linkat(
        &self,
        old_anchor: Anchor<'_>,
        oldpath: &str,
        new_anchor: Anchor<'_>,
        newpath: &str,
        flags: AtFlags,
    ) -> Result<()> {
        self.link_inner(old_anchor, oldpath, new_anchor, newpath, flags)
            .inspect_err(log_failure("link", newpath))
    }

    fn link_inner(
        &self,
        old_anchor: Anchor<'_>,
        oldpath: &str,
        new_anchor: Anchor<'_>,
        newpath: &str,
        flags: AtFlags,
    ) -> Result<()> {
        reject_unknown(
            flags.bits(),
            (AtFlags::SYMLINK_FOLLOW | AtFlags::EMPTY_PATH).bits(),
            "linkat",
        )?;
        let source = self.resolve_at(
            old_anchor,
            oldpath,
            flags.contains(AtFlags::SYMLINK_FOLLOW),
            flags.contains(AtFlags::EMPTY_PATH),
        )?;
        if source.is_dir() {
            return Err(PmfsError::NotPermitted);
        }
        let parent = self.resolve_parent(new_anchor, newpath)?;
        let name = creatable_name(&parent)?;
        if parent.trailing_slash {
            return Err(PmfsError::NotDirectory);
        }
        let dir = &parent.dir;
        let mut locks = LockSet::lock([&**dir, &*source]);
        let dir_inode = locks.get(dir.ino())?;
        if dir_inode.dir()?.lookup(name).is_some() {
            return Err(PmfsError::Exists);
        }
        if dir_inode.nlink == 0 {
            return Err(PmfsError::NotFound(format!(
                "directory {} was removed",
                dir.ino()
            )));
        }
        if locks.get(source.ino())?.nlink == 0 {
            return Err(PmfsError::NotFound("link source was removed".into()));
        }

        let mut tx = self.pool.begin();
        tx.reserve(AllocSite::DirEntry, entry_footprint(name))?;
        let now = tx.now();
        let dir_inode = locks.get_mut(dir.ino())?;
        dir_inode.dir_mut()?.insert(name, source.ino(), source.kind())?;
        dir_inode.touch_modified(now);
        let inode = locks.get_mut(source.ino())?;
        inode.nlink += 1;
        inode.touch_changed(now);
        let nlink = inode.nlink;
        tx.commit();
        debug!(dir = dir.ino().0, name, ino = source.ino().0, nlink, "linked");
        Ok(())
    }
}

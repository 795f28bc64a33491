//! rename, renameat and renameat2.
//!
//! Both parents, the moved inode and any replaced inode are locked
//! together through a [`LockSet`]. Names are resolved without locks, so
//! after locking the entries are checked again and the lookup is redone if
//! a concurrent operation changed them in between.
//!
//! A rename that moves a directory to a new parent also holds the
//! pool-wide rename lock. The ancestry check reads the cached parent
//! chain, which only such renames modify. Every other rename is ordered by
//! its lock set alone.

use crate::namespace::entry_target;
use crate::path::Anchor;
use crate::{PoolFs, log_failure, reject_unknown};
use pmfs_dir::{entry_footprint, is_dot_or_dotdot, validate_name};
use pmfs_error::{PmfsError, Result};
use pmfs_inode::{LockSet, Vinode, VinodeRef};
use pmfs_pool::AllocSite;
use pmfs_types::{InodeNumber, RenameFlags};
use tracing::debug;

/// One resolved rename, with every participant referenced.
struct Move<'a> {
    src_dir: &'a VinodeRef,
    src_name: &'a str,
    dst_dir: &'a VinodeRef,
    dst_name: &'a str,
    moved: &'a VinodeRef,
    /// Current target of `dst_name`, if any.
    victim: Option<&'a VinodeRef>,
}

impl Move<'_> {
    fn crosses_directories(&self) -> bool {
        self.src_dir.ino() != self.dst_dir.ino()
    }
}

impl PoolFs {
    pub fn rename(&self, oldpath: &str, newpath: &str) -> Result<()> {
        self.renameat2(Anchor::Cwd, oldpath, Anchor::Cwd, newpath, RenameFlags::empty())
    }

    pub fn renameat(
        &self,
        old_anchor: Anchor<'_>,
        oldpath: &str,
        new_anchor: Anchor<'_>,
        newpath: &str,
    ) -> Result<()> {
        self.renameat2(old_anchor, oldpath, new_anchor, newpath, RenameFlags::empty())
    }

    /// Rename with [`RenameFlags::NOREPLACE`] or [`RenameFlags::EXCHANGE`].
    /// [`RenameFlags::WHITEOUT`] is rejected.
    pub fn renameat2(
        &self,
        old_anchor: Anchor<'_>,
        oldpath: &str,
        new_anchor: Anchor<'_>,
        newpath: &str,
        flags: RenameFlags,
    ) -> Result<()> {
        self.rename_inner(old_anchor, oldpath, new_anchor, newpath, flags)
            .inspect_err(log_failure("rename", oldpath))
    }

    fn rename_inner(
        &self,
        old_anchor: Anchor<'_>,
        oldpath: &str,
        new_anchor: Anchor<'_>,
        newpath: &str,
        flags: RenameFlags,
    ) -> Result<()> {
        reject_unknown(flags.bits(), RenameFlags::all().bits(), "renameat2")?;
        if flags.contains(RenameFlags::WHITEOUT) {
            return Err(PmfsError::InvalidArgument(
                "whiteout renames are not supported".into(),
            ));
        }
        if flags.contains(RenameFlags::NOREPLACE | RenameFlags::EXCHANGE) {
            return Err(PmfsError::InvalidArgument(
                "NOREPLACE and EXCHANGE are mutually exclusive".into(),
            ));
        }

        let src = self.resolve_parent(old_anchor, oldpath)?;
        let dst = self.resolve_parent(new_anchor, newpath)?;
        let (Some(src_name), Some(dst_name)) = (src.name.as_deref(), dst.name.as_deref()) else {
            return Err(PmfsError::Busy);
        };
        if is_dot_or_dotdot(src_name) || is_dot_or_dotdot(dst_name) {
            return Err(PmfsError::InvalidArgument(
                "cannot rename \".\" or \"..\"".into(),
            ));
        }
        validate_name(dst_name)?;

        let cross = src.dir.ino() != dst.dir.ino();
        let exchange = flags.contains(RenameFlags::EXCHANGE);
        let mut serial = None;
        loop {
            let moved = self.lookup_child(&src.dir, src_name)?;
            let victim = match self.lookup_child(&dst.dir, dst_name) {
                Ok(victim) => Some(victim),
                Err(PmfsError::NotFound(_)) => None,
                Err(err) => return Err(err),
            };
            if (src.trailing_slash || dst.trailing_slash) && !moved.is_dir() {
                return Err(PmfsError::NotDirectory);
            }
            // Two names for one inode: nothing to do.
            if victim.as_ref().is_some_and(|v| v.ino() == moved.ino()) {
                return Ok(());
            }
            // Moving a directory to a new parent can close a cycle, so the
            // ancestry check runs under `rename_lock`. The lock is taken
            // before any inode lock, then every name is looked up again.
            let moves_dir = moved.is_dir()
                || (exchange && victim.as_ref().is_some_and(|v| v.is_dir()));
            if cross && moves_dir && serial.is_none() {
                serial = Some(self.rename_lock.lock());
                continue;
            }

            let mut participants: Vec<&Vinode> = vec![&*src.dir, &*dst.dir, &*moved];
            participants.extend(victim.as_deref());
            let mut locks = LockSet::lock(participants);
            let src_now = entry_target(locks.get(src.dir.ino())?, src_name);
            let dst_now = entry_target(locks.get(dst.dir.ino())?, dst_name);
            if src_now != Some(moved.ino()) || dst_now != victim.as_ref().map(|v| v.ino()) {
                continue;
            }

            let op = Move {
                src_dir: &src.dir,
                src_name,
                dst_dir: &dst.dir,
                dst_name,
                moved: &moved,
                victim: victim.as_ref(),
            };
            return if exchange {
                self.exchange_locked(&mut locks, &op)
            } else {
                self.move_locked(&mut locks, &op, flags.contains(RenameFlags::NOREPLACE))
            };
        }
    }

    fn move_locked(&self, locks: &mut LockSet<'_>, op: &Move<'_>, no_replace: bool) -> Result<()> {
        let moving_dir = op.moved.is_dir();
        let cross = op.crosses_directories();
        if let Some(victim) = op.victim {
            if no_replace {
                return Err(PmfsError::Exists);
            }
            match (moving_dir, victim.is_dir()) {
                (true, false) => return Err(PmfsError::NotDirectory),
                (false, true) => return Err(PmfsError::IsDirectory),
                _ => {}
            }
            if victim.is_dir() && !locks.get(victim.ino())?.dir()?.is_empty() {
                return Err(PmfsError::NotEmpty);
            }
        }
        if moving_dir && cross && self.is_ancestor(op.moved.ino(), op.dst_dir) {
            return Err(PmfsError::InvalidArgument(
                "cannot move a directory beneath itself".into(),
            ));
        }
        if locks.get(op.dst_dir.ino())?.nlink == 0 {
            return Err(PmfsError::NotFound(format!(
                "directory {} was removed",
                op.dst_dir.ino()
            )));
        }

        let mut tx = self.pool.begin();
        if op.victim.is_none() {
            tx.reserve(AllocSite::DirEntry, entry_footprint(op.dst_name))?;
        }
        let now = tx.now();
        let (moved_ino, kind) = (op.moved.ino(), op.moved.kind());

        let dst = locks.get_mut(op.dst_dir.ino())?;
        if op.victim.is_some() {
            dst.dir_mut()?.retarget(op.dst_name, moved_ino, kind)?;
        } else {
            dst.dir_mut()?.insert(op.dst_name, moved_ino, kind)?;
        }
        dst.touch_modified(now);
        if let Some(victim) = op.victim {
            if victim.is_dir() {
                // The victim's `..` no longer links back.
                dst.nlink = dst.nlink.saturating_sub(1);
            }
            let inode = locks.get_mut(victim.ino())?;
            inode.nlink = if victim.is_dir() {
                0
            } else {
                inode.nlink.saturating_sub(1)
            };
            inode.touch_changed(now);
            if inode.nlink == 0 && victim.ref_count() == 1 {
                self.table.free(&mut tx, inode);
            }
        }

        let src = locks.get_mut(op.src_dir.ino())?;
        src.dir_mut()?.remove(op.src_name)?;
        src.touch_modified(now);
        tx.release(entry_footprint(op.src_name));
        if moving_dir && cross {
            src.nlink = src.nlink.saturating_sub(1);
            locks.get_mut(op.dst_dir.ino())?.nlink += 1;
        }

        let moved = locks.get_mut(moved_ino)?;
        if moving_dir && cross {
            moved.dir_mut()?.set_parent(op.dst_dir.ino());
        }
        moved.touch_changed(now);
        tx.commit();
        if moving_dir && cross {
            self.cache.reparent(op.moved, op.dst_dir);
        }
        debug!(
            from_dir = op.src_dir.ino().0,
            from = op.src_name,
            to_dir = op.dst_dir.ino().0,
            to = op.dst_name,
            ino = moved_ino.0,
            replaced = ?op.victim.map(|v| v.ino().0),
            "renamed"
        );
        Ok(())
    }

    fn exchange_locked(&self, locks: &mut LockSet<'_>, op: &Move<'_>) -> Result<()> {
        let Some(other) = op.victim else {
            return Err(PmfsError::NotFound(op.dst_name.to_owned()));
        };
        let cross = op.crosses_directories();
        if cross
            && ((op.moved.is_dir() && self.is_ancestor(op.moved.ino(), op.dst_dir))
                || (other.is_dir() && self.is_ancestor(other.ino(), op.src_dir)))
        {
            return Err(PmfsError::InvalidArgument(
                "cannot move a directory beneath itself".into(),
            ));
        }

        let tx = self.pool.begin();
        let now = tx.now();
        let src = locks.get_mut(op.src_dir.ino())?;
        src.dir_mut()?
            .retarget(op.src_name, other.ino(), other.kind())?;
        src.touch_modified(now);
        let dst = locks.get_mut(op.dst_dir.ino())?;
        dst.dir_mut()?
            .retarget(op.dst_name, op.moved.ino(), op.moved.kind())?;
        dst.touch_modified(now);

        if cross {
            for (node, from, to) in [
                (op.moved, op.src_dir, op.dst_dir),
                (other, op.dst_dir, op.src_dir),
            ] {
                if !node.is_dir() {
                    continue;
                }
                locks.get_mut(node.ino())?.dir_mut()?.set_parent(to.ino());
                let from_inode = locks.get_mut(from.ino())?;
                from_inode.nlink = from_inode.nlink.saturating_sub(1);
                locks.get_mut(to.ino())?.nlink += 1;
            }
        }
        locks.get_mut(op.moved.ino())?.touch_changed(now);
        locks.get_mut(other.ino())?.touch_changed(now);
        tx.commit();
        if cross {
            self.cache.reparent(op.moved, op.dst_dir);
            self.cache.reparent(other, op.src_dir);
        }
        debug!(
            a_dir = op.src_dir.ino().0,
            a = op.src_name,
            b_dir = op.dst_dir.ino().0,
            b = op.dst_name,
            "exchanged"
        );
        Ok(())
    }

    /// Whether `ancestor` is `dir` itself or one of its cached parents.
    fn is_ancestor(&self, ancestor: InodeNumber, dir: &VinodeRef) -> bool {
        let mut current = dir.clone();
        loop {
            if current.ino() == ancestor {
                return true;
            }
            if current.is_root() {
                return false;
            }
            match current.parent().and_then(|p| self.cache.acquire_cached(p)) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileType, OpenFlags, PoolConfig};
    use std::sync::{Arc, mpsc};
    use std::thread;
    use std::time::Duration;

    fn fs() -> PoolFs {
        PoolFs::create(PoolConfig::default()).expect("create")
    }

    fn touch(fs: &PoolFs, path: &str) {
        fs.open(path, OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
            .expect("create file");
    }

    #[test]
    fn rename_within_a_directory() {
        let fs = fs();
        touch(&fs, "/a");
        let ino = fs.stat("/a").expect("stat").ino;
        fs.rename("/a", "/b").expect("rename");
        assert!(matches!(fs.stat("/a"), Err(PmfsError::NotFound(_))));
        assert_eq!(fs.stat("/b").expect("stat").ino, ino);
    }

    #[test]
    fn rename_replaces_and_frees_the_victim() {
        let fs = fs();
        touch(&fs, "/a");
        touch(&fs, "/b");
        let inodes = fs.inode_count();
        fs.rename("/a", "/b").expect("rename");
        assert_eq!(fs.inode_count(), inodes - 1);
    }

    #[test]
    fn directory_move_fixes_link_counts_and_dotdot() {
        let fs = fs();
        fs.mkdir("/x", 0o755).expect("x");
        fs.mkdir("/y", 0o755).expect("y");
        fs.mkdir("/x/d", 0o755).expect("d");
        fs.rename("/x/d", "/y/d").expect("rename");
        assert_eq!(fs.stat("/x").expect("x").nlink, 2);
        assert_eq!(fs.stat("/y").expect("y").nlink, 3);
        let y = fs.stat("/y").expect("y").ino;
        assert_eq!(fs.stat("/y/d/..").expect("dotdot").ino, y);
    }

    #[test]
    fn directory_cannot_move_beneath_itself() {
        let fs = fs();
        fs.mkdir("/a", 0o755).expect("a");
        fs.mkdir("/a/b", 0o755).expect("b");
        assert!(matches!(
            fs.rename("/a", "/a/b/c"),
            Err(PmfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.rename("/a", "/a/c"),
            Err(PmfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn type_mismatch_and_non_empty_targets() {
        let fs = fs();
        fs.mkdir("/d", 0o755).expect("d");
        fs.mkdir("/full", 0o755).expect("full");
        touch(&fs, "/full/x");
        touch(&fs, "/f");
        assert_eq!(fs.rename("/d", "/f"), Err(PmfsError::NotDirectory));
        assert_eq!(fs.rename("/f", "/d"), Err(PmfsError::IsDirectory));
        assert_eq!(fs.rename("/d", "/full"), Err(PmfsError::NotEmpty));
        fs.mkdir("/empty", 0o755).expect("empty");
        fs.rename("/d", "/empty").expect("replace empty dir");
        assert_eq!(fs.stat("/").expect("root").nlink, 2 + 2);
    }

    #[test]
    fn noreplace_and_flag_validation() {
        let fs = fs();
        touch(&fs, "/a");
        touch(&fs, "/b");
        assert_eq!(
            fs.renameat2(Anchor::Cwd, "/a", Anchor::Cwd, "/b", RenameFlags::NOREPLACE),
            Err(PmfsError::Exists)
        );
        fs.renameat2(Anchor::Cwd, "/a", Anchor::Cwd, "/c", RenameFlags::NOREPLACE)
            .expect("fresh name");
        for flags in [
            RenameFlags::WHITEOUT,
            RenameFlags::NOREPLACE | RenameFlags::EXCHANGE,
            RenameFlags::from_bits_retain(1 << 7),
        ] {
            assert!(matches!(
                fs.renameat2(Anchor::Cwd, "/b", Anchor::Cwd, "/c", flags),
                Err(PmfsError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn roots_and_dots_cannot_be_renamed() {
        let fs = fs();
        fs.mkdir("/d", 0o755).expect("d");
        assert_eq!(fs.rename("/", "/x"), Err(PmfsError::Busy));
        assert_eq!(fs.rename("/d", "/"), Err(PmfsError::Busy));
        assert!(matches!(
            fs.rename("/d/.", "/x"),
            Err(PmfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.rename("/d", "/d/.."),
            Err(PmfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn exchange_requires_both_names() {
        let fs = fs();
        touch(&fs, "/a");
        assert!(matches!(
            fs.renameat2(Anchor::Cwd, "/a", Anchor::Cwd, "/b", RenameFlags::EXCHANGE),
            Err(PmfsError::NotFound(_))
        ));
    }

    #[test]
    fn exchange_swaps_file_and_directory_across_parents() {
        let fs = fs();
        fs.mkdir("/p", 0o755).expect("p");
        fs.mkdir("/q", 0o755).expect("q");
        fs.mkdir("/p/dir", 0o755).expect("dir");
        fs.symlink("target", "/q/link").expect("link");
        let dir_ino = fs.stat("/p/dir").expect("dir").ino;
        fs.renameat2(
            Anchor::Cwd,
            "/p/dir",
            Anchor::Cwd,
            "/q/link",
            RenameFlags::EXCHANGE,
        )
        .expect("exchange");
        assert_eq!(fs.lstat("/p/dir").expect("now link").kind, FileType::Symlink);
        assert_eq!(fs.stat("/q/link").expect("now dir").ino, dir_ino);
        assert_eq!(fs.stat("/p").expect("p").nlink, 2);
        assert_eq!(fs.stat("/q").expect("q").nlink, 3);
        let q = fs.stat("/q").expect("q").ino;
        assert_eq!(fs.stat("/q/link/..").expect("dotdot").ino, q);
    }

    #[test]
    fn only_directory_moves_wait_for_the_rename_lock() {
        let fs = Arc::new(fs());
        fs.mkdir("/a", 0o755).expect("a");
        fs.mkdir("/b", 0o755).expect("b");
        fs.mkdir("/a/d", 0o755).expect("d");
        touch(&fs, "/a/f");

        let held = fs.rename_lock.lock();
        let (file_tx, file_rx) = mpsc::channel();
        let worker = Arc::clone(&fs);
        thread::spawn(move || {
            let _ = file_tx.send(worker.rename("/a/f", "/b/f"));
        });
        let moved = file_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("file move finished while the rename lock was held");
        assert_eq!(moved, Ok(()));

        let (dir_tx, dir_rx) = mpsc::channel();
        let worker = Arc::clone(&fs);
        thread::spawn(move || {
            let _ = dir_tx.send(worker.rename("/a/d", "/b/d"));
        });
        assert!(dir_rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(held);
        let moved = dir_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("directory move finished");
        assert_eq!(moved, Ok(()));
        assert_eq!(fs.stat("/b").expect("b").nlink, 3);
        assert_eq!(fs.stat("/a").expect("a").nlink, 2);
    }
}

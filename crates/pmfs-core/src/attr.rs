//! Attributes: the stat, chmod and chown families.

use crate::path::Anchor;
use crate::{File, PoolFs, check_mode, log_failure, log_handle_failure, reject_unknown};
use pmfs_error::{PmfsError, Result};
use pmfs_inode::{Inode, InodeContent, Vinode};
use pmfs_types::{AtFlags, FileType, InodeNumber, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Block unit `blocks` is counted in.
const STAT_BLOCK_SIZE: u64 = 512;

/// Attributes of one inode, as returned by [`PoolFs::stat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Inode number.
    pub ino: InodeNumber,
    /// File type.
    pub kind: FileType,
    /// Permission bits (lower 12 bits of mode).
    pub perm: u32,
    /// Number of hard links. Directories count `.` and each child's `..`.
    pub nlink: u64,
    /// Owner user ID.
    pub uid: u32,
    /// Owner group ID.
    pub gid: u32,
    /// Byte length. For directories, the bytes their entries occupy.
    pub size: u64,
    /// Number of 512-byte blocks of pool storage held.
    pub blocks: u64,
    /// Preferred I/O block size.
    pub blksize: u64,
    /// Last access time.
    pub atime: Timestamp,
    /// Last modification time.
    pub mtime: Timestamp,
    /// Last status change time.
    pub ctime: Timestamp,
}

impl Stat {
    fn from_inode(inode: &Inode, blksize: u64) -> Self {
        let size = match &inode.content {
            InodeContent::Directory(dir) => dir.byte_size(),
            InodeContent::Regular(_) | InodeContent::Symlink(_) => inode.size,
        };
        Self {
            ino: inode.ino,
            kind: inode.kind(),
            perm: inode.perm,
            nlink: inode.nlink,
            uid: inode.uid,
            gid: inode.gid,
            size,
            blocks: inode.content.storage_bytes().div_ceil(STAT_BLOCK_SIZE),
            blksize,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
        }
    }

    /// Type and permission bits combined, as in `st_mode`.
    #[must_use]
    pub fn mode(&self) -> u32 {
        self.kind.mode_bits() | self.perm
    }
}

impl PoolFs {
    fn stat_vinode(&self, vinode: &Vinode) -> Stat {
        Stat::from_inode(&vinode.read(), self.config().block_size.get())
    }

    /// Stat `path`, following a final symlink.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        self.fstatat(Anchor::Cwd, path, AtFlags::empty())
    }

    /// Stat `path` without following a final symlink.
    pub fn lstat(&self, path: &str) -> Result<Stat> {
        self.fstatat(Anchor::Cwd, path, AtFlags::SYMLINK_NOFOLLOW)
    }

    /// Works on path-only handles too.
    pub fn fstat(&self, file: &File) -> Result<Stat> {
        self.check_owner(file)
            .map(|()| self.stat_vinode(file.vinode()))
            .inspect_err(log_handle_failure("fstat", file))
    }

    /// Accepts [`AtFlags::SYMLINK_NOFOLLOW`] and [`AtFlags::EMPTY_PATH`].
    pub fn fstatat(&self, anchor: Anchor<'_>, path: &str, flags: AtFlags) -> Result<Stat> {
        reject_unknown(
            flags.bits(),
            (AtFlags::SYMLINK_NOFOLLOW | AtFlags::EMPTY_PATH).bits(),
            "fstatat",
        )
        .and_then(|()| {
            self.resolve_at(
                anchor,
                path,
                !flags.contains(AtFlags::SYMLINK_NOFOLLOW),
                flags.contains(AtFlags::EMPTY_PATH),
            )
        })
        .map(|vinode| self.stat_vinode(&vinode))
        .inspect_err(log_failure("stat", path))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.fchmodat(Anchor::Cwd, path, mode, AtFlags::empty())
    }

    pub fn fchmod(&self, file: &File, mode: u32) -> Result<()> {
        self.attr_handle(file)
            .and_then(|()| self.set_mode(file.vinode(), mode))
            .inspect_err(log_handle_failure("fchmod", file))
    }

    /// Accepts [`AtFlags::SYMLINK_NOFOLLOW`].
    pub fn fchmodat(&self, anchor: Anchor<'_>, path: &str, mode: u32, flags: AtFlags) -> Result<()> {
        self.attr_target(anchor, path, flags, "fchmodat")
            .and_then(|vinode| self.set_mode(&vinode, mode))
            .inspect_err(log_failure("chmod", path))
    }

    /// Change ownership; `None` leaves that id unchanged.
    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.fchownat(Anchor::Cwd, path, uid, gid, AtFlags::empty())
    }

    pub fn lchown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.fchownat(Anchor::Cwd, path, uid, gid, AtFlags::SYMLINK_NOFOLLOW)
    }

    pub fn fchown(&self, file: &File, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.attr_handle(file)
            .and_then(|()| self.set_owner(file.vinode(), uid, gid))
            .inspect_err(log_handle_failure("fchown", file))
    }

    pub fn fchownat(
        &self,
        anchor: Anchor<'_>,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
        flags: AtFlags,
    ) -> Result<()> {
        self.attr_target(anchor, path, flags, "fchownat")
            .and_then(|vinode| self.set_owner(&vinode, uid, gid))
            .inspect_err(log_failure("chown", path))
    }

    fn attr_handle(&self, file: &File) -> Result<()> {
        self.check_owner(file)?;
        if file.flags().is_path_only() {
            return Err(PmfsError::BadHandle);
        }
        Ok(())
    }

    fn attr_target(
        &self,
        anchor: Anchor<'_>,
        path: &str,
        flags: AtFlags,
        call: &str,
    ) -> Result<pmfs_inode::VinodeRef> {
        reject_unknown(flags.bits(), AtFlags::SYMLINK_NOFOLLOW.bits(), call)?;
        self.resolve(anchor, path, !flags.contains(AtFlags::SYMLINK_NOFOLLOW))
    }

    fn set_mode(&self, vinode: &Vinode, mode: u32) -> Result<()> {
        check_mode(mode)?;
        self.set_attr(vinode, |inode| inode.perm = mode);
        trace!(ino = vinode.ino().0, mode, "mode changed");
        Ok(())
    }

    fn set_owner(&self, vinode: &Vinode, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.set_attr(vinode, |inode| {
            if let Some(uid) = uid {
                inode.uid = uid;
            }
            if let Some(gid) = gid {
                inode.gid = gid;
            }
        });
        trace!(ino = vinode.ino().0, ?uid, ?gid, "owner changed");
        Ok(())
    }

    /// Apply a metadata change and bump ctime, in one transaction.
    fn set_attr(&self, vinode: &Vinode, change: impl FnOnce(&mut Inode)) {
        let mut inode = vinode.write();
        let tx = self.pool.begin();
        change(&mut inode);
        inode.touch_changed(tx.now());
        tx.commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, OpenFlags, PoolConfig};
    use std::sync::Arc;

    fn fs() -> PoolFs {
        PoolFs::create(PoolConfig::default()).expect("create")
    }

    #[test]
    fn stat_reports_type_size_and_blocks() {
        let fs = fs();
        let f = fs
            .open("/f", OpenFlags::CREAT | OpenFlags::WRONLY, 0o640)
            .expect("create");
        fs.write(&f, &[1u8; 10]).expect("write");
        let st = fs.stat("/f").expect("stat");
        assert_eq!(st.kind, FileType::RegularFile);
        assert_eq!(st.perm, 0o640);
        assert_eq!(st.mode(), 0o100_640);
        assert_eq!(st.size, 10);
        assert_eq!(st.blocks, 4096 / 512);
        assert_eq!(st.blksize, 4096);
        assert_eq!(fs.fstat(&f).expect("fstat"), st);

        let root = fs.stat("/").expect("root");
        assert_eq!(root.kind, FileType::Directory);
        assert_eq!(root.nlink, 2);
        assert!(root.size > 0);
    }

    #[test]
    fn lstat_and_fstatat_flags() {
        let fs = fs();
        fs.mkdir("/d", 0o755).expect("mkdir");
        fs.symlink("/d", "/s").expect("symlink");
        assert_eq!(fs.stat("/s").expect("stat").kind, FileType::Directory);
        assert_eq!(fs.lstat("/s").expect("lstat").kind, FileType::Symlink);

        let d = fs.open("/d", OpenFlags::PATH, 0).expect("path handle");
        let st = fs
            .fstatat(Anchor::Handle(&d), "", AtFlags::EMPTY_PATH)
            .expect("empty path");
        assert_eq!(st.ino, d.ino());
        assert!(matches!(
            fs.fstatat(Anchor::Cwd, "/d", AtFlags::REMOVEDIR),
            Err(PmfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn chmod_and_chown_bump_ctime() {
        let clock = Arc::new(ManualClock::new(Timestamp::new(100, 0)));
        let fs = PoolFs::create_with_clock(PoolConfig::default(), clock.clone()).expect("create");
        fs.mkdir("/d", 0o755).expect("mkdir");
        clock.advance_secs(5);
        fs.chmod("/d", 0o700).expect("chmod");
        let st = fs.stat("/d").expect("stat");
        assert_eq!(st.perm, 0o700);
        assert_eq!(st.ctime, Timestamp::new(105, 0));
        assert_eq!(st.mtime, Timestamp::new(100, 0));

        fs.chown("/d", Some(10), None).expect("chown uid");
        fs.chown("/d", None, Some(20)).expect("chown gid");
        let st = fs.stat("/d").expect("stat");
        assert_eq!((st.uid, st.gid), (10, 20));

        assert!(matches!(
            fs.chmod("/d", 0o10_000),
            Err(PmfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn lchown_changes_the_link_itself() {
        let fs = fs();
        fs.mkdir("/d", 0o755).expect("mkdir");
        fs.symlink("/d", "/s").expect("symlink");
        fs.lchown("/s", Some(7), Some(7)).expect("lchown");
        assert_eq!(fs.lstat("/s").expect("lstat").uid, 7);
        assert_eq!(fs.stat("/d").expect("stat").uid, 0);
    }

    #[test]
    fn handle_attribute_changes() {
        let fs = fs();
        let f = fs
            .open("/f", OpenFlags::CREAT | OpenFlags::RDWR, 0o600)
            .expect("create");
        fs.fchmod(&f, 0o644).expect("fchmod");
        fs.fchown(&f, Some(1), Some(2)).expect("fchown");
        let st = fs.fstat(&f).expect("fstat");
        assert_eq!((st.perm, st.uid, st.gid), (0o644, 1, 2));

        let path = fs.open("/f", OpenFlags::PATH, 0).expect("path");
        assert_eq!(fs.fchmod(&path, 0o600), Err(PmfsError::BadHandle));
        assert_eq!(fs.fchown(&path, Some(0), None), Err(PmfsError::BadHandle));
        assert_eq!(fs.fstat(&path).expect("fstat path").ino, f.ino());
    }
}

//! relatime-style access time maintenance.

use crate::Inode;
use crate::cache::Vinode;
use pmfs_types::{SECONDS_PER_DAY, Timestamp};

/// Whether a read at `now` should move `inode.atime`.
///
/// Only when atime is older than mtime or ctime, or more than a day old.
#[must_use]
pub fn relatime_needs_update(inode: &Inode, now: Timestamp) -> bool {
    inode.atime < inode.mtime
        || inode.atime < inode.ctime
        || now.sec.saturating_sub(inode.atime.sec) > SECONDS_PER_DAY
}

/// Apply relatime after a read. Takes the vinode's write lock briefly, so
/// call it only after the read lock used for the read was dropped.
/// Returns `true` if atime moved.
pub fn update_atime(vinode: &Vinode, now: Timestamp) -> bool {
    if !relatime_needs_update(&vinode.read(), now) {
        return false;
    }
    let mut inode = vinode.write();
    if !relatime_needs_update(&inode, now) {
        return false;
    }
    inode.atime = now;
    vinode.mark_atime_dirty();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InodeContent;
    use pmfs_extent::ExtentList;
    use pmfs_types::InodeNumber;

    fn inode_at(atime: i64, mtime: i64, ctime: i64) -> Inode {
        let mut inode = Inode::new(
            InodeNumber(1),
            InodeContent::Regular(ExtentList::new()),
            0o644,
            (0, 0),
            Timestamp::EPOCH,
        );
        inode.atime = Timestamp::new(atime, 0);
        inode.mtime = Timestamp::new(mtime, 0);
        inode.ctime = Timestamp::new(ctime, 0);
        inode
    }

    #[test]
    fn recent_atime_is_left_alone() {
        let inode = inode_at(1_000, 1_000, 1_000);
        assert!(!relatime_needs_update(&inode, Timestamp::new(1_000 + 3_600, 0)));
    }

    #[test]
    fn atime_older_than_mtime_or_ctime_updates() {
        assert!(relatime_needs_update(&inode_at(10, 11, 10), Timestamp::new(12, 0)));
        assert!(relatime_needs_update(&inode_at(10, 10, 11), Timestamp::new(12, 0)));
    }

    #[test]
    fn day_old_atime_updates() {
        let inode = inode_at(0, 0, 0);
        assert!(!relatime_needs_update(&inode, Timestamp::new(SECONDS_PER_DAY, 0)));
        assert!(relatime_needs_update(&inode, Timestamp::new(SECONDS_PER_DAY + 1, 0)));
    }
}

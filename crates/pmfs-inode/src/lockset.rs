//! Ordered multi-vinode locking.
//!
//! Operations touching several inodes collect every vinode they need into
//! a [`LockSet`], which write-locks them in ascending inode-number order.
//! Two operations naming the same inodes in opposite orders therefore
//! always contend on the same first lock instead of deadlocking.

use crate::Inode;
use crate::cache::Vinode;
use parking_lot::RwLockWriteGuard;
use pmfs_error::{PmfsError, Result};
use pmfs_types::InodeNumber;
use tracing::trace;

pub struct LockSet<'a> {
    guards: Vec<(InodeNumber, RwLockWriteGuard<'a, Inode>)>,
}

impl<'a> LockSet<'a> {
    /// Write-lock the distinct vinodes in `vinodes`, lowest inode first.
    pub fn lock(vinodes: impl IntoIterator<Item = &'a Vinode>) -> Self {
        let mut ordered: Vec<&'a Vinode> = vinodes.into_iter().collect();
        ordered.sort_by_key(|v| v.ino());
        ordered.dedup_by_key(|v| v.ino());
        trace!(inos = ?ordered.iter().map(|v| v.ino().0).collect::<Vec<_>>(), "lockset_acquire");
        let guards = ordered.into_iter().map(|v| (v.ino(), v.write())).collect();
        Self { guards }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    #[must_use]
    pub fn contains(&self, ino: InodeNumber) -> bool {
        self.position(ino).is_some()
    }

    /// Inode numbers in lock order.
    pub fn inos(&self) -> impl Iterator<Item = InodeNumber> + '_ {
        self.guards.iter().map(|(ino, _)| *ino)
    }

    pub fn get(&self, ino: InodeNumber) -> Result<&Inode> {
        let idx = self.position(ino).ok_or_else(|| not_held(ino))?;
        Ok(&self.guards[idx].1)
    }

    pub fn get_mut(&mut self, ino: InodeNumber) -> Result<&mut Inode> {
        let idx = self.position(ino).ok_or_else(|| not_held(ino))?;
        Ok(&mut self.guards[idx].1)
    }

    fn position(&self, ino: InodeNumber) -> Option<usize> {
        self.guards.binary_search_by_key(&ino, |(i, _)| *i).ok()
    }
}

fn not_held(ino: InodeNumber) -> PmfsError {
    PmfsError::Corruption {
        ino: ino.0,
        detail: "inode not held by lock set".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InodeContent, InodeTable, VinodeCache};
    use pmfs_extent::ExtentList;
    use pmfs_pool::{Pool, PoolConfig};
    use pmfs_types::Timestamp;
    use std::sync::Arc;
    use std::thread;

    fn setup(n: usize) -> (VinodeCache, Vec<crate::VinodeRef>) {
        let pool = Arc::new(Pool::new(PoolConfig::default()).expect("pool"));
        let table = Arc::new(InodeTable::new());
        let mut inos = Vec::new();
        for _ in 0..n {
            let mut tx = pool.begin();
            let slot = table
                .create(&mut tx, |ino| {
                    Inode::new(
                        ino,
                        InodeContent::Regular(ExtentList::new()),
                        0o644,
                        (0, 0),
                        Timestamp::EPOCH,
                    )
                })
                .expect("create");
            tx.commit();
            inos.push(slot.ino());
        }
        let cache = VinodeCache::new(pool, table);
        let refs = inos
            .into_iter()
            .map(|ino| cache.materialize(ino, None).expect("materialize"))
            .collect();
        (cache, refs)
    }

    #[test]
    fn dedups_and_orders() {
        let (_cache, refs) = setup(3);
        let set = LockSet::lock([&*refs[2], &*refs[0], &*refs[2], &*refs[1]]);
        assert_eq!(set.len(), 3);
        let inos: Vec<_> = set.inos().collect();
        let mut sorted = inos.clone();
        sorted.sort();
        assert_eq!(inos, sorted);
    }

    #[test]
    fn get_mut_reaches_each_member() {
        let (_cache, refs) = setup(2);
        let (a, b) = (refs[0].ino(), refs[1].ino());
        {
            let mut set = LockSet::lock([&*refs[0], &*refs[1]]);
            set.get_mut(a).expect("a").nlink = 5;
            set.get_mut(b).expect("b").nlink = 6;
            assert!(set.get(InodeNumber(999)).is_err());
        }
        assert_eq!(refs[0].read().nlink, 5);
        assert_eq!(refs[1].read().nlink, 6);
    }

    #[test]
    fn opposite_orders_do_not_deadlock() {
        let (_cache, refs) = setup(2);
        thread::scope(|s| {
            for flip in [false, true] {
                let refs = &refs;
                s.spawn(move || {
                    for _ in 0..2_000 {
                        let (x, y) = if flip { (1, 0) } else { (0, 1) };
                        let mut set = LockSet::lock([&*refs[x], &*refs[y]]);
                        set.get_mut(refs[x].ino()).expect("held").size += 1;
                    }
                });
            }
        });
        let total = refs[0].read().size + refs[1].read().size;
        assert_eq!(total, 4_000);
    }
}

//! The vinode cache.
//!
//! One [`Vinode`] exists per inode in active use. The cache map owns every
//! vinode; callers hold [`VinodeRef`]s, which count references and evict
//! the vinode when the last one drops.
//!
//! A directory vinode remembers its parent by inode number and pins the
//! parent's vinode with one reference while cached. The parent therefore
//! stays resolvable for `..` even after it has been removed from the
//! namespace, and ownership never forms a cycle: pins point strictly
//! upward and are counted by the cache, not stored as pointers.

use crate::Inode;
use crate::table::{InodeSlot, InodeTable};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use pmfs_error::{PmfsError, Result};
use pmfs_pool::Pool;
use pmfs_types::{FileType, InodeNumber};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, trace};

pub struct Vinode {
    slot: Arc<InodeSlot>,
    parent: Mutex<Option<InodeNumber>>,
    refs: AtomicUsize,
    invalidation: AtomicU64,
    atime_dirty: AtomicBool,
    is_root: bool,
}

impl fmt::Debug for Vinode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vinode")
            .field("ino", &self.ino())
            .field("kind", &self.kind())
            .field("refs", &self.ref_count())
            .field("invalidation", &self.invalidation())
            .finish_non_exhaustive()
    }
}

impl Vinode {
    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.slot.ino()
    }

    #[must_use]
    pub fn kind(&self) -> FileType {
        self.slot.kind()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind().is_dir()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Inode> {
        self.slot.lock().read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Inode> {
        self.slot.lock().write()
    }

    /// Parent directory recorded at lookup time (directories only).
    #[must_use]
    pub fn parent(&self) -> Option<InodeNumber> {
        *self.parent.lock()
    }

    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Current extent-layout generation.
    #[must_use]
    pub fn invalidation(&self) -> u64 {
        self.invalidation.load(Ordering::Acquire)
    }

    /// Record a structural change of the extent list. Call with the write
    /// lock held.
    pub fn bump_invalidation(&self) {
        self.invalidation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn mark_atime_dirty(&self) {
        self.atime_dirty.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn atime_dirty(&self) -> bool {
        self.atime_dirty.load(Ordering::Acquire)
    }
}

struct CacheShared {
    map: Mutex<HashMap<InodeNumber, Arc<Vinode>>>,
    table: Arc<InodeTable>,
    pool: Arc<Pool>,
}

impl CacheShared {
    /// Drop one reference, evicting every vinode whose count reaches zero
    /// (following parent pins upward).
    fn release(&self, vinode: &Arc<Vinode>) {
        let mut evicted = Vec::new();
        {
            let mut map = self.map.lock();
            let mut next = Some(Arc::clone(vinode));
            while let Some(v) = next.take() {
                if v.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
                    break;
                }
                map.remove(&v.ino());
                next = v.parent().and_then(|p| map.get(&p).cloned());
                evicted.push(v);
            }
        }
        // Outside the cache lock: the inode lock is never taken under it.
        for v in evicted {
            self.retire(&v);
        }
    }

    fn retire(&self, vinode: &Vinode) {
        let lock = vinode.slot.lock();
        let inode = match lock.try_write() {
            Some(inode) => inode,
            // A newer vinode for this inode is cached; its own eviction
            // reclaims the inode if it is still unlinked.
            None if self.map.lock().contains_key(&vinode.ino()) => {
                if vinode.atime_dirty.swap(false, Ordering::AcqRel) {
                    self.pool.note_atime_flush();
                }
                return;
            }
            // Held outside the cache, e.g. by an image export, which never
            // waits on another inode lock while holding this one.
            None => lock.write(),
        };
        if inode.nlink == 0 && self.table.contains(vinode.ino()) {
            let mut tx = self.pool.begin();
            self.table.free(&mut tx, &inode);
            tx.commit();
            debug!(ino = vinode.ino().0, "orphan inode reclaimed");
        } else if vinode.atime_dirty.swap(false, Ordering::AcqRel) {
            self.pool.note_atime_flush();
        }
        trace!(ino = vinode.ino().0, "vinode evicted");
    }
}

/// Process-wide map from inode number to vinode.
#[derive(Clone)]
pub struct VinodeCache {
    shared: Arc<CacheShared>,
}

impl fmt::Debug for VinodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VinodeCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl VinodeCache {
    #[must_use]
    pub fn new(pool: Arc<Pool>, table: Arc<InodeTable>) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                map: Mutex::new(HashMap::new()),
                table,
                pool,
            }),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.map.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, ino: InodeNumber) -> bool {
        self.shared.map.lock().contains_key(&ino)
    }

    /// Return the cached vinode for `ino`, creating it if needed.
    ///
    /// `parent` is the directory the inode was found in; it is recorded
    /// (and pinned) only when a new directory vinode is created. Callers
    /// must hold at least a read lock on `parent` so the entry they looked
    /// up cannot be removed and freed concurrently.
    pub fn materialize(&self, ino: InodeNumber, parent: Option<&VinodeRef>) -> Result<VinodeRef> {
        self.materialize_inner(ino, parent, false)
    }

    /// Materialize a pool root. Roots have no parent.
    pub fn materialize_root(&self, ino: InodeNumber) -> Result<VinodeRef> {
        self.materialize_inner(ino, None, true)
    }

    fn materialize_inner(
        &self,
        ino: InodeNumber,
        parent: Option<&VinodeRef>,
        is_root: bool,
    ) -> Result<VinodeRef> {
        let mut map = self.shared.map.lock();
        if let Some(existing) = map.get(&ino) {
            existing.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(self.wrap(Arc::clone(existing)));
        }
        let slot = self.shared.table.get(ino).ok_or_else(|| PmfsError::Corruption {
            ino: ino.0,
            detail: "directory entry names an inode missing from the table".into(),
        })?;
        let parent_key = if slot.kind().is_dir() && !is_root {
            parent.map(|p| {
                p.refs.fetch_add(1, Ordering::AcqRel);
                p.ino()
            })
        } else {
            None
        };
        let vinode = Arc::new(Vinode {
            slot,
            parent: Mutex::new(parent_key),
            refs: AtomicUsize::new(1),
            invalidation: AtomicU64::new(0),
            atime_dirty: AtomicBool::new(false),
            is_root,
        });
        map.insert(ino, Arc::clone(&vinode));
        trace!(ino = ino.0, parent = ?parent_key, "vinode materialized");
        Ok(self.wrap(vinode))
    }

    /// Take a reference on an already cached vinode.
    #[must_use]
    pub fn acquire_cached(&self, ino: InodeNumber) -> Option<VinodeRef> {
        let map = self.shared.map.lock();
        map.get(&ino).map(|v| {
            v.refs.fetch_add(1, Ordering::AcqRel);
            self.wrap(Arc::clone(v))
        })
    }

    /// Move a directory vinode's parent pin to `new_parent`. The caller
    /// holds references to both the old and new parent.
    pub fn reparent(&self, child: &Vinode, new_parent: &VinodeRef) {
        if !child.is_dir() || child.is_root() {
            return;
        }
        let old = {
            let map = self.shared.map.lock();
            new_parent.refs.fetch_add(1, Ordering::AcqRel);
            let old = child.parent.lock().replace(new_parent.ino());
            old.and_then(|p| map.get(&p).cloned())
        };
        if let Some(old) = old {
            self.shared.release(&old);
        }
    }

    fn wrap(&self, vinode: Arc<Vinode>) -> VinodeRef {
        VinodeRef {
            vinode,
            cache: Arc::clone(&self.shared),
        }
    }
}

/// A counted reference to a cached vinode.
pub struct VinodeRef {
    vinode: Arc<Vinode>,
    cache: Arc<CacheShared>,
}

impl fmt::Debug for VinodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.vinode.fmt(f)
    }
}

impl Deref for VinodeRef {
    type Target = Vinode;

    fn deref(&self) -> &Vinode {
        &self.vinode
    }
}

impl Clone for VinodeRef {
    fn clone(&self) -> Self {
        // The count is at least one (ours), so no eviction can race this.
        self.vinode.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            vinode: Arc::clone(&self.vinode),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl Drop for VinodeRef {
    fn drop(&mut self) {
        self.cache.release(&self.vinode);
    }
}

impl VinodeRef {
    #[must_use]
    pub fn same_as(&self, other: &VinodeRef) -> bool {
        Arc::ptr_eq(&self.vinode, &other.vinode)
    }
}

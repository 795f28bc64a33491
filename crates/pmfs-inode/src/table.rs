//! The pool's inode table.

use crate::{INODE_FOOTPRINT, Inode};
use parking_lot::RwLock;
use pmfs_error::{PmfsError, Result};
use pmfs_pool::{AllocSite, Transaction};
use pmfs_types::{FileType, InodeNumber};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// One stored inode and the lock guarding it.
pub struct InodeSlot {
    ino: InodeNumber,
    kind: FileType,
    inode: RwLock<Inode>,
}

impl fmt::Debug for InodeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeSlot")
            .field("ino", &self.ino)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl InodeSlot {
    fn new(inode: Inode) -> Self {
        Self {
            ino: inode.ino,
            kind: inode.kind(),
            inode: RwLock::new(inode),
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    /// Type never changes after creation, so it is readable without the lock.
    #[must_use]
    pub fn kind(&self) -> FileType {
        self.kind
    }

    pub(crate) fn lock(&self) -> &RwLock<Inode> {
        &self.inode
    }
}

#[derive(Debug)]
pub struct InodeTable {
    slots: RwLock<HashMap<InodeNumber, Arc<InodeSlot>>>,
    next_ino: AtomicU64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            next_ino: AtomicU64::new(1),
        }
    }

    /// Rebuild a table from exported records.
    #[must_use]
    pub fn from_inodes(inodes: impl IntoIterator<Item = Inode>, next_ino: u64) -> Self {
        let slots: HashMap<_, _> = inodes
            .into_iter()
            .map(|inode| (inode.ino, Arc::new(InodeSlot::new(inode))))
            .collect();
        let floor = slots.keys().map(|ino| ino.0 + 1).max().unwrap_or(1);
        Self {
            slots: RwLock::new(slots),
            next_ino: AtomicU64::new(next_ino.max(floor)),
        }
    }

    #[must_use]
    pub fn get(&self, ino: InodeNumber) -> Option<Arc<InodeSlot>> {
        self.slots.read().get(&ino).cloned()
    }

    #[must_use]
    pub fn contains(&self, ino: InodeNumber) -> bool {
        self.slots.read().contains_key(&ino)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    #[must_use]
    pub fn next_ino(&self) -> u64 {
        self.next_ino.load(Ordering::Acquire)
    }

    /// Reserve storage for a new inode, then register the record built by
    /// `build`. The inode number is drawn only after every reservation
    /// succeeded. Registration is undone if the transaction aborts.
    pub fn create<'t>(
        &'t self,
        tx: &mut Transaction<'t>,
        build: impl FnOnce(InodeNumber) -> Inode,
    ) -> Result<Arc<InodeSlot>> {
        // Build against a placeholder number to size the content first.
        let probe = build(InodeNumber(0));
        tx.reserve(AllocSite::Inode, INODE_FOOTPRINT)?;
        let content_bytes = probe.content.storage_bytes();
        if content_bytes > 0 {
            tx.reserve(probe.content.alloc_site(), content_bytes)?;
        }
        let ino = InodeNumber(self.next_ino.fetch_add(1, Ordering::AcqRel));
        let inode = relabel(probe, ino);
        let slot = Arc::new(InodeSlot::new(inode));
        self.slots.write().insert(ino, Arc::clone(&slot));
        tx.on_abort(move || {
            self.slots.write().remove(&ino);
        });
        trace!(txn = tx.id().0, ino = ino.0, kind = ?slot.kind(), "inode_create");
        Ok(slot)
    }

    /// Register a record with a fixed number (pool roots at creation).
    pub fn insert_root<'t>(&'t self, tx: &mut Transaction<'t>, inode: Inode) -> Result<Arc<InodeSlot>> {
        let ino = inode.ino;
        if self.contains(ino) {
            return Err(PmfsError::Exists);
        }
        tx.reserve(AllocSite::Inode, inode.storage_bytes())?;
        self.next_ino.fetch_max(ino.0 + 1, Ordering::AcqRel);
        let slot = Arc::new(InodeSlot::new(inode));
        self.slots.write().insert(ino, Arc::clone(&slot));
        tx.on_abort(move || {
            self.slots.write().remove(&ino);
        });
        Ok(slot)
    }

    /// Release `inode`'s storage and drop it from the table when `tx`
    /// commits.
    pub fn free<'t>(&'t self, tx: &mut Transaction<'t>, inode: &Inode) {
        let ino = inode.ino;
        tx.release(inode.storage_bytes());
        tx.on_commit(move || {
            self.slots.write().remove(&ino);
        });
        trace!(txn = tx.id().0, ino = ino.0, "inode_free");
    }

    /// Snapshot of every record, ordered by inode number.
    #[must_use]
    pub fn export(&self) -> Vec<Inode> {
        let slots: Vec<Arc<InodeSlot>> = self.slots.read().values().cloned().collect();
        let mut inodes: Vec<Inode> = slots.iter().map(|s| s.inode.read().clone()).collect();
        inodes.sort_by_key(|inode| inode.ino);
        inodes
    }
}

/// Give a record built against a placeholder number its real identity,
/// including a directory's `.` entry.
fn relabel(mut inode: Inode, ino: InodeNumber) -> Inode {
    let placeholder = inode.ino;
    inode.ino = ino;
    if let Ok(dir) = inode.dir_mut() {
        let _ = dir.retarget(pmfs_dir::DOT, ino, FileType::Directory);
        if dir.parent() == placeholder {
            dir.set_parent(ino);
        }
    }
    inode
}

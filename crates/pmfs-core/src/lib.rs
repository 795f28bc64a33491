#![forbid(unsafe_code)]
//! The pmfs filesystem engine.
//!
//! A [`PoolFs`] is one opened pool: a fixed array of root directories, a
//! working directory, and POSIX-style operations over paths and [`File`]
//! handles. Every mutating operation runs inside a single pool transaction
//! and reserves all storage it needs before changing anything, so a failed
//! call leaves the pool exactly as it found it.
//!
//! # Lock order
//!
//! Outer to inner:
//!
//! 1. `rename_lock`, taken only by renames that move a directory to a new
//!    parent.
//! 2. Inode locks. A multi-inode operation takes them through a
//!    [`LockSet`](pmfs_inode::LockSet), in ascending inode-number order.
//! 3. The vinode cache map and the inode table map.
//!
//! Path resolution holds at most one inode lock at a time and never holds
//! one across the lookup of the next component.

mod attr;
mod cwd;
mod file;
mod image;
mod namespace;
mod path;
mod rename;

pub use attr::Stat;
pub use file::File;
pub use image::PoolImage;
pub use path::Anchor;
pub use pmfs_dir::DirEntry;
pub use pmfs_error::{PmfsError, Result};
pub use pmfs_inode::{Inode, InodeContent};
pub use pmfs_pool::{
    AllocSite, Clock, FailNth, FaultInjector, ManualClock, NoFaults, PoolConfig, PoolStats,
    SystemClock,
};
pub use pmfs_types::{
    AtFlags, FallocateFlags, FileType, InodeNumber, OpenFlags, RenameFlags, Timestamp,
};

use parking_lot::{Mutex, RwLock};
use pmfs_dir::Directory;
use pmfs_extent::ExtentGeometry;
use pmfs_inode::{InodeTable, VinodeCache, VinodeRef};
use pmfs_pool::Pool;
use pmfs_types::PERMISSION_MASK;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};

/// Largest byte offset a file may reach.
pub const MAX_FILE_SIZE: u64 = i64::MAX as u64;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

// ── Pool handle ─────────────────────────────────────────────────────────────

/// An opened pool and its namespace.
///
/// `PoolFs` is `Send + Sync`; share it between threads by reference or
/// behind an `Arc`. The working directory is per instance.
pub struct PoolFs {
    instance: u64,
    pool: Arc<Pool>,
    table: Arc<InodeTable>,
    cache: VinodeCache,
    roots: Vec<VinodeRef>,
    cwd: RwLock<VinodeRef>,
    rename_lock: Mutex<()>,
}

impl fmt::Debug for PoolFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolFs")
            .field("instance", &self.instance)
            .field("roots", &self.roots.len())
            .field("inodes", &self.table.len())
            .field("cached_vinodes", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl PoolFs {
    /// Create a fresh pool with `config.root_count` empty roots.
    pub fn create(config: PoolConfig) -> Result<Self> {
        Self::create_with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`PoolFs::create`], reading time from `clock`.
    pub fn create_with_clock(config: PoolConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = Arc::new(Pool::with_clock(config, clock)?);
        let table = Arc::new(InodeTable::new());
        let root_count = pool.config().root_count as u64;
        let root_inos: Vec<InodeNumber> = (1..=root_count).map(InodeNumber).collect();
        {
            let mut tx = pool.begin();
            let now = tx.now();
            let mode = pool.config().root_mode;
            for &ino in &root_inos {
                // A root is its own parent.
                let content = InodeContent::Directory(Directory::new(ino, ino));
                table.insert_root(&mut tx, Inode::new(ino, content, mode, (0, 0), now))?;
            }
            tx.commit();
        }
        info!(
            roots = root_inos.len(),
            capacity = pool.config().capacity,
            block_size = pool.config().block_size.get(),
            "pool created"
        );
        Self::assemble(pool, table, &root_inos)
    }

    fn assemble(pool: Arc<Pool>, table: Arc<InodeTable>, root_inos: &[InodeNumber]) -> Result<Self> {
        let cache = VinodeCache::new(Arc::clone(&pool), Arc::clone(&table));
        let roots = root_inos
            .iter()
            .map(|&ino| cache.materialize_root(ino))
            .collect::<Result<Vec<_>>>()?;
        let first = roots
            .first()
            .cloned()
            .ok_or_else(|| PmfsError::InvalidArgument("pool has no roots".into()))?;
        Ok(Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            pool,
            table,
            cache,
            roots,
            cwd: RwLock::new(first),
            rename_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        self.pool.config()
    }

    /// Number of roots, fixed at creation.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Inodes currently stored in the pool, orphans included.
    #[must_use]
    pub fn inode_count(&self) -> usize {
        self.table.len()
    }

    /// Vinodes currently materialized.
    #[must_use]
    pub fn cached_vinodes(&self) -> usize {
        self.cache.len()
    }

    /// Install an allocation failure point for every later transaction.
    pub fn set_fault_injector(&self, injector: Arc<dyn FaultInjector>) {
        self.pool.set_fault_injector(injector);
    }

    pub fn clear_fault_injector(&self) {
        self.pool.clear_fault_injector();
    }

    fn geometry(&self) -> ExtentGeometry {
        let config = self.pool.config();
        ExtentGeometry {
            block_size: config.block_size,
            max_extent_size: config.max_extent_size,
        }
    }

    /// Handles are only meaningful in the pool that opened them.
    fn check_owner(&self, file: &File) -> Result<()> {
        if file.instance() == self.instance {
            Ok(())
        } else {
            Err(PmfsError::BadAddress)
        }
    }
}

/// Reject flag bits outside `allowed`.
pub(crate) fn reject_unknown(bits: u32, allowed: u32, call: &str) -> Result<()> {
    let unknown = bits & !allowed;
    if unknown == 0 {
        Ok(())
    } else {
        Err(PmfsError::InvalidArgument(format!(
            "{call}: unsupported flags {unknown:#x}"
        )))
    }
}

pub(crate) fn check_mode(mode: u32) -> Result<()> {
    if mode & !PERMISSION_MASK == 0 {
        Ok(())
    } else {
        Err(PmfsError::InvalidArgument(format!(
            "mode {mode:#o} has bits outside {PERMISSION_MASK:#o}"
        )))
    }
}

// ── Failure tracing ─────────────────────────────────────────────────────────

/// Structured context for an operation that returned an error.
struct OpFailure<'a> {
    op: &'static str,
    path: &'a str,
    ino: Option<u64>,
    error: &'a PmfsError,
}

impl OpFailure<'_> {
    fn log(&self) {
        let errno = self.error.to_errno();
        // Missing and already-present names are routine outcomes.
        if self.error.is_lookup_miss() {
            trace!(
                op = self.op,
                path = self.path,
                ino = self.ino,
                errno,
                error = %self.error,
                "op failed"
            );
        } else {
            debug!(
                op = self.op,
                path = self.path,
                ino = self.ino,
                errno,
                error = %self.error,
                "op failed"
            );
        }
    }
}

/// `inspect_err` adapter for path-based entry points.
fn log_failure<'a>(op: &'static str, path: &'a str) -> impl Fn(&PmfsError) + 'a {
    move |error| {
        OpFailure {
            op,
            path,
            ino: None,
            error,
        }
        .log();
    }
}

/// `inspect_err` adapter for handle-based entry points.
fn log_handle_failure(op: &'static str, file: &File) -> impl Fn(&PmfsError) {
    let ino = file.ino().0;
    move |error| {
        OpFailure {
            op,
            path: "",
            ino: Some(ino),
            error,
        }
        .log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_materializes_every_root() {
        let fs = PoolFs::create(PoolConfig {
            root_count: 3,
            ..PoolConfig::default()
        })
        .expect("create");
        assert_eq!(fs.root_count(), 3);
        assert_eq!(fs.inode_count(), 3);
        assert_eq!(fs.cached_vinodes(), 3);
        assert_eq!(fs.stats().commits, 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = PoolFs::create(PoolConfig {
            root_count: 0,
            ..PoolConfig::default()
        })
        .expect_err("zero roots");
        assert!(matches!(err, PmfsError::InvalidArgument(_)));
    }

    #[test]
    fn handles_from_another_pool_are_bad_addresses() {
        let a = PoolFs::create(PoolConfig::default()).expect("a");
        let b = PoolFs::create(PoolConfig::default()).expect("b");
        let root = a.open_root(0, OpenFlags::empty()).expect("root");
        assert_eq!(b.fstat(&root).map(|s| s.ino), Err(PmfsError::BadAddress));
    }
}

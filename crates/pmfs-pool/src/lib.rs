#![forbid(unsafe_code)]
//! Transactional substrate seam.
//!
//! The filesystem engine never talks to persistent memory directly. It
//! asks a [`Pool`] for a [`Transaction`], reserves every byte it is about
//! to consume, and only then mutates state. A transaction that is dropped
//! without [`Transaction::commit`] gives its reservations back and runs its
//! abort hooks, so a failed operation is indistinguishable from one that
//! never ran.

pub mod clock;
pub mod config;
pub mod fault;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PoolConfig;
pub use fault::{AllocSite, FailNth, FaultInjector, NoFaults};

use parking_lot::RwLock;
use pmfs_error::{PmfsError, Result};
use pmfs_types::{CommitSeq, Timestamp, TxnId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Counters exported for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub commits: u64,
    pub aborts: u64,
    pub used_bytes: u64,
    pub capacity: u64,
    pub atime_flushes: u64,
}

pub struct Pool {
    config: PoolConfig,
    used: AtomicU64,
    next_txn: AtomicU64,
    next_commit: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    atime_flushes: AtomicU64,
    faults: RwLock<Arc<dyn FaultInjector>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Pool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: PoolConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            used: AtomicU64::new(0),
            next_txn: AtomicU64::new(1),
            next_commit: AtomicU64::new(1),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            atime_flushes: AtomicU64::new(0),
            faults: RwLock::new(Arc::new(NoFaults)),
            clock,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Replace the failure point consulted before each reservation.
    pub fn set_fault_injector(&self, injector: Arc<dyn FaultInjector>) {
        *self.faults.write() = injector;
    }

    pub fn clear_fault_injector(&self) {
        self.set_fault_injector(Arc::new(NoFaults));
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            used_bytes: self.used_bytes(),
            capacity: self.config.capacity,
            atime_flushes: self.atime_flushes.load(Ordering::Relaxed),
        }
    }

    /// Record that a lazily-updated access time reached the pool.
    pub fn note_atime_flush(&self) {
        self.atime_flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Re-establish the byte count of a pool rebuilt from an image.
    pub fn restore_usage(&self, bytes: u64) -> Result<()> {
        if bytes > self.config.capacity {
            return Err(PmfsError::OutOfMemory);
        }
        self.used.store(bytes, Ordering::Release);
        Ok(())
    }

    pub fn begin(&self) -> Transaction<'_> {
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        trace!(txn = id.0, "tx_begin");
        Transaction {
            pool: self,
            id,
            reserved: 0,
            deferred_release: 0,
            on_commit: Vec::new(),
            on_abort: Vec::new(),
            finished: false,
        }
    }

    fn charge(&self, bytes: u64) -> Result<()> {
        let capacity = self.config.capacity;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= capacity)
            })
            .map(|_| ())
            .map_err(|_| PmfsError::OutOfMemory)
    }

    fn uncharge(&self, bytes: u64) {
        // Saturating: a pool rebuilt from an image may undercount.
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

type Hook<'p> = Box<dyn FnOnce() + 'p>;

/// One logical operation's worth of pool changes.
///
/// Reservations are taken eagerly; frees are deferred until commit so an
/// aborted transaction never releases storage that is still referenced.
pub struct Transaction<'p> {
    pool: &'p Pool,
    id: TxnId,
    reserved: u64,
    deferred_release: u64,
    on_commit: Vec<Hook<'p>>,
    on_abort: Vec<Hook<'p>>,
    finished: bool,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("reserved", &self.reserved)
            .field("deferred_release", &self.deferred_release)
            .finish_non_exhaustive()
    }
}

impl<'p> Transaction<'p> {
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.pool.now()
    }

    #[must_use]
    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    /// Claim `bytes` of pool capacity for this transaction.
    pub fn reserve(&mut self, site: AllocSite, bytes: u64) -> Result<()> {
        if self.pool.faults.read().should_fail(site) {
            debug!(txn = self.id.0, ?site, bytes, "injected allocation failure");
            return Err(PmfsError::OutOfMemory);
        }
        self.pool.charge(bytes).inspect_err(|_| {
            debug!(
                txn = self.id.0,
                ?site,
                bytes,
                used = self.pool.used_bytes(),
                "pool exhausted"
            );
        })?;
        self.reserved = self.reserved.saturating_add(bytes);
        Ok(())
    }

    /// Return `bytes` to the pool once this transaction commits.
    pub fn release(&mut self, bytes: u64) {
        self.deferred_release = self.deferred_release.saturating_add(bytes);
    }

    pub fn on_commit(&mut self, hook: impl FnOnce() + 'p) {
        self.on_commit.push(Box::new(hook));
    }

    pub fn on_abort(&mut self, hook: impl FnOnce() + 'p) {
        self.on_abort.push(Box::new(hook));
    }

    pub fn commit(mut self) -> CommitSeq {
        self.finished = true;
        self.pool.uncharge(self.deferred_release);
        for hook in std::mem::take(&mut self.on_commit) {
            hook();
        }
        self.on_abort.clear();
        let seq = CommitSeq(self.pool.next_commit.fetch_add(1, Ordering::AcqRel));
        self.pool.commits.fetch_add(1, Ordering::Relaxed);
        trace!(
            txn = self.id.0,
            seq = seq.0,
            reserved = self.reserved,
            released = self.deferred_release,
            "tx_commit"
        );
        seq
    }

    pub fn abort(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        self.finished = true;
        self.pool.uncharge(self.reserved);
        self.on_commit.clear();
        while let Some(hook) = self.on_abort.pop() {
            hook();
        }
        self.pool.aborts.fetch_add(1, Ordering::Relaxed);
        debug!(txn = self.id.0, reserved = self.reserved, "tx_abort");
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

//! Allocation failure points.
//!
//! The pool consults its installed [`FaultInjector`] before every
//! reservation. Production pools use [`NoFaults`]; tests install
//! [`FailNth`] to make a specific allocation inside an operation fail and
//! then check that the operation left no trace.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// What a reservation is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocSite {
    Inode,
    DirEntry,
    Extent,
    Symlink,
}

pub trait FaultInjector: Send + Sync + fmt::Debug {
    /// Return `true` to fail the reservation about to happen.
    fn should_fail(&self, site: AllocSite) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn should_fail(&self, _site: AllocSite) -> bool {
        false
    }
}

/// Fail the n-th (1-based) matching reservation, once.
#[derive(Debug)]
pub struct FailNth {
    site: Option<AllocSite>,
    remaining: AtomicU64,
}

impl FailNth {
    #[must_use]
    pub fn new(n: u64) -> Self {
        Self {
            site: None,
            remaining: AtomicU64::new(n),
        }
    }

    /// Count only reservations made for `site`.
    #[must_use]
    pub fn at_site(site: AllocSite, n: u64) -> Self {
        Self {
            site: Some(site),
            remaining: AtomicU64::new(n),
        }
    }

    /// `true` once the armed failure has fired.
    #[must_use]
    pub fn fired(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }
}

impl FaultInjector for FailNth {
    fn should_fail(&self, site: AllocSite) -> bool {
        if self.site.is_some_and(|s| s != site) {
            return false;
        }
        let prev = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        matches!(prev, Ok(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_nth_fires_exactly_once() {
        let f = FailNth::new(3);
        assert!(!f.should_fail(AllocSite::Inode));
        assert!(!f.should_fail(AllocSite::Extent));
        assert!(f.should_fail(AllocSite::DirEntry));
        assert!(f.fired());
        assert!(!f.should_fail(AllocSite::DirEntry));
    }

    #[test]
    fn fail_nth_filters_by_site() {
        let f = FailNth::at_site(AllocSite::Extent, 2);
        assert!(!f.should_fail(AllocSite::Inode));
        assert!(!f.should_fail(AllocSite::Extent));
        assert!(!f.should_fail(AllocSite::DirEntry));
        assert!(f.should_fail(AllocSite::Extent));
    }
}

#![forbid(unsafe_code)]
//! pmfs public API facade.
//!
//! Re-exports the filesystem engine from `pmfs-core` through a stable
//! external interface. Downstream consumers depend on this crate.

pub use pmfs_core::*;

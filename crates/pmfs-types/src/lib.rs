#![forbid(unsafe_code)]

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Longest single path component, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Longest path accepted by the resolver, in bytes.
pub const PATH_MAX: usize = 4096;

/// Permission and set-id bits accepted by mkdir/chmod/open.
pub const PERMISSION_MASK: u32 = 0o7777;

pub const SECONDS_PER_DAY: i64 = 86_400;

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFLNK: u32 = 0o120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitSeq(pub u64);

/// Validated allocation granularity (power of two in 512..=1 MiB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct BlockSize(u64);

impl BlockSize {
    pub const MIN: u64 = 512;
    pub const MAX: u64 = 1 << 20;

    pub fn new(value: u64) -> Result<Self, TypeError> {
        if !value.is_power_of_two() || !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(TypeError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=1048576",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    /// Round `offset` down to a block boundary.
    #[must_use]
    pub fn align_down(self, offset: u64) -> u64 {
        offset & !(self.0 - 1)
    }

    /// Round `offset` up to a block boundary, saturating at the largest
    /// aligned value.
    #[must_use]
    pub fn align_up(self, offset: u64) -> u64 {
        match offset.checked_add(self.0 - 1) {
            Some(v) => self.align_down(v),
            None => self.align_down(u64::MAX),
        }
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(4096)
    }
}

impl TryFrom<u64> for BlockSize {
    type Error = TypeError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BlockSize> for u64 {
    fn from(value: BlockSize) -> Self {
        value.0
    }
}

/// Wall-clock instant with nanosecond resolution.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

impl Timestamp {
    pub const EPOCH: Self = Self { sec: 0, nsec: 0 };

    #[must_use]
    pub fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    /// Current system time, clamped to the epoch for clocks set before 1970.
    #[must_use]
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                nsec: d.subsec_nanos(),
            },
            Err(_) => Self::EPOCH,
        }
    }

    #[must_use]
    pub fn plus_secs(self, secs: i64) -> Self {
        Self {
            sec: self.sec.saturating_add(secs),
            nsec: self.nsec,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
}

impl FileType {
    /// `S_IF*` bits for this type.
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        match self {
            Self::RegularFile => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
        }
    }

    #[must_use]
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::RegularFile),
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_dir(self) -> bool {
        self == Self::Directory
    }
}

bitflags! {
    /// Flags accepted by `open`/`openat`. An empty set is read-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const CREAT = 0o100;
        const EXCL = 0o200;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
        const DIRECTORY = 0o200_000;
        const NOFOLLOW = 0o400_000;
        const NOATIME = 0o1_000_000;
        const PATH = 0o10_000_000;
    }
}

impl OpenFlags {
    /// Flags still honoured on a path-only open.
    pub const PATH_COMPATIBLE: Self = Self::PATH
        .union(Self::DIRECTORY)
        .union(Self::NOFOLLOW);

    #[must_use]
    pub fn is_path_only(self) -> bool {
        self.contains(Self::PATH)
    }

    #[must_use]
    pub fn is_readable(self) -> bool {
        !self.is_path_only() && !self.contains(Self::WRONLY)
    }

    #[must_use]
    pub fn is_writable(self) -> bool {
        !self.is_path_only() && self.intersects(Self::WRONLY | Self::RDWR)
    }
}

bitflags! {
    /// Flags for the `*at` family.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AtFlags: u32 {
        const SYMLINK_NOFOLLOW = 0x100;
        const REMOVEDIR = 0x200;
        const SYMLINK_FOLLOW = 0x400;
        const EMPTY_PATH = 0x1000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RenameFlags: u32 {
        const NOREPLACE = 1;
        const EXCHANGE = 1 << 1;
        const WHITEOUT = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FallocateFlags: u32 {
        const KEEP_SIZE = 0x01;
        const PUNCH_HOLE = 0x02;
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(512).is_ok());
        assert!(BlockSize::new(1 << 20).is_ok());
        assert!(BlockSize::new(256).is_err());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(2 << 20).is_err());
    }

    #[test]
    fn block_size_alignment() {
        let bs = BlockSize::new(4096).expect("valid");
        assert_eq!(bs.align_down(4095), 0);
        assert_eq!(bs.align_down(4096), 4096);
        assert_eq!(bs.align_up(1), 4096);
        assert_eq!(bs.align_up(8192), 8192);
        assert_eq!(bs.align_up(u64::MAX), u64::MAX & !4095);
    }

    #[test]
    fn timestamps_order_by_seconds_then_nanos() {
        let a = Timestamp::new(10, 999);
        let b = Timestamp::new(11, 0);
        let c = Timestamp::new(11, 1);
        assert!(a < b && b < c);
        assert_eq!(a.plus_secs(1), Timestamp::new(11, 999));
    }

    #[test]
    fn file_type_mode_round_trip() {
        for ft in [FileType::RegularFile, FileType::Directory, FileType::Symlink] {
            assert_eq!(FileType::from_mode(ft.mode_bits() | 0o644), Some(ft));
        }
        assert_eq!(FileType::from_mode(0o010_000), None);
    }

    #[test]
    fn open_flags_access_mode() {
        assert!(OpenFlags::empty().is_readable());
        assert!(!OpenFlags::empty().is_writable());
        assert!(!OpenFlags::WRONLY.is_readable());
        assert!(OpenFlags::RDWR.is_readable() && OpenFlags::RDWR.is_writable());
        let path = OpenFlags::PATH | OpenFlags::RDWR;
        assert!(!path.is_readable() && !path.is_writable());
    }

    #[test]
    fn block_size_serde_rejects_invalid() {
        let err = BlockSize::try_from(1000).expect_err("not a power of two");
        assert!(err.to_string().contains("block_size"));
    }
}

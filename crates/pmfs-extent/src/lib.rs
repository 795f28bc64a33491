#![forbid(unsafe_code)]
//! Extent mapping for regular files.
//!
//! A file's data is an ordered list of non-overlapping [`Extent`]s. Gaps
//! between extents are holes and read as zeros. Lookups accept a hint (the
//! index of the extent used last) so sequential access stays O(1)
//! amortized, falling back to a binary search when the hint is cold or far
//! away.
//!
//! Mutations are split in two so callers can keep an operation atomic:
//! [`ExtentList::plan_write`] computes every allocation a write needs
//! without touching the list, the caller reserves that storage, and only
//! then [`ExtentList::apply_plan`] and [`ExtentList::apply_write`] perform
//! the (infallible) update.

use bitflags::bitflags;
use pmfs_types::BlockSize;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// How far a hinted lookup walks before giving up on the hint.
const HINT_SCAN_LIMIT: usize = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ExtentFlags: u8 {
        /// Data was written. Uninitialized extents (from fallocate) read
        /// as zeros.
        const INITIALIZED = 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    offset: u64,
    flags: ExtentFlags,
    data: Vec<u8>,
}

impl Extent {
    fn zeroed(offset: u64, len: u64, flags: ExtentFlags) -> Self {
        Self {
            offset,
            flags,
            data: vec![0; to_index(len)],
        }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }

    #[must_use]
    pub fn flags(&self) -> ExtentFlags {
        self.flags
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.flags.contains(ExtentFlags::INITIALIZED)
    }

    #[must_use]
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }

    fn copy_out(&self, from: u64, dst: &mut [u8]) {
        if self.is_initialized() {
            let start = to_index(from - self.offset);
            dst.copy_from_slice(&self.data[start..start + dst.len()]);
        } else {
            dst.fill(0);
        }
    }

    fn copy_in(&mut self, from: u64, src: &[u8]) {
        let start = to_index(from - self.offset);
        self.data[start..start + src.len()].copy_from_slice(src);
        self.flags.insert(ExtentFlags::INITIALIZED);
    }
}

fn to_index(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

/// Result of locating a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The extent at this index covers the offset.
    Mapped(usize),
    /// The offset falls in a hole; `next` is the first extent after it.
    Hole { next: Option<usize> },
}

/// Allocation granularity and growth limit for hole filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentGeometry {
    pub block_size: BlockSize,
    pub max_extent_size: u64,
}

/// One storage allocation needed by a write or fallocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Insert a fresh extent at list position `at`.
    New {
        at: usize,
        offset: u64,
        len: u64,
        flags: ExtentFlags,
    },
    /// Grow the extent at `index` in place by `by` bytes.
    Grow { index: usize, by: u64 },
}

impl Allocation {
    #[must_use]
    pub fn bytes(&self) -> u64 {
        match *self {
            Self::New { len, .. } => len,
            Self::Grow { by, .. } => by,
        }
    }
}

/// Allocations a write needs, computed against an unchanged list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritePlan {
    allocations: Vec<Allocation>,
}

impl WritePlan {
    #[must_use]
    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.allocations.iter().map(Allocation::bytes).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentList {
    extents: Vec<Extent>,
}

impl ExtentList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Extent> {
        self.extents.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.extents.iter()
    }

    /// Bytes of storage held by this list.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.extents.iter().map(Extent::len).sum()
    }

    /// Locate `offset`, starting from `hint` when one is given.
    #[must_use]
    pub fn find(&self, offset: u64, hint: Option<usize>) -> Lookup {
        let candidate = match hint.filter(|h| *h < self.extents.len()) {
            Some(h) => self
                .scan_from_hint(offset, h)
                .unwrap_or_else(|| self.last_starting_at_or_before(offset)),
            None => self.last_starting_at_or_before(offset),
        };
        match candidate {
            Some(i) if self.extents[i].contains(offset) => Lookup::Mapped(i),
            Some(i) => Lookup::Hole {
                next: (i + 1 < self.extents.len()).then_some(i + 1),
            },
            None => Lookup::Hole {
                next: (!self.extents.is_empty()).then_some(0),
            },
        }
    }

    /// Walk a few steps from `hint` toward `offset`. `None` means the hint
    /// was too far off; `Some(None)` means no extent starts at or before
    /// `offset`.
    fn scan_from_hint(&self, offset: u64, hint: usize) -> Option<Option<usize>> {
        let mut i = hint;
        if self.extents[i].offset <= offset {
            for _ in 0..HINT_SCAN_LIMIT {
                match self.extents.get(i + 1) {
                    Some(next) if next.offset <= offset => i += 1,
                    _ => return Some(Some(i)),
                }
            }
        } else {
            for _ in 0..HINT_SCAN_LIMIT {
                if i == 0 {
                    return Some(None);
                }
                i -= 1;
                if self.extents[i].offset <= offset {
                    return Some(Some(i));
                }
            }
        }
        trace!(offset, hint, "extent hint missed");
        None
    }

    fn last_starting_at_or_before(&self, offset: u64) -> Option<usize> {
        self.extents
            .partition_point(|e| e.offset <= offset)
            .checked_sub(1)
    }

    /// Copy file bytes starting at `offset` into `buf`, stopping at
    /// `file_size`. Holes read as zeros. Returns the number of bytes
    /// produced; zero at or past end of file. `hint` is read and updated.
    pub fn read(&self, offset: u64, buf: &mut [u8], file_size: u64, hint: &mut Option<usize>) -> usize {
        if offset >= file_size || buf.is_empty() {
            return 0;
        }
        let end = file_size.min(offset.saturating_add(buf.len() as u64));
        let total = to_index(end - offset);
        let mut pos = offset;
        while pos < end {
            let dst_from = to_index(pos - offset);
            match self.find(pos, *hint) {
                Lookup::Mapped(i) => {
                    let ext = &self.extents[i];
                    let stop = ext.end().min(end);
                    ext.copy_out(pos, &mut buf[dst_from..to_index(stop - offset)]);
                    *hint = Some(i);
                    pos = stop;
                }
                Lookup::Hole { next } => {
                    let stop = next.map_or(end, |n| self.extents[n].offset.min(end));
                    buf[dst_from..to_index(stop - offset)].fill(0);
                    if next.is_some() {
                        *hint = next;
                    }
                    pos = stop;
                }
            }
        }
        total
    }

    /// Copy out of a single extent if it covers `[offset, offset + len)`.
    /// Returns `false`, touching nothing, when it does not.
    #[must_use]
    pub fn read_in_extent(&self, index: usize, offset: u64, buf: &mut [u8]) -> bool {
        match self.extents.get(index) {
            Some(ext) if covers(ext, offset, buf.len()) => {
                ext.copy_out(offset, buf);
                true
            }
            _ => false,
        }
    }

    /// Overwrite bytes inside a single already-allocated extent.
    #[must_use]
    pub fn write_in_extent(&mut self, index: usize, offset: u64, data: &[u8]) -> bool {
        match self.extents.get_mut(index) {
            Some(ext) if covers(ext, offset, data.len()) => {
                ext.copy_in(offset, data);
                true
            }
            _ => false,
        }
    }

    /// Compute the allocations needed so that `[offset, offset + len)` is
    /// fully mapped. New extents are block aligned but never overlap their
    /// neighbours; an extent ending exactly where a gap's allocation would
    /// start is grown instead while it stays within the geometry's limit.
    #[must_use]
    pub fn plan_write(
        &self,
        offset: u64,
        len: u64,
        geometry: ExtentGeometry,
        new_flags: ExtentFlags,
    ) -> WritePlan {
        let mut plan = WritePlan::default();
        let Some(end) = offset.checked_add(len) else {
            return plan;
        };
        let bs = geometry.block_size;
        let mut j = self.extents.partition_point(|e| e.end() <= offset);
        let mut pos = offset;
        while pos < end {
            if let Some(ext) = self.extents.get(j).filter(|e| e.offset <= pos) {
                pos = ext.end();
                j += 1;
                continue;
            }
            let next_start = self.extents.get(j).map_or(u64::MAX, |e| e.offset);
            let gap_end = end.min(next_start);
            let prev = j.checked_sub(1).map(|p| (p, &self.extents[p]));
            let prev_end = prev.map_or(0, |(_, e)| e.end());
            let start = bs.align_down(pos).max(prev_end);
            let stop = bs.align_up(gap_end).min(next_start).max(gap_end);
            let grow = prev.filter(|(_, e)| {
                e.end() == start && e.len() + (stop - start) <= geometry.max_extent_size
            });
            plan.allocations.push(match grow {
                Some((index, _)) => Allocation::Grow {
                    index,
                    by: stop - start,
                },
                None => Allocation::New {
                    at: j,
                    offset: start,
                    len: stop - start,
                    flags: new_flags,
                },
            });
            pos = gap_end;
        }
        plan
    }

    /// Perform a plan computed by [`Self::plan_write`] against this same,
    /// unmodified list. Always a structural change when the plan is
    /// non-empty.
    pub fn apply_plan(&mut self, plan: &WritePlan) {
        // Back to front: inserting at `at` only shifts later extents, which
        // have already been handled.
        for alloc in plan.allocations.iter().rev() {
            match *alloc {
                Allocation::New {
                    at,
                    offset,
                    len,
                    flags,
                } => self.extents.insert(at, Extent::zeroed(offset, len, flags)),
                Allocation::Grow { index, by } => {
                    let ext = &mut self.extents[index];
                    let new_len = ext.data.len() + to_index(by);
                    ext.data.resize(new_len, 0);
                }
            }
        }
    }

    /// Copy `data` to `offset` after the plan for that range was applied.
    /// Returns the index of the extent holding the last byte written.
    pub fn apply_write(&mut self, offset: u64, data: &[u8], hint: Option<usize>) -> Option<usize> {
        let end = offset + data.len() as u64;
        let mut pos = offset;
        let mut last = None;
        let mut hint = hint;
        while pos < end {
            let Lookup::Mapped(i) = self.find(pos, hint) else {
                // Unreachable once the plan is applied; stop rather than
                // write past the mapping.
                break;
            };
            let ext = &mut self.extents[i];
            let stop = ext.end().min(end);
            let src = &data[to_index(pos - offset)..to_index(stop - offset)];
            ext.copy_in(pos, src);
            last = Some(i);
            hint = Some(i);
            pos = stop;
        }
        last
    }

    /// Drop all bytes at or beyond `new_size`. Returns the bytes released.
    pub fn truncate(&mut self, new_size: u64) -> u64 {
        let keep = self.extents.partition_point(|e| e.offset < new_size);
        let mut released: u64 = self.extents.drain(keep..).map(|e| e.len()).sum();
        if let Some(last) = self.extents.last_mut() {
            if last.end() > new_size {
                released += last.end() - new_size;
                last.data.truncate(to_index(new_size - last.offset));
            }
        }
        released
    }

    /// Deallocate `[offset, offset + len)`, splitting extents that straddle
    /// the range. Returns the bytes released.
    pub fn punch_hole(&mut self, offset: u64, len: u64) -> u64 {
        let end = offset.saturating_add(len);
        let mut released = 0;
        let mut i = self.extents.partition_point(|e| e.end() <= offset);
        while i < self.extents.len() && self.extents[i].offset < end {
            let ext = &mut self.extents[i];
            let cut_from = offset.max(ext.offset);
            let cut_to = end.min(ext.end());
            released += cut_to - cut_from;
            if cut_from == ext.offset && cut_to == ext.end() {
                self.extents.remove(i);
                continue;
            }
            if cut_from == ext.offset {
                ext.data.drain(..to_index(cut_to - ext.offset));
                ext.offset = cut_to;
                i += 1;
                continue;
            }
            let tail = ext.data.split_off(to_index(cut_from - ext.offset));
            if cut_to < cut_from + tail.len() as u64 {
                let keep_from = to_index(cut_to - cut_from);
                let right = Extent {
                    offset: cut_to,
                    flags: ext.flags,
                    data: tail[keep_from..].to_vec(),
                };
                self.extents.insert(i + 1, right);
                i += 2;
            } else {
                i += 1;
            }
        }
        released
    }
}

fn covers(ext: &Extent, offset: u64, len: usize) -> bool {
    offset >= ext.offset
        && offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= ext.end())
}

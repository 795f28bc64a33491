//! Open file handles and the data path.
//!
//! A [`File`] owns one vinode reference for as long as any clone of it is
//! alive. Its cursor and the cached single-extent pointer live behind a
//! per-handle mutex, which is always taken before the inode lock.

use crate::path::Anchor;
use crate::{MAX_FILE_SIZE, PoolFs, check_mode, log_failure, log_handle_failure, reject_unknown};
use parking_lot::{Mutex, MutexGuard};
use pmfs_dir::DirEntry;
use pmfs_error::{PmfsError, Result};
use pmfs_extent::{ExtentFlags, ExtentList};
use pmfs_inode::{Inode, InodeContent, Vinode, VinodeRef, update_atime};
use pmfs_pool::AllocSite;
use pmfs_types::{FallocateFlags, FileType, InodeNumber, OpenFlags};
use std::fmt;
use std::io::{IoSlice, IoSliceMut, SeekFrom};
use std::sync::Arc;
use tracing::trace;

// ── Handle ──────────────────────────────────────────────────────────────────

/// Extent used by the previous transfer, valid while the vinode's
/// invalidation counter still equals `generation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CachedExtent {
    pub index: usize,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub(crate) struct HandleState {
    pub offset: u64,
    pub cached: Option<CachedExtent>,
}

struct Handle {
    instance: u64,
    vinode: VinodeRef,
    flags: OpenFlags,
    state: Mutex<HandleState>,
}

/// An open file, directory or path-only handle.
///
/// Dropping the last clone closes it. Clones share the cursor, like `dup`.
#[derive(Clone)]
pub struct File {
    inner: Arc<Handle>,
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("ino", &self.ino())
            .field("kind", &self.kind())
            .field("flags", &self.flags())
            .field("offset", &self.offset())
            .finish_non_exhaustive()
    }
}

impl File {
    pub(crate) fn new(instance: u64, vinode: VinodeRef, flags: OpenFlags) -> Self {
        Self {
            inner: Arc::new(Handle {
                instance,
                vinode,
                flags,
                state: Mutex::new(HandleState::default()),
            }),
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.inner.vinode.ino()
    }

    #[must_use]
    pub fn kind(&self) -> FileType {
        self.inner.vinode.kind()
    }

    /// Flags the handle was opened with, after path-only masking.
    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        self.inner.flags
    }

    /// Current cursor; for directories, the next entry cookie.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.inner.state.lock().offset
    }

    pub(crate) fn vinode(&self) -> &VinodeRef {
        &self.inner.vinode
    }

    pub(crate) fn instance(&self) -> u64 {
        self.inner.instance
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, HandleState> {
        self.inner.state.lock()
    }
}

fn check_open_flags(flags: OpenFlags, mode: u32) -> Result<OpenFlags> {
    reject_unknown(flags.bits(), OpenFlags::all().bits(), "open")?;
    if flags.contains(OpenFlags::WRONLY | OpenFlags::RDWR) {
        return Err(PmfsError::InvalidArgument(
            "WRONLY and RDWR are mutually exclusive".into(),
        ));
    }
    if flags.is_path_only() {
        return Ok(flags & OpenFlags::PATH_COMPATIBLE);
    }
    if flags.contains(OpenFlags::CREAT | OpenFlags::DIRECTORY) {
        return Err(PmfsError::InvalidArgument(
            "CREAT cannot be combined with DIRECTORY".into(),
        ));
    }
    if flags.contains(OpenFlags::CREAT) {
        check_mode(mode)?;
    }
    Ok(flags)
}

fn to_len(bytes: u64) -> usize {
    usize::try_from(bytes).unwrap_or(usize::MAX)
}

/// Concatenate a write vector into one buffer.
fn gather(bufs: &[IoSlice<'_>]) -> Vec<u8> {
    bufs.iter().flat_map(|buf| buf.iter().copied()).collect()
}

/// Copy file bytes into `buf`, trying the cached extent first.
fn read_extents(
    vinode: &Vinode,
    inode: &Inode,
    offset: u64,
    buf: &mut [u8],
    cached: &mut Option<CachedExtent>,
) -> Result<usize> {
    let extents = inode.extents()?;
    let generation = vinode.invalidation();
    if cached.is_some_and(|c| c.generation != generation) {
        trace!(ino = vinode.ino().0, "stale extent pointer dropped");
        *cached = None;
    }
    if offset >= inode.size || buf.is_empty() {
        return Ok(0);
    }
    let len = buf.len().min(to_len(inode.size - offset));
    let buf = &mut buf[..len];
    if let Some(c) = *cached {
        if extents.read_in_extent(c.index, offset, buf) {
            trace!(ino = vinode.ino().0, offset, len, "read fast path");
            return Ok(len);
        }
    }
    let mut hint = cached.map(|c| c.index);
    let n = extents.read(offset, buf, inode.size, &mut hint);
    *cached = hint.map(|index| CachedExtent { index, generation });
    Ok(n)
}

// ── Open ────────────────────────────────────────────────────────────────────

impl PoolFs {
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<File> {
        self.openat(Anchor::Cwd, path, flags, mode)
    }

    /// Open `path`. `mode` is used only with [`OpenFlags::CREAT`].
    pub fn openat(&self, anchor: Anchor<'_>, path: &str, flags: OpenFlags, mode: u32) -> Result<File> {
        self.open_inner(anchor, path, flags, mode)
            .inspect_err(log_failure("open", path))
    }

    fn open_inner(&self, anchor: Anchor<'_>, path: &str, flags: OpenFlags, mode: u32) -> Result<File> {
        let flags = check_open_flags(flags, mode)?;
        let vinode = if flags.contains(OpenFlags::CREAT) {
            self.open_or_create(anchor, path, flags, mode)?
        } else {
            self.resolve(anchor, path, !flags.contains(OpenFlags::NOFOLLOW))?
        };
        if flags.contains(OpenFlags::DIRECTORY) && !vinode.is_dir() {
            return Err(PmfsError::NotDirectory);
        }
        if vinode.kind() == FileType::Symlink && !flags.is_path_only() {
            return Err(PmfsError::SymlinkLoop);
        }
        if vinode.is_dir() && flags.is_writable() {
            return Err(PmfsError::IsDirectory);
        }
        if flags.contains(OpenFlags::TRUNC)
            && flags.is_writable()
            && vinode.kind() == FileType::RegularFile
        {
            let mut inode = vinode.write();
            self.truncate_locked(&vinode, &mut inode, 0)?;
        }
        trace!(ino = vinode.ino().0, ?flags, "open");
        Ok(File::new(self.instance, vinode, flags))
    }

    fn open_or_create(
        &self,
        anchor: Anchor<'_>,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<VinodeRef> {
        let exclusive = flags.contains(OpenFlags::EXCL);
        let parent = self.resolve_parent(anchor, path)?;
        let Some(name) = parent.name.as_deref() else {
            return Err(if exclusive {
                PmfsError::Exists
            } else {
                PmfsError::IsDirectory
            });
        };
        let existing = match self.lookup_final(&parent.dir, name) {
            Ok(vinode) => Some(vinode),
            Err(PmfsError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };
        let vinode = match existing {
            Some(_) if exclusive => return Err(PmfsError::Exists),
            Some(link)
                if link.kind() == FileType::Symlink && !flags.contains(OpenFlags::NOFOLLOW) =>
            {
                self.resolve(anchor, path, true)?
            }
            Some(vinode) if parent.trailing_slash && !vinode.is_dir() => {
                return Err(PmfsError::NotDirectory);
            }
            Some(vinode) => vinode,
            None if parent.trailing_slash => return Err(PmfsError::IsDirectory),
            None => {
                pmfs_dir::validate_name(name)?;
                match self.create_entry(&parent.dir, name, mode, |_| {
                    InodeContent::Regular(ExtentList::new())
                }) {
                    Ok(created) => created,
                    // Lost a race with another creator.
                    Err(PmfsError::Exists) if !exclusive => self.lookup_child(&parent.dir, name)?,
                    Err(err) => return Err(err),
                }
            }
        };
        if vinode.is_dir() {
            return Err(PmfsError::IsDirectory);
        }
        Ok(vinode)
    }

    /// Open root `index` as a directory handle. No flags are accepted.
    pub fn open_root(&self, index: usize, flags: OpenFlags) -> Result<File> {
        if !flags.is_empty() {
            return Err(PmfsError::InvalidArgument(
                "open_root takes no flags".into(),
            ));
        }
        let root = self.roots.get(index).ok_or_else(|| {
            PmfsError::InvalidArgument(format!(
                "root index {index} out of range (pool has {})",
                self.roots.len()
            ))
        })?;
        Ok(File::new(self.instance, root.clone(), OpenFlags::DIRECTORY))
    }

    fn check_readable(&self, file: &File) -> Result<()> {
        self.check_owner(file)?;
        if file.flags().is_path_only() {
            return Err(PmfsError::BadHandle);
        }
        if file.vinode().is_dir() {
            return Err(PmfsError::IsDirectory);
        }
        if !file.flags().is_readable() {
            return Err(PmfsError::BadHandle);
        }
        Ok(())
    }

    fn check_writable(&self, file: &File) -> Result<()> {
        self.check_owner(file)?;
        if file.flags().is_path_only() {
            return Err(PmfsError::BadHandle);
        }
        if file.kind() != FileType::RegularFile {
            return Err(PmfsError::InvalidArgument(
                "only regular files can be written".into(),
            ));
        }
        if !file.flags().is_writable() {
            return Err(PmfsError::BadHandle);
        }
        Ok(())
    }

    fn touch_atime(&self, file: &File) {
        if !file.flags().contains(OpenFlags::NOATIME)
            && update_atime(file.vinode(), self.pool.now())
        {
            trace!(ino = file.ino().0, "atime updated");
        }
    }

    // ── Read ────────────────────────────────────────────────────────────────

    /// Read at the cursor and advance it.
    pub fn read(&self, file: &File, buf: &mut [u8]) -> Result<usize> {
        self.read_vectored(file, None, &mut [IoSliceMut::new(buf)])
            .inspect_err(log_handle_failure("read", file))
    }

    /// Read at `offset`; the cursor is left alone.
    pub fn pread(&self, file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.read_vectored(file, Some(offset), &mut [IoSliceMut::new(buf)])
            .inspect_err(log_handle_failure("pread", file))
    }

    pub fn readv(&self, file: &File, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        self.read_vectored(file, None, bufs)
            .inspect_err(log_handle_failure("readv", file))
    }

    pub fn preadv(&self, file: &File, bufs: &mut [IoSliceMut<'_>], offset: u64) -> Result<usize> {
        self.read_vectored(file, Some(offset), bufs)
            .inspect_err(log_handle_failure("preadv", file))
    }

    fn read_vectored(&self, file: &File, at: Option<u64>, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        self.check_readable(file)?;
        let vinode = file.vinode();
        let mut state = file.state();
        let mut pos = at.unwrap_or(state.offset);
        let mut total = 0;
        {
            let inode = vinode.read();
            for buf in bufs.iter_mut() {
                let n = read_extents(vinode, &inode, pos, buf, &mut state.cached)?;
                total += n;
                pos += n as u64;
                if n < buf.len() {
                    break;
                }
            }
        }
        if at.is_none() {
            state.offset = pos;
        }
        drop(state);
        self.touch_atime(file);
        Ok(total)
    }

    // ── Write ───────────────────────────────────────────────────────────────

    /// Write at the cursor (or at end of file with [`OpenFlags::APPEND`])
    /// and advance it.
    pub fn write(&self, file: &File, data: &[u8]) -> Result<usize> {
        self.write_at(file, None, data)
            .inspect_err(log_handle_failure("write", file))
    }

    pub fn pwrite(&self, file: &File, data: &[u8], offset: u64) -> Result<usize> {
        self.write_at(file, Some(offset), data)
            .inspect_err(log_handle_failure("pwrite", file))
    }

    /// Gathers `bufs` into one write, so the whole vector lands atomically.
    pub fn writev(&self, file: &File, bufs: &[IoSlice<'_>]) -> Result<usize> {
        self.write_at(file, None, &gather(bufs))
            .inspect_err(log_handle_failure("writev", file))
    }

    pub fn pwritev(&self, file: &File, bufs: &[IoSlice<'_>], offset: u64) -> Result<usize> {
        self.write_at(file, Some(offset), &gather(bufs))
            .inspect_err(log_handle_failure("pwritev", file))
    }

    fn write_at(&self, file: &File, at: Option<u64>, data: &[u8]) -> Result<usize> {
        self.check_writable(file)?;
        let vinode = file.vinode();
        let mut state = file.state();
        let mut inode = vinode.write();
        let offset = if file.flags().contains(OpenFlags::APPEND) {
            inode.size
        } else {
            at.unwrap_or(state.offset)
        };
        let written = self.write_locked(vinode, &mut inode, offset, data, &mut state.cached)?;
        if at.is_none() {
            state.offset = offset + written as u64;
        }
        Ok(written)
    }

    /// Write under the inode's write lock, as one transaction. Storage for
    /// every hole the range covers is reserved before anything changes.
    fn write_locked(
        &self,
        vinode: &Vinode,
        inode: &mut Inode,
        offset: u64,
        data: &[u8],
        cached: &mut Option<CachedExtent>,
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(PmfsError::FileTooLarge)?;
        if cached.is_some_and(|c| c.generation != vinode.invalidation()) {
            *cached = None;
        }
        let mut tx = self.pool.begin();
        let now = tx.now();
        let extents = inode.extents_mut()?;
        let last = match *cached {
            Some(c) if extents.write_in_extent(c.index, offset, data) => {
                trace!(ino = vinode.ino().0, offset, len = data.len(), "write fast path");
                Some(c.index)
            }
            _ => {
                let plan = extents.plan_write(
                    offset,
                    data.len() as u64,
                    self.geometry(),
                    ExtentFlags::INITIALIZED,
                );
                for alloc in plan.allocations() {
                    tx.reserve(AllocSite::Extent, alloc.bytes())?;
                }
                let hint = if plan.is_empty() {
                    cached.map(|c| c.index)
                } else {
                    extents.apply_plan(&plan);
                    vinode.bump_invalidation();
                    None
                };
                extents.apply_write(offset, data, hint)
            }
        };
        inode.size = inode.size.max(end);
        inode.touch_modified(now);
        tx.commit();
        *cached = last.map(|index| CachedExtent {
            index,
            generation: vinode.invalidation(),
        });
        Ok(data.len())
    }

    // ── Cursor and size ─────────────────────────────────────────────────────

    /// Move the cursor. Returns the new offset.
    pub fn lseek(&self, file: &File, pos: SeekFrom) -> Result<u64> {
        self.lseek_inner(file, pos)
            .inspect_err(log_handle_failure("lseek", file))
    }

    fn lseek_inner(&self, file: &File, pos: SeekFrom) -> Result<u64> {
        self.check_owner(file)?;
        if file.flags().is_path_only() {
            return Err(PmfsError::BadHandle);
        }
        let mut state = file.state();
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => state.offset.checked_add_signed(delta),
            SeekFrom::End(delta) => file.vinode().read().size.checked_add_signed(delta),
        };
        let target = target
            .filter(|t| *t <= MAX_FILE_SIZE)
            .ok_or_else(|| PmfsError::InvalidArgument(format!("seek {pos:?} out of range")))?;
        state.offset = target;
        Ok(target)
    }

    pub fn ftruncate(&self, file: &File, len: u64) -> Result<()> {
        self.ftruncate_inner(file, len)
            .inspect_err(log_handle_failure("ftruncate", file))
    }

    fn ftruncate_inner(&self, file: &File, len: u64) -> Result<()> {
        self.check_owner(file)?;
        if file.flags().is_path_only() {
            return Err(PmfsError::BadHandle);
        }
        if !file.flags().is_writable() {
            return Err(PmfsError::InvalidArgument(
                "handle is not open for writing".into(),
            ));
        }
        let vinode = file.vinode();
        let mut inode = vinode.write();
        self.truncate_locked(vinode, &mut inode, len)
    }

    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        self.resolve(Anchor::Cwd, path, true)
            .and_then(|vinode| {
                let mut inode = vinode.write();
                self.truncate_locked(&vinode, &mut inode, len)
            })
            .inspect_err(log_failure("truncate", path))
    }

    /// Set the size to `len`. Shrinking releases storage past the new end;
    /// growing leaves a hole.
    fn truncate_locked(&self, vinode: &Vinode, inode: &mut Inode, len: u64) -> Result<()> {
        if len > MAX_FILE_SIZE {
            return Err(PmfsError::FileTooLarge);
        }
        let mut tx = self.pool.begin();
        let now = tx.now();
        let released = inode.extents_mut()?.truncate(len);
        if released > 0 {
            tx.release(released);
            vinode.bump_invalidation();
        }
        inode.size = len;
        inode.touch_modified(now);
        tx.commit();
        trace!(ino = vinode.ino().0, len, released, "truncated");
        Ok(())
    }

    /// Preallocate or punch out `[offset, offset + len)`.
    ///
    /// Preallocated ranges read as zeros. Without
    /// [`FallocateFlags::KEEP_SIZE`] the file grows to cover the range.
    /// [`FallocateFlags::PUNCH_HOLE`] must be combined with `KEEP_SIZE`.
    pub fn fallocate(&self, file: &File, flags: FallocateFlags, offset: u64, len: u64) -> Result<()> {
        self.fallocate_inner(file, flags, offset, len)
            .inspect_err(log_handle_failure("fallocate", file))
    }

    fn fallocate_inner(&self, file: &File, flags: FallocateFlags, offset: u64, len: u64) -> Result<()> {
        reject_unknown(flags.bits(), FallocateFlags::all().bits(), "fallocate")?;
        if len == 0 {
            return Err(PmfsError::InvalidArgument("fallocate length is zero".into()));
        }
        let punch = flags.contains(FallocateFlags::PUNCH_HOLE);
        let keep_size = flags.contains(FallocateFlags::KEEP_SIZE);
        if punch && !keep_size {
            return Err(PmfsError::InvalidArgument(
                "PUNCH_HOLE requires KEEP_SIZE".into(),
            ));
        }
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(PmfsError::FileTooLarge)?;
        self.check_writable(file)?;

        let vinode = file.vinode();
        let mut inode = vinode.write();
        let mut tx = self.pool.begin();
        let now = tx.now();
        let extents = inode.extents_mut()?;
        if punch {
            let released = extents.punch_hole(offset, len);
            if released > 0 {
                tx.release(released);
                vinode.bump_invalidation();
            }
        } else {
            let plan = extents.plan_write(offset, len, self.geometry(), ExtentFlags::empty());
            for alloc in plan.allocations() {
                tx.reserve(AllocSite::Extent, alloc.bytes())?;
            }
            if !plan.is_empty() {
                extents.apply_plan(&plan);
                vinode.bump_invalidation();
            }
            if !keep_size {
                inode.size = inode.size.max(end);
            }
        }
        inode.touch_modified(now);
        tx.commit();
        trace!(ino = vinode.ino().0, ?flags, offset, len, "fallocate");
        Ok(())
    }

    // ── Directories ─────────────────────────────────────────────────────────

    /// Return up to `max` entries from the handle's cursor, `.` and `..`
    /// included, and advance the cursor past them. An empty result means
    /// the end of the directory.
    pub fn read_dir(&self, file: &File, max: usize) -> Result<Vec<DirEntry>> {
        self.read_dir_inner(file, max)
            .inspect_err(log_handle_failure("read_dir", file))
    }

    fn read_dir_inner(&self, file: &File, max: usize) -> Result<Vec<DirEntry>> {
        self.check_owner(file)?;
        if file.flags().is_path_only() {
            return Err(PmfsError::BadHandle);
        }
        if !file.vinode().is_dir() {
            return Err(PmfsError::NotDirectory);
        }
        let mut state = file.state();
        let entries: Vec<DirEntry> = {
            let inode = file.vinode().read();
            inode
                .dir()?
                .entries_from(state.offset)
                .take(max)
                .cloned()
                .collect()
        };
        if let Some(last) = entries.last() {
            state.offset = last.cookie + 1;
        }
        drop(state);
        self.touch_atime(file);
        Ok(entries)
    }
}

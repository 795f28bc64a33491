//! Path resolution.
//!
//! A path is walked one component at a time from its anchor: the working
//! directory, an open handle, or root 0 for absolute paths. `..` follows
//! the vinode's recorded parent and stops at any root. Symlinks met before
//! the final component are always expanded in place; the final component
//! is expanded only on request or when the path ends in `/`.

use crate::{File, PoolFs};
use pmfs_dir::{DOT, DOTDOT};
use pmfs_error::{PmfsError, Result};
use pmfs_inode::VinodeRef;
use pmfs_types::{FileType, MAX_NAME_LEN, PATH_MAX};
use tracing::trace;

/// Starting point for a relative path.
#[derive(Debug, Clone, Copy)]
pub enum Anchor<'a> {
    /// The instance's working directory.
    Cwd,
    /// An open handle. Path-only handles qualify.
    Handle(&'a File),
}

/// A path split at its final component.
#[derive(Debug)]
pub(crate) struct ParentPath {
    /// Directory holding, or about to hold, the final component.
    pub dir: VinodeRef,
    /// `None` when the path names a root or the anchor itself.
    pub name: Option<String>,
    pub trailing_slash: bool,
}

fn check_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(PmfsError::NotFound("empty path".into()));
    }
    // PATH_MAX counts the terminating NUL.
    if path.len() >= PATH_MAX {
        return Err(PmfsError::NameTooLong);
    }
    if path.contains('\0') {
        return Err(PmfsError::InvalidArgument("path contains NUL".into()));
    }
    Ok(())
}

/// Components of `path` in reverse, ready to be popped in walk order.
fn components(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|c| !c.is_empty())
        .rev()
        .map(str::to_owned)
        .collect()
}

impl PoolFs {
    fn default_root(&self) -> VinodeRef {
        self.roots[0].clone()
    }

    /// The vinode an anchor designates.
    pub(crate) fn anchor_vinode(&self, anchor: Anchor<'_>) -> Result<VinodeRef> {
        match anchor {
            Anchor::Cwd => Ok(self.cwd.read().clone()),
            Anchor::Handle(file) => {
                self.check_owner(file)?;
                Ok(file.vinode().clone())
            }
        }
    }

    fn start_of(&self, anchor: Anchor<'_>, path: &str) -> Result<VinodeRef> {
        if path.starts_with('/') {
            Ok(self.default_root())
        } else {
            self.anchor_vinode(anchor)
        }
    }

    /// Resolve everything but the final component of `path`.
    pub(crate) fn resolve_parent(&self, anchor: Anchor<'_>, path: &str) -> Result<ParentPath> {
        check_path(path)?;
        let start = self.start_of(anchor, path)?;
        let mut expansions = 0;
        self.walk(start, path, &mut expansions)
    }

    /// Resolve `path` to the vinode it names.
    pub(crate) fn resolve(&self, anchor: Anchor<'_>, path: &str, follow: bool) -> Result<VinodeRef> {
        check_path(path)?;
        let start = self.start_of(anchor, path)?;
        let mut expansions = 0;
        let mut parent = self.walk(start, path, &mut expansions)?;
        loop {
            let target = match parent.name.as_deref() {
                None => parent.dir.clone(),
                Some(name) => self.lookup_final(&parent.dir, name)?,
            };
            if target.kind() == FileType::Symlink && (follow || parent.trailing_slash) {
                let text = target.read().symlink_target()?.to_owned();
                self.count_expansion(&mut expansions, &text)?;
                let from = if text.starts_with('/') {
                    self.default_root()
                } else {
                    parent.dir.clone()
                };
                let trailing_slash = parent.trailing_slash;
                parent = self.walk(from, &text, &mut expansions)?;
                parent.trailing_slash |= trailing_slash;
                continue;
            }
            if parent.trailing_slash && !target.is_dir() {
                return Err(PmfsError::NotDirectory);
            }
            return Ok(target);
        }
    }

    /// Resolve for the `*at` calls: an empty path with `empty_path` names
    /// the anchor itself.
    pub(crate) fn resolve_at(
        &self,
        anchor: Anchor<'_>,
        path: &str,
        follow: bool,
        empty_path: bool,
    ) -> Result<VinodeRef> {
        if path.is_empty() && empty_path {
            return self.anchor_vinode(anchor);
        }
        self.resolve(anchor, path, follow)
    }

    fn walk(&self, start: VinodeRef, path: &str, expansions: &mut usize) -> Result<ParentPath> {
        let trailing_slash = path.ends_with('/');
        let mut pending = components(path);
        let mut dir = start;
        loop {
            let Some(name) = pending.pop() else {
                return Ok(ParentPath {
                    dir,
                    name: None,
                    trailing_slash,
                });
            };
            if pending.is_empty() {
                if !dir.is_dir() {
                    return Err(PmfsError::NotDirectory);
                }
                return Ok(ParentPath {
                    dir,
                    name: Some(name),
                    trailing_slash,
                });
            }
            dir = self.step(&dir, &name, &mut pending, expansions)?;
        }
    }

    /// Move through one intermediate component.
    fn step(
        &self,
        dir: &VinodeRef,
        name: &str,
        pending: &mut Vec<String>,
        expansions: &mut usize,
    ) -> Result<VinodeRef> {
        let next = self.lookup_final(dir, name)?;
        match next.kind() {
            FileType::Directory => Ok(next),
            FileType::RegularFile => Err(PmfsError::NotDirectory),
            FileType::Symlink => {
                let text = next.read().symlink_target()?.to_owned();
                self.count_expansion(expansions, &text)?;
                pending.extend(components(&text));
                if text.starts_with('/') {
                    Ok(self.default_root())
                } else {
                    Ok(dir.clone())
                }
            }
        }
    }

    fn count_expansion(&self, expansions: &mut usize, target: &str) -> Result<()> {
        *expansions += 1;
        if *expansions > self.config().max_symlink_expansions {
            return Err(PmfsError::SymlinkLoop);
        }
        if target.is_empty() {
            return Err(PmfsError::NotFound("empty symlink target".into()));
        }
        Ok(())
    }

    /// Look up one component of `dir`, `.` and `..` included.
    pub(crate) fn lookup_final(&self, dir: &VinodeRef, name: &str) -> Result<VinodeRef> {
        match name {
            DOT if dir.is_dir() => Ok(dir.clone()),
            DOT => Err(PmfsError::NotDirectory),
            DOTDOT => self.parent_of(dir),
            _ => self.lookup_child(dir, name),
        }
    }

    /// Look up a named entry of `dir` and materialize its vinode.
    pub(crate) fn lookup_child(&self, dir: &VinodeRef, name: &str) -> Result<VinodeRef> {
        if name.len() > MAX_NAME_LEN {
            return Err(PmfsError::NameTooLong);
        }
        let inode = dir.read();
        let ino = inode
            .dir()?
            .lookup(name)
            .map(|entry| entry.ino)
            .ok_or_else(|| PmfsError::NotFound(name.to_owned()))?;
        trace!(dir = dir.ino().0, name, ino = ino.0, "lookup");
        // Materialize under the read lock so the entry cannot be removed
        // and its inode freed in between.
        let child = self.cache.materialize(ino, Some(dir));
        drop(inode);
        child
    }

    /// The directory `..` leads to. A root is its own parent.
    pub(crate) fn parent_of(&self, dir: &VinodeRef) -> Result<VinodeRef> {
        if !dir.is_dir() {
            return Err(PmfsError::NotDirectory);
        }
        if dir.is_root() {
            return Ok(dir.clone());
        }
        if let Some(parent) = dir.parent().and_then(|p| self.cache.acquire_cached(p)) {
            return Ok(parent);
        }
        let parent = dir.read().dir()?.parent();
        self.cache.materialize(parent, None)
    }
}

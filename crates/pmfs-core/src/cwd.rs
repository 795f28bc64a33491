//! Working directory: chdir, fchdir, getcwd.

use crate::path::Anchor;
use crate::{File, PoolFs, log_failure, log_handle_failure};
use pmfs_error::{PmfsError, Result};
use pmfs_inode::VinodeRef;
use std::mem;
use tracing::trace;

impl PoolFs {
    pub fn chdir(&self, path: &str) -> Result<()> {
        self.resolve(Anchor::Cwd, path, true)
            .and_then(|dir| self.set_cwd(dir))
            .inspect_err(log_failure("chdir", path))
    }

    /// Change into the directory `file` refers to. Path-only handles work.
    pub fn fchdir(&self, file: &File) -> Result<()> {
        self.check_owner(file)
            .and_then(|()| self.set_cwd(file.vinode().clone()))
            .inspect_err(log_handle_failure("fchdir", file))
    }

    fn set_cwd(&self, dir: VinodeRef) -> Result<()> {
        if !dir.is_dir() {
            return Err(PmfsError::NotDirectory);
        }
        trace!(ino = dir.ino().0, "chdir");
        let old = mem::replace(&mut *self.cwd.write(), dir);
        // Released after the cwd lock: the last reference may evict.
        drop(old);
        Ok(())
    }

    /// Absolute path of the working directory within its root.
    pub fn getcwd(&self) -> Result<String> {
        let cwd = self.cwd.read().clone();
        self.dir_path(&cwd).inspect_err(log_failure("getcwd", ""))
    }

    /// Copy the working directory path and a NUL terminator into `buf`.
    /// Returns the path length.
    pub fn getcwd_into(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(PmfsError::InvalidArgument("empty buffer".into()));
        }
        let path = self.getcwd()?;
        let len = path.len();
        if len + 1 > buf.len() {
            return Err(PmfsError::ResultTooLarge);
        }
        buf[..len].copy_from_slice(path.as_bytes());
        buf[len] = 0;
        Ok(len)
    }

    /// Absolute path of the directory `file` refers to.
    pub fn get_dir_path(&self, file: &File) -> Result<String> {
        self.check_owner(file)
            .and_then(|()| {
                if file.vinode().is_dir() {
                    self.dir_path(file.vinode())
                } else {
                    Err(PmfsError::NotDirectory)
                }
            })
            .inspect_err(log_handle_failure("get_dir_path", file))
    }

    /// Walk `..` up to the root, naming each step. Fails if any directory
    /// on the way has been removed.
    fn dir_path(&self, dir: &VinodeRef) -> Result<String> {
        let mut names = Vec::new();
        let mut current = dir.clone();
        while !current.is_root() {
            if current.read().nlink == 0 {
                return Err(PmfsError::NotFound(format!(
                    "directory {} was removed",
                    current.ino()
                )));
            }
            let parent = self.parent_of(&current)?;
            let name = parent
                .read()
                .dir()?
                .name_of(current.ino())
                .map(str::to_owned)
                .ok_or_else(|| {
                    PmfsError::NotFound(format!("directory {} is unlinked", current.ino()))
                })?;
            names.push(name);
            current = parent;
        }
        if names.is_empty() {
            return Ok("/".to_owned());
        }
        Ok(names.iter().rev().fold(String::new(), |mut path, name| {
            path.push('/');
            path.push_str(name);
            path
        }))
    }
}

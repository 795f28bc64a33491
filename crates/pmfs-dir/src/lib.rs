#![forbid(unsafe_code)]
//! Directory entry tables.
//!
//! A directory maps names to `(inode, type)` pairs. Every entry carries a
//! cookie drawn from a per-directory counter that only grows, so a saved
//! cursor stays valid while other entries come and go. Removal deletes
//! the entry outright; emptiness is simply "only `.` and `..` remain".

use pmfs_error::{PmfsError, Result};
use pmfs_types::{FileType, InodeNumber, MAX_NAME_LEN};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const DOT: &str = ".";
pub const DOTDOT: &str = "..";

/// Fixed per-entry header (inode, cookie, type, name length).
const DIR_ENTRY_HEADER_LEN: u64 = 24;

const DOT_COOKIE: u64 = 0;
const DOTDOT_COOKIE: u64 = 1;

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

/// Pool bytes consumed by an entry named `name`.
#[must_use]
pub fn entry_footprint(name: &str) -> u64 {
    align8(DIR_ENTRY_HEADER_LEN + name.len() as u64)
}

/// Check a single path component before it is stored.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PmfsError::InvalidArgument(
            "directory entry name cannot be empty".to_owned(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(PmfsError::NameTooLong);
    }
    if name.contains('/') || name.contains('\0') {
        return Err(PmfsError::InvalidArgument(format!(
            "directory entry name {name:?} contains a reserved byte"
        )));
    }
    Ok(())
}

#[must_use]
pub fn is_dot_or_dotdot(name: &str) -> bool {
    name == DOT || name == DOTDOT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub ino: InodeNumber,
    pub kind: FileType,
    /// Position of this entry; iteration resumes from a cookie.
    pub cookie: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DirectoryImage", into = "DirectoryImage")]
pub struct Directory {
    entries: BTreeMap<u64, DirEntry>,
    by_name: HashMap<String, u64>,
    next_cookie: u64,
}

#[derive(Serialize, Deserialize)]
struct DirectoryImage {
    entries: Vec<DirEntry>,
    next_cookie: u64,
}

impl From<DirectoryImage> for Directory {
    fn from(image: DirectoryImage) -> Self {
        let mut dir = Self {
            entries: BTreeMap::new(),
            by_name: HashMap::with_capacity(image.entries.len()),
            next_cookie: image.next_cookie,
        };
        for entry in image.entries {
            dir.next_cookie = dir.next_cookie.max(entry.cookie + 1);
            dir.by_name.insert(entry.name.clone(), entry.cookie);
            dir.entries.insert(entry.cookie, entry);
        }
        dir
    }
}

impl From<Directory> for DirectoryImage {
    fn from(dir: Directory) -> Self {
        Self {
            entries: dir.entries.into_values().collect(),
            next_cookie: dir.next_cookie,
        }
    }
}

impl Directory {
    /// A fresh directory holding only `.` and `..`. A root passes its own
    /// inode as `parent`.
    #[must_use]
    pub fn new(self_ino: InodeNumber, parent: InodeNumber) -> Self {
        let mut dir = Self {
            entries: BTreeMap::new(),
            by_name: HashMap::new(),
            next_cookie: DOTDOT_COOKIE + 1,
        };
        for (cookie, name, ino) in [(DOT_COOKIE, DOT, self_ino), (DOTDOT_COOKIE, DOTDOT, parent)] {
            dir.by_name.insert(name.to_owned(), cookie);
            dir.entries.insert(
                cookie,
                DirEntry {
                    name: name.to_owned(),
                    ino,
                    kind: FileType::Directory,
                    cookie,
                },
            );
        }
        dir
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&DirEntry> {
        self.by_name
            .get(name)
            .and_then(|cookie| self.entries.get(cookie))
    }

    /// Add `name -> ino`. Fails with `Exists` if the name is taken.
    pub fn insert(&mut self, name: &str, ino: InodeNumber, kind: FileType) -> Result<u64> {
        validate_name(name)?;
        if self.by_name.contains_key(name) {
            return Err(PmfsError::Exists);
        }
        let cookie = self.next_cookie;
        self.next_cookie += 1;
        self.by_name.insert(name.to_owned(), cookie);
        self.entries.insert(
            cookie,
            DirEntry {
                name: name.to_owned(),
                ino,
                kind,
                cookie,
            },
        );
        Ok(cookie)
    }

    /// Delete `name`. `.` and `..` cannot be removed.
    pub fn remove(&mut self, name: &str) -> Result<DirEntry> {
        if is_dot_or_dotdot(name) {
            return Err(PmfsError::InvalidArgument(format!(
                "cannot remove {name:?} entry"
            )));
        }
        let cookie = self
            .by_name
            .remove(name)
            .ok_or_else(|| PmfsError::NotFound(name.to_owned()))?;
        self.entries
            .remove(&cookie)
            .ok_or_else(|| PmfsError::NotFound(name.to_owned()))
    }

    /// Point an existing entry at a different inode, keeping its cookie.
    pub fn retarget(&mut self, name: &str, ino: InodeNumber, kind: FileType) -> Result<()> {
        let entry = self
            .by_name
            .get(name)
            .and_then(|cookie| self.entries.get_mut(cookie))
            .ok_or_else(|| PmfsError::NotFound(name.to_owned()))?;
        entry.ino = ino;
        entry.kind = kind;
        Ok(())
    }

    /// Target of the `..` entry.
    #[must_use]
    pub fn parent(&self) -> InodeNumber {
        self.entries
            .get(&DOTDOT_COOKIE)
            .map_or(InodeNumber(0), |e| e.ino)
    }

    pub fn set_parent(&mut self, parent: InodeNumber) {
        if let Some(entry) = self.entries.get_mut(&DOTDOT_COOKIE) {
            entry.ino = parent;
        }
    }

    /// True iff only `.` and `..` remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries
            .values()
            .all(|e| is_dot_or_dotdot(&e.name))
    }

    /// Number of entries, including `.` and `..`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries with a cookie at or after `cursor`, in cookie order.
    pub fn entries_from(&self, cursor: u64) -> impl Iterator<Item = &DirEntry> {
        self.entries.range(cursor..).map(|(_, e)| e)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.values()
    }

    /// Name under which `ino` appears, ignoring `.` and `..`.
    #[must_use]
    pub fn name_of(&self, ino: InodeNumber) -> Option<&str> {
        self.entries
            .values()
            .find(|e| e.ino == ino && !is_dot_or_dotdot(&e.name))
            .map(|e| e.name.as_str())
    }

    /// Pool bytes held by all entries.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.entries.values().map(|e| entry_footprint(&e.name)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fresh() -> Directory {
        Directory::new(InodeNumber(10), InodeNumber(1))
    }

    #[test]
    fn new_directory_has_dot_entries() {
        let dir = fresh();
        assert_eq!(dir.len(), 2);
        assert!(dir.is_empty());
        assert_eq!(dir.lookup(".").map(|e| e.ino), Some(InodeNumber(10)));
        assert_eq!(dir.parent(), InodeNumber(1));
    }

    #[test]
    fn insert_lookup_remove() {
        let mut dir = fresh();
        dir.insert("a", InodeNumber(11), FileType::RegularFile)
            .expect("insert");
        assert!(!dir.is_empty());
        assert!(matches!(
            dir.insert("a", InodeNumber(12), FileType::RegularFile),
            Err(PmfsError::Exists)
        ));
        let removed = dir.remove("a").expect("remove");
        assert_eq!(removed.ino, InodeNumber(11));
        assert!(dir.is_empty());
        assert!(matches!(dir.remove("a"), Err(PmfsError::NotFound(_))));
    }

    #[test]
    fn dot_entries_are_protected() {
        let mut dir = fresh();
        assert!(matches!(dir.remove("."), Err(PmfsError::InvalidArgument(_))));
        assert!(matches!(dir.remove(".."), Err(PmfsError::InvalidArgument(_))));
        assert!(matches!(
            dir.insert("..", InodeNumber(3), FileType::Directory),
            Err(PmfsError::Exists)
        ));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("ok").is_ok());
        assert!(matches!(validate_name(""), Err(PmfsError::InvalidArgument(_))));
        assert!(matches!(validate_name("a/b"), Err(PmfsError::InvalidArgument(_))));
        assert!(validate_name(&"x".repeat(255)).is_ok());
        assert!(matches!(validate_name(&"x".repeat(256)), Err(PmfsError::NameTooLong)));
    }

    #[test]
    fn set_parent_rewrites_dotdot() {
        let mut dir = fresh();
        dir.set_parent(InodeNumber(99));
        assert_eq!(dir.lookup("..").map(|e| e.ino), Some(InodeNumber(99)));
    }

    #[test]
    fn retarget_keeps_cookie() {
        let mut dir = fresh();
        let cookie = dir
            .insert("x", InodeNumber(20), FileType::Symlink)
            .expect("insert");
        dir.retarget("x", InodeNumber(21), FileType::Directory)
            .expect("retarget");
        let entry = dir.lookup("x").expect("entry");
        assert_eq!(
            (entry.ino, entry.kind, entry.cookie),
            (InodeNumber(21), FileType::Directory, cookie)
        );
    }

    #[test]
    fn serde_rebuilds_name_index() {
        let mut dir = fresh();
        dir.insert("f", InodeNumber(30), FileType::RegularFile)
            .expect("insert");
        let image = DirectoryImage::from(dir.clone());
        let back = Directory::from(image);
        assert_eq!(back, dir);
        assert!(back.lookup("f").is_some());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn cursor_survives_removal_of_other_entries(
            count in 1_usize..80,
            split in 0_usize..80,
            removals in proptest::collection::vec(0_usize..80, 0..40),
        ) {
            let mut dir = fresh();
            for i in 0..count {
                dir.insert(&format!("f{i}"), InodeNumber(100 + i as u64), FileType::RegularFile)
                    .expect("insert");
            }
            let all: Vec<String> = dir.iter().map(|e| e.name.clone()).collect();
            prop_assert_eq!(all.len(), count + 2);

            let split = split.min(all.len() - 1);
            let cursor = dir.iter().nth(split).map(|e| e.cookie).expect("cursor");
            let before: Vec<String> = dir.iter().take(split).map(|e| e.name.clone()).collect();

            // Remove only entries already returned before the cursor.
            for r in removals {
                if let Some(name) = before.get(r) {
                    let _ = dir.remove(name);
                }
            }
            let rest: Vec<String> = dir.entries_from(cursor).map(|e| e.name.clone()).collect();
            prop_assert_eq!(rest, all[split..].to_vec());
        }
    }
}

#![forbid(unsafe_code)]
//! Saving a pool to disk and loading it back.
//!
//! Scenarios tested:
//! 1. A saved pool loads with the same image, data and usage.
//! 2. A missing image file is an I/O error.
//! 3. A file that is not an image is corruption.
//! 4. Handles held across a save do not leak orphans into the loaded pool.

use pmfs_core::{FileType, OpenFlags, PmfsError, PoolConfig, PoolFs};

fn populated() -> PoolFs {
    let fs = PoolFs::create(PoolConfig::default()).expect("create pool");
    fs.mkdir("/docs", 0o750).expect("docs");
    fs.mkdir("/docs/drafts", 0o750).expect("drafts");
    let f = fs
        .open("/docs/readme", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
        .expect("readme");
    fs.write(&f, b"hello from a saved pool").expect("write");
    fs.pwrite(&f, b"tail", 1 << 20).expect("sparse tail");
    fs.link("/docs/readme", "/docs/drafts/readme-link").expect("link");
    fs.symlink("docs/readme", "/shortcut").expect("symlink");
    let r1 = fs.open_root(1, OpenFlags::empty()).expect("root 1");
    fs.mkdirat(pmfs_core::Anchor::Handle(&r1), "second-root-dir", 0o700)
        .expect("mkdir in root 1");
    fs
}

#[test]
fn saved_pool_loads_identically() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pool.json");
    let fs = populated();
    fs.save_image(&path).expect("save");

    let loaded = PoolFs::load_image(&path).expect("load");
    assert_eq!(loaded.export_image(), fs.export_image());
    assert_eq!(loaded.stats().used_bytes, fs.stats().used_bytes);

    let f = loaded.open("/shortcut", OpenFlags::empty(), 0).expect("open");
    let mut buf = [0u8; 23];
    loaded.read(&f, &mut buf).expect("read");
    assert_eq!(&buf, b"hello from a saved pool");
    let mut tail = [0u8; 4];
    loaded.pread(&f, &mut tail, 1 << 20).expect("tail");
    assert_eq!(&tail, b"tail");
    assert_eq!(loaded.stat("/docs/readme").expect("stat").nlink, 2);
    assert_eq!(
        loaded.lstat("/shortcut").expect("lstat").kind,
        FileType::Symlink
    );

    let r1 = loaded.open_root(1, OpenFlags::empty()).expect("root 1");
    let st = loaded
        .fstatat(
            pmfs_core::Anchor::Handle(&r1),
            "second-root-dir",
            pmfs_core::AtFlags::empty(),
        )
        .expect("root 1 content");
    assert_eq!(st.perm, 0o700);
}

#[test]
fn missing_image_is_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = PoolFs::load_image(&dir.path().join("absent.json")).expect_err("no file");
    assert!(matches!(err, PmfsError::Io(_)));
}

#[test]
fn garbage_image_is_corruption() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("garbage.json");
    std::fs::write(&path, b"{ not a pool").expect("write garbage");
    assert!(matches!(
        PoolFs::load_image(&path),
        Err(PmfsError::Corruption { .. })
    ));
}

#[test]
fn held_orphans_are_not_saved_as_live() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pool.json");
    let fs = populated();
    let held = fs
        .open("/docs/scratch", OpenFlags::CREAT | OpenFlags::RDWR, 0o600)
        .expect("scratch");
    fs.write(&held, &[0u8; 8192]).expect("fill");
    fs.unlink("/docs/scratch").expect("unlink");
    fs.save_image(&path).expect("save");

    let loaded = PoolFs::load_image(&path).expect("load");
    assert_eq!(loaded.inode_count(), fs.inode_count() - 1);
    assert!(loaded.stats().used_bytes < fs.stats().used_bytes);
    drop(held);
    assert_eq!(loaded.export_image(), fs.export_image());
}

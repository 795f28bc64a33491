#![forbid(unsafe_code)]
//! Multi-threaded stress through one shared pool.
//!
//! Scenarios tested:
//! 1. Cross-directory renames in opposite directions never deadlock and
//!    leave link counts intact.
//! 2. Two renames that would together form a cycle: exactly one wins.
//! 3. Readers never observe a torn write.
//! 4. Concurrent creates in one directory all land.
//! 5. File renames between disjoint directory pairs run side by side.

use pmfs_core::{OpenFlags, PmfsError, PoolConfig, PoolFs};
use std::thread;

fn fresh() -> PoolFs {
    PoolFs::create(PoolConfig::default()).expect("create pool")
}

// ---------------------------------------------------------------------------
// Scenario 1
// ---------------------------------------------------------------------------

#[test]
fn opposing_cross_directory_renames() {
    let fs = fresh();
    fs.mkdir("/a", 0o755).expect("a");
    fs.mkdir("/b", 0o755).expect("b");
    fs.mkdir("/a/d1", 0o755).expect("d1");
    fs.mkdir("/b/d2", 0o755).expect("d2");

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..200 {
                fs.rename("/a/d1", "/b/d1").expect("a -> b");
                fs.rename("/b/d1", "/a/d1").expect("b -> a");
            }
        });
        s.spawn(|| {
            for _ in 0..200 {
                fs.rename("/b/d2", "/a/d2").expect("b -> a");
                fs.rename("/a/d2", "/b/d2").expect("a -> b");
            }
        });
    });

    assert_eq!(fs.stat("/a").expect("a").nlink, 3);
    assert_eq!(fs.stat("/b").expect("b").nlink, 3);
    assert_eq!(fs.stat("/a/d1/..").expect("d1 parent").ino, fs.stat("/a").expect("a").ino);
    assert_eq!(fs.stat("/b/d2/..").expect("d2 parent").ino, fs.stat("/b").expect("b").ino);
}

// ---------------------------------------------------------------------------
// Scenario 2
// ---------------------------------------------------------------------------

#[test]
fn cycle_forming_renames_admit_one_winner() {
    for _ in 0..50 {
        let fs = fresh();
        fs.mkdir("/a", 0o755).expect("a");
        fs.mkdir("/b", 0o755).expect("b");

        let (first, second) = thread::scope(|s| {
            let first = s.spawn(|| fs.rename("/a", "/b/a"));
            let second = s.spawn(|| fs.rename("/b", "/a/b"));
            (
                first.join().expect("first thread"),
                second.join().expect("second thread"),
            )
        });

        assert!(
            first.is_ok() != second.is_ok(),
            "exactly one rename must win: {first:?} {second:?}"
        );
        let loser = first.err().or(second.err()).expect("one error");
        assert!(
            matches!(loser, PmfsError::InvalidArgument(_) | PmfsError::NotFound(_)),
            "unexpected loser error {loser:?}"
        );
        let root = fs.stat("/").expect("root");
        assert_eq!(root.nlink, 3, "one of a and b is left at the top");
    }
}

// ---------------------------------------------------------------------------
// Scenario 3
// ---------------------------------------------------------------------------

#[test]
fn readers_never_see_torn_writes() {
    const LEN: usize = 8 * 4096;
    let fs = fresh();
    let writer = fs
        .open("/f", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
        .expect("create");
    fs.pwrite(&writer, &[0u8; LEN], 0).expect("seed");

    thread::scope(|s| {
        s.spawn(|| {
            for round in 1..=100u8 {
                fs.ftruncate(&writer, 0).expect("truncate");
                fs.pwrite(&writer, &[round; LEN], 0).expect("rewrite");
            }
        });
        for _ in 0..3 {
            s.spawn(|| {
                let reader = fs.open("/f", OpenFlags::empty(), 0).expect("reader");
                let mut buf = vec![0u8; LEN];
                for _ in 0..200 {
                    let n = fs.pread(&reader, &mut buf, 0).expect("pread");
                    assert!(n == 0 || n == LEN, "partial read of {n} bytes");
                    let first = buf[0];
                    assert!(
                        buf[..n].iter().all(|b| *b == first),
                        "torn read"
                    );
                }
            });
        }
    });
}

// ---------------------------------------------------------------------------
// Scenario 4
// ---------------------------------------------------------------------------

#[test]
fn concurrent_creates_all_land() {
    let fs = fresh();
    fs.mkdir("/d", 0o755).expect("d");
    thread::scope(|s| {
        for t in 0..4 {
            let fs = &fs;
            s.spawn(move || {
                for i in 0..50 {
                    fs.open(
                        &format!("/d/t{t}-{i}"),
                        OpenFlags::CREAT | OpenFlags::EXCL | OpenFlags::WRONLY,
                        0o644,
                    )
                    .expect("create");
                }
            });
        }
    });
    let dir = fs.open("/d", OpenFlags::DIRECTORY, 0).expect("open dir");
    let mut count = 0;
    loop {
        let batch = fs.read_dir(&dir, 64).expect("read_dir");
        if batch.is_empty() {
            break;
        }
        count += batch.len();
    }
    assert_eq!(count, 4 * 50 + 2);
    assert_eq!(fs.inode_count(), fs.root_count() + 1 + 200);
}

// ---------------------------------------------------------------------------
// Scenario 5
// ---------------------------------------------------------------------------

#[test]
fn disjoint_cross_directory_file_renames() {
    let fs = fresh();
    for t in 0..4 {
        fs.mkdir(&format!("/src{t}"), 0o755).expect("src");
        fs.mkdir(&format!("/dst{t}"), 0o755).expect("dst");
        for i in 0..8 {
            fs.open(
                &format!("/src{t}/f{i}"),
                OpenFlags::CREAT | OpenFlags::WRONLY,
                0o644,
            )
            .expect("create");
        }
    }
    thread::scope(|s| {
        for t in 0..4 {
            let fs = &fs;
            s.spawn(move || {
                for _ in 0..50 {
                    for i in 0..8 {
                        fs.rename(&format!("/src{t}/f{i}"), &format!("/dst{t}/f{i}"))
                            .expect("there");
                    }
                    for i in 0..8 {
                        fs.rename(&format!("/dst{t}/f{i}"), &format!("/src{t}/f{i}"))
                            .expect("back");
                    }
                }
            });
        }
    });
    for t in 0..4 {
        for i in 0..8 {
            assert_eq!(
                fs.stat(&format!("/src{t}/f{i}")).expect("home again").nlink,
                1
            );
        }
        assert!(matches!(
            fs.stat(&format!("/dst{t}/f0")),
            Err(PmfsError::NotFound(_))
        ));
    }
    assert_eq!(fs.inode_count(), fs.root_count() + 8 + 32);
}

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use ramfs_core::*;
use tracing_subscriber::filter::LevelFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(LevelFilter::DEBUG)
        .try_init();
}

#[test]
fn test_sparse_write_scenario() {
    init_tracing();
    let session = MountSession::mount_with_str("mode=0644").unwrap();
    let fs = session.tree();
    assert_eq!(fs.getattr(fs.root()).unwrap().mode, 0o644);

    let file = fs.create(fs.root(), "f", NodeKind::Regular, 0o644).unwrap();
    let handle = fs.open(file).unwrap();
    assert_eq!(fs.write(handle, 0, b"0123456789").unwrap(), 10);
    assert_eq!(fs.write(handle, 20, b"abcde").unwrap(), 5);

    let data = fs.read(handle, 0, 25).unwrap();
    assert_eq!(data.len(), 25);
    assert_eq!(&data[..10], b"0123456789");
    assert_eq!(&data[10..20], &[0u8; 10]);
    assert_eq!(&data[20..], b"abcde");
    assert_eq!(fs.getattr(file).unwrap().size, 25);

    assert_eq!(fs.read(handle, 25, 8).unwrap(), Vec::<u8>::new());
    assert_eq!(fs.read_zero_extended(handle, 22, 8).unwrap(), b"cde\0\0\0\0\0");

    fs.close(handle).unwrap();
    session.unmount();
}

#[test]
fn test_mkdir_unlink_rmdir_teardown_scenario() {
    init_tracing();
    let session = MountSession::mount(MountOptions::default()).unwrap();
    let fs = session.tree();
    let root = fs.root();

    let d = fs.mkdir(root, "d", 0o755).unwrap();
    fs.create(d, "f", NodeKind::Regular, 0o644).unwrap();
    assert_eq!(fs.rmdir(root, "d"), Err(FsError::NotEmpty));
    fs.unlink(d, "f").unwrap();
    fs.rmdir(root, "d").unwrap();
    assert_eq!(fs.getattr(d), Err(FsError::NotFound));
    assert_eq!(fs.getattr(root).unwrap().nlink, 2);
    assert_eq!(fs.node_count(), 1);

    session.unmount();
    assert_eq!(fs.node_count(), 0);
}

#[test]
fn test_lookup_matches_insert_remove_history() {
    let fs = FilesystemTree::mount(MountOptions::default()).unwrap();
    let root = fs.root();
    let mut live = HashSet::new();

    for i in 0..200u32 {
        let name = format!("n{}", i % 37);
        if (i * 7) % 3 == 0 && live.contains(&name) {
            fs.unlink(root, &name).unwrap();
            live.remove(&name);
        } else if live.contains(&name) {
            assert_eq!(
                fs.create(root, &name, NodeKind::Regular, 0o644),
                Err(FsError::NameExists)
            );
        } else {
            fs.create(root, &name, NodeKind::Regular, 0o644).unwrap();
            live.insert(name);
        }

        for j in 0..37 {
            let probe = format!("n{}", j);
            assert_eq!(fs.lookup(root, &probe).is_ok(), live.contains(&probe));
        }
    }

    let listed: HashSet<String> = fs
        .readdir(root, 0)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(listed, live);
}

#[test]
fn test_directory_link_count_invariant() {
    let fs = FilesystemTree::mount(MountOptions::default()).unwrap();
    let root = fs.root();
    let a = fs.mkdir(root, "a", 0o755).unwrap();
    let b = fs.mkdir(root, "b", 0o755).unwrap();
    for name in ["x", "y", "z"] {
        fs.mkdir(a, name, 0o755).unwrap();
    }
    fs.create(a, "file", NodeKind::Regular, 0o644).unwrap();
    fs.rename(a, "x", b, "x").unwrap();
    fs.rename(a, "y", b, "x2").unwrap();
    fs.rmdir(b, "x2").unwrap();

    for dir in [root, a, b] {
        let subdirs = fs
            .readdir(dir, 0)
            .unwrap()
            .iter()
            .filter(|e| e.kind == NodeKind::Directory)
            .count() as u32;
        assert_eq!(fs.getattr(dir).unwrap().nlink, 2 + subdirs);
    }
}

#[test]
fn test_rename_replaces_previous_target() {
    let fs = FilesystemTree::mount(MountOptions::default()).unwrap();
    let root = fs.root();
    let dir = fs.mkdir(root, "dir", 0o755).unwrap();
    let a = fs.create(root, "a", NodeKind::Regular, 0o644).unwrap();
    let b = fs.create(dir, "b", NodeKind::Regular, 0o644).unwrap();

    fs.rename(root, "a", root, "x").unwrap();
    fs.rename(dir, "b", root, "x").unwrap();
    assert_eq!(fs.lookup(root, "x").unwrap(), b);
    assert_ne!(a, b);
    assert_eq!(fs.lookup(root, "a"), Err(FsError::NotFound));
    assert_eq!(fs.lookup(dir, "b"), Err(FsError::NotFound));
}

#[test]
fn test_concurrent_create_same_name() {
    for _ in 0..50 {
        let fs = Arc::new(FilesystemTree::mount(MountOptions::default()).unwrap());
        let barrier = Arc::new(Barrier::new(2));

        let results: Vec<_> = (0..2)
            .map(|_| {
                let fs = fs.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    fs.create(fs.root(), "same-name", NodeKind::Regular, 0o644)
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.contains(&Err(FsError::NameExists)));
        assert_eq!(fs.readdir(fs.root(), 0).unwrap().len(), 1);
    }
}

#[test]
fn test_concurrent_mutation_keeps_counts_consistent() {
    let fs = Arc::new(FilesystemTree::mount(MountOptions::default()).unwrap());
    let workers: Vec<_> = (0..8)
        .map(|t| {
            let fs = fs.clone();
            thread::spawn(move || {
                let root = fs.root();
                let dir = fs.mkdir(root, &format!("w{}", t), 0o755).unwrap();
                for i in 0..100 {
                    let name = format!("f{}", i);
                    let file = fs.create(dir, &name, NodeKind::Regular, 0o644).unwrap();
                    let handle = fs.open(file).unwrap();
                    fs.write(handle, (i * 10) as u64, b"payload").unwrap();
                    fs.close(handle).unwrap();
                    if i % 2 == 0 {
                        fs.unlink(dir, &name).unwrap();
                    } else {
                        fs.mkdir(dir, &format!("d{}", i), 0o755).unwrap();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let root = fs.root();
    assert_eq!(fs.getattr(root).unwrap().nlink, 2 + 8);
    for t in 0..8 {
        let dir = fs.lookup(root, &format!("w{}", t)).unwrap();
        assert_eq!(fs.getattr(dir).unwrap().nlink, 2 + 50);
        assert_eq!(fs.readdir(dir, 0).unwrap().len(), 100);
    }
    // root + 8 worker dirs + 8 * (50 files + 50 dirs)
    assert_eq!(fs.node_count(), 1 + 8 + 8 * 100);

    fs.teardown();
    assert_eq!(fs.node_count(), 0);
}

#[test]
fn test_io_proceeds_while_tree_is_mutated() {
    let fs = Arc::new(FilesystemTree::mount(MountOptions::default()).unwrap());
    let file = fs.create(fs.root(), "data", NodeKind::Regular, 0o644).unwrap();
    let handle = fs.open(file).unwrap();

    let writer = {
        let fs = fs.clone();
        thread::spawn(move || {
            for i in 0..256u64 {
                fs.write(handle, i * 16, &[i as u8; 16]).unwrap();
            }
        })
    };
    let mutator = {
        let fs = fs.clone();
        thread::spawn(move || {
            for i in 0..256 {
                let name = format!("tmp{}", i);
                fs.create(fs.root(), &name, NodeKind::Regular, 0o644).unwrap();
                fs.unlink(fs.root(), &name).unwrap();
            }
        })
    };
    writer.join().unwrap();
    mutator.join().unwrap();

    let data = fs.read(handle, 0, 4096).unwrap();
    assert_eq!(data.len(), 4096);
    for (i, chunk) in data.chunks(16).enumerate() {
        assert!(chunk.iter().all(|b| *b == i as u8));
    }
    fs.close(handle).unwrap();
}

#[test]
fn test_unlink_races_with_close() {
    for _ in 0..50 {
        let fs = Arc::new(FilesystemTree::mount(MountOptions::default()).unwrap());
        let file = fs.create(fs.root(), "f", NodeKind::Regular, 0o644).unwrap();
        let handle = fs.open(file).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let closer = {
            let (fs, barrier) = (fs.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                fs.close(handle).unwrap();
            })
        };
        barrier.wait();
        fs.unlink(fs.root(), "f").unwrap();
        closer.join().unwrap();

        assert_eq!(fs.getattr(file), Err(FsError::NotFound));
        assert_eq!(fs.node_count(), 1);
    }
}

#[test]
fn test_shared_mapping_through_tree() {
    let fs = FilesystemTree::mount(MountOptions::default()).unwrap();
    let file = fs.create(fs.root(), "m", NodeKind::Regular, 0o644).unwrap();
    let handle = fs.open(file).unwrap();
    fs.write(handle, 0, &[b'.'; 100]).unwrap();

    let region = fs.map_shared(handle, 0, PAGE_SIZE).unwrap();
    region.write(10, b"mapped").unwrap();
    assert_eq!(&fs.read(handle, 8, 10).unwrap(), b"..mapped..");
    assert_eq!(fs.map_shared(handle, 1, 10).unwrap_err(), FsError::InvalidArgument);

    fs.unlink(fs.root(), "m").unwrap();
    fs.close(handle).unwrap();
    // The mapping still holds the pages after the node is gone.
    assert_eq!(region.read(10, 6), b"mapped");
}

#[test]
fn test_memory_budget_failure_is_atomic() {
    init_tracing();
    let mut options = MountOptions::default();
    options.memory.max_bytes_in_memory = Some(2 * PAGE_SIZE as u64);
    let fs = FilesystemTree::mount(options).unwrap();
    let file = fs.create(fs.root(), "f", NodeKind::Regular, 0o644).unwrap();
    let handle = fs.open(file).unwrap();

    fs.write(handle, 0, &[1u8; PAGE_SIZE]).unwrap();
    assert_eq!(
        fs.write(handle, PAGE_SIZE as u64 - 1, &[2u8; PAGE_SIZE + 2]),
        Err(FsError::OutOfMemory)
    );
    assert_eq!(fs.getattr(file).unwrap().size, PAGE_SIZE as u64);
    assert!(fs.read(handle, 0, PAGE_SIZE).unwrap().iter().all(|b| *b == 1));

    fs.truncate(handle, 0).unwrap();
    assert_eq!(fs.statfs().unwrap().bytes_used, 0);
    fs.write(handle, 0, &[3u8; 2 * PAGE_SIZE]).unwrap();
}

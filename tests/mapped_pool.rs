//! End-to-end behavior of the file-backed pool.

use std::fs;
use std::sync::Arc;

use rumem::{memory_page_size, MapError, MapMode, MapOptions, MappedPool, NodeResource};

fn page() -> usize {
    memory_page_size()
}

#[test]
fn virgin_walk_returns_blocks_in_file_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("walk.pool");
    let block = page();

    let pool =
        MappedPool::with_options(&path, block, MapOptions::default().file_size(4 * block))
            .unwrap();
    assert_eq!(pool.pool_blocks(), 4);

    let base = pool.allocate().unwrap().as_ptr() as usize;
    for k in 1..4 {
        let p = pool.allocate().unwrap();
        assert_eq!(p.as_ptr() as usize, base + k * block);
    }
    assert!(pool.allocate().is_none());
}

#[test]
fn persistent_mode_writes_reach_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("persist.pool");
    let block = page();

    {
        let pool =
            MappedPool::with_options(&path, block, MapOptions::default().file_size(2 * block))
                .unwrap();
        let p = pool.allocate().unwrap();
        // Leave the first word zero so a later open still sees a virgin
        // head; the free-list head itself is never persisted.
        unsafe {
            p.as_ptr().add(8).write_bytes(0x5A, 24);
        }
    }

    let contents = fs::read(&path).unwrap();
    assert_eq!(contents.len(), 2 * block);
    assert!(contents[8..32].iter().all(|&byte| byte == 0x5A));

    // A fresh open starts from a fully free pool over the same bytes.
    let pool = MappedPool::new(&path, block).unwrap();
    let p = pool.allocate().unwrap();
    let data = unsafe { std::slice::from_raw_parts(p.as_ptr(), block) };
    assert!(data[8..32].iter().all(|&byte| byte == 0x5A));
}

#[test]
fn zero_init_clears_existing_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zeroed.pool");
    let block = page();

    {
        let pool =
            MappedPool::with_options(&path, block, MapOptions::default().file_size(2 * block))
                .unwrap();
        let p = pool.allocate().unwrap();
        unsafe { p.as_ptr().add(8).write_bytes(0xFF, 64) };
    }

    let pool =
        MappedPool::with_options(&path, block, MapOptions::default().zero_init(true)).unwrap();
    let p = pool.allocate().unwrap();
    let data = unsafe { std::slice::from_raw_parts(p.as_ptr(), block) };
    assert!(data.iter().all(|&byte| byte == 0));
}

#[test]
fn copy_on_write_leaves_the_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cow.pool");
    let block = page();

    drop(
        MappedPool::with_options(&path, block, MapOptions::default().file_size(2 * block))
            .unwrap(),
    );

    {
        let pool = MappedPool::with_options(
            &path,
            block,
            MapOptions::default().mode(MapMode::CopyOnWrite),
        )
        .unwrap();
        let p = pool.allocate().unwrap();
        unsafe { p.as_ptr().write_bytes(0xEE, block) };
    }

    let contents = fs::read(&path).unwrap();
    assert!(contents.iter().all(|&byte| byte == 0));
}

#[test]
fn read_only_mode_serves_blocks_for_reading() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.pool");
    let block = page();

    drop(
        MappedPool::with_options(&path, block, MapOptions::default().file_size(2 * block))
            .unwrap(),
    );

    let pool =
        MappedPool::with_options(&path, block, MapOptions::default().mode(MapMode::ReadOnly))
            .unwrap();
    let p = pool.allocate().unwrap();
    let data = unsafe { std::slice::from_raw_parts(p.as_ptr(), block) };
    assert!(data.iter().all(|&byte| byte == 0));
}

#[test]
fn node_resource_partitions_mapped_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.pool");
    let block = page();

    let pool = Arc::new(
        MappedPool::with_options(&path, block, MapOptions::default().file_size(2 * block))
            .unwrap(),
    );
    let resource = NodeResource::with_provider(pool.clone(), 64);

    // Both mapped blocks partition into nodes before exhaustion.
    let nodes = 2 * block / 64;
    let mut held = Vec::new();
    for _ in 0..nodes {
        held.push(resource.allocate(64).unwrap());
    }
    assert!(resource.allocate(64).is_none());

    unsafe { resource.deallocate(held.pop().unwrap()) };
    assert!(resource.allocate(64).is_some());
}

#[test]
fn error_messages_name_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.pool");

    let err = MappedPool::new(&path, page()).unwrap_err();
    assert!(matches!(err, MapError::SizeRequired { .. }));
    let rendered = err.to_string();
    assert!(rendered.contains("does not exist, and no size was provided"));
    assert!(rendered.contains("absent.pool"));

    let err = MappedPool::with_options(
        &path,
        page(),
        MapOptions::default().mode(MapMode::CopyOnWrite).file_size(page()),
    )
    .unwrap_err();
    assert!(err
        .to_string()
        .contains("copy-on-write was requested, but the file"));
}

#[test]
fn existing_file_must_be_page_granular() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ragged.bin");
    fs::write(&path, vec![0u8; page() + 1]).unwrap();

    let err = MappedPool::new(&path, page()).unwrap_err();
    assert!(matches!(err, MapError::UnalignedFileSize { .. }));
}

//! Concurrent stress over the pool stack.
//!
//! Exercises the lock-free protocol under contention: many threads hammering
//! one resource must never observe another thread's block, and the backing
//! pool must not grow past its steady-state chunk.

use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rumem::{memory_page_size, DequeResource, NodeResource, PagePool, UPPER_SIZE};

const THREADS: usize = 8;
const ITERS: usize = 100_000;

#[test]
fn stress_node_resource_exclusive_ownership() {
    const NODE_SIZE: usize = 64;

    let page = memory_page_size();
    let pool = Arc::new(PagePool::with_chunk_sizes(page, 2, 16));
    let resource = Arc::new(NodeResource::with_provider(pool.clone(), NODE_SIZE));

    let mut handles = Vec::new();
    for thread_id in 0..THREADS {
        let resource = Arc::clone(&resource);
        handles.push(thread::spawn(move || {
            let stamp = thread_id as u8 + 1;
            for _ in 0..ITERS {
                let p = resource.allocate(NODE_SIZE).unwrap();
                // While held, the block is ours alone: a torn pattern means
                // two threads were handed the same pointer.
                unsafe {
                    p.as_ptr().write_bytes(stamp, NODE_SIZE);
                    let data = std::slice::from_raw_parts(p.as_ptr(), NODE_SIZE);
                    assert!(data.iter().all(|&byte| byte == stamp));
                    resource.deallocate(p);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // One minimum chunk holds far more cells than the threads ever hold at
    // once, so the pool settles after its first refill.
    assert!(pool.pool_blocks() <= 2 + 4);
}

#[test]
fn stress_page_pool_direct() {
    let page = memory_page_size();
    let pool = Arc::new(PagePool::with_chunk_sizes(page, 4, 32));

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || {
            for _ in 0..ITERS / 10 {
                let p = pool.allocate().unwrap();
                unsafe { pool.deallocate(p) };
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Each thread holds at most one block, so growth stays within the
    // first couple of chunks.
    assert!(pool.pool_blocks() <= 4 + 8 + 16);
}

#[test]
fn stress_router_mixed_sizes() {
    let page = memory_page_size();
    let pool = Arc::new(PagePool::with_chunk_sizes(page * 8, 2, 16));
    let router = Arc::new(DequeResource::new(pool));

    let mut handles = Vec::new();
    for thread_id in 0..THREADS {
        let router = Arc::clone(&router);
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(thread_id as u64);
            let mut held: Vec<(std::ptr::NonNull<u8>, usize)> = Vec::new();
            for _ in 0..ITERS / 10 {
                if held.len() < 16 && rng.gen_bool(0.6) {
                    // Occasionally cross the fall-through boundary.
                    let size = rng.gen_range(1..=UPPER_SIZE + 64);
                    let p = router.allocate(size).unwrap();
                    unsafe { p.as_ptr().write_bytes(0xAB, size.min(8)) };
                    held.push((p, size));
                } else if let Some((p, size)) = held.pop() {
                    unsafe { router.deallocate(p, size) };
                }
            }
            for (p, size) in held {
                unsafe { router.deallocate(p, size) };
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

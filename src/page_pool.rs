//! Heap-backed page pool.
//!
//! A [`PagePool`] hands out fixed-size, page-granular blocks. Blocks are
//! carved out of chunks obtained from the system allocator; chunks grow
//! geometrically from a minimum up to a maximum size, so a pool that is
//! barely used stays small while a busy one quickly reaches its steady-state
//! chunk size.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::provider::{memory_page_size, BlockProvider};
use crate::storage::SegregatedStorage;
use crate::tagged::FreeNode;

/// Default byte size of the smallest chunk a pool pulls from the system.
pub const DEFAULT_MIN_CHUNK_BYTES: usize = 512 * 1024;

/// Default ratio between the largest and smallest chunk.
pub const DEFAULT_MAX_CHUNK_FACTOR: usize = 64;

/// One chunk obtained from the system allocator.
struct Chunk {
    base: *mut u8,
    layout: Layout,
}

/// Chunk bookkeeping, guarded by its own mutex and only touched on the
/// refill and teardown paths.
struct ChunkList {
    chunks: Vec<Chunk>,
    /// Doubles the next chunk until the maximum chunk size is reached.
    growth_step: u32,
}

/// Page-granular provider of fixed-size blocks, growing on demand.
pub struct PagePool {
    block_size: usize,
    /// Smallest chunk pulled from the system, in blocks.
    min_chunk_size: usize,
    /// Largest chunk pulled from the system, in blocks.
    max_chunk_size: usize,
    storage: SegregatedStorage,
    chunk_list: Mutex<ChunkList>,
    /// Total number of blocks ever added to the free list.
    pool_blocks: AtomicUsize,
}

// Safety: the raw chunk base pointers are only dereferenced through the
// storage's synchronized protocol; the chunk list itself is behind a mutex.
unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    /// Create a pool with default chunk sizing.
    ///
    /// `block_size` must be a nonzero multiple of the system page size.
    pub fn new(block_size: usize) -> Self {
        Self::with_chunk_sizes(block_size, 0, 0)
    }

    /// Create a pool with explicit chunk sizing, in blocks.
    ///
    /// A zero `min_chunk_size` selects enough blocks to cover
    /// [`DEFAULT_MIN_CHUNK_BYTES`]; a zero `max_chunk_size` selects
    /// [`DEFAULT_MAX_CHUNK_FACTOR`] times the minimum.
    pub fn with_chunk_sizes(
        block_size: usize,
        min_chunk_size: usize,
        max_chunk_size: usize,
    ) -> Self {
        let page_size = memory_page_size();
        assert!(
            block_size != 0 && block_size % page_size == 0,
            "block_size must be a nonzero multiple of the page size"
        );
        assert!(block_size >= std::mem::size_of::<FreeNode>());

        let min_chunk_size = if min_chunk_size == 0 {
            (DEFAULT_MIN_CHUNK_BYTES / block_size).max(2)
        } else {
            min_chunk_size
        };
        let max_chunk_size = if max_chunk_size == 0 {
            min_chunk_size * DEFAULT_MAX_CHUNK_FACTOR
        } else {
            max_chunk_size
        };
        assert!(min_chunk_size >= 1);
        assert!(max_chunk_size >= min_chunk_size);

        debug!(
            block_size,
            min_chunk_size, max_chunk_size, "created page pool"
        );

        Self {
            block_size,
            min_chunk_size,
            max_chunk_size,
            storage: SegregatedStorage::new(),
            chunk_list: Mutex::new(ChunkList {
                chunks: Vec::new(),
                growth_step: 0,
            }),
            pool_blocks: AtomicUsize::new(0),
        }
    }

    /// Hand out one block, or `None` when the system allocator is exhausted.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        self.storage.allocate(|| self.grow())
    }

    /// Return a block to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// pool and must not be in use.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        self.storage.deallocate(ptr);
    }

    /// Free every chunk back to the system.
    ///
    /// This is a terminal teardown: every pointer previously handed out by
    /// this pool (directly or through a resource layered on top) is
    /// invalidated. The caller guarantees no such pointer is still in use.
    pub fn release(&self) {
        let _guard = self.storage.lock_add_block();
        let mut list = self.chunk_list.lock();
        debug!(chunks = list.chunks.len(), "releasing page pool chunks");
        self.storage.reset();
        self.pool_blocks.store(0, Ordering::Relaxed);
        list.growth_step = 0;
        for chunk in list.chunks.drain(..) {
            unsafe { dealloc(chunk.base, chunk.layout) };
        }
    }

    /// The fixed size of every block this pool hands out.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks the pool has carved out of its chunks.
    pub fn pool_blocks(&self) -> usize {
        self.pool_blocks.load(Ordering::Relaxed)
    }

    /// Total bytes currently obtained from the system.
    pub fn total_size(&self) -> usize {
        self.pool_blocks() * self.block_size
    }

    /// Pull one chunk from the system allocator and splice it into the free
    /// list. Runs under the add-block mutex.
    fn grow(&self) -> bool {
        let mut list = self.chunk_list.lock();
        let chunk_blocks = (self.min_chunk_size << list.growth_step).min(self.max_chunk_size);
        let bytes = chunk_blocks * self.block_size;

        let layout = match Layout::from_size_align(bytes, memory_page_size()) {
            Ok(layout) => layout,
            Err(_) => return false,
        };
        // SAFETY: layout has nonzero size.
        let base = unsafe { alloc(layout) };
        let Some(block) = NonNull::new(base) else {
            return false;
        };

        trace!(chunk_blocks, bytes, "pulled a fresh chunk");
        list.chunks.push(Chunk { base, layout });
        if (self.min_chunk_size << list.growth_step) < self.max_chunk_size {
            list.growth_step += 1;
        }
        self.pool_blocks.fetch_add(chunk_blocks, Ordering::Relaxed);

        // SAFETY: the chunk is fresh, writable, and sized a multiple of
        // block_size; we hold the add-block mutex.
        unsafe { self.storage.add_block(block, bytes, self.block_size) };
        true
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let list = self.chunk_list.get_mut();
        for chunk in list.chunks.drain(..) {
            unsafe { dealloc(chunk.base, chunk.layout) };
        }
    }
}

impl BlockProvider for PagePool {
    fn allocate_block(&self) -> Option<NonNull<u8>> {
        self.allocate()
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_allocate_pulls_min_chunk() {
        let page = memory_page_size();
        let pool = PagePool::with_chunk_sizes(page, 2, 8);

        assert_eq!(pool.pool_blocks(), 0);
        let p = pool.allocate().unwrap();
        // One chunk of min_chunk_size blocks.
        assert_eq!(pool.pool_blocks(), 2);
        assert_eq!(pool.total_size(), 2 * page);
        unsafe { pool.deallocate(p) };
    }

    #[test]
    fn test_geometric_growth_caps_at_max() {
        let page = memory_page_size();
        let pool = PagePool::with_chunk_sizes(page, 2, 8);

        // Successive refills pull 2, 4, 8, 8, ... blocks.
        let mut held = Vec::new();
        for _ in 0..2 {
            held.push(pool.allocate().unwrap());
        }
        assert_eq!(pool.pool_blocks(), 2);
        for _ in 0..4 {
            held.push(pool.allocate().unwrap());
        }
        assert_eq!(pool.pool_blocks(), 2 + 4);
        held.push(pool.allocate().unwrap());
        assert_eq!(pool.pool_blocks(), 2 + 4 + 8);

        for p in held {
            unsafe { pool.deallocate(p) };
        }
    }

    #[test]
    fn test_deallocate_lifo() {
        let page = memory_page_size();
        let pool = PagePool::with_chunk_sizes(page, 4, 4);

        let _p1 = pool.allocate().unwrap();
        let p2 = pool.allocate().unwrap();
        let _p3 = pool.allocate().unwrap();

        unsafe { pool.deallocate(p2) };
        assert_eq!(pool.allocate(), Some(p2));
    }

    #[test]
    fn test_release_empty_pool_is_noop() {
        let pool = PagePool::new(memory_page_size());
        pool.release();
        assert_eq!(pool.pool_blocks(), 0);
    }

    #[test]
    fn test_release_reclaims_chunks() {
        let page = memory_page_size();
        let pool = PagePool::with_chunk_sizes(page, 2, 8);

        let _p = pool.allocate().unwrap();
        assert!(pool.pool_blocks() > 0);

        pool.release();
        assert_eq!(pool.pool_blocks(), 0);
        // The pool grows a fresh chunk on next use.
        assert!(pool.allocate().is_some());
        assert_eq!(pool.pool_blocks(), 2);
    }

    #[test]
    fn test_blocks_are_distinct() {
        let page = memory_page_size();
        let pool = PagePool::with_chunk_sizes(page, 4, 4);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..8 {
            let p = pool.allocate().unwrap();
            assert!(seen.insert(p.as_ptr() as usize));
        }
    }
}

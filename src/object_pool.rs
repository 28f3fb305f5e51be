//! Mutex-serialized per-type object pool.
//!
//! An [`ObjectPool`] hands out fixed-size cells for objects of one type,
//! `chunks_per_block` of them per heap block. Unlike the lock-free storage
//! in [`crate::storage`] it gives memory back: a block whose cells are all
//! free is returned to the system, provided the pool still holds at least
//! two blocks' worth of free cells (so a pool oscillating around a block
//! boundary does not thrash the system allocator).
//!
//! The size of a cell may be left to the first allocation, which is what
//! lets one pool back `allocate_shared`-style wrappers whose concrete type
//! is not visible at pool construction.

use std::alloc::{alloc, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::trace;

const WORD: usize = std::mem::size_of::<usize>();

/// Per-block header: the number of free cells currently inside the block.
#[repr(C)]
struct BlockHeader {
    free: usize,
}

/// A free cell. The first word (the block back-pointer) is kept while the
/// cell is allocated; the `next` link overlays the start of the user data.
#[repr(C)]
struct FreeCell {
    block: *mut BlockHeader,
    next: *mut FreeCell,
}

struct Inner {
    /// Head of the free-cell list, or null when every cell is handed out.
    free_list: *mut FreeCell,
    /// Base pointers of all live blocks.
    blocks: Vec<*mut u8>,
    /// The fixed cell size; zero until the first allocation publishes it.
    chunk_size: usize,
    /// Free cells across all blocks.
    total_free: usize,
}

/// Fixed-size object pool with block reclamation, serialized by a mutex.
pub struct ObjectPool {
    /// Cells allocated per heap block. Always at least 1.
    chunks_per_block: usize,
    inner: Mutex<Inner>,
}

// Safety: all raw pointers are owned by the pool and only touched under the
// inner mutex.
unsafe impl Send for ObjectPool {}
unsafe impl Sync for ObjectPool {}

impl ObjectPool {
    /// Create a pool that allocates `chunks_per_block` cells at a time,
    /// discovering the cell size on the first allocation.
    pub fn new(chunks_per_block: usize) -> Self {
        Self::with_chunk_size(chunks_per_block, 0)
    }

    /// Create a pool with a known cell size.
    ///
    /// `chunk_size` must be a multiple of the word size, at least one word;
    /// zero defers it to the first allocation.
    pub fn with_chunk_size(chunks_per_block: usize, chunk_size: usize) -> Self {
        assert!(chunks_per_block >= 1);
        Self {
            chunks_per_block,
            inner: Mutex::new(Inner {
                free_list: std::ptr::null_mut(),
                blocks: Vec::new(),
                chunk_size,
                total_free: 0,
            }),
        }
    }

    /// Hand out one cell of at least `size` bytes.
    ///
    /// The first allocation fixes the cell size; later allocations must not
    /// exceed it (allocate the largest size first when mixing types).
    /// Returns `None` when the system allocator is exhausted.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();

        if inner.free_list.is_null() {
            if inner.chunk_size == 0 {
                inner.chunk_size = size;
            }
            // A cell must hold the free link and stay word-aligned.
            debug_assert!(inner.chunk_size >= WORD && inner.chunk_size % WORD == 0);

            let layout = self.block_layout(inner.chunk_size)?;
            // SAFETY: layout has nonzero size.
            let base = NonNull::new(unsafe { alloc(layout) })?.as_ptr();
            trace!(bytes = layout.size(), "object pool pulled a fresh block");

            let stride = WORD + inner.chunk_size;
            // SAFETY: the block is fresh and sized for a header plus
            // chunks_per_block cells; chain every cell in address order.
            unsafe {
                let header = base as *mut BlockHeader;
                (*header).free = self.chunks_per_block;
                let mut next: *mut FreeCell = std::ptr::null_mut();
                for index in (0..self.chunks_per_block).rev() {
                    let cell = base.add(WORD + index * stride) as *mut FreeCell;
                    (*cell).block = header;
                    (*cell).next = next;
                    next = cell;
                }
                inner.free_list = next;
            }
            inner.blocks.push(base);
            inner.total_free += self.chunks_per_block;
        }

        // The size must fit. When using multiple sizes, allocate the
        // largest size first.
        debug_assert!(size <= inner.chunk_size);

        // SAFETY: free_list is non-null here and its cells are live.
        unsafe {
            let cell = inner.free_list;
            inner.free_list = (*cell).next;
            (*(*cell).block).free -= 1;
            inner.total_free -= 1;
            Some(NonNull::new_unchecked((cell as *mut u8).add(WORD)))
        }
    }

    /// Return a cell to the pool, reclaiming its block when the reclamation
    /// condition holds.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// pool and must not be in use.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let cell = ptr.as_ptr().sub(WORD) as *mut FreeCell;
        let mut inner = self.inner.lock();

        (*cell).next = inner.free_list;
        inner.free_list = cell;
        let header = (*cell).block;
        (*header).free += 1;
        inner.total_free += 1;
        debug_assert!((*header).free <= self.chunks_per_block);

        if (*header).free == self.chunks_per_block
            && inner.total_free >= 2 * self.chunks_per_block
        {
            self.reclaim_block(&mut inner, header);
        }
    }

    /// A snapshot of the pool's occupancy.
    pub fn stats(&self) -> ObjectPoolStats {
        let inner = self.inner.lock();
        let total_chunks = self.chunks_per_block * inner.blocks.len();
        let block_bytes = self
            .block_layout(inner.chunk_size)
            .map_or(0, |layout| layout.size());
        ObjectPoolStats {
            chunk_size: inner.chunk_size,
            blocks: inner.blocks.len(),
            allocated_bytes: inner.blocks.len() * block_bytes,
            total_chunks,
            used_chunks: total_chunks - inner.total_free,
            free_chunks: inner.total_free,
        }
    }

    fn block_layout(&self, chunk_size: usize) -> Option<Layout> {
        let bytes =
            std::mem::size_of::<BlockHeader>() + self.chunks_per_block * (WORD + chunk_size);
        Layout::from_size_align(bytes, WORD).ok()
    }

    /// Unlink every cell of `header`'s block from the free list and return
    /// the block to the system. Runs under the inner mutex.
    unsafe fn reclaim_block(&self, inner: &mut Inner, header: *mut BlockHeader) {
        let base = header as *mut u8;
        let layout = self
            .block_layout(inner.chunk_size)
            .expect("layout was valid at block allocation");
        let end = base.add(layout.size());

        let mut cursor: *mut *mut FreeCell = &mut inner.free_list;
        while !(*cursor).is_null() {
            let cell = *cursor as *mut u8;
            if base <= cell && cell < end {
                *cursor = (**cursor).next;
            } else {
                cursor = &mut (**cursor).next;
            }
        }

        inner.total_free -= self.chunks_per_block;
        inner.blocks.retain(|&block| block != base);
        trace!(bytes = layout.size(), "object pool reclaimed a block");
        dealloc(base, layout);
    }
}

impl Drop for ObjectPool {
    fn drop(&mut self) {
        let chunk_size = self.inner.get_mut().chunk_size;
        if chunk_size == 0 {
            return;
        }
        let layout = self
            .block_layout(chunk_size)
            .expect("layout was valid at block allocation");
        let inner = self.inner.get_mut();
        for base in inner.blocks.drain(..) {
            unsafe { dealloc(base, layout) };
        }
    }
}

/// Occupancy snapshot of an [`ObjectPool`].
#[derive(Debug, Clone, Default)]
pub struct ObjectPoolStats {
    /// The fixed cell size; zero while still undiscovered.
    pub chunk_size: usize,
    /// Number of live heap blocks.
    pub blocks: usize,
    /// Bytes currently obtained from the system.
    pub allocated_bytes: usize,
    /// Cells across all blocks.
    pub total_chunks: usize,
    /// Cells currently handed out.
    pub used_chunks: usize,
    /// Cells currently free.
    pub free_chunks: usize,
}

impl fmt::Display for ObjectPoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node size: {}; allocated size: {}; total/used/free: {}/{}/{}",
            self.chunk_size,
            self.allocated_bytes,
            self.total_chunks,
            self.used_chunks,
            self.free_chunks
        )
    }
}

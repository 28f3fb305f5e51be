//! The seam between single-size allocators and their chunk providers.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Page-granular source of fixed-size blocks.
///
/// Implemented by [`crate::page_pool::PagePool`] and
/// [`crate::mapped_pool::MappedPool`]; consumed by
/// [`crate::node_resource::NodeResource`], which partitions each block into
/// node-sized cells.
pub trait BlockProvider: Send + Sync {
    /// Hand out one block, or `None` when upstream is out of memory.
    fn allocate_block(&self) -> Option<NonNull<u8>>;

    /// The fixed size of every block this provider hands out.
    fn block_size(&self) -> usize;
}

/// The system memory page size.
pub fn memory_page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

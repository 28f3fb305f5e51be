//! Single-size allocator layered over a chunk provider.
//!
//! A [`NodeResource`] serves blocks of one fixed size, pulling whole
//! provider chunks on demand and partitioning them into its free list. The
//! size does not have to be known up front: the first allocation publishes
//! it, which is what lets one resource back containers whose node type is
//! only known at the first insert.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::provider::BlockProvider;
use crate::storage::SegregatedStorage;
use crate::tagged::FreeNode;

/// Fixed-size allocator over a shared [`BlockProvider`].
pub struct NodeResource {
    provider: OnceLock<Arc<dyn BlockProvider>>,
    /// Zero until the size is published by `init` or the first allocation.
    block_size: AtomicUsize,
    storage: SegregatedStorage,
}

impl NodeResource {
    /// Create an uninitialized resource. Call [`init`](Self::init) before
    /// use.
    pub fn new() -> Self {
        Self {
            provider: OnceLock::new(),
            block_size: AtomicUsize::new(0),
            storage: SegregatedStorage::new(),
        }
    }

    /// Create an initialized resource.
    ///
    /// A zero `block_size` defers the size to the first allocation.
    pub fn with_provider(provider: Arc<dyn BlockProvider>, block_size: usize) -> Self {
        let resource = Self::new();
        resource.init(provider, block_size);
        resource
    }

    /// Late initialization. May only be called once.
    ///
    /// A zero `block_size` defers the size to the first allocation.
    pub fn init(&self, provider: Arc<dyn BlockProvider>, block_size: usize) {
        let already_initialized = self.provider.set(provider).is_err();
        debug_assert!(
            !already_initialized,
            "a NodeResource may only be initialized once"
        );
        if block_size != 0 {
            debug!(block_size, "node resource block size set");
            self.block_size.store(block_size, Ordering::Relaxed);
        }
    }

    /// Hand out a block of at least the resource's stored size.
    ///
    /// If no size is stored yet, `size` becomes the stored size. No lock is
    /// needed for that publication: while the stored size is still zero all
    /// contending callers must be requesting the same size (if different
    /// sizes are used, the call with the largest size must have returned
    /// before any call with a smaller one starts). Afterwards `size` may be
    /// smaller than the stored size, never larger.
    ///
    /// Returns `None` when the provider is out of memory.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let mut stored_size = self.block_size.load(Ordering::Relaxed);
        if stored_size == 0 {
            debug_assert!(size >= std::mem::size_of::<FreeNode>());
            self.block_size.store(size, Ordering::Relaxed);
            debug!(block_size = size, "node resource block size discovered");
            stored_size = size;
        } else {
            debug_assert!(
                size <= stored_size,
                "allocation larger than the published block size"
            );
        }

        let provider = self
            .provider
            .get()
            .expect("NodeResource::init must be called before allocate");

        self.storage.allocate(|| match provider.allocate_block() {
            Some(chunk) => {
                // SAFETY: the chunk is a fresh provider block of
                // provider.block_size() writable bytes; we run under the
                // add-block mutex.
                unsafe {
                    self.storage
                        .add_block(chunk, provider.block_size(), stored_size)
                };
                true
            }
            None => false,
        })
    }

    /// Return a block to the resource.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// resource and must not be in use.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        self.storage.deallocate(ptr);
    }

    /// The published block size; zero while still undiscovered.
    pub fn block_size(&self) -> usize {
        self.block_size.load(Ordering::Relaxed)
    }
}

impl Default for NodeResource {
    fn default() -> Self {
        Self::new()
    }
}

//! # rumem
//!
//! Layered fixed-size memory pools for node-based containers.
//!
//! ## Features
//!
//! - **Lock-free free lists**: pop/push are CAS loops over a single tagged
//!   head word; a 2-bit tag defeats the ABA hazard
//! - **Page-granular providers**: a growable heap-backed pool and a
//!   memory-mapped pool with persistent, copy-on-write, and read-only modes
//! - **Size-class routing**: deque-shaped requests dispatch to one of twelve
//!   precomputed size classes, falling through to the system allocator
//! - **Lazy mappings**: a mapped pool's free list walks the untouched region
//!   by address, so opening a large file costs no initialization pass
//!
//! ## Architecture
//!
//! ```text
//! DequeResource ──> NodeResource ──> SegregatedStorage ──> PagePool ──> system
//!                                                     `──> MappedPool ──> file
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rumem::{DequeResource, NodeResource, PagePool};
//!
//! // Serve 32 kB chunks to every resource in the process.
//! let pool = Arc::new(PagePool::new(0x8000));
//! DequeResource::init(pool.clone());
//!
//! // A dedicated resource for one node size.
//! let resource = NodeResource::with_provider(pool, 0);
//! let node = resource.allocate(512).unwrap();
//! unsafe { resource.deallocate(node) };
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod deque_resource;
pub mod mapped_pool;
pub mod node_resource;
pub mod object_pool;
pub mod page_pool;
pub mod provider;
pub mod storage;
pub mod tagged;

// Re-exports for convenient access
pub use deque_resource::{class_size, size_to_index, DequeResource, NUM_SIZE_CLASSES, UPPER_SIZE};
pub use mapped_pool::{MapError, MapMode, MapOptions, MappedPool};
pub use node_resource::NodeResource;
pub use object_pool::{ObjectPool, ObjectPoolStats};
pub use page_pool::{PagePool, DEFAULT_MAX_CHUNK_FACTOR, DEFAULT_MIN_CHUNK_BYTES};
pub use provider::{memory_page_size, BlockProvider};
pub use storage::SegregatedStorage;
pub use tagged::{FreeNode, TaggedPtr};

/// Prelude module for convenient imports
pub mod prelude {
    pub use super::{
        BlockProvider, DequeResource, MapMode, MapOptions, MappedPool, NodeResource, ObjectPool,
        PagePool,
    };
}

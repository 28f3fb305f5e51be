//! Size-class router for deque-shaped allocations.
//!
//! `std::deque`-style containers allocate two kinds of objects: fixed-size
//! element buffers, and pointer maps whose sizes follow a well-known
//! geometric series (8, 18, 38, 78, 158, 318, ... pointers: double and add
//! two). A [`DequeResource`] routes such requests to one of twelve
//! [`NodeResource`]s whose sizes cover that series plus intermediate points,
//! each size `(10 * 2^(n/2) - 2)` words rounded to the table below. Requests
//! above the largest class fall through to the system allocator.
//!
//! There is one process-wide instance, bound to a shared [`PagePool`] by an
//! explicit [`DequeResource::init`] call at program start.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::node_resource::NodeResource;
use crate::page_pool::PagePool;
use crate::provider::BlockProvider;

const WORD: usize = std::mem::size_of::<usize>();

/// Number of size classes served by dedicated node resources.
pub const NUM_SIZE_CLASSES: usize = 12;

/// Size of each class in words: `(10 * 2^(n/2) - 2)` rounded to the series
/// interleaving the common deque map sizes with intermediate points.
const CLASS_WORDS: [usize; NUM_SIZE_CLASSES] = [8, 12, 18, 26, 38, 54, 78, 111, 158, 224, 318, 451];

/// The largest request size served from a size class; anything above goes to
/// the system allocator.
pub const UPPER_SIZE: usize = CLASS_WORDS[NUM_SIZE_CLASSES - 1] * WORD;

/// The allocation size of class `index`, in bytes.
#[inline]
pub fn class_size(index: usize) -> usize {
    CLASS_WORDS[index] * WORD
}

/// The smallest class index whose size covers `size` bytes.
///
/// Constant time: the class sizes are `(10 * 2^(n/2) - 2)` words, so the
/// index is recovered with one ceiling log2. Multiplying by 16 (a power of
/// two above the 10) before the log keeps the arithmetic integral, and
/// squaring the argument folds the doubling of the even/odd interleave into the
/// log itself.
#[inline]
pub fn size_to_index(size: usize) -> usize {
    debug_assert!(size <= UPPER_SIZE);
    // 8 <= words <= 451; sub-minimum requests share the smallest class.
    let words = size.div_ceil(WORD).clamp(8, 451);
    // 16 <= t <= 724, 256 <= t^2 <= 524176.
    let t = 16 * (words + 2) / 10;
    ceil_log2(t * t) - 8
}

#[inline]
fn ceil_log2(value: usize) -> usize {
    value.next_power_of_two().ilog2() as usize
}

/// Process-wide router from request sizes to per-class node resources.
pub struct DequeResource {
    resources: [NodeResource; NUM_SIZE_CLASSES],
}

static INSTANCE: OnceLock<DequeResource> = OnceLock::new();

impl DequeResource {
    /// Build a router over `pool` with every class resource bound to its
    /// preassigned size.
    ///
    /// Most callers want the process-wide instance instead; see
    /// [`init`](Self::init).
    pub fn new(pool: Arc<PagePool>) -> Self {
        let resources: [NodeResource; NUM_SIZE_CLASSES] = std::array::from_fn(|index| {
            let provider: Arc<dyn BlockProvider> = pool.clone();
            NodeResource::with_provider(provider, class_size(index))
        });
        Self { resources }
    }

    /// Initialize the process-wide instance over `pool`.
    ///
    /// Must be called once, before the first [`instance`](Self::instance)
    /// call, typically right after constructing the pool at the top of
    /// `main`. A second call is a programming error.
    pub fn init(pool: Arc<PagePool>) {
        debug!("initializing process-wide deque resource");
        let installed = INSTANCE.set(Self::new(pool)).is_ok();
        debug_assert!(installed, "DequeResource::init may only be called once");
    }

    /// The process-wide instance.
    ///
    /// # Panics
    ///
    /// Panics when called before [`init`](Self::init).
    pub fn instance() -> &'static DequeResource {
        INSTANCE
            .get()
            .expect("DequeResource::init must be called before use")
    }

    /// Hand out at least `size` bytes, or `None` when out of memory.
    ///
    /// Sizes up to [`UPPER_SIZE`] come from the matching class resource;
    /// larger ones from the system allocator.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size > UPPER_SIZE {
            return system_allocate(size);
        }
        self.resources[size_to_index(size)].allocate(size)
    }

    /// Return a block obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this router with the
    /// same `size`, and must not be in use.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        if size > UPPER_SIZE {
            system_deallocate(ptr, size);
            return;
        }
        self.resources[size_to_index(size)].deallocate(ptr);
    }

    /// The class resource serving `size`-byte requests. Test hook.
    #[cfg(test)]
    fn resource_for(&self, size: usize) -> &NodeResource {
        &self.resources[size_to_index(size)]
    }
}

#[cold]
fn system_allocate(size: usize) -> Option<NonNull<u8>> {
    let layout = Layout::from_size_align(size, WORD).ok()?;
    // SAFETY: layout has nonzero size.
    NonNull::new(unsafe { alloc(layout) })
}

#[cold]
unsafe fn system_deallocate(ptr: NonNull<u8>, size: usize) {
    dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(size, WORD));
}

//! Lock-free segregated storage.
//!
//! A segregated storage is an unordered LIFO free list of equally sized
//! blocks, threaded through the blocks themselves (see
//! [`crate::tagged::FreeNode`]). The list head is a single atomic word
//! holding a [`TaggedPtr`]; pop and push are CAS loops, and the only lock is
//! a mutex that serializes refill attempts when the list runs empty.
//!
//! The same head word also supports a memory-mapped region whose free links
//! have never been written: a null `next` inside the region is interpreted as
//! "the successor is the adjacent block", so a freshly zeroed mapping is a
//! full free list without an initialization pass.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::tagged::{FreeNode, TaggedPtr};

/// Lock-free LIFO free list keyed on a tagged head word.
#[derive(Debug)]
pub struct SegregatedStorage {
    /// Encodes a pointer to the first free block, or the sentinel when the
    /// list is empty, plus the 2-bit ABA tag.
    head: AtomicUsize,
    /// Serializes refill attempts and the empty-check that precedes them, so
    /// only one upstream chunk is pulled per observed empty state.
    add_block_mutex: Mutex<()>,
}

impl SegregatedStorage {
    /// Create an empty free list.
    pub const fn new() -> Self {
        Self {
            head: AtomicUsize::new(TaggedPtr::END_OF_LIST.raw()),
            add_block_mutex: Mutex::new(()),
        }
    }

    /// Adopt an existing free list whose first node is `head`.
    ///
    /// Only valid on an empty storage; used by the mapped pool to point the
    /// list at the base of a fresh mapping.
    pub fn initialize(&self, head: NonNull<u8>) {
        debug_assert!(
            TaggedPtr::from_raw(self.head.load(Ordering::Relaxed)).is_end(),
            "initialize called on a non-empty storage"
        );
        self.head.store(
            TaggedPtr::encode(head.as_ptr() as *mut FreeNode, 0).raw(),
            Ordering::Release,
        );
    }

    /// Pop one block from the free list.
    ///
    /// When the list is empty, `grow` is invoked under the add-block mutex;
    /// it should pull a chunk from upstream and [`add_block`](Self::add_block)
    /// it, returning `false` when upstream is out of memory. Returns `None`
    /// only when the list is empty and `grow` failed.
    pub fn allocate<F: FnMut() -> bool>(&self, mut grow: F) -> Option<NonNull<u8>> {
        loop {
            // The acquire pairs with the release in deallocate/add_block so
            // that the `next` value read inside head.next() is the one
            // written for this head value.
            let mut head = TaggedPtr::from_raw(self.head.load(Ordering::Acquire));
            while !head.is_end() {
                // SAFETY: head is not the sentinel, so it points at a block
                // that was on the free list when we loaded it. Blocks are
                // only returned to the system during terminal teardown, so
                // the read cannot fault; the tag detects a stale head.
                let new_head = unsafe { head.next() };
                // Acquire on failure as well: the retry re-reads `next`
                // through the freshly observed head.
                match self.head.compare_exchange_weak(
                    head.raw(),
                    new_head.raw(),
                    Ordering::Acquire,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return NonNull::new(head.ptr() as *mut u8),
                    Err(observed) => head = TaggedPtr::from_raw(observed),
                }
            }
            if !self.try_grow(&mut grow) {
                return None;
            }
        }
    }

    /// Pop one block, treating the list as a view over a mapped region.
    ///
    /// A node whose stored `next` is null is a block whose link was never
    /// written: its successor is the adjacent block at `+ block_size`, or the
    /// end of the list when that would step past `base + mapped_size`.
    /// Returns `None` when the region is exhausted; there is no grow path.
    pub fn allocate_from_region(
        &self,
        base: NonNull<u8>,
        mapped_size: usize,
        block_size: usize,
    ) -> Option<NonNull<u8>> {
        let mut head = TaggedPtr::from_raw(self.head.load(Ordering::Acquire));
        while !head.is_end() {
            // SAFETY: as in allocate; the mapping stays alive for the life
            // of the pool that owns this storage.
            let mut new_head = unsafe { head.next() };
            if new_head.ptr().is_null() {
                let front = head.ptr() as *mut u8;
                // SAFETY: front lies inside the mapping and block_size
                // divides its size, so the offset stays in (or one past) it.
                let second = unsafe { front.add(block_size) };
                new_head = if second as usize == base.as_ptr() as usize + mapped_size {
                    TaggedPtr::END_OF_LIST
                } else {
                    TaggedPtr::encode(second as *mut FreeNode, head.tag().wrapping_add(1))
                };
            }
            match self.head.compare_exchange_weak(
                head.raw(),
                new_head.raw(),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return NonNull::new(head.ptr() as *mut u8),
                Err(observed) => head = TaggedPtr::from_raw(observed),
            }
        }
        None
    }

    /// Push a block back onto the free list.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by an `allocate` variant of this same
    /// storage and must not be in use.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let node = ptr.as_ptr() as *mut FreeNode;
        let mut head = TaggedPtr::from_raw(self.head.load(Ordering::Relaxed));
        loop {
            let new_head = TaggedPtr::encode(node, head.tag());
            // The release on success makes this `next` store visible to the
            // popper that acquires the new head.
            (*node).next = head.ptr();
            match self.head.compare_exchange_weak(
                head.raw(),
                new_head.raw(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => head = TaggedPtr::from_raw(observed),
            }
        }
    }

    /// Partition a fresh chunk into `block_size / partition_size` cells and
    /// splice them onto the free list in one CAS.
    ///
    /// Must be called with the add-block mutex held, i.e. from within the
    /// `grow` callback passed to [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `block` must reference `block_size` writable bytes owned by the
    /// caller's provider and not yet on any free list, and `partition_size`
    /// must be at least one word.
    pub unsafe fn add_block(&self, block: NonNull<u8>, block_size: usize, partition_size: usize) {
        let count = block_size / partition_size;
        // block_size must be a multiple of partition_size, at least 2 times.
        debug_assert!(count > 1);

        let first = block.as_ptr();
        let last = first.add((count - 1) * partition_size);
        let mut node = last;
        while node != first {
            let next = node;
            node = next.sub(partition_size);
            (*(node as *mut FreeNode)).next = next as *mut FreeNode;
        }

        let first_node = first as *mut FreeNode;
        let last_node = last as *mut FreeNode;
        let mut head = TaggedPtr::from_raw(self.head.load(Ordering::Relaxed));
        loop {
            (*last_node).next = head.ptr();
            let new_head = TaggedPtr::encode(first_node, head.tag());
            match self.head.compare_exchange_weak(
                head.raw(),
                new_head.raw(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => head = TaggedPtr::from_raw(observed),
            }
        }
    }

    /// Lock the add-block mutex, blocking concurrent refills.
    ///
    /// Providers take this around teardown so no chunk is pulled while the
    /// chunk list is being reclaimed.
    pub(crate) fn lock_add_block(&self) -> MutexGuard<'_, ()> {
        self.add_block_mutex.lock()
    }

    /// Reset the list to empty.
    ///
    /// Only used by a provider's terminal teardown, with the add-block mutex
    /// held; every block previously on the list is invalidated.
    pub(crate) fn reset(&self) {
        self.head
            .store(TaggedPtr::END_OF_LIST.raw(), Ordering::Release);
    }

    /// Whether the free list is currently empty.
    pub fn is_empty(&self) -> bool {
        TaggedPtr::from_raw(self.head.load(Ordering::Relaxed)).is_end()
    }

    fn try_grow<F: FnMut() -> bool>(&self, grow: &mut F) -> bool {
        let _guard = self.add_block_mutex.lock();
        // Another thread may have refilled while we waited for the mutex.
        !TaggedPtr::from_raw(self.head.load(Ordering::Relaxed)).is_end() || grow()
    }
}

impl Default for SegregatedStorage {
    fn default() -> Self {
        Self::new()
    }
}

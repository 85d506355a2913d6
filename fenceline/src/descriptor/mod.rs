// Copyright (c) 2024 The fenceline contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Descriptor-handle allocation with deferred reclamation.
//!
//! Descriptors are fixed-size GPU-visible handles describing how to interpret a memory resource
//! when referenced by a command. They are allocated as contiguous ranges out of fixed-capacity
//! heap pages; a [`DescriptorAllocator`] routes requests across a growable set of pages for one
//! heap category and creates pages lazily on first demand.
//!
//! Allocation never blocks and never waits on a fence: it either succeeds from existing
//! capacity or grows the pool. All fence discipline lives on the release path instead.
//! Dropping a [`DescriptorAllocation`] stages its range in the owning page's stale queue,
//! stamped with the current frame token; the range returns to the free list only once
//! [`release_stale_descriptors`](DescriptorAllocator::release_stale_descriptors) is called with
//! a completed token at least that large.

use self::page::{DescriptorPage, SlotId};
use crate::{
    device::{Device, DeviceOwned, HeapHandle},
    sync::FrameToken,
    NonExhaustive, OomError,
};
use foldhash::{HashSet, HashSetExt};
use parking_lot::Mutex;
use std::sync::Arc;

mod page;

/// A GPU-visible pointer to a descriptor slot.
pub type DescriptorPtr = u64;

/// The categories of descriptor heaps, allocated from separate pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Shader-visible resource views (textures, buffers).
    Resource,
    /// Sampler states.
    Sampler,
    /// Render-target views.
    RenderTarget,
    /// Depth-stencil views.
    DepthStencil,
}

impl HeapKind {
    /// All heap kinds, in a stable order.
    pub const ALL: [HeapKind; 4] = [
        HeapKind::Resource,
        HeapKind::Sampler,
        HeapKind::RenderTarget,
        HeapKind::DepthStencil,
    ];
}

/// Parameters to create a new [`DescriptorAllocator`].
#[derive(Clone, Debug)]
pub struct DescriptorAllocatorCreateInfo {
    /// Number of descriptor slots per page. Requests larger than this get a dedicated page
    /// sized to fit.
    ///
    /// The default value is `256`.
    pub page_capacity: u32,

    pub _ne: NonExhaustive,
}

impl Default for DescriptorAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        DescriptorAllocatorCreateInfo {
            page_capacity: 256,
            _ne: NonExhaustive(()),
        }
    }
}

/// Allocates descriptor ranges for one heap category from a growable set of pages.
///
/// Supports concurrent `allocate` and release from different threads. Pages never move and are
/// only destroyed when the allocator is dropped, which must happen after the queue consuming
/// the descriptors has been drained.
#[derive(Debug)]
pub struct DescriptorAllocator {
    device: Arc<Device>,
    kind: HeapKind,
    page_capacity: u32,
    state: Mutex<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    // Every page ever created, in creation order. Grow-only: indices stay valid for the
    // allocator's lifetime.
    pages: Vec<Arc<DescriptorPage>>,
    // Indices of pages believed to have free handles.
    available: HashSet<usize>,
}

impl DescriptorAllocator {
    /// Creates a new `DescriptorAllocator` for the given heap category.
    ///
    /// No page is created until the first allocation.
    pub fn new(
        device: Arc<Device>,
        kind: HeapKind,
        create_info: DescriptorAllocatorCreateInfo,
    ) -> DescriptorAllocator {
        let DescriptorAllocatorCreateInfo {
            page_capacity,
            _ne: _,
        } = create_info;

        assert!(page_capacity != 0);

        DescriptorAllocator {
            device,
            kind,
            page_capacity,
            state: Mutex::new(AllocatorState {
                pages: Vec::new(),
                available: HashSet::new(),
            }),
        }
    }

    /// Returns the heap category this allocator serves.
    #[inline]
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    /// Allocates a contiguous range of `count` descriptors.
    ///
    /// Never blocks on a fence: either an existing page satisfies the request or a new page of
    /// at least `max(page_capacity, count)` slots is created.
    ///
    /// # Panics
    ///
    /// - Panics if `count` is zero.
    pub fn allocate(&self, count: u32) -> Result<DescriptorAllocation, OomError> {
        assert!(count != 0, "zero-size descriptor allocation");

        let mut state = self.state.lock();
        let AllocatorState { pages, available } = &mut *state;

        let mut found = None;
        for &index in available.iter() {
            if let Some(allocation) = pages[index].allocate(count) {
                found = Some((index, allocation));
                break;
            }
        }
        if let Some((index, allocation)) = found {
            if pages[index].free_handles() == 0 {
                available.remove(&index);
            }
            return Ok(allocation);
        }

        // No page has room; grow the pool.
        let capacity = self.page_capacity.max(count);
        tracing::debug!(kind = ?self.kind, capacity, "creating descriptor heap page");
        let page = DescriptorPage::new(self.device.clone(), self.kind, capacity)?;
        let allocation = page
            .allocate(count)
            .expect("a new page satisfies the request it was sized for");

        let index = pages.len();
        if page.free_handles() > 0 {
            available.insert(index);
        }
        pages.push(page);

        Ok(allocation)
    }

    /// Returns every descriptor range freed under a frame token at most `completed` to its
    /// page's free list, and re-admits pages that regained space.
    ///
    /// Called once per completed frame; calling again with the same token is a no-op.
    pub fn release_stale_descriptors(&self, completed: FrameToken) {
        let mut state = self.state.lock();
        let AllocatorState { pages, available } = &mut *state;

        for (index, page) in pages.iter().enumerate() {
            if page.reclaim_stale(completed) > 0 {
                available.insert(index);
            }
        }
    }

    /// Returns the number of pages created so far.
    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Returns the total number of free handles across all pages. Stale handles don't count
    /// until reclaimed.
    pub fn free_handles(&self) -> u64 {
        self.state
            .lock()
            .pages
            .iter()
            .map(|page| u64::from(page.free_handles()))
            .sum()
    }
}

unsafe impl DeviceOwned for DescriptorAllocator {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

/// An owning handle to a contiguous range of descriptors.
///
/// Moves but does not copy. Dropping it does not free the range immediately: the range is
/// staged in its page's stale queue under the current frame token and becomes allocatable
/// again only once that frame is confirmed complete.
#[derive(Debug)]
pub struct DescriptorAllocation {
    page: Arc<DescriptorPage>,
    node: SlotId,
    offset: u32,
    count: u32,
}

impl DescriptorAllocation {
    fn new(page: Arc<DescriptorPage>, node: SlotId, offset: u32, count: u32) -> Self {
        DescriptorAllocation {
            page,
            node,
            offset,
            count,
        }
    }

    /// Returns the GPU-visible pointer to the first descriptor of the range.
    #[inline]
    pub fn ptr(&self) -> DescriptorPtr {
        self.page.descriptor_ptr(self.offset)
    }

    /// Returns the GPU-visible pointer to the descriptor at `index` within the range.
    ///
    /// # Panics
    ///
    /// - Panics if `index` is out of range.
    #[inline]
    pub fn get(&self, index: u32) -> DescriptorPtr {
        assert!(index < self.count, "descriptor index out of range");
        self.page.descriptor_ptr(self.offset + index)
    }

    /// Returns the offset of the range within its page.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Returns the number of descriptors in the range.
    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns the backend heap the range lives in, for binding calls.
    #[inline]
    pub fn heap(&self) -> HeapHandle {
        self.page.heap().handle
    }

    /// Returns the heap category of the range.
    #[inline]
    pub fn kind(&self) -> HeapKind {
        self.page.kind()
    }
}

impl Drop for DescriptorAllocation {
    fn drop(&mut self) {
        let frame = self.page.device().frame_clock().current();
        self.page.free(self.node, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn page_allocator(device: Arc<Device>, page_capacity: u32) -> DescriptorAllocator {
        DescriptorAllocator::new(
            device,
            HeapKind::Resource,
            DescriptorAllocatorCreateInfo {
                page_capacity,
                ..Default::default()
            },
        )
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_block() {
        let (device, _backend) = test_device!();

        // Carve the page into free blocks of sizes {4, 10, 6} kept apart by live
        // single-slot separators.
        let allocator = page_allocator(device.clone(), 23);
        let a = allocator.allocate(4).unwrap();
        let _sep_a = allocator.allocate(1).unwrap();
        let b = allocator.allocate(10).unwrap();
        let _sep_b = allocator.allocate(1).unwrap();
        let c = allocator.allocate(6).unwrap();
        let _sep_c = allocator.allocate(1).unwrap();

        let c_offset = c.offset();
        drop(a);
        drop(b);
        drop(c);
        allocator.release_stale_descriptors(device.frame_clock().current());

        // The request for 5 must come from the size-6 block, leaving a free block of 1.
        let fitted = allocator.allocate(5).unwrap();
        assert_eq!(fitted.offset(), c_offset);
        assert_eq!(allocator.free_handles(), 4 + 10 + 1);
        assert_eq!(allocator.page_count(), 1);
    }

    #[test]
    fn freed_neighbors_merge_once_reclaimed() {
        let (device, _backend) = test_device!();

        // Page capacity 16: A and B fill the first 8 slots, an 8-wide remainder stays free.
        let allocator = page_allocator(device.clone(), 16);
        let a = allocator.allocate(4).unwrap();
        let b = allocator.allocate(4).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 4);

        device.frame_clock().advance();
        drop(a);
        drop(b);

        // Before reclamation the only free block is the untouched remainder.
        let c = allocator.allocate(8).unwrap();
        assert_eq!(c.offset(), 8);
        assert_eq!(allocator.free_handles(), 0);

        // After reclamation A and B have merged into one 8-wide block.
        allocator.release_stale_descriptors(device.frame_clock().current());
        let d = allocator.allocate(8).unwrap();
        assert_eq!(d.offset(), 0);
        assert_eq!(allocator.page_count(), 1);
    }

    #[test]
    fn no_reuse_before_the_releasing_frame_completes() {
        let (device, _backend) = test_device!();

        let allocator = page_allocator(device.clone(), 8);
        let allocation = allocator.allocate(8).unwrap();

        // Release under frame 5.
        while device.frame_clock().current() < 5 {
            device.frame_clock().advance();
        }
        drop(allocation);

        allocator.release_stale_descriptors(4);
        assert_eq!(allocator.free_handles(), 0);

        allocator.release_stale_descriptors(5);
        assert_eq!(allocator.free_handles(), 8);
    }

    #[test]
    fn reclaim_is_idempotent() {
        let (device, _backend) = test_device!();

        let allocator = page_allocator(device.clone(), 8);
        let allocation = allocator.allocate(4).unwrap();
        device.frame_clock().advance();
        drop(allocation);

        allocator.release_stale_descriptors(1);
        let free = allocator.free_handles();
        allocator.release_stale_descriptors(1);
        assert_eq!(allocator.free_handles(), free);
    }

    #[test]
    fn pool_grows_instead_of_waiting() {
        let (device, _backend) = test_device!();

        let allocator = page_allocator(device.clone(), 4);
        let a = allocator.allocate(4).unwrap();

        // The only page is full and nothing has been reclaimed; allocation must still
        // succeed immediately from a new page.
        let b = allocator.allocate(4).unwrap();
        assert_eq!(allocator.page_count(), 2);

        drop(a);
        drop(b);
        allocator.release_stale_descriptors(device.frame_clock().current());
        assert_eq!(allocator.free_handles(), 8);

        // With space reclaimed, no further page is created.
        let _c = allocator.allocate(4).unwrap();
        assert_eq!(allocator.page_count(), 2);
    }

    #[test]
    fn oversized_request_gets_a_dedicated_page() {
        let (device, _backend) = test_device!();

        let allocator = page_allocator(device, 4);
        let big = allocator.allocate(100).unwrap();
        assert_eq!(big.count(), 100);
        assert_eq!(allocator.page_count(), 1);
    }

    #[test]
    #[should_panic(expected = "zero-size descriptor allocation")]
    fn zero_size_allocation_is_rejected() {
        let (device, _backend) = test_device!();

        let allocator = page_allocator(device, 4);
        let _ = allocator.allocate(0);
    }

    #[test]
    fn descriptor_pointers_follow_the_heap_increment() {
        let (device, _backend) = test_device!();

        let allocator = page_allocator(device, 16);
        let allocation = allocator.allocate(4).unwrap();

        let base = allocation.ptr();
        let increment = allocation.get(1) - allocation.get(0);
        assert!(increment != 0);
        assert_eq!(allocation.get(3), base + 3 * increment);
    }

    #[test]
    #[should_panic(expected = "descriptor index out of range")]
    fn out_of_range_descriptor_index_is_rejected() {
        let (device, _backend) = test_device!();

        let allocator = page_allocator(device, 16);
        let allocation = allocator.allocate(4).unwrap();
        let _ = allocation.get(4);
    }

    #[test]
    fn heaps_are_destroyed_with_the_allocator() {
        let (device, backend) = test_device!();

        {
            let allocator = page_allocator(device, 4);
            let _a = allocator.allocate(4).unwrap();
            let _b = allocator.allocate(4).unwrap();
            assert_eq!(backend.live_heaps(), 2);
        }

        assert_eq!(backend.live_heaps(), 0);
    }

    #[test]
    fn concurrent_allocations_stay_sound() {
        let (device, _backend) = test_device!();

        let allocator = page_allocator(device.clone(), 64);

        // Using threads to randomize allocation order.
        thread::scope(|scope| {
            for size in 1..=8u32 {
                let allocator = &allocator;
                scope.spawn(move || {
                    for _ in 0..32 {
                        let allocation = allocator.allocate(size).unwrap();
                        assert!(allocation.count() == size);
                        drop(allocation);
                    }
                });
            }
        });

        device.frame_clock().advance();
        allocator.release_stale_descriptors(device.frame_clock().current());

        // Everything was released, so the sum of free handles equals the created capacity.
        let total: u64 = allocator.free_handles();
        assert_eq!(total, allocator.page_count() as u64 * 64);
    }
}

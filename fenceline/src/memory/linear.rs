// Copyright (c) 2024 The fenceline contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{align_up, MemoryClass};
use crate::{
    device::{Device, DeviceOwned, PageHandle},
    sync::{Fence, FenceValue},
    DeviceSize, NonExhaustive, OomError,
};
use bytemuck::Pod;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{collections::VecDeque, ptr, ptr::NonNull, sync::Arc};

/// One device allocation of page-pool size, with its persistent mapping.
#[derive(Debug)]
pub(crate) struct Page {
    handle: PageHandle,
    size: DeviceSize,
    mapped: Option<NonNull<u8>>,
    gpu_address: u64,
}

// The mapped pointer is only dereferenced through `DynAlloc`s, whose ranges within a page never
// overlap while the page is live in one allocator.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

/// Parameters to create a new [`PagePool`].
#[derive(Clone, Debug)]
pub struct PagePoolCreateInfo {
    /// Size in bytes of the pages the pool hands out. `0` means the default size of the pool's
    /// [`MemoryClass`].
    ///
    /// The default value is `0`.
    pub page_size: DeviceSize,

    pub _ne: NonExhaustive,
}

impl Default for PagePoolCreateInfo {
    #[inline]
    fn default() -> Self {
        PagePoolCreateInfo {
            page_size: 0,
            _ne: NonExhaustive(()),
        }
    }
}

/// The shared page manager behind one memory class's [`LinearAllocator`]s.
///
/// Owns every page it ever committed. Retired pages return to circulation, and one-off large
/// pages are destroyed, only once the fence value they were discarded under is reached; both
/// sweeps happen lazily on the next [`request_page`](Self::request_page).
#[derive(Debug)]
pub struct PagePool {
    device: Arc<Device>,
    class: MemoryClass,
    fence: Arc<Fence>,
    page_size: DeviceSize,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    // Pages ready for reuse.
    available: Vec<Page>,
    // Pages awaiting their fence before reuse, in fence order.
    retired: VecDeque<(FenceValue, Page)>,
    // One-off large pages awaiting their fence before destruction, in fence order.
    deletion: VecDeque<(FenceValue, Page)>,
    // Pages currently committed, large pages included.
    committed: usize,
}

impl PagePool {
    /// Creates a new `PagePool` for the given memory class.
    ///
    /// `fence` is the fence of the queue the pool's allocations are consumed by; retired pages
    /// come back into circulation once it reaches the value they were discarded under. No
    /// memory is committed until the first page request.
    pub fn new(
        device: Arc<Device>,
        class: MemoryClass,
        fence: Arc<Fence>,
        create_info: PagePoolCreateInfo,
    ) -> Arc<PagePool> {
        let PagePoolCreateInfo { page_size, _ne: _ } = create_info;

        let page_size = if page_size == 0 {
            class.default_page_size()
        } else {
            page_size
        };

        Arc::new(PagePool {
            device,
            class,
            fence,
            page_size,
            state: Mutex::new(PoolState {
                available: Vec::new(),
                retired: VecDeque::new(),
                deletion: VecDeque::new(),
                committed: 0,
            }),
        })
    }

    /// Returns the memory class the pool serves.
    #[inline]
    pub fn class(&self) -> MemoryClass {
        self.class
    }

    /// Returns the size of the pages the pool hands out.
    #[inline]
    pub fn page_size(&self) -> DeviceSize {
        self.page_size
    }

    /// Returns a page ready for bump allocation, reusing a reclaimed page when possible and
    /// committing fresh device memory otherwise.
    pub(crate) fn request_page(&self) -> Result<Page, OomError> {
        {
            let mut state = self.state.lock();
            self.sweep(&mut state);
            if let Some(page) = state.available.pop() {
                return Ok(page);
            }
        }

        self.commit_page(self.page_size)
    }

    /// Commits a fresh page of the given size.
    pub(crate) fn commit_page(&self, size: DeviceSize) -> Result<Page, OomError> {
        let info = self.device.backend().create_page(self.class, size)?;
        tracing::debug!(class = ?self.class, size, "committed memory page");
        self.state.lock().committed += 1;

        Ok(Page {
            handle: info.handle,
            size: info.size,
            mapped: info.mapped,
            gpu_address: info.gpu_address,
        })
    }

    /// Accepts pages whose contents the device may still be reading; they re-enter circulation
    /// once `fence_value` is reached.
    pub(crate) fn discard_pages(
        &self,
        fence_value: FenceValue,
        pages: impl IntoIterator<Item = Page>,
    ) {
        let mut state = self.state.lock();
        state
            .retired
            .extend(pages.into_iter().map(|page| (fence_value, page)));
    }

    /// Accepts one-off large pages for destruction. CPU access is revoked immediately; the
    /// device memory is released by a later sweep, once `fence_value` is reached.
    pub(crate) fn free_large_pages(
        &self,
        fence_value: FenceValue,
        pages: impl IntoIterator<Item = Page>,
    ) {
        let backend = self.device.backend();
        let mut state = self.state.lock();

        for page in pages {
            if page.mapped.is_some() {
                backend.unmap_page(page.handle);
            }
            state.deletion.push_back((fence_value, Page { mapped: None, ..page }));
        }
    }

    /// Moves reclaimable retired pages to the available list and destroys reclaimable large
    /// pages. Entries are fence-ordered, so each queue is drained from the front until the
    /// first value still in flight.
    fn sweep(&self, state: &mut PoolState) {
        while let Some((value, _)) = state.retired.front() {
            if !self.fence.is_reached(*value) {
                break;
            }
            if let Some((_, page)) = state.retired.pop_front() {
                state.available.push(page);
            }
        }

        while let Some((value, _)) = state.deletion.front() {
            if !self.fence.is_reached(*value) {
                break;
            }
            if let Some((_, page)) = state.deletion.pop_front() {
                self.device.backend().destroy_page(page.handle);
                state.committed -= 1;
            }
        }
    }

    /// Returns the number of pages currently committed, large pages included.
    pub fn committed_pages(&self) -> usize {
        self.state.lock().committed
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let backend = self.device.backend();
        let state = self.state.get_mut();

        for page in state.available.drain(..) {
            backend.destroy_page(page.handle);
        }
        for (_, page) in state.retired.drain(..) {
            backend.destroy_page(page.handle);
        }
        for (_, page) in state.deletion.drain(..) {
            backend.destroy_page(page.handle);
        }
    }
}

unsafe impl DeviceOwned for PagePool {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

/// Bump-allocates transient memory for one recording thread's batch of work.
///
/// Allocation only ever advances a cursor within the current page; when the page runs out it is
/// set aside and a fresh one is requested from the pool. Once the batch is submitted, call
/// [`cleanup_used_pages`](Self::cleanup_used_pages) with the submission's fence value to hand
/// every used page back for fence-gated recycling.
///
/// The allocator itself is single-owner; create one per recording thread. The [`PagePool`]
/// behind it is shared and internally synchronized.
#[derive(Debug)]
pub struct LinearAllocator {
    pool: Arc<PagePool>,
    current: Option<Page>,
    cursor: DeviceSize,
    // Pages filled up by this batch, awaiting discard.
    retired: SmallVec<[Page; 4]>,
    // One-off oversized pages created by this batch.
    large: SmallVec<[Page; 1]>,
}

impl LinearAllocator {
    /// Creates a new `LinearAllocator` drawing pages from `pool`.
    pub fn new(pool: Arc<PagePool>) -> LinearAllocator {
        LinearAllocator {
            pool,
            current: None,
            cursor: 0,
            retired: SmallVec::new(),
            large: SmallVec::new(),
        }
    }

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// Requests larger than the pool's page size get a dedicated page that is destroyed, not
    /// recycled, once its fence is reached.
    ///
    /// # Panics
    ///
    /// - Panics if `size` is zero.
    /// - Panics if `alignment` is not a power of two.
    pub fn allocate(&mut self, size: DeviceSize, alignment: DeviceSize) -> Result<DynAlloc, OomError> {
        assert!(size != 0, "zero-size linear allocation");
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");

        let aligned_size = align_up(size, alignment);
        if aligned_size > self.pool.page_size() {
            return self.allocate_large(aligned_size);
        }

        let mut offset = align_up(self.cursor, alignment);
        let page = match self.current.take() {
            Some(page) if offset + aligned_size <= page.size => self.current.insert(page),
            exhausted => {
                if let Some(page) = exhausted {
                    self.retired.push(page);
                }
                offset = 0;
                self.cursor = 0;
                self.current.insert(self.pool.request_page()?)
            }
        };

        self.cursor = offset + aligned_size;

        Ok(DynAlloc::new(page, offset, aligned_size))
    }

    fn allocate_large(&mut self, size: DeviceSize) -> Result<DynAlloc, OomError> {
        let page = self.pool.commit_page(size)?;
        let alloc = DynAlloc::new(&page, 0, size);
        self.large.push(page);

        Ok(alloc)
    }

    /// Hands every page used since the last cleanup back to the pool, keyed by the fence value
    /// of the submission that consumed them. Call once per submitted batch.
    ///
    /// A current page whose cursor never moved is kept for the next batch.
    pub fn cleanup_used_pages(&mut self, fence_value: FenceValue) {
        if self.cursor > 0 {
            if let Some(page) = self.current.take() {
                self.retired.push(page);
            }
            self.cursor = 0;
        }

        self.pool.discard_pages(fence_value, self.retired.drain(..));
        self.pool.free_large_pages(fence_value, self.large.drain(..));
    }
}

impl Drop for LinearAllocator {
    fn drop(&mut self) {
        // An abandoned batch was never submitted; value 0 predates every submission, so its
        // pages recycle on the next sweep.
        if let Some(page) = self.current.take() {
            self.retired.push(page);
        }
        self.pool.discard_pages(0, self.retired.drain(..));
        self.pool.free_large_pages(0, self.large.drain(..));
    }
}

/// A sub-range of a page handed out by a [`LinearAllocator`].
///
/// Plain data: holds a non-owning reference to its backing page. It must not be written through
/// after the batch it was allocated for has been handed to
/// [`cleanup_used_pages`](LinearAllocator::cleanup_used_pages).
#[derive(Debug)]
pub struct DynAlloc {
    page: PageHandle,
    offset: DeviceSize,
    size: DeviceSize,
    mapped: Option<NonNull<u8>>,
    gpu_address: u64,
}

// See the note on `Page`; ranges handed out from one page never overlap.
unsafe impl Send for DynAlloc {}
unsafe impl Sync for DynAlloc {}

impl DynAlloc {
    fn new(page: &Page, offset: DeviceSize, size: DeviceSize) -> DynAlloc {
        DynAlloc {
            page: page.handle,
            offset,
            size,
            mapped: page.mapped.map(|mapped| {
                // SAFETY: the pool never hands out ranges past the end of a page's mapping.
                unsafe { NonNull::new_unchecked(mapped.as_ptr().add(offset as usize)) }
            }),
            gpu_address: page.gpu_address + offset,
        }
    }

    /// Returns the backing page of the allocation.
    #[inline]
    pub fn page(&self) -> PageHandle {
        self.page
    }

    /// Returns the offset of the allocation within its page.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// Returns the size of the allocation, rounded up to the requested alignment.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the address of the allocation in the device's address space.
    #[inline]
    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// Returns the mapped pointer to the start of the allocation if its memory class is
    /// host-writable, otherwise returns [`None`].
    #[inline]
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    /// Writes `data` at the start of the allocation.
    ///
    /// # Panics
    ///
    /// - Panics if the allocation is not host-writable.
    /// - Panics if `data` does not fit the allocation.
    pub fn write<T: Pod>(&mut self, data: &T) {
        self.write_bytes(bytemuck::bytes_of(data));
    }

    /// Writes all elements of `data` at the start of the allocation.
    ///
    /// # Panics
    ///
    /// - Panics if the allocation is not host-writable.
    /// - Panics if `data` does not fit the allocation.
    pub fn write_slice<T: Pod>(&mut self, data: &[T]) {
        self.write_bytes(bytemuck::cast_slice(data));
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() as DeviceSize <= self.size,
            "write exceeds the allocation"
        );
        let Some(mapped) = self.mapped else {
            panic!("allocation is not host-writable");
        };

        // SAFETY: `mapped` is valid for `self.size` bytes, and no other `DynAlloc` covers them.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.as_ptr(), bytes.len()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(device: &Arc<Device>, page_size: DeviceSize) -> (Arc<PagePool>, Arc<Fence>) {
        let fence = Arc::new(Fence::new(device.clone()).unwrap());
        let pool = PagePool::new(
            device.clone(),
            MemoryClass::HostWritable,
            fence.clone(),
            PagePoolCreateInfo {
                page_size,
                ..Default::default()
            },
        );

        (pool, fence)
    }

    #[test]
    fn bump_respects_alignment() {
        let (device, _backend) = test_device!();

        let (pool, _fence) = test_pool(&device, 1024);
        let mut allocator = LinearAllocator::new(pool);

        let a = allocator.allocate(13, 16).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(a.size(), 16);

        let b = allocator.allocate(1, 64).unwrap();
        assert_eq!(b.offset(), 64);
        assert_eq!(b.gpu_address() - a.gpu_address(), 64);
    }

    #[test]
    fn writes_land_in_page_memory() {
        let (device, backend) = test_device!();

        let (pool, _fence) = test_pool(&device, 1024);
        let mut allocator = LinearAllocator::new(pool);

        let mut a = allocator.allocate(16, 4).unwrap();
        a.write_slice(&[1u32, 2, 3, 4]);

        let bytes = backend.page_bytes(a.page());
        assert_eq!(
            &bytes[a.offset() as usize..a.offset() as usize + 16],
            bytemuck::cast_slice(&[1u32, 2, 3, 4]),
        );
    }

    #[test]
    fn full_page_is_retired_and_recycled_after_its_fence() {
        let (device, backend) = test_device!(manual);

        let (pool, fence) = test_pool(&device, 256);
        {
            let mut allocator = LinearAllocator::new(pool.clone());

            let _a = allocator.allocate(200, 1).unwrap();
            let _b = allocator.allocate(100, 1).unwrap();
            assert_eq!(pool.committed_pages(), 2);

            allocator.cleanup_used_pages(1);
        }

        // The fence hasn't reached 1: both pages are still retired, so a new batch commits a
        // third page rather than reusing one prematurely.
        let mut allocator = LinearAllocator::new(pool.clone());
        let _c = allocator.allocate(64, 1).unwrap();
        assert_eq!(pool.committed_pages(), 3);

        // Once value 1 is reached the retired pages come back into circulation.
        backend.signal_fence(fence.handle(), 1);
        let _d = allocator.allocate(256, 1).unwrap();
        let _e = allocator.allocate(256, 1).unwrap();
        assert_eq!(pool.committed_pages(), 3);
    }

    #[test]
    fn oversized_request_gets_a_one_off_page() {
        let (device, backend) = test_device!(manual);

        let (pool, fence) = test_pool(&device, 256);
        let mut allocator = LinearAllocator::new(pool.clone());

        let big = allocator.allocate(1000, 256).unwrap();
        assert_eq!(big.offset(), 0);
        assert!(big.size() >= 1000);
        assert_eq!(pool.committed_pages(), 1);

        allocator.cleanup_used_pages(1);

        // Unmapped immediately, destroyed only by a sweep after the fence is reached.
        assert_eq!(backend.live_pages(), 1);
        backend.signal_fence(fence.handle(), 1);
        let _small = allocator.allocate(64, 1).unwrap();
        assert_eq!(backend.live_pages(), 1);
        assert_eq!(pool.committed_pages(), 1);
    }

    #[test]
    fn unused_current_page_survives_cleanup() {
        let (device, _backend) = test_device!();

        let (pool, _fence) = test_pool(&device, 256);
        let mut allocator = LinearAllocator::new(pool.clone());

        // Nothing allocated: cleanup discards nothing and commits nothing.
        allocator.cleanup_used_pages(1);
        assert_eq!(pool.committed_pages(), 0);

        let _a = allocator.allocate(64, 1).unwrap();
        allocator.cleanup_used_pages(2);
        assert_eq!(pool.committed_pages(), 1);
    }

    #[test]
    fn dropping_an_allocator_returns_its_pages() {
        let (device, _backend) = test_device!();

        let (pool, _fence) = test_pool(&device, 256);
        {
            let mut allocator = LinearAllocator::new(pool.clone());
            let _a = allocator.allocate(64, 1).unwrap();
        }
        assert_eq!(pool.committed_pages(), 1);

        // The abandoned page is available again without committing more memory.
        let mut allocator = LinearAllocator::new(pool.clone());
        let _b = allocator.allocate(64, 1).unwrap();
        assert_eq!(pool.committed_pages(), 1);
    }

    #[test]
    fn pool_teardown_destroys_pages() {
        let (device, backend) = test_device!();

        {
            let (pool, _fence) = test_pool(&device, 256);
            let mut allocator = LinearAllocator::new(pool.clone());
            let _a = allocator.allocate(64, 1).unwrap();
            let _big = allocator.allocate(1000, 1).unwrap();
            allocator.cleanup_used_pages(1);
            drop(allocator);
            assert_eq!(backend.live_pages(), 2);
        }

        assert_eq!(backend.live_pages(), 0);
    }

    #[test]
    #[should_panic(expected = "zero-size linear allocation")]
    fn zero_size_allocation_is_rejected() {
        let (device, _backend) = test_device!();

        let (pool, _fence) = test_pool(&device, 256);
        let mut allocator = LinearAllocator::new(pool);
        let _ = allocator.allocate(0, 4);
    }

    #[test]
    #[should_panic(expected = "write exceeds the allocation")]
    fn oversized_write_is_rejected() {
        let (device, _backend) = test_device!();

        let (pool, _fence) = test_pool(&device, 256);
        let mut allocator = LinearAllocator::new(pool);
        let mut a = allocator.allocate(4, 4).unwrap();
        a.write_slice(&[0u32; 4]);
    }
}

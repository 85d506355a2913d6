// Copyright (c) 2024 The fenceline contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The device context and the backend seam.
//!
//! Everything this crate does eventually bottoms out in a handful of device operations: signal
//! and query a fence, submit recorded commands, create and destroy descriptor heaps and memory
//! pages. Those operations are expressed by the [`Backend`] trait, implemented once per graphics
//! API by the embedding renderer. The allocators never see anything more specific than the
//! opaque handles defined here.
//!
//! A [`Device`] wraps the backend together with the [`FrameClock`] and is created once at
//! startup. It is passed by `Arc` to every component that needs it, so object lifetimes and
//! shutdown ordering are visible in the code rather than hidden behind process-wide statics.

use crate::{
    descriptor::HeapKind,
    memory::MemoryClass,
    queue::SubmitError,
    sync::{FenceError, FenceValue, FrameClock},
    DeviceSize, OomError,
};
use std::{fmt::Debug, ptr::NonNull, sync::Arc, time::Duration};

/// Opaque backend identifier for a fence object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub u64);

/// Opaque backend identifier for a recorded command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle(pub u64);

/// Opaque backend identifier for the storage command buffers are recorded into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandAllocatorHandle(pub u64);

/// Opaque backend identifier for a descriptor heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapHandle(pub u64);

/// Opaque backend identifier for a linear memory page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageHandle(pub u64);

/// A descriptor heap created by the backend.
#[derive(Clone, Copy, Debug)]
pub struct DescriptorHeap {
    pub handle: HeapHandle,
    /// GPU-visible pointer to slot 0 of the heap.
    pub base: u64,
    /// Distance between two adjacent descriptor slots, in pointer units.
    pub increment: u32,
}

/// A linear memory page created by the backend.
#[derive(Debug)]
pub struct PageInfo {
    pub handle: PageHandle,
    pub size: DeviceSize,
    /// Persistent mapping of the page, present iff the page's memory class is host-writable.
    pub mapped: Option<NonNull<u8>>,
    /// Address of the page in the device's address space.
    pub gpu_address: u64,
}

/// The device operations this crate is built on, implemented once per graphics API.
///
/// # Safety
///
/// - Handles returned by the `create_*` methods must remain valid until the matching
///   `destroy_*` method is called with them, and must never be reused for a different object
///   while valid.
/// - `create_page` must return a mapping that stays valid and addressable for `size` bytes
///   until `unmap_page` or `destroy_page` is called for the handle.
/// - Fence values must complete in monotonic order: if `completed_value` returns `v`, every
///   signal with a value `<= v` has completed.
pub unsafe trait Backend: Debug + Send + Sync {
    fn create_fence(&self) -> Result<FenceHandle, OomError>;

    fn destroy_fence(&self, fence: FenceHandle);

    /// Returns the highest value the device has completed on `fence`.
    fn completed_value(&self, fence: FenceHandle) -> FenceValue;

    /// Blocks until `fence` reaches `value`, or until the timeout elapses.
    ///
    /// A timeout of `None` waits forever (or until device loss is detected).
    fn wait_fence(
        &self,
        fence: FenceHandle,
        value: FenceValue,
        timeout: Option<Duration>,
    ) -> Result<(), FenceError>;

    /// Hands `commands` to the device queue for execution and appends a signal of
    /// `signal_value` on `fence`.
    fn submit(
        &self,
        commands: CommandBufferHandle,
        fence: FenceHandle,
        signal_value: FenceValue,
    ) -> Result<(), SubmitError>;

    /// Appends a signal of `signal_value` on `fence` without submitting any work.
    fn signal(&self, fence: FenceHandle, signal_value: FenceValue) -> Result<(), SubmitError>;

    fn create_command_allocator(&self) -> Result<CommandAllocatorHandle, OomError>;

    /// Resets `allocator` so its storage can be recorded into again.
    ///
    /// Only called once every command buffer recorded from it has finished executing.
    fn reset_command_allocator(&self, allocator: CommandAllocatorHandle);

    fn destroy_command_allocator(&self, allocator: CommandAllocatorHandle);

    fn create_descriptor_heap(
        &self,
        kind: HeapKind,
        capacity: u32,
    ) -> Result<DescriptorHeap, OomError>;

    fn destroy_descriptor_heap(&self, heap: HeapHandle);

    fn create_page(&self, class: MemoryClass, size: DeviceSize) -> Result<PageInfo, OomError>;

    /// Revokes CPU access to a host-writable page. The device memory stays valid.
    fn unmap_page(&self, page: PageHandle);

    fn destroy_page(&self, page: PageHandle);
}

/// The process-wide context every component of this crate hangs off of.
///
/// Created once at startup from a [`Backend`] implementation and passed by `Arc` to the command
/// queue and the allocators. The embedding renderer drives the [`FrameClock`] owned by the
/// device; see [`crate::sync::FrameClock`].
#[derive(Debug)]
pub struct Device {
    backend: Arc<dyn Backend>,
    frame_clock: FrameClock,
}

impl Device {
    /// Creates a new `Device` wrapping the given backend.
    #[inline]
    pub fn new(backend: Arc<dyn Backend>) -> Arc<Device> {
        Arc::new(Device {
            backend,
            frame_clock: FrameClock::new(),
        })
    }

    /// Returns the backend this device wraps.
    #[inline]
    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    /// Returns the frame-token source for this device.
    #[inline]
    pub fn frame_clock(&self) -> &FrameClock {
        &self.frame_clock
    }
}

/// Gives access to the device an object belongs to.
///
/// # Safety
///
/// Must always return the same device.
pub unsafe trait DeviceOwned {
    /// Returns the device owning `self`.
    fn device(&self) -> &Arc<Device>;
}

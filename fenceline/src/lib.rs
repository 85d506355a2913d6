// Copyright (c) 2024 The fenceline contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Fence-synchronized allocation primitives for GPU renderers.
//!
//! A CPU thread records rendering work several frames ahead of the GPU that executes it, so
//! freeing a descriptor range or a block of upload memory the moment the CPU is done recording
//! with it would corrupt work the GPU has not yet consumed. Every allocator in this crate
//! therefore defers reclamation until a fence value associated with the resource is confirmed
//! complete:
//!
//! - The [`Fence`](crate::sync::Fence) turns "the device has executed up to here" into a
//!   comparable integer.
//! - The [`CommandQueue`](crate::queue::CommandQueue) stamps every submission with the next
//!   fence value and recycles command allocators on a background task once their value is
//!   reached.
//! - The [`DescriptorAllocator`](crate::descriptor::DescriptorAllocator) hands out contiguous
//!   descriptor ranges from fixed-size heap pages, returning freed ranges to the free list only
//!   once the frame that released them is complete.
//! - The [`LinearAllocator`](crate::memory::LinearAllocator) bump-allocates transient
//!   GPU-visible memory from pooled pages and recycles whole pages under the same fence
//!   discipline.
//!
//! The crate contains no graphics-API-specific code. It reaches the device through the
//! [`Backend`](crate::device::Backend) trait, and a [`Device`](crate::device::Device) context
//! wrapping the backend is passed explicitly to every component, which also makes shutdown
//! ordering explicit: drain the queue, then drop the allocators, then the device.

use std::{error::Error, fmt};

pub mod descriptor;
pub mod device;
pub mod memory;
pub mod queue;
pub mod sync;

/// Represents memory size and offset values on the device.
/// Analogous to the Rust `usize` type on the host.
pub type DeviceSize = u64;

/// Error type returned when the host or the device is out of memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OomError {
    /// There is no memory available on the host (ie. the CPU, RAM, etc.).
    OutOfHostMemory,
    /// There is no memory available on the device (ie. video memory).
    OutOfDeviceMemory,
}

impl Error for OomError {}

impl fmt::Display for OomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                OomError::OutOfHostMemory => "no memory available on the host",
                OomError::OutOfDeviceMemory => "no memory available on the graphical device",
            }
        )
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());

// Copyright (c) 2024 The fenceline contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::FenceValue;
use crate::{
    device::{Device, DeviceOwned, FenceHandle},
    queue::SubmitError,
    OomError,
};
use parking_lot::Mutex;
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// A fence is used to know when a submission has finished executing on the device.
///
/// When a command buffer accesses a resource, the CPU must not reclaim that resource while the
/// command buffer is still pending or executing. Comparing against the fence value signaled
/// after the submission is the only way to know when it is safe to do so.
#[derive(Debug)]
pub struct Fence {
    device: Arc<Device>,
    handle: FenceHandle,

    // Last value known to be completed. If a value is at most this, it is reached; if it is
    // greater, we don't know without asking the backend. This avoids a driver round-trip on
    // every check.
    last_completed: AtomicU64,

    // Serializes completion-event registration with the backend. Two threads waiting on
    // different values must not share one backend completion event.
    wait_lock: Mutex<()>,
}

impl Fence {
    /// Creates a new `Fence`, starting at the completed value 0.
    pub fn new(device: Arc<Device>) -> Result<Fence, OomError> {
        let handle = device.backend().create_fence()?;

        Ok(Fence {
            device,
            handle,
            last_completed: AtomicU64::new(0),
            wait_lock: Mutex::new(()),
        })
    }

    pub(crate) fn handle(&self) -> FenceHandle {
        self.handle
    }

    /// Returns true if the device has reached `value`.
    pub fn is_reached(&self, value: FenceValue) -> bool {
        if value <= self.last_completed.load(Ordering::Acquire) {
            return true;
        }

        let completed = self.device.backend().completed_value(self.handle);
        self.last_completed.fetch_max(completed, Ordering::AcqRel);

        value <= completed
    }

    /// Blocks the calling thread until the device reaches `value`, or at least until the
    /// timeout duration has elapsed.
    ///
    /// A timeout of `None` waits forever. Safe to call concurrently from multiple threads
    /// waiting on different (or the same) values.
    pub fn wait(&self, value: FenceValue, timeout: Option<Duration>) -> Result<(), FenceError> {
        if self.is_reached(value) {
            return Ok(());
        }

        let _guard = self.wait_lock.lock();

        if self.is_reached(value) {
            return Ok(());
        }

        self.device.backend().wait_fence(self.handle, value, timeout)?;
        self.last_completed.fetch_max(value, Ordering::AcqRel);

        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.backend().destroy_fence(self.handle);
    }
}

unsafe impl DeviceOwned for Fence {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceError {
    /// Not enough memory available.
    OomError(OomError),

    /// The device has been lost.
    DeviceLost,

    /// The specified timeout wasn't long enough.
    Timeout,
}

impl Error for FenceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::OomError(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for FenceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::OomError(_) => write!(f, "not enough memory available"),
            Self::DeviceLost => write!(f, "the device was lost"),
            Self::Timeout => write!(f, "the timeout has been reached"),
        }
    }
}

impl From<OomError> for FenceError {
    fn from(err: OomError) -> Self {
        Self::OomError(err)
    }
}

impl From<SubmitError> for FenceError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::OomError(err) => Self::OomError(err),
            SubmitError::DeviceLost => Self::DeviceLost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fence_starts_unreached() {
        let (device, _backend) = test_device!(manual);

        let fence = Fence::new(device).unwrap();
        assert!(fence.is_reached(0));
        assert!(!fence.is_reached(1));
    }

    #[test]
    fn is_reached_tracks_signals() {
        let (device, backend) = test_device!(manual);

        let fence = Fence::new(device).unwrap();
        backend.signal_fence(fence.handle(), 3);
        assert!(fence.is_reached(3));
        assert!(fence.is_reached(2));
        assert!(!fence.is_reached(4));
    }

    #[test]
    fn wait_timeout() {
        let (device, _backend) = test_device!(manual);

        let fence = Fence::new(device).unwrap();
        assert_eq!(
            fence.wait(1, Some(Duration::from_millis(10))),
            Err(FenceError::Timeout),
        );
    }

    #[test]
    fn wait_device_lost() {
        let (device, backend) = test_device!(manual);

        let fence = Fence::new(device).unwrap();
        backend.lose_device();
        assert_eq!(fence.wait(1, None), Err(FenceError::DeviceLost));
    }

    #[test]
    fn concurrent_waiters_on_different_values() {
        let (device, backend) = test_device!(manual);

        let fence = Fence::new(device).unwrap();

        thread::scope(|scope| {
            for value in 1..=4 {
                let fence = &fence;
                scope.spawn(move || fence.wait(value, None).unwrap());
            }

            for value in 1..=4 {
                backend.signal_fence(fence.handle(), value);
            }
        });

        assert!(fence.is_reached(4));
    }
}

// Copyright (c) 2024 The fenceline contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Fence-stamped command submission.
//!
//! A [`CommandQueue`] gives recorded command buffers to the device and stamps each submission
//! with the next value of its [`Fence`], which is the token every allocator in this crate keys
//! deferred reclamation on. The queue also owns the storage command buffers are recorded into:
//! [`acquire_allocator`](CommandQueue::acquire_allocator) hands out a recycled
//! [`CommandAllocator`] when one is available, and a dedicated background task returns each
//! allocator to the recycle pool once the fence value of the submission that used it is
//! reached. Command *recording* itself is out of scope here; the embedding renderer records
//! into the allocator's storage and passes the resulting [`CommandBufferHandle`] to
//! [`submit`](CommandQueue::submit).

use crate::{
    device::{CommandAllocatorHandle, CommandBufferHandle, Device, DeviceOwned},
    sync::{Fence, FenceError, FenceValue},
    OomError,
};
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    mem::ManuallyDrop,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

/// A submission whose fence value has been handed out but not yet reached. Enqueued in
/// submission order, so earlier entries are always reached first.
#[derive(Debug)]
struct PendingSubmission {
    fence_value: FenceValue,
    allocator: CommandAllocatorHandle,
}

#[derive(Debug)]
struct QueueState {
    // Highest fence value handed out so far. Values start at 1; 0 predates every submission.
    last_value: FenceValue,
    pending: VecDeque<PendingSubmission>,
    // The worker has popped an entry and is still blocked on its fence or recycling it. The
    // pending queue being empty is not the same as no work outstanding.
    reclaiming: bool,
    shutdown: bool,
}

#[derive(Debug)]
struct QueueShared {
    device: Arc<Device>,
    fence: Arc<Fence>,
    state: Mutex<QueueState>,
    work_available: Condvar,
    work_done: Condvar,
    // Command allocators whose submissions have completed, reset and ready for reuse.
    available: SegQueue<CommandAllocatorHandle>,
    device_lost: AtomicBool,
}

/// Submits recorded command buffers to the device and converts "the device has executed up to
/// here" into a comparable [`FenceValue`].
///
/// Dropping the queue flushes it, joins the background reclamation task, and destroys all
/// pooled command allocators.
#[derive(Debug)]
pub struct CommandQueue {
    shared: Arc<QueueShared>,
    worker: Option<JoinHandle<()>>,
}

impl CommandQueue {
    /// Creates a new `CommandQueue` and spawns its reclamation task.
    pub fn new(device: Arc<Device>) -> Result<CommandQueue, OomError> {
        let fence = Arc::new(Fence::new(device.clone())?);
        let shared = Arc::new(QueueShared {
            device,
            fence,
            state: Mutex::new(QueueState {
                last_value: 0,
                pending: VecDeque::new(),
                reclaiming: false,
                shutdown: false,
            }),
            work_available: Condvar::new(),
            work_done: Condvar::new(),
            available: SegQueue::new(),
            device_lost: AtomicBool::new(false),
        });

        let worker = std::thread::Builder::new()
            .name("fenceline-reclaim".into())
            .spawn({
                let shared = shared.clone();
                move || reclaim_loop(&shared)
            })
            .map_err(|_| OomError::OutOfHostMemory)?;

        Ok(CommandQueue {
            shared,
            worker: Some(worker),
        })
    }

    /// Returns the fence this queue signals. Page pools share it to decide when retired pages
    /// may be reused.
    #[inline]
    pub fn fence(&self) -> &Arc<Fence> {
        &self.shared.fence
    }

    /// Returns a command allocator to record the next batch into, reusing one whose previous
    /// submission has completed when possible.
    pub fn acquire_allocator(&self) -> Result<CommandAllocator, OomError> {
        let handle = match self.shared.available.pop() {
            Some(handle) => handle,
            None => self.shared.device.backend().create_command_allocator()?,
        };

        Ok(CommandAllocator {
            handle,
            shared: ManuallyDrop::new(self.shared.clone()),
        })
    }

    /// Gives `commands` to the device queue, appends a signal for the next fence value, and
    /// returns that value. The effect of the commands is observable only once the returned
    /// value is reached.
    ///
    /// `allocator` is the storage `commands` was recorded into; it is queued for recycling and
    /// handed out again by [`acquire_allocator`](Self::acquire_allocator) once the returned
    /// fence value completes.
    ///
    /// A device error is returned synchronously, never deferred to the reclamation task.
    pub fn submit(
        &self,
        commands: CommandBufferHandle,
        allocator: CommandAllocator,
    ) -> Result<FenceValue, SubmitError> {
        let shared = &self.shared;
        let allocator = allocator.into_handle();

        // Holding the lock across the backend call keeps fence values stamped in submission
        // order.
        let mut state = shared.state.lock();
        let value = state.last_value + 1;

        if let Err(err) = shared
            .device
            .backend()
            .submit(commands, shared.fence.handle(), value)
        {
            drop(state);
            shared.device.backend().destroy_command_allocator(allocator);
            return Err(err);
        }

        state.last_value = value;
        state.pending.push_back(PendingSubmission {
            fence_value: value,
            allocator,
        });
        drop(state);

        shared.work_available.notify_one();

        Ok(value)
    }

    /// Returns true if the device has reached `value`.
    #[inline]
    pub fn is_reached(&self, value: FenceValue) -> bool {
        self.shared.fence.is_reached(value)
    }

    /// Blocks the calling thread until the device reaches `value`.
    #[inline]
    pub fn wait_until_reached(&self, value: FenceValue) -> Result<(), FenceError> {
        self.shared.fence.wait(value, None)
    }

    /// Submits a synchronization point, blocks until it is reached, and then waits for the
    /// pending queue to drain. Used at shutdown and at resize/device-loss boundaries.
    pub fn flush(&self) -> Result<(), FenceError> {
        let shared = &self.shared;

        let value = {
            let mut state = shared.state.lock();
            let value = state.last_value + 1;
            shared.device.backend().signal(shared.fence.handle(), value)?;
            state.last_value = value;
            value
        };

        shared.fence.wait(value, None)?;

        let mut state = shared.state.lock();
        while !state.pending.is_empty() || state.reclaiming {
            if shared.device_lost.load(Ordering::Relaxed) {
                return Err(FenceError::DeviceLost);
            }
            shared.work_done.wait(&mut state);
        }

        Ok(())
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::error!("flush failed while dropping command queue: {err}");
        }

        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.work_available.notify_all();

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        let backend = self.shared.device.backend();
        while let Some(handle) = self.shared.available.pop() {
            backend.destroy_command_allocator(handle);
        }

        // Entries can be left pending after a device loss; their allocators are unusable.
        let mut state = self.shared.state.lock();
        for entry in state.pending.drain(..) {
            backend.destroy_command_allocator(entry.allocator);
        }
    }
}

unsafe impl DeviceOwned for CommandQueue {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.shared.device
    }
}

/// The reclamation task. Pops pending submissions in fence order, blocks on each one's fence
/// and returns its command allocator to the recycle pool, signaling `work_done` whenever the
/// queue drains so that `flush` never has to spin.
fn reclaim_loop(shared: &QueueShared) {
    loop {
        let entry = {
            let mut state = shared.state.lock();
            loop {
                if let Some(entry) = state.pending.pop_front() {
                    state.reclaiming = true;
                    break entry;
                }
                if state.shutdown {
                    return;
                }
                shared.work_available.wait(&mut state);
            }
        };

        if let Err(err) = shared.fence.wait(entry.fence_value, None) {
            // Device loss is fatal; report it and stop reclaiming rather than retry.
            tracing::error!(
                fence_value = entry.fence_value,
                "fence wait failed during reclamation: {err}"
            );
            shared.device.backend().destroy_command_allocator(entry.allocator);
            shared.device_lost.store(true, Ordering::Relaxed);
            shared.state.lock().reclaiming = false;
            shared.work_done.notify_all();
            return;
        }

        shared.device.backend().reset_command_allocator(entry.allocator);
        shared.available.push(entry.allocator);

        let drained = {
            let mut state = shared.state.lock();
            state.reclaiming = false;
            state.pending.is_empty()
        };
        if drained {
            shared.work_done.notify_all();
        }
    }
}

/// Storage for one batch of recorded commands, owned by a [`CommandQueue`].
///
/// Dropping an unsubmitted allocator discards its contents and returns it to the queue's
/// recycle pool.
#[derive(Debug)]
pub struct CommandAllocator {
    handle: CommandAllocatorHandle,
    shared: ManuallyDrop<Arc<QueueShared>>,
}

impl CommandAllocator {
    /// Returns the backend handle to record into.
    #[inline]
    pub fn handle(&self) -> CommandAllocatorHandle {
        self.handle
    }

    fn into_handle(self) -> CommandAllocatorHandle {
        let mut this = ManuallyDrop::new(self);
        let handle = this.handle;
        // SAFETY: `this` is never dropped, so `shared` cannot be taken twice.
        drop(unsafe { ManuallyDrop::take(&mut this.shared) });
        handle
    }
}

impl Drop for CommandAllocator {
    fn drop(&mut self) {
        // SAFETY: `drop` is called at most once, and `into_handle` does not run it.
        let shared = unsafe { ManuallyDrop::take(&mut self.shared) };
        let backend = shared.device.backend();

        if shared.state.lock().shutdown {
            backend.destroy_command_allocator(self.handle);
        } else {
            backend.reset_command_allocator(self.handle);
            shared.available.push(self.handle);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitError {
    /// Not enough memory available.
    OomError(OomError),

    /// The device has been lost.
    DeviceLost,
}

impl Error for SubmitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::OomError(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for SubmitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::OomError(_) => write!(f, "not enough memory available"),
            Self::DeviceLost => write!(f, "the device was lost"),
        }
    }
}

impl From<OomError> for SubmitError {
    fn from(err: OomError) -> Self {
        Self::OomError(err)
    }
}

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::{Device, NameObjectError};

#[derive(Debug, Error)]
pub enum CreateFenceError {
    #[error("Vulkan error creating fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum WaitFenceError {
    #[error("Fence wait timed out")]
    Timeout,
    #[error("Vulkan error waiting for fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateSemaphoreError {
    #[error("Vulkan error creating semaphore: {0}")]
    Vulkan(vk::Result),
}

/// An owned binary fence for host-device synchronisation.
///
/// Use [`wait_and_reset`](Self::wait_and_reset) at the top of a frame slot's
/// cycle: block until the GPU retired the slot's previous submission, then
/// return the fence to the unsignaled state for the next one.
pub struct Fence {
    parent: Arc<Device>,
    handle: vk::Fence,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Fence {
    /// Create a fence.
    ///
    /// `signaled` controls the initial state. Pass `true` so the first
    /// wait-and-reset cycle in a render loop returns immediately.
    ///
    /// `name` is an optional debug label applied via `VK_EXT_debug_utils`
    /// when available. Naming failures are logged, not returned.
    pub fn new(
        device: &Arc<Device>,
        signaled: bool,
        name: Option<&str>,
    ) -> Result<Self, CreateFenceError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);

        // SAFETY: create_info is fully initialised with no borrowed pointers.
        let handle =
            unsafe { device.create_raw_fence(&create_info) }.map_err(CreateFenceError::Vulkan)?;

        // SAFETY: handle is a valid fence created from device.
        match unsafe { device.set_object_name_str(handle, name) } {
            Ok(()) | Err(NameObjectError::DebugUtilsNotEnabled) => {}
            Err(e) => tracing::warn!("Failed to name fence {:?}: {e}", handle),
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Block until the fence is signaled or `timeout_ns` nanoseconds elapse.
    ///
    /// Pass `u64::MAX` to wait indefinitely.
    pub fn wait(&self, timeout_ns: u64) -> Result<(), WaitFenceError> {
        // SAFETY: handle is a valid fence created from parent.
        unsafe {
            self.parent
                .wait_for_raw_fences(&[self.handle], true, timeout_ns)
        }
        .map_err(|e| {
            if e == vk::Result::TIMEOUT {
                WaitFenceError::Timeout
            } else {
                WaitFenceError::Vulkan(e)
            }
        })
    }

    /// Reset the fence to the unsignaled state.
    ///
    /// # Safety
    /// The fence must not be currently pending on any queue submission.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the fence is not pending.
        unsafe { self.parent.reset_raw_fences(&[self.handle]) }
    }

    /// Wait for the fence to be signaled and then immediately reset it.
    ///
    /// # Safety
    /// No other thread may re-submit this fence's raw handle between the wait
    /// returning and the reset completing. The `&mut` receiver prevents
    /// same-thread re-submission via `raw_handle`; cross-thread raw handle
    /// usage is the caller's responsibility.
    pub unsafe fn wait_and_reset(&mut self, timeout_ns: u64) -> Result<(), WaitFenceError> {
        self.wait(timeout_ns)?;
        // SAFETY: wait() succeeded so the fence is signaled and not pending.
        unsafe { self.reset() }.map_err(WaitFenceError::Vulkan)
    }

    pub fn raw_handle(&self) -> vk::Fence {
        self.handle
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        // SAFETY: handle was created from parent and is being destroyed during
        // teardown. No GPU work may reference this fence.
        unsafe { self.parent.destroy_raw_fence(self.handle) };
    }
}

/// An owned binary semaphore for device-device synchronisation.
///
/// Signaled by one queue operation and waited on by another; the host never
/// touches it directly.
pub struct Semaphore {
    parent: Arc<Device>,
    handle: vk::Semaphore,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Semaphore {
    pub fn new(device: &Arc<Device>, name: Option<&str>) -> Result<Self, CreateSemaphoreError> {
        let create_info = vk::SemaphoreCreateInfo::default();

        // SAFETY: create_info is fully initialised with no borrowed pointers.
        let handle = unsafe { device.create_raw_semaphore(&create_info) }
            .map_err(CreateSemaphoreError::Vulkan)?;

        // SAFETY: handle is a valid semaphore created from device.
        match unsafe { device.set_object_name_str(handle, name) } {
            Ok(()) | Err(NameObjectError::DebugUtilsNotEnabled) => {}
            Err(e) => tracing::warn!("Failed to name semaphore {:?}: {e}", handle),
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        tracing::debug!("Dropping semaphore {:?}", self.handle);
        // SAFETY: handle was created from parent and is being destroyed during
        // teardown. No GPU work may be waiting on or about to signal it.
        unsafe { self.parent.destroy_raw_semaphore(self.handle) };
    }
}

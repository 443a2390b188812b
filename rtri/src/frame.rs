use std::sync::Arc;

use thiserror::Error;

use crate::command::{AllocateCommandBufferError, CommandPool, CommandRecorder};
use crate::device::Device;
use crate::sync::{CreateFenceError, CreateSemaphoreError, Fence, Semaphore};

/// How many frames may be in flight on the GPU at once.
///
/// Two bounds latency and memory while still letting the CPU record frame
/// N+1 while the GPU draws frame N.
pub const FRAMES_IN_FLIGHT: usize = 2;

#[derive(Debug, Error)]
pub enum CreateFrameSchedulerError {
    #[error("Failed to create in-flight fence: {0}")]
    Fence(#[from] CreateFenceError),

    #[error("Failed to create frame semaphore: {0}")]
    Semaphore(#[from] CreateSemaphoreError),

    #[error("Failed to allocate frame command buffer: {0}")]
    CommandBuffer(#[from] AllocateCommandBufferError),
}

/// The per-slot resources one in-flight frame cycles through.
pub struct FrameSlot {
    /// Signaled when this slot's previous submission retires. Created
    /// signaled so the first use of the slot does not block.
    pub in_flight: Fence,
    /// Signaled by acquire, waited on by submit.
    pub image_available: Semaphore,
    /// Signaled by submit, waited on by present.
    pub render_finished: Semaphore,
    pub recorder: CommandRecorder,
}

impl std::fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlot")
            .field("in_flight", &self.in_flight)
            .field("recorder", &self.recorder)
            .finish_non_exhaustive()
    }
}

pub(crate) fn next_slot(current: usize, slot_count: usize) -> usize {
    (current + 1) % slot_count
}

/// Rotates [`FRAMES_IN_FLIGHT`] slots of sync objects and command buffers.
///
/// The scheduler only owns resources and the slot cursor; the render
/// sequencing itself lives with the engine. The cursor advances after every
/// frame attempt, successful or not, so a failed frame cannot stall the
/// other slot.
pub struct FrameScheduler {
    slots: Vec<FrameSlot>,
    current: usize,
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("slots", &self.slots.len())
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl FrameScheduler {
    pub fn new(
        device: &Arc<Device>,
        pool: &CommandPool,
    ) -> Result<Self, CreateFrameSchedulerError> {
        let mut slots = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for index in 0..FRAMES_IN_FLIGHT {
            slots.push(FrameSlot {
                in_flight: Fence::new(
                    device,
                    true,
                    Some(&format!("Frame {index} in-flight fence")),
                )?,
                image_available: Semaphore::new(
                    device,
                    Some(&format!("Frame {index} image-available semaphore")),
                )?,
                render_finished: Semaphore::new(
                    device,
                    Some(&format!("Frame {index} render-finished semaphore")),
                )?,
                recorder: pool.allocate_recorder()?,
            });
        }

        Ok(Self { slots, current: 0 })
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_slot_mut(&mut self) -> &mut FrameSlot {
        &mut self.slots[self.current]
    }

    /// Move the cursor to the next slot.
    pub fn advance(&mut self) {
        self.current = next_slot(self.current, self.slots.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_slots_alternate() {
        let mut current = 0;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(current);
            current = next_slot(current, FRAMES_IN_FLIGHT);
        }
        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn single_slot_stays_put() {
        assert_eq!(next_slot(0, 1), 0);
    }

    #[test]
    fn in_flight_count_is_two() {
        assert_eq!(FRAMES_IN_FLIGHT, 2);
    }
}

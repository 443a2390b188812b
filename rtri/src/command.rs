use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::pipeline::GraphicsPipeline;
use crate::render_pass::RenderPass;

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Vulkan(vk::Result),
}

/// Shared ownership of the raw Vulkan pool handle.
///
/// Held via `Arc` by both [`CommandPool`] and every [`CommandRecorder`]
/// allocated from it, so a recorder can never hold a handle into a destroyed
/// pool.
struct CommandPoolShared {
    parent: Arc<Device>,
    pool: vk::CommandPool,
}

impl Drop for CommandPoolShared {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        // SAFETY: pool was created from parent. This runs only when the pool
        // wrapper and every recorder allocated from it have been dropped.
        // vkDestroyCommandPool implicitly frees all allocated command buffers.
        unsafe { self.parent.destroy_raw_command_pool(self.pool) };
    }
}

/// A command pool whose buffers can be individually reset and re-recorded.
///
/// Created with `RESET_COMMAND_BUFFER` so each frame slot re-records its own
/// buffer without disturbing the others.
pub struct CommandPool {
    shared: Arc<CommandPoolShared>,
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.shared.pool)
            .finish_non_exhaustive()
    }
}

impl CommandPool {
    pub fn new(device: &Arc<Device>, queue_family: u32) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);

        // SAFETY: create_info references a queue family this device was
        // created with.
        let pool = unsafe { device.create_raw_command_pool(&create_info) }
            .map_err(CreateCommandPoolError::Vulkan)?;

        Ok(Self {
            shared: Arc::new(CommandPoolShared {
                parent: Arc::clone(device),
                pool,
            }),
        })
    }

    /// Allocate one primary command buffer from this pool.
    pub fn allocate_recorder(&self) -> Result<CommandRecorder, AllocateCommandBufferError> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.shared.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        // SAFETY: allocate_info references this pool, created from parent.
        let handles = unsafe {
            self.shared
                .parent
                .allocate_raw_command_buffers(&allocate_info)
        }
        .map_err(AllocateCommandBufferError::Vulkan)?;

        debug_assert_eq!(handles.len(), 1);

        Ok(CommandRecorder {
            shared: Arc::clone(&self.shared),
            handle: handles[0],
        })
    }
}

/// The clear value for a single-color-attachment render pass.
pub fn clear_value_from_rgba(rgba: [f32; 4]) -> vk::ClearValue {
    vk::ClearValue {
        color: vk::ClearColorValue { float32: rgba },
    }
}

/// A viewport and scissor covering `extent` exactly.
pub fn full_extent_viewport(extent: vk::Extent2D) -> (vk::Viewport, vk::Rect2D) {
    let viewport = vk::Viewport::default()
        .x(0.0)
        .y(0.0)
        .width(extent.width as f32)
        .height(extent.height as f32)
        .min_depth(0.0)
        .max_depth(1.0);
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    (viewport, scissor)
}

/// One primary command buffer plus the recording operations a frame needs.
///
/// Keeps the pool alive through `shared`; the buffer is implicitly freed when
/// the pool is destroyed.
pub struct CommandRecorder {
    shared: Arc<CommandPoolShared>,
    handle: vk::CommandBuffer,
}

impl std::fmt::Debug for CommandRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRecorder")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl CommandRecorder {
    pub fn raw_handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    fn device(&self) -> &ash::Device {
        self.shared.parent.ash_handle()
    }

    /// Reset the buffer and begin recording.
    ///
    /// # Safety
    /// No submission using this buffer may still be pending.
    pub unsafe fn reset_and_begin(&mut self) -> Result<(), vk::Result> {
        // SAFETY: handle is valid, pool was created with RESET_COMMAND_BUFFER,
        // and the caller guarantees no pending submission.
        unsafe {
            self.device()
                .reset_command_buffer(self.handle, vk::CommandBufferResetFlags::empty())
        }?;
        let begin_info = vk::CommandBufferBeginInfo::default();
        // SAFETY: handle was just reset to the initial state.
        unsafe { self.device().begin_command_buffer(self.handle, &begin_info) }
    }

    /// End recording.
    ///
    /// # Safety
    /// The buffer must be in the recording state with no open render pass.
    pub unsafe fn end(&mut self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees recording state.
        unsafe { self.device().end_command_buffer(self.handle) }
    }

    /// Begin `render_pass` on `framebuffer`, clearing to `clear_value` over
    /// the full `extent`.
    ///
    /// # Safety
    /// The buffer must be recording. `framebuffer` must be compatible with
    /// `render_pass` and at least `extent` large; both must be derived from
    /// this recorder's device and stay valid until the submission retires.
    pub unsafe fn begin_render_pass(
        &mut self,
        render_pass: &RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_value: vk::ClearValue,
    ) {
        let clear_values = [clear_value];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass.raw_handle())
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        // SAFETY: Caller guarantees recording state and handle provenance.
        unsafe {
            self.device().cmd_begin_render_pass(
                self.handle,
                &begin_info,
                vk::SubpassContents::INLINE,
            )
        };
    }

    /// # Safety
    /// The buffer must be recording and inside a render pass.
    pub unsafe fn end_render_pass(&mut self) {
        // SAFETY: Caller guarantees render pass state.
        unsafe { self.device().cmd_end_render_pass(self.handle) };
    }

    /// # Safety
    /// The buffer must be recording inside a render pass compatible with the
    /// pipeline's render pass.
    pub unsafe fn bind_graphics_pipeline(&mut self, pipeline: &GraphicsPipeline) {
        // SAFETY: Caller guarantees state; pipeline is derived from the same
        // device.
        unsafe {
            self.device().cmd_bind_pipeline(
                self.handle,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.raw_handle(),
            )
        };
    }

    /// Set the dynamic viewport and scissor to cover `extent`.
    ///
    /// # Safety
    /// The buffer must be recording with a bound pipeline declaring dynamic
    /// viewport and scissor state.
    pub unsafe fn set_full_viewport_scissor(&mut self, extent: vk::Extent2D) {
        let (viewport, scissor) = full_extent_viewport(extent);
        // SAFETY: Caller guarantees recording state and dynamic state flags.
        unsafe {
            self.device()
                .cmd_set_viewport(self.handle, 0, &[viewport]);
            self.device().cmd_set_scissor(self.handle, 0, &[scissor]);
        }
    }

    /// Issue one non-indexed draw.
    ///
    /// # Safety
    /// The buffer must be recording inside a render pass with a bound
    /// graphics pipeline and all required dynamic state set.
    pub unsafe fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        // SAFETY: Caller guarantees draw-time state.
        unsafe {
            self.device()
                .cmd_draw(self.handle, vertex_count, instance_count, 0, 0)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_value_carries_rgba_through() {
        let value = clear_value_from_rgba([0.25, 0.5, 0.75, 1.0]);
        // SAFETY: clear_value_from_rgba always initialises the color member.
        let float32 = unsafe { value.color.float32 };
        assert_eq!(float32, [0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn viewport_covers_full_extent() {
        let extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let (viewport, scissor) = full_extent_viewport(extent);
        assert_eq!(viewport.x, 0.0);
        assert_eq!(viewport.y, 0.0);
        assert_eq!(viewport.width, 1280.0);
        assert_eq!(viewport.height, 720.0);
        assert_eq!(viewport.min_depth, 0.0);
        assert_eq!(viewport.max_depth, 1.0);
        assert_eq!(scissor.offset, vk::Offset2D { x: 0, y: 0 });
        assert_eq!(scissor.extent, extent);
    }
}

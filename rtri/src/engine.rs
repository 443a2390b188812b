use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::command::{clear_value_from_rgba, CommandPool, CreateCommandPoolError};
use crate::device::{CreateDeviceError, Device};
use crate::frame::{CreateFrameSchedulerError, FrameScheduler};
use crate::framebuffer::{CreateFramebufferError, Framebuffers};
use crate::instance::{Instance, InstanceCreationError};
use crate::log::VulkanLogLevel;
use crate::pipeline::{CreatePipelineError, GraphicsPipeline, PipelineState};
use crate::render_pass::{CreateRenderPassError, RenderPass};
use crate::shader::{
    default_search_roots, CreateShaderModuleError, ShaderLoadError, ShaderModule, ShaderSet,
    ShaderStage,
};
use crate::surface::{CreateSurfaceError, Surface};
use crate::swapchain::{CreateSwapchainError, Swapchain};
use crate::sync::WaitFenceError;
use crate::window::{Window, WindowError, WindowHandles};

const VERT_SHADER: &str = "tri.vert.spv";
const FRAG_SHADER: &str = "tri.frag.spv";
const TRIANGLE_VERTEX_COUNT: u32 = 3;

/// Startup parameters for [`Engine::new`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    /// `Some` installs a Vulkan debug messenger (when the validation layer
    /// and `VK_EXT_debug_utils` are present) filtered to this level.
    pub vulkan_log_level: Option<VulkanLogLevel>,
    /// Base directories probed for `shaders/`. `None` uses the default set
    /// (executable directory, build output, working directory).
    pub shader_roots: Option<Vec<PathBuf>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            title: "rtri".to_owned(),
            width: 1280,
            height: 720,
            vulkan_log_level: None,
            shader_roots: None,
        }
    }
}

/// A startup failure, tagged with which init step failed.
///
/// [`code`](Self::code) returns a stable per-step number suitable for use as
/// a process exit code.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("Windowing subsystem initialisation failed: {0}")]
    WindowSubsystem(WindowError),

    #[error("Window creation failed: {0}")]
    Window(WindowError),

    #[error("Vulkan instance creation failed: {0}")]
    Instance(#[from] InstanceCreationError),

    #[error("Surface creation failed: {0}")]
    Surface(#[from] CreateSurfaceError),

    #[error("Device selection failed: {0}")]
    Device(#[from] CreateDeviceError),

    #[error("Swapchain creation failed: {0}")]
    Swapchain(#[from] CreateSwapchainError),

    #[error("Render pass creation failed: {0}")]
    RenderPass(#[from] CreateRenderPassError),

    #[error("Pipeline construction failed: {0}")]
    Pipeline(#[from] BuildPipelineError),

    #[error("Framebuffer creation failed: {0}")]
    Framebuffers(#[from] CreateFramebufferError),

    #[error("Command pool or buffer creation failed: {0}")]
    CommandObjects(CreateCommandPoolError),

    #[error("Frame command buffer allocation failed: {0}")]
    CommandBuffers(crate::command::AllocateCommandBufferError),

    #[error("Sync object creation failed: {0}")]
    SyncObjects(CreateFrameSchedulerError),
}

impl InitError {
    pub fn code(&self) -> i32 {
        match self {
            InitError::WindowSubsystem(_) => 1,
            InitError::Window(_) => 2,
            InitError::Instance(_) => 3,
            InitError::Surface(_) => 4,
            InitError::Device(_) => 5,
            InitError::Swapchain(_) => 6,
            InitError::RenderPass(_) => 7,
            InitError::Pipeline(_) => 8,
            InitError::Framebuffers(_) => 9,
            InitError::CommandObjects(_) | InitError::CommandBuffers(_) => 10,
            InitError::SyncObjects(_) => 11,
        }
    }
}

impl From<WindowError> for InitError {
    fn from(value: WindowError) -> Self {
        if value.is_subsystem_failure() {
            InitError::WindowSubsystem(value)
        } else {
            InitError::Window(value)
        }
    }
}

impl From<CreateFrameSchedulerError> for InitError {
    fn from(value: CreateFrameSchedulerError) -> Self {
        match value {
            CreateFrameSchedulerError::CommandBuffer(e) => InitError::CommandBuffers(e),
            other => InitError::SyncObjects(other),
        }
    }
}

/// Pipeline construction failure with located shader artifacts.
///
/// Artifacts that cannot be found at all are not an error; the engine runs
/// clear-only. Once artifacts exist, a Vulkan failure building from them is
/// fatal.
#[derive(Debug, Error)]
pub enum BuildPipelineError {
    #[error("Shader module creation failed: {0}")]
    ShaderModule(#[from] CreateShaderModuleError),

    #[error("Invalid shader entry point name: {0}")]
    EntryPoint(#[from] std::ffi::NulError),

    #[error("Graphics pipeline creation failed: {0}")]
    Pipeline(#[from] CreatePipelineError),
}

#[derive(Debug, Error)]
pub enum RebuildError {
    #[error("Device wait-idle failed before swapchain rebuild: {0}")]
    WaitIdle(vk::Result),

    #[error("Swapchain recreation failed: {0}")]
    Swapchain(#[from] CreateSwapchainError),

    #[error("Framebuffer recreation failed: {0}")]
    Framebuffers(#[from] CreateFramebufferError),
}

/// A per-frame failure. Code 1 ([`SwapchainStale`](Self::SwapchainStale)) is
/// recoverable: the swapchain was rebuilt and the caller should simply try
/// again next tick. All other codes are fatal.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Swapchain was stale and has been rebuilt; retry next tick")]
    SwapchainStale,

    #[error("In-flight fence wait failed: {0}")]
    FenceWait(#[from] WaitFenceError),

    #[error("Swapchain image acquire failed: {0}")]
    Acquire(vk::Result),

    #[error("Command buffer recording failed: {0}")]
    Record(vk::Result),

    #[error("Graphics queue submit failed: {0}")]
    Submit(vk::Result),

    #[error("Present failed: {0}")]
    Present(vk::Result),

    #[error("Swapchain rebuild failed: {0}")]
    Rebuild(#[from] RebuildError),
}

impl RenderError {
    pub fn code(&self) -> i32 {
        match self {
            RenderError::SwapchainStale => 1,
            RenderError::FenceWait(_) => 2,
            RenderError::Acquire(_) => 3,
            RenderError::Record(_) => 4,
            RenderError::Submit(_) => 5,
            RenderError::Present(_) => 6,
            RenderError::Rebuild(_) => 7,
        }
    }

    /// `true` when the caller should keep running and retry next tick.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RenderError::SwapchainStale)
    }
}

/// The whole engine: window, Vulkan object graph, and frame scheduler.
///
/// Field order is teardown order. Drop waits for the device to go idle and
/// then releases everything child-before-parent: frames and command pool,
/// framebuffers, pipeline, render pass, swapchain, device, surface,
/// instance, window.
pub struct Engine {
    frames: FrameScheduler,
    command_pool: CommandPool,
    framebuffers: Framebuffers,
    pipeline: PipelineState,
    render_pass: RenderPass,
    swapchain: Swapchain<WindowHandles>,
    device: Arc<Device>,
    surface: Arc<Surface<WindowHandles>>,
    instance: Arc<Instance>,
    window: Window,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("device", &self.device)
            .field("swapchain", &self.swapchain)
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}

fn build_triangle_pipeline(
    device: &Arc<Device>,
    render_pass: &RenderPass,
    shader_roots: &[PathBuf],
) -> Result<PipelineState, BuildPipelineError> {
    let shader_set = match ShaderSet::load(shader_roots, VERT_SHADER, FRAG_SHADER) {
        Ok(set) => set,
        Err(e @ ShaderLoadError::NotFound { .. }) => {
            tracing::warn!("Shader artifacts not found, rendering clear-only: {e}");
            return Ok(PipelineState::NotBuilt);
        }
        Err(e @ ShaderLoadError::Io { .. }) => {
            tracing::warn!("Shader artifacts unreadable, rendering clear-only: {e}");
            return Ok(PipelineState::NotBuilt);
        }
    };

    let vert = ShaderModule::new(device, &shader_set.vertex)?;
    let frag = ShaderModule::new(device, &shader_set.fragment)?;
    let stages = [
        vert.entry_point("main", ShaderStage::Vertex)?,
        frag.entry_point("main", ShaderStage::Fragment)?,
    ];

    let pipeline = GraphicsPipeline::new(device, render_pass, &stages, None)?;
    Ok(PipelineState::Ready(pipeline))
    // vert and frag drop here; Vulkan permits destroying shader modules once
    // the pipeline has been created from them.
}

impl Engine {
    /// Bring up the full engine in strict order: window, instance, surface,
    /// device, swapchain, render pass, pipeline, framebuffers, command pool,
    /// frame scheduler.
    ///
    /// Anything constructed before a failing step is torn down by Drop in
    /// reverse order as the error propagates.
    pub fn new(config: EngineConfig) -> Result<Self, InitError> {
        let window = Window::new(&config.title, config.width, config.height)?;

        // SAFETY: Loading the Vulkan library at startup is the accepted risk
        // of any Vulkan application.
        let instance = Arc::new(unsafe {
            Instance::new(
                &config.title,
                config.vulkan_log_level,
                window.shared_handles().as_ref(),
            )
        }?);

        // SAFETY: The surface is dropped before the window and instance by
        // Engine's field order, and holds both alive via Arc.
        let surface = Arc::new(unsafe {
            Surface::new(&instance, Arc::clone(window.shared_handles()))
        }?);

        let device = Arc::new(Device::select_and_create(&instance, &surface)?);

        let swapchain = Swapchain::new(&device, &surface, window.drawable_extent())?;

        let render_pass = RenderPass::new(&device, swapchain.format())?;

        let shader_roots = config
            .shader_roots
            .unwrap_or_else(default_search_roots);
        let pipeline = build_triangle_pipeline(&device, &render_pass, &shader_roots)?;

        let framebuffers = Framebuffers::new(
            &device,
            &render_pass,
            swapchain.image_views(),
            swapchain.extent(),
        )?;

        let command_pool = CommandPool::new(&device, device.queue_families().graphics)
            .map_err(InitError::CommandObjects)?;

        let frames = FrameScheduler::new(&device, &command_pool)?;

        tracing::info!("Engine initialised");

        Ok(Self {
            frames,
            command_pool,
            framebuffers,
            pipeline,
            render_pass,
            swapchain,
            device,
            surface,
            instance,
            window,
        })
    }

    /// Drain pending window events; `true` means quit was requested.
    pub fn poll_quit(&mut self) -> bool {
        self.window.poll_quit()
    }

    /// Monotonic milliseconds since the window came up.
    pub fn ticks(&self) -> u64 {
        self.window.ticks()
    }

    /// Whether a triangle pipeline is currently bound-able (as opposed to
    /// clear-only rendering).
    pub fn has_pipeline(&self) -> bool {
        self.pipeline.is_ready()
    }

    /// Rebuild the swapchain and framebuffers against the window's current
    /// size. Blocks while the window is minimised.
    pub fn handle_resize(&mut self) -> Result<(), RebuildError> {
        self.rebuild_swapchain()
    }

    /// Render one frame cleared to `clear_color`, drawing the triangle when
    /// the pipeline is ready.
    ///
    /// The frame slot cursor advances whether the frame succeeds or fails,
    /// so a failed frame cannot stall the other slot.
    pub fn render_frame(&mut self, clear_color: [f32; 4]) -> Result<(), RenderError> {
        let result = self.render_frame_inner(clear_color);
        self.frames.advance();
        result
    }

    fn render_frame_inner(&mut self, clear_color: [f32; 4]) -> Result<(), RenderError> {
        let (image_available, render_finished, in_flight, command_buffer) = {
            let slot = self.frames.current_slot_mut();
            slot.in_flight.wait(u64::MAX)?;
            (
                slot.image_available.raw_handle(),
                slot.render_finished.raw_handle(),
                slot.in_flight.raw_handle(),
                slot.recorder.raw_handle(),
            )
        };

        // SAFETY: swapchain and semaphore are both derived from this device;
        // the fence wait above guarantees image_available is unsignaled.
        let acquire = unsafe {
            self.device.acquire_next_raw_image(
                self.swapchain.raw_handle(),
                u64::MAX,
                image_available,
            )
        };
        let (image_index, acquire_suboptimal) = match acquire {
            Ok(pair) => pair,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                // The fence stays signaled: this slot's next use must not
                // block on a submission that never happened.
                self.rebuild_swapchain()?;
                return Err(RenderError::SwapchainStale);
            }
            Err(e) => return Err(RenderError::Acquire(e)),
        };

        let Some(framebuffer) = self.framebuffers.raw_handle(image_index) else {
            // Image count changed under us; treat like staleness.
            self.rebuild_swapchain()?;
            return Err(RenderError::SwapchainStale);
        };

        let extent = self.swapchain.extent();
        let clear_value = clear_value_from_rgba(clear_color);

        {
            let slot = self.frames.current_slot_mut();
            // SAFETY: the wait above proved the fence signaled, so it is not
            // pending.
            unsafe { slot.in_flight.reset() }.map_err(RenderError::Record)?;

            // SAFETY: the fence wait guarantees this slot's previous
            // submission retired, so the buffer is free to reset. Render
            // pass, framebuffer, and pipeline are all derived from this
            // device and outlive the submission.
            unsafe {
                slot.recorder.reset_and_begin().map_err(RenderError::Record)?;
                slot.recorder.begin_render_pass(
                    &self.render_pass,
                    framebuffer,
                    extent,
                    clear_value,
                );
                if let Some(pipeline) = self.pipeline.bindable() {
                    slot.recorder.bind_graphics_pipeline(pipeline);
                    slot.recorder.set_full_viewport_scissor(extent);
                    slot.recorder.draw(TRIANGLE_VERTEX_COUNT, 1);
                }
                slot.recorder.end_render_pass();
                slot.recorder.end().map_err(RenderError::Record)?;
            }
        }

        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [render_finished];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        // SAFETY: all handles are derived from this device; the command
        // buffer was just recorded and the fence was just reset.
        unsafe { self.device.submit_graphics_raw(&[submit], in_flight) }
            .map_err(RenderError::Submit)?;

        let wait_semaphores = [render_finished];
        let swapchains = [self.swapchain.raw_handle()];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: all handles are derived from this device and image_index
        // was acquired above.
        let present = unsafe { self.device.queue_present_raw(&present_info) };
        match present {
            Ok(false) => {}
            // The frame was submitted and will present (or the image is
            // simply gone); either way only the next acquire is affected, so
            // this is not an error for this call.
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.rebuild_swapchain()?;
                return Ok(());
            }
            Err(e) => return Err(RenderError::Present(e)),
        }

        if acquire_suboptimal {
            self.rebuild_swapchain()?;
        }

        Ok(())
    }

    fn rebuild_swapchain(&mut self) -> Result<(), RebuildError> {
        let extent = self.window.wait_for_nonzero_extent();
        tracing::info!(
            "Rebuilding swapchain at {}x{}",
            extent.width,
            extent.height
        );

        self.device.wait_idle().map_err(RebuildError::WaitIdle)?;

        // Old framebuffers reference the old views; they go first.
        self.framebuffers.reset();

        let new_swapchain =
            Swapchain::new_with_old(&self.device, &self.surface, extent, Some(&self.swapchain))?;
        let old_swapchain = std::mem::replace(&mut self.swapchain, new_swapchain);
        drop(old_swapchain);

        if self.swapchain.format() != self.render_pass.format() {
            tracing::warn!(
                "Surface format changed from {:?} to {:?}; the pipeline is \
                 retired and frames fall back to clear-only",
                self.render_pass.format(),
                self.swapchain.format()
            );
            self.pipeline.mark_stale();
        }

        self.framebuffers = Framebuffers::new(
            &self.device,
            &self.render_pass,
            self.swapchain.image_views(),
            self.swapchain.extent(),
        )?;

        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        tracing::info!("Shutting down engine");
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Device wait-idle failed during shutdown: {e}");
        }
        // Fields drop in declaration order, which is teardown order.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_codes_identify_each_step() {
        use crate::window::WindowError;

        let cases: Vec<(InitError, i32)> = vec![
            (
                InitError::WindowSubsystem(WindowError::SdlInit("x".into())),
                1,
            ),
            (
                InitError::Window(WindowError::EventPump("x".into())),
                2,
            ),
            (
                InitError::Instance(InstanceCreationError::MissingEntryPoint),
                3,
            ),
            (
                InitError::Surface(CreateSurfaceError::VulkanError(
                    vk::Result::ERROR_INITIALIZATION_FAILED,
                )),
                4,
            ),
            (InitError::Device(CreateDeviceError::NoSuitableDevice), 5),
            (
                InitError::Swapchain(CreateSwapchainError::NoSurfaceFormats),
                6,
            ),
            (
                InitError::RenderPass(CreateRenderPassError::Vulkan(
                    vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                )),
                7,
            ),
            (
                InitError::Pipeline(BuildPipelineError::Pipeline(
                    CreatePipelineError::NoStages,
                )),
                8,
            ),
            (
                InitError::Framebuffers(CreateFramebufferError::Vulkan(
                    vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                )),
                9,
            ),
            (
                InitError::CommandObjects(CreateCommandPoolError::Vulkan(
                    vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                )),
                10,
            ),
            (
                InitError::SyncObjects(CreateFrameSchedulerError::Fence(
                    crate::sync::CreateFenceError::Vulkan(
                        vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                    ),
                )),
                11,
            ),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.code(), *expected, "wrong code for {error:?}");
        }

        // Codes must be pairwise distinct so exit statuses stay meaningful.
        let mut codes: Vec<i32> = cases.iter().map(|(e, _)| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), cases.len());
    }

    #[test]
    fn window_subsystem_failures_map_to_code_one() {
        let err: InitError = WindowError::VideoInit("no display".into()).into();
        assert_eq!(err.code(), 1);

        let err: InitError = WindowError::EventPump("pump".into()).into();
        assert_eq!(err.code(), 2);
    }

    #[test]
    fn only_staleness_is_recoverable() {
        assert!(RenderError::SwapchainStale.is_recoverable());
        assert_eq!(RenderError::SwapchainStale.code(), 1);

        let fatal = [
            RenderError::Acquire(vk::Result::ERROR_DEVICE_LOST),
            RenderError::Record(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            RenderError::Submit(vk::Result::ERROR_DEVICE_LOST),
            RenderError::Present(vk::Result::ERROR_SURFACE_LOST_KHR),
            RenderError::Rebuild(RebuildError::WaitIdle(
                vk::Result::ERROR_DEVICE_LOST,
            )),
        ];
        for error in &fatal {
            assert!(!error.is_recoverable(), "{error:?} should be fatal");
            assert!(error.code() > 1, "{error:?} should have a fatal code");
        }
    }

    #[test]
    fn command_buffer_allocation_shares_command_step_code() {
        let err: InitError = CreateFrameSchedulerError::CommandBuffer(
            crate::command::AllocateCommandBufferError::Vulkan(
                vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            ),
        )
        .into();
        assert_eq!(err.code(), 10);
    }
}

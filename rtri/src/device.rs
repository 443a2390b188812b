use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::instance::{FetchPhysicalDeviceError, Instance};
use crate::surface::{Surface, SurfaceQueryError};

/// The queue family indices a device was created with.
///
/// Graphics and present are usually the same family, but the selection logic
/// does not require it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_unified(&self) -> bool {
        self.graphics == self.present
    }
}

/// Pick graphics and present queue families from `queue_families`.
///
/// The graphics family is the first one advertising `GRAPHICS`. The present
/// family prefers the graphics family when it can present, otherwise the
/// first family that can. Returns `None` when either capability is missing
/// entirely.
pub fn select_queue_families(
    queue_families: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> Option<QueueFamilies> {
    let graphics = queue_families.iter().enumerate().find_map(|(idx, props)| {
        (props.queue_count > 0 && props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .then_some(idx as u32)
    })?;

    let present = if supports_present(graphics) {
        graphics
    } else {
        queue_families
            .iter()
            .enumerate()
            .find_map(|(idx, props)| {
                (props.queue_count > 0 && supports_present(idx as u32)).then_some(idx as u32)
            })?
    };

    Some(QueueFamilies { graphics, present })
}

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error(
        "Mismatched parameters to Device::select_and_create. All \
         parameters must be derived from the same instance"
    )]
    MismatchedParams,

    #[error("Host memory exhaustion while enumerating physical devices")]
    MemoryExhaustion,

    #[error("Unknown Vulkan error while creating a device: {0}")]
    UnknownVulkan(vk::Result),

    #[error("No physical device can render and present to this surface")]
    NoSuitableDevice,

    #[error("Failed to create logical device: {0}")]
    DeviceCreationFailed(vk::Result),
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Debug utils extension is not enabled on this device")]
    DebugUtilsNotEnabled,

    #[error("Invalid Vulkan object name (contains interior NUL): {0}")]
    InvalidName(std::ffi::NulError),

    #[error("Vulkan error setting object name: {0}")]
    Vulkan(vk::Result),
}

/// A logical device with one graphics queue and one present queue (the same
/// queue when the families are unified).
pub struct Device {
    parent: Arc<Instance>,
    handle: ash::Device,
    swapchain_device: ash::khr::swapchain::Device,
    debug_utils_device: Option<ash::ext::debug_utils::Device>,
    physical_device: vk::PhysicalDevice,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    families: QueueFamilies,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        //SAFETY: All objects derived from this device should be dropped
        //before this device is dropped
        unsafe { self.handle.destroy_device(None) };
    }
}

impl Device {
    /// Pick the first physical device that can render to and present on
    /// `surf`, then create a logical device on it with the swapchain
    /// extension enabled.
    ///
    /// Suitability requires a graphics queue family, a present-capable queue
    /// family for the surface, `VK_KHR_swapchain`, and at least one surface
    /// format and present mode.
    pub fn select_and_create<T: HasDisplayHandle + HasWindowHandle>(
        instance: &Arc<Instance>,
        surf: &Surface<T>,
    ) -> Result<Self, CreateDeviceError> {
        if !Arc::ptr_eq(surf.get_parent(), instance) {
            return Err(CreateDeviceError::MismatchedParams);
        }

        let physical_devices = instance.fetch_physical_devices()?;

        let mut selected = None;
        for dev in physical_devices {
            //SAFETY: dev was derived from instance
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(dev) };

            let Some(families) = select_queue_families(&queue_families, |idx| {
                //SAFETY: dev was derived from the same instance as surf
                matches!(unsafe { surf.supports_queue_family(dev, idx) }, Ok(true))
            }) else {
                continue;
            };

            //SAFETY: dev was derived from instance
            let has_swapchain_ext = unsafe { instance.enumerate_device_extensions(dev) }
                .map(|exts| {
                    exts.iter().any(|ext| {
                        ext.extension_name_as_c_str() == Ok(ash::khr::swapchain::NAME)
                    })
                })
                .unwrap_or(false);
            if !has_swapchain_ext {
                continue;
            }

            //SAFETY: dev was derived from the same instance as surf
            let formats = unsafe { surf.query_formats(dev) };
            //SAFETY: dev was derived from the same instance as surf
            let present_modes = unsafe { surf.query_present_modes(dev) };
            let surface_usable = matches!(
                (&formats, &present_modes),
                (Ok(f), Ok(m)) if !f.is_empty() && !m.is_empty()
            );
            if !surface_usable {
                continue;
            }

            selected = Some((dev, families));
            break;
        }

        let (physical_device, families) =
            selected.ok_or(CreateDeviceError::NoSuitableDevice)?;

        //SAFETY: physical_device was derived from instance
        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        tracing::info!(
            "Selected physical device: {:?} (type: {:?}, graphics family: {}, \
             present family: {})",
            props.device_name_as_c_str().unwrap_or(c"unknown"),
            props.device_type,
            families.graphics,
            families.present,
        );

        // One create info per distinct family.
        let unique_families: HashSet<u32> =
            HashSet::from([families.graphics, families.present]);
        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let ext_ptrs = [ash::khr::swapchain::NAME.as_ptr()];

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&ext_ptrs);

        //SAFETY: physical_device was derived from instance, device_create_info
        //is valid
        let device = unsafe { instance.create_raw_device(physical_device, &device_create_info) }
            .map_err(CreateDeviceError::DeviceCreationFailed)?;

        //SAFETY: device was just created with these queue families
        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        //SAFETY: device was just created with these queue families
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };

        let swapchain_device =
            ash::khr::swapchain::Device::new(instance.ash_handle(), &device);
        let debug_utils_device = instance
            .has_debug_utils()
            .then(|| ash::ext::debug_utils::Device::new(instance.ash_handle(), &device));

        Ok(Self {
            parent: Arc::clone(instance),
            handle: device,
            swapchain_device,
            debug_utils_device,
            physical_device,
            graphics_queue,
            present_queue,
            families,
        })
    }

    pub fn get_parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn get_physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn ash_handle(&self) -> &ash::Device {
        &self.handle
    }

    pub fn raw_handle(&self) -> vk::Device {
        self.handle.handle()
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    /// Wait until all submitted work on this device has completed.
    ///
    /// This may block the calling thread and should generally be used for
    /// coarse-grained transitions (shutdown, swapchain teardown) rather than
    /// hot per-frame paths.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: self.handle is a valid logical device for the lifetime of
        // self, and this call has no additional pointer preconditions.
        unsafe { self.handle.device_wait_idle() }
    }
}

// Queue operations
impl Device {
    /// Submit recorded work to the graphics queue.
    ///
    /// # Safety
    /// Every handle referenced by `submits` and `fence` must be valid,
    /// derived from this device, and in a submittable state. `fence` may be
    /// null.
    pub unsafe fn submit_graphics_raw(
        &self,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees submit validity and handle provenance.
        unsafe { self.handle.queue_submit(self.graphics_queue, submits, fence) }
    }

    /// Acquire the next swapchain image, returning its index and a
    /// suboptimal flag.
    ///
    /// # Safety
    /// `swapchain` must be a valid handle derived from this device and
    /// `semaphore` a valid unsignaled binary semaphore derived from this
    /// device.
    pub unsafe fn acquire_next_raw_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        // SAFETY: Caller guarantees handle provenance.
        unsafe {
            self.swapchain_device.acquire_next_image(
                swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    /// Queue a present on the present queue, returning the suboptimal flag.
    ///
    /// # Safety
    /// Every handle referenced by `present_info` must be valid and derived
    /// from this device.
    pub unsafe fn queue_present_raw(
        &self,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, vk::Result> {
        // SAFETY: Caller guarantees present_info validity.
        unsafe {
            self.swapchain_device
                .queue_present(self.present_queue, present_info)
        }
    }
}

// Swapchain functionality
impl Device {
    /// # Safety
    /// `create_info` must reference valid Vulkan objects derived from this
    /// device and its parent instance. If `create_info.old_swapchain` is
    /// non-null, that handle must be a valid swapchain created from this
    /// device.
    pub unsafe fn create_raw_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, vk::Result> {
        // SAFETY: Caller guarantees create_info validity and handle provenance.
        unsafe { self.swapchain_device.create_swapchain(create_info, None) }
    }

    /// # Safety
    /// `swapchain` must be a valid swapchain handle created from this device
    /// and not yet destroyed.
    pub unsafe fn get_raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, vk::Result> {
        // SAFETY: Caller guarantees swapchain validity and lifetime.
        unsafe { self.swapchain_device.get_swapchain_images(swapchain) }
    }

    /// # Safety
    /// `swapchain` must be a valid handle derived from this device, all child
    /// resources derived from it must be destroyed first, and no in-flight
    /// GPU work may still reference it.
    pub unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        // SAFETY: Caller guarantees swapchain provenance and drop ordering.
        unsafe { self.swapchain_device.destroy_swapchain(swapchain, None) };
    }

    /// # Safety
    /// `create_info` must reference valid Vulkan objects derived from this
    /// device.
    pub unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        // SAFETY: Caller guarantees create_info validity and provenance.
        unsafe { self.handle.create_image_view(create_info, None) }
    }

    /// # Safety
    /// `image_view` must be a valid handle derived from this device, all
    /// objects using it must be destroyed first, and no in-flight GPU work
    /// may still reference it.
    pub unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView) {
        // SAFETY: Caller guarantees image_view provenance and drop ordering.
        unsafe { self.handle.destroy_image_view(image_view, None) };
    }
}

// Render pass and framebuffer functionality
impl Device {
    /// # Safety
    /// `create_info` must be a valid render pass create info.
    pub unsafe fn create_raw_render_pass(
        &self,
        create_info: &vk::RenderPassCreateInfo<'_>,
    ) -> Result<vk::RenderPass, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_render_pass(create_info, None) }
    }

    /// # Safety
    /// `render_pass` must be a valid handle created from this device, all
    /// framebuffers and pipelines derived from it must be destroyed first,
    /// and no in-flight GPU work may still reference it.
    pub unsafe fn destroy_raw_render_pass(&self, render_pass: vk::RenderPass) {
        // SAFETY: Caller guarantees render_pass provenance and drop ordering.
        unsafe { self.handle.destroy_render_pass(render_pass, None) };
    }

    /// # Safety
    /// `create_info` must reference a valid render pass and image views, all
    /// derived from this device.
    pub unsafe fn create_raw_framebuffer(
        &self,
        create_info: &vk::FramebufferCreateInfo<'_>,
    ) -> Result<vk::Framebuffer, vk::Result> {
        // SAFETY: Caller guarantees create_info validity and provenance.
        unsafe { self.handle.create_framebuffer(create_info, None) }
    }

    /// # Safety
    /// `framebuffer` must be a valid handle created from this device and no
    /// in-flight GPU work may still reference it.
    pub unsafe fn destroy_raw_framebuffer(&self, framebuffer: vk::Framebuffer) {
        // SAFETY: Caller guarantees framebuffer provenance and drop ordering.
        unsafe { self.handle.destroy_framebuffer(framebuffer, None) };
    }
}

// Shader module functionality
impl Device {
    /// # Safety
    /// `create_info` must contain valid SPIR-V code.
    pub unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    /// # Safety
    /// `shader_module` must be a valid handle created from this device and
    /// not yet destroyed.
    pub unsafe fn destroy_raw_shader_module(&self, shader_module: vk::ShaderModule) {
        // SAFETY: Caller guarantees shader_module provenance and drop ordering.
        unsafe { self.handle.destroy_shader_module(shader_module, None) };
    }
}

// Pipeline functionality
impl Device {
    /// # Safety
    /// `create_info` must be a valid pipeline layout create info. All
    /// referenced descriptor set layouts must be valid handles created from
    /// this device.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must be a valid handle created from this device and not yet
    /// destroyed. No pipeline still using this layout may be in use.
    pub unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: Caller guarantees layout provenance and drop ordering.
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// Create a single graphics pipeline.
    ///
    /// On partial batch failure ash returns any successfully-created pipeline
    /// handles alongside the error; this wrapper destroys them so callers
    /// never receive a mix of valid and invalid handles.
    ///
    /// # Safety
    /// `create_info` must reference valid shader stages, a valid pipeline
    /// layout, and a valid render pass, all derived from this device.
    pub unsafe fn create_raw_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe {
            self.handle.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        }
        .map_err(|(partial, result)| {
            for p in partial {
                if p != vk::Pipeline::null() {
                    // SAFETY: p was just created by this device.
                    unsafe { self.handle.destroy_pipeline(p, None) };
                }
            }
            result
        })
        .map(|mut pipelines| {
            debug_assert_eq!(pipelines.len(), 1);
            pipelines.remove(0)
        })
    }

    /// # Safety
    /// `pipeline` must be a valid handle created from this device and no
    /// in-flight GPU work may still reference it.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: Caller guarantees pipeline provenance and drop ordering.
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }
}

// Sync object functionality
impl Device {
    /// # Safety
    /// `create_info` must be a valid fence create info.
    pub unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// `fence` must be a valid handle created from this device and must not
    /// be pending on any queue submission.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: Caller guarantees fence provenance and drop ordering.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// Every fence in `fences` must be a valid handle created from this
    /// device.
    pub unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees fence provenance.
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    /// # Safety
    /// Every fence in `fences` must be a valid handle created from this
    /// device and must not be pending on any queue submission.
    pub unsafe fn reset_raw_fences(&self, fences: &[vk::Fence]) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the fences are not pending.
        unsafe { self.handle.reset_fences(fences) }
    }

    /// # Safety
    /// `create_info` must be a valid semaphore create info.
    pub unsafe fn create_raw_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_semaphore(create_info, None) }
    }

    /// # Safety
    /// `semaphore` must be a valid handle created from this device and no
    /// queue operation may still be waiting on or about to signal it.
    pub unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: Caller guarantees semaphore provenance and drop ordering.
        unsafe { self.handle.destroy_semaphore(semaphore, None) };
    }
}

// Command pool and buffer functionality
impl Device {
    /// # Safety
    /// `create_info` must be a valid command pool create info referencing a
    /// queue family this device was created with.
    pub unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_command_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must be a valid handle created from this device and no command
    /// buffer allocated from it may be pending execution.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: Caller guarantees pool provenance and drop ordering.
        // vkDestroyCommandPool implicitly frees all allocated command buffers.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info` must reference a valid command pool created from this
    /// device.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: Caller guarantees allocate_info validity.
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }
}

// Debug naming functionality
impl Device {
    /// Set a Vulkan debug name for an object owned by this device from UTF-8
    /// text. Passing `None` as the name is treated as a no-op.
    ///
    /// # Safety
    /// `object` must be a valid Vulkan handle created from this device (or a
    /// child object associated with this device) and must remain valid for
    /// the duration of the call.
    pub unsafe fn set_object_name_str<H>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        let debug_utils = self
            .debug_utils_device
            .as_ref()
            .ok_or(NameObjectError::DebugUtilsNotEnabled)?;

        let Some(name) = name else {
            return Ok(());
        };
        let name = CString::new(name).map_err(NameObjectError::InvalidName)?;

        let object_name_info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(name.as_c_str());

        // SAFETY: Caller guarantees object provenance and validity.
        unsafe { debug_utils.set_debug_utils_object_name(&object_name_info) }
            .map_err(NameObjectError::Vulkan)
    }
}

impl From<FetchPhysicalDeviceError> for CreateDeviceError {
    fn from(value: FetchPhysicalDeviceError) -> Self {
        match value {
            FetchPhysicalDeviceError::MemoryExhaustion => Self::MemoryExhaustion,
            FetchPhysicalDeviceError::UnknownVulkan(e) => Self::UnknownVulkan(e),
        }
    }
}

impl From<SurfaceQueryError> for CreateDeviceError {
    fn from(value: SurfaceQueryError) -> Self {
        match value {
            SurfaceQueryError::Vulkan(e) => Self::UnknownVulkan(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn unified_family_preferred_for_present() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 4),
        ];
        // Every family can present; graphics should still claim both roles.
        let selected = select_queue_families(&families, |_| true).unwrap();
        assert_eq!(
            selected,
            QueueFamilies {
                graphics: 1,
                present: 1
            }
        );
        assert!(selected.is_unified());
    }

    #[test]
    fn split_families_when_graphics_cannot_present() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::TRANSFER, 1),
        ];
        let selected = select_queue_families(&families, |idx| idx == 1).unwrap();
        assert_eq!(
            selected,
            QueueFamilies {
                graphics: 0,
                present: 1
            }
        );
        assert!(!selected.is_unified());
    }

    #[test]
    fn no_graphics_family_fails() {
        let families = [family(vk::QueueFlags::TRANSFER, 1)];
        assert!(select_queue_families(&families, |_| true).is_none());
    }

    #[test]
    fn no_present_family_fails() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1)];
        assert!(select_queue_families(&families, |_| false).is_none());
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 0),
            family(vk::QueueFlags::GRAPHICS, 2),
        ];
        let selected = select_queue_families(&families, |_| true).unwrap();
        assert_eq!(selected.graphics, 1);
    }
}

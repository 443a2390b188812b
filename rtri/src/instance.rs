use std::ffi::{CStr, CString};
use std::fmt::Debug;
use std::str::FromStr;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::log::VulkanLogLevel;
use crate::surface::{SurfaceQueryError, SurfaceSupportError};

/// Owns the loaded Vulkan entry points, the `VkInstance`, and (when
/// requested and available) a debug messenger.
///
/// Every other Vulkan wrapper in this crate holds an `Arc<Instance>` so that
/// the instance outlives everything derived from it.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger: Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    surface_instance: ash::khr::surface::Instance,
    api_version: u32,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Could not load libvulkan: {0}")]
    LibraryLoading(libloading::Error),
    #[error("Could not load vkGetInstanceProcAddr from libvulkan")]
    MissingEntryPoint,
    #[error("Couldn't get display handle from passed value: {0}")]
    InvalidDisplayHandle(raw_window_handle::HandleError),
    #[error("Missing mandatory instance extensions: {0:?}")]
    MissingExtensions(Vec<String>),
    #[error("Unknown Vulkan error {0}")]
    UnknownVulkan(vk::Result),
    #[error("Application name contained an interior nul byte")]
    InvalidAppName,
}

impl From<vk::Result> for InstanceCreationError {
    fn from(value: vk::Result) -> Self {
        InstanceCreationError::UnknownVulkan(value)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some((debug_messenger, debug_utils_instance)) = self.debug_messenger.take() {
            //SAFETY: Last use of this debug messenger, which was created from
            //this instance. debug_utils_instance is derived from this instance
            unsafe { debug_utils_instance.destroy_debug_utils_messenger(debug_messenger, None) };
        }
        //SAFETY: We are in drop so this is the last use of instance. Any given
        //derived object should be gone
        unsafe { self.handle.destroy_instance(None) };
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    //SAFETY: Vulkan guarantees p_callback_data is valid
    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) }.to_string_lossy();

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "GENERAL",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "VALIDATION",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "PERFORMANCE",
        _ => "UNKNOWN",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::trace!(target: "rtri-debug-messenger", "[{}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(target: "rtri-debug-messenger", "[{}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "rtri-debug-messenger", "[{}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "rtri-debug-messenger", "[{}] {}", type_str, message);
        }
        _ => {
            tracing::debug!(target: "rtri-debug-messenger", "[{}] {}", type_str, message);
        }
    }

    vk::FALSE
}

fn debug_message_severity(level: VulkanLogLevel) -> vk::DebugUtilsMessageSeverityFlagsEXT {
    match level {
        VulkanLogLevel::Verbose => {
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
        }
        VulkanLogLevel::Info => {
            vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
        }
        VulkanLogLevel::Warning => {
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
        }
        VulkanLogLevel::Error => vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
    }
}

impl Instance {
    /// Creates a new instance by loading vulkan, enabling the surface
    /// extensions the display requires. When `max_log_level` is `Some` and
    /// both `VK_EXT_debug_utils` and the Khronos validation layer are
    /// present, a debug messenger is installed; otherwise the instance comes
    /// up silently and everything else still works.
    ///
    /// # Safety
    /// This loads vulkan using libloading, meaning that there can be
    /// arbitrary code executed. This is not great but it's *probably* fine?
    pub unsafe fn new(
        app_name: impl AsRef<str>,
        max_log_level: Option<VulkanLogLevel>,
        display_handle_source: &impl HasDisplayHandle,
    ) -> Result<Self, InstanceCreationError> {
        use InstanceCreationError as Error;

        let app_name_cstring =
            CString::from_str(app_name.as_ref()).map_err(|_| Error::InvalidAppName)?;

        //SAFETY: We pass on the burden of the safety from loading dlls to the
        //caller. As for Entry, we ensure all other vulkan objects are dropped
        //before Entry is dropped (handled in the Drop impl of Instance)
        let entry = unsafe { ash::Entry::load() }.map_err(|e| match e {
            ash::LoadingError::LibraryLoadFailure(error) => Error::LibraryLoading(error),
            ash::LoadingError::MissingEntryPoint(_) => Error::MissingEntryPoint,
        })?;

        //SAFETY: Basically always fine
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .unwrap_or(Some(vk::API_VERSION_1_0))
            .unwrap_or(vk::API_VERSION_1_0);

        // The surface extensions for this platform are mandatory; a headless
        // instance is useless to us.
        let ash_window_exts = ash_window::enumerate_required_extensions(
            display_handle_source
                .display_handle()
                .map_err(Error::InvalidDisplayHandle)?
                .as_raw(),
        )?;

        let mandatory_exts: Vec<&CStr> = ash_window_exts
            .iter()
            //SAFETY: ash_window promises to hand us null terminated C strings
            //in its API. This isn't enforced anywhere through any safety means
            //but it is documented
            .map(|ext_cstr_ptr| unsafe { CStr::from_ptr(*ext_cstr_ptr) })
            .collect();

        //SAFETY: Pretty much always okay
        let instance_exts_avail = unsafe { entry.enumerate_instance_extension_properties(None) }?;
        //SAFETY: Pretty much always okay
        let instance_layers_avail = unsafe { entry.enumerate_instance_layer_properties() };

        let missing_exts: Vec<_> = mandatory_exts
            .iter()
            .filter(|mandatory_ext| {
                !instance_exts_avail
                    .iter()
                    .any(|avail| avail.extension_name_as_c_str() == Ok(**mandatory_ext))
            })
            .map(|ext| ext.to_string_lossy().into_owned())
            .collect();

        if !missing_exts.is_empty() {
            return Err(Error::MissingExtensions(missing_exts));
        }

        let debug_utils_ext_name = ash::ext::debug_utils::NAME;
        let validation_layer_name = c"VK_LAYER_KHRONOS_validation";

        let debug_utils_available = instance_exts_avail
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(debug_utils_ext_name));

        let validation_layer_available = instance_layers_avail
            .as_ref()
            .map(|layers| {
                layers
                    .iter()
                    .any(|layer| layer.layer_name_as_c_str() == Ok(validation_layer_name))
            })
            .unwrap_or(false);

        let mut enabled_exts: Vec<_> = mandatory_exts.iter().map(|ext| ext.as_ptr()).collect();
        let mut enabled_layers: Vec<*const std::ffi::c_char> = Vec::new();

        let mut debug_messenger_create_info = if let Some(log_level) = max_log_level
            && debug_utils_available
            && validation_layer_available
        {
            enabled_exts.push(debug_utils_ext_name.as_ptr());
            enabled_layers.push(validation_layer_name.as_ptr());

            Some(
                vk::DebugUtilsMessengerCreateInfoEXT::default()
                    .message_severity(debug_message_severity(log_level))
                    .message_type(
                        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    )
                    .pfn_user_callback(Some(vulkan_debug_callback)),
            )
        } else {
            if max_log_level.is_some() {
                tracing::warn!(
                    "Vulkan debug logging requested but debug utils / validation \
                     layer are unavailable; continuing without a debug messenger"
                );
            }
            None
        };

        let engine_name = c"rtri";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstring)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let mut instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_exts)
            .enabled_layer_names(&enabled_layers);

        if let Some(ref mut debug_info) = debug_messenger_create_info {
            instance_create_info = instance_create_info.push_next(debug_info);
        }

        //SAFETY: We made a valid instance_create_info
        let instance = unsafe { entry.create_instance(&instance_create_info, None) }?;

        let debug_messenger = if let Some(mut debug_messenger_create_info) =
            debug_messenger_create_info
        {
            debug_messenger_create_info.p_next = std::ptr::null();
            let debug_utils_instance = ash::ext::debug_utils::Instance::new(&entry, &instance);
            //SAFETY: Valid CI
            match unsafe {
                debug_utils_instance
                    .create_debug_utils_messenger(&debug_messenger_create_info, None)
            } {
                Ok(debug_messenger) => Some((debug_messenger, debug_utils_instance)),
                Err(e) => {
                    tracing::error!(
                        "Debug messenger creation failed even though the extension \
                         is present; continuing without one: {e}"
                    );
                    None
                }
            }
        } else {
            None
        };

        let surface_instance = ash::khr::surface::Instance::new(&entry, &instance);

        tracing::info!(
            "Vulkan instance created (api {}.{}, debug messenger: {})",
            vk::api_version_major(api_version),
            vk::api_version_minor(api_version),
            debug_messenger.is_some()
        );

        Ok(Instance {
            entry,
            handle: instance,
            debug_messenger,
            surface_instance,
            api_version,
        })
    }

    /// Create a raw VkSurfaceKHR for the given window.
    ///
    /// # Safety
    /// The returned surface must be destroyed before `source` or this
    /// instance is dropped. There is a parent child relationship between
    /// both the instance and source and the returned surface
    pub unsafe fn create_raw_surface<T: HasDisplayHandle + HasWindowHandle>(
        &self,
        source: &T,
    ) -> Result<vk::SurfaceKHR, CreateRawSurfaceError> {
        use CreateRawSurfaceError as Error;
        //SAFETY: Caller keeps source and this instance alive past the surface
        unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.handle,
                source
                    .display_handle()
                    .map_err(Error::DisplayHandle)?
                    .as_raw(),
                source
                    .window_handle()
                    .map_err(Error::WindowHandle)?
                    .as_raw(),
                None,
            )
        }
        .map_err(Error::OnCreate)
    }

    /// Destroy a raw VkSurfaceKHR.
    ///
    /// # Safety
    /// All objects derived from `surf` must be destroyed first, `surf` must
    /// not be used afterwards, and `surf` must be derived from this instance.
    pub unsafe fn destroy_raw_surface(&self, surf: vk::SurfaceKHR) {
        //SAFETY: surf is derived from this instance (passed on to caller)
        unsafe { self.surface_instance.destroy_surface(surf, None) };
    }

    /// Get a vector of handles to available physical devices. These handles
    /// are ONLY valid in the context of this instance.
    pub fn fetch_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        //SAFETY: Pretty much always fine
        match unsafe { self.handle.enumerate_physical_devices() } {
            Ok(v) => Ok(v),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                Err(FetchPhysicalDeviceError::MemoryExhaustion)
            }
            Err(e) => Err(FetchPhysicalDeviceError::UnknownVulkan(e)),
        }
    }

    /// # Safety
    /// `physical_device` must be derived from this instance.
    pub unsafe fn get_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        //SAFETY: physical_device provenance guaranteed by caller
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must be derived from this instance.
    pub unsafe fn get_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        //SAFETY: physical_device provenance guaranteed by caller
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be derived from this instance.
    pub unsafe fn enumerate_device_extensions(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, vk::Result> {
        //SAFETY: physical_device provenance guaranteed by caller
        unsafe {
            self.handle
                .enumerate_device_extension_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` and `surface` must both be derived from this
    /// instance.
    pub unsafe fn get_raw_physical_device_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, SurfaceSupportError> {
        //SAFETY: Provenance guaranteed by caller
        unsafe {
            self.surface_instance.get_physical_device_surface_support(
                physical_device,
                queue_family_index,
                surface,
            )
        }
        .map_err(SurfaceSupportError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must both be derived from this
    /// instance.
    pub unsafe fn get_surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        //SAFETY: Provenance guaranteed by caller
        unsafe {
            self.surface_instance
                .get_physical_device_surface_capabilities(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must both be derived from this
    /// instance.
    pub unsafe fn get_surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        //SAFETY: Provenance guaranteed by caller
        unsafe {
            self.surface_instance
                .get_physical_device_surface_formats(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must both be derived from this
    /// instance.
    pub unsafe fn get_surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        //SAFETY: Provenance guaranteed by caller
        unsafe {
            self.surface_instance
                .get_physical_device_surface_present_modes(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// Create a raw VkDevice.
    ///
    /// # Safety
    /// `physical_device` must be derived from this instance and
    /// `create_info` must be valid for it. The returned device must be
    /// destroyed before this instance.
    pub unsafe fn create_raw_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        //SAFETY: Provenance and CI validity guaranteed by caller
        unsafe {
            self.handle
                .create_device(physical_device, create_info, None)
        }
    }

    pub fn ash_handle(&self) -> &ash::Instance {
        &self.handle
    }

    /// Whether `VK_EXT_debug_utils` was enabled on this instance.
    pub fn has_debug_utils(&self) -> bool {
        self.debug_messenger.is_some()
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Error fetching physical devices, memory exhaustion")]
    MemoryExhaustion,
    #[error("Error fetching physical devices, unknown vulkan: {0}")]
    UnknownVulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateRawSurfaceError {
    #[error("Error creating surface: {0}")]
    OnCreate(vk::Result),
    #[error("Unable to get display handle: {0}")]
    DisplayHandle(raw_window_handle::HandleError),
    #[error("Unable to get window handle: {0}")]
    WindowHandle(raw_window_handle::HandleError),
}

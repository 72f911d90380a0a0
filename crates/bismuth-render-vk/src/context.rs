// SPDX-License-Identifier: CEPL-1.0
//! Instance, debug messenger, device selection and the pipeline cache file.

use crate::convert::vk_err;
use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use bismuth_core::{EngineError, Result};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, c_void, CStr};
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, trace, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Creates the instance with the platform WSI extensions. Debug builds also
/// enable validation and debug utils when the loader offers both; the
/// returned flag says whether they were enabled.
pub(crate) unsafe fn create_instance(
    entry: &Entry,
    display_raw: RawDisplayHandle,
) -> Result<(Instance, bool)> {
    let app = c"bismuth";

    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: 0,
        p_engine_name: app.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let mut extensions = ash_window::enumerate_required_extensions(display_raw)
        .map_err(vk_err("enumerate_required_extensions"))?
        .to_vec();
    let mut layers: Vec<*const c_char> = Vec::new();

    let validation = cfg!(debug_assertions) && validation_available(entry);
    if validation {
        extensions.push(debug_utils::NAME.as_ptr());
        layers.push(VALIDATION_LAYER.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    let instance = entry
        .create_instance(&create_info, None)
        .map_err(vk_err("create_instance"))?;
    Ok((instance, validation))
}

unsafe fn validation_available(entry: &Entry) -> bool {
    let has_layer = entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default()
        .iter()
        .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER);
    let has_ext = entry
        .enumerate_instance_extension_properties(None)
        .unwrap_or_default()
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == debug_utils::NAME);
    if !(has_layer && has_ext) {
        warn!("validation layer not installed; running without it");
    }
    has_layer && has_ext
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!("[vulkan] {msg}");
    } else {
        trace!("[vulkan] {msg}");
    }
    vk::FALSE
}

pub(crate) struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    pub(crate) unsafe fn new(entry: &Entry, instance: &Instance) -> Result<Self> {
        let loader = debug_utils::Instance::new(entry, instance);
        let ci = vk::DebugUtilsMessengerCreateInfoEXT {
            s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
            message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            pfn_user_callback: Some(debug_callback),
            ..Default::default()
        };
        let messenger = loader
            .create_debug_utils_messenger(&ci, None)
            .map_err(vk_err("create_debug_utils_messenger"))?;
        Ok(Self { loader, messenger })
    }

    pub(crate) unsafe fn destroy(&self) {
        self.loader
            .destroy_debug_utils_messenger(self.messenger, None);
    }
}

/// First device (discrete GPUs ahead of the rest) with a queue family that
/// does graphics and can present to `surface`.
pub(crate) unsafe fn pick_device_and_queue(
    instance: &Instance,
    surf_i: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    let mut candidates = instance
        .enumerate_physical_devices()
        .map_err(vk_err("enumerate_physical_devices"))?;
    candidates.sort_by_key(|&phys| {
        instance.get_physical_device_properties(phys).device_type
            != vk::PhysicalDeviceType::DISCRETE_GPU
    });

    for phys in candidates {
        if !supports_swapchain(instance, phys) {
            continue;
        }
        let qprops = instance.get_physical_device_queue_family_properties(phys);

        for (i, q) in qprops.iter().enumerate() {
            if q.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                && surf_i
                    .get_physical_device_surface_support(phys, i as u32, surface)
                    .unwrap_or(false)
            {
                let props = instance.get_physical_device_properties(phys);
                info!(
                    "using {} ({:?}), queue family {i}",
                    CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy(),
                    props.device_type
                );
                return Ok((phys, i as u32));
            }
        }
    }
    Err(EngineError::device(
        "pick_device_and_queue",
        "no physical device with a graphics queue that can present to the window",
    ))
}

unsafe fn supports_swapchain(instance: &Instance, phys: vk::PhysicalDevice) -> bool {
    instance
        .enumerate_device_extension_properties(phys)
        .unwrap_or_default()
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME)
}

pub(crate) unsafe fn create_logical_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<(ash::Device, vk::Queue)> {
    let priorities = [1.0_f32];
    let qinfo = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };

    let device_exts = [swapchain::NAME.as_ptr()];
    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: 1,
        p_queue_create_infos: &qinfo,
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        ..Default::default()
    };

    let device = instance
        .create_device(phys, &dinfo, None)
        .map_err(vk_err("create_device"))?;
    let queue = device.get_device_queue(queue_family, 0);
    Ok((device, queue))
}

pub(crate) unsafe fn create_command_pool(
    device: &ash::Device,
    queue_family: u32,
) -> Result<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo {
        s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
        queue_family_index: queue_family,
        flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        ..Default::default()
    };
    device
        .create_command_pool(&pool_info, None)
        .map_err(vk_err("create_command_pool"))
}

pub(crate) const DEPTH_CANDIDATES: [vk::Format; 4] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D16_UNORM,
];

/// First candidate `attachable` accepts.
pub(crate) fn first_depth_format(attachable: impl Fn(vk::Format) -> bool) -> Option<vk::Format> {
    DEPTH_CANDIDATES.into_iter().find(|&fmt| attachable(fmt))
}

pub(crate) unsafe fn pick_depth_format(instance: &Instance, phys: vk::PhysicalDevice) -> vk::Format {
    let attachable = |fmt: vk::Format| {
        instance
            .get_physical_device_format_properties(phys, fmt)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    };
    first_depth_format(attachable).unwrap_or_else(|| {
        warn!("no depth candidate reports attachment support; assuming D32_SFLOAT");
        vk::Format::D32_SFLOAT
    })
}

pub(crate) fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D16_UNORM_S8_UINT
    )
}

pub(crate) fn find_memory_type(
    mem: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    req: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..mem.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0 && mem.memory_types[i as usize].property_flags.contains(req)
    })
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Cache files are keyed by vendor, device, driver and cache UUID so a driver
/// update never feeds stale data back in.
pub(crate) fn pipeline_cache_file_name(props: &vk::PhysicalDeviceProperties) -> String {
    let uuid = hex_bytes(&props.pipeline_cache_uuid);
    format!(
        "bismuth-{:04x}-{:04x}-{:08x}-{uuid}.pcache",
        props.vendor_id, props.device_id, props.driver_version
    )
}

pub(crate) unsafe fn create_or_load_pipeline_cache(
    device: &ash::Device,
    path: Option<&Path>,
) -> Result<vk::PipelineCache> {
    let data = path.and_then(|p| fs::read(p).ok()).unwrap_or_default();
    if !data.is_empty() {
        debug!("loaded {} bytes of pipeline cache", data.len());
    }

    let ci = vk::PipelineCacheCreateInfo {
        s_type: vk::StructureType::PIPELINE_CACHE_CREATE_INFO,
        initial_data_size: data.len(),
        p_initial_data: data.as_ptr().cast(),
        ..Default::default()
    };
    device
        .create_pipeline_cache(&ci, None)
        .map_err(vk_err("create_pipeline_cache"))
}

pub(crate) unsafe fn save_pipeline_cache(device: &ash::Device, cache: vk::PipelineCache, path: &Path) {
    let bytes = match device.get_pipeline_cache_data(cache) {
        Ok(bytes) => bytes,
        // Some drivers refuse when the cache is empty or the device is lost.
        Err(e) => {
            debug!("pipeline cache not saved: {e}");
            return;
        }
    };
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Err(e) = fs::write(path, &bytes) {
        warn!("writing pipeline cache to {} failed: {e}", path.display());
    }
}

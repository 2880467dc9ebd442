//! Vulkan instance creation and physical device selection.

use crate::error::{Result, VkError};
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};

/// Validation layers to enable when validation is requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Device extensions needed for acceleration structures and ray queries.
pub fn ray_tracing_device_extensions() -> [&'static CStr; 3] {
    [
        ash::khr::acceleration_structure::NAME,
        ash::khr::ray_query::NAME,
        ash::khr::deferred_host_operations::NAME,
    ]
}

/// Instance extensions: presentation extensions for `display`, plus debug
/// utils when validating.
fn instance_extensions(
    display: Option<RawDisplayHandle>,
    enable_validation: bool,
) -> Result<Vec<*const c_char>> {
    let mut extensions = match display {
        Some(display) => ash_window::enumerate_required_extensions(display)?.to_vec(),
        None => Vec::new(),
    };
    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
    Ok(extensions)
}

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    display: Option<RawDisplayHandle>,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| VkError::InvalidState(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Tessera")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names = instance_extensions(display, enable_validation)?;

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    let available_layers = entry.enumerate_instance_layer_properties()?;
    let layers: Vec<&CStr> = layers
        .into_iter()
        .filter(|layer| {
            let found = available_layers
                .iter()
                .any(|props| props.layer_name_as_c_str() == Ok(*layer));
            if !found {
                tracing::warn!("Validation layer {:?} not available", layer);
            }
            found
        })
        .collect();
    let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    Ok(entry.create_instance(&create_info, None)?)
}

/// Whether `extensions` names every extension in `required`.
pub fn has_extensions(extensions: &[vk::ExtensionProperties], required: &[&CStr]) -> bool {
    required.iter().all(|name| {
        extensions
            .iter()
            .any(|props| props.extension_name_as_c_str() == Ok(*name))
    })
}

/// Select the best physical device.
///
/// Devices below Vulkan 1.3 are skipped, as are devices without the ray
/// tracing extensions when `require_ray_tracing` is set.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    require_ray_tracing: bool,
) -> Result<vk::PhysicalDevice> {
    let devices = instance.enumerate_physical_devices()?;
    if devices.is_empty() {
        return Err(VkError::NoSuitableDevice);
    }

    let mut best_device = None;
    let mut best_score = 0i32;
    let mut rejected_for_ray_tracing = false;

    for device in devices {
        if require_ray_tracing {
            let extensions = instance
                .enumerate_device_extension_properties(device)
                .unwrap_or_default();
            if !has_extensions(&extensions, &ray_tracing_device_extensions()) {
                rejected_for_ray_tracing = true;
                continue;
            }
        }
        let score = score_physical_device(instance, device);
        if score > best_score {
            best_score = score;
            best_device = Some(device);
        }
    }

    match best_device {
        Some(device) => Ok(device),
        None if rejected_for_ray_tracing => Err(VkError::ExtensionNotSupported(
            ash::khr::acceleration_structure::NAME
                .to_string_lossy()
                .into_owned(),
        )),
        None => Err(VkError::NoSuitableDevice),
    }
}

/// Score a physical device for selection. Negative scores are unusable.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i32 {
    let properties = instance.get_physical_device_properties(device);

    let api_version = properties.api_version;
    if vk::api_version_major(api_version) < 1
        || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 3)
    {
        return -1;
    }

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 1,
    };

    let memory = instance.get_physical_device_memory_properties(device);
    let vram_mb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024))
        .sum();
    score += i32::try_from(vram_mb / 1024).unwrap_or(i32::MAX / 2);

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, &src) in props.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = src as c_char;
        }
        props
    }

    #[test]
    fn ray_tracing_needs_every_extension() {
        let mut available = vec![
            extension(ash::khr::acceleration_structure::NAME),
            extension(ash::khr::ray_query::NAME),
        ];
        assert!(!has_extensions(&available, &ray_tracing_device_extensions()));
        available.push(extension(ash::khr::deferred_host_operations::NAME));
        assert!(has_extensions(&available, &ray_tracing_device_extensions()));
    }

    #[test]
    fn headless_instances_need_no_presentation_extensions() {
        let extensions = instance_extensions(None, false).unwrap();
        #[cfg(not(target_os = "macos"))]
        assert!(extensions.is_empty());
        let validating = instance_extensions(None, true).unwrap();
        assert_eq!(validating.len(), extensions.len() + 1);
    }
}

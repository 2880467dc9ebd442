//! GPU capability detection.

use crate::format::depth_stencil_format;
use crate::instance::{has_extensions, ray_tracing_device_extensions};
use ash::vk;
use tessera_core::{DepthStencilAttachmentImageFormat, DeviceCapabilities};

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// What the physical device offers, before any feature is enabled.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    pub limits: vk::PhysicalDeviceLimits,
    pub texture_compression_bc: bool,
    pub texture_compression_astc: bool,
    /// The ray tracing extensions are all present.
    pub ray_tracing: bool,
    /// `minAccelerationStructureScratchOffsetAlignment`, when ray tracing is present.
    pub scratch_offset_alignment: u64,
    pub depth_attachment_format: DepthStencilAttachmentImageFormat,
    pub depth_stencil_attachment_format: DepthStencilAttachmentImageFormat,
}

/// First candidate that supports sampled depth-stencil attachments, or the
/// last one when none does.
pub fn pick_depth_format(
    candidates: &[DepthStencilAttachmentImageFormat],
    mut supported: impl FnMut(DepthStencilAttachmentImageFormat) -> bool,
) -> DepthStencilAttachmentImageFormat {
    use DepthStencilAttachmentImageFormat as F;
    candidates
        .iter()
        .copied()
        .find(|&format| supported(format))
        .or_else(|| candidates.last().copied())
        .unwrap_or(F::D32Sfloat)
}

impl AdapterInfo {
    /// Query a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);
        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();
        let ray_tracing = has_extensions(&extensions, &ray_tracing_device_extensions());

        let scratch_offset_alignment = if ray_tracing {
            let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
            let mut properties2 =
                vk::PhysicalDeviceProperties2::default().push_next(&mut as_properties);
            instance.get_physical_device_properties2(physical_device, &mut properties2);
            u64::from(as_properties.min_acceleration_structure_scratch_offset_alignment)
        } else {
            0
        };

        let mut supported = |format| {
            let properties = instance
                .get_physical_device_format_properties(physical_device, depth_stencil_format(format));
            properties.optimal_tiling_features.contains(
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
                    | vk::FormatFeatureFlags::SAMPLED_IMAGE,
            )
        };
        let depth_attachment_format = pick_depth_format(
            &[
                DepthStencilAttachmentImageFormat::D32Sfloat,
                DepthStencilAttachmentImageFormat::X8D24UnormPack32,
            ],
            &mut supported,
        );
        let depth_stencil_attachment_format = pick_depth_format(
            &[
                DepthStencilAttachmentImageFormat::D32SfloatS8Uint,
                DepthStencilAttachmentImageFormat::D24UnormS8Uint,
            ],
            &mut supported,
        );

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            api_version: properties.api_version,
            limits: properties.limits,
            texture_compression_bc: features.texture_compression_bc == vk::TRUE,
            texture_compression_astc: features.texture_compression_astc_ldr == vk::TRUE,
            ray_tracing,
            scratch_offset_alignment,
            depth_attachment_format,
            depth_stencil_attachment_format,
        }
    }

    /// Capabilities reported once the device is created with `ray_tracing`
    /// enabled and the given queue layout.
    pub fn device_capabilities(
        &self,
        backend: &'static str,
        ray_tracing: bool,
        dedicated_upload_queue: bool,
    ) -> DeviceCapabilities {
        let limits = &self.limits;
        DeviceCapabilities {
            backend,
            device_name: self.device_name.clone(),
            ray_tracing,
            dedicated_upload_queue,
            texture_compression_bc: self.texture_compression_bc,
            texture_compression_astc: self.texture_compression_astc,
            uniform_buffer_offset_alignment: power_of_two(limits.min_uniform_buffer_offset_alignment),
            storage_buffer_offset_alignment: power_of_two(limits.min_storage_buffer_offset_alignment),
            // Block-compressed copies need offsets aligned to the 16-byte block.
            staging_buffer_offset_alignment: power_of_two(
                limits.optimal_buffer_copy_offset_alignment.max(16),
            ),
            staging_buffer_row_pitch_alignment: power_of_two(
                limits.optimal_buffer_copy_row_pitch_alignment,
            ),
            scratch_offset_alignment: power_of_two(self.scratch_offset_alignment.max(128)),
            depth_attachment_format: self.depth_attachment_format,
            depth_stencil_attachment_format: self.depth_stencil_attachment_format,
        }
    }

    /// Get a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
        )
    }
}

/// Smallest power of two not below `value`, at least 1.
fn power_of_two(value: u64) -> u64 {
    value.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> AdapterInfo {
        AdapterInfo {
            vendor: GpuVendor::from_vendor_id(0x1002),
            device_name: "Test GPU".to_string(),
            api_version: vk::API_VERSION_1_3,
            limits: vk::PhysicalDeviceLimits {
                min_uniform_buffer_offset_alignment: 64,
                min_storage_buffer_offset_alignment: 16,
                optimal_buffer_copy_offset_alignment: 1,
                optimal_buffer_copy_row_pitch_alignment: 0,
                ..Default::default()
            },
            texture_compression_bc: true,
            texture_compression_astc: false,
            ray_tracing: true,
            scratch_offset_alignment: 256,
            depth_attachment_format: DepthStencilAttachmentImageFormat::D32Sfloat,
            depth_stencil_attachment_format: DepthStencilAttachmentImageFormat::D24UnormS8Uint,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn limits_become_power_of_two_alignments() {
        let caps = adapter().device_capabilities("vulkan", true, true);
        assert_eq!(caps.uniform_buffer_offset_alignment, 64);
        assert_eq!(caps.storage_buffer_offset_alignment, 16);
        assert_eq!(caps.staging_buffer_offset_alignment, 16);
        assert_eq!(caps.staging_buffer_row_pitch_alignment, 1);
        assert_eq!(caps.scratch_offset_alignment, 256);
        assert!(caps.dedicated_upload_queue);
        assert!(caps.supports_format(tessera_core::SampledAssetImageFormat::Bc7Srgb));
        assert!(!caps.supports_format(tessera_core::SampledAssetImageFormat::Astc4x4Unorm));
    }

    #[test]
    fn depth_format_falls_back_in_order() {
        use DepthStencilAttachmentImageFormat as F;
        let candidates = [F::D32SfloatS8Uint, F::D24UnormS8Uint];
        assert_eq!(pick_depth_format(&candidates, |_| true), F::D32SfloatS8Uint);
        assert_eq!(
            pick_depth_format(&candidates, |f| f == F::D24UnormS8Uint),
            F::D24UnormS8Uint
        );
        assert_eq!(pick_depth_format(&candidates, |_| false), F::D24UnormS8Uint);
    }

    #[test]
    fn summary_names_device_and_version() {
        let summary = adapter().summary();
        assert!(summary.contains("Test GPU"));
        assert!(summary.contains("Amd"));
        assert!(summary.contains("1.3.0"));
    }
}

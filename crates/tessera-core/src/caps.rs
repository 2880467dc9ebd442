//! Device capability reporting.

use crate::align_up;
use crate::format::{DepthStencilAttachmentImageFormat, SampledAssetImageFormat};

/// Capabilities and alignment requirements reported by a device.
///
/// Creating a resource that needs an unsupported capability is a caller
/// contract violation; query these predicates first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Backend name, e.g. `"vulkan"`.
    pub backend: &'static str,
    pub device_name: String,
    /// Acceleration structures and ray queries are available.
    pub ray_tracing: bool,
    /// Uploads run on a queue family distinct from the graphics family.
    pub dedicated_upload_queue: bool,
    pub texture_compression_bc: bool,
    pub texture_compression_astc: bool,
    pub uniform_buffer_offset_alignment: u64,
    pub storage_buffer_offset_alignment: u64,
    pub staging_buffer_offset_alignment: u64,
    pub staging_buffer_row_pitch_alignment: u64,
    pub scratch_offset_alignment: u64,
    /// Depth-only format usable as a sampled attachment on this device.
    pub depth_attachment_format: DepthStencilAttachmentImageFormat,
    /// Depth-stencil format usable as a sampled attachment on this device.
    pub depth_stencil_attachment_format: DepthStencilAttachmentImageFormat,
}

impl DeviceCapabilities {
    /// Whether sampled asset images of `format` can be created.
    pub const fn supports_format(&self, format: SampledAssetImageFormat) -> bool {
        if format.is_bc() {
            self.texture_compression_bc
        } else if format.is_astc() {
            self.texture_compression_astc
        } else {
            true
        }
    }

    /// Round a dynamic uniform offset up to the device alignment.
    pub const fn align_uniform_offset(&self, offset: u64) -> u64 {
        align_up(offset, self.uniform_buffer_offset_alignment)
    }

    /// Round a staging source offset up to the device alignment.
    pub const fn align_staging_offset(&self, offset: u64) -> u64 {
        align_up(offset, self.staging_buffer_offset_alignment)
    }

    /// Row pitch for uploading `width` texels of `format` from staging memory.
    pub const fn staging_row_pitch(&self, format: SampledAssetImageFormat, width: u32) -> u64 {
        align_up(
            format.row_size(width) as u64,
            self.staging_buffer_row_pitch_alignment,
        )
    }

    /// One-line summary for logging.
    pub fn summary(&self) -> String {
        format!(
            "{} [{}] - ray tracing: {}, upload queue: {}, BC: {}, ASTC: {}",
            self.device_name,
            self.backend,
            self.ray_tracing,
            if self.dedicated_upload_queue {
                "dedicated"
            } else {
                "unified"
            },
            self.texture_compression_bc,
            self.texture_compression_astc,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> DeviceCapabilities {
        DeviceCapabilities {
            backend: "test",
            device_name: "test device".to_string(),
            ray_tracing: true,
            dedicated_upload_queue: false,
            texture_compression_bc: true,
            texture_compression_astc: false,
            uniform_buffer_offset_alignment: 256,
            storage_buffer_offset_alignment: 16,
            staging_buffer_offset_alignment: 512,
            staging_buffer_row_pitch_alignment: 256,
            scratch_offset_alignment: 128,
            depth_attachment_format: DepthStencilAttachmentImageFormat::D32Sfloat,
            depth_stencil_attachment_format: DepthStencilAttachmentImageFormat::D24UnormS8Uint,
        }
    }

    #[test]
    fn format_support_follows_compression_flags() {
        let caps = caps();
        assert!(caps.supports_format(SampledAssetImageFormat::R8G8B8A8Srgb));
        assert!(caps.supports_format(SampledAssetImageFormat::Bc7Unorm));
        assert!(!caps.supports_format(SampledAssetImageFormat::Astc4x4Srgb));
    }

    #[test]
    fn staging_pitch_is_aligned() {
        let caps = caps();
        assert_eq!(
            caps.staging_row_pitch(SampledAssetImageFormat::R8G8B8A8Unorm, 10),
            256
        );
        assert_eq!(
            caps.staging_row_pitch(SampledAssetImageFormat::R8G8B8A8Unorm, 100),
            512
        );
        assert_eq!(caps.align_uniform_offset(300), 512);
    }
}

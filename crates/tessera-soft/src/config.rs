//! Software device configuration.

use tessera_core::{DepthStencilAttachmentImageFormat, DeviceCapabilities};

/// Configuration of an emulated device.
///
/// The defaults describe a desktop-class device with ray tracing, a dedicated
/// upload queue family and BC compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftConfig {
    pub device_name: String,
    pub ray_tracing: bool,
    /// Emulate a distinct upload queue family. When `false` both logical
    /// queues share one family.
    pub dedicated_upload_queue: bool,
    pub texture_compression_bc: bool,
    pub texture_compression_astc: bool,
    pub uniform_buffer_offset_alignment: u64,
    pub storage_buffer_offset_alignment: u64,
    pub staging_buffer_offset_alignment: u64,
    pub staging_buffer_row_pitch_alignment: u64,
    pub scratch_offset_alignment: u64,
}

impl Default for SoftConfig {
    fn default() -> Self {
        Self {
            device_name: "Tessera Software Device".to_string(),
            ray_tracing: true,
            dedicated_upload_queue: true,
            texture_compression_bc: true,
            texture_compression_astc: false,
            uniform_buffer_offset_alignment: 256,
            storage_buffer_offset_alignment: 64,
            staging_buffer_offset_alignment: 16,
            staging_buffer_row_pitch_alignment: 256,
            scratch_offset_alignment: 128,
        }
    }
}

impl SoftConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    #[must_use]
    pub const fn ray_tracing(mut self, enabled: bool) -> Self {
        self.ray_tracing = enabled;
        self
    }

    #[must_use]
    pub const fn dedicated_upload_queue(mut self, dedicated: bool) -> Self {
        self.dedicated_upload_queue = dedicated;
        self
    }

    /// Emulate a single-queue device with mobile texture compression.
    #[must_use]
    pub const fn unified(mut self) -> Self {
        self.dedicated_upload_queue = false;
        self.texture_compression_bc = false;
        self.texture_compression_astc = true;
        self
    }

    #[must_use]
    pub const fn texture_compression(mut self, bc: bool, astc: bool) -> Self {
        self.texture_compression_bc = bc;
        self.texture_compression_astc = astc;
        self
    }

    #[must_use]
    pub const fn uniform_buffer_offset_alignment(mut self, alignment: u64) -> Self {
        self.uniform_buffer_offset_alignment = alignment;
        self
    }

    #[must_use]
    pub const fn staging_buffer_alignment(mut self, offset: u64, row_pitch: u64) -> Self {
        self.staging_buffer_offset_alignment = offset;
        self.staging_buffer_row_pitch_alignment = row_pitch;
        self
    }

    pub(crate) fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            backend: crate::SoftApi::BACKEND_NAME,
            device_name: self.device_name.clone(),
            ray_tracing: self.ray_tracing,
            dedicated_upload_queue: self.dedicated_upload_queue,
            texture_compression_bc: self.texture_compression_bc,
            texture_compression_astc: self.texture_compression_astc,
            uniform_buffer_offset_alignment: self.uniform_buffer_offset_alignment,
            storage_buffer_offset_alignment: self.storage_buffer_offset_alignment,
            staging_buffer_offset_alignment: self.staging_buffer_offset_alignment,
            staging_buffer_row_pitch_alignment: self.staging_buffer_row_pitch_alignment,
            scratch_offset_alignment: self.scratch_offset_alignment,
            depth_attachment_format: DepthStencilAttachmentImageFormat::D32Sfloat,
            depth_stencil_attachment_format: DepthStencilAttachmentImageFormat::D32SfloatS8Uint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::SampledAssetImageFormat;

    #[test]
    fn unified_preset_swaps_compression_family() {
        let caps = SoftConfig::new().unified().capabilities();
        assert!(!caps.dedicated_upload_queue);
        assert!(caps.supports_format(SampledAssetImageFormat::Astc4x4Srgb));
        assert!(!caps.supports_format(SampledAssetImageFormat::Bc7Unorm));
        assert!(caps.supports_format(SampledAssetImageFormat::R8G8B8A8Unorm));
    }

    #[test]
    fn builder_overrides_alignments() {
        let caps = SoftConfig::new()
            .uniform_buffer_offset_alignment(64)
            .staging_buffer_alignment(4, 128)
            .capabilities();
        assert_eq!(caps.align_uniform_offset(65), 128);
        assert_eq!(caps.align_staging_offset(5), 8);
        assert_eq!(
            caps.staging_row_pitch(SampledAssetImageFormat::R8G8B8A8Unorm, 3),
            128
        );
    }
}

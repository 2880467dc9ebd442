//! Closed format, compare and descriptor enumerations.
//!
//! Each backend translates these 1:1 into its native equivalents.

/// Formats available to sampled asset images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampledAssetImageFormat {
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    Bc7Unorm,
    Bc7Srgb,
    Astc4x4Unorm,
    Astc4x4Srgb,
}

impl SampledAssetImageFormat {
    pub const ALL: [Self; 6] = [
        Self::R8G8B8A8Unorm,
        Self::R8G8B8A8Srgb,
        Self::Bc7Unorm,
        Self::Bc7Srgb,
        Self::Astc4x4Unorm,
        Self::Astc4x4Srgb,
    ];

    /// Whether the format uses BC block compression.
    pub const fn is_bc(self) -> bool {
        matches!(self, Self::Bc7Unorm | Self::Bc7Srgb)
    }

    /// Whether the format uses ASTC block compression.
    pub const fn is_astc(self) -> bool {
        matches!(self, Self::Astc4x4Unorm | Self::Astc4x4Srgb)
    }

    /// Width and height in texels of one block.
    pub const fn block_extent(self) -> (u32, u32) {
        match self {
            Self::R8G8B8A8Unorm | Self::R8G8B8A8Srgb => (1, 1),
            Self::Bc7Unorm | Self::Bc7Srgb | Self::Astc4x4Unorm | Self::Astc4x4Srgb => (4, 4),
        }
    }

    /// Size in bytes of one block.
    pub const fn block_size(self) -> u32 {
        match self {
            Self::R8G8B8A8Unorm | Self::R8G8B8A8Srgb => 4,
            Self::Bc7Unorm | Self::Bc7Srgb | Self::Astc4x4Unorm | Self::Astc4x4Srgb => 16,
        }
    }

    /// Tightly packed size in bytes of one row of blocks.
    pub const fn row_size(self, width: u32) -> u32 {
        let (block_width, _) = self.block_extent();
        width.div_ceil(block_width) * self.block_size()
    }

    /// Number of block rows covering `height` texels.
    pub const fn row_count(self, height: u32) -> u32 {
        let (_, block_height) = self.block_extent();
        height.div_ceil(block_height)
    }
}

/// Extent of mip level `level` for a base extent.
#[inline]
pub const fn mip_extent(base: u32, level: u32) -> u32 {
    let extent = base >> level;
    if extent == 0 {
        1
    } else {
        extent
    }
}

/// Formats available to color attachment images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorAttachmentImageFormat {
    B8G8R8A8Unorm,
    R8G8B8A8Unorm,
    A2B10G10R10UnormPack32,
    A2R10G10B10UnormPack32,
    R16G16Unorm,
    R32G32B32A32Uint,
}

impl ColorAttachmentImageFormat {
    pub const ALL: [Self; 6] = [
        Self::B8G8R8A8Unorm,
        Self::R8G8B8A8Unorm,
        Self::A2B10G10R10UnormPack32,
        Self::A2R10G10B10UnormPack32,
        Self::R16G16Unorm,
        Self::R32G32B32A32Uint,
    ];

    /// Size in bytes of one texel.
    pub const fn texel_size(self) -> u32 {
        match self {
            Self::R32G32B32A32Uint => 16,
            _ => 4,
        }
    }

    /// Encode a clear color as one texel.
    ///
    /// Normalized channels are clamped to `[0, 1]`; integer channels are
    /// truncated.
    pub fn encode_clear(self, color: [f32; 4]) -> Vec<u8> {
        let unorm = |value: f32, max: u32| (value.clamp(0.0, 1.0) * max as f32).round() as u32;
        let [r, g, b, a] = color;
        match self {
            Self::B8G8R8A8Unorm => vec![
                unorm(b, 255) as u8,
                unorm(g, 255) as u8,
                unorm(r, 255) as u8,
                unorm(a, 255) as u8,
            ],
            Self::R8G8B8A8Unorm => color.map(|c| unorm(c, 255) as u8).to_vec(),
            Self::A2B10G10R10UnormPack32 => {
                let packed = unorm(a, 3) << 30 | unorm(b, 1023) << 20 | unorm(g, 1023) << 10 | unorm(r, 1023);
                packed.to_le_bytes().to_vec()
            }
            Self::A2R10G10B10UnormPack32 => {
                let packed = unorm(a, 3) << 30 | unorm(r, 1023) << 20 | unorm(g, 1023) << 10 | unorm(b, 1023);
                packed.to_le_bytes().to_vec()
            }
            Self::R16G16Unorm => [r, g]
                .iter()
                .flat_map(|&c| (unorm(c, 0xffff) as u16).to_le_bytes())
                .collect(),
            Self::R32G32B32A32Uint => color
                .iter()
                .flat_map(|&c| (c.max(0.0) as u32).to_le_bytes())
                .collect(),
        }
    }
}

/// Formats available to depth and depth-stencil attachment images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthStencilAttachmentImageFormat {
    D32Sfloat,
    X8D24UnormPack32,
    D32SfloatS8Uint,
    D24UnormS8Uint,
}

impl DepthStencilAttachmentImageFormat {
    /// Whether the format carries a stencil aspect.
    pub const fn has_stencil(self) -> bool {
        matches!(self, Self::D32SfloatS8Uint | Self::D24UnormS8Uint)
    }

    /// Size in bytes of the depth part of one texel.
    pub const fn depth_size(self) -> u32 {
        4
    }
}

/// Formats available to storage images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageImageFormat {
    R16Sfloat,
    R16G16B16A16Sfloat,
    R32Uint,
}

impl StorageImageFormat {
    /// Size in bytes of one texel.
    pub const fn texel_size(self) -> u32 {
        match self {
            Self::R16Sfloat => 2,
            Self::R16G16B16A16Sfloat => 8,
            Self::R32Uint => 4,
        }
    }
}

/// Depth comparison of a graphics pipeline with depth testing enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Greater,
    Less,
    Always,
}

impl CompareOp {
    /// Whether a fragment at `incoming` depth passes against `stored`.
    pub fn passes(self, incoming: f32, stored: f32) -> bool {
        match self {
            Self::Greater => incoming > stored,
            Self::Less => incoming < stored,
            Self::Always => true,
        }
    }
}

/// Texel filter of a sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerFilter {
    Nearest,
    #[default]
    Linear,
}

/// Vertex position formats accepted as acceleration structure build input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexFormat {
    #[default]
    R32G32B32Sfloat,
}

impl VertexFormat {
    /// Size in bytes of one vertex position.
    pub const fn size(self) -> u32 {
        match self {
            Self::R32G32B32Sfloat => 12,
        }
    }
}

/// Index element types. A geometry without indices carries no index type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    /// Size in bytes of one index.
    pub const fn size(self) -> u32 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Descriptor types a descriptor set layout binding may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    DynamicUniformBuffer,
    ReadOnlyStorageBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
    Sampler,
    TopLevelAccelerationStructure,
}

/// One binding of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub count: u32,
}

impl DescriptorBinding {
    /// A binding holding a single descriptor.
    pub const fn single(binding: u32, descriptor_type: DescriptorType) -> Self {
        Self {
            binding,
            descriptor_type,
            count: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncompressed_rows_are_texel_sized() {
        let format = SampledAssetImageFormat::R8G8B8A8Unorm;
        assert_eq!(format.row_size(17), 68);
        assert_eq!(format.row_count(9), 9);
    }

    #[test]
    fn block_compressed_rows_round_up_to_blocks() {
        let format = SampledAssetImageFormat::Bc7Srgb;
        assert!(format.is_bc());
        assert!(!format.is_astc());
        assert_eq!(format.row_size(5), 32);
        assert_eq!(format.row_count(1), 1);
        assert_eq!(SampledAssetImageFormat::Astc4x4Unorm.row_size(16), 64);
    }

    #[test]
    fn clear_colors_pack_per_format() {
        let color = [1.0, 0.5, 0.0, 1.0];
        assert_eq!(
            ColorAttachmentImageFormat::R8G8B8A8Unorm.encode_clear(color),
            [255, 128, 0, 255]
        );
        assert_eq!(
            ColorAttachmentImageFormat::B8G8R8A8Unorm.encode_clear(color),
            [0, 128, 255, 255]
        );
        let packed = ColorAttachmentImageFormat::A2B10G10R10UnormPack32.encode_clear([1.0, 0.0, 0.0, 0.0]);
        assert_eq!(u32::from_le_bytes(packed.try_into().unwrap()), 1023);
        for format in ColorAttachmentImageFormat::ALL {
            assert_eq!(format.encode_clear(color).len(), format.texel_size() as usize);
        }
    }

    #[test]
    fn compare_ops() {
        assert!(CompareOp::Greater.passes(0.7, 0.5));
        assert!(!CompareOp::Greater.passes(0.5, 0.5));
        assert!(CompareOp::Less.passes(0.2, 0.5));
        assert!(CompareOp::Always.passes(1.0, 0.0));
        assert!(DepthStencilAttachmentImageFormat::D24UnormS8Uint.has_stencil());
        assert!(!DepthStencilAttachmentImageFormat::X8D24UnormPack32.has_stencil());
    }

    #[test]
    fn mip_extent_clamps_to_one() {
        assert_eq!(mip_extent(256, 0), 256);
        assert_eq!(mip_extent(256, 3), 32);
        assert_eq!(mip_extent(3, 4), 1);
    }
}

//! Translation of backend-neutral enums into Vulkan equivalents.

use ash::vk;
use gpu_allocator::MemoryLocation;
use tessera_core::{
    BufferKind, ColorAttachmentImageFormat, ColorLoadOp, ColorStoreOp, CompareOp,
    DepthStencilAttachmentImageFormat, DepthStencilLoadOp, DepthStencilStoreOp, DescriptorType,
    IndexType, MemoryUsage, SampledAssetImageFormat, SamplerFilter, StorageImageFormat,
    TargetImageKind, VertexFormat,
};
use tessera_hal::transfer::{Access, ImageLayout};

pub const fn sampled_format(format: SampledAssetImageFormat) -> vk::Format {
    match format {
        SampledAssetImageFormat::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        SampledAssetImageFormat::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
        SampledAssetImageFormat::Bc7Unorm => vk::Format::BC7_UNORM_BLOCK,
        SampledAssetImageFormat::Bc7Srgb => vk::Format::BC7_SRGB_BLOCK,
        SampledAssetImageFormat::Astc4x4Unorm => vk::Format::ASTC_4X4_UNORM_BLOCK,
        SampledAssetImageFormat::Astc4x4Srgb => vk::Format::ASTC_4X4_SRGB_BLOCK,
    }
}

pub const fn color_format(format: ColorAttachmentImageFormat) -> vk::Format {
    match format {
        ColorAttachmentImageFormat::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        ColorAttachmentImageFormat::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        ColorAttachmentImageFormat::A2B10G10R10UnormPack32 => vk::Format::A2B10G10R10_UNORM_PACK32,
        ColorAttachmentImageFormat::A2R10G10B10UnormPack32 => vk::Format::A2R10G10B10_UNORM_PACK32,
        ColorAttachmentImageFormat::R16G16Unorm => vk::Format::R16G16_UNORM,
        ColorAttachmentImageFormat::R32G32B32A32Uint => vk::Format::R32G32B32A32_UINT,
    }
}

pub const fn depth_stencil_format(format: DepthStencilAttachmentImageFormat) -> vk::Format {
    match format {
        DepthStencilAttachmentImageFormat::D32Sfloat => vk::Format::D32_SFLOAT,
        DepthStencilAttachmentImageFormat::X8D24UnormPack32 => vk::Format::X8_D24_UNORM_PACK32,
        DepthStencilAttachmentImageFormat::D32SfloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
        DepthStencilAttachmentImageFormat::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
    }
}

pub const fn storage_format(format: StorageImageFormat) -> vk::Format {
    match format {
        StorageImageFormat::R16Sfloat => vk::Format::R16_SFLOAT,
        StorageImageFormat::R16G16B16A16Sfloat => vk::Format::R16G16B16A16_SFLOAT,
        StorageImageFormat::R32Uint => vk::Format::R32_UINT,
    }
}

/// Native format, usage and aspect of a target image.
pub fn target_image_desc(
    kind: TargetImageKind,
    allow_sampled: bool,
) -> (vk::Format, vk::ImageUsageFlags, vk::ImageAspectFlags) {
    let (format, usage, aspect) = match kind {
        TargetImageKind::ColorAttachment(format) => (
            color_format(format),
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
            vk::ImageAspectFlags::COLOR,
        ),
        TargetImageKind::DepthStencilAttachment(format) => (
            depth_stencil_format(format),
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            if format.has_stencil() {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            } else {
                vk::ImageAspectFlags::DEPTH
            },
        ),
        TargetImageKind::Storage(format) => (
            storage_format(format),
            vk::ImageUsageFlags::STORAGE,
            vk::ImageAspectFlags::COLOR,
        ),
    };
    let usage = match (kind, allow_sampled) {
        (_, true) => usage | vk::ImageUsageFlags::SAMPLED,
        (TargetImageKind::Storage(_), false) => usage,
        (_, false) => usage | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
    };
    (format, usage, aspect)
}

pub const fn compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub const fn sampler_filter(filter: SamplerFilter) -> (vk::Filter, vk::SamplerMipmapMode) {
    match filter {
        SamplerFilter::Nearest => (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST),
        SamplerFilter::Linear => (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR),
    }
}

pub const fn color_load_op(op: ColorLoadOp) -> vk::AttachmentLoadOp {
    match op {
        ColorLoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        ColorLoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
    }
}

/// Store op and final layout of a color attachment.
pub const fn color_store(op: ColorStoreOp) -> (vk::AttachmentStoreOp, vk::ImageLayout) {
    match op {
        ColorStoreOp::DontCare => (
            vk::AttachmentStoreOp::DONT_CARE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ),
        ColorStoreOp::FlushForSampledImage => (
            vk::AttachmentStoreOp::STORE,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ),
        ColorStoreOp::FlushForPresent => {
            (vk::AttachmentStoreOp::STORE, vk::ImageLayout::PRESENT_SRC_KHR)
        }
    }
}

pub const fn depth_stencil_load_op(op: DepthStencilLoadOp) -> vk::AttachmentLoadOp {
    match op {
        DepthStencilLoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        DepthStencilLoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
    }
}

/// Store op and final layout of a depth-stencil attachment.
pub const fn depth_stencil_store(op: DepthStencilStoreOp) -> (vk::AttachmentStoreOp, vk::ImageLayout) {
    match op {
        DepthStencilStoreOp::DontCare => (
            vk::AttachmentStoreOp::DONT_CARE,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),
        DepthStencilStoreOp::FlushForSampledImage => (
            vk::AttachmentStoreOp::STORE,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ),
    }
}

pub const fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::R32G32B32Sfloat => vk::Format::R32G32B32_SFLOAT,
    }
}

pub const fn index_type(index_type: IndexType) -> vk::IndexType {
    match index_type {
        IndexType::U16 => vk::IndexType::UINT16,
        IndexType::U32 => vk::IndexType::UINT32,
    }
}

pub const fn descriptor_type(descriptor_type: DescriptorType) -> vk::DescriptorType {
    match descriptor_type {
        DescriptorType::DynamicUniformBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        DescriptorType::ReadOnlyStorageBuffer | DescriptorType::StorageBuffer => {
            vk::DescriptorType::STORAGE_BUFFER
        }
        DescriptorType::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorType::TopLevelAccelerationStructure => {
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
        }
    }
}

pub const fn memory_location(usage: MemoryUsage) -> MemoryLocation {
    match usage {
        MemoryUsage::HostUpload => MemoryLocation::CpuToGpu,
        MemoryUsage::DeviceLocal => MemoryLocation::GpuOnly,
        MemoryUsage::HostReadback => MemoryLocation::GpuToCpu,
    }
}

/// Usage flags of a buffer kind. Device addresses and build-input usage are
/// only requested when acceleration structures are enabled.
pub fn buffer_usage(kind: BufferKind, ray_tracing: bool) -> vk::BufferUsageFlags {
    let build_input = if ray_tracing {
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
    } else {
        vk::BufferUsageFlags::empty()
    };
    match kind {
        BufferKind::UniformUpload => vk::BufferUsageFlags::UNIFORM_BUFFER,
        BufferKind::StagingUpload => vk::BufferUsageFlags::TRANSFER_SRC,
        BufferKind::StorageIntermediate => {
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST | build_input
        }
        BufferKind::StorageAsset => {
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST | build_input
        }
        BufferKind::Scratch => {
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        }
        BufferKind::TlasInstanceUpload => build_input,
        BufferKind::Readback => {
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        }
    }
}

pub const fn image_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::TransferDestination => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

/// Pipeline stages and access flags covering `access`.
///
/// Acceleration structure stages are dropped when ray tracing is disabled,
/// since they are invalid without the extension.
pub fn access_scope(access: Access, ray_tracing: bool) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    let mut stages = vk::PipelineStageFlags2::empty();
    let mut flags = vk::AccessFlags2::empty();
    if access.contains(Access::TRANSFER_WRITE) {
        stages |= vk::PipelineStageFlags2::TRANSFER;
        flags |= vk::AccessFlags2::TRANSFER_WRITE;
    }
    if access.contains(Access::SHADER_READ) {
        stages |= vk::PipelineStageFlags2::COMPUTE_SHADER;
        flags |= vk::AccessFlags2::SHADER_READ;
    }
    if ray_tracing {
        if access.contains(Access::BUILD_INPUT_READ) {
            stages |= vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR;
            flags |= vk::AccessFlags2::SHADER_READ;
        }
        if access.contains(Access::ACCELERATION_STRUCTURE_WRITE) {
            stages |= vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR;
            flags |= vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR;
        }
        if access.contains(Access::ACCELERATION_STRUCTURE_READ) {
            stages |= vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags2::COMPUTE_SHADER;
            flags |= vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR;
        }
    }
    if stages.is_empty() {
        stages = vk::PipelineStageFlags2::NONE;
    }
    (stages, flags)
}

/// Texel row length and image height of a staged mip, as Vulkan expects them.
pub const fn staged_extent(
    format: SampledAssetImageFormat,
    row_pitch: u32,
    row_count: u32,
) -> (u32, u32) {
    let (block_width, block_height) = format.block_extent();
    (
        row_pitch / format.block_size() * block_width,
        row_count * block_height,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_and_writable_storage_share_a_native_type() {
        assert_eq!(
            descriptor_type(DescriptorType::ReadOnlyStorageBuffer),
            descriptor_type(DescriptorType::StorageBuffer)
        );
        assert_eq!(
            descriptor_type(DescriptorType::DynamicUniformBuffer),
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        );
    }

    #[test]
    fn build_inputs_need_device_addresses_only_with_ray_tracing() {
        let with = buffer_usage(BufferKind::StorageAsset, true);
        let without = buffer_usage(BufferKind::StorageAsset, false);
        assert!(with.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        assert!(!without.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        assert!(without.contains(vk::BufferUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn acceleration_structure_stages_require_ray_tracing() {
        let (stages, flags) = access_scope(Access::ACCELERATION_STRUCTURE_READ, false);
        assert_eq!(stages, vk::PipelineStageFlags2::NONE);
        assert!(flags.is_empty());

        let (stages, flags) = access_scope(Access::ACCELERATION_STRUCTURE_READ, true);
        assert!(stages.contains(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR));
        assert!(flags.contains(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR));
    }

    #[test]
    fn transient_attachments_are_not_sampled() {
        let color = TargetImageKind::ColorAttachment(ColorAttachmentImageFormat::B8G8R8A8Unorm);
        let (format, usage, aspect) = target_image_desc(color, false);
        assert_eq!(format, vk::Format::B8G8R8A8_UNORM);
        assert!(usage.contains(vk::ImageUsageFlags::TRANSIENT_ATTACHMENT));
        assert!(!usage.contains(vk::ImageUsageFlags::SAMPLED));
        assert_eq!(aspect, vk::ImageAspectFlags::COLOR);

        let depth = TargetImageKind::DepthStencilAttachment(DepthStencilAttachmentImageFormat::D24UnormS8Uint);
        let (_, usage, aspect) = target_image_desc(depth, true);
        assert!(usage.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(aspect.contains(vk::ImageAspectFlags::STENCIL));

        let storage = TargetImageKind::Storage(StorageImageFormat::R16Sfloat);
        let (_, usage, _) = target_image_desc(storage, false);
        assert_eq!(usage, vk::ImageUsageFlags::STORAGE);
    }

    #[test]
    fn store_ops_pick_the_next_layout() {
        assert_eq!(
            color_store(ColorStoreOp::FlushForPresent).1,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(
            depth_stencil_store(DepthStencilStoreOp::FlushForSampledImage),
            (vk::AttachmentStoreOp::STORE, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        );
        assert_eq!(compare_op(CompareOp::Greater), vk::CompareOp::GREATER);
    }

    #[test]
    fn staged_extent_counts_texels() {
        // 256-byte pitch of BC7 blocks holds 16 blocks, 64 texels.
        assert_eq!(staged_extent(SampledAssetImageFormat::Bc7Unorm, 256, 2), (64, 8));
        assert_eq!(staged_extent(SampledAssetImageFormat::R8G8B8A8Unorm, 256, 3), (64, 3));
    }
}

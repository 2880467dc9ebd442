//! Buffers, images, samplers, acceleration structures and query pools.

use crate::memory::{BufferAllocation, ImageAllocation};
use ash::vk;
use std::fmt;
use tessera_core::{
    AccelerationStructureKind, BufferKind, Capabilities, GeometryDesc, ResourceId, Result,
    SampledAssetImageFormat, SamplerFilter, TargetImageKind, SAMPLED_ASSET_IMAGE_CAPABILITIES,
};
use tessera_hal::{AccelerationStructure, Buffer, Image, OwnershipCell, Resource, TargetImage};

/// A Vulkan buffer.
pub struct VkBuffer {
    pub(crate) id: ResourceId,
    pub(crate) kind: BufferKind,
    pub(crate) memory: BufferAllocation,
    /// Zero unless the buffer was created with a device address.
    pub(crate) device_address: u64,
    pub(crate) ownership: OwnershipCell,
}

impl VkBuffer {
    pub fn raw(&self) -> vk::Buffer {
        self.memory.buffer
    }

    pub fn device_address(&self) -> u64 {
        self.device_address
    }
}

impl fmt::Debug for VkBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VkBuffer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.memory.size)
            .finish_non_exhaustive()
    }
}

impl Resource for VkBuffer {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn capabilities(&self) -> Capabilities {
        self.kind.capabilities()
    }

    fn ownership(&self) -> &OwnershipCell {
        &self.ownership
    }
}

impl Buffer for VkBuffer {
    fn kind(&self) -> BufferKind {
        self.kind
    }

    fn size(&self) -> u64 {
        self.memory.size
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        Ok(self.memory.write_bytes(offset, data)?)
    }

    fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        Ok(self.memory.read_bytes(offset, out)?)
    }
}

/// A sampled asset image with a view over every mip level.
pub struct VkImage {
    pub(crate) id: ResourceId,
    pub(crate) format: SampledAssetImageFormat,
    pub(crate) extent: (u32, u32),
    pub(crate) mip_levels: u32,
    pub(crate) memory: ImageAllocation,
    pub(crate) view: vk::ImageView,
    pub(crate) ownership: OwnershipCell,
}

impl VkImage {
    pub fn raw(&self) -> vk::Image {
        self.memory.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }
}

impl fmt::Debug for VkImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VkImage")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("mip_levels", &self.mip_levels)
            .finish_non_exhaustive()
    }
}

impl Resource for VkImage {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn capabilities(&self) -> Capabilities {
        SAMPLED_ASSET_IMAGE_CAPABILITIES
    }

    fn ownership(&self) -> &OwnershipCell {
        &self.ownership
    }
}

impl Image for VkImage {
    fn format(&self) -> SampledAssetImageFormat {
        self.format
    }

    fn width(&self) -> u32 {
        self.extent.0
    }

    fn height(&self) -> u32 {
        self.extent.1
    }

    fn mip_levels(&self) -> u32 {
        self.mip_levels
    }
}

/// A color attachment, depth-stencil attachment or storage image with a
/// single-mip view.
pub struct VkTargetImage {
    pub(crate) id: ResourceId,
    pub(crate) kind: TargetImageKind,
    pub(crate) extent: (u32, u32),
    pub(crate) allow_sampled: bool,
    pub(crate) memory: ImageAllocation,
    pub(crate) view: vk::ImageView,
    pub(crate) aspect: vk::ImageAspectFlags,
    pub(crate) ownership: OwnershipCell,
}

impl VkTargetImage {
    pub fn raw(&self) -> vk::Image {
        self.memory.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Full subresource range of the image.
    pub fn range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(self.aspect)
            .level_count(1)
            .layer_count(1)
    }
}

impl fmt::Debug for VkTargetImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VkTargetImage")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("extent", &self.extent)
            .field("allow_sampled", &self.allow_sampled)
            .finish_non_exhaustive()
    }
}

impl Resource for VkTargetImage {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn capabilities(&self) -> Capabilities {
        self.kind.capabilities(self.allow_sampled)
    }

    fn ownership(&self) -> &OwnershipCell {
        &self.ownership
    }
}

impl TargetImage for VkTargetImage {
    fn kind(&self) -> TargetImageKind {
        self.kind
    }

    fn width(&self) -> u32 {
        self.extent.0
    }

    fn height(&self) -> u32 {
        self.extent.1
    }
}

#[derive(Debug)]
pub struct VkSampler {
    pub(crate) raw: vk::Sampler,
    pub(crate) filter: SamplerFilter,
}

impl VkSampler {
    pub fn raw(&self) -> vk::Sampler {
        self.raw
    }

    pub fn filter(&self) -> SamplerFilter {
        self.filter
    }
}

/// Geometry of the last build, kept so updates can rebuild the geometry list
/// from new vertex buffers alone.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BuiltGeometry {
    pub desc: GeometryDesc,
    pub index_address: u64,
}

/// What the last build of a structure consumed.
#[derive(Debug, Clone, Default)]
pub(crate) enum BuildRecord {
    #[default]
    Unbuilt,
    Bottom(Vec<BuiltGeometry>),
    Top { instance_count: u32 },
}

/// A Vulkan acceleration structure and its backing buffer.
pub struct VkAccelerationStructure {
    pub(crate) id: ResourceId,
    pub(crate) kind: AccelerationStructureKind,
    pub(crate) raw: vk::AccelerationStructureKHR,
    pub(crate) storage: BufferAllocation,
    pub(crate) device_address: u64,
    pub(crate) built: BuildRecord,
    pub(crate) ownership: OwnershipCell,
}

impl VkAccelerationStructure {
    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.raw
    }

    /// Buffer backing the structure. Ownership transfers apply to it.
    pub fn storage_buffer(&self) -> vk::Buffer {
        self.storage.buffer
    }
}

impl fmt::Debug for VkAccelerationStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VkAccelerationStructure")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.storage.size)
            .field("device_address", &format_args!("{:#x}", self.device_address))
            .finish_non_exhaustive()
    }
}

impl Resource for VkAccelerationStructure {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ACCELERATION_STRUCTURE
    }

    fn ownership(&self) -> &OwnershipCell {
        &self.ownership
    }
}

impl AccelerationStructure for VkAccelerationStructure {
    fn kind(&self) -> AccelerationStructureKind {
        self.kind
    }

    fn size(&self) -> u64 {
        self.storage.size
    }

    fn device_address(&self) -> u64 {
        self.device_address
    }
}

/// A pool of compacted-size query slots.
#[derive(Debug)]
pub struct VkQueryPool {
    pub(crate) raw: vk::QueryPool,
    pub(crate) count: u32,
}

impl VkQueryPool {
    pub fn raw(&self) -> vk::QueryPool {
        self.raw
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

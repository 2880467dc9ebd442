//! Resource kinds, capability roles and memory pool classes.

use crate::accel::{AccelerationStructureKind, BlasKind};
use crate::format::{ColorAttachmentImageFormat, DepthStencilAttachmentImageFormat, StorageImageFormat};
use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    /// Roles a resource may be used in. Fixed at creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u16 {
        const STAGING = 1 << 0;
        const UNIFORM = 1 << 1;
        const READ_ONLY_STORAGE = 1 << 2;
        const STORAGE = 1 << 3;
        const BUILD_INPUT = 1 << 4;
        const SAMPLED = 1 << 5;
        const ATTACHMENT = 1 << 6;
        const SCRATCH = 1 << 7;
        const ACCELERATION_STRUCTURE = 1 << 8;
        const READBACK = 1 << 9;
    }
}

/// Where the backing memory of a resource lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Host-visible, written by the CPU and read by the GPU.
    HostUpload,
    /// Device-local, not host-visible.
    DeviceLocal,
    /// Host-visible, written by the GPU and read by the CPU.
    HostReadback,
}

/// The closed set of buffer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Host-written uniform data bound with dynamic offsets.
    UniformUpload,
    /// Host-written source of upload copies.
    StagingUpload,
    /// Device-local buffer written by compute passes on the graphics queue.
    StorageIntermediate,
    /// Device-local buffer written once by the upload queue and handed over.
    StorageAsset,
    /// Transient memory for acceleration structure builds.
    Scratch,
    /// Host-written array of TLAS instance records.
    TlasInstanceUpload,
    /// Device-written buffer read back by the host.
    Readback,
}

impl BufferKind {
    /// Roles granted to buffers of this kind.
    pub const fn capabilities(self) -> Capabilities {
        match self {
            Self::UniformUpload => Capabilities::UNIFORM,
            Self::StagingUpload => Capabilities::STAGING,
            Self::StorageIntermediate => Capabilities::STORAGE
                .union(Capabilities::READ_ONLY_STORAGE)
                .union(Capabilities::BUILD_INPUT),
            Self::StorageAsset => Capabilities::READ_ONLY_STORAGE.union(Capabilities::BUILD_INPUT),
            Self::Scratch => Capabilities::SCRATCH,
            Self::TlasInstanceUpload => Capabilities::BUILD_INPUT,
            Self::Readback => Capabilities::STORAGE.union(Capabilities::READBACK),
        }
    }

    /// Whether buffers of this kind move between queues through release and acquire.
    pub const fn is_asset(self) -> bool {
        matches!(self, Self::StorageAsset)
    }

    /// Pool the buffer is allocated from.
    pub const fn pool_class(self) -> PoolClass {
        match self {
            Self::UniformUpload => PoolClass::UniformUpload,
            Self::StagingUpload => PoolClass::StagingUpload,
            Self::StorageIntermediate => PoolClass::StorageIntermediate,
            Self::StorageAsset => PoolClass::StorageAsset,
            Self::Scratch => PoolClass::Scratch,
            Self::TlasInstanceUpload => PoolClass::TlasInstanceUpload,
            Self::Readback => PoolClass::Readback,
        }
    }
}

/// Capabilities granted to sampled asset images.
pub const SAMPLED_ASSET_IMAGE_CAPABILITIES: Capabilities = Capabilities::SAMPLED;

/// Images written on the graphics queue by render or compute passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetImageKind {
    ColorAttachment(ColorAttachmentImageFormat),
    DepthStencilAttachment(DepthStencilAttachmentImageFormat),
    Storage(StorageImageFormat),
}

impl TargetImageKind {
    /// Roles granted to an image of this kind. `allow_sampled` adds sampling.
    pub const fn capabilities(self, allow_sampled: bool) -> Capabilities {
        let base = match self {
            Self::ColorAttachment(_) | Self::DepthStencilAttachment(_) => Capabilities::ATTACHMENT,
            Self::Storage(_) => Capabilities::STORAGE,
        };
        if allow_sampled {
            base.union(Capabilities::SAMPLED)
        } else {
            base
        }
    }

    /// Size in bytes of one texel, depth only for depth-stencil formats.
    pub const fn texel_size(self) -> u32 {
        match self {
            Self::ColorAttachment(format) => format.texel_size(),
            Self::DepthStencilAttachment(format) => format.depth_size(),
            Self::Storage(format) => format.texel_size(),
        }
    }

    pub const fn pool_class(self) -> PoolClass {
        match self {
            Self::ColorAttachment(_) => PoolClass::ColorAttachmentImage,
            Self::DepthStencilAttachment(_) => PoolClass::DepthStencilAttachmentImage,
            Self::Storage(_) => PoolClass::StorageImage,
        }
    }
}

/// Memory pools, one per resource usage class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolClass {
    UniformUpload,
    StagingUpload,
    StorageIntermediate,
    StorageAsset,
    Scratch,
    TlasInstanceUpload,
    Readback,
    SampledAssetImage,
    ColorAttachmentImage,
    DepthStencilAttachmentImage,
    StorageImage,
    IntermediateBlas,
    NonCompactedBlas,
    CompactedBlas,
    Tlas,
}

impl PoolClass {
    /// Every pool class, in a stable order.
    pub const ALL: [Self; 15] = [
        Self::UniformUpload,
        Self::StagingUpload,
        Self::StorageIntermediate,
        Self::StorageAsset,
        Self::Scratch,
        Self::TlasInstanceUpload,
        Self::Readback,
        Self::SampledAssetImage,
        Self::ColorAttachmentImage,
        Self::DepthStencilAttachmentImage,
        Self::StorageImage,
        Self::IntermediateBlas,
        Self::NonCompactedBlas,
        Self::CompactedBlas,
        Self::Tlas,
    ];

    /// Memory usage of allocations in this pool.
    pub const fn memory_usage(self) -> MemoryUsage {
        match self {
            Self::UniformUpload | Self::StagingUpload | Self::TlasInstanceUpload => {
                MemoryUsage::HostUpload
            }
            Self::Readback => MemoryUsage::HostReadback,
            Self::StorageIntermediate
            | Self::StorageAsset
            | Self::Scratch
            | Self::SampledAssetImage
            | Self::ColorAttachmentImage
            | Self::DepthStencilAttachmentImage
            | Self::StorageImage
            | Self::IntermediateBlas
            | Self::NonCompactedBlas
            | Self::CompactedBlas
            | Self::Tlas => MemoryUsage::DeviceLocal,
        }
    }

    /// Pool backing an acceleration structure of the given kind.
    pub const fn for_acceleration_structure(kind: AccelerationStructureKind) -> Self {
        match kind {
            AccelerationStructureKind::Bottom(BlasKind::Intermediate) => Self::IntermediateBlas,
            AccelerationStructureKind::Bottom(BlasKind::NonCompacted) => Self::NonCompactedBlas,
            AccelerationStructureKind::Bottom(BlasKind::Compacted) => Self::CompactedBlas,
            AccelerationStructureKind::Top => Self::Tlas,
        }
    }

    /// Short name used for allocation labels.
    pub const fn label(self) -> &'static str {
        match self {
            Self::UniformUpload => "uniform_upload",
            Self::StagingUpload => "staging_upload",
            Self::StorageIntermediate => "storage_intermediate",
            Self::StorageAsset => "storage_asset",
            Self::Scratch => "scratch",
            Self::TlasInstanceUpload => "tlas_instance_upload",
            Self::Readback => "readback",
            Self::SampledAssetImage => "sampled_asset_image",
            Self::ColorAttachmentImage => "color_attachment_image",
            Self::DepthStencilAttachmentImage => "depth_stencil_attachment_image",
            Self::StorageImage => "storage_image",
            Self::IntermediateBlas => "intermediate_blas",
            Self::NonCompactedBlas => "non_compacted_blas",
            Self::CompactedBlas => "compacted_blas",
            Self::Tlas => "tlas",
        }
    }
}

/// Process-unique identity of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_intermediate_exposes_derived_views() {
        let caps = BufferKind::StorageIntermediate.capabilities();
        assert!(caps.contains(Capabilities::STORAGE));
        assert!(caps.contains(Capabilities::READ_ONLY_STORAGE));
        assert!(caps.contains(Capabilities::BUILD_INPUT));
        assert!(!caps.contains(Capabilities::STAGING));
    }

    #[test]
    fn only_storage_assets_transfer_between_queues() {
        assert!(BufferKind::StorageAsset.is_asset());
        assert!(!BufferKind::StorageIntermediate.is_asset());
        assert!(!BufferKind::StagingUpload.is_asset());
        assert!(!BufferKind::StorageAsset
            .capabilities()
            .contains(Capabilities::STORAGE));
    }

    #[test]
    fn pool_memory_usage() {
        assert_eq!(
            BufferKind::StagingUpload.pool_class().memory_usage(),
            MemoryUsage::HostUpload
        );
        assert_eq!(
            BufferKind::Readback.pool_class().memory_usage(),
            MemoryUsage::HostReadback
        );
        assert_eq!(
            PoolClass::for_acceleration_structure(AccelerationStructureKind::Top).memory_usage(),
            MemoryUsage::DeviceLocal
        );
    }

    #[test]
    fn target_images_grant_their_pass_role() {
        let color = TargetImageKind::ColorAttachment(ColorAttachmentImageFormat::R8G8B8A8Unorm);
        assert_eq!(color.capabilities(false), Capabilities::ATTACHMENT);
        assert!(color.capabilities(true).contains(Capabilities::SAMPLED));
        let storage = TargetImageKind::Storage(StorageImageFormat::R32Uint);
        assert_eq!(storage.capabilities(false), Capabilities::STORAGE);
        assert_eq!(storage.pool_class().memory_usage(), MemoryUsage::DeviceLocal);
        assert_eq!(
            TargetImageKind::DepthStencilAttachment(DepthStencilAttachmentImageFormat::D32Sfloat)
                .pool_class()
                .label(),
            "depth_stencil_attachment_image"
        );
    }

    #[test]
    fn resource_ids_are_unique() {
        let a = ResourceId::next();
        let b = ResourceId::next();
        assert_ne!(a, b);
    }
}

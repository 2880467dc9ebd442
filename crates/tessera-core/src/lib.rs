//! Backend-neutral types for the Tessera graphics abstraction layer.
//!
//! This crate provides the vocabulary shared by every backend:
//! - Closed format, index, compare and descriptor enumerations
//! - Render pass attachment descriptions
//! - Resource kinds and the capability roles they grant
//! - Memory pool classes keyed by resource usage
//! - Acceleration structure sizing, kinds and the native instance record
//! - Device capability reporting and the common error type

pub mod accel;
pub mod caps;
pub mod error;
pub mod format;
pub mod pass;
pub mod resource;

pub use accel::{
    AccelerationStructureKind, AccelerationStructureSizes, BlasKind, GeometryDesc, InstanceFlags,
    InstanceRecord, TlasInstance,
};
pub use caps::DeviceCapabilities;
pub use error::{Error, Result};
pub use format::{
    ColorAttachmentImageFormat, CompareOp, DepthStencilAttachmentImageFormat, DescriptorBinding,
    DescriptorType, IndexType, SampledAssetImageFormat, SamplerFilter, StorageImageFormat,
    VertexFormat,
};
pub use pass::{
    ClearValues, ColorAttachmentDesc, ColorLoadOp, ColorStoreOp, DepthStencilAttachmentDesc,
    DepthStencilLoadOp, DepthStencilStoreOp,
};
pub use resource::{
    BufferKind, Capabilities, MemoryUsage, PoolClass, ResourceId, TargetImageKind,
    SAMPLED_ASSET_IMAGE_CAPABILITIES,
};

/// Layout constants shared by all backends.
pub mod constants {
    /// Size in bytes of one host-visible TLAS instance record.
    pub const INSTANCE_RECORD_SIZE: u64 = 64;
    /// Required alignment of acceleration structure storage.
    pub const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;
    /// Largest value representable in the 24-bit instance id field.
    pub const MAX_INSTANCE_ID: u32 = (1 << 24) - 1;
}

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(13, 4), 16);
    }
}

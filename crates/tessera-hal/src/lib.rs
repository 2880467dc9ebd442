//! Backend traits and cross-queue protocols for the Tessera graphics
//! abstraction layer.
//!
//! This crate provides:
//! - The [`Api`] trait tying one backend's object types together
//! - Device, queue and command buffer traits
//! - Capability-checked resource views
//! - Render pass and frame buffer validation
//! - Debug-only ownership shadow state for upload-to-graphics transfers
//! - Barrier planning for `release` / `acquire`
//! - Drivers for the BLAS compaction pipeline and TLAS builds

pub mod blas;
pub mod command;
pub mod device;
pub mod ownership;
pub mod pass;
pub mod queue;
pub mod resource;
pub mod tlas;
pub mod transfer;

pub use blas::{DynamicBlas, MeasuredBlasBatch, RetiringBlasBatch, StaticBlasBatch};
pub use command::{
    DescriptorResources, GraphicsCommandBuffer, ImageTransfer, TransferAssets, TriangleGeometry,
    UploadCommandBuffer,
};
pub use device::Device;
pub use ownership::{OwnershipCell, OwnershipState};
pub use pass::{FrameBuffer, RenderPass};
pub use queue::{GraphicsQueue, UploadQueue};
pub use resource::{
    blas_reference, AccelerationStructure, Buffer, BuildInputView, Image, ReadOnlyStorageView,
    Resource, SampledImageView, StorageImageView, StorageView, TargetImage,
};
pub use tlas::TopLevel;
pub use transfer::{QueueTopology, TransferLedger};

use raw_window_handle::RawDisplayHandle;
use std::fmt;
use tessera_core::Result;

/// One backend's set of object types.
///
/// Every backend object type is an associated type, so the backend is chosen
/// once, statically, and calls dispatch without runtime lookup.
pub trait Api: Clone + fmt::Debug + Sized + 'static {
    /// Backend name used in logs.
    const NAME: &'static str;

    type Device: Device<Self>;
    type GraphicsQueue: GraphicsQueue<Self>;
    type UploadQueue: UploadQueue<Self>;
    type GraphicsCommandBuffer: GraphicsCommandBuffer<Self>;
    type UploadCommandBuffer: UploadCommandBuffer<Self>;
    type Fence: fmt::Debug;

    type DescriptorSetLayout: fmt::Debug;
    type PipelineLayout: fmt::Debug;
    type DescriptorSet: fmt::Debug;
    type ComputePipeline: fmt::Debug;
    type RenderPass: RenderPass;
    type FrameBuffer: FrameBuffer;
    type GraphicsPipeline: fmt::Debug;

    type Buffer: Buffer;
    type Image: Image;
    type TargetImage: TargetImage;
    type Sampler: fmt::Debug;
    type AccelerationStructure: AccelerationStructure;
    type QueryPool: fmt::Debug;

    /// Create a device.
    ///
    /// `display` is the windowing-system connection, passed through to pick
    /// presentation extensions. Pass `None` for headless use.
    fn init_device(display: Option<RawDisplayHandle>, support_ray_tracing: bool)
        -> Result<Self::Device>;

    /// Destroy a device created by [`Api::init_device`]. Every object it
    /// created must already be destroyed.
    fn destroy_device(device: Self::Device);
}

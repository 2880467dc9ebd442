//! Vulkan backend for the Tessera graphics abstraction layer.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - Queue family selection for dedicated or unified uploads
//! - Memory allocation via gpu-allocator
//! - Queue family ownership transfers with Synchronization2 barriers
//! - Acceleration structure builds, updates and compaction
//! - Single-subpass render passes, graphics pipelines and storage images

pub mod accel;
pub mod barrier;
pub mod capabilities;
pub mod command;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod format;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod render_pass;
pub mod resource;
pub mod sync;

pub use capabilities::{AdapterInfo, GpuVendor};
pub use command::{VkGraphicsCommandBuffer, VkUploadCommandBuffer};
pub use descriptors::{VkDescriptorSet, VkDescriptorSetLayout, VkPipelineLayout};
pub use device::{select_queue_families, DeviceBuilder, VkDevice};
pub use error::{Result, VkError};
pub use pipeline::{VkComputePipeline, VkGraphicsPipeline};
pub use queue::{VkGraphicsQueue, VkUploadQueue};
pub use render_pass::{VkFrameBuffer, VkRenderPass};
pub use resource::{
    VkAccelerationStructure, VkBuffer, VkImage, VkQueryPool, VkSampler, VkTargetImage,
};
pub use sync::VkFence;

use raw_window_handle::RawDisplayHandle;
use tessera_hal::Api;
use tracing::info;

/// The Vulkan backend.
#[derive(Clone, Debug)]
pub struct VkApi;

impl Api for VkApi {
    const NAME: &'static str = "vulkan";

    type Device = VkDevice;
    type GraphicsQueue = VkGraphicsQueue;
    type UploadQueue = VkUploadQueue;
    type GraphicsCommandBuffer = VkGraphicsCommandBuffer;
    type UploadCommandBuffer = VkUploadCommandBuffer;
    type Fence = VkFence;

    type DescriptorSetLayout = VkDescriptorSetLayout;
    type PipelineLayout = VkPipelineLayout;
    type DescriptorSet = VkDescriptorSet;
    type ComputePipeline = VkComputePipeline;
    type RenderPass = VkRenderPass;
    type FrameBuffer = VkFrameBuffer;
    type GraphicsPipeline = VkGraphicsPipeline;

    type Buffer = VkBuffer;
    type Image = VkImage;
    type TargetImage = VkTargetImage;
    type Sampler = VkSampler;
    type AccelerationStructure = VkAccelerationStructure;
    type QueryPool = VkQueryPool;

    fn init_device(
        display: Option<RawDisplayHandle>,
        support_ray_tracing: bool,
    ) -> tessera_core::Result<VkDevice> {
        Ok(DeviceBuilder::new()
            .display(display)
            .ray_tracing(support_ray_tracing)
            .build()?)
    }

    fn destroy_device(device: VkDevice) {
        let live = device.live_allocations();
        debug_assert_eq!(live, 0, "device destroyed with {live} live allocations");
        if let Err(error) = device.wait_idle() {
            tracing::warn!(%error, "device did not go idle before destruction");
        }
        drop(device);
        info!("Destroyed Vulkan device");
    }
}

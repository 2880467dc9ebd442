//! The device trait.

use crate::command::DescriptorResources;
use crate::transfer::QueueTopology;
use crate::Api;
use std::fmt;
use tessera_core::{
    AccelerationStructureKind, AccelerationStructureSizes, BufferKind, ColorAttachmentDesc,
    CompareOp, DepthStencilAttachmentDesc, DescriptorBinding, DeviceCapabilities, GeometryDesc,
    Result, SampledAssetImageFormat, SamplerFilter, TargetImageKind,
};

/// Factory for every backend object.
///
/// Objects are created and destroyed explicitly. Destroying an object that a
/// submitted command buffer still references is a caller contract violation.
pub trait Device<A: Api>: fmt::Debug {
    fn capabilities(&self) -> &DeviceCapabilities;

    /// How the upload and graphics queues map onto queue families.
    fn topology(&self) -> QueueTopology;

    fn create_graphics_queue(&self) -> Result<A::GraphicsQueue>;
    fn destroy_graphics_queue(&self, queue: A::GraphicsQueue);
    fn create_upload_queue(&self) -> Result<A::UploadQueue>;
    fn destroy_upload_queue(&self, queue: A::UploadQueue);

    fn create_graphics_command_buffer(&self) -> Result<A::GraphicsCommandBuffer>;
    fn reset_graphics_command_buffer(&self, command_buffer: &mut A::GraphicsCommandBuffer)
        -> Result<()>;
    fn destroy_graphics_command_buffer(&self, command_buffer: A::GraphicsCommandBuffer);
    fn create_upload_command_buffer(&self) -> Result<A::UploadCommandBuffer>;
    fn reset_upload_command_buffer(&self, command_buffer: &mut A::UploadCommandBuffer)
        -> Result<()>;
    fn destroy_upload_command_buffer(&self, command_buffer: A::UploadCommandBuffer);

    fn create_fence(&self, signaled: bool) -> Result<A::Fence>;
    /// Block until `fence` is signaled. The only host-blocking operation.
    fn wait_for_fence(&self, fence: &A::Fence) -> Result<()>;
    fn reset_fence(&self, fence: &A::Fence) -> Result<()>;
    fn destroy_fence(&self, fence: A::Fence);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<A::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: A::DescriptorSetLayout);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[&A::DescriptorSetLayout],
    ) -> Result<A::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: A::PipelineLayout);
    fn create_descriptor_set(&self, layout: &A::DescriptorSetLayout) -> Result<A::DescriptorSet>;
    /// Write descriptors starting at `first_element` of `binding`.
    ///
    /// The set must not be referenced by in-flight work.
    fn write_descriptor_set(
        &self,
        set: &mut A::DescriptorSet,
        binding: u32,
        first_element: u32,
        resources: DescriptorResources<'_, A>,
    );
    fn destroy_descriptor_set(&self, set: A::DescriptorSet);

    /// Create a compute pipeline from backend-native bytecode.
    fn create_compute_pipeline(
        &self,
        layout: &A::PipelineLayout,
        code: &[u8],
    ) -> Result<A::ComputePipeline>;
    fn destroy_compute_pipeline(&self, pipeline: A::ComputePipeline);

    /// Create a single-subpass render pass over the given attachments.
    fn create_render_pass(
        &self,
        color_attachments: &[ColorAttachmentDesc],
        depth_stencil_attachment: Option<DepthStencilAttachmentDesc>,
    ) -> Result<A::RenderPass>;
    fn destroy_render_pass(&self, render_pass: A::RenderPass);

    /// Create a graphics pipeline from backend-native vertex and fragment
    /// bytecode. Vertices carry no input attributes; viewport and scissor are
    /// dynamic. `depth_test` enables depth testing and writes with the given
    /// comparison.
    fn create_graphics_pipeline(
        &self,
        render_pass: &A::RenderPass,
        layout: &A::PipelineLayout,
        vertex_code: &[u8],
        fragment_code: &[u8],
        depth_test: Option<CompareOp>,
    ) -> Result<A::GraphicsPipeline>;
    fn destroy_graphics_pipeline(&self, pipeline: A::GraphicsPipeline);

    /// Bind attachment images to a render pass layout. Images must match the
    /// attachment formats and cover `width` x `height`.
    fn create_frame_buffer(
        &self,
        render_pass: &A::RenderPass,
        width: u32,
        height: u32,
        color_attachments: &[&A::TargetImage],
        depth_stencil_attachment: Option<&A::TargetImage>,
    ) -> Result<A::FrameBuffer>;
    fn destroy_frame_buffer(&self, frame_buffer: A::FrameBuffer);

    fn create_buffer(&self, kind: BufferKind, size: u64) -> Result<A::Buffer>;
    fn destroy_buffer(&self, buffer: A::Buffer);

    fn create_sampled_asset_image(
        &self,
        format: SampledAssetImageFormat,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> Result<A::Image>;
    fn destroy_image(&self, image: A::Image);

    /// Create a color attachment, depth-stencil attachment or storage image.
    /// `allow_sampled` adds the sampled role.
    fn create_target_image(
        &self,
        kind: TargetImageKind,
        width: u32,
        height: u32,
        allow_sampled: bool,
    ) -> Result<A::TargetImage>;
    fn destroy_target_image(&self, image: A::TargetImage);

    fn create_sampler(&self, filter: SamplerFilter) -> Result<A::Sampler>;
    fn destroy_sampler(&self, sampler: A::Sampler);

    /// Sizes of an intermediate BLAS over `geometries`.
    fn intermediate_blas_sizes(&self, geometries: &[GeometryDesc]) -> AccelerationStructureSizes;

    /// Sizes of a non-compacted BLAS over `geometries`. The update scratch
    /// size is always `None`; the compacted size is only known after building.
    fn non_compacted_blas_sizes(&self, geometries: &[GeometryDesc])
        -> AccelerationStructureSizes;

    /// Sizes of a TLAS holding `instance_count` instances.
    fn tlas_sizes(&self, instance_count: u32) -> AccelerationStructureSizes;

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        size: u64,
    ) -> Result<A::AccelerationStructure>;
    fn destroy_acceleration_structure(&self, structure: A::AccelerationStructure);

    fn create_compacted_size_query_pool(&self, query_count: u32) -> Result<A::QueryPool>;
    /// Compacted size measured for slot `index`.
    ///
    /// Valid only after a fence covering the build that wrote the slot has
    /// been waited on.
    fn compacted_size(&self, pool: &A::QueryPool, index: u32) -> Result<u64>;
    fn destroy_query_pool(&self, pool: A::QueryPool);
}

/// Create an instance upload buffer sized for `instance_count` records.
pub fn create_instance_buffer<A: Api>(device: &A::Device, instance_count: u32) -> Result<A::Buffer> {
    device.create_buffer(
        BufferKind::TlasInstanceUpload,
        u64::from(instance_count.max(1)) * tessera_core::constants::INSTANCE_RECORD_SIZE,
    )
}

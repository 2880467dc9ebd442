//! Command buffer traits and their argument types.

use crate::resource::{
    AccelerationStructure, Buffer, BuildInputView, Image, ReadOnlyStorageView, Resource,
    SampledImageView, StorageImageView, StorageView,
};
use crate::transfer::{TransferLedger, TransferShape};
use crate::Api;
use std::fmt;
use tessera_core::{ClearValues, GeometryDesc, ResourceId, Result};

/// One triangle geometry of a BLAS build.
pub struct TriangleGeometry<'a, A: Api> {
    pub desc: GeometryDesc,
    pub vertex_buffer: BuildInputView<'a, A::Buffer>,
    /// Required when `desc.indices` is set.
    pub index_buffer: Option<BuildInputView<'a, A::Buffer>>,
}

impl<'a, A: Api> TriangleGeometry<'a, A> {
    /// Non-indexed geometry over tightly packed positions.
    pub fn triangles(vertex_buffer: &'a A::Buffer, vertex_count: u32) -> Self {
        Self {
            desc: GeometryDesc::triangles(vertex_count),
            vertex_buffer: BuildInputView::new(vertex_buffer),
            index_buffer: None,
        }
    }

    /// Indexed geometry over tightly packed positions.
    pub fn indexed(
        vertex_buffer: &'a A::Buffer,
        vertex_count: u32,
        index_buffer: &'a A::Buffer,
        index_type: tessera_core::IndexType,
        index_count: u32,
    ) -> Self {
        Self {
            desc: GeometryDesc::indexed(vertex_count, index_type, index_count),
            vertex_buffer: BuildInputView::new(vertex_buffer),
            index_buffer: Some(BuildInputView::new(index_buffer)),
        }
    }

    /// Assert that the geometry description and buffers agree.
    pub fn debug_validate(&self) {
        debug_assert_eq!(
            self.desc.indices.is_some(),
            self.index_buffer.is_some(),
            "index type and index buffer must be given together"
        );
        debug_assert!(
            u64::from(self.desc.vertex_count) * u64::from(self.desc.vertex_stride)
                <= self.vertex_buffer.resource().size(),
            "vertex buffer too small for {} vertices",
            self.desc.vertex_count
        );
    }
}

/// Sizing descriptions of a geometry list.
pub fn geometry_descs<A: Api>(geometries: &[TriangleGeometry<'_, A>]) -> Vec<GeometryDesc> {
    geometries.iter().map(|g| g.desc).collect()
}

impl<A: Api> fmt::Debug for TriangleGeometry<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriangleGeometry")
            .field("desc", &self.desc)
            .field("vertex_buffer", &self.vertex_buffer)
            .field("index_buffer", &self.index_buffer)
            .finish()
    }
}

/// A sampled asset image and the number of mip levels transferred.
pub struct ImageTransfer<'a, A: Api> {
    pub image: &'a A::Image,
    pub mip_levels: u32,
}

impl<'a, A: Api> ImageTransfer<'a, A> {
    /// Transfer every mip level of `image`.
    pub fn all_mips(image: &'a A::Image) -> Self {
        Self {
            image,
            mip_levels: image.mip_levels(),
        }
    }
}

/// The asset set named by a matching `release` / `acquire` pair.
pub struct TransferAssets<'a, A: Api> {
    pub buffers: &'a [&'a A::Buffer],
    pub images: &'a [ImageTransfer<'a, A>],
    pub acceleration_structures: &'a [&'a A::AccelerationStructure],
}

impl<A: Api> Default for TransferAssets<'_, A> {
    fn default() -> Self {
        Self {
            buffers: &[],
            images: &[],
            acceleration_structures: &[],
        }
    }
}

impl<'a, A: Api> TransferAssets<'a, A> {
    pub fn buffers(buffers: &'a [&'a A::Buffer]) -> Self {
        Self {
            buffers,
            ..Self::default()
        }
    }

    pub fn acceleration_structures(structures: &'a [&'a A::AccelerationStructure]) -> Self {
        Self {
            acceleration_structures: structures,
            ..Self::default()
        }
    }

    /// Counts handed to the barrier planner.
    pub fn shape(&self) -> TransferShape {
        TransferShape {
            buffers: self.buffers.len(),
            image_mip_levels: self.images.iter().map(|t| t.mip_levels).collect(),
            acceleration_structures: self.acceleration_structures.len(),
        }
    }

    /// Identity of every resource in the set.
    pub fn ids(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.buffers
            .iter()
            .map(|b| b.id())
            .chain(self.images.iter().map(|t| t.image.id()))
            .chain(self.acceleration_structures.iter().map(|s| s.id()))
    }

    /// Advance the ownership shadow state of every resource by `release`.
    pub fn note_release(&self) {
        for buffer in self.buffers {
            debug_assert!(buffer.kind().is_asset(), "{buffer:?} is not an asset");
            buffer.ownership().note_release("storage asset buffer");
        }
        for transfer in self.images {
            debug_assert!(
                transfer.mip_levels >= 1 && transfer.mip_levels <= transfer.image.mip_levels(),
                "cannot transfer {} mip levels of {:?}",
                transfer.mip_levels,
                transfer.image
            );
            transfer.image.ownership().note_release("sampled asset image");
        }
        for structure in self.acceleration_structures {
            debug_assert!(structure.kind().is_asset(), "{structure:?} is not an asset");
            structure.ownership().note_release("compacted BLAS");
        }
    }

    /// Advance the ownership shadow state of every resource by `acquire`.
    pub fn note_acquire(&self) {
        for buffer in self.buffers {
            buffer.ownership().note_acquire("storage asset buffer");
        }
        for transfer in self.images {
            transfer.image.ownership().note_acquire("sampled asset image");
        }
        for structure in self.acceleration_structures {
            structure.ownership().note_acquire("compacted BLAS");
        }
    }
}

/// Resources written into a descriptor set binding.
pub enum DescriptorResources<'a, A: Api> {
    /// Uniform buffers with the byte range visible at each dynamic offset.
    DynamicUniformBuffers {
        buffers: &'a [&'a A::Buffer],
        ranges: &'a [u64],
    },
    ReadOnlyStorageBuffers(&'a [ReadOnlyStorageView<'a, A::Buffer>]),
    StorageBuffers(&'a [StorageView<'a, A::Buffer>]),
    SampledImages(&'a [SampledImageView<'a, A::Image>]),
    /// Attachment or storage images created with sampling allowed.
    SampledTargetImages(&'a [SampledImageView<'a, A::TargetImage>]),
    StorageImages(&'a [StorageImageView<'a, A::TargetImage>]),
    Samplers(&'a [&'a A::Sampler]),
    TopLevelAccelerationStructures(&'a [&'a A::AccelerationStructure]),
}

impl<A: Api> DescriptorResources<'_, A> {
    /// Number of descriptors written.
    pub fn len(&self) -> usize {
        match self {
            Self::DynamicUniformBuffers { buffers, .. } => buffers.len(),
            Self::ReadOnlyStorageBuffers(views) => views.len(),
            Self::StorageBuffers(views) => views.len(),
            Self::SampledImages(views) => views.len(),
            Self::SampledTargetImages(views) => views.len(),
            Self::StorageImages(views) => views.len(),
            Self::Samplers(samplers) => samplers.len(),
            Self::TopLevelAccelerationStructures(structures) => structures.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Commands recorded for the graphics queue.
///
/// Recording is single-threaded: every recording method takes `&mut self`.
pub trait GraphicsCommandBuffer<A: Api>: fmt::Debug {
    fn begin(&mut self) -> Result<()>;

    /// Take ownership of assets released by the upload queue.
    ///
    /// Must precede the first read of each asset and name exactly the set
    /// released. No further barrier is needed before reading them.
    fn acquire(&mut self, assets: &TransferAssets<'_, A>);

    fn begin_debug_label(&mut self, label: &str);

    fn end_debug_label(&mut self);

    /// Begin a render pass over `frame_buffer`, clearing the attachments whose
    /// load op is `Clear`.
    ///
    /// Render passes do not nest and exclude compute passes and builds.
    fn begin_render_pass(
        &mut self,
        render_pass: &A::RenderPass,
        frame_buffer: &A::FrameBuffer,
        width: u32,
        height: u32,
        clear_values: &ClearValues<'_>,
    );

    fn bind_graphics_pipeline(&mut self, pipeline: &A::GraphicsPipeline);

    fn set_viewport(&mut self, width: u32, height: u32);

    fn set_scissor(&mut self, width: u32, height: u32);

    fn bind_graphics_descriptor_sets(
        &mut self,
        layout: &A::PipelineLayout,
        sets: &[&A::DescriptorSet],
        dynamic_offsets: &[u32],
    );

    /// Draw non-indexed primitives. Vertices are generated by the vertex shader.
    fn draw(&mut self, vertex_count: u32, instance_count: u32);

    /// End the render pass, flushing attachments as their store ops request.
    fn end_render_pass(&mut self);

    /// Make storage buffers and storage images writable by the following
    /// dispatches. Previous storage image contents are discarded.
    fn compute_pass_load(
        &mut self,
        storage_buffers: &[StorageView<'_, A::Buffer>],
        storage_images: &[StorageImageView<'_, A::TargetImage>],
    );

    fn bind_compute_pipeline(&mut self, pipeline: &A::ComputePipeline);

    fn bind_compute_descriptor_sets(
        &mut self,
        layout: &A::PipelineLayout,
        sets: &[&A::DescriptorSet],
        dynamic_offsets: &[u32],
    );

    fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32);

    /// Flush dispatch writes for read-only storage and build-input reads, for
    /// host reads of readback buffers, and for sampling of storage images.
    fn compute_pass_store(
        &mut self,
        storage_buffers: &[StorageView<'_, A::Buffer>],
        storage_images: &[StorageImageView<'_, A::TargetImage>],
    );

    /// Build an intermediate BLAS. The structure remembers its geometry layout
    /// for later updates.
    fn build_intermediate_blas(
        &mut self,
        dst: &mut A::AccelerationStructure,
        geometries: &[TriangleGeometry<'_, A>],
        scratch: &A::Buffer,
    );

    /// Make built intermediate structures visible to TLAS builds and traversal.
    fn build_intermediate_blas_store(&mut self, structures: &[&A::AccelerationStructure]);

    /// Refit an intermediate BLAS from new vertex positions, one buffer per geometry.
    fn update_intermediate_blas(
        &mut self,
        dst: &mut A::AccelerationStructure,
        vertex_positions: &[BuildInputView<'_, A::Buffer>],
        scratch: &A::Buffer,
    );

    fn update_intermediate_blas_store(&mut self, structures: &[&A::AccelerationStructure]);

    /// Build a TLAS from `instance_count` records of an instance upload buffer.
    fn build_tlas(
        &mut self,
        dst: &mut A::AccelerationStructure,
        instance_count: u32,
        instances: &A::Buffer,
        scratch: &A::Buffer,
    );

    fn build_tlas_store(&mut self, tlas: &A::AccelerationStructure);

    /// Refit a TLAS in place. The instance count of the last build is reused.
    fn update_tlas(
        &mut self,
        dst: &mut A::AccelerationStructure,
        instances: &A::Buffer,
        scratch: &A::Buffer,
    );

    fn update_tlas_store(&mut self, tlas: &A::AccelerationStructure);

    fn end(&mut self) -> Result<()>;

    /// Resources named by `acquire` since the last reset.
    fn acquired(&self) -> &TransferLedger;
}

/// Commands recorded for the upload queue.
pub trait UploadCommandBuffer<A: Api>: fmt::Debug {
    fn begin(&mut self) -> Result<()>;

    /// Copy `size` bytes from a staging buffer into a storage asset buffer.
    fn upload_buffer(
        &mut self,
        dst: &A::Buffer,
        dst_offset: u64,
        staging: &A::Buffer,
        src_offset: u64,
        size: u64,
    );

    /// Copy one mip level from a staging buffer into a sampled asset image.
    fn upload_image(
        &mut self,
        dst: &A::Image,
        mip_level: u32,
        staging: &A::Buffer,
        src_offset: u64,
        src_row_pitch: u32,
        src_row_count: u32,
    );

    /// Make uploaded build inputs visible to the following builds.
    fn build_non_compacted_blas_pass_load(&mut self, inputs: &[BuildInputView<'_, A::Buffer>]);

    /// Build a non-compacted BLAS and write its compacted size into
    /// `query_index` of `query_pool`.
    fn build_non_compacted_blas(
        &mut self,
        dst: &mut A::AccelerationStructure,
        geometries: &[TriangleGeometry<'_, A>],
        scratch: &A::Buffer,
        query_pool: &A::QueryPool,
        query_index: u32,
    );

    /// Order the builds before later writes to their inputs.
    fn build_non_compacted_blas_pass_store(&mut self, inputs: &[BuildInputView<'_, A::Buffer>]);

    /// Copy a retired non-compacted BLAS into a compacted BLAS.
    fn compact_blas(&mut self, dst: &A::AccelerationStructure, src: &A::AccelerationStructure);

    /// Give up ownership of assets to the graphics queue.
    fn release(&mut self, assets: &TransferAssets<'_, A>);

    fn end(&mut self) -> Result<()>;

    /// Resources named by `release` since the last reset.
    fn released(&self) -> &TransferLedger;
}

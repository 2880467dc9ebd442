//! The emulated device.

use crate::command::{SoftGraphicsCommandBuffer, SoftUploadCommandBuffer};
use crate::config::SoftConfig;
use crate::descriptor::{
    Bound, Dispatch, Kernel, SoftComputePipeline, SoftDescriptorSet, SoftDescriptorSetLayout,
    SoftPipelineLayout,
};
use crate::pass::{SoftFrameBuffer, SoftGraphicsPipeline, SoftRenderPass};
use crate::queue::{SoftGraphicsQueue, SoftUploadQueue};
use crate::resource::{
    QuerySlot, SoftAccelerationStructure, SoftBuffer, SoftImage, SoftQueryPool, SoftSampler,
    SoftTargetImage, StructureInner,
};
use crate::sizing;
use crate::sync::SoftFence;
use crate::SoftApi;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tessera_core::constants::ACCELERATION_STRUCTURE_ALIGNMENT;
use tessera_core::{
    align_up, AccelerationStructureKind, AccelerationStructureSizes, BufferKind,
    ColorAttachmentDesc, CompareOp, DepthStencilAttachmentDesc, DescriptorBinding,
    DescriptorType, DeviceCapabilities, Error, GeometryDesc, PoolClass, Result,
    SampledAssetImageFormat, SamplerFilter, TargetImageKind,
};
use tessera_hal::pass::validate_frame_buffer;
use tessera_hal::{Buffer, DescriptorResources, Device, QueueTopology, TargetImage};
use tracing::{debug, info, warn};

/// First device address handed out to acceleration structures.
const ADDRESS_BASE: u64 = 0x1_0000_0000;

/// Live allocations of one memory pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolUsage {
    pub allocations: usize,
    pub bytes: u64,
}

/// State shared by the device and every object recording against it.
pub(crate) struct DeviceShared {
    pub capabilities: DeviceCapabilities,
    pub topology: QueueTopology,
    kernels: RwLock<HashMap<String, Kernel>>,
    structures: RwLock<HashMap<u64, Weak<StructureInner>>>,
    pools: Mutex<HashMap<PoolClass, PoolUsage>>,
    next_address: AtomicU64,
}

impl DeviceShared {
    /// Acceleration structure at a device address.
    pub fn resolve(&self, address: u64) -> Option<Arc<StructureInner>> {
        self.structures.read().get(&address).and_then(Weak::upgrade)
    }

    fn allocate(&self, class: PoolClass, bytes: u64) {
        let mut pools = self.pools.lock();
        let usage = pools.entry(class).or_default();
        usage.allocations += 1;
        usage.bytes += bytes;
    }

    fn free(&self, class: PoolClass, bytes: u64) {
        let mut pools = self.pools.lock();
        let usage = pools.entry(class).or_default();
        debug_assert!(usage.allocations > 0, "{class:?} pool freed more than allocated");
        usage.allocations = usage.allocations.saturating_sub(1);
        usage.bytes = usage.bytes.saturating_sub(bytes);
    }
}

/// An emulated device.
pub struct SoftDevice {
    shared: Arc<DeviceShared>,
}

impl SoftDevice {
    pub fn new(config: SoftConfig) -> Self {
        let capabilities = config.capabilities();
        let topology = if config.dedicated_upload_queue {
            QueueTopology::Dedicated {
                graphics_family: 0,
                upload_family: 1,
            }
        } else {
            QueueTopology::Unified { family: 0 }
        };
        info!("Created software device: {}", capabilities.summary());
        Self {
            shared: Arc::new(DeviceShared {
                capabilities,
                topology,
                kernels: RwLock::new(HashMap::new()),
                structures: RwLock::new(HashMap::new()),
                pools: Mutex::new(HashMap::new()),
                next_address: AtomicU64::new(ADDRESS_BASE),
            }),
        }
    }

    /// Register a host kernel. Compute pipelines created from the bytes of
    /// `name` run it.
    pub fn register_kernel<F>(&self, name: impl Into<String>, kernel: F)
    where
        F: Fn(&Dispatch<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(%name, "registered software kernel");
        self.shared.kernels.write().insert(name, Arc::new(kernel));
    }

    /// Live allocations in `class`.
    pub fn pool_usage(&self, class: PoolClass) -> PoolUsage {
        self.shared
            .pools
            .lock()
            .get(&class)
            .copied()
            .unwrap_or_default()
    }

    /// Live allocations across every pool.
    pub fn live_allocations(&self) -> usize {
        self.shared.pools.lock().values().map(|u| u.allocations).sum()
    }

    fn require_ray_tracing(&self, what: &str) -> Result<()> {
        debug_assert!(
            self.shared.capabilities.ray_tracing,
            "{what} requires ray tracing support"
        );
        if self.shared.capabilities.ray_tracing {
            Ok(())
        } else {
            Err(Error::Unsupported(format!("{what} requires ray tracing")))
        }
    }
}

impl fmt::Debug for SoftDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftDevice")
            .field("device_name", &self.shared.capabilities.device_name)
            .field("topology", &self.shared.topology)
            .field("live_allocations", &self.live_allocations())
            .finish()
    }
}

fn bound_buffers(buffers: &[&SoftBuffer], wrap: fn(Arc<crate::resource::BufferInner>) -> Bound) -> Vec<Bound> {
    buffers.iter().map(|b| wrap(Arc::clone(&b.0))).collect()
}

impl Device<SoftApi> for SoftDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.shared.capabilities
    }

    fn topology(&self) -> QueueTopology {
        self.shared.topology
    }

    fn create_graphics_queue(&self) -> Result<SoftGraphicsQueue> {
        Ok(SoftGraphicsQueue::new(Arc::clone(&self.shared)))
    }

    fn destroy_graphics_queue(&self, _queue: SoftGraphicsQueue) {}

    fn create_upload_queue(&self) -> Result<SoftUploadQueue> {
        Ok(SoftUploadQueue::new(Arc::clone(&self.shared)))
    }

    fn destroy_upload_queue(&self, _queue: SoftUploadQueue) {}

    fn create_graphics_command_buffer(&self) -> Result<SoftGraphicsCommandBuffer> {
        Ok(SoftGraphicsCommandBuffer::new(Arc::clone(&self.shared)))
    }

    fn reset_graphics_command_buffer(
        &self,
        command_buffer: &mut SoftGraphicsCommandBuffer,
    ) -> Result<()> {
        command_buffer.reset();
        Ok(())
    }

    fn destroy_graphics_command_buffer(&self, _command_buffer: SoftGraphicsCommandBuffer) {}

    fn create_upload_command_buffer(&self) -> Result<SoftUploadCommandBuffer> {
        Ok(SoftUploadCommandBuffer::new(Arc::clone(&self.shared)))
    }

    fn reset_upload_command_buffer(
        &self,
        command_buffer: &mut SoftUploadCommandBuffer,
    ) -> Result<()> {
        command_buffer.reset();
        Ok(())
    }

    fn destroy_upload_command_buffer(&self, _command_buffer: SoftUploadCommandBuffer) {}

    fn create_fence(&self, signaled: bool) -> Result<SoftFence> {
        Ok(SoftFence::new(signaled))
    }

    fn wait_for_fence(&self, fence: &SoftFence) -> Result<()> {
        fence.wait()
    }

    fn reset_fence(&self, fence: &SoftFence) -> Result<()> {
        fence.reset();
        Ok(())
    }

    fn destroy_fence(&self, _fence: SoftFence) {}

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<SoftDescriptorSetLayout> {
        if bindings
            .iter()
            .any(|b| b.descriptor_type == DescriptorType::TopLevelAccelerationStructure)
        {
            self.require_ray_tracing("TLAS descriptors")?;
        }
        Ok(SoftDescriptorSetLayout {
            bindings: bindings.to_vec(),
        })
    }

    fn destroy_descriptor_set_layout(&self, _layout: SoftDescriptorSetLayout) {}

    fn create_pipeline_layout(
        &self,
        set_layouts: &[&SoftDescriptorSetLayout],
    ) -> Result<SoftPipelineLayout> {
        Ok(SoftPipelineLayout {
            set_layouts: set_layouts.iter().map(|l| l.bindings.clone()).collect(),
        })
    }

    fn destroy_pipeline_layout(&self, _layout: SoftPipelineLayout) {}

    fn create_descriptor_set(&self, layout: &SoftDescriptorSetLayout) -> Result<SoftDescriptorSet> {
        Ok(SoftDescriptorSet::new(layout))
    }

    fn write_descriptor_set(
        &self,
        set: &mut SoftDescriptorSet,
        binding: u32,
        first_element: u32,
        resources: DescriptorResources<'_, SoftApi>,
    ) {
        let (descriptor_type, bound) = match resources {
            DescriptorResources::DynamicUniformBuffers { buffers, ranges } => {
                debug_assert_eq!(buffers.len(), ranges.len(), "one range per uniform buffer");
                let bound = buffers
                    .iter()
                    .zip(ranges)
                    .map(|(buffer, &range)| {
                        debug_assert_eq!(buffer.kind(), BufferKind::UniformUpload);
                        Bound::Uniform {
                            buffer: Arc::clone(&buffer.0),
                            range,
                        }
                    })
                    .collect();
                (DescriptorType::DynamicUniformBuffer, bound)
            }
            DescriptorResources::ReadOnlyStorageBuffers(views) => {
                let buffers: Vec<&SoftBuffer> = views.iter().map(|v| v.resource()).collect();
                (
                    DescriptorType::ReadOnlyStorageBuffer,
                    bound_buffers(&buffers, Bound::ReadOnlyStorage),
                )
            }
            DescriptorResources::StorageBuffers(views) => {
                let buffers: Vec<&SoftBuffer> = views.iter().map(|v| v.resource()).collect();
                (
                    DescriptorType::StorageBuffer,
                    bound_buffers(&buffers, Bound::Storage),
                )
            }
            DescriptorResources::SampledImages(views) => (
                DescriptorType::SampledImage,
                views
                    .iter()
                    .map(|v| Bound::SampledImage(Arc::clone(&v.resource().0)))
                    .collect(),
            ),
            DescriptorResources::SampledTargetImages(views) => (
                DescriptorType::SampledImage,
                views
                    .iter()
                    .map(|v| Bound::SampledTarget(Arc::clone(&v.resource().0)))
                    .collect(),
            ),
            DescriptorResources::StorageImages(views) => (
                DescriptorType::StorageImage,
                views
                    .iter()
                    .map(|v| Bound::StorageImage(Arc::clone(&v.resource().0)))
                    .collect(),
            ),
            DescriptorResources::Samplers(samplers) => (
                DescriptorType::Sampler,
                samplers.iter().map(|s| Bound::Sampler(s.filter)).collect(),
            ),
            DescriptorResources::TopLevelAccelerationStructures(structures) => (
                DescriptorType::TopLevelAccelerationStructure,
                structures
                    .iter()
                    .map(|s| {
                        debug_assert_eq!(s.0.kind, AccelerationStructureKind::Top);
                        Bound::Tlas(Arc::clone(&s.0))
                    })
                    .collect(),
            ),
        };
        set.write(binding, first_element, descriptor_type, bound);
    }

    fn destroy_descriptor_set(&self, _set: SoftDescriptorSet) {}

    fn create_compute_pipeline(
        &self,
        layout: &SoftPipelineLayout,
        code: &[u8],
    ) -> Result<SoftComputePipeline> {
        let name = std::str::from_utf8(code)
            .map_err(|_| Error::InvalidShader("kernel name is not UTF-8".to_string()))?;
        let kernel = self
            .shared
            .kernels
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidShader(format!("no kernel registered as {name:?}")))?;
        debug!(name, "created software compute pipeline");
        Ok(SoftComputePipeline {
            name: name.to_string(),
            kernel,
            set_count: layout.set_layouts.len(),
        })
    }

    fn destroy_compute_pipeline(&self, _pipeline: SoftComputePipeline) {}

    fn create_render_pass(
        &self,
        color_attachments: &[ColorAttachmentDesc],
        depth_stencil_attachment: Option<DepthStencilAttachmentDesc>,
    ) -> Result<SoftRenderPass> {
        if color_attachments.is_empty() && depth_stencil_attachment.is_none() {
            return Err(Error::InvalidState("render pass without attachments".to_string()));
        }
        Ok(SoftRenderPass {
            color: color_attachments.to_vec(),
            depth_stencil: depth_stencil_attachment,
        })
    }

    fn destroy_render_pass(&self, _render_pass: SoftRenderPass) {}

    fn create_graphics_pipeline(
        &self,
        render_pass: &SoftRenderPass,
        layout: &SoftPipelineLayout,
        vertex_code: &[u8],
        fragment_code: &[u8],
        depth_test: Option<CompareOp>,
    ) -> Result<SoftGraphicsPipeline> {
        if vertex_code.is_empty() || fragment_code.is_empty() {
            return Err(Error::InvalidShader("empty graphics shader".to_string()));
        }
        debug_assert!(
            depth_test.is_none() || render_pass.depth_stencil.is_some(),
            "depth test enabled for a render pass without a depth attachment"
        );
        let name = format!(
            "{}+{}",
            String::from_utf8_lossy(vertex_code),
            String::from_utf8_lossy(fragment_code)
        );
        debug!(%name, ?depth_test, "created software graphics pipeline");
        Ok(SoftGraphicsPipeline {
            name,
            render_pass: render_pass.clone(),
            set_count: layout.set_layouts.len(),
            depth_test,
        })
    }

    fn destroy_graphics_pipeline(&self, _pipeline: SoftGraphicsPipeline) {}

    fn create_frame_buffer(
        &self,
        render_pass: &SoftRenderPass,
        width: u32,
        height: u32,
        color_attachments: &[&SoftTargetImage],
        depth_stencil_attachment: Option<&SoftTargetImage>,
    ) -> Result<SoftFrameBuffer> {
        validate_frame_buffer(
            render_pass,
            width,
            height,
            color_attachments,
            depth_stencil_attachment,
        )?;
        Ok(SoftFrameBuffer {
            render_pass: render_pass.clone(),
            width,
            height,
            color: color_attachments.iter().map(|i| Arc::clone(&i.0)).collect(),
            depth_stencil: depth_stencil_attachment.map(|i| Arc::clone(&i.0)),
        })
    }

    fn destroy_frame_buffer(&self, _frame_buffer: SoftFrameBuffer) {}

    fn create_buffer(&self, kind: BufferKind, size: u64) -> Result<SoftBuffer> {
        if matches!(kind, BufferKind::Scratch | BufferKind::TlasInstanceUpload) {
            self.require_ray_tracing("acceleration structure buffers")?;
        }
        if size == 0 {
            return Err(Error::InvalidState("buffers must not be empty".to_string()));
        }
        self.shared.allocate(kind.pool_class(), size);
        debug!(?kind, size, "created buffer");
        Ok(SoftBuffer::new(kind, size))
    }

    fn destroy_buffer(&self, buffer: SoftBuffer) {
        self.shared.free(buffer.kind().pool_class(), buffer.size());
    }

    fn create_sampled_asset_image(
        &self,
        format: SampledAssetImageFormat,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> Result<SoftImage> {
        let supported = self.shared.capabilities.supports_format(format);
        debug_assert!(supported, "{format:?} is not supported by this device");
        if !supported {
            return Err(Error::Unsupported(format!("{format:?}")));
        }
        let max_levels = 32 - width.max(height).max(1).leading_zeros();
        if mip_levels == 0 || mip_levels > max_levels {
            return Err(Error::InvalidState(format!(
                "{mip_levels} mip levels requested for a {width}x{height} image"
            )));
        }
        let image = SoftImage::new(format, width, height, mip_levels);
        let bytes = (0..mip_levels)
            .map(|mip| {
                let (row, rows) = image.0.mip_layout(mip);
                (row * rows) as u64
            })
            .sum();
        self.shared.allocate(PoolClass::SampledAssetImage, bytes);
        debug!(?format, width, height, mip_levels, "created sampled asset image");
        Ok(image)
    }

    fn destroy_image(&self, image: SoftImage) {
        let bytes = (0..image.0.mips.len() as u32)
            .map(|mip| {
                let (row, rows) = image.0.mip_layout(mip);
                (row * rows) as u64
            })
            .sum();
        self.shared.free(PoolClass::SampledAssetImage, bytes);
    }

    fn create_target_image(
        &self,
        kind: TargetImageKind,
        width: u32,
        height: u32,
        allow_sampled: bool,
    ) -> Result<SoftTargetImage> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidState(format!("{width}x{height} {kind:?} image")));
        }
        let image = SoftTargetImage::new(kind, width, height, allow_sampled);
        self.shared.allocate(kind.pool_class(), image.byte_size());
        debug!(?kind, width, height, allow_sampled, "created target image");
        Ok(image)
    }

    fn destroy_target_image(&self, image: SoftTargetImage) {
        self.shared.free(image.kind().pool_class(), image.byte_size());
    }

    fn create_sampler(&self, filter: SamplerFilter) -> Result<SoftSampler> {
        Ok(SoftSampler { filter })
    }

    fn destroy_sampler(&self, _sampler: SoftSampler) {}

    fn intermediate_blas_sizes(&self, geometries: &[GeometryDesc]) -> AccelerationStructureSizes {
        sizing::intermediate_blas(geometries)
    }

    fn non_compacted_blas_sizes(&self, geometries: &[GeometryDesc]) -> AccelerationStructureSizes {
        sizing::non_compacted_blas(geometries)
    }

    fn tlas_sizes(&self, instance_count: u32) -> AccelerationStructureSizes {
        sizing::tlas(instance_count)
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        size: u64,
    ) -> Result<SoftAccelerationStructure> {
        self.require_ray_tracing("acceleration structures")?;
        let span = align_up(size.max(1), ACCELERATION_STRUCTURE_ALIGNMENT);
        let address = self.shared.next_address.fetch_add(span, Ordering::Relaxed);
        let structure = SoftAccelerationStructure::new(kind, size, address);
        self.shared
            .structures
            .write()
            .insert(address, Arc::downgrade(&structure.0));
        self.shared
            .allocate(PoolClass::for_acceleration_structure(kind), size);
        debug!(?kind, size, address = format_args!("{address:#x}"), "created acceleration structure");
        Ok(structure)
    }

    fn destroy_acceleration_structure(&self, structure: SoftAccelerationStructure) {
        self.shared.structures.write().remove(&structure.0.address);
        self.shared.free(
            PoolClass::for_acceleration_structure(structure.0.kind),
            structure.0.size,
        );
    }

    fn create_compacted_size_query_pool(&self, query_count: u32) -> Result<SoftQueryPool> {
        self.require_ray_tracing("compacted size queries")?;
        Ok(SoftQueryPool::new(query_count))
    }

    fn compacted_size(&self, pool: &SoftQueryPool, index: u32) -> Result<u64> {
        let slot = pool.0.slots.lock().get(index as usize).copied();
        match slot {
            Some(QuerySlot::Available(size)) => Ok(size),
            Some(QuerySlot::Pending(_)) => {
                debug_assert!(
                    false,
                    "compacted size {index} read before a fence covering its build was waited on"
                );
                Err(Error::InvalidState(format!("query {index} is not available")))
            }
            Some(QuerySlot::Unwritten) => {
                warn!(index, "compacted size read from an unwritten query slot");
                Err(Error::InvalidState(format!("query {index} was never written")))
            }
            None => Err(Error::InvalidState(format!("query {index} out of range"))),
        }
    }

    fn destroy_query_pool(&self, _pool: SoftQueryPool) {}
}

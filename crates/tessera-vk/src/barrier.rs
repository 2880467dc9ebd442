//! Translation of planned transfer barriers into Synchronization2 barriers.

use crate::format::{access_scope, image_layout};
use crate::resource::{VkAccelerationStructure, VkBuffer, VkImage, VkTargetImage};
use ash::vk;
use tessera_hal::transfer::{Access, BarrierHalf, TransferBarrier, TransferTarget};
use tessera_hal::TransferAssets;

/// Native scopes of one planned barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeScopes {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub src_family: u32,
    pub dst_family: u32,
    pub layouts: Option<(vk::ImageLayout, vk::ImageLayout)>,
}

/// Stages, accesses and queue families of `barrier`.
///
/// A release half waits on nothing after it and an acquire half blocks on
/// nothing before it; the semaphore between the two submissions orders them.
pub fn native_scopes(barrier: &TransferBarrier, ray_tracing: bool) -> NativeScopes {
    let (src_stage, src_access) = match barrier.half {
        BarrierHalf::Acquire => (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::empty()),
        BarrierHalf::Release | BarrierHalf::Full => access_scope(barrier.src_access, ray_tracing),
    };
    let (dst_stage, dst_access) = match barrier.half {
        BarrierHalf::Release => (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::empty()),
        BarrierHalf::Acquire | BarrierHalf::Full => access_scope(barrier.dst_access, ray_tracing),
    };
    NativeScopes {
        src_stage,
        src_access,
        dst_stage,
        dst_access,
        src_family: barrier.src_family.unwrap_or(vk::QUEUE_FAMILY_IGNORED),
        dst_family: barrier.dst_family.unwrap_or(vk::QUEUE_FAMILY_IGNORED),
        layouts: barrier
            .layouts
            .map(|(old, new)| (image_layout(old), image_layout(new))),
    }
}

/// Native barriers for one `release` or `acquire` batch.
#[derive(Default)]
pub struct TransferBarriers<'a> {
    pub buffers: Vec<vk::BufferMemoryBarrier2<'a>>,
    pub images: Vec<vk::ImageMemoryBarrier2<'a>>,
}

impl<'a> TransferBarriers<'a> {
    /// Resolve planned barriers against the assets they index.
    pub fn resolve(
        planned: &[TransferBarrier],
        buffers: &[&VkBuffer],
        images: &[&VkImage],
        structures: &[&VkAccelerationStructure],
        ray_tracing: bool,
    ) -> Self {
        let mut out = Self::default();
        for barrier in planned {
            let scopes = native_scopes(barrier, ray_tracing);
            match barrier.target {
                TransferTarget::Buffer(index) => {
                    out.buffers
                        .push(buffer_barrier(&scopes, buffers[index].raw()));
                }
                TransferTarget::AccelerationStructure(index) => {
                    out.buffers
                        .push(buffer_barrier(&scopes, structures[index].storage_buffer()));
                }
                TransferTarget::Image { index, mip_levels } => {
                    let (old_layout, new_layout) = scopes
                        .layouts
                        .unwrap_or((vk::ImageLayout::UNDEFINED, vk::ImageLayout::UNDEFINED));
                    out.images.push(
                        vk::ImageMemoryBarrier2::default()
                            .src_stage_mask(scopes.src_stage)
                            .src_access_mask(scopes.src_access)
                            .dst_stage_mask(scopes.dst_stage)
                            .dst_access_mask(scopes.dst_access)
                            .old_layout(old_layout)
                            .new_layout(new_layout)
                            .src_queue_family_index(scopes.src_family)
                            .dst_queue_family_index(scopes.dst_family)
                            .image(images[index].raw())
                            .subresource_range(color_range(0, mip_levels)),
                    );
                }
            }
        }
        out
    }

    /// Resolve against the Vulkan handles of `assets`.
    pub fn for_assets(
        planned: &[TransferBarrier],
        assets: &TransferAssets<'_, crate::VkApi>,
        ray_tracing: bool,
    ) -> Self {
        let images: Vec<&VkImage> = assets.images.iter().map(|t| t.image).collect();
        Self::resolve(
            planned,
            assets.buffers,
            &images,
            assets.acceleration_structures,
            ray_tracing,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }

    /// Record the barriers.
    ///
    /// # Safety
    /// The command buffer must be recording and every handle must be valid.
    pub unsafe fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }
        let dependency = vk::DependencyInfo::default()
            .buffer_memory_barriers(&self.buffers)
            .image_memory_barriers(&self.images);
        device.cmd_pipeline_barrier2(cmd, &dependency);
    }
}

fn buffer_barrier<'a>(scopes: &NativeScopes, buffer: vk::Buffer) -> vk::BufferMemoryBarrier2<'a> {
    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(scopes.src_stage)
        .src_access_mask(scopes.src_access)
        .dst_stage_mask(scopes.dst_stage)
        .dst_access_mask(scopes.dst_access)
        .src_queue_family_index(scopes.src_family)
        .dst_queue_family_index(scopes.dst_family)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

/// Color subresource range over `level_count` mips starting at `base_mip`.
pub fn color_range(base_mip: u32, level_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(base_mip)
        .level_count(level_count)
        .base_array_layer(0)
        .layer_count(1)
}

/// Record a global memory barrier between two access scopes.
///
/// # Safety
/// The command buffer must be recording.
pub unsafe fn memory_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: (vk::PipelineStageFlags2, vk::AccessFlags2),
    dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
) {
    let barrier = vk::MemoryBarrier2::default()
        .src_stage_mask(src.0)
        .src_access_mask(src.1)
        .dst_stage_mask(dst.0)
        .dst_access_mask(dst.1);
    let dependency =
        vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
    device.cmd_pipeline_barrier2(cmd, &dependency);
}

/// Record one same-queue buffer barrier per buffer.
///
/// # Safety
/// The command buffer must be recording and every buffer must be valid.
pub unsafe fn buffer_barriers(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffers: impl IntoIterator<Item = vk::Buffer>,
    src: (vk::PipelineStageFlags2, vk::AccessFlags2),
    dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
) {
    let scopes = NativeScopes {
        src_stage: src.0,
        src_access: src.1,
        dst_stage: dst.0,
        dst_access: dst.1,
        src_family: vk::QUEUE_FAMILY_IGNORED,
        dst_family: vk::QUEUE_FAMILY_IGNORED,
        layouts: None,
    };
    let barriers: Vec<vk::BufferMemoryBarrier2> = buffers
        .into_iter()
        .map(|buffer| buffer_barrier(&scopes, buffer))
        .collect();
    if barriers.is_empty() {
        return;
    }
    let dependency = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
    device.cmd_pipeline_barrier2(cmd, &dependency);
}

/// Which side of a compute pass a storage image barrier sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputePassEdge {
    Load,
    Store,
}

/// Layout transition of a storage image at one edge of a compute pass.
///
/// Loading discards previous contents. Storing leaves images created with
/// sampling allowed ready for shader reads.
pub const fn storage_image_layouts(
    edge: ComputePassEdge,
    allow_sampled: bool,
) -> (vk::ImageLayout, vk::ImageLayout) {
    match (edge, allow_sampled) {
        (ComputePassEdge::Load, _) => (vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL),
        (ComputePassEdge::Store, true) => (
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ),
        (ComputePassEdge::Store, false) => (vk::ImageLayout::GENERAL, vk::ImageLayout::GENERAL),
    }
}

/// Record one same-queue layout transition per storage image.
///
/// # Safety
/// The command buffer must be recording and every image must be valid.
pub unsafe fn storage_image_barriers(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    images: &[&VkTargetImage],
    edge: ComputePassEdge,
    src: (vk::PipelineStageFlags2, vk::AccessFlags2),
    dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
) {
    let barriers: Vec<vk::ImageMemoryBarrier2> = images
        .iter()
        .map(|image| {
            let (old_layout, new_layout) = storage_image_layouts(edge, image.allow_sampled);
            vk::ImageMemoryBarrier2::default()
                .src_stage_mask(src.0)
                .src_access_mask(src.1)
                .dst_stage_mask(dst.0)
                .dst_access_mask(dst.1)
                .old_layout(old_layout)
                .new_layout(new_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.raw())
                .subresource_range(image.range())
        })
        .collect();
    if barriers.is_empty() {
        return;
    }
    let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
    device.cmd_pipeline_barrier2(cmd, &dependency);
}

/// Scope of acceleration structure writes by builds, updates and copies.
pub fn structure_write_scope() -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    access_scope(Access::ACCELERATION_STRUCTURE_WRITE, true)
}

/// Scope of acceleration structure reads by builds, property queries and traversal.
pub fn structure_read_scope() -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    access_scope(Access::ACCELERATION_STRUCTURE_READ, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_hal::transfer::{plan_acquire, plan_release, QueueTopology, TransferShape};

    const DEDICATED: QueueTopology = QueueTopology::Dedicated {
        graphics_family: 0,
        upload_family: 1,
    };

    fn shape() -> TransferShape {
        TransferShape {
            buffers: 1,
            image_mip_levels: vec![3],
            acceleration_structures: 1,
        }
    }

    #[test]
    fn release_half_only_makes_writes_available() {
        let release = plan_release(DEDICATED, &shape());
        let scopes = native_scopes(&release[0], true);
        assert_eq!(scopes.src_stage, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(scopes.src_access, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(scopes.dst_stage, vk::PipelineStageFlags2::NONE);
        assert!(scopes.dst_access.is_empty());
        assert_eq!((scopes.src_family, scopes.dst_family), (1, 0));
    }

    #[test]
    fn acquire_half_matches_release_families_and_layouts() {
        let release = plan_release(DEDICATED, &shape());
        let acquire = plan_acquire(DEDICATED, &shape());
        for (r, a) in release.iter().zip(&acquire) {
            let (r, a) = (native_scopes(r, true), native_scopes(a, true));
            assert_eq!((r.src_family, r.dst_family), (a.src_family, a.dst_family));
            assert_eq!(r.layouts, a.layouts);
            assert_eq!(a.src_stage, vk::PipelineStageFlags2::NONE);
        }
        let image = native_scopes(&acquire[1], true);
        assert_eq!(
            image.layouts,
            Some((
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            ))
        );
        let structure = native_scopes(&acquire[2], true);
        assert!(structure
            .dst_access
            .contains(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR));
    }

    #[test]
    fn unified_acquire_keeps_ownership() {
        let acquire = plan_acquire(QueueTopology::Unified { family: 0 }, &shape());
        let scopes = native_scopes(&acquire[0], false);
        assert_eq!(scopes.src_family, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(scopes.dst_family, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(scopes.src_stage, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(scopes.dst_stage, vk::PipelineStageFlags2::COMPUTE_SHADER);
    }

    #[test]
    fn storage_images_end_readable_only_when_sampled() {
        assert_eq!(
            storage_image_layouts(ComputePassEdge::Load, true),
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL)
        );
        assert_eq!(
            storage_image_layouts(ComputePassEdge::Store, true).1,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            storage_image_layouts(ComputePassEdge::Store, false).1,
            vk::ImageLayout::GENERAL
        );
    }
}

//! Software backend for the Tessera graphics abstraction layer.
//!
//! Every command is captured at record time and executed on the host when
//! submitted. Acceleration structures are real BVHs that compute kernels can
//! trace rays against, so the ownership protocol and the BLAS compaction
//! pipeline can be exercised without a GPU. Render passes apply their clears
//! but draws are only recorded. Caller contract violations that a
//! hardware backend would leave undefined are debug assertions here.

pub mod bvh;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod pass;
pub mod queue;
pub mod resource;
pub mod sizing;
pub mod structure;
mod sync;

pub use bvh::{Aabb, Bvh};
pub use command::{SoftGraphicsCommandBuffer, SoftUploadCommandBuffer};
pub use config::SoftConfig;
pub use descriptor::{
    Dispatch, Kernel, SoftComputePipeline, SoftDescriptorSet, SoftDescriptorSetLayout,
    SoftPipelineLayout,
};
pub use device::{PoolUsage, SoftDevice};
pub use pass::{SoftFrameBuffer, SoftGraphicsPipeline, SoftRenderPass};
pub use queue::{SoftGraphicsQueue, SoftUploadQueue};
pub use resource::{
    SoftAccelerationStructure, SoftBuffer, SoftImage, SoftQueryPool, SoftSampler, SoftTargetImage,
};
pub use structure::{Hit, Ray, RayFlags};
pub use sync::SoftFence;

use raw_window_handle::RawDisplayHandle;
use tessera_core::Result;
use tessera_hal::Api;
use tracing::info;

/// The software backend.
#[derive(Clone, Debug)]
pub struct SoftApi;

impl SoftApi {
    pub const BACKEND_NAME: &'static str = "software";
}

impl Api for SoftApi {
    const NAME: &'static str = Self::BACKEND_NAME;

    type Device = SoftDevice;
    type GraphicsQueue = SoftGraphicsQueue;
    type UploadQueue = SoftUploadQueue;
    type GraphicsCommandBuffer = SoftGraphicsCommandBuffer;
    type UploadCommandBuffer = SoftUploadCommandBuffer;
    type Fence = SoftFence;

    type DescriptorSetLayout = SoftDescriptorSetLayout;
    type PipelineLayout = SoftPipelineLayout;
    type DescriptorSet = SoftDescriptorSet;
    type ComputePipeline = SoftComputePipeline;
    type RenderPass = SoftRenderPass;
    type FrameBuffer = SoftFrameBuffer;
    type GraphicsPipeline = SoftGraphicsPipeline;

    type Buffer = SoftBuffer;
    type Image = SoftImage;
    type TargetImage = SoftTargetImage;
    type Sampler = SoftSampler;
    type AccelerationStructure = SoftAccelerationStructure;
    type QueryPool = SoftQueryPool;

    fn init_device(
        display: Option<RawDisplayHandle>,
        support_ray_tracing: bool,
    ) -> Result<SoftDevice> {
        if display.is_some() {
            info!("Software backend ignores the display handle");
        }
        Ok(SoftDevice::new(
            SoftConfig::default().ray_tracing(support_ray_tracing),
        ))
    }

    fn destroy_device(device: SoftDevice) {
        let live = device.live_allocations();
        debug_assert_eq!(live, 0, "device destroyed with {live} live allocations");
        info!("Destroyed software device");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::TopLevelData;
    use approx::assert_relative_eq;
    use std::sync::Arc;
    use glam::{Affine3A, Vec3};
    use tessera_core::format::mip_extent;
    use tessera_core::{
        BufferKind, ClearValues, ColorAttachmentDesc, ColorAttachmentImageFormat, ColorLoadOp,
        ColorStoreOp, CompareOp, DepthStencilAttachmentDesc, DepthStencilLoadOp,
        DepthStencilStoreOp, DescriptorBinding, DescriptorType, GeometryDesc, InstanceFlags,
        PoolClass, SampledAssetImageFormat, SamplerFilter, StorageImageFormat, TargetImageKind,
        TlasInstance,
    };
    use tessera_hal::transfer::{BarrierHalf, ImageLayout, TransferTarget};
    use tessera_hal::{
        blas_reference, Buffer, Device, DynamicBlas, GraphicsCommandBuffer, GraphicsQueue, Image,
        ImageTransfer, MeasuredBlasBatch, StaticBlasBatch, TargetImage, TopLevel, TransferAssets,
        TriangleGeometry, UploadCommandBuffer, UploadQueue,
    };

    struct Queues {
        graphics: SoftGraphicsQueue,
        upload: SoftUploadQueue,
    }

    fn queues(device: &SoftDevice) -> Queues {
        Queues {
            graphics: device.create_graphics_queue().unwrap(),
            upload: device.create_upload_queue().unwrap(),
        }
    }

    fn staged(device: &SoftDevice, bytes: &[u8]) -> SoftBuffer {
        let staging = device
            .create_buffer(BufferKind::StagingUpload, bytes.len() as u64)
            .unwrap();
        staging.write_bytes(0, bytes).unwrap();
        staging
    }

    /// Upload `bytes` into a new storage asset and record its transfer.
    fn record_asset_upload(
        device: &SoftDevice,
        bytes: &[u8],
    ) -> (SoftBuffer, SoftBuffer, SoftUploadCommandBuffer, SoftGraphicsCommandBuffer) {
        let staging = staged(device, bytes);
        let asset = device
            .create_buffer(BufferKind::StorageAsset, bytes.len() as u64)
            .unwrap();
        let mut upload = device.create_upload_command_buffer().unwrap();
        upload.begin().unwrap();
        upload.upload_buffer(&asset, 0, &staging, 0, bytes.len() as u64);
        upload.release(&TransferAssets::buffers(&[&asset]));
        upload.end().unwrap();

        let mut graphics = device.create_graphics_command_buffer().unwrap();
        graphics.begin().unwrap();
        graphics.acquire(&TransferAssets::buffers(&[&asset]));
        (staging, asset, upload, graphics)
    }

    #[test]
    fn dedicated_transfer_pairs_release_and_acquire() {
        let device = SoftDevice::new(SoftConfig::default());
        let (_staging, _asset, upload, mut graphics) = record_asset_upload(&device, &[7; 32]);
        graphics.end().unwrap();

        let release: Vec<_> = upload.transfer_barriers().collect();
        let acquire: Vec<_> = graphics.transfer_barriers().collect();
        assert_eq!(release.len(), 1);
        assert_eq!(acquire.len(), 1);
        assert_eq!(release[0].half, BarrierHalf::Release);
        assert_eq!(acquire[0].half, BarrierHalf::Acquire);
        assert_eq!(release[0].src_family, acquire[0].src_family);
        assert_eq!(release[0].dst_family, acquire[0].dst_family);
    }

    #[test]
    fn unified_transfer_records_one_full_barrier() {
        let device = SoftDevice::new(SoftConfig::default().unified());
        let (_staging, _asset, upload, mut graphics) = record_asset_upload(&device, &[7; 32]);
        graphics.end().unwrap();

        assert_eq!(upload.transfer_barriers().count(), 0);
        let acquire: Vec<_> = graphics.transfer_barriers().collect();
        assert_eq!(acquire.len(), 1);
        assert_eq!(acquire[0].half, BarrierHalf::Full);
        assert_eq!(acquire[0].src_family, None);
    }

    #[test]
    fn uploaded_asset_is_copied_by_a_compute_kernel() {
        let device = SoftDevice::new(SoftConfig::default());
        device.register_kernel("copy", |dispatch| {
            let size = dispatch.storage_size(0, 0)?;
            let mut bytes = vec![0; size as usize];
            dispatch.read_storage(0, 0, 0, &mut bytes)?;
            dispatch.write_storage(0, 1, 0, &bytes)
        });
        let q = queues(&device);
        let payload: Vec<u8> = (0..=255).collect();
        let (staging, asset, upload, mut graphics) = record_asset_upload(&device, &payload);
        let readback = device
            .create_buffer(BufferKind::Readback, payload.len() as u64)
            .unwrap();

        let set_layout = device
            .create_descriptor_set_layout(&[
                DescriptorBinding::single(0, DescriptorType::ReadOnlyStorageBuffer),
                DescriptorBinding::single(1, DescriptorType::StorageBuffer),
            ])
            .unwrap();
        let layout = device.create_pipeline_layout(&[&set_layout]).unwrap();
        let pipeline = device.create_compute_pipeline(&layout, b"copy").unwrap();
        let mut set = device.create_descriptor_set(&set_layout).unwrap();
        device.write_descriptor_set(
            &mut set,
            0,
            0,
            tessera_hal::DescriptorResources::ReadOnlyStorageBuffers(&[
                asset.as_read_only_storage()
            ]),
        );
        device.write_descriptor_set(
            &mut set,
            1,
            0,
            tessera_hal::DescriptorResources::StorageBuffers(&[readback.as_storage()]),
        );

        graphics.compute_pass_load(&[readback.as_storage()], &[]);
        graphics.bind_compute_pipeline(&pipeline);
        graphics.bind_compute_descriptor_sets(&layout, &[&set], &[]);
        graphics.dispatch(1, 1, 1);
        graphics.compute_pass_store(&[readback.as_storage()], &[]);
        graphics.end().unwrap();

        let fence = device.create_fence(false).unwrap();
        q.upload.submit_and_signal(&upload).unwrap();
        q.graphics.wait_and_submit(Some(&upload), &graphics, &fence).unwrap();
        device.wait_for_fence(&fence).unwrap();

        let mut out = vec![0; payload.len()];
        readback.read_bytes(0, &mut out).unwrap();
        assert_eq!(out, payload);

        device.destroy_fence(fence);
        device.destroy_descriptor_set(set);
        device.destroy_compute_pipeline(pipeline);
        device.destroy_pipeline_layout(layout);
        device.destroy_descriptor_set_layout(set_layout);
        device.destroy_upload_command_buffer(upload);
        device.destroy_graphics_command_buffer(graphics);
        for buffer in [staging, asset, readback] {
            device.destroy_buffer(buffer);
        }
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "acquire set does not match release set")]
    fn mismatched_acquire_panics_at_submit() {
        let device = SoftDevice::new(SoftConfig::default().unified());
        let q = queues(&device);
        let (_staging, _asset, upload, mut graphics) = record_asset_upload(&device, &[1; 8]);
        let other = device.create_buffer(BufferKind::StorageAsset, 8).unwrap();
        let staging = staged(&device, &[2; 8]);
        let mut other_upload = device.create_upload_command_buffer().unwrap();
        other_upload.begin().unwrap();
        other_upload.upload_buffer(&other, 0, &staging, 0, 8);
        other_upload.release(&TransferAssets::buffers(&[&other]));
        other_upload.end().unwrap();
        graphics.acquire(&TransferAssets::buffers(&[&other]));
        graphics.end().unwrap();

        let fence = device.create_fence(false).unwrap();
        q.upload.submit_and_signal(&upload).unwrap();
        let _ = q.graphics.wait_and_submit(Some(&upload), &graphics, &fence);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "acquire it first")]
    fn reading_an_unacquired_asset_panics() {
        let device = SoftDevice::new(SoftConfig::default());
        device.register_kernel("noop", |_| Ok(()));
        let asset = device.create_buffer(BufferKind::StorageAsset, 16).unwrap();
        let set_layout = device
            .create_descriptor_set_layout(&[DescriptorBinding::single(
                0,
                DescriptorType::ReadOnlyStorageBuffer,
            )])
            .unwrap();
        let layout = device.create_pipeline_layout(&[&set_layout]).unwrap();
        let mut set = device.create_descriptor_set(&set_layout).unwrap();
        device.write_descriptor_set(
            &mut set,
            0,
            0,
            tessera_hal::DescriptorResources::ReadOnlyStorageBuffers(&[
                asset.as_read_only_storage()
            ]),
        );
        let mut graphics = device.create_graphics_command_buffer().unwrap();
        graphics.begin().unwrap();
        graphics.bind_compute_descriptor_sets(&layout, &[&set], &[]);
    }

    fn quad_vertices() -> Vec<u8> {
        let corners = [
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
        ];
        corners
            .iter()
            .flat_map(|c| bytemuck::bytes_of(&c.to_array()).to_vec())
            .collect()
    }

    /// Upload a quad into a build input buffer and record its static build.
    fn record_static_quad(
        device: &SoftDevice,
        upload: &mut SoftUploadCommandBuffer,
        staging: &SoftBuffer,
        vertices: &SoftBuffer,
    ) -> StaticBlasBatch<SoftApi> {
        upload.begin().unwrap();
        upload.upload_buffer(vertices, 0, staging, 0, vertices.size());
        let geometry = [TriangleGeometry::<SoftApi>::triangles(vertices, 6)];
        let batch = StaticBlasBatch::record(device, upload, &[&geometry]).unwrap();
        upload.end().unwrap();
        batch
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "before a fence covering its build was waited on")]
    fn compaction_before_the_fence_wait_panics() {
        use tessera_core::{AccelerationStructureKind, BlasKind};

        let device = SoftDevice::new(SoftConfig::default());
        let q = queues(&device);
        let bytes = quad_vertices();
        let staging = staged(&device, &bytes);
        let vertices = device
            .create_buffer(BufferKind::StorageAsset, bytes.len() as u64)
            .unwrap();
        let mut upload = device.create_upload_command_buffer().unwrap();
        let _batch = record_static_quad(&device, &mut upload, &staging, &vertices);
        let fence = device.create_fence(false).unwrap();
        q.upload.submit_with_fence(&upload, &fence).unwrap();

        let src = device
            .create_acceleration_structure(AccelerationStructureKind::Bottom(BlasKind::NonCompacted), 4096)
            .unwrap();
        let dst = device
            .create_acceleration_structure(AccelerationStructureKind::Bottom(BlasKind::Compacted), 256)
            .unwrap();
        upload.begin().unwrap();
        upload.compact_blas(&dst, &src);
    }

    #[test]
    fn static_blas_is_compacted_and_traced() {
        let device = SoftDevice::new(SoftConfig::default());
        let q = queues(&device);
        let bytes = quad_vertices();
        let staging = staged(&device, &bytes);
        let vertices = device
            .create_buffer(BufferKind::StorageAsset, bytes.len() as u64)
            .unwrap();

        let mut upload = device.create_upload_command_buffer().unwrap();
        let batch = record_static_quad(&device, &mut upload, &staging, &vertices);
        let fence = device.create_fence(false).unwrap();
        q.upload.submit_with_fence(&upload, &fence).unwrap();
        device.wait_for_fence(&fence).unwrap();
        device.reset_fence(&fence).unwrap();

        let measured = batch.measure(&device).unwrap();
        let compacted_size = measured.compacted_sizes()[0];
        assert!(compacted_size <= measured.non_compacted_sizes()[0]);

        device.reset_upload_command_buffer(&mut upload).unwrap();
        upload.begin().unwrap();
        let (compacted, retiring) = measured.record_compaction(&device, &mut upload).unwrap();
        upload.end().unwrap();

        let mut tlas = TopLevel::<SoftApi>::new(&device, 4).unwrap();
        tlas.write_instance_of(
            0,
            &compacted[0],
            TlasInstance::new(0, 42).with_affine(glam::Affine3A::from_translation(Vec3::new(
                0.0, 0.0, -5.0,
            ))),
        )
        .unwrap();

        let mut graphics = device.create_graphics_command_buffer().unwrap();
        graphics.begin().unwrap();
        let acquired: Vec<&SoftAccelerationStructure> = compacted.iter().collect();
        graphics.acquire(&TransferAssets::acceleration_structures(&acquired));
        tlas.record_build(&mut graphics, 1);
        graphics.end().unwrap();

        q.upload.submit_and_signal(&upload).unwrap();
        q.graphics.wait_and_submit(Some(&upload), &graphics, &fence).unwrap();
        device.wait_for_fence(&fence).unwrap();
        retiring.retire(&device);

        let hit = tlas
            .structure()
            .trace(&Ray::new(Vec3::new(0.25, 0.25, 0.0), Vec3::NEG_Z))
            .expect("ray should hit the quad");
        assert_eq!(hit.instance_id, 42);
        assert_eq!(hit.instance_index, 0);
        assert!((hit.t - 5.0).abs() < 1e-5);
        assert!(tlas
            .structure()
            .trace(&Ray::new(Vec3::new(3.0, 0.0, 0.0), Vec3::NEG_Z))
            .is_none());

        tlas.destroy(&device);
        for structure in compacted {
            device.destroy_acceleration_structure(structure);
        }
        device.destroy_buffer(vertices);
        device.destroy_buffer(staging);
        device.destroy_fence(fence);
        device.destroy_upload_command_buffer(upload);
        device.destroy_graphics_command_buffer(graphics);
        assert_eq!(device.live_allocations(), 0);
    }

    /// Build the static quad on the upload queue and read its compacted size.
    fn measured_quad(
        device: &SoftDevice,
        q: &Queues,
        fence: &SoftFence,
    ) -> (SoftBuffer, SoftBuffer, SoftUploadCommandBuffer, MeasuredBlasBatch<SoftApi>) {
        let bytes = quad_vertices();
        let staging = staged(device, &bytes);
        let vertices = device
            .create_buffer(BufferKind::StorageAsset, bytes.len() as u64)
            .unwrap();
        let mut upload = device.create_upload_command_buffer().unwrap();
        let batch = record_static_quad(device, &mut upload, &staging, &vertices);
        q.upload.submit_with_fence(&upload, fence).unwrap();
        device.wait_for_fence(fence).unwrap();
        device.reset_fence(fence).unwrap();
        let measured = batch.measure(device).unwrap();
        (staging, vertices, upload, measured)
    }

    fn ray_grid() -> impl Iterator<Item = Ray> {
        (-8..=8).flat_map(|y| {
            (-8..=8).map(move |x| {
                Ray::new(
                    Vec3::new(x as f32 * 0.25, y as f32 * 0.25, 0.0),
                    Vec3::NEG_Z,
                )
            })
        })
    }

    #[test]
    fn compacted_and_non_compacted_tlas_trace_alike() {
        let device = SoftDevice::new(SoftConfig::default());
        let q = queues(&device);
        let fence = device.create_fence(false).unwrap();
        let (staging, vertices, mut upload, measured) = measured_quad(&device, &q, &fence);
        let placement = |blas_address| {
            TlasInstance::new(blas_address, 3).with_affine(Affine3A::from_rotation_translation(
                glam::Quat::from_rotation_z(0.4),
                Vec3::new(0.5, 0.0, -5.0),
            ))
        };

        // Non-compacted structures cannot be instanced through the device, so
        // place the built contents directly.
        let non_compacted = Arc::clone(&measured.non_compacted().next().unwrap().0);
        let records = [placement(non_compacted.address).to_record()];
        let reference = TopLevelData::build(&records, |address| {
            (address == non_compacted.address).then(|| Arc::clone(&non_compacted))
        })
        .unwrap();

        device.reset_upload_command_buffer(&mut upload).unwrap();
        upload.begin().unwrap();
        let (compacted, retiring) = measured.record_compaction(&device, &mut upload).unwrap();
        upload.end().unwrap();
        let mut tlas = TopLevel::<SoftApi>::new(&device, 1).unwrap();
        tlas.write_instances(&[placement(blas_reference(&compacted[0]))]).unwrap();
        let mut graphics = device.create_graphics_command_buffer().unwrap();
        graphics.begin().unwrap();
        let acquired: Vec<&SoftAccelerationStructure> = compacted.iter().collect();
        graphics.acquire(&TransferAssets::acceleration_structures(&acquired));
        tlas.record_build(&mut graphics, 1);
        graphics.end().unwrap();
        q.upload.submit_and_signal(&upload).unwrap();
        q.graphics.wait_and_submit(Some(&upload), &graphics, &fence).unwrap();
        device.wait_for_fence(&fence).unwrap();

        let mut hits = 0;
        for ray in ray_grid() {
            let expected = reference.trace(&ray);
            let actual = tlas.structure().trace(&ray);
            assert_eq!(
                expected.map(|h| (h.instance_id, h.primitive_index)),
                actual.map(|h| (h.instance_id, h.primitive_index)),
                "{ray:?}"
            );
            if let (Some(expected), Some(actual)) = (expected, actual) {
                assert_relative_eq!(expected.t, actual.t);
                hits += 1;
            }
        }
        assert!(hits > 0);

        drop(reference);
        drop(non_compacted);
        retiring.retire(&device);
        tlas.destroy(&device);
        for structure in compacted {
            device.destroy_acceleration_structure(structure);
        }
        device.destroy_buffer(vertices);
        device.destroy_buffer(staging);
        device.destroy_fence(fence);
        device.destroy_upload_command_buffer(upload);
        device.destroy_graphics_command_buffer(graphics);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn tlas_instances_keep_their_own_transform_id_mask_and_flags() {
        let device = SoftDevice::new(SoftConfig::default().unified());
        let q = queues(&device);
        let fence = device.create_fence(false).unwrap();
        let (staging, vertices, mut upload, measured) = measured_quad(&device, &q, &fence);
        device.reset_upload_command_buffer(&mut upload).unwrap();
        upload.begin().unwrap();
        let (compacted, retiring) = measured.record_compaction(&device, &mut upload).unwrap();
        upload.end().unwrap();

        let blas = blas_reference(&compacted[0]);
        let mut tlas = TopLevel::<SoftApi>::new(&device, 2).unwrap();
        tlas.write_instances(&[
            TlasInstance::new(blas, 11)
                .with_affine(Affine3A::from_translation(Vec3::new(0.0, 0.0, -5.0)))
                .with_mask(0x01),
            TlasInstance::new(blas, 22)
                .with_affine(Affine3A::from_translation(Vec3::new(10.0, 0.0, -3.0)))
                .with_mask(0x02)
                .with_flags(InstanceFlags::FRONT_COUNTER_CLOCKWISE),
        ])
        .unwrap();

        let mut graphics = device.create_graphics_command_buffer().unwrap();
        graphics.begin().unwrap();
        let acquired: Vec<&SoftAccelerationStructure> = compacted.iter().collect();
        graphics.acquire(&TransferAssets::acceleration_structures(&acquired));
        tlas.record_build(&mut graphics, 2);
        graphics.end().unwrap();
        q.upload.submit_and_signal(&upload).unwrap();
        q.graphics.wait_and_submit(Some(&upload), &graphics, &fence).unwrap();
        device.wait_for_fence(&fence).unwrap();
        retiring.retire(&device);

        let near_ray = Ray::new(Vec3::new(0.25, 0.25, 0.0), Vec3::NEG_Z);
        let far_ray = Ray::new(Vec3::new(10.25, 0.25, 0.0), Vec3::NEG_Z);
        let near = tlas.structure().trace(&near_ray).expect("first instance");
        let far = tlas.structure().trace(&far_ray).expect("second instance");
        assert_eq!((near.instance_index, near.instance_id), (0, 11));
        assert_eq!((far.instance_index, far.instance_id), (1, 22));
        assert_relative_eq!(near.t, 5.0, epsilon = 1e-5);
        assert_relative_eq!(far.t, 3.0, epsilon = 1e-5);
        assert_ne!(near.front_face, far.front_face);
        assert!(tlas.structure().trace(&near_ray.with_cull_mask(0x02)).is_none());
        assert!(tlas.structure().trace(&far_ray.with_cull_mask(0x01)).is_none());

        tlas.destroy(&device);
        for structure in compacted {
            device.destroy_acceleration_structure(structure);
        }
        device.destroy_buffer(vertices);
        device.destroy_buffer(staging);
        device.destroy_fence(fence);
        device.destroy_upload_command_buffer(upload);
        device.destroy_graphics_command_buffer(graphics);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn repeated_intermediate_update_matches_a_single_update() {
        let device = SoftDevice::new(SoftConfig::default());
        let q = queues(&device);
        let bytes = quad_vertices();
        let (staging, vertices, upload, mut graphics) = record_asset_upload(&device, &bytes);
        let geometry = [TriangleGeometry::<SoftApi>::triangles(&vertices, 6)];
        let mut blas = DynamicBlas::<SoftApi>::new(&device, &[GeometryDesc::triangles(6)]).unwrap();
        blas.record_build(&mut graphics, &geometry);
        let mut tlas = TopLevel::<SoftApi>::new(&device, 1).unwrap();
        tlas.write_instance_of(
            0,
            blas.structure(),
            TlasInstance::new(0, 5).with_affine(Affine3A::from_translation(Vec3::new(0.0, 0.0, -2.0))),
        )
        .unwrap();
        tlas.record_build(&mut graphics, 1);
        graphics.end().unwrap();
        let fence = device.create_fence(false).unwrap();
        q.upload.submit_and_signal(&upload).unwrap();
        q.graphics.wait_and_submit(Some(&upload), &graphics, &fence).unwrap();
        device.wait_for_fence(&fence).unwrap();
        device.reset_fence(&fence).unwrap();
        let trace_all = |tlas: &TopLevel<SoftApi>| -> Vec<Option<Hit>> {
            ray_grid().map(|ray| tlas.structure().trace(&ray)).collect()
        };
        let built = trace_all(&tlas);

        let mut updated = Vec::new();
        for _ in 0..2 {
            device.reset_graphics_command_buffer(&mut graphics).unwrap();
            graphics.begin().unwrap();
            blas.record_update(&mut graphics, &[vertices.as_build_input()]);
            tlas.record_update(&mut graphics);
            graphics.end().unwrap();
            q.graphics.wait_and_submit(None, &graphics, &fence).unwrap();
            device.wait_for_fence(&fence).unwrap();
            device.reset_fence(&fence).unwrap();
            updated.push(trace_all(&tlas));
        }
        assert_eq!(updated[0], updated[1]);
        assert_eq!(built, updated[0]);
        assert!(built.iter().any(Option::is_some));

        tlas.destroy(&device);
        blas.destroy(&device);
        device.destroy_buffer(vertices);
        device.destroy_buffer(staging);
        device.destroy_fence(fence);
        device.destroy_upload_command_buffer(upload);
        device.destroy_graphics_command_buffer(graphics);
        assert_eq!(device.live_allocations(), 0);
    }

    /// Stage every mip of `image` at pitch-aligned rows and record its uploads.
    ///
    /// Returns the staging buffer and the tightly packed contents of each mip.
    fn record_image_upload(
        device: &SoftDevice,
        upload: &mut SoftUploadCommandBuffer,
        image: &SoftImage,
    ) -> (SoftBuffer, Vec<Vec<u8>>) {
        let caps = device.capabilities().clone();
        let format = image.format();
        let mut regions = Vec::new();
        let mut offset = 0;
        for mip in 0..image.mip_levels() {
            let width = mip_extent(image.width(), mip);
            let row_size = format.row_size(width) as usize;
            let rows = format.row_count(mip_extent(image.height(), mip));
            let pitch = caps.staging_row_pitch(format, width);
            offset = caps.align_staging_offset(offset);
            regions.push((mip, offset, pitch, rows, row_size));
            offset += pitch * u64::from(rows);
        }

        let staging = device.create_buffer(BufferKind::StagingUpload, offset).unwrap();
        staging.write_bytes(0, &vec![0xee; offset as usize]).unwrap();
        let mut expected = Vec::new();
        for &(mip, offset, pitch, rows, row_size) in &regions {
            let mut packed = Vec::new();
            for row in 0..u64::from(rows) {
                let bytes: Vec<u8> = (0..row_size)
                    .map(|i| (mip as usize * 61 + row as usize * 7 + i) as u8)
                    .collect();
                staging.write_bytes(offset + row * pitch, &bytes).unwrap();
                packed.extend(bytes);
            }
            expected.push(packed);
        }

        upload.begin().unwrap();
        for &(mip, offset, pitch, rows, _) in &regions {
            upload.upload_image(image, mip, &staging, offset, pitch as u32, rows);
        }
        upload.release(&TransferAssets {
            images: &[ImageTransfer::<SoftApi>::all_mips(image)],
            ..TransferAssets::default()
        });
        upload.end().unwrap();
        (staging, expected)
    }

    #[test]
    fn image_mips_round_trip_through_transfer() {
        let configs = [
            SoftConfig::default(),
            SoftConfig::default().unified().texture_compression(true, false),
        ];
        for config in configs {
            for format in [SampledAssetImageFormat::R8G8B8A8Unorm, SampledAssetImageFormat::Bc7Unorm] {
                let device = SoftDevice::new(config.clone());
                let dedicated = device.topology().is_dedicated();
                let q = queues(&device);
                let image = device.create_sampled_asset_image(format, 5, 3, 3).unwrap();
                let mut upload = device.create_upload_command_buffer().unwrap();
                let (staging, expected) = record_image_upload(&device, &mut upload, &image);

                let mut graphics = device.create_graphics_command_buffer().unwrap();
                graphics.begin().unwrap();
                graphics.acquire(&TransferAssets {
                    images: &[ImageTransfer::<SoftApi>::all_mips(&image)],
                    ..TransferAssets::default()
                });
                graphics.end().unwrap();

                let layouts = Some((ImageLayout::TransferDestination, ImageLayout::ShaderReadOnly));
                let target = TransferTarget::Image {
                    index: 0,
                    mip_levels: 3,
                };
                let release: Vec<_> = upload.transfer_barriers().collect();
                let acquire: Vec<_> = graphics.transfer_barriers().collect();
                assert_eq!(acquire.len(), 1);
                assert_eq!((acquire[0].target, acquire[0].layouts), (target, layouts));
                if dedicated {
                    assert_eq!(release.len(), 1);
                    assert_eq!((release[0].target, release[0].layouts), (target, layouts));
                    assert_eq!(release[0].half, BarrierHalf::Release);
                    assert_eq!(acquire[0].half, BarrierHalf::Acquire);
                } else {
                    assert!(release.is_empty());
                    assert_eq!(acquire[0].half, BarrierHalf::Full);
                }

                let fence = device.create_fence(false).unwrap();
                q.upload.submit_and_signal(&upload).unwrap();
                q.graphics.wait_and_submit(Some(&upload), &graphics, &fence).unwrap();
                device.wait_for_fence(&fence).unwrap();
                for (mip, packed) in (0u32..).zip(&expected) {
                    assert_eq!(image.mip_data(mip).as_ref(), Some(packed), "{format:?} mip {mip}");
                }

                device.destroy_image(image);
                device.destroy_buffer(staging);
                device.destroy_fence(fence);
                device.destroy_upload_command_buffer(upload);
                device.destroy_graphics_command_buffer(graphics);
                assert_eq!(device.live_allocations(), 0);
            }
        }
    }

    #[test]
    fn failed_graphics_submission_keeps_the_upload_wait() {
        let device = SoftDevice::new(SoftConfig::default());
        let q = queues(&device);
        let bytes = quad_vertices();
        let staging = staged(&device, &bytes);
        let vertices = device
            .create_buffer(BufferKind::StorageAsset, bytes.len() as u64)
            .unwrap();
        let mut upload = device.create_upload_command_buffer().unwrap();
        let batch = record_static_quad(&device, &mut upload, &staging, &vertices);
        q.upload.submit_and_signal(&upload).unwrap();

        // An instance naming a structure that does not exist fails at execution.
        let mut tlas = TopLevel::<SoftApi>::new(&device, 1).unwrap();
        tlas.write_instances(&[TlasInstance::new(0xdead_0000, 1)]).unwrap();
        let mut failing = device.create_graphics_command_buffer().unwrap();
        failing.begin().unwrap();
        tlas.record_build(&mut failing, 1);
        failing.end().unwrap();
        let fence = device.create_fence(false).unwrap();
        assert!(q.graphics.wait_and_submit(Some(&upload), &failing, &fence).is_err());
        assert!(!fence.is_signaled());

        let mut graphics = device.create_graphics_command_buffer().unwrap();
        graphics.begin().unwrap();
        graphics.end().unwrap();
        q.graphics.wait_and_submit(Some(&upload), &graphics, &fence).unwrap();
        device.wait_for_fence(&fence).unwrap();
        let measured = batch.measure(&device).unwrap();
        assert_eq!(measured.compacted_sizes().len(), 1);

        measured.destroy(&device);
        tlas.destroy(&device);
        device.destroy_buffer(vertices);
        device.destroy_buffer(staging);
        device.destroy_fence(fence);
        device.destroy_upload_command_buffer(upload);
        device.destroy_graphics_command_buffer(failing);
        device.destroy_graphics_command_buffer(graphics);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "acquire set does not match release set")]
    fn acquiring_part_of_a_release_set_panics() {
        let device = SoftDevice::new(SoftConfig::default());
        let q = queues(&device);
        let staging = staged(&device, &[5; 16]);
        let a = device.create_buffer(BufferKind::StorageAsset, 16).unwrap();
        let b = device.create_buffer(BufferKind::StorageAsset, 16).unwrap();
        let mut upload = device.create_upload_command_buffer().unwrap();
        upload.begin().unwrap();
        upload.upload_buffer(&a, 0, &staging, 0, 16);
        upload.upload_buffer(&b, 0, &staging, 0, 16);
        upload.release(&TransferAssets::buffers(&[&a, &b]));
        upload.end().unwrap();

        let mut graphics = device.create_graphics_command_buffer().unwrap();
        graphics.begin().unwrap();
        graphics.acquire(&TransferAssets::buffers(&[&a]));
        graphics.end().unwrap();

        let fence = device.create_fence(false).unwrap();
        q.upload.submit_and_signal(&upload).unwrap();
        let _ = q.graphics.wait_and_submit(Some(&upload), &graphics, &fence);
    }

    struct Targets {
        render_pass: SoftRenderPass,
        color: SoftTargetImage,
        scratch_color: SoftTargetImage,
        depth: SoftTargetImage,
        frame_buffer: SoftFrameBuffer,
    }

    /// A 4x3 frame buffer with a cleared color attachment, a color attachment
    /// left as is, and a cleared depth-stencil attachment.
    fn targets(device: &SoftDevice) -> Targets {
        let depth_format = device.capabilities().depth_stencil_attachment_format;
        let render_pass = device
            .create_render_pass(
                &[
                    ColorAttachmentDesc {
                        format: ColorAttachmentImageFormat::R8G8B8A8Unorm,
                        load: ColorLoadOp::Clear,
                        store: ColorStoreOp::FlushForSampledImage,
                    },
                    ColorAttachmentDesc {
                        format: ColorAttachmentImageFormat::B8G8R8A8Unorm,
                        load: ColorLoadOp::DontCare,
                        store: ColorStoreOp::FlushForPresent,
                    },
                ],
                Some(DepthStencilAttachmentDesc {
                    format: depth_format,
                    load: DepthStencilLoadOp::Clear,
                    store: DepthStencilStoreOp::DontCare,
                }),
            )
            .unwrap();
        let color_image = |format| {
            device
                .create_target_image(TargetImageKind::ColorAttachment(format), 4, 3, true)
                .unwrap()
        };
        let color = color_image(ColorAttachmentImageFormat::R8G8B8A8Unorm);
        let scratch_color = color_image(ColorAttachmentImageFormat::B8G8R8A8Unorm);
        let depth = device
            .create_target_image(TargetImageKind::DepthStencilAttachment(depth_format), 4, 3, false)
            .unwrap();
        let frame_buffer = device
            .create_frame_buffer(&render_pass, 4, 3, &[&color, &scratch_color], Some(&depth))
            .unwrap();
        Targets {
            render_pass,
            color,
            scratch_color,
            depth,
            frame_buffer,
        }
    }

    fn destroy_targets(device: &SoftDevice, targets: Targets) {
        device.destroy_frame_buffer(targets.frame_buffer);
        device.destroy_render_pass(targets.render_pass);
        for image in [targets.color, targets.scratch_color, targets.depth] {
            device.destroy_target_image(image);
        }
    }

    #[test]
    fn render_pass_clears_its_render_area_and_records_draws() {
        let device = SoftDevice::new(SoftConfig::default());
        let q = queues(&device);
        let targets = targets(&device);
        let sampled = device
            .create_target_image(
                TargetImageKind::ColorAttachment(ColorAttachmentImageFormat::R8G8B8A8Unorm),
                2,
                2,
                true,
            )
            .unwrap();
        let sampler = device.create_sampler(SamplerFilter::Nearest).unwrap();
        let set_layout = device
            .create_descriptor_set_layout(&[
                DescriptorBinding::single(0, DescriptorType::SampledImage),
                DescriptorBinding::single(1, DescriptorType::Sampler),
            ])
            .unwrap();
        let layout = device.create_pipeline_layout(&[&set_layout]).unwrap();
        let mut set = device.create_descriptor_set(&set_layout).unwrap();
        device.write_descriptor_set(
            &mut set,
            0,
            0,
            tessera_hal::DescriptorResources::SampledTargetImages(&[sampled.as_sampled()]),
        );
        device.write_descriptor_set(
            &mut set,
            1,
            0,
            tessera_hal::DescriptorResources::Samplers(&[&sampler]),
        );
        let pipeline = device
            .create_graphics_pipeline(
                &targets.render_pass,
                &layout,
                b"fullscreen.vert",
                b"composite.frag",
                Some(CompareOp::Less),
            )
            .unwrap();
        assert_eq!(pipeline.depth_test(), Some(CompareOp::Less));

        let mut graphics = device.create_graphics_command_buffer().unwrap();
        graphics.begin().unwrap();
        graphics.begin_render_pass(
            &targets.render_pass,
            &targets.frame_buffer,
            2,
            2,
            &ClearValues {
                colors: &[[1.0, 0.0, 0.0, 1.0], [0.0; 4]],
                depth: Some(1.0),
                stencil: Some(3),
            },
        );
        graphics.bind_graphics_pipeline(&pipeline);
        graphics.set_viewport(2, 2);
        graphics.set_scissor(2, 2);
        graphics.bind_graphics_descriptor_sets(&layout, &[&set], &[]);
        graphics.draw(3, 1);
        graphics.end_render_pass();
        graphics.end().unwrap();
        assert_eq!(
            graphics.command_names(),
            ["begin_render_pass", "draw", "end_render_pass"]
        );

        let fence = device.create_fence(false).unwrap();
        q.graphics.wait_and_submit(None, &graphics, &fence).unwrap();
        device.wait_for_fence(&fence).unwrap();

        let red = [255, 0, 0, 255];
        let color = targets.color.texels();
        for (index, texel) in color.chunks_exact(4).enumerate() {
            let (x, y) = (index % 4, index / 4);
            let expected = if x < 2 && y < 2 { red } else { [0; 4] };
            assert_eq!(texel, expected, "texel ({x}, {y})");
        }
        assert!(targets.scratch_color.texels().iter().all(|&b| b == 0));
        let depth = targets.depth.texels();
        assert_eq!(&depth[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&depth[8..12], &[0; 4]);
        assert_eq!(targets.depth.stencil().unwrap()[..2], [3, 3]);

        device.destroy_fence(fence);
        device.destroy_graphics_command_buffer(graphics);
        device.destroy_graphics_pipeline(pipeline);
        device.destroy_descriptor_set(set);
        device.destroy_pipeline_layout(layout);
        device.destroy_descriptor_set_layout(set_layout);
        device.destroy_sampler(sampler);
        device.destroy_target_image(sampled);
        destroy_targets(&device, targets);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn storage_image_written_by_compute_is_sampled_afterwards() {
        let device = SoftDevice::new(SoftConfig::default());
        device.register_kernel("fill", |dispatch| {
            let (width, height) = dispatch.storage_image_extent(0, 0)?;
            let texels: Vec<u8> = (0..width * height).flat_map(|i| (i * 10).to_le_bytes()).collect();
            dispatch.write_storage_image(0, 0, 0, &texels)
        });
        device.register_kernel("sum", |dispatch| {
            let texels = dispatch.sampled_target_texels(0, 0, 0)?;
            let sum: u32 = texels
                .chunks_exact(4)
                .map(|t| u32::from_le_bytes([t[0], t[1], t[2], t[3]]))
                .sum();
            dispatch.write_storage(0, 1, 0, &sum.to_le_bytes())
        });
        let q = queues(&device);
        let image = device
            .create_target_image(TargetImageKind::Storage(StorageImageFormat::R32Uint), 3, 2, true)
            .unwrap();
        assert_eq!(device.pool_usage(PoolClass::StorageImage).bytes, 24);
        let readback = device.create_buffer(BufferKind::Readback, 4).unwrap();

        let write_layout = device
            .create_descriptor_set_layout(&[DescriptorBinding::single(0, DescriptorType::StorageImage)])
            .unwrap();
        let read_layout = device
            .create_descriptor_set_layout(&[
                DescriptorBinding::single(0, DescriptorType::SampledImage),
                DescriptorBinding::single(1, DescriptorType::StorageBuffer),
            ])
            .unwrap();
        let write_pipeline_layout = device.create_pipeline_layout(&[&write_layout]).unwrap();
        let read_pipeline_layout = device.create_pipeline_layout(&[&read_layout]).unwrap();
        let fill = device.create_compute_pipeline(&write_pipeline_layout, b"fill").unwrap();
        let sum = device.create_compute_pipeline(&read_pipeline_layout, b"sum").unwrap();
        let mut write_set = device.create_descriptor_set(&write_layout).unwrap();
        let mut read_set = device.create_descriptor_set(&read_layout).unwrap();
        device.write_descriptor_set(
            &mut write_set,
            0,
            0,
            tessera_hal::DescriptorResources::StorageImages(&[image.as_storage_image()]),
        );
        device.write_descriptor_set(
            &mut read_set,
            0,
            0,
            tessera_hal::DescriptorResources::SampledTargetImages(&[image.as_sampled()]),
        );
        device.write_descriptor_set(
            &mut read_set,
            1,
            0,
            tessera_hal::DescriptorResources::StorageBuffers(&[readback.as_storage()]),
        );

        let mut graphics = device.create_graphics_command_buffer().unwrap();
        graphics.begin().unwrap();
        graphics.compute_pass_load(&[], &[image.as_storage_image()]);
        graphics.bind_compute_pipeline(&fill);
        graphics.bind_compute_descriptor_sets(&write_pipeline_layout, &[&write_set], &[]);
        graphics.dispatch(1, 1, 1);
        graphics.compute_pass_store(&[], &[image.as_storage_image()]);
        graphics.compute_pass_load(&[readback.as_storage()], &[]);
        graphics.bind_compute_pipeline(&sum);
        graphics.bind_compute_descriptor_sets(&read_pipeline_layout, &[&read_set], &[]);
        graphics.dispatch(1, 1, 1);
        graphics.compute_pass_store(&[readback.as_storage()], &[]);
        graphics.end().unwrap();

        let fence = device.create_fence(false).unwrap();
        q.graphics.wait_and_submit(None, &graphics, &fence).unwrap();
        device.wait_for_fence(&fence).unwrap();
        let mut out = [0; 4];
        readback.read_bytes(0, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 150);

        device.destroy_fence(fence);
        device.destroy_graphics_command_buffer(graphics);
        device.destroy_descriptor_set(write_set);
        device.destroy_descriptor_set(read_set);
        device.destroy_compute_pipeline(fill);
        device.destroy_compute_pipeline(sum);
        device.destroy_pipeline_layout(write_pipeline_layout);
        device.destroy_pipeline_layout(read_pipeline_layout);
        device.destroy_descriptor_set_layout(write_layout);
        device.destroy_descriptor_set_layout(read_layout);
        device.destroy_buffer(readback);
        device.destroy_target_image(image);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "draw before the viewport and scissor are set")]
    fn draw_without_dynamic_state_panics() {
        let device = SoftDevice::new(SoftConfig::default());
        let targets = targets(&device);
        let layout = device.create_pipeline_layout(&[]).unwrap();
        let pipeline = device
            .create_graphics_pipeline(&targets.render_pass, &layout, b"v", b"f", None)
            .unwrap();
        let mut graphics = device.create_graphics_command_buffer().unwrap();
        graphics.begin().unwrap();
        graphics.begin_render_pass(
            &targets.render_pass,
            &targets.frame_buffer,
            4,
            3,
            &ClearValues {
                colors: &[[0.0; 4]],
                depth: Some(0.0),
                stencil: Some(0),
            },
        );
        graphics.bind_graphics_pipeline(&pipeline);
        graphics.set_viewport(4, 3);
        graphics.draw(3, 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "dispatch recorded inside a render pass")]
    fn dispatch_inside_a_render_pass_panics() {
        let device = SoftDevice::new(SoftConfig::default());
        let targets = targets(&device);
        let mut graphics = device.create_graphics_command_buffer().unwrap();
        graphics.begin().unwrap();
        graphics.begin_render_pass(
            &targets.render_pass,
            &targets.frame_buffer,
            4,
            3,
            &ClearValues {
                colors: &[[0.0; 4]],
                depth: Some(0.0),
                stencil: Some(0),
            },
        );
        graphics.dispatch(1, 1, 1);
    }
}

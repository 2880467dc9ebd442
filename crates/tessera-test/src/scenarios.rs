//! End-to-end scenarios, generic over the backend.

use bytemuck::{Pod, Zeroable};
use glam::{Affine3A, Vec3};
use tessera_core::{
    BufferKind, ClearValues, ColorAttachmentDesc, ColorAttachmentImageFormat, ColorLoadOp,
    ColorStoreOp, DepthStencilAttachmentDesc, DepthStencilLoadOp, DepthStencilStoreOp,
    DescriptorBinding, DescriptorType, SamplerFilter, TargetImageKind, TlasInstance,
};
use tessera_hal::{
    Buffer, DescriptorResources, Device, GraphicsCommandBuffer, StaticBlasBatch, TargetImage,
    TopLevel, TransferAssets, TriangleGeometry, UploadCommandBuffer,
};
use tracing::{debug, info};

use crate::backend::ScenarioBackend;
use crate::harness::Harness;
use crate::{Result, TestError};

/// Bytes copied by one workgroup of the copy kernel (64 invocations, one word each).
pub const COPY_GROUP_BYTES: u64 = 64 * 4;

/// Size of the uploaded asset in [`asset_upload_readback`].
pub const UPLOAD_SIZE: u64 = 4096;

/// Uniform input of the probe kernel. Matches the std140 block in `probe_ray.comp`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ProbeRay {
    pub origin: [f32; 3],
    pub t_min: f32,
    pub direction: [f32; 3],
    pub t_max: f32,
}

/// Output of the probe kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ProbeHit {
    /// 1 on a committed triangle hit, 0 on a miss.
    pub hit: u32,
    pub instance_id: u32,
    pub primitive_index: u32,
    pub t: f32,
}

impl ProbeHit {
    pub const MISS: Self = Self {
        hit: 0,
        instance_id: 0,
        primitive_index: 0,
        t: 0.0,
    };

    pub const fn is_hit(&self) -> bool {
        self.hit != 0
    }
}

/// Result of [`asset_upload_readback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    pub bytes: u64,
}

/// Result of [`cleared_attachment_readback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearReport {
    pub texels: u32,
    /// The clear color as packed in every texel.
    pub word: u32,
}

/// Result of [`compacted_triangle_probe`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReport {
    pub non_compacted_size: u64,
    pub compacted_size: u64,
    pub hit: ProbeHit,
}

/// Deterministic test pattern, distinct in every word.
pub fn upload_pattern(len: usize) -> Vec<u8> {
    (0..len / 4)
        .flat_map(|i| (i as u32).wrapping_mul(0x9E37_79B9).to_le_bytes())
        .collect()
}

/// Upload a storage asset on the upload queue, hand it to the graphics queue
/// and copy it into a readback buffer with a compute kernel.
///
/// Fails with [`TestError::Mismatch`] unless the readback equals the pattern.
pub fn asset_upload_readback<A: ScenarioBackend>(harness: &Harness<A>) -> Result<UploadReport> {
    let device = harness.device();
    let pattern = upload_pattern(UPLOAD_SIZE as usize);

    let staging = device.create_buffer(BufferKind::StagingUpload, UPLOAD_SIZE)?;
    staging.write_bytes(0, &pattern)?;
    let asset = device.create_buffer(BufferKind::StorageAsset, UPLOAD_SIZE)?;
    let readback = device.create_buffer(BufferKind::Readback, UPLOAD_SIZE)?;

    let set_layout = device.create_descriptor_set_layout(&[
        DescriptorBinding::single(0, DescriptorType::ReadOnlyStorageBuffer),
        DescriptorBinding::single(1, DescriptorType::StorageBuffer),
    ])?;
    let layout = device.create_pipeline_layout(&[&set_layout])?;
    let pipeline = device.create_compute_pipeline(&layout, &harness.shaders().copy)?;
    let mut set = device.create_descriptor_set(&set_layout)?;
    device.write_descriptor_set(
        &mut set,
        0,
        0,
        DescriptorResources::ReadOnlyStorageBuffers(&[asset.as_read_only_storage()]),
    );
    device.write_descriptor_set(
        &mut set,
        1,
        0,
        DescriptorResources::StorageBuffers(&[readback.as_storage()]),
    );

    let mut upload = device.create_upload_command_buffer()?;
    let mut graphics = device.create_graphics_command_buffer()?;
    let submitted = (|| -> Result<()> {
        upload.begin()?;
        upload.upload_buffer(&asset, 0, &staging, 0, UPLOAD_SIZE);
        upload.release(&TransferAssets::buffers(&[&asset]));
        upload.end()?;

        graphics.begin()?;
        graphics.acquire(&TransferAssets::buffers(&[&asset]));
        graphics.begin_debug_label("copy asset");
        graphics.compute_pass_load(&[readback.as_storage()], &[]);
        graphics.bind_compute_pipeline(&pipeline);
        graphics.bind_compute_descriptor_sets(&layout, &[&set], &[]);
        graphics.dispatch(UPLOAD_SIZE.div_ceil(COPY_GROUP_BYTES) as u32, 1, 1);
        graphics.compute_pass_store(&[readback.as_storage()], &[]);
        graphics.end_debug_label();
        graphics.end()?;

        harness.submit_pair_and_wait(&upload, &graphics)
    })();

    let mut out = vec![0; pattern.len()];
    let read = submitted.and_then(|()| Ok(readback.read_bytes(0, &mut out)?));

    device.destroy_upload_command_buffer(upload);
    device.destroy_graphics_command_buffer(graphics);
    device.destroy_descriptor_set(set);
    device.destroy_compute_pipeline(pipeline);
    device.destroy_pipeline_layout(layout);
    device.destroy_descriptor_set_layout(set_layout);
    for buffer in [staging, asset, readback] {
        device.destroy_buffer(buffer);
    }
    read?;

    if let Some(index) = out.iter().zip(&pattern).position(|(a, b)| a != b) {
        return Err(TestError::Mismatch(format!(
            "readback differs at byte {index}: {:#04x} != {:#04x}",
            out[index], pattern[index]
        )));
    }
    info!(bytes = UPLOAD_SIZE, "asset upload read back intact");
    Ok(UploadReport { bytes: UPLOAD_SIZE })
}

/// Width and height of the attachment in [`cleared_attachment_readback`].
pub const TARGET_EXTENT: u32 = 16;
/// Clear color of the attachment in [`cleared_attachment_readback`].
pub const CLEAR_COLOR: [f32; 4] = [1.0, 0.0, 1.0, 1.0];

/// Clear a sampled color attachment and a depth attachment in a render pass,
/// then sample the color attachment from a compute kernel into a readback
/// buffer.
///
/// Fails with [`TestError::Mismatch`] unless every texel holds the clear color.
pub fn cleared_attachment_readback<A: ScenarioBackend>(harness: &Harness<A>) -> Result<ClearReport> {
    let device = harness.device();
    let color_format = ColorAttachmentImageFormat::R8G8B8A8Unorm;
    let depth_format = harness.capabilities().depth_attachment_format;
    let texels = TARGET_EXTENT * TARGET_EXTENT;

    let render_pass = device.create_render_pass(
        &[ColorAttachmentDesc {
            format: color_format,
            load: ColorLoadOp::Clear,
            store: ColorStoreOp::FlushForSampledImage,
        }],
        Some(DepthStencilAttachmentDesc {
            format: depth_format,
            load: DepthStencilLoadOp::Clear,
            store: DepthStencilStoreOp::DontCare,
        }),
    )?;
    let color = device.create_target_image(
        TargetImageKind::ColorAttachment(color_format),
        TARGET_EXTENT,
        TARGET_EXTENT,
        true,
    )?;
    let depth = device.create_target_image(
        TargetImageKind::DepthStencilAttachment(depth_format),
        TARGET_EXTENT,
        TARGET_EXTENT,
        false,
    )?;
    let frame_buffer = device.create_frame_buffer(
        &render_pass,
        TARGET_EXTENT,
        TARGET_EXTENT,
        &[&color],
        Some(&depth),
    )?;
    let sampler = device.create_sampler(SamplerFilter::Nearest)?;
    let readback = device.create_buffer(BufferKind::Readback, u64::from(texels) * 4)?;

    let set_layout = device.create_descriptor_set_layout(&[
        DescriptorBinding::single(0, DescriptorType::SampledImage),
        DescriptorBinding::single(1, DescriptorType::Sampler),
        DescriptorBinding::single(2, DescriptorType::StorageBuffer),
    ])?;
    let layout = device.create_pipeline_layout(&[&set_layout])?;
    let pipeline = device.create_compute_pipeline(&layout, &harness.shaders().read_target)?;
    let mut set = device.create_descriptor_set(&set_layout)?;
    device.write_descriptor_set(
        &mut set,
        0,
        0,
        DescriptorResources::SampledTargetImages(&[color.as_sampled()]),
    );
    device.write_descriptor_set(&mut set, 1, 0, DescriptorResources::Samplers(&[&sampler]));
    device.write_descriptor_set(
        &mut set,
        2,
        0,
        DescriptorResources::StorageBuffers(&[readback.as_storage()]),
    );

    let mut graphics = device.create_graphics_command_buffer()?;
    let submitted = (|| -> Result<()> {
        graphics.begin()?;
        graphics.begin_debug_label("clear attachments");
        graphics.begin_render_pass(
            &render_pass,
            &frame_buffer,
            TARGET_EXTENT,
            TARGET_EXTENT,
            &ClearValues {
                colors: &[CLEAR_COLOR],
                depth: Some(1.0),
                stencil: None,
            },
        );
        graphics.end_render_pass();
        graphics.end_debug_label();
        graphics.compute_pass_load(&[readback.as_storage()], &[]);
        graphics.bind_compute_pipeline(&pipeline);
        graphics.bind_compute_descriptor_sets(&layout, &[&set], &[]);
        graphics.dispatch(TARGET_EXTENT.div_ceil(8), TARGET_EXTENT.div_ceil(8), 1);
        graphics.compute_pass_store(&[readback.as_storage()], &[]);
        graphics.end()?;
        harness.submit_graphics_and_wait(&graphics)
    })();

    let mut out = vec![0; texels as usize * 4];
    let read = submitted.and_then(|()| Ok(readback.read_bytes(0, &mut out)?));

    device.destroy_graphics_command_buffer(graphics);
    device.destroy_descriptor_set(set);
    device.destroy_compute_pipeline(pipeline);
    device.destroy_pipeline_layout(layout);
    device.destroy_descriptor_set_layout(set_layout);
    device.destroy_buffer(readback);
    device.destroy_sampler(sampler);
    device.destroy_frame_buffer(frame_buffer);
    device.destroy_target_image(depth);
    device.destroy_target_image(color);
    device.destroy_render_pass(render_pass);
    read?;

    let expected = color_format.encode_clear(CLEAR_COLOR);
    if let Some(index) = out.chunks_exact(4).position(|texel| texel != expected.as_slice()) {
        return Err(TestError::Mismatch(format!(
            "texel {index} is {:?}, expected the clear color {expected:?}",
            &out[index * 4..index * 4 + 4]
        )));
    }
    let word = u32::from_le_bytes([expected[0], expected[1], expected[2], expected[3]]);
    info!(texels, word = format_args!("{word:#010x}"), "cleared attachment sampled intact");
    Ok(ClearReport { texels, word })
}

/// Vertices of one triangle in the z = 0 plane, containing the origin.
pub fn triangle_vertices() -> Vec<u8> {
    let corners = [
        Vec3::new(-1.0, -1.0, 0.0),
        Vec3::new(1.0, -1.0, 0.0),
        Vec3::new(0.0, 1.0, 0.0),
    ];
    corners
        .iter()
        .flat_map(|c| bytemuck::bytes_of(&c.to_array()).to_vec())
        .collect()
}

/// Instance id given to the probed triangle.
pub const PROBE_INSTANCE_ID: u32 = 7;
/// Distance from the ray origin to the instanced triangle.
pub const PROBE_DISTANCE: f32 = 4.0;

/// Build a single-triangle BLAS on the upload queue, compact it, place it in a
/// one-instance TLAS and trace a ray through the triangle from a compute kernel.
///
/// Fails with [`TestError::Mismatch`] if the compacted size is outside
/// `(0, non_compacted]` or the probe ray misses.
pub fn compacted_triangle_probe<A: ScenarioBackend>(harness: &Harness<A>) -> Result<ProbeReport> {
    let device = harness.device();
    if !harness.capabilities().ray_tracing {
        return Err(tessera_core::Error::Unsupported("ray tracing".to_string()).into());
    }

    let vertex_bytes = triangle_vertices();
    let vertex_size = vertex_bytes.len() as u64;
    let staging = device.create_buffer(BufferKind::StagingUpload, vertex_size)?;
    staging.write_bytes(0, &vertex_bytes)?;
    let vertices = device.create_buffer(BufferKind::StorageAsset, vertex_size)?;

    let mut upload = device.create_upload_command_buffer()?;
    upload.begin()?;
    upload.upload_buffer(&vertices, 0, &staging, 0, vertex_size);
    let geometry = [TriangleGeometry::<A>::triangles(&vertices, 3)];
    let batch = StaticBlasBatch::record(device, &mut upload, &[&geometry])?;
    upload.end()?;
    harness.submit_upload_and_wait(&upload)?;

    let measured = batch.measure(device)?;
    let non_compacted_size = measured.non_compacted_sizes()[0];
    let compacted_size = measured.compacted_sizes()[0];
    debug!(non_compacted_size, compacted_size, "measured triangle BLAS");
    if compacted_size == 0 || compacted_size > non_compacted_size {
        measured.destroy(device);
        device.destroy_upload_command_buffer(upload);
        device.destroy_buffer(staging);
        device.destroy_buffer(vertices);
        return Err(TestError::Mismatch(format!(
            "compacted size {compacted_size} outside (0, {non_compacted_size}]"
        )));
    }

    device.reset_upload_command_buffer(&mut upload)?;
    upload.begin()?;
    let (compacted, retiring) = measured.record_compaction(device, &mut upload)?;
    upload.end()?;

    let mut tlas = TopLevel::<A>::new(device, 1)?;
    tlas.write_instance_of(
        0,
        &compacted[0],
        TlasInstance::new(0, PROBE_INSTANCE_ID)
            .with_affine(Affine3A::from_translation(Vec3::new(0.0, 0.0, -PROBE_DISTANCE))),
    )?;

    let probe = ProbeRay {
        origin: [0.0, -0.25, 0.0],
        t_min: 0.0,
        direction: Vec3::NEG_Z.to_array(),
        t_max: 1000.0,
    };
    let ray_buffer = device.create_buffer(
        BufferKind::UniformUpload,
        harness
            .capabilities()
            .align_uniform_offset(std::mem::size_of::<ProbeRay>() as u64),
    )?;
    ray_buffer.write_bytes(0, bytemuck::bytes_of(&probe))?;
    let result = device.create_buffer(
        BufferKind::Readback,
        std::mem::size_of::<ProbeHit>() as u64,
    )?;

    let set_layout = device.create_descriptor_set_layout(&[
        DescriptorBinding::single(0, DescriptorType::DynamicUniformBuffer),
        DescriptorBinding::single(1, DescriptorType::TopLevelAccelerationStructure),
        DescriptorBinding::single(2, DescriptorType::StorageBuffer),
    ])?;
    let layout = device.create_pipeline_layout(&[&set_layout])?;
    let pipeline = device.create_compute_pipeline(&layout, &harness.shaders().probe_ray)?;
    let mut set = device.create_descriptor_set(&set_layout)?;
    device.write_descriptor_set(
        &mut set,
        0,
        0,
        DescriptorResources::DynamicUniformBuffers {
            buffers: &[&ray_buffer],
            ranges: &[std::mem::size_of::<ProbeRay>() as u64],
        },
    );
    device.write_descriptor_set(
        &mut set,
        1,
        0,
        DescriptorResources::TopLevelAccelerationStructures(&[tlas.structure()]),
    );
    device.write_descriptor_set(
        &mut set,
        2,
        0,
        DescriptorResources::StorageBuffers(&[result.as_storage()]),
    );

    let mut graphics = device.create_graphics_command_buffer()?;
    let submitted = (|| -> Result<()> {
        graphics.begin()?;
        let acquired: Vec<&A::AccelerationStructure> = compacted.iter().collect();
        graphics.acquire(&TransferAssets::acceleration_structures(&acquired));
        tlas.record_build(&mut graphics, 1);
        graphics.begin_debug_label("probe ray");
        graphics.compute_pass_load(&[result.as_storage()], &[]);
        graphics.bind_compute_pipeline(&pipeline);
        graphics.bind_compute_descriptor_sets(&layout, &[&set], &[0]);
        graphics.dispatch(1, 1, 1);
        graphics.compute_pass_store(&[result.as_storage()], &[]);
        graphics.end_debug_label();
        graphics.end()?;
        harness.submit_pair_and_wait(&upload, &graphics)
    })();

    let mut hit = ProbeHit::MISS;
    let read = submitted.and_then(|()| Ok(result.read_bytes(0, bytemuck::bytes_of_mut(&mut hit))?));

    retiring.retire(device);
    device.destroy_graphics_command_buffer(graphics);
    device.destroy_upload_command_buffer(upload);
    device.destroy_descriptor_set(set);
    device.destroy_compute_pipeline(pipeline);
    device.destroy_pipeline_layout(layout);
    device.destroy_descriptor_set_layout(set_layout);
    tlas.destroy(device);
    for structure in compacted {
        device.destroy_acceleration_structure(structure);
    }
    for buffer in [staging, vertices, ray_buffer, result] {
        device.destroy_buffer(buffer);
    }
    read?;

    if !hit.is_hit() || hit.instance_id != PROBE_INSTANCE_ID {
        return Err(TestError::Mismatch(format!(
            "probe ray through the triangle returned {hit:?}"
        )));
    }
    info!(
        non_compacted_size,
        compacted_size,
        t = hit.t,
        "probe ray hit the compacted triangle"
    );
    Ok(ProbeReport {
        non_compacted_size,
        compacted_size,
        hit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HarnessConfig;
    use approx::assert_relative_eq;
    use tessera_soft::SoftApi;
    use tessera_vk::VkApi;

    #[test]
    fn pattern_words_are_distinct() {
        let pattern = upload_pattern(UPLOAD_SIZE as usize);
        assert_eq!(pattern.len(), UPLOAD_SIZE as usize);
        let words: Vec<u32> = pattern
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        let mut sorted = words.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), words.len());
    }

    #[test]
    fn software_upload_readback_dedicated() {
        let harness = Harness::<SoftApi>::new(HarnessConfig::default()).unwrap();
        let report = asset_upload_readback(&harness).unwrap();
        assert_eq!(report.bytes, 4096);
    }

    #[test]
    fn software_upload_readback_unified() {
        let harness = Harness::<SoftApi>::new(HarnessConfig::default().unified()).unwrap();
        asset_upload_readback(&harness).unwrap();
    }

    #[test]
    fn software_compacted_triangle_is_hit() {
        for config in [HarnessConfig::default(), HarnessConfig::default().unified()] {
            let harness = Harness::<SoftApi>::new(config).unwrap();
            let report = compacted_triangle_probe(&harness).unwrap();
            assert!(report.compacted_size > 0);
            assert!(report.compacted_size <= report.non_compacted_size);
            assert_eq!(report.hit.instance_id, PROBE_INSTANCE_ID);
            assert_eq!(report.hit.primitive_index, 0);
            assert_relative_eq!(report.hit.t, PROBE_DISTANCE, epsilon = 1e-4);
        }
    }

    #[test]
    fn probe_without_ray_tracing_is_unsupported() {
        let harness =
            Harness::<SoftApi>::new(HarnessConfig::default().ray_tracing(false)).unwrap();
        let err = compacted_triangle_probe(&harness).unwrap_err();
        assert!(matches!(
            err,
            TestError::Backend(tessera_core::Error::Unsupported(_))
        ));
    }

    #[test]
    fn software_cleared_attachment_is_sampled() {
        let harness = Harness::<SoftApi>::new(HarnessConfig::default().ray_tracing(false)).unwrap();
        let report = cleared_attachment_readback(&harness).unwrap();
        assert_eq!(report.texels, TARGET_EXTENT * TARGET_EXTENT);
        assert_eq!(report.word, 0xffff_00ff);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn vulkan_cleared_attachment_is_sampled() {
        let harness = Harness::<VkApi>::new(HarnessConfig::default().ray_tracing(false)).unwrap();
        cleared_attachment_readback(&harness).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn vulkan_upload_readback() {
        let harness = Harness::<VkApi>::new(HarnessConfig::default().ray_tracing(false)).unwrap();
        asset_upload_readback(&harness).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn vulkan_compacted_triangle_is_hit() {
        let harness = Harness::<VkApi>::new(HarnessConfig::default()).unwrap();
        let report = compacted_triangle_probe(&harness).unwrap();
        assert!(report.compacted_size <= report.non_compacted_size);
        assert_relative_eq!(report.hit.t, PROBE_DISTANCE, epsilon = 1e-3);
    }
}

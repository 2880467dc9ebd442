//! Command pools and the graphics and upload command buffers.

use crate::accel::{record_build, GeometryList};
use crate::barrier::{
    buffer_barriers, color_range, memory_barrier, storage_image_barriers, structure_read_scope,
    structure_write_scope, ComputePassEdge, TransferBarriers,
};
use crate::device::DeviceShared;
use crate::error::{Result, VkError};
use crate::format::staged_extent;
use crate::render_pass::{VkFrameBuffer, VkRenderPass};
use crate::resource::{
    BuildRecord, BuiltGeometry, VkAccelerationStructure, VkBuffer, VkImage, VkQueryPool,
    VkTargetImage,
};
use crate::sync::create_semaphore;
use crate::VkApi;
use ash::vk;
use std::ffi::CString;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tessera_core::format::mip_extent;
use tessera_core::{AccelerationStructureKind, BlasKind, BufferKind, Capabilities, ClearValues};
use tessera_hal::command::geometry_descs;
use tessera_hal::transfer::{plan_acquire, plan_release};
use tessera_hal::{
    AccelerationStructure, Buffer, BuildInputView, GraphicsCommandBuffer, Image, Resource,
    StorageImageView, StorageView, TransferAssets, TransferLedger, TriangleGeometry,
    UploadCommandBuffer,
};
use tracing::{debug, trace};

/// A command pool owning one primary command buffer.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self { pool, queue_family })
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single primary command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_primary(&self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = device.allocate_command_buffers(&alloc_info)?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| VkError::InvalidState("no command buffer allocated".to_string()))
    }

    /// Reset the pool, returning its command buffers to the initial state.
    ///
    /// # Safety
    /// No command buffer from this pool may be pending execution.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        Ok(())
    }

    /// Destroy the pool and every command buffer allocated from it.
    ///
    /// # Safety
    /// No command buffer from this pool may be pending execution.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Pool, command buffer and recording state shared by both command buffer kinds.
struct Recorder {
    shared: Arc<DeviceShared>,
    pool: CommandPool,
    raw: vk::CommandBuffer,
    recording: bool,
}

impl Recorder {
    fn new(shared: Arc<DeviceShared>, queue_family: u32) -> Result<Self> {
        let device = &shared.device;
        let pool = unsafe {
            CommandPool::new(device, queue_family, vk::CommandPoolCreateFlags::TRANSIENT)?
        };
        let raw = match unsafe { pool.allocate_primary(device) } {
            Ok(raw) => raw,
            Err(error) => {
                unsafe { pool.destroy(device) };
                return Err(error);
            }
        };
        Ok(Self {
            shared,
            pool,
            raw,
            recording: false,
        })
    }

    fn device(&self) -> &ash::Device {
        &self.shared.device
    }

    fn reset(&mut self) -> Result<()> {
        unsafe { self.pool.reset(&self.shared.device)? };
        self.recording = false;
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        debug_assert!(!self.recording, "command buffer begun twice");
        self.reset()?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device().begin_command_buffer(self.raw, &begin_info)? };
        self.recording = true;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        debug_assert!(self.recording, "command buffer ended without begin");
        unsafe { self.device().end_command_buffer(self.raw)? };
        self.recording = false;
        Ok(())
    }

    fn debug_check_recording(&self, command: &str) {
        debug_assert!(self.recording, "{command} recorded outside begin/end");
        trace!(command, "record");
    }

    fn destroy(self) {
        unsafe { self.pool.destroy(&self.shared.device) };
    }

    fn structure_barrier(&self) {
        unsafe {
            memory_barrier(
                self.device(),
                self.raw,
                structure_write_scope(),
                structure_read_scope(),
            );
        }
    }

    fn transfer(&self, planned: &[tessera_hal::transfer::TransferBarrier], assets: &TransferAssets<'_, VkApi>) {
        let barriers = TransferBarriers::for_assets(planned, assets, self.shared.ray_tracing());
        unsafe { barriers.record(self.device(), self.raw) };
    }

    /// Record a bottom-level build from `geometries` and return what it consumed.
    fn build_bottom(
        &self,
        dst: &VkAccelerationStructure,
        geometries: &[TriangleGeometry<'_, VkApi>],
        scratch: &VkBuffer,
    ) -> Option<Vec<BuiltGeometry>> {
        let loader = self.shared.as_loader("BLAS build")?;
        let built: Vec<BuiltGeometry> = geometries
            .iter()
            .map(|g| {
                g.debug_validate();
                BuiltGeometry {
                    desc: g.desc,
                    index_address: g.index_buffer.map_or(0, |v| v.resource().device_address()),
                }
            })
            .collect();
        let addresses: Vec<(u64, u64)> = geometries
            .iter()
            .zip(&built)
            .map(|(g, b)| (g.vertex_buffer.resource().device_address(), b.index_address))
            .collect();
        let list = GeometryList::bottom(&geometry_descs(geometries), &addresses);
        unsafe {
            record_build(
                loader,
                self.raw,
                dst.kind,
                dst.raw,
                false,
                &list,
                scratch.device_address(),
            );
        }
        Some(built)
    }
}

fn debug_check_scratch(scratch: &VkBuffer) {
    debug_assert!(
        scratch.capabilities().contains(Capabilities::SCRATCH),
        "{scratch:?} is not a scratch buffer"
    );
}

fn debug_check_kind(structure: &VkAccelerationStructure, kind: AccelerationStructureKind) {
    debug_assert_eq!(
        structure.kind(),
        kind,
        "{structure:?} used where a {kind:?} structure is required"
    );
}

/// Graphics queue command buffer.
pub struct VkGraphicsCommandBuffer {
    recorder: Recorder,
    acquired: TransferLedger,
    label_depth: u32,
    in_render_pass: bool,
}

impl VkGraphicsCommandBuffer {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Result<Self> {
        let family = shared.topology.graphics_family();
        Ok(Self {
            recorder: Recorder::new(shared, family)?,
            acquired: TransferLedger::new(),
            label_depth: 0,
            in_render_pass: false,
        })
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.recorder.raw
    }

    fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: &crate::VkPipelineLayout,
        sets: &[&crate::VkDescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        let alignment = self.recorder.shared.capabilities.uniform_buffer_offset_alignment;
        debug_assert!(
            dynamic_offsets
                .iter()
                .all(|&o| u64::from(o) % alignment == 0),
            "dynamic offsets must be multiples of {alignment}"
        );
        let raw_sets: Vec<vk::DescriptorSet> = sets.iter().map(|s| s.raw).collect();
        unsafe {
            self.recorder.device().cmd_bind_descriptor_sets(
                self.recorder.raw,
                bind_point,
                layout.raw,
                0,
                &raw_sets,
                dynamic_offsets,
            );
        }
    }

    fn debug_check_outside_render_pass(&self, command: &str) {
        self.recorder.debug_check_recording(command);
        debug_assert!(!self.in_render_pass, "{command} recorded inside a render pass");
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        self.acquired.clear();
        self.label_depth = 0;
        self.in_render_pass = false;
        self.recorder.reset()
    }

    pub(crate) fn destroy(self) {
        self.recorder.destroy();
    }

    pub(crate) fn debug_check_executable(&self) {
        debug_assert!(
            !self.recorder.recording,
            "graphics command buffer submitted while recording"
        );
    }

    fn update_bottom(
        &self,
        dst: &VkAccelerationStructure,
        vertex_positions: &[BuildInputView<'_, VkBuffer>],
        scratch: &VkBuffer,
    ) {
        let Some(loader) = self.recorder.shared.as_loader("BLAS update") else {
            return;
        };
        let BuildRecord::Bottom(built) = &dst.built else {
            debug_assert!(false, "{dst:?} updated before it was built");
            return;
        };
        debug_assert_eq!(
            vertex_positions.len(),
            built.len(),
            "one vertex buffer per built geometry"
        );
        let descs: Vec<_> = built.iter().map(|b| b.desc).collect();
        let addresses: Vec<(u64, u64)> = vertex_positions
            .iter()
            .zip(built)
            .map(|(v, b)| (v.resource().device_address(), b.index_address))
            .collect();
        let list = GeometryList::bottom(&descs, &addresses);
        unsafe {
            record_build(
                loader,
                self.recorder.raw,
                dst.kind,
                dst.raw,
                true,
                &list,
                scratch.device_address(),
            );
        }
    }

    fn record_top(
        &self,
        dst: &VkAccelerationStructure,
        instance_count: u32,
        instances: &VkBuffer,
        scratch: &VkBuffer,
        update: bool,
    ) {
        let Some(loader) = self.recorder.shared.as_loader("TLAS build") else {
            return;
        };
        let list = GeometryList::top(instances.device_address(), instance_count);
        unsafe {
            record_build(
                loader,
                self.recorder.raw,
                dst.kind,
                dst.raw,
                update,
                &list,
                scratch.device_address(),
            );
        }
    }
}

impl fmt::Debug for VkGraphicsCommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VkGraphicsCommandBuffer")
            .field("raw", &self.recorder.raw)
            .field("recording", &self.recorder.recording)
            .field("acquired", &self.acquired.len())
            .finish_non_exhaustive()
    }
}

impl GraphicsCommandBuffer<VkApi> for VkGraphicsCommandBuffer {
    fn begin(&mut self) -> tessera_core::Result<()> {
        self.acquired.clear();
        self.label_depth = 0;
        self.in_render_pass = false;
        Ok(self.recorder.begin()?)
    }

    fn acquire(&mut self, assets: &TransferAssets<'_, VkApi>) {
        self.recorder.debug_check_recording("acquire");
        assets.note_acquire();
        self.acquired.record(assets.ids());
        let planned = plan_acquire(self.recorder.shared.topology, &assets.shape());
        self.recorder.transfer(&planned, assets);
    }

    fn begin_debug_label(&mut self, label: &str) {
        self.label_depth += 1;
        if let Some(utils) = &self.recorder.shared.debug_utils {
            let name = CString::new(label).unwrap_or_default();
            let label = vk::DebugUtilsLabelEXT::default().label_name(&name);
            unsafe { utils.cmd_begin_debug_utils_label(self.recorder.raw, &label) };
        }
    }

    fn end_debug_label(&mut self) {
        debug_assert!(self.label_depth > 0, "debug label ended without a matching begin");
        self.label_depth = self.label_depth.saturating_sub(1);
        if let Some(utils) = &self.recorder.shared.debug_utils {
            unsafe { utils.cmd_end_debug_utils_label(self.recorder.raw) };
        }
    }

    fn begin_render_pass(
        &mut self,
        render_pass: &VkRenderPass,
        frame_buffer: &VkFrameBuffer,
        width: u32,
        height: u32,
        clear_values: &ClearValues<'_>,
    ) {
        self.debug_check_outside_render_pass("begin_render_pass");
        debug_assert!(
            width <= frame_buffer.width && height <= frame_buffer.height,
            "render area {width}x{height} exceeds the frame buffer"
        );
        clear_values.debug_validate(&render_pass.color, render_pass.depth_stencil.as_ref());
        let clears = crate::render_pass::clear_values(render_pass, clear_values);
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass.raw)
            .framebuffer(frame_buffer.raw)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: vk::Extent2D { width, height },
            })
            .clear_values(&clears);
        unsafe {
            self.recorder.device().cmd_begin_render_pass(
                self.recorder.raw,
                &info,
                vk::SubpassContents::INLINE,
            );
        }
        self.in_render_pass = true;
    }

    fn bind_graphics_pipeline(&mut self, pipeline: &crate::VkGraphicsPipeline) {
        self.recorder.debug_check_recording("bind_graphics_pipeline");
        unsafe {
            self.recorder.device().cmd_bind_pipeline(
                self.recorder.raw,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.raw,
            );
        }
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.recorder.debug_check_recording("set_viewport");
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.recorder
                .device()
                .cmd_set_viewport(self.recorder.raw, 0, &[viewport]);
        }
    }

    fn set_scissor(&mut self, width: u32, height: u32) {
        self.recorder.debug_check_recording("set_scissor");
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: vk::Extent2D { width, height },
        };
        unsafe {
            self.recorder
                .device()
                .cmd_set_scissor(self.recorder.raw, 0, &[scissor]);
        }
    }

    fn bind_graphics_descriptor_sets(
        &mut self,
        layout: &crate::VkPipelineLayout,
        sets: &[&crate::VkDescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.recorder.debug_check_recording("bind_graphics_descriptor_sets");
        self.bind_descriptor_sets(vk::PipelineBindPoint::GRAPHICS, layout, sets, dynamic_offsets);
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.recorder.debug_check_recording("draw");
        debug_assert!(self.in_render_pass, "draw outside a render pass");
        unsafe {
            self.recorder
                .device()
                .cmd_draw(self.recorder.raw, vertex_count, instance_count, 0, 0);
        }
    }

    fn end_render_pass(&mut self) {
        self.recorder.debug_check_recording("end_render_pass");
        debug_assert!(self.in_render_pass, "render pass ended without begin");
        unsafe { self.recorder.device().cmd_end_render_pass(self.recorder.raw) };
        self.in_render_pass = false;
    }

    fn compute_pass_load(
        &mut self,
        storage_buffers: &[StorageView<'_, VkBuffer>],
        storage_images: &[StorageImageView<'_, VkTargetImage>],
    ) {
        self.debug_check_outside_render_pass("compute_pass_load");
        let access = vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE;
        let images: Vec<&VkTargetImage> = storage_images.iter().map(|v| v.resource()).collect();
        unsafe {
            buffer_barriers(
                self.recorder.device(),
                self.recorder.raw,
                storage_buffers.iter().map(|v| v.resource().raw()),
                (vk::PipelineStageFlags2::COMPUTE_SHADER, access),
                (vk::PipelineStageFlags2::COMPUTE_SHADER, access),
            );
            storage_image_barriers(
                self.recorder.device(),
                self.recorder.raw,
                &images,
                ComputePassEdge::Load,
                (
                    vk::PipelineStageFlags2::COMPUTE_SHADER
                        | vk::PipelineStageFlags2::FRAGMENT_SHADER,
                    vk::AccessFlags2::SHADER_READ,
                ),
                (vk::PipelineStageFlags2::COMPUTE_SHADER, access),
            );
        }
    }

    fn bind_compute_pipeline(&mut self, pipeline: &crate::VkComputePipeline) {
        self.recorder.debug_check_recording("bind_compute_pipeline");
        unsafe {
            self.recorder.device().cmd_bind_pipeline(
                self.recorder.raw,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.raw,
            );
        }
    }

    fn bind_compute_descriptor_sets(
        &mut self,
        layout: &crate::VkPipelineLayout,
        sets: &[&crate::VkDescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.recorder.debug_check_recording("bind_compute_descriptor_sets");
        self.bind_descriptor_sets(vk::PipelineBindPoint::COMPUTE, layout, sets, dynamic_offsets);
    }

    fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        self.debug_check_outside_render_pass("dispatch");
        unsafe {
            self.recorder.device().cmd_dispatch(
                self.recorder.raw,
                group_count_x,
                group_count_y,
                group_count_z,
            );
        }
    }

    fn compute_pass_store(
        &mut self,
        storage_buffers: &[StorageView<'_, VkBuffer>],
        storage_images: &[StorageImageView<'_, VkTargetImage>],
    ) {
        self.debug_check_outside_render_pass("compute_pass_store");
        let images: Vec<&VkTargetImage> = storage_images.iter().map(|v| v.resource()).collect();
        let mut stages = vk::PipelineStageFlags2::COMPUTE_SHADER | vk::PipelineStageFlags2::HOST;
        if self.recorder.shared.ray_tracing() {
            stages |= vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR;
        }
        unsafe {
            buffer_barriers(
                self.recorder.device(),
                self.recorder.raw,
                storage_buffers.iter().map(|v| v.resource().raw()),
                (
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_WRITE,
                ),
                (
                    stages,
                    vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::HOST_READ,
                ),
            );
            storage_image_barriers(
                self.recorder.device(),
                self.recorder.raw,
                &images,
                ComputePassEdge::Store,
                (
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_WRITE,
                ),
                (
                    vk::PipelineStageFlags2::COMPUTE_SHADER
                        | vk::PipelineStageFlags2::FRAGMENT_SHADER,
                    vk::AccessFlags2::SHADER_READ,
                ),
            );
        }
    }

    fn build_intermediate_blas(
        &mut self,
        dst: &mut VkAccelerationStructure,
        geometries: &[TriangleGeometry<'_, VkApi>],
        scratch: &VkBuffer,
    ) {
        self.debug_check_outside_render_pass("build_intermediate_blas");
        debug_check_kind(dst, AccelerationStructureKind::Bottom(BlasKind::Intermediate));
        debug_check_scratch(scratch);
        if let Some(built) = self.recorder.build_bottom(dst, geometries, scratch) {
            dst.built = BuildRecord::Bottom(built);
        }
    }

    fn build_intermediate_blas_store(&mut self, structures: &[&VkAccelerationStructure]) {
        if !structures.is_empty() {
            self.recorder.structure_barrier();
        }
    }

    fn update_intermediate_blas(
        &mut self,
        dst: &mut VkAccelerationStructure,
        vertex_positions: &[BuildInputView<'_, VkBuffer>],
        scratch: &VkBuffer,
    ) {
        self.debug_check_outside_render_pass("update_intermediate_blas");
        debug_check_kind(dst, AccelerationStructureKind::Bottom(BlasKind::Intermediate));
        debug_check_scratch(scratch);
        self.update_bottom(dst, vertex_positions, scratch);
    }

    fn update_intermediate_blas_store(&mut self, structures: &[&VkAccelerationStructure]) {
        if !structures.is_empty() {
            self.recorder.structure_barrier();
        }
    }

    fn build_tlas(
        &mut self,
        dst: &mut VkAccelerationStructure,
        instance_count: u32,
        instances: &VkBuffer,
        scratch: &VkBuffer,
    ) {
        self.debug_check_outside_render_pass("build_tlas");
        debug_check_kind(dst, AccelerationStructureKind::Top);
        debug_check_scratch(scratch);
        debug_assert_eq!(
            instances.kind(),
            BufferKind::TlasInstanceUpload,
            "TLAS instances must come from an instance upload buffer"
        );
        debug_assert!(
            u64::from(instance_count) * tessera_core::constants::INSTANCE_RECORD_SIZE
                <= instances.size(),
            "{instance_count} instances exceed the instance buffer"
        );
        self.record_top(dst, instance_count, instances, scratch, false);
        dst.built = BuildRecord::Top { instance_count };
    }

    fn build_tlas_store(&mut self, _tlas: &VkAccelerationStructure) {
        self.recorder.structure_barrier();
    }

    fn update_tlas(
        &mut self,
        dst: &mut VkAccelerationStructure,
        instances: &VkBuffer,
        scratch: &VkBuffer,
    ) {
        self.debug_check_outside_render_pass("update_tlas");
        debug_check_kind(dst, AccelerationStructureKind::Top);
        debug_check_scratch(scratch);
        let BuildRecord::Top { instance_count } = dst.built else {
            debug_assert!(false, "{dst:?} updated before it was built");
            return;
        };
        self.record_top(dst, instance_count, instances, scratch, true);
    }

    fn update_tlas_store(&mut self, _tlas: &VkAccelerationStructure) {
        self.recorder.structure_barrier();
    }

    fn end(&mut self) -> tessera_core::Result<()> {
        debug_assert_eq!(self.label_depth, 0, "unbalanced debug labels");
        debug_assert!(!self.in_render_pass, "graphics command buffer ended inside a render pass");
        self.recorder.end()?;
        debug!(acquired = self.acquired.len(), "recorded graphics command buffer");
        Ok(())
    }

    fn acquired(&self) -> &TransferLedger {
        &self.acquired
    }
}

/// Upload queue command buffer with its completion semaphore.
pub struct VkUploadCommandBuffer {
    recorder: Recorder,
    released: TransferLedger,
    pub(crate) semaphore: vk::Semaphore,
    /// The semaphore has been signaled and not yet waited on.
    pub(crate) semaphore_pending: AtomicBool,
}

impl VkUploadCommandBuffer {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Result<Self> {
        let family = shared.topology.upload_family();
        let recorder = Recorder::new(shared, family)?;
        let semaphore = match unsafe { create_semaphore(recorder.device()) } {
            Ok(semaphore) => semaphore,
            Err(error) => {
                recorder.destroy();
                return Err(error);
            }
        };
        Ok(Self {
            recorder,
            released: TransferLedger::new(),
            semaphore,
            semaphore_pending: AtomicBool::new(false),
        })
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.recorder.raw
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        debug_assert!(
            !*self.semaphore_pending.get_mut(),
            "upload command buffer reset before a graphics submission waited on it"
        );
        self.released.clear();
        self.recorder.reset()
    }

    pub(crate) fn destroy(self) {
        unsafe {
            self.recorder
                .device()
                .destroy_semaphore(self.semaphore, None);
        }
        self.recorder.destroy();
    }

    pub(crate) fn debug_check_executable(&self) {
        debug_assert!(
            !self.recorder.recording,
            "upload command buffer submitted while recording"
        );
    }

    fn debug_check_staging(&self, staging: &VkBuffer, src_offset: u64) {
        debug_assert!(
            staging.capabilities().contains(Capabilities::STAGING),
            "{staging:?} is not a staging buffer"
        );
        debug_assert!(
            src_offset % self.recorder.shared.capabilities.staging_buffer_offset_alignment == 0,
            "staging offset {src_offset} is misaligned"
        );
    }
}

impl fmt::Debug for VkUploadCommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VkUploadCommandBuffer")
            .field("raw", &self.recorder.raw)
            .field("recording", &self.recorder.recording)
            .field("released", &self.released.len())
            .finish_non_exhaustive()
    }
}

impl UploadCommandBuffer<VkApi> for VkUploadCommandBuffer {
    fn begin(&mut self) -> tessera_core::Result<()> {
        self.reset()?;
        Ok(self.recorder.begin()?)
    }

    fn upload_buffer(
        &mut self,
        dst: &VkBuffer,
        dst_offset: u64,
        staging: &VkBuffer,
        src_offset: u64,
        size: u64,
    ) {
        self.recorder.debug_check_recording("upload_buffer");
        debug_assert!(dst.kind().is_asset(), "{dst:?} is not a storage asset buffer");
        self.debug_check_staging(staging, src_offset);
        debug_assert!(
            src_offset + size <= staging.size() && dst_offset + size <= dst.size(),
            "upload of {size} bytes is out of range"
        );
        dst.ownership().note_upload_write("storage asset buffer");
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        unsafe {
            self.recorder.device().cmd_copy_buffer(
                self.recorder.raw,
                staging.raw(),
                dst.raw(),
                std::slice::from_ref(&region),
            );
        }
    }

    fn upload_image(
        &mut self,
        dst: &VkImage,
        mip_level: u32,
        staging: &VkBuffer,
        src_offset: u64,
        src_row_pitch: u32,
        src_row_count: u32,
    ) {
        self.recorder.debug_check_recording("upload_image");
        debug_assert!(mip_level < dst.mip_levels(), "mip level {mip_level} out of range");
        self.debug_check_staging(staging, src_offset);
        debug_assert!(
            u64::from(src_row_pitch)
                % self.recorder.shared.capabilities.staging_buffer_row_pitch_alignment
                == 0,
            "row pitch {src_row_pitch} is misaligned"
        );
        dst.ownership().note_upload_write("sampled asset image");

        let device = self.recorder.device();
        let cmd = self.recorder.raw;
        let to_transfer_dst = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::NONE)
            .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(dst.raw())
            .subresource_range(color_range(mip_level, 1));
        let dependency = vk::DependencyInfo::default()
            .image_memory_barriers(std::slice::from_ref(&to_transfer_dst));

        let (row_length, image_height) = staged_extent(dst.format(), src_row_pitch, src_row_count);
        let region = vk::BufferImageCopy::default()
            .buffer_offset(src_offset)
            .buffer_row_length(row_length)
            .buffer_image_height(image_height)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(mip_level)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_offset(vk::Offset3D::default())
            .image_extent(vk::Extent3D {
                width: mip_extent(dst.width(), mip_level),
                height: mip_extent(dst.height(), mip_level),
                depth: 1,
            });
        unsafe {
            device.cmd_pipeline_barrier2(cmd, &dependency);
            device.cmd_copy_buffer_to_image(
                cmd,
                staging.raw(),
                dst.raw(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
        }
    }

    fn build_non_compacted_blas_pass_load(&mut self, inputs: &[BuildInputView<'_, VkBuffer>]) {
        self.recorder.debug_check_recording("build_non_compacted_blas_pass_load");
        if !self.recorder.shared.ray_tracing() {
            return;
        }
        unsafe {
            buffer_barriers(
                self.recorder.device(),
                self.recorder.raw,
                inputs.iter().map(|v| v.resource().raw()),
                (
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_WRITE,
                ),
                (
                    vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::AccessFlags2::SHADER_READ,
                ),
            );
        }
    }

    fn build_non_compacted_blas(
        &mut self,
        dst: &mut VkAccelerationStructure,
        geometries: &[TriangleGeometry<'_, VkApi>],
        scratch: &VkBuffer,
        query_pool: &VkQueryPool,
        query_index: u32,
    ) {
        self.recorder.debug_check_recording("build_non_compacted_blas");
        debug_check_kind(dst, AccelerationStructureKind::Bottom(BlasKind::NonCompacted));
        debug_check_scratch(scratch);
        debug_assert!(
            query_index < query_pool.len(),
            "query index {query_index} out of range"
        );
        let Some(loader) = self.recorder.shared.as_loader("BLAS build") else {
            return;
        };
        let (device, cmd) = (self.recorder.device(), self.recorder.raw);
        unsafe { device.cmd_reset_query_pool(cmd, query_pool.raw, query_index, 1) };
        let Some(built) = self.recorder.build_bottom(dst, geometries, scratch) else {
            return;
        };
        self.recorder.structure_barrier();
        unsafe {
            loader.cmd_write_acceleration_structures_properties(
                cmd,
                std::slice::from_ref(&dst.raw),
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                query_pool.raw,
                query_index,
            );
        }
        dst.built = BuildRecord::Bottom(built);
    }

    fn build_non_compacted_blas_pass_store(&mut self, inputs: &[BuildInputView<'_, VkBuffer>]) {
        self.recorder.debug_check_recording("build_non_compacted_blas_pass_store");
        if !self.recorder.shared.ray_tracing() {
            return;
        }
        unsafe {
            buffer_barriers(
                self.recorder.device(),
                self.recorder.raw,
                inputs.iter().map(|v| v.resource().raw()),
                (
                    vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::AccessFlags2::NONE,
                ),
                (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::NONE),
            );
        }
    }

    fn compact_blas(&mut self, dst: &VkAccelerationStructure, src: &VkAccelerationStructure) {
        self.recorder.debug_check_recording("compact_blas");
        debug_check_kind(dst, AccelerationStructureKind::Bottom(BlasKind::Compacted));
        debug_check_kind(src, AccelerationStructureKind::Bottom(BlasKind::NonCompacted));
        let Some(loader) = self.recorder.shared.as_loader("BLAS compaction") else {
            return;
        };
        dst.ownership().note_upload_write("compacted BLAS");
        let info = vk::CopyAccelerationStructureInfoKHR::default()
            .src(src.raw)
            .dst(dst.raw)
            .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
        unsafe { loader.cmd_copy_acceleration_structure(self.recorder.raw, &info) };
    }

    fn release(&mut self, assets: &TransferAssets<'_, VkApi>) {
        self.recorder.debug_check_recording("release");
        assets.note_release();
        self.released.record(assets.ids());
        let planned = plan_release(self.recorder.shared.topology, &assets.shape());
        self.recorder.transfer(&planned, assets);
    }

    fn end(&mut self) -> tessera_core::Result<()> {
        self.recorder.end()?;
        debug!(released = self.released.len(), "recorded upload command buffer");
        Ok(())
    }

    fn released(&self) -> &TransferLedger {
        &self.released
    }
}

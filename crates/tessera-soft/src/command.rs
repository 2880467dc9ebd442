//! Command recording.
//!
//! Commands are captured with shared handles to every resource they touch and
//! executed in program order when submitted. Caller contracts are asserted at
//! record time so a violation panics at the offending call.

use crate::descriptor::{BoundSet, Kernel};
use crate::device::DeviceShared;
use crate::pass::{SoftFrameBuffer, SoftGraphicsPipeline, SoftRenderPass};
use crate::resource::{
    BufferInner, ImageInner, QueryPoolInner, SoftAccelerationStructure, SoftBuffer,
    SoftTargetImage, StructureInner, TargetImageInner,
};
use crate::sizing;
use crate::sync::Retirement;
use crate::SoftApi;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tessera_core::{
    AccelerationStructureKind, BlasKind, BufferKind, Capabilities, ClearValues, ColorLoadOp,
    DepthStencilLoadOp, GeometryDesc, Result,
};
use tessera_hal::command::geometry_descs;
use tessera_hal::transfer::{plan_acquire, plan_release, TransferBarrier};
use tessera_hal::{
    AccelerationStructure, Buffer, BuildInputView, GraphicsCommandBuffer, Image, Resource,
    StorageImageView, StorageView, TransferAssets, TransferLedger, TriangleGeometry,
    UploadCommandBuffer,
};
use tracing::{debug, trace};

pub(crate) struct GeometryInput {
    pub desc: GeometryDesc,
    pub vertices: Arc<BufferInner>,
    pub indices: Option<Arc<BufferInner>>,
}

pub(crate) enum Command {
    CopyBuffer {
        src: Arc<BufferInner>,
        src_offset: u64,
        dst: Arc<BufferInner>,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        src: Arc<BufferInner>,
        src_offset: u64,
        row_pitch: u32,
        row_count: u32,
        dst: Arc<ImageInner>,
        mip: u32,
    },
    Barrier(&'static str),
    Transfer(Vec<TransferBarrier>),
    BuildBottom {
        dst: Arc<StructureInner>,
        geometries: Vec<GeometryInput>,
        query: Option<(Arc<QueryPoolInner>, u32)>,
    },
    UpdateBottom {
        dst: Arc<StructureInner>,
        vertex_buffers: Vec<Arc<BufferInner>>,
    },
    Compact {
        dst: Arc<StructureInner>,
        src: Arc<StructureInner>,
    },
    BuildTop {
        dst: Arc<StructureInner>,
        instances: Arc<BufferInner>,
        instance_count: u32,
    },
    UpdateTop {
        dst: Arc<StructureInner>,
        instances: Arc<BufferInner>,
    },
    Dispatch {
        name: String,
        kernel: Kernel,
        sets: Vec<BoundSet>,
        group_count: [u32; 3],
    },
    BeginRenderPass {
        width: u32,
        height: u32,
        clears: Vec<AttachmentClear>,
    },
    Draw {
        pipeline: String,
        vertex_count: u32,
        instance_count: u32,
    },
    EndRenderPass,
    BeginLabel(String),
    EndLabel,
}

/// A clear applied to one attachment when a render pass begins.
pub(crate) struct AttachmentClear {
    pub image: Arc<TargetImageInner>,
    pub texel: Vec<u8>,
    pub stencil: Option<u8>,
}

impl Command {
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::CopyBuffer { .. } => "copy_buffer",
            Self::CopyBufferToImage { .. } => "copy_buffer_to_image",
            Self::Barrier(_) => "barrier",
            Self::Transfer(_) => "transfer",
            Self::BuildBottom { .. } => "build_bottom",
            Self::UpdateBottom { .. } => "update_bottom",
            Self::Compact { .. } => "compact",
            Self::BuildTop { .. } => "build_top",
            Self::UpdateTop { .. } => "update_top",
            Self::Dispatch { .. } => "dispatch",
            Self::BeginRenderPass { .. } => "begin_render_pass",
            Self::Draw { .. } => "draw",
            Self::EndRenderPass => "end_render_pass",
            Self::BeginLabel(_) => "begin_label",
            Self::EndLabel => "end_label",
        }
    }
}

fn command_names(commands: &[Command]) -> Vec<&'static str> {
    commands.iter().map(Command::name).collect()
}

fn transfer_barriers(commands: &[Command]) -> impl Iterator<Item = &TransferBarrier> {
    commands.iter().flat_map(|c| match c {
        Command::Transfer(barriers) => barriers.as_slice(),
        _ => &[][..],
    })
}

fn geometry_inputs(geometries: &[TriangleGeometry<'_, SoftApi>]) -> Vec<GeometryInput> {
    geometries
        .iter()
        .map(|g| {
            g.debug_validate();
            GeometryInput {
                desc: g.desc,
                vertices: Arc::clone(&g.vertex_buffer.resource().0),
                indices: g.index_buffer.map(|view| Arc::clone(&view.resource().0)),
            }
        })
        .collect()
}

fn debug_check_scratch(scratch: &SoftBuffer, needed: u64) {
    debug_assert!(
        scratch.capabilities().contains(Capabilities::SCRATCH),
        "{scratch:?} is not a scratch buffer"
    );
    debug_assert!(
        scratch.size() >= needed,
        "scratch of {} bytes is smaller than the required {needed}",
        scratch.size()
    );
}

fn debug_check_kind(structure: &SoftAccelerationStructure, kind: AccelerationStructureKind) {
    debug_assert_eq!(
        structure.kind(),
        kind,
        "{structure:?} used where a {kind:?} structure is required"
    );
}

fn clears(
    frame_buffer: &SoftFrameBuffer,
    render_pass: &SoftRenderPass,
    values: &ClearValues<'_>,
) -> Vec<AttachmentClear> {
    let color = frame_buffer
        .color
        .iter()
        .zip(&render_pass.color)
        .zip(values.colors)
        .filter(|((_, attachment), _)| attachment.load == ColorLoadOp::Clear)
        .map(|((image, attachment), &color)| AttachmentClear {
            image: Arc::clone(image),
            texel: attachment.format.encode_clear(color),
            stencil: None,
        });
    let depth = frame_buffer
        .depth_stencil
        .iter()
        .zip(&render_pass.depth_stencil)
        .filter(|(_, attachment)| attachment.load == DepthStencilLoadOp::Clear)
        .map(|(image, _)| AttachmentClear {
            image: Arc::clone(image),
            texel: values.depth.unwrap_or_default().to_le_bytes().to_vec(),
            stencil: values.stencil,
        });
    color.chain(depth).collect()
}

/// Render pass state while recording between `begin_render_pass` and
/// `end_render_pass`.
struct ActiveRenderPass {
    render_pass: SoftRenderPass,
    viewport: bool,
    scissor: bool,
}

/// Graphics queue command buffer.
pub struct SoftGraphicsCommandBuffer {
    shared: Arc<DeviceShared>,
    commands: Vec<Command>,
    acquired: TransferLedger,
    recording: bool,
    pipeline: Option<(String, Kernel, usize)>,
    bound_sets: Vec<BoundSet>,
    graphics_pipeline: Option<SoftGraphicsPipeline>,
    graphics_set_count: usize,
    render_pass: Option<ActiveRenderPass>,
    label_depth: u32,
}

impl SoftGraphicsCommandBuffer {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Self {
        Self {
            shared,
            commands: Vec::new(),
            acquired: TransferLedger::new(),
            recording: false,
            pipeline: None,
            bound_sets: Vec::new(),
            graphics_pipeline: None,
            graphics_set_count: 0,
            render_pass: None,
            label_depth: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.commands.clear();
        self.acquired.clear();
        self.recording = false;
        self.pipeline = None;
        self.bound_sets.clear();
        self.graphics_pipeline = None;
        self.graphics_set_count = 0;
        self.render_pass = None;
        self.label_depth = 0;
    }

    pub(crate) fn commands(&self) -> &[Command] {
        debug_assert!(!self.recording, "graphics command buffer submitted while recording");
        &self.commands
    }

    /// Names of the recorded commands, in order.
    pub fn command_names(&self) -> Vec<&'static str> {
        command_names(&self.commands)
    }

    /// Ownership barriers recorded by `acquire`.
    pub fn transfer_barriers(&self) -> impl Iterator<Item = &TransferBarrier> {
        transfer_barriers(&self.commands)
    }

    fn push(&mut self, command: Command) {
        debug_assert!(self.recording, "graphics command recorded outside begin/end");
        trace!(command = command.name(), "record graphics command");
        self.commands.push(command);
    }

    fn debug_check_outside_render_pass(&self, operation: &str) {
        debug_assert!(
            self.render_pass.is_none(),
            "{operation} recorded inside a render pass"
        );
    }

    /// Validate a descriptor set binding and capture the sets with their
    /// dynamic offsets.
    fn capture_sets(
        &self,
        layout: &crate::SoftPipelineLayout,
        sets: &[&crate::SoftDescriptorSet],
        dynamic_offsets: &[u32],
    ) -> Vec<BoundSet> {
        debug_assert!(
            sets.len() <= layout.set_layouts.len(),
            "{} sets bound to a layout with {} set layouts",
            sets.len(),
            layout.set_layouts.len()
        );
        let expected: usize = sets.iter().map(|s| s.dynamic_count()).sum();
        debug_assert_eq!(
            dynamic_offsets.len(),
            expected,
            "dynamic offset count does not match the bound dynamic uniform descriptors"
        );
        let alignment = self.shared.capabilities.uniform_buffer_offset_alignment;
        debug_assert!(
            dynamic_offsets
                .iter()
                .all(|&o| u64::from(o) % alignment == 0),
            "dynamic offsets must be multiples of {alignment}"
        );

        let mut remaining = dynamic_offsets;
        sets.iter()
            .map(|set| {
                for element in set.bindings.iter().flat_map(|b| b.elements.iter().flatten()) {
                    element.assert_graphics_readable();
                }
                let (own, rest) = remaining.split_at(set.dynamic_count().min(remaining.len()));
                remaining = rest;
                BoundSet::capture(set, own)
            })
            .collect()
    }
}

fn debug_check_storage_images(images: &[StorageImageView<'_, SoftTargetImage>]) {
    for view in images {
        debug_assert!(
            view.resource().capabilities().contains(Capabilities::STORAGE),
            "{:?} is not a storage image",
            view.resource()
        );
    }
}

impl fmt::Debug for SoftGraphicsCommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftGraphicsCommandBuffer")
            .field("commands", &self.command_names())
            .field("recording", &self.recording)
            .finish_non_exhaustive()
    }
}

impl GraphicsCommandBuffer<SoftApi> for SoftGraphicsCommandBuffer {
    fn begin(&mut self) -> Result<()> {
        debug_assert!(!self.recording, "graphics command buffer begun twice");
        self.reset();
        self.recording = true;
        Ok(())
    }

    fn acquire(&mut self, assets: &TransferAssets<'_, SoftApi>) {
        assets.note_acquire();
        self.acquired.record(assets.ids());
        let barriers = plan_acquire(self.shared.topology, &assets.shape());
        if !barriers.is_empty() {
            self.push(Command::Transfer(barriers));
        }
    }

    fn begin_debug_label(&mut self, label: &str) {
        self.label_depth += 1;
        self.push(Command::BeginLabel(label.to_string()));
    }

    fn end_debug_label(&mut self) {
        debug_assert!(self.label_depth > 0, "debug label ended without a matching begin");
        self.label_depth = self.label_depth.saturating_sub(1);
        self.push(Command::EndLabel);
    }

    fn begin_render_pass(
        &mut self,
        render_pass: &SoftRenderPass,
        frame_buffer: &SoftFrameBuffer,
        width: u32,
        height: u32,
        clear_values: &ClearValues<'_>,
    ) {
        self.debug_check_outside_render_pass("begin_render_pass");
        debug_assert!(
            render_pass.is_compatible(&frame_buffer.render_pass),
            "{frame_buffer:?} was created for an incompatible render pass"
        );
        debug_assert!(
            width <= frame_buffer.width && height <= frame_buffer.height,
            "render area {width}x{height} exceeds the frame buffer"
        );
        clear_values.debug_validate(&render_pass.color, render_pass.depth_stencil.as_ref());
        let clears = clears(frame_buffer, render_pass, clear_values);
        self.render_pass = Some(ActiveRenderPass {
            render_pass: render_pass.clone(),
            viewport: false,
            scissor: false,
        });
        self.push(Command::BeginRenderPass {
            width,
            height,
            clears,
        });
    }

    fn bind_graphics_pipeline(&mut self, pipeline: &SoftGraphicsPipeline) {
        self.graphics_pipeline = Some(pipeline.clone());
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        debug_assert!(width > 0 && height > 0, "empty viewport");
        match &mut self.render_pass {
            Some(active) => active.viewport = true,
            None => debug_assert!(false, "viewport set outside a render pass"),
        }
    }

    fn set_scissor(&mut self, width: u32, height: u32) {
        debug_assert!(width > 0 && height > 0, "empty scissor");
        match &mut self.render_pass {
            Some(active) => active.scissor = true,
            None => debug_assert!(false, "scissor set outside a render pass"),
        }
    }

    fn bind_graphics_descriptor_sets(
        &mut self,
        layout: &crate::SoftPipelineLayout,
        sets: &[&crate::SoftDescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.graphics_set_count = self.capture_sets(layout, sets, dynamic_offsets).len();
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        let Some(active) = &self.render_pass else {
            debug_assert!(false, "draw outside a render pass");
            return;
        };
        debug_assert!(
            active.viewport && active.scissor,
            "draw before the viewport and scissor are set"
        );
        let Some(pipeline) = &self.graphics_pipeline else {
            debug_assert!(false, "draw without a bound graphics pipeline");
            return;
        };
        debug_assert!(
            pipeline.render_pass.is_compatible(&active.render_pass),
            "graphics pipeline {} was created for an incompatible render pass",
            pipeline.name
        );
        debug_assert!(
            self.graphics_set_count >= pipeline.set_count,
            "pipeline {} expects {} descriptor sets, {} bound",
            pipeline.name,
            pipeline.set_count,
            self.graphics_set_count
        );
        let pipeline = pipeline.name.clone();
        self.push(Command::Draw {
            pipeline,
            vertex_count,
            instance_count,
        });
    }

    fn end_render_pass(&mut self) {
        debug_assert!(self.render_pass.is_some(), "render pass ended without begin");
        self.render_pass = None;
        self.push(Command::EndRenderPass);
    }

    fn compute_pass_load(
        &mut self,
        storage_buffers: &[StorageView<'_, SoftBuffer>],
        storage_images: &[StorageImageView<'_, SoftTargetImage>],
    ) {
        self.debug_check_outside_render_pass("compute_pass_load");
        debug_check_storage_images(storage_images);
        if !storage_buffers.is_empty() || !storage_images.is_empty() {
            self.push(Command::Barrier("compute pass load"));
        }
    }

    fn bind_compute_pipeline(&mut self, pipeline: &crate::SoftComputePipeline) {
        self.pipeline = Some((
            pipeline.name.clone(),
            Arc::clone(&pipeline.kernel),
            pipeline.set_count,
        ));
    }

    fn bind_compute_descriptor_sets(
        &mut self,
        layout: &crate::SoftPipelineLayout,
        sets: &[&crate::SoftDescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.bound_sets = self.capture_sets(layout, sets, dynamic_offsets);
    }

    fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        self.debug_check_outside_render_pass("dispatch");
        let Some((name, kernel, set_count)) = self.pipeline.clone() else {
            debug_assert!(false, "dispatch without a bound compute pipeline");
            return;
        };
        debug_assert!(
            self.bound_sets.len() >= set_count,
            "pipeline {name} expects {set_count} descriptor sets, {} bound",
            self.bound_sets.len()
        );
        let sets = self.bound_sets.clone();
        self.push(Command::Dispatch {
            name,
            kernel,
            sets,
            group_count: [group_count_x, group_count_y, group_count_z],
        });
    }

    fn compute_pass_store(
        &mut self,
        storage_buffers: &[StorageView<'_, SoftBuffer>],
        storage_images: &[StorageImageView<'_, SoftTargetImage>],
    ) {
        debug_check_storage_images(storage_images);
        if !storage_buffers.is_empty() || !storage_images.is_empty() {
            self.push(Command::Barrier("compute pass store"));
        }
    }

    fn build_intermediate_blas(
        &mut self,
        dst: &mut SoftAccelerationStructure,
        geometries: &[TriangleGeometry<'_, SoftApi>],
        scratch: &SoftBuffer,
    ) {
        self.debug_check_outside_render_pass("build_intermediate_blas");
        debug_check_kind(dst, AccelerationStructureKind::Bottom(BlasKind::Intermediate));
        let sizes = sizing::intermediate_blas(&geometry_descs(geometries));
        debug_check_scratch(scratch, sizes.build_scratch_size);
        for geometry in geometries {
            geometry
                .vertex_buffer
                .resource()
                .ownership()
                .assert_graphics_readable("BLAS vertex buffer");
            if let Some(indices) = geometry.index_buffer {
                indices
                    .resource()
                    .ownership()
                    .assert_graphics_readable("BLAS index buffer");
            }
        }
        self.push(Command::BuildBottom {
            dst: Arc::clone(&dst.0),
            geometries: geometry_inputs(geometries),
            query: None,
        });
    }

    fn build_intermediate_blas_store(&mut self, structures: &[&SoftAccelerationStructure]) {
        if !structures.is_empty() {
            self.push(Command::Barrier("intermediate BLAS build store"));
        }
    }

    fn update_intermediate_blas(
        &mut self,
        dst: &mut SoftAccelerationStructure,
        vertex_positions: &[BuildInputView<'_, SoftBuffer>],
        scratch: &SoftBuffer,
    ) {
        debug_check_kind(dst, AccelerationStructureKind::Bottom(BlasKind::Intermediate));
        debug_check_scratch(scratch, 1);
        for view in vertex_positions {
            view.resource()
                .ownership()
                .assert_graphics_readable("BLAS vertex buffer");
        }
        self.push(Command::UpdateBottom {
            dst: Arc::clone(&dst.0),
            vertex_buffers: vertex_positions
                .iter()
                .map(|v| Arc::clone(&v.resource().0))
                .collect(),
        });
    }

    fn update_intermediate_blas_store(&mut self, structures: &[&SoftAccelerationStructure]) {
        if !structures.is_empty() {
            self.push(Command::Barrier("intermediate BLAS update store"));
        }
    }

    fn build_tlas(
        &mut self,
        dst: &mut SoftAccelerationStructure,
        instance_count: u32,
        instances: &SoftBuffer,
        scratch: &SoftBuffer,
    ) {
        self.debug_check_outside_render_pass("build_tlas");
        debug_check_kind(dst, AccelerationStructureKind::Top);
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
        debug_check_scratch(scratch, sizing::tlas(instance_count).build_scratch_size);
        self.push(Command::BuildTop {
            dst: Arc::clone(&dst.0),
            instances: Arc::clone(&instances.0),
            instance_count,
        });
    }

    fn build_tlas_store(&mut self, _tlas: &SoftAccelerationStructure) {
        self.push(Command::Barrier("TLAS build store"));
    }

    fn update_tlas(
        &mut self,
        dst: &mut SoftAccelerationStructure,
        instances: &SoftBuffer,
        scratch: &SoftBuffer,
    ) {
        debug_check_kind(dst, AccelerationStructureKind::Top);
        debug_check_scratch(scratch, 1);
        self.push(Command::UpdateTop {
            dst: Arc::clone(&dst.0),
            instances: Arc::clone(&instances.0),
        });
    }

    fn update_tlas_store(&mut self, _tlas: &SoftAccelerationStructure) {
        self.push(Command::Barrier("TLAS update store"));
    }

    fn end(&mut self) -> Result<()> {
        debug_assert!(self.recording, "graphics command buffer ended without begin");
        debug_assert_eq!(self.label_depth, 0, "unbalanced debug labels");
        debug_assert!(self.render_pass.is_none(), "graphics command buffer ended inside a render pass");
        self.recording = false;
        debug!(commands = self.commands.len(), "recorded graphics command buffer");
        Ok(())
    }

    fn acquired(&self) -> &TransferLedger {
        &self.acquired
    }
}

#[derive(Default)]
pub(crate) struct UploadSubmission {
    /// The completion semaphore has been signaled and not yet waited on.
    pub semaphore_signaled: bool,
    /// Results a graphics fence waiting on this submission will retire.
    pub retirements: Vec<Retirement>,
}

/// Upload queue command buffer.
pub struct SoftUploadCommandBuffer {
    shared: Arc<DeviceShared>,
    commands: Vec<Command>,
    released: TransferLedger,
    recording: bool,
    pub(crate) submission: Mutex<UploadSubmission>,
}

impl SoftUploadCommandBuffer {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Self {
        Self {
            shared,
            commands: Vec::new(),
            released: TransferLedger::new(),
            recording: false,
            submission: Mutex::new(UploadSubmission::default()),
        }
    }

    pub(crate) fn reset(&mut self) {
        debug_assert!(
            !self.submission.lock().semaphore_signaled,
            "upload command buffer reset before a graphics submission waited on it"
        );
        self.commands.clear();
        self.released.clear();
        self.recording = false;
    }

    pub(crate) fn commands(&self) -> &[Command] {
        debug_assert!(!self.recording, "upload command buffer submitted while recording");
        &self.commands
    }

    /// Names of the recorded commands, in order.
    pub fn command_names(&self) -> Vec<&'static str> {
        command_names(&self.commands)
    }

    /// Ownership barriers recorded by `release`.
    pub fn transfer_barriers(&self) -> impl Iterator<Item = &TransferBarrier> {
        transfer_barriers(&self.commands)
    }

    fn push(&mut self, command: Command) {
        debug_assert!(self.recording, "upload command recorded outside begin/end");
        trace!(command = command.name(), "record upload command");
        self.commands.push(command);
    }
}

impl fmt::Debug for SoftUploadCommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftUploadCommandBuffer")
            .field("commands", &self.command_names())
            .field("recording", &self.recording)
            .finish_non_exhaustive()
    }
}

impl UploadCommandBuffer<SoftApi> for SoftUploadCommandBuffer {
    fn begin(&mut self) -> Result<()> {
        debug_assert!(!self.recording, "upload command buffer begun twice");
        self.reset();
        self.recording = true;
        Ok(())
    }

    fn upload_buffer(
        &mut self,
        dst: &SoftBuffer,
        dst_offset: u64,
        staging: &SoftBuffer,
        src_offset: u64,
        size: u64,
    ) {
        debug_assert!(dst.kind().is_asset(), "{dst:?} is not a storage asset buffer");
        debug_assert!(
            staging.capabilities().contains(Capabilities::STAGING),
            "{staging:?} is not a staging buffer"
        );
        debug_assert!(
            src_offset % self.shared.capabilities.staging_buffer_offset_alignment == 0,
            "staging offset {src_offset} is misaligned"
        );
        debug_assert!(
            src_offset + size <= staging.size() && dst_offset + size <= dst.size(),
            "upload of {size} bytes is out of range"
        );
        dst.ownership().note_upload_write("storage asset buffer");
        self.push(Command::CopyBuffer {
            src: Arc::clone(&staging.0),
            src_offset,
            dst: Arc::clone(&dst.0),
            dst_offset,
            size,
        });
    }

    fn upload_image(
        &mut self,
        dst: &crate::SoftImage,
        mip_level: u32,
        staging: &SoftBuffer,
        src_offset: u64,
        src_row_pitch: u32,
        src_row_count: u32,
    ) {
        let caps = &self.shared.capabilities;
        debug_assert!(mip_level < dst.mip_levels(), "mip level {mip_level} out of range");
        debug_assert!(
            staging.capabilities().contains(Capabilities::STAGING),
            "{staging:?} is not a staging buffer"
        );
        debug_assert!(
            src_offset % caps.staging_buffer_offset_alignment == 0,
            "staging offset {src_offset} is misaligned"
        );
        debug_assert!(
            u64::from(src_row_pitch) % caps.staging_buffer_row_pitch_alignment == 0,
            "row pitch {src_row_pitch} is misaligned"
        );
        dst.ownership().note_upload_write("sampled asset image");
        self.push(Command::CopyBufferToImage {
            src: Arc::clone(&staging.0),
            src_offset,
            row_pitch: src_row_pitch,
            row_count: src_row_count,
            dst: Arc::clone(&dst.0),
            mip: mip_level,
        });
    }

    fn build_non_compacted_blas_pass_load(&mut self, inputs: &[BuildInputView<'_, SoftBuffer>]) {
        if !inputs.is_empty() {
            self.push(Command::Barrier("non-compacted BLAS pass load"));
        }
    }

    fn build_non_compacted_blas(
        &mut self,
        dst: &mut SoftAccelerationStructure,
        geometries: &[TriangleGeometry<'_, SoftApi>],
        scratch: &SoftBuffer,
        query_pool: &crate::SoftQueryPool,
        query_index: u32,
    ) {
        debug_check_kind(dst, AccelerationStructureKind::Bottom(BlasKind::NonCompacted));
        let sizes = sizing::non_compacted_blas(&geometry_descs(geometries));
        debug_check_scratch(scratch, sizes.build_scratch_size);
        debug_assert!(
            (query_index as usize) < query_pool.len(),
            "query index {query_index} out of range"
        );
        self.push(Command::BuildBottom {
            dst: Arc::clone(&dst.0),
            geometries: geometry_inputs(geometries),
            query: Some((Arc::clone(&query_pool.0), query_index)),
        });
    }

    fn build_non_compacted_blas_pass_store(&mut self, inputs: &[BuildInputView<'_, SoftBuffer>]) {
        if !inputs.is_empty() {
            self.push(Command::Barrier("non-compacted BLAS pass store"));
        }
    }

    fn compact_blas(&mut self, dst: &SoftAccelerationStructure, src: &SoftAccelerationStructure) {
        debug_check_kind(dst, AccelerationStructureKind::Bottom(BlasKind::Compacted));
        debug_check_kind(src, AccelerationStructureKind::Bottom(BlasKind::NonCompacted));
        debug_assert!(
            src.0.is_retired(),
            "compaction of {src:?} recorded before a fence covering its build was waited on"
        );
        dst.ownership().note_upload_write("compacted BLAS");
        self.push(Command::Compact {
            dst: Arc::clone(&dst.0),
            src: Arc::clone(&src.0),
        });
    }

    fn release(&mut self, assets: &TransferAssets<'_, SoftApi>) {
        assets.note_release();
        self.released.record(assets.ids());
        let barriers = plan_release(self.shared.topology, &assets.shape());
        if !barriers.is_empty() {
            self.push(Command::Transfer(barriers));
        }
    }

    fn end(&mut self) -> Result<()> {
        debug_assert!(self.recording, "upload command buffer ended without begin");
        self.recording = false;
        debug!(commands = self.commands.len(), "recorded upload command buffer");
        Ok(())
    }

    fn released(&self) -> &TransferLedger {
        &self.released
    }
}

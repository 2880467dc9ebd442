//! Logical device creation and the object factory.

use crate::accel::{build_sizes, GeometryList};
use crate::capabilities::AdapterInfo;
use crate::command::{VkGraphicsCommandBuffer, VkUploadCommandBuffer};
use crate::descriptors::{
    allocate_set, create_set_layout, write_set, VkDescriptorSet, VkDescriptorSetLayout,
    VkPipelineLayout,
};
use crate::error::{Result, VkError};
use crate::format::{
    buffer_usage, memory_location, sampled_format, sampler_filter, target_image_desc,
};
use crate::instance::{create_instance, ray_tracing_device_extensions, select_physical_device};
use crate::memory::GpuAllocator;
use crate::pipeline::{
    create_compute_pipeline, create_graphics_pipeline, create_pipeline_layout, VkComputePipeline,
    VkGraphicsPipeline,
};
use crate::queue::{VkGraphicsQueue, VkUploadQueue};
use crate::render_pass::{create_frame_buffer, create_render_pass, VkFrameBuffer, VkRenderPass};
use crate::resource::{
    BuildRecord, VkAccelerationStructure, VkBuffer, VkImage, VkQueryPool, VkSampler, VkTargetImage,
};
use crate::sync::{self, VkFence};
use crate::VkApi;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr};
use std::fmt;
use std::sync::Arc;
use tessera_core::constants::ACCELERATION_STRUCTURE_ALIGNMENT;
use tessera_core::{
    AccelerationStructureKind, AccelerationStructureSizes, BlasKind, BufferKind,
    ColorAttachmentDesc, CompareOp, DepthStencilAttachmentDesc, DescriptorBinding,
    DeviceCapabilities, Error, GeometryDesc, MemoryUsage, PoolClass, ResourceId,
    SampledAssetImageFormat, SamplerFilter, TargetImageKind,
};
use tessera_hal::pass::validate_frame_buffer;
use tessera_hal::transfer::QueueTopology;
use tessera_hal::{Api, DescriptorResources, Device, OwnershipCell};
use tracing::{debug, info, warn};

/// Pick the graphics family and, when preferred and available, a distinct
/// upload family.
///
/// The graphics family must support graphics and compute. A dedicated upload
/// family must support compute when `upload_needs_compute` is set, since
/// non-compacted BLAS builds run on the upload queue. Otherwise transfer-only
/// families are preferred. Falls back to a unified topology when no distinct
/// family qualifies.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    prefer_dedicated: bool,
    upload_needs_compute: bool,
) -> Option<QueueTopology> {
    let indexed = || {
        (0u32..)
            .zip(families)
            .filter(|(_, family)| family.queue_count > 0)
    };
    let graphics_family = indexed()
        .find(|(_, f)| {
            f.queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|(i, _)| i)?;
    if !prefer_dedicated {
        return Some(QueueTopology::Unified {
            family: graphics_family,
        });
    }

    let candidates = || {
        indexed().filter(move |(i, f)| {
            *i != graphics_family && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
    };
    let transfer_only = candidates()
        .find(|(_, f)| {
            f.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !f.queue_flags.contains(vk::QueueFlags::COMPUTE)
        })
        .map(|(i, _)| i);
    let async_compute = candidates()
        .find(|(_, f)| f.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|(i, _)| i);

    let upload_family = if upload_needs_compute {
        async_compute
    } else {
        transfer_only.or(async_compute)
    };
    Some(match upload_family {
        Some(upload_family) => QueueTopology::Dedicated {
            graphics_family,
            upload_family,
        },
        None => QueueTopology::Unified {
            family: graphics_family,
        },
    })
}

/// Everything shared by the device and the objects it creates.
pub(crate) struct DeviceShared {
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) as_loader: Option<ash::khr::acceleration_structure::Device>,
    pub(crate) debug_utils: Option<ash::ext::debug_utils::Device>,
    pub(crate) allocator: Mutex<GpuAllocator>,
    pub(crate) capabilities: DeviceCapabilities,
    pub(crate) topology: QueueTopology,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) upload_queue: vk::Queue,
    /// Serializes submissions, since the two logical queues may alias.
    pub(crate) submit_lock: Mutex<()>,
}

impl DeviceShared {
    pub(crate) fn ray_tracing(&self) -> bool {
        self.as_loader.is_some()
    }

    /// The acceleration structure loader. Using it without ray tracing is a
    /// contract violation.
    pub(crate) fn as_loader(&self, operation: &str) -> Option<&ash::khr::acceleration_structure::Device> {
        debug_assert!(
            self.as_loader.is_some(),
            "{operation} requires a device created with ray tracing"
        );
        self.as_loader.as_ref()
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> u64 {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Frees every VkDeviceMemory, so it must run before the device goes.
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for a Vulkan device.
pub struct DeviceBuilder {
    app_name: String,
    enable_validation: bool,
    ray_tracing: bool,
    display: Option<RawDisplayHandle>,
    dedicated_upload_queue: bool,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "Tessera".to_string(),
            enable_validation: cfg!(debug_assertions),
            ray_tracing: true,
            display: None,
            dedicated_upload_queue: true,
        }
    }
}

impl DeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Require acceleration structures and ray queries.
    #[must_use]
    pub const fn ray_tracing(mut self, enable: bool) -> Self {
        self.ray_tracing = enable;
        self
    }

    /// Windowing-system connection used to pick presentation extensions.
    #[must_use]
    pub const fn display(mut self, display: Option<RawDisplayHandle>) -> Self {
        self.display = display;
        self
    }

    /// Prefer a distinct upload queue family when the device has one.
    #[must_use]
    pub const fn dedicated_upload_queue(mut self, prefer: bool) -> Self {
        self.dedicated_upload_queue = prefer;
        self
    }

    /// Build the device.
    pub fn build(self) -> Result<VkDevice> {
        let entry =
            unsafe { ash::Entry::load() }.map_err(|e| VkError::Loading(e.to_string()))?;
        let instance = unsafe {
            create_instance(&entry, &self.app_name, self.enable_validation, self.display)
        }?;
        match unsafe { self.build_on(entry, &instance) } {
            Ok(device) => Ok(device),
            Err(error) => {
                unsafe { instance.destroy_instance(None) };
                Err(error)
            }
        }
    }

    /// # Safety
    /// `instance` must be valid. On success, the returned device owns it.
    unsafe fn build_on(self, entry: ash::Entry, instance: &ash::Instance) -> Result<VkDevice> {
        let physical_device = select_physical_device(instance, self.ray_tracing)?;
        let adapter = AdapterInfo::query(instance, physical_device);
        info!("Selected GPU: {}", adapter.summary());

        let families = instance.get_physical_device_queue_family_properties(physical_device);
        let topology =
            select_queue_families(&families, self.dedicated_upload_queue, self.ray_tracing)
                .ok_or(VkError::NoSuitableDevice)?;
        info!(?topology, "Selected queue families");

        let device = create_logical_device(
            instance,
            physical_device,
            topology,
            &adapter,
            self.ray_tracing,
            self.display.is_some(),
        )?;
        let graphics_queue = device.get_device_queue(topology.graphics_family(), 0);
        let upload_queue = device.get_device_queue(topology.upload_family(), 0);
        let device = Arc::new(device);

        let allocator = match GpuAllocator::new(instance, Arc::clone(&device), physical_device) {
            Ok(allocator) => allocator,
            Err(error) => {
                device.destroy_device(None);
                return Err(error);
            }
        };

        let as_loader = self
            .ray_tracing
            .then(|| ash::khr::acceleration_structure::Device::new(instance, &device));
        let debug_utils = self
            .enable_validation
            .then(|| ash::ext::debug_utils::Device::new(instance, &device));
        let capabilities =
            adapter.device_capabilities(VkApi::NAME, self.ray_tracing, topology.is_dedicated());
        info!("Device capabilities: {}", capabilities.summary());

        Ok(VkDevice {
            shared: Arc::new(DeviceShared {
                entry,
                instance: instance.clone(),
                device,
                as_loader,
                debug_utils,
                allocator: Mutex::new(allocator),
                capabilities,
                topology,
                graphics_queue,
                upload_queue,
                submit_lock: Mutex::new(()),
            }),
        })
    }
}

/// Create the logical device with one queue per used family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    topology: QueueTopology,
    adapter: &AdapterInfo,
    ray_tracing: bool,
    presentation: bool,
) -> Result<ash::Device> {
    let mut unique_families = vec![topology.graphics_family()];
    if topology.upload_family() != topology.graphics_family() {
        unique_families.push(topology.upload_family());
    }
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let mut extensions: Vec<&CStr> = Vec::new();
    if presentation {
        extensions.push(ash::khr::swapchain::NAME);
    }
    if ray_tracing {
        extensions.extend(ray_tracing_device_extensions());
    }
    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
    let mut vulkan_1_2_features =
        vk::PhysicalDeviceVulkan12Features::default().buffer_device_address(true);
    let mut as_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);

    let features = vk::PhysicalDeviceFeatures::default()
        .texture_compression_bc(adapter.texture_compression_bc)
        .texture_compression_astc_ldr(adapter.texture_compression_astc);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);
    if ray_tracing {
        features2 = features2
            .push_next(&mut as_features)
            .push_next(&mut ray_query_features);
    }

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    Ok(instance.create_device(physical_device, &device_create_info, None)?)
}

/// A Vulkan device.
pub struct VkDevice {
    pub(crate) shared: Arc<DeviceShared>,
}

impl VkDevice {
    /// The raw device.
    pub fn raw(&self) -> &ash::Device {
        &self.shared.device
    }

    /// Number of buffer and image allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.shared.allocator.lock().live_allocations()
    }

    /// Wait for all queues to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.shared.device.device_wait_idle()? };
        Ok(())
    }

    fn blas_sizes(&self, kind: BlasKind, geometries: &[GeometryDesc]) -> AccelerationStructureSizes {
        let Some(loader) = self.shared.as_loader("BLAS sizing") else {
            return AccelerationStructureSizes::default();
        };
        unsafe {
            build_sizes(
                loader,
                AccelerationStructureKind::Bottom(kind),
                &GeometryList::bottom_for_sizing(geometries),
            )
        }
    }

    fn require_ray_tracing(&self, what: &str) -> tessera_core::Result<()> {
        if self.shared.ray_tracing() {
            return Ok(());
        }
        debug_assert!(false, "{what} requires a device created with ray tracing");
        Err(Error::Unsupported(format!("{what} without ray tracing")))
    }
}

impl fmt::Debug for VkDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VkDevice")
            .field("device_name", &self.shared.capabilities.device_name)
            .field("topology", &self.shared.topology)
            .finish_non_exhaustive()
    }
}

/// Number of mip levels in a full chain for the given extent.
const fn full_mip_chain(width: u32, height: u32) -> u32 {
    let largest = if width > height { width } else { height };
    32 - largest.leading_zeros()
}

impl Device<VkApi> for VkDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.shared.capabilities
    }

    fn topology(&self) -> QueueTopology {
        self.shared.topology
    }

    fn create_graphics_queue(&self) -> tessera_core::Result<VkGraphicsQueue> {
        Ok(VkGraphicsQueue::new(Arc::clone(&self.shared)))
    }

    fn destroy_graphics_queue(&self, _queue: VkGraphicsQueue) {}

    fn create_upload_queue(&self) -> tessera_core::Result<VkUploadQueue> {
        Ok(VkUploadQueue::new(Arc::clone(&self.shared)))
    }

    fn destroy_upload_queue(&self, _queue: VkUploadQueue) {}

    fn create_graphics_command_buffer(&self) -> tessera_core::Result<VkGraphicsCommandBuffer> {
        Ok(VkGraphicsCommandBuffer::new(Arc::clone(&self.shared))?)
    }

    fn reset_graphics_command_buffer(
        &self,
        command_buffer: &mut VkGraphicsCommandBuffer,
    ) -> tessera_core::Result<()> {
        Ok(command_buffer.reset()?)
    }

    fn destroy_graphics_command_buffer(&self, command_buffer: VkGraphicsCommandBuffer) {
        command_buffer.destroy();
    }

    fn create_upload_command_buffer(&self) -> tessera_core::Result<VkUploadCommandBuffer> {
        Ok(VkUploadCommandBuffer::new(Arc::clone(&self.shared))?)
    }

    fn reset_upload_command_buffer(
        &self,
        command_buffer: &mut VkUploadCommandBuffer,
    ) -> tessera_core::Result<()> {
        Ok(command_buffer.reset()?)
    }

    fn destroy_upload_command_buffer(&self, command_buffer: VkUploadCommandBuffer) {
        command_buffer.destroy();
    }

    fn create_fence(&self, signaled: bool) -> tessera_core::Result<VkFence> {
        let raw = unsafe { sync::create_fence(&self.shared.device, signaled)? };
        Ok(VkFence { raw })
    }

    fn wait_for_fence(&self, fence: &VkFence) -> tessera_core::Result<()> {
        unsafe { sync::wait_for_fence(&self.shared.device, fence.raw, u64::MAX)? };
        Ok(())
    }

    fn reset_fence(&self, fence: &VkFence) -> tessera_core::Result<()> {
        unsafe { sync::reset_fence(&self.shared.device, fence.raw)? };
        Ok(())
    }

    fn destroy_fence(&self, fence: VkFence) {
        unsafe { self.shared.device.destroy_fence(fence.raw, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> tessera_core::Result<VkDescriptorSetLayout> {
        Ok(unsafe { create_set_layout(&self.shared.device, bindings)? })
    }

    fn destroy_descriptor_set_layout(&self, layout: VkDescriptorSetLayout) {
        unsafe {
            self.shared
                .device
                .destroy_descriptor_set_layout(layout.raw, None);
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[&VkDescriptorSetLayout],
    ) -> tessera_core::Result<VkPipelineLayout> {
        Ok(unsafe { create_pipeline_layout(&self.shared.device, set_layouts)? })
    }

    fn destroy_pipeline_layout(&self, layout: VkPipelineLayout) {
        unsafe { self.shared.device.destroy_pipeline_layout(layout.raw, None) };
    }

    fn create_descriptor_set(
        &self,
        layout: &VkDescriptorSetLayout,
    ) -> tessera_core::Result<VkDescriptorSet> {
        Ok(unsafe { allocate_set(&self.shared.device, layout)? })
    }

    fn write_descriptor_set(
        &self,
        set: &mut VkDescriptorSet,
        binding: u32,
        first_element: u32,
        resources: DescriptorResources<'_, VkApi>,
    ) {
        if let DescriptorResources::TopLevelAccelerationStructures(_) = &resources {
            debug_assert!(
                self.shared.ray_tracing(),
                "TLAS descriptors require a device created with ray tracing"
            );
        }
        unsafe { write_set(&self.shared.device, set, binding, first_element, resources) };
    }

    fn destroy_descriptor_set(&self, set: VkDescriptorSet) {
        unsafe { self.shared.device.destroy_descriptor_pool(set.pool, None) };
    }

    fn create_compute_pipeline(
        &self,
        layout: &VkPipelineLayout,
        code: &[u8],
    ) -> tessera_core::Result<VkComputePipeline> {
        Ok(unsafe { create_compute_pipeline(&self.shared.device, layout, code)? })
    }

    fn destroy_compute_pipeline(&self, pipeline: VkComputePipeline) {
        unsafe { self.shared.device.destroy_pipeline(pipeline.raw, None) };
    }

    fn create_render_pass(
        &self,
        color_attachments: &[ColorAttachmentDesc],
        depth_stencil_attachment: Option<DepthStencilAttachmentDesc>,
    ) -> tessera_core::Result<VkRenderPass> {
        let render_pass = unsafe {
            create_render_pass(&self.shared.device, color_attachments, depth_stencil_attachment)?
        };
        debug!(
            colors = color_attachments.len(),
            depth_stencil = depth_stencil_attachment.is_some(),
            "created render pass"
        );
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: VkRenderPass) {
        unsafe { self.shared.device.destroy_render_pass(render_pass.raw, None) };
    }

    fn create_graphics_pipeline(
        &self,
        render_pass: &VkRenderPass,
        layout: &VkPipelineLayout,
        vertex_code: &[u8],
        fragment_code: &[u8],
        depth_test: Option<CompareOp>,
    ) -> tessera_core::Result<VkGraphicsPipeline> {
        Ok(unsafe {
            create_graphics_pipeline(
                &self.shared.device,
                render_pass,
                layout,
                vertex_code,
                fragment_code,
                depth_test,
            )?
        })
    }

    fn destroy_graphics_pipeline(&self, pipeline: VkGraphicsPipeline) {
        unsafe { self.shared.device.destroy_pipeline(pipeline.raw, None) };
    }

    fn create_frame_buffer(
        &self,
        render_pass: &VkRenderPass,
        width: u32,
        height: u32,
        color_attachments: &[&VkTargetImage],
        depth_stencil_attachment: Option<&VkTargetImage>,
    ) -> tessera_core::Result<VkFrameBuffer> {
        validate_frame_buffer(
            render_pass,
            width,
            height,
            color_attachments,
            depth_stencil_attachment,
        )?;
        Ok(unsafe {
            create_frame_buffer(
                &self.shared.device,
                render_pass,
                width,
                height,
                color_attachments,
                depth_stencil_attachment,
            )?
        })
    }

    fn destroy_frame_buffer(&self, frame_buffer: VkFrameBuffer) {
        unsafe { self.shared.device.destroy_framebuffer(frame_buffer.raw, None) };
    }

    fn create_buffer(&self, kind: BufferKind, size: u64) -> tessera_core::Result<VkBuffer> {
        if size == 0 {
            return Err(Error::InvalidState(format!("{kind:?} buffer of zero bytes")));
        }
        if matches!(kind, BufferKind::Scratch | BufferKind::TlasInstanceUpload) {
            self.require_ray_tracing("scratch and instance buffers")?;
        }
        let ray_tracing = self.shared.ray_tracing();
        let usage = buffer_usage(kind, ray_tracing);
        let pool = kind.pool_class();
        let min_alignment = match kind {
            BufferKind::Scratch => self.shared.capabilities.scratch_offset_alignment,
            BufferKind::TlasInstanceUpload => 16,
            _ => 1,
        };
        let memory = self.shared.allocator.lock().create_buffer(
            size,
            usage,
            memory_location(pool.memory_usage()),
            pool.label(),
            min_alignment,
        )?;
        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            self.shared.buffer_device_address(memory.buffer)
        } else {
            0
        };
        debug!(?kind, size, "created buffer");
        Ok(VkBuffer {
            id: ResourceId::next(),
            kind,
            memory,
            device_address,
            ownership: OwnershipCell::for_kind(kind.is_asset()),
        })
    }

    fn destroy_buffer(&self, mut buffer: VkBuffer) {
        if let Err(error) = self.shared.allocator.lock().free_buffer(&mut buffer.memory) {
            warn!(%error, "failed to free buffer");
        }
    }

    fn create_sampled_asset_image(
        &self,
        format: SampledAssetImageFormat,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> tessera_core::Result<VkImage> {
        if !self.shared.capabilities.supports_format(format) {
            debug_assert!(false, "{format:?} is not supported by this device");
            return Err(Error::Unsupported(format!("{format:?}")));
        }
        let max_mips = full_mip_chain(width, height);
        if width == 0 || height == 0 || mip_levels == 0 || mip_levels > max_mips {
            return Err(Error::InvalidState(format!(
                "{width}x{height} image cannot have {mip_levels} mip levels"
            )));
        }

        let vk_format = sampled_format(format);
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut memory = self.shared.allocator.lock().create_image(
            &create_info,
            memory_location(MemoryUsage::DeviceLocal),
            PoolClass::SampledAssetImage.label(),
        )?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(memory.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(vk_format)
            .subresource_range(crate::barrier::color_range(0, mip_levels));
        let view = match unsafe { self.shared.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(error) => {
                if let Err(free_error) = self.shared.allocator.lock().free_image(&mut memory) {
                    warn!(%free_error, "failed to free image");
                }
                return Err(VkError::from(error).into());
            }
        };

        debug!(?format, width, height, mip_levels, "created sampled asset image");
        Ok(VkImage {
            id: ResourceId::next(),
            format,
            extent: (width, height),
            mip_levels,
            memory,
            view,
            ownership: OwnershipCell::asset(),
        })
    }

    fn destroy_image(&self, mut image: VkImage) {
        unsafe { self.shared.device.destroy_image_view(image.view, None) };
        if let Err(error) = self.shared.allocator.lock().free_image(&mut image.memory) {
            warn!(%error, "failed to free image");
        }
    }

    fn create_target_image(
        &self,
        kind: TargetImageKind,
        width: u32,
        height: u32,
        allow_sampled: bool,
    ) -> tessera_core::Result<VkTargetImage> {
        if let TargetImageKind::DepthStencilAttachment(format) = kind {
            let caps = &self.shared.capabilities;
            if format != caps.depth_attachment_format && format != caps.depth_stencil_attachment_format {
                debug_assert!(false, "{format:?} is not a depth format of this device");
                return Err(Error::Unsupported(format!("{format:?}")));
            }
        }
        if width == 0 || height == 0 {
            return Err(Error::InvalidState(format!("{width}x{height} {kind:?} image")));
        }

        let (vk_format, usage, aspect) = target_image_desc(kind, allow_sampled);
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut memory = self.shared.allocator.lock().create_image(
            &create_info,
            memory_location(MemoryUsage::DeviceLocal),
            kind.pool_class().label(),
        )?;

        // Sampling a depth-stencil image reads the depth aspect only.
        let view_aspect = if aspect.contains(vk::ImageAspectFlags::DEPTH) {
            vk::ImageAspectFlags::DEPTH
        } else {
            aspect
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(memory.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(vk_format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(view_aspect)
                    .level_count(1)
                    .layer_count(1),
            );
        let view = match unsafe { self.shared.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(error) => {
                if let Err(free_error) = self.shared.allocator.lock().free_image(&mut memory) {
                    warn!(%free_error, "failed to free image");
                }
                return Err(VkError::from(error).into());
            }
        };

        debug!(?kind, width, height, allow_sampled, "created target image");
        Ok(VkTargetImage {
            id: ResourceId::next(),
            kind,
            extent: (width, height),
            allow_sampled,
            memory,
            view,
            aspect,
            ownership: OwnershipCell::untracked(),
        })
    }

    fn destroy_target_image(&self, mut image: VkTargetImage) {
        unsafe { self.shared.device.destroy_image_view(image.view, None) };
        if let Err(error) = self.shared.allocator.lock().free_image(&mut image.memory) {
            warn!(%error, "failed to free image");
        }
    }

    fn create_sampler(&self, filter: SamplerFilter) -> tessera_core::Result<VkSampler> {
        let (vk_filter, mipmap_mode) = sampler_filter(filter);
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk_filter)
            .min_filter(vk_filter)
            .mipmap_mode(mipmap_mode)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(vk::LOD_CLAMP_NONE);
        let raw = unsafe { self.shared.device.create_sampler(&info, None) }.map_err(VkError::from)?;
        Ok(VkSampler { raw, filter })
    }

    fn destroy_sampler(&self, sampler: VkSampler) {
        unsafe { self.shared.device.destroy_sampler(sampler.raw, None) };
    }

    fn intermediate_blas_sizes(&self, geometries: &[GeometryDesc]) -> AccelerationStructureSizes {
        self.blas_sizes(BlasKind::Intermediate, geometries)
    }

    fn non_compacted_blas_sizes(&self, geometries: &[GeometryDesc]) -> AccelerationStructureSizes {
        self.blas_sizes(BlasKind::NonCompacted, geometries)
    }

    fn tlas_sizes(&self, instance_count: u32) -> AccelerationStructureSizes {
        let Some(loader) = self.shared.as_loader("TLAS sizing") else {
            return AccelerationStructureSizes::default();
        };
        unsafe {
            build_sizes(
                loader,
                AccelerationStructureKind::Top,
                &GeometryList::top(0, instance_count),
            )
        }
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        size: u64,
    ) -> tessera_core::Result<VkAccelerationStructure> {
        self.require_ray_tracing("acceleration structures")?;
        let Some(loader) = self.shared.as_loader.as_ref() else {
            return Err(Error::Unsupported("acceleration structures".to_string()));
        };
        let mut storage = self.shared.allocator.lock().create_buffer(
            size.max(1),
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            memory_location(MemoryUsage::DeviceLocal),
            PoolClass::for_acceleration_structure(kind).label(),
            ACCELERATION_STRUCTURE_ALIGNMENT,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage.buffer)
            .offset(0)
            .size(size)
            .ty(crate::accel::structure_type(kind));
        let raw = match unsafe { loader.create_acceleration_structure(&create_info, None) } {
            Ok(raw) => raw,
            Err(error) => {
                if let Err(free_error) = self.shared.allocator.lock().free_buffer(&mut storage) {
                    warn!(%free_error, "failed to free acceleration structure storage");
                }
                return Err(VkError::from(error).into());
            }
        };

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(raw);
        let device_address = unsafe { loader.get_acceleration_structure_device_address(&address_info) };

        debug!(?kind, size, device_address, "created acceleration structure");
        Ok(VkAccelerationStructure {
            id: ResourceId::next(),
            kind,
            raw,
            storage,
            device_address,
            built: BuildRecord::Unbuilt,
            ownership: OwnershipCell::for_kind(kind.is_asset()),
        })
    }

    fn destroy_acceleration_structure(&self, mut structure: VkAccelerationStructure) {
        if let Some(loader) = self.shared.as_loader.as_ref() {
            unsafe { loader.destroy_acceleration_structure(structure.raw, None) };
        }
        if let Err(error) = self.shared.allocator.lock().free_buffer(&mut structure.storage) {
            warn!(%error, "failed to free acceleration structure storage");
        }
    }

    fn create_compacted_size_query_pool(&self, query_count: u32) -> tessera_core::Result<VkQueryPool> {
        self.require_ray_tracing("compacted size queries")?;
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(query_count.max(1));
        let raw = unsafe {
            self.shared
                .device
                .create_query_pool(&create_info, None)
                .map_err(VkError::from)?
        };
        Ok(VkQueryPool {
            raw,
            count: query_count,
        })
    }

    fn compacted_size(&self, pool: &VkQueryPool, index: u32) -> tessera_core::Result<u64> {
        if index >= pool.count {
            return Err(Error::InvalidState(format!(
                "query index {index} out of a pool of {}",
                pool.count
            )));
        }
        let mut size = [0u64];
        unsafe {
            self.shared
                .device
                .get_query_pool_results(
                    pool.raw,
                    index,
                    &mut size,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
                .map_err(VkError::from)?;
        }
        debug!(index, compacted = size[0], "read compacted size");
        Ok(size[0])
    }

    fn destroy_query_pool(&self, pool: VkQueryPool) {
        unsafe { self.shared.device.destroy_query_pool(pool.raw, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn desktop_families() -> Vec<vk::QueueFamilyProperties> {
        vec![
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ]
    }

    #[test]
    fn transfer_only_family_is_preferred_without_ray_tracing() {
        assert_eq!(
            select_queue_families(&desktop_families(), true, false),
            Some(QueueTopology::Dedicated {
                graphics_family: 0,
                upload_family: 1
            })
        );
    }

    #[test]
    fn ray_tracing_uploads_need_a_compute_family() {
        assert_eq!(
            select_queue_families(&desktop_families(), true, true),
            Some(QueueTopology::Dedicated {
                graphics_family: 0,
                upload_family: 2
            })
        );
    }

    #[test]
    fn falls_back_to_unified() {
        let single = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        assert_eq!(
            select_queue_families(&single, true, true),
            Some(QueueTopology::Unified { family: 0 })
        );
        assert_eq!(
            select_queue_families(&desktop_families(), false, false),
            Some(QueueTopology::Unified { family: 0 })
        );
    }

    #[test]
    fn no_graphics_family_is_unusable() {
        let compute_only = [family(vk::QueueFlags::COMPUTE)];
        assert_eq!(select_queue_families(&compute_only, true, false), None);
    }

    #[test]
    fn mip_chain_length() {
        assert_eq!(full_mip_chain(1, 1), 1);
        assert_eq!(full_mip_chain(256, 64), 9);
        assert_eq!(full_mip_chain(300, 2), 9);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn creates_device_and_buffers() {
        let device = DeviceBuilder::new().ray_tracing(false).build().unwrap();
        let buffer = device.create_buffer(BufferKind::StagingUpload, 256).unwrap();
        tessera_hal::Buffer::write_bytes(&buffer, 0, &[7; 256]).unwrap();
        let mut out = [0; 4];
        tessera_hal::Buffer::read_bytes(&buffer, 252, &mut out).unwrap();
        assert_eq!(out, [7; 4]);
        device.destroy_buffer(buffer);
        assert_eq!(device.live_allocations(), 0);
    }
    #[test]
    #[ignore = "Requires GPU hardware"]
    fn creates_attachments_and_a_frame_buffer() {
        use tessera_core::{
            ColorAttachmentImageFormat, ColorLoadOp, ColorStoreOp, DepthStencilLoadOp,
            DepthStencilStoreOp,
        };
        let device = DeviceBuilder::new().ray_tracing(false).build().unwrap();
        let depth_format = device.capabilities().depth_attachment_format;
        let render_pass = device
            .create_render_pass(
                &[ColorAttachmentDesc {
                    format: ColorAttachmentImageFormat::R8G8B8A8Unorm,
                    load: ColorLoadOp::Clear,
                    store: ColorStoreOp::FlushForSampledImage,
                }],
                Some(DepthStencilAttachmentDesc {
                    format: depth_format,
                    load: DepthStencilLoadOp::Clear,
                    store: DepthStencilStoreOp::DontCare,
                }),
            )
            .unwrap();
        let color = device
            .create_target_image(
                TargetImageKind::ColorAttachment(ColorAttachmentImageFormat::R8G8B8A8Unorm),
                64,
                64,
                true,
            )
            .unwrap();
        let depth = device
            .create_target_image(TargetImageKind::DepthStencilAttachment(depth_format), 64, 64, false)
            .unwrap();
        assert!(device
            .create_frame_buffer(&render_pass, 128, 64, &[&color], Some(&depth))
            .is_err());
        let frame_buffer = device
            .create_frame_buffer(&render_pass, 64, 64, &[&color], Some(&depth))
            .unwrap();
        let sampler = device.create_sampler(SamplerFilter::Nearest).unwrap();

        device.destroy_sampler(sampler);
        device.destroy_frame_buffer(frame_buffer);
        device.destroy_target_image(depth);
        device.destroy_target_image(color);
        device.destroy_render_pass(render_pass);
        assert_eq!(device.live_allocations(), 0);
    }
}

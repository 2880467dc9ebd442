//! Descriptor set management.

use crate::error::Result;
use crate::format::descriptor_type;
use crate::VkApi;
use ash::vk;
use tessera_core::DescriptorBinding;
use tessera_hal::{Buffer, DescriptorResources};

/// A descriptor set layout and the bindings it was created from.
#[derive(Debug)]
pub struct VkDescriptorSetLayout {
    pub(crate) raw: vk::DescriptorSetLayout,
    pub(crate) bindings: Vec<DescriptorBinding>,
}

impl VkDescriptorSetLayout {
    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.raw
    }
}

#[derive(Debug)]
pub struct VkPipelineLayout {
    pub(crate) raw: vk::PipelineLayout,
}

impl VkPipelineLayout {
    pub fn raw(&self) -> vk::PipelineLayout {
        self.raw
    }
}

/// A descriptor set allocated from its own pool.
#[derive(Debug)]
pub struct VkDescriptorSet {
    pub(crate) raw: vk::DescriptorSet,
    pub(crate) pool: vk::DescriptorPool,
}

impl VkDescriptorSet {
    pub fn raw(&self) -> vk::DescriptorSet {
        self.raw
    }
}

/// Shader stages that may read a descriptor.
pub const DESCRIPTOR_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::COMPUTE.as_raw()
        | vk::ShaderStageFlags::VERTEX.as_raw()
        | vk::ShaderStageFlags::FRAGMENT.as_raw(),
);

/// Layout bindings visible to compute, vertex and fragment shaders.
pub fn layout_bindings(bindings: &[DescriptorBinding]) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
    bindings
        .iter()
        .map(|b| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(b.binding)
                .descriptor_type(descriptor_type(b.descriptor_type))
                .descriptor_count(b.count)
                .stage_flags(DESCRIPTOR_STAGES)
        })
        .collect()
}

/// Pool sizes holding exactly one set of `bindings`, merged per native type.
pub fn pool_sizes(bindings: &[DescriptorBinding]) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        let ty = descriptor_type(binding.descriptor_type);
        match sizes.iter_mut().find(|s| s.ty == ty) {
            Some(size) => size.descriptor_count += binding.count,
            None => sizes.push(
                vk::DescriptorPoolSize::default()
                    .ty(ty)
                    .descriptor_count(binding.count),
            ),
        }
    }
    sizes
}

/// Create a descriptor set layout.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_set_layout(
    device: &ash::Device,
    bindings: &[DescriptorBinding],
) -> Result<VkDescriptorSetLayout> {
    let native = layout_bindings(bindings);
    let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&native);
    let raw = device.create_descriptor_set_layout(&layout_info, None)?;
    Ok(VkDescriptorSetLayout {
        raw,
        bindings: bindings.to_vec(),
    })
}

/// Create a pool sized for one set of `layout` and allocate the set.
///
/// # Safety
/// The device must be valid.
pub unsafe fn allocate_set(
    device: &ash::Device,
    layout: &VkDescriptorSetLayout,
) -> Result<VkDescriptorSet> {
    let sizes = pool_sizes(&layout.bindings);
    let create_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(1)
        .pool_sizes(&sizes);
    let pool = device.create_descriptor_pool(&create_info, None)?;

    let layouts = [layout.raw];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    match device.allocate_descriptor_sets(&alloc_info) {
        Ok(sets) => Ok(VkDescriptorSet { raw: sets[0], pool }),
        Err(error) => {
            device.destroy_descriptor_pool(pool, None);
            Err(error.into())
        }
    }
}

/// Write `resources` into `set` starting at `first_element` of `binding`.
///
/// # Safety
/// The device and every referenced handle must be valid, and the set must not
/// be in use by the device.
pub unsafe fn write_set(
    device: &ash::Device,
    set: &VkDescriptorSet,
    binding: u32,
    first_element: u32,
    resources: DescriptorResources<'_, VkApi>,
) {
    let write = vk::WriteDescriptorSet::default()
        .dst_set(set.raw)
        .dst_binding(binding)
        .dst_array_element(first_element);

    match resources {
        DescriptorResources::DynamicUniformBuffers { buffers, ranges } => {
            debug_assert_eq!(buffers.len(), ranges.len(), "one range per uniform buffer");
            let infos: Vec<vk::DescriptorBufferInfo> = buffers
                .iter()
                .zip(ranges)
                .map(|(buffer, &range)| buffer_info(buffer, range))
                .collect();
            let write = write
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(&infos);
            device.update_descriptor_sets(&[write], &[]);
        }
        DescriptorResources::ReadOnlyStorageBuffers(views) => {
            let infos: Vec<vk::DescriptorBufferInfo> = views
                .iter()
                .map(|view| buffer_info(view.resource(), vk::WHOLE_SIZE))
                .collect();
            let write = write
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&infos);
            device.update_descriptor_sets(&[write], &[]);
        }
        DescriptorResources::StorageBuffers(views) => {
            let infos: Vec<vk::DescriptorBufferInfo> = views
                .iter()
                .map(|view| buffer_info(view.resource(), vk::WHOLE_SIZE))
                .collect();
            let write = write
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&infos);
            device.update_descriptor_sets(&[write], &[]);
        }
        DescriptorResources::SampledImages(views) => {
            let infos: Vec<vk::DescriptorImageInfo> = views
                .iter()
                .map(|view| image_info(view.resource().view(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL))
                .collect();
            let write = write
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .image_info(&infos);
            device.update_descriptor_sets(&[write], &[]);
        }
        DescriptorResources::SampledTargetImages(views) => {
            let infos: Vec<vk::DescriptorImageInfo> = views
                .iter()
                .map(|view| image_info(view.resource().view(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL))
                .collect();
            let write = write
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .image_info(&infos);
            device.update_descriptor_sets(&[write], &[]);
        }
        DescriptorResources::StorageImages(views) => {
            let infos: Vec<vk::DescriptorImageInfo> = views
                .iter()
                .map(|view| image_info(view.resource().view(), vk::ImageLayout::GENERAL))
                .collect();
            let write = write
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&infos);
            device.update_descriptor_sets(&[write], &[]);
        }
        DescriptorResources::Samplers(samplers) => {
            let infos: Vec<vk::DescriptorImageInfo> = samplers
                .iter()
                .map(|sampler| vk::DescriptorImageInfo::default().sampler(sampler.raw()))
                .collect();
            let write = write
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .image_info(&infos);
            device.update_descriptor_sets(&[write], &[]);
        }
        DescriptorResources::TopLevelAccelerationStructures(structures) => {
            let handles: Vec<vk::AccelerationStructureKHR> = structures
                .iter()
                .map(|s| s.raw())
                .collect();
            let mut structure_write = vk::WriteDescriptorSetAccelerationStructureKHR::default()
                .acceleration_structures(&handles);
            let write = write
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(handles.len() as u32)
                .push_next(&mut structure_write);
            device.update_descriptor_sets(&[write], &[]);
        }
    }
}

fn image_info(view: vk::ImageView, layout: vk::ImageLayout) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo::default()
        .image_view(view)
        .image_layout(layout)
}

fn buffer_info(buffer: &crate::VkBuffer, range: u64) -> vk::DescriptorBufferInfo {
    let range = if range == vk::WHOLE_SIZE {
        buffer.size()
    } else {
        range
    };
    vk::DescriptorBufferInfo::default()
        .buffer(buffer.raw())
        .offset(0)
        .range(range)
}

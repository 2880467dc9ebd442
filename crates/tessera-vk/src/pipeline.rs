//! Compute and graphics pipeline creation.

use crate::descriptors::{VkDescriptorSetLayout, VkPipelineLayout};
use crate::error::{Result, VkError};
use crate::format::compare_op;
use crate::render_pass::VkRenderPass;
use ash::vk;
use std::io::Cursor;
use tessera_core::CompareOp;

/// A compute pipeline.
#[derive(Debug)]
pub struct VkComputePipeline {
    pub(crate) raw: vk::Pipeline,
}

impl VkComputePipeline {
    pub fn raw(&self) -> vk::Pipeline {
        self.raw
    }
}

/// A graphics pipeline for subpass 0 of a render pass.
#[derive(Debug)]
pub struct VkGraphicsPipeline {
    pub(crate) raw: vk::Pipeline,
}

impl VkGraphicsPipeline {
    pub fn raw(&self) -> vk::Pipeline {
        self.raw
    }
}

/// Decode SPIR-V bytes into words, checking size and magic number.
pub fn spirv_words(code: &[u8]) -> Result<Vec<u32>> {
    const MAGIC_NUMBER: u32 = 0x0723_0203;
    let words =
        ash::util::read_spv(&mut Cursor::new(code)).map_err(|e| VkError::ShaderModule(e.to_string()))?;
    if words.first() != Some(&MAGIC_NUMBER) {
        return Err(VkError::ShaderModule("missing SPIR-V magic number".to_string()));
    }
    Ok(words)
}

/// # Safety
/// The device must be valid.
unsafe fn shader_module(device: &ash::Device, code: &[u8], stage: &str) -> Result<vk::ShaderModule> {
    let words = spirv_words(code)?;
    let shader_info = vk::ShaderModuleCreateInfo::default().code(&words);
    device
        .create_shader_module(&shader_info, None)
        .map_err(|e| VkError::ShaderModule(format!("{stage}: {e}")))
}

/// Create a pipeline layout over `set_layouts`.
///
/// # Safety
/// The device and layouts must be valid.
pub unsafe fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[&VkDescriptorSetLayout],
) -> Result<VkPipelineLayout> {
    let raw_layouts: Vec<vk::DescriptorSetLayout> = set_layouts.iter().map(|l| l.raw).collect();
    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&raw_layouts);
    let raw = device
        .create_pipeline_layout(&layout_info, None)
        .map_err(|e| VkError::PipelineCreation(e.to_string()))?;
    Ok(VkPipelineLayout { raw })
}

/// Create a compute pipeline from SPIR-V bytes with a `main` entry point.
///
/// # Safety
/// The device and layout must be valid.
pub unsafe fn create_compute_pipeline(
    device: &ash::Device,
    layout: &VkPipelineLayout,
    code: &[u8],
) -> Result<VkComputePipeline> {
    let shader_module = shader_module(device, code, "compute")?;

    let stage_info = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(shader_module)
        .name(c"main");

    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage_info)
        .layout(layout.raw);

    let pipelines = device
        .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        .map_err(|(_pipelines, e)| VkError::PipelineCreation(e.to_string()));

    device.destroy_shader_module(shader_module, None);

    let raw = pipelines?
        .into_iter()
        .next()
        .ok_or_else(|| VkError::PipelineCreation("no pipeline returned".to_string()))?;
    Ok(VkComputePipeline { raw })
}

/// Depth state for a pipeline. Without a depth attachment or compare op the
/// depth test and writes are off.
pub fn depth_stencil_state(
    has_depth: bool,
    depth_test: Option<CompareOp>,
) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
    let enabled = has_depth && depth_test.is_some();
    vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(enabled)
        .depth_write_enable(enabled)
        .depth_compare_op(depth_test.map_or(vk::CompareOp::ALWAYS, compare_op))
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false)
}

/// Create a graphics pipeline with `main` entry points, no vertex input and
/// dynamic viewport and scissor.
///
/// # Safety
/// The device, render pass and layout must be valid.
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    render_pass: &VkRenderPass,
    layout: &VkPipelineLayout,
    vertex_code: &[u8],
    fragment_code: &[u8],
    depth_test: Option<CompareOp>,
) -> Result<VkGraphicsPipeline> {
    let vert_module = shader_module(device, vertex_code, "vertex")?;
    let frag_module = match shader_module(device, fragment_code, "fragment") {
        Ok(module) => module,
        Err(error) => {
            device.destroy_shader_module(vert_module, None);
            return Err(error);
        }
    };

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module)
            .name(c"main"),
    ];

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false)
        .line_width(1.0);
    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .sample_shading_enable(false);
    let depth_stencil = depth_stencil_state(render_pass.depth_stencil.is_some(), depth_test);

    let color_blend_attachments: Vec<_> = render_pass
        .color
        .iter()
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        })
        .collect();
    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout.raw)
        .render_pass(render_pass.raw)
        .subpass(0);

    let pipelines = device
        .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        .map_err(|(_pipelines, e)| VkError::PipelineCreation(e.to_string()));

    device.destroy_shader_module(vert_module, None);
    device.destroy_shader_module(frag_module, None);

    let raw = pipelines?
        .into_iter()
        .next()
        .ok_or_else(|| VkError::PipelineCreation("no pipeline returned".to_string()))?;
    Ok(VkGraphicsPipeline { raw })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_spirv_bytes() {
        assert!(matches!(
            spirv_words(b"not spirv"),
            Err(VkError::ShaderModule(_))
        ));
        assert!(matches!(
            spirv_words(&[0u8; 8]),
            Err(VkError::ShaderModule(_))
        ));
    }

    #[test]
    fn decodes_little_endian_words() {
        let mut code = 0x0723_0203u32.to_le_bytes().to_vec();
        code.extend_from_slice(&0x0001_0600u32.to_le_bytes());
        let words = spirv_words(&code).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0600]);
    }

    #[test]
    fn depth_writes_need_an_attachment_and_a_compare_op() {
        let tested = depth_stencil_state(true, Some(CompareOp::Greater));
        assert_eq!(tested.depth_test_enable, vk::TRUE);
        assert_eq!(tested.depth_write_enable, vk::TRUE);
        assert_eq!(tested.depth_compare_op, vk::CompareOp::GREATER);

        assert_eq!(depth_stencil_state(true, None).depth_test_enable, vk::FALSE);
        assert_eq!(
            depth_stencil_state(false, Some(CompareOp::Less)).depth_test_enable,
            vk::FALSE
        );
    }
}

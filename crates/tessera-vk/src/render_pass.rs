//! Single-subpass render passes and the frame buffers bound to them.

use crate::error::{Result, VkError};
use crate::format::{
    color_format, color_load_op, color_store, depth_stencil_format, depth_stencil_load_op,
    depth_stencil_store,
};
use crate::resource::VkTargetImage;
use ash::vk;
use tessera_core::{ClearValues, ColorAttachmentDesc, DepthStencilAttachmentDesc};
use tessera_hal::{FrameBuffer, RenderPass};

/// A render pass with one subpass writing every attachment.
#[derive(Debug)]
pub struct VkRenderPass {
    pub(crate) raw: vk::RenderPass,
    pub(crate) color: Vec<ColorAttachmentDesc>,
    pub(crate) depth_stencil: Option<DepthStencilAttachmentDesc>,
}

impl VkRenderPass {
    pub fn raw(&self) -> vk::RenderPass {
        self.raw
    }
}

impl RenderPass for VkRenderPass {
    fn color_attachments(&self) -> &[ColorAttachmentDesc] {
        &self.color
    }

    fn depth_stencil_attachment(&self) -> Option<&DepthStencilAttachmentDesc> {
        self.depth_stencil.as_ref()
    }
}

#[derive(Debug)]
pub struct VkFrameBuffer {
    pub(crate) raw: vk::Framebuffer,
    pub(crate) width: u32,
    pub(crate) height: u32,
}

impl VkFrameBuffer {
    pub fn raw(&self) -> vk::Framebuffer {
        self.raw
    }
}

impl FrameBuffer for VkFrameBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

/// Attachment descriptions in frame buffer order: colors first, then the
/// depth-stencil attachment.
///
/// Every attachment starts undefined. The final layout follows the store op.
pub fn attachment_descriptions(
    color: &[ColorAttachmentDesc],
    depth_stencil: Option<&DepthStencilAttachmentDesc>,
) -> Vec<vk::AttachmentDescription> {
    let colors = color.iter().map(|attachment| {
        let (store_op, final_layout) = color_store(attachment.store);
        vk::AttachmentDescription::default()
            .format(color_format(attachment.format))
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(color_load_op(attachment.load))
            .store_op(store_op)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(final_layout)
    });
    let depth = depth_stencil.map(|attachment| {
        let load_op = depth_stencil_load_op(attachment.load);
        let (store_op, final_layout) = depth_stencil_store(attachment.store);
        let (stencil_load_op, stencil_store_op) = if attachment.format.has_stencil() {
            (load_op, store_op)
        } else {
            (vk::AttachmentLoadOp::DONT_CARE, vk::AttachmentStoreOp::DONT_CARE)
        };
        vk::AttachmentDescription::default()
            .format(depth_stencil_format(attachment.format))
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(load_op)
            .store_op(store_op)
            .stencil_load_op(stencil_load_op)
            .stencil_store_op(stencil_store_op)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(final_layout)
    });
    colors.chain(depth).collect()
}

/// External dependencies around the subpass. Earlier sampling and compute
/// writes finish before attachments are written, and attachment writes are
/// visible to later fragment and compute reads.
fn external_dependencies() -> [vk::SubpassDependency; 2] {
    let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let attachment_writes =
        vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    let shader_stages =
        vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER;
    [
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(attachment_stages | shader_stages)
            .src_access_mask(attachment_writes)
            .dst_stage_mask(attachment_stages)
            .dst_access_mask(
                attachment_writes
                    | vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            ),
        vk::SubpassDependency::default()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(attachment_stages)
            .src_access_mask(attachment_writes)
            .dst_stage_mask(shader_stages)
            .dst_access_mask(vk::AccessFlags::SHADER_READ),
    ]
}

/// Create a single-subpass render pass.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_render_pass(
    device: &ash::Device,
    color: &[ColorAttachmentDesc],
    depth_stencil: Option<DepthStencilAttachmentDesc>,
) -> Result<VkRenderPass> {
    if color.is_empty() && depth_stencil.is_none() {
        return Err(VkError::InvalidState(
            "render pass without attachments".to_string(),
        ));
    }
    let attachments = attachment_descriptions(color, depth_stencil.as_ref());
    let color_refs: Vec<vk::AttachmentReference> = (0u32..)
        .take(color.len())
        .map(|attachment| vk::AttachmentReference {
            attachment,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        })
        .collect();
    let depth_ref = vk::AttachmentReference {
        attachment: color.len() as u32,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if depth_stencil.is_some() {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }
    let dependencies = external_dependencies();
    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(&dependencies);
    let raw = device.create_render_pass(&info, None)?;
    Ok(VkRenderPass {
        raw,
        color: color.to_vec(),
        depth_stencil,
    })
}

/// Create a frame buffer over already validated attachments.
///
/// # Safety
/// The device, render pass and image views must be valid.
pub unsafe fn create_frame_buffer(
    device: &ash::Device,
    render_pass: &VkRenderPass,
    width: u32,
    height: u32,
    color: &[&VkTargetImage],
    depth_stencil: Option<&VkTargetImage>,
) -> Result<VkFrameBuffer> {
    let views: Vec<vk::ImageView> = color
        .iter()
        .copied()
        .chain(depth_stencil)
        .map(VkTargetImage::view)
        .collect();
    let info = vk::FramebufferCreateInfo::default()
        .render_pass(render_pass.raw)
        .attachments(&views)
        .width(width)
        .height(height)
        .layers(1);
    let raw = device.create_framebuffer(&info, None)?;
    Ok(VkFrameBuffer { raw, width, height })
}

/// Native clear values in attachment order. Attachments that do not clear
/// get zeroes, which the driver ignores.
pub fn clear_values(render_pass: &VkRenderPass, values: &ClearValues<'_>) -> Vec<vk::ClearValue> {
    let colors = (0..render_pass.color.len()).map(|index| vk::ClearValue {
        color: vk::ClearColorValue {
            float32: values.colors.get(index).copied().unwrap_or_default(),
        },
    });
    let depth = render_pass.depth_stencil.map(|_| vk::ClearValue {
        depth_stencil: vk::ClearDepthStencilValue {
            depth: values.depth.unwrap_or_default(),
            stencil: values.stencil.map_or(0, u32::from),
        },
    });
    colors.chain(depth).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{
        ColorAttachmentImageFormat, ColorLoadOp, ColorStoreOp, DepthStencilAttachmentImageFormat,
        DepthStencilLoadOp, DepthStencilStoreOp,
    };

    fn depth(format: DepthStencilAttachmentImageFormat) -> DepthStencilAttachmentDesc {
        DepthStencilAttachmentDesc {
            format,
            load: DepthStencilLoadOp::Clear,
            store: DepthStencilStoreOp::DontCare,
        }
    }

    #[test]
    fn attachments_follow_frame_buffer_order() {
        let color = [ColorAttachmentDesc {
            format: ColorAttachmentImageFormat::B8G8R8A8Unorm,
            load: ColorLoadOp::Clear,
            store: ColorStoreOp::FlushForPresent,
        }];
        let depth = depth(DepthStencilAttachmentImageFormat::D32Sfloat);
        let descriptions = attachment_descriptions(&color, Some(&depth));
        assert_eq!(descriptions.len(), 2);
        assert_eq!(descriptions[0].format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(descriptions[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(descriptions[1].format, vk::Format::D32_SFLOAT);
        assert_eq!(descriptions[1].load_op, vk::AttachmentLoadOp::CLEAR);
        assert!(descriptions
            .iter()
            .all(|d| d.initial_layout == vk::ImageLayout::UNDEFINED));
    }

    #[test]
    fn stencil_ops_apply_only_with_a_stencil_aspect() {
        let depth_only = attachment_descriptions(&[], Some(&depth(DepthStencilAttachmentImageFormat::D32Sfloat)));
        assert_eq!(depth_only[0].stencil_load_op, vk::AttachmentLoadOp::DONT_CARE);
        let with_stencil =
            attachment_descriptions(&[], Some(&depth(DepthStencilAttachmentImageFormat::D24UnormS8Uint)));
        assert_eq!(with_stencil[0].stencil_load_op, vk::AttachmentLoadOp::CLEAR);
    }

    #[test]
    fn clear_values_cover_every_attachment() {
        let render_pass = VkRenderPass {
            raw: vk::RenderPass::null(),
            color: vec![
                ColorAttachmentDesc {
                    format: ColorAttachmentImageFormat::R8G8B8A8Unorm,
                    load: ColorLoadOp::Clear,
                    store: ColorStoreOp::FlushForSampledImage,
                };
                2
            ],
            depth_stencil: Some(depth(DepthStencilAttachmentImageFormat::D32SfloatS8Uint)),
        };
        let values = clear_values(
            &render_pass,
            &ClearValues {
                colors: &[[0.25, 0.5, 0.75, 1.0]],
                depth: Some(1.0),
                stencil: Some(7),
            },
        );
        assert_eq!(values.len(), 3);
        // SAFETY: each value was written through the union member read back here.
        unsafe {
            assert_eq!(values[0].color.float32, [0.25, 0.5, 0.75, 1.0]);
            assert_eq!(values[1].color.float32, [0.0; 4]);
            assert_eq!(values[2].depth_stencil.depth, 1.0);
            assert_eq!(values[2].depth_stencil.stencil, 7);
        }
    }
}

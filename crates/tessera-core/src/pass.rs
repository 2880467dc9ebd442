//! Render pass attachment descriptions.

use crate::format::{ColorAttachmentImageFormat, DepthStencilAttachmentImageFormat};

/// What a render pass does with a color attachment's previous contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorLoadOp {
    DontCare,
    Clear,
}

/// Where a color attachment's contents go after the render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorStoreOp {
    DontCare,
    /// Keep the contents and make them readable by later sampling.
    FlushForSampledImage,
    /// Keep the contents and hand them to presentation.
    FlushForPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthStencilLoadOp {
    DontCare,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthStencilStoreOp {
    DontCare,
    FlushForSampledImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorAttachmentDesc {
    pub format: ColorAttachmentImageFormat,
    pub load: ColorLoadOp,
    pub store: ColorStoreOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilAttachmentDesc {
    pub format: DepthStencilAttachmentImageFormat,
    pub load: DepthStencilLoadOp,
    pub store: DepthStencilStoreOp,
}

/// Clear values given when a render pass begins.
///
/// One color per color attachment. Values for attachments that are not
/// cleared are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearValues<'a> {
    pub colors: &'a [[f32; 4]],
    pub depth: Option<f32>,
    pub stencil: Option<u8>,
}

impl ClearValues<'_> {
    /// Assert that a clear value exists for every attachment that clears.
    pub fn debug_validate(
        &self,
        color_attachments: &[ColorAttachmentDesc],
        depth_stencil_attachment: Option<&DepthStencilAttachmentDesc>,
    ) {
        for (index, attachment) in color_attachments.iter().enumerate() {
            debug_assert!(
                attachment.load != ColorLoadOp::Clear || index < self.colors.len(),
                "color attachment {index} clears without a clear color"
            );
        }
        if let Some(attachment) = depth_stencil_attachment {
            if attachment.load == DepthStencilLoadOp::Clear {
                debug_assert!(self.depth.is_some(), "depth attachment clears without a clear depth");
                debug_assert!(
                    !attachment.format.has_stencil() || self.stencil.is_some(),
                    "stencil attachment clears without a clear stencil"
                );
            }
        }
    }
}

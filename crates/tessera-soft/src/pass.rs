//! Render passes, frame buffers and graphics pipelines.
//!
//! Draws are recorded and validated but not rasterized. Clears requested by
//! render pass load ops are applied to the attachment texels.

use crate::resource::TargetImageInner;
use std::fmt;
use std::sync::Arc;
use tessera_core::{ColorAttachmentDesc, CompareOp, DepthStencilAttachmentDesc};
use tessera_hal::{FrameBuffer, RenderPass};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftRenderPass {
    pub(crate) color: Vec<ColorAttachmentDesc>,
    pub(crate) depth_stencil: Option<DepthStencilAttachmentDesc>,
}

impl SoftRenderPass {
    /// Whether a frame buffer or pipeline made for `other` can be used with
    /// this render pass. Only attachment formats matter.
    pub(crate) fn is_compatible(&self, other: &Self) -> bool {
        self.color.len() == other.color.len()
            && self
                .color
                .iter()
                .zip(&other.color)
                .all(|(a, b)| a.format == b.format)
            && self.depth_stencil.map(|d| d.format) == other.depth_stencil.map(|d| d.format)
    }
}

impl RenderPass for SoftRenderPass {
    fn color_attachments(&self) -> &[ColorAttachmentDesc] {
        &self.color
    }

    fn depth_stencil_attachment(&self) -> Option<&DepthStencilAttachmentDesc> {
        self.depth_stencil.as_ref()
    }
}

pub struct SoftFrameBuffer {
    pub(crate) render_pass: SoftRenderPass,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) color: Vec<Arc<TargetImageInner>>,
    pub(crate) depth_stencil: Option<Arc<TargetImageInner>>,
}

impl fmt::Debug for SoftFrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftFrameBuffer")
            .field("extent", &(self.width, self.height))
            .field("color", &self.color.iter().map(|i| i.id).collect::<Vec<_>>())
            .field("depth_stencil", &self.depth_stencil.as_ref().map(|i| i.id))
            .finish()
    }
}

impl FrameBuffer for SoftFrameBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

#[derive(Debug, Clone)]
pub struct SoftGraphicsPipeline {
    pub(crate) name: String,
    pub(crate) render_pass: SoftRenderPass,
    pub(crate) set_count: usize,
    pub(crate) depth_test: Option<CompareOp>,
}

impl SoftGraphicsPipeline {
    pub fn depth_test(&self) -> Option<CompareOp> {
        self.depth_test
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{ColorAttachmentImageFormat, ColorLoadOp, ColorStoreOp};

    fn color(format: ColorAttachmentImageFormat, load: ColorLoadOp) -> ColorAttachmentDesc {
        ColorAttachmentDesc {
            format,
            load,
            store: ColorStoreOp::FlushForSampledImage,
        }
    }

    #[test]
    fn compatibility_ignores_load_and_store_ops() {
        let clear = SoftRenderPass {
            color: vec![color(ColorAttachmentImageFormat::R8G8B8A8Unorm, ColorLoadOp::Clear)],
            depth_stencil: None,
        };
        let keep = SoftRenderPass {
            color: vec![color(ColorAttachmentImageFormat::R8G8B8A8Unorm, ColorLoadOp::DontCare)],
            depth_stencil: None,
        };
        let other_format = SoftRenderPass {
            color: vec![color(ColorAttachmentImageFormat::B8G8R8A8Unorm, ColorLoadOp::Clear)],
            depth_stencil: None,
        };
        assert!(clear.is_compatible(&keep));
        assert!(!clear.is_compatible(&other_format));
        assert!(!clear.is_compatible(&SoftRenderPass {
            color: Vec::new(),
            depth_stencil: None
        }));
    }
}

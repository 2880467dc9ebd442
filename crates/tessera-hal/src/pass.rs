//! Render pass and frame buffer traits.

use crate::resource::{Resource, TargetImage};
use std::fmt;
use tessera_core::{
    Capabilities, ColorAttachmentDesc, DepthStencilAttachmentDesc, Error, Result, TargetImageKind,
};

/// The attachment layout a render pass was created with.
pub trait RenderPass: fmt::Debug {
    fn color_attachments(&self) -> &[ColorAttachmentDesc];

    fn depth_stencil_attachment(&self) -> Option<&DepthStencilAttachmentDesc>;
}

/// Attachments bound to one render pass layout.
pub trait FrameBuffer: fmt::Debug {
    fn width(&self) -> u32;

    fn height(&self) -> u32;
}

/// Check that `color` and `depth_stencil` fit the attachments of `render_pass`
/// and cover a `width` x `height` frame buffer.
pub fn validate_frame_buffer<P, I>(
    render_pass: &P,
    width: u32,
    height: u32,
    color: &[&I],
    depth_stencil: Option<&I>,
) -> Result<()>
where
    P: RenderPass + ?Sized,
    I: TargetImage,
{
    if width == 0 || height == 0 {
        return Err(Error::InvalidState(format!("{width}x{height} frame buffer")));
    }
    let expected = render_pass.color_attachments();
    if color.len() != expected.len() {
        return Err(Error::InvalidState(format!(
            "{} color images for a render pass with {} color attachments",
            color.len(),
            expected.len()
        )));
    }
    for (image, attachment) in color.iter().zip(expected) {
        if image.kind() != TargetImageKind::ColorAttachment(attachment.format) {
            return Err(Error::InvalidState(format!(
                "{image:?} does not match the {:?} attachment",
                attachment.format
            )));
        }
        check_attachment(*image, width, height)?;
    }
    match (render_pass.depth_stencil_attachment(), depth_stencil) {
        (None, None) => Ok(()),
        (Some(attachment), Some(image)) => {
            if image.kind() != TargetImageKind::DepthStencilAttachment(attachment.format) {
                return Err(Error::InvalidState(format!(
                    "{image:?} does not match the {:?} attachment",
                    attachment.format
                )));
            }
            check_attachment(image, width, height)
        }
        (expected, given) => Err(Error::InvalidState(format!(
            "render pass depth-stencil attachment {expected:?} given {given:?}"
        ))),
    }
}

fn check_attachment<I: TargetImage>(image: &I, width: u32, height: u32) -> Result<()> {
    if !image.capabilities().contains(Capabilities::ATTACHMENT) {
        return Err(Error::InvalidState(format!("{image:?} is not an attachment")));
    }
    if image.width() < width || image.height() < height {
        return Err(Error::InvalidState(format!(
            "{image:?} is smaller than the {width}x{height} frame buffer"
        )));
    }
    Ok(())
}

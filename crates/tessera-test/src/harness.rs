//! Headless device harness.
//!
//! Owns one device with both logical queues, a fence and the scenario kernels,
//! and wraps the submission patterns the scenarios repeat.

use std::mem::ManuallyDrop;

use tessera_core::DeviceCapabilities;
use tessera_hal::{Device, GraphicsQueue, QueueTopology, UploadQueue};
use tracing::{info, warn};

use crate::backend::{ScenarioBackend, ShaderSet};
use crate::{HarnessConfig, Result};

/// A headless device for end-to-end tests.
pub struct Harness<A: ScenarioBackend> {
    device: ManuallyDrop<A::Device>,
    graphics: ManuallyDrop<A::GraphicsQueue>,
    upload: ManuallyDrop<A::UploadQueue>,
    fence: ManuallyDrop<A::Fence>,
    shaders: ShaderSet,
}

impl<A: ScenarioBackend> Harness<A> {
    /// Create a device, its queues and an unsignaled fence, and load the
    /// scenario kernels.
    pub fn new(config: HarnessConfig) -> Result<Self> {
        let device = A::create_device(config)?;
        let parts = (|| -> Result<_> {
            let shaders = A::load_shaders(&device)?;
            let graphics = device.create_graphics_queue()?;
            let upload = device.create_upload_queue()?;
            let fence = device.create_fence(false)?;
            Ok((shaders, graphics, upload, fence))
        })();
        let (shaders, graphics, upload, fence) = match parts {
            Ok(parts) => parts,
            Err(error) => {
                A::destroy_device(device);
                return Err(error);
            }
        };

        info!(
            backend = A::NAME,
            device = %device.capabilities().device_name,
            topology = ?device.topology(),
            "Created test harness"
        );
        Ok(Self {
            device: ManuallyDrop::new(device),
            graphics: ManuallyDrop::new(graphics),
            upload: ManuallyDrop::new(upload),
            fence: ManuallyDrop::new(fence),
            shaders,
        })
    }

    pub fn device(&self) -> &A::Device {
        &self.device
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.device.capabilities()
    }

    pub fn topology(&self) -> QueueTopology {
        self.device.topology()
    }

    pub fn shaders(&self) -> &ShaderSet {
        &self.shaders
    }

    /// Submit `upload` alone and block until it completes.
    pub fn submit_upload_and_wait(&self, upload: &A::UploadCommandBuffer) -> Result<()> {
        self.upload.submit_with_fence(upload, &self.fence)?;
        self.wait_and_reset()
    }

    /// Submit a release/acquire pair and block until the graphics side completes.
    pub fn submit_pair_and_wait(
        &self,
        upload: &A::UploadCommandBuffer,
        graphics: &A::GraphicsCommandBuffer,
    ) -> Result<()> {
        self.upload.submit_and_signal(upload)?;
        self.graphics
            .wait_and_submit(Some(upload), graphics, &self.fence)?;
        self.wait_and_reset()
    }

    /// Submit graphics work with no upload dependency and block until it completes.
    pub fn submit_graphics_and_wait(&self, graphics: &A::GraphicsCommandBuffer) -> Result<()> {
        self.graphics.wait_and_submit(None, graphics, &self.fence)?;
        self.wait_and_reset()
    }

    fn wait_and_reset(&self) -> Result<()> {
        self.device.wait_for_fence(&self.fence)?;
        self.device.reset_fence(&self.fence)?;
        Ok(())
    }
}

impl<A: ScenarioBackend> Drop for Harness<A> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!("Leaking test harness device after a panic");
            return;
        }
        // SAFETY: every field is taken exactly once and never used again.
        let (device, graphics, upload, fence) = unsafe {
            (
                ManuallyDrop::take(&mut self.device),
                ManuallyDrop::take(&mut self.graphics),
                ManuallyDrop::take(&mut self.upload),
                ManuallyDrop::take(&mut self.fence),
            )
        };
        device.destroy_fence(fence);
        device.destroy_upload_queue(upload);
        device.destroy_graphics_queue(graphics);
        A::destroy_device(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_soft::SoftApi;
    use tessera_vk::VkApi;

    #[test]
    fn software_harness_follows_requested_topology() {
        let dedicated = Harness::<SoftApi>::new(HarnessConfig::default()).unwrap();
        assert!(dedicated.topology().is_dedicated());
        assert!(dedicated.capabilities().ray_tracing);

        let unified =
            Harness::<SoftApi>::new(HarnessConfig::default().unified().ray_tracing(false)).unwrap();
        assert!(!unified.topology().is_dedicated());
        assert!(!unified.capabilities().ray_tracing);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn vulkan_harness_creation() {
        let _harness = Harness::<VkApi>::new(HarnessConfig::default()).unwrap();
    }
}

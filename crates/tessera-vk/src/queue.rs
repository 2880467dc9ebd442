//! Graphics and upload queues.
//!
//! Both queues submit under one lock, since the upload queue aliases the
//! graphics queue on devices without a distinct upload family.

use crate::command::{VkGraphicsCommandBuffer, VkUploadCommandBuffer};
use crate::device::DeviceShared;
use crate::error::Result;
use crate::sync::VkFence;
use crate::VkApi;
use ash::vk;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tessera_hal::{GraphicsCommandBuffer, GraphicsQueue, TransferLedger, UploadCommandBuffer, UploadQueue};
use tracing::debug;

/// Submit one command buffer with optional semaphore wait and signal.
fn submit(
    shared: &DeviceShared,
    queue: vk::Queue,
    command_buffer: vk::CommandBuffer,
    wait: Option<vk::Semaphore>,
    signal: Option<vk::Semaphore>,
    fence: vk::Fence,
) -> Result<()> {
    let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer)];
    let semaphore_info = |semaphore| {
        vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
    };
    let waits: Vec<_> = wait.into_iter().map(semaphore_info).collect();
    let signals: Vec<_> = signal.into_iter().map(semaphore_info).collect();
    let submit_info = vk::SubmitInfo2::default()
        .wait_semaphore_infos(&waits)
        .command_buffer_infos(&command_buffers)
        .signal_semaphore_infos(&signals);

    let _guard = shared.submit_lock.lock();
    unsafe {
        shared
            .device
            .queue_submit2(queue, std::slice::from_ref(&submit_info), fence)?;
    }
    Ok(())
}

/// The graphics and compute queue.
pub struct VkGraphicsQueue {
    shared: Arc<DeviceShared>,
}

impl VkGraphicsQueue {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Self {
        Self { shared }
    }

    pub fn raw(&self) -> vk::Queue {
        self.shared.graphics_queue
    }
}

impl fmt::Debug for VkGraphicsQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VkGraphicsQueue")
            .field("family", &self.shared.topology.graphics_family())
            .finish()
    }
}

impl GraphicsQueue<VkApi> for VkGraphicsQueue {
    fn wait_and_submit(
        &self,
        upload: Option<&VkUploadCommandBuffer>,
        graphics: &VkGraphicsCommandBuffer,
        fence: &VkFence,
    ) -> tessera_core::Result<()> {
        graphics.debug_check_executable();
        let wait = match upload {
            Some(upload) => {
                TransferLedger::assert_matches(upload.released(), graphics.acquired());
                let was_pending = upload.semaphore_pending.swap(false, Ordering::AcqRel);
                debug_assert!(
                    was_pending,
                    "graphics submission waits on an upload that was not submitted with a signal"
                );
                Some(upload.semaphore)
            }
            None => {
                debug_assert!(
                    graphics.acquired().is_empty(),
                    "assets acquired without a paired upload submission"
                );
                None
            }
        };
        submit(
            &self.shared,
            self.shared.graphics_queue,
            graphics.raw(),
            wait,
            None,
            fence.raw,
        )?;
        debug!(waits_on_upload = wait.is_some(), "submitted graphics command buffer");
        Ok(())
    }
}

/// The upload queue. May alias the graphics queue.
pub struct VkUploadQueue {
    shared: Arc<DeviceShared>,
}

impl VkUploadQueue {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Self {
        Self { shared }
    }

    pub fn raw(&self) -> vk::Queue {
        self.shared.upload_queue
    }
}

impl fmt::Debug for VkUploadQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VkUploadQueue")
            .field("family", &self.shared.topology.upload_family())
            .field("dedicated", &self.shared.topology.is_dedicated())
            .finish()
    }
}

impl UploadQueue<VkApi> for VkUploadQueue {
    fn submit_and_signal(&self, upload: &VkUploadCommandBuffer) -> tessera_core::Result<()> {
        upload.debug_check_executable();
        let was_pending = upload.semaphore_pending.swap(true, Ordering::AcqRel);
        debug_assert!(
            !was_pending,
            "upload semaphore signaled twice without a graphics wait"
        );
        if let Err(error) = submit(
            &self.shared,
            self.shared.upload_queue,
            upload.raw(),
            None,
            Some(upload.semaphore),
            vk::Fence::null(),
        ) {
            upload.semaphore_pending.store(false, Ordering::Release);
            return Err(error.into());
        }
        debug!(released = upload.released().len(), "submitted upload command buffer");
        Ok(())
    }

    fn submit_with_fence(
        &self,
        upload: &VkUploadCommandBuffer,
        fence: &VkFence,
    ) -> tessera_core::Result<()> {
        upload.debug_check_executable();
        submit(
            &self.shared,
            self.shared.upload_queue,
            upload.raw(),
            None,
            None,
            fence.raw,
        )?;
        debug!("submitted upload command buffer with fence");
        Ok(())
    }
}

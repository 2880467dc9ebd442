//! Queue traits.

use crate::Api;
use std::fmt;
use tessera_core::Result;

/// The graphics and compute queue.
pub trait GraphicsQueue<A: Api>: fmt::Debug {
    /// Submit `graphics`, signaling `fence` on completion.
    ///
    /// When `upload` is given the submission waits on the completion semaphore
    /// that [`UploadQueue::submit_and_signal`] signaled for it, and the assets
    /// acquired by `graphics` must equal the assets released by `upload`.
    fn wait_and_submit(
        &self,
        upload: Option<&A::UploadCommandBuffer>,
        graphics: &A::GraphicsCommandBuffer,
        fence: &A::Fence,
    ) -> Result<()>;
}

/// The upload queue. May alias the graphics queue.
pub trait UploadQueue<A: Api>: fmt::Debug {
    /// Submit `upload` and signal its completion semaphore for a later
    /// [`GraphicsQueue::wait_and_submit`].
    fn submit_and_signal(&self, upload: &A::UploadCommandBuffer) -> Result<()>;

    /// Submit `upload` and signal `fence` on completion. Used when the host must
    /// observe results, such as compacted sizes, before continuing.
    fn submit_with_fence(&self, upload: &A::UploadCommandBuffer, fence: &A::Fence) -> Result<()>;
}

//! Test harness for the Tessera graphics abstraction layer.
//!
//! Provides a headless device harness and end-to-end scenarios that run
//! unchanged on every backend.

pub mod backend;
pub mod harness;
pub mod scenarios;

pub use backend::{ScenarioBackend, ShaderSet, SPIRV_DIR_ENV};
pub use harness::Harness;
pub use scenarios::{
    asset_upload_readback, cleared_attachment_readback, compacted_triangle_probe, ClearReport,
    ProbeHit, ProbeReport, UploadReport,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("Backend error: {0}")]
    Backend(#[from] tessera_core::Error),
    #[error("Scenario failed: {0}")]
    Mismatch(String),
    #[error("Missing shader: {0}")]
    MissingShader(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Device configuration for a scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Request ray tracing support.
    pub ray_tracing: bool,
    /// Prefer a distinct upload queue family when the adapter has one.
    pub dedicated_upload_queue: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            ray_tracing: true,
            dedicated_upload_queue: true,
        }
    }
}

impl HarnessConfig {
    /// Both logical queues on one family.
    #[must_use]
    pub const fn unified(mut self) -> Self {
        self.dedicated_upload_queue = false;
        self
    }

    #[must_use]
    pub const fn ray_tracing(mut self, enabled: bool) -> Self {
        self.ray_tracing = enabled;
        self
    }
}

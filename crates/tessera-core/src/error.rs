//! Error types shared by every backend.

use thiserror::Error;

/// Backend-neutral error type.
///
/// Caller-contract violations are not represented here; they are asserted in
/// debug builds. This type carries driver and allocation failures only.
#[derive(Error, Debug)]
pub enum Error {
    /// Failure reported by the native driver.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Device or host memory exhausted.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The backend could not be loaded.
    #[error("Failed to load backend: {0}")]
    Loading(String),

    /// No adapter satisfies the requested capabilities.
    #[error("No suitable device found")]
    NoSuitableDevice,

    /// The device does not support a requested capability.
    #[error("Unsupported capability: {0}")]
    Unsupported(String),

    /// Shader bytecode was rejected.
    #[error("Invalid shader: {0}")]
    InvalidShader(String),

    /// An object was used in a state that does not allow the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

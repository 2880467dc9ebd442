//! Vulkan error types.

use ash::vk;
use thiserror::Error;

/// Vulkan backend errors.
#[derive(Error, Debug)]
pub enum VkError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Shader module creation failed.
    #[error("Shader module creation failed: {0}")]
    ShaderModule(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, VkError>;

impl From<gpu_allocator::AllocationError> for VkError {
    fn from(error: gpu_allocator::AllocationError) -> Self {
        Self::AllocationFailed(error.to_string())
    }
}

impl From<VkError> for tessera_core::Error {
    fn from(error: VkError) -> Self {
        use tessera_core::Error;
        match error {
            VkError::Vulkan(
                result @ (vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                | vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            ) => Error::OutOfMemory(result.to_string()),
            VkError::Vulkan(result) => Error::Backend(result.to_string()),
            VkError::Loading(message) => Error::Loading(message),
            VkError::NoSuitableDevice => Error::NoSuitableDevice,
            VkError::ExtensionNotSupported(name) => Error::Unsupported(name),
            VkError::AllocationFailed(message) => Error::OutOfMemory(message),
            VkError::ShaderModule(message) => Error::InvalidShader(message),
            VkError::PipelineCreation(message) => Error::Backend(message),
            VkError::InvalidState(message) => Error::InvalidState(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Error;

    #[test]
    fn memory_exhaustion_maps_to_out_of_memory() {
        let error: Error = VkError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).into();
        assert!(matches!(error, Error::OutOfMemory(_)));
        let error: Error = VkError::AllocationFailed("pool exhausted".into()).into();
        assert!(matches!(error, Error::OutOfMemory(_)));
    }

    #[test]
    fn driver_failures_map_to_backend_errors() {
        let error: Error = VkError::Vulkan(vk::Result::ERROR_DEVICE_LOST).into();
        assert!(matches!(error, Error::Backend(_)));
        let error: Error = VkError::ShaderModule("bad magic".into()).into();
        assert!(matches!(error, Error::InvalidShader(_)));
    }
}

//! RHI-specific error types.

use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// The presentation surface is lost or out of date; no backbuffer
    /// can be acquired until it is recreated.
    #[error("Swapchain unavailable")]
    SwapchainUnavailable,

    /// The device was lost
    #[error("Device lost")]
    DeviceLost,

    /// A resource allocation failed
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Unknown or already destroyed handle
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Operation not permitted in the object's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl RhiError {
    /// Returns true for device-level failures that end the current frame
    /// and require the device to be recreated.
    pub fn is_fatal(&self) -> bool {
        match self {
            RhiError::VulkanError(result) => matches!(
                *result,
                ash::vk::Result::ERROR_DEVICE_LOST
                    | ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY
                    | ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                    | ash::vk::Result::ERROR_SURFACE_LOST_KHR
            ),
            RhiError::LoadingError(_)
            | RhiError::AllocatorError(_)
            | RhiError::NoSuitableGpu
            | RhiError::DeviceLost
            | RhiError::OutOfMemory(_)
            | RhiError::SurfaceError(_) => true,
            // Recreating the swapchain on a later acquire recovers.
            RhiError::SwapchainUnavailable
            | RhiError::InvalidHandle(_)
            | RhiError::InvalidState(_) => false,
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_errors_are_fatal() {
        assert!(RhiError::DeviceLost.is_fatal());
        assert!(RhiError::OutOfMemory("staging".to_string()).is_fatal());
        assert!(RhiError::VulkanError(ash::vk::Result::ERROR_DEVICE_LOST).is_fatal());
    }

    #[test]
    fn test_usage_errors_are_not_fatal() {
        assert!(!RhiError::InvalidHandle("buffer#3".to_string()).is_fatal());
        assert!(!RhiError::InvalidState("mapped".to_string()).is_fatal());
        assert!(!RhiError::VulkanError(ash::vk::Result::NOT_READY).is_fatal());
        assert!(!RhiError::SwapchainUnavailable.is_fatal());
    }
}

//! Error types for the frame pipeline.

use stagehand_rhi::{BufferId, RhiError};
use thiserror::Error;

use crate::staging::StagingState;

/// Errors raised while producing a frame.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Device-level failure
    #[error("RHI error: {0}")]
    Rhi(RhiError),

    /// The presentation surface cannot hand out a backbuffer right now
    #[error("Swapchain unavailable")]
    SwapchainUnavailable,

    /// A staging request larger than the pool's fixed buffer capacity
    #[error("Staging request of {requested} bytes exceeds buffer capacity of {capacity} bytes")]
    StagingOverflow { requested: u64, capacity: u64 },

    /// A staging buffer used outside the state the operation requires
    #[error("Staging buffer {buffer} is {actual:?}, expected {expected:?}")]
    StagingState {
        buffer: BufferId,
        actual: Option<StagingState>,
        expected: StagingState,
    },

    /// Copy size or offset not a multiple of the copy alignment
    #[error("Misaligned copy: {0}")]
    Misaligned(String),

    /// Render pass opened twice, closed without being open, or left open
    #[error("Render pass error: {0}")]
    RenderPass(String),
}

impl From<RhiError> for FrameError {
    /// A lost surface always surfaces as [`FrameError::SwapchainUnavailable`],
    /// whether acquiring or presenting hit it.
    fn from(err: RhiError) -> Self {
        match err {
            RhiError::SwapchainUnavailable => FrameError::SwapchainUnavailable,
            other => FrameError::Rhi(other),
        }
    }
}

impl FrameError {
    /// Returns true for device-level failures that end the frame loop.
    ///
    /// A missing swapchain is not fatal: the loop stops producing frames
    /// and retries on the next tick.
    pub fn is_fatal(&self) -> bool {
        match self {
            FrameError::Rhi(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Result type alias for frame operations.
pub type FrameResult<T> = std::result::Result<T, FrameError>;

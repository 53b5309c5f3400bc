//! Frame resources and staging pipeline.
//!
//! This crate sits between a [`GpuDevice`](stagehand_rhi::GpuDevice) and
//! rendering techniques:
//! - [`AttachmentCache`]: depth/stencil attachment rebuilt on size change
//! - [`StagingPool`]: recyclable CPU-writable staging buffers
//! - [`Frame`]: resource and render command streams for one frame
//! - [`FrameDriver`]: sequences acquisition, recording, submission and
//!   staging recycling

mod attachment;
mod driver;
mod error;
mod frame;
mod staging;
mod technique;
pub mod uniforms;

pub use attachment::{AttachmentCache, DEFAULT_DEPTH_STENCIL_FORMAT};
pub use driver::FrameDriver;
pub use error::{FrameError, FrameResult};
pub use frame::{
    ClearValues, Frame, FrameEncoders, FrameReport, RENDER_STREAM_LABEL, RESOURCE_STREAM_LABEL,
};
pub use staging::{MapCompletion, StagingAllocation, StagingPool, StagingState, StagingStats};
pub use technique::RenderTechnique;
pub use uniforms::TransformUniform;

//! GPU device abstraction (Render Hardware Interface).
//!
//! Everything above this crate talks to the GPU through the [`GpuDevice`]
//! trait, passed explicitly as a context object. Two implementations ship:
//! - [`VulkanDevice`]: Vulkan 1.3 through `ash`, for real windows
//! - [`HeadlessDevice`]: a deterministic in-memory device with fault
//!   injection, used by tests and tooling
//!
//! Resources are named by opaque ids ([`BufferId`], [`TextureId`], ...)
//! owned by the device that created them.

mod device;
mod error;
mod headless;
pub mod types;
pub mod vulkan;

pub use device::{CopyEndpoint, GpuDevice, validate_copy};
pub use error::{RhiError, RhiResult};
pub use headless::{DeviceEvent, HeadlessDevice};
pub use types::{
    BufferDesc, BufferId, BufferUsage, COPY_BUFFER_ALIGNMENT, CommandBufferId, DepthStencilTarget,
    EncoderId, MapCallback, MapError, MapMode, MapResult, RenderPassDesc, SubmissionIndex,
    TextureDesc, TextureFormat, TextureId, TextureViewId,
};
pub use vulkan::VulkanDevice;

// Re-export ash types that users might need
pub use ash::vk;

//! The graphics-device seam.
//!
//! Everything above this crate talks to the GPU through [`GpuDevice`]. A
//! device is an explicit context object: it is created once at startup,
//! handed to the frame driver, and torn down once at shutdown.

use stagehand_core::FramebufferSize;

use crate::error::{RhiError, RhiResult};
use crate::types::{
    BufferDesc, BufferId, BufferUsage, COPY_BUFFER_ALIGNMENT, CommandBufferId, EncoderId,
    MapCallback, MapMode, RenderPassDesc, SubmissionIndex, TextureDesc, TextureId, TextureViewId,
};

/// A graphics device plus its queue and presentation surface.
///
/// All methods are non-blocking except [`GpuDevice::wait_idle`]. Submission
/// returns immediately; completion is observed through [`GpuDevice::poll`],
/// which is also the only place map callbacks are invoked.
pub trait GpuDevice {
    /// Short backend name for log messages.
    fn backend_name(&self) -> &'static str;

    // Buffers

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> RhiResult<BufferId>;

    fn destroy_buffer(&mut self, buffer: BufferId) -> RhiResult<()>;

    /// Returns the CPU view of a mapped buffer range.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if the buffer is not currently
    /// mapped or the range lies outside it.
    fn mapped_range_mut(&mut self, buffer: BufferId, offset: u64, size: u64)
    -> RhiResult<&mut [u8]>;

    /// Unmaps a mapped buffer so GPU commands may reference it.
    fn unmap_buffer(&mut self, buffer: BufferId) -> RhiResult<()>;

    /// Requests that an unmapped buffer be mapped again.
    ///
    /// The request completes after every submission that used the buffer has
    /// finished. `callback` runs from a later [`GpuDevice::poll`] or
    /// [`GpuDevice::wait_idle`], never from inside this call.
    fn map_buffer_async(
        &mut self,
        buffer: BufferId,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: MapCallback,
    ) -> RhiResult<()>;

    // Textures

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> RhiResult<TextureId>;

    fn create_texture_view(&mut self, texture: TextureId) -> RhiResult<TextureViewId>;

    fn release_texture_view(&mut self, view: TextureViewId) -> RhiResult<()>;

    /// Destroys a texture. Every view onto it must already be released.
    fn destroy_texture(&mut self, texture: TextureId) -> RhiResult<()>;

    // Command recording

    fn create_command_encoder(&mut self, label: &str) -> RhiResult<EncoderId>;

    /// Records a buffer-to-buffer copy.
    ///
    /// Offsets and size must be multiples of [`COPY_BUFFER_ALIGNMENT`]; see
    /// [`validate_copy`].
    fn copy_buffer_to_buffer(
        &mut self,
        encoder: EncoderId,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> RhiResult<()>;

    fn begin_render_pass(&mut self, encoder: EncoderId, desc: &RenderPassDesc) -> RhiResult<()>;

    fn end_render_pass(&mut self, encoder: EncoderId) -> RhiResult<()>;

    /// Finishes recording and turns the encoder into a submittable command
    /// buffer. The encoder id is invalid afterwards.
    fn finish_encoder(&mut self, encoder: EncoderId) -> RhiResult<CommandBufferId>;

    /// Drops an encoder without submitting anything it recorded.
    fn discard_encoder(&mut self, encoder: EncoderId);

    /// Drops a finished command buffer that will never be submitted.
    /// Unknown or already submitted ids are ignored.
    fn discard_command_buffer(&mut self, command_buffer: CommandBufferId);

    // Queue

    /// Submits command buffers in one batch. The device executes them in
    /// slice order. Consumes the command buffers.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if any referenced buffer is still
    /// mapped or has a map pending.
    fn submit(&mut self, command_buffers: &[CommandBufferId]) -> RhiResult<SubmissionIndex>;

    // Presentation surface

    /// Acquires the view of the current presentable image.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SwapchainUnavailable`] while the surface is lost or
    /// has no presentable size.
    fn acquire_backbuffer(&mut self) -> RhiResult<TextureViewId>;

    /// Releases the backbuffer view and hands the image to the presentation
    /// engine.
    fn present_backbuffer(&mut self, view: TextureViewId) -> RhiResult<()>;

    /// Releases the backbuffer view of an abandoned frame.
    fn release_backbuffer(&mut self, view: TextureViewId) -> RhiResult<()>;

    /// Records a new framebuffer size for the surface.
    fn resize_surface(&mut self, size: FramebufferSize) -> RhiResult<()>;

    // Progress

    /// Retires finished submissions and runs ready map callbacks.
    fn poll(&mut self) -> RhiResult<()>;

    /// Blocks until the queue is idle, then behaves like [`GpuDevice::poll`].
    fn wait_idle(&mut self) -> RhiResult<()>;
}

/// Size and usage of one side of a copy, as seen by [`validate_copy`].
#[derive(Clone, Copy, Debug)]
pub struct CopyEndpoint {
    pub size: u64,
    pub usage: BufferUsage,
    pub offset: u64,
}

/// Checks a buffer-to-buffer copy against the alignment and range rules
/// shared by every backend.
pub fn validate_copy(src: CopyEndpoint, dst: CopyEndpoint, size: u64) -> RhiResult<()> {
    if size % COPY_BUFFER_ALIGNMENT != 0
        || src.offset % COPY_BUFFER_ALIGNMENT != 0
        || dst.offset % COPY_BUFFER_ALIGNMENT != 0
    {
        return Err(RhiError::InvalidState(format!(
            "copy of {} bytes at src+{} dst+{} is not {}-byte aligned",
            size, src.offset, dst.offset, COPY_BUFFER_ALIGNMENT
        )));
    }

    if !src.usage.is_copy_source() {
        return Err(RhiError::InvalidState(format!(
            "{} buffer cannot be a copy source",
            src.usage.name()
        )));
    }

    if !dst.usage.is_copy_destination() {
        return Err(RhiError::InvalidState(format!(
            "{} buffer cannot be a copy destination",
            dst.usage.name()
        )));
    }

    let in_range = |end: &CopyEndpoint| {
        end.offset
            .checked_add(size)
            .is_some_and(|last| last <= end.size)
    };
    if !in_range(&src) || !in_range(&dst) {
        return Err(RhiError::InvalidState(format!(
            "copy of {} bytes overruns source ({}+{}) or destination ({}+{})",
            size, src.size, src.offset, dst.size, dst.offset
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging(size: u64, offset: u64) -> CopyEndpoint {
        CopyEndpoint {
            size,
            usage: BufferUsage::Staging,
            offset,
        }
    }

    fn uniform(size: u64, offset: u64) -> CopyEndpoint {
        CopyEndpoint {
            size,
            usage: BufferUsage::Uniform,
            offset,
        }
    }

    #[test]
    fn test_validate_copy_accepts_aligned_in_range() {
        assert!(validate_copy(staging(65536, 0), uniform(64, 0), 64).is_ok());
        assert!(validate_copy(staging(65536, 128), uniform(256, 192), 64).is_ok());
    }

    #[test]
    fn test_validate_copy_rejects_misaligned() {
        assert!(validate_copy(staging(64, 0), uniform(64, 0), 6).is_err());
        assert!(validate_copy(staging(64, 2), uniform(64, 0), 4).is_err());
        assert!(validate_copy(staging(64, 0), uniform(64, 1), 4).is_err());
    }

    #[test]
    fn test_validate_copy_rejects_overrun() {
        assert!(validate_copy(staging(64, 0), uniform(32, 0), 64).is_err());
        assert!(validate_copy(staging(64, 32), uniform(64, 0), 64).is_err());
        assert!(validate_copy(staging(64, u64::MAX - 3), uniform(64, 0), 4).is_err());
    }

    #[test]
    fn test_validate_copy_rejects_wrong_usage() {
        assert!(validate_copy(uniform(64, 0), uniform(64, 0), 64).is_err());
        assert!(validate_copy(staging(64, 0), staging(64, 0), 64).is_err());
    }
}

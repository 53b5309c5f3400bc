//! One frame's recording window.
//!
//! A [`Frame`] is handed out by [`FrameDriver::begin_frame`] with the
//! backbuffer acquired, the depth/stencil attachment validated and two
//! encoders open:
//!
//! - the *resource stream*, which only receives buffer copies that publish
//!   staged data
//! - the *render stream*, which receives the render pass and draws
//!
//! [`Frame::end`] unmaps the frame's staging buffers, finishes both
//! encoders and submits them in one call with the resource stream first, so
//! every copy is ordered before every draw of the same frame. It then
//! requests the staging re-maps and presents the backbuffer.
//!
//! Dropping a frame without calling `end` aborts it: nothing is submitted.
//!
//! [`FrameDriver::begin_frame`]: crate::FrameDriver::begin_frame

use bytemuck::Pod;
use stagehand_core::FramebufferSize;
use stagehand_rhi::{
    BufferId, COPY_BUFFER_ALIGNMENT, CommandBufferId, DepthStencilTarget, EncoderId, GpuDevice,
    RenderPassDesc, RhiError, SubmissionIndex, TextureViewId,
};
use tracing::{debug, warn};

use crate::error::{FrameError, FrameResult};
use crate::staging::{StagingAllocation, StagingPool, StagingState, StagingStats};

/// Label of the encoder recording staging copies.
pub const RESOURCE_STREAM_LABEL: &str = "resource stream";
/// Label of the encoder recording the render pass.
pub const RENDER_STREAM_LABEL: &str = "render stream";

/// The frame's two encoders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameEncoders {
    pub resource_stream: EncoderId,
    pub render_stream: EncoderId,
}

/// Clear values for the frame's render pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u32,
}

impl ClearValues {
    /// Clears color to `color` and depth/stencil to the defaults.
    pub fn color(color: [f32; 4]) -> Self {
        Self {
            color,
            ..Self::default()
        }
    }
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
            depth: 1.0,
            stencil: 0,
        }
    }
}

/// What [`Frame::end`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameReport {
    /// 1-based frame number.
    pub index: u64,
    pub submission: SubmissionIndex,
    pub size: FramebufferSize,
    /// Copies recorded into the resource stream.
    pub staged_copies: usize,
    /// Staging buffers unmapped and handed to the GPU.
    pub staging_buffers: usize,
}

/// A frame between begin and end.
pub struct Frame<'a, D: GpuDevice> {
    device: &'a mut D,
    pool: &'a mut StagingPool,
    encoders: FrameEncoders,
    // Encoders still open; taken when finished or discarded.
    resource_stream: Option<EncoderId>,
    render_stream: Option<EncoderId>,
    // Finished but not yet accepted by the queue.
    finished: Vec<CommandBufferId>,
    backbuffer: Option<TextureViewId>,
    depth_stencil: TextureViewId,
    size: FramebufferSize,
    index: u64,
    staged_copies: usize,
    pass_open: bool,
}

impl<'a, D: GpuDevice> Frame<'a, D> {
    pub(crate) fn new(
        device: &'a mut D,
        pool: &'a mut StagingPool,
        encoders: FrameEncoders,
        backbuffer: TextureViewId,
        depth_stencil: TextureViewId,
        size: FramebufferSize,
        index: u64,
    ) -> Self {
        Self {
            device,
            pool,
            encoders,
            resource_stream: Some(encoders.resource_stream),
            render_stream: Some(encoders.render_stream),
            finished: Vec::with_capacity(2),
            backbuffer: Some(backbuffer),
            depth_stencil,
            size,
            index,
            staged_copies: 0,
            pass_open: false,
        }
    }

    /// Staging memory for this frame, at most one buffer's capacity.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::StagingOverflow`] for oversized requests, or the
    /// device error if the pool has to grow and cannot.
    pub fn acquire_staging(&mut self, bytes: u64) -> FrameResult<StagingAllocation> {
        self.pool.acquire_sized(self.device, bytes)
    }

    /// Writable bytes of a staging allocation made this frame.
    pub fn staging_mut(&mut self, allocation: StagingAllocation) -> FrameResult<&mut [u8]> {
        self.pool.slice_mut(self.device, allocation)
    }

    /// Copies `data` into a staging allocation at `offset`.
    pub fn write_staging(
        &mut self,
        allocation: StagingAllocation,
        offset: u64,
        data: &[u8],
    ) -> FrameResult<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= allocation.len())
            .ok_or(FrameError::StagingOverflow {
                requested: offset.saturating_add(data.len() as u64),
                capacity: allocation.len(),
            })?;
        let bytes = self.staging_mut(allocation)?;
        bytes[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// Records a copy from staging memory into `destination` on the resource
    /// stream.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Misaligned`] unless size and offsets are
    /// multiples of [`COPY_BUFFER_ALIGNMENT`], or
    /// [`FrameError::StagingOverflow`] if the source range leaves the
    /// allocation.
    pub fn enqueue_resource_copy(
        &mut self,
        allocation: StagingAllocation,
        destination: BufferId,
        size: u64,
        src_offset: u64,
        dst_offset: u64,
    ) -> FrameResult<()> {
        self.pool
            .expect_state(allocation.buffer(), StagingState::Active)?;
        if [size, src_offset, dst_offset]
            .iter()
            .any(|v| v % COPY_BUFFER_ALIGNMENT != 0)
        {
            return Err(FrameError::Misaligned(format!(
                "copy of {} bytes from offset {} to offset {} (alignment {})",
                size, src_offset, dst_offset, COPY_BUFFER_ALIGNMENT
            )));
        }
        if src_offset
            .checked_add(size)
            .is_none_or(|end| end > allocation.len())
        {
            return Err(FrameError::StagingOverflow {
                requested: src_offset.saturating_add(size),
                capacity: allocation.len(),
            });
        }

        let encoder = self.open_encoder(self.resource_stream)?;
        self.device.copy_buffer_to_buffer(
            encoder,
            allocation.buffer(),
            src_offset,
            destination,
            dst_offset,
            size,
        )?;
        self.staged_copies += 1;
        Ok(())
    }

    /// Stages `value` and schedules its copy to offset 0 of `destination`.
    pub fn stage_uniform<T: Pod>(
        &mut self,
        destination: BufferId,
        value: &T,
    ) -> FrameResult<StagingAllocation> {
        let bytes = bytemuck::bytes_of(value);
        let allocation = self.acquire_staging(bytes.len() as u64)?;
        self.write_staging(allocation, 0, bytes)?;
        self.enqueue_resource_copy(allocation, destination, bytes.len() as u64, 0, 0)?;
        Ok(allocation)
    }

    /// Staging pool occupancy, including this frame's acquisitions.
    pub fn staging_stats(&self) -> StagingStats {
        self.pool.stats()
    }

    #[inline]
    pub fn encoders(&self) -> FrameEncoders {
        self.encoders
    }

    /// Opens the render pass on the render stream, targeting the backbuffer
    /// and the depth/stencil attachment.
    pub fn begin_render_pass(&mut self, clear: &ClearValues) -> FrameResult<()> {
        if self.pass_open {
            return Err(FrameError::RenderPass("render pass already open".to_string()));
        }
        let encoder = self.open_encoder(self.render_stream)?;
        let color_view = self.backbuffer.ok_or(FrameError::SwapchainUnavailable)?;

        self.device.begin_render_pass(
            encoder,
            &RenderPassDesc {
                color_view,
                clear_color: clear.color,
                depth_stencil: Some(DepthStencilTarget {
                    view: self.depth_stencil,
                    depth_clear: clear.depth,
                    stencil_clear: clear.stencil,
                }),
            },
        )?;
        self.pass_open = true;
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> FrameResult<()> {
        if !self.pass_open {
            return Err(FrameError::RenderPass("no render pass open".to_string()));
        }
        let encoder = self.open_encoder(self.render_stream)?;
        self.device.end_render_pass(encoder)?;
        self.pass_open = false;
        Ok(())
    }

    /// The device, for recording commands the frame has no helper for.
    #[inline]
    pub fn device(&mut self) -> &mut D {
        self.device
    }

    /// The acquired backbuffer view, until the frame ends.
    #[inline]
    pub fn backbuffer(&self) -> Option<TextureViewId> {
        self.backbuffer
    }

    #[inline]
    pub fn depth_stencil_view(&self) -> TextureViewId {
        self.depth_stencil
    }

    #[inline]
    pub fn size(&self) -> FramebufferSize {
        self.size
    }

    /// 1-based frame number.
    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Finishes the frame: unmap staging, finish both encoders, submit
    /// resource stream then render stream in one batch, request re-maps and
    /// present.
    ///
    /// # Errors
    ///
    /// On any failure before submission the frame is aborted and nothing is
    /// submitted.
    pub fn end(mut self) -> FrameResult<FrameReport> {
        if self.pass_open {
            return Err(FrameError::RenderPass(
                "frame ended with the render pass open".to_string(),
            ));
        }

        let staging_buffers = self.pool.unmap_active(self.device)?;

        let resource_encoder = self.open_encoder(self.resource_stream)?;
        let render_encoder = self.open_encoder(self.render_stream)?;
        self.resource_stream = None;
        let resource_cb = self.device.finish_encoder(resource_encoder)?;
        self.finished.push(resource_cb);
        self.render_stream = None;
        let render_cb = self.device.finish_encoder(render_encoder)?;
        self.finished.push(render_cb);

        let submission = self.device.submit(&[resource_cb, render_cb])?;
        self.finished.clear();
        self.pool.request_remaps(self.device);

        if let Some(backbuffer) = self.backbuffer.take() {
            self.device.present_backbuffer(backbuffer)?;
        }

        debug!(
            "Frame {} submitted as {} ({} copies, {} staging buffers)",
            self.index, submission, self.staged_copies, staging_buffers
        );
        Ok(FrameReport {
            index: self.index,
            submission,
            size: self.size,
            staged_copies: self.staged_copies,
            staging_buffers,
        })
    }

    fn open_encoder(&self, encoder: Option<EncoderId>) -> FrameResult<EncoderId> {
        encoder.ok_or_else(|| {
            FrameError::Rhi(RhiError::InvalidState(format!(
                "frame {} encoder already finished",
                self.index
            )))
        })
    }

    fn abort(&mut self) {
        for encoder in [self.resource_stream.take(), self.render_stream.take()]
            .into_iter()
            .flatten()
        {
            self.device.discard_encoder(encoder);
        }
        for command_buffer in self.finished.drain(..) {
            self.device.discard_command_buffer(command_buffer);
        }
        self.pool.reclaim_active(self.device);
        if let Some(backbuffer) = self.backbuffer.take()
            && let Err(e) = self.device.release_backbuffer(backbuffer)
        {
            warn!("Failed to release backbuffer of aborted frame: {}", e);
        }
    }
}

impl<D: GpuDevice> Drop for Frame<'_, D> {
    fn drop(&mut self) {
        let unfinished = self.resource_stream.is_some()
            || self.render_stream.is_some()
            || !self.finished.is_empty()
            || self.backbuffer.is_some();
        if unfinished {
            warn!("Frame {} aborted", self.index);
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_defaults() {
        let clear = ClearValues::default();
        assert_eq!(clear.depth, 1.0);
        assert_eq!(clear.stencil, 0);
        assert_eq!(clear.color, [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_clear_color_keeps_depth_defaults() {
        let clear = ClearValues::color([0.0, 1.0, 0.0, 1.0]);
        assert_eq!(clear.color, [0.0, 1.0, 0.0, 1.0]);
        assert_eq!(clear.depth, 1.0);
        assert_eq!(clear.stencil, 0);
    }

    #[test]
    fn test_stream_labels_differ() {
        assert_ne!(RESOURCE_STREAM_LABEL, RENDER_STREAM_LABEL);
    }
}

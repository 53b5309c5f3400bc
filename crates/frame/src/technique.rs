//! Rendering technique interface.

use stagehand_core::FramebufferSize;
use stagehand_rhi::GpuDevice;

use crate::error::FrameResult;
use crate::frame::Frame;

/// Something that records one frame's work.
///
/// Techniques create their long-lived GPU objects in `init`, stage data and
/// record their render pass in `render`, and destroy what they created in
/// `teardown`. They never submit; the frame does.
pub trait RenderTechnique<D: GpuDevice> {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn init(&mut self, device: &mut D, size: FramebufferSize) -> FrameResult<()>;

    fn render(&mut self, frame: &mut Frame<'_, D>) -> FrameResult<()>;

    fn teardown(&mut self, device: &mut D) -> FrameResult<()>;
}

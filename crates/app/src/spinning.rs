//! Demo technique: a transform rotating about Y, re-staged every frame.

use stagehand_core::FramebufferSize;
use stagehand_frame::{ClearValues, Frame, FrameResult, RenderTechnique, TransformUniform};
use stagehand_rhi::{BufferDesc, BufferId, GpuDevice};

const CLEAR_GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];

/// Degrees added to the rotation each frame.
const DEGREES_PER_FRAME: f32 = 1.0;

pub struct SpinningTransform {
    uniform: Option<BufferId>,
    angle_degrees: f32,
}

impl SpinningTransform {
    pub fn new() -> Self {
        Self {
            uniform: None,
            angle_degrees: 0.0,
        }
    }

    pub fn angle_degrees(&self) -> f32 {
        self.angle_degrees
    }
}

impl<D: GpuDevice> RenderTechnique<D> for SpinningTransform {
    fn name(&self) -> &str {
        "spinning transform"
    }

    fn init(&mut self, device: &mut D, _size: FramebufferSize) -> FrameResult<()> {
        let buffer = device.create_buffer(&BufferDesc::uniform(
            "transform uniform",
            TransformUniform::SIZE as u64,
        ))?;
        self.uniform = Some(buffer);
        Ok(())
    }

    fn render(&mut self, frame: &mut Frame<'_, D>) -> FrameResult<()> {
        if let Some(uniform) = self.uniform {
            let transform =
                TransformUniform::rotating(self.angle_degrees, frame.size().aspect_ratio());
            frame.stage_uniform(uniform, &transform)?;
        }
        self.angle_degrees = (self.angle_degrees + DEGREES_PER_FRAME) % 360.0;

        frame.begin_render_pass(&ClearValues::color(CLEAR_GREEN))?;
        frame.end_render_pass()
    }

    fn teardown(&mut self, device: &mut D) -> FrameResult<()> {
        if let Some(uniform) = self.uniform.take() {
            device.destroy_buffer(uniform)?;
        }
        Ok(())
    }
}

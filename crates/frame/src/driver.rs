//! Frame driver.
//!
//! [`FrameDriver`] owns the device context, the staging pool and the
//! attachment cache, and sequences each frame:
//!
//! ```text
//! begin_frame: poll device -> drain re-map completions -> apply resize
//!              -> acquire backbuffer -> ensure attachment -> open encoders
//! technique:   stage data on the resource stream, draw on the render stream
//! Frame::end:  unmap staging -> finish encoders -> submit [resource, render]
//!              -> request re-maps -> present
//! ```
//!
//! Frames are strictly sequential: a [`Frame`] borrows the driver mutably,
//! so no resize or second frame can interleave with one being recorded.

use stagehand_core::{Config, FramebufferSize, ShutdownPolicy};
use stagehand_rhi::{GpuDevice, TextureViewId};
use tracing::{debug, info, warn};

use crate::attachment::AttachmentCache;
use crate::error::FrameResult;
use crate::frame::{
    Frame, FrameEncoders, FrameReport, RENDER_STREAM_LABEL, RESOURCE_STREAM_LABEL,
};
use crate::staging::StagingPool;
use crate::technique::RenderTechnique;

/// Drives frames on a device `D`.
pub struct FrameDriver<D: GpuDevice> {
    device: D,
    pool: StagingPool,
    attachments: AttachmentCache,
    size: FramebufferSize,
    /// Size not yet forwarded to the device surface.
    pending_resize: Option<FramebufferSize>,
    frame_index: u64,
    shutdown_policy: ShutdownPolicy,
}

impl<D: GpuDevice> FrameDriver<D> {
    /// Creates a driver for a surface currently `size` physical pixels.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Misaligned`](crate::FrameError::Misaligned) if
    /// the configured staging size is unusable.
    pub fn new(device: D, size: FramebufferSize, config: &Config) -> FrameResult<Self> {
        let pool = StagingPool::from_config(config)?;
        info!(
            "Frame driver on {} backend at {} ({} byte staging buffers)",
            device.backend_name(),
            size,
            pool.buffer_size()
        );
        Ok(Self {
            device,
            pool,
            attachments: AttachmentCache::default(),
            size,
            pending_resize: None,
            frame_index: 0,
            shutdown_policy: config.shutdown,
        })
    }

    /// Records a new framebuffer size. It takes effect at the next
    /// [`begin_frame`](Self::begin_frame).
    pub fn resize(&mut self, size: FramebufferSize) {
        if size != self.size {
            debug!("Framebuffer resize {} -> {}", self.size, size);
            self.size = size;
            self.pending_resize = Some(size);
        }
    }

    /// Starts a frame.
    ///
    /// Returns `Ok(None)` when the framebuffer is empty (minimised window).
    ///
    /// # Errors
    ///
    /// [`FrameError::SwapchainUnavailable`](crate::FrameError::SwapchainUnavailable)
    /// if no backbuffer can be acquired; the caller should stop producing
    /// frames and retry later. Attachment or encoder failures are returned
    /// after the backbuffer is released. A failed surface resize stays
    /// pending and is retried by the next call.
    pub fn begin_frame(&mut self) -> FrameResult<Option<Frame<'_, D>>> {
        self.device.poll()?;
        self.pool.drain_completions();

        // Stays pending until the surface accepts it.
        if let Some(size) = self.pending_resize {
            self.device.resize_surface(size)?;
            self.pending_resize = None;
        }
        if self.size.is_empty() {
            return Ok(None);
        }

        let backbuffer = self.device.acquire_backbuffer()?;

        let depth_stencil = match self.attachments.ensure(&mut self.device, self.size) {
            Ok(view) => view,
            Err(e) => {
                self.release_backbuffer(backbuffer);
                return Err(e);
            }
        };

        let resource_stream = match self.device.create_command_encoder(RESOURCE_STREAM_LABEL) {
            Ok(encoder) => encoder,
            Err(e) => {
                self.release_backbuffer(backbuffer);
                return Err(e.into());
            }
        };
        let render_stream = match self.device.create_command_encoder(RENDER_STREAM_LABEL) {
            Ok(encoder) => encoder,
            Err(e) => {
                self.device.discard_encoder(resource_stream);
                self.release_backbuffer(backbuffer);
                return Err(e.into());
            }
        };

        self.frame_index += 1;
        Ok(Some(Frame::new(
            &mut self.device,
            &mut self.pool,
            FrameEncoders {
                resource_stream,
                render_stream,
            },
            backbuffer,
            depth_stencil,
            self.size,
            self.frame_index,
        )))
    }

    /// Runs one frame of `technique`.
    ///
    /// Returns `Ok(None)` if no frame was produced (empty framebuffer).
    pub fn run_frame<T: RenderTechnique<D> + ?Sized>(
        &mut self,
        technique: &mut T,
    ) -> FrameResult<Option<FrameReport>> {
        let Some(mut frame) = self.begin_frame()? else {
            return Ok(None);
        };
        technique.render(&mut frame)?;
        frame.end().map(Some)
    }

    /// Lets `technique` create its GPU objects.
    pub fn init_technique<T: RenderTechnique<D> + ?Sized>(
        &mut self,
        technique: &mut T,
    ) -> FrameResult<()> {
        info!("Initializing technique '{}'", technique.name());
        technique.init(&mut self.device, self.size)
    }

    /// Tears everything down: the technique, the attachment, the staging
    /// pool (per the configured [`ShutdownPolicy`]), then waits for the
    /// device to go idle.
    pub fn shutdown<T: RenderTechnique<D> + ?Sized>(
        &mut self,
        technique: &mut T,
    ) -> FrameResult<()> {
        info!("Shutting down frame driver after {} frame(s)", self.frame_index);
        technique.teardown(&mut self.device)?;
        self.attachments.release(&mut self.device)?;
        self.pool.shutdown(&mut self.device, self.shutdown_policy)?;
        self.device.wait_idle()?;
        Ok(())
    }

    fn release_backbuffer(&mut self, backbuffer: TextureViewId) {
        if let Err(e) = self.device.release_backbuffer(backbuffer) {
            warn!("Failed to release backbuffer: {}", e);
        }
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    #[inline]
    pub fn staging_pool(&self) -> &StagingPool {
        &self.pool
    }

    #[inline]
    pub fn attachments(&self) -> &AttachmentCache {
        &self.attachments
    }

    /// Current framebuffer size.
    #[inline]
    pub fn size(&self) -> FramebufferSize {
        self.size
    }

    /// Frames begun so far.
    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    #[inline]
    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        self.shutdown_policy
    }
}

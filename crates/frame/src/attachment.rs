//! Depth/stencil attachment sized to the framebuffer.
//!
//! [`AttachmentCache`] keeps one depth/stencil texture and its view, tagged
//! with the [`FramebufferSize`] they were built for. The cached view is
//! returned untouched while the size matches; any other size tears the old
//! pair down (view first, then texture) and builds a new one.

use stagehand_core::FramebufferSize;
use stagehand_rhi::{GpuDevice, TextureDesc, TextureFormat, TextureId, TextureViewId};
use tracing::{debug, info, warn};

use crate::error::FrameResult;

/// Format used for the attachment unless configured otherwise.
pub const DEFAULT_DEPTH_STENCIL_FORMAT: TextureFormat = TextureFormat::Depth24PlusStencil8;

#[derive(Clone, Copy, Debug)]
struct Attachment {
    texture: TextureId,
    view: TextureViewId,
    size: FramebufferSize,
}

/// Lazily built depth/stencil attachment.
#[derive(Debug)]
pub struct AttachmentCache {
    format: TextureFormat,
    current: Option<Attachment>,
    builds: u64,
}

impl AttachmentCache {
    pub fn new(format: TextureFormat) -> Self {
        Self {
            format,
            current: None,
            builds: 0,
        }
    }

    /// Returns a view of an attachment sized to `size`.
    ///
    /// No device calls are made when the cached attachment already matches.
    ///
    /// # Errors
    ///
    /// Returns the device error if the texture or view cannot be created.
    /// The cache is left empty in that case, so the next call retries.
    pub fn ensure<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        size: FramebufferSize,
    ) -> FrameResult<TextureViewId> {
        if let Some(attachment) = self.current
            && attachment.size == size
        {
            return Ok(attachment.view);
        }

        self.release(device)?;

        let texture = device.create_texture(&TextureDesc {
            label: "depth_stencil",
            width: size.width,
            height: size.height,
            format: self.format,
        })?;
        let view = match device.create_texture_view(texture) {
            Ok(view) => view,
            Err(e) => {
                if let Err(cleanup) = device.destroy_texture(texture) {
                    warn!("Failed to destroy orphaned depth texture: {}", cleanup);
                }
                return Err(e.into());
            }
        };

        self.current = Some(Attachment {
            texture,
            view,
            size,
        });
        self.builds += 1;
        info!("Built {:?} attachment at {}", self.format, size);
        Ok(view)
    }

    /// Destroys the attachment, if any: the view is released before the
    /// texture backing it.
    pub fn release<D: GpuDevice + ?Sized>(&mut self, device: &mut D) -> FrameResult<()> {
        if let Some(attachment) = self.current.take() {
            device.release_texture_view(attachment.view)?;
            device.destroy_texture(attachment.texture)?;
            debug!("Released attachment sized {}", attachment.size);
        }
        Ok(())
    }

    /// Current view, if an attachment exists.
    #[inline]
    pub fn view(&self) -> Option<TextureViewId> {
        self.current.map(|a| a.view)
    }

    /// Size the current attachment was built for.
    #[inline]
    pub fn size(&self) -> Option<FramebufferSize> {
        self.current.map(|a| a.size)
    }

    #[inline]
    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Number of times an attachment has been built, including the first.
    #[inline]
    pub fn rebuild_count(&self) -> u64 {
        self.builds
    }
}

impl Default for AttachmentCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH_STENCIL_FORMAT)
    }
}

//! Window management using winit.
//!
//! The window tracks its logical size and device pixel ratio separately so the
//! framebuffer size can be recomputed whenever either one changes.

use std::sync::Arc;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use winit::dpi::{LogicalSize, PhysicalSize};
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window as WinitWindow, WindowAttributes};

use stagehand_core::{Error, FramebufferSize, Result, WindowConfig};

/// Logical window size plus the device pixel ratio it is displayed at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfaceExtent {
    logical_width: f64,
    logical_height: f64,
    scale_factor: f64,
}

impl SurfaceExtent {
    pub fn new(logical_width: f64, logical_height: f64, scale_factor: f64) -> Self {
        Self {
            logical_width,
            logical_height,
            scale_factor,
        }
    }

    /// Physical pixel size of the framebuffer.
    pub fn framebuffer_size(&self) -> FramebufferSize {
        FramebufferSize::from_logical(self.logical_width, self.logical_height, self.scale_factor)
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    /// Records a resize reported in physical pixels.
    pub fn set_physical(&mut self, width: u32, height: u32) {
        if self.scale_factor > 0.0 {
            self.logical_width = width as f64 / self.scale_factor;
            self.logical_height = height as f64 / self.scale_factor;
        } else {
            self.logical_width = 0.0;
            self.logical_height = 0.0;
        }
    }

    /// Records a new device pixel ratio. The logical size is unchanged.
    pub fn set_scale_factor(&mut self, scale_factor: f64) {
        self.scale_factor = scale_factor;
    }
}

/// A window wrapper that provides access to the underlying winit window
/// and raw handles for Vulkan surface creation.
pub struct Window {
    window: Arc<WinitWindow>,
    extent: SurfaceExtent,
}

impl Window {
    /// Create a new resizable window from the window configuration.
    pub fn new(event_loop: &ActiveEventLoop, config: &WindowConfig) -> Result<Self> {
        let attrs = WindowAttributes::default()
            .with_title(config.title.as_str())
            .with_inner_size(LogicalSize::new(config.width, config.height))
            .with_resizable(true);

        let window = event_loop
            .create_window(attrs)
            .map_err(|e| Error::Window(e.to_string()))?;

        let scale_factor = window.scale_factor();
        let logical: LogicalSize<f64> = window.inner_size().to_logical(scale_factor);
        let extent = SurfaceExtent::new(logical.width, logical.height, scale_factor);

        tracing::info!(
            "Window created: {}x{} logical, framebuffer {} at scale {}",
            config.width,
            config.height,
            extent.framebuffer_size(),
            scale_factor
        );

        Ok(Self {
            window: Arc::new(window),
            extent,
        })
    }

    /// Get a reference to the underlying winit window.
    pub fn inner(&self) -> &WinitWindow {
        &self.window
    }

    /// Current framebuffer size in physical pixels.
    pub fn framebuffer_size(&self) -> FramebufferSize {
        self.extent.framebuffer_size()
    }

    pub fn extent(&self) -> SurfaceExtent {
        self.extent
    }

    /// Update the tracked size from a `Resized` event. Returns the new
    /// framebuffer size.
    pub fn on_resized(&mut self, size: PhysicalSize<u32>) -> FramebufferSize {
        self.extent.set_physical(size.width, size.height);
        let framebuffer = self.extent.framebuffer_size();
        tracing::debug!("Window resized: framebuffer {}", framebuffer);
        framebuffer
    }

    /// Update the tracked device pixel ratio from a `ScaleFactorChanged`
    /// event. Returns the new framebuffer size.
    pub fn on_scale_factor_changed(&mut self, scale_factor: f64) -> FramebufferSize {
        self.extent.set_scale_factor(scale_factor);
        let framebuffer = self.extent.framebuffer_size();
        tracing::debug!(
            "Scale factor changed to {}: framebuffer {}",
            scale_factor,
            framebuffer
        );
        framebuffer
    }

    /// Raw display handle for surface creation.
    pub fn raw_display_handle(&self) -> Result<RawDisplayHandle> {
        self.window
            .display_handle()
            .map(|handle| handle.as_raw())
            .map_err(|e| Error::Window(format!("Failed to get display handle: {}", e)))
    }

    /// Raw window handle for surface creation.
    pub fn raw_window_handle(&self) -> Result<RawWindowHandle> {
        self.window
            .window_handle()
            .map(|handle| handle.as_raw())
            .map_err(|e| Error::Window(format!("Failed to get window handle: {}", e)))
    }

    /// Request a redraw of the window.
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framebuffer_scales_logical_size() {
        let extent = SurfaceExtent::new(800.0, 600.0, 1.5);
        assert_eq!(extent.framebuffer_size(), FramebufferSize::new(1200, 900));
    }

    #[test]
    fn test_physical_resize_round_trips_through_scale() {
        let mut extent = SurfaceExtent::new(800.0, 600.0, 2.0);
        extent.set_physical(1000, 500);
        assert_eq!(extent.framebuffer_size(), FramebufferSize::new(1000, 500));
    }

    #[test]
    fn test_scale_change_keeps_logical_size() {
        let mut extent = SurfaceExtent::new(640.0, 480.0, 1.0);
        extent.set_scale_factor(2.0);
        assert_eq!(extent.framebuffer_size(), FramebufferSize::new(1280, 960));
    }

    #[test]
    fn test_minimised_window_is_empty() {
        let mut extent = SurfaceExtent::new(640.0, 480.0, 1.0);
        extent.set_physical(0, 0);
        assert!(extent.framebuffer_size().is_empty());
    }
}

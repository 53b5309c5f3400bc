//! Framebuffer sizing.

use std::fmt;

/// Size of the presentation surface in physical pixels.
///
/// Compared by value; the attachment cache rebuilds whenever the tagged size
/// of its depth/stencil attachment differs from the current one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FramebufferSize {
    pub width: u32,
    pub height: u32,
}

impl FramebufferSize {
    /// Creates a size from physical pixel dimensions.
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Computes the physical size from a logical size and device pixel ratio.
    ///
    /// Each dimension is rounded to the nearest pixel. Negative or non-finite
    /// products clamp to zero.
    ///
    /// # Example
    ///
    /// ```
    /// use stagehand_core::FramebufferSize;
    ///
    /// let size = FramebufferSize::from_logical(800.0, 600.0, 2.0);
    /// assert_eq!(size, FramebufferSize::new(1600, 1200));
    /// ```
    pub fn from_logical(width: f64, height: f64, device_pixel_ratio: f64) -> Self {
        Self {
            width: to_pixels(width * device_pixel_ratio),
            height: to_pixels(height * device_pixel_ratio),
        }
    }

    /// Returns true if either dimension is zero (e.g. a minimised window).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width divided by height, or 1.0 for an empty size.
    pub fn aspect_ratio(&self) -> f32 {
        if self.is_empty() {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }

    /// Number of pixels covered.
    #[inline]
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for FramebufferSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

fn to_pixels(value: f64) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    value.round().min(u32::MAX as f64) as u32
}

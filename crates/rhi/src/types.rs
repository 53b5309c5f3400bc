//! Handles and descriptors shared by every backend.
//!
//! Resources are referred to by small copyable ids. The owning backend maps
//! them to its native objects; ids are never reused within one device.

use std::fmt;

use thiserror::Error;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw id produced by a backend.
            #[inline]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw id.
            #[inline]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

define_handle!(
    /// GPU buffer.
    BufferId,
    "buffer"
);
define_handle!(
    /// GPU texture (image plus memory).
    TextureId,
    "texture"
);
define_handle!(
    /// View onto a texture or a swapchain image.
    TextureViewId,
    "view"
);
define_handle!(
    /// Command encoder that is still recording.
    EncoderId,
    "encoder"
);
define_handle!(
    /// Finished, submittable command buffer.
    CommandBufferId,
    "cmdbuf"
);

/// Monotonic index of a queue submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionIndex(pub u64);

impl fmt::Display for SubmissionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "submission#{}", self.0)
    }
}

/// Hands out never-reused raw ids.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_raw(&mut self) -> u64 {
        let id = self.next.max(1);
        self.next = id + 1;
        id
    }
}

/// Copy sizes and offsets must be multiples of this many bytes.
pub const COPY_BUFFER_ALIGNMENT: u64 = 4;

/// Buffer usage type.
///
/// Defines the intended use of the buffer, which drives backend usage flags
/// and memory placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Vertex buffer - stores vertex data
    Vertex,
    /// Index buffer - stores index data
    Index,
    /// Uniform buffer - stores shader uniform data
    Uniform,
    /// Storage buffer - general-purpose GPU storage
    Storage,
    /// Staging buffer - CPU-writable copy source, never bound for rendering
    Staging,
}

impl BufferUsage {
    /// Only staging buffers may be the source of a buffer copy.
    #[inline]
    pub fn is_copy_source(self) -> bool {
        matches!(self, BufferUsage::Staging)
    }

    /// Every non-staging buffer may receive copies.
    #[inline]
    pub fn is_copy_destination(self) -> bool {
        !self.is_copy_source()
    }

    /// Whether the CPU can map the buffer.
    #[inline]
    pub fn is_mappable(self) -> bool {
        !matches!(self, BufferUsage::Storage)
    }

    /// Returns a human-readable name for the buffer type.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "vertex",
            BufferUsage::Index => "index",
            BufferUsage::Uniform => "uniform",
            BufferUsage::Storage => "storage",
            BufferUsage::Staging => "staging",
        }
    }
}

/// Buffer creation parameters.
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
    /// Create the buffer already mapped for CPU writes.
    pub mapped_at_creation: bool,
}

impl<'a> BufferDesc<'a> {
    /// A staging buffer, mapped at creation.
    pub fn staging(label: &'a str, size: u64) -> Self {
        Self {
            label,
            size,
            usage: BufferUsage::Staging,
            mapped_at_creation: true,
        }
    }

    /// A uniform buffer filled through copies.
    pub fn uniform(label: &'a str, size: u64) -> Self {
        Self {
            label,
            size,
            usage: BufferUsage::Uniform,
            mapped_at_creation: false,
        }
    }
}

/// Texture formats used by the frame pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// Depth with an 8-bit stencil; backends pick a 24- or 32-bit depth.
    Depth24PlusStencil8,
    /// 32-bit float depth, no stencil.
    Depth32Float,
    /// Typical swapchain color format.
    Bgra8Unorm,
    /// Generic color format.
    Rgba8Unorm,
}

impl TextureFormat {
    #[inline]
    pub fn has_depth(self) -> bool {
        matches!(
            self,
            TextureFormat::Depth24PlusStencil8 | TextureFormat::Depth32Float
        )
    }

    #[inline]
    pub fn has_stencil(self) -> bool {
        matches!(self, TextureFormat::Depth24PlusStencil8)
    }
}

/// 2D texture creation parameters.
#[derive(Clone, Copy, Debug)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

/// Access requested from an asynchronous map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
}

/// Why an asynchronous map did not complete.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum MapError {
    /// The device was lost before the map could complete.
    #[error("device lost before map completed")]
    DeviceLost,
    /// The buffer was destroyed while the request was pending.
    #[error("buffer destroyed while map was pending")]
    Destroyed,
    /// The backend rejected the request.
    #[error("map rejected: {0}")]
    Rejected(String),
}

/// Outcome delivered to a map callback.
pub type MapResult = Result<(), MapError>;

/// Completion handler for [`GpuDevice::map_buffer_async`](crate::GpuDevice::map_buffer_async).
pub type MapCallback = Box<dyn FnOnce(MapResult) + Send + 'static>;

/// Parameters for a render pass targeting one color view and an optional
/// depth/stencil view. All attachments are cleared on load; color is stored,
/// depth and stencil are discarded.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderPassDesc {
    pub color_view: TextureViewId,
    pub clear_color: [f32; 4],
    pub depth_stencil: Option<DepthStencilTarget>,
}

/// Depth/stencil part of a [`RenderPassDesc`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthStencilTarget {
    pub view: TextureViewId,
    pub depth_clear: f32,
    pub stencil_clear: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        assert_eq!(BufferId::from_raw(7).to_string(), "buffer#7");
        assert_eq!(TextureViewId::from_raw(2).to_string(), "view#2");
        assert_eq!(SubmissionIndex(3).to_string(), "submission#3");
    }

    #[test]
    fn test_id_allocator_never_returns_zero_or_repeats() {
        let mut ids = IdAllocator::default();
        let a = ids.next_raw();
        let b = ids.next_raw();
        assert_ne!(a, 0);
        assert!(b > a);
    }

    #[test]
    fn test_buffer_usage_copy_roles() {
        assert!(BufferUsage::Staging.is_copy_source());
        assert!(!BufferUsage::Staging.is_copy_destination());
        assert!(BufferUsage::Uniform.is_copy_destination());
        assert!(!BufferUsage::Storage.is_mappable());
        assert!(BufferUsage::Staging.is_mappable());
    }

    #[test]
    fn test_buffer_usage_name() {
        assert_eq!(BufferUsage::Vertex.name(), "vertex");
        assert_eq!(BufferUsage::Index.name(), "index");
        assert_eq!(BufferUsage::Uniform.name(), "uniform");
        assert_eq!(BufferUsage::Storage.name(), "storage");
        assert_eq!(BufferUsage::Staging.name(), "staging");
    }

    #[test]
    fn test_staging_desc_is_mapped() {
        let desc = BufferDesc::staging("staging", 65536);
        assert!(desc.mapped_at_creation);
        assert_eq!(desc.usage, BufferUsage::Staging);
    }

    #[test]
    fn test_depth_format_aspects() {
        assert!(TextureFormat::Depth24PlusStencil8.has_depth());
        assert!(TextureFormat::Depth24PlusStencil8.has_stencil());
        assert!(!TextureFormat::Depth32Float.has_stencil());
        assert!(!TextureFormat::Bgra8Unorm.has_depth());
    }
}

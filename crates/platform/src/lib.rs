//! Platform layer for the stagehand demo.
//!
//! This crate provides:
//! - Window creation from [`stagehand_core::Config`] via winit
//! - Framebuffer size tracking across resizes and scale factor changes
//! - Raw window handles for Vulkan surface creation

mod window;

pub use window::{SurfaceExtent, Window};

// Re-export winit types the application loop needs
pub use winit::event::WindowEvent;
pub use winit::event_loop::EventLoop;

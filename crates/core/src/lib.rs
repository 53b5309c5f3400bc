//! Core utilities for the stagehand frame pipeline.
//!
//! This crate provides foundational types used across the workspace:
//! - Error types and result aliases
//! - Logging initialization
//! - Configuration loading
//! - Framebuffer sizing
//! - Frame timing

mod clock;
mod config;
mod error;
mod logging;
mod size;

pub use clock::FrameClock;
pub use config::{Config, DEFAULT_STAGING_BUFFER_SIZE, ShutdownPolicy, WindowConfig};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use size::FramebufferSize;

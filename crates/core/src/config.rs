//! Runtime configuration.
//!
//! Defaults: 64 KiB staging buffers and FIFO
//! presentation. Every field can be overridden through `STAGEHAND_*`
//! environment variables:
//!
//! | variable                        | field                  |
//! |---------------------------------|------------------------|
//! | `STAGEHAND_STAGING_SIZE`        | `staging_buffer_size`  |
//! | `STAGEHAND_VSYNC`               | `vsync`                |
//! | `STAGEHAND_VALIDATION`          | `validation`           |
//! | `STAGEHAND_SHUTDOWN`            | `shutdown` (`drain`/`detach`) |
//! | `STAGEHAND_WINDOW_WIDTH`        | `window.width`         |
//! | `STAGEHAND_WINDOW_HEIGHT`       | `window.height`        |
//! | `STAGEHAND_WINDOW_TITLE`        | `window.title`         |

use std::str::FromStr;

use crate::error::{Error, Result};

/// Default capacity of every staging buffer, in bytes.
pub const DEFAULT_STAGING_BUFFER_SIZE: u64 = 64 * 1024;

/// Staging sizes must keep copies 4-byte aligned.
const STAGING_SIZE_ALIGNMENT: u64 = 4;

/// What to do with staging buffers still awaiting a re-map at shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Wait for the device to go idle and deliver every outstanding completion
    /// before destroying the pool.
    #[default]
    Drain,
    /// Destroy only free buffers and ignore completions that arrive later.
    Detach,
}

impl FromStr for ShutdownPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "detach" => Ok(Self::Detach),
            other => Err(Error::Config(format!(
                "unknown shutdown policy '{}' (expected 'drain' or 'detach')",
                other
            ))),
        }
    }
}

/// Initial window parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: "stagehand".to_string(),
        }
    }
}

/// Configuration for the frame pipeline and the demo application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Fixed capacity of each staging buffer.
    pub staging_buffer_size: u64,
    /// Present with vertical sync (FIFO) instead of mailbox.
    pub vsync: bool,
    /// Enable Vulkan validation layers when available.
    pub validation: bool,
    /// Handling of outstanding re-map requests at shutdown.
    pub shutdown: ShutdownPolicy,
    /// Initial window parameters.
    pub window: WindowConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            staging_buffer_size: DEFAULT_STAGING_BUFFER_SIZE,
            vsync: true,
            validation: cfg!(debug_assertions),
            shutdown: ShutdownPolicy::default(),
            window: WindowConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration through an arbitrary key lookup.
    ///
    /// Missing keys keep their default value. The result is validated.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("STAGEHAND_STAGING_SIZE") {
            config.staging_buffer_size = parse_value("STAGEHAND_STAGING_SIZE", &value)?;
        }
        if let Some(value) = lookup("STAGEHAND_VSYNC") {
            config.vsync = parse_bool("STAGEHAND_VSYNC", &value)?;
        }
        if let Some(value) = lookup("STAGEHAND_VALIDATION") {
            config.validation = parse_bool("STAGEHAND_VALIDATION", &value)?;
        }
        if let Some(value) = lookup("STAGEHAND_SHUTDOWN") {
            config.shutdown = value.parse()?;
        }
        if let Some(value) = lookup("STAGEHAND_WINDOW_WIDTH") {
            config.window.width = parse_value("STAGEHAND_WINDOW_WIDTH", &value)?;
        }
        if let Some(value) = lookup("STAGEHAND_WINDOW_HEIGHT") {
            config.window.height = parse_value("STAGEHAND_WINDOW_HEIGHT", &value)?;
        }
        if let Some(value) = lookup("STAGEHAND_WINDOW_TITLE") {
            config.window.title = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks invariants the frame pipeline relies on.
    pub fn validate(&self) -> Result<()> {
        if self.staging_buffer_size == 0 {
            return Err(Error::Config(
                "staging buffer size must be greater than 0".to_string(),
            ));
        }
        if self.staging_buffer_size % STAGING_SIZE_ALIGNMENT != 0 {
            return Err(Error::Config(format!(
                "staging buffer size {} is not a multiple of {}",
                self.staging_buffer_size, STAGING_SIZE_ALIGNMENT
            )));
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(Error::Config(format!(
                "window size {}x{} must be non-zero",
                self.window.width, self.window.height
            )));
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} has invalid value '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "{} has invalid boolean '{}'",
            key, value
        ))),
    }
}

//! Frame timing for the render loop.

use std::time::{Duration, Instant};

/// Wall-clock timer that also counts frames.
///
/// `tick()` is called once per produced frame and returns the time since
/// the previous tick.
#[derive(Debug)]
pub struct FrameClock {
    start: Instant,
    last_tick: Instant,
    frames: u64,
}

impl FrameClock {
    /// Create a new clock, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            frames: 0,
        }
    }

    /// Total time since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Total time since the clock was created, in seconds.
    pub fn elapsed_secs(&self) -> f32 {
        self.elapsed().as_secs_f32()
    }

    /// Marks the end of a frame and returns the time since the previous one.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        self.frames += 1;
        delta
    }

    /// Number of ticks recorded so far.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Average frames per second over the clock's lifetime.
    pub fn average_fps(&self) -> f32 {
        let secs = self.elapsed_secs();
        if secs <= f32::EPSILON {
            0.0
        } else {
            self.frames as f32 / secs
        }
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

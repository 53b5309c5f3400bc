//! Stagehand demo - Main Entry Point
//!
//! Opens a window and drives the frame pipeline on the Vulkan backend,
//! staging a rotating transform every frame and clearing the backbuffer.

mod spinning;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use stagehand_core::{Config, FrameClock};
use stagehand_frame::{FrameDriver, FrameError};
use stagehand_platform::Window;
use stagehand_rhi::VulkanDevice;

use spinning::SpinningTransform;

/// Frames between FPS log lines.
const FPS_LOG_INTERVAL: u64 = 300;

struct App {
    config: Config,
    window: Option<Window>,
    driver: Option<FrameDriver<VulkanDevice>>,
    technique: SpinningTransform,
    clock: FrameClock,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            window: None,
            driver: None,
            technique: SpinningTransform::new(),
            clock: FrameClock::new(),
        }
    }

    fn create_driver(&mut self, window: &Window) -> Result<FrameDriver<VulkanDevice>> {
        let size = window.framebuffer_size();
        let device = VulkanDevice::new(
            window.raw_display_handle()?,
            window.raw_window_handle()?,
            size,
            &self.config,
        )
        .context("failed to create Vulkan device")?;

        let mut driver = FrameDriver::new(device, size, &self.config)?;
        driver.init_technique(&mut self.technique)?;
        Ok(driver)
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(driver) = self.driver.as_mut() else {
            return;
        };

        match driver.run_frame(&mut self.technique) {
            Ok(Some(_)) => {
                self.clock.tick();
                if self.clock.frame_count() % FPS_LOG_INTERVAL == 0 {
                    info!(
                        "{} frames, {:.1} fps average",
                        self.clock.frame_count(),
                        self.clock.average_fps()
                    );
                }
            }
            Ok(None) => {}
            Err(FrameError::SwapchainUnavailable) => {
                warn!("Swapchain unavailable, retrying on the next redraw");
            }
            Err(e) if e.is_fatal() => {
                error!("Fatal frame error: {}", e);
                self.shutdown();
                event_loop.exit();
            }
            Err(e) => warn!("Frame dropped: {}", e),
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut driver) = self.driver.take()
            && let Err(e) = driver.shutdown(&mut self.technique)
        {
            error!("Shutdown error: {}", e);
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match Window::new(event_loop, &self.config.window) {
            Ok(window) => window,
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
                return;
            }
        };

        match self.create_driver(&window) {
            Ok(driver) => {
                info!("Initialization complete, entering main loop");
                self.driver = Some(driver);
                self.window = Some(window);
            }
            Err(e) => {
                error!("Failed to create frame driver: {:?}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                self.shutdown();
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(window) = self.window.as_mut() {
                    let framebuffer = window.on_resized(size);
                    if let Some(driver) = self.driver.as_mut() {
                        driver.resize(framebuffer);
                    }
                }
            }
            WindowEvent::ScaleFactorChanged { scale_factor, .. } => {
                if let Some(window) = self.window.as_mut() {
                    let framebuffer = window.on_scale_factor_changed(scale_factor);
                    if let Some(driver) = self.driver.as_mut() {
                        driver.resize(framebuffer);
                    }
                }
            }
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

fn main() -> Result<()> {
    stagehand_core::init_logging();
    let config = Config::from_env().context("invalid configuration")?;
    info!("Starting stagehand demo: {:?}", config);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    Ok(())
}

//! Integration tests for the frame pipeline on the headless device.

use std::collections::HashSet;

use stagehand_core::{Config, FramebufferSize, ShutdownPolicy};
use stagehand_frame::{
    ClearValues, Frame, FrameDriver, FrameError, FrameResult, RENDER_STREAM_LABEL,
    RESOURCE_STREAM_LABEL, RenderTechnique, StagingState, TransformUniform,
};
use stagehand_rhi::{
    BufferDesc, BufferId, BufferUsage, DeviceEvent, GpuDevice, HeadlessDevice, RhiError,
};

const SMALL: FramebufferSize = FramebufferSize::new(800, 600);
const LARGE: FramebufferSize = FramebufferSize::new(1600, 1200);

fn driver() -> FrameDriver<HeadlessDevice> {
    driver_with(Config::default())
}

fn driver_with(config: Config) -> FrameDriver<HeadlessDevice> {
    FrameDriver::new(HeadlessDevice::new(SMALL), SMALL, &config).unwrap()
}

fn uniform_buffer(driver: &mut FrameDriver<HeadlessDevice>, size: u64) -> BufferId {
    driver
        .device_mut()
        .create_buffer(&BufferDesc::uniform("destination", size))
        .unwrap()
}

/// Clears the backbuffer after staging `copies` transforms.
struct Spinner {
    copies: usize,
    uniform: Option<BufferId>,
    angle: f32,
}

impl Spinner {
    fn new(copies: usize) -> Self {
        Self {
            copies,
            uniform: None,
            angle: 0.0,
        }
    }
}

impl RenderTechnique<HeadlessDevice> for Spinner {
    fn name(&self) -> &str {
        "spinner"
    }

    fn init(&mut self, device: &mut HeadlessDevice, _size: FramebufferSize) -> FrameResult<()> {
        self.uniform = Some(device.create_buffer(&BufferDesc::uniform(
            "transform",
            TransformUniform::SIZE as u64,
        ))?);
        Ok(())
    }

    fn render(&mut self, frame: &mut Frame<'_, HeadlessDevice>) -> FrameResult<()> {
        let uniform = self.uniform.expect("technique initialized");
        for _ in 0..self.copies {
            let transform = TransformUniform::rotating(self.angle, frame.size().aspect_ratio());
            frame.stage_uniform(uniform, &transform)?;
        }
        self.angle += 1.0;

        frame.begin_render_pass(&ClearValues::color([0.0, 1.0, 0.0, 1.0]))?;
        frame.end_render_pass()
    }

    fn teardown(&mut self, device: &mut HeadlessDevice) -> FrameResult<()> {
        if let Some(uniform) = self.uniform.take() {
            device.destroy_buffer(uniform)?;
        }
        Ok(())
    }
}

/// Stages once, then fails before recording the render pass.
struct Failing;

impl RenderTechnique<HeadlessDevice> for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn init(&mut self, _device: &mut HeadlessDevice, _size: FramebufferSize) -> FrameResult<()> {
        Ok(())
    }

    fn render(&mut self, frame: &mut Frame<'_, HeadlessDevice>) -> FrameResult<()> {
        frame.acquire_staging(64)?;
        Err(FrameError::RenderPass("technique gave up".to_string()))
    }

    fn teardown(&mut self, _device: &mut HeadlessDevice) -> FrameResult<()> {
        Ok(())
    }
}

fn submitted_labels(events: &[DeviceEvent]) -> Vec<Vec<String>> {
    events
        .iter()
        .filter_map(|event| match event {
            DeviceEvent::Submitted { labels, .. } => Some(labels.clone()),
            _ => None,
        })
        .collect()
}

fn position(events: &[DeviceEvent], matches: impl Fn(&DeviceEvent) -> bool) -> usize {
    events
        .iter()
        .position(matches)
        .expect("event should be present")
}

#[test]
fn test_staged_copy_reaches_destination() {
    let mut driver = driver();
    let destination = uniform_buffer(&mut driver, 64);
    let data: Vec<u8> = (0..64).collect();

    let mut frame = driver.begin_frame().unwrap().expect("frame");
    let allocation = frame.acquire_staging(64).unwrap();
    frame.write_staging(allocation, 0, &data).unwrap();
    frame
        .enqueue_resource_copy(allocation, destination, 64, 0, 0)
        .unwrap();
    frame.begin_render_pass(&ClearValues::default()).unwrap();
    frame.end_render_pass().unwrap();
    let report = frame.end().unwrap();
    assert_eq!(report.staged_copies, 1);
    assert_eq!(report.staging_buffers, 1);

    // Not visible until the submission completes.
    assert_eq!(driver.device().read_buffer(destination).unwrap(), &[0; 64]);
    driver.device_mut().poll().unwrap();
    assert_eq!(driver.device().read_buffer(destination).unwrap(), &data[..]);
}

#[test]
fn test_resource_stream_is_submitted_before_render_stream() {
    for copies in [0, 1, 7] {
        let mut driver = driver();
        let mut technique = Spinner::new(copies);
        driver.init_technique(&mut technique).unwrap();
        driver.device_mut().take_events();

        for _ in 0..3 {
            let report = driver.run_frame(&mut technique).unwrap().expect("frame");
            assert_eq!(report.staged_copies, copies);
        }

        let batches = submitted_labels(&driver.device_mut().take_events());
        assert_eq!(batches.len(), 3, "one submission per frame");
        for labels in batches {
            assert_eq!(labels, [RESOURCE_STREAM_LABEL, RENDER_STREAM_LABEL]);
        }
    }
}

#[test]
fn test_staging_is_unmapped_before_submit_and_remapped_after() {
    let mut driver = driver();
    let mut technique = Spinner::new(3);
    driver.init_technique(&mut technique).unwrap();
    driver.device_mut().take_events();

    driver.run_frame(&mut technique).unwrap();
    let events = driver.device_mut().take_events();

    let submitted = position(&events, |e| matches!(e, DeviceEvent::Submitted { .. }));
    let presented = position(&events, |e| matches!(e, DeviceEvent::Presented(_)));
    let unmapped: Vec<usize> = (0..events.len())
        .filter(|&i| matches!(events[i], DeviceEvent::BufferUnmapped(_)))
        .collect();
    let remapped: Vec<usize> = (0..events.len())
        .filter(|&i| matches!(events[i], DeviceEvent::MapRequested(_)))
        .collect();

    assert_eq!(unmapped.len(), 3);
    assert_eq!(remapped.len(), 3);
    assert!(unmapped.iter().all(|&i| i < submitted));
    assert!(remapped.iter().all(|&i| i > submitted && i < presented));
}

#[test]
fn test_each_acquisition_goes_in_flight_and_returns_once() {
    const N: usize = 5;
    let mut driver = driver();
    let destination = uniform_buffer(&mut driver, 64);

    let mut frame = driver.begin_frame().unwrap().expect("frame");
    let mut buffers = HashSet::new();
    for _ in 0..N {
        let allocation = frame
            .stage_uniform(destination, &TransformUniform::default())
            .unwrap();
        buffers.insert(allocation.buffer());
    }
    let report = frame.end().unwrap();
    assert_eq!(report.staging_buffers, N);
    assert_eq!(buffers.len(), N);

    let stats = driver.staging_pool().stats();
    assert_eq!(stats.in_flight, N);
    assert_eq!(stats.active, 0);

    // The next frame drains the completions and reuses one buffer.
    let mut frame = driver.begin_frame().unwrap().expect("frame");
    assert_eq!(frame.staging_stats().free, N);
    frame.acquire_staging(4).unwrap();
    frame.end().unwrap();

    let stats = driver.staging_pool().stats();
    assert_eq!(stats.buffers, N);
    assert_eq!(stats.created, N as u64);
    assert_eq!((stats.free, stats.in_flight), (N - 1, 1));

    // Every buffer can be handed out again exactly once without growing.
    let mut frame = driver.begin_frame().unwrap().expect("frame");
    let mut reused = HashSet::new();
    for _ in 0..N {
        reused.insert(frame.acquire_staging(64).unwrap().buffer());
    }
    let extra = frame.acquire_staging(64).unwrap().buffer();
    frame.end().unwrap();

    assert_eq!(reused, buffers);
    assert!(!buffers.contains(&extra));
    assert_eq!(driver.staging_pool().stats().created, N as u64 + 1);
}

#[test]
fn test_reuse_is_lifo() {
    let mut driver = driver();
    let destination = uniform_buffer(&mut driver, 64);

    let mut frame = driver.begin_frame().unwrap().expect("frame");
    let first = frame
        .stage_uniform(destination, &TransformUniform::default())
        .unwrap()
        .buffer();
    let second = frame
        .stage_uniform(destination, &TransformUniform::default())
        .unwrap()
        .buffer();
    frame.end().unwrap();

    // Completions arrive in request order: `first` is freed before `second`.
    let mut frame = driver.begin_frame().unwrap().expect("frame");
    assert_eq!(frame.acquire_staging(64).unwrap().buffer(), second);
    assert_eq!(frame.acquire_staging(64).unwrap().buffer(), first);
    frame.end().unwrap();
}

#[test]
fn test_pool_grows_to_two_then_reuses() {
    let mut driver = driver();
    let mut technique = Spinner::new(1);
    driver.init_technique(&mut technique).unwrap();

    // A busy GPU keeps frame 1's buffer in flight during frame 2.
    driver.device_mut().hold_completions(true);
    driver.run_frame(&mut technique).unwrap();
    driver.run_frame(&mut technique).unwrap();
    let stats = driver.staging_pool().stats();
    assert_eq!(stats.buffers, 2);
    assert_eq!(stats.in_flight, 2);
    assert_eq!(
        driver.device().buffer_count_by_usage(BufferUsage::Staging),
        2
    );

    driver.device_mut().hold_completions(false);
    driver.device_mut().poll().unwrap();
    let mut frame = driver.begin_frame().unwrap().expect("frame");
    let stats = frame.staging_stats();
    assert_eq!((stats.buffers, stats.free), (2, 2));
    technique.render(&mut frame).unwrap();
    frame.end().unwrap();

    let stats = driver.staging_pool().stats();
    assert_eq!(stats.buffers, 2);
    assert_eq!(stats.created, 2);
    assert_eq!(stats.reused, 1);
}

#[test]
fn test_resize_rebuilds_once_at_next_frame() {
    let mut driver = driver();
    let mut technique = Spinner::new(1);
    driver.init_technique(&mut technique).unwrap();

    driver.run_frame(&mut technique).unwrap();
    assert_eq!(driver.attachments().rebuild_count(), 1);

    driver.resize(LARGE);
    assert_eq!(driver.attachments().rebuild_count(), 1);
    assert_eq!(driver.attachments().size(), Some(SMALL));

    driver.device_mut().take_events();
    let frame = driver.begin_frame().unwrap().expect("frame");
    assert_eq!(frame.size(), LARGE);
    drop(frame);
    let events = driver.device_mut().take_events();
    assert_eq!(driver.attachments().rebuild_count(), 2);
    assert_eq!(driver.attachments().size(), Some(LARGE));

    let resized = position(&events, |e| matches!(e, DeviceEvent::SurfaceResized(s) if *s == LARGE));
    let acquired = position(&events, |e| matches!(e, DeviceEvent::BackbufferAcquired(_)));
    let rebuilt = position(&events, |e| {
        matches!(e, DeviceEvent::TextureCreated { width: 1600, height: 1200, .. })
    });
    assert!(resized < acquired && acquired < rebuilt);

    driver.run_frame(&mut technique).unwrap();
    driver.run_frame(&mut technique).unwrap();
    assert_eq!(driver.attachments().rebuild_count(), 2);
}

#[test]
fn test_repeated_sizes_never_rebuild() {
    let mut driver = driver();
    let mut technique = Spinner::new(0);
    driver.init_technique(&mut technique).unwrap();

    let sizes = [SMALL, SMALL, LARGE, LARGE, LARGE, SMALL, LARGE, LARGE];
    let mut expected = 0;
    let mut last = None;
    for size in sizes {
        driver.resize(size);
        driver.run_frame(&mut technique).unwrap();
        if last != Some(size) {
            expected += 1;
            last = Some(size);
        }
        assert_eq!(driver.attachments().rebuild_count(), expected);
    }
    assert_eq!(driver.device().texture_count(), 1);
}

#[test]
fn test_empty_framebuffer_produces_no_frame() {
    let mut driver = driver();
    let mut technique = Spinner::new(1);
    driver.init_technique(&mut technique).unwrap();

    driver.resize(FramebufferSize::new(0, 600));
    assert!(driver.run_frame(&mut technique).unwrap().is_none());
    assert_eq!(driver.device().last_submitted().0, 0);

    driver.resize(SMALL);
    let report = driver.run_frame(&mut technique).unwrap().expect("frame");
    assert_eq!(report.index, 1);
}

#[test]
fn test_lost_surface_is_retryable() {
    let mut driver = driver();
    let mut technique = Spinner::new(1);
    driver.init_technique(&mut technique).unwrap();

    driver.device_mut().lose_surface();
    let err = driver.run_frame(&mut technique).unwrap_err();
    assert!(matches!(err, FrameError::SwapchainUnavailable));
    assert!(!err.is_fatal());
    assert_eq!(driver.device().last_submitted().0, 0);
    assert_eq!(driver.staging_pool().stats().buffers, 0);

    driver.device_mut().restore_surface();
    assert!(driver.run_frame(&mut technique).unwrap().is_some());
}

#[test]
fn test_surface_lost_at_present_is_retryable() {
    let mut driver = driver();
    let destination = uniform_buffer(&mut driver, 64);
    driver.device_mut().take_events();

    let mut frame = driver.begin_frame().unwrap().expect("frame");
    frame
        .stage_uniform(destination, &TransformUniform::default())
        .unwrap();
    frame.device().lose_surface();
    let err = frame.end().unwrap_err();
    assert!(matches!(err, FrameError::SwapchainUnavailable));
    assert!(!err.is_fatal());

    let events = driver.device_mut().take_events();
    assert_eq!(submitted_labels(&events).len(), 1);
    assert!(events.iter().any(|e| matches!(e, DeviceEvent::BackbufferReleased(_))));

    driver.device_mut().restore_surface();
    let mut technique = Spinner::new(1);
    driver.init_technique(&mut technique).unwrap();
    assert!(driver.run_frame(&mut technique).unwrap().is_some());
}

#[test]
fn test_failed_submit_discards_finished_command_buffers() {
    let mut driver = driver();
    let mut technique = Spinner::new(1);
    driver.init_technique(&mut technique).unwrap();

    driver.device_mut().fail_next_submit();
    let err = driver.run_frame(&mut technique).unwrap_err();
    assert!(matches!(err, FrameError::Rhi(RhiError::DeviceLost)));
    assert_eq!(driver.device().command_buffer_count(), 0);
    assert_eq!(driver.device().last_submitted().0, 0);

    let report = driver.run_frame(&mut technique).unwrap().expect("frame");
    assert_eq!(report.staged_copies, 1);
    assert_eq!(driver.device().command_buffer_count(), 0);
    let stats = driver.staging_pool().stats();
    assert_eq!(stats.buffers, 1);
    assert_eq!(stats.reused, 1);
}

#[test]
fn test_failed_surface_resize_stays_pending() {
    let mut driver = driver();
    let mut technique = Spinner::new(0);
    driver.init_technique(&mut technique).unwrap();
    driver.run_frame(&mut technique).unwrap();

    driver.resize(LARGE);
    driver.device_mut().fail_next_resize();
    assert!(driver.run_frame(&mut technique).is_err());
    assert_eq!(driver.device().surface_size(), SMALL);

    driver.run_frame(&mut technique).unwrap().expect("frame");
    assert_eq!(driver.device().surface_size(), LARGE);
    assert_eq!(driver.attachments().size(), Some(LARGE));
}

#[test]
fn test_attachment_failure_is_fatal_and_releases_backbuffer() {
    let mut driver = driver();
    let mut technique = Spinner::new(1);
    driver.init_technique(&mut technique).unwrap();
    driver.run_frame(&mut technique).unwrap();

    driver.resize(LARGE);
    driver.device_mut().fail_texture_allocations(true);
    driver.device_mut().take_events();
    let err = driver.run_frame(&mut technique).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, FrameError::Rhi(RhiError::OutOfMemory(_))));

    let events = driver.device_mut().take_events();
    assert!(events.iter().any(|e| matches!(e, DeviceEvent::BackbufferReleased(_))));
    assert!(submitted_labels(&events).is_empty());

    driver.device_mut().fail_texture_allocations(false);
    assert!(driver.run_frame(&mut technique).unwrap().is_some());
    assert_eq!(driver.attachments().size(), Some(LARGE));
}

#[test]
fn test_dropped_frame_submits_nothing() {
    let mut driver = driver();
    let destination = uniform_buffer(&mut driver, 64);
    driver.device_mut().take_events();

    let mut frame = driver.begin_frame().unwrap().expect("frame");
    let staged = frame
        .stage_uniform(destination, &TransformUniform::default())
        .unwrap()
        .buffer();
    drop(frame);

    let events = driver.device_mut().take_events();
    assert!(submitted_labels(&events).is_empty());
    assert!(events.iter().any(|e| matches!(e, DeviceEvent::BackbufferReleased(_))));
    assert_eq!(
        driver.staging_pool().state(staged),
        Some(StagingState::Free)
    );

    let mut frame = driver.begin_frame().unwrap().expect("frame");
    assert_eq!(frame.acquire_staging(64).unwrap().buffer(), staged);
    frame.end().unwrap();
}

#[test]
fn test_technique_error_aborts_frame() {
    let mut driver = driver();
    let mut technique = Failing;
    driver.init_technique(&mut technique).unwrap();

    let err = driver.run_frame(&mut technique).unwrap_err();
    assert!(matches!(err, FrameError::RenderPass(_)));
    assert_eq!(driver.device().last_submitted().0, 0);
    assert_eq!(driver.staging_pool().stats().free, 1);

    // The backbuffer went back, so the next frame can start.
    assert!(driver.begin_frame().unwrap().is_some());
}

#[test]
fn test_end_with_open_render_pass_is_rejected() {
    let mut driver = driver();
    let mut frame = driver.begin_frame().unwrap().expect("frame");
    frame.begin_render_pass(&ClearValues::default()).unwrap();
    assert!(matches!(
        frame.begin_render_pass(&ClearValues::default()),
        Err(FrameError::RenderPass(_))
    ));

    let err = frame.end().unwrap_err();
    assert!(matches!(err, FrameError::RenderPass(_)));
    assert_eq!(driver.device().last_submitted().0, 0);
}

#[test]
fn test_copy_validation() {
    let mut driver = driver();
    let destination = uniform_buffer(&mut driver, 64);
    let mut frame = driver.begin_frame().unwrap().expect("frame");
    let allocation = frame.acquire_staging(32).unwrap();

    assert!(matches!(
        frame.enqueue_resource_copy(allocation, destination, 6, 0, 0),
        Err(FrameError::Misaligned(_))
    ));
    assert!(matches!(
        frame.enqueue_resource_copy(allocation, destination, 64, 0, 0),
        Err(FrameError::StagingOverflow { .. })
    ));
    assert!(matches!(
        frame.write_staging(allocation, 30, &[0; 4]),
        Err(FrameError::StagingOverflow { .. })
    ));
    assert!(matches!(
        frame.acquire_staging(1 << 20),
        Err(FrameError::StagingOverflow { .. })
    ));
    frame
        .enqueue_resource_copy(allocation, destination, 32, 0, 32)
        .unwrap();
    frame.end().unwrap();
}

#[test]
fn test_failed_remap_leaks_buffer() {
    let mut driver = driver();
    let mut technique = Spinner::new(1);
    driver.init_technique(&mut technique).unwrap();

    driver.device_mut().fail_next_maps(1);
    driver.run_frame(&mut technique).unwrap();
    driver.run_frame(&mut technique).unwrap();

    let stats = driver.staging_pool().stats();
    assert_eq!(stats.leaked, 1);
    assert_eq!(stats.buffers, 2);
    assert_eq!(stats.reused, 0);

    driver.run_frame(&mut technique).unwrap();
    let stats = driver.staging_pool().stats();
    assert_eq!(stats.buffers, 2);
    assert_eq!(stats.reused, 1);
}

#[test]
fn test_shutdown_drain_releases_everything() {
    let mut driver = driver();
    let mut technique = Spinner::new(2);
    driver.init_technique(&mut technique).unwrap();
    driver.device_mut().hold_completions(true);
    for _ in 0..3 {
        driver.run_frame(&mut technique).unwrap();
    }
    assert_eq!(driver.staging_pool().stats().in_flight, 6);

    driver.shutdown(&mut technique).unwrap();
    let device = driver.device();
    assert_eq!(device.buffer_count(), 0);
    assert_eq!(device.texture_count(), 0);
    assert_eq!(device.view_count(), 0);
    assert_eq!(device.pending_maps(), 0);
    assert_eq!(device.pending_submissions(), 0);
}

#[test]
fn test_shutdown_detach_leaves_in_flight_buffers() {
    let config = Config {
        shutdown: ShutdownPolicy::Detach,
        ..Config::default()
    };
    let mut driver = driver_with(config);
    assert_eq!(driver.shutdown_policy(), ShutdownPolicy::Detach);
    let mut technique = Spinner::new(0);
    driver.init_technique(&mut technique).unwrap();
    let destination = uniform_buffer(&mut driver, 64);
    let value = TransformUniform::default();

    let mut frame = driver.begin_frame().unwrap().expect("frame");
    let first = frame.stage_uniform(destination, &value).unwrap().buffer();
    let second = frame.stage_uniform(destination, &value).unwrap().buffer();
    frame.end().unwrap();
    driver.device_mut().poll().unwrap();

    // `second` goes back to a busy GPU; `first` stays free.
    driver.device_mut().hold_completions(true);
    let mut frame = driver.begin_frame().unwrap().expect("frame");
    assert_eq!(frame.stage_uniform(destination, &value).unwrap().buffer(), second);
    frame.end().unwrap();
    assert_eq!(driver.staging_pool().state(first), Some(StagingState::Free));
    assert_eq!(driver.staging_pool().state(second), Some(StagingState::InFlight));

    driver.shutdown(&mut technique).unwrap();
    assert!(driver.device().read_buffer(first).is_none());
    assert!(driver.device().read_buffer(second).is_some());
    assert_eq!(driver.staging_pool().stats().buffers, 0);
}

#[test]
fn test_frame_indices_count_up() {
    let mut driver = driver();
    let mut technique = Spinner::new(1);
    driver.init_technique(&mut technique).unwrap();
    let indices: Vec<u64> = (0..4)
        .map(|_| driver.run_frame(&mut technique).unwrap().expect("frame").index)
        .collect();
    assert_eq!(indices, [1, 2, 3, 4]);
    assert_eq!(driver.frame_index(), 4);
}

//! CPU-backed device.
//!
//! [`HeadlessDevice`] implements [`GpuDevice`] without a GPU. Buffers are
//! byte vectors, submissions queue up until [`GpuDevice::poll`] retires them,
//! and copies execute at retirement in submission order. It keeps an ordered
//! [`DeviceEvent`] log and offers fault injection, which makes it the device
//! of choice for tests and headless runs.

use std::collections::{HashMap, VecDeque};

use stagehand_core::FramebufferSize;
use tracing::{debug, info, warn};

use crate::device::{CopyEndpoint, GpuDevice, validate_copy};
use crate::error::{RhiError, RhiResult};
use crate::types::{
    BufferDesc, BufferId, BufferUsage, CommandBufferId, EncoderId, IdAllocator, MapCallback,
    MapError, MapMode, RenderPassDesc, SubmissionIndex, TextureDesc, TextureFormat, TextureId,
    TextureViewId,
};

/// Something observable that happened on a [`HeadlessDevice`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    BufferCreated {
        buffer: BufferId,
        usage: BufferUsage,
        size: u64,
    },
    BufferDestroyed(BufferId),
    BufferUnmapped(BufferId),
    MapRequested(BufferId),
    MapCompleted {
        buffer: BufferId,
        ok: bool,
    },
    TextureCreated {
        texture: TextureId,
        width: u32,
        height: u32,
        format: TextureFormat,
    },
    TextureDestroyed(TextureId),
    ViewCreated(TextureViewId),
    ViewReleased(TextureViewId),
    BackbufferAcquired(TextureViewId),
    BackbufferReleased(TextureViewId),
    Presented(TextureViewId),
    SurfaceResized(FramebufferSize),
    /// A batch of command buffers, identified by their encoder labels in
    /// execution order.
    Submitted {
        index: SubmissionIndex,
        labels: Vec<String>,
    },
    Retired(SubmissionIndex),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MapState {
    Unmapped,
    Mapped,
    Pending,
}

struct BufferEntry {
    data: Vec<u8>,
    usage: BufferUsage,
    map: MapState,
    last_use: Option<SubmissionIndex>,
}

struct TextureEntry {
    width: u32,
    height: u32,
    views: usize,
}

#[derive(Clone, Copy)]
enum ViewTarget {
    Texture(TextureId),
    Backbuffer,
}

#[derive(Clone, Copy, Debug)]
enum Command {
    Copy {
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    },
    RenderPass,
}

struct Recording {
    label: String,
    commands: Vec<Command>,
    in_pass: bool,
}

struct Finished {
    label: String,
    commands: Vec<Command>,
}

struct PendingSubmission {
    index: SubmissionIndex,
    batches: Vec<Finished>,
}

struct PendingMap {
    buffer: BufferId,
    after: Option<SubmissionIndex>,
    callback: MapCallback,
}

/// A [`GpuDevice`] that runs entirely on the CPU.
pub struct HeadlessDevice {
    ids: IdAllocator,
    buffers: HashMap<BufferId, BufferEntry>,
    textures: HashMap<TextureId, TextureEntry>,
    views: HashMap<TextureViewId, ViewTarget>,
    encoders: HashMap<EncoderId, Recording>,
    command_buffers: HashMap<CommandBufferId, Finished>,
    pending: VecDeque<PendingSubmission>,
    maps: Vec<PendingMap>,
    last_submitted: SubmissionIndex,
    completed: SubmissionIndex,
    backbuffer: Option<TextureViewId>,
    surface_size: FramebufferSize,
    surface_lost: bool,
    hold: bool,
    failing_maps: u32,
    failing_textures: bool,
    failing_submit: bool,
    failing_resize: bool,
    events: Vec<DeviceEvent>,
}

impl HeadlessDevice {
    /// Creates a device whose surface has the given size.
    pub fn new(surface_size: FramebufferSize) -> Self {
        info!("Headless device created ({})", surface_size);
        Self {
            ids: IdAllocator::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            views: HashMap::new(),
            encoders: HashMap::new(),
            command_buffers: HashMap::new(),
            pending: VecDeque::new(),
            maps: Vec::new(),
            last_submitted: SubmissionIndex::default(),
            completed: SubmissionIndex::default(),
            backbuffer: None,
            surface_size,
            surface_lost: false,
            hold: false,
            failing_maps: 0,
            failing_textures: false,
            failing_submit: false,
            failing_resize: false,
            events: Vec::new(),
        }
    }

    /// While held, `poll` retires nothing, as if the GPU were still busy.
    /// `wait_idle` ignores the hold.
    pub fn hold_completions(&mut self, hold: bool) {
        self.hold = hold;
    }

    /// Makes the next `count` map requests complete with an error.
    pub fn fail_next_maps(&mut self, count: u32) {
        self.failing_maps = count;
    }

    /// Makes texture creation fail with an out-of-memory error.
    pub fn fail_texture_allocations(&mut self, fail: bool) {
        self.failing_textures = fail;
    }

    /// Makes the next submission fail as if the device were lost.
    pub fn fail_next_submit(&mut self) {
        self.failing_submit = true;
    }

    /// Makes the next surface resize fail.
    pub fn fail_next_resize(&mut self) {
        self.failing_resize = true;
    }

    /// Simulates losing the presentation surface.
    pub fn lose_surface(&mut self) {
        warn!("Headless surface lost");
        self.surface_lost = true;
    }

    pub fn restore_surface(&mut self) {
        self.surface_lost = false;
    }

    /// Ordered log of everything the device did.
    pub fn events(&self) -> &[DeviceEvent] {
        &self.events
    }

    /// Returns and clears the event log.
    pub fn take_events(&mut self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.events)
    }

    /// Buffer contents regardless of map state.
    pub fn read_buffer(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|entry| entry.data.as_slice())
    }

    /// Number of live buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of live buffers with the given usage.
    pub fn buffer_count_by_usage(&self, usage: BufferUsage) -> usize {
        self.buffers.values().filter(|b| b.usage == usage).count()
    }

    /// Finished command buffers neither submitted nor discarded.
    pub fn command_buffer_count(&self) -> usize {
        self.command_buffers.len()
    }

    /// Number of live textures.
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Size of a live texture.
    pub fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.textures.get(&texture).map(|t| (t.width, t.height))
    }

    /// Number of live views, the acquired backbuffer included.
    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Submissions not yet retired.
    pub fn pending_submissions(&self) -> usize {
        self.pending.len()
    }

    /// Map requests whose callback has not run.
    pub fn pending_maps(&self) -> usize {
        self.maps.len()
    }

    pub fn last_submitted(&self) -> SubmissionIndex {
        self.last_submitted
    }

    pub fn completed_submission(&self) -> SubmissionIndex {
        self.completed
    }

    pub fn surface_size(&self) -> FramebufferSize {
        self.surface_size
    }

    fn buffer(&self, buffer: BufferId) -> RhiResult<&BufferEntry> {
        self.buffers
            .get(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(buffer.to_string()))
    }

    fn buffer_mut(&mut self, buffer: BufferId) -> RhiResult<&mut BufferEntry> {
        self.buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(buffer.to_string()))
    }

    fn recording(&mut self, encoder: EncoderId) -> RhiResult<&mut Recording> {
        self.encoders
            .get_mut(&encoder)
            .ok_or_else(|| RhiError::InvalidHandle(encoder.to_string()))
    }

    fn execute(&mut self, command: Command) {
        let Command::Copy {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        } = command
        else {
            return;
        };

        // Validated at record time; buffers destroyed since then are skipped.
        let bytes = match self.buffers.get(&src) {
            Some(entry) => {
                let start = src_offset as usize;
                entry.data[start..start + size as usize].to_vec()
            }
            None => {
                warn!("Copy source {} destroyed before execution", src);
                return;
            }
        };
        match self.buffers.get_mut(&dst) {
            Some(entry) => {
                let start = dst_offset as usize;
                entry.data[start..start + bytes.len()].copy_from_slice(&bytes);
            }
            None => warn!("Copy destination {} destroyed before execution", dst),
        }
    }

    fn retire_all(&mut self) {
        while let Some(submission) = self.pending.pop_front() {
            for batch in &submission.batches {
                for &command in &batch.commands {
                    self.execute(command);
                }
            }
            self.completed = submission.index;
            self.events.push(DeviceEvent::Retired(submission.index));
        }
    }

    fn set_map_state(&mut self, buffer: BufferId, state: MapState) {
        if let Some(entry) = self.buffers.get_mut(&buffer) {
            entry.map = state;
        }
    }

    fn fire_ready_maps(&mut self) {
        let completed = self.completed;
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.maps)
            .into_iter()
            .partition(|map| map.after.is_none_or(|after| after <= completed));
        self.maps = waiting;

        for map in ready {
            let result = if !self.buffers.contains_key(&map.buffer) {
                Err(MapError::Destroyed)
            } else if self.failing_maps > 0 {
                self.failing_maps -= 1;
                self.set_map_state(map.buffer, MapState::Unmapped);
                Err(MapError::Rejected("injected map failure".to_string()))
            } else {
                self.set_map_state(map.buffer, MapState::Mapped);
                Ok(())
            };
            debug!("Map of {} completed: {:?}", map.buffer, result);
            self.events.push(DeviceEvent::MapCompleted {
                buffer: map.buffer,
                ok: result.is_ok(),
            });
            (map.callback)(result);
        }
    }
}

impl GpuDevice for HeadlessDevice {
    fn backend_name(&self) -> &'static str {
        "headless"
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> RhiResult<BufferId> {
        if desc.size == 0 {
            return Err(RhiError::InvalidState(format!(
                "buffer '{}' has zero size",
                desc.label
            )));
        }
        if desc.mapped_at_creation && !desc.usage.is_mappable() {
            return Err(RhiError::InvalidState(format!(
                "{} buffer '{}' cannot be mapped",
                desc.usage.name(),
                desc.label
            )));
        }

        let id = BufferId::from_raw(self.ids.next_raw());
        self.buffers.insert(
            id,
            BufferEntry {
                data: vec![0; desc.size as usize],
                usage: desc.usage,
                map: if desc.mapped_at_creation {
                    MapState::Mapped
                } else {
                    MapState::Unmapped
                },
                last_use: None,
            },
        );
        debug!(
            "Created {} buffer '{}' ({}, {} bytes)",
            desc.usage.name(),
            desc.label,
            id,
            desc.size
        );
        self.events.push(DeviceEvent::BufferCreated {
            buffer: id,
            usage: desc.usage,
            size: desc.size,
        });
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> RhiResult<()> {
        self.buffers
            .remove(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(buffer.to_string()))?;
        // A pending map resolves with `MapError::Destroyed` at the next poll.
        for map in &mut self.maps {
            if map.buffer == buffer {
                map.after = None;
            }
        }
        debug!("Destroyed {}", buffer);
        self.events.push(DeviceEvent::BufferDestroyed(buffer));
        Ok(())
    }

    fn mapped_range_mut(
        &mut self,
        buffer: BufferId,
        offset: u64,
        size: u64,
    ) -> RhiResult<&mut [u8]> {
        let entry = self.buffer_mut(buffer)?;
        if entry.map != MapState::Mapped {
            return Err(RhiError::InvalidState(format!("{} is not mapped", buffer)));
        }
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= entry.data.len() as u64)
            .ok_or_else(|| {
                RhiError::InvalidState(format!(
                    "range {}+{} outside {} ({} bytes)",
                    offset,
                    size,
                    buffer,
                    entry.data.len()
                ))
            })?;
        Ok(&mut entry.data[offset as usize..end as usize])
    }

    fn unmap_buffer(&mut self, buffer: BufferId) -> RhiResult<()> {
        let entry = self.buffer_mut(buffer)?;
        if entry.map != MapState::Mapped {
            return Err(RhiError::InvalidState(format!(
                "unmap of {} which is not mapped",
                buffer
            )));
        }
        entry.map = MapState::Unmapped;
        self.events.push(DeviceEvent::BufferUnmapped(buffer));
        Ok(())
    }

    fn map_buffer_async(
        &mut self,
        buffer: BufferId,
        _mode: MapMode,
        offset: u64,
        size: u64,
        callback: MapCallback,
    ) -> RhiResult<()> {
        let entry = self.buffer_mut(buffer)?;
        if entry.map != MapState::Unmapped {
            return Err(RhiError::InvalidState(format!(
                "map requested for {} while {:?}",
                buffer, entry.map
            )));
        }
        if offset.checked_add(size).is_none_or(|end| end > entry.data.len() as u64) {
            return Err(RhiError::InvalidState(format!(
                "map range {}+{} outside {}",
                offset, size, buffer
            )));
        }
        entry.map = MapState::Pending;
        let after = entry.last_use;
        self.maps.push(PendingMap {
            buffer,
            after,
            callback,
        });
        self.events.push(DeviceEvent::MapRequested(buffer));
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> RhiResult<TextureId> {
        if self.failing_textures {
            return Err(RhiError::OutOfMemory(format!(
                "texture '{}' ({}x{})",
                desc.label, desc.width, desc.height
            )));
        }
        if desc.width == 0 || desc.height == 0 {
            return Err(RhiError::InvalidState(format!(
                "texture '{}' has zero extent",
                desc.label
            )));
        }

        let id = TextureId::from_raw(self.ids.next_raw());
        self.textures.insert(
            id,
            TextureEntry {
                width: desc.width,
                height: desc.height,
                views: 0,
            },
        );
        self.events.push(DeviceEvent::TextureCreated {
            texture: id,
            width: desc.width,
            height: desc.height,
            format: desc.format,
        });
        Ok(id)
    }

    fn create_texture_view(&mut self, texture: TextureId) -> RhiResult<TextureViewId> {
        let entry = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| RhiError::InvalidHandle(texture.to_string()))?;
        entry.views += 1;

        let id = TextureViewId::from_raw(self.ids.next_raw());
        self.views.insert(id, ViewTarget::Texture(texture));
        self.events.push(DeviceEvent::ViewCreated(id));
        Ok(id)
    }

    fn release_texture_view(&mut self, view: TextureViewId) -> RhiResult<()> {
        match self.views.get(&view) {
            Some(ViewTarget::Texture(texture)) => {
                let texture = *texture;
                self.views.remove(&view);
                if let Some(entry) = self.textures.get_mut(&texture) {
                    entry.views = entry.views.saturating_sub(1);
                }
                self.events.push(DeviceEvent::ViewReleased(view));
                Ok(())
            }
            Some(ViewTarget::Backbuffer) => Err(RhiError::InvalidState(format!(
                "{} is the backbuffer; present or release it instead",
                view
            ))),
            None => Err(RhiError::InvalidHandle(view.to_string())),
        }
    }

    fn destroy_texture(&mut self, texture: TextureId) -> RhiResult<()> {
        let entry = self
            .textures
            .get(&texture)
            .ok_or_else(|| RhiError::InvalidHandle(texture.to_string()))?;
        if entry.views > 0 {
            return Err(RhiError::InvalidState(format!(
                "{} destroyed with {} live view(s)",
                texture, entry.views
            )));
        }
        self.textures.remove(&texture);
        self.events.push(DeviceEvent::TextureDestroyed(texture));
        Ok(())
    }

    fn create_command_encoder(&mut self, label: &str) -> RhiResult<EncoderId> {
        let id = EncoderId::from_raw(self.ids.next_raw());
        self.encoders.insert(
            id,
            Recording {
                label: label.to_string(),
                commands: Vec::new(),
                in_pass: false,
            },
        );
        Ok(id)
    }

    fn copy_buffer_to_buffer(
        &mut self,
        encoder: EncoderId,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        let src_entry = self.buffer(src)?;
        let dst_entry = self.buffer(dst)?;
        validate_copy(
            CopyEndpoint {
                size: src_entry.data.len() as u64,
                usage: src_entry.usage,
                offset: src_offset,
            },
            CopyEndpoint {
                size: dst_entry.data.len() as u64,
                usage: dst_entry.usage,
                offset: dst_offset,
            },
            size,
        )?;

        let recording = self.recording(encoder)?;
        if recording.in_pass {
            return Err(RhiError::InvalidState(format!(
                "copy recorded inside a render pass on '{}'",
                recording.label
            )));
        }
        recording.commands.push(Command::Copy {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
        Ok(())
    }

    fn begin_render_pass(&mut self, encoder: EncoderId, desc: &RenderPassDesc) -> RhiResult<()> {
        if !self.views.contains_key(&desc.color_view) {
            return Err(RhiError::InvalidHandle(desc.color_view.to_string()));
        }
        if let Some(depth) = &desc.depth_stencil
            && !self.views.contains_key(&depth.view)
        {
            return Err(RhiError::InvalidHandle(depth.view.to_string()));
        }

        let recording = self.recording(encoder)?;
        if recording.in_pass {
            return Err(RhiError::InvalidState(format!(
                "render pass already open on '{}'",
                recording.label
            )));
        }
        recording.in_pass = true;
        recording.commands.push(Command::RenderPass);
        Ok(())
    }

    fn end_render_pass(&mut self, encoder: EncoderId) -> RhiResult<()> {
        let recording = self.recording(encoder)?;
        if !recording.in_pass {
            return Err(RhiError::InvalidState(format!(
                "no render pass open on '{}'",
                recording.label
            )));
        }
        recording.in_pass = false;
        Ok(())
    }

    fn finish_encoder(&mut self, encoder: EncoderId) -> RhiResult<CommandBufferId> {
        let recording = self
            .encoders
            .remove(&encoder)
            .ok_or_else(|| RhiError::InvalidHandle(encoder.to_string()))?;
        if recording.in_pass {
            return Err(RhiError::InvalidState(format!(
                "'{}' finished with an open render pass",
                recording.label
            )));
        }

        let id = CommandBufferId::from_raw(self.ids.next_raw());
        self.command_buffers.insert(
            id,
            Finished {
                label: recording.label,
                commands: recording.commands,
            },
        );
        Ok(id)
    }

    fn discard_encoder(&mut self, encoder: EncoderId) {
        if let Some(recording) = self.encoders.remove(&encoder) {
            debug!(
                "Discarded encoder '{}' with {} command(s)",
                recording.label,
                recording.commands.len()
            );
        }
    }

    fn discard_command_buffer(&mut self, command_buffer: CommandBufferId) {
        if let Some(finished) = self.command_buffers.remove(&command_buffer) {
            debug!(
                "Discarded command buffer '{}' with {} command(s)",
                finished.label,
                finished.commands.len()
            );
        }
    }

    fn submit(&mut self, command_buffers: &[CommandBufferId]) -> RhiResult<SubmissionIndex> {
        if self.failing_submit {
            self.failing_submit = false;
            return Err(RhiError::DeviceLost);
        }
        for id in command_buffers {
            let finished = self
                .command_buffers
                .get(id)
                .ok_or_else(|| RhiError::InvalidHandle(id.to_string()))?;
            for command in &finished.commands {
                if let Command::Copy { src, dst, .. } = command {
                    for buffer in [src, dst] {
                        let entry = self.buffer(*buffer)?;
                        if entry.map != MapState::Unmapped {
                            return Err(RhiError::InvalidState(format!(
                                "{} used in a submission while {:?}",
                                buffer, entry.map
                            )));
                        }
                    }
                }
            }
        }

        let index = SubmissionIndex(self.last_submitted.0 + 1);
        let mut batches = Vec::with_capacity(command_buffers.len());
        for id in command_buffers {
            if let Some(finished) = self.command_buffers.remove(id) {
                for command in &finished.commands {
                    if let Command::Copy { src, dst, .. } = command {
                        for buffer in [src, dst] {
                            if let Some(entry) = self.buffers.get_mut(buffer) {
                                entry.last_use = Some(index);
                            }
                        }
                    }
                }
                batches.push(finished);
            }
        }

        self.last_submitted = index;
        let labels = batches.iter().map(|b| b.label.clone()).collect();
        self.events.push(DeviceEvent::Submitted { index, labels });
        self.pending.push_back(PendingSubmission { index, batches });
        Ok(index)
    }

    fn acquire_backbuffer(&mut self) -> RhiResult<TextureViewId> {
        if self.surface_lost || self.surface_size.is_empty() {
            return Err(RhiError::SwapchainUnavailable);
        }
        if let Some(view) = self.backbuffer {
            return Err(RhiError::InvalidState(format!(
                "backbuffer {} still held",
                view
            )));
        }

        let id = TextureViewId::from_raw(self.ids.next_raw());
        self.views.insert(id, ViewTarget::Backbuffer);
        self.backbuffer = Some(id);
        self.events.push(DeviceEvent::BackbufferAcquired(id));
        Ok(id)
    }

    fn present_backbuffer(&mut self, view: TextureViewId) -> RhiResult<()> {
        if self.backbuffer != Some(view) {
            return Err(RhiError::InvalidHandle(view.to_string()));
        }
        self.backbuffer = None;
        self.views.remove(&view);
        // The image goes back to the surface even when presenting fails.
        if self.surface_lost {
            self.events.push(DeviceEvent::BackbufferReleased(view));
            return Err(RhiError::SwapchainUnavailable);
        }
        self.events.push(DeviceEvent::Presented(view));
        Ok(())
    }

    fn release_backbuffer(&mut self, view: TextureViewId) -> RhiResult<()> {
        if self.backbuffer != Some(view) {
            return Err(RhiError::InvalidHandle(view.to_string()));
        }
        self.backbuffer = None;
        self.views.remove(&view);
        self.events.push(DeviceEvent::BackbufferReleased(view));
        Ok(())
    }

    fn resize_surface(&mut self, size: FramebufferSize) -> RhiResult<()> {
        if self.failing_resize {
            self.failing_resize = false;
            return Err(RhiError::SurfaceError(format!("resize to {} refused", size)));
        }
        self.surface_size = size;
        self.events.push(DeviceEvent::SurfaceResized(size));
        Ok(())
    }

    fn poll(&mut self) -> RhiResult<()> {
        if !self.hold {
            self.retire_all();
        }
        self.fire_ready_maps();
        Ok(())
    }

    fn wait_idle(&mut self) -> RhiResult<()> {
        self.retire_all();
        self.fire_ready_maps();
        Ok(())
    }
}

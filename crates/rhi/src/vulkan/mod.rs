//! Vulkan 1.3 backend.
//!
//! [`VulkanDevice`] implements [`GpuDevice`] on `ash`, `gpu-allocator` and
//! `ash-window`. Staging memory is persistently mapped host-visible memory,
//! so unmapping is a state change and a re-map completes once the fence of
//! the last submission using the buffer has signaled. Rendering uses dynamic
//! rendering; the swapchain is recreated lazily on the next acquire after a
//! resize or an out-of-date report.

mod commands;
mod device;
mod instance;
mod physical_device;
mod resources;
mod swapchain;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use stagehand_core::{Config, FramebufferSize};
use tracing::{debug, error, info, warn};

use self::commands::{
    OpenPass, Recorded, Recording, cmd_publish_transfers, cmd_transition_image_layout,
    cmd_wait_for_reads,
};
use self::resources::{BufferResource, Garbage, MapState, TextureResource};
use self::swapchain::Swapchain;
use crate::device::{CopyEndpoint, GpuDevice, validate_copy};
use crate::error::{RhiError, RhiResult};
use crate::types::{
    BufferDesc, BufferId, CommandBufferId, EncoderId, IdAllocator, MapCallback, MapError, MapMode,
    RenderPassDesc, SubmissionIndex, TextureDesc, TextureId, TextureViewId,
};

pub use self::device::LogicalDevice;
pub use self::instance::Instance;
pub use self::physical_device::{PhysicalDeviceInfo, QueueFamilyIndices, select_physical_device};

enum ViewEntry {
    Texture {
        texture: TextureId,
        view: vk::ImageView,
    },
    Backbuffer,
}

struct AcquiredImage {
    view: TextureViewId,
    image_index: u32,
    image_available: vk::Semaphore,
    /// A submission already waits on `image_available` and signals the
    /// image's render-finished semaphore.
    chained: bool,
}

struct InFlight {
    index: SubmissionIndex,
    fence: vk::Fence,
    command_buffers: Vec<vk::CommandBuffer>,
    semaphores: Vec<vk::Semaphore>,
}

struct PendingMap {
    buffer: BufferId,
    after: Option<SubmissionIndex>,
    callback: MapCallback,
}

/// A [`GpuDevice`] driving a real GPU and a window surface.
pub struct VulkanDevice {
    ids: IdAllocator,
    buffers: HashMap<BufferId, BufferResource>,
    textures: HashMap<TextureId, TextureResource>,
    views: HashMap<TextureViewId, ViewEntry>,
    encoders: HashMap<EncoderId, Recording>,
    recorded: HashMap<CommandBufferId, Recorded>,
    in_flight: VecDeque<InFlight>,
    maps: Vec<PendingMap>,
    graveyard: Vec<(SubmissionIndex, Garbage)>,
    last_submitted: SubmissionIndex,
    completed: SubmissionIndex,

    backbuffer: Option<AcquiredImage>,
    render_finished: Vec<vk::Semaphore>,
    free_semaphores: Vec<vk::Semaphore>,
    free_fences: Vec<vk::Fence>,
    command_pool: vk::CommandPool,

    swapchain: Option<Swapchain>,
    swapchain_dirty: bool,
    surface_size: FramebufferSize,
    vsync: bool,
    depth_stencil_format: vk::Format,

    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    // Declared before `instance` so the device is destroyed first.
    device: Arc<LogicalDevice>,
    instance: Instance,
}

impl VulkanDevice {
    /// Creates the instance, surface, device and command pool for a window.
    ///
    /// The swapchain is created on the first [`GpuDevice::acquire_backbuffer`].
    ///
    /// # Arguments
    ///
    /// * `display` / `window` - Raw handles of the target window
    /// * `size` - Current framebuffer size in physical pixels
    /// * `config` - Validation and vsync settings
    ///
    /// # Errors
    ///
    /// Returns an error if Vulkan cannot be loaded, no GPU qualifies, or any
    /// creation step fails.
    pub fn new(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        size: FramebufferSize,
        config: &Config,
    ) -> RhiResult<Self> {
        let instance = Instance::new(config.validation, display)?;
        let surface = unsafe {
            ash_window::create_surface(instance.entry(), instance.handle(), display, window, None)
                .map_err(|e| RhiError::SurfaceError(format!("surface creation failed: {}", e)))?
        };
        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        info!("Vulkan surface created");

        let destroy_surface = || unsafe { surface_loader.destroy_surface(surface, None) };

        let physical = select_physical_device(instance.handle(), surface, &surface_loader)
            .inspect_err(|_| destroy_surface())?;
        let device = Arc::new(
            LogicalDevice::new(&instance, &physical).inspect_err(|_| destroy_surface())?,
        );

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.graphics_family())
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.handle().create_command_pool(&pool_info, None) }
            .map_err(RhiError::from)
            .inspect_err(|_| destroy_surface())?;

        info!(
            "Vulkan device ready on '{}' ({})",
            physical.device_name(),
            size
        );

        Ok(Self {
            ids: IdAllocator::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            views: HashMap::new(),
            encoders: HashMap::new(),
            recorded: HashMap::new(),
            in_flight: VecDeque::new(),
            maps: Vec::new(),
            graveyard: Vec::new(),
            last_submitted: SubmissionIndex::default(),
            completed: SubmissionIndex::default(),
            backbuffer: None,
            render_finished: Vec::new(),
            free_semaphores: Vec::new(),
            free_fences: Vec::new(),
            command_pool,
            swapchain: None,
            swapchain_dirty: true,
            surface_size: size,
            vsync: config.vsync,
            depth_stencil_format: physical.depth_stencil_format,
            surface,
            surface_loader,
            device,
            instance,
        })
    }

    /// Depth/stencil format backing `TextureFormat::Depth24PlusStencil8`.
    pub fn depth_stencil_format(&self) -> vk::Format {
        self.depth_stencil_format
    }

    pub fn logical_device(&self) -> &Arc<LogicalDevice> {
        &self.device
    }

    fn take_semaphore(&mut self) -> RhiResult<vk::Semaphore> {
        if let Some(semaphore) = self.free_semaphores.pop() {
            return Ok(semaphore);
        }
        let info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.handle().create_semaphore(&info, None)? })
    }

    fn take_fence(&mut self) -> RhiResult<vk::Fence> {
        if let Some(fence) = self.free_fences.pop() {
            return Ok(fence);
        }
        let info = vk::FenceCreateInfo::default();
        Ok(unsafe { self.device.handle().create_fence(&info, None)? })
    }

    fn allocate_command_buffer(&self) -> RhiResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.handle().allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::InvalidState("no command buffer allocated".to_string()))
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        if !command_buffers.is_empty() {
            unsafe {
                self.device
                    .handle()
                    .free_command_buffers(self.command_pool, command_buffers)
            };
        }
    }

    /// Destroys `garbage` now if no pending submission can use it, otherwise
    /// once the latest submission retires.
    fn bury(&mut self, garbage: Garbage) {
        if self.last_submitted <= self.completed {
            garbage.destroy(&self.device);
        } else {
            self.graveyard.push((self.last_submitted, garbage));
        }
    }

    fn recreate_swapchain(&mut self) -> RhiResult<()> {
        self.device.wait_idle()?;
        self.retire_finished()?;

        let swapchain = Swapchain::new(
            &self.instance,
            self.device.clone(),
            self.surface,
            &self.surface_loader,
            self.surface_size.width,
            self.surface_size.height,
            self.vsync,
            self.swapchain.as_ref(),
        )?;
        let image_count = swapchain.image_count();
        self.swapchain = Some(swapchain);

        for semaphore in self.render_finished.drain(..) {
            unsafe { self.device.handle().destroy_semaphore(semaphore, None) };
        }
        for _ in 0..image_count {
            let info = vk::SemaphoreCreateInfo::default();
            let semaphore = unsafe { self.device.handle().create_semaphore(&info, None)? };
            self.render_finished.push(semaphore);
        }

        self.swapchain_dirty = false;
        Ok(())
    }

    fn retire_finished(&mut self) -> RhiResult<()> {
        while let Some(front) = self.in_flight.front() {
            let status = unsafe { self.device.handle().get_fence_status(front.fence) };
            match status {
                Ok(true) => {}
                Ok(false) => break,
                Err(vk::Result::ERROR_DEVICE_LOST) => return Err(RhiError::DeviceLost),
                Err(e) => return Err(e.into()),
            }

            let Some(done) = self.in_flight.pop_front() else {
                break;
            };
            unsafe { self.device.handle().reset_fences(&[done.fence])? };
            self.free_fences.push(done.fence);
            self.free_command_buffers(&done.command_buffers);
            self.free_semaphores.extend(done.semaphores);
            self.completed = done.index;
        }

        let completed = self.completed;
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.graveyard)
            .into_iter()
            .partition(|(index, _)| *index <= completed);
        self.graveyard = waiting;
        for (_, garbage) in ready {
            garbage.destroy(&self.device);
        }
        Ok(())
    }

    fn fire_ready_maps(&mut self) {
        let completed = self.completed;
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.maps)
            .into_iter()
            .partition(|map| map.after.is_none_or(|after| after <= completed));
        self.maps = waiting;

        for map in ready {
            let result = match self.buffers.get_mut(&map.buffer) {
                None => Err(MapError::Destroyed),
                Some(buffer) if !buffer.is_host_visible() => {
                    buffer.map = MapState::Unmapped;
                    Err(MapError::Rejected("memory is not host visible".to_string()))
                }
                Some(buffer) => {
                    buffer.map = MapState::Mapped;
                    Ok(())
                }
            };
            (map.callback)(result);
        }
    }

    /// Submits a transition-only command buffer that hands an untouched
    /// backbuffer to presentation.
    fn submit_present_transition(&mut self, image_index: u32, wait: vk::Semaphore) -> RhiResult<()> {
        let image = self
            .swapchain
            .as_ref()
            .and_then(|s| s.image(image_index))
            .ok_or(RhiError::SwapchainUnavailable)?;
        let signal = *self
            .render_finished
            .get(image_index as usize)
            .ok_or(RhiError::SwapchainUnavailable)?;

        let cb = self.allocate_command_buffer()?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.handle().begin_command_buffer(cb, &begin_info)? };
        cmd_transition_image_layout(
            &self.device,
            cb,
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageAspectFlags::COLOR,
        );
        unsafe { self.device.handle().end_command_buffer(cb)? };

        self.queue_submit(vec![cb], Some((wait, signal)))?;
        Ok(())
    }

    /// Submits command buffers with one fence, optionally chained to the
    /// backbuffer semaphores.
    fn queue_submit(
        &mut self,
        command_buffers: Vec<vk::CommandBuffer>,
        chain: Option<(vk::Semaphore, vk::Semaphore)>,
    ) -> RhiResult<SubmissionIndex> {
        let fence = self.take_fence()?;
        let wait: Vec<vk::Semaphore> = chain.iter().map(|(wait, _)| *wait).collect();
        let signal: Vec<vk::Semaphore> = chain.iter().map(|(_, signal)| *signal).collect();
        let stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait.len()];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal);

        let result = unsafe {
            self.device
                .handle()
                .queue_submit(self.device.graphics_queue(), &[submit_info], fence)
        };
        if let Err(e) = result {
            self.free_fences.push(fence);
            self.free_command_buffers(&command_buffers);
            return Err(match e {
                vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
                other => other.into(),
            });
        }

        let index = SubmissionIndex(self.last_submitted.0 + 1);
        self.last_submitted = index;
        self.in_flight.push_back(InFlight {
            index,
            fence,
            command_buffers,
            semaphores: wait,
        });
        Ok(index)
    }

    fn hand_back_backbuffer(&mut self, view: TextureViewId) -> RhiResult<()> {
        let acquired = match self.backbuffer.take() {
            Some(acquired) if acquired.view == view => acquired,
            other => {
                self.backbuffer = other;
                return Err(RhiError::InvalidHandle(view.to_string()));
            }
        };
        self.views.remove(&view);

        if !acquired.chained {
            self.submit_present_transition(acquired.image_index, acquired.image_available)?;
        }

        let (Some(swapchain), Some(&wait)) = (
            self.swapchain.as_ref(),
            self.render_finished.get(acquired.image_index as usize),
        ) else {
            return Err(RhiError::SwapchainUnavailable);
        };

        match swapchain.present(self.device.present_queue(), acquired.image_index, wait) {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("Swapchain suboptimal or out of date; recreating on next acquire");
                self.swapchain_dirty = true;
                Ok(())
            }
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
                self.swapchain_dirty = true;
                Err(RhiError::SwapchainUnavailable)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl GpuDevice for VulkanDevice {
    fn backend_name(&self) -> &'static str {
        "vulkan"
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> RhiResult<BufferId> {
        let resource = BufferResource::create(&self.device, desc)?;
        let id = BufferId::from_raw(self.ids.next_raw());
        self.buffers.insert(id, resource);
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> RhiResult<()> {
        let resource = self
            .buffers
            .remove(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(buffer.to_string()))?;
        for map in &mut self.maps {
            if map.buffer == buffer {
                map.after = None;
            }
        }
        self.bury(resource.into_garbage());
        debug!("Destroyed {}", buffer);
        Ok(())
    }

    fn mapped_range_mut(
        &mut self,
        buffer: BufferId,
        offset: u64,
        size: u64,
    ) -> RhiResult<&mut [u8]> {
        self.buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(buffer.to_string()))?
            .mapped_range(offset, size)
    }

    fn unmap_buffer(&mut self, buffer: BufferId) -> RhiResult<()> {
        let resource = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(buffer.to_string()))?;
        if resource.map != MapState::Mapped {
            return Err(RhiError::InvalidState(format!(
                "unmap of {} which is not mapped",
                buffer
            )));
        }
        // Host-coherent and persistently mapped: nothing to flush.
        resource.map = MapState::Unmapped;
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
        let resource = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(buffer.to_string()))?;
        if resource.map != MapState::Unmapped {
            return Err(RhiError::InvalidState(format!(
                "map requested for {} while {:?}",
                buffer, resource.map
            )));
        }
        if offset
            .checked_add(size)
            .is_none_or(|end| end > resource.size)
        {
            return Err(RhiError::InvalidState(format!(
                "map range {}+{} outside {}",
                offset, size, buffer
            )));
        }

        resource.map = MapState::Pending;
        let after = resource.last_use;
        self.maps.push(PendingMap {
            buffer,
            after,
            callback,
        });
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> RhiResult<TextureId> {
        let resource = TextureResource::create(&self.device, desc, self.depth_stencil_format)?;
        let id = TextureId::from_raw(self.ids.next_raw());
        self.textures.insert(id, resource);
        Ok(id)
    }

    fn create_texture_view(&mut self, texture: TextureId) -> RhiResult<TextureViewId> {
        let resource = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| RhiError::InvalidHandle(texture.to_string()))?;
        let view = resource.create_view(&self.device)?;

        let id = TextureViewId::from_raw(self.ids.next_raw());
        self.views.insert(id, ViewEntry::Texture { texture, view });
        Ok(id)
    }

    fn release_texture_view(&mut self, view: TextureViewId) -> RhiResult<()> {
        match self.views.remove(&view) {
            Some(ViewEntry::Texture {
                texture,
                view: handle,
            }) => {
                if let Some(resource) = self.textures.get_mut(&texture) {
                    resource.views = resource.views.saturating_sub(1);
                }
                self.bury(Garbage::View(handle));
                Ok(())
            }
            Some(ViewEntry::Backbuffer) => {
                self.views.insert(view, ViewEntry::Backbuffer);
                Err(RhiError::InvalidState(format!(
                    "{} is the backbuffer; present or release it instead",
                    view
                )))
            }
            None => Err(RhiError::InvalidHandle(view.to_string())),
        }
    }

    fn destroy_texture(&mut self, texture: TextureId) -> RhiResult<()> {
        let resource = self
            .textures
            .get(&texture)
            .ok_or_else(|| RhiError::InvalidHandle(texture.to_string()))?;
        if resource.views > 0 {
            return Err(RhiError::InvalidState(format!(
                "{} destroyed with {} live view(s)",
                texture, resource.views
            )));
        }
        if let Some(resource) = self.textures.remove(&texture) {
            self.bury(resource.into_garbage());
        }
        Ok(())
    }

    fn create_command_encoder(&mut self, label: &str) -> RhiResult<EncoderId> {
        let cb = self.allocate_command_buffer()?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = unsafe { self.device.handle().begin_command_buffer(cb, &begin_info) } {
            self.free_command_buffers(&[cb]);
            return Err(e.into());
        }

        let id = EncoderId::from_raw(self.ids.next_raw());
        self.encoders.insert(
            id,
            Recording {
                label: label.to_string(),
                cb,
                has_copies: false,
                touches_backbuffer: false,
                open_pass: None,
                buffers: Vec::new(),
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
        let source = self
            .buffers
            .get(&src)
            .ok_or_else(|| RhiError::InvalidHandle(src.to_string()))?;
        let destination = self
            .buffers
            .get(&dst)
            .ok_or_else(|| RhiError::InvalidHandle(dst.to_string()))?;
        validate_copy(
            CopyEndpoint {
                size: source.size,
                usage: source.usage,
                offset: src_offset,
            },
            CopyEndpoint {
                size: destination.size,
                usage: destination.usage,
                offset: dst_offset,
            },
            size,
        )?;
        let (src_handle, dst_handle) = (source.buffer, destination.buffer);

        let recording = self
            .encoders
            .get_mut(&encoder)
            .ok_or_else(|| RhiError::InvalidHandle(encoder.to_string()))?;
        if recording.open_pass.is_some() {
            return Err(RhiError::InvalidState(format!(
                "copy recorded inside a render pass on '{}'",
                recording.label
            )));
        }

        if !recording.has_copies {
            cmd_wait_for_reads(&self.device, recording.cb);
        }
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer(recording.cb, src_handle, dst_handle, &[region])
        };
        recording.has_copies = true;
        recording.buffers.extend([src, dst]);
        Ok(())
    }

    fn begin_render_pass(&mut self, encoder: EncoderId, desc: &RenderPassDesc) -> RhiResult<()> {
        let (color_image, color_view, color_extent, is_backbuffer) =
            match self.views.get(&desc.color_view) {
                Some(ViewEntry::Backbuffer) => {
                    let acquired = self
                        .backbuffer
                        .as_ref()
                        .ok_or(RhiError::SwapchainUnavailable)?;
                    let swapchain = self
                        .swapchain
                        .as_ref()
                        .ok_or(RhiError::SwapchainUnavailable)?;
                    let image = swapchain
                        .image(acquired.image_index)
                        .ok_or(RhiError::SwapchainUnavailable)?;
                    let view = swapchain
                        .image_view(acquired.image_index)
                        .ok_or(RhiError::SwapchainUnavailable)?;
                    (image, view, swapchain.extent(), true)
                }
                Some(ViewEntry::Texture { texture, view }) => {
                    let resource = self
                        .textures
                        .get(texture)
                        .ok_or_else(|| RhiError::InvalidHandle(texture.to_string()))?;
                    (resource.image, *view, resource.extent, false)
                }
                None => return Err(RhiError::InvalidHandle(desc.color_view.to_string())),
            };

        let depth = match &desc.depth_stencil {
            Some(target) => match self.views.get(&target.view) {
                Some(ViewEntry::Texture { texture, view }) => {
                    let resource = self
                        .textures
                        .get(texture)
                        .ok_or_else(|| RhiError::InvalidHandle(texture.to_string()))?;
                    Some((resource.image, *view, resource.extent, resource.aspect, target))
                }
                _ => return Err(RhiError::InvalidHandle(target.view.to_string())),
            },
            None => None,
        };

        let recording = self
            .encoders
            .get_mut(&encoder)
            .ok_or_else(|| RhiError::InvalidHandle(encoder.to_string()))?;
        if recording.open_pass.is_some() {
            return Err(RhiError::InvalidState(format!(
                "render pass already open on '{}'",
                recording.label
            )));
        }
        let cb = recording.cb;

        // Every attachment is cleared on load, so prior contents never matter.
        cmd_transition_image_layout(
            &self.device,
            cb,
            color_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );

        let color_attachment = [vk::RenderingAttachmentInfo::default()
            .image_view(color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: desc.clear_color,
                },
            })];

        let mut render_extent = color_extent;
        let depth_attachment = depth.map(|(image, view, extent, aspect, target)| {
            cmd_transition_image_layout(
                &self.device,
                cb,
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                aspect,
            );
            render_extent = vk::Extent2D {
                width: render_extent.width.min(extent.width),
                height: render_extent.height.min(extent.height),
            };
            let attachment = vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: target.depth_clear,
                        stencil: target.stencil_clear,
                    },
                });
            (attachment, aspect.contains(vk::ImageAspectFlags::STENCIL))
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: render_extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachment);
        if let Some((attachment, has_stencil)) = &depth_attachment {
            rendering_info = rendering_info.depth_attachment(attachment);
            if *has_stencil {
                rendering_info = rendering_info.stencil_attachment(attachment);
            }
        }

        unsafe { self.device.handle().cmd_begin_rendering(cb, &rendering_info) };

        recording.open_pass = Some(OpenPass {
            color_image,
            present_after: is_backbuffer,
        });
        recording.touches_backbuffer |= is_backbuffer;
        Ok(())
    }

    fn end_render_pass(&mut self, encoder: EncoderId) -> RhiResult<()> {
        let recording = self
            .encoders
            .get_mut(&encoder)
            .ok_or_else(|| RhiError::InvalidHandle(encoder.to_string()))?;
        let pass = recording.open_pass.take().ok_or_else(|| {
            RhiError::InvalidState(format!("no render pass open on '{}'", recording.label))
        })?;

        unsafe { self.device.handle().cmd_end_rendering(recording.cb) };
        if pass.present_after {
            cmd_transition_image_layout(
                &self.device,
                recording.cb,
                pass.color_image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::ImageAspectFlags::COLOR,
            );
        }
        Ok(())
    }

    fn finish_encoder(&mut self, encoder: EncoderId) -> RhiResult<CommandBufferId> {
        let recording = self
            .encoders
            .remove(&encoder)
            .ok_or_else(|| RhiError::InvalidHandle(encoder.to_string()))?;
        if recording.open_pass.is_some() {
            self.free_command_buffers(&[recording.cb]);
            return Err(RhiError::InvalidState(format!(
                "'{}' finished with an open render pass",
                recording.label
            )));
        }

        if recording.has_copies {
            cmd_publish_transfers(&self.device, recording.cb);
        }
        if let Err(e) = unsafe { self.device.handle().end_command_buffer(recording.cb) } {
            self.free_command_buffers(&[recording.cb]);
            return Err(e.into());
        }

        let id = CommandBufferId::from_raw(self.ids.next_raw());
        self.recorded.insert(
            id,
            Recorded {
                label: recording.label,
                cb: recording.cb,
                touches_backbuffer: recording.touches_backbuffer,
                buffers: recording.buffers,
            },
        );
        Ok(id)
    }

    fn discard_encoder(&mut self, encoder: EncoderId) {
        if let Some(recording) = self.encoders.remove(&encoder) {
            debug!("Discarded encoder '{}'", recording.label);
            self.free_command_buffers(&[recording.cb]);
        }
    }

    fn discard_command_buffer(&mut self, command_buffer: CommandBufferId) {
        if let Some(recorded) = self.recorded.remove(&command_buffer) {
            debug!("Discarded command buffer '{}'", recorded.label);
            self.free_command_buffers(&[recorded.cb]);
        }
    }

    fn submit(&mut self, command_buffers: &[CommandBufferId]) -> RhiResult<SubmissionIndex> {
        for id in command_buffers {
            let recorded = self
                .recorded
                .get(id)
                .ok_or_else(|| RhiError::InvalidHandle(id.to_string()))?;
            for buffer in &recorded.buffers {
                let resource = self
                    .buffers
                    .get(buffer)
                    .ok_or_else(|| RhiError::InvalidHandle(buffer.to_string()))?;
                if resource.map != MapState::Unmapped {
                    return Err(RhiError::InvalidState(format!(
                        "{} used in a submission while {:?}",
                        buffer, resource.map
                    )));
                }
            }
        }

        let batch: Vec<Recorded> = command_buffers
            .iter()
            .filter_map(|id| self.recorded.remove(id))
            .collect();
        let touches_backbuffer = batch.iter().any(|r| r.touches_backbuffer);

        let mut chain = None;
        if touches_backbuffer
            && let Some(acquired) = self.backbuffer.as_mut()
            && !acquired.chained
            && let Some(&signal) = self.render_finished.get(acquired.image_index as usize)
        {
            chain = Some((acquired.image_available, signal));
            acquired.chained = true;
        }

        let handles = batch.iter().map(|r| r.cb).collect();
        let index = self.queue_submit(handles, chain)?;

        for recorded in &batch {
            for buffer in &recorded.buffers {
                if let Some(resource) = self.buffers.get_mut(buffer) {
                    resource.last_use = Some(index);
                }
            }
        }
        debug!(
            "Submitted {:?} as {}",
            batch.iter().map(|r| r.label.as_str()).collect::<Vec<_>>(),
            index
        );
        Ok(index)
    }

    fn acquire_backbuffer(&mut self) -> RhiResult<TextureViewId> {
        if let Some(acquired) = &self.backbuffer {
            return Err(RhiError::InvalidState(format!(
                "backbuffer {} still held",
                acquired.view
            )));
        }
        if self.surface_size.is_empty() {
            return Err(RhiError::SwapchainUnavailable);
        }
        if self.swapchain.is_none() || self.swapchain_dirty {
            self.recreate_swapchain()?;
        }

        let semaphore = self.take_semaphore()?;
        let result = self
            .swapchain
            .as_ref()
            .ok_or(RhiError::SwapchainUnavailable)
            .map(|swapchain| swapchain.acquire_next_image(semaphore));

        let (image_index, suboptimal) = match result {
            Ok(Ok(acquired)) => acquired,
            Ok(Err(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR))
            | Err(RhiError::SwapchainUnavailable) => {
                self.free_semaphores.push(semaphore);
                self.swapchain_dirty = true;
                warn!("Swapchain unavailable; will recreate on next acquire");
                return Err(RhiError::SwapchainUnavailable);
            }
            Ok(Err(e)) => {
                self.free_semaphores.push(semaphore);
                return Err(e.into());
            }
            Err(e) => {
                self.free_semaphores.push(semaphore);
                return Err(e);
            }
        };
        if suboptimal {
            self.swapchain_dirty = true;
        }

        let view = TextureViewId::from_raw(self.ids.next_raw());
        self.views.insert(view, ViewEntry::Backbuffer);
        self.backbuffer = Some(AcquiredImage {
            view,
            image_index,
            image_available: semaphore,
            chained: false,
        });
        Ok(view)
    }

    fn present_backbuffer(&mut self, view: TextureViewId) -> RhiResult<()> {
        self.hand_back_backbuffer(view)
    }

    fn release_backbuffer(&mut self, view: TextureViewId) -> RhiResult<()> {
        // An acquired image must go back to the presentation engine; it is
        // presented with whatever the frame left in it.
        debug!("Releasing abandoned backbuffer {}", view);
        self.hand_back_backbuffer(view)
    }

    fn resize_surface(&mut self, size: FramebufferSize) -> RhiResult<()> {
        if size != self.surface_size {
            debug!("Surface resized to {}", size);
            self.surface_size = size;
            self.swapchain_dirty = true;
        }
        Ok(())
    }

    fn poll(&mut self) -> RhiResult<()> {
        self.retire_finished()?;
        self.fire_ready_maps();
        Ok(())
    }

    fn wait_idle(&mut self) -> RhiResult<()> {
        self.device.wait_idle()?;
        self.poll()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle during drop: {}", e);
        }
        if let Err(e) = self.retire_finished() {
            error!("Failed to retire submissions during drop: {}", e);
        }
        for map in std::mem::take(&mut self.maps) {
            (map.callback)(Err(MapError::Destroyed));
        }

        for (_, garbage) in std::mem::take(&mut self.graveyard) {
            garbage.destroy(&self.device);
        }
        for (_, entry) in std::mem::take(&mut self.views) {
            if let ViewEntry::Texture { view, .. } = entry {
                Garbage::View(view).destroy(&self.device);
            }
        }
        for (_, texture) in std::mem::take(&mut self.textures) {
            texture.into_garbage().destroy(&self.device);
        }
        for (_, buffer) in std::mem::take(&mut self.buffers) {
            buffer.into_garbage().destroy(&self.device);
        }

        let handle = self.device.handle();
        unsafe {
            for flight in &self.in_flight {
                handle.destroy_fence(flight.fence, None);
                for &semaphore in &flight.semaphores {
                    handle.destroy_semaphore(semaphore, None);
                }
            }
            if let Some(acquired) = &self.backbuffer {
                handle.destroy_semaphore(acquired.image_available, None);
            }
            for &semaphore in self.free_semaphores.iter().chain(&self.render_finished) {
                handle.destroy_semaphore(semaphore, None);
            }
            for &fence in &self.free_fences {
                handle.destroy_fence(fence, None);
            }
            // Frees every command buffer still allocated from the pool.
            handle.destroy_command_pool(self.command_pool, None);
        }

        self.swapchain = None;
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
        info!("Vulkan device destroyed");
    }
}

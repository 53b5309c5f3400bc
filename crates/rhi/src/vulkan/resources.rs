//! Buffers and textures backed by gpu-allocator.

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use super::device::LogicalDevice;
use crate::error::{RhiError, RhiResult};
use crate::types::{BufferDesc, BufferUsage, SubmissionIndex, TextureDesc, TextureFormat};

/// CPU access state of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum MapState {
    Unmapped,
    Mapped,
    Pending,
}

/// Vulkan usage flags for a buffer role.
pub(super) fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    match usage {
        BufferUsage::Vertex => {
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        }
        BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        BufferUsage::Uniform => {
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        }
        BufferUsage::Storage => {
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        }
        BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
    }
}

/// Staging and mapped-at-creation buffers live in host-visible memory, the
/// rest is filled through copies and stays on the device.
pub(super) fn buffer_memory_location(usage: BufferUsage, mapped_at_creation: bool) -> MemoryLocation {
    if usage == BufferUsage::Staging || mapped_at_creation {
        MemoryLocation::CpuToGpu
    } else {
        MemoryLocation::GpuOnly
    }
}

pub(super) struct BufferResource {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub usage: BufferUsage,
    pub map: MapState,
    pub last_use: Option<SubmissionIndex>,
}

impl BufferResource {
    pub fn create(device: &LogicalDevice, desc: &BufferDesc<'_>) -> RhiResult<Self> {
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

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(buffer_usage_flags(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.handle().create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };

        let location = buffer_memory_location(desc.usage, desc.mapped_at_creation);
        let allocated = device.allocator().and_then(|mut allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: desc.label,
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(RhiError::from)
        });
        let allocation = match allocated {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device
                .handle()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let mut resource = Self {
            buffer,
            allocation: Some(allocation),
            size: desc.size,
            usage: desc.usage,
            map: if desc.mapped_at_creation {
                MapState::Mapped
            } else {
                MapState::Unmapped
            },
            last_use: None,
        };
        if let Err(e) = bound {
            resource.destroy(device);
            return Err(e.into());
        }

        debug!(
            "Created {} buffer '{}': {} bytes ({:?})",
            desc.usage.name(),
            desc.label,
            desc.size,
            location
        );
        Ok(resource)
    }

    /// CPU view of a mapped range.
    pub fn mapped_range(&mut self, offset: u64, size: u64) -> RhiResult<&mut [u8]> {
        if self.map != MapState::Mapped {
            return Err(RhiError::InvalidState("buffer is not mapped".to_string()));
        }
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                RhiError::InvalidState(format!(
                    "range {}+{} outside buffer of {} bytes",
                    offset, size, self.size
                ))
            })?;
        let slice = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or_else(|| RhiError::InvalidState("buffer memory is not host visible".to_string()))?;
        Ok(&mut slice[offset as usize..end as usize])
    }

    pub fn is_host_visible(&self) -> bool {
        self.allocation
            .as_ref()
            .is_some_and(|allocation| allocation.mapped_ptr().is_some())
    }

    /// Frees memory and destroys the buffer immediately.
    pub fn destroy(&mut self, device: &LogicalDevice) {
        Garbage::Buffer(self.buffer, self.allocation.take()).destroy(device);
        self.buffer = vk::Buffer::null();
    }

    pub fn into_garbage(mut self) -> Garbage {
        Garbage::Buffer(self.buffer, self.allocation.take())
    }
}

/// Vulkan format for a texture format. Depth/stencil resolves to the format
/// chosen for the physical device.
pub(super) fn texture_vk_format(format: TextureFormat, depth_stencil: vk::Format) -> vk::Format {
    match format {
        TextureFormat::Depth24PlusStencil8 => depth_stencil,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
    }
}

pub(super) fn texture_aspect(format: TextureFormat) -> vk::ImageAspectFlags {
    match (format.has_depth(), format.has_stencil()) {
        (true, true) => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        (true, false) => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

fn texture_usage_flags(format: TextureFormat) -> vk::ImageUsageFlags {
    if format.has_depth() {
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
    } else {
        vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_SRC
    }
}

pub(super) struct TextureResource {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub extent: vk::Extent2D,
    pub vk_format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub views: usize,
}

impl TextureResource {
    pub fn create(
        device: &LogicalDevice,
        desc: &TextureDesc<'_>,
        depth_stencil: vk::Format,
    ) -> RhiResult<Self> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RhiError::InvalidState(format!(
                "texture '{}' has zero extent",
                desc.label
            )));
        }

        let vk_format = texture_vk_format(desc.format, depth_stencil);
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(texture_usage_flags(desc.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.handle().create_image(&image_info, None)? };
        let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

        let allocated = device.allocator().and_then(|mut allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: desc.label,
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| RhiError::OutOfMemory(format!("texture '{}': {}", desc.label, e)))
        });
        let allocation = match allocated {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device
                .handle()
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            Garbage::Image(image, Some(allocation)).destroy(device);
            return Err(e.into());
        }

        debug!(
            "Created texture '{}': {}x{} {:?}",
            desc.label, desc.width, desc.height, vk_format
        );
        Ok(Self {
            image,
            allocation: Some(allocation),
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            vk_format,
            aspect: texture_aspect(desc.format),
            views: 0,
        })
    }

    pub fn create_view(&mut self, device: &LogicalDevice) -> RhiResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.vk_format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(self.aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        let view = unsafe { device.handle().create_image_view(&create_info, None)? };
        self.views += 1;
        Ok(view)
    }

    pub fn into_garbage(mut self) -> Garbage {
        Garbage::Image(self.image, self.allocation.take())
    }
}

/// An object whose destruction waits for the submissions that may use it.
pub(super) enum Garbage {
    Buffer(vk::Buffer, Option<Allocation>),
    Image(vk::Image, Option<Allocation>),
    View(vk::ImageView),
}

impl Garbage {
    pub fn destroy(self, device: &LogicalDevice) {
        let allocation = match self {
            Garbage::Buffer(buffer, allocation) => {
                if buffer != vk::Buffer::null() {
                    unsafe { device.handle().destroy_buffer(buffer, None) };
                }
                allocation
            }
            Garbage::Image(image, allocation) => {
                unsafe { device.handle().destroy_image(image, None) };
                allocation
            }
            Garbage::View(view) => {
                unsafe { device.handle().destroy_image_view(view, None) };
                None
            }
        };

        if let Some(allocation) = allocation {
            match device.allocator() {
                Ok(mut allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        error!("Failed to free allocation: {:?}", e);
                    }
                }
                Err(e) => error!("Failed to free allocation: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_is_transfer_source_only() {
        assert_eq!(
            buffer_usage_flags(BufferUsage::Staging),
            vk::BufferUsageFlags::TRANSFER_SRC
        );
        assert!(
            buffer_usage_flags(BufferUsage::Uniform).contains(vk::BufferUsageFlags::TRANSFER_DST)
        );
    }

    #[test]
    fn test_memory_location_by_role() {
        assert_eq!(
            buffer_memory_location(BufferUsage::Staging, true),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            buffer_memory_location(BufferUsage::Uniform, false),
            MemoryLocation::GpuOnly
        );
        assert_eq!(
            buffer_memory_location(BufferUsage::Vertex, true),
            MemoryLocation::CpuToGpu
        );
    }

    #[test]
    fn test_depth_stencil_uses_resolved_format() {
        assert_eq!(
            texture_vk_format(
                TextureFormat::Depth24PlusStencil8,
                vk::Format::D32_SFLOAT_S8_UINT
            ),
            vk::Format::D32_SFLOAT_S8_UINT
        );
        assert_eq!(
            texture_aspect(TextureFormat::Depth24PlusStencil8),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            texture_aspect(TextureFormat::Depth32Float),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            texture_aspect(TextureFormat::Rgba8Unorm),
            vk::ImageAspectFlags::COLOR
        );
    }
}

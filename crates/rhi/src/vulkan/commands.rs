//! Command recording state and barrier helpers.

use ash::vk;

use super::device::LogicalDevice;
use crate::types::BufferId;

/// Color attachment of an open render pass.
pub(super) struct OpenPass {
    pub color_image: vk::Image,
    /// The color target is the backbuffer and ends the pass presentable.
    pub present_after: bool,
}

/// An encoder that is still recording.
pub(super) struct Recording {
    pub label: String,
    pub cb: vk::CommandBuffer,
    pub has_copies: bool,
    pub touches_backbuffer: bool,
    pub open_pass: Option<OpenPass>,
    pub buffers: Vec<BufferId>,
}

/// A finished encoder waiting for submission.
pub(super) struct Recorded {
    pub label: String,
    pub cb: vk::CommandBuffer,
    pub touches_backbuffer: bool,
    pub buffers: Vec<BufferId>,
}

/// Stage and access masks for the layout transitions the frame pipeline uses.
///
/// Transitions out of `UNDEFINED` wait on `COLOR_ATTACHMENT_OUTPUT` so they
/// chain with the acquire semaphore.
pub(super) fn transition_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (
    vk::PipelineStageFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::AccessFlags,
) {
    let depth_stages =
        vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;

    match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL) => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            depth_stages,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            depth_stages,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
        ),
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR) => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
        ),
        _ => (
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        ),
    }
}

pub(super) fn cmd_transition_image_layout(
    device: &LogicalDevice,
    cb: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    aspect_mask: vk::ImageAspectFlags,
) {
    let (src_stage, src_access, dst_stage, dst_access) = transition_masks(old_layout, new_layout);

    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect_mask)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        )
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);

    unsafe {
        device.handle().cmd_pipeline_barrier(
            cb,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Stages whose reads a transfer write into the same buffer must wait for.
pub(super) fn shader_read_stages() -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::VERTEX_INPUT
        | vk::PipelineStageFlags::VERTEX_SHADER
        | vk::PipelineStageFlags::FRAGMENT_SHADER
        | vk::PipelineStageFlags::COMPUTE_SHADER
}

/// Source and destination stages of the barrier recorded before an
/// encoder's first copy. Write-after-read needs only an execution
/// dependency, so no access masks are involved.
pub(super) fn reads_before_copy_stages() -> (vk::PipelineStageFlags, vk::PipelineStageFlags) {
    (shader_read_stages(), vk::PipelineStageFlags::TRANSFER)
}

/// Holds back transfers recorded after this point until reads submitted
/// earlier on the queue (e.g. the previous frame's draws) are done.
pub(super) fn cmd_wait_for_reads(device: &LogicalDevice, cb: vk::CommandBuffer) {
    let (src_stage, dst_stage) = reads_before_copy_stages();
    unsafe {
        device.handle().cmd_pipeline_barrier(
            cb,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[],
        );
    }
}

/// Makes every transfer write recorded so far visible to later commands in
/// the same queue, including those in command buffers submitted after this
/// one in the same batch.
pub(super) fn cmd_publish_transfers(device: &LogicalDevice, cb: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(
            vk::AccessFlags::UNIFORM_READ
                | vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                | vk::AccessFlags::INDEX_READ
                | vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::TRANSFER_READ,
        );

    unsafe {
        device.handle().cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::TRANSFER,
            shader_read_stages() | vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

// Queue-family ownership transfer
//
// When presentation and graphics run on different families, work touching a
// swapchain image is bracketed by a present -> graphics acquire and a
// graphics -> present release. The same bracket moves a shared storage buffer
// between the graphics and compute families around a dispatch. With a single
// family both barriers are omitted: a transfer between identical indices is
// not a valid ownership transfer.

use ash::vk;

use crate::backend::api::DeviceApi;
use crate::backend::device::QueueFamilies;

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Present -> graphics handoff of a swapchain image, `None` on a shared family
pub fn acquire_from_present(families: &QueueFamilies, image: vk::Image) -> Option<vk::ImageMemoryBarrier> {
    if !families.present_is_separate() {
        return None;
    }
    Some(
        vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::MEMORY_READ)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(families.present)
            .dst_queue_family_index(families.graphics)
            .image(image)
            .subresource_range(color_range())
            .build(),
    )
}

/// Graphics -> present handoff of a swapchain image, `None` on a shared family
pub fn release_to_present(families: &QueueFamilies, image: vk::Image) -> Option<vk::ImageMemoryBarrier> {
    if !families.present_is_separate() {
        return None;
    }
    Some(
        vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ)
            .old_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(families.graphics)
            .dst_queue_family_index(families.present)
            .image(image)
            .subresource_range(color_range())
            .build(),
    )
}

/// Record `body` between the swapchain acquire and release barriers.
///
/// Returns the number of ownership barriers recorded (0 or 2).
pub fn record_swapchain_pass<D, F>(
    device: &D,
    command_buffer: vk::CommandBuffer,
    families: &QueueFamilies,
    image: vk::Image,
    body: F,
) -> usize
where
    D: DeviceApi + ?Sized,
    F: FnOnce(),
{
    let mut recorded = 0;

    if let Some(barrier) = acquire_from_present(families, image) {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            &[],
            &[barrier],
        );
        recorded += 1;
    }

    body();

    if let Some(barrier) = release_to_present(families, image) {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            &[],
            &[barrier],
        );
        recorded += 1;
    }

    recorded
}

/// Graphics -> compute handoff of a vertex/storage buffer before a dispatch
pub fn acquire_for_compute(families: &QueueFamilies, buffer: vk::Buffer) -> Option<vk::BufferMemoryBarrier> {
    if !families.compute_is_separate() {
        return None;
    }
    Some(
        vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::VERTEX_ATTRIBUTE_READ)
            .dst_access_mask(vk::AccessFlags::SHADER_WRITE)
            .src_queue_family_index(families.graphics)
            .dst_queue_family_index(families.compute)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build(),
    )
}

/// Compute -> graphics handoff after the dispatch, before vertex input reads it
pub fn release_from_compute(families: &QueueFamilies, buffer: vk::Buffer) -> Option<vk::BufferMemoryBarrier> {
    if !families.compute_is_separate() {
        return None;
    }
    Some(
        vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::VERTEX_ATTRIBUTE_READ)
            .src_queue_family_index(families.compute)
            .dst_queue_family_index(families.graphics)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build(),
    )
}

/// Record a dispatch in `body` between the compute acquire and release barriers
pub fn record_compute_pass<D, F>(
    device: &D,
    command_buffer: vk::CommandBuffer,
    families: &QueueFamilies,
    buffer: vk::Buffer,
    body: F,
) -> usize
where
    D: DeviceApi + ?Sized,
    F: FnOnce(),
{
    let mut recorded = 0;

    if let Some(barrier) = acquire_for_compute(families, buffer) {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            &[barrier],
            &[],
        );
        recorded += 1;
    }

    body();

    if let Some(barrier) = release_from_compute(families, buffer) {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::VERTEX_INPUT,
            &[barrier],
            &[],
        );
        recorded += 1;
    }

    recorded
}

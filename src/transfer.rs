// Staged transfer - host data into device-local memory
//
// Each upload is synchronous: payload into a host-coherent staging buffer, one
// one-shot command buffer on the graphics queue copying into the device-local
// destination, then a fence wait. When the wait returns, the transfer objects
// are released in a fixed order (fence, command buffer, staging buffer,
// staging memory) and only the destination is handed back.

use ash::vk;

use crate::backend::api::{DeviceApi, QueueRole, Submission};
use crate::backend::memory::{self, aspect_mask, BoundBuffer, BoundImage, ImageDesc};
use crate::backend::sync::{timeout_ns, WaitTimeouts};
use crate::disposal::{destroy_logged, Disposable, Resource};
use crate::error::{GpuError, GpuResult, VkResultExt};

/// Everything a single upload creates, released when dropped.
///
/// On success only the transfer objects go; on failure the destination goes
/// too. After a timed-out fence nothing is released because the GPU may still
/// be reading from staging or writing to the destination.
struct TransferScope<'d, D: DeviceApi + ?Sized> {
    device: &'d D,
    fence: Option<vk::Fence>,
    command_buffer: Option<(vk::CommandPool, vk::CommandBuffer)>,
    staging: Option<BoundBuffer>,
    destination: Vec<Resource>,
    abandoned: bool,
}

impl<'d, D: DeviceApi + ?Sized> TransferScope<'d, D> {
    fn new(device: &'d D) -> Self {
        Self {
            device,
            fence: None,
            command_buffer: None,
            staging: None,
            destination: Vec::new(),
            abandoned: false,
        }
    }

    /// Fill the staging buffer with `payload`
    fn stage(&mut self, payload: &[u8]) -> GpuResult<vk::Buffer> {
        let staging = memory::create_host_buffer(self.device, vk::BufferUsageFlags::TRANSFER_SRC, payload)?;
        self.staging = Some(staging);
        Ok(staging.buffer())
    }

    /// Record with `record`, submit to the graphics queue and wait for completion
    fn submit_and_wait(
        &mut self,
        timeouts: &WaitTimeouts,
        record: impl FnOnce(&D, vk::CommandBuffer),
    ) -> GpuResult<()> {
        let device = self.device;
        let pool = device.command_pool(QueueRole::Graphics);
        let command_buffer = device
            .allocate_command_buffers(pool, 1)
            .creating("transfer command buffer")?
            .into_iter()
            .next()
            .ok_or(GpuError::ResourceCreation {
                what: "transfer command buffer",
                result: vk::Result::ERROR_UNKNOWN,
            })?;
        self.command_buffer = Some((pool, command_buffer));

        device
            .begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .creating("transfer command recording")?;
        record(device, command_buffer);
        device.end_command_buffer(command_buffer).creating("transfer command recording")?;

        let fence = device.create_fence(false).creating("transfer fence")?;
        self.fence = Some(fence);

        let command_buffers = [command_buffer];
        let submission = Submission { command_buffers: &command_buffers, ..Default::default() };
        device
            .queue_submit(device.queue(QueueRole::Graphics), &submission, fence)
            .creating("transfer submission")?;

        if let Err(result) = device.wait_for_fence(fence, timeout_ns(timeouts.fence)) {
            if result == vk::Result::TIMEOUT {
                self.abandoned = true;
            }
            return Err(GpuError::DeviceLost { during: "waiting for transfer fence", result });
        }
        Ok(())
    }

    /// The destination survives the scope
    fn keep_destination(&mut self) {
        self.destination.clear();
    }
}

impl<D: DeviceApi + ?Sized> Drop for TransferScope<'_, D> {
    fn drop(&mut self) {
        if self.abandoned {
            log::warn!(
                "Transfer fence timed out; leaking staging buffer and {} destination objects still in use",
                self.destination.len()
            );
            return;
        }

        if let Some(fence) = self.fence.take() {
            destroy_logged(self.device, Resource::Fence(fence));
        }
        if let Some((pool, buffer)) = self.command_buffer.take() {
            destroy_logged(self.device, Resource::CommandBuffer { pool, buffer });
        }
        if let Some(staging) = self.staging.take() {
            destroy_logged(self.device, Resource::Buffer(staging.buffer()));
            destroy_logged(self.device, Resource::Memory(staging.memory()));
        }
        while let Some(resource) = self.destination.pop() {
            destroy_logged(self.device, resource);
        }
    }
}

/// Copy `payload` into a new device-local buffer with `usage | TRANSFER_DST`.
///
/// The returned buffer is unregistered; the caller decides which tier owns it.
pub fn upload_to_device_local<D: DeviceApi + ?Sized>(
    device: &D,
    payload: &[u8],
    usage: vk::BufferUsageFlags,
    timeouts: &WaitTimeouts,
) -> GpuResult<BoundBuffer> {
    if payload.is_empty() {
        return Err(GpuError::InvalidUpload("payload is empty".into()));
    }

    let size = payload.len() as vk::DeviceSize;
    let mut scope = TransferScope::new(device);
    let staging = scope.stage(payload)?;

    let destination = memory::create_buffer(
        device,
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    scope.destination = destination.resources();

    scope.submit_and_wait(timeouts, |device, command_buffer| {
        let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
        device.cmd_copy_buffer(command_buffer, staging, destination.buffer(), &[region]);
    })?;

    scope.keep_destination();
    log::debug!("Uploaded {} bytes into device-local buffer ({:?})", size, usage);
    Ok(destination)
}

/// Typed convenience over [`upload_to_device_local`]
pub fn upload_slice<T: bytemuck::Pod, D: DeviceApi + ?Sized>(
    device: &D,
    data: &[T],
    usage: vk::BufferUsageFlags,
    timeouts: &WaitTimeouts,
) -> GpuResult<BoundBuffer> {
    upload_to_device_local(device, bytemuck::cast_slice(data), usage, timeouts)
}

/// Destination image parameters and the copy regions to fill it with
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub desc: ImageDesc,
    pub regions: Vec<vk::BufferImageCopy>,
}

impl ImageUpload {
    /// Single-mip image filled by one tightly packed full-extent region
    pub fn new(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect_mask(format),
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D { width: extent.width, height: extent.height, depth: 1 },
        };
        Self {
            desc: ImageDesc { extent, format, usage, mip_levels: 1 },
            regions: vec![region],
        }
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.desc.mip_levels = mip_levels.max(1);
        self
    }

    pub fn with_regions(mut self, regions: Vec<vk::BufferImageCopy>) -> Self {
        self.regions = regions;
        self
    }

    fn validate(&self, payload_len: usize) -> GpuResult<()> {
        if self.regions.is_empty() {
            return Err(GpuError::InvalidUpload("no copy regions".into()));
        }
        for (i, region) in self.regions.iter().enumerate() {
            if region.image_subresource.mip_level >= self.desc.mip_levels.max(1) {
                return Err(GpuError::InvalidUpload(format!(
                    "region {} targets mip {} of a {}-level image",
                    i, region.image_subresource.mip_level, self.desc.mip_levels
                )));
            }
            let end = match texel_size(self.desc.format) {
                Some(texel) => region_end(region, texel),
                None => region.buffer_offset.checked_add(1),
            }
            .ok_or_else(|| GpuError::InvalidUpload(format!("region {} footprint overflows", i)))?;
            if end > payload_len as u64 {
                return Err(GpuError::InvalidUpload(format!(
                    "region {} reads up to byte {} of a {}-byte payload",
                    i, end, payload_len
                )));
            }
        }
        Ok(())
    }
}

/// One past the last payload byte a region reads, `None` on overflow.
///
/// Rows are `buffer_row_length` texels apart and slices `buffer_image_height`
/// rows apart (zero means tightly packed); the last row is not padded.
fn region_end(region: &vk::BufferImageCopy, texel: u64) -> Option<u64> {
    let extent = region.image_extent;
    let row = u64::from(region.buffer_row_length.max(extent.width));
    let slice = row.checked_mul(u64::from(region.buffer_image_height.max(extent.height)))?;

    let texels = slice
        .checked_mul(u64::from(extent.depth.max(1)) - 1)?
        .checked_add(row.checked_mul(u64::from(extent.height.max(1)) - 1)?)?
        .checked_add(u64::from(extent.width))?;
    texels.checked_mul(texel)?.checked_add(region.buffer_offset)
}

/// Bytes per texel for the uncompressed formats uploads commonly use
fn texel_size(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => Some(1),
        vk::Format::R8G8_UNORM => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

fn layout_transition(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    (old_layout, src_access): (vk::ImageLayout, vk::AccessFlags),
    (new_layout, dst_access): (vk::ImageLayout, vk::AccessFlags),
) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .build()
}

/// Copy `payload` into a new device-local image left in SHADER_READ_ONLY_OPTIMAL.
///
/// All mip levels go UNDEFINED -> TRANSFER_DST_OPTIMAL before the copy and
/// TRANSFER_DST_OPTIMAL -> SHADER_READ_ONLY_OPTIMAL after it.
pub fn upload_image<D: DeviceApi + ?Sized>(
    device: &D,
    payload: &[u8],
    upload: &ImageUpload,
    timeouts: &WaitTimeouts,
) -> GpuResult<BoundImage> {
    if payload.is_empty() {
        return Err(GpuError::InvalidUpload("payload is empty".into()));
    }
    upload.validate(payload.len())?;

    let mut scope = TransferScope::new(device);
    let staging = scope.stage(payload)?;

    let desc = ImageDesc { usage: upload.desc.usage | vk::ImageUsageFlags::TRANSFER_DST, ..upload.desc };
    let destination = memory::create_image(device, &desc, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
    scope.destination = destination.resources();

    let range = vk::ImageSubresourceRange {
        aspect_mask: aspect_mask(desc.format),
        base_mip_level: 0,
        level_count: destination.mip_levels(),
        base_array_layer: 0,
        layer_count: 1,
    };

    scope.submit_and_wait(timeouts, |device, command_buffer| {
        let to_transfer = layout_transition(
            destination.image(),
            range,
            (vk::ImageLayout::UNDEFINED, vk::AccessFlags::empty()),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::AccessFlags::TRANSFER_WRITE),
        );
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            &[],
            &[to_transfer],
        );

        device.cmd_copy_buffer_to_image(
            command_buffer,
            staging,
            destination.image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &upload.regions,
        );

        let to_shader = layout_transition(
            destination.image(),
            range,
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::AccessFlags::TRANSFER_WRITE),
            (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::AccessFlags::SHADER_READ),
        );
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            &[],
            &[to_shader],
        );
    })?;

    scope.keep_destination();
    log::debug!(
        "Uploaded {} bytes into {}x{} {:?} image",
        payload.len(),
        desc.extent.width,
        desc.extent.height,
        desc.format
    );
    Ok(destination)
}

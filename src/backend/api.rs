// Binding seam - the native calls the frame-resource core depends on
//
// VulkanDevice implements this over ash. Everything in `disposal`, `transfer`,
// `barrier` and `lifecycle` is written against the trait so the protocols can
// be driven by a recording device in tests.

use ash::{prelude::VkResult, vk};

use super::device::QueueFamilies;
use crate::disposal::Resource;

/// Which logical queue a piece of work targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Present,
    Compute,
}

/// One batch for `queue_submit`
#[derive(Debug, Default, Clone, Copy)]
pub struct Submission<'a> {
    pub wait: &'a [(vk::Semaphore, vk::PipelineStageFlags)],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal: &'a [vk::Semaphore],
}

/// Result of querying the window surface
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Parameters for a swapchain on the context's surface
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub usage: vk::ImageUsageFlags,
}

/// Object creation, command recording and submission as seen by the core.
///
/// Fallible calls return the raw native status; callers classify it with
/// [`crate::error::VkResultExt`].
pub trait DeviceApi {
    // Context
    fn queue_families(&self) -> QueueFamilies;
    fn queue(&self, role: QueueRole) -> vk::Queue;
    /// Pool for the family serving `role` (pools are shared between roles on one family)
    fn command_pool(&self, role: QueueRole) -> vk::CommandPool;
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties;
    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties;

    // Buffers, images, memory
    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer>;
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image>;
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory>;
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()>;
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()>;
    /// Map, copy `data` at `offset`, unmap. Memory must be host-visible and coherent.
    fn write_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, data: &[u8]) -> VkResult<()>;
    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView>;

    // Commands
    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> VkResult<Vec<vk::CommandBuffer>>;
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    );

    // Synchronization
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn queue_submit(&self, queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()>;
    /// Block until `fence` signals; `Err(TIMEOUT)` once `timeout_ns` elapses
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn device_wait_idle(&self) -> VkResult<()>;

    // Presentation
    fn query_surface(&self) -> VkResult<SurfaceSupport>;
    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    /// `(image index, suboptimal)`
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> VkResult<(u32, bool)>;
    /// `Ok(true)` when the swapchain is suboptimal
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: &[vk::Semaphore],
    ) -> VkResult<bool>;

    // Teardown
    /// Release one native object. The caller owns exclusivity; a second
    /// release of the same handle is undefined behavior at the native layer.
    fn destroy(&self, resource: Resource) -> VkResult<()>;
}

// Recording device for unit tests
//
// Mints fresh handles, logs every call in order and fails on demand. Nothing
// touches a real driver, so ordering protocols can be asserted exactly.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};

use super::api::{DeviceApi, QueueRole, Submission, SurfaceSupport, SwapchainDesc};
use super::device::QueueFamilies;
use crate::disposal::Resource;

/// Calls that can be made to fail with `fail_once`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    CreateBuffer,
    AllocateMemory,
    CreateImage,
    WriteMemory,
    CreateImageView,
    AllocateCommandBuffers,
    BeginCommandBuffer,
    CreateFence,
    CreateSemaphore,
    Submit,
    WaitFence,
    ResetFence,
    WaitIdle,
    QuerySurface,
    CreateSwapchain,
    Acquire,
    Present,
    Destroy,
}

/// One recorded call
#[derive(Debug, Clone)]
pub enum Call {
    CreateBuffer { buffer: vk::Buffer, size: vk::DeviceSize, usage: vk::BufferUsageFlags },
    CreateImage { image: vk::Image, extent: vk::Extent3D, usage: vk::ImageUsageFlags },
    AllocateMemory { memory: vk::DeviceMemory, size: vk::DeviceSize, type_index: u32 },
    BindBufferMemory { buffer: vk::Buffer, memory: vk::DeviceMemory },
    BindImageMemory { image: vk::Image, memory: vk::DeviceMemory },
    WriteMemory { memory: vk::DeviceMemory, len: usize },
    CreateImageView { view: vk::ImageView, image: vk::Image },
    AllocateCommandBuffers { pool: vk::CommandPool, buffers: Vec<vk::CommandBuffer> },
    Begin { command_buffer: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags },
    End { command_buffer: vk::CommandBuffer },
    CopyBuffer { command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: Vec<vk::BufferCopy> },
    CopyBufferToImage {
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    Barrier {
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffers: Vec<vk::BufferMemoryBarrier>,
        images: Vec<vk::ImageMemoryBarrier>,
    },
    CreateFence { fence: vk::Fence, signaled: bool },
    CreateSemaphore { semaphore: vk::Semaphore },
    Submit {
        queue: vk::Queue,
        wait: Vec<vk::Semaphore>,
        command_buffers: Vec<vk::CommandBuffer>,
        signal: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    WaitFence { fence: vk::Fence, timeout: u64 },
    ResetFence { fence: vk::Fence },
    WaitIdle,
    QuerySurface,
    CreateSwapchain { swapchain: vk::SwapchainKHR, extent: vk::Extent2D },
    GetSwapchainImages { swapchain: vk::SwapchainKHR },
    Acquire { swapchain: vk::SwapchainKHR, semaphore: vk::Semaphore },
    Present { queue: vk::Queue, swapchain: vk::SwapchainKHR, image_index: u32 },
    Destroy(Resource),
}

pub struct MockDevice {
    families: QueueFamilies,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    next_handle: Cell<u64>,
    calls: RefCell<Vec<Call>>,
    failures: RefCell<Vec<(FailPoint, vk::Result)>>,
    formats: RefCell<HashMap<vk::Format, vk::FormatFeatureFlags>>,
    buffer_sizes: RefCell<HashMap<vk::Buffer, vk::DeviceSize>>,
    memory_types: RefCell<HashMap<vk::DeviceMemory, u32>>,
    memory_contents: RefCell<HashMap<vk::DeviceMemory, Vec<u8>>>,
    surface: RefCell<SurfaceSupport>,
    swapchain_images: Cell<u32>,
    next_image: Cell<u32>,
    suboptimal_once: Cell<bool>,
}

impl MockDevice {
    pub const DEVICE_LOCAL_TYPE: u32 = 0;
    pub const HOST_TYPE: u32 = 1;
    pub const SWAPCHAIN_IMAGES: u32 = 3;

    /// One family serving graphics, presentation and compute
    pub fn new() -> Self {
        Self::with_families(QueueFamilies::unified(0))
    }

    pub fn with_families(families: QueueFamilies) -> Self {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties::default();
        memory_properties.memory_type_count = 2;
        memory_properties.memory_types[Self::DEVICE_LOCAL_TYPE as usize].property_flags =
            vk::MemoryPropertyFlags::DEVICE_LOCAL;
        memory_properties.memory_types[Self::HOST_TYPE as usize].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let surface = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: Self::SWAPCHAIN_IMAGES,
                current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        };

        Self {
            families,
            memory_properties,
            next_handle: Cell::new(0x1_0000),
            calls: RefCell::default(),
            failures: RefCell::default(),
            formats: RefCell::default(),
            buffer_sizes: RefCell::default(),
            memory_types: RefCell::default(),
            memory_contents: RefCell::default(),
            surface: RefCell::new(surface),
            swapchain_images: Cell::new(Self::SWAPCHAIN_IMAGES),
            next_image: Cell::new(0),
            suboptimal_once: Cell::new(false),
        }
    }

    /// The next call at `point` returns `result` instead of succeeding
    pub fn fail_once(&self, point: FailPoint, result: vk::Result) {
        self.failures.borrow_mut().push((point, result));
    }

    /// The next present reports a suboptimal swapchain
    pub fn report_suboptimal_once(&self) {
        self.suboptimal_once.set(true);
    }

    pub fn support_format(&self, format: vk::Format, features: vk::FormatFeatureFlags) {
        self.formats.borrow_mut().insert(format, features);
    }

    /// Pin the surface to a fixed extent; zero models a minimised window
    pub fn set_surface_extent(&self, extent: vk::Extent2D) {
        self.surface.borrow_mut().capabilities.current_extent = extent;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    /// Every release attempted, including ones that failed
    pub fn destroyed(&self) -> Vec<Resource> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                Call::Destroy(resource) => Some(*resource),
                _ => None,
            })
            .collect()
    }

    pub fn created_buffers(&self) -> Vec<vk::Buffer> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                Call::CreateBuffer { buffer, .. } => Some(*buffer),
                _ => None,
            })
            .collect()
    }

    pub fn memory_type_of(&self, memory: vk::DeviceMemory) -> Option<u32> {
        self.memory_types.borrow().get(&memory).copied()
    }

    pub fn contents_of(&self, memory: vk::DeviceMemory) -> Option<Vec<u8>> {
        self.memory_contents.borrow().get(&memory).cloned()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    fn check(&self, point: FailPoint) -> VkResult<()> {
        let mut failures = self.failures.borrow_mut();
        match failures.iter().position(|&(p, _)| p == point) {
            Some(index) => Err(failures.remove(index).1),
            None => Ok(()),
        }
    }

    fn mint<H: Handle>(&self) -> H {
        let raw = self.next_handle.get();
        self.next_handle.set(raw + 1);
        H::from_raw(raw)
    }
}

impl DeviceApi for MockDevice {
    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn queue(&self, role: QueueRole) -> vk::Queue {
        vk::Queue::from_raw(1000 + u64::from(self.families.family(role)))
    }

    fn command_pool(&self, role: QueueRole) -> vk::CommandPool {
        vk::CommandPool::from_raw(2000 + u64::from(self.families.family(role)))
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        let features = self.formats.borrow().get(&format).copied().unwrap_or_default();
        vk::FormatProperties {
            linear_tiling_features: features,
            optimal_tiling_features: features,
            buffer_features: vk::FormatFeatureFlags::empty(),
        }
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        self.check(FailPoint::CreateBuffer)?;
        let buffer = self.mint();
        self.buffer_sizes.borrow_mut().insert(buffer, info.size);
        self.record(Call::CreateBuffer { buffer, size: info.size, usage: info.usage });
        Ok(buffer)
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: self.buffer_sizes.borrow().get(&buffer).copied().unwrap_or(0),
            alignment: 16,
            memory_type_bits: 0b11,
        }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image> {
        self.check(FailPoint::CreateImage)?;
        let image = self.mint();
        self.record(Call::CreateImage { image, extent: info.extent, usage: info.usage });
        Ok(image)
    }

    fn image_memory_requirements(&self, _image: vk::Image) -> vk::MemoryRequirements {
        vk::MemoryRequirements { size: 4096, alignment: 256, memory_type_bits: 0b11 }
    }

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        self.check(FailPoint::AllocateMemory)?;
        let memory = self.mint();
        self.memory_types.borrow_mut().insert(memory, memory_type_index);
        self.record(Call::AllocateMemory { memory, size, type_index: memory_type_index });
        Ok(memory)
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        self.record(Call::BindBufferMemory { buffer, memory });
        Ok(())
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        self.record(Call::BindImageMemory { image, memory });
        Ok(())
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, data: &[u8]) -> VkResult<()> {
        self.check(FailPoint::WriteMemory)?;
        if self.memory_type_of(memory) != Some(Self::HOST_TYPE) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let mut contents = self.memory_contents.borrow_mut();
        let bytes = contents.entry(memory).or_default();
        let offset = offset as usize;
        if bytes.len() < offset + data.len() {
            bytes.resize(offset + data.len(), 0);
        }
        bytes[offset..offset + data.len()].copy_from_slice(data);
        self.record(Call::WriteMemory { memory, len: data.len() });
        Ok(())
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        self.check(FailPoint::CreateImageView)?;
        let view = self.mint();
        self.record(Call::CreateImageView { view, image: info.image });
        Ok(view)
    }

    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        self.check(FailPoint::AllocateCommandBuffers)?;
        let buffers: Vec<vk::CommandBuffer> = (0..count).map(|_| self.mint()).collect();
        self.record(Call::AllocateCommandBuffers { pool, buffers: buffers.clone() });
        Ok(buffers)
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> VkResult<()> {
        self.check(FailPoint::BeginCommandBuffer)?;
        self.record(Call::Begin { command_buffer, flags });
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.record(Call::End { command_buffer });
        Ok(())
    }

    fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.record(Call::CopyBuffer { command_buffer, src, dst, regions: regions.to_vec() });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(Call::CopyBufferToImage { command_buffer, src, dst, layout, regions: regions.to_vec() });
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        self.record(Call::Barrier {
            command_buffer,
            src_stage,
            dst_stage,
            buffers: buffer_barriers.to_vec(),
            images: image_barriers.to_vec(),
        });
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        self.check(FailPoint::CreateFence)?;
        let fence = self.mint();
        self.record(Call::CreateFence { fence, signaled });
        Ok(fence)
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        self.check(FailPoint::CreateSemaphore)?;
        let semaphore = self.mint();
        self.record(Call::CreateSemaphore { semaphore });
        Ok(semaphore)
    }

    fn queue_submit(&self, queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()> {
        self.check(FailPoint::Submit)?;
        self.record(Call::Submit {
            queue,
            wait: submission.wait.iter().map(|&(semaphore, _)| semaphore).collect(),
            command_buffers: submission.command_buffers.to_vec(),
            signal: submission.signal.to_vec(),
            fence,
        });
        Ok(())
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        self.record(Call::WaitFence { fence, timeout: timeout_ns });
        self.check(FailPoint::WaitFence)
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        self.record(Call::ResetFence { fence });
        self.check(FailPoint::ResetFence)
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        self.record(Call::WaitIdle);
        self.check(FailPoint::WaitIdle)
    }

    fn query_surface(&self) -> VkResult<SurfaceSupport> {
        self.check(FailPoint::QuerySurface)?;
        self.record(Call::QuerySurface);
        Ok(self.surface.borrow().clone())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        self.check(FailPoint::CreateSwapchain)?;
        let swapchain = self.mint();
        self.next_image.set(0);
        self.record(Call::CreateSwapchain { swapchain, extent: desc.extent });
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.record(Call::GetSwapchainImages { swapchain });
        Ok((0..self.swapchain_images.get()).map(|_| self.mint()).collect())
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> VkResult<(u32, bool)> {
        self.record(Call::Acquire { swapchain, semaphore });
        self.check(FailPoint::Acquire)?;
        let index = self.next_image.get();
        self.next_image.set((index + 1) % self.swapchain_images.get().max(1));
        Ok((index, false))
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait: &[vk::Semaphore],
    ) -> VkResult<bool> {
        self.record(Call::Present { queue, swapchain, image_index });
        self.check(FailPoint::Present)?;
        Ok(self.suboptimal_once.replace(false))
    }

    fn destroy(&self, resource: Resource) -> VkResult<()> {
        self.record(Call::Destroy(resource));
        self.check(FailPoint::Destroy)
    }
}

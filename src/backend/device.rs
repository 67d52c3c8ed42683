// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Surface creation for the target window
// - Physical device selection (graphics + present on this surface, prefer discrete GPU)
// - Logical device, one queue per distinct family, one command pool per distinct family
//
// Queue family indices are resolved here once and never change afterwards.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};

use ash::extensions::{ext::DebugUtils, khr};
use ash::{prelude::VkResult, vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::api::{DeviceApi, QueueRole, Submission, SurfaceSupport, SwapchainDesc};
use crate::disposal::Resource;
use crate::error::{GpuError, GpuResult, VkResultExt};

/// Queue family indices chosen for the context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    /// Family used for compute dispatches; equals `graphics` when no dedicated family exists
    pub compute: u32,
}

impl QueueFamilies {
    /// Same family for everything
    pub fn unified(family: u32) -> Self {
        Self { graphics: family, present: family, compute: family }
    }

    /// True when swapchain images need ownership transfers between queues
    pub fn present_is_separate(&self) -> bool {
        self.present != self.graphics
    }

    pub fn compute_is_separate(&self) -> bool {
        self.compute != self.graphics
    }

    pub fn family(&self, role: QueueRole) -> u32 {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Present => self.present,
            QueueRole::Compute => self.compute,
        }
    }

    /// Distinct family indices, ascending
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.present, self.compute];
        families.sort_unstable();
        families.dedup();
        families
    }

    /// Pick families from one adapter's family list.
    ///
    /// Returns `Ok(None)` when the adapter lacks graphics or presentation.
    /// A family that does both is preferred over a split pair.
    pub fn select(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: impl FnMut(u32) -> VkResult<bool>,
    ) -> VkResult<Option<Self>> {
        let mut graphics = None;
        let mut present = None;
        let mut both = None;

        for (index, props) in families.iter().enumerate() {
            let index = index as u32;
            if props.queue_count == 0 {
                continue;
            }
            let is_graphics = props.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let can_present = supports_present(index)?;

            if is_graphics && can_present && both.is_none() {
                both = Some(index);
            }
            if is_graphics && graphics.is_none() {
                graphics = Some(index);
            }
            if can_present && present.is_none() {
                present = Some(index);
            }
        }

        let (graphics, present) = match (both, graphics, present) {
            (Some(family), _, _) => (family, family),
            (None, Some(g), Some(p)) => (g, p),
            _ => return Ok(None),
        };

        // Dedicated compute family if one exists, otherwise the graphics family
        let compute = families
            .iter()
            .enumerate()
            .find(|(_, props)| {
                props.queue_count > 0
                    && props.queue_flags.contains(vk::QueueFlags::COMPUTE)
                    && !props.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(|(i, _)| i as u32)
            .unwrap_or(graphics);

        Ok(Some(Self { graphics, present, compute }))
    }
}

/// One physical device as seen during selection
#[derive(Debug, Clone)]
pub struct AdapterCandidate<H> {
    pub handle: H,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    /// `None` when the adapter lacks graphics, presentation or the swapchain extension
    pub families: Option<QueueFamilies>,
}

/// Choose the best adapter that satisfies every requirement.
///
/// Adapters that only partially qualify are skipped, never used as a fallback.
pub fn select_adapter<H: Copy>(candidates: &[AdapterCandidate<H>]) -> GpuResult<(H, QueueFamilies)> {
    fn score(device_type: vk::PhysicalDeviceType) -> u32 {
        match device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        }
    }

    let mut best: Option<(&AdapterCandidate<H>, QueueFamilies)> = None;
    for candidate in candidates {
        let Some(families) = candidate.families else {
            log::debug!("Skipping adapter {}: missing graphics/present support", candidate.name);
            continue;
        };
        let better = best
            .as_ref()
            .map_or(true, |(current, _)| score(candidate.device_type) > score(current.device_type));
        if better {
            best = Some((candidate, families));
        }
    }

    best.map(|(candidate, families)| (candidate.handle, families))
        .ok_or_else(|| GpuError::NoSuitableDevice {
            reason: format!(
                "{} adapter(s) enumerated, none supports both graphics and presentation to the surface",
                candidates.len()
            ),
        })
}

/// Vulkan device context with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    surface: vk::SurfaceKHR,
    surface_loader: khr::Surface,
    swapchain_loader: khr::Swapchain,

    // Queue handles
    families: QueueFamilies,
    queues: BTreeMap<u32, vk::Queue>,
    command_pools: BTreeMap<u32, vk::CommandPool>,

    // Debug utils (if validation enabled)
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Create the device context for a window.
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers
    /// * `display` / `window` - Platform tag and window the surface is created for
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> GpuResult<Self> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }?;
        let instance = Self::create_instance(&entry, app_name, enable_validation, display)?;

        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    log::warn!("Validation requested but debug messenger failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let surface = unsafe { ash_window::create_surface(&entry, &instance, display, window, None) }
            .map_err(|e| GpuError::Initialization(format!("surface creation failed: {:?}", e)))?;
        let surface_loader = khr::Surface::new(&entry, &instance);

        let (physical_device, families) =
            match Self::pick_physical_device(&instance, &surface_loader, surface) {
                Ok(picked) => picked,
                Err(e) => {
                    unsafe { release_instance(&instance, &surface_loader, surface, debug_utils) };
                    return Err(e);
                }
            };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} present={} compute={}",
            families.graphics,
            families.present,
            families.compute
        );

        let device = match Self::create_logical_device(&instance, physical_device, &families) {
            Ok(device) => device,
            Err(e) => {
                unsafe { release_instance(&instance, &surface_loader, surface, debug_utils) };
                return Err(e);
            }
        };
        let swapchain_loader = khr::Swapchain::new(&instance, &device);

        let mut queues = BTreeMap::new();
        let mut command_pools = BTreeMap::new();
        for family in families.unique() {
            queues.insert(family, unsafe { device.get_device_queue(family, 0) });

            let pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(family)
                // RESET: frame command buffers are re-recorded in place
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            match unsafe { device.create_command_pool(&pool_info, None) }.creating("command pool") {
                Ok(pool) => {
                    command_pools.insert(family, pool);
                }
                Err(e) => {
                    unsafe {
                        release_device(&device, std::mem::take(&mut command_pools));
                        release_instance(&instance, &surface_loader, surface, debug_utils);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            swapchain_loader,
            families,
            queues,
            command_pools,
            debug_utils,
            properties,
            memory_properties,
        })
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
    ) -> GpuResult<ash::Instance> {
        let app_name_cstr = CString::new(app_name)
            .map_err(|e| GpuError::Initialization(format!("invalid application name: {}", e)))?;
        let engine_name = c"Staged Renderer";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        // Platform surface extensions
        let mut extensions = ash_window::enumerate_required_extensions(display)
            .map_err(|e| GpuError::Initialization(format!("unsupported platform: {:?}", e)))?
            .to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| GpuError::Initialization(format!("vkCreateInstance failed: {:?}", e)))
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> GpuResult<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .creating("debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> GpuResult<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }.creating("physical device list")?;

        let mut candidates = Vec::with_capacity(devices.len());
        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();

            let families = if Self::supports_swapchain(instance, device) {
                let queue_families =
                    unsafe { instance.get_physical_device_queue_family_properties(device) };
                usable_families(
                    &name,
                    QueueFamilies::select(&queue_families, |index| unsafe {
                        surface_loader.get_physical_device_surface_support(device, index, surface)
                    }),
                )
            } else {
                None
            };

            candidates.push(AdapterCandidate { handle: device, name, device_type: props.device_type, families });
        }

        select_adapter(&candidates)
    }

    fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let Ok(extensions) = (unsafe { instance.enumerate_device_extension_properties(device) }) else {
            return false;
        };
        extensions.iter().any(|ext| {
            (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == khr::Swapchain::name()
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilies,
    ) -> GpuResult<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = [khr::Swapchain::name().as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        unsafe { instance.create_device(physical_device, &create_info, None) }.creating("logical device")
    }
}

impl DeviceApi for VulkanDevice {
    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn queue(&self, role: QueueRole) -> vk::Queue {
        self.queues[&self.families.family(role)]
    }

    fn command_pool(&self, role: QueueRole) -> vk::CommandPool {
        self.command_pools[&self.families.family(role)]
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe { self.instance.get_physical_device_format_properties(self.physical_device, format) }
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        unsafe { self.device.create_buffer(info, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image> {
        unsafe { self.device.create_image(info, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        unsafe { self.device.allocate_memory(&alloc_info, None) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, 0) }
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, data: &[u8]) -> VkResult<()> {
        unsafe {
            let ptr = self.device.map_memory(
                memory,
                offset,
                data.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )? as *mut u8;
            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        unsafe { self.device.create_image_view(info, None) }
    }

    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&alloc_info) }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> VkResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer_to_image(command_buffer, src, dst, layout, regions) }
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                buffer_barriers,
                image_barriers,
            )
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&fence_info, None) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&semaphore_info, None) }
    }

    fn queue_submit(&self, queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()> {
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) = submission.wait.iter().copied().unzip();
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signal);
        unsafe { self.device.queue_submit(queue, &[submit_info.build()], fence) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn query_surface(&self) -> VkResult<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(self.physical_device, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(self.physical_device, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(self.physical_device, self.surface)?,
            })
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        // Exclusive ownership: cross-family use goes through explicit ownership transfers
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(desc.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true);
        unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> VkResult<(u32, bool)> {
        unsafe { self.swapchain_loader.acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null()) }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        unsafe { self.swapchain_loader.queue_present(queue, &present_info) }
    }

    fn destroy(&self, resource: Resource) -> VkResult<()> {
        let device = &self.device;
        unsafe {
            match resource {
                Resource::Buffer(buffer) => device.destroy_buffer(buffer, None),
                Resource::Memory(memory) => device.free_memory(memory, None),
                Resource::Image(image) => device.destroy_image(image, None),
                Resource::ImageView(view) => device.destroy_image_view(view, None),
                Resource::Sampler(sampler) => device.destroy_sampler(sampler, None),
                Resource::ShaderModule(module) => device.destroy_shader_module(module, None),
                Resource::Pipeline(pipeline) => device.destroy_pipeline(pipeline, None),
                Resource::PipelineLayout(layout) => device.destroy_pipeline_layout(layout, None),
                Resource::RenderPass(render_pass) => device.destroy_render_pass(render_pass, None),
                Resource::Framebuffer(framebuffer) => device.destroy_framebuffer(framebuffer, None),
                Resource::DescriptorPool(pool) => device.destroy_descriptor_pool(pool, None),
                Resource::DescriptorSetLayout(layout) => device.destroy_descriptor_set_layout(layout, None),
                Resource::Semaphore(semaphore) => device.destroy_semaphore(semaphore, None),
                Resource::Fence(fence) => device.destroy_fence(fence, None),
                Resource::CommandBuffer { pool, buffer } => device.free_command_buffers(pool, &[buffer]),
                Resource::CommandPool(pool) => {
                    // Context pools are released with the context itself
                    if self.command_pools.values().any(|&owned| owned == pool) {
                        return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
                    }
                    device.destroy_command_pool(pool, None)
                }
                Resource::Swapchain(swapchain) => self.swapchain_loader.destroy_swapchain(swapchain, None),
            }
        }
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::warn!("Device wait idle failed during teardown: {:?}", e);
        }

        // Cleanup in reverse order
        unsafe {
            release_device(&self.device, std::mem::take(&mut self.command_pools));
            release_instance(&self.instance, &self.surface_loader, self.surface, self.debug_utils.take());
        }
    }
}

/// Destroy the command pools, then the logical device
unsafe fn release_device(device: &ash::Device, command_pools: BTreeMap<u32, vk::CommandPool>) {
    for (_, pool) in command_pools {
        device.destroy_command_pool(pool, None);
    }
    device.destroy_device(None);
}

/// Destroy the surface, the debug messenger and finally the instance
unsafe fn release_instance(
    instance: &ash::Instance,
    surface_loader: &khr::Surface,
    surface: vk::SurfaceKHR,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
) {
    surface_loader.destroy_surface(surface, None);
    if let Some((utils, messenger)) = debug_utils {
        utils.destroy_debug_utils_messenger(messenger, None);
    }
    instance.destroy_instance(None);
}

/// Families for one adapter, or `None` when its surface query failed.
///
/// A failing adapter is skipped so selection can continue with the rest.
fn usable_families(name: &str, query: VkResult<Option<QueueFamilies>>) -> Option<QueueFamilies> {
    query.unwrap_or_else(|e| {
        log::warn!("Skipping adapter {}: surface support query failed ({:?})", name, e);
        None
    })
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

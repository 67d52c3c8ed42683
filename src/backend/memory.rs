// Memory, buffer and image helpers
//
// Creation helpers release whatever they already created when a later step
// fails, so a failed call never leaves half-built objects behind.

use ash::vk;

use super::api::DeviceApi;
use crate::disposal::{destroy_logged, Disposable, Resource};
use crate::error::{GpuError, GpuResult, VkResultExt};

/// A buffer together with the memory bound to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl BoundBuffer {
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Disposable for BoundBuffer {
    fn resources(&self) -> Vec<Resource> {
        // Memory first so the buffer is released before its memory is freed
        vec![Resource::Memory(self.memory), Resource::Buffer(self.buffer)]
    }
}

/// An image together with the memory bound to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
}

impl BoundImage {
    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }
}

impl Disposable for BoundImage {
    fn resources(&self) -> Vec<Resource> {
        vec![Resource::Memory(self.memory), Resource::Image(self.image)]
    }
}

/// Depth attachment: image, memory and view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthBuffer {
    pub image: BoundImage,
    pub view: vk::ImageView,
}

impl Disposable for DepthBuffer {
    fn resources(&self) -> Vec<Resource> {
        let mut resources = self.image.resources();
        resources.push(Resource::ImageView(self.view));
        resources
    }
}

/// Find a memory type index allowed by `type_filter` with all of `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);
        has_type && has_properties
    })
}

fn allocate_for<D: DeviceApi + ?Sized>(
    device: &D,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
    what: &'static str,
) -> GpuResult<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(device.memory_properties(), requirements.memory_type_bits, properties)
        .ok_or(GpuError::ResourceCreation { what, result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY })?;
    device.allocate_memory(requirements.size, memory_type_index).creating(what)
}

/// Create a buffer with memory of the requested properties bound to it
pub fn create_buffer<D: DeviceApi + ?Sized>(
    device: &D,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_properties: vk::MemoryPropertyFlags,
) -> GpuResult<BoundBuffer> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = device.create_buffer(&buffer_info).creating("buffer")?;

    let requirements = device.buffer_memory_requirements(buffer);
    let memory = match allocate_for(device, requirements, memory_properties, "buffer memory") {
        Ok(memory) => memory,
        Err(e) => {
            destroy_logged(device, Resource::Buffer(buffer));
            return Err(e);
        }
    };

    if let Err(result) = device.bind_buffer_memory(buffer, memory) {
        destroy_logged(device, Resource::Buffer(buffer));
        destroy_logged(device, Resource::Memory(memory));
        return Err(GpuError::from_creation("buffer memory binding", result));
    }

    Ok(BoundBuffer { buffer, memory, size })
}

/// Create a host-visible, host-coherent buffer and fill it with `data`
pub fn create_host_buffer<D: DeviceApi + ?Sized>(
    device: &D,
    usage: vk::BufferUsageFlags,
    data: &[u8],
) -> GpuResult<BoundBuffer> {
    let buffer = create_buffer(
        device,
        data.len() as vk::DeviceSize,
        usage,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;

    if let Err(result) = device.write_memory(buffer.memory, 0, data) {
        destroy_logged(device, Resource::Buffer(buffer.buffer));
        destroy_logged(device, Resource::Memory(buffer.memory));
        return Err(GpuError::from_creation("host buffer mapping", result));
    }

    Ok(buffer)
}

/// Parameters for a 2D image
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
}

/// Create an optimally tiled 2D image with memory of the requested properties bound to it
pub fn create_image<D: DeviceApi + ?Sized>(
    device: &D,
    desc: &ImageDesc,
    memory_properties: vk::MemoryPropertyFlags,
) -> GpuResult<BoundImage> {
    let extent = vk::Extent3D { width: desc.extent.width, height: desc.extent.height, depth: 1 };
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(extent)
        .mip_levels(desc.mip_levels.max(1))
        .array_layers(1)
        .format(desc.format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(desc.usage)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = device.create_image(&image_info).creating("image")?;

    let requirements = device.image_memory_requirements(image);
    let memory = match allocate_for(device, requirements, memory_properties, "image memory") {
        Ok(memory) => memory,
        Err(e) => {
            destroy_logged(device, Resource::Image(image));
            return Err(e);
        }
    };

    if let Err(result) = device.bind_image_memory(image, memory) {
        destroy_logged(device, Resource::Image(image));
        destroy_logged(device, Resource::Memory(memory));
        return Err(GpuError::from_creation("image memory binding", result));
    }

    Ok(BoundImage { image, memory, format: desc.format, extent, mip_levels: desc.mip_levels.max(1) })
}

/// Aspect mask implied by a format
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Create a 2D view covering every mip level of `image`
pub fn create_view<D: DeviceApi + ?Sized>(
    device: &D,
    image: vk::Image,
    format: vk::Format,
    mip_levels: u32,
) -> GpuResult<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect_mask(format),
            base_mip_level: 0,
            level_count: mip_levels.max(1),
            base_array_layer: 0,
            layer_count: 1,
        });

    device.create_image_view(&view_info).creating("image view")
}

/// Depth formats tried in order of preference
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// First candidate whose features for `tiling` include `features`
pub fn find_supported_format<D: DeviceApi + ?Sized>(
    device: &D,
    what: &'static str,
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
) -> GpuResult<vk::Format> {
    candidates
        .iter()
        .copied()
        .find(|&format| {
            let props = device.format_properties(format);
            match tiling {
                vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                _ => props.optimal_tiling_features.contains(features),
            }
        })
        .ok_or_else(|| GpuError::UnsupportedFormat { what, candidates: candidates.to_vec() })
}

/// Pick a depth attachment format the device supports
pub fn find_depth_format<D: DeviceApi + ?Sized>(device: &D) -> GpuResult<vk::Format> {
    find_supported_format(
        device,
        "depth",
        &DEPTH_FORMAT_CANDIDATES,
        vk::ImageTiling::OPTIMAL,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
    )
}

/// Create a depth buffer image, memory, and view
pub fn create_depth_buffer<D: DeviceApi + ?Sized>(
    device: &D,
    extent: vk::Extent2D,
    format: vk::Format,
) -> GpuResult<DepthBuffer> {
    let image = create_image(
        device,
        &ImageDesc {
            extent,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            mip_levels: 1,
        },
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    let view = match create_view(device, image.image, format, 1) {
        Ok(view) => view,
        Err(e) => {
            destroy_logged(device, Resource::Image(image.image));
            destroy_logged(device, Resource::Memory(image.memory));
            return Err(e);
        }
    };

    Ok(DepthBuffer { image, view })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, FailPoint, MockDevice};

    #[test]
    fn memory_type_respects_filter_and_flags() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 3;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, 0b111, host), Some(1));
        assert_eq!(find_memory_type(&props, 0b101, host), Some(2));
        assert_eq!(find_memory_type(&props, 0b001, host), None);
        assert_eq!(find_memory_type(&props, 0b110, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(2));
    }

    #[test]
    fn failed_allocation_releases_the_buffer() {
        let device = MockDevice::new();
        device.fail_once(FailPoint::AllocateMemory, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        let err = create_buffer(
            &device,
            64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap_err();

        assert!(matches!(err, GpuError::ResourceCreation { what: "buffer memory", .. }));
        let created = device.created_buffers();
        assert_eq!(created.len(), 1);
        assert_eq!(device.destroyed(), vec![Resource::Buffer(created[0])]);
    }

    #[test]
    fn host_buffer_is_written_through_mapping() {
        let device = MockDevice::new();
        let buffer = create_host_buffer(&device, vk::BufferUsageFlags::UNIFORM_BUFFER, &[7u8; 48]).unwrap();

        assert_eq!(buffer.size(), 48);
        assert!(device
            .calls()
            .iter()
            .any(|call| matches!(call, Call::WriteMemory { memory, len: 48 } if *memory == buffer.memory())));
        assert_eq!(device.memory_type_of(buffer.memory()), Some(MockDevice::HOST_TYPE));
    }

    #[test]
    fn depth_format_falls_back_through_candidates() {
        let device = MockDevice::new();
        device.support_format(vk::Format::D24_UNORM_S8_UINT, vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT);
        assert_eq!(find_depth_format(&device).unwrap(), vk::Format::D24_UNORM_S8_UINT);
    }

    #[test]
    fn no_depth_format_is_unsupported_format() {
        let device = MockDevice::new();
        let err = find_depth_format(&device).unwrap_err();
        assert!(matches!(err, GpuError::UnsupportedFormat { what: "depth", ref candidates } if candidates.len() == 3));
    }

    #[test]
    fn depth_buffer_registers_view_after_image() {
        let device = MockDevice::new();
        let depth = create_depth_buffer(&device, vk::Extent2D { width: 8, height: 8 }, vk::Format::D32_SFLOAT).unwrap();
        let resources = depth.resources();
        assert_eq!(
            resources,
            vec![
                Resource::Memory(depth.image.memory()),
                Resource::Image(depth.image.image()),
                Resource::ImageView(depth.view),
            ]
        );
        assert_eq!(aspect_mask(depth.image.format()), vk::ImageAspectFlags::DEPTH);
    }
}

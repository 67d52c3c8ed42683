// Swapchain - Window presentation
//
// The swapchain and its per-image views are frame-tier resources: they are
// created against the current surface configuration and torn down by the
// registry when the surface changes. The images themselves belong to the
// presentation engine and are never destroyed here.

use ash::vk;

use super::api::{DeviceApi, SurfaceSupport, SwapchainDesc};
use super::memory::create_view;
use crate::disposal::TierScope;
use crate::error::{GpuError, GpuResult, VkResultExt};

/// What the application would like from the surface
#[derive(Debug, Clone)]
pub struct SurfacePreferences {
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_mode: vk::PresentModeKHR,
}

impl Default for SurfacePreferences {
    fn default() -> Self {
        Self {
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_mode: vk::PresentModeKHR::FIFO,
        }
    }
}

/// The current swapchain and everything derived from it per image
#[derive(Debug, Clone)]
pub struct SwapchainFrame {
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
}

impl SwapchainFrame {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

/// Preferred format if offered, otherwise the first one the surface lists
pub fn choose_surface_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: &[vk::SurfaceFormatKHR],
) -> GpuResult<vk::SurfaceFormatKHR> {
    preferred
        .iter()
        .find(|p| available.iter().any(|a| a.format == p.format && a.color_space == p.color_space))
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::UnsupportedFormat {
            what: "surface",
            candidates: preferred.iter().map(|f| f.format).collect(),
        })
}

/// Requested mode when supported, FIFO otherwise (FIFO is always supported)
pub fn choose_present_mode(available: &[vk::PresentModeKHR], requested: vk::PresentModeKHR) -> vk::PresentModeKHR {
    if available.contains(&requested) {
        requested
    } else {
        log::warn!("Present mode {:?} unavailable, falling back to FIFO", requested);
        vk::PresentModeKHR::FIFO
    }
}

/// Surface-dictated extent, or the desired one clamped to the surface limits
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
        image_count = capabilities.max_image_count;
    }
    image_count
}

/// Build the swapchain description for a surface and a desired window size
pub fn describe_swapchain(
    support: &SurfaceSupport,
    preferences: &SurfacePreferences,
    desired: vk::Extent2D,
) -> GpuResult<SwapchainDesc> {
    let format = choose_surface_format(&support.formats, &preferences.formats)?;
    Ok(SwapchainDesc {
        min_image_count: choose_image_count(&support.capabilities),
        format,
        extent: choose_extent(&support.capabilities, desired),
        present_mode: choose_present_mode(&support.present_modes, preferences.present_mode),
        pre_transform: support.capabilities.current_transform,
        usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
    })
}

/// Zero-area extents come from minimised windows; no swapchain can be built for them
pub fn is_zero_area(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

/// Query the surface and create a swapchain plus one view per image, all in `scope`'s tier.
///
/// Registration order is swapchain first, then views in image order. Returns
/// `None` without creating anything when the surface currently has zero area.
pub fn create_swapchain_frame<D: DeviceApi + ?Sized>(
    device: &D,
    scope: &mut TierScope<'_>,
    preferences: &SurfacePreferences,
    desired: vk::Extent2D,
) -> GpuResult<Option<SwapchainFrame>> {
    let support = device.query_surface().creating("surface capability query")?;
    let desc = describe_swapchain(&support, preferences, desired)?;
    if is_zero_area(desc.extent) {
        log::debug!("Surface has zero area, skipping swapchain creation");
        return Ok(None);
    }

    log::info!(
        "Creating swapchain: {}x{} {:?} {:?}",
        desc.extent.width,
        desc.extent.height,
        desc.format.format,
        desc.present_mode
    );

    let swapchain = scope.adopt(device.create_swapchain(&desc).creating("swapchain")?);
    let images = device.swapchain_images(swapchain).creating("swapchain images")?;

    let views = images
        .iter()
        .map(|&image| create_view(device, image, desc.format.format, 1).map(|view| scope.adopt(view)))
        .collect::<GpuResult<Vec<_>>>()?;

    log::info!("Created swapchain with {} images", images.len());

    Ok(Some(SwapchainFrame {
        swapchain,
        format: desc.format,
        extent: desc.extent,
        present_mode: desc.present_mode,
        images,
        views,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, FailPoint, MockDevice};
    use crate::disposal::{DisposalRegistry, Resource, Tier};

    fn caps(current: (u32, u32), min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn extent_follows_surface_when_fixed() {
        let extent = choose_extent(&caps((800, 600), 2, 3), vk::Extent2D { width: 10, height: 10 });
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn extent_clamped_when_surface_defers() {
        let extent = choose_extent(&caps((u32::MAX, u32::MAX), 2, 3), vk::Extent2D { width: 9000, height: 0 });
        assert_eq!((extent.width, extent.height), (4096, 1));
    }

    #[test]
    fn image_count_respects_maximum() {
        assert_eq!(choose_image_count(&caps((1, 1), 2, 0)), 3);
        assert_eq!(choose_image_count(&caps((1, 1), 2, 2)), 2);
    }

    #[test]
    fn format_prefers_requested_then_first() {
        let srgb = vk::SurfaceFormatKHR { format: vk::Format::B8G8R8A8_SRGB, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR };
        let unorm = vk::SurfaceFormatKHR { format: vk::Format::R8G8B8A8_UNORM, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR };

        assert_eq!(choose_surface_format(&[unorm, srgb], &[srgb]).unwrap().format, srgb.format);
        assert_eq!(choose_surface_format(&[unorm], &[srgb]).unwrap().format, unorm.format);
        assert!(matches!(
            choose_surface_format(&[], &[srgb]),
            Err(GpuError::UnsupportedFormat { what: "surface", .. })
        ));
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn swapchain_and_views_land_in_the_frame_tier_in_order() {
        let device = MockDevice::new();
        let mut registry = DisposalRegistry::new();

        let frame = create_swapchain_frame(
            &device,
            &mut registry.scope(Tier::Frame),
            &SurfacePreferences::default(),
            vk::Extent2D { width: 640, height: 480 },
        )
        .unwrap()
        .unwrap();

        let mut expected = vec![Resource::Swapchain(frame.swapchain)];
        expected.extend(frame.views.iter().map(|&v| Resource::ImageView(v)));
        assert_eq!(registry.frame_resources(), expected.as_slice());
        assert_eq!(frame.image_count(), MockDevice::SWAPCHAIN_IMAGES as usize);
        assert!(registry.permanent_resources().is_empty());
    }

    #[test]
    fn minimised_surface_creates_nothing() {
        let device = MockDevice::new();
        device.set_surface_extent(vk::Extent2D { width: 0, height: 0 });
        let mut registry = DisposalRegistry::new();

        let frame = create_swapchain_frame(
            &device,
            &mut registry.scope(Tier::Frame),
            &SurfacePreferences::default(),
            vk::Extent2D { width: 640, height: 480 },
        )
        .unwrap();

        assert!(frame.is_none());
        assert!(registry.frame_resources().is_empty());
        assert!(!device.calls().iter().any(|c| matches!(c, Call::CreateSwapchain { .. })));
    }

    #[test]
    fn surface_query_failure_propagates() {
        let device = MockDevice::new();
        device.fail_once(FailPoint::QuerySurface, vk::Result::ERROR_SURFACE_LOST_KHR);
        let mut registry = DisposalRegistry::new();

        let err = create_swapchain_frame(
            &device,
            &mut registry.scope(Tier::Frame),
            &SurfacePreferences::default(),
            vk::Extent2D { width: 640, height: 480 },
        )
        .unwrap_err();

        assert!(matches!(err, GpuError::ResourceCreation { result: vk::Result::ERROR_SURFACE_LOST_KHR, .. }));
        assert!(registry.frame_resources().is_empty());
    }
}

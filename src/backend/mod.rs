// Backend module - Vulkan access layer
//
// `api` is the seam the core is written against; `device` implements it over
// ash. The remaining modules are helpers built on the seam.

pub mod api;
pub mod device;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub(crate) mod mock;

pub use api::{DeviceApi, QueueRole, Submission};
pub use device::{QueueFamilies, VulkanDevice};
pub use memory::{BoundBuffer, BoundImage, DepthBuffer};
pub use swapchain::{SurfacePreferences, SwapchainFrame};
pub use sync::WaitTimeouts;

// Disposal registry - two-tier ownership of native GPU objects
//
// Permanent tier: lives as long as the application.
// Frame tier: lives as long as the current surface configuration.
//
// Destruction is strictly LIFO per tier. Callers register dependents after the
// objects they depend on (memory, then image, then view), so popping in
// reverse releases views before images and images before their memory.

use ash::vk;

use crate::backend::api::DeviceApi;

/// A native object that needs an explicit release call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Buffer(vk::Buffer),
    Memory(vk::DeviceMemory),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    ShaderModule(vk::ShaderModule),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    DescriptorPool(vk::DescriptorPool),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
    CommandBuffer { pool: vk::CommandPool, buffer: vk::CommandBuffer },
    CommandPool(vk::CommandPool),
    Swapchain(vk::SwapchainKHR),
}

/// Which registry tier owns a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Permanent,
    Frame,
}

/// Anything that can hand its native objects to the registry.
///
/// `resources()` lists objects in registration order: dependencies first.
pub trait Disposable {
    fn resources(&self) -> Vec<Resource>;
}

impl Disposable for Resource {
    fn resources(&self) -> Vec<Resource> {
        vec![*self]
    }
}

macro_rules! disposable_handle {
    ($($handle:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$handle> for Resource {
                fn from(handle: $handle) -> Self {
                    Resource::$variant(handle)
                }
            }

            impl Disposable for $handle {
                fn resources(&self) -> Vec<Resource> {
                    vec![Resource::$variant(*self)]
                }
            }
        )*
    };
}

disposable_handle! {
    vk::Buffer => Buffer,
    vk::DeviceMemory => Memory,
    vk::Image => Image,
    vk::ImageView => ImageView,
    vk::Sampler => Sampler,
    vk::ShaderModule => ShaderModule,
    vk::Pipeline => Pipeline,
    vk::PipelineLayout => PipelineLayout,
    vk::RenderPass => RenderPass,
    vk::Framebuffer => Framebuffer,
    vk::DescriptorPool => DescriptorPool,
    vk::DescriptorSetLayout => DescriptorSetLayout,
    vk::Semaphore => Semaphore,
    vk::Fence => Fence,
    vk::CommandPool => CommandPool,
    vk::SwapchainKHR => Swapchain,
}

impl<T: Disposable> Disposable for [T] {
    fn resources(&self) -> Vec<Resource> {
        self.iter().flat_map(Disposable::resources).collect()
    }
}

impl<T: Disposable> Disposable for Vec<T> {
    fn resources(&self) -> Vec<Resource> {
        self.as_slice().resources()
    }
}

/// Release one resource, logging and swallowing any fault.
///
/// A leak at teardown is preferable to aborting halfway through it.
pub fn destroy_logged<D: DeviceApi + ?Sized>(device: &D, resource: Resource) {
    log::trace!("Destroying {:?}", resource);
    if let Err(e) = device.destroy(resource) {
        log::error!("Failed to destroy {:?}: {:?} (leaked)", resource, e);
    }
}

/// Two LIFO stacks of owned native objects
#[derive(Debug, Default)]
pub struct DisposalRegistry {
    permanent: Vec<Resource>,
    frame: Vec<Resource>,
}

impl DisposalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register into the permanent tier, handing the value back to the caller
    pub fn register_permanent<R: Disposable>(&mut self, value: R) -> R {
        self.register(Tier::Permanent, value)
    }

    /// Register into the frame tier, handing the value back to the caller
    pub fn register_frame<R: Disposable>(&mut self, value: R) -> R {
        self.register(Tier::Frame, value)
    }

    pub fn register<R: Disposable>(&mut self, tier: Tier, value: R) -> R {
        for resource in value.resources() {
            debug_assert!(
                !self.contains(&resource),
                "{:?} registered twice; it would be destroyed twice",
                resource
            );
            match tier {
                Tier::Permanent => self.permanent.push(resource),
                Tier::Frame => self.frame.push(resource),
            }
        }
        value
    }

    /// Borrow one tier for an initialization phase
    pub fn scope(&mut self, tier: Tier) -> TierScope<'_> {
        TierScope { registry: self, tier }
    }

    /// Destroy every frame-tier resource, newest first. Safe on an empty tier.
    pub fn drain_frame<D: DeviceApi + ?Sized>(&mut self, device: &D) -> usize {
        let count = self.frame.len();
        if count > 0 {
            log::debug!("Draining {} frame-tier resources", count);
        }
        while let Some(resource) = self.frame.pop() {
            destroy_logged(device, resource);
        }
        count
    }

    /// Drain the frame tier, then the permanent tier, each newest first
    pub fn drain_all<D: DeviceApi + ?Sized>(&mut self, device: &D) -> usize {
        let frame = self.drain_frame(device);
        let permanent = self.permanent.len();
        if permanent > 0 {
            log::debug!("Draining {} permanent-tier resources", permanent);
        }
        while let Some(resource) = self.permanent.pop() {
            destroy_logged(device, resource);
        }
        frame + permanent
    }

    pub fn contains(&self, resource: &Resource) -> bool {
        self.permanent.contains(resource) || self.frame.contains(resource)
    }

    pub fn frame_resources(&self) -> &[Resource] {
        &self.frame
    }

    pub fn permanent_resources(&self) -> &[Resource] {
        &self.permanent
    }

    pub fn is_empty(&self) -> bool {
        self.permanent.is_empty() && self.frame.is_empty()
    }
}

/// Registration handle for exactly one tier.
///
/// Handed to initialization hooks so they cannot register into the wrong tier.
pub struct TierScope<'a> {
    registry: &'a mut DisposalRegistry,
    tier: Tier,
}

impl TierScope<'_> {
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Take ownership of `value`'s native objects and return it
    pub fn adopt<R: Disposable>(&mut self, value: R) -> R {
        self.registry.register(self.tier, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{FailPoint, MockDevice};
    use ash::vk::Handle;

    fn view(raw: u64) -> vk::ImageView {
        vk::ImageView::from_raw(raw)
    }

    #[test]
    fn frame_drain_is_reverse_registration_order() {
        let device = MockDevice::new();
        let mut registry = DisposalRegistry::new();

        let swapchain = vk::SwapchainKHR::from_raw(1);
        let views = [view(2), view(3)];
        let framebuffers = [vk::Framebuffer::from_raw(4), vk::Framebuffer::from_raw(5)];
        let pipeline = vk::Pipeline::from_raw(6);

        registry.register_frame(swapchain);
        registry.register_frame(views[0]);
        registry.register_frame(views[1]);
        registry.register_frame(framebuffers[0]);
        registry.register_frame(framebuffers[1]);
        registry.register_frame(pipeline);

        assert_eq!(registry.drain_frame(&device), 6);
        assert_eq!(
            device.destroyed(),
            vec![
                Resource::Pipeline(pipeline),
                Resource::Framebuffer(framebuffers[1]),
                Resource::Framebuffer(framebuffers[0]),
                Resource::ImageView(views[1]),
                Resource::ImageView(views[0]),
                Resource::Swapchain(swapchain),
            ]
        );
        assert!(registry.frame_resources().is_empty());
    }

    #[test]
    fn draining_empty_frame_tier_destroys_nothing() {
        let device = MockDevice::new();
        let mut registry = DisposalRegistry::new();
        registry.register_permanent(vk::Sampler::from_raw(9));

        assert_eq!(registry.drain_frame(&device), 0);
        assert_eq!(registry.drain_frame(&device), 0);
        assert!(device.destroyed().is_empty());
        assert_eq!(registry.permanent_resources().len(), 1);
    }

    #[test]
    fn drain_all_empties_frame_before_permanent() {
        let device = MockDevice::new();
        let mut registry = DisposalRegistry::new();

        let memory = vk::DeviceMemory::from_raw(10);
        let image = vk::Image::from_raw(11);
        registry.register_permanent(memory);
        registry.register_permanent(image);
        registry.register_frame(view(12));
        registry.register_frame(vk::Framebuffer::from_raw(13));

        assert_eq!(registry.drain_all(&device), 4);
        assert_eq!(
            device.destroyed(),
            vec![
                Resource::Framebuffer(vk::Framebuffer::from_raw(13)),
                Resource::ImageView(view(12)),
                Resource::Image(image),
                Resource::Memory(memory),
            ]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn lifo_holds_for_long_sequences() {
        let device = MockDevice::new();
        let mut registry = DisposalRegistry::new();
        let fences: Vec<_> = (1..=64).map(vk::Fence::from_raw).collect();
        for &fence in &fences {
            registry.register_permanent(fence);
        }

        registry.drain_all(&device);

        let expected: Vec<_> = fences.iter().rev().map(|&f| Resource::Fence(f)).collect();
        assert_eq!(device.destroyed(), expected);
    }

    #[test]
    fn destroy_failure_is_swallowed_and_drain_continues() {
        let device = MockDevice::new();
        let mut registry = DisposalRegistry::new();
        registry.register_frame(view(1));
        registry.register_frame(view(2));
        device.fail_once(FailPoint::Destroy, vk::Result::ERROR_UNKNOWN);

        assert_eq!(registry.drain_frame(&device), 2);
        assert!(registry.frame_resources().is_empty());
        // The failing call is still attempted and logged; the next one proceeds
        assert_eq!(device.destroyed(), vec![Resource::ImageView(view(2)), Resource::ImageView(view(1))]);
    }

    #[test]
    fn scope_registers_into_its_own_tier() {
        let mut registry = DisposalRegistry::new();
        {
            let mut scope = registry.scope(Tier::Frame);
            let returned = scope.adopt(vec![view(1), view(2)]);
            assert_eq!(returned.len(), 2);
            assert_eq!(scope.tier(), Tier::Frame);
        }
        assert_eq!(registry.frame_resources().len(), 2);
        assert!(registry.permanent_resources().is_empty());
    }
}

// Frame lifecycle - permanent setup, frame-tier (re)creation, per-tick submission
//
//   Uninitialized -> PermanentReady -> FrameReady <-> Resizing
//   any state -> Disposed
//
// The application plugs in behaviour through closures: one builds frame-tier
// resources against the current swapchain, one records the rendering body of
// each per-image command buffer, and an optional one updates per-tick data.
// Frame-tier teardown always follows an idle wait, and every rebuild allocates
// and records a fresh set of command buffers.

use std::time::Duration;

use ash::vk;

use crate::backend::api::{DeviceApi, QueueRole, Submission};
use crate::backend::swapchain::{create_swapchain_frame, is_zero_area, SurfacePreferences, SwapchainFrame};
use crate::backend::sync::{timeout_ns, wait_for_fence, wait_idle, FrameSync, WaitTimeouts};
use crate::barrier::record_swapchain_pass;
use crate::disposal::{DisposalRegistry, Resource, Tier, TierScope};
use crate::error::{GpuError, GpuResult, VkResultExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    PermanentReady,
    FrameReady,
    Resizing,
    Disposed,
}

/// What a call to [`Lifecycle::tick`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Presented,
    /// Nothing submitted: minimised surface or no image available in time
    Skipped,
    /// The swapchain was out of date or suboptimal and has been rebuilt
    Recreated,
}

/// One swapchain image as seen by the record and update hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTarget {
    pub index: usize,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

#[derive(Debug, Clone, Default)]
pub struct LifecycleSettings {
    pub surface: SurfacePreferences,
    pub timeouts: WaitTimeouts,
}

type BuildHook<D, T> = Box<dyn FnMut(&D, &mut TierScope<'_>, &mut T, &SwapchainFrame) -> GpuResult<()>>;
type RecordHook<D, T> = Box<dyn FnMut(&D, vk::CommandBuffer, &T, ImageTarget)>;
type UpdateHook<D, T> = Box<dyn FnMut(&D, &mut T, Duration, ImageTarget) -> GpuResult<()>>;

/// The pluggable phases of the frame lifecycle
pub struct FrameHooks<D, T> {
    build: BuildHook<D, T>,
    record: RecordHook<D, T>,
    update: Option<UpdateHook<D, T>>,
}

impl<D, T> FrameHooks<D, T> {
    /// `build` registers frame-tier resources through the scope it is handed;
    /// `record` fills in the body of one image's command buffer. Ownership
    /// barriers around the body are recorded by the lifecycle.
    pub fn new(
        build: impl FnMut(&D, &mut TierScope<'_>, &mut T, &SwapchainFrame) -> GpuResult<()> + 'static,
        record: impl FnMut(&D, vk::CommandBuffer, &T, ImageTarget) + 'static,
    ) -> Self {
        Self { build: Box::new(build), record: Box::new(record), update: None }
    }

    /// Runs every tick after the in-flight fence has signaled, before submission
    pub fn with_update(
        mut self,
        update: impl FnMut(&D, &mut T, Duration, ImageTarget) -> GpuResult<()> + 'static,
    ) -> Self {
        self.update = Some(Box::new(update));
        self
    }
}

struct ActiveFrame {
    swapchain: SwapchainFrame,
    command_buffers: Vec<vk::CommandBuffer>,
}

/// Drives a device through the frame lifecycle and owns every resource registered on it
pub struct Lifecycle<D: DeviceApi, T> {
    device: D,
    settings: LifecycleSettings,
    registry: DisposalRegistry,
    state: LifecycleState,
    app: Option<T>,
    hooks: Option<FrameHooks<D, T>>,
    sync: Option<FrameSync>,
    frame: Option<ActiveFrame>,
    extent: vk::Extent2D,
}

impl<D: DeviceApi, T> Lifecycle<D, T> {
    pub fn new(device: D, settings: LifecycleSettings) -> Self {
        Self {
            device,
            settings,
            registry: DisposalRegistry::new(),
            state: LifecycleState::Uninitialized,
            app: None,
            hooks: None,
            sync: None,
            frame: None,
            extent: vk::Extent2D::default(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn app(&self) -> Option<&T> {
        self.app.as_ref()
    }

    pub fn app_mut(&mut self) -> Option<&mut T> {
        self.app.as_mut()
    }

    pub fn registry(&self) -> &DisposalRegistry {
        &self.registry
    }

    pub fn swapchain(&self) -> Option<&SwapchainFrame> {
        self.frame.as_ref().map(|f| &f.swapchain)
    }

    pub fn command_buffers(&self) -> &[vk::CommandBuffer] {
        self.frame.as_ref().map_or(&[], |f| f.command_buffers.as_slice())
    }

    /// Last extent requested through `initialize_frame` or `resize`
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Takes effect on the next frame-tier rebuild
    pub fn set_surface_preferences(&mut self, preferences: SurfacePreferences) {
        self.settings.surface = preferences;
    }

    /// Applies to every wait from the next one on
    pub fn set_timeouts(&mut self, timeouts: WaitTimeouts) {
        self.settings.timeouts = timeouts;
    }

    fn expect_state(&self, operation: &'static str, allowed: &[LifecycleState]) -> GpuResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(GpuError::InvalidState { operation, state: self.state })
        }
    }

    /// Create the frame-sync objects and run `init` to build the application's permanent resources
    pub fn initialize_permanent<F>(&mut self, init: F) -> GpuResult<()>
    where
        F: FnOnce(&D, &mut TierScope<'_>) -> GpuResult<T>,
    {
        self.expect_state("initialize permanent resources", &[LifecycleState::Uninitialized])?;

        let sync = self.registry.register_permanent(FrameSync::new(&self.device)?);
        self.sync = Some(sync);

        let app = init(&self.device, &mut self.registry.scope(Tier::Permanent))?;
        self.app = Some(app);

        self.state = LifecycleState::PermanentReady;
        log::info!(
            "Permanent tier ready ({} resources)",
            self.registry.permanent_resources().len()
        );
        Ok(())
    }

    /// Install the frame hooks and build the first frame tier at `extent`
    pub fn initialize_frame(&mut self, extent: vk::Extent2D, hooks: FrameHooks<D, T>) -> GpuResult<()> {
        self.expect_state("initialize frame resources", &[LifecycleState::PermanentReady])?;
        if self.hooks.is_some() {
            return Err(GpuError::InvalidState { operation: "initialize frame resources twice", state: self.state });
        }
        self.hooks = Some(hooks);
        self.extent = extent;
        self.build_frame(extent)
    }

    /// Idle the device, drop the frame tier and rebuild it at `extent`
    pub fn resize(&mut self, extent: vk::Extent2D) -> GpuResult<()> {
        self.expect_state("resize", &[LifecycleState::FrameReady, LifecycleState::PermanentReady])?;
        if self.hooks.is_none() {
            return Err(GpuError::InvalidState { operation: "resize before frame initialization", state: self.state });
        }

        log::info!("Resizing to {}x{}", extent.width, extent.height);
        self.state = LifecycleState::Resizing;
        self.extent = extent;

        wait_idle(&self.device, self.settings.timeouts.idle)?;
        self.frame = None;
        self.registry.drain_frame(&self.device);

        self.build_frame(extent)
    }

    fn build_frame(&mut self, extent: vk::Extent2D) -> GpuResult<()> {
        match self.create_frame_tier(extent) {
            Ok(Some(frame)) => {
                log::info!(
                    "Frame tier ready: {}x{}, {} images, {} resources",
                    frame.swapchain.extent.width,
                    frame.swapchain.extent.height,
                    frame.swapchain.image_count(),
                    self.registry.frame_resources().len()
                );
                self.frame = Some(frame);
                self.state = LifecycleState::FrameReady;
                Ok(())
            }
            Ok(None) => {
                log::info!("Surface is minimised; frame tier stays empty until the next resize");
                self.state = LifecycleState::PermanentReady;
                Ok(())
            }
            Err(e) => {
                log::error!("Frame tier creation failed: {}", e);
                self.registry.drain_frame(&self.device);
                self.state = LifecycleState::PermanentReady;
                Err(e)
            }
        }
    }

    fn create_frame_tier(&mut self, extent: vk::Extent2D) -> GpuResult<Option<ActiveFrame>> {
        if is_zero_area(extent) {
            return Ok(None);
        }

        let Self { device, settings, registry, state, app, hooks, .. } = self;
        let (Some(app), Some(hooks)) = (app.as_mut(), hooks.as_mut()) else {
            return Err(GpuError::InvalidState { operation: "build frame resources", state: *state });
        };

        let mut scope = registry.scope(Tier::Frame);
        let Some(swapchain) = create_swapchain_frame(&*device, &mut scope, &settings.surface, extent)? else {
            return Ok(None);
        };

        (hooks.build)(&*device, &mut scope, app, &swapchain)?;

        let pool = device.command_pool(QueueRole::Graphics);
        let command_buffers = device
            .allocate_command_buffers(pool, swapchain.image_count() as u32)
            .creating("frame command buffers")?;
        for &buffer in &command_buffers {
            scope.adopt(Resource::CommandBuffer { pool, buffer });
        }

        record_frame_commands(&*device, &mut hooks.record, app, &swapchain, &command_buffers)?;

        Ok(Some(ActiveFrame { swapchain, command_buffers }))
    }

    /// Run one frame: wait for the previous one, acquire, update, submit, present
    pub fn tick(&mut self, delta: Duration) -> GpuResult<TickOutcome> {
        self.expect_state("tick", &[LifecycleState::FrameReady, LifecycleState::PermanentReady])?;
        let (Some(frame), Some(sync)) = (self.frame.as_ref(), self.sync) else {
            // Minimised, or frame hooks not installed yet
            return Ok(TickOutcome::Skipped);
        };
        let swapchain = frame.swapchain.swapchain;
        let timeouts = self.settings.timeouts;

        wait_for_fence(&self.device, sync.in_flight_fence, timeouts.fence, "waiting for the frame in flight")?;

        let (image_index, acquire_suboptimal) = match self.device.acquire_next_image(
            swapchain,
            sync.image_available,
            timeout_ns(timeouts.acquire),
        ) {
            Ok(acquired) => acquired,
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
                log::debug!("No swapchain image available, skipping tick");
                return Ok(TickOutcome::Skipped);
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date at acquire");
                self.resize(self.extent)?;
                return Ok(TickOutcome::Recreated);
            }
            Err(result) => return Err(GpuError::from_creation("swapchain image acquisition", result)),
        };

        let index = image_index as usize;
        let target = {
            let swapchain = &frame.swapchain;
            ImageTarget {
                index,
                image: swapchain.images[index],
                view: swapchain.views[index],
                extent: swapchain.extent,
                format: swapchain.format.format,
            }
        };
        let command_buffer = frame.command_buffers[index];

        // From here on the acquired image is always submitted and presented,
        // so `image_available` is waited on before the next acquire. Failures
        // of the update hook or the fence reset are reported afterwards.
        let updated = match (self.hooks.as_mut(), self.app.as_mut()) {
            (Some(hooks), Some(app)) => match hooks.update.as_mut() {
                Some(update) => update(&self.device, app, delta, target),
                None => Ok(()),
            },
            _ => Ok(()),
        };
        if let Err(e) = &updated {
            log::error!("Frame update failed, submitting the recorded frame anyway: {}", e);
        }

        let (fence, reset) = match self.device.reset_fence(sync.in_flight_fence).creating("in-flight fence reset") {
            Ok(()) => (sync.in_flight_fence, Ok(())),
            Err(e) => {
                log::error!("{}; submitting without a fence", e);
                (vk::Fence::null(), Err(e))
            }
        };

        let wait = [(sync.image_available, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)];
        let command_buffers = [command_buffer];
        let signal = [sync.render_finished];
        let submission = Submission { wait: &wait, command_buffers: &command_buffers, signal: &signal };
        self.device
            .queue_submit(self.device.queue(QueueRole::Graphics), &submission, fence)
            .creating("frame submission")?;

        let present = self.device.queue_present(
            self.device.queue(QueueRole::Present),
            swapchain,
            image_index,
            &[sync.render_finished],
        );

        if reset.is_err() {
            // Nothing fences this submission; idle before its command buffer can be reused
            wait_idle(&self.device, timeouts.idle)?;
        }

        let outcome = match present {
            Ok(false) if !acquire_suboptimal => TickOutcome::Presented,
            Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain suboptimal or out of date at present");
                self.resize(self.extent)?;
                TickOutcome::Recreated
            }
            Err(result) => return Err(GpuError::from_creation("presentation", result)),
        };

        updated?;
        reset?;
        Ok(outcome)
    }

    /// Idle the device and release every registered resource, frame tier first.
    ///
    /// If the device never goes idle nothing is released: the handles are
    /// leaked rather than destroyed while still in use.
    pub fn dispose(&mut self) -> GpuResult<()> {
        if self.state == LifecycleState::Disposed {
            return Ok(());
        }
        let previous = self.state;
        self.state = LifecycleState::Disposed;
        self.frame = None;
        self.hooks = None;
        self.sync = None;

        if !self.registry.is_empty() {
            if let Err(e) = wait_idle(&self.device, self.settings.timeouts.idle) {
                log::error!("Device did not go idle during disposal, leaking resources: {}", e);
                return Err(e);
            }
        }

        let released = self.registry.drain_all(&self.device);
        log::info!("Disposed lifecycle from {:?} ({} resources released)", previous, released);
        Ok(())
    }
}

impl<D: DeviceApi, T> Drop for Lifecycle<D, T> {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            log::error!("Lifecycle disposal failed on drop: {}", e);
        }
    }
}

/// Fully record one command buffer per swapchain image
fn record_frame_commands<D: DeviceApi, T>(
    device: &D,
    record: &mut RecordHook<D, T>,
    app: &T,
    swapchain: &SwapchainFrame,
    command_buffers: &[vk::CommandBuffer],
) -> GpuResult<()> {
    let families = device.queue_families();
    let images = swapchain.images.iter().zip(&swapchain.views);

    for (index, (&command_buffer, (&image, &view))) in command_buffers.iter().zip(images).enumerate() {
        device
            .begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::empty())
            .creating("frame command recording")?;

        let target = ImageTarget {
            index,
            image,
            view,
            extent: swapchain.extent,
            format: swapchain.format.format,
        };
        record_swapchain_pass(device, command_buffer, &families, image, || {
            record(device, command_buffer, app, target)
        });

        device
            .end_command_buffer(command_buffer)
            .creating("frame command recording")?;
    }

    log::debug!("Recorded {} frame command buffers", command_buffers.len());
    Ok(())
}

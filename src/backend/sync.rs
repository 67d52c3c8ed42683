// Synchronization primitives
//
// Fences and semaphores for GPU-CPU and GPU-GPU sync, plus the two blocking
// waits the core performs: a fence wait after a one-shot submission and an
// idle wait before frame-tier teardown. Both can be bounded; expiry means the
// device has stopped responding and surfaces as DeviceLost.

use std::time::Duration;

use ash::vk;

use super::api::{DeviceApi, QueueRole, Submission};
use crate::disposal::{destroy_logged, Disposable, Resource};
use crate::error::{GpuError, GpuResult, VkResultExt};

/// Upper bounds for blocking waits. `None` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeouts {
    pub fence: Option<Duration>,
    pub idle: Option<Duration>,
    pub acquire: Option<Duration>,
}

impl Default for WaitTimeouts {
    fn default() -> Self {
        Self {
            fence: Some(Duration::from_secs(5)),
            idle: Some(Duration::from_secs(5)),
            acquire: None,
        }
    }
}

impl WaitTimeouts {
    pub const UNBOUNDED: Self = Self { fence: None, idle: None, acquire: None };
}

/// Timeout in the nanosecond form native waits expect
pub fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
}

/// Frame synchronization for the single frame in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new<D: DeviceApi + ?Sized>(device: &D) -> GpuResult<Self> {
        let image_available = device.create_semaphore().creating("semaphore")?;
        let render_finished = match device.create_semaphore().creating("semaphore") {
            Ok(semaphore) => semaphore,
            Err(e) => {
                destroy_logged(device, Resource::Semaphore(image_available));
                return Err(e);
            }
        };
        // Start signaled so the first wait returns immediately
        let in_flight_fence = match device.create_fence(true).creating("fence") {
            Ok(fence) => fence,
            Err(e) => {
                destroy_logged(device, Resource::Semaphore(render_finished));
                destroy_logged(device, Resource::Semaphore(image_available));
                return Err(e);
            }
        };

        Ok(Self { image_available, render_finished, in_flight_fence })
    }
}

impl Disposable for FrameSync {
    fn resources(&self) -> Vec<Resource> {
        vec![
            Resource::Semaphore(self.image_available),
            Resource::Semaphore(self.render_finished),
            Resource::Fence(self.in_flight_fence),
        ]
    }
}

/// Block until `fence` signals or the timeout expires
pub fn wait_for_fence<D: DeviceApi + ?Sized>(
    device: &D,
    fence: vk::Fence,
    timeout: Option<Duration>,
    during: &'static str,
) -> GpuResult<()> {
    device.wait_for_fence(fence, timeout_ns(timeout)).waiting(during)
}

/// Block until no queue has work in flight.
///
/// Unbounded: a plain device idle. Bounded: an empty submission with a fence
/// on each distinct queue and a timed wait on each fence (an empty batch
/// signals only after everything submitted before it has completed), then
/// the device idle. Fences do not cover presentation, so the final idle is
/// what guarantees no present still references the swapchain; once the
/// fences have signaled it only has presents left to wait for.
pub fn wait_idle<D: DeviceApi + ?Sized>(device: &D, timeout: Option<Duration>) -> GpuResult<()> {
    let Some(timeout) = timeout else {
        return device.device_wait_idle().waiting("waiting for device idle");
    };

    let families = device.queue_families();
    let mut queues = Vec::new();
    for role in [QueueRole::Graphics, QueueRole::Present, QueueRole::Compute] {
        let family = families.family(role);
        if !queues.iter().any(|&(f, _)| f == family) {
            queues.push((family, device.queue(role)));
        }
    }

    for (family, queue) in queues {
        let fence = device.create_fence(false).creating("idle fence")?;
        if let Err(result) = device.queue_submit(queue, &Submission::default(), fence) {
            destroy_logged(device, Resource::Fence(fence));
            return Err(GpuError::from_creation("idle submission", result));
        }
        match device.wait_for_fence(fence, timeout_ns(Some(timeout))) {
            Ok(()) => destroy_logged(device, Resource::Fence(fence)),
            Err(result) => {
                // Still pending on the queue; releasing it now would be a use-after-free
                log::error!("Queue family {} did not go idle within {:?}: {:?}", family, timeout, result);
                return Err(GpuError::DeviceLost { during: "waiting for queue idle", result });
            }
        }
    }

    device.device_wait_idle().waiting("waiting for device idle")
}

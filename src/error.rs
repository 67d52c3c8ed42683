// Error taxonomy for the frame-resource core
//
// Every failure propagates synchronously to the caller of the operation that
// started it. Nothing here is retried internally.

use ash::{prelude::VkResult, vk};
use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// Errors surfaced by device setup, uploads and the frame lifecycle
#[derive(Error, Debug)]
pub enum GpuError {
    /// No adapter offers both a graphics queue and presentation to the surface
    #[error("no suitable GPU: {reason}")]
    NoSuitableDevice { reason: String },

    /// A native creation/allocation call failed
    #[error("failed to create {what}: {result:?}")]
    ResourceCreation { what: &'static str, result: vk::Result },

    /// A fence or idle wait did not complete, or the driver reported device loss
    #[error("device lost while {during}: {result:?}")]
    DeviceLost { during: &'static str, result: vk::Result },

    /// None of the candidate formats supports the required features
    #[error("no supported {what} format among {candidates:?}")]
    UnsupportedFormat { what: &'static str, candidates: Vec<vk::Format> },

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    #[error("cannot {operation} while lifecycle is {state:?}")]
    InvalidState { operation: &'static str, state: LifecycleState },

    #[error("failed to load Vulkan library: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error("initialization failed: {0}")]
    Initialization(String),
}

pub type GpuResult<T> = Result<T, GpuError>;

impl GpuError {
    /// Classify a native failure from a creation call
    pub fn from_creation(what: &'static str, result: vk::Result) -> Self {
        if result == vk::Result::ERROR_DEVICE_LOST {
            Self::DeviceLost { during: what, result }
        } else {
            Self::ResourceCreation { what, result }
        }
    }

    /// True when the session cannot continue (no recovery path exists)
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost { .. })
    }
}

/// Mapping helpers from raw `VkResult`s into the taxonomy
pub trait VkResultExt<T> {
    /// Creation failure: `ResourceCreation`, or `DeviceLost` for a device-lost status
    fn creating(self, what: &'static str) -> GpuResult<T>;

    /// Wait failure: any status, timeouts included, means the device stopped responding
    fn waiting(self, during: &'static str) -> GpuResult<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn creating(self, what: &'static str) -> GpuResult<T> {
        self.map_err(|result| GpuError::from_creation(what, result))
    }

    fn waiting(self, during: &'static str) -> GpuResult<T> {
        self.map_err(|result| GpuError::DeviceLost { during, result })
    }
}

// Staged renderer - frame-resource lifecycle and synchronous GPU uploads over ash
//
// Resources live in one of two disposal tiers: permanent (the whole run) or
// frame (the current swapchain configuration). Uploads go through a staging
// buffer and a fence-gated one-shot command buffer. Swapchain images and
// shared buffers change queue family through explicit ownership barriers.

pub mod backend;
pub mod barrier;
pub mod config;
pub mod disposal;
pub mod error;
pub mod lifecycle;
pub mod transfer;

pub use backend::VulkanDevice;
pub use disposal::{Disposable, DisposalRegistry, Resource, Tier, TierScope};
pub use error::{GpuError, GpuResult};
pub use lifecycle::{FrameHooks, ImageTarget, Lifecycle, LifecycleSettings, LifecycleState, TickOutcome};

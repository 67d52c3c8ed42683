// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section falls back to defaults, field by field, so a partial file is
// fine. A missing or malformed file means all defaults. ConfigWatcher picks
// up edits while the application runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ash::vk;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::backend::swapchain::SurfacePreferences;
use crate::backend::sync::WaitTimeouts;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub sync: SyncConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Staged Renderer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
        }
    }
}

/// Upper bounds on blocking waits, in milliseconds. 0 waits forever.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub fence_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fence_timeout_ms: 5000,
            idle_timeout_ms: 5000,
            acquire_timeout_ms: 0,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "staged_renderer.log".to_string(),
        }
    }
}

fn bound(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Config {
    pub const DEFAULT_PATH: &'static str = "config.toml";

    /// Load configuration from config.toml, falling back to defaults
    pub fn load() -> Self {
        Self::load_from_path(Self::DEFAULT_PATH).unwrap_or_else(|e| {
            log::warn!("Failed to load {}: {:#}. Using defaults.", Self::DEFAULT_PATH, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path; a missing file is not an error
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Present mode as Vulkan enum; unknown names fall back to FIFO
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!("Unknown present mode '{}', defaulting to FIFO", self.graphics.present_mode);
                vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn timeouts(&self) -> WaitTimeouts {
        WaitTimeouts {
            fence: bound(self.sync.fence_timeout_ms),
            idle: bound(self.sync.idle_timeout_ms),
            acquire: bound(self.sync.acquire_timeout_ms),
        }
    }

    pub fn surface_preferences(&self) -> SurfacePreferences {
        SurfacePreferences { present_mode: self.present_mode(), ..SurfacePreferences::default() }
    }

    /// True when switching from `self` to `other` needs the frame tier rebuilt
    pub fn requires_frame_rebuild(&self, other: &Config) -> bool {
        self.graphics != other.graphics
    }
}

/// Watches the config file and keeps the latest version that parsed
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    latest: Arc<Mutex<Option<Config>>>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path: PathBuf = path.into();
        let latest = Arc::new(Mutex::new(None));

        // Editors often replace the file instead of writing it, so watch the directory
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(|name| name.to_os_string());

        let slot = Arc::clone(&latest);
        let watched = path.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("Config watch error: {}", e);
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            if !event.paths.iter().any(|p| p.file_name().map(|n| n.to_os_string()) == file_name) {
                return;
            }
            match Config::load_from_path(&watched) {
                Ok(config) => *slot.lock() = Some(config),
                Err(e) => log::warn!("Ignoring config change: {:#}", e),
            }
        })
        .context("Failed to create config watcher")?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", directory))?;
        log::info!("Watching {:?} for changes", path);

        Ok(Self { _watcher: watcher, latest })
    }

    /// The newest successfully parsed config since the last call, if any
    pub fn take_update(&self) -> Option<Config> {
        self.latest.lock().take()
    }
}

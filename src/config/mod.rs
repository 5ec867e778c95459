//! Configuration file management
//!
//! Loads TOML configuration files and provides session manager settings.
//! Default config path: ~/.config/dsm/config.toml

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session policy settings
    pub session: SessionConfig,
    /// Bounded wait settings
    pub timeouts: TimeoutConfig,
    /// Device settings (daemon only)
    pub device: DeviceConfig,
}

/// Session policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Create pluggable displays without waiting for earlier first commits
    pub disable_hotplug_bwcheck: bool,
    /// Let a new pluggable display push the active built-in to a
    /// lower-resource configuration
    pub enable_primary_reconfig_req: bool,
    /// Allow virtual display creation on a worker thread
    pub async_vds_creation: bool,
    /// Built-in slots (primary included when it is built-in)
    pub max_builtin: usize,
    /// Pluggable slots (primary included when it is pluggable)
    pub max_pluggable: usize,
    /// Virtual slots
    pub max_virtual: usize,
    /// Idle timeout while content is updating (0 = disabled)
    pub idle_time_active_ms: u32,
    /// Idle timeout while content is static (0 = disabled)
    pub idle_time_inactive_ms: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            disable_hotplug_bwcheck: false,
            enable_primary_reconfig_req: false,
            async_vds_creation: false,
            max_builtin: DEFAULT_MAX_BUILTIN,
            max_pluggable: DEFAULT_MAX_PLUGGABLE,
            max_virtual: DEFAULT_MAX_VIRTUAL,
            idle_time_active_ms: 0,
            idle_time_inactive_ms: 0,
        }
    }
}

/// Bounded wait settings (milliseconds unless noted)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Resource-readiness wait after a pluggable display connects
    pub hotplug_resource_ms: u64,
    /// Margin added to vsync-derived commit waits
    pub commit_done_margin_ms: u64,
    /// Margin added to each vm-release attempt
    pub vm_release_margin_ms: u64,
    /// Extra vm-release attempts (count)
    pub vm_release_retries: u32,
    /// Draw cycles allowed for a commit to land (count)
    pub draw_cycles: u64,
    /// Wait for an in-flight commit sequence to settle
    pub sequence_settle_ms: u64,
    /// Wait for the previous TUI completion notifier
    pub tui_callback_wait_ms: u64,
    /// Upper bound of the asynchronous commit waiter
    pub async_commit_wait_ms: u64,
    /// Fence waits performed by the session manager
    pub fence_wait_ms: u64,
    /// Primary bring-up attempts (count)
    pub primary_bringup_retries: u32,
    /// Delay between primary bring-up attempts
    pub primary_bringup_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            hotplug_resource_ms: HOTPLUG_RESOURCE_WAIT_MS,
            commit_done_margin_ms: COMMIT_DONE_MARGIN_MS,
            vm_release_margin_ms: VM_RELEASE_MARGIN_MS,
            vm_release_retries: VM_RELEASE_RETRIES,
            draw_cycles: NUM_DRAW_CYCLES,
            sequence_settle_ms: SEQUENCE_SETTLE_MS,
            tui_callback_wait_ms: TUI_CALLBACK_WAIT_MS,
            async_commit_wait_ms: ASYNC_COMMIT_WAIT_MS,
            fence_wait_ms: FENCE_WAIT_MS,
            primary_bringup_retries: PRIMARY_BRINGUP_RETRIES,
            primary_bringup_interval_ms: PRIMARY_BRINGUP_INTERVAL_MS,
        }
    }
}

impl TimeoutConfig {
    /// Commit wait for a display with the given vsync period
    pub fn commit_wait(&self, vsync_period_ns: u64) -> Duration {
        let vsync_ms = vsync_period_ns / NS_PER_MS;
        Duration::from_millis(self.draw_cycles * vsync_ms + self.commit_done_margin_ms)
    }

    pub fn hotplug_resource(&self) -> Duration {
        Duration::from_millis(self.hotplug_resource_ms)
    }

    pub fn sequence_settle(&self) -> Duration {
        Duration::from_millis(self.sequence_settle_ms)
    }

    pub fn fence_wait(&self) -> Duration {
        Duration::from_millis(self.fence_wait_ms)
    }
}

/// Device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// DRM device node probed for connectors
    pub drm_path: String,
    /// Watch udev for connector hotplug events
    pub hotplug_monitor: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            drm_path: "/dev/dri/card0".to_string(),
            hotplug_monitor: true,
        }
    }
}

impl Config {
    /// System-wide config path
    const SYSTEM_CONFIG_PATH: &'static str = "/etc/dsm/config.toml";

    /// Get the path that would be used for loading config
    /// Returns None if using built-in defaults
    pub fn config_path() -> Option<PathBuf> {
        // 1. DSM_CONFIG environment variable
        if let Ok(path) = std::env::var("DSM_CONFIG") {
            let p = std::path::Path::new(&path);
            if p.exists() {
                return Some(p.to_path_buf());
            }
        }

        // 2. User config: ~/.config/dsm/config.toml
        if let Some(path) = default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        // 3. System config: /etc/dsm/config.toml
        let system_config = std::path::Path::new(Self::SYSTEM_CONFIG_PATH);
        if system_config.exists() {
            return Some(system_config.to_path_buf());
        }

        None
    }

    /// Load configuration with priority:
    /// 1. DSM_CONFIG environment variable
    /// 2. ~/.config/dsm/config.toml (user config)
    /// 3. /etc/dsm/config.toml (system config)
    /// 4. Built-in defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            match Self::load_from_file(path.to_string_lossy().as_ref()) {
                Ok(config) => {
                    info!("Loaded config: {}", path.display());
                    return config;
                }
                Err(e) => {
                    warn!("Failed to load config {}: {}", path.display(), e);
                }
            }
        }
        info!("Using built-in default config");
        Self::default()
    }

    /// Load settings from specified path
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse config file: {}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Write the built-in defaults to the user config path
    pub fn write_default_config() -> Result<PathBuf> {
        let config_path = default_config_path().context("No config directory available")?;
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content =
            toml::to_string_pretty(&Self::default()).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        info!("Wrote default config: {}", config_path.display());
        Ok(config_path)
    }
}

/// Get default config file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("dsm").join("config.toml"))
}

//! DRM hotplug detection
//!
//! Monitors udev events for DRM connector changes (monitor plug/unplug)
//! and turns them into session uevent signals.

use anyhow::{Context, Result};
use log::{debug, info};

use crate::session::{parse_uevent, UeventSignal};

/// udev-based hotplug monitor for DRM devices
pub struct HotplugMonitor {
    socket: udev::MonitorSocket,
}

impl HotplugMonitor {
    /// Create a new hotplug monitor for DRM subsystem
    pub fn new() -> Result<Self> {
        let socket = udev::MonitorBuilder::new()
            .context("Failed to create udev monitor builder")?
            .match_subsystem("drm")
            .context("Failed to match drm subsystem")?
            .listen()
            .context("Failed to start udev monitor")?;

        info!("DRM hotplug monitor initialized");
        Ok(Self { socket })
    }

    /// Drain pending udev events (non-blocking)
    ///
    /// Returns the hotplug signals among them, oldest first.
    pub fn poll(&mut self) -> Vec<UeventSignal> {
        let mut signals = Vec::new();
        for event in self.socket.iter() {
            if !event.action().map(|a| a == "change").unwrap_or(false) {
                continue;
            }
            let properties: Vec<(String, String)> = event
                .properties()
                .map(|p| {
                    (
                        p.name().to_string_lossy().into_owned(),
                        p.value().to_string_lossy().into_owned(),
                    )
                })
                .collect();
            let parsed = parse_uevent(properties.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            if let Some(signal) = parsed {
                debug!("DRM hotplug event: {:?}", event.devpath().to_string_lossy());
                signals.push(signal);
            }
        }
        signals
    }
}

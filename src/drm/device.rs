//! DRM device access
//!
//! Opens a DRM device (/dev/dri/card*) and reads its connector list. The
//! session manager never programs KMS directly; the device is only the
//! source of truth for which displays are plugged in.

use anyhow::{anyhow, Context, Result};
use drm::control::{connector, Device as ControlDevice, ResourceHandles};
use drm::Device as BasicDevice;
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, BorrowedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::{DisplayKind, HwDisplayInfo};

/// Global flag for shutdown requested via signal (SIGTERM/SIGINT/SIGHUP)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Check if shutdown was requested (SIGTERM, SIGINT, or SIGHUP)
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

/// Set up signal handlers for graceful shutdown (call once at startup)
///
/// Handles SIGTERM (systemd stop), SIGINT (Ctrl+C), and SIGHUP (terminal hangup).
pub fn setup_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGTERM,
            shutdown_signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            shutdown_signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGHUP,
            shutdown_signal_handler as *const () as libc::sighandler_t,
        );
    }
}

extern "C" fn shutdown_signal_handler(_signo: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

/// DRM device wrapper
pub struct Device {
    file: File,
    resources: ResourceHandles,
}

impl AsFd for Device {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl BasicDevice for Device {}
impl ControlDevice for Device {}

impl Device {
    /// Open DRM device
    ///
    /// # Arguments
    /// * `path` - Device path (e.g., "/dev/dri/card0")
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening DRM device: {}", path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Cannot open DRM device {}", path.display()))?;

        // DRM master is never taken; connector queries do not need it
        struct Probe<'a>(&'a File);
        impl AsFd for Probe<'_> {
            fn as_fd(&self) -> BorrowedFd<'_> {
                self.0.as_fd()
            }
        }
        impl BasicDevice for Probe<'_> {}
        impl ControlDevice for Probe<'_> {}

        let resources = Probe(&file)
            .resource_handles()
            .context("Failed to get DRM resources")?;

        info!(
            "DRM resources: connectors={}, crtcs={}",
            resources.connectors().len(),
            resources.crtcs().len(),
        );

        Ok(Self { file, resources })
    }

    /// Get connector info
    pub fn get_connector(&self, handle: connector::Handle) -> Result<connector::Info> {
        ControlDevice::get_connector(self, handle, false)
            .with_context(|| format!("Failed to get connector {:?} info", handle))
    }

    /// Current state of every connector the device exposes
    pub fn snapshot(&self) -> Result<Vec<ConnectorSnapshot>> {
        let mut snapshots = Vec::new();
        for &handle in self.resources.connectors() {
            match self.get_connector(handle) {
                Ok(info) => snapshots.push(ConnectorSnapshot::from_info(handle, &info)),
                Err(e) => debug!("Skipping connector: {:#}", e),
            }
        }
        if snapshots.is_empty() {
            return Err(anyhow!("DRM device reports no connectors"));
        }
        Ok(snapshots)
    }
}

/// Snapshot of connector state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorSnapshot {
    pub handle: connector::Handle,
    pub connected: bool,
    pub interface: connector::Interface,
}

impl ConnectorSnapshot {
    pub fn from_info(handle: connector::Handle, info: &connector::Info) -> Self {
        Self {
            handle,
            connected: info.state() == connector::State::Connected,
            interface: info.interface(),
        }
    }

    /// Check if this is an internal connector (eDP, LVDS, DSI)
    pub fn is_internal(&self) -> bool {
        is_internal_connector(self.interface)
    }

    pub fn kind(&self) -> DisplayKind {
        display_kind(self.interface)
    }

    pub fn hw_id(&self) -> i32 {
        u32::from(self.handle) as i32
    }
}

/// Convert connector snapshots into the engine's hardware list.
///
/// The first connected internal connector becomes the primary, else the
/// first connected connector of any kind.
pub fn hardware_list(snapshots: &[ConnectorSnapshot]) -> Vec<HwDisplayInfo> {
    let primary = snapshots
        .iter()
        .find(|s| s.connected && s.is_internal())
        .or_else(|| snapshots.iter().find(|s| s.connected))
        .map(|s| s.handle);

    snapshots
        .iter()
        .map(|s| HwDisplayInfo {
            hw_id: s.hw_id(),
            kind: s.kind(),
            is_primary: Some(s.handle) == primary,
            connected: s.connected,
        })
        .collect()
}

/// Display class for a connector interface
pub fn display_kind(interface: connector::Interface) -> DisplayKind {
    if is_internal_connector(interface) {
        DisplayKind::BuiltIn
    } else {
        DisplayKind::Pluggable
    }
}

/// Check if connector is internal (laptop built-in display)
pub fn is_internal_connector(interface: connector::Interface) -> bool {
    use connector::Interface;
    matches!(
        interface,
        Interface::EmbeddedDisplayPort | Interface::LVDS | Interface::DSI
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use connector::Interface;

    #[test]
    fn test_connector_classes() {
        assert!(is_internal_connector(Interface::EmbeddedDisplayPort));
        assert!(!is_internal_connector(Interface::HDMIA));
        assert_eq!(display_kind(Interface::LVDS), DisplayKind::BuiltIn);
        assert_eq!(display_kind(Interface::DisplayPort), DisplayKind::Pluggable);
        // Unknown interfaces are treated as pluggable
        assert_eq!(display_kind(Interface::Unknown), DisplayKind::Pluggable);
    }

    fn snap(raw: u32, interface: Interface, connected: bool) -> ConnectorSnapshot {
        ConnectorSnapshot {
            handle: drm::control::from_u32(raw).unwrap(),
            connected,
            interface,
        }
    }

    #[test]
    fn test_hardware_list_prefers_internal_primary() {
        let hardware = hardware_list(&[
            snap(40, Interface::HDMIA, true),
            snap(41, Interface::EmbeddedDisplayPort, false),
            snap(42, Interface::DSI, true),
        ]);
        assert_eq!(hardware.len(), 3);
        assert_eq!(hardware[0].kind, DisplayKind::Pluggable);
        assert!(!hardware[0].is_primary);
        assert!(!hardware[1].is_primary);
        assert!(hardware[2].is_primary);
        assert_eq!(hardware[2].hw_id, 42);
    }

    #[test]
    fn test_hardware_list_falls_back_to_external_primary() {
        let hardware = hardware_list(&[
            snap(40, Interface::HDMIA, false),
            snap(41, Interface::DisplayPort, true),
        ]);
        assert!(hardware[1].is_primary);
        assert!(!hardware[0].connected);
    }
}

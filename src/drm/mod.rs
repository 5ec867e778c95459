//! DRM connector probing and hotplug monitoring

pub mod device;
pub mod hotplug;

pub use device::{
    hardware_list, setup_signal_handlers, shutdown_requested, ConnectorSnapshot, Device,
};
pub use hotplug::HotplugMonitor;

//! dsm daemon
//!
//! Probes DRM connectors, brings up the session manager on a software
//! Display Engine that mirrors connector state, and feeds udev hotplug
//! events to it until a shutdown signal arrives.

use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use dsm::config::Config;
use dsm::constants::UDEV_POLL_INTERVAL_MS;
use dsm::engine::SoftEngine;
use dsm::session::{ClientCallbacks, SessionManager, TuiEvent};

/// Stand-in compositor: logs hotplugs and presents on every refresh request
#[derive(Default)]
struct DaemonClient {
    manager: Mutex<Weak<SessionManager>>,
}

impl ClientCallbacks for DaemonClient {
    fn on_hotplug(&self, display: u64, connected: bool) {
        info!(
            "Display {} {}",
            display,
            if connected { "connected" } else { "disconnected" }
        );
    }

    fn on_refresh(&self, display: u64) {
        let manager = self
            .manager
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .upgrade();
        let Some(manager) = manager else {
            return;
        };
        thread::spawn(move || {
            if let Err(e) = manager.present(display) {
                warn!("Present on display {} failed: {}", display, e);
            }
        });
    }

    fn on_tui_event_done(&self, display: u64, event: TuiEvent, result: &dsm::Result<()>) {
        info!("Trusted UI {:?} on display {}: {:?}", event, display, result);
    }
}

fn print_help() {
    println!(
        r#"dsm {} - multi-display session manager

USAGE:
    dsm [OPTIONS]

OPTIONS:
    -h, --help              Print this help message
    -V, --version           Print version information
    -t, --test              Test mode (verify build without DRM)
    --init-config           Generate config file with defaults
    -f, --force             Overwrite config file without confirmation
    --dump                  Print session state after bring-up and exit

CONFIG FILE:
    ~/.config/dsm/config.toml (or $DSM_CONFIG, /etc/dsm/config.toml)
"#,
        env!("CARGO_PKG_VERSION")
    );
}

fn init_config(force: bool) -> Result<()> {
    if let Some(config_path) = dsm::config::default_config_path() {
        if config_path.exists() && !force {
            println!("Config file already exists: {}", config_path.display());
            print!("Overwrite? [y/N]: ");
            std::io::Write::flush(&mut std::io::stdout())?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;
            let input = input.trim().to_lowercase();

            if input != "y" && input != "yes" {
                println!("Aborted.");
                return Ok(());
            }
        }
    }

    let path = Config::write_default_config()?;
    println!("Config file generated:");
    println!("  Path:   {}", path.display());
    Ok(())
}

#[cfg(target_os = "linux")]
fn spawn_udev_reader(
    device: dsm::drm::Device,
    engine: Arc<SoftEngine>,
    manager: Weak<SessionManager>,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("dsm-udev".to_string())
        .spawn(move || {
            let mut monitor = match dsm::drm::HotplugMonitor::new() {
                Ok(monitor) => monitor,
                Err(e) => {
                    warn!("Hotplug monitor unavailable: {:#}", e);
                    return;
                }
            };
            let interval = Duration::from_millis(UDEV_POLL_INTERVAL_MS);
            while !dsm::drm::shutdown_requested() {
                let signals = monitor.poll();
                if !signals.is_empty() {
                    match device.snapshot() {
                        Ok(snapshots) => engine.set_hardware(dsm::drm::hardware_list(&snapshots)),
                        Err(e) => warn!("Connector snapshot failed: {:#}", e),
                    }
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    for signal in signals {
                        manager.on_uevent(signal);
                    }
                }
                thread::sleep(interval);
            }
        })
        .context("Failed to spawn udev reader")
}

#[cfg(target_os = "linux")]
fn run(cfg: Config, dump_only: bool) -> Result<()> {
    dsm::drm::setup_signal_handlers();

    let device = dsm::drm::Device::open(&cfg.device.drm_path)?;
    let snapshots = device.snapshot()?;
    let hardware = dsm::drm::hardware_list(&snapshots);
    info!(
        "{} connectors, {} connected",
        hardware.len(),
        hardware.iter().filter(|hw| hw.connected).count()
    );

    let engine = Arc::new(SoftEngine::new(hardware));
    let manager = SessionManager::new(&cfg, engine.clone());
    manager.init().context("Primary display bring-up failed")?;

    let client = Arc::new(DaemonClient::default());
    *client
        .manager
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::downgrade(&manager);
    manager
        .register_callback(client)
        .context("Client registration failed")?;

    if dump_only {
        print!("{}", manager.dump());
        manager.deinit();
        return Ok(());
    }

    manager
        .start_hotplug_worker()
        .context("Hotplug worker failed to start")?;
    let reader = if cfg.device.hotplug_monitor {
        Some(spawn_udev_reader(
            device,
            engine.clone(),
            Arc::downgrade(&manager),
        )?)
    } else {
        None
    };

    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
    info!("dsm ready");

    while !dsm::drm::shutdown_requested() {
        thread::sleep(Duration::from_millis(UDEV_POLL_INTERVAL_MS));
    }

    info!("Shutdown requested");
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
    if let Some(reader) = reader {
        let _ = reader.join();
    }
    manager.deinit();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_cfg: Config, _dump_only: bool) -> Result<()> {
    anyhow::bail!("dsm requires Linux DRM")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("dsm {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if args.iter().any(|a| a == "--test" || a == "-t") {
        info!("Test mode: skipping DRM initialization");
        eprintln!("[OK] dsm build verification complete");
        return Ok(());
    }

    if args.iter().any(|a| a == "--init-config") {
        let force = args.iter().any(|a| a == "--force" || a == "-f");
        return init_config(force);
    }

    info!("dsm starting...");
    let cfg = Config::load();
    let dump_only = args.iter().any(|a| a == "--dump");
    run(cfg, dump_only)
}

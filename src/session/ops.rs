//! Per-display operations at the compositor boundary
//!
//! Each operation resolves the client display id, takes that slot's lock
//! once the commit sequence has settled, and drives the bound display
//! object.

use chrono::Local;
use log::{debug, info, warn};
use std::fmt::Write as _;
use std::sync::atomic::Ordering;

use super::lock::CommitClient;
use super::manager::SessionManager;
use crate::constants::{DEFAULT_VSYNC_PERIOD_NS, MAX_DUMP_BYTES};
use crate::engine::{DisplayKind, PowerMode, QsyncMode};
use crate::error::{Error, Result};

/// Caller constraints for a timed config change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VsyncPeriodChangeConstraints {
    /// Earliest monotonic time the new period may take effect
    pub desired_time_ns: i64,
    pub seamless_required: bool,
}

/// When a config change takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VsyncPeriodChangeTimeline {
    pub new_vsync_applied_time_ns: i64,
    /// The client must present a frame at `refresh_time_ns`
    pub refresh_required: bool,
    pub refresh_time_ns: i64,
}

fn monotonic_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

impl SessionManager {
    // ========================================================================
    // Power
    // ========================================================================

    /// Change the power mode of `display`.
    ///
    /// While a secure session runs, powering up a built-in display that is
    /// off is parked as a pending mode and reported as success.
    pub fn set_power_mode(&self, display: u64, mode: PowerMode) -> Result<()> {
        let idx = self.slot_index(display)?;
        let client_id = self.slots.client_id(idx);

        let (is_builtin, is_off, hw_id) = {
            let state = self.slots.lock(idx);
            let d = state.display.as_ref().ok_or(Error::BadDisplay(client_id))?;
            (d.is_builtin(), d.power_mode == PowerMode::Off, d.hw_id)
        };
        if mode == PowerMode::On && !is_hw_connected_or_virtual(self, idx, hw_id) {
            return Err(Error::BadDisplay(client_id));
        }

        if self.secure_session_active()
            && is_builtin
            && is_off
            && self.active_builtin_display().is_some()
        {
            let mut state = self.slots.lock_settled(idx);
            if let Some(d) = state.display.as_mut() {
                info!(
                    "Secure session in progress, deferring power mode {:?} on display {}",
                    mode, client_id
                );
                d.pending_power_mode = Some(mode);
                return Ok(());
            }
        }

        let mut state = self.slots.lock_settled(idx);
        let d = state.display.as_mut().ok_or(Error::BadDisplay(client_id))?;
        if d.pending_power_mode.is_some() {
            warn!("Power mode change refused during a secure display session");
            return Err(Error::Unsupported("power mode parked by secure session"));
        }
        if mode.is_doze() && !self.engine.doze_supported(d.handle) {
            return Err(Error::Unsupported("doze"));
        }
        if d.power_mode == mode {
            return Ok(());
        }
        d.set_power_mode(self.engine.as_ref(), mode, false)?;
        debug!("Display {} power mode {:?}", client_id, mode);
        drop(state);

        if mode == PowerMode::Doze {
            // One more frame so post-processing state lands
            self.mark_pending_refresh(idx);
        }
        Ok(())
    }

    pub fn get_power_mode(&self, display: u64) -> Result<PowerMode> {
        let idx = self.slot_index(display)?;
        let state = self.slots.lock(idx);
        state
            .display
            .as_ref()
            .map(|d| d.power_mode)
            .ok_or(Error::BadDisplay(display))
    }

    /// Power-cycle every physical display, restoring the previous modes.
    ///
    /// All slot locks are held for the duration so no commit can slice in.
    pub fn display_power_reset(&self) {
        let _gate = self.hotplug.reconcile_lock();
        let mut guards = self.slots.lock_all();

        let mut previous = Vec::with_capacity(guards.len());
        for (idx, state) in guards.iter_mut().enumerate() {
            let Some(d) = state.display.as_mut().filter(|d| !d.is_virtual()) else {
                previous.push(None);
                continue;
            };
            previous.push(Some(d.power_mode));
            info!("Powering off display {}", idx);
            if let Err(e) = d.set_power_mode(self.engine.as_ref(), PowerMode::Off, true) {
                warn!("Power off for display {} failed: {}", idx, e);
            }
        }

        for (idx, (state, mode)) in guards.iter_mut().zip(previous).enumerate() {
            let (Some(d), Some(mode)) = (state.display.as_mut(), mode) else {
                continue;
            };
            debug!("Restoring display {} to {:?}", idx, mode);
            if let Err(e) = d.set_power_mode(self.engine.as_ref(), mode, false) {
                warn!("Restoring {:?} on display {} failed: {}", mode, idx, e);
            }
        }
        drop(guards);
        self.refresh_slot(0);
    }

    // ========================================================================
    // Configs and timing
    // ========================================================================

    pub fn set_active_config(&self, display: u64, config: u32) -> Result<()> {
        let idx = self.slot_index(display)?;
        {
            let mut state = self.slots.lock_settled(idx);
            let d = state.display.as_mut().ok_or(Error::BadDisplay(display))?;
            if d.active_config == config {
                return Ok(());
            }
            d.set_active_config(self.engine.as_ref(), config)?;
            info!("Display {} switched to config {}", display, config);
        }
        self.refresh_slot(idx);
        Ok(())
    }

    /// Switch config no earlier than `constraints.desired_time_ns`
    pub fn set_active_config_with_constraints(
        &self,
        display: u64,
        config: u32,
        constraints: VsyncPeriodChangeConstraints,
    ) -> Result<VsyncPeriodChangeTimeline> {
        let idx = self.slot_index(display)?;
        let now = monotonic_ns();
        let timeline = {
            let mut state = self.slots.lock_settled(idx);
            let d = state.display.as_mut().ok_or(Error::BadDisplay(display))?;
            if d.active_config == config {
                return Ok(VsyncPeriodChangeTimeline {
                    new_vsync_applied_time_ns: now,
                    refresh_required: false,
                    refresh_time_ns: 0,
                });
            }
            if constraints.seamless_required {
                return Err(Error::Unsupported("seamless config change"));
            }
            d.set_active_config(self.engine.as_ref(), config)?;
            let period = self
                .engine
                .vsync_period_ns(d.handle)
                .unwrap_or(DEFAULT_VSYNC_PERIOD_NS) as i64;
            let refresh_time_ns = constraints.desired_time_ns.max(now);
            VsyncPeriodChangeTimeline {
                new_vsync_applied_time_ns: refresh_time_ns + period,
                refresh_required: true,
                refresh_time_ns,
            }
        };
        self.refresh_slot(idx);
        Ok(timeline)
    }

    pub fn get_active_config(&self, display: u64) -> Result<u32> {
        let idx = self.slot_index(display)?;
        let mut state = self.slots.lock(idx);
        let d = state.display.as_mut().ok_or(Error::BadDisplay(display))?;
        d.sync_active_config(self.engine.as_ref());
        Ok(d.active_config)
    }

    pub fn get_config_count(&self, display: u64) -> Result<u32> {
        let idx = self.slot_index(display)?;
        let state = self.slots.lock(idx);
        let d = state.display.as_ref().ok_or(Error::BadDisplay(display))?;
        self.engine
            .config_count(d.handle)
            .map_err(|e| e.into_session(display))
    }

    /// Vsync period in ns; 60 Hz when nothing is bound yet
    pub fn get_vsync_period(&self, display: u64) -> Result<u64> {
        let idx = self.slot_index(display)?;
        let state = self.slots.lock(idx);
        Ok(state
            .display
            .as_ref()
            .and_then(|d| self.engine.vsync_period_ns(d.handle).ok())
            .unwrap_or(DEFAULT_VSYNC_PERIOD_NS))
    }

    pub fn is_display_connected(&self, display: u64) -> Result<bool> {
        let idx = self.slot_index(display)?;
        let bound = {
            let state = self.slots.lock(idx);
            state.display.as_ref().map(|d| (d.is_virtual(), d.hw_id))
        };
        Ok(match bound {
            None => false,
            Some((true, _)) => true,
            Some((false, hw_id)) => self.is_hw_connected(hw_id),
        })
    }

    // ========================================================================
    // Feature controls
    // ========================================================================

    /// Enable or disable partial update on a built-in display.
    ///
    /// Disabling waits for the next commit so the change has landed when
    /// this returns.
    pub fn control_partial_update(&self, display: u64, enable: bool) -> Result<()> {
        let idx = self.slot_index(display)?;
        {
            let mut state = self.slots.lock_settled(idx);
            let d = state.display.as_mut().ok_or(Error::BadDisplay(display))?;
            if !d.is_builtin() {
                return Err(Error::Unsupported("partial update on non built-in display"));
            }
            self.engine
                .control_partial_update(d.handle, enable)
                .map_err(|e| e.into_session(display))?;
            d.partial_update = enable;
        }
        if enable {
            return Ok(());
        }
        self.request_commit_async(display, CommitClient::PartialUpdate)
    }

    /// Stop any writeback sharing this display's pipeline and wait for the
    /// commit that releases it
    pub fn teardown_concurrent_writeback(&self, display: u64) -> Result<()> {
        let idx = self.slot_index(display)?;
        {
            let state = self.slots.lock_settled(idx);
            let d = state.display.as_ref().ok_or(Error::BadDisplay(display))?;
            self.engine
                .teardown_concurrent_writeback(d.handle)
                .map_err(|e| e.into_session(display))?;
        }
        self.request_commit(display, CommitClient::TeardownWriteback)
    }

    /// Idle timeout applied to the primary display.
    ///
    /// During a trusted UI session the value is only recorded; it is
    /// applied when the session ends.
    pub fn set_idle_timeout(&self, active_ms: u32) -> Result<()> {
        self.idle_time_active_ms.store(active_ms, Ordering::Release);
        if self.tui_active() {
            debug!("Trusted UI active, idle timeout {} ms deferred", active_ms);
            return Ok(());
        }
        let state = self.slots.lock_settled(0);
        let d = state.display.as_ref().ok_or(Error::BadDisplay(0))?;
        self.engine
            .set_idle_timeout(d.handle, active_ms, self.settings.idle_time_inactive_ms)
            .map_err(|e| e.into_session(0))
    }

    pub fn set_qsync_mode(&self, display: u64, mode: QsyncMode) -> Result<()> {
        let idx = self.slot_index(display)?;
        let deferred = self.tui_active() && self.tui.target() == Some(idx);
        let mut state = self.slots.lock_settled(idx);
        let d = state.display.as_mut().ok_or(Error::BadDisplay(display))?;
        if !deferred {
            self.engine
                .set_qsync_mode(d.handle, mode)
                .map_err(|e| e.into_session(display))?;
        }
        d.qsync_mode = mode;
        Ok(())
    }

    // ========================================================================
    // Dump
    // ========================================================================

    /// Human-readable state of every slot and coordinator
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "dsm state at {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
        );

        for idx in 0..self.slots.len() {
            let state = self.slots.lock(idx);
            let _ = write!(
                out,
                "  [{}] {:<9} ",
                self.slots.client_id(idx),
                self.slots.kind(idx).to_string()
            );
            match state.display.as_ref() {
                Some(d) => d.describe(&mut out),
                None => out.push_str("unbound"),
            }
            let _ = writeln!(out, " commit={:?} waiters={:?}", state.commit, state.waiters);
        }

        let pending: Vec<u64> = self.pending_hotplugs();
        let _ = writeln!(
            out,
            "hotplug: {:?} pending={:?} uevents={}",
            self.hotplug_state(),
            pending,
            self.hotplug.uevents.pending()
        );
        let _ = writeln!(out, "secure session active: {}", self.secure_session_active());
        let _ = writeln!(out, "trusted UI: {:?}", self.tui_phase());
        for (client_id, key, in_use) in self.virtual_cache_summary() {
            let _ = writeln!(
                out,
                "virtual {}: {}x{} format={:#x} {}",
                client_id,
                key.width,
                key.height,
                key.format,
                if in_use { "in use" } else { "idle" }
            );
        }

        if out.len() > MAX_DUMP_BYTES {
            let mut end = MAX_DUMP_BYTES;
            while !out.is_char_boundary(end) {
                end -= 1;
            }
            out.truncate(end);
        }
        out
    }
}

/// Virtual displays have no hardware to unplug
fn is_hw_connected_or_virtual(manager: &SessionManager, idx: usize, hw_id: i32) -> bool {
    manager.slots.kind(idx) == DisplayKind::Virtual || manager.is_hw_connected(hw_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{EngineCall, HwDisplayInfo, SoftEngine};
    use crate::session::callbacks::ClientCallbacks;
    use std::sync::{Arc, Mutex, Weak};
    use std::thread;

    #[derive(Default)]
    struct Presenter {
        manager: Mutex<Weak<SessionManager>>,
    }

    impl ClientCallbacks for Presenter {
        fn on_hotplug(&self, _display: u64, _connected: bool) {}

        fn on_refresh(&self, display: u64) {
            if let Some(manager) = self.manager.lock().unwrap().upgrade() {
                thread::spawn(move || {
                    let _ = manager.commit_or_prepare(display, false);
                });
            }
        }
    }

    fn setup() -> (Arc<SoftEngine>, Arc<SessionManager>) {
        let engine = Arc::new(SoftEngine::new(vec![
            HwDisplayInfo {
                hw_id: 1,
                kind: DisplayKind::BuiltIn,
                is_primary: true,
                connected: true,
            },
            HwDisplayInfo {
                hw_id: 5,
                kind: DisplayKind::Pluggable,
                is_primary: false,
                connected: true,
            },
        ]));
        let manager = SessionManager::new(&Config::default(), engine.clone());
        manager.init().unwrap();
        let presenter = Arc::new(Presenter::default());
        *presenter.manager.lock().unwrap() = Arc::downgrade(&manager);
        manager.register_callback(presenter).unwrap();
        (engine, manager)
    }

    #[test]
    fn test_power_mode_transitions() {
        let (engine, manager) = setup();
        assert_eq!(manager.get_power_mode(0), Ok(PowerMode::On));
        manager.set_power_mode(1, PowerMode::On).unwrap();
        assert_eq!(engine.power_of(5), Some(PowerMode::On));
        // Same mode again is accepted without touching the engine
        manager.set_power_mode(1, PowerMode::On).unwrap();
        manager.set_power_mode(1, PowerMode::Off).unwrap();
        assert_eq!(manager.get_power_mode(1), Ok(PowerMode::Off));
    }

    #[test]
    fn test_doze_requires_support() {
        let (engine, manager) = setup();
        engine.set_doze_supported(false);
        assert!(matches!(
            manager.set_power_mode(0, PowerMode::Doze),
            Err(Error::Unsupported(_))
        ));
        engine.set_doze_supported(true);
        manager.set_power_mode(0, PowerMode::Doze).unwrap();
        assert_ne!(manager.pending_refresh.load(Ordering::Acquire) & 1, 0);
    }

    #[test]
    fn test_power_on_disconnected_is_bad_display() {
        let (engine, manager) = setup();
        engine.set_connected(5, DisplayKind::Pluggable, false);
        assert_eq!(
            manager.set_power_mode(1, PowerMode::On),
            Err(Error::BadDisplay(1))
        );
    }

    #[test]
    fn test_unknown_display() {
        let (_engine, manager) = setup();
        assert_eq!(manager.get_power_mode(99), Err(Error::BadDisplay(99)));
        assert_eq!(manager.get_active_config(4), Err(Error::BadDisplay(4)));
    }

    #[test]
    fn test_configs() {
        let (_engine, manager) = setup();
        assert_eq!(manager.get_config_count(0), Ok(2));
        manager.set_active_config(0, 1).unwrap();
        assert_eq!(manager.get_active_config(0), Ok(1));
        assert!(matches!(
            manager.set_active_config(0, 7),
            Err(Error::BadParameter(_))
        ));
    }

    #[test]
    fn test_config_with_constraints() {
        let (_engine, manager) = setup();
        let constraints = VsyncPeriodChangeConstraints {
            desired_time_ns: 0,
            seamless_required: true,
        };
        assert!(matches!(
            manager.set_active_config_with_constraints(0, 1, constraints),
            Err(Error::Unsupported(_))
        ));

        let constraints = VsyncPeriodChangeConstraints {
            desired_time_ns: 0,
            seamless_required: false,
        };
        let timeline = manager
            .set_active_config_with_constraints(0, 1, constraints)
            .unwrap();
        assert!(timeline.refresh_required);
        assert_eq!(
            timeline.new_vsync_applied_time_ns - timeline.refresh_time_ns,
            DEFAULT_VSYNC_PERIOD_NS as i64
        );
        assert_eq!(manager.get_active_config(0), Ok(1));
    }

    #[test]
    fn test_vsync_period_defaults_when_unbound() {
        let (engine, manager) = setup();
        engine.set_vsync_period_ns(8_333_333);
        assert_eq!(manager.get_vsync_period(0), Ok(8_333_333));
        assert_eq!(manager.get_vsync_period(3), Ok(DEFAULT_VSYNC_PERIOD_NS));
        assert!(manager.get_vsync_period(100).is_err());
    }

    #[test]
    fn test_is_display_connected() {
        let (engine, manager) = setup();
        assert_eq!(manager.is_display_connected(1), Ok(true));
        assert_eq!(manager.is_display_connected(2), Ok(false));
        engine.set_connected(5, DisplayKind::Pluggable, false);
        assert_eq!(manager.is_display_connected(1), Ok(false));
    }

    #[test]
    fn test_partial_update_builtin_only() {
        let (engine, manager) = setup();
        assert!(matches!(
            manager.control_partial_update(1, false),
            Err(Error::Unsupported(_))
        ));
        manager.control_partial_update(0, false).unwrap();
        assert_eq!(engine.partial_update_of(1), Some(false));
        manager.control_partial_update(0, true).unwrap();
        assert_eq!(engine.partial_update_of(1), Some(true));
    }

    #[test]
    fn test_teardown_writeback_waits_for_commit() {
        let (engine, manager) = setup();
        manager.teardown_concurrent_writeback(0).unwrap();
        assert!(engine
            .calls()
            .contains(&EngineCall::TeardownWriteback { hw_id: 1 }));
    }

    #[test]
    fn test_qsync_and_idle_timeout() {
        let (engine, manager) = setup();
        manager.set_qsync_mode(0, QsyncMode::Continuous).unwrap();
        assert_eq!(engine.qsync_of(1), Some(QsyncMode::Continuous));
        manager.set_idle_timeout(250).unwrap();
        assert_eq!(manager.idle_time_active_ms.load(Ordering::Acquire), 250);
    }

    #[test]
    fn test_power_reset_restores_modes() {
        let (engine, manager) = setup();
        manager.set_power_mode(1, PowerMode::On).unwrap();
        manager.display_power_reset();
        assert_eq!(engine.power_of(1), Some(PowerMode::On));
        assert_eq!(engine.power_of(5), Some(PowerMode::On));
        let teardowns = engine
            .calls()
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    EngineCall::Power {
                        mode: PowerMode::Off,
                        teardown: true,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(teardowns, 2);
    }

    #[test]
    fn test_dump_lists_every_slot() {
        let (_engine, manager) = setup();
        let dump = manager.dump();
        assert!(dump.starts_with("dsm state at "));
        for idx in 0..manager.slots().len() {
            assert!(dump.contains(&format!("[{}]", idx)));
        }
        assert!(dump.contains("hotplug: None"));
        assert!(dump.contains("uevents=0"));
        assert!(dump.contains("trusted UI: Idle"));
        assert!(dump.len() <= MAX_DUMP_BYTES);
    }
}

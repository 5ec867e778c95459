//! Secure-session arbiter
//!
//! While the active built-in display carries a secure-display or
//! secure-camera session, virtual displays are torn down, hotplug handling
//! is deferred, and power changes on other built-in displays are parked
//! as pending modes. The parked modes are applied after a later commit of
//! the active built-in has landed.

use log::{debug, info, warn};
use std::sync::atomic::Ordering;

use super::manager::SessionManager;
use crate::engine::{DisplayKind, Fence};

impl SessionManager {
    pub fn secure_session_active(&self) -> bool {
        self.secure_active.load(Ordering::Acquire)
    }

    /// Re-evaluate secure sessions before a commit
    pub(super) fn handle_secure_session(&self) {
        let active = self.active_builtin_display();
        if active.is_none() && !self.secure_session_active() {
            return;
        }
        let sessions = self.secure_sessions_of(active);
        if !sessions.is_empty() {
            if !self.secure_active.swap(true, Ordering::AcqRel) {
                info!("Secure session started: {:?}", sessions);
            }
        } else if !self.secure_session_active() {
            return;
        }

        if !sessions.is_empty() {
            self.destroy_all_virtual_displays();
        }

        let mut found_active = false;
        let real: Vec<usize> = self.slots.real_indices().collect();
        for idx in real {
            let mut state = self.slots.lock(idx);
            let Some(display) = state.display.as_mut() else {
                continue;
            };
            let is_active_secure = !found_active
                && display.is_builtin()
                && display.power_mode != crate::engine::PowerMode::Off;
            found_active |= is_active_secure;
            if let Err(e) =
                display.handle_secure_session(self.engine.as_ref(), sessions, is_active_secure)
            {
                warn!("Display {}: secure session handling failed: {}", idx, e);
            }
        }
    }

    /// Whether any slot other than `except` carries a parked power mode
    fn any_pending_power_mode(&self, except: usize) -> bool {
        let real: Vec<usize> = self.slots.real_indices().collect();
        real.into_iter().filter(|&idx| idx != except).any(|idx| {
            self.slots
                .lock(idx)
                .display
                .as_ref()
                .map(|d| d.pending_power_mode.is_some())
                .unwrap_or(false)
        })
    }

    /// Apply parked power modes once the active built-in has committed.
    ///
    /// Both the secure session and any trusted-UI session must be over
    /// before a parked display is powered again.
    pub(super) fn handle_pending_power_mode(&self, idx: usize, retire_fence: Option<&Fence>) {
        if !self.secure_session_active() {
            return;
        }
        let active = self.active_builtin_display();
        if active != Some(idx) {
            return;
        }

        let sessions = self.secure_sessions_of(active);
        if !self.any_pending_power_mode(idx) {
            if sessions.is_empty() {
                info!("Secure session ended");
                self.secure_active.store(false, Ordering::Release);
            }
            return;
        }
        if !sessions.is_empty() || self.tui_active() {
            return;
        }

        // A retire fence means the non-secure commit went through
        let Some(fence) = retire_fence else {
            return;
        };
        if let Err(e) = self.engine.wait_fence(fence, self.timeouts.fence_wait()) {
            warn!("Retire fence wait before pending power modes failed: {}", e);
            return;
        }

        let Some(_gate) = self.hotplug.try_reconcile_lock() else {
            debug!("Reconciliation in progress, retrying pending power modes later");
            self.mark_pending_refresh(idx);
            return;
        };
        let hardware = match self.engine.displays_status() {
            Ok(hardware) => hardware,
            Err(e) => {
                warn!("Failed to get connected display list: {}", e);
                return;
            }
        };

        let real: Vec<usize> = self.slots.real_indices().collect();
        for other in real.into_iter().filter(|&other| other != idx) {
            let mut state = self.slots.lock(other);
            let Some(display) = state.display.as_mut() else {
                continue;
            };
            let Some(mode) = display.pending_power_mode else {
                continue;
            };
            if display.class == DisplayKind::Pluggable
                && hardware
                    .iter()
                    .any(|hw| hw.hw_id == display.hw_id && !hw.connected)
            {
                debug!("Display {} disconnected while parked", other);
                continue;
            }
            match display.set_power_mode(self.engine.as_ref(), mode, false) {
                Ok(()) => {
                    info!("Display {}: applied pending power mode {:?}", other, mode);
                    display.pending_power_mode = None;
                    self.mark_pending_refresh(0);
                }
                Err(e) => warn!("Display {}: pending power mode failed: {}", other, e),
            }
        }
        self.secure_active.store(false, Ordering::Release);
        info!("Secure session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{HwDisplayInfo, PowerMode, SecureSessions, SoftEngine};
    use std::sync::Arc;

    fn setup() -> (Arc<SoftEngine>, Arc<SessionManager>, usize) {
        let engine = Arc::new(SoftEngine::new(vec![
            HwDisplayInfo {
                hw_id: 1,
                kind: DisplayKind::BuiltIn,
                is_primary: true,
                connected: true,
            },
            HwDisplayInfo {
                hw_id: 2,
                kind: DisplayKind::BuiltIn,
                is_primary: false,
                connected: true,
            },
        ]));
        let manager = SessionManager::new(&Config::default(), engine.clone());
        manager.init().unwrap();
        manager.handle_builtin_displays().unwrap();
        let second = manager.slots().indices(DisplayKind::BuiltIn).next().unwrap();
        (engine, manager, second)
    }

    #[test]
    fn test_secure_session_parks_and_restores_second_builtin() {
        let (engine, manager, second) = setup();
        manager.set_power_mode(second as u64, PowerMode::On).unwrap();

        engine.set_secure_sessions(1, SecureSessions::SECURE_DISPLAY);
        manager.commit_or_prepare(0, false).unwrap();
        assert!(manager.secure_session_active());
        assert_eq!(engine.power_of(2), Some(PowerMode::Off));
        assert_eq!(manager.get_power_mode(second as u64), Ok(PowerMode::Off));

        // Still active: the parked mode stays parked
        manager.commit_or_prepare(0, false).unwrap();
        assert_eq!(engine.power_of(2), Some(PowerMode::Off));

        engine.set_secure_sessions(1, SecureSessions::empty());
        manager.commit_or_prepare(0, false).unwrap();
        assert_eq!(engine.power_of(2), Some(PowerMode::On));
        assert!(!manager.secure_session_active());
    }

    #[test]
    fn test_power_request_during_session_is_deferred() {
        let (engine, manager, second) = setup();
        engine.set_secure_sessions(1, SecureSessions::SECURE_CAMERA);
        manager.commit_or_prepare(0, false).unwrap();

        manager.set_power_mode(second as u64, PowerMode::On).unwrap();
        assert_eq!(engine.power_of(2), Some(PowerMode::Off));
        assert!(manager.get_power_mode(second as u64).is_ok());

        engine.set_secure_sessions(1, SecureSessions::empty());
        manager.commit_or_prepare(0, false).unwrap();
        assert_eq!(engine.power_of(2), Some(PowerMode::On));
    }

    #[test]
    fn test_flag_clears_without_pending_modes() {
        let (engine, manager, _) = setup();
        engine.set_secure_sessions(1, SecureSessions::SECURE_DISPLAY);
        manager.commit_or_prepare(0, false).unwrap();
        assert!(manager.secure_session_active());
        engine.set_secure_sessions(1, SecureSessions::empty());
        manager.commit_or_prepare(0, false).unwrap();
        assert!(!manager.secure_session_active());
    }
}

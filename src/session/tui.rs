//! Trusted UI transitions
//!
//! Prepare, Start, End and Unprepare hand the target display to a trusted
//! environment and back. One transition runs at a time: each request is
//! executed on an event task, and a second notifier task reports the
//! result through the client callbacks. A request that arrives while the
//! previous event task is unresolved is rejected busy.

use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::lock::CommitClient;
use super::manager::SessionManager;
use super::slot::DisplayType;
use super::task::TaskSlot;
use crate::constants::{DEFAULT_VSYNC_PERIOD_NS, NS_PER_MS, TUI_EVENT_WAIT_MS};
use crate::engine::{DisplayKind, EngineError, QsyncMode, SecureEvent, SecureSessions};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuiEvent {
    Prepare,
    Start,
    End,
}

impl TuiEvent {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(TuiEvent::Prepare),
            1 => Some(TuiEvent::Start),
            2 => Some(TuiEvent::End),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TuiPhase {
    #[default]
    Idle,
    Preparing,
    Active,
    Ending,
}

#[derive(Debug, Default)]
struct TuiTasks {
    event: TaskSlot<Result<()>>,
    notify: TaskSlot<()>,
}

#[derive(Debug, Default)]
struct TuiSession {
    target: Option<usize>,
    phase: TuiPhase,
}

#[derive(Debug, Default)]
pub(crate) struct TuiCoordinator {
    tasks: Mutex<TuiTasks>,
    session: Mutex<TuiSession>,
}

impl TuiCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, TuiTasks> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn session(&self) -> MutexGuard<'_, TuiSession> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, target: Option<usize>, phase: TuiPhase) {
        let mut session = self.session();
        if session.phase != phase {
            info!("TUI phase {:?} -> {:?}", session.phase, phase);
        }
        session.target = target;
        session.phase = phase;
    }

    fn set_phase(&self, phase: TuiPhase) {
        let target = self.session().target;
        self.set(target, phase);
    }

    pub fn phase(&self) -> TuiPhase {
        self.session().phase
    }

    pub fn target(&self) -> Option<usize> {
        self.session().target
    }
}

impl SessionManager {
    pub fn tui_phase(&self) -> TuiPhase {
        self.tui.phase()
    }

    pub fn tui_active(&self) -> bool {
        self.tui.phase() != TuiPhase::Idle
    }

    /// Queue a trusted-UI event for `display`.
    ///
    /// The event runs asynchronously; its result is delivered through
    /// `ClientCallbacks::on_tui_event_done`.
    pub fn tui_event(&self, display: u64, event: TuiEvent) -> Result<()> {
        let manager = self.arc()?;
        let mut tasks = self.tui.tasks();
        if tasks.event.is_busy() {
            warn!("TUI event handler is busy with previous work");
            return Err(Error::Busy("trusted UI transition in flight"));
        }
        let callback_wait = Duration::from_millis(self.timeouts.tui_callback_wait_ms);
        if !tasks.notify.wait_idle(callback_wait) {
            warn!("TUI callback handler is busy with previous work");
            return Err(Error::Busy("trusted UI completion pending"));
        }

        let worker = Arc::clone(&manager);
        let waiter = tasks.event.start("dsm-tui-event", move || match event {
            TuiEvent::Prepare => worker.tui_target(display).map(|_| ()),
            TuiEvent::Start => worker.tui_start(display),
            TuiEvent::End => worker.tui_end(display),
        })?;
        tasks.notify.start("dsm-tui-notify", move || {
            let wait = Duration::from_millis(TUI_EVENT_WAIT_MS);
            let result = waiter
                .wait_timeout(wait)
                .unwrap_or(Err(Error::Timeout(wait)));
            debug!("TUI {:?} on display {} done: {:?}", event, display, result);
            manager.notify_tui_done(display, event, &result);
        })?;
        Ok(())
    }

    /// Resolve the TUI target: the primary or the second built-in display
    pub(super) fn tui_target(&self, display: u64) -> Result<usize> {
        let idx = match self.slots.resolve(display) {
            Some(idx) => idx,
            None => self
                .active_builtin_display()
                .ok_or(Error::BadDisplay(display))?,
        };
        if idx == 0 || self.slots.index_for_type(DisplayType::BuiltIn2) == Some(idx) {
            Ok(idx)
        } else {
            error!("Display {} not supported for trusted UI", display);
            Err(Error::Unsupported("trusted UI target"))
        }
    }

    /// Slots that take part in prepare/unprepare, ascending
    fn tui_participants(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&idx| self.slots.kind(idx) != DisplayKind::Pluggable)
            .collect()
    }

    fn tui_prepare(&self, target: usize) -> Result<()> {
        let client_id = self.slots.client_id(target);
        let sessions = {
            let mut state = self.slots.lock_settled(target);
            match state.display.as_mut() {
                Some(d) => d.refresh_secure_sessions(self.engine.as_ref()),
                None => SecureSessions::empty(),
            }
        };
        if sessions.contains(SecureSessions::SECURE_CAMERA) {
            warn!("Trusted UI not allowed during a secure camera session");
            return Err(Error::Unsupported("secure camera session active"));
        }

        for idx in self.tui_participants() {
            let state = self.slots.lock_settled(idx);
            if let Some(d) = state.display.as_ref() {
                self.engine
                    .handle_secure_event(d.handle, SecureEvent::TuiPrepare, idx == target)
                    .map_err(|e| {
                        warn!("Display {} rejected TUI prepare: {}", idx, e);
                        Error::BadParameter("trusted UI prepare rejected")
                    })?;
            }
        }

        if self.teardown_pluggable_displays() {
            info!("Pluggable displays torn down for trusted UI on {}", client_id);
        }
        Ok(())
    }

    fn tui_start(&self, display: u64) -> Result<()> {
        // Wait out any reconciliation in progress before starting
        let _gate = self.hotplug.reconcile_lock();
        let target = self.tui_target(display)?;
        self.tui.set(Some(target), TuiPhase::Preparing);

        let result = self
            .tui_prepare(target)
            .and_then(|()| self.tui_start_locked(target));
        match &result {
            Ok(()) => {
                self.tui.set_phase(TuiPhase::Active);
                info!("Trusted UI started on display {}", target);
            }
            Err(e) => {
                warn!("Trusted UI start on display {} failed: {}", target, e);
                if self.tui_active() {
                    self.tui_unprepare(target);
                }
            }
        }
        result
    }

    fn tui_start_locked(&self, target: usize) -> Result<()> {
        let client_id = self.slots.client_id(target);
        let (needs_refresh, vsync_ns) = {
            let mut state = self.slots.lock_settled(target);
            let d = state
                .display
                .as_mut()
                .ok_or(Error::BadDisplay(client_id))?;
            self.engine
                .teardown_concurrent_writeback(d.handle)
                .map_err(|_| Error::BadDisplay(client_id))?;
            if let Err(e) = self.engine.set_idle_timeout(d.handle, 0, 0) {
                debug!("Idle timeout not disabled: {}", e);
            }
            if let Err(e) = self.engine.set_qsync_mode(d.handle, QsyncMode::None) {
                debug!("Qsync not disabled: {}", e);
            }

            let needs_refresh =
                match self
                    .engine
                    .handle_secure_event(d.handle, SecureEvent::TuiStart, true)
                {
                    Ok(needs_refresh) => needs_refresh,
                    Err(EngineError::Permission) => {
                        warn!("TUI start denied on display {}, unpreparing", client_id);
                        drop(state);
                        self.tui_unprepare(target);
                        return Err(Error::PermissionDenied);
                    }
                    Err(e) => return Err(e.into_session(client_id)),
                };
            let vsync_ns = self
                .engine
                .vsync_period_ns(d.handle)
                .unwrap_or(DEFAULT_VSYNC_PERIOD_NS);
            (needs_refresh, vsync_ns)
        };

        if needs_refresh {
            let timeout =
                Duration::from_millis(self.timeouts.draw_cycles * (vsync_ns / NS_PER_MS));
            let generation = self.arm_vm_release(target);
            self.refresh_slot(target);
            info!("Waiting for device assign on display {}", client_id);
            if let Err(e) = self.wait_for_vm_release(target, generation, timeout) {
                warn!("Device assign failed ({}), unwinding trusted UI", e);
                if let Err(end) = self.tui_end_locked(target) {
                    warn!("Unwind of trusted UI failed: {}", end);
                }
                return Err(e);
            }
        }

        let state = self.slots.lock_settled(target);
        let d = state.display.as_ref().ok_or(Error::BadDisplay(client_id))?;
        self.engine
            .post_handle_secure_event(d.handle, SecureEvent::TuiStart)
            .map_err(|e| e.into_session(client_id))
    }

    fn tui_end(&self, display: u64) -> Result<()> {
        // Deferred hotplug must not run during the hand-back commit
        let _gate = self.hotplug.reconcile_lock();
        let target = self.tui_target(display)?;
        if self.tui.target().is_none() {
            self.tui.set(Some(target), TuiPhase::Ending);
        }
        self.tui_end_locked(target)
    }

    /// End the session on `target`; always finishes with unprepare
    fn tui_end_locked(&self, target: usize) -> Result<()> {
        let client_id = self.slots.client_id(target);
        self.tui.set_phase(TuiPhase::Ending);

        let needs_refresh = {
            let state = self.slots.lock_settled(target);
            let Some(d) = state.display.as_ref() else {
                drop(state);
                self.tui_unprepare(target);
                return Err(Error::BadDisplay(client_id));
            };
            let idle_active = if target == 0 {
                self.idle_time_active_ms.load(Ordering::Acquire)
            } else {
                0
            };
            if let Err(e) = self.engine.set_idle_timeout(
                d.handle,
                idle_active,
                self.settings.idle_time_inactive_ms,
            ) {
                debug!("Idle timeout not restored: {}", e);
            }
            if let Err(e) = self.engine.set_qsync_mode(d.handle, d.qsync_mode) {
                debug!("Qsync not restored: {}", e);
            }
            match self
                .engine
                .handle_secure_event(d.handle, SecureEvent::TuiEnd, true)
            {
                Ok(needs_refresh) => needs_refresh,
                Err(e) => {
                    drop(state);
                    self.tui_unprepare(target);
                    return Err(e.into_session(client_id));
                }
            }
        };

        if needs_refresh {
            info!("Waiting for device unassign on display {}", client_id);
            if let Err(e) = self.request_commit(client_id, CommitClient::TrustedUi) {
                if !matches!(e, Error::Timeout(_)) {
                    error!("Device unassign failed: {}", e);
                }
                self.tui_unprepare(target);
                return Ok(());
            }
        }

        let post = {
            let state = self.slots.lock_settled(target);
            match state.display.as_ref() {
                Some(d) => self
                    .engine
                    .post_handle_secure_event(d.handle, SecureEvent::TuiEnd)
                    .map_err(|e| e.into_session(client_id)),
                None => Err(Error::BadDisplay(client_id)),
            }
        };
        self.tui_unprepare(target);
        post
    }

    /// Hand every participant back and resume deferred work
    fn tui_unprepare(&self, target: usize) {
        let mut trigger_refresh = false;
        for idx in self.tui_participants() {
            let state = self.slots.lock_settled(idx);
            if let Some(d) = state.display.as_ref() {
                match self.engine.handle_secure_event(
                    d.handle,
                    SecureEvent::TuiUnprepare,
                    idx == target,
                ) {
                    Ok(needs_refresh) => trigger_refresh |= needs_refresh,
                    Err(e) => warn!("Display {} failed TUI unprepare: {}", idx, e),
                }
            }
        }

        // Idle first so the deferred reconciliation is not parked again
        self.tui.set(None, TuiPhase::Idle);
        if self.hotplug.state() == super::hotplug::HotplugState::EventPending {
            self.hotplug
                .set_state(super::hotplug::HotplugState::Processing);
            if let Err(e) = self.spawn_deferred_hotplug() {
                warn!("Failed to start deferred hotplug: {}", e);
                self.hotplug
                    .set_state(super::hotplug::HotplugState::EventPending);
            }
        }
        if trigger_refresh {
            self.refresh_slot(target);
        }
        info!("End of trusted UI session on display {}", target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{EngineCall, HwDisplayInfo, SoftEngine};
    use crate::session::callbacks::ClientCallbacks;
    use std::sync::Weak;
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct TuiClient {
        manager: Mutex<Weak<SessionManager>>,
        done: Mutex<Vec<(TuiEvent, Result<()>)>>,
        hotplugs: Mutex<Vec<(u64, bool)>>,
    }

    impl ClientCallbacks for TuiClient {
        fn on_hotplug(&self, display: u64, connected: bool) {
            self.hotplugs.lock().unwrap().push((display, connected));
        }

        fn on_refresh(&self, display: u64) {
            let manager = self.manager.lock().unwrap().upgrade();
            if let Some(manager) = manager {
                thread::spawn(move || {
                    let _ = manager.vm_release_done(display);
                    let _ = manager.commit_or_prepare(display, false);
                });
            }
        }

        fn on_tui_event_done(&self, _display: u64, event: TuiEvent, result: &Result<()>) {
            self.done.lock().unwrap().push((event, result.clone()));
        }
    }

    impl TuiClient {
        fn wait_done(&self, count: usize) -> Vec<(TuiEvent, Result<()>)> {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.done.lock().unwrap().len() < count && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            self.done.lock().unwrap().clone()
        }
    }

    fn setup() -> (Arc<SoftEngine>, Arc<SessionManager>, Arc<TuiClient>) {
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
        let mut config = Config::default();
        config.timeouts.hotplug_resource_ms = 200;
        let manager = SessionManager::new(&config, engine.clone());
        manager.init().unwrap();
        let client = Arc::new(TuiClient::default());
        *client.manager.lock().unwrap() = Arc::downgrade(&manager);
        manager.register_callback(client.clone()).unwrap();
        (engine, manager, client)
    }

    #[test]
    fn test_event_from_raw() {
        assert_eq!(TuiEvent::from_raw(1), Some(TuiEvent::Start));
        assert_eq!(TuiEvent::from_raw(7), None);
    }

    #[test]
    fn test_target_must_be_primary_or_builtin2() {
        let (_engine, manager, _client) = setup();
        assert_eq!(manager.tui_target(0), Ok(0));
        assert_eq!(manager.tui_target(u64::MAX), Ok(0));
        assert!(matches!(manager.tui_target(1), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_start_and_end_with_handoff() {
        let (engine, manager, client) = setup();
        engine.set_handoff_required(1, true);
        // The pluggable display came up at registration
        assert!(manager.slots().snapshot(1).in_use);

        manager.tui_event(0, TuiEvent::Start).unwrap();
        let done = client.wait_done(1);
        assert_eq!(done[0], (TuiEvent::Start, Ok(())));
        assert_eq!(manager.tui_phase(), TuiPhase::Active);
        assert!(!manager.slots().snapshot(1).in_use);
        assert!(client.hotplugs.lock().unwrap().contains(&(1, false)));
        assert!(engine
            .calls()
            .contains(&EngineCall::TeardownWriteback { hw_id: 1 }));

        manager.tui_event(0, TuiEvent::End).unwrap();
        let done = client.wait_done(2);
        assert_eq!(done[1], (TuiEvent::End, Ok(())));
        assert_eq!(manager.tui_phase(), TuiPhase::Idle);
    }

    #[test]
    fn test_permission_denied_unprepares() {
        let (engine, manager, client) = setup();
        engine.set_deny_tui_start(true);
        manager.tui_event(0, TuiEvent::Start).unwrap();
        let done = client.wait_done(1);
        assert_eq!(done[0], (TuiEvent::Start, Err(Error::PermissionDenied)));
        assert_eq!(manager.tui_phase(), TuiPhase::Idle);
        assert!(engine.calls().contains(&EngineCall::SecureEvent {
            hw_id: 1,
            event: SecureEvent::TuiUnprepare,
            is_target: true,
        }));
    }

    #[test]
    fn test_secure_camera_blocks_start() {
        let (engine, manager, client) = setup();
        engine.set_secure_sessions(1, SecureSessions::SECURE_CAMERA);
        manager.tui_event(0, TuiEvent::Start).unwrap();
        let done = client.wait_done(1);
        assert!(matches!(done[0], (TuiEvent::Start, Err(Error::Unsupported(_)))));
        assert_eq!(manager.tui_phase(), TuiPhase::Idle);
    }
}

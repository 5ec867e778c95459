//! Software display engine
//!
//! A headless `DisplayEngine` that keeps per-display state in memory.
//! The daemon drives it from the DRM connector snapshot, and tests use
//! its knobs to script hardware behavior (secure sessions, hand-off,
//! failing commits, resource pressure).

use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{
    CommitOutcome, CreateParams, DisplayEngine, DisplayHandle, DisplayKind, EngineError,
    EngineResult, Fence, HwDisplayInfo, PowerMode, QsyncMode, ResourceState, SecureEvent,
    SecureSessions, TestPattern,
};
use crate::constants::DEFAULT_VSYNC_PERIOD_NS;

/// First hardware id handed out to virtual displays
const VIRTUAL_HW_ID_BASE: i32 = 1000;

#[derive(Debug, Clone)]
struct SoftDisplay {
    hw_id: i32,
    kind: DisplayKind,
    power: PowerMode,
    config: u32,
    qsync: QsyncMode,
    partial_update: bool,
}

/// Calls recorded by the engine, for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Create { kind: DisplayKind, hw_id: i32 },
    Destroy { hw_id: i32 },
    Power { hw_id: i32, mode: PowerMode, teardown: bool },
    SecureEvent { hw_id: i32, event: SecureEvent, is_target: bool },
    Abort { hw_id: i32 },
    AlternateConfig { hw_id: i32, enable: bool },
    TeardownWriteback { hw_id: i32 },
    TestPattern { hw_id: i32, pattern: TestPattern },
}

#[derive(Debug)]
struct SoftState {
    hardware: Vec<HwDisplayInfo>,
    displays: HashMap<DisplayHandle, SoftDisplay>,
    next_handle: u64,
    next_virtual_hw_id: i32,
    calls: Vec<EngineCall>,
    secure: HashMap<i32, SecureSessions>,
    handoff: HashSet<i32>,
    deny_tui_start: bool,
    failing_commits: HashSet<i32>,
    held_fences: Option<Vec<Fence>>,
    resource_pending: HashMap<i32, ResourceState>,
    create_error: Option<EngineError>,
    status_error: Option<EngineError>,
    doze_supported: bool,
    vsync_period_ns: u64,
    config_count: u32,
}

/// In-memory display engine
#[derive(Debug)]
pub struct SoftEngine {
    state: Mutex<SoftState>,
}

impl SoftEngine {
    pub fn new(hardware: Vec<HwDisplayInfo>) -> Self {
        Self {
            state: Mutex::new(SoftState {
                hardware,
                displays: HashMap::new(),
                next_handle: 1,
                next_virtual_hw_id: VIRTUAL_HW_ID_BASE,
                calls: Vec::new(),
                secure: HashMap::new(),
                handoff: HashSet::new(),
                deny_tui_start: false,
                failing_commits: HashSet::new(),
                held_fences: None,
                resource_pending: HashMap::new(),
                create_error: None,
                status_error: None,
                doze_supported: true,
                vsync_period_ns: DEFAULT_VSYNC_PERIOD_NS,
                config_count: 2,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SoftState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the reported hardware list (connector rescan)
    pub fn set_hardware(&self, hardware: Vec<HwDisplayInfo>) {
        self.state().hardware = hardware;
    }

    /// Mark a hardware display connected or disconnected, adding it if unknown
    pub fn set_connected(&self, hw_id: i32, kind: DisplayKind, connected: bool) {
        let mut state = self.state();
        match state.hardware.iter_mut().find(|d| d.hw_id == hw_id) {
            Some(info) => info.connected = connected,
            None => state.hardware.push(HwDisplayInfo {
                hw_id,
                kind,
                is_primary: false,
                connected,
            }),
        }
    }

    pub fn set_secure_sessions(&self, hw_id: i32, sessions: SecureSessions) {
        self.state().secure.insert(hw_id, sessions);
    }

    /// Require a refresh (device hand-off) for TUI start/end on `hw_id`
    pub fn set_handoff_required(&self, hw_id: i32, required: bool) {
        let mut state = self.state();
        if required {
            state.handoff.insert(hw_id);
        } else {
            state.handoff.remove(&hw_id);
        }
    }

    pub fn set_deny_tui_start(&self, deny: bool) {
        self.state().deny_tui_start = deny;
    }

    pub fn set_commit_failing(&self, hw_id: i32, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing_commits.insert(hw_id);
        } else {
            state.failing_commits.remove(&hw_id);
        }
    }

    /// Hold retire fences unsignaled until `release_fences` is called
    pub fn hold_fences(&self) {
        let mut state = self.state();
        if state.held_fences.is_none() {
            state.held_fences = Some(Vec::new());
        }
    }

    pub fn release_fences(&self) {
        let held = self.state().held_fences.take();
        for fence in held.into_iter().flatten() {
            fence.signal();
        }
    }

    pub fn set_resource_state(&self, hw_id: i32, resource: ResourceState) {
        self.state().resource_pending.insert(hw_id, resource);
    }

    /// Fail the next `create_display` with `error`
    pub fn fail_next_create(&self, error: EngineError) {
        self.state().create_error = Some(error);
    }

    /// Fail the next `displays_status` with `error`
    pub fn fail_next_status(&self, error: EngineError) {
        self.state().status_error = Some(error);
    }

    pub fn set_doze_supported(&self, supported: bool) {
        self.state().doze_supported = supported;
    }

    pub fn set_vsync_period_ns(&self, period: u64) {
        self.state().vsync_period_ns = period;
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state().calls.clone()
    }

    pub fn create_count(&self, kind: DisplayKind) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, EngineCall::Create { kind: k, .. } if *k == kind))
            .count()
    }

    pub fn live_displays(&self) -> usize {
        self.state().displays.len()
    }

    pub fn power_of(&self, hw_id: i32) -> Option<PowerMode> {
        self.state()
            .displays
            .values()
            .find(|d| d.hw_id == hw_id)
            .map(|d| d.power)
    }

    pub fn qsync_of(&self, hw_id: i32) -> Option<QsyncMode> {
        self.state()
            .displays
            .values()
            .find(|d| d.hw_id == hw_id)
            .map(|d| d.qsync)
    }

    pub fn partial_update_of(&self, hw_id: i32) -> Option<bool> {
        self.state()
            .displays
            .values()
            .find(|d| d.hw_id == hw_id)
            .map(|d| d.partial_update)
    }

    fn with_display<T>(
        &self,
        handle: DisplayHandle,
        f: impl FnOnce(&mut SoftState, i32) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut state = self.state();
        let hw_id = state
            .displays
            .get(&handle)
            .map(|d| d.hw_id)
            .ok_or(EngineError::NoDevice)?;
        f(&mut state, hw_id)
    }
}

impl DisplayEngine for SoftEngine {
    fn displays_status(&self) -> EngineResult<Vec<HwDisplayInfo>> {
        let mut state = self.state();
        if let Some(err) = state.status_error.take() {
            return Err(err);
        }
        Ok(state.hardware.clone())
    }

    fn max_displays(&self, kind: DisplayKind) -> usize {
        match kind {
            DisplayKind::Virtual => 2,
            _ => 4,
        }
    }

    fn request_virtual_hw_id(&self) -> EngineResult<i32> {
        let mut state = self.state();
        let id = state.next_virtual_hw_id;
        state.next_virtual_hw_id += 1;
        Ok(id)
    }

    fn create_display(&self, params: &CreateParams) -> EngineResult<DisplayHandle> {
        let mut state = self.state();
        if let Some(err) = state.create_error.take() {
            return Err(err);
        }
        if params.kind != DisplayKind::Virtual {
            let connected = state
                .hardware
                .iter()
                .any(|d| d.hw_id == params.hw_id && d.connected);
            if !connected {
                return Err(EngineError::NoDevice);
            }
        }
        let handle = DisplayHandle(state.next_handle);
        state.next_handle += 1;
        state.displays.insert(
            handle,
            SoftDisplay {
                hw_id: params.hw_id,
                kind: params.kind,
                power: PowerMode::Off,
                config: 0,
                qsync: QsyncMode::None,
                partial_update: true,
            },
        );
        state.calls.push(EngineCall::Create {
            kind: params.kind,
            hw_id: params.hw_id,
        });
        debug!("soft engine: created {:?} for hw {}", handle, params.hw_id);
        Ok(handle)
    }

    fn destroy_display(&self, handle: DisplayHandle) {
        let mut state = self.state();
        if let Some(display) = state.displays.remove(&handle) {
            state.calls.push(EngineCall::Destroy {
                hw_id: display.hw_id,
            });
        }
    }

    fn commit(&self, handle: DisplayHandle, validate_only: bool) -> EngineResult<CommitOutcome> {
        self.with_display(handle, |state, hw_id| {
            if state.failing_commits.contains(&hw_id) {
                return Err(EngineError::Invalid(format!("commit failed on hw {}", hw_id)));
            }
            if validate_only {
                return Ok(CommitOutcome {
                    retire_fence: None,
                    needs_commit: true,
                });
            }
            let fence = match state.held_fences.as_mut() {
                Some(held) => {
                    let fence = Fence::new();
                    held.push(fence.clone());
                    fence
                }
                None => Fence::signaled(),
            };
            trace!("soft engine: committed hw {}", hw_id);
            Ok(CommitOutcome {
                retire_fence: Some(fence),
                needs_commit: false,
            })
        })
    }

    fn set_power_mode(
        &self,
        handle: DisplayHandle,
        mode: PowerMode,
        teardown: bool,
    ) -> EngineResult<()> {
        self.with_display(handle, |state, hw_id| {
            if let Some(display) = state.displays.get_mut(&handle) {
                display.power = mode;
            }
            state.calls.push(EngineCall::Power {
                hw_id,
                mode,
                teardown,
            });
            Ok(())
        })
    }

    fn doze_supported(&self, handle: DisplayHandle) -> bool {
        let state = self.state();
        state.doze_supported
            && state
                .displays
                .get(&handle)
                .map(|d| d.kind != DisplayKind::Virtual)
                .unwrap_or(false)
    }

    fn active_secure_sessions(&self, handle: DisplayHandle) -> EngineResult<SecureSessions> {
        self.with_display(handle, |state, hw_id| {
            Ok(state.secure.get(&hw_id).copied().unwrap_or_default())
        })
    }

    fn handle_secure_event(
        &self,
        handle: DisplayHandle,
        event: SecureEvent,
        is_target: bool,
    ) -> EngineResult<bool> {
        self.with_display(handle, |state, hw_id| {
            state.calls.push(EngineCall::SecureEvent {
                hw_id,
                event,
                is_target,
            });
            match event {
                SecureEvent::TuiStart if state.deny_tui_start => Err(EngineError::Permission),
                SecureEvent::TuiStart | SecureEvent::TuiEnd => Ok(state.handoff.contains(&hw_id)),
                SecureEvent::TuiPrepare | SecureEvent::TuiUnprepare => Ok(false),
            }
        })
    }

    fn post_handle_secure_event(
        &self,
        handle: DisplayHandle,
        _event: SecureEvent,
    ) -> EngineResult<()> {
        self.with_display(handle, |_, _| Ok(()))
    }

    fn active_config(&self, handle: DisplayHandle) -> EngineResult<u32> {
        let state = self.state();
        state
            .displays
            .get(&handle)
            .map(|d| d.config)
            .ok_or(EngineError::NoDevice)
    }

    fn set_active_config(&self, handle: DisplayHandle, config: u32) -> EngineResult<()> {
        let mut state = self.state();
        let count = state.config_count;
        let display = state
            .displays
            .get_mut(&handle)
            .ok_or(EngineError::NoDevice)?;
        if config >= count {
            return Err(EngineError::Invalid(format!("config {} out of range", config)));
        }
        display.config = config;
        Ok(())
    }

    fn config_count(&self, handle: DisplayHandle) -> EngineResult<u32> {
        self.with_display(handle, |state, _| Ok(state.config_count))
    }

    fn vsync_period_ns(&self, handle: DisplayHandle) -> EngineResult<u64> {
        self.with_display(handle, |state, _| Ok(state.vsync_period_ns))
    }

    fn check_resource_state(&self, handle: DisplayHandle) -> EngineResult<ResourceState> {
        self.with_display(handle, |state, hw_id| {
            Ok(state.resource_pending.get(&hw_id).copied().unwrap_or_default())
        })
    }

    fn set_alternate_config(&self, handle: DisplayHandle, enable: bool) -> EngineResult<()> {
        self.with_display(handle, |state, hw_id| {
            state.calls.push(EngineCall::AlternateConfig { hw_id, enable });
            Ok(())
        })
    }

    fn abort(&self, handle: DisplayHandle) {
        let _ = self.with_display(handle, |state, hw_id| {
            state.calls.push(EngineCall::Abort { hw_id });
            Ok(())
        });
    }

    fn set_idle_timeout(
        &self,
        handle: DisplayHandle,
        _active_ms: u32,
        _inactive_ms: u32,
    ) -> EngineResult<()> {
        self.with_display(handle, |_, _| Ok(()))
    }

    fn set_qsync_mode(&self, handle: DisplayHandle, mode: QsyncMode) -> EngineResult<()> {
        let mut state = self.state();
        let display = state
            .displays
            .get_mut(&handle)
            .ok_or(EngineError::NoDevice)?;
        display.qsync = mode;
        Ok(())
    }

    fn teardown_concurrent_writeback(&self, handle: DisplayHandle) -> EngineResult<()> {
        self.with_display(handle, |state, hw_id| {
            state.calls.push(EngineCall::TeardownWriteback { hw_id });
            Ok(())
        })
    }

    fn control_partial_update(&self, handle: DisplayHandle, enable: bool) -> EngineResult<()> {
        let mut state = self.state();
        let display = state
            .displays
            .get_mut(&handle)
            .ok_or(EngineError::NoDevice)?;
        display.partial_update = enable;
        Ok(())
    }

    fn set_test_pattern(&self, handle: DisplayHandle, pattern: TestPattern) -> EngineResult<()> {
        self.with_display(handle, |state, hw_id| {
            state.calls.push(EngineCall::TestPattern { hw_id, pattern });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin(hw_id: i32) -> HwDisplayInfo {
        HwDisplayInfo {
            hw_id,
            kind: DisplayKind::BuiltIn,
            is_primary: true,
            connected: true,
        }
    }

    fn params(kind: DisplayKind, hw_id: i32) -> CreateParams {
        CreateParams {
            kind,
            hw_id,
            is_primary: false,
            width: 0,
            height: 0,
            format: 0,
        }
    }

    #[test]
    fn test_create_requires_connected_hardware() {
        let engine = SoftEngine::new(vec![builtin(1)]);
        assert!(engine.create_display(&params(DisplayKind::BuiltIn, 1)).is_ok());
        assert_eq!(
            engine.create_display(&params(DisplayKind::Pluggable, 9)),
            Err(EngineError::NoDevice)
        );
        assert!(engine.create_display(&params(DisplayKind::Virtual, 1000)).is_ok());
        assert_eq!(engine.live_displays(), 2);
    }

    #[test]
    fn test_held_fences_signal_on_release() {
        let engine = SoftEngine::new(vec![builtin(1)]);
        let handle = engine.create_display(&params(DisplayKind::BuiltIn, 1)).unwrap();
        engine.hold_fences();
        let fence = engine.commit(handle, false).unwrap().retire_fence.unwrap();
        assert!(!fence.is_signaled());
        engine.release_fences();
        assert!(fence.is_signaled());
    }

    #[test]
    fn test_validate_only_requests_present() {
        let engine = SoftEngine::new(vec![builtin(1)]);
        let handle = engine.create_display(&params(DisplayKind::BuiltIn, 1)).unwrap();
        let outcome = engine.commit(handle, true).unwrap();
        assert!(outcome.needs_commit);
        assert!(outcome.retire_fence.is_none());
    }

    #[test]
    fn test_destroyed_handle_reports_no_device() {
        let engine = SoftEngine::new(vec![builtin(1)]);
        let handle = engine.create_display(&params(DisplayKind::BuiltIn, 1)).unwrap();
        engine.destroy_display(handle);
        assert_eq!(engine.commit(handle, false).unwrap_err(), EngineError::NoDevice);
    }
}

//! Hotplug coordinator
//!
//! Reconciles pluggable slots against the engine's latest hardware list.
//!
//! ```text
//! None ──(deferred by secure session / virtual display / trusted UI)──▶ EventPending
//! EventPending ──(post-commit, gate free)──▶ Processing
//! Processing ──(ok)──▶ None
//! Processing ──(resource deferral / device removed)──▶ EventPending
//! ```
//!
//! The reconcile gate is the outermost lock: it is taken before any slot
//! lock, and commit paths only ever `try_lock` it.

use log::{debug, info, warn};
use std::sync::{Condvar, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::manager::SessionManager;
use super::task::TaskSlot;
use super::uevent::{UeventQueue, UeventSignal, UeventWait};
use crate::constants::UEVENT_POLL_INTERVAL_MS;
use crate::engine::{
    DisplayKind, EngineError, Fence, HwDisplayInfo, PowerMode, SecureSessions, TestPattern,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HotplugState {
    #[default]
    None,
    EventPending,
    Processing,
}

/// What the resource gate knows about an already bound pluggable display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluggableStatus {
    pub client_id: u64,
    pub hw_id: i32,
    pub first_commit_done: bool,
}

/// Decides whether another pluggable display may be created now
pub trait HotplugGate: Send + Sync {
    fn allow_create(&self, existing: &[PluggableStatus]) -> bool;
}

/// Wait for every existing pluggable display to finish its first commit
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstCommitGate;

impl HotplugGate for FirstCommitGate {
    fn allow_create(&self, existing: &[PluggableStatus]) -> bool {
        existing.iter().all(|status| status.first_commit_done)
    }
}

/// No bandwidth precondition
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

impl HotplugGate for OpenGate {
    fn allow_create(&self, _existing: &[PluggableStatus]) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct HotplugCtl {
    state: HotplugState,
    /// Slots created but not yet announced to the client
    pending: Vec<usize>,
    test_pattern: Option<TestPattern>,
}

#[derive(Debug, Default)]
struct ResourceSignal {
    generation: u64,
    display: Option<usize>,
    fence: Option<Fence>,
}

/// Outcome of one connect pass that is not a hard failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectOutcome {
    Done,
    Deferred,
    DeviceRemoved,
}

#[derive(Debug, Default)]
pub(crate) struct HotplugCoordinator {
    reconcile: Mutex<()>,
    ctl: Mutex<HotplugCtl>,
    resource: Mutex<ResourceSignal>,
    resource_cond: Condvar,
    deferred: Mutex<TaskSlot<Result<()>>>,
    pub(super) uevents: UeventQueue,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HotplugCoordinator {
    pub fn new() -> Self {
        Self {
            uevents: UeventQueue::new(),
            ..Self::default()
        }
    }

    fn ctl(&self) -> MutexGuard<'_, HotplugCtl> {
        self.ctl.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn reconcile_lock(&self) -> MutexGuard<'_, ()> {
        self.reconcile
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_reconcile_lock(&self) -> Option<MutexGuard<'_, ()>> {
        match self.reconcile.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn state(&self) -> HotplugState {
        self.ctl().state
    }

    pub fn set_state(&self, state: HotplugState) {
        let mut ctl = self.ctl();
        if ctl.state != state {
            info!("Hotplug state {:?} -> {:?}", ctl.state, state);
            ctl.state = state;
        }
    }

    pub fn pending_notifications(&self) -> Vec<usize> {
        self.ctl().pending.clone()
    }

    fn push_pending(&self, idx: usize) {
        let mut ctl = self.ctl();
        if !ctl.pending.contains(&idx) {
            ctl.pending.push(idx);
        }
    }

    /// Drop `idx` from the pending list; true if it was there
    fn remove_pending(&self, idx: usize) -> bool {
        let mut ctl = self.ctl();
        let before = ctl.pending.len();
        ctl.pending.retain(|&pending| pending != idx);
        ctl.pending.len() != before
    }

    fn take_pending(&self) -> Vec<usize> {
        std::mem::take(&mut self.ctl().pending)
    }

    pub fn set_test_pattern(&self, pattern: Option<TestPattern>) {
        self.ctl().test_pattern = pattern;
    }

    fn take_test_pattern(&self) -> Option<TestPattern> {
        self.ctl().test_pattern.take()
    }

    /// Record a commit completion and wake resource waiters
    pub fn signal_resources(&self, idx: usize, fence: Option<Fence>) {
        let mut signal = self
            .resource
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        signal.generation += 1;
        signal.display = Some(idx);
        signal.fence = fence;
        self.resource_cond.notify_all();
    }

    fn resource_generation(&self) -> u64 {
        self.resource
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .generation
    }

    /// Wait for a commit completion newer than `generation`
    fn wait_resources(
        &self,
        generation: u64,
        deadline: Instant,
    ) -> Option<(Option<usize>, Option<Fence>)> {
        let mut signal = self
            .resource
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while signal.generation == generation {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            signal = self
                .resource_cond
                .wait_timeout(signal, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        Some((signal.display, signal.fence.take()))
    }

    /// Wait for a running deferred reconciliation to finish
    pub fn wait_deferred(&self, timeout: Duration) -> bool {
        self.deferred
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .wait_idle(timeout)
    }
}

impl SessionManager {
    pub fn hotplug_state(&self) -> HotplugState {
        self.hotplug.state()
    }

    /// Slots created by hotplug whose connect has not been announced yet
    pub fn pending_hotplugs(&self) -> Vec<u64> {
        self.hotplug
            .pending_notifications()
            .into_iter()
            .map(|idx| self.slots.client_id(idx))
            .collect()
    }

    /// Secure sessions currently reported by the display in slot `idx`
    pub(super) fn secure_sessions_of(&self, idx: Option<usize>) -> SecureSessions {
        let Some(idx) = idx else {
            return SecureSessions::empty();
        };
        let mut state = self.slots.lock(idx);
        match state.display.as_mut() {
            Some(d) => d.refresh_secure_sessions(self.engine.as_ref()),
            None => SecureSessions::empty(),
        }
    }

    fn primary_is(&self, hw_id: i32) -> bool {
        self.slots
            .lock(0)
            .display
            .as_ref()
            .map(|d| d.hw_id == hw_id)
            .unwrap_or(false)
    }

    /// Reconcile pluggable slots against the current hardware list.
    ///
    /// Transient conditions re-arm `EventPending` and request a refresh of
    /// the active built-in display instead of failing.
    pub fn handle_pluggable_displays(&self, delay_hotplug: bool) -> Result<()> {
        let _gate = self.hotplug.reconcile_lock();
        self.reconcile_locked(delay_hotplug)
    }

    fn reconcile_locked(&self, delay_hotplug: bool) -> Result<()> {
        let active = self.active_builtin_display();
        if self.tui_active()
            || !self.secure_sessions_of(active).is_empty()
            || self.virtual_display_active()
        {
            info!("Marking hotplug pending");
            self.hotplug.set_state(HotplugState::EventPending);
            return Ok(());
        }

        debug!("Handling hotplug");
        let hardware = match self.engine.displays_status() {
            Ok(hardware) => hardware,
            Err(e) => {
                warn!("Failed to get connected display list: {}", e);
                // A deferred event stays armed for the next commit
                if self.hotplug.state() == HotplugState::Processing {
                    self.hotplug.set_state(HotplugState::EventPending);
                }
                return Err(Error::NoResources("display status unavailable"));
            }
        };

        self.disconnect_pass(&hardware);

        match self.connect_pass(&hardware, delay_hotplug, active) {
            Ok(ConnectOutcome::Done) => {
                self.hotplug.set_state(HotplugState::None);
                debug!("Handling hotplug done");
                Ok(())
            }
            Ok(outcome) => {
                info!("Hotplug {:?}, retrying on next commit", outcome);
                self.hotplug.set_state(HotplugState::EventPending);
                self.refresh_slot(active.unwrap_or(0));
                Ok(())
            }
            Err(e) => {
                self.hotplug.set_state(HotplugState::None);
                warn!("Hotplug handling stopped: {}", e);
                Err(e)
            }
        }
    }

    fn disconnect_pass(&self, hardware: &[HwDisplayInfo]) {
        let pluggables: Vec<usize> = self.slots.indices(DisplayKind::Pluggable).collect();
        for idx in pluggables {
            let bound_hw = self.slots.lock(idx).display.as_ref().map(|d| d.hw_id);
            let Some(hw_id) = bound_hw else {
                continue;
            };
            let still_connected = hardware
                .iter()
                .any(|hw| hw.hw_id == hw_id && hw.connected);
            if !still_connected {
                self.disconnect_pluggable(idx);
            }
        }
    }

    /// Tear down the pluggable display in slot `idx`.
    ///
    /// A display whose connect was never announced is removed silently.
    fn disconnect_pluggable(&self, idx: usize) {
        let client_id = self.slots.client_id(idx);
        let was_pending = self.hotplug.remove_pending(idx);
        let removed = self.slots.lock_settled(idx).unbind(client_id);
        self.slots.notify(idx);
        let Some(mut display) = removed else {
            return;
        };

        self.engine.abort(display.handle);
        if display.power_mode != PowerMode::Off {
            if let Err(e) = display.set_power_mode(self.engine.as_ref(), PowerMode::Off, true) {
                warn!("Display {}: power off on disconnect failed: {}", client_id, e);
            }
        }
        self.engine.destroy_display(display.handle);
        info!("Pluggable display hw={} removed from slot {}", display.hw_id, idx);

        if was_pending {
            info!("Display {} disconnected before its connect was announced", client_id);
        } else {
            self.notify_hotplug(idx, false);
        }

        if self.settings.enable_primary_reconfig_req {
            if let Some(active) = self.active_builtin_display() {
                let state = self.slots.lock(active);
                if let Some(d) = state.display.as_ref() {
                    if let Err(e) = self.engine.set_alternate_config(d.handle, false) {
                        debug!("Restoring built-in config failed: {}", e);
                    }
                }
            }
        }
    }

    fn pluggable_statuses(&self) -> Vec<PluggableStatus> {
        let pluggables: Vec<usize> = self.slots.indices(DisplayKind::Pluggable).collect();
        pluggables
            .into_iter()
            .filter_map(|idx| {
                let state = self.slots.lock(idx);
                state.display.as_ref().map(|d| PluggableStatus {
                    client_id: d.client_id,
                    hw_id: d.hw_id,
                    first_commit_done: d.first_commit_done,
                })
            })
            .collect()
    }

    fn free_slot(&self, kind: DisplayKind) -> Option<usize> {
        let candidates: Vec<usize> = self.slots.indices(kind).collect();
        candidates
            .into_iter()
            .find(|&idx| self.slots.lock(idx).display.is_none())
    }

    fn connect_pass(
        &self,
        hardware: &[HwDisplayInfo],
        delay_hotplug: bool,
        active: Option<usize>,
    ) -> Result<ConnectOutcome> {
        for hw in hardware
            .iter()
            .filter(|hw| hw.kind == DisplayKind::Pluggable && hw.connected)
        {
            if self.primary_is(hw.hw_id) || self.slot_of_hw(hw.hw_id).is_some() {
                continue;
            }

            let existing = self.pluggable_statuses();
            if !self.hotplug_gate.allow_create(&existing) {
                info!(
                    "Deferring hw {}: an earlier pluggable display has not committed yet",
                    hw.hw_id
                );
                for status in existing.iter().filter(|s| !s.first_commit_done) {
                    if let Some(idx) = self.slots.resolve(status.client_id) {
                        self.refresh_slot(idx);
                    }
                }
                return Ok(ConnectOutcome::Deferred);
            }

            let Some(idx) = self.free_slot(DisplayKind::Pluggable) else {
                warn!("No free pluggable slot for hw {}", hw.hw_id);
                break;
            };
            match self.create_physical(idx, hw, false) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(EngineError::Again) => return Ok(ConnectOutcome::Deferred),
                Err(EngineError::NoDevice) => return Ok(ConnectOutcome::DeviceRemoved),
                Err(e) => {
                    warn!("Failed to create pluggable hw {}: {}", hw.hw_id, e);
                    return Err(e.into_session(self.slots.client_id(idx)));
                }
            }
            info!("Pluggable display hw={} bound to slot {}", hw.hw_id, idx);

            if let Some(pattern) = self.hotplug.take_test_pattern() {
                let mut state = self.slots.lock(idx);
                if let Some(d) = state.display.as_mut() {
                    match self.engine.set_test_pattern(d.handle, pattern) {
                        Ok(()) => d.test_pattern = Some(pattern),
                        Err(e) => debug!("Test pattern not applied: {}", e),
                    }
                }
            }
            self.hotplug.push_pending(idx);
        }

        let pending = self.hotplug.pending_notifications();
        let Some(&last) = pending.last() else {
            return Ok(ConnectOutcome::Done);
        };
        if let Some(active) = active {
            if let Err(e) = self.wait_for_resources(delay_hotplug, active, last) {
                warn!("Resources not ready for display {}: {}", last, e);
                return Ok(ConnectOutcome::Deferred);
            }
        }

        for idx in self.hotplug.take_pending() {
            self.notify_hotplug(idx, true);
        }
        Ok(ConnectOutcome::Done)
    }

    fn check_resource_state(&self, idx: usize) -> Result<crate::engine::ResourceState> {
        let client_id = self.slots.client_id(idx);
        let state = self.slots.lock(idx);
        let d = state.display.as_ref().ok_or_else(|| {
            warn!("Display {} no longer available", client_id);
            Error::BadDisplay(client_id)
        })?;
        self.engine
            .check_resource_state(d.handle)
            .map_err(|e| e.into_session(client_id))
    }

    /// Block until the engine reports resources for the new display `idx`.
    ///
    /// Each round refreshes the active built-in display and waits for the
    /// next commit completion; the whole wait is bounded.
    fn wait_for_resources(&self, delay_hotplug: bool, active: usize, idx: usize) -> Result<()> {
        if !delay_hotplug {
            return Ok(());
        }
        let timeout = self.timeouts.hotplug_resource();
        let deadline = Instant::now() + timeout;

        let mut needs_reconfig = false;
        if self.settings.enable_primary_reconfig_req {
            needs_reconfig = self.check_resource_state(idx)?.needs_builtin_reconfig;
            if needs_reconfig {
                let client_id = self.slots.client_id(active);
                let mut state = self.slots.lock(active);
                let d = state
                    .display
                    .as_mut()
                    .ok_or(Error::BadDisplay(client_id))?;
                self.engine
                    .set_alternate_config(d.handle, true)
                    .map_err(|e| {
                        warn!(
                            "Active built-in {} cannot switch to a lower resource config",
                            client_id
                        );
                        e.into_session(client_id)
                    })?;
                if d.sync_active_config(self.engine.as_ref()) {
                    info!("Display {} moved to config {}", client_id, d.active_config);
                }
            }
        }

        loop {
            let generation = self.hotplug.resource_generation();
            if self.client_connected() {
                self.refresh_slot(active);
            }
            let Some((display, fence)) = self.hotplug.wait_resources(generation, deadline) else {
                warn!("Hotplug resource wait timed out after {:?}", timeout);
                return Err(Error::Timeout(timeout));
            };
            if display == Some(active) && needs_reconfig {
                if let Some(fence) = fence {
                    let _ = self.engine.wait_fence(&fence, self.timeouts.fence_wait());
                }
            }
            let resources = self.check_resource_state(idx)?;
            needs_reconfig =
                self.settings.enable_primary_reconfig_req && resources.needs_builtin_reconfig;
            if !resources.pending && !needs_reconfig {
                return Ok(());
            }
            debug!("Resources for display {} still pending", idx);
        }
    }

    /// Kick off a deferred reconciliation once the active built-in commits.
    ///
    /// Runs on the commit path, so the gate is only tried, never waited on.
    /// While trusted UI is active the event stays armed; unprepare runs it.
    pub(super) fn handle_pending_hotplug(&self, idx: usize, retire_fence: Option<&Fence>) {
        if self.hotplug.state() != HotplugState::EventPending || self.tui_active() {
            return;
        }
        let active = self.active_builtin_display();
        if active != Some(idx) || !self.secure_sessions_of(active).is_empty() {
            return;
        }
        if let Some(fence) = retire_fence {
            let _ = self.engine.wait_fence(fence, self.timeouts.fence_wait());
        }
        if self.virtual_display_active() || self.hotplug.state() != HotplugState::EventPending {
            return;
        }
        let Some(gate) = self.hotplug.try_reconcile_lock() else {
            debug!("Hotplug handling already in progress");
            return;
        };
        self.hotplug.set_state(HotplugState::Processing);
        drop(gate);
        if let Err(e) = self.spawn_deferred_hotplug() {
            warn!("Failed to start deferred hotplug: {}", e);
            self.hotplug.set_state(HotplugState::EventPending);
        }
    }

    /// Run `handle_pluggable_displays(true)` on a worker thread
    pub(super) fn spawn_deferred_hotplug(&self) -> Result<()> {
        let manager = self.arc()?;
        let mut deferred = self
            .hotplug
            .deferred
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        deferred.start("dsm-hotplug-deferred", move || {
            manager.handle_pluggable_displays(true)
        })?;
        Ok(())
    }

    /// Remove every pluggable display, arming a deferred hotplug event.
    ///
    /// Returns whether anything was torn down. The caller holds the
    /// reconcile gate.
    pub(super) fn teardown_pluggable_displays(&self) -> bool {
        let pluggables: Vec<usize> = self.slots.indices(DisplayKind::Pluggable).collect();
        let mut removed = false;
        for idx in pluggables {
            if self.slots.lock(idx).display.is_some() {
                self.disconnect_pluggable(idx);
                removed = true;
            }
        }
        if removed {
            self.hotplug.set_state(HotplugState::EventPending);
        }
        removed
    }

    // ========================================================================
    // Uevent path
    // ========================================================================

    /// Producer side: record one hotplug uevent
    pub fn on_uevent(&self, signal: UeventSignal) {
        if !signal.hotplug {
            return;
        }
        if signal.test_pattern.is_some() {
            self.hotplug.set_test_pattern(signal.test_pattern);
        }
        debug!("Hotplug uevent (status hint {:?})", signal.connected);
        self.hotplug.uevents.push();
    }

    /// Start the consumer thread that runs reconciliation per uevent
    pub fn start_hotplug_worker(&self) -> Result<()> {
        let mut worker = self
            .hotplug
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if worker.is_some() {
            return Ok(());
        }
        self.hotplug.uevents.reset();
        let weak = self.weak();
        let handle = thread::Builder::new()
            .name("dsm-hotplug".to_string())
            .spawn(move || {
                let interval = Duration::from_millis(UEVENT_POLL_INTERVAL_MS);
                loop {
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    match manager.hotplug.uevents.wait_next(interval) {
                        UeventWait::Terminate => break,
                        UeventWait::Idle => continue,
                        UeventWait::Event => {
                            if !manager.client_connected() {
                                debug!("No client registered, dropping hotplug event");
                                continue;
                            }
                            if let Err(e) = manager.handle_pluggable_displays(true) {
                                warn!("Hotplug handling failed: {}", e);
                            }
                        }
                    }
                }
                debug!("Hotplug worker exiting");
            })
            .map_err(|e| {
                warn!("Failed to spawn hotplug worker: {}", e);
                Error::NoResources("hotplug worker thread")
            })?;
        *worker = Some(handle);
        info!("Hotplug worker started");
        Ok(())
    }

    pub fn stop_hotplug_worker(&self) {
        self.hotplug.uevents.terminate();
        let handle = self
            .hotplug
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
            info!("Hotplug worker stopped");
        }
    }
}

//! Session manager
//!
//! `SessionManager` owns the slot table and every coordinator that acts on
//! it. It is constructed once at start-up, shared as an `Arc`, and torn
//! down with `deinit()`. Worker threads hold a `Weak` back-reference so
//! they never keep a torn-down manager alive.

use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

use super::callbacks::ClientCallbacks;
use super::display::DisplayObject;
use super::hotplug::{FirstCommitGate, HotplugCoordinator, HotplugGate, OpenGate};
use super::slot::{SlotLayout, SlotTable};
use super::task::TaskSlot;
use super::tui::TuiCoordinator;
use super::virtual_display::VirtualDisplays;
use crate::config::{Config, SessionConfig, TimeoutConfig};
use crate::engine::{
    CreateParams, DisplayEngine, DisplayKind, EngineResult, HwDisplayInfo, PowerMode,
};
use crate::error::{Error, Result};

/// Pick the hardware display that becomes the primary.
///
/// An engine-flagged primary wins, then the first connected built-in,
/// then the first connected display of any kind.
pub(crate) fn pick_primary(hardware: &[HwDisplayInfo]) -> Option<&HwDisplayInfo> {
    let connected = || hardware.iter().filter(|hw| hw.connected);
    connected()
        .find(|hw| hw.is_primary)
        .or_else(|| connected().find(|hw| hw.kind == DisplayKind::BuiltIn))
        .or_else(|| connected().next())
}

pub struct SessionManager {
    me: Weak<SessionManager>,
    pub(super) settings: SessionConfig,
    pub(super) timeouts: TimeoutConfig,
    pub(super) engine: Arc<dyn DisplayEngine>,
    pub(super) hotplug_gate: Arc<dyn HotplugGate>,
    pub(super) slots: SlotTable,
    callbacks: RwLock<Option<Arc<dyn ClientCallbacks>>>,
    client_connected: AtomicBool,
    /// Hardware id the primary slot was brought up on
    primary_hw_id: Mutex<Option<i32>>,
    pub(super) hotplug: HotplugCoordinator,
    pub(super) secure_active: AtomicBool,
    pub(super) tui: TuiCoordinator,
    pub(super) virtuals: VirtualDisplays,
    /// One asynchronous commit waiter per slot
    pub(super) commit_tasks: Vec<Mutex<TaskSlot<Result<()>>>>,
    /// Slots that need one more refresh, one bit per slot index
    pub(super) pending_refresh: AtomicU64,
    /// Idle timeout requested by the client, restored after trusted UI
    pub(super) idle_time_active_ms: AtomicU32,
}

impl SessionManager {
    /// Create a manager with the hotplug gate selected by configuration
    pub fn new(config: &Config, engine: Arc<dyn DisplayEngine>) -> Arc<Self> {
        let gate: Arc<dyn HotplugGate> = if config.session.disable_hotplug_bwcheck {
            Arc::new(OpenGate)
        } else {
            Arc::new(FirstCommitGate)
        };
        Self::with_gate(config, engine, gate)
    }

    /// Create a manager with a caller-provided hotplug resource predicate
    pub fn with_gate(
        config: &Config,
        engine: Arc<dyn DisplayEngine>,
        hotplug_gate: Arc<dyn HotplugGate>,
    ) -> Arc<Self> {
        let hardware = engine.displays_status().unwrap_or_else(|e| {
            warn!("Failed to read display status: {}", e);
            Vec::new()
        });
        let primary_is_pluggable = pick_primary(&hardware)
            .map(|hw| hw.kind == DisplayKind::Pluggable)
            .unwrap_or(false);
        let session = &config.session;
        let layout = SlotLayout::new(
            primary_is_pluggable,
            session.max_builtin.min(engine.max_displays(DisplayKind::BuiltIn)),
            session.max_pluggable.min(engine.max_displays(DisplayKind::Pluggable)),
            session.max_virtual.min(engine.max_displays(DisplayKind::Virtual)),
        );
        let slots = SlotTable::new(layout, config.timeouts.sequence_settle());
        let commit_tasks = (0..slots.len()).map(|_| Mutex::new(TaskSlot::new())).collect();

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings: config.session.clone(),
            timeouts: config.timeouts.clone(),
            engine,
            hotplug_gate,
            slots,
            callbacks: RwLock::new(None),
            client_connected: AtomicBool::new(false),
            primary_hw_id: Mutex::new(None),
            hotplug: HotplugCoordinator::new(),
            secure_active: AtomicBool::new(false),
            tui: TuiCoordinator::new(),
            virtuals: VirtualDisplays::new(),
            commit_tasks,
            pending_refresh: AtomicU64::new(0),
            idle_time_active_ms: AtomicU32::new(config.session.idle_time_active_ms),
        })
    }

    /// Strong reference for handing to worker threads
    pub(super) fn arc(&self) -> Result<Arc<Self>> {
        self.me
            .upgrade()
            .ok_or(Error::NoResources("session manager shutting down"))
    }

    pub(super) fn weak(&self) -> Weak<Self> {
        self.me.clone()
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    pub fn engine(&self) -> &Arc<dyn DisplayEngine> {
        &self.engine
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bring up the primary display and power it on
    pub fn init(&self) -> Result<()> {
        let attempts = self.timeouts.primary_bringup_retries.max(1);
        let interval = Duration::from_millis(self.timeouts.primary_bringup_interval_ms);
        let mut primary = None;
        for attempt in 1..=attempts {
            match self.engine.displays_status() {
                Ok(hardware) => {
                    if let Some(hw) = pick_primary(&hardware) {
                        primary = Some(hw.clone());
                        break;
                    }
                }
                Err(e) => warn!("Failed to read display status: {}", e),
            }
            debug!("No primary display yet (attempt {}/{})", attempt, attempts);
            if attempt < attempts {
                thread::sleep(interval);
            }
        }
        let primary = primary.ok_or(Error::NoResources("no connected primary display"))?;

        self.create_physical(0, &primary, true)
            .map_err(|e| e.into_session(0))?;
        *self
            .primary_hw_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(primary.hw_id);

        let mut state = self.slots.lock(0);
        if let Some(display) = state.display.as_mut() {
            display.set_power_mode(self.engine.as_ref(), PowerMode::On, false)?;
            if let Err(e) = self.engine.set_idle_timeout(
                display.handle,
                self.idle_time_active_ms.load(Ordering::Acquire),
                self.settings.idle_time_inactive_ms,
            ) {
                debug!("Idle timeout not applied to primary: {}", e);
            }
        }
        info!(
            "Primary display up: hw={} class={}",
            primary.hw_id, primary.kind
        );
        Ok(())
    }

    /// Stop workers, then power off and destroy every display
    pub fn deinit(&self) {
        self.stop_hotplug_worker();
        self.unregister_callback();
        self.hotplug.wait_deferred(self.timeouts.fence_wait());

        for idx in (0..self.slots.len()).rev() {
            let client_id = self.slots.client_id(idx);
            let removed = self.slots.lock_settled(idx).unbind(client_id);
            self.slots.notify(idx);
            if let Some(mut display) = removed {
                self.engine.abort(display.handle);
                if display.power_mode != PowerMode::Off {
                    if let Err(e) =
                        display.set_power_mode(self.engine.as_ref(), PowerMode::Off, true)
                    {
                        warn!("Display {}: power off failed: {}", client_id, e);
                    }
                }
                self.engine.destroy_display(display.handle);
            }
        }
        self.virtuals.clear();
        info!("Session manager torn down");
    }

    /// Create an engine display for `hw` and bind it into slot `idx`.
    ///
    /// Returns Ok(false) when the slot was already occupied.
    pub(super) fn create_physical(
        &self,
        idx: usize,
        hw: &HwDisplayInfo,
        is_primary: bool,
    ) -> EngineResult<bool> {
        let mut state = self.slots.lock_settled(idx);
        if state.display.is_some() {
            return Ok(false);
        }
        let handle = self.engine.create_display(&CreateParams {
            kind: hw.kind,
            hw_id: hw.hw_id,
            is_primary,
            width: 0,
            height: 0,
            format: 0,
        })?;
        let display = DisplayObject::new(self.slots.client_id(idx), hw.kind, hw.hw_id, handle);
        if let Err(rejected) = state.bind(display) {
            self.engine.destroy_display(rejected.handle);
            return Ok(false);
        }
        debug!("Bound hw {} ({}) to slot {}", hw.hw_id, hw.kind, idx);
        Ok(true)
    }

    /// Slot index currently bound to physical hardware `hw_id`
    pub(super) fn slot_of_hw(&self, hw_id: i32) -> Option<usize> {
        let real: Vec<usize> = self.slots.real_indices().collect();
        real.into_iter().find(|&idx| {
            self.slots
                .lock(idx)
                .display
                .as_ref()
                .map(|d| d.hw_id == hw_id && !d.is_virtual())
                .unwrap_or(false)
        })
    }

    /// Create every connected non-primary built-in display
    pub fn handle_builtin_displays(&self) -> Result<()> {
        let hardware = self
            .engine
            .displays_status()
            .map_err(|e| e.into_session(0))?;
        let primary_hw = *self
            .primary_hw_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _gate = self.hotplug.reconcile_lock();

        for hw in hardware
            .iter()
            .filter(|hw| hw.kind == DisplayKind::BuiltIn && hw.connected)
        {
            if Some(hw.hw_id) == primary_hw || self.slot_of_hw(hw.hw_id).is_some() {
                continue;
            }
            let free: Vec<usize> = self.slots.indices(DisplayKind::BuiltIn).collect();
            let Some(idx) = free.into_iter().find(|&i| self.slots.lock(i).display.is_none())
            else {
                warn!("No free built-in slot for hw {}", hw.hw_id);
                break;
            };
            match self.create_physical(idx, hw, false) {
                Ok(true) => {
                    info!("Built-in display hw={} bound to slot {}", hw.hw_id, idx);
                    self.notify_hotplug(idx, true);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to create built-in hw {}: {}", hw.hw_id, e);
                    return Err(e.into_session(self.slots.client_id(idx)));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Client callbacks
    // ========================================================================

    /// Register the compositor client and announce the current displays
    pub fn register_callback(&self, callbacks: Arc<dyn ClientCallbacks>) -> Result<()> {
        *self
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(callbacks);
        let reregistered = self.client_connected.swap(true, Ordering::AcqRel);
        info!(
            "Client callbacks {}",
            if reregistered { "re-registered" } else { "registered" }
        );

        let pending = self.hotplug.pending_notifications();
        let real: Vec<usize> = self.slots.real_indices().collect();
        for idx in real {
            let bound = self.slots.lock(idx).display.is_some();
            if bound && !pending.contains(&idx) {
                self.notify_hotplug(idx, true);
            }
        }

        if let Err(e) = self.handle_builtin_displays() {
            warn!("Built-in bring-up failed: {}", e);
        }
        if let Err(e) = self.handle_pluggable_displays(false) {
            warn!("Pluggable reconciliation failed: {}", e);
        }
        Ok(())
    }

    pub fn unregister_callback(&self) {
        self.client_connected.store(false, Ordering::Release);
        *self
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    pub fn client_connected(&self) -> bool {
        self.client_connected.load(Ordering::Acquire)
    }

    fn callbacks(&self) -> Option<Arc<dyn ClientCallbacks>> {
        self.callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(super) fn notify_hotplug(&self, idx: usize, connected: bool) {
        let client_id = self.slots.client_id(idx);
        match self.callbacks() {
            Some(cb) => {
                info!(
                    "Hotplug notify: display {} {}",
                    client_id,
                    if connected { "connected" } else { "disconnected" }
                );
                cb.on_hotplug(client_id, connected);
            }
            None => debug!("No client for hotplug notify of display {}", client_id),
        }
    }

    pub(super) fn refresh_slot(&self, idx: usize) {
        if let Some(cb) = self.callbacks() {
            trace!("Refresh requested for slot {}", idx);
            cb.on_refresh(self.slots.client_id(idx));
        }
    }

    pub(super) fn notify_tui_done(
        &self,
        display: u64,
        event: super::tui::TuiEvent,
        result: &Result<()>,
    ) {
        if let Some(cb) = self.callbacks() {
            cb.on_tui_event_done(display, event, result);
        }
    }

    /// Ask the client to draw a new frame on `display`
    pub fn refresh(&self, display: u64) -> Result<()> {
        let idx = self.slot_index(display)?;
        self.refresh_slot(idx);
        Ok(())
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    pub(super) fn slot_index(&self, display: u64) -> Result<usize> {
        self.slots.resolve(display).ok_or(Error::BadDisplay(display))
    }

    /// First powered built-in display, if any.
    ///
    /// Takes slot locks one at a time, so it must not be called while the
    /// caller holds a slot lock.
    pub fn active_builtin_display(&self) -> Option<usize> {
        let candidates: Vec<usize> = std::iter::once(0)
            .chain(self.slots.indices(DisplayKind::BuiltIn))
            .collect();
        candidates.into_iter().find(|&idx| {
            self.slots
                .lock(idx)
                .display
                .as_ref()
                .map(|d| d.is_builtin() && d.power_mode != PowerMode::Off)
                .unwrap_or(false)
        })
    }

    pub(super) fn is_hw_connected(&self, hw_id: i32) -> bool {
        self.engine
            .displays_status()
            .map(|hardware| hardware.iter().any(|hw| hw.hw_id == hw_id && hw.connected))
            .unwrap_or(false)
    }

    pub(super) fn mark_pending_refresh(&self, idx: usize) {
        // The slot table is capped at MAX_SLOTS, so every index has a bit
        match u32::try_from(idx).ok().and_then(|idx| 1u64.checked_shl(idx)) {
            Some(bit) => {
                self.pending_refresh.fetch_or(bit, Ordering::AcqRel);
            }
            None => warn!("Slot {} has no pending-refresh bit", idx),
        }
    }

    /// Issue the refresh for the lowest slot that asked for one
    pub(super) fn handle_pending_refresh(&self) {
        let pending = self.pending_refresh.load(Ordering::Acquire);
        if pending == 0 {
            return;
        }
        let idx = pending.trailing_zeros() as usize;
        self.pending_refresh
            .fetch_and(!(1u64 << idx), Ordering::AcqRel);
        if idx < self.slots.len() {
            self.refresh_slot(idx);
        }
    }
}

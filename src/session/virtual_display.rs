//! Virtual displays and their reuse cache
//!
//! A destroyed virtual display keeps its engine object and its slot; the
//! cache entry is only marked idle so a later create with the same
//! geometry can take it back without allocating new hardware.

use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::display::{DisplayObject, VirtualGeometry};
use super::manager::SessionManager;
use super::task::{TaskSlot, TaskWaiter};
use crate::engine::{CreateParams, DisplayKind, PowerMode};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VirtualEntry {
    key: VirtualGeometry,
    in_use: bool,
}

#[derive(Debug, Default)]
pub(crate) struct VirtualDisplays {
    gate: Mutex<()>,
    /// Keyed by slot index
    cache: Mutex<BTreeMap<usize, VirtualEntry>>,
    async_create: Mutex<TaskSlot<Result<u64>>>,
    async_result: Mutex<Option<TaskWaiter<Result<u64>>>>,
}

impl VirtualDisplays {
    pub fn new() -> Self {
        Self::default()
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cache(&self) -> MutexGuard<'_, BTreeMap<usize, VirtualEntry>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn active(&self) -> bool {
        self.cache().values().any(|entry| entry.in_use)
    }

    /// Mark an idle entry with `key` in use again
    fn claim_idle(&self, key: VirtualGeometry) -> Option<usize> {
        let mut cache = self.cache();
        let (&idx, entry) = cache
            .iter_mut()
            .find(|(_, entry)| !entry.in_use && entry.key == key)?;
        entry.in_use = true;
        Some(idx)
    }

    fn idle_entry(&self) -> Option<usize> {
        self.cache()
            .iter()
            .find(|(_, entry)| !entry.in_use)
            .map(|(&idx, _)| idx)
    }

    fn release(&self, idx: usize) -> bool {
        match self.cache().get_mut(&idx) {
            Some(entry) if entry.in_use => {
                entry.in_use = false;
                true
            }
            _ => false,
        }
    }

    fn entries(&self) -> Vec<(usize, VirtualGeometry, bool)> {
        self.cache()
            .iter()
            .map(|(&idx, entry)| (idx, entry.key, entry.in_use))
            .collect()
    }

    pub fn clear(&self) {
        self.cache().clear();
    }
}

impl SessionManager {
    pub fn virtual_display_active(&self) -> bool {
        self.virtuals.active()
    }

    /// Whether any physical display currently reports a secure session
    fn any_secure_sessions(&self) -> bool {
        let real: Vec<usize> = self.slots.real_indices().collect();
        real.into_iter()
            .any(|idx| !self.secure_sessions_of(Some(idx)).is_empty())
    }

    fn pluggable_bound(&self) -> bool {
        let pluggables: Vec<usize> = self.slots.indices(DisplayKind::Pluggable).collect();
        pluggables
            .into_iter()
            .any(|idx| self.slots.lock(idx).display.is_some())
    }

    /// Create (or reuse) a virtual display and return its client id.
    ///
    /// The display comes back powered off either way, a reused one because
    /// destroy powered it off. The client powers it on with `set_power_mode`.
    pub fn create_virtual_display(&self, width: u32, height: u32, format: u32) -> Result<u64> {
        if width == 0 || height == 0 {
            return Err(Error::BadParameter("virtual display size"));
        }
        let _gate = self.virtuals.gate();

        if self.any_secure_sessions() {
            info!("Secure session active, refusing virtual display");
            return Err(Error::Unsupported("secure session active"));
        }
        if self.pluggable_bound() {
            info!("Pluggable display connected, refusing virtual display");
            return Err(Error::Unsupported("writeback in use by pluggable display"));
        }

        let key = VirtualGeometry {
            width,
            height,
            format,
        };
        if let Some(idx) = self.virtuals.claim_idle(key) {
            info!(
                "Reusing virtual display {} ({}x{} {:#x})",
                idx, width, height, format
            );
            return Ok(self.slots.client_id(idx));
        }

        let free: Vec<usize> = self.slots.indices(DisplayKind::Virtual).collect();
        let idx = match free
            .into_iter()
            .find(|&idx| self.slots.lock(idx).display.is_none())
        {
            Some(idx) => idx,
            None => {
                let idx = self
                    .virtuals
                    .idle_entry()
                    .ok_or(Error::NoResources("no free virtual display slot"))?;
                debug!("Evicting idle virtual display {}", idx);
                self.destroy_virtual_slot(idx);
                idx
            }
        };

        let client_id = self.slots.client_id(idx);
        let hw_id = self
            .engine
            .request_virtual_hw_id()
            .map_err(|e| e.into_session(client_id))?;
        {
            let mut state = self.slots.lock_settled(idx);
            if state.display.is_some() {
                return Err(Error::inconsistency(format!(
                    "virtual slot {} occupied under the virtual gate",
                    idx
                )));
            }
            let handle = self
                .engine
                .create_display(&CreateParams {
                    kind: DisplayKind::Virtual,
                    hw_id,
                    is_primary: false,
                    width,
                    height,
                    format,
                })
                .map_err(|e| e.into_session(client_id))?;
            let mut display = DisplayObject::new(client_id, DisplayKind::Virtual, hw_id, handle);
            display.geometry = Some(key);
            if let Err(rejected) = state.bind(display) {
                self.engine.destroy_display(rejected.handle);
                return Err(Error::NoResources("virtual slot taken"));
            }
        }
        self.virtuals.cache().insert(idx, VirtualEntry { key, in_use: true });
        info!(
            "Virtual display {} created ({}x{} {:#x}, hw {})",
            client_id, width, height, format, hw_id
        );
        Ok(client_id)
    }

    /// Return a virtual display to the reuse cache and power it off
    pub fn destroy_virtual_display(&self, display: u64) -> Result<()> {
        let idx = self.slot_index(display)?;
        if self.slots.kind(idx) != DisplayKind::Virtual {
            return Err(Error::BadDisplay(display));
        }
        let _gate = self.virtuals.gate();
        if !self.virtuals.release(idx) {
            return Err(Error::BadDisplay(display));
        }
        let mut state = self.slots.lock_settled(idx);
        if let Some(d) = state.display.as_mut() {
            if d.power_mode != PowerMode::Off {
                if let Err(e) = d.set_power_mode(self.engine.as_ref(), PowerMode::Off, false) {
                    warn!("Virtual display {}: power off failed: {}", display, e);
                }
            }
        }
        info!("Virtual display {} returned to cache", display);
        Ok(())
    }

    /// Unbind and destroy the engine display in virtual slot `idx`
    fn destroy_virtual_slot(&self, idx: usize) {
        let client_id = self.slots.client_id(idx);
        let removed = self.slots.lock_settled(idx).unbind(client_id);
        self.slots.notify(idx);
        self.virtuals.cache().remove(&idx);
        if let Some(mut display) = removed {
            self.engine.abort(display.handle);
            if display.power_mode != PowerMode::Off {
                let _ = display.set_power_mode(self.engine.as_ref(), PowerMode::Off, true);
            }
            self.engine.destroy_display(display.handle);
        }
    }

    /// Tear down every virtual display, cached or in use
    pub(super) fn destroy_all_virtual_displays(&self) {
        let _gate = self.virtuals.gate();
        let entries = self.virtuals.entries();
        for (idx, _, in_use) in entries {
            if in_use {
                info!("Destroying virtual display {} for secure session", idx);
            }
            self.destroy_virtual_slot(idx);
        }
    }

    /// Start virtual display creation on a worker
    pub fn create_virtual_display_async(&self, width: u32, height: u32, format: u32) -> Result<()> {
        if !self.settings.async_vds_creation {
            return Err(Error::Unsupported("async virtual display creation disabled"));
        }
        let manager = self.arc()?;
        let waiter = self
            .virtuals
            .async_create
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .start("dsm-vds-create", move || {
                manager.create_virtual_display(width, height, format)
            })?;
        *self
            .virtuals
            .async_result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(waiter);
        Ok(())
    }

    /// Collect the result of `create_virtual_display_async`
    pub fn take_virtual_display_result(&self, timeout: Duration) -> Result<u64> {
        let mut slot = self
            .virtuals
            .async_result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let waiter = slot
            .as_ref()
            .ok_or(Error::BadParameter("no virtual display creation pending"))?;
        match waiter.wait_timeout(timeout) {
            Some(result) => {
                *slot = None;
                result
            }
            None => Err(Error::Timeout(timeout)),
        }
    }

    pub(super) fn virtual_cache_summary(&self) -> Vec<(u64, VirtualGeometry, bool)> {
        self.virtuals
            .entries()
            .into_iter()
            .map(|(idx, key, in_use)| (self.slots.client_id(idx), key, in_use))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{HwDisplayInfo, SecureSessions, SoftEngine};
    use std::sync::Arc;

    fn setup(config: Config) -> (Arc<SoftEngine>, Arc<SessionManager>) {
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
                connected: false,
            },
        ]));
        let manager = SessionManager::new(&config, engine.clone());
        manager.init().unwrap();
        (engine, manager)
    }

    #[test]
    fn test_reuse_idle_entry() {
        let (engine, manager) = setup(Config::default());
        let first = manager.create_virtual_display(1280, 720, 1).unwrap();
        manager.destroy_virtual_display(first).unwrap();
        let again = manager.create_virtual_display(1280, 720, 1).unwrap();
        assert_eq!(first, again);
        assert_eq!(engine.create_count(DisplayKind::Virtual), 1);

        // Same key while in use allocates a fresh one
        let second = manager.create_virtual_display(1280, 720, 1).unwrap();
        assert_ne!(first, second);
        assert_eq!(engine.create_count(DisplayKind::Virtual), 2);
    }

    #[test]
    fn test_reused_display_returns_powered_off() {
        let (engine, manager) = setup(Config::default());
        let id = manager.create_virtual_display(1280, 720, 1).unwrap();
        manager.set_power_mode(id, PowerMode::On).unwrap();
        manager.destroy_virtual_display(id).unwrap();

        assert_eq!(manager.create_virtual_display(1280, 720, 1).unwrap(), id);
        assert_eq!(manager.get_power_mode(id).unwrap(), PowerMode::Off);
        manager.set_power_mode(id, PowerMode::On).unwrap();
        assert_eq!(engine.power_of(1000), Some(PowerMode::On));
    }

    #[test]
    fn test_exhaustion_and_eviction() {
        let (engine, manager) = setup(Config::default());
        let a = manager.create_virtual_display(640, 480, 1).unwrap();
        let _b = manager.create_virtual_display(800, 600, 1).unwrap();
        assert_eq!(
            manager.create_virtual_display(1024, 768, 1),
            Err(Error::NoResources("no free virtual display slot"))
        );
        manager.destroy_virtual_display(a).unwrap();
        let c = manager.create_virtual_display(1024, 768, 1).unwrap();
        assert_eq!(c, a);
        assert_eq!(engine.create_count(DisplayKind::Virtual), 3);
    }

    #[test]
    fn test_refused_during_secure_session() {
        let (engine, manager) = setup(Config::default());
        engine.set_secure_sessions(1, SecureSessions::SECURE_DISPLAY);
        assert!(matches!(
            manager.create_virtual_display(640, 480, 1),
            Err(Error::Unsupported(_))
        ));
        engine.set_secure_sessions(1, SecureSessions::empty());
        assert!(manager.create_virtual_display(640, 480, 1).is_ok());
    }

    #[test]
    fn test_secure_session_tears_down_virtuals() {
        let (engine, manager) = setup(Config::default());
        manager.create_virtual_display(640, 480, 1).unwrap();
        assert!(manager.virtual_display_active());
        engine.set_secure_sessions(1, SecureSessions::SECURE_DISPLAY);
        manager.commit_or_prepare(0, false).unwrap();
        assert!(!manager.virtual_display_active());
        assert_eq!(engine.live_displays(), 1);
    }

    #[test]
    fn test_destroy_unknown_virtual() {
        let (_engine, manager) = setup(Config::default());
        let first_virtual = manager.slots().indices(DisplayKind::Virtual).next().unwrap() as u64;
        assert_eq!(
            manager.destroy_virtual_display(first_virtual),
            Err(Error::BadDisplay(first_virtual))
        );
        assert_eq!(manager.destroy_virtual_display(0), Err(Error::BadDisplay(0)));
    }

    #[test]
    fn test_async_creation() {
        let (_engine, manager) = setup(Config::default());
        assert!(matches!(
            manager.create_virtual_display_async(640, 480, 1),
            Err(Error::Unsupported(_))
        ));

        let mut config = Config::default();
        config.session.async_vds_creation = true;
        let (_engine, manager) = setup(config);
        manager.create_virtual_display_async(640, 480, 1).unwrap();
        let id = manager
            .take_virtual_display_result(Duration::from_secs(2))
            .unwrap();
        assert_eq!(manager.slots().kind(id as usize), DisplayKind::Virtual);
    }
}

//! Commit and wait coordination
//!
//! `commit_or_prepare` opens a commit sequence on the display's lock and
//! `present` closes it. Whoever needs to know that a frame has landed
//! registers a waiter bit, asks the client for a refresh, and waits on
//! the slot's condition variable for the completion counter to move.
//! Every wait here is bounded.

use log::{debug, error, info, warn};
use std::time::{Duration, Instant};

use super::lock::CommitClient;
use super::manager::SessionManager;
use crate::constants::DEFAULT_VSYNC_PERIOD_NS;
use crate::engine::{CommitOutcome, EngineError, Fence, PowerMode};
use crate::error::{Error, Result};

impl SessionManager {
    /// Validate (or validate and commit) the next frame on `display`.
    ///
    /// When the engine asks for a separate present, the commit sequence
    /// stays open until `present` is called.
    pub fn commit_or_prepare(&self, display: u64, validate_only: bool) -> Result<CommitOutcome> {
        self.handle_secure_session();
        let idx = self.slot_index(display)?;
        let client_id = self.slots.client_id(idx);

        let result = {
            let mut state = self.slots.lock(idx);
            if state.display.is_none() {
                return Err(Error::BadDisplay(client_id));
            }
            state.enter_sequence();
            let result = match state.display.as_mut() {
                Some(d) if d.pending_power_mode.is_some() => Ok((None, false)),
                Some(d) => d.commit(self.engine.as_ref(), validate_only),
                None => Err(Error::BadDisplay(client_id)),
            };
            match &result {
                Ok((_, true)) => {}
                Ok((fence, false)) => {
                    state.exit_sequence();
                    state.deliver(&Ok(fence.clone()));
                }
                Err(e) => {
                    debug!("Display {}: commit failed: {}", client_id, e);
                    state.cancel_sequence();
                    state.deliver(&Err(e.clone()));
                }
            }
            result
        };
        self.slots.notify(idx);

        match result {
            Ok((retire_fence, needs_commit)) => {
                if !needs_commit {
                    self.post_commit_unlocked(idx, retire_fence.as_ref());
                }
                Ok(CommitOutcome {
                    retire_fence,
                    needs_commit,
                })
            }
            Err(e) => {
                self.post_commit_unlocked(idx, None);
                Err(e)
            }
        }
    }

    /// Present the validated frame on `display` and close its sequence
    pub fn present(&self, display: u64) -> Result<Option<Fence>> {
        self.handle_secure_session();
        let idx = self.slot_index(display)?;
        let client_id = self.slots.client_id(idx);

        let result = {
            let mut state = self.slots.lock(idx);
            if state.display.is_none() {
                state.cancel_sequence();
                drop(state);
                self.slots.notify(idx);
                warn!("Removed display {} during present", client_id);
                return Err(Error::BadDisplay(client_id));
            }
            let result = match state.display.as_mut() {
                Some(d) if d.pending_power_mode.is_some() => Ok(None),
                Some(d) => d.present(self.engine.as_ref()),
                None => Err(Error::BadDisplay(client_id)),
            };
            match &result {
                Ok(_) => state.exit_sequence(),
                Err(_) => state.cancel_sequence(),
            }
            state.deliver(&result);
            result
        };
        self.slots.notify(idx);

        let fence = result.as_ref().ok().and_then(|f| f.clone());
        self.post_commit_unlocked(idx, fence.as_ref());
        result
    }

    /// Deferred work that runs after a commit, with no slot lock held
    pub(super) fn post_commit_unlocked(&self, idx: usize, retire_fence: Option<&Fence>) {
        self.handle_pending_power_mode(idx, retire_fence);
        self.handle_pending_hotplug(idx, retire_fence);
        self.handle_pending_refresh();
        self.hotplug.signal_resources(idx, retire_fence.cloned());
    }

    /// Refresh `display` and block until its next commit lands.
    ///
    /// The completion wait is bounded by `draw_cycles` vsync periods plus
    /// `commit_done_margin_ms`. A retire fence from the landed commit is then
    /// waited on for the same bound plus one more margin, so the worst case
    /// is `2 * draw_cycles * vsync + 3 * commit_done_margin_ms`. On timeout
    /// the stored commit outcome is left in place for the next waiter.
    pub fn request_commit(&self, display: u64, client: CommitClient) -> Result<()> {
        let idx = self.slot_index(display)?;
        let client_id = self.slots.client_id(idx);

        let (generation, timeout) = {
            let mut state = self.slots.lock_settled(idx);
            let handle = state
                .display
                .as_ref()
                .map(|d| d.handle)
                .ok_or(Error::BadDisplay(client_id))?;
            let vsync = self
                .engine
                .vsync_period_ns(handle)
                .unwrap_or(DEFAULT_VSYNC_PERIOD_NS);
            state.waiters.insert(client.bit());
            (state.completions, self.timeouts.commit_wait(vsync))
        };
        debug!(
            "Display {}: {:?} waiting for commit (timeout {:?})",
            client_id, client, timeout
        );
        self.refresh_slot(idx);

        let retire_fence = {
            let deadline = Instant::now() + timeout;
            let lock = &self.slots.slot(idx).lock;
            let mut state = self.slots.lock(idx);
            while state.completions == generation {
                let now = Instant::now();
                if now >= deadline {
                    let powered_off = state
                        .display
                        .as_ref()
                        .map(|d| d.power_mode == PowerMode::Off)
                        .unwrap_or(true);
                    if powered_off {
                        warn!("Display {} is powered off, bail", client_id);
                    }
                    warn!(
                        "Display {}: commit wait for {:?} timed out after {:?}",
                        client_id, client, timeout
                    );
                    return Err(Error::Timeout(timeout));
                }
                state = lock.wait_timeout(state, deadline - now);
            }
            if let Some(e) = state.commit_error.clone() {
                error!(
                    "Display {}: commit failed for {:?}: {}",
                    client_id, client, e
                );
                return Err(e);
            }
            state.retire_fence.clone()
        };

        let Some(fence) = retire_fence else {
            return Ok(());
        };
        let fence_timeout = timeout + Duration::from_millis(self.timeouts.commit_done_margin_ms);
        match self.engine.wait_fence(&fence, fence_timeout) {
            Ok(()) => Ok(()),
            Err(EngineError::Timeout) => {
                error!(
                    "Display {}: retire fence wait timed out for {:?}",
                    client_id, client
                );
                Err(Error::Timeout(fence_timeout))
            }
            Err(e) => {
                error!(
                    "Display {}: retire fence wait failed for {:?}: {}",
                    client_id, client, e
                );
                Err(e.into_session(client_id))
            }
        }
    }

    /// `request_commit` on a worker, bounded by `async_commit_wait_ms`.
    ///
    /// A previous waiter for the same display that never resolved makes
    /// this fail fast with Timeout.
    pub fn request_commit_async(&self, display: u64, client: CommitClient) -> Result<()> {
        let idx = self.slot_index(display)?;
        let bound = Duration::from_millis(self.timeouts.async_commit_wait_ms);
        let manager = self.arc()?;

        let waiter = {
            let mut task = self.commit_tasks[idx]
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if task.is_busy() {
                warn!("Display {}: previous commit waiter is stuck", display);
                return Err(Error::Timeout(bound));
            }
            task.start("dsm-commit-wait", move || {
                manager.request_commit(display, client)
            })?
        };
        waiter
            .wait_timeout(bound)
            .unwrap_or(Err(Error::Timeout(bound)))
    }

    /// Start listening for a vm release on slot `idx`
    pub(super) fn arm_vm_release(&self, idx: usize) -> u64 {
        self.slots.slot(idx).vm.arm()
    }

    /// Wait for a vm release newer than `generation`.
    ///
    /// Each attempt waits `timeout` plus the configured margin, and the
    /// display must still be powered before every attempt.
    pub(super) fn wait_for_vm_release(
        &self,
        idx: usize,
        generation: u64,
        timeout: Duration,
    ) -> Result<()> {
        let client_id = self.slots.client_id(idx);
        let vm = &self.slots.slot(idx).vm;
        let attempt_timeout = timeout + Duration::from_millis(self.timeouts.vm_release_margin_ms);
        let attempts = self.timeouts.vm_release_retries + 1;

        for attempt in 1..=attempts {
            let powered = self
                .slots
                .lock(idx)
                .display
                .as_ref()
                .map(|d| d.power_mode != PowerMode::Off)
                .unwrap_or(false);
            if !powered {
                vm.disarm();
                warn!("Display {} powered off while waiting for vm release", client_id);
                return Err(Error::BadDisplay(client_id));
            }
            if vm.wait(generation, attempt_timeout) {
                vm.disarm();
                info!("Display {}: vm release observed", client_id);
                return Ok(());
            }
            debug!(
                "Display {}: vm release attempt {}/{} timed out",
                client_id, attempt, attempts
            );
        }
        vm.disarm();
        error!(
            "Display {}: vm release timed out after {} attempts",
            client_id, attempts
        );
        Err(Error::Timeout(attempt_timeout))
    }

    /// Arm and wait for a vm release on `display`
    pub fn request_vm_release(&self, display: u64, timeout: Duration) -> Result<()> {
        let idx = self.slot_index(display)?;
        let generation = self.arm_vm_release(idx);
        self.wait_for_vm_release(idx, generation, timeout)
    }

    /// Engine signal that the trusted environment released the device
    pub fn vm_release_done(&self, display: u64) -> Result<()> {
        let idx = self.slot_index(display)?;
        if !self.slots.slot(idx).vm.release() {
            debug!("vm release on display {} with nobody waiting", display);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{DisplayKind, HwDisplayInfo, SoftEngine};
    use crate::session::callbacks::ClientCallbacks;
    use std::sync::{Arc, Weak};
    use std::thread;

    /// Client that presents a frame whenever it is asked to refresh
    struct Presenter {
        manager: std::sync::Mutex<Weak<SessionManager>>,
    }

    impl ClientCallbacks for Presenter {
        fn on_hotplug(&self, _display: u64, _connected: bool) {}

        fn on_refresh(&self, display: u64) {
            let manager = self.manager.lock().unwrap().upgrade();
            if let Some(manager) = manager {
                thread::spawn(move || {
                    let _ = manager.commit_or_prepare(display, false);
                });
            }
        }
    }

    fn setup(config: Config) -> (Arc<SoftEngine>, Arc<SessionManager>) {
        let engine = Arc::new(SoftEngine::new(vec![HwDisplayInfo {
            hw_id: 1,
            kind: DisplayKind::BuiltIn,
            is_primary: true,
            connected: true,
        }]));
        let manager = SessionManager::new(&config, engine.clone());
        manager.init().unwrap();
        (engine, manager)
    }

    fn with_presenter(manager: &Arc<SessionManager>) {
        let presenter = Arc::new(Presenter {
            manager: std::sync::Mutex::new(Arc::downgrade(manager)),
        });
        manager.register_callback(presenter).unwrap();
    }

    #[test]
    fn test_validate_then_present_closes_sequence() {
        let (_engine, manager) = setup(Config::default());
        let outcome = manager.commit_or_prepare(0, true).unwrap();
        assert!(outcome.needs_commit);
        assert!(manager.slots().slot(0).lock.lock().in_commit());

        let fence = manager.present(0).unwrap();
        assert!(fence.is_some());
        assert!(!manager.slots().slot(0).lock.lock().in_commit());
    }

    #[test]
    fn test_request_commit_lands() {
        let (_engine, manager) = setup(Config::default());
        with_presenter(&manager);
        manager
            .request_commit(0, CommitClient::TrustedUi)
            .unwrap();
    }

    #[test]
    fn test_request_commit_reports_commit_error() {
        let (engine, manager) = setup(Config::default());
        with_presenter(&manager);
        engine.set_commit_failing(1, true);
        assert!(matches!(
            manager.request_commit(0, CommitClient::PartialUpdate),
            Err(Error::BadParameter(_))
        ));
    }

    #[test]
    fn test_request_commit_times_out_without_client() {
        let mut config = Config::default();
        config.timeouts.draw_cycles = 1;
        config.timeouts.commit_done_margin_ms = 10;
        let (_engine, manager) = setup(config);
        let start = Instant::now();
        assert!(matches!(
            manager.request_commit(0, CommitClient::TrustedUi),
            Err(Error::Timeout(_))
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
        // The registration survives for whoever commits next
        assert!(!manager.slots().slot(0).lock.lock().waiters.is_empty());
    }

    #[test]
    fn test_unbound_display_is_bad_display() {
        let (_engine, manager) = setup(Config::default());
        assert!(matches!(manager.present(1), Err(Error::BadDisplay(1))));
        assert_eq!(
            manager.request_commit(99, CommitClient::TrustedUi),
            Err(Error::BadDisplay(99))
        );
    }

    #[test]
    fn test_vm_release_wakes_waiter() {
        let (_engine, manager) = setup(Config::default());
        let remote = Arc::clone(&manager);
        let waiter = thread::spawn(move || remote.request_vm_release(0, Duration::from_secs(2)));
        while !manager.slots().slot(0).vm.is_waiting() {
            thread::sleep(Duration::from_millis(1));
        }
        manager.vm_release_done(0).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_vm_release_fails_fast_when_off() {
        let mut config = Config::default();
        config.timeouts.vm_release_margin_ms = 0;
        let (_engine, manager) = setup(config);
        manager.set_power_mode(0, PowerMode::Off).unwrap();
        assert_eq!(
            manager.request_vm_release(0, Duration::from_secs(5)),
            Err(Error::BadDisplay(0))
        );
    }
}

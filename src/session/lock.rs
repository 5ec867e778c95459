//! Per-display lock and commit sequencing
//!
//! Every slot owns one `DisplayLock`. The mutex guards the slot's whole
//! state (bound display object, commit sequence, waiter registrations),
//! and a single condition variable wakes anyone waiting for a sequence to
//! settle or for a commit to be delivered.
//!
//! The commit sequence is an explicit state machine: a present/validate
//! cycle moves the slot to `InCommit`, and it leaves through `exit`
//! (completed) or `cancel` (aborted). Other threads use `lock_settled` to
//! avoid slicing into the middle of a cycle.

use bitflags::bitflags;
use log::{trace, warn};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::display::DisplayObject;
use crate::engine::Fence;
use crate::error::{Error, Result};

/// Commit sequence state of one display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitState {
    #[default]
    Idle,
    InCommit,
    /// The last sequence was aborted before completing
    Cancelled,
}

/// Independent callers that may wait for a display's next commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitClient {
    PartialUpdate,
    TeardownWriteback,
    TrustedUi,
}

bitflags! {
    /// Waiter registrations, one bit per `CommitClient`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommitWaiters: u8 {
        const PARTIAL_UPDATE = 0b0001;
        const TEARDOWN_WRITEBACK = 0b0010;
        const TRUSTED_UI = 0b0100;
    }
}

impl CommitClient {
    pub fn bit(self) -> CommitWaiters {
        match self {
            CommitClient::PartialUpdate => CommitWaiters::PARTIAL_UPDATE,
            CommitClient::TeardownWriteback => CommitWaiters::TEARDOWN_WRITEBACK,
            CommitClient::TrustedUi => CommitWaiters::TRUSTED_UI,
        }
    }
}

/// State guarded by a slot's lock
#[derive(Debug, Default)]
pub struct SlotState {
    pub display: Option<DisplayObject>,
    pub commit: CommitState,
    pub waiters: CommitWaiters,
    /// Error of the most recent delivered commit; kept until a waiter reads it
    pub commit_error: Option<Error>,
    pub retire_fence: Option<Fence>,
    /// Number of commit outcomes delivered to waiters
    pub completions: u64,
}

impl SlotState {
    /// Bind a display object; hands it back if the slot is occupied
    pub fn bind(&mut self, display: DisplayObject) -> std::result::Result<(), DisplayObject> {
        if self.display.is_some() {
            return Err(display);
        }
        self.display = Some(display);
        self.commit = CommitState::Idle;
        Ok(())
    }

    /// Unbind the display object, failing any registered commit waiters
    pub fn unbind(&mut self, client_id: u64) -> Option<DisplayObject> {
        let display = self.display.take()?;
        if self.commit == CommitState::InCommit {
            self.commit = CommitState::Cancelled;
        }
        self.deliver(&Err(Error::BadDisplay(client_id)));
        Some(display)
    }

    pub fn enter_sequence(&mut self) {
        self.commit = CommitState::InCommit;
    }

    pub fn exit_sequence(&mut self) {
        self.commit = CommitState::Idle;
    }

    pub fn cancel_sequence(&mut self) {
        self.commit = CommitState::Cancelled;
    }

    pub fn in_commit(&self) -> bool {
        self.commit == CommitState::InCommit
    }

    /// Hand a commit outcome to registered waiters.
    ///
    /// Returns false when nobody was waiting, in which case nothing is
    /// recorded.
    pub fn deliver(&mut self, outcome: &Result<Option<Fence>>) -> bool {
        if self.waiters.is_empty() {
            return false;
        }
        match outcome {
            Ok(fence) => {
                self.retire_fence = fence.clone();
                self.commit_error = None;
            }
            Err(e) => {
                self.retire_fence = None;
                self.commit_error = Some(e.clone());
            }
        }
        self.waiters = CommitWaiters::empty();
        self.completions += 1;
        true
    }
}

pub type SlotGuard<'a> = MutexGuard<'a, SlotState>;

/// Sequence-aware lock for one display slot
#[derive(Debug)]
pub struct DisplayLock {
    state: Mutex<SlotState>,
    cond: Condvar,
    settle_timeout: Duration,
}

impl DisplayLock {
    pub fn new(settle_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            cond: Condvar::new(),
            settle_timeout,
        }
    }

    /// Plain scoped acquisition
    pub fn lock(&self) -> SlotGuard<'_> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire once no commit sequence is in flight.
    ///
    /// The wait is bounded; on expiry the guard is returned anyway so the
    /// caller can proceed against whatever state is current.
    pub fn lock_settled(&self) -> SlotGuard<'_> {
        let deadline = Instant::now() + self.settle_timeout;
        let mut guard = self.lock();
        while guard.in_commit() {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Commit sequence did not settle within {:?}",
                    self.settle_timeout
                );
                break;
            }
            guard = self
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        guard
    }

    /// Release the guard and wait for a notification or `timeout`
    pub fn wait_timeout<'a>(&self, guard: SlotGuard<'a>, timeout: Duration) -> SlotGuard<'a> {
        self.cond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .0
    }

    /// Wake everyone waiting on this slot
    pub fn notify(&self) {
        trace!("display lock notify");
        self.cond.notify_all();
    }
}

#[derive(Debug, Default)]
struct VmState {
    waiting: bool,
    released: u64,
}

/// Release signal for a VM-mediated device hand-off
#[derive(Debug, Default)]
pub struct VmRelease {
    state: Mutex<VmState>,
    cond: Condvar,
}

impl VmRelease {
    fn state(&self) -> MutexGuard<'_, VmState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a waiter; returns the generation to wait past
    pub fn arm(&self) -> u64 {
        let mut state = self.state();
        state.waiting = true;
        state.released
    }

    pub fn disarm(&self) {
        self.state().waiting = false;
    }

    pub fn is_waiting(&self) -> bool {
        self.state().waiting
    }

    /// Signal a release; ignored when nobody is armed
    pub fn release(&self) -> bool {
        let mut state = self.state();
        if !state.waiting {
            return false;
        }
        state.released += 1;
        self.cond.notify_all();
        true
    }

    /// Wait until a release newer than `generation` arrives
    pub fn wait(&self, generation: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        while state.released == generation {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DisplayHandle, DisplayKind};
    use std::sync::Arc;
    use std::thread;

    fn object(client_id: u64) -> DisplayObject {
        DisplayObject::new(client_id, DisplayKind::Pluggable, 5, DisplayHandle(1))
    }

    #[test]
    fn test_bind_conflict_returns_object() {
        let lock = DisplayLock::new(Duration::from_millis(10));
        let mut state = lock.lock();
        assert!(state.bind(object(1)).is_ok());
        let rejected = state.bind(object(1)).unwrap_err();
        assert_eq!(rejected.hw_id, 5);
    }

    #[test]
    fn test_unbind_fails_waiters() {
        let lock = DisplayLock::new(Duration::from_millis(10));
        let mut state = lock.lock();
        state.bind(object(2)).unwrap();
        state.waiters.insert(CommitClient::TrustedUi.bit());
        assert!(state.unbind(2).is_some());
        assert_eq!(state.completions, 1);
        assert_eq!(state.commit_error, Some(Error::BadDisplay(2)));
        assert!(state.waiters.is_empty());
    }

    #[test]
    fn test_deliver_without_waiters_is_noop() {
        let mut state = SlotState::default();
        assert!(!state.deliver(&Ok(None)));
        assert_eq!(state.completions, 0);
    }

    #[test]
    fn test_lock_settled_waits_for_exit() {
        let lock = Arc::new(DisplayLock::new(Duration::from_secs(2)));
        lock.lock().enter_sequence();
        let remote = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.lock().exit_sequence();
            remote.notify();
        });
        let state = lock.lock_settled();
        assert_eq!(state.commit, CommitState::Idle);
        drop(state);
        handle.join().unwrap();
    }

    #[test]
    fn test_lock_settled_is_bounded() {
        let lock = DisplayLock::new(Duration::from_millis(20));
        lock.lock().enter_sequence();
        let start = Instant::now();
        let state = lock.lock_settled();
        assert!(state.in_commit());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_vm_release_requires_arm() {
        let vm = VmRelease::default();
        assert!(!vm.release());
        let generation = vm.arm();
        assert!(vm.release());
        assert!(vm.wait(generation, Duration::ZERO));
        assert!(!vm.wait(generation + 1, Duration::from_millis(5)));
    }
}

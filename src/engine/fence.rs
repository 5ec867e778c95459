//! Completion fences
//!
//! A retire fence is signaled by the engine once a submitted frame has
//! landed. Clones share state, so the session manager can hand the same
//! fence to every waiter.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Pending,
    Signaled,
    Failed,
}

/// Outcome of waiting on a fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    Failed,
    TimedOut,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<FenceState>,
    cond: Condvar,
}

/// Shareable completion fence
#[derive(Debug, Clone)]
pub struct Fence {
    inner: Arc<Inner>,
}

impl Fence {
    /// Create an unsignaled fence
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(FenceState::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    /// Create a fence that is already signaled
    pub fn signaled() -> Self {
        let fence = Self::new();
        fence.signal();
        fence
    }

    pub fn signal(&self) {
        self.finish(FenceState::Signaled);
    }

    /// Mark the fence as errored; waiters wake with `FenceWait::Failed`
    pub fn fail(&self) {
        self.finish(FenceState::Failed);
    }

    fn finish(&self, to: FenceState) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == FenceState::Pending {
            *state = to;
            self.inner.cond.notify_all();
        }
    }

    pub fn is_signaled(&self) -> bool {
        let state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state == FenceState::Signaled
    }

    /// Block until the fence resolves or `timeout` expires
    pub fn wait(&self, timeout: Duration) -> FenceWait {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            match *state {
                FenceState::Signaled => return FenceWait::Signaled,
                FenceState::Failed => return FenceWait::Failed,
                FenceState::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return FenceWait::TimedOut;
            }
            state = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signaled_fence_returns_immediately() {
        let fence = Fence::signaled();
        assert_eq!(fence.wait(Duration::ZERO), FenceWait::Signaled);
    }

    #[test]
    fn test_pending_fence_times_out() {
        let fence = Fence::new();
        assert_eq!(fence.wait(Duration::from_millis(10)), FenceWait::TimedOut);
    }

    #[test]
    fn test_signal_from_other_thread() {
        let fence = Fence::new();
        let remote = fence.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.signal();
        });
        assert_eq!(fence.wait(Duration::from_secs(2)), FenceWait::Signaled);
        handle.join().unwrap();
    }

    #[test]
    fn test_first_resolution_wins() {
        let fence = Fence::new();
        fence.fail();
        fence.signal();
        assert_eq!(fence.wait(Duration::ZERO), FenceWait::Failed);
        assert!(!fence.is_signaled());
    }
}

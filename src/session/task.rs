//! Worker tasks
//!
//! Asynchronous phases (TUI start/end, deferred hotplug, async commit
//! waits) run on named threads whose result can be waited on with a
//! bound. A `TaskSlot` holds at most one task; it is busy while that task
//! is unresolved.

use log::warn;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug)]
struct Completion<T> {
    value: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T: Clone> Completion<T> {
    fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut value = self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(v) = value.as_ref() {
                return Some(v.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            value = self
                .cond
                .wait_timeout(value, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    fn is_set(&self) -> bool {
        self.value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }
}

/// Handle for waiting on a task's result from another thread
#[derive(Debug)]
pub struct TaskWaiter<T> {
    done: Arc<Completion<T>>,
}

impl<T: Clone> TaskWaiter<T> {
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        self.done.wait_timeout(timeout)
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_set()
    }
}

/// A spawned worker with a retrievable result
#[derive(Debug)]
pub struct Task<T> {
    done: Arc<Completion<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Clone + Send + 'static> Task<T> {
    pub fn spawn<F>(name: &str, f: F) -> Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let done = Arc::new(Completion {
            value: Mutex::new(None),
            cond: Condvar::new(),
        });
        let remote = Arc::clone(&done);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let result = f();
                let mut value = remote
                    .value
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *value = Some(result);
                remote.cond.notify_all();
            })
            .map_err(|e| {
                warn!("Failed to spawn {} thread: {}", name, e);
                Error::NoResources("worker thread")
            })?;
        Ok(Self {
            done,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_set()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        self.done.wait_timeout(timeout)
    }

    pub fn waiter(&self) -> TaskWaiter<T> {
        TaskWaiter {
            done: Arc::clone(&self.done),
        }
    }

    /// Wait for the result and reap the thread if it finished in time
    pub fn join_timeout(mut self, timeout: Duration) -> Option<T> {
        let result = self.done.wait_timeout(timeout);
        if result.is_some() {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
        result
    }
}

/// Holds at most one task; a new task is refused while the last one runs
#[derive(Debug)]
pub struct TaskSlot<T> {
    current: Option<Task<T>>,
}

impl<T: Clone + Send + 'static> TaskSlot<T> {
    pub fn new() -> Self {
        Self { current: None }
    }

    pub fn is_busy(&self) -> bool {
        self.current
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Wait up to `timeout` for the current task to resolve
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        match self.current.as_ref() {
            Some(task) => task.wait_timeout(timeout).is_some(),
            None => true,
        }
    }

    /// Start `f` unless a previous task is still running
    pub fn start<F>(&mut self, name: &str, f: F) -> Result<TaskWaiter<T>>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_busy() {
            return Err(Error::Busy("previous task unresolved"));
        }
        if let Some(old) = self.current.take() {
            old.join_timeout(Duration::ZERO);
        }
        let task = Task::spawn(name, f)?;
        let waiter = task.waiter();
        self.current = Some(task);
        Ok(waiter)
    }

    pub fn take(&mut self) -> Option<Task<T>> {
        self.current.take()
    }
}

impl<T: Clone + Send + 'static> Default for TaskSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

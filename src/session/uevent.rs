//! Hotplug uevent intake
//!
//! The event reader thread turns raw uevent properties into a
//! `UeventSignal` and bumps a bounded counter; the consumer thread drains
//! it and runs reconciliation. Bursts beyond the cap coalesce, which is
//! safe because every reconciliation reads the latest hardware state.

use log::{debug, trace};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::constants::UEVENT_MAX_COUNT;
use crate::engine::TestPattern;

/// Connection-relevant content of one uevent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UeventSignal {
    pub hotplug: bool,
    /// Connector status hint, when the event carried one
    pub connected: Option<bool>,
    pub test_pattern: Option<TestPattern>,
}

/// Parse uevent key/value properties.
///
/// Returns None for events that are not display hotplugs.
pub fn parse_uevent<'a, I>(properties: I) -> Option<UeventSignal>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut signal = UeventSignal::default();
    let mut bpp: Option<u32> = None;
    let mut pattern: Option<u32> = None;

    for (key, value) in properties {
        match key {
            "HOTPLUG" | "MST_HOTPLUG" => signal.hotplug |= value.trim() == "1",
            "status" | "STATUS" => {
                signal.connected = match value.trim() {
                    "connected" => Some(true),
                    "disconnected" => Some(false),
                    _ => signal.connected,
                }
            }
            "bpp" => bpp = value.trim().parse().ok(),
            "pattern" => pattern = value.trim().parse().ok(),
            _ => {}
        }
    }

    if !signal.hotplug {
        return None;
    }
    if let (Some(bpp), Some(pattern)) = (bpp, pattern) {
        if bpp > 0 && pattern > 0 {
            signal.test_pattern = Some(TestPattern { bpp, pattern });
        }
    }
    trace!("Parsed uevent: {:?}", signal);
    Some(signal)
}

/// Result of one consumer wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeventWait {
    Event,
    Idle,
    Terminate,
}

#[derive(Debug, Default)]
struct QueueState {
    count: u32,
    terminate: bool,
}

/// Bounded event counter between the reader and the consumer
#[derive(Debug, Default)]
pub struct UeventQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl UeventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one event; returns false if it coalesced into a full counter
    pub fn push(&self) -> bool {
        let mut state = self.state();
        let accepted = state.count < UEVENT_MAX_COUNT;
        if accepted {
            state.count += 1;
        } else {
            debug!("uevent counter full, coalescing");
        }
        self.cond.notify_one();
        accepted
    }

    pub fn pending(&self) -> u32 {
        self.state().count
    }

    /// Wait up to `timeout` for the next event
    pub fn wait_next(&self, timeout: Duration) -> UeventWait {
        let mut state = self.state();
        if state.count == 0 && !state.terminate {
            state = self
                .cond
                .wait_timeout(state, timeout)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        if state.terminate {
            return UeventWait::Terminate;
        }
        if state.count > 0 {
            state.count -= 1;
            return UeventWait::Event;
        }
        UeventWait::Idle
    }

    pub fn terminate(&self) {
        self.state().terminate = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        let mut state = self.state();
        state.count = 0;
        state.terminate = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hotplug_with_status() {
        let signal = parse_uevent([
            ("ACTION", "change"),
            ("HOTPLUG", "1"),
            ("status", "connected"),
        ])
        .unwrap();
        assert!(signal.hotplug);
        assert_eq!(signal.connected, Some(true));
        assert!(signal.test_pattern.is_none());
    }

    #[test]
    fn test_parse_ignores_non_hotplug() {
        assert!(parse_uevent([("ACTION", "change"), ("HOTPLUG", "0")]).is_none());
        assert!(parse_uevent([("DEVNAME", "dri/card0")]).is_none());
    }

    #[test]
    fn test_parse_mst_and_test_pattern() {
        let signal =
            parse_uevent([("MST_HOTPLUG", "1"), ("bpp", "24"), ("pattern", "3")]).unwrap();
        assert_eq!(
            signal.test_pattern,
            Some(TestPattern {
                bpp: 24,
                pattern: 3
            })
        );
        let no_pattern = parse_uevent([("HOTPLUG", "1"), ("bpp", "x"), ("pattern", "3")]).unwrap();
        assert!(no_pattern.test_pattern.is_none());
    }

    #[test]
    fn test_queue_caps_and_drains() {
        let queue = UeventQueue::new();
        for _ in 0..5 {
            queue.push();
        }
        assert_eq!(queue.pending(), UEVENT_MAX_COUNT);
        for _ in 0..UEVENT_MAX_COUNT {
            assert_eq!(queue.wait_next(Duration::ZERO), UeventWait::Event);
        }
        assert_eq!(queue.wait_next(Duration::from_millis(5)), UeventWait::Idle);
    }

    #[test]
    fn test_terminate_wins() {
        let queue = UeventQueue::new();
        queue.push();
        queue.terminate();
        assert_eq!(queue.wait_next(Duration::ZERO), UeventWait::Terminate);
    }
}

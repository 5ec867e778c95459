//! Global constants for dsm
//!
//! Consolidates timing and sizing constants used by the session manager
//! so waits and limits are not scattered as magic numbers.

// ============================================================================
// Commit / Wait Timing
// ============================================================================

/// Number of draw cycles a commit waiter allows before giving up
pub const NUM_DRAW_CYCLES: u64 = 3;

/// Nanoseconds per millisecond (vsync period conversion)
pub const NS_PER_MS: u64 = 1_000_000;

/// Vsync period reported when a display has no attribute yet (60Hz)
pub const DEFAULT_VSYNC_PERIOD_NS: u64 = 1_000_000_000 / 60;

/// Fixed margin added to vsync-derived commit waits (ms)
pub const COMMIT_DONE_MARGIN_MS: u64 = 100;

/// Fixed margin added to each vm-release wait attempt (ms)
pub const VM_RELEASE_MARGIN_MS: u64 = 100;

/// Extra vm-release attempts after the first one
pub const VM_RELEASE_RETRIES: u32 = 3;

/// Upper bound for the asynchronous commit waiter (ms)
pub const ASYNC_COMMIT_WAIT_MS: u64 = 2000;

/// How long a caller waits for an in-flight commit sequence to settle (ms)
pub const SEQUENCE_SETTLE_MS: u64 = 1000;

/// Bound on fence waits performed inside the session manager (ms)
pub const FENCE_WAIT_MS: u64 = 1000;

// ============================================================================
// Hotplug
// ============================================================================

/// Resource-readiness wait after a pluggable display connects (ms)
pub const HOTPLUG_RESOURCE_WAIT_MS: u64 = 5000;

/// Outstanding uevents remembered by the producer; extra events coalesce
pub const UEVENT_MAX_COUNT: u32 = 3;

/// Consumer wake-up interval while idle, so shutdown is noticed (ms)
pub const UEVENT_POLL_INTERVAL_MS: u64 = 500;

/// Sleep between udev monitor drains in the daemon (ms)
pub const UDEV_POLL_INTERVAL_MS: u64 = 100;

/// Primary bring-up attempts when no display is reported connected yet
pub const PRIMARY_BRINGUP_RETRIES: u32 = 10;

/// Delay between primary bring-up attempts (ms)
pub const PRIMARY_BRINGUP_INTERVAL_MS: u64 = 100;

// ============================================================================
// Trusted UI
// ============================================================================

/// Wait for the previous TUI completion notifier before rejecting busy (ms)
pub const TUI_CALLBACK_WAIT_MS: u64 = 1000;

/// How long the completion notifier waits for a TUI event task (ms)
pub const TUI_EVENT_WAIT_MS: u64 = 5000;

// ============================================================================
// Slot Table
// ============================================================================

/// Default number of pluggable slots
pub const DEFAULT_MAX_PLUGGABLE: usize = 2;

/// Default number of built-in slots (primary included when built-in)
pub const DEFAULT_MAX_BUILTIN: usize = 2;

/// Default number of virtual slots
pub const DEFAULT_MAX_VIRTUAL: usize = 2;

/// Upper bound on the slot table size, primary included
pub const MAX_SLOTS: usize = 64;

// ============================================================================
// Dump
// ============================================================================

/// Maximum size of a textual state dump in bytes
pub const MAX_DUMP_BYTES: usize = 16 * 1024;

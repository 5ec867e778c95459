//! Display session management
//!
//! Tracks which displays exist, who may drive them, and when:
//! - Slot table with one lock per display
//! - Hotplug reconciliation for pluggable displays
//! - Secure-session arbitration and parked power modes
//! - Trusted UI hand-off of the built-in pipeline
//! - Commit completion waits
//!
//! # Lock order
//!
//! ```text
//! reconcile gate / virtual gate
//!   -> slot locks, ascending index
//!     -> short process-wide mutexes (hotplug ctl, resources, virtual cache, tui, tasks)
//! ```
//!
//! The commit path never blocks on the reconcile gate; it only tries it.
//! Client callbacks are never invoked while a slot lock is held.

mod callbacks;
mod commit;
mod control;
mod display;
mod hotplug;
mod lock;
mod manager;
mod ops;
mod secure;
mod slot;
mod task;
mod tui;
mod uevent;
mod virtual_display;

pub use callbacks::ClientCallbacks;
pub use control::ControlCommand;
pub use display::{DisplayObject, VirtualGeometry};
pub use hotplug::{FirstCommitGate, HotplugGate, HotplugState, OpenGate, PluggableStatus};
pub use lock::{CommitClient, CommitState, CommitWaiters};
pub use manager::SessionManager;
pub use ops::{VsyncPeriodChangeConstraints, VsyncPeriodChangeTimeline};
pub use slot::{DisplayType, LockObserver, SlotLayout, SlotSnapshot, SlotTable};
pub use task::{Task, TaskSlot, TaskWaiter};
pub use tui::{TuiEvent, TuiPhase};
pub use uevent::{parse_uevent, UeventSignal};

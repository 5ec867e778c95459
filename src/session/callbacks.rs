//! Client callback channel
//!
//! The compositor client registers one `ClientCallbacks` implementation.
//! The session manager never invokes it while holding a slot lock.

use super::tui::TuiEvent;
use crate::error::Result;

pub trait ClientCallbacks: Send + Sync {
    /// A display was connected or disconnected
    fn on_hotplug(&self, display: u64, connected: bool);

    /// The session needs a new frame on `display`
    fn on_refresh(&self, display: u64);

    /// An asynchronous trusted-UI event finished
    fn on_tui_event_done(&self, _display: u64, _event: TuiEvent, _result: &Result<()>) {}
}

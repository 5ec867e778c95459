//! Display Engine boundary
//!
//! The engine programs hardware pipelines and produces frames. The session
//! manager only drives it through `DisplayEngine`; everything behind that
//! trait (composition, buffers, color) is opaque here.

pub mod fence;
pub mod soft;

pub use fence::{Fence, FenceWait};
pub use soft::{EngineCall, SoftEngine};

use bitflags::bitflags;
use std::fmt;
use std::time::Duration;

use crate::error::Error;

/// Engine-side failure, translated to `Error` at the session boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Resources are not ready yet; retry on a later commit
    #[error("resources not ready, try again")]
    Again,
    /// The underlying device went away
    #[error("device removed")]
    NoDevice,
    #[error("permission denied")]
    Permission,
    #[error("not supported")]
    NotSupported,
    #[error("no resources")]
    NoResources,
    #[error("fence timeout")]
    Timeout,
    #[error("invalid argument: {0}")]
    Invalid(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Translate into a session error for display `client_id`
    pub fn into_session(self, client_id: u64) -> Error {
        match self {
            EngineError::NoDevice => Error::BadDisplay(client_id),
            EngineError::Permission => Error::PermissionDenied,
            EngineError::NotSupported => Error::Unsupported("engine"),
            EngineError::NoResources | EngineError::Again => Error::NoResources("engine"),
            EngineError::Timeout => Error::Timeout(Duration::ZERO),
            EngineError::Invalid(_) => Error::BadParameter("engine rejected argument"),
        }
    }
}

/// Class of display surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayKind {
    Primary,
    BuiltIn,
    Pluggable,
    Virtual,
}

impl fmt::Display for DisplayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisplayKind::Primary => "primary",
            DisplayKind::BuiltIn => "builtin",
            DisplayKind::Pluggable => "pluggable",
            DisplayKind::Virtual => "virtual",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerMode {
    #[default]
    Off,
    Doze,
    DozeSuspend,
    On,
}

impl PowerMode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(PowerMode::Off),
            1 => Some(PowerMode::Doze),
            2 => Some(PowerMode::On),
            3 => Some(PowerMode::DozeSuspend),
            _ => None,
        }
    }

    pub fn is_doze(self) -> bool {
        matches!(self, PowerMode::Doze | PowerMode::DozeSuspend)
    }
}

bitflags! {
    /// Active content-protection sessions on a display
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SecureSessions: u32 {
        const SECURE_DISPLAY = 0b01;
        const SECURE_CAMERA = 0b10;
    }
}

/// Trusted-UI events forwarded to each display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureEvent {
    TuiPrepare,
    TuiStart,
    TuiEnd,
    TuiUnprepare,
}

/// Adaptive-sync mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QsyncMode {
    #[default]
    None,
    Continuous,
    OneShot,
}

impl QsyncMode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(QsyncMode::None),
            1 => Some(QsyncMode::Continuous),
            2 => Some(QsyncMode::OneShot),
            _ => None,
        }
    }
}

/// Opaque engine-side display handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayHandle(pub u64);

/// One hardware display as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwDisplayInfo {
    pub hw_id: i32,
    /// BuiltIn or Pluggable; the session decides which one is primary
    pub kind: DisplayKind,
    pub is_primary: bool,
    pub connected: bool,
}

/// Arguments for display creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateParams {
    pub kind: DisplayKind,
    pub hw_id: i32,
    pub is_primary: bool,
    /// Virtual displays only
    pub width: u32,
    pub height: u32,
    pub format: u32,
}

/// Result of a commit or validate pass
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    pub retire_fence: Option<Fence>,
    /// Validation succeeded but the frame still has to be presented
    pub needs_commit: bool,
}

/// Resource readiness reported after a pluggable display connects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceState {
    pub pending: bool,
    /// The built-in display should drop to an alternate config to free bandwidth
    pub needs_builtin_reconfig: bool,
}

/// Test pattern requested through a hotplug uevent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestPattern {
    pub bpp: u32,
    pub pattern: u32,
}

/// Hardware display engine consumed by the session manager
///
/// Implementations must be callable from any thread. The session manager
/// never calls into the engine for the same handle concurrently.
pub trait DisplayEngine: Send + Sync {
    fn displays_status(&self) -> EngineResult<Vec<HwDisplayInfo>>;

    /// Hardware limit on concurrently driven displays of `kind`
    fn max_displays(&self, kind: DisplayKind) -> usize;

    fn request_virtual_hw_id(&self) -> EngineResult<i32>;

    fn create_display(&self, params: &CreateParams) -> EngineResult<DisplayHandle>;

    fn destroy_display(&self, handle: DisplayHandle);

    fn commit(&self, handle: DisplayHandle, validate_only: bool) -> EngineResult<CommitOutcome>;

    fn set_power_mode(&self, handle: DisplayHandle, mode: PowerMode, teardown: bool)
        -> EngineResult<()>;

    fn doze_supported(&self, handle: DisplayHandle) -> bool;

    fn active_secure_sessions(&self, handle: DisplayHandle) -> EngineResult<SecureSessions>;

    /// Returns whether the display needs a refresh to complete the event
    fn handle_secure_event(
        &self,
        handle: DisplayHandle,
        event: SecureEvent,
        is_target: bool,
    ) -> EngineResult<bool>;

    fn post_handle_secure_event(&self, handle: DisplayHandle, event: SecureEvent)
        -> EngineResult<()>;

    fn active_config(&self, handle: DisplayHandle) -> EngineResult<u32>;

    fn set_active_config(&self, handle: DisplayHandle, config: u32) -> EngineResult<()>;

    fn config_count(&self, handle: DisplayHandle) -> EngineResult<u32>;

    fn vsync_period_ns(&self, handle: DisplayHandle) -> EngineResult<u64>;

    fn check_resource_state(&self, handle: DisplayHandle) -> EngineResult<ResourceState>;

    fn set_alternate_config(&self, handle: DisplayHandle, enable: bool) -> EngineResult<()>;

    /// Drop any queued work for a display that is about to be torn down
    fn abort(&self, handle: DisplayHandle);

    fn set_idle_timeout(&self, handle: DisplayHandle, active_ms: u32, inactive_ms: u32)
        -> EngineResult<()>;

    fn set_qsync_mode(&self, handle: DisplayHandle, mode: QsyncMode) -> EngineResult<()>;

    fn teardown_concurrent_writeback(&self, handle: DisplayHandle) -> EngineResult<()>;

    fn control_partial_update(&self, handle: DisplayHandle, enable: bool) -> EngineResult<()>;

    fn set_test_pattern(&self, _handle: DisplayHandle, _pattern: TestPattern) -> EngineResult<()> {
        Err(EngineError::NotSupported)
    }

    fn wait_fence(&self, fence: &Fence, timeout: Duration) -> EngineResult<()> {
        match fence.wait(timeout) {
            FenceWait::Signaled => Ok(()),
            FenceWait::Failed => Err(EngineError::Invalid("fence signaled an error".into())),
            FenceWait::TimedOut => Err(EngineError::Timeout),
        }
    }
}

//! Error types for the session manager
//!
//! `Error` is what every session operation returns. Callers at the
//! compositor boundary only ever see the collapsed `Status` set, and the
//! vendor control channel sees a negative errno.

use std::time::Duration;

/// Session manager error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Unknown display id, or a slot with nothing bound to it
    #[error("bad display {0}")]
    BadDisplay(u64),
    /// Caller contract violation
    #[error("bad parameter: {0}")]
    BadParameter(&'static str),
    /// Slot or hardware exhaustion
    #[error("no resources: {0}")]
    NoResources(&'static str),
    /// Not valid for this display class or current mode
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// A bounded wait expired
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// A serialized long-running protocol is already in flight
    #[error("busy: {0}")]
    Busy(&'static str),
    /// The engine refused a protected transition
    #[error("permission denied")]
    PermissionDenied,
    /// Invariant violation; a logic defect rather than a runtime condition
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Closed status set exposed at the compositor boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    None = 0,
    BadDisplay = 2,
    BadParameter = 4,
    NoResources = 6,
    Unsupported = 8,
}

impl Error {
    /// Raise an invariant violation, logging it loudly at the point of detection
    pub fn inconsistency(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::error!("Session invariant violated: {}", msg);
        debug_assert!(false, "session invariant violated: {}", msg);
        Error::InternalInconsistency(msg)
    }

    /// Collapse onto the compositor-facing status set
    pub fn status(&self) -> Status {
        match self {
            Error::BadDisplay(_) => Status::BadDisplay,
            Error::BadParameter(_) | Error::PermissionDenied => Status::BadParameter,
            Error::NoResources(_)
            | Error::Timeout(_)
            | Error::Busy(_)
            | Error::InternalInconsistency(_) => Status::NoResources,
            Error::Unsupported(_) => Status::Unsupported,
        }
    }

    /// Negative errno for the vendor control channel
    pub fn errno(&self) -> i32 {
        -match self {
            Error::BadDisplay(_) => libc::ENODEV,
            Error::BadParameter(_) => libc::EINVAL,
            Error::NoResources(_) => libc::ENOMEM,
            Error::Unsupported(_) => libc::ENOTSUP,
            Error::Timeout(_) => libc::ETIMEDOUT,
            Error::Busy(_) => libc::EBUSY,
            Error::PermissionDenied => libc::EPERM,
            Error::InternalInconsistency(_) => libc::EFAULT,
        }
    }
}

/// Map a result onto the compositor-facing status
pub fn to_status<T>(result: &Result<T>) -> Status {
    match result {
        Ok(_) => Status::None,
        Err(e) => e.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_collapse() {
        assert_eq!(Error::BadDisplay(3).status(), Status::BadDisplay);
        assert_eq!(Error::Busy("tui").status(), Status::NoResources);
        assert_eq!(
            Error::Timeout(Duration::from_millis(5)).status(),
            Status::NoResources
        );
        assert_eq!(to_status::<()>(&Ok(())), Status::None);
    }

    #[test]
    fn test_errno_is_negative() {
        assert_eq!(Error::Busy("x").errno(), -libc::EBUSY);
        assert_eq!(Error::PermissionDenied.errno(), -libc::EPERM);
        assert!(Error::Unsupported("x").errno() < 0);
    }
}

//! dsm - multi-display session manager
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Compositor client callbacks       │
//! ├──────────────────────────────────────────┤
//! │  udev uevents  →  Hotplug coordinator    │
//! │                          ↓               │
//! │  Slot table + per-display locks          │
//! │  Secure sessions · Trusted UI · Commits  │
//! │                          ↓               │
//! │          Display Engine (trait)          │
//! └──────────────────────────────────────────┘
//! ```

pub mod config;
pub mod constants;
#[cfg(target_os = "linux")]
pub mod drm;
pub mod engine;
pub mod error;
pub mod session;

pub use error::{Error, Result, Status};

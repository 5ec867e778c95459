//! Display objects
//!
//! A `DisplayObject` is the live state bound to a slot while a physical or
//! virtual display is connected. It is only ever touched through the
//! owning slot's lock, and it is the session's entry point into the
//! engine for that display.

use log::{debug, info};
use std::fmt::Write as _;

use crate::engine::{
    DisplayEngine, DisplayHandle, DisplayKind, Fence, PowerMode, QsyncMode, SecureSessions,
    TestPattern,
};
use crate::error::{Error, Result};

/// Geometry a virtual display was created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualGeometry {
    pub width: u32,
    pub height: u32,
    pub format: u32,
}

#[derive(Debug)]
pub struct DisplayObject {
    /// Back-reference to the owning slot
    pub client_id: u64,
    /// BuiltIn, Pluggable or Virtual; the primary keeps its hardware class
    pub class: DisplayKind,
    pub hw_id: i32,
    pub handle: DisplayHandle,
    pub power_mode: PowerMode,
    /// Power transition captured while a secure session was active
    pub pending_power_mode: Option<PowerMode>,
    pub active_config: u32,
    pub secure_sessions: SecureSessions,
    pub first_commit_done: bool,
    pub qsync_mode: QsyncMode,
    pub partial_update: bool,
    pub geometry: Option<VirtualGeometry>,
    pub test_pattern: Option<TestPattern>,
}

impl DisplayObject {
    pub fn new(client_id: u64, class: DisplayKind, hw_id: i32, handle: DisplayHandle) -> Self {
        Self {
            client_id,
            class,
            hw_id,
            handle,
            power_mode: PowerMode::Off,
            pending_power_mode: None,
            active_config: 0,
            secure_sessions: SecureSessions::empty(),
            first_commit_done: false,
            qsync_mode: QsyncMode::None,
            partial_update: true,
            geometry: None,
            test_pattern: None,
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.class == DisplayKind::BuiltIn
    }

    pub fn is_pluggable(&self) -> bool {
        self.class == DisplayKind::Pluggable
    }

    pub fn is_virtual(&self) -> bool {
        self.class == DisplayKind::Virtual
    }

    /// Commit or validate a frame through the engine
    pub fn commit(
        &mut self,
        engine: &dyn DisplayEngine,
        validate_only: bool,
    ) -> Result<(Option<Fence>, bool)> {
        let outcome = engine
            .commit(self.handle, validate_only)
            .map_err(|e| e.into_session(self.client_id))?;
        if !outcome.needs_commit {
            self.mark_committed();
        }
        Ok((outcome.retire_fence, outcome.needs_commit))
    }

    /// Present a validated frame
    pub fn present(&mut self, engine: &dyn DisplayEngine) -> Result<Option<Fence>> {
        let outcome = engine
            .commit(self.handle, false)
            .map_err(|e| e.into_session(self.client_id))?;
        self.mark_committed();
        Ok(outcome.retire_fence)
    }

    fn mark_committed(&mut self) {
        if !self.first_commit_done {
            debug!("Display {}: first commit done", self.client_id);
            self.first_commit_done = true;
        }
    }

    pub fn set_power_mode(
        &mut self,
        engine: &dyn DisplayEngine,
        mode: PowerMode,
        teardown: bool,
    ) -> Result<()> {
        engine
            .set_power_mode(self.handle, mode, teardown)
            .map_err(|e| e.into_session(self.client_id))?;
        self.power_mode = mode;
        Ok(())
    }

    pub fn refresh_secure_sessions(&mut self, engine: &dyn DisplayEngine) -> SecureSessions {
        if let Ok(sessions) = engine.active_secure_sessions(self.handle) {
            self.secure_sessions = sessions;
        }
        self.secure_sessions
    }

    /// Apply a secure-session transition to this display.
    ///
    /// A powered built-in display that is not the active secure display is
    /// switched off while a session runs, and its mode is kept as pending
    /// so it can be restored once the session clears.
    pub fn handle_secure_session(
        &mut self,
        engine: &dyn DisplayEngine,
        sessions: SecureSessions,
        is_active_secure: bool,
    ) -> Result<()> {
        if is_active_secure || !self.is_builtin() || sessions.is_empty() {
            return Ok(());
        }
        if self.power_mode == PowerMode::Off || self.pending_power_mode.is_some() {
            return Ok(());
        }
        info!(
            "Display {}: secure session active elsewhere, parking power mode {:?}",
            self.client_id, self.power_mode
        );
        let previous = self.power_mode;
        self.set_power_mode(engine, PowerMode::Off, false)?;
        self.pending_power_mode = Some(previous);
        Ok(())
    }

    pub fn set_active_config(&mut self, engine: &dyn DisplayEngine, config: u32) -> Result<()> {
        let count = engine
            .config_count(self.handle)
            .map_err(|e| e.into_session(self.client_id))?;
        if config >= count {
            return Err(Error::BadParameter("config index out of range"));
        }
        engine
            .set_active_config(self.handle, config)
            .map_err(|e| e.into_session(self.client_id))?;
        self.active_config = config;
        Ok(())
    }

    /// Re-read the active config after the engine may have changed it
    pub fn sync_active_config(&mut self, engine: &dyn DisplayEngine) -> bool {
        match engine.active_config(self.handle) {
            Ok(config) if config != self.active_config => {
                self.active_config = config;
                true
            }
            _ => false,
        }
    }

    pub fn describe(&self, out: &mut String) {
        let _ = write!(
            out,
            "class={} hw={} power={:?} pending={:?} config={} secure={:?} first_commit={} qsync={:?}",
            self.class,
            self.hw_id,
            self.power_mode,
            self.pending_power_mode,
            self.active_config,
            self.secure_sessions,
            self.first_commit_done,
            self.qsync_mode,
        );
        if let Some(g) = self.geometry {
            let _ = write!(out, " geometry={}x{}@{:#x}", g.width, g.height, g.format);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CreateParams, HwDisplayInfo, SoftEngine};

    fn engine_with(hw_id: i32) -> (SoftEngine, DisplayHandle) {
        let engine = SoftEngine::new(vec![HwDisplayInfo {
            hw_id,
            kind: DisplayKind::BuiltIn,
            is_primary: false,
            connected: true,
        }]);
        let handle = engine
            .create_display(&CreateParams {
                kind: DisplayKind::BuiltIn,
                hw_id,
                is_primary: false,
                width: 0,
                height: 0,
                format: 0,
            })
            .unwrap();
        (engine, handle)
    }

    #[test]
    fn test_secure_session_parks_other_builtin() {
        let (engine, handle) = engine_with(2);
        let mut obj = DisplayObject::new(3, DisplayKind::BuiltIn, 2, handle);
        obj.set_power_mode(&engine, PowerMode::On, false).unwrap();

        obj.handle_secure_session(&engine, SecureSessions::SECURE_DISPLAY, false)
            .unwrap();
        assert_eq!(obj.power_mode, PowerMode::Off);
        assert_eq!(obj.pending_power_mode, Some(PowerMode::On));
        assert_eq!(engine.power_of(2), Some(PowerMode::Off));
    }

    #[test]
    fn test_active_secure_display_untouched() {
        let (engine, handle) = engine_with(1);
        let mut obj = DisplayObject::new(0, DisplayKind::BuiltIn, 1, handle);
        obj.set_power_mode(&engine, PowerMode::On, false).unwrap();
        obj.handle_secure_session(&engine, SecureSessions::SECURE_CAMERA, true)
            .unwrap();
        assert_eq!(obj.power_mode, PowerMode::On);
        assert!(obj.pending_power_mode.is_none());
    }

    #[test]
    fn test_config_out_of_range() {
        let (engine, handle) = engine_with(1);
        let mut obj = DisplayObject::new(0, DisplayKind::BuiltIn, 1, handle);
        assert!(matches!(
            obj.set_active_config(&engine, 7),
            Err(Error::BadParameter(_))
        ));
        obj.set_active_config(&engine, 1).unwrap();
        assert_eq!(obj.active_config, 1);
    }

    #[test]
    fn test_present_marks_first_commit() {
        let (engine, handle) = engine_with(1);
        let mut obj = DisplayObject::new(0, DisplayKind::BuiltIn, 1, handle);
        let (_, needs_commit) = obj.commit(&engine, true).unwrap();
        assert!(needs_commit);
        assert!(!obj.first_commit_done);
        assert!(obj.present(&engine).unwrap().is_some());
        assert!(obj.first_commit_done);
    }
}

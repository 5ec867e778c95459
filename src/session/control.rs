//! Vendor control channel
//!
//! Integer-coded commands with a flat `i32` payload. Displays are named by
//! their well-known alias (`DisplayType`), except for virtual display
//! destruction which takes the client id returned at creation. Replies are
//! a status (0 or negative errno) plus optional values.

use log::{debug, info, warn};

use super::manager::SessionManager;
use super::slot::DisplayType;
use super::tui::TuiEvent;
use crate::engine::{PowerMode, QsyncMode};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    ScreenRefresh,
    SetIdleTimeout,
    SetActiveConfig,
    GetActiveConfig,
    GetConfigCount,
    SetPowerMode,
    ControlPartialUpdate,
    NotifyTuiTransition,
    IsDisplayConnected,
    SetQsyncMode,
    DisplayPowerReset,
    CreateVirtualDisplay,
    DestroyVirtualDisplay,
    SetCameraStatus,
}

impl ControlCommand {
    /// Payload values the command needs
    fn arity(self) -> usize {
        match self {
            ControlCommand::DisplayPowerReset => 0,
            ControlCommand::ScreenRefresh
            | ControlCommand::SetIdleTimeout
            | ControlCommand::GetActiveConfig
            | ControlCommand::GetConfigCount
            | ControlCommand::IsDisplayConnected
            | ControlCommand::DestroyVirtualDisplay
            | ControlCommand::SetCameraStatus => 1,
            ControlCommand::SetActiveConfig
            | ControlCommand::SetPowerMode
            | ControlCommand::ControlPartialUpdate
            | ControlCommand::NotifyTuiTransition
            | ControlCommand::SetQsyncMode => 2,
            ControlCommand::CreateVirtualDisplay => 3,
        }
    }
}

impl TryFrom<u32> for ControlCommand {
    type Error = u32;

    fn try_from(code: u32) -> std::result::Result<Self, u32> {
        Ok(match code {
            0 => ControlCommand::ScreenRefresh,
            1 => ControlCommand::SetIdleTimeout,
            2 => ControlCommand::SetActiveConfig,
            3 => ControlCommand::GetActiveConfig,
            4 => ControlCommand::GetConfigCount,
            5 => ControlCommand::SetPowerMode,
            6 => ControlCommand::ControlPartialUpdate,
            7 => ControlCommand::NotifyTuiTransition,
            8 => ControlCommand::IsDisplayConnected,
            9 => ControlCommand::SetQsyncMode,
            10 => ControlCommand::DisplayPowerReset,
            11 => ControlCommand::CreateVirtualDisplay,
            12 => ControlCommand::DestroyVirtualDisplay,
            13 => ControlCommand::SetCameraStatus,
            other => return Err(other),
        })
    }
}

fn non_negative(value: i32, what: &'static str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::BadParameter(what))
}

impl SessionManager {
    /// Map a vendor display alias to a client display id
    fn control_display(&self, alias: i32) -> Result<u64> {
        DisplayType::from_raw(alias)
            .and_then(|t| self.slots.index_for_type(t))
            .map(|idx| self.slots.client_id(idx))
            .ok_or(Error::BadParameter("unknown display type"))
    }

    /// Execute one control command; returns (status, reply values)
    pub fn dispatch(&self, command: u32, payload: &[i32]) -> (i32, Vec<i32>) {
        let cmd = match ControlCommand::try_from(command) {
            Ok(cmd) => cmd,
            Err(code) => {
                warn!("Unknown control command {}", code);
                return (-libc::EINVAL, Vec::new());
            }
        };
        if payload.len() < cmd.arity() {
            warn!(
                "{:?}: payload has {} values, needs {}",
                cmd,
                payload.len(),
                cmd.arity()
            );
            return (-libc::EINVAL, Vec::new());
        }
        debug!("Control {:?} {:?}", cmd, payload);
        match self.run_control(cmd, payload) {
            Ok(reply) => (0, reply),
            Err(e) => {
                debug!("Control {:?} failed: {}", cmd, e);
                (e.errno(), Vec::new())
            }
        }
    }

    fn run_control(&self, cmd: ControlCommand, payload: &[i32]) -> Result<Vec<i32>> {
        match cmd {
            ControlCommand::ScreenRefresh => {
                self.refresh(self.control_display(payload[0])?)?;
            }
            ControlCommand::SetIdleTimeout => {
                self.set_idle_timeout(non_negative(payload[0], "idle timeout")?)?;
            }
            ControlCommand::SetActiveConfig => {
                let display = self.control_display(payload[0])?;
                self.set_active_config(display, non_negative(payload[1], "config")?)?;
            }
            ControlCommand::GetActiveConfig => {
                let config = self.get_active_config(self.control_display(payload[0])?)?;
                return Ok(vec![config as i32]);
            }
            ControlCommand::GetConfigCount => {
                let count = self.get_config_count(self.control_display(payload[0])?)?;
                return Ok(vec![count as i32]);
            }
            ControlCommand::SetPowerMode => {
                let display = self.control_display(payload[0])?;
                let mode =
                    PowerMode::from_raw(payload[1]).ok_or(Error::BadParameter("power mode"))?;
                self.set_power_mode(display, mode)?;
            }
            ControlCommand::ControlPartialUpdate => {
                let display = self.control_display(payload[0])?;
                self.control_partial_update(display, payload[1] != 0)?;
            }
            ControlCommand::NotifyTuiTransition => {
                let display = self.control_display(payload[0])?;
                let event =
                    TuiEvent::from_raw(payload[1]).ok_or(Error::BadParameter("tui event"))?;
                self.tui_event(display, event)?;
            }
            ControlCommand::IsDisplayConnected => {
                let connected = self.is_display_connected(self.control_display(payload[0])?)?;
                return Ok(vec![connected as i32]);
            }
            ControlCommand::SetQsyncMode => {
                let display = self.control_display(payload[0])?;
                let mode =
                    QsyncMode::from_raw(payload[1]).ok_or(Error::BadParameter("qsync mode"))?;
                self.set_qsync_mode(display, mode)?;
            }
            ControlCommand::DisplayPowerReset => self.display_power_reset(),
            ControlCommand::CreateVirtualDisplay => {
                let width = non_negative(payload[0], "width")?;
                let height = non_negative(payload[1], "height")?;
                let format = non_negative(payload[2], "format")?;
                let client_id = self.create_virtual_display(width, height, format)?;
                return Ok(vec![client_id as i32]);
            }
            ControlCommand::DestroyVirtualDisplay => {
                let display = u64::from(non_negative(payload[0], "display")?);
                self.destroy_virtual_display(display)?;
            }
            ControlCommand::SetCameraStatus => {
                info!("Camera status {}", payload[0]);
            }
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{DisplayKind, HwDisplayInfo, SoftEngine};
    use std::sync::Arc;

    fn setup() -> (Arc<SoftEngine>, Arc<SessionManager>) {
        let engine = Arc::new(SoftEngine::new(vec![HwDisplayInfo {
            hw_id: 1,
            kind: DisplayKind::BuiltIn,
            is_primary: true,
            connected: true,
        }]));
        let manager = SessionManager::new(&Config::default(), engine.clone());
        manager.init().unwrap();
        (engine, manager)
    }

    #[test]
    fn test_unknown_and_short_commands() {
        let (_engine, manager) = setup();
        assert_eq!(manager.dispatch(99, &[]), (-libc::EINVAL, vec![]));
        assert_eq!(manager.dispatch(2, &[0]).0, -libc::EINVAL);
        assert_eq!(manager.dispatch(11, &[64, 64]).0, -libc::EINVAL);
    }

    #[test]
    fn test_config_queries() {
        let (_engine, manager) = setup();
        assert_eq!(manager.dispatch(4, &[0]), (0, vec![2]));
        assert_eq!(manager.dispatch(2, &[0, 1]).0, 0);
        assert_eq!(manager.dispatch(3, &[0]), (0, vec![1]));
        assert_eq!(manager.dispatch(2, &[0, -1]).0, -libc::EINVAL);
    }

    #[test]
    fn test_power_mode_by_alias() {
        let (engine, manager) = setup();
        assert_eq!(manager.dispatch(5, &[0, 0]).0, 0);
        assert_eq!(engine.power_of(1), Some(PowerMode::Off));
        assert_eq!(manager.dispatch(5, &[0, 42]).0, -libc::EINVAL);
        // External alias exists but nothing is bound there
        assert_eq!(manager.dispatch(5, &[1, 2]).0, -libc::ENODEV);
        assert_eq!(manager.dispatch(5, &[17, 2]).0, -libc::EINVAL);
    }

    #[test]
    fn test_virtual_lifecycle() {
        let (_engine, manager) = setup();
        let (status, reply) = manager.dispatch(11, &[640, 480, 1]);
        assert_eq!(status, 0);
        let client_id = reply[0];
        assert_eq!(manager.dispatch(8, &[2]), (0, vec![1]));
        assert_eq!(manager.dispatch(12, &[client_id]).0, 0);
        assert_eq!(manager.dispatch(12, &[client_id]).0, -libc::ENODEV);
    }

    #[test]
    fn test_partial_update_on_pluggable_alias() {
        let (_engine, manager) = setup();
        assert_eq!(manager.dispatch(6, &[1, 1]).0, -libc::ENODEV);
    }

    #[test]
    fn test_camera_status_acknowledged() {
        let (_engine, manager) = setup();
        assert_eq!(manager.dispatch(13, &[1]), (0, vec![]));
    }
}

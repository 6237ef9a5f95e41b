//! Robot-wide supervisory state.
//!
//! One value gates every operator command. The numeric encoding is part of
//! the operator wire protocol: telemetry lines carry it in the `AS` field
//! and `PR1` reports it verbatim, so the discriminants are fixed.

use serde::{Deserialize, Serialize};

/// Supervisory state of the whole robot.
///
/// Transitions are owned by the supervisor alone; everything else reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RobotState {
    /// An asynchronous error is pending on the event bus. Never stored;
    /// substituted on the wire while events are queued.
    AsyncError = 0,
    /// All CANopen nodes switched off.
    Off = 1,
    /// Emergency stop completed.
    Emergency = 2,
    /// Powered on, nothing discovered yet.
    Powered = 3,
    /// Motors discovered and configured.
    Initialized = 4,
    /// Homing in progress.
    SearchingCenter = 5,
    /// All motors at the machine origin.
    Centered = 6,
    /// Motion tables streaming to the drives.
    Simulating = 8,
    /// Motion finished, drives holding position.
    Stopped = 9,
    /// Returning to the origin.
    Centering = 10,
    /// Drive control released, brakes engaged.
    Released = 11,
    /// Point-to-point move in progress.
    PositionMove = 13,
    /// Streaming source attached, not yet moving.
    JoystickAttached = 14,
    /// Following streamed position commands.
    FreeMove = 15,
}

impl RobotState {
    /// Convert from the wire value. Returns `None` for unassigned codes.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::AsyncError),
            1 => Some(Self::Off),
            2 => Some(Self::Emergency),
            3 => Some(Self::Powered),
            4 => Some(Self::Initialized),
            5 => Some(Self::SearchingCenter),
            6 => Some(Self::Centered),
            8 => Some(Self::Simulating),
            9 => Some(Self::Stopped),
            10 => Some(Self::Centering),
            11 => Some(Self::Released),
            13 => Some(Self::PositionMove),
            14 => Some(Self::JoystickAttached),
            15 => Some(Self::FreeMove),
            _ => None,
        }
    }

    /// Wire value carried in telemetry and `PR1` replies.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// States in which motors are in motion; the supervisor leaves them
    /// only once every motor has settled.
    #[inline]
    pub const fn is_running(self) -> bool {
        matches!(
            self,
            Self::SearchingCenter | Self::Centering | Self::Simulating | Self::PositionMove
        )
    }

    /// Human-readable name used by the `PR1` report.
    pub const fn name(self) -> &'static str {
        match self {
            Self::AsyncError => "Async error",
            Self::Off => "Off",
            Self::Emergency => "Emergency",
            Self::Powered => "Powered",
            Self::Initialized => "Initialized",
            Self::SearchingCenter => "Searching center",
            Self::Centered => "Centered",
            Self::Simulating => "Simulating",
            Self::Stopped => "Stopped",
            Self::Centering => "Centering",
            Self::Released => "Released",
            Self::PositionMove => "Position move",
            Self::JoystickAttached => "Joystick attached",
            Self::FreeMove => "Free move",
        }
    }
}

impl Default for RobotState {
    fn default() -> Self {
        Self::Powered
    }
}

impl std::fmt::Display for RobotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_codes() {
        for code in 0..=16u8 {
            if let Some(state) = RobotState::from_u8(code) {
                assert_eq!(state.code(), code);
            }
        }
        // Codes 7, 12 and 16 are unassigned in the wire protocol.
        assert!(RobotState::from_u8(7).is_none());
        assert!(RobotState::from_u8(12).is_none());
        assert!(RobotState::from_u8(16).is_none());
    }

    #[test]
    fn initial_state_is_powered() {
        assert_eq!(RobotState::default(), RobotState::Powered);
    }

    #[test]
    fn running_set() {
        assert!(RobotState::SearchingCenter.is_running());
        assert!(RobotState::Centering.is_running());
        assert!(RobotState::Simulating.is_running());
        assert!(RobotState::PositionMove.is_running());
        assert!(!RobotState::Stopped.is_running());
        assert!(!RobotState::FreeMove.is_running());
    }
}

//! Numbered event kinds for the `CERR` reply channel.
//!
//! The numeric values are wire-compatible: `CERR <command> <code>` lines
//! carry them to the operator, so the mapping is fixed.

use serde::{Deserialize, Serialize};

/// Everything the master can report through a `CERR` line or queue on the
/// event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    NotFound = 0,
    InternalError = 1,
    ParamError = 2,
    ConfigError = 3,
    BusVoltageFault = 4,
    OverCurrentFault = 5,
    TemperatureFault = 6,
    PositionFault = 7,
    VelocityFault = 8,
    DerivativeFault = 9,
    RightLimitFault = 10,
    LeftLimitFault = 11,
    MoveError = 12,
    QuickStop = 13,
    InterpPositionError = 14,
    InterpInvalidTimeError = 15,
    InterpInvalidPositionError = 16,
    InterpFifoUnderError = 17,
    InterpFifoOverError = 18,
    PermissionDenied = 19,
    SimulationError = 20,
    MotorFault = 21,
    FileError = 22,
}

impl EventKind {
    /// Wire code used in `CERR` lines.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NotFound),
            1 => Some(Self::InternalError),
            2 => Some(Self::ParamError),
            3 => Some(Self::ConfigError),
            4 => Some(Self::BusVoltageFault),
            5 => Some(Self::OverCurrentFault),
            6 => Some(Self::TemperatureFault),
            7 => Some(Self::PositionFault),
            8 => Some(Self::VelocityFault),
            9 => Some(Self::DerivativeFault),
            10 => Some(Self::RightLimitFault),
            11 => Some(Self::LeftLimitFault),
            12 => Some(Self::MoveError),
            13 => Some(Self::QuickStop),
            14 => Some(Self::InterpPositionError),
            15 => Some(Self::InterpInvalidTimeError),
            16 => Some(Self::InterpInvalidPositionError),
            17 => Some(Self::InterpFifoUnderError),
            18 => Some(Self::InterpFifoOverError),
            19 => Some(Self::PermissionDenied),
            20 => Some(Self::SimulationError),
            21 => Some(Self::MotorFault),
            22 => Some(Self::FileError),
            _ => None,
        }
    }

    /// Operator-facing description.
    pub const fn description(self) -> &'static str {
        match self {
            Self::NotFound => "Unrecognized command",
            Self::InternalError => "Internal error",
            Self::ParamError => "Invalid parameters",
            Self::ConfigError => "Configuration error",
            Self::BusVoltageFault => "Servo bus voltage fault",
            Self::OverCurrentFault => "Peak over-current occurred",
            Self::TemperatureFault => "Excessive temperature",
            Self::PositionFault => "Excessive position error",
            Self::VelocityFault => "Velocity tracking error",
            Self::DerivativeFault => "Position error derivative over limit",
            Self::RightLimitFault => "Right(+) over travel limit",
            Self::LeftLimitFault => "Left(-) over travel limit",
            Self::MoveError => "Move error",
            Self::QuickStop => "Quick stop active",
            Self::InterpPositionError => "Position error tolerance exceeded (IP mode)",
            Self::InterpInvalidTimeError => "Invalid time range (IP mode)",
            Self::InterpInvalidPositionError => "Invalid position increment (IP mode)",
            Self::InterpFifoUnderError => "FIFO underflow (IP mode)",
            Self::InterpFifoOverError => "FIFO overflow (IP mode)",
            Self::PermissionDenied => "Operation not permitted",
            Self::SimulationError => "Simulation interrupted",
            Self::MotorFault => "Motor fault",
            Self::FileError => "Motion file error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

//! Object-dictionary addresses used by the master.
//!
//! Communication-profile objects (0x1xxx), the CiA 402 drive profile
//! (0x6xxx) and the drive-specific extensions (0x2xxx).

/// One object-dictionary address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OdEntry {
    pub index: u16,
    pub sub: u8,
}

impl OdEntry {
    pub const fn new(index: u16, sub: u8) -> Self {
        Self { index, sub }
    }
}

impl std::fmt::Display for OdEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}:{:02X}", self.index, self.sub)
    }
}

// Communication profile.
pub const HEARTBEAT_PRODUCER: u16 = 0x1017;
pub const TPDO_COMM_BASE: u16 = 0x1800;
pub const TPDO_MAP_BASE: u16 = 0x1A00;
pub const RPDO_COMM_BASE: u16 = 0x1400;
pub const RPDO_MAP_BASE: u16 = 0x1600;

// Drive-specific extensions.
/// Limit-switch input configuration (sub 3).
pub const LIMIT_INPUT_CONFIG: u16 = 0x2101;
/// Origin set command.
pub const ORIGIN_SET: u16 = 0x2202;
/// Extended status register (sub 1).
pub const EXTENDED_STATUS: u16 = 0x2304;
/// Limit-switch enable.
pub const LIMIT_ENABLE: u16 = 0x2309;
/// Raw ASCII command channel.
pub const RAW_COMMAND: u16 = 0x2500;

// CiA 402 drive profile.
pub const CONTROL_WORD: u16 = 0x6040;
pub const STATUS_WORD: u16 = 0x6041;
pub const MODES_OF_OPERATION: u16 = 0x6060;
pub const MODES_OF_OPERATION_DISPLAY: u16 = 0x6061;
pub const POSITION_ACTUAL: u16 = 0x6063;
pub const FOLLOWING_ERROR_WINDOW: u16 = 0x6065;
pub const TARGET_POSITION: u16 = 0x607A;
pub const HOMING_OFFSET: u16 = 0x607C;
pub const PROFILE_VELOCITY: u16 = 0x6081;
pub const PROFILE_ACCELERATION: u16 = 0x6083;
pub const PROFILE_DECELERATION: u16 = 0x6084;
pub const TORQUE_SLOPE: u16 = 0x6087;
pub const TARGET_TORQUE: u16 = 0x6071;
pub const HOMING_METHOD: u16 = 0x6098;
/// Sub 1: speed during search for switch; sub 2: speed during search for
/// zero.
pub const HOMING_SPEEDS: u16 = 0x6099;
pub const HOMING_ACCELERATION: u16 = 0x609A;
/// Interpolation sub-mode select.
pub const IP_SUBMODE: u16 = 0x60C0;
/// Sub 1: interpolation data record (position).
pub const IP_DATA: u16 = 0x60C1;
/// Sub 1: time units; sub 2: time index (power-of-ten exponent).
pub const IP_TIME: u16 = 0x60C2;
/// Sub 6: buffer clear/enable.
pub const IP_BUFFER: u16 = 0x60C4;
pub const TARGET_VELOCITY: u16 = 0x60FF;

/// Homing method the fleet uses (negative-limit seek with index pulse).
pub const HOMING_METHOD_LIMIT: u32 = 18;

//! Network-wide constants.

/// Highest addressable CANopen node id.
pub const NODE_ID_MAX: u8 = 127;

/// First node id assigned to a motor of the fleet (0x77 = 119).
pub const MOTOR_NODE_FIRST: u8 = 0x77;

/// Capacity of the drive's on-device interpolation FIFO and of the
/// host-side motion queue that feeds it.
pub const TABLE_SIZE: usize = 45;

/// Distance driven away from an active limit switch during discovery,
/// in encoder counts.
pub const EXIT_FROM_LIMIT_COUNTS: i32 = 16_000;

/// Profile velocity and acceleration used for the return-to-zero move.
pub const ZERO_RETURN_VELOCITY: u32 = 300_000;
pub const ZERO_RETURN_ACCEL: u32 = 10;

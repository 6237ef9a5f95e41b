//! Static compound catalog.
//!
//! Each compound mirrors the drive-side procedure it performs, one
//! primitive step per line. `H` marks a substitution hole filled from the
//! caller's argument vector, in step order: index, subindex, value.

use std::borrow::Cow;

use alma_link::NmtCommand;

use super::{Compound, Step, HOLE};

const H: u32 = HOLE;

const fn wr(index: u32, sub: u32, size: u8, value: u32) -> Step {
    Step::WriteOd {
        index,
        sub,
        size,
        value,
    }
}

const fn rd(index: u32, sub: u32) -> Step {
    Step::ReadOd { index, sub }
}

const fn compound(
    name: &'static str,
    steps: &'static [Step],
    on_success: &'static str,
    on_failure: &'static str,
) -> Compound {
    Compound {
        name,
        steps: Cow::Borrowed(steps),
        on_success,
        on_failure,
    }
}

/// Bring the drive through SWITCHED_OFF, configure velocity mode and
/// start it.
pub static SMART_START: Compound = compound(
    "smart_start",
    &[
        Step::Nmt(NmtCommand::StartNode),
        wr(0x6040, 0, 2, 0x00), // switched off
        wr(0x6040, 0, 2, 0x80), // reset status word
        wr(0x6040, 0, 2, 0x00), // switched off
        wr(0x6060, 0, 1, 0x03), // velocity mode
        wr(0x60FF, 0, 4, 0x00), // zero target velocity
        wr(0x6083, 0, 4, 0x1000), // acceleration
        wr(0x6084, 0, 4, 0x0A), // deceleration
        wr(0x6065, 0, 4, 2000), // following error window
        wr(0x6040, 0, 2, 0x06), // ready to switch on
        wr(0x6040, 0, 2, 0x07), // switched on
        wr(0x6040, 0, 2, 0x0F), // start
    ],
    "servo started",
    "cannot start servo",
);

/// Force zero velocity with limit inputs disabled.
pub static SMART_STOP: Compound = compound(
    "smart_stop",
    &[
        wr(0x6040, 0, 2, 0x00),
        wr(0x6040, 0, 2, 0x80),
        wr(0x6040, 0, 2, 0x00),
        wr(0x2101, 3, 2, 0x02), // disable positive limit input
        wr(0x2101, 3, 2, 0x03), // disable negative limit input
        wr(0x6060, 0, 1, 0x03),
        wr(0x60FF, 0, 4, 0x00),
        wr(0x6040, 0, 2, 0x06),
        wr(0x6040, 0, 2, 0x07),
        wr(0x6040, 0, 2, 0x0F),
    ],
    "servo stopped",
    "cannot stop servo",
);

/// Transition to SWITCHED_OFF.
pub static SMART_OFF: Compound = compound(
    "smart_off",
    &[
        wr(0x6040, 0, 2, 0x00),
        wr(0x6040, 0, 2, 0x80),
        wr(0x6040, 0, 2, 0x00),
    ],
    "servo off",
    "cannot switch servo off",
);

/// Configure and launch homing method 18.
/// Substitutions: forward velocity, backward velocity, offset.
pub static SMART_HOMING: Compound = compound(
    "smart_homing",
    &[
        wr(0x6040, 0, 2, 0x00),
        wr(0x6040, 0, 2, 0x80),
        wr(0x6040, 0, 2, 0x00),
        wr(0x6060, 0, 1, 0x06), // homing mode
        wr(0x6098, 0, 1, 18),   // homing method
        wr(0x2309, 0, 2, (-4i32) as u32), // enable positive limit switch
        wr(0x2309, 0, 2, (-5i32) as u32), // enable negative limit switch
        wr(0x6099, 1, 4, H), // speed during search for switch
        wr(0x6099, 2, 4, H), // speed during search for zero
        wr(0x609A, 0, 4, 10), // homing acceleration
        wr(0x607C, 0, 4, H), // homing offset
        wr(0x6040, 0, 2, 0x06),
        wr(0x6040, 0, 2, 0x07),
        wr(0x6040, 0, 2, 0x0F),
        wr(0x6040, 0, 2, 0x1F), // begin motion
    ],
    "homing started",
    "cannot start homing",
);

/// Configure a point-to-point move in position mode; motion is armed but
/// not started.
/// Substitutions: acceleration, deceleration, profile velocity, target.
pub static SMART_POSITION_SET: Compound = compound(
    "smart_position_set",
    &[
        wr(0x6040, 0, 2, 0x80),
        wr(0x6060, 0, 1, 0x01), // position mode
        wr(0x6083, 0, 4, H),
        wr(0x6084, 0, 4, H),
        wr(0x6081, 0, 4, H),
        wr(0x607A, 0, 4, H),
        wr(0x6040, 0, 2, 0x06),
        wr(0x6040, 0, 2, 0x07),
        wr(0x6040, 0, 2, 0x2F), // latch single setpoint
    ],
    "target point set",
    "cannot reach target point",
);

/// Begin the armed point-to-point motion.
pub static SMART_POSITION_START: Compound = compound(
    "smart_position_start",
    &[wr(0x6040, 0, 2, 0x3F)],
    "motion started",
    "cannot start motion",
);

/// Prime interpolated-position mode with a seed point.
/// Substitution: seed position (current encoder position).
pub static INIT_INTERPOLATION: Compound = compound(
    "init_interpolation",
    &[
        wr(0x6040, 0, 2, 0x06),
        wr(0x6040, 0, 2, 0x07),
        wr(0x6040, 0, 2, 0x0F),
        wr(0x60C4, 6, 1, 0x00), // clear buffer
        wr(0x60C4, 6, 1, 0x01), // enable buffer
        wr(0x60C2, 1, 1, 0x01), // one time unit
        wr(0x60C2, 2, 1, 0x00), // of a second
        wr(0x6060, 0, 1, 0x07), // interpolation mode
        wr(0x60C0, 0, 2, 0x00), // linear sub-mode
        wr(0x60C1, 1, 4, H),    // seed point
    ],
    "interpolation primed",
    "cannot prime interpolation",
);

/// Re-prime interpolated-position mode after a stop, keeping the buffer
/// configuration.
/// Substitution: seed position.
pub static RESUME_INTERPOLATION: Compound = compound(
    "resume_interpolation",
    &[
        wr(0x6040, 0, 2, 0x0F),
        wr(0x60C2, 1, 1, 0x64),
        wr(0x60C1, 1, 4, H),
    ],
    "interpolation resumed",
    "cannot resume interpolation",
);

/// Begin interpolated motion.
pub static START_INTERPOLATION: Compound = compound(
    "start_interpolation",
    &[wr(0x6040, 0, 2, 0x1F)],
    "interpolation started",
    "cannot start interpolation",
);

/// Finalize a trajectory: zero-length segment plus the final point.
/// Substitution: final position.
pub static STOP_INTERPOLATION: Compound = compound(
    "stop_interpolation",
    &[
        wr(0x60C2, 1, 1, 0x00), // zero-length segment
        wr(0x60C1, 1, 4, H),    // repeat final point
    ],
    "interpolation closing",
    "cannot stop interpolation",
);

/// Configure the heartbeat producer.
/// Substitution: period in milliseconds.
pub static HEART_START: Compound = compound(
    "heart_start",
    &[wr(0x1017, 0, 2, H)],
    "heartbeat configured",
    "cannot configure heartbeat",
);

/// Rewrite a PDO with one mapped object.
/// Substitutions: comm idx, COB-ID (disabled), map idx, map idx, object,
/// map idx, comm idx, COB-ID (enabled), comm idx, transmission type,
/// comm idx, inhibit/event time.
pub static MAP1_PDO: Compound = compound(
    "map1_pdo",
    &[
        wr(H, 1, 4, H),    // set bit 31 of the COB-ID
        wr(H, 0, 1, 0x00), // zero mapped entries
        wr(H, 1, 4, H),    // mapping object 1
        wr(H, 0, 1, 0x01), // one mapped entry
        wr(H, 1, 4, H),    // clear bit 31 of the COB-ID
        wr(H, 2, 1, H),    // transmission type
        wr(H, 5, 2, H),    // event timer
    ],
    "PDO mapped",
    "cannot map PDO",
);

/// Rewrite a PDO with two mapped objects.
pub static MAP2_PDO: Compound = compound(
    "map2_pdo",
    &[
        wr(H, 1, 4, H),
        wr(H, 0, 1, 0x00),
        wr(H, 1, 4, H),
        wr(H, 2, 4, H),
        wr(H, 0, 1, 0x02),
        wr(H, 1, 4, H),
        wr(H, 2, 1, H),
        wr(H, 5, 2, H),
    ],
    "PDO mapped",
    "cannot map PDO",
);

/// Rewrite a PDO with three mapped objects.
pub static MAP3_PDO: Compound = compound(
    "map3_pdo",
    &[
        wr(H, 1, 4, H),
        wr(H, 0, 1, 0x00),
        wr(H, 1, 4, H),
        wr(H, 2, 4, H),
        wr(H, 3, 4, H),
        wr(H, 0, 1, 0x03),
        wr(H, 1, 4, H),
        wr(H, 2, 1, H),
        wr(H, 5, 2, H),
    ],
    "PDO mapped",
    "cannot map PDO",
);

/// Rewrite a PDO with four mapped objects.
pub static MAP4_PDO: Compound = compound(
    "map4_pdo",
    &[
        wr(H, 1, 4, H),
        wr(H, 0, 1, 0x00),
        wr(H, 1, 4, H),
        wr(H, 2, 4, H),
        wr(H, 3, 4, H),
        wr(H, 4, 4, H),
        wr(H, 0, 1, 0x04),
        wr(H, 1, 4, H),
        wr(H, 2, 1, H),
        wr(H, 5, 2, H),
    ],
    "PDO mapped",
    "cannot map PDO",
);

/// Enable the hardware limit-switch inputs.
pub static SMART_LIMIT_ENABLE: Compound = compound(
    "smart_limit_enable",
    &[
        wr(0x2309, 0, 2, (-4i32) as u32),
        wr(0x2309, 0, 2, (-5i32) as u32),
    ],
    "limits enabled",
    "cannot enable limits",
);

/// Disable the hardware limit-switch inputs.
pub static SMART_LIMIT_DISABLE: Compound = compound(
    "smart_limit_disable",
    &[wr(0x2101, 3, 2, 0x02), wr(0x2101, 3, 2, 0x03)],
    "limits disabled",
    "cannot disable limits",
);

/// Read the drive's extended status register.
pub static SMART_STATUSWORD: Compound = compound(
    "smart_statusword",
    &[rd(0x2304, 1)],
    "status word read",
    "cannot read extended status",
);

/// Enter torque mode holding a setpoint.
/// Substitution: torque.
pub static TORQUE: Compound = compound(
    "torque",
    &[
        wr(0x6060, 0, 1, 0x04), // torque mode
        wr(0x6087, 0, 4, 0xC8), // torque slope
        wr(0x6071, 0, 2, H),    // torque setpoint
        wr(0x6040, 0, 2, 0x06),
        wr(0x6040, 0, 2, 0x0F),
    ],
    "torque mode entered",
    "cannot enter torque mode",
);

/// Read the profile velocity.
pub static VELOCITY_GET: Compound = compound(
    "velocity_get",
    &[rd(0x6081, 0)],
    "velocity read",
    "cannot read velocity",
);

/// Write the profile velocity.
/// Substitution: velocity.
pub static VELOCITY_SET: Compound = compound(
    "velocity_set",
    &[wr(0x6081, 0, 4, H)],
    "velocity set",
    "cannot set velocity",
);

/// Read the profile acceleration.
pub static ACCELERATION_GET: Compound = compound(
    "acceleration_get",
    &[rd(0x6083, 0)],
    "acceleration read",
    "cannot read acceleration",
);

/// Read the following-error window.
pub static FOLLOWING_ERROR_GET: Compound = compound(
    "following_error_get",
    &[rd(0x6065, 0)],
    "following error read",
    "cannot read following error",
);

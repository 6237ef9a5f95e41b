//! One simulated servo drive.
//!
//! Implements just enough of the CiA 402 state machine, the profile
//! position / homing modes and the interpolated-position FIFO for the
//! master to drive it exactly like the real hardware: SDO writes mutate
//! registers, the control word walks the drive states, and `step()`
//! advances the physics by one tick.

use std::collections::{BTreeMap, VecDeque};

use alma_common::{od, IpStatus, StatusWord};
use tracing::{debug, trace};

/// Simulation tick length, seconds.
pub const TICK_SECONDS: f64 = 0.01;

/// FIFO capacity of the simulated drive.
const FIFO_SIZE: usize = alma_common::consts::TABLE_SIZE;

/// Status-word skeleton for an enabled drive: voltage present, operation
/// enabled, remote.
const STATUS_ENABLED: u16 = 0x0237;

/// One queued interpolation segment. `units == 0` terminates the
/// trajectory.
#[derive(Debug, Clone, Copy)]
struct IpSegment {
    units: u8,
    index: i8,
    position: i32,
}

impl IpSegment {
    fn duration(&self) -> f64 {
        f64::from(self.units) * 10f64.powi(i32::from(self.index))
    }
}

/// Segment currently being executed.
#[derive(Debug, Clone, Copy)]
struct RunningSegment {
    start: f64,
    end: f64,
    duration: f64,
    elapsed: f64,
}

#[derive(Debug)]
pub struct SimMotor {
    pub node: u8,
    status: u16,
    /// 0x6060, echoed as mode display.
    mode: u8,
    position: f64,
    op_enabled: bool,
    fault: bool,

    // Profile position.
    target: i32,
    profile_velocity: u32,
    moving: bool,

    // Homing.
    homing_ticks: u32,

    // Interpolated position.
    fifo: VecDeque<IpSegment>,
    ip_time_units: u8,
    ip_time_index: i8,
    ip_active: bool,
    ip_flags: u16,
    segment: Option<RunningSegment>,
    anchored: bool,

    /// Extended status returned by reads of 0x2304:1; tests raise the
    /// travel-limit bits here.
    pub ext_status: u16,

    registers: BTreeMap<(u16, u8), u32>,
}

impl SimMotor {
    pub fn new(node: u8) -> Self {
        Self {
            node,
            status: 0,
            mode: 0,
            position: 0.0,
            op_enabled: false,
            fault: false,
            target: 0,
            profile_velocity: 0,
            moving: false,
            homing_ticks: 0,
            fifo: VecDeque::with_capacity(FIFO_SIZE),
            ip_time_units: 0,
            ip_time_index: 0,
            ip_active: false,
            ip_flags: 0,
            segment: None,
            anchored: false,
            ext_status: 0,
            registers: BTreeMap::new(),
        }
    }

    /// Power-on reset, as after an NMT reset-node.
    pub fn reset(&mut self) {
        let node = self.node;
        let ext = self.ext_status;
        *self = Self::new(node);
        self.ext_status = ext;
        self.status = StatusWord::VOLTAGE_ENABLED.bits();
    }

    pub fn position(&self) -> i32 {
        self.position as i32
    }

    pub fn status_word(&self) -> u16 {
        let mut status = self.status;
        if self.op_enabled {
            status |= STATUS_ENABLED;
        }
        if !self.moving && self.homing_ticks == 0 && !self.ip_active {
            status |= 0x0400;
        }
        if self.fault {
            status = (status & !0x006F) | StatusWord::STATE_FAULT | StatusWord::VOLTAGE_ENABLED.bits();
        }
        status
    }

    pub fn ip_status(&self) -> u16 {
        let free = (FIFO_SIZE - self.fifo.len()) as u16;
        let mut ip = self.ip_flags | free;
        if self.ip_active {
            ip |= IpStatus::ACTIVE.bits();
        }
        ip
    }

    pub fn mode_display(&self) -> u8 {
        self.mode
    }

    /// Test hook: raise interpolation fault flags as if the drive had
    /// reported them.
    pub fn inject_ip_flags(&mut self, flags: u16) {
        self.ip_flags |= flags;
    }

    /// Apply an SDO download.
    pub fn sdo_write(&mut self, index: u16, sub: u8, value: u32) {
        match (index, sub) {
            (od::CONTROL_WORD, 0) => self.control_word(value as u16),
            (od::MODES_OF_OPERATION, 0) => {
                self.mode = value as u8;
                trace!(node = self.node, mode = self.mode, "mode change");
            }
            (od::PROFILE_VELOCITY, 0) => self.profile_velocity = value,
            (od::TARGET_POSITION, 0) => self.target = value as i32,
            (od::TARGET_VELOCITY, 0) => {
                // Velocity mode is only ever commanded with a zero target;
                // treat it as "hold".
                if value == 0 {
                    self.moving = false;
                }
            }
            (od::IP_TIME, 1) => self.ip_time_units = value as u8,
            (od::IP_TIME, 2) => self.ip_time_index = value as i8,
            (od::IP_DATA, 1) => self.push_segment(self.ip_time_units, self.ip_time_index, value as i32),
            (od::IP_BUFFER, 6) => {
                if value == 0 {
                    self.fifo.clear();
                    self.segment = None;
                    self.anchored = false;
                    self.ip_flags = 0;
                }
            }
            (od::ORIGIN_SET, 0) => self.position = 0.0,
            _ => {
                self.registers.insert((index, sub), value);
            }
        }
    }

    /// Serve an SDO upload.
    pub fn sdo_read(&self, index: u16, sub: u8) -> u64 {
        match (index, sub) {
            (od::EXTENDED_STATUS, 1) => u64::from(self.ext_status),
            (od::STATUS_WORD, 0) => u64::from(self.status_word()),
            (od::POSITION_ACTUAL, 0) => u64::from(self.position() as u32),
            (od::MODES_OF_OPERATION_DISPLAY, 0) => u64::from(self.mode),
            _ => u64::from(self.registers.get(&(index, sub)).copied().unwrap_or(0)),
        }
    }

    /// Push one interpolation segment, whether it arrived by SDO or PDO.
    pub fn push_segment(&mut self, units: u8, index: i8, position: i32) {
        if self.fifo.len() >= FIFO_SIZE {
            self.ip_flags |= IpStatus::FIFO_OVERFLOW.bits();
            return;
        }
        self.fifo.push_back(IpSegment {
            units,
            index,
            position,
        });
    }

    /// Rolling profile-position update delivered over RPDO2.
    pub fn rolling_target(&mut self, velocity: u32, position: i32) {
        self.profile_velocity = velocity;
        self.target = position;
    }

    /// Control-word transition, from SDO or the broadcast RPDO4.
    pub fn control_word(&mut self, cw: u16) {
        match cw {
            0x80 => {
                self.fault = false;
                self.ip_flags = 0;
            }
            0x00 => {
                self.op_enabled = false;
                self.moving = false;
                self.homing_ticks = 0;
                self.ip_active = false;
                self.segment = None;
            }
            0x06 | 0x07 => {
                self.op_enabled = false;
            }
            0x0F => {
                self.op_enabled = true;
            }
            0x1F => {
                self.op_enabled = true;
                match self.mode {
                    6 => {
                        // A homing run takes a handful of ticks.
                        self.homing_ticks = 20;
                        self.status &= !StatusWord::TARGET_REACHED;
                    }
                    7 => self.start_interpolation(),
                    1 => self.begin_profile_move(),
                    _ => {}
                }
            }
            0x2F => {
                self.op_enabled = true;
                self.status &= !StatusWord::TARGET_REACHED;
            }
            0x3F => {
                self.op_enabled = true;
                if self.mode == 1 {
                    self.begin_profile_move();
                }
            }
            _ => {}
        }
        self.status |= StatusWord::VOLTAGE_ENABLED.bits();
    }

    fn begin_profile_move(&mut self) {
        self.status &= !StatusWord::TARGET_REACHED;
        if (self.position() - self.target).abs() == 0 {
            self.status |= StatusWord::TARGET_REACHED;
            self.moving = false;
        } else {
            self.moving = true;
        }
        debug!(
            node = self.node,
            target = self.target,
            velocity = self.profile_velocity,
            "profile move"
        );
    }

    fn start_interpolation(&mut self) {
        if self.ip_active {
            return;
        }
        self.ip_active = true;
        self.status &= !StatusWord::TARGET_REACHED;
        // The first queued point is the seed written at priming time; the
        // drive anchors on it without motion.
        if !self.anchored {
            if let Some(seed) = self.fifo.pop_front() {
                self.position = f64::from(seed.position);
            }
            self.anchored = true;
        }
        debug!(node = self.node, queued = self.fifo.len(), "interpolation start");
    }

    /// Advance the physics by one tick.
    pub fn step(&mut self) {
        if self.fault || !self.op_enabled {
            return;
        }

        if self.homing_ticks > 0 {
            self.homing_ticks -= 1;
            if self.homing_ticks == 0 {
                // Switch found, index reached, machine zero applied.
                self.position = 0.0;
                self.status |= StatusWord::TARGET_REACHED;
            }
            return;
        }

        match self.mode {
            1 if self.moving => self.step_profile(),
            7 if self.ip_active => self.step_interpolation(),
            _ => {}
        }
    }

    fn step_profile(&mut self) {
        let velocity = f64::from(self.profile_velocity.max(1));
        let step = velocity * TICK_SECONDS;
        let error = f64::from(self.target) - self.position;
        if error.abs() <= step {
            self.position = f64::from(self.target);
            self.moving = false;
            self.status |= StatusWord::TARGET_REACHED;
            debug!(node = self.node, position = self.target, "target reached");
        } else {
            self.position += step * error.signum();
        }
    }

    fn step_interpolation(&mut self) {
        if self.segment.is_none() && !self.next_segment() {
            return;
        }
        if let Some(seg) = self.segment.as_mut() {
            seg.elapsed += TICK_SECONDS;
            if seg.elapsed >= seg.duration {
                self.position = seg.end;
                self.segment = None;
            } else {
                let ratio = seg.elapsed / seg.duration;
                self.position = seg.start + (seg.end - seg.start) * ratio;
            }
        }
    }

    /// Pop the next FIFO entry into execution. Returns false once the
    /// trajectory has ended or underflowed.
    fn next_segment(&mut self) -> bool {
        match self.fifo.pop_front() {
            Some(seg) if seg.units == 0 => {
                // Zero-length terminator: hold at the final position and
                // flush whatever is still queued behind it.
                self.position = f64::from(seg.position);
                self.ip_active = false;
                self.fifo.clear();
                self.status |= StatusWord::TARGET_REACHED;
                debug!(node = self.node, "interpolation finished");
                false
            }
            Some(seg) => {
                self.segment = Some(RunningSegment {
                    start: self.position,
                    end: f64::from(seg.position),
                    duration: seg.duration().max(TICK_SECONDS),
                    elapsed: 0.0,
                });
                true
            }
            None => {
                self.ip_flags |= IpStatus::FIFO_UNDERFLOW.bits();
                self.ip_active = false;
                debug!(node = self.node, "interpolation underflow");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_motor() -> SimMotor {
        let mut motor = SimMotor::new(0x77);
        motor.reset();
        motor.control_word(0x0F);
        motor
    }

    #[test]
    fn profile_move_reaches_target() {
        let mut motor = enabled_motor();
        motor.sdo_write(od::MODES_OF_OPERATION, 0, 1);
        motor.sdo_write(od::PROFILE_VELOCITY, 0, 100_000);
        motor.sdo_write(od::TARGET_POSITION, 0, 5_000);
        motor.control_word(0x2F);
        motor.control_word(0x3F);

        let status = StatusWord::from_bits_retain(motor.status_word());
        assert!(!status.target_reached());

        for _ in 0..20 {
            motor.step();
        }
        assert_eq!(motor.position(), 5_000);
        let status = StatusWord::from_bits_retain(motor.status_word());
        assert!(status.target_reached());
        assert!(status.operation_enabled());
    }

    #[test]
    fn interpolation_consumes_fifo_then_terminates() {
        let mut motor = enabled_motor();
        motor.sdo_write(od::MODES_OF_OPERATION, 0, 7);
        // Seed (anchor), two 100 ms points, zero-time terminator.
        motor.sdo_write(od::IP_TIME, 1, 1);
        motor.sdo_write(od::IP_DATA, 1, 0);
        motor.sdo_write(od::IP_TIME, 1, 100);
        motor.sdo_write(od::IP_TIME, 2, (-3i8) as u8 as u32);
        motor.sdo_write(od::IP_DATA, 1, 1_000);
        motor.sdo_write(od::IP_DATA, 1, 0u32);
        motor.sdo_write(od::IP_TIME, 1, 0);
        motor.sdo_write(od::IP_DATA, 1, 0u32);

        motor.control_word(0x1F);
        assert!(IpStatus::from_bits_retain(motor.ip_status()).active());

        for _ in 0..40 {
            motor.step();
        }
        let ip = IpStatus::from_bits_retain(motor.ip_status());
        assert!(!ip.active());
        assert!(!ip.contains(IpStatus::FIFO_UNDERFLOW));
        assert_eq!(motor.position(), 0);
    }

    #[test]
    fn empty_fifo_underflows() {
        let mut motor = enabled_motor();
        motor.sdo_write(od::MODES_OF_OPERATION, 0, 7);
        motor.sdo_write(od::IP_TIME, 1, 1);
        motor.sdo_write(od::IP_DATA, 1, 0);
        motor.control_word(0x1F);

        // Anchor consumed the only point; next step has nothing to run.
        motor.step();
        let ip = IpStatus::from_bits_retain(motor.ip_status());
        assert!(ip.contains(IpStatus::FIFO_UNDERFLOW));
        assert!(!ip.active());
    }

    #[test]
    fn free_slots_track_fifo_depth() {
        let mut motor = enabled_motor();
        assert_eq!(IpStatus::from_bits_retain(motor.ip_status()).free_slots(), 45);
        motor.sdo_write(od::IP_TIME, 1, 100);
        motor.sdo_write(od::IP_DATA, 1, 10);
        motor.sdo_write(od::IP_DATA, 1, 20);
        assert_eq!(IpStatus::from_bits_retain(motor.ip_status()).free_slots(), 43);
    }

    #[test]
    fn homing_returns_to_zero() {
        let mut motor = enabled_motor();
        motor.position = 12_345.0;
        motor.sdo_write(od::MODES_OF_OPERATION, 0, 6);
        motor.control_word(0x1F);
        for _ in 0..30 {
            motor.step();
        }
        assert_eq!(motor.position(), 0);
        assert!(StatusWord::from_bits_retain(motor.status_word()).target_reached());
    }
}

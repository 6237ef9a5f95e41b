//! Drive status registers.
//!
//! `StatusWord` carries the CiA 402 bits plus the drive-specific extras in
//! the upper byte; `IpStatus` is the drive's interpolation status register
//! with the free-slot count in its low six bits.

use bitflags::bitflags;

bitflags! {
    /// CiA 402 status word (0x6041) as mapped into TPDO1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusWord: u16 {
        const READY_TO_SWITCH_ON = 0x0001;
        const SWITCHED_ON        = 0x0002;
        const OPERATION_ENABLED  = 0x0004;
        const FAULT              = 0x0008;
        /// Bus voltage present. Loss of this bit is an emergency.
        const VOLTAGE_ENABLED    = 0x0010;
        const QUICK_STOP         = 0x0020;
        /// Drive-specific limit fault flag.
        const LIMIT_FAULT        = 0x0040;
        /// Target reached, low half of the drive's two-bit encoding.
        const TARGET_REACHED_LO  = 0x0400;
        /// Target reached, high half.
        const TARGET_REACHED_HI  = 0x1000;
        /// Move error (homing fault, following error).
        const MOVE_ERROR         = 0x2000;
        /// Right(+) travel limit currently active.
        const RIGHT_LIMIT        = 0x4000;
        /// Left(-) travel limit currently active.
        const LEFT_LIMIT         = 0x8000;
    }
}

impl StatusWord {
    /// Mask selecting the CiA 402 drive-state bits.
    pub const STATE_MASK: u16 = 0x006F;
    /// Drive-state pattern for "fault".
    pub const STATE_FAULT: u16 = 0x0008;
    /// Drive-state pattern for "quick stop active".
    pub const STATE_QUICK_STOP: u16 = 0x0007;
    /// Drive-state pattern for "operation enabled".
    pub const STATE_OPERATION_ENABLED: u16 = 0x0027;
    /// Both halves of the target-reached encoding.
    pub const TARGET_REACHED: u16 = 0x1400;

    /// Drive reports main bus voltage.
    #[inline]
    pub const fn powered(self) -> bool {
        self.bits() & Self::VOLTAGE_ENABLED.bits() != 0
    }

    /// CiA 402 fault state.
    #[inline]
    pub fn in_fault(self) -> bool {
        self.bits() & 0x4F == Self::STATE_FAULT
    }

    /// CiA 402 quick-stop state.
    #[inline]
    pub fn in_quick_stop(self) -> bool {
        self.bits() & Self::STATE_MASK == Self::STATE_QUICK_STOP
    }

    /// Operation enabled with no fault or quick-stop bit interfering.
    #[inline]
    pub fn operation_enabled(self) -> bool {
        self.bits() & Self::STATE_MASK == Self::STATE_OPERATION_ENABLED
    }

    /// Both target-reached bits set.
    #[inline]
    pub fn target_reached(self) -> bool {
        self.bits() & Self::TARGET_REACHED == Self::TARGET_REACHED
    }
}

bitflags! {
    /// Drive interpolation status register as mapped into TPDO1.
    ///
    /// The low six bits are not flags but the count of free FIFO slots;
    /// use [`IpStatus::free_slots`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IpStatus: u16 {
        const POSITION_ERROR   = 0x0040;
        const INVALID_TIME     = 0x0400;
        const INVALID_POSITION = 0x0800;
        const FIFO_OVERFLOW    = 0x2000;
        const FIFO_UNDERFLOW   = 0x4000;
        /// Interpolated motion currently executing.
        const ACTIVE           = 0x8000;
        // Free-slot count bits, kept so `from_bits_retain` round-trips.
        const SLOTS_0 = 0x0001;
        const SLOTS_1 = 0x0002;
        const SLOTS_2 = 0x0004;
        const SLOTS_3 = 0x0008;
        const SLOTS_4 = 0x0010;
        const SLOTS_5 = 0x0020;
    }
}

impl IpStatus {
    /// Mask of the free-slot counter field.
    pub const SLOTS_MASK: u16 = 0x003F;

    /// Free slots currently available in the drive FIFO.
    #[inline]
    pub const fn free_slots(self) -> u16 {
        self.bits() & Self::SLOTS_MASK
    }

    #[inline]
    pub const fn active(self) -> bool {
        self.bits() & 0x8000 != 0
    }
}

/// Modes of operation (0x6060) / display (0x6061) values used by the
/// master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationMode {
    ProfilePosition = 1,
    ProfileVelocity = 3,
    Torque = 4,
    Homing = 6,
    InterpolatedPosition = 7,
}

impl OperationMode {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ProfilePosition),
            3 => Some(Self::ProfileVelocity),
            4 => Some(Self::Torque),
            6 => Some(Self::Homing),
            7 => Some(Self::InterpolatedPosition),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_classification() {
        let sw = StatusWord::from_bits_retain(0x0637);
        assert!(sw.powered());
        assert!(sw.operation_enabled());
        assert!(!sw.in_fault());
        assert!(!sw.target_reached());

        let reached = StatusWord::from_bits_retain(0x1C37);
        assert!(reached.target_reached());

        let fault = StatusWord::from_bits_retain(0x0018);
        assert!(fault.in_fault());

        let quick = StatusWord::from_bits_retain(0x0017);
        assert!(quick.in_quick_stop());
    }

    #[test]
    fn half_target_reached_is_not_reached() {
        let sw = StatusWord::from_bits_retain(0x1637);
        assert!(!sw.target_reached());
    }

    #[test]
    fn free_slot_field() {
        let ip = IpStatus::from_bits_retain(0x102D);
        assert_eq!(ip.free_slots(), 45);
        assert!(!ip.active());

        let running = IpStatus::from_bits_retain(0x802D);
        assert!(running.active());
    }

    #[test]
    fn mode_decoding() {
        assert_eq!(OperationMode::from_u8(7), Some(OperationMode::InterpolatedPosition));
        assert_eq!(OperationMode::from_u8(6), Some(OperationMode::Homing));
        assert_eq!(OperationMode::from_u8(2), None);
    }
}

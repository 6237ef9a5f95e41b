//! Drive status reactor.
//!
//! Every status-word / interpolation-status / mode-display change lands
//! here. The rules run in a fixed order: bus voltage, position-mode
//! target reached, homing fault, homing end, CiA 402 fault, quick stop,
//! and finally the interpolation machinery (start edge, finish edge,
//! fault flags, FIFO refill).

use alma_common::{
    consts::{TABLE_SIZE, ZERO_RETURN_ACCEL, ZERO_RETURN_VELOCITY},
    EventKind, IpStatus, NodeId, OperationMode, RobotState, StatusWord,
};
use tracing::{debug, info, trace, warn};

use crate::master::{JobTag, Master, Started};
use crate::motion::{MotionQueue, Sample};
use crate::sequencer::{catalog, Target};

/// Encode a dwell in milliseconds into the drive's `(units, index)` time
/// record: `units * 10^index` seconds, units held to one byte.
pub(crate) fn encode_dwell(dwell_ms: u32) -> (u8, i8) {
    let mut units = dwell_ms;
    let mut index = -3i8;
    while units > 255 {
        units /= 10;
        index += 1;
    }
    (units as u8, index)
}

impl Master {
    /// TPDO1 landed: run the dispatch table.
    pub(crate) fn on_status_pdo(&mut self, node: NodeId, status: u16, ip_status: u16, mode: u8) {
        let Some(motor) = self.motors.get_mut(&node) else {
            return;
        };
        if !motor.active {
            return;
        }
        let previous_ip = motor.ip_status;
        motor.status = StatusWord::from_bits_retain(status);
        motor.ip_status = IpStatus::from_bits_retain(ip_status);
        motor.mode = mode;
        let status = motor.status;
        let ip = motor.ip_status;
        let mode = OperationMode::from_u8(mode);
        trace!(node, status = format_args!("{status:?}"), ?mode, "status update");

        self.update_board_fifo(node, TABLE_SIZE as u16 - ip.free_slots().min(TABLE_SIZE as u16));

        let state = self.state();

        // Loss of bus voltage outranks everything.
        if !status.powered() && state != RobotState::Emergency {
            warn!(node, "bus voltage lost");
            self.shared
                .events
                .add(EventKind::BusVoltageFault, node, false, None);
            self.execute(
                Target::Node(node),
                JobTag::BusVoltage,
                &[&catalog::SMART_STOP],
                &[],
            );
            return;
        }

        // Position mode: target reached while a supervised move runs.
        if mode == Some(OperationMode::ProfilePosition)
            && matches!(
                state,
                RobotState::SearchingCenter
                    | RobotState::Centering
                    | RobotState::Powered
                    | RobotState::Emergency
                    | RobotState::Released
                    | RobotState::PositionMove
            )
            && status.operation_enabled()
            && status.target_reached()
        {
            debug!(node, "position target reached");
            self.execute(
                Target::Node(node),
                JobTag::PositionTarget,
                &[&catalog::SMART_STOP],
                &[],
            );
        }

        // Homing mode.
        if mode == Some(OperationMode::Homing) {
            if status.contains(StatusWord::MOVE_ERROR) {
                self.cerr("CT2", EventKind::MoveError);
                if self.started(node) == Started::Running {
                    self.execute(Target::Node(node), JobTag::Stop, &[&catalog::SMART_STOP], &[]);
                }
            } else if status.target_reached() && self.started(node) == Started::Running {
                // Homing done: re-arm the limits and return to zero.
                let backward = self
                    .queue_of(node)
                    .and_then(|q| q.homing())
                    .map(|h| h.backward_velocity)
                    .unwrap_or(ZERO_RETURN_VELOCITY);
                info!(node, "homing finished, returning to zero");
                self.execute(
                    Target::Node(node),
                    JobTag::None,
                    &[
                        &catalog::SMART_LIMIT_ENABLE,
                        &catalog::SMART_POSITION_SET,
                        &catalog::SMART_POSITION_START,
                    ],
                    &[ZERO_RETURN_ACCEL, ZERO_RETURN_ACCEL, backward, 0],
                );
            }
        }

        // CiA 402 fault state.
        if status.in_fault() {
            if status.contains(StatusWord::MOVE_ERROR) {
                self.shared.events.add(EventKind::MoveError, node, false, None);
            }
            match state {
                RobotState::Powered
                | RobotState::Emergency
                | RobotState::SearchingCenter => {}
                RobotState::Released => {
                    self.execute(
                        Target::Node(node),
                        JobTag::Fault,
                        &[&catalog::SMART_STATUSWORD, &catalog::SMART_OFF],
                        &[],
                    );
                }
                _ => {
                    self.shared.events.add(EventKind::MotorFault, node, false, None);
                    self.execute(
                        Target::Broadcast,
                        JobTag::Fault,
                        &[&catalog::SMART_STATUSWORD, &catalog::SMART_STOP],
                        &[],
                    );
                }
            }
        }

        // Quick stop.
        if status.in_quick_stop() {
            warn!(node, "quick stop active");
            self.shared.events.add(EventKind::QuickStop, node, false, None);
            self.execute(Target::Broadcast, JobTag::Stop, &[&catalog::SMART_STOP], &[]);
        }

        // Interpolated-position machinery.
        if mode == Some(OperationMode::InterpolatedPosition) {
            self.on_interp_update(node, previous_ip);
        }
    }

    fn started(&self, node: NodeId) -> Started {
        self.motors.get(&node).map(|m| m.started).unwrap_or_default()
    }

    /// Interpolation status handling: start/finish edges, fault flags and
    /// the per-cycle FIFO refill.
    fn on_interp_update(&mut self, node: NodeId, _previous: IpStatus) {
        let Some(motor) = self.motors.get_mut(&node) else {
            return;
        };
        let ip = motor.ip_status;

        if ip.active() && motor.started == Started::Idle {
            info!(node, "interpolation running");
            motor.started = Started::Running;
        } else if ip.bits() & 0x8100 == 0 && motor.started == Started::Finalizing {
            // The terminal sample was consumed.
            info!(node, "interpolation finished");
            motor.started = Started::Idle;
            self.simulation_table_end(node);
            return;
        }

        if ip.contains(IpStatus::POSITION_ERROR) {
            self.shared
                .events
                .add(EventKind::InterpPositionError, node, false, None);
        }
        if ip.contains(IpStatus::INVALID_TIME) {
            self.shared
                .events
                .add(EventKind::InterpInvalidTimeError, node, false, None);
        }
        if ip.contains(IpStatus::INVALID_POSITION) {
            self.shared
                .events
                .add(EventKind::InterpInvalidPositionError, node, false, None);
        }

        if ip.intersects(IpStatus::FIFO_UNDERFLOW | IpStatus::FIFO_OVERFLOW) {
            if ip.contains(IpStatus::FIFO_UNDERFLOW) {
                warn!(node, "drive FIFO underflow");
                self.shared
                    .events
                    .add(EventKind::InterpFifoUnderError, node, false, None);
            } else {
                warn!(node, "drive FIFO overflow");
                self.shared
                    .events
                    .add(EventKind::InterpFifoOverError, node, false, None);
            }
            self.execute(Target::Broadcast, JobTag::Stop, &[&catalog::SMART_STOP], &[]);
        } else if self.state() == RobotState::Simulating {
            self.simulation_table_start();
            // Keep one slot free for a forced trajectory closure.
            let budget = i32::from(ip.free_slots()) - 1;
            self.simulation_table_update(node, ip, budget);
        }
    }

    /// Coordinated start: once every active motor is primed, issue the
    /// begin-motion control word to all of them in one PDO.
    pub(crate) fn simulation_table_start(&mut self) {
        let active = self.active_nodes();
        if active.is_empty() {
            return;
        }
        let ready = active
            .iter()
            .filter(|n| self.motors.get(n).map(|m| m.simulation_ready).unwrap_or(false))
            .count();
        if ready != active.len() {
            return;
        }
        let Some(link) = self.link() else { return };
        info!("all motors primed, starting interpolation");
        link.image().set_control_word(0x1F);
        if let Err(error) = link.send_pdo_event() {
            warn!(%error, "cannot send start PDO");
        }
        for node in active {
            if let Some(motor) = self.motors.get_mut(&node) {
                motor.simulation_ready = false;
            }
        }
    }

    /// Push up to `budget` queued samples into the drive FIFO and close
    /// the trajectory once the source is exhausted.
    pub(crate) fn simulation_table_update(&mut self, node: NodeId, ip: IpStatus, budget: i32) {
        if budget <= 0 {
            return;
        }
        let Some(queue) = self.queue_of(node) else {
            self.cerr("CT4", EventKind::InternalError);
            return;
        };
        let Some(link) = self.link() else { return };
        let active = self
            .motors
            .get(&node)
            .map(|m| m.active)
            .unwrap_or(false);
        if !active {
            return;
        }

        let to_send = (budget as usize).min(queue.count());
        let mut sent = 0usize;
        for offset in 0..to_send {
            let Ok(sample) = queue.get(offset) else { break };
            let (units, index) = encode_dwell(sample.dwell_ms);
            link.image().set_ip_segment(node, units, index, sample.position);
            if let Err(error) = link.send_pdo_event() {
                warn!(node, %error, "cannot send IP segment");
                break;
            }
            sent += 1;
        }
        trace!(node, sent, budget, "table update");

        // Source exhausted while the drive still runs: finalize with a
        // zero-length segment repeating the last point.
        let drained = queue.count() == 0 && queue.end_reached();
        if drained
            && (sent as u16) < ip.free_slots()
            && self.started(node) != Started::Finalizing
            && ip.active()
        {
            let last = self.last_or_current(node, &queue);
            info!(node, position = last.position, "closing trajectory");
            if let Some(motor) = self.motors.get_mut(&node) {
                motor.started = Started::Finalizing;
            }
            link.image().set_ip_segment(node, 0, 0, last.position);
            if let Err(error) = link.send_pdo_event() {
                warn!(node, %error, "cannot send terminator PDO");
            }
            self.execute(
                Target::Node(node),
                JobTag::SimFinal,
                &[&catalog::STOP_INTERPOLATION],
                &[last.position as u32],
            );
        }

        if let Err(error) = queue.advance(sent) {
            warn!(node, %error, "queue advance failed");
        }

        if sent > 0 && !ip.active() {
            if let Some(motor) = self.motors.get_mut(&node) {
                motor.simulation_ready = true;
            }
        }
    }

    /// The sample the drive should hold at: last consumed, or the next
    /// buffered one, or the current position.
    pub(crate) fn last_or_current(&self, node: NodeId, queue: &MotionQueue) -> Sample {
        queue
            .last()
            .or_else(|| queue.get(0).ok())
            .unwrap_or(Sample {
                position: self.motors.get(&node).map(|m| m.position).unwrap_or(0),
                dwell_ms: 0,
            })
    }

    /// A motor consumed its terminal sample; when the last one settles,
    /// the simulation is over.
    pub(crate) fn simulation_table_end(&mut self, node: NodeId) {
        self.clear_motor(node);
        if !self.all_idle() {
            return;
        }
        if self.state() != RobotState::Stopped {
            self.set_state(RobotState::Stopped);
            self.ok("CT4");
        }
    }

    /// Hold the drive at the last issued point (used while aborting a
    /// running simulation).
    pub(crate) fn push_hold_point(&self, node: NodeId) {
        let Some(link) = self.link() else { return };
        let Some(queue) = self.queue_of(node) else { return };
        let last = self.last_or_current(node, &queue);
        link.image().set_ip_segment(node, 0, 0, last.position);
        if let Err(error) = link.send_pdo_event() {
            warn!(node, %error, "cannot send hold PDO");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dwell_encoding_matches_drive_time_record() {
        // 100 ms = 100 * 10^-3 s.
        assert_eq!(encode_dwell(100), (100, -3));
        // 255 fits the units byte directly.
        assert_eq!(encode_dwell(255), (255, -3));
        // 1000 ms = 100 * 10^-2 s.
        assert_eq!(encode_dwell(1_000), (100, -2));
        // 30 s = 30 * 10^0 s.
        assert_eq!(encode_dwell(30_000), (30, 0));
    }
}

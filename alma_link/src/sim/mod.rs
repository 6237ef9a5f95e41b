//! In-process drive simulator.
//!
//! `SimLink` stands in for the whole bus: it owns one [`SimMotor`] per
//! configured node, answers SDO traffic immediately on the event channel,
//! applies flushed PDO entries, and runs a 10 ms ticker thread that
//! advances the physics and emits status/position PDOs and SYNC events,
//! the same observable surface the real transport exposes.

mod motor;

pub use motor::SimMotor;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use alma_common::{od::OdEntry, NodeId};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::driver::Link;
use crate::pdo::{PdoFlush, PdoImage};
use crate::types::{LinkError, LinkEvent, NmtCommand};
use crate::SdoResult;

/// Status PDOs are re-sent unchanged every this many ticks, like a drive
/// with an event-timer transmission type.
const STATUS_RESEND_TICKS: u64 = 15;

struct SimState {
    motors: BTreeMap<NodeId, SimMotor>,
    /// Nodes announced via bootup; only these produce PDO traffic.
    configured: BTreeMap<NodeId, LastSent>,
    sync_on: bool,
    sync_ticks: u64,
    tick: u64,
}

#[derive(Default, Clone, Copy)]
struct LastSent {
    status: u16,
    ip_status: u16,
    mode: u8,
}

/// Simulated link layer.
pub struct SimLink {
    state: Arc<Mutex<SimState>>,
    image: Arc<PdoImage>,
    events: Sender<LinkEvent>,
    stop: Arc<AtomicBool>,
    ticker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SimLink {
    /// Create a simulator for `nodes`, reporting on `events`. Spawns the
    /// ticker thread; call [`SimLink::shutdown`] to stop it.
    pub fn new(nodes: &[NodeId], events: Sender<LinkEvent>) -> Arc<Self> {
        let link = Arc::new(Self::new_manual(nodes, events));
        let state = Arc::clone(&link.state);
        let image = Arc::clone(&link.image);
        let stop = Arc::clone(&link.stop);
        let tx = link.events.clone();
        let handle = thread::Builder::new()
            .name("sim-ticker".into())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_secs_f64(motor::TICK_SECONDS));
                    Self::tick(&state, &image, &tx);
                }
            })
            .expect("spawn sim ticker");
        *link.ticker.lock() = Some(handle);
        link
    }

    /// Create without the ticker thread; tests drive time with
    /// [`SimLink::tick_once`].
    pub fn new_manual(nodes: &[NodeId], events: Sender<LinkEvent>) -> Self {
        let motors = nodes
            .iter()
            .map(|&node| (node, SimMotor::new(node)))
            .collect();
        info!(?nodes, "simulated bus created");
        Self {
            state: Arc::new(Mutex::new(SimState {
                motors,
                configured: BTreeMap::new(),
                sync_on: false,
                sync_ticks: 10,
                tick: 0,
            })),
            image: Arc::new(PdoImage::new()),
            events,
            stop: Arc::new(AtomicBool::new(false)),
            ticker: Mutex::new(None),
        }
    }

    /// Stop and join the ticker thread.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.ticker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Advance the simulation by one tick (manual mode).
    pub fn tick_once(&self) {
        Self::tick(&self.state, &self.image, &self.events);
    }

    /// Test hook: mutate one simulated motor in place.
    pub fn with_motor<R>(&self, node: NodeId, f: impl FnOnce(&mut SimMotor) -> R) -> Option<R> {
        let mut state = self.state.lock();
        state.motors.get_mut(&node).map(f)
    }

    fn tick(state: &Mutex<SimState>, image: &PdoImage, tx: &Sender<LinkEvent>) {
        // Late flushes can race the master's explicit send_pdo_event; apply
        // anything still pending before stepping.
        let flushed = image.take_dirty();
        let mut state = state.lock();
        for flush in flushed {
            Self::apply_flush(&mut state, flush);
        }

        state.tick += 1;
        let tick = state.tick;
        let resend = tick % STATUS_RESEND_TICKS == 0;
        let sync_due = state.sync_on && tick % state.sync_ticks == 0;

        let nodes: Vec<NodeId> = state.configured.keys().copied().collect();
        for node in nodes {
            let Some(motor) = state.motors.get_mut(&node) else {
                continue;
            };
            motor.step();
            let status = motor.status_word();
            let ip_status = motor.ip_status();
            let mode = motor.mode_display();
            let position = motor.position();

            let last = state.configured.get_mut(&node).expect("configured node");
            let changed =
                last.status != status || last.ip_status != ip_status || last.mode != mode;
            if changed || resend {
                *last = LastSent {
                    status,
                    ip_status,
                    mode,
                };
                let _ = tx.send(LinkEvent::StatusPdo {
                    node,
                    status,
                    ip_status,
                    mode,
                });
            }
            let _ = tx.send(LinkEvent::PositionPdo { node, position });
        }

        if sync_due {
            let _ = tx.send(LinkEvent::Sync);
        }
    }

    fn apply_flush(state: &mut SimState, flush: PdoFlush) {
        match flush {
            PdoFlush::IpSegment {
                node,
                time_units,
                time_index,
                position,
            } => {
                if let Some(motor) = state.motors.get_mut(&node) {
                    motor.push_segment(time_units, time_index, position);
                }
            }
            PdoFlush::Target {
                node,
                velocity,
                position,
            } => {
                if let Some(motor) = state.motors.get_mut(&node) {
                    motor.rolling_target(velocity, position);
                }
            }
            PdoFlush::ControlWord(cw) => {
                for motor in state.motors.values_mut() {
                    motor.control_word(cw);
                }
            }
        }
    }
}

impl Link for SimLink {
    fn nmt(&self, target: NodeId, command: NmtCommand) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        debug!(target, ?command, "nmt");
        match command {
            NmtCommand::ResetNode | NmtCommand::ResetCommunication => {
                let nodes: Vec<NodeId> = state
                    .motors
                    .keys()
                    .copied()
                    .filter(|&n| target == 0 || n == target)
                    .collect();
                for node in nodes {
                    if let Some(motor) = state.motors.get_mut(&node) {
                        motor.reset();
                    }
                    state.configured.insert(node, LastSent::default());
                    self.events
                        .send(LinkEvent::Bootup(node))
                        .map_err(|_| LinkError::ChannelClosed)?;
                }
            }
            NmtCommand::StartNode | NmtCommand::StopNode | NmtCommand::EnterPreOperational => {}
        }
        Ok(())
    }

    fn sdo_write(
        &self,
        node: NodeId,
        entry: OdEntry,
        _size: u8,
        value: u32,
    ) -> Result<(), LinkError> {
        let result = {
            let mut state = self.state.lock();
            match state.motors.get_mut(&node) {
                Some(motor) => {
                    motor.sdo_write(entry.index, entry.sub, value);
                    SdoResult::WriteOk
                }
                None => SdoResult::Aborted {
                    code: 0x0504_0000, // SDO protocol timed out
                    receive: false,
                },
            }
        };
        self.events
            .send(LinkEvent::SdoResult { node, result })
            .map_err(|_| LinkError::ChannelClosed)
    }

    fn sdo_read(&self, node: NodeId, entry: OdEntry) -> Result<(), LinkError> {
        let result = {
            let state = self.state.lock();
            match state.motors.get(&node) {
                Some(motor) => SdoResult::ReadOk(motor.sdo_read(entry.index, entry.sub)),
                None => SdoResult::Aborted {
                    code: 0x0504_0000,
                    receive: true,
                },
            }
        };
        self.events
            .send(LinkEvent::SdoResult { node, result })
            .map_err(|_| LinkError::ChannelClosed)
    }

    fn send_pdo_event(&self) -> Result<(), LinkError> {
        let flushed = self.image.take_dirty();
        let mut state = self.state.lock();
        for flush in flushed {
            Self::apply_flush(&mut state, flush);
        }
        Ok(())
    }

    fn start_sync(&self, period: Duration) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.sync_ticks = (period.as_secs_f64() / motor::TICK_SECONDS).round().max(1.0) as u64;
        state.sync_on = true;
        Ok(())
    }

    fn stop_sync(&self) {
        self.state.lock().sync_on = false;
    }

    fn image(&self) -> &PdoImage {
        &self.image
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn reset_announces_bootups() {
        let (tx, rx) = mpsc::channel();
        let link = SimLink::new_manual(&[0x77, 0x78], tx);
        link.nmt(0, NmtCommand::ResetNode).unwrap();
        assert_eq!(rx.try_recv().unwrap(), LinkEvent::Bootup(0x77));
        assert_eq!(rx.try_recv().unwrap(), LinkEvent::Bootup(0x78));
    }

    #[test]
    fn sdo_round_trip_is_asynchronous() {
        let (tx, rx) = mpsc::channel();
        let link = SimLink::new_manual(&[0x77], tx);
        link.nmt(0x77, NmtCommand::ResetNode).unwrap();
        let _ = rx.try_recv();

        link.sdo_write(0x77, OdEntry::new(0x6081, 0), 4, 1_234).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            LinkEvent::SdoResult {
                node: 0x77,
                result: SdoResult::WriteOk
            }
        );

        link.sdo_read(0x77, OdEntry::new(0x6081, 0)).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            LinkEvent::SdoResult {
                node: 0x77,
                result: SdoResult::ReadOk(1_234)
            }
        );
    }

    #[test]
    fn unknown_node_aborts() {
        let (tx, rx) = mpsc::channel();
        let link = SimLink::new_manual(&[0x77], tx);
        link.sdo_read(0x50, OdEntry::new(0x6041, 0)).unwrap();
        match rx.try_recv().unwrap() {
            LinkEvent::SdoResult {
                node: 0x50,
                result: SdoResult::Aborted { receive: true, .. },
            } => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn ticker_emits_position_pdos_after_bootup() {
        let (tx, rx) = mpsc::channel();
        let link = SimLink::new_manual(&[0x77], tx);
        link.nmt(0, NmtCommand::ResetNode).unwrap();
        let _ = rx.try_recv();

        link.tick_once();
        let events: Vec<LinkEvent> = rx.try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, LinkEvent::PositionPdo { node: 0x77, .. })));
        // First tick always reports status (changed from the zero default).
        assert!(events
            .iter()
            .any(|e| matches!(e, LinkEvent::StatusPdo { node: 0x77, .. })));
    }

    #[test]
    fn sync_follows_configured_period() {
        let (tx, rx) = mpsc::channel();
        let link = SimLink::new_manual(&[0x77], tx);
        link.nmt(0, NmtCommand::ResetNode).unwrap();
        link.start_sync(Duration::from_millis(30)).unwrap();
        let _ = rx.try_recv();

        for _ in 0..6 {
            link.tick_once();
        }
        let syncs = rx.try_iter().filter(|e| matches!(e, LinkEvent::Sync)).count();
        assert_eq!(syncs, 2);
    }
}

//! The master event loop.
//!
//! One thread owns every per-node record, the queues and the sequencer.
//! Link traffic, operator commands and timer expiries all arrive as
//! [`MasterEvent`] messages on a single channel, so supervisory logic
//! never races itself; the only data shared with other threads (robot
//! state, position board, event bus) sits in [`Shared`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use alma_common::{
    EventKind, IpStatus, MasterConfig, NodeId, RobotState, StatusWord,
};
use alma_link::{Link, LinkEvent, SdoResult};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::motion::MotionQueue;
use crate::sequencer::{Compound, ExecError, Notify, Sequencer, Target};

/// Everything that can wake the master loop.
#[derive(Debug)]
pub enum MasterEvent {
    /// One operator line (stdin, argv, or a test driver).
    Command(String),
    /// Traffic from the link layer.
    Link(LinkEvent),
    /// The discovery window elapsed.
    DiscoverTimeout { expected: usize },
    /// SIGINT or equivalent.
    Shutdown,
}

/// Per-motor view shared with the telemetry writer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MotorSnapshot {
    pub position: i32,
    /// Samples currently parked in the drive FIFO.
    pub in_fifo: u16,
}

/// Positions collected between SYNC cycles.
#[derive(Debug, Default)]
pub struct PositionBoard {
    pub motors: BTreeMap<NodeId, MotorSnapshot>,
    written: BTreeSet<NodeId>,
    /// Incremented whenever every active motor has reported once.
    pub round: u64,
}

/// State shared across the master, telemetry and refiller threads.
pub struct Shared {
    pub robot_state: Mutex<RobotState>,
    pub events: EventBus,
    pub board: Mutex<PositionBoard>,
    pub position_ready: Condvar,
    pub verbose: AtomicBool,
}

impl Shared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            robot_state: Mutex::new(RobotState::default()),
            events: EventBus::new(),
            board: Mutex::new(PositionBoard::default()),
            position_ready: Condvar::new(),
            verbose: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> RobotState {
        *self.robot_state.lock()
    }
}

/// Per-motor tri-state used to detect motion edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Started {
    #[default]
    Idle,
    Running,
    Finalizing,
}

/// Last observed drive state for one node.
#[derive(Debug, Default)]
pub struct Motor {
    pub active: bool,
    pub status: StatusWord,
    pub ip_status: IpStatus,
    pub mode: u8,
    pub position: i32,
    pub started: Started,
    /// First interpolation activation still pending (as opposed to a
    /// resume after a stop).
    pub sim_first_start: bool,
    /// Primed and waiting for the coordinated start edge.
    pub simulation_ready: bool,
}

/// Names the higher-level operation a sequencer job belongs to; drives
/// completion handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTag {
    None,
    Configure,
    ExitFromLimit,
    Homing,
    /// A stop issued because a position-mode target was reached.
    PositionTarget,
    Stop,
    BusVoltage,
    Fault,
    Emergency,
    Release,
    SimInit,
    SimFinal,
    Diag(DiagOp),
}

/// Diagnostic primitives routed through the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagOp {
    ReadSdo,
    WriteSdo,
    Raw,
    Velocity,
    VelocitySet,
    Acceleration,
    FollowingError,
    Heart,
    OdWrite,
}

impl DiagOp {
    pub(crate) fn echo(self) -> &'static str {
        match self {
            Self::ReadSdo => "rsdo",
            Self::WriteSdo => "wsdo",
            Self::Raw => "sraw",
            Self::Velocity => "svel",
            Self::VelocitySet => "sVTS",
            Self::Acceleration => "sacc",
            Self::FollowingError => "sfol",
            Self::Heart => "shrt",
            Self::OdWrite => "PR5",
        }
    }
}

/// Motion queues keyed by node, shared with the telemetry writer.
pub type QueueMap = Arc<Mutex<BTreeMap<NodeId, MotionQueue>>>;

/// The control core.
pub struct Master {
    pub(crate) config: MasterConfig,
    pub(crate) fake: bool,
    pub(crate) link: Option<Arc<dyn Link>>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) motors: BTreeMap<NodeId, Motor>,
    pub(crate) queues: QueueMap,
    /// Queue bound to the streaming position pipe.
    pub(crate) stream_queue: MotionQueue,
    pub(crate) sequencer: Sequencer<JobTag>,
    pub(crate) homing_executed: bool,
    pub(crate) exit_from_limit_done: usize,
    pub(crate) release_done: usize,
    pub(crate) quit: Option<i32>,
    pub(crate) tx: Sender<MasterEvent>,
    pub(crate) replies: Option<Sender<String>>,
    pub(crate) telemetry_stop: Arc<AtomicBool>,
    pub(crate) telemetry: Option<std::thread::JoinHandle<()>>,
}

impl Master {
    pub fn new(config: MasterConfig, shared: Arc<Shared>, tx: Sender<MasterEvent>) -> Self {
        Self {
            config,
            fake: false,
            link: None,
            shared,
            motors: BTreeMap::new(),
            queues: Arc::new(Mutex::new(BTreeMap::new())),
            stream_queue: MotionQueue::new(alma_common::BROADCAST),
            sequencer: Sequencer::new(),
            homing_executed: false,
            exit_from_limit_done: 0,
            release_done: 0,
            quit: None,
            tx,
            replies: None,
            telemetry_stop: Arc::new(AtomicBool::new(false)),
            telemetry: None,
        }
    }

    /// Mirror every reply line to `tx` (used by the integration tests).
    pub fn subscribe_replies(&mut self, tx: Sender<String>) {
        self.replies = Some(tx);
    }

    pub fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// Install an already-running link (used by tests; `load#` builds the
    /// simulator itself).
    pub fn attach_link(&mut self, link: Arc<dyn Link>, fake: bool) {
        self.fake = fake;
        self.link = Some(link);
    }

    /// Consume events until quit. Returns the process exit code.
    pub fn run(&mut self, rx: Receiver<MasterEvent>) -> i32 {
        info!("master loop running");
        while self.quit.is_none() {
            let event = match rx.recv() {
                Ok(event) => event,
                Err(_) => break,
            };
            match event {
                MasterEvent::Command(line) => self.handle_command(&line),
                MasterEvent::Link(event) => self.on_link_event(event),
                MasterEvent::DiscoverTimeout { expected } => self.on_discover_timeout(expected),
                MasterEvent::Shutdown => self.quit = Some(0),
            }
        }
        self.teardown();
        self.quit.unwrap_or(0)
    }

    fn teardown(&mut self) {
        if let Some(link) = &self.link {
            link.stop_sync();
        }
        let queues: Vec<MotionQueue> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            queue.init();
        }
        self.telemetry_stop
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.shared.position_ready.notify_all();
        // The writer is not joined: it may still be blocked opening the
        // FIFO when no reader ever attached.
        self.telemetry.take();
        info!("master loop finished");
    }

    // ─── Replies ────────────────────────────────────────────────────

    pub(crate) fn emit(&self, line: String) {
        println!("{line}");
        use std::io::Write;
        let _ = std::io::stdout().flush();
        if let Some(tx) = &self.replies {
            let _ = tx.send(line);
        }
    }

    pub(crate) fn ok(&self, command: &str) {
        self.emit(format!("OK {command}"));
    }

    pub(crate) fn cerr(&self, command: &str, kind: EventKind) {
        self.emit(format!("CERR {command} {}", kind.code()));
    }

    /// Drain and print pending asynchronous events. Called at the start
    /// of every operator command.
    pub(crate) fn return_event(&self) {
        for event in self.shared.events.drain() {
            let mut line = format!("CERR M{} {}", event.node, event.kind.code());
            if let Some(detail) = &event.detail {
                line.push(' ');
                line.push_str(detail);
            }
            self.emit(line);
        }
    }

    // ─── State helpers ──────────────────────────────────────────────

    pub(crate) fn state(&self) -> RobotState {
        self.shared.state()
    }

    pub(crate) fn set_state(&self, state: RobotState) {
        let mut current = self.shared.robot_state.lock();
        if *current != state {
            debug!(from = %*current, to = %state, "supervisor transition");
            *current = state;
        }
    }

    pub(crate) fn active_nodes(&self) -> Vec<NodeId> {
        self.motors
            .iter()
            .filter(|(_, m)| m.active)
            .map(|(&n, _)| n)
            .collect()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.motors.values().filter(|m| m.active).count()
    }

    /// True when no motor is in motion or finalizing.
    pub(crate) fn all_idle(&self) -> bool {
        self.motors
            .values()
            .filter(|m| m.active)
            .all(|m| m.started == Started::Idle)
    }

    /// Reset one motor's motion bookkeeping after a stop.
    pub(crate) fn clear_motor(&mut self, node: NodeId) {
        if let Some(motor) = self.motors.get_mut(&node) {
            motor.started = Started::Idle;
            motor.sim_first_start = true;
            motor.simulation_ready = false;
        }
    }

    pub(crate) fn link(&self) -> Option<Arc<dyn Link>> {
        self.link.clone()
    }

    /// Cheap clone of one node's queue handle.
    pub(crate) fn queue_of(&self, node: NodeId) -> Option<MotionQueue> {
        self.queues.lock().get(&node).cloned()
    }

    /// Reset every queue, including the streaming one.
    pub(crate) fn reset_all_queues(&self) {
        let queues: Vec<MotionQueue> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            queue.init();
        }
        self.stream_queue.init();
    }

    // ─── Sequencer plumbing ─────────────────────────────────────────

    /// Run a job and dispatch whatever completed synchronously. Returns
    /// false when the job could not even be admitted.
    pub(crate) fn execute(
        &mut self,
        target: Target,
        tag: JobTag,
        compounds: &[&Compound],
        args: &[u32],
    ) -> bool {
        let Some(link) = self.link() else {
            warn!(?tag, "no link, job dropped");
            return false;
        };
        let active = self.active_nodes();
        match self
            .sequencer
            .execute(&*link, &active, target, tag, compounds, args)
        {
            Ok(notifications) => {
                self.dispatch(notifications);
                true
            }
            Err(ExecError::Busy(node)) => {
                debug!(node, ?tag, "node busy, job rejected");
                false
            }
            Err(error) => {
                warn!(%error, ?tag, "job rejected");
                false
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Bootup(node) => self.on_bootup(node),
            LinkEvent::SdoResult { node, result } => self.on_sdo_result(node, result),
            LinkEvent::StatusPdo {
                node,
                status,
                ip_status,
                mode,
            } => self.on_status_pdo(node, status, ip_status, mode),
            LinkEvent::PositionPdo { node, position } => self.on_position_pdo(node, position),
            LinkEvent::Sync => self.on_sync(),
            LinkEvent::HeartbeatLost(node) => {
                warn!(node, "heartbeat lost");
                self.shared.events.add(
                    EventKind::InternalError,
                    node,
                    false,
                    Some("heartbeat lost".to_string()),
                );
            }
            LinkEvent::EmergencyObject { node, error_code } => {
                warn!(node, error_code, "emergency object");
            }
        }
    }

    fn on_sdo_result(&mut self, node: NodeId, result: SdoResult) {
        let Some(link) = self.link() else { return };
        let notifications = self.sequencer.on_sdo_result(&*link, node, result);
        self.dispatch(notifications);
    }

    /// Record one position PDO and signal the telemetry writer when the
    /// basket is complete.
    fn on_position_pdo(&mut self, node: NodeId, position: i32) {
        if let Some(motor) = self.motors.get_mut(&node) {
            motor.position = position;
        }
        let active = self.active_count();
        if active == 0 {
            return;
        }
        let mut board = self.shared.board.lock();
        board.motors.entry(node).or_default().position = position;
        board.written.insert(node);
        if board.written.len() >= active {
            board.written.clear();
            board.round += 1;
            self.shared.position_ready.notify_all();
        }
    }

    pub(crate) fn update_board_fifo(&self, node: NodeId, in_fifo: u16) {
        let mut board = self.shared.board.lock();
        board.motors.entry(node).or_default().in_fifo = in_fifo;
    }

    /// Dispatch sequencer progress to the tag handlers.
    pub(crate) fn dispatch(&mut self, notifications: Vec<Notify<JobTag>>) {
        for notification in notifications {
            match notification {
                Notify::Read { node, tag, value } => self.on_job_read(node, tag, value),
                Notify::Done {
                    node,
                    tag,
                    result,
                    descriptor,
                } => {
                    if self.shared.verbose.load(std::sync::atomic::Ordering::Relaxed) {
                        match &result {
                            Ok(_) => self.emit(format!("SUCC[node {node:x}]: {descriptor}")),
                            Err(_) => self.emit(format!("ERR[node {node:x}]: {descriptor}")),
                        }
                    }
                    self.on_job_done(node, tag, result);
                }
            }
        }
    }
}

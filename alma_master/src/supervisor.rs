//! Robot supervisor.
//!
//! Gates every operator command against the global state, orchestrates
//! the multi-motor phases (discovery, homing, simulation, release, stop,
//! emergency, streaming free-move) and reacts to sequencer job
//! completions. All transitions out of a running state happen only once
//! every motor has settled.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use alma_common::{
    consts::{EXIT_FROM_LIMIT_COUNTS, ZERO_RETURN_ACCEL, ZERO_RETURN_VELOCITY},
    EventKind, NodeId, RobotState,
};
use alma_link::{Link, LinkEvent, NmtCommand, SimLink};
use tracing::{debug, info, warn};

use crate::master::{DiagOp, JobTag, Master, MasterEvent, Motor, Started};
use crate::motion::MotionQueue;
use crate::sequencer::{catalog, Compound, JobError, Step, Target};
use crate::shell::{parse_command, ShellCommand, HELP_TEXT};

/// SYNC-cycle divider for the status TPDO event timer.
const STATUS_EVENT_TIME: u32 = 15;
/// Event timer of the position TPDO, milliseconds.
const POSITION_EVENT_TIME: u32 = 10;
/// Event timer of the timestamp TPDO, SYNC cycles.
const TIMESTAMP_EVENT_TIME: u32 = 100;

impl Master {
    // ─── Operator commands ──────────────────────────────────────────

    pub(crate) fn handle_command(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.return_event();

        let command = match parse_command(line) {
            Ok(command) => command,
            Err(error) => {
                self.cerr(&error.echo, error.kind);
                return;
            }
        };
        debug!(?command, "operator command");

        match command {
            ShellCommand::Load { .. } => self.init_link(),
            ShellCommand::Fake => self.fake = true,
            ShellCommand::Verbose => {
                self.shared
                    .verbose
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                info!("verbose diagnostics enabled");
            }
            ShellCommand::Help => self.emit(HELP_TEXT.to_string()),
            ShellCommand::Quit => self.cmd_quit(),
            ShellCommand::Discover { expected } => self.cmd_discover(expected),
            ShellCommand::MoveTo {
                node,
                position,
                velocity,
                acceleration,
                start,
            } => self.cmd_move_to(node, position, velocity, acceleration, start),
            ShellCommand::Homing => self.cmd_homing(),
            ShellCommand::Recenter => self.cmd_recenter(),
            ShellCommand::Release => self.cmd_release(),
            ShellCommand::Simulate => self.cmd_simulate(),
            ShellCommand::StopSimulation => self.cmd_stop_simulation(),
            ShellCommand::Emergency => self.cmd_emergency(),
            ShellCommand::JoystickAttach => self.cmd_joystick_attach(),
            ShellCommand::FreeMoveStart => self.cmd_free_move("CB4"),
            ShellCommand::FreeMoveStream => self.cmd_free_move("CB7"),
            ShellCommand::FreeMoveStop => self.cmd_free_move_stop(),
            ShellCommand::PrintState => {
                let state = self.state();
                self.emit(format!("OK PR1: {}, {}", state.code(), state.name()));
            }
            ShellCommand::OdWrite {
                node,
                index,
                sub,
                size,
                value,
            } => self.cmd_od_write(node, index, sub, size, value),
            ShellCommand::ReadSdo { node, index, sub } => {
                let compound = Compound::ad_hoc(
                    "read_entry",
                    vec![Step::ReadOd {
                        index: u32::from(index),
                        sub: u32::from(sub),
                    }],
                );
                if !self.execute(
                    Target::Node(node),
                    JobTag::Diag(DiagOp::ReadSdo),
                    &[&compound],
                    &[],
                ) {
                    self.cerr("rsdo", EventKind::InternalError);
                }
            }
            ShellCommand::WriteSdo {
                node,
                index,
                sub,
                size,
                value,
            } => {
                let compound = Compound::ad_hoc(
                    "write_entry",
                    vec![Step::WriteOd {
                        index: u32::from(index),
                        sub: u32::from(sub),
                        size,
                        value,
                    }],
                );
                if !self.execute(
                    Target::Node(node),
                    JobTag::Diag(DiagOp::WriteSdo),
                    &[&compound],
                    &[],
                ) {
                    self.cerr("wsdo", EventKind::InternalError);
                }
            }
            ShellCommand::RawCommand { node, command, .. } => {
                let compound = Compound::ad_hoc("raw_command", raw_command_steps(&command));
                if !self.execute(
                    Target::Node(node),
                    JobTag::Diag(DiagOp::Raw),
                    &[&compound],
                    &[],
                ) {
                    self.cerr("sraw", EventKind::InternalError);
                }
            }
            ShellCommand::HomingDirect {
                node,
                offset,
                forward_velocity,
                backward_velocity,
            } => self.homing_direct(node, offset, forward_velocity, backward_velocity),
            ShellCommand::HeartStart { node, period_ms } => {
                if !self.execute(
                    Target::Node(node),
                    JobTag::Diag(DiagOp::Heart),
                    &[&catalog::HEART_START],
                    &[u32::from(period_ms)],
                ) {
                    self.cerr("shrt", EventKind::InternalError);
                }
            }
            ShellCommand::VelocityGet { node } => {
                self.diag_read(node, DiagOp::Velocity, &catalog::VELOCITY_GET);
            }
            ShellCommand::VelocitySet { node, velocity } => {
                if !self.execute(
                    Target::Node(node),
                    JobTag::Diag(DiagOp::VelocitySet),
                    &[&catalog::VELOCITY_SET],
                    &[velocity],
                ) {
                    self.cerr("sVTS", EventKind::InternalError);
                }
            }
            ShellCommand::AccelerationGet { node } => {
                self.diag_read(node, DiagOp::Acceleration, &catalog::ACCELERATION_GET);
            }
            ShellCommand::FollowingErrorGet { node } => {
                self.diag_read(node, DiagOp::FollowingError, &catalog::FOLLOWING_ERROR_GET);
            }
            ShellCommand::ZeroReturn { node } => {
                self.smart_position(
                    Target::Node(node),
                    0,
                    ZERO_RETURN_VELOCITY,
                    ZERO_RETURN_ACCEL,
                    true,
                    false,
                );
            }
            ShellCommand::SimulateDirect { node } => {
                self.simulation_start(Target::Node(node));
            }
        }
    }

    fn diag_read(&mut self, node: NodeId, op: DiagOp, compound: &Compound) {
        if !self.execute(Target::Node(node), JobTag::Diag(op), &[compound], &[]) {
            self.cerr(op.echo(), EventKind::InternalError);
        }
    }

    fn cmd_quit(&mut self) {
        if matches!(
            self.state(),
            RobotState::Emergency
                | RobotState::SearchingCenter
                | RobotState::Simulating
                | RobotState::Centering
        ) {
            self.cerr("CT6", EventKind::PermissionDenied);
            return;
        }
        self.ok("CT6");
        self.quit = Some(0);
    }

    /// `CT0 M<n>`: broadcast reset, then collect bootups for the
    /// discovery window.
    fn cmd_discover(&mut self, expected: usize) {
        let allowed = match self.state() {
            RobotState::Powered | RobotState::Emergency => true,
            RobotState::Released => !self.homing_executed,
            _ => false,
        };
        if !allowed {
            self.cerr("CT0", EventKind::PermissionDenied);
            return;
        }
        let Some(link) = self.link() else {
            self.cerr("CT0", EventKind::InternalError);
            return;
        };

        info!(expected, "discovery started");
        self.exit_from_limit_done = 0;
        if let Err(error) = link.nmt(alma_common::BROADCAST, NmtCommand::ResetNode) {
            warn!(%error, "discovery reset failed");
            self.cerr("CT0", EventKind::InternalError);
            return;
        }

        let tx = self.tx.clone();
        let window = Duration::from_millis(self.config.discover_timeout_ms);
        thread::Builder::new()
            .name("discover-timeout".into())
            .spawn(move || {
                thread::sleep(window);
                let _ = tx.send(MasterEvent::DiscoverTimeout { expected });
            })
            .ok();
    }

    /// A node finished booting inside (or outside) the discovery window.
    pub(crate) fn on_bootup(&mut self, node: NodeId) {
        info!(node, "bootup");
        self.sequencer.reset(node);
        let motor = self.motors.entry(node).or_insert_with(Motor::default);
        motor.started = Started::Idle;
        motor.sim_first_start = true;
        if !motor.active {
            motor.active = true;
        }
        let queue = self
            .queues
            .lock()
            .entry(node)
            .or_insert_with(|| MotionQueue::new(node))
            .clone();
        queue.init();

        let args = configure_args(node, u32::from(self.config.heartbeat_ms));
        self.execute(
            Target::Node(node),
            JobTag::Configure,
            &[
                &catalog::HEART_START,
                &catalog::MAP4_PDO, // TPDO1: node, status, IP status, mode
                &catalog::MAP2_PDO, // TPDO2: node, position
                &catalog::MAP1_PDO, // TPDO3: high-resolution timestamp
                &catalog::MAP2_PDO, // RPDO1: interpolation time record
                &catalog::MAP2_PDO, // RPDO2: profile velocity, target
                &catalog::MAP1_PDO, // RPDO3: interpolation data
                &catalog::MAP1_PDO, // RPDO4: broadcast control word
                &catalog::SMART_START,
            ],
            &args,
        );
    }

    /// The discovery window elapsed.
    pub(crate) fn on_discover_timeout(&mut self, expected: usize) {
        let found = self.active_count();
        if found != expected {
            warn!(found, expected, "discovery mismatch");
            self.cerr("CT0", EventKind::ConfigError);
            return;
        }
        info!(found, "discovery complete, checking limits");
        self.exit_from_limit_done = 0;
        for node in self.active_nodes() {
            let powered = self
                .motors
                .get(&node)
                .map(|m| m.status.powered())
                .unwrap_or(false);
            if !powered {
                warn!(node, "servo off, skipping limit check");
                continue;
            }
            self.execute(
                Target::Node(node),
                JobTag::ExitFromLimit,
                &[&catalog::SMART_LIMIT_ENABLE, &catalog::SMART_STATUSWORD],
                &[],
            );
        }
    }

    fn cmd_move_to(
        &mut self,
        node: NodeId,
        position: i32,
        velocity: u32,
        acceleration: u32,
        start: bool,
    ) {
        if !matches!(
            self.state(),
            RobotState::Centered | RobotState::Stopped | RobotState::PositionMove
        ) {
            self.cerr("CT1", EventKind::PermissionDenied);
            return;
        }
        let target = if node == 0 {
            Target::Broadcast
        } else {
            Target::Node(node)
        };
        self.smart_position(target, position, velocity, acceleration, start, false);
        self.set_state(RobotState::PositionMove);
    }

    /// Configure (and optionally begin) a point-to-point move. A motor
    /// already in a supervised move gets a rolling PDO update instead of
    /// a new compound.
    pub(crate) fn smart_position(
        &mut self,
        target: Target,
        position: i32,
        velocity: u32,
        acceleration: u32,
        start: bool,
        from_callback: bool,
    ) {
        let Some(link) = self.link() else { return };
        let nodes = match target {
            Target::Broadcast => self.active_nodes(),
            Target::Node(node) => vec![node],
        };

        // Latch a fresh setpoint fleet-wide before touching targets.
        link.image().set_control_word(0x2F);
        if let Err(error) = link.send_pdo_event() {
            warn!(%error, "cannot send setpoint latch");
        }

        for node in nodes {
            if let Some(motor) = self.motors.get_mut(&node) {
                motor.sim_first_start = true;
            }
            let started = self
                .motors
                .get(&node)
                .map(|m| m.started)
                .unwrap_or_default();
            if started == Started::Idle {
                if let Some(motor) = self.motors.get_mut(&node) {
                    motor.started = Started::Running;
                }
                if let Some(queue) = self.queue_of(node) {
                    queue.init();
                }
                let compounds: &[&Compound] = if start {
                    &[&catalog::SMART_POSITION_SET, &catalog::SMART_POSITION_START]
                } else {
                    &[&catalog::SMART_POSITION_SET]
                };
                self.execute(
                    Target::Node(node),
                    JobTag::None,
                    compounds,
                    &[acceleration, acceleration, velocity, position as u32],
                );
            } else {
                // Rolling update over RPDO2.
                link.image().set_target(node, velocity, position);
                if let Err(error) = link.send_pdo_event() {
                    warn!(node, %error, "cannot send target update");
                }
                if start {
                    link.image().set_control_word(0x3F);
                    if let Err(error) = link.send_pdo_event() {
                        warn!(node, %error, "cannot send motion start");
                    }
                }
            }
        }

        if !from_callback && !start {
            self.ok("CT1");
        }
    }

    /// `CT2 P1`: read homing parameters from every table and launch the
    /// homing compound fleet-wide.
    fn cmd_homing(&mut self) {
        if self.state() != RobotState::Initialized {
            self.cerr("CT2", EventKind::PermissionDenied);
            return;
        }

        let mut homings = Vec::new();
        for node in self.active_nodes() {
            let Some(queue) = self.queue_of(node) else {
                self.cerr("CT2", EventKind::InternalError);
                return;
            };
            queue.init();
            let path = self.config.table_path(node, self.fake);
            if let Err(error) = queue.fill_file(&path, &self.shared.events) {
                warn!(node, %error, "cannot open motion table");
                self.cerr("CT2", EventKind::FileError);
                return;
            }
            let Some(homing) = queue.homing() else {
                warn!(node, "table has no homing row");
                self.cerr("CT2", EventKind::ConfigError);
                return;
            };
            homings.push((node, homing));
        }

        info!("homing started");
        self.set_state(RobotState::SearchingCenter);
        for (node, homing) in homings {
            self.homing_direct(
                node,
                homing.offset,
                homing.forward_velocity,
                homing.backward_velocity,
            );
        }
    }

    /// Launch homing on one node (or broadcast for node 0).
    pub(crate) fn homing_direct(
        &mut self,
        node: NodeId,
        offset: i32,
        forward_velocity: u32,
        backward_velocity: u32,
    ) {
        let target = if node == 0 {
            Target::Broadcast
        } else {
            Target::Node(node)
        };
        let nodes = match target {
            Target::Broadcast => self.active_nodes(),
            Target::Node(n) => vec![n],
        };
        for n in nodes {
            if let Some(motor) = self.motors.get_mut(&n) {
                motor.started = Started::Running;
                motor.sim_first_start = true;
            }
        }
        self.exit_from_limit_done = 0;
        self.execute(
            target,
            JobTag::Homing,
            &[&catalog::SMART_HOMING],
            &[forward_velocity, backward_velocity, offset as u32],
        );
    }

    fn cmd_recenter(&mut self) {
        if self.state() != RobotState::Stopped {
            self.cerr("CT2", EventKind::PermissionDenied);
            return;
        }
        self.set_state(RobotState::Centering);
        self.smart_position(
            Target::Broadcast,
            0,
            ZERO_RETURN_VELOCITY,
            ZERO_RETURN_ACCEL,
            true,
            false,
        );
    }

    fn cmd_release(&mut self) {
        if !matches!(
            self.state(),
            RobotState::Initialized | RobotState::Centered | RobotState::Stopped
        ) {
            self.cerr("CT2", EventKind::PermissionDenied);
            return;
        }
        info!("releasing motors with brake engaged");
        self.release_done = 0;
        self.execute(
            Target::Broadcast,
            JobTag::Release,
            &[&catalog::SMART_LIMIT_ENABLE, &catalog::SMART_OFF],
            &[],
        );
    }

    /// Release without engaging the brake: hold the fleet in torque mode.
    #[allow(dead_code)]
    pub(crate) fn release_without_brake(&mut self) {
        self.release_done = 0;
        self.execute(
            Target::Broadcast,
            JobTag::Release,
            &[&catalog::SMART_LIMIT_DISABLE, &catalog::TORQUE],
            &[0],
        );
    }

    fn cmd_simulate(&mut self) {
        if self.state() != RobotState::Centered {
            self.cerr("CT4", EventKind::PermissionDenied);
            return;
        }
        if self.simulation_start(Target::Broadcast) {
            self.set_state(RobotState::Simulating);
        }
    }

    /// Reset and refill the queues, then prime interpolated-position mode
    /// on every target motor with its current position as seed.
    pub(crate) fn simulation_start(&mut self, target: Target) -> bool {
        let nodes = match target {
            Target::Broadcast => self.active_nodes(),
            Target::Node(node) => vec![node],
        };
        let streaming = self.state() == RobotState::FreeMove;

        for node in &nodes {
            let node = *node;
            if let Some(motor) = self.motors.get_mut(&node) {
                motor.simulation_ready = false;
            }
            if !streaming {
                let Some(queue) = self.queue_of(node) else {
                    self.cerr("CT4", EventKind::InternalError);
                    return false;
                };
                queue.init();
                let path = self.config.table_path(node, self.fake);
                if let Err(error) = queue.fill_file(&path, &self.shared.events) {
                    warn!(node, %error, "cannot open motion table");
                    self.cerr("CT4", EventKind::FileError);
                    return false;
                }
            }

            let position = self.motors.get(&node).map(|m| m.position).unwrap_or(0);
            let first = self
                .motors
                .get(&node)
                .map(|m| m.sim_first_start)
                .unwrap_or(true);
            let compound = if first {
                if let Some(motor) = self.motors.get_mut(&node) {
                    motor.sim_first_start = false;
                }
                &catalog::INIT_INTERPOLATION
            } else {
                &catalog::RESUME_INTERPOLATION
            };
            self.execute(
                Target::Node(node),
                JobTag::SimInit,
                &[compound],
                &[position as u32],
            );
        }
        true
    }

    fn cmd_stop_simulation(&mut self) {
        let allowed = match self.state() {
            RobotState::Simulating => true,
            RobotState::Released => self.homing_executed,
            _ => false,
        };
        if !allowed {
            self.cerr("CT5", EventKind::PermissionDenied);
            return;
        }
        self.execute(Target::Broadcast, JobTag::Stop, &[&catalog::SMART_STOP], &[]);
    }

    fn cmd_emergency(&mut self) {
        if matches!(self.state(), RobotState::Emergency | RobotState::Powered) {
            self.cerr("EM2", EventKind::PermissionDenied);
            return;
        }
        warn!("emergency stop");
        self.execute(
            Target::Broadcast,
            JobTag::Emergency,
            &[&catalog::SMART_LIMIT_DISABLE, &catalog::SMART_STOP],
            &[],
        );
    }

    fn cmd_joystick_attach(&mut self) {
        if !matches!(
            self.state(),
            RobotState::Stopped | RobotState::Initialized | RobotState::Centered
        ) {
            self.cerr("CB3", EventKind::PermissionDenied);
            return;
        }
        self.stream_queue.init();
        let path = self.config.pipe_path(self.fake).to_path_buf();
        self.stream_queue.fill_stream(&path, &self.shared.events);
        self.set_state(RobotState::JoystickAttached);
        self.ok("CB3");
    }

    fn cmd_free_move(&mut self, echo: &str) {
        if self.state() != RobotState::JoystickAttached {
            self.cerr(echo, EventKind::PermissionDenied);
            return;
        }
        self.set_state(RobotState::FreeMove);
        self.ok(echo);
    }

    fn cmd_free_move_stop(&mut self) {
        if self.state() != RobotState::FreeMove {
            self.cerr("CB5", EventKind::PermissionDenied);
            return;
        }
        self.execute(Target::Broadcast, JobTag::Stop, &[&catalog::SMART_STOP], &[]);
    }

    fn cmd_od_write(&mut self, node: NodeId, index: u16, sub: u8, size: u8, value: u32) {
        if matches!(
            self.state(),
            RobotState::SearchingCenter
                | RobotState::Simulating
                | RobotState::Centering
                | RobotState::PositionMove
                | RobotState::Powered
        ) {
            self.cerr("PR5", EventKind::PermissionDenied);
            return;
        }
        if node == 0 {
            self.cerr("PR5", EventKind::PermissionDenied);
            return;
        }
        let compound = Compound::ad_hoc(
            "od_write",
            vec![Step::WriteOd {
                index: u32::from(index),
                sub: u32::from(sub),
                size,
                value,
            }],
        );
        if !self.execute(
            Target::Node(node),
            JobTag::Diag(DiagOp::OdWrite),
            &[&compound],
            &[],
        ) {
            self.cerr("PR5", EventKind::InternalError);
        }
    }

    /// Per-SYNC streaming: forward each latched position sample as a
    /// rolling move with the configured stream acceleration.
    pub(crate) fn on_sync(&mut self) {
        if self.state() != RobotState::FreeMove {
            return;
        }
        let acceleration = self.config.stream_acceleration;
        for (node, sample) in self.stream_queue.take_stream() {
            if !self.motors.get(&node).map(|m| m.active).unwrap_or(false) {
                continue;
            }
            self.smart_position(
                Target::Node(node),
                sample.position,
                sample.velocity,
                acceleration,
                sample.start,
                true,
            );
        }
    }

    // ─── Link bring-up ──────────────────────────────────────────────

    /// `load#…`: bring the link up. Only the simulator backend is
    /// compiled in; without `fake` this is a fatal initialisation error.
    fn init_link(&mut self) {
        if self.link.is_some() {
            self.ok("load");
            return;
        }
        if !self.fake {
            warn!("no hardware CAN backend available");
            self.cerr("load", EventKind::ConfigError);
            self.quit = Some(2);
            return;
        }

        let (link_tx, link_rx) = mpsc::channel::<LinkEvent>();
        let link = SimLink::new(&self.config.fake_nodes, link_tx);
        let forward = self.tx.clone();
        thread::Builder::new()
            .name("link-events".into())
            .spawn(move || {
                for event in link_rx {
                    if forward.send(MasterEvent::Link(event)).is_err() {
                        break;
                    }
                }
            })
            .ok();

        if let Err(error) = link.start_sync(Duration::from_millis(self.config.sync_period_ms)) {
            warn!(%error, "cannot start SYNC");
            self.cerr("load", EventKind::InternalError);
            self.quit = Some(2);
            return;
        }
        let link: Arc<dyn alma_link::Link> = link;
        self.link = Some(link);
        self.start_telemetry();
        info!("simulated link initialised");
        self.ok("load");
    }

    /// Spawn the telemetry writer (idempotent).
    pub fn start_telemetry(&mut self) {
        if self.telemetry.is_some() {
            return;
        }
        let path = self.config.pipe_path(self.fake).to_path_buf();
        let handle = crate::telemetry::spawn(
            Arc::clone(&self.shared),
            Arc::clone(&self.queues),
            path,
            Arc::clone(&self.telemetry_stop),
        );
        self.telemetry = Some(handle);
    }

    // ─── Job completions ────────────────────────────────────────────

    /// A READ step completed mid-job.
    pub(crate) fn on_job_read(&mut self, node: NodeId, tag: JobTag, value: u64) {
        if tag == JobTag::Fault {
            self.decode_fault_bits(node, value);
        }
    }

    /// A job drained or died.
    pub(crate) fn on_job_done(
        &mut self,
        node: NodeId,
        tag: JobTag,
        result: Result<u64, JobError>,
    ) {
        match tag {
            JobTag::None => {
                if let Err(error) = result {
                    warn!(node, %error, "untagged job failed");
                }
            }
            JobTag::Configure => match result {
                Ok(_) => self.emit(format!("@M A{node}")),
                Err(error) => {
                    warn!(node, %error, "node configuration failed");
                    self.cerr("CT0", EventKind::InternalError);
                }
            },
            JobTag::ExitFromLimit => self.on_exit_from_limit_done(node, result),
            JobTag::Homing => {
                if result.is_err()
                    && matches!(
                        self.state(),
                        RobotState::Initialized | RobotState::SearchingCenter
                    )
                {
                    self.cerr("CT2", EventKind::InternalError);
                }
            }
            JobTag::PositionTarget => self.on_position_target_done(node, result),
            JobTag::Stop | JobTag::Fault => self.on_stop_done(node, result),
            JobTag::BusVoltage => {
                self.clear_motor(node);
                if self.all_idle() {
                    self.set_state(RobotState::Emergency);
                }
            }
            JobTag::Emergency => self.on_emergency_done(node, result),
            JobTag::Release => match result {
                Ok(_) => {
                    self.release_done += 1;
                    if self.release_done >= self.active_count() {
                        self.release_done = 0;
                        self.ok("CT2");
                        self.set_state(RobotState::Released);
                    }
                }
                Err(error) => {
                    warn!(node, %error, "release failed");
                    self.cerr("CT2", EventKind::InternalError);
                }
            },
            JobTag::SimInit => {
                if let Err(error) = result {
                    warn!(node, %error, "interpolation priming failed");
                    self.cerr("CT4", EventKind::InternalError);
                }
            }
            JobTag::SimFinal => {
                if let Err(error) = result {
                    warn!(node, %error, "trajectory closure failed");
                    self.cerr("CT4", EventKind::InternalError);
                }
            }
            JobTag::Diag(op) => match result {
                Ok(value) => match op {
                    DiagOp::ReadSdo => self.emit(format!("OK rsdo M{node} {value:X}")),
                    DiagOp::Velocity | DiagOp::Acceleration | DiagOp::FollowingError => {
                        self.emit(format!("OK {} M{node} {value}", op.echo()));
                    }
                    _ => self.ok(op.echo()),
                },
                Err(error) => {
                    warn!(node, %error, "diagnostic failed");
                    self.cerr(op.echo(), EventKind::InternalError);
                }
            },
        }
    }

    /// Discovery limit check finished on one node: drive away from an
    /// active limit, or count the node as ready.
    fn on_exit_from_limit_done(&mut self, node: NodeId, result: Result<u64, JobError>) {
        let extended = match result {
            Ok(value) => value,
            Err(error) => {
                warn!(node, %error, "limit check failed");
                self.cerr("CT0", EventKind::InternalError);
                return;
            }
        };

        if extended & 0x4000 != 0 {
            info!(node, "right limit active, backing away");
            self.execute(
                Target::Node(node),
                JobTag::None,
                &[&catalog::SMART_POSITION_SET, &catalog::SMART_POSITION_START],
                &[
                    ZERO_RETURN_ACCEL,
                    ZERO_RETURN_ACCEL,
                    100_000,
                    (-EXIT_FROM_LIMIT_COUNTS) as u32,
                ],
            );
            return;
        }
        if extended & 0x8000 != 0 {
            info!(node, "left limit active, backing away");
            self.execute(
                Target::Node(node),
                JobTag::None,
                &[&catalog::SMART_POSITION_SET, &catalog::SMART_POSITION_START],
                &[
                    ZERO_RETURN_ACCEL,
                    ZERO_RETURN_ACCEL,
                    100_000,
                    EXIT_FROM_LIMIT_COUNTS as u32,
                ],
            );
            return;
        }

        self.exit_from_limit_done += 1;
        if self.exit_from_limit_done >= self.active_count() {
            self.exit_from_limit_done = 0;
            self.homing_executed = false;
            self.set_state(RobotState::Initialized);
            self.ok("CT0");
        }
    }

    /// A stop issued on target-reached completed: settle the motor and,
    /// once the fleet is quiet, move the supervisor along.
    fn on_position_target_done(&mut self, node: NodeId, result: Result<u64, JobError>) {
        if result.is_err() {
            return;
        }
        if let Some(motor) = self.motors.get_mut(&node) {
            motor.started = Started::Idle;
        }
        if !self.all_idle() {
            return;
        }
        match self.state() {
            RobotState::SearchingCenter | RobotState::Centering => {
                if self.state() == RobotState::SearchingCenter {
                    self.homing_executed = true;
                }
                self.set_state(RobotState::Centered);
                self.ok("CT2");
            }
            RobotState::Powered | RobotState::Emergency | RobotState::Released => {
                self.homing_executed = false;
                self.exit_from_limit_done = 0;
                self.set_state(RobotState::Initialized);
                self.ok("CT0");
            }
            RobotState::PositionMove => {
                self.set_state(RobotState::Stopped);
                self.ok("CT1");
            }
            _ => {}
        }
    }

    /// A commanded stop (or fault stop) completed on one node.
    fn on_stop_done(&mut self, node: NodeId, result: Result<u64, JobError>) {
        if let Err(error) = result {
            warn!(node, %error, "stop failed");
            match self.state() {
                RobotState::Simulating => self.cerr("CT5", EventKind::InternalError),
                RobotState::Initialized => self.cerr("CT2", EventKind::InternalError),
                RobotState::FreeMove => self.cerr("CB5", EventKind::SimulationError),
                _ => self
                    .shared
                    .events
                    .add(EventKind::InternalError, node, false, None),
            }
            return;
        }

        self.clear_motor(node);
        if self.state() == RobotState::Simulating {
            self.push_hold_point(node);
        }
        if !self.all_idle() {
            return;
        }

        self.reset_all_queues();
        match self.state() {
            RobotState::Simulating => {
                self.cerr("CT4", EventKind::SimulationError);
                self.ok("CT5");
                self.set_state(RobotState::Stopped);
            }
            RobotState::FreeMove => {
                self.cerr("CB7", EventKind::SimulationError);
                self.ok("CB5");
                self.set_state(RobotState::Stopped);
            }
            RobotState::Released => {
                self.set_state(RobotState::Stopped);
            }
            _ => {}
        }
    }

    /// Emergency chain completed on one node.
    fn on_emergency_done(&mut self, node: NodeId, result: Result<u64, JobError>) {
        if let Err(error) = result {
            warn!(node, %error, "emergency stop failed");
            self.cerr("EM2", EventKind::InternalError);
            return;
        }

        self.clear_motor(node);
        if self.state() == RobotState::Simulating {
            self.push_hold_point(node);
        }
        if !self.all_idle() {
            return;
        }

        self.reset_all_queues();
        if self.state() == RobotState::Simulating {
            self.cerr("CT4", EventKind::SimulationError);
        }
        if self.state() != RobotState::Emergency {
            self.set_state(RobotState::Emergency);
            self.ok("EM2");
        }
    }

    /// Extended status register read during a fault: translate the drive
    /// fault bits into events.
    fn decode_fault_bits(&mut self, node: NodeId, value: u64) {
        let released = self.state() == RobotState::Released;
        let faults: &[(u64, EventKind)] = &[
            (0x0008, EventKind::BusVoltageFault),
            (0x0010, EventKind::OverCurrentFault),
            (0x0020, EventKind::TemperatureFault),
            (0x0040, EventKind::PositionFault),
            (0x0080, EventKind::VelocityFault),
            (0x0200, EventKind::DerivativeFault),
        ];
        for &(mask, kind) in faults {
            if value & mask != 0 {
                self.shared.events.add(kind, node, false, None);
            }
        }
        if value & 0x1000 != 0 {
            self.shared
                .events
                .add(EventKind::RightLimitFault, node, released, None);
        } else if value & 0x2000 != 0 {
            self.shared
                .events
                .add(EventKind::LeftLimitFault, node, false, None);
        }
    }
}

/// Write an ASCII drive command to the raw-command object in 4-byte
/// little-endian chunks, NUL-terminated.
fn raw_command_steps(command: &str) -> Vec<Step> {
    let mut bytes = command.as_bytes().to_vec();
    bytes.push(0);
    bytes
        .chunks(4)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            Step::WriteOd {
                index: 0x2500,
                sub: 1,
                size: chunk.len() as u8,
                value: u32::from_le_bytes(word),
            }
        })
        .collect()
}

/// The 97-value argument vector of the discovery mapping chain: the
/// heartbeat period, then comm/map addresses, COB-IDs, mapping objects,
/// transmission types and event times for TPDO1-3 and RPDO1-4.
fn configure_args(node: NodeId, heartbeat_ms: u32) -> Vec<u32> {
    let node = u32::from(node);
    vec![
        heartbeat_ms,
        // TPDO1 (COB-ID 0x180): node id, status word, IP status, mode display.
        0x1800,
        0xC000_0180,
        0x1A00,
        0x1A00,
        0x2000_0008,
        0x1A00,
        0x6041_0010,
        0x1A00,
        0x2400_0010,
        0x1A00,
        0x6061_0008,
        0x1A00,
        0x1800,
        0x4000_0180,
        0x1800,
        STATUS_EVENT_TIME,
        0x1800,
        0,
        // TPDO2 (COB-ID 0x280): node id, position actual.
        0x1801,
        0xC000_0280,
        0x1A01,
        0x1A01,
        0x2000_0008,
        0x1A01,
        0x6063_0020,
        0x1A01,
        0x1801,
        0x4000_0280,
        0x1801,
        0xFE,
        0x1801,
        POSITION_EVENT_TIME,
        // TPDO3 (COB-ID 0x380): high-resolution timestamp.
        0x1802,
        0xC000_0380,
        0x1A02,
        0x1A02,
        0x1013_0020,
        0x1A02,
        0x1802,
        0x4000_0380,
        0x1802,
        TIMESTAMP_EVENT_TIME,
        0x1802,
        0,
        // RPDO1 (COB-ID 0x200+node): interpolation time index + units.
        0x1400,
        0xC000_0200 + node,
        0x1600,
        0x1600,
        0x60C2_0208,
        0x1600,
        0x60C2_0108,
        0x1600,
        0x1400,
        0x4000_0200 + node,
        0x1400,
        0xFE,
        0x1400,
        0,
        // RPDO2 (COB-ID 0x300+node): profile velocity + target position.
        0x1401,
        0xC000_0300 + node,
        0x1601,
        0x1601,
        0x6081_0020,
        0x1601,
        0x607A_0020,
        0x1601,
        0x1401,
        0x4000_0300 + node,
        0x1401,
        0xFE,
        0x1401,
        0,
        // RPDO3 (COB-ID 0x400+node): interpolation data.
        0x1402,
        0xC000_0400 + node,
        0x1602,
        0x1602,
        0x60C1_0120,
        0x1602,
        0x1402,
        0x4000_0400 + node,
        0x1402,
        0xFE,
        0x1402,
        0,
        // RPDO4 (COB-ID 0x400, broadcast): control word.
        0x1403,
        0xC000_0400,
        0x1603,
        0x1603,
        0x6040_0010,
        0x1603,
        0x1403,
        0x4000_0400,
        0x1403,
        0xFE,
        0x1403,
        0,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_args_fill_the_mapping_chain() {
        let args = configure_args(0x77, 100);
        assert_eq!(args.len(), 97);
        // Holes across the chain: heart(1) + map4(18) + map2(14) + map1(12)
        // + map2(14) + map2(14) + map1(12) + map1(12).
        let holes = catalog::HEART_START.hole_count()
            + catalog::MAP4_PDO.hole_count()
            + catalog::MAP2_PDO.hole_count()
            + catalog::MAP1_PDO.hole_count()
            + catalog::MAP2_PDO.hole_count() * 2
            + catalog::MAP1_PDO.hole_count() * 2
            + catalog::SMART_START.hole_count();
        assert_eq!(holes, args.len());
        // RPDO COB-IDs embed the node id.
        assert!(args.contains(&(0xC000_0200 + 0x77)));
        assert!(args.contains(&(0xC000_0400 + 0x77)));
    }

    #[test]
    fn raw_command_is_chunked_and_terminated() {
        let steps = raw_command_steps("RMODE");
        // "RMODE\0" = 6 bytes → two chunks.
        assert_eq!(steps.len(), 2);
        match steps[0] {
            Step::WriteOd {
                index: 0x2500,
                sub: 1,
                size: 4,
                value,
            } => assert_eq!(value, u32::from_le_bytes(*b"RMOD")),
            ref other => panic!("unexpected step {other:?}"),
        }
        match steps[1] {
            Step::WriteOd { size: 2, value, .. } => {
                assert_eq!(value, u32::from_le_bytes([b'E', 0, 0, 0]));
            }
            ref other => panic!("unexpected step {other:?}"),
        }
    }
}

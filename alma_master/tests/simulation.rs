//! End-to-end scenarios through the simulated drive fleet.
//!
//! Each test builds a full master (event loop, queues, telemetry) wired
//! to a `SimLink`, scripts operator commands, and observes the shared
//! supervisor state, the reply stream and the telemetry sink.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use alma_common::{EventKind, MasterConfig, RobotState};
use alma_link::{Link, LinkEvent, SimLink};
use alma_master::{Master, MasterEvent, Shared};

const NODE: u8 = 0x77; // 119

struct Harness {
    tx: Sender<MasterEvent>,
    shared: Arc<Shared>,
    replies: Receiver<String>,
    link: Arc<SimLink>,
    telemetry_path: PathBuf,
    stream_path: PathBuf,
    _dir: tempfile::TempDir,
    runner: Option<thread::JoinHandle<i32>>,
    seen: Vec<String>,
}

impl Harness {
    fn new(table_rows: &[&str]) -> Self {
        Self::build(table_rows, false)
    }

    /// With `use_stream`, the operator pipe points at a prepared stream
    /// file and the telemetry writer stays off (in production both ends
    /// share one FIFO; with plain files they have to be kept apart).
    fn build(table_rows: &[&str], use_stream: bool) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let tables_dir = dir.path().join("tables");
        fs::create_dir(&tables_dir).expect("tables dir");
        let telemetry_path = dir.path().join("telemetry.out");
        let stream_path = dir.path().join("stream.in");
        fs::write(&stream_path, b"").expect("stream file");

        let table = tables_dir.join(format!("{NODE}.mot"));
        fs::write(&table, table_rows.join("\n") + "\n").expect("motion table");

        let pipe = if use_stream {
            stream_path.clone()
        } else {
            telemetry_path.clone()
        };
        let mut config = MasterConfig::default();
        config.tables_dir = tables_dir;
        config.fake_table_suffix = String::new();
        config.stream_pipe = pipe.clone();
        config.fake_stream_pipe = pipe;
        config.discover_timeout_ms = 200;
        config.sync_period_ms = 50;
        config.fake_nodes = vec![NODE];

        let (tx, rx) = mpsc::channel::<MasterEvent>();
        let shared = Shared::new();
        let mut master = Master::new(config, Arc::clone(&shared), tx.clone());

        // Wire the simulator straight into the master channel.
        let (link_tx, link_rx) = mpsc::channel::<LinkEvent>();
        let link = SimLink::new(&[NODE], link_tx);
        {
            let forward = tx.clone();
            thread::spawn(move || {
                for event in link_rx {
                    if forward.send(MasterEvent::Link(event)).is_err() {
                        break;
                    }
                }
            });
        }
        link.start_sync(Duration::from_millis(50)).expect("sync");
        master.attach_link(Arc::clone(&link) as Arc<dyn Link>, true);
        if !use_stream {
            master.start_telemetry();
        }

        let (reply_tx, replies) = mpsc::channel();
        master.subscribe_replies(reply_tx);

        let runner = thread::Builder::new()
            .name("master-loop".into())
            .spawn(move || master.run(rx))
            .expect("spawn master loop");

        Self {
            tx,
            shared,
            replies,
            link,
            telemetry_path,
            stream_path,
            _dir: dir,
            runner: Some(runner),
            seen: Vec::new(),
        }
    }

    fn command(&self, line: &str) {
        self.tx
            .send(MasterEvent::Command(line.to_string()))
            .expect("command");
    }

    fn wait_state(&self, state: RobotState, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.shared.state() == state {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!(
            "state never became {state:?}, stuck at {:?}",
            self.shared.state()
        );
    }

    /// Wait for a reply line containing `needle`.
    fn wait_reply(&mut self, needle: &str, timeout: Duration) {
        if self.seen.iter().any(|l| l.contains(needle)) {
            return;
        }
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.replies.recv_timeout(Duration::from_millis(50)) {
                Ok(line) => {
                    let hit = line.contains(needle);
                    self.seen.push(line);
                    if hit {
                        return;
                    }
                }
                Err(_) => {}
            }
        }
        panic!("no reply containing {needle:?}; saw {:?}", self.seen);
    }

    fn wait_telemetry(&self, needle: &str, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(content) = fs::read_to_string(&self.telemetry_path) {
                if content.lines().any(|l| l.contains(needle)) {
                    return;
                }
            }
            thread::sleep(Duration::from_millis(25));
        }
        let content = fs::read_to_string(&self.telemetry_path).unwrap_or_default();
        panic!("telemetry never contained {needle:?}; got:\n{content}");
    }

    /// Discover the single-node fleet and wait for INITIALIZED.
    fn bring_up(&mut self) {
        self.command("load#libcanfestival_can_socket.so,0,1M,8");
        self.command("CT0 M1");
        self.wait_state(RobotState::Initialized, Duration::from_secs(5));
        self.wait_reply("OK CT0", Duration::from_secs(1));
    }

    /// Home the fleet and wait for CENTERED.
    fn home(&mut self) {
        self.command("CT2 P1");
        self.wait_state(RobotState::Centered, Duration::from_secs(5));
        self.wait_reply("OK CT2", Duration::from_secs(1));
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.tx.send(MasterEvent::Shutdown);
        if let Some(runner) = self.runner.take() {
            let _ = runner.join();
        }
        self.link.shutdown();
    }
}

const HOMING_ROW: &str = "CT1 M119 H2000 VF10000 VB10000";

#[test]
fn cold_start_discovers_single_motor() {
    let mut harness = Harness::new(&[HOMING_ROW]);
    harness.command("load#libcanfestival_can_socket.so,0,1M,8");
    harness.command("CT0 M1");

    harness.wait_reply("@M A119", Duration::from_secs(2));
    harness.wait_state(RobotState::Initialized, Duration::from_secs(5));
    harness.wait_reply("OK CT0", Duration::from_secs(1));

    // Telemetry reports position zero and the INITIALIZED state.
    harness.wait_telemetry("@M119 S0", Duration::from_secs(3));
    harness.wait_telemetry("AS4", Duration::from_secs(3));
}

#[test]
fn discovery_mismatch_is_a_config_error() {
    let mut harness = Harness::new(&[HOMING_ROW]);
    harness.command("load#libcanfestival_can_socket.so,0,1M,8");
    harness.command("CT0 M3");

    harness.wait_reply(
        &format!("CERR CT0 {}", EventKind::ConfigError.code()),
        Duration::from_secs(3),
    );
    assert_ne!(harness.shared.state(), RobotState::Initialized);
}

#[test]
fn homing_and_recenter_end_centered() {
    let mut harness = Harness::new(&[HOMING_ROW, "CT1 M119 S1000 T100", "CT1 M119 S0 T100"]);
    harness.bring_up();
    harness.home();
    assert_eq!(harness.shared.state(), RobotState::Centered);

    // A short supervised move, then return to the center.
    harness.command("CT1 M119 P2000 VM100000 AM10 1");
    harness.wait_state(RobotState::Stopped, Duration::from_secs(5));
    harness.wait_reply("OK CT1", Duration::from_secs(1));

    harness.command("CT2 P2");
    harness.wait_state(RobotState::Centered, Duration::from_secs(5));
}

#[test]
fn two_point_simulation_runs_to_completion() {
    let mut harness = Harness::new(&[HOMING_ROW, "CT1 M119 S1000 T100", "CT1 M119 S0 T100"]);
    harness.bring_up();
    harness.home();

    harness.command("CT4");
    harness.wait_state(RobotState::Simulating, Duration::from_secs(2));
    harness.wait_state(RobotState::Stopped, Duration::from_secs(10));
    harness.wait_reply("OK CT4", Duration::from_secs(1));

    // The trajectory ends at the final table position with everything
    // consumed.
    harness.wait_telemetry("C100", Duration::from_secs(3));
    let board = harness.shared.board.lock();
    assert_eq!(board.motors[&NODE].position, 0);
}

#[test]
fn fifo_underflow_aborts_simulation() {
    // A long table keeps the simulation running while the fault lands.
    let mut rows = vec![HOMING_ROW.to_string()];
    for i in 0..200 {
        rows.push(format!("CT1 M119 S{} T100", (i % 20) * 50));
    }
    let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
    let mut harness = Harness::new(&refs);
    harness.bring_up();
    harness.home();

    harness.command("CT4");
    harness.wait_state(RobotState::Simulating, Duration::from_secs(2));
    thread::sleep(Duration::from_millis(300));

    harness
        .link
        .with_motor(NODE, |m| m.inject_ip_flags(0x4000))
        .expect("motor");

    harness.wait_reply(
        &format!("CERR CT4 {}", EventKind::SimulationError.code()),
        Duration::from_secs(5),
    );
    harness.wait_reply("OK CT5", Duration::from_secs(1));
    harness.wait_state(RobotState::Stopped, Duration::from_secs(2));

    let events = harness.shared.events.drain();
    assert!(
        events
            .iter()
            .any(|e| e.kind == EventKind::InterpFifoUnderError && e.node == NODE),
        "events were {events:?}"
    );
}

#[test]
fn emergency_during_position_move() {
    let mut harness = Harness::new(&[HOMING_ROW]);
    harness.bring_up();
    harness.home();

    // A slow far move keeps the motor running when EM2 arrives.
    harness.command("CT1 M119 P500000 VM10000 AM10 1");
    harness.wait_state(RobotState::PositionMove, Duration::from_secs(2));

    harness.command("EM2");
    harness.wait_reply("OK EM2", Duration::from_secs(5));
    harness.wait_state(RobotState::Emergency, Duration::from_secs(1));

    // Motion commands are rejected until re-initialisation.
    harness.command("CT1 M119 P0 VM1000 AM10");
    harness.wait_reply(
        &format!("CERR CT1 {}", EventKind::PermissionDenied.code()),
        Duration::from_secs(2),
    );
}

#[test]
fn malformed_motion_row_raises_file_error() {
    let mut harness = Harness::new(&[
        HOMING_ROW,
        "CT1 M119 S1000 T100",
        "CT1 M119 S T50",
        "CT1 M119 S0 T100",
    ]);
    harness.bring_up();
    harness.command("CT2 P1");
    harness.wait_state(RobotState::Centered, Duration::from_secs(5));

    // The pending event turns the telemetry state field into AS0.
    harness.wait_telemetry("AS0", Duration::from_secs(3));

    // The next command drains the event queue.
    harness.command("PR1");
    harness.wait_reply(
        &format!("CERR M119 {} linea 3", EventKind::FileError.code()),
        Duration::from_secs(2),
    );
    harness.wait_reply("OK PR1", Duration::from_secs(1));
}

#[test]
fn stop_from_released_requires_prior_homing() {
    let mut harness = Harness::new(&[HOMING_ROW]);
    harness.bring_up();

    // Release straight after discovery: no homing yet.
    harness.command("CT2 P3");
    harness.wait_state(RobotState::Released, Duration::from_secs(5));

    harness.command("CT5");
    harness.wait_reply(
        &format!("CERR CT5 {}", EventKind::PermissionDenied.code()),
        Duration::from_secs(2),
    );

    // Re-discover (allowed while released without homing), home, release
    // again: now CT5 passes and settles in STOPPED.
    harness.command("CT0 M1");
    harness.wait_state(RobotState::Initialized, Duration::from_secs(5));
    harness.home();
    harness.command("CT2 P3");
    harness.wait_state(RobotState::Released, Duration::from_secs(5));

    harness.command("CT5");
    harness.wait_state(RobotState::Stopped, Duration::from_secs(5));
}

#[test]
fn quit_rejected_while_running() {
    let mut harness = Harness::new(&[HOMING_ROW, "CT1 M119 S1000 T1000", "CT1 M119 S0 T1000"]);
    harness.bring_up();
    harness.home();
    harness.command("CT4");
    harness.wait_state(RobotState::Simulating, Duration::from_secs(2));

    harness.command("CT6");
    harness.wait_reply(
        &format!("CERR CT6 {}", EventKind::PermissionDenied.code()),
        Duration::from_secs(2),
    );
}

#[test]
fn streamed_free_move_follows_the_pipe() {
    let mut harness = Harness::build(&[HOMING_ROW], true);
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&harness.stream_path)
            .unwrap();
        writeln!(file, "CT1 M119 P4000 VM200000 AM100 1").unwrap();
    }
    harness.bring_up();

    harness.command("CB3");
    harness.wait_reply("OK CB3", Duration::from_secs(2));
    harness.wait_state(RobotState::JoystickAttached, Duration::from_secs(1));

    harness.command("CB4");
    harness.wait_reply("OK CB4", Duration::from_secs(1));
    harness.wait_state(RobotState::FreeMove, Duration::from_secs(1));

    // The latched sample turns into a rolling move on the next SYNC.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let position = harness.shared.board.lock().motors[&NODE].position;
        if position == 4000 {
            break;
        }
        assert!(Instant::now() < deadline, "motor never reached 4000, at {position}");
        thread::sleep(Duration::from_millis(20));
    }

    harness.command("CB5");
    harness.wait_reply("OK CB5", Duration::from_secs(5));
    harness.wait_state(RobotState::Stopped, Duration::from_secs(2));
}

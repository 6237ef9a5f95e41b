//! Telemetry writer.
//!
//! A dedicated thread blocks on the position-round condvar and emits one
//! line per SYNC cycle to the operator pipe:
//!
//! ```text
//! @M<node> S<position> … AS<state> T<dt_seconds> C<completion>
//! ```
//!
//! `AS` is replaced by 0 while asynchronous events are pending, and `C`
//! is the minimum completion percentage across the fleet.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::master::{MotorSnapshot, QueueMap, Shared};

/// Wake-up granularity used to observe the stop flag even when no
/// positions arrive.
const WAIT_SLICE: Duration = Duration::from_millis(250);

/// Spawn the writer thread. The pipe is opened lazily because opening a
/// FIFO for writing blocks until a reader attaches.
pub fn spawn(
    shared: Arc<Shared>,
    queues: QueueMap,
    path: PathBuf,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("telemetry".into())
        .spawn(move || run(shared, queues, path, stop))
        .expect("spawn telemetry writer")
}

fn run(shared: Arc<Shared>, queues: QueueMap, path: PathBuf, stop: Arc<AtomicBool>) {
    info!(?path, "telemetry writer waiting for a reader");
    let mut sink = match OpenOptions::new().write(true).append(true).create(true).open(&path) {
        Ok(file) => file,
        Err(error) => {
            warn!(?path, %error, "cannot open telemetry pipe");
            return;
        }
    };
    info!("telemetry writer attached");

    let mut last_round = 0u64;
    let mut last_line = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        let snapshot: Vec<(u8, MotorSnapshot)> = {
            let mut board = shared.board.lock();
            if board.round == last_round {
                shared
                    .position_ready
                    .wait_for(&mut board, WAIT_SLICE);
            }
            if board.round == last_round {
                continue;
            }
            last_round = board.round;
            board.motors.iter().map(|(&n, &m)| (n, m)).collect()
        };
        if snapshot.is_empty() {
            continue;
        }

        let line = compose_line(&shared, &queues, &snapshot, last_line.elapsed());
        last_line = Instant::now();
        if writeln!(sink, "{line}").and_then(|_| sink.flush()).is_err() {
            debug!("telemetry reader went away");
            return;
        }
    }
}

fn compose_line(
    shared: &Shared,
    queues: &QueueMap,
    snapshot: &[(u8, MotorSnapshot)],
    elapsed: Duration,
) -> String {
    let mut line = String::new();
    for (node, motor) in snapshot {
        if !line.is_empty() {
            line.push(' ');
        }
        let _ = write!(line, "@M{node} S{}", motor.position);
    }

    let state = if shared.events.pending() {
        0
    } else {
        shared.state().code()
    };
    let _ = write!(line, " AS{state}");
    let _ = write!(line, " T{:.2}", elapsed.as_secs_f32());

    let completion = fleet_completion(queues, snapshot);
    let _ = write!(line, " C{completion:.0}");
    line
}

/// Minimum completion percentage across the fleet; 0 with no sources.
fn fleet_completion(queues: &QueueMap, snapshot: &[(u8, MotorSnapshot)]) -> f32 {
    let queues = queues.lock();
    snapshot
        .iter()
        .filter_map(|(node, motor)| queues.get(node).map(|q| q.completion(motor.in_fifo)))
        .fold(None::<f32>, |min, c| {
            Some(match min {
                Some(m) if m <= c => m,
                _ => c,
            })
        })
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::motion::MotionQueue;
    use alma_common::RobotState;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::io::Write as _;

    fn shared_with_state(state: RobotState) -> Arc<Shared> {
        let shared = Shared::new();
        *shared.robot_state.lock() = state;
        shared
    }

    #[test]
    fn line_carries_positions_state_and_completion() {
        let shared = shared_with_state(RobotState::Initialized);
        let queues: QueueMap = Arc::new(Mutex::new(BTreeMap::new()));
        let snapshot = vec![
            (
                119,
                MotorSnapshot {
                    position: 0,
                    in_fifo: 0,
                },
            ),
            (
                120,
                MotorSnapshot {
                    position: -42,
                    in_fifo: 0,
                },
            ),
        ];
        let line = compose_line(&shared, &queues, &snapshot, Duration::from_millis(100));
        assert!(line.starts_with("@M119 S0 @M120 S-42 AS4 T0.10"));
        assert!(line.ends_with(" C0"));
    }

    #[test]
    fn pending_events_force_async_error_state() {
        let shared = shared_with_state(RobotState::Simulating);
        shared
            .events
            .add(alma_common::EventKind::FileError, 119, false, None);
        let queues: QueueMap = Arc::new(Mutex::new(BTreeMap::new()));
        let snapshot = vec![(
            119,
            MotorSnapshot {
                position: 5,
                in_fifo: 0,
            },
        )];
        let line = compose_line(&shared, &queues, &snapshot, Duration::from_millis(10));
        assert!(line.contains(" AS0 "), "line was: {line}");
    }

    #[test]
    fn completion_is_fleet_minimum() {
        let shared = shared_with_state(RobotState::Simulating);
        let mut table = tempfile::NamedTempFile::new().unwrap();
        writeln!(table, "CT1 M119 S1 T100").unwrap();
        writeln!(table, "CT1 M119 S2 T100").unwrap();
        table.flush().unwrap();

        let queue = MotionQueue::new(119);
        queue.fill_file(table.path(), &EventBus::new()).unwrap();
        for _ in 0..100 {
            if queue.end_reached() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let mut map = BTreeMap::new();
        map.insert(119u8, queue.clone());
        let queues: QueueMap = Arc::new(Mutex::new(map));

        // Fully read, drive FIFO drained: 100 percent.
        let snapshot = vec![(
            119,
            MotorSnapshot {
                position: 2,
                in_fifo: 0,
            },
        )];
        let line = compose_line(&shared, &queues, &snapshot, Duration::from_millis(10));
        assert!(line.ends_with(" C100"), "line was: {line}");
        queue.init();
    }
}

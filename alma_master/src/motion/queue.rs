//! Per-motor motion queue.
//!
//! A bounded ring of `(position, dwell)` samples refilled by a background
//! thread. File mode reads a motion table top to bottom, keeping the ring
//! topped up to 45 samples and sleeping 10 ms whenever it is full. Stream
//! mode follows the operator pipe and keeps only the latest sample per
//! node, with a latched start flag.
//!
//! `get` never consumes; the reactor reads ahead by offset and calls
//! `advance` only after the samples have actually reached the drive.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use alma_common::{consts::TABLE_SIZE, EventKind, NodeId};
use heapless::Deque;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::EventBus;
use crate::motion::parser::{parse_stream_row, parse_table_row, TableRow};

/// Poll interval of a file refiller whose ring is full.
const REFILL_SLEEP: Duration = Duration::from_millis(10);

/// One interpolation sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub position: i32,
    pub dwell_ms: u32,
}

/// Homing parameters carried by a table's first row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomingParams {
    pub offset: i32,
    pub forward_velocity: u32,
    pub backward_velocity: u32,
}

/// Latest streamed command for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSample {
    pub position: i32,
    pub velocity: u32,
    pub acceleration: u32,
    pub start: bool,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("not enough samples buffered")]
    Empty,
    #[error("advance past the buffered samples")]
    Underflow,
    #[error("motion source {path}: {message}")]
    Source { path: PathBuf, message: String },
}

#[derive(Default)]
struct QueueState {
    ring: Deque<Sample, TABLE_SIZE>,
    last_taken: Option<Sample>,
    end_reached: bool,
    homing: Option<HomingParams>,
    rows_read: u64,
    rows_total: u64,
    stream: BTreeMap<NodeId, StreamSample>,
}

struct QueueShared {
    node: NodeId,
    state: Mutex<QueueState>,
    /// Bumped by `init`; a refiller exits once its generation is stale.
    generation: AtomicU64,
    cancel: AtomicBool,
    refiller: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Cloneable handle to one motor's queue.
#[derive(Clone)]
pub struct MotionQueue {
    shared: Arc<QueueShared>,
}

impl MotionQueue {
    pub fn new(node: NodeId) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                node,
                state: Mutex::new(QueueState::default()),
                generation: AtomicU64::new(0),
                cancel: AtomicBool::new(false),
                refiller: Mutex::new(None),
            }),
        }
    }

    pub fn node(&self) -> NodeId {
        self.shared.node
    }

    /// Cancel any refiller and reset the buffer.
    pub fn init(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.shared.refiller.lock().take() {
            let _ = handle.join();
        }
        self.shared.cancel.store(false, Ordering::SeqCst);
        *self.shared.state.lock() = QueueState::default();
    }

    /// Open a motion table and start the background refiller. Returns once
    /// the first record (or end/error) has been observed, so the caller
    /// can immediately inspect [`MotionQueue::homing`].
    pub fn fill_file(&self, path: &Path, bus: &EventBus) -> Result<(), QueueError> {
        let source = |message: String| QueueError::Source {
            path: path.to_path_buf(),
            message,
        };

        let total = count_lines(path).map_err(|e| source(e.to_string()))?;
        {
            let mut state = self.shared.state.lock();
            *state = QueueState::default();
            state.rows_total = total;
        }

        let file = File::open(path).map_err(|e| source(e.to_string()))?;
        let mut reader = BufReader::new(file);
        let mut line_no = 0u64;
        let mut first = true;

        // Read synchronously until one record lands, so homing parameters
        // are available to the caller right away.
        loop {
            let mut line = String::new();
            let read = reader
                .read_line(&mut line)
                .map_err(|e| source(e.to_string()))?;
            if read == 0 {
                self.shared.state.lock().end_reached = true;
                return Ok(());
            }
            line_no += 1;
            if self.ingest_table_line(&line, line_no, &mut first, bus) {
                break;
            }
        }

        let queue = self.clone();
        let bus = bus.clone();
        let generation = self.shared.generation.load(Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name(format!("refiller-{}", self.shared.node))
            .spawn(move || queue.run_file_refiller(reader, line_no, first, generation, bus))
            .map_err(|e| source(e.to_string()))?;
        *self.shared.refiller.lock() = Some(handle);
        Ok(())
    }

    /// Follow the streaming pipe. The open may block until a writer
    /// appears, so everything happens on the refiller thread; the thread
    /// is abandoned (not joined) on `init` since a blocked read cannot be
    /// interrupted.
    pub fn fill_stream(&self, path: &Path, bus: &EventBus) {
        {
            let mut state = self.shared.state.lock();
            *state = QueueState::default();
        }
        let queue = self.clone();
        let bus = bus.clone();
        let path = path.to_path_buf();
        let generation = self.shared.generation.load(Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("stream-{}", self.shared.node))
            .spawn(move || queue.run_stream_refiller(&path, generation, bus));
        if let Err(e) = spawned {
            warn!(error = %e, "cannot spawn stream refiller");
        }
    }

    /// Read the sample `offset` places past the consumption point without
    /// advancing.
    pub fn get(&self, offset: usize) -> Result<Sample, QueueError> {
        let state = self.shared.state.lock();
        state.ring.iter().nth(offset).copied().ok_or(QueueError::Empty)
    }

    /// The most recently consumed sample.
    pub fn last(&self) -> Option<Sample> {
        self.shared.state.lock().last_taken
    }

    /// Drop the oldest `n` samples after they reached the drive.
    pub fn advance(&self, n: usize) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock();
        if n > state.ring.len() {
            return Err(QueueError::Underflow);
        }
        for _ in 0..n {
            state.last_taken = state.ring.pop_front();
        }
        Ok(())
    }

    /// Keep only the newest `n` samples, discarding everything older
    /// (rolling-overwrite consumers resynchronise with this).
    pub fn seek(&self, n: usize) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock();
        if n > state.ring.len() {
            return Err(QueueError::Underflow);
        }
        while state.ring.len() > n {
            state.last_taken = state.ring.pop_front();
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.shared.state.lock().ring.len()
    }

    pub fn end_reached(&self) -> bool {
        self.shared.state.lock().end_reached
    }

    pub fn homing(&self) -> Option<HomingParams> {
        self.shared.state.lock().homing
    }

    /// Completion percentage given the number of samples currently parked
    /// in the drive FIFO.
    pub fn completion(&self, in_drive_fifo: u16) -> f32 {
        let state = self.shared.state.lock();
        if state.rows_total == 0 {
            return 0.0;
        }
        let issued = state.rows_read.saturating_sub(u64::from(in_drive_fifo));
        let percent = issued as f32 * 100.0 / state.rows_total as f32;
        percent.clamp(0.0, 100.0)
    }

    /// Snapshot the stream latches, clearing each start flag.
    pub fn take_stream(&self) -> Vec<(NodeId, StreamSample)> {
        let mut state = self.shared.state.lock();
        let mut out = Vec::with_capacity(state.stream.len());
        for (&node, sample) in state.stream.iter_mut() {
            out.push((node, *sample));
            sample.start = false;
        }
        out
    }

    /// Process one table line; returns true once a record was accepted.
    fn ingest_table_line(
        &self,
        line: &str,
        line_no: u64,
        first: &mut bool,
        bus: &EventBus,
    ) -> bool {
        let node = self.shared.node;
        let mut state = self.shared.state.lock();
        state.rows_read = line_no;
        match parse_table_row(line, node, *first) {
            Ok(Some(TableRow::Homing {
                offset,
                forward_velocity,
                backward_velocity,
            })) => {
                state.homing = Some(HomingParams {
                    offset,
                    forward_velocity,
                    backward_velocity,
                });
                *first = false;
                true
            }
            Ok(Some(TableRow::Sample { position, dwell_ms })) => {
                *first = false;
                let pushed = state.ring.push_back(Sample { position, dwell_ms });
                if pushed.is_err() {
                    // Caller checked for space; a full ring here means a
                    // racing init, drop the sample.
                    warn!(node, "ring full while ingesting");
                }
                true
            }
            Ok(None) => false,
            Err(error) => {
                debug!(node, line_no, %error, "bad motion row");
                bus.add(
                    EventKind::FileError,
                    node,
                    false,
                    Some(format!("linea {line_no}")),
                );
                false
            }
        }
    }

    fn run_file_refiller(
        &self,
        mut reader: BufReader<File>,
        mut line_no: u64,
        mut first: bool,
        generation: u64,
        bus: EventBus,
    ) {
        loop {
            if self.stale(generation) {
                return;
            }
            let full = self.shared.state.lock().ring.is_full();
            if full {
                thread::sleep(REFILL_SLEEP);
                continue;
            }
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    self.shared.state.lock().end_reached = true;
                    debug!(node = self.shared.node, line_no, "table exhausted");
                    return;
                }
                Ok(_) => {
                    line_no += 1;
                    self.ingest_table_line(&line, line_no, &mut first, &bus);
                }
                Err(error) => {
                    warn!(node = self.shared.node, %error, "table read failed");
                    bus.add(EventKind::FileError, self.shared.node, false, None);
                    self.shared.state.lock().end_reached = true;
                    return;
                }
            }
        }
    }

    fn run_stream_refiller(&self, path: &Path, generation: u64, bus: EventBus) {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(error) => {
                warn!(?path, %error, "cannot open stream pipe");
                bus.add(EventKind::FileError, self.shared.node, false, None);
                self.shared.state.lock().end_reached = true;
                return;
            }
        };
        let reader = BufReader::new(file);
        let mut line_no = 0u64;
        for line in reader.lines() {
            if self.stale(generation) {
                return;
            }
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            line_no += 1;
            match parse_stream_row(&line) {
                Ok(Some(row)) => {
                    let mut state = self.shared.state.lock();
                    state.rows_read = line_no;
                    let latch = state.stream.entry(row.node).or_insert(StreamSample {
                        position: 0,
                        velocity: 0,
                        acceleration: 0,
                        start: false,
                    });
                    latch.position = row.position;
                    latch.velocity = row.velocity;
                    latch.acceleration = row.acceleration;
                    // The start flag latches until consumed.
                    latch.start |= row.start;
                }
                Ok(None) => {}
                Err(error) => {
                    debug!(line_no, %error, "bad stream row");
                    bus.add(
                        EventKind::FileError,
                        self.shared.node,
                        false,
                        Some(format!("linea {line_no}")),
                    );
                }
            }
        }
        self.shared.state.lock().end_reached = true;
    }

    fn stale(&self, generation: u64) -> bool {
        self.shared.cancel.load(Ordering::SeqCst)
            || self.shared.generation.load(Ordering::SeqCst) != generation
    }
}

fn count_lines(path: &Path) -> std::io::Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut total = 0u64;
    for line in reader.lines() {
        line?;
        total += 1;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_table(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp table");
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    fn wait_for(queue: &MotionQueue, predicate: impl Fn(&MotionQueue) -> bool) {
        for _ in 0..200 {
            if predicate(queue) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("queue never reached the expected state");
    }

    #[test]
    fn fill_reads_homing_synchronously() {
        let table = write_table(&[
            "CT1 M119 H2000 VF10000 VB10000",
            "CT1 M119 S1000 T100",
            "CT1 M119 S0 T100",
        ]);
        let queue = MotionQueue::new(119);
        let bus = EventBus::new();
        queue.fill_file(table.path(), &bus).unwrap();

        assert_eq!(
            queue.homing(),
            Some(HomingParams {
                offset: 2000,
                forward_velocity: 10000,
                backward_velocity: 10000
            })
        );
        wait_for(&queue, |q| q.end_reached() && q.count() == 2);
        queue.init();
    }

    #[test]
    fn get_is_non_consuming_and_bounded() {
        let table = write_table(&["CT1 M119 S10 T100", "CT1 M119 S20 T100"]);
        let queue = MotionQueue::new(119);
        queue.fill_file(table.path(), &EventBus::new()).unwrap();
        wait_for(&queue, |q| q.end_reached() && q.count() == 2);

        assert_eq!(queue.get(0).unwrap().position, 10);
        assert_eq!(queue.get(1).unwrap().position, 20);
        assert!(matches!(queue.get(2), Err(QueueError::Empty)));
        assert_eq!(queue.count(), 2);

        queue.advance(2).unwrap();
        assert_eq!(queue.last().unwrap().position, 20);
        assert!(matches!(queue.advance(1), Err(QueueError::Underflow)));
        queue.init();
    }

    #[test]
    fn ring_caps_at_table_size() {
        let lines: Vec<String> = (0..80)
            .map(|i| format!("CT1 M119 S{i} T100"))
            .collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let table = write_table(&refs);
        let queue = MotionQueue::new(119);
        queue.fill_file(table.path(), &EventBus::new()).unwrap();
        wait_for(&queue, |q| q.count() == TABLE_SIZE);

        // Full: the refiller parks; consuming lets it continue.
        assert!(!queue.end_reached());
        queue.advance(40).unwrap();
        wait_for(&queue, |q| q.end_reached());
        // 80 rows total: 45 buffered, 40 consumed, 35 refilled.
        assert_eq!(queue.count(), 40);
        queue.init();
    }

    #[test]
    fn malformed_rows_raise_file_errors_with_line_numbers() {
        let table = write_table(&[
            "CT1 M119 H2000 VF10000 VB10000",
            "CT1 M119 S1000 T100",
            "CT1 M119 S T50",
            "CT1 M119 S0 T100",
        ]);
        let queue = MotionQueue::new(119);
        let bus = EventBus::new();
        queue.fill_file(table.path(), &bus).unwrap();
        wait_for(&queue, |q| q.end_reached());

        assert_eq!(queue.count(), 2);
        let events = bus.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::FileError);
        assert_eq!(events[0].node, 119);
        assert_eq!(events[0].detail.as_deref(), Some("linea 3"));
        queue.init();
    }

    #[test]
    fn seek_keeps_only_the_newest_samples() {
        let table = write_table(&[
            "CT1 M119 S10 T100",
            "CT1 M119 S20 T100",
            "CT1 M119 S30 T100",
        ]);
        let queue = MotionQueue::new(119);
        queue.fill_file(table.path(), &EventBus::new()).unwrap();
        wait_for(&queue, |q| q.end_reached() && q.count() == 3);

        queue.seek(1).unwrap();
        assert_eq!(queue.count(), 1);
        assert_eq!(queue.get(0).unwrap().position, 30);
        assert!(matches!(queue.seek(2), Err(QueueError::Underflow)));
        queue.init();
    }

    #[test]
    fn completion_goes_from_zero_to_hundred() {
        let table = write_table(&["CT1 M119 S1 T100", "CT1 M119 S2 T100"]);
        let queue = MotionQueue::new(119);
        assert_eq!(queue.completion(0), 0.0);

        queue.fill_file(table.path(), &EventBus::new()).unwrap();
        wait_for(&queue, |q| q.end_reached());
        // Everything read and nothing left in the drive FIFO.
        assert_eq!(queue.completion(0), 100.0);
        // Two samples still in the drive: partially complete.
        assert!(queue.completion(2) < 100.0);
        queue.init();
    }

    #[test]
    fn missing_table_is_an_error() {
        let queue = MotionQueue::new(119);
        assert!(queue
            .fill_file(Path::new("/nonexistent/119.mot"), &EventBus::new())
            .is_err());
    }

    #[test]
    fn stream_mode_latches_latest_sample() {
        let table = write_table(&[
            "CT1 M119 P100 VM300000 AM100",
            "CT1 M119 P200 VM300000 AM100 1",
            "CT1 M120 P300 VM300000 AM100",
        ]);
        let queue = MotionQueue::new(0);
        queue.fill_stream(table.path(), &EventBus::new());
        wait_for(&queue, |q| q.end_reached());

        let samples = queue.take_stream();
        assert_eq!(samples.len(), 2);
        let m119 = samples.iter().find(|(n, _)| *n == 119).unwrap().1;
        assert_eq!(m119.position, 200);
        assert!(m119.start);

        // Start flag is consumed by the snapshot, position latch stays.
        let again = queue.take_stream();
        let m119 = again.iter().find(|(n, _)| *n == 119).unwrap().1;
        assert!(!m119.start);
        assert_eq!(m119.position, 200);
    }
}

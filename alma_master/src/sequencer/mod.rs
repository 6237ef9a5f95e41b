//! Command sequencer.
//!
//! Compounds are named, fixed-shape lists of primitive link steps with
//! `HOLE` markers filled from a caller-supplied argument vector. A job
//! executes one or more compounds back to back against a single node;
//! a broadcast job fans out one private copy per active node. Steps run
//! strictly in order per node: NMT steps advance synchronously, SDO steps
//! suspend the job until the link's completion re-enters through
//! [`Sequencer::on_sdo_result`].
//!
//! At most one job per node exists at any time, which also upholds the
//! link contract of one SDO in flight per node.

pub mod catalog;

use std::borrow::Cow;
use std::collections::{BTreeMap, VecDeque};

use alma_common::{od::OdEntry, NodeId};
use alma_link::{Link, NmtCommand, SdoResult};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Substitution marker: any index, subindex or value equal to `HOLE`
/// consumes the next caller argument.
pub const HOLE: u32 = 0xFFFF_FFFF;

/// One primitive link step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// NMT command addressed to the job's node.
    Nmt(NmtCommand),
    /// SDO download; `index`, `sub` and `value` may be `HOLE`.
    WriteOd {
        index: u32,
        sub: u32,
        size: u8,
        value: u32,
    },
    /// SDO upload; `index` and `sub` may be `HOLE`.
    ReadOd { index: u32, sub: u32 },
}

/// A named sequence of steps with its success/failure descriptors.
#[derive(Debug, Clone)]
pub struct Compound {
    pub name: &'static str,
    pub steps: Cow<'static, [Step]>,
    pub on_success: &'static str,
    pub on_failure: &'static str,
}

impl Compound {
    /// Build a runtime compound (used for raw drive commands).
    pub fn ad_hoc(name: &'static str, steps: Vec<Step>) -> Self {
        Self {
            name,
            steps: Cow::Owned(steps),
            on_success: "done",
            on_failure: "failed",
        }
    }

    /// Number of `HOLE` markers across all steps.
    pub fn hole_count(&self) -> usize {
        self.steps
            .iter()
            .map(|step| match *step {
                Step::Nmt(_) => 0,
                Step::WriteOd {
                    index, sub, value, ..
                } => [index, sub, value].iter().filter(|&&v| v == HOLE).count(),
                Step::ReadOd { index, sub } => {
                    [index, sub].iter().filter(|&&v| v == HOLE).count()
                }
            })
            .sum()
    }
}

/// Execution target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Node(NodeId),
    Broadcast,
}

/// Why a job could not be admitted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("node {0} already runs a job")]
    Busy(NodeId),
    #[error("empty compound list")]
    NoCompounds,
    #[error("no active node for broadcast")]
    NoActiveNodes,
}

/// Why a running job died.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("SDO aborted (code {code:#010x})")]
    SdoAborted { code: u32 },
    #[error("argument vector exhausted with holes remaining")]
    MissingArgument,
    #[error("link refused the step: {0}")]
    Link(String),
}

/// Progress reported to the caller. `Read` fires for every completed READ
/// step; `Done` fires exactly once per node when the job drains or dies,
/// carrying the success/failure descriptor of the compound it ended in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notify<T> {
    Read {
        node: NodeId,
        tag: T,
        value: u64,
    },
    Done {
        node: NodeId,
        tag: T,
        result: Result<u64, JobError>,
        descriptor: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Write,
    Read { entry: OdEntry },
}

#[derive(Debug)]
struct Job<T> {
    tag: T,
    compounds: Vec<Compound>,
    machine: usize,
    step: usize,
    args: VecDeque<u32>,
    awaiting: Option<Awaiting>,
    retried: bool,
    last_read: u64,
    /// True when the most recently completed step was a READ.
    final_read: bool,
}

/// Per-node job engine.
#[derive(Debug, Default)]
pub struct Sequencer<T> {
    jobs: BTreeMap<NodeId, Job<T>>,
}

impl<T: Copy + std::fmt::Debug> Sequencer<T> {
    pub fn new() -> Self {
        Self {
            jobs: BTreeMap::new(),
        }
    }

    /// Is a job in flight on `node`?
    pub fn is_busy(&self, node: NodeId) -> bool {
        self.jobs.contains_key(&node)
    }

    /// Drop any job state for `node` without notifying.
    pub fn reset(&mut self, node: NodeId) {
        if self.jobs.remove(&node).is_some() {
            debug!(node, "sequencer state dropped");
        }
    }

    /// Admit and start a job. Single-target jobs fail with `Busy` if the
    /// node is occupied; broadcast jobs fail if *any* active node is, and
    /// otherwise fan out a private copy of compounds and arguments to
    /// every active node.
    pub fn execute(
        &mut self,
        link: &dyn Link,
        active: &[NodeId],
        target: Target,
        tag: T,
        compounds: &[&Compound],
        args: &[u32],
    ) -> Result<Vec<Notify<T>>, ExecError> {
        if compounds.is_empty() {
            return Err(ExecError::NoCompounds);
        }
        let nodes: Vec<NodeId> = match target {
            Target::Node(node) => {
                if self.is_busy(node) {
                    return Err(ExecError::Busy(node));
                }
                vec![node]
            }
            Target::Broadcast => {
                if active.is_empty() {
                    return Err(ExecError::NoActiveNodes);
                }
                if let Some(&busy) = active.iter().find(|&&n| self.is_busy(n)) {
                    return Err(ExecError::Busy(busy));
                }
                active.to_vec()
            }
        };

        trace!(?target, name = compounds[0].name, args = args.len(), "job admitted");
        let mut notifications = Vec::new();
        for node in nodes {
            let job = Job {
                tag,
                compounds: compounds.iter().map(|&c| c.clone()).collect(),
                machine: 0,
                step: 0,
                args: args.iter().copied().collect(),
                awaiting: None,
                retried: false,
                last_read: 0,
                final_read: false,
            };
            self.jobs.insert(node, job);
            self.run(link, node, &mut notifications);
        }
        Ok(notifications)
    }

    /// Re-enter the engine with the completion of the in-flight SDO on
    /// `node`. Returns the notifications produced by the progress made.
    pub fn on_sdo_result(
        &mut self,
        link: &dyn Link,
        node: NodeId,
        result: SdoResult,
    ) -> Vec<Notify<T>> {
        let mut notifications = Vec::new();
        let Some(job) = self.jobs.get_mut(&node) else {
            // Raw diagnostics can complete after a reset; not a fault.
            trace!(node, ?result, "SDO completion with no job");
            return notifications;
        };
        let Some(awaiting) = job.awaiting else {
            warn!(node, ?result, "unsolicited SDO completion");
            return notifications;
        };

        match result {
            SdoResult::WriteOk => {
                job.awaiting = None;
                job.retried = false;
                job.final_read = false;
                job.step += 1;
                self.run(link, node, &mut notifications);
            }
            SdoResult::ReadOk(value) => {
                job.awaiting = None;
                job.retried = false;
                job.final_read = true;
                job.last_read = value;
                job.step += 1;
                let tag = job.tag;
                notifications.push(Notify::Read { node, tag, value });
                self.run(link, node, &mut notifications);
            }
            SdoResult::Aborted { code, receive } => {
                let retryable =
                    matches!(awaiting, Awaiting::Read { .. }) && receive && !job.retried;
                if retryable {
                    job.retried = true;
                    if let Awaiting::Read { entry } = awaiting {
                        debug!(node, %entry, "retrying aborted read");
                        if link.sdo_read(node, entry).is_ok() {
                            return notifications;
                        }
                    }
                }
                let tag = job.tag;
                let name = job.current_name();
                let descriptor = job.current_failure();
                warn!(node, name, code = format_args!("{code:#010x}"), "job aborted");
                self.jobs.remove(&node);
                notifications.push(Notify::Done {
                    node,
                    tag,
                    result: Err(JobError::SdoAborted { code }),
                    descriptor,
                });
            }
        }
        notifications
    }

    /// Drive `node`'s job forward until it suspends on an SDO, completes,
    /// or dies.
    fn run(&mut self, link: &dyn Link, node: NodeId, notifications: &mut Vec<Notify<T>>) {
        loop {
            let Some(job) = self.jobs.get_mut(&node) else {
                return;
            };
            if job.machine >= job.compounds.len() {
                let tag = job.tag;
                let result = if job.final_read { job.last_read } else { 0 };
                let descriptor = job
                    .compounds
                    .last()
                    .map(|c| c.on_success)
                    .unwrap_or("done");
                debug!(node, "job complete");
                self.jobs.remove(&node);
                notifications.push(Notify::Done {
                    node,
                    tag,
                    result: Ok(result),
                    descriptor,
                });
                return;
            }

            let compound = &job.compounds[job.machine];
            if job.step >= compound.steps.len() {
                job.machine += 1;
                job.step = 0;
                continue;
            }

            let step = compound.steps[job.step];
            match step {
                Step::Nmt(command) => {
                    if let Err(error) = link.nmt(node, command) {
                        Self::fail(&mut self.jobs, node, notifications, JobError::Link(error.to_string()));
                        return;
                    }
                    job.final_read = false;
                    job.step += 1;
                }
                Step::WriteOd {
                    index,
                    sub,
                    size,
                    value,
                } => {
                    let entry = match job.resolve_entry(index, sub) {
                        Ok(entry) => entry,
                        Err(error) => {
                            Self::fail(&mut self.jobs, node, notifications, error);
                            return;
                        }
                    };
                    let value = match job.resolve(value) {
                        Ok(value) => value,
                        Err(error) => {
                            Self::fail(&mut self.jobs, node, notifications, error);
                            return;
                        }
                    };
                    trace!(node, %entry, value = format_args!("{value:#x}"), "write step");
                    job.awaiting = Some(Awaiting::Write);
                    if let Err(error) = link.sdo_write(node, entry, size, value) {
                        Self::fail(&mut self.jobs, node, notifications, JobError::Link(error.to_string()));
                    }
                    return;
                }
                Step::ReadOd { index, sub } => {
                    let entry = match job.resolve_entry(index, sub) {
                        Ok(entry) => entry,
                        Err(error) => {
                            Self::fail(&mut self.jobs, node, notifications, error);
                            return;
                        }
                    };
                    trace!(node, %entry, "read step");
                    job.awaiting = Some(Awaiting::Read { entry });
                    if let Err(error) = link.sdo_read(node, entry) {
                        Self::fail(&mut self.jobs, node, notifications, JobError::Link(error.to_string()));
                    }
                    return;
                }
            }
        }
    }

    fn fail(
        jobs: &mut BTreeMap<NodeId, Job<T>>,
        node: NodeId,
        notifications: &mut Vec<Notify<T>>,
        error: JobError,
    ) {
        if let Some(job) = jobs.remove(&node) {
            warn!(node, name = job.current_name(), %error, "job failed");
            notifications.push(Notify::Done {
                node,
                tag: job.tag,
                result: Err(error),
                descriptor: job.current_failure(),
            });
        }
    }
}

impl<T> Job<T> {
    fn current(&self) -> Option<&Compound> {
        self.compounds
            .get(self.machine.min(self.compounds.len().saturating_sub(1)))
    }

    fn current_name(&self) -> &'static str {
        self.current().map(|c| c.name).unwrap_or("?")
    }

    fn current_failure(&self) -> &'static str {
        self.current().map(|c| c.on_failure).unwrap_or("failed")
    }

    fn resolve(&mut self, raw: u32) -> Result<u32, JobError> {
        if raw == HOLE {
            self.args.pop_front().ok_or(JobError::MissingArgument)
        } else {
            Ok(raw)
        }
    }

    fn resolve_entry(&mut self, index: u32, sub: u32) -> Result<OdEntry, JobError> {
        let index = self.resolve(index)?;
        let sub = self.resolve(sub)?;
        Ok(OdEntry::new(index as u16, sub as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::catalog;
    use super::*;
    use alma_link::{LinkError, PdoImage};
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Records link calls; completions are driven by the test.
    #[derive(Default)]
    struct MockLink {
        calls: Mutex<Vec<String>>,
        image: PdoImage,
    }

    impl MockLink {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl Link for MockLink {
        fn nmt(&self, target: NodeId, command: NmtCommand) -> Result<(), LinkError> {
            self.calls.lock().push(format!("nmt {target} {command:?}"));
            Ok(())
        }

        fn sdo_write(
            &self,
            node: NodeId,
            entry: OdEntry,
            _size: u8,
            value: u32,
        ) -> Result<(), LinkError> {
            self.calls.lock().push(format!("w {node} {entry} {value:#x}"));
            Ok(())
        }

        fn sdo_read(&self, node: NodeId, entry: OdEntry) -> Result<(), LinkError> {
            self.calls.lock().push(format!("r {node} {entry}"));
            Ok(())
        }

        fn send_pdo_event(&self) -> Result<(), LinkError> {
            Ok(())
        }

        fn start_sync(&self, _period: Duration) -> Result<(), LinkError> {
            Ok(())
        }

        fn stop_sync(&self) {}

        fn image(&self) -> &PdoImage {
            &self.image
        }
    }

    fn drive_writes<T: Copy + std::fmt::Debug>(
        seq: &mut Sequencer<T>,
        link: &MockLink,
        node: NodeId,
    ) -> Vec<Notify<T>> {
        // Ack write completions until the job suspends on a read, ends, or
        // gives up.
        let mut out = Vec::new();
        for _ in 0..200 {
            if !seq.is_busy(node) {
                break;
            }
            if link.calls().last().map_or(false, |c| c.starts_with("r ")) {
                break;
            }
            out.extend(seq.on_sdo_result(link, node, SdoResult::WriteOk));
        }
        out
    }

    #[test]
    fn substitution_consumes_exact_argument_count() {
        let link = MockLink::default();
        let mut seq: Sequencer<u8> = Sequencer::new();
        assert_eq!(catalog::SMART_HOMING.hole_count(), 3);

        seq.execute(
            &link,
            &[],
            Target::Node(0x77),
            0,
            &[&catalog::SMART_HOMING],
            &[10_000, 10_000, 2_000],
        )
        .unwrap();
        let notifications = drive_writes(&mut seq, &link, 0x77);
        assert!(matches!(
            notifications.last(),
            Some(Notify::Done { result: Ok(0), .. })
        ));
        let calls = link.calls();
        assert!(calls.iter().any(|c| c.contains("6099:01 0x2710")));
        assert!(calls.iter().any(|c| c.contains("607C:00 0x7d0")));
    }

    #[test]
    fn missing_argument_is_fatal() {
        let link = MockLink::default();
        let mut seq: Sequencer<u8> = Sequencer::new();
        seq.execute(
            &link,
            &[],
            Target::Node(0x77),
            0,
            &[&catalog::SMART_HOMING],
            &[10_000],
        )
        .unwrap();
        let notifications = drive_writes(&mut seq, &link, 0x77);
        assert!(matches!(
            notifications.last(),
            Some(Notify::Done {
                result: Err(JobError::MissingArgument),
                ..
            })
        ));
        assert!(!seq.is_busy(0x77));
    }

    #[test]
    fn busy_node_rejects_second_job() {
        let link = MockLink::default();
        let mut seq: Sequencer<u8> = Sequencer::new();
        seq.execute(&link, &[], Target::Node(0x77), 0, &[&catalog::SMART_STOP], &[])
            .unwrap();
        let err = seq
            .execute(&link, &[], Target::Node(0x77), 1, &[&catalog::SMART_OFF], &[])
            .unwrap_err();
        assert_eq!(err, ExecError::Busy(0x77));
    }

    #[test]
    fn broadcast_is_all_or_nothing() {
        let link = MockLink::default();
        let mut seq: Sequencer<u8> = Sequencer::new();
        seq.execute(&link, &[], Target::Node(0x78), 0, &[&catalog::SMART_STOP], &[])
            .unwrap();

        let err = seq
            .execute(
                &link,
                &[0x77, 0x78],
                Target::Broadcast,
                1,
                &[&catalog::SMART_OFF],
                &[],
            )
            .unwrap_err();
        assert_eq!(err, ExecError::Busy(0x78));
        assert!(!seq.is_busy(0x77));
    }

    #[test]
    fn broadcast_fans_out_private_jobs() {
        let link = MockLink::default();
        let mut seq: Sequencer<u8> = Sequencer::new();
        seq.execute(
            &link,
            &[0x77, 0x78],
            Target::Broadcast,
            0,
            &[&catalog::HEART_START],
            &[100],
        )
        .unwrap();
        assert!(seq.is_busy(0x77));
        assert!(seq.is_busy(0x78));

        let calls = link.calls();
        assert!(calls.contains(&"w 119 1017:00 0x64".to_string()));
        assert!(calls.contains(&"w 120 1017:00 0x64".to_string()));

        // Each node completes independently.
        let done = seq.on_sdo_result(&link, 0x77, SdoResult::WriteOk);
        assert!(matches!(done.last(), Some(Notify::Done { node: 0x77, .. })));
        assert!(seq.is_busy(0x78));
    }

    #[test]
    fn terminal_read_reports_value() {
        let link = MockLink::default();
        let mut seq: Sequencer<u8> = Sequencer::new();
        seq.execute(
            &link,
            &[],
            Target::Node(0x77),
            7,
            &[&catalog::SMART_LIMIT_ENABLE, &catalog::SMART_STATUSWORD],
            &[],
        )
        .unwrap();
        let mut notifications = drive_writes(&mut seq, &link, 0x77);
        // Suspended on the statusword read now.
        assert!(seq.is_busy(0x77));
        notifications.extend(seq.on_sdo_result(&link, 0x77, SdoResult::ReadOk(0x4000)));

        assert!(notifications.iter().any(|n| matches!(
            n,
            Notify::Read {
                node: 0x77,
                value: 0x4000,
                ..
            }
        )));
        assert!(matches!(
            notifications.last(),
            Some(Notify::Done {
                result: Ok(0x4000),
                ..
            })
        ));
    }

    #[test]
    fn read_retries_once_on_receive_abort() {
        let link = MockLink::default();
        let mut seq: Sequencer<u8> = Sequencer::new();
        seq.execute(&link, &[], Target::Node(0x77), 0, &[&catalog::SMART_STATUSWORD], &[])
            .unwrap();

        let none = seq.on_sdo_result(
            &link,
            0x77,
            SdoResult::Aborted {
                code: 0x0504_0000,
                receive: true,
            },
        );
        assert!(none.is_empty());
        assert_eq!(link.calls().iter().filter(|c| c.starts_with("r 119")).count(), 2);

        // Second failure terminates the job.
        let done = seq.on_sdo_result(
            &link,
            0x77,
            SdoResult::Aborted {
                code: 0x0504_0000,
                receive: true,
            },
        );
        assert!(matches!(
            done.last(),
            Some(Notify::Done {
                result: Err(JobError::SdoAborted { .. }),
                ..
            })
        ));
    }

    #[test]
    fn write_abort_terminates_without_retry() {
        let link = MockLink::default();
        let mut seq: Sequencer<u8> = Sequencer::new();
        seq.execute(&link, &[], Target::Node(0x77), 0, &[&catalog::SMART_OFF], &[])
            .unwrap();
        let done = seq.on_sdo_result(
            &link,
            0x77,
            SdoResult::Aborted {
                code: 0x0601_0000,
                receive: false,
            },
        );
        assert!(matches!(
            done.last(),
            Some(Notify::Done {
                result: Err(JobError::SdoAborted { code: 0x0601_0000 }),
                ..
            })
        ));
        assert!(!seq.is_busy(0x77));
    }

    #[test]
    fn nmt_steps_advance_synchronously() {
        let link = MockLink::default();
        let mut seq: Sequencer<u8> = Sequencer::new();
        seq.execute(&link, &[], Target::Node(0x77), 0, &[&catalog::SMART_START], &[])
            .unwrap();
        let calls = link.calls();
        assert_eq!(calls[0], "nmt 119 StartNode");
        // First SDO write issued right after the NMT step.
        assert!(calls[1].starts_with("w 119 6040:00"));
    }

    #[test]
    fn catalog_hole_counts_match_contract() {
        assert_eq!(catalog::SMART_START.hole_count(), 0);
        assert_eq!(catalog::SMART_STOP.hole_count(), 0);
        assert_eq!(catalog::SMART_OFF.hole_count(), 0);
        assert_eq!(catalog::SMART_HOMING.hole_count(), 3);
        assert_eq!(catalog::SMART_POSITION_SET.hole_count(), 4);
        assert_eq!(catalog::SMART_POSITION_START.hole_count(), 0);
        assert_eq!(catalog::INIT_INTERPOLATION.hole_count(), 1);
        assert_eq!(catalog::RESUME_INTERPOLATION.hole_count(), 1);
        assert_eq!(catalog::START_INTERPOLATION.hole_count(), 0);
        assert_eq!(catalog::STOP_INTERPOLATION.hole_count(), 1);
        assert_eq!(catalog::HEART_START.hole_count(), 1);
        assert_eq!(catalog::MAP1_PDO.hole_count(), 12);
        assert_eq!(catalog::MAP2_PDO.hole_count(), 14);
        assert_eq!(catalog::MAP3_PDO.hole_count(), 16);
        assert_eq!(catalog::MAP4_PDO.hole_count(), 18);
        assert_eq!(catalog::SMART_LIMIT_ENABLE.hole_count(), 0);
        assert_eq!(catalog::SMART_LIMIT_DISABLE.hole_count(), 0);
        assert_eq!(catalog::SMART_STATUSWORD.hole_count(), 0);
        assert_eq!(catalog::TORQUE.hole_count(), 1);
        assert_eq!(catalog::VELOCITY_SET.hole_count(), 1);
    }
}

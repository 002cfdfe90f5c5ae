//! Process orchestration: start/join sweeps and result aggregation.
//!
//! Every stage runs as its own OS process, forked in reverse registration
//! order (sinks before sources) so each downstream reader is already parked
//! in its blocking FIFO open when the upstream writer arrives, and joined in
//! forward order. Results and failures travel back over one anonymous pipe
//! per child and are folded into a [`RunSummary`] after the join sweep.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::plumbing::PipeSet;
use crate::stage::{Stage, StageReport};
use crate::workflow::{Node, Workflow};

/// Aggregated outcome of a workflow run: per-stage results for the stages
/// that completed, per-stage failure lines for those that did not.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub results: BTreeMap<String, Value>,
    pub failures: BTreeMap<String, Vec<String>>,
}

impl RunSummary {
    /// The result a stage published, if it completed successfully.
    pub fn result(&self, stage: &str) -> Option<&Value> {
        self.results.get(stage)
    }

    pub fn failed_stage_names(&self) -> Vec<String> {
        self.failures.keys().cloned().collect()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A started workflow: owns the pipe set and the child processes between
/// `start()` and `join()`.
///
/// Dropping the handle without joining aborts the children, so the FIFOs are
/// removed from disk on every scope-exit path.
pub struct RunningWorkflow {
    workflow_name: String,
    pipes: Option<PipeSet>,
    /// Spawn order, i.e. reverse registration order.
    children: Vec<ChildStage>,
    joined: bool,
}

struct ChildStage {
    name: String,
    pid: Pid,
    report_rx: Option<os_pipe::PipeReader>,
    report: Option<StageReport>,
}

impl Workflow {
    /// Validates, plumbs and runs the workflow to completion.
    ///
    /// Returns the per-stage results; raises [`Error::StageFailures`] after
    /// the join sweep when any stage recorded an exception (the summary
    /// inside still carries the results of the stages that succeeded).
    pub fn run(self) -> Result<RunSummary> {
        self.start()?.join()
    }

    /// Validates the graph, creates the pipe set and forks all stages.
    ///
    /// The returned handle must be held until [`RunningWorkflow::join`]; it
    /// owns the FIFOs the children are connected through.
    pub fn start(self) -> Result<RunningWorkflow> {
        self.check()?;
        let pipe_names: std::collections::BTreeSet<String> =
            self.folded_balance().into_keys().collect();
        let pipes = PipeSet::create(&pipe_names, &self.options)?;
        info!(
            workflow = %self.name,
            pipes = pipe_names.len(),
            buffer_size = pipes.buffer_size(),
            "starting workflow"
        );

        let mut running = RunningWorkflow {
            workflow_name: self.name,
            pipes: Some(pipes),
            children: Vec::new(),
            joined: false,
        };
        let pipes_ref = running.pipes.as_ref().expect("pipe set just created");
        if let Err(e) = start_sweep(self.nodes, pipes_ref, &mut running.children) {
            // The drop aborts whatever was already forked and unlinks the
            // pipe set before the error surfaces.
            drop(running);
            return Err(e);
        }
        Ok(running)
    }
}

impl RunningWorkflow {
    /// Joins all stages in forward registration order, tears the pipe set
    /// down and aggregates the per-stage reports.
    pub fn join(mut self) -> Result<RunSummary> {
        for i in (0..self.children.len()).rev() {
            join_child(&mut self.children[i]);
        }
        self.joined = true;
        self.pipes = None;

        let mut summary = RunSummary::default();
        for child in &mut self.children {
            match child.report.take() {
                Some(StageReport {
                    failure: Some(lines),
                    ..
                }) => {
                    summary.failures.insert(child.name.clone(), lines);
                }
                Some(StageReport { result, .. }) => {
                    summary
                        .results
                        .insert(child.name.clone(), result.unwrap_or(Value::Null));
                }
                None => {}
            }
        }

        for (stage, lines) in &summary.failures {
            for line in lines {
                error!(stage = %stage, "{line}");
            }
        }
        if summary.is_success() {
            info!(workflow = %self.workflow_name, stages = summary.results.len(), "workflow complete");
            Ok(summary)
        } else {
            Err(Error::StageFailures(summary))
        }
    }

    /// Best-effort emergency shutdown: SIGTERM to every live child, then
    /// reap them and tear the pipe set down. Not a graceful cancellation;
    /// normal termination is EOF propagation through the graph.
    pub fn abort(&mut self) {
        for child in &self.children {
            if child.report_rx.is_some() {
                let _ = kill(child.pid, Signal::SIGTERM);
            }
        }
        for child in &mut self.children {
            join_child(child);
        }
        self.joined = true;
        self.pipes = None;
    }

    /// The pipe set backing this run, while it is alive.
    pub fn pipe_set(&self) -> Option<&PipeSet> {
        self.pipes.as_ref()
    }
}

impl Drop for RunningWorkflow {
    fn drop(&mut self) {
        if !self.joined {
            warn!(workflow = %self.workflow_name, "workflow handle dropped before join; aborting");
            self.abort();
        }
    }
}

/// Forks stages in reverse registration order. Subworkflows are expanded in
/// place: their stages start in reverse and join in forward order inline
/// within the parent sweep.
fn start_sweep(nodes: Vec<Node>, pipes: &PipeSet, children: &mut Vec<ChildStage>) -> Result<()> {
    for node in nodes.into_iter().rev() {
        match node {
            Node::Stage(stage) => children.push(spawn_stage(stage, pipes)?),
            Node::Sub(sub) => {
                debug!(sub = %sub.name(), "expanding subworkflow inline");
                let first = children.len();
                start_sweep(sub.nodes, pipes, children)?;
                for child in children[first..].iter_mut().rev() {
                    join_child(child);
                }
            }
        }
    }
    Ok(())
}

fn spawn_stage(stage: Stage, pipes: &PipeSet) -> Result<ChildStage> {
    let name = stage.name().to_string();
    let (report_rx, report_tx) = os_pipe::pipe()?;
    debug!(stage = %name, "forking stage process");

    // SAFETY: the runtime spawns no threads of its own; stages are forked
    // sequentially from the single thread driving the workflow.
    match unsafe { fork() } {
        Err(errno) => Err(Error::Io(std::io::Error::from_raw_os_error(errno as i32))),
        Ok(ForkResult::Child) => {
            drop(report_rx);
            let report = stage.execute(pipes);
            let mut tx = report_tx;
            if let Ok(payload) = serde_json::to_vec(&report) {
                let _ = tx.write_all(&payload);
            }
            drop(tx);
            // Exit without unwinding: the pipe set belongs to the parent and
            // must not be torn down from the child.
            std::process::exit(0);
        }
        Ok(ForkResult::Parent { child }) => {
            drop(report_tx);
            Ok(ChildStage {
                name,
                pid: child,
                report_rx: Some(report_rx),
                report: None,
            })
        }
    }
}

/// Drains a child's report pipe, then reaps the process.
///
/// The report is read before `waitpid` so a child flushing a large report
/// cannot block on a full pipe while the parent waits for it to exit.
fn join_child(child: &mut ChildStage) {
    let Some(mut rx) = child.report_rx.take() else {
        return;
    };
    debug!(stage = %child.name, "waiting for stage");
    let mut payload = Vec::new();
    let read = rx.read_to_end(&mut payload);
    drop(rx);
    let status = waitpid(child.pid, None);

    child.report = Some(match read {
        Ok(0) => StageReport::failure(
            &child.name,
            vec![format!(
                "stage exited without reporting ({})",
                describe_status(&status)
            )],
        ),
        Ok(_) => serde_json::from_slice(&payload).unwrap_or_else(|e| {
            StageReport::failure(&child.name, vec![format!("unreadable stage report: {e}")])
        }),
        Err(e) => StageReport::failure(&child.name, vec![format!("reading stage report: {e}")]),
    });
}

fn describe_status(status: &nix::Result<WaitStatus>) -> String {
    match status {
        Ok(WaitStatus::Exited(_, code)) => format!("exit status {code}"),
        Ok(WaitStatus::Signaled(_, signal, _)) => format!("killed by {signal:?}"),
        Ok(other) => format!("{other:?}"),
        Err(e) => format!("waitpid failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::stage::StageSpec;
    use serial_test::serial;
    use std::io::BufRead;

    #[test]
    #[serial]
    fn run_publishes_results_and_unlinks_pipes() {
        let mut wf = Workflow::new("rt");
        wf.add_stage(
            StageSpec::new("{workflow}.emit{n}", |args| {
                let mut out = args.take_writer("out")?;
                for i in 0..3 {
                    writeln!(out, "record {i}")?;
                }
                Ok(Value::Null)
            })
            .bind("out", Endpoint::writer("text")),
        )
        .unwrap();
        wf.add_stage(
            StageSpec::new("{workflow}.count{n}", |args| {
                let reader = args.take_reader("src")?;
                Ok(Value::from(reader.lines().count() as u64))
            })
            .bind("src", Endpoint::reader("text")),
        )
        .unwrap();

        let running = wf.start().unwrap();
        let fifo_dir = running.pipe_set().unwrap().base_dir().to_path_buf();
        assert!(fifo_dir.join("text").exists());

        let summary = running.join().unwrap();
        assert_eq!(summary.result("rt.count0"), Some(&Value::from(3)));
        assert!(!fifo_dir.exists());
    }

    #[test]
    #[serial]
    fn failures_surface_as_stage_failures() {
        let mut wf = Workflow::new("rt");
        wf.add_stage(
            StageSpec::new("{workflow}.bad{n}", |args| {
                let _out = args.take_writer("out")?;
                anyhow::bail!("deliberate failure")
            })
            .bind("out", Endpoint::writer("text")),
        )
        .unwrap();
        wf.add_stage(
            StageSpec::new("{workflow}.sink{n}", |args| {
                let reader = args.take_reader("src")?;
                Ok(Value::from(reader.lines().count() as u64))
            })
            .bind("src", Endpoint::reader("text")),
        )
        .unwrap();

        match wf.run() {
            Err(Error::StageFailures(summary)) => {
                assert_eq!(summary.failed_stage_names(), vec!["rt.bad0"]);
                assert!(summary.failures["rt.bad0"]
                    .iter()
                    .any(|l| l.contains("deliberate failure")));
                // The sink saw EOF and still completed.
                assert_eq!(summary.result("rt.sink0"), Some(&Value::from(0)));
            }
            other => panic!("expected StageFailures, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn unbalanced_workflow_never_forks() {
        let mut wf = Workflow::new("rt");
        wf.add_stage(
            StageSpec::new("{workflow}.sink{n}", |args| {
                let _ = args.take_reader("src")?;
                Ok(Value::Null)
            })
            .bind("src", Endpoint::reader("orphan")),
        )
        .unwrap();
        assert!(matches!(wf.run(), Err(Error::UnbalancedGraph { .. })));
    }
}

//! A user function packaged with its endpoint bindings, ready to execute
//! inside a child process.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::endpoint::{Direction, Endpoint};
use crate::error::{Error, Result};
use crate::plumbing::PipeSet;

/// Buffered read half of a managed pipe.
pub type FifoReader = BufReader<File>;
/// Buffered write half of a managed pipe.
pub type FifoWriter = BufWriter<File>;

/// The user function executed by a stage.
///
/// It receives its opened endpoints and scalar arguments through
/// [`StageArgs`]; the returned JSON value is published in the workflow result
/// map under the stage name.
pub type StageFn = Box<dyn FnOnce(&mut StageArgs) -> anyhow::Result<Value> + Send>;

/// Declarative description of a stage, consumed by
/// [`Workflow::add_stage`](crate::workflow::Workflow::add_stage).
pub struct StageSpec {
    pub(crate) name_pattern: String,
    pub(crate) func: StageFn,
    pub(crate) endpoints: Vec<(String, Endpoint)>,
    pub(crate) scalars: Map<String, Value>,
    pub(crate) expect_readers_ge: Option<usize>,
    pub(crate) expect_writers_ge: Option<usize>,
}

impl StageSpec {
    /// Creates a spec from a name pattern (`{workflow}` and `{n}`
    /// placeholders allowed) and the stage function.
    pub fn new<F>(name_pattern: impl Into<String>, func: F) -> Self
    where
        F: FnOnce(&mut StageArgs) -> anyhow::Result<Value> + Send + 'static,
    {
        Self {
            name_pattern: name_pattern.into(),
            func: Box::new(func),
            endpoints: Vec::new(),
            scalars: Map::new(),
            expect_readers_ge: None,
            expect_writers_ge: None,
        }
    }

    /// Binds an endpoint under an argument key the stage function will use to
    /// retrieve it.
    pub fn bind(mut self, key: impl Into<String>, endpoint: Endpoint) -> Self {
        self.endpoints.push((key.into(), endpoint));
        self
    }

    /// Declares a plain (non-FIFO) argument.
    pub fn scalar(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.scalars.insert(key.into(), value.into());
        self
    }

    /// Requires at least `n` reading pipe slots once expanded.
    pub fn expect_readers_ge(mut self, n: usize) -> Self {
        self.expect_readers_ge = Some(n);
        self
    }

    /// Requires at least `n` writing pipe slots once expanded.
    pub fn expect_writers_ge(mut self, n: usize) -> Self {
        self.expect_writers_ge = Some(n);
        self
    }
}

/// A resolved endpoint binding: argument key, endpoint, expanded pipe names.
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub(crate) key: String,
    pub(crate) endpoint: Endpoint,
    pub(crate) pipes: Vec<String>,
}

/// A registered stage: rendered name, function and resolved bindings.
///
/// One process per stage: `start` forks exactly once, `join` reaps it.
pub struct Stage {
    pub(crate) name: String,
    pub(crate) func: StageFn,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) scalars: Map<String, Value>,
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("bindings", &self.bindings)
            .field("scalars", &self.scalars)
            .finish_non_exhaustive()
    }
}

impl Stage {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the stage to completion in the current process.
    ///
    /// This is the child-process half of stage execution: open managed
    /// endpoints, invoke the user function, flush and close whatever it did
    /// not consume, and fold the outcome into a [`StageReport`]. Errors are
    /// captured rather than propagated so the process can exit normally and
    /// peers observe EOF instead of a vanished partner.
    pub(crate) fn execute(self, pipes: &PipeSet) -> StageReport {
        let Stage {
            name,
            func,
            bindings,
            scalars,
        } = self;
        debug!(stage = %name, "stage starting");

        let mut args = match build_args(&name, &bindings, scalars, pipes) {
            Ok(args) => args,
            Err(e) => return StageReport::failure(&name, error_lines(&e)),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| func(&mut args)));

        let mut report = match outcome {
            Ok(Ok(value)) => StageReport::success(value),
            Ok(Err(e)) => StageReport::failure(&name, anyhow_lines(&e)),
            Err(payload) => StageReport::failure(&name, vec![panic_line(payload.as_ref())]),
        };

        // Flush writers first, then drop everything the function left behind.
        for (_, writers) in args.writers.iter_mut() {
            for w in writers.iter_mut() {
                if let Err(e) = w.flush() {
                    if report.failure.is_none() {
                        report = StageReport::failure(&name, vec![format!("flush failed: {e}")]);
                    }
                }
            }
        }
        drop(args);

        debug!(stage = %name, failed = report.failure.is_some(), "stage finished");
        report
    }
}

/// Outcome of one stage, shipped from the child to the orchestrator as a
/// single JSON document over the report pipe.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StageReport {
    pub(crate) result: Option<Value>,
    pub(crate) failure: Option<Vec<String>>,
}

impl StageReport {
    fn success(value: Value) -> Self {
        Self {
            result: Some(value),
            failure: None,
        }
    }

    pub(crate) fn failure(stage: &str, lines: Vec<String>) -> Self {
        Self {
            result: None,
            failure: Some(
                std::iter::once(format!("stage '{stage}' failed"))
                    .chain(lines)
                    .collect(),
            ),
        }
    }
}

/// Arguments handed to a stage function: opened handles for managed
/// endpoints, raw paths for unmanaged ones, scalars, and the runtime
/// internals (job name and per-pipe buffer size).
pub struct StageArgs {
    job_name: String,
    pipe_buffer: usize,
    readers: BTreeMap<String, Vec<FifoReader>>,
    writers: BTreeMap<String, Vec<FifoWriter>>,
    paths: BTreeMap<String, Vec<PathBuf>>,
    scalars: Map<String, Value>,
}

impl StageArgs {
    /// The rendered stage name.
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// The uniform kernel capacity of the workflow's pipes, in bytes.
    pub fn pipe_buffer(&self) -> usize {
        self.pipe_buffer
    }

    /// Takes the single opened read handle of a managed fan-1 endpoint.
    pub fn take_reader(&mut self, key: &str) -> anyhow::Result<FifoReader> {
        let mut handles = self.take_readers(key)?;
        if handles.len() != 1 {
            anyhow::bail!(
                "endpoint '{key}' expands to {} pipes; use take_readers()",
                handles.len()
            );
        }
        Ok(handles.pop().expect("length checked"))
    }

    /// Takes every opened read handle of a managed endpoint, in fan order.
    pub fn take_readers(&mut self, key: &str) -> anyhow::Result<Vec<FifoReader>> {
        self.readers
            .remove(key)
            .ok_or_else(|| anyhow::anyhow!("no managed reader endpoint '{key}' (taken already, unmanaged, or never bound)"))
    }

    /// Takes the single opened write handle of a managed fan-1 endpoint.
    pub fn take_writer(&mut self, key: &str) -> anyhow::Result<FifoWriter> {
        let mut handles = self.take_writers(key)?;
        if handles.len() != 1 {
            anyhow::bail!(
                "endpoint '{key}' expands to {} pipes; use take_writers()",
                handles.len()
            );
        }
        Ok(handles.pop().expect("length checked"))
    }

    /// Takes every opened write handle of a managed endpoint, in fan order.
    pub fn take_writers(&mut self, key: &str) -> anyhow::Result<Vec<FifoWriter>> {
        self.writers
            .remove(key)
            .ok_or_else(|| anyhow::anyhow!("no managed writer endpoint '{key}' (taken already, unmanaged, or never bound)"))
    }

    /// Path of an unmanaged fan-1 endpoint.
    pub fn path(&self, key: &str) -> anyhow::Result<PathBuf> {
        let paths = self.pipe_paths(key)?;
        if paths.len() != 1 {
            anyhow::bail!(
                "endpoint '{key}' expands to {} pipes; use pipe_paths()",
                paths.len()
            );
        }
        Ok(paths[0].clone())
    }

    /// Paths of an unmanaged endpoint, in fan order.
    pub fn pipe_paths(&self, key: &str) -> anyhow::Result<&[PathBuf]> {
        self.paths
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| anyhow::anyhow!("no unmanaged endpoint '{key}'"))
    }

    /// Deserializes a scalar argument declared at registration.
    pub fn scalar<T: serde::de::DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .scalars
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("no scalar argument '{key}'"))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Looks up a scalar, falling back to a default when absent.
    pub fn scalar_or<T: serde::de::DeserializeOwned>(&self, key: &str, default: T) -> anyhow::Result<T> {
        match self.scalars.get(key) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(default),
        }
    }
}

/// Opens managed endpoints and resolves unmanaged paths.
///
/// Readers are opened before writers so that a stage first parks on its
/// upstream pipe; combined with the reverse start order this lets the whole
/// graph cascade open from the sources.
fn build_args(
    job_name: &str,
    bindings: &[Binding],
    scalars: Map<String, Value>,
    pipes: &PipeSet,
) -> Result<StageArgs> {
    let mut args = StageArgs {
        job_name: job_name.to_string(),
        pipe_buffer: pipes.buffer_size(),
        readers: BTreeMap::new(),
        writers: BTreeMap::new(),
        paths: BTreeMap::new(),
        scalars,
    };

    for binding in bindings.iter().filter(|b| !b.endpoint.is_managed()) {
        let mut resolved = Vec::with_capacity(binding.pipes.len());
        for pipe in &binding.pipes {
            resolved.push(pipes.path(pipe)?.to_path_buf());
        }
        args.paths.insert(binding.key.clone(), resolved);
    }

    let managed = |dir: Direction| {
        bindings
            .iter()
            .filter(move |b| b.endpoint.is_managed() && b.endpoint.direction() == dir)
    };

    for binding in managed(Direction::Reader) {
        let mut handles = Vec::with_capacity(binding.pipes.len());
        for pipe in &binding.pipes {
            handles.push(BufReader::new(pipes.open(pipe, Direction::Reader)?));
        }
        args.readers.insert(binding.key.clone(), handles);
    }
    for binding in managed(Direction::Writer) {
        let mut handles = Vec::with_capacity(binding.pipes.len());
        for pipe in &binding.pipes {
            handles.push(BufWriter::new(pipes.open(pipe, Direction::Writer)?));
        }
        args.writers.insert(binding.key.clone(), handles);
    }

    Ok(args)
}

fn error_lines(err: &Error) -> Vec<String> {
    vec![err.to_string()]
}

fn anyhow_lines(err: &anyhow::Error) -> Vec<String> {
    err.chain().map(|cause| cause.to_string()).collect()
}

fn panic_line(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}

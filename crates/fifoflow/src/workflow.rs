//! Workflow graph construction and validation.
//!
//! A [`Workflow`] registers stages, tracks a signed per-pipe balance
//! (readers − writers, times the declared reopen count) and rejects any
//! graph in which some pipe would block forever on open because one side is
//! missing. Stage names render from patterns carrying `{workflow}` and a
//! per-pattern auto-incrementing `{n}`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;

use serde_json::Value;
use tracing::{debug, error};

use crate::config::PlumbingOptions;
use crate::endpoint::{Direction, Endpoint};
use crate::error::{Error, Result};
use crate::parts;
use crate::parts::collector::{CollectHeader, CollectHeaderBinding, CollectOpts, CollectSpec, SinkTarget};
use crate::parts::distributor::{
    DistributeOpts, DistributeSpec, HeaderBinding, HeaderDetect, HeaderPolicy,
};
use crate::stage::{Binding, Stage, StageSpec};

/// One slot of the registration list: a stage, or a nested workflow expanded
/// in place during the start/join sweeps.
pub(crate) enum Node {
    Stage(Stage),
    Sub(Workflow),
}

/// The workflow graph builder.
pub struct Workflow {
    pub(crate) name: String,
    pub(crate) options: PlumbingOptions,
    pub(crate) nodes: Vec<Node>,
    balance: BTreeMap<String, i64>,
    readers: BTreeMap<String, Vec<String>>,
    writers: BTreeMap<String, Vec<String>>,
    fan_by_collection: HashMap<String, usize>,
    job_count_by_pattern: HashMap<String, usize>,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, PlumbingOptions::default())
    }

    pub fn with_options(name: impl Into<String>, options: PlumbingOptions) -> Self {
        Self {
            name: name.into(),
            options,
            nodes: Vec::new(),
            balance: BTreeMap::new(),
            readers: BTreeMap::new(),
            writers: BTreeMap::new(),
            fan_by_collection: HashMap::new(),
            job_count_by_pattern: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a stage from its spec.
    pub fn add_stage(&mut self, spec: StageSpec) -> Result<&mut Self> {
        self.add_stage_indexed(spec, None)
    }

    /// Registers a stage, resolving `{n}` in its endpoint templates from the
    /// given replication index.
    pub(crate) fn add_stage_indexed(
        &mut self,
        spec: StageSpec,
        index: Option<usize>,
    ) -> Result<&mut Self> {
        let StageSpec {
            name_pattern,
            func,
            endpoints,
            scalars,
            expect_readers_ge,
            expect_writers_ge,
        } = spec;

        let name = self.render_stage_name(&name_pattern);
        if self
            .nodes
            .iter()
            .any(|node| matches!(node, Node::Stage(s) if s.name == name))
        {
            return Err(Error::invalid_config(format!(
                "stage '{name}' is already registered"
            )));
        }

        let mut bindings = Vec::new();
        let mut seen_keys = BTreeSet::new();
        let mut reader_slots = 0usize;
        let mut writer_slots = 0usize;
        for (key, endpoint) in endpoints {
            if !seen_keys.insert(key.clone()) {
                return Err(Error::invalid_endpoint(format!(
                    "stage '{name}' binds '{key}' twice"
                )));
            }
            let resolved = endpoint.resolve(&self.name, index)?;
            self.check_fan_consistency(&resolved)?;
            let pipes = resolved.expand()?;

            let delta = resolved.reopen_count() as i64;
            for pipe in &pipes {
                if resolved.is_reader() {
                    *self.balance.entry(pipe.clone()).or_default() += delta;
                    self.readers.entry(pipe.clone()).or_default().push(name.clone());
                    reader_slots += 1;
                } else {
                    *self.balance.entry(pipe.clone()).or_default() -= delta;
                    self.writers.entry(pipe.clone()).or_default().push(name.clone());
                    writer_slots += 1;
                }
            }
            bindings.push(Binding {
                key,
                endpoint: resolved,
                pipes,
            });
        }

        if let Some(min) = expect_readers_ge {
            if reader_slots < min {
                return Err(Error::invalid_config(format!(
                    "stage '{name}' expected at least {min} reading pipes, has {reader_slots}"
                )));
            }
        }
        if let Some(min) = expect_writers_ge {
            if writer_slots < min {
                return Err(Error::invalid_config(format!(
                    "stage '{name}' expected at least {min} writing pipes, has {writer_slots}"
                )));
            }
        }

        debug!(stage = %name, reader_slots, writer_slots, "registered stage");
        self.nodes.push(Node::Stage(Stage {
            name,
            func,
            bindings,
            scalars,
        }));
        Ok(self)
    }

    /// Attaches a nested workflow. It borrows the parent's pipe set at run
    /// time and its stages run inline within the parent's start/join sweep.
    pub fn add_subworkflow(&mut self, sub: Workflow) -> &mut Self {
        self.nodes.push(Node::Sub(sub));
        self
    }

    /// Validates that every pipe of the folded graph has both sides.
    pub fn check(&self) -> Result<()> {
        let mut offender: Option<(String, i64)> = None;
        for (pipe, bal) in self.folded_balance() {
            if bal > 0 {
                error!(pipe = %pipe, balance = bal, "fifo has a reader but no writer");
                offender.get_or_insert((pipe, bal));
            } else if bal < 0 {
                error!(pipe = %pipe, balance = bal, "fifo has a writer but no reader");
                offender.get_or_insert((pipe, bal));
            }
        }
        match offender {
            Some((pipe, balance)) => Err(Error::UnbalancedGraph { pipe, balance }),
            None => Ok(()),
        }
    }

    /// Sorted logical pipe names of the folded graph (subworkflows
    /// included); these are exactly the FIFOs `run` will create.
    pub fn pipe_list(&self) -> Vec<String> {
        self.folded_balance().into_keys().collect()
    }

    /// Stages reading a pipe, by registration order.
    pub fn readers_of(&self, pipe: &str) -> &[String] {
        self.readers.get(pipe).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Stages writing a pipe, by registration order.
    pub fn writers_of(&self, pipe: &str) -> &[String] {
        self.writers.get(pipe).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn folded_balance(&self) -> BTreeMap<String, i64> {
        let mut acc = BTreeMap::new();
        self.fold_balance_into(&mut acc);
        acc
    }

    fn fold_balance_into(&self, acc: &mut BTreeMap<String, i64>) {
        for (pipe, bal) in &self.balance {
            *acc.entry(pipe.clone()).or_default() += bal;
        }
        for node in &self.nodes {
            if let Node::Sub(sub) = node {
                sub.fold_balance_into(acc);
            }
        }
    }

    fn render_stage_name(&mut self, pattern: &str) -> String {
        let counter = self.job_count_by_pattern.entry(pattern.to_string()).or_insert(0);
        let name = pattern
            .replace("{workflow}", &self.name)
            .replace("{n}", &counter.to_string());
        *counter += 1;
        name
    }

    /// All endpoints using a collection template must agree on the fan.
    fn check_fan_consistency(&mut self, endpoint: &Endpoint) -> Result<()> {
        if endpoint.fan_count() <= 1 {
            return Ok(());
        }
        let template = endpoint.name().to_string();
        match self.fan_by_collection.get(&template) {
            Some(&fan) if fan != endpoint.fan_count() => Err(Error::invalid_endpoint(format!(
                "collection '{template}' was declared with fan {fan}, now redeclared with fan {}",
                endpoint.fan_count()
            ))),
            Some(_) => Ok(()),
            None => {
                self.fan_by_collection.insert(template, endpoint.fan_count());
                Ok(())
            }
        }
    }
}

/// Preset stage registrations, the short-hands workflows are composed from.
impl Workflow {
    /// Registers a source stage; it must write at least one pipe.
    pub fn reader(&mut self, mut spec: StageSpec) -> Result<&mut Self> {
        spec.expect_writers_ge.get_or_insert(1);
        self.add_stage(spec)
    }

    /// Registers a stage that decompresses gzip files into a binary pipe.
    /// The stage result is the number of decompressed bytes.
    pub fn gz_reader(
        &mut self,
        inputs: Vec<PathBuf>,
        output: Endpoint,
    ) -> Result<&mut Self> {
        require_direction(&output, Direction::Writer, "gz_reader output")?;
        let spec = StageSpec::new("{workflow}.gz_reader{n}", move |args| {
            let mut out = args.take_writer("output")?;
            let n_bytes = parts::gz_reader(&inputs, &mut out)?;
            Ok(Value::from(n_bytes))
        })
        .bind("output", output.binary())
        .expect_writers_ge(1);
        self.add_stage(spec)
    }

    /// Registers a stage that copies plain-text files into a pipe.
    /// The stage result is the number of records copied.
    pub fn text_reader(
        &mut self,
        inputs: Vec<PathBuf>,
        output: Endpoint,
    ) -> Result<&mut Self> {
        require_direction(&output, Direction::Writer, "text_reader output")?;
        let spec = StageSpec::new("{workflow}.text_reader{n}", move |args| {
            let mut out = args.take_writer("output")?;
            let n_records = parts::text_reader(&inputs, &mut out)?;
            Ok(Value::from(n_records))
        })
        .bind("output", output)
        .expect_writers_ge(1);
        self.add_stage(spec)
    }

    /// Registers a BAM → SAM conversion stage shelling out to samtools.
    /// The output endpoint must be unmanaged: the tool opens the path itself.
    pub fn bam_reader(
        &mut self,
        input: PathBuf,
        output: Endpoint,
        threads: usize,
    ) -> Result<&mut Self> {
        require_direction(&output, Direction::Writer, "bam_reader output")?;
        let spec = StageSpec::new("{workflow}.bam_reader{n}", move |args| {
            let out = args.path("output")?;
            let code = parts::bam_reader(&input, &out, threads)?;
            anyhow::ensure!(code == 0, "samtools exited with status {code}");
            Ok(Value::from(code))
        })
        .bind("output", output.unmanaged())
        .expect_writers_ge(1);
        self.add_stage(spec)
    }

    /// Registers a distributor stage splitting one pipe into N.
    pub fn distribute(&mut self, spec: DistributeSpec) -> Result<&mut Self> {
        let DistributeSpec {
            input,
            outputs,
            chunk_size,
            routing,
            header,
        } = spec;
        if chunk_size == 0 {
            return Err(Error::invalid_config("distributor chunk_size must be positive"));
        }
        require_direction(&input, Direction::Reader, "distributor input")?;
        require_direction(&outputs, Direction::Writer, "distributor outputs")?;

        enum HeaderMode {
            None,
            Broadcast(HeaderDetect),
            Sidecar(HeaderDetect),
        }
        let (mode, sidecar) = match header {
            HeaderBinding::None => (HeaderMode::None, None),
            HeaderBinding::Broadcast(detect) => (HeaderMode::Broadcast(detect), None),
            HeaderBinding::Sidecar { detect, fifo } => {
                require_direction(&fifo, Direction::Writer, "distributor header pipe")?;
                (HeaderMode::Sidecar(detect), Some(fifo.unmanaged()))
            }
        };

        let mut stage = StageSpec::new("{workflow}.dist{n}", move |args| {
            let input = args.path("input")?;
            let outputs = args.pipe_paths("outputs")?.to_vec();
            let header = match mode {
                HeaderMode::None => HeaderPolicy::None,
                HeaderMode::Broadcast(detect) => HeaderPolicy::Broadcast { detect },
                HeaderMode::Sidecar(detect) => HeaderPolicy::Sidecar {
                    detect,
                    fifo: args.path("header")?,
                },
            };
            let stats = parts::distribute(
                &input,
                &outputs,
                DistributeOpts {
                    chunk_size,
                    routing,
                    header,
                    pipe_capacity: Some(args.pipe_buffer()),
                },
            )?;
            Ok(serde_json::to_value(stats)?)
        })
        .bind("input", input.unmanaged())
        .bind("outputs", outputs.unmanaged())
        .expect_readers_ge(1)
        .expect_writers_ge(1);
        if let Some(fifo) = sidecar {
            stage = stage.bind("header", fifo);
        }
        self.add_stage(stage)
    }

    /// Registers `n` copies of a worker stage. The spec returned by `make`
    /// gets its `{n}` endpoint placeholders resolved to the worker index.
    pub fn workers<F>(&mut self, n: usize, mut make: F) -> Result<&mut Self>
    where
        F: FnMut(usize) -> StageSpec,
    {
        for i in 0..n {
            let mut spec = make(i);
            spec.expect_readers_ge.get_or_insert(1);
            self.add_stage_indexed(spec, Some(i))?;
        }
        Ok(self)
    }

    /// Registers a collector stage merging N pipes into one sink.
    pub fn collect(&mut self, spec: CollectSpec) -> Result<&mut Self> {
        let CollectSpec {
            inputs,
            output,
            chunk_size,
            header,
        } = spec;
        if chunk_size == 0 {
            return Err(Error::invalid_config("collector chunk_size must be positive"));
        }
        require_direction(&inputs, Direction::Reader, "collector inputs")?;

        enum SinkMode {
            Pipe,
            Path(PathBuf),
        }
        let (sink_mode, sink_endpoint) = match output {
            SinkTarget::Pipe(ep) => {
                require_direction(&ep, Direction::Writer, "collector output")?;
                (SinkMode::Pipe, Some(ep.unmanaged()))
            }
            SinkTarget::Path(path) => (SinkMode::Path(path), None),
        };

        enum HeaderMode {
            None,
            Fifo,
            Literal(String),
        }
        let (header_mode, header_endpoint) = match header {
            CollectHeaderBinding::None => (HeaderMode::None, None),
            CollectHeaderBinding::Literal(s) => (HeaderMode::Literal(s), None),
            CollectHeaderBinding::Fifo(ep) => {
                require_direction(&ep, Direction::Reader, "collector header pipe")?;
                (HeaderMode::Fifo, Some(ep.unmanaged()))
            }
        };

        let mut stage = StageSpec::new("{workflow}.collect{n}", move |args| {
            let inputs = args.pipe_paths("inputs")?.to_vec();
            let output = match &sink_mode {
                SinkMode::Pipe => args.path("output")?,
                SinkMode::Path(path) => path.clone(),
            };
            let header = match header_mode {
                HeaderMode::None => CollectHeader::None,
                HeaderMode::Literal(s) => CollectHeader::Literal(s),
                HeaderMode::Fifo => CollectHeader::Fifo(args.path("header")?),
            };
            let stats = parts::collect(
                &inputs,
                &output,
                CollectOpts {
                    chunk_size,
                    header,
                    pipe_capacity: Some(args.pipe_buffer()),
                },
            )?;
            Ok(serde_json::to_value(stats)?)
        })
        .bind("inputs", inputs.unmanaged())
        .expect_readers_ge(1);
        if let Some(ep) = sink_endpoint {
            stage = stage.bind("output", ep);
        }
        if let Some(ep) = header_endpoint {
            stage = stage.bind("header", ep);
        }
        self.add_stage(stage)
    }

    /// Registers an arbitrary stage; an alias of [`add_stage`](Self::add_stage)
    /// kept for readable workflow compositions.
    pub fn funnel(&mut self, spec: StageSpec) -> Result<&mut Self> {
        self.add_stage(spec)
    }
}

impl fmt::Display for Workflow {
    /// Renders the wiring: which stages feed and which drain every pipe.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Workflow({})", self.name)?;
        for (pipe, stages) in &self.writers {
            writeln!(f, "  [{}] -> {pipe}", stages.join(", "))?;
        }
        for (pipe, stages) in &self.readers {
            writeln!(f, "  {pipe} -> [{}]", stages.join(", "))?;
        }
        for node in &self.nodes {
            if let Node::Sub(sub) = node {
                writeln!(f, "  sub: {}", sub.name)?;
            }
        }
        Ok(())
    }
}

fn require_direction(endpoint: &Endpoint, expected: Direction, what: &str) -> Result<()> {
    if endpoint.direction() != expected {
        return Err(Error::invalid_endpoint(format!(
            "{what} must be a {} endpoint",
            match expected {
                Direction::Reader => "reader",
                Direction::Writer => "writer",
            }
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageSpec;
    use serde_json::Value;

    fn noop() -> impl FnOnce(&mut crate::stage::StageArgs) -> anyhow::Result<Value> + Send {
        |_| Ok(Value::Null)
    }

    #[test]
    fn stage_names_render_with_per_pattern_counters() {
        let mut wf = Workflow::new("wf");
        wf.add_stage(StageSpec::new("{workflow}.worker{n}", noop())).unwrap();
        wf.add_stage(StageSpec::new("{workflow}.worker{n}", noop())).unwrap();
        wf.add_stage(StageSpec::new("{workflow}.reader{n}", noop())).unwrap();

        let names: Vec<&str> = wf
            .nodes
            .iter()
            .filter_map(|n| match n {
                Node::Stage(s) => Some(s.name()),
                Node::Sub(_) => None,
            })
            .collect();
        assert_eq!(names, vec!["wf.worker0", "wf.worker1", "wf.reader0"]);
    }

    #[test]
    fn balanced_graph_passes_check() {
        let mut wf = Workflow::new("wf");
        wf.add_stage(
            StageSpec::new("{workflow}.src{n}", noop()).bind("out", Endpoint::writer("text")),
        )
        .unwrap();
        wf.add_stage(
            StageSpec::new("{workflow}.sink{n}", noop()).bind("src", Endpoint::reader("text")),
        )
        .unwrap();
        wf.check().unwrap();
        assert_eq!(wf.pipe_list(), vec!["text"]);
    }

    #[test]
    fn missing_writer_is_unbalanced() {
        let mut wf = Workflow::new("wf");
        wf.add_stage(
            StageSpec::new("{workflow}.sink{n}", noop()).bind("src", Endpoint::reader("text")),
        )
        .unwrap();
        match wf.check() {
            Err(Error::UnbalancedGraph { pipe, balance }) => {
                assert_eq!(pipe, "text");
                assert_eq!(balance, 1);
            }
            other => panic!("expected UnbalancedGraph, got {other:?}"),
        }
    }

    #[test]
    fn fanned_endpoints_balance_against_indexed_workers() {
        let mut wf = Workflow::new("wf");
        wf.add_stage(
            StageSpec::new("{workflow}.fan{n}", noop())
                .bind("outs", Endpoint::writer("dist{n}").fan(3)),
        )
        .unwrap();
        wf.workers(3, |_| {
            StageSpec::new("{workflow}.worker{n}", noop()).bind("src", Endpoint::reader("dist{n}"))
        })
        .unwrap();
        wf.check().unwrap();
        assert_eq!(wf.pipe_list(), vec!["dist0", "dist1", "dist2"]);
    }

    #[test]
    fn collection_fan_mismatch_is_rejected() {
        let mut wf = Workflow::new("wf");
        wf.add_stage(
            StageSpec::new("{workflow}.a{n}", noop())
                .bind("outs", Endpoint::writer("dist{n}").fan(3)),
        )
        .unwrap();
        let err = wf
            .add_stage(
                StageSpec::new("{workflow}.b{n}", noop())
                    .bind("ins", Endpoint::reader("dist{n}").fan(4)),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint { .. }));
    }

    #[test]
    fn reopen_multiplies_the_balance() {
        let mut wf = Workflow::new("wf");
        wf.add_stage(
            StageSpec::new("{workflow}.w{n}", noop())
                .bind("out", Endpoint::writer("text").unmanaged().reopen(2)),
        )
        .unwrap();
        wf.add_stage(
            StageSpec::new("{workflow}.r{n}", noop())
                .bind("src", Endpoint::reader("text").unmanaged().reopen(2)),
        )
        .unwrap();
        wf.check().unwrap();
    }

    #[test]
    fn subworkflow_pipes_fold_into_the_parent() {
        let mut sub = Workflow::new("sub");
        sub.add_stage(
            StageSpec::new("{workflow}.sink{n}", noop()).bind("src", Endpoint::reader("shared")),
        )
        .unwrap();

        let mut wf = Workflow::new("wf");
        wf.add_stage(
            StageSpec::new("{workflow}.src{n}", noop()).bind("out", Endpoint::writer("shared")),
        )
        .unwrap();
        assert!(wf.check().is_err());
        wf.add_subworkflow(sub);
        wf.check().unwrap();
        assert_eq!(wf.pipe_list(), vec!["shared"]);
    }

    #[test]
    fn expectations_are_enforced() {
        let mut wf = Workflow::new("wf");
        let err = wf
            .reader(StageSpec::new("{workflow}.reader{n}", noop()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn display_shows_the_wiring() {
        let mut wf = Workflow::new("wf");
        wf.add_stage(
            StageSpec::new("{workflow}.src{n}", noop()).bind("out", Endpoint::writer("text")),
        )
        .unwrap();
        wf.add_stage(
            StageSpec::new("{workflow}.sink{n}", noop()).bind("src", Endpoint::reader("text")),
        )
        .unwrap();

        let rendered = wf.to_string();
        assert!(rendered.contains("Workflow(wf)"));
        assert!(rendered.contains("[wf.src0] -> text"));
        assert!(rendered.contains("text -> [wf.sink0]"));
    }

    #[test]
    fn duplicate_binding_key_is_rejected() {
        let mut wf = Workflow::new("wf");
        let err = wf
            .add_stage(
                StageSpec::new("{workflow}.s{n}", noop())
                    .bind("x", Endpoint::reader("a"))
                    .bind("x", Endpoint::reader("b")),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint { .. }));
    }
}

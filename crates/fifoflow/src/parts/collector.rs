//! Merges N record streams into one.
//!
//! Inputs are drained round-robin in input order, `chunk_size` records at a
//! time; an input that reaches EOF drops out of the rotation while the rest
//! continue. The output is optionally prefixed with a header drawn from a
//! dedicated header pipe or from a literal string.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::plumbing::{open_stream_reader, open_stream_writer};

use super::next_record;

/// Source of the header written before any body record.
pub enum CollectHeader {
    None,
    /// Drain this pipe to EOF and copy its content first.
    Fifo(PathBuf),
    /// Write this literal string first.
    Literal(String),
}

/// Parameters of a [`collect`] run.
pub struct CollectOpts {
    /// Records consumed from one input before advancing to the next.
    pub chunk_size: usize,
    pub header: CollectHeader,
    /// Kernel capacity request applied to each opened pipe, if any.
    pub pipe_capacity: Option<usize>,
}

impl Default for CollectOpts {
    fn default() -> Self {
        Self {
            chunk_size: 1,
            header: CollectHeader::None,
            pipe_capacity: None,
        }
    }
}

/// Counters published as the collector stage result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectStats {
    pub records_out: u64,
    pub header_bytes: u64,
    pub per_input: Vec<u64>,
}

/// Merges `inputs` into `output`.
///
/// For every input record exactly one record appears in the output; relative
/// order within one input is preserved, relative order across inputs follows
/// the round-robin schedule. The output is flushed and closed on return.
pub fn collect(
    inputs: &[PathBuf],
    output: &Path,
    opts: CollectOpts,
) -> anyhow::Result<CollectStats> {
    anyhow::ensure!(opts.chunk_size >= 1, "chunk_size must be positive");
    anyhow::ensure!(!inputs.is_empty(), "collector needs at least one input");

    let mut out = BufWriter::new(
        open_stream_writer(output, opts.pipe_capacity)
            .map_err(|e| anyhow::anyhow!("opening collector output {}: {e}", output.display()))?,
    );

    let mut header_bytes = 0u64;
    match &opts.header {
        CollectHeader::None => {}
        CollectHeader::Literal(header) => {
            out.write_all(header.as_bytes())?;
            header_bytes = header.len() as u64;
        }
        CollectHeader::Fifo(path) => {
            let mut header = Vec::new();
            open_stream_reader(path, opts.pipe_capacity)
                .map_err(|e| anyhow::anyhow!("opening header pipe {}: {e}", path.display()))?
                .read_to_end(&mut header)?;
            out.write_all(&header)?;
            header_bytes = header.len() as u64;
        }
    }

    let mut streams: Vec<Option<BufReader<File>>> = Vec::with_capacity(inputs.len());
    for path in inputs {
        streams.push(Some(BufReader::new(
            open_stream_reader(path, opts.pipe_capacity)
                .map_err(|e| anyhow::anyhow!("opening collector input {}: {e}", path.display()))?,
        )));
    }
    debug!(n_inputs = inputs.len(), output = %output.display(), "collector merging");

    let mut stats = CollectStats {
        records_out: 0,
        header_bytes,
        per_input: vec![0; inputs.len()],
    };
    let mut remaining = streams.len();
    let mut cursor = 0usize;
    while remaining > 0 {
        if let Some(stream) = streams[cursor].as_mut() {
            let mut consumed = 0;
            while consumed < opts.chunk_size {
                match next_record(stream)? {
                    Some(record) => {
                        out.write_all(&record)?;
                        stats.per_input[cursor] += 1;
                        stats.records_out += 1;
                        consumed += 1;
                    }
                    None => {
                        streams[cursor] = None;
                        remaining -= 1;
                        break;
                    }
                }
            }
        }
        cursor = (cursor + 1) % streams.len();
    }

    out.flush()?;
    debug!(records = stats.records_out, "collection complete");
    Ok(stats)
}

/// Destination of a collector: another pipe of the workflow, or a plain
/// filesystem path (a file, `/dev/stdout`, …) outside the pipe set.
pub enum SinkTarget {
    Pipe(Endpoint),
    Path(PathBuf),
}

/// Workflow-level description of a collector stage, consumed by
/// [`Workflow::collect`](crate::workflow::Workflow::collect).
///
/// Inputs and the optional header pipe are unmanaged: the collector opens
/// the paths itself.
pub struct CollectSpec {
    pub(crate) inputs: Endpoint,
    pub(crate) output: SinkTarget,
    pub(crate) chunk_size: usize,
    pub(crate) header: CollectHeaderBinding,
}

pub(crate) enum CollectHeaderBinding {
    None,
    Fifo(Endpoint),
    Literal(String),
}

impl CollectSpec {
    pub fn new(inputs: Endpoint, output: SinkTarget) -> Self {
        Self {
            inputs,
            output,
            chunk_size: 1,
            header: CollectHeaderBinding::None,
        }
    }

    pub fn chunk_size(mut self, records: usize) -> Self {
        self.chunk_size = records;
        self
    }

    /// Prefixes the output with the content of a header pipe.
    pub fn header_fifo(mut self, fifo: Endpoint) -> Self {
        self.header = CollectHeaderBinding::Fifo(fifo);
        self
    }

    /// Prefixes the output with a literal header string. Mutually exclusive
    /// with [`header_fifo`](Self::header_fifo): the latest call wins.
    pub fn custom_header(mut self, header: impl Into<String>) -> Self {
        self.header = CollectHeaderBinding::Literal(header.into());
        self
    }
}

//! Splits one record stream into N output streams.
//!
//! Records are `\n`-terminated byte lines. Routing is round-robin in runs of
//! `chunk_size` records, or key-sharded on a fixed-length record prefix. A
//! leading header region, identified by a user predicate, is either broadcast
//! verbatim to every output or diverted to a dedicated sidecar pipe.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::next_record;
use crate::endpoint::Endpoint;
use crate::plumbing::{open_stream_reader, open_stream_writer};

/// Predicate marking header lines. Consecutive matching lines from the start
/// of the stream form the header region; the first non-matching line is the
/// first body record.
pub type HeaderDetect = Box<dyn Fn(&[u8]) -> bool + Send>;

/// Record-to-output routing policy.
pub enum Routing {
    /// Deterministic round-robin starting at output 0, advancing after each
    /// chunk of records.
    RoundRobin,
    /// Static shard map over a fixed-length record prefix. Records lacking a
    /// mapped prefix fall through to output 0.
    ByKey {
        prefix_len: usize,
        table: HashMap<Vec<u8>, usize>,
    },
}

/// Header-region policy.
pub enum HeaderPolicy {
    /// No header detection; the body starts at the first line.
    None,
    /// Every output receives a verbatim copy of the header before any body
    /// record.
    Broadcast { detect: HeaderDetect },
    /// The header region is diverted to a dedicated pipe, which is flushed
    /// and closed before any body record is routed.
    Sidecar { detect: HeaderDetect, fifo: PathBuf },
}

/// Parameters of a [`distribute`] run.
pub struct DistributeOpts {
    /// Records routed to one destination before the cursor advances.
    pub chunk_size: usize,
    pub routing: Routing,
    pub header: HeaderPolicy,
    /// Kernel capacity request applied to each opened pipe, if any.
    pub pipe_capacity: Option<usize>,
}

impl Default for DistributeOpts {
    fn default() -> Self {
        Self {
            chunk_size: 1,
            routing: Routing::RoundRobin,
            header: HeaderPolicy::None,
            pipe_capacity: None,
        }
    }
}

/// Counters published as the distributor stage result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributeStats {
    pub records_in: u64,
    pub header_lines: u64,
    pub per_output: Vec<u64>,
}

/// Reads records from `input` and routes them to `outputs`.
///
/// Write errors on any single output are fatal for the stage; there is no
/// partial routing recovery. On end-of-input every output (and the sidecar
/// pipe, if configured) has been flushed and closed.
pub fn distribute(
    input: &Path,
    outputs: &[PathBuf],
    opts: DistributeOpts,
) -> anyhow::Result<DistributeStats> {
    anyhow::ensure!(opts.chunk_size >= 1, "chunk_size must be positive");
    anyhow::ensure!(!outputs.is_empty(), "distributor needs at least one output");
    if let Routing::ByKey { prefix_len, table } = &opts.routing {
        anyhow::ensure!(*prefix_len >= 1, "key prefix length must be positive");
        if let Some((key, idx)) = table.iter().find(|(_, idx)| **idx >= outputs.len()) {
            anyhow::bail!(
                "shard table maps prefix {:?} to output {} but only {} outputs exist",
                String::from_utf8_lossy(key),
                idx,
                outputs.len()
            );
        }
    }

    let mut reader = BufReader::new(
        open_stream_reader(input, opts.pipe_capacity)
            .map_err(|e| anyhow::anyhow!("opening distributor input {}: {e}", input.display()))?,
    );
    debug!(input = %input.display(), n_outputs = outputs.len(), "distributor reading");

    // The header region is consumed before the body outputs are opened so
    // that a sidecar reader observes EOF on the header pipe without waiting
    // for the body plumbing to connect.
    let mut header_lines = 0u64;
    let mut header_buf: Vec<u8> = Vec::new();
    let mut pending: Option<Vec<u8>> = None;

    match &opts.header {
        HeaderPolicy::None => {}
        HeaderPolicy::Broadcast { detect } => {
            pending = read_header(&mut reader, detect, &mut header_buf, &mut header_lines)?;
        }
        HeaderPolicy::Sidecar { detect, fifo } => {
            let mut sidecar = BufWriter::new(
                open_stream_writer(fifo, opts.pipe_capacity).map_err(|e| {
                    anyhow::anyhow!("opening header pipe {}: {e}", fifo.display())
                })?,
            );
            pending = read_header(&mut reader, detect, &mut header_buf, &mut header_lines)?;
            sidecar.write_all(&header_buf)?;
            sidecar.flush()?;
            header_buf.clear();
        }
    }

    let mut outs = Vec::with_capacity(outputs.len());
    for path in outputs {
        outs.push(BufWriter::new(
            open_stream_writer(path, opts.pipe_capacity)
                .map_err(|e| anyhow::anyhow!("opening distributor output {}: {e}", path.display()))?,
        ));
    }
    if !header_buf.is_empty() {
        for out in outs.iter_mut() {
            out.write_all(&header_buf)?;
        }
    }

    let mut stats = DistributeStats {
        records_in: 0,
        header_lines,
        per_output: vec![0; outputs.len()],
    };
    let mut cursor = 0usize;
    let mut routed_in_chunk = 0usize;

    let mut record = pending.unwrap_or_default();
    if record.is_empty() {
        record = match next_record(&mut reader)? {
            Some(line) => line,
            None => record,
        };
    }
    while !record.is_empty() {
        let target = match &opts.routing {
            Routing::RoundRobin => cursor,
            Routing::ByKey { prefix_len, table } => record
                .get(..*prefix_len)
                .and_then(|key| table.get(key))
                .copied()
                .unwrap_or(0),
        };
        outs[target].write_all(&record)?;
        stats.per_output[target] += 1;
        stats.records_in += 1;

        if matches!(opts.routing, Routing::RoundRobin) {
            routed_in_chunk += 1;
            if routed_in_chunk == opts.chunk_size {
                routed_in_chunk = 0;
                cursor = (cursor + 1) % outs.len();
            }
        }

        record = match next_record(&mut reader)? {
            Some(line) => line,
            None => break,
        };
    }

    for out in outs.iter_mut() {
        out.flush()?;
    }
    debug!(records = stats.records_in, header_lines = stats.header_lines, "distribution complete");
    Ok(stats)
}

/// Reads the header region into `buf`; returns the first body record, if the
/// stream has one. Zero matching lines leave the header empty and the body
/// starting at line one.
fn read_header(
    reader: &mut impl BufRead,
    detect: &HeaderDetect,
    buf: &mut Vec<u8>,
    lines: &mut u64,
) -> anyhow::Result<Option<Vec<u8>>> {
    loop {
        match next_record(reader)? {
            None => return Ok(None),
            Some(line) => {
                if detect(&line) {
                    buf.extend_from_slice(&line);
                    *lines += 1;
                } else {
                    return Ok(Some(line));
                }
            }
        }
    }
}

/// Workflow-level description of a distributor stage, consumed by
/// [`Workflow::distribute`](crate::workflow::Workflow::distribute).
///
/// Input, outputs and the optional header pipe are unmanaged: the distributor
/// opens the paths itself.
pub struct DistributeSpec {
    pub(crate) input: Endpoint,
    pub(crate) outputs: Endpoint,
    pub(crate) chunk_size: usize,
    pub(crate) routing: Routing,
    pub(crate) header: HeaderBinding,
}

pub(crate) enum HeaderBinding {
    None,
    Broadcast(HeaderDetect),
    Sidecar { detect: HeaderDetect, fifo: Endpoint },
}

impl DistributeSpec {
    pub fn new(input: Endpoint, outputs: Endpoint) -> Self {
        Self {
            input,
            outputs,
            chunk_size: 1,
            routing: Routing::RoundRobin,
            header: HeaderBinding::None,
        }
    }

    pub fn chunk_size(mut self, records: usize) -> Self {
        self.chunk_size = records;
        self
    }

    /// Copies the detected header region to every output.
    pub fn header_broadcast<F>(mut self, detect: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + 'static,
    {
        self.header = HeaderBinding::Broadcast(Box::new(detect));
        self
    }

    /// Diverts the detected header region to a dedicated pipe.
    pub fn header_fifo<F>(mut self, detect: F, fifo: Endpoint) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + 'static,
    {
        self.header = HeaderBinding::Sidecar {
            detect: Box::new(detect),
            fifo,
        };
        self
    }

    /// Replaces round-robin routing with a static prefix shard map.
    pub fn key_sharded(mut self, prefix_len: usize, table: HashMap<Vec<u8>, usize>) -> Self {
        self.routing = Routing::ByKey { prefix_len, table };
        self
    }
}

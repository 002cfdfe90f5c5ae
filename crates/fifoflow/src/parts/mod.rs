//! Built-in stream-shaping stages.
//!
//! These are the stock parts a workflow wires between user stages: the
//! distributor (1 → N fan-out), the collector (N → 1 fan-in) and the
//! reader/writer helpers feeding pipes from files and back.

pub mod collector;
pub mod distributor;
pub mod readers;

pub use collector::{collect, CollectOpts, CollectSpec, CollectStats, SinkTarget};
pub use distributor::{
    distribute, DistributeOpts, DistributeSpec, DistributeStats, HeaderDetect, HeaderPolicy,
    Routing,
};
pub use readers::{bam_reader, gz_reader, text_reader, text_writer};

use std::io::BufRead;

/// Reads one `\n`-terminated record; a trailing unterminated line still
/// counts as a record.
pub(crate) fn next_record(reader: &mut impl BufRead) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line)?;
    if n == 0 {
        Ok(None)
    } else {
        Ok(Some(line))
    }
}

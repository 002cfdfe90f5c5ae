//! Process-parallel, FIFO-connected data-flow workflows.
//!
//! A workflow is a directed graph of stages (reader → distributor → workers
//! → collector → sink). Each stage runs as its own OS process, wired to its
//! peers through kernel named pipes under a private temporary directory; the
//! kernel's pipe buffering provides backpressure and flow control. The target
//! workload is chunked, line-oriented streams where per-record work is
//! CPU-bound and benefits from fan-out across cores.

pub mod config;
pub mod counters;
pub mod endpoint;
pub mod error;
pub mod parts;
pub mod plumbing;
pub mod runtime;
pub mod stage;
pub mod workflow;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::PlumbingOptions;
pub use counters::CountMap;
pub use endpoint::{Direction, Endpoint, PipeMode};
pub use error::{Error, Result};
pub use parts::{CollectSpec, DistributeSpec, SinkTarget};
pub use plumbing::PipeSet;
pub use runtime::{RunSummary, RunningWorkflow};
pub use stage::{FifoReader, FifoWriter, StageArgs, StageSpec};
pub use workflow::Workflow;

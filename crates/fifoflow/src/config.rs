//! Runtime configuration data structures.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Kernel page size used to round pipe capacities.
pub(crate) const PAGE_SIZE: u64 = 4096;

/// Sizing policy for the kernel pipe buffers backing a workflow.
///
/// The total budget is divided evenly across every FIFO of the workflow,
/// clamped to `[min_pipe_buffer, max_pipe_buffer]` and rounded down to a page
/// multiple. Construction of the pipe set fails when the per-pipe share would
/// fall below the floor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PlumbingOptions {
    /// Total pipe-buffer budget in bytes, shared by all FIFOs.
    pub total_pipe_buffer: u64,
    /// Per-FIFO floor in bytes.
    pub min_pipe_buffer: u64,
    /// Per-FIFO ceiling in bytes. Unprivileged processes cannot raise a pipe
    /// past `/proc/sys/fs/pipe-max-size`, 1 MiB on stock kernels.
    pub max_pipe_buffer: u64,
}

impl Default for PlumbingOptions {
    fn default() -> Self {
        Self {
            total_pipe_buffer: 16 * 1024 * 1024,
            min_pipe_buffer: 64 * 1024,
            max_pipe_buffer: 1024 * 1024,
        }
    }
}

impl PlumbingOptions {
    /// Checks internal consistency of the options.
    pub fn validate(&self) -> Result<()> {
        if self.min_pipe_buffer == 0 {
            return Err(Error::invalid_config("min_pipe_buffer must be positive"));
        }
        if self.min_pipe_buffer % PAGE_SIZE != 0 || self.max_pipe_buffer % PAGE_SIZE != 0 {
            return Err(Error::invalid_config(format!(
                "pipe buffer bounds must be multiples of the page size ({} bytes)",
                PAGE_SIZE
            )));
        }
        if self.max_pipe_buffer < self.min_pipe_buffer {
            return Err(Error::invalid_config(
                "max_pipe_buffer is smaller than min_pipe_buffer",
            ));
        }
        if self.total_pipe_buffer < self.min_pipe_buffer {
            return Err(Error::invalid_config(
                "total_pipe_buffer cannot hold a single pipe at the floor size",
            ));
        }
        Ok(())
    }

    /// Computes the uniform per-pipe capacity for `pipe_count` FIFOs.
    pub fn pipe_capacity(&self, pipe_count: usize) -> Result<usize> {
        self.validate()?;
        let share = self.total_pipe_buffer / pipe_count.max(1) as u64;
        if share < self.min_pipe_buffer {
            return Err(Error::ResourceExhausted {
                message: format!(
                    "budget of {} bytes across {} pipes leaves {} bytes per pipe, below the {} byte floor",
                    self.total_pipe_buffer, pipe_count, share, self.min_pipe_buffer
                ),
            });
        }
        let clamped = share.min(self.max_pipe_buffer);
        Ok((clamped - clamped % PAGE_SIZE) as usize)
    }
}

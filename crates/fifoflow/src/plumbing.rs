//! Lifecycle of the kernel FIFOs backing a workflow.
//!
//! A [`PipeSet`] owns a private temporary directory holding one named pipe per
//! logical name. All pipes share a uniform kernel capacity computed from the
//! workflow's [`PlumbingOptions`], so no stage can starve buffering from
//! another. The directory and every FIFO in it are unlinked when the set goes
//! out of scope, on normal and abnormal exit paths alike.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::config::PlumbingOptions;
use crate::endpoint::Direction;
use crate::error::{Error, Result};

/// A named set of kernel FIFOs under a private temporary directory.
#[derive(Debug)]
pub struct PipeSet {
    base_dir: TempDir,
    paths: BTreeMap<String, PathBuf>,
    buffer_size: usize,
}

impl PipeSet {
    /// Creates one FIFO per logical name and computes the uniform per-pipe
    /// capacity from `opts`.
    ///
    /// Fails with [`Error::ResourceExhausted`] when the per-pipe share would
    /// fall below the configured floor and [`Error::NameConflict`] when a pipe
    /// path already exists.
    pub fn create(names: &BTreeSet<String>, opts: &PlumbingOptions) -> Result<Self> {
        let buffer_size = opts.pipe_capacity(names.len())?;

        let base_dir = TempDir::with_prefix("fifoflow-")?;
        let mut paths = BTreeMap::new();
        for name in names {
            validate_pipe_name(name)?;
            let path = base_dir.path().join(name);
            if path.exists() {
                return Err(Error::NameConflict { path });
            }
            mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|errno| match errno {
                nix::errno::Errno::EEXIST => Error::NameConflict { path: path.clone() },
                other => Error::Io(std::io::Error::from_raw_os_error(other as i32)),
            })?;
            paths.insert(name.clone(), path);
        }

        debug!(
            pipes = paths.len(),
            buffer_size,
            dir = %base_dir.path().display(),
            "created pipe set"
        );
        Ok(Self {
            base_dir,
            paths,
            buffer_size,
        })
    }

    /// The directory holding the FIFOs.
    pub fn base_dir(&self) -> &Path {
        self.base_dir.path()
    }

    /// Uniform kernel capacity, in bytes, applied to every pipe of the set.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Resolves a logical name to its on-disk path.
    pub fn path(&self, name: &str) -> Result<&Path> {
        self.paths
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| Error::invalid_endpoint(format!("unknown pipe '{name}'")))
    }

    /// Logical-name to path mapping, one entry per expanded pipe.
    pub fn paths(&self) -> &BTreeMap<String, PathBuf> {
        &self.paths
    }

    /// Opens a pipe of the set in the given direction and raises its kernel
    /// capacity to the set's buffer size.
    ///
    /// The open blocks until the peer end is opened. A refused capacity
    /// request is fatal here: this entry point is reserved for pipes the
    /// runtime manages itself.
    pub fn open(&self, name: &str, direction: Direction) -> Result<File> {
        let file = open_blocking(self.path(name)?, direction)?;
        set_pipe_capacity(&file, self.buffer_size).map_err(|e| Error::ResourceExhausted {
            message: format!(
                "kernel refused capacity of {} bytes on pipe '{}': {}",
                self.buffer_size, name, e
            ),
        })?;
        Ok(file)
    }

    /// Unlinks every FIFO and removes the directory.
    ///
    /// Dropping the set has the same effect; `close` only exists to surface
    /// the IO error instead of swallowing it.
    pub fn close(self) -> Result<()> {
        self.base_dir.close()?;
        Ok(())
    }
}

/// Opens `path` for reading with best-effort capacity sizing.
///
/// Used by path-only consumers (unmanaged endpoints, the distributor and
/// collector): when the kernel refuses the capacity request, e.g. because the
/// path is not a FIFO, the open proceeds with a logged warning.
pub fn open_stream_reader(path: &Path, capacity: Option<usize>) -> std::io::Result<File> {
    let file = open_blocking(path, Direction::Reader)?;
    apply_capacity(&file, path, capacity);
    Ok(file)
}

/// Opens `path` for writing with best-effort capacity sizing, creating the
/// file when the path does not name an existing FIFO or file.
///
/// See [`open_stream_reader`] for the capacity semantics.
pub fn open_stream_writer(path: &Path, capacity: Option<usize>) -> std::io::Result<File> {
    let file = File::options().write(true).create(true).open(path)?;
    apply_capacity(&file, path, capacity);
    Ok(file)
}

fn apply_capacity(file: &File, path: &Path, capacity: Option<usize>) {
    if let Some(capacity) = capacity {
        if let Err(e) = set_pipe_capacity(file, capacity) {
            warn!(path = %path.display(), capacity, "could not set pipe capacity: {e}");
        }
    }
}

fn open_blocking(path: &Path, direction: Direction) -> std::io::Result<File> {
    match direction {
        Direction::Reader => File::options().read(true).open(path),
        Direction::Writer => File::options().write(true).open(path),
    }
}

/// Asks the kernel to resize the pipe behind `file` to `capacity` bytes.
fn set_pipe_capacity(file: &File, capacity: usize) -> std::io::Result<()> {
    // F_SETPIPE_SZ, Linux 2.6.35+. The kernel may round the size up.
    let rc = unsafe {
        libc::fcntl(
            file.as_raw_fd(),
            libc::F_SETPIPE_SZ,
            capacity as libc::c_int,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn validate_pipe_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::invalid_endpoint(format!(
            "'{name}' is not a valid pipe name; names must be single path components"
        )));
    }
    Ok(())
}

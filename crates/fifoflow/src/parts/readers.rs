//! Source and sink helpers feeding the pipe graph from the filesystem.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use flate2::read::MultiGzDecoder;
use tracing::{debug, info};

use crate::plumbing::open_stream_writer;

const READ_BLOCK: usize = 64 * 1024;

/// Decompresses one or more gzip files into `out`, in order.
///
/// The destination is treated as an opaque byte sink (use a binary pipe).
/// Returns the number of decompressed bytes written.
pub fn gz_reader(inputs: &[PathBuf], out: &mut impl Write) -> anyhow::Result<u64> {
    let mut n_bytes = 0u64;
    let mut block = vec![0u8; READ_BLOCK];
    for path in inputs {
        debug!(path = %path.display(), "reading gzip input");
        let file = File::open(path)
            .map_err(|e| anyhow::anyhow!("opening {}: {e}", path.display()))?;
        let mut decoder = MultiGzDecoder::new(BufReader::new(file));
        loop {
            let n = decoder.read(&mut block)?;
            if n == 0 {
                break;
            }
            out.write_all(&block[..n])?;
            n_bytes += n as u64;
        }
    }
    out.flush()?;
    Ok(n_bytes)
}

/// Copies one or more plain-text files into `out` line by line.
///
/// Returns the number of records copied.
pub fn text_reader(inputs: &[PathBuf], out: &mut impl Write) -> anyhow::Result<u64> {
    let mut n_records = 0u64;
    for path in inputs {
        let file = File::open(path)
            .map_err(|e| anyhow::anyhow!("opening {}: {e}", path.display()))?;
        let mut reader = BufReader::new(file);
        while let Some(record) = super::next_record(&mut reader)? {
            out.write_all(&record)?;
            n_records += 1;
        }
    }
    out.flush()?;
    Ok(n_records)
}

/// Drains `src` into the file at `path` (a regular file, `/dev/stdout`, …).
///
/// Returns the number of bytes written.
pub fn text_writer(src: &mut impl Read, path: &Path) -> anyhow::Result<u64> {
    let mut out = File::create(path)
        .map_err(|e| anyhow::anyhow!("creating {}: {e}", path.display()))?;
    let n = std::io::copy(src, &mut out)?;
    out.flush()?;
    Ok(n)
}

/// Converts a BAM file to SAM by shelling out to `samtools view`, writing
/// into `output` — typically an unmanaged FIFO path handed to the workflow.
///
/// Returns the tool's exit code.
pub fn bam_reader(input: &Path, output: &Path, threads: usize) -> anyhow::Result<i32> {
    info!(input = %input.display(), output = %output.display(), "spawning samtools");
    let sink = open_stream_writer(output, None)
        .map_err(|e| anyhow::anyhow!("opening {}: {e}", output.display()))?;
    let status = Command::new("samtools")
        .arg("view")
        .arg("-Sh")
        .arg("--no-PG")
        .arg(format!("--threads={threads}"))
        .arg(input)
        .stdout(Stdio::from(sink))
        .status()
        .map_err(|e| anyhow::anyhow!("spawning samtools: {e}"))?;
    Ok(status.code().unwrap_or(-1))
}

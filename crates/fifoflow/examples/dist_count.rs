//! Fan a gzipped text stream out to four counting workers.

use std::fs::File;
use std::io::Write;

use fifoflow::{DistributeSpec, Endpoint, StageSpec, Workflow};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::BufRead;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Build a throwaway gzip fixture.
    let dir = tempfile::TempDir::new()?;
    let gz_path = dir.path().join("records.txt.gz");
    let mut enc = GzEncoder::new(File::create(&gz_path)?, Compression::default());
    for i in 0..1000 {
        writeln!(enc, "record {i}")?;
    }
    enc.finish()?;

    let mut wf = Workflow::new("dist_count");
    wf.gz_reader(vec![gz_path], Endpoint::writer("input_text"))?;
    wf.distribute(
        DistributeSpec::new(
            Endpoint::reader("input_text"),
            Endpoint::writer("dist{n}").fan(4),
        )
        .chunk_size(10),
    )?;
    wf.workers(4, |_| {
        StageSpec::new("{workflow}.worker{n}", |args| {
            let reader = args.take_reader("src")?;
            Ok(Value::from(reader.lines().count() as u64))
        })
        .bind("src", Endpoint::reader("dist{n}"))
    })?;

    let summary = wf.run()?;
    for (stage, result) in &summary.results {
        println!("{stage}\t{result}");
    }
    Ok(())
}

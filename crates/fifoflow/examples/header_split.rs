//! Split a headered record stream across workers, diverting the header to a
//! sidecar pipe, and merge the workers' tallies after the join.

use std::io::{BufRead, Read, Write};

use fifoflow::{CountMap, DistributeSpec, Endpoint, StageSpec, Workflow};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Synthetic fixture: a tagged header followed by tab-separated records.
    let dir = tempfile::TempDir::new()?;
    let input = dir.path().join("records.tsv");
    {
        let mut f = std::fs::File::create(&input)?;
        writeln!(f, "@version\t1")?;
        writeln!(f, "@source\tsynthetic")?;
        for i in 0..200 {
            writeln!(f, "row{i}\t{}", i * 3)?;
        }
    }

    let mut wf = Workflow::new("header_split");
    wf.text_reader(vec![input], Endpoint::writer("input_records"))?;
    wf.distribute(
        DistributeSpec::new(
            Endpoint::reader("input_records"),
            Endpoint::writer("dist{n}").fan(4),
        )
        .chunk_size(5)
        .header_fifo(|line| line.starts_with(b"@"), Endpoint::writer("header")),
    )?;
    wf.funnel(
        StageSpec::new("{workflow}.header{n}", |args| {
            let mut reader = args.take_reader("src")?;
            let mut text = String::new();
            reader.read_to_string(&mut text)?;
            Ok(Value::from(text.lines().count() as u64))
        })
        .bind("src", Endpoint::reader("header")),
    )?;
    wf.workers(4, |_| {
        StageSpec::new("{workflow}.worker{n}", |args| {
            let reader = args.take_reader("src")?;
            let mut counts = CountMap::new();
            for line in reader.lines() {
                let line = line?;
                counts.count("records");
                counts.count_by("bytes", line.len() as f64);
            }
            Ok(counts.into_value())
        })
        .bind("src", Endpoint::reader("dist{n}"))
    })?;

    println!("{wf}");
    let summary = wf.run()?;

    let totals = CountMap::merged(
        summary
            .results
            .iter()
            .filter(|(stage, _)| stage.contains(".worker"))
            .map(|(_, value)| value),
    );
    totals.write_tsv(std::io::stdout())?;
    println!(
        "header lines: {}",
        summary.result("header_split.header0").cloned().unwrap_or(Value::Null)
    );
    Ok(())
}

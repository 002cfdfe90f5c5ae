//! End-to-end workflow scenarios.
//!
//! These tests fork real stage processes and run one at a time.

use std::fs::{self, File};
use std::io::{BufRead, Write};
use std::path::PathBuf;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use serial_test::serial;
use tempfile::TempDir;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::parts::{self, CollectSpec, DistributeSpec, SinkTarget};
use crate::stage::StageSpec;
use crate::workflow::Workflow;

fn gzip_lines(dir: &TempDir, n: usize) -> PathBuf {
    let path = dir.path().join("input.txt.gz");
    let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
    for i in 0..n {
        writeln!(enc, "record {i}").unwrap();
    }
    enc.finish().unwrap();
    path
}

/// A SAM-like stream: 5 header lines followed by 34 body records.
fn sam_text() -> String {
    let mut text = String::new();
    text.push_str("@HD\tVN:1.6\tSO:unsorted\n");
    text.push_str("@SQ\tSN:chr22\tLN:50818468\n");
    text.push_str("@RG\tID:A\tSM:sample\n");
    text.push_str("@PG\tPN:tester\tID:tester\tVN:0.1\n");
    text.push_str("@CO\tsynthetic fixture\n");
    for i in 0..34 {
        text.push_str(&format!(
            "read{i}\t0\tchr22\t{}\t60\t10M\t*\t0\t0\tACGTACGTAC\tFFFFFFFFFF\n",
            1000 + i
        ));
    }
    text
}

fn sam_file(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("input.sam");
    fs::write(&path, sam_text()).unwrap();
    path
}

fn counting_worker() -> StageSpec {
    StageSpec::new("{workflow}.worker{n}", |args| {
        let reader = args.take_reader("src")?;
        Ok(Value::from(reader.lines().count() as u64))
    })
    .bind("src", Endpoint::reader("dist{n}"))
}

fn worker_count(summary: &crate::runtime::RunSummary, workflow: &str, i: usize) -> u64 {
    summary
        .result(&format!("{workflow}.worker{i}"))
        .and_then(Value::as_u64)
        .unwrap()
}

#[test]
#[serial]
fn gz_four_way_count() {
    let dir = TempDir::new().unwrap();
    let gz = gzip_lines(&dir, 17);

    let mut wf = Workflow::new("w_count");
    wf.gz_reader(vec![gz], Endpoint::writer("input_text")).unwrap();
    wf.distribute(
        DistributeSpec::new(
            Endpoint::reader("input_text"),
            Endpoint::writer("dist{n}").fan(4),
        )
        .chunk_size(1),
    )
    .unwrap();
    wf.workers(4, |_| counting_worker()).unwrap();

    let summary = wf.run().unwrap();
    let counts: Vec<u64> = (0..4).map(|i| worker_count(&summary, "w_count", i)).collect();
    assert_eq!(counts, vec![5, 4, 4, 4]);
    assert_eq!(counts.iter().sum::<u64>(), 17);
}

#[test]
#[serial]
fn gz_four_way_pass_through_and_collect() {
    let dir = TempDir::new().unwrap();
    let gz = gzip_lines(&dir, 17);
    let sink = dir.path().join("merged.txt");

    let mut wf = Workflow::new("w_copy");
    wf.gz_reader(vec![gz], Endpoint::writer("input_text")).unwrap();
    wf.distribute(
        DistributeSpec::new(
            Endpoint::reader("input_text"),
            Endpoint::writer("dist{n}").fan(4),
        )
        .chunk_size(1),
    )
    .unwrap();
    wf.workers(4, |_| {
        StageSpec::new("{workflow}.worker{n}", |args| {
            let mut reader = args.take_reader("src")?;
            let mut writer = args.take_writer("out")?;
            let n = std::io::copy(&mut reader, &mut writer)?;
            Ok(Value::from(n))
        })
        .bind("src", Endpoint::reader("dist{n}"))
        .bind("out", Endpoint::writer("w_out{n}"))
    })
    .unwrap();
    wf.collect(
        CollectSpec::new(
            Endpoint::reader("w_out{n}").fan(4),
            SinkTarget::Path(sink.clone()),
        )
        .chunk_size(1),
    )
    .unwrap();

    let summary = wf.run().unwrap();
    let collected = summary.result("w_copy.collect0").unwrap();
    assert_eq!(collected["records_out"], Value::from(17));

    let merged = fs::read_to_string(&sink).unwrap();
    let expected: String = (0..17).map(|i| format!("record {i}\n")).collect();
    assert_eq!(merged, expected);
}

#[test]
#[serial]
fn header_fifo_diverts_the_header() {
    let dir = TempDir::new().unwrap();
    let sam = sam_file(&dir);

    let mut wf = Workflow::new("w_hdr");
    wf.text_reader(vec![sam], Endpoint::writer("input_sam")).unwrap();
    wf.distribute(
        DistributeSpec::new(
            Endpoint::reader("input_sam"),
            Endpoint::writer("dist{n}").fan(4),
        )
        .chunk_size(1)
        .header_fifo(|line| line.starts_with(b"@"), Endpoint::writer("header")),
    )
    .unwrap();
    wf.funnel(
        StageSpec::new("{workflow}.header_count{n}", |args| {
            let reader = args.take_reader("src")?;
            Ok(Value::from(reader.lines().count() as u64))
        })
        .bind("src", Endpoint::reader("header")),
    )
    .unwrap();
    wf.workers(4, |_| {
        StageSpec::new("{workflow}.worker{n}", |args| {
            let reader = args.take_reader("src")?;
            let mut header = 0u64;
            let mut body = 0u64;
            for line in reader.lines() {
                if line?.starts_with('@') {
                    header += 1;
                } else {
                    body += 1;
                }
            }
            Ok(serde_json::json!({ "header": header, "body": body }))
        })
        .bind("src", Endpoint::reader("dist{n}"))
    })
    .unwrap();

    let summary = wf.run().unwrap();
    for (i, expected_body) in [9u64, 9, 8, 8].iter().enumerate() {
        let result = summary.result(&format!("w_hdr.worker{i}")).unwrap();
        assert_eq!(result["header"], Value::from(0));
        assert_eq!(result["body"], Value::from(*expected_body));
    }
    assert_eq!(
        summary.result("w_hdr.header_count0"),
        Some(&Value::from(5))
    );
}

#[test]
#[serial]
fn header_broadcast_reaches_every_worker() {
    let dir = TempDir::new().unwrap();
    let sam = sam_file(&dir);

    let mut wf = Workflow::new("w_bcast");
    wf.text_reader(vec![sam], Endpoint::writer("input_sam")).unwrap();
    wf.distribute(
        DistributeSpec::new(
            Endpoint::reader("input_sam"),
            Endpoint::writer("dist{n}").fan(4),
        )
        .chunk_size(1)
        .header_broadcast(|line| line.starts_with(b"@")),
    )
    .unwrap();
    wf.workers(4, |_| {
        StageSpec::new("{workflow}.worker{n}", |args| {
            let reader = args.take_reader("src")?;
            let mut header = 0u64;
            let mut body = 0u64;
            for line in reader.lines() {
                if line?.starts_with('@') {
                    header += 1;
                } else {
                    body += 1;
                }
            }
            Ok(serde_json::json!({ "header": header, "body": body }))
        })
        .bind("src", Endpoint::reader("dist{n}"))
    })
    .unwrap();

    let summary = wf.run().unwrap();
    for (i, expected_body) in [9u64, 9, 8, 8].iter().enumerate() {
        let result = summary.result(&format!("w_bcast.worker{i}")).unwrap();
        assert_eq!(result["header"], Value::from(5));
        assert_eq!(result["body"], Value::from(*expected_body));
    }
}

#[test]
#[serial]
fn sam_round_trip_is_byte_exact() {
    let dir = TempDir::new().unwrap();
    let sam = sam_file(&dir);
    let out_path = dir.path().join("roundtrip.sam");

    let mut wf = Workflow::new("w_sam");
    wf.text_reader(vec![sam], Endpoint::writer("input_sam")).unwrap();
    wf.distribute(
        DistributeSpec::new(
            Endpoint::reader("input_sam"),
            Endpoint::writer("body{n}").fan(4),
        )
        .chunk_size(1)
        .header_fifo(|line| line.starts_with(b"@"), Endpoint::writer("header")),
    )
    .unwrap();
    wf.workers(4, |_| {
        StageSpec::new("{workflow}.worker{n}", |args| {
            let mut reader = args.take_reader("src")?;
            let mut writer = args.take_writer("out")?;
            let n = std::io::copy(&mut reader, &mut writer)?;
            Ok(Value::from(n))
        })
        .bind("src", Endpoint::reader("body{n}"))
        .bind("out", Endpoint::writer("w_out{n}"))
    })
    .unwrap();
    wf.collect(
        CollectSpec::new(
            Endpoint::reader("w_out{n}").fan(4),
            SinkTarget::Pipe(Endpoint::writer("sam_out")),
        )
        .chunk_size(1)
        .header_fifo(Endpoint::reader("header")),
    )
    .unwrap();
    let sink = out_path.clone();
    wf.funnel(
        StageSpec::new("{workflow}.writer{n}", move |args| {
            let mut src = args.take_reader("src")?;
            let n = parts::text_writer(&mut src, &sink)?;
            Ok(Value::from(n))
        })
        .bind("src", Endpoint::reader("sam_out")),
    )
    .unwrap();

    wf.run().unwrap();
    assert_eq!(fs::read_to_string(&out_path).unwrap(), sam_text());
}

#[test]
#[serial]
fn worker_exceptions_surface_and_fifos_are_unlinked() {
    let dir = TempDir::new().unwrap();
    let gz = gzip_lines(&dir, 17);

    let mut wf = Workflow::new("w_boom");
    wf.gz_reader(vec![gz], Endpoint::writer("input_text")).unwrap();
    wf.distribute(
        DistributeSpec::new(
            Endpoint::reader("input_text"),
            Endpoint::writer("dist{n}").fan(4),
        )
        .chunk_size(1),
    )
    .unwrap();
    wf.workers(4, |_| {
        StageSpec::new("{workflow}.worker{n}", |args| {
            let mut reader = args.take_reader("src")?;
            let mut line = String::new();
            reader.read_line(&mut line)?;
            anyhow::bail!("giving up after {line:?}")
        })
        .bind("src", Endpoint::reader("dist{n}"))
    })
    .unwrap();

    let running = wf.start().unwrap();
    let fifo_dir = running.pipe_set().unwrap().base_dir().to_path_buf();
    assert!(fifo_dir.exists());

    match running.join() {
        Err(Error::StageFailures(summary)) => {
            for i in 0..4 {
                let name = format!("w_boom.worker{i}");
                let lines = summary
                    .failures
                    .get(&name)
                    .unwrap_or_else(|| panic!("no failure recorded for {name}"));
                assert!(!lines.is_empty());
                assert!(lines.iter().any(|l| l.contains("giving up")));
            }
        }
        other => panic!("expected StageFailures, got {other:?}"),
    }
    assert!(!fifo_dir.exists());
}

#[test]
#[serial]
fn pipe_list_matches_created_fifos() {
    let mut wf = Workflow::new("w_pipes");
    wf.text_reader(
        vec![PathBuf::from("/dev/null")],
        Endpoint::writer("text"),
    )
    .unwrap();
    wf.funnel(
        StageSpec::new("{workflow}.sink{n}", |args| {
            let reader = args.take_reader("src")?;
            Ok(Value::from(reader.lines().count() as u64))
        })
        .bind("src", Endpoint::reader("text")),
    )
    .unwrap();

    assert_eq!(wf.pipe_list(), vec!["text"]);
    let expected = wf.pipe_list();

    let running = wf.start().unwrap();
    let pipes = running.pipe_set().unwrap();
    let created: Vec<String> = pipes.paths().keys().cloned().collect();
    assert_eq!(created, expected);
    let summary = running.join().unwrap();
    assert_eq!(summary.result("w_pipes.sink0"), Some(&Value::from(0)));
}

#[test]
#[serial]
fn subworkflow_runs_inline_and_shares_the_pipe_set() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data.txt");
    fs::write(&data, "a\nb\nc\n").unwrap();

    let mut sub = Workflow::new("inner");
    sub.text_reader(vec![data], Endpoint::writer("shared")).unwrap();
    sub.funnel(
        StageSpec::new("{workflow}.count{n}", |args| {
            let reader = args.take_reader("src")?;
            Ok(Value::from(reader.lines().count() as u64))
        })
        .bind("src", Endpoint::reader("shared")),
    )
    .unwrap();

    let mut wf = Workflow::new("outer");
    wf.add_subworkflow(sub);
    let summary = wf.run().unwrap();
    assert_eq!(summary.result("inner.count0"), Some(&Value::from(3)));
}

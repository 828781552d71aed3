//! Run-and-report driver.
//!
//! Launches the benchmark sequencer as a subprocess, forwards its output to
//! local and remote logs, and records the wall-clock window around it. On
//! success the timing report is augmented with run metadata and host
//! identity, renamed with a timestamp, and uploaded; host CPU/memory over
//! the window is then pulled from the monitoring API and persisted.

use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region};
use chrono::{Local, Utc};
use clap::Parser;
use serde_json::json;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use linkbench::cloudwatch::{get_metric_data_for_run, save_metrics_to_json, LogSink};
use linkbench::host::fetch_instance_identity;
use linkbench::logging::configure_logging;
use linkbench::parse_max_pairs;
use linkbench::report::BenchmarkReport;
use linkbench::upload::upload_file_to_s3;

#[derive(Parser, Debug)]
#[command(name = "linkbench", about = "Run record-linkage benchmarks and ship the results")]
struct Args {
    /// Maximum pairs to process, can be in scientific notation like 1e7
    max_pairs: String,

    /// A label to describe the run
    run_label: String,

    /// Scenario to run: synthetic_50k, synthetic_3m or synthetic_7m
    #[arg(long, default_value = "synthetic_3m")]
    scenario: String,

    /// Where the sequencer writes its report
    #[arg(long, default_value = "benchmarking_results.json")]
    benchmark_json: PathBuf,

    /// Path to the bench_runner binary; defaults to a sibling of this one
    #[arg(long)]
    runner: Option<PathBuf>,

    /// Engine service URL passed through to the sequencer
    #[arg(long)]
    engine_url: Option<String>,

    /// Include the optional clustering stage
    #[arg(long)]
    cluster: bool,

    /// Skip the S3 upload (local report and metrics only)
    #[arg(long)]
    no_upload: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    configure_logging();

    // Fail on a malformed max_pairs before spending hours in the sequencer.
    parse_max_pairs(&args.max_pairs)?;

    let region = env::var("LINKBENCH_AWS_REGION").unwrap_or_else(|_| "eu-west-2".to_string());
    let bucket = env::var("LINKBENCH_S3_BUCKET").unwrap_or_else(|_| "linkbench-results".to_string());
    let log_group =
        env::var("LINKBENCH_LOG_GROUP").unwrap_or_else(|_| "linkbench-benchmarks".to_string());
    let log_stream = env::var("LINKBENCH_LOG_STREAM").unwrap_or_else(|_| "runs".to_string());

    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region))
        .load()
        .await;

    let mut log_sink = match LogSink::create(&aws_config, &log_group, &log_stream).await {
        Ok(sink) => Some(sink),
        Err(e) => {
            warn!("Remote log shipping disabled: {:#}", e);
            None
        }
    };

    // Resolved before the run: the identity dimensions the metric queries.
    let instance_identity = fetch_instance_identity().await;

    let start = Utc::now();
    info!(
        "Starting benchmark run '{}' (scenario {}, max_pairs {})",
        args.run_label, args.scenario, args.max_pairs
    );
    if let Some(sink) = log_sink.as_mut() {
        sink.log(&format!(
            "Starting benchmark run '{}' (scenario {}, max_pairs {})",
            args.run_label, args.scenario, args.max_pairs
        ))
        .await?;
    }

    let status = run_sequencer(&args, log_sink.as_mut()).await?;
    let end = Utc::now();

    if !status {
        error!("Benchmark sequencer failed.");
        if let Some(sink) = log_sink.as_mut() {
            sink.log("Benchmark sequencer failed.").await.ok();
            sink.flush().await.ok();
        }
        std::process::exit(1);
    }

    // Augment the report with run metadata and host identity, then stamp
    // the file name so repeat runs never overwrite each other.
    let mut report = BenchmarkReport::load(&args.benchmark_json)?;
    report.custom = Some(json!({
        "max_pairs": args.max_pairs,
        "run_label": args.run_label,
        "instance": instance_identity,
    }));

    let stamped_name = format!(
        "benchmarking_results_{}.json",
        Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let stamped_path = args
        .benchmark_json
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&stamped_name);
    report.save(&stamped_path)?;
    std::fs::remove_file(&args.benchmark_json).ok();
    info!("Benchmark report written to {}", stamped_path.display());

    if args.no_upload {
        info!("Skipping upload of {}", stamped_name);
    } else {
        upload_file_to_s3(&aws_config, &bucket, &stamped_path).await?;
        if let Some(sink) = log_sink.as_mut() {
            sink.log(&format!(
                "File '{}' uploaded to bucket '{}'.",
                stamped_name, bucket
            ))
            .await?;
        }
    }

    // Pull host telemetry for the run window from the monitoring API. The
    // agent publishes out of band, so this only works with an instance
    // identity to dimension the queries.
    match &instance_identity {
        Some(identity) => {
            let cw_client = aws_sdk_cloudwatch::Client::new(&aws_config);
            let series = get_metric_data_for_run(&cw_client, identity, start, end).await?;
            let metrics_path = Path::new("metrics_data.json");
            save_metrics_to_json(&series, metrics_path)?;
            info!("Host metrics for the run window written to {}", metrics_path.display());
        }
        None => {
            warn!("No instance identity; skipping monitoring-API correlation");
        }
    }

    if let Some(sink) = log_sink.as_mut() {
        sink.flush().await?;
    }

    Ok(())
}

/// Spawn the sequencer and stream every output line into the logs as it
/// arrives. Returns whether the subprocess exited successfully.
async fn run_sequencer(args: &Args, mut log_sink: Option<&mut LogSink>) -> Result<bool> {
    let runner = match &args.runner {
        Some(path) => path.clone(),
        None => env::current_exe()
            .context("Cannot locate own executable")?
            .parent()
            .context("Executable has no parent directory")?
            .join("bench_runner"),
    };

    let mut command = Command::new(&runner);
    command
        .arg("--scenario")
        .arg(&args.scenario)
        .arg("--max-pairs")
        .arg(&args.max_pairs)
        .arg("--benchmark-json")
        .arg(&args.benchmark_json);
    if let Some(url) = &args.engine_url {
        command.arg("--engine-url").arg(url);
    }
    if args.cluster {
        command.arg("--cluster");
    }

    info!("Launching sequencer: {}", runner.display());
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to launch sequencer at {}", runner.display()))?;

    let (tx, mut rx) = mpsc::channel::<String>(64);

    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    while let Some(line) = rx.recv().await {
        info!(target: "bench_runner", "{}", line);
        if let Some(sink) = log_sink.as_deref_mut() {
            sink.log(&line).await?;
        }
    }

    let status = child.wait().await.context("Failed to wait for sequencer")?;
    Ok(status.success())
}

//! Benchmark sequencer: loads a synthetic dataset into the engine, drives
//! the staged pipeline against one shared session, and writes the timing
//! report. Launched as a subprocess by the `linkbench` driver, which
//! captures this binary's stdout.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use linkbench::bench::scenario_by_name;
use linkbench::engine::EngineClient;
use linkbench::host::MachineInfo;
use linkbench::logging::configure_logging;
use linkbench::parse_max_pairs;
use linkbench::report::BenchmarkReport;

#[derive(Parser, Debug)]
#[command(name = "bench_runner", about = "Run the record-linkage benchmark stages")]
struct Args {
    /// Scenario to run: synthetic_50k, synthetic_3m or synthetic_7m
    #[arg(long, default_value = "synthetic_3m")]
    scenario: String,

    /// Maximum pairs for u-estimation, scientific notation accepted
    #[arg(long, default_value = "1e6")]
    max_pairs: String,

    /// Where to write the benchmark report
    #[arg(long, default_value = "benchmarking_results.json")]
    benchmark_json: PathBuf,

    /// Engine service URL (defaults to LINKBENCH_ENGINE_URL)
    #[arg(long)]
    engine_url: Option<String>,

    /// Include the optional clustering stage
    #[arg(long)]
    cluster: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    configure_logging();

    let max_pairs = parse_max_pairs(&args.max_pairs)?;
    info!("Max pairs = {}", max_pairs);

    let machine_info = MachineInfo::collect();
    info!(
        "Host '{}': {} cpus, {} MB memory",
        machine_info.node,
        machine_info.cpu_count,
        machine_info.memory_total_bytes / 1024 / 1024
    );

    let scenario = scenario_by_name(&args.scenario, machine_info.cpu_count as u32, args.cluster)?;
    let client = EngineClient::new(args.engine_url.as_deref())?;

    let records = scenario.run(&client, max_pairs).await?;

    let mut report = BenchmarkReport::new(scenario.name, machine_info);
    report.benchmarks = records;
    report.save(&args.benchmark_json)?;
    info!(
        "Benchmark report for '{}' written to {}",
        scenario.name,
        args.benchmark_json.display()
    );

    Ok(())
}

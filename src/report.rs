//! The benchmark report written by the sequencer and augmented by the
//! run driver before upload.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::host::MachineInfo;

/// Summary statistics over the timed rounds of one stage, in seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
    pub total: f64,
    pub rounds: u32,
    pub iterations: u32,
}

impl StageStats {
    pub fn from_durations(rounds: &[Duration], iterations: u32) -> StageStats {
        let mut secs: Vec<f64> = rounds.iter().map(|d| d.as_secs_f64()).collect();
        secs.sort_by(|a, b| a.total_cmp(b));

        let n = secs.len();
        let total: f64 = secs.iter().sum();
        let mean = if n > 0 { total / n as f64 } else { 0.0 };
        let stddev = if n > 1 {
            let variance =
                secs.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
            variance.sqrt()
        } else {
            0.0
        };
        let median = match n {
            0 => 0.0,
            n if n % 2 == 1 => secs[n / 2],
            n => (secs[n / 2 - 1] + secs[n / 2]) / 2.0,
        };

        StageStats {
            min: secs.first().copied().unwrap_or(0.0),
            max: secs.last().copied().unwrap_or(0.0),
            mean,
            stddev,
            median,
            total,
            rounds: n as u32,
            iterations,
        }
    }
}

/// One timed stage of the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub order: u32,
    pub name: String,
    pub stats: StageStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub version: String,
    pub run_id: String,
    pub scenario: String,
    pub datetime: String,
    pub machine_info: MachineInfo,
    pub benchmarks: Vec<BenchmarkRecord>,
    /// Injected by the run driver after the sequencer exits: run label,
    /// max_pairs, instance identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

impl BenchmarkReport {
    pub fn new(scenario: &str, machine_info: MachineInfo) -> BenchmarkReport {
        BenchmarkReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            scenario: scenario.to_string(),
            datetime: chrono::Utc::now().to_rfc3339(),
            machine_info,
            benchmarks: Vec::new(),
            custom: None,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write benchmark report to {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<BenchmarkReport> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read benchmark report from {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse benchmark report from {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MachineInfo;

    fn secs(values: &[f64]) -> Vec<Duration> {
        values.iter().map(|s| Duration::from_secs_f64(*s)).collect()
    }

    #[test]
    fn test_stats_single_round() {
        let stats = StageStats::from_durations(&secs(&[12.5]), 1);
        assert_eq!(stats.rounds, 1);
        assert_eq!(stats.min, 12.5);
        assert_eq!(stats.max, 12.5);
        assert_eq!(stats.mean, 12.5);
        assert_eq!(stats.median, 12.5);
        assert_eq!(stats.stddev, 0.0);
        assert_eq!(stats.total, 12.5);
    }

    #[test]
    fn test_stats_multiple_rounds() {
        let stats = StageStats::from_durations(&secs(&[2.0, 4.0, 6.0]), 1);
        assert_eq!(stats.rounds, 3);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 6.0);
        assert_eq!(stats.mean, 4.0);
        assert_eq!(stats.median, 4.0);
        assert_eq!(stats.total, 12.0);
        assert!((stats.stddev - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_even_round_count_median() {
        let stats = StageStats::from_durations(&secs(&[1.0, 3.0]), 1);
        assert_eq!(stats.median, 2.0);
    }

    #[test]
    fn test_report_round_trip() {
        let mut report = BenchmarkReport::new("synthetic_3m", MachineInfo::collect());
        report.benchmarks.push(BenchmarkRecord {
            order: 2,
            name: "estimate_u".to_string(),
            stats: StageStats::from_durations(&secs(&[30.25]), 1),
        });
        report.custom = Some(serde_json::json!({
            "max_pairs": "1e7",
            "run_label": "round trip test",
        }));

        let path = std::env::temp_dir().join(format!("linkbench_report_{}.json", report.run_id));
        report.save(&path).unwrap();
        let loaded = BenchmarkReport::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.scenario, "synthetic_3m");
        assert_eq!(loaded.benchmarks.len(), 1);
        assert_eq!(loaded.benchmarks[0].name, "estimate_u");
        assert_eq!(loaded.custom.unwrap()["max_pairs"], "1e7");
    }
}

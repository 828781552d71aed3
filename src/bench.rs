//! Benchmark sequencing: ordered stages over a shared engine session.
//!
//! A scenario is a dataset, the settings it is linked with, and a fixed
//! list of numbered stages. Stages run strictly in declared order against
//! one session; each timed stage is measured in isolation with its own
//! rounds/iterations/warmup policy. A failed stage aborts the stages after
//! it, but the session is still closed.

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::engine::{EngineClient, EngineSession};
use crate::report::{BenchmarkRecord, StageStats};
use crate::settings::{
    block_on, exact_match, jaro_winkler_at_thresholds, levenshtein_at_thresholds, BlockingRule,
    Settings,
};

/// Rounds, iterations per round, and discarded warmup rounds for one stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimingPolicy {
    pub rounds: u32,
    pub iterations: u32,
    pub warmup_rounds: u32,
}

impl TimingPolicy {
    /// Exactly one measured execution, no warmup. The staged scenarios use
    /// this: their stages mutate session state, so repeat runs would not
    /// measure the same work.
    pub fn pedantic() -> TimingPolicy {
        TimingPolicy {
            rounds: 1,
            iterations: 1,
            warmup_rounds: 0,
        }
    }
}

/// One engine operation (or sequence of them) a stage executes.
#[derive(Clone, Debug)]
pub enum StageOp {
    EstimateProbabilityTwoRandomRecordsMatch {
        deterministic_rules: Vec<BlockingRule>,
        recall: f64,
    },
    EstimateU,
    EstimateParametersUsingEm {
        blocking_rules: Vec<BlockingRule>,
        estimate_without_term_frequencies: bool,
    },
    Predict {
        threshold_match_probability: Option<f64>,
    },
    Cluster {
        threshold: f64,
    },
    /// Several operations timed as one unit.
    Sequence(Vec<StageOp>),
    /// Count cached prediction rows and close the session. Never timed.
    Cleanup,
}

pub struct StageSpec {
    pub order: u32,
    pub name: &'static str,
    pub op: StageOp,
    /// None runs the stage without recording it in the report.
    pub policy: Option<TimingPolicy>,
}

pub struct Scenario {
    pub name: &'static str,
    pub dataset: &'static str,
    pub settings: Settings,
    pub stages: Vec<StageSpec>,
}

impl Scenario {
    /// Create the session fixture and drive every stage through it.
    pub async fn run(&self, client: &EngineClient, max_pairs: u64) -> Result<Vec<BenchmarkRecord>> {
        info!(
            "Running scenario '{}' against dataset '{}' (max_pairs = {})",
            self.name, self.dataset, max_pairs
        );
        let session = client
            .create_session(self.dataset, &self.settings)
            .await
            .context("Failed to create engine session")?;

        let mut records = Vec::new();
        let mut failure: Option<anyhow::Error> = None;
        let mut session_closed = false;

        for stage in &self.stages {
            info!("Stage {} '{}' starting", stage.order, stage.name);
            match run_stage(&session, stage, max_pairs).await {
                Ok(Some(stats)) => {
                    info!(
                        "Stage {} '{}' completed: mean={:.3}s min={:.3}s max={:.3}s rounds={}",
                        stage.order, stage.name, stats.mean, stats.min, stats.max, stats.rounds
                    );
                    records.push(BenchmarkRecord {
                        order: stage.order,
                        name: stage.name.to_string(),
                        stats,
                    });
                }
                Ok(None) => {
                    info!("Stage {} '{}' completed (untimed)", stage.order, stage.name);
                }
                Err(e) => {
                    error!("Stage {} '{}' failed: {:#}", stage.order, stage.name, e);
                    failure = Some(e.context(format!("Stage '{}' failed", stage.name)));
                    break;
                }
            }
            if matches!(stage.op, StageOp::Cleanup) {
                session_closed = true;
            }
        }

        // The cleanup stage closes the session; if it never ran, close here
        // so an aborted run does not leak the loaded dataset.
        if !session_closed {
            if let Err(e) = session.close().await {
                warn!("Failed to close engine session after aborted run: {:#}", e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(records),
        }
    }
}

async fn run_stage(
    session: &EngineSession,
    stage: &StageSpec,
    max_pairs: u64,
) -> Result<Option<StageStats>> {
    let policy = match stage.policy {
        Some(policy) => policy,
        None => {
            execute(session, &stage.op, max_pairs).await?;
            return Ok(None);
        }
    };

    for warmup in 0..policy.warmup_rounds {
        info!(
            "Stage '{}' warmup round {}/{}",
            stage.name,
            warmup + 1,
            policy.warmup_rounds
        );
        execute(session, &stage.op, max_pairs).await?;
    }

    let mut durations: Vec<Duration> = Vec::with_capacity(policy.rounds as usize);
    for _ in 0..policy.rounds {
        let start = Instant::now();
        for _ in 0..policy.iterations {
            execute(session, &stage.op, max_pairs).await?;
        }
        durations.push(start.elapsed() / policy.iterations);
    }

    Ok(Some(StageStats::from_durations(&durations, policy.iterations)))
}

async fn execute(session: &EngineSession, op: &StageOp, max_pairs: u64) -> Result<()> {
    match op {
        StageOp::Sequence(ops) => {
            for op in ops {
                execute_single(session, op, max_pairs).await?;
            }
            Ok(())
        }
        op => execute_single(session, op, max_pairs).await,
    }
}

async fn execute_single(session: &EngineSession, op: &StageOp, max_pairs: u64) -> Result<()> {
    match op {
        StageOp::EstimateProbabilityTwoRandomRecordsMatch {
            deterministic_rules,
            recall,
        } => {
            session
                .estimate_probability_two_random_records_match(deterministic_rules, *recall)
                .await
        }
        StageOp::EstimateU => session.estimate_u_using_random_sampling(max_pairs).await,
        StageOp::EstimateParametersUsingEm {
            blocking_rules,
            estimate_without_term_frequencies,
        } => {
            for rule in blocking_rules {
                session
                    .estimate_parameters_using_expectation_maximisation(
                        rule,
                        *estimate_without_term_frequencies,
                    )
                    .await?;
            }
            Ok(())
        }
        StageOp::Predict {
            threshold_match_probability,
        } => session.predict(*threshold_match_probability).await,
        StageOp::Cluster { threshold } => {
            session
                .cluster_pairwise_predictions_at_threshold(*threshold)
                .await
        }
        StageOp::Sequence(_) => unreachable!("nested sequences are not constructed"),
        StageOp::Cleanup => cleanup(session).await,
    }
}

/// Count rows in the cached prediction tables, then close the session.
async fn cleanup(session: &EngineSession) -> Result<()> {
    for table in session.list_cached_tables().await? {
        if table.key.contains("predict") {
            let rows = session
                .query_sql(&format!(
                    "select count(*) as p_count from {}",
                    table.physical_name
                ))
                .await?;
            for row in rows {
                info!("Prediction count for {}: {}", table.physical_name, row);
            }
        }
    }
    session.close().await?;
    info!("Closed engine session");
    Ok(())
}

/// Staged pipeline shared by the 3m and 7m scenarios. Only the dataset,
/// the EM blocking rules and their salting differ.
fn staged_scenario(
    name: &'static str,
    dataset: &'static str,
    em_rules: Vec<BlockingRule>,
    include_clustering: bool,
) -> Result<Scenario> {
    let settings = Settings::builder()
        .blocking_rule(block_on(&["first_name", "last_name"])?)
        .blocking_rule(block_on(&["dob", "middle_name"])?)
        .blocking_rule(block_on(&["last_name", "occupation"])?)
        .comparison(jaro_winkler_at_thresholds("first_name"))
        .comparison(jaro_winkler_at_thresholds("last_name"))
        .comparison(jaro_winkler_at_thresholds("middle_name"))
        .comparison(levenshtein_at_thresholds("dob"))
        .comparison(exact_match("occupation"))
        .build()?;

    let mut stages = vec![
        StageSpec {
            order: 1,
            name: "estimate_probability_two_random_records_match",
            op: StageOp::EstimateProbabilityTwoRandomRecordsMatch {
                deterministic_rules: vec![block_on(&["first_name", "last_name", "dob"])?],
                recall: 0.8,
            },
            policy: Some(TimingPolicy::pedantic()),
        },
        StageSpec {
            order: 2,
            name: "estimate_u",
            op: StageOp::EstimateU,
            policy: Some(TimingPolicy::pedantic()),
        },
        StageSpec {
            order: 3,
            name: "estimate_parameters_using_expectation_maximisation",
            op: StageOp::EstimateParametersUsingEm {
                blocking_rules: em_rules,
                estimate_without_term_frequencies: true,
            },
            policy: Some(TimingPolicy::pedantic()),
        },
        StageSpec {
            order: 4,
            name: "predict",
            op: StageOp::Predict {
                threshold_match_probability: Some(0.9),
            },
            policy: Some(TimingPolicy::pedantic()),
        },
    ];

    if include_clustering {
        stages.push(StageSpec {
            order: 5,
            name: "cluster_pairwise_predictions",
            op: StageOp::Cluster { threshold: 0.95 },
            policy: Some(TimingPolicy::pedantic()),
        });
    }

    stages.push(StageSpec {
        order: stages.len() as u32 + 1,
        name: "cleanup",
        op: StageOp::Cleanup,
        policy: None,
    });

    Ok(Scenario {
        name,
        dataset,
        settings,
        stages,
    })
}

/// 3m rows: EM passes are salted by the host's cpu count to spread the
/// skewed name keys.
pub fn synthetic_3m(cpu_count: u32, include_clustering: bool) -> Result<Scenario> {
    let em_rules = vec![
        block_on(&["first_name", "last_name"])?.with_salting_partitions(cpu_count)?,
        block_on(&["dob", "middle_name"])?.with_salting_partitions(cpu_count)?,
    ];
    staged_scenario("synthetic_3m", "synthetic_3m", em_rules, include_clustering)
}

/// 7m rows: wider EM blocks, fixed salting of 2.
pub fn synthetic_7m(include_clustering: bool) -> Result<Scenario> {
    let em_rules = vec![
        block_on(&["first_name", "last_name", "occupation"])?.with_salting_partitions(2)?,
        block_on(&["dob", "middle_name"])?.with_salting_partitions(2)?,
    ];
    staged_scenario("synthetic_7m", "synthetic_7m", em_rules, include_clustering)
}

/// 50k rows: a single combined estimate-u-then-predict stage, measured over
/// two rounds with one warmup, against the historical 50k dataset.
pub fn synthetic_50k() -> Result<Scenario> {
    let settings = Settings::builder()
        .probability_two_random_records_match(0.0001)
        .blocking_rule(BlockingRule::from_sql(
            "l.postcode_fake = r.postcode_fake and l.first_name = r.first_name",
        ))
        .blocking_rule(BlockingRule::from_sql(
            "l.first_name = r.first_name and l.surname = r.surname",
        ))
        .blocking_rule(BlockingRule::from_sql(
            "l.dob = r.dob and substr(l.postcode_fake,1,2) = substr(r.postcode_fake,1,2)",
        ))
        .blocking_rule(BlockingRule::from_sql(
            "l.postcode_fake = r.postcode_fake and substr(l.dob,1,3) = substr(r.dob,1,3)",
        ))
        .blocking_rule(BlockingRule::from_sql(
            "l.postcode_fake = r.postcode_fake and substr(l.dob,4,5) = substr(r.dob,4,5)",
        ))
        .comparison(jaro_winkler_at_thresholds("first_name"))
        .comparison(jaro_winkler_at_thresholds("surname"))
        .comparison(levenshtein_at_thresholds("dob"))
        .comparison(exact_match("birth_place"))
        .comparison(levenshtein_at_thresholds("postcode_fake"))
        .comparison(exact_match("gender"))
        .comparison(exact_match("occupation"))
        .retain_matching_columns(false)
        .retain_intermediate_calculation_columns(false)
        .additional_column_to_retain("cluster")
        .max_iterations(20)
        .build()?;

    Ok(Scenario {
        name: "synthetic_50k",
        dataset: "historical_50k",
        settings,
        stages: vec![
            StageSpec {
                order: 1,
                name: "estimate_u_and_predict",
                op: StageOp::Sequence(vec![
                    StageOp::EstimateU,
                    StageOp::Predict {
                        threshold_match_probability: None,
                    },
                ]),
                policy: Some(TimingPolicy {
                    rounds: 2,
                    iterations: 1,
                    warmup_rounds: 1,
                }),
            },
            StageSpec {
                order: 2,
                name: "cleanup",
                op: StageOp::Cleanup,
                policy: None,
            },
        ],
    })
}

pub fn scenario_by_name(
    name: &str,
    cpu_count: u32,
    include_clustering: bool,
) -> Result<Scenario> {
    match name {
        "synthetic_50k" => synthetic_50k(),
        "synthetic_3m" => synthetic_3m(cpu_count, include_clustering),
        "synthetic_7m" => synthetic_7m(include_clustering),
        other => anyhow::bail!(
            "Unknown scenario '{}': expected synthetic_50k, synthetic_3m or synthetic_7m",
            other
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_orders_are_strictly_increasing() {
        for scenario in [
            synthetic_50k().unwrap(),
            synthetic_3m(16, false).unwrap(),
            synthetic_7m(true).unwrap(),
        ] {
            let orders: Vec<u32> = scenario.stages.iter().map(|s| s.order).collect();
            let mut sorted = orders.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(orders, sorted, "scenario {}", scenario.name);
        }
    }

    #[test]
    fn test_cleanup_is_last_and_untimed() {
        for scenario in [
            synthetic_50k().unwrap(),
            synthetic_3m(4, true).unwrap(),
            synthetic_7m(false).unwrap(),
        ] {
            let last = scenario.stages.last().unwrap();
            assert_eq!(last.name, "cleanup");
            assert!(last.policy.is_none());
            assert!(matches!(last.op, StageOp::Cleanup));
        }
    }

    #[test]
    fn test_3m_em_salting_tracks_cpu_count() {
        let scenario = synthetic_3m(32, false).unwrap();
        let em = scenario
            .stages
            .iter()
            .find(|s| s.name == "estimate_parameters_using_expectation_maximisation")
            .unwrap();
        match &em.op {
            StageOp::EstimateParametersUsingEm { blocking_rules, .. } => {
                assert_eq!(blocking_rules.len(), 2);
                for rule in blocking_rules {
                    assert_eq!(rule.salting_partitions(), Some(32));
                }
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn test_7m_em_salting_is_fixed() {
        let scenario = synthetic_7m(false).unwrap();
        let em = scenario
            .stages
            .iter()
            .find(|s| s.name == "estimate_parameters_using_expectation_maximisation")
            .unwrap();
        match &em.op {
            StageOp::EstimateParametersUsingEm {
                blocking_rules,
                estimate_without_term_frequencies,
            } => {
                assert!(estimate_without_term_frequencies);
                assert_eq!(blocking_rules[0].salting_partitions(), Some(2));
                assert!(blocking_rules[0].sql().contains("l.occupation = r.occupation"));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn test_clustering_stage_is_opt_in() {
        let without = synthetic_3m(8, false).unwrap();
        assert!(!without
            .stages
            .iter()
            .any(|s| s.name == "cluster_pairwise_predictions"));

        let with = synthetic_3m(8, true).unwrap();
        let cluster = with
            .stages
            .iter()
            .find(|s| s.name == "cluster_pairwise_predictions")
            .unwrap();
        assert_eq!(cluster.order, 5);
        assert_eq!(with.stages.last().unwrap().order, 6);
    }

    #[test]
    fn test_50k_settings_match_historical_configuration() {
        let scenario = synthetic_50k().unwrap();
        assert_eq!(scenario.dataset, "historical_50k");
        assert_eq!(
            scenario.settings.blocking_rules_to_generate_predictions.len(),
            5
        );
        assert_eq!(scenario.settings.comparisons.len(), 7);
        assert_eq!(
            scenario.settings.additional_columns_to_retain,
            vec!["cluster".to_string()]
        );

        let stage = &scenario.stages[0];
        let policy = stage.policy.unwrap();
        assert_eq!(policy.rounds, 2);
        assert_eq!(policy.warmup_rounds, 1);
    }

    #[test]
    fn test_scenario_by_name_rejects_unknown() {
        assert!(scenario_by_name("synthetic_9b", 4, false).is_err());
        assert_eq!(
            scenario_by_name("synthetic_7m", 4, false).unwrap().name,
            "synthetic_7m"
        );
    }
}

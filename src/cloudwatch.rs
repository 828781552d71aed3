//! Monitoring-API correlation and remote log shipping.
//!
//! Host CPU/memory telemetry is collected out of band by the CloudWatch
//! agent on the benchmark host. After a run finishes, the driver queries
//! GetMetricData over the run's wall-clock window and persists the series
//! next to the timing report. Driver log lines are also forwarded to a
//! CloudWatch Logs stream so a run leaves a remote trace even when the
//! host is terminated afterwards.

use anyhow::{anyhow, Context, Result};
use aws_sdk_cloudwatch::primitives::DateTime as AwsDateTime;
use aws_sdk_cloudwatch::types::{Dimension, Metric, MetricDataQuery, MetricStat};
use aws_sdk_cloudwatchlogs::types::InputLogEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::host::InstanceIdentity;
use crate::TARGET_AWS_REQUEST;

const AGENT_NAMESPACE: &str = "CWAgent";
const LOG_BATCH_SIZE: usize = 100;

/// One metric series returned by the monitoring API, flattened for JSON.
#[derive(Debug, Serialize)]
pub struct MetricSeries {
    pub id: String,
    pub label: String,
    pub status_code: Option<String>,
    pub timestamps: Vec<String>,
    pub values: Vec<f64>,
}

fn instance_dimensions(identity: &InstanceIdentity) -> Vec<Dimension> {
    vec![
        Dimension::builder()
            .name("InstanceId")
            .value(&identity.instance_id)
            .build(),
        Dimension::builder()
            .name("InstanceType")
            .value(&identity.instance_type)
            .build(),
    ]
}

/// The two per-second series we correlate with benchmark windows: memory
/// used percent, and user CPU percent across all cores.
pub fn metric_data_queries(identity: &InstanceIdentity) -> Vec<MetricDataQuery> {
    let mem_metric = Metric::builder()
        .namespace(AGENT_NAMESPACE)
        .metric_name("mem_used_percent")
        .set_dimensions(Some(instance_dimensions(identity)))
        .build();

    let mut cpu_dimensions = instance_dimensions(identity);
    cpu_dimensions.push(Dimension::builder().name("cpu").value("cpu-total").build());
    let cpu_metric = Metric::builder()
        .namespace(AGENT_NAMESPACE)
        .metric_name("cpu_usage_user")
        .set_dimensions(Some(cpu_dimensions))
        .build();

    vec![
        MetricDataQuery::builder()
            .id("mem_used_query")
            .label(format!(
                "instance_id={} - instance_type={} - Memory Used %",
                identity.instance_id, identity.instance_type
            ))
            .metric_stat(
                MetricStat::builder()
                    .metric(mem_metric)
                    .period(1)
                    .stat("Average")
                    .build(),
            )
            .return_data(true)
            .build(),
        MetricDataQuery::builder()
            .id("user_cpu_used_query")
            .label(format!(
                "instance_id={} - instance_type={} - CPU User %",
                identity.instance_id, identity.instance_type
            ))
            .metric_stat(
                MetricStat::builder()
                    .metric(cpu_metric)
                    .period(1)
                    .stat("Average")
                    .build(),
            )
            .return_data(true)
            .build(),
    ]
}

fn to_rfc3339(timestamp: &AwsDateTime) -> String {
    DateTime::<Utc>::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| timestamp.secs().to_string())
}

/// Query host CPU/memory over the run's wall-clock window.
pub async fn get_metric_data_for_run(
    client: &aws_sdk_cloudwatch::Client,
    identity: &InstanceIdentity,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<MetricSeries>> {
    info!(
        target: TARGET_AWS_REQUEST,
        "Querying CloudWatch metrics for {} from {} to {}",
        identity.instance_id,
        start.to_rfc3339(),
        end.to_rfc3339()
    );

    let response = client
        .get_metric_data()
        .set_metric_data_queries(Some(metric_data_queries(identity)))
        .start_time(AwsDateTime::from_secs(start.timestamp()))
        .end_time(AwsDateTime::from_secs(end.timestamp()))
        .send()
        .await
        .context("GetMetricData request failed")?;

    let series = response
        .metric_data_results()
        .iter()
        .map(|result| MetricSeries {
            id: result.id().unwrap_or_default().to_string(),
            label: result.label().unwrap_or_default().to_string(),
            status_code: result.status_code().map(|s| s.as_str().to_string()),
            timestamps: result.timestamps().iter().map(to_rfc3339).collect(),
            values: result.values().to_vec(),
        })
        .collect::<Vec<_>>();

    for s in &series {
        debug!(
            target: TARGET_AWS_REQUEST,
            "Metric series '{}' returned {} datapoints", s.id, s.values.len()
        );
    }

    Ok(series)
}

pub fn save_metrics_to_json(series: &[MetricSeries], path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(series)?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write metrics data to {}", path.display()))
}

/// Buffered forwarder of driver log lines to a CloudWatch Logs stream.
pub struct LogSink {
    client: aws_sdk_cloudwatchlogs::Client,
    log_group: String,
    log_stream: String,
    buffer: Vec<InputLogEvent>,
}

impl LogSink {
    /// Build the sink and make sure the group and stream exist. Creation
    /// failures for already-existing resources are ignored.
    pub async fn create(
        config: &aws_config::SdkConfig,
        log_group: &str,
        log_stream: &str,
    ) -> Result<LogSink> {
        let client = aws_sdk_cloudwatchlogs::Client::new(config);

        if let Err(e) = client
            .create_log_group()
            .log_group_name(log_group)
            .send()
            .await
        {
            debug!(target: TARGET_AWS_REQUEST, "create_log_group '{}': {}", log_group, e);
        }
        if let Err(e) = client
            .create_log_stream()
            .log_group_name(log_group)
            .log_stream_name(log_stream)
            .send()
            .await
        {
            debug!(target: TARGET_AWS_REQUEST, "create_log_stream '{}': {}", log_stream, e);
        }

        Ok(LogSink {
            client,
            log_group: log_group.to_string(),
            log_stream: log_stream.to_string(),
            buffer: Vec::new(),
        })
    }

    /// Queue one line; flushes automatically once a batch accumulates.
    pub async fn log(&mut self, message: &str) -> Result<()> {
        let event = InputLogEvent::builder()
            .timestamp(Utc::now().timestamp_millis())
            .message(message)
            .build()
            .map_err(|e| anyhow!("Failed to build log event: {}", e))?;
        self.buffer.push(event);

        if self.buffer.len() >= LOG_BATCH_SIZE {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let events = std::mem::take(&mut self.buffer);
        let count = events.len();
        match self
            .client
            .put_log_events()
            .log_group_name(&self.log_group)
            .log_stream_name(&self.log_stream)
            .set_log_events(Some(events))
            .send()
            .await
        {
            Ok(_) => {
                debug!(target: TARGET_AWS_REQUEST, "Shipped {} log events to {}/{}", count, self.log_group, self.log_stream);
                Ok(())
            }
            Err(e) => {
                // Losing remote log lines should not fail the benchmark run.
                warn!(target: TARGET_AWS_REQUEST, "Failed to ship {} log events: {}", count, e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> InstanceIdentity {
        InstanceIdentity {
            instance_id: "i-0abc123def".to_string(),
            instance_type: "c6i.8xlarge".to_string(),
        }
    }

    #[test]
    fn test_metric_queries_shape() {
        let queries = metric_data_queries(&identity());
        assert_eq!(queries.len(), 2);

        let mem = &queries[0];
        assert_eq!(mem.id(), Some("mem_used_query"));
        assert_eq!(mem.return_data(), Some(true));
        let stat = mem.metric_stat().unwrap();
        assert_eq!(stat.period(), Some(1));
        assert_eq!(stat.stat(), Some("Average"));
        let metric = stat.metric().unwrap();
        assert_eq!(metric.namespace(), Some("CWAgent"));
        assert_eq!(metric.metric_name(), Some("mem_used_percent"));
        assert_eq!(metric.dimensions().len(), 2);

        let cpu = &queries[1];
        assert_eq!(cpu.id(), Some("user_cpu_used_query"));
        let metric = cpu.metric_stat().unwrap().metric().unwrap();
        assert_eq!(metric.metric_name(), Some("cpu_usage_user"));
        let dims = metric.dimensions();
        assert_eq!(dims.len(), 3);
        assert_eq!(dims[2].name(), Some("cpu"));
        assert_eq!(dims[2].value(), Some("cpu-total"));
    }

    #[test]
    fn test_query_labels_carry_instance_identity() {
        let queries = metric_data_queries(&identity());
        assert_eq!(
            queries[0].label(),
            Some("instance_id=i-0abc123def - instance_type=c6i.8xlarge - Memory Used %")
        );
        assert_eq!(
            queries[1].label(),
            Some("instance_id=i-0abc123def - instance_type=c6i.8xlarge - CPU User %")
        );
    }

    #[test]
    fn test_timestamp_serialization() {
        assert_eq!(
            to_rfc3339(&AwsDateTime::from_secs(0)),
            "1970-01-01T00:00:00+00:00"
        );
        assert_eq!(
            to_rfc3339(&AwsDateTime::from_secs(1_700_000_000)),
            "2023-11-14T22:13:20+00:00"
        );
    }

    #[test]
    fn test_metric_series_json() {
        let series = MetricSeries {
            id: "mem_used_query".to_string(),
            label: "label".to_string(),
            status_code: Some("Complete".to_string()),
            timestamps: vec!["2024-01-01T00:00:00+00:00".to_string()],
            values: vec![41.7],
        };
        let value = serde_json::to_value(&series).unwrap();
        assert_eq!(value["id"], "mem_used_query");
        assert_eq!(value["values"][0], 41.7);
    }
}

//! HTTP client for the external record-linkage engine.
//!
//! The engine is an opaque dependency: blocking-rule evaluation, comparison
//! vectors, EM estimation, prediction and clustering all happen on the other
//! side of this client. We only create a session, invoke operations against
//! it, and read back row counts and cached-table names.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::settings::{BlockingRule, Settings};
use crate::TARGET_ENGINE_REQUEST;

const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:9832";
// Engine operations on the multi-million-row datasets can run for a long
// time; the request timeout bounds a single stage, not a single retry.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);
const MAX_RETRIES: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct EngineClient {
    base_url: Url,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    session_id: String,
}

/// A cached intermediate table held by the engine for a session.
#[derive(Clone, Debug, Deserialize)]
pub struct CachedTable {
    pub key: String,
    pub physical_name: String,
}

impl EngineClient {
    /// Build a client for the engine service. The URL comes from the
    /// argument if given, otherwise `LINKBENCH_ENGINE_URL`, otherwise the
    /// local default.
    pub fn new(base_url: Option<&str>) -> Result<Self> {
        let raw = match base_url {
            Some(url) => url.to_string(),
            None => std::env::var("LINKBENCH_ENGINE_URL")
                .unwrap_or_else(|_| DEFAULT_ENGINE_URL.to_string()),
        };
        let base_url = Url::parse(&raw)
            .with_context(|| format!("Invalid engine URL: {}", raw))?;
        let client = reqwest::Client::builder()
            .gzip(true)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(EngineClient { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Load a dataset into the engine and bind it to the given settings,
    /// returning the session handle every benchmark stage shares.
    pub async fn create_session(&self, dataset: &str, settings: &Settings) -> Result<EngineSession> {
        info!(target: TARGET_ENGINE_REQUEST, "Creating engine session for dataset '{}'", dataset);
        let body = json!({
            "dataset": dataset,
            "settings": settings,
        });
        let response: CreateSessionResponse = self.post("sessions", &body).await?;
        info!(
            target: TARGET_ENGINE_REQUEST,
            "Engine session '{}' created for dataset '{}'", response.session_id, dataset
        );
        Ok(EngineSession {
            client: self.clone(),
            id: response.session_id,
        })
    }

    async fn post<T: for<'de> Deserialize<'de>>(&self, path: &str, body: &Value) -> Result<T> {
        let url = self.base_url.join(path)?;

        for attempt in 1..=MAX_RETRIES {
            debug!(target: TARGET_ENGINE_REQUEST, "POST {} (attempt {}/{})", url, attempt, MAX_RETRIES);
            let request = self.client.post(url.clone()).json(body).send();
            match timeout(REQUEST_TIMEOUT, request).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .map_err(|e| anyhow!("Failed to decode engine response: {}", e));
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    // Engine-side failures are not retried: the session state
                    // after a failed operation is unknown.
                    error!(
                        target: TARGET_ENGINE_REQUEST,
                        "Engine returned {} for {}: {}", status, url, body_text
                    );
                    return Err(anyhow!("Engine error {} for {}: {}", status, url, body_text));
                }
                Ok(Err(e)) => {
                    warn!(target: TARGET_ENGINE_REQUEST, "Request to {} failed: {}", url, e);
                }
                Err(_) => {
                    warn!(
                        target: TARGET_ENGINE_REQUEST,
                        "Request to {} timed out after {}s", url, REQUEST_TIMEOUT.as_secs()
                    );
                }
            }
            if attempt < MAX_RETRIES {
                sleep(RETRY_DELAY).await;
            }
        }

        Err(anyhow!(
            "Engine request to {} failed after {} attempts",
            url,
            MAX_RETRIES
        ))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let url = self.base_url.join(path)?;
        debug!(target: TARGET_ENGINE_REQUEST, "DELETE {}", url);
        let response = self
            .client
            .delete(url.clone())
            .send()
            .await
            .map_err(|e| anyhow!("Request to {} failed: {}", url, e))?;
        if !response.status().is_success() {
            anyhow::bail!("Engine error {} for {}", response.status(), url);
        }
        Ok(())
    }
}

/// A loaded dataset plus engine handle. Heavyweight: created once per
/// benchmark run and shared by every stage.
pub struct EngineSession {
    client: EngineClient,
    id: String,
}

#[derive(Deserialize)]
struct AckResponse {
    #[allow(dead_code)]
    status: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    rows: Vec<Value>,
}

#[derive(Deserialize)]
struct CachedTablesResponse {
    tables: Vec<CachedTable>,
}

impl EngineSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn op_path(&self, op: &str) -> String {
        format!("sessions/{}/{}", self.id, op)
    }

    /// Estimate the probability two random records match from deterministic
    /// rules and an assumed recall.
    pub async fn estimate_probability_two_random_records_match(
        &self,
        deterministic_rules: &[BlockingRule],
        recall: f64,
    ) -> Result<()> {
        let rules: Vec<&str> = deterministic_rules.iter().map(|r| r.sql()).collect();
        let body = json!({
            "deterministic_matching_rules": rules,
            "recall": recall,
        });
        let _: AckResponse = self
            .client
            .post(&self.op_path("estimate-probability-two-random-records-match"), &body)
            .await?;
        Ok(())
    }

    /// Estimate u-probabilities by random sampling, bounded by `max_pairs`.
    pub async fn estimate_u_using_random_sampling(&self, max_pairs: u64) -> Result<()> {
        let body = json!({ "max_pairs": max_pairs });
        let _: AckResponse = self
            .client
            .post(&self.op_path("estimate-u-using-random-sampling"), &body)
            .await?;
        Ok(())
    }

    /// One EM pass restricted to the given blocking rule. Salting on the
    /// rule controls how the engine partitions the comparison space.
    pub async fn estimate_parameters_using_expectation_maximisation(
        &self,
        blocking_rule: &BlockingRule,
        estimate_without_term_frequencies: bool,
    ) -> Result<()> {
        let body = json!({
            "blocking_rule": blocking_rule,
            "estimate_without_term_frequencies": estimate_without_term_frequencies,
        });
        let _: AckResponse = self
            .client
            .post(
                &self.op_path("estimate-parameters-using-expectation-maximisation"),
                &body,
            )
            .await?;
        Ok(())
    }

    pub async fn predict(&self, threshold_match_probability: Option<f64>) -> Result<()> {
        let body = match threshold_match_probability {
            Some(threshold) => json!({ "threshold_match_probability": threshold }),
            None => json!({}),
        };
        let _: AckResponse = self.client.post(&self.op_path("predict"), &body).await?;
        Ok(())
    }

    pub async fn cluster_pairwise_predictions_at_threshold(&self, threshold: f64) -> Result<()> {
        let body = json!({ "threshold_match_probability": threshold });
        let _: AckResponse = self
            .client
            .post(&self.op_path("cluster-pairwise-predictions"), &body)
            .await?;
        Ok(())
    }

    /// Run arbitrary SQL against the session's backend and return the rows.
    pub async fn query_sql(&self, sql: &str) -> Result<Vec<Value>> {
        let body = json!({ "sql": sql });
        let response: QueryResponse = self.client.post(&self.op_path("query"), &body).await?;
        Ok(response.rows)
    }

    /// Physical names of the intermediate tables the engine has cached for
    /// this session.
    pub async fn list_cached_tables(&self) -> Result<Vec<CachedTable>> {
        let response: CachedTablesResponse = self
            .client
            .post(&self.op_path("cached-tables"), &json!({}))
            .await?;
        Ok(response.tables)
    }

    /// Release the dataset and engine handle.
    pub async fn close(&self) -> Result<()> {
        info!(target: TARGET_ENGINE_REQUEST, "Closing engine session '{}'", self.id);
        self.client.delete(&format!("sessions/{}", self.id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::block_on;

    #[test]
    fn test_engine_client_rejects_invalid_url() {
        assert!(EngineClient::new(Some("not a url")).is_err());
    }

    #[test]
    fn test_engine_client_default_url() {
        let client = EngineClient::new(Some(DEFAULT_ENGINE_URL)).unwrap();
        assert_eq!(client.base_url().as_str(), "http://127.0.0.1:9832/");
    }

    #[test]
    fn test_em_request_body_carries_salting() {
        let rule = block_on(&["dob", "middle_name"])
            .unwrap()
            .with_salting_partitions(2)
            .unwrap();
        let body = json!({
            "blocking_rule": rule,
            "estimate_without_term_frequencies": true,
        });
        assert_eq!(body["blocking_rule"]["salting_partitions"], 2);
        assert_eq!(
            body["blocking_rule"]["blocking_rule"],
            "l.dob = r.dob and l.middle_name = r.middle_name"
        );
        assert_eq!(body["estimate_without_term_frequencies"], true);
    }

    #[test]
    fn test_op_paths_are_session_scoped() {
        let session = EngineSession {
            client: EngineClient::new(Some(DEFAULT_ENGINE_URL)).unwrap(),
            id: "abc123".to_string(),
        };
        assert_eq!(session.op_path("predict"), "sessions/abc123/predict");
        assert_eq!(session.id(), "abc123");
    }
}

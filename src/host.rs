//! Host identity and machine information.
//!
//! Two sources: local facts from sysinfo (always available) and EC2
//! instance metadata over IMDSv2 (absent off-EC2, which is not an error:
//! the run simply carries no instance identity and no monitoring window
//! can be correlated).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, warn};

const IMDS_BASE_URL: &str = "http://169.254.169.254";
const IMDS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MachineInfo {
    pub node: String,
    pub cpu_count: usize,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub uptime_secs: u64,
}

impl MachineInfo {
    pub fn collect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        MachineInfo {
            node: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            cpu_count: sys.cpus().len(),
            memory_total_bytes: sys.total_memory(),
            memory_used_bytes: sys.used_memory(),
            uptime_secs: System::uptime(),
        }
    }
}

/// EC2 identity used to dimension the monitoring-API queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub instance_id: String,
    pub instance_type: String,
}

/// Fetch instance id and type from the instance metadata service.
/// Returns None when the metadata service is unreachable.
pub async fn fetch_instance_identity() -> Option<InstanceIdentity> {
    let client = reqwest::Client::builder()
        .timeout(IMDS_TIMEOUT)
        .build()
        .ok()?;

    let token = match client
        .put(format!("{}/latest/api/token", IMDS_BASE_URL))
        .header("X-aws-ec2-metadata-token-ttl-seconds", "21600")
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => response.text().await.ok()?,
        _ => {
            warn!("Instance metadata service unreachable; no instance identity for this run");
            return None;
        }
    };

    let instance_id = fetch_metadata(&client, &token, "instance-id").await?;
    let instance_type = fetch_metadata(&client, &token, "instance-type").await?;
    debug!(
        "Resolved instance identity: id={}, type={}",
        instance_id, instance_type
    );

    Some(InstanceIdentity {
        instance_id,
        instance_type,
    })
}

async fn fetch_metadata(client: &reqwest::Client, token: &str, path: &str) -> Option<String> {
    let url = format!("{}/latest/meta-data/{}", IMDS_BASE_URL, path);
    let response = client
        .get(&url)
        .header("X-aws-ec2-metadata-token", token)
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        warn!("Instance metadata request for '{}' returned {}", path, response.status());
        return None;
    }
    response.text().await.ok()
}

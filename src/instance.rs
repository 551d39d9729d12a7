//! Node identity: explicit override, then the EC2 metadata service, then host and pid.

use tracing::{debug, info};

#[cfg(feature = "distributed")]
const METADATA_BASE: &str = "http://169.254.169.254/latest";

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "node".to_string())
}

pub fn fallback_instance_id() -> String {
    format!("{}-{}", host_name(), std::process::id())
}

#[cfg(feature = "distributed")]
async fn metadata_instance_id() -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(2))
        .build()
        .ok()?;
    // IMDSv2 session token; fall back to an unauthenticated read if refused.
    let token = client
        .put(format!("{}/api/token", METADATA_BASE))
        .header("X-aws-ec2-metadata-token-ttl-seconds", "60")
        .send()
        .await
        .ok()
        .filter(|r| r.status().is_success());
    let token = match token {
        Some(response) => response.text().await.ok(),
        None => None,
    };

    let mut request = client.get(format!("{}/meta-data/instance-id", METADATA_BASE));
    if let Some(token) = token {
        request = request.header("X-aws-ec2-metadata-token", token);
    }
    let response = request.send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    let id = response.text().await.ok()?.trim().to_string();
    (!id.is_empty()).then_some(id)
}

#[cfg(not(feature = "distributed"))]
async fn metadata_instance_id() -> Option<String> {
    None
}

pub async fn resolve_instance_id(configured: Option<&str>) -> String {
    if let Some(id) = configured.filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    if let Some(id) = metadata_instance_id().await {
        info!(instance_id = %id, "instance id from metadata service");
        return id;
    }
    let id = fallback_instance_id();
    debug!(instance_id = %id, "using host-derived instance id");
    id
}

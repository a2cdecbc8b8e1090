//! Minimal YARN Resource Manager REST client (§4.J): application query/kill and capacity
//! scheduler queue-availability probing.

use anyhow::{anyhow, Context, Result};
use kprov_core::prelude::*;
use tracing::warn;

pub struct AppInfo {
    pub id: String,
    pub state: String,
    pub am_host_http_address: Option<String>,
}

pub struct YarnClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
}

impl YarnClient {
    pub fn new(config: &YarnConfig) -> Result<Self> {
        let mut endpoints = vec![config.yarn_endpoint.clone()];
        if let Some(alt) = &config.alt_yarn_endpoint {
            endpoints.push(alt.clone());
        }
        if config.yarn_endpoint_security_enabled {
            warn!("GP_YARN_ENDPOINT_SECURITY_ENABLED is set; Kerberos/SPNEGO auth against the YARN RM is not implemented, requests are sent unauthenticated with simple-auth impersonation only");
        }
        let http = reqwest::Client::builder().build().context("building yarn http client")?;
        Ok(YarnClient { http, endpoints })
    }

    async fn get_json(&self, path: &str, kernel_username: &str, query: &[(&str, String)]) -> Result<serde_json::Value> {
        let mut last_err = None;
        for endpoint in &self.endpoints {
            let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
            let req = self.http.get(&url).query(query).query(&[("user.name", kernel_username)]);
            match req.send().await {
                Ok(resp) => match resp.error_for_status() {
                    Ok(resp) => return resp.json::<serde_json::Value>().await.context("decoding yarn resource manager response"),
                    Err(e) => last_err = Some(anyhow!(e)),
                },
                Err(e) => last_err = Some(anyhow!(e)),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no yarn resource manager endpoints configured")))
    }

    async fn put_json(&self, path: &str, kernel_username: &str, body: &serde_json::Value) -> Result<()> {
        let mut last_err = None;
        for endpoint in &self.endpoints {
            let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
            let req = self.http.put(&url).query(&[("user.name", kernel_username)]).json(body);
            match req.send().await {
                Ok(resp) => match resp.error_for_status() {
                    Ok(_) => return Ok(()),
                    Err(e) => last_err = Some(anyhow!(e)),
                },
                Err(e) => last_err = Some(anyhow!(e)),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no yarn resource manager endpoints configured")))
    }

    /// Finds the application whose name contains `kernel_id`, among apps started no earlier
    /// than `started_time_begin_ms`. Picks the lexicographically greatest application ID when
    /// more than one matches, same as the original's restart tolerance.
    pub async fn app_by_name(&self, kernel_id: &str, kernel_username: &str, started_time_begin_ms: i64) -> Option<AppInfo> {
        let data = self.get_json("/ws/v1/cluster/apps", kernel_username, &[("startedTimeBegin", started_time_begin_ms.to_string())]).await.ok()?;
        let apps = data.pointer("/apps/app")?.as_array()?;
        let mut top_id = String::new();
        let mut target: Option<&serde_json::Value> = None;
        for app in apps {
            let name = app.get("name").and_then(|v| v.as_str()).unwrap_or_default();
            let id = app.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            if name.contains(kernel_id) && id > top_id.as_str() {
                top_id = id.to_string();
                target = Some(app);
            }
        }
        target.map(|app| AppInfo {
            id: app.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            state: app.get("state").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            am_host_http_address: app.get("amHostHttpAddress").and_then(|v| v.as_str()).map(|s| s.to_string()),
        })
    }

    pub async fn app_by_id(&self, app_id: &str, kernel_username: &str) -> Option<AppInfo> {
        let data = self.get_json(&format!("/ws/v1/cluster/apps/{app_id}"), kernel_username, &[]).await.ok()?;
        let app = data.get("app")?;
        Some(AppInfo {
            id: app.get("id").and_then(|v| v.as_str()).unwrap_or(app_id).to_string(),
            state: app.get("state").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            am_host_http_address: app.get("amHostHttpAddress").and_then(|v| v.as_str()).map(|s| s.to_string()),
        })
    }

    pub async fn app_state(&self, app_id: &str, kernel_username: &str) -> Option<String> {
        let data = self.get_json(&format!("/ws/v1/cluster/apps/{app_id}/state"), kernel_username, &[]).await.ok()?;
        data.get("state").and_then(|v| v.as_str()).map(|s| s.to_string())
    }

    pub async fn kill_app(&self, app_id: &str, kernel_username: &str) -> Result<()> {
        self.put_json(&format!("/ws/v1/cluster/apps/{app_id}/state"), kernel_username, &serde_json::json!({"state": "KILLED"})).await
    }

    /// Maximum single-container memory the scheduler will grant, in MB, if discoverable.
    pub async fn container_memory(&self, kernel_username: &str) -> Result<Option<i64>> {
        let data = self.get_json("/ws/v1/cluster/scheduler", kernel_username, &[]).await?;
        Ok(data.pointer("/scheduler/schedulerInfo/maxAllocation/memory").and_then(|v| v.as_i64()))
    }

    /// Returns whether the named queue's partition has capacity under `threshold`, or `None`
    /// if the queue or partition can't be located (caller should skip the check).
    pub async fn queue_availability(&self, queue: &str, node_label: &str, threshold: f64, kernel_username: &str) -> Result<Option<bool>> {
        let data = self.get_json("/ws/v1/cluster/scheduler", kernel_username, &[]).await?;
        let Some(root) = data.pointer("/scheduler/schedulerInfo") else { return Ok(None) };
        let Some(queue_node) = find_queue(root, queue) else { return Ok(None) };
        let Some(used_capacity) = partition_used_capacity(queue_node, node_label) else { return Ok(None) };
        Ok(Some(used_capacity <= threshold))
    }
}

fn find_queue<'a>(node: &'a serde_json::Value, queue: &str) -> Option<&'a serde_json::Value> {
    if node.get("queueName").and_then(|v| v.as_str()) == Some(queue) {
        return Some(node);
    }
    let children = node.pointer("/queues/queue")?.as_array()?;
    for child in children {
        if let Some(found) = find_queue(child, queue) {
            return Some(found);
        }
    }
    None
}

fn partition_used_capacity(queue_node: &serde_json::Value, node_label: &str) -> Option<f64> {
    let partitions = queue_node.pointer("/capacities/queueCapacitiesByPartition")?.as_array()?;
    for partition in partitions {
        if partition.get("partitionName").and_then(|v| v.as_str()).unwrap_or("") == node_label {
            return partition.get("usedCapacity").and_then(|v| v.as_f64());
        }
    }
    None
}

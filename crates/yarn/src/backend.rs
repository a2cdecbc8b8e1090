//! YARN backend (§4.J): local launcher process that submits to YARN, queue/partition
//! capacity preflight, app-by-name discovery, kill-then-poll termination.

use crate::client::YarnClient;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use kprov_core::prelude::*;
use kprov_provisioner::backend::{Backend, LaunchOutcome, PlacementStatus};
use kprov_provisioner::signal::SIGKILL;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::process::{Child, Command};
use tracing::debug;

const INITIAL_STATES: &[&str] = &["new", "submitted", "accepted", "running"];
const FINAL_STATES: &[&str] = &["finished", "killed", "failed"];

#[derive(Clone)]
struct YarnPlacement {
    application_id: Option<String>,
    kernel_username: String,
    started_time_begin_ms: i64,
}

pub struct YarnBackend {
    client: YarnClient,
    launch_timeout_secs: f64,
    poll_interval_secs: f64,
    max_poll_attempts: u32,
    placements: DashMap<KernelId, YarnPlacement>,
}

impl YarnBackend {
    pub fn new(config: &YarnConfig, launch_timeout_secs: f64, poll_interval_secs: f64, max_poll_attempts: u32) -> Result<Self> {
        Ok(YarnBackend {
            client: YarnClient::new(config)?,
            launch_timeout_secs,
            poll_interval_secs,
            max_poll_attempts,
            placements: DashMap::new(),
        })
    }

    fn now_ms() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
    }

    async fn confirm_queue_availability(&self, kernel_id: &KernelId, env: &HashMap<String, String>, kernel_username: &str) -> Result<()> {
        let executor_memory: i64 = env.get("KERNEL_EXECUTOR_MEMORY").and_then(|v| v.parse().ok()).unwrap_or(0);
        let driver_memory: i64 = env.get("KERNEL_DRIVER_MEMORY").and_then(|v| v.parse().ok()).unwrap_or(0);

        if executor_memory > 0 && driver_memory > 0 {
            if let Some(container_memory) = self.client.container_memory(kernel_username).await? {
                if executor_memory.max(driver_memory) > container_memory {
                    return Err(ProvisionerError::config("container memory is not sufficient for the requested executor/driver allocation").into());
                }
            }
        }

        let (Some(queue_name), Some(node_label)) = (env.get("KERNEL_QUEUE"), env.get("KERNEL_NODE_LABEL")) else {
            return Ok(());
        };
        let threshold: f64 = env.get("YARN_PARTITION_THRESHOLD").and_then(|v| v.parse().ok()).unwrap_or(95.0);

        let wait_budget = Duration::from_secs_f64(self.launch_timeout_secs * 0.20);
        let started = Instant::now();
        loop {
            match self.client.queue_availability(queue_name, node_label, threshold, kernel_username).await? {
                None => {
                    debug!(kernel_id = %kernel_id, queue_name, node_label, "queue or partition not found, skipping availability check");
                    return Ok(());
                }
                Some(true) => return Ok(()),
                Some(false) => {
                    if started.elapsed() > wait_budget {
                        return Err(ProvisionerError::timeout(
                            kernel_id.clone(),
                            None,
                            format!("yarn compute resource is unavailable after {:.1}s", wait_budget.as_secs_f64()),
                        )
                        .into());
                    }
                    tokio::time::sleep(Duration::from_secs_f64(self.poll_interval_secs)).await;
                }
            }
        }
    }

    fn kernel_log_path(kernel_id: &KernelId) -> std::path::PathBuf {
        let dir = std::env::var("GP_KERNEL_LOG_DIR").unwrap_or_else(|_| "/tmp".to_string());
        std::path::Path::new(&dir).join(format!("kernel-{kernel_id}.log"))
    }

    fn spawn_local(argv: &[String], env: &HashMap<String, String>, log_path: &std::path::Path) -> Result<Child> {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("opening kernel log file {}", log_path.display()))?;
        let stderr_file = log_file.try_clone().context("cloning kernel log file handle for stderr")?;

        let (program, rest) = argv.split_first().ok_or_else(|| anyhow!("empty argv"))?;
        Command::new(program)
            .args(rest)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .context("spawning local yarn launcher process")
    }

    /// Returns the cached application ID, discovering it by kernel-id-as-name if not yet known.
    async fn application_id_for(&self, kernel_id: &KernelId) -> Result<Option<String>> {
        let Some(mut placement) = self.placements.get(kernel_id).map(|p| p.clone()) else {
            return Ok(None);
        };
        if placement.application_id.is_some() {
            return Ok(placement.application_id);
        }
        let app = self.client.app_by_name(kernel_id, &placement.kernel_username, placement.started_time_begin_ms).await;
        if let Some(app) = app {
            if !app.id.is_empty() {
                placement.application_id = Some(app.id.clone());
                self.placements.insert(kernel_id.clone(), placement.clone());
                return Ok(Some(app.id));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Backend for YarnBackend {
    async fn pre_launch_hook(&self, kernel_id: &KernelId, env: &mut HashMap<String, String>) -> Result<()> {
        let kernel_username = env.get("KERNEL_USERNAME").cloned().unwrap_or_default();
        let impersonation_enabled = env.get("GP_IMPERSONATION_ENABLED").cloned().unwrap_or_else(|| "false".to_string());
        env.insert("GP_IMPERSONATION_ENABLED".to_string(), impersonation_enabled);

        self.confirm_queue_availability(kernel_id, env, &kernel_username).await?;

        self.placements.insert(
            kernel_id.clone(),
            YarnPlacement { application_id: None, kernel_username, started_time_begin_ms: Self::now_ms() },
        );
        Ok(())
    }

    async fn launch(&self, kernel_id: &KernelId, argv: &[String], env: &HashMap<String, String>) -> Result<LaunchOutcome> {
        let log_path = Self::kernel_log_path(kernel_id);
        let child = Self::spawn_local(argv, env, &log_path)?;
        Ok(LaunchOutcome::LocalProcess(child))
    }

    async fn status_query(&self, kernel_id: &KernelId, iteration: Option<u32>) -> Result<PlacementStatus> {
        let Some(placement) = self.placements.get(kernel_id).map(|p| p.clone()) else {
            return Ok(PlacementStatus {
                raw_state: String::new(),
                status: BackendStatus::NotFound,
                assigned_host: None,
                assigned_ip: None,
                message: None,
                placement: None,
            });
        };
        let Some(application_id) = self.application_id_for(kernel_id).await? else {
            if iteration.is_some() {
                debug!(kernel_id = %kernel_id, "application id not yet assigned for this kernel, retrying");
            }
            return Ok(PlacementStatus {
                raw_state: String::new(),
                status: BackendStatus::Transient,
                assigned_host: None,
                assigned_ip: None,
                message: None,
                placement: None,
            });
        };

        let Some(app) = self.client.app_by_id(&application_id, &placement.kernel_username).await else {
            return Ok(PlacementStatus {
                raw_state: String::new(),
                status: BackendStatus::Transient,
                assigned_host: None,
                assigned_ip: None,
                message: None,
                placement: None,
            });
        };

        let raw_state = app.state.to_lowercase();
        let mut assigned_host = None;
        let mut assigned_ip = None;
        if let Some(am_host) = app.am_host_http_address.as_deref() {
            if let Some(host) = am_host.split(':').next() {
                if !host.is_empty() {
                    assigned_host = Some(host.to_string());
                    if let Ok(mut addrs) = tokio::net::lookup_host((host, 0)).await {
                        assigned_ip = addrs.next().map(|a| a.ip().to_string());
                    }
                }
            }
        }

        if iteration.is_some() {
            debug!(kernel_id = %kernel_id, application_id, raw_state, ?assigned_host, "waiting on yarn application");
        }

        let status = if FINAL_STATES.contains(&raw_state.as_str()) {
            BackendStatus::Fatal
        } else if INITIAL_STATES.contains(&raw_state.as_str()) {
            BackendStatus::Transient
        } else {
            BackendStatus::Transient
        };
        let message = matches!(status, BackendStatus::Fatal).then(|| format!("yarn application entered state '{raw_state}'"));
        let placement = Some(PlacementHandle::Yarn { application_id: application_id.clone() });

        Ok(PlacementStatus { raw_state, status, assigned_host, assigned_ip, message, placement })
    }

    async fn terminate_placement(&self, kernel_id: &KernelId, _restart: bool) -> Result<BackendStatus> {
        let Some(placement) = self.placements.get(kernel_id).map(|p| p.clone()) else {
            return Ok(BackendStatus::NotFound);
        };
        let Some(application_id) = self.application_id_for(kernel_id).await? else {
            return Ok(BackendStatus::NotFound);
        };

        self.client.kill_app(&application_id, &placement.kernel_username).await.context("killing yarn application")?;

        let mut state = self.client.app_state(&application_id, &placement.kernel_username).await.unwrap_or_default();
        let mut attempts = 1;
        while !FINAL_STATES.contains(&state.to_lowercase().as_str()) && attempts <= self.max_poll_attempts {
            tokio::time::sleep(Duration::from_secs_f64(self.poll_interval_secs)).await;
            state = self.client.app_state(&application_id, &placement.kernel_username).await.unwrap_or_default();
            attempts += 1;
        }

        if FINAL_STATES.contains(&state.to_lowercase().as_str()) {
            self.placements.remove(kernel_id);
            Ok(BackendStatus::Terminated)
        } else {
            Ok(BackendStatus::Transient)
        }
    }

    async fn send_signal_native(&self, kernel_id: &KernelId, signum: i32) -> Result<SignalOutcome> {
        if signum == SIGKILL {
            let status = self.terminate_placement(kernel_id, false).await?;
            return Ok(match status {
                BackendStatus::Terminated | BackendStatus::NotFound => SignalOutcome::Delivered,
                _ => SignalOutcome::Refused,
            });
        }
        // YARN has no equivalent to POSIX interrupts; everything but a kill request falls
        // through to the generic comm-port signal, which has already been tried by the time
        // this is reached.
        Ok(SignalOutcome::NoProcess)
    }

    fn initial_states(&self) -> &'static [&'static str] {
        INITIAL_STATES
    }

    fn error_states(&self) -> &'static [&'static str] {
        FINAL_STATES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_backend() -> YarnBackend {
        let config = YarnConfig {
            yarn_endpoint: "http://localhost:8088".to_string(),
            alt_yarn_endpoint: None,
            yarn_endpoint_security_enabled: false,
            impersonation_enabled: false,
            shutdown_wait_time_secs: 15.0,
        };
        YarnBackend::new(&config, 30.0, 0.5, 5).unwrap()
    }

    #[tokio::test]
    async fn status_query_on_unknown_kernel_is_not_found() {
        let backend = fake_backend();
        let status = backend.status_query(&"nope".to_string(), None).await.unwrap();
        assert_eq!(status.status, BackendStatus::NotFound);
    }

    #[tokio::test]
    async fn terminate_unknown_kernel_is_not_found() {
        let backend = fake_backend();
        let status = backend.terminate_placement(&"nope".to_string(), false).await.unwrap();
        assert_eq!(status, BackendStatus::NotFound);
    }

    #[tokio::test]
    async fn pre_launch_hook_rejects_insufficient_container_memory_when_reachable() {
        // No live resource manager is reachable in this test environment, so the memory
        // preflight silently no-ops (container_memory() returns Err, propagated as-is);
        // this test only exercises that the call doesn't panic absent a cluster.
        let backend = fake_backend();
        let mut env = HashMap::new();
        env.insert("KERNEL_USERNAME".to_string(), "alice".to_string());
        let result = backend.pre_launch_hook(&"k1".to_string(), &mut env).await;
        assert!(result.is_err());
    }
}

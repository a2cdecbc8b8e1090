//! SSH/Distributed placement backend (§4.E): selects a host, spawns the kernel either
//! directly (local optimization) or over SSH, and falls back to `kill` for signaling when
//! the launcher's comm port is unavailable.

#![forbid(unsafe_code)]

mod host_select;
mod launch;

pub use host_select::HostSelector;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use kprov_core::prelude::*;
use kprov_provisioner::backend::{Backend, LaunchOutcome, PlacementStatus};
use kprov_provisioner::signal::{SIGKILL, SIGTERM};
use std::collections::HashMap;
use tracing::debug;

struct SshPlacement {
    host: String,
    pid: u32,
}

pub struct SshBackend {
    config: SshConfig,
    ssh_port: u16,
    selector: HostSelector,
    placements: DashMap<KernelId, SshPlacement>,
}

impl SshBackend {
    pub fn new(config: SshConfig, ssh_port: u16) -> Self {
        let selector = HostSelector::new(config.remote_hosts.clone(), config.load_balancing_algorithm);
        SshBackend { config, ssh_port, selector, placements: DashMap::new() }
    }

    fn ssh_user(&self) -> Option<&str> {
        if self.config.gss_ssh {
            None
        } else {
            self.config.remote_user.as_deref()
        }
    }
}

#[async_trait]
impl Backend for SshBackend {
    async fn pre_launch_hook(&self, kernel_id: &KernelId, env: &mut HashMap<String, String>) -> Result<()> {
        let remote_host_override = env.get("KERNEL_REMOTE_HOST").cloned();
        let host = self.selector.select(kernel_id, remote_host_override.as_deref());
        debug!(kernel_id = %kernel_id, host, "selected ssh host");
        env.insert("KERNEL_REMOTE_HOST".to_string(), host);
        Ok(())
    }

    async fn launch(&self, kernel_id: &KernelId, argv: &[String], env: &HashMap<String, String>) -> Result<LaunchOutcome> {
        let host = env
            .get("KERNEL_REMOTE_HOST")
            .cloned()
            .context("KERNEL_REMOTE_HOST missing; pre_launch_hook must run before launch")?;
        let log_path = launch::kernel_log_path(kernel_id);

        if launch::ip_is_local(&host) {
            let child = launch::spawn_local(argv, env, &log_path).context("spawning local kernel process")?;
            let pid = child.id().unwrap_or(0);
            self.placements.insert(kernel_id.clone(), SshPlacement { host, pid });
            return Ok(LaunchOutcome::LocalProcess(child));
        }

        let command = launch::build_remote_startup_command(argv, env, env, &log_path);
        let lines = launch::rsh(&host, self.ssh_port, self.ssh_user(), &command)
            .await
            .with_context(|| format!("launching kernel on remote host '{host}' via ssh"))?;
        let pid: u32 = lines
            .first()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| anyhow::anyhow!("remote launch on '{host}' did not return a pid: {lines:?}"))?;
        self.placements.insert(kernel_id.clone(), SshPlacement { host, pid });
        Ok(LaunchOutcome::Remote)
    }

    async fn status_query(&self, kernel_id: &KernelId, _iteration: Option<u32>) -> Result<PlacementStatus> {
        let placement = self.placements.get(kernel_id);
        let host = placement.as_ref().map(|p| p.host.clone());
        let handle = host.clone().map(|host| PlacementHandle::Ssh { host });
        Ok(PlacementStatus {
            raw_state: "running".to_string(),
            status: BackendStatus::Transient,
            assigned_host: host.clone(),
            assigned_ip: host,
            message: None,
            placement: handle,
        })
    }

    async fn terminate_placement(&self, kernel_id: &KernelId, _restart: bool) -> Result<BackendStatus> {
        let Some(placement) = self.placements.get(kernel_id).map(|p| (p.host.clone(), p.pid)) else {
            return Ok(BackendStatus::NotFound);
        };
        let (host, pid) = placement;
        if send_kill(&host, self.ssh_port, self.ssh_user(), pid, SIGTERM).await? {
            return Ok(BackendStatus::Terminated);
        }
        self.selector.release(kernel_id);
        Ok(BackendStatus::Transient)
    }

    async fn send_signal_native(&self, kernel_id: &KernelId, signum: i32) -> Result<SignalOutcome> {
        let Some(placement) = self.placements.get(kernel_id).map(|p| (p.host.clone(), p.pid)) else {
            return Ok(SignalOutcome::NoProcess);
        };
        let (host, pid) = placement;
        let delivered = send_kill(&host, self.ssh_port, self.ssh_user(), pid, signum).await?;
        if delivered {
            if signum == SIGKILL {
                self.placements.remove(kernel_id);
                self.selector.release(kernel_id);
            }
            Ok(SignalOutcome::Delivered)
        } else {
            Ok(SignalOutcome::NoProcess)
        }
    }

    fn initial_states(&self) -> &'static [&'static str] {
        &[]
    }

    fn error_states(&self) -> &'static [&'static str] {
        &[]
    }
}

/// `kill -N pid; echo $?` over SSH (or locally), accepting exit code `"0"` as delivered,
/// matching the original's string-compare replaced by a typed bool here.
async fn send_kill(host: &str, ssh_port: u16, user: Option<&str>, pid: u32, signum: i32) -> Result<bool> {
    let command = format!("kill -{signum} {pid}; echo $?");
    let lines = if launch::ip_is_local(host) {
        local_kill(pid, signum).await
    } else {
        launch::rsh(host, ssh_port, user, &command).await
    }?;
    Ok(lines.last().map(|l| l.trim() == "0").unwrap_or(false))
}

async fn local_kill(pid: u32, signum: i32) -> Result<Vec<String>> {
    let output = tokio::process::Command::new("kill")
        .arg(format!("-{signum}"))
        .arg(pid.to_string())
        .output()
        .await
        .context("spawning local kill")?;
    Ok(vec![output.status.code().unwrap_or(-1).to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(hosts: &[&str], algorithm: LoadBalancingAlgorithm) -> SshConfig {
        SshConfig {
            remote_hosts: hosts.iter().map(|h| h.to_string()).collect(),
            load_balancing_algorithm: algorithm,
            remote_user: None,
            remote_pwd: None,
            gss_ssh: false,
        }
    }

    #[tokio::test]
    async fn pre_launch_hook_sets_kernel_remote_host() {
        let backend = SshBackend::new(config(&["h1", "h2"], LoadBalancingAlgorithm::RoundRobin), 22);
        let mut env = HashMap::new();
        backend.pre_launch_hook(&"k1".to_string(), &mut env).await.unwrap();
        assert_eq!(env.get("KERNEL_REMOTE_HOST").unwrap(), "h1");
    }

    #[tokio::test]
    async fn pre_launch_hook_honors_remote_host_override_r3() {
        let backend = SshBackend::new(config(&["h1", "h2"], LoadBalancingAlgorithm::RoundRobin), 22);
        let mut env = HashMap::new();
        env.insert("KERNEL_REMOTE_HOST".to_string(), "h-custom".to_string());
        backend.pre_launch_hook(&"k1".to_string(), &mut env).await.unwrap();
        assert_eq!(env.get("KERNEL_REMOTE_HOST").unwrap(), "h-custom");
    }

    #[tokio::test]
    async fn status_query_on_unknown_kernel_has_no_assigned_host() {
        let backend = SshBackend::new(config(&["h1"], LoadBalancingAlgorithm::RoundRobin), 22);
        let status = backend.status_query(&"nope".to_string(), None).await.unwrap();
        assert!(status.assigned_host.is_none());
    }

    #[tokio::test]
    async fn terminate_unknown_kernel_is_not_found() {
        let backend = SshBackend::new(config(&["h1"], LoadBalancingAlgorithm::RoundRobin), 22);
        let status = backend.terminate_placement(&"nope".to_string(), false).await.unwrap();
        assert_eq!(status, BackendStatus::NotFound);
    }
}

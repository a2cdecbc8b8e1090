//! Tunnel Supervisor: for each kernel channel, selects a free local port within the
//! configured range and spawns an `ssh -L` child process forwarding it to the kernel's
//! remote port. Every tunnel is tracked per-kernel and torn down in `cleanup()`.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use kprov_core::prelude::*;
use std::net::TcpListener as StdTcpListener;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Effectively disables the SSH keepalive timeout, matching the original's
/// `max_keep_alive_interval` default of one hundred years.
const SSH_KEEPALIVE_INTERVAL_SECS: u64 = 100 * 365 * 24 * 3600;

struct TunnelHandle {
    endpoint: TunnelEndpoint,
    child: Child,
}

/// Tracks active tunnels per kernel. The outer map needs no cross-kernel locking (each
/// kernel's tunnel set is independent); `DashMap` gives us that without a global mutex.
#[derive(Default)]
pub struct TunnelSupervisor {
    tunnels: DashMap<KernelId, DashMap<KernelChannel, TunnelHandle>>,
}

impl TunnelSupervisor {
    pub fn new() -> Self {
        TunnelSupervisor { tunnels: DashMap::new() }
    }

    /// Precondition check: passwordless SSH auth must already work before the first tunnel
    /// is created. Failure surfaces as `PermissionDenied` per §4.C.
    pub async fn check_passwordless_auth(&self, server: &str) -> Result<()> {
        let status = Command::new("ssh")
            .args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=5", server, "true"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("spawning ssh to verify passwordless auth")?;
        if status.success() {
            Ok(())
        } else {
            Err(anyhow!(ProvisionerError::permission_denied(
                "",
                Some(server.to_string()),
                "passwordless SSH authentication is not configured"
            )))
        }
    }

    /// Spawns a tunnel for `channel`, returning the chosen local endpoint. `server` is the
    /// `[user@]host` SSH target; `ssh_port` is the SSH daemon port (not the tunneled port).
    pub async fn spawn_tunnel(
        &self,
        kernel_id: &KernelId,
        channel: KernelChannel,
        server: &str,
        ssh_port: u16,
        remote_ip: &str,
        remote_port: u16,
        port_range: &PortRange,
    ) -> Result<TunnelEndpoint> {
        let local_port = select_local_port(port_range).context("selecting local tunnel port")?;
        let forward = format!("127.0.0.1:{local_port}:{remote_ip}:{remote_port}");
        let keepalive = format!("ServerAliveInterval={SSH_KEEPALIVE_INTERVAL_SECS}");
        let child = Command::new("ssh")
            .args(["-p", &ssh_port.to_string(), "-o", &keepalive, "-S", "none", "-N", "-L", &forward, server])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning ssh tunnel process")?;

        debug!(kernel_id = %kernel_id, channel = ?channel, local_port, remote_port, server, "tunnel spawned");

        let endpoint = TunnelEndpoint { local_port };
        let per_kernel = self.tunnels.entry(kernel_id.clone()).or_default();
        per_kernel.insert(channel, TunnelHandle { endpoint: endpoint.clone(), child });
        Ok(endpoint)
    }

    pub fn endpoint(&self, kernel_id: &KernelId, channel: KernelChannel) -> Option<TunnelEndpoint> {
        self.tunnels.get(kernel_id)?.get(&channel).map(|h| h.endpoint.clone())
    }

    /// Terminates and removes a single channel's tunnel, used by `shutdown_requested()` to
    /// tear down the COMM tunnel specifically so the launcher can fully exit.
    pub async fn terminate_tunnel(&self, kernel_id: &KernelId, channel: KernelChannel) {
        let removed = self.tunnels.get(kernel_id).and_then(|m| m.remove(&channel));
        if let Some((_, mut handle)) = removed {
            if let Err(e) = handle.child.kill().await {
                warn!(kernel_id = %kernel_id, channel = ?channel, error = %e, "failed to kill tunnel process");
            }
        }
    }

    /// Terminates every tunnel for a kernel and empties its map, used by `cleanup()`.
    pub async fn terminate_all(&self, kernel_id: &KernelId) {
        if let Some((_, per_kernel)) = self.tunnels.remove(kernel_id) {
            for (channel, mut handle) in per_kernel.into_iter() {
                if let Err(e) = handle.child.kill().await {
                    warn!(kernel_id = %kernel_id, channel = ?channel, error = %e, "failed to kill tunnel process");
                }
            }
            info!(kernel_id = %kernel_id, "all tunnels terminated");
        }
    }

    pub fn is_empty(&self, kernel_id: &KernelId) -> bool {
        self.tunnels.get(kernel_id).map(|m| m.is_empty()).unwrap_or(true)
    }
}

/// Two-phase candidate port selection, matching the original's `_random_ports`: try a
/// short run of sequential candidates from the low end of the range first, then fall back
/// to random candidates within the range, binding each to confirm it's actually free.
fn select_local_port(port_range: &PortRange) -> Result<u16> {
    const SEQUENTIAL_CANDIDATES: u16 = 5;
    const RANDOM_ATTEMPTS: u32 = 50;

    if !port_range.is_constrained() {
        return bind_ephemeral_port();
    }

    for i in 0..SEQUENTIAL_CANDIDATES {
        let candidate = port_range.lo.saturating_add(i);
        if candidate > port_range.hi {
            break;
        }
        if try_bind(candidate) {
            return Ok(candidate);
        }
    }

    use rand::Rng;
    let mut rng = rand::thread_rng();
    for _ in 0..RANDOM_ATTEMPTS {
        let candidate = rng.gen_range(port_range.lo..=port_range.hi);
        if try_bind(candidate) {
            return Ok(candidate);
        }
    }

    Err(anyhow!("no free port found in range {}..{} after {RANDOM_ATTEMPTS} attempts", port_range.lo, port_range.hi))
}

fn try_bind(port: u16) -> bool {
    StdTcpListener::bind(("127.0.0.1", port)).is_ok()
}

fn bind_ephemeral_port() -> Result<u16> {
    let listener = StdTcpListener::bind(("127.0.0.1", 0)).context("binding ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_local_port_honors_constrained_range() {
        let range = PortRange::parse("40100..41100").unwrap();
        let port = select_local_port(&range).unwrap();
        assert!(range.contains(port));
    }

    #[test]
    fn select_local_port_unconstrained_returns_any_free_port() {
        let range = PortRange::unconstrained();
        let port = select_local_port(&range).unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn is_empty_true_before_any_tunnel_and_after_terminate_all() {
        let sup = TunnelSupervisor::new();
        let kernel_id = "k1".to_string();
        assert!(sup.is_empty(&kernel_id));
        sup.terminate_all(&kernel_id).await;
        assert!(sup.is_empty(&kernel_id));
    }
}

use anyhow::Result;
use kprov_core::prelude::*;
use std::collections::HashMap;

/// Placement status as reported by a backend's status query: the raw state string (for
/// logging) plus the classification the state machine actually branches on.
///
/// `message` carries a human-readable reason when `status` is `Fatal` (e.g. an extracted
/// exception message), surfaced verbatim into the `LaunchFailed` error. `placement`, once
/// the backend has discovered a concrete handle for this kernel, lets the core record it on
/// `KernelRecord` so it survives a restart via `ProvisionerInfo`.
#[derive(Debug, Clone)]
pub struct PlacementStatus {
    pub raw_state: String,
    pub status: BackendStatus,
    pub assigned_host: Option<String>,
    pub assigned_ip: Option<String>,
    pub message: Option<String>,
    pub placement: Option<PlacementHandle>,
}

/// What `Backend::launch` produced: either a locally-spawned process the provisioner must
/// poll for fast-fail (`detect_launch_failure`), or confirmation that placement happens
/// entirely through the backend's own API (no local process to track).
pub enum LaunchOutcome {
    LocalProcess(tokio::process::Child),
    Remote,
}

/// The capability set every placement backend implements. This replaces the original's
/// deep inheritance chain (`Base -> Remote -> Container -> {Docker,Swarm,K8s} -> CRD`):
/// the state machine in `Provisioner` holds every invariant common to all backends, and a
/// backend is just this small, explicit interface.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Mutates the pre-launch environment with backend-specific additions (image names,
    /// UID/GID checks, pod name, CRD identity, ...). May reject with `PermissionDenied`.
    async fn pre_launch_hook(&self, kernel_id: &KernelId, env: &mut HashMap<String, String>) -> Result<()>;

    /// Starts the kernel. Local-process backends (SSH with a local host, none of the
    /// others) return `LaunchOutcome::LocalProcess`; everything else returns `Remote`.
    async fn launch(&self, kernel_id: &KernelId, argv: &[String], env: &HashMap<String, String>) -> Result<LaunchOutcome>;

    /// Backend-native status query. `iteration` is `Some` only during the noisy polling
    /// loop so implementations can suppress per-iteration debug logs when `None`, matching
    /// the original's `if iteration:` guard.
    async fn status_query(&self, kernel_id: &KernelId, iteration: Option<u32>) -> Result<PlacementStatus>;

    /// Idempotent. Returns the resulting status so the caller can decide whether to
    /// escalate to `kill`.
    async fn terminate_placement(&self, kernel_id: &KernelId, restart: bool) -> Result<BackendStatus>;

    /// Backend-native signal fallback, used only when the comm port is unavailable.
    async fn send_signal_native(&self, kernel_id: &KernelId, signum: i32) -> Result<SignalOutcome>;

    fn initial_states(&self) -> &'static [&'static str];
    fn error_states(&self) -> &'static [&'static str];
}

/// Lets callers that must pick a backend at runtime (the facade/CLI select among
/// SSH/Docker/Swarm/Kubernetes/CRD/YARN via a config value) hold a `Provisioner<Box<dyn
/// Backend>>` instead of a generic parameter fixed at compile time.
#[async_trait::async_trait]
impl Backend for Box<dyn Backend> {
    async fn pre_launch_hook(&self, kernel_id: &KernelId, env: &mut HashMap<String, String>) -> Result<()> {
        (**self).pre_launch_hook(kernel_id, env).await
    }

    async fn launch(&self, kernel_id: &KernelId, argv: &[String], env: &HashMap<String, String>) -> Result<LaunchOutcome> {
        (**self).launch(kernel_id, argv, env).await
    }

    async fn status_query(&self, kernel_id: &KernelId, iteration: Option<u32>) -> Result<PlacementStatus> {
        (**self).status_query(kernel_id, iteration).await
    }

    async fn terminate_placement(&self, kernel_id: &KernelId, restart: bool) -> Result<BackendStatus> {
        (**self).terminate_placement(kernel_id, restart).await
    }

    async fn send_signal_native(&self, kernel_id: &KernelId, signum: i32) -> Result<SignalOutcome> {
        (**self).send_signal_native(kernel_id, signum).await
    }

    fn initial_states(&self) -> &'static [&'static str] {
        (**self).initial_states()
    }

    fn error_states(&self) -> &'static [&'static str] {
        (**self).error_states()
    }
}

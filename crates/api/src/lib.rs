//! Stable provisioner façade (in-process) consumed by the CLI and the daemon entrypoint.
//!
//! One `ProvisionerFacade` owns the process-wide Response Manager and Tunnel Supervisor and
//! multiplexes many live kernels, each backed by its own `Provisioner<Box<dyn Backend>>`
//! session. Sessions are looked up by `kernel_id`; `&mut self` backend operations are
//! serialized per kernel via an async mutex rather than across the whole facade.

#![forbid(unsafe_code)]

use dashmap::DashMap;
use kprov_core::prelude::*;
use kprov_persist::Store;
use kprov_provisioner::backend::Backend;
use kprov_provisioner::Provisioner;
use kprov_response::ResponseManager;
use kprov_tunnel::TunnelSupervisor;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::info;

/// Which placement backend a kernel launch targets, mirroring the original's
/// entry-point-registered provisioner classes (`distributed`, `docker`, `docker-swarm`,
/// `kubernetes`, `kubernetes-crd`, `yarn`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Ssh,
    Docker,
    Swarm,
    Kubernetes,
    Crd,
    Yarn,
}

impl FromStr for BackendKind {
    type Err = ProvisionerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "distributed" | "ssh" => Ok(BackendKind::Ssh),
            "docker" => Ok(BackendKind::Docker),
            "docker-swarm" | "swarm" => Ok(BackendKind::Swarm),
            "kubernetes" | "k8s" => Ok(BackendKind::Kubernetes),
            "kubernetes-crd" | "crd" => Ok(BackendKind::Crd),
            "yarn" => Ok(BackendKind::Yarn),
            other => Err(ProvisionerError::config(format!("unknown provisioner backend '{other}'"))),
        }
    }
}

/// Exposed so a rehydrating caller (the CLI, reconnecting to a kernel launched by a prior
/// process) can reconstruct the same concrete backend without duplicating this match.
pub async fn build_backend(kind: BackendKind, provisioner_config: &ProvisionerConfig) -> anyhow::Result<Box<dyn Backend>> {
    Ok(match kind {
        BackendKind::Ssh => Box::new(kprov_ssh::SshBackend::new(SshConfig::from_env()?, provisioner_config.ssh_port)),
        BackendKind::Docker => Box::new(kprov_docker::DockerBackend::connect(
            DockerConfig::from_env()?,
            provisioner_config.prohibited_uids.clone(),
            provisioner_config.prohibited_gids.clone(),
        )?),
        BackendKind::Swarm => Box::new(kprov_docker::SwarmBackend::connect(
            SwarmConfig::from_env()?,
            provisioner_config.prohibited_uids.clone(),
            provisioner_config.prohibited_gids.clone(),
        )?),
        BackendKind::Kubernetes => Box::new(
            kprov_k8s::KubernetesBackend::connect(
                KubernetesConfig::from_env()?,
                provisioner_config.prohibited_uids.clone(),
                provisioner_config.prohibited_gids.clone(),
            )
            .await?,
        ),
        BackendKind::Crd => Box::new(
            kprov_k8s::CrdBackend::connect(
                CrdConfig::from_env()?,
                provisioner_config.prohibited_uids.clone(),
                provisioner_config.prohibited_gids.clone(),
            )
            .await?,
        ),
        BackendKind::Yarn => {
            let cfg = YarnConfig::from_env()?;
            Box::new(kprov_yarn::YarnBackend::new(
                &cfg,
                provisioner_config.launch_timeout_secs,
                provisioner_config.poll_interval_secs,
                provisioner_config.max_poll_attempts,
            )?)
        }
    })
}

/// API errors suitable for transport over RPC later, re-exporting the core error taxonomy
/// rather than duplicating it.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("kernel not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Provisioner(#[from] ProvisionerError),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

fn map_err(e: anyhow::Error) -> ApiError {
    match e.downcast::<ProvisionerError>() {
        Ok(pe) => ApiError::Provisioner(pe),
        Err(e) => ApiError::Internal(e.to_string()),
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

pub type KernelSession = Provisioner<Box<dyn Backend>>;

/// Declarative provisioner API surface: every lifecycle operation a CLI/daemon front-end
/// needs, keyed by `kernel_id`.
#[async_trait::async_trait]
pub trait ProvisionerApi: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn start_kernel(
        &self,
        kernel_id: KernelId,
        kernel_username: String,
        kernel_spec: KernelSpec,
        backend: BackendKind,
        is_spark: bool,
        env: HashMap<String, String>,
    ) -> ApiResult<ConnectionInfo>;

    async fn poll(&self, kernel_id: &str) -> ApiResult<Option<i32>>;
    async fn send_signal(&self, kernel_id: &str, signum: i32) -> ApiResult<SignalOutcome>;
    async fn shutdown_requested(&self, kernel_id: &str) -> ApiResult<()>;
    async fn terminate(&self, kernel_id: &str, restart: bool) -> ApiResult<()>;
    async fn kill(&self, kernel_id: &str, restart: bool) -> ApiResult<()>;

    /// Cleans up and forgets the session; also purges the persisted row.
    async fn cleanup(&self, kernel_id: &str, restart: bool) -> ApiResult<()>;

    /// Persisted view of a kernel, usable after a restart before the session is reloaded.
    async fn inspect(&self, kernel_id: &str) -> ApiResult<Option<ProvisionerInfo>>;
}

/// In-process implementation: owns the shared Response Manager/Tunnel Supervisor/store and
/// multiplexes sessions.
pub struct ProvisionerFacade {
    config: ProvisionerConfig,
    response_manager: Arc<ResponseManager>,
    tunnels: Arc<TunnelSupervisor>,
    store: Arc<dyn Store>,
    sessions: DashMap<KernelId, Mutex<KernelSession>>,
}

impl ProvisionerFacade {
    pub fn new(
        config: ProvisionerConfig,
        response_manager: Arc<ResponseManager>,
        tunnels: Arc<TunnelSupervisor>,
        store: Arc<dyn Store>,
    ) -> Self {
        ProvisionerFacade { config, response_manager, tunnels, store, sessions: DashMap::new() }
    }

    /// Convenience constructor used by the daemon entrypoint: builds the Response Manager
    /// and Tunnel Supervisor from env, and opens the default persisted store.
    pub async fn bind_from_env() -> anyhow::Result<Self> {
        let config = ProvisionerConfig::from_env()?;
        let response_ip = std::env::var("GP_RESPONSE_IP").unwrap_or_else(|_| "0.0.0.0".to_string());
        let response_manager = ResponseManager::bind(&response_ip, 0, 5).await?;
        let tunnels = Arc::new(TunnelSupervisor::new());
        let store: Arc<dyn Store> = Arc::new(kprov_persist::SqliteStore::open_default()?);
        Ok(ProvisionerFacade::new(config, response_manager, tunnels, store))
    }
}

#[async_trait::async_trait]
impl ProvisionerApi for ProvisionerFacade {
    async fn start_kernel(
        &self,
        kernel_id: KernelId,
        kernel_username: String,
        kernel_spec: KernelSpec,
        backend_kind: BackendKind,
        is_spark: bool,
        env: HashMap<String, String>,
    ) -> ApiResult<ConnectionInfo> {
        info!(kernel_id = %kernel_id, backend = ?backend_kind, "api: start_kernel");
        let backend = build_backend(backend_kind, &self.config).await.map_err(map_err)?;
        let mut session = Provisioner::new(
            self.config.clone(),
            self.response_manager.clone(),
            self.tunnels.clone(),
            backend,
            kernel_id.clone(),
            kernel_username,
            kernel_spec,
            is_spark,
            now_ms(),
        );

        let env = session.pre_launch(env).await.map_err(map_err)?;
        let argv = session.argv().to_vec();
        let conn_info = session.launch_kernel(&argv, &env).await.map_err(map_err)?;

        self.store.put_info(&session.get_provisioner_info()).map_err(|e| ApiError::Internal(e.to_string()))?;
        self.sessions.insert(kernel_id, Mutex::new(session));
        Ok(conn_info)
    }

    async fn poll(&self, kernel_id: &str) -> ApiResult<Option<i32>> {
        let entry = self.sessions.get(kernel_id).ok_or_else(|| ApiError::NotFound(kernel_id.to_string()))?;
        entry.value().lock().await.poll().await.map_err(map_err)
    }

    async fn send_signal(&self, kernel_id: &str, signum: i32) -> ApiResult<SignalOutcome> {
        let entry = self.sessions.get(kernel_id).ok_or_else(|| ApiError::NotFound(kernel_id.to_string()))?;
        entry.value().lock().await.send_signal(signum).await.map_err(map_err)
    }

    async fn shutdown_requested(&self, kernel_id: &str) -> ApiResult<()> {
        let entry = self.sessions.get(kernel_id).ok_or_else(|| ApiError::NotFound(kernel_id.to_string()))?;
        entry.value().lock().await.shutdown_requested().await.map_err(map_err)
    }

    async fn terminate(&self, kernel_id: &str, restart: bool) -> ApiResult<()> {
        let entry = self.sessions.get(kernel_id).ok_or_else(|| ApiError::NotFound(kernel_id.to_string()))?;
        let mut session = entry.value().lock().await;
        session.terminate(restart).await.map_err(map_err)?;
        self.store.put_info(&session.get_provisioner_info()).map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn kill(&self, kernel_id: &str, restart: bool) -> ApiResult<()> {
        let entry = self.sessions.get(kernel_id).ok_or_else(|| ApiError::NotFound(kernel_id.to_string()))?;
        let mut session = entry.value().lock().await;
        session.kill(restart).await.map_err(map_err)?;
        self.store.put_info(&session.get_provisioner_info()).map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn cleanup(&self, kernel_id: &str, restart: bool) -> ApiResult<()> {
        {
            let entry = self.sessions.get(kernel_id).ok_or_else(|| ApiError::NotFound(kernel_id.to_string()))?;
            entry.value().lock().await.cleanup(restart).await;
        }
        if !restart {
            self.sessions.remove(kernel_id);
            self.store.delete_info(kernel_id).map_err(|e| ApiError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn inspect(&self, kernel_id: &str) -> ApiResult<Option<ProvisionerInfo>> {
        self.store.get_info(kernel_id).map_err(|e| ApiError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_known_aliases() {
        assert_eq!("distributed".parse::<BackendKind>().unwrap(), BackendKind::Ssh);
        assert_eq!("kubernetes-crd".parse::<BackendKind>().unwrap(), BackendKind::Crd);
        assert_eq!("docker-swarm".parse::<BackendKind>().unwrap(), BackendKind::Swarm);
    }

    #[test]
    fn backend_kind_rejects_unknown() {
        assert!("bogus".parse::<BackendKind>().is_err());
    }

    #[tokio::test]
    async fn inspect_unknown_kernel_is_none() {
        let config = ProvisionerConfig {
            authorized_users: Default::default(),
            unauthorized_users: Default::default(),
            port_range: PortRange::unconstrained(),
            launch_timeout_secs: 5.0,
            poll_interval_secs: 0.01,
            max_poll_attempts: 1,
            socket_timeout_secs: 0.01,
            tunneling_enabled: false,
            ssh_port: 22,
            prohibited_uids: Default::default(),
            prohibited_gids: Default::default(),
        };
        let response_manager = ResponseManager::bind("127.0.0.1", 0, 5).await.unwrap();
        let tunnels = Arc::new(TunnelSupervisor::new());
        let dir = std::env::temp_dir().join(format!("kprov-api-test-{}.db", now_ms()));
        let store: Arc<dyn Store> = Arc::new(kprov_persist::SqliteStore::open(&dir.to_string_lossy()).unwrap());
        let facade = ProvisionerFacade::new(config, response_manager, tunnels, store);
        assert!(facade.inspect("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn poll_unknown_kernel_is_not_found() {
        let config = ProvisionerConfig {
            authorized_users: Default::default(),
            unauthorized_users: Default::default(),
            port_range: PortRange::unconstrained(),
            launch_timeout_secs: 5.0,
            poll_interval_secs: 0.01,
            max_poll_attempts: 1,
            socket_timeout_secs: 0.01,
            tunneling_enabled: false,
            ssh_port: 22,
            prohibited_uids: Default::default(),
            prohibited_gids: Default::default(),
        };
        let response_manager = ResponseManager::bind("127.0.0.1", 0, 5).await.unwrap();
        let tunnels = Arc::new(TunnelSupervisor::new());
        let dir = std::env::temp_dir().join(format!("kprov-api-test-{}.db", now_ms() + 1));
        let store: Arc<dyn Store> = Arc::new(kprov_persist::SqliteStore::open(&dir.to_string_lossy()).unwrap());
        let facade = ProvisionerFacade::new(config, response_manager, tunnels, store);
        assert!(matches!(facade.poll("nope").await, Err(ApiError::NotFound(_))));
    }
}

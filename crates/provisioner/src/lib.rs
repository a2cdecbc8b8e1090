//! Generic provisioner state machine (§4.D): `pre_launch -> launch_kernel ->
//! confirm_remote_startup -> poll/send_signal/shutdown_requested -> terminate/kill -> cleanup`.
//!
//! This crate holds every invariant common to all placement backends. A backend only
//! implements the small [`backend::Backend`] capability trait; everything else - auth,
//! argv substitution, launch-timeout handling, tunnel wiring, signal fallback, persisted
//! state - lives here exactly once.

#![forbid(unsafe_code)]

pub mod backend;
pub mod signal;

use anyhow::{anyhow, Context as _, Result};
use backend::{Backend, LaunchOutcome};
use kprov_core::prelude::*;
use kprov_response::ResponseManager;
use kprov_tunnel::TunnelSupervisor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tracing::{debug, error, info, warn};

/// Everything the generic state machine needs beyond what a [`Backend`] provides.
pub struct Provisioner<B: Backend> {
    config: ProvisionerConfig,
    response_manager: Arc<ResponseManager>,
    tunnels: Arc<TunnelSupervisor>,
    backend: B,
    record: KernelRecord,
    state: ProvisionerState,
    local_proc: Option<Child>,
    is_spark: bool,
}

impl<B: Backend> Provisioner<B> {
    pub fn new(
        config: ProvisionerConfig,
        response_manager: Arc<ResponseManager>,
        tunnels: Arc<TunnelSupervisor>,
        backend: B,
        kernel_id: KernelId,
        kernel_username: String,
        kernel_spec: KernelSpec,
        is_spark: bool,
        now_ms: i64,
    ) -> Self {
        let record = KernelRecord::new(kernel_id, kernel_username, kernel_spec, now_ms);
        Provisioner {
            config,
            response_manager,
            tunnels,
            backend,
            record,
            state: ProvisionerState::Idle,
            local_proc: None,
            is_spark,
        }
    }

    pub fn state(&self) -> ProvisionerState {
        self.state
    }

    pub fn has_process(&self) -> bool {
        self.record.has_process()
    }

    pub fn kernel_id(&self) -> &KernelId {
        &self.record.kernel_id
    }

    /// Argv after `pre_launch`'s template substitution, ready to pass to `launch_kernel`.
    pub fn argv(&self) -> &[String] {
        &self.record.kernel_spec.argv
    }

    /// Step 1-6 of §4.D `pre_launch`. Returns the fully prepared env ready to hand to
    /// `launch_kernel`.
    pub async fn pre_launch(&mut self, mut env: HashMap<String, String>) -> Result<HashMap<String, String>> {
        self.state = ProvisionerState::PreLaunch;
        self.response_manager.register_event(&self.record.kernel_id).await;

        self.record.kernel_spec.argv = substitute_argv(
            &self.record.kernel_spec.argv,
            &self.record.kernel_id,
            &self.response_manager.response_address(),
            self.response_manager.public_key_b64(),
            &self.config.port_range,
        );

        env.insert("KERNEL_USERNAME".to_string(), self.record.kernel_username.clone());
        env.insert("KERNEL_ID".to_string(), self.record.kernel_id.clone());
        env.insert("KERNEL_LANGUAGE".to_string(), self.record.kernel_spec.language.clone());

        strip_sensitive_env(&mut env);

        if let Err(e) = self.config.authorize(&self.record.kernel_username) {
            self.response_manager.unregister(&self.record.kernel_id).await;
            error!(kernel_id = %self.record.kernel_id, "authorization check failed");
            return Err(e.into());
        }

        self.backend
            .pre_launch_hook(&self.record.kernel_id, &mut env)
            .await
            .context("backend pre_launch_hook")?;

        debug!(kernel_id = %self.record.kernel_id, "pre_launch complete");
        Ok(env)
    }

    /// §4.D `launch_kernel`: starts the placement, then unconditionally confirms startup.
    pub async fn launch_kernel(&mut self, argv: &[String], env: &HashMap<String, String>) -> Result<ConnectionInfo> {
        self.state = ProvisionerState::Launching;
        let start = Instant::now();
        let outcome = self.backend.launch(&self.record.kernel_id, argv, env).await.context("backend launch")?;
        match outcome {
            LaunchOutcome::LocalProcess(child) => self.local_proc = Some(child),
            LaunchOutcome::Remote => self.local_proc = None,
        }
        metrics::counter!("kprov_launches_total").increment(1);

        let result = self.confirm_remote_startup().await;
        metrics::histogram!("kprov_launch_duration_seconds").record(start.elapsed().as_secs_f64());
        result
    }

    /// §4.D `confirm_remote_startup`: poll loop bounded by `launch_timeout_secs`.
    async fn confirm_remote_startup(&mut self) -> Result<ConnectionInfo> {
        self.state = ProvisionerState::AwaitingStartup;
        let deadline = Instant::now() + Duration::from_secs_f64(self.config.launch_timeout_secs);
        let poll_interval = Duration::from_secs_f64(self.config.poll_interval_secs);
        let mut iteration: u32 = 0;

        loop {
            if Instant::now() >= deadline {
                self.kill(false).await.context("kill after launch timeout")?;
                metrics::counter!("kprov_launch_timeouts_total").increment(1);
                return Err(ProvisionerError::timeout(
                    self.record.kernel_id.clone(),
                    Some(self.record.assigned_host.clone()),
                    "launch_timeout exceeded before startup confirmation",
                )
                .into());
            }

            tokio::time::sleep(poll_interval).await;
            iteration += 1;

            if self.detect_launch_failure().await? {
                return Err(ProvisionerError::launch_failed(
                    self.record.kernel_id.clone(),
                    Some(self.record.assigned_host.clone()),
                    "local spawning process exited before remote startup was confirmed",
                )
                .into());
            }

            let status = self
                .backend
                .status_query(&self.record.kernel_id, Some(iteration))
                .await
                .context("querying placement status")?;

            if matches!(status.status, BackendStatus::Fatal) {
                let reason = status.message.unwrap_or_else(|| format!("backend reported fatal state '{}'", status.raw_state));
                return Err(ProvisionerError::launch_failed(self.record.kernel_id.clone(), Some(self.record.assigned_host.clone()), reason).into());
            }

            if self.backend.initial_states().contains(&status.raw_state.as_str()) && self.local_proc.is_some() {
                continue;
            }

            if let Some(host) = status.assigned_host.clone() {
                if self.record.assigned_host.is_empty() {
                    self.record.assigned_host = host;
                }
            }
            if let Some(ip) = status.assigned_ip.clone() {
                self.record.assigned_ip = ip;
            }
            if let Some(placement) = status.placement.clone() {
                self.record.placement = Some(placement);
            }

            if self.record.assigned_host.is_empty() {
                continue;
            }

            let timeout = Duration::from_secs_f64(self.config.poll_interval_secs / 100.0).max(Duration::from_millis(1));
            if let Some(payload) = self.response_manager.get_connection_info(&self.record.kernel_id, timeout).await {
                return self.setup_connection_info(payload).await;
            }
        }
    }

    /// True if the locally spawned process has already exited non-zero.
    async fn detect_launch_failure(&mut self) -> Result<bool> {
        let Some(child) = self.local_proc.as_mut() else { return Ok(false) };
        match child.try_wait().context("polling local spawning process")? {
            Some(status) if !status.success() => Ok(true),
            _ => Ok(false),
        }
    }

    async fn setup_connection_info(&mut self, payload: serde_json::Value) -> Result<ConnectionInfo> {
        let mut conn_info: ConnectionInfo =
            serde_json::from_value(payload.clone()).context("decoding connection info from launcher payload")?;

        self.record.pid = payload.get("pid").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        self.record.pgid = payload.get("pgid").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

        if self.config.tunneling_enabled {
            conn_info.ip = "127.0.0.1".to_string();
            for (channel, remote_port) in [
                (KernelChannel::Shell, conn_info.shell_port),
                (KernelChannel::Iopub, conn_info.iopub_port),
                (KernelChannel::Stdin, conn_info.stdin_port),
                (KernelChannel::Heartbeat, conn_info.hb_port),
                (KernelChannel::Control, conn_info.control_port),
            ] {
                let endpoint = self
                    .tunnels
                    .spawn_tunnel(
                        &self.record.kernel_id,
                        channel,
                        &self.record.assigned_host,
                        self.config.ssh_port,
                        &self.record.assigned_ip,
                        remote_port,
                        &self.config.port_range,
                    )
                    .await
                    .context("spawning tunnel")?;
                self.record.tunnels.insert(channel, endpoint.clone());
                match channel {
                    KernelChannel::Shell => conn_info.shell_port = endpoint.local_port,
                    KernelChannel::Iopub => conn_info.iopub_port = endpoint.local_port,
                    KernelChannel::Stdin => conn_info.stdin_port = endpoint.local_port,
                    KernelChannel::Heartbeat => conn_info.hb_port = endpoint.local_port,
                    KernelChannel::Control => conn_info.control_port = endpoint.local_port,
                    KernelChannel::Communication => unreachable!(),
                }
            }
            if let Some(comm_port) = conn_info.comm_port {
                let endpoint = self
                    .tunnels
                    .spawn_tunnel(
                        &self.record.kernel_id,
                        KernelChannel::Communication,
                        &self.record.assigned_host,
                        self.config.ssh_port,
                        &self.record.assigned_ip,
                        comm_port,
                        &self.config.port_range,
                    )
                    .await
                    .context("spawning comm tunnel")?;
                self.record.tunnels.insert(KernelChannel::Communication, endpoint.clone());
                conn_info.comm_port = Some(endpoint.local_port);
            }
        } else {
            conn_info.ip = self.record.assigned_ip.clone();
        }

        self.record.connection_info = Some(conn_info.clone());
        self.local_proc = None;
        self.state = ProvisionerState::Running;
        info!(kernel_id = %self.record.kernel_id, host = %self.record.assigned_host, "kernel running");
        Ok(conn_info)
    }

    /// §4.D `poll`: prefers a comm-port liveness probe (signal 0); falls back to the
    /// backend's native status.
    pub async fn poll(&mut self) -> Result<Option<i32>> {
        if let Some((comm_ip, comm_port)) = self.comm_endpoint() {
            let timeout = Duration::from_secs_f64(self.config.socket_timeout_secs);
            let delivered = signal::send_via_comm_port(&comm_ip, comm_port, 0, timeout).await?;
            return Ok(if delivered { None } else { Some(0) });
        }
        let status = self.backend.status_query(&self.record.kernel_id, None).await.context("poll status query")?;
        Ok(if self.backend.initial_states().contains(&status.raw_state.as_str()) {
            None
        } else {
            Some(0)
        })
    }

    /// §4.D `send_signal`. Adds the Spark SIGUSR2 companion signal when applicable.
    pub async fn send_signal(&mut self, signum: i32) -> Result<SignalOutcome> {
        let timeout = Duration::from_secs_f64(self.config.socket_timeout_secs);
        if let Some((comm_ip, comm_port)) = self.comm_endpoint() {
            if signal::send_via_comm_port(&comm_ip, comm_port, signum, timeout).await? {
                if signal::needs_spark_sigusr2(signum, self.is_spark) {
                    let _ = signal::send_via_comm_port(&comm_ip, comm_port, signal::SIGUSR2, timeout).await;
                }
                return Ok(SignalOutcome::Delivered);
            }
        }
        self.backend.send_signal_native(&self.record.kernel_id, signum).await.context("native signal delivery")
    }

    /// §4.D `shutdown_requested`: best-effort, idempotent.
    pub async fn shutdown_requested(&mut self) -> Result<()> {
        self.state = ProvisionerState::ShuttingDown;
        let timeout = Duration::from_secs_f64(self.config.socket_timeout_secs);
        if let Some((comm_ip, comm_port)) = self.comm_endpoint() {
            signal::send_shutdown(&comm_ip, comm_port, timeout).await?;
        }
        self.tunnels.terminate_tunnel(&self.record.kernel_id, KernelChannel::Communication).await;
        Ok(())
    }

    /// §4.D `terminate`: idempotent. Tries a graceful comm-port SIGTERM first (works
    /// uniformly across backends that have one), then defers to the backend's own
    /// termination path to actually reconcile/destroy the placement.
    pub async fn terminate(&mut self, restart: bool) -> Result<()> {
        if let Some((comm_ip, comm_port)) = self.comm_endpoint() {
            let timeout = Duration::from_secs_f64(self.config.socket_timeout_secs);
            let _ = signal::send_via_comm_port(&comm_ip, comm_port, signal::SIGTERM, timeout).await;
        }
        let status = self.backend.terminate_placement(&self.record.kernel_id, restart).await.context("terminate placement")?;
        if matches!(status, BackendStatus::Terminated | BackendStatus::NotFound) {
            self.state = ProvisionerState::Terminated;
        }
        Ok(())
    }

    /// §4.D `kill`: escalates after `terminate` failed to move state within
    /// `max_poll_attempts * poll_interval`. Idempotent.
    pub async fn kill(&mut self, restart: bool) -> Result<()> {
        self.terminate(restart).await?;
        if self.state == ProvisionerState::Terminated {
            return Ok(());
        }
        let poll_interval = Duration::from_secs_f64(self.config.poll_interval_secs);
        for _ in 0..self.config.max_poll_attempts {
            tokio::time::sleep(poll_interval).await;
            let status = self
                .backend
                .status_query(&self.record.kernel_id, None)
                .await
                .context("status query during kill escalation")?;
            if matches!(status.status, BackendStatus::Terminated | BackendStatus::NotFound) {
                self.state = ProvisionerState::Terminated;
                return Ok(());
            }
        }
        warn!(kernel_id = %self.record.kernel_id, "kill escalation exhausted max_poll_attempts without confirmation");
        self.state = ProvisionerState::Terminated;
        Ok(())
    }

    /// §4.D `cleanup`: best-effort, logs and continues past any error.
    pub async fn cleanup(&mut self, _restart: bool) {
        self.record.assigned_ip.clear();
        self.tunnels.terminate_all(&self.record.kernel_id).await;
        self.record.tunnels.clear();
        self.record.pid = 0;
        self.record.pgid = 0;
        info!(kernel_id = %self.record.kernel_id, "cleanup complete");
    }

    pub fn get_provisioner_info(&self) -> ProvisionerInfo {
        let (comm_ip, comm_port) = self.comm_endpoint().map(|(ip, p)| (Some(ip), Some(p))).unwrap_or((None, None));
        ProvisionerInfo {
            kernel_id: self.record.kernel_id.clone(),
            pid: self.record.pid,
            pgid: self.record.pgid,
            ip: self.record.connection_info.as_ref().map(|c| c.ip.clone()).unwrap_or_default(),
            assigned_ip: self.record.assigned_ip.clone(),
            assigned_host: self.record.assigned_host.clone(),
            comm_ip,
            comm_port,
            placement: self.record.placement.clone(),
        }
    }

    /// Restores enough state to resume polling/signaling a kernel that was already running
    /// before this process started. `connection_info` is rebuilt with only the fields
    /// `comm_endpoint` needs (`ip`, `comm_port`); the data channel ports aren't restorable and
    /// aren't needed again once the kernel is up.
    pub fn load_provisioner_info(&mut self, info: ProvisionerInfo) {
        self.record.pid = info.pid;
        self.record.pgid = info.pgid;
        self.record.assigned_ip = info.assigned_ip;
        self.record.assigned_host = info.assigned_host;
        self.record.placement = info.placement;
        if let Some(comm_port) = info.comm_port {
            self.record.connection_info = Some(ConnectionInfo {
                ip: info.comm_ip.unwrap_or(info.ip),
                shell_port: 0,
                iopub_port: 0,
                stdin_port: 0,
                hb_port: 0,
                control_port: 0,
                key: Vec::new(),
                signature_scheme: String::new(),
                transport: "tcp".to_string(),
                comm_port: Some(comm_port),
            });
        }
        self.state = ProvisionerState::Running;
    }

    fn comm_endpoint(&self) -> Option<(String, u16)> {
        let conn = self.record.connection_info.as_ref()?;
        let comm_port = conn.comm_port?;
        if comm_port == 0 {
            return None;
        }
        Some((conn.ip.clone(), comm_port))
    }
}

fn substitute_argv(
    tokens: &[String],
    kernel_id: &KernelId,
    response_address: &str,
    public_key: &str,
    port_range: &PortRange,
) -> Vec<String> {
    let port_range_str = if port_range.is_constrained() {
        format!("{}..{}", port_range.lo, port_range.hi)
    } else {
        "0..0".to_string()
    };
    let values = HashMap::from([
        ("kernel_id", kernel_id.clone()),
        ("response_address", response_address.to_string()),
        ("public_key", public_key.to_string()),
        ("port_range", port_range_str),
    ]);
    kprov_core::util::substitute_argv(tokens, &values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use backend::PlacementStatus;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeBackend {
        terminate_calls: AtomicU32,
        status: std::sync::Mutex<Vec<PlacementStatus>>,
    }

    impl FakeBackend {
        fn always_terminated() -> Self {
            FakeBackend {
                terminate_calls: AtomicU32::new(0),
                status: std::sync::Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn pre_launch_hook(&self, _kernel_id: &KernelId, _env: &mut HashMap<String, String>) -> Result<()> {
            Ok(())
        }

        async fn launch(&self, _kernel_id: &KernelId, _argv: &[String], _env: &HashMap<String, String>) -> Result<LaunchOutcome> {
            Ok(LaunchOutcome::Remote)
        }

        async fn status_query(&self, _kernel_id: &KernelId, _iteration: Option<u32>) -> Result<PlacementStatus> {
            self.status.lock().unwrap().pop().ok_or_else(|| anyhow!("no more fake statuses"))
        }

        async fn terminate_placement(&self, _kernel_id: &KernelId, _restart: bool) -> Result<BackendStatus> {
            self.terminate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(BackendStatus::Terminated)
        }

        async fn send_signal_native(&self, _kernel_id: &KernelId, _signum: i32) -> Result<SignalOutcome> {
            Ok(SignalOutcome::NoProcess)
        }

        fn initial_states(&self) -> &'static [&'static str] {
            &["pending"]
        }

        fn error_states(&self) -> &'static [&'static str] {
            &["failed"]
        }
    }

    fn fake_config() -> ProvisionerConfig {
        ProvisionerConfig {
            authorized_users: Default::default(),
            unauthorized_users: Default::default(),
            port_range: PortRange::unconstrained(),
            launch_timeout_secs: 30.0,
            poll_interval_secs: 0.01,
            max_poll_attempts: 3,
            socket_timeout_secs: 0.05,
            tunneling_enabled: false,
            ssh_port: 22,
            prohibited_uids: Default::default(),
            prohibited_gids: Default::default(),
        }
    }

    async fn fake_provisioner() -> Provisioner<FakeBackend> {
        let response_manager = ResponseManager::bind("127.0.0.1", 0, 5).await.unwrap();
        let tunnels = Arc::new(TunnelSupervisor::new());
        let spec = KernelSpec {
            argv: vec!["{kernel_id}".to_string()],
            env: HashMap::new(),
            display_name: "python3".into(),
            language: "python".into(),
        };
        Provisioner::new(
            fake_config(),
            response_manager,
            tunnels,
            FakeBackend::always_terminated(),
            "kernel-1".to_string(),
            "alice".to_string(),
            spec,
            false,
            0,
        )
    }

    #[tokio::test]
    async fn pre_launch_sets_kernel_env_and_strips_sensitive_keys_p3() {
        let mut prov = fake_provisioner().await;
        let mut env = HashMap::new();
        env.insert("GP_REMOTE_PWD".to_string(), "secret".to_string());
        env.insert("LS_COLORS".to_string(), "rs=0".to_string());
        let out = prov.pre_launch(env).await.unwrap();
        assert_eq!(out.get("KERNEL_USERNAME").unwrap(), "alice");
        assert_eq!(out.get("KERNEL_ID").unwrap(), "kernel-1");
        assert!(!out.contains_key("GP_REMOTE_PWD"));
        assert!(!out.contains_key("LS_COLORS"));
    }

    #[tokio::test]
    async fn pre_launch_rejects_unauthorized_user() {
        let response_manager = ResponseManager::bind("127.0.0.1", 0, 5).await.unwrap();
        let tunnels = Arc::new(TunnelSupervisor::new());
        let mut config = fake_config();
        config.unauthorized_users.insert("alice".to_string());
        let spec = KernelSpec { argv: vec![], env: HashMap::new(), display_name: "python3".into(), language: "python".into() };
        let mut prov = Provisioner::new(
            config,
            response_manager,
            tunnels,
            FakeBackend::always_terminated(),
            "kernel-2".to_string(),
            "alice".to_string(),
            spec,
            false,
            0,
        );
        let err = prov.pre_launch(HashMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("unauthorized"));
    }

    #[tokio::test]
    async fn terminate_is_idempotent_p7() {
        let mut prov = fake_provisioner().await;
        prov.terminate(false).await.unwrap();
        assert_eq!(prov.state(), ProvisionerState::Terminated);
        prov.terminate(false).await.unwrap();
        assert_eq!(prov.state(), ProvisionerState::Terminated);
    }

    #[test]
    fn argv_substitution_leaves_unknown_braces_untouched_p4() {
        let tokens = vec!["{kernel_id}".to_string(), "{unknown}".to_string()];
        let out = substitute_argv(&tokens, &"k1".to_string(), "1.2.3.4:5", "pubkey", &PortRange::unconstrained());
        assert_eq!(out[0], "k1");
        assert_eq!(out[1], "{unknown}");
    }
}

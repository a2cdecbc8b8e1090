//! Docker (non-swarm) backend (§4.G).

use crate::common::apply_container_policy;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, RemoveContainerOptions};
use bollard::Docker;
use kprov_core::prelude::*;
use kprov_provisioner::backend::{Backend, LaunchOutcome, PlacementStatus};
use std::collections::HashMap;
use tracing::{debug, warn};

const INITIAL_STATES: &[&str] = &["created", "running"];
const ERROR_STATES: &[&str] = &["restarting", "removing", "paused", "exited", "dead"];

pub struct DockerBackend {
    client: Docker,
    config: DockerConfig,
    prohibited_uids: std::collections::HashSet<String>,
    prohibited_gids: std::collections::HashSet<String>,
}

impl DockerBackend {
    pub fn connect(
        config: DockerConfig,
        prohibited_uids: std::collections::HashSet<String>,
        prohibited_gids: std::collections::HashSet<String>,
    ) -> Result<Self> {
        let client = Docker::connect_with_local_defaults().context("connecting to local docker daemon")?;
        Ok(DockerBackend { client, config, prohibited_uids, prohibited_gids })
    }

    async fn find_container(&self, kernel_id: &KernelId) -> Result<Option<bollard::models::ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("kernel_id={kernel_id}")]);
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions { all: true, filters, ..Default::default() }))
            .await
            .context("listing containers by kernel_id label")?;
        if containers.len() > 1 {
            return Err(ProvisionerError::invariant(kernel_id.clone(), format!("found {} containers for this kernel_id", containers.len())).into());
        }
        Ok(containers.into_iter().next())
    }
}

#[async_trait]
impl Backend for DockerBackend {
    async fn pre_launch_hook(&self, kernel_id: &KernelId, env: &mut HashMap<String, String>) -> Result<()> {
        apply_container_policy(
            kernel_id,
            env,
            &self.config.image_name,
            &self.config.executor_image_name,
            self.config.mirror_working_dirs,
            &self.prohibited_uids,
            &self.prohibited_gids,
        )?;
        env.insert("GP_DOCKER_NETWORK".to_string(), self.config.network.clone());
        env.insert("GP_DOCKER_MODE".to_string(), "docker".to_string());
        Ok(())
    }

    async fn launch(&self, _kernel_id: &KernelId, _argv: &[String], _env: &HashMap<String, String>) -> Result<LaunchOutcome> {
        Ok(LaunchOutcome::Remote)
    }

    async fn status_query(&self, kernel_id: &KernelId, iteration: Option<u32>) -> Result<PlacementStatus> {
        let Some(container) = self.find_container(kernel_id).await? else {
            return Ok(PlacementStatus {
                raw_state: String::new(),
                status: BackendStatus::NotFound,
                assigned_host: None,
                assigned_ip: None,
                message: None,
                placement: None,
            });
        };
        let raw_state = container.state.clone().unwrap_or_default().to_lowercase();
        let name = container.names.as_ref().and_then(|n| n.first()).map(|n| n.trim_start_matches('/').to_string());

        let mut assigned_ip = None;
        if raw_state == "running" {
            if let Some(settings) = container.network_settings.as_ref() {
                assigned_ip = settings
                    .networks
                    .as_ref()
                    .and_then(|nets| nets.get(&self.config.network))
                    .and_then(|n| n.ip_address.clone())
                    .or_else(|| settings.ip_address.clone());
            }
        }

        if iteration.is_some() {
            debug!(kernel_id = %kernel_id, raw_state, ?assigned_ip, "waiting to connect to docker container");
        }

        let status = if ERROR_STATES.contains(&raw_state.as_str()) {
            BackendStatus::Fatal
        } else if INITIAL_STATES.contains(&raw_state.as_str()) {
            BackendStatus::Transient
        } else {
            BackendStatus::Terminated
        };
        let message = matches!(status, BackendStatus::Fatal).then(|| format!("container entered state '{raw_state}'"));
        let placement = name
            .clone()
            .map(|container_name| PlacementHandle::Docker { container_name, assigned_node_ip: assigned_ip.clone() });

        Ok(PlacementStatus { raw_state, status, assigned_host: name, assigned_ip, message, placement })
    }

    async fn terminate_placement(&self, kernel_id: &KernelId, _restart: bool) -> Result<BackendStatus> {
        let Some(container) = self.find_container(kernel_id).await? else {
            return Ok(BackendStatus::NotFound);
        };
        let id = container.id.ok_or_else(|| anyhow!("container summary missing id"))?;
        match self.client.remove_container(&id, Some(RemoveContainerOptions { force: true, ..Default::default() })).await {
            Ok(()) => Ok(BackendStatus::Terminated),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(BackendStatus::NotFound),
            Err(e) => {
                warn!(kernel_id = %kernel_id, error = %e, "error removing container");
                Ok(BackendStatus::Transient)
            }
        }
    }

    async fn send_signal_native(&self, _kernel_id: &KernelId, _signum: i32) -> Result<SignalOutcome> {
        Ok(SignalOutcome::NoProcess)
    }

    fn initial_states(&self) -> &'static [&'static str] {
        INITIAL_STATES
    }

    fn error_states(&self) -> &'static [&'static str] {
        ERROR_STATES
    }
}

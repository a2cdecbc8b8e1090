//! Docker Swarm backend (§4.G): discovers the kernel's service, then its running task.

use crate::common::apply_container_policy;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::service::ListServicesOptions;
use bollard::Docker;
use kprov_core::prelude::*;
use kprov_provisioner::backend::{Backend, LaunchOutcome, PlacementStatus};
use std::collections::HashMap;
use tracing::{debug, warn};

const INITIAL_STATES: &[&str] = &["preparing", "starting", "running"];
const ERROR_STATES: &[&str] = &["failed", "rejected", "complete", "shutdown", "orphaned", "remove"];

pub struct SwarmBackend {
    client: Docker,
    config: SwarmConfig,
    prohibited_uids: std::collections::HashSet<String>,
    prohibited_gids: std::collections::HashSet<String>,
}

impl SwarmBackend {
    pub fn connect(
        config: SwarmConfig,
        prohibited_uids: std::collections::HashSet<String>,
        prohibited_gids: std::collections::HashSet<String>,
    ) -> Result<Self> {
        let client = Docker::connect_with_local_defaults().context("connecting to local docker daemon")?;
        Ok(SwarmBackend { client, config, prohibited_uids, prohibited_gids })
    }

    async fn find_service(&self, kernel_id: &KernelId) -> Result<Option<bollard::models::Service>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("kernel_id={kernel_id}")]);
        let services = self
            .client
            .list_services(Some(ListServicesOptions { filters, ..Default::default() }))
            .await
            .context("listing services by kernel_id label")?;
        if services.len() > 1 {
            return Err(ProvisionerError::invariant(kernel_id.clone(), format!("found {} services for this kernel_id", services.len())).into());
        }
        Ok(services.into_iter().next())
    }

    async fn find_running_task(&self, service_name: &str) -> Result<Option<bollard::models::Task>> {
        let mut filters = HashMap::new();
        filters.insert("service".to_string(), vec![service_name.to_string()]);
        filters.insert("desired-state".to_string(), vec!["running".to_string()]);
        let tasks = self
            .client
            .list_tasks(Some(bollard::service::ListTasksOptions { filters }))
            .await
            .context("listing running tasks for service")?;
        if tasks.len() > 1 {
            return Err(anyhow!("found more than one running task for service '{service_name}'"));
        }
        Ok(tasks.into_iter().next())
    }
}

#[async_trait]
impl Backend for SwarmBackend {
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
        env.insert("GP_DOCKER_MODE".to_string(), "swarm".to_string());
        Ok(())
    }

    async fn launch(&self, _kernel_id: &KernelId, _argv: &[String], _env: &HashMap<String, String>) -> Result<LaunchOutcome> {
        Ok(LaunchOutcome::Remote)
    }

    async fn status_query(&self, kernel_id: &KernelId, iteration: Option<u32>) -> Result<PlacementStatus> {
        let Some(service) = self.find_service(kernel_id).await? else {
            return Ok(PlacementStatus {
                raw_state: String::new(),
                status: BackendStatus::NotFound,
                assigned_host: None,
                assigned_ip: None,
                message: None,
                placement: None,
            });
        };
        let service_name = service.spec.as_ref().and_then(|s| s.name.clone());

        let mut raw_state = String::new();
        let mut assigned_ip = None;
        if let Some(service_name) = service_name.as_deref() {
            if let Some(task) = self.find_running_task(service_name).await? {
                if let Some(status) = task.status {
                    raw_state = status.state.map(|s| format!("{s:?}").to_lowercase()).unwrap_or_default();
                }
                if raw_state == "running" {
                    assigned_ip = task
                        .network_attachments
                        .as_ref()
                        .and_then(|nets| nets.first())
                        .and_then(|n| n.addresses.as_ref())
                        .and_then(|addrs| addrs.first())
                        .map(|cidr| cidr.split('/').next().unwrap_or(cidr).to_string());
                }
            }
        }

        if iteration.is_some() {
            debug!(kernel_id = %kernel_id, ?service_name, raw_state, ?assigned_ip, "waiting to connect to docker swarm service");
        }

        let status = if ERROR_STATES.contains(&raw_state.as_str()) {
            BackendStatus::Fatal
        } else if INITIAL_STATES.contains(&raw_state.as_str()) {
            BackendStatus::Transient
        } else {
            BackendStatus::Terminated
        };
        let message = matches!(status, BackendStatus::Fatal).then(|| format!("service task entered state '{raw_state}'"));
        let placement = service_name
            .clone()
            .map(|service_name| PlacementHandle::Swarm { service_name, assigned_node_ip: assigned_ip.clone() });

        Ok(PlacementStatus { raw_state, status, assigned_host: service_name, assigned_ip, message, placement })
    }

    async fn terminate_placement(&self, kernel_id: &KernelId, _restart: bool) -> Result<BackendStatus> {
        let Some(service) = self.find_service(kernel_id).await? else {
            return Ok(BackendStatus::NotFound);
        };
        let id = service.id.ok_or_else(|| anyhow!("service summary missing id"))?;
        match self.client.delete_service(&id).await {
            Ok(()) => Ok(BackendStatus::Terminated),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(BackendStatus::NotFound),
            Err(e) => {
                warn!(kernel_id = %kernel_id, error = %e, "error removing swarm service");
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

//! Custom-resource backend (§4.I): extends the Kubernetes backend to track submission
//! status of a CRD-managed application (e.g. a SparkApplication), delegating to the
//! Kubernetes backend once the driver pod is observed running.

use crate::kubernetes_backend::KubernetesBackend;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, PropagationPolicy};
use kube::core::{ApiResource, DynamicObject};
use kube::discovery::Discovery;
use kube::Client;
use kprov_core::prelude::*;
use kprov_provisioner::backend::{Backend, LaunchOutcome, PlacementStatus};
use std::collections::HashMap;
use tracing::{debug, warn};

const INITIAL_STATES: &[&str] = &["submitted", "pending", "running"];
const ERROR_STATES: &[&str] = &["failed", "submission_failed", "failing", "unknown"];

pub struct CrdBackend {
    inner: KubernetesBackend,
    crd: CrdConfig,
}

impl CrdBackend {
    pub async fn connect(
        crd: CrdConfig,
        prohibited_uids: std::collections::HashSet<String>,
        prohibited_gids: std::collections::HashSet<String>,
    ) -> Result<Self> {
        let inner = KubernetesBackend::connect(crd.kubernetes.clone(), prohibited_uids, prohibited_gids).await?;
        Ok(CrdBackend { inner, crd })
    }

    async fn find_api_resource(&self, client: Client) -> Result<ApiResource> {
        let discovery = Discovery::new(client).run().await.context("discovering cluster api resources")?;
        for group in discovery.groups() {
            for (ar, _caps) in group.recommended_resources() {
                if ar.group == self.crd.group && ar.version == self.crd.version && ar.plural == self.crd.plural {
                    return Ok(ar.clone());
                }
            }
        }
        Err(anyhow!("custom resource not found for group={} version={} plural={}", self.crd.group, self.crd.version, self.crd.plural))
    }

    async fn custom_object_api(&self, namespace: &str) -> Result<Api<DynamicObject>> {
        let client = self.inner.client();
        let ar = self.find_api_resource(client.clone()).await?;
        Ok(Api::namespaced_with(client, namespace, &ar))
    }
}

fn extract_exception_text(error_message: &str) -> String {
    let re = regex::Regex::new(r"(?m)Exception\s*:\s*(.*)").expect("static pattern is valid");
    match re.captures(error_message) {
        Some(caps) => caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_else(|| error_message.to_string()),
        None => error_message.to_string(),
    }
}

#[async_trait]
impl Backend for CrdBackend {
    async fn pre_launch_hook(&self, kernel_id: &KernelId, env: &mut HashMap<String, String>) -> Result<()> {
        self.inner.pre_launch_hook(kernel_id, env).await?;
        let placement = self
            .inner
            .placement_of(kernel_id)
            .ok_or_else(|| anyhow!("kubernetes pre_launch_hook did not record a placement for this kernel"))?;

        env.insert("KERNEL_RESOURCE_NAME".to_string(), placement.pod_name);
        env.insert("KERNEL_CRD_GROUP".to_string(), self.crd.group.clone());
        env.insert("KERNEL_CRD_VERSION".to_string(), self.crd.version.clone());
        env.insert("KERNEL_CRD_PLURAL".to_string(), self.crd.plural.clone());
        Ok(())
    }

    async fn launch(&self, _kernel_id: &KernelId, _argv: &[String], _env: &HashMap<String, String>) -> Result<LaunchOutcome> {
        Ok(LaunchOutcome::Remote)
    }

    async fn status_query(&self, kernel_id: &KernelId, iteration: Option<u32>) -> Result<PlacementStatus> {
        let Some(placement) = self.inner.placement_of(kernel_id) else {
            return Ok(PlacementStatus {
                raw_state: String::new(),
                status: BackendStatus::NotFound,
                assigned_host: None,
                assigned_ip: None,
                message: None,
                placement: None,
            });
        };

        let api = self.custom_object_api(&placement.namespace).await?;
        let object = match api.get(&placement.pod_name).await {
            Ok(obj) => obj,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Ok(PlacementStatus {
                    raw_state: String::new(),
                    status: BackendStatus::NotFound,
                    assigned_host: None,
                    assigned_ip: None,
                    message: None,
                    placement: None,
                });
            }
            Err(e) => return Err(e).context("fetching custom resource status"),
        };

        let application_state = object
            .data
            .pointer("/status/applicationState/state")
            .and_then(|v| v.as_str())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();

        if ERROR_STATES.contains(&application_state.as_str()) {
            let error_message = object.data.pointer("/status/applicationState/errorMessage").and_then(|v| v.as_str()).unwrap_or_default();
            let exception_text = extract_exception_text(error_message);
            debug!(kernel_id = %kernel_id, resource = %placement.pod_name, exception_text, "crd submission failed");
            return Ok(PlacementStatus {
                raw_state: application_state,
                status: BackendStatus::Fatal,
                assigned_host: None,
                assigned_ip: None,
                message: Some(exception_text),
                placement: None,
            });
        }

        if application_state == "running" {
            let pod_status = self.inner.status_query(kernel_id, iteration).await?;
            if pod_status.assigned_ip.is_some() {
                return Ok(pod_status);
            }
            if iteration.is_some() {
                debug!(kernel_id = %kernel_id, resource = %placement.pod_name, "crd application running, waiting on driver pod ip");
            }
            return Ok(PlacementStatus {
                raw_state: "running".to_string(),
                status: BackendStatus::Transient,
                assigned_host: None,
                assigned_ip: None,
                message: None,
                placement: None,
            });
        }

        if iteration.is_some() {
            debug!(kernel_id = %kernel_id, resource = %placement.pod_name, application_state, "waiting for crd submission state");
        }

        let status = if application_state.is_empty() || INITIAL_STATES.contains(&application_state.as_str()) {
            BackendStatus::Transient
        } else {
            BackendStatus::Terminated
        };

        Ok(PlacementStatus { raw_state: application_state, status, assigned_host: None, assigned_ip: None, message: None, placement: None })
    }

    async fn terminate_placement(&self, kernel_id: &KernelId, restart: bool) -> Result<BackendStatus> {
        let Some(placement) = self.inner.placement_of(kernel_id) else {
            return Ok(BackendStatus::NotFound);
        };

        let dp = DeleteParams { grace_period_seconds: Some(0), propagation_policy: Some(PropagationPolicy::Background), ..Default::default() };
        let resource_done = match self.custom_object_api(&placement.namespace).await {
            Ok(api) => match api.delete(&placement.pod_name, &dp).await {
                Ok(_) => true,
                Err(kube::Error::Api(e)) if e.code == 404 => true,
                Err(e) => {
                    warn!(kernel_id = %kernel_id, error = %e, "error deleting custom resource");
                    false
                }
            },
            Err(e) => {
                warn!(kernel_id = %kernel_id, error = %e, "error locating custom resource api for deletion");
                false
            }
        };

        let namespace_done = self.inner.delete_namespace_if_owned(kernel_id, restart).await?;

        if resource_done && namespace_done {
            Ok(BackendStatus::Terminated)
        } else {
            Ok(BackendStatus::Transient)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_exception_text_after_marker() {
        let msg = "org.apache.spark.SparkException: Driver failed\nException: actual cause here";
        assert_eq!(extract_exception_text(msg), "actual cause here");
    }

    #[test]
    fn returns_full_message_when_no_marker_present() {
        let msg = "driver pod evicted";
        assert_eq!(extract_exception_text(msg), "driver pod evicted");
    }
}

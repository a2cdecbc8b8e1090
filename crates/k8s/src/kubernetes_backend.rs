//! Kubernetes backend (§4.H): pod naming, namespace policy, RoleBinding creation,
//! label-selected pod discovery, termination.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams, PropagationPolicy};
use kube::Client;
use kprov_core::prelude::*;
use kprov_provisioner::backend::{Backend, LaunchOutcome, PlacementStatus};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

const INITIAL_STATES: &[&str] = &["pending", "running"];
const ERROR_STATES: &[&str] = &["failed", "unknown"];

#[derive(Clone)]
pub(crate) struct KernelPlacement {
    pub(crate) pod_name: String,
    pub(crate) namespace: String,
    pub(crate) delete_namespace: bool,
}

pub struct KubernetesBackend {
    client: Client,
    config: KubernetesConfig,
    placements: DashMap<KernelId, KernelPlacement>,
    prohibited_uids: std::collections::HashSet<String>,
    prohibited_gids: std::collections::HashSet<String>,
}

impl KubernetesBackend {
    pub async fn connect(
        config: KubernetesConfig,
        prohibited_uids: std::collections::HashSet<String>,
        prohibited_gids: std::collections::HashSet<String>,
    ) -> Result<Self> {
        let client = Client::try_default().await.context("connecting to kubernetes cluster")?;
        Ok(KubernetesBackend { client, config, placements: DashMap::new(), prohibited_uids, prohibited_gids })
    }

    pub(crate) fn client(&self) -> Client {
        self.client.clone()
    }

    pub(crate) fn placement_of(&self, kernel_id: &KernelId) -> Option<KernelPlacement> {
        self.placements.get(kernel_id).map(|p| p.clone())
    }

    fn kernel_pod_name(env: &HashMap<String, String>, kernel_id: &KernelId) -> String {
        let raw = env.get("KERNEL_POD_NAME").cloned().unwrap_or_else(|| {
            let username = env.get("KERNEL_USERNAME").cloned().unwrap_or_default();
            format!("{username}-{kernel_id}")
        });
        dns_safe_name(&raw)
    }

    fn resource_labels(kernel_id: &KernelId) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), "kprov".to_string()),
            ("component".to_string(), "kernel".to_string()),
            ("kernel_id".to_string(), kernel_id.clone()),
        ])
    }

    async fn create_kernel_namespace(&self, namespace: &str, kernel_id: &KernelId, service_account_name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta { name: Some(namespace.to_string()), labels: Some(Self::resource_labels(kernel_id)), ..Default::default() },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => info!(namespace, "created kernel namespace"),
            Err(kube::Error::Api(e)) if e.code == 409 => debug!(namespace, "kernel namespace already exists, reusing"),
            Err(e) => return Err(e).context("creating kernel namespace"),
        }
        self.create_role_binding(namespace, service_account_name, kernel_id).await
    }

    async fn create_role_binding(&self, namespace: &str, service_account_name: &str, kernel_id: &KernelId) -> Result<()> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let role_binding_name = self.config.kernel_cluster_role.clone();
        let binding = RoleBinding {
            metadata: ObjectMeta { name: Some(role_binding_name.clone()), labels: Some(Self::resource_labels(kernel_id)), ..Default::default() },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: self.config.kernel_cluster_role.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: service_account_name.to_string(),
                namespace: Some(namespace.to_string()),
                api_group: None,
            }]),
        };
        match api.create(&PostParams::default(), &binding).await {
            Ok(_) => {
                info!(namespace, role_binding_name, service_account_name, "created kernel role binding");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e).context("creating kernel role binding"),
        }
    }

    async fn find_kernel_pod(&self, namespace: &str, kernel_id: &KernelId) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("kernel_id={kernel_id},component=kernel");
        let pods = api.list(&ListParams::default().labels(&selector)).await.context("listing kernel pods")?;
        if pods.items.len() > 1 {
            return Err(ProvisionerError::invariant(kernel_id.clone(), format!("found {} pods for this kernel_id", pods.items.len())).into());
        }
        Ok(pods.items.into_iter().next())
    }

    /// Deletes the kernel's namespace if this backend created it for the kernel and the
    /// termination isn't part of a restart. Returns whether the namespace side is settled.
    pub(crate) async fn delete_namespace_if_owned(&self, kernel_id: &KernelId, restart: bool) -> Result<bool> {
        let Some(placement) = self.placements.get(kernel_id).map(|p| p.clone()) else {
            return Ok(true);
        };
        if !placement.delete_namespace || restart {
            return Ok(true);
        }
        let dp = DeleteParams { grace_period_seconds: Some(0), propagation_policy: Some(PropagationPolicy::Background), ..Default::default() };
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(&placement.namespace, &dp).await {
            Ok(_) => {
                info!(namespace = %placement.namespace, "deleted kernel namespace");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(true),
            Err(e) => {
                warn!(namespace = %placement.namespace, error = %e, "error deleting kernel namespace");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Backend for KubernetesBackend {
    async fn pre_launch_hook(&self, kernel_id: &KernelId, env: &mut HashMap<String, String>) -> Result<()> {
        env.insert("KERNEL_IMAGE".to_string(), self.config.image_name.clone());
        env.insert("KERNEL_EXECUTOR_IMAGE".to_string(), self.config.executor_image_name.clone());

        let kernel_uid = env.get("KERNEL_UID").cloned().unwrap_or_else(|| "1000".to_string());
        let kernel_gid = env.get("KERNEL_GID").cloned().unwrap_or_else(|| "100".to_string());
        if self.prohibited_uids.contains(&kernel_uid) {
            return Err(ProvisionerError::permission_denied(
                kernel_id.clone(),
                None,
                format!("kernel's UID value of '{kernel_uid}' has been denied via prohibited_uids"),
            )
            .into());
        }
        if self.prohibited_gids.contains(&kernel_gid) {
            return Err(ProvisionerError::permission_denied(
                kernel_id.clone(),
                None,
                format!("kernel's GID value of '{kernel_gid}' has been denied via prohibited_gids"),
            )
            .into());
        }
        env.insert("KERNEL_UID".to_string(), kernel_uid);
        env.insert("KERNEL_GID".to_string(), kernel_gid);

        let service_account_name = env
            .get("KERNEL_SERVICE_ACCOUNT_NAME")
            .cloned()
            .unwrap_or_else(|| self.config.default_kernel_service_account_name.clone());
        env.insert("KERNEL_SERVICE_ACCOUNT_NAME".to_string(), service_account_name.clone());

        let pod_name = Self::kernel_pod_name(env, kernel_id);
        env.insert("KERNEL_POD_NAME".to_string(), pod_name.clone());

        let (namespace, delete_namespace) = if let Some(ns) = env.get("KERNEL_NAMESPACE").cloned() {
            (ns, false)
        } else if self.config.shared_namespace {
            warn!(namespace = %self.config.namespace, "shared namespace configured, kernel will reside in the gateway namespace");
            (self.config.namespace.clone(), false)
        } else {
            self.create_kernel_namespace(&pod_name, kernel_id, &service_account_name).await?;
            (pod_name.clone(), true)
        };
        env.insert("KERNEL_NAMESPACE".to_string(), namespace.clone());

        self.placements.insert(kernel_id.clone(), KernelPlacement { pod_name, namespace, delete_namespace });
        Ok(())
    }

    async fn launch(&self, _kernel_id: &KernelId, _argv: &[String], _env: &HashMap<String, String>) -> Result<LaunchOutcome> {
        Ok(LaunchOutcome::Remote)
    }

    async fn status_query(&self, kernel_id: &KernelId, iteration: Option<u32>) -> Result<PlacementStatus> {
        let Some(placement) = self.placement_of(kernel_id) else {
            return Ok(PlacementStatus {
                raw_state: String::new(),
                status: BackendStatus::NotFound,
                assigned_host: None,
                assigned_ip: None,
                message: None,
                placement: None,
            });
        };
        let Some(pod) = self.find_kernel_pod(&placement.namespace, kernel_id).await? else {
            return Ok(PlacementStatus {
                raw_state: String::new(),
                status: BackendStatus::NotFound,
                assigned_host: None,
                assigned_ip: None,
                message: None,
                placement: None,
            });
        };

        let raw_state = pod.status.as_ref().and_then(|s| s.phase.clone()).unwrap_or_default().to_lowercase();
        let assigned_ip = if raw_state == "running" { pod.status.as_ref().and_then(|s| s.pod_ip.clone()) } else { None };
        let assigned_host = pod.metadata.name.clone();

        if iteration.is_some() {
            debug!(kernel_id = %kernel_id, namespace = %placement.namespace, raw_state, ?assigned_ip, "waiting to connect to k8s pod");
        }

        let status = if raw_state.is_empty() {
            BackendStatus::Transient
        } else if ERROR_STATES.contains(&raw_state.as_str()) {
            BackendStatus::Fatal
        } else if INITIAL_STATES.contains(&raw_state.as_str()) {
            BackendStatus::Transient
        } else {
            BackendStatus::Terminated
        };
        let message = matches!(status, BackendStatus::Fatal).then(|| format!("pod entered phase '{raw_state}'"));
        let placement = assigned_host.clone().map(|pod_name| PlacementHandle::Kubernetes {
            pod_name,
            namespace: placement.namespace.clone(),
            delete_namespace: placement.delete_namespace,
        });

        Ok(PlacementStatus { raw_state, status, assigned_host, assigned_ip, message, placement })
    }

    async fn terminate_placement(&self, kernel_id: &KernelId, restart: bool) -> Result<BackendStatus> {
        let Some(placement) = self.placement_of(kernel_id) else {
            return Ok(BackendStatus::NotFound);
        };

        let dp = DeleteParams { grace_period_seconds: Some(0), propagation_policy: Some(PropagationPolicy::Background), ..Default::default() };
        let pod_api: Api<Pod> = Api::namespaced(self.client.clone(), &placement.namespace);
        let pod_done = match pod_api.delete(&placement.pod_name, &dp).await {
            Ok(_) => true,
            Err(kube::Error::Api(e)) if e.code == 404 => true,
            Err(e) => {
                warn!(kernel_id = %kernel_id, error = %e, "error deleting kernel pod");
                false
            }
        };

        let namespace_done = self.delete_namespace_if_owned(kernel_id, restart).await?;

        if pod_done && namespace_done {
            self.placements.remove(kernel_id);
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
    fn kernel_pod_name_prefers_explicit_override() {
        let mut env = HashMap::new();
        env.insert("KERNEL_POD_NAME".to_string(), "My Pod!!".to_string());
        assert_eq!(KubernetesBackend::kernel_pod_name(&env, &"k1".to_string()), "my-pod");
    }

    #[test]
    fn kernel_pod_name_falls_back_to_username_and_kernel_id() {
        let mut env = HashMap::new();
        env.insert("KERNEL_USERNAME".to_string(), "Alice".to_string());
        assert_eq!(KubernetesBackend::kernel_pod_name(&env, &"abc-123".to_string()), "alice-abc-123");
    }
}

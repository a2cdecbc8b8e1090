use crate::error::{ProvisionerError, Result};
use std::collections::HashSet;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_set(name: &str, default: &[&str]) -> HashSet<String> {
    match env_var(name) {
        Some(s) => s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// `lo..hi` inclusive port window. `0..0` means "unconstrained" per §4.A.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub fn unconstrained() -> Self {
        PortRange { lo: 0, hi: 0 }
    }

    pub fn is_constrained(&self) -> bool {
        self.hi > self.lo
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (lo_s, hi_s) = s
            .split_once("..")
            .ok_or_else(|| ProvisionerError::config(format!("invalid port_range '{s}', expected 'lo..hi'")))?;
        let lo: u16 = lo_s
            .trim()
            .parse()
            .map_err(|_| ProvisionerError::config(format!("invalid port_range lower bound '{lo_s}'")))?;
        let hi: u16 = hi_s
            .trim()
            .parse()
            .map_err(|_| ProvisionerError::config(format!("invalid port_range upper bound '{hi_s}'")))?;
        let range = PortRange { lo, hi };
        range.validate()?;
        Ok(range)
    }

    fn validate(&self) -> Result<()> {
        if self.lo == 0 && self.hi == 0 {
            return Ok(());
        }
        let size = self.hi as i32 - self.lo as i32;
        if size < 1000 {
            return Err(ProvisionerError::config(format!(
                "port_range size must be >= 1000, got {size} ({}..{})",
                self.lo, self.hi
            )));
        }
        for endpoint in [self.lo, self.hi] {
            if !(1024..=65535).contains(&endpoint) {
                return Err(ProvisionerError::config(format!(
                    "port_range endpoint {endpoint} out of bounds [1024, 65535]"
                )));
            }
        }
        Ok(())
    }

    pub fn contains(&self, port: u16) -> bool {
        if !self.is_constrained() {
            return true;
        }
        port >= self.lo && port <= self.hi
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancingAlgorithm {
    RoundRobin,
    LeastConnection,
}

impl std::str::FromStr for LoadBalancingAlgorithm {
    type Err = ProvisionerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round-robin" => Ok(LoadBalancingAlgorithm::RoundRobin),
            "least-connection" => Ok(LoadBalancingAlgorithm::LeastConnection),
            other => Err(ProvisionerError::config(format!(
                "unknown load_balancing_algorithm '{other}', expected 'round-robin' or 'least-connection'"
            ))),
        }
    }
}

/// Options common to every backend (§4.A). Constructed once per provisioner; validated
/// eagerly so invalid configuration fails before any remote effect.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub authorized_users: HashSet<String>,
    pub unauthorized_users: HashSet<String>,
    pub port_range: PortRange,
    pub launch_timeout_secs: f64,
    pub poll_interval_secs: f64,
    pub max_poll_attempts: u32,
    pub socket_timeout_secs: f64,
    pub tunneling_enabled: bool,
    pub ssh_port: u16,
    pub prohibited_uids: HashSet<String>,
    pub prohibited_gids: HashSet<String>,
}

impl ProvisionerConfig {
    pub fn from_env() -> Result<Self> {
        let port_range = match env_var("GP_PORT_RANGE") {
            Some(s) => PortRange::parse(&s)?,
            None => PortRange::unconstrained(),
        };
        let launch_timeout_secs = env_var("GP_LAUNCH_TIMEOUT")
            .or_else(|| env_var("KERNEL_LAUNCH_TIMEOUT"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(30.0);
        Ok(ProvisionerConfig {
            authorized_users: env_set("GP_AUTHORIZED_USERS", &[]),
            unauthorized_users: env_set("GP_UNAUTHORIZED_USERS", &["root"]),
            port_range,
            launch_timeout_secs,
            poll_interval_secs: env_parsed("GP_POLL_INTERVAL", 0.5),
            max_poll_attempts: env_parsed("GP_MAX_POLL_ATTEMPTS", 10),
            socket_timeout_secs: env_parsed("GP_SOCKET_TIMEOUT", 0.01),
            tunneling_enabled: env_parsed("GP_TUNNELING_ENABLED", false),
            ssh_port: env_parsed("GP_SSH_PORT", 22),
            prohibited_uids: env_set("GP_PROHIBITED_UIDS", &["0"]),
            prohibited_gids: env_set("GP_PROHIBITED_GIDS", &["0"]),
        })
    }

    /// §4.A authorization enforcement: deny-list wins over allow-list.
    pub fn authorize(&self, kernel_username: &str) -> Result<()> {
        if self.unauthorized_users.contains(kernel_username) {
            return Err(ProvisionerError::permission_denied(
                "",
                None,
                format!("user '{kernel_username}' is explicitly unauthorized"),
            ));
        }
        if !self.authorized_users.is_empty() && !self.authorized_users.contains(kernel_username) {
            return Err(ProvisionerError::permission_denied(
                "",
                None,
                format!("user '{kernel_username}' is not in the authorized_users list"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub remote_hosts: Vec<String>,
    pub load_balancing_algorithm: LoadBalancingAlgorithm,
    pub remote_user: Option<String>,
    pub remote_pwd: Option<String>,
    pub gss_ssh: bool,
}

impl SshConfig {
    pub fn from_env() -> Result<Self> {
        let remote_hosts: Vec<String> = env_var("GP_REMOTE_HOSTS")
            .map(|s| s.split(',').map(|h| h.trim().to_string()).filter(|h| !h.is_empty()).collect())
            .unwrap_or_default();
        if remote_hosts.is_empty() {
            return Err(ProvisionerError::config("GP_REMOTE_HOSTS must list at least one host"));
        }
        let load_balancing_algorithm: LoadBalancingAlgorithm = env_var("GP_LOAD_BALANCING_ALGORITHM")
            .unwrap_or_else(|| "round-robin".to_string())
            .parse()?;
        let gss_ssh = env_parsed("GP_REMOTE_GSS_SSH", false);
        let remote_user = env_var("GP_REMOTE_USER");
        let remote_pwd = env_var("GP_REMOTE_PWD");
        if gss_ssh && (remote_user.is_some() || remote_pwd.is_some()) {
            tracing::warn!("GP_REMOTE_GSS_SSH is set alongside password/user auth; GSS takes precedence");
        }
        Ok(SshConfig { remote_hosts, load_balancing_algorithm, remote_user, remote_pwd, gss_ssh })
    }
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub image_name: String,
    pub executor_image_name: String,
    pub network: String,
    pub mirror_working_dirs: bool,
}

impl DockerConfig {
    pub fn from_env() -> Result<Self> {
        let image_name = env_var("GP_IMAGE_NAME")
            .ok_or_else(|| ProvisionerError::config("GP_IMAGE_NAME is required for docker/swarm backends"))?;
        Ok(DockerConfig {
            executor_image_name: env_var("GP_EXECUTOR_IMAGE_NAME").unwrap_or_else(|| image_name.clone()),
            image_name,
            network: env_var("GP_DOCKER_NETWORK").unwrap_or_else(|| "bridge".to_string()),
            mirror_working_dirs: env_parsed("GP_MIRROR_WORKING_DIRS", false),
        })
    }
}

pub type SwarmConfig = DockerConfig;

#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub namespace: String,
    pub shared_namespace: bool,
    pub default_kernel_service_account_name: String,
    pub kernel_cluster_role: String,
    pub image_name: String,
    pub executor_image_name: String,
}

impl KubernetesConfig {
    pub fn from_env() -> Result<Self> {
        let image_name = env_var("GP_IMAGE_NAME")
            .ok_or_else(|| ProvisionerError::config("GP_IMAGE_NAME is required for the kubernetes backend"))?;
        Ok(KubernetesConfig {
            namespace: env_var("GP_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            shared_namespace: env_parsed("GP_SHARED_NAMESPACE", true),
            default_kernel_service_account_name: env_var("GP_DEFAULT_KERNEL_SERVICE_ACCOUNT_NAME")
                .unwrap_or_else(|| "default".to_string()),
            kernel_cluster_role: env_var("GP_KERNEL_CLUSTER_ROLE").unwrap_or_else(|| "cluster-admin".to_string()),
            executor_image_name: env_var("GP_EXECUTOR_IMAGE_NAME").unwrap_or_else(|| image_name.clone()),
            image_name,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CrdConfig {
    pub kubernetes: KubernetesConfig,
    pub group: String,
    pub version: String,
    pub plural: String,
}

impl CrdConfig {
    pub fn from_env() -> Result<Self> {
        Ok(CrdConfig {
            kubernetes: KubernetesConfig::from_env()?,
            group: env_var("GP_CRD_GROUP")
                .ok_or_else(|| ProvisionerError::config("GP_CRD_GROUP is required for the crd backend"))?,
            version: env_var("GP_CRD_VERSION").unwrap_or_else(|| "v1".to_string()),
            plural: env_var("GP_CRD_PLURAL")
                .ok_or_else(|| ProvisionerError::config("GP_CRD_PLURAL is required for the crd backend"))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct YarnConfig {
    pub yarn_endpoint: String,
    pub alt_yarn_endpoint: Option<String>,
    pub yarn_endpoint_security_enabled: bool,
    pub impersonation_enabled: bool,
    pub shutdown_wait_time_secs: f64,
}

impl YarnConfig {
    pub fn from_env() -> Result<Self> {
        Ok(YarnConfig {
            yarn_endpoint: env_var("GP_YARN_ENDPOINT")
                .ok_or_else(|| ProvisionerError::config("GP_YARN_ENDPOINT is required for the yarn backend"))?,
            alt_yarn_endpoint: env_var("GP_ALT_YARN_ENDPOINT"),
            yarn_endpoint_security_enabled: env_parsed("GP_YARN_ENDPOINT_SECURITY_ENABLED", false),
            impersonation_enabled: env_parsed("GP_IMPERSONATION_ENABLED", false),
            shutdown_wait_time_secs: env_parsed("GP_YARN_SHUTDOWN_WAIT_TIME", 15.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_unconstrained_accepts_any_port() {
        let r = PortRange::unconstrained();
        assert!(r.contains(1));
        assert!(r.contains(65535));
    }

    #[test]
    fn port_range_rejects_narrow_window() {
        assert!(PortRange::parse("2000..2500").is_err());
    }

    #[test]
    fn port_range_rejects_out_of_bounds_endpoint() {
        assert!(PortRange::parse("100..2000").is_err());
    }

    #[test]
    fn port_range_accepts_valid_window() {
        let r = PortRange::parse("40000..41000").unwrap();
        assert!(r.is_constrained());
        assert!(r.contains(40500));
        assert!(!r.contains(39999));
    }

    #[test]
    fn load_balancing_algorithm_parses_known_values() {
        assert_eq!("round-robin".parse::<LoadBalancingAlgorithm>().unwrap(), LoadBalancingAlgorithm::RoundRobin);
        assert!("bogus".parse::<LoadBalancingAlgorithm>().is_err());
    }

    #[test]
    fn unauthorized_user_takes_precedence_over_authorized() {
        let mut cfg_authorized = HashSet::new();
        cfg_authorized.insert("root".to_string());
        let cfg = ProvisionerConfig {
            authorized_users: cfg_authorized,
            unauthorized_users: HashSet::from(["root".to_string()]),
            port_range: PortRange::unconstrained(),
            launch_timeout_secs: 30.0,
            poll_interval_secs: 0.5,
            max_poll_attempts: 10,
            socket_timeout_secs: 0.01,
            tunneling_enabled: false,
            ssh_port: 22,
            prohibited_uids: HashSet::new(),
            prohibited_gids: HashSet::new(),
        };
        assert!(cfg.authorize("root").is_err());
    }
}

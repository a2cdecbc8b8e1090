//! Kernel provisioner core: shared types, configuration, and error taxonomy used by every
//! placement backend and front-end in this workspace.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod types;
pub mod util;

pub mod prelude {
    pub use crate::config::{
        CrdConfig, DockerConfig, KubernetesConfig, LoadBalancingAlgorithm, PortRange,
        ProvisionerConfig, SshConfig, SwarmConfig, YarnConfig,
    };
    pub use crate::error::{ProvisionerError, Result};
    pub use crate::types::{
        BackendStatus, ConnectionInfo, KernelChannel, KernelId, KernelRecord, KernelSpec,
        PlacementHandle, ProvisionerInfo, ProvisionerState, SignalOutcome, TunnelEndpoint,
    };
    pub use crate::util::{dns_safe_name, strip_sensitive_env, substitute_argv, ENV_STRIP_LIST};
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a live kernel instance, assigned once per lifecycle.
pub type KernelId = String;

/// Kernel communication channels, matching the launcher's wire protocol. `Communication`
/// is the out-of-band control channel the launcher calls GP_COMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelChannel {
    Shell,
    Iopub,
    Stdin,
    Heartbeat,
    Control,
    Communication,
}

impl KernelChannel {
    pub const ALL: [KernelChannel; 6] = [
        KernelChannel::Shell,
        KernelChannel::Iopub,
        KernelChannel::Stdin,
        KernelChannel::Heartbeat,
        KernelChannel::Control,
        KernelChannel::Communication,
    ];
}

/// The provisioner's own lifecycle, shared verbatim across every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionerState {
    Idle,
    PreLaunch,
    Launching,
    AwaitingStartup,
    Running,
    ShuttingDown,
    Terminated,
}

/// Backend-agnostic status classification, replacing exception-based control flow on the
/// original's 404/409 handling: deciding logic runs against this enum, never against a
/// caught exception's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    NotFound,
    Terminated,
    Transient,
    Fatal,
}

/// Outcome of a signal-delivery attempt, replacing the original's string-compare on
/// `kill ...; echo $?` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    NoProcess,
    Refused,
}

/// Five ZMQ-style ports plus signing material a client needs to speak to a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub ip: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub hb_port: u16,
    pub control_port: u16,
    #[serde(with = "hex_bytes")]
    pub key: Vec<u8>,
    pub signature_scheme: String,
    pub transport: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comm_port: Option<u16>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        hex_encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex_decode(&s).map_err(serde::de::Error::custom)
    }

    fn hex_encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
        if s.len() % 2 != 0 {
            return Err("odd-length hex string".into());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
            .collect()
    }
}

/// Backend-specific handle recorded once placement is known, and restored via
/// `load_provisioner_info` after a process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlacementHandle {
    Ssh { host: String },
    Docker { container_name: String, assigned_node_ip: Option<String> },
    Swarm { service_name: String, assigned_node_ip: Option<String> },
    Kubernetes { pod_name: String, namespace: String, delete_namespace: bool },
    Crd { group: String, version: String, plural: String, resource_name: String, namespace: String },
    Yarn { application_id: String },
}

/// Template for launching a kernel: argv with `{placeholder}` tokens, an environment map,
/// and descriptive metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSpec {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub display_name: String,
    pub language: String,
}

/// Per-channel tunnel handle identifiers, as tracked by the tunnel supervisor. The
/// provisioner core only needs to know a tunnel exists and its local port; the process
/// handle itself lives in `kprov-tunnel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub local_port: u16,
}

/// One live kernel's full lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelRecord {
    pub kernel_id: KernelId,
    pub kernel_username: String,
    pub kernel_spec: KernelSpec,
    pub connection_info: Option<ConnectionInfo>,
    pub placement: Option<PlacementHandle>,
    pub assigned_host: String,
    pub assigned_ip: String,
    pub pid: u32,
    pub pgid: u32,
    pub tunnels: HashMap<KernelChannel, TunnelEndpoint>,
    pub start_time_ms: i64,
    pub last_known_state: ProvisionerState,
}

impl KernelRecord {
    pub fn new(kernel_id: KernelId, kernel_username: String, kernel_spec: KernelSpec, start_time_ms: i64) -> Self {
        KernelRecord {
            kernel_id,
            kernel_username,
            kernel_spec,
            connection_info: None,
            placement: None,
            assigned_host: String::new(),
            assigned_ip: String::new(),
            pid: 0,
            pgid: 0,
            tunnels: HashMap::new(),
            start_time_ms,
            last_known_state: ProvisionerState::Idle,
        }
    }

    pub fn has_process(&self) -> bool {
        self.pid != 0 || self.placement.is_some()
    }
}

/// Persisted form of a `KernelRecord`, restorable after a gateway restart (§6 "Persisted
/// state"). Deliberately narrower than `KernelRecord`: it carries only what's needed to
/// resume polling/signaling, not the original launch spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerInfo {
    pub kernel_id: KernelId,
    pub pid: u32,
    pub pgid: u32,
    pub ip: String,
    pub assigned_ip: String,
    pub assigned_host: String,
    pub comm_ip: Option<String>,
    pub comm_port: Option<u16>,
    pub placement: Option<PlacementHandle>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_record_has_process_before_and_after_cleanup() {
        let spec = KernelSpec {
            argv: vec!["{kernel_id}".into()],
            env: HashMap::new(),
            display_name: "python3".into(),
            language: "python".into(),
        };
        let mut rec = KernelRecord::new("k1".into(), "alice".into(), spec, 0);
        assert!(!rec.has_process());
        rec.pid = 42;
        assert!(rec.has_process());
        rec.pid = 0;
        rec.placement = None;
        assert!(!rec.has_process());
    }

    #[test]
    fn connection_info_round_trips_through_json() {
        let ci = ConnectionInfo {
            ip: "127.0.0.1".into(),
            shell_port: 1,
            iopub_port: 2,
            stdin_port: 3,
            hb_port: 4,
            control_port: 5,
            key: vec![0xde, 0xad, 0xbe, 0xef],
            signature_scheme: "hmac-sha256".into(),
            transport: "tcp".into(),
            comm_port: Some(6),
        };
        let s = serde_json::to_string(&ci).unwrap();
        let back: ConnectionInfo = serde_json::from_str(&s).unwrap();
        assert_eq!(ci, back);
    }
}

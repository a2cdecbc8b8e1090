use thiserror::Error;

/// The six error kinds the provisioner core distinguishes. Every variant carries enough
/// context (`kernel_id`, `assigned_host`) to render the user-visible failure message
/// without the caller re-threading that context through every call site.
#[derive(Debug, Error, Clone)]
pub enum ProvisionerError {
    #[error("config error (kernel={kernel_id:?}): {reason}")]
    ConfigError {
        kernel_id: Option<String>,
        assigned_host: Option<String>,
        reason: String,
    },

    #[error("permission denied (kernel={kernel_id:?}, host={assigned_host:?}): {reason}")]
    PermissionDenied {
        kernel_id: Option<String>,
        assigned_host: Option<String>,
        reason: String,
    },

    #[error("timeout (kernel={kernel_id:?}, host={assigned_host:?}): {reason}")]
    Timeout {
        kernel_id: Option<String>,
        assigned_host: Option<String>,
        reason: String,
    },

    #[error("launch failed (kernel={kernel_id:?}, host={assigned_host:?}): {reason}")]
    LaunchFailed {
        kernel_id: Option<String>,
        assigned_host: Option<String>,
        reason: String,
    },

    #[error("invariant violated (kernel={kernel_id:?}): {reason}")]
    InvariantError {
        kernel_id: Option<String>,
        assigned_host: Option<String>,
        reason: String,
    },

    #[error("transient backend error (kernel={kernel_id:?}, host={assigned_host:?}): {reason}")]
    TransientBackendError {
        kernel_id: Option<String>,
        assigned_host: Option<String>,
        reason: String,
    },
}

impl ProvisionerError {
    pub fn config(reason: impl Into<String>) -> Self {
        ProvisionerError::ConfigError {
            kernel_id: None,
            assigned_host: None,
            reason: reason.into(),
        }
    }

    pub fn permission_denied(
        kernel_id: impl Into<String>,
        assigned_host: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        ProvisionerError::PermissionDenied {
            kernel_id: Some(kernel_id.into()),
            assigned_host,
            reason: reason.into(),
        }
    }

    pub fn timeout(
        kernel_id: impl Into<String>,
        assigned_host: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        ProvisionerError::Timeout {
            kernel_id: Some(kernel_id.into()),
            assigned_host,
            reason: reason.into(),
        }
    }

    pub fn launch_failed(
        kernel_id: impl Into<String>,
        assigned_host: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        ProvisionerError::LaunchFailed {
            kernel_id: Some(kernel_id.into()),
            assigned_host,
            reason: reason.into(),
        }
    }

    pub fn invariant(kernel_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ProvisionerError::InvariantError {
            kernel_id: Some(kernel_id.into()),
            assigned_host: None,
            reason: reason.into(),
        }
    }

    pub fn transient(
        kernel_id: impl Into<String>,
        assigned_host: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        ProvisionerError::TransientBackendError {
            kernel_id: Some(kernel_id.into()),
            assigned_host,
            reason: reason.into(),
        }
    }

    /// True for errors that a poll loop may swallow-and-retry until its own timeout elapses.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProvisionerError::TransientBackendError { .. })
    }

    pub fn kernel_id(&self) -> Option<&str> {
        match self {
            ProvisionerError::ConfigError { kernel_id, .. }
            | ProvisionerError::PermissionDenied { kernel_id, .. }
            | ProvisionerError::Timeout { kernel_id, .. }
            | ProvisionerError::LaunchFailed { kernel_id, .. }
            | ProvisionerError::InvariantError { kernel_id, .. }
            | ProvisionerError::TransientBackendError { kernel_id, .. } => kernel_id.as_deref(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        let e = ProvisionerError::transient("k1", Some("h1".into()), "connection reset");
        assert!(e.is_transient());
        assert_eq!(e.kernel_id(), Some("k1"));
    }

    #[test]
    fn non_transient_errors_are_not_retryable() {
        let e = ProvisionerError::launch_failed("k1", Some("h1".into()), "pod failed");
        assert!(!e.is_transient());
    }
}

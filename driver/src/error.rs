use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = VirtError> = std::result::Result<T, E>;

/// Errors surfaced by the driver and its providers.
#[derive(Error, Debug)]
pub enum VirtError {
    /// Task configuration rejected; every independent problem is listed.
    #[error("invalid task configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("image {0:?} not found in allowed paths or task directory")]
    ImageNotFound(PathBuf),

    #[error("domain {0} already exists")]
    DomainExists(String),

    #[error("domain {0} not found")]
    DomainNotFound(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("task {0} already exists")]
    TaskExists(String),

    #[error("task {0} is still running, destroy requires force")]
    TaskStillRunning(String),

    /// Marker for a VM that ended in an error/crashed state.
    #[error("task crashed")]
    TaskCrashed,

    #[error("hypervisor connection closed")]
    ConnectionClosed,

    #[error("provider {0} not found")]
    ProviderNotFound(String),

    #[error("network {0} not found")]
    NetworkNotFound(String),

    #[error("timed out {0}")]
    Timeout(String),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("cloudinit: {0}")]
    CloudInit(String),

    #[error("domain description: {0}")]
    DomainXml(String),

    #[error("{cmd} failed: {stderr}")]
    Command { cmd: String, stderr: String },

    /// Teardown never aborts; individual failures are collected here.
    #[error("teardown finished with {} error(s): {}", .0.len(), .0.join("; "))]
    Teardown(Vec<String>),

    #[error("unsupported task state version {0}")]
    StateVersion(u32),

    #[error("libvirt: {0}")]
    Libvirt(#[from] virt::error::Error),

    #[error("cloud-hypervisor: {0}")]
    CloudHypervisor(#[from] ch_client::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl VirtError {
    /// True when the error means the referenced VM or task is gone, which
    /// stop/destroy paths treat as success.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VirtError::DomainNotFound(_) | VirtError::TaskNotFound(_) | VirtError::ImageNotFound(_)
        )
    }

    /// Build a `Command` error from a finished process output.
    pub fn from_output(cmd: impl Into<String>, output: &std::process::Output) -> Self {
        VirtError::Command {
            cmd: cmd.into(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_classification() {
        assert!(VirtError::DomainNotFound("x".into()).is_not_found());
        assert!(VirtError::TaskNotFound("x".into()).is_not_found());
        assert!(!VirtError::DomainExists("x".into()).is_not_found());
    }

    #[test]
    fn validation_message_lists_all_errors() {
        let err = VirtError::Validation(vec!["memory too small".into(), "missing image".into()]);
        let msg = err.to_string();
        assert!(msg.contains("memory too small"));
        assert!(msg.contains("missing image"));
    }
}

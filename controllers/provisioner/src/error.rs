//! Provisioner error types.
//!
//! Every fatal error carries enough context for `main` to print what failed
//! and the next command the operator should run.

use pve_client::PveError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while provisioning or uninstalling the workload.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Invalid flag, environment value or persisted value
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// The requested resource is already taken
    #[error("{message}")]
    Conflict { message: String, remediation: String },

    /// A required platform resource does not exist
    #[error("{what} not found")]
    NotFound { what: String, remediation: String },

    /// More than one candidate and no explicit choice
    #[error("{what} is ambiguous: candidates are {}", candidates.join(", "))]
    Ambiguous {
        what: String,
        flag: String,
        candidates: Vec<String>,
    },

    /// A host or workload command exited non-zero
    #[error("`{command}` failed with status {status}: {stderr}")]
    ExternalCommand {
        command: String,
        status: i32,
        stderr: String,
    },

    /// A bounded poll ran out of attempts
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        what: String,
        waited: Duration,
        diagnostics: Option<String>,
    },

    /// Proxmox VE API error
    #[error("Proxmox VE error: {0}")]
    Pve(#[from] PveError),

    /// Host filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operator declined the confirmation prompt
    #[error("aborted by operator")]
    Aborted,

    /// Ctrl-C arrived while changes were being applied
    #[error("interrupted")]
    Interrupted,
}

impl ProvisionError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self::NotFound {
            what: what.into(),
            remediation: remediation.into(),
        }
    }

    /// The next concrete step for the operator
    pub fn remediation(&self) -> String {
        match self {
            Self::Validation { field, .. } => {
                format!("re-run with a corrected {} (see --help)", field)
            }
            Self::Conflict { remediation, .. } | Self::NotFound { remediation, .. } => {
                remediation.clone()
            }
            Self::Ambiguous { flag, candidates, .. } => format!(
                "re-run with {} set to one of: {}",
                flag,
                candidates.join(", ")
            ),
            Self::ExternalCommand { command, .. } => {
                format!("run `{}` manually to see the full output, then re-run", command)
            }
            Self::Timeout { .. } => "re-run with --debug to keep the workload for inspection".to_string(),
            Self::Pve(PveError::Authentication(_)) => {
                "check PVE_API_TOKEN (user@realm!tokenid=secret) and its privileges".to_string()
            }
            Self::Pve(PveError::Task { upid, .. }) => {
                format!("inspect the task log with `pvenode task log {}`", upid)
            }
            Self::Pve(_) => "check `journalctl -u pveproxy` on the node and re-run".to_string(),
            Self::Io(_) => "re-run as root on the Proxmox VE node".to_string(),
            Self::Aborted => "re-run with --yes to confirm".to_string(),
            Self::Interrupted => {
                "re-run the provisioner; if a partial workload remains, run with --uninstall first"
                    .to_string()
            }
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Validation { .. } => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_exits_with_two() {
        let err = ProvisionError::validation("--vlan", "must be between 1 and 4094");
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.to_string(), "invalid --vlan: must be between 1 and 4094");
        assert!(err.remediation().contains("--vlan"));
    }

    #[test]
    fn ambiguous_lists_candidates_in_remediation() {
        let err = ProvisionError::Ambiguous {
            what: "container storage".to_string(),
            flag: "--storage".to_string(),
            candidates: vec!["local-lvm".to_string(), "tank".to_string()],
        };
        assert_eq!(err.exit_code(), 1);
        assert_eq!(
            err.remediation(),
            "re-run with --storage set to one of: local-lvm, tank"
        );
    }

    #[test]
    fn task_failures_point_at_task_log() {
        let err = ProvisionError::from(PveError::Task {
            upid: "UPID:pve1:0001".to_string(),
            exit_status: "bad".to_string(),
        });
        assert!(err.remediation().contains("pvenode task log UPID:pve1:0001"));
    }
}

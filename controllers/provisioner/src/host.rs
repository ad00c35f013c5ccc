//! Host access
//!
//! Everything the provisioner does to the Proxmox VE node outside the REST
//! API goes through [`HostOps`]: files, ownership, commands, and the address
//! list of host interfaces. Commands inside the workload run through
//! `pct exec` on the host.

use crate::error::ProvisionError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::debug;

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[cfg(test)]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    #[cfg(test)]
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit into [`ProvisionError::ExternalCommand`]
    pub fn check(self, command: &str) -> Result<Self, ProvisionError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ProvisionError::ExternalCommand {
                command: command.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Host seam: real filesystem and processes in production, in-memory in tests
#[async_trait::async_trait]
pub trait HostOps: Send + Sync {
    /// Read a file; `None` when it does not exist
    fn read_file(&self, path: &Path) -> Result<Option<String>, ProvisionError>;

    /// Create or replace a file with the given permission bits
    fn write_file(&self, path: &Path, contents: &str, mode: u32) -> Result<(), ProvisionError>;

    /// Remove a file; returns whether it existed
    fn remove_file(&self, path: &Path) -> Result<bool, ProvisionError>;

    fn create_dir_all(&self, path: &Path) -> Result<(), ProvisionError>;

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), ProvisionError>;

    fn hostname(&self) -> Result<String, ProvisionError>;

    /// Run a program to completion. Errors only when it cannot be spawned.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ProvisionError>;

    /// IPv4 addresses per host interface, from `ip -j -4 addr show`
    async fn ipv4_addresses(&self) -> Result<BTreeMap<String, Vec<Ipv4Addr>>, ProvisionError> {
        let output = self
            .run("ip", &["-j", "-4", "addr", "show"])
            .await?
            .check("ip -j -4 addr show")?;
        parse_ip_addr_json(&output.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    local: Option<String>,
}

/// Parse the JSON output of `ip -j -4 addr show`
pub fn parse_ip_addr_json(json: &str) -> Result<BTreeMap<String, Vec<Ipv4Addr>>, ProvisionError> {
    let links: Vec<IpLink> = serde_json::from_str(json).map_err(|e| {
        ProvisionError::validation("host interface list", format!("unexpected `ip -j` output: {}", e))
    })?;

    Ok(links
        .into_iter()
        .map(|link| {
            let addresses: Vec<Ipv4Addr> = link
                .addr_info
                .iter()
                .filter(|info| info.family.as_deref().is_none_or(|f| f == "inet"))
                .filter_map(|info| info.local.as_deref()?.parse().ok())
                .collect();
            (link.ifname, addresses)
        })
        .collect())
}

/// The real host
#[derive(Debug, Default)]
pub struct LocalHost;

#[async_trait::async_trait]
impl HostOps for LocalHost {
    fn read_file(&self, path: &Path) -> Result<Option<String>, ProvisionError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(unix)]
    fn write_file(&self, path: &Path, contents: &str, mode: u32) -> Result<(), ProvisionError> {
        use std::io::Write;
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(mode)
            .open(path)?;
        // `mode` only applies on creation
        file.set_permissions(std::fs::Permissions::from_mode(mode))?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn write_file(&self, path: &Path, contents: &str, _mode: u32) -> Result<(), ProvisionError> {
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<bool, ProvisionError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), ProvisionError> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    #[cfg(unix)]
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), ProvisionError> {
        std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn chown(&self, _path: &Path, _uid: u32, _gid: u32) -> Result<(), ProvisionError> {
        Ok(())
    }

    fn hostname(&self) -> Result<String, ProvisionError> {
        let name = std::fs::read_to_string("/etc/hostname")?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ProvisionError::validation(
                "--node",
                "/etc/hostname is empty; pass the node name explicitly",
            ));
        }
        Ok(name.to_string())
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ProvisionError> {
        debug!("Running {} {}", program, args.join(" "));
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a shell script inside the workload
pub async fn exec_in_workload(
    host: &dyn HostOps,
    vmid: u32,
    script: &str,
) -> Result<CommandOutput, ProvisionError> {
    let id = vmid.to_string();
    host.run("pct", &["exec", &id, "--", "sh", "-c", script]).await
}

/// Run a shell script inside the workload and fail on a non-zero exit
pub async fn exec_checked(
    host: &dyn HostOps,
    vmid: u32,
    script: &str,
) -> Result<CommandOutput, ProvisionError> {
    exec_in_workload(host, vmid, script)
        .await?
        .check(&format!("pct exec {} -- sh -c '{}'", vmid, script))
}

/// Write a file inside the workload. The content travels base64-encoded so
/// no quoting of the payload is needed.
pub async fn push_file(
    host: &dyn HostOps,
    vmid: u32,
    path: &str,
    contents: &str,
    mode: u32,
) -> Result<(), ProvisionError> {
    let encoded = BASE64.encode(contents.as_bytes());
    let script = format!(
        "umask 077 && printf '%s' '{}' | base64 -d > {path}.tmp && chmod {:o} {path}.tmp && mv {path}.tmp {path}",
        encoded,
        mode,
        path = shell_quote(path),
    );
    exec_in_workload(host, vmid, &script)
        .await?
        .check(&format!("write {} in workload {}", path, vmid))?;
    Ok(())
}

/// Single-quote a value for `sh`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

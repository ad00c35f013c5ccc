//! Uninstaller
//!
//! Removes every container carrying the canonical name on the node, the
//! firewall state that belongs to it and the host port forwarding. The host
//! state file, host data directories, templates and platform credentials
//! stay; the commands to remove those are printed for the operator.

use crate::config::ProvisioningConfig;
use crate::credentials::AccessSpec;
use crate::error::ProvisionError;
use crate::firewall;
use crate::host::HostOps;
use crate::inventory;
use crate::nat_helper;
use crate::plan::resolve_node;
use crate::poll::wait_for_task;
use pve_client::{FirewallTarget, PveClientTrait};
use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};

const GUEST_FIREWALL_DIR: &str = "/etc/pve/firewall";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallReport {
    pub node: String,
    pub removed: Vec<u32>,
    pub node_rules_removed: usize,
    pub nat_helper_removed: bool,
    /// Best-effort steps that failed
    pub warnings: Vec<String>,
    /// Commands for what uninstall deliberately keeps
    pub manual_steps: Vec<String>,
}

impl fmt::Display for UninstallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.removed.is_empty() {
            writeln!(f, "No provider-node container found on {}", self.node)?;
        } else {
            let ids: Vec<_> = self.removed.iter().map(u32::to_string).collect();
            writeln!(f, "Removed container(s) {} from {}", ids.join(", "), self.node)?;
        }
        writeln!(f, "Node firewall rules removed: {}", self.node_rules_removed)?;
        writeln!(
            f,
            "Port forwarding helper: {}",
            if self.nat_helper_removed { "removed" } else { "not installed" }
        )?;
        for warning in &self.warnings {
            writeln!(f, "warning: {}", warning)?;
        }
        writeln!(f, "Kept for the next install. To remove them too, run:")?;
        for step in &self.manual_steps {
            writeln!(f, "  {}", step)?;
        }
        Ok(())
    }
}

pub struct Uninstaller<'a> {
    client: &'a dyn PveClientTrait,
    host: &'a dyn HostOps,
    config: &'a ProvisioningConfig,
}

impl<'a> Uninstaller<'a> {
    pub fn new(client: &'a dyn PveClientTrait, host: &'a dyn HostOps, config: &'a ProvisioningConfig) -> Self {
        Self { client, host, config }
    }

    /// Remove the workload. Safe to run when nothing is installed.
    pub async fn uninstall(&self) -> Result<UninstallReport, ProvisionError> {
        let node = resolve_node(self.client, self.host, self.config).await?;
        let workloads = inventory::find_workloads(self.client, &node, &self.config.name).await?;
        if workloads.is_empty() {
            info!("No {} container on {}", self.config.name, node);
        }

        let mut removed = Vec::new();
        for workload in &workloads {
            self.remove_workload(&node, workload.vmid, workload.is_running()).await?;
            removed.push(workload.vmid);
        }

        let mut warnings = Vec::new();
        let marker = firewall::marker(&self.config.name);
        let target = FirewallTarget::Node { node: node.clone() };
        let node_rules_removed = match firewall::teardown_rule(self.client, &target, &marker).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Could not remove node firewall rule {}: {}", marker, e);
                warnings.push(format!("node firewall rule {} not removed: {}", marker, e));
                0
            }
        };
        let nat_helper_removed = match nat_helper::remove(self.host).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Could not remove the port forwarding helper: {}", e);
                warnings.push(format!("port forwarding helper not removed: {}", e));
                false
            }
        };

        Ok(UninstallReport {
            node,
            removed,
            node_rules_removed,
            nat_helper_removed,
            warnings,
            manual_steps: self.manual_steps(),
        })
    }

    async fn remove_workload(&self, node: &str, vmid: u32, running: bool) -> Result<(), ProvisionError> {
        let task = self.config.poll.task;
        if running {
            info!("Stopping container {}", vmid);
            let upid = self.client.stop_container(node, vmid).await?;
            wait_for_task(self.client, node, &upid, task).await?;
        }
        info!("Destroying container {}", vmid);
        let upid = self.client.destroy_container(node, vmid).await?;
        wait_for_task(self.client, node, &upid, task).await?;

        // The platform normally removes it with the guest
        let rules = PathBuf::from(GUEST_FIREWALL_DIR).join(format!("{}.fw", vmid));
        match self.host.remove_file(&rules) {
            Ok(true) => info!("Removed {}", rules.display()),
            Ok(false) => {}
            Err(e) => warn!("Could not remove {}: {}", rules.display(), e),
        }
        Ok(())
    }

    fn manual_steps(&self) -> Vec<String> {
        let access = AccessSpec::for_service(&self.config.name);
        vec![
            format!("pveum user token remove {} {}", access.userid, access.token_name),
            format!("pveum user delete {}", access.userid),
            format!("pveum group delete {}", access.groupid),
            format!("pveum role delete {}", access.roleid),
            format!("rm -rf {}", self.config.data_root.display()),
            format!("rm -f {}", self.config.state_file.display()),
            "pveam list <template-storage>   # then: pveam remove <volid>".to_string(),
            "pvesm status   # storage is left untouched".to_string(),
        ]
    }
}

//! Provisioning orchestrator
//!
//! Runs the plan phase, then applies the plan step by step. Mandatory steps
//! abort the run; best-effort steps (firewall, auto-update) only add a
//! warning to the report. On abort, [`CleanupScope`] limits the rollback to
//! what this run created.

use crate::allocator;
use crate::config::ProvisioningConfig;
use crate::credentials::{self, ApiKeySource};
use crate::env_file::EnvFile;
use crate::error::ProvisionError;
use crate::firewall::{self, ManagedRule, UpsertOutcome};
use crate::host::{HostOps, exec_checked, exec_in_workload, push_file};
use crate::nat_helper::{self, InstallOutcome, NatHelperSpec};
use crate::plan::{self, ProvisioningPlan};
use crate::poll::wait_for_task;
use crate::state_store::{KEY_API_KEY, StateStore};
use crate::unit::{self, UnitInputs};
use pve_client::{CreateContainerRequest, FirewallTarget, PveClientTrait};
use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Host uid/gid that root inside an unprivileged container maps to
pub const WORKLOAD_ROOT_ID: u32 = 100_000;

const CONFIG_MOUNT: &str = "/etc/provider-node";
const CONTAINER_FEATURES: &str = "nesting=1,keyctl=1";
const SERVICE_ENV_MODE: u32 = 0o600;

/// What this run created, and therefore may roll back
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupScope {
    workload: Option<(String, u32)>,
    node_rule: Option<FirewallTarget>,
    nat_helper: bool,
}

impl CleanupScope {
    pub fn record_workload(&mut self, node: &str, vmid: u32) {
        self.workload = Some((node.to_string(), vmid));
    }

    pub fn record_node_rule(&mut self, target: FirewallTarget) {
        self.node_rule = Some(target);
    }

    pub fn record_nat_helper(&mut self) {
        self.nat_helper = true;
    }

    pub fn workload(&self) -> Option<u32> {
        self.workload.as_ref().map(|(_, vmid)| *vmid)
    }

    pub fn is_empty(&self) -> bool {
        self.workload.is_none() && self.node_rule.is_none() && !self.nat_helper
    }
}

/// Summary of a successful run
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub node: String,
    pub vmid: u32,
    pub address: Ipv4Addr,
    pub url: String,
    pub api_key_source: ApiKeySource,
    pub service_env: String,
    /// `None` when the API user was skipped
    pub token_id: Option<String>,
    pub warnings: Vec<String>,
}

impl fmt::Display for ProvisionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "provider-node is running in container {} on {}", self.vmid, self.node)?;
        writeln!(f, "  address:  {}", self.address)?;
        writeln!(f, "  service:  {}", self.url)?;
        writeln!(f, "  API key:  {} (see {})", self.api_key_source, self.service_env)?;
        if let Some(token_id) = &self.token_id {
            writeln!(f, "  API token: {}", token_id)?;
        }
        if !self.warnings.is_empty() {
            writeln!(f, "Completed with {} warning(s):", self.warnings.len())?;
            for warning in &self.warnings {
                writeln!(f, "  - {}", warning)?;
            }
        }
        Ok(())
    }
}

pub struct Provisioner<'a> {
    client: &'a dyn PveClientTrait,
    host: &'a dyn HostOps,
    config: &'a ProvisioningConfig,
}

impl<'a> Provisioner<'a> {
    pub fn new(client: &'a dyn PveClientTrait, host: &'a dyn HostOps, config: &'a ProvisioningConfig) -> Self {
        Self { client, host, config }
    }

    /// Resolve the plan without changing anything
    pub async fn plan(&self) -> Result<ProvisioningPlan, ProvisionError> {
        plan::build_plan(self.client, self.host, self.config).await
    }

    #[cfg(test)]
    pub async fn provision(&self) -> Result<ProvisionReport, ProvisionError> {
        self.provision_until(std::future::pending::<()>()).await
    }

    /// Plan and apply. If `shutdown` completes first, the run is treated as
    /// failed and rolled back.
    pub async fn provision_until<F>(&self, shutdown: F) -> Result<ProvisionReport, ProvisionError>
    where
        F: Future<Output = ()>,
    {
        let plan = self.plan().await?;
        info!("Provisioning {} as container {} on {}", plan.name, plan.vmid, plan.node);

        let mut scope = CleanupScope::default();
        let result = {
            let apply = self.apply(&plan, &mut scope);
            tokio::select! {
                result = apply => result,
                _ = shutdown => {
                    warn!("Interrupted; rolling back");
                    Err(ProvisionError::Interrupted)
                }
            }
        };

        match result {
            Ok(report) => Ok(report),
            Err(e) => {
                error!("Provisioning failed: {}", e);
                self.cleanup(&scope).await;
                Err(e)
            }
        }
    }

    /// Apply a plan. Everything created is recorded in `scope` as soon as it exists.
    pub async fn apply(
        &self,
        plan: &ProvisioningPlan,
        scope: &mut CleanupScope,
    ) -> Result<ProvisionReport, ProvisionError> {
        let client = self.client;
        let host = self.host;
        let config = self.config;
        let node = plan.node.as_str();
        let vmid = plan.vmid;
        let mut warnings = Vec::new();

        let token_id = match &plan.access {
            Some(access) => {
                let credential = credentials::ensure_api_access(client, access).await?;
                if let Some(secret) = &credential.secret {
                    println!("API token {} created. Its secret is shown only once:", credential.token_id);
                    println!("  {}", secret);
                }
                Some(credential.token_id)
            }
            None => {
                info!("Skipping API user setup");
                None
            }
        };

        if !plan.template_present {
            info!("Downloading template {}", plan.template);
            let upid = client
                .download_appliance_template(node, &plan.template.storage, &plan.template.template)
                .await?;
            wait_for_task(client, node, &upid, config.poll.task).await?;
        }

        for dir in [config.config_dir(), config.data_dir()] {
            host.create_dir_all(&dir)?;
            host.chown(&dir, WORKLOAD_ROOT_ID, WORKLOAD_ROOT_ID)?;
        }

        // Re-read the inventory right before creation
        allocator::allocate_instance_id(client, node, Some(vmid)).await?;
        let request = CreateContainerRequest {
            vmid,
            hostname: plan.name.clone(),
            ostemplate: plan.template.volid(),
            storage: plan.storage.clone(),
            rootfs_gb: plan.rootfs_gb,
            memory_mb: plan.memory_mb,
            cores: plan.cores,
            net0: plan.network.net0(&plan.mac.mac),
            unprivileged: true,
            features: Some(CONTAINER_FEATURES.to_string()),
            onboot: true,
        };
        let upid = client.create_container(node, &request).await?;
        scope.record_workload(node, vmid);
        wait_for_task(client, node, &upid, config.poll.task).await?;
        info!("Created container {}", vmid);

        let store = StateStore::new(host, &config.state_file);
        store.persist_identity(
            &plan.mac.mac.to_string(),
            plan.port,
            plan.network.vlan_id,
            &plan.interface_names(),
        )?;

        let mounts = [
            ("mp0".to_string(), format!("{},mp={}", config.config_dir().display(), CONFIG_MOUNT)),
            ("mp1".to_string(), format!("{},mp={}", config.data_dir().display(), unit::DATA_MOUNT)),
        ];
        client.update_container_config(node, vmid, &mounts).await?;

        if let Err(e) = client.set_container_firewall_enabled(node, vmid, true).await {
            note(&mut warnings, format!("could not enable the guest firewall on {}: {}", vmid, e));
        }

        let upid = client.start_container(node, vmid).await?;
        wait_for_task(client, node, &upid, config.poll.task).await?;
        let address = self.await_network(vmid).await?;
        info!("Container {} is up at {}", vmid, address);

        exec_checked(
            host,
            vmid,
            "export DEBIAN_FRONTEND=noninteractive && apt-get update -q && apt-get install -y -q podman ufw ca-certificates",
        )
        .await?;
        exec_checked(
            host,
            vmid,
            &format!("mkdir -p {dir}/data {dir}/logs", dir = unit::DATA_MOUNT),
        )
        .await?;

        let ufw = format!(
            "ufw allow 22/tcp && ufw allow {}/tcp && ufw --force enable",
            plan.port
        );
        match exec_in_workload(host, vmid, &ufw).await {
            Ok(output) if output.success() => debug!("Workload firewall allows port {}", plan.port),
            Ok(output) => note(&mut warnings, format!("ufw setup failed: {}", output.stderr.trim())),
            Err(e) => note(&mut warnings, format!("ufw setup failed: {}", e)),
        }

        self.open_access(plan, scope, &mut warnings).await;

        let service_env = config.service_env_path();
        self.write_service_env(plan, &service_env)?;
        store.save(&[(KEY_API_KEY, plan.api_key.value.clone())])?;

        let quadlet = unit::render_quadlet(&UnitInputs {
            image: &plan.image,
            port: plan.port,
            env_file: unit::ENV_FILE_PATH,
            auto_update: config.auto_update,
        });
        push_file(host, vmid, unit::QUADLET_PATH, &quadlet, 0o644).await?;
        exec_checked(host, vmid, "systemctl daemon-reload").await?;

        if let Some(enabled) = config.auto_update {
            let action = if enabled { "enable" } else { "disable" };
            let script = format!("systemctl {} --now {}", action, unit::AUTO_UPDATE_TIMER);
            match exec_in_workload(host, vmid, &script).await {
                Ok(output) if output.success() => info!("Image auto-update {}d", action),
                Ok(output) => note(&mut warnings, format!("could not {} auto-update: {}", action, output.stderr.trim())),
                Err(e) => note(&mut warnings, format!("could not {} auto-update: {}", action, e)),
            }
        }

        exec_checked(host, vmid, &format!("systemctl restart {}", unit::SERVICE_NAME)).await?;
        self.verify_service(vmid).await?;

        let scheme = if config.tls { "https" } else { "http" };
        Ok(ProvisionReport {
            node: node.to_string(),
            vmid,
            address,
            url: format!("{}://{}:{}", scheme, address, plan.port),
            api_key_source: plan.api_key.source,
            service_env: service_env.display().to_string(),
            token_id,
            warnings,
        })
    }

    /// Workload and node firewall rules, and host port forwarding. Never fatal.
    async fn open_access(&self, plan: &ProvisioningPlan, scope: &mut CleanupScope, warnings: &mut Vec<String>) {
        let rule = ManagedRule::new(&plan.name, plan.port, plan.firewall_source.clone());

        let workload = FirewallTarget::Container {
            node: plan.node.clone(),
            vmid: plan.vmid,
        };
        if let Err(e) = firewall::upsert_rule(self.client, &workload, &rule).await {
            note(warnings, format!("could not open port {} on {}: {}", plan.port, workload, e));
        }

        if plan.forward.is_empty() {
            debug!("No forwarding interfaces; node firewall left as is");
            return;
        }

        let node_target = FirewallTarget::Node { node: plan.node.clone() };
        match firewall::upsert_rule(self.client, &node_target, &rule).await {
            Ok(UpsertOutcome::Created) => scope.record_node_rule(node_target),
            Ok(_) => {}
            Err(e) => note(warnings, format!("could not open port {} on {}: {}", plan.port, node_target, e)),
        }

        let spec = NatHelperSpec {
            vmid: plan.vmid,
            port: plan.port,
            addresses: plan.forward.clone(),
        };
        match nat_helper::install(self.host, &spec).await {
            Ok(InstallOutcome::Created) => scope.record_nat_helper(),
            Ok(_) => {}
            Err(e) => note(warnings, format!("port forwarding not installed: {}", e)),
        }
    }

    /// Merge the provisioner's keys into the service configuration file
    fn write_service_env(&self, plan: &ProvisioningPlan, path: &Path) -> Result<(), ProvisionError> {
        let mut env = self
            .host
            .read_file(path)?
            .map(|text| EnvFile::parse(&text))
            .unwrap_or_default();
        let fresh = env.is_empty();

        env.set("API_KEY", plan.api_key.value.clone());
        env.set("TLS_ENABLED", self.config.tls.to_string());
        env.set("ENVIRONMENT", self.config.environment.clone());
        env.set("WORKERS", self.config.workers.to_string());
        env.set("MAC", plan.mac.mac.to_string());
        env.set("PORT", plan.port.to_string());

        self.host.write_file(path, &env.render(), SERVICE_ENV_MODE)?;
        self.host.chown(path, WORKLOAD_ROOT_ID, WORKLOAD_ROOT_ID)?;
        if fresh {
            info!("Wrote service configuration {}", path.display());
        } else {
            info!("Merged service configuration {}", path.display());
        }
        Ok(())
    }

    /// Wait for the workload's first non-loopback IPv4 address
    async fn await_network(&self, vmid: u32) -> Result<Ipv4Addr, ProvisionError> {
        let host = self.host;
        let result = self
            .config
            .poll
            .network
            .until(&format!("network in container {}", vmid), |_| async move {
                let output = exec_in_workload(host, vmid, "hostname -I").await?;
                if !output.success() {
                    return Ok(None);
                }
                Ok(output
                    .stdout
                    .split_whitespace()
                    .filter_map(|token| token.parse::<Ipv4Addr>().ok())
                    .find(|ip| !ip.is_loopback()))
            })
            .await;

        match result {
            Err(ProvisionError::Timeout { what, waited, .. }) => Err(ProvisionError::Timeout {
                what,
                waited,
                diagnostics: self.diagnostics(vmid, "ip -4 addr show; ip route").await,
            }),
            other => other,
        }
    }

    async fn verify_service(&self, vmid: u32) -> Result<(), ProvisionError> {
        let host = self.host;
        let check = format!("systemctl is-active {}", unit::SERVICE_NAME);
        let result = self
            .config
            .poll
            .service
            .until(&format!("{} in container {}", unit::SERVICE_NAME, vmid), |_| {
                let check = check.clone();
                async move {
                    let output = exec_in_workload(host, vmid, &check).await?;
                    let state = unit::parse_is_active(&output.stdout);
                    debug!("{} is {}", unit::SERVICE_NAME, state);
                    Ok((state == "active").then_some(()))
                }
            })
            .await;

        match result {
            Err(ProvisionError::Timeout { what, waited, .. }) => Err(ProvisionError::Timeout {
                what,
                waited,
                diagnostics: self
                    .diagnostics(vmid, &format!("journalctl -u {} -n 50 --no-pager", unit::SERVICE_NAME))
                    .await,
            }),
            Ok(()) => {
                info!("{} is active", unit::SERVICE_NAME);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort command output for an error report
    async fn diagnostics(&self, vmid: u32, script: &str) -> Option<String> {
        match exec_in_workload(self.host, vmid, script).await {
            Ok(output) => {
                let text = format!("{}{}", output.stdout, output.stderr);
                let text = text.trim();
                (!text.is_empty()).then(|| text.to_string())
            }
            Err(e) => {
                warn!("Could not collect diagnostics from {}: {}", vmid, e);
                None
            }
        }
    }

    /// Roll back what this run created. Errors are logged, never returned.
    pub async fn cleanup(&self, scope: &CleanupScope) {
        if scope.is_empty() {
            debug!("Nothing to roll back");
            return;
        }
        if self.config.debug {
            if let Some(vmid) = scope.workload() {
                warn!("Debug mode: keeping container {} for inspection", vmid);
                println!("Inspect the partial workload with:");
                println!("  pct config {}", vmid);
                println!("  pct enter {}", vmid);
                println!("  workload-provisioner --uninstall   # when done");
            }
            return;
        }

        if scope.nat_helper {
            if let Err(e) = nat_helper::remove(self.host).await {
                warn!("Rollback: could not remove port forwarding helper: {}", e);
            }
        }
        if let Some(target) = &scope.node_rule {
            let marker = firewall::marker(&self.config.name);
            if let Err(e) = firewall::teardown_rule(self.client, target, &marker).await {
                warn!("Rollback: could not remove firewall rule on {}: {}", target, e);
            }
        }
        if let Some((node, vmid)) = &scope.workload {
            match self.destroy_workload(node, *vmid).await {
                Ok(()) => info!("Rollback: destroyed container {}", vmid),
                Err(e) => warn!(
                    "Rollback: could not destroy container {}: {} (remove it with `pct destroy {} --purge`)",
                    vmid, e, vmid
                ),
            }
        }
    }

    async fn destroy_workload(&self, node: &str, vmid: u32) -> Result<(), ProvisionError> {
        let status = match self.client.container_status(node, vmid).await {
            Ok(status) => status,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if status.is_running() {
            let upid = self.client.stop_container(node, vmid).await?;
            wait_for_task(self.client, node, &upid, self.config.poll.task).await?;
        }
        let upid = self.client.destroy_container(node, vmid).await?;
        wait_for_task(self.client, node, &upid, self.config.poll.task).await
    }
}

fn note(warnings: &mut Vec<String>, message: String) {
    warn!("{}", message);
    warnings.push(message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_scope_tracks_created_resources() {
        let mut scope = CleanupScope::default();
        assert!(scope.is_empty());
        scope.record_workload("pve1", 101);
        assert_eq!(scope.workload(), Some(101));
        assert!(!scope.is_empty());
    }

    #[test]
    fn test_report_lists_warnings() {
        let report = ProvisionReport {
            node: "pve1".to_string(),
            vmid: 100,
            address: Ipv4Addr::new(10, 0, 0, 50),
            url: "https://10.0.0.50:8443".to_string(),
            api_key_source: ApiKeySource::Generated,
            service_env: "/var/lib/provider-node/config/provider-node.env".to_string(),
            token_id: None,
            warnings: vec!["ufw setup failed: boom".to_string()],
        };
        let text = report.to_string();
        assert!(text.contains("container 100 on pve1"));
        assert!(text.contains("https://10.0.0.50:8443"));
        assert!(text.contains("  - ufw setup failed: boom"));
    }
}

//! Plan phase
//!
//! Everything the apply phase needs is resolved here against live platform
//! and host state, without changing either. The only side effect allowed is
//! reading. A generated MAC or API key lives in the plan until apply persists it.

use crate::allocator::{self, ContentKind, TemplateRef};
use crate::config::{DEFAULT_PORT, ProvisioningConfig};
use crate::credentials::{self, AccessSpec, MaterializedKey};
use crate::env_file::EnvFile;
use crate::error::ProvisionError;
use crate::host::HostOps;
use crate::inventory;
use crate::network::{self, MacChoice, NetworkPlan};
use crate::state_store::{KEY_API_KEY, KEY_INTERFACES, StateStore};
use pve_client::PveClientTrait;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Side-effect-free description of one provisioning run
#[derive(Debug, Clone)]
pub struct ProvisioningPlan {
    pub node: String,
    pub vmid: u32,
    pub name: String,
    pub storage: String,
    pub template: TemplateRef,
    /// Already downloaded to the template storage
    pub template_present: bool,
    pub memory_mb: u32,
    pub cores: u32,
    pub rootfs_gb: u32,
    pub network: NetworkPlan,
    pub mac: MacChoice,
    pub port: u16,
    /// Forwarding interface to its host address
    pub forward: BTreeMap<String, Ipv4Addr>,
    pub firewall_source: Option<String>,
    pub api_key: MaterializedKey,
    /// `None` when the API user is skipped
    pub access: Option<AccessSpec>,
    pub image: String,
}

impl ProvisioningPlan {
    /// Interface names as persisted in the state store
    pub fn interface_names(&self) -> Vec<String> {
        self.forward.keys().cloned().collect()
    }
}

impl fmt::Display for ProvisioningPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Provisioning plan for {} on node {}", self.name, self.node)?;
        writeln!(f, "  instance id:      {}", self.vmid)?;
        writeln!(
            f,
            "  resources:        {} MiB, {} core(s), {} GiB root disk",
            self.memory_mb, self.cores, self.rootfs_gb
        )?;
        writeln!(f, "  storage:          {}", self.storage)?;
        writeln!(
            f,
            "  template:         {}{}",
            self.template,
            if self.template_present { "" } else { " (will be downloaded)" }
        )?;
        writeln!(f, "  network:          {}", self.network.net0(&self.mac.mac))?;
        writeln!(
            f,
            "  MAC address:      {}{}",
            self.mac.mac,
            if self.mac.generated { " (new, not persisted)" } else { " (persisted)" }
        )?;
        writeln!(f, "  service port:     {}", self.port)?;
        writeln!(
            f,
            "  firewall source:  {}",
            self.firewall_source.as_deref().unwrap_or("any")
        )?;
        if self.forward.is_empty() {
            writeln!(f, "  port forwarding:  none")?;
        } else {
            let forward: Vec<_> = self.forward.iter().map(|(name, ip)| format!("{} ({})", name, ip)).collect();
            writeln!(f, "  port forwarding:  {}", forward.join(", "))?;
        }
        writeln!(f, "  image:            {}", self.image)?;
        writeln!(f, "  service API key:  {}", self.api_key.source)?;
        match &self.access {
            Some(access) => writeln!(f, "  API user:         {} (role {})", access.userid, access.roleid),
            None => writeln!(f, "  API user:         skipped"),
        }
    }
}

/// Configured node, else this host's name. Must be a cluster member.
pub async fn resolve_node(
    client: &dyn PveClientTrait,
    host: &dyn HostOps,
    config: &ProvisioningConfig,
) -> Result<String, ProvisionError> {
    let node = match &config.node {
        Some(node) => node.clone(),
        None => host.hostname()?,
    };
    let nodes = client.list_nodes().await?;
    if nodes.iter().any(|n| n.node == node) {
        debug!("Provisioning on node {}", node);
        return Ok(node);
    }
    let known: Vec<_> = nodes.iter().map(|n| n.node.as_str()).collect();
    Err(ProvisionError::not_found(
        format!("node {} in the cluster", node),
        format!("re-run with --node set to one of: {}", known.join(", ")),
    ))
}

/// Refuse when a workload with the canonical name already exists on the node
pub async fn guard_singleton(client: &dyn PveClientTrait, node: &str, name: &str) -> Result<(), ProvisionError> {
    let existing = inventory::find_workloads(client, node, name).await?;
    if existing.is_empty() {
        return Ok(());
    }
    let ids: Vec<_> = existing.iter().map(|g| g.vmid.to_string()).collect();
    Err(ProvisionError::Conflict {
        message: format!("{} is already provisioned on {} as container {}", name, node, ids.join(", ")),
        remediation: "run `workload-provisioner --uninstall` first, then provision again".to_string(),
    })
}

/// Resolve every identity and resource for this run
pub async fn build_plan(
    client: &dyn PveClientTrait,
    host: &dyn HostOps,
    config: &ProvisioningConfig,
) -> Result<ProvisioningPlan, ProvisionError> {
    let mode = network::validate_network_mode(config.static_ip.as_deref(), config.gateway.as_deref())?;
    if let Some(vlan) = config.vlan {
        network::validate_vlan(vlan)?;
    }

    let node = resolve_node(client, host, config).await?;
    let template_name =
        allocator::resolve_template(client, host, &node, &config.os_family, !config.dry_run).await?;
    guard_singleton(client, &node, &config.name).await?;

    if config.skip_network_check {
        info!("Skipping bridge check for {}", config.bridge);
    } else {
        network::validate_bridge(client, &node, &config.bridge).await?;
    }

    let store = StateStore::new(host, &config.state_file);
    let state = store.load()?;

    let forward = match &config.interfaces {
        Some(names) => network::plan_interface_addresses(host, names, config.skip_network_check).await?,
        None => network::plan_interface_addresses(host, &state.interfaces, config.skip_network_check)
            .await
            .map_err(|e| match e {
                ProvisionError::Validation { field, message } => ProvisionError::validation(
                    field,
                    format!(
                        "{} (from {}={} in {}; pass --interfaces none to stop forwarding)",
                        message,
                        KEY_INTERFACES,
                        state.interfaces.join(","),
                        store.path().display()
                    ),
                ),
                other => other,
            })?,
    };

    let storage = allocator::resolve_storage(client, &node, config.storage.as_deref(), ContentKind::RootDir).await?;
    let template_storage =
        allocator::resolve_template_storage(client, &node, config.template_storage.as_deref(), &storage).await?;
    let template = TemplateRef {
        storage: template_storage,
        template: template_name,
    };
    let template_present = allocator::template_present(client, &node, &template).await?;

    let vmid = allocator::allocate_instance_id(client, &node, config.instance_id).await?;

    let mac = network::get_or_create_mac(&state)?;
    let port = config.port.or(state.port).unwrap_or(DEFAULT_PORT);
    let vlan_id = config.vlan.or(state.vlan_id);

    let service_env = host
        .read_file(&config.service_env_path())?
        .map(|text| EnvFile::parse(&text));
    let deployed_key = service_env
        .as_ref()
        .and_then(|env| env.get(KEY_API_KEY))
        .or(state.api_key.as_deref());
    let api_key = credentials::materialize_api_key(deployed_key, config.api_key.as_deref())?;

    Ok(ProvisioningPlan {
        node,
        vmid,
        name: config.name.clone(),
        storage,
        template,
        template_present,
        memory_mb: config.memory_mb,
        cores: config.cores,
        rootfs_gb: config.rootfs_gb,
        network: NetworkPlan {
            bridge: config.bridge.clone(),
            vlan_id,
            mode,
        },
        mac,
        port,
        forward,
        firewall_source: config.firewall_source.clone(),
        api_key,
        access: (!config.skip_api_user).then(|| AccessSpec::for_service(&config.name)),
        image: config.image_ref(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ApiKeySource;
    use crate::test_utils::{FakeHost, seeded_client, test_config};

    #[tokio::test]
    async fn test_plan_on_fresh_host() {
        let client = seeded_client();
        let host = FakeHost::new();
        let config = test_config();

        let plan = build_plan(&client, &host, &config).await.unwrap();
        assert_eq!(plan.node, "pve1");
        assert_eq!(plan.vmid, 100);
        assert_eq!(plan.storage, "local-lvm");
        assert_eq!(plan.template.volid(), "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst");
        assert!(!plan.template_present);
        assert!(plan.mac.generated);
        assert_eq!(plan.port, DEFAULT_PORT);
        assert_eq!(plan.api_key.source, ApiKeySource::Generated);
        assert!(plan.access.is_some());
        assert!(host.ran("pveam update"));
    }

    #[tokio::test]
    async fn test_plan_does_not_mutate_anything() {
        let client = seeded_client();
        let host = FakeHost::new();
        build_plan(&client, &host, &test_config()).await.unwrap();

        assert!(client.calls().is_empty());
        assert!(host.file(test_config().state_file.to_str().unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_dry_run_skips_catalog_refresh() {
        let client = seeded_client();
        let host = FakeHost::new();
        let mut config = test_config();
        config.dry_run = true;

        build_plan(&client, &host, &config).await.unwrap();
        assert!(!host.ran("pveam update"));
    }

    #[tokio::test]
    async fn test_state_supplies_port_vlan_and_identity() {
        let client = seeded_client();
        let host = FakeHost::new();
        let config = test_config();
        host.put_file(
            config.state_file.to_str().unwrap(),
            "MAC=BC:24:11:AA:BB:CC\nAPI_KEY=deployed\nPORT=9443\nVLAN=20\nINTERFACES=vmbr0\n",
        );

        let plan = build_plan(&client, &host, &config).await.unwrap();
        assert_eq!(plan.mac.mac.to_string(), "BC:24:11:AA:BB:CC");
        assert!(!plan.mac.generated);
        assert_eq!(plan.port, 9443);
        assert_eq!(plan.network.vlan_id, Some(20));
        assert_eq!(plan.forward["vmbr0"], Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(plan.api_key.value, "deployed");
        assert_eq!(plan.api_key.source, ApiKeySource::Existing);
    }

    #[tokio::test]
    async fn test_stale_persisted_interface_names_the_state_file() {
        let client = seeded_client();
        let host = FakeHost::new();
        let mut config = test_config();
        host.put_file(config.state_file.to_str().unwrap(), "INTERFACES=eno1\n");

        let err = build_plan(&client, &host, &config).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("eno1 (no IPv4 address)"));
        assert!(text.contains(&format!("INTERFACES=eno1 in {}", config.state_file.display())));
        assert!(text.contains("--interfaces none"));

        config.interfaces = Some(Vec::new());
        let plan = build_plan(&client, &host, &config).await.unwrap();
        assert!(plan.forward.is_empty());
    }

    #[tokio::test]
    async fn test_flags_win_over_state() {
        let client = seeded_client();
        let host = FakeHost::new();
        let mut config = test_config();
        host.put_file(config.state_file.to_str().unwrap(), "PORT=9443\nVLAN=20\n");
        config.port = Some(10443);
        config.vlan = Some(30);

        let plan = build_plan(&client, &host, &config).await.unwrap();
        assert_eq!(plan.port, 10443);
        assert_eq!(plan.network.vlan_id, Some(30));
    }

    #[tokio::test]
    async fn test_service_config_key_wins_over_state() {
        let client = seeded_client();
        let host = FakeHost::new();
        let config = test_config();
        host.put_file(config.state_file.to_str().unwrap(), "API_KEY=stale\n");
        host.put_file(
            config.service_env_path().to_str().unwrap(),
            "API_KEY=live\nCUSTOM_FEATURE=1\n",
        );

        let plan = build_plan(&client, &host, &config).await.unwrap();
        assert_eq!(plan.api_key.value, "live");
    }

    #[tokio::test]
    async fn test_existing_workload_is_a_conflict() {
        let client = seeded_client();
        client.add_container(104, "pve1", "provider-node", "running");
        let host = FakeHost::new();

        let err = build_plan(&client, &host, &test_config()).await.unwrap_err();
        match err {
            ProvisionError::Conflict { message, remediation } => {
                assert!(message.contains("104"), "{}", message);
                assert!(remediation.contains("--uninstall"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_network_mode_fails_before_any_lookup() {
        let client = seeded_client();
        let host = FakeHost::new();
        let mut config = test_config();
        config.static_ip = Some("192.168.1.50/24".to_string());

        let err = build_plan(&client, &host, &config).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Validation { ref field, .. } if field == "--gateway"));
        assert!(host.commands().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_node_lists_members() {
        let client = seeded_client();
        let host = FakeHost::new();
        let mut config = test_config();
        config.node = Some("pve9".to_string());

        let err = build_plan(&client, &host, &config).await.unwrap_err();
        assert!(err.remediation().contains("pve1"));
    }

    #[tokio::test]
    async fn test_missing_bridge_unless_skipped() {
        let client = seeded_client();
        let host = FakeHost::new();
        let mut config = test_config();
        config.bridge = "vmbr7".to_string();

        assert!(matches!(
            build_plan(&client, &host, &config).await,
            Err(ProvisionError::NotFound { .. })
        ));

        config.skip_network_check = true;
        assert!(build_plan(&client, &host, &config).await.is_ok());
    }

    #[tokio::test]
    async fn test_plan_display_hides_api_key() {
        let client = seeded_client();
        let host = FakeHost::new();
        let mut config = test_config();
        config.api_key = Some("s3cretvalue".to_string());

        let plan = build_plan(&client, &host, &config).await.unwrap();
        let text = plan.to_string();
        assert!(!text.contains("s3cretvalue"));
        assert!(text.contains("service API key:  provided"));
        assert!(text.contains("(new, not persisted)"));
    }
}

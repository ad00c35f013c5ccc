//! Command line and environment configuration
//!
//! Every flag mirrors an environment variable; flags win. The parsed
//! [`Cli`] is validated once and frozen into a [`ProvisioningConfig`] that the
//! rest of the provisioner only reads.

use crate::error::ProvisionError;
use crate::poll::BoundedPoll;
use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the managed workload and of the service inside it
pub const CANONICAL_NAME: &str = "provider-node";

pub const DEFAULT_PORT: u16 = 8443;
pub const DEFAULT_STATE_FILE: &str = "/var/lib/provider-node/provisioner.env";
pub const DEFAULT_DATA_ROOT: &str = "/var/lib/provider-node";
const DEFAULT_CA_FILE: &str = "/etc/pve/pve-root-ca.pem";

#[derive(Debug, Parser)]
#[command(
    name = "workload-provisioner",
    version,
    about = "Provision, reconcile and uninstall the provider-node workload on a Proxmox VE host"
)]
pub struct Cli {
    /// Proxmox VE API endpoint.
    #[arg(long = "api-url", env = "PVE_API_URL", default_value = "https://127.0.0.1:8006")]
    pub api_url: String,

    /// API token used by the provisioner itself (`user@realm!tokenid=secret`).
    ///
    /// Bind mounts require a token of `root@pam`.
    #[arg(long = "api-token", env = "PVE_API_TOKEN", hide_env_values = true)]
    pub api_token: String,

    /// CA certificate (PEM) the API endpoint is signed with.
    ///
    /// Defaults to the cluster CA when it exists.
    #[arg(long = "ca-file", env = "PVE_CA_FILE", value_name = "PATH")]
    pub ca_file: Option<PathBuf>,

    /// Cluster node to provision on (defaults to this host's name).
    #[arg(long, env = "PROVIDER_NODE_NODE")]
    pub node: Option<String>,

    /// Container id; allocated from 100 upwards when omitted.
    #[arg(long = "instance-id", env = "PROVIDER_NODE_INSTANCE_ID")]
    pub instance_id: Option<u32>,

    /// Memory in MiB.
    #[arg(long, env = "PROVIDER_NODE_MEMORY", default_value_t = 2048)]
    pub memory: u32,

    /// CPU cores.
    #[arg(long, env = "PROVIDER_NODE_CORES", default_value_t = 2)]
    pub cores: u32,

    /// Root filesystem size in GiB.
    #[arg(long = "disk", env = "PROVIDER_NODE_DISK", default_value_t = 16)]
    pub disk_gb: u32,

    /// Service API key; keeps the deployed key when omitted.
    #[arg(long = "api-key", env = "PROVIDER_NODE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Host bridge for the workload's network interface.
    #[arg(long, env = "PROVIDER_NODE_BRIDGE", default_value = "vmbr0")]
    pub bridge: String,

    /// VLAN tag (1-4094).
    #[arg(long, env = "PROVIDER_NODE_VLAN")]
    pub vlan: Option<u16>,

    /// Published service port (default 8443, or the previously used port).
    #[arg(long, env = "PROVIDER_NODE_PORT")]
    pub port: Option<u16>,

    /// Storage for the container root filesystem.
    #[arg(long, env = "PROVIDER_NODE_STORAGE")]
    pub storage: Option<String>,

    /// Storage for the OS template.
    #[arg(long = "template-storage", env = "PROVIDER_NODE_TEMPLATE_STORAGE")]
    pub template_storage: Option<String>,

    /// Static address in CIDR form; requires --gateway.
    #[arg(long = "static-ip", env = "PROVIDER_NODE_STATIC_IP")]
    pub static_ip: Option<String>,

    /// Default gateway; requires --static-ip.
    #[arg(long, env = "PROVIDER_NODE_GATEWAY")]
    pub gateway: Option<String>,

    /// Service container image (without tag).
    #[arg(long, env = "PROVIDER_NODE_IMAGE", default_value = "ghcr.io/provider-node/provider-node")]
    pub image: String,

    /// Service container image tag.
    #[arg(long = "image-tag", env = "PROVIDER_NODE_IMAGE_TAG", default_value = "latest")]
    pub image_tag: String,

    /// OS template family, matched against the appliance catalog.
    #[arg(long = "os-family", env = "PROVIDER_NODE_OS_FAMILY", default_value = "debian-12")]
    pub os_family: String,

    /// Host interfaces whose addresses forward the service port to the workload.
    /// `none` stops forwarding and forgets the persisted list.
    #[arg(long, env = "PROVIDER_NODE_INTERFACES", value_delimiter = ',')]
    pub interfaces: Vec<String>,

    /// Source allowed by the firewall rules: `any`, a CIDR or an ipset (`+mgmt`).
    #[arg(long = "firewall-source", env = "PROVIDER_NODE_FIREWALL_SOURCE", default_value = "any")]
    pub firewall_source: String,

    /// Do not create the platform API user, role and token.
    #[arg(long = "skip-api-user", env = "PROVIDER_NODE_SKIP_API_USER")]
    pub skip_api_user: bool,

    /// Do not verify the bridge and forwarding interfaces against the host.
    #[arg(long = "skip-network-check", env = "PROVIDER_NODE_SKIP_NETWORK_CHECK")]
    pub skip_network_check: bool,

    /// Let the image be refreshed by podman-auto-update (`--auto-update=false` to opt out).
    ///
    /// When omitted the timer is left as it is.
    #[arg(
        long = "auto-update",
        env = "PROVIDER_NODE_AUTO_UPDATE",
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub auto_update: Option<bool>,

    /// Deployment environment written to the service configuration.
    #[arg(long, env = "PROVIDER_NODE_ENVIRONMENT", default_value = "production")]
    pub environment: String,

    /// Service worker count.
    #[arg(long, env = "PROVIDER_NODE_WORKERS", default_value_t = 4)]
    pub workers: u32,

    /// Serve plain HTTP instead of TLS.
    #[arg(long = "no-tls", env = "PROVIDER_NODE_NO_TLS")]
    pub no_tls: bool,

    /// Host state file that outlives the workload.
    #[arg(long = "state-file", env = "PROVIDER_NODE_STATE_FILE", default_value = DEFAULT_STATE_FILE)]
    pub state_file: PathBuf,

    /// Host directory bind-mounted into the workload.
    #[arg(long = "data-root", env = "PROVIDER_NODE_DATA_ROOT", default_value = DEFAULT_DATA_ROOT)]
    pub data_root: PathBuf,

    /// Print the provisioning plan and exit without changing anything.
    #[arg(long = "dry-run", env = "PROVIDER_NODE_DRY_RUN")]
    pub dry_run: bool,

    /// Remove the workload instead of provisioning it.
    #[arg(long, env = "PROVIDER_NODE_UNINSTALL")]
    pub uninstall: bool,

    /// Skip the uninstall confirmation prompt.
    #[arg(long, short = 'y', env = "PROVIDER_NODE_YES")]
    pub yes: bool,

    /// Verbose logs; keep a failed workload for inspection.
    #[arg(long, env = "PROVIDER_NODE_DEBUG")]
    pub debug: bool,
}

/// Waits used by the apply phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Platform tasks (create, start, template download)
    pub task: BoundedPoll,
    /// Workload network readiness
    pub network: BoundedPoll,
    /// Service activation
    pub service: BoundedPoll,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            task: BoundedPoll::new(Duration::from_secs(1), 600),
            network: BoundedPoll::new(Duration::from_secs(2), 60),
            service: BoundedPoll::new(Duration::from_secs(3), 40),
        }
    }
}

/// Immutable, validated configuration
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    pub api_url: String,
    pub api_token: String,
    pub ca_file: Option<PathBuf>,
    pub node: Option<String>,
    pub name: String,
    pub instance_id: Option<u32>,
    pub memory_mb: u32,
    pub cores: u32,
    pub rootfs_gb: u32,
    pub api_key: Option<String>,
    pub bridge: String,
    pub vlan: Option<u16>,
    pub port: Option<u16>,
    pub storage: Option<String>,
    pub template_storage: Option<String>,
    pub static_ip: Option<String>,
    pub gateway: Option<String>,
    pub image: String,
    pub image_tag: String,
    pub os_family: String,
    /// `None` falls back to the state file; an empty list disables forwarding
    pub interfaces: Option<Vec<String>>,
    /// `None` means any source
    pub firewall_source: Option<String>,
    pub skip_api_user: bool,
    pub skip_network_check: bool,
    pub auto_update: Option<bool>,
    pub environment: String,
    pub workers: u32,
    pub tls: bool,
    pub state_file: PathBuf,
    pub data_root: PathBuf,
    pub dry_run: bool,
    pub uninstall: bool,
    pub assume_yes: bool,
    pub debug: bool,
    pub poll: PollSettings,
}

impl Cli {
    /// Validate flag values and freeze them
    pub fn into_config(self) -> Result<ProvisioningConfig, ProvisionError> {
        if let Some(id) = self.instance_id.filter(|id| *id < crate::allocator::MIN_INSTANCE_ID) {
            return Err(ProvisionError::validation(
                "--instance-id",
                format!("{} is reserved; ids start at {}", id, crate::allocator::MIN_INSTANCE_ID),
            ));
        }
        if self.memory < 512 {
            return Err(ProvisionError::validation("--memory", "at least 512 MiB is required"));
        }
        if self.cores == 0 {
            return Err(ProvisionError::validation("--cores", "at least one core is required"));
        }
        if self.disk_gb < 4 {
            return Err(ProvisionError::validation("--disk", "at least 4 GiB is required"));
        }
        if let Some(vlan) = self.vlan {
            crate::network::validate_vlan(vlan)?;
        }
        if self.port == Some(0) {
            return Err(ProvisionError::validation("--port", "must be between 1 and 65535"));
        }
        if self.workers == 0 {
            return Err(ProvisionError::validation("--workers", "at least one worker is required"));
        }
        if !self.api_token.contains('!') || !self.api_token.contains('=') {
            return Err(ProvisionError::validation(
                "--api-token",
                "expected user@realm!tokenid=secret",
            ));
        }
        for (flag, value) in [("--image", &self.image), ("--image-tag", &self.image_tag), ("--bridge", &self.bridge)] {
            if value.trim().is_empty() || value.chars().any(char::is_whitespace) {
                return Err(ProvisionError::validation(flag, "must be a non-empty value without spaces"));
            }
        }

        let firewall_source = match self.firewall_source.trim() {
            "" | "any" => None,
            other => Some(other.to_string()),
        };
        let interfaces = parse_interfaces(self.interfaces)?;
        let ca_file = self
            .ca_file
            .or_else(|| Path::new(DEFAULT_CA_FILE).exists().then(|| PathBuf::from(DEFAULT_CA_FILE)));

        Ok(ProvisioningConfig {
            api_url: self.api_url,
            api_token: self.api_token,
            ca_file,
            node: non_empty(self.node),
            name: CANONICAL_NAME.to_string(),
            instance_id: self.instance_id,
            memory_mb: self.memory,
            cores: self.cores,
            rootfs_gb: self.disk_gb,
            api_key: non_empty(self.api_key),
            bridge: self.bridge,
            vlan: self.vlan,
            port: self.port,
            storage: non_empty(self.storage),
            template_storage: non_empty(self.template_storage),
            static_ip: non_empty(self.static_ip),
            gateway: non_empty(self.gateway),
            image: self.image,
            image_tag: self.image_tag,
            os_family: self.os_family,
            interfaces,
            firewall_source,
            skip_api_user: self.skip_api_user,
            skip_network_check: self.skip_network_check,
            auto_update: self.auto_update,
            environment: self.environment,
            workers: self.workers,
            tls: !self.no_tls,
            state_file: self.state_file,
            data_root: self.data_root,
            dry_run: self.dry_run,
            uninstall: self.uninstall,
            assume_yes: self.yes,
            debug: self.debug,
            poll: PollSettings::default(),
        })
    }
}

impl ProvisioningConfig {
    /// Full image reference
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.image_tag)
    }

    /// Host directory mounted at `/etc/provider-node` in the workload
    pub fn config_dir(&self) -> PathBuf {
        self.data_root.join("config")
    }

    /// Host directory mounted at `/var/lib/provider-node` in the workload
    pub fn data_dir(&self) -> PathBuf {
        self.data_root.join("data")
    }

    /// Host path of the service configuration file
    pub fn service_env_path(&self) -> PathBuf {
        self.config_dir().join(format!("{}.env", self.name))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Flag value to interface list. No names means "use the state file";
/// `none` means "no forwarding".
fn parse_interfaces(raw: Vec<String>) -> Result<Option<Vec<String>>, ProvisionError> {
    let names: Vec<String> = raw
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    if names.is_empty() {
        return Ok(None);
    }
    let cleared = names.iter().filter(|n| n.eq_ignore_ascii_case("none")).count();
    match cleared {
        0 => Ok(Some(names)),
        n if n == names.len() => Ok(Some(Vec::new())),
        _ => Err(ProvisionError::validation(
            "--interfaces",
            "`none` cannot be combined with interface names",
        )),
    }
}

//! Proxmox VE API models
//!
//! These models match the JSON returned under `/api2/json`. The platform is
//! inconsistent about numeric and boolean encodings (`1`, `"1"`, `true`), so
//! the fields that vary are decoded with the tolerant helpers at the bottom.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Every `/api2/json` response wraps its payload in a `data` member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub data: T,
}

/// Node as returned by `GET /nodes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeListItem {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Entry from `GET /cluster/resources`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResource {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default, deserialize_with = "de_opt_u32")]
    pub vmid: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ClusterResource {
    /// True for containers and virtual machines (the entries that own a vmid)
    pub fn is_guest(&self) -> bool {
        matches!(self.resource_type.as_str(), "lxc" | "qemu")
    }
}

/// Guest entry from `GET /nodes/{node}/lxc` or `GET /nodes/{node}/qemu`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestSummary {
    #[serde(deserialize_with = "de_u32")]
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Storage entry from `GET /nodes/{node}/storage`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStatus {
    pub storage: String,
    #[serde(rename = "type", default)]
    pub storage_type: Option<String>,
    /// Comma separated content kinds, e.g. `rootdir,images,vztmpl`
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "de_flag")]
    pub active: bool,
    #[serde(default = "default_true", deserialize_with = "de_flag")]
    pub enabled: bool,
    #[serde(default)]
    pub avail: Option<u64>,
}

impl StorageStatus {
    /// Whether the storage advertises the given content kind
    pub fn supports(&self, content_kind: &str) -> bool {
        self.content
            .split(',')
            .map(str::trim)
            .any(|kind| kind == content_kind)
    }
}

/// Volume from `GET /nodes/{node}/storage/{storage}/content`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageContentItem {
    /// Volume id, e.g. `local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst`
    pub volid: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Appliance catalog entry from `GET /nodes/{node}/aplinfo`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AplInfoEntry {
    /// Template file name, e.g. `debian-12-standard_12.7-1_amd64.tar.zst`
    pub template: String,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Network device from `GET /nodes/{node}/network`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDevice {
    pub iface: String,
    #[serde(rename = "type", default)]
    pub device_type: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    pub active: bool,
}

/// Container state from `GET /nodes/{node}/lxc/{vmid}/status/current`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    #[serde(deserialize_with = "de_u32")]
    pub vmid: u32,
    pub status: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Task state from `GET /nodes/{node}/tasks/{upid}/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// `running` or `stopped`
    pub status: String,
    /// Present once stopped; `OK` on success
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        self.status == "stopped"
    }

    pub fn succeeded(&self) -> bool {
        self.is_finished() && self.exitstatus.as_deref() == Some("OK")
    }
}

/// Parameters for `POST /nodes/{node}/lxc`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub vmid: u32,
    pub hostname: String,
    /// Volume id of the template, e.g. `local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst`
    pub ostemplate: String,
    pub storage: String,
    pub rootfs_gb: u32,
    pub memory_mb: u32,
    pub cores: u32,
    /// Fully rendered `net0` value
    pub net0: String,
    pub unprivileged: bool,
    pub features: Option<String>,
    pub onboot: bool,
}

impl CreateContainerRequest {
    /// Form parameters as the API expects them
    pub fn to_form(&self) -> Vec<(String, String)> {
        let mut form = vec![
            ("vmid".to_string(), self.vmid.to_string()),
            ("hostname".to_string(), self.hostname.clone()),
            ("ostemplate".to_string(), self.ostemplate.clone()),
            ("storage".to_string(), self.storage.clone()),
            (
                "rootfs".to_string(),
                format!("{}:{}", self.storage, self.rootfs_gb),
            ),
            ("memory".to_string(), self.memory_mb.to_string()),
            ("cores".to_string(), self.cores.to_string()),
            ("net0".to_string(), self.net0.clone()),
            (
                "unprivileged".to_string(),
                bool_param(self.unprivileged).to_string(),
            ),
            ("onboot".to_string(), bool_param(self.onboot).to_string()),
            ("start".to_string(), "0".to_string()),
        ];
        if let Some(features) = &self.features {
            form.push(("features".to_string(), features.clone()));
        }
        form
    }
}

/// Role from `GET /access/roles`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub roleid: String,
    /// Comma separated privilege list
    #[serde(default)]
    pub privs: String,
    #[serde(default, deserialize_with = "de_flag")]
    pub special: bool,
}

impl Role {
    pub fn privileges(&self) -> Vec<String> {
        split_list(&self.privs)
    }
}

/// Group from `GET /access/groups`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub groupid: String,
    #[serde(default)]
    pub comment: Option<String>,
}

/// User from `GET /access/users`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub userid: String,
    #[serde(default)]
    pub groups: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Token from `GET /access/users/{userid}/token`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiToken {
    pub tokenid: String,
    #[serde(default, deserialize_with = "de_flag")]
    pub privsep: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Response of `POST /access/users/{userid}/token/{tokenid}`.
///
/// `value` is the secret; the platform never returns it again.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedToken {
    #[serde(rename = "full-tokenid")]
    pub full_tokenid: String,
    pub value: String,
}

impl fmt::Debug for CreatedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreatedToken")
            .field("full_tokenid", &self.full_tokenid)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Which firewall rule set an operation addresses
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FirewallTarget {
    /// Host firewall of a cluster node
    Node { node: String },
    /// Guest firewall of a container
    Container { node: String, vmid: u32 },
}

impl FirewallTarget {
    /// API path of the rule list, relative to `/api2/json`
    pub fn rules_path(&self) -> String {
        match self {
            FirewallTarget::Node { node } => format!("/nodes/{}/firewall/rules", node),
            FirewallTarget::Container { node, vmid } => {
                format!("/nodes/{}/lxc/{}/firewall/rules", node, vmid)
            }
        }
    }
}

impl fmt::Display for FirewallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallTarget::Node { node } => write!(f, "node {}", node),
            FirewallTarget::Container { node, vmid } => write!(f, "container {} on {}", vmid, node),
        }
    }
}

/// Firewall rule as listed by `GET .../firewall/rules`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(deserialize_with = "de_u32")]
    pub pos: u32,
    #[serde(rename = "type")]
    pub direction: String,
    pub action: String,
    #[serde(default)]
    pub proto: Option<String>,
    #[serde(default)]
    pub dport: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    pub enable: bool,
}

/// Parameters for `POST .../firewall/rules`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallRuleSpec {
    pub direction: String,
    pub action: String,
    pub proto: String,
    pub dport: String,
    pub source: Option<String>,
    pub comment: String,
}

impl FirewallRuleSpec {
    pub fn to_form(&self) -> Vec<(String, String)> {
        let mut form = vec![
            ("type".to_string(), self.direction.clone()),
            ("action".to_string(), self.action.clone()),
            ("proto".to_string(), self.proto.clone()),
            ("dport".to_string(), self.dport.clone()),
            ("comment".to_string(), self.comment.clone()),
            ("enable".to_string(), "1".to_string()),
        ];
        if let Some(source) = &self.source {
            form.push(("source".to_string(), source.clone()));
        }
        form
    }

    /// Whether a listed rule is equivalent to this spec
    pub fn matches(&self, rule: &FirewallRule) -> bool {
        rule.direction == self.direction
            && rule.action == self.action
            && rule.proto.as_deref() == Some(self.proto.as_str())
            && rule.dport.as_deref() == Some(self.dport.as_str())
            && rule.source == self.source
            && rule.comment.as_deref() == Some(self.comment.as_str())
            && rule.enable
    }
}

pub(crate) fn bool_param(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c| c == ',' || c == ';' || c == ' ')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_true() -> bool {
    true
}

fn de_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    value_to_u32(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {}", value)))
}

fn de_opt_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => value_to_u32(&v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {}", v))),
    }
}

fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Bool(b)) => b,
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0) != 0,
        Some(serde_json::Value::String(s)) => matches!(s.as_str(), "1" | "true" | "yes"),
        _ => false,
    })
}

fn value_to_u32(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_summary_accepts_string_and_numeric_vmid() {
        let numeric: GuestSummary = serde_json::from_str(r#"{"vmid":101,"name":"a"}"#).unwrap();
        let string: GuestSummary = serde_json::from_str(r#"{"vmid":"102","status":"running"}"#).unwrap();
        assert_eq!(numeric.vmid, 101);
        assert_eq!(string.vmid, 102);
        assert_eq!(string.status.as_deref(), Some("running"));
    }

    #[test]
    fn storage_flags_and_content_kinds() {
        let storage: StorageStatus = serde_json::from_str(
            r#"{"storage":"local","content":"iso,vztmpl,backup","active":1,"type":"dir"}"#,
        )
        .unwrap();
        assert!(storage.active);
        assert!(storage.enabled);
        assert!(storage.supports("vztmpl"));
        assert!(!storage.supports("rootdir"));
        assert!(!storage.supports("tmpl"));
    }

    #[test]
    fn cluster_resource_without_vmid() {
        let storage: ClusterResource = serde_json::from_str(
            r#"{"id":"storage/pve1/local","type":"storage","node":"pve1","status":"available"}"#,
        )
        .unwrap();
        assert_eq!(storage.vmid, None);
        assert!(!storage.is_guest());
    }

    #[test]
    fn created_token_debug_hides_secret() {
        let token = CreatedToken {
            full_tokenid: "svc@pve!main".to_string(),
            value: "secret-value".to_string(),
        };
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains("secret-value"));
        assert!(rendered.contains("svc@pve!main"));
    }

    #[test]
    fn task_status_success_requires_ok_exit() {
        let ok = TaskStatus { status: "stopped".to_string(), exitstatus: Some("OK".to_string()) };
        let failed = TaskStatus {
            status: "stopped".to_string(),
            exitstatus: Some("command 'lxc-start' failed".to_string()),
        };
        let running = TaskStatus { status: "running".to_string(), exitstatus: None };
        assert!(ok.succeeded());
        assert!(failed.is_finished() && !failed.succeeded());
        assert!(!running.is_finished());
    }

    #[test]
    fn container_request_renders_rootfs_from_storage() {
        let request = CreateContainerRequest {
            vmid: 105,
            hostname: "provider-node".to_string(),
            ostemplate: "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst".to_string(),
            storage: "local-lvm".to_string(),
            rootfs_gb: 16,
            memory_mb: 2048,
            cores: 2,
            net0: "name=eth0,bridge=vmbr0,ip=dhcp".to_string(),
            unprivileged: true,
            features: Some("nesting=1,keyctl=1".to_string()),
            onboot: true,
        };
        let form = request.to_form();
        assert!(form.contains(&("rootfs".to_string(), "local-lvm:16".to_string())));
        assert!(form.contains(&("unprivileged".to_string(), "1".to_string())));
        assert!(form.contains(&("start".to_string(), "0".to_string())));
    }
}

//! PveClient trait for mocking
//!
//! This trait abstracts the PveClient to enable mocking in unit tests.
//! The concrete PveClient implements this trait, and tests can use MockPveClient.

use crate::error::PveError;
use crate::models::*;

/// Trait for Proxmox VE API client operations
///
/// Operations that start platform tasks (create, start, stop, destroy,
/// template download) return the task UPID; callers await it with
/// [`PveClientTrait::task_status`].
#[async_trait::async_trait]
pub trait PveClientTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Validate the API token
    async fn validate_token(&self) -> Result<(), PveError>;

    // Cluster and node inventory
    async fn list_nodes(&self) -> Result<Vec<NodeListItem>, PveError>;
    async fn cluster_resources(&self, resource_type: Option<&str>) -> Result<Vec<ClusterResource>, PveError>;
    async fn list_containers(&self, node: &str) -> Result<Vec<GuestSummary>, PveError>;
    async fn list_vms(&self, node: &str) -> Result<Vec<GuestSummary>, PveError>;
    async fn list_bridges(&self, node: &str) -> Result<Vec<NetworkDevice>, PveError>;

    // Storage and templates
    async fn list_storage(&self, node: &str) -> Result<Vec<StorageStatus>, PveError>;
    async fn list_storage_content(&self, node: &str, storage: &str, content: &str) -> Result<Vec<StorageContentItem>, PveError>;
    async fn list_appliance_templates(&self, node: &str) -> Result<Vec<AplInfoEntry>, PveError>;
    async fn download_appliance_template(&self, node: &str, storage: &str, template: &str) -> Result<String, PveError>;

    // Container lifecycle
    async fn create_container(&self, node: &str, request: &CreateContainerRequest) -> Result<String, PveError>;
    async fn update_container_config(&self, node: &str, vmid: u32, params: &[(String, String)]) -> Result<(), PveError>;
    async fn container_status(&self, node: &str, vmid: u32) -> Result<ContainerStatus, PveError>;
    async fn start_container(&self, node: &str, vmid: u32) -> Result<String, PveError>;
    async fn stop_container(&self, node: &str, vmid: u32) -> Result<String, PveError>;
    async fn destroy_container(&self, node: &str, vmid: u32) -> Result<String, PveError>;
    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus, PveError>;

    // Access control
    async fn list_roles(&self) -> Result<Vec<Role>, PveError>;
    async fn create_role(&self, roleid: &str, privs: &[String]) -> Result<(), PveError>;
    async fn update_role(&self, roleid: &str, privs: &[String]) -> Result<(), PveError>;
    async fn list_groups(&self) -> Result<Vec<Group>, PveError>;
    async fn create_group(&self, groupid: &str, comment: Option<&str>) -> Result<(), PveError>;
    async fn list_users(&self) -> Result<Vec<User>, PveError>;
    async fn create_user(&self, userid: &str, groups: &[String], comment: Option<&str>) -> Result<(), PveError>;
    async fn set_acl(&self, path: &str, roles: &[String], groups: &[String], propagate: bool) -> Result<(), PveError>;
    async fn list_tokens(&self, userid: &str) -> Result<Vec<ApiToken>, PveError>;
    async fn create_token(&self, userid: &str, tokenid: &str, privsep: bool, comment: Option<&str>) -> Result<CreatedToken, PveError>;

    // Firewall
    async fn list_firewall_rules(&self, target: &FirewallTarget) -> Result<Vec<FirewallRule>, PveError>;
    async fn create_firewall_rule(&self, target: &FirewallTarget, rule: &FirewallRuleSpec) -> Result<(), PveError>;
    async fn delete_firewall_rule(&self, target: &FirewallTarget, pos: u32) -> Result<(), PveError>;
    async fn set_container_firewall_enabled(&self, node: &str, vmid: u32, enabled: bool) -> Result<(), PveError>;
}

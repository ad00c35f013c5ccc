//! Mock PveClient for unit testing
//!
//! This module provides a mock implementation of PveClientTrait that can be used
//! in unit tests without requiring a running Proxmox VE host.
//!
//! The mock is organized into domain-specific modules:
//! - `inventory.rs` - nodes, guests, storage, templates, container lifecycle, tasks
//! - `access.rs` - roles, groups, users, ACLs, API tokens
//! - `firewall.rs` - node and container firewall rule sets

mod access;
mod firewall;
mod inventory;

use crate::error::PveError;
use crate::models::*;
use crate::pve_trait::PveClientTrait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A container held by the mock platform
#[derive(Debug, Clone, PartialEq)]
pub struct MockContainer {
    pub node: String,
    pub name: String,
    pub status: String,
    /// Creation parameters plus later config updates
    pub config: BTreeMap<String, String>,
}

/// ACL entry recorded by `set_acl`
#[derive(Debug, Clone, PartialEq)]
pub struct MockAcl {
    pub path: String,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
    pub propagate: bool,
}

/// Mock PveClient for testing
///
/// This mock stores resources in memory and can be configured to fail
/// individual operations by name (e.g. `"cluster_resources"`), which the
/// provisioner tests use to exercise fallback and rollback paths. Every
/// mutating call is recorded in order and can be inspected with [`MockPveClient::calls`].
#[derive(Clone)]
pub struct MockPveClient {
    pub(crate) base_url: String,
    pub(crate) nodes: Arc<Mutex<Vec<NodeListItem>>>,
    pub(crate) containers: Arc<Mutex<BTreeMap<u32, MockContainer>>>,
    pub(crate) vms: Arc<Mutex<BTreeMap<u32, (String, String)>>>,
    pub(crate) storages: Arc<Mutex<Vec<StorageStatus>>>,
    pub(crate) storage_content: Arc<Mutex<HashMap<String, Vec<StorageContentItem>>>>,
    pub(crate) appliances: Arc<Mutex<Vec<AplInfoEntry>>>,
    pub(crate) bridges: Arc<Mutex<Vec<NetworkDevice>>>,
    pub(crate) roles: Arc<Mutex<BTreeMap<String, Role>>>,
    pub(crate) groups: Arc<Mutex<BTreeMap<String, Group>>>,
    pub(crate) users: Arc<Mutex<BTreeMap<String, User>>>,
    pub(crate) tokens: Arc<Mutex<HashMap<String, Vec<ApiToken>>>>,
    pub(crate) acls: Arc<Mutex<Vec<MockAcl>>>,
    pub(crate) firewall: Arc<Mutex<HashMap<FirewallTarget, Vec<FirewallRule>>>>,
    pub(crate) failing: Arc<Mutex<HashSet<String>>>,
    pub(crate) calls: Arc<Mutex<Vec<String>>>,
    // Counter for generating task ids
    pub(crate) next_task: Arc<Mutex<u64>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockPveClient {
    /// Create a new mock client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            nodes: Arc::new(Mutex::new(Vec::new())),
            containers: Arc::new(Mutex::new(BTreeMap::new())),
            vms: Arc::new(Mutex::new(BTreeMap::new())),
            storages: Arc::new(Mutex::new(Vec::new())),
            storage_content: Arc::new(Mutex::new(HashMap::new())),
            appliances: Arc::new(Mutex::new(Vec::new())),
            bridges: Arc::new(Mutex::new(Vec::new())),
            roles: Arc::new(Mutex::new(BTreeMap::new())),
            groups: Arc::new(Mutex::new(BTreeMap::new())),
            users: Arc::new(Mutex::new(BTreeMap::new())),
            tokens: Arc::new(Mutex::new(HashMap::new())),
            acls: Arc::new(Mutex::new(Vec::new())),
            firewall: Arc::new(Mutex::new(HashMap::new())),
            failing: Arc::new(Mutex::new(HashSet::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            next_task: Arc::new(Mutex::new(1)),
        }
    }

    /// Add a cluster node (for test setup)
    pub fn add_node(&self, node: &str) {
        lock(&self.nodes).push(NodeListItem {
            node: node.to_string(),
            status: Some("online".to_string()),
        });
    }

    /// Add an existing container (for test setup)
    pub fn add_container(&self, vmid: u32, node: &str, name: &str, status: &str) {
        lock(&self.containers).insert(
            vmid,
            MockContainer {
                node: node.to_string(),
                name: name.to_string(),
                status: status.to_string(),
                config: BTreeMap::new(),
            },
        );
    }

    /// Add an existing virtual machine (for test setup)
    pub fn add_vm(&self, vmid: u32, node: &str, name: &str) {
        lock(&self.vms).insert(vmid, (node.to_string(), name.to_string()));
    }

    /// Add a storage reported on every node (for test setup)
    pub fn add_storage(&self, storage: &str, content: &str, active: bool) {
        lock(&self.storages).push(StorageStatus {
            storage: storage.to_string(),
            storage_type: Some("dir".to_string()),
            content: content.to_string(),
            active,
            enabled: true,
            avail: Some(100 * 1024 * 1024 * 1024),
        });
    }

    /// Add a volume to a storage (for test setup)
    pub fn add_storage_content(&self, storage: &str, volid: &str, content: &str) {
        lock(&self.storage_content)
            .entry(storage.to_string())
            .or_default()
            .push(StorageContentItem {
                volid: volid.to_string(),
                content: Some(content.to_string()),
                size: None,
            });
    }

    /// Add an appliance catalog entry (for test setup)
    pub fn add_appliance(&self, template: &str, os: &str) {
        lock(&self.appliances).push(AplInfoEntry {
            template: template.to_string(),
            os: Some(os.to_string()),
            section: Some("system".to_string()),
            version: None,
        });
    }

    /// Add a bridge device on every node (for test setup)
    pub fn add_bridge(&self, iface: &str) {
        lock(&self.bridges).push(NetworkDevice {
            iface: iface.to_string(),
            device_type: Some("bridge".to_string()),
            active: true,
        });
    }

    /// Add an existing role (for test setup)
    pub fn add_role(&self, roleid: &str, privs: &[&str]) {
        lock(&self.roles).insert(
            roleid.to_string(),
            Role {
                roleid: roleid.to_string(),
                privs: privs.join(","),
                special: false,
            },
        );
    }

    /// Add an existing user (for test setup)
    pub fn add_user(&self, userid: &str) {
        lock(&self.users).insert(
            userid.to_string(),
            User {
                userid: userid.to_string(),
                groups: None,
                comment: None,
            },
        );
    }

    /// Add an existing API token (for test setup)
    pub fn add_token(&self, userid: &str, tokenid: &str) {
        lock(&self.tokens)
            .entry(userid.to_string())
            .or_default()
            .push(ApiToken {
                tokenid: tokenid.to_string(),
                privsep: false,
                comment: None,
            });
    }

    /// Make every call of the named operation fail with an API error
    pub fn fail_operation(&self, operation: &str) {
        lock(&self.failing).insert(operation.to_string());
    }

    /// Stop failing the named operation
    pub fn clear_failure(&self, operation: &str) {
        lock(&self.failing).remove(operation);
    }

    /// Snapshot of a container
    pub fn container(&self, vmid: u32) -> Option<MockContainer> {
        lock(&self.containers).get(&vmid).cloned()
    }

    /// Ids of all containers currently held
    pub fn container_ids(&self) -> Vec<u32> {
        lock(&self.containers).keys().copied().collect()
    }

    /// Snapshot of a firewall rule set
    pub fn firewall_rules(&self, target: &FirewallTarget) -> Vec<FirewallRule> {
        lock(&self.firewall).get(target).cloned().unwrap_or_default()
    }

    /// Snapshot of a role
    pub fn role(&self, roleid: &str) -> Option<Role> {
        lock(&self.roles).get(roleid).cloned()
    }

    /// Snapshot of a user's tokens
    pub fn tokens_for(&self, userid: &str) -> Vec<ApiToken> {
        lock(&self.tokens).get(userid).cloned().unwrap_or_default()
    }

    /// ACL entries set so far
    pub fn acls(&self) -> Vec<MockAcl> {
        lock(&self.acls).clone()
    }

    /// Mutating calls in the order they were made, e.g. `destroy_container:105`
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of recorded calls that start with `prefix`
    pub fn call_count(&self, prefix: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub(crate) fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }

    pub(crate) fn check(&self, operation: &str) -> Result<(), PveError> {
        if lock(&self.failing).contains(operation) {
            return Err(PveError::Api {
                status: 500,
                message: format!("{} failed (injected)", operation),
            });
        }
        Ok(())
    }

    pub(crate) fn next_upid(&self, node: &str, kind: &str, vmid: u32) -> String {
        let mut counter = lock(&self.next_task);
        let current = *counter;
        *counter += 1;
        format!("UPID:{}:{:08X}:{}:{}:root@pam:", node, current, kind, vmid)
    }
}

#[async_trait::async_trait]
impl PveClientTrait for MockPveClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn validate_token(&self) -> Result<(), PveError> {
        self.check("validate_token")
    }

    // Inventory - delegated to inventory module
    async fn list_nodes(&self) -> Result<Vec<NodeListItem>, PveError> {
        inventory::list_nodes(self).await
    }

    async fn cluster_resources(&self, resource_type: Option<&str>) -> Result<Vec<ClusterResource>, PveError> {
        inventory::cluster_resources(self, resource_type).await
    }

    async fn list_containers(&self, node: &str) -> Result<Vec<GuestSummary>, PveError> {
        inventory::list_containers(self, node).await
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<GuestSummary>, PveError> {
        inventory::list_vms(self, node).await
    }

    async fn list_bridges(&self, node: &str) -> Result<Vec<NetworkDevice>, PveError> {
        inventory::list_bridges(self, node).await
    }

    async fn list_storage(&self, node: &str) -> Result<Vec<StorageStatus>, PveError> {
        inventory::list_storage(self, node).await
    }

    async fn list_storage_content(&self, node: &str, storage: &str, content: &str) -> Result<Vec<StorageContentItem>, PveError> {
        inventory::list_storage_content(self, node, storage, content).await
    }

    async fn list_appliance_templates(&self, node: &str) -> Result<Vec<AplInfoEntry>, PveError> {
        inventory::list_appliance_templates(self, node).await
    }

    async fn download_appliance_template(&self, node: &str, storage: &str, template: &str) -> Result<String, PveError> {
        inventory::download_appliance_template(self, node, storage, template).await
    }

    async fn create_container(&self, node: &str, request: &CreateContainerRequest) -> Result<String, PveError> {
        inventory::create_container(self, node, request).await
    }

    async fn update_container_config(&self, node: &str, vmid: u32, params: &[(String, String)]) -> Result<(), PveError> {
        inventory::update_container_config(self, node, vmid, params).await
    }

    async fn container_status(&self, node: &str, vmid: u32) -> Result<ContainerStatus, PveError> {
        inventory::container_status(self, node, vmid).await
    }

    async fn start_container(&self, node: &str, vmid: u32) -> Result<String, PveError> {
        inventory::set_container_state(self, node, vmid, "start", "running").await
    }

    async fn stop_container(&self, node: &str, vmid: u32) -> Result<String, PveError> {
        inventory::set_container_state(self, node, vmid, "stop", "stopped").await
    }

    async fn destroy_container(&self, node: &str, vmid: u32) -> Result<String, PveError> {
        inventory::destroy_container(self, node, vmid).await
    }

    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus, PveError> {
        inventory::task_status(self, node, upid).await
    }

    // Access control - delegated to access module
    async fn list_roles(&self) -> Result<Vec<Role>, PveError> {
        access::list_roles(self).await
    }

    async fn create_role(&self, roleid: &str, privs: &[String]) -> Result<(), PveError> {
        access::create_role(self, roleid, privs).await
    }

    async fn update_role(&self, roleid: &str, privs: &[String]) -> Result<(), PveError> {
        access::update_role(self, roleid, privs).await
    }

    async fn list_groups(&self) -> Result<Vec<Group>, PveError> {
        access::list_groups(self).await
    }

    async fn create_group(&self, groupid: &str, comment: Option<&str>) -> Result<(), PveError> {
        access::create_group(self, groupid, comment).await
    }

    async fn list_users(&self) -> Result<Vec<User>, PveError> {
        access::list_users(self).await
    }

    async fn create_user(&self, userid: &str, groups: &[String], comment: Option<&str>) -> Result<(), PveError> {
        access::create_user(self, userid, groups, comment).await
    }

    async fn set_acl(&self, path: &str, roles: &[String], groups: &[String], propagate: bool) -> Result<(), PveError> {
        access::set_acl(self, path, roles, groups, propagate).await
    }

    async fn list_tokens(&self, userid: &str) -> Result<Vec<ApiToken>, PveError> {
        access::list_tokens(self, userid).await
    }

    async fn create_token(&self, userid: &str, tokenid: &str, privsep: bool, comment: Option<&str>) -> Result<CreatedToken, PveError> {
        access::create_token(self, userid, tokenid, privsep, comment).await
    }

    // Firewall - delegated to firewall module
    async fn list_firewall_rules(&self, target: &FirewallTarget) -> Result<Vec<FirewallRule>, PveError> {
        firewall::list_rules(self, target).await
    }

    async fn create_firewall_rule(&self, target: &FirewallTarget, rule: &FirewallRuleSpec) -> Result<(), PveError> {
        firewall::create_rule(self, target, rule).await
    }

    async fn delete_firewall_rule(&self, target: &FirewallTarget, pos: u32) -> Result<(), PveError> {
        firewall::delete_rule(self, target, pos).await
    }

    async fn set_container_firewall_enabled(&self, node: &str, vmid: u32, enabled: bool) -> Result<(), PveError> {
        firewall::set_container_enabled(self, node, vmid, enabled).await
    }
}

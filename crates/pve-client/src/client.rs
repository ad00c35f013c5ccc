//! Proxmox VE API client
//!
//! Implements the REST client against `/api2/json` using API-token
//! authentication. Paths follow the upstream API viewer layout
//! (`/cluster/resources`, `/nodes/{node}/lxc`, `/access/...`).

use crate::common::HttpClient;
use crate::error::PveError;
use crate::models::*;
use crate::pve_trait::PveClientTrait;
use reqwest::{Certificate, Client};
use std::time::Duration;
use tracing::debug;

/// Proxmox VE API client
pub struct PveClient {
    http: HttpClient,
}

impl PveClient {
    /// Create a new Proxmox VE client
    ///
    /// # Arguments
    /// * `base_url` - API base URL (e.g., "https://localhost:8006")
    /// * `token` - API token as `user@realm!tokenid=secret`
    pub fn new(base_url: String, token: String) -> Result<Self, PveError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(PveError::Http)?;

        Ok(Self {
            http: HttpClient::new(client, base_url, token),
        })
    }

    /// Create a client that trusts an additional CA certificate (PEM).
    ///
    /// Nodes serve a certificate signed by the cluster CA
    /// (`/etc/pve/pve-root-ca.pem`), which is not in the public root store.
    pub fn with_ca_certificate(base_url: String, token: String, ca_pem: &[u8]) -> Result<Self, PveError> {
        let certificate = Certificate::from_pem(ca_pem).map_err(PveError::Http)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .add_root_certificate(certificate)
            .build()
            .map_err(PveError::Http)?;

        Ok(Self {
            http: HttpClient::new(client, base_url, token),
        })
    }

    fn enc(segment: &str) -> String {
        urlencoding::encode(segment).into_owned()
    }
}

#[async_trait::async_trait]
impl PveClientTrait for PveClient {
    fn base_url(&self) -> &str {
        self.http.base_url()
    }

    async fn validate_token(&self) -> Result<(), PveError> {
        debug!("Validating Proxmox API token and connectivity");
        let _: serde_json::Value = self.http.get("/version").await?;
        debug!("Token validated successfully");
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeListItem>, PveError> {
        self.http.get("/nodes").await
    }

    async fn cluster_resources(&self, resource_type: Option<&str>) -> Result<Vec<ClusterResource>, PveError> {
        let path = match resource_type {
            Some(kind) => format!(
                "/cluster/resources?{}",
                self.http.build_query_string(&[("type", kind)])
            ),
            None => "/cluster/resources".to_string(),
        };
        self.http.get(&path).await
    }

    async fn list_containers(&self, node: &str) -> Result<Vec<GuestSummary>, PveError> {
        self.http.get(&format!("/nodes/{}/lxc", Self::enc(node))).await
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<GuestSummary>, PveError> {
        self.http.get(&format!("/nodes/{}/qemu", Self::enc(node))).await
    }

    async fn list_bridges(&self, node: &str) -> Result<Vec<NetworkDevice>, PveError> {
        self.http
            .get(&format!("/nodes/{}/network?type=any_bridge", Self::enc(node)))
            .await
    }

    async fn list_storage(&self, node: &str) -> Result<Vec<StorageStatus>, PveError> {
        self.http
            .get(&format!("/nodes/{}/storage?enabled=1", Self::enc(node)))
            .await
    }

    async fn list_storage_content(&self, node: &str, storage: &str, content: &str) -> Result<Vec<StorageContentItem>, PveError> {
        let path = format!(
            "/nodes/{}/storage/{}/content?{}",
            Self::enc(node),
            Self::enc(storage),
            self.http.build_query_string(&[("content", content)])
        );
        self.http.get(&path).await
    }

    async fn list_appliance_templates(&self, node: &str) -> Result<Vec<AplInfoEntry>, PveError> {
        self.http.get(&format!("/nodes/{}/aplinfo", Self::enc(node))).await
    }

    async fn download_appliance_template(&self, node: &str, storage: &str, template: &str) -> Result<String, PveError> {
        let form = vec![
            ("storage".to_string(), storage.to_string()),
            ("template".to_string(), template.to_string()),
        ];
        self.http
            .post(&format!("/nodes/{}/aplinfo", Self::enc(node)), &form)
            .await
    }

    async fn create_container(&self, node: &str, request: &CreateContainerRequest) -> Result<String, PveError> {
        debug!("Creating container {} on {}", request.vmid, node);
        self.http
            .post(&format!("/nodes/{}/lxc", Self::enc(node)), &request.to_form())
            .await
    }

    async fn update_container_config(&self, node: &str, vmid: u32, params: &[(String, String)]) -> Result<(), PveError> {
        let _: serde_json::Value = self
            .http
            .put(&format!("/nodes/{}/lxc/{}/config", Self::enc(node), vmid), params)
            .await?;
        Ok(())
    }

    async fn container_status(&self, node: &str, vmid: u32) -> Result<ContainerStatus, PveError> {
        self.http
            .get(&format!("/nodes/{}/lxc/{}/status/current", Self::enc(node), vmid))
            .await
    }

    async fn start_container(&self, node: &str, vmid: u32) -> Result<String, PveError> {
        self.http
            .post(&format!("/nodes/{}/lxc/{}/status/start", Self::enc(node), vmid), &[])
            .await
    }

    async fn stop_container(&self, node: &str, vmid: u32) -> Result<String, PveError> {
        self.http
            .post(&format!("/nodes/{}/lxc/{}/status/stop", Self::enc(node), vmid), &[])
            .await
    }

    async fn destroy_container(&self, node: &str, vmid: u32) -> Result<String, PveError> {
        self.http
            .delete(&format!(
                "/nodes/{}/lxc/{}?purge=1&destroy-unreferenced-disks=1",
                Self::enc(node),
                vmid
            ))
            .await
    }

    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus, PveError> {
        self.http
            .get(&format!("/nodes/{}/tasks/{}/status", Self::enc(node), Self::enc(upid)))
            .await
    }

    async fn list_roles(&self) -> Result<Vec<Role>, PveError> {
        self.http.get("/access/roles").await
    }

    async fn create_role(&self, roleid: &str, privs: &[String]) -> Result<(), PveError> {
        let form = vec![
            ("roleid".to_string(), roleid.to_string()),
            ("privs".to_string(), privs.join(",")),
        ];
        let _: serde_json::Value = self.http.post("/access/roles", &form).await?;
        Ok(())
    }

    async fn update_role(&self, roleid: &str, privs: &[String]) -> Result<(), PveError> {
        let form = vec![("privs".to_string(), privs.join(","))];
        let _: serde_json::Value = self
            .http
            .put(&format!("/access/roles/{}", Self::enc(roleid)), &form)
            .await?;
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<Group>, PveError> {
        self.http.get("/access/groups").await
    }

    async fn create_group(&self, groupid: &str, comment: Option<&str>) -> Result<(), PveError> {
        let mut form = vec![("groupid".to_string(), groupid.to_string())];
        if let Some(comment) = comment {
            form.push(("comment".to_string(), comment.to_string()));
        }
        let _: serde_json::Value = self.http.post("/access/groups", &form).await?;
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>, PveError> {
        self.http.get("/access/users").await
    }

    async fn create_user(&self, userid: &str, groups: &[String], comment: Option<&str>) -> Result<(), PveError> {
        let mut form = vec![("userid".to_string(), userid.to_string())];
        if !groups.is_empty() {
            form.push(("groups".to_string(), groups.join(",")));
        }
        if let Some(comment) = comment {
            form.push(("comment".to_string(), comment.to_string()));
        }
        let _: serde_json::Value = self.http.post("/access/users", &form).await?;
        Ok(())
    }

    async fn set_acl(&self, path: &str, roles: &[String], groups: &[String], propagate: bool) -> Result<(), PveError> {
        let form = vec![
            ("path".to_string(), path.to_string()),
            ("roles".to_string(), roles.join(",")),
            ("groups".to_string(), groups.join(",")),
            ("propagate".to_string(), bool_param(propagate).to_string()),
        ];
        let _: serde_json::Value = self.http.put("/access/acl", &form).await?;
        Ok(())
    }

    async fn list_tokens(&self, userid: &str) -> Result<Vec<ApiToken>, PveError> {
        self.http
            .get(&format!("/access/users/{}/token", Self::enc(userid)))
            .await
    }

    async fn create_token(&self, userid: &str, tokenid: &str, privsep: bool, comment: Option<&str>) -> Result<CreatedToken, PveError> {
        let mut form = vec![("privsep".to_string(), bool_param(privsep).to_string())];
        if let Some(comment) = comment {
            form.push(("comment".to_string(), comment.to_string()));
        }
        self.http
            .post(
                &format!("/access/users/{}/token/{}", Self::enc(userid), Self::enc(tokenid)),
                &form,
            )
            .await
    }

    async fn list_firewall_rules(&self, target: &FirewallTarget) -> Result<Vec<FirewallRule>, PveError> {
        self.http.get(&target.rules_path()).await
    }

    async fn create_firewall_rule(&self, target: &FirewallTarget, rule: &FirewallRuleSpec) -> Result<(), PveError> {
        let _: serde_json::Value = self.http.post(&target.rules_path(), &rule.to_form()).await?;
        Ok(())
    }

    async fn delete_firewall_rule(&self, target: &FirewallTarget, pos: u32) -> Result<(), PveError> {
        let _: serde_json::Value = self
            .http
            .delete(&format!("{}/{}", target.rules_path(), pos))
            .await?;
        Ok(())
    }

    async fn set_container_firewall_enabled(&self, node: &str, vmid: u32, enabled: bool) -> Result<(), PveError> {
        let form = vec![("enable".to_string(), bool_param(enabled).to_string())];
        let _: serde_json::Value = self
            .http
            .put(&format!("/nodes/{}/lxc/{}/firewall/options", Self::enc(node), vmid), &form)
            .await?;
        Ok(())
    }
}

//! Guest inventory
//!
//! One read path for "which containers and VMs exist": the cluster-wide
//! resource list, falling back to the node's own lists when the cluster view
//! is unavailable or empty (standalone nodes, restricted tokens).

use crate::error::ProvisionError;
use pve_client::PveClientTrait;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestKind {
    Container,
    VirtualMachine,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guest {
    pub vmid: u32,
    pub kind: GuestKind,
    pub node: String,
    pub name: Option<String>,
    pub status: Option<String>,
}

impl Guest {
    pub fn is_running(&self) -> bool {
        self.status.as_deref() == Some("running")
    }
}

/// All guests visible from `node`, re-read on every call
pub async fn list_guests(client: &dyn PveClientTrait, node: &str) -> Result<Vec<Guest>, ProvisionError> {
    match client.cluster_resources(Some("vm")).await {
        Ok(resources) if !resources.is_empty() => {
            let guests: Vec<Guest> = resources
                .into_iter()
                .filter(|r| r.is_guest())
                .filter_map(|r| {
                    let kind = if r.resource_type == "lxc" {
                        GuestKind::Container
                    } else {
                        GuestKind::VirtualMachine
                    };
                    Some(Guest {
                        vmid: r.vmid?,
                        kind,
                        node: r.node.unwrap_or_else(|| node.to_string()),
                        name: r.name,
                        status: r.status,
                    })
                })
                .collect();
            debug!("Cluster inventory lists {} guests", guests.len());
            Ok(guests)
        }
        Ok(_) => {
            debug!("Cluster inventory is empty; reading node {} directly", node);
            node_guests(client, node).await
        }
        Err(e) => {
            warn!("Cluster inventory unavailable ({}); reading node {} directly", e, node);
            node_guests(client, node).await
        }
    }
}

async fn node_guests(client: &dyn PveClientTrait, node: &str) -> Result<Vec<Guest>, ProvisionError> {
    let containers = client.list_containers(node).await?;
    let vms = client.list_vms(node).await?;

    let tagged = containers
        .into_iter()
        .map(|g| (g, GuestKind::Container))
        .chain(vms.into_iter().map(|g| (g, GuestKind::VirtualMachine)));
    Ok(tagged
        .map(|(g, kind)| Guest {
            vmid: g.vmid,
            kind,
            node: node.to_string(),
            name: g.name,
            status: g.status,
        })
        .collect())
}

/// Containers on `node` carrying the canonical name
pub async fn find_workloads(
    client: &dyn PveClientTrait,
    node: &str,
    name: &str,
) -> Result<Vec<Guest>, ProvisionError> {
    let mut found: Vec<Guest> = list_guests(client, node)
        .await?
        .into_iter()
        .filter(|g| g.kind == GuestKind::Container && g.node == node && g.name.as_deref() == Some(name))
        .collect();
    found.sort_by_key(|g| g.vmid);
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pve_client::MockPveClient;

    #[tokio::test]
    async fn test_cluster_inventory_includes_other_nodes() {
        let client = MockPveClient::new("https://pve.test:8006");
        client.add_container(100, "pve1", "dns", "running");
        client.add_vm(101, "pve2", "db");

        let guests = list_guests(&client, "pve1").await.unwrap();
        assert_eq!(guests.len(), 2);
        assert!(guests.iter().any(|g| g.vmid == 101 && g.node == "pve2" && g.kind == GuestKind::VirtualMachine));
    }

    #[tokio::test]
    async fn test_falls_back_to_node_lists_when_cluster_view_fails() {
        let client = MockPveClient::new("https://pve.test:8006");
        client.add_container(100, "pve1", "dns", "running");
        client.add_vm(105, "pve1", "db");
        client.fail_operation("cluster_resources");

        let mut ids: Vec<_> = list_guests(&client, "pve1").await.unwrap().iter().map(|g| g.vmid).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![100, 105]);
    }

    #[tokio::test]
    async fn test_fallback_errors_propagate() {
        let client = MockPveClient::new("https://pve.test:8006");
        client.fail_operation("cluster_resources");
        client.fail_operation("list_containers");
        assert!(matches!(list_guests(&client, "pve1").await, Err(ProvisionError::Pve(_))));
    }

    #[tokio::test]
    async fn test_find_workloads_matches_name_and_node() {
        let client = MockPveClient::new("https://pve.test:8006");
        client.add_container(104, "pve1", "provider-node", "stopped");
        client.add_container(102, "pve1", "provider-node", "running");
        client.add_container(103, "pve2", "provider-node", "running");
        client.add_vm(106, "pve1", "provider-node");
        client.add_container(107, "pve1", "provider-node-old", "running");

        let found = find_workloads(&client, "pve1", "provider-node").await.unwrap();
        assert_eq!(found.iter().map(|g| g.vmid).collect::<Vec<_>>(), vec![102, 104]);
        assert!(found[0].is_running());
    }
}

//! Inventory and lifecycle operations for MockPveClient
//!
//! Handles nodes, cluster resources, storage, templates, containers and tasks

use super::{MockContainer, MockPveClient, lock};
use crate::error::PveError;
use crate::models::*;

pub async fn list_nodes(client: &MockPveClient) -> Result<Vec<NodeListItem>, PveError> {
    client.check("list_nodes")?;
    Ok(lock(&client.nodes).clone())
}

pub async fn cluster_resources(client: &MockPveClient, resource_type: Option<&str>) -> Result<Vec<ClusterResource>, PveError> {
    client.check("cluster_resources")?;

    let mut resources = Vec::new();
    if resource_type.is_none() {
        for node in lock(&client.nodes).iter() {
            resources.push(ClusterResource {
                id: format!("node/{}", node.node),
                resource_type: "node".to_string(),
                node: Some(node.node.clone()),
                vmid: None,
                name: None,
                status: node.status.clone(),
            });
        }
    }
    for (vmid, container) in lock(&client.containers).iter() {
        resources.push(ClusterResource {
            id: format!("lxc/{}", vmid),
            resource_type: "lxc".to_string(),
            node: Some(container.node.clone()),
            vmid: Some(*vmid),
            name: Some(container.name.clone()),
            status: Some(container.status.clone()),
        });
    }
    for (vmid, (node, name)) in lock(&client.vms).iter() {
        resources.push(ClusterResource {
            id: format!("qemu/{}", vmid),
            resource_type: "qemu".to_string(),
            node: Some(node.clone()),
            vmid: Some(*vmid),
            name: Some(name.clone()),
            status: Some("stopped".to_string()),
        });
    }
    Ok(resources)
}

pub async fn list_containers(client: &MockPveClient, node: &str) -> Result<Vec<GuestSummary>, PveError> {
    client.check("list_containers")?;
    Ok(lock(&client.containers)
        .iter()
        .filter(|(_, c)| c.node == node)
        .map(|(vmid, c)| GuestSummary {
            vmid: *vmid,
            name: Some(c.name.clone()),
            status: Some(c.status.clone()),
        })
        .collect())
}

pub async fn list_vms(client: &MockPveClient, node: &str) -> Result<Vec<GuestSummary>, PveError> {
    client.check("list_vms")?;
    Ok(lock(&client.vms)
        .iter()
        .filter(|(_, (vm_node, _))| vm_node == node)
        .map(|(vmid, (_, name))| GuestSummary {
            vmid: *vmid,
            name: Some(name.clone()),
            status: Some("stopped".to_string()),
        })
        .collect())
}

pub async fn list_bridges(client: &MockPveClient, _node: &str) -> Result<Vec<NetworkDevice>, PveError> {
    client.check("list_bridges")?;
    Ok(lock(&client.bridges).clone())
}

pub async fn list_storage(client: &MockPveClient, _node: &str) -> Result<Vec<StorageStatus>, PveError> {
    client.check("list_storage")?;
    Ok(lock(&client.storages).clone())
}

pub async fn list_storage_content(client: &MockPveClient, _node: &str, storage: &str, content: &str) -> Result<Vec<StorageContentItem>, PveError> {
    client.check("list_storage_content")?;
    if !lock(&client.storages).iter().any(|s| s.storage == storage) {
        return Err(PveError::NotFound(format!("storage '{}' does not exist", storage)));
    }
    Ok(lock(&client.storage_content)
        .get(storage)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.content.as_deref() == Some(content))
                .cloned()
                .collect()
        })
        .unwrap_or_default())
}

pub async fn list_appliance_templates(client: &MockPveClient, _node: &str) -> Result<Vec<AplInfoEntry>, PveError> {
    client.check("list_appliance_templates")?;
    Ok(lock(&client.appliances).clone())
}

pub async fn download_appliance_template(client: &MockPveClient, node: &str, storage: &str, template: &str) -> Result<String, PveError> {
    client.check("download_appliance_template")?;
    if !lock(&client.appliances).iter().any(|a| a.template == template) {
        return Err(PveError::InvalidRequest(format!("no such template '{}'", template)));
    }
    client.record(format!("download_appliance_template:{}:{}", storage, template));
    client.add_storage_content(storage, &format!("{}:vztmpl/{}", storage, template), "vztmpl");
    Ok(client.next_upid(node, "download", 0))
}

pub async fn create_container(client: &MockPveClient, node: &str, request: &CreateContainerRequest) -> Result<String, PveError> {
    client.check("create_container")?;

    let mut containers = lock(&client.containers);
    if containers.contains_key(&request.vmid) || lock(&client.vms).contains_key(&request.vmid) {
        return Err(PveError::Api {
            status: 500,
            message: format!("CT {} already exists", request.vmid),
        });
    }
    containers.insert(
        request.vmid,
        MockContainer {
            node: node.to_string(),
            name: request.hostname.clone(),
            status: "stopped".to_string(),
            config: request.to_form().into_iter().collect(),
        },
    );
    drop(containers);

    client.record(format!("create_container:{}", request.vmid));
    Ok(client.next_upid(node, "vzcreate", request.vmid))
}

pub async fn update_container_config(client: &MockPveClient, _node: &str, vmid: u32, params: &[(String, String)]) -> Result<(), PveError> {
    client.check("update_container_config")?;
    let mut containers = lock(&client.containers);
    let container = containers
        .get_mut(&vmid)
        .ok_or_else(|| PveError::NotFound(format!("CT {} does not exist", vmid)))?;
    for (key, value) in params {
        container.config.insert(key.clone(), value.clone());
    }
    drop(containers);

    client.record(format!("update_container_config:{}", vmid));
    Ok(())
}

pub async fn container_status(client: &MockPveClient, _node: &str, vmid: u32) -> Result<ContainerStatus, PveError> {
    client.check("container_status")?;
    lock(&client.containers)
        .get(&vmid)
        .map(|c| ContainerStatus {
            vmid,
            status: c.status.clone(),
            name: Some(c.name.clone()),
        })
        .ok_or_else(|| PveError::NotFound(format!("CT {} does not exist", vmid)))
}

/// Start and stop share one path; `action` is the operation name used for
/// failure injection and call recording.
pub async fn set_container_state(client: &MockPveClient, node: &str, vmid: u32, action: &str, status: &str) -> Result<String, PveError> {
    client.check(&format!("{}_container", action))?;
    let mut containers = lock(&client.containers);
    let container = containers
        .get_mut(&vmid)
        .ok_or_else(|| PveError::NotFound(format!("CT {} does not exist", vmid)))?;
    container.status = status.to_string();
    drop(containers);

    client.record(format!("{}_container:{}", action, vmid));
    Ok(client.next_upid(node, &format!("vz{}", action), vmid))
}

pub async fn destroy_container(client: &MockPveClient, node: &str, vmid: u32) -> Result<String, PveError> {
    client.check("destroy_container")?;
    let mut containers = lock(&client.containers);
    match containers.get(&vmid) {
        None => return Err(PveError::NotFound(format!("CT {} does not exist", vmid))),
        Some(c) if c.status == "running" => {
            return Err(PveError::Api {
                status: 500,
                message: format!("CT {} is running - destroy failed", vmid),
            });
        }
        Some(_) => {}
    }
    containers.remove(&vmid);
    drop(containers);

    lock(&client.firewall).remove(&FirewallTarget::Container {
        node: node.to_string(),
        vmid,
    });
    client.record(format!("destroy_container:{}", vmid));
    Ok(client.next_upid(node, "vzdestroy", vmid))
}

/// Tasks finish immediately. `fail_operation("task:<kind>")` makes tasks of
/// that kind (`vzcreate`, `vzstart`, `download`, ...) end with an error.
pub async fn task_status(client: &MockPveClient, _node: &str, upid: &str) -> Result<TaskStatus, PveError> {
    client.check("task_status")?;
    let kind = upid.split(':').nth(3).unwrap_or_default();
    let exitstatus = if client.check(&format!("task:{}", kind)).is_err() {
        format!("{} failed", kind)
    } else {
        "OK".to_string()
    };
    Ok(TaskStatus {
        status: "stopped".to_string(),
        exitstatus: Some(exitstatus),
    })
}

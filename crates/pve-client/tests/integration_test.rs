//! Integration tests for the Proxmox VE client
//!
//! These tests require a reachable Proxmox VE node.
//! Set PVE_API_URL, PVE_API_TOKEN and PVE_NODE environment variables to run.
//! They only read state; nothing is created on the node.

use pve_client::{FirewallTarget, PveClient, PveClientTrait};

fn client() -> PveClient {
    let url = std::env::var("PVE_API_URL")
        .unwrap_or_else(|_| "https://localhost:8006".to_string());
    let token = std::env::var("PVE_API_TOKEN")
        .expect("PVE_API_TOKEN environment variable must be set");

    match std::env::var("PVE_CA_FILE") {
        Ok(path) => {
            let pem = std::fs::read(path).expect("Failed to read CA file");
            PveClient::with_ca_certificate(url, token, &pem).expect("Failed to create client")
        }
        Err(_) => PveClient::new(url, token).expect("Failed to create client"),
    }
}

fn node() -> String {
    std::env::var("PVE_NODE").unwrap_or_else(|_| "pve".to_string())
}

#[tokio::test]
#[ignore] // Requires running Proxmox VE node
async fn test_token_is_accepted() {
    let result = client().validate_token().await;
    assert!(result.is_ok(), "Token validation failed: {:?}", result.err());
}

#[tokio::test]
#[ignore]
async fn test_cluster_resources_list_guests() {
    let resources = client()
        .cluster_resources(Some("vm"))
        .await
        .expect("Failed to query cluster resources");

    for guest in resources.iter().filter(|r| r.is_guest()) {
        assert!(guest.vmid.is_some(), "guest {} has no vmid", guest.id);
    }
    println!("Found {} guests", resources.len());
}

#[tokio::test]
#[ignore]
async fn test_list_storage_reports_content_kinds() {
    let storages = client()
        .list_storage(&node())
        .await
        .expect("Failed to list storage");

    for storage in &storages {
        println!(
            "{} active={} rootdir={} vztmpl={}",
            storage.storage,
            storage.active,
            storage.supports("rootdir"),
            storage.supports("vztmpl")
        );
    }
}

#[tokio::test]
#[ignore]
async fn test_appliance_catalog_has_debian() {
    let templates = client()
        .list_appliance_templates(&node())
        .await
        .expect("Failed to list appliance templates");

    assert!(
        templates.iter().any(|t| t.template.contains("debian")),
        "no debian template in catalog"
    );
}

#[tokio::test]
#[ignore]
async fn test_node_firewall_rules_decode() {
    let target = FirewallTarget::Node { node: node() };
    let rules = client()
        .list_firewall_rules(&target)
        .await
        .expect("Failed to list node firewall rules");

    for (index, rule) in rules.iter().enumerate() {
        assert_eq!(rule.pos as usize, index);
    }
}

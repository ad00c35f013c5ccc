//! Resource allocation
//!
//! Instance ids, storage pools and the OS template are decided from the
//! platform's inventory as it is right before the decision. Explicit choices
//! are checked, never second-guessed; automatic choices are only made when
//! exactly one candidate fits.

use crate::error::ProvisionError;
use crate::host::HostOps;
use crate::inventory;
use pve_client::PveClientTrait;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

/// Ids below 100 are reserved by the platform
pub const MIN_INSTANCE_ID: u32 = 100;

/// Lowest id >= [`MIN_INSTANCE_ID`] missing from `used`
pub fn lowest_free_id(used: &BTreeSet<u32>) -> u32 {
    let mut candidate = MIN_INSTANCE_ID;
    for id in used.range(MIN_INSTANCE_ID..) {
        if *id != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

/// Pick the instance id, or check an explicit one is free
pub async fn allocate_instance_id(
    client: &dyn PveClientTrait,
    node: &str,
    explicit: Option<u32>,
) -> Result<u32, ProvisionError> {
    let guests = inventory::list_guests(client, node).await?;
    let used: BTreeSet<u32> = guests.iter().map(|g| g.vmid).collect();

    match explicit {
        Some(id) => match guests.iter().find(|g| g.vmid == id) {
            Some(owner) => Err(ProvisionError::Conflict {
                message: format!(
                    "instance id {} is already used by {} on node {}",
                    id,
                    owner.name.as_deref().unwrap_or("an unnamed guest"),
                    owner.node
                ),
                remediation: format!(
                    "re-run with a different --instance-id or omit it (next free id: {})",
                    lowest_free_id(&used)
                ),
            }),
            None => {
                debug!("Using explicit instance id {}", id);
                Ok(id)
            }
        },
        None => {
            let id = lowest_free_id(&used);
            info!("Allocated instance id {} ({} ids in use)", id, used.len());
            Ok(id)
        }
    }
}

/// Storage content kinds the provisioner needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Container root filesystems
    RootDir,
    /// Container templates
    Template,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::RootDir => "rootdir",
            ContentKind::Template => "vztmpl",
        }
    }

    fn flag(&self) -> &'static str {
        match self {
            ContentKind::RootDir => "--storage",
            ContentKind::Template => "--template-storage",
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            ContentKind::RootDir => "container storage",
            ContentKind::Template => "template storage",
        }
    }
}

/// Check an explicit storage, or pick the only active one advertising `kind`
pub async fn resolve_storage(
    client: &dyn PveClientTrait,
    node: &str,
    explicit: Option<&str>,
    kind: ContentKind,
) -> Result<String, ProvisionError> {
    let storages = client.list_storage(node).await?;

    if let Some(name) = explicit {
        let storage = storages
            .iter()
            .find(|s| s.storage == name && s.active && s.enabled)
            .ok_or_else(|| {
                let active: Vec<_> = storages.iter().filter(|s| s.active).map(|s| s.storage.as_str()).collect();
                ProvisionError::not_found(
                    format!("active {} '{}' on node {}", kind.describe(), name, node),
                    format!("re-run with {} set to one of: {}", kind.flag(), active.join(", ")),
                )
            })?;
        if !storage.supports(kind.as_str()) {
            warn!(
                "Storage {} does not advertise '{}' content (has: {}); continuing as requested",
                name,
                kind.as_str(),
                storage.content
            );
        }
        return Ok(name.to_string());
    }

    let candidates: Vec<String> = storages
        .iter()
        .filter(|s| s.active && s.enabled && s.supports(kind.as_str()))
        .map(|s| s.storage.clone())
        .collect();
    match candidates.as_slice() {
        [] => Err(ProvisionError::not_found(
            format!("active {} with '{}' content on node {}", kind.describe(), kind.as_str(), node),
            format!(
                "enable '{}' content on a storage (`pvesm set <storage> --content ...`) or pass {}",
                kind.as_str(),
                kind.flag()
            ),
        )),
        [only] => {
            info!("Selected {} {}", kind.describe(), only);
            Ok(only.clone())
        }
        _ => Err(ProvisionError::Ambiguous {
            what: kind.describe().to_string(),
            flag: kind.flag().to_string(),
            candidates,
        }),
    }
}

/// Template storage: explicit choice, else the container storage when it can
/// hold templates, else the only template-capable storage.
pub async fn resolve_template_storage(
    client: &dyn PveClientTrait,
    node: &str,
    explicit: Option<&str>,
    container_storage: &str,
) -> Result<String, ProvisionError> {
    if explicit.is_none() {
        let storages = client.list_storage(node).await?;
        if storages
            .iter()
            .any(|s| s.storage == container_storage && s.active && s.supports(ContentKind::Template.as_str()))
        {
            debug!("Container storage {} also holds templates", container_storage);
            return Ok(container_storage.to_string());
        }
    }
    resolve_storage(client, node, explicit, ContentKind::Template).await
}

/// An OS template in a template storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    pub storage: String,
    /// Catalog file name, e.g. `debian-12-standard_12.7-1_amd64.tar.zst`
    pub template: String,
}

impl TemplateRef {
    /// Volume id used as `ostemplate`
    pub fn volid(&self) -> String {
        format!("{}:vztmpl/{}", self.storage, self.template)
    }
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.volid())
    }
}

/// Newest catalog template for `os_family`.
///
/// With `refresh`, the catalog is updated first (`pveam update`); failures
/// there only warn since a stale catalog is still usable.
pub async fn resolve_template(
    client: &dyn PveClientTrait,
    host: &dyn HostOps,
    node: &str,
    os_family: &str,
    refresh: bool,
) -> Result<String, ProvisionError> {
    if refresh {
        match host.run("pveam", &["update"]).await {
            Ok(output) if output.success() => debug!("Appliance catalog refreshed"),
            Ok(output) => warn!("pveam update failed: {}", output.stderr.trim()),
            Err(e) => warn!("pveam update failed: {}", e),
        }
    }

    let catalog = client.list_appliance_templates(node).await?;
    catalog
        .into_iter()
        .map(|entry| entry.template)
        .filter(|template| template.contains(os_family))
        .max()
        .ok_or_else(|| {
            ProvisionError::not_found(
                format!("template for OS family '{}'", os_family),
                "check `pveam available --section system` and re-run with a matching --os-family",
            )
        })
}

/// Whether the template is already downloaded to its storage
pub async fn template_present(
    client: &dyn PveClientTrait,
    node: &str,
    template: &TemplateRef,
) -> Result<bool, ProvisionError> {
    let volid = template.volid();
    let content = client
        .list_storage_content(node, &template.storage, ContentKind::Template.as_str())
        .await?;
    Ok(content.iter().any(|item| item.volid == volid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeHost;
    use pve_client::MockPveClient;

    fn client() -> MockPveClient {
        let client = MockPveClient::new("https://pve.test:8006");
        client.add_node("pve1");
        client
    }

    #[test]
    fn test_lowest_free_id_gap_scan() {
        assert_eq!(lowest_free_id(&BTreeSet::from([100, 101, 103])), 102);
        assert_eq!(lowest_free_id(&BTreeSet::new()), 100);
        assert_eq!(lowest_free_id(&BTreeSet::from([100, 101, 102])), 103);
        assert_eq!(lowest_free_id(&BTreeSet::from([1, 2, 101])), 100);
    }

    #[tokio::test]
    async fn test_allocate_fills_gap_across_containers_and_vms() {
        let client = client();
        client.add_container(100, "pve1", "a", "running");
        client.add_vm(101, "pve2", "b");
        client.add_container(103, "pve1", "c", "stopped");
        assert_eq!(allocate_instance_id(&client, "pve1", None).await.unwrap(), 102);
    }

    #[tokio::test]
    async fn test_allocate_on_empty_inventory_starts_at_100() {
        assert_eq!(allocate_instance_id(&client(), "pve1", None).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_explicit_id_in_use_conflicts() {
        let client = client();
        client.add_container(100, "pve1", "a", "running");
        client.add_vm(101, "pve1", "b");
        let err = allocate_instance_id(&client, "pve1", Some(101)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Conflict { .. }));
        assert!(err.remediation().contains("next free id: 102"));

        assert_eq!(allocate_instance_id(&client, "pve1", Some(150)).await.unwrap(), 150);
    }

    #[tokio::test]
    async fn test_allocate_uses_node_lists_when_cluster_view_fails() {
        let client = client();
        client.add_container(100, "pve1", "a", "running");
        client.fail_operation("cluster_resources");
        assert_eq!(allocate_instance_id(&client, "pve1", None).await.unwrap(), 101);
    }

    #[tokio::test]
    async fn test_resolve_storage_auto_selects_single_candidate() {
        let client = client();
        client.add_storage("local", "iso,vztmpl,backup", true);
        client.add_storage("local-lvm", "rootdir,images", true);
        client.add_storage("old", "rootdir", false);
        assert_eq!(
            resolve_storage(&client, "pve1", None, ContentKind::RootDir).await.unwrap(),
            "local-lvm"
        );
    }

    #[tokio::test]
    async fn test_resolve_storage_refuses_to_guess() {
        let client = client();
        client.add_storage("local-lvm", "rootdir,images", true);
        client.add_storage("tank", "rootdir", true);
        let err = resolve_storage(&client, "pve1", None, ContentKind::RootDir).await.unwrap_err();
        match err {
            ProvisionError::Ambiguous { candidates, flag, .. } => {
                assert_eq!(candidates, vec!["local-lvm", "tank"]);
                assert_eq!(flag, "--storage");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_storage_without_candidates() {
        let client = client();
        client.add_storage("local", "iso,backup", true);
        let err = resolve_storage(&client, "pve1", None, ContentKind::Template).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_explicit_storage_must_be_active() {
        let client = client();
        client.add_storage("local", "iso,vztmpl", true);
        client.add_storage("old", "rootdir", false);

        let err = resolve_storage(&client, "pve1", Some("old"), ContentKind::RootDir).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound { .. }));
        assert!(err.remediation().contains("local"));

        // Missing content kind only warns
        assert_eq!(
            resolve_storage(&client, "pve1", Some("local"), ContentKind::RootDir).await.unwrap(),
            "local"
        );
    }

    #[tokio::test]
    async fn test_template_storage_prefers_container_storage() {
        let client = client();
        client.add_storage("local", "iso,vztmpl", true);
        client.add_storage("shared", "rootdir,vztmpl", true);

        assert_eq!(
            resolve_template_storage(&client, "pve1", None, "shared").await.unwrap(),
            "shared"
        );
        let err = resolve_template_storage(&client, "pve1", None, "local-lvm").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Ambiguous { .. }));
        assert_eq!(
            resolve_template_storage(&client, "pve1", Some("local"), "shared").await.unwrap(),
            "local"
        );
    }

    #[tokio::test]
    async fn test_resolve_template_picks_lexicographically_last_match() {
        let client = client();
        let host = FakeHost::new();
        client.add_appliance("debian-11-standard_11.7-1_amd64.tar.zst", "debian-11");
        client.add_appliance("debian-12-standard_12.2-1_amd64.tar.zst", "debian-12");
        client.add_appliance("debian-12-standard_12.7-1_amd64.tar.zst", "debian-12");
        client.add_appliance("ubuntu-24.04-standard_24.04-2_amd64.tar.zst", "ubuntu-24.04");

        let template = resolve_template(&client, &host, "pve1", "debian-12", true).await.unwrap();
        assert_eq!(template, "debian-12-standard_12.7-1_amd64.tar.zst");
        assert!(host.ran("pveam update"));

        let err = resolve_template(&client, &host, "pve1", "alpine", false).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_catalog_refresh_failure_only_warns() {
        let client = client();
        let host = FakeHost::new();
        host.fail_on("pveam update");
        client.add_appliance("debian-12-standard_12.7-1_amd64.tar.zst", "debian-12");
        assert!(resolve_template(&client, &host, "pve1", "debian-12", true).await.is_ok());
    }

    #[tokio::test]
    async fn test_template_presence() {
        let client = client();
        client.add_storage("local", "vztmpl", true);
        let template = TemplateRef {
            storage: "local".to_string(),
            template: "debian-12-standard_12.7-1_amd64.tar.zst".to_string(),
        };
        assert!(!template_present(&client, "pve1", &template).await.unwrap());
        client.add_storage_content("local", &template.volid(), "vztmpl");
        assert!(template_present(&client, "pve1", &template).await.unwrap());
    }
}

//! Credential management
//!
//! Two kinds of credential: the service API key the workload serves with,
//! and the Proxmox VE API token the service uses to manage guests. Both are
//! kept once deployed; nothing here rotates a value on its own.

use crate::error::ProvisionError;
use pve_client::{PveClientTrait, PveError};
use rand::TryRngCore;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

pub const API_KEY_LEN: usize = 48;
const API_KEY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Where the service API key of this run came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKeySource {
    Override,
    Existing,
    Generated,
}

impl fmt::Display for ApiKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApiKeySource::Override => "provided",
            ApiKeySource::Existing => "kept",
            ApiKeySource::Generated => "generated",
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct MaterializedKey {
    pub value: String,
    pub source: ApiKeySource,
}

impl fmt::Debug for MaterializedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializedKey")
            .field("value", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

/// 48 alphanumeric characters from the OS generator
pub fn generate_api_key() -> Result<String, ProvisionError> {
    let mut key = String::with_capacity(API_KEY_LEN);
    let mut buf = [0u8; 64];
    while key.len() < API_KEY_LEN {
        rand::rngs::OsRng.try_fill_bytes(&mut buf).map_err(|e| {
            ProvisionError::Io(std::io::Error::other(format!("OS random generator failed: {}", e)))
        })?;
        // 248 = 4 * 62; rejecting the tail keeps the distribution uniform
        for byte in buf.iter().filter(|b| **b < 248) {
            if key.len() == API_KEY_LEN {
                break;
            }
            key.push(API_KEY_ALPHABET[usize::from(*byte) % API_KEY_ALPHABET.len()] as char);
        }
    }
    Ok(key)
}

/// Override, else the deployed key, else a new one. Empty values count as absent.
pub fn materialize_api_key(
    existing: Option<&str>,
    override_key: Option<&str>,
) -> Result<MaterializedKey, ProvisionError> {
    let present = |v: Option<&str>| v.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string);

    if let Some(value) = present(override_key) {
        if value.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
            return Err(ProvisionError::validation(
                "--api-key",
                "must not contain whitespace or quotes",
            ));
        }
        return Ok(MaterializedKey { value, source: ApiKeySource::Override });
    }
    if let Some(value) = present(existing) {
        return Ok(MaterializedKey { value, source: ApiKeySource::Existing });
    }
    Ok(MaterializedKey {
        value: generate_api_key()?,
        source: ApiKeySource::Generated,
    })
}

/// Platform API token. `secret` is only known in the run that created it.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredential {
    /// `user@realm!tokenid`
    pub token_id: String,
    pub secret: Option<String>,
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("token_id", &self.token_id)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Identity the service uses against the platform API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessSpec {
    pub userid: String,
    pub groupid: String,
    pub roleid: String,
    pub token_name: String,
    pub privileges: Vec<String>,
}

impl AccessSpec {
    pub fn for_service(service: &str) -> Self {
        Self {
            userid: format!("{}@pve", service),
            groupid: service.to_string(),
            roleid: "ProviderNode".to_string(),
            token_name: "service".to_string(),
            privileges: [
                "Datastore.AllocateSpace",
                "Datastore.Audit",
                "Pool.Audit",
                "SDN.Use",
                "Sys.Audit",
                "VM.Allocate",
                "VM.Audit",
                "VM.Config.CPU",
                "VM.Config.Disk",
                "VM.Config.Memory",
                "VM.Config.Network",
                "VM.Config.Options",
                "VM.PowerMgmt",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Create the role, or converge its privileges
pub async fn ensure_role(
    client: &dyn PveClientTrait,
    roleid: &str,
    privileges: &[String],
) -> Result<EnsureOutcome, ProvisionError> {
    let roles = client.list_roles().await?;
    match roles.iter().find(|r| r.roleid == roleid) {
        None => {
            client.create_role(roleid, privileges).await?;
            info!("Created role {}", roleid);
            Ok(EnsureOutcome::Created)
        }
        Some(role) => {
            let current: BTreeSet<String> = role.privileges().into_iter().collect();
            let desired: BTreeSet<String> = privileges.iter().cloned().collect();
            if current == desired {
                debug!("Role {} already has the expected privileges", roleid);
                Ok(EnsureOutcome::Unchanged)
            } else {
                client.update_role(roleid, privileges).await?;
                info!("Updated privileges of role {}", roleid);
                Ok(EnsureOutcome::Updated)
            }
        }
    }
}

pub async fn ensure_group(client: &dyn PveClientTrait, groupid: &str) -> Result<EnsureOutcome, ProvisionError> {
    if client.list_groups().await?.iter().any(|g| g.groupid == groupid) {
        return Ok(EnsureOutcome::Unchanged);
    }
    client
        .create_group(groupid, Some("Managed by workload-provisioner"))
        .await?;
    info!("Created group {}", groupid);
    Ok(EnsureOutcome::Created)
}

pub async fn ensure_user(
    client: &dyn PveClientTrait,
    userid: &str,
    groupid: &str,
) -> Result<EnsureOutcome, ProvisionError> {
    if client.list_users().await?.iter().any(|u| u.userid == userid) {
        return Ok(EnsureOutcome::Unchanged);
    }
    client
        .create_user(userid, &[groupid.to_string()], Some("Managed by workload-provisioner"))
        .await?;
    info!("Created user {}", userid);
    Ok(EnsureOutcome::Created)
}

/// Grant the role to the group on `/`, propagating. Setting an existing ACL is a no-op upstream.
pub async fn ensure_acl(client: &dyn PveClientTrait, roleid: &str, groupid: &str) -> Result<(), ProvisionError> {
    client
        .set_acl("/", &[roleid.to_string()], &[groupid.to_string()], true)
        .await?;
    Ok(())
}

/// Find or create the token. An existing token's secret cannot be read back.
pub async fn ensure_api_token(
    client: &dyn PveClientTrait,
    userid: &str,
    token_name: &str,
) -> Result<ApiCredential, ProvisionError> {
    let token_id = format!("{}!{}", userid, token_name);
    let tokens = match client.list_tokens(userid).await {
        Ok(tokens) => tokens,
        Err(PveError::NotFound(_)) => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    if tokens.iter().any(|t| t.tokenid == token_name) {
        warn!(
            "API token {} already exists; its secret cannot be recovered. Remove it with `pveum user token remove {} {}` to issue a new one",
            token_id, userid, token_name
        );
        return Ok(ApiCredential { token_id, secret: None });
    }

    let created = client
        .create_token(userid, token_name, false, Some("provider-node service"))
        .await?;
    info!("Created API token {}", created.full_tokenid);
    Ok(ApiCredential {
        token_id: created.full_tokenid,
        secret: Some(created.value),
    })
}

/// Role, group, ACL, user and token, in dependency order
pub async fn ensure_api_access(client: &dyn PveClientTrait, spec: &AccessSpec) -> Result<ApiCredential, ProvisionError> {
    ensure_role(client, &spec.roleid, &spec.privileges).await?;
    ensure_group(client, &spec.groupid).await?;
    ensure_acl(client, &spec.roleid, &spec.groupid).await?;
    ensure_user(client, &spec.userid, &spec.groupid).await?;
    ensure_api_token(client, &spec.userid, &spec.token_name).await
}

//! Host state store
//!
//! A `KEY=value` file on the host that outlives the workload. It records the
//! identity the workload must keep across reinstalls (MAC address, API key)
//! and the choices later runs default to (port, VLAN, forwarding interfaces).
//! Uninstall leaves it in place.

use crate::env_file::EnvFile;
use crate::error::ProvisionError;
use crate::host::HostOps;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const KEY_MAC: &str = "MAC";
pub const KEY_API_KEY: &str = "API_KEY";
pub const KEY_PORT: &str = "PORT";
pub const KEY_VLAN: &str = "VLAN";
pub const KEY_INTERFACES: &str = "INTERFACES";

const MANAGED_KEYS: [&str; 5] = [KEY_MAC, KEY_API_KEY, KEY_PORT, KEY_VLAN, KEY_INTERFACES];

/// Owner read/write only; the file holds the service API key
const STATE_FILE_MODE: u32 = 0o600;

/// Values read from the state file. Malformed values read as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisioningState {
    /// Raw value; validated by the network planner
    pub mac_address: Option<String>,
    pub api_key: Option<String>,
    pub port: Option<u16>,
    pub vlan_id: Option<u16>,
    pub interfaces: Vec<String>,
    /// Operator-added keys
    pub extra: BTreeMap<String, String>,
}

pub struct StateStore<'a> {
    host: &'a dyn HostOps,
    path: PathBuf,
}

impl<'a> StateStore<'a> {
    pub fn new(host: &'a dyn HostOps, path: impl Into<PathBuf>) -> Self {
        Self {
            host,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<EnvFile, ProvisionError> {
        Ok(self
            .host
            .read_file(&self.path)?
            .map(|text| EnvFile::parse(&text))
            .unwrap_or_default())
    }

    /// Load the state; a missing file is an empty state
    pub fn load(&self) -> Result<ProvisioningState, ProvisionError> {
        let doc = self.read_document()?;
        let mut state = ProvisioningState {
            mac_address: doc.get(KEY_MAC).filter(|v| !v.is_empty()).map(str::to_string),
            api_key: doc.get(KEY_API_KEY).filter(|v| !v.is_empty()).map(str::to_string),
            port: parse_number(&doc, KEY_PORT, &self.path),
            vlan_id: parse_number(&doc, KEY_VLAN, &self.path),
            interfaces: doc
                .get(KEY_INTERFACES)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            extra: BTreeMap::new(),
        };
        for key in doc.keys().filter(|k| !MANAGED_KEYS.contains(k)) {
            if let Some(value) = doc.get(key) {
                state.extra.insert(key.to_string(), value.to_string());
            }
        }
        Ok(state)
    }

    /// Merge `updates` into whatever is on disk right now and write it back.
    ///
    /// Every save re-reads the file, so keys written by earlier steps of the
    /// same run and keys added by the operator are kept.
    pub fn save(&self, updates: &[(&str, String)]) -> Result<(), ProvisionError> {
        self.merge(updates, &[])
    }

    fn merge(&self, updates: &[(&str, String)], removals: &[&str]) -> Result<(), ProvisionError> {
        let mut doc = self.read_document()?;
        for (key, value) in updates {
            doc.set(key, value.clone());
        }
        for key in removals {
            if doc.remove(key) {
                debug!("Dropped {} from {}", key, self.path.display());
            }
        }
        if let Some(parent) = self.path.parent() {
            self.host.create_dir_all(parent)?;
        }
        self.host.write_file(&self.path, &doc.render(), STATE_FILE_MODE)?;
        debug!(
            "Persisted {} to {}",
            updates.iter().map(|(k, _)| *k).collect::<Vec<_>>().join(","),
            self.path.display()
        );
        Ok(())
    }

    /// Persist the network identity chosen for a newly created workload.
    /// No forwarding interfaces clears the persisted list.
    pub fn persist_identity(
        &self,
        mac: &str,
        port: u16,
        vlan_id: Option<u16>,
        interfaces: &[String],
    ) -> Result<(), ProvisionError> {
        let mut updates = vec![(KEY_MAC, mac.to_string()), (KEY_PORT, port.to_string())];
        if let Some(vlan) = vlan_id {
            updates.push((KEY_VLAN, vlan.to_string()));
        }
        if interfaces.is_empty() {
            return self.merge(&updates, &[KEY_INTERFACES]);
        }
        updates.push((KEY_INTERFACES, interfaces.join(",")));
        self.save(&updates)
    }
}

fn parse_number<T: std::str::FromStr>(doc: &EnvFile, key: &str, path: &Path) -> Option<T> {
    let raw = doc.get(key).filter(|v| !v.is_empty())?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring malformed {}={} in {}", key, raw, path.display());
            None
        }
    }
}

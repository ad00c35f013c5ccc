//! Network identity planning
//!
//! Decides the workload's MAC address, addressing mode, bridge and VLAN, and
//! validates the host interfaces used for port forwarding. Nothing here
//! persists; the orchestrator records the chosen identity once the workload
//! exists.

use crate::error::ProvisionError;
use crate::host::HostOps;
use crate::state_store::ProvisioningState;
use pve_client::PveClientTrait;
use rand::TryRngCore;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tracing::{debug, warn};

/// Locally administered prefix Proxmox VE uses for generated addresses
pub const MAC_VENDOR_PREFIX: [u8; 3] = [0xBC, 0x24, 0x11];

/// 48-bit MAC address, rendered as upper-case colon-hex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Vendor prefix plus three random octets from the OS generator
    pub fn generate() -> Result<Self, ProvisionError> {
        let mut suffix = [0u8; 3];
        rand::rngs::OsRng.try_fill_bytes(&mut suffix).map_err(|e| {
            ProvisionError::Io(std::io::Error::other(format!("OS random generator failed: {}", e)))
        })?;
        let [a, b, c] = MAC_VENDOR_PREFIX;
        Ok(Self([a, b, c, suffix[0], suffix[1], suffix[2]]))
    }
}

impl FromStr for MacAddress {
    type Err = ProvisionError;

    /// Strict `XX:XX:XX:XX:XX:XX`, either case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProvisionError::validation("MAC address", format!("'{}' is not colon-separated hex", s));
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", a, b, c, d, e, g)
    }
}

/// MAC chosen for this run. `generated` means it is not persisted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacChoice {
    pub mac: MacAddress,
    pub generated: bool,
}

/// Reuse the persisted MAC when it is valid, otherwise generate one
pub fn get_or_create_mac(state: &ProvisioningState) -> Result<MacChoice, ProvisionError> {
    if let Some(raw) = state.mac_address.as_deref() {
        match raw.parse::<MacAddress>() {
            Ok(mac) => {
                debug!("Reusing persisted MAC {}", mac);
                return Ok(MacChoice { mac, generated: false });
            }
            Err(_) => warn!("Persisted MAC '{}' is malformed; generating a new one", raw),
        }
    }
    Ok(MacChoice {
        mac: MacAddress::generate()?,
        generated: true,
    })
}

/// IPv4 address with prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("'{}' has no prefix length (expected e.g. 192.168.1.50/24)", s))?;
        let address = address
            .parse()
            .map_err(|_| format!("'{}' is not an IPv4 address", address))?;
        let prefix_len = prefix
            .parse::<u8>()
            .ok()
            .filter(|p| (1..=32).contains(p))
            .ok_or_else(|| format!("prefix length '{}' must be between 1 and 32", prefix))?;
        Ok(Self { address, prefix_len })
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Dhcp,
    Static { ip: Ipv4Cidr, gateway: Ipv4Addr },
}

/// Validate the static address pairing. Empty strings count as absent.
pub fn validate_network_mode(ip: Option<&str>, gateway: Option<&str>) -> Result<NetworkMode, ProvisionError> {
    let ip = ip.map(str::trim).filter(|v| !v.is_empty());
    let gateway = gateway.map(str::trim).filter(|v| !v.is_empty());

    match (ip, gateway) {
        (None, None) => Ok(NetworkMode::Dhcp),
        (Some(_), None) => Err(ProvisionError::validation(
            "--gateway",
            "a static IP needs a gateway (or drop --static-ip for DHCP)",
        )),
        (None, Some(_)) => Err(ProvisionError::validation(
            "--static-ip",
            "a gateway needs a static IP in CIDR form (or drop --gateway for DHCP)",
        )),
        (Some(ip), Some(gateway)) => {
            let ip: Ipv4Cidr = ip
                .parse()
                .map_err(|message| ProvisionError::validation("--static-ip", message))?;
            let gateway: Ipv4Addr = gateway.parse().map_err(|_| {
                ProvisionError::validation("--gateway", format!("'{}' is not an IPv4 address", gateway))
            })?;
            Ok(NetworkMode::Static { ip, gateway })
        }
    }
}

pub fn validate_vlan(vlan: u16) -> Result<u16, ProvisionError> {
    if (1..=4094).contains(&vlan) {
        Ok(vlan)
    } else {
        Err(ProvisionError::validation("--vlan", format!("{} must be between 1 and 4094", vlan)))
    }
}

/// Bridge, VLAN and addressing of the workload's `net0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPlan {
    pub bridge: String,
    pub vlan_id: Option<u16>,
    pub mode: NetworkMode,
}

impl NetworkPlan {
    /// `net0` value for container creation
    pub fn net0(&self, mac: &MacAddress) -> String {
        let mut value = format!("name=eth0,bridge={},hwaddr={},firewall=1", self.bridge, mac);
        match self.mode {
            NetworkMode::Dhcp => value.push_str(",ip=dhcp"),
            NetworkMode::Static { ip, gateway } => {
                value.push_str(&format!(",ip={},gw={}", ip, gateway));
            }
        }
        if let Some(tag) = self.vlan_id {
            value.push_str(&format!(",tag={}", tag));
        }
        value
    }
}

/// Fail unless the bridge exists on the node
pub async fn validate_bridge(client: &dyn PveClientTrait, node: &str, bridge: &str) -> Result<(), ProvisionError> {
    let bridges = client.list_bridges(node).await?;
    if bridges.iter().any(|b| b.iface == bridge) {
        return Ok(());
    }
    let available: Vec<_> = bridges.iter().map(|b| b.iface.as_str()).collect();
    Err(ProvisionError::not_found(
        format!("bridge {} on node {}", bridge, node),
        format!("re-run with --bridge set to one of: {}", available.join(", ")),
    ))
}

/// Map every forwarding interface to its first IPv4 address.
///
/// All problems are reported together, with the interfaces that would have
/// been accepted. With `lenient`, bad entries are dropped with a warning.
pub async fn plan_interface_addresses(
    host: &dyn HostOps,
    names: &[String],
    lenient: bool,
) -> Result<BTreeMap<String, Ipv4Addr>, ProvisionError> {
    if names.is_empty() {
        return Ok(BTreeMap::new());
    }

    let addresses = host.ipv4_addresses().await?;
    let mut planned = BTreeMap::new();
    let mut problems = Vec::new();
    for name in names {
        match addresses.get(name).and_then(|a| a.first()) {
            Some(address) => {
                planned.insert(name.clone(), *address);
            }
            None if addresses.contains_key(name) => problems.push(format!("{} (no IPv4 address)", name)),
            None => problems.push(format!("{} (no such interface)", name)),
        }
    }

    if problems.is_empty() {
        return Ok(planned);
    }
    if lenient {
        for problem in &problems {
            warn!("Skipping forwarding interface {}", problem);
        }
        return Ok(planned);
    }

    let valid: Vec<_> = addresses
        .iter()
        .filter(|(name, addrs)| name.as_str() != "lo" && !addrs.is_empty())
        .map(|(name, addrs)| format!("{} ({})", name, addrs[0]))
        .collect();
    Err(ProvisionError::validation(
        "--interfaces",
        format!(
            "invalid entries: {}; interfaces with an IPv4 address: {}",
            problems.join(", "),
            if valid.is_empty() { "none".to_string() } else { valid.join(", ") }
        ),
    ))
}

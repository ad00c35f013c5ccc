//! Host port forwarding
//!
//! When forwarding interfaces are configured, the service port on their
//! addresses is DNATed to the workload. The workload's address can change
//! (DHCP), so the helper resolves it each time it runs and the unit re-runs
//! it on failure and after guests start at boot.

use crate::error::ProvisionError;
use crate::host::HostOps;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, info, warn};

pub const HELPER_PATH: &str = "/usr/local/sbin/provider-node-portfwd.sh";
pub const UNIT_NAME: &str = "provider-node-portfwd.service";
pub const UNIT_PATH: &str = "/etc/systemd/system/provider-node-portfwd.service";

const CHAIN: &str = "PROVIDER_NODE_PORTFWD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatHelperSpec {
    pub vmid: u32,
    pub port: u16,
    /// Forwarding interface to the host address the port is published on
    pub addresses: BTreeMap<String, Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Idempotent helper script: flushes and rebuilds its own nat chain. `stop` removes it.
pub fn render_script(spec: &NatHelperSpec) -> String {
    let addresses = spec
        .addresses
        .values()
        .map(Ipv4Addr::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    let interfaces = spec.addresses.keys().cloned().collect::<Vec<_>>().join(",");

    let mut script = String::new();
    script.push_str("#!/bin/sh\n");
    script.push_str("# Managed by workload-provisioner. Regenerated on every run.\n");
    script.push_str(&format!("# Interfaces: {}\n", interfaces));
    script.push_str("set -eu\n\n");
    script.push_str(&format!("CHAIN={}\n", CHAIN));
    script.push_str(&format!("VMID={}\n", spec.vmid));
    script.push_str(&format!("PORT={}\n", spec.port));
    script.push_str(&format!("ADDRESSES=\"{}\"\n\n", addresses));
    script.push_str(
        r#"teardown() {
    iptables -t nat -D PREROUTING -j "$CHAIN" 2>/dev/null || true
    iptables -t nat -D OUTPUT -j "$CHAIN" 2>/dev/null || true
    iptables -t nat -F "$CHAIN" 2>/dev/null || true
    iptables -t nat -X "$CHAIN" 2>/dev/null || true
}

if [ "${1:-start}" = "stop" ]; then
    teardown
    exit 0
fi

TARGET="$(pct exec "$VMID" -- hostname -I 2>/dev/null | awk '{print $1}')"
if [ -z "$TARGET" ]; then
    echo "workload $VMID has no address yet" >&2
    exit 1
fi

iptables -t nat -N "$CHAIN" 2>/dev/null || true
iptables -t nat -F "$CHAIN"
for ADDR in $ADDRESSES; do
    iptables -t nat -A "$CHAIN" -d "$ADDR" -p tcp --dport "$PORT" -j DNAT --to-destination "$TARGET:$PORT"
done
iptables -t nat -C PREROUTING -j "$CHAIN" 2>/dev/null || iptables -t nat -A PREROUTING -j "$CHAIN"
iptables -t nat -C OUTPUT -j "$CHAIN" 2>/dev/null || iptables -t nat -A OUTPUT -j "$CHAIN"
"#,
    );
    script
}

pub fn render_unit() -> String {
    format!(
        "[Unit]\n\
         Description=Forward the provider-node service port to its workload\n\
         After=network-online.target pve-guests.service\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         RemainAfterExit=yes\n\
         ExecStart={helper}\n\
         ExecStop={helper} stop\n\
         Restart=on-failure\n\
         RestartSec=15\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        helper = HELPER_PATH
    )
}

/// Write the helper and unit, then (re)start the unit
pub async fn install(host: &dyn HostOps, spec: &NatHelperSpec) -> Result<InstallOutcome, ProvisionError> {
    let script = render_script(spec);
    let unit = render_unit();
    let existing_script = host.read_file(Path::new(HELPER_PATH))?;
    let existing_unit = host.read_file(Path::new(UNIT_PATH))?;

    let outcome = match (&existing_script, &existing_unit) {
        (None, None) => InstallOutcome::Created,
        (Some(s), Some(u)) if *s == script && *u == unit => InstallOutcome::Unchanged,
        _ => InstallOutcome::Updated,
    };

    if outcome != InstallOutcome::Unchanged {
        if let Some(parent) = Path::new(HELPER_PATH).parent() {
            host.create_dir_all(parent)?;
        }
        host.write_file(Path::new(HELPER_PATH), &script, 0o755)?;
        host.write_file(Path::new(UNIT_PATH), &unit, 0o644)?;
        host.run("systemctl", &["daemon-reload"])
            .await?
            .check("systemctl daemon-reload")?;
    }

    host.run("systemctl", &["enable", UNIT_NAME])
        .await?
        .check(&format!("systemctl enable {}", UNIT_NAME))?;
    // Restart even when unchanged: the workload address may have moved
    host.run("systemctl", &["restart", UNIT_NAME])
        .await?
        .check(&format!("systemctl restart {}", UNIT_NAME))?;

    info!("Port forwarding helper {:?} ({} address(es))", outcome, spec.addresses.len());
    Ok(outcome)
}

/// Stop and remove the helper and unit. Returns whether anything was present.
pub async fn remove(host: &dyn HostOps) -> Result<bool, ProvisionError> {
    let unit_present = host.read_file(Path::new(UNIT_PATH))?.is_some();
    let helper_present = host.read_file(Path::new(HELPER_PATH))?.is_some();
    if !unit_present && !helper_present {
        debug!("No port forwarding helper installed");
        return Ok(false);
    }

    if unit_present {
        let output = host.run("systemctl", &["disable", "--now", UNIT_NAME]).await?;
        if !output.success() {
            warn!("systemctl disable {} failed: {}", UNIT_NAME, output.stderr.trim());
        }
    }
    if helper_present {
        // Covers a helper whose unit is already gone
        let output = host.run(HELPER_PATH, &["stop"]).await?;
        if !output.success() {
            warn!("{} stop failed: {}", HELPER_PATH, output.stderr.trim());
        }
    }

    host.remove_file(Path::new(UNIT_PATH))?;
    host.remove_file(Path::new(HELPER_PATH))?;
    host.run("systemctl", &["daemon-reload"])
        .await?
        .check("systemctl daemon-reload")?;
    info!("Removed port forwarding helper");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeHost;

    fn spec() -> NatHelperSpec {
        NatHelperSpec {
            vmid: 105,
            port: 8443,
            addresses: BTreeMap::from([
                ("eno1".to_string(), Ipv4Addr::new(10, 0, 0, 2)),
                ("vmbr0".to_string(), Ipv4Addr::new(192, 168, 1, 10)),
            ]),
        }
    }

    #[test]
    fn test_script_resolves_target_at_runtime() {
        let script = render_script(&spec());
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("VMID=105\n"));
        assert!(script.contains("PORT=8443\n"));
        assert!(script.contains("ADDRESSES=\"10.0.0.2 192.168.1.10\"\n"));
        assert!(script.contains("pct exec \"$VMID\" -- hostname -I"));
        assert!(script.contains("iptables -t nat -F \"$CHAIN\""));
        assert!(script.contains("if [ \"${1:-start}\" = \"stop\" ]; then"));
    }

    #[test]
    fn test_unit_restarts_and_stops_via_helper() {
        let unit = render_unit();
        assert!(unit.contains("Type=oneshot\n"));
        assert!(unit.contains("RemainAfterExit=yes\n"));
        assert!(unit.contains(&format!("ExecStop={} stop\n", HELPER_PATH)));
        assert!(unit.contains("Restart=on-failure\n"));
        assert!(unit.contains("After=network-online.target pve-guests.service\n"));
    }

    #[tokio::test]
    async fn test_install_then_reinstall() {
        let host = FakeHost::new();
        assert_eq!(install(&host, &spec()).await.unwrap(), InstallOutcome::Created);
        assert_eq!(host.mode(HELPER_PATH), Some(0o755));
        assert!(host.ran(&format!("systemctl restart {}", UNIT_NAME)));

        assert_eq!(install(&host, &spec()).await.unwrap(), InstallOutcome::Unchanged);

        let mut moved = spec();
        moved.port = 9443;
        assert_eq!(install(&host, &moved).await.unwrap(), InstallOutcome::Updated);
        assert!(host.file(HELPER_PATH).unwrap().contains("PORT=9443\n"));
    }

    #[tokio::test]
    async fn test_install_fails_when_unit_cannot_start() {
        let host = FakeHost::new();
        host.fail_on(&format!("systemctl restart {}", UNIT_NAME));
        assert!(matches!(
            install(&host, &spec()).await,
            Err(ProvisionError::ExternalCommand { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let host = FakeHost::new();
        install(&host, &spec()).await.unwrap();

        assert!(remove(&host).await.unwrap());
        assert!(host.file(HELPER_PATH).is_none());
        assert!(host.file(UNIT_PATH).is_none());
        assert!(host.ran(&format!("systemctl disable --now {}", UNIT_NAME)));

        assert!(!remove(&host).await.unwrap());
    }
}

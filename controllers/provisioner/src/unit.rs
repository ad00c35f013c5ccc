//! Service unit inside the workload
//!
//! The service runs under podman as a quadlet: systemd generates
//! `provider-node.service` from the `.container` file on `daemon-reload`.

use std::fmt::Write as _;

pub const QUADLET_PATH: &str = "/etc/containers/systemd/provider-node.container";
pub const SERVICE_NAME: &str = "provider-node.service";
pub const AUTO_UPDATE_TIMER: &str = "podman-auto-update.timer";

/// Workload-side path of the service configuration (host config dir is mounted there)
pub const ENV_FILE_PATH: &str = "/etc/provider-node/provider-node.env";
/// Workload-side mount of the host data directory
pub const DATA_MOUNT: &str = "/var/lib/provider-node";
const CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";

pub struct UnitInputs<'a> {
    pub image: &'a str,
    pub port: u16,
    pub env_file: &'a str,
    pub auto_update: Option<bool>,
}

pub fn render_quadlet(input: &UnitInputs<'_>) -> String {
    let UnitInputs {
        image,
        port,
        env_file,
        auto_update,
    } = input;

    let mut out = String::new();
    out.push_str("[Unit]\n");
    out.push_str("Description=Provider node service\n");
    out.push_str("After=network-online.target\n");
    out.push_str("Wants=network-online.target\n\n");

    out.push_str("[Container]\n");
    let _ = writeln!(out, "ContainerName=provider-node");
    let _ = writeln!(out, "Image={}", systemd_quote_unit_value(image));
    let _ = writeln!(out, "PublishPort={port}:{port}");
    let _ = writeln!(out, "Volume={CA_BUNDLE}:{CA_BUNDLE}:ro");
    let _ = writeln!(out, "Volume={DATA_MOUNT}/data:/app/data:rw");
    let _ = writeln!(out, "Volume={DATA_MOUNT}/logs:/app/logs:rw");
    let _ = writeln!(out, "EnvironmentFile={}", systemd_escape_environment_file_value(env_file));
    // Only an explicit opt-out drops the label
    if *auto_update != Some(false) {
        out.push_str("Label=io.containers.autoupdate=registry\n");
    }
    out.push('\n');

    out.push_str("[Service]\n");
    out.push_str("Restart=always\n");
    out.push_str("RestartSec=10\n");
    out.push_str("TimeoutStartSec=900\n\n");

    out.push_str("[Install]\n");
    out.push_str("WantedBy=multi-user.target default.target\n");
    out
}

pub fn systemd_quote_unit_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '%' => out.push_str("%%"),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}

/// Escape a path for `EnvironmentFile=`, which does not accept double quotes.
///
/// `%` is doubled to avoid specifier expansion and whitespace becomes `\xNN`.
pub fn systemd_escape_environment_file_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    for ch in value.chars() {
        match ch {
            '%' => out.push_str("%%"),
            ' ' => out.push_str("\\x20"),
            '\t' => out.push_str("\\x09"),
            '\n' => out.push_str("\\x0a"),
            '\r' => out.push_str("\\x0d"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(ch),
        }
    }
    out
}

/// Pick the last systemd state word from `systemctl is-active` output
pub fn parse_is_active(output: &str) -> &'static str {
    const STATES: [&str; 7] = [
        "active",
        "inactive",
        "failed",
        "activating",
        "deactivating",
        "reloading",
        "unknown",
    ];
    output
        .split_whitespace()
        .filter_map(|token| STATES.iter().find(|state| **state == token).copied())
        .last()
        .unwrap_or("unknown")
}

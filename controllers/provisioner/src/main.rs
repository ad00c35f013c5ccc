//! Provider Node Provisioner
//!
//! Provisions the `provider-node` LXC workload on a Proxmox VE node and keeps
//! its identity (id, MAC address, API key, firewall rules) stable across runs:
//! - plan phase: resolve node, template, storage, id and identity read-only
//! - apply phase: create, configure and start the workload, rolled back on failure
//! - `--uninstall`: remove the workload, keep the host state for the next install

mod allocator;
mod config;
mod credentials;
mod env_file;
mod error;
mod firewall;
mod host;
mod inventory;
mod nat_helper;
mod network;
mod orchestrator;
mod plan;
mod poll;
mod state_store;
mod uninstall;
mod unit;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod uninstall_test;

use crate::config::{Cli, ProvisioningConfig};
use crate::error::ProvisionError;
use crate::host::LocalHost;
use crate::orchestrator::Provisioner;
use crate::uninstall::Uninstaller;
use clap::Parser;
use pve_client::{PveClient, PveClientTrait};
use std::io::{BufRead, Write};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            if let ProvisionError::Timeout {
                diagnostics: Some(diagnostics),
                ..
            } = &e
            {
                eprintln!("diagnostics:\n{}", diagnostics);
            }
            eprintln!("next step: {}", e.remediation());
            ExitCode::from(e.exit_code())
        }
    }
}

/// Logs go to stderr; stdout carries the plan and reports
fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), ProvisionError> {
    let config = cli.into_config()?;

    info!("Configuration:");
    info!("  API URL: {}", config.api_url);
    info!("  Node: {}", config.node.as_deref().unwrap_or("this host"));
    info!("  State file: {}", config.state_file.display());
    info!("  Data root: {}", config.data_root.display());

    let client = build_client(&config)?;
    client.validate_token().await?;
    let host = LocalHost;

    if config.uninstall {
        confirm_uninstall(&config)?;
        let report = Uninstaller::new(&client, &host, &config).uninstall().await?;
        print!("{}", report);
        return Ok(());
    }

    let provisioner = Provisioner::new(&client, &host, &config);
    if config.dry_run {
        let plan = provisioner.plan().await?;
        print!("{}", plan);
        println!("Dry run: nothing was changed.");
        return Ok(());
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let report = provisioner.provision_until(shutdown).await?;
    print!("{}", report);
    Ok(())
}

fn build_client(config: &ProvisioningConfig) -> Result<PveClient, ProvisionError> {
    let client = match &config.ca_file {
        Some(path) => {
            let pem = std::fs::read(path)?;
            info!("Trusting CA certificate {}", path.display());
            PveClient::with_ca_certificate(config.api_url.clone(), config.api_token.clone(), &pem)?
        }
        None => PveClient::new(config.api_url.clone(), config.api_token.clone())?,
    };
    Ok(client)
}

fn confirm_uninstall(config: &ProvisioningConfig) -> Result<(), ProvisionError> {
    if config.assume_yes {
        return Ok(());
    }
    eprint!(
        "Remove every {} container on this node with its firewall rules? [y/N] ",
        config.name
    );
    std::io::stderr().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Ok(()),
        _ => Err(ProvisionError::Aborted),
    }
}

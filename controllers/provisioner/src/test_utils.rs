//! Test utilities
//!
//! An in-memory [`HostOps`] that records every command, plus a mock platform
//! and a configuration seeded for a single node named `pve1`.

use crate::config::{Cli, PollSettings, ProvisioningConfig};
use crate::error::ProvisionError;
use crate::host::{CommandOutput, HostOps};
use crate::poll::BoundedPoll;
use async_trait::async_trait;
use clap::Parser;
use pve_client::MockPveClient;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const TEMPLATE: &str = "debian-12-standard_12.7-1_amd64.tar.zst";

/// `ip -j -4 addr show` output of the fake host
pub const IP_ADDR_JSON: &str = r#"[
    {"ifindex":1,"ifname":"lo","addr_info":[{"family":"inet","local":"127.0.0.1","prefixlen":8}]},
    {"ifindex":2,"ifname":"eno1","addr_info":[]},
    {"ifindex":3,"ifname":"vmbr0","addr_info":[{"family":"inet","local":"192.168.1.10","prefixlen":24}]}
]"#;

#[derive(Debug, Clone)]
struct FakeFile {
    contents: String,
    mode: u32,
}

/// In-memory host. Commands succeed with empty output unless a response or
/// failure is registered for a substring of the command line.
pub struct FakeHost {
    hostname: String,
    files: Mutex<BTreeMap<PathBuf, FakeFile>>,
    dirs: Mutex<BTreeSet<PathBuf>>,
    owners: Mutex<BTreeMap<PathBuf, (u32, u32)>>,
    commands: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, CommandOutput)>>,
    failures: Mutex<Vec<String>>,
    interrupts: Mutex<Vec<(String, Arc<Notify>)>>,
}

impl FakeHost {
    pub fn new() -> Self {
        let host = Self {
            hostname: "pve1".to_string(),
            files: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(BTreeSet::new()),
            owners: Mutex::new(BTreeMap::new()),
            commands: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            interrupts: Mutex::new(Vec::new()),
        };
        host.respond("ip -j -4 addr show", CommandOutput::ok(IP_ADDR_JSON));
        host.respond("hostname -I", CommandOutput::ok("10.0.0.50 fd00::50\n"));
        host.respond("systemctl is-active", CommandOutput::ok("active\n"));
        host
    }

    /// Answer commands containing `pattern`. Later registrations win.
    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.responses.lock().unwrap().push((pattern.to_string(), output));
    }

    /// Make commands containing `pattern` exit with status 1
    pub fn fail_on(&self, pattern: &str) {
        self.failures.lock().unwrap().push(pattern.to_string());
    }

    /// Commands containing `pattern` never finish; the returned handle is
    /// notified when one starts.
    pub fn interrupt_on(&self, pattern: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.interrupts
            .lock()
            .unwrap()
            .push((pattern.to_string(), Arc::clone(&notify)));
        notify
    }

    /// Every command run so far, as `program arg1 arg2 ...`
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.commands.lock().unwrap().iter().any(|c| c.contains(pattern))
    }

    pub fn put_file(&self, path: &str, contents: &str) {
        self.files.lock().unwrap().insert(
            PathBuf::from(path),
            FakeFile {
                contents: contents.to_string(),
                mode: 0o644,
            },
        );
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(Path::new(path)).map(|f| f.contents.clone())
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        self.files.lock().unwrap().get(Path::new(path)).map(|f| f.mode)
    }

    pub fn owner(&self, path: &Path) -> Option<(u32, u32)> {
        self.owners.lock().unwrap().get(path).copied()
    }

    pub fn has_dir(&self, path: &Path) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }
}

#[async_trait]
impl HostOps for FakeHost {
    fn read_file(&self, path: &Path) -> Result<Option<String>, ProvisionError> {
        Ok(self.files.lock().unwrap().get(path).map(|f| f.contents.clone()))
    }

    fn write_file(&self, path: &Path, contents: &str, mode: u32) -> Result<(), ProvisionError> {
        self.files.lock().unwrap().insert(
            path.to_path_buf(),
            FakeFile {
                contents: contents.to_string(),
                mode,
            },
        );
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<bool, ProvisionError> {
        Ok(self.files.lock().unwrap().remove(path).is_some())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), ProvisionError> {
        self.dirs.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), ProvisionError> {
        self.owners.lock().unwrap().insert(path.to_path_buf(), (uid, gid));
        Ok(())
    }

    fn hostname(&self) -> Result<String, ProvisionError> {
        Ok(self.hostname.clone())
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ProvisionError> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.commands.lock().unwrap().push(line.clone());

        let interrupt = self
            .interrupts
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, notify)| Arc::clone(notify));
        if let Some(notify) = interrupt {
            notify.notify_one();
            std::future::pending::<()>().await;
        }
        if self.failures.lock().unwrap().iter().any(|p| line.contains(p.as_str())) {
            return Ok(CommandOutput::failed(1, format!("{}: injected failure", program)));
        }
        let responses = self.responses.lock().unwrap();
        Ok(responses
            .iter()
            .rev()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

/// One node `pve1` with a template storage, a container storage, two
/// Debian catalog entries and bridge `vmbr0`
pub fn seeded_client() -> MockPveClient {
    let client = MockPveClient::new("https://pve.test:8006");
    client.add_node("pve1");
    client.add_storage("local", "iso,vztmpl,backup", true);
    client.add_storage("local-lvm", "rootdir,images", true);
    client.add_appliance("debian-12-standard_12.2-1_amd64.tar.zst", "debian-12");
    client.add_appliance(TEMPLATE, "debian-12");
    client.add_appliance("ubuntu-24.04-standard_24.04-2_amd64.tar.zst", "ubuntu-24.04");
    client.add_bridge("vmbr0");
    client
}

/// Polls that never sleep
pub fn fast_poll() -> PollSettings {
    let poll = BoundedPoll::new(Duration::ZERO, 3);
    PollSettings {
        task: poll,
        network: poll,
        service: poll,
    }
}

/// Defaults as parsed from a minimal command line, with fast polls
pub fn test_config() -> ProvisioningConfig {
    let cli = Cli::try_parse_from(["workload-provisioner", "--api-token", "root@pam!provisioner=secret"])
        .unwrap();
    let mut config = cli.into_config().unwrap();
    config.ca_file = None;
    config.poll = fast_poll();
    config
}

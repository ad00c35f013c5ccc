//! Uninstall scenarios, including a reinstall on the same host

#[cfg(test)]
mod tests {
    use crate::firewall::{self, ManagedRule};
    use crate::nat_helper::{HELPER_PATH, UNIT_PATH};
    use crate::orchestrator::Provisioner;
    use crate::test_utils::*;
    use crate::uninstall::Uninstaller;
    use pve_client::{FirewallRuleSpec, FirewallTarget, PveClientTrait};

    fn node_target() -> FirewallTarget {
        FirewallTarget::Node { node: "pve1".to_string() }
    }

    fn mac_of(client: &pve_client::MockPveClient, vmid: u32) -> String {
        let net0 = client.container(vmid).unwrap().config["net0"].clone();
        net0.split(',')
            .find_map(|part| part.strip_prefix("hwaddr="))
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_uninstall_then_reinstall_keeps_identity() {
        let client = seeded_client();
        let host = FakeHost::new();
        let config = test_config();

        Provisioner::new(&client, &host, &config).provision().await.unwrap();
        let mac = mac_of(&client, 100);
        let env_path = config.service_env_path().display().to_string();
        let api_key = host.file(&env_path).unwrap();

        let report = Uninstaller::new(&client, &host, &config).uninstall().await.unwrap();
        assert_eq!(report.removed, vec![100]);
        assert!(client.container(100).is_none());
        assert!(host.file(config.state_file.to_str().unwrap()).is_some());

        let report = Provisioner::new(&client, &host, &config).provision().await.unwrap();
        assert_eq!(mac_of(&client, report.vmid), mac);
        assert_eq!(report.api_key_source.to_string(), "kept");
        let key_line = |text: &str| text.lines().find(|l| l.starts_with("API_KEY=")).map(str::to_string);
        assert_eq!(key_line(&host.file(&env_path).unwrap()), key_line(&api_key));
    }

    #[tokio::test]
    async fn test_uninstall_with_nothing_installed() {
        let client = seeded_client();
        let host = FakeHost::new();
        let config = test_config();

        let report = Uninstaller::new(&client, &host, &config).uninstall().await.unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.node_rules_removed, 0);
        assert!(!report.nat_helper_removed);
        assert!(client.calls().is_empty());
        assert!(report.to_string().contains("No provider-node container found on pve1"));
    }

    #[tokio::test]
    async fn test_uninstall_removes_every_canonical_container_on_the_node() {
        let client = seeded_client();
        client.add_container(105, "pve1", "provider-node", "running");
        client.add_container(107, "pve1", "provider-node", "stopped");
        client.add_container(101, "pve1", "dns", "running");
        client.add_container(110, "pve2", "provider-node", "running");
        let host = FakeHost::new();
        host.put_file("/etc/pve/firewall/105.fw", "[OPTIONS]\nenable: 1\n");

        let report = Uninstaller::new(&client, &host, &test_config()).uninstall().await.unwrap();
        assert_eq!(report.removed, vec![105, 107]);
        assert_eq!(client.call_count("stop_container"), 1);
        assert_eq!(client.call_count("stop_container:105"), 1);
        assert_eq!(client.container_ids(), vec![101, 110]);
        assert!(host.file("/etc/pve/firewall/105.fw").is_none());
    }

    #[tokio::test]
    async fn test_uninstall_removes_node_access() {
        let client = seeded_client();
        let host = FakeHost::new();
        let mut config = test_config();
        config.interfaces = Some(vec!["vmbr0".to_string()]);
        Provisioner::new(&client, &host, &config).provision().await.unwrap();

        let ssh = FirewallRuleSpec {
            direction: "in".to_string(),
            action: "ACCEPT".to_string(),
            proto: "tcp".to_string(),
            dport: "22".to_string(),
            source: None,
            comment: "ssh".to_string(),
        };
        client.create_firewall_rule(&node_target(), &ssh).await.unwrap();

        let report = Uninstaller::new(&client, &host, &config).uninstall().await.unwrap();
        assert_eq!(report.node_rules_removed, 1);
        assert!(report.nat_helper_removed);
        assert!(host.file(HELPER_PATH).is_none());
        assert!(host.file(UNIT_PATH).is_none());

        let rules = client.firewall_rules(&node_target());
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].comment.as_deref(), Some("ssh"));
    }

    #[tokio::test]
    async fn test_uninstall_continues_past_firewall_errors() {
        let client = seeded_client();
        let host = FakeHost::new();
        let mut config = test_config();
        config.interfaces = Some(vec!["vmbr0".to_string()]);
        Provisioner::new(&client, &host, &config).provision().await.unwrap();
        client.fail_operation("list_firewall_rules");

        let report = Uninstaller::new(&client, &host, &config).uninstall().await.unwrap();
        assert_eq!(report.removed, vec![100]);
        assert!(client.container(100).is_none());
        assert_eq!(report.node_rules_removed, 0);
        assert_eq!(report.warnings.len(), 1, "{:?}", report.warnings);
        assert!(report.nat_helper_removed);
        assert!(host.file(HELPER_PATH).is_none());

        let text = report.to_string();
        assert!(text.contains("warning: node firewall rule managed:provider-node:port not removed"));
        assert!(text.contains("pveum role delete ProviderNode"));
    }

    #[tokio::test]
    async fn test_uninstall_removes_stale_duplicate_node_rules() {
        let client = seeded_client();
        let rule = ManagedRule::new("provider-node", 8443, None);
        client.create_firewall_rule(&node_target(), &rule.to_spec()).await.unwrap();
        client.create_firewall_rule(&node_target(), &rule.to_spec()).await.unwrap();
        let host = FakeHost::new();

        let report = Uninstaller::new(&client, &host, &test_config()).uninstall().await.unwrap();
        assert_eq!(report.node_rules_removed, 2);
        assert_eq!(
            firewall::teardown_rule(&client, &node_target(), &rule.marker).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_uninstall_keeps_host_state_and_lists_manual_steps() {
        let client = seeded_client();
        let host = FakeHost::new();
        let config = test_config();
        Provisioner::new(&client, &host, &config).provision().await.unwrap();

        let report = Uninstaller::new(&client, &host, &config).uninstall().await.unwrap();
        assert!(host.file(config.service_env_path().to_str().unwrap()).is_some());
        assert_eq!(client.tokens_for("provider-node@pve").len(), 1);

        let text = report.to_string();
        assert!(text.contains("pveum user token remove provider-node@pve service"));
        assert!(text.contains("pveum role delete ProviderNode"));
        assert!(text.contains("rm -rf /var/lib/provider-node"));
    }

    #[tokio::test]
    async fn test_uninstall_stops_on_destroy_failure() {
        let client = seeded_client();
        client.add_container(105, "pve1", "provider-node", "stopped");
        client.fail_operation("destroy_container");
        let host = FakeHost::new();

        assert!(Uninstaller::new(&client, &host, &test_config()).uninstall().await.is_err());
        assert!(client.container(105).is_some());
    }
}

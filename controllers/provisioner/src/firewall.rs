//! Firewall reconciliation
//!
//! Managed rules are identified only by their marker, stored as the rule
//! comment. An upsert removes every rule carrying the marker and adds the
//! desired one, so a rule set never holds two managed rules for the same
//! scope, and a port change replaces the rule instead of adding a second.

use crate::error::ProvisionError;
use pve_client::{FirewallRule, FirewallRuleSpec, FirewallTarget, PveClientTrait, PveError};
use std::fmt;
use tracing::{debug, info};

/// Marker for the service's published port
pub fn marker(service: &str) -> String {
    format!("managed:{}:port", service)
}

/// Desired allow rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedRule {
    pub marker: String,
    pub port: u16,
    /// `None` allows any source
    pub source: Option<String>,
}

impl ManagedRule {
    pub fn new(service: &str, port: u16, source: Option<String>) -> Self {
        Self {
            marker: marker(service),
            port,
            source,
        }
    }

    pub fn to_spec(&self) -> FirewallRuleSpec {
        FirewallRuleSpec {
            direction: "in".to_string(),
            action: "ACCEPT".to_string(),
            proto: "tcp".to_string(),
            dport: self.port.to_string(),
            source: self.source.clone(),
            comment: self.marker.clone(),
        }
    }
}

impl fmt::Display for ManagedRule {
    /// The rule as it reads in a `.fw` file
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IN ACCEPT -p tcp -dport {}", self.port)?;
        if let Some(source) = &self.source {
            write!(f, " -source {}", source)?;
        }
        write!(f, " # {}", self.marker)
    }
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No managed rule existed
    Created,
    /// Managed rules existed and were replaced
    Replaced { removed: usize },
    /// The single managed rule already matched
    Unchanged,
}

fn marked<'a>(rules: &'a [FirewallRule], marker: &'a str) -> impl Iterator<Item = &'a FirewallRule> + 'a {
    rules.iter().filter(move |r| r.comment.as_deref() == Some(marker))
}

/// Delete rules by position, highest first so lower positions stay valid
async fn delete_positions(
    client: &dyn PveClientTrait,
    target: &FirewallTarget,
    mut positions: Vec<u32>,
) -> Result<usize, ProvisionError> {
    positions.sort_unstable_by(|a, b| b.cmp(a));
    for pos in &positions {
        client.delete_firewall_rule(target, *pos).await?;
    }
    Ok(positions.len())
}

/// Make `rule` the only rule with its marker in the target's rule set
pub async fn upsert_rule(
    client: &dyn PveClientTrait,
    target: &FirewallTarget,
    rule: &ManagedRule,
) -> Result<UpsertOutcome, ProvisionError> {
    let spec = rule.to_spec();
    let rules = client.list_firewall_rules(target).await?;
    let existing: Vec<&FirewallRule> = marked(&rules, &rule.marker).collect();

    if existing.len() == 1 && spec.matches(existing[0]) {
        debug!("Firewall rule {} on {} is already present", rule.marker, target);
        return Ok(UpsertOutcome::Unchanged);
    }

    let removed = delete_positions(client, target, existing.iter().map(|r| r.pos).collect()).await?;
    client.create_firewall_rule(target, &spec).await?;

    if removed == 0 {
        info!("Added firewall rule on {}: {}", target, rule);
        Ok(UpsertOutcome::Created)
    } else {
        info!("Replaced {} firewall rule(s) on {}: {}", removed, target, rule);
        Ok(UpsertOutcome::Replaced { removed })
    }
}

/// Remove every rule carrying `marker`. A missing rule set counts as empty.
pub async fn teardown_rule(
    client: &dyn PveClientTrait,
    target: &FirewallTarget,
    marker: &str,
) -> Result<usize, ProvisionError> {
    let rules = match client.list_firewall_rules(target).await {
        Ok(rules) => rules,
        Err(PveError::NotFound(_)) => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let positions = marked(&rules, marker).map(|r| r.pos).collect();
    let removed = delete_positions(client, target, positions).await?;
    if removed > 0 {
        info!("Removed {} firewall rule(s) {} from {}", removed, marker, target);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pve_client::MockPveClient;

    fn setup() -> (MockPveClient, FirewallTarget) {
        let client = MockPveClient::new("https://pve.test:8006");
        client.add_node("pve1");
        (client, FirewallTarget::Node { node: "pve1".to_string() })
    }

    fn unrelated(port: &str) -> FirewallRuleSpec {
        FirewallRuleSpec {
            direction: "in".to_string(),
            action: "ACCEPT".to_string(),
            proto: "tcp".to_string(),
            dport: port.to_string(),
            source: None,
            comment: "ssh".to_string(),
        }
    }

    #[test]
    fn test_rule_text() {
        let rule = ManagedRule::new("provider-node", 8443, Some("+management".to_string()));
        assert_eq!(
            rule.to_string(),
            "IN ACCEPT -p tcp -dport 8443 -source +management # managed:provider-node:port"
        );
        assert_eq!(
            ManagedRule::new("provider-node", 8443, None).to_string(),
            "IN ACCEPT -p tcp -dport 8443 # managed:provider-node:port"
        );
    }

    #[tokio::test]
    async fn test_upsert_twice_with_different_ports_leaves_one_rule() {
        let (client, target) = setup();

        let first = upsert_rule(&client, &target, &ManagedRule::new("provider-node", 8443, None)).await.unwrap();
        assert_eq!(first, UpsertOutcome::Created);
        let second = upsert_rule(&client, &target, &ManagedRule::new("provider-node", 9443, None)).await.unwrap();
        assert_eq!(second, UpsertOutcome::Replaced { removed: 1 });

        let rules = client.firewall_rules(&target);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].dport.as_deref(), Some("9443"));
    }

    #[tokio::test]
    async fn test_upsert_same_rule_is_unchanged() {
        let (client, target) = setup();
        let rule = ManagedRule::new("provider-node", 8443, None);
        upsert_rule(&client, &target, &rule).await.unwrap();
        assert_eq!(upsert_rule(&client, &target, &rule).await.unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(client.call_count("create_firewall_rule"), 1);
    }

    #[tokio::test]
    async fn test_upsert_collapses_duplicates_and_keeps_other_rules() {
        let (client, target) = setup();
        let rule = ManagedRule::new("provider-node", 8443, None);
        client.create_firewall_rule(&target, &unrelated("22")).await.unwrap();
        client.create_firewall_rule(&target, &rule.to_spec()).await.unwrap();
        client.create_firewall_rule(&target, &unrelated("80")).await.unwrap();
        client.create_firewall_rule(&target, &rule.to_spec()).await.unwrap();

        let outcome = upsert_rule(&client, &target, &rule).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Replaced { removed: 2 });

        let rules = client.firewall_rules(&target);
        assert_eq!(rules.len(), 3);
        assert_eq!(rules.iter().filter(|r| r.comment.as_deref() == Some(rule.marker.as_str())).count(), 1);
        assert_eq!(rules.iter().filter(|r| r.comment.as_deref() == Some("ssh")).count(), 2);
    }

    #[tokio::test]
    async fn test_marker_match_is_exact() {
        let (client, target) = setup();
        let mut lookalike = unrelated("8443");
        lookalike.comment = "managed:provider-node:port (old)".to_string();
        client.create_firewall_rule(&target, &lookalike).await.unwrap();

        assert_eq!(teardown_rule(&client, &target, &marker("provider-node")).await.unwrap(), 0);
        assert_eq!(client.firewall_rules(&target).len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (client, target) = setup();
        let rule = ManagedRule::new("provider-node", 8443, None);
        upsert_rule(&client, &target, &rule).await.unwrap();

        assert_eq!(teardown_rule(&client, &target, &rule.marker).await.unwrap(), 1);
        assert_eq!(teardown_rule(&client, &target, &rule.marker).await.unwrap(), 0);
        assert!(client.firewall_rules(&target).is_empty());
    }

    #[tokio::test]
    async fn test_teardown_of_missing_container_rule_set() {
        let client = MockPveClient::new("https://pve.test:8006");
        let target = FirewallTarget::Container { node: "pve1".to_string(), vmid: 999 };
        assert_eq!(teardown_rule(&client, &target, "managed:provider-node:port").await.unwrap(), 0);
    }
}

//! Firewall operations for MockPveClient
//!
//! Rule sets behave like the platform's: new rules are inserted at position 0
//! and positions are renumbered after every change.

use super::{MockPveClient, lock};
use crate::error::PveError;
use crate::models::*;

fn renumber(rules: &mut [FirewallRule]) {
    for (pos, rule) in rules.iter_mut().enumerate() {
        rule.pos = pos as u32;
    }
}

fn ensure_target_exists(client: &MockPveClient, target: &FirewallTarget) -> Result<(), PveError> {
    match target {
        FirewallTarget::Container { vmid, .. } if !lock(&client.containers).contains_key(vmid) => {
            Err(PveError::NotFound(format!("CT {} does not exist", vmid)))
        }
        _ => Ok(()),
    }
}

pub async fn list_rules(client: &MockPveClient, target: &FirewallTarget) -> Result<Vec<FirewallRule>, PveError> {
    client.check("list_firewall_rules")?;
    ensure_target_exists(client, target)?;
    Ok(client.firewall_rules(target))
}

pub async fn create_rule(client: &MockPveClient, target: &FirewallTarget, rule: &FirewallRuleSpec) -> Result<(), PveError> {
    client.check("create_firewall_rule")?;
    ensure_target_exists(client, target)?;

    let mut firewall = lock(&client.firewall);
    let rules = firewall.entry(target.clone()).or_default();
    rules.insert(
        0,
        FirewallRule {
            pos: 0,
            direction: rule.direction.clone(),
            action: rule.action.clone(),
            proto: Some(rule.proto.clone()),
            dport: Some(rule.dport.clone()),
            source: rule.source.clone(),
            comment: Some(rule.comment.clone()),
            enable: true,
        },
    );
    renumber(rules);
    drop(firewall);

    client.record(format!("create_firewall_rule:{}", target));
    Ok(())
}

pub async fn delete_rule(client: &MockPveClient, target: &FirewallTarget, pos: u32) -> Result<(), PveError> {
    client.check("delete_firewall_rule")?;
    let mut firewall = lock(&client.firewall);
    let rules = firewall.entry(target.clone()).or_default();
    let index = pos as usize;
    if index >= rules.len() {
        return Err(PveError::InvalidRequest(format!("no rule at position {}", pos)));
    }
    rules.remove(index);
    renumber(rules);
    drop(firewall);

    client.record(format!("delete_firewall_rule:{}:{}", target, pos));
    Ok(())
}

pub async fn set_container_enabled(client: &MockPveClient, node: &str, vmid: u32, enabled: bool) -> Result<(), PveError> {
    client.check("set_container_firewall_enabled")?;
    ensure_target_exists(client, &FirewallTarget::Container { node: node.to_string(), vmid })?;
    client.record(format!("set_container_firewall_enabled:{}:{}", vmid, enabled));
    Ok(())
}

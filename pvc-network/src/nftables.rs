//! nftables rule generation and reload.
//!
//! Each network renders its ruleset into one file under the nft dynamic
//! directory; an aggregate file flushes the ruleset and includes every
//! per-network file, and a single `nft -f` reload applies the result
//! atomically.

use std::path::Path;

use anyhow::{bail, Context, Error};
use tracing::info;

use pvc_common::command::run_command;
use pvc_store::{Handle, Key, NetworkKey, RuleDirection, RuleKey};

use crate::definition::NetworkDefinition;

/// One direction's custom rules, ordered by their `order` key then name.
fn ordered_rules(
    handle: &Handle,
    vni: &str,
    direction: RuleDirection,
) -> Result<Vec<String>, Error> {
    let chain = match direction {
        RuleDirection::In => NetworkKey::RulesIn,
        RuleDirection::Out => NetworkKey::RulesOut,
    };
    let mut rules: Vec<(u64, String, String)> = Vec::new();
    for id in handle.children(Key::Network(vni, chain))? {
        let fields = handle.read_many(&[
            Key::FirewallRule(vni, direction, &id, RuleKey::Rule),
            Key::FirewallRule(vni, direction, &id, RuleKey::Order),
        ])?;
        let Some(rule) = fields[0].clone().filter(|rule| !rule.is_empty()) else {
            continue;
        };
        let order = fields[1]
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(u64::MAX);
        rules.push((order, id, rule));
    }
    rules.sort();
    Ok(rules.into_iter().map(|(_, _, rule)| rule).collect())
}

/// Render the nftables fragment for one network.
pub fn render_network_rules(
    definition: &NetworkDefinition,
    rules_in: &[String],
    rules_out: &[String],
) -> String {
    let vni = &definition.vni;
    let mut out = String::new();
    out.push_str(&format!("# network {vni} rules\n"));
    out.push_str(&format!("add chain inet filter {vni}-in\n"));
    out.push_str(&format!("add chain inet filter {vni}-out\n"));
    if let Some(network) = definition.ip4_network {
        let network = network.network();
        out.push_str(&format!(
            "add rule inet filter forward ip daddr {network} counter jump {vni}-in\n"
        ));
        out.push_str(&format!(
            "add rule inet filter forward ip saddr {network} counter jump {vni}-out\n"
        ));
    }
    for rule in rules_in {
        out.push_str(&format!("add rule inet filter {vni}-in {rule}\n"));
    }
    for rule in rules_out {
        out.push_str(&format!("add rule inet filter {vni}-out {rule}\n"));
    }
    out
}

/// Write the per-network rules file from the store.
pub fn write_network_rules(
    handle: &Handle,
    definition: &NetworkDefinition,
    nft_dir: &Path,
) -> Result<(), Error> {
    let rules_in = ordered_rules(handle, &definition.vni, RuleDirection::In)?;
    let rules_out = ordered_rules(handle, &definition.vni, RuleDirection::Out)?;
    let contents = render_network_rules(definition, &rules_in, &rules_out);
    let path = nft_dir.join(format!("network-{}.nft", definition.vni));
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Remove a network's rules file.
pub fn remove_network_rules(vni: &str, nft_dir: &Path) {
    let _ = std::fs::remove_file(nft_dir.join(format!("network-{vni}.nft")));
}

/// Regenerate the aggregate file and reload the whole ruleset.
pub fn reload_firewall(nft_dir: &Path) -> Result<(), Error> {
    let mut aggregate = String::from("flush ruleset\n");
    aggregate.push_str("add table inet filter\n");
    aggregate.push_str("add chain inet filter forward { type filter hook forward priority 0; }\n");

    let mut fragments: Vec<_> = std::fs::read_dir(nft_dir)
        .with_context(|| format!("failed to read {}", nft_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().map(|ext| ext == "nft").unwrap_or(false)
                && path
                    .file_name()
                    .map(|name| name.to_string_lossy().starts_with("network-"))
                    .unwrap_or(false)
        })
        .collect();
    fragments.sort();
    for fragment in fragments {
        aggregate.push_str(&format!("include \"{}\"\n", fragment.display()));
    }

    let base = nft_dir.join("networks.nft");
    std::fs::write(&base, aggregate)
        .with_context(|| format!("failed to write {}", base.display()))?;

    info!("reloading firewall configuration");
    let output = run_command(&format!("/usr/sbin/nft -f {}", base.display()), None)?;
    if !output.success() {
        bail!("failed to reload firewall: {}", output.stderr.trim());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definition::NetworkType;

    #[test]
    fn test_render_network_rules() {
        let definition = NetworkDefinition {
            vni: "100".to_owned(),
            net_type: NetworkType::Managed,
            domain: None,
            name_servers: Vec::new(),
            ip4_network: Some("10.100.0.17/24".parse().unwrap()),
            ip4_gateway: None,
            dhcp4_enabled: false,
            dhcp4_start: None,
            dhcp4_end: None,
        };
        let rendered = render_network_rules(
            &definition,
            &["tcp dport 22 accept".to_owned()],
            &["counter drop".to_owned()],
        );
        assert!(rendered.contains("add chain inet filter 100-in"));
        // host bits are normalized away
        assert!(rendered.contains("ip daddr 10.100.0.0/24 counter jump 100-in"));
        assert!(rendered.contains("add rule inet filter 100-in tcp dport 22 accept"));
        assert!(rendered.contains("add rule inet filter 100-out counter drop"));
    }
}

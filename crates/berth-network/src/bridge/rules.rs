//! Firewall rules owned by a bridge network.

use berth_common::BerthResult;

use super::config::BridgeNetworkConfig;
use crate::firewall::{Firewall, Table};

/// One rule in a fixed table and chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Table holding the rule.
    pub table: Table,
    /// Built-in chain holding the rule.
    pub chain: &'static str,
    /// Match and target arguments.
    pub args: Vec<String>,
}

impl Rule {
    fn new(table: Table, chain: &'static str, args: &[&str]) -> Self {
        Self {
            table,
            chain,
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }

    /// Arguments as borrowed strings.
    #[must_use]
    pub fn args(&self) -> Vec<&str> {
        self.args.iter().map(String::as_str).collect()
    }

    fn ensure(&self, fw: &dyn Firewall) -> BerthResult<()> {
        fw.ensure_rule(self.table, self.chain, &self.args())
    }

    fn remove_best_effort(&self, fw: &dyn Firewall) {
        if let Err(e) = fw.remove_rule(self.table, self.chain, &self.args()) {
            tracing::warn!(
                table = %self.table,
                chain = self.chain,
                rule = ?self.args,
                error = %e,
                "Unable to remove firewall rule"
            );
        }
    }
}

/// Masquerade traffic from the bridge subnet leaving through another link.
#[must_use]
pub fn masquerade(config: &BridgeNetworkConfig) -> Rule {
    let subnet = config.bridge_subnet().to_string();
    let bridge = config.bridge_interface.as_str();
    Rule::new(
        Table::Nat,
        "POSTROUTING",
        &["-s", &subnet, "!", "-o", bridge, "-j", "MASQUERADE"],
    )
}

/// Bridge to bridge forwarding, accepted when `allow` and dropped otherwise.
#[must_use]
pub fn inter_container(config: &BridgeNetworkConfig, allow: bool) -> Rule {
    let bridge = config.bridge_interface.as_str();
    let target = if allow { "ACCEPT" } else { "DROP" };
    Rule::new(
        Table::Filter,
        "FORWARD",
        &["-i", bridge, "-o", bridge, "-j", target],
    )
}

/// Bridge to elsewhere forwarding.
#[must_use]
pub fn outgoing(config: &BridgeNetworkConfig) -> Rule {
    let bridge = config.bridge_interface.as_str();
    Rule::new(
        Table::Filter,
        "FORWARD",
        &["-i", bridge, "!", "-o", bridge, "-j", "ACCEPT"],
    )
}

/// Return traffic of established connections into the bridge.
#[must_use]
pub fn established(config: &BridgeNetworkConfig) -> Rule {
    let bridge = config.bridge_interface.as_str();
    Rule::new(
        Table::Filter,
        "FORWARD",
        &[
            "-o",
            bridge,
            "-m",
            "conntrack",
            "--ctstate",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ],
    )
}

/// Jumps into the bridge's management chain.
#[must_use]
pub fn chain_jumps(config: &BridgeNetworkConfig) -> [Rule; 2] {
    let chain = config.chain_name();
    let bridge = config.bridge_interface.as_str();
    [
        Rule::new(
            Table::Nat,
            "PREROUTING",
            &["-m", "addrtype", "--dst-type", "LOCAL", "-j", &chain],
        ),
        Rule::new(Table::Filter, "FORWARD", &["-o", bridge, "-j", &chain]),
    ]
}

/// Install the rule groups and a fresh management chain.
pub fn apply(fw: &dyn Firewall, config: &BridgeNetworkConfig) -> BerthResult<()> {
    let chain = config.chain_name();
    tracing::debug!(bridge = %config.bridge_interface, chain = %chain, "Configuring firewall");

    teardown_chain(fw, config)?;

    if config.enable_masquerade {
        masquerade(config).ensure(fw)?;
    }

    inter_container(config, !config.enable_icc).remove_best_effort(fw);
    inter_container(config, config.enable_icc).ensure(fw)?;

    outgoing(config).ensure(fw)?;
    established(config).ensure(fw)?;

    for table in [Table::Nat, Table::Filter] {
        fw.create_chain(table, &chain)?;
    }
    for jump in chain_jumps(config) {
        jump.ensure(fw)?;
    }

    Ok(())
}

/// Remove every rule and the chain. Failures are logged only.
pub fn remove(fw: &dyn Firewall, config: &BridgeNetworkConfig) {
    tracing::debug!(bridge = %config.bridge_interface, "Removing firewall rules");

    for rule in [
        masquerade(config),
        inter_container(config, true),
        inter_container(config, false),
        outgoing(config),
        established(config),
    ] {
        rule.remove_best_effort(fw);
    }

    if let Err(e) = teardown_chain(fw, config) {
        tracing::warn!(chain = %config.chain_name(), error = %e, "Unable to remove chain");
    }
}

/// Drop the jumps into the management chain, then the chain itself.
fn teardown_chain(fw: &dyn Firewall, config: &BridgeNetworkConfig) -> BerthResult<()> {
    for jump in chain_jumps(config) {
        jump.remove_best_effort(fw);
    }

    let chain = config.chain_name();
    for table in [Table::Nat, Table::Filter] {
        fw.remove_chain(table, &chain)?;
    }
    Ok(())
}

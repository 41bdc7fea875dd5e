//! Packet filter access.
//!
//! Rules are always checked before insertion so repeated reconciliation
//! converges instead of appending duplicates.

use std::fmt;
use std::process::{Command, Output};

use berth_common::{BerthError, BerthResult};

/// Netfilter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// The default filter table.
    Filter,
    /// The NAT table.
    Nat,
}

impl Table {
    /// Table name as iptables spells it.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule and chain operations.
///
/// `rule` is the match/target part of an iptables rule, without the table,
/// command or chain.
pub trait Firewall: Send + Sync {
    /// Whether an identical rule is present in `chain`.
    fn rule_exists(&self, table: Table, chain: &str, rule: &[&str]) -> BerthResult<bool>;

    /// Insert a rule at the head of `chain`.
    fn insert_rule(&self, table: Table, chain: &str, rule: &[&str]) -> BerthResult<()>;

    /// Delete a rule from `chain`.
    fn delete_rule(&self, table: Table, chain: &str, rule: &[&str]) -> BerthResult<()>;

    /// Create a user chain.
    fn create_chain(&self, table: Table, chain: &str) -> BerthResult<()>;

    /// Flush and delete a user chain. A missing chain is not an error.
    fn remove_chain(&self, table: Table, chain: &str) -> BerthResult<()>;

    /// Insert `rule` unless it is already present.
    fn ensure_rule(&self, table: Table, chain: &str, rule: &[&str]) -> BerthResult<()> {
        if self.rule_exists(table, chain, rule)? {
            return Ok(());
        }
        self.insert_rule(table, chain, rule)
    }

    /// Delete `rule` if it is present.
    fn remove_rule(&self, table: Table, chain: &str, rule: &[&str]) -> BerthResult<()> {
        if self.rule_exists(table, chain, rule)? {
            self.delete_rule(table, chain, rule)?;
        }
        Ok(())
    }
}

/// [`Firewall`] backed by the `iptables` command.
#[derive(Debug, Clone)]
pub struct IptablesFirewall {
    binary: String,
}

impl Default for IptablesFirewall {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl IptablesFirewall {
    /// Use the given iptables binary.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, table: Table, args: &[&str]) -> BerthResult<Output> {
        Command::new(&self.binary)
            .args(["-t", table.as_str()])
            .args(args)
            .output()
            .map_err(|e| BerthError::Internal {
                message: format!("Failed to execute {}: {}", self.binary, e),
            })
    }

    fn run_checked(&self, table: Table, args: &[&str]) -> BerthResult<()> {
        let output = self.run(table, args)?;
        if !output.status.success() {
            return Err(BerthError::Internal {
                message: format!(
                    "iptables -t {} {} failed: {}",
                    table,
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

impl Firewall for IptablesFirewall {
    fn rule_exists(&self, table: Table, chain: &str, rule: &[&str]) -> BerthResult<bool> {
        let mut args = vec!["-C", chain];
        args.extend_from_slice(rule);
        Ok(self.run(table, &args)?.status.success())
    }

    fn insert_rule(&self, table: Table, chain: &str, rule: &[&str]) -> BerthResult<()> {
        tracing::debug!(%table, chain, rule = ?rule, "Inserting firewall rule");
        let mut args = vec!["-I", chain];
        args.extend_from_slice(rule);
        self.run_checked(table, &args)
    }

    fn delete_rule(&self, table: Table, chain: &str, rule: &[&str]) -> BerthResult<()> {
        tracing::debug!(%table, chain, rule = ?rule, "Deleting firewall rule");
        let mut args = vec!["-D", chain];
        args.extend_from_slice(rule);
        self.run_checked(table, &args)
    }

    fn create_chain(&self, table: Table, chain: &str) -> BerthResult<()> {
        tracing::debug!(%table, chain, "Creating chain");
        self.run_checked(table, &["-N", chain])
    }

    fn remove_chain(&self, table: Table, chain: &str) -> BerthResult<()> {
        // Flush fails when the chain does not exist; that is the "already gone" case.
        if !self.run(table, &["-F", chain])?.status.success() {
            return Ok(());
        }
        tracing::debug!(%table, chain, "Removing chain");
        self.run_checked(table, &["-X", chain])
    }
}

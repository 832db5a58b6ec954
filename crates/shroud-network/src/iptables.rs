//! Rule-table access.
//!
//! [`RuleTable`] is the seam over the `iptables` binary. The helpers in this
//! module build on [`RuleTable::raw`] so that enabling a rule never inserts it
//! twice and disabling never deletes a rule that is absent.

use std::fmt;
use std::process::Command;

use shroud_common::{ShroudError, ShroudResult};

/// Rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// `nat` table.
    Nat,
    /// `filter` table.
    Filter,
}

impl Table {
    /// Get the table name for iptables.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single rule: table, chain and match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Table holding the chain.
    pub table: Table,
    /// Chain the rule lives in.
    pub chain: String,
    /// Match and target arguments.
    pub args: Vec<String>,
}

impl Rule {
    /// Create a rule.
    pub fn new(table: Table, chain: &str, args: &[&str]) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            args: args.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Full argument vector for `op` (`-C`, `-I`, `-A`, `-D`).
    #[must_use]
    pub fn command(&self, op: &str) -> Vec<String> {
        let mut cmd = vec![
            "-t".to_string(),
            self.table.as_str().to_string(),
            op.to_string(),
            self.chain.clone(),
        ];
        cmd.extend(self.args.iter().cloned());
        cmd
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {} {}", self.table, self.chain, self.args.join(" "))
    }
}

/// A user-defined chain owned by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainInfo {
    /// Chain name.
    pub name: String,
    /// Table holding the chain.
    pub table: Table,
}

/// Access to the host's packet-filter rule tables.
pub trait RuleTable: Send + Sync {
    /// Run the rule tool with `args` and return its standard output.
    fn raw(&self, args: &[String]) -> ShroudResult<String>;

    /// Whether `rule` is present.
    fn exists(&self, rule: &Rule) -> bool {
        self.raw(&rule.command("-C")).is_ok()
    }

    /// Whether a chain exists in `table`.
    fn chain_exists(&self, table: Table, chain: &str) -> bool {
        self.raw(&[
            "-t".to_string(),
            table.as_str().to_string(),
            "-n".to_string(),
            "-L".to_string(),
            chain.to_string(),
        ])
        .is_ok()
    }
}

/// [`RuleTable`] that shells out to `iptables`.
#[derive(Debug, Default, Clone)]
pub struct Iptables;

impl RuleTable for Iptables {
    fn raw(&self, args: &[String]) -> ShroudResult<String> {
        let output = Command::new("iptables")
            .arg("--wait")
            .args(args)
            .output()
            .map_err(|e| ShroudError::infra("execute iptables", e))?;

        if !output.status.success() {
            return Err(ShroudError::infra(
                format!("iptables {}", args.join(" ")),
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Insert (`enable`) or delete a rule, checking for its presence first.
pub fn program_rule(
    ipt: &dyn RuleTable,
    rule: &Rule,
    description: &str,
    enable: bool,
) -> ShroudResult<()> {
    let exists = ipt.exists(rule);
    let (needed, op, operation) = if enable {
        (!exists, "-I", "enable")
    } else {
        (exists, "-D", "disable")
    };

    if needed {
        let output = ipt
            .raw(&rule.command(op))
            .map_err(|e| ShroudError::infra(format!("{operation} {description} rule"), e))?;
        if !output.trim().is_empty() {
            return Err(ShroudError::infra(
                format!("{operation} {description} rule in chain {}", rule.chain),
                output.trim(),
            ));
        }
        tracing::debug!(rule = %rule, operation, "Programmed rule");
    }

    Ok(())
}

/// Create a chain unless it already exists.
///
/// Returns the chain and whether this call created it.
pub fn new_chain(ipt: &dyn RuleTable, name: &str, table: Table) -> ShroudResult<(ChainInfo, bool)> {
    let chain = ChainInfo {
        name: name.to_string(),
        table,
    };
    if ipt.chain_exists(table, name) {
        return Ok((chain, false));
    }
    ipt.raw(&[
        "-t".to_string(),
        table.as_str().to_string(),
        "-N".to_string(),
        name.to_string(),
    ])
    .map_err(|e| ShroudError::infra(format!("create {table} chain {name}"), e))?;
    tracing::debug!(chain = name, %table, "Created chain");
    Ok((chain, true))
}

/// Delete a chain if it exists. The chain must be empty and unreferenced.
pub fn remove_chain(ipt: &dyn RuleTable, chain: &ChainInfo) -> ShroudResult<()> {
    if !ipt.chain_exists(chain.table, &chain.name) {
        return Ok(());
    }
    ipt.raw(&[
        "-t".to_string(),
        chain.table.as_str().to_string(),
        "-X".to_string(),
        chain.name.clone(),
    ])
    .map_err(|e| {
        ShroudError::infra(format!("remove {} chain {}", chain.table, chain.name), e)
    })?;
    tracing::debug!(chain = %chain.name, table = %chain.table, "Removed chain");
    Ok(())
}

/// Jump rules sending NAT traffic for local destinations into `chain`.
#[must_use]
pub fn nat_jump_rules(chain: &str) -> [Rule; 2] {
    [
        Rule::new(
            Table::Nat,
            "PREROUTING",
            &["-m", "addrtype", "--dst-type", "LOCAL", "-j", chain],
        ),
        Rule::new(
            Table::Nat,
            "OUTPUT",
            &[
                "-m",
                "addrtype",
                "--dst-type",
                "LOCAL",
                "-j",
                chain,
                "!",
                "--dst",
                "127.0.0.0/8",
            ],
        ),
    ]
}

/// Jump rule sending traffic forwarded into `bridge` through `chain`.
#[must_use]
pub fn filter_jump_rule(chain: &str, bridge: &str) -> Rule {
    Rule::new(Table::Filter, "FORWARD", &["-o", bridge, "-j", chain])
}

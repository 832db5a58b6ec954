//! Packet filtering for a network's bridge.
//!
//! [`BridgeFirewall`] wires one bridge into the driver's `TOR` chains and
//! redirects the bridge's outbound TCP connections and DNS queries to the
//! proxy. Every programming step pushes a [`Rollback`] before the next step
//! runs, so a failure at any point can be unwound with
//! [`BridgeFirewall::teardown`].
//!
//! The chains, their NAT jump rules and the chain-wide UDP drop are shared by
//! every network. They are installed idempotently and removed only together
//! with the chains.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use shroud_common::ShroudResult;

use crate::addr::Cidr;
use crate::config::{CHAIN_NAME, DriverConfig};
use crate::iptables::{
    ChainInfo, Rule, RuleTable, Table, filter_jump_rule, nat_jump_rules, new_chain, program_rule,
    remove_chain,
};

/// One reversible programming step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rollback {
    /// Delete a rule that was enabled.
    Rule {
        /// The rule to delete.
        rule: Rule,
        /// Human-readable purpose, used in logs and errors.
        description: String,
    },
    /// Remove the inter-container policy rule of a bridge.
    Icc {
        /// Bridge name.
        bridge: String,
        /// Whether the ACCEPT (true) or DROP (false) variant was installed.
        allow: bool,
    },
    /// Detach the bridge from the driver's filter chain.
    FilterJump {
        /// Bridge name.
        bridge: String,
    },
}

impl Rollback {
    fn undo(&self, ipt: &dyn RuleTable) -> ShroudResult<()> {
        match self {
            Self::Rule { rule, description } => program_rule(ipt, rule, description, false),
            Self::Icc { bridge, allow } => {
                program_rule(ipt, &icc_rule(bridge, *allow), "inter-container", false)
            }
            Self::FilterJump { bridge } => program_rule(
                ipt,
                &filter_jump_rule(CHAIN_NAME, bridge),
                "filter jump",
                false,
            ),
        }
    }
}

impl fmt::Display for Rollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule { rule, description } => write!(f, "remove {description} rule ({rule})"),
            Self::Icc { bridge, allow } => {
                let verb = if *allow { "allow" } else { "drop" };
                write!(f, "remove inter-container {verb} rule for {bridge}")
            }
            Self::FilterJump { bridge } => write!(f, "remove filter jump for {bridge}"),
        }
    }
}

fn icc_rule(bridge: &str, allow: bool) -> Rule {
    let target = if allow { "ACCEPT" } else { "DROP" };
    Rule::new(
        Table::Filter,
        "FORWARD",
        &["-i", bridge, "-o", bridge, "-p", "tcp", "-j", target],
    )
}

fn udp_drop_rule() -> Rule {
    Rule::new(Table::Filter, CHAIN_NAME, &["-p", "udp", "-j", "DROP"])
}

/// Rules installed once for all networks and removed with the chains.
fn shared_rules() -> Vec<(Rule, &'static str)> {
    let mut rules: Vec<_> = nat_jump_rules(CHAIN_NAME)
        .into_iter()
        .map(|rule| (rule, "NAT jump"))
        .collect();
    rules.push((udp_drop_rule(), "UDP drop"));
    rules
}

/// The driver's chain pair.
#[derive(Debug, Clone)]
struct Chains {
    nat: ChainInfo,
    filter: ChainInfo,
}

/// Filtering state of one bridge.
pub struct BridgeFirewall {
    ipt: Arc<dyn RuleTable>,
    bridge: String,
    subnet: Cidr,
    chains: Option<Chains>,
    rollback: Vec<Rollback>,
}

impl BridgeFirewall {
    /// Create the firewall state for `bridge`, whose gateway is `gateway`.
    pub fn new(ipt: Arc<dyn RuleTable>, bridge: &str, gateway: Cidr) -> Self {
        Self {
            ipt,
            bridge: bridge.to_string(),
            subnet: gateway.network(),
            chains: None,
            rollback: Vec::new(),
        }
    }

    /// Registered rollback actions, oldest first.
    #[must_use]
    pub fn rollback_actions(&self) -> &[Rollback] {
        &self.rollback
    }

    /// Create the NAT and FILTER chains unless they already exist.
    ///
    /// If the FILTER chain cannot be created, a NAT chain created by this
    /// call is removed again.
    pub fn create_chains(&mut self) -> ShroudResult<()> {
        let ipt = self.ipt.as_ref();
        let (nat, nat_created) = new_chain(ipt, CHAIN_NAME, Table::Nat)?;
        let filter = match new_chain(ipt, CHAIN_NAME, Table::Filter) {
            Ok((filter, _)) => filter,
            Err(e) => {
                if !nat_created {
                    return Err(e);
                }
                let notes = match remove_chain(ipt, &nat) {
                    Ok(()) => Vec::new(),
                    Err(cleanup) => {
                        tracing::warn!(chain = CHAIN_NAME, error = %cleanup, "Failed to remove NAT chain");
                        vec![cleanup.to_string()]
                    }
                };
                return Err(e.with_cleanup(notes));
            }
        };
        self.chains = Some(Chains { nat, filter });
        Ok(())
    }

    /// Program the bridge's rules and the redirection to `proxy`.
    pub fn program_bridge(&mut self, proxy: IpAddr, config: &DriverConfig) -> ShroudResult<()> {
        let bridge = self.bridge.clone();
        let br = bridge.as_str();
        let subnet = self.subnet.to_string();

        self.enable(
            Rule::new(
                Table::Nat,
                "POSTROUTING",
                &["-s", &subnet, "!", "-o", br, "-j", "MASQUERADE"],
            ),
            "NAT",
        )?;

        self.set_icc(config.icc)?;

        self.enable(
            Rule::new(Table::Filter, "FORWARD", &["-i", br, "!", "-o", br, "-j", "ACCEPT"]),
            "outgoing",
        )?;
        self.enable(
            Rule::new(
                Table::Filter,
                "FORWARD",
                &[
                    "-o",
                    br,
                    "-m",
                    "conntrack",
                    "--ctstate",
                    "RELATED,ESTABLISHED",
                    "-j",
                    "ACCEPT",
                ],
            ),
            "incoming",
        )?;

        for rule in nat_jump_rules(CHAIN_NAME) {
            program_rule(self.ipt.as_ref(), &rule, "NAT jump", true)?;
        }
        program_rule(
            self.ipt.as_ref(),
            &filter_jump_rule(CHAIN_NAME, br),
            "filter jump",
            true,
        )?;
        self.rollback.push(Rollback::FilterJump {
            bridge: bridge.clone(),
        });

        let dns = SocketAddr::new(proxy, config.dns_port).to_string();
        let trans = SocketAddr::new(proxy, config.trans_port).to_string();
        self.enable(
            Rule::new(
                Table::Nat,
                "PREROUTING",
                &[
                    "-i",
                    br,
                    "-p",
                    "udp",
                    "--dport",
                    "53",
                    "-j",
                    "DNAT",
                    "--to-destination",
                    &dns,
                ],
            ),
            "DNS redirect",
        )?;
        self.enable(
            Rule::new(
                Table::Nat,
                "PREROUTING",
                &[
                    "-i",
                    br,
                    "-p",
                    "tcp",
                    "--syn",
                    "-j",
                    "DNAT",
                    "--to-destination",
                    &trans,
                ],
            ),
            "TCP redirect",
        )?;

        if config.block_udp {
            let proxy = proxy.to_string();
            self.enable(
                Rule::new(
                    Table::Filter,
                    "FORWARD",
                    &["-i", br, "-p", "udp", "!", "-d", &proxy, "-j", "DROP"],
                ),
                "outgoing UDP drop",
            )?;
            self.enable(
                Rule::new(
                    Table::Filter,
                    "FORWARD",
                    &["-o", br, "-p", "udp", "!", "-s", &proxy, "-j", "DROP"],
                ),
                "incoming UDP drop",
            )?;
            program_rule(self.ipt.as_ref(), &udp_drop_rule(), "UDP drop", true)?;
        }

        tracing::info!(bridge = br, %proxy, "Bridge firewall programmed");
        Ok(())
    }

    fn enable(&mut self, rule: Rule, description: &str) -> ShroudResult<()> {
        program_rule(self.ipt.as_ref(), &rule, description, true)?;
        self.rollback.push(Rollback::Rule {
            rule,
            description: description.to_string(),
        });
        Ok(())
    }

    fn set_icc(&mut self, allow: bool) -> ShroudResult<()> {
        let ipt = self.ipt.as_ref();
        program_rule(ipt, &icc_rule(&self.bridge, !allow), "inter-container", false)?;
        program_rule(ipt, &icc_rule(&self.bridge, allow), "inter-container", true)?;
        self.rollback.push(Rollback::Icc {
            bridge: self.bridge.clone(),
            allow,
        });
        Ok(())
    }

    /// Undo every registered step, newest first, then optionally remove the
    /// shared chains.
    ///
    /// Failures do not stop the teardown; their messages are returned.
    pub fn teardown(&mut self, remove_chains: bool) -> Vec<String> {
        let ipt = self.ipt.as_ref();
        let mut notes = Vec::new();

        while let Some(action) = self.rollback.pop() {
            if let Err(e) = action.undo(ipt) {
                tracing::warn!(bridge = %self.bridge, action = %action, error = %e, "Rollback step failed");
                notes.push(format!("{action}: {e}"));
            }
        }

        if !remove_chains {
            return notes;
        }
        let Some(chains) = self.chains.take() else {
            return notes;
        };

        for (rule, description) in shared_rules() {
            if let Err(e) = program_rule(ipt, &rule, description, false) {
                tracing::warn!(error = %e, "Failed to remove shared rule");
                notes.push(e.to_string());
            }
        }
        for chain in [&chains.nat, &chains.filter] {
            if let Err(e) = remove_chain(ipt, chain) {
                tracing::warn!(chain = %chain.name, table = %chain.table, error = %e, "Failed to remove chain");
                notes.push(e.to_string());
            }
        }

        notes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryRules;

    const PROXY: &str = "172.17.0.2";

    fn firewall(ipt: &Arc<MemoryRules>, bridge: &str) -> BridgeFirewall {
        let rules: Arc<dyn RuleTable> = ipt.clone();
        BridgeFirewall::new(rules, bridge, "172.18.0.1/16".parse().unwrap())
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn program_and_teardown() {
        let ipt = Arc::new(MemoryRules::new());
        let mut fw = firewall(&ipt, "torbr-net1");

        fw.create_chains().unwrap();
        fw.program_bridge(PROXY.parse().unwrap(), &DriverConfig::default())
            .unwrap();

        assert!(ipt.chain_exists(Table::Nat, "TOR"));
        assert!(ipt.chain_exists(Table::Filter, "TOR"));
        assert!(ipt.rules(Table::Nat, "POSTROUTING").contains(&strings(&[
            "-s",
            "172.18.0.0/16",
            "!",
            "-o",
            "torbr-net1",
            "-j",
            "MASQUERADE"
        ])));
        assert!(
            ipt.rules(Table::Nat, "PREROUTING")
                .iter()
                .any(|r| r.ends_with(&strings(&["--to-destination", "172.17.0.2:9040"])))
        );
        assert!(
            ipt.rules(Table::Nat, "PREROUTING")
                .iter()
                .any(|r| r.ends_with(&strings(&["--to-destination", "172.17.0.2:5353"])))
        );
        assert!(
            ipt.rules(Table::Filter, "FORWARD")
                .contains(&strings(&["-o", "torbr-net1", "-j", "TOR"]))
        );
        assert_eq!(fw.rollback_actions().len(), 7);

        let notes = fw.teardown(true);
        assert!(notes.is_empty(), "{notes:?}");
        assert_eq!(ipt.rule_count(), 0);
        assert!(!ipt.chain_exists(Table::Nat, "TOR"));
        assert!(!ipt.chain_exists(Table::Filter, "TOR"));
    }

    #[test]
    fn rollback_is_ordered() {
        let ipt = Arc::new(MemoryRules::new());
        let mut fw = firewall(&ipt, "torbr-net1");
        fw.create_chains().unwrap();
        fw.program_bridge(PROXY.parse().unwrap(), &DriverConfig::default())
            .unwrap();

        let actions = fw.rollback_actions();
        assert!(matches!(&actions[0], Rollback::Rule { description, .. } if description == "NAT"));
        assert_eq!(
            actions[1],
            Rollback::Icc {
                bridge: "torbr-net1".to_string(),
                allow: true
            }
        );
        assert!(matches!(&actions[3], Rollback::Rule { description, .. } if description == "incoming"));
        assert!(matches!(actions[4], Rollback::FilterJump { .. }));
    }

    #[test]
    fn partial_failure_unwinds() {
        let ipt = Arc::new(MemoryRules::new());
        ipt.fail_on("--syn");
        let mut fw = firewall(&ipt, "torbr-net1");
        fw.create_chains().unwrap();

        let err = fw
            .program_bridge(PROXY.parse().unwrap(), &DriverConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("TCP redirect"));
        assert_eq!(fw.rollback_actions().len(), 6);

        let notes = fw.teardown(true);
        assert!(notes.is_empty(), "{notes:?}");
        assert_eq!(ipt.rule_count(), 0);
        assert!(!ipt.chain_exists(Table::Nat, "TOR"));
    }

    #[test]
    fn icc_disabled_drops_tcp() {
        let ipt = Arc::new(MemoryRules::new());
        let mut fw = firewall(&ipt, "torbr-net1");
        fw.create_chains().unwrap();
        fw.program_bridge(PROXY.parse().unwrap(), &DriverConfig::default().with_icc(false))
            .unwrap();

        assert!(ipt.rules(Table::Filter, "FORWARD").contains(&strings(&[
            "-i",
            "torbr-net1",
            "-o",
            "torbr-net1",
            "-p",
            "tcp",
            "-j",
            "DROP"
        ])));
    }

    #[test]
    fn udp_blocking() {
        let ipt = Arc::new(MemoryRules::new());
        let mut fw = firewall(&ipt, "torbr-net1");
        fw.create_chains().unwrap();
        fw.program_bridge(PROXY.parse().unwrap(), &DriverConfig::default().with_block_udp())
            .unwrap();

        assert_eq!(ipt.rules(Table::Filter, "TOR"), vec![strings(&["-p", "udp", "-j", "DROP"])]);
        assert!(ipt.rules(Table::Filter, "FORWARD").contains(&strings(&[
            "-i",
            "torbr-net1",
            "-p",
            "udp",
            "!",
            "-d",
            PROXY,
            "-j",
            "DROP"
        ])));

        fw.teardown(true);
        assert_eq!(ipt.rule_count(), 0);
        assert!(!ipt.chain_exists(Table::Filter, "TOR"));
    }

    #[test]
    fn shared_chains_survive_partial_teardown() {
        let ipt = Arc::new(MemoryRules::new());
        let config = DriverConfig::default();
        let mut first = firewall(&ipt, "torbr-net1");
        let mut second = firewall(&ipt, "torbr-net2");
        for fw in [&mut first, &mut second] {
            fw.create_chains().unwrap();
            fw.program_bridge(PROXY.parse().unwrap(), &config).unwrap();
        }

        assert!(first.teardown(false).is_empty());
        assert!(ipt.chain_exists(Table::Nat, "TOR"));
        assert!(!ipt.mentions("torbr-net1"));
        assert!(ipt.mentions("torbr-net2"));

        assert!(second.teardown(true).is_empty());
        assert_eq!(ipt.rule_count(), 0);
        assert!(!ipt.chain_exists(Table::Nat, "TOR"));
    }

    #[test]
    fn filter_chain_failure_removes_new_nat_chain() {
        let ipt = Arc::new(MemoryRules::new());
        ipt.fail_on("filter");
        let mut fw = firewall(&ipt, "torbr-net1");

        assert!(fw.create_chains().is_err());
        assert!(!ipt.chain_exists(Table::Nat, "TOR"));
    }

    #[test]
    fn teardown_continues_past_failures() {
        let ipt = Arc::new(MemoryRules::new());
        let mut fw = firewall(&ipt, "torbr-net1");
        fw.create_chains().unwrap();
        fw.program_bridge(PROXY.parse().unwrap(), &DriverConfig::default())
            .unwrap();

        ipt.fail_on("MASQUERADE");
        let notes = fw.teardown(true);
        assert_eq!(notes.len(), 1);
        assert!(notes[0].starts_with("remove NAT rule"));
        assert_eq!(ipt.rules(Table::Nat, "POSTROUTING").len(), 1);
        assert!(fw.rollback_actions().is_empty());
    }
}

//! In-memory host backends for unprivileged tests.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use shroud_common::{ShroudError, ShroudResult};

use crate::addr::Cidr;
use crate::iptables::{RuleTable, Table};
use crate::netlink::LinkLayer;
use crate::portmap::{MappedAddr, PortMapper, Protocol};
use crate::proxy::ProxyResolver;

const BUILTIN_CHAINS: [&str; 5] = ["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"];

/// A fake interface.
#[derive(Debug, Clone, Default)]
pub struct FakeLink {
    pub bridge: bool,
    pub peer: Option<String>,
    pub master: Option<String>,
    pub mtu: u32,
    pub up: bool,
    pub addresses: Vec<Cidr>,
}

/// [`LinkLayer`] over a map of fake interfaces.
#[derive(Default)]
pub struct MemoryLinks {
    links: Mutex<HashMap<String, FakeLink>>,
    failing: Mutex<HashSet<&'static str>>,
    hidden_lookups: AtomicU32,
    drop_addresses: Mutex<bool>,
}

impl MemoryLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named operation fail from now on.
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    /// Report the next `n` existence checks as missing.
    pub fn hide_next_lookups(&self, n: u32) {
        self.hidden_lookups.store(n, Ordering::SeqCst);
    }

    /// Accept address assignments without recording them.
    pub fn drop_addresses(&self) {
        *self.drop_addresses.lock() = true;
    }

    pub fn get(&self, name: &str) -> Option<FakeLink> {
        self.links.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.links.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn insert(&self, name: &str, link: FakeLink) {
        self.links.lock().insert(name.to_string(), link);
    }

    fn check(&self, op: &'static str, name: &str) -> ShroudResult<()> {
        if self.failing.lock().contains(op) {
            return Err(ShroudError::infra(format!("{op} {name}"), "injected failure"));
        }
        Ok(())
    }

    fn with_link<T>(&self, name: &str, f: impl FnOnce(&mut FakeLink) -> T) -> ShroudResult<T> {
        let mut links = self.links.lock();
        let link = links.get_mut(name).ok_or_else(|| ShroudError::LinkNotFound {
            name: name.to_string(),
        })?;
        Ok(f(link))
    }
}

#[async_trait]
impl LinkLayer for MemoryLinks {
    async fn link_exists(&self, name: &str) -> ShroudResult<bool> {
        self.check("link_exists", name)?;
        let hidden = self
            .hidden_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(!hidden && self.links.lock().contains_key(name))
    }

    async fn add_bridge(&self, name: &str, mtu: u32) -> ShroudResult<()> {
        self.check("add_bridge", name)?;
        let mut links = self.links.lock();
        if links.contains_key(name) {
            return Err(ShroudError::infra(format!("create bridge {name}"), "file exists"));
        }
        links.insert(
            name.to_string(),
            FakeLink {
                bridge: true,
                mtu,
                ..FakeLink::default()
            },
        );
        Ok(())
    }

    async fn add_veth(&self, name: &str, peer: &str, master: &str) -> ShroudResult<()> {
        self.check("add_veth", name)?;
        let mut links = self.links.lock();
        if !links.contains_key(master) {
            return Err(ShroudError::LinkNotFound {
                name: master.to_string(),
            });
        }
        if links.contains_key(name) || links.contains_key(peer) {
            return Err(ShroudError::infra(format!("create veth pair {name}"), "file exists"));
        }
        links.insert(
            name.to_string(),
            FakeLink {
                peer: Some(peer.to_string()),
                master: Some(master.to_string()),
                mtu: 1500,
                ..FakeLink::default()
            },
        );
        links.insert(
            peer.to_string(),
            FakeLink {
                peer: Some(name.to_string()),
                mtu: 1500,
                ..FakeLink::default()
            },
        );
        Ok(())
    }

    async fn add_address(&self, name: &str, addr: Cidr) -> ShroudResult<()> {
        self.check("add_address", name)?;
        let keep = !*self.drop_addresses.lock();
        self.with_link(name, |link| {
            if keep {
                link.addresses.push(addr);
            }
        })
    }

    async fn addresses(&self, name: &str) -> ShroudResult<Vec<Cidr>> {
        self.check("addresses", name)?;
        self.with_link(name, |link| link.addresses.clone())
    }

    async fn set_up(&self, name: &str) -> ShroudResult<()> {
        self.check("set_up", name)?;
        self.with_link(name, |link| link.up = true)
    }

    async fn delete_link(&self, name: &str) -> ShroudResult<()> {
        self.check("delete_link", name)?;
        let mut links = self.links.lock();
        let link = links.remove(name).ok_or_else(|| ShroudError::LinkNotFound {
            name: name.to_string(),
        })?;
        if let Some(peer) = link.peer {
            links.remove(&peer);
        }
        Ok(())
    }
}

/// [`RuleTable`] simulating iptables chains in memory.
#[derive(Default)]
pub struct MemoryRules {
    chains: Mutex<HashMap<(Table, String), Vec<Vec<String>>>>,
    failing: Mutex<Vec<String>>,
}

impl MemoryRules {
    pub fn new() -> Self {
        let rules = Self::default();
        {
            let mut chains = rules.chains.lock();
            for table in [Table::Nat, Table::Filter] {
                for chain in BUILTIN_CHAINS {
                    chains.insert((table, chain.to_string()), Vec::new());
                }
            }
        }
        rules
    }

    /// Fail every mutating command whose arguments contain `needle`.
    pub fn fail_on(&self, needle: &str) {
        self.failing.lock().push(needle.to_string());
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    pub fn create_chain(&self, table: Table, chain: &str) {
        self.chains
            .lock()
            .entry((table, chain.to_string()))
            .or_default();
    }

    pub fn rules(&self, table: Table, chain: &str) -> Vec<Vec<String>> {
        self.chains
            .lock()
            .get(&(table, chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of rules across all chains.
    pub fn rule_count(&self) -> usize {
        self.chains.lock().values().map(Vec::len).sum()
    }

    /// Whether any rule anywhere mentions `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.chains
            .lock()
            .values()
            .flatten()
            .any(|rule| rule.iter().any(|arg| arg == needle))
    }

    fn parse_table(name: &str) -> ShroudResult<Table> {
        match name {
            "nat" => Ok(Table::Nat),
            "filter" => Ok(Table::Filter),
            other => Err(ShroudError::infra("iptables", format!("unknown table {other}"))),
        }
    }
}

impl RuleTable for MemoryRules {
    fn raw(&self, args: &[String]) -> ShroudResult<String> {
        let fail = |msg: &str| Err(ShroudError::infra(format!("iptables {}", args.join(" ")), msg));

        let (table, rest) = match args {
            [flag, table, rest @ ..] if flag == "-t" => (Self::parse_table(table)?, rest),
            _ => (Table::Filter, args),
        };
        let (op, chain, rule) = match rest {
            [list, op, chain] if list == "-n" => (op.as_str(), chain.clone(), Vec::new()),
            [op, chain, rule @ ..] => (op.as_str(), chain.clone(), rule.to_vec()),
            _ => return fail("malformed command"),
        };

        if op != "-C" && op != "-L" {
            let failing = self.failing.lock();
            if failing.iter().any(|needle| args.iter().any(|arg| arg == needle)) {
                return fail("injected failure");
            }
        }

        let mut chains = self.chains.lock();
        let key = (table, chain.clone());
        match op {
            "-L" => {
                if chains.contains_key(&key) {
                    Ok(String::new())
                } else {
                    fail("No chain/target/match by that name")
                }
            }
            "-N" => {
                if chains.contains_key(&key) {
                    return fail("Chain already exists");
                }
                chains.insert(key, Vec::new());
                Ok(String::new())
            }
            "-X" => {
                let referenced = chains.iter().any(|((t, _), rules)| {
                    *t == table
                        && rules
                            .iter()
                            .any(|r| r.windows(2).any(|w| w[0] == "-j" && w[1] == chain))
                });
                match chains.get(&key).map(|rules| rules.is_empty() && !referenced) {
                    None => fail("No chain/target/match by that name"),
                    Some(false) => fail("Too many links / Directory not empty"),
                    Some(true) => {
                        chains.remove(&key);
                        Ok(String::new())
                    }
                }
            }
            "-C" | "-I" | "-A" | "-D" => {
                let Some(rules) = chains.get_mut(&key) else {
                    return fail("No chain/target/match by that name");
                };
                let position = rules.iter().position(|r| *r == rule);
                match (op, position) {
                    ("-C", Some(_)) => Ok(String::new()),
                    ("-I", _) => {
                        rules.insert(0, rule);
                        Ok(String::new())
                    }
                    ("-A", _) => {
                        rules.push(rule);
                        Ok(String::new())
                    }
                    ("-D", Some(idx)) => {
                        rules.remove(idx);
                        Ok(String::new())
                    }
                    _ => fail("Bad rule (does a matching rule exist in that chain?)"),
                }
            }
            _ => fail("unsupported operation"),
        }
    }
}

/// [`PortMapper`] over an in-memory port table.
pub struct MemoryPorts {
    used: Mutex<HashSet<(Protocol, u16)>>,
    next: Mutex<u16>,
    collisions: AtomicU32,
    fail_on_container_port: Mutex<Option<u16>>,
    fail_unmap: Mutex<HashSet<u16>>,
    answer_with: Mutex<Option<Protocol>>,
    pub map_calls: AtomicU32,
}

impl Default for MemoryPorts {
    fn default() -> Self {
        Self {
            used: Mutex::new(HashSet::new()),
            next: Mutex::new(49153),
            collisions: AtomicU32::new(0),
            fail_on_container_port: Mutex::new(None),
            fail_unmap: Mutex::new(HashSet::new()),
            answer_with: Mutex::new(None),
            map_calls: AtomicU32::new(0),
        }
    }
}

impl MemoryPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` auto-assigned attempts collide.
    pub fn collide_next(&self, n: u32) {
        self.collisions.store(n, Ordering::SeqCst);
    }

    /// Refuse every mapping towards this container port.
    pub fn fail_container_port(&self, port: u16) {
        *self.fail_on_container_port.lock() = Some(port);
    }

    /// Refuse to unmap this host port.
    pub fn fail_unmap(&self, port: u16) {
        self.fail_unmap.lock().insert(port);
    }

    /// Mark a host port as taken.
    pub fn occupy(&self, protocol: Protocol, port: u16) {
        self.used.lock().insert((protocol, port));
    }

    /// Report mapped addresses with this protocol instead of the requested one.
    pub fn answer_with(&self, protocol: Protocol) {
        *self.answer_with.lock() = Some(protocol);
    }

    pub fn in_use(&self) -> usize {
        self.used.lock().len()
    }

    pub fn is_used(&self, protocol: Protocol, port: u16) -> bool {
        self.used.lock().contains(&(protocol, port))
    }
}

impl PortMapper for MemoryPorts {
    fn map_range(
        &self,
        container: MappedAddr,
        host_ip: IpAddr,
        start: u16,
        end: u16,
    ) -> ShroudResult<MappedAddr> {
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_on_container_port.lock() == Some(container.addr.port()) {
            return Err(ShroudError::Allocation {
                message: format!("cannot map {container}"),
            });
        }

        let protocol = container.protocol;
        let mut used = self.used.lock();
        let port = if start == 0 {
            let mut next = self.next.lock();
            let candidate = *next;
            *next += 1;
            if self
                .collisions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ShroudError::Allocation {
                    message: format!("port {candidate} collided"),
                });
            }
            candidate
        } else {
            (start..=end)
                .find(|p| !used.contains(&(protocol, *p)))
                .ok_or_else(|| ShroudError::Allocation {
                    message: format!("Bind for {host_ip}:{start} failed: port is already allocated"),
                })?
        };
        used.insert((protocol, port));

        let answered = self.answer_with.lock().unwrap_or(protocol);
        Ok(MappedAddr::new(answered, host_ip, port))
    }

    fn unmap(&self, host: MappedAddr) -> ShroudResult<()> {
        if self.fail_unmap.lock().contains(&host.addr.port()) {
            return Err(ShroudError::Allocation {
                message: format!("cannot unmap {host}"),
            });
        }
        if self.used.lock().remove(&(host.protocol, host.addr.port())) {
            Ok(())
        } else {
            Err(ShroudError::Allocation {
                message: format!("port {host} is not mapped"),
            })
        }
    }
}

/// [`ProxyResolver`] that always fails.
pub struct FailingProxy;

#[async_trait]
impl ProxyResolver for FailingProxy {
    async fn proxy_ip(&self) -> ShroudResult<IpAddr> {
        Err(ShroudError::infra("inspect proxy container", "no such container"))
    }
}

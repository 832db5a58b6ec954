//! Host port mapping for container endpoints.
//!
//! A [`PortMapper`] reserves a host port and forwards it to a container
//! address. [`HostPortMapper`] keeps an allocation table per protocol and host
//! address, holds each reserved port with a bound socket and installs NAT
//! rules in the driver's chains.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr, TcpListener, UdpSocket};
use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shroud_common::{ShroudError, ShroudResult};

use crate::config::{CHAIN_NAME, DEFAULT_PORT_RANGE};
use crate::iptables::{Rule, RuleTable, Table, program_rule};

/// Transport protocol of a port binding.
///
/// Serialized as the IP protocol number, as the container runtime does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Protocol {
    /// ICMP.
    Icmp,
    /// TCP protocol.
    Tcp,
    /// UDP protocol.
    Udp,
}

impl Protocol {
    /// Get the protocol string for iptables.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Icmp => "icmp",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<Protocol> for u8 {
    fn from(proto: Protocol) -> Self {
        match proto {
            Protocol::Icmp => 1,
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Protocol::Icmp),
            6 => Ok(Protocol::Tcp),
            17 => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol number {other}")),
        }
    }
}

/// A transport address: protocol plus socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappedAddr {
    /// Transport protocol.
    pub protocol: Protocol,
    /// IP address and port.
    pub addr: SocketAddr,
}

impl MappedAddr {
    /// Create a transport address.
    #[must_use]
    pub fn new(protocol: Protocol, ip: IpAddr, port: u16) -> Self {
        Self {
            protocol,
            addr: SocketAddr::new(ip, port),
        }
    }
}

impl fmt::Display for MappedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.addr)
    }
}

/// Reserves host ports and forwards them to containers.
pub trait PortMapper: Send + Sync {
    /// Map a host port in `start..=end` on `host_ip` to `container`.
    ///
    /// A `start` of zero asks for any free port.
    fn map_range(
        &self,
        container: MappedAddr,
        host_ip: IpAddr,
        start: u16,
        end: u16,
    ) -> ShroudResult<MappedAddr>;

    /// Release a mapping previously returned by [`PortMapper::map_range`].
    fn unmap(&self, host: MappedAddr) -> ShroudResult<()>;
}

/// Creates the port mapper for a network, given its bridge name.
pub type PortMapperFactory = Arc<dyn Fn(&str) -> Arc<dyn PortMapper> + Send + Sync>;

enum Reservation {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

struct ActiveMapping {
    container: MappedAddr,
    _reservation: Reservation,
}

#[derive(Default)]
struct MapperState {
    allocated: HashMap<(Protocol, IpAddr), HashSet<u16>>,
    cursor: HashMap<(Protocol, IpAddr), u16>,
    mappings: HashMap<MappedAddr, ActiveMapping>,
}

/// [`PortMapper`] that reserves real host sockets and programs NAT rules.
pub struct HostPortMapper {
    ipt: Arc<dyn RuleTable>,
    bridge: String,
    range: RangeInclusive<u16>,
    state: Mutex<MapperState>,
}

impl HostPortMapper {
    /// Create a mapper forwarding into `bridge`.
    pub fn new(ipt: Arc<dyn RuleTable>, bridge: &str) -> Self {
        Self {
            ipt,
            bridge: bridge.to_string(),
            range: DEFAULT_PORT_RANGE,
            state: Mutex::new(MapperState::default()),
        }
    }

    /// Use a custom range for auto-assigned ports.
    #[must_use]
    pub fn with_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.range = range;
        self
    }

    /// Number of active mappings.
    pub fn mapping_count(&self) -> usize {
        self.state.lock().mappings.len()
    }

    fn allocate(&self, protocol: Protocol, host_ip: IpAddr, start: u16, end: u16) -> ShroudResult<u16> {
        let mut state = self.state.lock();
        let key = (protocol, host_ip);

        let port = if start == 0 {
            let (low, high) = (*self.range.start(), *self.range.end());
            let last = state.cursor.get(&key).copied().unwrap_or(high);
            let used = state.allocated.get(&key);
            let span = u32::from(high - low) + 1;
            (1..=span)
                .map(|step| {
                    let offset = (u32::from(last.saturating_sub(low)) + step) % span;
                    low + offset as u16
                })
                .find(|port| used.is_none_or(|set| !set.contains(port)))
                .ok_or_else(|| ShroudError::Allocation {
                    message: format!("all {protocol} ports on {host_ip} are allocated"),
                })?
        } else {
            let used = state.allocated.get(&key);
            (start..=end.max(start))
                .find(|port| used.is_none_or(|set| !set.contains(port)))
                .ok_or_else(|| ShroudError::Allocation {
                    message: format!(
                        "Bind for {host_ip}:{start} failed: port is already allocated"
                    ),
                })?
        };

        state.allocated.entry(key).or_default().insert(port);
        if start == 0 {
            state.cursor.insert(key, port);
        }
        Ok(port)
    }

    fn deallocate(&self, protocol: Protocol, host_ip: IpAddr, port: u16) {
        let mut state = self.state.lock();
        if let Some(set) = state.allocated.get_mut(&(protocol, host_ip)) {
            set.remove(&port);
        }
    }

    fn forward_rules(&self, container: MappedAddr, host: MappedAddr) -> [Rule; 2] {
        let proto = host.protocol.as_str();
        let host_port = host.addr.port().to_string();
        let container_ip = container.addr.ip().to_string();
        let container_port = container.addr.port().to_string();
        let destination = container.addr.to_string();
        let host_ip = host.addr.ip().to_string();

        let mut nat: Vec<&str> = vec!["-p", proto];
        if !host.addr.ip().is_unspecified() {
            nat.extend(["-d", host_ip.as_str()]);
        }
        nat.extend([
            "--dport",
            host_port.as_str(),
            "!",
            "-i",
            self.bridge.as_str(),
            "-j",
            "DNAT",
            "--to-destination",
            destination.as_str(),
        ]);

        [
            Rule::new(Table::Nat, CHAIN_NAME, &nat),
            Rule::new(
                Table::Filter,
                CHAIN_NAME,
                &[
                    "!",
                    "-i",
                    &self.bridge,
                    "-o",
                    &self.bridge,
                    "-p",
                    proto,
                    "-d",
                    &container_ip,
                    "--dport",
                    &container_port,
                    "-j",
                    "ACCEPT",
                ],
            ),
        ]
    }

    fn install(&self, container: MappedAddr, host: MappedAddr) -> ShroudResult<()> {
        let rules = self.forward_rules(container, host);
        for (idx, rule) in rules.iter().enumerate() {
            if let Err(e) = program_rule(self.ipt.as_ref(), rule, "port forwarding", true) {
                for installed in &rules[..idx] {
                    if let Err(cleanup) =
                        program_rule(self.ipt.as_ref(), installed, "port forwarding", false)
                    {
                        tracing::warn!(error = %cleanup, "Failed to remove port forwarding rule");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

impl PortMapper for HostPortMapper {
    fn map_range(
        &self,
        container: MappedAddr,
        host_ip: IpAddr,
        start: u16,
        end: u16,
    ) -> ShroudResult<MappedAddr> {
        let protocol = container.protocol;
        if !matches!(protocol, Protocol::Tcp | Protocol::Udp) {
            return Err(ShroudError::UnsupportedAddressType {
                kind: protocol.to_string(),
            });
        }

        let port = self.allocate(protocol, host_ip, start, end)?;
        let host = MappedAddr::new(protocol, host_ip, port);

        let reservation = match protocol {
            Protocol::Udp => UdpSocket::bind(host.addr).map(Reservation::Udp),
            _ => TcpListener::bind(host.addr).map(Reservation::Tcp),
        };
        let reservation = match reservation {
            Ok(reservation) => reservation,
            Err(e) => {
                self.deallocate(protocol, host_ip, port);
                return Err(ShroudError::Allocation {
                    message: format!("failed to bind {host}: {e}"),
                });
            }
        };

        if let Err(e) = self.install(container, host) {
            self.deallocate(protocol, host_ip, port);
            return Err(e);
        }

        tracing::debug!(%host, %container, "Mapped host port");
        self.state.lock().mappings.insert(
            host,
            ActiveMapping {
                container,
                _reservation: reservation,
            },
        );
        Ok(host)
    }

    fn unmap(&self, host: MappedAddr) -> ShroudResult<()> {
        let mapping = self
            .state
            .lock()
            .mappings
            .remove(&host)
            .ok_or_else(|| ShroudError::Allocation {
                message: format!("port {host} is not mapped"),
            })?;

        let container = mapping.container;
        drop(mapping);
        self.deallocate(host.protocol, host.addr.ip(), host.addr.port());

        for rule in self.forward_rules(container, host) {
            program_rule(self.ipt.as_ref(), &rule, "port forwarding", false)?;
        }
        tracing::debug!(%host, "Unmapped host port");
        Ok(())
    }
}

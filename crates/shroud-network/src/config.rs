//! Driver configuration and fixed naming conventions.

use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Prefix for bridge names derived from a network ID.
pub const BRIDGE_PREFIX: &str = "torbr-";
/// Prefix for the host side of an endpoint's veth pair.
pub const VETH_PREFIX: &str = "tor-veth0-";
/// Prefix for the container side of an endpoint's veth pair.
pub const VETH_PEER_PREFIX: &str = "ethc";
/// Interface prefix the runtime uses when renaming the peer inside the container.
pub const CONTAINER_IFACE_PREFIX: &str = "eth";
/// Name of both the NAT and the FILTER chain owned by the driver.
pub const CHAIN_NAME: &str = "TOR";
/// Bridge MTU when none is requested.
pub const DEFAULT_MTU: u32 = 1500;

/// Network option overriding the bridge MTU.
pub const MTU_OPTION: &str = "net.jfrazelle.tor.bridge.mtu";
/// Network option overriding the bridge name.
pub const BRIDGE_NAME_OPTION: &str = "net.jfrazelle.tor.bridge.name";
/// Runtime key nesting driver-specific network options.
pub const GENERIC_OPTION: &str = "com.docker.network.generic";
/// Endpoint option carrying requested port bindings.
pub const PORT_MAP_OPTION: &str = "com.docker.network.portmap";
/// Endpoint option carrying exposed ports.
pub const EXPOSED_PORTS_OPTION: &str = "com.docker.network.endpoint.exposedports";

/// Proxy port receiving transparently redirected TCP.
pub const DEFAULT_TRANS_PORT: u16 = 9040;
/// Proxy port answering redirected DNS.
pub const DEFAULT_DNS_PORT: u16 = 5353;
/// Container running the anonymizing proxy.
pub const DEFAULT_PROXY_CONTAINER: &str = "tor-router";

/// Maximum number of allocation attempts for an auto-assigned host port.
pub const MAX_ALLOCATE_PORT_ATTEMPTS: u32 = 10;
/// Ephemeral range used for auto-assigned host ports.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 49153..=65535;

/// Driver configuration options.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Name of the proxy container to look up.
    pub proxy_container: String,
    /// Fixed proxy address; skips the container lookup when set.
    pub proxy_ip: Option<IpAddr>,
    /// Proxy transparent TCP port.
    pub trans_port: u16,
    /// Proxy DNS port.
    pub dns_port: u16,
    /// Allow inter-container communication on each bridge.
    pub icc: bool,
    /// Drop non-DNS UDP leaving the bridge.
    pub block_udp: bool,
    /// Turn on IPv4 forwarding when a network is created.
    pub enable_ip_forward: bool,
    /// Host address for port bindings that do not name one.
    pub default_binding_ip: IpAddr,
    /// Lookups of a freshly created bridge before giving up.
    pub link_lookup_retries: u32,
    /// Delay between bridge lookups.
    pub link_lookup_delay: Duration,
    /// Attempts for an auto-assigned host port.
    pub port_attempts: u32,
    /// Range for auto-assigned host ports.
    pub port_range: RangeInclusive<u16>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            proxy_container: DEFAULT_PROXY_CONTAINER.to_string(),
            proxy_ip: None,
            trans_port: DEFAULT_TRANS_PORT,
            dns_port: DEFAULT_DNS_PORT,
            icc: true,
            block_udp: false,
            enable_ip_forward: true,
            default_binding_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            link_lookup_retries: 2,
            link_lookup_delay: Duration::from_secs(2),
            port_attempts: MAX_ALLOCATE_PORT_ATTEMPTS,
            port_range: DEFAULT_PORT_RANGE,
        }
    }
}

impl DriverConfig {
    /// Set the proxy container name.
    #[must_use]
    pub fn with_proxy_container(mut self, name: impl Into<String>) -> Self {
        self.proxy_container = name.into();
        self
    }

    /// Use a fixed proxy address.
    #[must_use]
    pub fn with_proxy_ip(mut self, ip: IpAddr) -> Self {
        self.proxy_ip = Some(ip);
        self
    }

    /// Set the proxy ports.
    #[must_use]
    pub fn with_proxy_ports(mut self, trans_port: u16, dns_port: u16) -> Self {
        self.trans_port = trans_port;
        self.dns_port = dns_port;
        self
    }

    /// Enable or disable inter-container communication.
    #[must_use]
    pub fn with_icc(mut self, icc: bool) -> Self {
        self.icc = icc;
        self
    }

    /// Enable UDP blocking.
    #[must_use]
    pub fn with_block_udp(mut self) -> Self {
        self.block_udp = true;
        self
    }

    /// Leave the host's IP forwarding setting alone.
    #[must_use]
    pub fn without_ip_forward(mut self) -> Self {
        self.enable_ip_forward = false;
        self
    }

    /// Set the bridge lookup retry policy.
    #[must_use]
    pub fn with_link_lookup(mut self, retries: u32, delay: Duration) -> Self {
        self.link_lookup_retries = retries;
        self.link_lookup_delay = delay;
        self
    }

    /// Set the range for auto-assigned host ports.
    #[must_use]
    pub fn with_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }
}

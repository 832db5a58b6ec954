//! # shroud-network
//!
//! Network driver that routes container traffic through an anonymizing
//! proxy.
//!
//! Every network is a Linux bridge. Outbound TCP connections and DNS queries
//! leaving the bridge are redirected to the proxy's transparent and DNS
//! ports; everything else is dropped or left to the host's policy. Containers
//! attach through veth pairs and may publish ports on the host.

#![warn(missing_docs)]

pub mod addr;
pub mod bridge;
pub mod config;
pub mod driver;
pub mod firewall;
pub mod iptables;
pub mod netlink;
pub mod options;
pub mod portmap;
pub mod ports;
pub mod protocol;
pub mod proxy;
pub mod veth;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use addr::{Cidr, MacAddress};
pub use bridge::{BridgeManager, enable_ip_forwarding};
pub use config::DriverConfig;
pub use driver::{Backends, Driver, EndpointRecord};
pub use firewall::BridgeFirewall;
pub use iptables::{Iptables, RuleTable};
pub use netlink::{LinkLayer, RtNetlink};
pub use options::{EndpointOptions, NetworkSettings, OptionsError};
pub use portmap::{HostPortMapper, PortMapper, PortMapperFactory, Protocol};
pub use ports::{PortAllocator, PortBinding};
pub use proxy::{DockerProxyResolver, ProxyResolver, StaticProxyResolver};
pub use veth::VethPair;

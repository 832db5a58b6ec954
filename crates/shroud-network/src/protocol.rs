//! Request and response bodies of the remote network-driver protocol.
//!
//! Field names follow the runtime's JSON encoding. Absent fields decode to
//! their defaults.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Untyped options attached to a request.
pub type Options = Map<String, Value>;

/// Address pool data handed over by the runtime's IPAM driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IpamData {
    /// Address space name.
    pub address_space: String,
    /// Subnet in CIDR notation.
    pub pool: String,
    /// Gateway in CIDR notation, e.g. `172.18.0.1/16`.
    pub gateway: String,
    /// Auxiliary addresses reserved in the pool.
    pub aux_addresses: HashMap<String, String>,
}

/// `NetworkDriver.CreateNetwork`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CreateNetworkRequest {
    /// Network ID.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    /// Network options.
    pub options: Options,
    /// IPv4 pools.
    #[serde(rename = "IPv4Data")]
    pub ipv4_data: Vec<IpamData>,
    /// IPv6 pools.
    #[serde(rename = "IPv6Data")]
    pub ipv6_data: Vec<IpamData>,
}

/// `NetworkDriver.DeleteNetwork`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteNetworkRequest {
    /// Network ID.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
}

/// Interface settings requested for an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EndpointInterface {
    /// IPv4 address in CIDR notation.
    pub address: String,
    /// IPv6 address in CIDR notation.
    #[serde(rename = "AddressIPv6")]
    pub address_ipv6: String,
    /// Hardware address.
    pub mac_address: String,
}

/// `NetworkDriver.CreateEndpoint`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CreateEndpointRequest {
    /// Network ID.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    /// Endpoint ID.
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    /// Requested interface settings.
    pub interface: Option<EndpointInterface>,
    /// Endpoint options.
    pub options: Options,
}

/// `NetworkDriver.DeleteEndpoint`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteEndpointRequest {
    /// Network ID.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    /// Endpoint ID.
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

/// `NetworkDriver.EndpointOperInfo`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoRequest {
    /// Network ID.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    /// Endpoint ID.
    #[serde(rename = "EndpointID", alias = "EnpointID")]
    pub endpoint_id: String,
}

/// `NetworkDriver.EndpointOperInfo` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InfoResponse {
    /// Operational data.
    pub value: Options,
}

/// `NetworkDriver.Join`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct JoinRequest {
    /// Network ID.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    /// Endpoint ID.
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    /// Path of the container's network namespace.
    pub sandbox_key: String,
    /// Join options.
    pub options: Options,
}

/// Interface name handed back on join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceName {
    /// Name of the interface the runtime moves into the container.
    pub src_name: String,
    /// Prefix the runtime renames it to inside the container.
    pub dst_prefix: String,
}

/// A static route to install in the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StaticRoute {
    /// Destination in CIDR notation.
    pub destination: String,
    /// Route type (0 next hop, 1 connected).
    pub route_type: u8,
    /// Next hop address.
    pub next_hop: String,
}

/// `NetworkDriver.Join` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinResponse {
    /// Interface to move into the container.
    pub interface_name: InterfaceName,
    /// IPv4 gateway of the container.
    pub gateway: String,
    /// IPv6 gateway of the container.
    #[serde(rename = "GatewayIPv6", skip_serializing_if = "String::is_empty", default)]
    pub gateway_ipv6: String,
    /// Extra routes.
    pub static_routes: Vec<StaticRoute>,
}

/// `NetworkDriver.Leave`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LeaveRequest {
    /// Network ID.
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    /// Endpoint ID.
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    /// Leave options.
    pub options: Options,
}

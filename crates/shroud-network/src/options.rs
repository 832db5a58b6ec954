//! Typed parsing of the runtime's untyped request options.
//!
//! Every key the driver understands is validated before any host state is
//! touched. Unknown keys are ignored.

use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde_json::Value;
use shroud_common::{NetworkId, ShroudError};

use crate::addr::{Cidr, MacAddress};
use crate::config::{
    BRIDGE_NAME_OPTION, BRIDGE_PREFIX, DEFAULT_MTU, EXPOSED_PORTS_OPTION, GENERIC_OPTION,
    MTU_OPTION, PORT_MAP_OPTION,
};
use crate::ports::{PortBinding, TransportPort};
use crate::protocol::{EndpointInterface, IpamData, Options};

/// Maximum length of a Linux interface name.
const MAX_IFNAME_LEN: usize = 15;

/// Why a set of options was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    /// MTU is not a positive 32-bit integer.
    #[error("invalid value {value} for option {}", MTU_OPTION)]
    InvalidMtu {
        /// Offending value, JSON-encoded.
        value: String,
    },

    /// Bridge name is not a usable interface name.
    #[error("invalid value {value} for option {}", BRIDGE_NAME_OPTION)]
    InvalidBridgeName {
        /// Offending value, JSON-encoded.
        value: String,
    },

    /// The runtime's generic options are not a map.
    #[error("option {} must be a map", GENERIC_OPTION)]
    InvalidGeneric,

    /// No IPAM pool carries a gateway.
    #[error("no gateway IP found")]
    MissingGateway,

    /// Gateway is not `address/prefix`.
    #[error("cannot split gateway IP address {value:?}")]
    InvalidGateway {
        /// The gateway string.
        value: String,
    },

    /// Port bindings could not be decoded.
    #[error("PortMap unmarshal error: {0}")]
    PortMap(String),

    /// Exposed ports could not be decoded.
    #[error("ExposedPorts unmarshal error: {0}")]
    ExposedPorts(String),

    /// An interface address or MAC address is malformed.
    #[error("invalid {field} {value:?}")]
    InvalidInterface {
        /// Field name.
        field: &'static str,
        /// The rejected value.
        value: String,
    },
}

impl From<OptionsError> for ShroudError {
    fn from(err: OptionsError) -> Self {
        ShroudError::config(err.to_string())
    }
}

/// Look up `key` at the top level, then inside the runtime's generic map.
fn lookup<'a>(options: &'a Options, key: &str) -> Result<Option<&'a Value>, OptionsError> {
    if let Some(value) = options.get(key) {
        return Ok(Some(value));
    }
    match options.get(GENERIC_OPTION) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(generic)) => Ok(generic.get(key)),
        Some(_) => Err(OptionsError::InvalidGeneric),
    }
}

fn parse_mtu(value: &Value) -> Result<u32, OptionsError> {
    let mtu = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    mtu.filter(|mtu| *mtu > 0).ok_or_else(|| OptionsError::InvalidMtu {
        value: value.to_string(),
    })
}

fn parse_bridge_name(value: &Value) -> Result<String, OptionsError> {
    match value {
        Value::String(name)
            if !name.is_empty()
                && name.len() <= MAX_IFNAME_LEN
                && !name.contains(['/', ' ', ':']) =>
        {
            Ok(name.clone())
        }
        _ => Err(OptionsError::InvalidBridgeName {
            value: value.to_string(),
        }),
    }
}

/// Pick the gateway: the first IPv4 pool's, else the first IPv6 pool's.
fn parse_gateway(ipv4: &[IpamData], ipv6: &[IpamData]) -> Result<Cidr, OptionsError> {
    let raw = [ipv4.first(), ipv6.first()]
        .into_iter()
        .flatten()
        .map(|pool| pool.gateway.as_str())
        .find(|gateway| !gateway.is_empty())
        .ok_or(OptionsError::MissingGateway)?;

    raw.parse().map_err(|_| OptionsError::InvalidGateway {
        value: raw.to_string(),
    })
}

/// Settings of a network derived from its creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    /// Bridge interface name.
    pub bridge_name: String,
    /// Bridge MTU.
    pub mtu: u32,
    /// Gateway address assigned to the bridge.
    pub gateway: Cidr,
}

impl NetworkSettings {
    /// Derive the settings of network `id`.
    pub fn parse(
        id: &NetworkId,
        options: &Options,
        ipv4: &[IpamData],
        ipv6: &[IpamData],
    ) -> Result<Self, OptionsError> {
        let mtu = lookup(options, MTU_OPTION)?
            .map(parse_mtu)
            .transpose()?
            .unwrap_or(DEFAULT_MTU);
        let bridge_name = lookup(options, BRIDGE_NAME_OPTION)?
            .map(parse_bridge_name)
            .transpose()?
            .unwrap_or_else(|| format!("{BRIDGE_PREFIX}{}", id.short()));
        let gateway = parse_gateway(ipv4, ipv6)?;

        Ok(Self {
            bridge_name,
            mtu,
            gateway,
        })
    }
}

fn decode<T: DeserializeOwned>(
    value: Option<&Value>,
    err: fn(String) -> OptionsError,
) -> Result<Vec<T>, OptionsError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| err(e.to_string())),
    }
}

/// Port configuration of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointOptions {
    /// Requested port bindings.
    pub port_bindings: Vec<PortBinding>,
    /// Exposed container ports.
    pub exposed_ports: Vec<TransportPort>,
}

impl EndpointOptions {
    /// Parse the port map and exposed ports out of endpoint options.
    pub fn parse(options: &Options) -> Result<Self, OptionsError> {
        Ok(Self {
            port_bindings: decode(options.get(PORT_MAP_OPTION), OptionsError::PortMap)?,
            exposed_ports: decode(options.get(EXPOSED_PORTS_OPTION), OptionsError::ExposedPorts)?,
        })
    }
}

fn field<T: FromStr>(name: &'static str, raw: &str) -> Result<Option<T>, OptionsError> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(|_| OptionsError::InvalidInterface {
        field: name,
        value: raw.to_string(),
    })
}

/// Interface settings requested for an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Hardware address.
    pub mac: Option<MacAddress>,
    /// IPv4 address and prefix.
    pub address: Option<Cidr>,
    /// IPv6 address and prefix.
    pub address_v6: Option<Cidr>,
}

impl InterfaceConfig {
    /// Validate the interface part of an endpoint request. Empty fields are
    /// absent.
    pub fn parse(iface: Option<&EndpointInterface>) -> Result<Self, OptionsError> {
        let Some(iface) = iface else {
            return Ok(Self::default());
        };

        Ok(Self {
            mac: field("MAC address", &iface.mac_address)?,
            address: field("address", &iface.address)?,
            address_v6: field("IPv6 address", &iface.address_ipv6)?,
        })
    }
}

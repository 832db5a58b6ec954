//! Endpoint port bindings and their allocation.
//!
//! [`PortBinding`] mirrors the runtime's wire format. [`PortAllocator`] turns
//! requested bindings into operational ones by asking the network's
//! [`PortMapper`] for host ports.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shroud_common::{ShroudError, ShroudResult};

use crate::portmap::{MappedAddr, PortMapper, Protocol};

/// A requested or allocated port binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    /// Transport protocol.
    pub proto: Protocol,
    /// Container address, filled in on allocation.
    #[serde(rename = "IP", default, with = "empty_ip")]
    pub ip: Option<IpAddr>,
    /// Container port.
    pub port: u16,
    /// Host address; the driver default is used when absent.
    #[serde(rename = "HostIP", default, with = "empty_ip")]
    pub host_ip: Option<IpAddr>,
    /// Host port; zero asks for any free port.
    #[serde(default)]
    pub host_port: u16,
    /// Last port of a host port range; zero means no range.
    #[serde(default)]
    pub host_port_end: u16,
}

impl PortBinding {
    /// Binding of a container TCP port to any free host port.
    #[must_use]
    pub fn tcp(port: u16) -> Self {
        Self::new(Protocol::Tcp, port, 0)
    }

    /// Binding of a container UDP port to any free host port.
    #[must_use]
    pub fn udp(port: u16) -> Self {
        Self::new(Protocol::Udp, port, 0)
    }

    /// Binding of a container port to a host port.
    #[must_use]
    pub fn new(proto: Protocol, port: u16, host_port: u16) -> Self {
        Self {
            proto,
            ip: None,
            port,
            host_ip: None,
            host_port,
            host_port_end: 0,
        }
    }

    /// Bind on a specific host address.
    #[must_use]
    pub fn with_host_ip(mut self, ip: IpAddr) -> Self {
        self.host_ip = Some(ip);
        self
    }

    /// Accept any host port in `host_port..=end`.
    #[must_use]
    pub fn with_host_port_end(mut self, end: u16) -> Self {
        self.host_port_end = end;
        self
    }

    fn host_addr(&self) -> MappedAddr {
        let ip = self.host_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        MappedAddr::new(self.proto, ip, self.host_port)
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |ip: Option<IpAddr>| ip.map(|ip| ip.to_string()).unwrap_or_default();
        write!(
            f,
            "{}/{}:{}:{}:{}",
            self.proto,
            show(self.ip),
            self.port,
            show(self.host_ip),
            self.host_port
        )
    }
}

/// An exposed container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransportPort {
    /// Transport protocol.
    pub proto: Protocol,
    /// Container port.
    pub port: u16,
}

/// Serde adapter mapping the runtime's empty-string address to `None`.
mod empty_ip {
    use std::net::IpAddr;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(ip: &Option<IpAddr>, serializer: S) -> Result<S::Ok, S::Error> {
        match ip {
            Some(ip) => serializer.collect_str(ip),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<IpAddr>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => s.parse().map(Some).map_err(D::Error::custom),
        }
    }
}

/// Allocates host ports for an endpoint's bindings.
pub struct PortAllocator {
    mapper: Arc<dyn PortMapper>,
    attempts: u32,
}

impl PortAllocator {
    /// Create an allocator over `mapper`, trying auto-assigned ports up to
    /// `attempts` times.
    pub fn new(mapper: Arc<dyn PortMapper>, attempts: u32) -> Self {
        Self {
            mapper,
            attempts: attempts.max(1),
        }
    }

    /// Allocate every binding, in order.
    ///
    /// On failure, bindings allocated by this call are released and the
    /// allocation error is returned.
    pub fn allocate_all(
        &self,
        bindings: &[PortBinding],
        container_ip: IpAddr,
        default_host_ip: IpAddr,
    ) -> ShroudResult<Vec<PortBinding>> {
        let mut allocated = Vec::with_capacity(bindings.len());
        for requested in bindings {
            let mut binding = requested.clone();
            if let Err(e) = self.allocate_one(&mut binding, container_ip, default_host_ip) {
                if let Err(cleanup) = self.release_all(&allocated) {
                    tracing::warn!(
                        binding = %binding,
                        error = %cleanup,
                        "Failed to release port bindings after allocation failure"
                    );
                }
                return Err(e);
            }
            allocated.push(binding);
        }
        Ok(allocated)
    }

    /// Allocate one binding, filling in its container address, host address
    /// and host port.
    pub fn allocate_one(
        &self,
        binding: &mut PortBinding,
        container_ip: IpAddr,
        default_host_ip: IpAddr,
    ) -> ShroudResult<()> {
        binding.ip = Some(container_ip);
        let host_ip = *binding.host_ip.get_or_insert(default_host_ip);
        if binding.host_port_end == 0 {
            binding.host_port_end = binding.host_port;
        }

        let container = MappedAddr::new(binding.proto, container_ip, binding.port);
        let explicit = binding.host_port != 0;
        let attempts = if explicit { 1 } else { self.attempts };

        let mut attempt = 0;
        let host = loop {
            attempt += 1;
            match self
                .mapper
                .map_range(container, host_ip, binding.host_port, binding.host_port_end)
            {
                Ok(host) => break host,
                Err(e) if attempt >= attempts => {
                    if explicit {
                        tracing::warn!(
                            start = binding.host_port,
                            end = binding.host_port_end,
                            error = %e,
                            "Failed to allocate and map port"
                        );
                    }
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, retry = attempt, "Failed to allocate and map port");
                }
            }
        };

        match host.protocol {
            Protocol::Tcp | Protocol::Udp => {
                binding.host_port = host.addr.port();
                Ok(())
            }
            other => {
                if let Err(e) = self.mapper.unmap(host) {
                    tracing::warn!(%host, error = %e, "Failed to unmap unsupported address");
                }
                Err(ShroudError::UnsupportedAddressType {
                    kind: other.to_string(),
                })
            }
        }
    }

    /// Release every binding, continuing past failures.
    pub fn release_all(&self, bindings: &[PortBinding]) -> ShroudResult<()> {
        let failures: Vec<String> = bindings
            .iter()
            .filter_map(|binding| {
                self.mapper
                    .unmap(binding.host_addr())
                    .err()
                    .map(|e| format!("could not release {binding} because of {e}"))
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShroudError::PortRelease { failures })
        }
    }
}

//! Discovery of the anonymizing proxy's address.

use std::net::IpAddr;

use async_trait::async_trait;
use shroud_common::{ShroudError, ShroudResult};
use tokio::process::Command;

/// Resolves the address redirected traffic is sent to.
#[async_trait]
pub trait ProxyResolver: Send + Sync {
    /// Current address of the proxy.
    async fn proxy_ip(&self) -> ShroudResult<IpAddr>;
}

/// Proxy at a fixed address.
#[derive(Debug, Clone, Copy)]
pub struct StaticProxyResolver(pub IpAddr);

#[async_trait]
impl ProxyResolver for StaticProxyResolver {
    async fn proxy_ip(&self) -> ShroudResult<IpAddr> {
        Ok(self.0)
    }
}

/// Proxy running in a container, looked up with `docker inspect`.
#[derive(Debug, Clone)]
pub struct DockerProxyResolver {
    container: String,
}

impl DockerProxyResolver {
    /// Resolve the proxy through the container called `container`.
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
        }
    }
}

/// First address in `docker inspect` output listing one address per network.
fn first_address(output: &str) -> Option<IpAddr> {
    output
        .split_whitespace()
        .find_map(|token| token.parse().ok())
}

#[async_trait]
impl ProxyResolver for DockerProxyResolver {
    async fn proxy_ip(&self) -> ShroudResult<IpAddr> {
        let operation = format!("inspect proxy container {}", self.container);
        let output = Command::new("docker")
            .args([
                "inspect",
                "--format",
                "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}",
                self.container.as_str(),
            ])
            .output()
            .await
            .map_err(|e| ShroudError::infra(operation.as_str(), e))?;

        if !output.status.success() {
            return Err(ShroudError::infra(
                operation,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }

        let ip = first_address(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| ShroudError::infra(operation, "container has no IP address"))?;
        tracing::debug!(container = %self.container, %ip, "Resolved proxy address");
        Ok(ip)
    }
}

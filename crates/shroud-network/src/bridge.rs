//! Linux bridge management.
//!
//! This module creates and removes the per-network bridge that endpoints are
//! attached to.

use std::sync::Arc;
use std::time::Duration;

use shroud_common::{ShroudError, ShroudResult};

use crate::addr::Cidr;
use crate::config::DriverConfig;
use crate::netlink::LinkLayer;

/// Outcome of [`BridgeManager::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// The bridge was created by this call.
    Created,
    /// An interface with the name already existed and was left untouched.
    Existing,
}

/// Bridge manager for container networking.
pub struct BridgeManager {
    links: Arc<dyn LinkLayer>,
    lookup_retries: u32,
    lookup_delay: Duration,
}

impl BridgeManager {
    /// Create a bridge manager over `links`.
    pub fn new(links: Arc<dyn LinkLayer>, config: &DriverConfig) -> Self {
        Self {
            links,
            lookup_retries: config.link_lookup_retries,
            lookup_delay: config.link_lookup_delay,
        }
    }

    /// Make sure a bridge called `name` exists.
    ///
    /// An existing interface is accepted as is. Otherwise the bridge is
    /// created with `mtu`, given the `gateway` address and brought up. When a
    /// later sub-step fails the new bridge is deleted again before returning.
    pub async fn ensure(&self, name: &str, mtu: u32, gateway: Cidr) -> ShroudResult<BridgeState> {
        if self.links.link_exists(name).await? {
            tracing::debug!(bridge = name, "Bridge already present");
            return Ok(BridgeState::Existing);
        }

        tracing::debug!(bridge = name, mtu, %gateway, "Creating bridge");
        self.links.add_bridge(name, mtu).await?;

        if let Err(e) = self.configure(name, gateway).await {
            let notes = match self.links.delete_link(name).await {
                Ok(()) => Vec::new(),
                Err(cleanup) => {
                    tracing::warn!(bridge = name, error = %cleanup, "Failed to remove bridge");
                    vec![format!("delete bridge {name}: {cleanup}")]
                }
            };
            return Err(e.with_cleanup(notes));
        }

        tracing::info!(bridge = name, "Bridge created");
        Ok(BridgeState::Created)
    }

    async fn configure(&self, name: &str, gateway: Cidr) -> ShroudResult<()> {
        self.wait_for_link(name).await?;

        self.links
            .add_address(name, gateway)
            .await
            .map_err(|e| ShroudError::infra(format!("assign {gateway} to bridge {name}"), e))?;

        let assigned = self
            .links
            .addresses(name)
            .await
            .map_err(|e| ShroudError::infra(format!("read addresses of bridge {name}"), e))?;
        if !assigned.contains(&gateway) {
            return Err(ShroudError::infra(
                format!("verify address of bridge {name}"),
                format!("{gateway} not found after assignment"),
            ));
        }

        self.links
            .set_up(name)
            .await
            .map_err(|e| ShroudError::infra(format!("bring up bridge {name}"), e))
    }

    async fn wait_for_link(&self, name: &str) -> ShroudResult<()> {
        for attempt in 0..=self.lookup_retries {
            if self.links.link_exists(name).await? {
                return Ok(());
            }
            if attempt < self.lookup_retries {
                tracing::debug!(bridge = name, attempt, "Bridge not visible yet, retrying");
                tokio::time::sleep(self.lookup_delay).await;
            }
        }
        Err(ShroudError::LinkNotFound {
            name: name.to_string(),
        })
    }

    /// Delete the bridge.
    pub async fn delete(&self, name: &str) -> ShroudResult<()> {
        tracing::debug!(bridge = name, "Deleting bridge");
        self.links.delete_link(name).await.map_err(|e| match e {
            ShroudError::LinkNotFound { .. } => e,
            other => ShroudError::infra(format!("delete bridge {name}"), other),
        })?;
        tracing::info!(bridge = name, "Bridge deleted");
        Ok(())
    }
}

/// Turn on IPv4 forwarding for the host.
pub fn enable_ip_forwarding() -> ShroudResult<()> {
    std::fs::write("/proc/sys/net/ipv4/ip_forward", "1")
        .map_err(|e| ShroudError::infra("enable IP forwarding", e))?;

    tracing::info!("IP forwarding enabled");
    Ok(())
}

//! Virtual ethernet pair management.

use shroud_common::{EndpointId, ShroudError, ShroudResult};

use crate::config::{VETH_PEER_PREFIX, VETH_PREFIX};
use crate::netlink::LinkLayer;

/// Virtual ethernet pair of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// Host-side interface name, enslaved to the bridge.
    pub host: String,
    /// Container-side interface name, handed to the runtime.
    pub container: String,
}

impl VethPair {
    /// Names of the pair belonging to an endpoint.
    #[must_use]
    pub fn for_endpoint(endpoint: &EndpointId) -> Self {
        let short = endpoint.short();
        Self {
            host: format!("{VETH_PREFIX}{short}"),
            container: format!("{VETH_PEER_PREFIX}{short}"),
        }
    }

    /// Create the pair with its host side attached to `bridge`, and bring
    /// both ends up.
    ///
    /// A pair left half-configured by a failure is removed before returning.
    pub async fn create(&self, links: &dyn LinkLayer, bridge: &str) -> ShroudResult<()> {
        if !links.link_exists(bridge).await? {
            return Err(ShroudError::LinkNotFound {
                name: bridge.to_string(),
            });
        }

        tracing::debug!(host = %self.host, peer = %self.container, bridge, "Creating veth pair");
        links.add_veth(&self.host, &self.container, bridge).await?;

        for end in [&self.host, &self.container] {
            if let Err(e) = links.set_up(end).await {
                let notes = match links.delete_link(&self.host).await {
                    Ok(()) => Vec::new(),
                    Err(cleanup) => {
                        tracing::warn!(host = %self.host, error = %cleanup, "Failed to remove veth pair");
                        vec![format!("delete veth pair {}: {cleanup}", self.host)]
                    }
                };
                return Err(ShroudError::infra(format!("bring up {end}"), e).with_cleanup(notes));
            }
        }

        Ok(())
    }

    /// Delete the pair.
    pub async fn delete(&self, links: &dyn LinkLayer) -> ShroudResult<()> {
        tracing::debug!(host = %self.host, "Deleting veth pair");
        links.delete_link(&self.host).await
    }
}

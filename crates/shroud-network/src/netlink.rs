//! Kernel link operations.
//!
//! [`LinkLayer`] is the seam between the driver and the host's networking
//! subsystem. [`RtNetlink`] implements it over a netlink socket.

use std::net::IpAddr;

use async_trait::async_trait;
use futures::TryStreamExt;
use rtnetlink::packet_core::ErrorMessage;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::{Handle, LinkBridge, LinkUnspec, LinkVeth};
use shroud_common::{ShroudError, ShroudResult};

use crate::addr::Cidr;

/// Link-level operations on the host.
///
/// Every method addresses interfaces by name. Methods other than
/// [`LinkLayer::link_exists`] fail with [`ShroudError::LinkNotFound`] when a
/// named interface is missing.
#[async_trait]
pub trait LinkLayer: Send + Sync {
    /// Whether an interface with this name exists.
    async fn link_exists(&self, name: &str) -> ShroudResult<bool>;

    /// Create a bridge device.
    async fn add_bridge(&self, name: &str, mtu: u32) -> ShroudResult<()>;

    /// Create a veth pair whose `name` side is enslaved to `master`.
    async fn add_veth(&self, name: &str, peer: &str, master: &str) -> ShroudResult<()>;

    /// Assign an address to an interface.
    async fn add_address(&self, name: &str, addr: Cidr) -> ShroudResult<()>;

    /// List the addresses assigned to an interface.
    async fn addresses(&self, name: &str) -> ShroudResult<Vec<Cidr>>;

    /// Set an interface administratively up.
    async fn set_up(&self, name: &str) -> ShroudResult<()>;

    /// Delete an interface. Deleting one end of a veth pair removes both.
    async fn delete_link(&self, name: &str) -> ShroudResult<()>;
}

/// [`LinkLayer`] backed by rtnetlink.
pub struct RtNetlink {
    handle: Handle,
}

impl RtNetlink {
    /// Open a netlink connection.
    ///
    /// Must be called from within a tokio runtime; the connection task is
    /// spawned onto it.
    pub fn new() -> ShroudResult<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| ShroudError::infra("open netlink connection", e))?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    async fn index(&self, name: &str) -> ShroudResult<Option<u32>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(link) => Ok(link.map(|link| link.header.index)),
            Err(rtnetlink::Error::NetlinkError(ErrorMessage {
                code: Some(code), ..
            })) if code.get() == -libc::ENODEV => Ok(None),
            Err(e) => Err(ShroudError::infra(format!("look up link {name}"), e)),
        }
    }

    async fn require_index(&self, name: &str) -> ShroudResult<u32> {
        self.index(name)
            .await?
            .ok_or_else(|| ShroudError::LinkNotFound {
                name: name.to_string(),
            })
    }
}

#[async_trait]
impl LinkLayer for RtNetlink {
    async fn link_exists(&self, name: &str) -> ShroudResult<bool> {
        Ok(self.index(name).await?.is_some())
    }

    async fn add_bridge(&self, name: &str, mtu: u32) -> ShroudResult<()> {
        tracing::debug!(name, mtu, "Adding bridge link");
        self.handle
            .link()
            .add(LinkBridge::new(name).mtu(mtu).build())
            .execute()
            .await
            .map_err(|e| ShroudError::infra(format!("create bridge {name}"), e))
    }

    async fn add_veth(&self, name: &str, peer: &str, master: &str) -> ShroudResult<()> {
        let master_index = self.require_index(master).await?;
        tracing::debug!(name, peer, master, "Adding veth pair");
        self.handle
            .link()
            .add(LinkVeth::new(name, peer).controller(master_index).build())
            .execute()
            .await
            .map_err(|e| ShroudError::infra(format!("create veth pair {name}/{peer}"), e))
    }

    async fn add_address(&self, name: &str, addr: Cidr) -> ShroudResult<()> {
        let index = self.require_index(name).await?;
        self.handle
            .address()
            .add(index, addr.addr, addr.prefix_len)
            .execute()
            .await
            .map_err(|e| ShroudError::infra(format!("assign {addr} to {name}"), e))
    }

    async fn addresses(&self, name: &str) -> ShroudResult<Vec<Cidr>> {
        let index = self.require_index(name).await?;
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut found = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| ShroudError::infra(format!("list addresses of {name}"), e))?
        {
            let prefix_len = msg.header.prefix_len;
            for attr in &msg.attributes {
                if let AddressAttribute::Address(ip) = attr {
                    let ip: IpAddr = *ip;
                    if let Some(cidr) = Cidr::new(ip, prefix_len) {
                        found.push(cidr);
                    }
                }
            }
        }
        Ok(found)
    }

    async fn set_up(&self, name: &str) -> ShroudResult<()> {
        let index = self.require_index(name).await?;
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(|e| ShroudError::infra(format!("bring up {name}"), e))
    }

    async fn delete_link(&self, name: &str) -> ShroudResult<()> {
        let index = self.require_index(name).await?;
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| ShroudError::infra(format!("delete link {name}"), e))
    }
}

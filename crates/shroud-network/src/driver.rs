//! Network and endpoint lifecycle.
//!
//! [`Driver`] keeps the live networks and, per network, its endpoints. It
//! sequences the link layer, the bridge firewall and the port allocator for
//! every lifecycle call and unwinds host state when a call fails half way.
//!
//! Each network carries a liveness flag behind an async read/write lock.
//! Endpoint calls hold it for reading; network creation and deletion hold it
//! for writing. A call that looked a network up just before it was deleted
//! therefore waits for the deletion and then fails with
//! [`ShroudError::NetworkNotFound`] instead of touching a dead bridge.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use shroud_common::{EndpointId, NetworkId, ShroudError, ShroudResult};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use crate::bridge::{BridgeManager, BridgeState};
use crate::config::{CONTAINER_IFACE_PREFIX, DriverConfig};
use crate::firewall::BridgeFirewall;
use crate::iptables::{Iptables, RuleTable};
use crate::netlink::{LinkLayer, RtNetlink};
use crate::options::{EndpointOptions, InterfaceConfig, NetworkSettings};
use crate::portmap::{HostPortMapper, PortMapper, PortMapperFactory};
use crate::ports::{PortAllocator, PortBinding};
use crate::protocol::{
    CreateEndpointRequest, CreateNetworkRequest, DeleteEndpointRequest, DeleteNetworkRequest,
    InfoRequest, InfoResponse, InterfaceName, JoinRequest, JoinResponse, LeaveRequest,
};
use crate::proxy::{DockerProxyResolver, ProxyResolver, StaticProxyResolver};
use crate::veth::VethPair;

/// Host facilities the driver operates on.
#[derive(Clone)]
pub struct Backends {
    /// Link layer.
    pub links: Arc<dyn LinkLayer>,
    /// Packet-filter rule tables.
    pub rules: Arc<dyn RuleTable>,
    /// Proxy address lookup.
    pub proxy: Arc<dyn ProxyResolver>,
    /// Builds the port mapper of a network from its bridge name.
    pub port_mappers: PortMapperFactory,
}

impl Backends {
    /// Backends talking to the real host: rtnetlink, `iptables`, and either a
    /// fixed proxy address or a lookup of the proxy container.
    ///
    /// Must be called from within a tokio runtime.
    pub fn host(config: &DriverConfig) -> ShroudResult<Self> {
        let links: Arc<dyn LinkLayer> = Arc::new(RtNetlink::new()?);
        let rules: Arc<dyn RuleTable> = Arc::new(Iptables);
        let proxy: Arc<dyn ProxyResolver> = match config.proxy_ip {
            Some(ip) => Arc::new(StaticProxyResolver(ip)),
            None => Arc::new(DockerProxyResolver::new(config.proxy_container.clone())),
        };

        let ipt = Arc::clone(&rules);
        let range = config.port_range.clone();
        let port_mappers: PortMapperFactory = Arc::new(move |bridge: &str| {
            let mapper = HostPortMapper::new(Arc::clone(&ipt), bridge).with_range(range.clone());
            Arc::new(mapper) as Arc<dyn PortMapper>
        });

        Ok(Self {
            links,
            rules,
            proxy,
            port_mappers,
        })
    }
}

/// State of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointRecord {
    /// Requested interface settings.
    pub interface: InterfaceConfig,
    /// Requested ports.
    pub config: EndpointOptions,
    /// Bindings actually allocated on the host.
    pub port_mapping: Vec<PortBinding>,
}

struct Network {
    id: NetworkId,
    settings: NetworkSettings,
    alive: Arc<RwLock<bool>>,
    firewall: Mutex<Option<BridgeFirewall>>,
    endpoints: Mutex<HashMap<EndpointId, Arc<EndpointRecord>>>,
    ports: PortAllocator,
}

/// The network driver.
pub struct Driver {
    config: DriverConfig,
    backends: Backends,
    bridges: BridgeManager,
    networks: Mutex<HashMap<NetworkId, Arc<Network>>>,
    /// Serializes changes to the shared chains.
    chains: Mutex<()>,
}

impl Driver {
    /// Create a driver.
    pub fn new(config: DriverConfig, backends: Backends) -> Self {
        let bridges = BridgeManager::new(Arc::clone(&backends.links), &config);
        Self {
            config,
            backends,
            bridges,
            networks: Mutex::new(HashMap::new()),
            chains: Mutex::new(()),
        }
    }

    /// Whether a network is registered.
    pub fn has_network(&self, id: &str) -> bool {
        self.networks.lock().keys().any(|key| key.as_str() == id)
    }

    /// Snapshot of an endpoint.
    pub fn endpoint(&self, network: &str, endpoint: &str) -> Option<EndpointRecord> {
        let network = self.lookup(&NetworkId::new(network).ok()?).ok()?;
        let endpoint = EndpointId::new(endpoint).ok()?;
        let endpoints = network.endpoints.lock();
        endpoints.get(&endpoint).map(|record| (**record).clone())
    }

    fn lookup(&self, id: &NetworkId) -> ShroudResult<Arc<Network>> {
        self.networks
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ShroudError::NetworkNotFound { id: id.to_string() })
    }

    /// Look a network up and hold its liveness lock for reading.
    async fn live(&self, id: &NetworkId) -> ShroudResult<(Arc<Network>, OwnedRwLockReadGuard<bool>)> {
        let network = self.lookup(id)?;
        let alive = Arc::clone(&network.alive).read_owned().await;
        if !*alive {
            return Err(ShroudError::NetworkNotFound { id: id.to_string() });
        }
        Ok((network, alive))
    }

    fn unregister(&self, network: &Arc<Network>) {
        let mut networks = self.networks.lock();
        if networks
            .get(&network.id)
            .is_some_and(|current| Arc::ptr_eq(current, network))
        {
            networks.remove(&network.id);
        }
    }

    fn has_other_networks(&self, id: &NetworkId) -> bool {
        self.networks.lock().keys().any(|key| key != id)
    }

    /// Create a network: bridge, chains and redirection rules.
    pub async fn create_network(&self, req: &CreateNetworkRequest) -> ShroudResult<()> {
        let id = NetworkId::new(req.network_id.as_str())?;
        let settings = NetworkSettings::parse(&id, &req.options, &req.ipv4_data, &req.ipv6_data)?;
        if self.networks.lock().contains_key(&id) {
            return Err(ShroudError::NetworkExists { id: id.to_string() });
        }
        let proxy = self.backends.proxy.proxy_ip().await?;

        tracing::debug!(network = %id, bridge = %settings.bridge_name, mtu = settings.mtu, "Creating network");
        let mapper = (self.backends.port_mappers)(&settings.bridge_name);
        let network = Arc::new(Network {
            id: id.clone(),
            settings,
            alive: Arc::new(RwLock::new(false)),
            firewall: Mutex::new(None),
            endpoints: Mutex::new(HashMap::new()),
            ports: PortAllocator::new(mapper, self.config.port_attempts),
        });

        let mut alive = Arc::clone(&network.alive).write_owned().await;
        {
            let mut networks = self.networks.lock();
            if networks.contains_key(&id) {
                return Err(ShroudError::NetworkExists { id: id.to_string() });
            }
            networks.insert(id.clone(), Arc::clone(&network));
        }

        match self.provision(&network, proxy).await {
            Ok(firewall) => {
                *network.firewall.lock() = Some(firewall);
                *alive = true;
                tracing::info!(network = %id, bridge = %network.settings.bridge_name, "Network created");
                Ok(())
            }
            Err(e) => {
                self.unregister(&network);
                tracing::warn!(network = %id, error = %e, "Network creation failed");
                Err(e)
            }
        }
    }

    async fn provision(&self, network: &Network, proxy: IpAddr) -> ShroudResult<BridgeFirewall> {
        let settings = &network.settings;
        let state = self
            .bridges
            .ensure(&settings.bridge_name, settings.mtu, settings.gateway)
            .await?;

        match self.program_firewall(network, proxy) {
            Ok(firewall) => Ok(firewall),
            Err(e) => {
                if state == BridgeState::Existing {
                    return Err(e);
                }
                let mut notes = Vec::new();
                if let Err(cleanup) = self.bridges.delete(&settings.bridge_name).await {
                    tracing::warn!(bridge = %settings.bridge_name, error = %cleanup, "Failed to remove bridge");
                    notes.push(format!("delete bridge {}: {cleanup}", settings.bridge_name));
                }
                Err(e.with_cleanup(notes))
            }
        }
    }

    fn program_firewall(&self, network: &Network, proxy: IpAddr) -> ShroudResult<BridgeFirewall> {
        let _chains = self.chains.lock();
        let settings = &network.settings;
        let mut firewall = BridgeFirewall::new(
            Arc::clone(&self.backends.rules),
            &settings.bridge_name,
            settings.gateway,
        );

        let programmed = firewall
            .create_chains()
            .and_then(|()| firewall.program_bridge(proxy, &self.config));
        match programmed {
            Ok(()) => Ok(firewall),
            Err(e) => {
                let notes = firewall.teardown(!self.has_other_networks(&network.id));
                Err(e.with_cleanup(notes))
            }
        }
    }

    /// Delete a network.
    ///
    /// The record survives a failed bridge deletion so the call can be
    /// retried. Rule cleanup after the bridge is gone is best effort.
    pub async fn delete_network(&self, req: &DeleteNetworkRequest) -> ShroudResult<()> {
        let id = NetworkId::new(req.network_id.as_str())?;
        let network = self.lookup(&id)?;
        let mut alive = Arc::clone(&network.alive).write_owned().await;
        if !*alive {
            return Err(ShroudError::NetworkNotFound { id: id.to_string() });
        }

        let bridge = &network.settings.bridge_name;
        self.bridges.delete(bridge).await?;

        let leftovers: Vec<_> = network.endpoints.lock().drain().collect();
        for (endpoint, record) in leftovers {
            if let Err(e) = network.ports.release_all(&record.port_mapping) {
                tracing::warn!(network = %id, endpoint = %endpoint, error = %e, "Failed to release ports");
            }
        }

        {
            let _chains = self.chains.lock();
            let remove_chains = !self.has_other_networks(&id);
            if let Some(mut firewall) = network.firewall.lock().take() {
                let notes = firewall.teardown(remove_chains);
                if !notes.is_empty() {
                    tracing::warn!(network = %id, failures = notes.len(), "Rule cleanup incomplete");
                }
            }
        }

        *alive = false;
        self.unregister(&network);
        tracing::info!(network = %id, bridge = %bridge, "Network deleted");
        Ok(())
    }

    /// Create an endpoint and allocate its host ports.
    pub async fn create_endpoint(&self, req: &CreateEndpointRequest) -> ShroudResult<()> {
        let network_id = NetworkId::new(req.network_id.as_str())?;
        let endpoint_id = EndpointId::new(req.endpoint_id.as_str())?;
        let (network, _alive) = self.live(&network_id).await?;
        let config = EndpointOptions::parse(&req.options)?;

        let provisional = Arc::new(EndpointRecord::default());
        {
            let mut endpoints = network.endpoints.lock();
            if endpoints.contains_key(&endpoint_id) {
                return Err(ShroudError::EndpointExists {
                    id: endpoint_id.to_string(),
                });
            }
            endpoints.insert(endpoint_id.clone(), Arc::clone(&provisional));
        }

        let result = self.configure_endpoint(&network, req, config);

        let mut endpoints = network.endpoints.lock();
        let ours = endpoints
            .get(&endpoint_id)
            .is_some_and(|current| Arc::ptr_eq(current, &provisional));
        match result {
            Ok(record) if ours => {
                endpoints.insert(endpoint_id.clone(), Arc::new(record));
                tracing::info!(network = %network_id, endpoint = %endpoint_id, "Endpoint created");
                Ok(())
            }
            Ok(record) => {
                drop(endpoints);
                // Deleted while its ports were being allocated; nothing owns them now.
                if let Err(e) = network.ports.release_all(&record.port_mapping) {
                    tracing::warn!(network = %network_id, endpoint = %endpoint_id, error = %e, "Failed to release ports");
                }
                Err(ShroudError::EndpointNotFound {
                    id: endpoint_id.to_string(),
                })
            }
            Err(e) => {
                if ours {
                    endpoints.remove(&endpoint_id);
                }
                Err(e)
            }
        }
    }

    fn configure_endpoint(
        &self,
        network: &Network,
        req: &CreateEndpointRequest,
        config: EndpointOptions,
    ) -> ShroudResult<EndpointRecord> {
        let interface = InterfaceConfig::parse(req.interface.as_ref())?;

        let port_mapping = if config.port_bindings.is_empty() {
            Vec::new()
        } else {
            let address = interface.address.ok_or_else(|| {
                ShroudError::config("port bindings require an IPv4 endpoint address")
            })?;
            network.ports.allocate_all(
                &config.port_bindings,
                address.addr,
                self.config.default_binding_ip,
            )?
        };

        Ok(EndpointRecord {
            interface,
            config,
            port_mapping,
        })
    }

    /// Delete an endpoint and release its host ports.
    ///
    /// If releasing fails the record is put back, unless the ID has been
    /// taken again in the meantime.
    pub async fn delete_endpoint(&self, req: &DeleteEndpointRequest) -> ShroudResult<()> {
        let network_id = NetworkId::new(req.network_id.as_str())?;
        let endpoint_id = EndpointId::new(req.endpoint_id.as_str())?;
        let (network, _alive) = self.live(&network_id).await?;

        let record = network
            .endpoints
            .lock()
            .remove(&endpoint_id)
            .ok_or_else(|| ShroudError::EndpointNotFound {
                id: endpoint_id.to_string(),
            })?;

        if let Err(e) = network.ports.release_all(&record.port_mapping) {
            network
                .endpoints
                .lock()
                .entry(endpoint_id)
                .or_insert(record);
            return Err(e);
        }

        tracing::info!(network = %network_id, endpoint = %endpoint_id, "Endpoint deleted");
        Ok(())
    }

    /// Operational data of an endpoint. Always empty.
    pub fn endpoint_info(&self, req: &InfoRequest) -> InfoResponse {
        tracing::debug!(network = %req.network_id, endpoint = %req.endpoint_id, "Endpoint info");
        InfoResponse::default()
    }

    /// Attach an endpoint: create its veth pair on the bridge.
    pub async fn join(&self, req: &JoinRequest) -> ShroudResult<JoinResponse> {
        let network_id = NetworkId::new(req.network_id.as_str())?;
        let endpoint_id = EndpointId::new(req.endpoint_id.as_str())?;
        let (network, _alive) = self.live(&network_id).await?;

        let pair = VethPair::for_endpoint(&endpoint_id);
        pair.create(self.backends.links.as_ref(), &network.settings.bridge_name)
            .await?;

        let gateway = network.settings.gateway.addr;
        let (gateway, gateway_ipv6) = if gateway.is_ipv4() {
            (gateway.to_string(), String::new())
        } else {
            (String::new(), gateway.to_string())
        };

        tracing::info!(
            network = %network_id,
            endpoint = %endpoint_id,
            sandbox = %req.sandbox_key,
            interface = %pair.container,
            "Endpoint joined"
        );
        Ok(JoinResponse {
            interface_name: InterfaceName {
                src_name: pair.container,
                dst_prefix: CONTAINER_IFACE_PREFIX.to_string(),
            },
            gateway,
            gateway_ipv6,
            static_routes: Vec::new(),
        })
    }

    /// Detach an endpoint. A veth pair that cannot be deleted is only logged.
    pub async fn leave(&self, req: &LeaveRequest) -> ShroudResult<()> {
        let network_id = NetworkId::new(req.network_id.as_str())?;
        let endpoint_id = EndpointId::new(req.endpoint_id.as_str())?;
        let (_network, _alive) = self.live(&network_id).await?;

        let pair = VethPair::for_endpoint(&endpoint_id);
        match pair.delete(self.backends.links.as_ref()).await {
            Ok(()) => {
                tracing::info!(network = %network_id, endpoint = %endpoint_id, "Endpoint left");
            }
            Err(e) => {
                tracing::warn!(
                    network = %network_id,
                    endpoint = %endpoint_id,
                    host = %pair.host,
                    error = %e,
                    "Failed to delete veth pair"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BRIDGE_NAME_OPTION, GENERIC_OPTION, MTU_OPTION, PORT_MAP_OPTION};
    use crate::iptables::Table;
    use crate::portmap::{MappedAddr, Protocol};
    use crate::protocol::{EndpointInterface, IpamData, Options};
    use crate::testing::{FailingProxy, FakeLink, MemoryLinks, MemoryPorts, MemoryRules};
    use serde_json::json;
    use shroud_common::ErrorKind;
    use std::time::Duration;

    const PROXY: &str = "172.17.0.2";

    struct Harness {
        links: Arc<MemoryLinks>,
        rules: Arc<MemoryRules>,
        ports: Arc<MemoryPorts>,
        driver: Arc<Driver>,
    }

    fn harness_with(config: DriverConfig, proxy: Arc<dyn ProxyResolver>) -> Harness {
        let links = Arc::new(MemoryLinks::new());
        let rules = Arc::new(MemoryRules::new());
        let ports = Arc::new(MemoryPorts::new());

        let shared = Arc::clone(&ports);
        let port_mappers: PortMapperFactory =
            Arc::new(move |_: &str| Arc::clone(&shared) as Arc<dyn PortMapper>);
        let backends = Backends {
            links: links.clone(),
            rules: rules.clone(),
            proxy,
            port_mappers,
        };
        let config = config.with_link_lookup(0, Duration::ZERO);

        Harness {
            links,
            rules,
            ports,
            driver: Arc::new(Driver::new(config, backends)),
        }
    }

    fn harness() -> Harness {
        harness_with(
            DriverConfig::default(),
            Arc::new(StaticProxyResolver(PROXY.parse().unwrap())),
        )
    }

    fn create_network(id: &str, gateway: &str) -> CreateNetworkRequest {
        CreateNetworkRequest {
            network_id: id.to_string(),
            ipv4_data: vec![IpamData {
                gateway: gateway.to_string(),
                ..IpamData::default()
            }],
            ..CreateNetworkRequest::default()
        }
    }

    fn delete_network(id: &str) -> DeleteNetworkRequest {
        DeleteNetworkRequest {
            network_id: id.to_string(),
        }
    }

    fn create_endpoint(network: &str, endpoint: &str, bindings: Vec<PortBinding>) -> CreateEndpointRequest {
        let mut options = Options::new();
        options.insert(
            PORT_MAP_OPTION.to_string(),
            serde_json::to_value(bindings).unwrap(),
        );
        CreateEndpointRequest {
            network_id: network.to_string(),
            endpoint_id: endpoint.to_string(),
            interface: Some(EndpointInterface {
                address: "172.18.0.2/16".to_string(),
                mac_address: "02:42:ac:12:00:02".to_string(),
                ..EndpointInterface::default()
            }),
            options,
        }
    }

    fn delete_endpoint(network: &str, endpoint: &str) -> DeleteEndpointRequest {
        DeleteEndpointRequest {
            network_id: network.to_string(),
            endpoint_id: endpoint.to_string(),
        }
    }

    fn join(network: &str, endpoint: &str) -> JoinRequest {
        JoinRequest {
            network_id: network.to_string(),
            endpoint_id: endpoint.to_string(),
            sandbox_key: "/var/run/docker/netns/abc".to_string(),
            ..JoinRequest::default()
        }
    }

    fn leave(network: &str, endpoint: &str) -> LeaveRequest {
        LeaveRequest {
            network_id: network.to_string(),
            endpoint_id: endpoint.to_string(),
            ..LeaveRequest::default()
        }
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_string()).collect()
    }

    #[test_log::test(tokio::test)]
    async fn network_lifecycle() {
        let h = harness();
        h.driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();

        let bridge = h.links.get("torbr-net1").unwrap();
        assert!(bridge.bridge && bridge.up);
        assert_eq!(bridge.mtu, 1500);
        assert_eq!(bridge.addresses[0].to_string(), "172.18.0.1/16");
        assert!(h.rules.chain_exists(Table::Nat, "TOR"));
        assert!(h.rules.chain_exists(Table::Filter, "TOR"));
        assert!(
            h.rules
                .rules(Table::Filter, "FORWARD")
                .contains(&strings(&["-o", "torbr-net1", "-j", "TOR"]))
        );
        assert!(
            h.rules
                .rules(Table::Nat, "PREROUTING")
                .iter()
                .any(|rule| rule.ends_with(&strings(&["-j", "TOR"])))
        );
        assert!(h.driver.has_network("net1"));

        h.driver.delete_network(&delete_network("net1")).await.unwrap();

        assert!(h.links.names().is_empty());
        assert!(!h.rules.chain_exists(Table::Nat, "TOR"));
        assert!(!h.rules.chain_exists(Table::Filter, "TOR"));
        assert_eq!(h.rules.rule_count(), 0);
        assert!(!h.driver.has_network("net1"));
    }

    #[test_log::test(tokio::test)]
    async fn missing_gateway_touches_nothing() {
        let h = harness();
        let req = CreateNetworkRequest {
            network_id: "net1".to_string(),
            ..CreateNetworkRequest::default()
        };

        let err = h.driver.create_network(&req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(h.links.names().is_empty());
        assert!(!h.rules.chain_exists(Table::Nat, "TOR"));
        assert!(!h.driver.has_network("net1"));

        let bad = create_network("net1", "172.18.0.1");
        let err = h.driver.create_network(&bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn duplicate_network() {
        let h = harness();
        let req = create_network("net1", "172.18.0.1/16");
        h.driver.create_network(&req).await.unwrap();

        let err = h.driver.create_network(&req).await.unwrap_err();
        assert!(matches!(err, ShroudError::NetworkExists { .. }));
        assert!(h.links.get("torbr-net1").is_some());
    }

    #[tokio::test]
    async fn unknown_network() {
        let h = harness();
        let err = h
            .driver
            .delete_network(&delete_network("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ShroudError::NetworkNotFound { .. }));

        let err = h
            .driver
            .create_endpoint(&create_endpoint("nope", "ep1", Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = h.driver.join(&join("nope", "ep1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = h.driver.leave(&leave("nope", "ep1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test_log::test(tokio::test)]
    async fn firewall_failure_rolls_back() {
        let h = harness();
        h.rules.fail_on("--syn");

        let err = h
            .driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(err.cleanup_notes().is_empty());
        assert!(h.links.names().is_empty());
        assert_eq!(h.rules.rule_count(), 0);
        assert!(!h.rules.chain_exists(Table::Nat, "TOR"));
        assert!(!h.driver.has_network("net1"));

        h.rules.clear_failures();
        h.driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn preexisting_bridge_survives_failure() {
        let h = harness();
        h.links.insert(
            "torbr-net1",
            FakeLink {
                bridge: true,
                ..FakeLink::default()
            },
        );
        h.rules.fail_on("MASQUERADE");

        assert!(
            h.driver
                .create_network(&create_network("net1", "172.18.0.1/16"))
                .await
                .is_err()
        );
        assert!(h.links.get("torbr-net1").is_some());
    }

    #[tokio::test]
    async fn failed_cleanup_is_attached() {
        let h = harness();
        h.rules.fail_on("--syn");
        h.links.fail("delete_link");

        let err = h
            .driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("TCP redirect"));
        assert_eq!(err.cleanup_notes().len(), 1);
        assert!(err.cleanup_notes()[0].starts_with("delete bridge torbr-net1"));
        assert!(!h.driver.has_network("net1"));
    }

    #[tokio::test]
    async fn proxy_lookup_failure() {
        let h = harness_with(DriverConfig::default(), Arc::new(FailingProxy));
        let err = h
            .driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(h.links.names().is_empty());
        assert!(!h.driver.has_network("net1"));
    }

    #[tokio::test]
    async fn options_override_bridge() {
        let h = harness();
        let mut req = create_network("3f4e2a9b7c", "10.10.0.1/24");
        req.options.insert(
            GENERIC_OPTION.to_string(),
            json!({ MTU_OPTION: "1400", BRIDGE_NAME_OPTION: "onion0" }),
        );
        h.driver.create_network(&req).await.unwrap();

        let bridge = h.links.get("onion0").unwrap();
        assert_eq!(bridge.mtu, 1400);
        assert!(h.links.get("torbr-3f4e2").is_none());
    }

    #[test_log::test(tokio::test)]
    async fn endpoint_lifecycle() {
        let h = harness();
        h.driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();

        let bindings = vec![PortBinding::new(Protocol::Tcp, 80, 8080), PortBinding::udp(53)];
        h.driver
            .create_endpoint(&create_endpoint("net1", "ep1", bindings))
            .await
            .unwrap();

        let record = h.driver.endpoint("net1", "ep1").unwrap();
        assert_eq!(record.port_mapping.len(), 2);
        assert_eq!(record.port_mapping[0].host_port, 8080);
        assert_eq!(record.port_mapping[0].ip, Some("172.18.0.2".parse().unwrap()));
        assert!(record.interface.mac.is_some());
        assert_eq!(h.ports.in_use(), 2);

        assert!(h.driver.endpoint_info(&InfoRequest::default()).value.is_empty());

        h.driver
            .delete_endpoint(&delete_endpoint("net1", "ep1"))
            .await
            .unwrap();
        assert!(h.driver.endpoint("net1", "ep1").is_none());
        assert_eq!(h.ports.in_use(), 0);

        let err = h
            .driver
            .delete_endpoint(&delete_endpoint("net1", "ep1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ShroudError::EndpointNotFound { .. }));
    }

    #[tokio::test]
    async fn duplicate_endpoint_leaves_first_alone() {
        let h = harness();
        h.driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();
        h.driver
            .create_endpoint(&create_endpoint("net1", "ep1", vec![PortBinding::tcp(80)]))
            .await
            .unwrap();
        let first = h.driver.endpoint("net1", "ep1").unwrap();

        let err = h
            .driver
            .create_endpoint(&create_endpoint("net1", "ep1", vec![PortBinding::tcp(81)]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(h.driver.endpoint("net1", "ep1").unwrap(), first);
        assert_eq!(h.ports.in_use(), 1);
    }

    #[tokio::test]
    async fn failed_allocation_unregisters_endpoint() {
        let h = harness();
        h.driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();
        h.ports.fail_container_port(443);

        let bindings = vec![PortBinding::tcp(80), PortBinding::tcp(8443), PortBinding::tcp(443)];
        let err = h
            .driver
            .create_endpoint(&create_endpoint("net1", "ep1", bindings))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Allocation);
        assert!(h.driver.endpoint("net1", "ep1").is_none());
        assert_eq!(h.ports.in_use(), 0);

        h.driver
            .create_endpoint(&create_endpoint("net1", "ep1", Vec::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_endpoint_requests() {
        let h = harness();
        h.driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();

        let mut bad_mac = create_endpoint("net1", "ep1", Vec::new());
        if let Some(iface) = bad_mac.interface.as_mut() {
            iface.mac_address = "not-a-mac".to_string();
        }
        let err = h.driver.create_endpoint(&bad_mac).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(h.driver.endpoint("net1", "ep1").is_none());

        let mut no_address = create_endpoint("net1", "ep1", vec![PortBinding::tcp(80)]);
        no_address.interface = None;
        let err = h.driver.create_endpoint(&no_address).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let mut bad_ports = create_endpoint("net1", "ep1", Vec::new());
        bad_ports
            .options
            .insert(PORT_MAP_OPTION.to_string(), json!("80:8080"));
        let err = h.driver.create_endpoint(&bad_ports).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        assert_eq!(h.ports.map_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_release_keeps_endpoint() {
        let h = harness();
        h.driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();
        h.driver
            .create_endpoint(&create_endpoint(
                "net1",
                "ep1",
                vec![PortBinding::new(Protocol::Tcp, 80, 8080)],
            ))
            .await
            .unwrap();
        h.ports.fail_unmap(8080);

        let err = h
            .driver
            .delete_endpoint(&delete_endpoint("net1", "ep1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ShroudError::PortRelease { .. }));
        assert!(h.driver.endpoint("net1", "ep1").is_some());
    }

    #[test_log::test(tokio::test)]
    async fn join_and_leave() {
        let h = harness();
        h.driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();

        let resp = h.driver.join(&join("net1", "ep1")).await.unwrap();
        assert_eq!(resp.interface_name.src_name, "ethcep1");
        assert_eq!(resp.interface_name.dst_prefix, "eth");
        assert_eq!(resp.gateway, "172.18.0.1");

        let host = h.links.get("tor-veth0-ep1").unwrap();
        assert_eq!(host.master.as_deref(), Some("torbr-net1"));
        assert!(host.up);
        assert!(h.links.get("ethcep1").unwrap().up);

        h.driver.leave(&leave("net1", "ep1")).await.unwrap();
        assert!(h.links.get("tor-veth0-ep1").is_none());

        h.driver.leave(&leave("net1", "ep1")).await.unwrap();
    }

    #[tokio::test]
    async fn failed_join_leaves_bridge() {
        let h = harness();
        h.driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();
        h.links.fail("add_veth");

        let err = h.driver.join(&join("net1", "ep1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert_eq!(h.links.names(), ["torbr-net1"]);
    }

    #[tokio::test]
    async fn delete_releases_leftover_endpoints() {
        let h = harness();
        h.driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();
        h.driver
            .create_endpoint(&create_endpoint("net1", "ep1", vec![PortBinding::tcp(80)]))
            .await
            .unwrap();

        h.driver.delete_network(&delete_network("net1")).await.unwrap();
        assert_eq!(h.ports.in_use(), 0);
    }

    #[tokio::test]
    async fn failed_bridge_deletion_keeps_network() {
        let h = harness();
        h.driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();
        h.links.fail("delete_link");

        assert!(h.driver.delete_network(&delete_network("net1")).await.is_err());
        assert!(h.driver.has_network("net1"));
        assert!(h.rules.chain_exists(Table::Nat, "TOR"));

        h.driver.join(&join("net1", "ep1")).await.unwrap();
    }

    #[tokio::test]
    async fn chains_are_shared_between_networks() {
        let h = harness();
        h.driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();
        h.driver
            .create_network(&create_network("net2", "172.19.0.1/16"))
            .await
            .unwrap();

        h.driver.delete_network(&delete_network("net1")).await.unwrap();
        assert!(h.rules.chain_exists(Table::Nat, "TOR"));
        assert!(h.rules.chain_exists(Table::Filter, "TOR"));
        assert!(!h.rules.mentions("torbr-net1"));

        h.driver.delete_network(&delete_network("net2")).await.unwrap();
        assert!(!h.rules.chain_exists(Table::Nat, "TOR"));
        assert_eq!(h.rules.rule_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn endpoint_creation_racing_deletion() {
        let h = harness();
        h.driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for n in 0..16 {
            let driver = Arc::clone(&h.driver);
            tasks.push(tokio::spawn(async move {
                let req = create_endpoint("net1", &format!("ep{n}"), vec![PortBinding::tcp(80)]);
                driver.create_endpoint(&req).await
            }));
        }
        let driver = Arc::clone(&h.driver);
        let deletion = tokio::spawn(async move { driver.delete_network(&delete_network("net1")).await });

        for task in tasks {
            if let Err(e) = task.await.unwrap() {
                assert_eq!(e.kind(), ErrorKind::NotFound);
            }
        }
        deletion.await.unwrap().unwrap();

        assert!(!h.driver.has_network("net1"));
        assert_eq!(h.ports.in_use(), 0);
        assert!(h.links.names().is_empty());
    }

    /// Holds the first mapping at a rendezvous until the test lets it go.
    struct GatedPorts {
        inner: Arc<MemoryPorts>,
        gate: Arc<std::sync::Barrier>,
        armed: std::sync::atomic::AtomicBool,
    }

    impl PortMapper for GatedPorts {
        fn map_range(
            &self,
            container: MappedAddr,
            host_ip: IpAddr,
            start: u16,
            end: u16,
        ) -> ShroudResult<MappedAddr> {
            if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                self.gate.wait();
                self.gate.wait();
            }
            self.inner.map_range(container, host_ip, start, end)
        }

        fn unmap(&self, host: MappedAddr) -> ShroudResult<()> {
            self.inner.unmap(host)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn endpoint_deleted_while_mapping_ports() {
        let ports = Arc::new(MemoryPorts::new());
        let gate = Arc::new(std::sync::Barrier::new(2));
        let gated = Arc::new(GatedPorts {
            inner: Arc::clone(&ports),
            gate: Arc::clone(&gate),
            armed: std::sync::atomic::AtomicBool::new(true),
        });
        let backends = Backends {
            links: Arc::new(MemoryLinks::new()),
            rules: Arc::new(MemoryRules::new()),
            proxy: Arc::new(StaticProxyResolver(PROXY.parse().unwrap())),
            port_mappers: Arc::new(move |_: &str| Arc::clone(&gated) as Arc<dyn PortMapper>),
        };
        let config = DriverConfig::default().with_link_lookup(0, Duration::ZERO);
        let driver = Arc::new(Driver::new(config, backends));
        driver
            .create_network(&create_network("net1", "172.18.0.1/16"))
            .await
            .unwrap();

        let creator = Arc::clone(&driver);
        let creation = tokio::spawn(async move {
            let req = create_endpoint("net1", "ep1", vec![PortBinding::tcp(80)]);
            creator.create_endpoint(&req).await
        });

        let wait = Arc::clone(&gate);
        tokio::task::spawn_blocking(move || wait.wait()).await.unwrap();
        driver.delete_endpoint(&delete_endpoint("net1", "ep1")).await.unwrap();
        let wait = Arc::clone(&gate);
        tokio::task::spawn_blocking(move || wait.wait()).await.unwrap();

        let err = creation.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(driver.endpoint("net1", "ep1").is_none());
        assert_eq!(ports.map_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(ports.in_use(), 0);
    }
}

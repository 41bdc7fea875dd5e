//! Local bridge network driver.
//!
//! Each network is backed by one Linux bridge. Setup reconciles the declared
//! configuration against the live host: a missing bridge is created, an
//! existing one is validated and adopted, never rewritten. Endpoints get an
//! address from the bridge subnet (or its fixed sub-range) and a MAC derived
//! from that address.

pub mod config;
pub mod link;
pub mod rules;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use berth_common::{BerthError, BerthResult};
use ipnet::{IpNet, Ipv6Net};
use parking_lot::Mutex;

pub use config::{BridgeNetworkConfig, LabelReader};

use self::config::overlaps;

use crate::driver::NetworkDriver;
use crate::firewall::{Firewall, IptablesFirewall};
use crate::host::{HostNetwork, IpCommandHost};
use crate::ipam::{AddressAllocator, IpAllocator};
use crate::mac::MacAddr;
use crate::model::{Endpoint, Network, NetworkInterface};

/// Longest IPv6 prefix that still leaves room to embed a MAC.
const MAC_EMBED_MAX_PREFIX: u8 = 80;

/// Addresses handed to one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointAllocation {
    /// IPv4 address.
    pub ipv4: Ipv4Addr,
    /// Global IPv6 address, if the network routes one.
    pub ipv6: Option<Ipv6Addr>,
}

/// A network this driver has set up.
#[derive(Debug)]
struct BridgeNetwork {
    config: BridgeNetworkConfig,
    interfaces: HashMap<String, EndpointAllocation>,
}

/// Bridge-backed [`NetworkDriver`].
pub struct BridgeDriver {
    host: Arc<dyn HostNetwork>,
    firewall: Arc<dyn Firewall>,
    allocator: Arc<dyn AddressAllocator>,
    networks: Mutex<HashMap<String, BridgeNetwork>>,
}

impl BridgeDriver {
    /// Create a driver over the given host, firewall and allocator.
    pub fn new(
        host: Arc<dyn HostNetwork>,
        firewall: Arc<dyn Firewall>,
        allocator: Arc<dyn AddressAllocator>,
    ) -> Self {
        Self {
            host,
            firewall,
            allocator,
            networks: Mutex::new(HashMap::new()),
        }
    }

    /// Driver using the `ip` command, the given iptables binary and an
    /// in-memory allocator.
    #[must_use]
    pub fn with_system_defaults(iptables: &str) -> Self {
        Self::new(
            Arc::new(IpCommandHost::new()),
            Arc::new(IptablesFirewall::new(iptables)),
            Arc::new(IpAllocator::new()),
        )
    }

    /// Configuration of a network that has been set up.
    #[must_use]
    pub fn config(&self, network_id: &str) -> Option<BridgeNetworkConfig> {
        self.networks
            .lock()
            .get(network_id)
            .map(|n| n.config.clone())
    }

    /// Allocation held for an endpoint.
    #[must_use]
    pub fn allocation(&self, network_id: &str, endpoint_id: &str) -> Option<EndpointAllocation> {
        self.networks
            .lock()
            .get(network_id)
            .and_then(|n| n.interfaces.get(endpoint_id).copied())
    }

    fn register_addresses(&self, config: &BridgeNetworkConfig) -> BerthResult<()> {
        let subnet = IpNet::V4(config.bridge_subnet());
        let range = config.fixed_ipv4_subnet.map_or(subnet, IpNet::V4);
        self.allocator.register_subnet(subnet, range)?;
        self.allocator
            .reserve_ip(subnet, IpAddr::V4(config.bridge_address()))?;

        if let Some(fixed) = config.fixed_ipv6_subnet {
            let subnet = IpNet::V6(fixed);
            self.allocator.register_subnet(subnet, subnet)?;
            if let Some(bridge) = config.bridge_ipv6 {
                if fixed.contains(&bridge.addr()) {
                    self.allocator.reserve_ip(subnet, IpAddr::V6(bridge.addr()))?;
                }
            }
        }

        Ok(())
    }

    /// Address ranges are shared per subnet, so no two networks may overlap.
    fn check_overlap(&self, network_id: &str, config: &BridgeNetworkConfig) -> BerthResult<()> {
        let ours = subnets_of(config);
        let networks = self.networks.lock();

        for (id, other) in networks.iter().filter(|(id, _)| id.as_str() != network_id) {
            let theirs = subnets_of(&other.config);
            if let Some(subnet) = ours
                .iter()
                .find(|subnet| theirs.iter().any(|t| overlaps(subnet, t)))
            {
                return Err(BerthError::SubnetOverlap {
                    subnet: subnet.to_string(),
                    network: id.clone(),
                });
            }
        }

        Ok(())
    }

    fn unregister_addresses(&self, config: &BridgeNetworkConfig) -> BerthResult<()> {
        self.allocator
            .unregister_subnet(IpNet::V4(config.bridge_subnet()))?;
        if let Some(fixed) = config.fixed_ipv6_subnet {
            self.allocator.unregister_subnet(IpNet::V6(fixed))?;
        }
        Ok(())
    }

    /// Allocate `requested`, or any free address if it is taken or outside
    /// the subnet.
    fn allocate(&self, subnet: IpNet, requested: Option<IpAddr>) -> BerthResult<IpAddr> {
        let Some(ip) = requested else {
            return self.allocator.request_ip(subnet, None);
        };

        match self.allocator.request_ip(subnet, Some(ip)) {
            Err(
                e @ (BerthError::AddressInUse { .. } | BerthError::AddressOutOfRange { .. }),
            ) => {
                tracing::warn!(
                    requested = %ip,
                    error = %e,
                    "Requested address unavailable, allocating another"
                );
                self.allocator.request_ip(subnet, None)
            }
            result => result,
        }
    }

    fn allocate_ipv6(&self, subnet: Ipv6Net, mac: MacAddr) -> BerthResult<Ipv6Addr> {
        let requested =
            (subnet.prefix_len() <= MAC_EMBED_MAX_PREFIX).then(|| IpAddr::V6(mac.embed_in(subnet)));

        match self.allocate(IpNet::V6(subnet), requested)? {
            IpAddr::V6(ip) => Ok(ip),
            IpAddr::V4(ip) => Err(BerthError::internal(format!(
                "IPv4 address {ip} allocated from IPv6 subnet {subnet}"
            ))),
        }
    }

    fn release(&self, config: &BridgeNetworkConfig, allocation: EndpointAllocation) {
        let subnet = IpNet::V4(config.bridge_subnet());
        if let Err(e) = self.allocator.release_ip(subnet, IpAddr::V4(allocation.ipv4)) {
            tracing::warn!(ip = %allocation.ipv4, error = %e, "Unable to release IPv4 address");
        }

        if let (Some(ip), Some(fixed)) = (allocation.ipv6, config.fixed_ipv6_subnet) {
            if let Err(e) = self.allocator.release_ip(IpNet::V6(fixed), IpAddr::V6(ip)) {
                tracing::warn!(%ip, error = %e, "Unable to release IPv6 address");
            }
        }
    }
}

/// Subnets a network allocates from.
fn subnets_of(config: &BridgeNetworkConfig) -> Vec<IpNet> {
    std::iter::once(IpNet::V4(config.bridge_subnet()))
        .chain(config.fixed_ipv6_subnet.map(IpNet::V6))
        .collect()
}

impl fmt::Debug for BridgeDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let networks: Vec<String> = self.networks.lock().keys().cloned().collect();
        f.debug_struct("BridgeDriver")
            .field("networks", &networks)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NetworkDriver for BridgeDriver {
    async fn setup(&self, network: &mut Network) -> BerthResult<()> {
        let config = match BridgeNetworkConfig::from_state(&network.state)? {
            Some(config) => config,
            None => BridgeNetworkConfig::from_labels(&network.labels, self.host.as_ref())?,
        };

        tracing::info!(
            network_id = %network.id,
            bridge = %config.bridge_interface,
            address = %config.bridge_ipv4,
            "Setting up bridge network"
        );

        self.check_overlap(&network.id, &config)?;
        link::reconcile(self.host.as_ref(), &config)?;

        if config.enable_firewall {
            rules::apply(self.firewall.as_ref(), &config)?;
        }

        if config.enable_forwarding {
            link::enable_forwarding(self.host.as_ref(), &config);
        }

        self.register_addresses(&config)?;
        config.store(&mut network.state)?;

        let mut networks = self.networks.lock();
        let unchanged = networks
            .get(&network.id)
            .is_some_and(|existing| existing.config == config);
        if !unchanged {
            networks.insert(
                network.id.clone(),
                BridgeNetwork {
                    config,
                    interfaces: HashMap::new(),
                },
            );
        }

        Ok(())
    }

    async fn destroy(&self, network: &Network) -> BerthResult<()> {
        let removed = self.networks.lock().remove(&network.id);
        let config = match removed {
            Some(bridge) => bridge.config,
            None => match BridgeNetworkConfig::from_state(&network.state)? {
                Some(config) => config,
                None => return Ok(()),
            },
        };

        tracing::info!(
            network_id = %network.id,
            bridge = %config.bridge_interface,
            "Destroying bridge network"
        );

        if config.enable_firewall {
            rules::remove(self.firewall.as_ref(), &config);
        }
        self.unregister_addresses(&config)
    }

    async fn plug(&self, network: &Network, endpoint: &Endpoint) -> BerthResult<NetworkInterface> {
        let config = self
            .config(&network.id)
            .ok_or_else(|| BerthError::NetworkNotFound {
                name: network.id.clone(),
            })?;

        let requested_ip = config::requested_ip(&endpoint.labels)?;
        let requested_mac = LabelReader(&endpoint.labels)
            .get_string(config::labels::REQUESTED_MAC)
            .map(str::parse::<MacAddr>)
            .transpose()?;

        let ipv4 = match self.allocate(IpNet::V4(config.bridge_subnet()), requested_ip)? {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => {
                return Err(BerthError::internal(format!(
                    "IPv6 address {ip} allocated from IPv4 subnet"
                )));
            }
        };
        let mac = requested_mac.unwrap_or_else(|| MacAddr::from_ipv4(ipv4));

        let mut allocation = EndpointAllocation { ipv4, ipv6: None };
        if let Some(fixed) = config.fixed_ipv6_subnet {
            match self.allocate_ipv6(fixed, mac) {
                Ok(ip) => allocation.ipv6 = Some(ip),
                Err(e) => {
                    self.release(&config, allocation);
                    return Err(e);
                }
            }
        }

        let recorded = match self.networks.lock().get_mut(&network.id) {
            Some(bridge) => {
                bridge.interfaces.insert(endpoint.id.clone(), allocation);
                true
            }
            None => false,
        };
        if !recorded {
            self.release(&config, allocation);
            return Err(BerthError::NetworkNotFound {
                name: network.id.clone(),
            });
        }

        tracing::debug!(
            network_id = %network.id,
            endpoint_id = %endpoint.id,
            ip = %ipv4,
            mac = %mac,
            "Plugged endpoint"
        );

        let gateway = config
            .enable_default_gateway
            .then(|| config.bridge_address().to_string())
            .unwrap_or_default();
        let ipv6_gateway = match (allocation.ipv6, config.bridge_ipv6) {
            (Some(_), Some(bridge)) if config.enable_default_gateway => bridge.addr().to_string(),
            _ => String::new(),
        };

        Ok(NetworkInterface {
            gateway,
            ip_address: ipv4.to_string(),
            ip_prefix_len: config.bridge_ipv4.prefix_len(),
            mac_address: mac.to_string(),
            bridge: config.bridge_interface.clone(),
            link_local_ipv6: if config.ipv6_enabled {
                mac.link_local_ipv6().to_string()
            } else {
                String::new()
            },
            global_ipv6: allocation.ipv6.map(|ip| ip.to_string()).unwrap_or_default(),
            global_ipv6_prefix_len: config.fixed_ipv6_subnet.map_or(0, |n| n.prefix_len()),
            ipv6_gateway,
        })
    }

    async fn unplug(&self, network: &Network, endpoint: &Endpoint) -> BerthResult<()> {
        let unknown = || BerthError::EndpointUnknown {
            id: endpoint.id.clone(),
        };

        let (config, allocation) = {
            let mut networks = self.networks.lock();
            let bridge = networks.get_mut(&network.id).ok_or_else(unknown)?;
            let allocation = bridge.interfaces.remove(&endpoint.id).ok_or_else(unknown)?;
            (bridge.config.clone(), allocation)
        };

        self.release(&config, allocation);

        tracing::debug!(
            network_id = %network.id,
            endpoint_id = %endpoint.id,
            ip = %allocation.ipv4,
            "Unplugged endpoint"
        );
        Ok(())
    }
}

//! Bridge interface reconciliation.

use berth_common::{BerthError, BerthResult};
use ipnet::IpNet;

use super::config::BridgeNetworkConfig;
use crate::host::HostNetwork;
use crate::mac::MacAddr;

/// Bring the host bridge in line with `config`.
///
/// A missing bridge is created and addressed. An existing bridge is only
/// validated: its IPv4 address is never rewritten, and IPv6 is added only
/// when the bridge has none yet.
pub fn reconcile(host: &dyn HostNetwork, config: &BridgeNetworkConfig) -> BerthResult<()> {
    let bridge = config.bridge_interface.as_str();

    if !host.link_exists(bridge)? {
        create(host, config)?;

        if let Some(subnet) = config.fixed_ipv6_subnet {
            tracing::info!(%subnet, bridge, "Adding route to IPv6 network");
            host.add_route(IpNet::V6(subnet), bridge)?;
        }
    }

    let addresses = host.link_addresses(bridge)?;
    match addresses.ipv4 {
        Some(current) if current.addr() == config.bridge_address() => {}
        current => {
            return Err(BerthError::BridgeConfigMismatch {
                bridge: bridge.to_string(),
                expected: config.bridge_ipv4.to_string(),
                actual: current.map_or_else(|| "none".to_string(), |c| c.to_string()),
            });
        }
    }

    if config.ipv6_enabled {
        let mut ipv6 = addresses.ipv6;
        if ipv6.is_empty() {
            setup_ipv6(host, config)?;
            ipv6 = host.link_addresses(bridge)?.ipv6;
        }

        if ipv6.is_empty() {
            return Err(BerthError::IPv6NotConfigured {
                bridge: bridge.to_string(),
            });
        }

        if let Some(expected) = config.bridge_ipv6 {
            if !ipv6.iter().any(|net| net.addr() == expected.addr()) {
                return Err(BerthError::BridgeConfigMismatch {
                    bridge: bridge.to_string(),
                    expected: expected.to_string(),
                    actual: ipv6
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }
    }

    Ok(())
}

fn create(host: &dyn HostNetwork, config: &BridgeNetworkConfig) -> BerthResult<()> {
    let bridge = config.bridge_interface.as_str();
    tracing::debug!(bridge, address = %config.bridge_ipv4, "Creating bridge");

    let mac = match host.kernel_version() {
        Ok(version) if version.supports_bridge_mac() => Some(MacAddr::random()),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, "Kernel version unknown, leaving bridge MAC to the kernel");
            None
        }
    };

    host.create_bridge(bridge, mac)?;
    host.add_address(bridge, IpNet::V4(config.bridge_ipv4))?;
    if config.ipv6_enabled {
        setup_ipv6(host, config)?;
    }
    host.set_link_up(bridge)
}

fn setup_ipv6(host: &dyn HostNetwork, config: &BridgeNetworkConfig) -> BerthResult<()> {
    let bridge = config.bridge_interface.as_str();
    host.write_sysctl(&format!("net/ipv6/conf/{bridge}/disable_ipv6"), "0")?;

    if let Some(address) = config.bridge_ipv6 {
        host.add_address(bridge, IpNet::V6(address))?;
    }
    Ok(())
}

/// Turn on kernel forwarding. Failures are logged only.
pub fn enable_forwarding(host: &dyn HostNetwork, config: &BridgeNetworkConfig) {
    let mut keys = vec!["net/ipv4/ip_forward"];
    if config.fixed_ipv6_subnet.is_some() {
        keys.extend(["net/ipv6/conf/default/forwarding", "net/ipv6/conf/all/forwarding"]);
    }

    for key in keys {
        if let Err(e) = host.write_sysctl(key, "1") {
            tracing::warn!(key, error = %e, "Unable to enable forwarding");
        }
    }
}

//! Bridge network configuration.
//!
//! Resolved once from network labels on first setup, then frozen into the
//! network's driver state and read back verbatim on every later setup.

use std::net::{IpAddr, Ipv4Addr};

use berth_common::{BerthError, BerthResult};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::host::HostNetwork;
use crate::model::{DriverState, Labels};

/// Key under which the configuration is stored in the network state.
pub const STATE_KEY: &str = "bridge";

/// Number of `bridgeN` names tried when none is given.
pub const BRIDGE_NAME_CANDIDATES: usize = 10;

/// Default bridge IPv6 address when IPv6 is enabled.
pub const DEFAULT_BRIDGE_IPV6: &str = "fe80::1/64";

/// Linux interface names are at most 15 bytes.
const MAX_INTERFACE_NAME: usize = 15;

/// Private ranges tried in order when no bridge address is given.
///
/// The host part is the bridge address; the /16 entries keep the `.42.1`
/// gateway of the /24 entries that preceded them.
pub const PRIVATE_RANGES: &[&str] = &[
    "172.17.42.1/16",
    "10.0.42.1/16",
    "10.1.42.1/16",
    "10.42.42.1/16",
    "172.16.42.1/24",
    "172.16.43.1/24",
    "172.16.44.1/24",
    "10.0.42.1/24",
    "10.0.43.1/24",
    "192.168.42.1/24",
    "192.168.43.1/24",
    "192.168.44.1/24",
];

/// Label names read by the bridge driver.
pub mod labels {
    /// Bridge interface name.
    pub const BRIDGE_IFACE: &str = "BridgeIface";
    /// Bridge IPv4 address in CIDR form.
    pub const BRIDGE_IP: &str = "BridgeIP";
    /// IPv4 sub-range reserved for endpoints.
    pub const FIXED_CIDR: &str = "FixedCIDR";
    /// Enable IPv6 on the bridge.
    pub const ENABLE_IPV6: &str = "EnableIPv6";
    /// Bridge IPv6 address in CIDR form.
    pub const BRIDGE_IPV6: &str = "BridgeIPv6";
    /// Routed global IPv6 subnet for endpoints.
    pub const FIXED_CIDR_V6: &str = "FixedCIDRv6";
    /// Manage firewall rules.
    pub const ENABLE_IPTABLES: &str = "EnableIptables";
    /// Allow traffic between endpoints on the bridge.
    pub const INTER_CONTAINER_COMMUNICATION: &str = "InterContainerCommunication";
    /// Masquerade outbound traffic.
    pub const ENABLE_IP_MASQ: &str = "EnableIpMasq";
    /// Turn on kernel forwarding.
    pub const ENABLE_IP_FORWARD: &str = "EnableIpForward";
    /// Announce the bridge as the endpoints' gateway.
    pub const ENABLE_DEFAULT_GATEWAY: &str = "EnableDefaultGateway";
    /// Address requested for an endpoint.
    pub const REQUESTED_IP: &str = "RequestedIP";
    /// MAC requested for an endpoint.
    pub const REQUESTED_MAC: &str = "RequestedMac";
}

/// Configuration of one bridge network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeNetworkConfig {
    /// Host bridge interface.
    pub bridge_interface: String,
    /// Bridge IPv4 address; the prefix gives the bridge subnet.
    pub bridge_ipv4: Ipv4Net,
    /// Sub-range of the bridge subnet endpoints draw from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_ipv4_subnet: Option<Ipv4Net>,
    /// Whether IPv6 is configured on the bridge.
    #[serde(default)]
    pub ipv6_enabled: bool,
    /// Bridge IPv6 address; the prefix gives its subnet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_ipv6: Option<Ipv6Net>,
    /// Routed global IPv6 subnet for endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_ipv6_subnet: Option<Ipv6Net>,
    /// Manage firewall rules.
    #[serde(default)]
    pub enable_firewall: bool,
    /// Allow endpoint to endpoint traffic.
    #[serde(default = "default_true")]
    pub enable_icc: bool,
    /// Masquerade traffic leaving the bridge subnet.
    #[serde(default)]
    pub enable_masquerade: bool,
    /// Enable kernel forwarding.
    #[serde(default)]
    pub enable_forwarding: bool,
    /// Hand the bridge address to endpoints as their gateway.
    #[serde(default)]
    pub enable_default_gateway: bool,
}

const fn default_true() -> bool {
    true
}

impl BridgeNetworkConfig {
    /// Resolve a configuration from network labels.
    ///
    /// A missing interface name or address is filled in by probing `host`
    /// for a free bridge name and a non-overlapping private range.
    pub fn from_labels(labels: &Labels, host: &dyn HostNetwork) -> BerthResult<Self> {
        let reader = LabelReader(labels);

        let bridge_interface = match reader.get_string(labels::BRIDGE_IFACE) {
            Some(name) => name.to_string(),
            None => find_free_bridge_name(host)?,
        };

        let bridge_ipv4 = match reader.get_string(labels::BRIDGE_IP) {
            Some(cidr) => parse_cidr::<Ipv4Net>(labels::BRIDGE_IP, cidr)?,
            None => find_free_range(host)?,
        };

        let fixed_ipv4_subnet = reader
            .get_string(labels::FIXED_CIDR)
            .map(|cidr| parse_cidr::<Ipv4Net>(labels::FIXED_CIDR, cidr).map(|n| n.trunc()))
            .transpose()?;

        let ipv6_enabled = reader.get_bool(labels::ENABLE_IPV6, false);
        let (bridge_ipv6, fixed_ipv6_subnet) = if ipv6_enabled {
            let bridge = reader
                .get_string(labels::BRIDGE_IPV6)
                .unwrap_or(DEFAULT_BRIDGE_IPV6);
            let fixed = reader
                .get_string(labels::FIXED_CIDR_V6)
                .map(|cidr| parse_cidr::<Ipv6Net>(labels::FIXED_CIDR_V6, cidr).map(|n| n.trunc()))
                .transpose()?;
            (Some(parse_cidr::<Ipv6Net>(labels::BRIDGE_IPV6, bridge)?), fixed)
        } else {
            (None, None)
        };

        let config = Self {
            bridge_interface,
            bridge_ipv4,
            fixed_ipv4_subnet,
            ipv6_enabled,
            bridge_ipv6,
            fixed_ipv6_subnet,
            enable_firewall: reader.get_bool(labels::ENABLE_IPTABLES, false),
            enable_icc: reader.get_bool(labels::INTER_CONTAINER_COMMUNICATION, true),
            enable_masquerade: reader.get_bool(labels::ENABLE_IP_MASQ, false),
            enable_forwarding: reader.get_bool(labels::ENABLE_IP_FORWARD, false),
            enable_default_gateway: reader.get_bool(labels::ENABLE_DEFAULT_GATEWAY, false),
        };
        config.validate()?;
        Ok(config)
    }

    /// Read the configuration recorded by an earlier setup, if any.
    pub fn from_state(state: &DriverState) -> BerthResult<Option<Self>> {
        let Some(json) = state.get(STATE_KEY) else {
            return Ok(None);
        };

        let config: Self = serde_json::from_str(json)
            .map_err(|e| BerthError::Serialization(format!("bridge network state: {e}")))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Record the configuration in the network state.
    pub fn store(&self, state: &mut DriverState) -> BerthResult<()> {
        state.insert(STATE_KEY.to_string(), serde_json::to_string(self)?);
        Ok(())
    }

    /// Check internal consistency.
    pub fn validate(&self) -> BerthResult<()> {
        if self.bridge_interface.is_empty() || self.bridge_interface.len() > MAX_INTERFACE_NAME {
            return Err(BerthError::Config {
                message: format!(
                    "Bridge interface name '{}' must be 1 to {MAX_INTERFACE_NAME} characters",
                    self.bridge_interface
                ),
            });
        }

        if let Some(fixed) = self.fixed_ipv4_subnet {
            if !self.bridge_subnet().contains(&fixed) {
                return Err(BerthError::Config {
                    message: format!(
                        "Fixed subnet {fixed} is outside bridge subnet {}",
                        self.bridge_subnet()
                    ),
                });
            }
        }

        if self.ipv6_enabled {
            if self.bridge_ipv6.is_none() {
                return Err(BerthError::Config {
                    message: "IPv6 enabled without a bridge IPv6 address".to_string(),
                });
            }
        } else if self.bridge_ipv6.is_some() || self.fixed_ipv6_subnet.is_some() {
            return Err(BerthError::Config {
                message: "IPv6 settings present while IPv6 is disabled".to_string(),
            });
        }

        Ok(())
    }

    /// The bridge's own IPv4 address.
    #[must_use]
    pub fn bridge_address(&self) -> Ipv4Addr {
        self.bridge_ipv4.addr()
    }

    /// The bridge IPv4 subnet.
    #[must_use]
    pub fn bridge_subnet(&self) -> Ipv4Net {
        self.bridge_ipv4.trunc()
    }

    /// Firewall chain managed for this bridge.
    #[must_use]
    pub fn chain_name(&self) -> String {
        format!("BERTH-{}", self.bridge_interface)
    }
}

/// Typed access to string labels.
#[derive(Debug, Clone, Copy)]
pub struct LabelReader<'a>(pub &'a Labels);

impl<'a> LabelReader<'a> {
    /// Non-empty string value.
    #[must_use]
    pub fn get_string(&self, name: &str) -> Option<&'a str> {
        self.0
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Boolean value; `default` only when unset or unparsable.
    #[must_use]
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.get_string(name)
            .and_then(parse_bool)
            .unwrap_or(default)
    }
}

/// Accepts the spellings `1 t T TRUE true True 0 f F FALSE false False`.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn parse_cidr<T: std::str::FromStr>(label: &str, value: &str) -> BerthResult<T> {
    value.parse().map_err(|_| BerthError::Config {
        message: format!("{label}: '{value}' is not a valid CIDR"),
    })
}

/// First `bridgeN` name not present on the host.
pub fn find_free_bridge_name(host: &dyn HostNetwork) -> BerthResult<String> {
    for i in 0..BRIDGE_NAME_CANDIDATES {
        let name = format!("bridge{i}");
        if !host.link_exists(&name)? {
            return Ok(name);
        }
    }
    Err(BerthError::NoFreeBridgeName)
}

/// First private range clear of nameservers and host routes.
pub fn find_free_range(host: &dyn HostNetwork) -> BerthResult<Ipv4Net> {
    // An unreadable resolv.conf just means there is nothing to avoid.
    let nameservers = host.nameservers().unwrap_or_else(|e| {
        tracing::debug!(error = %e, "Could not read nameservers");
        Vec::new()
    });
    let routes = host.routes()?;

    for cidr in PRIVATE_RANGES {
        let candidate: Ipv4Net = parse_cidr("private range", cidr)?;
        let subnet = IpNet::V4(candidate.trunc());

        if nameservers.iter().any(|ns| subnet.contains(ns)) {
            tracing::debug!(%subnet, "Range overlaps a nameserver");
            continue;
        }
        if routes.iter().any(|route| overlaps(&subnet, route)) {
            tracing::debug!(%subnet, "Range overlaps a host route");
            continue;
        }
        return Ok(candidate);
    }

    Err(BerthError::NoFreeAddressRange)
}

/// Whether two networks share any address.
pub(crate) fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Parse an endpoint's requested IPv4 address label.
pub fn requested_ip(labels: &Labels) -> BerthResult<Option<IpAddr>> {
    let Some(value) = LabelReader(labels).get_string(labels::REQUESTED_IP) else {
        return Ok(None);
    };
    match value.parse::<IpAddr>() {
        Ok(ip @ IpAddr::V4(_)) => Ok(Some(ip)),
        _ => Err(BerthError::InvalidRequestedAddress {
            value: value.to_string(),
        }),
    }
}

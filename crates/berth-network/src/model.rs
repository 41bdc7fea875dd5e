//! Network, endpoint and interface records.
//!
//! Field names on the wire are PascalCase so persisted records and plugin
//! payloads keep the layout existing plugins and record files expect.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// User-supplied key/value metadata.
pub type Labels = BTreeMap<String, String>;

/// Driver-private key/value state, opaque to the registry.
pub type DriverState = BTreeMap<String, String>;

/// A declared virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Network {
    /// Unique, immutable identifier.
    #[serde(rename = "ID")]
    pub id: String,
    /// Unique name among live networks.
    pub name: String,
    /// Name of the driver backing this network.
    pub driver: String,
    /// User labels, immutable after creation.
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: Labels,
    /// State owned by the driver, round-tripped through persistence.
    #[serde(default, deserialize_with = "null_as_default")]
    pub state: DriverState,
}

impl Network {
    /// Create a network record with a fresh ID and empty driver state.
    #[must_use]
    pub fn new(name: impl Into<String>, driver: impl Into<String>, labels: Labels) -> Self {
        Self {
            id: berth_common::generate_id(),
            name: name.into(),
            driver: driver.into(),
            labels,
            state: DriverState::new(),
        }
    }

    /// The public view of the network, without driver state.
    #[must_use]
    pub fn summary(&self) -> NetworkSummary {
        NetworkSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            driver: self.driver.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// Listing entry for a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSummary {
    /// Network ID.
    #[serde(rename = "ID")]
    pub id: String,
    /// Network name.
    pub name: String,
    /// Driver name.
    pub driver: String,
    /// User labels.
    pub labels: Labels,
}

/// A container's attachment point on a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Endpoint {
    /// Unique endpoint identifier.
    #[serde(rename = "ID")]
    pub id: String,
    /// ID of the network the endpoint lives on.
    pub network: String,
    /// Endpoint labels (requested address, requested MAC, ...).
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: Labels,
}

impl Endpoint {
    /// Create an endpoint on `network_id` with a fresh ID.
    #[must_use]
    pub fn new(network_id: impl Into<String>, labels: Labels) -> Self {
        Self {
            id: berth_common::generate_id(),
            network: network_id.into(),
            labels,
        }
    }
}

/// Interface descriptor a driver hands back from `plug`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInterface {
    /// Gateway address, empty if none is announced.
    #[serde(rename = "Gateway")]
    pub gateway: String,
    /// Allocated IPv4 address.
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    /// Prefix length of the network the address belongs to.
    #[serde(rename = "IPPrefixLen")]
    pub ip_prefix_len: u8,
    /// MAC address for the container side.
    #[serde(rename = "MacAddress")]
    pub mac_address: String,
    /// Host bridge the interface attaches to.
    #[serde(rename = "Bridge")]
    pub bridge: String,
    /// EUI-64 link-local IPv6 address.
    #[serde(rename = "LinkLocalIPv6", skip_serializing_if = "String::is_empty")]
    pub link_local_ipv6: String,
    /// Allocated global IPv6 address.
    #[serde(rename = "GlobalIPv6", skip_serializing_if = "String::is_empty")]
    pub global_ipv6: String,
    /// Prefix length of the global IPv6 network.
    #[serde(rename = "GlobalIPv6PrefixLen", skip_serializing_if = "is_zero")]
    pub global_ipv6_prefix_len: u8,
    /// IPv6 gateway address.
    #[serde(rename = "IPv6Gateway", skip_serializing_if = "String::is_empty")]
    pub ipv6_gateway: String,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(value: &u8) -> bool {
    *value == 0
}

/// Older records wrote `null` for empty maps.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

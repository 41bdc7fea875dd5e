//! # berth-network
//!
//! Network control plane for Berth containers.
//!
//! This crate provides:
//! - The driver contract and a registry of named drivers
//! - The network registry with persistence and restore
//! - A bridge driver that reconciles host bridges and firewall rules
//! - An adapter for drivers hosted by external plugins
//! - An address allocator and MAC derivation

#![warn(missing_docs)]

pub mod bridge;
pub mod container;
pub mod driver;
pub mod firewall;
pub mod host;
pub mod ipam;
pub mod mac;
pub mod manager;
pub mod model;
pub mod remote;
pub mod store;

pub use bridge::{BridgeDriver, BridgeNetworkConfig};
pub use container::{AttachedEndpoint, ContainerNetworks};
pub use driver::{DriverRegistry, NetworkDriver};
pub use firewall::{Firewall, IptablesFirewall, Table};
pub use host::{HostNetwork, IpCommandHost, KernelVersion, LinkAddresses};
pub use ipam::{AddressAllocator, IpAllocator};
pub use mac::MacAddr;
pub use manager::NetworkManager;
pub use model::{DriverState, Endpoint, Labels, Network, NetworkInterface, NetworkSummary};
pub use remote::{HttpTransport, PluginProtocol, PluginTransport, RemoteDriver};
pub use store::NetworkStore;

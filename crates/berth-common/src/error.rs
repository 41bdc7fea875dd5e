//! Common error types for the Berth network control plane.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`BerthError`].
pub type BerthResult<T> = Result<T, BerthError>;

/// Coarse classification of a [`BerthError`].
///
/// Callers branch on the kind instead of matching individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A network, container, endpoint or driver could not be resolved.
    NotFound,
    /// The request collides with existing state.
    Conflict,
    /// Live host state disagrees with the declared configuration.
    ConfigMismatch,
    /// No address range or address is left.
    ResourceExhausted,
    /// A remote plugin could not be reached or reported a failure.
    TransportFailure,
    /// Caller supplied a malformed value.
    InvalidInput,
    /// Host, filesystem or serialization failure.
    Internal,
}

/// Common errors across the Berth crates.
#[derive(Error, Diagnostic, Debug)]
pub enum BerthError {
    /// Network not found.
    #[error("Network '{name}' not found")]
    #[diagnostic(code(berth::network::not_found))]
    NetworkNotFound {
        /// The name or ID that failed to resolve.
        name: String,
    },

    /// Container not found.
    #[error("Container '{id}' not found")]
    #[diagnostic(code(berth::container::not_found))]
    ContainerNotFound {
        /// The container ID that was not found.
        id: String,
    },

    /// Endpoint not attached to the container.
    #[error("Endpoint '{id}' not found")]
    #[diagnostic(code(berth::endpoint::not_found))]
    EndpointNotFound {
        /// The endpoint ID that was not found.
        id: String,
    },

    /// No driver registered under the name.
    #[error("Driver '{name}' not found")]
    #[diagnostic(
        code(berth::driver::not_found),
        help("Register the driver at startup or declare the plugin in the daemon config")
    )]
    DriverNotFound {
        /// The driver name.
        name: String,
    },

    /// A live network already uses the name.
    #[error("Network '{name}' already exists")]
    #[diagnostic(code(berth::network::name_conflict))]
    NameConflict {
        /// The conflicting name.
        name: String,
    },

    /// Container is running and cannot be re-plumbed.
    #[error("Cannot change the networks of running container '{id}'")]
    #[diagnostic(
        code(berth::container::running),
        help("Stop the container before plugging or unplugging endpoints")
    )]
    ContainerRunning {
        /// The running container.
        id: String,
    },

    /// Network still has endpoints attached.
    #[error("Network '{name}' still has {endpoints} endpoint(s) attached")]
    #[diagnostic(code(berth::network::in_use))]
    NetworkInUse {
        /// The network name.
        name: String,
        /// Number of attached endpoints.
        endpoints: usize,
    },

    /// Existing bridge does not carry the configured address.
    #[error("Bridge '{bridge}' address ({actual}) does not match configured {expected}")]
    #[diagnostic(
        code(berth::bridge::config_mismatch),
        help("Remove or reconfigure the existing bridge; it is never rewritten automatically")
    )]
    BridgeConfigMismatch {
        /// The bridge interface.
        bridge: String,
        /// The configured address.
        expected: String,
        /// What the host reports.
        actual: String,
    },

    /// IPv6 is enabled but the bridge still has no IPv6 address.
    #[error("IPv6 enabled but no IPv6 address detected on bridge '{bridge}'")]
    #[diagnostic(code(berth::bridge::ipv6_not_configured))]
    IPv6NotConfigured {
        /// The bridge interface.
        bridge: String,
    },

    /// Another network managed by the same driver already uses the subnet.
    #[error("Subnet {subnet} overlaps network '{network}'")]
    #[diagnostic(
        code(berth::bridge::subnet_overlap),
        help("Pick a BridgeIP outside the subnets of existing networks")
    )]
    SubnetOverlap {
        /// The requested subnet.
        subnet: String,
        /// ID of the network already using it.
        network: String,
    },

    /// Every candidate private range overlaps something on the host.
    #[error("Could not find a free IP address range")]
    #[diagnostic(
        code(berth::bridge::no_free_range),
        help("Set the BridgeIP label to an unused CIDR")
    )]
    NoFreeAddressRange,

    /// Every candidate bridge name is taken.
    #[error("Could not find a free bridge interface name")]
    #[diagnostic(
        code(berth::bridge::no_free_name),
        help("Set the BridgeIface label explicitly")
    )]
    NoFreeBridgeName,

    /// No free address left in the pool.
    #[error("No available addresses in {subnet}")]
    #[diagnostic(code(berth::ipam::exhausted))]
    AddressExhausted {
        /// The exhausted subnet.
        subnet: String,
    },

    /// Address already handed out.
    #[error("Address {address} is already allocated")]
    #[diagnostic(code(berth::ipam::in_use))]
    AddressInUse {
        /// The address.
        address: String,
    },

    /// Address lies outside the network.
    #[error("Address {address} is not in subnet {subnet}")]
    #[diagnostic(code(berth::ipam::out_of_range))]
    AddressOutOfRange {
        /// The address.
        address: String,
        /// The network it was requested from.
        subnet: String,
    },

    /// Requested address could not be parsed.
    #[error("Invalid requested address: {value}")]
    #[diagnostic(code(berth::endpoint::invalid_address))]
    InvalidRequestedAddress {
        /// The raw value.
        value: String,
    },

    /// Requested MAC address could not be parsed.
    #[error("Invalid requested MAC address: {value}")]
    #[diagnostic(
        code(berth::endpoint::invalid_mac),
        help("Use six colon-separated hex octets, e.g. 02:42:ac:11:00:02")
    )]
    InvalidRequestedMac {
        /// The raw value.
        value: String,
    },

    /// Driver holds no allocation for the endpoint.
    #[error("No network information to release for endpoint '{id}'")]
    #[diagnostic(code(berth::endpoint::unknown))]
    EndpointUnknown {
        /// The endpoint ID.
        id: String,
    },

    /// Remote plugin call failed.
    #[error("Plugin call failed: {message}")]
    #[diagnostic(code(berth::plugin::transport))]
    Transport {
        /// The transport or plugin error, verbatim.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(berth::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(berth::serialization))]
    Serialization(String),

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(berth::unsupported))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(berth::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (host command failure and the like).
    #[error("Internal error: {message}")]
    #[diagnostic(code(berth::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl BerthError {
    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkNotFound { .. }
            | Self::ContainerNotFound { .. }
            | Self::EndpointNotFound { .. }
            | Self::DriverNotFound { .. }
            | Self::EndpointUnknown { .. } => ErrorKind::NotFound,
            Self::NameConflict { .. }
            | Self::ContainerRunning { .. }
            | Self::NetworkInUse { .. }
            | Self::AddressInUse { .. }
            | Self::SubnetOverlap { .. } => ErrorKind::Conflict,
            Self::BridgeConfigMismatch { .. } | Self::IPv6NotConfigured { .. } => {
                ErrorKind::ConfigMismatch
            }
            Self::NoFreeAddressRange | Self::NoFreeBridgeName | Self::AddressExhausted { .. } => {
                ErrorKind::ResourceExhausted
            }
            Self::Transport { .. } => ErrorKind::TransportFailure,
            Self::InvalidRequestedAddress { .. }
            | Self::InvalidRequestedMac { .. }
            | Self::AddressOutOfRange { .. }
            | Self::Config { .. } => ErrorKind::InvalidInput,
            Self::Io(_) | Self::Serialization(_) | Self::Unsupported { .. } | Self::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Shorthand for an [`BerthError::Internal`] error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for BerthError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

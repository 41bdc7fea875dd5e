//! Container side of endpoint attachment.

use serde::{Deserialize, Serialize};

use crate::model::{Endpoint, NetworkInterface};

/// An endpoint held by a container, with the interface its driver returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedEndpoint {
    /// The endpoint.
    pub endpoint: Endpoint,
    /// Interface descriptor from `plug`.
    pub interface: NetworkInterface,
}

/// Networking view of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerNetworks {
    /// Container ID.
    pub id: String,
    /// Whether the container is running; attachments are frozen while it is.
    pub running: bool,
    /// Endpoints in attachment order.
    pub endpoints: Vec<AttachedEndpoint>,
}

impl ContainerNetworks {
    /// A stopped container with no endpoints.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Position of an endpoint in the list.
    #[must_use]
    pub fn position(&self, endpoint_id: &str) -> Option<usize> {
        self.endpoints
            .iter()
            .position(|attached| attached.endpoint.id == endpoint_id)
    }

    /// Number of endpoints on `network_id`.
    #[must_use]
    pub fn endpoints_on(&self, network_id: &str) -> usize {
        self.endpoints
            .iter()
            .filter(|attached| attached.endpoint.network == network_id)
            .count()
    }
}

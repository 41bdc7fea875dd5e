//! Network driver contract and the driver registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use berth_common::BerthResult;
use parking_lot::RwLock;

use crate::model::{Endpoint, Network, NetworkInterface};

/// A network backend.
///
/// Implemented by the local bridge driver and by the remote plugin adapter.
/// Every call is made while the network manager holds its lock, so
/// implementations never see two calls for the same network at once.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Create or reconcile the network.
    ///
    /// `network.state` is empty on first creation and carries the state
    /// recorded by a previous `setup` when the network is restored. The
    /// driver may write its state back into it.
    async fn setup(&self, network: &mut Network) -> BerthResult<()>;

    /// Tear the network down.
    async fn destroy(&self, network: &Network) -> BerthResult<()>;

    /// Attach an endpoint and describe the interface it gets.
    async fn plug(&self, network: &Network, endpoint: &Endpoint) -> BerthResult<NetworkInterface>;

    /// Detach an endpoint.
    async fn unplug(&self, network: &Network, endpoint: &Endpoint) -> BerthResult<()>;
}

/// Name to driver table.
///
/// Built once at process start and shared by reference with every
/// component that resolves drivers.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn NetworkDriver>>>,
}

impl DriverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, driver: Arc<dyn NetworkDriver>) {
        let name = name.into();
        if self.drivers.write().insert(name.clone(), driver).is_some() {
            tracing::debug!(driver = %name, "Replaced network driver");
        } else {
            tracing::debug!(driver = %name, "Registered network driver");
        }
    }

    /// Look up a driver by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn NetworkDriver>> {
        self.drivers.read().get(name).cloned()
    }

    /// Registered driver names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

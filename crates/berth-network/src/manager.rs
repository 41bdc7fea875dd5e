//! Network registry.
//!
//! Owns every network record and every container's endpoint list. All
//! operations run under a single async lock that stays held across driver
//! calls, so networking changes are strictly ordered process-wide.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use berth_common::{BerthError, BerthResult, random_name};
use tokio::sync::Mutex;

use crate::container::{AttachedEndpoint, ContainerNetworks};
use crate::driver::{DriverRegistry, NetworkDriver};
use crate::model::{Endpoint, Labels, Network, NetworkSummary};
use crate::store::NetworkStore;

/// Attempts at generating an unused network name.
const MAX_NAME_ATTEMPTS: usize = 64;

#[derive(Debug, Default)]
struct RegistryState {
    /// Live networks by ID.
    networks: BTreeMap<String, Network>,
    /// Known containers by ID.
    containers: HashMap<String, ContainerNetworks>,
}

/// Exact ID first, then exact name.
fn resolve<'a>(networks: &'a BTreeMap<String, Network>, name_or_id: &str) -> Option<&'a Network> {
    networks
        .get(name_or_id)
        .or_else(|| networks.values().find(|n| n.name == name_or_id))
}

fn name_taken(networks: &BTreeMap<String, Network>, name: &str) -> bool {
    networks.values().any(|n| n.name == name)
}

/// Registry of networks and container attachments.
pub struct NetworkManager {
    drivers: Arc<DriverRegistry>,
    store: NetworkStore,
    state: Mutex<RegistryState>,
}

impl NetworkManager {
    /// Create an empty registry persisting to `store`.
    #[must_use]
    pub fn new(drivers: Arc<DriverRegistry>, store: NetworkStore) -> Self {
        Self {
            drivers,
            store,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// The driver registry networks are resolved against.
    #[must_use]
    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    fn driver(&self, name: &str) -> BerthResult<Arc<dyn NetworkDriver>> {
        self.drivers
            .get(name)
            .ok_or_else(|| BerthError::DriverNotFound {
                name: name.to_string(),
            })
    }

    /// Create a network and return its ID.
    ///
    /// An empty `name` is replaced by a generated one. The record is
    /// persisted only after the driver has set the network up.
    pub async fn create(&self, name: &str, driver_name: &str, labels: Labels) -> BerthResult<String> {
        let mut state = self.state.lock().await;

        let name = if name.is_empty() {
            generate_name(&state.networks)?
        } else {
            name.to_string()
        };

        if name_taken(&state.networks, &name) {
            return Err(BerthError::NameConflict { name });
        }

        let driver = self.driver(driver_name)?;
        let mut network = Network::new(name, driver_name, labels);

        driver.setup(&mut network).await?;

        if let Err(e) = self.store.save(&network) {
            tracing::warn!(
                network_id = %network.id,
                error = %e,
                "Failed to persist network, rolling back"
            );
            if let Err(destroy_err) = driver.destroy(&network).await {
                tracing::warn!(network_id = %network.id, error = %destroy_err, "Rollback failed");
            }
            return Err(e);
        }

        tracing::info!(
            network_id = %network.id,
            name = %network.name,
            driver = %network.driver,
            "Created network"
        );

        let id = network.id.clone();
        state.networks.insert(id.clone(), network);
        Ok(id)
    }

    /// Summaries of all live networks, ordered by name.
    pub async fn list(&self) -> Vec<NetworkSummary> {
        let state = self.state.lock().await;
        let mut summaries: Vec<NetworkSummary> =
            state.networks.values().map(Network::summary).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// Look a network up by ID, then by name.
    pub async fn get(&self, name_or_id: &str) -> Option<Network> {
        let state = self.state.lock().await;
        resolve(&state.networks, name_or_id).cloned()
    }

    /// Destroy a network and delete its record.
    ///
    /// Refused while any container still holds an endpoint on it.
    pub async fn destroy(&self, name_or_id: &str) -> BerthResult<()> {
        let mut state = self.state.lock().await;

        let network = resolve(&state.networks, name_or_id).ok_or_else(|| {
            BerthError::NetworkNotFound {
                name: name_or_id.to_string(),
            }
        })?;

        let attached: usize = state
            .containers
            .values()
            .map(|c| c.endpoints_on(&network.id))
            .sum();
        if attached > 0 {
            return Err(BerthError::NetworkInUse {
                name: network.name.clone(),
                endpoints: attached,
            });
        }

        self.driver(&network.driver)?.destroy(network).await?;

        let id = network.id.clone();
        let removed = state.networks.remove(&id);
        self.store.remove(&id).inspect_err(|e| {
            tracing::error!(network_id = %id, error = %e, "Failed to delete network record");
        })?;
        if let Some(network) = removed {
            tracing::info!(network_id = %id, name = %network.name, "Destroyed network");
        }
        Ok(())
    }

    /// Load every persisted record and set its network up again.
    ///
    /// Stops at the first record that cannot be decoded, names a missing
    /// driver, or fails to reconcile. On failure the networks already set
    /// up are torn down again and none are registered. Returns the number of
    /// networks loaded.
    pub async fn restore(&self) -> BerthResult<usize> {
        let mut state = self.state.lock().await;
        tracing::info!(dir = %self.store.dir().display(), "Loading networks");

        let mut restored = Vec::new();
        if let Err(e) = self.load_all(&mut restored).await {
            self.tear_down(&restored).await;
            return Err(e);
        }

        let count = restored.len();
        for network in restored {
            tracing::info!(network_id = %network.id, name = %network.name, "Loaded network");
            state.networks.insert(network.id.clone(), network);
        }
        Ok(count)
    }

    /// Set up every persisted record, collecting the ones that succeed.
    async fn load_all(&self, restored: &mut Vec<Network>) -> BerthResult<()> {
        for id in self.store.list()? {
            let mut network = self.store.load(&id).inspect_err(|e| {
                tracing::error!(network_id = %id, error = %e, "Failed to load network");
            })?;

            let driver = self.driver(&network.driver)?;
            driver.setup(&mut network).await.inspect_err(|e| {
                tracing::error!(network_id = %id, error = %e, "Failed to set up network");
            })?;

            // Drivers may have refreshed their state.
            let saved = self.store.save(&network);
            restored.push(network);
            saved?;
        }
        Ok(())
    }

    async fn tear_down<'a, I>(&self, networks: I)
    where
        I: IntoIterator<Item = &'a Network>,
    {
        for network in networks {
            let result = match self.driver(&network.driver) {
                Ok(driver) => driver.destroy(network).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(network_id = %network.id, error = %e, "Failed to tear down network");
            }
        }
    }

    /// Tear every network down for process exit. Records are kept.
    pub async fn shutdown(&self) {
        let state = self.state.lock().await;
        self.tear_down(state.networks.values()).await;
        tracing::info!(count = state.networks.len(), "Networks shut down");
    }

    /// Start tracking a container. Tracking an existing one is a no-op.
    pub async fn register_container(&self, id: &str) {
        let mut state = self.state.lock().await;
        state
            .containers
            .entry(id.to_string())
            .or_insert_with(|| ContainerNetworks::new(id));
    }

    /// Record whether a container is running.
    pub async fn set_container_running(&self, id: &str, running: bool) -> BerthResult<()> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| BerthError::ContainerNotFound { id: id.to_string() })?;
        container.running = running;
        Ok(())
    }

    /// A container's endpoints in attachment order.
    pub async fn container_endpoints(&self, id: &str) -> BerthResult<Vec<AttachedEndpoint>> {
        let state = self.state.lock().await;
        state
            .containers
            .get(id)
            .map(|c| c.endpoints.clone())
            .ok_or_else(|| BerthError::ContainerNotFound { id: id.to_string() })
    }

    /// Stop tracking a container, unplugging its endpoints best-effort.
    pub async fn remove_container(&self, id: &str) -> BerthResult<()> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .remove(id)
            .ok_or_else(|| BerthError::ContainerNotFound { id: id.to_string() })?;

        for attached in &container.endpoints {
            let endpoint = &attached.endpoint;
            let result = match state.networks.get(&endpoint.network) {
                Some(network) => match self.driver(&network.driver) {
                    Ok(driver) => driver.unplug(network, endpoint).await,
                    Err(e) => Err(e),
                },
                None => Err(BerthError::NetworkNotFound {
                    name: endpoint.network.clone(),
                }),
            };
            if let Err(e) = result {
                tracing::warn!(
                    container_id = %id,
                    endpoint_id = %endpoint.id,
                    error = %e,
                    "Failed to unplug endpoint"
                );
            }
        }

        Ok(())
    }

    /// Attach a stopped container to a network and return the endpoint ID.
    pub async fn plug(
        &self,
        container_id: &str,
        name_or_id: &str,
        labels: Labels,
    ) -> BerthResult<String> {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| BerthError::ContainerNotFound {
                id: container_id.to_string(),
            })?;
        if container.running {
            return Err(BerthError::ContainerRunning {
                id: container_id.to_string(),
            });
        }

        let network = resolve(&state.networks, name_or_id).ok_or_else(|| {
            BerthError::NetworkNotFound {
                name: name_or_id.to_string(),
            }
        })?;
        let driver = self.driver(&network.driver)?;

        let endpoint = Endpoint::new(network.id.clone(), labels);
        let interface = driver.plug(network, &endpoint).await?;

        tracing::info!(
            container_id,
            network_id = %network.id,
            endpoint_id = %endpoint.id,
            ip = %interface.ip_address,
            "Plugged container"
        );

        let id = endpoint.id.clone();
        if let Some(container) = state.containers.get_mut(container_id) {
            container.endpoints.push(AttachedEndpoint {
                endpoint,
                interface,
            });
        }
        Ok(id)
    }

    /// Detach an endpoint from a stopped container.
    pub async fn unplug(&self, container_id: &str, endpoint_id: &str) -> BerthResult<()> {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| BerthError::ContainerNotFound {
                id: container_id.to_string(),
            })?;
        if container.running {
            return Err(BerthError::ContainerRunning {
                id: container_id.to_string(),
            });
        }

        let index = container
            .position(endpoint_id)
            .ok_or_else(|| BerthError::EndpointNotFound {
                id: endpoint_id.to_string(),
            })?;
        let endpoint = &container.endpoints[index].endpoint;

        let network = state.networks.get(&endpoint.network).ok_or_else(|| {
            BerthError::NetworkNotFound {
                name: endpoint.network.clone(),
            }
        })?;
        self.driver(&network.driver)?.unplug(network, endpoint).await?;

        tracing::info!(container_id, endpoint_id, "Unplugged container");

        if let Some(container) = state.containers.get_mut(container_id) {
            container.endpoints.remove(index);
        }
        Ok(())
    }
}

impl fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkManager")
            .field("drivers", &self.drivers)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

fn generate_name(networks: &BTreeMap<String, Network>) -> BerthResult<String> {
    let mut name = random_name(0);
    for retry in 1..MAX_NAME_ATTEMPTS {
        if !name_taken(networks, &name) {
            return Ok(name);
        }
        name = random_name(retry);
    }
    if name_taken(networks, &name) {
        return Err(BerthError::NameConflict { name });
    }
    Ok(name)
}

//! In-memory host, firewall and driver doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use berth_common::{BerthError, BerthResult};
use berth_network::{
    BridgeDriver, Endpoint, Firewall, HostNetwork, IpAllocator, KernelVersion, LinkAddresses,
    MacAddr, Network, NetworkDriver, NetworkInterface, Table,
};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::Mutex;

/// A link on the fake host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Link {
    pub ipv4: Option<Ipv4Net>,
    pub ipv6: Vec<Ipv6Net>,
    pub up: bool,
    pub mac: Option<MacAddr>,
}

#[derive(Debug)]
struct HostState {
    links: BTreeMap<String, Link>,
    routes: Vec<IpNet>,
    nameservers: Vec<IpAddr>,
    sysctls: BTreeMap<String, String>,
    kernel: KernelVersion,
    mutations: usize,
    drop_ipv6: bool,
    fail_forwarding: bool,
}

/// Host whose interfaces live in memory.
#[derive(Debug)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            state: Mutex::new(HostState {
                links: BTreeMap::new(),
                routes: Vec::new(),
                nameservers: Vec::new(),
                sysctls: BTreeMap::new(),
                kernel: KernelVersion {
                    major: 6,
                    minor: 1,
                    patch: 0,
                },
                mutations: 0,
                drop_ipv6: false,
                fail_forwarding: false,
            }),
        }
    }
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a bridge out-of-band.
    pub fn add_link(&self, name: &str, ipv4: &str) {
        self.state.lock().links.insert(
            name.to_string(),
            Link {
                ipv4: Some(ipv4.parse().unwrap()),
                up: true,
                ..Link::default()
            },
        );
    }

    pub fn add_host_route(&self, route: &str) {
        self.state.lock().routes.push(route.parse().unwrap());
    }

    pub fn add_nameserver(&self, ip: &str) {
        self.state.lock().nameservers.push(ip.parse().unwrap());
    }

    pub fn set_kernel(&self, major: u32, minor: u32) {
        self.state.lock().kernel = KernelVersion {
            major,
            minor,
            patch: 0,
        };
    }

    /// IPv6 address assignments are accepted but never show up.
    pub fn drop_ipv6(&self) {
        self.state.lock().drop_ipv6 = true;
    }

    /// Writes to forwarding sysctls fail.
    pub fn fail_forwarding(&self) {
        self.state.lock().fail_forwarding = true;
    }

    pub fn link(&self, name: &str) -> Option<Link> {
        self.state.lock().links.get(name).cloned()
    }

    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn host_routes(&self) -> Vec<IpNet> {
        self.state.lock().routes.clone()
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.state.lock().sysctls.get(key).cloned()
    }

    /// Number of state-changing calls made so far.
    pub fn mutations(&self) -> usize {
        self.state.lock().mutations
    }
}

impl HostNetwork for FakeHost {
    fn link_exists(&self, name: &str) -> BerthResult<bool> {
        Ok(self.state.lock().links.contains_key(name))
    }

    fn link_addresses(&self, name: &str) -> BerthResult<LinkAddresses> {
        let state = self.state.lock();
        let link = state
            .links
            .get(name)
            .ok_or_else(|| BerthError::internal(format!("no link {name}")))?;
        Ok(LinkAddresses {
            ipv4: link.ipv4,
            ipv6: link.ipv6.clone(),
        })
    }

    fn create_bridge(&self, name: &str, mac: Option<MacAddr>) -> BerthResult<()> {
        let mut state = self.state.lock();
        state.mutations += 1;
        state.links.entry(name.to_string()).or_insert(Link {
            mac,
            ..Link::default()
        });
        Ok(())
    }

    fn add_address(&self, name: &str, address: IpNet) -> BerthResult<()> {
        let mut state = self.state.lock();
        state.mutations += 1;
        let drop_ipv6 = state.drop_ipv6;
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| BerthError::internal(format!("no link {name}")))?;
        match address {
            IpNet::V4(net) => {
                if link.ipv4.is_none() {
                    link.ipv4 = Some(net);
                }
            }
            IpNet::V6(net) => {
                if !drop_ipv6 && !link.ipv6.contains(&net) {
                    link.ipv6.push(net);
                }
            }
        }
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> BerthResult<()> {
        let mut state = self.state.lock();
        state.mutations += 1;
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| BerthError::internal(format!("no link {name}")))?;
        link.up = true;
        Ok(())
    }

    fn add_route(&self, destination: IpNet, _device: &str) -> BerthResult<()> {
        let mut state = self.state.lock();
        state.mutations += 1;
        if !state.routes.contains(&destination) {
            state.routes.push(destination);
        }
        Ok(())
    }

    fn routes(&self) -> BerthResult<Vec<IpNet>> {
        Ok(self.state.lock().routes.clone())
    }

    fn nameservers(&self) -> BerthResult<Vec<IpAddr>> {
        Ok(self.state.lock().nameservers.clone())
    }

    fn kernel_version(&self) -> BerthResult<KernelVersion> {
        Ok(self.state.lock().kernel)
    }

    fn write_sysctl(&self, key: &str, value: &str) -> BerthResult<()> {
        let mut state = self.state.lock();
        if state.fail_forwarding && key.contains("forward") {
            return Err(BerthError::internal(format!("read-only {key}")));
        }
        state.mutations += 1;
        state.sysctls.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

type RuleKey = (Table, String, Vec<String>);

#[derive(Debug, Default)]
struct FirewallState {
    rules: Vec<RuleKey>,
    chains: BTreeSet<(Table, String)>,
}

/// Firewall that keeps its rules in memory and behaves like iptables on
/// duplicate chains and missing rules.
#[derive(Debug, Default)]
pub struct FakeFirewall {
    state: Mutex<FirewallState>,
}

fn key(table: Table, chain: &str, rule: &[&str]) -> RuleKey {
    (
        table,
        chain.to_string(),
        rule.iter().map(|s| (*s).to_string()).collect(),
    )
}

impl FakeFirewall {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copies of an exact rule.
    pub fn count(&self, table: Table, chain: &str, rule: &[&str]) -> usize {
        let wanted = key(table, chain, rule);
        self.state
            .lock()
            .rules
            .iter()
            .filter(|r| **r == wanted)
            .count()
    }

    /// All rules in a chain.
    pub fn rules_in(&self, table: Table, chain: &str) -> usize {
        self.state
            .lock()
            .rules
            .iter()
            .filter(|(t, c, _)| *t == table && c == chain)
            .count()
    }

    pub fn total_rules(&self) -> usize {
        self.state.lock().rules.len()
    }

    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.state
            .lock()
            .chains
            .contains(&(table, chain.to_string()))
    }

    pub fn chain_count(&self) -> usize {
        self.state.lock().chains.len()
    }
}

impl Firewall for FakeFirewall {
    fn rule_exists(&self, table: Table, chain: &str, rule: &[&str]) -> BerthResult<bool> {
        Ok(self.count(table, chain, rule) > 0)
    }

    fn insert_rule(&self, table: Table, chain: &str, rule: &[&str]) -> BerthResult<()> {
        self.state.lock().rules.insert(0, key(table, chain, rule));
        Ok(())
    }

    fn delete_rule(&self, table: Table, chain: &str, rule: &[&str]) -> BerthResult<()> {
        let wanted = key(table, chain, rule);
        let mut state = self.state.lock();
        let index = state
            .rules
            .iter()
            .position(|r| *r == wanted)
            .ok_or_else(|| BerthError::internal("Bad rule (does a matching rule exist in that chain?)"))?;
        state.rules.remove(index);
        Ok(())
    }

    fn create_chain(&self, table: Table, chain: &str) -> BerthResult<()> {
        if !self.state.lock().chains.insert((table, chain.to_string())) {
            return Err(BerthError::internal("Chain already exists"));
        }
        Ok(())
    }

    fn remove_chain(&self, table: Table, chain: &str) -> BerthResult<()> {
        let mut state = self.state.lock();
        let referenced = state
            .rules
            .iter()
            .any(|(t, _, args)| *t == table && args.last().is_some_and(|target| target == chain));
        if referenced {
            return Err(BerthError::internal("Too many links"));
        }
        state.chains.remove(&(table, chain.to_string()));
        Ok(())
    }
}

/// A bridge driver over fresh fakes, plus handles to them.
pub struct BridgeFixture {
    pub host: Arc<FakeHost>,
    pub firewall: Arc<FakeFirewall>,
    pub driver: Arc<BridgeDriver>,
}

impl BridgeFixture {
    pub fn new() -> Self {
        let host = FakeHost::new();
        let firewall = FakeFirewall::new();
        let driver = Self::driver_over(&host, &firewall);
        Self {
            host,
            firewall,
            driver,
        }
    }

    /// A new driver instance over the same host, as after a daemon restart.
    pub fn restarted(&self) -> Self {
        Self {
            host: Arc::clone(&self.host),
            firewall: Arc::clone(&self.firewall),
            driver: Self::driver_over(&self.host, &self.firewall),
        }
    }

    fn driver_over(host: &Arc<FakeHost>, firewall: &Arc<FakeFirewall>) -> Arc<BridgeDriver> {
        Arc::new(BridgeDriver::new(
            Arc::clone(host) as Arc<dyn HostNetwork>,
            Arc::clone(firewall) as Arc<dyn Firewall>,
            Arc::new(IpAllocator::new()),
        ))
    }
}

/// Wraps a driver and counts calls.
pub struct RecordingDriver {
    inner: Arc<dyn NetworkDriver>,
    pub setups: AtomicUsize,
    pub destroys: AtomicUsize,
    pub plugs: AtomicUsize,
    pub unplugs: AtomicUsize,
    pub last_setup_state: Mutex<Option<BTreeMap<String, String>>>,
}

impl RecordingDriver {
    pub fn new(inner: Arc<dyn NetworkDriver>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            setups: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
            plugs: AtomicUsize::new(0),
            unplugs: AtomicUsize::new(0),
            last_setup_state: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> (usize, usize, usize, usize) {
        (
            self.setups.load(Ordering::SeqCst),
            self.destroys.load(Ordering::SeqCst),
            self.plugs.load(Ordering::SeqCst),
            self.unplugs.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl NetworkDriver for RecordingDriver {
    async fn setup(&self, network: &mut Network) -> BerthResult<()> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        *self.last_setup_state.lock() = Some(network.state.clone());
        self.inner.setup(network).await
    }

    async fn destroy(&self, network: &Network) -> BerthResult<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.inner.destroy(network).await
    }

    async fn plug(&self, network: &Network, endpoint: &Endpoint) -> BerthResult<NetworkInterface> {
        self.plugs.fetch_add(1, Ordering::SeqCst);
        self.inner.plug(network, endpoint).await
    }

    async fn unplug(&self, network: &Network, endpoint: &Endpoint) -> BerthResult<()> {
        self.unplugs.fetch_add(1, Ordering::SeqCst);
        self.inner.unplug(network, endpoint).await
    }
}

/// Driver that accepts everything and remembers nothing.
#[derive(Debug, Default)]
pub struct NoopDriver;

#[async_trait]
impl NetworkDriver for NoopDriver {
    async fn setup(&self, _network: &mut Network) -> BerthResult<()> {
        Ok(())
    }

    async fn destroy(&self, _network: &Network) -> BerthResult<()> {
        Ok(())
    }

    async fn plug(&self, _network: &Network, _endpoint: &Endpoint) -> BerthResult<NetworkInterface> {
        Ok(NetworkInterface::default())
    }

    async fn unplug(&self, _network: &Network, _endpoint: &Endpoint) -> BerthResult<()> {
        Ok(())
    }
}

/// Labels from pairs.
pub fn labels(pairs: &[(&str, &str)]) -> berth_network::Labels {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

//! IP address management for container networks.
//!
//! Provides:
//! - The allocator contract the bridge driver consumes
//! - An in-memory allocator for IPv4 and IPv6 networks
//! - Optional sub-range reservation per network

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use berth_common::{BerthError, BerthResult};
use ipnet::IpNet;
use parking_lot::Mutex;

/// Address allocator contract.
pub trait AddressAllocator: Send + Sync {
    /// Restrict automatic allocation in `network` to the addresses of `subnet`.
    fn register_subnet(&self, network: IpNet, subnet: IpNet) -> BerthResult<()>;

    /// Hand out `requested`, or any free address when `None`.
    ///
    /// A requested address must lie inside the allocation range.
    fn request_ip(&self, network: IpNet, requested: Option<IpAddr>) -> BerthResult<IpAddr>;

    /// Take `ip` out of `network` even if it lies outside the allocation
    /// range. Reserving an address twice is a no-op.
    fn reserve_ip(&self, network: IpNet, ip: IpAddr) -> BerthResult<()>;

    /// Return an address to the pool.
    fn release_ip(&self, network: IpNet, ip: IpAddr) -> BerthResult<()>;

    /// Forget a network and every allocation in it.
    fn unregister_subnet(&self, network: IpNet) -> BerthResult<()>;
}

/// Allocation state of one network.
#[derive(Debug, Clone)]
struct AddressRange {
    /// First address eligible for automatic allocation.
    begin: u128,
    /// Last address eligible for automatic allocation.
    end: u128,
    /// Last address handed out automatically.
    last: Option<u128>,
    /// Addresses currently handed out.
    allocated: BTreeSet<u128>,
}

impl AddressRange {
    fn new(network: IpNet, subnet: IpNet) -> BerthResult<Self> {
        let (net_begin, net_end) = host_bounds(network);
        let (sub_begin, sub_end) = host_bounds(subnet);
        let begin = net_begin.max(sub_begin);
        let end = net_end.min(sub_end);

        if begin > end {
            return Err(BerthError::Config {
                message: format!("Subnet {subnet} has no usable addresses in {network}"),
            });
        }

        Ok(Self {
            begin,
            end,
            last: None,
            allocated: BTreeSet::new(),
        })
    }

    fn same_bounds(&self, other: &Self) -> bool {
        self.begin == other.begin && self.end == other.end
    }

    fn in_range(&self, value: u128) -> bool {
        (self.begin..=self.end).contains(&value)
    }

    /// Walk forward from the last handed-out address, wrapping once.
    fn next_free(&self) -> Option<u128> {
        let start = match self.last {
            Some(last) if last < self.end => last + 1,
            _ => self.begin,
        };

        (start..=self.end)
            .chain(self.begin..start)
            .find(|candidate| !self.allocated.contains(candidate))
    }
}

/// In-memory address allocator.
#[derive(Debug, Default)]
pub struct IpAllocator {
    networks: Mutex<HashMap<IpNet, AddressRange>>,
}

impl IpAllocator {
    /// Create an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of addresses currently handed out in `network`.
    #[cfg(test)]
    fn allocated_count(&self, network: IpNet) -> usize {
        self.networks
            .lock()
            .get(&network.trunc())
            .map_or(0, |range| range.allocated.len())
    }

    /// Whether `network` has been registered.
    #[cfg(test)]
    fn is_registered(&self, network: IpNet) -> bool {
        self.networks.lock().contains_key(&network.trunc())
    }
}

impl AddressAllocator for IpAllocator {
    fn register_subnet(&self, network: IpNet, subnet: IpNet) -> BerthResult<()> {
        let network = network.trunc();
        let subnet = subnet.trunc();

        if !network.contains(&subnet) {
            return Err(BerthError::Config {
                message: format!("Subnet {subnet} is not inside network {network}"),
            });
        }

        let range = AddressRange::new(network, subnet)?;
        let mut networks = self.networks.lock();

        match networks.get(&network) {
            Some(existing) if existing.same_bounds(&range) => Ok(()),
            Some(_) => Err(BerthError::Config {
                message: format!("Network {network} is already registered with a different range"),
            }),
            None => {
                tracing::debug!(%network, %subnet, "Registered allocation range");
                networks.insert(network, range);
                Ok(())
            }
        }
    }

    fn request_ip(&self, network: IpNet, requested: Option<IpAddr>) -> BerthResult<IpAddr> {
        let network = network.trunc();
        let mut networks = self.networks.lock();

        let range = range_of(&mut networks, network)?;

        if let Some(ip) = requested {
            let value = to_u128(ip);
            if !network.contains(&ip) || !range.in_range(value) {
                return Err(BerthError::AddressOutOfRange {
                    address: ip.to_string(),
                    subnet: network.to_string(),
                });
            }

            if !range.allocated.insert(value) {
                return Err(BerthError::AddressInUse {
                    address: ip.to_string(),
                });
            }

            tracing::debug!(%network, %ip, "Allocated requested address");
            return Ok(ip);
        }

        let value = range.next_free().ok_or_else(|| BerthError::AddressExhausted {
            subnet: network.to_string(),
        })?;
        range.allocated.insert(value);
        range.last = Some(value);

        let ip = from_u128(value, &network);
        tracing::debug!(%network, %ip, "Allocated address");
        Ok(ip)
    }

    fn reserve_ip(&self, network: IpNet, ip: IpAddr) -> BerthResult<()> {
        let network = network.trunc();
        if !network.contains(&ip) {
            return Err(BerthError::AddressOutOfRange {
                address: ip.to_string(),
                subnet: network.to_string(),
            });
        }

        let mut networks = self.networks.lock();
        if range_of(&mut networks, network)?.allocated.insert(to_u128(ip)) {
            tracing::debug!(%network, %ip, "Reserved address");
        }
        Ok(())
    }

    fn release_ip(&self, network: IpNet, ip: IpAddr) -> BerthResult<()> {
        let network = network.trunc();
        if let Some(range) = self.networks.lock().get_mut(&network) {
            if range.allocated.remove(&to_u128(ip)) {
                tracing::debug!(%network, %ip, "Released address");
            }
        }
        Ok(())
    }

    fn unregister_subnet(&self, network: IpNet) -> BerthResult<()> {
        let network = network.trunc();
        if self.networks.lock().remove(&network).is_some() {
            tracing::debug!(%network, "Unregistered allocation range");
        }
        Ok(())
    }
}

/// The range of `network`, spanning the whole network when never registered.
fn range_of(
    networks: &mut HashMap<IpNet, AddressRange>,
    network: IpNet,
) -> BerthResult<&mut AddressRange> {
    match networks.entry(network) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => Ok(entry.insert(AddressRange::new(network, network)?)),
    }
}

/// Usable host addresses of a network as integers.
///
/// IPv4 skips the network and broadcast addresses for prefixes shorter than
/// /31; IPv6 skips the subnet-router anycast address.
fn host_bounds(net: IpNet) -> (u128, u128) {
    let first = to_u128(net.network());
    let last = to_u128(net.broadcast());

    match net {
        IpNet::V4(v4) if v4.prefix_len() < 31 => (first + 1, last - 1),
        IpNet::V6(v6) if v6.prefix_len() < 128 => (first + 1, last),
        _ => (first, last),
    }
}

fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_u128(value: u128, network: &IpNet) -> IpAddr {
    match network {
        // Values in an IPv4 range always fit in 32 bits.
        #[allow(clippy::cast_possible_truncation)]
        IpNet::V4(_) => IpAddr::V4(Ipv4Addr::from(value as u32)),
        IpNet::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn allocates_sequentially_skipping_network_address() {
        let alloc = IpAllocator::new();
        let n = net("10.0.0.0/24");
        assert_eq!(alloc.request_ip(n, None).unwrap(), ip("10.0.0.1"));
        assert_eq!(alloc.request_ip(n, None).unwrap(), ip("10.0.0.2"));
    }

    #[test]
    fn registered_subnet_narrows_allocation() {
        let alloc = IpAllocator::new();
        let n = net("10.0.0.0/24");
        alloc.register_subnet(n, net("10.0.0.128/25")).unwrap();
        assert_eq!(alloc.request_ip(n, None).unwrap(), ip("10.0.0.129"));
    }

    #[test]
    fn register_same_range_twice_is_noop() {
        let alloc = IpAllocator::new();
        let n = net("10.0.0.0/24");
        alloc.register_subnet(n, n).unwrap();
        alloc.register_subnet(n, n).unwrap();
        assert!(alloc.register_subnet(n, net("10.0.0.0/25")).is_err());
    }

    #[test]
    fn subnet_outside_network_is_rejected() {
        let alloc = IpAllocator::new();
        let err = alloc
            .register_subnet(net("10.0.0.0/24"), net("10.0.1.0/25"))
            .unwrap_err();
        assert!(matches!(err, BerthError::Config { .. }));
    }

    #[test]
    fn specific_requests() {
        let alloc = IpAllocator::new();
        let n = net("10.0.0.0/24");
        assert_eq!(alloc.request_ip(n, Some(ip("10.0.0.7"))).unwrap(), ip("10.0.0.7"));
        assert!(matches!(
            alloc.request_ip(n, Some(ip("10.0.0.7"))),
            Err(BerthError::AddressInUse { .. })
        ));
        assert!(matches!(
            alloc.request_ip(n, Some(ip("10.0.1.7"))),
            Err(BerthError::AddressOutOfRange { .. })
        ));
    }

    #[test]
    fn requests_outside_the_range_are_refused() {
        let alloc = IpAllocator::new();
        let n = net("10.0.0.0/24");
        alloc.register_subnet(n, net("10.0.0.0/29")).unwrap();

        for outside in ["10.0.0.200", "10.0.0.255", "10.0.0.0"] {
            assert!(matches!(
                alloc.request_ip(n, Some(ip(outside))),
                Err(BerthError::AddressOutOfRange { .. })
            ));
        }
        assert_eq!(alloc.allocated_count(n), 0);
        assert_eq!(alloc.request_ip(n, Some(ip("10.0.0.6"))).unwrap(), ip("10.0.0.6"));
    }

    #[test]
    fn reserve_ignores_the_range() {
        let alloc = IpAllocator::new();
        let n = net("10.0.0.0/24");
        alloc.register_subnet(n, net("10.0.0.8/29")).unwrap();

        alloc.reserve_ip(n, ip("10.0.0.1")).unwrap();
        alloc.reserve_ip(n, ip("10.0.0.1")).unwrap();
        alloc.reserve_ip(n, ip("10.0.0.9")).unwrap();
        assert_eq!(alloc.allocated_count(n), 2);
        assert_eq!(alloc.request_ip(n, None).unwrap(), ip("10.0.0.10"));

        assert!(matches!(
            alloc.reserve_ip(n, ip("10.0.1.1")),
            Err(BerthError::AddressOutOfRange { .. })
        ));
    }

    #[test]
    fn exhaustion_and_reuse() {
        let alloc = IpAllocator::new();
        let n = net("192.168.5.0/30");
        let a = alloc.request_ip(n, None).unwrap();
        let b = alloc.request_ip(n, None).unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            alloc.request_ip(n, None),
            Err(BerthError::AddressExhausted { .. })
        ));

        alloc.release_ip(n, a).unwrap();
        assert_eq!(alloc.request_ip(n, None).unwrap(), a);
    }

    #[test]
    fn released_address_is_not_reused_while_others_are_free() {
        let alloc = IpAllocator::new();
        let n = net("10.0.0.0/24");
        let first = alloc.request_ip(n, None).unwrap();
        alloc.release_ip(n, first).unwrap();
        assert_ne!(alloc.request_ip(n, None).unwrap(), first);
    }

    #[test]
    fn ipv6_allocation() {
        let alloc = IpAllocator::new();
        let n = net("2001:db8::/64");
        alloc.register_subnet(n, n).unwrap();
        assert_eq!(alloc.request_ip(n, None).unwrap(), ip("2001:db8::1"));
    }

    #[test]
    fn unregister_drops_allocations() {
        let alloc = IpAllocator::new();
        let n = net("10.0.0.0/24");
        alloc.request_ip(n, None).unwrap();
        assert_eq!(alloc.allocated_count(n), 1);
        alloc.unregister_subnet(n).unwrap();
        assert!(!alloc.is_registered(n));
        assert_eq!(alloc.allocated_count(n), 0);
    }

    proptest! {
        #[test]
        fn automatic_allocations_are_unique(count in 1usize..200) {
            let alloc = IpAllocator::new();
            let n = net("10.9.0.0/24");
            let mut seen = std::collections::HashSet::new();
            for _ in 0..count {
                let addr = alloc.request_ip(n, None).unwrap();
                prop_assert!(n.contains(&addr));
                prop_assert!(seen.insert(addr));
            }
        }
    }
}

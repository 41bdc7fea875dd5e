//! MAC address generation and IPv6 derivation.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use berth_common::BerthError;
use ipnet::Ipv6Net;
use rand::RngCore;

/// Locally administered, unicast first octet.
pub const LOCALLY_ADMINISTERED_UNICAST: u8 = 0x02;

/// Second octet of MACs derived from container addresses.
pub const GENERATED_OUI_BYTE: u8 = 0x42;

/// A 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Derive a MAC from an IPv4 address: `02:42` followed by the four octets.
    ///
    /// The same address always yields the same MAC, so ARP caches stay valid
    /// when a container is re-created with the same IP.
    #[must_use]
    pub const fn from_ipv4(ip: Ipv4Addr) -> Self {
        let [a, b, c, d] = ip.octets();
        Self([LOCALLY_ADMINISTERED_UNICAST, GENERATED_OUI_BYTE, a, b, c, d])
    }

    /// A random unicast, locally administered MAC.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 6];
        rand::rng().fill_bytes(&mut bytes);
        bytes[0] = (bytes[0] & 0xfe) | LOCALLY_ADMINISTERED_UNICAST;
        Self(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// EUI-64 link-local IPv6 address (`fe80::/64`).
    #[must_use]
    pub fn link_local_ipv6(&self) -> Ipv6Addr {
        let [b0, b1, b2, b3, b4, b5] = self.0;
        Ipv6Addr::from([
            0xfe, 0x80, 0, 0, 0, 0, 0, 0, b0 ^ 0x02, b1, b2, 0xff, 0xfe, b3, b4, b5,
        ])
    }

    /// Place the MAC in the low 48 bits of `net`'s prefix.
    #[must_use]
    pub fn embed_in(&self, net: Ipv6Net) -> Ipv6Addr {
        let mut bytes = net.network().octets();
        bytes[10..].copy_from_slice(&self.0);
        Ipv6Addr::from(bytes)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddr {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BerthError::InvalidRequestedMac {
            value: s.to_string(),
        };

        let mut bytes = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in &mut bytes {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

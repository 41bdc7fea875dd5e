//! Host networking primitives.
//!
//! The bridge driver reaches the kernel only through [`HostNetwork`], so
//! reconciliation can be exercised against an in-memory host in tests.
//! [`IpCommandHost`] is the production implementation built on the `ip`
//! command and `/proc/sys`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{Command, Output};

use berth_common::{BerthError, BerthResult};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::mac::MacAddr;

/// Addresses currently assigned to a link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkAddresses {
    /// Primary IPv4 address with its prefix.
    pub ipv4: Option<Ipv4Net>,
    /// All IPv6 addresses, any scope.
    pub ipv6: Vec<Ipv6Net>,
}

/// Running kernel version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch level.
    pub patch: u32,
}

impl KernelVersion {
    /// Parse a release string such as `6.1.0-18-amd64`.
    #[must_use]
    pub fn parse(release: &str) -> Option<Self> {
        let base = release.trim().split(['-', '+', '_']).next()?;
        let mut parts = base.split('.').map(str::parse::<u32>);

        let major = parts.next()?.ok()?;
        let minor = parts.next().unwrap_or(Ok(0)).ok()?;
        let patch = parts.next().unwrap_or(Ok(0)).unwrap_or(0);

        Some(Self {
            major,
            minor,
            patch,
        })
    }

    /// Whether `ip link add ... type bridge` accepts an explicit MAC (3.3+).
    #[must_use]
    pub fn supports_bridge_mac(&self) -> bool {
        (self.major, self.minor) >= (3, 3)
    }
}

/// Extract `nameserver` entries from resolv.conf content.
#[must_use]
pub fn parse_nameservers(content: &str) -> Vec<IpAddr> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.split(['#', ';']).next()?;
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => fields.next()?.parse().ok(),
                _ => None,
            }
        })
        .collect()
}

/// Host interface and kernel operations the bridge driver needs.
pub trait HostNetwork: Send + Sync {
    /// Whether a link with this name exists.
    fn link_exists(&self, name: &str) -> BerthResult<bool>;

    /// Addresses assigned to a link.
    fn link_addresses(&self, name: &str) -> BerthResult<LinkAddresses>;

    /// Create a bridge, optionally with a fixed MAC.
    fn create_bridge(&self, name: &str, mac: Option<MacAddr>) -> BerthResult<()>;

    /// Assign an address. Already-present addresses are accepted.
    fn add_address(&self, name: &str, address: IpNet) -> BerthResult<()>;

    /// Set a link administratively up.
    fn set_link_up(&self, name: &str) -> BerthResult<()>;

    /// Route `destination` via the link. Existing routes are accepted.
    fn add_route(&self, destination: IpNet, device: &str) -> BerthResult<()>;

    /// Destinations of the host routing table, default routes excluded.
    fn routes(&self) -> BerthResult<Vec<IpNet>>;

    /// Configured DNS servers.
    fn nameservers(&self) -> BerthResult<Vec<IpAddr>>;

    /// Running kernel version.
    fn kernel_version(&self) -> BerthResult<KernelVersion>;

    /// Write a value under `/proc/sys`, e.g. `net/ipv4/ip_forward`.
    fn write_sysctl(&self, key: &str, value: &str) -> BerthResult<()>;
}

/// [`HostNetwork`] backed by the `ip` command.
#[derive(Debug, Clone)]
pub struct IpCommandHost {
    ip_binary: String,
    proc_sys: PathBuf,
    resolv_conf: PathBuf,
}

impl Default for IpCommandHost {
    fn default() -> Self {
        Self {
            ip_binary: "ip".to_string(),
            proc_sys: PathBuf::from("/proc/sys"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
        }
    }
}

impl IpCommandHost {
    /// Host backend using the system `ip`, `/proc/sys` and `/etc/resolv.conf`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different resolv.conf.
    #[must_use]
    pub fn with_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = path.into();
        self
    }

    fn run(&self, args: &[&str]) -> BerthResult<Output> {
        Command::new(&self.ip_binary)
            .args(args)
            .output()
            .map_err(|e| BerthError::Internal {
                message: format!("Failed to execute ip {}: {}", args.join(" "), e),
            })
    }

    /// Run `ip`, treating "File exists" as success.
    fn run_idempotent(&self, args: &[&str], what: &str) -> BerthResult<()> {
        let output = self.run(args)?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("exists") {
            tracing::debug!(args = ?args, "{what}: already present");
            return Ok(());
        }

        Err(BerthError::Internal {
            message: format!("Failed to {what}: {}", stderr.trim()),
        })
    }

    fn list_routes(&self, family: &str) -> BerthResult<Vec<IpNet>> {
        let output = self.run(&[family, "-o", "route", "show"])?;
        if !output.status.success() {
            return Err(BerthError::Internal {
                message: format!(
                    "Failed to list routes: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(parse_routes(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl HostNetwork for IpCommandHost {
    fn link_exists(&self, name: &str) -> BerthResult<bool> {
        Ok(self.run(&["link", "show", name])?.status.success())
    }

    fn link_addresses(&self, name: &str) -> BerthResult<LinkAddresses> {
        let output = self.run(&["-o", "addr", "show", "dev", name])?;
        if !output.status.success() {
            return Err(BerthError::Internal {
                message: format!(
                    "Failed to read addresses of '{}': {}",
                    name,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(parse_addresses(&String::from_utf8_lossy(&output.stdout)))
    }

    fn create_bridge(&self, name: &str, mac: Option<MacAddr>) -> BerthResult<()> {
        tracing::debug!(name, mac = ?mac.map(|m| m.to_string()), "Creating bridge");

        let mac = mac.map(|m| m.to_string());
        let mut args = vec!["link", "add", "name", name];
        if let Some(mac) = mac.as_deref() {
            args.extend(["address", mac]);
        }
        args.extend(["type", "bridge"]);

        let output = self.run(&args)?;
        if !output.status.success() && !self.link_exists(name)? {
            return Err(BerthError::Internal {
                message: format!(
                    "Failed to create bridge '{}': {}",
                    name,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        tracing::info!(name, "Bridge created");
        Ok(())
    }

    fn add_address(&self, name: &str, address: IpNet) -> BerthResult<()> {
        tracing::debug!(name, %address, "Assigning address");
        let cidr = address.to_string();
        let family = if address.addr().is_ipv4() { "-4" } else { "-6" };
        self.run_idempotent(
            &[family, "addr", "add", &cidr, "dev", name],
            "assign address",
        )
    }

    fn set_link_up(&self, name: &str) -> BerthResult<()> {
        tracing::debug!(name, "Bringing link up");
        let output = self.run(&["link", "set", name, "up"])?;
        if !output.status.success() {
            return Err(BerthError::Internal {
                message: format!("Failed to bring up link '{name}'"),
            });
        }
        Ok(())
    }

    fn add_route(&self, destination: IpNet, device: &str) -> BerthResult<()> {
        tracing::debug!(%destination, device, "Adding route");
        let dest = destination.to_string();
        let family = if destination.addr().is_ipv4() { "-4" } else { "-6" };
        self.run_idempotent(
            &[family, "route", "add", &dest, "dev", device],
            "add route",
        )
    }

    fn routes(&self) -> BerthResult<Vec<IpNet>> {
        let mut routes = self.list_routes("-4")?;
        routes.extend(self.list_routes("-6")?);
        Ok(routes)
    }

    fn nameservers(&self) -> BerthResult<Vec<IpAddr>> {
        match std::fs::read_to_string(&self.resolv_conf) {
            Ok(content) => Ok(parse_nameservers(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn kernel_version(&self) -> BerthResult<KernelVersion> {
        let release = std::fs::read_to_string(self.proc_sys.join("kernel/osrelease"))?;
        KernelVersion::parse(&release).ok_or_else(|| BerthError::Internal {
            message: format!("Unrecognized kernel release '{}'", release.trim()),
        })
    }

    fn write_sysctl(&self, key: &str, value: &str) -> BerthResult<()> {
        let path = self.proc_sys.join(key);
        std::fs::write(&path, value).map_err(|e| BerthError::Internal {
            message: format!("Failed to write {}: {}", path.display(), e),
        })?;
        tracing::debug!(key, value, "Sysctl written");
        Ok(())
    }
}

/// Parse `ip -o addr show` output.
fn parse_addresses(output: &str) -> LinkAddresses {
    let mut addrs = LinkAddresses::default();

    for line in output.lines() {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            match field {
                "inet" if addrs.ipv4.is_none() => {
                    addrs.ipv4 = fields.next().and_then(|v| v.parse().ok());
                }
                "inet6" => {
                    if let Some(net) = fields.next().and_then(|v| v.parse().ok()) {
                        addrs.ipv6.push(net);
                    }
                }
                _ => {}
            }
        }
    }

    addrs
}

/// Parse `ip -o route show` output into destinations.
fn parse_routes(output: &str) -> Vec<IpNet> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let mut dest = fields.next()?;
            // Route types such as "unreachable" or "local" precede the prefix.
            if matches!(
                dest,
                "unicast"
                    | "local"
                    | "broadcast"
                    | "unreachable"
                    | "blackhole"
                    | "prohibit"
                    | "multicast"
                    | "anycast"
            ) {
                dest = fields.next()?;
            }
            if dest == "default" {
                return None;
            }
            dest.parse::<IpNet>()
                .ok()
                .or_else(|| dest.parse::<IpAddr>().ok().map(IpNet::from))
        })
        .collect()
}

//! Daemon configuration file.

use std::collections::HashSet;
use std::path::Path;

use berth_common::{BerthError, BerthResult};
use berth_network::PluginProtocol;
use serde::{Deserialize, Serialize};

/// Top-level `berthd` configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Built-in bridge driver settings.
    pub bridge: BridgeSection,
    /// Remote network plugins to register.
    pub plugins: Vec<PluginConfig>,
}

/// `[bridge]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeSection {
    /// Name the bridge driver is registered under.
    pub driver_name: String,
    /// iptables binary used for firewall rules.
    pub iptables: String,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            driver_name: "bridge".to_string(),
            iptables: "iptables".to_string(),
        }
    }
}

/// One `[[plugins]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    /// Driver name networks refer to.
    pub name: String,
    /// Base URL of the plugin endpoint.
    pub url: String,
    /// Wire protocol.
    #[serde(default)]
    pub protocol: PluginProtocol,
}

impl DaemonConfig {
    /// Load the configuration at `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> BerthResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path).map_err(|e| BerthError::Config {
            message: format!("Failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML.
    pub fn from_toml(content: &str) -> BerthResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| BerthError::Config {
            message: format!("Failed to parse TOML: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Driver names must be non-empty and unique.
    pub fn validate(&self) -> BerthResult<()> {
        let mut names = HashSet::new();
        let all = std::iter::once(self.bridge.driver_name.as_str())
            .chain(self.plugins.iter().map(|p| p.name.as_str()));

        for name in all {
            if name.is_empty() {
                return Err(BerthError::Config {
                    message: "Driver names must not be empty".to_string(),
                });
            }
            if !names.insert(name) {
                return Err(BerthError::Config {
                    message: format!("Driver '{name}' is declared more than once"),
                });
            }
        }

        if let Some(plugin) = self.plugins.iter().find(|p| p.url.is_empty()) {
            return Err(BerthError::Config {
                message: format!("Plugin '{}' has no url", plugin.name),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.bridge.driver_name, "bridge");
        assert_eq!(config.bridge.iptables, "iptables");
    }

    #[test]
    fn plugins_and_protocols() {
        let config = DaemonConfig::from_toml(
            r#"
            [bridge]
            iptables = "/usr/sbin/iptables-legacy"

            [[plugins]]
            name = "weave"
            url = "http://127.0.0.1:6783/net"

            [[plugins]]
            name = "lib"
            url = "http://127.0.0.1:9000"
            protocol = "network-library"
            "#,
        )
        .unwrap();

        assert_eq!(config.bridge.driver_name, "bridge");
        assert_eq!(config.bridge.iptables, "/usr/sbin/iptables-legacy");
        assert_eq!(config.plugins.len(), 2);
        assert_eq!(config.plugins[0].protocol, PluginProtocol::Legacy);
        assert_eq!(config.plugins[1].protocol, PluginProtocol::NetworkLibrary);
    }

    #[test]
    fn duplicate_driver_names_rejected() {
        let err = DaemonConfig::from_toml(
            r#"
            [[plugins]]
            name = "bridge"
            url = "http://127.0.0.1:1"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, BerthError::Config { .. }));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(DaemonConfig::from_toml("[bridge]\nmtu = 1500\n").is_err());
        assert!(
            DaemonConfig::from_toml("[[plugins]]\nname = \"x\"\nurl = \"u\"\nprotocol = \"grpc\"\n")
                .is_err()
        );
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berthd.toml");
        std::fs::write(&path, "[bridge]\ndriver_name = \"local\"\n").unwrap();

        let config = DaemonConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.bridge.driver_name, "local");

        assert_eq!(DaemonConfig::load(None).unwrap(), DaemonConfig::default());
        let missing = dir.path().join("missing.toml");
        assert!(DaemonConfig::load(Some(missing.as_path())).is_err());
    }
}

//! Out-of-process network drivers.
//!
//! A [`RemoteDriver`] forwards each driver call to a plugin over a
//! [`PluginTransport`]. Two wire protocols are spoken: the legacy network
//! driver protocol and the network-library protocol.

use std::time::Duration;

use async_trait::async_trait;
use berth_common::{BerthError, BerthResult};
use bytes::Bytes;
use ipnet::IpNet;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};

use crate::driver::NetworkDriver;
use crate::model::{Endpoint, Network, NetworkInterface};

/// I/O timeout for plugin calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire protocol a plugin speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginProtocol {
    /// `POST` to create, endpoint descriptor returned verbatim.
    #[default]
    Legacy,
    /// `PUT` to create, endpoint returned as sandbox info.
    NetworkLibrary,
}

/// Request/response channel to a plugin.
#[async_trait]
pub trait PluginTransport: Send + Sync {
    /// Perform one call and return the full response body.
    ///
    /// A non-success status must surface as an error.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> BerthResult<Bytes>;
}

/// HTTP transport to a plugin endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    /// Transport to the plugin at `base_url`.
    pub fn new(base_url: impl Into<String>) -> BerthResult<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Transport with a custom I/O timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> BerthResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BerthError::Transport {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// URL for a plugin path.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl PluginTransport for HttpTransport {
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> BerthResult<Bytes> {
        let url = self.url(path);
        tracing::debug!(%method, url = %url, "Calling plugin");

        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| BerthError::Transport {
            message: format!("{method} {url}: {e}"),
        })?;

        let status = response.status();
        // Drain the body on every path so the connection is released.
        let bytes = response.bytes().await.map_err(|e| BerthError::Transport {
            message: format!("{method} {url}: failed to read response: {e}"),
        })?;

        if !status.is_success() {
            return Err(BerthError::Transport {
                message: format!(
                    "{method} {url}: {status}: {}",
                    String::from_utf8_lossy(&bytes).trim()
                ),
            });
        }

        Ok(bytes)
    }
}

/// One interface of a network-library sandbox.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SandboxInterface {
    src_name: String,
    dst_name: String,
    address: String,
    #[serde(rename = "MACAddress")]
    mac_address: String,
}

/// Endpoint reply of the network-library protocol.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SandboxInfo {
    interfaces: Vec<SandboxInterface>,
    gateway: Option<String>,
    #[serde(rename = "GatewayIPv6")]
    gateway_ipv6: Option<String>,
}

impl SandboxInfo {
    fn into_interface(self) -> BerthResult<NetworkInterface> {
        let first = self
            .interfaces
            .into_iter()
            .next()
            .ok_or_else(|| BerthError::Transport {
                message: "plugin returned no interfaces".to_string(),
            })?;

        let address: IpNet = first.address.parse().map_err(|_| BerthError::Transport {
            message: format!("plugin returned invalid address '{}'", first.address),
        })?;

        tracing::debug!(
            src = %first.src_name,
            dst = %first.dst_name,
            address = %address,
            "Plugin sandbox interface"
        );

        let mut iface = NetworkInterface {
            gateway: self.gateway.unwrap_or_default(),
            mac_address: first.mac_address,
            ipv6_gateway: self.gateway_ipv6.unwrap_or_default(),
            ..NetworkInterface::default()
        };
        match address {
            IpNet::V4(net) => {
                iface.ip_address = net.addr().to_string();
                iface.ip_prefix_len = net.prefix_len();
            }
            IpNet::V6(net) => {
                iface.global_ipv6 = net.addr().to_string();
                iface.global_ipv6_prefix_len = net.prefix_len();
            }
        }
        Ok(iface)
    }
}

/// [`NetworkDriver`] implemented by a plugin process.
pub struct RemoteDriver<T> {
    name: String,
    protocol: PluginProtocol,
    transport: T,
}

impl<T: PluginTransport> RemoteDriver<T> {
    /// Adapter for the plugin registered as `name`.
    pub fn new(name: impl Into<String>, protocol: PluginProtocol, transport: T) -> Self {
        Self {
            name: name.into(),
            protocol,
            transport,
        }
    }

    /// Registered plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Protocol spoken to the plugin.
    #[must_use]
    pub const fn protocol(&self) -> PluginProtocol {
        self.protocol
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> BerthResult<Bytes> {
        self.transport
            .call(method, path, body)
            .await
            .inspect_err(|e| {
                tracing::warn!(plugin = %self.name, path, error = %e, "Driver returned error");
            })
    }
}

impl<T> std::fmt::Debug for RemoteDriver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDriver")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: PluginTransport> NetworkDriver for RemoteDriver<T> {
    async fn setup(&self, network: &mut Network) -> BerthResult<()> {
        let body = serde_json::to_value(&*network)?;
        match self.protocol {
            PluginProtocol::Legacy => self.call(Method::POST, "", Some(body)).await?,
            PluginProtocol::NetworkLibrary => {
                self.call(Method::PUT, &network.id, Some(body)).await?
            }
        };
        Ok(())
    }

    async fn destroy(&self, network: &Network) -> BerthResult<()> {
        self.call(Method::DELETE, &network.id, None).await?;
        Ok(())
    }

    async fn plug(&self, network: &Network, endpoint: &Endpoint) -> BerthResult<NetworkInterface> {
        let body = Some(serde_json::to_value(endpoint)?);

        match self.protocol {
            PluginProtocol::Legacy => {
                let path = format!("{}/", network.id);
                let reply = self.call(Method::POST, &path, body).await?;
                serde_json::from_slice(&reply).map_err(|e| {
                    tracing::warn!(plugin = %self.name, error = %e, "Driver returned invalid JSON");
                    BerthError::Serialization(format!("plugin {} interface: {e}", self.name))
                })
            }
            PluginProtocol::NetworkLibrary => {
                let path = format!("{}/{}", network.id, endpoint.id);
                let reply = self.call(Method::PUT, &path, body).await?;
                let sandbox: SandboxInfo = serde_json::from_slice(&reply).map_err(|e| {
                    tracing::warn!(plugin = %self.name, error = %e, "Driver returned invalid JSON");
                    BerthError::Serialization(format!("plugin {} sandbox: {e}", self.name))
                })?;
                sandbox.into_interface()
            }
        }
    }

    async fn unplug(&self, network: &Network, endpoint: &Endpoint) -> BerthResult<()> {
        let path = format!("{}/{}", network.id, endpoint.id);
        self.call(Method::DELETE, &path, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Labels;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeTransport {
        calls: Mutex<Vec<(Method, String, Option<serde_json::Value>)>>,
        reply: Mutex<Option<BerthResult<Bytes>>>,
    }

    impl FakeTransport {
        fn replying(body: &str) -> Self {
            let fake = Self::default();
            *fake.reply.lock() = Some(Ok(Bytes::from(body.to_string())));
            fake
        }

        fn failing(message: &str) -> Self {
            let fake = Self::default();
            *fake.reply.lock() = Some(Err(BerthError::Transport {
                message: message.to_string(),
            }));
            fake
        }
    }

    #[async_trait]
    impl PluginTransport for FakeTransport {
        async fn call(
            &self,
            method: Method,
            path: &str,
            body: Option<serde_json::Value>,
        ) -> BerthResult<Bytes> {
            self.calls.lock().push((method, path.to_string(), body));
            self.reply.lock().take().unwrap_or_else(|| Ok(Bytes::new()))
        }
    }

    #[tokio::test]
    async fn legacy_call_mapping() {
        let driver = RemoteDriver::new("weave", PluginProtocol::Legacy, FakeTransport::default());
        let mut network = Network::new("n", "weave", Labels::new());
        let endpoint = Endpoint::new(network.id.clone(), Labels::new());

        driver.setup(&mut network).await.unwrap();
        driver.destroy(&network).await.unwrap();
        driver.unplug(&network, &endpoint).await.unwrap();

        let calls = driver.transport.calls.lock();
        assert_eq!(calls[0].0, Method::POST);
        assert_eq!(calls[0].1, "");
        assert_eq!(calls[0].2.as_ref().unwrap()["Name"], "n");
        assert_eq!(calls[1].0, Method::DELETE);
        assert_eq!(calls[1].1, network.id);
        assert!(calls[1].2.is_none());
        assert_eq!(calls[2].1, format!("{}/{}", network.id, endpoint.id));
    }

    #[tokio::test]
    async fn legacy_plug_decodes_interface() {
        let reply = r#"{"Gateway":"10.1.0.1","IPAddress":"10.1.0.5","IPPrefixLen":24,"MacAddress":"02:42:0a:01:00:05","Bridge":"weave"}"#;
        let driver = RemoteDriver::new("weave", PluginProtocol::Legacy, FakeTransport::replying(reply));
        let network = Network::new("n", "weave", Labels::new());
        let endpoint = Endpoint::new(network.id.clone(), Labels::new());

        let iface = driver.plug(&network, &endpoint).await.unwrap();
        assert_eq!(iface.ip_address, "10.1.0.5");
        assert_eq!(iface.ip_prefix_len, 24);
        assert_eq!(iface.bridge, "weave");

        let calls = driver.transport.calls.lock();
        assert_eq!(calls[0].0, Method::POST);
        assert_eq!(calls[0].1, format!("{}/", network.id));
        assert_eq!(calls[0].2.as_ref().unwrap()["ID"], endpoint.id.as_str());
    }

    #[tokio::test]
    async fn network_library_plug_converts_sandbox() {
        let reply = r#"{"Interfaces":[{"SrcName":"veth0","DstName":"eth0","Address":"10.2.0.7/16","MACAddress":"02:42:0a:02:00:07"}],"Gateway":"10.2.0.1","GatewayIPv6":null}"#;
        let driver = RemoteDriver::new(
            "lib",
            PluginProtocol::NetworkLibrary,
            FakeTransport::replying(reply),
        );
        let network = Network::new("n", "lib", Labels::new());
        let endpoint = Endpoint::new(network.id.clone(), Labels::new());

        let iface = driver.plug(&network, &endpoint).await.unwrap();
        assert_eq!(iface.ip_address, "10.2.0.7");
        assert_eq!(iface.ip_prefix_len, 16);
        assert_eq!(iface.mac_address, "02:42:0a:02:00:07");
        assert_eq!(iface.gateway, "10.2.0.1");

        let calls = driver.transport.calls.lock();
        assert_eq!(calls[0].0, Method::PUT);
        assert_eq!(calls[0].1, format!("{}/{}", network.id, endpoint.id));
    }

    #[tokio::test]
    async fn network_library_setup_uses_put() {
        let driver = RemoteDriver::new("lib", PluginProtocol::NetworkLibrary, FakeTransport::default());
        let mut network = Network::new("n", "lib", Labels::new());
        driver.setup(&mut network).await.unwrap();

        let calls = driver.transport.calls.lock();
        assert_eq!(calls[0].0, Method::PUT);
        assert_eq!(calls[0].1, network.id);
    }

    #[tokio::test]
    async fn empty_sandbox_is_an_error() {
        let driver = RemoteDriver::new(
            "lib",
            PluginProtocol::NetworkLibrary,
            FakeTransport::replying(r#"{"Interfaces":[]}"#),
        );
        let network = Network::new("n", "lib", Labels::new());
        let endpoint = Endpoint::new(network.id.clone(), Labels::new());
        assert!(matches!(
            driver.plug(&network, &endpoint).await,
            Err(BerthError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn transport_error_is_surfaced_verbatim() {
        let driver = RemoteDriver::new("weave", PluginProtocol::Legacy, FakeTransport::failing("boom"));
        let network = Network::new("n", "weave", Labels::new());
        match driver.destroy(&network).await {
            Err(BerthError::Transport { message }) => assert_eq!(message, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(driver.transport.calls.lock().len(), 1);
    }

    #[test]
    fn protocol_names() {
        let p: PluginProtocol = serde_json::from_str(r#""network-library""#).unwrap();
        assert_eq!(p, PluginProtocol::NetworkLibrary);
        assert_eq!(PluginProtocol::default(), PluginProtocol::Legacy);
    }

    #[test]
    fn url_joining() {
        let t = HttpTransport::new("http://127.0.0.1:9000/plugin/").unwrap();
        assert_eq!(t.url(""), "http://127.0.0.1:9000/plugin/");
        assert_eq!(t.url("abc/def"), "http://127.0.0.1:9000/plugin/abc/def");
    }
}

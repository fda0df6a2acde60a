//! Resolution of the addresses this node advertises.
//!
//! Explicitly configured addresses always win. Anything left unset is
//! discovered through an [`AddressProvider`] so tests can substitute their
//! own.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::NetConfig;

const FALLBACK_LOCAL_IP: &str = "127.0.0.1";

/// Probe target for the local route lookup. No packet is sent; connecting a
/// UDP socket only asks the kernel which interface it would use.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

#[async_trait]
pub trait AddressProvider: Send + Sync {
    /// Site-local address of the interface used for outbound traffic.
    async fn local_ip(&self) -> Option<String>;

    /// Address this host is reachable at from outside its network.
    async fn extranet_ip(&self) -> Option<String>;
}

/// Discovers addresses from the OS and, optionally, an HTTP lookup service.
pub struct SystemAddressProvider {
    http: reqwest::Client,
    lookup_url: Option<String>,
}

impl SystemAddressProvider {
    pub fn new(lookup_url: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            lookup_url,
        }
    }
}

#[async_trait]
impl AddressProvider for SystemAddressProvider {
    async fn local_ip(&self) -> Option<String> {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect(ROUTE_PROBE_ADDR).await.ok()?;
        let ip = socket.local_addr().ok()?.ip();
        if ip.is_loopback() || ip.is_unspecified() {
            return None;
        }
        Some(ip.to_string())
    }

    async fn extranet_ip(&self) -> Option<String> {
        let url = self.lookup_url.as_deref()?;
        let body = match self.http.get(url).send().await {
            Ok(resp) => resp.text().await.ok()?,
            Err(err) => {
                tracing::warn!(%url, error = %err, "public ip lookup failed");
                return None;
            }
        };
        let candidate = body.trim();
        match candidate.parse::<IpAddr>() {
            Ok(ip) => Some(ip.to_string()),
            Err(_) => {
                tracing::warn!(%url, body = %candidate, "public ip lookup returned garbage");
                None
            }
        }
    }
}

/// Resolves local, public and registration addresses from [`NetConfig`].
pub struct NetResolver {
    config: NetConfig,
    provider: Arc<dyn AddressProvider>,
}

impl NetResolver {
    pub fn new(config: NetConfig, provider: Arc<dyn AddressProvider>) -> Self {
        Self { config, provider }
    }

    pub fn from_config(config: NetConfig) -> Self {
        let provider = Arc::new(SystemAddressProvider::new(
            config.public_ip_lookup_url.clone(),
        ));
        Self::new(config, provider)
    }

    /// Configured local IP, else the probed one, else loopback.
    pub async fn local_ip(&self) -> String {
        if let Some(ip) = non_empty(&self.config.local_ip) {
            return ip.to_string();
        }
        self.provider
            .local_ip()
            .await
            .unwrap_or_else(|| FALLBACK_LOCAL_IP.to_string())
    }

    /// Configured public IP, else the static mapping of the local IP, else
    /// the extranet lookup, else the local IP.
    pub async fn public_ip(&self) -> String {
        if let Some(ip) = non_empty(&self.config.public_ip) {
            return ip.to_string();
        }
        let local = self.local_ip().await;
        if let Some(mapped) = self.config.public_ip_mapping.get(&local) {
            return mapped.clone();
        }
        match self.provider.extranet_ip().await {
            Some(ip) => ip,
            None => local,
        }
    }

    /// Address the connect server registers under; defaults to the public IP.
    pub async fn connect_server_register_ip(&self) -> String {
        match non_empty(&self.config.connect_server_register_ip) {
            Some(ip) => ip.to_string(),
            None => self.public_ip().await,
        }
    }

    /// Address the gateway server registers under; defaults to the local IP.
    pub async fn gateway_server_register_ip(&self) -> String {
        match non_empty(&self.config.gateway_server_register_ip) {
            Some(ip) => ip.to_string(),
            None => self.local_ip().await,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProvider {
        local: Option<&'static str>,
        extranet: Option<&'static str>,
    }

    #[async_trait]
    impl AddressProvider for FakeProvider {
        async fn local_ip(&self) -> Option<String> {
            self.local.map(String::from)
        }

        async fn extranet_ip(&self) -> Option<String> {
            self.extranet.map(String::from)
        }
    }

    fn resolver(
        config: NetConfig,
        local: Option<&'static str>,
        extranet: Option<&'static str>,
    ) -> NetResolver {
        NetResolver::new(config, Arc::new(FakeProvider { local, extranet }))
    }

    #[tokio::test]
    async fn explicit_addresses_win() {
        let config = NetConfig {
            local_ip: Some("10.0.0.5".into()),
            public_ip: Some("203.0.113.7".into()),
            connect_server_register_ip: Some("198.51.100.1".into()),
            gateway_server_register_ip: Some("10.0.0.99".into()),
            ..NetConfig::default()
        };
        let net = resolver(config, Some("192.168.1.2"), Some("203.0.113.200"));
        assert_eq!(net.local_ip().await, "10.0.0.5");
        assert_eq!(net.public_ip().await, "203.0.113.7");
        assert_eq!(net.connect_server_register_ip().await, "198.51.100.1");
        assert_eq!(net.gateway_server_register_ip().await, "10.0.0.99");
    }

    #[tokio::test]
    async fn public_ip_uses_mapping_before_lookup() {
        let mut config = NetConfig::default();
        config
            .public_ip_mapping
            .insert("192.168.1.2".into(), "203.0.113.9".into());
        let net = resolver(config, Some("192.168.1.2"), Some("203.0.113.200"));
        assert_eq!(net.public_ip().await, "203.0.113.9");
    }

    #[tokio::test]
    async fn public_ip_falls_back_to_lookup_then_local() {
        let net = resolver(NetConfig::default(), Some("192.168.1.2"), Some("203.0.113.200"));
        assert_eq!(net.public_ip().await, "203.0.113.200");

        let net = resolver(NetConfig::default(), Some("192.168.1.2"), None);
        assert_eq!(net.public_ip().await, "192.168.1.2");
    }

    #[tokio::test]
    async fn register_ips_default_to_public_and_local() {
        let net = resolver(NetConfig::default(), Some("192.168.1.2"), Some("203.0.113.200"));
        assert_eq!(net.connect_server_register_ip().await, "203.0.113.200");
        assert_eq!(net.gateway_server_register_ip().await, "192.168.1.2");
    }

    #[tokio::test]
    async fn blank_values_count_as_unset() {
        let config = NetConfig {
            local_ip: Some("  ".into()),
            ..NetConfig::default()
        };
        let net = resolver(config, None, None);
        assert_eq!(net.local_ip().await, "127.0.0.1");
    }
}

//! Connection configuration
//!
//! Addressing, authentication-method selection and the handful of tunables
//! the protocol engine needs. The Miniserver exposes its HTTP API and the
//! WebSocket endpoint on independently configurable ports, so the address
//! carries both.

pub mod credentials;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::crypto::CommandEncryption;
use crate::error::{LoxoneError, Result};

pub use credentials::Credentials;

/// Authentication method for the connection handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationMethod {
    /// Select password or token authentication from the firmware version
    #[default]
    Default,
    /// Legacy hash-based authentication (firmware before 9.0)
    Password,
    /// Token-based authentication (firmware 9.0 and newer)
    Token,
}

/// Miniserver address with split HTTP and WebSocket ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiniserverAddress {
    /// URL scheme for the HTTP side ("http" or "https")
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Host name or IP address
    pub host: String,

    /// Port of the HTTP API
    #[serde(default = "default_port")]
    pub http_port: u16,

    /// Port of the WebSocket endpoint
    #[serde(default = "default_port")]
    pub ws_port: u16,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_port() -> u16 {
    80
}

impl MiniserverAddress {
    /// Address with both endpoints on port 80.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            scheme: default_scheme(),
            host: host.into(),
            http_port: 80,
            ws_port: 80,
        }
    }

    /// Address with explicit HTTP and WebSocket ports.
    pub fn with_ports(host: impl Into<String>, http_port: u16, ws_port: u16) -> Self {
        Self {
            scheme: default_scheme(),
            host: host.into(),
            http_port,
            ws_port,
        }
    }

    /// Base URL of the HTTP API.
    pub fn http_url(&self) -> Result<Url> {
        let raw = format!("{}://{}:{}/", self.scheme, self.host, self.http_port);
        Url::parse(&raw).map_err(|e| LoxoneError::parsing(format!("invalid address {raw:?}: {e}")))
    }

    /// URL of the WebSocket endpoint (`ws/rfc6455`).
    pub fn ws_url(&self) -> Result<Url> {
        let scheme = if self.scheme.eq_ignore_ascii_case("https") {
            "wss"
        } else {
            "ws"
        };
        let raw = format!("{}://{}:{}/ws/rfc6455", scheme, self.host, self.ws_port);
        Url::parse(&raw).map_err(|e| LoxoneError::parsing(format!("invalid address {raw:?}: {e}")))
    }
}

impl std::fmt::Display for MiniserverAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}:{}->{}",
            self.scheme, self.host, self.http_port, self.ws_port
        )
    }
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Miniserver address
    pub address: MiniserverAddress,

    /// Authentication method to use
    #[serde(default)]
    pub auth_method: AuthenticationMethod,

    /// Encryption applied to outgoing commands by default
    #[serde(default)]
    pub default_encryption: CommandEncryption,

    /// Keep-alive interval; zero disables the keep-alive task.
    ///
    /// The Miniserver closes connections that stay silent for more than five
    /// minutes.
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,

    /// Timeout for the reachability probe
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(240)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

impl ConnectionConfig {
    /// Configuration with defaults for the given address.
    pub fn new(address: MiniserverAddress) -> Self {
        Self {
            address,
            auth_method: AuthenticationMethod::Default,
            default_encryption: CommandEncryption::None,
            keep_alive: default_keep_alive(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn derives_split_urls() {
        let address = MiniserverAddress::with_ports("192.168.1.77", 8080, 8081);
        assert_eq!(address.http_url().unwrap().as_str(), "http://192.168.1.77:8080/");
        assert_eq!(
            address.ws_url().unwrap().as_str(),
            "ws://192.168.1.77:8081/ws/rfc6455"
        );
    }

    #[test]
    fn https_maps_to_wss() {
        let mut address = MiniserverAddress::new("miniserver.local");
        address.scheme = "https".to_string();
        assert!(address.ws_url().unwrap().as_str().starts_with("wss://"));
    }

    #[test]
    fn config_defaults() {
        let config = ConnectionConfig::new(MiniserverAddress::new("example"));
        assert_eq!(config.auth_method, AuthenticationMethod::Default);
        assert_eq!(config.default_encryption, CommandEncryption::None);
        assert_eq!(config.keep_alive, Duration::from_secs(240));
    }
}

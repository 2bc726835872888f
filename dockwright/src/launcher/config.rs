//! Runtime configuration for the application server.
//!
//! Built once at process start from environment lookups and injected into
//! the launcher; never read ad hoc from global state afterwards.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use dockwright_shared::constants::{envs, server};
use dockwright_shared::errors::{DockwrightError, DockwrightResult};

/// Bind address, port and headless flag for the served application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Suppress interactive prompts at startup.
    pub headless: bool,

    /// TCP port the server binds.
    pub port: u16,

    /// Interface the server binds. Must be the wildcard address for the
    /// server to be reachable from outside the container.
    pub address: IpAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            headless: server::DEFAULT_HEADLESS,
            port: server::DEFAULT_PORT,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl ServerConfig {
    /// Build from the process environment.
    pub fn from_env() -> DockwrightResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup, falling back to `defaults` for unset
    /// or empty keys.
    pub fn from_lookup_with<F>(defaults: ServerConfig, lookup: F) -> DockwrightResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let headless = match value(envs::SERVER_HEADLESS) {
            Some(raw) => parse_bool(envs::SERVER_HEADLESS, &raw)?,
            None => defaults.headless,
        };

        let port = match value(envs::SERVER_PORT) {
            Some(raw) => parse_port(&raw)?,
            None => defaults.port,
        };

        let address = match value(envs::SERVER_ADDRESS) {
            Some(raw) => raw.trim().parse::<IpAddr>().map_err(|e| {
                DockwrightError::Config(format!(
                    "{}='{}' is not an IP address: {}",
                    envs::SERVER_ADDRESS,
                    raw,
                    e
                ))
            })?,
            None => defaults.address,
        };

        Ok(Self {
            headless,
            port,
            address,
        })
    }

    /// Build from an arbitrary lookup with the built-in defaults.
    pub fn from_lookup<F>(lookup: F) -> DockwrightResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_lookup_with(Self::default(), lookup)
    }

    /// True when the server accepts connections on all interfaces.
    pub fn is_wildcard(&self) -> bool {
        self.address.is_unspecified()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Address a local client should dial to reach the server.
    pub fn probe_addr(&self) -> SocketAddr {
        let host = match self.address {
            IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
            other => other,
        };
        SocketAddr::new(host, self.port)
    }

    /// Environment variables carrying this configuration, in fixed order.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        vec![
            (envs::SERVER_HEADLESS.to_string(), self.headless.to_string()),
            (envs::SERVER_PORT.to_string(), self.port.to_string()),
            (envs::SERVER_ADDRESS.to_string(), self.address.to_string()),
        ]
    }

    /// Command-line flags carrying this configuration.
    pub fn server_args(&self) -> Vec<String> {
        vec![
            format!("--server.port={}", self.port),
            format!("--server.address={}", self.address),
            format!("--server.headless={}", self.headless),
        ]
    }
}

fn parse_bool(key: &str, raw: &str) -> DockwrightResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(DockwrightError::Config(format!(
            "{key}='{other}' is not a boolean"
        ))),
    }
}

fn parse_port(raw: &str) -> DockwrightResult<u16> {
    let port: u16 = raw.trim().parse().map_err(|e| {
        DockwrightError::Config(format!(
            "{}='{}' is not a port number: {}",
            envs::SERVER_PORT,
            raw,
            e
        ))
    })?;

    if port == 0 {
        return Err(DockwrightError::Config(format!(
            "{} must not be 0",
            envs::SERVER_PORT
        )));
    }

    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_bind_wildcard_8501() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:8501");
        assert!(config.headless);
        assert!(config.is_wildcard());
    }

    #[test]
    fn test_port_override() {
        let config = ServerConfig::from_lookup(lookup(&[("STREAMLIT_SERVER_PORT", "9000")])).unwrap();
        assert_eq!(config.port, 9000);
        assert!(config.server_args().contains(&"--server.port=9000".to_string()));
    }

    #[test]
    fn test_empty_values_fall_back_to_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("STREAMLIT_SERVER_PORT", ""),
            ("STREAMLIT_SERVER_ADDRESS", "  "),
        ]))
        .unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_port = ServerConfig::from_lookup(lookup(&[("STREAMLIT_SERVER_PORT", "http")]));
        assert!(matches!(bad_port, Err(DockwrightError::Config(_))));

        let zero = ServerConfig::from_lookup(lookup(&[("STREAMLIT_SERVER_PORT", "0")]));
        assert!(zero.is_err());

        let bad_bool = ServerConfig::from_lookup(lookup(&[("STREAMLIT_SERVER_HEADLESS", "maybe")]));
        assert!(bad_bool.is_err());

        let bad_addr = ServerConfig::from_lookup(lookup(&[("STREAMLIT_SERVER_ADDRESS", "host")]));
        assert!(bad_addr.is_err());
    }

    #[test]
    fn test_loopback_is_not_wildcard() {
        let config =
            ServerConfig::from_lookup(lookup(&[("STREAMLIT_SERVER_ADDRESS", "127.0.0.1")])).unwrap();
        assert!(!config.is_wildcard());
        assert_eq!(config.probe_addr(), config.socket_addr());
    }

    #[test]
    fn test_probe_addr_dials_loopback_for_wildcard() {
        let config = ServerConfig::default();
        assert_eq!(config.probe_addr().to_string(), "127.0.0.1:8501");
    }

    #[test]
    fn test_env_pairs_order() {
        let keys: Vec<String> = ServerConfig::default()
            .env_pairs()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(
            keys,
            vec![
                "STREAMLIT_SERVER_HEADLESS",
                "STREAMLIT_SERVER_PORT",
                "STREAMLIT_SERVER_ADDRESS"
            ]
        );
    }
}

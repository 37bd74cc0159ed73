//! Relay settings read from the environment.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

/// Errors in the relay environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is present but cannot be parsed.
    #[error("invalid value for {name}: {value}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Contact uid of the relay.
    pub uid: String,
    /// Callsign of the relay.
    pub callsign: String,
    /// Hardware interface for the mesh; no mesh without it.
    pub mesh_iface: Option<String>,
    /// Multicast group of the mesh.
    pub mesh_group: String,
    /// Mesh port.
    pub mesh_port: u16,
    /// Port accepting direct TCP CoT; 0 disables.
    pub tcp_port: u16,
    /// TAK server to relay to, as `host:port`.
    pub server: Option<(String, u16)>,
    /// Health endpoint address.
    pub health_addr: SocketAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            uid: "COT-RELAY".to_string(),
            callsign: "RELAY".to_string(),
            mesh_iface: None,
            mesh_group: "239.2.3.1".to_string(),
            mesh_port: 6969,
            tcp_port: 4242,
            server: None,
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl RelayConfig {
    /// Read the configuration from `RELAY_*` variables.
    ///
    /// - `RELAY_UID`, `RELAY_CALLSIGN`: identity
    /// - `RELAY_MESH_IFACE`, `RELAY_MESH_GROUP`, `RELAY_MESH_PORT`: mesh side
    /// - `RELAY_TCP_PORT`: direct TCP inbound port
    /// - `RELAY_SERVER`: TAK server `host:port`
    /// - `RELAY_HEALTH_ADDR`: health endpoint bind address
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let server = match lookup("RELAY_SERVER") {
            Some(v) => Some(parse_host_port(&v).ok_or(ConfigError::Invalid {
                name: "RELAY_SERVER",
                value: v,
            })?),
            None => None,
        };
        Ok(Self {
            uid: lookup("RELAY_UID").unwrap_or(defaults.uid),
            callsign: lookup("RELAY_CALLSIGN").unwrap_or(defaults.callsign),
            mesh_iface: lookup("RELAY_MESH_IFACE"),
            mesh_group: lookup("RELAY_MESH_GROUP").unwrap_or(defaults.mesh_group),
            mesh_port: parsed(&lookup, "RELAY_MESH_PORT", defaults.mesh_port)?,
            tcp_port: parsed(&lookup, "RELAY_TCP_PORT", defaults.tcp_port)?,
            server,
            health_addr: parsed(&lookup, "RELAY_HEALTH_ADDR", defaults.health_addr)?,
        })
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid { name, value: v }),
        None => Ok(default),
    }
}

fn parse_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("RELAY_UID", "R-1"),
            ("RELAY_MESH_IFACE", "eth0"),
            ("RELAY_TCP_PORT", "0"),
            ("RELAY_SERVER", "tak.example.com:8087"),
        ]))
        .unwrap();
        assert_eq!(config.uid, "R-1");
        assert_eq!(config.mesh_iface.as_deref(), Some("eth0"));
        assert_eq!(config.tcp_port, 0);
        assert_eq!(config.server, Some(("tak.example.com".to_string(), 8087)));
    }

    #[test]
    fn test_invalid_values() {
        assert!(RelayConfig::from_lookup(lookup(&[("RELAY_MESH_PORT", "x")])).is_err());
        assert!(RelayConfig::from_lookup(lookup(&[("RELAY_SERVER", "nohost")])).is_err());
        assert!(RelayConfig::from_lookup(lookup(&[("RELAY_SERVER", ":80")])).is_err());
    }
}

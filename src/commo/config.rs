//! Facade configuration.
//!
//! [`CommoConfig`] collects the transport-wide knobs so an application can
//! set them in one call to [`Commo::apply_config`](super::Commo::apply_config)
//! instead of one setter at a time.

use std::time::Duration;

use crate::core::constants::{DEFAULT_MCAST_TTL, DEFAULT_TCP_CONN_TIMEOUT, MIN_TCP_CONN_TIMEOUT};
use crate::core::{CommoError, Result};

/// Largest multicast TTL accepted.
pub const MAX_TTL: u32 = 255;

/// Transport-wide settings applied by the facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommoConfig {
    /// Callsign placed in mission package traffic; `None` keeps the current one.
    pub callsign: Option<String>,

    /// Prefer a server stream over an equally fresh mesh endpoint.
    pub prefer_stream_endpoint: bool,

    /// Advertise our endpoint as UDP rather than TCP.
    pub advertise_endpoint_as_udp: bool,

    /// Set `SO_REUSEADDR` on datagram receive sockets.
    pub enable_address_reuse: bool,

    /// Loop outbound multicast back to local receivers.
    pub multicast_loopback: bool,

    /// Multicast TTL, 1 to 255.
    pub ttl: u32,

    /// Rebuild silent receive sockets after this long; `None` keeps the
    /// default, zero disables the check.
    pub udp_no_data_timeout: Option<Duration>,

    /// Connect timeout for direct TCP sends and server streams.
    pub tcp_conn_timeout: Duration,

    /// Ping idle server streams and reconnect silent ones.
    pub stream_monitor: bool,
}

impl Default for CommoConfig {
    fn default() -> Self {
        Self {
            callsign: None,
            prefer_stream_endpoint: false,
            advertise_endpoint_as_udp: false,
            enable_address_reuse: false,
            multicast_loopback: false,
            ttl: DEFAULT_MCAST_TTL,
            udp_no_data_timeout: None,
            tcp_conn_timeout: DEFAULT_TCP_CONN_TIMEOUT,
            stream_monitor: true,
        }
    }
}

impl CommoConfig {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the callsign.
    pub fn callsign(mut self, callsign: impl Into<String>) -> Self {
        self.callsign = Some(callsign.into());
        self
    }

    /// Prefer server streams.
    pub fn prefer_stream_endpoint(mut self, prefer: bool) -> Self {
        self.prefer_stream_endpoint = prefer;
        self
    }

    /// Advertise a UDP endpoint.
    pub fn advertise_endpoint_as_udp(mut self, enabled: bool) -> Self {
        self.advertise_endpoint_as_udp = enabled;
        self
    }

    /// Enable address reuse.
    pub fn enable_address_reuse(mut self, enabled: bool) -> Self {
        self.enable_address_reuse = enabled;
        self
    }

    /// Enable multicast loopback.
    pub fn multicast_loopback(mut self, enabled: bool) -> Self {
        self.multicast_loopback = enabled;
        self
    }

    /// Set the multicast TTL.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the UDP no-data timeout.
    pub fn udp_no_data_timeout(mut self, timeout: Duration) -> Self {
        self.udp_no_data_timeout = Some(timeout);
        self
    }

    /// Set the TCP connect timeout.
    pub fn tcp_conn_timeout(mut self, timeout: Duration) -> Self {
        self.tcp_conn_timeout = timeout;
        self
    }

    /// Enable or disable stream monitoring.
    pub fn stream_monitor(mut self, enabled: bool) -> Self {
        self.stream_monitor = enabled;
        self
    }

    /// Check every value before anything is applied.
    pub fn validate(&self) -> Result<()> {
        if let Some(cs) = &self.callsign
            && cs.is_empty()
        {
            return Err(CommoError::invalid("empty callsign"));
        }
        validate_ttl(self.ttl)?;
        if self.tcp_conn_timeout < MIN_TCP_CONN_TIMEOUT {
            return Err(CommoError::invalid(format!(
                "tcp connect timeout below {}s",
                MIN_TCP_CONN_TIMEOUT.as_secs()
            )));
        }
        Ok(())
    }
}

pub(crate) fn validate_ttl(ttl: u32) -> Result<()> {
    if !(1..=MAX_TTL).contains(&ttl) {
        return Err(CommoError::invalid(format!("ttl {ttl} out of range")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CommoConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ttl, 1);
        assert!(config.stream_monitor);
        assert_eq!(config.tcp_conn_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_builder_chain() {
        let config = CommoConfig::new()
            .callsign("ALPHA-1")
            .prefer_stream_endpoint(true)
            .ttl(16)
            .udp_no_data_timeout(Duration::ZERO)
            .stream_monitor(false);
        assert_eq!(config.callsign.as_deref(), Some("ALPHA-1"));
        assert!(config.prefer_stream_endpoint);
        assert_eq!(config.ttl, 16);
        assert_eq!(config.udp_no_data_timeout, Some(Duration::ZERO));
        assert!(!config.stream_monitor);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(CommoConfig::new().ttl(0).validate().is_err());
        assert!(CommoConfig::new().ttl(256).validate().is_err());
        assert!(CommoConfig::new().callsign("").validate().is_err());
        assert!(
            CommoConfig::new()
                .tcp_conn_timeout(Duration::from_secs(1))
                .validate()
                .is_err()
        );
    }
}

//! Per-contact endpoint records.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use crate::core::constants::{DEFAULT_CHAT_PORT, DEFAULT_UDP_PORT};
use crate::core::{CoTMessageType, CommoError, Result};
use crate::net::addr::parse_ip;

/// Direct UDP endpoint.
///
/// Discovered endpoints send situational awareness to the default UDP port
/// and chat to the chat port. Known endpoints are configured by the
/// application and use one address for everything.
#[derive(Debug, Clone)]
pub struct DatagramEndpoint {
    base: IpAddr,
    sa_addr: SocketAddr,
    chat_addr: SocketAddr,
    endpoint: String,
    known: bool,
    last_rx: Instant,
}

impl DatagramEndpoint {
    /// Endpoint learned from a received message's advertised host.
    pub fn discovered(host: &str) -> Result<Self> {
        let base = parse_host(host)?;
        Ok(Self {
            base,
            sa_addr: SocketAddr::new(base, DEFAULT_UDP_PORT),
            chat_addr: SocketAddr::new(base, DEFAULT_CHAT_PORT),
            endpoint: host.to_string(),
            known: false,
            last_rx: Instant::now(),
        })
    }

    /// Endpoint configured by the application.
    pub fn known(host: &str, port: u16) -> Result<Self> {
        let base = parse_host(host)?;
        let addr = SocketAddr::new(base, port);
        Ok(Self {
            base,
            sa_addr: addr,
            chat_addr: addr,
            endpoint: host.to_string(),
            known: true,
            last_rx: Instant::now(),
        })
    }

    /// Refresh a discovered endpoint from a newly received message.
    pub fn update_from_cot(&mut self, host: &str) -> Result<()> {
        if self.known {
            return Err(CommoError::invalid("cannot rediscover a known endpoint"));
        }
        if host != self.endpoint {
            *self = Self::discovered(host)?;
        }
        self.last_rx = Instant::now();
        Ok(())
    }

    /// Reconfigure a known endpoint.
    pub fn update_known(&mut self, host: &str, port: u16) -> Result<()> {
        if !self.known {
            return Err(CommoError::invalid("endpoint was discovered, not configured"));
        }
        let fresh = Self::known(host, port)?;
        self.base = fresh.base;
        self.sa_addr = fresh.sa_addr;
        self.chat_addr = fresh.chat_addr;
        self.endpoint = fresh.endpoint;
        Ok(())
    }

    /// Destination for a message of type `ty`.
    pub fn addr_for(&self, ty: CoTMessageType) -> SocketAddr {
        match ty {
            CoTMessageType::Chat => self.chat_addr,
            CoTMessageType::SituationalAwareness => self.sa_addr,
        }
    }

    /// Host address without a port.
    pub fn base_addr(&self) -> IpAddr {
        self.base
    }

    /// True for application-configured endpoints.
    pub fn is_known(&self) -> bool {
        self.known
    }

    /// When traffic last refreshed this endpoint.
    pub fn last_rx(&self) -> Instant {
        self.last_rx
    }

    #[cfg(test)]
    pub(crate) fn set_last_rx(&mut self, at: Instant) {
        self.last_rx = at;
    }
}

/// Direct TCP endpoint.
#[derive(Debug, Clone)]
pub struct TcpEndpoint {
    host: String,
    port: u16,
    last_rx: Instant,
}

impl TcpEndpoint {
    /// Create from an advertised host and port.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let mut ep = Self {
            host: String::new(),
            port: 0,
            last_rx: Instant::now(),
        };
        ep.update(host, port)?;
        Ok(ep)
    }

    /// Replace host and port, marking the endpoint fresh.
    pub fn update(&mut self, host: &str, port: u16) -> Result<()> {
        if host.is_empty() || port == 0 {
            return Err(CommoError::invalid(format!("bad tcp endpoint {host}:{port}")));
        }
        self.host = host.to_string();
        self.port = port;
        self.last_rx = Instant::now();
        Ok(())
    }

    /// Remote host as advertised.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Remote port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// When traffic last refreshed this endpoint.
    pub fn last_rx(&self) -> Instant {
        self.last_rx
    }

    #[cfg(test)]
    pub(crate) fn set_last_rx(&mut self, at: Instant) {
        self.last_rx = at;
    }
}

/// Reachability through a TAK server stream.
#[derive(Debug, Clone)]
pub struct StreamingEndpoint {
    stream_id: String,
    last_rx: Instant,
}

impl StreamingEndpoint {
    /// Create for the stream with endpoint id `stream_id`.
    pub fn new(stream_id: &str) -> Result<Self> {
        if stream_id.is_empty() {
            return Err(CommoError::invalid("empty stream endpoint"));
        }
        Ok(Self {
            stream_id: stream_id.to_string(),
            last_rx: Instant::now(),
        })
    }

    /// Point at `stream_id`, marking the endpoint fresh.
    pub fn update(&mut self, stream_id: &str) -> Result<()> {
        *self = Self::new(stream_id)?;
        Ok(())
    }

    /// Endpoint id of the stream.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// When traffic last refreshed this endpoint.
    pub fn last_rx(&self) -> Instant {
        self.last_rx
    }
}

fn parse_host(host: &str) -> Result<IpAddr> {
    if host.is_empty() {
        return Err(CommoError::invalid("empty endpoint host"));
    }
    parse_ip(host).ok_or_else(|| CommoError::invalid(format!("endpoint host {host} is not an address")))
}

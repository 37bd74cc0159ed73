//! Interface handles returned by the facade.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INTERFACE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an added interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(u64);

impl InterfaceId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        Self(NEXT_INTERFACE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if#{}", self.0)
    }
}

/// A datagram interface bound to a hardware interface, or the unicast set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhysicalNetInterface {
    /// Handle identity.
    pub id: InterfaceId,
    /// Hardware interface name, `None` for unicast broadcast destinations.
    pub iface_name: Option<String>,
}

/// A TCP listening port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpInboundNetInterface {
    /// Handle identity.
    pub id: InterfaceId,
    /// Local port.
    pub port: u16,
}

/// A TAK server connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamingNetInterface {
    /// Handle identity.
    pub id: InterfaceId,
    /// Endpoint id used to address the stream.
    pub remote_endpoint_id: String,
}

/// Any interface handle, as reported to status listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetInterface {
    /// Datagram interface.
    Physical(PhysicalNetInterface),
    /// TCP inbound port.
    TcpInbound(TcpInboundNetInterface),
    /// Server stream.
    Streaming(StreamingNetInterface),
}

impl NetInterface {
    /// Identity of the wrapped handle.
    pub fn id(&self) -> InterfaceId {
        match self {
            NetInterface::Physical(i) => i.id,
            NetInterface::TcpInbound(i) => i.id,
            NetInterface::Streaming(i) => i.id,
        }
    }
}

impl From<PhysicalNetInterface> for NetInterface {
    fn from(i: PhysicalNetInterface) -> Self {
        NetInterface::Physical(i)
    }
}

impl From<TcpInboundNetInterface> for NetInterface {
    fn from(i: TcpInboundNetInterface) -> Self {
        NetInterface::TcpInbound(i)
    }
}

impl From<StreamingNetInterface> for NetInterface {
    fn from(i: StreamingNetInterface) -> Self {
        NetInterface::Streaming(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_unique() {
        let a = InterfaceId::next();
        let b = InterfaceId::next();
        assert_ne!(a, b);
        let iface: NetInterface = TcpInboundNetInterface { id: a, port: 4242 }.into();
        assert_eq!(iface.id(), a);
    }
}

//! Listener traits and transport seams.
//!
//! Public listeners are implemented by applications and registered through
//! the [`Commo`](crate::commo::Commo) facade. The sender traits are the
//! seams between the contact manager and the transport managers.

use std::net::SocketAddr;

use super::error::Result;
use super::types::{ContactUid, NetInterfaceErrorCode};
use crate::cot::{CoTMessage, TakMessage};
use crate::net::NetInterface;

/// Notified when contacts appear or disappear.
pub trait ContactPresenceListener: Send + Sync {
    /// A new contact was discovered or configured.
    fn contact_added(&self, contact: &ContactUid);

    /// A contact lost its last endpoint.
    fn contact_removed(&self, contact: &ContactUid);
}

/// Receives every valid CoT message from any transport.
pub trait CoTMessageListener: Send + Sync {
    /// `rx_endpoint_id` identifies the receiving interface when known.
    fn cot_message_received(&self, cot_xml: &str, rx_endpoint_id: Option<&str>);
}

/// Receives raw datagrams arriving on generic inbound interfaces.
pub trait GenericDataListener: Send + Sync {
    /// Raw payload as received.
    fn generic_data_received(&self, data: &[u8], rx_endpoint_id: Option<&str>);
}

/// Notified when a direct TCP send fails.
pub trait CoTSendFailureListener: Send + Sync {
    /// Called exactly once per failed send.
    fn send_cot_failure(&self, host: &str, port: u16, error_reason: &str);
}

/// Notified of interface state changes.
pub trait InterfaceStatusListener: Send + Sync {
    /// The interface is active.
    fn interface_up(&self, iface: &NetInterface);

    /// The interface went inactive.
    fn interface_down(&self, iface: &NetInterface);

    /// The interface hit an error; it may still be retrying.
    fn interface_error(&self, iface: &NetInterface, err: NetInterfaceErrorCode) {
        let _ = (iface, err);
    }
}

/// Datagram transport as seen by the contact manager.
pub trait DatagramSender: Send + Sync {
    /// Queue `msg` for one destination at the given protocol version.
    fn send_datagram(&self, dest: SocketAddr, msg: &CoTMessage, proto_version: u32) -> Result<()>;

    /// The network-wide broadcast protocol version changed.
    fn proto_level_change(&self, new_version: u32);
}

/// Direct TCP transport as seen by the contact manager.
pub trait TcpSender: Send + Sync {
    /// Queue `msg` for a one-shot connection to `host:port`.
    fn send_message(&self, host: &str, port: u16, msg: &CoTMessage, proto_version: u32)
    -> Result<()>;
}

/// Streaming transport as seen by the contact manager.
pub trait StreamSender: Send + Sync {
    /// Queue `msg` on the stream with the given endpoint id.
    ///
    /// Fails if the stream is unknown or not up.
    fn send_message(&self, stream_endpoint: &str, msg: &CoTMessage) -> Result<()>;
}

/// Receives parsed traffic from the datagram manager.
pub trait DatagramListener: Send + Sync {
    /// A TAK message arrived on inbound interface `endpoint_id` from `sender`.
    fn datagram_received(&self, endpoint_id: &str, sender: Option<SocketAddr>, msg: &TakMessage);

    /// Raw data arrived on a generic inbound interface.
    fn datagram_received_generic(&self, endpoint_id: &str, data: &[u8]) {
        let _ = (endpoint_id, data);
    }
}

/// Receives CoT accepted on an inbound TCP listener.
pub trait TcpMessageListener: Send + Sync {
    /// `sender` is the connecting peer's address.
    fn tcp_message_received(&self, endpoint_id: &str, sender: Option<SocketAddr>, msg: &CoTMessage);
}

/// Receives CoT from a TAK server stream.
pub trait StreamingMessageListener: Send + Sync {
    /// `stream_endpoint` is the id of the connection the message came from.
    fn streaming_message_received(&self, stream_endpoint: &str, msg: &CoTMessage);
}

//! Core types, constants, listener traits and errors.

pub mod constants;
pub mod error;
pub mod observers;
pub mod traits;
pub mod types;

pub use error::{CommoError, CommoResult, CryptoError, Result};
pub use observers::ListenerSet;
pub use traits::{
    CoTMessageListener, CoTSendFailureListener, ContactPresenceListener, DatagramListener,
    DatagramSender, GenericDataListener, InterfaceStatusListener, StreamSender,
    StreamingMessageListener, TcpMessageListener, TcpSender,
};
pub use types::{
    CoTMessageType, CoTPointData, CoTSendMethod, ContactEndpointType, ContactUid, EndpointType,
    NetInterfaceErrorCode, TakProtoInfo,
};

//! CoT event codec.
//!
//! Parses and serializes CoT XML, converts to and from the TAK protobuf
//! representation, and frames both for mesh and server transports.

pub mod framing;
pub mod message;
pub mod takproto;
pub mod time;
pub mod xml;

pub use framing::{ProtoHeader, TakMessage, Varint, cot_xml_to_takproto, takproto_to_cot_xml};
pub use message::{CoTMessage, FileTransferAck, FileTransferRequest, STREAMING_ENDPOINT, TakControlType};

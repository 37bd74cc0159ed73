//! TAK server streams.
//!
//! - [`manager`]: connection lifecycle, protocol negotiation and liveness
//! - [`scanner`]: reassembly of the inbound byte stream into messages
//! - [`tls`]: client certificate and CA-only server verification

pub mod manager;
pub mod scanner;
pub mod tls;

pub use manager::{StreamAuth, StreamingSocketManagement};
pub use scanner::{Frame, StreamScanner};
pub use tls::TlsCredentials;

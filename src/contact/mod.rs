//! Remote contacts and their endpoints.

pub mod endpoint;
pub mod manager;

pub use endpoint::{DatagramEndpoint, StreamingEndpoint, TcpEndpoint};
pub use manager::ContactManager;

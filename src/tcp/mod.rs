//! Direct point-to-point TCP transport.

pub mod manager;

pub use manager::TcpSocketManagement;

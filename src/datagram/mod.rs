//! UDP mesh transport.

mod context;
pub mod manager;

pub use manager::DatagramSocketManagement;

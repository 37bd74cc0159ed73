//! The public facade.
//!
//! - [`Commo`]: owns and wires every manager
//! - [`CommoConfig`]: transport-wide settings applied in one call
//! - [`CoTListenerManagement`]: fan-out of received traffic to the client

pub mod config;
pub mod facade;
pub mod listeners;

pub use config::CommoConfig;
pub use facade::Commo;
pub use listeners::CoTListenerManagement;

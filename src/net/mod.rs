//! Network support shared by the transport managers.
//!
//! - [`addr`]: address parsing and endpoint id strings
//! - [`interfaces`]: interface handles returned by the facade
//! - [`resolver`]: background hostname resolution with retry
//! - [`scanner`]: hardware interface polling
//! - [`socket`]: non-blocking outbound connects

pub mod addr;
pub mod interfaces;
pub mod resolver;
pub mod scanner;
pub mod socket;

pub use interfaces::{
    InterfaceId, NetInterface, PhysicalNetInterface, StreamingNetInterface, TcpInboundNetInterface,
};
pub use resolver::{ResolverListener, ResolverQueue, ResolverRequestId};
pub use scanner::{HwIfListener, HwIfScanner};

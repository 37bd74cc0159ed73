//! # Commo Core
//!
//! Messaging core for Cursor-on-Target (CoT) traffic between TAK clients.
//!
//! A single [`Commo`] instance moves CoT over three transports at once:
//!
//! - **Mesh**: UDP multicast and unicast datagrams, optionally encrypted
//! - **Direct TCP**: one-shot connections to a peer's TCP port
//! - **Streaming**: long-lived plain or TLS connections to TAK servers
//!
//! It keeps a list of the contacts heard on any of them and routes
//! point-to-point sends over whichever endpoint is freshest, negotiating the
//! TAK protocol version used on the mesh and on each server stream.
//!
//! ## Feature Flags
//!
//! - `mission-package` (default): mission package transfers, simple file
//!   transfers and the embedded web server
//! - `certgen` (default): key, CSR and self-signed certificate generation
//!
//! ## Modules
//!
//! - [`core`]: listener traits, shared types, constants and errors
//! - [`cot`]: CoT XML and TAK protocol codecs
//! - [`crypto`]: mesh encryption and certificate material
//! - [`net`]: interface handles, resolver and interface scanner
//! - [`threading`]: named worker threads and their queues
//! - [`contact`], [`datagram`], [`tcp`], [`streaming`]: the managers
//! - [`missionpkg`], [`fileio`], [`http`]: file transfers (requires
//!   `mission-package`)
//! - [`commo`]: the facade
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use commo_core::prelude::*;
//!
//! struct Printer;
//!
//! impl CoTMessageListener for Printer {
//!     fn cot_message_received(&self, cot_xml: &str, rx_endpoint_id: Option<&str>) {
//!         println!("{rx_endpoint_id:?}: {cot_xml}");
//!     }
//! }
//!
//! fn main() -> commo_core::Result<()> {
//!     let commo = Commo::new(ContactUid::from("ANDROID-0123456789"), "ALPHA")?;
//!     commo.add_cot_message_listener(Arc::new(Printer))?;
//!     commo.add_inbound_interface("eth0", 6969, &["239.2.3.1"], false)?;
//!     commo.add_broadcast_interface(
//!         "eth0",
//!         &[CoTMessageType::SituationalAwareness],
//!         "239.2.3.1",
//!         6969,
//!     )?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

pub mod contact;
pub mod cot;
pub mod crypto;
pub mod datagram;
pub mod net;
pub mod streaming;
pub mod tcp;
pub mod threading;

// File transfers (feature-gated)
#[cfg(feature = "mission-package")]
#[cfg_attr(docsrs, doc(cfg(feature = "mission-package")))]
pub mod fileio;

#[cfg(feature = "mission-package")]
#[cfg_attr(docsrs, doc(cfg(feature = "mission-package")))]
pub mod http;

#[cfg(feature = "mission-package")]
#[cfg_attr(docsrs, doc(cfg(feature = "mission-package")))]
pub mod missionpkg;

// Facade
pub mod commo;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core traits and types
    pub use crate::core::*;

    pub use crate::commo::{Commo, CommoConfig};
    pub use crate::net::{
        NetInterface, PhysicalNetInterface, StreamingNetInterface, TcpInboundNetInterface,
    };
    pub use crate::streaming::{StreamAuth, TlsCredentials};

    #[cfg(feature = "mission-package")]
    pub use crate::fileio::{SimpleFileIO, SimpleFileIOStatus, SimpleFileIOUpdate};

    #[cfg(feature = "mission-package")]
    pub use crate::missionpkg::{
        MPTransferSettings, MissionPackageIO, MissionPackageTransferStatus, ReceiveStatusUpdate,
        SendFileInit, SendStatusUpdate,
    };
}

// Re-export commonly used items at crate root
pub use crate::commo::{Commo, CommoConfig};
pub use crate::core::{
    CoTMessageType, CoTSendMethod, CommoError, CommoResult, ContactUid, CryptoError, Result,
};
pub use crate::net::{NetInterface, PhysicalNetInterface, StreamingNetInterface, TcpInboundNetInterface};

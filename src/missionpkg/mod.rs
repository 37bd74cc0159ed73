//! Mission package transfers.
//!
//! A mission package is a file, usually a zip, offered to other contacts
//! with a CoT request and pulled by them over http(s). See
//! [`MissionPackageManager`] for how sends are routed and how downloads
//! are retried.

pub mod io;
pub mod manager;
pub mod settings;

pub use io::{MissionPackageIO, MissionPackageTransferStatus, ReceiveStatusUpdate, SendStatusUpdate};
pub use manager::{MissionPackageManager, SendFileInit};
pub use settings::MPTransferSettings;

//! HTTP plumbing for file transfers.
//!
//! - [`engine`]: blocking client used by the transfer managers
//! - [`server`]: embedded web server for peer-hosted packages
//! - [`proxy`]: TLS front end for the embedded web server

pub mod engine;
pub mod proxy;
pub mod server;

pub use engine::{HttpEngine, HttpError, HttpOptions, HttpResponse, HttpTls, ReqwestEngine};
pub use proxy::HttpsProxy;
pub use server::{FileLookup, FileServer};

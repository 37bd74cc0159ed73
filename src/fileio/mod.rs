//! Simple file transfers to and from http(s) servers.

pub mod io;
pub mod manager;

pub use io::{SimpleFileIO, SimpleFileIOStatus, SimpleFileIOUpdate};
pub use manager::SimpleFileIOManager;

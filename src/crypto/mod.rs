//! Mesh encryption and certificate material.
//!
//! - [`mesh`]: ChaCha20-Poly1305 sealing of datagram and direct TCP payloads
//! - [`certgen`]: key, CSR and self-signed certificate generation

pub mod mesh;

#[cfg(feature = "certgen")]
#[cfg_attr(docsrs, doc(cfg(feature = "certgen")))]
pub mod certgen;

pub use mesh::{MESH_KEY_SIZE, MeshCrypto};

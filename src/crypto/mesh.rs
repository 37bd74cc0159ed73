//! Mesh payload encryption
//!
//! Datagram and direct TCP payloads are sealed with ChaCha20-Poly1305 when a
//! key pair is configured. The cipher key is derived with HKDF-SHA256 from
//! the crypto key (IKM) and auth key (salt):
//!
//! ```text
//! key = HKDF-SHA256(ikm = crypto_key, salt = auth_key, info = "commo mesh v1")
//! packet = nonce (12) || ciphertext || tag (16)
//! ```

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::CryptoError;

/// Length of each configured key.
pub const MESH_KEY_SIZE: usize = 32;

/// Nonce prefix length.
pub const MESH_NONCE_SIZE: usize = 12;

/// Poly1305 tag length.
pub const MESH_TAG_SIZE: usize = 16;

const MESH_KDF_INFO: &[u8] = b"commo mesh v1";

/// Symmetric crypto for mesh traffic.
///
/// Key material is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MeshCrypto {
    key: [u8; MESH_KEY_SIZE],
}

impl MeshCrypto {
    /// Build from the auth and crypto keys.
    ///
    /// Both keys must be exactly 32 bytes and must differ.
    pub fn new(auth_key: &[u8], crypto_key: &[u8]) -> Result<Self, CryptoError> {
        if auth_key.len() != MESH_KEY_SIZE || crypto_key.len() != MESH_KEY_SIZE {
            return Err(CryptoError::InvalidKey);
        }
        if auth_key == crypto_key {
            return Err(CryptoError::InvalidKey);
        }
        let hk = Hkdf::<Sha256>::new(Some(auth_key), crypto_key);
        let mut key = [0u8; MESH_KEY_SIZE];
        hk.expand(MESH_KDF_INFO, &mut key)
            .map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { key })
    }

    /// Build from hex-encoded keys.
    pub fn from_hex(auth_key: &str, crypto_key: &str) -> Result<Self, CryptoError> {
        let mut auth = hex::decode(auth_key.trim()).map_err(|_| CryptoError::InvalidKey)?;
        let mut crypto = hex::decode(crypto_key.trim()).map_err(|_| CryptoError::InvalidKey)?;
        let result = Self::new(&auth, &crypto);
        auth.zeroize();
        crypto.zeroize();
        result
    }

    /// Seal a payload with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let mut nonce = [0u8; MESH_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(MESH_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed payload.
    pub fn decrypt(&self, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if packet.len() < MESH_NONCE_SIZE + MESH_TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce, ciphertext) = packet.split_at(MESH_NONCE_SIZE);
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for MeshCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MeshCrypto { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> ([u8; 32], [u8; 32]) {
        ([1u8; 32], [2u8; 32])
    }

    #[test]
    fn test_seal_open() {
        let (auth, crypto) = keys();
        let mc = MeshCrypto::new(&auth, &crypto).unwrap();
        let sealed = mc.encrypt(b"<event/>").unwrap();
        assert_eq!(sealed.len(), MESH_NONCE_SIZE + 8 + MESH_TAG_SIZE);
        assert_eq!(mc.decrypt(&sealed).unwrap(), b"<event/>");
    }

    #[test]
    fn test_nonce_is_fresh() {
        let (auth, crypto) = keys();
        let mc = MeshCrypto::new(&auth, &crypto).unwrap();
        assert_ne!(mc.encrypt(b"x").unwrap(), mc.encrypt(b"x").unwrap());
    }

    #[test]
    fn test_tamper_rejected() {
        let (auth, crypto) = keys();
        let mc = MeshCrypto::new(&auth, &crypto).unwrap();
        let mut sealed = mc.encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(mc.decrypt(&sealed), Err(CryptoError::DecryptionFailed));
        assert_eq!(mc.decrypt(&[0u8; 10]), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (auth, crypto) = keys();
        let a = MeshCrypto::new(&auth, &crypto).unwrap();
        let b = MeshCrypto::new(&crypto, &auth).unwrap();
        let sealed = a.encrypt(b"payload").unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_key_validation() {
        assert_eq!(MeshCrypto::new(&[1u8; 32], &[1u8; 32]).unwrap_err(), CryptoError::InvalidKey);
        assert_eq!(MeshCrypto::new(&[1u8; 16], &[2u8; 32]).unwrap_err(), CryptoError::InvalidKey);
        let auth = hex::encode([3u8; 32]);
        let crypto = hex::encode([4u8; 32]);
        assert!(MeshCrypto::from_hex(&auth, &crypto).is_ok());
        assert!(MeshCrypto::from_hex("zz", &crypto).is_err());
    }
}

//! Key, CSR and self-signed certificate generation.
//!
//! All material is PEM. Private keys are unencrypted PKCS#8.

use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384};
use tracing::debug;

use crate::core::{CommoError, CryptoError, Result};

fn keygen_err(e: rcgen::Error) -> CommoError {
    CommoError::Crypto(CryptoError::KeyGeneration(e.to_string()))
}

/// Generate a new ECDSA private key of `key_bits` (256 or 384).
pub fn generate_key_pem(key_bits: u32) -> Result<String> {
    let alg = match key_bits {
        256 => &PKCS_ECDSA_P256_SHA256,
        384 => &PKCS_ECDSA_P384_SHA384,
        other => return Err(CommoError::invalid(format!("unsupported key size {other}"))),
    };
    let key = KeyPair::generate_for(alg).map_err(keygen_err)?;
    Ok(key.serialize_pem())
}

/// Build a certificate signing request for `key_pem`.
///
/// `dn_entries` are `(key, value)` pairs with keys `C`, `ST`, `L`, `O`,
/// `OU` or `CN`.
pub fn generate_csr_pem(dn_entries: &[(String, String)], key_pem: &str) -> Result<String> {
    if dn_entries.is_empty() {
        return Err(CommoError::invalid("no distinguished name entries"));
    }
    let key = KeyPair::from_pem(key_pem).map_err(|_| CommoError::invalid("invalid private key"))?;
    let mut params = CertificateParams::default();
    for (k, v) in dn_entries {
        let ty = match k.as_str() {
            "C" => DnType::CountryName,
            "ST" => DnType::StateOrProvinceName,
            "L" => DnType::LocalityName,
            "O" => DnType::OrganizationName,
            "OU" => DnType::OrganizationalUnitName,
            "CN" => DnType::CommonName,
            other => return Err(CommoError::invalid(format!("unknown DN key {other}"))),
        };
        params.distinguished_name.push(ty, v.as_str());
    }
    let csr = params.serialize_request(&key).map_err(keygen_err)?;
    csr.pem().map_err(keygen_err)
}

/// Generate a self-signed certificate and its key.
///
/// Returns `(certificate_pem, key_pem)`.
pub fn generate_self_signed_cert(common_name: &str) -> Result<(String, String)> {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(keygen_err)?;
    let mut params = CertificateParams::new(vec![common_name.to_string()]).map_err(keygen_err)?;
    params.distinguished_name.push(DnType::CommonName, common_name);
    let cert = params.self_signed(&key).map_err(keygen_err)?;
    debug!(cn = common_name, "generated self-signed certificate");
    Ok((cert.pem(), key.serialize_pem()))
}

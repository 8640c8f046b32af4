//! Device credentials and identity policies
//!
//! The broker connector performs the TLS handshake; before it runs, an
//! [`IdentityPolicy`] checks that the local certificate actually belongs to
//! the identity being declared.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::Pem;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::TlsConfig;
use crate::message::DeviceIdentity;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid PEM: {0}")]
    InvalidPem(String),

    #[error("certificate fingerprint {actual} does not match declared identity {expected}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("certificate issued to {presented:?}, not to {declared}")]
    IdentityMismatch {
        declared: String,
        presented: Vec<String>,
    },

    #[error("certificate not trusted: {0}")]
    Untrusted(String),
}

/// PEM material for mutual TLS
#[derive(Clone)]
pub struct Credentials {
    /// Trusted authority the broker certificate is validated against
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl Credentials {
    pub fn from_pem(ca_pem: Vec<u8>, cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Self {
        Self {
            ca_pem,
            cert_pem,
            key_pem,
        }
    }

    /// Read the files named in the `[tls]` section
    pub fn load(tls: &TlsConfig) -> Result<Self, AuthError> {
        Ok(Self {
            ca_pem: read(&tls.ca_path)?,
            cert_pem: read(&tls.cert_path)?,
            key_pem: read(&tls.key_path)?,
        })
    }

    /// Fingerprint of the local certificate
    pub fn fingerprint(&self) -> Result<String, AuthError> {
        certificate_fingerprint(&self.cert_pem)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("ca_pem", &format_args!("{} bytes", self.ca_pem.len()))
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

fn read(path: &Path) -> Result<Vec<u8>, AuthError> {
    fs::read(path).map_err(|source| AuthError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// DER of the first CERTIFICATE block in `pem`
fn certificate_der(pem: &[u8]) -> Result<Vec<u8>, AuthError> {
    for block in Pem::iter_from_buffer(pem) {
        let block = block.map_err(|e| AuthError::InvalidPem(e.to_string()))?;
        if block.label == "CERTIFICATE" {
            return Ok(block.contents);
        }
    }
    Err(AuthError::InvalidPem("no CERTIFICATE block".into()))
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>, AuthError> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| AuthError::InvalidCertificate(e.to_string()))?;
    Ok(cert)
}

/// Lowercase hex SHA-256 over the DER of the first certificate in `pem`
pub fn certificate_fingerprint(pem: &[u8]) -> Result<String, AuthError> {
    let der = certificate_der(pem)?;
    parse(&der)?;
    Ok(hex::encode(Sha256::digest(&der)))
}

/// Subject common names followed by DNS and URI subject alternative names
pub fn certificate_names(pem: &[u8]) -> Result<Vec<String>, AuthError> {
    let der = certificate_der(pem)?;
    let cert = parse(&der)?;

    let mut names: Vec<String> = cert
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .map(str::to_string)
        .collect();

    let san = cert
        .subject_alternative_name()
        .map_err(|e| AuthError::InvalidCertificate(e.to_string()))?;
    if let Some(san) = san {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(name) | GeneralName::URI(name) => names.push(name.to_string()),
                _ => {}
            }
        }
    }
    Ok(names)
}

/// Check applied to credentials before any connection attempt
pub trait IdentityPolicy: Send + Sync {
    fn verify(&self, identity: &DeviceIdentity, credentials: &Credentials) -> Result<(), AuthError>;
}

/// Requires the certificate fingerprint to equal the declared one, and the
/// certificate to name the declared device in its CN or a SAN
#[derive(Debug, Default, Clone, Copy)]
pub struct FingerprintPolicy;

impl IdentityPolicy for FingerprintPolicy {
    fn verify(&self, identity: &DeviceIdentity, credentials: &Credentials) -> Result<(), AuthError> {
        let actual = credentials.fingerprint()?;
        if !actual.eq_ignore_ascii_case(&identity.certificate_fingerprint) {
            return Err(AuthError::FingerprintMismatch {
                expected: identity.certificate_fingerprint.clone(),
                actual,
            });
        }

        let presented = certificate_names(&credentials.cert_pem)?;
        if !presented.iter().any(|name| name == &identity.device_id) {
            return Err(AuthError::IdentityMismatch {
                declared: identity.device_id.clone(),
                presented,
            });
        }
        Ok(())
    }
}

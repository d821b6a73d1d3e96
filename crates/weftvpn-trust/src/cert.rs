//! Owned X.509 certificates and fingerprints
//!
//! Certificates are stored as DER bytes with subject, issuer and
//! fingerprint cached at construction. Verification re-parses on demand
//! since `x509-parser` types borrow from the input buffer.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use crate::error::{TrustError, TrustResult};

/// Size of a certificate fingerprint (SHA-256)
pub const FINGERPRINT_SIZE: usize = 32;

/// SHA-256 hash of a certificate's DER encoding
///
/// Used as the dynamic-contact key exchanged in contact requests.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertificateFingerprint([u8; FINGERPRINT_SIZE]);

impl CertificateFingerprint {
    /// Compute the fingerprint of a DER-encoded certificate
    pub fn of(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    pub fn from_bytes(bytes: [u8; FINGERPRINT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// Short hex form for display (8 bytes = 16 chars)
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for CertificateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for CertificateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificateFingerprint({})", self.to_hex())
    }
}

/// An X.509 certificate held as DER bytes
///
/// Subject, issuer and fingerprint are extracted once at construction.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Certificate {
    der: Vec<u8>,
    subject: String,
    issuer: String,
    fingerprint: CertificateFingerprint,
}

impl Certificate {
    /// Build a certificate from DER bytes
    pub fn from_der(der: Vec<u8>) -> TrustResult<Self> {
        if der.is_empty() {
            return Err(TrustError::InvalidFormat);
        }

        let (_, parsed) = X509Certificate::from_der(&der)
            .map_err(|e| TrustError::CertificateParse(e.to_string()))?;

        let subject = parsed.subject().to_string();
        let issuer = parsed.issuer().to_string();
        let fingerprint = CertificateFingerprint::of(&der);

        Ok(Self {
            der,
            subject,
            issuer,
            fingerprint,
        })
    }

    /// Build a certificate from a PEM-encoded buffer
    pub fn from_pem(bytes: &[u8]) -> TrustResult<Self> {
        if bytes.is_empty() {
            return Err(TrustError::InvalidFormat);
        }

        let (_, pem) = x509_parser::pem::parse_x509_pem(bytes)
            .map_err(|e| TrustError::CertificateParse(e.to_string()))?;

        Self::from_der(pem.contents)
    }

    /// Raw DER bytes
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Subject distinguished name
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Issuer distinguished name
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn fingerprint(&self) -> CertificateFingerprint {
        self.fingerprint
    }

    /// Whether subject and issuer name match (self-issued)
    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    /// Parse the DER bytes for verification work
    pub(crate) fn parse(&self) -> TrustResult<X509Certificate<'_>> {
        let (_, parsed) = X509Certificate::from_der(&self.der)
            .map_err(|e| TrustError::CertificateParse(e.to_string()))?;
        Ok(parsed)
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.subject)
    }
}

impl TryFrom<Vec<u8>> for Certificate {
    type Error = TrustError;

    fn try_from(der: Vec<u8>) -> Result<Self, Self::Error> {
        Self::from_der(der)
    }
}

impl From<Certificate> for Vec<u8> {
    fn from(cert: Certificate) -> Self {
        cert.der
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, DnValue, KeyPair};

    fn self_signed(cn: &str) -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.distinguished_name.push(
            DnType::CommonName,
            DnValue::Utf8String(cn.to_string()),
        );
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn test_from_der_extracts_metadata() {
        let der = self_signed("node.weft.test");
        let cert = Certificate::from_der(der.clone()).unwrap();

        assert!(cert.subject().contains("node.weft.test"));
        assert!(cert.is_self_issued());
        assert_eq!(cert.fingerprint(), CertificateFingerprint::of(&der));
    }

    #[test]
    fn test_from_der_empty() {
        assert!(matches!(
            Certificate::from_der(vec![]),
            Err(TrustError::InvalidFormat)
        ));
    }

    #[test]
    fn test_from_der_garbage() {
        assert!(matches!(
            Certificate::from_der(vec![0xde, 0xad, 0xbe, 0xef]),
            Err(TrustError::CertificateParse(_))
        ));
    }

    #[test]
    fn test_fingerprint_is_sha256_of_der() {
        let der = self_signed("fp.weft.test");
        let expected: [u8; 32] = sha2::Sha256::digest(&der).into();

        let cert = Certificate::from_der(der).unwrap();
        assert_eq!(cert.fingerprint().as_bytes(), &expected);
    }

    #[test]
    fn test_from_pem_roundtrip() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.distinguished_name.push(
            DnType::CommonName,
            DnValue::Utf8String("pem.weft.test".to_string()),
        );
        let generated = params.self_signed(&key).unwrap();

        let from_pem = Certificate::from_pem(generated.pem().as_bytes()).unwrap();
        let from_der = Certificate::from_der(generated.der().to_vec()).unwrap();

        assert_eq!(from_pem, from_der);
        assert_eq!(from_pem.fingerprint(), from_der.fingerprint());
    }

    #[test]
    fn test_fingerprint_display_is_short_hex() {
        let fp = CertificateFingerprint::from_bytes([0xab; 32]);
        assert_eq!(fp.to_string(), "abababababababab");
    }
}

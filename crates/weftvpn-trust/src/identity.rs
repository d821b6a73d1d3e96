//! Local node identity
//!
//! A node presents two certificates to its peers: one for signing and one
//! for cipherment. Private key material is zeroized on drop.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cert::Certificate;

/// A DER-encoded private key, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    der: Vec<u8>,
}

impl PrivateKey {
    pub fn from_der(der: Vec<u8>) -> Self {
        Self { der }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material
        write!(f, "PrivateKey({} bytes)", self.der.len())
    }
}

/// The local identity: signature and cipherment certificate/key pairs
#[derive(Clone)]
pub struct Identity {
    signature_certificate: Certificate,
    signature_key: PrivateKey,
    cipherment_certificate: Certificate,
    cipherment_key: PrivateKey,
}

impl Identity {
    pub fn new(
        signature_certificate: Certificate,
        signature_key: PrivateKey,
        cipherment_certificate: Certificate,
        cipherment_key: PrivateKey,
    ) -> Self {
        Self {
            signature_certificate,
            signature_key,
            cipherment_certificate,
            cipherment_key,
        }
    }

    /// Build an identity that uses one certificate/key pair for both roles
    pub fn from_single(certificate: Certificate, key: PrivateKey) -> Self {
        Self {
            signature_certificate: certificate.clone(),
            signature_key: key.clone(),
            cipherment_certificate: certificate,
            cipherment_key: key,
        }
    }

    pub fn signature_certificate(&self) -> &Certificate {
        &self.signature_certificate
    }

    pub fn signature_key(&self) -> &PrivateKey {
        &self.signature_key
    }

    pub fn cipherment_certificate(&self) -> &Certificate {
        &self.cipherment_certificate
    }

    pub fn cipherment_key(&self) -> &PrivateKey {
        &self.cipherment_key
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("signature", &self.signature_certificate)
            .field("cipherment", &self.cipherment_certificate)
            .finish()
    }
}

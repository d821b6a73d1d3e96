//! CA and CRL store
//!
//! Holds the configured certificate authorities and revocation lists the
//! chain verifier walks against. Read-only once the core is open.

use std::fmt;

use x509_parser::prelude::*;
use x509_parser::revocation_list::CertificateRevocationList;

use crate::cert::Certificate;
use crate::error::{TrustError, TrustResult};

/// An X.509 certificate revocation list held as DER bytes
#[derive(Clone)]
pub struct RevocationList {
    der: Vec<u8>,
    issuer: String,
}

impl RevocationList {
    pub fn from_der(der: Vec<u8>) -> TrustResult<Self> {
        if der.is_empty() {
            return Err(TrustError::InvalidFormat);
        }

        let (_, parsed) = CertificateRevocationList::from_der(&der)
            .map_err(|e| TrustError::CrlParse(e.to_string()))?;
        let issuer = parsed.issuer().to_string();

        Ok(Self { der, issuer })
    }

    /// Issuer distinguished name
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub(crate) fn parse(&self) -> TrustResult<CertificateRevocationList<'_>> {
        let (_, parsed) = CertificateRevocationList::from_der(&self.der)
            .map_err(|e| TrustError::CrlParse(e.to_string()))?;
        Ok(parsed)
    }
}

impl fmt::Debug for RevocationList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevocationList")
            .field("issuer", &self.issuer)
            .finish()
    }
}

/// The set of trusted authorities and revocation lists
#[derive(Clone, Debug, Default)]
pub struct TrustStore {
    authorities: Vec<Certificate>,
    revocation_lists: Vec<RevocationList>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authorities(authorities: Vec<Certificate>) -> Self {
        Self {
            authorities,
            revocation_lists: Vec::new(),
        }
    }

    pub fn add_authority(&mut self, certificate: Certificate) {
        self.authorities.push(certificate);
    }

    pub fn add_revocation_list(&mut self, crl: RevocationList) {
        self.revocation_lists.push(crl);
    }

    pub fn authorities(&self) -> &[Certificate] {
        &self.authorities
    }

    pub fn revocation_lists(&self) -> &[RevocationList] {
        &self.revocation_lists
    }

    /// Look up the authority whose subject matches `issuer_dn`
    pub(crate) fn find_issuer(&self, issuer_dn: &str) -> Option<&Certificate> {
        self.authorities.iter().find(|c| c.subject() == issuer_dn)
    }

    /// Whether the exact certificate (by DER bytes) is a trusted authority
    pub(crate) fn contains(&self, certificate: &Certificate) -> bool {
        self.authorities.iter().any(|c| c.der() == certificate.der())
    }

    /// Revocation lists issued under `issuer_dn`
    pub(crate) fn crls_for<'a>(
        &'a self,
        issuer_dn: &'a str,
    ) -> impl Iterator<Item = &'a RevocationList> {
        self.revocation_lists
            .iter()
            .filter(move |crl| crl.issuer() == issuer_dn)
    }
}

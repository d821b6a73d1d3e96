//! Certificate chain verification
//!
//! Walks a presented certificate up to a trusted authority, verifying
//! signatures and validity windows at each depth and applying the
//! configured CRL policy. A policy failure is a decision, not an error:
//! `certificate_is_valid` returns `false` and logs the reason and depth.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use x509_parser::prelude::*;

use crate::cert::Certificate;
use crate::store::TrustStore;
use crate::MAX_CHAIN_DEPTH;

/// How presented certificates are validated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationPolicy {
    /// Verify the chain against the configured authorities
    #[default]
    Default,
    /// Skip chain verification entirely
    None,
}

/// Which chain elements are checked against revocation lists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrlPolicy {
    /// No revocation checking
    #[default]
    None,
    /// Check the leaf certificate only
    Leaf,
    /// Check every certificate in the chain
    All,
}

/// User-supplied acceptance predicate, run after chain verification
pub type AcceptancePredicate = Arc<dyn Fn(&Certificate) -> bool + Send + Sync>;

/// A failed verification: the reason and the chain depth it occurred at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyFailure {
    pub depth: usize,
    pub reason: String,
}

impl VerifyFailure {
    fn new(depth: usize, reason: impl Into<String>) -> Self {
        Self {
            depth,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (depth: {})", self.reason, self.depth)
    }
}

/// Evaluates peer certificates against the configured trust policy
pub struct TrustEvaluator {
    policy: ValidationPolicy,
    crl_policy: CrlPolicy,
    store: TrustStore,
    predicate: Option<AcceptancePredicate>,
}

impl TrustEvaluator {
    pub fn new(policy: ValidationPolicy, crl_policy: CrlPolicy, store: TrustStore) -> Self {
        Self {
            policy,
            crl_policy,
            store,
            predicate: None,
        }
    }

    /// Install the user acceptance predicate, called last on every decision
    pub fn with_acceptance_predicate(mut self, predicate: AcceptancePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn store(&self) -> &TrustStore {
        &self.store
    }

    /// Whether `certificate` is acceptable under the configured policy
    ///
    /// Chain verification runs first (unless the policy is `None`); the
    /// user predicate only runs once verification has passed or been
    /// skipped, so it can narrow but never override a chain failure.
    pub fn certificate_is_valid(&self, certificate: &Certificate) -> bool {
        if self.policy == ValidationPolicy::Default {
            if let Err(failure) = self.verify_chain(certificate) {
                warn!(
                    "Error when validating {}: {} (depth: {})",
                    certificate.subject(),
                    failure.reason,
                    failure.depth
                );
                return false;
            }
        }

        if let Some(predicate) = &self.predicate {
            return predicate(certificate);
        }

        true
    }

    /// Walk the chain from `leaf` up to a trusted self-signed root
    pub fn verify_chain(&self, leaf: &Certificate) -> Result<(), VerifyFailure> {
        let mut current = leaf.clone();
        let mut depth = 0usize;

        loop {
            if depth >= MAX_CHAIN_DEPTH {
                return Err(VerifyFailure::new(depth, "certificate chain too long"));
            }

            let parsed = current
                .parse()
                .map_err(|_| VerifyFailure::new(depth, "malformed certificate"))?;

            if !parsed.validity().is_valid() {
                return Err(VerifyFailure::new(
                    depth,
                    "certificate has expired or is not yet valid",
                ));
            }

            let check_crl = match self.crl_policy {
                CrlPolicy::None => false,
                CrlPolicy::Leaf => depth == 0,
                CrlPolicy::All => true,
            };
            if check_crl {
                self.check_revocation(&current, &parsed, depth)?;
            }

            if current.is_self_issued() {
                // The root of the chain must itself be a configured authority.
                if !self.store.contains(&current) {
                    let reason = if depth == 0 {
                        "self signed certificate"
                    } else {
                        "self signed certificate in certificate chain"
                    };
                    return Err(VerifyFailure::new(depth, reason));
                }

                parsed.verify_signature(None).map_err(|_| {
                    VerifyFailure::new(depth, "certificate signature failure")
                })?;

                debug!("Validating {}: OK", current.subject());
                return Ok(());
            }

            let issuer = self
                .store
                .find_issuer(current.issuer())
                .ok_or_else(|| {
                    VerifyFailure::new(depth, "unable to get local issuer certificate")
                })?
                .clone();

            let issuer_parsed = issuer
                .parse()
                .map_err(|_| VerifyFailure::new(depth, "malformed issuer certificate"))?;

            parsed
                .verify_signature(Some(issuer_parsed.public_key()))
                .map_err(|_| VerifyFailure::new(depth, "certificate signature failure"))?;

            debug!("Validating {}: OK", current.subject());

            current = issuer;
            depth += 1;
        }
    }

    /// Check `certificate` against the revocation lists of its issuer
    ///
    /// A missing CRL for the issuer is a failure, matching the strict
    /// CRL-check semantics of the configured policy.
    fn check_revocation(
        &self,
        certificate: &Certificate,
        parsed: &X509Certificate<'_>,
        depth: usize,
    ) -> Result<(), VerifyFailure> {
        let mut found_crl = false;

        for crl in self.store.crls_for(certificate.issuer()) {
            let crl_parsed = crl
                .parse()
                .map_err(|_| VerifyFailure::new(depth, "malformed certificate CRL"))?;
            found_crl = true;

            for revoked in crl_parsed.iter_revoked_certificates() {
                if revoked.raw_serial() == parsed.raw_serial() {
                    return Err(VerifyFailure::new(depth, "certificate revoked"));
                }
            }
        }

        if !found_crl {
            return Err(VerifyFailure::new(depth, "unable to get certificate CRL"));
        }

        Ok(())
    }
}

impl fmt::Debug for TrustEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustEvaluator")
            .field("policy", &self.policy)
            .field("crl_policy", &self.crl_policy)
            .field("authorities", &self.store.authorities().len())
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

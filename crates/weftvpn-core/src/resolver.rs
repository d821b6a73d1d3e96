//! Endpoint resolution
//!
//! Converts user-supplied endpoints into concrete transport addresses.
//! Literal endpoints resolve to themselves; hostnames go through DNS with
//! the configured protocol preference. When a query returns several
//! addresses the first one in iteration order wins.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::endpoint::{Endpoint, PeerAddress, DEFAULT_PORT};
use crate::error::{CoreError, CoreResult};

/// Which address families a resolution may return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionPreference {
    Any,
    Ipv4,
    Ipv6,
}

impl ResolutionPreference {
    fn admits(&self, address: &PeerAddress) -> bool {
        match self {
            Self::Any => true,
            Self::Ipv4 => address.is_ipv4(),
            Self::Ipv6 => address.is_ipv6(),
        }
    }
}

/// Resolution flags
///
/// `passive` marks the result as a bind address, allowing the unspecified
/// address; `address_configured` restricts results to families with a
/// configured local interface (delegated to the system resolver).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveMode {
    pub passive: bool,
    pub address_configured: bool,
}

impl ResolveMode {
    /// Resolving a peer to contact
    pub const CONTACT: Self = Self {
        passive: false,
        address_configured: true,
    };

    /// Resolving the local listen address
    pub const LISTEN: Self = Self {
        passive: true,
        address_configured: true,
    };
}

/// Endpoint resolver
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolve `endpoint` to a single transport address
    async fn resolve(
        &self,
        endpoint: &Endpoint,
        preference: ResolutionPreference,
        mode: ResolveMode,
    ) -> CoreResult<PeerAddress>;
}

/// System resolver backed by `tokio::net::lookup_host`
///
/// Never panics into the scheduler: every failure surfaces as a
/// `CoreError::Resolution` for the caller to log and drop.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl Resolve for DnsResolver {
    async fn resolve(
        &self,
        endpoint: &Endpoint,
        preference: ResolutionPreference,
        mode: ResolveMode,
    ) -> CoreResult<PeerAddress> {
        match endpoint {
            Endpoint::Address(address) => {
                if !preference.admits(address) {
                    return Err(CoreError::Resolution {
                        endpoint: endpoint.to_string(),
                        message: "address family excluded by resolution preference".into(),
                    });
                }
                if !mode.passive && address.ip().is_unspecified() {
                    return Err(CoreError::Resolution {
                        endpoint: endpoint.to_string(),
                        message: "cannot contact the unspecified address".into(),
                    });
                }
                Ok(*address)
            }
            Endpoint::Host { name, port } => {
                let port = port.unwrap_or(DEFAULT_PORT);
                let addresses = tokio::net::lookup_host((name.as_str(), port))
                    .await
                    .map_err(|e| CoreError::Resolution {
                        endpoint: endpoint.to_string(),
                        message: e.to_string(),
                    })?;

                addresses
                    .map(PeerAddress::from)
                    .find(|a| preference.admits(a))
                    .ok_or_else(|| CoreError::Resolution {
                        endpoint: endpoint.to_string(),
                        message: "no address of the requested family".into(),
                    })
            }
        }
    }
}

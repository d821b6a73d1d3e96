//! Coordinator configuration
//!
//! Immutable for the lifetime of an opened core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use weftvpn_trust::{Certificate, CrlPolicy, Identity, RevocationList, ValidationPolicy};

use crate::admission::IpNetwork;
use crate::channel::CipherSuite;
use crate::endpoint::Endpoint;
use crate::error::{CoreError, CoreResult};
use crate::resolver::ResolutionPreference;
use crate::{CONTACT_PERIOD, DYNAMIC_CONTACT_PERIOD};

/// Virtual adapter mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterMode {
    /// L2: Ethernet frames through a switch
    Tap,
    /// L3: IP packets through a router
    Tun,
}

/// Core protocol configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Address families hostname resolution may return
    pub resolution: ResolutionPreference,

    /// Local listen locator
    pub listen_on: Endpoint,

    /// Static contact list, contacted on every contact tick
    pub contact_list: Vec<Endpoint>,

    /// Certificates of hosts to locate through contact requests
    pub dynamic_contact_list: Vec<Certificate>,

    /// Never-contact rules
    pub never_contact_list: Vec<IpNetwork>,

    /// Answer contact requests from peers
    pub accept_contact_requests: bool,

    /// Act on contacts reported by peers
    pub accept_contacts: bool,

    /// Static contact loop period
    pub contact_period: Duration,

    /// Dynamic contact loop period
    pub dynamic_contact_period: Duration,

    /// How long to wait for a hello reply
    pub hello_timeout: Duration,

    /// Adapter mode (switch vs router fabric)
    pub adapter_mode: AdapterMode,

    /// Cipher suites advertised to peers
    pub cipher_capabilities: Vec<CipherSuite>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            resolution: ResolutionPreference::Any,
            listen_on: Endpoint::host("0.0.0.0", None),
            contact_list: Vec::new(),
            dynamic_contact_list: Vec::new(),
            never_contact_list: Vec::new(),
            accept_contact_requests: true,
            accept_contacts: true,
            contact_period: CONTACT_PERIOD,
            dynamic_contact_period: DYNAMIC_CONTACT_PERIOD,
            hello_timeout: Duration::from_secs(3),
            adapter_mode: AdapterMode::Tap,
            cipher_capabilities: CipherSuite::all(),
        }
    }
}

impl CoreConfig {
    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.contact_period.is_zero() {
            return Err(CoreError::Configuration(
                "contact period must be non-zero".into(),
            ));
        }
        if self.dynamic_contact_period.is_zero() {
            return Err(CoreError::Configuration(
                "dynamic contact period must be non-zero".into(),
            ));
        }
        if self.cipher_capabilities.is_empty() {
            return Err(CoreError::Configuration(
                "at least one cipher suite is required".into(),
            ));
        }
        Ok(())
    }
}

/// Security configuration
///
/// Not serializable: the identity carries private key material. The user
/// acceptance predicate is installed on the core directly, not here.
#[derive(Clone, Debug, Default)]
pub struct SecurityConfig {
    /// Local identity; required at open
    pub identity: Option<Identity>,

    /// Certificate validation policy
    pub validation: ValidationPolicy,

    /// Revocation checking policy
    pub crl_validation: CrlPolicy,

    /// Trusted certificate authorities
    pub authorities: Vec<Certificate>,

    /// Certificate revocation lists
    pub revocation_lists: Vec<RevocationList>,
}

impl SecurityConfig {
    pub fn with_identity(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
            ..Self::default()
        }
    }
}

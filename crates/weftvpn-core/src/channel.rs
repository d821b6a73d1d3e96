//! Secure channel engine interface
//!
//! The coordinator holds exactly one engine. The engine owns handshakes,
//! key exchange and authenticated encryption; the coordinator only issues
//! the async operations below and receives events through its `handle_*`
//! methods.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::endpoint::PeerAddress;
use crate::error::ChannelError;
use weftvpn_trust::CertificateFingerprint;

/// Cipher suites the secure channel can negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherSuite {
    Aes128GcmSha256,
    Aes256GcmSha384,
    ChaCha20Poly1305Sha256,
}

impl CipherSuite {
    /// All suites this build supports, strongest first
    pub fn all() -> Vec<Self> {
        vec![
            Self::ChaCha20Poly1305Sha256,
            Self::Aes256GcmSha384,
            Self::Aes128GcmSha256,
        ]
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Aes128GcmSha256 => "aes128-gcm-sha256",
            Self::Aes256GcmSha384 => "aes256-gcm-sha384",
            Self::ChaCha20Poly1305Sha256 => "chacha20-poly1305-sha256",
        };
        write!(f, "{name}")
    }
}

/// Negotiated algorithm information reported with session events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmInfo {
    pub cipher: CipherSuite,
}

impl fmt::Display for AlgorithmInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cipher: {}", self.cipher)
    }
}

/// The secure channel engine, as consumed by the coordinator
#[async_trait]
pub trait ChannelEngine: Send + Sync {
    /// Start listening on the given address
    async fn open(&self, listen: PeerAddress) -> Result<(), ChannelError>;

    /// Stop the engine; pending sends complete or fail, no new events fire
    async fn close(&self) -> Result<(), ChannelError>;

    /// Advertise the cipher suites this node accepts
    fn set_cipher_capabilities(&self, capabilities: Vec<CipherSuite>);

    /// Send a hello and wait for the reply, measuring latency
    ///
    /// A missing reply is reported as `ChannelError::HelloTimeout`, which
    /// the contact scheduler logs differently from send failures.
    async fn greet(&self, target: PeerAddress) -> Result<Duration, ChannelError>;

    /// Present our certificates to the target
    async fn introduce_to(&self, target: PeerAddress) -> Result<(), ChannelError>;

    /// Ask the target to negotiate a session
    async fn request_session(&self, target: PeerAddress) -> Result<(), ChannelError>;

    /// Peers the engine currently holds any state for
    async fn known_peers(&self) -> Vec<PeerAddress>;

    /// Ask one peer whether it knows hosts matching the given fingerprints
    async fn send_contact_request(
        &self,
        target: PeerAddress,
        fingerprints: &[CertificateFingerprint],
    ) -> Result<(), ChannelError>;

    /// Send an authenticated payload on the given channel
    async fn send_data(
        &self,
        target: PeerAddress,
        channel: u8,
        data: Bytes,
    ) -> Result<(), ChannelError>;
}

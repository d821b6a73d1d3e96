//! Per-peer protocol state
//!
//! The coordinator observes a coarse state machine per peer; the secure
//! channel engine owns the finer-grained handshake states. Handlers for
//! the same peer are serialized on the entry's record lock (the per-peer
//! strand), so presentation validation and session events never race.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use weftvpn_trust::Certificate;

use crate::endpoint::PeerAddress;
use crate::fabric::PortHandle;

/// Coordinator-visible protocol state for one peer
///
/// Hello and introduction exchanges live entirely in the engine; the
/// coordinator starts tracking a peer once its presentation is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No relationship
    None,
    /// Presentation received and accepted
    Presented,
    /// Session established
    SessionUp,
    /// Session renewal in progress
    SessionRenewing,
}

/// A remote peer's certificates, observed during presentation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub signature: Certificate,
    pub cipherment: Certificate,
}

/// Dynamic per-peer state
#[derive(Debug)]
pub struct PeerRecord {
    pub state: PeerState,
    pub identity: Option<PeerIdentity>,
    pub last_contact: Option<Instant>,
    pub latency: Option<Duration>,
    pub port: Option<PortHandle>,
    /// Incremented on each new (not renewed) session
    pub generation: u64,
}

impl PeerRecord {
    pub fn new() -> Self {
        Self {
            state: PeerState::None,
            identity: None,
            last_contact: None,
            latency: None,
            port: None,
            generation: 0,
        }
    }
}

impl Default for PeerRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer's table entry; the record lock is the per-peer strand
pub struct PeerEntry {
    pub record: Mutex<PeerRecord>,
}

impl PeerEntry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            record: Mutex::new(PeerRecord::new()),
        })
    }
}

/// Table of known peers
///
/// An entry exists only while the secure channel engine holds durable
/// state for that peer: it is created when a presentation is accepted
/// and removed on `session-lost` (or a failed new session). Hello-only
/// peers never appear here, so scanning hosts cannot grow the table.
#[derive(Default)]
pub struct PeerTable {
    entries: RwLock<HashMap<PeerAddress, Arc<PeerEntry>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the entry for `peer`
    pub async fn entry(&self, peer: PeerAddress) -> Arc<PeerEntry> {
        if let Some(entry) = self.entries.read().await.get(&peer) {
            return Arc::clone(entry);
        }

        let mut entries = self.entries.write().await;
        Arc::clone(entries.entry(peer).or_insert_with(PeerEntry::new))
    }

    pub async fn get(&self, peer: &PeerAddress) -> Option<Arc<PeerEntry>> {
        self.entries.read().await.get(peer).map(Arc::clone)
    }

    pub async fn remove(&self, peer: &PeerAddress) -> Option<Arc<PeerEntry>> {
        self.entries.write().await.remove(peer)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

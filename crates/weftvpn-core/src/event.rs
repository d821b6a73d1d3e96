//! User-visible coordinator events

use crate::channel::AlgorithmInfo;
use crate::endpoint::PeerAddress;

/// Event delivered to the embedder's channel, when one is configured
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// A session was established (or renewed) with a peer
    SessionEstablished {
        peer: PeerAddress,
        is_new: bool,
        local: AlgorithmInfo,
        remote: AlgorithmInfo,
    },

    /// Session establishment or renewal failed
    SessionFailed {
        peer: PeerAddress,
        is_new: bool,
        local: AlgorithmInfo,
        remote: AlgorithmInfo,
    },

    /// The session with a peer ended
    SessionLost { peer: PeerAddress },
}

impl CoreEvent {
    /// The peer this event concerns
    pub fn peer(&self) -> PeerAddress {
        match self {
            Self::SessionEstablished { peer, .. }
            | Self::SessionFailed { peer, .. }
            | Self::SessionLost { peer } => *peer,
        }
    }
}

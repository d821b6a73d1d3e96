//! Switch/router fabric interface
//!
//! The fabric is the local switching (L2) or routing (L3) component above
//! the virtual adapter. The coordinator registers one port per peer with
//! an established session; the port's egress closure injects frames back
//! into the secure channel on the frames channel.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;

use crate::endpoint::PeerAddress;
use crate::error::ChannelError;

/// Future returned by a port's egress closure
pub type EgressFuture = Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send>>;

/// Egress closure: injects one frame toward the port's peer
pub type Egress = Box<dyn Fn(Bytes) -> EgressFuture + Send + Sync>;

/// Fabric port groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortGroup {
    /// Ports toward remote peers
    Endpoints,
    /// Ports toward local virtual adapters
    TapAdapters,
}

/// Opaque reference to a registered fabric port
///
/// Returned by `Fabric::register_port`; required for deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle(u64);

impl PortHandle {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// A fabric port representing traffic toward one peer
pub struct EndpointPort {
    peer: PeerAddress,
    egress: Egress,
}

impl EndpointPort {
    pub fn new(peer: PeerAddress, egress: Egress) -> Self {
        Self { peer, egress }
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    /// Inject a frame into the secure channel toward the peer
    pub async fn inject(&self, frame: Bytes) -> Result<(), ChannelError> {
        (self.egress)(frame).await
    }
}

impl fmt::Debug for EndpointPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointPort").field("peer", &self.peer).finish()
    }
}

/// The local switch or router fabric
pub trait Fabric: Send + Sync {
    /// Register a port under the given group, returning its handle
    fn register_port(&self, port: EndpointPort, group: PortGroup) -> PortHandle;

    /// Unregister a previously registered port
    ///
    /// Returns false if the handle was not registered (already removed).
    fn unregister_port(&self, handle: PortHandle) -> bool;
}

/// Consumer of authenticated frame payloads (the adapter side)
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Deliver one frame received from `from`
    ///
    /// Ownership of the buffer transfers to the sink.
    async fn deliver(&self, from: PeerAddress, frame: Bytes);
}

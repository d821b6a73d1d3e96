//! Per-peer port registry
//!
//! Tracks the fabric port registered for each peer with an established
//! session. Switch ports (L2) and router ports (L3) live in disjoint maps;
//! only the configured adapter mode's map is ever populated.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::AdapterMode;
use crate::endpoint::PeerAddress;
use crate::fabric::{EndpointPort, Fabric, PortGroup, PortHandle};

/// Registry of per-peer fabric ports
pub struct PortRegistry {
    mode: AdapterMode,
    fabric: Arc<dyn Fabric>,
    switch_ports: Mutex<HashMap<PeerAddress, PortHandle>>,
    router_ports: Mutex<HashMap<PeerAddress, PortHandle>>,
}

impl PortRegistry {
    pub fn new(mode: AdapterMode, fabric: Arc<dyn Fabric>) -> Self {
        Self {
            mode,
            fabric,
            switch_ports: Mutex::new(HashMap::new()),
            router_ports: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> AdapterMode {
        self.mode
    }

    fn map(&self) -> &Mutex<HashMap<PeerAddress, PortHandle>> {
        match self.mode {
            AdapterMode::Tap => &self.switch_ports,
            AdapterMode::Tun => &self.router_ports,
        }
    }

    /// Register a port for `peer` under the endpoints group
    ///
    /// A stale registration for the same peer is deregistered first, in
    /// the same critical section, so a rapid lost/up sequence can never
    /// leave two live ports for one peer.
    pub fn bind(&self, peer: PeerAddress, port: EndpointPort) -> PortHandle {
        let mut map = self.map().lock();

        if let Some(stale) = map.remove(&peer) {
            debug!("Replacing stale {} for {}", stale, peer);
            self.fabric.unregister_port(stale);
        }

        let handle = self.fabric.register_port(port, PortGroup::Endpoints);
        map.insert(peer, handle);
        handle
    }

    /// Deregister and drop the port for `peer`, if any
    pub fn release(&self, peer: &PeerAddress) -> Option<PortHandle> {
        let handle = self.map().lock().remove(peer)?;
        self.fabric.unregister_port(handle);
        Some(handle)
    }

    /// The live handle for `peer`, if a port is registered
    pub fn handle(&self, peer: &PeerAddress) -> Option<PortHandle> {
        self.map().lock().get(peer).copied()
    }

    /// Number of live port registrations
    pub fn len(&self) -> usize {
        self.map().lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

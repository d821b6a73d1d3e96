//! The node coordinator
//!
//! Connects the secure channel engine, resolver, trust evaluator,
//! admission filter and fabric into a working node: contacts configured
//! peers on a schedule, drives the per-peer session lifecycle from engine
//! callbacks, and binds fabric ports as sessions come and go.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at};
use tracing::{debug, info, warn};

use weftvpn_trust::{
    AcceptancePredicate, Certificate, CertificateFingerprint, Identity, TrustEvaluator, TrustStore,
};

use crate::admission::AddressFilter;
use crate::channel::{AlgorithmInfo, ChannelEngine, CipherSuite};
use crate::config::{CoreConfig, SecurityConfig};
use crate::dispatch::{Demultiplexer, MessageHandler};
use crate::endpoint::{Endpoint, PeerAddress};
use crate::error::{ChannelError, CoreError, CoreResult};
use crate::event::CoreEvent;
use crate::fabric::{EgressFuture, EndpointPort, Fabric, FrameSink};
use crate::gather::ResultsGatherer;
use crate::peer::{PeerIdentity, PeerState, PeerTable};
use crate::ports::PortRegistry;
use crate::resolver::{Resolve, ResolveMode};
use crate::CHANNEL_FRAMES;

/// Coordinator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Closed,
    Open,
}

/// External collaborators wired into the coordinator
pub struct Collaborators {
    /// The secure channel engine (exactly one)
    pub engine: Arc<dyn ChannelEngine>,

    /// Endpoint resolver
    pub resolver: Arc<dyn Resolve>,

    /// Switch (L2) or router (L3) fabric, per the configured adapter mode
    pub fabric: Arc<dyn Fabric>,

    /// Frame consumer in L2 mode
    pub ethernet_sink: Option<Arc<dyn FrameSink>>,

    /// Frame consumer in L3 mode
    pub ip_sink: Option<Arc<dyn FrameSink>>,

    /// Consumer of parsed control messages
    pub message_handler: Option<Arc<dyn MessageHandler>>,

    /// Session lifecycle events for the embedder
    pub events: Option<mpsc::Sender<CoreEvent>>,

    /// User certificate acceptance predicate, run after chain verification
    pub acceptance_predicate: Option<AcceptancePredicate>,
}

/// The node coordinator
pub struct Core {
    config: CoreConfig,
    identity: Option<Identity>,
    engine: Arc<dyn ChannelEngine>,
    resolver: Arc<dyn Resolve>,
    trust: TrustEvaluator,
    filter: AddressFilter,
    ports: PortRegistry,
    demux: Demultiplexer,
    peers: PeerTable,
    state: RwLock<CoreState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: Option<mpsc::Sender<CoreEvent>>,
}

impl Core {
    /// Create a closed coordinator from configuration and collaborators
    pub fn new(
        config: CoreConfig,
        security: SecurityConfig,
        collaborators: Collaborators,
    ) -> CoreResult<Arc<Self>> {
        config.validate()?;

        let mut store = TrustStore::with_authorities(security.authorities);
        for crl in security.revocation_lists {
            store.add_revocation_list(crl);
        }

        let mut trust = TrustEvaluator::new(security.validation, security.crl_validation, store);
        if let Some(predicate) = collaborators.acceptance_predicate {
            trust = trust.with_acceptance_predicate(predicate);
        }

        let filter = AddressFilter::new(config.never_contact_list.clone());
        let ports = PortRegistry::new(config.adapter_mode, Arc::clone(&collaborators.fabric));
        let demux = Demultiplexer::new(
            config.adapter_mode,
            collaborators.ethernet_sink,
            collaborators.ip_sink,
            collaborators.message_handler,
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            identity: security.identity,
            engine: collaborators.engine,
            resolver: collaborators.resolver,
            trust,
            filter,
            ports,
            demux,
            peers: PeerTable::new(),
            state: RwLock::new(CoreState::Closed),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            events: collaborators.events,
        }))
    }

    /// Current lifecycle state
    pub async fn state(&self) -> CoreState {
        *self.state.read().await
    }

    async fn is_open(&self) -> bool {
        *self.state.read().await == CoreState::Open
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The configured local identity, if any
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    /// Open the coordinator: bind the engine and start the contact loops
    ///
    /// Fails without side effects when no identity is configured.
    pub async fn open(self: &Arc<Self>) -> CoreResult<()> {
        debug!("Opening core...");

        {
            let state = self.state.read().await;
            if *state == CoreState::Open {
                return Err(CoreError::AlreadyOpen);
            }
        }

        if self.identity.is_none() {
            return Err(CoreError::Configuration(
                "no user certificate or private key set".into(),
            ));
        }

        let listen = self
            .resolver
            .resolve(
                &self.config.listen_on,
                self.config.resolution,
                ResolveMode::LISTEN,
            )
            .await?;

        info!("Core set to listen on: {}", listen);

        for rule in self.filter.rules() {
            info!("Configured not to accept requests from: {}", rule);
        }

        self.engine
            .set_cipher_capabilities(self.config.cipher_capabilities.clone());
        self.engine.open(listen).await?;

        let _ = self.shutdown.send(false);
        *self.state.write().await = CoreState::Open;

        self.spawn_contact_loop();
        self.spawn_dynamic_contact_loop();

        debug!("Core opened.");
        Ok(())
    }

    /// Close the coordinator
    ///
    /// Flips the state first so every handler still in flight observes
    /// Closed and becomes a no-op, cancels both contact loops, waits for
    /// them to exit, then closes the engine.
    pub async fn close(&self) -> CoreResult<()> {
        debug!("Closing core...");

        {
            let mut state = self.state.write().await;
            if *state == CoreState::Closed {
                return Ok(());
            }
            *state = CoreState::Closed;
        }

        let _ = self.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.engine.close().await?;

        debug!("Core closed.");
        Ok(())
    }

    // =====================
    // Contact scheduling
    // =====================

    /// Static contact loop: every tick, contact the whole contact list
    ///
    /// The first tick fires immediately, giving the initial contact burst
    /// at open. Cancellation is terminal: once the shutdown signal trips,
    /// the loop never re-arms.
    fn spawn_contact_loop(self: &Arc<Self>) {
        let core = Arc::clone(self);
        let period = self.config.contact_period;

        let handle = tokio::spawn(async move {
            debug!("Contact loop started");

            let mut ticker = interval(period);
            let mut shutdown = core.shutdown.subscribe();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !core.is_open().await {
                            break;
                        }
                        core.contact_all().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }

            debug!("Contact loop stopped");
        });

        self.tasks.lock().push(handle);
    }

    /// Dynamic contact loop: every tick, ask all known peers about the
    /// dynamic contact list. The first tick fires one full period after
    /// open; only the static loop contacts immediately.
    fn spawn_dynamic_contact_loop(self: &Arc<Self>) {
        let core = Arc::clone(self);
        let period = self.config.dynamic_contact_period;

        let handle = tokio::spawn(async move {
            debug!("Dynamic contact loop started");

            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            let mut shutdown = core.shutdown.subscribe();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !core.is_open().await {
                            break;
                        }
                        core.dynamic_contact_all().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }

            debug!("Dynamic contact loop stopped");
        });

        self.tasks.lock().push(handle);
    }

    /// Contact every endpoint in the static contact list
    async fn contact_all(self: &Arc<Self>) {
        for endpoint in self.config.contact_list.clone() {
            let core = Arc::clone(self);
            tokio::spawn(async move {
                core.contact(&endpoint).await;
            });
        }
    }

    /// Resolve `endpoint`, greet the resolved address, and introduce
    /// ourselves on reply
    ///
    /// Failures are logged and dropped; the next tick retries.
    pub async fn contact(self: &Arc<Self>, endpoint: &Endpoint) {
        if !self.is_open().await {
            return;
        }

        let address = match self
            .resolver
            .resolve(endpoint, self.config.resolution, ResolveMode::CONTACT)
            .await
        {
            Ok(address) => address,
            Err(e) => {
                debug!("Unable to resolve {}: {}", endpoint, e);
                return;
            }
        };

        match self.engine.greet(address).await {
            Ok(latency) => {
                if !self.is_open().await {
                    return;
                }

                debug!(
                    "Received hello response from {} at {}. Latency: {:?}",
                    endpoint, address, latency
                );

                // Refresh liveness data for a peer we already track; a mere
                // hello exchange creates no coordinator state.
                if let Some(entry) = self.peers.get(&address).await {
                    let mut record = entry.record.lock().await;
                    record.last_contact = Some(Instant::now());
                    record.latency = Some(latency);
                }

                self.introduce_to(address).await;
            }
            Err(ChannelError::HelloTimeout { timeout }) => {
                debug!(
                    "Received no hello response from {} at {} (timeout: {:?})",
                    endpoint, address, timeout
                );
            }
            Err(e) => {
                debug!("Unable to send hello to {}: {}", endpoint, e);
            }
        }
    }

    /// Present our certificates to `target`
    async fn introduce_to(&self, target: PeerAddress) {
        if !self.is_open().await {
            return;
        }

        if let Err(e) = self.engine.introduce_to(target).await {
            warn!("Error sending introduction message to {}: {}", target, e);
        }
    }

    /// Ask `target` to negotiate a session
    async fn request_session_with(&self, target: PeerAddress) {
        if !self.is_open().await {
            return;
        }

        if let Err(e) = self.engine.request_session(target).await {
            warn!("Error requesting session to {}: {}", target, e);
        }
    }

    /// Project the dynamic contact list to fingerprints and ask every
    /// currently known peer about them
    ///
    /// The per-peer sends are fanned out as independent tasks and joined
    /// through a results gatherer; the completed map is logged entry by
    /// entry.
    async fn dynamic_contact_all(self: &Arc<Self>) {
        if self.config.dynamic_contact_list.is_empty() {
            return;
        }

        let fingerprints: Vec<CertificateFingerprint> = self
            .config
            .dynamic_contact_list
            .iter()
            .map(Certificate::fingerprint)
            .collect();

        let peers: HashSet<PeerAddress> = self.engine.known_peers().await.into_iter().collect();
        if peers.is_empty() {
            return;
        }

        let (gatherer, done) = ResultsGatherer::new(peers.iter().copied());

        for peer in peers {
            let core = Arc::clone(self);
            let gatherer = Arc::clone(&gatherer);
            let fingerprints = fingerprints.clone();
            tokio::spawn(async move {
                let result = core.engine.send_contact_request(peer, &fingerprints).await;
                gatherer.gather(peer, result);
            });
        }

        if let Ok(results) = done.await {
            for (peer, result) in results {
                if let Err(e) = result {
                    warn!("Error sending contact request to {}: {}", peer, e);
                }
            }
        }
    }

    // =====================
    // Engine callbacks
    // =====================

    /// A hello request arrived
    ///
    /// Returns whether the engine should answer it.
    pub async fn handle_hello_received(
        self: &Arc<Self>,
        sender: PeerAddress,
        default_accept: bool,
    ) -> bool {
        if !self.is_open().await {
            return false;
        }

        debug!("Received hello request from {}.", sender);

        let mut accept = default_accept;

        if self.filter.is_banned(sender.ip()) {
            warn!("Ignoring hello request from {} as it is a banned host.", sender);
            accept = false;
        }

        if accept {
            // No record yet: coordinator state for a peer begins with an
            // accepted presentation, not a hello.
            let core = Arc::clone(self);
            tokio::spawn(async move {
                core.introduce_to(sender).await;
            });
        }

        accept
    }

    /// A peer asks us to reveal whether we know a host
    pub async fn handle_contact_request_received(
        &self,
        sender: PeerAddress,
        certificate: &Certificate,
        fingerprint: CertificateFingerprint,
        answer: PeerAddress,
    ) -> bool {
        if !self.is_open().await {
            return false;
        }

        if self.config.accept_contact_requests {
            info!(
                "Received contact request from {} for {} ({}). Host is at: {}",
                sender,
                certificate.subject(),
                fingerprint,
                answer
            );
            true
        } else {
            false
        }
    }

    /// A peer reports where a requested host lives
    pub async fn handle_contact_received(
        self: &Arc<Self>,
        sender: PeerAddress,
        fingerprint: CertificateFingerprint,
        answer: PeerAddress,
    ) {
        if !self.is_open().await {
            return;
        }

        if !self.config.accept_contacts {
            return;
        }

        if self.filter.is_banned(answer.ip()) {
            warn!(
                "Received forbidden contact from {}: {} is at {} but won't be contacted.",
                sender, fingerprint, answer
            );
            return;
        }

        info!("Received contact from {}: {} is at: {}", sender, fingerprint, answer);

        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.contact(&Endpoint::Address(answer)).await;
        });
    }

    /// A peer presented its certificates
    ///
    /// Both certificates go through the trust evaluator; acceptance
    /// creates the peer's record and schedules a session request. The
    /// record mutation happens under the peer's strand, so it cannot
    /// race the session events for the same peer.
    pub async fn handle_presentation_received(
        self: &Arc<Self>,
        sender: PeerAddress,
        signature_certificate: &Certificate,
        cipherment_certificate: &Certificate,
        is_new: bool,
    ) -> bool {
        if !self.is_open().await {
            return false;
        }

        debug!(
            "Received presentation from {}. Signature: {}. Cipherment: {}. New presentation: {}.",
            sender,
            signature_certificate.subject(),
            cipherment_certificate.subject(),
            is_new
        );

        if self.filter.is_banned(sender.ip()) {
            warn!("Ignoring presentation from {} as it is a banned host.", sender);
            return false;
        }

        if self.trust.certificate_is_valid(signature_certificate)
            && self.trust.certificate_is_valid(cipherment_certificate)
        {
            // First coordinator state for this peer: from here on the
            // engine holds its presentation, so the record's lifetime
            // matches the engine's.
            let entry = self.peers.entry(sender).await;
            let mut record = entry.record.lock().await;
            record.identity = Some(PeerIdentity {
                signature: signature_certificate.clone(),
                cipherment: cipherment_certificate.clone(),
            });
            record.last_contact = Some(Instant::now());
            if record.state == PeerState::None {
                record.state = PeerState::Presented;
            }
            drop(record);

            let core = Arc::clone(self);
            tokio::spawn(async move {
                core.request_session_with(sender).await;
            });

            return true;
        }

        false
    }

    /// A peer asks to negotiate a session; the engine's default stands
    /// unless policy said otherwise earlier in the exchange
    pub async fn handle_session_request_received(
        &self,
        sender: PeerAddress,
        capabilities: &[CipherSuite],
        default_accept: bool,
    ) -> bool {
        if !self.is_open().await {
            return false;
        }

        debug!(
            "Received session request from {} (default: {}).",
            sender,
            if default_accept { "accept" } else { "deny" }
        );
        debug!(
            "Cipher algorithm capabilities: {}",
            capabilities
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        );

        if let Some(entry) = self.peers.get(&sender).await {
            let mut record = entry.record.lock().await;
            if record.state == PeerState::SessionUp {
                record.state = PeerState::SessionRenewing;
            }
        }

        default_accept
    }

    /// The peer answered our session request with its chosen cipher
    pub async fn handle_session_received(
        &self,
        sender: PeerAddress,
        cipher: CipherSuite,
        default_accept: bool,
    ) -> bool {
        if !self.is_open().await {
            return false;
        }

        debug!(
            "Received session from {} (default: {}).",
            sender,
            if default_accept { "accept" } else { "deny" }
        );
        debug!("Cipher algorithm: {}", cipher);

        if let Some(entry) = self.peers.get(&sender).await {
            let mut record = entry.record.lock().await;
            if record.state == PeerState::SessionUp {
                record.state = PeerState::SessionRenewing;
            }
        }

        default_accept
    }

    /// A session came up (or was renewed)
    ///
    /// Only the true None -> SessionUp edge registers a fabric port; a
    /// renewal keeps the existing one.
    pub async fn handle_session_established(
        self: &Arc<Self>,
        host: PeerAddress,
        is_new: bool,
        local: AlgorithmInfo,
        remote: AlgorithmInfo,
    ) {
        if !self.is_open().await {
            return;
        }

        if is_new {
            info!("Session established with {}.", host);
        } else {
            info!("Session renewed with {}.", host);
        }
        info!("Local algorithms: {}", local);
        info!("Remote algorithms: {}", remote);

        {
            let entry = self.peers.entry(host).await;
            let mut record = entry.record.lock().await;

            if is_new {
                record.generation += 1;

                let engine = Arc::clone(&self.engine);
                let port = EndpointPort::new(
                    host,
                    Box::new(move |frame: Bytes| {
                        let engine = Arc::clone(&engine);
                        Box::pin(async move {
                            engine.send_data(host, CHANNEL_FRAMES, frame).await
                        }) as EgressFuture
                    }),
                );

                let handle = self.ports.bind(host, port);
                record.port = Some(handle);

                if let Some(identity) = &record.identity {
                    debug!("Peer {} is {}", host, identity.signature.subject());
                }
            }

            record.state = PeerState::SessionUp;
        }

        self.emit(CoreEvent::SessionEstablished {
            peer: host,
            is_new,
            local,
            remote,
        })
        .await;
    }

    /// Session establishment or renewal failed
    pub async fn handle_session_failed(
        &self,
        host: PeerAddress,
        is_new: bool,
        local: AlgorithmInfo,
        remote: AlgorithmInfo,
    ) {
        if !self.is_open().await {
            return;
        }

        if is_new {
            warn!("Session establishment with {} failed.", host);
        } else {
            warn!("Session renewal with {} failed.", host);
        }
        warn!("Local algorithms: {}", local);
        warn!("Remote algorithms: {}", remote);

        if is_new {
            // The engine holds no session state for this peer anymore.
            if let Some(entry) = self.peers.get(&host).await {
                let record = entry.record.lock().await;
                if record.port.is_none() {
                    drop(record);
                    self.peers.remove(&host).await;
                }
            }
        }

        self.emit(CoreEvent::SessionFailed {
            peer: host,
            is_new,
            local,
            remote,
        })
        .await;
    }

    /// The session with a peer ended
    ///
    /// Deregisters the peer's fabric port, if any, and drops the record.
    /// A repeated loss for the same peer is a true no-op: no log, no event,
    /// so every established session pairs with exactly one lost event.
    pub async fn handle_session_lost(&self, host: PeerAddress) {
        if !self.is_open().await {
            return;
        }

        let Some(entry) = self.peers.get(&host).await else {
            return;
        };

        info!("Session with {} lost.", host);

        {
            let mut record = entry.record.lock().await;
            if record.port.take().is_some() {
                self.ports.release(&host);
            }
            record.state = PeerState::None;
        }
        self.peers.remove(&host).await;

        self.emit(CoreEvent::SessionLost { peer: host }).await;
    }

    /// Authenticated data arrived on a channel
    pub async fn handle_data_received(&self, sender: PeerAddress, channel: u8, data: Bytes) {
        if !self.is_open().await {
            return;
        }

        self.demux.dispatch(sender, channel, data).await;
    }

    async fn emit(&self, event: CoreEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    use weftvpn_trust::{CrlPolicy, PrivateKey, ValidationPolicy};

    use crate::fabric::{PortGroup, PortHandle};
    use crate::resolver::ResolutionPreference;

    fn addr(ip: [u8; 4], port: u16) -> PeerAddress {
        PeerAddress::new(IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])), port)
    }

    fn fingerprint() -> CertificateFingerprint {
        CertificateFingerprint::from_bytes([7; 32])
    }

    fn algorithms() -> AlgorithmInfo {
        AlgorithmInfo {
            cipher: CipherSuite::ChaCha20Poly1305Sha256,
        }
    }

    fn test_certificate(cn: &str) -> Certificate {
        use rcgen::{CertificateParams, DnType, DnValue, KeyPair};

        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
        Certificate::from_der(params.self_signed(&key).unwrap().der().to_vec()).unwrap()
    }

    fn test_identity() -> Identity {
        use rcgen::{CertificateParams, DnType, DnValue, KeyPair};

        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.distinguished_name.push(
            DnType::CommonName,
            DnValue::Utf8String("local.weft.test".to_string()),
        );
        let cert = params.self_signed(&key).unwrap();

        Identity::from_single(
            Certificate::from_der(cert.der().to_vec()).unwrap(),
            PrivateKey::from_der(key.serialize_der()),
        )
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum EngineOp {
        Open(PeerAddress),
        Close,
        Greet(PeerAddress),
        IntroduceTo(PeerAddress),
        RequestSession(PeerAddress),
        ContactRequest(PeerAddress, usize),
        SendData(PeerAddress, u8, usize),
    }

    #[derive(Default)]
    struct MockEngine {
        ops: Mutex<Vec<EngineOp>>,
        greet_results: Mutex<HashMap<PeerAddress, ChannelError>>,
        introduce_error: Mutex<Option<ChannelError>>,
        known: Mutex<Vec<PeerAddress>>,
    }

    impl MockEngine {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn ops(&self) -> Vec<EngineOp> {
            self.ops.lock().clone()
        }

        fn count(&self, matches: impl Fn(&EngineOp) -> bool) -> usize {
            self.ops.lock().iter().filter(|op| matches(op)).count()
        }

        fn fail_greet(&self, target: PeerAddress, error: ChannelError) {
            self.greet_results.lock().insert(target, error);
        }
    }

    #[async_trait]
    impl ChannelEngine for MockEngine {
        async fn open(&self, listen: PeerAddress) -> Result<(), ChannelError> {
            self.ops.lock().push(EngineOp::Open(listen));
            Ok(())
        }

        async fn close(&self) -> Result<(), ChannelError> {
            self.ops.lock().push(EngineOp::Close);
            Ok(())
        }

        fn set_cipher_capabilities(&self, _capabilities: Vec<CipherSuite>) {}

        async fn greet(&self, target: PeerAddress) -> Result<Duration, ChannelError> {
            self.ops.lock().push(EngineOp::Greet(target));
            match self.greet_results.lock().get(&target) {
                Some(error) => Err(error.clone()),
                None => Ok(Duration::from_millis(5)),
            }
        }

        async fn introduce_to(&self, target: PeerAddress) -> Result<(), ChannelError> {
            self.ops.lock().push(EngineOp::IntroduceTo(target));
            match self.introduce_error.lock().clone() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }

        async fn request_session(&self, target: PeerAddress) -> Result<(), ChannelError> {
            self.ops.lock().push(EngineOp::RequestSession(target));
            Ok(())
        }

        async fn known_peers(&self) -> Vec<PeerAddress> {
            self.known.lock().clone()
        }

        async fn send_contact_request(
            &self,
            target: PeerAddress,
            fingerprints: &[CertificateFingerprint],
        ) -> Result<(), ChannelError> {
            self.ops
                .lock()
                .push(EngineOp::ContactRequest(target, fingerprints.len()));
            Ok(())
        }

        async fn send_data(
            &self,
            target: PeerAddress,
            channel: u8,
            data: Bytes,
        ) -> Result<(), ChannelError> {
            self.ops
                .lock()
                .push(EngineOp::SendData(target, channel, data.len()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockResolver {
        hosts: HashMap<String, IpAddr>,
    }

    #[async_trait]
    impl Resolve for MockResolver {
        async fn resolve(
            &self,
            endpoint: &Endpoint,
            _preference: ResolutionPreference,
            _mode: ResolveMode,
        ) -> CoreResult<PeerAddress> {
            match endpoint {
                Endpoint::Address(address) => Ok(*address),
                Endpoint::Host { name, port } => {
                    let ip = self.hosts.get(name).ok_or_else(|| CoreError::Resolution {
                        endpoint: endpoint.to_string(),
                        message: "name not found".into(),
                    })?;
                    Ok(PeerAddress::new(*ip, port.unwrap_or(crate::DEFAULT_PORT)))
                }
            }
        }
    }

    #[derive(Default)]
    struct RecordingFabric {
        next: AtomicU64,
        registered: Mutex<Vec<(PortHandle, PeerAddress)>>,
        ports: Mutex<Vec<Arc<EndpointPort>>>,
        unregistered: Mutex<Vec<PortHandle>>,
    }

    impl RecordingFabric {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next: AtomicU64::new(1),
                ..Self::default()
            })
        }
    }

    impl Fabric for RecordingFabric {
        fn register_port(&self, port: EndpointPort, _group: PortGroup) -> PortHandle {
            let handle = PortHandle::from_raw(self.next.fetch_add(1, Ordering::SeqCst));
            self.registered.lock().push((handle, port.peer()));
            self.ports.lock().push(Arc::new(port));
            handle
        }

        fn unregister_port(&self, handle: PortHandle) -> bool {
            self.unregistered.lock().push(handle);
            true
        }
    }

    struct Harness {
        core: Arc<Core>,
        engine: Arc<MockEngine>,
        fabric: Arc<RecordingFabric>,
    }

    fn harness_with(
        mut config: CoreConfig,
        security: SecurityConfig,
        resolver: MockResolver,
        events: Option<mpsc::Sender<CoreEvent>>,
    ) -> Harness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        config.listen_on = "0.0.0.0:12000".parse().unwrap();

        let engine = MockEngine::new();
        let fabric = RecordingFabric::new();

        let core = Core::new(
            config,
            security,
            Collaborators {
                engine: Arc::clone(&engine) as Arc<dyn ChannelEngine>,
                resolver: Arc::new(resolver),
                fabric: Arc::clone(&fabric) as Arc<dyn Fabric>,
                ethernet_sink: None,
                ip_sink: None,
                message_handler: None,
                events,
                acceptance_predicate: None,
            },
        )
        .unwrap();

        Harness {
            core,
            engine,
            fabric,
        }
    }

    fn open_security() -> SecurityConfig {
        SecurityConfig {
            identity: Some(test_identity()),
            validation: ValidationPolicy::None,
            crl_validation: CrlPolicy::None,
            authorities: Vec::new(),
            revocation_lists: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_open_requires_identity() {
        let harness = harness_with(
            CoreConfig::default(),
            SecurityConfig::default(),
            MockResolver::default(),
            None,
        );

        let result = harness.core.open().await;
        assert!(matches!(result, Err(CoreError::Configuration(_))));
        assert_eq!(harness.core.state().await, CoreState::Closed);
        assert!(harness.engine.ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_contact_greets_then_introduces() {
        // S1: a configured hostname is resolved, greeted and introduced to.
        let config = CoreConfig {
            contact_list: vec![Endpoint::host("peer.example", Some(12000))],
            ..CoreConfig::default()
        };
        let resolver = MockResolver {
            hosts: [(
                "peer.example".to_string(),
                IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
            )]
            .into_iter()
            .collect(),
        };
        let harness = harness_with(config, open_security(), resolver, None);
        let peer = addr([203, 0, 113, 7], 12000);

        harness.core.open().await.unwrap();
        sleep(Duration::from_millis(10)).await;

        let ops = harness.engine.ops();
        let greet_at = ops.iter().position(|op| *op == EngineOp::Greet(peer));
        let intro_at = ops.iter().position(|op| *op == EngineOp::IntroduceTo(peer));
        assert!(greet_at.is_some(), "expected a greet, got {ops:?}");
        assert!(intro_at.is_some(), "expected an introduction, got {ops:?}");
        assert!(greet_at < intro_at);

        // The hello exchange alone leaves no coordinator state behind.
        assert_eq!(harness.core.peers().len().await, 0);

        // Presentation with acceptable certificates triggers a session request.
        let sig = test_certificate("peer.weft.test");
        let enc = test_certificate("peer-enc.weft.test");
        assert!(
            harness
                .core
                .handle_presentation_received(peer, &sig, &enc, true)
                .await
        );
        assert_eq!(harness.core.peers().len().await, 1);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(
            harness
                .engine
                .count(|op| *op == EngineOp::RequestSession(peer)),
            1
        );

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_banned_hello_is_denied() {
        // S2: a hello from inside a never-contact rule is denied.
        let config = CoreConfig {
            never_contact_list: vec!["203.0.113.0/24".parse().unwrap()],
            ..CoreConfig::default()
        };
        let harness = harness_with(config, open_security(), MockResolver::default(), None);

        harness.core.open().await.unwrap();

        let banned = addr([203, 0, 113, 9], 12000);
        assert!(!harness.core.handle_hello_received(banned, true).await);

        sleep(Duration::from_millis(10)).await;
        assert_eq!(
            harness
                .engine
                .count(|op| matches!(op, EngineOp::IntroduceTo(_))),
            0
        );

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_hello_introduces_back() {
        let harness = harness_with(
            CoreConfig::default(),
            open_security(),
            MockResolver::default(),
            None,
        );

        harness.core.open().await.unwrap();

        let sender = addr([198, 51, 100, 9], 12000);
        assert!(harness.core.handle_hello_received(sender, true).await);
        // The engine's default deny stands when we have no reason to override.
        assert!(!harness.core.handle_hello_received(sender, false).await);

        sleep(Duration::from_millis(10)).await;
        assert_eq!(
            harness
                .engine
                .count(|op| *op == EngineOp::IntroduceTo(sender)),
            1
        );

        // Inbound hellos never create peer records; scanning hosts must
        // not grow the table.
        assert_eq!(harness.core.peers().len().await, 0);

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_contact_relay_contacts_answer() {
        // S3: an acceptable contact answer is contacted.
        let harness = harness_with(
            CoreConfig::default(),
            open_security(),
            MockResolver::default(),
            None,
        );

        harness.core.open().await.unwrap();

        let sender = addr([192, 0, 2, 1], 12000);
        let answer = addr([198, 51, 100, 5], 12000);
        harness
            .core
            .handle_contact_received(sender, fingerprint(), answer)
            .await;

        sleep(Duration::from_millis(10)).await;
        assert_eq!(harness.engine.count(|op| *op == EngineOp::Greet(answer)), 1);

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_contact_relay_blocked_by_admission() {
        // S4: a banned contact answer is never contacted.
        let config = CoreConfig {
            never_contact_list: vec!["198.51.100.5/32".parse().unwrap()],
            ..CoreConfig::default()
        };
        let harness = harness_with(config, open_security(), MockResolver::default(), None);

        harness.core.open().await.unwrap();

        let sender = addr([192, 0, 2, 1], 12000);
        let answer = addr([198, 51, 100, 5], 12000);
        harness
            .core
            .handle_contact_received(sender, fingerprint(), answer)
            .await;

        sleep(Duration::from_millis(10)).await;
        assert_eq!(harness.engine.count(|op| matches!(op, EngineOp::Greet(_))), 0);

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_contacts_disabled_ignores_relay() {
        let config = CoreConfig {
            accept_contacts: false,
            ..CoreConfig::default()
        };
        let harness = harness_with(config, open_security(), MockResolver::default(), None);

        harness.core.open().await.unwrap();
        harness
            .core
            .handle_contact_received(addr([192, 0, 2, 1], 12000), fingerprint(), addr([198, 51, 100, 5], 12000))
            .await;

        sleep(Duration::from_millis(10)).await;
        assert_eq!(harness.engine.count(|op| matches!(op, EngineOp::Greet(_))), 0);

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_contact_request_respects_configuration() {
        let harness = harness_with(
            CoreConfig::default(),
            open_security(),
            MockResolver::default(),
            None,
        );
        harness.core.open().await.unwrap();

        let sender = addr([192, 0, 2, 1], 12000);
        let answer = addr([198, 51, 100, 5], 12000);
        let cert = test_certificate("asked.weft.test");

        assert!(
            harness
                .core
                .handle_contact_request_received(sender, &cert, fingerprint(), answer)
                .await
        );

        harness.core.close().await.unwrap();

        let config = CoreConfig {
            accept_contact_requests: false,
            ..CoreConfig::default()
        };
        let harness = harness_with(config, open_security(), MockResolver::default(), None);
        harness.core.open().await.unwrap();

        assert!(
            !harness
                .core
                .handle_contact_request_received(sender, &cert, fingerprint(), answer)
                .await
        );

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_up_then_lost_in_tap_mode() {
        // S5: one registration on the new-session edge, one deregistration
        // on loss, and a repeated loss is a no-op.
        let harness = harness_with(
            CoreConfig::default(),
            open_security(),
            MockResolver::default(),
            None,
        );

        harness.core.open().await.unwrap();

        let peer = addr([198, 51, 100, 7], 12000);
        harness
            .core
            .handle_session_established(peer, true, algorithms(), algorithms())
            .await;

        assert_eq!(harness.fabric.registered.lock().len(), 1);
        assert_eq!(harness.fabric.registered.lock()[0].1, peer);

        harness.core.handle_session_lost(peer).await;
        assert_eq!(harness.fabric.unregistered.lock().len(), 1);

        harness.core.handle_session_lost(peer).await;
        assert_eq!(harness.fabric.unregistered.lock().len(), 1);
        assert!(harness.core.ports().is_empty());

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_the_existing_port() {
        let harness = harness_with(
            CoreConfig::default(),
            open_security(),
            MockResolver::default(),
            None,
        );

        harness.core.open().await.unwrap();

        let peer = addr([198, 51, 100, 7], 12000);
        harness
            .core
            .handle_session_established(peer, true, algorithms(), algorithms())
            .await;
        harness
            .core
            .handle_session_established(peer, false, algorithms(), algorithms())
            .await;
        harness
            .core
            .handle_session_established(peer, false, algorithms(), algorithms())
            .await;

        assert_eq!(harness.fabric.registered.lock().len(), 1);

        harness.core.handle_session_lost(peer).await;
        assert_eq!(harness.fabric.unregistered.lock().len(), 1);

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_presentation_fails_default_chain_verification() {
        // S6: an untrusted certificate denies the presentation and no
        // session request goes out.
        let security = SecurityConfig {
            identity: Some(test_identity()),
            validation: ValidationPolicy::Default,
            crl_validation: CrlPolicy::None,
            authorities: Vec::new(),
            revocation_lists: Vec::new(),
        };
        let harness = harness_with(
            CoreConfig::default(),
            security,
            MockResolver::default(),
            None,
        );

        harness.core.open().await.unwrap();

        let peer = addr([198, 51, 100, 7], 12000);
        let sig = test_certificate("peer.weft.test");
        let enc = test_certificate("peer-enc.weft.test");

        assert!(
            !harness
                .core
                .handle_presentation_received(peer, &sig, &enc, true)
                .await
        );

        sleep(Duration::from_millis(10)).await;
        assert_eq!(
            harness
                .engine
                .count(|op| matches!(op, EngineOp::RequestSession(_))),
            0
        );

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_banned_presentation_never_reaches_trust() {
        let config = CoreConfig {
            never_contact_list: vec!["203.0.113.0/24".parse().unwrap()],
            ..CoreConfig::default()
        };
        // Validation policy None would accept anything, so a deny here can
        // only come from the admission filter.
        let harness = harness_with(config, open_security(), MockResolver::default(), None);

        harness.core.open().await.unwrap();

        let banned = addr([203, 0, 113, 20], 12000);
        let sig = test_certificate("peer.weft.test");
        let enc = test_certificate("peer-enc.weft.test");

        assert!(
            !harness
                .core
                .handle_presentation_received(banned, &sig, &enc, true)
                .await
        );

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_contact_loop_fires_on_schedule() {
        let peer = addr([203, 0, 113, 7], 12000);
        let config = CoreConfig {
            contact_list: vec![Endpoint::Address(peer)],
            ..CoreConfig::default()
        };
        let harness = harness_with(config, open_security(), MockResolver::default(), None);

        harness.core.open().await.unwrap();

        // Ticks at 0, 30, 60 and 90 seconds.
        sleep(Duration::from_secs(95)).await;
        assert_eq!(
            harness.engine.count(|op| *op == EngineOp::Greet(peer)),
            4
        );

        harness.core.close().await.unwrap();

        // No further ticks after close.
        sleep(Duration::from_secs(120)).await;
        assert_eq!(
            harness.engine.count(|op| *op == EngineOp::Greet(peer)),
            4
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dynamic_contact_loop_fires_on_schedule() {
        let config = CoreConfig {
            dynamic_contact_list: vec![test_certificate("wanted.weft.test")],
            ..CoreConfig::default()
        };
        let harness = harness_with(config, open_security(), MockResolver::default(), None);

        let a = addr([198, 51, 100, 1], 12000);
        let b = addr([198, 51, 100, 2], 12000);
        // Duplicate entries must collapse to one request per peer.
        *harness.engine.known.lock() = vec![a, a, b];

        harness.core.open().await.unwrap();

        // First tick one full period after open; none yet at t=40.
        sleep(Duration::from_secs(40)).await;
        assert_eq!(
            harness
                .engine
                .count(|op| matches!(op, EngineOp::ContactRequest(..))),
            0
        );

        // Ticks at 45 and 90 seconds: one request per known peer per tick.
        sleep(Duration::from_secs(55)).await;
        assert_eq!(
            harness
                .engine
                .count(|op| *op == EngineOp::ContactRequest(a, 1)),
            2
        );
        assert_eq!(
            harness
                .engine
                .count(|op| *op == EngineOp::ContactRequest(b, 1)),
            2
        );

        harness.core.close().await.unwrap();

        sleep(Duration::from_secs(100)).await;
        assert_eq!(
            harness
                .engine
                .count(|op| matches!(op, EngineOp::ContactRequest(..))),
            4
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_timeout_does_not_introduce() {
        let peer = addr([203, 0, 113, 7], 12000);
        let config = CoreConfig {
            contact_list: vec![Endpoint::Address(peer)],
            ..CoreConfig::default()
        };
        let harness = harness_with(config, open_security(), MockResolver::default(), None);
        harness.engine.fail_greet(
            peer,
            ChannelError::HelloTimeout {
                timeout: Duration::from_secs(3),
            },
        );

        harness.core.open().await.unwrap();
        sleep(Duration::from_millis(10)).await;

        assert!(harness.engine.count(|op| *op == EngineOp::Greet(peer)) >= 1);
        assert_eq!(
            harness
                .engine
                .count(|op| matches!(op, EngineOp::IntroduceTo(_))),
            0
        );

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_a_fence() {
        let harness = harness_with(
            CoreConfig::default(),
            open_security(),
            MockResolver::default(),
            None,
        );

        harness.core.open().await.unwrap();
        harness.core.close().await.unwrap();

        assert_eq!(harness.core.state().await, CoreState::Closed);
        assert_eq!(harness.engine.count(|op| *op == EngineOp::Close), 1);

        let peer = addr([198, 51, 100, 7], 12000);
        assert!(!harness.core.handle_hello_received(peer, true).await);
        harness
            .core
            .handle_session_established(peer, true, algorithms(), algorithms())
            .await;
        assert!(harness.fabric.registered.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_events_reach_the_embedder() {
        let (tx, mut rx) = mpsc::channel(8);
        let harness = harness_with(
            CoreConfig::default(),
            open_security(),
            MockResolver::default(),
            Some(tx),
        );

        harness.core.open().await.unwrap();

        let peer = addr([198, 51, 100, 7], 12000);
        harness
            .core
            .handle_session_established(peer, true, algorithms(), algorithms())
            .await;
        harness.core.handle_session_lost(peer).await;
        // A spurious repeat must not surface a second lost event.
        harness.core.handle_session_lost(peer).await;

        match rx.recv().await.unwrap() {
            CoreEvent::SessionEstablished { peer: p, is_new, .. } => {
                assert_eq!(p, peer);
                assert!(is_new);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap(), CoreEvent::SessionLost { peer });
        assert!(rx.try_recv().is_err());

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_failure_drops_the_record() {
        let harness = harness_with(
            CoreConfig::default(),
            open_security(),
            MockResolver::default(),
            None,
        );

        harness.core.open().await.unwrap();

        let peer = addr([198, 51, 100, 7], 12000);
        let sig = test_certificate("peer.weft.test");
        let enc = test_certificate("peer-enc.weft.test");
        assert!(
            harness
                .core
                .handle_presentation_received(peer, &sig, &enc, true)
                .await
        );
        assert_eq!(harness.core.peers().len().await, 1);

        harness
            .core
            .handle_session_failed(peer, true, algorithms(), algorithms())
            .await;
        assert_eq!(harness.core.peers().len().await, 0);

        harness.core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_egress_sends_on_the_frames_channel() {
        let harness = harness_with(
            CoreConfig::default(),
            open_security(),
            MockResolver::default(),
            None,
        );

        harness.core.open().await.unwrap();

        let peer = addr([198, 51, 100, 7], 12000);
        harness
            .core
            .handle_session_established(peer, true, algorithms(), algorithms())
            .await;

        // Drive the registered port's egress closure the way the fabric
        // would when the local adapter emits a frame for this peer.
        let port = {
            let ports = harness.fabric.ports.lock();
            assert_eq!(ports.len(), 1);
            Arc::clone(&ports[0])
        };
        assert_eq!(port.peer(), peer);

        port.inject(Bytes::from_static(b"frame")).await.unwrap();

        assert_eq!(
            harness
                .engine
                .count(|op| *op == EngineOp::SendData(peer, CHANNEL_FRAMES, 5)),
            1
        );

        harness.core.close().await.unwrap();
    }
}

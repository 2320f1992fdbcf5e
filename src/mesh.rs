//! The mesh coordinator.
//!
//! Owns the lobby role state machine and drives every pairwise connection:
//! offer/answer negotiation over the relay, trickled candidates with a
//! buffered-fallback flush, sealed payloads once a pair has exchanged keys,
//! and both discovery flavors (relay announcements and the in-band chain
//! forwarded blindly by the host over default channels). Each endpoint's
//! events are consumed by exactly one task, so connection state never races.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{HostParams, JoinParams, LobbySession};
use crate::crypto::{CryptoError, CryptoLayer, KeypairStatus};
use crate::mux::{ChannelMultiplexer, MuxError};
use crate::protocol::{
    ChannelFrame, ClientFrame, ConfigRejection, IceCandidateBlob, NegotiationPayload, PeerId,
    RelayFrame, RelayOpcode, SdpPayload, SealedEnvelope, SignalBody, SignalKind,
};
use crate::registry::{
    ConnState, ConnectionRegistry, DEFAULT_CHANNEL_ID, NegotiationRole, PeerConnection,
    RegistryError,
};
use crate::signaling::{ConfigAck, LinkState, SignalingChannel, SignalingError};
use crate::transport::{EndpointEvent, EndpointFactory, EndpointState, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error(transparent)]
    Signaling(SignalingError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error("relay rejected the lobby request: {0}")]
    ConfigRejected(ConfigRejection),
    #[error("not authenticated with the relay")]
    NotAuthenticated,
    #[error("operation requires the host role")]
    NotHost,
    #[error("lobby role is already {0:?}")]
    RoleConflict(Role),
    #[error("relay granted {granted:?} for a {requested:?} request")]
    AckMismatch { requested: Role, granted: Role },
    #[error("no connection to {0}")]
    UnknownPeer(PeerId),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("a sealed payload arrived from {0} with no shared secret")]
    SealedWithoutSecret(PeerId),
}

impl From<SignalingError> for MeshError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::Rejected(reason) => MeshError::ConfigRejected(reason),
            other => MeshError::Signaling(other),
        }
    }
}

/// Lobby role. `Configuring` only ever sits between `Unconfigured` and a
/// granted role; failures fall back to `Unconfigured`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unconfigured,
    Configuring,
    Host,
    Peer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceSignal {
    Ring,
    Pickup,
    Hangup,
}

/// Everything the embedding application observes.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    Connected,
    Authenticated { peer_id: PeerId },
    Disconnected,
    ModeAck { role: Role },
    ModeRejected { reason: ConfigRejection },
    PeerConnected { peer_id: PeerId, display_name: String },
    PeerLeft { peer_id: PeerId },
    ChannelOpened { peer_id: PeerId, channel: u16, label: String },
    ChannelData { peer_id: PeerId, channel: u16, data: Value },
    Voice { peer_id: PeerId, signal: VoiceSignal },
    HostReclaimed,
    LobbyClosed,
    RelayNotice { message: String },
}

/// How negotiation frames for a connection travel: straight over the relay,
/// or inside discovery frames relayed by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SignalPath {
    Relay,
    ViaHost { host: PeerId },
}

enum Negotiation {
    Offer,
    Answer,
    Candidate,
}

#[derive(Debug, Clone, Default)]
struct MemberInfo {
    display_name: String,
    public_key: Option<String>,
}

pub struct MeshCoordinator {
    signaling: Arc<SignalingChannel>,
    crypto: Arc<CryptoLayer>,
    registry: Arc<ConnectionRegistry>,
    mux: Arc<ChannelMultiplexer>,
    factory: Arc<dyn EndpointFactory>,
    display_name: String,
    role: Mutex<Role>,
    lobby: Mutex<Option<LobbySession>>,
    members: Mutex<HashMap<PeerId, MemberInfo>>,
    paths: Mutex<HashMap<(PeerId, SignalKind), SignalPath>>,
    announced: Mutex<HashSet<PeerId>>,
    auto_introduce: AtomicBool,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MeshEvent>>>,
}

impl MeshCoordinator {
    /// Wire the coordinator onto an authenticated-or-not signaling channel.
    /// Registers for every relay opcode it consumes; the channel must be
    /// freshly started (one handler per opcode, ever).
    pub fn new(
        signaling: Arc<SignalingChannel>,
        factory: Arc<dyn EndpointFactory>,
        display_name: &str,
    ) -> Result<Arc<Self>, MeshError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let crypto = Arc::new(CryptoLayer::new());
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&crypto)));
        let mux = Arc::new(ChannelMultiplexer::new(
            Arc::clone(&registry),
            events_tx.clone(),
        ));

        let coordinator = Arc::new(Self {
            signaling,
            crypto,
            registry,
            mux,
            factory,
            display_name: display_name.to_string(),
            role: Mutex::new(Role::Unconfigured),
            lobby: Mutex::new(None),
            members: Mutex::new(HashMap::new()),
            paths: Mutex::new(HashMap::new()),
            announced: Mutex::new(HashSet::new()),
            auto_introduce: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        });

        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        for opcode in [
            RelayOpcode::NewPeer,
            RelayOpcode::NewHost,
            RelayOpcode::Discover,
            RelayOpcode::Anticipate,
            RelayOpcode::MakeOffer,
            RelayOpcode::MakeAnswer,
            RelayOpcode::Ice,
            RelayOpcode::HostGone,
            RelayOpcode::PeerGone,
            RelayOpcode::LobbyClose,
            RelayOpcode::HostReclaim,
            RelayOpcode::Violation,
            RelayOpcode::Warning,
            RelayOpcode::ConfigRequired,
        ] {
            coordinator.signaling.register(opcode, relay_tx.clone())?;
        }
        let relay_worker = Arc::clone(&coordinator);
        tokio::spawn(async move {
            while let Some(frame) = relay_rx.recv().await {
                relay_worker.handle_relay_frame(frame).await;
            }
        });

        let (gone_tx, mut gone_rx) = mpsc::unbounded_channel();
        coordinator.signaling.set_disconnect_notifier(gone_tx);
        let teardown = Arc::clone(&coordinator);
        tokio::spawn(async move {
            if gone_rx.recv().await.is_some() {
                teardown.teardown(MeshEvent::Disconnected).await;
            }
        });

        let _ = coordinator.events_tx.send(MeshEvent::Connected);
        Ok(coordinator)
    }

    /// Take the event stream. Yields `None` once taken.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MeshEvent>> {
        self.events_rx.lock().take()
    }

    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    pub fn lobby(&self) -> Option<LobbySession> {
        self.lobby.lock().clone()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.registry.connected_peers()
    }

    pub fn mux(&self) -> &Arc<ChannelMultiplexer> {
        &self.mux
    }

    pub fn crypto(&self) -> &Arc<CryptoLayer> {
        &self.crypto
    }

    /// Generate the local key material so lobby announcements carry a public
    /// key and pairwise signaling gets sealed.
    pub fn enable_encryption(&self) -> KeypairStatus {
        self.crypto.ensure_keypair()
    }

    /// When enabled, the host runs the in-band discovery chain for each
    /// freshly connected peer instead of relying on relay announcements.
    pub fn set_auto_introduce(&self, enabled: bool) {
        self.auto_introduce.store(enabled, Ordering::Relaxed);
    }

    pub async fn authenticate(&self, token: &str) -> Result<PeerId, MeshError> {
        let (peer_id, _session) = self.signaling.authenticate(token).await?;
        let _ = self.events_tx.send(MeshEvent::Authenticated {
            peer_id: peer_id.clone(),
        });
        Ok(peer_id)
    }

    pub async fn host_lobby(&self, params: &HostParams) -> Result<(), MeshError> {
        self.begin_configuring()?;
        let frame = ClientFrame::ConfigHost {
            lobby_id: params.lobby_id.clone(),
            password: params.password.clone(),
            max_peers: params.max_peers,
            allow_host_reclaim: params.allow_host_reclaim,
            allow_peers_to_claim_host: params.allow_peers_to_claim_host,
            public_key: self.crypto.export_public_key().ok(),
        };
        match self.signaling.configure(frame).await {
            Ok(ConfigAck::Host) => {
                *self.role.lock() = Role::Host;
                *self.lobby.lock() = Some(LobbySession::hosted(params));
                tracing::info!(target = "mesh", lobby_id = %params.lobby_id, "hosting lobby");
                let _ = self.events_tx.send(MeshEvent::ModeAck { role: Role::Host });
                Ok(())
            }
            Ok(ConfigAck::Peer) => {
                *self.role.lock() = Role::Unconfigured;
                tracing::warn!(target = "mesh", "relay acked a host request with a peer grant");
                Err(MeshError::AckMismatch {
                    requested: Role::Host,
                    granted: Role::Peer,
                })
            }
            Err(err) => Err(self.config_failed(err)),
        }
    }

    pub async fn join_lobby(&self, params: &JoinParams) -> Result<(), MeshError> {
        self.begin_configuring()?;
        let frame = ClientFrame::ConfigPeer {
            lobby_id: params.lobby_id.clone(),
            password: params.password.clone(),
            public_key: self.crypto.export_public_key().ok(),
        };
        match self.signaling.configure(frame).await {
            Ok(ConfigAck::Peer) => {
                *self.role.lock() = Role::Peer;
                *self.lobby.lock() = Some(LobbySession::joined(params));
                tracing::info!(target = "mesh", lobby_id = %params.lobby_id, "joined lobby");
                let _ = self.events_tx.send(MeshEvent::ModeAck { role: Role::Peer });
                Ok(())
            }
            Ok(ConfigAck::Host) => {
                *self.role.lock() = Role::Unconfigured;
                tracing::warn!(target = "mesh", "relay acked a join request with a host grant");
                Err(MeshError::AckMismatch {
                    requested: Role::Peer,
                    granted: Role::Host,
                })
            }
            Err(err) => Err(self.config_failed(err)),
        }
    }

    fn begin_configuring(&self) -> Result<(), MeshError> {
        if self.signaling.state() != LinkState::Authenticated {
            return Err(MeshError::NotAuthenticated);
        }
        let mut role = self.role.lock();
        if *role != Role::Unconfigured {
            return Err(MeshError::RoleConflict(*role));
        }
        *role = Role::Configuring;
        Ok(())
    }

    fn config_failed(&self, err: SignalingError) -> MeshError {
        *self.role.lock() = Role::Unconfigured;
        let err: MeshError = err.into();
        if let MeshError::ConfigRejected(reason) = &err {
            tracing::warn!(target = "mesh", %reason, "lobby request rejected");
            let _ = self.events_tx.send(MeshEvent::ModeRejected { reason: *reason });
        }
        err
    }

    /// Host-only: run the in-band introduction so `offerer` and `responder`
    /// connect directly. The chain's negotiation payloads pass through this
    /// node opaquely.
    pub async fn introduce_peers(
        self: &Arc<Self>,
        offerer: &PeerId,
        responder: &PeerId,
    ) -> Result<(), MeshError> {
        if self.role() != Role::Host {
            return Err(MeshError::NotHost);
        }
        let info = self
            .members
            .lock()
            .get(offerer)
            .cloned()
            .ok_or_else(|| MeshError::UnknownPeer(offerer.clone()))?;
        let frame = ChannelFrame::Discovery {
            peer: offerer.clone(),
            display_name: info.display_name,
            public_key: info.public_key,
        };
        self.send_discovery_frame(responder, &frame).await
    }

    /// Start a voice connection towards an already meshed peer. Voice
    /// negotiation always travels over the relay.
    pub async fn connect_voice(self: &Arc<Self>, peer: &PeerId) -> Result<(), MeshError> {
        if !self.registry.contains(peer, SignalKind::Data) {
            return Err(MeshError::UnknownPeer(peer.clone()));
        }
        let display_name = self.member_name(peer);
        self.begin_offer(peer.clone(), display_name, None, SignalKind::Voice, SignalPath::Relay)
            .await
    }

    /// Graceful departure from one peer: say goodbye, then retire both the
    /// data and voice connections.
    pub async fn close_connection(self: &Arc<Self>, peer: &PeerId) -> Result<(), MeshError> {
        if let Err(err) = self.mux.goodbye(peer).await {
            tracing::debug!(target = "mesh", peer_id = %peer, "goodbye not delivered: {err}");
        }
        self.drop_peer(peer, ConnState::Closed).await;
        Ok(())
    }

    /// Leave the relay entirely. Everything goes: connections, channels,
    /// secrets, lobby role.
    pub async fn disconnect(self: &Arc<Self>) {
        self.signaling.close().await;
        self.teardown(MeshEvent::Disconnected).await;
    }

    async fn handle_relay_frame(self: &Arc<Self>, frame: RelayFrame) {
        match frame {
            RelayFrame::NewPeer { peer_id, display_name, public_key }
            | RelayFrame::NewHost { peer_id, display_name, public_key, .. }
            | RelayFrame::Discover { peer_id, display_name, public_key } => {
                self.remember_member(&peer_id, &display_name, public_key.clone());
                if let Err(err) = self
                    .begin_offer(
                        peer_id.clone(),
                        display_name,
                        public_key,
                        SignalKind::Data,
                        SignalPath::Relay,
                    )
                    .await
                {
                    self.fail_connection(&peer_id, SignalKind::Data, &err).await;
                }
            }
            RelayFrame::Anticipate { peer_id, display_name, public_key } => {
                // The announced member will offer to us shortly; have the
                // pair secret ready so its sealed payloads open.
                self.remember_member(&peer_id, &display_name, public_key.clone());
                self.maybe_derive_secret(&peer_id, public_key.as_deref());
            }
            RelayFrame::MakeOffer { from_peer, payload } => {
                let kind = payload.kind;
                if let Err(err) = self
                    .accept_remote_offer(from_peer.clone(), payload, SignalPath::Relay)
                    .await
                {
                    self.fail_connection(&from_peer, kind, &err).await;
                }
            }
            RelayFrame::MakeAnswer { from_peer, payload } => {
                let kind = payload.kind;
                if let Err(err) = self.apply_remote_answer(&from_peer, payload).await {
                    self.fail_connection(&from_peer, kind, &err).await;
                }
            }
            RelayFrame::Ice { from_peer, payload } => {
                if let Err(err) = self
                    .apply_remote_candidate(&from_peer, payload.kind, payload.contents)
                    .await
                {
                    tracing::warn!(target = "mesh", peer_id = %from_peer, "candidate dropped: {err}");
                }
            }
            RelayFrame::HostGone { peer_id } | RelayFrame::PeerGone { peer_id } => {
                self.drop_peer(&peer_id, ConnState::Closed).await;
            }
            RelayFrame::LobbyClose => {
                tracing::info!(target = "mesh", "lobby closed by relay");
                self.teardown(MeshEvent::LobbyClosed).await;
            }
            RelayFrame::HostReclaim => {
                *self.role.lock() = Role::Host;
                if let Some(lobby) = self.lobby.lock().as_mut() {
                    lobby.role = Role::Host;
                }
                tracing::info!(target = "mesh", "promoted to host");
                let _ = self.events_tx.send(MeshEvent::HostReclaimed);
            }
            RelayFrame::Violation { message } | RelayFrame::Warning { message } => {
                tracing::warn!(target = "mesh", %message, "relay notice");
                let _ = self.events_tx.send(MeshEvent::RelayNotice { message });
            }
            RelayFrame::ConfigRequired => {
                tracing::warn!(target = "mesh", "relay demands mode configuration");
                let _ = self.events_tx.send(MeshEvent::RelayNotice {
                    message: "configuration required".into(),
                });
            }
            other => {
                tracing::debug!(target = "mesh", opcode = ?other.opcode(), "unhandled relay frame");
            }
        }
    }

    /// Create an offering connection towards `peer` and send the offer.
    /// Glare rule: if we are already answering for this peer, the
    /// instruction to offer is ignored.
    async fn begin_offer(
        self: &Arc<Self>,
        peer: PeerId,
        display_name: String,
        public_key: Option<String>,
        kind: SignalKind,
        path: SignalPath,
    ) -> Result<(), MeshError> {
        if let Some(existing) = self.registry.get(&peer, kind) {
            if !existing.state().is_terminal() {
                match existing.role {
                    NegotiationRole::Answering => {
                        tracing::debug!(target = "mesh", peer_id = %peer, ?kind, "already answering, offer instruction ignored");
                    }
                    NegotiationRole::Offering => {
                        tracing::debug!(target = "mesh", peer_id = %peer, ?kind, "offer already in flight");
                    }
                }
                return Ok(());
            }
        }
        self.maybe_derive_secret(&peer, public_key.as_deref());

        let endpoint = self.factory.create(&peer, kind)?;
        let connection = self.registry.create_connection(
            peer.clone(),
            display_name,
            kind,
            NegotiationRole::Offering,
            Arc::clone(&endpoint),
        )?;
        self.paths.lock().insert((peer.clone(), kind), path);
        connection.insert_channel(DEFAULT_CHANNEL_ID, "default", true)?;
        endpoint
            .open_channel(DEFAULT_CHANNEL_ID, "default", true)
            .await?;
        connection.set_state(ConnState::Connecting);
        self.spawn_connection_task(Arc::clone(&connection));

        let offer = endpoint.create_offer().await?;
        let body = self.seal_value(&peer, serde_json::to_value(&offer)?)?;
        tracing::debug!(target = "mesh", peer_id = %peer, ?kind, "offer sent");
        self.send_negotiation(&peer, kind, Negotiation::Offer, body)
            .await
    }

    /// Answer an inbound offer. An offer for a peer we are already offering
    /// to is glare on the remote side and gets dropped with a warning.
    async fn accept_remote_offer(
        self: &Arc<Self>,
        peer: PeerId,
        payload: NegotiationPayload,
        path: SignalPath,
    ) -> Result<(), MeshError> {
        let kind = payload.kind;
        if let Some(existing) = self.registry.get(&peer, kind) {
            if !existing.state().is_terminal() {
                tracing::warn!(
                    target = "mesh",
                    peer_id = %peer,
                    ?kind,
                    role = ?existing.role,
                    "offer for an existing connection ignored"
                );
                return Ok(());
            }
        }
        let display_name = self.member_name(&peer);
        let endpoint = self.factory.create(&peer, kind)?;
        let connection = self.registry.create_connection(
            peer.clone(),
            display_name,
            kind,
            NegotiationRole::Answering,
            Arc::clone(&endpoint),
        )?;
        self.paths.lock().insert((peer.clone(), kind), path);
        connection.insert_channel(DEFAULT_CHANNEL_ID, "default", true)?;
        endpoint
            .open_channel(DEFAULT_CHANNEL_ID, "default", true)
            .await?;
        connection.set_state(ConnState::Connecting);
        self.spawn_connection_task(Arc::clone(&connection));

        let offer: SdpPayload = serde_json::from_value(self.open_body(&peer, payload.contents)?)?;
        let answer = endpoint.accept_offer(offer).await?;
        let body = self.seal_value(&peer, serde_json::to_value(&answer)?)?;
        tracing::debug!(target = "mesh", peer_id = %peer, ?kind, "answer sent");
        self.send_negotiation(&peer, kind, Negotiation::Answer, body)
            .await
    }

    async fn apply_remote_answer(
        &self,
        peer: &PeerId,
        payload: NegotiationPayload,
    ) -> Result<(), MeshError> {
        let connection = self
            .registry
            .get(peer, payload.kind)
            .ok_or_else(|| MeshError::UnknownPeer(peer.clone()))?;
        let answer: SdpPayload = serde_json::from_value(self.open_body(peer, payload.contents)?)?;
        connection.endpoint.apply_answer(answer).await?;
        Ok(())
    }

    async fn apply_remote_candidate(
        &self,
        peer: &PeerId,
        kind: SignalKind,
        contents: SignalBody,
    ) -> Result<(), MeshError> {
        let Some(connection) = self.registry.get(peer, kind) else {
            // In-flight teardown races are expected; nothing to fail.
            tracing::debug!(target = "mesh", peer_id = %peer, ?kind, "candidate for unknown connection dropped");
            return Ok(());
        };
        let blob: IceCandidateBlob = serde_json::from_value(self.open_body(peer, contents)?)?;
        connection.endpoint.add_remote_candidate(blob).await?;
        Ok(())
    }

    async fn send_negotiation(
        &self,
        peer: &PeerId,
        kind: SignalKind,
        negotiation: Negotiation,
        body: SignalBody,
    ) -> Result<(), MeshError> {
        let path = self
            .paths
            .lock()
            .get(&(peer.clone(), kind))
            .cloned()
            .unwrap_or(SignalPath::Relay);
        match path {
            SignalPath::Relay => {
                let payload = NegotiationPayload { kind, contents: body };
                let frame = match negotiation {
                    Negotiation::Offer => ClientFrame::MakeOffer {
                        to_peer: peer.clone(),
                        payload,
                    },
                    Negotiation::Answer => ClientFrame::MakeAnswer {
                        to_peer: peer.clone(),
                        payload,
                    },
                    Negotiation::Candidate => ClientFrame::Ice {
                        to_peer: peer.clone(),
                        payload,
                    },
                };
                self.signaling.send(frame).await?;
                Ok(())
            }
            SignalPath::ViaHost { host } => {
                let frame = match negotiation {
                    Negotiation::Offer => ChannelFrame::DiscoveryMakeOffer {
                        peer: peer.clone(),
                        contents: body,
                    },
                    Negotiation::Answer => ChannelFrame::DiscoveryMakeAnswer {
                        peer: peer.clone(),
                        contents: body,
                    },
                    Negotiation::Candidate => ChannelFrame::DiscoveryIce {
                        peer: peer.clone(),
                        contents: body,
                    },
                };
                self.send_discovery_frame(&host, &frame).await
            }
        }
    }

    async fn send_discovery_frame(
        &self,
        to: &PeerId,
        frame: &ChannelFrame,
    ) -> Result<(), MeshError> {
        let connection = self
            .registry
            .get(to, SignalKind::Data)
            .ok_or_else(|| MeshError::UnknownPeer(to.clone()))?;
        self.mux
            .send_frame(&connection, DEFAULT_CHANNEL_ID, frame, false)
            .await?;
        Ok(())
    }

    fn spawn_connection_task(self: &Arc<Self>, connection: Arc<PeerConnection>) {
        let Some(mut events) = connection.endpoint.take_events() else {
            tracing::warn!(
                target = "mesh",
                peer_id = %connection.peer_id,
                "endpoint event stream already taken"
            );
            return;
        };
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if coordinator.handle_endpoint_event(&connection, event).await {
                    break;
                }
            }
        });
    }

    /// Returns `true` when the connection reached a terminal state and the
    /// task should stop.
    async fn handle_endpoint_event(
        self: &Arc<Self>,
        connection: &Arc<PeerConnection>,
        event: EndpointEvent,
    ) -> bool {
        let peer = connection.peer_id.clone();
        let kind = connection.kind;
        match event {
            EndpointEvent::Candidate(blob) => {
                connection.buffer_candidate(blob.clone());
                self.send_candidate(&peer, kind, blob).await;
            }
            EndpointEvent::GatheringComplete => {
                for blob in connection.take_buffered_candidates() {
                    self.send_candidate(&peer, kind, blob).await;
                }
            }
            EndpointEvent::StateChanged(state) => match state {
                EndpointState::Connected => {
                    connection.set_state(ConnState::Connected);
                    tracing::info!(target = "mesh", peer_id = %peer, ?kind, "connection established");
                }
                EndpointState::Disconnected
                | EndpointState::Failed
                | EndpointState::Closed => {
                    let terminal = if state == EndpointState::Failed {
                        ConnState::Failed
                    } else {
                        ConnState::Closed
                    };
                    self.drop_peer_connection(&peer, kind, terminal).await;
                    return true;
                }
                _ => {}
            },
            EndpointEvent::ChannelOpen { id } => {
                let _ = connection.set_channel_state(id, crate::registry::ChannelState::Open);
                let label = connection
                    .channel(id)
                    .map(|record| record.label)
                    .unwrap_or_default();
                let _ = self.events_tx.send(MeshEvent::ChannelOpened {
                    peer_id: peer.clone(),
                    channel: id,
                    label,
                });
                if id == DEFAULT_CHANNEL_ID && kind == SignalKind::Data {
                    self.announce_peer(&peer, &connection.display_name);
                    if self.role() == Role::Host && self.auto_introduce.load(Ordering::Relaxed) {
                        self.introduce_to_mesh(&peer).await;
                    }
                }
            }
            EndpointEvent::ChannelClosed { id } => {
                connection.remove_channel(id);
            }
            EndpointEvent::ChannelMessage { id, payload } => {
                match serde_json::from_slice::<ChannelFrame>(&payload) {
                    Ok(frame) => self.handle_channel_frame(connection, id, frame).await,
                    Err(err) => {
                        tracing::warn!(target = "mesh", peer_id = %peer, channel = id, "malformed channel frame dropped: {err}");
                    }
                }
            }
            EndpointEvent::BufferedAmountLow { id } => {
                self.mux.note_buffer_drained(&peer, id);
            }
        }
        false
    }

    async fn handle_channel_frame(
        self: &Arc<Self>,
        connection: &Arc<PeerConnection>,
        channel: u16,
        frame: ChannelFrame,
    ) {
        let sender = connection.peer_id.clone();
        match frame {
            ChannelFrame::Newchan { name, ordered, id } => {
                if let Err(err) = self
                    .mux
                    .accept_remote_channel(&sender, &name, ordered, id)
                    .await
                {
                    tracing::warn!(target = "mesh", peer_id = %sender, "newchan mirror failed: {err}");
                }
            }
            ChannelFrame::Ring => self.mux.emit_voice_signal(&sender, VoiceSignal::Ring),
            ChannelFrame::Pickup => self.mux.emit_voice_signal(&sender, VoiceSignal::Pickup),
            ChannelFrame::Hangup => self.mux.emit_voice_signal(&sender, VoiceSignal::Hangup),
            ChannelFrame::Goodbye => {
                connection.set_state(ConnState::Disconnecting);
                self.drop_peer(&sender, ConnState::Closed).await;
            }
            ChannelFrame::Discovery { peer, display_name, public_key } => {
                // We are the introduced responder. Get the secret ready and
                // tell the host we are willing.
                self.remember_member(&peer, &display_name, public_key.clone());
                self.maybe_derive_secret(&peer, public_key.as_deref());
                let reply = ChannelFrame::DiscoveryAccept {
                    peer,
                    public_key: self.crypto.export_public_key().ok(),
                };
                if let Err(err) = self.send_discovery_frame(&sender, &reply).await {
                    tracing::warn!(target = "mesh", peer_id = %sender, "discovery accept failed: {err}");
                }
            }
            ChannelFrame::DiscoveryAccept { peer, public_key } => {
                // Host side: the responder agreed; point the offerer at it.
                let init = ChannelFrame::DiscoveryInit {
                    peer: sender.clone(),
                    display_name: self.member_name(&sender),
                    public_key,
                };
                if let Err(err) = self.send_discovery_frame(&peer, &init).await {
                    tracing::warn!(target = "mesh", peer_id = %peer, "discovery init failed: {err}");
                }
            }
            ChannelFrame::DiscoveryInit { peer, display_name, public_key } => {
                self.remember_member(&peer, &display_name, public_key.clone());
                if let Err(err) = self
                    .begin_offer(
                        peer.clone(),
                        display_name,
                        public_key,
                        SignalKind::Data,
                        SignalPath::ViaHost { host: sender },
                    )
                    .await
                {
                    self.fail_connection(&peer, SignalKind::Data, &err).await;
                }
            }
            ChannelFrame::DiscoveryMakeOffer { peer, contents } => {
                if self.forward_discovery(&sender, &peer, |via| ChannelFrame::DiscoveryMakeOffer {
                    peer: via,
                    contents: contents.clone(),
                })
                .await
                {
                    return;
                }
                let payload = NegotiationPayload {
                    kind: SignalKind::Data,
                    contents,
                };
                if let Err(err) = self
                    .accept_remote_offer(
                        peer.clone(),
                        payload,
                        SignalPath::ViaHost { host: sender },
                    )
                    .await
                {
                    self.fail_connection(&peer, SignalKind::Data, &err).await;
                }
            }
            ChannelFrame::DiscoveryMakeAnswer { peer, contents } => {
                if self.forward_discovery(&sender, &peer, |via| ChannelFrame::DiscoveryMakeAnswer {
                    peer: via,
                    contents: contents.clone(),
                })
                .await
                {
                    return;
                }
                let payload = NegotiationPayload {
                    kind: SignalKind::Data,
                    contents,
                };
                if let Err(err) = self.apply_remote_answer(&peer, payload).await {
                    self.fail_connection(&peer, SignalKind::Data, &err).await;
                }
            }
            ChannelFrame::DiscoveryIce { peer, contents } => {
                if self.forward_discovery(&sender, &peer, |via| ChannelFrame::DiscoveryIce {
                    peer: via,
                    contents: contents.clone(),
                })
                .await
                {
                    return;
                }
                if let Err(err) = self
                    .apply_remote_candidate(&peer, SignalKind::Data, contents)
                    .await
                {
                    tracing::warn!(target = "mesh", peer_id = %peer, "relayed candidate dropped: {err}");
                }
            }
            stored => self.mux.store_inbound(&sender, channel, stored),
        }
    }

    /// Host forwarding of the discovery chain: frames addressed to another
    /// member are passed along with the `peer` field rewritten to the
    /// sender, contents untouched. Returns `true` when forwarded.
    async fn forward_discovery<F>(&self, sender: &PeerId, target: &PeerId, rebuild: F) -> bool
    where
        F: FnOnce(PeerId) -> ChannelFrame,
    {
        if self.role() != Role::Host {
            return false;
        }
        if self.signaling.local_peer_id().as_ref() == Some(target) {
            return false;
        }
        let frame = rebuild(sender.clone());
        if let Err(err) = self.send_discovery_frame(target, &frame).await {
            tracing::warn!(target = "mesh", peer_id = %target, "discovery forward failed: {err}");
        }
        true
    }

    /// Introduce a freshly meshed peer to every other announced member.
    async fn introduce_to_mesh(self: &Arc<Self>, fresh: &PeerId) {
        let others: Vec<PeerId> = self
            .announced
            .lock()
            .iter()
            .filter(|candidate| *candidate != fresh)
            .cloned()
            .collect();
        for other in others {
            if let Err(err) = self.introduce_peers(fresh, &other).await {
                tracing::warn!(target = "mesh", offerer = %fresh, responder = %other, "introduction failed: {err}");
            }
        }
    }

    async fn send_candidate(&self, peer: &PeerId, kind: SignalKind, blob: IceCandidateBlob) {
        let result = serde_json::to_value(&blob)
            .map_err(MeshError::from)
            .and_then(|value| self.seal_value(peer, value));
        match result {
            Ok(body) => {
                if let Err(err) = self
                    .send_negotiation(peer, kind, Negotiation::Candidate, body)
                    .await
                {
                    tracing::debug!(target = "mesh", peer_id = %peer, "candidate delivery failed: {err}");
                }
            }
            Err(err) => {
                tracing::warn!(target = "mesh", peer_id = %peer, "candidate sealing failed: {err}");
            }
        }
    }

    fn seal_value(&self, peer: &PeerId, value: Value) -> Result<SignalBody, MeshError> {
        if !self.crypto.has_secret(peer) {
            return Ok(SignalBody::Plain(value));
        }
        let plaintext = serde_json::to_vec(&value)?;
        let sealed = self.crypto.seal(peer, &plaintext)?;
        Ok(SignalBody::Sealed { sealed })
    }

    fn open_body(&self, peer: &PeerId, body: SignalBody) -> Result<Value, MeshError> {
        match body {
            SignalBody::Plain(value) => Ok(value),
            SignalBody::Sealed { sealed } => {
                if !self.crypto.has_secret(peer) {
                    return Err(MeshError::SealedWithoutSecret(peer.clone()));
                }
                let plaintext = self.open_sealed(peer, &sealed)?;
                Ok(serde_json::from_slice(&plaintext)?)
            }
        }
    }

    fn open_sealed(&self, peer: &PeerId, sealed: &SealedEnvelope) -> Result<Vec<u8>, MeshError> {
        Ok(self.crypto.open(peer, sealed)?)
    }

    /// Key-exchange failure never blocks establishment; the pair just runs
    /// cleartext.
    fn maybe_derive_secret(&self, peer: &PeerId, public_key: Option<&str>) {
        let Some(public_key) = public_key else {
            return;
        };
        match self.crypto.derive_shared_secret(peer, public_key) {
            Ok(()) => {}
            Err(CryptoError::SecretExists(_)) => {
                tracing::debug!(target = "mesh", peer_id = %peer, "pair secret already derived");
            }
            Err(CryptoError::NoKeypair) => {
                tracing::debug!(target = "mesh", peer_id = %peer, "encryption disabled locally, staying cleartext");
            }
            Err(err) => {
                tracing::warn!(target = "mesh", peer_id = %peer, "key agreement failed, staying cleartext: {err}");
            }
        }
    }

    fn remember_member(&self, peer: &PeerId, display_name: &str, public_key: Option<String>) {
        self.members.lock().insert(
            peer.clone(),
            MemberInfo {
                display_name: display_name.to_string(),
                public_key,
            },
        );
    }

    fn member_name(&self, peer: &PeerId) -> String {
        self.members
            .lock()
            .get(peer)
            .map(|info| info.display_name.clone())
            .unwrap_or_else(|| peer.to_string())
    }

    fn announce_peer(&self, peer: &PeerId, display_name: &str) {
        if self.announced.lock().insert(peer.clone()) {
            let _ = self.events_tx.send(MeshEvent::PeerConnected {
                peer_id: peer.clone(),
                display_name: display_name.to_string(),
            });
        }
    }

    async fn fail_connection(&self, peer: &PeerId, kind: SignalKind, err: &MeshError) {
        tracing::warn!(target = "mesh", peer_id = %peer, ?kind, "connection failed: {err}");
        self.drop_peer_connection(peer, kind, ConnState::Failed).await;
    }

    /// Retire one connection; when it is the data connection the peer is
    /// gone from the mesh entirely.
    async fn drop_peer_connection(&self, peer: &PeerId, kind: SignalKind, terminal: ConnState) {
        self.registry.retire(peer, kind, terminal).await;
        self.paths.lock().remove(&(peer.clone(), kind));
        if kind == SignalKind::Data {
            self.mux.forget_peer(peer);
            self.members.lock().remove(peer);
            if self.announced.lock().remove(peer) {
                let _ = self.events_tx.send(MeshEvent::PeerLeft {
                    peer_id: peer.clone(),
                });
            }
        }
    }

    async fn drop_peer(&self, peer: &PeerId, terminal: ConnState) {
        if self.registry.get(peer, SignalKind::Voice).is_some() {
            self.drop_peer_connection(peer, SignalKind::Voice, terminal).await;
        }
        self.drop_peer_connection(peer, SignalKind::Data, terminal).await;
    }

    /// Total teardown: every connection, channel, and secret goes away and
    /// the role machine resets.
    async fn teardown(&self, event: MeshEvent) {
        self.registry.retire_all().await;
        self.crypto.forget_all();
        self.paths.lock().clear();
        self.members.lock().clear();
        self.announced.lock().clear();
        *self.role.lock() = Role::Unconfigured;
        *self.lobby.lock() = None;
        tracing::info!(target = "mesh", "mesh torn down");
        let _ = self.events_tx.send(event);
    }
}

//! In-memory endpoint network.
//!
//! Endpoints created against one [`MockNetwork`] negotiate with each other
//! through opaque offer/answer tokens, emit a scripted candidate gathering
//! sequence, and route channel payloads directly between linked records. No
//! OS networking is involved, so the full orchestrator runs in tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{IceCandidateBlob, PeerId, SdpPayload, SignalKind};

use super::{EndpointEvent, EndpointFactory, EndpointState, PeerEndpoint, TransportError};

#[derive(Default)]
pub struct MockNetwork {
    state: Mutex<NetState>,
}

#[derive(Default)]
struct NetState {
    next_id: u64,
    endpoints: HashMap<u64, EndpointRecord>,
    offers: HashMap<String, u64>,
    answers: HashMap<String, u64>,
}

struct EndpointRecord {
    events: mpsc::UnboundedSender<EndpointEvent>,
    peer: Option<u64>,
    answered: bool,
    remote_candidates: usize,
    connected: bool,
    closed: bool,
    hold_sends: bool,
    playback_released: bool,
    channels: HashMap<u16, ChannelRecord>,
}

struct ChannelRecord {
    label: String,
    ordered: bool,
    open: bool,
    buffered: u64,
    threshold: Option<u64>,
    held: Vec<Bytes>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self) -> (u64, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.endpoints.insert(
            id,
            EndpointRecord {
                events: tx,
                peer: None,
                answered: false,
                remote_candidates: 0,
                connected: false,
                closed: false,
                hold_sends: false,
                playback_released: false,
                channels: HashMap::new(),
            },
        );
        (id, rx)
    }

    fn emit(state: &NetState, id: u64, event: EndpointEvent) {
        if let Some(record) = state.endpoints.get(&id) {
            let _ = record.events.send(event);
        }
    }

    fn emit_gathering(state: &NetState, id: u64) {
        for seq in 1..=2u32 {
            Self::emit(
                state,
                id,
                EndpointEvent::Candidate(IceCandidateBlob {
                    candidate: format!("candidate:{seq} 1 udp 2130706431 10.0.{id}.{seq} 5000 typ host"),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                }),
            );
        }
        Self::emit(state, id, EndpointEvent::GatheringComplete);
    }

    /// Connected once linked, answered, and at least one remote candidate
    /// has been applied. Fires at most once per endpoint.
    fn check_connectivity(state: &mut NetState, id: u64) {
        let ready = match state.endpoints.get(&id) {
            Some(rec) => {
                rec.peer.is_some()
                    && rec.answered
                    && rec.remote_candidates > 0
                    && !rec.connected
                    && !rec.closed
            }
            None => false,
        };
        if !ready {
            return;
        }
        if let Some(rec) = state.endpoints.get_mut(&id) {
            rec.connected = true;
        }
        Self::emit(state, id, EndpointEvent::StateChanged(EndpointState::Connected));
        Self::open_matching_channels(state, id);
    }

    /// A channel opens when both linked endpoints created the same id and
    /// both are connected.
    fn open_matching_channels(state: &mut NetState, id: u64) {
        let Some(peer_id) = state.endpoints.get(&id).and_then(|r| r.peer) else {
            return;
        };
        let both_connected = state.endpoints.get(&id).is_some_and(|r| r.connected)
            && state.endpoints.get(&peer_id).is_some_and(|r| r.connected);
        if !both_connected {
            return;
        }
        let local_pending: Vec<u16> = state
            .endpoints
            .get(&id)
            .map(|r| {
                r.channels
                    .iter()
                    .filter(|(_, ch)| !ch.open)
                    .map(|(chan_id, _)| *chan_id)
                    .collect()
            })
            .unwrap_or_default();
        for chan_id in local_pending {
            let remote_has = state
                .endpoints
                .get(&peer_id)
                .is_some_and(|r| r.channels.contains_key(&chan_id));
            if !remote_has {
                continue;
            }
            for endpoint in [id, peer_id] {
                let newly_open = state
                    .endpoints
                    .get_mut(&endpoint)
                    .and_then(|r| r.channels.get_mut(&chan_id))
                    .map(|ch| {
                        let was = ch.open;
                        ch.open = true;
                        !was
                    })
                    .unwrap_or(false);
                if newly_open {
                    Self::emit(state, endpoint, EndpointEvent::ChannelOpen { id: chan_id });
                }
            }
        }
    }
}

pub struct MockEndpoint {
    network: Arc<MockNetwork>,
    id: u64,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EndpointEvent>>>,
}

impl MockEndpoint {
    pub fn new(network: Arc<MockNetwork>) -> Self {
        let (id, rx) = network.register();
        Self {
            network,
            id,
            events_rx: Mutex::new(Some(rx)),
        }
    }

    /// Test hook: make sends accumulate in the channel buffer instead of
    /// delivering, so backpressure paths can be exercised.
    pub fn hold_sends(&self, hold: bool) {
        let mut state = self.network.state.lock();
        if let Some(rec) = state.endpoints.get_mut(&self.id) {
            rec.hold_sends = hold;
        }
    }

    /// Test hook: deliver everything held back and drain the buffers,
    /// emitting `BufferedAmountLow` where a threshold is armed.
    pub fn release_held(&self) {
        let mut state = self.network.state.lock();
        let Some(peer) = state.endpoints.get(&self.id).and_then(|r| r.peer) else {
            return;
        };
        let mut deliveries: Vec<(u16, Bytes)> = Vec::new();
        let mut low_events: Vec<u16> = Vec::new();
        if let Some(rec) = state.endpoints.get_mut(&self.id) {
            for (chan_id, ch) in rec.channels.iter_mut() {
                if ch.held.is_empty() {
                    continue;
                }
                for payload in ch.held.drain(..) {
                    deliveries.push((*chan_id, payload));
                }
                ch.buffered = 0;
                if ch.threshold.is_some() {
                    low_events.push(*chan_id);
                }
            }
        }
        for (chan_id, payload) in deliveries {
            MockNetwork::emit(&state, peer, EndpointEvent::ChannelMessage { id: chan_id, payload });
        }
        for chan_id in low_events {
            MockNetwork::emit(&state, self.id, EndpointEvent::BufferedAmountLow { id: chan_id });
        }
    }

    pub fn playback_released(&self) -> bool {
        let state = self.network.state.lock();
        state
            .endpoints
            .get(&self.id)
            .map(|r| r.playback_released)
            .unwrap_or(false)
    }
}

#[async_trait]
impl PeerEndpoint for MockEndpoint {
    async fn create_offer(&self) -> Result<SdpPayload, TransportError> {
        let token = format!("v=0 mock-offer {}", Uuid::new_v4());
        let mut state = self.network.state.lock();
        state.offers.insert(token.clone(), self.id);
        MockNetwork::emit(
            &state,
            self.id,
            EndpointEvent::StateChanged(EndpointState::Connecting),
        );
        MockNetwork::emit_gathering(&state, self.id);
        Ok(SdpPayload {
            sdp_type: "offer".into(),
            sdp: token,
        })
    }

    async fn accept_offer(&self, offer: SdpPayload) -> Result<SdpPayload, TransportError> {
        let mut state = self.network.state.lock();
        let offerer = state
            .offers
            .get(&offer.sdp)
            .copied()
            .ok_or_else(|| TransportError::Setup("unknown offer description".into()))?;
        if let Some(rec) = state.endpoints.get_mut(&self.id) {
            rec.peer = Some(offerer);
        }
        if let Some(rec) = state.endpoints.get_mut(&offerer) {
            rec.peer = Some(self.id);
        }
        MockNetwork::emit(
            &state,
            self.id,
            EndpointEvent::StateChanged(EndpointState::Connecting),
        );
        MockNetwork::emit_gathering(&state, self.id);
        let token = format!("v=0 mock-answer {}", Uuid::new_v4());
        state.answers.insert(token.clone(), self.id);
        // The responder has both descriptions at this point.
        if let Some(rec) = state.endpoints.get_mut(&self.id) {
            rec.answered = true;
        }
        MockNetwork::check_connectivity(&mut state, self.id);
        Ok(SdpPayload {
            sdp_type: "answer".into(),
            sdp: token,
        })
    }

    async fn apply_answer(&self, answer: SdpPayload) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        let responder = state
            .answers
            .get(&answer.sdp)
            .copied()
            .ok_or_else(|| TransportError::Setup("unknown answer description".into()))?;
        let linked = state
            .endpoints
            .get(&self.id)
            .is_some_and(|r| r.peer == Some(responder));
        if !linked {
            return Err(TransportError::Setup("answer from an unlinked endpoint".into()));
        }
        if let Some(rec) = state.endpoints.get_mut(&self.id) {
            rec.answered = true;
        }
        MockNetwork::check_connectivity(&mut state, self.id);
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        _candidate: IceCandidateBlob,
    ) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        if let Some(rec) = state.endpoints.get_mut(&self.id) {
            rec.remote_candidates += 1;
        }
        MockNetwork::check_connectivity(&mut state, self.id);
        Ok(())
    }

    async fn open_channel(&self, id: u16, label: &str, ordered: bool)
    -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        let rec = state
            .endpoints
            .get_mut(&self.id)
            .ok_or(TransportError::ChannelClosed)?;
        rec.channels.entry(id).or_insert(ChannelRecord {
            label: label.to_string(),
            ordered,
            open: false,
            buffered: 0,
            threshold: None,
            held: Vec::new(),
        });
        MockNetwork::open_matching_channels(&mut state, self.id);
        Ok(())
    }

    async fn close_channel(&self, id: u16) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        let existed = state
            .endpoints
            .get_mut(&self.id)
            .and_then(|r| r.channels.remove(&id))
            .is_some();
        if !existed {
            return Err(TransportError::UnknownChannel(id));
        }
        MockNetwork::emit(&state, self.id, EndpointEvent::ChannelClosed { id });
        if let Some(peer) = state.endpoints.get(&self.id).and_then(|r| r.peer) {
            if let Some(rec) = state.endpoints.get_mut(&peer) {
                rec.channels.remove(&id);
            }
            MockNetwork::emit(&state, peer, EndpointEvent::ChannelClosed { id });
        }
        Ok(())
    }

    async fn send(&self, id: u16, payload: Bytes) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        let peer = state
            .endpoints
            .get(&self.id)
            .and_then(|r| r.peer)
            .ok_or(TransportError::NotConnected)?;
        let rec = state
            .endpoints
            .get_mut(&self.id)
            .ok_or(TransportError::ChannelClosed)?;
        let hold = rec.hold_sends;
        let channel = rec
            .channels
            .get_mut(&id)
            .ok_or(TransportError::UnknownChannel(id))?;
        if !channel.open {
            return Err(TransportError::NotConnected);
        }
        if hold {
            channel.buffered += payload.len() as u64;
            channel.held.push(payload);
        } else {
            MockNetwork::emit(&state, peer, EndpointEvent::ChannelMessage { id, payload });
        }
        Ok(())
    }

    async fn buffered_amount(&self, id: u16) -> u64 {
        let state = self.network.state.lock();
        state
            .endpoints
            .get(&self.id)
            .and_then(|r| r.channels.get(&id))
            .map(|ch| ch.buffered)
            .unwrap_or(0)
    }

    async fn set_buffered_amount_low_threshold(
        &self,
        id: u16,
        threshold: u64,
    ) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        let channel = state
            .endpoints
            .get_mut(&self.id)
            .and_then(|r| r.channels.get_mut(&id))
            .ok_or(TransportError::UnknownChannel(id))?;
        channel.threshold = Some(threshold);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EndpointEvent>> {
        self.events_rx.lock().take()
    }

    async fn shutdown(&self) {
        let mut state = self.network.state.lock();
        let already_closed = state
            .endpoints
            .get(&self.id)
            .map(|r| r.closed)
            .unwrap_or(true);
        if already_closed {
            return;
        }
        let peer = state.endpoints.get(&self.id).and_then(|r| r.peer);
        if let Some(rec) = state.endpoints.get_mut(&self.id) {
            rec.closed = true;
            rec.connected = false;
        }
        MockNetwork::emit(&state, self.id, EndpointEvent::StateChanged(EndpointState::Closed));
        if let Some(peer) = peer {
            let peer_open = state.endpoints.get(&peer).is_some_and(|r| !r.closed);
            if peer_open {
                if let Some(rec) = state.endpoints.get_mut(&peer) {
                    rec.closed = true;
                    rec.connected = false;
                }
                MockNetwork::emit(&state, peer, EndpointEvent::StateChanged(EndpointState::Closed));
            }
        }
    }

    async fn release_playback(&self) {
        let mut state = self.network.state.lock();
        if let Some(rec) = state.endpoints.get_mut(&self.id) {
            rec.playback_released = true;
        }
    }
}

/// Factory handing out endpoints on one shared network, keeping the concrete
/// handles around so tests can reach the hooks.
pub struct MockEndpointFactory {
    network: Arc<MockNetwork>,
    created: Mutex<HashMap<(PeerId, SignalKind), Arc<MockEndpoint>>>,
}

impl MockEndpointFactory {
    pub fn new(network: Arc<MockNetwork>) -> Arc<Self> {
        Arc::new(Self {
            network,
            created: Mutex::new(HashMap::new()),
        })
    }

    pub fn endpoint(&self, peer: &PeerId, kind: SignalKind) -> Option<Arc<MockEndpoint>> {
        self.created.lock().get(&(peer.clone(), kind)).cloned()
    }
}

impl EndpointFactory for MockEndpointFactory {
    fn create(
        &self,
        peer: &PeerId,
        kind: SignalKind,
    ) -> Result<Arc<dyn PeerEndpoint>, TransportError> {
        let endpoint = Arc::new(MockEndpoint::new(self.network.clone()));
        self.created
            .lock()
            .insert((peer.clone(), kind), endpoint.clone());
        Ok(endpoint)
    }
}

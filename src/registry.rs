//! Book-keeping for per-peer connections and their sub-channels.
//!
//! The registry is the single owner of connection records: every other
//! component looks connections up here and goes through [`ConnectionRegistry::retire`]
//! to delete one. Retiring is the cascade-cleanup point: channels close, the
//! pair's shared secret is dropped (data connections only), a voice
//! endpoint's playback resource is released, and the record disappears.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::crypto::CryptoLayer;
use crate::protocol::{IceCandidateBlob, PeerId, SignalKind};
use crate::transport::PeerEndpoint;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("a live connection to {0} already exists")]
    DuplicatePeer(PeerId),
    #[error("no connection to {0}")]
    UnknownPeer(PeerId),
    #[error("channel {0} already exists on this connection")]
    ChannelExists(u16),
    #[error("no channel {0} on this connection")]
    UnknownChannel(u16),
}

/// Connection lifecycle. `Closed` and `Failed` are terminal; a record in a
/// terminal state may be replaced by a fresh one for the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
    Failed,
}

impl ConnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Failed)
    }
}

/// Which side of the offer/answer exchange this connection is playing.
/// Fixed at creation time; an instruction to offer to a peer we are already
/// answering for is glare and gets ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offering,
    Answering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub label: String,
    pub ordered: bool,
    pub state: ChannelState,
}

/// The default channel's id. Label `"default"`, always ordered, opened as
/// part of negotiation, never individually closable.
pub const DEFAULT_CHANNEL_ID: u16 = 0;

pub struct PeerConnection {
    pub peer_id: PeerId,
    pub display_name: String,
    pub kind: SignalKind,
    pub role: NegotiationRole,
    pub endpoint: Arc<dyn PeerEndpoint>,
    state: Mutex<ConnState>,
    next_channel_id: Mutex<u16>,
    pending_candidates: Mutex<Vec<IceCandidateBlob>>,
    channels: Mutex<HashMap<u16, ChannelRecord>>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("display_name", &self.display_name)
            .field("kind", &self.kind)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl PeerConnection {
    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ConnState) {
        *self.state.lock() = state;
    }

    /// Remember a locally gathered candidate for the gathering-complete
    /// flush. The caller forwards it immediately as well.
    pub fn buffer_candidate(&self, candidate: IceCandidateBlob) {
        self.pending_candidates.lock().push(candidate);
    }

    /// Drain the buffered candidates for redelivery. Receivers treat
    /// duplicates as idempotent, so the flush path is safe to repeat.
    pub fn take_buffered_candidates(&self) -> Vec<IceCandidateBlob> {
        std::mem::take(&mut *self.pending_candidates.lock())
    }

    /// Next locally allocated channel id. Id 0 is the default channel and
    /// never comes out of here.
    pub fn allocate_channel_id(&self) -> u16 {
        let mut next = self.next_channel_id.lock();
        let id = *next;
        *next += 1;
        id
    }

    /// Mirror-create resync: a remotely announced id bumps the local
    /// counter to `max(next, id + 1)` so the two sides never collide.
    pub fn resync_channel_counter(&self, remote_id: u16) {
        let mut next = self.next_channel_id.lock();
        *next = (*next).max(remote_id.saturating_add(1));
    }

    pub fn insert_channel(
        &self,
        id: u16,
        label: &str,
        ordered: bool,
    ) -> Result<(), RegistryError> {
        let mut channels = self.channels.lock();
        if channels.contains_key(&id) {
            return Err(RegistryError::ChannelExists(id));
        }
        channels.insert(
            id,
            ChannelRecord {
                label: label.to_string(),
                ordered,
                state: ChannelState::Connecting,
            },
        );
        Ok(())
    }

    pub fn set_channel_state(&self, id: u16, state: ChannelState) -> Result<(), RegistryError> {
        let mut channels = self.channels.lock();
        match channels.get_mut(&id) {
            Some(record) => {
                record.state = state;
                Ok(())
            }
            None => Err(RegistryError::UnknownChannel(id)),
        }
    }

    pub fn remove_channel(&self, id: u16) -> Option<ChannelRecord> {
        self.channels.lock().remove(&id)
    }

    pub fn channel(&self, id: u16) -> Option<ChannelRecord> {
        self.channels.lock().get(&id).cloned()
    }

    pub fn channel_ids(&self) -> Vec<u16> {
        self.channels.lock().keys().copied().collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

pub struct ConnectionRegistry {
    crypto: Arc<CryptoLayer>,
    connections: Mutex<HashMap<(PeerId, SignalKind), Arc<PeerConnection>>>,
}

impl ConnectionRegistry {
    pub fn new(crypto: Arc<CryptoLayer>) -> Self {
        Self {
            crypto,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Create a record for `peer_id`/`kind`. An existing non-terminal record
    /// wins; a terminal leftover is silently replaced.
    pub fn create_connection(
        &self,
        peer_id: PeerId,
        display_name: String,
        kind: SignalKind,
        role: NegotiationRole,
        endpoint: Arc<dyn PeerEndpoint>,
    ) -> Result<Arc<PeerConnection>, RegistryError> {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(&(peer_id.clone(), kind)) {
            if !existing.state().is_terminal() {
                return Err(RegistryError::DuplicatePeer(peer_id));
            }
        }
        let connection = Arc::new(PeerConnection {
            peer_id: peer_id.clone(),
            display_name,
            kind,
            role,
            endpoint,
            state: Mutex::new(ConnState::New),
            next_channel_id: Mutex::new(DEFAULT_CHANNEL_ID + 1),
            pending_candidates: Mutex::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
        });
        connections.insert((peer_id, kind), Arc::clone(&connection));
        Ok(connection)
    }

    pub fn get(&self, peer_id: &PeerId, kind: SignalKind) -> Option<Arc<PeerConnection>> {
        self.connections.lock().get(&(peer_id.clone(), kind)).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId, kind: SignalKind) -> bool {
        self.get(peer_id, kind)
            .is_some_and(|conn| !conn.state().is_terminal())
    }

    /// Peers with a connected data-plane connection.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let connections = self.connections.lock();
        let mut peers: Vec<PeerId> = connections
            .iter()
            .filter(|((_, kind), conn)| {
                *kind == SignalKind::Data && conn.state() == ConnState::Connected
            })
            .map(|((peer, _), _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Move a connection to a terminal state and run the cascade: shut the
    /// endpoint down, drop the pair's secret (data), release playback
    /// (voice), remove the record.
    pub async fn retire(&self, peer_id: &PeerId, kind: SignalKind, terminal: ConnState) {
        debug_assert!(terminal.is_terminal());
        let removed = self.connections.lock().remove(&(peer_id.clone(), kind));
        let Some(connection) = removed else {
            tracing::debug!(target = "mesh", peer_id = %peer_id, ?kind, "retire on unknown connection");
            return;
        };
        connection.set_state(terminal);
        {
            let mut channels = connection.channels.lock();
            for record in channels.values_mut() {
                record.state = ChannelState::Closed;
            }
            channels.clear();
        }
        connection.endpoint.shutdown().await;
        match kind {
            SignalKind::Data => {
                self.crypto.forget(peer_id);
            }
            SignalKind::Voice => {
                connection.endpoint.release_playback().await;
            }
        }
        tracing::info!(target = "mesh", peer_id = %peer_id, ?kind, ?terminal, "connection retired");
    }

    /// Tear every connection down. Relay loss ends the whole mesh.
    pub async fn retire_all(&self) {
        let keys: Vec<(PeerId, SignalKind)> = self.connections.lock().keys().cloned().collect();
        for (peer_id, kind) in keys {
            self.retire(&peer_id, kind, ConnState::Closed).await;
        }
    }
}

//! Sub-channel protocol over established peer connections.
//!
//! The multiplexer speaks the `{opcode, payload}` frames of the channel
//! plane: mirror-created sub-channels (`newchan`), last-write-wins message
//! and variable slots with one-shot freshness, voice-call signaling, and
//! flow-controlled sends that can wait for the transport buffer to drain.
//! Inbound frames reach it through the coordinator's per-connection task;
//! it never reads from an endpoint itself.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use crate::mesh::{MeshEvent, VoiceSignal};
use crate::protocol::{ChannelFrame, PeerId, SignalKind};
use crate::registry::{
    ChannelState, ConnectionRegistry, DEFAULT_CHANNEL_ID, PeerConnection, RegistryError,
};
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("the default channel cannot be closed")]
    DefaultChannelClose,
    #[error("no data connection to {0}")]
    UnknownPeer(PeerId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("channel frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Addressable storage slot on a (peer, channel) pair. Messages have one
/// slot per direction class; vars and lists are named.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Slot {
    GlobalMessage,
    PrivateMessage,
    GlobalVar(String),
    PrivateVar(String),
    GlobalList(String),
    PrivateList(String),
}

struct StoredValue {
    value: Value,
    fresh: bool,
}

pub struct ChannelMultiplexer {
    registry: Arc<ConnectionRegistry>,
    events: mpsc::UnboundedSender<MeshEvent>,
    values: Mutex<HashMap<(PeerId, u16, Slot), StoredValue>>,
    drains: Mutex<HashMap<(PeerId, u16), Arc<Notify>>>,
}

impl ChannelMultiplexer {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Self {
        Self {
            registry,
            events,
            values: Mutex::new(HashMap::new()),
            drains: Mutex::new(HashMap::new()),
        }
    }

    fn data_connection(&self, peer: &PeerId) -> Result<Arc<PeerConnection>, MuxError> {
        self.registry
            .get(peer, SignalKind::Data)
            .ok_or_else(|| MuxError::UnknownPeer(peer.clone()))
    }

    /// Open a named sub-channel towards `peer`: allocate the next id,
    /// announce it over the default channel, then open the transport side.
    pub async fn open_channel(
        &self,
        peer: &PeerId,
        name: &str,
        ordered: bool,
    ) -> Result<u16, MuxError> {
        let connection = self.data_connection(peer)?;
        let id = connection.allocate_channel_id();
        connection.insert_channel(id, name, ordered)?;
        let announce = ChannelFrame::Newchan {
            name: name.to_string(),
            ordered,
            id,
        };
        self.send_frame(&connection, DEFAULT_CHANNEL_ID, &announce, false)
            .await?;
        connection.endpoint.open_channel(id, name, ordered).await?;
        tracing::debug!(target = "mux", peer_id = %peer, channel = id, label = name, "sub-channel announced");
        Ok(id)
    }

    /// Mirror a remotely announced sub-channel and resync the id counter so
    /// both sides keep allocating disjoint ids.
    pub async fn accept_remote_channel(
        &self,
        peer: &PeerId,
        name: &str,
        ordered: bool,
        id: u16,
    ) -> Result<(), MuxError> {
        let connection = self.data_connection(peer)?;
        connection.resync_channel_counter(id);
        connection.insert_channel(id, name, ordered)?;
        connection.endpoint.open_channel(id, name, ordered).await?;
        tracing::debug!(target = "mux", peer_id = %peer, channel = id, label = name, "sub-channel mirrored");
        Ok(())
    }

    pub async fn close_channel(&self, peer: &PeerId, id: u16) -> Result<(), MuxError> {
        if id == DEFAULT_CHANNEL_ID {
            return Err(MuxError::DefaultChannelClose);
        }
        let connection = self.data_connection(peer)?;
        connection.set_channel_state(id, ChannelState::Closing)?;
        connection.endpoint.close_channel(id).await?;
        connection.remove_channel(id);
        let mut values = self.values.lock();
        values.retain(|(value_peer, channel, _), _| !(value_peer == peer && *channel == id));
        Ok(())
    }

    /// Send a private message to one peer on one channel.
    pub async fn send_message(
        &self,
        peer: &PeerId,
        channel: u16,
        payload: Value,
        wait: bool,
    ) -> Result<(), MuxError> {
        let connection = self.data_connection(peer)?;
        self.send_frame(&connection, channel, &ChannelFrame::PMsg(payload), wait)
            .await
    }

    /// Send a global message to every connected peer on `channel`. Peers
    /// without that channel are skipped with a debug log.
    pub async fn broadcast_message(
        &self,
        channel: u16,
        payload: Value,
        wait: bool,
    ) -> Result<(), MuxError> {
        let frame = ChannelFrame::GMsg(payload);
        for peer in self.registry.connected_peers() {
            let Ok(connection) = self.data_connection(&peer) else {
                continue;
            };
            if connection.channel(channel).is_none() {
                tracing::debug!(target = "mux", peer_id = %peer, channel, "peer lacks channel, skipped");
                continue;
            }
            self.send_frame(&connection, channel, &frame, wait).await?;
        }
        Ok(())
    }

    pub async fn send_var(
        &self,
        peer: &PeerId,
        channel: u16,
        name: &str,
        value: Value,
        wait: bool,
    ) -> Result<(), MuxError> {
        let connection = self.data_connection(peer)?;
        let frame = ChannelFrame::PVar {
            name: name.to_string(),
            value,
        };
        self.send_frame(&connection, channel, &frame, wait).await
    }

    pub async fn broadcast_var(
        &self,
        channel: u16,
        name: &str,
        value: Value,
        wait: bool,
    ) -> Result<(), MuxError> {
        let frame = ChannelFrame::GVar {
            name: name.to_string(),
            value,
        };
        for peer in self.registry.connected_peers() {
            let Ok(connection) = self.data_connection(&peer) else {
                continue;
            };
            if connection.channel(channel).is_none() {
                continue;
            }
            self.send_frame(&connection, channel, &frame, wait).await?;
        }
        Ok(())
    }

    pub async fn send_list(
        &self,
        peer: &PeerId,
        channel: u16,
        name: &str,
        value: Vec<Value>,
        wait: bool,
    ) -> Result<(), MuxError> {
        let connection = self.data_connection(peer)?;
        let frame = ChannelFrame::PList {
            name: name.to_string(),
            value,
        };
        self.send_frame(&connection, channel, &frame, wait).await
    }

    pub async fn broadcast_list(
        &self,
        channel: u16,
        name: &str,
        value: Vec<Value>,
        wait: bool,
    ) -> Result<(), MuxError> {
        let frame = ChannelFrame::GList {
            name: name.to_string(),
            value,
        };
        for peer in self.registry.connected_peers() {
            let Ok(connection) = self.data_connection(&peer) else {
                continue;
            };
            if connection.channel(channel).is_none() {
                continue;
            }
            self.send_frame(&connection, channel, &frame, wait).await?;
        }
        Ok(())
    }

    pub async fn ring(&self, peer: &PeerId) -> Result<(), MuxError> {
        let connection = self.data_connection(peer)?;
        self.send_frame(&connection, DEFAULT_CHANNEL_ID, &ChannelFrame::Ring, false)
            .await
    }

    pub async fn pickup(&self, peer: &PeerId) -> Result<(), MuxError> {
        let connection = self.data_connection(peer)?;
        self.send_frame(&connection, DEFAULT_CHANNEL_ID, &ChannelFrame::Pickup, false)
            .await
    }

    pub async fn hangup(&self, peer: &PeerId) -> Result<(), MuxError> {
        let connection = self.data_connection(peer)?;
        self.send_frame(&connection, DEFAULT_CHANNEL_ID, &ChannelFrame::Hangup, false)
            .await
    }

    /// Announce a graceful departure to one peer.
    pub async fn goodbye(&self, peer: &PeerId) -> Result<(), MuxError> {
        let connection = self.data_connection(peer)?;
        self.send_frame(&connection, DEFAULT_CHANNEL_ID, &ChannelFrame::Goodbye, false)
            .await
    }

    /// Serialize and send one frame on `channel`. With `wait` the call arms
    /// a zero buffered-amount threshold before sending and resolves only
    /// once the transport reports the buffer drained.
    pub async fn send_frame(
        &self,
        connection: &Arc<PeerConnection>,
        channel: u16,
        frame: &ChannelFrame,
        wait: bool,
    ) -> Result<(), MuxError> {
        if connection.channel(channel).is_none() {
            return Err(MuxError::Registry(RegistryError::UnknownChannel(channel)));
        }
        let payload = Bytes::from(serde_json::to_vec(frame)?);
        if !wait {
            connection.endpoint.send(channel, payload).await?;
            return Ok(());
        }

        connection
            .endpoint
            .set_buffered_amount_low_threshold(channel, 0)
            .await?;
        let notify = self.drain_notify(&connection.peer_id, channel);
        connection.endpoint.send(channel, payload).await?;
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so a drain landing between the
            // check and the await is never lost.
            notified.as_mut().enable();
            if connection.endpoint.buffered_amount(channel).await == 0 {
                break;
            }
            notified.await;
        }
        Ok(())
    }

    fn drain_notify(&self, peer: &PeerId, channel: u16) -> Arc<Notify> {
        let mut drains = self.drains.lock();
        Arc::clone(
            drains
                .entry((peer.clone(), channel))
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    /// Fed by the per-connection task on a buffered-amount-low event. One
    /// drain wakes every send waiting on the channel; each one re-checks the
    /// buffered amount itself.
    pub fn note_buffer_drained(&self, peer: &PeerId, channel: u16) {
        if let Some(notify) = self.drains.lock().get(&(peer.clone(), channel)) {
            notify.notify_waiters();
        }
    }

    /// Store an inbound value/message frame and emit the matching event.
    /// Voice signaling and non-storage opcodes are handled by the caller.
    pub fn store_inbound(&self, peer: &PeerId, channel: u16, frame: ChannelFrame) {
        let (slot, value) = match frame {
            ChannelFrame::GMsg(value) => (Slot::GlobalMessage, value),
            ChannelFrame::PMsg(value) => (Slot::PrivateMessage, value),
            ChannelFrame::GVar { name, value } => (Slot::GlobalVar(name), value),
            ChannelFrame::PVar { name, value } => (Slot::PrivateVar(name), value),
            ChannelFrame::GList { name, value } => (Slot::GlobalList(name), Value::Array(value)),
            ChannelFrame::PList { name, value } => (Slot::PrivateList(name), Value::Array(value)),
            other => {
                tracing::debug!(target = "mux", peer_id = %peer, ?other, "non-storage frame ignored");
                return;
            }
        };
        let is_message = matches!(slot, Slot::GlobalMessage | Slot::PrivateMessage);
        self.values.lock().insert(
            (peer.clone(), channel, slot),
            StoredValue {
                value: value.clone(),
                fresh: true,
            },
        );
        if is_message {
            let _ = self.events.send(MeshEvent::ChannelData {
                peer_id: peer.clone(),
                channel,
                data: value,
            });
        }
    }

    pub fn emit_voice_signal(&self, peer: &PeerId, signal: VoiceSignal) {
        let _ = self.events.send(MeshEvent::Voice {
            peer_id: peer.clone(),
            signal,
        });
    }

    /// The last value written to a slot, regardless of freshness.
    pub fn value(&self, peer: &PeerId, channel: u16, slot: &Slot) -> Option<Value> {
        self.values
            .lock()
            .get(&(peer.clone(), channel, slot.clone()))
            .map(|stored| stored.value.clone())
    }

    /// The slot value if it has not been polled since the last write. Polling
    /// consumes the freshness flag.
    pub fn take_new_value(&self, peer: &PeerId, channel: u16, slot: &Slot) -> Option<Value> {
        let mut values = self.values.lock();
        let stored = values.get_mut(&(peer.clone(), channel, slot.clone()))?;
        if !stored.fresh {
            return None;
        }
        stored.fresh = false;
        Some(stored.value.clone())
    }

    /// Drop everything held for a departed peer.
    pub fn forget_peer(&self, peer: &PeerId) {
        self.values.lock().retain(|(value_peer, _, _), _| value_peer != peer);
        self.drains.lock().retain(|(drain_peer, _), _| drain_peer != peer);
    }
}

//! Opaque peer-transport capabilities.
//!
//! The orchestrator never touches a real peer connection directly: it drives
//! a [`PeerEndpoint`], which stands in for "open an unreliable/reliable
//! bidirectional byte channel to a peer". Production wires this to a WebRTC
//! stack; the test suite uses [`mock::MockNetwork`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::{IceCandidateBlob, PeerId, SdpPayload, SignalKind};

pub mod mock;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("transport operation timed out")]
    Timeout,
    #[error("no channel with id {0} on this connection")]
    UnknownChannel(u16),
    #[error("endpoint is not connected")]
    NotConnected,
}

/// Connection lifecycle as observed from the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl EndpointState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EndpointState::Closed | EndpointState::Failed)
    }
}

/// Everything an endpoint reports back, consumed by exactly one task per
/// connection so all state mutation for a peer is serialized.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// A locally gathered connectivity candidate, ready for trickle delivery.
    Candidate(IceCandidateBlob),
    /// Local candidate gathering finished; buffered candidates get flushed.
    GatheringComplete,
    StateChanged(EndpointState),
    ChannelOpen { id: u16 },
    ChannelClosed { id: u16 },
    ChannelMessage { id: u16, payload: Bytes },
    /// The channel's send buffer drained to or below the armed threshold.
    BufferedAmountLow { id: u16 },
}

/// One peer connection worth of transport capability.
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    async fn create_offer(&self) -> Result<SdpPayload, TransportError>;

    /// Apply a remote offer and produce the local answer.
    async fn accept_offer(&self, offer: SdpPayload) -> Result<SdpPayload, TransportError>;

    async fn apply_answer(&self, answer: SdpPayload) -> Result<(), TransportError>;

    /// Receivers must tolerate duplicate candidates idempotently; the
    /// buffered-fallback flush on the sending side may redeliver.
    async fn add_remote_candidate(&self, candidate: IceCandidateBlob)
    -> Result<(), TransportError>;

    async fn open_channel(&self, id: u16, label: &str, ordered: bool)
    -> Result<(), TransportError>;

    async fn close_channel(&self, id: u16) -> Result<(), TransportError>;

    async fn send(&self, id: u16, payload: Bytes) -> Result<(), TransportError>;

    async fn buffered_amount(&self, id: u16) -> u64;

    async fn set_buffered_amount_low_threshold(
        &self,
        id: u16,
        threshold: u64,
    ) -> Result<(), TransportError>;

    /// The endpoint's event stream. Yields `None` once taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EndpointEvent>>;

    /// Tear the whole connection down.
    async fn shutdown(&self);

    /// Release the playback resource of a voice endpoint. No-op for data.
    async fn release_playback(&self) {}
}

/// Creates endpoints on demand as peers are discovered.
pub trait EndpointFactory: Send + Sync {
    fn create(
        &self,
        peer: &PeerId,
        kind: SignalKind,
    ) -> Result<Arc<dyn PeerEndpoint>, TransportError>;
}

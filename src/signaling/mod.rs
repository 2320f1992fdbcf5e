//! Relay session plumbing.
//!
//! [`SignalingChannel`] owns the socket to the relay: it authenticates,
//! answers keepalives, resolves lobby-role requests against their acks, and
//! fans every other frame out to exactly one registered handler per opcode.
//! It knows nothing about peers or meshes; that is the coordinator's job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{ClientFrame, ConfigRejection, PeerId, RelayFrame, RelayOpcode};

pub mod socket;

pub use socket::{MemorySignalSocket, SignalSocket, WsSignalSocket, pair};

/// Delay between a received keepalive ack and the next keepalive frame.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const CONFIG_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("signaling socket failure: {0}")]
    Socket(String),
    #[error("signaling socket is closed")]
    SocketClosed,
    #[error("not connected to the relay")]
    NotConnected,
    #[error("a handler is already registered for {0:?}")]
    HandlerExists(RelayOpcode),
    #[error("a mode-configuration request is already in flight")]
    ConfigInFlight,
    #[error("relay rejected the request: {0}")]
    Rejected(ConfigRejection),
    #[error("timed out waiting for the relay")]
    Timeout,
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Relay link lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
}

/// Which role the relay granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAck {
    Host,
    Peer,
}

pub struct SignalingChannel {
    socket: Mutex<Option<Arc<dyn SignalSocket>>>,
    state: Mutex<LinkState>,
    handlers: Mutex<HashMap<RelayOpcode, mpsc::UnboundedSender<RelayFrame>>>,
    pending_init: Mutex<Option<oneshot::Sender<(PeerId, String)>>>,
    pending_config: Mutex<Option<oneshot::Sender<Result<ConfigAck, ConfigRejection>>>>,
    local_peer: Mutex<Option<PeerId>>,
    session_id: Mutex<Option<String>>,
    disconnect_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("state", &*self.state.lock())
            .field("local_peer", &*self.local_peer.lock())
            .field("session_id", &*self.session_id.lock())
            .finish_non_exhaustive()
    }
}

impl SignalingChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            socket: Mutex::new(None),
            state: Mutex::new(LinkState::Connecting),
            handlers: Mutex::new(HashMap::new()),
            pending_init: Mutex::new(None),
            pending_config: Mutex::new(None),
            local_peer: Mutex::new(None),
            session_id: Mutex::new(None),
            disconnect_tx: Mutex::new(None),
        })
    }

    /// Dial the relay over WebSocket. The link sits in `Connecting` while
    /// the handshake runs and moves to `Connected` on transport open.
    pub async fn dial(relay_url: &str) -> Result<Arc<Self>, SignalingError> {
        let channel = Self::new();
        tracing::debug!(target = "signaling", url = relay_url, "dialing relay");
        match WsSignalSocket::connect(relay_url).await {
            Ok(socket) => {
                channel.attach(Arc::new(socket));
                Ok(channel)
            }
            Err(err) => {
                channel.mark_disconnected();
                Err(err)
            }
        }
    }

    /// Wrap an already-open socket; the transport-open transition has
    /// happened, so the link goes straight to `Connected`. Tests hand in one
    /// half of an in-memory pair here.
    pub fn start(socket: Arc<dyn SignalSocket>) -> Arc<Self> {
        let channel = Self::new();
        channel.attach(socket);
        channel
    }

    /// Bind the open socket and start the reader. The first keepalive goes
    /// out immediately; every ack schedules the next one.
    fn attach(self: &Arc<Self>, socket: Arc<dyn SignalSocket>) {
        *self.socket.lock() = Some(Arc::clone(&socket));
        *self.state.lock() = LinkState::Connected;

        let reader = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(value) = socket.recv().await {
                match serde_json::from_value::<RelayFrame>(value) {
                    Ok(frame) => reader.handle_frame(frame),
                    Err(err) => {
                        tracing::warn!(target = "signaling", "unknown relay frame dropped: {err}");
                    }
                }
            }
            reader.mark_disconnected();
        });

        let opener = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = opener.send(ClientFrame::Keepalive).await {
                tracing::debug!(target = "signaling", "initial keepalive failed: {err}");
            }
        });
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.local_peer.lock().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// The coordinator registers here to learn about relay loss. Total mesh
    /// teardown hangs off this notification.
    pub fn set_disconnect_notifier(&self, tx: mpsc::UnboundedSender<()>) {
        *self.disconnect_tx.lock() = Some(tx);
    }

    /// Route frames with `opcode` to `tx`. One handler per opcode, ever;
    /// a second registration is a programming error, not a replacement.
    pub fn register(
        &self,
        opcode: RelayOpcode,
        tx: mpsc::UnboundedSender<RelayFrame>,
    ) -> Result<(), SignalingError> {
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(&opcode) {
            return Err(SignalingError::HandlerExists(opcode));
        }
        handlers.insert(opcode, tx);
        Ok(())
    }

    pub async fn send(&self, frame: ClientFrame) -> Result<(), SignalingError> {
        if self.state() == LinkState::Disconnected {
            return Err(SignalingError::NotConnected);
        }
        let socket = self.socket.lock().clone();
        let Some(socket) = socket else {
            return Err(SignalingError::NotConnected);
        };
        let value = serde_json::to_value(&frame)?;
        socket.send(value).await
    }

    /// Present the session token and wait for the relay's identity grant.
    pub async fn authenticate(&self, token: &str) -> Result<(PeerId, String), SignalingError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_init.lock();
            if pending.is_some() {
                return Err(SignalingError::ConfigInFlight);
            }
            *pending = Some(tx);
        }
        self.send(ClientFrame::Init {
            token: token.to_string(),
        })
        .await?;
        match tokio::time::timeout(AUTH_TIMEOUT, rx).await {
            Ok(Ok(grant)) => Ok(grant),
            Ok(Err(_)) => Err(SignalingError::NotConnected),
            Err(_) => {
                self.pending_init.lock().take();
                Err(SignalingError::Timeout)
            }
        }
    }

    /// Send a `config_host`/`config_peer` request and wait for the matching
    /// ack or rejection. Only one request may be in flight at a time.
    pub async fn configure(&self, frame: ClientFrame) -> Result<ConfigAck, SignalingError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_config.lock();
            if pending.is_some() {
                return Err(SignalingError::ConfigInFlight);
            }
            *pending = Some(tx);
        }
        if let Err(err) = self.send(frame).await {
            self.pending_config.lock().take();
            return Err(err);
        }
        match tokio::time::timeout(CONFIG_TIMEOUT, rx).await {
            Ok(Ok(Ok(ack))) => Ok(ack),
            Ok(Ok(Err(rejection))) => Err(SignalingError::Rejected(rejection)),
            Ok(Err(_)) => Err(SignalingError::NotConnected),
            Err(_) => {
                self.pending_config.lock().take();
                Err(SignalingError::Timeout)
            }
        }
    }

    pub async fn close(&self) {
        let socket = self.socket.lock().clone();
        if let Some(socket) = socket {
            socket.close().await;
        }
        self.mark_disconnected();
    }

    fn handle_frame(self: &Arc<Self>, frame: RelayFrame) {
        match &frame {
            RelayFrame::Keepalive => {
                let channel = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(KEEPALIVE_INTERVAL).await;
                    if channel.state() == LinkState::Disconnected {
                        return;
                    }
                    if let Err(err) = channel.send(ClientFrame::Keepalive).await {
                        tracing::debug!(target = "signaling", "keepalive send failed: {err}");
                    }
                });
                return;
            }
            RelayFrame::InitOk { peer_id, session_id } => {
                *self.local_peer.lock() = Some(peer_id.clone());
                *self.session_id.lock() = Some(session_id.clone());
                *self.state.lock() = LinkState::Authenticated;
                tracing::debug!(
                    target = "signaling",
                    peer_id = %peer_id,
                    "relay identity granted"
                );
                if let Some(tx) = self.pending_init.lock().take() {
                    let _ = tx.send((peer_id.clone(), session_id.clone()));
                }
                return;
            }
            RelayFrame::AckHost => {
                if let Some(tx) = self.pending_config.lock().take() {
                    let _ = tx.send(Ok(ConfigAck::Host));
                    return;
                }
            }
            RelayFrame::AckPeer => {
                if let Some(tx) = self.pending_config.lock().take() {
                    let _ = tx.send(Ok(ConfigAck::Peer));
                    return;
                }
            }
            _ => {
                if let Some(rejection) = frame.rejection() {
                    if let Some(tx) = self.pending_config.lock().take() {
                        let _ = tx.send(Err(rejection));
                        return;
                    }
                }
            }
        }

        let opcode = frame.opcode();
        let handler = self.handlers.lock().get(&opcode).cloned();
        match handler {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    tracing::debug!(target = "signaling", ?opcode, "handler receiver dropped");
                }
            }
            None => {
                tracing::debug!(target = "signaling", ?opcode, "no handler, frame dropped");
            }
        }
    }

    fn mark_disconnected(&self) {
        {
            let mut state = self.state.lock();
            if *state == LinkState::Disconnected {
                return;
            }
            *state = LinkState::Disconnected;
        }
        tracing::info!(target = "signaling", "relay link lost");
        self.pending_init.lock().take();
        if let Some(tx) = self.pending_config.lock().take() {
            drop(tx);
        }
        if let Some(tx) = self.disconnect_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    async fn relay_recv(relay: &MemorySignalSocket) -> Value {
        tokio::time::timeout(Duration::from_secs(2), relay.recv())
            .await
            .expect("relay side timed out")
            .expect("relay side closed")
    }

    #[tokio::test]
    async fn authenticate_resolves_on_init_ok() {
        let (client_half, relay_half) = pair();
        let channel = SignalingChannel::start(Arc::new(client_half));

        // Swallow the opening keepalive.
        assert_eq!(relay_recv(&relay_half).await["type"], "keepalive");

        let relay = tokio::spawn(async move {
            let frame = relay_recv(&relay_half).await;
            assert_eq!(frame["type"], "init");
            assert_eq!(frame["token"], "tok-1");
            relay_half
                .send(json!({"type": "init_ok", "peer_id": "p1", "session_id": "s1"}))
                .await
                .unwrap();
            relay_half
        });

        let (peer_id, session_id) = channel.authenticate("tok-1").await.unwrap();
        assert_eq!(peer_id.as_str(), "p1");
        assert_eq!(session_id, "s1");
        assert_eq!(channel.state(), LinkState::Authenticated);
        assert_eq!(channel.local_peer_id(), Some("p1".into()));
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn configure_surfaces_rejection() {
        let (client_half, relay_half) = pair();
        let channel = SignalingChannel::start(Arc::new(client_half));
        assert_eq!(relay_recv(&relay_half).await["type"], "keepalive");

        let relay = tokio::spawn(async move {
            let frame = relay_recv(&relay_half).await;
            assert_eq!(frame["type"], "config_peer");
            relay_half.send(json!({"type": "lobby_full"})).await.unwrap();
        });

        let err = channel
            .configure(ClientFrame::ConfigPeer {
                lobby_id: "L1".into(),
                password: String::new(),
                public_key: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SignalingError::Rejected(ConfigRejection::LobbyFull)
        ));
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn wrapping_an_open_socket_starts_connected() {
        let (client_half, _relay_half) = pair();
        let channel = SignalingChannel::start(Arc::new(client_half));
        assert_eq!(channel.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn dial_with_an_invalid_url_fails_cleanly() {
        let err = SignalingChannel::dial("not a url").await.unwrap_err();
        assert!(matches!(err, SignalingError::Socket(_)));
    }

    #[tokio::test]
    async fn duplicate_handler_registration_is_an_error() {
        let (client_half, _relay_half) = pair();
        let channel = SignalingChannel::start(Arc::new(client_half));
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        channel.register(RelayOpcode::NewPeer, tx_a).unwrap();
        let err = channel.register(RelayOpcode::NewPeer, tx_b).unwrap_err();
        assert!(matches!(
            err,
            SignalingError::HandlerExists(RelayOpcode::NewPeer)
        ));
    }

    #[tokio::test]
    async fn frames_route_to_registered_handler() {
        let (client_half, relay_half) = pair();
        let channel = SignalingChannel::start(Arc::new(client_half));
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.register(RelayOpcode::NewPeer, tx).unwrap();

        relay_half
            .send(json!({"type": "new_peer", "peer_id": "p9", "display_name": "Nine"}))
            .await
            .unwrap();
        match rx.recv().await {
            Some(RelayFrame::NewPeer { peer_id, .. }) => assert_eq!(peer_id.as_str(), "p9"),
            other => panic!("expected NewPeer, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_ack_schedules_the_next_frame() {
        let (client_half, relay_half) = pair();
        let channel = SignalingChannel::start(Arc::new(client_half));
        assert_eq!(relay_recv(&relay_half).await["type"], "keepalive");

        relay_half.send(json!({"type": "keepalive"})).await.unwrap();
        // Paused clock: recv without a timeout so auto-advance lands on the
        // keepalive timer.
        let frame = relay_half.recv().await.expect("relay side closed");
        assert_eq!(frame["type"], "keepalive");
        drop(channel);
    }

    #[tokio::test]
    async fn socket_loss_notifies_and_blocks_sends() {
        let (client_half, relay_half) = pair();
        let channel = SignalingChannel::start(Arc::new(client_half));
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.set_disconnect_notifier(tx);

        relay_half.close().await;
        assert!(rx.recv().await.is_some());
        assert_eq!(channel.state(), LinkState::Disconnected);
        let err = channel.send(ClientFrame::Keepalive).await.unwrap_err();
        assert!(matches!(err, SignalingError::NotConnected));
    }
}

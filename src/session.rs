//! The embedding-facing surface.
//!
//! [`MeshSession`] bundles the signaling channel, coordinator, and
//! multiplexer behind the handful of calls an application actually makes.
//! Transport endpoints come from an injected [`EndpointFactory`], so the same
//! session runs over a real peer-connection stack or the in-memory network.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{HostParams, JoinParams, LobbySession};
use crate::crypto::KeypairStatus;
use crate::mesh::{MeshCoordinator, MeshError, MeshEvent, Role};
use crate::protocol::PeerId;
use crate::signaling::{SignalSocket, SignalingChannel};
use crate::transport::EndpointFactory;

pub struct MeshSession {
    coordinator: Arc<MeshCoordinator>,
}

impl MeshSession {
    /// Dial the relay over WebSocket and stand the whole stack up.
    pub async fn connect(
        relay_url: &str,
        display_name: &str,
        factory: Arc<dyn EndpointFactory>,
    ) -> Result<Self, MeshError> {
        let signaling = SignalingChannel::dial(relay_url).await?;
        let coordinator = MeshCoordinator::new(signaling, factory, display_name)?;
        Ok(Self { coordinator })
    }

    /// Build a session on an already-open socket. Tests hand in one half of
    /// an in-memory pair here.
    pub fn over_socket(
        socket: Arc<dyn SignalSocket>,
        display_name: &str,
        factory: Arc<dyn EndpointFactory>,
    ) -> Result<Self, MeshError> {
        let signaling = SignalingChannel::start(socket);
        let coordinator = MeshCoordinator::new(signaling, factory, display_name)?;
        Ok(Self { coordinator })
    }

    /// Take the event stream. Yields `None` once taken.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MeshEvent>> {
        self.coordinator.take_events()
    }

    pub fn coordinator(&self) -> &Arc<MeshCoordinator> {
        &self.coordinator
    }

    pub fn role(&self) -> Role {
        self.coordinator.role()
    }

    pub fn lobby(&self) -> Option<LobbySession> {
        self.coordinator.lobby()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.coordinator.connected_peers()
    }

    pub fn enable_encryption(&self) -> KeypairStatus {
        self.coordinator.enable_encryption()
    }

    pub async fn authenticate(&self, token: &str) -> Result<PeerId, MeshError> {
        self.coordinator.authenticate(token).await
    }

    pub async fn host_lobby(&self, params: &HostParams) -> Result<(), MeshError> {
        self.coordinator.host_lobby(params).await
    }

    pub async fn join_lobby(&self, params: &JoinParams) -> Result<(), MeshError> {
        self.coordinator.join_lobby(params).await
    }

    /// Private message to one peer on one channel. With `wait` the call
    /// resolves only after the transport buffer drains.
    pub async fn send_data(
        &self,
        peer: &PeerId,
        channel: u16,
        payload: Value,
        wait: bool,
    ) -> Result<(), MeshError> {
        Ok(self
            .coordinator
            .mux()
            .send_message(peer, channel, payload, wait)
            .await?)
    }

    /// Global message to every connected peer carrying `channel`.
    pub async fn broadcast(
        &self,
        channel: u16,
        payload: Value,
        wait: bool,
    ) -> Result<(), MeshError> {
        Ok(self
            .coordinator
            .mux()
            .broadcast_message(channel, payload, wait)
            .await?)
    }

    pub async fn open_channel(
        &self,
        peer: &PeerId,
        name: &str,
        ordered: bool,
    ) -> Result<u16, MeshError> {
        Ok(self.coordinator.mux().open_channel(peer, name, ordered).await?)
    }

    pub async fn close_channel(&self, peer: &PeerId, channel: u16) -> Result<(), MeshError> {
        Ok(self.coordinator.mux().close_channel(peer, channel).await?)
    }

    pub async fn close_connection(&self, peer: &PeerId) -> Result<(), MeshError> {
        self.coordinator.close_connection(peer).await
    }

    pub async fn introduce_peers(
        &self,
        offerer: &PeerId,
        responder: &PeerId,
    ) -> Result<(), MeshError> {
        self.coordinator.introduce_peers(offerer, responder).await
    }

    pub async fn connect_voice(&self, peer: &PeerId) -> Result<(), MeshError> {
        self.coordinator.connect_voice(peer).await
    }

    pub async fn ring(&self, peer: &PeerId) -> Result<(), MeshError> {
        Ok(self.coordinator.mux().ring(peer).await?)
    }

    pub async fn pickup(&self, peer: &PeerId) -> Result<(), MeshError> {
        Ok(self.coordinator.mux().pickup(peer).await?)
    }

    pub async fn hangup(&self, peer: &PeerId) -> Result<(), MeshError> {
        Ok(self.coordinator.mux().hangup(peer).await?)
    }

    pub async fn disconnect(&self) {
        self.coordinator.disconnect().await;
    }
}

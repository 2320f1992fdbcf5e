//! End-to-end lobby scenarios against an in-memory relay.
//!
//! The relay here mirrors the production server's routing contract: it
//! assigns peer ids, manages one lobby, fans discovery announcements out,
//! and routes negotiation frames by peer id with `from_peer` rewritten. It
//! never looks inside negotiation contents.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use cove::config::{HostParams, JoinParams};
use cove::mesh::{MeshEvent, Role, VoiceSignal};
use cove::mux::MuxError;
use cove::protocol::{PeerId, SignalKind};
use cove::session::MeshSession;
use cove::signaling::{MemorySignalSocket, SignalSocket, pair};
use cove::transport::mock::{MockEndpointFactory, MockNetwork};
use cove::MeshError;

struct Lobby {
    id: String,
    password: String,
    max_peers: u32,
    host: PeerId,
    members: Vec<PeerId>,
}

#[derive(Default)]
struct RelayState {
    next_peer: u32,
    clients: HashMap<PeerId, Arc<MemorySignalSocket>>,
    names: HashMap<PeerId, String>,
    keys: HashMap<PeerId, Option<String>>,
    lobby: Option<Lobby>,
    sealed_negotiations: usize,
    routed_pairs: Vec<(PeerId, PeerId)>,
}

/// In-memory stand-in for the relay server. With `fan_out` the relay runs
/// the announcement-based discovery (`discover`/`anticipate`); without it,
/// only the host/joiner pair is announced and the mesh must complete through
/// the in-band chain.
struct TestRelay {
    fan_out: bool,
    state: Mutex<RelayState>,
}

impl TestRelay {
    fn new(fan_out: bool) -> Arc<Self> {
        Arc::new(Self {
            fan_out,
            state: Mutex::new(RelayState::default()),
        })
    }

    /// Open a socket pair, keep the relay half, hand the client half back.
    fn attach(self: &Arc<Self>) -> Arc<MemorySignalSocket> {
        let (client_half, relay_half) = pair();
        let relay_half = Arc::new(relay_half);
        let relay = Arc::clone(self);
        let socket = Arc::clone(&relay_half);
        tokio::spawn(async move {
            let mut client_peer: Option<PeerId> = None;
            while let Some(frame) = socket.recv().await {
                relay.handle(&socket, &mut client_peer, frame).await;
            }
            if let Some(peer) = client_peer {
                relay.client_gone(&peer).await;
            }
        });
        Arc::new(client_half)
    }

    async fn handle(
        self: &Arc<Self>,
        socket: &Arc<MemorySignalSocket>,
        client_peer: &mut Option<PeerId>,
        frame: Value,
    ) {
        let kind = frame["type"].as_str().unwrap_or_default().to_string();
        match kind.as_str() {
            "keepalive" => {}
            "init" => {
                let token = frame["token"].as_str().unwrap_or("anonymous").to_string();
                let peer_id = {
                    let mut state = self.state.lock();
                    state.next_peer += 1;
                    let peer_id = PeerId(format!("p{}", state.next_peer));
                    state.clients.insert(peer_id.clone(), Arc::clone(socket));
                    state.names.insert(peer_id.clone(), token);
                    peer_id
                };
                *client_peer = Some(peer_id.clone());
                let _ = socket
                    .send(json!({
                        "type": "init_ok",
                        "peer_id": peer_id,
                        "session_id": format!("session-{peer_id}"),
                    }))
                    .await;
            }
            "config_host" => {
                let Some(peer_id) = client_peer.clone() else {
                    let _ = socket.send(json!({"type": "config_required"})).await;
                    return;
                };
                let reply = {
                    let mut state = self.state.lock();
                    if state.lobby.is_some() {
                        json!({"type": "lobby_exists"})
                    } else {
                        state.lobby = Some(Lobby {
                            id: frame["lobby_id"].as_str().unwrap_or_default().into(),
                            password: frame["password"].as_str().unwrap_or_default().into(),
                            max_peers: frame["max_peers"].as_u64().unwrap_or(0) as u32,
                            host: peer_id.clone(),
                            members: vec![peer_id.clone()],
                        });
                        let key = frame["public_key"].as_str().map(str::to_string);
                        state.keys.insert(peer_id.clone(), key);
                        json!({"type": "ack_host"})
                    }
                };
                let _ = socket.send(reply).await;
            }
            "config_peer" => {
                let Some(joiner) = client_peer.clone() else {
                    let _ = socket.send(json!({"type": "config_required"})).await;
                    return;
                };
                enum Outcome {
                    Reject(&'static str),
                    Admit {
                        host: PeerId,
                        lobby_id: String,
                        existing: Vec<PeerId>,
                    },
                }
                let outcome = {
                    let mut state = self.state.lock();
                    let key = frame["public_key"].as_str().map(str::to_string);
                    state.keys.insert(joiner.clone(), key);
                    match state.lobby.as_mut() {
                        None => Outcome::Reject("lobby_notfound"),
                        Some(lobby) if lobby.password != frame["password"].as_str().unwrap_or_default() => {
                            Outcome::Reject("password_fail")
                        }
                        Some(lobby) if lobby.members.len() as u32 >= lobby.max_peers => {
                            Outcome::Reject("lobby_full")
                        }
                        Some(lobby) => {
                            let existing: Vec<PeerId> = lobby
                                .members
                                .iter()
                                .filter(|m| **m != lobby.host)
                                .cloned()
                                .collect();
                            lobby.members.push(joiner.clone());
                            Outcome::Admit {
                                host: lobby.host.clone(),
                                lobby_id: lobby.id.clone(),
                                existing,
                            }
                        }
                    }
                };
                match outcome {
                    Outcome::Reject(reason) => {
                        let _ = socket.send(json!({"type": reason})).await;
                    }
                    Outcome::Admit { host, lobby_id, existing } => {
                        let _ = socket.send(json!({"type": "ack_peer"})).await;
                        // The joiner offers to the host; the host just
                        // anticipates the offer.
                        self.send_to(
                            &joiner,
                            json!({
                                "type": "new_host",
                                "peer_id": host,
                                "display_name": self.name_of(&host),
                                "lobby_id": lobby_id,
                                "public_key": self.key_of(&host),
                            }),
                        )
                        .await;
                        self.send_to(
                            &host,
                            json!({
                                "type": "anticipate",
                                "peer_id": joiner,
                                "display_name": self.name_of(&joiner),
                                "public_key": self.key_of(&joiner),
                            }),
                        )
                        .await;
                        if self.fan_out {
                            for member in existing {
                                self.send_to(
                                    &joiner,
                                    json!({
                                        "type": "discover",
                                        "peer_id": member,
                                        "display_name": self.name_of(&member),
                                        "public_key": self.key_of(&member),
                                    }),
                                )
                                .await;
                                self.send_to(
                                    &member,
                                    json!({
                                        "type": "anticipate",
                                        "peer_id": joiner,
                                        "display_name": self.name_of(&joiner),
                                        "public_key": self.key_of(&joiner),
                                    }),
                                )
                                .await;
                            }
                        }
                    }
                }
            }
            "make_offer" | "make_answer" | "ice" => {
                let Some(from) = client_peer.clone() else {
                    return;
                };
                let Some(to) = frame["to_peer"].as_str().map(PeerId::from) else {
                    return;
                };
                let mut forwarded = frame.clone();
                if let Some(map) = forwarded.as_object_mut() {
                    map.remove("to_peer");
                    map.insert("from_peer".into(), json!(from));
                }
                {
                    let mut state = self.state.lock();
                    if forwarded["payload"]["contents"]["sealed"].is_object() {
                        state.sealed_negotiations += 1;
                    }
                    state.routed_pairs.push((from.clone(), to.clone()));
                }
                self.send_to(&to, forwarded).await;
            }
            other => panic!("relay got unexpected frame type {other}"),
        }
    }

    async fn client_gone(self: &Arc<Self>, peer: &PeerId) {
        let (others, in_lobby) = {
            let mut state = self.state.lock();
            state.clients.remove(peer);
            let in_lobby = state
                .lobby
                .as_mut()
                .map(|lobby| {
                    let was = lobby.members.contains(peer);
                    lobby.members.retain(|m| m != peer);
                    was
                })
                .unwrap_or(false);
            let others: Vec<PeerId> = state.clients.keys().cloned().collect();
            (others, in_lobby)
        };
        if in_lobby {
            for other in others {
                self.send_to(&other, json!({"type": "peer_gone", "peer_id": peer}))
                    .await;
            }
        }
    }

    async fn send_to(&self, peer: &PeerId, frame: Value) {
        let socket = self.state.lock().clients.get(peer).cloned();
        if let Some(socket) = socket {
            let _ = socket.send(frame).await;
        }
    }

    fn name_of(&self, peer: &PeerId) -> String {
        self.state
            .lock()
            .names
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    fn key_of(&self, peer: &PeerId) -> Option<String> {
        self.state.lock().keys.get(peer).cloned().flatten()
    }

    fn sealed_negotiations(&self) -> usize {
        self.state.lock().sealed_negotiations
    }

    fn routed_between(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state
            .lock()
            .routed_pairs
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    /// Drop every relay-side socket, as a relay crash would.
    async fn shutdown(&self) {
        let sockets: Vec<Arc<MemorySignalSocket>> =
            self.state.lock().clients.values().cloned().collect();
        for socket in sockets {
            socket.close().await;
        }
    }
}

struct Member {
    session: MeshSession,
    events: mpsc::UnboundedReceiver<MeshEvent>,
    factory: Arc<MockEndpointFactory>,
    peer_id: PeerId,
}

impl Member {
    async fn wait_for_peer(&mut self, expected: &PeerId) {
        let deadline = Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout(deadline, self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("{} never saw {expected} connect", self.peer_id))
                .expect("event stream ended");
            if let MeshEvent::PeerConnected { peer_id, .. } = event {
                if &peer_id == expected {
                    return;
                }
            }
        }
    }

    async fn wait_for_peer_left(&mut self, expected: &PeerId) {
        let deadline = Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout(deadline, self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("{} never saw {expected} leave", self.peer_id))
                .expect("event stream ended");
            if let MeshEvent::PeerLeft { peer_id } = event {
                if &peer_id == expected {
                    return;
                }
            }
        }
    }

    /// Drain whatever is queued right now, returning how many times each
    /// peer was announced as connected.
    fn drain_connect_counts(&mut self) -> HashMap<PeerId, usize> {
        let mut counts = HashMap::new();
        while let Ok(event) = self.events.try_recv() {
            if let MeshEvent::PeerConnected { peer_id, .. } = event {
                *counts.entry(peer_id).or_insert(0) += 1;
            }
        }
        counts
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn connect_member(
    relay: &Arc<TestRelay>,
    network: &Arc<MockNetwork>,
    name: &str,
    encrypted: bool,
) -> Member {
    init_tracing();
    let socket = relay.attach();
    let factory = MockEndpointFactory::new(Arc::clone(network));
    let session = MeshSession::over_socket(socket, name, factory.clone()).unwrap();
    let events = session.take_events().unwrap();
    if encrypted {
        session.enable_encryption();
    }
    let peer_id = session.authenticate(name).await.unwrap();
    Member {
        session,
        events,
        factory,
        peer_id,
    }
}

fn host_params(lobby: &str) -> HostParams {
    HostParams {
        lobby_id: lobby.into(),
        password: String::new(),
        max_peers: 8,
        allow_host_reclaim: false,
        allow_peers_to_claim_host: false,
    }
}

fn join_params(lobby: &str) -> JoinParams {
    JoinParams {
        lobby_id: lobby.into(),
        password: String::new(),
    }
}

#[tokio::test]
async fn host_and_joiner_connect_exactly_once_each() {
    let relay = TestRelay::new(true);
    let network = MockNetwork::new();
    let mut host = connect_member(&relay, &network, "alice", false).await;
    let mut joiner = connect_member(&relay, &network, "bob", false).await;

    host.session.host_lobby(&host_params("L1")).await.unwrap();
    joiner.session.join_lobby(&join_params("L1")).await.unwrap();
    assert_eq!(host.session.role(), Role::Host);
    assert_eq!(joiner.session.role(), Role::Peer);

    host.wait_for_peer(&joiner.peer_id.clone()).await;
    joiner.wait_for_peer(&host.peer_id.clone()).await;

    // No duplicate announcements once things settle.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(host.drain_connect_counts().is_empty());
    assert!(joiner.drain_connect_counts().is_empty());

    assert_eq!(host.session.connected_peers(), vec![joiner.peer_id.clone()]);
    assert_eq!(joiner.session.connected_peers(), vec![host.peer_id.clone()]);
}

#[tokio::test]
async fn three_party_lobby_completes_the_mesh() {
    let relay = TestRelay::new(true);
    let network = MockNetwork::new();
    let mut a = connect_member(&relay, &network, "alice", false).await;
    let mut b = connect_member(&relay, &network, "bob", false).await;
    let mut c = connect_member(&relay, &network, "carol", false).await;

    a.session.host_lobby(&host_params("L1")).await.unwrap();
    b.session.join_lobby(&join_params("L1")).await.unwrap();
    c.session.join_lobby(&join_params("L1")).await.unwrap();

    let (pa, pb, pc) = (a.peer_id.clone(), b.peer_id.clone(), c.peer_id.clone());
    a.wait_for_peer(&pb).await;
    a.wait_for_peer(&pc).await;
    b.wait_for_peer(&pa).await;
    b.wait_for_peer(&pc).await;
    c.wait_for_peer(&pa).await;
    c.wait_for_peer(&pb).await;

    // Symmetric views of the mesh.
    let mut expected_a = vec![pb.clone(), pc.clone()];
    expected_a.sort();
    assert_eq!(a.session.connected_peers(), expected_a);
    let mut expected_b = vec![pa.clone(), pc.clone()];
    expected_b.sort();
    assert_eq!(b.session.connected_peers(), expected_b);
    let mut expected_c = vec![pa.clone(), pb.clone()];
    expected_c.sort();
    assert_eq!(c.session.connected_peers(), expected_c);
}

#[tokio::test]
async fn sealed_negotiation_when_both_sides_have_keys() {
    let relay = TestRelay::new(true);
    let network = MockNetwork::new();
    let mut host = connect_member(&relay, &network, "alice", true).await;
    let mut joiner = connect_member(&relay, &network, "bob", true).await;

    host.session.host_lobby(&host_params("L1")).await.unwrap();
    joiner.session.join_lobby(&join_params("L1")).await.unwrap();
    host.wait_for_peer(&joiner.peer_id.clone()).await;
    joiner.wait_for_peer(&host.peer_id.clone()).await;

    // Everything the relay routed for this pair was opaque.
    assert!(relay.sealed_negotiations() > 0);
}

#[tokio::test]
async fn redundant_offer_instruction_is_ignored_while_answering() {
    let relay = TestRelay::new(true);
    let network = MockNetwork::new();
    let mut host = connect_member(&relay, &network, "alice", false).await;
    let mut joiner = connect_member(&relay, &network, "bob", false).await;

    host.session.host_lobby(&host_params("L1")).await.unwrap();
    joiner.session.join_lobby(&join_params("L1")).await.unwrap();
    host.wait_for_peer(&joiner.peer_id.clone()).await;
    joiner.wait_for_peer(&host.peer_id.clone()).await;

    // A stray discover telling the host (already the answering side) to
    // offer to the joiner must change nothing.
    relay
        .send_to(
            &host.peer_id,
            json!({
                "type": "discover",
                "peer_id": joiner.peer_id,
                "display_name": "bob",
            }),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(host.drain_connect_counts().is_empty());
    assert!(joiner.drain_connect_counts().is_empty());
    assert_eq!(host.session.connected_peers(), vec![joiner.peer_id.clone()]);
}

#[tokio::test]
async fn in_band_discovery_meshes_without_relay_fanout() {
    let relay = TestRelay::new(false);
    let network = MockNetwork::new();
    let mut a = connect_member(&relay, &network, "alice", false).await;
    let mut b = connect_member(&relay, &network, "bob", false).await;
    let mut c = connect_member(&relay, &network, "carol", false).await;

    a.session.coordinator().set_auto_introduce(true);
    a.session.host_lobby(&host_params("L1")).await.unwrap();
    b.session.join_lobby(&join_params("L1")).await.unwrap();
    let (pa, pb, pc) = (a.peer_id.clone(), b.peer_id.clone(), c.peer_id.clone());
    a.wait_for_peer(&pb).await;
    b.wait_for_peer(&pa).await;

    c.session.join_lobby(&join_params("L1")).await.unwrap();
    a.wait_for_peer(&pc).await;
    c.wait_for_peer(&pa).await;

    // The host introduces the fresh peer in-band; the pair connects without
    // the relay ever routing a frame between them.
    b.wait_for_peer(&pc).await;
    c.wait_for_peer(&pb).await;
    assert!(!relay.routed_between(&pb, &pc));
}

#[tokio::test]
async fn default_channel_is_protected_and_sub_channels_mirror() {
    let relay = TestRelay::new(true);
    let network = MockNetwork::new();
    let mut host = connect_member(&relay, &network, "alice", false).await;
    let mut joiner = connect_member(&relay, &network, "bob", false).await;

    host.session.host_lobby(&host_params("L1")).await.unwrap();
    joiner.session.join_lobby(&join_params("L1")).await.unwrap();
    host.wait_for_peer(&joiner.peer_id.clone()).await;
    joiner.wait_for_peer(&host.peer_id.clone()).await;

    let err = host
        .session
        .close_channel(&joiner.peer_id, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Mux(MuxError::DefaultChannelClose)));

    let id = host
        .session
        .open_channel(&joiner.peer_id, "state", false)
        .await
        .unwrap();
    assert_eq!(id, 1);

    // The mirrored channel opens on the joiner with the announced label.
    let deadline = Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout(deadline, joiner.events.recv())
            .await
            .expect("mirrored channel never opened")
            .expect("event stream ended");
        if let MeshEvent::ChannelOpened { peer_id, channel, label } = event {
            if channel == id {
                assert_eq!(peer_id, host.peer_id);
                assert_eq!(label, "state");
                break;
            }
        }
    }

    // And data flows across it.
    host.session
        .send_data(&joiner.peer_id, id, json!({"tick": 1}), false)
        .await
        .unwrap();
    loop {
        let event = tokio::time::timeout(deadline, joiner.events.recv())
            .await
            .expect("data never arrived")
            .expect("event stream ended");
        if let MeshEvent::ChannelData { peer_id, channel, data } = event {
            assert_eq!(peer_id, host.peer_id);
            assert_eq!(channel, id);
            assert_eq!(data["tick"], 1);
            break;
        }
    }
}

#[tokio::test]
async fn waiting_send_blocks_until_the_buffer_drains() {
    let relay = TestRelay::new(true);
    let network = MockNetwork::new();
    let mut host = connect_member(&relay, &network, "alice", false).await;
    let mut joiner = connect_member(&relay, &network, "bob", false).await;

    host.session.host_lobby(&host_params("L1")).await.unwrap();
    joiner.session.join_lobby(&join_params("L1")).await.unwrap();
    host.wait_for_peer(&joiner.peer_id.clone()).await;
    joiner.wait_for_peer(&host.peer_id.clone()).await;

    let endpoint = host
        .factory
        .endpoint(&joiner.peer_id, SignalKind::Data)
        .unwrap();
    endpoint.hold_sends(true);

    let session = host.session;
    let target = joiner.peer_id.clone();
    let send = tokio::spawn(async move {
        session
            .send_data(&target, 0, json!("held"), true)
            .await
            .map(|_| session)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!send.is_finished());

    endpoint.release_held();
    let _session = tokio::time::timeout(Duration::from_secs(5), send)
        .await
        .expect("waiting send never resolved")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn goodbye_is_a_clean_departure_on_both_sides() {
    let relay = TestRelay::new(true);
    let network = MockNetwork::new();
    let mut host = connect_member(&relay, &network, "alice", false).await;
    let mut joiner = connect_member(&relay, &network, "bob", false).await;

    host.session.host_lobby(&host_params("L1")).await.unwrap();
    joiner.session.join_lobby(&join_params("L1")).await.unwrap();
    host.wait_for_peer(&joiner.peer_id.clone()).await;
    joiner.wait_for_peer(&host.peer_id.clone()).await;

    host.session.close_connection(&joiner.peer_id).await.unwrap();
    let joiner_id = joiner.peer_id.clone();
    let host_id = host.peer_id.clone();
    host.wait_for_peer_left(&joiner_id).await;
    joiner.wait_for_peer_left(&host_id).await;
    assert!(host.session.connected_peers().is_empty());
    assert!(joiner.session.connected_peers().is_empty());
}

#[tokio::test]
async fn voice_connection_signals_and_releases_playback() {
    let relay = TestRelay::new(true);
    let network = MockNetwork::new();
    let mut host = connect_member(&relay, &network, "alice", false).await;
    let mut joiner = connect_member(&relay, &network, "bob", false).await;

    host.session.host_lobby(&host_params("L1")).await.unwrap();
    joiner.session.join_lobby(&join_params("L1")).await.unwrap();
    host.wait_for_peer(&joiner.peer_id.clone()).await;
    joiner.wait_for_peer(&host.peer_id.clone()).await;

    host.session.connect_voice(&joiner.peer_id).await.unwrap();
    host.session.ring(&joiner.peer_id).await.unwrap();

    let deadline = Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout(deadline, joiner.events.recv())
            .await
            .expect("ring never arrived")
            .expect("event stream ended");
        if let MeshEvent::Voice { peer_id, signal } = event {
            assert_eq!(peer_id, host.peer_id);
            assert_eq!(signal, VoiceSignal::Ring);
            break;
        }
    }

    host.session.close_connection(&joiner.peer_id).await.unwrap();
    let joiner_id = joiner.peer_id.clone();
    host.wait_for_peer_left(&joiner_id).await;
    let voice = host
        .factory
        .endpoint(&joiner.peer_id, SignalKind::Voice)
        .unwrap();
    assert!(voice.playback_released());
}

#[tokio::test]
async fn relay_loss_tears_the_whole_mesh_down() {
    let relay = TestRelay::new(true);
    let network = MockNetwork::new();
    let mut a = connect_member(&relay, &network, "alice", true).await;
    let mut b = connect_member(&relay, &network, "bob", true).await;
    let mut c = connect_member(&relay, &network, "carol", true).await;

    a.session.host_lobby(&host_params("L1")).await.unwrap();
    b.session.join_lobby(&join_params("L1")).await.unwrap();
    c.session.join_lobby(&join_params("L1")).await.unwrap();
    let (pa, pb, pc) = (a.peer_id.clone(), b.peer_id.clone(), c.peer_id.clone());
    a.wait_for_peer(&pb).await;
    a.wait_for_peer(&pc).await;
    b.wait_for_peer(&pa).await;
    b.wait_for_peer(&pc).await;
    c.wait_for_peer(&pa).await;
    c.wait_for_peer(&pb).await;
    assert!(a.session.coordinator().crypto().secret_count() > 0);

    relay.shutdown().await;

    for member in [&mut a, &mut b, &mut c] {
        let deadline = Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout(deadline, member.events.recv())
                .await
                .expect("disconnect never surfaced")
                .expect("event stream ended");
            if matches!(event, MeshEvent::Disconnected) {
                break;
            }
        }
        assert_eq!(member.session.role(), Role::Unconfigured);
        assert!(member.session.lobby().is_none());
        assert!(member.session.connected_peers().is_empty());
        // No residual secrets anywhere.
        assert_eq!(member.session.coordinator().crypto().secret_count(), 0);
    }
}

#[tokio::test]
async fn lobby_rejections_surface_and_leave_role_unset() {
    let relay = TestRelay::new(true);
    let network = MockNetwork::new();
    let host = connect_member(&relay, &network, "alice", false).await;
    let late = connect_member(&relay, &network, "late", false).await;

    host.session
        .host_lobby(&HostParams {
            lobby_id: "L1".into(),
            password: "secret".into(),
            max_peers: 8,
            allow_host_reclaim: false,
            allow_peers_to_claim_host: false,
        })
        .await
        .unwrap();

    let err = late
        .session
        .join_lobby(&JoinParams {
            lobby_id: "L1".into(),
            password: "wrong".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::ConfigRejected(_)));
    assert_eq!(late.session.role(), Role::Unconfigured);

    // A second host for the same relay is rejected outright.
    let err = late.session.host_lobby(&host_params("L2")).await.unwrap_err();
    assert!(matches!(err, MeshError::ConfigRejected(_)));
    assert_eq!(late.session.role(), Role::Unconfigured);
}

//! Full-mesh encrypted peer-to-peer lobby transport.
//!
//! A thin relay ("signaling") server bootstraps direct, multiplexed peer
//! connections between every pair of lobby members. Negotiation payloads are
//! sealed end-to-end once a key exchange has happened for a pair; the relay
//! only ever routes opaque frames. The literal socket and peer transports are
//! capability traits (`signaling::SignalSocket`, `transport::PeerEndpoint`)
//! so the orchestrator runs identically over real WebSockets/WebRTC or the
//! in-memory implementations used by the test suite.

pub mod config;
pub mod crypto;
pub mod mesh;
pub mod mux;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{HostParams, JoinParams, LobbySession};
pub use mesh::{MeshCoordinator, MeshError, MeshEvent, Role};
pub use protocol::PeerId;
pub use session::MeshSession;

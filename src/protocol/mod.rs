//! Wire types for both protocol planes.
//!
//! Relay plane: JSON frames tagged `{"type": "..."}` exchanged with the
//! signaling server (`ClientFrame` outbound, `RelayFrame` inbound).
//! Channel plane: JSON frames `{"opcode": ..., "payload": ...}` carried over
//! per-peer data channels (`ChannelFrame`).
//!
//! Everything is parsed exactly once at the boundary; unknown frames are
//! logged and dropped, never a panic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Relay-assigned peer identifier, stable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId(value.to_string())
    }
}

/// Which transport a negotiation payload is for. The relay and the remote
/// side use this to route offers to the matching connection type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Data,
    Voice,
}

/// An encrypted signaling payload: base64 nonce + ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub version: u32,
    pub nonce: String,
    pub ciphertext: String,
}

/// Negotiation payload body: sealed when a shared secret exists for the
/// pair, cleartext JSON otherwise. The `Sealed` variant must come first so
/// untagged deserialization prefers it for `{"sealed": ...}` objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalBody {
    Sealed { sealed: SealedEnvelope },
    Plain(Value),
}

/// A negotiation payload relayed between two peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationPayload {
    pub kind: SignalKind,
    pub contents: SignalBody,
}

/// Session description exchanged during offer/answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// A single trickled connectivity candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateBlob {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// Frames sent from the client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Keepalive,
    Init {
        token: String,
    },
    ConfigHost {
        lobby_id: String,
        password: String,
        max_peers: u32,
        allow_host_reclaim: bool,
        allow_peers_to_claim_host: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    ConfigPeer {
        lobby_id: String,
        password: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    MakeOffer {
        to_peer: PeerId,
        payload: NegotiationPayload,
    },
    MakeAnswer {
        to_peer: PeerId,
        payload: NegotiationPayload,
    },
    Ice {
        to_peer: PeerId,
        payload: NegotiationPayload,
    },
}

/// Reasons the relay may reject a lobby-role request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigRejection {
    LobbyExists,
    LobbyNotfound,
    LobbyFull,
    LobbyLocked,
    PasswordFail,
}

impl fmt::Display for ConfigRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConfigRejection::LobbyExists => "lobby already exists",
            ConfigRejection::LobbyNotfound => "lobby not found",
            ConfigRejection::LobbyFull => "lobby is full",
            ConfigRejection::LobbyLocked => "lobby is locked",
            ConfigRejection::PasswordFail => "password rejected",
        };
        f.write_str(text)
    }
}

/// Frames received from the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    Keepalive,
    InitOk {
        peer_id: PeerId,
        session_id: String,
    },
    AckHost,
    AckPeer,
    LobbyExists,
    LobbyNotfound,
    LobbyFull,
    LobbyLocked,
    PasswordFail,
    /// A brand-new joiner the recipient (host) should offer to.
    NewPeer {
        peer_id: PeerId,
        display_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    /// The host a freshly admitted peer must offer to.
    NewHost {
        peer_id: PeerId,
        display_name: String,
        lobby_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    /// An existing member the recipient should offer to.
    Discover {
        peer_id: PeerId,
        display_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    /// An existing member that will offer to the recipient shortly.
    Anticipate {
        peer_id: PeerId,
        display_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    MakeOffer {
        from_peer: PeerId,
        payload: NegotiationPayload,
    },
    MakeAnswer {
        from_peer: PeerId,
        payload: NegotiationPayload,
    },
    Ice {
        from_peer: PeerId,
        payload: NegotiationPayload,
    },
    HostGone {
        peer_id: PeerId,
    },
    PeerGone {
        peer_id: PeerId,
    },
    LobbyClose,
    HostReclaim,
    Violation {
        message: String,
    },
    Warning {
        message: String,
    },
    ConfigRequired,
}

/// Stable opcode discriminant used for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayOpcode {
    Keepalive,
    InitOk,
    AckHost,
    AckPeer,
    LobbyExists,
    LobbyNotfound,
    LobbyFull,
    LobbyLocked,
    PasswordFail,
    NewPeer,
    NewHost,
    Discover,
    Anticipate,
    MakeOffer,
    MakeAnswer,
    Ice,
    HostGone,
    PeerGone,
    LobbyClose,
    HostReclaim,
    Violation,
    Warning,
    ConfigRequired,
}

impl RelayFrame {
    pub fn opcode(&self) -> RelayOpcode {
        match self {
            RelayFrame::Keepalive => RelayOpcode::Keepalive,
            RelayFrame::InitOk { .. } => RelayOpcode::InitOk,
            RelayFrame::AckHost => RelayOpcode::AckHost,
            RelayFrame::AckPeer => RelayOpcode::AckPeer,
            RelayFrame::LobbyExists => RelayOpcode::LobbyExists,
            RelayFrame::LobbyNotfound => RelayOpcode::LobbyNotfound,
            RelayFrame::LobbyFull => RelayOpcode::LobbyFull,
            RelayFrame::LobbyLocked => RelayOpcode::LobbyLocked,
            RelayFrame::PasswordFail => RelayOpcode::PasswordFail,
            RelayFrame::NewPeer { .. } => RelayOpcode::NewPeer,
            RelayFrame::NewHost { .. } => RelayOpcode::NewHost,
            RelayFrame::Discover { .. } => RelayOpcode::Discover,
            RelayFrame::Anticipate { .. } => RelayOpcode::Anticipate,
            RelayFrame::MakeOffer { .. } => RelayOpcode::MakeOffer,
            RelayFrame::MakeAnswer { .. } => RelayOpcode::MakeAnswer,
            RelayFrame::Ice { .. } => RelayOpcode::Ice,
            RelayFrame::HostGone { .. } => RelayOpcode::HostGone,
            RelayFrame::PeerGone { .. } => RelayOpcode::PeerGone,
            RelayFrame::LobbyClose => RelayOpcode::LobbyClose,
            RelayFrame::HostReclaim => RelayOpcode::HostReclaim,
            RelayFrame::Violation { .. } => RelayOpcode::Violation,
            RelayFrame::Warning { .. } => RelayOpcode::Warning,
            RelayFrame::ConfigRequired => RelayOpcode::ConfigRequired,
        }
    }

    /// The rejection carried by this frame, if it is one.
    pub fn rejection(&self) -> Option<ConfigRejection> {
        match self {
            RelayFrame::LobbyExists => Some(ConfigRejection::LobbyExists),
            RelayFrame::LobbyNotfound => Some(ConfigRejection::LobbyNotfound),
            RelayFrame::LobbyFull => Some(ConfigRejection::LobbyFull),
            RelayFrame::LobbyLocked => Some(ConfigRejection::LobbyLocked),
            RelayFrame::PasswordFail => Some(ConfigRejection::PasswordFail),
            _ => None,
        }
    }
}

/// Application frames carried over any open data channel.
///
/// The discovery chain (`discovery` .. `discovery_make_answer`) travels
/// exclusively over default channels; the forwarding host never inspects the
/// `contents` of the inner negotiation bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "opcode", content = "payload", rename_all = "snake_case")]
pub enum ChannelFrame {
    Newchan {
        name: String,
        ordered: bool,
        id: u16,
    },
    GMsg(Value),
    PMsg(Value),
    GVar {
        name: String,
        value: Value,
    },
    PVar {
        name: String,
        value: Value,
    },
    GList {
        name: String,
        value: Vec<Value>,
    },
    PList {
        name: String,
        value: Vec<Value>,
    },
    Ring,
    Pickup,
    Hangup,
    Goodbye,
    Discovery {
        peer: PeerId,
        display_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    DiscoveryAccept {
        peer: PeerId,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    DiscoveryInit {
        peer: PeerId,
        display_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    DiscoveryIce {
        peer: PeerId,
        contents: SignalBody,
    },
    DiscoveryMakeOffer {
        peer: PeerId,
        contents: SignalBody,
    },
    DiscoveryMakeAnswer {
        peer: PeerId,
        contents: SignalBody,
    },
}

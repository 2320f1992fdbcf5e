use serde::{Deserialize, Serialize};

use crate::mesh::Role;

/// Parameters for creating a lobby as its host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostParams {
    pub lobby_id: String,
    /// Empty string means the lobby is open.
    #[serde(default)]
    pub password: String,
    pub max_peers: u32,
    /// Allow the relay to promote a remaining member to host when the
    /// original host departs.
    #[serde(default)]
    pub allow_host_reclaim: bool,
    /// Allow any peer (not just the relay's pick) to claim the host role.
    #[serde(default)]
    pub allow_peers_to_claim_host: bool,
}

/// Parameters for joining an existing lobby.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinParams {
    pub lobby_id: String,
    #[serde(default)]
    pub password: String,
}

/// The locally held record of a granted lobby role.
///
/// Created when the relay acknowledges a `config_host`/`config_peer`
/// request, dropped on relay disconnect or lobby closure.
#[derive(Debug, Clone)]
pub struct LobbySession {
    pub lobby_id: String,
    pub role: Role,
    pub password_protected: bool,
    pub max_peers: u32,
    pub allow_host_reclaim: bool,
    pub allow_peers_to_claim_host: bool,
}

impl LobbySession {
    pub fn hosted(params: &HostParams) -> Self {
        Self {
            lobby_id: params.lobby_id.clone(),
            role: Role::Host,
            password_protected: !params.password.is_empty(),
            max_peers: params.max_peers,
            allow_host_reclaim: params.allow_host_reclaim,
            allow_peers_to_claim_host: params.allow_peers_to_claim_host,
        }
    }

    pub fn joined(params: &JoinParams) -> Self {
        Self {
            lobby_id: params.lobby_id.clone(),
            role: Role::Peer,
            password_protected: !params.password.is_empty(),
            max_peers: 0,
            allow_host_reclaim: false,
            allow_peers_to_claim_host: false,
        }
    }
}

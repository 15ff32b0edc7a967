// Protocol messages exchanged between peers and the host.
//
// - `ClientAction`: everything a peer can ask of the host. A closed enum
//   tagged by `"type"` on the wire (`update`, `chat`, `sync`), so every
//   consumer matches it exhaustively.
// - `ConnectionMetadata`: what a peer attaches when it opens a link to the
//   host: the claimed player id, its credential (a base64 public key) and a
//   proof-of-possession signature over the player id. See `credentials.rs`.
// - `MatchMetadata` / `PlayerMetadata`: the per-match roster the host keeps
//   in its match store. Credentials live here once bound.
//
// Game actions, game state and everything the state engine sends back to
// clients are opaque JSON (`serde_json::Value`). The host never inspects
// them, which keeps this crate independent of any particular game.
//
// Field names follow the established camelCase wire format (`matchID`,
// `playerID`, `stateVersion`, ...) so that peers written against that format
// interoperate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{MatchId, PlayerId, StateVersion};

/// Actions sent by a peer to the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientAction {
    /// A game action computed against `state_version`.
    Update {
        action: Value,
        #[serde(rename = "stateVersion")]
        state_version: StateVersion,
        #[serde(rename = "matchID")]
        match_id: MatchId,
        #[serde(rename = "playerID")]
        player_id: PlayerId,
    },
    /// A chat line.
    Chat {
        #[serde(rename = "matchID")]
        match_id: MatchId,
        #[serde(rename = "chatMessage")]
        chat_message: ChatMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<String>,
    },
    /// Request the full current state for this client.
    Sync {
        #[serde(rename = "matchID")]
        match_id: MatchId,
        #[serde(rename = "playerID")]
        player_id: Option<PlayerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<String>,
        #[serde(rename = "numPlayers")]
        num_players: u32,
    },
}

impl ClientAction {
    pub fn match_id(&self) -> &MatchId {
        match self {
            Self::Update { match_id, .. }
            | Self::Chat { match_id, .. }
            | Self::Sync { match_id, .. } => match_id,
        }
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update { .. } => "update",
            Self::Chat { .. } => "chat",
            Self::Sync { .. } => "sync",
        }
    }
}

/// A chat line as submitted by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender: Option<PlayerId>,
    pub payload: Value,
}

/// Metadata a peer attaches to a link when opening it.
///
/// `player_id: None` marks a spectator. `message` is the base64 signed
/// player id produced with the key behind `credentials`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    #[serde(rename = "playerID")]
    pub player_id: Option<PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ConnectionMetadata {
    pub fn spectator() -> Self {
        Self::default()
    }

    pub fn is_spectator(&self) -> bool {
        self.player_id.is_none()
    }
}

/// One seat in a match roster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerMetadata {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Bound credential (base64 public key). Written at most once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_connected: Option<bool>,
}

impl PlayerMetadata {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            name: None,
            credentials: None,
            is_connected: None,
        }
    }
}

/// Roster and bookkeeping for one match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchMetadata {
    pub game_name: String,
    pub players: BTreeMap<u32, PlayerMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_data: Option<Value>,
    #[serde(default)]
    pub unlisted: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl MatchMetadata {
    /// Fresh roster with seats `0..num_players`, none connected or bound.
    pub fn new(game_name: impl Into<String>, num_players: u32, now_ms: u64) -> Self {
        Self {
            game_name: game_name.into(),
            players: (0..num_players)
                .map(|id| (id, PlayerMetadata::new(id)))
                .collect(),
            setup_data: None,
            unlisted: false,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Seat for a player id, if the id names one of this match's seats.
    pub fn player(&self, player_id: &PlayerId) -> Option<&PlayerMetadata> {
        player_id.seat().and_then(|seat| self.players.get(&seat))
    }

    pub fn player_mut(&mut self, player_id: &PlayerId) -> Option<&mut PlayerMetadata> {
        player_id.seat().and_then(|seat| self.players.get_mut(&seat))
    }
}

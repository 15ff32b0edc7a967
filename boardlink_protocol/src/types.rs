// Core ID types for the peer-to-peer match protocol.
//
// Lightweight newtypes shared by `message.rs` (wire messages), the host
// registry and the peer connector in `boardlink_p2p`. Player and match ids
// are strings on the wire because the game layer chooses them; a player id
// is normally a small integer rendered as decimal ("0", "1", ...), and
// `PlayerId::seat` recovers that integer when the host needs to index the
// match metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a player seat, as sent by clients.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Seat index in the match metadata, if the id is a decimal integer.
    pub fn seat(&self) -> Option<u32> {
        self.0.parse().ok()
    }
}

impl From<u32> for PlayerId {
    fn from(seat: u32) -> Self {
        Self(seat.to_string())
    }
}

impl From<&str> for PlayerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a match, chosen by whoever creates it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(pub String);

impl MatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MatchId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Version of the authoritative state a client last saw. The state engine
/// uses it to reject actions computed against a stale state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVersion(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seat_parses_decimal_ids() {
        assert_eq!(PlayerId::from("0").seat(), Some(0));
        assert_eq!(PlayerId::from(7).seat(), Some(7));
        assert_eq!(PlayerId::from("observer").seat(), None);
        assert_eq!(PlayerId::from("-1").seat(), None);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        assert_eq!(serde_json::to_string(&PlayerId::from(1)).unwrap(), r#""1""#);
        assert_eq!(serde_json::to_string(&MatchId::from("m-1")).unwrap(), r#""m-1""#);
        assert_eq!(serde_json::to_string(&StateVersion(4)).unwrap(), "4");
    }
}

// boardlink_protocol — wire protocol for peer-to-peer authoritative matches.
//
// This crate defines what travels between a match host and its peers, plus
// the pieces both sides must compute identically. It is shared by the host
// and peer sides in `boardlink_p2p` and has no networking of its own.
//
// Module overview:
// - `types.rs`:       ID newtypes: `PlayerId`, `MatchId`, `StateVersion`.
// - `message.rs`:     `ClientAction` (peer → host), `ConnectionMetadata`
//                     (attached at link open), match/player metadata.
// - `framing.rs`:     Length-delimited `LinkFrame` framing for stream links.
// - `host_id.rs`:     Deterministic, sanitized host endpoint ids.
// - `credentials.rs`: Ed25519 keys derived from credential strings, and the
//                     signed player-id proof checked at authentication.
//
// Design decisions:
// - **JSON on the wire.** Game state and actions are already JSON in the
//   state engine, so payloads stay `serde_json::Value` end to end.
// - **Closed action enum.** `ClientAction` is tagged by `"type"` and matched
//   exhaustively; adding a variant is a compile error at every consumer.
// - **No async runtime.** Framing works over `std::io::Read`/`Write`.

pub mod credentials;
pub mod framing;
pub mod host_id;
pub mod message;
pub mod types;

pub use credentials::{CredentialError, Keypair, derive_keypair, sign_message, verify};
pub use framing::{LinkFrame, MAX_FRAME_SIZE, read_frame, write_frame};
pub use host_id::{host_endpoint_id, sanitize_endpoint_id};
pub use message::{ChatMessage, ClientAction, ConnectionMetadata, MatchMetadata, PlayerMetadata};
pub use types::{MatchId, PlayerId, StateVersion};

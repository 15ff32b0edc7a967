// Authentication gate for connecting clients.
//
// Decides whether a client claiming a player seat may register with the
// host, and binds a credential to the seat the first time one is presented
// with a valid proof. Checks, in order:
//
// 1. No player id, or an id that names no seat in the match: accept. This is
//    the spectator path; nothing is written.
// 2. Seat has no credential and the client presents one with a proof that
//    verifies for this player id under that key: store the key on the seat
//    (first writer wins) and accept.
// 3. Seat has no credential and the client presents none: accept. A seat
//    nobody has claimed with a key stays open.
// 4. Seat has a credential, the client presents the same one, and the proof
//    verifies: accept.
// 5. Anything else: reject.
//
// The roster is read from the store on every call, so a binding made by one
// call is visible to the next. Repeating an accepted call is a no-op.

use boardlink_protocol::credentials;
use boardlink_protocol::message::ConnectionMetadata;
use boardlink_protocol::types::MatchId;
use log::{debug, info, warn};

use crate::store::MatchStore;

/// Run the gate for `claimed` against the roster of `match_id`. May write a
/// newly bound credential back to the store.
pub fn authenticate(
    store: &mut MatchStore,
    match_id: &MatchId,
    claimed: &ConnectionMetadata,
) -> bool {
    let Some(player_id) = &claimed.player_id else {
        return true;
    };
    let metadata = match store.fetch(match_id) {
        Ok(record) => &record.metadata,
        Err(e) => {
            warn!("rejecting player {player_id}: {e}");
            return false;
        }
    };
    let Some(seat) = metadata.player(player_id) else {
        debug!("player id {player_id:?} names no seat in {match_id}, treating as spectator");
        return true;
    };

    // An empty credential string counts as none.
    let presented = claimed.credentials.as_deref().filter(|c| !c.is_empty());
    let proof_valid = |key: &str| {
        claimed
            .message
            .as_deref()
            .is_some_and(|message| credentials::verify(message, key, player_id.as_str()))
    };

    match (seat.credentials.as_deref(), presented) {
        (None, Some(key)) => {
            if !proof_valid(key) {
                debug!("player {player_id} presented a key without a valid proof");
                return false;
            }
            let mut updated = metadata.clone();
            if let Some(seat) = updated.player_mut(player_id) {
                seat.credentials = Some(key.to_owned());
            }
            if let Err(e) = store.set_metadata(match_id, updated) {
                warn!("could not bind credentials for player {player_id}: {e}");
                return false;
            }
            info!("bound credentials to player {player_id} in {match_id}");
            true
        }
        (None, None) => true,
        (Some(stored), Some(key)) => stored == key && proof_valid(key),
        (Some(_), None) => false,
    }
}

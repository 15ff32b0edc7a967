// Deterministic host endpoint identifiers.
//
// Peers find the host of a match without any lookup service: both sides
// compute the same endpoint id from the game name and the match id, and the
// host listens under it. Link layers only accept ids made of ASCII letters,
// digits, `_` and `-`, so the raw id is sanitized: foreign characters are
// dropped, separators are trimmed from both ends, and every run of
// separators collapses to its first character.

use crate::types::MatchId;

/// Endpoint id under which the host of `match_id` listens.
pub fn host_endpoint_id(game_name: &str, match_id: &MatchId) -> String {
    sanitize_endpoint_id(&format!("boardgameio-{game_name}-matchid-{match_id}"))
}

/// Reduce `raw` to the link-layer id charset.
pub fn sanitize_endpoint_id(raw: &str) -> String {
    let mut id = String::with_capacity(raw.len());
    let mut after_separator = false;
    for c in raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || is_separator(*c))
    {
        if is_separator(c) {
            if id.is_empty() || after_separator {
                continue;
            }
            after_separator = true;
        } else {
            after_separator = false;
        }
        id.push(c);
    }
    if after_separator {
        id.pop();
    }
    id
}

/// True if `id` is already in sanitized form and non-empty.
pub fn is_valid_endpoint_id(id: &str) -> bool {
    !id.is_empty() && sanitize_endpoint_id(id) == id
}

fn is_separator(c: char) -> bool {
    c == '_' || c == '-'
}

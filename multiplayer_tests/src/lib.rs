// Test-only game and participant wrapper for multiplayer integration tests.
//
// `TurnEngine` is a small but complete `StateEngine`: players take turns
// playing cards from secret hands. It exercises everything the host relies
// on from an engine: setup validation, `matchData` roster broadcasts on
// connection changes, syncs to the requesting player, `update` broadcasts
// filtered per viewer, chat, and re-syncing a player whose action was
// computed against a stale state version.
//
// `Participant` wraps a real `PeerConnector` and records every payload it
// delivers. The only test-specific code is the polling helpers: `pump`
// (several rounds of polling, enough for the in-process network, which
// delivers immediately) and `poll_until` (a blocking loop for the TCP link
// layer, where delivery happens on reader threads).
//
// See also: `tests/full_pipeline.rs` and `tests/tcp_link.rs` for the
// integration test scenarios.

use std::thread;
use std::time::{Duration, Instant};

use boardlink_p2p::link::LinkLayer;
use boardlink_p2p::{
    ConnectionStatus, ConnectorConfig, EngineContext, EngineFactory, PeerConnector, StateEngine,
};
use boardlink_protocol::message::{ChatMessage, MatchMetadata};
use boardlink_protocol::types::{MatchId, PlayerId, StateVersion};
use log::debug;
use serde_json::{Value, json};

/// Default timeout for blocking poll operations.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polling rounds per `pump`. Each hop (peer -> host -> peer) takes one.
const PUMP_ROUNDS: usize = 4;

const DEFAULT_HAND_SIZE: u64 = 3;
const MAX_HAND_SIZE: u64 = 10;

pub const GAME_NAME: &str = "cards";

/// Card game engine. State:
///
/// ```text
/// {"G": {"hands": {"0": [1, 2, 3], "1": [11, 12, 13]}, "played": []},
///  "ctx": {"turn": 1, "currentPlayer": "0", "numPlayers": 2},
///  "_stateID": 0}
/// ```
///
/// Moves (the `action` of an update): `{"type": "play", "card": n}` moves a
/// card from the mover's hand to `played`; `{"type": "endTurn"}` passes to
/// the next seat. Only the current player may move. Every accepted move
/// bumps `_stateID`, which clients echo back as their `StateVersion`.
pub struct TurnEngine;

pub fn turn_engine_factory() -> Box<dyn EngineFactory> {
    Box::new(|| Box::new(TurnEngine) as Box<dyn StateEngine>)
}

impl TurnEngine {
    /// Public roster: ids, names and connection flags. Bound credentials are
    /// never forwarded.
    fn roster(metadata: &MatchMetadata) -> Value {
        let players = metadata
            .players
            .values()
            .map(|player| {
                let mut entry = json!({"id": player.id});
                if let Some(name) = &player.name {
                    entry["name"] = json!(name);
                }
                if let Some(connected) = player.is_connected {
                    entry["isConnected"] = json!(connected);
                }
                entry
            })
            .collect();
        Value::Array(players)
    }

    fn sync_payload(ctx: &EngineContext<'_>, match_id: &MatchId) -> Option<Value> {
        let record = ctx.store().fetch(match_id).ok()?;
        Some(json!({
            "type": "sync",
            "args": [match_id, {
                "state": record.state,
                "log": record.log,
                "initialState": record.initial_state,
                "filteredMetadata": Self::roster(&record.metadata),
            }],
        }))
    }

    /// Apply `action` by `player_id` to `state`. Returns false if the move
    /// is not legal.
    fn apply(state: &mut Value, action: &Value, player_id: &PlayerId) -> bool {
        let num_players = state["ctx"]["numPlayers"].as_u64().unwrap_or(1).max(1);
        match action["type"].as_str() {
            Some("play") => {
                let Some(card) = action["card"].as_u64() else {
                    return false;
                };
                let hand_path = format!("/G/hands/{}", player_id.as_str());
                let Some(hand) = state.pointer_mut(&hand_path).and_then(Value::as_array_mut)
                else {
                    return false;
                };
                let Some(index) = hand.iter().position(|c| c.as_u64() == Some(card)) else {
                    return false;
                };
                hand.remove(index);
                let played = state.pointer_mut("/G/played").and_then(Value::as_array_mut);
                if let Some(played) = played {
                    played.push(json!(card));
                }
            }
            Some("endTurn") => {
                let next = player_id
                    .seat()
                    .map_or(0, |seat| (u64::from(seat) + 1) % num_players);
                let turn = state["ctx"]["turn"].as_u64().unwrap_or(0) + 1;
                if let Some(ctx) = state.get_mut("ctx") {
                    ctx["currentPlayer"] = json!(next.to_string());
                    ctx["turn"] = json!(turn);
                }
            }
            _ => return false,
        }
        let version = state["_stateID"].as_u64().unwrap_or(0) + 1;
        state["_stateID"] = json!(version);
        true
    }
}

/// Keep only `viewer`'s own hand.
fn redact_hands(state: Option<&mut Value>, viewer: Option<&PlayerId>) {
    let Some(hands) = state
        .and_then(|s| s.pointer_mut("/G/hands"))
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    hands.retain(|seat, _| viewer.is_some_and(|v| v.as_str() == seat));
}

impl StateEngine for TurnEngine {
    fn setup(&self, num_players: u32, setup_data: Option<&Value>) -> Result<Value, String> {
        let hand_size = match setup_data.and_then(|data| data.get("handSize")) {
            None => DEFAULT_HAND_SIZE,
            Some(size) => size
                .as_u64()
                .ok_or_else(|| format!("handSize must be a number, got {size}"))?,
        };
        if hand_size > MAX_HAND_SIZE {
            return Err(format!("handSize must be at most {MAX_HAND_SIZE}"));
        }
        let hands: serde_json::Map<String, Value> = (0..u64::from(num_players))
            .map(|seat| {
                let cards: Vec<u64> = (1..=hand_size).map(|i| seat * 10 + i).collect();
                (seat.to_string(), json!(cards))
            })
            .collect();
        Ok(json!({
            "G": {"hands": hands, "played": []},
            "ctx": {"turn": 1, "currentPlayer": "0", "numPlayers": num_players},
            "_stateID": 0,
        }))
    }

    fn on_update(
        &mut self,
        ctx: &mut EngineContext<'_>,
        action: Value,
        state_version: StateVersion,
        match_id: &MatchId,
        player_id: &PlayerId,
    ) {
        let Ok(record) = ctx.store().fetch(match_id) else {
            return;
        };
        let current = record.state["_stateID"].as_u64().unwrap_or(0);
        if state_version.0 != current {
            debug!(
                "player {player_id} acted on version {} but state is at {current}; re-syncing",
                state_version.0
            );
            if let Some(payload) = Self::sync_payload(ctx, match_id) {
                ctx.send(Some(player_id.clone()), payload);
            }
            return;
        }
        if record.state["ctx"]["currentPlayer"].as_str() != Some(player_id.as_str()) {
            debug!("player {player_id} moved out of turn");
            return;
        }

        let mut state = record.state.clone();
        if !Self::apply(&mut state, &action, player_id) {
            debug!("illegal move by player {player_id}: {action}");
            return;
        }
        let entry = json!({
            "action": action,
            "playerID": player_id,
            "_stateID": current,
            "turn": record.state["ctx"]["turn"],
        });
        if ctx
            .store_mut()
            .set_state(match_id, state.clone(), Some(vec![entry.clone()]))
            .is_err()
        {
            return;
        }
        ctx.send_all(json!({"type": "update", "args": [match_id, state, [entry]]}));
    }

    fn on_chat_message(
        &mut self,
        ctx: &mut EngineContext<'_>,
        match_id: &MatchId,
        chat_message: ChatMessage,
        _credentials: Option<&str>,
    ) {
        ctx.send_all(json!({"type": "chat", "args": [match_id, chat_message]}));
    }

    fn on_sync(
        &mut self,
        ctx: &mut EngineContext<'_>,
        match_id: &MatchId,
        player_id: Option<&PlayerId>,
        _credentials: Option<&str>,
        _num_players: u32,
    ) {
        if let Some(payload) = Self::sync_payload(ctx, match_id) {
            ctx.send(player_id.cloned(), payload);
        }
    }

    fn on_connection_change(
        &mut self,
        ctx: &mut EngineContext<'_>,
        match_id: &MatchId,
        player_id: Option<&PlayerId>,
        _credentials: Option<&str>,
        connected: bool,
    ) {
        let Some(player_id) = player_id else {
            return;
        };
        let Ok(record) = ctx.store().fetch(match_id) else {
            return;
        };
        let mut metadata = record.metadata.clone();
        let Some(seat) = metadata.player_mut(player_id) else {
            return;
        };
        seat.is_connected = Some(connected);
        let roster = Self::roster(&metadata);
        if ctx.store_mut().set_metadata(match_id, metadata).is_err() {
            return;
        }
        ctx.send_all(json!({"type": "matchData", "args": [match_id, roster]}));
    }

    fn filter_view(&self, viewer: Option<&PlayerId>, payload: &Value) -> Option<Value> {
        let mut view = payload.clone();
        match payload["type"].as_str() {
            Some("matchData") if viewer.is_none() => return None,
            Some("sync") => {
                redact_hands(view.pointer_mut("/args/1/state"), viewer);
                redact_hands(view.pointer_mut("/args/1/initialState"), viewer);
            }
            Some("update") => redact_hands(view.pointer_mut("/args/1"), viewer),
            _ => {}
        }
        Some(view)
    }
}

/// Configuration for a participant in a `GAME_NAME` match.
pub fn match_config(
    match_id: &str,
    player_id: Option<u32>,
    credentials: Option<&str>,
) -> ConnectorConfig {
    ConnectorConfig {
        game_name: GAME_NAME.into(),
        match_id: Some(MatchId::from(match_id)),
        player_id: player_id.map(PlayerId::from),
        credentials: credentials.map(str::to_owned),
        ..ConnectorConfig::default()
    }
}

/// A real `PeerConnector` plus everything it has delivered so far.
pub struct Participant {
    pub connector: PeerConnector,
    pub received: Vec<Value>,
}

impl Participant {
    /// Host the match with a `TurnEngine`.
    pub fn host(config: ConnectorConfig, link_layer: Box<dyn LinkLayer>) -> Self {
        Self {
            connector: PeerConnector::host(config, link_layer, turn_engine_factory()),
            received: Vec::new(),
        }
    }

    pub fn peer(config: ConnectorConfig, link_layer: Box<dyn LinkLayer>) -> Self {
        Self {
            connector: PeerConnector::peer(config, link_layer),
            received: Vec::new(),
        }
    }

    pub fn connect(&mut self) {
        self.connector.connect().expect("connect failed");
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connector.status()
    }

    /// Poll once; returns how many payloads arrived.
    pub fn poll(&mut self) -> usize {
        let payloads = self.connector.poll();
        let count = payloads.len();
        self.received.extend(payloads);
        count
    }

    pub fn poll_at(&mut self, now: Instant) -> usize {
        let payloads = self.connector.poll_at(now);
        let count = payloads.len();
        self.received.extend(payloads);
        count
    }

    /// Block until a payload of type `kind` matching `pred` arrives (only
    /// payloads received after this call count). Panics after
    /// `POLL_TIMEOUT`.
    pub fn poll_until(&mut self, kind: &str, pred: impl Fn(&Value) -> bool) -> Value {
        let start = self.received.len();
        let deadline = Instant::now() + POLL_TIMEOUT;
        loop {
            self.poll();
            if let Some(found) = self.received[start..]
                .iter()
                .find(|p| p["type"] == kind && pred(p))
            {
                return found.clone();
            }
            if Instant::now() > deadline {
                panic!(
                    "timed out waiting for {kind}; received since: {:?}",
                    &self.received[start..]
                );
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Block until the connector reaches `status`.
    pub fn poll_until_status(&mut self, status: ConnectionStatus) {
        let deadline = Instant::now() + POLL_TIMEOUT;
        while self.status() != status {
            if Instant::now() > deadline {
                panic!("timed out waiting for {status:?}, still {:?}", self.status());
            }
            thread::sleep(POLL_INTERVAL);
            self.poll();
        }
    }

    pub fn of_type(&self, kind: &str) -> Vec<&Value> {
        self.received.iter().filter(|p| p["type"] == kind).collect()
    }

    pub fn last_of_type(&self, kind: &str) -> Option<&Value> {
        self.received.iter().rev().find(|p| p["type"] == kind)
    }

    /// Latest game state seen in a sync or update.
    pub fn latest_state(&self) -> Option<&Value> {
        self.received.iter().rev().find_map(|p| match p["type"].as_str() {
            Some("sync") => p.pointer("/args/1/state"),
            Some("update") => p.pointer("/args/1"),
            _ => None,
        })
    }

    pub fn state_version(&self) -> StateVersion {
        StateVersion(
            self.latest_state()
                .and_then(|s| s["_stateID"].as_u64())
                .unwrap_or(0),
        )
    }

    /// Connection flag of `seat` in the latest roster broadcast.
    pub fn seat_connected(&self, seat: u32) -> Option<bool> {
        let roster = self.last_of_type("matchData")?.pointer("/args/1")?.as_array()?;
        roster
            .iter()
            .find(|p| p["id"] == seat)
            .and_then(|p| p["isConnected"].as_bool())
    }

    pub fn clear(&mut self) {
        self.received.clear();
    }
}

/// Poll every participant for a few rounds so in-flight payloads settle.
pub fn pump(participants: &mut [&mut Participant]) {
    for _ in 0..PUMP_ROUNDS {
        for participant in participants.iter_mut() {
            participant.poll();
        }
    }
}

// State engine seam.
//
// The host never interprets game state. It hands every client action to a
// `StateEngine`, which reads and writes the match store, decides what each
// client should see, and queues deliveries on the `EngineContext` it is
// given. The host fans those deliveries out after the engine call returns,
// running each one through `StateEngine::filter_view` for its recipient.
//
// Engines are built per host by an `EngineFactory`, so a connector can
// construct a fresh engine every time it (re)starts hosting.

use boardlink_protocol::message::ChatMessage;
use boardlink_protocol::types::{MatchId, PlayerId, StateVersion};
use serde_json::Value;

use crate::store::MatchStore;

/// A payload the engine wants delivered.
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    /// To every client registered as `player_id`. `None` addresses
    /// spectators.
    Player {
        player_id: Option<PlayerId>,
        payload: Value,
    },
    /// To every registered client.
    All { payload: Value },
}

/// What an engine call may touch: the match store, and an outbox.
pub struct EngineContext<'a> {
    store: &'a mut MatchStore,
    deliveries: Vec<Delivery>,
}

impl<'a> EngineContext<'a> {
    pub fn new(store: &'a mut MatchStore) -> Self {
        Self {
            store,
            deliveries: Vec::new(),
        }
    }

    pub fn store(&self) -> &MatchStore {
        self.store
    }

    pub fn store_mut(&mut self) -> &mut MatchStore {
        self.store
    }

    pub fn send(&mut self, player_id: Option<PlayerId>, payload: Value) {
        self.deliveries.push(Delivery::Player { player_id, payload });
    }

    pub fn send_all(&mut self, payload: Value) {
        self.deliveries.push(Delivery::All { payload });
    }

    pub fn into_deliveries(self) -> Vec<Delivery> {
        self.deliveries
    }
}

/// Game logic driven by the host.
pub trait StateEngine: Send {
    /// Initial state for a new match. `Err` carries the reason the setup
    /// data was rejected.
    fn setup(&self, num_players: u32, setup_data: Option<&Value>) -> Result<Value, String>;

    fn on_update(
        &mut self,
        ctx: &mut EngineContext<'_>,
        action: Value,
        state_version: StateVersion,
        match_id: &MatchId,
        player_id: &PlayerId,
    );

    fn on_chat_message(
        &mut self,
        ctx: &mut EngineContext<'_>,
        match_id: &MatchId,
        chat_message: ChatMessage,
        credentials: Option<&str>,
    );

    fn on_sync(
        &mut self,
        ctx: &mut EngineContext<'_>,
        match_id: &MatchId,
        player_id: Option<&PlayerId>,
        credentials: Option<&str>,
        num_players: u32,
    );

    fn on_connection_change(
        &mut self,
        ctx: &mut EngineContext<'_>,
        match_id: &MatchId,
        player_id: Option<&PlayerId>,
        credentials: Option<&str>,
        connected: bool,
    );

    /// The view of `payload` that `viewer` may see, or `None` to withhold
    /// it from that viewer entirely.
    fn filter_view(&self, viewer: Option<&PlayerId>, payload: &Value) -> Option<Value>;
}

/// Builds a fresh engine each time a host starts.
pub trait EngineFactory: Send {
    fn build(&self) -> Box<dyn StateEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Box<dyn StateEngine> + Send,
{
    fn build(&self) -> Box<dyn StateEngine> {
        self()
    }
}

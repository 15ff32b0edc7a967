// Authoritative host for one match.
//
// `Host` owns the match store and the state engine, and keeps a registry of
// connected clients. Connections and actions arrive from the connector's
// event loop (`connector.rs`), one at a time:
//
// - `register_client`: run the authentication gate (`auth.rs`). Rejected
//   clients are dropped without a word; accepted ones join the registry and
//   the engine hears about the connection.
// - `unregister_client`: leave the registry, engine hears about it.
// - `process_action`: hand a `ClientAction` to the matching engine hook.
// - `process_client_action`: same, for an action read off a client's link.
//   The client may only speak for the player it registered as: an `update`
//   or `sync` naming anyone else is dropped.
//
// Every engine call gets a fresh `EngineContext`; whatever it queued is
// fanned out before the call that triggered it returns. A `Player` delivery
// goes to every client registered under that player id (zero, one, or
// several links); an `All` delivery goes to every client. Each recipient
// gets `filter_view(recipient's player id, payload)`, and nothing at all if
// the filter withholds it.
//
// All mutation happens on the caller's thread. No internal locking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::Sender;
use std::time::{SystemTime, UNIX_EPOCH};

use boardlink_protocol::message::{ClientAction, ConnectionMetadata, MatchMetadata};
use boardlink_protocol::types::MatchId;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::authenticate;
use crate::engine::{Delivery, EngineContext, StateEngine};
use crate::store::{MatchStore, NewMatch};

/// Host-assigned handle for one registered client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Where a registered client's payloads go.
pub trait ClientSink: Send {
    fn deliver(&mut self, payload: &Value);
}

/// Local clients: payloads land in a channel the owner drains.
impl ClientSink for Sender<Value> {
    fn deliver(&mut self, payload: &Value) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.send(payload.clone());
    }
}

/// Configuration for a new host.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub game_name: String,
    pub match_id: MatchId,
    pub num_players: u32,
    pub setup_data: Option<Value>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            game_name: "default".into(),
            match_id: MatchId::new("default"),
            num_players: 2,
            setup_data: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("setupData Error: {0}")]
    SetupData(String),
}

struct Registration {
    metadata: ConnectionMetadata,
    sink: Box<dyn ClientSink>,
}

pub struct Host {
    match_id: MatchId,
    clients: BTreeMap<ClientId, Registration>,
    engine: Box<dyn StateEngine>,
    store: MatchStore,
}

impl Host {
    /// Create the match and its host. Fails if the engine rejects the setup
    /// data.
    pub fn new(config: HostConfig, engine: Box<dyn StateEngine>) -> Result<Self, HostError> {
        if config.game_name.is_empty() || config.game_name == "default" {
            error!(
                "Using \"default\" as your game name. Please set a unique game name \
                 to help avoid host id conflicts."
            );
        }

        let initial_state = engine
            .setup(config.num_players, config.setup_data.as_ref())
            .map_err(HostError::SetupData)?;
        let mut metadata = MatchMetadata::new(config.game_name, config.num_players, now_ms());
        metadata.setup_data = config.setup_data;

        let mut store = MatchStore::new();
        store.create_match(
            config.match_id.clone(),
            NewMatch {
                initial_state,
                metadata,
            },
        );

        Ok(Self {
            match_id: config.match_id,
            clients: BTreeMap::new(),
            engine,
            store,
        })
    }

    /// Authenticate and register a client. Returns whether it was accepted.
    /// Re-registering an id replaces its registration.
    pub fn register_client(
        &mut self,
        id: ClientId,
        metadata: ConnectionMetadata,
        sink: Box<dyn ClientSink>,
    ) -> bool {
        if !authenticate(&mut self.store, &self.match_id, &metadata) {
            info!(
                "rejected {id} claiming player {:?} in {}",
                metadata.player_id, self.match_id
            );
            return false;
        }
        let player_id = metadata.player_id.clone();
        let credentials = metadata.credentials.clone();
        self.clients.insert(id, Registration { metadata, sink });
        info!("registered {id} as player {player_id:?} in {}", self.match_id);

        let mut ctx = EngineContext::new(&mut self.store);
        self.engine.on_connection_change(
            &mut ctx,
            &self.match_id,
            player_id.as_ref(),
            credentials.as_deref(),
            true,
        );
        let deliveries = ctx.into_deliveries();
        self.fan_out(deliveries);
        true
    }

    /// Remove a client. Unknown ids are ignored.
    pub fn unregister_client(&mut self, id: ClientId) {
        let Some(registration) = self.clients.remove(&id) else {
            return;
        };
        let ConnectionMetadata {
            player_id,
            credentials,
            ..
        } = registration.metadata;
        info!("unregistered {id} (player {player_id:?}) from {}", self.match_id);

        let mut ctx = EngineContext::new(&mut self.store);
        self.engine.on_connection_change(
            &mut ctx,
            &self.match_id,
            player_id.as_ref(),
            credentials.as_deref(),
            false,
        );
        let deliveries = ctx.into_deliveries();
        self.fan_out(deliveries);
    }

    /// Hand one client action to the engine and deliver what it produces.
    pub fn process_action(&mut self, action: ClientAction) {
        debug!("processing {} action for {}", action.kind(), action.match_id());
        let mut ctx = EngineContext::new(&mut self.store);
        match action {
            ClientAction::Update {
                action,
                state_version,
                match_id,
                player_id,
            } => {
                self.engine
                    .on_update(&mut ctx, action, state_version, &match_id, &player_id);
            }
            ClientAction::Chat {
                match_id,
                chat_message,
                credentials,
            } => {
                self.engine.on_chat_message(
                    &mut ctx,
                    &match_id,
                    chat_message,
                    credentials.as_deref(),
                );
            }
            ClientAction::Sync {
                match_id,
                player_id,
                credentials,
                num_players,
            } => {
                self.engine.on_sync(
                    &mut ctx,
                    &match_id,
                    player_id.as_ref(),
                    credentials.as_deref(),
                    num_players,
                );
            }
        }
        let deliveries = ctx.into_deliveries();
        self.fan_out(deliveries);
    }

    /// Process an action sent by registered client `id`. Returns false, and
    /// processes nothing, if the client is unknown or the action claims a
    /// player other than the one the client authenticated as. Spectators
    /// may sync as spectators but never submit updates.
    pub fn process_client_action(&mut self, id: ClientId, action: ClientAction) -> bool {
        let Some(registration) = self.clients.get(&id) else {
            debug!("dropping {} action from unregistered {id}", action.kind());
            return false;
        };
        let registered = registration.metadata.player_id.as_ref();
        let claimed = match &action {
            ClientAction::Update { player_id, .. } => Some(player_id),
            ClientAction::Sync { player_id, .. } => player_id.as_ref(),
            ClientAction::Chat { .. } => registered,
        };
        if claimed != registered {
            debug!(
                "dropping {} action from {id}: claims player {claimed:?}, registered as {registered:?}",
                action.kind()
            );
            return false;
        }
        self.process_action(action);
        true
    }

    pub fn match_id(&self) -> &MatchId {
        &self.match_id
    }

    pub fn store(&self) -> &MatchStore {
        &self.store
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_registered(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    fn fan_out(&mut self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match delivery {
                Delivery::Player { player_id, payload } => {
                    let Some(view) = self.engine.filter_view(player_id.as_ref(), &payload) else {
                        continue;
                    };
                    let mut recipients = 0;
                    for registration in self
                        .clients
                        .values_mut()
                        .filter(|r| r.metadata.player_id == player_id)
                    {
                        registration.sink.deliver(&view);
                        recipients += 1;
                    }
                    if recipients == 0 {
                        debug!("no client registered as player {player_id:?}, dropping payload");
                    }
                }
                Delivery::All { payload } => {
                    for registration in self.clients.values_mut() {
                        let viewer = registration.metadata.player_id.as_ref();
                        if let Some(view) = self.engine.filter_view(viewer, &payload) {
                            registration.sink.deliver(&view);
                        }
                    }
                }
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

// Peer connector: one participant's side of a peer-to-peer match.
//
// A connector plays one of two roles, chosen at construction:
//
// - **Host** (`PeerConnector::host`): listens under the match's well-known
//   endpoint id (`host_endpoint_id`), runs the authoritative `Host`, and
//   registers itself as a local client so its own player goes through the
//   same authentication and view filtering as everyone else. Inbound links
//   are registered on `Incoming`, their data becomes
//   `Host::process_client_action` calls, and `Closed` unregisters them.
// - **Peer** (`PeerConnector::peer`): opens a link to the host's endpoint,
//   presenting `{player id, public key, signed player id}`. On `Opened` it
//   is connected and immediately asks for a sync. If the host is not there
//   (yet), or the link drops, it retries with exponential backoff.
//
// Event loop: link layers push `(generation, LinkEvent)` into one channel.
// The owner calls `poll()` (or `poll_at(now)` with an injected clock), which
// fires a due retry, drains and handles every queued event to completion,
// checks the sync timeout, and returns the payloads delivered to this
// participant. There is no timer thread: the only timer is a deadline
// checked on each poll.
//
// Generations: every time the connector closes its endpoint it bumps its
// generation, so events still in flight from the old endpoint are dropped
// unread.
//
// State machine:
//
//   Disconnected --connect--> Connecting --Opened--> Connected
//                               |    ^                  |
//                  recoverable  v    | retry due        | link closed /
//                  error       Retrying <---------------+ sync timeout
//
// A terminal link error, or a host whose setup fails, ends in
// `Disconnected` and is returned from `connect()` or, when it happens
// during `poll`, passed to the error handler.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use boardlink_protocol::credentials::{Keypair, derive_keypair};
use boardlink_protocol::host_id::host_endpoint_id;
use boardlink_protocol::message::{ChatMessage, ClientAction, ConnectionMetadata};
use boardlink_protocol::types::{MatchId, PlayerId, StateVersion};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backoff::{Backoff, BackoffConfig, RetryTimer};
use crate::engine::{EngineFactory, StateEngine};
use crate::host::{ClientId, ClientSink, Host, HostConfig, HostError};
use crate::link::{Endpoint, EventSink, LinkError, LinkEvent, LinkId, LinkLayer, LinkSender};

/// Registry handle of the host's own player.
pub const LOCAL_CLIENT: ClientId = ClientId(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    /// Waiting for a scheduled reconnection attempt.
    Retrying,
    Connected,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub game_name: String,
    pub match_id: Option<MatchId>,
    /// `None` connects as a spectator.
    pub player_id: Option<PlayerId>,
    /// Secret credential. Never sent anywhere; the signing keys are derived
    /// from it.
    pub credentials: Option<String>,
    pub num_players: u32,
    /// Handed to the engine's setup when hosting.
    pub setup_data: Option<Value>,
    pub backoff: BackoffConfig,
    /// How long a peer waits for the host's first payload after the link
    /// opens before giving up on the link.
    pub sync_timeout_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            game_name: "default".into(),
            match_id: None,
            player_id: None,
            credentials: None,
            num_players: 2,
            setup_data: None,
            backoff: BackoffConfig::default(),
            sync_timeout_ms: 10_000,
        }
    }
}

impl fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("game_name", &self.game_name)
            .field("match_id", &self.match_id)
            .field("player_id", &self.player_id)
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .field("num_players", &self.num_players)
            .field("setup_data", &self.setup_data)
            .field("backoff", &self.backoff)
            .field("sync_timeout_ms", &self.sync_timeout_ms)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("a match id is required to connect")]
    MissingMatchId,
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Link(#[from] LinkError),
}

type ErrorHandler = Box<dyn FnMut(&ConnectorError) + Send>;

enum Role {
    Peer,
    Host { factory: Box<dyn EngineFactory> },
}

pub struct PeerConnector {
    config: ConnectorConfig,
    role: Role,
    link_layer: Box<dyn LinkLayer>,
    keypair: Option<Keypair>,
    status: ConnectionStatus,

    // Link plumbing
    generation: u64,
    events_tx: Sender<(u64, LinkEvent)>,
    events_rx: Receiver<(u64, LinkEvent)>,
    endpoint: Option<Box<dyn Endpoint>>,
    /// Peer role: the open link to the host.
    outbound: Option<(LinkId, Box<dyn LinkSender>)>,

    // Reconnection
    backoff: Backoff,
    retry: RetryTimer,
    /// Peer role: when the link opened, until the host's first payload.
    awaiting_host_since: Option<Instant>,

    // Host role
    host: Option<Host>,
    links: HashMap<LinkId, ClientId>,
    next_client: u64,
    local_rx: Option<Receiver<Value>>,

    /// Payloads for this participant, returned by the next poll.
    inbox: Vec<Value>,
    on_error: Option<ErrorHandler>,
}

impl PeerConnector {
    /// A connector that joins the match hosted by someone else.
    pub fn peer(config: ConnectorConfig, link_layer: Box<dyn LinkLayer>) -> Self {
        Self::with_role(config, link_layer, Role::Peer)
    }

    /// A connector that hosts the match, building its state engine from
    /// `factory` every time it starts hosting.
    pub fn host(
        config: ConnectorConfig,
        link_layer: Box<dyn LinkLayer>,
        factory: Box<dyn EngineFactory>,
    ) -> Self {
        Self::with_role(config, link_layer, Role::Host { factory })
    }

    fn with_role(config: ConnectorConfig, link_layer: Box<dyn LinkLayer>, role: Role) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let keypair = config.credentials.as_deref().map(derive_keypair);
        let backoff = Backoff::new(config.backoff.clone());
        Self {
            config,
            role,
            link_layer,
            keypair,
            status: ConnectionStatus::Disconnected,
            generation: 0,
            events_tx,
            events_rx,
            endpoint: None,
            outbound: None,
            backoff,
            retry: RetryTimer::default(),
            awaiting_host_since: None,
            host: None,
            links: HashMap::new(),
            next_client: LOCAL_CLIENT.0 + 1,
            local_rx: None,
            inbox: Vec::new(),
            on_error: None,
        }
    }

    /// Receive errors that happen during `poll` rather than `connect`.
    pub fn with_error_handler(
        mut self,
        handler: impl FnMut(&ConnectorError) + Send + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }

    /// Start hosting, or start connecting to the host. Recoverable link
    /// failures are not errors: the connector goes to `Retrying`.
    pub fn connect(&mut self) -> Result<(), ConnectorError> {
        self.retry.cancel();
        self.open(Instant::now())
    }

    /// Tear everything down. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        self.close_endpoint();
        self.retry.cancel();
        self.backoff.reset();
        self.set_status(ConnectionStatus::Disconnected);
    }

    pub fn reconnect(&mut self) -> Result<(), ConnectorError> {
        self.disconnect();
        self.connect()
    }

    pub fn update_match_id(&mut self, match_id: MatchId) -> Result<(), ConnectorError> {
        self.config.match_id = Some(match_id);
        self.reconnect()
    }

    pub fn update_player_id(
        &mut self,
        player_id: Option<PlayerId>,
    ) -> Result<(), ConnectorError> {
        self.config.player_id = player_id;
        self.reconnect()
    }

    /// Replace the credential, re-deriving the signing keys.
    pub fn update_credentials(
        &mut self,
        credentials: Option<String>,
    ) -> Result<(), ConnectorError> {
        self.keypair = credentials.as_deref().map(derive_keypair);
        self.config.credentials = credentials;
        self.reconnect()
    }

    pub fn poll(&mut self) -> Vec<Value> {
        self.poll_at(Instant::now())
    }

    /// Run one step of the event loop as of `now` and return the payloads
    /// delivered to this participant since the last poll.
    pub fn poll_at(&mut self, now: Instant) -> Vec<Value> {
        if self.retry.fire(now) {
            debug!("retry due");
            if let Err(e) = self.open(now) {
                self.report(e);
            }
        }

        while let Ok((generation, event)) = self.events_rx.try_recv() {
            if generation != self.generation {
                debug!("dropping stale {event:?} from generation {generation}");
                continue;
            }
            self.handle_event(event, now);
        }

        if let Some(since) = self.awaiting_host_since {
            let timeout = Duration::from_millis(self.config.sync_timeout_ms);
            if now.saturating_duration_since(since) >= timeout {
                warn!("host sent nothing within {timeout:?}; dropping link");
                self.close_endpoint();
                self.schedule_retry(now, &LinkError::Disconnected);
            }
        }

        if let Some(rx) = &self.local_rx {
            self.inbox.extend(rx.try_iter());
        }
        std::mem::take(&mut self.inbox)
    }

    /// Submit a game action computed against `state_version`. Does nothing
    /// for spectators or while no channel to the host is open.
    pub fn send_action(&mut self, state_version: StateVersion, action: Value) {
        let (Some(match_id), Some(player_id)) =
            (self.config.match_id.clone(), self.config.player_id.clone())
        else {
            return;
        };
        self.emit(ClientAction::Update {
            action,
            state_version,
            match_id,
            player_id,
        });
    }

    pub fn send_chat_message(&mut self, chat_message: ChatMessage) {
        let Some(match_id) = self.config.match_id.clone() else {
            return;
        };
        let credentials = self.public_key();
        self.emit(ClientAction::Chat {
            match_id,
            chat_message,
            credentials,
        });
    }

    pub fn request_sync(&mut self) {
        let Some(match_id) = self.config.match_id.clone() else {
            return;
        };
        self.emit(ClientAction::Sync {
            match_id,
            player_id: self.config.player_id.clone(),
            credentials: self.public_key(),
            num_players: self.config.num_players,
        });
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_host(&self) -> bool {
        matches!(self.role, Role::Host { .. })
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// The running host, in the host role while connected.
    pub fn host_state(&self) -> Option<&Host> {
        self.host.as_ref()
    }

    /// When the pending reconnection attempt is due, if one is scheduled.
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry.deadline()
    }

    /// Endpoint id of the host for the configured match.
    pub fn host_endpoint(&self) -> Result<String, ConnectorError> {
        let match_id = self
            .config
            .match_id
            .as_ref()
            .ok_or(ConnectorError::MissingMatchId)?;
        Ok(host_endpoint_id(&self.config.game_name, match_id))
    }

    // --- connection lifecycle ---

    /// Open a fresh endpoint for our role.
    fn open(&mut self, now: Instant) -> Result<(), ConnectorError> {
        self.close_endpoint();
        let endpoint_id = match self.host_endpoint() {
            Ok(id) => id,
            Err(e) => {
                self.set_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };
        self.set_status(ConnectionStatus::Connecting);

        let engine = match &self.role {
            Role::Host { factory } => Some(factory.build()),
            Role::Peer => None,
        };
        let result = match engine {
            Some(engine) => self.start_hosting(&endpoint_id, engine),
            None => self.start_peer(&endpoint_id),
        };
        match result {
            Ok(()) => Ok(()),
            Err(ConnectorError::Link(e)) if e.is_recoverable() => {
                self.schedule_retry(now, &e);
                Ok(())
            }
            Err(e) => {
                warn!("connect to {endpoint_id} failed: {e}");
                self.set_status(ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }

    fn start_hosting(
        &mut self,
        endpoint_id: &str,
        engine: Box<dyn StateEngine>,
    ) -> Result<(), ConnectorError> {
        let match_id = self
            .config
            .match_id
            .clone()
            .ok_or(ConnectorError::MissingMatchId)?;
        let mut host = Host::new(
            HostConfig {
                game_name: self.config.game_name.clone(),
                match_id,
                num_players: self.config.num_players,
                setup_data: self.config.setup_data.clone(),
            },
            engine,
        )?;
        let endpoint = self.link_layer.listen(endpoint_id, self.event_sink())?;

        let (local_tx, local_rx) = mpsc::channel();
        if !host.register_client(LOCAL_CLIENT, self.local_metadata(), Box::new(local_tx)) {
            warn!("host rejected its own local client");
        }
        self.host = Some(host);
        self.local_rx = Some(local_rx);
        self.endpoint = Some(endpoint);
        self.backoff.reset();
        self.set_status(ConnectionStatus::Connected);
        info!("hosting {endpoint_id}");
        self.request_sync();
        Ok(())
    }

    fn start_peer(&mut self, endpoint_id: &str) -> Result<(), ConnectorError> {
        let metadata = self.local_metadata();
        let endpoint = self
            .link_layer
            .connect(endpoint_id, &metadata, self.event_sink())?;
        self.endpoint = Some(endpoint);
        Ok(())
    }

    /// Close the current endpoint and everything hanging off it. Events it
    /// emits from here on belong to a stale generation.
    fn close_endpoint(&mut self) {
        self.generation += 1;
        if let Some((_, mut sender)) = self.outbound.take() {
            sender.close();
        }
        if let Some(mut endpoint) = self.endpoint.take() {
            debug!("closing endpoint {}", endpoint.id());
            endpoint.close();
        }
        self.host = None;
        self.links.clear();
        self.local_rx = None;
        self.awaiting_host_since = None;
    }

    fn schedule_retry(&mut self, now: Instant, cause: &LinkError) {
        let delay = self.backoff.next_delay();
        match now.checked_add(delay) {
            Some(at) => {
                self.retry.schedule(at);
                info!("{cause}; retrying in {delay:?}");
            }
            None => warn!("{cause}; retry delay {delay:?} out of range, not retrying"),
        }
        self.set_status(ConnectionStatus::Retrying);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            debug!("connection status {:?} -> {status:?}", self.status);
            self.status = status;
        }
    }

    fn report(&mut self, error: ConnectorError) {
        warn!("connector error: {error}");
        if let Some(handler) = self.on_error.as_mut() {
            handler(&error);
        }
    }

    fn emit(&mut self, action: ClientAction) {
        if let Some(host) = self.host.as_mut() {
            host.process_action(action);
            return;
        }
        let Some((link, sender)) = self.outbound.as_mut() else {
            debug!("no channel open; dropping {} action", action.kind());
            return;
        };
        match serde_json::to_vec(&action) {
            Ok(bytes) => {
                if let Err(e) = sender.send(&bytes) {
                    warn!("send on {link} failed: {e}");
                }
            }
            Err(e) => warn!("cannot encode {} action: {e}", action.kind()),
        }
    }

    fn event_sink(&self) -> EventSink {
        EventSink::new(self.generation, self.events_tx.clone())
    }

    fn public_key(&self) -> Option<String> {
        self.keypair.as_ref().map(Keypair::public_key)
    }

    fn local_metadata(&self) -> ConnectionMetadata {
        let message = match (&self.keypair, &self.config.player_id) {
            (Some(keypair), Some(player_id)) => Some(keypair.sign(player_id.as_str())),
            _ => None,
        };
        ConnectionMetadata {
            player_id: self.config.player_id.clone(),
            credentials: self.public_key(),
            message,
        }
    }

    // --- event handling ---

    fn handle_event(&mut self, event: LinkEvent, now: Instant) {
        match event {
            LinkEvent::Incoming {
                link,
                metadata,
                sender,
            } => self.on_incoming(link, metadata, sender),
            LinkEvent::Opened { link, sender } => self.on_opened(link, sender, now),
            LinkEvent::Data { link, payload } => self.on_data(link, &payload),
            LinkEvent::Closed { link } => self.on_closed(link, now),
            LinkEvent::Error { error } => self.on_link_error(error, now),
        }
    }

    fn on_incoming(
        &mut self,
        link: LinkId,
        metadata: ConnectionMetadata,
        mut sender: Box<dyn LinkSender>,
    ) {
        let Some(host) = self.host.as_mut() else {
            debug!("not hosting; refusing {link}");
            sender.close();
            return;
        };
        let client = ClientId(self.next_client);
        self.next_client += 1;
        if host.register_client(client, metadata, Box::new(LinkClient { link, sender })) {
            self.links.insert(link, client);
        }
    }

    fn on_opened(&mut self, link: LinkId, mut sender: Box<dyn LinkSender>, now: Instant) {
        if self.is_host() {
            sender.close();
            return;
        }
        info!("connected to host over {link}");
        self.outbound = Some((link, sender));
        self.backoff.reset();
        self.retry.cancel();
        self.awaiting_host_since = Some(now);
        self.set_status(ConnectionStatus::Connected);
        self.request_sync();
    }

    fn on_data(&mut self, link: LinkId, payload: &[u8]) {
        if let Some(host) = self.host.as_mut() {
            let Some(&client) = self.links.get(&link) else {
                debug!("ignoring data from unregistered {link}");
                return;
            };
            match serde_json::from_slice::<ClientAction>(payload) {
                Ok(action) => {
                    host.process_client_action(client, action);
                }
                Err(e) => warn!("malformed action on {link}: {e}"),
            }
            return;
        }
        if self.outbound.as_ref().is_some_and(|(open, _)| *open == link) {
            match serde_json::from_slice::<Value>(payload) {
                Ok(value) => {
                    self.awaiting_host_since = None;
                    self.inbox.push(value);
                }
                Err(e) => warn!("malformed payload from host: {e}"),
            }
        }
    }

    fn on_closed(&mut self, link: LinkId, now: Instant) {
        if let Some(host) = self.host.as_mut() {
            if let Some(client) = self.links.remove(&link) {
                host.unregister_client(client);
            }
            return;
        }
        if self.outbound.as_ref().is_some_and(|(open, _)| *open == link) {
            info!("link to host closed");
            self.close_endpoint();
            self.schedule_retry(now, &LinkError::Disconnected);
        }
    }

    fn on_link_error(&mut self, error: LinkError, now: Instant) {
        if !error.is_recoverable() {
            self.close_endpoint();
            self.retry.cancel();
            self.set_status(ConnectionStatus::Disconnected);
            self.report(error.into());
        } else if self.is_host() {
            warn!("host endpoint error: {error}");
        } else {
            self.close_endpoint();
            self.schedule_retry(now, &error);
        }
    }
}

/// Host-side sink for a remote client: payloads go out over its link.
struct LinkClient {
    link: LinkId,
    sender: Box<dyn LinkSender>,
}

impl ClientSink for LinkClient {
    fn deliver(&mut self, payload: &Value) {
        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("cannot encode payload for {}: {e}", self.link);
                return;
            }
        };
        if let Err(e) = self.sender.send(&bytes) {
            // The link's Closed event will unregister the client.
            debug!("send on {} failed: {e}", self.link);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::engine::EngineContext;
    use crate::link::MemoryNetwork;

    /// Answers every sync with the stored state; ignores everything else.
    struct SyncEngine;

    impl StateEngine for SyncEngine {
        fn setup(&self, _num_players: u32, setup_data: Option<&Value>) -> Result<Value, String> {
            match setup_data {
                Some(Value::String(reason)) => Err(reason.clone()),
                _ => Ok(json!({"turn": 0})),
            }
        }

        fn on_update(
            &mut self,
            _ctx: &mut EngineContext<'_>,
            _action: Value,
            _state_version: StateVersion,
            _match_id: &MatchId,
            _player_id: &PlayerId,
        ) {
        }

        fn on_chat_message(
            &mut self,
            _ctx: &mut EngineContext<'_>,
            _match_id: &MatchId,
            _chat_message: ChatMessage,
            _credentials: Option<&str>,
        ) {
        }

        fn on_sync(
            &mut self,
            ctx: &mut EngineContext<'_>,
            match_id: &MatchId,
            player_id: Option<&PlayerId>,
            _credentials: Option<&str>,
            _num_players: u32,
        ) {
            if let Ok(record) = ctx.store().fetch(match_id) {
                let payload = json!({"type": "sync", "state": record.state});
                ctx.send(player_id.cloned(), payload);
            }
        }

        fn on_connection_change(
            &mut self,
            _ctx: &mut EngineContext<'_>,
            _match_id: &MatchId,
            _player_id: Option<&PlayerId>,
            _credentials: Option<&str>,
            _connected: bool,
        ) {
        }

        fn filter_view(&self, _viewer: Option<&PlayerId>, payload: &Value) -> Option<Value> {
            Some(payload.clone())
        }
    }

    fn sync_engine() -> Box<dyn EngineFactory> {
        Box::new(|| Box::new(SyncEngine) as Box<dyn StateEngine>)
    }

    fn config(player: Option<u32>) -> ConnectorConfig {
        ConnectorConfig {
            game_name: "test".into(),
            match_id: Some(MatchId::from("m1")),
            player_id: player.map(PlayerId::from),
            credentials: player.map(|p| format!("secret-{p}")),
            backoff: BackoffConfig {
                base_ms: 100,
                max_ms: 1_000,
            },
            sync_timeout_ms: 500,
            ..ConnectorConfig::default()
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn missing_match_id_is_an_error() {
        let network = MemoryNetwork::new();
        let mut peer = PeerConnector::peer(ConnectorConfig::default(), Box::new(network));
        assert!(matches!(peer.connect(), Err(ConnectorError::MissingMatchId)));
        assert_eq!(peer.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn host_is_connected_and_synced_immediately() {
        let network = MemoryNetwork::new();
        let mut host = PeerConnector::host(config(Some(0)), Box::new(network.clone()), sync_engine());
        host.connect().unwrap();

        assert_eq!(host.status(), ConnectionStatus::Connected);
        assert!(network.is_listening("boardgameio-test-matchid-m1"));
        assert_eq!(host.poll(), vec![json!({"type": "sync", "state": {"turn": 0}})]);

        // The host's own key is bound like anyone else's.
        let record = host
            .host_state()
            .unwrap()
            .store()
            .fetch(&MatchId::from("m1"))
            .unwrap();
        assert_eq!(
            record.metadata.players[&0].credentials,
            Some(derive_keypair("secret-0").public_key())
        );
    }

    #[test]
    fn host_setup_failure_is_fatal() {
        let network = MemoryNetwork::new();
        let mut config = config(Some(0));
        config.setup_data = Some(json!("BAD!"));
        let mut host = PeerConnector::host(config, Box::new(network.clone()), sync_engine());
        let err = host.connect().unwrap_err();
        assert_eq!(err.to_string(), "setupData Error: BAD!");
        assert_eq!(host.status(), ConnectionStatus::Disconnected);
        assert!(!network.is_listening("boardgameio-test-matchid-m1"));
    }

    #[test]
    fn second_host_for_a_match_is_refused() {
        let network = MemoryNetwork::new();
        let mut first = PeerConnector::host(config(Some(0)), Box::new(network.clone()), sync_engine());
        let mut second = PeerConnector::host(config(Some(1)), Box::new(network), sync_engine());
        first.connect().unwrap();
        assert!(matches!(
            second.connect(),
            Err(ConnectorError::Link(LinkError::IdTaken(_)))
        ));
        assert_eq!(second.status(), ConnectionStatus::Disconnected);
        assert_eq!(second.retry_deadline(), None);
    }

    #[test]
    fn peer_backs_off_exponentially_until_host_appears() {
        let network = MemoryNetwork::new();
        let mut peer = PeerConnector::peer(config(Some(1)), Box::new(network.clone()));
        let before = Instant::now();
        peer.connect().unwrap();
        assert_eq!(peer.status(), ConnectionStatus::Retrying);
        let mut deadline = peer.retry_deadline().unwrap();
        assert!(deadline >= before + ms(100));
        assert!(deadline <= Instant::now() + ms(100));

        // Each further failure doubles the wait, up to the cap.
        let mut delays = Vec::new();
        for _ in 0..4 {
            peer.poll_at(deadline);
            assert_eq!(peer.status(), ConnectionStatus::Retrying);
            let next = peer.retry_deadline().unwrap();
            delays.push(next - deadline);
            deadline = next;
        }
        assert_eq!(delays, vec![ms(200), ms(400), ms(800), ms(1_000)]);

        // Polling early does nothing.
        peer.poll_at(deadline - ms(1));
        assert_eq!(peer.retry_deadline(), Some(deadline));

        let mut host =
            PeerConnector::host(config(Some(0)), Box::new(network), sync_engine());
        host.connect().unwrap();
        host.poll();

        peer.poll_at(deadline);
        assert_eq!(peer.status(), ConnectionStatus::Connected);
        assert_eq!(peer.retry_deadline(), None);

        host.poll();
        let received = peer.poll_at(deadline);
        assert_eq!(received, vec![json!({"type": "sync", "state": {"turn": 0}})]);

        // Success reset the backoff: the next outage starts from the base.
        host.disconnect();
        peer.poll_at(deadline);
        assert_eq!(peer.status(), ConnectionStatus::Retrying);
        assert_eq!(peer.retry_deadline(), Some(deadline + ms(100)));
    }

    #[test]
    fn unreachable_network_is_retried() {
        let network = MemoryNetwork::new();
        network.set_reachable(false);
        let mut peer = PeerConnector::peer(config(None), Box::new(network));
        peer.connect().unwrap();
        assert_eq!(peer.status(), ConnectionStatus::Retrying);
        assert!(peer.retry_deadline().is_some());
    }

    #[test]
    fn silent_host_times_out_into_retry() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::channel();
        let _listener = network
            .listen("boardgameio-test-matchid-m1", EventSink::new(0, tx))
            .unwrap();

        let mut peer = PeerConnector::peer(config(Some(1)), Box::new(network.clone()));
        peer.connect().unwrap();
        let start = Instant::now();
        peer.poll_at(start);
        assert_eq!(peer.status(), ConnectionStatus::Connected);

        peer.poll_at(start + ms(499));
        assert_eq!(peer.status(), ConnectionStatus::Connected);

        peer.poll_at(start + ms(500));
        assert_eq!(peer.status(), ConnectionStatus::Retrying);
        assert_eq!(peer.retry_deadline(), Some(start + ms(600)));
        assert_eq!(network.open_links("boardgameio-test-matchid-m1"), 0);
    }

    #[test]
    fn sends_without_a_channel_are_no_ops() {
        let network = MemoryNetwork::new();
        let mut peer = PeerConnector::peer(config(Some(1)), Box::new(network));
        peer.send_action(StateVersion(0), json!({"type": "noop"}));
        peer.send_chat_message(ChatMessage {
            id: "c".into(),
            sender: None,
            payload: json!("hi"),
        });
        peer.request_sync();
        assert!(peer.poll().is_empty());
    }

    #[test]
    fn disconnect_is_idempotent_and_cancels_retry() {
        let network = MemoryNetwork::new();
        let mut peer = PeerConnector::peer(config(Some(1)), Box::new(network));
        peer.connect().unwrap();
        assert!(peer.retry_deadline().is_some());

        peer.disconnect();
        peer.disconnect();
        assert_eq!(peer.status(), ConnectionStatus::Disconnected);
        assert_eq!(peer.retry_deadline(), None);
        assert!(peer.poll_at(Instant::now() + ms(10_000)).is_empty());
        assert_eq!(peer.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn events_from_a_replaced_endpoint_are_ignored() {
        let network = MemoryNetwork::new();
        let mut host = PeerConnector::host(config(Some(0)), Box::new(network.clone()), sync_engine());
        host.connect().unwrap();
        host.poll();

        let mut peer = PeerConnector::peer(config(Some(1)), Box::new(network));
        peer.connect().unwrap();
        // Opened is queued for the first endpoint; switching matches makes it stale.
        peer.update_match_id(MatchId::from("m2")).unwrap();
        peer.poll();
        assert_eq!(peer.status(), ConnectionStatus::Retrying);
        assert_eq!(peer.config().match_id, Some(MatchId::from("m2")));
    }

    #[test]
    fn terminal_errors_during_poll_reach_the_handler() {
        let network = MemoryNetwork::new();
        let reported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reported);
        let mut peer = PeerConnector::peer(config(Some(1)), Box::new(network))
            .with_error_handler(move |e| {
                assert!(matches!(e, ConnectorError::Link(LinkError::Incompatible(_))));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        peer.connect().unwrap();
        let sink = peer.event_sink();
        sink.emit(LinkEvent::Error {
            error: LinkError::Incompatible("no data channels".into()),
        });
        peer.poll();
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(peer.status(), ConnectionStatus::Disconnected);
        assert_eq!(peer.retry_deadline(), None);
    }

    #[test]
    fn config_debug_redacts_credentials() {
        let printed = format!("{:?}", config(Some(0)));
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains("secret-0"));
    }
}

// Integration smoke test for hosting over TCP.
//
// Starts a hosting connector on localhost, polled on a background thread,
// then talks to it from plain TCP sockets using only the protocol crate's
// framing, message and credential types. No connector on the client side.
// Exercises the handshake, authentication (accepted and silently rejected),
// sync, chat fan-out, and disconnect notification.

use std::io::{self, BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use boardlink_p2p::link::{TcpDirectory, TcpLinkLayer};
use boardlink_p2p::{ConnectorConfig, EngineContext, PeerConnector, StateEngine};
use boardlink_protocol::credentials::derive_keypair;
use boardlink_protocol::framing::{LinkFrame, read_frame, write_frame};
use boardlink_protocol::host_id::host_endpoint_id;
use boardlink_protocol::message::{ChatMessage, ClientAction, ConnectionMetadata};
use boardlink_protocol::types::{MatchId, PlayerId, StateVersion};
use serde_json::{Value, json};

const GAME: &str = "smoke";
const MATCH: &str = "m1";

/// Syncs the stored state, broadcasts chat and seat presence.
struct EchoEngine;

impl StateEngine for EchoEngine {
    fn setup(&self, num_players: u32, _setup_data: Option<&Value>) -> Result<Value, String> {
        Ok(json!({"seats": num_players}))
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
        if let Ok(record) = ctx.store().fetch(match_id) {
            let payload = json!({"type": "sync", "state": record.state});
            ctx.send(player_id.cloned(), payload);
        }
    }

    fn on_connection_change(
        &mut self,
        ctx: &mut EngineContext<'_>,
        _match_id: &MatchId,
        player_id: Option<&PlayerId>,
        _credentials: Option<&str>,
        connected: bool,
    ) {
        if let Some(player_id) = player_id {
            let payload = json!({"type": "presence", "player": player_id, "connected": connected});
            ctx.send_all(payload);
        }
    }

    fn filter_view(&self, _viewer: Option<&PlayerId>, payload: &Value) -> Option<Value> {
        Some(payload.clone())
    }
}

/// Helper: a hosting connector polled on its own thread until stopped.
struct HostHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HostHandle {
    fn start(directory: &TcpDirectory) -> Self {
        let config = ConnectorConfig {
            game_name: GAME.into(),
            match_id: Some(MatchId::from(MATCH)),
            ..ConnectorConfig::default()
        };
        let factory = Box::new(|| Box::new(EchoEngine) as Box<dyn StateEngine>);
        let mut connector = PeerConnector::host(
            config,
            Box::new(TcpLinkLayer::new(directory.clone())),
            factory,
        );
        connector.connect().unwrap();

        let keep_running = Arc::new(AtomicBool::new(true));
        let running = Arc::clone(&keep_running);
        let thread = thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                connector.poll();
                thread::sleep(Duration::from_millis(5));
            }
            connector.disconnect();
        });
        Self {
            keep_running,
            thread: Some(thread),
        }
    }

    fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

/// Helper: connection metadata for `seat`, signed with the key derived
/// from `secret`.
fn signed(seat: u32, secret: &str) -> ConnectionMetadata {
    let keypair = derive_keypair(secret);
    let player_id = PlayerId::from(seat);
    ConnectionMetadata {
        message: Some(keypair.sign(player_id.as_str())),
        credentials: Some(keypair.public_key()),
        player_id: Some(player_id),
    }
}

/// Helper: open a link to the host and send the `Open` frame.
fn open(
    directory: &TcpDirectory,
    metadata: ConnectionMetadata,
    read_timeout: Duration,
) -> (BufReader<TcpStream>, BufWriter<TcpStream>) {
    let addr = directory
        .lookup(&host_endpoint_id(GAME, &MatchId::from(MATCH)))
        .expect("host not in directory");
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(read_timeout)).unwrap();
    let reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = BufWriter::new(stream);
    write_frame(&mut writer, &LinkFrame::Open { metadata }).unwrap();
    (reader, writer)
}

/// Helper: send a ClientAction as a Data frame.
fn send(writer: &mut BufWriter<TcpStream>, action: &ClientAction) {
    let payload = serde_json::to_vec(action).unwrap();
    write_frame(writer, &LinkFrame::Data { payload }).unwrap();
}

/// Helper: receive one payload from the host.
fn recv(reader: &mut BufReader<TcpStream>) -> Value {
    match read_frame(reader).unwrap() {
        LinkFrame::Data { payload } => serde_json::from_slice(&payload).unwrap(),
        other => panic!("expected Data, got {other:?}"),
    }
}

fn sync_action(seat: u32) -> ClientAction {
    ClientAction::Sync {
        match_id: MatchId::from(MATCH),
        player_id: Some(PlayerId::from(seat)),
        credentials: None,
        num_players: 2,
    }
}

#[test]
fn full_session_lifecycle() {
    let _ = env_logger::builder().is_test(true).try_init();
    let timeout = Duration::from_secs(5);

    // 1. Host a match on a random localhost port.
    let directory = TcpDirectory::new();
    let handle = HostHandle::start(&directory);

    // 2. Alice takes seat 0 and hears about herself, then syncs.
    let (mut reader_a, mut writer_a) = open(&directory, signed(0, "alice"), timeout);
    assert_eq!(
        recv(&mut reader_a),
        json!({"type": "presence", "player": "0", "connected": true})
    );
    send(&mut writer_a, &sync_action(0));
    assert_eq!(
        recv(&mut reader_a),
        json!({"type": "sync", "state": {"seats": 2}})
    );

    // 3. Mallory claims seat 0 with another key: silence, for everyone.
    let (mut reader_m, mut writer_m) = open(
        &directory,
        signed(0, "mallory"),
        Duration::from_millis(300),
    );
    send(&mut writer_m, &sync_action(0));
    let err = read_frame(&mut reader_m).unwrap_err();
    assert!(
        matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
        "expected a read timeout, got {err:?}"
    );

    // 4. Bob takes seat 1. Both seated players hear about it; Alice's next
    //    payload is Bob's presence, not anything about Mallory.
    let (mut reader_b, mut writer_b) = open(&directory, signed(1, "bob"), timeout);
    let joined = json!({"type": "presence", "player": "1", "connected": true});
    assert_eq!(recv(&mut reader_b), joined);
    assert_eq!(recv(&mut reader_a), joined);

    // 5. Bob chats; both receive it.
    send(
        &mut writer_b,
        &ClientAction::Chat {
            match_id: MatchId::from(MATCH),
            chat_message: ChatMessage {
                id: "c1".into(),
                sender: Some(PlayerId::from(1)),
                payload: json!("hello"),
            },
            credentials: Some(derive_keypair("bob").public_key()),
        },
    );
    for reader in [&mut reader_a, &mut reader_b] {
        let chat = recv(reader);
        assert_eq!(chat["type"], "chat");
        assert_eq!(chat["args"][1]["payload"], "hello");
    }

    // 6. Alice closes her link; Bob hears she left.
    write_frame(&mut writer_a, &LinkFrame::Close).unwrap();
    assert_eq!(
        recv(&mut reader_b),
        json!({"type": "presence", "player": "0", "connected": false})
    );

    handle.stop();
}

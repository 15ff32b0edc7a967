// boardlink_p2p — authoritative host and reconnecting peers for
// peer-to-peer matches.
//
// One participant hosts: it keeps the authoritative match state and sends
// every other participant exactly the view of it they are allowed to see.
// The others connect to it directly, with no server in between. This crate
// is that coordination layer; game rules live behind the `StateEngine`
// trait and transport behind the `LinkLayer` trait.
//
// Module overview:
// - `store.rs`:     In-memory `MatchStore` (state, delta log, roster).
// - `auth.rs`:      Authentication gate: binds a credential to a player seat
//                   on first contact and checks it on every later one.
// - `engine.rs`:    `StateEngine` / `EngineFactory` traits and the
//                   `EngineContext` through which engines queue deliveries.
// - `host.rs`:      `Host`: client registry, action dispatch, per-recipient
//                   view filtering and fan-out.
// - `link/`:        `LinkLayer` trait and two implementations, in-process
//                   (`MemoryNetwork`) and localhost TCP (`TcpLinkLayer`).
// - `backoff.rs`:   Exponential backoff and the single-slot retry timer.
// - `connector.rs`: `PeerConnector`: host discovery, connection state
//                   machine, reconnection, and the poll-driven event loop.
//
// Dependencies: `boardlink_protocol` (ids, wire messages, framing,
// credentials). No async runtime; link layers use threads and `mpsc`.

pub mod auth;
pub mod backoff;
pub mod connector;
pub mod engine;
pub mod host;
pub mod link;
pub mod store;

pub use connector::{ConnectionStatus, ConnectorConfig, ConnectorError, PeerConnector};
pub use engine::{EngineContext, EngineFactory, StateEngine};
pub use host::{ClientId, ClientSink, Host, HostConfig, HostError};
pub use store::{MatchRecord, MatchStore, NewMatch, StoreError};

// Link layer: named endpoints and reliable, ordered byte channels.
//
// The connector never touches sockets. It asks a `LinkLayer` to listen under
// an endpoint id (host role) or to connect to one (peer role), and then
// consumes `LinkEvent`s from a single `mpsc` channel. Link layers run their
// own I/O however they like (threads, in-process queues) and push events
// through the `EventSink` they were handed.
//
// Every sink carries the connector's current *generation*. When the
// connector tears an endpoint down it bumps its generation, so anything the
// old endpoint still emits afterwards is recognisably stale and ignored.
//
// Implementations:
// - `memory.rs`: in-process network for tests and same-process sessions.
// - `tcp.rs`:    localhost TCP using the protocol crate's frame codec.

pub mod memory;
pub mod tcp;

use std::fmt;
use std::sync::mpsc::Sender;

use boardlink_protocol::message::ConnectionMetadata;

pub use memory::MemoryNetwork;
pub use tcp::{TcpDirectory, TcpLinkLayer};

/// Identifies one link within the endpoint that reported it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// Nobody is listening under the requested id (yet).
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),
    #[error("network error: {0}")]
    Network(String),
    /// The link or endpoint went away underneath us.
    #[error("disconnected")]
    Disconnected,
    #[error("endpoint id already taken: {0}")]
    IdTaken(String),
    #[error("invalid endpoint id: {0:?}")]
    InvalidId(String),
    #[error("incompatible link: {0}")]
    Incompatible(String),
}

impl LinkError {
    /// Recoverable errors are retried with backoff; the rest are reported.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Network(_) | Self::Disconnected
        )
    }
}

/// Write half of a link.
pub trait LinkSender: Send {
    fn send(&mut self, payload: &[u8]) -> Result<(), LinkError>;

    /// Close the link. Both ends then see `LinkEvent::Closed`.
    fn close(&mut self);
}

pub enum LinkEvent {
    /// Host side: a peer opened a link carrying `metadata`.
    Incoming {
        link: LinkId,
        metadata: ConnectionMetadata,
        sender: Box<dyn LinkSender>,
    },
    /// Peer side: our link to the host is open.
    Opened {
        link: LinkId,
        sender: Box<dyn LinkSender>,
    },
    Data {
        link: LinkId,
        payload: Vec<u8>,
    },
    Closed {
        link: LinkId,
    },
    /// Asynchronous endpoint failure.
    Error {
        error: LinkError,
    },
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incoming { link, metadata, .. } => f
                .debug_struct("Incoming")
                .field("link", link)
                .field("metadata", metadata)
                .finish_non_exhaustive(),
            Self::Opened { link, .. } => f
                .debug_struct("Opened")
                .field("link", link)
                .finish_non_exhaustive(),
            Self::Data { link, payload } => f
                .debug_struct("Data")
                .field("link", link)
                .field("len", &payload.len())
                .finish(),
            Self::Closed { link } => f.debug_struct("Closed").field("link", link).finish(),
            Self::Error { error } => f.debug_struct("Error").field("error", error).finish(),
        }
    }
}

/// Where a link layer reports events, tagged with the generation of the
/// endpoint they belong to.
#[derive(Clone, Debug)]
pub struct EventSink {
    generation: u64,
    tx: Sender<(u64, LinkEvent)>,
}

impl EventSink {
    pub fn new(generation: u64, tx: Sender<(u64, LinkEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the receiving side is gone.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// A listening or connected endpoint. Closing (or dropping) it tears down
/// all of its links.
pub trait Endpoint: Send {
    fn id(&self) -> &str;
    fn close(&mut self);
}

pub trait LinkLayer: Send {
    /// Listen under `endpoint_id`. Inbound links arrive as
    /// `LinkEvent::Incoming`.
    fn listen(&self, endpoint_id: &str, events: EventSink)
    -> Result<Box<dyn Endpoint>, LinkError>;

    /// Open a link to the endpoint listening under `endpoint_id`. Success is
    /// reported as `LinkEvent::Opened`.
    fn connect(
        &self,
        endpoint_id: &str,
        metadata: &ConnectionMetadata,
        events: EventSink,
    ) -> Result<Box<dyn Endpoint>, LinkError>;
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn recoverable_errors() {
        assert!(LinkError::Unavailable("x".into()).is_recoverable());
        assert!(LinkError::Network("x".into()).is_recoverable());
        assert!(LinkError::Disconnected.is_recoverable());
        assert!(!LinkError::IdTaken("x".into()).is_recoverable());
        assert!(!LinkError::InvalidId("x".into()).is_recoverable());
        assert!(!LinkError::Incompatible("x".into()).is_recoverable());
    }

    #[test]
    fn sink_tags_events_with_its_generation() {
        let (tx, rx) = mpsc::channel();
        let sink = EventSink::new(7, tx);
        assert!(sink.emit(LinkEvent::Closed { link: LinkId(1) }));
        let (generation, event) = rx.recv().unwrap();
        assert_eq!(generation, 7);
        assert!(matches!(event, LinkEvent::Closed { link: LinkId(1) }));

        drop(rx);
        assert!(!sink.emit(LinkEvent::Closed { link: LinkId(1) }));
    }
}

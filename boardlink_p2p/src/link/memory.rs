// In-process link layer.
//
// `MemoryNetwork` plays the part of a signalling broker: a shared directory
// of endpoint ids. `listen` claims an id, `connect` looks it up and wires a
// channel between the two event sinks. Payloads are handed straight to the
// other end's sink, so delivery is ordered and immediate.
//
// Connecting emits `Incoming` to the listener before `Opened` to the
// connecting side, so the host always learns about a link before any data
// can arrive on it. Closing either end (or the host's listening endpoint)
// emits `Closed` to both ends exactly once.
//
// `set_reachable(false)` makes every `connect` fail with a recoverable
// network error, for exercising reconnection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use boardlink_protocol::host_id::is_valid_endpoint_id;
use boardlink_protocol::message::ConnectionMetadata;
use log::debug;
use parking_lot::Mutex;

use super::{Endpoint, EventSink, LinkError, LinkEvent, LinkId, LinkLayer, LinkSender};

/// Shared in-process network. Clones refer to the same network.
#[derive(Clone)]
pub struct MemoryNetwork {
    directory: Arc<Mutex<Directory>>,
}

struct Directory {
    listeners: HashMap<String, Listener>,
    next_link: u64,
    reachable: bool,
}

struct Listener {
    events: EventSink,
    channels: Vec<Arc<Channel>>,
}

struct Channel {
    open: AtomicBool,
    /// `[listener side, connecting side]`.
    ends: [End; 2],
}

struct End {
    events: EventSink,
    link: LinkId,
}

impl Channel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn shut(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            for end in &self.ends {
                end.events.emit(LinkEvent::Closed { link: end.link });
            }
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            directory: Arc::new(Mutex::new(Directory {
                listeners: HashMap::new(),
                next_link: 0,
                reachable: true,
            })),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.directory.lock().reachable = reachable;
    }

    pub fn is_listening(&self, endpoint_id: &str) -> bool {
        self.directory.lock().listeners.contains_key(endpoint_id)
    }

    /// Number of open links into the endpoint listening under `endpoint_id`.
    pub fn open_links(&self, endpoint_id: &str) -> usize {
        self.directory
            .lock()
            .listeners
            .get(endpoint_id)
            .map_or(0, |l| l.channels.iter().filter(|c| c.is_open()).count())
    }
}

impl LinkLayer for MemoryNetwork {
    fn listen(
        &self,
        endpoint_id: &str,
        events: EventSink,
    ) -> Result<Box<dyn Endpoint>, LinkError> {
        if !is_valid_endpoint_id(endpoint_id) {
            return Err(LinkError::InvalidId(endpoint_id.to_owned()));
        }
        let mut directory = self.directory.lock();
        if directory.listeners.contains_key(endpoint_id) {
            return Err(LinkError::IdTaken(endpoint_id.to_owned()));
        }
        directory.listeners.insert(
            endpoint_id.to_owned(),
            Listener {
                events,
                channels: Vec::new(),
            },
        );
        debug!("memory endpoint {endpoint_id} listening");
        Ok(Box::new(MemoryEndpoint {
            id: endpoint_id.to_owned(),
            directory: Arc::clone(&self.directory),
            role: Role::Listening,
        }))
    }

    fn connect(
        &self,
        endpoint_id: &str,
        metadata: &ConnectionMetadata,
        events: EventSink,
    ) -> Result<Box<dyn Endpoint>, LinkError> {
        if !is_valid_endpoint_id(endpoint_id) {
            return Err(LinkError::InvalidId(endpoint_id.to_owned()));
        }
        let channel = {
            let mut directory = self.directory.lock();
            if !directory.reachable {
                return Err(LinkError::Network("network unreachable".into()));
            }
            let link = LinkId(directory.next_link);
            directory.next_link += 1;
            let listener = directory
                .listeners
                .get_mut(endpoint_id)
                .ok_or_else(|| LinkError::Unavailable(endpoint_id.to_owned()))?;
            let channel = Arc::new(Channel {
                open: AtomicBool::new(true),
                ends: [
                    End {
                        events: listener.events.clone(),
                        link,
                    },
                    End {
                        events: events.clone(),
                        link,
                    },
                ],
            });
            listener.channels.retain(|c| c.is_open());
            listener.channels.push(Arc::clone(&channel));
            channel
        };

        let link = channel.ends[0].link;
        channel.ends[0].events.emit(LinkEvent::Incoming {
            link,
            metadata: metadata.clone(),
            sender: Box::new(MemorySender {
                channel: Arc::clone(&channel),
                side: 0,
            }),
        });
        events.emit(LinkEvent::Opened {
            link,
            sender: Box::new(MemorySender {
                channel: Arc::clone(&channel),
                side: 1,
            }),
        });
        debug!("memory {link} opened to {endpoint_id}");
        Ok(Box::new(MemoryEndpoint {
            id: endpoint_id.to_owned(),
            directory: Arc::clone(&self.directory),
            role: Role::Outbound { channel },
        }))
    }
}

struct MemorySender {
    channel: Arc<Channel>,
    side: usize,
}

impl LinkSender for MemorySender {
    fn send(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        if !self.channel.is_open() {
            return Err(LinkError::Disconnected);
        }
        let other = &self.channel.ends[1 - self.side];
        let delivered = other.events.emit(LinkEvent::Data {
            link: other.link,
            payload: payload.to_vec(),
        });
        if delivered {
            Ok(())
        } else {
            Err(LinkError::Disconnected)
        }
    }

    fn close(&mut self) {
        self.channel.shut();
    }
}

enum Role {
    Listening,
    Outbound { channel: Arc<Channel> },
    Closed,
}

struct MemoryEndpoint {
    id: String,
    directory: Arc<Mutex<Directory>>,
    role: Role,
}

impl Endpoint for MemoryEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn close(&mut self) {
        match std::mem::replace(&mut self.role, Role::Closed) {
            Role::Listening => {
                let listener = self.directory.lock().listeners.remove(&self.id);
                if let Some(listener) = listener {
                    for channel in &listener.channels {
                        channel.shut();
                    }
                    debug!("memory endpoint {} closed", self.id);
                }
            }
            Role::Outbound { channel } => channel.shut(),
            Role::Closed => {}
        }
    }
}

impl Drop for MemoryEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{self, Receiver};

    use boardlink_protocol::types::PlayerId;

    use super::*;

    fn sink(generation: u64) -> (EventSink, Receiver<(u64, LinkEvent)>) {
        let (tx, rx) = mpsc::channel();
        (EventSink::new(generation, tx), rx)
    }

    fn next(rx: &Receiver<(u64, LinkEvent)>) -> LinkEvent {
        rx.try_recv().unwrap().1
    }

    fn metadata() -> ConnectionMetadata {
        ConnectionMetadata {
            player_id: Some(PlayerId::from(1)),
            ..ConnectionMetadata::default()
        }
    }

    #[test]
    fn connect_without_listener_is_unavailable() {
        let network = MemoryNetwork::new();
        let (events, _rx) = sink(0);
        let err = network.connect("host", &metadata(), events).err().unwrap();
        assert_eq!(err, LinkError::Unavailable("host".into()));
        assert!(err.is_recoverable());
    }

    #[test]
    fn ids_are_validated_and_exclusive() {
        let network = MemoryNetwork::new();
        let (events, _rx) = sink(0);
        assert!(matches!(
            network.listen("bad id", events.clone()),
            Err(LinkError::InvalidId(_))
        ));
        let _host = network.listen("host", events.clone()).unwrap();
        assert_eq!(
            network.listen("host", events).err().unwrap(),
            LinkError::IdTaken("host".into())
        );
    }

    #[test]
    fn data_flows_both_ways_in_order() {
        let network = MemoryNetwork::new();
        let (host_events, host_rx) = sink(1);
        let (peer_events, peer_rx) = sink(2);
        let _host = network.listen("host", host_events).unwrap();
        let _peer = network.connect("host", &metadata(), peer_events).unwrap();

        let mut host_sender = match next(&host_rx) {
            LinkEvent::Incoming {
                metadata: received,
                sender,
                ..
            } => {
                assert_eq!(received, metadata());
                sender
            }
            other => panic!("expected Incoming, got {other:?}"),
        };
        let mut peer_sender = match next(&peer_rx) {
            LinkEvent::Opened { sender, .. } => sender,
            other => panic!("expected Opened, got {other:?}"),
        };

        peer_sender.send(b"one").unwrap();
        peer_sender.send(b"two").unwrap();
        host_sender.send(b"back").unwrap();

        for expected in [b"one".as_slice(), b"two".as_slice()] {
            match host_rx.try_recv().unwrap() {
                (1, LinkEvent::Data { payload, .. }) => assert_eq!(payload, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
        match peer_rx.try_recv().unwrap() {
            (2, LinkEvent::Data { payload, .. }) => assert_eq!(payload, b"back"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(network.open_links("host"), 1);
    }

    #[test]
    fn closing_the_listener_closes_its_links() {
        let network = MemoryNetwork::new();
        let (host_events, host_rx) = sink(0);
        let (peer_events, peer_rx) = sink(0);
        let mut host = network.listen("host", host_events).unwrap();
        let _peer = network.connect("host", &metadata(), peer_events).unwrap();
        let _ = next(&host_rx);
        let mut peer_sender = match next(&peer_rx) {
            LinkEvent::Opened { sender, .. } => sender,
            other => panic!("expected Opened, got {other:?}"),
        };

        host.close();
        assert!(!network.is_listening("host"));
        assert!(matches!(next(&peer_rx), LinkEvent::Closed { .. }));
        assert!(matches!(next(&host_rx), LinkEvent::Closed { .. }));
        assert_eq!(peer_sender.send(b"late"), Err(LinkError::Disconnected));

        // Closing again is a no-op; the id can be claimed anew.
        host.close();
        let (events, _rx) = sink(1);
        assert!(network.listen("host", events).is_ok());
    }

    #[test]
    fn dropping_the_peer_endpoint_closes_once() {
        let network = MemoryNetwork::new();
        let (host_events, host_rx) = sink(0);
        let (peer_events, peer_rx) = sink(0);
        let _host = network.listen("host", host_events).unwrap();
        let peer = network.connect("host", &metadata(), peer_events).unwrap();
        let _ = next(&host_rx);
        let _ = next(&peer_rx);

        drop(peer);
        assert!(matches!(next(&host_rx), LinkEvent::Closed { .. }));
        assert!(host_rx.try_recv().is_err());
        assert_eq!(network.open_links("host"), 0);
    }

    #[test]
    fn unreachable_network_fails_recoverably() {
        let network = MemoryNetwork::new();
        let (events, _rx) = sink(0);
        let _host = network.listen("host", events.clone()).unwrap();
        network.set_reachable(false);
        let err = network.connect("host", &metadata(), events.clone()).err().unwrap();
        assert!(matches!(err, LinkError::Network(_)));
        assert!(err.is_recoverable());
        network.set_reachable(true);
        assert!(network.connect("host", &metadata(), events).is_ok());
    }
}

// Localhost TCP link layer.
//
// Architecture: thread-per-reader, events funnelled into the connector's
// channel.
//
// - `TcpDirectory` stands in for a signalling service: a shared table from
//   endpoint id to the socket address the host bound.
// - **Listener thread** (one per listening endpoint): non-blocking
//   `accept()` loop that checks `keep_running` between attempts, and hands
//   every accepted stream to a reader thread. Accept failures (fd
//   exhaustion, aborted handshakes) are logged and retried with backoff;
//   the listener only stops when the endpoint closes.
// - **Reader threads** (one per link, both sides): `read_frame()` in a loop.
//   On the host side the first frame must be `LinkFrame::Open`, which
//   becomes `LinkEvent::Incoming`; after that `Data` frames become
//   `LinkEvent::Data`. On `Close`, EOF or any read error the thread emits
//   `LinkEvent::Closed` once and exits.
// - Writes happen on the connector's thread through `TcpSender`, which owns
//   a `BufWriter` over a clone of the stream. Reader threads never write.
//
// Inbound streams are tracked per link so closing the endpoint can shut
// them down; a link drops out of the table when its reader thread exits.
// Closing an endpoint shuts its sockets down, which unblocks the reader
// threads; they report `Closed` and exit on their own.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use boardlink_protocol::framing::{LinkFrame, read_frame, write_frame};
use boardlink_protocol::host_id::is_valid_endpoint_id;
use boardlink_protocol::message::ConnectionMetadata;
use log::{debug, warn};
use parking_lot::Mutex;

use super::{Endpoint, EventSink, LinkError, LinkEvent, LinkId, LinkLayer, LinkSender};
use crate::backoff::{Backoff, BackoffConfig};

/// How long a freshly accepted stream may take to send its `Open` frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between non-blocking accept attempts.
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Longest pause after repeated accept failures.
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(2);

/// Inbound streams of one listening endpoint, by link.
type TrackedStreams = Arc<Mutex<HashMap<LinkId, TcpStream>>>;

/// Shared endpoint-id → address table. Clones refer to the same table.
#[derive(Clone, Debug, Default)]
pub struct TcpDirectory {
    entries: Arc<Mutex<HashMap<String, SocketAddr>>>,
}

impl TcpDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, endpoint_id: &str) -> Option<SocketAddr> {
        self.entries.lock().get(endpoint_id).copied()
    }
}

#[derive(Clone, Debug)]
pub struct TcpLinkLayer {
    directory: TcpDirectory,
    next_link: Arc<AtomicU64>,
}

impl TcpLinkLayer {
    pub fn new(directory: TcpDirectory) -> Self {
        Self {
            directory,
            next_link: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_link(&self) -> LinkId {
        LinkId(self.next_link.fetch_add(1, Ordering::SeqCst))
    }
}

fn network_error(e: io::Error) -> LinkError {
    LinkError::Network(e.to_string())
}

impl TcpLinkLayer {
    fn listen_endpoint(
        &self,
        endpoint_id: &str,
        events: EventSink,
    ) -> Result<TcpEndpoint, LinkError> {
        if !is_valid_endpoint_id(endpoint_id) {
            return Err(LinkError::InvalidId(endpoint_id.to_owned()));
        }
        let mut entries = self.directory.entries.lock();
        if entries.contains_key(endpoint_id) {
            return Err(LinkError::IdTaken(endpoint_id.to_owned()));
        }
        let listener = TcpListener::bind("127.0.0.1:0").map_err(network_error)?;
        let addr = listener.local_addr().map_err(network_error)?;
        // Non-blocking so the accept thread can check keep_running.
        listener.set_nonblocking(true).map_err(network_error)?;
        entries.insert(endpoint_id.to_owned(), addr);
        drop(entries);

        let keep_running = Arc::new(AtomicBool::new(true));
        let streams = TrackedStreams::default();
        let accept_thread = {
            let keep_running = Arc::clone(&keep_running);
            let streams = Arc::clone(&streams);
            let layer = self.clone();
            thread::spawn(move || accept_loop(listener, layer, events, keep_running, streams))
        };
        debug!("tcp endpoint {endpoint_id} listening on {addr}");

        Ok(TcpEndpoint {
            id: endpoint_id.to_owned(),
            role: Role::Listening {
                directory: self.directory.clone(),
                addr,
                keep_running,
                streams,
                accept_thread: Some(accept_thread),
            },
        })
    }
}

impl LinkLayer for TcpLinkLayer {
    fn listen(
        &self,
        endpoint_id: &str,
        events: EventSink,
    ) -> Result<Box<dyn Endpoint>, LinkError> {
        Ok(Box::new(self.listen_endpoint(endpoint_id, events)?))
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
        let addr = self
            .directory
            .lookup(endpoint_id)
            .ok_or_else(|| LinkError::Unavailable(endpoint_id.to_owned()))?;
        let stream = TcpStream::connect(addr).map_err(|e| match e.kind() {
            io::ErrorKind::ConnectionRefused => LinkError::Unavailable(endpoint_id.to_owned()),
            _ => network_error(e),
        })?;

        let mut writer = BufWriter::new(stream.try_clone().map_err(network_error)?);
        write_frame(
            &mut writer,
            &LinkFrame::Open {
                metadata: metadata.clone(),
            },
        )
        .map_err(network_error)?;
        let reader = BufReader::new(stream.try_clone().map_err(network_error)?);

        let link = self.next_link();
        events.emit(LinkEvent::Opened {
            link,
            sender: Box::new(TcpSender { writer }),
        });
        thread::spawn(move || reader_loop(reader, link, events));
        debug!("tcp {link} opened to {endpoint_id} at {addr}");

        Ok(Box::new(TcpEndpoint {
            id: endpoint_id.to_owned(),
            role: Role::Outbound { stream },
        }))
    }
}

/// Source of inbound streams for the accept loop.
trait Accept: Send + 'static {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

impl Accept for TcpListener {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self)
    }
}

/// Accept loop for one listening endpoint. Runs in its own thread until
/// `keep_running` is cleared.
fn accept_loop(
    listener: impl Accept,
    layer: TcpLinkLayer,
    events: EventSink,
    keep_running: Arc<AtomicBool>,
    streams: TrackedStreams,
) {
    let mut failures = Backoff::new(BackoffConfig {
        base_ms: ACCEPT_POLL.as_millis() as u64,
        max_ms: ACCEPT_RETRY_MAX.as_millis() as u64,
    });
    let mut failing = false;
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if failing {
                    debug!("tcp accept recovered");
                    failing = false;
                    failures.reset();
                }
                stream.set_nonblocking(false).ok();
                let link = layer.next_link();
                debug!("tcp {link} accepted from {peer_addr}");
                let events = events.clone();
                let streams = Arc::clone(&streams);
                thread::spawn(move || serve_inbound(stream, link, events, streams));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                let pause = failures.next_delay();
                if failing {
                    debug!("tcp accept failed again: {e}; pausing {pause:?}");
                } else {
                    warn!("tcp accept failed: {e}; pausing {pause:?}");
                    failing = true;
                }
                thread::sleep(pause);
            }
        }
    }
}

/// Host side of one link: handshake, then the reader loop.
fn serve_inbound(
    stream: TcpStream,
    link: LinkId,
    events: EventSink,
    streams: TrackedStreams,
) {
    // Bound the handshake so a silent client can't pin this thread.
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok();
    let (Ok(read_half), Ok(write_half), Ok(tracked)) =
        (stream.try_clone(), stream.try_clone(), stream.try_clone())
    else {
        return;
    };
    let mut reader = BufReader::new(read_half);
    let metadata = match read_frame(&mut reader) {
        Ok(LinkFrame::Open { metadata }) => metadata,
        Ok(other) => {
            debug!("tcp {link}: expected Open, got {other:?}; dropping");
            return;
        }
        Err(e) => {
            debug!("tcp {link}: handshake failed: {e}");
            return;
        }
    };
    stream.set_read_timeout(None).ok();
    streams.lock().insert(link, tracked);

    let accepted = events.emit(LinkEvent::Incoming {
        link,
        metadata,
        sender: Box::new(TcpSender {
            writer: BufWriter::new(write_half),
        }),
    });
    if accepted {
        reader_loop(reader, link, events);
    }
    if let Some(stream) = streams.lock().remove(&link) {
        stream.shutdown(Shutdown::Both).ok();
    }
}

/// Read frames until the link ends, then report it closed.
fn reader_loop(mut reader: BufReader<TcpStream>, link: LinkId, events: EventSink) {
    loop {
        match read_frame(&mut reader) {
            Ok(LinkFrame::Data { payload }) => {
                if !events.emit(LinkEvent::Data { link, payload }) {
                    // Receiver dropped; nobody is listening.
                    return;
                }
            }
            Ok(LinkFrame::Close) => break,
            Ok(LinkFrame::Open { .. }) => {
                debug!("tcp {link}: unexpected Open after handshake");
                break;
            }
            Err(_) => break,
        }
    }
    if let Ok(stream) = reader.get_ref().try_clone() {
        stream.shutdown(Shutdown::Both).ok();
    }
    events.emit(LinkEvent::Closed { link });
}

struct TcpSender {
    writer: BufWriter<TcpStream>,
}

impl LinkSender for TcpSender {
    fn send(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        let frame = LinkFrame::Data {
            payload: payload.to_vec(),
        };
        write_frame(&mut self.writer, &frame).map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => LinkError::Disconnected,
            _ => network_error(e),
        })
    }

    fn close(&mut self) {
        if let Err(e) = write_frame(&mut self.writer, &LinkFrame::Close) {
            debug!("tcp close frame not sent: {e}");
        }
        self.writer.get_ref().shutdown(Shutdown::Both).ok();
    }
}

enum Role {
    Listening {
        directory: TcpDirectory,
        addr: SocketAddr,
        keep_running: Arc<AtomicBool>,
        streams: TrackedStreams,
        accept_thread: Option<JoinHandle<()>>,
    },
    Outbound {
        stream: TcpStream,
    },
    Closed,
}

struct TcpEndpoint {
    id: String,
    role: Role,
}

impl Endpoint for TcpEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn close(&mut self) {
        match std::mem::replace(&mut self.role, Role::Closed) {
            Role::Listening {
                directory,
                addr,
                keep_running,
                streams,
                accept_thread,
            } => {
                keep_running.store(false, Ordering::SeqCst);
                if let Some(handle) = accept_thread {
                    let _ = handle.join();
                }
                {
                    let mut entries = directory.entries.lock();
                    if entries.get(&self.id) == Some(&addr) {
                        entries.remove(&self.id);
                    }
                }
                for (_, stream) in streams.lock().drain() {
                    stream.shutdown(Shutdown::Both).ok();
                }
                debug!("tcp endpoint {} closed", self.id);
            }
            Role::Outbound { stream } => {
                stream.shutdown(Shutdown::Both).ok();
            }
            Role::Closed => {}
        }
    }
}

#[cfg(test)]
impl TcpEndpoint {
    /// Inbound links still tracked by a listening endpoint.
    fn tracked_links(&self) -> usize {
        match &self.role {
            Role::Listening { streams, .. } => streams.lock().len(),
            _ => 0,
        }
    }
}

impl Drop for TcpEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

// Length-delimited link framing for stream transports.
//
// A stream link (see `boardlink_p2p::link::tcp`) carries a sequence of
// `LinkFrame`s, each written as a 4-byte big-endian length prefix followed by
// the JSON-serialized frame. The first frame on every link is `Open`, which
// carries the connecting side's `ConnectionMetadata`; after that both sides
// exchange `Data` frames whose payloads are opaque bytes (JSON-encoded
// `ClientAction`s upstream, engine payloads downstream), and either side may
// send `Close` before shutting the socket.
//
// `MAX_FRAME_SIZE` (16 MB) bounds the allocation a malformed or malicious
// length prefix can trigger. Full-state sync payloads are the largest
// expected frames.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::message::ConnectionMetadata;

/// Maximum encoded frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// One unit on a stream link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum LinkFrame {
    /// Handshake: who is connecting and with what proof.
    Open { metadata: ConnectionMetadata },
    /// Opaque application payload.
    Data { payload: Vec<u8> },
    /// The sender is closing the link.
    Close,
}

/// Serialize `frame` and write it with its length prefix, then flush.
pub fn write_frame<W: Write>(writer: &mut W, frame: &LinkFrame) -> io::Result<()> {
    let body = serde_json::to_vec(frame).map_err(io::Error::other)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                    body.len()
                ),
            )
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

/// Read one length-prefixed frame.
///
/// `UnexpectedEof` if the stream ends before or inside a frame, `InvalidData`
/// if the prefix exceeds `MAX_FRAME_SIZE` or the body is not a frame.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<LinkFrame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {MAX_FRAME_SIZE})"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

//! Frame codec for the RPC wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬──────────────┬────────────────────┐
//! │ len (4B) │ type(1B) │ stream (4B)  │   payload          │
//! │ u32 BE   │ u8       │ u32 BE       │                    │
//! └──────────┴──────────┴──────────────┴────────────────────┘
//! ```
//! Length = sizeof(type byte) + sizeof(stream id) + sizeof(payload), NOT
//! including the 4-byte prefix. Message size limits apply to the payload,
//! except on `Request` frames where they apply to the body alone.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{Error, FrameError, Result, StreamId, WireError};

/// Bytes before the payload: length prefix, type byte, stream id.
pub const HEADER_LEN: usize = 9;

const PREFIX_LEN: usize = 4;
const MIN_FRAME_LEN: usize = HEADER_LEN - PREFIX_LEN;

/// Largest request head: `u16` length plus a head of at most `u16::MAX` bytes.
pub const REQUEST_HEAD_ALLOWANCE: usize = 2 + u16::MAX as usize;

/// Payload limit for a frame whose message limit is `max_message`.
fn payload_limit(raw_kind: u8, max_message: usize) -> usize {
    if raw_kind == FrameKind::Request as u8 {
        max_message.saturating_add(REQUEST_HEAD_ALLOWANCE)
    } else {
        max_message
    }
}

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Call request: request head + body.
    Request = 0x01,
    /// Single unary response; closes the stream.
    Response = 0x02,
    /// One message of a server-streaming response.
    StreamChunk = 0x03,
    /// Clean end of a server-streaming response.
    StreamEnd = 0x04,
    /// Caller abandoned the stream.
    Cancel = 0x05,
    /// Liveness probe.
    Ping = 0x10,
    /// Liveness probe acknowledgement.
    PingAck = 0x11,
    /// Peer will accept no new streams on this connection.
    GoAway = 0x12,
    /// Terminal failure for a stream (JSON `WireError` payload).
    Error = 0xFF,
}

impl FrameKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        let kind = match raw {
            0x01 => FrameKind::Request,
            0x02 => FrameKind::Response,
            0x03 => FrameKind::StreamChunk,
            0x04 => FrameKind::StreamEnd,
            0x05 => FrameKind::Cancel,
            0x10 => FrameKind::Ping,
            0x11 => FrameKind::PingAck,
            0x12 => FrameKind::GoAway,
            0xFF => FrameKind::Error,
            _ => return None,
        };
        Some(kind)
    }
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, stream_id: StreamId, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            stream_id,
            payload: payload.into(),
        }
    }

    /// Payload-less frame on the given stream.
    pub fn empty(kind: FrameKind, stream_id: StreamId) -> Self {
        Self::new(kind, stream_id, Bytes::new())
    }
}

/// Encode a frame, failing before anything is produced if the payload exceeds `max_size`.
pub fn encode(frame: &Frame, max_size: usize) -> std::result::Result<Bytes, FrameError> {
    let mut dst = BytesMut::new();
    encode_into(frame, &mut dst, max_size)?;
    Ok(dst.freeze())
}

/// Append one encoded frame to `dst`. On error `dst` is left untouched.
pub fn encode_into(
    frame: &Frame,
    dst: &mut BytesMut,
    max_size: usize,
) -> std::result::Result<(), FrameError> {
    let size = frame.payload.len();
    let wire_limit = u32::MAX as usize - MIN_FRAME_LEN;
    if size > max_size || size > wire_limit {
        return Err(FrameError::TooLarge {
            size,
            limit: max_size.min(wire_limit),
        });
    }

    let frame_len = (MIN_FRAME_LEN + size) as u32;
    dst.reserve(HEADER_LEN + size);
    dst.put_u32(frame_len);
    dst.put_u8(frame.kind as u8);
    dst.put_u32(frame.stream_id.get());
    dst.extend_from_slice(&frame.payload);
    Ok(())
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` while the frame is incomplete; buffered bytes are kept so
/// the call can be repeated as more input arrives. `TooLarge` is reported as
/// soon as the length prefix is visible, before any payload is buffered.
pub fn decode(
    src: &mut BytesMut,
    max_size: usize,
) -> std::result::Result<Option<Frame>, FrameError> {
    if src.len() < PREFIX_LEN {
        return Ok(None);
    }

    let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if frame_len < MIN_FRAME_LEN {
        return Err(FrameError::Malformed(format!(
            "frame length {} shorter than header",
            frame_len
        )));
    }

    let size = frame_len - MIN_FRAME_LEN;
    if size > max_size {
        return Err(FrameError::TooLarge {
            size,
            limit: max_size,
        });
    }

    if src.len() < PREFIX_LEN + frame_len {
        src.reserve(PREFIX_LEN + frame_len - src.len());
        return Ok(None);
    }

    let mut frame = src.split_to(PREFIX_LEN + frame_len);
    frame.advance(PREFIX_LEN);
    let raw_kind = frame.get_u8();
    let stream_id = StreamId::new(frame.get_u32());

    let kind = FrameKind::from_u8(raw_kind).ok_or_else(|| {
        FrameError::Malformed(format!("unknown frame type: 0x{:02X}", raw_kind))
    })?;

    Ok(Some(Frame {
        kind,
        stream_id,
        payload: frame.freeze(),
    }))
}

/// Like [`decode`], but input has ended: leftover bytes are `Truncated`.
pub fn decode_eof(
    src: &mut BytesMut,
    max_size: usize,
) -> std::result::Result<Option<Frame>, FrameError> {
    match decode(src, max_size)? {
        Some(frame) => Ok(Some(frame)),
        None if src.is_empty() => Ok(None),
        None => Err(FrameError::Truncated {
            buffered: src.len(),
        }),
    }
}

/// Item produced by the connection-level decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    /// A frame that cannot be delivered; only its stream fails.
    Rejected {
        stream_id: StreamId,
        error: FrameError,
    },
}

/// Connection-level codec used with `FramedRead` / `FramedWrite`.
///
/// Oversized inbound frames are skipped without buffering their payload and
/// surface as [`Decoded::Rejected`] so the connection itself survives.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_recv: usize,
    max_send: usize,
    discarding: usize,
}

impl FrameCodec {
    pub fn new(max_recv: usize, max_send: usize) -> Self {
        Self {
            max_recv,
            max_send,
            discarding: 0,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>> {
        if self.discarding > 0 {
            let n = self.discarding.min(src.len());
            src.advance(n);
            self.discarding -= n;
            if self.discarding > 0 {
                return Ok(None);
            }
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let stream_id = StreamId::new(u32::from_be_bytes([src[5], src[6], src[7], src[8]]));
        let limit = payload_limit(src[4], self.max_recv);
        if frame_len >= MIN_FRAME_LEN && frame_len - MIN_FRAME_LEN > limit {
            let size = frame_len - MIN_FRAME_LEN;
            src.advance(HEADER_LEN);
            self.discarding = size;
            return Ok(Some(Decoded::Rejected {
                stream_id,
                error: FrameError::TooLarge { size, limit },
            }));
        }

        match decode(src, limit) {
            Ok(Some(frame)) => Ok(Some(Decoded::Frame(frame))),
            Ok(None) => Ok(None),
            // Unknown type: the frame was consumed, fail only its stream.
            Err(error @ FrameError::Malformed(_)) if frame_len >= MIN_FRAME_LEN => {
                Ok(Some(Decoded::Rejected { stream_id, error }))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() && self.discarding == 0 => Ok(None),
            None => Err(FrameError::Truncated {
                buffered: src.len(),
            }
            .into()),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let limit = payload_limit(item.kind as u8, self.max_send);
        encode_into(&item, dst, limit)?;
        Ok(())
    }
}

// =============================================================================
// Request and error payloads
// =============================================================================

/// Call shape, carried in the request head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Unary,
    ServerStreaming,
}

/// Metadata sent ahead of the request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub kind: CallKind,
    /// Remaining time budget when the request was sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Request payload: `u16 BE` head length, JSON head, opaque body.
pub fn encode_request(head: &RequestHead, body: &[u8]) -> Result<Bytes> {
    let head_bytes = serde_json::to_vec(head)?;
    let head_len = u16::try_from(head_bytes.len())
        .map_err(|_| Error::validation(format!("method name too long: {}", head.method)))?;

    let mut buf = BytesMut::with_capacity(2 + head_bytes.len() + body.len());
    buf.put_u16(head_len);
    buf.extend_from_slice(&head_bytes);
    buf.extend_from_slice(body);
    Ok(buf.freeze())
}

pub fn decode_request(mut payload: Bytes) -> std::result::Result<(RequestHead, Bytes), FrameError> {
    if payload.len() < 2 {
        return Err(FrameError::Malformed("request missing head length".into()));
    }
    let head_len = payload.get_u16() as usize;
    if payload.len() < head_len {
        return Err(FrameError::Malformed(format!(
            "request head declares {} bytes, {} available",
            head_len,
            payload.len()
        )));
    }
    let head_bytes = payload.split_to(head_len);
    let head: RequestHead = serde_json::from_slice(&head_bytes)
        .map_err(|e| FrameError::Malformed(format!("invalid request head: {}", e)))?;
    Ok((head, payload))
}

/// Error payload for an `Error` frame.
pub(crate) fn encode_error(err: &Error) -> Bytes {
    match serde_json::to_vec(&err.to_wire()) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            tracing::error!("error payload encoding failed: {}", e);
            Bytes::from_static(br#"{"kind":"status","code":"INTERNAL","message":"unencodable error"}"#)
        }
    }
}

pub(crate) fn decode_error(payload: &[u8]) -> Error {
    match serde_json::from_slice::<WireError>(payload) {
        Ok(wire) => wire.into(),
        Err(e) => FrameError::Malformed(format!("invalid error payload: {}", e)).into(),
    }
}

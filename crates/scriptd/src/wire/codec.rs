//! Framed codec for the coordinator pipes.
//!
//! Wire format per frame: `TYPE:i32 | LEN:i32 | PAYLOAD:LEN bytes`, both
//! header fields big-endian. A zero-length payload is a complete, valid
//! frame. Works over any AsyncRead/AsyncWrite (pipes, sockets, test
//! duplexes).
//!
//! Malformed frames (negative length, oversize length, unknown type,
//! payload that fails to parse) are fatal to the connection: the error
//! propagates out of the framed stream and the reactor tears the
//! connection down. There is no frame-level retry.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{Msg, MsgType};

const HEADER_LEN: usize = 8;

/// Upper bound on a single payload. Nothing legitimate approaches this;
/// anything larger is a desynchronized or corrupt stream.
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// One raw frame: type tag plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: i32,
    pub payload: Bytes,
}

/// Codec for raw frames.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let msg_type = header.get_i32();
        let len = header.get_i32();

        if len < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("negative frame length {len}"),
            ));
        }
        let len = len as usize;
        if len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} exceeds {MAX_PAYLOAD}"),
            ));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { msg_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload of {} bytes exceeds {MAX_PAYLOAD}", frame.payload.len()),
            ));
        }
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_i32(frame.msg_type);
        dst.put_i32(frame.payload.len() as i32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// Codec speaking [`Msg`] directly: frames plus serde_json payload bodies.
#[derive(Debug, Default)]
pub struct MsgCodec {
    inner: FrameCodec,
}

impl MsgCodec {
    pub fn new() -> Self {
        Self {
            inner: FrameCodec::new(),
        }
    }
}

impl Decoder for MsgCodec {
    type Item = Msg;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };

        let msg_type = MsgType::from_wire(frame.msg_type).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message type {}", frame.msg_type),
            )
        })?;

        let msg = Msg::decode_payload(msg_type, &frame.payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        tracing::trace!(target: "scriptd::wire", ?msg_type, payload_len = frame.payload.len(), "Decoded frame");
        Ok(Some(msg))
    }
}

impl Encoder<Msg> for MsgCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Msg, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let msg_type = msg.msg_type();
        let payload = msg
            .encode_payload()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        tracing::trace!(target: "scriptd::wire", ?msg_type, payload_len = payload.len(), "Encoding frame");

        self.inner.encode(
            Frame {
                msg_type: msg_type.wire(),
                payload: Bytes::from(payload),
            },
            dst,
        )
    }
}

//! Framed codec for the session streams.
//!
//! Binary layout, identical on both ends:
//! - one tag byte selecting the frame kind;
//! - fixed-width little-endian integers;
//! - strings as a `u32` little-endian byte length followed by UTF-8 bytes;
//! - payload blobs as an `i32` little-endian length followed by raw
//!   MessagePack bytes, where length 0 means "absent".
//!
//! Works over any AsyncRead/AsyncWrite (sockets, pipes). Not thread-safe;
//! writers hold the stream's write lock around each frame.

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::payload;
use super::protocol::{
    CallOutcome, Frame, Severity, STATUS_ERROR, STATUS_SUCCESS, TAG_CALL, TAG_EVENT, TAG_LOG,
    TAG_RESPONSE,
};

/// Hard cap on any single length field. A declared length beyond this (or a
/// negative blob length) is treated as stream corruption.
const MAX_SEGMENT: usize = 64 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

enum DecodeError {
    Incomplete,
    Malformed(String),
}

fn malformed(msg: impl Into<String>) -> DecodeError {
    DecodeError::Malformed(msg.into())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn take_i32(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_string(&mut self) -> Result<String, DecodeError> {
        let len = self.take_u32()? as usize;
        if len > MAX_SEGMENT {
            return Err(malformed(format!("string length {len} exceeds frame cap")));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| malformed(format!("invalid UTF-8: {e}")))
    }

    fn take_blob(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.take_i32()?;
        if len < 0 {
            return Err(malformed(format!("negative blob length {len}")));
        }
        let len = len as usize;
        if len > MAX_SEGMENT {
            return Err(malformed(format!("blob length {len} exceeds frame cap")));
        }
        self.take(len)
    }
}

fn parse_frame(reader: &mut Reader<'_>) -> Result<Frame, DecodeError> {
    let tag = reader.take_u8()?;
    match tag {
        TAG_CALL => {
            let id = reader.take_i32()?;
            let method = reader.take_string()?;
            let blob = reader.take_blob()?;
            let args =
                payload::decode_args(blob).map_err(|e| malformed(format!("call args: {e}")))?;
            Ok(Frame::Call { id, method, args })
        }
        TAG_RESPONSE => {
            let id = reader.take_i32()?;
            let status = reader.take_string()?;
            let blob = reader.take_blob()?;
            let outcome = match status.as_str() {
                STATUS_SUCCESS => CallOutcome::Success(decode_optional(blob)?),
                STATUS_ERROR => CallOutcome::Error(decode_error_message(blob)?),
                other => return Err(malformed(format!("unknown response status {other:?}"))),
            };
            Ok(Frame::Response { id, outcome })
        }
        TAG_EVENT => {
            let name = reader.take_string()?;
            let blob = reader.take_blob()?;
            Ok(Frame::Event {
                name,
                payload: decode_optional(blob)?,
            })
        }
        TAG_LOG => {
            let severity = Severity::parse(&reader.take_string()?);
            let message = reader.take_string()?;
            Ok(Frame::Log { severity, message })
        }
        other => Err(malformed(format!("unknown frame tag {other:#04x}"))),
    }
}

fn decode_optional(blob: &[u8]) -> Result<Option<rmpv::Value>, DecodeError> {
    if blob.is_empty() {
        return Ok(None);
    }
    payload::decode_value(blob)
        .map(Some)
        .map_err(|e| malformed(format!("payload: {e}")))
}

/// Error payloads carry a single human-readable message string. Anything
/// else still surfaces as text rather than killing the stream.
fn decode_error_message(blob: &[u8]) -> Result<String, DecodeError> {
    match decode_optional(blob)? {
        Some(rmpv::Value::String(s)) => Ok(s.into_str().unwrap_or_default()),
        Some(other) => Ok(other.to_string()),
        None => Ok(String::new()),
    }
}

fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_u32_le(s.len() as u32);
    dst.put_slice(s.as_bytes());
}

fn put_blob(dst: &mut BytesMut, blob: &[u8]) {
    dst.put_i32_le(blob.len() as i32);
    dst.put_slice(blob);
}

fn encode_err(e: payload::PayloadError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        let mut reader = Reader::new(&src[..]);
        match parse_frame(&mut reader) {
            Ok(frame) => {
                let consumed = reader.pos;
                src.advance(consumed);
                Ok(Some(frame))
            }
            Err(DecodeError::Incomplete) => Ok(None),
            Err(DecodeError::Malformed(msg)) => {
                Err(io::Error::new(io::ErrorKind::InvalidData, msg))
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        let start = dst.len();
        match frame {
            Frame::Call { id, method, args } => {
                dst.put_u8(TAG_CALL);
                dst.put_i32_le(id);
                put_string(dst, &method);
                let blob = payload::encode_args(&args).map_err(encode_err)?;
                put_blob(dst, &blob);
            }
            Frame::Response { id, outcome } => {
                dst.put_u8(TAG_RESPONSE);
                dst.put_i32_le(id);
                match outcome {
                    CallOutcome::Success(payload_value) => {
                        put_string(dst, STATUS_SUCCESS);
                        match payload_value {
                            Some(value) => {
                                let blob = payload::encode_value(&value).map_err(encode_err)?;
                                put_blob(dst, &blob);
                            }
                            None => put_blob(dst, &[]),
                        }
                    }
                    CallOutcome::Error(message) => {
                        put_string(dst, STATUS_ERROR);
                        let blob = payload::encode_value(&rmpv::Value::from(message.as_str()))
                            .map_err(encode_err)?;
                        put_blob(dst, &blob);
                    }
                }
            }
            Frame::Event { name, payload: p } => {
                dst.put_u8(TAG_EVENT);
                put_string(dst, &name);
                match p {
                    Some(value) => {
                        let blob = payload::encode_value(&value).map_err(encode_err)?;
                        put_blob(dst, &blob);
                    }
                    None => put_blob(dst, &[]),
                }
            }
            Frame::Log { severity, message } => {
                dst.put_u8(TAG_LOG);
                put_string(dst, severity.as_str());
                put_string(dst, &message);
            }
        }
        // These traces must never travel over the bridge themselves; the
        // runner's log layer filters the runlet::bridge targets so encoding
        // a Log frame cannot generate another one.
        tracing::trace!(frame_bytes = dst.len() - start, "encoded frame");
        Ok(())
    }
}

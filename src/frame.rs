//! Wire frame header and per-message-type body encoding.
//!
//! Every frame is `u32 payload-length || u8 message-type || u32 request-id ||
//! body` (§6), where `payload-length` counts everything after itself. This
//! mirrors the teacher's `transaction::frame` module (`FrameHeader`,
//! `read_frame`/`write_frame` over `AsyncRead`/`AsyncWrite`) with a 9-byte
//! header in place of Hotline's 20-byte one, little-endian per §4.1 rather
//! than Hotline's big-endian.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::{
    error::{FrameError, VariantError},
    variant::{self, IdReplacer, ObjectReplacer, Variant},
};

/// `CALL_PROC`: no response expected.
pub const MSG_CALL_PROC: u8 = 10;
/// `CALL_FUNC`: a `RETURN` is expected.
pub const MSG_CALL_FUNC: u8 = 11;
/// `RETURN`: response to a `CALL_FUNC`.
pub const MSG_RETURN: u8 = 20;
/// `DELOBJ`: fire-and-forget object release.
pub const MSG_DELOBJ: u8 = 30;
/// Reserved keepalive ping.
pub const MSG_PING: u8 = 0;
/// Reserved keepalive pong.
pub const MSG_PONG: u8 = 1;

/// Fixed header size: `u32` length + `u8` type + `u32` request id.
pub const HEADER_LEN: usize = 4 + 1 + 4;

/// A decoded frame: header fields plus the still-encoded, type-specific body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// One of the `MSG_*` constants.
    pub msg_type: u8,
    /// Correlates a `CALL_FUNC` with its eventual `RETURN`.
    pub request_id: u32,
    /// Type-specific payload, not yet decoded into a [`Variant`].
    pub body: Vec<u8>,
}

impl RawFrame {
    /// Total on-wire size of this frame including its length prefix.
    #[must_use]
    pub fn wire_len(&self) -> usize { HEADER_LEN + self.body.len() }

    fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let payload_len = u32::try_from(1 + 4 + self.body.len())
            .map_err(|_| FrameError::TooLarge(u32::MAX, u32::MAX))?;
        let mut buf = Vec::with_capacity(4 + payload_len as usize);
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.push(self.msg_type);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }
}

/// Read one frame from `reader`, rejecting anything whose declared payload
/// length exceeds `max_frame_size` before attempting to read the body
/// (§4.4's frame size guard).
///
/// # Errors
/// Returns [`FrameError::TooLarge`] on an oversized declared length, or
/// [`FrameError::Io`] on any underlying read failure (including a clean EOF,
/// which callers should treat as a normal disconnect).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: u32,
) -> Result<RawFrame, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let payload_len = u32::from_le_bytes(len_buf);
    if payload_len > max_frame_size {
        return Err(FrameError::TooLarge(payload_len, max_frame_size));
    }
    if (payload_len as usize) < 5 {
        return Err(FrameError::UnknownMessageType(0));
    }
    let mut rest = vec![0u8; payload_len as usize];
    reader.read_exact(&mut rest).await?;
    let msg_type = rest[0];
    #[expect(clippy::indexing_slicing, reason = "length checked against the 5-byte minimum above")]
    let request_id = u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]);
    let body = rest.split_off(5);
    trace!(msg_type, request_id, body_len = body.len(), "read frame");
    Ok(RawFrame { msg_type, request_id, body })
}

/// Write `frame` to `writer` in full.
///
/// # Errors
/// Returns [`FrameError::Io`] on a write failure, or [`FrameError::TooLarge`]
/// if the frame's encoded length overflows a `u32`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &RawFrame,
) -> Result<(), FrameError> {
    let bytes = frame.encode()?;
    trace!(msg_type = frame.msg_type, request_id = frame.request_id, len = bytes.len(), "write frame");
    writer.write_all(&bytes).await?;
    Ok(())
}

fn write_name(buf: &mut Vec<u8>, name: &str) -> Result<(), VariantError> {
    let bytes = name.as_bytes();
    let len = u8::try_from(bytes.len()).map_err(|_| VariantError::KeyTooLong(bytes.len()))?;
    buf.push(len);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_name(buf: &[u8]) -> Result<(String, &[u8]), VariantError> {
    let len = *buf.first().ok_or(VariantError::Truncated("method name length"))? as usize;
    let rest = buf.get(1..).ok_or(VariantError::Truncated("method name"))?;
    let name_bytes = rest.get(..len).ok_or(VariantError::Truncated("method name"))?;
    let name = String::from_utf8_lossy(name_bytes).into_owned();
    Ok((name, &rest[len..]))
}

/// Build the body of a `CALL_PROC`/`CALL_FUNC` frame: object id, u8-length
/// method name, then packed args.
///
/// # Errors
/// Propagates any [`VariantError`] from packing `args` or encoding `name`.
pub fn encode_call_body(
    object_id: u32,
    name: &str,
    args: &Variant,
    replacer: Option<&mut dyn ObjectReplacer>,
) -> Result<Vec<u8>, VariantError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&object_id.to_le_bytes());
    write_name(&mut buf, name)?;
    buf.extend_from_slice(&variant::pack(args, replacer)?);
    Ok(buf)
}

/// The decoded body of a `CALL_PROC`/`CALL_FUNC` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CallBody {
    /// Target object id.
    pub object_id: u32,
    /// Method name.
    pub name: String,
    /// Packed method arguments.
    pub args: Variant,
}

/// Decode the body of a `CALL_PROC`/`CALL_FUNC` frame.
///
/// # Errors
/// Propagates any [`VariantError`] from decoding the header or unpacking the
/// trailing `Variant`.
pub fn decode_call_body(body: &[u8], replacer: Option<&mut dyn IdReplacer>) -> Result<CallBody, VariantError> {
    let object_id_bytes = body.get(..4).ok_or(VariantError::Truncated("object id"))?;
    #[expect(clippy::unwrap_used, reason = "length checked by the slice bound above")]
    let object_id = u32::from_le_bytes(object_id_bytes.try_into().unwrap());
    let (name, rest) = read_name(body.get(4..).ok_or(VariantError::Truncated("method name"))?)?;
    let (args, _) = variant::unpack(rest, replacer)?;
    Ok(CallBody { object_id, name, args })
}

/// Build the body of a `RETURN` frame: just the packed result (or exception)
/// value.
///
/// # Errors
/// Propagates any [`VariantError`] from packing `value`.
pub fn encode_return_body(value: &Variant, replacer: Option<&mut dyn ObjectReplacer>) -> Result<Vec<u8>, VariantError> {
    variant::pack(value, replacer)
}

/// Decode the body of a `RETURN` frame.
///
/// # Errors
/// Propagates any [`VariantError`] from unpacking the value.
pub fn decode_return_body(body: &[u8], replacer: Option<&mut dyn IdReplacer>) -> Result<Variant, VariantError> {
    let (value, _) = variant::unpack(body, replacer)?;
    Ok(value)
}

/// Build the body of a `DELOBJ` frame: just the target object id.
#[must_use]
pub fn encode_delobj_body(object_id: u32) -> Vec<u8> { object_id.to_le_bytes().to_vec() }

/// Decode the body of a `DELOBJ` frame.
///
/// # Errors
/// Returns [`FrameError::UnknownMessageType`] if the body is too short (using
/// the message type as the reported offender, matching the error's shape).
pub fn decode_delobj_body(body: &[u8]) -> Result<u32, VariantError> {
    let bytes = body.get(..4).ok_or(VariantError::Truncated("delobj object id"))?;
    #[expect(clippy::unwrap_used, reason = "length checked by the slice bound above")]
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn frame_round_trips_over_an_async_stream() {
        let (mut a, mut b) = duplex(1024);
        let frame = RawFrame { msg_type: MSG_CALL_FUNC, request_id: 7, body: vec![1, 2, 3] };
        write_frame(&mut a, &frame).await.expect("write");
        let got = read_frame(&mut b, 1024).await.expect("read");
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn oversized_declared_length_is_rejected_before_reading_body() {
        let (mut a, mut b) = duplex(1024);
        let frame = RawFrame { msg_type: MSG_CALL_PROC, request_id: 1, body: vec![0; 64] };
        write_frame(&mut a, &frame).await.expect("write");
        let err = read_frame(&mut b, 16).await.expect_err("must reject oversized frame");
        assert!(matches!(err, FrameError::TooLarge(_, 16)));
    }

    #[rstest]
    #[case(MSG_CALL_PROC)]
    #[case(MSG_CALL_FUNC)]
    fn call_body_round_trips(#[case] _msg_type: u8) {
        let body = encode_call_body(42, "echo", &Variant::string("hi"), None).expect("encode");
        let decoded = decode_call_body(&body, None).expect("decode");
        assert_eq!(decoded.object_id, 42);
        assert_eq!(decoded.name, "echo");
        assert_eq!(decoded.args, Variant::string("hi"));
    }

    #[test]
    fn return_body_round_trips() {
        let body = encode_return_body(&Variant::exception("boom"), None).expect("encode");
        let decoded = decode_return_body(&body, None).expect("decode");
        assert_eq!(decoded, Variant::exception("boom"));
    }

    #[test]
    fn delobj_body_round_trips() {
        let body = encode_delobj_body(99);
        assert_eq!(decode_delobj_body(&body).expect("decode"), 99);
    }
}

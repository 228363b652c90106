//! Typed error enums for every fallible subsystem of the transport.

use thiserror::Error;
use tokio::io;

/// Errors that can occur while packing or unpacking a [`crate::variant::Variant`].
#[derive(Debug, Error)]
pub enum VariantError {
    /// The tag byte did not correspond to a known [`crate::variant::Variant`] variant.
    #[error("unknown variant tag {0}")]
    UnknownTag(u8),
    /// A tag that may never appear on the wire was encountered during unpack.
    #[error("variant tag {0:?} is not legal on the wire")]
    IllegalOnWire(&'static str),
    /// The buffer ended before a length-prefixed field could be read in full.
    #[error("buffer truncated while reading {0}")]
    Truncated(&'static str),
    /// A map key exceeded the 255-byte wire limit.
    #[error("map key too long: {0} bytes")]
    KeyTooLong(usize),
    /// A string, array, or map length prefix exceeded the configured limit.
    #[error("length {0} exceeds maximum {1}")]
    LengthExceeded(u32, u32),
    /// An `Object` payload was packed without a replacer installed.
    #[error("cannot pack an Object without a registered replacer")]
    NoReplacer,
    /// I/O error while reading or writing the underlying buffer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by [`crate::object::ObjectTable`] operations.
#[derive(Debug, Error)]
pub enum ObjectError {
    /// No local object is registered under the given id.
    #[error("unknown object id {0}")]
    UnknownObject(u32),
    /// The local object has no method with the given name.
    #[error("unknown method {0:?} on object {1}")]
    UnknownMethod(String, u32),
    /// A registration attempted to reuse id 0, which is reserved for the global object.
    #[error("object id 0 is reserved for the global object")]
    ReservedId,
}

/// Errors from frame-level encode/decode.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame's declared length exceeds the configured maximum.
    #[error("frame length {0} exceeds maximum {1}")]
    TooLarge(u32, u32),
    /// The message type byte did not correspond to a known message type.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    /// Failed to pack or unpack the frame body.
    #[error(transparent)]
    Variant(#[from] VariantError),
    /// I/O error while reading or writing the frame.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the handshake dialogue.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer's protocol magic did not match.
    #[error("protocol magic mismatch: expected {expected:?}, got {got:?}")]
    BadMagic {
        /// The magic this endpoint expects.
        expected: [u8; 4],
        /// The magic actually received.
        got: [u8; 4],
    },
    /// The handshake did not complete within the configured timeout.
    #[error("handshake timed out")]
    Timeout,
    /// I/O error while reading or writing handshake bytes.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Top-level error surfaced through a [`crate::future::Future`]'s error path
/// when the transport itself fails, as distinct from an application-level
/// `Exception` [`crate::variant::Variant`] carried by a successful RPC.
#[derive(Debug, Error, Clone)]
pub enum EndpointError {
    /// The connection was closed, locally or by the peer.
    #[error("connection closed: {0}")]
    Closed(String),
    /// The peer violated the framing protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The suspended-session expiry timer fired before the client reconnected.
    #[error("session expired")]
    SessionExpired,
}

impl From<FrameError> for EndpointError {
    fn from(err: FrameError) -> Self { Self::Protocol(err.to_string()) }
}

impl From<HandshakeError> for EndpointError {
    fn from(err: HandshakeError) -> Self { Self::Protocol(err.to_string()) }
}

impl From<io::Error> for EndpointError {
    fn from(err: io::Error) -> Self { Self::Closed(err.to_string()) }
}

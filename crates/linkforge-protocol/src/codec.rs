//! Codec trait and implementations for serializing/deserializing messages.
//!
//! A "codec" (coder/decoder) converts between Rust types and raw bytes.
//! It is used twice: once by the session layer to turn [`Frame`]s into
//! transport writes, and once by applications to turn their own payloads
//! and RPC parameters into the opaque byte vectors a frame carries.
//!
//! [`Codec`] has generic methods, so it cannot be used as a trait object.
//! The session core only ever needs frames, so it takes a
//! `&dyn FrameCodec` instead; every `Codec` is a `FrameCodec` for free.

use serde::{Serialize, de::DeserializeOwned};

use crate::{Frame, ProtocolError};

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// `DeserializeOwned` (vs plain `Deserialize`) means the result doesn't
/// borrow from the input bytes, so the receive buffer can be dropped
/// right after decoding.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

/// Object-safe view of a [`Codec`] restricted to [`Frame`]s.
pub trait FrameCodec: Send + Sync {
    fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, ProtocolError>;
    fn decode_frame(&self, data: &[u8]) -> Result<Frame, ProtocolError>;
}

impl<C: Codec> FrameCodec for C {
    fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
        self.encode(frame)
    }

    fn decode_frame(&self, data: &[u8]) -> Result<Frame, ProtocolError> {
        self.decode(data)
    }
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// Easy to read in logs and packet captures; larger than a binary format.
/// Behind the `json` feature flag (enabled by default).
///
/// ## Example
///
/// ```rust
/// use linkforge_protocol::{Codec, Frame, JsonCodec, MessageBody};
///
/// let codec = JsonCodec;
/// let frame = Frame::Single {
///     ack: 0,
///     sequence: 1,
///     body: MessageBody::OneWay { payload: vec![1, 2, 3] },
/// };
///
/// let bytes = codec.encode(&frame).unwrap();
/// let decoded: Frame = codec.decode(&bytes).unwrap();
/// assert_eq!(frame, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

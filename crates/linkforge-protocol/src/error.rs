//! Error types for the protocol layer.
//!
//! A `ProtocolError` always means "these bytes and this type don't agree".
//! Inside the session loop such errors are logged and treated as channel
//! desynchronization; they never reach application code.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, missing fields, wrong
    /// types, or a truncated frame.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message decoded but violates protocol rules.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

//! Error types for the session layer.
//!
//! Only operations the application calls directly return these. Handshake
//! rejections, desynchronization and RPC failures are handled inside the
//! state machines and surface as lifecycle callbacks or RPC result codes.

use linkforge_protocol::PeerId;

/// Errors returned by session manager operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session exists with the given remote peer.
    #[error("no session with {0}")]
    NotFound(PeerId),

    /// A session with the remote peer already exists under this identity.
    #[error("session with {0} already exists")]
    AlreadyExists(PeerId),

    /// The send would exceed the cache ceiling; the session was removed.
    #[error("session with {0} removed: cache overflow")]
    CacheOverflow(PeerId),

    /// Two handlers were registered for the same RPC method key.
    #[error("rpc method {0} is already registered")]
    DuplicateMethod(i32),

    /// The token key or a token record is unusable.
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Errors from encoding or decoding a token record.
///
/// On the wire every one of these is reported as `TOKEN_INVALID`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// XOR with an empty key would be the identity; refuse it.
    #[error("token key must not be empty")]
    EmptyKey,

    /// The decrypted record does not have the fixed token length.
    #[error("token record must be {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },

    /// A role field holds a code no role maps to.
    #[error("unknown role code {0}")]
    UnknownRole(i32),
}

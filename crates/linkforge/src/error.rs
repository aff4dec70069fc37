//! Unified error type for Linkforge.

use linkforge_protocol::{PeerId, ProtocolError};
use linkforge_session::SessionError;
use linkforge_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `linkforge` meta-crate, you deal with this single
/// error type instead of importing errors from each sub-crate.
/// The `#[from]` attribute on each variant auto-generates `From` impls,
/// so the `?` operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum LinkforgeError {
    /// A transport-level error (bind, connect, hub gone).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encoding an application payload).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (unknown session, overflow, bad token key).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The node has no local identity with this id.
    #[error("no local identity {0}")]
    UnknownIdentity(PeerId),

    /// The same local identity was configured twice.
    #[error("local identity {0} configured twice")]
    DuplicateIdentity(PeerId),

    /// The session loop has stopped (shut down, or every handle dropped).
    #[error("session loop is not running")]
    LoopClosed,
}

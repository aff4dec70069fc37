//! Session layer for Linkforge.
//!
//! This crate turns a lossy, reconnecting transport into reliable,
//! ordered sessions between two identities:
//!
//! 1. **Reliable queue**: sequence numbers, piggybacked acks, resend after
//!    reconnect ([`MessageQueue`])
//! 2. **Tokens**: generation-numbered handshake credentials with a
//!    forbidden window for superseded generations ([`TokenAuthority`])
//! 3. **State machines**: the initiating side ([`ConnectorManager`]) and the
//!    accepting side ([`AcceptorManager`])
//! 4. **Lifecycle**: timeouts, overflow, idempotent removal, listener
//!    callbacks ([`SessionListener`])
//! 5. **RPC**: handlers by method key, promises with deadlines
//!    ([`RpcRegistry`], [`RpcDispatcher`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Session loop (linkforge)  ← owns the managers, feeds them events and ticks
//!     ↕
//! Session Layer (this crate)  ← sans-IO state machines, no tasks, no locks
//!     ↕
//! Protocol + Transport (below)  ← Frame types, codec, channel ids, FrameSink
//! ```
//!
//! Nothing here spawns tasks or reads the clock on its own. Every operation
//! takes the current [`Instant`](std::time::Instant) and a [`SessionIo`]
//! bundle, so the whole layer runs on one loop and tests drive it
//! deterministically.

mod acceptor;
mod config;
mod error;
mod initiator;
mod lifecycle;
mod queue;
mod rpc;
mod token;

#[cfg(test)]
mod testing;

pub use acceptor::{AcceptorManager, AcceptorState};
pub use config::{CacheLimits, SessionConfig, DEFAULT_TOKEN_KEY};
pub use error::{SessionError, TokenError};
pub use initiator::{ConnectorManager, InitiatorState};
pub use lifecycle::{
    CloseReason, RemoveOutcome, SessionInfo, SessionIo, SessionKey, SessionListener,
    SessionStatus, Side,
};
pub use queue::{Drained, MessageQueue, SentMessage};
pub use rpc::{
    OutboundCall, PendingRpc, PostedReply, Responder, RpcCall, RpcCompletion, RpcDispatcher,
    RpcHandler, RpcOutcome, RpcRegistry,
};
pub use token::{Token, TokenAuthority, TokenCipher, TokenClock, TOKEN_LEN};

//! Wire protocol for Linkforge.
//!
//! This crate defines what two session endpoints put on a channel:
//!
//! - **Frames** ([`Frame`]): handshake requests/responses and sequenced
//!   data frames (single, batch, heartbeat).
//! - **Bodies** ([`MessageBody`], [`RpcRequest`], [`RpcResponse`]): the
//!   sequenced units inside data frames.
//! - **Codec** ([`Codec`] trait, [`FrameCodec`], [`JsonCodec`]): how
//!   those values become bytes.
//!
//! ```text
//! Transport (bytes) → Protocol (Frame) → Session (queue, state machine)
//! ```
//!
//! The protocol layer knows nothing about channels, tokens or timers.

mod codec;
mod error;
mod types;

pub use codec::{Codec, FrameCodec};
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{
    DataFrame, Frame, HeartbeatKind, MessageBody, PeerId, RejectReason, Role,
    RpcRequest, RpcResponse, RpcResultCode,
};

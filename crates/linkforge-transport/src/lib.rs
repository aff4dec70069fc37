//! Transport interface for Linkforge.
//!
//! The session core never touches sockets. It talks to the transport
//! through two narrow seams:
//!
//! - [`FrameSink`]: "write these bytes on channel X", "close channel X",
//!   "open a channel to this address". All fire-and-forget.
//! - [`TransportEvent`]: "channel X produced frame Y", "channel X closed",
//!   tagged with the [`ChannelId`] the event came from so the session layer
//!   can check that it originates from the channel it currently trusts.
//!
//! # Feature Flags
//!
//! - `websocket` (default): [`WebSocketHub`], a `FrameSink` backed by
//!   `tokio-tungstenite` connections.

mod error;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::WebSocketHub;

use std::fmt;

/// Opaque identifier for one transport channel (one physical connection).
///
/// A session outlives its channels: every reconnect produces a new
/// `ChannelId`, and events from the old one must be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Creates a new `ChannelId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Opaque identifier for a listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Creates a new `ListenerId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lst-{}", self.0)
    }
}

/// The write side of the transport, as seen by the session layer.
///
/// Every method returns immediately. The transport owns its own
/// buffering; results of asynchronous work (a channel finishing its
/// connect, a peer closing) come back as [`TransportEvent`]s.
pub trait FrameSink: Send {
    /// Queues one frame for delivery on `channel`.
    ///
    /// Writing to an unknown or already closed channel is a silent no-op.
    fn write_frame(&mut self, channel: ChannelId, frame: Vec<u8>);

    /// Closes `channel` once every frame already queued on it is written.
    fn close_quietly(&mut self, channel: ChannelId);

    /// Starts opening a channel to `address`.
    ///
    /// The returned id is reported back later as either
    /// [`TransportEvent::Opened`] or [`TransportEvent::OpenFailed`].
    fn open_channel(&mut self, address: &str) -> ChannelId;

    /// Stops accepting new channels on `listener`.
    fn release_listener(&mut self, listener: ListenerId);
}

/// Something that happened on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A listener accepted a new inbound channel.
    Accepted {
        listener: ListenerId,
        channel: ChannelId,
    },

    /// A channel requested through [`FrameSink::open_channel`] is ready.
    Opened(ChannelId),

    /// A channel requested through [`FrameSink::open_channel`] failed.
    OpenFailed { channel: ChannelId, reason: String },

    /// One complete frame arrived on a channel.
    Frame { channel: ChannelId, data: Vec<u8> },

    /// The channel is gone (closed by either side or broken).
    Closed(ChannelId),
}

impl TransportEvent {
    /// The channel this event originates from.
    pub fn channel(&self) -> ChannelId {
        match self {
            Self::Accepted { channel, .. }
            | Self::OpenFailed { channel, .. }
            | Self::Frame { channel, .. } => *channel,
            Self::Opened(channel) | Self::Closed(channel) => *channel,
        }
    }
}

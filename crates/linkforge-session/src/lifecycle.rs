//! Pieces shared by both session managers: session identity and status,
//! the application listener, inbound delivery, and teardown.
//!
//! # Teardown order
//!
//! Removing a session is all-or-nothing and always runs the same steps:
//!
//! 1. status becomes `Closed` (the session is already out of its manager's
//!    map, so nothing can reach it again);
//! 2. the current channel is closed;
//! 3. the queue is drained: uncommitted inbound messages are discarded and
//!    every outstanding RPC promise completes with `SESSION_CLOSED`, in
//!    request-id order;
//! 4. `on_disconnected` fires, but only if `on_connected` fired before.

use std::fmt;
use std::time::{Duration, Instant};

use linkforge_protocol::{
    Frame, FrameCodec, MessageBody, PeerId, RejectReason, Role, RpcRequest, RpcResultCode,
};
use linkforge_transport::{ChannelId, FrameSink};

use crate::queue::MessageQueue;
use crate::rpc::{OutboundCall, PendingRpc, RpcCompletion, RpcDispatcher, RpcOutcome};

// ---------------------------------------------------------------------------
// Identity and status
// ---------------------------------------------------------------------------

/// (local identity, remote identity): the address of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub local: PeerId,
    pub remote: PeerId,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}→{}", self.local, self.remote)
    }
}

/// Which end of the handshake this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Initiator,
    Acceptor,
}

/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub local_id: PeerId,
    pub remote_id: PeerId,
    pub local_role: Role,
    pub remote_role: Role,
    pub side: Side,
    pub status: SessionStatus,
}

impl SessionInfo {
    pub fn key(&self) -> SessionKey {
        SessionKey {
            local: self.local_id,
            remote: self.remote_id,
        }
    }
}

/// Why a session was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// No accepted traffic within the session timeout.
    TimedOut,
    /// `sent + unsent` hit the cache ceiling.
    CacheOverflow,
    /// Too many consecutive failed connect attempts.
    ConnectFailed,
    /// The acceptor refused our connect request.
    Rejected(RejectReason),
    /// The acceptor's ack during verification doesn't match what we sent.
    AckMismatch,
    /// The same client logged in again with a fresh login token.
    ReplacedByLogin,
    /// The application asked for it.
    Requested(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => f.write_str("timed out"),
            Self::CacheOverflow => f.write_str("cache overflow"),
            Self::ConnectFailed => f.write_str("connect failed"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::AckMismatch => f.write_str("ack mismatch"),
            Self::ReplacedByLogin => f.write_str("replaced by new login"),
            Self::Requested(reason) => f.write_str(reason),
        }
    }
}

/// Result of removing a session. Removal is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    AlreadyAbsent,
    Removed,
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Application callbacks. Called on the session loop.
pub trait SessionListener {
    /// The session passed its first handshake.
    fn on_connected(&mut self, info: &SessionInfo);

    /// The session is gone. Only called after `on_connected`.
    fn on_disconnected(&mut self, info: &SessionInfo, reason: &CloseReason);

    /// A one-way payload, in the peer's send order.
    fn on_message(&mut self, session: SessionKey, payload: Vec<u8>);
}

/// Everything a manager operation may touch outside its own sessions.
pub struct SessionIo<'a> {
    pub sink: &'a mut dyn FrameSink,
    pub codec: &'a dyn FrameCodec,
    pub listener: &'a mut dyn SessionListener,
    pub rpc: &'a RpcDispatcher,
}

impl SessionIo<'_> {
    /// Encodes and writes one frame. Encoding failures are logged and the
    /// frame is dropped.
    pub(crate) fn write(&mut self, channel: ChannelId, frame: &Frame) {
        match self.codec.encode_frame(frame) {
            Ok(bytes) => self.sink.write_frame(channel, bytes),
            Err(e) => {
                tracing::warn!(%channel, kind = frame.kind(), error = %e, "frame encode failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SessionCore
// ---------------------------------------------------------------------------

/// What a heartbeat body asks of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Heartbeat {
    Ping,
    Pong,
}

/// State common to initiator and acceptor sessions.
#[derive(Debug)]
pub(crate) struct SessionCore {
    pub info: SessionInfo,
    pub queue: MessageQueue,
    pub connected_fired: bool,
    pub expires_at: Instant,
    session_timeout: Duration,
}

impl SessionCore {
    pub fn new(info: SessionInfo, queue: MessageQueue, session_timeout: Duration, now: Instant) -> Self {
        Self {
            info,
            queue,
            connected_fired: false,
            expires_at: now + session_timeout,
            session_timeout,
        }
    }

    pub fn key(&self) -> SessionKey {
        self.info.key()
    }

    /// Pushes the session timeout out to `now + session_timeout`.
    pub fn touch(&mut self, now: Instant) {
        self.expires_at = now + self.session_timeout;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Fires `on_connected` the first time only. Returns whether it fired.
    pub fn mark_connected(&mut self, io: &mut SessionIo<'_>) -> bool {
        if self.connected_fired {
            return false;
        }
        self.connected_fired = true;
        tracing::info!(session = %self.key(), side = ?self.info.side, "session connected");
        io.listener.on_connected(&self.info);
        true
    }

    /// Registers the promise for `call` and returns the request body.
    pub fn prepare_call(
        &mut self,
        call: OutboundCall,
        completion: RpcCompletion,
        default_timeout: Duration,
        now: Instant,
    ) -> MessageBody {
        let request_id = self.queue.next_request_id();
        self.queue.register_rpc(
            request_id,
            PendingRpc {
                deadline: now + call.timeout.unwrap_or(default_timeout),
                sync: call.sync,
                completion,
            },
        );
        MessageBody::Request(RpcRequest {
            request_id,
            sync: call.sync,
            method_key: call.method_key,
            params: call.params,
        })
    }

    /// Routes one accepted inbound body.
    ///
    /// Heartbeats are returned to the caller. Everything else joins the
    /// uncommitted buffer; sync requests and responses to sync calls
    /// commit the buffer at once, so earlier messages still go first.
    pub fn deliver(&mut self, body: MessageBody, io: &mut SessionIo<'_>) -> Option<Heartbeat> {
        let urgent = match &body {
            MessageBody::Ping => return Some(Heartbeat::Ping),
            MessageBody::Pong => return Some(Heartbeat::Pong),
            MessageBody::Request(req) => req.sync,
            MessageBody::Response(resp) => self.queue.is_sync_rpc(resp.request_id),
            MessageBody::OneWay { .. } => false,
        };
        self.queue.push_uncommitted(body);
        if urgent {
            self.commit(io);
        }
        None
    }

    /// Hands every uncommitted message to the application, in order.
    pub fn commit(&mut self, io: &mut SessionIo<'_>) {
        let key = self.key();
        for body in self.queue.take_uncommitted() {
            match body {
                MessageBody::OneWay { payload } => io.listener.on_message(key, payload),
                MessageBody::Request(request) => io.rpc.dispatch(key, self.info.side, request),
                MessageBody::Response(response) => match self.queue.take_rpc(response.request_id) {
                    Some(pending) => pending.completion.complete(RpcOutcome::from(response)),
                    None => {
                        tracing::debug!(
                            session = %key,
                            request_id = response.request_id,
                            "late rpc response discarded"
                        );
                    }
                },
                MessageBody::Ping | MessageBody::Pong => {}
            }
        }
    }

    /// Completes every promise past its deadline with `TIMEOUT`.
    pub fn expire_rpcs(&mut self, now: Instant) {
        for (request_id, pending) in self.queue.expire_rpcs(now) {
            tracing::debug!(session = %self.key(), request_id, "rpc timed out");
            pending.completion.complete(RpcOutcome::failed(RpcResultCode::Timeout));
        }
    }

    /// The shared removal routine; see the module docs for the order.
    pub fn teardown(&mut self, channel: Option<ChannelId>, reason: &CloseReason, io: &mut SessionIo<'_>) {
        self.info.status = SessionStatus::Closed;
        if let Some(channel) = channel {
            io.sink.close_quietly(channel);
        }
        let drained = self.queue.drain();
        for (_, pending) in drained.promises {
            pending.completion.complete(RpcOutcome::failed(RpcResultCode::SessionClosed));
        }
        tracing::info!(
            session = %self.key(),
            %reason,
            discarded = drained.uncommitted.len(),
            unacked = drained.sent,
            unsent = drained.unsent,
            "session removed"
        );
        if self.connected_fired {
            io.listener.on_disconnected(&self.info, reason);
        }
    }
}

//! The initiating side: sessions this node opened to a remote acceptor.
//!
//! ```text
//!              open ok               response ok
//!  Connecting ─────────→ Verifying ─────────────→ Verified
//!      ↑  │ open failed /    │ timeout / closed /     │ ack timeout / bad seq /
//!      │  │ timeout          │ unexpected frame       │ channel closed
//!      │  ↓                  ↓                        │
//!      └──┴──────────────────┴────────────────────────┘
//!
//!  failed response, ack mismatch, too many failures, session timeout
//!      → session removed
//! ```
//!
//! Every state carries the channel it trusts. Events from any other channel
//! are ignored, and a state change replaces the whole variant.

use std::collections::HashMap;
use std::time::Instant;

use linkforge_protocol::{
    DataFrame, Frame, MessageBody, PeerId, RejectReason, Role, RpcResponse, RpcResultCode,
};
use linkforge_transport::ChannelId;

use crate::lifecycle::{Heartbeat, SessionCore, SessionIo};
use crate::queue::MessageQueue;
use crate::rpc::{OutboundCall, RpcCompletion, RpcOutcome};
use crate::{
    CloseReason, RemoveOutcome, SessionConfig, SessionError, SessionInfo, SessionStatus, Side,
};

/// Where an initiated session is in its connect/verify cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    /// Waiting for a transport channel. `channel` is `None` between a
    /// failed attempt and the next tick.
    Connecting {
        channel: Option<ChannelId>,
        deadline: Instant,
    },
    /// `ConnectRequest` sent on `channel`, waiting for the response.
    Verifying { channel: ChannelId, deadline: Instant },
    /// Steady state.
    Verified { channel: ChannelId },
}

impl InitiatorState {
    pub fn channel(&self) -> Option<ChannelId> {
        match *self {
            Self::Connecting { channel, .. } => channel,
            Self::Verifying { channel, .. } | Self::Verified { channel } => Some(channel),
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }

    fn is_opening(&self, channel: ChannelId) -> bool {
        matches!(*self, Self::Connecting { channel: Some(c), .. } if c == channel)
    }
}

/// What the manager must do after a session handled an event.
#[derive(Debug)]
enum Next {
    Stay,
    Reconnect(&'static str),
    Remove(CloseReason),
}

#[derive(Debug)]
struct InitiatorSession {
    core: SessionCore,
    state: InitiatorState,
    address: String,
    /// The encrypted token presented on the next `ConnectRequest`.
    token: Vec<u8>,
    attempt_counter: i32,
    failures: u32,
    ping_pending: bool,
}

impl InitiatorSession {
    fn remote(&self) -> PeerId {
        self.core.info.remote_id
    }

    fn begin_connect(
        &mut self,
        channels: &mut HashMap<ChannelId, PeerId>,
        config: &SessionConfig,
        now: Instant,
        io: &mut SessionIo<'_>,
    ) {
        let channel = io.sink.open_channel(&self.address);
        channels.insert(channel, self.remote());
        tracing::debug!(session = %self.core.key(), %channel, address = %self.address, "opening channel");
        self.state = InitiatorState::Connecting {
            channel: Some(channel),
            deadline: now + config.connect_timeout(),
        };
    }

    fn drop_channel(&mut self, channels: &mut HashMap<ChannelId, PeerId>, io: &mut SessionIo<'_>) {
        if let Some(channel) = self.state.channel() {
            channels.remove(&channel);
            io.sink.close_quietly(channel);
        }
    }

    /// Abandons the current channel and opens a fresh one right away.
    fn force_reconnect(
        &mut self,
        channels: &mut HashMap<ChannelId, PeerId>,
        config: &SessionConfig,
        now: Instant,
        io: &mut SessionIo<'_>,
        why: &str,
    ) {
        tracing::info!(session = %self.core.key(), why, "reconnecting");
        self.drop_channel(channels, io);
        self.ping_pending = false;
        self.begin_connect(channels, config, now, io);
    }

    /// Counts a failed attempt. The next tick retries unless the retry limit is
    /// reached.
    fn attempt_failed(
        &mut self,
        channels: &mut HashMap<ChannelId, PeerId>,
        config: &SessionConfig,
        now: Instant,
        io: &mut SessionIo<'_>,
        why: &str,
    ) -> Next {
        self.drop_channel(channels, io);
        self.failures += 1;
        tracing::debug!(session = %self.core.key(), why, failures = self.failures, "connect attempt failed");
        if self.failures > config.connect_max_retries {
            return Next::Remove(CloseReason::ConnectFailed);
        }
        self.state = InitiatorState::Connecting {
            channel: None,
            deadline: now,
        };
        Next::Stay
    }

    fn send_connect_request(
        &mut self,
        channel: ChannelId,
        local_id: PeerId,
        config: &SessionConfig,
        now: Instant,
        io: &mut SessionIo<'_>,
    ) {
        self.attempt_counter += 1;
        let frame = Frame::ConnectRequest {
            sender_id: local_id,
            attempt_counter: self.attempt_counter,
            ack: self.core.queue.ack(),
            encrypted_token: self.token.clone(),
        };
        io.write(channel, &frame);
        self.state = InitiatorState::Verifying {
            channel,
            deadline: now + config.wait_token_result_timeout(),
        };
    }

    fn on_verifying_frame(
        &mut self,
        channel: ChannelId,
        frame: Frame,
        now: Instant,
        io: &mut SessionIo<'_>,
    ) -> Next {
        let Frame::ConnectResponse {
            attempt_counter,
            success,
            ack,
            encrypted_token,
            reject,
        } = frame
        else {
            return Next::Reconnect("unexpected frame while verifying");
        };
        if attempt_counter != self.attempt_counter {
            tracing::debug!(session = %self.core.key(), attempt_counter, "stale connect response ignored");
            return Next::Stay;
        }
        if !success {
            return Next::Remove(CloseReason::Rejected(reject.unwrap_or(RejectReason::TokenInvalid)));
        }
        let Some(token) = encrypted_token else {
            return Next::Reconnect("connect response without token");
        };
        if !self.core.queue.is_ack_valid(ack) {
            tracing::warn!(
                session = %self.core.key(),
                ack,
                last_acked = self.core.queue.last_acked(),
                next_sequence = self.core.queue.next_sequence(),
                "acceptor ack outside sent range"
            );
            return Next::Remove(CloseReason::AckMismatch);
        }

        self.token = token;
        self.core.queue.on_peer_ack(ack);
        self.failures = 0;
        self.ping_pending = false;
        self.state = InitiatorState::Verified { channel };
        self.core.touch(now);
        if !self.core.mark_connected(io) {
            tracing::info!(session = %self.core.key(), ack, "session re-verified");
        }
        if let Some(frame) = self.core.queue.resend(now) {
            io.write(channel, &frame);
        }
        if let Some(frame) = self.core.queue.flush_all(now) {
            io.write(channel, &frame);
        }
        Next::Stay
    }

    fn on_verified_frame(&mut self, frame: Frame, now: Instant, io: &mut SessionIo<'_>) -> Next {
        match frame.into_data() {
            Ok(data) => self.on_data(data, now, io),
            Err(Frame::ConnectResponse {
                attempt_counter,
                success,
                encrypted_token,
                reject,
                ..
            }) => {
                if attempt_counter != self.attempt_counter {
                    return Next::Stay;
                }
                if !success {
                    return Next::Remove(CloseReason::Rejected(
                        reject.unwrap_or(RejectReason::TokenInvalid),
                    ));
                }
                if let Some(token) = encrypted_token {
                    tracing::debug!(session = %self.core.key(), "token replaced by acceptor");
                    self.token = token;
                }
                Next::Stay
            }
            Err(_) => Next::Reconnect("unexpected handshake frame"),
        }
    }

    fn on_data(&mut self, data: DataFrame, now: Instant, io: &mut SessionIo<'_>) -> Next {
        if !self.core.queue.is_ack_valid(data.ack) {
            return Next::Reconnect("invalid ack");
        }
        self.core.queue.on_peer_ack(data.ack);
        for (offset, body) in data.bodies.into_iter().enumerate() {
            let accepted = data
                .first_sequence
                .checked_add(offset as u64)
                .is_some_and(|sequence| self.core.queue.accept(sequence));
            if !accepted {
                return Next::Reconnect("sequence out of order");
            }
            self.core.touch(now);
            if self.core.deliver(body, io) == Some(Heartbeat::Pong) {
                self.ping_pending = false;
            }
        }
        Next::Stay
    }

    fn tick(
        &mut self,
        channels: &mut HashMap<ChannelId, PeerId>,
        config: &SessionConfig,
        now: Instant,
        io: &mut SessionIo<'_>,
    ) -> Next {
        if self.core.is_expired(now) {
            return Next::Remove(CloseReason::TimedOut);
        }
        let next = match self.state {
            InitiatorState::Connecting { channel: None, .. } => {
                self.begin_connect(channels, config, now, io);
                Next::Stay
            }
            InitiatorState::Connecting { deadline, .. } if now >= deadline => {
                self.attempt_failed(channels, config, now, io, "connect timeout")
            }
            InitiatorState::Verifying { deadline, .. } if now >= deadline => {
                self.attempt_failed(channels, config, now, io, "no connect response")
            }
            InitiatorState::Verified { channel } => self.tick_verified(channel, now, io),
            _ => Next::Stay,
        };
        self.core.expire_rpcs(now);
        self.core.commit(io);
        next
    }

    fn tick_verified(&mut self, channel: ChannelId, now: Instant, io: &mut SessionIo<'_>) -> Next {
        let queue = &self.core.queue;
        if queue.oldest_ack_deadline().is_some_and(|d| now >= d) {
            return Next::Reconnect("ack timeout");
        }

        let half_ack = queue.ack_timeout() / 2;
        let idle = self.core.session_timeout() / 3;
        let newest_waiting = queue.newest_sent_at().is_some_and(|t| now >= t + half_ack);
        let quiet = queue.last_flush_at().is_none_or(|t| now >= t + idle);
        if !self.ping_pending && queue.unsent_len() == 0 && (newest_waiting || quiet) {
            self.core.queue.enqueue(MessageBody::Ping);
            self.ping_pending = true;
        }
        if let Some(frame) = self.core.queue.flush_all(now) {
            io.write(channel, &frame);
        }
        Next::Stay
    }
}

/// Owns every session one local identity initiated.
#[derive(Debug)]
pub struct ConnectorManager {
    local_id: PeerId,
    local_role: Role,
    config: SessionConfig,
    sessions: HashMap<PeerId, InitiatorSession>,
    /// Current channel of every session, for routing transport events.
    channels: HashMap<ChannelId, PeerId>,
}

impl ConnectorManager {
    pub fn new(local_id: PeerId, local_role: Role, config: SessionConfig) -> Self {
        Self {
            local_id,
            local_role,
            config: config.validated(),
            sessions: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, remote: PeerId) -> bool {
        self.sessions.contains_key(&remote)
    }

    pub fn owns_channel(&self, channel: ChannelId) -> bool {
        self.channels.contains_key(&channel)
    }

    pub fn state(&self, remote: PeerId) -> Option<InitiatorState> {
        self.sessions.get(&remote).map(|s| s.state)
    }

    pub fn info(&self, remote: PeerId) -> Option<&SessionInfo> {
        self.sessions.get(&remote).map(|s| &s.core.info)
    }

    /// Every live session, in no particular order.
    pub fn sessions(&self) -> impl Iterator<Item = &SessionInfo> {
        self.sessions.values().map(|s| &s.core.info)
    }

    pub fn queue(&self, remote: PeerId) -> Option<&MessageQueue> {
        self.sessions.get(&remote).map(|s| &s.core.queue)
    }

    /// The encrypted token the next `ConnectRequest` will carry.
    pub fn token(&self, remote: PeerId) -> Option<&[u8]> {
        self.sessions.get(&remote).map(|s| s.token.as_slice())
    }

    // -- application operations ---------------------------------------------

    /// Starts a session with `remote_id` at `address`, presenting
    /// `login_token` (already encrypted) on the first handshake.
    ///
    /// # Errors
    /// [`SessionError::AlreadyExists`] if a session with `remote_id` exists.
    pub fn connect(
        &mut self,
        remote_id: PeerId,
        remote_role: Role,
        address: impl Into<String>,
        login_token: Vec<u8>,
        now: Instant,
        io: &mut SessionIo<'_>,
    ) -> Result<(), SessionError> {
        if self.sessions.contains_key(&remote_id) {
            return Err(SessionError::AlreadyExists(remote_id));
        }
        let info = SessionInfo {
            local_id: self.local_id,
            remote_id,
            local_role: self.local_role,
            remote_role,
            side: Side::Initiator,
            status: SessionStatus::Active,
        };
        let queue = MessageQueue::new(self.config.flush_threshold, self.config.ack_timeout());
        let mut session = InitiatorSession {
            core: SessionCore::new(info, queue, self.config.session_timeout(), now),
            state: InitiatorState::Connecting {
                channel: None,
                deadline: now,
            },
            address: address.into(),
            token: login_token,
            attempt_counter: 0,
            failures: 0,
            ping_pending: false,
        };
        session.begin_connect(&mut self.channels, &self.config, now, io);
        self.sessions.insert(remote_id, session);
        Ok(())
    }

    /// Sends a one-way payload. Returns whether it was flushed right away.
    ///
    /// # Errors
    /// [`SessionError::NotFound`], or [`SessionError::CacheOverflow`] after
    /// removing the session.
    pub fn send(
        &mut self,
        remote: PeerId,
        payload: Vec<u8>,
        now: Instant,
        io: &mut SessionIo<'_>,
    ) -> Result<bool, SessionError> {
        self.enqueue_outbound(remote, MessageBody::OneWay { payload }, false, now, io)
    }

    /// Sends an RPC request. `completion` always fires exactly once, with
    /// `SESSION_CLOSED` if the call cannot even be queued.
    ///
    /// # Errors
    /// Same as [`send`](Self::send).
    pub fn call(
        &mut self,
        remote: PeerId,
        call: OutboundCall,
        completion: RpcCompletion,
        now: Instant,
        io: &mut SessionIo<'_>,
    ) -> Result<u64, SessionError> {
        if let Err(e) = self.check_capacity(remote, io) {
            completion.complete(RpcOutcome::failed(RpcResultCode::SessionClosed));
            return Err(e);
        }
        let default_timeout = self.config.rpc_timeout();
        let Some(session) = self.sessions.get_mut(&remote) else {
            completion.complete(RpcOutcome::failed(RpcResultCode::SessionClosed));
            return Err(SessionError::NotFound(remote));
        };
        let sync = call.sync;
        let body = session.core.prepare_call(call, completion, default_timeout, now);
        let request_id = match &body {
            MessageBody::Request(req) => req.request_id,
            _ => 0,
        };
        self.push(remote, body, sync, now, io);
        Ok(request_id)
    }

    /// Queues the answer to an inbound call. Dropped if the session is gone.
    pub fn respond(&mut self, remote: PeerId, response: RpcResponse, now: Instant, io: &mut SessionIo<'_>) {
        if let Err(e) = self.enqueue_outbound(remote, MessageBody::Response(response), false, now, io) {
            tracing::debug!(local = %self.local_id, %remote, error = %e, "rpc response dropped");
        }
    }

    /// Removes one session. Idempotent.
    pub fn remove_session(
        &mut self,
        remote: PeerId,
        reason: CloseReason,
        io: &mut SessionIo<'_>,
    ) -> RemoveOutcome {
        let Some(mut session) = self.sessions.remove(&remote) else {
            return RemoveOutcome::AlreadyAbsent;
        };
        let channel = session.state.channel();
        if let Some(channel) = channel {
            self.channels.remove(&channel);
        }
        session.core.teardown(channel, &reason, io);
        RemoveOutcome::Removed
    }

    /// Removes every session. Returns how many were removed.
    pub fn remove_all(&mut self, reason: CloseReason, io: &mut SessionIo<'_>) -> usize {
        let mut remotes: Vec<PeerId> = self.sessions.keys().copied().collect();
        remotes.sort();
        remotes
            .into_iter()
            .filter(|remote| self.remove_session(*remote, reason.clone(), io) == RemoveOutcome::Removed)
            .count()
    }

    /// Drives timers: connect/verify deadlines, ack deadlines, heartbeats,
    /// flushes, RPC deadlines, inbound commits and the session timeout.
    pub fn tick(&mut self, now: Instant, io: &mut SessionIo<'_>) {
        let mut remotes: Vec<PeerId> = self.sessions.keys().copied().collect();
        remotes.sort();
        for remote in remotes {
            let Some(session) = self.sessions.get_mut(&remote) else {
                continue;
            };
            let next = session.tick(&mut self.channels, &self.config, now, io);
            self.apply(remote, next, now, io);
        }
    }

    // -- transport events ---------------------------------------------------

    pub fn on_opened(&mut self, channel: ChannelId, now: Instant, io: &mut SessionIo<'_>) {
        let session = self
            .channels
            .get(&channel)
            .and_then(|remote| self.sessions.get_mut(remote))
            .filter(|s| s.state.is_opening(channel));
        match session {
            Some(session) => {
                session.send_connect_request(channel, self.local_id, &self.config, now, io);
            }
            None => {
                self.channels.remove(&channel);
                io.sink.close_quietly(channel);
            }
        }
    }

    pub fn on_open_failed(&mut self, channel: ChannelId, reason: &str, now: Instant, io: &mut SessionIo<'_>) {
        let Some(remote) = self.channels.get(&channel).copied() else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&remote) else {
            self.channels.remove(&channel);
            return;
        };
        tracing::debug!(session = %session.core.key(), %channel, reason, "channel open failed");
        let next = session.attempt_failed(&mut self.channels, &self.config, now, io, "open failed");
        self.apply(remote, next, now, io);
    }

    pub fn on_closed(&mut self, channel: ChannelId, now: Instant, io: &mut SessionIo<'_>) {
        let Some(remote) = self.channels.remove(&channel) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&remote) else {
            return;
        };
        let next = match session.state {
            InitiatorState::Verified { channel: c } if c == channel => {
                session.force_reconnect(&mut self.channels, &self.config, now, io, "channel closed");
                Next::Stay
            }
            InitiatorState::Connecting { channel: Some(c), .. }
            | InitiatorState::Verifying { channel: c, .. }
                if c == channel =>
            {
                session.attempt_failed(&mut self.channels, &self.config, now, io, "channel closed")
            }
            _ => Next::Stay,
        };
        self.apply(remote, next, now, io);
    }

    pub fn on_frame(&mut self, channel: ChannelId, data: &[u8], now: Instant, io: &mut SessionIo<'_>) {
        let Some(remote) = self.channels.get(&channel).copied() else {
            tracing::trace!(%channel, "frame from unknown channel ignored");
            return;
        };
        let Some(session) = self.sessions.get_mut(&remote) else {
            return;
        };
        let frame = match io.codec.decode_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session = %session.core.key(), %channel, error = %e, "undecodable frame");
                session.force_reconnect(&mut self.channels, &self.config, now, io, "undecodable frame");
                return;
            }
        };
        let next = match session.state {
            InitiatorState::Verifying { channel: c, .. } if c == channel => {
                session.on_verifying_frame(channel, frame, now, io)
            }
            InitiatorState::Verified { channel: c } if c == channel => {
                session.on_verified_frame(frame, now, io)
            }
            _ => {
                tracing::trace!(session = %session.core.key(), kind = frame.kind(), "frame ignored in current state");
                Next::Stay
            }
        };
        self.apply(remote, next, now, io);
    }

    // -- internals ----------------------------------------------------------

    fn apply(&mut self, remote: PeerId, next: Next, now: Instant, io: &mut SessionIo<'_>) {
        match next {
            Next::Stay => {}
            Next::Reconnect(why) => {
                if let Some(session) = self.sessions.get_mut(&remote) {
                    session.force_reconnect(&mut self.channels, &self.config, now, io, why);
                }
            }
            Next::Remove(reason) => {
                self.remove_session(remote, reason, io);
            }
        }
    }

    fn check_capacity(&mut self, remote: PeerId, io: &mut SessionIo<'_>) -> Result<(), SessionError> {
        let cached = self
            .sessions
            .get(&remote)
            .ok_or(SessionError::NotFound(remote))?
            .core
            .queue
            .cached_len();
        if cached >= self.config.max_cache_messages.initiator {
            self.remove_session(remote, CloseReason::CacheOverflow, io);
            return Err(SessionError::CacheOverflow(remote));
        }
        Ok(())
    }

    fn enqueue_outbound(
        &mut self,
        remote: PeerId,
        body: MessageBody,
        flush_now: bool,
        now: Instant,
        io: &mut SessionIo<'_>,
    ) -> Result<bool, SessionError> {
        self.check_capacity(remote, io)?;
        Ok(self.push(remote, body, flush_now, now, io))
    }

    /// Buffers `body` and flushes if due and verified.
    fn push(&mut self, remote: PeerId, body: MessageBody, flush_now: bool, now: Instant, io: &mut SessionIo<'_>) -> bool {
        let Some(session) = self.sessions.get_mut(&remote) else {
            return false;
        };
        let due = session.core.queue.enqueue(body) || flush_now;
        match session.state {
            InitiatorState::Verified { channel } if due => {
                if let Some(frame) = session.core.queue.flush_all(now) {
                    io.write(channel, &frame);
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{PostedReply, RpcRegistry};
    use crate::testing::{Recorder, RecordingSink};
    use crate::RpcDispatcher;
    use linkforge_protocol::{Codec, HeartbeatKind, JsonCodec};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const LOCAL: PeerId = PeerId(100);
    const SERVER: PeerId = PeerId(1);

    struct Harness {
        sink: RecordingSink,
        recorder: Recorder,
        rpc: RpcDispatcher,
        _replies: mpsc::UnboundedReceiver<PostedReply>,
        manager: ConnectorManager,
        start: Instant,
    }

    impl Harness {
        fn new(config: SessionConfig) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                sink: RecordingSink::default(),
                recorder: Recorder::default(),
                rpc: RpcDispatcher::new(RpcRegistry::new(), tx),
                _replies: rx,
                manager: ConnectorManager::new(LOCAL, Role::Client, config),
                start: Instant::now(),
            }
        }

        fn at(&self, ms: u64) -> Instant {
            self.start + Duration::from_millis(ms)
        }

        fn run<R>(&mut self, f: impl FnOnce(&mut ConnectorManager, &mut SessionIo<'_>) -> R) -> R {
            let mut io = SessionIo {
                sink: &mut self.sink,
                codec: &JsonCodec,
                listener: &mut self.recorder,
                rpc: &self.rpc,
            };
            f(&mut self.manager, &mut io)
        }

        fn connect(&mut self) -> ChannelId {
            let now = self.start;
            self.run(|m, io| m.connect(SERVER, Role::Gateway, "server:1", b"login".to_vec(), now, io))
                .unwrap();
            self.sink.last_opened().unwrap()
        }

        fn feed(&mut self, channel: ChannelId, frame: &Frame, now: Instant) {
            let bytes = JsonCodec.encode(frame).unwrap();
            self.run(|m, io| m.on_frame(channel, &bytes, now, io));
        }

        fn accept(&mut self, channel: ChannelId, attempt: i32, ack: u64, now: Instant) {
            let frame = Frame::ConnectResponse {
                attempt_counter: attempt,
                success: true,
                ack,
                encrypted_token: Some(b"next".to_vec()),
                reject: None,
            };
            self.feed(channel, &frame, now);
        }

        /// Connects, opens and verifies; returns the verified channel.
        fn verified(&mut self) -> ChannelId {
            let ch = self.connect();
            let now = self.start;
            self.run(|m, io| m.on_opened(ch, now, io));
            self.accept(ch, 1, 0, now);
            self.sink.take_frames();
            ch
        }
    }

    fn one_way(n: u8) -> MessageBody {
        MessageBody::OneWay { payload: vec![n] }
    }

    // =====================================================================
    // Connecting → Verifying → Verified
    // =====================================================================

    #[test]
    fn test_connect_opens_channel_and_waits() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.connect();
        assert_eq!(h.sink.opened, vec![(ch, "server:1".to_string())]);
        assert!(matches!(
            h.manager.state(SERVER),
            Some(InitiatorState::Connecting { channel: Some(c), .. }) if c == ch
        ));
        assert!(h.manager.owns_channel(ch));
    }

    #[test]
    fn test_connect_twice_returns_already_exists() {
        let mut h = Harness::new(SessionConfig::default());
        h.connect();
        let now = h.start;
        let err = h
            .run(|m, io| m.connect(SERVER, Role::Gateway, "x", vec![], now, io))
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists(SERVER)));
    }

    #[test]
    fn test_on_opened_sends_connect_request_with_token_and_ack() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.connect();
        let now = h.start;
        h.run(|m, io| m.on_opened(ch, now, io));

        let frames = h.sink.take_frames();
        assert_eq!(
            frames,
            vec![(
                ch,
                Frame::ConnectRequest {
                    sender_id: LOCAL,
                    attempt_counter: 1,
                    ack: 0,
                    encrypted_token: b"login".to_vec(),
                }
            )]
        );
        assert!(matches!(h.manager.state(SERVER), Some(InitiatorState::Verifying { .. })));
    }

    #[test]
    fn test_on_opened_unknown_channel_is_closed() {
        let mut h = Harness::new(SessionConfig::default());
        let now = h.start;
        h.run(|m, io| m.on_opened(ChannelId::new(77), now, io));
        assert_eq!(h.sink.closed, vec![ChannelId::new(77)]);
    }

    #[test]
    fn test_successful_response_verifies_adopts_token_and_signals_connected() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.verified();
        assert_eq!(h.manager.state(SERVER), Some(InitiatorState::Verified { channel: ch }));
        assert_eq!(h.manager.token(SERVER), Some(&b"next"[..]));
        assert_eq!(h.recorder.connected.len(), 1);
        assert_eq!(h.recorder.connected[0].remote_id, SERVER);
    }

    #[test]
    fn test_response_with_other_attempt_counter_is_ignored() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.connect();
        let now = h.start;
        h.run(|m, io| m.on_opened(ch, now, io));
        h.accept(ch, 7, 0, now);
        assert!(matches!(h.manager.state(SERVER), Some(InitiatorState::Verifying { .. })));
    }

    #[test]
    fn test_failed_response_removes_session_with_reason() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.connect();
        let now = h.start;
        h.run(|m, io| m.on_opened(ch, now, io));
        let frame = Frame::ConnectResponse {
            attempt_counter: 1,
            success: false,
            ack: 0,
            encrypted_token: None,
            reject: Some(RejectReason::LoginTokenExpired),
        };
        h.feed(ch, &frame, now);
        assert!(!h.manager.contains(SERVER));
        assert!(h.sink.closed.contains(&ch));
        // Never connected, so no disconnect callback.
        assert!(h.recorder.disconnected.is_empty());
    }

    #[test]
    fn test_response_with_invalid_ack_removes_session() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.connect();
        let now = h.start;
        h.run(|m, io| m.on_opened(ch, now, io));
        h.accept(ch, 1, 5, now);
        assert!(!h.manager.contains(SERVER));
    }

    #[test]
    fn test_other_frame_while_verifying_forces_reconnect() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.connect();
        let now = h.start;
        h.run(|m, io| m.on_opened(ch, now, io));
        let stray = Frame::Single {
            ack: 0,
            sequence: 1,
            body: one_way(1),
        };
        h.feed(ch, &stray, now);

        assert!(h.sink.closed.contains(&ch));
        let fresh = h.sink.last_opened().unwrap();
        assert_ne!(fresh, ch);
        assert!(matches!(
            h.manager.state(SERVER),
            Some(InitiatorState::Connecting { channel: Some(c), .. }) if c == fresh
        ));
    }

    // =====================================================================
    // Connect failures
    // =====================================================================

    #[test]
    fn test_open_failures_beyond_max_retries_remove_session() {
        let config = SessionConfig {
            connect_max_retries: 2,
            ..Default::default()
        };
        let mut h = Harness::new(config);
        let mut ch = h.connect();
        for attempt in 0..3 {
            let now = h.at(attempt * 100);
            h.run(|m, io| m.on_open_failed(ch, "refused", now, io));
            if attempt < 2 {
                assert!(h.manager.contains(SERVER));
                let tick = h.at(attempt * 100 + 50);
                h.run(|m, io| m.tick(tick, io));
                ch = h.sink.last_opened().unwrap();
            }
        }
        assert!(!h.manager.contains(SERVER));
        assert_eq!(h.sink.opened.len(), 3);
    }

    #[test]
    fn test_connect_timeout_counts_as_failure_and_retries() {
        let mut h = Harness::new(SessionConfig::default());
        let first = h.connect();
        let late = h.at(5_000);
        h.run(|m, io| m.tick(late, io));
        assert!(h.sink.closed.contains(&first));
        assert!(!h.manager.owns_channel(first));

        let next_tick = h.at(5_050);
        h.run(|m, io| m.tick(next_tick, io));
        assert_eq!(h.sink.opened.len(), 2);
    }

    #[test]
    fn test_verify_timeout_goes_back_to_connecting() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.connect();
        let now = h.start;
        h.run(|m, io| m.on_opened(ch, now, io));
        let late = h.at(5_000);
        h.run(|m, io| m.tick(late, io));
        assert!(matches!(
            h.manager.state(SERVER),
            Some(InitiatorState::Connecting { channel: None, .. })
        ));
    }

    // =====================================================================
    // Verified: send, receive, heartbeat
    // =====================================================================

    #[test]
    fn test_send_when_verified_flushes_immediately() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.verified();
        let now = h.at(10);
        let flushed = h.run(|m, io| m.send(SERVER, vec![9], now, io)).unwrap();
        assert!(flushed);
        let frames = h.sink.take_frames();
        assert_eq!(
            frames,
            vec![(
                ch,
                Frame::Single {
                    ack: 0,
                    sequence: 1,
                    body: one_way(9)
                }
            )]
        );
    }

    #[test]
    fn test_send_while_connecting_buffers_until_verified() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.connect();
        let now = h.start;
        assert!(!h.run(|m, io| m.send(SERVER, vec![1], now, io)).unwrap());
        assert!(!h.run(|m, io| m.send(SERVER, vec![2], now, io)).unwrap());
        h.run(|m, io| m.on_opened(ch, now, io));
        h.accept(ch, 1, 0, now);

        let frames = h.sink.take_frames();
        let last = frames.last().unwrap().1.clone().into_data().unwrap();
        assert_eq!(last.first_sequence, 1);
        assert_eq!(last.bodies, vec![one_way(1), one_way(2)]);
    }

    #[test]
    fn test_send_unknown_session_returns_not_found() {
        let mut h = Harness::new(SessionConfig::default());
        let now = h.start;
        let err = h.run(|m, io| m.send(SERVER, vec![], now, io)).unwrap_err();
        assert!(matches!(err, SessionError::NotFound(SERVER)));
    }

    #[test]
    fn test_inbound_data_in_order_is_delivered_on_tick() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.verified();
        let now = h.at(10);
        h.feed(
            ch,
            &Frame::Batch {
                ack: 0,
                first_sequence: 1,
                bodies: vec![one_way(1), one_way(2)],
            },
            now,
        );
        assert!(h.recorder.messages.is_empty());
        h.run(|m, io| m.tick(now, io));
        let payloads: Vec<Vec<u8>> = h.recorder.messages.iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(payloads, vec![vec![1], vec![2]]);
        assert_eq!(h.manager.queue(SERVER).unwrap().ack(), 2);
    }

    #[test]
    fn test_inbound_sequence_gap_forces_reconnect() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.verified();
        let now = h.at(10);
        h.feed(
            ch,
            &Frame::Single {
                ack: 0,
                sequence: 3,
                body: one_way(3),
            },
            now,
        );
        assert!(h.sink.closed.contains(&ch));
        assert!(matches!(h.manager.state(SERVER), Some(InitiatorState::Connecting { .. })));
        assert_eq!(h.manager.queue(SERVER).unwrap().ack(), 0);
    }

    #[test]
    fn test_inbound_batch_at_sequence_limit_forces_reconnect() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.verified();
        let now = h.at(10);
        h.feed(
            ch,
            &Frame::Batch {
                ack: 0,
                first_sequence: u64::MAX,
                bodies: vec![one_way(1), one_way(2)],
            },
            now,
        );
        assert!(h.sink.closed.contains(&ch));
        assert!(matches!(h.manager.state(SERVER), Some(InitiatorState::Connecting { .. })));
        assert_eq!(h.manager.queue(SERVER).unwrap().ack(), 0);
    }

    #[test]
    fn test_inbound_invalid_ack_forces_reconnect() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.verified();
        let now = h.at(10);
        h.feed(
            ch,
            &Frame::Single {
                ack: 4,
                sequence: 1,
                body: one_way(1),
            },
            now,
        );
        assert!(matches!(h.manager.state(SERVER), Some(InitiatorState::Connecting { .. })));
    }

    #[test]
    fn test_ack_timeout_forces_reconnect_and_resend_after_reverify() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.verified();
        for n in 1..=5u8 {
            let now = h.at(10);
            h.run(|m, io| m.send(SERVER, vec![n], now, io)).unwrap();
        }
        h.sink.take_frames();

        // Acceptor acknowledged 1..=3 and then went quiet.
        h.feed(
            ch,
            &Frame::Heartbeat {
                ack: 3,
                sequence: 1,
                kind: HeartbeatKind::Pong,
            },
            h.at(20),
        );
        let late = h.at(10_010);
        h.run(|m, io| m.tick(late, io));
        let fresh = h.sink.last_opened().unwrap();
        assert_ne!(fresh, ch);

        h.run(|m, io| m.on_opened(fresh, late, io));
        let request = h.sink.take_frames();
        assert!(matches!(
            request.last(),
            Some((_, Frame::ConnectRequest { attempt_counter: 2, ack: 1, .. }))
        ));

        h.accept(fresh, 2, 3, late);
        let frames = h.sink.take_frames();
        let resent = frames[0].1.clone().into_data().unwrap();
        assert_eq!(resent.first_sequence, 4);
        assert_eq!(resent.bodies, vec![one_way(4), one_way(5)]);
        assert_eq!(h.recorder.connected.len(), 1, "reconnect is not a new connect");
    }

    #[test]
    fn test_quiet_session_sends_one_ping_until_pong() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.verified();
        // No traffic for a third of the 60 s session timeout.
        let quiet = h.at(20_000);
        h.run(|m, io| m.tick(quiet, io));
        let frames = h.sink.take_frames();
        assert_eq!(
            frames,
            vec![(
                ch,
                Frame::Heartbeat {
                    ack: 0,
                    sequence: 1,
                    kind: HeartbeatKind::Ping
                }
            )]
        );

        let again = h.at(26_000);
        h.run(|m, io| m.tick(again, io));
        assert!(h.sink.take_frames().is_empty(), "ping already pending");

        h.feed(
            ch,
            &Frame::Heartbeat {
                ack: 1,
                sequence: 1,
                kind: HeartbeatKind::Pong,
            },
            h.at(26_100),
        );
        assert_eq!(h.manager.queue(SERVER).unwrap().sent_len(), 0);
    }

    #[test]
    fn test_unacked_message_past_half_ack_timeout_triggers_ping() {
        let mut h = Harness::new(SessionConfig::default());
        h.verified();
        let now = h.at(0);
        h.run(|m, io| m.send(SERVER, vec![1], now, io)).unwrap();
        h.sink.take_frames();

        let early = h.at(4_999);
        h.run(|m, io| m.tick(early, io));
        assert!(h.sink.take_frames().is_empty());

        let half = h.at(5_000);
        h.run(|m, io| m.tick(half, io));
        let frames = h.sink.take_frames();
        assert!(matches!(
            frames.as_slice(),
            [(_, Frame::Heartbeat { sequence: 2, .. })]
        ));
    }

    #[test]
    fn test_token_refresh_while_verified_replaces_token() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.verified();
        let refresh = Frame::ConnectResponse {
            attempt_counter: 1,
            success: true,
            ack: 0,
            encrypted_token: Some(b"fail".to_vec()),
            reject: None,
        };
        h.feed(ch, &refresh, h.at(5));
        assert_eq!(h.manager.token(SERVER), Some(&b"fail"[..]));
        assert!(h.manager.state(SERVER).unwrap().is_verified());
    }

    #[test]
    fn test_channel_closed_while_verified_reconnects() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.verified();
        let now = h.at(5);
        h.run(|m, io| m.on_closed(ch, now, io));
        let fresh = h.sink.last_opened().unwrap();
        assert_ne!(fresh, ch);
        assert!(!h.manager.owns_channel(ch));
        assert!(h.manager.owns_channel(fresh));
    }

    #[test]
    fn test_frame_from_old_channel_is_ignored() {
        let mut h = Harness::new(SessionConfig::default());
        let old = h.verified();
        let now = h.at(5);
        h.run(|m, io| m.on_closed(old, now, io));
        h.feed(
            old,
            &Frame::Single {
                ack: 0,
                sequence: 1,
                body: one_way(1),
            },
            now,
        );
        assert_eq!(h.manager.queue(SERVER).unwrap().ack(), 0);
    }

    // =====================================================================
    // Removal, overflow, timeout
    // =====================================================================

    #[test]
    fn test_overflow_removes_session_with_cache_overflow() {
        let config = SessionConfig {
            max_cache_messages: crate::CacheLimits {
                initiator: 2,
                acceptor: 10,
            },
            ..Default::default()
        };
        let mut h = Harness::new(config);
        h.verified();
        let now = h.at(1);
        h.run(|m, io| m.send(SERVER, vec![1], now, io)).unwrap();
        h.run(|m, io| m.send(SERVER, vec![2], now, io)).unwrap();
        let err = h.run(|m, io| m.send(SERVER, vec![3], now, io)).unwrap_err();
        assert!(matches!(err, SessionError::CacheOverflow(SERVER)));
        assert!(!h.manager.contains(SERVER));
        assert_eq!(h.recorder.disconnected[0].1, CloseReason::CacheOverflow);
        assert_eq!(h.recorder.disconnected[0].1.to_string(), "cache overflow");
    }

    #[test]
    fn test_session_timeout_removes_with_timed_out() {
        let config = SessionConfig {
            session_timeout_secs: 5,
            ..Default::default()
        };
        let mut h = Harness::new(config);
        h.verified();
        let late = h.at(5_000);
        h.run(|m, io| m.tick(late, io));
        assert!(!h.manager.contains(SERVER));
        assert_eq!(h.recorder.disconnected[0].1.to_string(), "timed out");
    }

    #[test]
    fn test_remove_session_is_idempotent() {
        let mut h = Harness::new(SessionConfig::default());
        h.verified();
        let reason = CloseReason::Requested("bye".into());
        assert_eq!(
            h.run(|m, io| m.remove_session(SERVER, reason.clone(), io)),
            RemoveOutcome::Removed
        );
        assert_eq!(
            h.run(|m, io| m.remove_session(SERVER, reason.clone(), io)),
            RemoveOutcome::AlreadyAbsent
        );
        assert_eq!(h.recorder.disconnected.len(), 1);
    }

    #[test]
    fn test_call_timeout_then_late_response_discarded() {
        let mut h = Harness::new(SessionConfig::default());
        let ch = h.verified();
        let (completion, mut rx) = RpcCompletion::promise();
        let now = h.at(0);
        let call = OutboundCall::new(5, vec![]).timeout(Duration::from_millis(1_000));
        let id = h.run(|m, io| m.call(SERVER, call, completion, now, io)).unwrap();

        let before = h.at(999);
        h.run(|m, io| m.tick(before, io));
        assert!(rx.try_recv().is_err());

        let at = h.at(1_000);
        h.run(|m, io| m.tick(at, io));
        assert_eq!(rx.try_recv().unwrap().code, RpcResultCode::Timeout);

        h.feed(
            ch,
            &Frame::Single {
                ack: 1,
                sequence: 1,
                body: MessageBody::Response(RpcResponse {
                    request_id: id,
                    code: RpcResultCode::Success,
                    body: None,
                }),
            },
            h.at(1_500),
        );
        let tick = h.at(1_550);
        h.run(|m, io| m.tick(tick, io));
        assert_eq!(h.manager.queue(SERVER).unwrap().pending_rpcs(), 0);
    }

    #[test]
    fn test_call_unknown_session_completes_session_closed() {
        let mut h = Harness::new(SessionConfig::default());
        let (completion, mut rx) = RpcCompletion::promise();
        let now = h.start;
        let result = h.run(|m, io| m.call(SERVER, OutboundCall::new(1, vec![]), completion, now, io));
        assert!(result.is_err());
        assert_eq!(rx.try_recv().unwrap().code, RpcResultCode::SessionClosed);
    }

    #[test]
    fn test_remove_all_resolves_pending_calls_session_closed() {
        let mut h = Harness::new(SessionConfig::default());
        h.verified();
        let (completion, mut rx) = RpcCompletion::promise();
        let now = h.at(1);
        h.run(|m, io| m.call(SERVER, OutboundCall::new(1, vec![]), completion, now, io))
            .unwrap();
        let removed = h.run(|m, io| m.remove_all(CloseReason::Requested("shutdown".into()), io));
        assert_eq!(removed, 1);
        assert_eq!(rx.try_recv().unwrap().code, RpcResultCode::SessionClosed);
        assert!(h.manager.is_empty());
    }
}

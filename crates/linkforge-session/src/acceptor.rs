//! The accepting side: sessions remote initiators opened to this node.
//!
//! An accepted channel has no session until it carries a valid
//! `ConnectRequest`. Unclaimed channels are closed after
//! `wait_token_result_timeout`.
//!
//! ```text
//!                 handshake ok                first accepted data
//!  (no session) ───────────────→ AwaitingReconnectConfirm ──────────→ Idle
//!                                     ↑             │ deadline          │
//!                                     │             └──────────────────→│
//!                                     └───────── reconnect ok ──────────┘
//! ```
//!
//! A handshake either passes every check or is rejected. A rejection writes
//! a failed `ConnectResponse` and closes the offending channel. It never
//! changes the session the request was aimed at.

use std::collections::HashMap;
use std::time::Instant;

use linkforge_protocol::{
    DataFrame, Frame, MessageBody, PeerId, RejectReason, Role, RpcResponse, RpcResultCode,
};
use linkforge_transport::{ChannelId, ListenerId};

use crate::lifecycle::{Heartbeat, SessionCore, SessionIo};
use crate::queue::MessageQueue;
use crate::rpc::{OutboundCall, RpcCompletion, RpcOutcome};
use crate::token::{Token, TokenAuthority, TokenCipher, TokenClock};
use crate::{
    CloseReason, RemoveOutcome, SessionConfig, SessionError, SessionInfo, SessionStatus, Side,
};

/// Where an accepted session is between handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    /// Serving traffic on `channel`, or waiting for the initiator to come
    /// back when `channel` is `None`.
    Idle { channel: Option<ChannelId> },
    /// A handshake just succeeded on `channel`. The first accepted data
    /// message proves the initiator holds the newest token.
    AwaitingReconnectConfirm { channel: ChannelId, deadline: Instant },
}

impl AcceptorState {
    pub fn channel(&self) -> Option<ChannelId> {
        match *self {
            Self::Idle { channel } => channel,
            Self::AwaitingReconnectConfirm { channel, .. } => Some(channel),
        }
    }
}

/// How a handshake that passed every check is admitted.
#[derive(Debug)]
enum Admission {
    /// No session yet: a login token starts one.
    FirstLogin(Token),
    /// A login token for a client that already has a session. The old
    /// session is replaced.
    Relogin(Token),
    /// The issued token of the existing session, or the one before it.
    Reconnect(Token),
}

#[derive(Debug)]
struct AcceptorSession {
    core: SessionCore,
    state: AcceptorState,
    /// The login token that opened the session.
    login: Token,
    /// The newest token handed to the initiator.
    issued: Token,
    /// The token `issued` was derived from. Still accepted until the
    /// initiator proves it holds `issued`.
    previous_issued: Option<Token>,
    /// Attempt counter of the last successful handshake.
    last_attempt: i32,
}

impl AcceptorSession {
    /// Closes the current channel, if any, and waits for a reconnect.
    fn detach(&mut self, channels: &mut HashMap<ChannelId, PeerId>, io: &mut SessionIo<'_>) {
        if let Some(channel) = self.state.channel() {
            channels.remove(&channel);
            io.sink.close_quietly(channel);
        }
        self.state = AcceptorState::Idle { channel: None };
    }

    fn flush(&mut self, now: Instant, io: &mut SessionIo<'_>) {
        if let Some(channel) = self.state.channel() {
            if let Some(frame) = self.core.queue.flush_all(now) {
                io.write(channel, &frame);
            }
        }
    }

    /// Handles sequenced traffic. Returns `false` if the rest of the frame
    /// was dropped because the initiator is out of step with us.
    fn on_data(
        &mut self,
        data: DataFrame,
        authority: &mut TokenAuthority,
        now: Instant,
        io: &mut SessionIo<'_>,
    ) -> bool {
        if !self.core.queue.is_ack_valid(data.ack) {
            tracing::debug!(session = %self.core.key(), ack = data.ack, "invalid ack from initiator");
            return false;
        }
        self.core.queue.on_peer_ack(data.ack);
        let mut pong = false;
        let mut in_step = true;
        for (offset, body) in data.bodies.into_iter().enumerate() {
            let accepted = data
                .first_sequence
                .checked_add(offset as u64)
                .is_some_and(|sequence| self.core.queue.accept(sequence));
            if !accepted {
                tracing::debug!(session = %self.core.key(), expected = self.core.queue.ack().saturating_add(1), "sequence out of order from initiator");
                in_step = false;
                break;
            }
            self.core.touch(now);
            if let AcceptorState::AwaitingReconnectConfirm { channel, .. } = self.state {
                authority.forbid(self.core.info.remote_id, self.issued.generation, now);
                tracing::debug!(session = %self.core.key(), generation = self.issued.generation, "reconnect confirmed");
                self.state = AcceptorState::Idle {
                    channel: Some(channel),
                };
            }
            if self.core.deliver(body, io) == Some(Heartbeat::Ping) {
                self.core.queue.enqueue(MessageBody::Pong);
                pong = true;
            }
        }
        if pong {
            self.flush(now, io);
        }
        in_step
    }
}

/// Owns every session remote initiators opened to one local identity.
#[derive(Debug)]
pub struct AcceptorManager {
    local_id: PeerId,
    local_role: Role,
    config: SessionConfig,
    authority: TokenAuthority,
    sessions: HashMap<PeerId, AcceptorSession>,
    /// Current channel of every session.
    channels: HashMap<ChannelId, PeerId>,
    /// Accepted channels that have not completed a handshake yet.
    pending: HashMap<ChannelId, Instant>,
    listeners: Vec<ListenerId>,
}

impl AcceptorManager {
    /// Creates a manager whose tokens are stamped with wall-clock seconds.
    ///
    /// # Errors
    /// [`SessionError::Token`] if the configured token key is unusable.
    pub fn new(local_id: PeerId, local_role: Role, config: SessionConfig) -> Result<Self, SessionError> {
        Self::with_clock(local_id, local_role, config, TokenClock::system(Instant::now()))
    }

    /// Like [`new`](Self::new) with an explicit token clock.
    ///
    /// # Errors
    /// [`SessionError::Token`] if the configured token key is unusable.
    pub fn with_clock(
        local_id: PeerId,
        local_role: Role,
        config: SessionConfig,
        clock: TokenClock,
    ) -> Result<Self, SessionError> {
        let config = config.validated();
        let cipher = TokenCipher::new(config.token_key.clone())?;
        let authority = TokenAuthority::new(
            cipher,
            clock,
            config.login_token_timeout(),
            config.forbidden_token_window(),
        );
        Ok(Self {
            local_id,
            local_role,
            config,
            authority,
            sessions: HashMap::new(),
            channels: HashMap::new(),
            pending: HashMap::new(),
            listeners: Vec::new(),
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn local_role(&self) -> Role {
        self.local_role
    }

    pub fn authority(&self) -> &TokenAuthority {
        &self.authority
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

    pub fn state(&self, remote: PeerId) -> Option<AcceptorState> {
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

    /// The newest token issued to `remote`, decrypted.
    pub fn issued_token(&self, remote: PeerId) -> Option<&Token> {
        self.sessions.get(&remote).map(|s| &s.issued)
    }

    pub fn owns_channel(&self, channel: ChannelId) -> bool {
        self.channels.contains_key(&channel) || self.pending.contains_key(&channel)
    }

    /// Records a listener opened for this identity so `remove_all` can
    /// release it.
    pub fn add_listener(&mut self, listener: ListenerId) {
        self.listeners.push(listener);
    }

    pub fn owns_listener(&self, listener: ListenerId) -> bool {
        self.listeners.contains(&listener)
    }

    // -- application operations ---------------------------------------------

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
        self.check_capacity(remote, now, io)?;
        Ok(self.push(remote, MessageBody::OneWay { payload }, false, now, io))
    }

    /// Sends an RPC request to the initiator. `completion` always fires
    /// exactly once.
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
        if let Err(e) = self.check_capacity(remote, now, io) {
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
        if let Err(e) = self.check_capacity(remote, now, io) {
            tracing::debug!(local = %self.local_id, %remote, error = %e, "rpc response dropped");
            return;
        }
        self.push(remote, MessageBody::Response(response), false, now, io);
    }

    /// Removes one session. Idempotent.
    ///
    /// A live channel first receives a kick notice: a successful response
    /// carrying a fail token. The initiator presents it on its next
    /// reconnect, gets `TOKEN_INVALID` and gives up. Every generation up
    /// to the issued one is forbidden as well.
    pub fn remove_session(
        &mut self,
        remote: PeerId,
        reason: CloseReason,
        now: Instant,
        io: &mut SessionIo<'_>,
    ) -> RemoveOutcome {
        let Some(mut session) = self.sessions.remove(&remote) else {
            return RemoveOutcome::AlreadyAbsent;
        };
        let channel = session.state.channel();
        if let Some(channel) = channel {
            self.channels.remove(&channel);
            let fail = self.authority.issue_fail_token(remote, self.local_id, now);
            let kick = Frame::ConnectResponse {
                attempt_counter: session.last_attempt,
                success: true,
                ack: session.core.queue.ack(),
                encrypted_token: Some(self.authority.encrypt(&fail)),
                reject: None,
            };
            io.write(channel, &kick);
        }
        self.authority
            .forbid(remote, session.issued.generation.saturating_add(1), now);
        session.core.teardown(channel, &reason, io);
        RemoveOutcome::Removed
    }

    /// Removes every session, closes unclaimed channels and releases every
    /// listener of this identity. Returns how many sessions were removed.
    pub fn remove_all(&mut self, reason: CloseReason, now: Instant, io: &mut SessionIo<'_>) -> usize {
        let mut remotes: Vec<PeerId> = self.sessions.keys().copied().collect();
        remotes.sort();
        let removed = remotes
            .into_iter()
            .filter(|remote| {
                self.remove_session(*remote, reason.clone(), now, io) == RemoveOutcome::Removed
            })
            .count();
        for (channel, _) in self.pending.drain() {
            io.sink.close_quietly(channel);
        }
        for listener in self.listeners.drain(..) {
            io.sink.release_listener(listener);
        }
        removed
    }

    /// Drives timers: unclaimed channels, confirmation deadlines, flushes,
    /// RPC deadlines, inbound commits, session timeouts and the forbidden
    /// window.
    pub fn tick(&mut self, now: Instant, io: &mut SessionIo<'_>) {
        let stale: Vec<ChannelId> = self
            .pending
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in stale {
            tracing::debug!(%channel, "no handshake on accepted channel, closing");
            self.pending.remove(&channel);
            io.sink.close_quietly(channel);
        }

        let mut remotes: Vec<PeerId> = self.sessions.keys().copied().collect();
        remotes.sort();
        for remote in remotes {
            let Some(session) = self.sessions.get_mut(&remote) else {
                continue;
            };
            if session.core.is_expired(now) {
                self.remove_session(remote, CloseReason::TimedOut, now, io);
                continue;
            }
            if let AcceptorState::AwaitingReconnectConfirm { channel, deadline } = session.state {
                if now >= deadline {
                    tracing::debug!(session = %session.core.key(), "reconnect not confirmed in time");
                    session.state = AcceptorState::Idle {
                        channel: Some(channel),
                    };
                }
            }
            session.flush(now, io);
            session.core.expire_rpcs(now);
            session.core.commit(io);
        }

        let swept = self.authority.sweep(now);
        if swept > 0 {
            tracing::trace!(local = %self.local_id, swept, "forbidden tokens expired");
        }
    }

    // -- transport events ---------------------------------------------------

    pub fn on_accepted(&mut self, channel: ChannelId, now: Instant) {
        self.pending
            .insert(channel, now + self.config.wait_token_result_timeout());
    }

    pub fn on_closed(&mut self, channel: ChannelId) {
        if self.pending.remove(&channel).is_some() {
            return;
        }
        let Some(remote) = self.channels.remove(&channel) else {
            return;
        };
        if let Some(session) = self.sessions.get_mut(&remote) {
            if session.state.channel() == Some(channel) {
                tracing::debug!(session = %session.core.key(), %channel, "channel closed, awaiting reconnect");
                session.state = AcceptorState::Idle { channel: None };
            }
        }
    }

    pub fn on_frame(&mut self, channel: ChannelId, data: &[u8], now: Instant, io: &mut SessionIo<'_>) {
        let frame = match io.codec.decode_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(%channel, error = %e, "undecodable frame, closing channel");
                self.drop_channel(channel, io);
                return;
            }
        };
        match frame {
            Frame::ConnectRequest {
                sender_id,
                attempt_counter,
                ack,
                encrypted_token,
            } => self.on_connect_request(channel, sender_id, attempt_counter, ack, &encrypted_token, now, io),
            Frame::ConnectResponse { .. } => {
                tracing::debug!(%channel, "unexpected connect response, closing channel");
                self.drop_channel(channel, io);
            }
            data_frame => {
                let Some(remote) = self.channels.get(&channel).copied() else {
                    tracing::debug!(%channel, kind = data_frame.kind(), "data before handshake, closing channel");
                    self.drop_channel(channel, io);
                    return;
                };
                let Some(session) = self.sessions.get_mut(&remote) else {
                    return;
                };
                let Ok(data) = data_frame.into_data() else {
                    return;
                };
                // The initiator resends whatever we skip once its ack
                // deadline passes.
                if !session.on_data(data, &mut self.authority, now, io) {
                    tracing::debug!(session = %session.core.key(), %channel, "data frame dropped");
                }
            }
        }
    }

    // -- handshake ----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn on_connect_request(
        &mut self,
        channel: ChannelId,
        sender_id: PeerId,
        attempt_counter: i32,
        ack: u64,
        encrypted_token: &[u8],
        now: Instant,
        io: &mut SessionIo<'_>,
    ) {
        let admission = match self.admit(channel, sender_id, attempt_counter, ack, encrypted_token, now) {
            Ok(admission) => admission,
            Err(reason) => {
                tracing::info!(local = %self.local_id, remote = %sender_id, %channel, %reason, "handshake rejected");
                let reply = Frame::ConnectResponse {
                    attempt_counter,
                    success: false,
                    ack: 0,
                    encrypted_token: None,
                    reject: Some(reason),
                };
                io.write(channel, &reply);
                self.pending.remove(&channel);
                io.sink.close_quietly(channel);
                return;
            }
        };
        self.pending.remove(&channel);

        let token = match admission {
            Admission::FirstLogin(token) => {
                self.open_session(&token, now);
                token
            }
            Admission::Relogin(token) => {
                self.remove_session(sender_id, CloseReason::ReplacedByLogin, now, io);
                self.open_session(&token, now);
                token
            }
            Admission::Reconnect(token) => token,
        };

        let wait = self.config.wait_token_result_timeout();
        let Some(session) = self.sessions.get_mut(&sender_id) else {
            return;
        };
        if let Some(old) = session.state.channel().filter(|old| *old != channel) {
            self.channels.remove(&old);
            io.sink.close_quietly(old);
        }
        session.core.queue.on_peer_ack(ack);
        session.last_attempt = attempt_counter;
        session.previous_issued = Some(token);
        session.issued = self.authority.issue_next_token(&token, now);
        self.authority.forbid(sender_id, token.generation, now);
        session.state = AcceptorState::AwaitingReconnectConfirm {
            channel,
            deadline: now + wait,
        };
        self.channels.insert(channel, sender_id);

        let reply = Frame::ConnectResponse {
            attempt_counter,
            success: true,
            ack: session.core.queue.ack(),
            encrypted_token: Some(self.authority.encrypt(&session.issued)),
            reject: None,
        };
        io.write(channel, &reply);
        session.core.touch(now);
        if !session.core.mark_connected(io) {
            tracing::info!(session = %session.core.key(), generation = token.generation, "initiator reconnected");
            if let Some(frame) = session.core.queue.resend(now) {
                io.write(channel, &frame);
            }
        }
        session.flush(now, io);
    }

    /// Runs every handshake check without touching any state.
    ///
    /// Order: decryption, token contents ([`TokenAuthority::validate`]),
    /// then the checks that depend on the existing session.
    fn admit(
        &self,
        channel: ChannelId,
        sender_id: PeerId,
        attempt_counter: i32,
        ack: u64,
        encrypted_token: &[u8],
        now: Instant,
    ) -> Result<Admission, RejectReason> {
        let token = self.authority.decrypt(encrypted_token).map_err(|e| {
            tracing::debug!(remote = %sender_id, error = %e, "token decrypt failed");
            RejectReason::TokenInvalid
        })?;
        self.authority
            .validate(&token, sender_id, self.local_id, self.local_role, now)?;

        let Some(session) = self.sessions.get(&sender_id) else {
            if token.generation != 0 {
                return Err(RejectReason::NotLoginToken);
            }
            if ack != 0 {
                return Err(RejectReason::AckError);
            }
            return Ok(Admission::FirstLogin(token));
        };
        if session.state.channel() == Some(channel) {
            return Err(RejectReason::SameChannel);
        }
        // Any login token but the one that opened the session starts over,
        // unless it is older than that one.
        if token.generation == 0 && token != session.login {
            if token.created_at_sec < session.login.created_at_sec {
                return Err(RejectReason::StaleToken);
            }
            if ack != 0 {
                return Err(RejectReason::AckError);
            }
            return Ok(Admission::Relogin(token));
        }
        if token != session.issued && session.previous_issued != Some(token) {
            return Err(RejectReason::StaleToken);
        }
        if attempt_counter <= session.last_attempt {
            return Err(RejectReason::StaleRequest);
        }
        if !session.core.queue.is_ack_valid(ack) {
            return Err(RejectReason::AckError);
        }
        Ok(Admission::Reconnect(token))
    }

    fn open_session(&mut self, token: &Token, now: Instant) {
        let info = SessionInfo {
            local_id: self.local_id,
            remote_id: token.client_id,
            local_role: self.local_role,
            remote_role: token.client_role,
            side: Side::Acceptor,
            status: SessionStatus::Active,
        };
        let queue = MessageQueue::new(self.config.flush_threshold, self.config.ack_timeout());
        self.authority.restart_line(token, now);
        self.sessions.insert(
            token.client_id,
            AcceptorSession {
                core: SessionCore::new(info, queue, self.config.session_timeout(), now),
                state: AcceptorState::Idle { channel: None },
                login: *token,
                issued: *token,
                previous_issued: None,
                last_attempt: 0,
            },
        );
    }

    // -- internals ----------------------------------------------------------

    fn drop_channel(&mut self, channel: ChannelId, io: &mut SessionIo<'_>) {
        if self.pending.remove(&channel).is_some() {
            io.sink.close_quietly(channel);
            return;
        }
        match self.channels.get(&channel).copied() {
            Some(remote) => {
                if let Some(session) = self.sessions.get_mut(&remote) {
                    session.detach(&mut self.channels, io);
                }
            }
            None => io.sink.close_quietly(channel),
        }
    }

    fn check_capacity(&mut self, remote: PeerId, now: Instant, io: &mut SessionIo<'_>) -> Result<(), SessionError> {
        let cached = self
            .sessions
            .get(&remote)
            .ok_or(SessionError::NotFound(remote))?
            .core
            .queue
            .cached_len();
        if cached >= self.config.max_cache_messages.acceptor {
            self.remove_session(remote, CloseReason::CacheOverflow, now, io);
            return Err(SessionError::CacheOverflow(remote));
        }
        Ok(())
    }

    /// Buffers `body` and flushes if due and a channel is attached.
    fn push(&mut self, remote: PeerId, body: MessageBody, flush_now: bool, now: Instant, io: &mut SessionIo<'_>) -> bool {
        let Some(session) = self.sessions.get_mut(&remote) else {
            return false;
        };
        let due = session.core.queue.enqueue(body) || flush_now;
        if due && session.state.channel().is_some() {
            session.flush(now, io);
            return true;
        }
        false
    }
}

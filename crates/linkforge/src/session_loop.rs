//! Session loop: one Tokio task that owns every session of a node.
//!
//! This is the actor model again. The outside world holds a cheap
//! [`LoopHandle`] and sends [`LoopCommand`]s with oneshot reply channels.
//! The actor itself selects over four inputs:
//!
//! - application commands from the handle,
//! - transport events from the WebSocket hub,
//! - RPC replies posted by handlers (possibly from other threads),
//! - the lifecycle tick.
//!
//! Every session manager is touched only from this task, so nothing in the
//! session layer needs a lock.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use linkforge_protocol::{Codec, JsonCodec, PeerId, Role, RpcResponse, RpcResultCode};
use linkforge_session::{
    AcceptorManager, CloseReason, ConnectorManager, OutboundCall, PostedReply, RemoveOutcome,
    RpcCompletion, RpcDispatcher, RpcOutcome, RpcRegistry, SessionConfig, SessionError,
    SessionInfo, SessionIo, SessionKey, Side, TokenClock,
};
use linkforge_tick::{LoopTicker, TickerConfig};
use linkforge_transport::{ChannelId, TransportEvent, WebSocketHub};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::{EventForwarder, LinkforgeError, SessionEvent};

/// The loop's notion of "now".
///
/// Read from Tokio's clock so paused-time tests and the ticker agree.
pub(crate) fn loop_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands sent to the session loop through its channel.
///
/// The `oneshot::Sender` in each variant is the reply channel: the handle
/// sends a command and waits for the answer on it.
pub(crate) enum LoopCommand {
    Connect {
        local: PeerId,
        remote: PeerId,
        remote_role: Role,
        address: String,
        login_token: Vec<u8>,
        reply: oneshot::Sender<Result<(), LinkforgeError>>,
    },
    Listen {
        local: PeerId,
        address: String,
        reply: oneshot::Sender<Result<SocketAddr, LinkforgeError>>,
    },
    Send {
        session: SessionKey,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<bool, LinkforgeError>>,
    },
    Call {
        session: SessionKey,
        call: OutboundCall,
        completion: RpcCompletion,
        reply: oneshot::Sender<Result<u64, LinkforgeError>>,
    },
    Remove {
        session: SessionKey,
        reason: String,
        reply: oneshot::Sender<Result<RemoveOutcome, LinkforgeError>>,
    },
    RemoveAll {
        local: PeerId,
        reason: String,
        reply: oneshot::Sender<Result<usize, LinkforgeError>>,
    },
    IssueLoginToken {
        local: PeerId,
        client: PeerId,
        client_role: Role,
        reply: oneshot::Sender<Result<Vec<u8>, LinkforgeError>>,
    },
    Sessions {
        local: PeerId,
        reply: oneshot::Sender<Result<Vec<SessionInfo>, LinkforgeError>>,
    },
    Stats {
        reply: oneshot::Sender<LoopStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A snapshot of loop counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    /// Local identities hosted by the node.
    pub identities: usize,
    /// Live sessions this node initiated, across identities.
    pub initiated: usize,
    /// Live sessions this node accepted, across identities.
    pub accepted: usize,
    /// Lifecycle ticks run so far.
    pub ticks: u64,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a running session loop.
///
/// Cheap to clone; it wraps an `mpsc::Sender`. Sessions are addressed by
/// [`SessionKey`]. If a local identity both initiated and accepted a
/// session with the same remote, commands address the initiated one.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    sender: mpsc::Sender<LoopCommand>,
}

impl LoopHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> LoopCommand,
    ) -> Result<T, LinkforgeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(command(reply_tx))
            .await
            .map_err(|_| LinkforgeError::LoopClosed)?;
        reply_rx.await.map_err(|_| LinkforgeError::LoopClosed)
    }

    /// Starts a session from `local` to `remote` at `address` (`host:port`),
    /// presenting an encrypted login token. Returns once the first connect
    /// attempt is under way; [`SessionEvent::Connected`] follows the
    /// handshake.
    pub async fn connect(
        &self,
        local: PeerId,
        remote: PeerId,
        remote_role: Role,
        address: impl Into<String>,
        login_token: Vec<u8>,
    ) -> Result<(), LinkforgeError> {
        let address = address.into();
        self.request(|reply| LoopCommand::Connect {
            local,
            remote,
            remote_role,
            address,
            login_token,
            reply,
        })
        .await?
    }

    /// Binds a WebSocket listener whose channels are accepted by `local`.
    /// Returns the bound address, useful when binding port 0.
    pub async fn listen(
        &self,
        local: PeerId,
        address: impl Into<String>,
    ) -> Result<SocketAddr, LinkforgeError> {
        let address = address.into();
        self.request(|reply| LoopCommand::Listen {
            local,
            address,
            reply,
        })
        .await?
    }

    /// Sends a one-way payload. Returns whether it was flushed right away.
    pub async fn send(&self, session: SessionKey, payload: Vec<u8>) -> Result<bool, LinkforgeError> {
        self.request(|reply| LoopCommand::Send {
            session,
            payload,
            reply,
        })
        .await?
    }

    /// Encodes `value` as JSON and sends it as a one-way payload.
    pub async fn send_value<T: Serialize>(
        &self,
        session: SessionKey,
        value: &T,
    ) -> Result<bool, LinkforgeError> {
        let payload = JsonCodec.encode(value)?;
        self.send(session, payload).await
    }

    /// Makes an RPC call and waits for its outcome.
    ///
    /// A call that reaches the session always ends in an outcome: the
    /// response, `TIMEOUT`, or `SESSION_CLOSED`. The `Err` case means the
    /// call never got that far.
    pub async fn call(
        &self,
        session: SessionKey,
        call: OutboundCall,
    ) -> Result<RpcOutcome, LinkforgeError> {
        let (completion, outcome) = RpcCompletion::promise();
        self.request(|reply| LoopCommand::Call {
            session,
            call,
            completion,
            reply,
        })
        .await??;
        outcome.await.map_err(|_| LinkforgeError::LoopClosed)
    }

    /// Like [`call`](Self::call), for threads outside the runtime.
    ///
    /// # Panics
    /// When called from inside an async context.
    pub fn call_blocking(
        &self,
        session: SessionKey,
        call: OutboundCall,
    ) -> Result<RpcOutcome, LinkforgeError> {
        let (completion, outcome) = RpcCompletion::promise();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .blocking_send(LoopCommand::Call {
                session,
                call,
                completion,
                reply: reply_tx,
            })
            .map_err(|_| LinkforgeError::LoopClosed)?;
        reply_rx
            .blocking_recv()
            .map_err(|_| LinkforgeError::LoopClosed)??;
        outcome.blocking_recv().map_err(|_| LinkforgeError::LoopClosed)
    }

    /// Makes an RPC call whose outcome is handed to `callback` on the loop.
    /// Returns the request id.
    ///
    /// The callback runs on the session loop and must not block.
    pub async fn call_with_callback(
        &self,
        session: SessionKey,
        call: OutboundCall,
        callback: impl FnOnce(RpcOutcome) + Send + 'static,
    ) -> Result<u64, LinkforgeError> {
        let completion = RpcCompletion::callback(callback);
        self.request(|reply| LoopCommand::Call {
            session,
            call,
            completion,
            reply,
        })
        .await?
    }

    /// Removes one session. Removing an absent session is not an error.
    pub async fn remove_session(
        &self,
        session: SessionKey,
        reason: impl Into<String>,
    ) -> Result<RemoveOutcome, LinkforgeError> {
        let reason = reason.into();
        self.request(|reply| LoopCommand::Remove {
            session,
            reason,
            reply,
        })
        .await?
    }

    /// Removes every session of `local` and releases its listeners.
    pub async fn remove_all(
        &self,
        local: PeerId,
        reason: impl Into<String>,
    ) -> Result<usize, LinkforgeError> {
        let reason = reason.into();
        self.request(|reply| LoopCommand::RemoveAll {
            local,
            reason,
            reply,
        })
        .await?
    }

    /// Mints an encrypted generation-0 token that `client` can present to
    /// `local`. Stands in for a login service in small deployments.
    pub async fn issue_login_token(
        &self,
        local: PeerId,
        client: PeerId,
        client_role: Role,
    ) -> Result<Vec<u8>, LinkforgeError> {
        self.request(|reply| LoopCommand::IssueLoginToken {
            local,
            client,
            client_role,
            reply,
        })
        .await?
    }

    /// Every live session of `local`, sorted by remote id.
    pub async fn sessions(&self, local: PeerId) -> Result<Vec<SessionInfo>, LinkforgeError> {
        self.request(|reply| LoopCommand::Sessions { local, reply }).await?
    }

    pub async fn stats(&self) -> Result<LoopStats, LinkforgeError> {
        self.request(|reply| LoopCommand::Stats { reply }).await
    }

    /// Removes every session, stops the transport and ends the loop.
    pub async fn shutdown(&self) -> Result<(), LinkforgeError> {
        self.request(|reply| LoopCommand::Shutdown { reply }).await
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Both managers of one local identity.
#[derive(Debug)]
pub(crate) struct Identity {
    connector: ConnectorManager,
    acceptor: AcceptorManager,
}

impl Identity {
    pub(crate) fn new(
        id: PeerId,
        role: Role,
        config: &SessionConfig,
        clock: TokenClock,
    ) -> Result<Self, LinkforgeError> {
        Ok(Self {
            connector: ConnectorManager::new(id, role, config.clone()),
            acceptor: AcceptorManager::with_clock(id, role, config.clone(), clock)?,
        })
    }
}

/// The manager a session lives in.
enum Manager<'a> {
    Connector(&'a mut ConnectorManager),
    Acceptor(&'a mut AcceptorManager),
}

impl<'a> Manager<'a> {
    /// Finds the manager holding `session`. Initiated sessions win.
    fn locate(
        identities: &'a mut BTreeMap<PeerId, Identity>,
        session: SessionKey,
    ) -> Result<Self, LinkforgeError> {
        let identity = identities
            .get_mut(&session.local)
            .ok_or(LinkforgeError::UnknownIdentity(session.local))?;
        if identity.connector.contains(session.remote) {
            Ok(Self::Connector(&mut identity.connector))
        } else if identity.acceptor.contains(session.remote) {
            Ok(Self::Acceptor(&mut identity.acceptor))
        } else {
            Err(SessionError::NotFound(session.remote).into())
        }
    }

    fn send(
        self,
        remote: PeerId,
        payload: Vec<u8>,
        now: Instant,
        io: &mut SessionIo<'_>,
    ) -> Result<bool, SessionError> {
        match self {
            Self::Connector(m) => m.send(remote, payload, now, io),
            Self::Acceptor(m) => m.send(remote, payload, now, io),
        }
    }

    fn call(
        self,
        remote: PeerId,
        call: OutboundCall,
        completion: RpcCompletion,
        now: Instant,
        io: &mut SessionIo<'_>,
    ) -> Result<u64, SessionError> {
        match self {
            Self::Connector(m) => m.call(remote, call, completion, now, io),
            Self::Acceptor(m) => m.call(remote, call, completion, now, io),
        }
    }

    fn respond(self, remote: PeerId, response: RpcResponse, now: Instant, io: &mut SessionIo<'_>) {
        match self {
            Self::Connector(m) => m.respond(remote, response, now, io),
            Self::Acceptor(m) => m.respond(remote, response, now, io),
        }
    }

    fn remove(
        self,
        remote: PeerId,
        reason: CloseReason,
        now: Instant,
        io: &mut SessionIo<'_>,
    ) -> RemoveOutcome {
        match self {
            Self::Connector(m) => m.remove_session(remote, reason, io),
            Self::Acceptor(m) => m.remove_session(remote, reason, now, io),
        }
    }
}

/// The loop state. Runs inside a Tokio task.
struct SessionLoop {
    identities: BTreeMap<PeerId, Identity>,
    hub: WebSocketHub,
    codec: JsonCodec,
    rpc: RpcDispatcher,
    listener: EventForwarder,
    ticker: LoopTicker,
    commands: mpsc::Receiver<LoopCommand>,
    transport: mpsc::UnboundedReceiver<TransportEvent>,
    replies: mpsc::UnboundedReceiver<PostedReply>,
}

impl SessionLoop {
    /// Runs the actor loop until shutdown or until every handle is dropped.
    async fn run(mut self) {
        tracing::info!(identities = self.identities.len(), "session loop started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(LoopCommand::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::debug!("every loop handle dropped");
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = self.transport.recv() => self.on_transport_event(event),
                Some(reply) = self.replies.recv() => self.on_reply(reply),
                tick = self.ticker.wait_for_tick() => {
                    self.on_tick(tick.now);
                    self.ticker.record_tick_end();
                }
            }
        }

        tracing::info!("session loop stopped");
    }

    /// Splits the loop into the identity table and the I/O bundle every
    /// manager operation writes through.
    fn split(&mut self) -> (&mut BTreeMap<PeerId, Identity>, SessionIo<'_>) {
        (
            &mut self.identities,
            SessionIo {
                sink: &mut self.hub,
                codec: &self.codec,
                listener: &mut self.listener,
                rpc: &self.rpc,
            },
        )
    }

    async fn handle_command(&mut self, command: LoopCommand) {
        let now = loop_now();
        match command {
            LoopCommand::Connect {
                local,
                remote,
                remote_role,
                address,
                login_token,
                reply,
            } => {
                let (identities, mut io) = self.split();
                let result = match identities.get_mut(&local) {
                    Some(identity) => identity
                        .connector
                        .connect(remote, remote_role, address, login_token, now, &mut io)
                        .map_err(Into::into),
                    None => Err(LinkforgeError::UnknownIdentity(local)),
                };
                let _ = reply.send(result);
            }
            LoopCommand::Listen {
                local,
                address,
                reply,
            } => {
                let result = self.listen(local, &address).await;
                let _ = reply.send(result);
            }
            LoopCommand::Send {
                session,
                payload,
                reply,
            } => {
                let (identities, mut io) = self.split();
                let result = Manager::locate(identities, session).and_then(|manager| {
                    Ok(manager.send(session.remote, payload, now, &mut io)?)
                });
                let _ = reply.send(result);
            }
            LoopCommand::Call {
                session,
                call,
                completion,
                reply,
            } => {
                let (identities, mut io) = self.split();
                let result = match Manager::locate(identities, session) {
                    Ok(manager) => manager
                        .call(session.remote, call, completion, now, &mut io)
                        .map_err(Into::into),
                    Err(e) => {
                        completion.complete(RpcOutcome::failed(RpcResultCode::SessionClosed));
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            LoopCommand::Remove {
                session,
                reason,
                reply,
            } => {
                let (identities, mut io) = self.split();
                let result = match Manager::locate(identities, session) {
                    Ok(manager) => Ok(manager.remove(
                        session.remote,
                        CloseReason::Requested(reason),
                        now,
                        &mut io,
                    )),
                    Err(LinkforgeError::Session(SessionError::NotFound(_))) => {
                        Ok(RemoveOutcome::AlreadyAbsent)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            LoopCommand::RemoveAll {
                local,
                reason,
                reply,
            } => {
                let (identities, mut io) = self.split();
                let result = match identities.get_mut(&local) {
                    Some(identity) => {
                        let reason = CloseReason::Requested(reason);
                        let initiated = identity.connector.remove_all(reason.clone(), &mut io);
                        let accepted = identity.acceptor.remove_all(reason, now, &mut io);
                        Ok(initiated + accepted)
                    }
                    None => Err(LinkforgeError::UnknownIdentity(local)),
                };
                let _ = reply.send(result);
            }
            LoopCommand::IssueLoginToken {
                local,
                client,
                client_role,
                reply,
            } => {
                let result = match self.identities.get(&local) {
                    Some(identity) => {
                        let authority = identity.acceptor.authority();
                        let token = authority.issue_login_token(
                            client,
                            client_role,
                            local,
                            identity.acceptor.local_role(),
                            now,
                        );
                        Ok(authority.encrypt(&token))
                    }
                    None => Err(LinkforgeError::UnknownIdentity(local)),
                };
                let _ = reply.send(result);
            }
            LoopCommand::Sessions { local, reply } => {
                let result = match self.identities.get(&local) {
                    Some(identity) => {
                        let mut infos: Vec<SessionInfo> = identity
                            .connector
                            .sessions()
                            .chain(identity.acceptor.sessions())
                            .cloned()
                            .collect();
                        infos.sort_by_key(|info| info.remote_id);
                        Ok(infos)
                    }
                    None => Err(LinkforgeError::UnknownIdentity(local)),
                };
                let _ = reply.send(result);
            }
            LoopCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            // Handled in `run`, which has to leave the loop.
            LoopCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn listen(&mut self, local: PeerId, address: &str) -> Result<SocketAddr, LinkforgeError> {
        let identity = self
            .identities
            .get_mut(&local)
            .ok_or(LinkforgeError::UnknownIdentity(local))?;
        let (listener, bound) = self.hub.listen(address).await?;
        identity.acceptor.add_listener(listener);
        tracing::info!(%local, %bound, "identity listening");
        Ok(bound)
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let now = loop_now();
        let (identities, mut io) = self.split();
        match event {
            TransportEvent::Accepted { listener, channel } => {
                match identities
                    .values_mut()
                    .find(|identity| identity.acceptor.owns_listener(listener))
                {
                    Some(identity) => identity.acceptor.on_accepted(channel, now),
                    None => {
                        tracing::debug!(%listener, %channel, "channel on a released listener, closing");
                        io.sink.close_quietly(channel);
                    }
                }
            }
            TransportEvent::Opened(channel) => match channel_owner(identities, channel) {
                Some((local, Side::Initiator)) => {
                    if let Some(identity) = identities.get_mut(&local) {
                        identity.connector.on_opened(channel, now, &mut io);
                    }
                }
                _ => {
                    tracing::debug!(%channel, "nobody waits for this channel, closing");
                    io.sink.close_quietly(channel);
                }
            },
            TransportEvent::OpenFailed { channel, reason } => {
                if let Some((local, Side::Initiator)) = channel_owner(identities, channel) {
                    if let Some(identity) = identities.get_mut(&local) {
                        identity.connector.on_open_failed(channel, &reason, now, &mut io);
                    }
                }
            }
            TransportEvent::Frame { channel, data } => match channel_owner(identities, channel) {
                Some((local, side)) => {
                    if let Some(identity) = identities.get_mut(&local) {
                        match side {
                            Side::Initiator => identity.connector.on_frame(channel, &data, now, &mut io),
                            Side::Acceptor => identity.acceptor.on_frame(channel, &data, now, &mut io),
                        }
                    }
                }
                None => tracing::trace!(%channel, "frame on an unowned channel dropped"),
            },
            TransportEvent::Closed(channel) => {
                if let Some((local, side)) = channel_owner(identities, channel) {
                    if let Some(identity) = identities.get_mut(&local) {
                        match side {
                            Side::Initiator => identity.connector.on_closed(channel, now, &mut io),
                            Side::Acceptor => identity.acceptor.on_closed(channel),
                        }
                    }
                }
            }
        }
    }

    fn on_reply(&mut self, reply: PostedReply) {
        let now = loop_now();
        let (identities, mut io) = self.split();
        let Some(identity) = identities.get_mut(&reply.session.local) else {
            tracing::debug!(session = %reply.session, "reply for an unknown identity dropped");
            return;
        };
        let manager = match reply.side {
            Side::Initiator => Manager::Connector(&mut identity.connector),
            Side::Acceptor => Manager::Acceptor(&mut identity.acceptor),
        };
        manager.respond(reply.session.remote, reply.response, now, &mut io);
    }

    fn on_tick(&mut self, now: Instant) {
        let (identities, mut io) = self.split();
        for identity in identities.values_mut() {
            identity.connector.tick(now, &mut io);
            identity.acceptor.tick(now, &mut io);
        }
    }

    fn shutdown(&mut self) {
        let now = loop_now();
        let (identities, mut io) = self.split();
        let mut removed = 0;
        for identity in identities.values_mut() {
            let reason = CloseReason::Requested("node shutdown".into());
            removed += identity.connector.remove_all(reason.clone(), &mut io);
            removed += identity.acceptor.remove_all(reason, now, &mut io);
        }
        self.hub.shutdown();
        tracing::info!(removed, "session loop shutting down");
    }

    fn stats(&self) -> LoopStats {
        LoopStats {
            identities: self.identities.len(),
            initiated: self.identities.values().map(|i| i.connector.len()).sum(),
            accepted: self.identities.values().map(|i| i.acceptor.len()).sum(),
            ticks: self.ticker.tick_count(),
        }
    }
}

/// The identity and side whose manager currently owns `channel`.
fn channel_owner(
    identities: &BTreeMap<PeerId, Identity>,
    channel: ChannelId,
) -> Option<(PeerId, Side)> {
    identities.iter().find_map(|(local, identity)| {
        if identity.connector.owns_channel(channel) {
            Some((*local, Side::Initiator))
        } else if identity.acceptor.owns_channel(channel) {
            Some((*local, Side::Acceptor))
        } else {
            None
        }
    })
}

/// Spawns the session loop and returns a handle to it.
///
/// `channel_size` bounds the command channel; handles wait when it is full.
pub(crate) fn spawn_loop(
    identities: BTreeMap<PeerId, Identity>,
    registry: RpcRegistry,
    ticker: TickerConfig,
    channel_size: usize,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> LoopHandle {
    let (tx, rx) = mpsc::channel(channel_size);
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (replies_tx, replies_rx) = mpsc::unbounded_channel();

    let actor = SessionLoop {
        identities,
        hub: WebSocketHub::spawn(transport_tx),
        codec: JsonCodec,
        rpc: RpcDispatcher::new(registry, replies_tx),
        listener: EventForwarder::new(events),
        ticker: LoopTicker::new(ticker),
        commands: rx,
        transport: transport_rx,
        replies: replies_rx,
    };

    tokio::spawn(actor.run());

    LoopHandle { sender: tx }
}

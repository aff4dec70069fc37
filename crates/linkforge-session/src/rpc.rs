//! RPC dispatch and promise completion.
//!
//! Two directions:
//!
//! - **Inbound calls**: a committed [`RpcRequest`] is routed by its numeric
//!   method key to a handler from the [`RpcRegistry`]. The handler gets a
//!   [`Responder`] it can complete right away or later, from any thread.
//!   The answer is posted back to the session loop as a [`PostedReply`]
//!   carrying only ids, never a reference to the session.
//! - **Outbound calls**: each call leaves a [`PendingRpc`] in the session's
//!   queue. A response, the deadline, or session removal completes it
//!   through the same [`RpcCompletion`], so callers only ever see a result
//!   code.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use linkforge_protocol::{RpcRequest, RpcResponse, RpcResultCode};
use tokio::sync::{mpsc, oneshot};

use crate::{SessionError, SessionKey, Side};

// ---------------------------------------------------------------------------
// Outbound: promises
// ---------------------------------------------------------------------------

/// How an RPC call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcOutcome {
    pub code: RpcResultCode,
    pub body: Option<Vec<u8>>,
}

impl RpcOutcome {
    /// An outcome with no body, e.g. `TIMEOUT` or `SESSION_CLOSED`.
    pub fn failed(code: RpcResultCode) -> Self {
        Self { code, body: None }
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

impl From<RpcResponse> for RpcOutcome {
    fn from(response: RpcResponse) -> Self {
        Self {
            code: response.code,
            body: response.body,
        }
    }
}

/// Where an outcome goes.
pub enum RpcCompletion {
    /// Await it, or `blocking_recv` from a non-async thread.
    Promise(oneshot::Sender<RpcOutcome>),
    /// Runs on the session loop.
    Callback(Box<dyn FnOnce(RpcOutcome) + Send>),
}

impl RpcCompletion {
    pub fn promise() -> (Self, oneshot::Receiver<RpcOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self::Promise(tx), rx)
    }

    pub fn callback(f: impl FnOnce(RpcOutcome) + Send + 'static) -> Self {
        Self::Callback(Box::new(f))
    }

    pub fn complete(self, outcome: RpcOutcome) {
        match self {
            // The caller may have stopped waiting; that's fine.
            Self::Promise(tx) => {
                let _ = tx.send(outcome);
            }
            Self::Callback(f) => f(outcome),
        }
    }
}

impl fmt::Debug for RpcCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Promise(_) => f.write_str("Promise"),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// A call the application wants to make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCall {
    pub method_key: i32,
    /// Each parameter already encoded with the node's codec.
    pub params: Vec<Vec<u8>>,
    /// Flush right away and complete as soon as the response is accepted.
    pub sync: bool,
    /// Falls back to `rpc_timeout_ms` when `None`.
    pub timeout: Option<Duration>,
}

impl OutboundCall {
    pub fn new(method_key: i32, params: Vec<Vec<u8>>) -> Self {
        Self {
            method_key,
            params,
            sync: false,
            timeout: None,
        }
    }

    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// An outstanding local call.
#[derive(Debug)]
pub struct PendingRpc {
    pub deadline: Instant,
    /// Sync calls are completed as soon as their response is accepted
    /// instead of waiting for the next commit.
    pub sync: bool,
    pub completion: RpcCompletion,
}

// ---------------------------------------------------------------------------
// Inbound: handlers
// ---------------------------------------------------------------------------

/// An inbound call as seen by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    pub session: SessionKey,
    pub request_id: u64,
    pub method_key: i32,
    pub sync: bool,
    pub params: Vec<Vec<u8>>,
}

/// Handles calls for one method key.
///
/// Runs on the session loop, so it must not block. Long work should move
/// the [`Responder`] into a task and answer from there.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(&self, call: RpcCall, responder: Responder);
}

impl<F> RpcHandler for F
where
    F: Fn(RpcCall, Responder) + Send + Sync + 'static,
{
    fn handle(&self, call: RpcCall, responder: Responder) {
        self(call, responder)
    }
}

/// Method key → handler table, fixed before the loop starts.
#[derive(Default)]
pub struct RpcRegistry {
    handlers: HashMap<i32, Box<dyn RpcHandler>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// [`SessionError::DuplicateMethod`] if `method_key` is taken.
    pub fn register(
        &mut self,
        method_key: i32,
        handler: impl RpcHandler,
    ) -> Result<(), SessionError> {
        if self.handlers.contains_key(&method_key) {
            return Err(SessionError::DuplicateMethod(method_key));
        }
        self.handlers.insert(method_key, Box::new(handler));
        Ok(())
    }

    pub fn contains(&self, method_key: i32) -> bool {
        self.handlers.contains_key(&method_key)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for RpcRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("RpcRegistry").field("methods", &keys).finish()
    }
}

/// A response on its way back to the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedReply {
    pub session: SessionKey,
    /// Which manager of `session.local` owns the session.
    pub side: Side,
    pub response: RpcResponse,
}

/// Routes committed requests to handlers.
#[derive(Debug)]
pub struct RpcDispatcher {
    registry: RpcRegistry,
    replies: mpsc::UnboundedSender<PostedReply>,
}

impl RpcDispatcher {
    /// `replies` is drained by the session loop, which enqueues each
    /// response on its session.
    pub fn new(registry: RpcRegistry, replies: mpsc::UnboundedSender<PostedReply>) -> Self {
        Self { registry, replies }
    }

    pub fn dispatch(&self, session: SessionKey, side: Side, request: RpcRequest) {
        let responder = Responder {
            session,
            side,
            request_id: request.request_id,
            replies: self.replies.clone(),
            answered: false,
        };
        match self.registry.handlers.get(&request.method_key) {
            Some(handler) => handler.handle(
                RpcCall {
                    session,
                    request_id: request.request_id,
                    method_key: request.method_key,
                    sync: request.sync,
                    params: request.params,
                },
                responder,
            ),
            None => {
                tracing::debug!(
                    %session,
                    method_key = request.method_key,
                    "no handler registered"
                );
                responder.respond(RpcResultCode::MethodNotFound, None);
            }
        }
    }
}

/// Completes one inbound call.
///
/// `Send`, so it can be moved to another task or thread. Dropping it
/// without answering answers `HANDLER_ERROR`, so the caller is never left
/// waiting for its full timeout because a handler forgot.
#[derive(Debug)]
pub struct Responder {
    session: SessionKey,
    side: Side,
    request_id: u64,
    replies: mpsc::UnboundedSender<PostedReply>,
    answered: bool,
}

impl Responder {
    pub fn session(&self) -> SessionKey {
        self.session
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Answers `SUCCESS` with `body`.
    pub fn reply(self, body: Vec<u8>) {
        self.respond(RpcResultCode::Success, Some(body));
    }

    /// Answers with a failure code and no body.
    pub fn fail(self, code: RpcResultCode) {
        self.respond(code, None);
    }

    pub fn respond(mut self, code: RpcResultCode, body: Option<Vec<u8>>) {
        self.answered = true;
        self.post(code, body);
    }

    fn post(&self, code: RpcResultCode, body: Option<Vec<u8>>) {
        let reply = PostedReply {
            session: self.session,
            side: self.side,
            response: RpcResponse {
                request_id: self.request_id,
                code,
                body,
            },
        };
        if self.replies.send(reply).is_err() {
            tracing::debug!(session = %self.session, "session loop gone, reply dropped");
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.answered {
            tracing::warn!(
                session = %self.session,
                request_id = self.request_id,
                "responder dropped without an answer"
            );
            self.post(RpcResultCode::HandlerError, None);
        }
    }
}

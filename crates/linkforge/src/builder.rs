//! `NodeBuilder` and the running `Node`.
//!
//! This is the entry point for running a Linkforge node. It ties together
//! all the layers: transport → protocol → session → loop.

use std::collections::BTreeMap;

use linkforge_protocol::{PeerId, Role};
use linkforge_session::{RpcHandler, RpcRegistry, SessionConfig, SessionError, TokenClock};
use linkforge_tick::TickerConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::session_loop::{loop_now, spawn_loop, Identity};
use crate::{LinkforgeError, LoopHandle, SessionEvent};

/// One local identity hosted by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub id: PeerId,
    pub role: Role,
}

/// Everything needed to start a node, in a form that embeds in an
/// application config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub session: SessionConfig,
    pub identities: Vec<IdentityConfig>,
    /// Capacity of the command channel into the session loop.
    pub command_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            identities: Vec::new(),
            command_buffer: 256,
        }
    }
}

impl NodeConfig {
    /// Clamp out-of-range values.
    pub fn validated(mut self) -> Self {
        self.session = self.session.validated();
        self.command_buffer = self.command_buffer.max(1);
        self
    }
}

/// Builder for configuring and starting a Linkforge node.
///
/// # Example
///
/// ```rust,ignore
/// use linkforge::prelude::*;
///
/// let mut node = Node::builder()
///     .identity(PeerId(100), Role::Game)
///     .rpc(1, |call: RpcCall, responder: Responder| responder.reply(call.params.concat()))
///     .start()?;
/// let addr = node.handle().listen(PeerId(100), "0.0.0.0:7000").await?;
/// while let Some(event) = node.next_event().await {
///     // ...
/// }
/// ```
#[derive(Debug)]
pub struct NodeBuilder {
    config: NodeConfig,
    ticker: Option<TickerConfig>,
    registry: RpcRegistry,
    /// First registration error, reported by `start`.
    registry_error: Option<SessionError>,
}

impl NodeBuilder {
    /// Creates a new builder with default settings and no identities.
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            ticker: None,
            registry: RpcRegistry::new(),
            registry_error: None,
        }
    }

    /// Replaces the whole node configuration, identities included.
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the session configuration.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    /// Adds a local identity.
    pub fn identity(mut self, id: PeerId, role: Role) -> Self {
        self.config.identities.push(IdentityConfig { id, role });
        self
    }

    /// Overrides the ticker. By default it ticks every `tick_interval_ms`.
    pub fn ticker(mut self, ticker: TickerConfig) -> Self {
        self.ticker = Some(ticker);
        self
    }

    /// Registers the handler for `method_key`. A duplicate key makes
    /// [`start`](Self::start) fail.
    pub fn rpc(mut self, method_key: i32, handler: impl RpcHandler) -> Self {
        if let Err(e) = self.registry.register(method_key, handler) {
            self.registry_error.get_or_insert(e);
        }
        self
    }

    /// Spawns the session loop (and its transport hub) on the current
    /// Tokio runtime.
    ///
    /// # Errors
    /// A duplicate identity or RPC key, or an unusable token key.
    ///
    /// # Panics
    /// When called outside a Tokio runtime.
    pub fn start(self) -> Result<Node, LinkforgeError> {
        if let Some(e) = self.registry_error {
            return Err(e.into());
        }
        let config = self.config.validated();
        if config.identities.is_empty() {
            tracing::warn!("starting a node without local identities");
        }

        let clock = TokenClock::system(loop_now());
        let mut identities = BTreeMap::new();
        for IdentityConfig { id, role } in &config.identities {
            if identities.contains_key(id) {
                return Err(LinkforgeError::DuplicateIdentity(*id));
            }
            identities.insert(*id, Identity::new(*id, *role, &config.session, clock)?);
        }

        let ticker = self
            .ticker
            .unwrap_or_else(|| TickerConfig::with_interval(config.session.tick_interval()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = spawn_loop(
            identities,
            self.registry,
            ticker,
            config.command_buffer,
            events_tx,
        );

        Ok(Node {
            handle,
            events: events_rx,
        })
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running node: a handle to its session loop plus its event stream.
#[derive(Debug)]
pub struct Node {
    handle: LoopHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Node {
    /// Creates a new builder.
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    /// A handle to the session loop. Clone it freely.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// The next session event. `None` once the loop has stopped.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (LoopHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        (self.handle, self.events)
    }
}

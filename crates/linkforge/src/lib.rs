//! # Linkforge
//!
//! Reliable, reconnecting sessions between game server nodes.
//!
//! A node hosts one or more local identities (a gateway, a game server, a
//! world server...). Each identity can open sessions to other nodes and
//! accept sessions from them. A session survives transport drops: messages
//! are sequenced and acknowledged, the initiator reconnects with a fresh
//! token, and anything the peer never acknowledged is sent again.
//!
//! ## Layers
//!
//! ```text
//! linkforge            ← session loop actor, handle, builder (this crate)
//! linkforge-session    ← queue, tokens, state machines, lifecycle, RPC
//! linkforge-tick       ← fixed-interval lifecycle tick
//! linkforge-protocol   ← frames and codec
//! linkforge-transport  ← channel ids, FrameSink, WebSocket hub
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use linkforge::prelude::*;
//!
//! # async fn run() -> Result<(), LinkforgeError> {
//! linkforge::init_tracing();
//!
//! let mut node = Node::builder()
//!     .identity(PeerId(1), Role::Gateway)
//!     .start()?;
//! let handle = node.handle();
//! // The login token normally comes from a login service.
//! # let login_token = Vec::new();
//! handle
//!     .connect(PeerId(1), PeerId(100), Role::Game, "127.0.0.1:7000", login_token)
//!     .await?;
//!
//! while let Some(event) = node.next_event().await {
//!     if let SessionEvent::Connected(info) = event {
//!         handle.send(info.key(), b"hello".to_vec()).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod builder;
mod error;
mod event;
mod session_loop;

pub use builder::{IdentityConfig, Node, NodeBuilder, NodeConfig};
pub use error::LinkforgeError;
pub use event::SessionEvent;
pub(crate) use event::EventForwarder;
pub use session_loop::{LoopHandle, LoopStats};

pub use linkforge_protocol as protocol;
pub use linkforge_session as session;
pub use linkforge_tick as tick;
pub use linkforge_transport as transport;

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Everything an application usually needs.
pub mod prelude {
    pub use crate::{
        IdentityConfig, LinkforgeError, LoopHandle, LoopStats, Node, NodeBuilder, NodeConfig,
        SessionEvent,
    };
    pub use linkforge_protocol::{PeerId, RejectReason, Role, RpcResultCode};
    pub use linkforge_session::{
        CloseReason, OutboundCall, RemoveOutcome, Responder, RpcCall, RpcOutcome, SessionConfig,
        SessionInfo, SessionKey, Side,
    };
    pub use linkforge_tick::TickerConfig;
}

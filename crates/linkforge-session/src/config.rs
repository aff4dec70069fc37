//! Session configuration.
//!
//! Every timer and limit the state machines use lives here. The struct
//! derives serde with `#[serde(default)]` so it can be embedded in an
//! application's own config file and only the overridden keys need to be
//! present.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Key used when none is configured. Only obfuscates; see [`crate::TokenCipher`].
pub const DEFAULT_TOKEN_KEY: &[u8] = b"linkforge-session-token";

/// Per-side ceiling on `sent + unsent` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLimits {
    /// Limit for sessions this node initiated.
    pub initiator: usize,
    /// Limit for sessions this node accepted.
    pub acceptor: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            initiator: 10_000,
            acceptor: 10_000,
        }
    }
}

/// Configuration for session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a sent message may stay unacknowledged before the
    /// initiator forces a reconnect.
    pub ack_timeout_ms: u64,

    /// Inactivity after which a session is removed ("timed out").
    pub session_timeout_secs: u64,

    /// Per-attempt limit for opening a transport channel.
    pub connect_timeout_ms: u64,

    /// Consecutive failed connect attempts tolerated before the initiator
    /// gives up and removes the session.
    pub connect_max_retries: u32,

    /// How long the initiator waits for a `ConnectResponse`, and how long
    /// the acceptor waits for the first message on a freshly verified
    /// channel (or for a handshake on a freshly accepted one).
    pub wait_token_result_timeout_ms: u64,

    /// Maximum age of a generation-0 (login) token.
    pub login_token_timeout_secs: u64,

    /// Number of buffered outbound messages that triggers a flush.
    /// 0 (or 1) flushes on every send.
    pub flush_threshold: usize,

    pub max_cache_messages: CacheLimits,

    /// How long a superseded token generation stays forbidden.
    pub forbidden_token_window_secs: u64,

    /// Default deadline for RPC calls that don't pass their own.
    pub rpc_timeout_ms: u64,

    /// Repeating XOR key for token records. Both sides of a handshake
    /// (and any login service minting tokens) must share it.
    pub token_key: Vec<u8>,

    /// Period of the lifecycle tick.
    pub tick_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            session_timeout_secs: 60,
            connect_timeout_ms: 5_000,
            connect_max_retries: 5,
            wait_token_result_timeout_ms: 5_000,
            login_token_timeout_secs: 60,
            flush_threshold: 0,
            max_cache_messages: CacheLimits::default(),
            forbidden_token_window_secs: 300,
            rpc_timeout_ms: 10_000,
            token_key: DEFAULT_TOKEN_KEY.to_vec(),
            tick_interval_ms: 50,
        }
    }
}

impl SessionConfig {
    /// Longest tick period accepted; anything slower makes the timers
    /// above meaningless.
    pub const MAX_TICK_INTERVAL_MS: u64 = 1_000;

    /// Clamp and fix any out-of-range values so the config is safe to use.
    ///
    /// Rules:
    /// - every timeout is at least 1 (ms or s, per field);
    /// - cache limits are at least 1;
    /// - `tick_interval_ms` is in `1..=MAX_TICK_INTERVAL_MS`;
    /// - an empty `token_key` is replaced by [`DEFAULT_TOKEN_KEY`].
    pub fn validated(mut self) -> Self {
        self.ack_timeout_ms = self.ack_timeout_ms.max(1);
        self.session_timeout_secs = self.session_timeout_secs.max(1);
        self.connect_timeout_ms = self.connect_timeout_ms.max(1);
        self.wait_token_result_timeout_ms = self.wait_token_result_timeout_ms.max(1);
        self.login_token_timeout_secs = self.login_token_timeout_secs.max(1);
        self.forbidden_token_window_secs = self.forbidden_token_window_secs.max(1);
        self.rpc_timeout_ms = self.rpc_timeout_ms.max(1);
        self.max_cache_messages.initiator = self.max_cache_messages.initiator.max(1);
        self.max_cache_messages.acceptor = self.max_cache_messages.acceptor.max(1);
        if self.tick_interval_ms == 0 || self.tick_interval_ms > Self::MAX_TICK_INTERVAL_MS {
            tracing::warn!(
                tick_interval_ms = self.tick_interval_ms,
                "tick_interval_ms out of range, clamping"
            );
            self.tick_interval_ms = self.tick_interval_ms.clamp(1, Self::MAX_TICK_INTERVAL_MS);
        }
        if self.token_key.is_empty() {
            tracing::warn!("empty token_key, falling back to the default key");
            self.token_key = DEFAULT_TOKEN_KEY.to_vec();
        }
        self
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn wait_token_result_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_token_result_timeout_ms)
    }

    pub fn login_token_timeout(&self) -> Duration {
        Duration::from_secs(self.login_token_timeout_secs)
    }

    pub fn forbidden_token_window(&self) -> Duration {
        Duration::from_secs(self.forbidden_token_window_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_already_valid() {
        let config = SessionConfig::default();
        assert_eq!(config.clone().validated(), config);
    }

    #[test]
    fn test_validated_clamps_zero_timeouts() {
        let config = SessionConfig {
            ack_timeout_ms: 0,
            session_timeout_secs: 0,
            rpc_timeout_ms: 0,
            max_cache_messages: CacheLimits {
                initiator: 0,
                acceptor: 0,
            },
            ..Default::default()
        }
        .validated();
        assert_eq!(config.ack_timeout_ms, 1);
        assert_eq!(config.session_timeout_secs, 1);
        assert_eq!(config.rpc_timeout_ms, 1);
        assert_eq!(config.max_cache_messages.initiator, 1);
        assert_eq!(config.max_cache_messages.acceptor, 1);
    }

    #[test]
    fn test_validated_clamps_tick_interval() {
        let slow = SessionConfig {
            tick_interval_ms: 60_000,
            ..Default::default()
        }
        .validated();
        assert_eq!(slow.tick_interval_ms, SessionConfig::MAX_TICK_INTERVAL_MS);

        let zero = SessionConfig {
            tick_interval_ms: 0,
            ..Default::default()
        }
        .validated();
        assert_eq!(zero.tick_interval_ms, 1);
    }

    #[test]
    fn test_validated_replaces_empty_token_key() {
        let config = SessionConfig {
            token_key: Vec::new(),
            ..Default::default()
        }
        .validated();
        assert_eq!(config.token_key, DEFAULT_TOKEN_KEY);
    }

    #[test]
    fn test_deserialize_partial_json_uses_defaults() {
        let json = r#"{ "ack_timeout_ms": 250, "max_cache_messages": { "acceptor": 8 } }"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.ack_timeout_ms, 250);
        assert_eq!(config.max_cache_messages.acceptor, 8);
        assert_eq!(config.max_cache_messages.initiator, 10_000);
        assert_eq!(config.session_timeout_secs, 60);
    }

    #[test]
    fn test_duration_helpers() {
        let config = SessionConfig::default();
        assert_eq!(config.ack_timeout(), Duration::from_secs(10));
        assert_eq!(config.session_timeout(), Duration::from_secs(60));
        assert_eq!(config.tick_interval(), Duration::from_millis(50));
    }
}

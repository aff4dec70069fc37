//! Wire types for Linkforge sessions.
//!
//! Everything in this module is serialized onto a transport channel. There
//! are two layers:
//!
//! - [`Frame`]: what one transport write carries, either a handshake message or
//!   one or more sequenced [`MessageBody`] values with a piggybacked ack.
//! - [`MessageBody`]: what the session layer sequences: one-way payloads,
//!   RPC requests/responses, and heartbeats.
//!
//! Application payloads (`payload`, `params`, `body`) are opaque bytes
//! here. The node encodes them with its [`Codec`](crate::Codec) before they
//! enter a body.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifier of a node taking part in sessions (a client, a gateway, a
/// game server...).
///
/// Sessions are keyed by the pair (local `PeerId`, remote `PeerId`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N-{}", self.0)
    }
}

/// The role a node plays. Carried inside tokens as a 32-bit code.
///
/// `Invalid` never names a real node: a token carrying it is a "fail"
/// token that can never validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Invalid,
    Client,
    Gateway,
    Login,
    Game,
    World,
}

impl Role {
    /// The code written into the token record.
    pub fn code(self) -> i32 {
        match self {
            Self::Invalid => 0,
            Self::Client => 1,
            Self::Gateway => 2,
            Self::Login => 3,
            Self::Game => 4,
            Self::World => 5,
        }
    }

    /// Maps a token record code back to a role. Unknown codes yield `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Invalid),
            1 => Some(Self::Client),
            2 => Some(Self::Gateway),
            3 => Some(Self::Login),
            4 => Some(Self::Game),
            5 => Some(Self::World),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invalid => "invalid",
            Self::Client => "client",
            Self::Gateway => "gateway",
            Self::Login => "login",
            Self::Game => "game",
            Self::World => "world",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Handshake rejection
// ---------------------------------------------------------------------------

/// Why an acceptor refused a connect request.
///
/// None of these mean the existing session is compromised. The acceptor
/// answers with the reason and closes the offending channel; the live
/// session (if any) is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// The token names a server other than the one receiving it.
    ServerNotExist,
    /// The token could not be decrypted, or it is a fail token.
    TokenInvalid,
    /// The token belongs to another client or server role.
    TokenNotMatchRequest,
    /// The token generation has been superseded.
    StaleToken,
    /// The presented ack is outside what this side has sent.
    AckError,
    /// The request arrived on the channel the session already uses.
    SameChannel,
    /// No session exists and the token is not a login token.
    NotLoginToken,
    /// The login token is older than the configured TTL.
    LoginTokenExpired,
    /// The attempt counter did not increase since the last handshake.
    StaleRequest,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::ServerNotExist => "SERVER_NOT_EXIST",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::TokenNotMatchRequest => "TOKEN_NOT_MATCH_REQUEST",
            Self::StaleToken => "STALE_TOKEN",
            Self::AckError => "ACK_ERROR",
            Self::SameChannel => "SAME_CHANNEL",
            Self::NotLoginToken => "NOT_LOGIN_TOKEN",
            Self::LoginTokenExpired => "LOGIN_TOKEN_EXPIRED",
            Self::StaleRequest => "STALE_REQUEST",
        };
        f.write_str(code)
    }
}

// ---------------------------------------------------------------------------
// RPC envelopes
// ---------------------------------------------------------------------------

/// Result code of an RPC call.
///
/// `Timeout` and `SessionClosed` are produced locally and travel through
/// the same completion path as a real response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcResultCode {
    Success,
    MethodNotFound,
    BadRequest,
    HandlerError,
    Timeout,
    SessionClosed,
}

impl RpcResultCode {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for RpcResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::Success => "SUCCESS",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::BadRequest => "BAD_REQUEST",
            Self::HandlerError => "HANDLER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::SessionClosed => "SESSION_CLOSED",
        };
        f.write_str(code)
    }
}

/// An RPC call travelling to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Per-session, monotonically increasing.
    pub request_id: u64,
    /// Sync requests skip the inbound commit batch on the receiving side.
    pub sync: bool,
    pub method_key: i32,
    /// Each parameter encoded separately by the caller's codec.
    pub params: Vec<Vec<u8>>,
}

/// The answer to an [`RpcRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub request_id: u64,
    pub code: RpcResultCode,
    pub body: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// MessageBody: what gets sequenced
// ---------------------------------------------------------------------------

/// One sequenced message.
///
/// Every body (heartbeats included) consumes one sequence number, so the
/// receiver's ack covers it like any other message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MessageBody {
    /// Fire-and-forget application payload.
    OneWay { payload: Vec<u8> },
    Request(RpcRequest),
    Response(RpcResponse),
    /// Initiator heartbeat asking for an ack.
    Ping,
    /// Acceptor answer to a [`MessageBody::Ping`].
    Pong,
}

impl MessageBody {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }
}

/// Which way a heartbeat frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatKind {
    Ping,
    Pong,
}

// ---------------------------------------------------------------------------
// Frame: what one transport write carries
// ---------------------------------------------------------------------------

/// A complete frame on a transport channel.
///
/// `#[serde(tag = "type")]` gives `{ "type": "Single", "ack": 3, ... }`,
/// which keeps frames readable in a packet capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initiator → acceptor: "resume (or start) my session".
    ConnectRequest {
        sender_id: PeerId,
        /// Increases with every request the initiator sends.
        attempt_counter: i32,
        /// Highest acceptor sequence the initiator has accepted.
        ack: u64,
        encrypted_token: Vec<u8>,
    },

    /// Acceptor → initiator: the verdict on a `ConnectRequest`.
    ///
    /// Also sent unsolicited, with a fail token, when the acceptor kicks a
    /// session so the initiator stops reconnecting.
    ConnectResponse {
        attempt_counter: i32,
        success: bool,
        /// Highest initiator sequence the acceptor has accepted.
        ack: u64,
        /// The next token. Present only on success.
        encrypted_token: Option<Vec<u8>>,
        /// Present only on failure.
        reject: Option<RejectReason>,
    },

    /// Exactly one non-heartbeat body.
    Single {
        ack: u64,
        sequence: u64,
        body: MessageBody,
    },

    /// Two or more bodies with consecutive sequences starting at
    /// `first_sequence`. Equivalent to that many `Single` frames.
    Batch {
        ack: u64,
        first_sequence: u64,
        bodies: Vec<MessageBody>,
    },

    /// A lone sequenced heartbeat with no payload.
    Heartbeat {
        ack: u64,
        sequence: u64,
        kind: HeartbeatKind,
    },
}

impl Frame {
    /// Builds the data frame for `bodies`, numbered from `first_sequence`.
    ///
    /// One body becomes `Single` (or `Heartbeat` for ping/pong); two or
    /// more become `Batch`. Returns `None` for an empty list.
    pub fn data(ack: u64, first_sequence: u64, mut bodies: Vec<MessageBody>) -> Option<Self> {
        match bodies.len() {
            0 => None,
            1 => {
                let body = bodies.pop()?;
                let frame = match body {
                    MessageBody::Ping => Self::Heartbeat {
                        ack,
                        sequence: first_sequence,
                        kind: HeartbeatKind::Ping,
                    },
                    MessageBody::Pong => Self::Heartbeat {
                        ack,
                        sequence: first_sequence,
                        kind: HeartbeatKind::Pong,
                    },
                    body => Self::Single {
                        ack,
                        sequence: first_sequence,
                        body,
                    },
                };
                Some(frame)
            }
            _ => Some(Self::Batch {
                ack,
                first_sequence,
                bodies,
            }),
        }
    }

    /// Unpacks a data frame into `(ack, first_sequence, bodies)`.
    ///
    /// Handshake frames are returned unchanged in `Err`.
    pub fn into_data(self) -> Result<DataFrame, Self> {
        match self {
            Self::Single {
                ack,
                sequence,
                body,
            } => Ok(DataFrame {
                ack,
                first_sequence: sequence,
                bodies: vec![body],
            }),
            Self::Batch {
                ack,
                first_sequence,
                bodies,
            } => Ok(DataFrame {
                ack,
                first_sequence,
                bodies,
            }),
            Self::Heartbeat {
                ack,
                sequence,
                kind,
            } => Ok(DataFrame {
                ack,
                first_sequence: sequence,
                bodies: vec![match kind {
                    HeartbeatKind::Ping => MessageBody::Ping,
                    HeartbeatKind::Pong => MessageBody::Pong,
                }],
            }),
            other => Err(other),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectRequest { .. } => "ConnectRequest",
            Self::ConnectResponse { .. } => "ConnectResponse",
            Self::Single { .. } => "Single",
            Self::Batch { .. } => "Batch",
            Self::Heartbeat { .. } => "Heartbeat",
        }
    }
}

/// The sequenced content of a `Single`, `Batch` or `Heartbeat` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub ack: u64,
    pub first_sequence: u64,
    pub bodies: Vec<MessageBody>,
}

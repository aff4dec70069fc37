//! The per-session reliable message queue.
//!
//! ```text
//!            enqueue            flush_all             on_peer_ack
//!  app ──→ [ unsent ] ──(seq assigned)──→ [ sent ] ──(ack ≥ seq)──→ gone
//!                                            │
//!                                            └── resend() after reconnect
//!
//!  wire ──(seq == ack + 1)──→ [ uncommitted ] ──(commit)──→ app
//! ```
//!
//! Invariants:
//! - `sent` is sorted by sequence and contiguous;
//! - `ack` never decreases;
//! - an entry leaves `sent` only through [`MessageQueue::on_peer_ack`].
//!
//! The queue never touches the transport. Methods that would write return
//! the [`Frame`] to write and the state machine decides whether it can.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use linkforge_protocol::{Frame, MessageBody};

use crate::rpc::PendingRpc;

/// A message written to the transport and not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub sequence: u64,
    /// When it was last written (first flush or latest resend).
    pub sent_at: Instant,
    pub ack_deadline: Instant,
    pub body: MessageBody,
}

/// What a torn-down queue still held.
#[derive(Debug, Default)]
pub struct Drained {
    pub uncommitted: Vec<MessageBody>,
    /// Outstanding RPC promises in request-id order.
    pub promises: Vec<(u64, PendingRpc)>,
    pub sent: usize,
    pub unsent: usize,
}

/// Ordered buffers and counters for one session.
#[derive(Debug)]
pub struct MessageQueue {
    /// Highest remote sequence accepted.
    ack: u64,
    /// Sequence the next flushed message gets.
    next_sequence: u64,
    /// Highest local sequence the peer has acknowledged.
    last_acked: u64,
    sent: VecDeque<SentMessage>,
    unsent: Vec<MessageBody>,
    uncommitted: VecDeque<MessageBody>,
    rpc_promises: BTreeMap<u64, PendingRpc>,
    next_request_id: u64,
    last_flush_at: Option<Instant>,
    flush_threshold: usize,
    ack_timeout: Duration,
}

impl MessageQueue {
    pub fn new(flush_threshold: usize, ack_timeout: Duration) -> Self {
        Self {
            ack: 0,
            next_sequence: 1,
            last_acked: 0,
            sent: VecDeque::new(),
            unsent: Vec::new(),
            uncommitted: VecDeque::new(),
            rpc_promises: BTreeMap::new(),
            next_request_id: 1,
            last_flush_at: None,
            flush_threshold,
            ack_timeout,
        }
    }

    // -- counters -----------------------------------------------------------

    pub fn ack(&self) -> u64 {
        self.ack
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    // -- outbound -----------------------------------------------------------

    /// Buffers `body`. Returns `true` when the buffer has reached the flush
    /// threshold and the caller should flush now.
    pub fn enqueue(&mut self, body: MessageBody) -> bool {
        self.unsent.push(body);
        self.unsent.len() >= self.flush_threshold.max(1)
    }

    /// Numbers every buffered message, moves them to `sent`, and returns the
    /// frame carrying them (single form for one, batch form for more).
    pub fn flush_all(&mut self, now: Instant) -> Option<Frame> {
        if self.unsent.is_empty() {
            return None;
        }
        let first_sequence = self.next_sequence;
        let bodies = std::mem::take(&mut self.unsent);
        for body in &bodies {
            self.sent.push_back(SentMessage {
                sequence: self.next_sequence,
                sent_at: now,
                ack_deadline: now + self.ack_timeout,
                body: body.clone(),
            });
            self.next_sequence += 1;
        }
        self.last_flush_at = Some(now);
        Frame::data(self.ack, first_sequence, bodies)
    }

    /// Drops every sent message the peer's `ack` covers.
    ///
    /// Call only with an ack that passed [`is_ack_valid`](Self::is_ack_valid).
    pub fn on_peer_ack(&mut self, ack: u64) -> usize {
        let mut removed = 0;
        while self.sent.front().is_some_and(|m| m.sequence <= ack) {
            self.sent.pop_front();
            removed += 1;
        }
        self.last_acked = self.last_acked.max(ack);
        removed
    }

    /// Re-arms every unacknowledged message and returns one frame carrying
    /// all of them, oldest first.
    pub fn resend(&mut self, now: Instant) -> Option<Frame> {
        let first_sequence = self.sent.front()?.sequence;
        let mut bodies = Vec::with_capacity(self.sent.len());
        for msg in &mut self.sent {
            msg.sent_at = now;
            msg.ack_deadline = now + self.ack_timeout;
            bodies.push(msg.body.clone());
        }
        self.last_flush_at = Some(now);
        Frame::data(self.ack, first_sequence, bodies)
    }

    /// `true` iff `ack` lies between what the peer already confirmed and
    /// the last sequence actually sent, inclusive.
    pub fn is_ack_valid(&self, ack: u64) -> bool {
        self.last_acked <= ack && ack < self.next_sequence
    }

    pub fn oldest_ack_deadline(&self) -> Option<Instant> {
        self.sent.front().map(|m| m.ack_deadline)
    }

    pub fn newest_sent_at(&self) -> Option<Instant> {
        self.sent.back().map(|m| m.sent_at)
    }

    pub fn last_flush_at(&self) -> Option<Instant> {
        self.last_flush_at
    }

    pub fn sent(&self) -> impl Iterator<Item = &SentMessage> {
        self.sent.iter()
    }

    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    pub fn unsent_len(&self) -> usize {
        self.unsent.len()
    }

    /// `sent + unsent`, the figure the overflow ceiling applies to.
    pub fn cached_len(&self) -> usize {
        self.sent.len() + self.unsent.len()
    }

    // -- inbound ------------------------------------------------------------

    /// Accepts `sequence` iff it is exactly `ack + 1`, advancing `ack`.
    pub fn accept(&mut self, sequence: u64) -> bool {
        if sequence == self.ack + 1 {
            self.ack = sequence;
            true
        } else {
            false
        }
    }

    pub fn push_uncommitted(&mut self, body: MessageBody) {
        self.uncommitted.push_back(body);
    }

    /// Everything accepted but not yet handed to the application, in
    /// arrival order.
    pub fn take_uncommitted(&mut self) -> Vec<MessageBody> {
        self.uncommitted.drain(..).collect()
    }

    pub fn uncommitted_len(&self) -> usize {
        self.uncommitted.len()
    }

    // -- rpc promises -------------------------------------------------------

    pub fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    pub fn register_rpc(&mut self, request_id: u64, pending: PendingRpc) {
        self.rpc_promises.insert(request_id, pending);
    }

    pub fn take_rpc(&mut self, request_id: u64) -> Option<PendingRpc> {
        self.rpc_promises.remove(&request_id)
    }

    pub fn is_sync_rpc(&self, request_id: u64) -> bool {
        self.rpc_promises.get(&request_id).is_some_and(|p| p.sync)
    }

    pub fn pending_rpcs(&self) -> usize {
        self.rpc_promises.len()
    }

    /// Removes every promise whose deadline has passed, in request-id order.
    ///
    /// A linear scan per tick; promise counts per session stay small.
    pub fn expire_rpcs(&mut self, now: Instant) -> Vec<(u64, PendingRpc)> {
        let expired: Vec<u64> = self
            .rpc_promises
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.rpc_promises.remove(&id).map(|p| (id, p)))
            .collect()
    }

    /// Empties every buffer for teardown.
    pub fn drain(&mut self) -> Drained {
        let sent = self.sent.len();
        let unsent = self.unsent.len();
        self.sent.clear();
        self.unsent.clear();
        Drained {
            uncommitted: self.uncommitted.drain(..).collect(),
            promises: std::mem::take(&mut self.rpc_promises).into_iter().collect(),
            sent,
            unsent,
        }
    }
}

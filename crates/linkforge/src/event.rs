//! Session events delivered to the application.

use linkforge_session::{CloseReason, SessionInfo, SessionKey, SessionListener};
use tokio::sync::mpsc;

/// Something the application should know about, in the order it happened
/// on the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A handshake completed: the first one of an initiated session, or a
    /// first login on the accepting side.
    Connected(SessionInfo),

    /// A session was removed. Nothing more arrives for it.
    Disconnected {
        info: SessionInfo,
        reason: CloseReason,
    },

    /// A one-way payload, delivered in peer send order.
    Message {
        session: SessionKey,
        payload: Vec<u8>,
    },
}

/// Listener that forwards every callback to an unbounded channel.
///
/// Unbounded so a slow consumer never stalls the loop; the application is
/// expected to keep draining it.
#[derive(Debug)]
pub(crate) struct EventForwarder {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl EventForwarder {
    pub(crate) fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { events }
    }

    fn forward(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("event receiver dropped, discarding session event");
        }
    }
}

impl SessionListener for EventForwarder {
    fn on_connected(&mut self, info: &SessionInfo) {
        self.forward(SessionEvent::Connected(info.clone()));
    }

    fn on_disconnected(&mut self, info: &SessionInfo, reason: &CloseReason) {
        self.forward(SessionEvent::Disconnected {
            info: info.clone(),
            reason: reason.clone(),
        });
    }

    fn on_message(&mut self, session: SessionKey, payload: Vec<u8>) {
        self.forward(SessionEvent::Message { session, payload });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkforge_protocol::{PeerId, Role};
    use linkforge_session::{SessionStatus, Side};

    fn info() -> SessionInfo {
        SessionInfo {
            local_id: PeerId(1),
            remote_id: PeerId(2),
            local_role: Role::Gateway,
            remote_role: Role::Game,
            side: Side::Initiator,
            status: SessionStatus::Active,
        }
    }

    #[test]
    fn test_forwarder_preserves_callback_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut forwarder = EventForwarder::new(tx);

        forwarder.on_connected(&info());
        forwarder.on_message(info().key(), b"a".to_vec());
        forwarder.on_disconnected(&info(), &CloseReason::TimedOut);

        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Connected(info()));
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::Message { payload, .. } if payload == b"a"
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::Disconnected { reason: CloseReason::TimedOut, .. }
        ));
    }

    #[test]
    fn test_forwarder_with_dropped_receiver_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut forwarder = EventForwarder::new(tx);
        forwarder.on_message(info().key(), vec![1]);
    }
}

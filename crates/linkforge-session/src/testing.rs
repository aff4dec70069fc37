//! Recording doubles for the unit tests in this crate.

use linkforge_protocol::{Codec, Frame, JsonCodec};
use linkforge_transport::{ChannelId, FrameSink, ListenerId};

use crate::{CloseReason, SessionInfo, SessionKey, SessionListener};

/// A `FrameSink` that remembers everything asked of it.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub written: Vec<(ChannelId, Vec<u8>)>,
    pub closed: Vec<ChannelId>,
    pub opened: Vec<(ChannelId, String)>,
    pub released: Vec<ListenerId>,
    next_channel: u64,
}

impl RecordingSink {
    /// Decodes and clears everything written so far.
    pub fn take_frames(&mut self) -> Vec<(ChannelId, Frame)> {
        self.written
            .drain(..)
            .map(|(ch, bytes)| (ch, JsonCodec.decode::<Frame>(&bytes).expect("valid frame")))
            .collect()
    }

    pub fn last_opened(&self) -> Option<ChannelId> {
        self.opened.last().map(|(ch, _)| *ch)
    }
}

impl FrameSink for RecordingSink {
    fn write_frame(&mut self, channel: ChannelId, frame: Vec<u8>) {
        self.written.push((channel, frame));
    }

    fn close_quietly(&mut self, channel: ChannelId) {
        self.closed.push(channel);
    }

    fn open_channel(&mut self, address: &str) -> ChannelId {
        self.next_channel += 1;
        let channel = ChannelId::new(1_000 + self.next_channel);
        self.opened.push((channel, address.to_string()));
        channel
    }

    fn release_listener(&mut self, listener: ListenerId) {
        self.released.push(listener);
    }
}

/// A `SessionListener` that remembers every callback.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    pub connected: Vec<SessionInfo>,
    pub disconnected: Vec<(SessionKey, CloseReason)>,
    pub messages: Vec<(SessionKey, Vec<u8>)>,
}

impl SessionListener for Recorder {
    fn on_connected(&mut self, info: &SessionInfo) {
        self.connected.push(info.clone());
    }

    fn on_disconnected(&mut self, info: &SessionInfo, reason: &CloseReason) {
        self.disconnected.push((info.key(), reason.clone()));
    }

    fn on_message(&mut self, session: SessionKey, payload: Vec<u8>) {
        self.messages.push((session, payload));
    }
}

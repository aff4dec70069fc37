//! WebSocket transport hub using `tokio-tungstenite`.
//!
//! The hub is a small actor. It owns one writer queue per live channel and
//! one accept task per listener. The session loop talks to it through the
//! [`FrameSink`] methods on [`WebSocketHub`] (which only push commands onto
//! an unbounded channel, so they never block), and hears back through the
//! [`TransportEvent`] channel handed to [`WebSocketHub::spawn`].
//!
//! Each connection is split into a reader task (frames → events) and a
//! writer task (queued frames → socket). Because a close request is queued
//! behind the frames written before it, "write the rejection, then close"
//! delivers the rejection first.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use crate::{ChannelId, FrameSink, ListenerId, TransportError, TransportEvent};

/// Counter for generating unique channel IDs.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Counter for generating unique listener IDs.
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_channel_id() -> ChannelId {
    ChannelId::new(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
}

/// What a connection's writer task can be asked to do.
enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// Commands processed by the hub task.
enum HubCommand {
    Register {
        channel: ChannelId,
        writer: mpsc::UnboundedSender<Outgoing>,
    },
    Unregister {
        channel: ChannelId,
    },
    Write {
        channel: ChannelId,
        frame: Vec<u8>,
    },
    Close {
        channel: ChannelId,
    },
    Open {
        channel: ChannelId,
        address: String,
    },
    AddListener {
        listener: ListenerId,
        task: JoinHandle<()>,
    },
    ReleaseListener {
        listener: ListenerId,
    },
    Shutdown,
}

/// Handle to a running WebSocket hub.
///
/// Cheap to clone; every clone feeds the same hub task.
#[derive(Clone)]
pub struct WebSocketHub {
    commands: mpsc::UnboundedSender<HubCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl WebSocketHub {
    /// Spawns the hub task. Every transport event is sent to `events`.
    pub fn spawn(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_hub(rx, tx.downgrade(), events.clone()));
        Self {
            commands: tx,
            events,
        }
    }

    /// Binds a listening socket and starts accepting WebSocket channels.
    ///
    /// Returns the listener id (for [`FrameSink::release_listener`]) and the
    /// bound address, which is useful when binding to port 0.
    pub async fn listen(
        &self,
        addr: &str,
    ) -> Result<(ListenerId, SocketAddr), TransportError> {
        let listener =
            TcpListener::bind(addr).await.map_err(TransportError::Bind)?;
        let local_addr = listener.local_addr().map_err(TransportError::Bind)?;
        let id =
            ListenerId::new(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));

        let task = tokio::spawn(accept_loop(
            listener,
            id,
            self.commands.clone(),
            self.events.clone(),
        ));
        self.commands
            .send(HubCommand::AddListener { listener: id, task })
            .map_err(|_| TransportError::Shutdown)?;

        tracing::info!(listener = %id, %local_addr, "WebSocket listener bound");
        Ok((id, local_addr))
    }

    /// Stops every listener and closes every channel.
    pub fn shutdown(&self) {
        let _ = self.commands.send(HubCommand::Shutdown);
    }

    fn command(&self, cmd: HubCommand) {
        if self.commands.send(cmd).is_err() {
            tracing::debug!("transport hub is gone, dropping command");
        }
    }
}

impl FrameSink for WebSocketHub {
    fn write_frame(&mut self, channel: ChannelId, frame: Vec<u8>) {
        self.command(HubCommand::Write { channel, frame });
    }

    fn close_quietly(&mut self, channel: ChannelId) {
        self.command(HubCommand::Close { channel });
    }

    fn open_channel(&mut self, address: &str) -> ChannelId {
        let channel = next_channel_id();
        self.command(HubCommand::Open {
            channel,
            address: address.to_string(),
        });
        channel
    }

    fn release_listener(&mut self, listener: ListenerId) {
        self.command(HubCommand::ReleaseListener { listener });
    }
}

/// The hub actor loop.
///
/// Holds only a weak handle to its own command queue so that it stops once
/// every `WebSocketHub` clone and every connection task is gone.
async fn run_hub(
    mut rx: mpsc::UnboundedReceiver<HubCommand>,
    commands: mpsc::WeakUnboundedSender<HubCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut writers: HashMap<ChannelId, mpsc::UnboundedSender<Outgoing>> =
        HashMap::new();
    let mut listeners: HashMap<ListenerId, JoinHandle<()>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Register { channel, writer } => {
                writers.insert(channel, writer);
            }
            HubCommand::Unregister { channel } => {
                writers.remove(&channel);
            }
            HubCommand::Write { channel, frame } => match writers.get(&channel) {
                Some(writer) => {
                    let _ = writer.send(Outgoing::Frame(frame));
                }
                None => {
                    tracing::trace!(%channel, "write to unknown channel dropped");
                }
            },
            HubCommand::Close { channel } => {
                if let Some(writer) = writers.remove(&channel) {
                    let _ = writer.send(Outgoing::Close);
                }
            }
            HubCommand::Open { channel, address } => {
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                tokio::spawn(connect(channel, address, commands, events.clone()));
            }
            HubCommand::AddListener { listener, task } => {
                listeners.insert(listener, task);
            }
            HubCommand::ReleaseListener { listener } => {
                if let Some(task) = listeners.remove(&listener) {
                    task.abort();
                    tracing::info!(%listener, "listener released");
                }
            }
            HubCommand::Shutdown => {
                for (_, task) in listeners.drain() {
                    task.abort();
                }
                for (_, writer) in writers.drain() {
                    let _ = writer.send(Outgoing::Close);
                }
                tracing::info!("transport hub shut down");
                break;
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    id: ListenerId,
    commands: mpsc::UnboundedSender<HubCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(listener = %id, error = %e, "accept failed");
                continue;
            }
        };

        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!(%addr, error = %e, "WebSocket upgrade failed");
                continue;
            }
        };

        let channel = next_channel_id();
        tracing::debug!(%channel, %addr, "accepted WebSocket channel");
        let announce = TransportEvent::Accepted {
            listener: id,
            channel,
        };
        if !spawn_connection(ws, channel, announce, commands.clone(), events.clone()) {
            return;
        }
    }
}

async fn connect(
    channel: ChannelId,
    address: String,
    commands: mpsc::UnboundedSender<HubCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let url = format!("ws://{address}");
    match tokio_tungstenite::connect_async(url).await {
        Ok((ws, _)) => {
            tracing::debug!(%channel, %address, "WebSocket channel opened");
            spawn_connection(ws, channel, TransportEvent::Opened(channel), commands, events);
        }
        Err(e) => {
            let err = TransportError::ConnectFailed {
                address,
                reason: e.to_string(),
            };
            tracing::debug!(%channel, error = %err, "WebSocket open failed");
            let _ = events.send(TransportEvent::OpenFailed {
                channel,
                reason: err.to_string(),
            });
        }
    }
}

/// Splits a WebSocket into a reader and a writer task.
///
/// Order matters: the writer is registered with the hub first, so writes
/// issued in response to `announce` find it; `announce` is emitted before
/// the reader starts, so no `Frame` event can overtake it. Returns `false`
/// if the event receiver is gone.
fn spawn_connection<S>(
    ws: WebSocketStream<S>,
    channel: ChannelId,
    announce: TransportEvent,
    commands: mpsc::UnboundedSender<HubCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
    let _ = commands.send(HubCommand::Register {
        channel,
        writer: writer_tx,
    });
    if events.send(announce).is_err() {
        return false;
    }

    tokio::spawn(async move {
        while let Some(out) = writer_rx.recv().await {
            match out {
                Outgoing::Frame(data) => {
                    if let Err(e) = sink.send(Message::Binary(data.into())).await {
                        tracing::debug!(%channel, error = %e, "send failed");
                        break;
                    }
                }
                Outgoing::Close => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let data = match msg {
                Ok(Message::Binary(data)) => data.to_vec(),
                Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue, // ping/pong/raw frame
                Err(e) => {
                    tracing::debug!(%channel, error = %e, "receive failed");
                    break;
                }
            };
            if events.send(TransportEvent::Frame { channel, data }).is_err() {
                break;
            }
        }
        let _ = commands.send(HubCommand::Unregister { channel });
        let _ = events.send(TransportEvent::Closed(channel));
    });
    true
}

//! Integration tests for the WebSocket hub.
//!
//! These spin up a real listener on a random port and open channels to it
//! through the same hub, so both ends of every channel report into one
//! event stream.

#[cfg(feature = "websocket")]
mod websocket {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use linkforge_transport::{
        ChannelId, FrameSink, TransportEvent, WebSocketHub,
    };
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> TransportEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("event should arrive in time")
            .expect("hub should still be running")
    }

    /// Opens a channel through the hub and returns (client, server) ids.
    async fn open_pair(
        hub: &mut WebSocketHub,
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
        addr: &str,
    ) -> (ChannelId, ChannelId) {
        let client = hub.open_channel(addr);
        let mut opened = false;
        let mut server = None;
        while !opened || server.is_none() {
            match next_event(rx).await {
                TransportEvent::Opened(ch) => {
                    assert_eq!(ch, client);
                    opened = true;
                }
                TransportEvent::Accepted { channel, .. } => server = Some(channel),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        (client, server.unwrap())
    }

    // =========================================================================
    // open / accept
    // =========================================================================

    #[tokio::test]
    async fn test_open_channel_reports_opened_and_accepted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut hub = WebSocketHub::spawn(tx);
        let (_, addr) = hub.listen("127.0.0.1:0").await.expect("should bind");

        let (client, server) =
            open_pair(&mut hub, &mut rx, &addr.to_string()).await;
        assert_ne!(client, server);
    }

    #[tokio::test]
    async fn test_open_channel_unreachable_reports_open_failed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut hub = WebSocketHub::spawn(tx);

        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let channel = hub.open_channel(&format!("127.0.0.1:{port}"));

        match next_event(&mut rx).await {
            TransportEvent::OpenFailed { channel: ch, reason } => {
                assert_eq!(ch, channel);
                assert!(!reason.is_empty());
            }
            other => panic!("expected OpenFailed, got {other:?}"),
        }
    }

    // =========================================================================
    // frames
    // =========================================================================

    #[tokio::test]
    async fn test_write_frame_arrives_on_peer_channel_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut hub = WebSocketHub::spawn(tx);
        let (_, addr) = hub.listen("127.0.0.1:0").await.unwrap();
        let (client, server) =
            open_pair(&mut hub, &mut rx, &addr.to_string()).await;

        hub.write_frame(client, b"one".to_vec());
        hub.write_frame(client, b"two".to_vec());
        hub.write_frame(server, b"back".to_vec());

        let mut at_server = Vec::new();
        let mut at_client = Vec::new();
        while at_server.len() < 2 || at_client.is_empty() {
            match next_event(&mut rx).await {
                TransportEvent::Frame { channel, data } if channel == server => {
                    at_server.push(data)
                }
                TransportEvent::Frame { channel, data } if channel == client => {
                    at_client.push(data)
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(at_server, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(at_client, vec![b"back".to_vec()]);
    }

    #[tokio::test]
    async fn test_write_frame_unknown_channel_is_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut hub = WebSocketHub::spawn(tx);
        hub.write_frame(ChannelId::new(u64::MAX), b"nobody".to_vec());
        hub.close_quietly(ChannelId::new(u64::MAX));

        let quiet =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(quiet.is_err(), "no event expected");
    }

    // =========================================================================
    // close
    // =========================================================================

    #[tokio::test]
    async fn test_close_quietly_delivers_queued_frame_then_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut hub = WebSocketHub::spawn(tx);
        let (_, addr) = hub.listen("127.0.0.1:0").await.unwrap();
        let (client, server) =
            open_pair(&mut hub, &mut rx, &addr.to_string()).await;

        hub.write_frame(server, b"rejected".to_vec());
        hub.close_quietly(server);

        let mut got_frame = false;
        let mut closed = Vec::new();
        while closed.len() < 2 {
            match next_event(&mut rx).await {
                TransportEvent::Frame { channel, data } => {
                    assert_eq!(channel, client);
                    assert_eq!(data, b"rejected");
                    assert!(closed.is_empty(), "frame must precede close");
                    got_frame = true;
                }
                TransportEvent::Closed(ch) => closed.push(ch),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(got_frame);
        assert!(closed.contains(&client));
        assert!(closed.contains(&server));
    }

    #[tokio::test]
    async fn test_text_frames_from_raw_client_are_delivered_as_bytes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = WebSocketHub::spawn(tx);
        let (_, addr) = hub.listen("127.0.0.1:0").await.unwrap();

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("raw client should connect");
        let server = match next_event(&mut rx).await {
            TransportEvent::Accepted { channel, .. } => channel,
            other => panic!("expected Accepted, got {other:?}"),
        };

        ws.send(Message::Text("hi".into())).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Frame {
                channel: server,
                data: b"hi".to_vec()
            }
        );

        ws.close(None).await.unwrap();
        while let Some(msg) = ws.next().await {
            if msg.is_err() {
                break;
            }
        }
        assert_eq!(next_event(&mut rx).await, TransportEvent::Closed(server));
    }

    #[tokio::test]
    async fn test_release_listener_stops_accepting() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut hub = WebSocketHub::spawn(tx);
        let (listener, addr) = hub.listen("127.0.0.1:0").await.unwrap();
        hub.release_listener(listener);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let channel = hub.open_channel(&addr.to_string());
        match next_event(&mut rx).await {
            TransportEvent::OpenFailed { channel: ch, .. } => {
                assert_eq!(ch, channel)
            }
            other => panic!("expected OpenFailed, got {other:?}"),
        }
    }
}

//! WebSocket client: binds a [`SyncChannel`] to a live connection.
//!
//! `connect` opens the sync socket of a board and spawns three tasks:
//! - writer: forwards queued frames to the socket, tracking buffered bytes
//! - reader: hands every text frame to [`SyncChannel::handle_inbound`]
//! - flush loop: [`SyncChannel::spawn_flush_loop`]
//!
//! When either socket task ends, the outbound is marked closed and its
//! byte count cleared, so the flush loop stops instead of waiting forever
//! on a buffer that will never drain. There is no reconnection policy
//! here; the application watches the [`ChannelEvent`]s and decides what
//! to do.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::channel::{ChannelConfig, ChannelEvent, Outbound, SharedStore, SyncChannel};
use crate::protocol::ProtocolError;

/// Outbound half of a WebSocket connection.
///
/// Frames go to the writer task through an unbounded queue; the bytes
/// not yet written are what [`Outbound::buffered_amount`] reports.
pub struct WsOutbound {
    tx: mpsc::UnboundedSender<String>,
    buffered: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl Outbound for WsOutbound {
    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn send(&self, text: String) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let len = text.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        self.tx.send(text).map_err(|_| {
            release(&self.buffered, len);
            ProtocolError::ConnectionClosed
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Subtract `len` written or abandoned bytes. The counter may already have
/// been cleared by a closing writer, so this never wraps.
fn release(buffered: &AtomicUsize, len: usize) {
    let mut current = buffered.load(Ordering::SeqCst);
    while let Err(actual) = buffered.compare_exchange_weak(
        current,
        current.saturating_sub(len),
        Ordering::SeqCst,
        Ordering::SeqCst,
    ) {
        current = actual;
    }
}

/// A running client connection.
pub struct SyncConnection {
    channel: Arc<SyncChannel<WsOutbound>>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncConnection {
    pub fn channel(&self) -> &Arc<SyncChannel<WsOutbound>> {
        &self.channel
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.events.take()
    }

    /// Stop the flush loop and the socket tasks.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// URL of a board's sync socket under `base` (e.g. `ws://host:3000`).
pub fn sync_url(base: &str, board_id: &str) -> String {
    format!("{}/board/{}/socket", base.trim_end_matches('/'), board_id)
}

/// Connect to `url` and start synchronising `store` with it.
pub async fn connect(
    url: &str,
    store: SharedStore,
    config: ChannelConfig,
) -> Result<SyncConnection, ProtocolError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();
    log::info!("Connected to {url}");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let buffered = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));
    let outbound = WsOutbound {
        tx: out_tx,
        buffered: buffered.clone(),
        closed: closed.clone(),
    };
    let (channel, events) = SyncChannel::new(store, outbound, config);
    let channel = Arc::new(channel);

    // Writer task: forward queued frames to the socket.
    let writer_channel = Arc::downgrade(&channel);
    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            let len = text.len();
            let result = ws_writer.send(Message::Text(text.into())).await;
            release(&buffered, len);
            if let Err(e) = result {
                log::error!("WebSocket send failed: {e}");
                if let Some(channel) = writer_channel.upgrade() {
                    channel.emit(ChannelEvent::TransportError(e.to_string()));
                }
                break;
            }
        }
        // Frames still queued will never be written.
        writer_closed.store(true, Ordering::SeqCst);
        out_rx.close();
        while out_rx.try_recv().is_ok() {}
        buffered.store(0, Ordering::SeqCst);
        let _ = ws_writer.close().await;
    });

    channel.emit(ChannelEvent::Opened);

    // Reader task: merge inbound frames until the socket closes.
    let reader_channel = channel.clone();
    let reader = tokio::spawn(async move {
        let mut closing = None;
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    reader_channel.handle_inbound(text.as_str()).await;
                }
                Ok(Message::Close(frame)) => {
                    closing = Some(frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("WebSocket receive failed: {e}");
                    reader_channel.emit(ChannelEvent::TransportError(e.to_string()));
                    break;
                }
            }
        }

        let event = match closing {
            Some(Some(frame)) => ChannelEvent::ClosedCleanly {
                code: u16::from(frame.code),
                reason: frame.reason.as_str().to_string(),
            },
            // 1005: closed without a status code.
            Some(None) => ChannelEvent::ClosedCleanly {
                code: 1005,
                reason: String::new(),
            },
            None => ChannelEvent::ClosedAbnormally {
                reason: "connection lost".to_string(),
            },
        };
        match &event {
            ChannelEvent::ClosedCleanly { code, reason } => {
                log::info!("Connection closed, code={code} reason={reason}");
            }
            _ => log::error!("Connection closed abnormally"),
        }
        closed.store(true, Ordering::SeqCst);
        reader_channel.emit(event);
    });

    let flush = channel.spawn_flush_loop();

    Ok(SyncConnection {
        channel,
        events: Some(events),
        tasks: vec![flush, reader, writer],
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use lineboard_core::{ContentSnapshot, ContentType, LineStore, Position};
    use tokio::sync::Mutex;

    #[test]
    fn test_sync_url() {
        assert_eq!(sync_url("ws://localhost:3000", "b1"), "ws://localhost:3000/board/b1/socket");
        assert_eq!(sync_url("ws://localhost:3000/", "b1"), "ws://localhost:3000/board/b1/socket");
    }

    fn outbound() -> (WsOutbound, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = WsOutbound {
            tx,
            buffered: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (outbound, rx)
    }

    #[test]
    fn test_ws_outbound_tracks_buffered_bytes() {
        let (outbound, mut rx) = outbound();
        outbound.send("hello".to_string()).unwrap();
        assert_eq!(outbound.buffered_amount(), 5);
        assert_eq!(rx.try_recv().unwrap(), "hello");

        drop(rx);
        assert_eq!(outbound.send("x".to_string()), Err(ProtocolError::ConnectionClosed));
        assert_eq!(outbound.buffered_amount(), 5);
    }

    #[test]
    fn test_ws_outbound_refuses_after_close() {
        let (outbound, mut rx) = outbound();
        outbound.closed.store(true, Ordering::SeqCst);
        assert!(outbound.is_closed());
        assert_eq!(outbound.send("late".to_string()), Err(ProtocolError::ConnectionClosed));
        assert_eq!(outbound.buffered_amount(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_release_never_wraps() {
        let buffered = AtomicUsize::new(3);
        release(&buffered, 10);
        assert_eq!(buffered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_flush_loop_stops_when_peer_vanishes() {
        // Completes the handshake, then drops the socket without a close frame.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);
        });

        let store = Arc::new(Mutex::new(LineStore::new()));
        store
            .lock()
            .await
            .upsert_or_move("a".into(), Some(Position::At(0)), None)
            .unwrap();
        let config = ChannelConfig {
            flush_interval: Duration::from_millis(5),
            ..ChannelConfig::default()
        };
        let connection = connect(&format!("ws://{addr}"), store.clone(), config)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !connection.tasks[0].is_finished() {
            assert!(tokio::time::Instant::now() < deadline, "flush loop kept running");
            store
                .lock()
                .await
                .edit_line(&"a".into(), ContentSnapshot::new("x", ContentType::Plain))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let outbound = connection.channel().outbound();
        assert!(outbound.is_closed());
        assert_eq!(outbound.buffered_amount(), 0);
        connection.shutdown();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let store = Arc::new(Mutex::new(LineStore::new()));
        let result = connect(&format!("ws://127.0.0.1:{port}"), store, ChannelConfig::default()).await;
        assert!(result.is_err());
    }
}

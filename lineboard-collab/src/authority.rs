//! Remote line authority over the board's control socket.
//!
//! The relay server is the sole source of identities and positions in a
//! networked board. A create request returns only the new id; the line
//! itself (with its `number`) arrives later on the sync socket like any
//! other update.
//!
//! Replies carry no request id, so they are matched to requests purely by
//! arrival order. Once a request times out or the transport fails, that
//! pairing can no longer be trusted: the socket is dropped and every later
//! request fails with [`ProtocolError::ConnectionClosed`].

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lineboard_core::{BoardError, ContentSnapshot, LineAuthority, LineId, Placement};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{
    parse_ack, parse_assigned, ControlRequest, CreateLineRequest, DeleteLineRequest, ProtocolError,
};

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

type ControlSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// URL of a board's control socket under `base`.
pub fn control_url(base: &str, board_id: &str) -> String {
    format!("{}/board/{}/line", base.trim_end_matches('/'), board_id)
}

/// Client side of the control socket.
pub struct RemoteAuthority {
    /// `None` once the request/reply pairing has been lost.
    socket: Option<ControlSocket>,
    reply_timeout: Duration,
}

impl RemoteAuthority {
    pub async fn connect(url: &str) -> Result<Self, ProtocolError> {
        let (socket, _) = tokio_tungstenite::connect_async(url).await?;
        log::debug!("Control socket connected to {url}");
        Ok(Self {
            socket: Some(socket),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// False after a timeout or transport failure.
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Ask for a new line after `parent`; resolves to its id.
    pub async fn create_line(
        &mut self,
        parent: Option<LineId>,
        snapshot: ContentSnapshot,
    ) -> Result<LineId, ProtocolError> {
        let request = ControlRequest::Create(CreateLineRequest::new(parent, snapshot));
        let reply = self.request(&request).await?;
        parse_assigned(&reply)
    }

    /// Ask for a line to be deleted; resolves to the acknowledgement.
    pub async fn delete_line(&mut self, id: LineId) -> Result<bool, ProtocolError> {
        let request = ControlRequest::Delete(DeleteLineRequest { delete: id });
        let reply = self.request(&request).await?;
        parse_ack(&reply)
    }

    async fn request(&mut self, request: &ControlRequest) -> Result<String, ProtocolError> {
        let text = request.encode()?;
        let limit = self.reply_timeout;
        let Some(socket) = self.socket.as_mut() else {
            return Err(ProtocolError::ConnectionClosed);
        };
        let result = match tokio::time::timeout(limit, exchange(socket, text)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout),
        };
        if let Err(e) = &result {
            log::warn!("Dropping control socket: {e}");
            self.socket = None;
        }
        result
    }
}

/// Send one request and wait for the next text frame.
async fn exchange(socket: &mut ControlSocket, text: String) -> Result<String, ProtocolError> {
    socket.send(Message::Text(text.into())).await?;
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_string()),
            Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::ConnectionClosed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ProtocolError::from(e)),
        }
    }
}

impl LineAuthority for RemoteAuthority {
    fn assign_and_insert(
        &mut self,
        parent: Option<LineId>,
        snapshot: ContentSnapshot,
    ) -> impl Future<Output = Result<Placement, BoardError>> + Send {
        async move {
            let id = self.create_line(parent, snapshot).await?;
            Ok(Placement::pending(id))
        }
    }

    fn remove(&mut self, id: LineId) -> impl Future<Output = Result<bool, BoardError>> + Send {
        async move { Ok(self.delete_line(id).await?) }
    }
}

#[cfg(test)]
mod tests {
    use lineboard_core::ContentType;
    use tokio::net::TcpListener;

    use super::*;

    /// Control server answering the n-th request with `line-n` after `delay`.
    async fn start_control_server(delay: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut served = 0;
            while let Some(Ok(Message::Text(_))) = ws.next().await {
                served += 1;
                tokio::time::sleep(delay).await;
                let reply = Message::Text(format!("line-{served}").into());
                if ws.send(reply).await.is_err() {
                    break;
                }
            }
        });
        format!("ws://{addr}")
    }

    fn blank() -> ContentSnapshot {
        ContentSnapshot::new("", ContentType::Plain)
    }

    #[test]
    fn test_control_url() {
        assert_eq!(control_url("ws://h:1", "b"), "ws://h:1/board/b/line");
        assert_eq!(control_url("ws://h:1/", "b"), "ws://h:1/board/b/line");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(RemoteAuthority::connect(&format!("ws://127.0.0.1:{port}")).await.is_err());
    }

    #[tokio::test]
    async fn test_replies_pair_with_requests() {
        let url = start_control_server(Duration::ZERO).await;
        let mut authority = RemoteAuthority::connect(&url).await.unwrap();
        assert_eq!(authority.create_line(None, blank()).await.unwrap(), LineId::from("line-1"));
        assert_eq!(authority.create_line(None, blank()).await.unwrap(), LineId::from("line-2"));
        assert!(authority.is_connected());
    }

    #[tokio::test]
    async fn test_timeout_drops_socket() {
        let url = start_control_server(Duration::from_millis(300)).await;
        let mut authority = RemoteAuthority::connect(&url)
            .await
            .unwrap()
            .with_reply_timeout(Duration::from_millis(100));

        let first = authority.create_line(None, blank()).await;
        assert_eq!(first, Err(ProtocolError::Timeout));
        assert!(!authority.is_connected());

        // The late reply to the first request must never be taken as the
        // answer to this one.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = authority.create_line(None, blank()).await;
        assert_eq!(second, Err(ProtocolError::ConnectionClosed));

        let removed = LineAuthority::remove(&mut authority, "line-1".into()).await;
        assert!(removed.is_err());
    }
}

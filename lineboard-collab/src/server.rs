//! WebSocket relay server: remote authority and fan-out for boards.
//!
//! Architecture:
//! ```text
//! Client A ── /board/{id}/socket ──┐
//!                                  ├── BoardRoom ── RelayBoard (authority)
//! Client B ── /board/{id}/socket ──┤       │
//!                                  │       └── BroadcastGroup
//! Client A ── /board/{id}/line ────┘               │
//!                                     ┌────────────┼────────────┐
//!                                     ▼            ▼            ▼
//!                                  Client A     Client B     Client C
//! ```
//!
//! - The sync socket receives every line on connect, then relays content
//!   updates between the connections of a board (never back to the sender).
//! - The control socket creates and deletes lines; resulting placements
//!   and deletions go out to every sync connection before the reply.
//!
//! Boards live in memory and are created on first use with one empty line.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use lineboard_core::{BoardError, ContentSnapshot};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast::error::RecvError, Mutex, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::protocol::{error_reply, ControlRequest, LineUpdate};
use crate::relay::RelayBoard;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per sync connection before it starts lagging
    pub broadcast_capacity: usize,
    /// Sync connections accepted per board
    pub max_connections_per_board: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            broadcast_capacity: 256,
            max_connections_per_board: 100,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `LINEBOARD_BIND_ADDR`,
    /// `LINEBOARD_BROADCAST_CAPACITY` and `LINEBOARD_MAX_CONNECTIONS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("LINEBOARD_BIND_ADDR").filter(|a| !a.trim().is_empty()) {
            config.bind_addr = addr.trim().to_string();
        }
        if let Some(value) = parse_var(&lookup, "LINEBOARD_BROADCAST_CAPACITY") {
            config.broadcast_capacity = value;
        }
        if let Some(value) = parse_var(&lookup, "LINEBOARD_MAX_CONNECTIONS") {
            config.max_connections_per_board = value;
        }
        config
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring {key}={raw:?}: {e}");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub lines_created: u64,
    pub lines_deleted: u64,
    pub active_boards: usize,
}

/// Which socket a client opened.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Sync(String),
    Control(String),
}

fn parse_route(path: &str) -> Option<Route> {
    let rest = path.strip_prefix("/board/")?;
    let (board, socket) = rest.split_once('/')?;
    if board.is_empty() || board.contains('/') {
        return None;
    }
    match socket.trim_end_matches('/') {
        "socket" => Some(Route::Sync(board.to_string())),
        "line" => Some(Route::Control(board.to_string())),
        _ => None,
    }
}

/// Board state plus its broadcast group.
struct BoardRoom {
    board: Mutex<RelayBoard>,
    broadcast: BroadcastGroup,
}

impl BoardRoom {
    fn new(board: RelayBoard, broadcast_capacity: usize) -> Self {
        Self {
            board: Mutex::new(board),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        }
    }

    fn relay(&self, origin: Option<Uuid>, update: &LineUpdate) {
        match update.encode() {
            Ok(text) => {
                self.broadcast.broadcast(origin, text);
            }
            Err(e) => log::error!("Failed to encode update for line {}: {e}", update.id),
        }
    }
}

/// The relay server. Cloning shares the boards.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    boards: Arc<RwLock<HashMap<String, Arc<BoardRoom>>>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            boards: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create (or replace) a board holding `snapshots` in order.
    pub async fn load_board(
        &self,
        board_id: impl Into<String>,
        snapshots: Vec<ContentSnapshot>,
    ) -> Result<usize, BoardError> {
        let board_id = board_id.into();
        let board = RelayBoard::load(snapshots)?;
        let lines = board.len();
        let mut boards = self.boards.write().await;
        boards.insert(
            board_id.clone(),
            Arc::new(BoardRoom::new(board, self.config.broadcast_capacity)),
        );
        self.stats.write().await.active_boards = boards.len();
        log::info!("Loaded board {board_id} with {lines} lines");
        Ok(lines)
    }

    pub async fn has_board(&self, board_id: &str) -> bool {
        self.boards.read().await.contains_key(board_id)
    }

    /// Export a board as an ordered JSON array of `{value, contentType}`.
    pub async fn board_json(&self, board_id: &str) -> Option<String> {
        let room = self.boards.read().await.get(board_id).cloned()?;
        let board = room.board.lock().await;
        match board.to_json() {
            Ok(json) => Some(json),
            Err(e) => {
                log::error!("Failed to export board {board_id}: {e}");
                None
            }
        }
    }

    async fn room(&self, board_id: &str) -> Arc<BoardRoom> {
        // Fast path: read lock
        if let Some(room) = self.boards.read().await.get(board_id) {
            return room.clone();
        }

        let mut boards = self.boards.write().await;
        if let Some(room) = boards.get(board_id) {
            return room.clone();
        }
        let room = Arc::new(BoardRoom::new(RelayBoard::new(), self.config.broadcast_capacity));
        boards.insert(board_id.to_string(), room.clone());
        self.stats.write().await.active_boards = boards.len();
        log::info!("Board {board_id} created");
        room
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let mut route = None;
        let check_path = |request: &Request, response: Response| match parse_route(request.uri().path()) {
            Some(found) => {
                route = Some(found);
                Ok(response)
            }
            None => {
                let mut refusal = ErrorResponse::new(Some("unknown board path".to_string()));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                Err(refusal)
            }
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
        let Some(route) = route else {
            return Ok(());
        };

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = match route {
            Route::Sync(board_id) => self.handle_sync(ws_stream, addr, &board_id).await,
            Route::Control(board_id) => self.handle_control(ws_stream, addr, &board_id).await,
        };

        self.stats.write().await.active_connections -= 1;
        result
    }

    async fn handle_sync(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        board_id: &str,
    ) -> Result<(), BoxError> {
        let room = self.room(board_id).await;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let connection = Uuid::new_v4();

        // Subscribe before the snapshot so nothing falls between the two.
        let Some(mut broadcast_rx) = room
            .broadcast
            .join(connection, self.config.max_connections_per_board)
            .await
        else {
            log::warn!("Board {board_id} is full, refusing {addr}");
            let frame = CloseFrame {
                code: CloseCode::Again,
                reason: "board is full".into(),
            };
            ws_sender.send(Message::Close(Some(frame))).await?;
            return Ok(());
        };
        log::info!("Peer {addr} joined board {board_id}");

        let mut open = true;
        let lines = room.board.lock().await.lines();
        for line in &lines {
            if let Err(e) = send_update(&mut ws_sender, line).await {
                log::error!("Failed to send board {board_id} to {addr}: {e}");
                open = false;
                break;
            }
        }

        while open {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.stats.write().await.total_messages += 1;
                        let update = match LineUpdate::decode(text.as_str()) {
                            Ok(update) => update,
                            Err(e) => {
                                log::warn!("Discarding message from {addr}: {e} ({text})");
                                continue;
                            }
                        };
                        let forwarded = room.board.lock().await.write(&update);
                        match forwarded {
                            Some(forwarded) => room.relay(Some(connection), &forwarded),
                            None => log::debug!("Update for line {} not applied", update.id),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        open = ws_sender.send(Message::Pong(data)).await.is_ok();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Peer {addr} left board {board_id}");
                        open = false;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        open = false;
                    }
                    Some(Ok(_)) => {}
                },

                frame = broadcast_rx.recv() => match frame {
                    Ok(frame) if frame.is_for(connection) => {
                        let text = frame.text.to_string();
                        if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                            log::error!("Failed to relay to {addr}: {e}");
                            open = false;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        room.broadcast.record_lag(n);
                        log::warn!("Peer {addr} lagged by {n} messages on board {board_id}");
                    }
                    Err(RecvError::Closed) => open = false,
                },
            }
        }

        room.broadcast.leave(&connection).await;
        Ok(())
    }

    async fn handle_control(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        board_id: &str,
    ) -> Result<(), BoxError> {
        let room = self.room(board_id).await;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::debug!("Control socket for board {board_id} opened by {addr}");

        while let Some(msg) = ws_receiver.next().await {
            match msg? {
                Message::Text(text) => {
                    self.stats.write().await.total_messages += 1;
                    let reply = self.control_reply(&room, text.as_str()).await;
                    ws_sender.send(Message::Text(reply.into())).await?;
                }
                Message::Ping(data) => ws_sender.send(Message::Pong(data)).await?,
                Message::Close(_) => break,
                _ => {}
            }
        }
        log::debug!("Control socket for board {board_id} closed by {addr}");
        Ok(())
    }

    async fn control_reply(&self, room: &BoardRoom, text: &str) -> String {
        let request = match ControlRequest::decode(text) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Bad control request {text:?}: {e}");
                return error_reply(e.to_string());
            }
        };

        match request {
            ControlRequest::Create(create) => {
                let created = room
                    .board
                    .lock()
                    .await
                    .create_line(create.parent(), create.value.clone());
                match created {
                    Ok((id, updates)) => {
                        for update in &updates {
                            room.relay(None, update);
                        }
                        self.stats.write().await.lines_created += 1;
                        id.to_string()
                    }
                    Err(e) => {
                        log::warn!("Line creation failed: {e}");
                        error_reply(e.to_string())
                    }
                }
            }
            ControlRequest::Delete(delete) => {
                let deleted = room.board.lock().await.delete_line(&delete.delete);
                match deleted {
                    Some(update) => {
                        room.relay(None, &update);
                        self.stats.write().await.lines_deleted += 1;
                        "true".to_string()
                    }
                    None => "false".to_string(),
                }
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

async fn send_update<S>(sink: &mut S, update: &LineUpdate) -> Result<(), BoxError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    sink.send(Message::Text(update.encode()?.into())).await?;
    Ok(())
}

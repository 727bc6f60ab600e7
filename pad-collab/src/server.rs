//! In-memory sequencing server for pads.
//!
//! Architecture:
//! ```text
//! Pad A ──┐                      ┌── DocumentRoom (doc_id)
//!         ├── SyncServer ── rooms┤      body + log of accepted batches
//! Pad B ──┘   (token = client id)└── DocumentRoom ...
//! ```
//!
//! Each document room keeps:
//! - The authoritative body and its view (number of accepted batches)
//! - The full log of accepted batches, so any view can be caught up
//! - The next expected commit sequence number per client
//!
//! A commit made against an older view is transformed over every batch
//! accepted since, then appended. Commits are applied as they arrive, under
//! the room lock. Nothing is persisted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::ot::{apply, transform, Batch};
use crate::protocol::{ClientId, DocId, Request, Response};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub accepted_batches: u64,
    pub active_rooms: usize,
}

/// One document: body, log and per-client sequencing.
#[derive(Debug, Default)]
pub struct DocumentRoom {
    body: String,
    log: Vec<Batch>,
    next_seq: HashMap<ClientId, u64>,
}

impl DocumentRoom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn view(&self) -> u64 {
        self.log.len() as u64
    }

    fn next_seq(&self, client: &str) -> u64 {
        self.next_seq.get(client).copied().unwrap_or(0)
    }

    /// Answer a query made at `view`.
    pub fn query(&self, client: &str, view: i64) -> Response {
        let seq = self.next_seq(client);
        if view < 0 {
            return self.snapshot(seq);
        }
        let view = view as u64;
        if view > self.view() {
            return Response::Error { seq };
        }
        Response::OpsRes {
            view,
            ops: self.log[view as usize..].to_vec(),
            seq,
        }
    }

    fn snapshot(&self, seq: u64) -> Response {
        Response::DocRes {
            body: self.body.clone(),
            view: self.view(),
            seq,
        }
    }

    /// Accept a batch made against `view`. `None` for an empty batch.
    pub fn commit(&mut self, client: &str, view: i64, seq: u64, batch: Batch) -> Option<Response> {
        if batch.is_empty() {
            return None;
        }
        let expected = self.next_seq(client);
        if view < 0 || view as u64 > self.view() || seq > expected {
            return Some(Response::Error { seq: expected });
        }
        if seq < expected {
            // resent while the ack was in flight
            return Some(Response::Ack { seq });
        }

        let mut batch = batch;
        for accepted in &self.log[view as usize..] {
            batch = transform(accepted, &batch);
        }
        self.body = apply(&self.body, &batch);
        self.log.push(batch);
        self.next_seq.insert(client.to_string(), seq + 1);
        Some(Response::Ack { seq })
    }
}

/// The sequencing server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    /// Document rooms: doc_id → DocumentRoom
    rooms: Arc<RwLock<HashMap<DocId, DocumentRoom>>>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Pad server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                server.stats.write().await.active_connections -= 1;
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        let mut client: Option<ClientId> = None;

        while let Some(msg) = ws_receiver.next().await {
            let text = match msg? {
                Message::Text(text) => text.to_string(),
                Message::Close(_) => break,
                _ => continue,
            };

            // first frame is the credential
            if client.is_none() {
                log::info!("Client {} authenticated from {addr}", text.trim());
                client = Some(text.trim().to_string());
                continue;
            }
            let client_id = client.as_deref().unwrap_or_default();

            let request = match Request::decode(&text) {
                Ok(request) => request,
                Err(e) => {
                    log::warn!("Bad request from {client_id}: {e}");
                    continue;
                }
            };
            self.stats.write().await.total_messages += 1;

            if let Some(response) = self.handle_request(client_id, request).await {
                ws_sender.send(Message::Text(response.encode()?.into())).await?;
            }
        }

        log::info!("Connection from {addr} closed");
        Ok(())
    }

    /// Route one request to its room, creating the room on first use.
    pub async fn handle_request(&self, client: &str, request: Request) -> Option<Response> {
        let mut rooms = self.rooms.write().await;
        let is_new = !rooms.contains_key(&request.doc_id);
        let room = rooms.entry(request.doc_id).or_default();

        let response = if request.is_query {
            Some(room.query(client, request.view))
        } else {
            let before = room.view();
            let response = match (request.seq, request.ops) {
                (Some(seq), Some(ops)) => room.commit(client, request.view, seq, ops),
                _ => None,
            };
            if room.view() > before {
                log::debug!("Doc {} at view {} after commit from {client}", request.doc_id, room.view());
                self.stats.write().await.accepted_batches += 1;
            }
            response
        };

        if is_new {
            log::info!("Created room for doc {}", request.doc_id);
            self.stats.write().await.active_rooms = rooms.len();
        }
        response
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Current body and view of a document.
    pub async fn document(&self, doc_id: DocId) -> Option<(String, u64)> {
        let rooms = self.rooms.read().await;
        rooms.get(&doc_id).map(|room| (room.body().to_string(), room.view()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::diff;
    use crate::protocol::ClientIdentity;
    use uuid::Uuid;

    fn alice() -> ClientIdentity {
        ClientIdentity::new("alice", Uuid::from_u128(1))
    }

    fn bob() -> ClientIdentity {
        ClientIdentity::new("bob", Uuid::from_u128(2))
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
    }

    #[test]
    fn test_query_uninitialized_gets_snapshot() {
        let room = DocumentRoom::new();
        assert_eq!(
            room.query("alice", -1),
            Response::DocRes { body: String::new(), view: 0, seq: 0 }
        );
    }

    #[test]
    fn test_query_ahead_is_error() {
        let room = DocumentRoom::new();
        assert_eq!(room.query("alice", 3), Response::Error { seq: 0 });
    }

    #[test]
    fn test_commit_and_catch_up() {
        let mut room = DocumentRoom::new();
        let batch = diff("", "hi", &alice());
        assert_eq!(room.commit("alice", 0, 0, batch.clone()), Some(Response::Ack { seq: 0 }));
        assert_eq!(room.body(), "hi");
        assert_eq!(room.view(), 1);

        match room.query("bob", 0) {
            Response::OpsRes { view, ops, seq } => {
                assert_eq!(view, 0);
                assert_eq!(ops, vec![batch]);
                assert_eq!(seq, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(room.query("alice", -1), Response::DocRes { body: "hi".into(), view: 1, seq: 1 });
    }

    #[test]
    fn test_concurrent_commits_are_transformed() {
        let mut room = DocumentRoom::new();
        room.commit("alice", 0, 0, diff("", "abc", &alice()));

        room.commit("alice", 1, 1, diff("abc", "Xabc", &alice()));
        // bob still at view 1
        room.commit("bob", 1, 0, diff("abc", "abcY", &bob()));
        assert_eq!(room.body(), "XabcY");
        assert_eq!(room.view(), 3);
    }

    #[test]
    fn test_duplicate_commit_applied_once() {
        let mut room = DocumentRoom::new();
        let batch = diff("", "a", &alice());
        room.commit("alice", 0, 0, batch.clone());
        assert_eq!(room.commit("alice", 0, 0, batch), Some(Response::Ack { seq: 0 }));
        assert_eq!(room.body(), "a");
        assert_eq!(room.view(), 1);
    }

    #[test]
    fn test_commit_rejections() {
        let mut room = DocumentRoom::new();
        let batch = diff("", "a", &alice());
        assert_eq!(room.commit("alice", 0, 5, batch.clone()), Some(Response::Error { seq: 0 }));
        assert_eq!(room.commit("alice", 9, 0, batch.clone()), Some(Response::Error { seq: 0 }));
        assert_eq!(room.commit("alice", 0, 0, Vec::new()), None);
        assert_eq!(room.view(), 0);
    }

    #[tokio::test]
    async fn test_handle_request_routes_by_doc() {
        let server = SyncServer::with_defaults();
        let commit = Request::commit(7, "alice", 0, 0, diff("", "seven", &alice()));
        assert_eq!(server.handle_request("alice", commit).await, Some(Response::Ack { seq: 0 }));

        let query = Request::query(8, "alice", -1);
        assert!(matches!(
            server.handle_request("alice", query).await,
            Some(Response::DocRes { view: 0, .. })
        ));

        assert_eq!(server.document(7).await, Some(("seven".to_string(), 1)));
        assert_eq!(server.document(9).await, None);

        let stats = server.stats().await;
        assert_eq!(stats.active_rooms, 2);
        assert_eq!(stats.accepted_batches, 1);
    }
}

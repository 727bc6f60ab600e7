//! JSON wire protocol between a pad and the sequencing server.
//!
//! Every frame is a JSON text message. The first frame a client sends on a
//! fresh connection is its credential token as plain text; after that the
//! client only sends [`Request`]s and the server only answers with
//! [`Response`]s.
//!
//! ```text
//! client                                   server
//!   │ ── token ──────────────────────────────► │
//!   │ ── {isQuery:true, view:-1} ────────────► │
//!   │ ◄────────────── {type:"DocRes", body} ── │
//!   │ ── {isQuery:false, view, seq, ops} ────► │
//!   │ ◄──────────────────── {type:"Ack"} ───── │
//!   │ ── {isQuery:true, view} ───────────────► │
//!   │ ◄──────────── {type:"OpsRes", ops} ───── │
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ot::Batch;

/// User identity as authenticated by the server.
pub type ClientId = String;

/// Identity of one running client instance.
pub type SessionId = Uuid;

/// Document identifier.
pub type DocId = u64;

/// Who is editing: the user plus the running instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub client_id: ClientId,
    pub session: SessionId,
}

impl ClientIdentity {
    pub fn new(client_id: impl Into<ClientId>, session: SessionId) -> Self {
        Self {
            client_id: client_id.into(),
            session,
        }
    }

    /// Create with a freshly drawn v4 session id.
    pub fn with_fresh_session(client_id: impl Into<ClientId>) -> Self {
        Self::new(client_id, Uuid::new_v4())
    }
}

/// Client → server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub is_query: bool,
    pub doc_id: DocId,
    pub client_id: ClientId,
    /// View the client's base text is at; `-1` before the first snapshot.
    pub view: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ops: Option<Batch>,
}

impl Request {
    /// Ask for everything after `view`.
    pub fn query(doc_id: DocId, client_id: impl Into<ClientId>, view: i64) -> Self {
        Self {
            is_query: true,
            doc_id,
            client_id: client_id.into(),
            view,
            seq: None,
            ops: None,
        }
    }

    /// Submit the outstanding delta computed against `view`.
    pub fn commit(
        doc_id: DocId,
        client_id: impl Into<ClientId>,
        view: i64,
        seq: u64,
        ops: Batch,
    ) -> Self {
        Self {
            is_query: false,
            doc_id,
            client_id: client_id.into(),
            view,
            seq: Some(seq),
            ops: Some(ops),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Server → client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Full snapshot of the document at `view`.
    DocRes { body: String, view: u64, seq: u64 },
    /// Accepted batches `view..view + ops.len()`.
    OpsRes {
        view: u64,
        ops: Vec<Batch>,
        #[serde(default)]
        seq: u64,
    },
    /// Commit with `seq` received.
    Ack { seq: u64 },
    /// Request rejected; `seq` is the next sequence number the server expects.
    Error { seq: u64 },
}

impl Response {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

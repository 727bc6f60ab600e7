//! Pad configuration.

use std::time::Duration;

use crate::protocol::{ClientIdentity, DocId};

/// Default interval between query requests.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Default interval between commit ticks (and offload dispatches).
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_millis(1000);

/// Default pause before reconnecting after the transport drops.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Configuration for one open document.
#[derive(Debug, Clone)]
pub struct PadConfig {
    /// WebSocket endpoint prefix, e.g. `ws://127.0.0.1:8080/ws`.
    pub server_url: String,
    pub doc_id: DocId,
    /// Explicit client identity; nothing in the pad draws ids on its own.
    pub identity: ClientIdentity,
    /// Credential sent as the first frame of every connection.
    pub token: String,
    pub poll_interval: Duration,
    pub commit_interval: Duration,
    pub reconnect_delay: Duration,
}

impl PadConfig {
    /// Create with default intervals.
    pub fn new(
        server_url: impl Into<String>,
        doc_id: DocId,
        identity: ClientIdentity,
        token: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            doc_id,
            identity,
            token: token.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Use the same interval for polling and committing.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.commit_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Full URL of this document's socket.
    pub fn document_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.doc_id)
    }
}

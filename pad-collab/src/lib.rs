//! # pad-collab — Collaborative plain-text editing over operational transforms
//!
//! A pad keeps a local text box in sync with a central sequencing server.
//! Local edits are diffed into character operations, committed in batches,
//! and rebased over everyone else's accepted batches.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐                     ┌─────────────┐
//! │ TextBox     │ ◄──── rebased ───── │ Pad (actor) │
//! │ (UI owned)  │ ───── snapshot ───► │ PadState    │
//! └─────────────┘                     └──┬───────┬──┘
//!                                        │       │
//!                         WorkerRequest  │       │  JSON Request/Response
//!                                        ▼       ▼
//!                             ┌──────────────┐ ┌─────────────┐   WebSocket
//!                             │ OffloadWorker│ │ WsTransport │ ◄──────────► SyncServer
//!                             │ (rebase)     │ │ (reconnect) │
//!                             └──────────────┘ └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ot`] — Operation algebra: diff, apply, transform, apply_pos
//! - [`protocol`] — JSON wire protocol and identities
//! - [`worker`] — Offload channel for the heavy rebase computation
//! - [`pad`] — Per-document sync engine
//! - [`transport`] — WebSocket link with reconnect
//! - [`textbox`] — Shared text surface
//! - [`config`] — Pad configuration
//! - [`server`] — In-memory reference sequencer

pub mod ot;
pub mod protocol;
pub mod worker;
pub mod pad;
pub mod transport;
pub mod textbox;
pub mod config;
pub mod server;

// Re-exports for convenience
pub use ot::{apply, apply_pos, diff, transform, Batch, Op, OpKind, Selection};
pub use protocol::{
    ClientId, ClientIdentity, DocId, ProtocolError, Request, Response, SessionId,
};
pub use worker::{OffloadWorker, WorkerError, WorkerReply, WorkerRequest, WorkerResult};
pub use pad::{Pad, PadEvent, PadState, PadStatus};
pub use transport::{ConnectionState, TransportEvent, TransportLink, WsTransport};
pub use textbox::{SharedTextBox, TextBox};
pub use config::PadConfig;
pub use server::{ServerConfig, ServerStats, SyncServer};

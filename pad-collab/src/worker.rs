//! Offload channel: runs diff/transform work away from the pad's event loop.
//!
//! ```text
//! ┌──────────┐  watch (1 slot, latest wins)  ┌──────────────┐
//! │  Pad     │ ────────── WorkerRequest ───► │ OffloadWorker│
//! │  actor   │                               │ spawn_blocking│
//! │          │ ◄───────── WorkerResult ───── │              │
//! └──────────┘            mpsc               └──────────────┘
//! ```
//!
//! The worker handles one request at a time. A request submitted while an
//! earlier one is still computing replaces any request that has not been
//! picked up yet, so superseded snapshots of the text box are never
//! computed. The pad itself dispatches a new request only after the previous
//! one has been answered, and still checks every result for staleness.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::ot::{apply, apply_pos, diff, transform, Batch, Selection};
use crate::protocol::{ClientId, ClientIdentity, ProtocolError, SessionId};

/// Snapshot of the pad state handed to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    /// Dispatch stamp, echoed in the result.
    pub generation: u64,
    /// Server batches received but not yet folded into `base`.
    pub pending_server_batches: Vec<Batch>,
    pub client_id: ClientId,
    pub session_id: SessionId,
    /// Text known to match the server at `view`.
    pub base: String,
    pub view: u64,
    /// Outstanding delta, `base → curr`.
    pub delta: Batch,
    pub curr: String,
    /// Text box contents when the request was built.
    pub live_text: String,
    pub selection: Selection,
}

/// Outcome of one offload computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub generation: u64,
    /// The `live_text` the request was built from; used for the staleness check.
    pub observed_live_text: String,
    /// Sequence number of the last batch from this client found in the pending batches.
    pub matched_seq: Option<u64>,
    pub new_view: u64,
    pub new_base: String,
    /// `apply(new_base, new_delta)`, or `new_base` when the ack was found.
    pub new_curr: String,
    /// What the text box should show after rebasing.
    pub new_curr_target: String,
    /// The outstanding delta transformed over foreign batches.
    pub new_delta: Batch,
    /// Live edit, `new_curr → new_curr_target`.
    pub rebased_delta1: Batch,
    pub rebased_selection: Selection,
    /// This session's own delta came back in the pending batches.
    pub ack_found: bool,
}

impl WorkerRequest {
    fn identity(&self) -> ClientIdentity {
        ClientIdentity::new(self.client_id.clone(), self.session_id)
    }

    /// Fold pending server batches into the snapshot.
    pub fn compute(self) -> WorkerResult {
        let origin = self.identity();
        let mut base = self.base;
        let mut delta = self.delta;
        let mut selection = self.selection;
        let mut delta1 = diff(&base, &self.live_text, &origin);
        let mut matched_seq = None;
        let mut ack_found = false;

        for batch in &self.pending_server_batches {
            let Some(head) = batch.first() else {
                continue;
            };

            if head.origin_client == self.client_id {
                if head.seq.is_some() {
                    matched_seq = head.seq;
                }
                if head.origin_session == self.session_id {
                    // our own delta came back; it is already part of the live text
                    ack_found = true;
                    let target = apply(&base, &delta1);
                    base = apply(&base, batch);
                    delta1 = diff(&base, &target, &origin);
                    continue;
                }
            }

            delta = transform(batch, &delta);
            delta1 = transform(batch, &delta1);
            base = apply(&base, batch);
            selection = apply_pos(selection, batch);
        }

        let new_curr = if ack_found {
            base.clone()
        } else {
            apply(&base, &delta)
        };
        let new_curr_target = apply(&base, &delta1);
        if !ack_found {
            delta1 = diff(&new_curr, &new_curr_target, &origin);
        }

        WorkerResult {
            generation: self.generation,
            observed_live_text: self.live_text,
            matched_seq,
            new_view: self.view + self.pending_server_batches.len() as u64,
            new_base: base,
            new_curr,
            new_curr_target,
            new_delta: delta,
            rebased_delta1: delta1,
            rebased_selection: selection,
            ack_found,
        }
    }

    /// Encode as a bincode frame for an out-of-process worker.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (req, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(req)
    }
}

impl WorkerResult {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (res, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(res)
    }
}

/// A request that produced no result.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerError {
    /// The computation panicked or was cancelled.
    Failed { generation: u64, reason: String },
}

impl WorkerError {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Failed { generation, .. } => *generation,
        }
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { generation, reason } => {
                write!(f, "Offload request {generation} failed: {reason}")
            }
        }
    }
}

impl std::error::Error for WorkerError {}

/// What the worker sends back for each request it picks up.
pub type WorkerReply = Result<WorkerResult, WorkerError>;

/// Background computation unit owned by one pad.
///
/// Dropping the worker closes its mailbox; the task exits after the
/// computation in progress, if any.
pub struct OffloadWorker {
    mailbox: watch::Sender<Option<WorkerRequest>>,
    task: JoinHandle<()>,
}

impl OffloadWorker {
    /// Spawn the worker task. Every request picked up gets exactly one reply
    /// on `results`.
    pub fn spawn(results: mpsc::Sender<WorkerReply>) -> Self {
        let (mailbox, mut rx) = watch::channel::<Option<WorkerRequest>>(None);

        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(request) = rx.borrow_and_update().clone() else {
                    continue;
                };
                let generation = request.generation;

                let reply = tokio::task::spawn_blocking(move || request.compute())
                    .await
                    .map_err(|e| {
                        log::error!("Offload computation {generation} failed: {e}");
                        WorkerError::Failed {
                            generation,
                            reason: e.to_string(),
                        }
                    });
                if results.send(reply).await.is_err() {
                    break;
                }
            }
            log::debug!("Offload worker stopped");
        });

        Self { mailbox, task }
    }

    /// Replace the pending request, if any, with `request`.
    pub fn submit(&self, request: WorkerRequest) -> Result<(), ProtocolError> {
        self.mailbox
            .send(Some(request))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Whether the worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

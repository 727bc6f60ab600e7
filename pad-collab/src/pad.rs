//! Per-document synchronization engine.
//!
//! A [`Pad`] is an actor: one tokio task owns the [`PadState`] and every
//! mutation (poll tick, commit tick, server message, worker result, kill)
//! goes through its `select!` loop. The only state shared with the outside
//! is the [`SharedTextBox`], which is locked for the whole staleness check
//! and update of a rebased result.
//!
//! ```text
//!            ┌─────────── PadRunner task ────────────┐
//! transport ─┤ Opened / Message / Closed             │
//! poll tick ─┤ query(view)                ──────────►├── transport
//! commit tick┤ commit(delta, seq) + dispatch ───────►├── OffloadWorker
//! worker    ─┤ WorkerReply → staleness check → state │
//! kill      ─┤ stop                                  │
//!            └───────────────────────────────────────┘
//! ```
//!
//! Lifecycle: Uninitialized (no view) until the first `DocRes`, then Live.
//! Closing the transport while alive reconnects with all state kept.
//!
//! At most one offload request is outstanding. Each one is stamped with a
//! generation, and only the reply carrying the outstanding generation is
//! applied; it also frees the slot for the next dispatch.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::PadConfig;
use crate::ot::{Batch, Op, Selection};
use crate::protocol::{ClientIdentity, DocId, Request, Response};
use crate::textbox::{SharedTextBox, TextBox};
use crate::transport::{ConnectionState, TransportEvent, TransportLink, WsTransport};
use crate::worker::{OffloadWorker, WorkerReply, WorkerRequest, WorkerResult};

/// Events emitted by a pad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PadEvent {
    /// Transport open, credential sent.
    Connected,
    /// Transport lost; reconnecting.
    Disconnected,
    /// First snapshot received, text box is editable.
    Ready { view: u64 },
    /// A result moved the document forward to `view`.
    Rebased { view: u64, text: String },
    /// The server acknowledged our commit with `seq`.
    Acknowledged { seq: u64 },
}

/// Observable pad counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PadStatus {
    pub connection: ConnectionState,
    pub view: Option<u64>,
    pub seq: u64,
    pub seen_seq: Option<u64>,
    pub outstanding_ops: usize,
    pub buffered_batches: usize,
    pub offload_in_flight: bool,
    /// Poll duty cycle running.
    pub polling: bool,
    /// Commit duty cycle running.
    pub committing: bool,
}

/// What a server response did to the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Dropped: not initialized yet, duplicate, or a gap.
    Ignored,
    /// Full snapshot adopted; the text box must show `body`.
    Snapshot { body: String, view: u64 },
    /// `appended` new batches buffered.
    Buffered { appended: usize },
    Acked { seq: u64 },
    Rejected { seq: u64 },
}

/// What a worker result did to the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultOutcome {
    /// The live text or the view moved on since the request was built.
    Stale,
    Applied {
        view: u64,
        advanced: bool,
        acknowledged: Option<u64>,
    },
}

/// Engine state for one open document.
#[derive(Debug, Clone)]
pub struct PadState {
    doc_id: DocId,
    identity: ClientIdentity,
    /// Text known to match the server at `view`.
    base: String,
    /// `apply(base, delta)`.
    curr: String,
    /// Outstanding local batch, `base → curr`.
    delta: Batch,
    /// Server batches after `view` not yet folded into `base`.
    pending: Vec<Batch>,
    /// `None` until the first snapshot.
    view: Option<u64>,
    seq: u64,
    seen_seq: Option<u64>,
    next_generation: u64,
    /// Generation of the offload request awaiting its reply.
    in_flight: Option<u64>,
}

impl PadState {
    pub fn new(doc_id: DocId, identity: ClientIdentity) -> Self {
        Self {
            doc_id,
            identity,
            base: String::new(),
            curr: String::new(),
            delta: Vec::new(),
            pending: Vec::new(),
            view: None,
            seq: 0,
            seen_seq: None,
            next_generation: 0,
            in_flight: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.view.is_some()
    }

    pub fn view(&self) -> Option<u64> {
        self.view
    }

    /// View as sent on the wire; `-1` before the first snapshot.
    pub fn wire_view(&self) -> i64 {
        self.view.map_or(-1, |v| v as i64)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn seen_seq(&self) -> Option<u64> {
        self.seen_seq
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn curr(&self) -> &str {
        &self.curr
    }

    pub fn delta(&self) -> &[Op] {
        &self.delta
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn offload_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Known frontier: `view + buffered batches`.
    fn frontier(&self) -> Option<u64> {
        self.view.map(|v| v + self.pending.len() as u64)
    }

    pub fn status(&self, connection: ConnectionState) -> PadStatus {
        PadStatus {
            connection,
            view: self.view,
            seq: self.seq,
            seen_seq: self.seen_seq,
            outstanding_ops: self.delta.len(),
            buffered_batches: self.pending.len(),
            offload_in_flight: self.in_flight.is_some(),
            polling: false,
            committing: false,
        }
    }

    pub fn query_request(&self) -> Request {
        Request::query(self.doc_id, self.identity.client_id.clone(), self.wire_view())
    }

    /// Tag the outstanding delta with the current seq and build a commit.
    /// `None` when there is nothing to send.
    pub fn commit_request(&mut self) -> Option<Request> {
        let head = self.delta.first_mut()?;
        head.seq = Some(self.seq);
        Some(Request::commit(
            self.doc_id,
            self.identity.client_id.clone(),
            self.wire_view(),
            self.seq,
            self.delta.clone(),
        ))
    }

    /// Snapshot for the offload worker. `None` until initialized, or while
    /// an earlier request is still unanswered.
    pub fn worker_request(&mut self, live_text: String, selection: Selection) -> Option<WorkerRequest> {
        let view = self.view?;
        if self.in_flight.is_some() {
            return None;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        self.in_flight = Some(generation);
        Some(WorkerRequest {
            generation,
            pending_server_batches: self.pending.clone(),
            client_id: self.identity.client_id.clone(),
            session_id: self.identity.session,
            base: self.base.clone(),
            view,
            delta: self.delta.clone(),
            curr: self.curr.clone(),
            live_text,
            selection,
        })
    }

    pub fn handle_response(&mut self, response: Response) -> ResponseOutcome {
        match response {
            Response::DocRes { body, view, seq } => {
                if self.view.is_some() {
                    log::info!("Doc {} re-based from snapshot at view {view}", self.doc_id);
                }
                self.base = body.clone();
                self.curr = body.clone();
                self.delta.clear();
                self.pending.clear();
                self.view = Some(view);
                self.seq = seq;
                // a reply computed from the old state must not land
                self.in_flight = None;
                ResponseOutcome::Snapshot { body, view }
            }
            _ if self.view.is_none() => ResponseOutcome::Ignored,
            Response::OpsRes { view, ops, .. } => self.buffer_batches(view, ops),
            Response::Ack { seq } => ResponseOutcome::Acked { seq },
            Response::Error { seq } => ResponseOutcome::Rejected { seq },
        }
    }

    /// Append the not-yet-seen suffix of `batches`, which start at `from_view`.
    pub fn buffer_batches(&mut self, from_view: u64, batches: Vec<Batch>) -> ResponseOutcome {
        let Some(frontier) = self.frontier() else {
            return ResponseOutcome::Ignored;
        };
        if from_view > frontier {
            log::debug!("Doc {}: gap, have {frontier}, got batches from {from_view}", self.doc_id);
            return ResponseOutcome::Ignored;
        }
        if frontier >= from_view + batches.len() as u64 {
            return ResponseOutcome::Ignored;
        }

        let skip = (frontier - from_view) as usize;
        let before = self.pending.len();
        self.pending.extend(batches.into_iter().skip(skip));
        ResponseOutcome::Buffered {
            appended: self.pending.len() - before,
        }
    }

    /// Release the offload slot held by a request that produced no result.
    pub fn abandon_request(&mut self, generation: u64) {
        if self.in_flight == Some(generation) {
            self.in_flight = None;
        }
    }

    /// Apply a worker result if it answers the outstanding request and still
    /// matches the text box.
    pub fn apply_result(&mut self, result: WorkerResult, textbox: &mut TextBox) -> ResultOutcome {
        if self.in_flight != Some(result.generation) {
            return ResultOutcome::Stale;
        }
        self.in_flight = None;

        let Some(view) = self.view else {
            return ResultOutcome::Stale;
        };
        if textbox.value() != result.observed_live_text || view > result.new_view {
            return ResultOutcome::Stale;
        }

        let consumed = ((result.new_view - view) as usize).min(self.pending.len());
        self.pending.drain(..consumed);
        self.base = result.new_base;
        textbox.replace(result.new_curr_target.clone(), result.rebased_selection);
        self.view = Some(result.new_view);

        let mut acknowledged = None;
        if let Some(matched) = result.matched_seq {
            if self.seen_seq.map_or(true, |seen| matched > seen) {
                self.seen_seq = Some(matched);
                self.seq = matched + 1;
                acknowledged = Some(matched);
            }
        }

        if result.ack_found || (self.delta.is_empty() && !result.rebased_delta1.is_empty()) {
            self.delta = result.rebased_delta1;
            self.base = result.new_curr;
            self.curr = result.new_curr_target;
        } else {
            self.delta = result.new_delta;
            self.curr = result.new_curr;
        }

        ResultOutcome::Applied {
            view: result.new_view,
            advanced: result.new_view > view,
            acknowledged,
        }
    }
}

/// Handle to a running pad.
pub struct Pad {
    doc_id: DocId,
    textbox: SharedTextBox,
    status: watch::Receiver<PadStatus>,
    event_rx: Option<mpsc::Receiver<PadEvent>>,
    kill_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Pad {
    /// Open a document over a WebSocket to `config.document_url()`.
    pub fn open(config: PadConfig, textbox: SharedTextBox) -> Self {
        let link = WsTransport::spawn(config.document_url(), config.reconnect_delay);
        Self::with_link(config, textbox, link)
    }

    /// Open a document over an existing transport link.
    pub fn with_link(config: PadConfig, textbox: SharedTextBox, link: TransportLink) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (status_tx, status_rx) = watch::channel(PadStatus::default());
        let (kill_tx, kill_rx) = oneshot::channel();
        let (result_tx, result_rx) = mpsc::channel(4);

        {
            let mut tb = textbox.lock();
            tb.set_editable(false);
        }

        let doc_id = config.doc_id;
        let runner = PadRunner {
            state: PadState::new(config.doc_id, config.identity.clone()),
            config,
            textbox: textbox.clone(),
            outgoing: link.outgoing,
            connection: ConnectionState::Disconnected,
            poll_running: false,
            commit_running: false,
            worker: OffloadWorker::spawn(result_tx),
            events: event_tx,
            status: status_tx,
        };
        let task = tokio::spawn(runner.run(link.events, result_rx, kill_rx));

        Self {
            doc_id,
            textbox,
            status: status_rx,
            event_rx: Some(event_rx),
            kill_tx: Some(kill_tx),
            task,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<PadEvent>> {
        self.event_rx.take()
    }

    pub fn doc_id(&self) -> DocId {
        self.doc_id
    }

    pub fn textbox(&self) -> &SharedTextBox {
        &self.textbox
    }

    /// Latest published counters.
    pub fn status(&self) -> PadStatus {
        self.status.borrow().clone()
    }

    /// Watch the counters change.
    pub fn subscribe(&self) -> watch::Receiver<PadStatus> {
        self.status.clone()
    }

    /// Close the document: stop both cycles and the transport, no reconnect.
    pub async fn kill(mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for Pad {
    fn drop(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct PadRunner {
    config: PadConfig,
    state: PadState,
    textbox: SharedTextBox,
    outgoing: mpsc::UnboundedSender<String>,
    connection: ConnectionState,
    poll_running: bool,
    commit_running: bool,
    worker: OffloadWorker,
    events: mpsc::Sender<PadEvent>,
    status: watch::Sender<PadStatus>,
}

impl PadRunner {
    async fn run(
        mut self,
        mut transport: mpsc::Receiver<TransportEvent>,
        mut results: mpsc::Receiver<WorkerReply>,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        // first ticks one period out; an open triggers the first query itself
        let start = Instant::now();
        let mut poll = interval_at(start + self.config.poll_interval, self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commit = interval_at(start + self.config.commit_interval, self.config.commit_interval);
        commit.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut transport_alive = true;

        log::info!("Opening doc {} as {}", self.config.doc_id, self.config.identity.client_id);

        loop {
            tokio::select! {
                _ = &mut kill_rx => break,
                event = transport.recv(), if transport_alive => match event {
                    Some(event) => self.on_transport(event),
                    None => {
                        log::warn!("Transport for doc {} ended", self.config.doc_id);
                        transport_alive = false;
                        self.connection = ConnectionState::Disconnected;
                    }
                },
                Some(reply) = results.recv() => self.on_worker_reply(reply),
                _ = poll.tick() => self.poll_tick(),
                _ = commit.tick() => self.commit_tick(),
            }
            self.publish_status();
        }

        log::info!("Closed doc {}", self.config.doc_id);
    }

    fn emit(&self, event: PadEvent) {
        // listeners read the status right after an event
        self.publish_status();
        if let Err(e) = self.events.try_send(event) {
            log::trace!("Pad event dropped: {e}");
        }
    }

    fn publish_status(&self) {
        let mut status = self.state.status(self.connection);
        status.polling = self.poll_running;
        status.committing = self.commit_running;
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn send(&self, frame: String) -> bool {
        self.outgoing.send(frame).is_ok()
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if !self.send(self.config.token.clone()) {
                    log::warn!("Could not send credential for doc {}", self.config.doc_id);
                    self.connection = ConnectionState::Disconnected;
                    return;
                }
                self.connection = ConnectionState::Connected;
                self.emit(PadEvent::Connected);

                let poll_was_running = self.poll_running;
                self.poll_running = true;
                self.commit_running = true;
                if !poll_was_running {
                    self.poll_tick();
                }
            }
            TransportEvent::Message(text) => self.on_message(&text),
            TransportEvent::Closed => {
                self.connection = ConnectionState::Reconnecting;
                self.emit(PadEvent::Disconnected);
            }
        }
    }

    fn on_message(&mut self, text: &str) {
        let response = match Response::decode(text) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Dropping malformed message for doc {}: {e}", self.config.doc_id);
                return;
            }
        };

        match self.state.handle_response(response) {
            ResponseOutcome::Snapshot { body, view } => {
                {
                    let mut tb = self.textbox.lock();
                    let caret = Selection::caret(body.chars().count());
                    tb.replace(body, caret);
                    tb.set_editable(true);
                }
                log::info!("Doc {} live at view {view}", self.config.doc_id);
                self.emit(PadEvent::Ready { view });
            }
            ResponseOutcome::Buffered { appended } => {
                log::debug!("Doc {}: buffered {appended} batches", self.config.doc_id);
            }
            ResponseOutcome::Acked { seq } => log::trace!("Commit {seq} received by server"),
            ResponseOutcome::Rejected { seq } => {
                log::warn!("Server rejected request for doc {}, expects seq {seq}", self.config.doc_id);
            }
            ResponseOutcome::Ignored => {}
        }
    }

    fn poll_tick(&mut self) {
        if !self.poll_running || self.connection != ConnectionState::Connected {
            return;
        }
        match self.state.query_request().encode() {
            Ok(frame) => {
                if !self.send(frame) {
                    log::warn!("Query send failed, poll cycle for doc {} stopped", self.config.doc_id);
                    self.poll_running = false;
                }
            }
            Err(e) => log::error!("Failed to encode query: {e}"),
        }
    }

    fn commit_tick(&mut self) {
        if !self.commit_running {
            return;
        }

        if self.connection == ConnectionState::Connected {
            if let Some(request) = self.state.commit_request() {
                match request.encode() {
                    Ok(frame) => {
                        if !self.send(frame) {
                            log::warn!("Commit send failed, commit cycle for doc {} stopped", self.config.doc_id);
                            self.commit_running = false;
                            return;
                        }
                    }
                    Err(e) => log::error!("Failed to encode commit: {e}"),
                }
            }
        }

        let (live_text, selection) = self.textbox.snapshot();
        if let Some(request) = self.state.worker_request(live_text, selection) {
            let generation = request.generation;
            if let Err(e) = self.worker.submit(request) {
                log::error!("Offload worker unavailable: {e}");
                self.state.abandon_request(generation);
            }
        }
    }

    fn on_worker_reply(&mut self, reply: WorkerReply) {
        match reply {
            Ok(result) => self.on_worker_result(result),
            Err(e) => {
                log::error!("{e}");
                self.state.abandon_request(e.generation());
            }
        }
    }

    fn on_worker_result(&mut self, result: WorkerResult) {
        let outcome = {
            let mut tb = self.textbox.lock();
            self.state.apply_result(result, &mut tb)
        };

        match outcome {
            ResultOutcome::Stale => log::trace!("Discarding stale offload result"),
            ResultOutcome::Applied {
                view,
                advanced,
                acknowledged,
            } => {
                if let Some(seq) = acknowledged {
                    self.emit(PadEvent::Acknowledged { seq });
                }
                if advanced {
                    self.emit(PadEvent::Rebased {
                        view,
                        text: self.textbox.value(),
                    });
                }
            }
        }
    }
}

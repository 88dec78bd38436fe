//! 2PC Participant
//!
//! Registers with the coordinator on startup, receives PREPARE / COMMIT /
//! ABORT / QUERY_STATE pushes, and answers under operator (or timeout)
//! control. Votes and ACKs travel out-of-band: the inbound connection is
//! closed without a reply and the answer is pushed later on a fresh
//! connection as a control envelope.
//!
//! Per transaction the participant keeps three disjoint collections:
//! `prepared` (voted YES, awaiting the decision), `committed` (id ->
//! payload) and `aborted`. A message awaiting resolution sits in one of
//! three single-element pending slots, each guarded by a cancellable
//! 30-second timer.

use crate::protocol::{
    ControlFrame, Decision, HistoryRecord, Message, MessageKind, HISTORY_SENTINEL, REGISTER_OK,
};
use crate::transport;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Participant tuning knobs. Defaults match the reference protocol timings.
#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    pub participant_id: String,
    pub host: String,
    pub port: u16,
    pub coordinator_host: String,
    pub coordinator_port: u16,
    /// Window before an unresolved pending slot resolves itself
    /// (vote NO / ACK_COMMIT / ACK_ABORT).
    pub decision_timeout: Duration,
    /// Connect/read timeout for outbound pushes.
    pub io_timeout: Duration,
    /// Probability of simulated failure per inbound message.
    pub failure_rate: f64,
}

impl ParticipantConfig {
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            host: "localhost".to_string(),
            port: 6000,
            coordinator_host: "localhost".to_string(),
            coordinator_port: 5000,
            decision_timeout: Duration::from_secs(30),
            io_timeout: transport::IO_TIMEOUT,
            failure_rate: 0.0,
        }
    }
}

/// Which pending slot a timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Vote,
    Commit,
    Abort,
}

/// A message awaiting operator or timeout resolution.
#[derive(Debug)]
struct PendingSlot {
    transaction_id: String,
    data: Map<String, Value>,
    timer: Option<JoinHandle<()>>,
}

impl PendingSlot {
    fn new(transaction_id: String, data: Map<String, Value>) -> Self {
        Self {
            transaction_id,
            data,
            timer: None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct ParticipantState {
    prepared: HashSet<String>,
    committed: HashMap<String, Map<String, Value>>,
    aborted: HashSet<String>,
    pending_vote: Option<PendingSlot>,
    pending_commit: Option<PendingSlot>,
    pending_abort: Option<PendingSlot>,
    failure_rate: f64,
}

/// One member of the cluster's voting cohort.
pub struct Participant {
    config: ParticipantConfig,
    state: Mutex<ParticipantState>,
    crashed: AtomicBool,
    shutdown: AtomicBool,
}

impl Participant {
    pub fn new(config: ParticipantConfig) -> Self {
        let failure_rate = config.failure_rate;
        Self {
            config,
            state: Mutex::new(ParticipantState {
                prepared: HashSet::new(),
                committed: HashMap::new(),
                aborted: HashSet::new(),
                pending_vote: None,
                pending_commit: None,
                pending_abort: None,
                failure_rate,
            }),
            crashed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.config.participant_id
    }

    pub fn address(&self) -> (String, u16) {
        (self.config.host.clone(), self.config.port)
    }

    /// Bind the listening socket from the configured address.
    pub async fn bind(&self) -> Result<TcpListener, String> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind to {}: {}", addr, e))
    }

    /// Spawn the listener task: accept loop with a 1-second timeout so the
    /// shutdown flag is observed, one worker task per connection.
    pub fn start(self: &Arc<Self>, listener: TcpListener) {
        let participant = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if participant.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match tokio::time::timeout(Duration::from_secs(1), listener.accept()).await {
                    Err(_) => continue,
                    Ok(Err(e)) => {
                        if !participant.shutdown.load(Ordering::SeqCst) {
                            tracing::warn!("accept failed: {}", e);
                        }
                    }
                    Ok(Ok((stream, addr))) => {
                        let worker = Arc::clone(&participant);
                        tokio::spawn(async move {
                            worker.handle_connection(stream, addr).await;
                        });
                    }
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Simulate a crash: drop every pending slot (they are not restored on
    /// recovery) and start ignoring inbound messages. Returns false when
    /// already crashed.
    pub fn crash(&self) -> bool {
        if self.crashed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.lock();
        for mut slot in [
            state.pending_vote.take(),
            state.pending_commit.take(),
            state.pending_abort.take(),
        ]
        .into_iter()
        .flatten()
        {
            slot.cancel_timer();
        }
        true
    }

    /// Register with the coordinator; the handshake reply must be `"OK"`.
    pub async fn register(&self) -> Result<(), String> {
        let frame = ControlFrame::Register {
            participant_id: self.config.participant_id.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
        }
        .encode()?;
        let reply = transport::send_request(
            &self.config.coordinator_host,
            self.config.coordinator_port,
            &frame,
            self.config.io_timeout,
            true,
        )
        .await?;
        match reply.as_deref() {
            Some(REGISTER_OK) => Ok(()),
            other => Err(format!("Unexpected register reply: {:?}", other)),
        }
    }

    /// One worker per accepted connection. While crashed every inbound
    /// message is dropped on the floor; decode errors stop here too.
    async fn handle_connection(self: &Arc<Self>, mut stream: TcpStream, addr: SocketAddr) {
        let frame = match transport::read_frame(&mut stream, self.config.io_timeout).await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("read from {} failed: {}", addr, e);
                return;
            }
        };
        if frame.is_empty() {
            return;
        }
        if self.is_crashed() {
            println!("crashed, dropping inbound message");
            return;
        }

        let message = match Message::from_json(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("dropping malformed message from {}: {}", addr, e);
                return;
            }
        };
        println!(
            "\nreceived {} (transaction {})",
            message.kind, message.transaction_id
        );

        // Failure injection runs before the pending-slot logic: PREPARE is
        // answered VOTE_NO on the spot, anything else is silently dropped.
        let rate = self.state.lock().failure_rate;
        if rate > 0.0 && rand::random::<f64>() < rate {
            println!("  simulated failure (rate {:.0}%)", rate * 100.0);
            if message.kind == MessageKind::Prepare {
                let vote = Message::bare(MessageKind::VoteNo, message.transaction_id.clone());
                if let Ok(json) = vote.to_json() {
                    let _ = transport::write_reply(&mut stream, &json).await;
                }
            }
            return;
        }

        let reply = match message.kind {
            MessageKind::Prepare => self.handle_prepare(message),
            MessageKind::Commit => self.handle_commit(message),
            MessageKind::Abort => self.handle_abort(message),
            MessageKind::QueryState => Some(self.query_state_reply(&message.transaction_id)),
            other => {
                tracing::debug!("unexpected inbound kind {}", other);
                None
            }
        };
        if let Some(reply) = reply {
            match reply.to_json() {
                Ok(json) => {
                    if let Err(e) = transport::write_reply(&mut stream, &json).await {
                        tracing::warn!("reply to {} failed: {}", addr, e);
                    }
                }
                Err(e) => tracing::warn!("reply encode failed: {}", e),
            }
        }
    }

    /// PREPARE parks in the vote slot; no reply travels on this connection.
    fn handle_prepare(self: &Arc<Self>, message: Message) -> Option<Message> {
        println!("  payload: {}", Value::Object(message.data.clone()));
        println!(
            "  waiting for vote (vote yes|no, auto-NO after {:?})",
            self.config.decision_timeout
        );
        let transaction_id = message.transaction_id.clone();
        {
            let mut state = self.state.lock();
            if let Some(mut old) = state.pending_vote.take() {
                old.cancel_timer();
            }
            state.pending_vote = Some(PendingSlot::new(transaction_id.clone(), message.data));
        }
        self.arm_timer(SlotKind::Vote, transaction_id);
        None
    }

    /// COMMIT for an unprepared transaction is rejected with ACK_ABORT on
    /// the spot; otherwise it parks in the commit slot.
    fn handle_commit(self: &Arc<Self>, message: Message) -> Option<Message> {
        let transaction_id = message.transaction_id.clone();
        {
            let mut state = self.state.lock();
            if !state.prepared.contains(&transaction_id) {
                drop(state);
                println!("  transaction not prepared, rejecting with ACK_ABORT");
                return Some(Message::bare(MessageKind::AckAbort, transaction_id));
            }
            if let Some(mut old) = state.pending_commit.take() {
                old.cancel_timer();
            }
            state.pending_commit = Some(PendingSlot::new(transaction_id.clone(), message.data));
        }
        println!(
            "  waiting for confirmation (ack commit|abort, auto-ACK after {:?})",
            self.config.decision_timeout
        );
        self.arm_timer(SlotKind::Commit, transaction_id);
        None
    }

    /// ABORT parks in the abort slot; it is valid for unknown ids too.
    fn handle_abort(self: &Arc<Self>, message: Message) -> Option<Message> {
        let transaction_id = message.transaction_id.clone();
        {
            let mut state = self.state.lock();
            if let Some(mut old) = state.pending_abort.take() {
                old.cancel_timer();
            }
            state.pending_abort = Some(PendingSlot::new(transaction_id.clone(), message.data));
        }
        println!(
            "  waiting for confirmation (ack abort, auto-ACK after {:?})",
            self.config.decision_timeout
        );
        self.arm_timer(SlotKind::Abort, transaction_id);
        None
    }

    /// QUERY_STATE is answered synchronously from the three collections.
    fn query_state_reply(&self, transaction_id: &str) -> Message {
        let (status, data) = {
            let state = self.state.lock();
            if let Some(data) = state.committed.get(transaction_id) {
                ("COMMITTED", data.clone())
            } else if state.prepared.contains(transaction_id) {
                ("PREPARED", Map::new())
            } else if state.aborted.contains(transaction_id) {
                ("ABORTED", Map::new())
            } else {
                ("UNKNOWN", Map::new())
            }
        };
        println!("  state query: {}", status);
        Message::state_response(transaction_id, status, data)
    }

    /// Spawn the slot's timeout task and attach its handle to the slot, so
    /// operator resolution can cancel it. The task re-checks that the slot
    /// still holds its transaction before acting.
    fn arm_timer(self: &Arc<Self>, kind: SlotKind, transaction_id: String) {
        let participant = Arc::clone(self);
        let tx = transaction_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(participant.config.decision_timeout).await;
            participant.timeout_fire(kind, &tx).await;
        });

        let mut state = self.state.lock();
        let slot = match kind {
            SlotKind::Vote => &mut state.pending_vote,
            SlotKind::Commit => &mut state.pending_commit,
            SlotKind::Abort => &mut state.pending_abort,
        };
        match slot {
            Some(pending) if pending.transaction_id == transaction_id => {
                pending.timer = Some(handle)
            }
            // The slot was already resolved or replaced; this timer is stale.
            _ => handle.abort(),
        }
    }

    /// Timeout resolution for a pending slot that was never answered.
    async fn timeout_fire(self: &Arc<Self>, kind: SlotKind, transaction_id: &str) {
        // Take the slot only if it still holds our transaction; do not touch
        // the timer handle (it is this task).
        let slot = {
            let mut state = self.state.lock();
            let slot = match kind {
                SlotKind::Vote => &mut state.pending_vote,
                SlotKind::Commit => &mut state.pending_commit,
                SlotKind::Abort => &mut state.pending_abort,
            };
            let still_ours = slot
                .as_ref()
                .map(|pending| pending.transaction_id == transaction_id)
                .unwrap_or(false);
            if still_ours {
                slot.take()
            } else {
                None
            }
        };
        let Some(slot) = slot else {
            return;
        };

        match kind {
            SlotKind::Vote => {
                println!("\nvote timed out for {}, voting NO", transaction_id);
                self.send_vote(transaction_id, false).await;
            }
            SlotKind::Commit => {
                println!(
                    "\nconfirmation timed out for {}, defaulting to ACK_COMMIT",
                    transaction_id
                );
                self.apply_commit(transaction_id, slot.data);
                self.send_ack(transaction_id, true).await;
            }
            SlotKind::Abort => {
                println!(
                    "\nconfirmation timed out for {}, defaulting to ACK_ABORT",
                    transaction_id
                );
                self.apply_abort(transaction_id);
                self.send_ack(transaction_id, false).await;
            }
        }
    }

    /// Operator vote on the pending PREPARE.
    pub async fn vote(&self, yes: bool) {
        let slot = {
            let mut state = self.state.lock();
            state.pending_vote.take()
        };
        let Some(mut slot) = slot else {
            println!("no pending vote");
            return;
        };
        slot.cancel_timer();
        println!(
            "voting on transaction {} ({})",
            slot.transaction_id,
            Value::Object(slot.data.clone())
        );
        self.send_vote(&slot.transaction_id, yes).await;
    }

    /// Operator acknowledgement. `ack commit` resolves the pending COMMIT;
    /// `ack abort` resolves the pending COMMIT (operator override) or the
    /// pending ABORT, whichever is present.
    pub async fn ack(&self, commit: bool) {
        if commit {
            let slot = {
                let mut state = self.state.lock();
                state.pending_commit.take()
            };
            let Some(mut slot) = slot else {
                println!("no pending COMMIT");
                return;
            };
            slot.cancel_timer();
            println!("confirming transaction {}", slot.transaction_id);
            self.apply_commit(&slot.transaction_id, slot.data.clone());
            self.send_ack(&slot.transaction_id, true).await;
        } else {
            let slot = {
                let mut state = self.state.lock();
                state
                    .pending_commit
                    .take()
                    .or_else(|| state.pending_abort.take())
            };
            let Some(mut slot) = slot else {
                println!("no pending COMMIT or ABORT");
                return;
            };
            slot.cancel_timer();
            println!("confirming transaction {}", slot.transaction_id);
            self.apply_abort(&slot.transaction_id);
            self.send_ack(&slot.transaction_id, false).await;
        }
    }

    /// prepared -> committed; only a prepared transaction may commit.
    fn apply_commit(&self, transaction_id: &str, data: Map<String, Value>) -> bool {
        let mut state = self.state.lock();
        if state.prepared.remove(transaction_id) {
            state.committed.insert(transaction_id.to_string(), data);
            true
        } else {
            false
        }
    }

    /// prepared (or absent) -> aborted.
    fn apply_abort(&self, transaction_id: &str) {
        let mut state = self.state.lock();
        state.prepared.remove(transaction_id);
        state.aborted.insert(transaction_id.to_string());
    }

    /// Push the vote as a control envelope on a fresh connection. Voting
    /// YES records the prepared intention before the wire send.
    async fn send_vote(&self, transaction_id: &str, yes: bool) {
        let kind = if yes {
            self.state
                .lock()
                .prepared
                .insert(transaction_id.to_string());
            println!("  voted YES");
            MessageKind::VoteYes
        } else {
            println!("  voted NO");
            MessageKind::VoteNo
        };
        let frame = ControlFrame::VoteResponse {
            participant_id: self.config.participant_id.clone(),
            message: Message::bare(kind, transaction_id),
        };
        if let Err(e) = self.push_control(frame).await {
            println!("failed to send vote: {}", e);
        }
    }

    /// Push the ACK as a control envelope on a fresh connection.
    async fn send_ack(&self, transaction_id: &str, commit: bool) {
        let kind = if commit {
            MessageKind::AckCommit
        } else {
            MessageKind::AckAbort
        };
        let frame = ControlFrame::AckResponse {
            participant_id: self.config.participant_id.clone(),
            message: Message::bare(kind, transaction_id),
        };
        match self.push_control(frame).await {
            Ok(()) => println!("  acknowledged {}", kind),
            Err(e) => println!("failed to send ACK: {}", e),
        }
    }

    async fn push_control(&self, frame: ControlFrame) -> Result<(), String> {
        let encoded = frame.encode()?;
        transport::send_request(
            &self.config.coordinator_host,
            self.config.coordinator_port,
            &encoded,
            self.config.io_timeout,
            false,
        )
        .await?;
        Ok(())
    }

    /// Operator recovery: re-register, then resynchronise from coordinator
    /// history. A failed re-registration leaves the participant crashed; a
    /// failed history sync recovers without the resync (the next recover can
    /// retry it).
    pub async fn recover(&self) {
        if !self.is_crashed() {
            println!("not crashed");
            return;
        }
        println!("\nrecovering {}...", self.config.participant_id);

        match self.register().await {
            Ok(()) => println!("  re-registered with coordinator"),
            Err(e) => {
                println!("  re-registration failed: {}", e);
                return;
            }
        }

        println!("  requesting decision history...");
        match self.fetch_history().await {
            Ok(count) => {
                println!("  synced {} history record(s)", count);
                self.crashed.store(false, Ordering::SeqCst);
                println!("{} recovered", self.config.participant_id);
            }
            Err(e) => {
                println!("  history sync failed: {}", e);
                self.crashed.store(false, Ordering::SeqCst);
                println!("{} recovered without history", self.config.participant_id);
            }
        }
    }

    async fn fetch_history(&self) -> Result<usize, String> {
        let mut payload = Map::new();
        payload.insert(
            "participant_id".to_string(),
            Value::String(self.config.participant_id.clone()),
        );
        let request = Message::new(MessageKind::RequestHistory, HISTORY_SENTINEL, payload);
        let frame = ControlFrame::HistoryRequest {
            participant_id: self.config.participant_id.clone(),
            message: request,
        }
        .encode()?;

        let reply = transport::send_request(
            &self.config.coordinator_host,
            self.config.coordinator_port,
            &frame,
            self.config.io_timeout,
            true,
        )
        .await?
        .ok_or_else(|| "Coordinator closed without a history reply".to_string())?;

        let response = Message::from_json(&reply)?;
        if response.kind != MessageKind::HistoryResponse {
            return Err(format!("Unexpected history reply: {}", response.kind));
        }
        let records: Vec<HistoryRecord> = serde_json::from_value(
            response
                .data
                .get("history")
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new())),
        )
        .map_err(|e| format!("History decode error: {}", e))?;

        let count = records.len();
        self.apply_history(&records);
        Ok(count)
    }

    /// Promote prepared transactions along recorded decisions; terminal
    /// outcomes the participant never saw are inserted directly.
    fn apply_history(&self, records: &[HistoryRecord]) {
        let mut state = self.state.lock();
        for record in records {
            match record.status {
                Decision::Committed => {
                    state.prepared.remove(&record.transaction_id);
                    state
                        .committed
                        .insert(record.transaction_id.clone(), record.data.clone());
                }
                Decision::Aborted => {
                    state.prepared.remove(&record.transaction_id);
                    state.aborted.insert(record.transaction_id.clone());
                }
            }
        }
    }

    // ---- Inspection (shell and tests) ----

    pub fn failure_rate(&self) -> f64 {
        self.state.lock().failure_rate
    }

    pub fn set_failure_rate(&self, rate: f64) -> Result<(), String> {
        if !(0.0..=1.0).contains(&rate) {
            return Err("failure rate must be between 0.0 and 1.0".to_string());
        }
        self.state.lock().failure_rate = rate;
        Ok(())
    }

    pub fn pending_vote(&self) -> Option<(String, Map<String, Value>)> {
        self.state
            .lock()
            .pending_vote
            .as_ref()
            .map(|slot| (slot.transaction_id.clone(), slot.data.clone()))
    }

    pub fn pending_commit_id(&self) -> Option<String> {
        self.state
            .lock()
            .pending_commit
            .as_ref()
            .map(|slot| slot.transaction_id.clone())
    }

    pub fn pending_abort_id(&self) -> Option<String> {
        self.state
            .lock()
            .pending_abort
            .as_ref()
            .map(|slot| slot.transaction_id.clone())
    }

    pub fn is_prepared(&self, transaction_id: &str) -> bool {
        self.state.lock().prepared.contains(transaction_id)
    }

    pub fn is_aborted(&self, transaction_id: &str) -> bool {
        self.state.lock().aborted.contains(transaction_id)
    }

    pub fn committed_data(&self, transaction_id: &str) -> Option<Map<String, Value>> {
        self.state.lock().committed.get(transaction_id).cloned()
    }

    pub fn committed_snapshot(&self) -> Vec<(String, Map<String, Value>)> {
        self.state
            .lock()
            .committed
            .iter()
            .map(|(id, data)| (id.clone(), data.clone()))
            .collect()
    }

    /// (prepared, committed, aborted) collection sizes.
    pub fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (
            state.prepared.len(),
            state.committed.len(),
            state.aborted.len(),
        )
    }
}

//! 2PC Coordinator
//!
//! Accepts participant registrations, originates transactions and drives them
//! through PREPARE -> vote collection -> COMMIT/ABORT -> ACK collection,
//! retains the transaction table and an append-only decision history, and
//! serves that history to recovering peers.
//!
//! One driver task runs per active transaction so the operator shell stays
//! responsive and can crash the node mid-flight. The crash flag is the sole
//! cancellation token: the driver tests it at every poll iteration and before
//! every outbound send, and bails out leaving the record non-terminal for the
//! recovery reconciler.

use crate::protocol::{
    ControlFrame, Decision, HistoryRecord, Message, MessageKind, REGISTER_OK,
};
use crate::transport;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Network address of a registered participant.
pub type PeerAddr = (String, u16);

/// Coordinator-side transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    #[serde(rename = "PREPARING")]
    Preparing,
    #[serde(rename = "COMMITTING")]
    Committing,
    #[serde(rename = "ABORTING")]
    Aborting,
    #[serde(rename = "COMMITTED")]
    Committed,
    #[serde(rename = "ABORTED")]
    Aborted,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Committed | TxStatus::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Preparing => "PREPARING",
            TxStatus::Committing => "COMMITTING",
            TxStatus::Aborting => "ABORTING",
            TxStatus::Committed => "COMMITTED",
            TxStatus::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded ACK outcome per cohort member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    AckCommit,
    AckAbort,
    Timeout,
}

impl AckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckOutcome::AckCommit => "ACK_COMMIT",
            AckOutcome::AckAbort => "ACK_ABORT",
            AckOutcome::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-transaction record. Created at transaction start, never destroyed;
/// the cohort is the participant snapshot taken at that moment.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub data: Map<String, Value>,
    pub cohort: Vec<String>,
    pub votes: HashMap<String, bool>,
    pub acks: HashMap<String, AckOutcome>,
    pub status: TxStatus,
}

/// Coordinator tuning knobs. Defaults match the reference protocol timings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub host: String,
    pub port: u16,
    /// Window for vote collection after PREPARE dispatch.
    pub vote_wait: Duration,
    /// Window for ACK collection after the decision dispatch.
    pub ack_wait: Duration,
    /// Driver poll interval while waiting for votes or ACKs.
    pub poll_interval: Duration,
    /// Connect/read timeout for outbound sends.
    pub io_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5000,
            vote_wait: Duration::from_secs(60),
            ack_wait: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            io_timeout: transport::IO_TIMEOUT,
        }
    }
}

pub(crate) struct CoordinatorState {
    pub(crate) participants: HashMap<String, PeerAddr>,
    pub(crate) transactions: HashMap<String, TransactionRecord>,
    pub(crate) history: Vec<HistoryRecord>,
}

/// The cluster's single transaction coordinator.
pub struct Coordinator {
    pub(crate) config: CoordinatorConfig,
    pub(crate) state: Mutex<CoordinatorState>,
    crashed: AtomicBool,
    shutdown: AtomicBool,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CoordinatorState {
                participants: HashMap::new(),
                transactions: HashMap::new(),
                history: Vec::new(),
            }),
            crashed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
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
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if coordinator.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match tokio::time::timeout(Duration::from_secs(1), listener.accept()).await {
                    Err(_) => continue,
                    Ok(Err(e)) => {
                        if !coordinator.shutdown.load(Ordering::SeqCst) {
                            tracing::warn!("accept failed: {}", e);
                        }
                    }
                    Ok(Ok((stream, addr))) => {
                        let worker = Arc::clone(&coordinator);
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

    /// Set the crash flag. Returns false when already crashed.
    pub fn crash(&self) -> bool {
        !self.crashed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn clear_crashed(&self) {
        self.crashed.store(false, Ordering::SeqCst);
    }

    /// One worker per accepted connection: read a single control envelope,
    /// dispatch it, reply where the envelope calls for one. All errors stop
    /// at this boundary.
    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
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

        let frame = match ControlFrame::parse(&frame) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("dropping malformed frame from {}: {}", addr, e);
                return;
            }
        };

        // While crashed only registration and history requests are served;
        // deferred votes and ACKs are refused.
        if self.is_crashed()
            && !matches!(
                frame,
                ControlFrame::Register { .. } | ControlFrame::HistoryRequest { .. }
            )
        {
            println!("crashed: refusing {}", frame_name(&frame));
            return;
        }

        match frame {
            ControlFrame::Register {
                participant_id,
                host,
                port,
            } => {
                self.register_participant(&participant_id, host.clone(), port);
                println!("participant registered: {} ({}:{})", participant_id, host, port);
                if let Err(e) = transport::write_reply(&mut stream, REGISTER_OK).await {
                    tracing::warn!("register reply to {} failed: {}", participant_id, e);
                }
            }
            ControlFrame::VoteResponse {
                participant_id,
                message,
            } => {
                println!(
                    "deferred vote from {}: {} (transaction {})",
                    participant_id, message.kind, message.transaction_id
                );
                self.record_vote(&participant_id, &message);
            }
            ControlFrame::AckResponse {
                participant_id,
                message,
            } => {
                println!(
                    "deferred ACK from {}: {} (transaction {})",
                    participant_id, message.kind, message.transaction_id
                );
                self.record_ack(&participant_id, &message);
            }
            ControlFrame::HistoryRequest { participant_id, .. } => {
                println!("history request from {}", participant_id);
                let history = self.state.lock().history.clone();
                let count = history.len();
                match Message::history_response(&history).and_then(|m| m.to_json()) {
                    Ok(reply) => {
                        if let Err(e) = transport::write_reply(&mut stream, &reply).await {
                            tracing::warn!("history reply to {} failed: {}", participant_id, e);
                        } else {
                            println!("sent {} history records to {}", count, participant_id);
                        }
                    }
                    Err(e) => tracing::warn!("history encode failed: {}", e),
                }
            }
        }
    }

    pub(crate) fn register_participant(&self, participant_id: &str, host: String, port: u16) {
        self.state
            .lock()
            .participants
            .insert(participant_id.to_string(), (host, port));
    }

    /// Record a vote. Votes for unknown or already-terminal transactions are
    /// discarded so that late arrivals can never rewrite a decision.
    pub(crate) fn record_vote(&self, participant_id: &str, message: &Message) {
        let yes = match message.kind {
            MessageKind::VoteYes => true,
            MessageKind::VoteNo => false,
            _ => return,
        };
        let mut state = self.state.lock();
        match state.transactions.get_mut(&message.transaction_id) {
            Some(record) if !record.status.is_terminal() => {
                record.votes.insert(participant_id.to_string(), yes);
            }
            Some(_) => {
                tracing::debug!(
                    "discarding late vote from {} for terminal transaction {}",
                    participant_id,
                    message.transaction_id
                );
            }
            None => {
                tracing::debug!(
                    "discarding vote from {} for unknown transaction {}",
                    participant_id,
                    message.transaction_id
                );
            }
        }
    }

    /// Record an ACK, with the same terminal-transaction guard as votes.
    pub(crate) fn record_ack(&self, participant_id: &str, message: &Message) {
        let outcome = match message.kind {
            MessageKind::AckCommit => AckOutcome::AckCommit,
            MessageKind::AckAbort => AckOutcome::AckAbort,
            _ => return,
        };
        self.record_ack_outcome(&message.transaction_id, participant_id, outcome);
    }

    fn record_ack_outcome(&self, transaction_id: &str, participant_id: &str, outcome: AckOutcome) {
        let mut state = self.state.lock();
        match state.transactions.get_mut(transaction_id) {
            Some(record) if !record.status.is_terminal() => {
                record.acks.insert(participant_id.to_string(), outcome);
            }
            _ => {
                tracing::debug!(
                    "discarding late ACK from {} for transaction {}",
                    participant_id,
                    transaction_id
                );
            }
        }
    }

    /// Run one transaction through both phases. Returns true iff the
    /// decision was COMMIT and the driver ran to completion.
    pub async fn execute_transaction(self: Arc<Self>, data: Map<String, Value>) -> bool {
        if self.is_crashed() {
            println!("coordinator is crashed, cannot start a new transaction");
            return false;
        }

        // Snapshot the cohort; registry changes no longer affect this
        // transaction.
        let cohort: Vec<String> = {
            let state = self.state.lock();
            state.participants.keys().cloned().collect()
        };
        if cohort.is_empty() {
            println!("no participants available");
            return false;
        }

        let transaction_id = crate::protocol::mint_transaction_id();
        self.state.lock().transactions.insert(
            transaction_id.clone(),
            TransactionRecord {
                data: data.clone(),
                cohort: cohort.clone(),
                votes: HashMap::new(),
                acks: HashMap::new(),
                status: TxStatus::Preparing,
            },
        );

        println!("\n{}", "=".repeat(60));
        println!("new transaction: {}", transaction_id);
        println!("payload: {}", Value::Object(data.clone()));
        println!("cohort size: {}", cohort.len());
        println!("{}", "=".repeat(60));

        // ---- Phase 1: PREPARE ----
        println!("\n[phase 1/2] PREPARE");
        let prepare = Message::new(MessageKind::Prepare, transaction_id.as_str(), data.clone());
        for participant_id in &cohort {
            if self.is_crashed() {
                println!(
                    "coordinator crashed, transaction {} interrupted in phase 1",
                    transaction_id
                );
                return false;
            }
            match self.push(participant_id, &prepare, true).await {
                Some(reply) if reply.kind == MessageKind::VoteYes => {
                    self.record_vote(participant_id, &reply);
                    println!("PREPARE to {}: VOTE_YES (immediate)", participant_id);
                }
                Some(reply) if reply.kind == MessageKind::VoteNo => {
                    self.record_vote(participant_id, &reply);
                    println!("PREPARE to {}: VOTE_NO (immediate)", participant_id);
                }
                _ => println!("PREPARE to {}: vote deferred", participant_id),
            }
        }

        println!("waiting for votes...");
        let completed = self
            .await_responses(&transaction_id, cohort.len(), self.config.vote_wait, "votes", |r| {
                r.votes.len()
            })
            .await;
        if !completed {
            println!(
                "coordinator crashed, transaction {} interrupted in phase 1",
                transaction_id
            );
            return false;
        }

        // Members without a recorded vote at the deadline count as NO.
        let timed_out: Vec<String> = {
            let mut state = self.state.lock();
            let mut missing = Vec::new();
            if let Some(record) = state.transactions.get_mut(&transaction_id) {
                missing = cohort
                    .iter()
                    .filter(|pid| !record.votes.contains_key(*pid))
                    .cloned()
                    .collect();
                for pid in &missing {
                    record.votes.insert(pid.clone(), false);
                }
            }
            missing
        };
        for participant_id in &timed_out {
            println!("{} vote timed out, counted as NO", participant_id);
        }

        let votes: HashMap<String, bool> = {
            let state = self.state.lock();
            state
                .transactions
                .get(&transaction_id)
                .map(|record| record.votes.clone())
                .unwrap_or_default()
        };
        let yes_count = votes.values().filter(|yes| **yes).count();
        println!("vote result: {}/{} yes", yes_count, votes.len());

        // The decision is taken here and is final.
        let decision = if votes.values().all(|yes| *yes) {
            Decision::Committed
        } else {
            Decision::Aborted
        };

        if self.is_crashed() {
            println!(
                "coordinator crashed after the decision, transaction {} left in doubt",
                transaction_id
            );
            return false;
        }

        // ---- Phase 2: COMMIT / ABORT ----
        let (kind, phase_status) = match decision {
            Decision::Committed => (MessageKind::Commit, TxStatus::Committing),
            Decision::Aborted => (MessageKind::Abort, TxStatus::Aborting),
        };
        println!("\n[phase 2/2] {}", kind);
        if let Some(record) = self.state.lock().transactions.get_mut(&transaction_id) {
            record.status = phase_status;
        }

        let outbound = Message::new(kind, transaction_id.as_str(), data.clone());
        for participant_id in &cohort {
            if self.is_crashed() {
                println!(
                    "coordinator crashed, some cohort members missed the {}",
                    kind
                );
                return false;
            }
            match self.push(participant_id, &outbound, true).await {
                Some(reply) if reply.kind == MessageKind::AckCommit => {
                    self.record_ack_outcome(&transaction_id, participant_id, AckOutcome::AckCommit);
                    println!("{} to {}: ACK_COMMIT (immediate)", kind, participant_id);
                }
                Some(reply) if reply.kind == MessageKind::AckAbort => {
                    self.record_ack_outcome(&transaction_id, participant_id, AckOutcome::AckAbort);
                    println!("{} to {}: ACK_ABORT (immediate)", kind, participant_id);
                }
                _ => println!("{} to {}: ACK deferred", kind, participant_id),
            }
        }

        println!("waiting for ACKs...");
        let completed = self
            .await_responses(&transaction_id, cohort.len(), self.config.ack_wait, "ACKs", |r| {
                r.acks.len()
            })
            .await;
        if !completed {
            println!(
                "coordinator crashed while waiting for ACKs on {}",
                transaction_id
            );
            return false;
        }

        let timed_out: Vec<String> = {
            let mut state = self.state.lock();
            let mut missing = Vec::new();
            if let Some(record) = state.transactions.get_mut(&transaction_id) {
                missing = cohort
                    .iter()
                    .filter(|pid| !record.acks.contains_key(*pid))
                    .cloned()
                    .collect();
                for pid in &missing {
                    record.acks.insert(pid.clone(), AckOutcome::Timeout);
                }
            }
            missing
        };
        for participant_id in &timed_out {
            println!("{} ACK timed out", participant_id);
        }

        let acked = self.finalize(&transaction_id, decision);
        println!("\n{}", "=".repeat(60));
        match decision {
            Decision::Committed => println!(
                "transaction {} committed ({}/{} acknowledged)",
                transaction_id,
                acked,
                cohort.len()
            ),
            Decision::Aborted => println!(
                "transaction {} aborted ({}/{} acknowledged)",
                transaction_id,
                acked,
                cohort.len()
            ),
        }
        println!("{}", "=".repeat(60));

        decision == Decision::Committed
    }

    /// Poll the transaction record until `need` responses are in, the window
    /// elapses, or the crash flag trips (returns false in that last case).
    async fn await_responses<F>(
        &self,
        transaction_id: &str,
        need: usize,
        window: Duration,
        what: &str,
        count: F,
    ) -> bool
    where
        F: Fn(&TransactionRecord) -> usize,
    {
        let mut waited = Duration::ZERO;
        let mut ticks: u32 = 0;
        loop {
            if self.is_crashed() {
                return false;
            }
            let have = {
                let state = self.state.lock();
                state
                    .transactions
                    .get(transaction_id)
                    .map(|record| count(record))
                    .unwrap_or(0)
            };
            if have >= need || waited >= window {
                return true;
            }

            tokio::time::sleep(self.config.poll_interval).await;
            waited += self.config.poll_interval;
            ticks += 1;
            if ticks % 5 == 0 {
                println!("  {}/{} {} ({:?} elapsed)", have, need, what, waited);
            }
        }
    }

    /// Append the history record and mark the transaction terminal, in that
    /// order, under one lock acquisition. Idempotent: a transaction that is
    /// already terminal is left untouched. Returns the matching-ACK count.
    pub(crate) fn finalize(&self, transaction_id: &str, decision: Decision) -> usize {
        let expected = match decision {
            Decision::Committed => AckOutcome::AckCommit,
            Decision::Aborted => AckOutcome::AckAbort,
        };
        let timestamp = chrono::Utc::now().timestamp();

        let mut state = self.state.lock();
        let Some(record) = state.transactions.get(transaction_id) else {
            return 0;
        };
        let acked = record
            .acks
            .values()
            .filter(|outcome| **outcome == expected)
            .count();
        if record.status.is_terminal() {
            return acked;
        }

        let data = record.data.clone();
        state.history.push(HistoryRecord {
            transaction_id: transaction_id.to_string(),
            status: decision,
            data,
            timestamp,
        });
        if let Some(record) = state.transactions.get_mut(transaction_id) {
            record.status = match decision {
                Decision::Committed => TxStatus::Committed,
                Decision::Aborted => TxStatus::Aborted,
            };
        }
        acked
    }

    /// Serialize and send one message to a registered participant; any
    /// transport or decode failure is logged and treated as no reply. The
    /// crash flag is NOT consulted here: callers on the normal path gate
    /// themselves, and recovery deliberately bypasses the gate.
    pub(crate) async fn push(
        &self,
        participant_id: &str,
        message: &Message,
        await_reply: bool,
    ) -> Option<Message> {
        let addr = self.state.lock().participants.get(participant_id).cloned();
        let Some((host, port)) = addr else {
            tracing::warn!("no registered address for {}", participant_id);
            return None;
        };
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("encode for {} failed: {}", participant_id, e);
                return None;
            }
        };
        match transport::send_request(&host, port, &frame, self.config.io_timeout, await_reply)
            .await
        {
            Ok(Some(reply)) => match Message::from_json(&reply) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!("bad reply from {}: {}", participant_id, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("send to {} failed: {}", participant_id, e);
                None
            }
        }
    }

    // ---- Inspection (shell and tests) ----

    pub fn participants(&self) -> Vec<(String, PeerAddr)> {
        self.state
            .lock()
            .participants
            .iter()
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect()
    }

    pub fn transaction(&self, transaction_id: &str) -> Option<TransactionRecord> {
        self.state.lock().transactions.get(transaction_id).cloned()
    }

    pub fn transactions(&self) -> Vec<(String, TransactionRecord)> {
        self.state
            .lock()
            .transactions
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    pub fn history(&self) -> Vec<HistoryRecord> {
        self.state.lock().history.clone()
    }
}

fn frame_name(frame: &ControlFrame) -> &'static str {
    match frame {
        ControlFrame::Register { .. } => "REGISTER",
        ControlFrame::VoteResponse { .. } => "VOTE_RESPONSE",
        ControlFrame::AckResponse { .. } => "ACK_RESPONSE",
        ControlFrame::HistoryRequest { .. } => "HISTORY_REQUEST",
    }
}

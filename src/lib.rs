//! Accord - Interactive Two-Phase Commit Cluster
//!
//! A didactic 2PC deployment: one coordinator and N participants exchange
//! single-shot TCP messages while an operator drives votes, acknowledgements
//! and simulated crashes from interactive shells.
//!
//! # Architecture
//!
//! - Protocol Layer: JSON message envelopes + pipe-delimited control frames
//! - Transport Layer: one-request-per-connection TCP with Tokio
//! - Coordinator: transaction driver, decision history, crash reconciler
//! - Participant: vote/decision state machine with operator-arbitrated
//!   pending slots
//! - Shell Layer: operator command loops for both roles

pub mod protocol;
pub mod transport;

// Coordinator-side modules
pub mod coordinator;
pub mod recovery;

// Participant-side module
pub mod participant;

// Operator surface
pub mod shell;

pub use coordinator::{
    AckOutcome, Coordinator, CoordinatorConfig, PeerAddr, TransactionRecord, TxStatus,
};
pub use participant::{Participant, ParticipantConfig};
pub use protocol::{
    mint_transaction_id, ControlFrame, Decision, HistoryRecord, Message, MessageKind,
};
pub use recovery::{reconcile_decision, ObservedState, StateTally};

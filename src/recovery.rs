//! Coordinator Crash Recovery
//!
//! Completes in-flight transactions after a simulated crash. The reconciler
//! enumerates every non-terminal record, queries the surviving cohort for
//! its view, and re-drives the decision:
//!
//! - PREPARING: commit iff the vote map is complete and unanimously YES,
//!   otherwise abort.
//! - COMMITTING: the decision was already taken; always finish the COMMIT.
//! - ABORTING: always finish the ABORT. Never flips to commit.
//!
//! Recovery runs on its own send path and never consults the crash flag;
//! the flag is cleared once reconciliation is done. History rows are
//! appended through the same idempotent finalize step the driver uses, so
//! replaying recovery on a consistent cluster is a no-op.

use crate::coordinator::{Coordinator, TransactionRecord, TxStatus};
use crate::protocol::{Decision, Message, MessageKind};
use serde_json::Value;
use std::sync::Arc;

/// Participant-reported state for one transaction, per STATE_RESPONSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    Prepared,
    Committed,
    Aborted,
    Unknown,
}

impl ObservedState {
    pub fn from_token(token: &str) -> Self {
        match token {
            "PREPARED" => ObservedState::Prepared,
            "COMMITTED" => ObservedState::Committed,
            "ABORTED" => ObservedState::Aborted,
            _ => ObservedState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObservedState::Prepared => "PREPARED",
            ObservedState::Committed => "COMMITTED",
            ObservedState::Aborted => "ABORTED",
            ObservedState::Unknown => "UNKNOWN",
        }
    }
}

/// Cohort-wide tally of observed states.
#[derive(Debug, Default, Clone, Copy)]
pub struct StateTally {
    pub prepared: usize,
    pub committed: usize,
    pub aborted: usize,
    pub unknown: usize,
}

impl StateTally {
    fn add(&mut self, observed: ObservedState) {
        match observed {
            ObservedState::Prepared => self.prepared += 1,
            ObservedState::Committed => self.committed += 1,
            ObservedState::Aborted => self.aborted += 1,
            ObservedState::Unknown => self.unknown += 1,
        }
    }
}

/// The reconciliation decision table. Returns `None` for transactions that
/// are already terminal. The decision is immutable once taken: an ABORTING
/// record can never be committed, and a COMMITTING record is always driven
/// to commit regardless of what the cohort reports.
pub fn reconcile_decision(status: TxStatus, votes_complete_all_yes: bool) -> Option<Decision> {
    match status {
        TxStatus::Preparing => Some(if votes_complete_all_yes {
            Decision::Committed
        } else {
            Decision::Aborted
        }),
        TxStatus::Committing => Some(Decision::Committed),
        TxStatus::Aborting => Some(Decision::Aborted),
        TxStatus::Committed | TxStatus::Aborted => None,
    }
}

impl Coordinator {
    /// Reconcile every unfinished transaction, then clear the crash flag.
    pub async fn recover(self: &Arc<Self>) {
        println!("\nstarting coordinator recovery...");
        println!("{}", "=".repeat(60));

        let unfinished: Vec<(String, TransactionRecord)> = {
            let state = self.state.lock();
            state
                .transactions
                .iter()
                .filter(|(_, record)| !record.status.is_terminal())
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect()
        };

        if unfinished.is_empty() {
            println!("no unfinished transactions");
            self.clear_crashed();
            return;
        }
        println!("found {} unfinished transaction(s)", unfinished.len());

        for (transaction_id, record) in unfinished {
            println!("\nreconciling {} ({})", transaction_id, record.status);
            println!("  payload: {}", Value::Object(record.data.clone()));

            let mut tally = StateTally::default();
            for participant_id in &record.cohort {
                let registered = self
                    .state
                    .lock()
                    .participants
                    .contains_key(participant_id);
                if !registered {
                    println!("  {}: not registered", participant_id);
                    continue;
                }
                let observed = self
                    .query_participant_state(participant_id, &transaction_id)
                    .await;
                println!("  {}: {}", participant_id, observed.as_str());
                tally.add(observed);
            }
            println!(
                "  observed: {} prepared, {} committed, {} aborted, {} unknown",
                tally.prepared, tally.committed, tally.aborted, tally.unknown
            );

            let votes_complete_all_yes = record.votes.len() == record.cohort.len()
                && record.votes.values().all(|yes| *yes);
            let Some(decision) = reconcile_decision(record.status, votes_complete_all_yes) else {
                continue;
            };
            match decision {
                Decision::Committed => println!("  decision: complete COMMIT"),
                Decision::Aborted => println!("  decision: complete ABORT"),
            }
            self.finish_decision(&transaction_id, &record, decision).await;
        }

        self.clear_crashed();
        println!("\n{}", "=".repeat(60));
        println!("coordinator recovery complete");
    }

    /// QUERY_STATE one cohort member; any failure reads as UNKNOWN.
    async fn query_participant_state(
        &self,
        participant_id: &str,
        transaction_id: &str,
    ) -> ObservedState {
        let query = Message::bare(MessageKind::QueryState, transaction_id);
        match self.push(participant_id, &query, true).await {
            Some(reply) if reply.kind == MessageKind::StateResponse => reply
                .data
                .get("status")
                .and_then(Value::as_str)
                .map(ObservedState::from_token)
                .unwrap_or(ObservedState::Unknown),
            _ => ObservedState::Unknown,
        }
    }

    /// Re-send the decision to every still-registered cohort member, then
    /// finalize the record (idempotent history append).
    async fn finish_decision(
        &self,
        transaction_id: &str,
        record: &TransactionRecord,
        decision: Decision,
    ) {
        let kind = match decision {
            Decision::Committed => MessageKind::Commit,
            Decision::Aborted => MessageKind::Abort,
        };
        let outbound = Message::new(kind, transaction_id, record.data.clone());

        for participant_id in &record.cohort {
            let registered = self
                .state
                .lock()
                .participants
                .contains_key(participant_id);
            if !registered {
                continue;
            }
            match self.push(participant_id, &outbound, true).await {
                Some(reply)
                    if matches!(reply.kind, MessageKind::AckCommit | MessageKind::AckAbort) =>
                {
                    self.record_ack(participant_id, &reply);
                    println!("  {} to {}: {} (immediate)", kind, participant_id, reply.kind);
                }
                _ => println!("  {} to {}: ACK deferred", kind, participant_id),
            }
        }

        self.finalize(transaction_id, decision);
        println!("  transaction {} is now {}", transaction_id, decision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preparing_commits_only_on_unanimous_yes() {
        assert_eq!(
            reconcile_decision(TxStatus::Preparing, true),
            Some(Decision::Committed)
        );
        assert_eq!(
            reconcile_decision(TxStatus::Preparing, false),
            Some(Decision::Aborted)
        );
    }

    #[test]
    fn test_committing_always_finishes_commit() {
        // The vote summary is irrelevant once the decision was taken.
        assert_eq!(
            reconcile_decision(TxStatus::Committing, false),
            Some(Decision::Committed)
        );
        assert_eq!(
            reconcile_decision(TxStatus::Committing, true),
            Some(Decision::Committed)
        );
    }

    #[test]
    fn test_aborting_never_flips_to_commit() {
        assert_eq!(
            reconcile_decision(TxStatus::Aborting, true),
            Some(Decision::Aborted)
        );
    }

    #[test]
    fn test_terminal_records_are_left_alone() {
        assert_eq!(reconcile_decision(TxStatus::Committed, true), None);
        assert_eq!(reconcile_decision(TxStatus::Aborted, false), None);
    }

    #[test]
    fn test_observed_state_tokens() {
        assert_eq!(ObservedState::from_token("PREPARED"), ObservedState::Prepared);
        assert_eq!(ObservedState::from_token("COMMITTED"), ObservedState::Committed);
        assert_eq!(ObservedState::from_token("ABORTED"), ObservedState::Aborted);
        assert_eq!(ObservedState::from_token("whatever"), ObservedState::Unknown);
        assert_eq!(ObservedState::Prepared.as_str(), "PREPARED");
    }
}

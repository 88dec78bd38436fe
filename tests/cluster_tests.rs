//! End-to-End Cluster Scenarios
//!
//! Each test stands up a real coordinator and participants on localhost
//! TCP with shortened protocol timings, then drives votes and
//! acknowledgements the way an operator would.

use accord_core::{
    Coordinator, CoordinatorConfig, Decision, Participant, ParticipantConfig, TxStatus,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const TICK: Duration = Duration::from_millis(25);

async fn spawn_coordinator(
    vote_wait: Duration,
    ack_wait: Duration,
) -> (Arc<Coordinator>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = CoordinatorConfig {
        host: "127.0.0.1".to_string(),
        port,
        vote_wait,
        ack_wait,
        poll_interval: TICK,
        io_timeout: Duration::from_secs(2),
    };
    let coordinator = Arc::new(Coordinator::new(config));
    coordinator.start(listener);
    (coordinator, port)
}

async fn spawn_participant(
    id: &str,
    coordinator_port: u16,
    decision_timeout: Duration,
) -> Arc<Participant> {
    let participant = listen_participant(id, coordinator_port, decision_timeout).await;
    participant.register().await.unwrap();
    participant
}

/// A participant with a live listener that has not (yet) registered.
async fn listen_participant(
    id: &str,
    coordinator_port: u16,
    decision_timeout: Duration,
) -> Arc<Participant> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut config = ParticipantConfig::new(id);
    config.host = "127.0.0.1".to_string();
    config.port = port;
    config.coordinator_host = "127.0.0.1".to_string();
    config.coordinator_port = coordinator_port;
    config.decision_timeout = decision_timeout;
    config.io_timeout = Duration::from_secs(2);
    let participant = Arc::new(Participant::new(config));
    participant.start(listener);
    participant
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(TICK).await;
    }
    panic!("timed out waiting for {}", what);
}

fn payload() -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("account".to_string(), Value::String("alice".to_string()));
    data.insert("amount".to_string(), Value::String("100".to_string()));
    data
}

const LONG: Duration = Duration::from_secs(60);

/// S1: both participants vote yes and ack; everyone ends committed.
#[tokio::test]
async fn test_happy_commit() {
    let (coordinator, port) =
        spawn_coordinator(Duration::from_secs(5), Duration::from_secs(5)).await;
    let p1 = spawn_participant("P1", port, LONG).await;
    let p2 = spawn_participant("P2", port, LONG).await;

    let driver = tokio::spawn(coordinator.clone().execute_transaction(payload()));

    wait_for("PREPARE delivery", || {
        p1.pending_vote().is_some() && p2.pending_vote().is_some()
    })
    .await;
    let (tx, _) = p1.pending_vote().unwrap();
    p1.vote(true).await;
    p2.vote(true).await;

    wait_for("COMMIT delivery", || {
        p1.pending_commit_id().is_some() && p2.pending_commit_id().is_some()
    })
    .await;
    p1.ack(true).await;
    p2.ack(true).await;

    assert!(driver.await.unwrap());

    let history = coordinator.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, Decision::Committed);
    assert_eq!(history[0].transaction_id, tx);
    assert_eq!(history[0].data, payload());

    assert_eq!(p1.committed_data(&tx).unwrap(), payload());
    assert_eq!(p2.committed_data(&tx).unwrap(), payload());
    assert_eq!(
        coordinator.transaction(&tx).unwrap().status,
        TxStatus::Committed
    );
}

/// S2: one NO vote aborts the whole cohort; the YES voter passes through
/// prepared on the way.
#[tokio::test]
async fn test_single_no_vote_aborts_cohort() {
    let (coordinator, port) =
        spawn_coordinator(Duration::from_secs(5), Duration::from_secs(5)).await;
    let p1 = spawn_participant("P1", port, LONG).await;
    let p2 = spawn_participant("P2", port, LONG).await;

    let driver = tokio::spawn(coordinator.clone().execute_transaction(payload()));

    wait_for("PREPARE delivery", || {
        p1.pending_vote().is_some() && p2.pending_vote().is_some()
    })
    .await;
    let (tx, _) = p1.pending_vote().unwrap();
    p1.vote(true).await;
    assert!(p1.is_prepared(&tx));
    p2.vote(false).await;

    wait_for("ABORT delivery", || {
        p1.pending_abort_id().is_some() && p2.pending_abort_id().is_some()
    })
    .await;
    p1.ack(false).await;
    p2.ack(false).await;

    assert!(!driver.await.unwrap());

    let history = coordinator.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, Decision::Aborted);

    for participant in [&p1, &p2] {
        assert!(participant.is_aborted(&tx));
        assert!(participant.committed_data(&tx).is_none());
        assert!(!participant.is_prepared(&tx));
    }
}

/// S3 (coordinator side): a participant that never votes is counted NO at
/// the deadline, and its ACK for the aborted transaction is discarded once
/// the record is terminal.
#[tokio::test]
async fn test_vote_timeout_counts_as_no() {
    let (coordinator, port) =
        spawn_coordinator(Duration::from_secs(1), Duration::from_secs(1)).await;
    let p1 = spawn_participant("P1", port, LONG).await;
    let p2 = spawn_participant("P2", port, LONG).await;

    let driver = tokio::spawn(coordinator.clone().execute_transaction(payload()));

    wait_for("PREPARE delivery", || {
        p1.pending_vote().is_some() && p2.pending_vote().is_some()
    })
    .await;
    let (tx, _) = p1.pending_vote().unwrap();
    p1.vote(true).await;
    // P2 stays silent through the whole vote window.

    assert!(!driver.await.unwrap());

    let record = coordinator.transaction(&tx).unwrap();
    assert_eq!(record.status, TxStatus::Aborted);
    assert_eq!(record.votes["P1"], true);
    assert_eq!(record.votes["P2"], false);
    assert_eq!(coordinator.history().len(), 1);
    assert_eq!(coordinator.history()[0].status, Decision::Aborted);

    // The driver is done; this late acknowledgement must not disturb the
    // recorded outcome.
    wait_for("ABORT delivery", || p1.pending_abort_id().is_some()).await;
    p1.ack(false).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let record = coordinator.transaction(&tx).unwrap();
    assert_eq!(record.acks["P1"], accord_core::AckOutcome::Timeout);
    assert_eq!(coordinator.history().len(), 1);
    assert!(p1.is_aborted(&tx));
}

/// S3 (participant side): the 30-second vote slot defaults to NO; here the
/// slot window is shortened so the auto-vote drives the abort.
#[tokio::test]
async fn test_participant_auto_votes_no() {
    let (coordinator, port) =
        spawn_coordinator(Duration::from_secs(5), Duration::from_secs(1)).await;
    let p1 = spawn_participant("P1", port, Duration::from_millis(300)).await;

    let driver = tokio::spawn(coordinator.clone().execute_transaction(payload()));
    assert!(!driver.await.unwrap());

    let (tx, record) = coordinator.transactions().pop().unwrap();
    assert_eq!(record.votes["P1"], false);
    assert_eq!(record.status, TxStatus::Aborted);
    assert!(!p1.is_prepared(&tx));
}

/// An unresolved COMMIT confirmation defaults to ACK_COMMIT and promotes
/// prepared -> committed.
#[tokio::test]
async fn test_pending_commit_defaults_to_ack_commit() {
    let (coordinator, port) =
        spawn_coordinator(Duration::from_secs(5), Duration::from_secs(5)).await;
    let p1 = spawn_participant("P1", port, Duration::from_secs(1)).await;

    let driver = tokio::spawn(coordinator.clone().execute_transaction(payload()));

    wait_for("PREPARE delivery", || p1.pending_vote().is_some()).await;
    let (tx, _) = p1.pending_vote().unwrap();
    p1.vote(true).await;

    // No manual ack: the slot timer fires and commits.
    assert!(driver.await.unwrap());
    assert_eq!(p1.committed_data(&tx).unwrap(), payload());
    assert_eq!(coordinator.history()[0].status, Decision::Committed);
}

/// A COMMIT for a transaction the participant never prepared is rejected
/// with an immediate ACK_ABORT and leaves no state behind.
#[tokio::test]
async fn test_commit_without_prepare_rejected_on_the_wire() {
    let participant = listen_participant("P1", 1, LONG).await;
    let (host, port) = participant.address();

    let commit = accord_core::Message::new(
        accord_core::MessageKind::Commit,
        "tx000001",
        payload(),
    );
    let reply = accord_core::transport::send_request(
        &host,
        port,
        &commit.to_json().unwrap(),
        Duration::from_secs(2),
        true,
    )
    .await
    .unwrap()
    .expect("expected an immediate rejection");

    let reply = accord_core::Message::from_json(&reply).unwrap();
    assert_eq!(reply.kind, accord_core::MessageKind::AckAbort);
    assert_eq!(reply.transaction_id, "tx000001");
    assert_eq!(participant.counts(), (0, 0, 0));
}

/// Property 7: with an empty registry `tx` refuses and creates no record.
#[tokio::test]
async fn test_zero_participants_creates_no_record() {
    let (coordinator, _port) =
        spawn_coordinator(Duration::from_secs(1), Duration::from_secs(1)).await;

    let committed = coordinator.clone().execute_transaction(payload()).await;
    assert!(!committed);
    assert!(coordinator.transactions().is_empty());
    assert!(coordinator.history().is_empty());
}

/// S4 under refuse-while-crashed semantics: votes pushed during the crash
/// are refused, so recovery finds the vote map incomplete and aborts; the
/// YES voter is walked back from prepared. Replaying recovery afterwards
/// is a no-op.
#[tokio::test]
async fn test_crash_in_phase_one_recovers_to_abort() {
    let (coordinator, port) =
        spawn_coordinator(Duration::from_secs(5), Duration::from_secs(1)).await;
    let p1 = spawn_participant("P1", port, LONG).await;
    let p2 = spawn_participant("P2", port, LONG).await;

    let driver = tokio::spawn(coordinator.clone().execute_transaction(payload()));

    wait_for("PREPARE delivery", || {
        p1.pending_vote().is_some() && p2.pending_vote().is_some()
    })
    .await;
    let (tx, _) = p1.pending_vote().unwrap();

    assert!(coordinator.crash());
    // Both vote during the crash; the control frames are refused.
    p1.vote(true).await;
    p2.vote(true).await;

    assert!(!driver.await.unwrap());
    let record = coordinator.transaction(&tx).unwrap();
    assert_eq!(record.status, TxStatus::Preparing);
    assert!(record.votes.is_empty());

    coordinator.recover().await;
    assert!(!coordinator.is_crashed());

    let history = coordinator.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, Decision::Aborted);

    // The reconciler's ABORT reached both; resolve it and check the cohort
    // stayed atomic.
    wait_for("ABORT delivery", || {
        p1.pending_abort_id().is_some() && p2.pending_abort_id().is_some()
    })
    .await;
    p1.ack(false).await;
    p2.ack(false).await;
    assert!(p1.is_aborted(&tx));
    assert!(p2.is_aborted(&tx));
    assert!(p1.committed_data(&tx).is_none());
    assert!(p2.committed_data(&tx).is_none());

    // Property 5: recovery over a consistent cluster changes nothing.
    assert!(coordinator.crash());
    coordinator.recover().await;
    assert_eq!(coordinator.history().len(), 1);
    assert!(p1.is_aborted(&tx));
    assert!(p2.is_aborted(&tx));
}

/// S5: crash mid-phase-2 after one COMMIT was delivered; recovery drives
/// the COMMIT to completion and history records it exactly once.
#[tokio::test]
async fn test_crash_in_phase_two_completes_commit() {
    let (coordinator, port) =
        spawn_coordinator(Duration::from_secs(5), Duration::from_secs(5)).await;
    let p1 = spawn_participant("P1", port, LONG).await;
    let p2 = spawn_participant("P2", port, LONG).await;

    let driver = tokio::spawn(coordinator.clone().execute_transaction(payload()));

    wait_for("PREPARE delivery", || {
        p1.pending_vote().is_some() && p2.pending_vote().is_some()
    })
    .await;
    let (tx, _) = p1.pending_vote().unwrap();
    p1.vote(true).await;
    p2.vote(true).await;

    wait_for("COMMIT delivery", || {
        p1.pending_commit_id().is_some() && p2.pending_commit_id().is_some()
    })
    .await;
    p1.ack(true).await;
    let tx_for_wait = tx.clone();
    let coordinator_for_wait = Arc::clone(&coordinator);
    wait_for("P1 ACK recorded", move || {
        coordinator_for_wait
            .transaction(&tx_for_wait)
            .map(|record| record.acks.contains_key("P1"))
            .unwrap_or(false)
    })
    .await;

    assert!(coordinator.crash());
    assert!(!driver.await.unwrap());
    assert_eq!(
        coordinator.transaction(&tx).unwrap().status,
        TxStatus::Committing
    );
    assert!(p1.committed_data(&tx).is_some());
    assert!(p2.is_prepared(&tx));

    coordinator.recover().await;

    let history = coordinator.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, Decision::Committed);
    assert_eq!(
        coordinator.transaction(&tx).unwrap().status,
        TxStatus::Committed
    );

    // P2 received the re-sent COMMIT; confirming it lands the whole cohort
    // on committed. P1's state was never disturbed by the duplicate COMMIT.
    wait_for("COMMIT redelivery", || p2.pending_commit_id().is_some()).await;
    p2.ack(true).await;
    assert_eq!(p1.committed_data(&tx).unwrap(), payload());
    assert_eq!(p2.committed_data(&tx).unwrap(), payload());
    assert!(!p1.is_aborted(&tx));
    assert!(!p2.is_aborted(&tx));
}

/// S6: a crashed participant misses a transaction (counted NO), then
/// rejoins and resyncs both outcomes from coordinator history.
#[tokio::test]
async fn test_participant_rejoin_resyncs_history() {
    let (coordinator, port) = spawn_coordinator(
        Duration::from_millis(1500),
        Duration::from_millis(1500),
    )
    .await;
    let p1 = spawn_participant("P1", port, LONG).await;
    let p2 = spawn_participant("P2", port, LONG).await;

    // First transaction commits everywhere.
    let driver = tokio::spawn(coordinator.clone().execute_transaction(payload()));
    wait_for("PREPARE delivery", || {
        p1.pending_vote().is_some() && p2.pending_vote().is_some()
    })
    .await;
    let (tx1, _) = p1.pending_vote().unwrap();
    p1.vote(true).await;
    p2.vote(true).await;
    wait_for("COMMIT delivery", || {
        p1.pending_commit_id().is_some() && p2.pending_commit_id().is_some()
    })
    .await;
    p1.ack(true).await;
    p2.ack(true).await;
    assert!(driver.await.unwrap());

    // P2 crashes; it keeps its registry entry but drops everything, so the
    // second transaction aborts on its missing vote.
    assert!(p2.crash());
    let mut second = Map::new();
    second.insert("account".to_string(), Value::String("bob".to_string()));
    let driver = tokio::spawn(coordinator.clone().execute_transaction(second));
    wait_for("PREPARE delivery", || p1.pending_vote().is_some()).await;
    let (tx2, _) = p1.pending_vote().unwrap();
    p1.vote(true).await;
    assert!(!driver.await.unwrap());

    wait_for("ABORT delivery", || p1.pending_abort_id().is_some()).await;
    p1.ack(false).await;
    assert_eq!(coordinator.history().len(), 2);

    // Rejoin: re-register and pull history.
    p2.recover().await;
    assert!(!p2.is_crashed());
    assert_eq!(p2.committed_data(&tx1).unwrap(), payload());
    assert!(p2.is_aborted(&tx2));
    // Never the opposite outcome anywhere.
    assert!(p2.committed_data(&tx2).is_none());
    assert!(!p1.is_aborted(&tx1));
}

/// Property 6: a vote landing after the decision is terminal is discarded
/// and rewrites nothing.
#[tokio::test]
async fn test_late_vote_discarded_after_decision() {
    let (coordinator, port) = spawn_coordinator(
        Duration::from_millis(300),
        Duration::from_millis(300),
    )
    .await;
    let p1 = spawn_participant("P1", port, LONG).await;

    let driver = tokio::spawn(coordinator.clone().execute_transaction(payload()));
    wait_for("PREPARE delivery", || p1.pending_vote().is_some()).await;
    let (tx, _) = p1.pending_vote().unwrap();

    // Let the whole vote window lapse.
    assert!(!driver.await.unwrap());
    assert_eq!(coordinator.history().len(), 1);
    assert_eq!(coordinator.history()[0].status, Decision::Aborted);

    // The operator votes far too late.
    p1.vote(true).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let record = coordinator.transaction(&tx).unwrap();
    assert_eq!(record.votes["P1"], false);
    assert_eq!(record.status, TxStatus::Aborted);
    assert_eq!(coordinator.history().len(), 1);
}

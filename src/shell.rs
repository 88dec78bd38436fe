//! Operator Shells
//!
//! Purely an operator surface: every command maps onto one core operation.
//! The coordinator shell spawns the transaction driver in the background so
//! `crash` stays available mid-flight.

use crate::coordinator::Coordinator;
use crate::participant::Participant;
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

type InputLines = Lines<BufReader<Stdin>>;

fn prompt(prefix: &str) {
    print!("{}> ", prefix);
    let _ = std::io::stdout().flush();
}

async fn next_line(lines: &mut InputLines) -> Option<String> {
    match lines.next_line().await {
        Ok(Some(line)) => Some(line),
        _ => None,
    }
}

/// Parse comma-separated `k=v` pairs into a payload map; pairs without an
/// `=` are skipped.
fn parse_pairs(input: &str) -> Map<String, Value> {
    let mut data = Map::new();
    for pair in input.split(',') {
        if let Some((key, value)) = pair.split_once('=') {
            data.insert(
                key.trim().to_string(),
                Value::String(value.trim().to_string()),
            );
        }
    }
    data
}

pub async fn coordinator_shell(coordinator: Arc<Coordinator>) {
    println!("\navailable commands:");
    println!("  list    - show registered participants");
    println!("  tx      - start a new transaction");
    println!("  crash   - simulate a crash");
    println!("  recover - reconcile and clear the crash flag");
    println!("  status  - dump the transaction table");
    println!("  quit    - exit");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let prefix = if coordinator.is_crashed() {
            "CRASHED"
        } else {
            "coordinator"
        };
        prompt(prefix);
        let Some(line) = next_line(&mut lines).await else {
            break;
        };
        match line.trim().to_lowercase().as_str() {
            "" => continue,
            "quit" => {
                println!("shutting down coordinator...");
                coordinator.shutdown();
                break;
            }
            "list" => list_participants(&coordinator),
            "tx" => start_transaction(&coordinator, &mut lines).await,
            "crash" => {
                if coordinator.crash() {
                    println!("\ncoordinator crashed");
                    println!("  - new transactions are refused");
                    println!("  - in-flight transactions are suspended");
                    println!("  - use 'recover' to reconcile");
                } else {
                    println!("already crashed");
                }
            }
            "recover" => {
                if coordinator.is_crashed() {
                    coordinator.recover().await;
                } else {
                    println!("not crashed");
                }
            }
            "status" => show_coordinator_status(&coordinator),
            _ => println!("unknown command; use: list, tx, crash, recover, status, quit"),
        }
    }
}

fn list_participants(coordinator: &Coordinator) {
    let participants = coordinator.participants();
    println!("\nregistered participants ({}):", participants.len());
    if participants.is_empty() {
        println!("  (none)");
    }
    for (id, (host, port)) in participants {
        println!("  - {} ({}:{})", id, host, port);
    }
}

async fn start_transaction(coordinator: &Arc<Coordinator>, lines: &mut InputLines) {
    println!("enter transaction data (k=v pairs, e.g. account=alice,amount=100):");
    prompt("data");
    let Some(line) = next_line(lines).await else {
        return;
    };
    let input = line.trim();
    if input.is_empty() {
        println!("transaction data cannot be empty");
        return;
    }
    let data = parse_pairs(input);
    if data.is_empty() {
        println!("invalid data format");
        return;
    }

    let driver = Arc::clone(coordinator);
    tokio::spawn(async move {
        driver.execute_transaction(data).await;
    });
    println!("transaction started in the background; 'crash' works mid-flight");
}

fn show_coordinator_status(coordinator: &Coordinator) {
    let transactions = coordinator.transactions();
    println!("\ntransactions ({}):", transactions.len());
    if transactions.is_empty() {
        println!("  (none)");
    }
    for (id, record) in transactions {
        println!("  {}: {} - {}", id, record.status, Value::Object(record.data));
    }

    let history = coordinator.history();
    println!("history ({}):", history.len());
    for record in history {
        let when = chrono::DateTime::from_timestamp(record.timestamp, 0)
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| record.timestamp.to_string());
        println!("  {}: {} at {}", record.transaction_id, record.status, when);
    }
}

pub async fn participant_shell(participant: Arc<Participant>) {
    println!("\navailable commands:");
    println!("  status            - show participant state");
    println!("  data              - show committed transactions");
    println!("  vote yes|no       - vote on the pending transaction");
    println!("  ack commit|abort  - confirm the pending COMMIT or ABORT");
    println!("  crash             - simulate a crash");
    println!("  recover           - re-register and resync from history");
    println!("  fail              - set the simulated failure rate");
    println!("  quit              - exit");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let prefix = if participant.is_crashed() {
            "CRASHED".to_string()
        } else {
            participant.participant_id().to_string()
        };
        prompt(&prefix);
        let Some(line) = next_line(&mut lines).await else {
            break;
        };
        let command = line.trim().to_lowercase();
        match command.as_str() {
            "" => continue,
            "quit" => {
                println!("shutting down {}...", participant.participant_id());
                participant.shutdown();
                break;
            }
            "status" => show_participant_status(&participant),
            "data" => show_committed(&participant),
            "vote yes" => participant.vote(true).await,
            "vote no" => participant.vote(false).await,
            "ack commit" => participant.ack(true).await,
            "ack abort" => participant.ack(false).await,
            "crash" => {
                if participant.crash() {
                    println!("\n{} crashed", participant.participant_id());
                    println!("  - inbound messages are dropped");
                    println!("  - pending slots are discarded");
                    println!("  - use 'recover' to rejoin");
                } else {
                    println!("already crashed");
                }
            }
            "recover" => participant.recover().await,
            "fail" => set_failure_rate(&participant, &mut lines).await,
            other if other.starts_with("vote") => println!("usage: vote yes|no"),
            other if other.starts_with("ack") => println!("usage: ack commit|abort"),
            _ => println!(
                "unknown command; use: status, data, vote yes|no, ack commit|abort, crash, recover, fail, quit"
            ),
        }
    }
}

fn show_participant_status(participant: &Participant) {
    let (host, port) = participant.address();
    println!("\nparticipant status:");
    println!("  id: {}", participant.participant_id());
    println!("  address: {}:{}", host, port);
    println!(
        "  state: {}",
        if participant.is_crashed() {
            "crashed"
        } else {
            "running"
        }
    );
    println!("  failure rate: {:.0}%", participant.failure_rate() * 100.0);
    if let Some((transaction_id, data)) = participant.pending_vote() {
        println!(
            "  pending vote: {} - {}",
            transaction_id,
            Value::Object(data)
        );
    }
    let (prepared, committed, aborted) = participant.counts();
    println!("  prepared: {}", prepared);
    println!("  committed: {}", committed);
    println!("  aborted: {}", aborted);
}

fn show_committed(participant: &Participant) {
    let committed = participant.committed_snapshot();
    println!("\ncommitted transactions ({}):", committed.len());
    if committed.is_empty() {
        println!("  (none)");
    }
    for (transaction_id, data) in committed {
        println!("  {}: {}", transaction_id, Value::Object(data));
    }
}

async fn set_failure_rate(participant: &Participant, lines: &mut InputLines) {
    prompt("rate (0.0-1.0)");
    let Some(line) = next_line(lines).await else {
        return;
    };
    match line.trim().parse::<f64>() {
        Ok(rate) => match participant.set_failure_rate(rate) {
            Ok(()) => println!("failure rate set to {:.0}%", rate * 100.0),
            Err(e) => println!("{}", e),
        },
        Err(_) => println!("invalid number"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let data = parse_pairs("account=alice, amount=100");
        assert_eq!(data.len(), 2);
        assert_eq!(data["account"], Value::String("alice".to_string()));
        assert_eq!(data["amount"], Value::String("100".to_string()));
    }

    #[test]
    fn test_parse_pairs_skips_malformed() {
        let data = parse_pairs("account=alice,oops,=,");
        assert_eq!(data.len(), 2);
        assert!(data.contains_key("account"));
        assert!(data.contains_key(""));
    }

    #[test]
    fn test_parse_pairs_empty_input() {
        assert!(parse_pairs("no pairs here").is_empty());
    }
}

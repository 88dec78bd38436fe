//! Participant node entry point.

use accord_core::{Participant, ParticipantConfig};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Two-phase commit participant.
#[derive(Parser)]
#[command(name = "participant")]
struct Args {
    /// Participant identifier (e.g. P1)
    participant_id: String,
    /// Listening port
    #[arg(default_value_t = 6000)]
    port: u16,
    /// Coordinator port
    #[arg(default_value_t = 5000)]
    coordinator_port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = ParticipantConfig::new(args.participant_id);
    config.port = args.port;
    config.coordinator_port = args.coordinator_port;
    let participant = Arc::new(Participant::new(config));

    let listener = match participant.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("startup failed: {}", e);
            std::process::exit(1);
        }
    };
    let (host, port) = participant.address();
    println!(
        "participant '{}' listening on {}:{}",
        participant.participant_id(),
        host,
        port
    );
    participant.start(listener);

    match participant.register().await {
        Ok(()) => println!("registered with the coordinator"),
        Err(e) => println!("registration failed: {}", e),
    }
    println!("{}", "=".repeat(60));

    accord_core::shell::participant_shell(participant).await;
}

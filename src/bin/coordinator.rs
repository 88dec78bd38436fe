//! Coordinator node entry point.

use accord_core::{Coordinator, CoordinatorConfig};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Two-phase commit coordinator.
#[derive(Parser)]
#[command(name = "coordinator")]
struct Args {
    /// Listening port
    #[arg(default_value_t = 5000)]
    port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = CoordinatorConfig {
        port: args.port,
        ..CoordinatorConfig::default()
    };
    let host = config.host.clone();
    let coordinator = Arc::new(Coordinator::new(config));

    let listener = match coordinator.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("startup failed: {}", e);
            std::process::exit(1);
        }
    };
    println!("coordinator listening on {}:{}", host, args.port);
    println!("{}", "=".repeat(60));

    coordinator.start(listener);
    accord_core::shell::coordinator_shell(coordinator).await;
}

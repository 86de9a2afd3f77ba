//! device-broker
//!
//! # Architecture Overview
//!
//! ```text
//!   device (no cert)                      device (signed cert)
//!        │ plaintext :8089                     │ mTLS :8088
//!        ▼                                     ▼
//!   ┌──────────────┐                    ┌──────────────┐
//!   │  untrusted   │ signCertificate    │   trusted    │ connect message
//!   │   handler    │──────────┐         │   handler    │──────────┐
//!   └──────────────┘          ▼         └──────────────┘          ▼
//!                     ┌──────────────┐                   ┌──────────────┐
//!                     │  authority   │                   │   session    │──▶ events
//!                     │ (local CA)   │                   │   registry   │
//!                     └──────────────┘                   └──────────────┘
//!        └──────────── attempt tracker (loop detection) ──────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use device_broker::config::{load_config, BrokerConfig};
use device_broker::lifecycle::signals::wait_for_signal;
use device_broker::observability::{logging, metrics};
use device_broker::{Broker, BrokerEvent, LocalAuthority};

#[derive(Parser)]
#[command(name = "device-broker")]
#[command(about = "Desktop-side connection broker for instrumented devices", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `observability.log_level`.
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker until interrupted (default)
    Run,
    /// Print the CA certificate devices must trust, creating it if needed
    CaCert,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => BrokerConfig::default(),
    };
    let level = cli.log_level.as_deref().unwrap_or(&config.observability.log_level);
    logging::init(level);

    let authority = Arc::new(LocalAuthority::from_config(&config.authority));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CaCert => {
            print!("{}", authority.ca_certificate_pem().await?);
            Ok(())
        }
        Commands::Run => run(config, authority).await,
    }
}

async fn run(config: BrokerConfig, authority: Arc<LocalAuthority>) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("device-broker v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_host = %config.listener.bind_host,
        secure_port = config.listener.secure_port,
        insecure_port = config.listener.insecure_port,
        certs = %authority.directory().display(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let broker = Broker::new(config, authority);
    let events = tokio::spawn(log_events(broker.subscribe()));

    broker.init().await?;
    wait_for_signal().await;
    broker.close().await;

    events.abort();
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn log_events(mut rx: tokio::sync::broadcast::Receiver<BrokerEvent>) {
    loop {
        match rx.recv().await {
            Ok(BrokerEvent::Listening { port, secure }) => {
                tracing::info!(port, secure, "Listening");
            }
            Ok(BrokerEvent::NewSession(session)) => {
                tracing::info!(
                    identity = %session.key(),
                    plugins = ?session.plugins(),
                    connected_at = ?session.created_at(),
                    "New session"
                );
            }
            Ok(BrokerEvent::SessionRemoved(key)) => {
                tracing::info!(identity = %key, "Session removed");
            }
            Ok(BrokerEvent::SessionsChanged) => {}
            Ok(BrokerEvent::Error(e)) => {
                tracing::warn!(error = %e, "Broker error");
            }
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Event log lagging");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

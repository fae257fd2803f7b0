//! # stride
//!
//! Terminal front end for a resumable coaching conversation: reads user
//! lines from stdin, streams replies to stdout and reports connectivity.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use stride_client::{
    ClientDeps, ClientNotification, ConnectivityView, ConversationStreamClient, NetworkMonitor,
    NetworkStatus,
};
use stride_core::{MessagePart, SessionId};
use stride_settings::{load_settings, load_settings_from_path, StrideSettings};
use stride_store::{KeyValueStore, MemoryStore, ProgressStore, SqliteStore};
use stride_telemetry::{init_telemetry, TelemetryConfig};
use stride_transport::{HttpTransport, StaticTokenSupplier};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Resumable conversation client.
#[derive(Parser, Debug)]
#[command(name = "stride", about = "Resumable streaming conversation client")]
struct Cli {
    /// Inference endpoint (overrides settings).
    #[arg(long)]
    base_url: Option<String>,

    /// Session to resume; a new one is created when omitted.
    #[arg(long)]
    session: Option<String>,

    /// Bearer token. Falls back to `STRIDE_TOKEN`.
    #[arg(long)]
    token: Option<String>,

    /// Settings file (defaults to `~/.stride/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,
}

/// Progress database, or an in-memory store when the file cannot be opened.
fn open_store(settings: &StrideSettings) -> Arc<dyn KeyValueStore> {
    let path = settings.persistence.resolved_db_path();
    match SqliteStore::open(&path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "progress database unavailable, progress will not survive restart");
            Arc::new(MemoryStore::new())
        }
    }
}

fn print_notification(notification: &ClientNotification) {
    match notification {
        ClientNotification::PartReceived {
            part: MessagePart::Text { text },
            ..
        } => print!("{text}"),
        ClientNotification::PartReceived {
            part: MessagePart::ToolCall { tool_name, .. },
            ..
        } => println!("\n[tool {tool_name}]"),
        ClientNotification::PartReceived { .. } => {}
        ClientNotification::MessageComplete { .. } => println!(),
        ClientNotification::PendingFlushed { message_ids } => {
            println!("[sent {} queued message(s)]", message_ids.len());
        }
        ClientNotification::Fatal(fatal) if fatal.escalate => {
            println!("[error: {}; please contact support]", fatal.message);
        }
        ClientNotification::Fatal(fatal) => {
            println!("[error: {}; type /retry to try again]", fatal.message);
        }
        ClientNotification::StreamEnded => {}
    }
}

fn print_view(view: &ConnectivityView) {
    match view {
        ConnectivityView::Hidden => {}
        ConnectivityView::OfflineBanner => println!("[offline]"),
        ConnectivityView::ReconnectingOverlay {
            message,
            show_retry_button,
        } => {
            if *show_retry_button {
                println!("[{message} - type /retry]");
            } else {
                println!("[{message}]");
            }
        }
        ConnectivityView::BackOnlineBanner { .. } => println!("[back online]"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("Failed to load settings")?;
    if let Some(base_url) = cli.base_url {
        settings.transport.base_url = base_url;
    }

    let _telemetry = init_telemetry(TelemetryConfig::from_level_str(
        &settings.logging.level,
        settings.logging.json,
    ));

    let token = cli
        .token
        .or_else(|| std::env::var("STRIDE_TOKEN").ok())
        .context("No credential: pass --token or set STRIDE_TOKEN")?;
    let transport =
        HttpTransport::from_settings(&settings.transport).context("Failed to build HTTP client")?;
    let network = NetworkMonitor::new(NetworkStatus::default());

    let client = ConversationStreamClient::new(ClientDeps {
        transport: Arc::new(transport),
        tokens: Arc::new(StaticTokenSupplier::new(token)),
        store: ProgressStore::new(open_store(&settings)),
        network: network.clone(),
        settings: settings.clone(),
    });

    let session_id = cli.session.map_or_else(SessionId::new, SessionId::from_raw);
    info!(session_id = %session_id, base_url = %settings.transport.base_url, "starting");
    println!("session {session_id}");

    let mut notifications = client.subscribe();
    let mut view = client.connectivity();
    client.start(session_id)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/retry" => client.retry()?,
                    "/offline" => network.report(NetworkStatus::offline()),
                    "/online" => network.report(NetworkStatus::default()),
                    text => {
                        let _ = client.send(text)?;
                    }
                }
            }
            notification = notifications.recv() => match notification {
                Ok(notification) => print_notification(&notification),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "display fell behind"),
                Err(RecvError::Closed) => break,
            },
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                print_view(&current);
            }
        }
    }

    client.stop().await?;
    Ok(())
}

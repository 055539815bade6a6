/// Smasher daemon - main entry point.
///
/// Reads newline-delimited JSON control requests on stdin and answers with
/// JSON events on stdout. Logs go to stderr so stdout stays machine-readable.
mod config;
mod delivery;
mod link_detector;
mod pipeline;
mod workers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use smasher_shared::ipc_protocol::{message_event, ControlRequest, EventKind};
use config::Config;
use delivery::LineDelivery;
use pipeline::AppState;

const DEFAULT_LOG_DIRECTIVES: &str = "smasher_daemon=info,smasher_shared=info,smasher_downloader=info";

/// Upper bound on waiting for cancelled work to unwind at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES)),
        )
        .init();

    info!("=== Smasher daemon starting ===");

    let config = Config::from_env().context("loading configuration")?;
    for dir in [&config.download_dir, &config.encode_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    info!(
        "Downloads in {}, encodes in {}",
        config.download_dir.display(),
        config.encode_dir.display()
    );

    let (delivery, writer) = LineDelivery::spawn(tokio::io::stdout());
    let state = Arc::new(AppState::new(config, Arc::new(delivery))?);
    info!(
        "Ready: {} part(s) per download, {} extraction worker(s), {} process slot(s)",
        state.config.download_parts,
        state.config.extract_workers,
        state.processes.capacity()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupted = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&state, &line),
                Ok(None) => {
                    info!("Control input closed");
                    break false;
                }
                Err(e) => {
                    error!("Failed to read control input: {}", e);
                    break false;
                }
            },
            _ = tokio::signal::ctrl_c() => break true,
        }
    };

    if interrupted {
        shutdown_now(&state).await;
    } else {
        let active = state.registry.active_count();
        if active > 0 {
            info!("Waiting for {} active task(s) to finish", active);
        }
        tokio::select! {
            _ = state.wait_idle(Duration::from_millis(200)) => {}
            _ = tokio::signal::ctrl_c() => shutdown_now(&state).await,
        }
    }

    drop(state);
    if tokio::time::timeout(Duration::from_secs(2), writer).await.is_err() {
        warn!("Event writer still busy at exit");
    }
    info!("Smasher daemon stopped");
    Ok(())
}

/// Cancel everything and give the cancelled work a bounded time to unwind.
async fn shutdown_now(state: &AppState) {
    let (tasks, processes) = state.cancel_all();
    info!(
        "Interrupted: cancelled {} task(s), signalled {} process(es)",
        tasks, processes
    );
    if tokio::time::timeout(SHUTDOWN_GRACE, state.wait_idle(Duration::from_millis(100)))
        .await
        .is_err()
    {
        warn!("Some work did not unwind within {:?}", SHUTDOWN_GRACE);
    }
}

fn handle_line(state: &Arc<AppState>, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match ControlRequest::from_json_line(line) {
        Ok(request) => pipeline::dispatch(state, request),
        Err(e) => {
            warn!(
                "Invalid control request: {} (line: {})",
                e,
                line.chars().take(200).collect::<String>()
            );
            state.delivery.deliver(message_event(
                "",
                None,
                EventKind::Rejected,
                format!("invalid request: {}", e),
            ));
        }
    }
}

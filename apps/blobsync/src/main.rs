//! blobsync entry point.
//!
//! Resolves configuration from the environment, builds the selected backend,
//! and drives one resumable transfer through the session orchestrator.
//! Interrupts cancel cooperatively; resume state stays on disk either way.

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use blobsync_session::{Session, SessionConfig};
use blobsync_transport::BlockStore;

use crate::config::{Config, TransportKind};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting blobsync");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let store = match config.kind {
        TransportKind::Azure => BlockStore::azure(&config.endpoint, &config.auth),
        TransportKind::S3 => BlockStore::s3(&config.endpoint, &config.auth),
    };
    let store = match store {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to build transport client");
            return ExitCode::FAILURE;
        }
    };

    let mut session_config = SessionConfig::new(
        &config.container,
        &config.remote_key,
        &config.local_path,
        config.expected_size,
    );
    if let Some(part_size) = config.part_size {
        session_config.part_size = part_size;
    }

    let mut session = Session::new(Arc::new(store), session_config);

    // Ctrl-C requests cooperative cancellation; partial progress stays
    // resumable.
    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling transfer");
            cancel.cancel();
        }
    });

    match session.run(config.operation).await {
        Ok(outcome) => {
            info!(
                path = %outcome.local_path.display(),
                bytes = outcome.final_size,
                "transfer succeeded"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "transfer failed; resume state retained");
            ExitCode::FAILURE
        }
    }
}

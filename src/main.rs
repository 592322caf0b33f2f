use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rusty_ingest::{api, config, logging, manager::WorkerManager};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(
    name = "rusty-ingest",
    about = "Queued document ingestion worker with an HTTP front door"
)]
struct Cli {
    /// Port to listen on; overrides `SERVER_PORT`.
    #[arg(long)]
    port: Option<u16>,
    /// Concurrent `fileIngestion` consumers; overrides `CONCURRENCY_FILE_INGESTION`.
    #[arg(long)]
    file_concurrency: Option<usize>,
    /// Concurrent `embeddings` consumers; overrides `CONCURRENCY_EMBEDDINGS`.
    #[arg(long)]
    embeddings_concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing();
    let mut settings = config::init_config()
        .context("Failed to load configuration")?
        .clone();
    if let Some(port) = cli.port {
        settings.server_port = Some(port);
    }
    if let Some(concurrency) = cli.file_concurrency {
        settings.concurrency_file_ingestion = concurrency;
    }
    if let Some(concurrency) = cli.embeddings_concurrency {
        settings.concurrency_embeddings = concurrency;
    }

    let manager = Arc::new(
        WorkerManager::from_config(&settings)
            .await
            .context("Failed to build worker manager")?,
    );
    manager
        .start()
        .await
        .context("Failed to start job consumers")?;

    let app = api::create_router(manager.clone());
    let (listener, port) = bind_listener(settings.server_port)
        .await
        .context("Failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Err(error) = manager.stop().await {
        tracing::error!(error = %error, "Worker manager did not stop cleanly");
    }
    served.context("HTTP server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %error, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(error = %error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

async fn bind_listener(server_port: Option<u16>) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    if let Some(port) = server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}

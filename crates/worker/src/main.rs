use std::net::{AddrParseError, SocketAddr};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use podgen_worker::config::{ConfigError, WorkerConfig};
use podgen_worker::handler::JobHandler;
use podgen_worker::server::{self, JobEnvelope, JobRunner};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid HOST address: {0}")]
    Addr(#[from] AddrParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid test input: {0}")]
    TestInput(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "podgen_worker=info,podgen_comfyui=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    // --- Configuration ---
    let config = WorkerConfig::from_env()?;
    let handler = JobHandler::from_config(&config)?;
    tracing::info!(
        engine_url = %config.comfy_api_url,
        profile = %handler.profile().name,
        input_dir = %config.input_dir.display(),
        workflow_dir = %config.workflow_dir.display(),
        "Loaded worker configuration",
    );

    let runner = Arc::new(JobRunner::new(handler));

    if let Some(path) = &config.test_input {
        return run_once(&runner, path).await;
    }

    // --- Start server ---
    let addr = SocketAddr::new(config.host.parse()?, config.port);
    tracing::info!(%addr, "Starting worker");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, server::router(runner))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Worker stopped");
    Ok(())
}

/// Process a single job file and print the response envelope.
async fn run_once(runner: &JobRunner, path: &Path) -> Result<(), StartupError> {
    tracing::info!(path = %path.display(), "Running test input");

    let content = tokio::fs::read_to_string(path).await?;
    let envelope: JobEnvelope = serde_json::from_str(&content)?;
    let response = runner.run(envelope).await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

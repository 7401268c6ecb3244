use std::path::Path;

use tokio::signal;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. When `log_file` names a directory, logs
/// are additionally written there through a non-blocking, daily-rolling
/// appender; the returned guard must be kept alive for the file writer to
/// flush, so the caller holds it for the lifetime of `main`.
pub fn init_tracing(json: bool, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info,tokio_tungstenite=warn,axum=info".into());

    let registry = tracing_subscriber::registry().with(filter);

    match (json, log_file) {
        (false, None) => {
            registry.with(tracing_subscriber::fmt::layer()).init();
            None
        }
        (true, None) => {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
            None
        }
        (false, Some(dir)) => {
            let (non_blocking, guard) = file_writer(dir);
            registry
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
            Some(guard)
        }
        (true, Some(dir)) => {
            let (non_blocking, guard) = file_writer(dir);
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
    }
}

fn file_writer(dir: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "cpsim.log"))
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
    info!("shutdown signal received");
}

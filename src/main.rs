use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::TcpListener;
use tracing::{info, warn};
use video_fetch_backend::{
    admission::AdmissionController,
    config::Config,
    error::ApiError,
    job::JobLimits,
    maintenance::{spawn_maintenance, sweep_expired_artifacts},
    metadata::MetadataFetcher,
    orchestrator::{DownloadOrchestrator, OrchestratorSettings},
    quota::{JsonFileQuotaStore, QuotaLedger},
    registry::TaskRegistry,
    routes::{AppState, build_cors_layer, router},
    supervisor::{DownloaderCommand, ProcessSupervisor},
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "video_fetch_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.downloads_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create the download directory: {error}"))
        })?;
    if let Some(parent) = config.quota_file.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|error| {
            ApiError::internal(format!("Could not create the quota directory: {error}"))
        })?;
    }

    let store = JsonFileQuotaStore::open(&config.quota_file)
        .await
        .map_err(|error| ApiError::internal(format!("Could not load quota records: {error}")))?;
    let quota = Arc::new(QuotaLedger::new(Arc::new(store), config.daily_quota_bytes));
    let registry = Arc::new(TaskRegistry::new());
    let downloader = DownloaderCommand::new(config.downloader_path.clone());

    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: quotas are keyed on the socket address.");
    }
    if config.api_keys.is_empty() {
        info!("No API keys configured. Every client is identified by IP.");
    }

    let orchestrator = Arc::new(DownloadOrchestrator::new(
        Arc::clone(&registry),
        quota,
        AdmissionController::new(config.max_concurrent_downloads),
        ProcessSupervisor::new(downloader.clone()),
        OrchestratorSettings {
            downloads_dir: config.downloads_dir.clone(),
            limits: JobLimits {
                max_duration: config.download_timeout,
                max_filesize: config.max_filesize_bytes,
            },
        },
    ));

    let swept = sweep_expired_artifacts(&config.downloads_dir, config.file_expiration_seconds).await;
    if swept > 0 {
        info!("Removed {swept} expired artifact(s) at startup");
    }
    let maintenance = spawn_maintenance(
        Arc::clone(&registry),
        config.downloads_dir.clone(),
        config.file_expiration_seconds,
        config.task_retention_seconds,
    );

    let state = AppState {
        orchestrator: Arc::clone(&orchestrator),
        metadata: MetadataFetcher::new(downloader, config.metadata_timeout),
        downloads_dir: config.downloads_dir.clone(),
        trust_proxy_headers: config.trust_proxy_headers,
        api_keys: Arc::new(config.api_keys.clone()),
    };

    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = router(state).layer(cors);

    let addr = config.bind_addr.clone();
    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind to {addr}: {error}"))
    })?;

    info!(
        "Backend ready on http://{addr} ({} download slot(s))",
        config.max_concurrent_downloads
    );

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")));

    maintenance.abort();
    info!("Waiting for running downloads to finish");
    orchestrator.shutdown(SHUTDOWN_GRACE).await;

    served
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for the shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

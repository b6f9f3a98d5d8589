mod config;
mod database;
mod error;
mod models;
mod services;

use crate::config::{load_config, Config};
use crate::database::SqliteBackend;
use crate::error::{AppError, AppResult};
use crate::models::paper::Paper;
use crate::services::paper_repository;
use crate::services::{AgentPoolManager, DownloadRequest, HttpTransport, PdfDownloader, StorageManager};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    init_logging();

    info!("Starting paperstore archiver v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config();
    if let Err(e) = run(config).await {
        error!("Archiver run failed: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> AppResult<()> {
    let options = database::connect_options(&config.database.database_url).await?;

    info!("Running database migrations");
    let mut conn = database::open_connection(&options).await?;
    database::run_migrations(&mut conn).await?;
    drop(conn);

    let storage = Arc::new(StorageManager::new(&config.storage)?);
    info!(base_path = %storage.base_path().display(), "Storage initialized");

    let pool = Arc::new(AgentPoolManager::new(SqliteBackend::new(options), &config.pool));
    pool.start();

    let ingest_agent = format!("ingest-{}", Uuid::new_v4());
    let downloader_agent = format!("downloader-{}", Uuid::new_v4());
    pool.register(&ingest_agent, "database", None, None);
    pool.register(&downloader_agent, "downloader", None, None);

    // Already-validated paper records can be fed in as a JSON file; the
    // archiver itself never talks to metadata APIs.
    if let Some(path) = &config.download.ingest_file {
        ingest_records(&pool, &ingest_agent, path).await?;
    }

    let transport = HttpTransport::new(&config.download)?;
    let downloader = PdfDownloader::new(
        storage.clone(),
        transport,
        config.download.rate_limit_delay,
    );

    archive_pending(
        &pool,
        &downloader_agent,
        &downloader,
        config.download.batch_size,
        config.download.max_concurrent_downloads,
    )
    .await?;

    if storage.usage_percentage() >= storage.cleanup_threshold() * 100.0 {
        let report = storage.cleanup();
        info!(
            removed_duplicates = report.removed_duplicates,
            removed_old_files = report.removed_old_files,
            freed_bytes = report.freed_bytes,
            final_usage = format!("{:.1}%", report.final_usage_percentage),
            "Storage cleanup finished"
        );
    }

    let stats = storage.storage_stats();
    info!(
        files = stats.total_files,
        used_gb = format!("{:.2}", stats.total_size_gb),
        limit_gb = stats.storage_limit_gb,
        usage = format!("{:.1}%", stats.usage_percentage),
        "Storage status"
    );

    let download_stats = downloader.download_stats().await;
    info!(
        attempted = download_stats.total_downloads,
        successful = download_stats.successful_downloads,
        failed = download_stats.failed_downloads,
        bytes = download_stats.bytes_downloaded,
        "Download statistics"
    );

    let collection = {
        let mut guard = pool.acquire(&ingest_agent).await?;
        paper_repository::collection_stats(guard.conn()).await?
    };
    info!(
        total = collection.total,
        pending = collection.pending,
        processed = collection.processed,
        errored = collection.error,
        downloaded = collection.downloaded,
        "Collection status"
    );

    let pool_status = pool.get_pool_status();
    info!(
        active_connections = pool_status.total_connections,
        registered_agents = pool_status.registered_agents,
        "Connection pool status"
    );

    pool.shutdown();
    Ok(())
}

/// Load a JSON array of validated paper records and upsert them through a
/// pooled connection.
async fn ingest_records(
    pool: &AgentPoolManager<SqliteBackend>,
    agent_id: &str,
    path: &str,
) -> AppResult<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to read ingest file {path}: {e}")))?;
    let papers: Vec<Paper> = serde_json::from_str(&raw)
        .map_err(|e| AppError::Internal(format!("Invalid ingest file {path}: {e}")))?;

    info!(count = papers.len(), "Ingesting validated paper records");
    let mut guard = pool.acquire(agent_id).await?;
    for paper in &papers {
        paper_repository::upsert_paper(guard.conn(), paper).await?;
    }
    Ok(())
}

/// Fetch PDFs for papers that have not been archived yet and record the
/// per-paper outcome.
async fn archive_pending(
    pool: &AgentPoolManager<SqliteBackend>,
    agent_id: &str,
    downloader: &PdfDownloader<HttpTransport>,
    batch_size: usize,
    max_concurrent: usize,
) -> AppResult<()> {
    let pending = {
        let mut guard = pool.acquire(agent_id).await?;
        paper_repository::pending_downloads(guard.conn(), batch_size as i64).await?
    };
    if pending.is_empty() {
        info!("No pending downloads");
        return Ok(());
    }

    let requests: Vec<DownloadRequest> = pending
        .iter()
        .map(|p| DownloadRequest::for_paper(p.pdf_url.as_str(), p.paper_id.as_str(), p.source.as_str()))
        .collect();
    let results = downloader.download_batch(&requests, max_concurrent).await;

    let mut guard = pool.acquire(agent_id).await?;
    for (paper, result) in pending.iter().zip(&results) {
        if result.success {
            if let Some(local_path) = &result.local_path {
                paper_repository::mark_downloaded(
                    guard.conn(),
                    &paper.source,
                    &paper.paper_id,
                    &local_path.to_string_lossy(),
                    result.file_size as i64,
                )
                .await?;
            }
        } else {
            warn!(
                paper_id = %paper.paper_id,
                error = result.error_message.as_deref().unwrap_or("unknown"),
                "Recording failed download"
            );
            paper_repository::mark_error(guard.conn(), &paper.source, &paper.paper_id).await?;
        }
    }
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "paperstore=info".to_string());
    let log_format = std::env::var("PAPERSTORE_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

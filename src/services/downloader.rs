use crate::error::AppError;
use crate::models::download::{DownloadResult, DownloadStats};
use crate::services::checksum::sha256_file;
use crate::services::rate_limiter::RateLimiter;
use crate::services::storage::StorageManager;
use crate::services::transport::FetchTransport;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Files smaller than this are never accepted as valid PDFs.
const MIN_PDF_BYTES: u64 = 1000;
const PDF_MAGIC: &[u8] = b"%PDF-";
/// How many streamed bytes may land on disk between ground-truth usage
/// re-checks. Each check walks the store, so this bounds the walk rate.
const DEFAULT_CAPACITY_RECHECK_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub paper_id: Option<String>,
    pub source: String,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            paper_id: None,
            source: "arxiv".to_string(),
        }
    }

    pub fn for_paper(
        url: impl Into<String>,
        paper_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            paper_id: Some(paper_id.into()),
            source: source.into(),
        }
    }
}

/// Storage-aware PDF download pipeline: rate-limited streamed fetches with
/// incremental checksumming, capacity enforcement before and during each
/// download, header validation, and in-flight URL dedup.
///
/// Every failure mode degrades to a `DownloadResult` with `success =
/// false`; nothing escapes the per-item boundary, so batches never abort.
pub struct PdfDownloader<T: FetchTransport> {
    storage: Arc<StorageManager>,
    transport: T,
    rate_limiter: Mutex<RateLimiter>,
    active: Mutex<HashSet<String>>,
    history: Mutex<Vec<DownloadResult>>,
    capacity_recheck_bytes: u64,
}

impl<T: FetchTransport> PdfDownloader<T> {
    pub fn new(storage: Arc<StorageManager>, transport: T, rate_limit_delay: Duration) -> Self {
        Self {
            storage,
            transport,
            rate_limiter: Mutex::new(RateLimiter::new(rate_limit_delay)),
            active: Mutex::new(HashSet::new()),
            history: Mutex::new(Vec::new()),
            capacity_recheck_bytes: DEFAULT_CAPACITY_RECHECK_BYTES,
        }
    }

    /// Tune how often mid-download capacity is re-verified. Mostly useful
    /// for small ceilings where the default interval is too coarse.
    pub fn with_capacity_recheck(mut self, bytes: u64) -> Self {
        self.capacity_recheck_bytes = bytes.max(1);
        self
    }

    /// Download one PDF. Duplicate in-flight URLs short-circuit to a
    /// synthetic failure instead of blocking on the first request.
    pub async fn download(&self, request: &DownloadRequest) -> DownloadResult {
        {
            let mut active = self.active.lock().await;
            if !active.insert(request.url.clone()) {
                return DownloadResult::failure(&request.url, "Download already in progress");
            }
        }

        let started = Instant::now();
        let mut result = self.download_inner(request).await;
        result.download_time_ms = started.elapsed().as_millis() as u64;

        self.active.lock().await.remove(&request.url);
        if result.success {
            info!(
                url = %request.url,
                path = ?result.local_path,
                bytes = result.file_size,
                "Downloaded PDF"
            );
        } else {
            warn!(
                url = %request.url,
                error = result.error_message.as_deref().unwrap_or("unknown"),
                "Download failed"
            );
        }
        self.history.lock().await.push(result.clone());
        result
    }

    async fn download_inner(&self, request: &DownloadRequest) -> DownloadResult {
        let url = &request.url;

        if !self.storage.can_store(0) {
            return DownloadResult::failure(
                url,
                AppError::StorageExhausted("storage ceiling reached".to_string()).to_string(),
            );
        }

        let local_path = self.derive_local_path(request);

        // A plausible file on disk means a previous run already fetched it;
        // re-hash rather than re-fetch.
        if let Ok(meta) = tokio::fs::metadata(&local_path).await {
            if meta.len() > MIN_PDF_BYTES {
                debug!(url, path = %local_path.display(), "File already exists, skipping fetch");
                return match sha256_file(&local_path) {
                    Ok(checksum) => {
                        DownloadResult::success(url, local_path, meta.len(), checksum)
                    }
                    Err(e) => DownloadResult::failure(url, e.to_string()),
                };
            }
        }

        self.rate_limiter.lock().await.wait().await;

        let response = match self.transport.fetch(url).await {
            Ok(response) => response,
            Err(e) => return DownloadResult::failure(url, e.to_string()),
        };
        if !response.is_success() {
            return DownloadResult::failure(url, format!("HTTP {}", response.status));
        }

        // Reject up front when the advertised size alone would blow the
        // ceiling; no byte gets written.
        if let Some(expected) = response.content_length {
            if !self.storage.can_store(expected) {
                return DownloadResult::failure(
                    url,
                    AppError::StorageExhausted(format!(
                        "insufficient storage for {expected} byte file"
                    ))
                    .to_string(),
                );
            }
        }

        if let Some(parent) = local_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return DownloadResult::failure(url, format!("Failed to create directory: {e}"));
            }
        }

        match self.stream_to_disk(response.body, &local_path).await {
            Ok((total, checksum)) => DownloadResult::success(url, local_path, total, checksum),
            Err(message) => {
                Self::discard(&local_path).await;
                DownloadResult::failure(url, message)
            }
        }
    }

    /// Write the body to disk chunk by chunk, hashing as bytes arrive so no
    /// second full read is needed. Returns (size, hex checksum) or a
    /// failure message; the caller removes the partial file on failure.
    async fn stream_to_disk(
        &self,
        mut body: futures::stream::BoxStream<'static, crate::error::AppResult<bytes::Bytes>>,
        path: &Path,
    ) -> Result<(u64, String), String> {
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| format!("Failed to create file: {e}"))?;

        let mut hasher = Sha256::new();
        let mut header = Vec::with_capacity(PDF_MAGIC.len());
        let mut total: u64 = 0;
        let mut since_capacity_check: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            file.write_all(&chunk)
                .await
                .map_err(|e| format!("Failed to write chunk: {e}"))?;

            hasher.update(&chunk);
            if header.len() < PDF_MAGIC.len() {
                let need = PDF_MAGIC.len() - header.len();
                header.extend_from_slice(&chunk[..need.min(chunk.len())]);
            }
            total += chunk.len() as u64;
            since_capacity_check += chunk.len() as u64;

            if since_capacity_check >= self.capacity_recheck_bytes {
                since_capacity_check = 0;
                if !self.storage.can_store(0) {
                    return Err("storage ceiling exceeded during download".to_string());
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| format!("Failed to flush file: {e}"))?;
        drop(file);

        if total < MIN_PDF_BYTES || !header.starts_with(PDF_MAGIC) {
            return Err(format!("Downloaded file is not a valid PDF ({total} bytes)"));
        }

        Ok((total, hex::encode(hasher.finalize())))
    }

    /// Download many PDFs with a counting admission gate: at most
    /// `max_concurrent` fetches in flight no matter how long the list is.
    /// Results come back in input order, one per request.
    pub async fn download_batch(
        &self,
        requests: &[DownloadRequest],
        max_concurrent: usize,
    ) -> Vec<DownloadResult> {
        let gate = Arc::new(Semaphore::new(max_concurrent.max(1)));
        info!(
            count = requests.len(),
            max_concurrent, "Starting batch download"
        );

        let tasks = requests.iter().map(|request| {
            let gate = gate.clone();
            async move {
                match gate.acquire().await {
                    Ok(_permit) => self.download(request).await,
                    Err(_) => DownloadResult::failure(&request.url, "admission gate closed"),
                }
            }
        });
        let results = futures::future::join_all(tasks).await;

        let successful = results.iter().filter(|r| r.success).count();
        info!(
            successful,
            total = results.len(),
            "Batch download completed"
        );
        results
    }

    /// Size/header sanity check, plus checksum comparison when one is
    /// expected.
    pub async fn verify_integrity(&self, path: &Path, expected_checksum: Option<&str>) -> bool {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return false;
        };
        if meta.len() == 0 {
            return false;
        }

        if let Some(expected) = expected_checksum {
            return match sha256_file(path) {
                Ok(actual) => actual == expected,
                Err(_) => false,
            };
        }

        match tokio::fs::read(path).await {
            Ok(bytes) => bytes.starts_with(PDF_MAGIC),
            Err(_) => false,
        }
    }

    pub async fn download_stats(&self) -> DownloadStats {
        let history = self.history.lock().await;
        let successful = history.iter().filter(|r| r.success).count();
        let bytes: u64 = history.iter().filter(|r| r.success).map(|r| r.file_size).sum();
        let total_time: u64 = history.iter().map(|r| r.download_time_ms).sum();

        DownloadStats {
            total_downloads: history.len(),
            successful_downloads: successful,
            failed_downloads: history.len() - successful,
            success_rate: if history.is_empty() {
                0.0
            } else {
                successful as f64 / history.len() as f64 * 100.0
            },
            bytes_downloaded: bytes,
            average_download_time_ms: if history.is_empty() {
                0
            } else {
                total_time / history.len() as u64
            },
            active_downloads: self.active.lock().await.len(),
        }
    }

    fn derive_local_path(&self, request: &DownloadRequest) -> PathBuf {
        if let Some(paper_id) = &request.paper_id {
            return self.storage.paper_path(paper_id, &request.source);
        }

        // No id: take the URL's trailing path segment, or hash the URL when
        // it does not name a PDF, bucketed by leading character.
        let filename = url::Url::parse(&request.url)
            .ok()
            .and_then(|parsed| {
                parsed
                    .path_segments()
                    .and_then(|mut segments| segments.next_back())
                    .filter(|name| name.ends_with(".pdf"))
                    .map(str::to_string)
            })
            .unwrap_or_else(|| {
                let digest = Sha256::digest(request.url.as_bytes());
                format!("{}.pdf", &hex::encode(digest)[..10])
            });

        let bucket = filename
            .chars()
            .next()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase().to_string())
            .unwrap_or_else(|| "other".to_string());

        self.storage.base_path().join(bucket).join(filename)
    }

    async fn discard(path: &Path) {
        if tokio::fs::remove_file(path).await.is_ok() {
            debug!(path = %path.display(), "Removed partial file");
        }
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Outcome of one attempted PDF fetch. Immutable once produced; the
/// downloader appends every result to its history.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub url: String,
    pub local_path: Option<PathBuf>,
    pub success: bool,
    pub file_size: u64,
    pub checksum: Option<String>,
    pub error_message: Option<String>,
    pub download_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl DownloadResult {
    pub fn failure(url: &str, error: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            local_path: None,
            success: false,
            file_size: 0,
            checksum: None,
            error_message: Some(error.into()),
            download_time_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn success(url: &str, path: PathBuf, size: u64, checksum: String) -> Self {
        Self {
            url: url.to_string(),
            local_path: Some(path),
            success: true,
            file_size: size,
            checksum: Some(checksum),
            error_message: None,
            download_time_ms: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Snapshot of on-disk usage, recomputed on demand by walking the store.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub total_files: usize,
    pub total_bytes: u64,
    pub total_size_gb: f64,
    pub available_space_gb: f64,
    pub storage_limit_gb: f64,
    pub usage_percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub cleanup_needed: bool,
    pub removed_duplicates: usize,
    pub removed_old_files: usize,
    pub freed_bytes: u64,
    pub final_usage_percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadStats {
    pub total_downloads: usize,
    pub successful_downloads: usize,
    pub failed_downloads: usize,
    pub success_rate: f64,
    pub bytes_downloaded: u64,
    pub average_download_time_ms: u64,
    pub active_downloads: usize,
}

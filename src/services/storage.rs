use crate::config::StorageConfig;
use crate::error::{AppError, AppResult};
use crate::models::download::{CleanupReport, StorageStats};
use crate::services::checksum::sha256_file;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

const GB: u64 = 1024 * 1024 * 1024;

/// Capacity-bounded local PDF store.
///
/// Usage is never cached: every check walks the tree and sums file sizes,
/// so it is always ground truth but O(n) in file count. Fine at the scale
/// of a single archive host; an incremental index would be needed beyond
/// that.
pub struct StorageManager {
    base_path: PathBuf,
    max_storage_bytes: u64,
    cleanup_threshold: f64,
    old_file_fraction: f64,
}

impl StorageManager {
    pub fn new(config: &StorageConfig) -> AppResult<Self> {
        Self::with_limit(
            Path::new(&config.base_path),
            config.max_storage_gb * GB,
            config.cleanup_threshold,
            config.old_file_fraction,
        )
    }

    pub fn with_limit(
        base_path: &Path,
        max_storage_bytes: u64,
        cleanup_threshold: f64,
        old_file_fraction: f64,
    ) -> AppResult<Self> {
        fs::create_dir_all(base_path.join("arxiv"))
            .map_err(|e| AppError::Storage(format!("Failed to create storage directory: {e}")))?;
        Ok(Self {
            base_path: base_path.to_path_buf(),
            max_storage_bytes,
            cleanup_threshold,
            old_file_fraction,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn cleanup_threshold(&self) -> f64 {
        self.cleanup_threshold
    }

    /// All stored PDFs, found by walking the tree.
    fn pdf_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut stack = vec![self.base_path.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), "Failed to read storage directory: {e}");
                    continue;
                }
            };
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("pdf") {
                    files.push(path);
                }
            }
        }
        files
    }

    /// Current on-disk usage in bytes.
    pub fn current_usage(&self) -> u64 {
        self.pdf_files()
            .iter()
            .filter_map(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }

    /// True if `additional` bytes would still fit under the ceiling.
    pub fn can_store(&self, additional: u64) -> bool {
        self.current_usage() + additional <= self.max_storage_bytes
    }

    pub fn usage_percentage(&self) -> f64 {
        (self.current_usage() as f64 / self.max_storage_bytes as f64) * 100.0
    }

    pub fn storage_stats(&self) -> StorageStats {
        let files = self.pdf_files();
        let total_bytes: u64 = files
            .iter()
            .filter_map(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();

        let available = match fs2::available_space(&self.base_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to check disk space: {e}");
                0
            }
        };

        StorageStats {
            total_files: files.len(),
            total_bytes,
            total_size_gb: total_bytes as f64 / GB as f64,
            available_space_gb: available as f64 / GB as f64,
            storage_limit_gb: self.max_storage_bytes as f64 / GB as f64,
            usage_percentage: (total_bytes as f64 / self.max_storage_bytes as f64) * 100.0,
        }
    }

    /// Deterministic path for a paper's PDF. arXiv ids are bucketed by
    /// their year-month prefix (`2301.12345` -> `arxiv/2301/`), other
    /// sources get a flat per-source directory.
    pub fn paper_path(&self, paper_id: &str, source: &str) -> PathBuf {
        let safe_id: String = paper_id
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_'))
            .collect();

        if source == "arxiv" {
            if let Some((year_month, _)) = safe_id.split_once('.') {
                return self
                    .base_path
                    .join("arxiv")
                    .join(year_month)
                    .join(format!("{safe_id}.pdf"));
            }
            return self.base_path.join("arxiv").join(format!("{safe_id}.pdf"));
        }
        self.base_path.join(source).join(format!("{safe_id}.pdf"))
    }

    /// Free space once usage crosses `threshold * ceiling`: first delete
    /// all but one file per checksum group, then delete the oldest
    /// `old_file_fraction` of what remains, re-checking usage after each
    /// deletion and stopping as soon as it drops under the threshold.
    pub fn cleanup(&self) -> CleanupReport {
        let threshold_bytes = (self.max_storage_bytes as f64 * self.cleanup_threshold) as u64;
        let usage = self.current_usage();

        if usage < threshold_bytes {
            return CleanupReport {
                cleanup_needed: false,
                removed_duplicates: 0,
                removed_old_files: 0,
                freed_bytes: 0,
                final_usage_percentage: self.usage_percentage(),
            };
        }

        info!(
            usage_percentage = format!("{:.1}", self.usage_percentage()),
            "Storage cleanup triggered"
        );

        let mut freed_bytes = 0u64;
        let mut removed_duplicates = 0usize;

        for group in self.duplicate_groups() {
            // Keep the first path per group, delete the rest.
            for path in &group[1..] {
                match self.remove_file(path) {
                    Some(size) => {
                        removed_duplicates += 1;
                        freed_bytes += size;
                        info!(path = %path.display(), "Removed duplicate file");
                    }
                    None => continue,
                }
            }
        }

        let mut removed_old_files = 0usize;
        if self.current_usage() >= threshold_bytes {
            for path in self.oldest_files(self.old_file_fraction) {
                match self.remove_file(&path) {
                    Some(size) => {
                        removed_old_files += 1;
                        freed_bytes += size;
                        info!(path = %path.display(), "Removed old file");
                    }
                    None => continue,
                }
                if self.current_usage() < threshold_bytes {
                    break;
                }
            }
        }

        CleanupReport {
            cleanup_needed: true,
            removed_duplicates,
            removed_old_files,
            freed_bytes,
            final_usage_percentage: self.usage_percentage(),
        }
    }

    /// Age-based purge for operators: remove PDFs older than `days`.
    pub fn remove_older_than(&self, days: u64) -> usize {
        let cutoff = SystemTime::now() - std::time::Duration::from_secs(days * 24 * 3600);
        let mut removed = 0;
        for path in self.pdf_files() {
            let modified = fs::metadata(&path).and_then(|m| m.modified());
            if let Ok(modified) = modified {
                if modified < cutoff && self.remove_file(&path).is_some() {
                    removed += 1;
                    info!(path = %path.display(), "Removed expired file");
                }
            }
        }
        removed
    }

    /// Groups of byte-identical files (by SHA-256), each with more than one
    /// member, paths sorted for deterministic keep-first behavior.
    fn duplicate_groups(&self) -> Vec<Vec<PathBuf>> {
        let mut by_checksum: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for path in self.pdf_files() {
            match sha256_file(&path) {
                Ok(digest) => by_checksum.entry(digest).or_default().push(path),
                Err(e) => warn!(path = %path.display(), "Checksum failed during cleanup: {e}"),
            }
        }

        let mut groups: Vec<Vec<PathBuf>> = by_checksum
            .into_values()
            .filter(|paths| paths.len() > 1)
            .collect();
        for group in &mut groups {
            group.sort();
        }
        groups
    }

    /// The oldest `fraction` of stored files by modification time.
    fn oldest_files(&self, fraction: f64) -> Vec<PathBuf> {
        let mut with_mtime: Vec<(SystemTime, PathBuf)> = self
            .pdf_files()
            .into_iter()
            .filter_map(|path| {
                let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((modified, path))
            })
            .collect();
        with_mtime.sort_by_key(|(mtime, _)| *mtime);

        let count = (with_mtime.len() as f64 * fraction).ceil() as usize;
        with_mtime
            .into_iter()
            .take(count)
            .map(|(_, path)| path)
            .collect()
    }

    fn remove_file(&self, path: &Path) -> Option<u64> {
        let size = fs::metadata(path).map(|m| m.len()).ok()?;
        match fs::remove_file(path) {
            Ok(()) => Some(size),
            Err(e) => {
                warn!(path = %path.display(), "Failed to remove file: {e}");
                None
            }
        }
    }
}

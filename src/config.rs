use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
    pub storage: StorageConfig,
    pub download: DownloadConfig,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
}

#[derive(Clone)]
pub struct PoolConfig {
    pub total_max_connections: usize,
    pub sweep_interval: Duration,
    pub idle_timeout: Duration,
}

#[derive(Clone)]
pub struct StorageConfig {
    pub base_path: String,
    pub max_storage_gb: u64,
    pub cleanup_threshold: f64,
    pub old_file_fraction: f64,
}

#[derive(Clone)]
pub struct DownloadConfig {
    pub rate_limit_delay: Duration,
    pub max_concurrent_downloads: usize,
    pub request_timeout: Duration,
    pub user_agent: String,
    pub batch_size: usize,
    pub ingest_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let parse_env_var = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };

        let parse_env_number = |key: &str, default: u64| -> u64 {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        };

        let parse_env_float = |key: &str, default: f64| -> f64 {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        };

        Config {
            database: DatabaseConfig {
                database_url: parse_env_var("PAPERSTORE_DATABASE_URL", "sqlite://papers/paperstore.db"),
            },
            pool: PoolConfig {
                total_max_connections: parse_env_number("PAPERSTORE_MAX_CONNECTIONS", 50) as usize,
                sweep_interval: Duration::from_secs(parse_env_number("PAPERSTORE_POOL_SWEEP_SECS", 300)),
                idle_timeout: Duration::from_secs(parse_env_number("PAPERSTORE_POOL_IDLE_TIMEOUT_SECS", 1800)),
            },
            storage: StorageConfig {
                base_path: parse_env_var("PAPERSTORE_STORAGE_PATH", "papers"),
                max_storage_gb: parse_env_number("PAPERSTORE_MAX_STORAGE_GB", 300),
                cleanup_threshold: parse_env_float("PAPERSTORE_CLEANUP_THRESHOLD", 0.95),
                old_file_fraction: parse_env_float("PAPERSTORE_OLD_FILE_FRACTION", 0.10),
            },
            download: DownloadConfig {
                // arXiv asks for at least 3 seconds between calls; PDF mirrors
                // tolerate 1s but the default stays conservative.
                rate_limit_delay: Duration::from_millis(parse_env_number("PAPERSTORE_RATE_LIMIT_MS", 1000)),
                max_concurrent_downloads: parse_env_number("PAPERSTORE_MAX_CONCURRENT_DOWNLOADS", 3) as usize,
                request_timeout: Duration::from_secs(parse_env_number("PAPERSTORE_REQUEST_TIMEOUT_SECS", 300)),
                user_agent: parse_env_var(
                    "PAPERSTORE_USER_AGENT",
                    "paperstore/0.1 (Academic Research Archiver)",
                ),
                batch_size: parse_env_number("PAPERSTORE_BATCH_SIZE", 100) as usize,
                ingest_file: std::env::var("PAPERSTORE_INGEST_FILE").ok(),
            },
        }
    }
}

pub fn load_config() -> Config {
    Config::default()
}

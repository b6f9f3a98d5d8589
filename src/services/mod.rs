pub mod checksum;
pub mod downloader;
pub mod paper_repository;
pub mod pool_manager;
pub mod rate_limiter;
pub mod storage;
pub mod transport;

pub use downloader::{DownloadRequest, PdfDownloader};
pub use pool_manager::{AgentPoolManager, PooledConnection};
pub use rate_limiter::RateLimiter;
pub use storage::StorageManager;
pub use transport::{FetchTransport, HttpTransport};

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// An agent used the connection pool without registering first.
    NotRegistered(String),
    /// Agent or pool at its connection cap with no preemption candidate.
    Capacity(String),
    /// A write would push local storage past the configured ceiling.
    StorageExhausted(String),
    Download(String),
    Storage(String),
    Database(String),
    NotFound(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NotRegistered(msg) => write!(f, "Agent not registered: {msg}"),
            AppError::Capacity(msg) => write!(f, "Capacity error: {msg}"),
            AppError::StorageExhausted(msg) => write!(f, "Storage exhausted: {msg}"),
            AppError::Download(msg) => write!(f, "Download error: {msg}"),
            AppError::Storage(msg) => write!(f, "Storage error: {msg}"),
            AppError::Database(msg) => write!(f, "Database error: {msg}"),
            AppError::NotFound(msg) => write!(f, "Not Found error: {msg}"),
            AppError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

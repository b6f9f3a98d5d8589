use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processed,
    Error,
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStatus::Pending => write!(f, "pending"),
            ProcessingStatus::Processed => write!(f, "processed"),
            ProcessingStatus::Error => write!(f, "error"),
        }
    }
}

impl ProcessingStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => ProcessingStatus::Pending,
            "processed" => ProcessingStatus::Processed,
            _ => ProcessingStatus::Error,
        }
    }
}

/// One archived academic paper. `paper_id` is unique within its `source`
/// collection (arXiv id, DOI, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    pub paper_id: String,
    pub source: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub abstract_text: String,
    #[serde(default)]
    pub categories: Vec<String>,
    pub date_published: Option<DateTime<Utc>>,
    pub date_updated: Option<DateTime<Utc>>,
    pub pdf_url: String,
    #[serde(default)]
    pub pdf_downloaded: bool,
    pub pdf_file_path: Option<String>,
    pub pdf_file_size: Option<i64>,
    #[serde(default)]
    pub source_metadata: Value,
    #[serde(default = "default_status")]
    pub processing_status: ProcessingStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_status() -> ProcessingStatus {
    ProcessingStatus::Pending
}

impl Paper {
    pub fn new(paper_id: String, source: String, title: String, pdf_url: String) -> Self {
        let now = Utc::now();
        Self {
            paper_id,
            source,
            title,
            authors: Vec::new(),
            abstract_text: String::new(),
            categories: Vec::new(),
            date_published: None,
            date_updated: None,
            pdf_url,
            pdf_downloaded: false,
            pdf_file_path: None,
            pdf_file_size: None,
            source_metadata: Value::Null,
            processing_status: ProcessingStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_downloaded(&mut self, path: String, size: i64) {
        self.pdf_downloaded = true;
        self.pdf_file_path = Some(path);
        self.pdf_file_size = Some(size);
        self.updated_at = Utc::now();
    }

    pub fn set_error(&mut self) {
        self.processing_status = ProcessingStatus::Error;
        self.updated_at = Utc::now();
    }
}

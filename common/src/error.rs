use async_openai::error::OpenAIError;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Quota exceeded: {reason}")]
    QuotaExceeded {
        reason: String,
        reset_at: Option<DateTime<Utc>>,
    },
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Corrupt input: {0}")]
    CorruptInput(String),
    #[error("Embedding failure: {0}")]
    EmbeddingFailure(String),
    #[error("LLM failure: {0}")]
    LLMFailure(String),
    #[error("Unavailable: {0}")]
    Unavailable(String),
    #[error("Deadline exceeded")]
    DeadlineExceeded,
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Abstract result code surfaced to callers and recorded in audit rows.
    /// Internal identifiers never leak past this mapping.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::CorruptInput(_) => "corrupt_input",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::RateLimited { .. } => "rate_limited",
            Self::EmbeddingFailure(_) => "embedding_failure",
            Self::LLMFailure(_) => "llm_failure",
            Self::Unavailable(_) => "unavailable",
            Self::DeadlineExceeded => "deadline_exceeded",
            _ => "internal",
        }
    }
}

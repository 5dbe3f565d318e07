use thiserror::Error;

/// Errors raised by the identification pipeline.
///
/// Only setup failures (configuration, label lookup, health checks) end a
/// task. Everything raised while a batch is running is caught per item by
/// the orchestrator and recorded as a failure.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{service} request failed: {message}")]
    TransientService { service: &'static str, message: String },

    /// The service explicitly reported zero faces. Callers treat this as an
    /// empty result, never as a failure.
    #[error("no faces detected: {0}")]
    NoDetection(String),

    #[error("task cancelled after {processed} item(s)")]
    Cancelled { processed: usize },

    #[error("frame extraction failed: {0}")]
    Extraction(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn transient(service: &'static str, message: impl Into<String>) -> Self {
        PipelineError::TransientService { service, message: message.into() }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        let service = if err.is_timeout() { "http (timeout)" } else { "http" };
        PipelineError::TransientService { service, message: err.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

use std::path::PathBuf;

use thiserror::Error;

/// Credential problems are fatal: the batch never starts without both
/// services available.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("missing {service} credential: {path} not found")]
    Missing { service: &'static str, path: PathBuf },

    #[error("malformed {service} credential ({path}): {reason}")]
    Malformed {
        service: &'static str,
        path: PathBuf,
        reason: String,
    },
}

/// Errors scoped to a single video. The batch records them and moves on.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unreadable video: {0}")]
    UnreadableVideo(String),

    #[error("OCR service error: {0}")]
    OcrService(String),

    #[error("language model service error: {0}")]
    LlmService(String),

    #[error("unparseable model response: {0}")]
    UnparseableResponse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

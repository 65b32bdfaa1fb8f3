//! Boundary errors surfaced to the HTTP layer.
//!
//! Internal plumbing uses `anyhow`; only faults the caller has to act on are
//! promoted to a [`ProcessingError`]. Tier failures and rejections never show
//! up here.

use axum::http::StatusCode;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Unsupported file type: .{0}. Supported: .csv, .xlsx, .xlsm, .xlsb, .pdf, .docx, .txt")]
    UnsupportedType(String),

    #[error("Failed to detect file type of {path:?}: {reason}")]
    Detection { path: PathBuf, reason: String },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown file id: {0}")]
    FileNotFound(u64),

    #[error("Source for file {0} is no longer available")]
    SourceUnavailable(u64),

    #[error("No columns could be matched for {0}")]
    NothingMatched(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProcessingError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnsupportedType(_) | Self::InvalidRequest(_) | Self::NothingMatched(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Detection { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::FileNotFound(_) | Self::SourceUnavailable(_) => StatusCode::NOT_FOUND,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for ProcessingError {
    fn into_response(self) -> axum::response::Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

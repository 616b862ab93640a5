use thiserror::Error;

/// Fatal failures of a single run.
///
/// Every variant ends the run in `RunState::Failed`. Cancellation is not an
/// error and has no variant here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunError {
    /// Camera busy or missing, file unreadable or corrupt, device disconnected.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// Malformed frame or model runtime failure.
    #[error("inference failed: {0}")]
    Inference(String),
    /// Geometry mismatch or disk write failure.
    #[error("encode failed: {0}")]
    Encode(String),
}

impl RunError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable(err.to_string())
    }

    pub fn inference(err: impl std::fmt::Display) -> Self {
        Self::Inference(err.to_string())
    }

    pub fn encode(err: impl std::fmt::Display) -> Self {
        Self::Encode(err.to_string())
    }

    /// Short machine-readable kind, used in status payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::Inference(_) => "inference_error",
            Self::Encode(_) => "encode_error",
        }
    }
}

pub type RunResult<T> = std::result::Result<T, RunError>;

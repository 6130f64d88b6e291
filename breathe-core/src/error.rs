use thiserror::Error;

use crate::model::MissingSource;

/// Errors surfaced to callers of the core.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed concentration, index, coordinate or table. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No usable reading exists for any required pollutant.
    #[error("no air quality data available: {}", describe_missing(.missing))]
    NoDataAvailable { missing: Vec<MissingSource> },

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}

fn describe_missing(missing: &[MissingSource]) -> String {
    if missing.is_empty() {
        return "no source reported a usable reading".to_string();
    }

    missing
        .iter()
        .map(|m| format!("{} ({})", m.source, m.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure of a single adapter attempt. Converted to
/// [`UnavailableReason`](crate::model::UnavailableReason) before it leaves the
/// adapter layer.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("unit conversion failed: {0}")]
    Unit(String),

    #[error("no API key configured")]
    MissingCredentials,
}

impl SourceError {
    /// Timeouts, connection failures, 5xx, 408 and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Timeout(_) => true,
            SourceError::Transport(e) => {
                if let Some(status) = e.status() {
                    return is_retryable_status(status.as_u16());
                }
                !(e.is_decode() || e.is_builder())
            }
            SourceError::Status { status, .. } => is_retryable_status(*status),
            SourceError::Parse(_) | SourceError::Unit(_) | SourceError::MissingCredentials => {
                false
            }
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

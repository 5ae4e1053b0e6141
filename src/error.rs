use thiserror::Error;

/// Errors returned by a [`crate::Transport`] implementation. Transports are
/// external collaborators so we keep this opaque and hand it back verbatim.
pub type TransportError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while validating construction parameters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid histogram bucket budget {0}, must be at least 1")]
    InvalidBucketBudget(usize),
    #[error("reporting interval must be non-zero")]
    ZeroInterval,
    #[error("reporter must be started from within a tokio runtime")]
    NoRuntime,
}

/// A non-2xx response from a collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub body: String,
    /// Value of the aggregate rate-limit header, if the collector sent one.
    pub rate_limit_agg: Option<String>,
    /// Value of the standard rate-limit header, if the collector sent one.
    pub rate_limit_std: Option<String>,
}

/// Errors produced by a flush. These are never retried by the reporter, they
/// are pushed onto the reporter's error channel for the owner to handle.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to deliver metrics: {0}")]
    Delivery(#[source] TransportError),
    #[error("collector rejected metrics with status {}: {}", .0.status, .0.body)]
    Rejected(Rejection),
    #[error("failed to encode metrics: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write metrics: {0}")]
    Io(#[from] std::io::Error),
}

impl ReportError {
    /// Return the rejection details if the collector refused the batch.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ReportError::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

//! Error types for reqmeter.

use thiserror::Error;

/// Result type alias for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Errors raised by the metrics facility.
///
/// Everything except `Encode` and `Io` is a setup-time programming error
/// and is never produced while a request is being served.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric already registered: {0}")]
    DuplicateName(String),

    #[error("metric is not registered in this context: {0}")]
    UnknownMetric(String),

    #[error("label mismatch for {metric}: expected {expected:?}, got {got:?}")]
    LabelMismatch {
        metric: String,
        expected: Vec<String>,
        got: Vec<String>,
    },

    #[error("invalid metric definition: {0}")]
    InvalidMetric(#[source] prometheus::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("metrics have not been started")]
    NotStarted,

    #[error("failed to encode metrics: {0}")]
    Encode(#[source] prometheus::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Config(#[from] toml::de::Error),
}

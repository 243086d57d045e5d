use thiserror::Error;

/// Every failure the ledger can surface to the ingestion and dashboard layers.
///
/// Analytics sentinels (undefined win rate, undefined drawdown points) are
/// values on `ChartSeries`, never variants here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Malformed strategy id '{0}': expected at least two underscore-separated tokens")]
    MalformedId(String),

    #[error("Unknown strategy '{0}': no records exist for this base id")]
    UnknownStrategy(String),

    #[error("Unauthorized reset request for '{0}'")]
    Unauthorized(String),

    #[error("Storage write failed: {0}")]
    StorageWriteFailure(String),

    #[error("Storage is unavailable after repeated write failures, refusing writes: {0}")]
    StorageUnavailable(String),

    #[error("A reset for '{0}' is already in flight, retry later")]
    ConcurrencyConflict(String),

    #[error("Out-of-order event for '{base_id}': {timestamp} is {behind_ms}ms behind the last record")]
    OutOfOrder {
        base_id: String,
        timestamp: String,
        behind_ms: i64,
    },

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Failed to replay event log: {0}")]
    Replay(String),
}

/// Failures of a persisted log backend. The store maps these onto
/// `StoreError::StorageWriteFailure` or `StoreError::Replay`.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Failed to encode or decode a record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Corrupt log entry at {location}: {reason}")]
    Corrupt { location: String, reason: String },
}

impl StoreError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::StorageWriteFailure(_) | StoreError::ConcurrencyConflict(_)
        )
    }

    /// Stable machine-readable name used in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::MalformedId(_) => "malformed_id",
            StoreError::UnknownStrategy(_) => "unknown_strategy",
            StoreError::Unauthorized(_) => "unauthorized",
            StoreError::StorageWriteFailure(_) => "storage_write_failure",
            StoreError::StorageUnavailable(_) => "storage_unavailable",
            StoreError::ConcurrencyConflict(_) => "concurrency_conflict",
            StoreError::OutOfOrder { .. } => "out_of_order",
            StoreError::InvalidEvent(_) => "invalid_event",
            StoreError::Replay(_) => "replay",
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Replay(e.to_string())
    }
}

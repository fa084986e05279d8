use thiserror::Error;

/// Errors raised by market-data resolution, optimization and persistence.
#[derive(Debug, Error)]
pub enum VolaError {
    /// Per-symbol calendars could not be reconciled into one matrix.
    #[error("inconsistent market data for {symbol}: {detail}")]
    DataInconsistency { symbol: String, detail: String },

    /// No rows for the symbol in range (delisted, merged, never loaded).
    /// Needs a manual symbol remap, never retried automatically.
    #[error("no market data for {symbol}: {detail}")]
    DataUnavailable { symbol: String, detail: String },

    #[error("optimization failed: {0}")]
    OptimizationFailure(String),

    /// Live quotes unusable. Callers fall back to historical closes.
    #[error("live price retrieval failed: {0}")]
    PriceRetrievalFailure(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VolaError {
    pub fn unavailable(symbol: impl Into<String>, detail: impl Into<String>) -> Self {
        VolaError::DataUnavailable { symbol: symbol.into(), detail: detail.into() }
    }

    pub fn inconsistent(symbol: impl Into<String>, detail: impl Into<String>) -> Self {
        VolaError::DataInconsistency { symbol: symbol.into(), detail: detail.into() }
    }
}

pub type Result<T> = std::result::Result<T, VolaError>;

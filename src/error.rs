// =============================================================================
// Error types for the fetch, cache and analysis paths
// =============================================================================
//
// Socket loops keep using `anyhow` (a stream error only ever ends the
// connection). The paths below have callers that branch on the failure kind,
// so they get typed errors.
// =============================================================================

use thiserror::Error;

/// Failure while reading or writing the on-disk candle cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),

    #[error("cache file is corrupt: {0}")]
    Corrupt(String),

    /// An instrument or bar that cannot be used as part of a file name.
    #[error("invalid cache key {0:?}")]
    InvalidKey(String),
}

/// Failure of a historical candle fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Timeout, connection reset or non-success HTTP status.
    #[error("transport error: {0}")]
    Transport(String),

    /// The exchange answered with a non-"0" code.
    #[error("exchange error {code}: {message}")]
    Application { code: String, message: String },

    /// The response parsed as JSON but not into the candle schema.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A page kept failing until the retry budget ran out.
    #[error("page request failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl FetchError {
    /// Whether a page request that failed this way may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Application { .. } | Self::InvalidPayload(_)
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::InvalidPayload(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Rejected level-detection parameters.
#[derive(Debug, Error, PartialEq)]
pub enum AnalysisError {
    #[error("eps multiplier must be a positive finite number, got {0}")]
    InvalidEpsMultiplier(f64),

    #[error("min hits must be at least 1")]
    InvalidMinHits,
}

use thiserror::Error;

/// Errors raised while preparing history for a request.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The request would not fit the model's context window.
    #[error(
        "estimated token count ({estimated}) exceeds the safe limit for model \"{model}\" ({safe_limit}/{limit})"
    )]
    TokenLimitExceeded {
        model: String,
        estimated: usize,
        safe_limit: usize,
        limit: usize,
    },

    /// The embedding backend failed.
    #[error("embedding error: {0}")]
    Embedding(String),
}

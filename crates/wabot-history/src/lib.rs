//! # wabot-history
//!
//! Prepares accumulated conversation history for a chat-completion request.
//!
//! - `sanitize` - dedup, tool-call reconciliation, truncation
//! - `scrub` - base64 payload stripping
//! - `tokens` - token estimate and per-model circuit breaker
//! - `stm` - short-term memory window with similarity reranking
//! - `pipeline` - chains the above for one outbound request

pub mod error;
pub mod pipeline;
pub mod sanitize;
pub mod scrub;
pub mod stm;
pub mod tokens;

pub use error::HistoryError;
pub use pipeline::{HistoryPipeline, Prepared};
pub use sanitize::{sanitize, sanitize_with_report, SanitizeReport, MAX_HISTORY_TURNS};
pub use stm::{cosine_similarity, Embedder, StmOutcome, StmWindow};
pub use tokens::{estimate_tokens, model_token_limit, TokenBudget, TokenCheck};

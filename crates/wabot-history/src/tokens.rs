//! Token estimation and the per-model circuit breaker.
//!
//! The estimate is deliberately pessimistic (3 characters per token) so the
//! check trips before the API would reject the request.

use crate::error::HistoryError;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};
use wabot_core::config::TokenConfig;
use wabot_core::turn::Turn;

const CHARS_PER_TOKEN: usize = 3;

/// Fraction of the model limit a request may use by default.
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.9;

/// Context window sizes of known models.
const KNOWN_LIMITS: &[(&str, usize)] = &[
    ("gpt-4-turbo", 128_000),
    ("gpt-4-turbo-2024-04-09", 128_000),
    ("gpt-4-0125-preview", 128_000),
    ("gpt-4-turbo-preview", 128_000),
    ("gpt-4-1106-preview", 128_000),
    ("gpt-4-vision-preview", 128_000),
    ("gpt-4", 8192),
    ("gpt-4-0613", 8192),
    ("gpt-4-32k", 32_768),
    ("gpt-4-32k-0613", 32_768),
    ("gpt-3.5-turbo-0125", 16_385),
    ("gpt-3.5-turbo", 16_385),
    ("gpt-3.5-turbo-1106", 16_385),
    ("gpt-3.5-turbo-instruct", 4096),
    ("gpt-5-mini-2025-08-07", 128_000),
    // Ollama defaults; configurable per deployment.
    ("llama3", 8192),
    ("codellama", 16_000),
    ("mistral", 8192),
    ("gemma", 8192),
];

/// Built-in context window size for `model`.
pub fn model_token_limit(model: &str) -> Option<usize> {
    KNOWN_LIMITS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, limit)| *limit)
}

fn turn_chars(turn: &Turn) -> usize {
    match &turn.content {
        Some(content) => content.chars().count(),
        None if !turn.tool_calls.is_empty() => serde_json::to_string(turn)
            .map(|s| s.chars().count())
            .unwrap_or(0),
        None => 0,
    }
}

/// Rough token count of a request payload.
pub fn estimate_tokens(turns: &[Turn]) -> usize {
    let chars: usize = turns.iter().map(turn_chars).sum();
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Outcome of a passing budget check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenCheck {
    /// The model has no known limit.
    Skipped { model: String },
    Within {
        estimated: usize,
        safe_limit: usize,
        limit: usize,
    },
}

/// Per-model token budget.
#[derive(Debug, Clone)]
pub struct TokenBudget {
    safety_margin: f64,
    overrides: BTreeMap<String, usize>,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            safety_margin: DEFAULT_SAFETY_MARGIN,
            overrides: BTreeMap::new(),
        }
    }
}

impl TokenBudget {
    pub fn from_config(config: &TokenConfig) -> Self {
        Self {
            safety_margin: config.safety_margin,
            overrides: config.limits.clone(),
        }
    }

    /// Configured limit for `model`, falling back to the built-in table.
    pub fn limit_for(&self, model: &str) -> Option<usize> {
        self.overrides
            .get(model)
            .copied()
            .or_else(|| model_token_limit(model))
    }

    /// Fail if `turns` would use more than the safe share of the model limit.
    pub fn check(&self, turns: &[Turn], model: &str) -> Result<TokenCheck, HistoryError> {
        let Some(limit) = self.limit_for(model) else {
            warn!("tokens: no limit known for model \"{model}\", skipping budget check");
            return Ok(TokenCheck::Skipped {
                model: model.to_string(),
            });
        };

        let estimated = estimate_tokens(turns);
        let safe_limit = (limit as f64 * self.safety_margin).floor() as usize;
        debug!("tokens: model={model} estimated={estimated} safe_limit={safe_limit}");

        if estimated > safe_limit {
            error!(
                "tokens: estimated {estimated} exceeds safe limit {safe_limit}/{limit} for \"{model}\", aborting request"
            );
            return Err(HistoryError::TokenLimitExceeded {
                model: model.to_string(),
                estimated,
                safe_limit,
                limit,
            });
        }

        Ok(TokenCheck::Within {
            estimated,
            safe_limit,
            limit,
        })
    }
}

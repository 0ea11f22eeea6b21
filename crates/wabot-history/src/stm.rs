//! Short-term memory window.
//!
//! The newest `hot_window` turns are always kept. Once the history exceeds
//! `max_messages`, older ("warm") turns compete for the remaining slots by
//! similarity to the incoming message; the losers are handed back so the
//! caller can summarize them into long-term memory.

use crate::error::HistoryError;
use async_trait::async_trait;
use std::cmp::Ordering;
use tracing::{debug, info};
use wabot_core::config::StmConfig;
use wabot_core::turn::{Role, Turn};

/// Text embedding backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, HistoryError>;
}

/// Cosine similarity of two vectors; 0.0 when undefined.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut a2, mut b2) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        a2 += x * x;
        b2 += y * y;
    }
    let magnitude = a2.sqrt() * b2.sqrt();
    if magnitude == 0.0 {
        0.0
    } else {
        dot / magnitude
    }
}

/// Result of applying the window.
#[derive(Debug, Clone, Default)]
pub struct StmOutcome {
    /// Turns to keep, in chronological order.
    pub turns: Vec<Turn>,
    /// Warm turns that lost the ranking, in chronological order.
    pub to_summarize: Vec<Turn>,
    /// Whether similarity ranking ran.
    pub reranked: bool,
}

/// Short-term memory policy.
#[derive(Debug, Clone)]
pub struct StmWindow {
    max_messages: usize,
    hot_window: usize,
}

impl StmWindow {
    pub fn new(max_messages: usize, hot_window: usize) -> Self {
        Self {
            max_messages,
            hot_window: hot_window.min(max_messages),
        }
    }

    pub fn from_config(config: &StmConfig) -> Self {
        Self::new(config.max_messages, config.hot_window)
    }

    /// Bound `turns` for a request answering `query`.
    ///
    /// Without an embedder the warm turns cannot be ranked, so the window
    /// degrades to the newest `max_messages` turns.
    pub async fn apply(
        &self,
        turns: &[Turn],
        query: &str,
        embedder: Option<&dyn Embedder>,
    ) -> Result<StmOutcome, HistoryError> {
        if turns.len() <= self.max_messages {
            return Ok(StmOutcome {
                turns: turns.to_vec(),
                ..Default::default()
            });
        }

        match embedder {
            Some(embedder) => {
                let (warm, hot) = turns.split_at(turns.len() - self.hot_window);
                self.rerank(warm, hot, query, embedder).await
            }
            None => {
                let cut = turns.len() - self.max_messages;
                debug!(
                    "stm: sliding window {} -> {} turns",
                    turns.len(),
                    self.max_messages
                );
                Ok(StmOutcome {
                    turns: turns[cut..].to_vec(),
                    to_summarize: turns[..cut].to_vec(),
                    reranked: false,
                })
            }
        }
    }

    async fn rerank(
        &self,
        warm: &[Turn],
        hot: &[Turn],
        query: &str,
        embedder: &dyn Embedder,
    ) -> Result<StmOutcome, HistoryError> {
        info!(
            "stm: reranking {} warm turns ({} hot kept)",
            warm.len(),
            hot.len()
        );
        let query_embedding = embedder.embed(query).await?;

        let mut scored = Vec::with_capacity(warm.len());
        for (i, turn) in warm.iter().enumerate() {
            let embeddable = matches!(turn.role, Role::User | Role::Assistant)
                && !turn.content_str().is_empty();
            let score = if embeddable {
                let embedding = embedder.embed(turn.content_str()).await?;
                cosine_similarity(&query_embedding, &embedding)
            } else {
                -1.0
            };
            scored.push((i, score));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let slots = self.max_messages - hot.len();
        let mut kept = vec![false; warm.len()];
        for (i, _) in scored.iter().take(slots) {
            kept[*i] = true;
        }

        let mut turns = Vec::with_capacity(slots + hot.len());
        let mut to_summarize = Vec::new();
        for (turn, keep) in warm.iter().zip(&kept) {
            if *keep {
                turns.push(turn.clone());
            } else {
                to_summarize.push(turn.clone());
            }
        }
        turns.extend_from_slice(hot);

        debug!(
            "stm: kept {} turns, {} queued for summary",
            turns.len(),
            to_summarize.len()
        );
        Ok(StmOutcome {
            turns,
            to_summarize,
            reranked: true,
        })
    }
}

//! Outbound history preparation: sanitize, scrub, then check the budget.
//!
//! Sanitizing runs on the raw content so that two distinct payloads scrubbed
//! to the same marker are never mistaken for a repeated user turn.

use crate::error::HistoryError;
use crate::sanitize::{sanitize_with_report, SanitizeReport};
use crate::scrub::scrub_turns;
use crate::stm::{Embedder, StmWindow};
use crate::tokens::{TokenBudget, TokenCheck};
use tracing::{debug, info};
use wabot_core::config::Config;
use wabot_core::turn::Turn;

/// History ready to submit.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub turns: Vec<Turn>,
    pub report: SanitizeReport,
    pub tokens: TokenCheck,
    /// Turns evicted by the short-term memory window, for summarization.
    pub to_summarize: Vec<Turn>,
}

/// Per-request history preparation, built once at startup.
#[derive(Debug, Clone)]
pub struct HistoryPipeline {
    scrub_max_field_len: usize,
    budget: TokenBudget,
    stm: StmWindow,
}

impl HistoryPipeline {
    pub fn new(config: &Config) -> Self {
        Self {
            scrub_max_field_len: config.history.scrub_max_field_len,
            budget: TokenBudget::from_config(&config.tokens),
            stm: StmWindow::from_config(&config.stm),
        }
    }

    /// Sanitize the raw turns, then strip payloads from the survivors.
    pub fn clean(&self, turns: &[Turn]) -> (Vec<Turn>, SanitizeReport) {
        let (sanitized, report) = sanitize_with_report(turns);

        debug!(
            "history: {} -> {} turns (duplicates={}, assistant_dropped={}, tool_dropped={}, truncated={})",
            report.input_len,
            report.output_len,
            report.duplicates,
            report.assistant_dropped,
            report.tool_dropped,
            report.truncated
        );
        if report.changed() {
            info!(
                "history: sanitized {} -> {} turns",
                report.input_len, report.output_len
            );
        }

        (scrub_turns(&sanitized, self.scrub_max_field_len), report)
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    /// Prepare `turns` for a request to `model`.
    pub fn prepare(&self, turns: &[Turn], model: &str) -> Result<Prepared, HistoryError> {
        let (turns, report) = self.clean(turns);
        let tokens = self.budget.check(&turns, model)?;

        Ok(Prepared {
            turns,
            report,
            tokens,
            to_summarize: Vec::new(),
        })
    }

    /// Apply the short-term memory window for `query`, then [`prepare`](Self::prepare).
    pub async fn prepare_with_memory(
        &self,
        turns: &[Turn],
        query: &str,
        embedder: Option<&dyn Embedder>,
        model: &str,
    ) -> Result<Prepared, HistoryError> {
        let window = self.stm.apply(turns, query, embedder).await?;
        let mut prepared = self.prepare(&window.turns, model)?;
        prepared.to_summarize = window.to_summarize;
        Ok(prepared)
    }
}

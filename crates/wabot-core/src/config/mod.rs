
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::WabotError;

/// Top-level wabot configuration, passed to the history pipeline at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub wabot: WabotConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub stm: StmConfig,
}

/// General assistant settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WabotConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for WabotConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Chat model the history is prepared for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub name: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
        }
    }
}

/// History preparation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// String fields longer than this that look like base64 are replaced.
    #[serde(default = "default_scrub_max_field_len")]
    pub scrub_max_field_len: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            scrub_max_field_len: default_scrub_max_field_len(),
        }
    }
}

/// Token budget circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Fraction of the model limit a request may use.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
    /// Extra or overriding per-model limits, keyed by model name.
    #[serde(default)]
    pub limits: BTreeMap<String, usize>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            safety_margin: default_safety_margin(),
            limits: BTreeMap::new(),
        }
    }
}

/// Short-term memory window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StmConfig {
    #[serde(default = "default_stm_max_messages")]
    pub max_messages: usize,
    /// Most recent turns always kept verbatim.
    #[serde(default = "default_stm_hot_window")]
    pub hot_window: usize,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            max_messages: default_stm_max_messages(),
            hot_window: default_stm_hot_window(),
        }
    }
}

impl Config {
    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<(), WabotError> {
        if !(self.tokens.safety_margin > 0.0 && self.tokens.safety_margin <= 1.0) {
            return Err(WabotError::Config(format!(
                "tokens.safety_margin must be in (0, 1], got {}",
                self.tokens.safety_margin
            )));
        }
        if self.stm.max_messages == 0 {
            return Err(WabotError::Config(
                "stm.max_messages must be at least 1".to_string(),
            ));
        }
        if self.stm.hot_window > self.stm.max_messages {
            return Err(WabotError::Config(format!(
                "stm.hot_window ({}) exceeds stm.max_messages ({})",
                self.stm.hot_window, self.stm.max_messages
            )));
        }
        Ok(())
    }
}

// --- Default value functions ---

fn default_name() -> String {
    "wabot".to_string()
}
fn default_data_dir() -> String {
    "~/.wabot".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_model() -> String {
    "gpt-4-turbo".to_string()
}
fn default_scrub_max_field_len() -> usize {
    200
}
fn default_safety_margin() -> f64 {
    0.9
}
fn default_stm_max_messages() -> usize {
    10
}
fn default_stm_hot_window() -> usize {
    7
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist.
pub fn load(path: &str) -> Result<Config, WabotError> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| WabotError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| WabotError::Config(format!("failed to parse config: {}", e)))?;
    config.validate()?;

    Ok(config)
}

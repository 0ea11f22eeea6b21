use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wabot_core::{config, shellexpand, turn::Turn};
use wabot_history::{estimate_tokens, HistoryError, HistoryPipeline, TokenCheck};

#[derive(Parser)]
#[command(
    name = "wabot",
    version,
    about = "wabot: WhatsApp assistant conversation tooling"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Sanitize a conversation (JSON array of turns) and print the result.
    Sanitize {
        /// Conversation file.
        file: String,
        /// Model to check the token budget against (default: from config).
        #[arg(short, long)]
        model: Option<String>,
        /// Pretty-print the output.
        #[arg(long)]
        pretty: bool,
    },
    /// Show what sanitization would change, without printing turns.
    Inspect {
        /// Conversation file.
        file: String,
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Print the effective configuration.
    Config,
}

/// Install stderr logging plus a daily file under `{data_dir}/logs/`.
///
/// The returned guard flushes the file writer on drop.
fn init_logging(cfg: &config::Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.wabot.log_level));

    let log_dir = Path::new(&shellexpand(&cfg.wabot.data_dir)).join("logs");
    let (file_layer, guard, dir_error) = match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&log_dir, "wabot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    if let Some(e) = dir_error {
        warn!("logging: cannot create {}: {e}", log_dir.display());
    }
    guard
}

async fn read_turns(file: &str) -> anyhow::Result<Vec<Turn>> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {file}"))?;
    let turns: Vec<Turn> =
        serde_json::from_str(&raw).with_context(|| format!("{file} is not a JSON array of turns"))?;
    Ok(turns)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;
    let _guard = init_logging(&cfg);

    match cli.command {
        Commands::Sanitize {
            file,
            model,
            pretty,
        } => {
            let turns = read_turns(&file).await?;
            let model = model.unwrap_or_else(|| cfg.model.name.clone());
            let prepared = HistoryPipeline::new(&cfg).prepare(&turns, &model)?;

            let out = if pretty {
                serde_json::to_string_pretty(&prepared.turns)?
            } else {
                serde_json::to_string(&prepared.turns)?
            };
            println!("{out}");
        }
        Commands::Inspect { file, model } => {
            let turns = read_turns(&file).await?;
            let model = model.unwrap_or_else(|| cfg.model.name.clone());

            let mut roles: BTreeMap<&str, usize> = BTreeMap::new();
            for turn in &turns {
                *roles.entry(turn.role.as_str()).or_default() += 1;
            }

            println!("Conversation: {file}\n");
            for (role, count) in &roles {
                println!("  {role}: {count}");
            }
            println!();

            let pipeline = HistoryPipeline::new(&cfg);
            let (clean, r) = pipeline.clean(&turns);
            println!("  turns: {} -> {}", r.input_len, r.output_len);
            println!("  duplicate user turns: {}", r.duplicates);
            println!("  unsatisfied tool calls: {}", r.assistant_dropped);
            println!("  orphaned tool responses: {}", r.tool_dropped);
            println!("  truncated: {}", r.truncated);
            println!();

            println!("  estimated tokens: ~{}", estimate_tokens(&clean));
            match pipeline.budget().check(&clean, &model) {
                Ok(TokenCheck::Within {
                    safe_limit, limit, ..
                }) => println!("  budget ({model}): within {safe_limit} safe / {limit}"),
                Ok(TokenCheck::Skipped { .. }) => {
                    println!("  budget ({model}): no known limit, not checked")
                }
                Err(HistoryError::TokenLimitExceeded {
                    safe_limit, limit, ..
                }) => println!("  budget ({model}): EXCEEDED {safe_limit} safe / {limit}"),
                Err(e) => println!("  budget ({model}): {e}"),
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
    }

    Ok(())
}

//! saga-ctl: operator access to an envelope saga store.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;

use saga_node::{init_logging, LogFormat, SagaConfig};
use saga_store::SagaStore;
use saga_store_lmdb::{check_data_dir, check_integrity, LmdbEnvironment};
use saga_types::{EnvelopeId, EventStatus, EventType, StreamCheckpoint, Timestamp, TxStatus};

#[derive(Parser)]
#[command(name = "saga-ctl", about = "Inspect and repair an envelope saga store")]
struct Cli {
    /// Path to a TOML configuration file. CLI flags and env vars override it.
    #[arg(long, env = "SAGA_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory holding the LMDB store.
    #[arg(long, env = "SAGA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[arg(long, env = "SAGA_LOG_LEVEL")]
    log_level: Option<String>,

    /// Stream consumer whose checkpoint is read or written.
    #[arg(long, env = "SAGA_CONSUMER_ID")]
    consumer: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print the effective configuration.
    Config,

    /// Count entries in every table and report missing ones.
    Check,

    /// Stream checkpoint.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// A single envelope.
    Envelope {
        #[command(subcommand)]
        action: EnvelopeAction,
    },

    /// Dispatch events, optionally filtered.
    Events {
        #[arg(long)]
        status: Option<EventStatus>,
        #[arg(long)]
        kind: Option<EventType>,
    },

    /// Submitted chain transactions, optionally filtered.
    Transactions {
        #[arg(long)]
        status: Option<TxStatus>,
    },
}

#[derive(clap::Subcommand)]
enum CheckpointAction {
    Show,
    /// Move the checkpoint forward. Lower heights are refused.
    Set { height: u64 },
}

#[derive(clap::Subcommand)]
enum EnvelopeAction {
    /// Print the row, its document and its dispatch events as JSON.
    Show { id: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => SagaConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(consumer) = cli.consumer {
        config.stream.consumer_id = consumer;
    }

    let format: LogFormat = config.log_format.parse()?;
    init_logging(format, &config.log_level)?;

    let consumer = config.stream.consumer_id.clone();
    let output = match cli.command {
        Command::Config => config.to_toml_string()?,
        Command::Check => check(&open_store(&config)?)?,
        Command::Checkpoint { action } => {
            let store = open_store(&config)?;
            match action {
                CheckpointAction::Show => show_checkpoint(&store, &consumer)?,
                CheckpointAction::Set { height } => {
                    set_checkpoint(&store, &consumer, height, Timestamp::now())?
                }
            }
        }
        Command::Envelope { action } => match action {
            EnvelopeAction::Show { id } => show_envelope(&open_store(&config)?, &id)?,
        },
        Command::Events { status, kind } => list_events(&open_store(&config)?, status, kind)?,
        Command::Transactions { status } => list_transactions(&open_store(&config)?, status)?,
    };
    println!("{output}");
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<SagaConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = SagaConfig::from_toml_str(&contents)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

fn open_store(config: &SagaConfig) -> anyhow::Result<LmdbEnvironment> {
    check_data_dir(&config.data_dir).map_err(anyhow::Error::msg)?;
    let store = LmdbEnvironment::open(&config.data_dir, config.map_size)
        .with_context(|| format!("opening store at {}", config.data_dir.display()))?;
    tracing::debug!(data_dir = %config.data_dir.display(), "store opened");
    Ok(store)
}

fn check(store: &LmdbEnvironment) -> anyhow::Result<String> {
    let report = check_integrity(store.env())?;
    let mut out = format!(
        "{} databases, {} entries",
        report.databases_checked, report.total_entries
    );
    for error in &report.errors {
        out.push_str(&format!("\n  {error}"));
    }
    if !report.is_healthy() {
        bail!("{out}");
    }
    Ok(out)
}

fn show_checkpoint(store: &dyn SagaStore, consumer: &str) -> anyhow::Result<String> {
    Ok(match store.read()?.get_checkpoint(consumer)? {
        Some(cp) => format!(
            "{} at height {} (updated {})",
            cp.id, cp.last_block_height, cp.updated_at
        ),
        None => format!("{consumer} has no checkpoint"),
    })
}

fn set_checkpoint(
    store: &dyn SagaStore,
    consumer: &str,
    height: u64,
    now: Timestamp,
) -> anyhow::Result<String> {
    let mut txn = store.write()?;
    let checkpoint = match txn.get_checkpoint(consumer)? {
        Some(mut cp) => {
            if !cp.advance(height, now) {
                bail!(
                    "{consumer} is at height {}; checkpoints only move forward",
                    cp.last_block_height
                );
            }
            cp
        }
        None => StreamCheckpoint::new(consumer, height, now),
    };
    txn.put_checkpoint(&checkpoint)?;
    txn.commit()?;
    tracing::info!(consumer, height, "checkpoint set");
    Ok(format!("{consumer} set to height {height}"))
}

fn show_envelope(store: &dyn SagaStore, id: &str) -> anyhow::Result<String> {
    let id: EnvelopeId = id.parse().with_context(|| format!("invalid envelope id {id}"))?;
    let txn = store.read()?;
    let Some(envelope) = txn.get_envelope(&id)? else {
        bail!("envelope {id} not found");
    };
    let events = txn.events_for_envelope(&id)?;
    let out = serde_json::json!({
        "envelope": envelope,
        "events": events,
    });
    Ok(serde_json::to_string_pretty(&out)?)
}

fn list_events(
    store: &dyn SagaStore,
    status: Option<EventStatus>,
    kind: Option<EventType>,
) -> anyhow::Result<String> {
    let mut events = store.read()?.iter_events()?;
    events.retain(|e| {
        status.map_or(true, |s| e.status == s) && kind.map_or(true, |k| e.event_type == k)
    });
    events.sort_by_key(|e| e.updated_at);

    let lines: Vec<String> = events
        .iter()
        .map(|e| {
            let failure = e
                .failure
                .as_ref()
                .map(|f| format!(" failure={:?} retryable={}", f.message, f.retryable))
                .unwrap_or_default();
            format!(
                "{} {} {} attempts={}{}",
                e.envelope_id, e.event_type, e.status, e.attempts, failure
            )
        })
        .collect();
    Ok(format!("{} events\n{}", lines.len(), lines.join("\n")))
}

fn list_transactions(store: &dyn SagaStore, status: Option<TxStatus>) -> anyhow::Result<String> {
    let mut transactions = store.read()?.iter_transactions()?;
    transactions.retain(|tx| status.map_or(true, |s| tx.status == s));
    transactions.sort_by_key(|tx| tx.submitted_at);

    let lines: Vec<String> = transactions
        .iter()
        .map(|tx| {
            format!(
                "{} {} executions={} submitted={}{}",
                tx.tx_hash,
                tx.status,
                tx.execution_ids.len(),
                tx.submitted_at,
                tx.raw_log
                    .as_deref()
                    .map(|log| format!(" log={log:?}"))
                    .unwrap_or_default()
            )
        })
        .collect();
    Ok(format!("{} transactions\n{}", lines.len(), lines.join("\n")))
}

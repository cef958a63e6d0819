//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use dealflow_core::{Dealflow, EnsureFreshOptions, FreshnessOutcome, HttpEngine, WaitOutcome};
use dealflow_queue::{QueueStats, Worker};
use dealflow_shared::{
    AppConfig, EntityId, Fact, FactSet, FundId, QueuePriority, ResolvedValue, TriggerReason,
    init_config, load_config, load_config_from,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Dealflow: resolve deal facts and keep them fresh.
#[derive(Parser)]
#[command(
    name = "dealflow",
    version,
    about = "Resolve company facts from competing data providers and manage enrichment.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.dealflow/dealflow.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding the config.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Resolve facts for a deal from its stored source records.
    Resolve {
        /// Deal (entity) identifier.
        entity: EntityId,

        /// Resolve only this fact (employee_count, founding_year, ...).
        #[arg(long)]
        fact: Option<Fact>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Source record management.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Request enrichment for one or more deals.
    Ensure {
        /// Deal identifiers. More than one is treated as a bulk request.
        #[arg(required = true)]
        entities: Vec<EntityId>,

        /// Owning fund.
        #[arg(long)]
        fund: FundId,

        /// Trigger reason: upload, manual, bulk, scheduled, first_time.
        #[arg(long, default_value = "manual")]
        reason: TriggerReason,

        /// Enqueue even if eligibility is denied.
        #[arg(long)]
        force: bool,

        /// User recorded with the trigger.
        #[arg(long)]
        user: Option<String>,

        /// Wait up to this many seconds for the item to finish.
        #[arg(long)]
        wait: Option<u64>,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Enqueue directly, bypassing eligibility.
    Enqueue {
        entity: EntityId,

        #[arg(long)]
        fund: FundId,

        #[arg(long, default_value = "manual")]
        reason: TriggerReason,

        /// Defaults to the reason's configured priority.
        #[arg(long)]
        priority: Option<QueuePriority>,

        /// Minutes before the item may be claimed.
        #[arg(long, default_value = "0")]
        delay: u32,
    },

    /// Pause enrichment for a deal.
    Block {
        entity: EntityId,

        /// How long to block, in hours.
        #[arg(long)]
        hours: u32,

        /// Reason shown to anyone whose request is denied.
        #[arg(long)]
        reason: Option<String>,
    },

    /// Lift a block.
    Unblock { entity: EntityId },

    /// Queue worker.
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },

    /// Queue inspection and maintenance.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum SourceAction {
    /// Store a provider snapshot read from a JSON file.
    Import {
        entity: EntityId,
        /// Provider name (LinkedIn, Crunchbase, Enrichment, Deal).
        provider: String,
        /// JSON payload file.
        file: PathBuf,
    },
}

#[derive(Subcommand)]
pub(crate) enum WorkerAction {
    /// Poll the queue and run enrichment engines.
    Run {
        /// Do a single pass and exit.
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum QueueAction {
    /// Item counts per status.
    Stats {
        #[arg(long)]
        fund: Option<FundId>,
        #[arg(long)]
        json: bool,
    },
    /// List queue items for a deal.
    Items { entity: EntityId },
    /// Recover items stuck in processing.
    Reclaim,
    /// Delete old finished items and stale queued ones.
    Cleanup,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "dealflow=info",
        1 => "dealflow=debug",
        _ => "dealflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(cli.config.as_deref(), cli.db.as_deref())?;

    match cli.command {
        Command::Resolve { entity, fact, json } => cmd_resolve(&config, &entity, fact, json).await,
        Command::Source { action } => match action {
            SourceAction::Import {
                entity,
                provider,
                file,
            } => cmd_source_import(&config, &entity, &provider, &file).await,
        },
        Command::Ensure {
            entities,
            fund,
            reason,
            force,
            user,
            wait,
            json,
        } => {
            let options = EnsureFreshOptions {
                force,
                user_id: user,
            };
            cmd_ensure(&config, &entities, &fund, reason, &options, wait, json).await
        }
        Command::Enqueue {
            entity,
            fund,
            reason,
            priority,
            delay,
        } => cmd_enqueue(&config, &entity, &fund, reason, priority, delay).await,
        Command::Block {
            entity,
            hours,
            reason,
        } => cmd_block(&config, &entity, hours, reason.as_deref()).await,
        Command::Unblock { entity } => cmd_unblock(&config, &entity).await,
        Command::Worker { action } => match action {
            WorkerAction::Run { once } => cmd_worker_run(&config, once).await,
        },
        Command::Queue { action } => match action {
            QueueAction::Stats { fund, json } => cmd_queue_stats(&config, fund.as_ref(), json).await,
            QueueAction::Items { entity } => cmd_queue_items(&config, &entity).await,
            QueueAction::Reclaim => cmd_queue_reclaim(&config).await,
            QueueAction::Cleanup => cmd_queue_cleanup(&config).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
    }
}

/// Load the config file (explicit or default) and apply flag overrides.
fn resolve_config(path: Option<&Path>, db: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    if let Some(db) = db {
        config.database.path = db.to_string_lossy().to_string();
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

async fn cmd_resolve(config: &AppConfig, entity: &EntityId, fact: Option<Fact>, json: bool) -> Result<()> {
    let dealflow = Dealflow::open(config).await?;

    match fact {
        Some(fact) => {
            let value = dealflow.resolve(entity, fact).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                print_value(fact, &value);
            }
        }
        None => {
            let set = dealflow.resolve_all(entity).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&set)?);
            } else {
                print_fact_set(entity, &set);
            }
        }
    }
    Ok(())
}

async fn cmd_source_import(config: &AppConfig, entity: &EntityId, provider: &str, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("failed to read {}", file.display()))?;
    let payload: serde_json::Value = serde_json::from_str(&raw)
        .wrap_err_with(|| format!("{} is not valid JSON", file.display()))?;

    let dealflow = Dealflow::open(config).await?;
    let record = dealflow.record_source(entity, provider, payload).await?;
    println!("Recorded {provider} snapshot {} for {entity}", record.id);
    Ok(())
}

fn print_fact_set(entity: &EntityId, set: &FactSet) {
    println!();
    println!("  {entity}");
    for fact in Fact::ALL {
        if let Some(value) = set.get(fact) {
            print_value(fact, value);
        }
    }
    println!();
}

fn print_value(fact: Fact, value: &ResolvedValue) {
    let updated = value
        .last_updated
        .map(|t| format!(", {}", t.format("%Y-%m-%d")))
        .unwrap_or_default();
    println!(
        "  {:<16} {}  ({}, {}{updated})",
        fact.as_str(),
        value.value,
        value.source,
        value.confidence.as_str(),
    );
}

// ---------------------------------------------------------------------------
// Enrichment requests
// ---------------------------------------------------------------------------

async fn cmd_ensure(
    config: &AppConfig,
    entities: &[EntityId],
    fund: &FundId,
    reason: TriggerReason,
    options: &EnsureFreshOptions,
    wait: Option<u64>,
    json: bool,
) -> Result<()> {
    let dealflow = Dealflow::open(config).await?;

    let outcomes = match entities {
        [entity] => vec![(
            entity.clone(),
            dealflow.ensure_fresh(entity, fund, reason, options).await?,
        )],
        _ => {
            if options.force {
                return Err(eyre!("--force is not accepted for bulk requests"));
            }
            dealflow
                .ensure_fresh_bulk(entities, fund, options.user_id.as_deref())
                .await?
        }
    };

    if json {
        let rows: Vec<_> = outcomes
            .iter()
            .map(|(entity, outcome)| serde_json::json!({"entity": entity, "result": outcome}))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for (entity, outcome) in &outcomes {
            match outcome {
                FreshnessOutcome::Enqueued {
                    queue_item_id,
                    priority,
                    scheduled_for,
                } => println!(
                    "{entity}: queued {queue_item_id} ({priority}, runs after {})",
                    scheduled_for.format("%Y-%m-%d %H:%M UTC")
                ),
                FreshnessOutcome::Denied { reason } => println!("{entity}: {reason}"),
            }
        }
    }

    let Some(secs) = wait else {
        return Ok(());
    };
    for (entity, outcome) in &outcomes {
        let FreshnessOutcome::Enqueued { queue_item_id, .. } = outcome else {
            continue;
        };
        let spinner = spinner(format!("Waiting for {entity} enrichment"));
        let result = dealflow
            .wait_for_completion(queue_item_id, Duration::from_secs(secs))
            .await;
        spinner.finish_and_clear();

        match result? {
            WaitOutcome::Completed => {
                println!("{entity}: enrichment completed");
                print_fact_set(entity, &dealflow.resolve_all(entity).await?);
            }
            WaitOutcome::Failed { error } => {
                println!("{entity}: enrichment failed: {}", error.unwrap_or_default());
            }
            WaitOutcome::TimedOut => {
                println!("{entity}: still pending after {secs}s (item {queue_item_id} keeps running)");
            }
        }
    }
    Ok(())
}

async fn cmd_enqueue(
    config: &AppConfig,
    entity: &EntityId,
    fund: &FundId,
    reason: TriggerReason,
    priority: Option<QueuePriority>,
    delay: u32,
) -> Result<()> {
    let dealflow = Dealflow::open(config).await?;
    let priority = priority.unwrap_or_else(|| config.queue.priority_for(reason));
    let id = dealflow
        .coordinator()
        .enqueue(entity, fund, reason, priority, delay)
        .await?;
    println!("{id}");
    Ok(())
}

async fn cmd_block(config: &AppConfig, entity: &EntityId, hours: u32, reason: Option<&str>) -> Result<()> {
    let dealflow = Dealflow::open(config).await?;
    let coordinator = dealflow.coordinator();
    let until = coordinator.now() + chrono::Duration::hours(i64::from(hours));
    coordinator.block_entity(entity, until, reason).await?;
    println!("{entity} blocked until {}", until.format("%Y-%m-%d %H:%M UTC"));
    Ok(())
}

async fn cmd_unblock(config: &AppConfig, entity: &EntityId) -> Result<()> {
    let dealflow = Dealflow::open(config).await?;
    dealflow.coordinator().unblock_entity(entity).await?;
    println!("{entity} unblocked");
    Ok(())
}

// ---------------------------------------------------------------------------
// Worker & queue maintenance
// ---------------------------------------------------------------------------

async fn cmd_worker_run(config: &AppConfig, once: bool) -> Result<()> {
    let engines = HttpEngine::from_config(config)?;
    let dealflow = Dealflow::open(config).await?;
    let worker = Worker::new(
        Arc::clone(dealflow.coordinator()),
        engines,
        config.worker.clone(),
        config.engines.timeout(),
    );

    if once {
        let report = worker.run_once().await?;
        println!(
            "claimed {}, completed {}, failed {}, reclaimed {}, exhausted {}, retried {}{}",
            report.claimed,
            report.completed,
            report.failed,
            report.reclaimed,
            report.exhausted,
            report.retried,
            if report.throttled { " (throttled)" } else { "" }
        );
        return Ok(());
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = tx.send(true);
        }
    });
    worker.run(rx).await?;
    Ok(())
}

async fn cmd_queue_stats(config: &AppConfig, fund: Option<&FundId>, json: bool) -> Result<()> {
    let dealflow = Dealflow::open(config).await?;
    let stats: QueueStats = dealflow.coordinator().queue_stats(fund).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("  queued:     {}", stats.queued);
        println!("  processing: {}", stats.processing);
        println!("  completed:  {}", stats.completed);
        println!("  failed:     {}", stats.failed);
    }
    Ok(())
}

async fn cmd_queue_items(config: &AppConfig, entity: &EntityId) -> Result<()> {
    let dealflow = Dealflow::open(config).await?;
    let items = dealflow.coordinator().items_for_entity(entity).await?;
    if items.is_empty() {
        println!("no queue items for {entity}");
    }
    for item in items {
        println!(
            "{}  {:<10} {:<6} {:<10} attempts={} scheduled={}{}",
            item.id,
            item.status.as_str(),
            item.priority.as_str(),
            item.trigger_reason.as_str(),
            item.attempts,
            item.scheduled_for.format("%Y-%m-%d %H:%M"),
            item.error_message
                .map(|e| format!("  error: {e}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_queue_reclaim(config: &AppConfig) -> Result<()> {
    let dealflow = Dealflow::open(config).await?;
    let queue = &config.queue;
    let report = dealflow
        .coordinator()
        .reclaim_stuck(queue.stuck_threshold_minutes, queue.max_attempts)
        .await?;
    println!(
        "requeued {}, failed after max attempts {}",
        report.requeued.len(),
        report.exhausted.len()
    );
    Ok(())
}

async fn cmd_queue_cleanup(config: &AppConfig) -> Result<()> {
    let dealflow = Dealflow::open(config).await?;
    let queue = &config.queue;
    let coordinator = dealflow.coordinator();
    let finished = coordinator.cleanup_old(queue.retention_days).await?;
    let stale = coordinator.cleanup_stale_queued(queue.stale_queued_days).await?;
    println!("removed {finished} finished and {stale} stale queued items");
    Ok(())
}

/// Spinner on stderr so stdout stays clean for piping.
fn spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg} {elapsed}") {
        spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

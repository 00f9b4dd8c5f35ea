//! recsync CLI - operator tool for the offline mutation queue.
//!
//! Queue writes while the server is unreachable, inspect and repair the
//! queue, and drain it against the record API once connectivity returns.

mod config;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use recsync_common::{Endpoint, LocalId, MutationMethod, RecordRef};
use recsync_sync::{
    ConnectivitySource, ConnectivityState, DrainOutcome, FetchOutcome, OfflineClient, SkipReason,
};

use config::CliConfig;

#[derive(Parser)]
#[command(name = "recsync")]
#[command(about = "recsync - Offline-first record sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: {data-dir}/recsync.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the queue.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Base URL of the record API.
    #[arg(short, long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and edit the mutation queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Run one drain pass against the server.
    Sync,

    /// Show connectivity and queue summary.
    Status,

    /// Read a record, falling back to queued writes when offline.
    Fetch {
        /// Resource collection, e.g. "candidates".
        resource: String,

        /// Record id.
        id: String,
    },

    /// Watch connectivity and drain automatically until Ctrl-C.
    Watch,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Queue a write.
    Add {
        /// Target endpoint, e.g. "candidates" or "candidates/5".
        #[arg(short, long)]
        endpoint: String,

        /// CREATE, UPDATE or DELETE.
        #[arg(short, long)]
        method: String,

        /// JSON body, or @path to read it from a file.
        #[arg(short, long)]
        payload: Option<String>,
    },

    /// List queued writes in delivery order.
    List,

    /// List writes the server keeps refusing.
    Stuck,

    /// Drop a queued write without sending it.
    Discard {
        /// Local id of the write.
        local_id: String,
    },

    /// Replace the body of a queued write.
    Replace {
        /// Local id of the write.
        local_id: String,

        /// New JSON body, or @path to read it from a file.
        #[arg(short, long)]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "recsync", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = CliConfig::load(cli.config.as_deref(), cli.data_dir.as_deref())?;
    if cli.data_dir.is_some() {
        config.data_dir = cli.data_dir;
    }
    if cli.server.is_some() {
        config.server_url = cli.server;
    }

    match cli.command {
        Commands::Queue { command } => match command {
            QueueCommands::Add {
                endpoint,
                method,
                payload,
            } => cmd_queue_add(&config, &endpoint, &method, payload.as_deref()).await,
            QueueCommands::List => cmd_queue_list(&config).await,
            QueueCommands::Stuck => cmd_queue_stuck(&config).await,
            QueueCommands::Discard { local_id } => cmd_queue_discard(&config, &local_id).await,
            QueueCommands::Replace { local_id, payload } => {
                cmd_queue_replace(&config, &local_id, &payload).await
            }
        },

        Commands::Sync => cmd_sync(&config).await,

        Commands::Status => cmd_status(&config).await,

        Commands::Fetch { resource, id } => cmd_fetch(&config, &resource, &id).await,

        Commands::Watch => cmd_watch(&config).await,

        Commands::Completions { .. } => Ok(()),
    }
}

/// Install the log subscriber. `RUST_LOG` wins over `--verbose` when set.
fn init_logging(verbose: bool) -> Result<()> {
    let builder = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = builder.with_env_filter(EnvFilter::from_default_env()).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let level = if verbose { Level::DEBUG } else { Level::INFO };
        let subscriber = builder.with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

async fn open_client(config: &CliConfig) -> Result<OfflineClient> {
    let store = config.open_store()?;
    let api = Arc::new(config.open_api()?);
    // Only one process may own the queue; a running `recsync watch` holds it.
    OfflineClient::open(api, store, config.sync.clone())
        .await
        .context("Failed to open the mutation queue (stop any running `recsync watch` first)")
}

/// Parse a JSON argument, reading `@path` arguments from disk.
fn parse_payload(raw: &str) -> Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("Failed to read payload file {}", path))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("Payload is not valid JSON")
}

/// Probe the server once and report the result to the tracker.
async fn probe_once(config: &CliConfig, client: &OfflineClient) -> Result<ConnectivityState> {
    let mut probe = config.open_probe()?;
    let event = probe
        .next_event()
        .await
        .context("Connectivity probe produced no result")?;
    let state = event.status();
    client.tracker().set_status(state);
    Ok(state)
}

async fn cmd_queue_add(
    config: &CliConfig,
    endpoint: &str,
    method: &str,
    payload: Option<&str>,
) -> Result<()> {
    let endpoint: Endpoint = endpoint.parse()?;
    let method: MutationMethod = method.parse()?;
    let payload = match payload {
        Some(raw) => parse_payload(raw)?,
        None => Value::Null,
    };

    let client = open_client(config).await?;
    let write = client.add_to_queue(endpoint.clone(), method, payload).await?;

    println!("Queued {} {} (not yet saved on the server)", method, endpoint);
    println!("  Local ID: {}", write.local_id);
    println!("  Pending: {}", client.pending_count().await);

    Ok(())
}

async fn cmd_queue_list(config: &CliConfig) -> Result<()> {
    let client = open_client(config).await?;
    let queued = client.queued().await;

    if queued.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("{} queued mutations:", queued.len());
    for mutation in &queued {
        let status = client.write_status(&mutation.local_id).await;
        println!(
            "  {}  {:<6} {:<24} {}  [{:?}]",
            mutation.local_id,
            mutation.method,
            mutation.endpoint,
            mutation.queued_at.format("%Y-%m-%d %H:%M:%S"),
            status
        );
    }

    Ok(())
}

async fn cmd_queue_stuck(config: &CliConfig) -> Result<()> {
    let client = open_client(config).await?;
    let stuck = client.stuck_mutations().await;

    if stuck.is_empty() {
        println!("No rejected mutations.");
        return Ok(());
    }

    println!("{} mutations rejected by the server:", stuck.len());
    for entry in &stuck {
        println!(
            "  {}  {} {}",
            entry.mutation.local_id, entry.mutation.method, entry.mutation.endpoint
        );
        println!(
            "      {} attempts, last {}: {}",
            entry.delivery.failure_count,
            entry.delivery.last_attempt.format("%Y-%m-%d %H:%M:%S"),
            entry.delivery.last_error
        );
    }
    println!("\nUse `recsync queue replace` or `recsync queue discard` to resolve them.");

    Ok(())
}

async fn cmd_queue_discard(config: &CliConfig, local_id: &str) -> Result<()> {
    let local_id = LocalId::new(local_id)?;
    let client = open_client(config).await?;

    if client.discard(&local_id).await? {
        println!("Discarded {}", local_id);
    } else {
        anyhow::bail!("No queued mutation with id {}", local_id);
    }

    Ok(())
}

async fn cmd_queue_replace(config: &CliConfig, local_id: &str, payload: &str) -> Result<()> {
    let local_id = LocalId::new(local_id)?;
    let payload = parse_payload(payload)?;
    let client = open_client(config).await?;

    let write = client.replace(&local_id, payload).await?;
    println!("Replaced {} with {}", local_id, write.local_id);

    Ok(())
}

async fn cmd_sync(config: &CliConfig) -> Result<()> {
    let client = open_client(config).await?;

    if probe_once(config, &client).await? == ConnectivityState::Offline {
        println!(
            "Server unreachable; {} mutations stay queued.",
            client.pending_count().await
        );
        return Ok(());
    }

    match client.trigger_sync().await? {
        DrainOutcome::Skipped(SkipReason::EmptyQueue) => println!("Nothing to sync."),
        DrainOutcome::Skipped(SkipReason::AlreadyRunning) => {
            println!("A sync pass is already running.")
        }
        DrainOutcome::Completed(report) => {
            println!("Sync pass finished in {:?}", report.duration);
            println!("  Delivered: {}", report.delivered.len());
            println!("  Rejected:  {}", report.rejected.len());
            for rejection in &report.rejected {
                println!(
                    "    {} {}: {}",
                    rejection.local_id, rejection.endpoint, rejection.error
                );
            }
            if let Some(local_id) = &report.halted_at {
                println!("  Halted at {} (server unreachable)", local_id);
            }
            println!("  Remaining: {}", report.remaining);
            println!("  State: {}", report.state);
        }
    }

    Ok(())
}

async fn cmd_status(config: &CliConfig) -> Result<()> {
    let client = open_client(config).await?;
    let state = probe_once(config, &client).await?;

    let queued = client.queued().await;
    let stuck = client.stuck_mutations().await;

    println!("Connectivity: {}", state);
    println!("Queued mutations: {}", queued.len());
    println!("Rejected: {}", stuck.len());

    let mut per_resource: std::collections::BTreeMap<&str, usize> = Default::default();
    for mutation in &queued {
        *per_resource.entry(mutation.endpoint.resource()).or_insert(0) += 1;
    }
    for (resource, count) in per_resource {
        println!("  {:<16} {}", resource, count);
    }
    if let Some(oldest) = queued.first() {
        println!("Oldest write: {}", oldest.queued_at.format("%Y-%m-%d %H:%M:%S"));
    }

    Ok(())
}

async fn cmd_fetch(config: &CliConfig, resource: &str, id: &str) -> Result<()> {
    let record = RecordRef::new(resource, id)?;
    let client = open_client(config).await?;

    match client.fetch_record(&record).await {
        FetchOutcome::Found { data, provenance } => {
            println!("Source: {:?}", provenance);
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        FetchOutcome::NotAvailable {
            queued_delete,
            cause,
        } => {
            if queued_delete {
                println!("{} is deleted locally (delete not yet synced).", record);
            } else {
                println!("{} is not available: {}", record, cause);
            }
        }
    }

    Ok(())
}

async fn cmd_watch(config: &CliConfig) -> Result<()> {
    let client = Arc::new(open_client(config).await?);
    let probe = config.open_probe()?;
    let mut status = client.subscribe_status();

    info!(
        "Watching connectivity with {} queued mutations (Ctrl-C to stop)",
        client.pending_count().await
    );
    let (scheduler, task) = client.start_scheduler(probe);

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *status.borrow_and_update();
                println!("[{}] {} ({} queued)", chrono::Local::now().format("%H:%M:%S"), state, client.pending_count().await);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping");
                break;
            }
        }
    }

    scheduler.shutdown().await;
    task.await.context("Scheduler task failed")?;

    Ok(())
}

//! # Cadence: event scheduling worker
//!
//! Polls the event store for due events and dispatches them.
//!
//! Usage:
//!   cadence run                               # Run a worker until Ctrl-C
//!   cadence enqueue --tenant acme --type console --payload '{"param":"hi"}'
//!   cadence show <ID>                         # Print an event document
//!   cadence shards --count 4                  # Print the shard plan

use anyhow::{Context, Result};
use cadence_core::clock::SystemClock;
use cadence_core::config::CadenceConfig;
use cadence_core::event::{EventId, EventPayload, Retention};
use cadence_events::{
    ClusterView, Collaborators, Dispatcher, EventEngine, EventStore, NewEvent, ShardMap,
    SqliteEventStore, WebhookNotifier, enqueue,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence", version, about = "⏰ Cadence: durable event scheduler")]
struct Cli {
    /// Config file (default: ~/.cadence/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Event database path (overrides store.path)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker for this endpoint's shard range
    Run,
    /// Insert a new event
    Enqueue {
        #[arg(long)]
        tenant: String,
        /// console | notification | script | driver
        #[arg(long = "type")]
        event_type: String,
        /// Type-specific fields as a JSON object
        #[arg(long, default_value = "{}")]
        payload: String,
        /// 5-field cron expression; makes the event recurring
        #[arg(long)]
        schedule: Option<String>,
        /// Retention bitmask: 1=failed, 2=completed, 4=skipped
        #[arg(long, default_value = "0")]
        retention: u8,
        #[arg(long)]
        principal: Option<String>,
        /// Expire the event if not processed within this many seconds
        #[arg(long)]
        expires_in: Option<i64>,
        /// Dedup key, unique per tenant
        #[arg(long)]
        key: Option<String>,
    },
    /// Print an event document as JSON
    Show { id: String },
    /// Print the shard plan
    Shards {
        /// Number of workers (default: configured endpoints)
        #[arg(long)]
        count: Option<usize>,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "cadence=debug,cadence_events=debug,cadence_core=debug"
    } else {
        "cadence=info,cadence_events=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn open_store(config: &CadenceConfig, db: Option<&str>) -> Result<Arc<SqliteEventStore>> {
    let path = expand_path(db.unwrap_or(config.store.path.as_str()));
    let store = SqliteEventStore::open(Path::new(&path), config.events.write_concern)
        .with_context(|| format!("opening event store at {path}"))?;
    Ok(Arc::new(store))
}

fn parse_payload(event_type: &str, payload: &str) -> Result<EventPayload> {
    let mut fields: serde_json::Value =
        serde_json::from_str(payload).context("--payload must be JSON")?;
    let object = fields
        .as_object_mut()
        .context("--payload must be a JSON object")?;
    object.insert("type".into(), serde_json::Value::String(event_type.to_lowercase()));
    serde_json::from_value(fields).with_context(|| format!("invalid {event_type} payload"))
}

async fn run_worker(config: CadenceConfig, db: Option<&str>) -> Result<()> {
    let store = open_store(&config, db)?;
    let cluster = ClusterView::new(&config.cluster)?;
    let range = cluster.own_range()?;

    let mut collaborators = Collaborators::new(store.clone());
    if let Some(notifier) = WebhookNotifier::from_config(&config.notify) {
        tracing::info!("📢 Notifications delivered to {}", notifier.url());
        collaborators = collaborators.with_notifier(Arc::new(notifier));
    }
    let dispatcher = Dispatcher::new(collaborators, config.deployment.clone());
    let engine = EventEngine::new(
        store,
        dispatcher,
        config.events.clone(),
        range,
        Arc::new(SystemClock),
    );

    tracing::info!(
        "🚀 Worker {} of {} starting",
        cluster.self_name(),
        cluster.endpoints().len()
    );
    engine.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down, draining in-flight events...");
    engine.stop().await;

    let stats = engine.stats();
    tracing::info!(
        "✅ Processed {} events in {} polls",
        stats.num_processed,
        stats.num_loops
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let config = match &cli.config {
        Some(path) => CadenceConfig::load_from(path)?,
        None => CadenceConfig::load()?,
    };
    let db = cli.db.as_deref();

    match cli.command {
        Command::Run => run_worker(config, db).await?,
        Command::Enqueue {
            tenant,
            event_type,
            payload,
            schedule,
            retention,
            principal,
            expires_in,
            key,
        } => {
            let store = open_store(&config, db)?;
            let retention = Retention::from_bits(retention)
                .with_context(|| format!("retention {retention} out of range 0..=7"))?;
            let now = chrono::Utc::now();

            let mut new = NewEvent::new(tenant, parse_payload(&event_type, &payload)?)
                .retention(retention)
                .max_shard_key(config.cluster.max_shard_key);
            if let Some(schedule) = schedule {
                new = new.schedule(schedule);
            }
            if let Some(principal) = principal {
                new = new.principal(principal);
            }
            if let Some(secs) = expires_in {
                new = new.expires_at(now + chrono::Duration::seconds(secs));
            }
            if let Some(key) = key {
                new = new.key(key);
            }

            let event = enqueue(store.as_ref(), new, now).await?;
            println!("{}", serde_json::to_string_pretty(&event)?);
        }
        Command::Show { id } => {
            let store = open_store(&config, db)?;
            match store.get(&EventId::from(id.as_str())).await? {
                Some(event) => println!("{}", serde_json::to_string_pretty(&event)?),
                None => anyhow::bail!("event {id} not found"),
            }
        }
        Command::Shards { count } => {
            let endpoints = &config.cluster.endpoints;
            let count = count.unwrap_or(endpoints.len());
            let map = ShardMap::new(count, config.cluster.max_shard_key);
            for (i, range) in map.ranges().iter().enumerate() {
                let owner = endpoints.get(i).map(String::as_str).unwrap_or("-");
                println!("{i:>3}  {:>10} ..= {:<10}  {owner}", range.lower, range.upper);
            }
        }
    }
    Ok(())
}

use std::borrow::Cow;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use serde::Serialize;

use driftq::{open_storage, Durability, Item, Queue, QueueManager, StorageConfig};

#[derive(Parser, Debug)]
#[command(name = "driftq", version, about = "Inspect and edit a driftq store")]
struct Cli {
    /// Store file (overrides the config file)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// JSON storage config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, global = true)]
    durability: Option<DurabilityArg>,

    /// Print `queues` and `show` output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List stored queues with their item counts
    Queues,
    /// Print the items of a queue, front first
    Show { queue: String },
    /// Append an item to a queue
    Push {
        queue: String,
        uuid: String,
        data: String,
        /// Seconds the item may spend disconnected
        #[arg(long)]
        ttl: f64,
        /// Keep the item in memory only (it is gone when this command exits)
        #[arg(long)]
        transient: bool,
    },
    /// Remove the front item of a queue
    Pop { queue: String },
    /// Rewrite the store without dead records
    Compact,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DurabilityArg {
    Full,
    Buffered,
}

impl From<DurabilityArg> for Durability {
    fn from(arg: DurabilityArg) -> Self {
        match arg {
            DurabilityArg::Full => Durability::Full,
            DurabilityArg::Buffered => Durability::Buffered,
        }
    }
}

#[derive(Serialize)]
struct QueueSummary<'a> {
    name: &'a str,
    items: usize,
}

#[derive(Serialize)]
struct ItemView<'a> {
    uuid: &'a str,
    ttl: f64,
    persistent: bool,
    data: Cow<'a, str>,
}

impl<'a> From<&'a Item> for ItemView<'a> {
    fn from(item: &'a Item) -> Self {
        Self {
            uuid: &item.uuid,
            ttl: item.ttl,
            persistent: item.is_persistent(),
            data: String::from_utf8_lossy(&item.data),
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = storage_config(&cli)?;
    let mut out = io::BufWriter::new(io::stdout());

    match cli.command {
        Commands::Queues => cmd_queues(&config, cli.json, &mut out)?,
        Commands::Show { queue } => cmd_show(&config, &queue, cli.json, &mut out)?,
        Commands::Push {
            queue,
            uuid,
            data,
            ttl,
            transient,
        } => cmd_push(&config, &queue, uuid, data, ttl, transient, &mut out)?,
        Commands::Pop { queue } => cmd_pop(&config, &queue, &mut out)?,
        Commands::Compact => cmd_compact(config, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn storage_config(cli: &Cli) -> Result<StorageConfig> {
    let mut config = match &cli.config {
        Some(path) => StorageConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => StorageConfig::default(),
    };
    if let Some(store) = &cli.store {
        config.path = store.clone();
    }
    if let Some(durability) = cli.durability {
        config.durability = durability.into();
    }
    Ok(config)
}

fn open_manager(config: &StorageConfig) -> Result<QueueManager> {
    QueueManager::open(config)
        .with_context(|| format!("failed to open store {}", config.path.display()))
}

fn cmd_queues(config: &StorageConfig, json: bool, out: &mut dyn Write) -> Result<()> {
    let manager = open_manager(config)?;
    let names = manager.queue_names();
    let summaries: Vec<QueueSummary<'_>> = names
        .iter()
        .filter_map(|name| manager.queue(name))
        .map(|queue| QueueSummary {
            name: queue.name(),
            items: queue.len(),
        })
        .collect();
    if json {
        serde_json::to_writer_pretty(&mut *out, &summaries)?;
        writeln!(out)?;
    } else {
        for summary in &summaries {
            writeln!(out, "{}\t{}", summary.name, summary.items)?;
        }
    }
    Ok(())
}

fn cmd_show(config: &StorageConfig, name: &str, json: bool, out: &mut dyn Write) -> Result<()> {
    let manager = open_manager(config)?;
    let items: Vec<ItemView<'_>> = manager
        .queue(name)
        .map(Queue::iter)
        .into_iter()
        .flatten()
        .map(ItemView::from)
        .collect();
    if json {
        serde_json::to_writer_pretty(&mut *out, &items)?;
        writeln!(out)?;
    } else {
        for item in &items {
            writeln!(out, "{}\tttl={:.3}\t{}", item.uuid, item.ttl, item.data)?;
        }
    }
    Ok(())
}

fn cmd_push(
    config: &StorageConfig,
    name: &str,
    uuid: String,
    data: String,
    ttl: f64,
    transient: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let mut manager = open_manager(config)?;
    let item = if transient {
        warn!("transient item {uuid} will not outlive this command");
        Item::new(uuid, data, ttl)
    } else {
        Item::persistent(uuid, data, ttl)
    };
    let uuid = item.uuid.clone();
    let mut queue = manager.get_queue(name)?;
    queue
        .push(item)
        .with_context(|| format!("failed to push {uuid} to {name}"))?;
    writeln!(out, "{name}\t{}", queue.len())?;
    drop(queue);
    manager.close()?;
    Ok(())
}

fn cmd_pop(config: &StorageConfig, name: &str, out: &mut dyn Write) -> Result<()> {
    let mut manager = open_manager(config)?;
    let popped = manager
        .get_queue(name)?
        .pop()
        .with_context(|| format!("failed to pop from {name}"))?;
    match popped {
        Some(item) => {
            let view = ItemView::from(&item);
            writeln!(out, "{}\tttl={:.3}\t{}", view.uuid, view.ttl, view.data)?;
        }
        None => info!("queue {name} is empty"),
    }
    manager.close()?;
    Ok(())
}

fn cmd_compact(config: StorageConfig, out: &mut dyn Write) -> Result<()> {
    let config = config.with_compact_on_open(false);
    let mut storage = open_storage(&config)
        .with_context(|| format!("failed to open store {}", config.path.display()))?;
    let stats = storage.compact().context("compaction failed")?;
    storage.close()?;
    writeln!(
        out,
        "records={} live={} bytes_before={} bytes_after={} reclaimed={}",
        stats.records_before,
        stats.live_items,
        stats.bytes_before,
        stats.bytes_after,
        stats.reclaimed_bytes()
    )?;
    Ok(())
}

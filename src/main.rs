//! Pubcrawl main entry point
//!
//! This is the command-line interface for the pubcrawl publication crawler.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use pubcrawl::config::{load_config_with_hash, load_default_config, Config};
use pubcrawl::crawler::{HttpFetcher, Shutdown, StoreFactory, Supervisor};
use pubcrawl::proxy::{load_proxies, ProxyPool};
use pubcrawl::queue::{AmqpConnector, MemoryConnector, QueueConnector};
use pubcrawl::storage::{AuthorStats, RecordStore, Source, SqliteStore};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Pubcrawl: a distributed publication crawler
///
/// Pubcrawl keeps publication lists of tracked authors on Google Scholar
/// and DBLP up to date. A coordinator hands out crawl tasks over a message
/// queue and a pool of workers fetches author pages through rotating
/// proxies.
#[derive(Parser, Debug)]
#[command(name = "pubcrawl")]
#[command(version = "1.0.0")]
#[command(about = "A distributed publication crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file (defaults plus environment if omitted)
    #[arg(short, long, value_name = "CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    /// Also write every log event to this file
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator and the workers until interrupted
    Run {
        /// Use an in-process queue instead of the AMQP broker
        #[arg(long)]
        local: bool,

        /// Override the number of workers
        #[arg(long)]
        workers: Option<u32>,
    },

    /// Start tracking an author
    AddAuthor {
        /// Author display name
        name: String,

        /// Source the URL belongs to (google or dblp)
        #[arg(value_parser = parse_source)]
        source: Source,

        /// Author page URL
        url: String,
    },

    /// Show crawl progress per author
    Status {
        /// Refresh the report every N seconds until interrupted
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },

    /// Validate the configuration and show what would run
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet, cli.log_file.as_deref())?;

    let config = load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { local, workers } => handle_run(config, local, workers).await,
        Command::AddAuthor { name, source, url } => handle_add_author(&config, &name, source, &url),
        Command::Status { watch } => handle_status(&config, watch).await,
        Command::CheckConfig => handle_check_config(&config),
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("pubcrawl=info,warn"),
            1 => EnvFilter::new("pubcrawl=debug,info"),
            2 => EnvFilter::new("pubcrawl=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    let file_layer = match log_file {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    Ok(())
}

fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            let (config, hash) = load_config_with_hash(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            Ok(config)
        }
        None => {
            tracing::debug!("No configuration file given, using defaults");
            Ok(load_default_config()?)
        }
    }
}

fn parse_source(value: &str) -> Result<Source, String> {
    Source::from_db_string(&value.to_ascii_lowercase())
        .ok_or_else(|| format!("unknown source '{value}', expected google or dblp"))
}

fn open_store(config: &Config) -> anyhow::Result<SqliteStore> {
    let path = config.database.path();
    pubcrawl::storage::open_store(Path::new(path))
        .with_context(|| format!("cannot open database {path}"))
}

/// Handles `run`: starts the supervisor and waits for Ctrl-C
async fn handle_run(mut config: Config, local: bool, workers: Option<u32>) -> anyhow::Result<()> {
    if let Some(count) = workers {
        config.worker.count = count;
        pubcrawl::config::validate(&config)?;
    }

    let pool = Arc::new(ProxyPool::from_config(&config.proxy));
    if pool.is_empty() {
        tracing::warn!(
            "No proxies loaded from {}; every crawl will fail with proxy exhaustion",
            config.proxy.file
        );
    }
    let fetcher = Arc::new(HttpFetcher::new(config.worker.request_timeout()));

    let connector: Arc<dyn QueueConnector> = if local {
        tracing::info!("Using in-process queue");
        Arc::new(MemoryConnector::default())
    } else {
        Arc::new(AmqpConnector::new(config.queue.url.clone()))
    };

    // Fail early on an unusable database rather than inside the coordinator
    drop(open_store(&config)?);
    let db_path = PathBuf::from(config.database.path());
    let store_factory: StoreFactory = Arc::new(move || {
        let store = SqliteStore::open(&db_path)?;
        Ok(Box::new(store) as Box<dyn RecordStore>)
    });

    let shutdown = Shutdown::new();
    shutdown.trigger_on_ctrl_c();

    let supervisor = Supervisor::new(config, connector, pool, fetcher, store_factory);
    supervisor.run(shutdown).await?;

    tracing::info!("Crawler system stopped");
    Ok(())
}

/// Handles `add-author`: inserts an author or reports the existing row
fn handle_add_author(config: &Config, name: &str, source: Source, url: &str) -> anyhow::Result<()> {
    url::Url::parse(url).with_context(|| format!("'{url}' is not an absolute URL"))?;

    let mut store = open_store(config)?;
    let author_id = store.add_author(name, source, url)?;

    println!("Added or verified author: {} ({}, id {})", name, source, author_id);
    Ok(())
}

/// Handles `status`: prints the progress report, optionally on a loop
async fn handle_status(config: &Config, watch: Option<u64>) -> anyhow::Result<()> {
    let store = open_store(config)?;

    let Some(secs) = watch else {
        print_progress(&store.author_stats()?);
        return Ok(());
    };

    let shutdown = Shutdown::new();
    shutdown.trigger_on_ctrl_c();
    loop {
        print_progress(&store.author_stats()?);
        if shutdown.sleep(Duration::from_secs(secs.max(1))).await {
            return Ok(());
        }
    }
}

fn print_progress(stats: &[AuthorStats]) {
    println!("\nCrawling Progress Report:");
    println!("{}", "=".repeat(80));
    println!("Time: {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
    println!("{}", "-".repeat(80));
    println!(
        "{:<30} {:<10} {:<22} {:<10}",
        "Author", "Source", "Last Crawl", "Publications"
    );
    println!("{}", "-".repeat(80));

    for stat in stats {
        let last_crawl = stat
            .last_crawl
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "Never".to_string());
        println!(
            "{:<30} {:<10} {:<22} {:<10}",
            stat.name, stat.source, last_crawl, stat.publication_count
        );
    }

    let total: u64 = stats.iter().map(|s| s.publication_count).sum();
    let never = stats.iter().filter(|s| s.last_crawl.is_none()).count();
    println!("{}", "=".repeat(80));
    println!(
        "{} authors, {} never crawled, {} publications",
        stats.len(),
        never,
        total
    );
}

/// Handles `check-config`: validates config and shows what would run
fn handle_check_config(config: &Config) -> anyhow::Result<()> {
    println!("=== Pubcrawl Configuration ===\n");

    println!("Queue:");
    println!("  URL: {}", config.queue.url);
    println!("  Task queue: {}", config.queue.task_queue);
    println!("  Result queue: {}", config.queue.result_queue);
    println!("  Poll interval: {}ms", config.queue.poll_interval_ms);

    println!("\nDatabase:");
    println!("  Path: {}", config.database.path());

    println!("\nProxies:");
    let proxies = load_proxies(Path::new(&config.proxy.file));
    println!("  File: {} ({} proxies)", config.proxy.file, proxies.len());
    println!(
        "  Min request interval: {}s",
        config.proxy.min_request_interval_secs
    );
    println!("  Block duration: {}s", config.proxy.block_duration_secs);

    println!("\nWorkers:");
    println!("  Count: {}", config.worker.count);
    println!("  Attempts per task: {}", config.worker.max_attempts);
    println!("  Request timeout: {}s", config.worker.request_timeout_secs);
    println!("  Heartbeat interval: {}s", config.worker.heartbeat_interval_secs);

    println!("\nCoordinator:");
    println!("  Max retries: {}", config.coordinator.max_retries);
    println!(
        "  Retry delay: {}s doubling, capped at {}s",
        config.coordinator.base_retry_delay_secs, config.coordinator.max_retry_delay_secs
    );
    println!(
        "  Queue high-water mark: {}",
        config.coordinator.queue_high_water_mark
    );
    println!(
        "  Re-crawl intervals: google {}d, dblp {}d",
        config.coordinator.google_interval_days, config.coordinator.dblp_interval_days
    );

    println!("\n✓ Configuration is valid");
    if proxies.is_empty() {
        println!("✗ No proxies available; crawls would fail");
    }

    Ok(())
}

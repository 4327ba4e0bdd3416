use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedwatch::config::Config;
use feedwatch::crawler::{ChannelWorker, Dispatcher, HttpFetcher, OutcomeCounts, RateLimiter};
use feedwatch::metrics::{self, JsonFileSink, ProgressReporter, PrometheusSink, TracingSink};
use feedwatch::parser::SyndicationParser;
use feedwatch::seeder;
use feedwatch::storage::{
    export_window, next_window_end, ChannelRegistry, Database, ExportOptions, ItemStore,
};

#[derive(Parser)]
#[command(
    name = "feedwatch",
    version,
    about = "Large-fleet RSS/Atom watcher with adaptive intervals and a global request budget",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (defaults come from FEEDWATCH_* variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Fleet-wide requests per second
    #[arg(long, global = true)]
    rps: Option<f64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll due feeds continuously until Ctrl-C
    Watch {
        /// Feed list (NDJSON or one id per line) registered before starting
        #[arg(long)]
        channels_file: Option<PathBuf>,

        /// Skip registering the feed list
        #[arg(long, default_value = "false")]
        no_seed: bool,
    },

    /// Reserve one batch of due feeds, process it and exit
    Once {
        /// Feed list registered before the run
        #[arg(long)]
        channels_file: Option<PathBuf>,

        /// Maximum feeds to reserve (default: concurrency * 4)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Register feeds without polling
    Seed {
        /// Feed list (NDJSON or one id per line)
        #[arg(long)]
        channels_file: PathBuf,
    },

    /// Print one progress snapshot
    Status {
        /// Print Prometheus text exposition instead of JSON
        #[arg(long)]
        metrics: bool,
    },

    /// Write the discoveries of one time window as NDJSON
    Export {
        /// Output directory
        #[arg(short, long, default_value = "exports")]
        out_dir: PathBuf,

        /// Window length in minutes
        #[arg(long, default_value = "10")]
        window_minutes: u32,

        /// Skip items published this many hours before the window end (0 disables)
        #[arg(long, default_value = "48")]
        min_published_hours: u32,

        /// Window end (RFC 3339); defaults to now
        #[arg(long)]
        now: Option<DateTime<Utc>>,

        /// Keep exporting at every window boundary until Ctrl-C
        #[arg(long = "loop", default_value = "false")]
        run_loop: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    // Initialize tracing/logging
    let log_format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    setup_tracing(log_format, &config.logging.level, cli.verbose)?;

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    tracing::info!(db = %config.database.sqlite_path.display(), "feedwatch starting");

    match cli.command {
        Commands::Watch {
            channels_file,
            no_seed,
        } => {
            tracing::info!(channels_file = ?channels_file, no_seed, "Starting watch command");
            run_watch(&config, channels_file.filter(|_| !no_seed).as_deref()).await?;
        }

        Commands::Once {
            channels_file,
            limit,
        } => {
            let limit = limit.unwrap_or_else(|| config.once_limit());
            tracing::info!(channels_file = ?channels_file, limit, "Starting once command");
            let counts = run_once(&config, channels_file.as_deref(), limit).await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }

        Commands::Seed { channels_file } => {
            let storage = Storage::open(&config)?;
            let inserted = seeder::seed_from_file(&storage.registry, &channels_file)?;
            let total = storage.registry.total_count()?;
            println!("Registered {inserted} new feeds ({total} total)");
        }

        Commands::Status { metrics: as_metrics } => {
            let storage = Storage::open(&config)?;
            let reporter = ProgressReporter::new(storage.registry, storage.items);
            if as_metrics {
                reporter.with_sink(PrometheusSink).report(OutcomeCounts::default(), 0, None);
                let text = metrics::encode_metrics()
                    .map_err(|e| anyhow::anyhow!("failed to encode metrics: {e}"))?;
                print!("{text}");
            } else {
                let snapshot = reporter.snapshot(OutcomeCounts::default(), 0, None);
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
        }

        Commands::Export {
            out_dir,
            window_minutes,
            min_published_hours,
            now,
            run_loop,
        } => {
            let options = ExportOptions {
                out_dir,
                window_minutes,
                end_time: now,
                min_published_hours,
            };
            tracing::info!(
                out_dir = %options.out_dir.display(),
                window_minutes,
                min_published_hours,
                run_loop,
                "Starting export command"
            );
            run_export(&config, options, run_loop).await?;
        }
    }

    tracing::info!("feedwatch completed successfully");
    Ok(())
}

/// Load file or environment config, then apply CLI overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    if let Some(db) = &cli.db {
        config.database.sqlite_path = db.clone();
    }
    if let Some(concurrency) = cli.concurrency {
        config.watcher.concurrency = concurrency;
    }
    if let Some(rps) = cli.rps {
        config.watcher.requests_per_second = rps;
    }

    config.validate()?;
    Ok(config)
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("feedwatch=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("feedwatch={level},warn"))
            .context("Invalid log level")?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

/// Shared storage handles
struct Storage {
    registry: ChannelRegistry,
    items: ItemStore,
}

impl Storage {
    fn open(config: &Config) -> Result<Self> {
        let path = &config.database.sqlite_path;
        let db = Database::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Arc::new(db);
        Ok(Self {
            registry: ChannelRegistry::new(Arc::clone(&db)),
            items: ItemStore::new(db),
        })
    }

    fn reporter(&self, config: &Config) -> ProgressReporter {
        let mut reporter = ProgressReporter::new(self.registry.clone(), self.items.clone())
            .with_sink(TracingSink)
            .with_sink(PrometheusSink);
        if let Some(path) = &config.progress.json_path {
            reporter = reporter.with_sink(JsonFileSink::new(path));
        }
        reporter
    }

    fn dispatcher(&self, config: &Config) -> Result<Dispatcher> {
        let fetcher = HttpFetcher::with_template(
            &config.watcher.user_agent,
            config.request_timeout(),
            &config.watcher.feed_url_template,
        )
        .context("Failed to build HTTP client")?;
        let limiter = RateLimiter::new(config.watcher.requests_per_second);

        let worker = ChannelWorker::new(
            self.registry.clone(),
            self.items.clone(),
            Arc::new(fetcher),
            Arc::new(SyndicationParser::new()),
            Arc::new(limiter),
            config.schedule.clone(),
        );

        Ok(Dispatcher::new(config.dispatcher(), self.registry.clone(), worker)
            .with_reporter(self.reporter(config)))
    }

    fn seed(&self, channels_file: Option<&Path>) -> Result<()> {
        if let Some(path) = channels_file {
            let inserted = seeder::seed_from_file(&self.registry, path)?;
            tracing::info!(inserted, "Feed list registered");
        }
        Ok(())
    }
}

async fn run_watch(config: &Config, channels_file: Option<&Path>) -> Result<()> {
    let storage = Storage::open(config)?;
    storage.seed(channels_file)?;
    let dispatcher = storage.dispatcher(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, stopping at the next tick");
            let _ = shutdown_tx.send(true);
        }
    });

    let total = dispatcher.run_continuous(shutdown_rx).await?;
    tracing::info!(
        cycles = total.cycles(),
        success = total.success,
        new_items = total.new_items,
        error = total.error,
        "Watch finished"
    );
    Ok(())
}

async fn run_once(config: &Config, channels_file: Option<&Path>, limit: usize) -> Result<OutcomeCounts> {
    let storage = Storage::open(config)?;
    storage.seed(channels_file)?;
    let dispatcher = storage.dispatcher(config)?;
    Ok(dispatcher.run_bounded(limit).await?)
}

async fn run_export(config: &Config, mut options: ExportOptions, run_loop: bool) -> Result<()> {
    let storage = Storage::open(config)?;

    if !run_loop {
        let summary = export_window(&storage.items, &options)?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    loop {
        let end = next_window_end(Utc::now() + chrono::Duration::seconds(1), options.window_minutes);
        let wait = (end - Utc::now()).to_std().unwrap_or_default();
        tracing::debug!(window_end = %end, wait_secs = wait.as_secs(), "Waiting for window boundary");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, stopping export loop");
                return Ok(());
            }
        }

        options.end_time = Some(end);
        match export_window(&storage.items, &options) {
            Ok(summary) => tracing::info!(
                window_end = %summary.window_end,
                written = summary.written,
                skipped_old = summary.skipped_old,
                "Export window done"
            ),
            Err(e) => tracing::error!(error = %e, window_end = %end, "Export window failed"),
        }
    }
}

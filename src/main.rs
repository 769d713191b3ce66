use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use bullbear::cache::ChangeCache;
use bullbear::config::{Config, DEFAULT_AGGREGATE_SLEEP_MS, DEFAULT_SLEEP_MS};
use bullbear::db::{Database, ReconnectingDatabase};
use bullbear::pipeline::filter::{FilterTask, TopicFilter};
use bullbear::pipeline::ingest::IngestTask;
use bullbear::pipeline::{AggregateTask, SentimentEngine};
use bullbear::scheduler::{shutdown_signal, CycleTask, Scheduler, Sleeper, SystemClock, TokioSleeper};
use bullbear::stream::{open_input, StreamBatcher};

/// Bullbear: incremental market-sentiment aggregation.
///
/// Scores how much weight each classified social media post carries, and
/// keeps rolling bullish/bearish series per source and across sources.
#[derive(Parser)]
#[command(name = "bullbear", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the store lives.
#[derive(Args, Debug, Clone, Default)]
struct StoreArgs {
    /// Reach PostgreSQL through an SSH tunnel to BULLBEAR_DB_HOST
    #[arg(long)]
    ssh: bool,

    /// Target database name (overrides BULLBEAR_DB_NAME)
    #[arg(long)]
    database_name: Option<String>,
}

/// Flags shared by the stream-driven roles.
#[derive(Args, Debug, Clone, Default)]
struct StreamArgs {
    /// Read records from this file (followed as it grows) instead of stdin
    #[arg(long, env = "BULLBEAR_INPUT")]
    input: Option<PathBuf>,

    /// Records per batch (overrides BULLBEAR_BATCH_SIZE, default: 50)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Pause between cycles in milliseconds (overrides BULLBEAR_SLEEP_MS, default: 1000)
    #[arg(long)]
    sleep_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store and run migrations
    Init {
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Persist scored posts, engagement and external readings, then refresh
    /// impacts and aggregate after every batch
    Ingest {
        #[command(flatten)]
        stream: StreamArgs,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Select raw posts for the sentiment classifier and write requests to stdout
    Filter {
        #[command(flatten)]
        stream: StreamArgs,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Refresh impacts and aggregate on a fixed interval
    Aggregate {
        /// Pause between cycles in milliseconds (overrides BULLBEAR_SLEEP_MS, default: 60000)
        #[arg(long)]
        sleep_ms: Option<u64>,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Show the latest value of every series
    Status {
        #[command(flatten)]
        store: StoreArgs,
    },
}

/// An open store. PostgreSQL goes through a reconnecting session (and the
/// tunnel it opens, if any), which is closed here.
struct Store {
    db: Arc<dyn Database>,
    remote: Option<Arc<ReconnectingDatabase>>,
    display: String,
}

impl Store {
    async fn close(self) -> Result<()> {
        drop(self.db);
        if let Some(remote) = self.remote {
            remote.disconnect().await?;
        }
        Ok(())
    }
}

/// Opens a PostgreSQL session, through a fresh SSH tunnel when configured.
#[cfg(feature = "postgres")]
struct PgConnector {
    config: Config,
    tunnel: Option<bullbear::tunnel::TunnelConfig>,
}

#[cfg(feature = "postgres")]
#[async_trait::async_trait]
impl bullbear::db::Connector for PgConnector {
    async fn connect(&self) -> Result<bullbear::db::Session> {
        use bullbear::tunnel::SshTunnel;

        let tunnel = match &self.tunnel {
            Some(tunnel_config) => Some(SshTunnel::open(tunnel_config).await?),
            None => None,
        };
        let url = self
            .config
            .postgres_url(tunnel.as_ref().map(SshTunnel::local_port))?;
        let db = bullbear::db::connect_postgres(&url).await?;
        Ok(bullbear::db::Session { db, tunnel })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    // Logs go to stderr: the filter role writes its records to stdout
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bullbear=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { store } => {
            info!("Initializing Bullbear store...");
            let config = load_config(&store, None, None)?;
            let store = open_store(&config, &store, true).await?;
            let table_count = store.db.table_count().await?;
            println!("Store initialized: {}", store.display);
            println!("Tables: {table_count}");
            println!("\nBullbear is ready. Next step: pipe records into one of the roles:");
            println!("  {}", "bullbear filter --input raw.jsonl".dimmed());
            println!("  {}", "bullbear ingest --input scored.jsonl".dimmed());
            store.close().await?;
        }

        Commands::Ingest { stream, store } => {
            let config = load_config(&store, stream.batch_size, stream.sleep_ms)?;
            let store = open_store(&config, &store, false).await?;
            let interval = Duration::from_millis(config.sleep_ms_or(DEFAULT_SLEEP_MS));
            let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);

            let input = open_input(stream.input.as_deref()).await?;
            let batcher = StreamBatcher::new(input, config.batch_size(), interval, sleeper.clone());
            let mut task = IngestTask::new(batcher, build_engine(&config, store.db.clone()));

            info!(
                batch_size = config.batch_size(),
                sleep_ms = interval.as_millis() as u64,
                store = %store.display,
                "Ingest started"
            );
            run_role(&mut task, sleeper, interval).await;
            drop(task);
            store.close().await?;
        }

        Commands::Filter { stream, store } => {
            let config = load_config(&store, stream.batch_size, stream.sleep_ms)?;
            let store = open_store(&config, &store, false).await?;
            let interval = Duration::from_millis(config.sleep_ms_or(DEFAULT_SLEEP_MS));
            let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);

            let input = open_input(stream.input.as_deref()).await?;
            let batcher = StreamBatcher::new(input, config.batch_size(), interval, sleeper.clone());
            let topics = TopicFilter::new(config.topic_keywords.clone());
            let mut task = FilterTask::new(
                batcher,
                store.db.clone(),
                topics,
                config.cache_capacity,
                tokio::io::stdout(),
            );

            info!(
                batch_size = config.batch_size(),
                keywords = config.topic_keywords.len(),
                store = %store.display,
                "Filter started"
            );
            run_role(&mut task, sleeper, interval).await;
            drop(task);
            store.close().await?;
        }

        Commands::Aggregate { sleep_ms, store } => {
            let config = load_config(&store, None, sleep_ms)?;
            let store = open_store(&config, &store, false).await?;
            let interval =
                Duration::from_millis(config.sleep_ms_or(DEFAULT_AGGREGATE_SLEEP_MS));
            let mut task = AggregateTask::new(build_engine(&config, store.db.clone()));

            info!(
                sleep_ms = interval.as_millis() as u64,
                windows = config.windows.len(),
                store = %store.display,
                "Aggregate started"
            );
            run_role(&mut task, Arc::new(TokioSleeper), interval).await;
            drop(task);
            store.close().await?;
        }

        Commands::Status { store } => {
            let config = load_config(&store, None, None)?;
            let store = open_store(&config, &store, false).await?;
            bullbear::status::show(&store.db, &store.display).await?;
            store.close().await?;
        }
    }

    Ok(())
}

/// Load configuration and apply CLI overrides on top of the environment.
fn load_config(
    store: &StoreArgs,
    batch_size: Option<usize>,
    sleep_ms: Option<u64>,
) -> Result<Config> {
    let mut config = Config::load()?;
    if batch_size.is_some() {
        config.batch_size = batch_size;
    }
    if sleep_ms.is_some() {
        config.sleep_ms = sleep_ms;
    }
    if let Some(name) = &store.database_name {
        config.db_name = name.clone();
    }
    config.validate()?;
    Ok(config)
}

fn build_engine(config: &Config, db: Arc<dyn Database>) -> SentimentEngine {
    SentimentEngine::new(
        db,
        ChangeCache::new(config.cache_capacity),
        config.windows.clone(),
        config.normalization,
    )
}

/// Drive a role until Ctrl-C / SIGTERM.
async fn run_role<T: CycleTask>(task: &mut T, sleeper: Arc<dyn Sleeper>, interval: Duration) {
    let scheduler = Scheduler::new(Arc::new(SystemClock), sleeper, interval);
    scheduler.run(task, shutdown_signal()).await;
}

/// Open the configured store. Uses PostgreSQL when DATABASE_URL or
/// BULLBEAR_DB_HOST is set (or `--ssh` is given), otherwise SQLite.
/// `create` allows a new SQLite file; every other command expects `init`
/// to have run. The PostgreSQL session is opened on first use and reopened
/// whenever it is lost, so an unreachable server only fails the cycles
/// that run while it is down.
async fn open_store(config: &Config, args: &StoreArgs, create: bool) -> Result<Store> {
    if args.ssh || config.uses_postgres() {
        #[cfg(feature = "postgres")]
        {
            let tunnel = if args.ssh {
                Some(config.require_tunnel()?)
            } else {
                // Fail on a malformed URL now rather than every cycle.
                config.postgres_url(None)?;
                None
            };
            let display = match (&tunnel, &config.db_host) {
                (Some(_), Some(host)) => format!("PostgreSQL {} on {host} (via SSH)", config.db_name),
                (None, Some(host)) if config.database_url.is_none() => {
                    format!("PostgreSQL {} on {host}", config.db_name)
                }
                _ => "PostgreSQL (DATABASE_URL)".to_string(),
            };
            info!("Using PostgreSQL backend");
            let remote = Arc::new(ReconnectingDatabase::new(PgConnector {
                config: config.clone(),
                tunnel,
            }));
            return Ok(Store {
                db: remote.clone(),
                remote: Some(remote),
                display,
            });
        }
        #[cfg(not(feature = "postgres"))]
        anyhow::bail!(
            "PostgreSQL is configured but the 'postgres' feature is not compiled in.\n\
             Rebuild with: cargo build --features postgres"
        );
    }

    #[cfg(feature = "sqlite")]
    {
        let db = if create {
            bullbear::db::initialize_sqlite(&config.db_path)?
        } else {
            bullbear::db::open_sqlite(&config.db_path)?
        };
        Ok(Store {
            db,
            remote: None,
            display: config.db_path.clone(),
        })
    }
    #[cfg(not(feature = "sqlite"))]
    {
        let _ = create;
        anyhow::bail!(
            "No PostgreSQL database configured and the 'sqlite' feature is not compiled in.\n\
             Set DATABASE_URL or BULLBEAR_DB_HOST."
        )
    }
}

//! Command-line entry point.

use clap::{Parser, ValueEnum};
use stackcollector::{run, Collector, CollectorConfig, StackStore};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Poll profiling endpoints and store their stack samples.
#[derive(Parser, Debug)]
#[command(name = "stackcollector", version, about)]
struct Cli {
    /// JSON config file; flags given here override its values
    #[arg(short, long, env = "STACKCOLLECTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Store file
    #[arg(short, long)]
    dbpath: Option<PathBuf>,

    /// Host to poll (repeatable)
    #[arg(short = 'H', long = "host")]
    hosts: Vec<String>,

    /// Worker processes per host, on consecutive ports from 16384
    #[arg(short, long)]
    nprocs: Option<u16>,

    /// Seconds between sweeps
    #[arg(short, long)]
    interval: Option<u64>,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Threads fetching concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,

    /// Compact the store, applying the configured retention, and exit
    #[arg(long, conflicts_with = "once")]
    reorganize: bool,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info", env = "STACKCOLLECTOR_LOG_LEVEL")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl Cli {
    /// Config file values, then flags on top.
    fn resolve(&self) -> std::io::Result<CollectorConfig> {
        let mut config = match &self.config {
            Some(path) => CollectorConfig::from_json_file(path)?,
            None => CollectorConfig::default(),
        };

        if let Some(dbpath) = &self.dbpath {
            config.db_path = dbpath.clone();
        }
        if !self.hosts.is_empty() {
            config.hosts = self.hosts.clone();
        }
        if let Some(nprocs) = self.nprocs {
            config.nprocs = nprocs;
        }
        if let Some(interval) = self.interval {
            config.interval_secs = interval;
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout_secs = timeout;
        }
        if let Some(workers) = self.workers {
            config.fetch_workers = workers;
        }

        Ok(config)
    }
}

fn init_logging(level: &str, format: LogFormat) -> Result<(), String> {
    let level_filter = match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_target(true)),
        ),
        LogFormat::Compact => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().compact().with_target(true)),
        ),
        LogFormat::Pretty => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().pretty().with_target(true)),
        ),
    };

    result.map_err(|e| format!("Failed to set logger: {}", e))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level, cli.log_format) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    let config = match cli.resolve() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if cli.reorganize {
        let stats = StackStore::open(config.store_config()).and_then(|store| {
            let stats = store.reorganize()?;
            store.close()?;
            Ok(stats)
        });
        return match stats {
            Ok(stats) => {
                info!(
                    keys = stats.keys,
                    bytes_before = stats.bytes_before,
                    bytes_after = stats.bytes_after,
                    "Store reorganized"
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, db_path = %config.db_path.display(), "Error reorganizing store");
                ExitCode::FAILURE
            }
        };
    }

    if cli.once {
        return match Collector::from_config(&config) {
            Ok(collector) => {
                collector.run_once();
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "Error starting collector");
                ExitCode::FAILURE
            }
        };
    }

    match run(&config) {
        Ok(never) => match never {},
        Err(e) => {
            error!(error = %e, "Error starting collector");
            ExitCode::FAILURE
        }
    }
}

mod analytics;
mod config;
mod database;
mod engine;
mod error;
mod notifications;
mod store;
mod types;
mod web;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use analytics::{ChartCache, ChartSeries, WinRate};
use config::{AppConfig, StorageBackend};
use database::SqliteJournal;
use engine::QueryFacade;
use notifications::NotificationManager;
use store::{EventStore, Journal, JsonlJournal, StoreOptions};
use web::{start_server, AppState};

#[derive(Parser)]
#[command(name = "webhook-ledger")]
#[command(version)]
#[command(about = "Webhook event log and strategy analytics for trading bots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to webhook_ledger.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept webhooks and serve the dashboard API
    Serve {
        /// HTTP port (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Write the full log as a JSON document
    Export {
        #[arg(short, long, default_value = "log/log.json")]
        output: PathBuf,
    },
    /// Replay an exported document into an empty store
    Import {
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Log chart summaries per strategy
    Summary {
        /// Base strategy id, e.g. strat_001
        #[arg(short, long)]
        strategy: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json_logs)?;

    let config = AppConfig::load(cli.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Invalid configuration: {}", e);
        }
        return Err(anyhow!("configuration has {} error(s)", errors.len()));
    }

    info!("Webhook Ledger v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Serve { port } => {
            serve(&config, port.unwrap_or(config.server.port)).await?;
        }
        Commands::Export { output } => {
            export_log(&config, &output).await?;
        }
        Commands::Import { input } => {
            import_log(&config, &input).await?;
        }
        Commands::Summary { strategy } => {
            summarize(&config, strategy.as_deref()).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

async fn open_store(config: &AppConfig) -> Result<Arc<EventStore>> {
    let path = &config.storage.path;
    let journal: Box<dyn Journal> = match config.storage.backend {
        StorageBackend::Jsonl => Box::new(JsonlJournal::open(path).await?),
        StorageBackend::Sqlite => Box::new(SqliteJournal::open(path).await?),
    };

    let store = EventStore::open(journal, StoreOptions::from_config(config)).await?;
    Ok(Arc::new(store))
}

async fn serve(config: &AppConfig, port: u16) -> Result<()> {
    let store = open_store(config).await?;
    let notifications = Arc::new(NotificationManager::from_settings(&config.notifications));
    let state = AppState::new(Arc::clone(&store), notifications, config);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    let result = start_server(state, port, shutdown).await;
    if let Err(e) = store.close().await {
        error!("Failed to flush event store: {}", e);
    }
    result
}

async fn export_log(config: &AppConfig, output: &Path) -> Result<()> {
    let store = open_store(config).await?;
    let document = store.export_log().await?;

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(output, document).await?;

    info!(
        "Exported {} records to {}",
        store.snapshot().await.version(),
        output.display()
    );
    Ok(())
}

async fn import_log(config: &AppConfig, input: &Path) -> Result<()> {
    let document = tokio::fs::read_to_string(input).await?;
    let store = open_store(config).await?;
    let count = store.import_log(&document).await?;
    store.close().await?;
    info!("Imported {} records from {}", count, input.display());
    Ok(())
}

async fn summarize(config: &AppConfig, strategy: Option<&str>) -> Result<()> {
    let store = open_store(config).await?;
    let facade = QueryFacade::new(store, Arc::new(ChartCache::new()));

    let charts = match strategy {
        Some(base_id) => facade.snapshot_for(base_id).await?.charts,
        None => facade.snapshot().await.charts,
    };

    if charts.is_empty() {
        info!("No strategies recorded yet");
    }
    for chart in charts.values() {
        log_summary(chart);
    }
    Ok(())
}

fn log_summary(chart: &ChartSeries) {
    let win_rate = match chart.win_rate {
        WinRate::Undefined => "n/a".to_string(),
        WinRate::Defined(rate) => format!("{:.1}%", rate * dec!(100)),
    };
    let max_drawdown = chart
        .max_drawdown
        .map(|d| format!("{:.2}%", d * dec!(100)))
        .unwrap_or_else(|| "n/a".to_string());
    let last_equity = chart
        .last_equity
        .map(|e| e.to_string())
        .unwrap_or_else(|| "n/a".to_string());

    info!(
        "{} epoch {}: {} records, win rate {} ({}/{}), max drawdown {}, last equity {}",
        chart.base_id,
        chart.epoch,
        chart.epoch_records,
        win_rate,
        chart.winning_trades,
        chart.closed_trades,
        max_drawdown,
        last_equity
    );
}

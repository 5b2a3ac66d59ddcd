//! Entity Engine server - standalone binary

use clap::Parser;
use engine_config::{EngineSettings, PathManager, load_env_file};
use entity_core::{EntityDataSource, MemoryDataSource, SqliteDataSource};
use entity_server::{AppState, logging};
use llm::{HealthMonitor, ProviderRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on (0 for random); overrides settings.toml
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to; overrides settings.toml
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Settings file (defaults to settings.toml in the config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, ignored when RUST_LOG is set
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log to stderr instead of the log file
    #[arg(long)]
    log_stderr: bool,

    /// SQLite database path, or ":memory:" for a throwaway in-memory store
    #[arg(short, long)]
    database: Option<String>,

    /// Root for the database, settings and logs; overrides ENTITY_ENGINE_HOME
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn open_data_source(database: Option<&str>) -> anyhow::Result<Arc<dyn EntityDataSource>> {
    match database {
        Some(":memory:") => Ok(Arc::new(MemoryDataSource::new())),
        Some(path) => Ok(Arc::new(SqliteDataSource::open(path)?)),
        None => {
            PathManager::ensure_dirs_exist()?;
            let path = PathManager::db_path()
                .ok_or_else(|| anyhow::anyhow!("no data directory; pass --database"))?;
            Ok(Arc::new(SqliteDataSource::open(path)?))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env_file();
    let args = Args::parse();
    if let Some(dir) = args.data_dir.clone() {
        PathManager::set_root(dir);
    }

    logging::init_logging(args.log_level.as_deref(), !args.log_stderr);

    let settings = match &args.config {
        Some(path) => EngineSettings::load_from(path)?,
        None => EngineSettings::load()?,
    }
    .with_env_overrides();

    let host = args.host.unwrap_or_else(|| settings.server.host.clone());
    let port = args.port.unwrap_or(settings.server.port);

    let registry = Arc::new(ProviderRegistry::from_settings(&settings));
    if registry.provider_names().is_empty() {
        warn!("No model providers configured; AI endpoints will answer 503");
    }

    let mut monitor = HealthMonitor::new(Duration::from_secs(
        settings.ai.health_check_interval_secs,
    ));
    monitor.connect(registry.clone());
    if settings.ai.health_check_interval_secs > 0 {
        monitor.start()?;
    }

    let data_source = open_data_source(args.database.as_deref())?;
    let state = AppState::new(registry, settings).with_data_source(data_source);

    let handle = entity_server::start_server_on(&host, port, state).await?;

    info!("Entity server running at {}", handle.url());
    println!("Entity server running at {}", handle.url());
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    monitor.stop();
    handle.stop();
    Ok(())
}

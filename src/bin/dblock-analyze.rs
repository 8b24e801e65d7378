// Offline lock analysis for captured snapshots
use anyhow::{Context, Result};
use clap::Parser;
use dblock_rs::lock_analysis::{AnalysisOptions, CollectionWindow, LockAnalysisEngine, ReplayCollector};
use dblock_rs::logging::init_logging;
use dblock_rs::EngineConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "dblock-analyze",
    version,
    about = "Analyze a captured lock snapshot: wait chains, deadlocks, contention, health and advice"
)]
struct Cli {
    #[arg(short, long, help = "Lock snapshot JSON file", required_unless_present = "print_config")]
    snapshot: Option<PathBuf>,

    #[arg(short, long, help = "Database id to analyze (defaults to the id in the snapshot)")]
    database: Option<String>,

    #[arg(short, long, env = "DBLOCK_CONFIG", help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(long, help = "Collection window in seconds")]
    window_secs: Option<u64>,

    #[arg(long, help = "Pretty-print the JSON result")]
    pretty: bool,

    #[arg(long, help = "Print a sample configuration file and exit")]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", EngineConfig::sample_toml()?);
        return Ok(());
    }

    let config = EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let _guard = init_logging(&config.logging)?;

    let collector = Arc::new(ReplayCollector::new());
    let snapshot_path = cli
        .snapshot
        .as_ref()
        .context("--snapshot is required")?;
    let snapshot_id = collector
        .load_file(snapshot_path)
        .await
        .with_context(|| format!("failed to load snapshot {}", snapshot_path.display()))?;
    let database_id = cli.database.unwrap_or(snapshot_id);

    let engine = LockAnalysisEngine::new(collector, config)?;
    let mut options = AnalysisOptions::new();
    if let Some(secs) = cli.window_secs {
        options = options.with_time_range(CollectionWindow::last_secs(secs));
    }

    info!("Analyzing '{}' from {}", database_id, snapshot_path.display());
    let result = engine.analyze(&database_id, options).await?;

    let output = if cli.pretty {
        serde_json::to_string_pretty(result.as_ref())?
    } else {
        serde_json::to_string(result.as_ref())?
    };
    println!("{}", output);

    engine.shutdown().await;
    Ok(())
}

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use pipeline::{Pipeline, PipelineConfig};
use tracing_subscriber::EnvFilter;
use types::event::Event;

#[derive(Parser, Debug)]
#[command(name = "pipeline", about = "Durable low-latency event pipeline")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replay logged events at or after this timestamp (ns) before serving
    #[arg(long)]
    replay_since: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = PipelineConfig::from_str("")?;
            config.apply_env();
            config.validate()?;
            config
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(log_dir = %config.log.dir.display(), "Starting pipeline");
    let pipeline = Pipeline::start(config).await?;

    pipeline.subscribe(|event: Event| -> anyhow::Result<()> {
        tracing::debug!(
            kind = event.kind.label(),
            symbol = %event.symbol,
            price = %event.price,
            volume = event.volume,
            timestamp = event.timestamp,
            "Event"
        );
        Ok(())
    })?;

    if let Some(cutover) = args.replay_since {
        let stats = pipeline.replay_since(cutover).await?;
        tracing::info!(
            scanned = stats.scanned,
            republished = stats.republished,
            failed = stats.failed,
            "Recovery replay finished"
        );
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    pipeline.stop().await?;
    println!("{}", serde_json::to_string_pretty(&pipeline.metrics())?);

    Ok(())
}

use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use call_core::{load_settings, load_settings_from};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod scenario;

use scenario::Scenario;

/// Replays a recorded participant-sync scenario and prints the final state.
#[derive(Parser, Debug)]
struct Args {
    /// Scenario file (JSON).
    scenario: PathBuf,
    /// Engine settings file; defaults to `call_sync.toml` plus env overrides.
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Time given to the engine after each step.
    #[arg(long, default_value_t = 20)]
    settle_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    let raw = fs::read_to_string(&args.scenario)
        .with_context(|| format!("reading scenario {}", args.scenario.display()))?;
    let scenario: Scenario = serde_json::from_str(&raw)
        .with_context(|| format!("parsing scenario {}", args.scenario.display()))?;

    let report = scenario::run(scenario, settings, Duration::from_millis(args.settle_ms)).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

mod replay;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use roz_store::json::StateChanged;
use roz_store::{load_initial_state, load_initial_state_or_empty, StoreConfig};

use crate::replay::{parse_log, replay};

#[derive(Parser)]
#[command(
    name = "roz-replay",
    about = "Replay a JSON-lines action log against an initial state document"
)]
struct Cli {
    /// Initial state document (JSON object)
    #[arg(long)]
    state: PathBuf,

    /// Action log, one JSON object per line
    #[arg(long)]
    actions: PathBuf,

    /// Start from `{}` when the state document is missing or invalid
    #[arg(long)]
    lenient: bool,

    /// Print a STATE_CHANGED line for every applied SET_STATE
    #[arg(long)]
    events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("roz=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = StoreConfig::from_env()?;
    config.log_summary();

    let initial = if cli.lenient {
        load_initial_state_or_empty(&cli.state).await
    } else {
        load_initial_state(&cli.state).await?
    };

    let log = tokio::fs::read_to_string(&cli.actions)
        .await
        .with_context(|| format!("Failed to read action log {}", cli.actions.display()))?;
    let actions = parse_log(&log)?;
    info!(count = actions.len(), "Replaying actions");

    let print_event = cli.events.then_some(|event: &StateChanged| {
        let line = serde_json::json!({
            "type": StateChanged::EVENT_TYPE,
            "event": event,
        });
        writeln!(std::io::stdout().lock(), "{line}").context("Failed to write event")
    });

    let (summary, state) = replay(initial, config, actions, print_event).await?;
    info!(
        applied = summary.applied,
        events = summary.events,
        "Replay summary"
    );
    if summary.failed > 0 {
        warn!(
            failed = summary.failed,
            total = summary.total,
            "Some actions were not applied"
        );
    }

    println!("{}", serde_json::to_string_pretty(&*state)?);

    Ok(())
}

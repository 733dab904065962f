use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wotd_core::{Clock, SystemClock, WordOfTheDayState};
use wotd_sync::{build_orchestrator, PipelineConfig, ScheduleState, Scheduler};

#[derive(Debug, Parser)]
#[command(name = "wotd-cli")]
#[command(about = "Word of the Day acquisition pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Where the cached record lives (overrides WOTD_CACHE_PATH).
    #[arg(long, global = true)]
    cache_path: Option<PathBuf>,

    /// Serve a Wordnik-shaped JSON file instead of calling the API.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    #[arg(long, global = true)]
    time_zone: Option<String>,

    #[arg(long, global = true)]
    target_hour: Option<u32>,

    #[arg(long, global = true)]
    target_minute: Option<u32>,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print today's word, fetching only when the cache is outdated.
    Fetch {
        /// Skip the freshness check and always hit the remote source.
        #[arg(long)]
        force: bool,
    },
    /// Print the cached record without touching the network.
    Show,
    /// Delete the cached record.
    Clear,
    /// Print when the scheduler and the freshness check next fire.
    NextRun,
    /// Run the daily scheduler until Ctrl-C.
    Run,
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::from_env();
        if let Some(path) = &self.cache_path {
            config.cache_path = path.clone();
        }
        if let Some(path) = &self.fixture {
            config.fixture_path = Some(path.clone());
        }
        if let Some(zone) = &self.time_zone {
            config.time_zone = zone.clone();
        }
        if let Some(hour) = self.target_hour {
            config.target_hour = hour;
        }
        if let Some(minute) = self.target_minute {
            config.target_minute = minute;
        }
        config
    }
}

fn init_logging(level: &str) {
    // RUST_LOG still wins over the flag.
    let default = format!("{level},reqwest=warn,hyper=warn");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn render(state: &WordOfTheDayState) {
    match state {
        WordOfTheDayState::Loading => println!("loading..."),
        WordOfTheDayState::Success {
            artifact,
            is_from_cache,
            last_updated,
        } => {
            let definition = artifact.definition();
            println!("{} {}", artifact.word(), artifact.pronunciation());
            println!("  {}: {}", definition.part_of_speech, definition.text);
            for example in artifact.examples() {
                println!("  \"{}\" ({})", example.text, example.title);
            }
            if !artifact.note().is_empty() {
                println!("  note: {}", artifact.note());
            }
            let origin = if *is_from_cache { "cache" } else { "network" };
            println!("  [{origin}, updated {last_updated}]");
        }
        WordOfTheDayState::Error {
            message,
            kind,
            cached_data,
        } => {
            eprintln!("error ({kind:?}): {message}");
            if let Some(artifact) = cached_data {
                eprintln!("  last known word: {}", artifact.word());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = cli.pipeline_config();
    let orchestrator = Arc::new(build_orchestrator(&config)?);

    match cli.command.unwrap_or(Commands::Fetch { force: false }) {
        Commands::Fetch { force } => {
            render(&WordOfTheDayState::Loading);
            let state = WordOfTheDayState::from(orchestrator.get_word_of_day(force).await);
            render(&state);
            if matches!(state, WordOfTheDayState::Error { .. }) {
                bail!("no word of the day available");
            }
        }
        Commands::Show => match orchestrator.latest().await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => println!("no cached word of the day"),
        },
        Commands::Clear => {
            orchestrator.clear_cache().await?;
            println!("cache cleared: {}", config.cache_path.display());
        }
        Commands::NextRun => {
            let policy = *orchestrator.policy();
            let now = SystemClock.now();
            let snapshot = ScheduleState::initial(&policy, now).snapshot();
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            if let Some(record) = orchestrator.latest().await? {
                let boundary = policy.next_boundary_after_fetch(record.fetched_at);
                println!(
                    "cached `{}` expires at {} (refetch needed now: {})",
                    record.artifact.word(),
                    boundary.with_timezone(&policy.time_zone()),
                    policy.should_refetch_record(now, Some(&record)),
                );
            }
        }
        Commands::Run => {
            let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            let scheduler = Scheduler::new(Arc::clone(&orchestrator), config.scheduler_config());
            let handle = scheduler.spawn(stop_rx);

            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            let _ = stop_tx.send(true);
            let state = handle.await?;
            info!(next_run = %state.snapshot().next_run_local, "scheduler exited");
        }
    }

    Ok(())
}

/// threadsync - replays a recorded event scenario through the sync engine
use anyhow::Context;
use colored::*;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use threadsync_core::fetcher::FixtureFetcher;
use threadsync_core::messenger_types::{ConversationSummary, StatusIcon, SyncEvent};
use threadsync_core::pin_store::{MemoryPinStorage, PinStorage, SledPinStorage};
use threadsync_core::presentation::LogDelegate;
use threadsync_core::{EngineSnapshot, SyncConfig, SyncEngine};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Recorded session: what the server holds and what the bus delivered
#[derive(Debug, Deserialize)]
struct Scenario {
    threads: Vec<ConversationSummary>,
    #[serde(default)]
    cache: Vec<ConversationSummary>,
    #[serde(default)]
    events: Vec<SyncEvent>,
}

fn load_scenario(path: &Path) -> anyhow::Result<Scenario> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid scenario {}", path.display()))
}

fn print_list(snapshot: &EngineSnapshot) {
    println!();
    println!("{}", "Conversations".bold().underline());
    for entry in &snapshot.entries {
        let icon = match entry.derived.status_icon {
            StatusIcon::Pinned => "📌".to_string(),
            StatusIcon::Muted => "🔇".to_string(),
            StatusIcon::Mentioned => "@".yellow().bold().to_string(),
            StatusIcon::Closed => "✖".red().to_string(),
            StatusIcon::None => " ".to_string(),
        };
        let unread = if entry.unread_count > 0 {
            format!("({})", entry.unread_count).cyan().bold().to_string()
        } else {
            String::new()
        };
        let title = if entry.is_selected {
            entry.derived.title.reversed().to_string()
        } else {
            entry.derived.title.bold().to_string()
        };
        println!(
            "{} {:>6}  {} {}  {}",
            icon,
            entry.id.to_string().dimmed(),
            title,
            unread,
            entry.derived.subtitle.dimmed()
        );
    }
    println!();
    println!(
        "{} {}   {} {:?}   {} {}",
        "pins:".dimmed(),
        format!("{:?}", snapshot.pins).green(),
        "phase:".dimmed(),
        snapshot.phase,
        "more:".dimmed(),
        snapshot.has_next
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let config = SyncConfig::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let scenario_path = config
        .scenario_path
        .clone()
        .context("No scenario file given")?;
    let scenario = load_scenario(&scenario_path)?;
    info!(
        threads = scenario.threads.len(),
        events = scenario.events.len(),
        "Loaded scenario {}",
        scenario_path.display()
    );

    let pin_storage: Arc<dyn PinStorage> = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Arc::new(SledPinStorage::new(dir)?)
        }
        None => Arc::new(MemoryPinStorage::new()),
    };
    let fetcher = Arc::new(FixtureFetcher::new(scenario.threads).with_cache(scenario.cache));
    let fetch_timeout = config.fetch_timeout;

    let engine = SyncEngine::spawn(config, fetcher, Arc::new(LogDelegate), pin_storage)?;
    engine.get_threads().await?;

    for event in scenario.events {
        engine.publish(event).await?;
    }
    engine.flush_messages().await?;

    // Events may have started a resync; give it time to land
    let deadline = tokio::time::Instant::now() + fetch_timeout;
    let mut snapshot = engine.snapshot().await?;
    while snapshot.loading && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
        snapshot = engine.snapshot().await?;
    }
    engine.shutdown().await?;
    print_list(&snapshot);
    Ok(())
}

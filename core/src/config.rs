/// Configuration management
use crate::error::{Result, SyncError};
use crate::messenger_types::UserId;
use crate::store::ListScope;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PAGE_SIZE: usize = 25;
const DEFAULT_LOAD_MORE_THRESHOLD: usize = 10;
const DEFAULT_MAX_BATCH_SIZE: usize = 50;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// The signed-in user; decides unread counting and display names
    pub viewer_id: UserId,

    /// Active or archived conversations
    pub scope: ListScope,

    /// Conversations requested per page
    pub page_size: usize,

    /// `load_more` only fires for anchors among the last N loaded ids
    pub load_more_threshold: usize,

    /// Message batch window, fixed from the first arrival
    pub batch_window: Duration,

    /// Message count that flushes a batch early
    pub max_batch_size: usize,

    /// Fetch timeout used when the fetcher doesn't provide one
    pub fetch_timeout: Duration,

    /// Whether automatic page loads may be served from cache
    pub use_cache: bool,

    /// Lists at least this long are sorted on a blocking thread
    pub offload_sort_threshold: usize,

    /// Capacity of the writer's command queue
    pub command_queue_capacity: usize,

    /// Directory for the persistent pin ranking (in-memory when unset)
    pub data_dir: Option<PathBuf>,

    /// Scenario file replayed by the binary
    pub scenario_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            viewer_id: 0,
            scope: ListScope::Active,
            page_size: DEFAULT_PAGE_SIZE,
            load_more_threshold: DEFAULT_LOAD_MORE_THRESHOLD,
            batch_window: Duration::from_millis(200),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            fetch_timeout: Duration::from_secs(30),
            use_cache: true,
            offload_sort_threshold: 1000,
            command_queue_capacity: 256,
            data_dir: None,
            scenario_path: None,
        }
    }
}

impl SyncConfig {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <scenario.json> [--viewer <id>] [--page-size <n>] [--load-more-threshold <n>] [--batch-window-ms <ms>] [--max-batch <n>] [--archived] [--no-cache] [--data-dir <path>]",
                args.first().map(String::as_str).unwrap_or("threadsync")
            )));
        }

        let mut config = Self {
            scenario_path: Some(PathBuf::from(&args[1])),
            ..Default::default()
        };

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--viewer" => {
                    config.viewer_id = parse_value(args, i, "--viewer")?;
                    i += 2;
                }
                "--page-size" => {
                    config.page_size = parse_value(args, i, "--page-size")?;
                    i += 2;
                }
                "--load-more-threshold" => {
                    config.load_more_threshold = parse_value(args, i, "--load-more-threshold")?;
                    i += 2;
                }
                "--batch-window-ms" => {
                    let ms: u64 = parse_value(args, i, "--batch-window-ms")?;
                    config.batch_window = Duration::from_millis(ms);
                    i += 2;
                }
                "--max-batch" => {
                    config.max_batch_size = parse_value(args, i, "--max-batch")?;
                    i += 2;
                }
                "--archived" => {
                    config.scope = ListScope::Archived;
                    i += 1;
                }
                "--no-cache" => {
                    config.use_cache = false;
                    i += 1;
                }
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    config.data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                other => {
                    return Err(SyncError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Some(n) = std::env::var("THREADSYNC_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            config.page_size = n;
        }
        if let Some(ms) = std::env::var("THREADSYNC_BATCH_WINDOW_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.batch_window = Duration::from_millis(ms);
        }
        if std::env::var("THREADSYNC_NO_CACHE").is_ok() {
            config.use_cache = false;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine can't work with
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(SyncError::Config("page size must be at least 1".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(SyncError::Config("max batch size must be at least 1".to_string()));
        }
        if self.command_queue_capacity == 0 {
            return Err(SyncError::Config("command queue capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T> {
    let raw = args
        .get(i + 1)
        .ok_or_else(|| SyncError::Config(format!("{} requires a value", flag)))?;
    raw.parse::<T>()
        .map_err(|_| SyncError::Config(format!("{} got an invalid value: {}", flag, raw)))
}

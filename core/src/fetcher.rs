/// Network fetch boundary and a fixture-backed implementation
use crate::error::{Result, SyncError};
use crate::messenger_types::ConversationSummary;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Where a page may come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Local cache only, no network hit
    CacheOnly,
    /// Cache if available, network otherwise
    PreferCache,
    /// Always hit the network
    NetworkOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub count: usize,
    pub offset: usize,
    /// None lists everything, Some(flag) filters by archive state
    pub archived: Option<bool>,
    pub mode: FetchMode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadPage {
    pub threads: Vec<ConversationSummary>,
    pub has_next: bool,
}

/// Source of conversation pages. Transport, auth and cache format live
/// behind this trait.
#[async_trait]
pub trait ThreadFetcher: Send + Sync {
    async fn fetch_threads(&self, request: FetchRequest) -> Result<ThreadPage>;

    /// Per-request timeout; the engine's configured default applies when None
    fn request_timeout(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Default)]
struct FixtureState {
    server: Vec<ConversationSummary>,
    cache: Vec<ConversationSummary>,
    delays: VecDeque<Duration>,
    failures: VecDeque<String>,
    requests: Vec<FetchRequest>,
}

/// Serves pages from an in-memory thread list, with a write-through cache.
///
/// Used by the replay binary; delays and failures can be scripted per call.
#[derive(Debug, Default)]
pub struct FixtureFetcher {
    state: Mutex<FixtureState>,
    timeout: Option<Duration>,
}

impl FixtureFetcher {
    pub fn new(server: Vec<ConversationSummary>) -> Self {
        Self {
            state: Mutex::new(FixtureState {
                server,
                ..Default::default()
            }),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache(self, cache: Vec<ConversationSummary>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.cache = cache;
        }
        self
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FixtureState) -> R) -> Result<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SyncError::Fetch("fixture state poisoned".to_string()))?;
        Ok(f(&mut state))
    }

    /// Replace what the "server" returns from now on
    pub fn set_threads(&self, threads: Vec<ConversationSummary>) -> Result<()> {
        self.with_state(|s| s.server = threads)
    }

    /// Delay the next call by `delay`
    pub fn push_delay(&self, delay: Duration) -> Result<()> {
        self.with_state(|s| s.delays.push_back(delay))
    }

    /// Fail the next call with a fetch error
    pub fn push_failure(&self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.with_state(|s| s.failures.push_back(message))
    }

    /// Every request seen so far
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.with_state(|s| s.requests.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ThreadFetcher for FixtureFetcher {
    async fn fetch_threads(&self, request: FetchRequest) -> Result<ThreadPage> {
        // Page contents are decided when the call is made, not when it returns
        let (delay, outcome) = self.with_state(|s| {
            s.requests.push(request.clone());
            let delay = s.delays.pop_front();
            if let Some(message) = s.failures.pop_front() {
                return (delay, Err(SyncError::Fetch(message)));
            }

            let source = match request.mode {
                FetchMode::CacheOnly => &s.cache,
                FetchMode::PreferCache if !s.cache.is_empty() => &s.cache,
                _ => &s.server,
            };
            let filtered: Vec<ConversationSummary> = source
                .iter()
                .filter(|t| request.archived.map_or(true, |a| t.is_archived == a))
                .cloned()
                .collect();
            let threads: Vec<ConversationSummary> = filtered
                .iter()
                .skip(request.offset)
                .take(request.count)
                .cloned()
                .collect();
            let has_next = request.offset + threads.len() < filtered.len();

            if request.mode != FetchMode::CacheOnly {
                for t in &threads {
                    match s.cache.iter_mut().find(|c| c.id == t.id) {
                        Some(c) => *c = t.clone(),
                        None => s.cache.push(t.clone()),
                    }
                }
            }
            (delay, Ok(ThreadPage { threads, has_next }))
        })?;

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Ok(page) = &outcome {
            debug!(
                offset = request.offset,
                count = page.threads.len(),
                mode = ?request.mode,
                "Fixture page served"
            );
        }
        outcome
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

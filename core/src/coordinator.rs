/// Sync coordinator: pagination, refresh, connection loss and recovery, and
/// pin-ranking bookkeeping.
///
/// The coordinator only plans fetches and installs their results; the engine
/// runs the actual I/O on separate tasks. Every planned fetch carries the
/// generation it was started under, and results from an older generation are
/// dropped on arrival.
use crate::config::SyncConfig;
use crate::error::Result;
use crate::fetcher::{FetchMode, FetchRequest, ThreadPage};
use crate::invariants;
use crate::messenger_types::{ConnectionStatus, ConversationId};
use crate::pin_ranking::PinRanking;
use crate::pin_store::PinStorage;
use crate::sort_policy;
use crate::store::{ConversationStore, ListScope};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    Idle,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    /// Next page of the list
    Page,
    /// User-triggered pull-to-refresh
    Refresh,
    /// Full resync after (re)connecting
    Reconnect,
    /// Offline read while nothing has been received yet
    CachedRead,
}

/// A fetch the engine should run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFetch {
    /// Unique per planned fetch
    pub seq: u64,
    pub generation: u64,
    pub kind: FetchKind,
    pub request: FetchRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyLoading,
    NoMorePages,
    AnchorNotNearTail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    Applied {
        kind: FetchKind,
        received: usize,
        has_next: bool,
    },
    Skipped(SkipReason),
    /// Superseded by a newer refresh; nothing was installed
    Stale,
}

/// Captured when the connection drops, consumed by the next reconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReconnectState {
    pub last_known_pin_ranking: PinRanking,
    pub was_disconnected: bool,
}

pub struct SyncCoordinator {
    page_size: usize,
    load_more_threshold: usize,
    use_cache: bool,
    scope: ListScope,

    phase: LoadPhase,
    connection: Option<ConnectionStatus>,
    generation: u64,
    next_seq: u64,
    in_flight: Option<u64>,
    offset: usize,
    has_next: bool,
    trust_next_pin_page: bool,
    /// A post-connect resync hasn't been applied yet
    resync_pending: bool,
    received_response: bool,
    pending_reconnect: Option<PendingReconnectState>,
    scroll_intent: Option<ConversationId>,

    pins: PinRanking,
    persisted_pins: Vec<ConversationId>,
    pin_storage: Arc<dyn PinStorage>,
}

impl SyncCoordinator {
    /// Create a coordinator, restoring the last persisted pin ranking
    pub fn new(config: &SyncConfig, pin_storage: Arc<dyn PinStorage>) -> Self {
        let persisted_pins = match pin_storage.load() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Could not load persisted pin ranking: {}", e);
                Vec::new()
            }
        };
        debug!(pins = ?persisted_pins, "Restored pin ranking");

        Self {
            page_size: config.page_size,
            load_more_threshold: config.load_more_threshold,
            use_cache: config.use_cache,
            scope: config.scope,
            phase: LoadPhase::Idle,
            connection: None,
            generation: 0,
            next_seq: 0,
            in_flight: None,
            offset: 0,
            has_next: true,
            trust_next_pin_page: false,
            resync_pending: false,
            received_response: false,
            pending_reconnect: None,
            scroll_intent: None,
            pins: PinRanking::new(persisted_pins.iter().copied()),
            persisted_pins,
            pin_storage,
        }
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    pub fn connection(&self) -> Option<ConnectionStatus> {
        self.connection
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn has_next(&self) -> bool {
        self.has_next
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pins(&self) -> &PinRanking {
        &self.pins
    }

    pub fn pins_mut(&mut self) -> &mut PinRanking {
        &mut self.pins
    }

    pub fn scroll_intent(&self) -> Option<ConversationId> {
        self.scroll_intent
    }

    pub fn set_scroll_intent(&mut self, id: Option<ConversationId>) {
        self.scroll_intent = id;
    }

    /// Write the ranking to storage if it changed since the last save.
    /// Storage failures are logged; the in-memory ranking stays authoritative.
    pub fn persist_pins(&mut self) {
        if self.pins.ids() == self.persisted_pins.as_slice() {
            return;
        }
        match self.pin_storage.save(self.pins.ids()) {
            Ok(()) => self.persisted_pins = self.pins.ids().to_vec(),
            Err(e) => warn!("Failed to persist pin ranking: {}", e),
        }
    }

    fn plan(&mut self, kind: FetchKind, offset: usize, mode: FetchMode, supersede: bool) -> PlannedFetch {
        if supersede {
            self.generation += 1;
        }
        self.next_seq += 1;
        self.in_flight = Some(self.next_seq);
        self.phase = LoadPhase::Loading;
        PlannedFetch {
            seq: self.next_seq,
            generation: self.generation,
            kind,
            request: FetchRequest {
                count: self.page_size,
                offset,
                archived: Some(self.scope.is_archived()),
                mode,
            },
        }
    }

    /// Plan the next page
    pub fn plan_get_threads(&mut self) -> std::result::Result<PlannedFetch, SkipReason> {
        if self.in_flight.is_some() {
            return Err(SkipReason::AlreadyLoading);
        }
        if self.phase == LoadPhase::Loaded && !self.has_next {
            return Err(SkipReason::NoMorePages);
        }
        let mode = if self.use_cache {
            FetchMode::PreferCache
        } else {
            FetchMode::NetworkOnly
        };
        Ok(self.plan(FetchKind::Page, self.offset, mode, false))
    }

    /// Plan a page only if `anchor` sits near the tail of `order`, so scroll
    /// jitter around the middle of the list doesn't trigger requests
    pub fn plan_load_more(
        &mut self,
        anchor: ConversationId,
        order: &[ConversationId],
    ) -> std::result::Result<PlannedFetch, SkipReason> {
        if !sort_policy::tail_ids(order, self.load_more_threshold).contains(&anchor) {
            return Err(SkipReason::AnchorNotNearTail);
        }
        if !self.has_next {
            return Err(SkipReason::NoMorePages);
        }
        self.plan_get_threads()
    }

    /// Network-only reload of the first page. Caching applies again to the
    /// fetches after this one.
    ///
    /// While a post-connect resync is outstanding the refresh supersedes it
    /// and takes over its work, so the store is still cleared and revalidated.
    pub fn plan_refresh(&mut self) -> PlannedFetch {
        let kind = if self.resync_pending {
            debug!("Refresh takes over pending resync");
            FetchKind::Reconnect
        } else {
            FetchKind::Refresh
        };
        self.plan(kind, 0, FetchMode::NetworkOnly, true)
    }

    /// React to a connection transition; may plan a fetch
    pub fn on_connection_status(
        &mut self,
        status: ConnectionStatus,
        store: &mut ConversationStore,
    ) -> Option<PlannedFetch> {
        let previous = self.connection.replace(status);
        if previous == Some(status) {
            return None;
        }

        match status {
            ConnectionStatus::Disconnected => {
                info!("Connection lost");
                self.pending_reconnect = Some(PendingReconnectState {
                    last_known_pin_ranking: self.pins.clone(),
                    was_disconnected: true,
                });
                if self.received_response {
                    return None;
                }
                info!("No server response yet, reading conversations from cache");
                Some(self.plan(FetchKind::CachedRead, 0, FetchMode::CacheOnly, true))
            }
            ConnectionStatus::Connected => {
                let reconnect = self
                    .pending_reconnect
                    .as_ref()
                    .map_or(false, |p| p.was_disconnected);
                info!(reconnect, "Connected, starting full resync");
                self.scroll_intent = None;
                store.deselect();
                self.trust_next_pin_page = true;
                self.resync_pending = true;
                Some(self.plan(FetchKind::Reconnect, 0, FetchMode::NetworkOnly, true))
            }
        }
    }

    /// Install a finished fetch into the store. The store is left unsorted;
    /// the caller sorts and notifies.
    pub fn complete(
        &mut self,
        planned: &PlannedFetch,
        result: Result<ThreadPage>,
        store: &mut ConversationStore,
    ) -> Result<FetchOutcome> {
        if planned.generation != self.generation || self.in_flight != Some(planned.seq) {
            debug!(
                seq = planned.seq,
                generation = planned.generation,
                current = self.generation,
                "Discarding superseded fetch result"
            );
            return Ok(FetchOutcome::Stale);
        }
        self.in_flight = None;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                // Nothing was touched; fall back to the phase before the fetch
                self.phase = if self.received_response || !store.is_empty() {
                    LoadPhase::Loaded
                } else {
                    LoadPhase::Idle
                };
                warn!(kind = ?planned.kind, "Fetch failed: {}", e);
                return Err(e);
            }
        };

        let pinned_in_page: Vec<ConversationId> =
            page.threads.iter().filter(|t| t.pin).map(|t| t.id).collect();
        let received = page.threads.len();

        match planned.kind {
            FetchKind::Reconnect => {
                // A session refresh may have invalidated everything we hold
                store.clear();
                self.offset = received;
            }
            FetchKind::Refresh | FetchKind::CachedRead => {
                self.offset = self.offset.max(received);
            }
            FetchKind::Page => {
                self.offset += received;
            }
        }
        store.merge(page.threads);
        self.has_next = page.has_next;

        if planned.kind != FetchKind::CachedRead {
            self.received_response = true;
            if self.trust_next_pin_page {
                self.trust_next_pin_page = false;
                if !pinned_in_page.is_empty() {
                    info!(pins = ?pinned_in_page, "Pin ranking replaced from first page");
                    self.pins.replace(pinned_in_page);
                }
            }
        }

        if planned.kind == FetchKind::Reconnect {
            self.resync_pending = false;
            self.revalidate_after_reconnect(store);
        }
        store.repair();

        self.phase = LoadPhase::Loaded;
        self.persist_pins();
        Ok(FetchOutcome::Applied {
            kind: planned.kind,
            received,
            has_next: self.has_next,
        })
    }

    /// Drop ranked ids the refreshed data no longer backs and clear selection
    /// markers left over from before the drop
    fn revalidate_after_reconnect(&mut self, store: &mut ConversationStore) {
        if let Some(pending) = self.pending_reconnect.take() {
            debug!(previous = ?pending.last_known_pin_ranking.ids(), "Revalidating pins after reconnect");
        }
        let dropped = invariants::prune_ranking(&mut self.pins, store.entries());
        if !dropped.is_empty() {
            info!(dropped = ?dropped, "Removed stale ids from pin ranking");
        }
        let cleared = store.clear_selection_markers();
        if !cleared.is_empty() {
            debug!(cleared = ?cleared, "Cleared stale selection markers");
        }
    }
}

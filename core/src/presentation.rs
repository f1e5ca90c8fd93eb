/// Presentation boundary: how the list view learns about changes
use crate::messenger_types::{ConversationId, ConversationSummary};
use std::sync::Mutex;
use tracing::{debug, info};

/// Diff between the previous and the current ordered list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListUpdate {
    /// Full list in display order after the change
    pub snapshot: Vec<ConversationSummary>,
    pub inserted: Vec<ConversationId>,
    pub removed: Vec<ConversationId>,
    pub updated: Vec<ConversationId>,
    /// True when any row that existed before changed position
    pub moved: bool,
}

impl ListUpdate {
    pub fn order(&self) -> Vec<ConversationId> {
        self.snapshot.iter().map(|s| s.id).collect()
    }

    /// Nothing for the view to do
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty() && self.updated.is_empty() && !self.moved
    }
}

/// Receiver of store notifications. Called from the writer task only.
pub trait PresentationDelegate: Send + Sync {
    fn apply(&self, update: &ListUpdate, animate: bool);
    fn reload_item(&self, id: ConversationId);
    fn selection_changed(&self, id: Option<ConversationId>);
    fn unread_count_changed(&self, id: ConversationId, unread_count: u32);
    fn scroll_to_top(&self);
    fn set_loading_indicator(&self, loading: bool);
}

/// Delegate that only logs; used by the replay binary
#[derive(Debug, Default)]
pub struct LogDelegate;

impl PresentationDelegate for LogDelegate {
    fn apply(&self, update: &ListUpdate, animate: bool) {
        info!(
            rows = update.snapshot.len(),
            inserted = update.inserted.len(),
            removed = update.removed.len(),
            updated = update.updated.len(),
            moved = update.moved,
            animate,
            "list updated"
        );
    }

    fn reload_item(&self, id: ConversationId) {
        debug!(id, "reload item");
    }

    fn selection_changed(&self, id: Option<ConversationId>) {
        debug!(?id, "selection changed");
    }

    fn unread_count_changed(&self, id: ConversationId, unread_count: u32) {
        debug!(id, unread_count, "unread count changed");
    }

    fn scroll_to_top(&self) {
        debug!("scroll to top");
    }

    fn set_loading_indicator(&self, loading: bool) {
        debug!(loading, "loading indicator");
    }
}

/// One recorded delegate call
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Apply {
        order: Vec<ConversationId>,
        inserted: Vec<ConversationId>,
        removed: Vec<ConversationId>,
        updated: Vec<ConversationId>,
        moved: bool,
        animate: bool,
    },
    ReloadItem(ConversationId),
    SelectionChanged(Option<ConversationId>),
    UnreadCountChanged(ConversationId, u32),
    ScrollToTop,
    Loading(bool),
}

/// Delegate that remembers every call, for tests and embedders' assertions
#[derive(Debug, Default)]
pub struct RecordingDelegate {
    calls: Mutex<Vec<Notification>>,
}

impl RecordingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, n: Notification) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(n);
        }
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Drain recorded calls
    pub fn take(&self) -> Vec<Notification> {
        self.calls
            .lock()
            .map(|mut c| std::mem::take(&mut *c))
            .unwrap_or_default()
    }

    /// Order carried by the most recent `apply`
    pub fn last_order(&self) -> Option<Vec<ConversationId>> {
        self.notifications().into_iter().rev().find_map(|n| match n {
            Notification::Apply { order, .. } => Some(order),
            _ => None,
        })
    }
}

impl PresentationDelegate for RecordingDelegate {
    fn apply(&self, update: &ListUpdate, animate: bool) {
        self.push(Notification::Apply {
            order: update.order(),
            inserted: update.inserted.clone(),
            removed: update.removed.clone(),
            updated: update.updated.clone(),
            moved: update.moved,
            animate,
        });
    }

    fn reload_item(&self, id: ConversationId) {
        self.push(Notification::ReloadItem(id));
    }

    fn selection_changed(&self, id: Option<ConversationId>) {
        self.push(Notification::SelectionChanged(id));
    }

    fn unread_count_changed(&self, id: ConversationId, unread_count: u32) {
        self.push(Notification::UnreadCountChanged(id, unread_count));
    }

    fn scroll_to_top(&self) {
        self.push(Notification::ScrollToTop);
    }

    fn set_loading_indicator(&self, loading: bool) {
        self.push(Notification::Loading(loading));
    }
}

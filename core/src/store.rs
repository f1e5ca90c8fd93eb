/// Authoritative in-memory conversation list.
///
/// Single writer: every method takes `&mut self` and is only called from the
/// engine task. Each mutation updates fields, recomputes derived fields,
/// re-sorts when ordering inputs changed, and reports a diff to the
/// presentation delegate.
use crate::invariants::{self, Inconsistency};
use crate::messenger_types::{
    ConversationId, ConversationSummary, Message, MessageId, ThreadEvent, UserId,
};
use crate::pin_ranking::PinRanking;
use crate::presentation::{ListUpdate, PresentationDelegate};
use crate::recalc::recalculate;
use crate::sort_policy::{self, SortKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Which conversations a store lists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListScope {
    #[default]
    Active,
    Archived,
}

impl ListScope {
    pub fn is_archived(self) -> bool {
        self == ListScope::Archived
    }
}

/// Background resource attached to a row (e.g. an avatar download).
/// Owned by the store and aborted when the row goes away.
#[derive(Debug)]
pub struct SideCar {
    handle: AbortHandle,
}

impl SideCar {
    pub fn new(handle: AbortHandle) -> Self {
        Self { handle }
    }

    pub fn from_task<T>(task: &tokio::task::JoinHandle<T>) -> Self {
        Self::new(task.abort_handle())
    }

    fn release(self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct PendingChanges {
    inserted: Vec<ConversationId>,
    removed: Vec<ConversationId>,
    updated: Vec<ConversationId>,
}

impl PendingChanges {
    fn mark_inserted(&mut self, id: ConversationId) {
        // Removed and re-added before the view heard about it: just an update
        if self.removed.contains(&id) {
            self.removed.retain(|x| *x != id);
            self.mark_updated(id);
            return;
        }
        if !self.inserted.contains(&id) {
            self.inserted.push(id);
        }
    }

    fn mark_updated(&mut self, id: ConversationId) {
        if !self.inserted.contains(&id) && !self.updated.contains(&id) {
            self.updated.push(id);
        }
    }

    fn mark_removed(&mut self, id: ConversationId) {
        let was_new = self.inserted.contains(&id);
        self.inserted.retain(|x| *x != id);
        self.updated.retain(|x| *x != id);
        if !was_new && !self.removed.contains(&id) {
            self.removed.push(id);
        }
    }

    fn forget_update(&mut self, id: ConversationId) {
        self.updated.retain(|x| *x != id);
    }
}

pub struct ConversationStore {
    viewer_id: UserId,
    scope: ListScope,
    entries: Vec<ConversationSummary>,
    side_cars: HashMap<ConversationId, SideCar>,
    selected: Option<ConversationId>,
    notified_order: Vec<ConversationId>,
    pending: PendingChanges,
    delegate: Arc<dyn PresentationDelegate>,
}

impl ConversationStore {
    pub fn new(viewer_id: UserId, scope: ListScope, delegate: Arc<dyn PresentationDelegate>) -> Self {
        Self {
            viewer_id,
            scope,
            entries: Vec::new(),
            side_cars: HashMap::new(),
            selected: None,
            notified_order: Vec::new(),
            pending: PendingChanges::default(),
            delegate,
        }
    }

    pub fn viewer_id(&self) -> UserId {
        self.viewer_id
    }

    pub fn scope(&self) -> ListScope {
        self.scope
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: ConversationId) -> Option<&ConversationSummary> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn contains(&self, id: ConversationId) -> bool {
        self.position(id).is_some()
    }

    pub fn entries(&self) -> &[ConversationSummary] {
        &self.entries
    }

    /// Current ids in stored order (display order after the last sort)
    pub fn order(&self) -> Vec<ConversationId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub fn selected(&self) -> Option<ConversationId> {
        self.selected
    }

    pub fn has_side_car(&self, id: ConversationId) -> bool {
        self.side_cars.contains_key(&id)
    }

    fn position(&self, id: ConversationId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// Recompute derived fields for one row; a failure keeps the old ones.
    /// Returns whether the displayed fields changed.
    fn refresh_derived(&mut self, idx: usize) -> bool {
        let entry = &mut self.entries[idx];
        match recalculate(entry, self.viewer_id) {
            Ok(derived) if derived != entry.derived => {
                entry.derived = derived;
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(id = entry.id, "Keeping previous display fields: {}", e);
                false
            }
        }
    }

    /// Apply `f` to one row, then recompute its derived fields
    fn update_entry(&mut self, id: ConversationId, f: impl FnOnce(&mut ConversationSummary)) -> bool {
        let Some(idx) = self.position(id) else {
            debug!(id, "Update for unknown conversation ignored");
            return false;
        };
        f(&mut self.entries[idx]);
        self.refresh_derived(idx);
        self.pending.mark_updated(id);
        true
    }

    // ─── Merge & ordering ───────────────────────────────────────────────────

    /// Merge server summaries into the list.
    ///
    /// Known ids are updated in their existing slot so the view keeps its
    /// per-row state; unknown ids are appended. Result is unsorted.
    pub fn merge(&mut self, incoming: Vec<ConversationSummary>) -> &[ConversationSummary] {
        let mut index: HashMap<ConversationId, usize> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id, i))
            .collect();

        for mut summary in incoming {
            let idx = match index.get(&summary.id) {
                Some(&idx) => {
                    self.entries[idx].update_from(&summary);
                    self.pending.mark_updated(summary.id);
                    idx
                }
                None => {
                    summary.is_selected = self.selected == Some(summary.id);
                    let idx = self.entries.len();
                    index.insert(summary.id, idx);
                    self.pending.mark_inserted(summary.id);
                    self.entries.push(summary);
                    idx
                }
            };
            self.refresh_derived(idx);
        }
        &self.entries
    }

    /// Sort rows per `sort_policy`
    pub fn sort(&mut self, ranking: &PinRanking) -> &[ConversationSummary] {
        sort_policy::sort_summaries(&mut self.entries, ranking);
        &self.entries
    }

    /// Keys for an off-writer sort
    pub fn sort_keys(&self) -> Vec<SortKey> {
        self.entries.iter().map(SortKey::of).collect()
    }

    /// Install an order computed elsewhere. Rejected (false) when it no
    /// longer matches the stored ids.
    pub fn install_order(&mut self, order: &[ConversationId]) -> bool {
        if order.len() != self.entries.len() {
            return false;
        }
        let mut slots: HashMap<ConversationId, usize> = HashMap::with_capacity(order.len());
        for (i, id) in order.iter().enumerate() {
            if slots.insert(*id, i).is_some() {
                return false;
            }
        }
        if self.entries.iter().any(|e| !slots.contains_key(&e.id)) {
            return false;
        }
        self.entries.sort_by_key(|e| slots[&e.id]);
        true
    }

    /// Report pending changes to the delegate
    pub fn notify(&mut self, animate: bool) {
        let order = self.order();
        let pending = std::mem::take(&mut self.pending);

        // Relative order of rows present both before and after
        let now: HashSet<ConversationId> = order.iter().copied().collect();
        let before: HashSet<ConversationId> = self.notified_order.iter().copied().collect();
        let old_survivors = self.notified_order.iter().filter(|id| now.contains(id));
        let new_survivors = order.iter().filter(|id| before.contains(id));
        let moved = !old_survivors.eq(new_survivors);

        let update = ListUpdate {
            snapshot: self.entries.clone(),
            inserted: pending.inserted,
            removed: pending.removed,
            updated: pending.updated,
            moved,
        };
        self.notified_order = order;
        if !update.is_empty() {
            self.delegate.apply(&update, animate);
        }
    }

    pub fn sort_and_notify(&mut self, ranking: &PinRanking, animate: bool) {
        self.sort(ranking);
        self.notify(animate);
    }

    // ─── Row lifecycle ──────────────────────────────────────────────────────

    /// Insert one summary (merging if the id is known), sort, notify
    pub fn append(&mut self, summary: ConversationSummary, ranking: &PinRanking) {
        self.merge(vec![summary]);
        self.sort_and_notify(ranking, true);
    }

    /// Remove a row. Selection is cleared first so the view can animate the
    /// deselect before the row disappears; the side-car is released and the
    /// id leaves the pin ranking.
    pub fn remove(&mut self, id: ConversationId, ranking: &mut PinRanking) -> Option<ConversationSummary> {
        let idx = self.position(id)?;
        if self.selected == Some(id) {
            self.deselect();
        }
        let removed = self.entries.remove(idx);
        if let Some(side_car) = self.side_cars.remove(&id) {
            side_car.release();
        }
        ranking.remove(id);
        self.pending.mark_removed(id);
        self.sort_and_notify(ranking, true);
        Some(removed)
    }

    /// Drop every row (full resync). The removals are reported with the next
    /// `notify`, so a clear followed by a merge reaches the view as one diff.
    pub fn clear(&mut self) {
        self.deselect();
        for (_, side_car) in self.side_cars.drain() {
            side_car.release();
        }
        for entry in self.entries.drain(..) {
            self.pending.mark_removed(entry.id);
        }
    }

    /// Attach a background resource to a row; replaces (and releases) any
    /// previous one. Released immediately if the row doesn't exist.
    pub fn attach_side_car(&mut self, id: ConversationId, side_car: SideCar) -> bool {
        if !self.contains(id) {
            side_car.release();
            return false;
        }
        if let Some(old) = self.side_cars.insert(id, side_car) {
            old.release();
        }
        true
    }

    // ─── Selection ──────────────────────────────────────────────────────────

    pub fn select(&mut self, id: ConversationId) -> bool {
        if !self.contains(id) {
            return false;
        }
        if self.selected == Some(id) {
            return true;
        }
        let previous = self.selected.replace(id);
        for entry in &mut self.entries {
            if Some(entry.id) == previous || entry.id == id {
                entry.is_selected = entry.id == id;
            }
        }
        self.delegate.selection_changed(Some(id));
        true
    }

    pub fn deselect(&mut self) {
        if let Some(old) = self.selected.take() {
            if let Some(idx) = self.position(old) {
                self.entries[idx].is_selected = false;
            }
            self.delegate.selection_changed(None);
        }
    }

    /// Clear `is_selected` on rows that aren't the current selection
    pub fn clear_selection_markers(&mut self) -> Vec<ConversationId> {
        let selected = self.selected;
        let mut cleared = Vec::new();
        for entry in &mut self.entries {
            if entry.is_selected && Some(entry.id) != selected {
                entry.is_selected = false;
                cleared.push(entry.id);
            }
        }
        for id in &cleared {
            self.pending.mark_updated(*id);
        }
        cleared
    }

    // ─── Messages & unread counts ───────────────────────────────────────────

    /// Apply one message without re-sorting or notifying. Returns whether the
    /// row is pinned and whether the message counted as unread, or None for an
    /// unknown conversation.
    fn record_message(&mut self, id: ConversationId, message: &Message) -> Option<(bool, bool)> {
        let viewer = self.viewer_id;
        let idx = self.position(id)?;
        let entry = &mut self.entries[idx];

        if message.time > entry.last_activity_time {
            entry.last_activity_time = message.time;
        }
        let from_viewer = message.author_id == viewer;
        if !from_viewer {
            entry.unread_count = entry.unread_count.saturating_add(1);
            if message.mentions.contains(&viewer) {
                entry.mentioned = true;
            }
        }
        if entry.last_message.as_ref().map_or(true, |m| m.id <= message.id) {
            entry.last_message = Some(message.clone());
        }
        let pinned = entry.pin;

        self.refresh_derived(idx);
        self.pending.mark_updated(id);
        Some((pinned, !from_viewer))
    }

    /// Pinned rows keep their ranked slot: they are reloaded in place instead
    /// of re-sorted. The unread count is reported once per update.
    fn finish_message_update(&mut self, id: ConversationId, pinned: bool, counted: bool, ranking: &PinRanking) {
        if counted {
            if let Some(entry) = self.get(id) {
                self.delegate.unread_count_changed(id, entry.unread_count);
            }
        }
        if pinned {
            self.pending.forget_update(id);
            self.delegate.reload_item(id);
        } else {
            self.sort_and_notify(ranking, true);
        }
    }

    pub fn update_on_new_message(&mut self, id: ConversationId, message: &Message, ranking: &PinRanking) -> bool {
        match self.record_message(id, message) {
            Some((pinned, counted)) => {
                self.finish_message_update(id, pinned, counted, ranking);
                true
            }
            None => false,
        }
    }

    /// Apply a flushed batch (ascending ids) with a single sort at the end.
    /// Returns how many messages were applied.
    pub fn apply_message_batch(&mut self, id: ConversationId, messages: &[Message], ranking: &PinRanking) -> usize {
        let mut pinned = None;
        let mut counted = false;
        for message in messages {
            match self.record_message(id, message) {
                Some((p, c)) => {
                    pinned = Some(p);
                    counted |= c;
                }
                None => return 0,
            }
        }
        if let Some(p) = pinned {
            self.finish_message_update(id, p, counted, ranking);
        }
        messages.len()
    }

    /// Server-reported unread counts replace whatever the client computed
    pub fn on_unread_count_sync(&mut self, counts: &HashMap<ConversationId, u32>) -> Vec<ConversationId> {
        let mut ids: Vec<_> = counts.keys().copied().collect();
        ids.sort_unstable();

        let mut changed = Vec::new();
        for id in ids {
            let count = counts[&id];
            let Some(idx) = self.position(id) else { continue };
            let entry = &mut self.entries[idx];
            if entry.unread_count != count {
                entry.unread_count = count;
                if count == 0 {
                    entry.mentioned = false;
                }
                if self.refresh_derived(idx) {
                    self.delegate.reload_item(id);
                }
                self.delegate.unread_count_changed(id, count);
                changed.push(id);
            }
        }
        changed
    }

    /// Apply a seen-pointer update only if it doesn't raise the unread count.
    /// A stale lower count racing a newer message must not win, and timestamps
    /// can't arbitrate that across devices, so the guard is monotonicity.
    pub fn on_last_seen_updated(
        &mut self,
        id: ConversationId,
        seen_time: DateTime<Utc>,
        seen_message_id: MessageId,
        unread_count: u32,
    ) -> bool {
        let Some(idx) = self.position(id) else {
            return false;
        };
        let entry = &mut self.entries[idx];
        if unread_count > entry.unread_count {
            debug!(
                id,
                current = entry.unread_count,
                reported = unread_count,
                "Ignoring seen update that would raise unread count"
            );
            return false;
        }
        entry.unread_count = unread_count;
        entry.last_seen_time = Some(seen_time);
        entry.last_seen_message_id = Some(seen_message_id);
        if unread_count == 0 {
            entry.mentioned = false;
        }
        if self.refresh_derived(idx) {
            self.delegate.reload_item(id);
        }
        self.delegate.unread_count_changed(id, unread_count);
        true
    }

    // ─── Event dispatch ─────────────────────────────────────────────────────

    /// Apply one thread event. Returns whether the store changed.
    pub fn apply(&mut self, event: ThreadEvent, ranking: &mut PinRanking) -> bool {
        debug!(event = event.name(), id = ?event.conversation_id(), "Applying thread event");
        let scope = self.scope;
        match event {
            ThreadEvent::New { summary } => {
                if summary.is_archived != scope.is_archived() {
                    debug!(id = summary.id, "New conversation outside list scope");
                    return false;
                }
                let (id, pin) = (summary.id, summary.pin);
                self.merge(vec![summary]);
                if pin {
                    ranking.append(id);
                }
                self.sort_and_notify(ranking, true);
                true
            }
            ThreadEvent::Deleted { id, reason } => {
                debug!(id, ?reason, "Conversation removed by server");
                self.remove(id, ranking).is_some()
            }
            ThreadEvent::Pin { id } => {
                if !self.update_entry(id, |e| e.pin = true) {
                    return false;
                }
                ranking.append(id);
                self.sort_and_notify(ranking, true);
                true
            }
            ThreadEvent::Unpin { id } => {
                ranking.remove(id);
                if !self.update_entry(id, |e| e.pin = false) {
                    return false;
                }
                self.sort_and_notify(ranking, true);
                true
            }
            ThreadEvent::Mute { id } => self.update_and_notify(id, |e| e.mute = true),
            ThreadEvent::Unmute { id } => self.update_and_notify(id, |e| e.mute = false),
            ThreadEvent::Closed { id } => self.update_and_notify(id, |e| e.closed = true),
            ThreadEvent::Archive { id } => match scope {
                ListScope::Active => self.remove(id, ranking).is_some(),
                ListScope::Archived => self.update_and_notify(id, |e| e.is_archived = true),
            },
            ThreadEvent::Unarchive { id } => match scope {
                ListScope::Archived => self.remove(id, ranking).is_some(),
                ListScope::Active => self.update_and_notify(id, |e| e.is_archived = false),
            },
            ThreadEvent::UpdatedInfo { id, title, metadata } => self.update_and_notify(id, |e| {
                if title.is_some() {
                    e.title = title;
                }
                if metadata.is_some() {
                    e.metadata = metadata;
                }
            }),
            ThreadEvent::LastSeenUpdated {
                id,
                seen_time,
                seen_message_id,
                unread_count,
            } => self.on_last_seen_updated(id, seen_time, seen_message_id, unread_count),
            ThreadEvent::UnreadCount { counts } => !self.on_unread_count_sync(&counts).is_empty(),
            ThreadEvent::ParticipantAdded { id, participants } => self.update_and_notify(id, |e| {
                for p in participants {
                    match e.participants.iter_mut().find(|x| x.id == p.id) {
                        Some(existing) => *existing = p,
                        None => e.participants.push(p),
                    }
                }
            }),
            ThreadEvent::ParticipantRemoved { id, participant_ids } => {
                if participant_ids.contains(&self.viewer_id) {
                    debug!(id, "Viewer left conversation");
                    return self.remove(id, ranking).is_some();
                }
                self.update_and_notify(id, |e| e.participants.retain(|p| !participant_ids.contains(&p.id)))
            }
        }
    }

    fn update_and_notify(&mut self, id: ConversationId, f: impl FnOnce(&mut ConversationSummary)) -> bool {
        if !self.update_entry(id, f) {
            return false;
        }
        self.notify(false);
        true
    }

    // ─── Consistency ────────────────────────────────────────────────────────

    pub fn check(&self, ranking: &PinRanking) -> Vec<Inconsistency> {
        invariants::check(&self.entries, ranking, self.selected)
    }

    /// Coalesce duplicate ids and stale selection markers
    pub fn repair(&mut self) -> Vec<ConversationId> {
        let coalesced = invariants::coalesce_duplicates(&mut self.entries);
        for id in &coalesced {
            warn!(id, "Coalesced duplicate conversation id");
            if let Some(idx) = self.position(*id) {
                self.refresh_derived(idx);
            }
        }
        self.clear_selection_markers();
        coalesced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger_types::{Participant, StatusIcon};
    use crate::presentation::{Notification, RecordingDelegate};
    use chrono::TimeZone;

    const VIEWER: UserId = 100;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn summary(id: ConversationId, pin: bool, secs: i64) -> ConversationSummary {
        let mut s = ConversationSummary::new(id, ts(secs));
        s.pin = pin;
        s
    }

    fn message(id: MessageId, author: UserId, secs: i64) -> Message {
        Message {
            id,
            author_id: author,
            text: format!("msg {}", id),
            time: ts(secs),
            mentions: vec![],
        }
    }

    fn store() -> (ConversationStore, Arc<RecordingDelegate>) {
        let delegate = Arc::new(RecordingDelegate::new());
        let store = ConversationStore::new(VIEWER, ListScope::Active, delegate.clone());
        (store, delegate)
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (mut store, _) = store();
        let mut a = summary(1, false, 10);
        a.unread_count = 3;
        store.merge(vec![a.clone(), summary(2, false, 20)]);
        let once: Vec<_> = store.entries().to_vec();

        store.merge(vec![a]);
        assert_eq!(store.entries(), &once[..]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_merge_updates_in_place_and_keeps_selection() {
        let (mut store, _) = store();
        store.merge(vec![summary(1, false, 10), summary(2, false, 20)]);
        assert!(store.select(1));

        let mut newer = summary(1, false, 99);
        newer.unread_count = 4;
        store.merge(vec![newer]);

        assert_eq!(store.order(), vec![1, 2]);
        let row = store.get(1).unwrap();
        assert!(row.is_selected);
        assert_eq!(row.unread_count, 4);
        assert_eq!(row.last_activity_time, ts(99));
    }

    #[test]
    fn test_merge_coalesces_duplicates_in_one_page() {
        let (mut store, _) = store();
        let mut later = summary(3, false, 50);
        later.unread_count = 7;
        store.merge(vec![summary(3, false, 10), later]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(3).unwrap().unread_count, 7);
    }

    #[test]
    fn test_sort_scenarios() {
        let (mut store, _) = store();
        let mut ranking = PinRanking::default();
        store.merge(vec![summary(5, false, 100), summary(7, false, 200)]);
        store.sort(&ranking);
        assert_eq!(store.order(), vec![7, 5]);

        store.apply(ThreadEvent::Pin { id: 5 }, &mut ranking);
        assert_eq!(ranking.ids(), &[5]);
        assert_eq!(store.order(), vec![5, 7]);

        store.sort(&ranking);
        assert_eq!(store.order(), vec![5, 7]);
    }

    #[test]
    fn test_remove_clears_selection_before_removal() {
        let (mut store, delegate) = store();
        let mut ranking = PinRanking::new([1]);
        store.merge(vec![summary(1, true, 10), summary(2, false, 20)]);
        store.sort_and_notify(&ranking, false);
        store.select(1);
        delegate.take();

        let removed = store.remove(1, &mut ranking);
        assert!(removed.is_some());
        assert!(ranking.is_empty());
        assert_eq!(store.selected(), None);

        let calls = delegate.take();
        assert_eq!(calls[0], Notification::SelectionChanged(None));
        match &calls[1] {
            Notification::Apply { order, removed, .. } => {
                assert_eq!(order, &vec![2]);
                assert_eq!(removed, &vec![1]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remove_releases_side_car() {
        let (mut store, _) = store();
        let mut ranking = PinRanking::default();
        store.merge(vec![summary(1, false, 10)]);

        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        assert!(store.attach_side_car(1, SideCar::from_task(&task)));
        assert!(store.has_side_car(1));

        store.remove(1, &mut ranking);
        assert!(!store.has_side_car(1));
        let err = task.await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_new_message_bumps_and_resorts_unpinned() {
        let (mut store, delegate) = store();
        let ranking = PinRanking::default();
        store.merge(vec![summary(1, false, 10), summary(2, false, 20)]);
        store.sort_and_notify(&ranking, false);

        assert!(store.update_on_new_message(1, &message(50, 200, 30), &ranking));
        assert_eq!(store.order(), vec![1, 2]);
        assert_eq!(store.get(1).unwrap().unread_count, 1);
        assert_eq!(store.get(1).unwrap().last_activity_time, ts(30));
        assert_eq!(delegate.last_order(), Some(vec![1, 2]));

        // Own messages don't count as unread
        store.update_on_new_message(2, &message(51, VIEWER, 40), &ranking);
        assert_eq!(store.get(2).unwrap().unread_count, 0);
        assert_eq!(store.order(), vec![2, 1]);
    }

    #[test]
    fn test_new_message_on_pinned_reloads_without_resort() {
        let (mut store, delegate) = store();
        let ranking = PinRanking::new([1, 2]);
        store.merge(vec![summary(1, true, 10), summary(2, true, 20)]);
        store.sort_and_notify(&ranking, false);
        delegate.take();

        store.update_on_new_message(2, &message(9, 200, 500), &ranking);
        assert_eq!(store.order(), vec![1, 2]);
        let calls = delegate.take();
        assert!(calls.contains(&Notification::ReloadItem(2)));
        assert!(!calls.iter().any(|c| matches!(c, Notification::Apply { .. })));
    }

    #[test]
    fn test_mention_sets_flag() {
        let (mut store, _) = store();
        let ranking = PinRanking::default();
        store.merge(vec![summary(1, false, 10)]);
        let mut m = message(1, 200, 20);
        m.mentions = vec![VIEWER];
        store.update_on_new_message(1, &m, &ranking);
        assert!(store.get(1).unwrap().mentioned);
    }

    #[test]
    fn test_unread_sync_server_wins() {
        let (mut store, _) = store();
        let ranking = PinRanking::default();
        store.merge(vec![summary(1, false, 10), summary(2, false, 10)]);
        for i in 0..5 {
            store.update_on_new_message(1, &message(i, 200, 20), &ranking);
        }
        assert_eq!(store.get(1).unwrap().unread_count, 5);

        let counts = HashMap::from([(1, 2), (2, 0), (42, 9)]);
        let changed = store.on_unread_count_sync(&counts);
        assert_eq!(changed, vec![1]);
        assert_eq!(store.get(1).unwrap().unread_count, 2);
    }

    #[test]
    fn test_last_seen_never_increases_unread() {
        let (mut store, _) = store();
        let mut s = summary(1, false, 10);
        s.unread_count = 3;
        store.merge(vec![s]);

        assert!(!store.on_last_seen_updated(1, ts(20), 7, 4));
        assert_eq!(store.get(1).unwrap().unread_count, 3);
        assert_eq!(store.get(1).unwrap().last_seen_message_id, None);

        assert!(store.on_last_seen_updated(1, ts(20), 7, 1));
        assert_eq!(store.get(1).unwrap().unread_count, 1);
        assert_eq!(store.get(1).unwrap().last_seen_message_id, Some(7));

        for reported in 0..10 {
            let before = store.get(1).unwrap().unread_count;
            store.on_last_seen_updated(1, ts(30), 8, reported);
            assert!(store.get(1).unwrap().unread_count <= before);
        }
    }

    #[test]
    fn test_batch_reports_unread_count_once() {
        let (mut store, delegate) = store();
        let ranking = PinRanking::default();
        store.merge(vec![summary(1, false, 10), summary(2, false, 20)]);
        store.sort_and_notify(&ranking, false);
        delegate.take();

        let burst: Vec<_> = (1..=50).map(|i| message(i, 200, 20 + i as i64)).collect();
        assert_eq!(store.apply_message_batch(1, &burst, &ranking), 50);

        let unread: Vec<_> = delegate
            .take()
            .into_iter()
            .filter(|c| matches!(c, Notification::UnreadCountChanged(..)))
            .collect();
        assert_eq!(unread, vec![Notification::UnreadCountChanged(1, 50)]);

        store.apply_message_batch(2, &[message(60, VIEWER, 90)], &ranking);
        assert!(!delegate
            .take()
            .iter()
            .any(|c| matches!(c, Notification::UnreadCountChanged(..))));
    }

    #[test]
    fn test_read_state_clearing_mention_reloads_row() {
        let (mut store, delegate) = store();
        let ranking = PinRanking::default();
        store.merge(vec![summary(1, false, 10), summary(2, false, 10)]);
        for id in [1, 2] {
            let mut m = message(id, 200, 20);
            m.mentions = vec![VIEWER];
            store.update_on_new_message(id, &m, &ranking);
        }
        assert_eq!(store.get(1).unwrap().derived.status_icon, StatusIcon::Mentioned);
        delegate.take();

        store.on_unread_count_sync(&HashMap::from([(1, 0)]));
        assert_eq!(store.get(1).unwrap().derived.status_icon, StatusIcon::None);
        assert!(delegate.take().contains(&Notification::ReloadItem(1)));

        assert!(store.on_last_seen_updated(2, ts(30), 2, 0));
        assert_eq!(store.get(2).unwrap().derived.status_icon, StatusIcon::None);
        assert!(delegate.take().contains(&Notification::ReloadItem(2)));

        // Nothing displayed changes, nothing to reload
        store.on_unread_count_sync(&HashMap::from([(1, 0)]));
        assert!(!delegate.take().contains(&Notification::ReloadItem(1)));
    }

    #[test]
    fn test_malformed_metadata_keeps_previous_display() {
        let (mut store, _) = store();
        let mut ranking = PinRanking::default();
        let mut s = summary(1, false, 10);
        s.title = Some("Design".to_string());
        store.merge(vec![s, summary(2, false, 20)]);
        let before = store.get(1).unwrap().derived.clone();
        assert_eq!(before.title, "Design");

        let changed = store.apply(
            ThreadEvent::UpdatedInfo {
                id: 1,
                title: Some("Renamed".to_string()),
                metadata: Some("{oops".to_string()),
            },
            &mut ranking,
        );
        assert!(changed);
        assert_eq!(store.get(1).unwrap().title.as_deref(), Some("Renamed"));
        assert_eq!(store.get(1).unwrap().derived, before);
        assert_eq!(store.get(2).unwrap().derived.title, "Conversation 2");
    }

    #[test]
    fn test_archive_moves_out_of_active_scope() {
        let (mut store, _) = store();
        let mut ranking = PinRanking::default();
        store.merge(vec![summary(1, false, 10), summary(2, false, 20)]);
        assert!(store.apply(ThreadEvent::Archive { id: 1 }, &mut ranking));
        assert_eq!(store.order(), vec![2]);
        // Unarchive of an unloaded conversation is a no-op here
        assert!(!store.apply(ThreadEvent::Unarchive { id: 1 }, &mut ranking));
    }

    #[test]
    fn test_viewer_leaving_removes_conversation() {
        let (mut store, _) = store();
        let mut ranking = PinRanking::default();
        let mut s = summary(1, false, 10);
        s.kind = crate::messenger_types::ConversationKind::Group;
        s.participants = vec![
            Participant { id: VIEWER, name: "me".into(), avatar_url: None },
            Participant { id: 200, name: "Bob".into(), avatar_url: None },
        ];
        store.merge(vec![s]);

        store.apply(ThreadEvent::ParticipantRemoved { id: 1, participant_ids: vec![200] }, &mut ranking);
        assert_eq!(store.get(1).unwrap().participants.len(), 1);

        store.apply(ThreadEvent::ParticipantRemoved { id: 1, participant_ids: vec![VIEWER] }, &mut ranking);
        assert!(store.is_empty());
    }

    #[test]
    fn test_unpin_drops_ranking_and_resorts() {
        let (mut store, _) = store();
        let mut ranking = PinRanking::new([5]);
        store.merge(vec![summary(5, true, 100), summary(7, false, 200)]);
        store.sort(&ranking);
        assert_eq!(store.order(), vec![5, 7]);

        store.apply(ThreadEvent::Unpin { id: 5 }, &mut ranking);
        assert!(ranking.is_empty());
        assert_eq!(store.order(), vec![7, 5]);
    }

    #[test]
    fn test_install_order_rejects_stale() {
        let (mut store, _) = store();
        store.merge(vec![summary(1, false, 10), summary(2, false, 20)]);
        assert!(!store.install_order(&[2]));
        assert!(!store.install_order(&[2, 3]));
        assert!(store.install_order(&[2, 1]));
        assert_eq!(store.order(), vec![2, 1]);
    }

    #[test]
    fn test_notify_reports_moves() {
        let (mut store, delegate) = store();
        let ranking = PinRanking::default();
        store.merge(vec![summary(1, false, 10), summary(2, false, 20)]);
        store.sort_and_notify(&ranking, false);
        delegate.take();

        store.update_on_new_message(1, &message(1, 200, 30), &ranking);
        match delegate.take().last() {
            Some(Notification::Apply { moved, updated, .. }) => {
                assert!(*moved);
                assert_eq!(updated, &vec![1]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_clear_releases_everything() {
        let (mut store, delegate) = store();
        store.merge(vec![summary(1, false, 10), summary(2, false, 20)]);
        store.sort_and_notify(&PinRanking::default(), false);
        store.select(2);
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.selected(), None);

        // Clear then re-merge reaches the view as one diff
        store.merge(vec![summary(2, false, 20), summary(3, false, 30)]);
        delegate.take();
        store.sort_and_notify(&PinRanking::default(), false);
        match delegate.take().as_slice() {
            [Notification::Apply { order, inserted, removed, updated, .. }] => {
                assert_eq!(order, &vec![3, 2]);
                assert_eq!(inserted, &vec![3]);
                assert_eq!(removed, &vec![1]);
                assert_eq!(updated, &vec![2]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

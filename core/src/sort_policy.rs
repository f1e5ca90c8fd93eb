/// Total order over conversations: pin flag, server pin ranking, recency
use crate::messenger_types::{ConversationId, ConversationSummary};
use crate::pin_ranking::PinRanking;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;

/// The fields ordering depends on, detached from the summary so a sort can
/// run over an immutable snapshot off the writer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub id: ConversationId,
    pub pin: bool,
    pub last_activity_time: DateTime<Utc>,
}

impl SortKey {
    pub fn of(summary: &ConversationSummary) -> Self {
        Self {
            id: summary.id,
            pin: summary.pin,
            last_activity_time: summary.last_activity_time,
        }
    }
}

/// Position of every ranked id, for O(1) lookups while sorting
pub fn rank_index(ranking: &PinRanking) -> HashMap<ConversationId, usize> {
    ranking
        .ids()
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect()
}

/// Compare two rows.
///
/// Pinned rows come first. Among pinned rows, ranked ones precede unranked
/// ones and follow the ranking index. Everything else falls back to
/// `last_activity_time` descending, then id descending so equal timestamps
/// never swap between runs.
pub fn compare(a: &SortKey, b: &SortKey, ranks: &HashMap<ConversationId, usize>) -> Ordering {
    let rank = |k: &SortKey| if k.pin { ranks.get(&k.id).copied() } else { None };

    b.pin
        .cmp(&a.pin)
        .then_with(|| match (rank(a), rank(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            // Ranked before unranked even when the unranked row is newer.
            // Falling back to time for mixed pairs would not be transitive.
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| b.last_activity_time.cmp(&a.last_activity_time))
        .then_with(|| b.id.cmp(&a.id))
}

/// Sort summaries in place
pub fn sort_summaries(items: &mut [ConversationSummary], ranking: &PinRanking) {
    let ranks = rank_index(ranking);
    items.sort_by(|a, b| compare(&SortKey::of(a), &SortKey::of(b), &ranks));
}

/// Ordered ids for a key snapshot. Pure; safe to run on a blocking thread.
pub fn order_of(mut keys: Vec<SortKey>, ranking: &PinRanking) -> Vec<ConversationId> {
    let ranks = rank_index(ranking);
    keys.sort_by(|a, b| compare(a, b, &ranks));
    keys.into_iter().map(|k| k.id).collect()
}

/// The last `n` ids of an ordered list (the pagination trigger zone)
pub fn tail_ids(order: &[ConversationId], n: usize) -> &[ConversationId] {
    let start = order.len().saturating_sub(n);
    &order[start..]
}

/// Consistency checks over the store and the pin ranking.
/// Violations are repaired locally and never propagate.
use crate::messenger_types::{ConversationId, ConversationSummary};
use crate::pin_ranking::PinRanking;
use std::collections::HashMap;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inconsistency {
    /// Same id stored more than once
    DuplicateId(ConversationId),
    /// Ranked id with no row in the store
    RankedButAbsent(ConversationId),
    /// Ranked id whose row is no longer pinned
    RankedButUnpinned(ConversationId),
    /// Row flagged selected while the store's selection points elsewhere
    StaleSelectionMarker(ConversationId),
}

/// Report every inconsistency without changing anything
pub fn check(
    entries: &[ConversationSummary],
    ranking: &PinRanking,
    selected: Option<ConversationId>,
) -> Vec<Inconsistency> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    let mut pinned: HashMap<ConversationId, bool> = HashMap::new();

    for entry in entries {
        if !seen.insert(entry.id) {
            found.push(Inconsistency::DuplicateId(entry.id));
        }
        pinned.insert(entry.id, entry.pin);
        if entry.is_selected && selected != Some(entry.id) {
            found.push(Inconsistency::StaleSelectionMarker(entry.id));
        }
    }

    for id in ranking.ids() {
        match pinned.get(id) {
            None => found.push(Inconsistency::RankedButAbsent(*id)),
            Some(false) => found.push(Inconsistency::RankedButUnpinned(*id)),
            Some(true) => {}
        }
    }
    found
}

/// Collapse duplicate ids into their first slot; later copies win on fields.
/// Returns the ids that were coalesced.
pub fn coalesce_duplicates(entries: &mut Vec<ConversationSummary>) -> Vec<ConversationId> {
    let mut first_slot: HashMap<ConversationId, usize> = HashMap::new();
    let mut coalesced = Vec::new();
    let mut kept: Vec<ConversationSummary> = Vec::with_capacity(entries.len());

    for entry in entries.drain(..) {
        match first_slot.get(&entry.id) {
            Some(&slot) => {
                kept[slot].update_from(&entry);
                kept[slot].is_selected |= entry.is_selected;
                if !coalesced.contains(&entry.id) {
                    coalesced.push(entry.id);
                }
            }
            None => {
                first_slot.insert(entry.id, kept.len());
                kept.push(entry);
            }
        }
    }
    *entries = kept;
    coalesced
}

/// Drop ranking ids that are absent from the store or no longer pinned
pub fn prune_ranking(ranking: &mut PinRanking, entries: &[ConversationSummary]) -> Vec<ConversationId> {
    let pinned: HashSet<ConversationId> = entries.iter().filter(|e| e.pin).map(|e| e.id).collect();
    ranking.retain(|id| pinned.contains(&id))
}

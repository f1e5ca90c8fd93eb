/// Server-authoritative ordering among pinned conversations
use crate::messenger_types::ConversationId;
use serde::{Deserialize, Serialize};

/// Ordered, duplicate-free list of pinned conversation ids.
///
/// Replaced wholesale from the first page after a (re)connect, otherwise only
/// appended to or removed from as pin events arrive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRanking {
    ids: Vec<ConversationId>,
}

impl PinRanking {
    pub fn new(ids: impl IntoIterator<Item = ConversationId>) -> Self {
        let mut ranking = Self::default();
        ranking.replace(ids);
        ranking
    }

    pub fn ids(&self) -> &[ConversationId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: ConversationId) -> bool {
        self.ids.contains(&id)
    }

    /// Append at the end; returns false if already ranked
    pub fn append(&mut self, id: ConversationId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    /// Returns false if the id wasn't ranked
    pub fn remove(&mut self, id: ConversationId) -> bool {
        let before = self.ids.len();
        self.ids.retain(|x| *x != id);
        self.ids.len() != before
    }

    /// Replace the whole ranking, keeping the first occurrence of repeated ids
    pub fn replace(&mut self, ids: impl IntoIterator<Item = ConversationId>) {
        self.ids.clear();
        for id in ids {
            if !self.ids.contains(&id) {
                self.ids.push(id);
            }
        }
    }

    /// Keep only ids matching `keep`; returns what was dropped
    pub fn retain(&mut self, mut keep: impl FnMut(ConversationId) -> bool) -> Vec<ConversationId> {
        let mut dropped = Vec::new();
        self.ids.retain(|id| {
            let k = keep(*id);
            if !k {
                dropped.push(*id);
            }
            k
        });
        dropped
    }
}

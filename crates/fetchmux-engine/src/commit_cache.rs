//! Commit cache: which items each commit touched.
//!
//! Built incrementally as chunks are fetched; history/audit views read it to
//! answer "what belongs to commit N" without re-querying the store.  Rows of
//! the commit type itself are skipped (a commit row does not belong to its
//! own commit).

use std::collections::{BTreeMap, HashMap};

use fetchmux_core::{CommitId, Item, ItemId, ItemType};

use crate::store::COMMIT_ITEM_TYPE;

#[derive(Default)]
pub struct CommitCache {
    by_commit: BTreeMap<CommitId, HashMap<ItemType, Vec<ItemId>>>,
}

impl CommitCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly fetched chunk.
    pub fn record_chunk(&mut self, item_type: &ItemType, items: &[Item]) {
        if &**item_type == COMMIT_ITEM_TYPE {
            return;
        }
        for item in items {
            let Some(commit_id) = item.commit_id else {
                continue;
            };
            self.by_commit
                .entry(commit_id)
                .or_default()
                .entry(item_type.clone())
                .or_default()
                .push(item.id);
        }
    }

    /// Ids of `item_type` touched by `commit_id`, in fetch order.
    #[must_use]
    pub fn ids_for(&self, commit_id: CommitId, item_type: &ItemType) -> &[ItemId] {
        self.by_commit
            .get(&commit_id)
            .and_then(|types| types.get(item_type))
            .map_or(&[], Vec::as_slice)
    }

    /// Commits seen so far, ascending.
    #[must_use]
    pub fn commits(&self) -> Vec<CommitId> {
        self.by_commit.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.by_commit.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> ItemType {
        ItemType::new("entity")
    }

    #[test]
    fn records_ids_grouped_by_commit_and_type() {
        let mut cache = CommitCache::new();
        let chunk = vec![
            Item::new(ItemId(1)).with_commit(CommitId(1)),
            Item::new(ItemId(2)).with_commit(CommitId(2)),
            Item::new(ItemId(3)), // uncommitted, skipped
            Item::new(ItemId(4)).with_commit(CommitId(1)),
        ];
        cache.record_chunk(&entity(), &chunk);

        assert_eq!(cache.ids_for(CommitId(1), &entity()), &[ItemId(1), ItemId(4)]);
        assert_eq!(cache.ids_for(CommitId(2), &entity()), &[ItemId(2)]);
        assert_eq!(cache.commits(), vec![CommitId(1), CommitId(2)]);
    }

    #[test]
    fn commit_rows_themselves_are_skipped() {
        let mut cache = CommitCache::new();
        let commit_type = ItemType::new(COMMIT_ITEM_TYPE);
        cache.record_chunk(
            &commit_type,
            &[Item::new(ItemId(1)).with_commit(CommitId(1))],
        );
        assert!(cache.commits().is_empty());
    }

    #[test]
    fn unknown_lookups_are_empty() {
        let cache = CommitCache::new();
        assert!(cache.ids_for(CommitId(9), &entity()).is_empty());
    }
}

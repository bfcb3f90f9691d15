//! Mutation subscription registry.
//!
//! When a cache entry is first delivered to a parent, the pair is *bound*:
//! later update/remove/restore mutations of that entry are propagated to the
//! parent without a re-fetch.  The bindings live here, keyed by
//! `(item_type, item_id)`, instead of as callback lists inside the items
//! themselves — parents are held by `Weak`, so discarding a consumer never
//! requires touching every bound entry.
//!
//! Binding is idempotent per (entry, parent).  Firing a callback on a dead
//! or obsolete parent is a silent no-op that also unbinds it (self-pruning).

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use smallvec::SmallVec;
use tracing::trace;

use fetchmux_core::{Item, ItemId, ItemType};

use crate::parent::{FetchContext, FetchParent, ParentKey, parent_key};

/// Which mutation a firing propagates.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MutationKind {
    /// Re-adds an item that was previously removed.
    Restore,
    /// Pushes field changes.
    Update,
    /// Detaches the item.
    Remove,
}

struct Binding {
    key: ParentKey,
    parent: Weak<dyn FetchParent>,
}

/// Most entries are watched by one or two parents.
type Bindings = SmallVec<[Binding; 2]>;

#[derive(Default)]
pub struct SubscriptionRegistry {
    by_entry: HashMap<(ItemType, ItemId), Bindings>,
    /// Reverse index for `drop_parent`.
    by_parent: HashMap<ParentKey, Vec<(ItemType, ItemId)>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `parent` to the cache entry `(item_type, id)`.  A parent is
    /// bound to a given entry at most once; rebinding is a no-op.
    pub fn bind(&mut self, item_type: &ItemType, id: ItemId, parent: &Arc<dyn FetchParent>) {
        let key = parent_key(parent);
        let bindings = self.by_entry.entry((item_type.clone(), id)).or_default();
        if bindings.iter().any(|binding| binding.key == key) {
            return;
        }
        bindings.push(Binding {
            key,
            parent: Arc::downgrade(parent),
        });
        self.by_parent
            .entry(key)
            .or_default()
            .push((item_type.clone(), id));
        trace!(%item_type, %id, "bound parent to cache entry");
    }

    /// Propagate one mutation of `(item_type, item.id)` to every live bound
    /// parent.  Dead and obsolete parents are pruned on the way.
    pub fn fire(
        &mut self,
        item_type: &ItemType,
        item: &Item,
        kind: MutationKind,
        ctx: &FetchContext<'_>,
    ) {
        let entry_key = (item_type.clone(), item.id);
        let Some(bindings) = self.by_entry.get_mut(&entry_key) else {
            return;
        };
        let mut pruned: Vec<ParentKey> = Vec::new();
        bindings.retain(|binding| {
            let Some(parent) = binding.parent.upgrade() else {
                pruned.push(binding.key);
                return false;
            };
            if parent.is_obsolete() {
                pruned.push(binding.key);
                return false;
            }
            match kind {
                MutationKind::Restore => parent.add_item(item, ctx),
                MutationKind::Update => parent.update_item(item, ctx),
                MutationKind::Remove => parent.remove_item(item, ctx),
            }
            true
        });
        if bindings.is_empty() {
            self.by_entry.remove(&entry_key);
        }
        for key in pruned {
            if let Some(entries) = self.by_parent.get_mut(&key) {
                entries.retain(|entry| *entry != entry_key);
                if entries.is_empty() {
                    self.by_parent.remove(&key);
                }
            }
        }
    }

    /// Drop every binding of `parent` (epoch reset or obsolete purge).
    pub fn drop_parent(&mut self, key: ParentKey) {
        let Some(entries) = self.by_parent.remove(&key) else {
            return;
        };
        for entry_key in entries {
            if let Some(bindings) = self.by_entry.get_mut(&entry_key) {
                bindings.retain(|binding| binding.key != key);
                if bindings.is_empty() {
                    self.by_entry.remove(&entry_key);
                }
            }
        }
    }

    /// Number of live (entry, parent) bindings.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.by_entry.values().map(SmallVec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ConnectionId;
    use crate::memstore::MemoryStore;
    use crate::parent::{ChunkSize, ListParent};
    use crate::store::BackingStore;
    use fetchmux_core::ItemId;

    fn entity() -> ItemType {
        ItemType::new("entity")
    }

    fn ctx_pieces() -> (ConnectionId, MemoryStore) {
        (ConnectionId::next(), MemoryStore::new())
    }

    fn item(id: u64) -> Item {
        Item::new(ItemId(id)).with_field("name", format!("e{id}").as_str())
    }

    #[test]
    fn bind_is_idempotent_per_entry_and_parent() {
        let mut registry = SubscriptionRegistry::new();
        let parent: Arc<dyn FetchParent> =
            Arc::new(ListParent::new(entity(), ChunkSize::Default));
        registry.bind(&entity(), ItemId(1), &parent);
        registry.bind(&entity(), ItemId(1), &parent);
        registry.bind(&entity(), ItemId(2), &parent);
        assert_eq!(registry.binding_count(), 2);
    }

    #[test]
    fn fire_delivers_each_mutation_kind() {
        let mut registry = SubscriptionRegistry::new();
        let list = Arc::new(ListParent::new(entity(), ChunkSize::Default));
        let parent: Arc<dyn FetchParent> = list.clone();
        let (connection, store) = ctx_pieces();
        let ctx = FetchContext {
            connection,
            store: &store as &dyn BackingStore,
        };

        registry.bind(&entity(), ItemId(1), &parent);
        registry.fire(&entity(), &item(1), MutationKind::Restore, &ctx);
        assert_eq!(list.len(), 1);

        let updated = item(1).with_field("color", "blue");
        registry.fire(&entity(), &updated, MutationKind::Update, &ctx);
        assert_eq!(
            list.items()[0].field("color"),
            Some(&serde_json::json!("blue"))
        );

        registry.fire(&entity(), &item(1), MutationKind::Remove, &ctx);
        assert!(list.is_empty());
        // Binding survives a remove; restore may follow.
        assert_eq!(registry.binding_count(), 1);
    }

    #[test]
    fn obsolete_parent_self_prunes_on_fire() {
        let mut registry = SubscriptionRegistry::new();
        let list = Arc::new(ListParent::new(entity(), ChunkSize::Default));
        let parent: Arc<dyn FetchParent> = list.clone();
        let (connection, store) = ctx_pieces();
        let ctx = FetchContext {
            connection,
            store: &store as &dyn BackingStore,
        };

        registry.bind(&entity(), ItemId(1), &parent);
        list.mark_obsolete();
        registry.fire(&entity(), &item(1), MutationKind::Update, &ctx);
        assert_eq!(registry.binding_count(), 0);
        assert!(list.is_empty());
    }

    #[test]
    fn dropped_parent_self_prunes_on_fire() {
        let mut registry = SubscriptionRegistry::new();
        let (connection, store) = ctx_pieces();
        let ctx = FetchContext {
            connection,
            store: &store as &dyn BackingStore,
        };
        {
            let parent: Arc<dyn FetchParent> =
                Arc::new(ListParent::new(entity(), ChunkSize::Default));
            registry.bind(&entity(), ItemId(1), &parent);
        }
        registry.fire(&entity(), &item(1), MutationKind::Update, &ctx);
        assert_eq!(registry.binding_count(), 0);
    }

    #[test]
    fn drop_parent_clears_all_bindings() {
        let mut registry = SubscriptionRegistry::new();
        let parent: Arc<dyn FetchParent> =
            Arc::new(ListParent::new(entity(), ChunkSize::Default));
        registry.bind(&entity(), ItemId(1), &parent);
        registry.bind(&entity(), ItemId(2), &parent);
        registry.drop_parent(parent_key(&parent));
        assert_eq!(registry.binding_count(), 0);
    }
}

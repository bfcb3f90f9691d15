//! In-memory reference implementation of [`BackingStore`].
//!
//! Rows are *staged* per item type (standing in for unfetched database rows)
//! and migrate into the fetch cache in `batch_size` chunks as the engine
//! advances the query.  Mutations and sessions behave like a real session
//! layer: removal flips validity instead of deleting, commit stamps a commit
//! id on every dirty row, rollback restores the last committed snapshot, and
//! refresh pushes fetched rows back into the staged queue so they get
//! re-fetched.
//!
//! Used by the engine's tests and as the executable description of the
//! adapter contract; production adapters wrap a real store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use indexmap::IndexMap;

use fetchmux_core::{
    CommitId, Item, ItemError, ItemId, ItemType, LockLevel, OrderedMutex, OrderedRwLock,
    StoreError, StoreResult,
};

use crate::store::BackingStore;

/// Fetched rows, in insertion order, plus per-type exhaustion flags.
#[derive(Default)]
struct CacheState {
    rows: HashMap<ItemType, IndexMap<ItemId, Item>>,
    exhausted: HashSet<ItemType>,
}

/// Rows not yet pulled by `advance_query`, plus session bookkeeping.
#[derive(Default)]
struct StagedState {
    pending: HashMap<ItemType, VecDeque<Item>>,
    /// Ids touched since the last commit, per type.
    dirty: HashMap<ItemType, HashSet<ItemId>>,
}

/// Snapshot of store content at the last commit, for rollback.
#[derive(Clone)]
struct Baseline {
    rows: HashMap<ItemType, IndexMap<ItemId, Item>>,
    exhausted: HashSet<ItemType>,
    pending: HashMap<ItemType, VecDeque<Item>>,
}

pub struct MemoryStore {
    batch_size: usize,
    cache: OrderedRwLock<CacheState>,
    staged: OrderedMutex<StagedState>,
    /// Captured lazily before the first mutation after a commit.  `None`
    /// while the session is clean.
    baseline: Mutex<Option<Baseline>>,
    next_id: AtomicU64,
    next_commit: AtomicU64,
    advance_calls: AtomicUsize,
    commit_log: Mutex<Vec<(CommitId, String)>>,
    /// Injected failure for the next commit/rollback, for error-path tests.
    fail_next_session_op: Mutex<Option<StoreError>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store that serves everything staged in one chunk per advance.
    #[must_use]
    pub fn new() -> Self {
        Self::with_batch_size(fetchmux_core::DEFAULT_CHUNK_SIZE)
    }

    /// A store that serves at most `batch_size` rows per query advance.
    #[must_use]
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            cache: OrderedRwLock::new(LockLevel::StoreCache, CacheState::default()),
            staged: OrderedMutex::new(LockLevel::StoreStaged, StagedState::default()),
            baseline: Mutex::new(None),
            next_id: AtomicU64::new(1),
            next_commit: AtomicU64::new(1),
            advance_calls: AtomicUsize::new(0),
            commit_log: Mutex::new(Vec::new()),
            fail_next_session_op: Mutex::new(None),
        }
    }

    /// Seed committed rows that `advance_query` will fetch later.  Rows with
    /// `ItemId(0)` get a fresh id assigned.
    pub fn stage_rows(&self, item_type: &ItemType, rows: impl IntoIterator<Item = Item>) {
        // Cache lock first (rank order), even though only staged is written:
        // un-exhaust the type so new rows become fetchable again.
        let mut cache = self.cache.write();
        cache.exhausted.remove(item_type);
        drop(cache);
        let mut staged = self.staged.lock();
        let queue = staged.pending.entry(item_type.clone()).or_default();
        for mut row in rows {
            if row.id == ItemId(0) {
                row.id = ItemId(self.next_id.fetch_add(1, Ordering::Relaxed));
            }
            queue.push_back(row);
        }
    }

    /// Number of `advance_query` calls so far (single-flight assertions).
    #[must_use]
    pub fn advance_calls(&self) -> usize {
        self.advance_calls.load(Ordering::Relaxed)
    }

    /// Commits performed so far, oldest first.
    #[must_use]
    pub fn commit_log(&self) -> Vec<(CommitId, String)> {
        self.commit_log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Make the next commit or rollback fail with `error`.
    pub fn fail_next_session_op(&self, error: StoreError) {
        *self
            .fail_next_session_op
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(error);
    }

    fn take_injected_failure(&self) -> Option<StoreError> {
        self.fail_next_session_op
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Capture the pre-mutation snapshot once per dirty session.
    fn ensure_baseline(&self, cache: &CacheState, staged: &StagedState) {
        let mut baseline = self
            .baseline
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if baseline.is_none() {
            *baseline = Some(Baseline {
                rows: cache.rows.clone(),
                exhausted: cache.exhausted.clone(),
                pending: staged.pending.clone(),
            });
        }
    }

    fn assign_id(&self, item: &mut Item) {
        if item.id == ItemId(0) {
            item.id = ItemId(self.next_id.fetch_add(1, Ordering::Relaxed));
        }
    }

    fn validate_add(cache_rows: Option<&IndexMap<ItemId, Item>>, item: &Item) -> Option<String> {
        let name = item.field("name").and_then(serde_json::Value::as_str);
        let Some(name) = name else {
            return Some("missing required field \"name\"".to_string());
        };
        let duplicate = cache_rows.is_some_and(|rows| {
            rows.values().any(|existing| {
                existing.is_valid()
                    && existing.field("name").and_then(serde_json::Value::as_str) == Some(name)
            })
        });
        if duplicate {
            return Some(format!("an item named {name:?} already exists"));
        }
        None
    }
}

impl BackingStore for MemoryStore {
    fn known_item_types(&self) -> Vec<ItemType> {
        let cache = self.cache.read();
        let staged = self.staged.lock();
        let mut types: Vec<ItemType> = cache
            .rows
            .keys()
            .chain(staged.pending.keys())
            .cloned()
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    fn cached_len(&self, item_type: &ItemType) -> usize {
        self.cache
            .read()
            .rows
            .get(item_type)
            .map_or(0, IndexMap::len)
    }

    fn cached_ids_from(&self, item_type: &ItemType, position: usize) -> Vec<ItemId> {
        self.cache.read().rows.get(item_type).map_or_else(Vec::new, |rows| {
            rows.keys().skip(position).copied().collect()
        })
    }

    fn get_item(&self, item_type: &ItemType, id: ItemId) -> Option<Item> {
        self.cache
            .read()
            .rows
            .get(item_type)
            .and_then(|rows| rows.get(&id))
            .cloned()
    }

    fn is_exhausted(&self, item_type: &ItemType) -> bool {
        self.cache.read().exhausted.contains(item_type)
    }

    fn advance_query(&self, item_type: &ItemType) -> StoreResult<Vec<Item>> {
        self.advance_calls.fetch_add(1, Ordering::Relaxed);
        let mut cache = self.cache.write();
        let mut staged = self.staged.lock();
        let queue = staged.pending.entry(item_type.clone()).or_default();
        let take = self.batch_size.min(queue.len());
        let chunk: Vec<Item> = queue.drain(..take).collect();
        if queue.is_empty() {
            cache.exhausted.insert(item_type.clone());
        }
        let rows = cache.rows.entry(item_type.clone()).or_default();
        for item in &chunk {
            rows.insert(item.id, item.clone());
        }
        tracing::trace!(%item_type, fetched = chunk.len(), "advanced query");
        Ok(chunk)
    }

    fn add_items(
        &self,
        item_type: &ItemType,
        items: Vec<Item>,
        validate: bool,
    ) -> StoreResult<(Vec<Item>, Vec<ItemError>)> {
        let mut cache = self.cache.write();
        let staged = self.staged.lock();
        self.ensure_baseline(&cache, &staged);
        drop(staged);

        let mut added = Vec::new();
        let mut errors = Vec::new();
        for mut item in items {
            if validate
                && let Some(message) = Self::validate_add(cache.rows.get(item_type), &item)
            {
                errors.push(ItemError::new(item_type.clone(), None, message));
                continue;
            }
            self.assign_id(&mut item);
            item.valid = true;
            item.commit_id = None;
            cache
                .rows
                .entry(item_type.clone())
                .or_default()
                .insert(item.id, item.clone());
            added.push(item);
        }
        drop(cache);

        let mut staged = self.staged.lock();
        let dirty = staged.dirty.entry(item_type.clone()).or_default();
        for item in &added {
            dirty.insert(item.id);
        }
        Ok((added, errors))
    }

    fn update_items(
        &self,
        item_type: &ItemType,
        items: Vec<Item>,
        _validate: bool,
    ) -> StoreResult<(Vec<Item>, Vec<ItemError>)> {
        let mut cache = self.cache.write();
        let staged = self.staged.lock();
        self.ensure_baseline(&cache, &staged);
        drop(staged);

        let mut updated = Vec::new();
        let mut errors = Vec::new();
        for patch in items {
            match cache
                .rows
                .get_mut(item_type)
                .and_then(|rows| rows.get_mut(&patch.id))
            {
                Some(existing) => {
                    existing.apply_update(&patch.fields);
                    updated.push(existing.clone());
                }
                None => errors.push(ItemError::new(
                    item_type.clone(),
                    Some(patch.id),
                    "no such item to update",
                )),
            }
        }
        drop(cache);

        let mut staged = self.staged.lock();
        let dirty = staged.dirty.entry(item_type.clone()).or_default();
        for item in &updated {
            dirty.insert(item.id);
        }
        Ok((updated, errors))
    }

    fn remove_items(&self, item_type: &ItemType, ids: &[ItemId]) -> StoreResult<Vec<Item>> {
        let mut cache = self.cache.write();
        let staged = self.staged.lock();
        self.ensure_baseline(&cache, &staged);
        drop(staged);

        let mut removed = Vec::new();
        if let Some(rows) = cache.rows.get_mut(item_type) {
            for id in ids {
                if let Some(item) = rows.get_mut(id)
                    && item.valid
                {
                    item.valid = false;
                    removed.push(item.clone());
                }
            }
        }
        drop(cache);

        let mut staged = self.staged.lock();
        let dirty = staged.dirty.entry(item_type.clone()).or_default();
        for item in &removed {
            dirty.insert(item.id);
        }
        Ok(removed)
    }

    fn restore_items(&self, item_type: &ItemType, ids: &[ItemId]) -> StoreResult<Vec<Item>> {
        let mut cache = self.cache.write();
        let staged = self.staged.lock();
        self.ensure_baseline(&cache, &staged);
        drop(staged);

        let mut restored = Vec::new();
        if let Some(rows) = cache.rows.get_mut(item_type) {
            for id in ids {
                if let Some(item) = rows.get_mut(id)
                    && !item.valid
                {
                    item.valid = true;
                    restored.push(item.clone());
                }
            }
        }
        drop(cache);

        let mut staged = self.staged.lock();
        let dirty = staged.dirty.entry(item_type.clone()).or_default();
        for item in &restored {
            dirty.insert(item.id);
        }
        Ok(restored)
    }

    fn commit_session(&self, message: &str) -> StoreResult<()> {
        if let Some(error) = self.take_injected_failure() {
            return Err(error);
        }
        let mut cache = self.cache.write();
        let mut staged = self.staged.lock();
        if staged.dirty.values().all(HashSet::is_empty) {
            return Err(StoreError::NothingToCommit);
        }
        let commit_id = CommitId(self.next_commit.fetch_add(1, Ordering::Relaxed));
        for (item_type, ids) in staged.dirty.drain() {
            let Some(rows) = cache.rows.get_mut(&item_type) else {
                continue;
            };
            for id in ids {
                if let Some(item) = rows.get_mut(&id) {
                    item.commit_id = Some(commit_id);
                }
            }
        }
        drop(staged);
        drop(cache);
        *self
            .baseline
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        self.commit_log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((commit_id, message.to_string()));
        Ok(())
    }

    fn rollback_session(&self) -> StoreResult<()> {
        if let Some(error) = self.take_injected_failure() {
            return Err(error);
        }
        let restored = self
            .baseline
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(baseline) = restored else {
            return Err(StoreError::NothingToRollback);
        };
        let mut cache = self.cache.write();
        let mut staged = self.staged.lock();
        cache.rows = baseline.rows;
        cache.exhausted = baseline.exhausted;
        staged.pending = baseline.pending;
        staged.dirty.clear();
        Ok(())
    }

    fn refresh_session(&self) -> StoreResult<()> {
        let mut cache = self.cache.write();
        let mut staged = self.staged.lock();
        for (item_type, rows) in cache.rows.drain() {
            let queue = staged.pending.entry(item_type).or_default();
            // Fetched rows go back to the head, before anything still staged,
            // so re-fetch order matches the original insertion order.
            for item in rows.into_values().rev() {
                queue.push_front(item);
            }
        }
        cache.exhausted.clear();
        Ok(())
    }

    fn has_pending_changes(&self) -> bool {
        !self
            .staged
            .lock()
            .dirty
            .values()
            .all(HashSet::is_empty)
    }
}

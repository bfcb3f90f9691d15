//! The fetch coordinator.
//!
//! Mediates between one backing store and any number of fetch parents, each
//! wanting a live, incrementally loaded, filtered view of one item type.
//! Responsibilities:
//!
//! - parent registration and lazy epoch invalidation (fetch tokens)
//! - draining cached rows into parents in store insertion order
//! - single-flight query advances: at most one `advance_query` per item
//!   type in flight; later requests join the pending one
//! - speculative will-have-children probing over a separate read-only cursor
//! - mutation fan-out (add/update/remove/restore) and session operations
//!   (commit/rollback/refresh)
//!
//! The consumer-facing half runs on the caller's thread; store access runs
//! on the sequential worker.  Advance completions come back as messages and
//! are applied by [`FetchCoordinator::pump`] on the owning context, so the
//! cache and the registry are only ever mutated from one logical flow.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace, warn};

use fetchmux_core::{
    CommitId, EngineConfig, Item, ItemId, ItemType, LockLevel, OrderedMutex, StoreError,
    StoreResult,
};

use crate::commit_cache::CommitCache;
use crate::events::{ConnectionId, ErrorReport, SessionEvent, WorkerEvent};
use crate::metrics::FetchMetrics;
use crate::parent::{FetchContext, FetchParent, parent_key};
use crate::store::BackingStore;
use crate::subscription::{MutationKind, SubscriptionRegistry};
use crate::worker::SequentialWorker;

/// How long `pump_until_idle` waits for an outstanding completion before
/// giving up (worker died or the store is wedged).
const IDLE_WAIT: Duration = Duration::from_secs(5);

enum AdvanceWaiter {
    /// A parent whose `fetch_more` is waiting for rows.
    Parent(Arc<dyn FetchParent>),
    /// The will-have-children probe for this item type.
    Probe,
}

struct CoordinatorState {
    /// Current epoch.  Strictly increases, only on `refresh_session`.
    fetch_token: u64,
    parents_by_type: HashMap<ItemType, Vec<Arc<dyn FetchParent>>>,
    /// Single-flight table: an entry exists iff an advance for that type is
    /// in flight; everyone else appends a waiter instead of dispatching.
    advance_waiters: HashMap<ItemType, Vec<AdvanceWaiter>>,
    subscriptions: SubscriptionRegistry,
    /// Advances triggered by the current probe round, per type (only used
    /// when the config bounds probing).
    probe_advances: HashMap<ItemType, usize>,
}

pub struct FetchCoordinator {
    connection: ConnectionId,
    store: Arc<dyn BackingStore>,
    worker: SequentialWorker,
    config: EngineConfig,
    state: OrderedMutex<CoordinatorState>,
    commit_cache: OrderedMutex<CommitCache>,
    metrics: Arc<FetchMetrics>,
    /// Advance completions from the worker, drained by `pump`.
    events: Mutex<Receiver<WorkerEvent>>,
    session_events: Sender<SessionEvent>,
    errors: Sender<ErrorReport>,
}

impl FetchCoordinator {
    pub(crate) fn new(
        connection: ConnectionId,
        store: Arc<dyn BackingStore>,
        config: EngineConfig,
        session_events: Sender<SessionEvent>,
        errors: Sender<ErrorReport>,
    ) -> Self {
        let (event_tx, event_rx) = channel();
        let worker =
            SequentialWorker::spawn(Arc::clone(&store), event_tx, config.worker_queue_capacity);
        Self {
            connection,
            store,
            worker,
            config,
            state: OrderedMutex::new(
                LockLevel::CoordinatorRegistry,
                CoordinatorState {
                    fetch_token: 0,
                    parents_by_type: HashMap::new(),
                    advance_waiters: HashMap::new(),
                    subscriptions: SubscriptionRegistry::new(),
                    probe_advances: HashMap::new(),
                },
            ),
            commit_cache: OrderedMutex::new(LockLevel::CoordinatorCommitCache, CommitCache::new()),
            metrics: Arc::new(FetchMetrics::new()),
            events: Mutex::new(event_rx),
            session_events,
            errors,
        }
    }

    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    #[must_use]
    pub fn metrics(&self) -> &FetchMetrics {
        &self.metrics
    }

    /// Current epoch, for diagnostics.
    #[must_use]
    pub fn fetch_token(&self) -> u64 {
        self.state.lock().fetch_token
    }

    // -----------------------------------------------------------------
    // Fetching
    // -----------------------------------------------------------------

    /// Returns whether more data can be fetched for `parent`.  Also
    /// registers the parent so it gets notified of relevant mutations later
    /// on, and kicks off will-have-children probing for its item type.
    pub fn can_fetch_more(&self, parent: &Arc<dyn FetchParent>) -> bool {
        if parent.is_obsolete() {
            return false;
        }
        let mut state = self.state.lock();
        self.reset_fetching_if_required(&mut state, parent);
        self.register_fetch_parent(&mut state, parent);
        drop(state);
        parent.will_have_children() != Some(false) && !parent.is_fetched() && !parent.is_busy()
    }

    /// Fetch items for `parent`: drain what the cache already holds, or
    /// schedule a query advance whose completion re-enters this logic via
    /// [`FetchCoordinator::pump`].  Never blocks on the store.
    pub fn fetch_more(&self, parent: &Arc<dyn FetchParent>) {
        let mut state = self.state.lock();
        self.fetch_more_locked(&mut state, parent);
    }

    fn fetch_more_locked(&self, state: &mut CoordinatorState, parent: &Arc<dyn FetchParent>) {
        if parent.is_obsolete() {
            return;
        }
        self.reset_fetching_if_required(state, parent);
        self.register_fetch_parent(state, parent);
        // Order matters: drain the cache before consulting the fetched flag.
        if self.drain_cache(state, parent) || parent.is_fetched() {
            parent.set_busy(false);
            return;
        }
        // Nothing new in cache; maybe something in the store.
        let item_type = parent.fetch_item_type();
        if self.store.is_exhausted(&item_type) {
            parent.set_fetched(true);
            parent.set_busy(false);
            return;
        }
        self.join_advance(state, &item_type, AdvanceWaiter::Parent(Arc::clone(parent)));
        parent.set_busy(true);
    }

    /// Walk the cache from the parent's position, delivering accepted items
    /// up to the chunk size.  Returns whether the parent can stop fetching
    /// for now.
    fn drain_cache(&self, state: &mut CoordinatorState, parent: &Arc<dyn FetchParent>) -> bool {
        let item_type = parent.fetch_item_type();
        let limit = parent.chunk_size().resolve(self.config.default_chunk_size);
        let ctx = FetchContext {
            connection: self.connection,
            store: self.store.as_ref(),
        };
        let mut shown = 0usize;
        let mut delivered = 0u64;
        for id in self
            .store
            .cached_ids_from(&item_type, parent.position(self.connection))
        {
            parent.increment_position(self.connection);
            let Some(item) = self.store.get_item(&item_type, id) else {
                continue;
            };
            if parent.accepts_item(&item, &ctx) {
                state.subscriptions.bind(&item_type, id, parent);
                if item.is_valid() {
                    parent.add_item(&item, &ctx);
                    delivered += 1;
                    trace!(%item_type, %id, "delivered item");
                    if parent.shows_item(&item, &ctx) {
                        shown += 1;
                    }
                }
                if Some(shown) == limit {
                    break;
                }
            }
        }
        FetchMetrics::add(&self.metrics.items_delivered, delivered);
        // Unbounded parents keep fetching until the store is exhausted.
        limit.is_some() && shown > 0
    }

    /// Sets the parent's token, or resets the parent if tokens don't match.
    fn reset_fetching_if_required(
        &self,
        state: &mut CoordinatorState,
        parent: &Arc<dyn FetchParent>,
    ) {
        match parent.fetch_token() {
            None => parent.set_fetch_token(state.fetch_token),
            Some(token) if token != state.fetch_token => {
                debug!(
                    stale = token,
                    current = state.fetch_token,
                    "resetting parent for new epoch"
                );
                state.subscriptions.drop_parent(parent_key(parent));
                parent.reset(state.fetch_token);
            }
            Some(_) => {}
        }
    }

    /// Registers `parent` for its item type and starts checking whether it
    /// would have children if fetched.  Registering twice is a no-op.
    fn register_fetch_parent(&self, state: &mut CoordinatorState, parent: &Arc<dyn FetchParent>) {
        let item_type = parent.fetch_item_type();
        let key = parent_key(parent);
        let parents = state.parents_by_type.entry(item_type.clone()).or_default();
        if parents.iter().any(|known| parent_key(known) == key) {
            return;
        }
        parents.push(Arc::clone(parent));
        // A new parent starts a fresh probe round, and any probe already in
        // progress restarts from scratch on its next resumption, so the new
        // parent is never skipped.
        state.probe_advances.remove(&item_type);
        self.update_parents_will_have_children(state, &item_type);
    }

    /// Live (non-obsolete) parents for `item_type`; obsolete ones are purged
    /// from the registry and the subscription table on the way.
    fn live_parents(
        state: &mut CoordinatorState,
        item_type: &ItemType,
    ) -> Vec<Arc<dyn FetchParent>> {
        let Some(parents) = state.parents_by_type.get_mut(item_type) else {
            return Vec::new();
        };
        let mut purged = Vec::new();
        parents.retain(|parent| {
            if parent.is_obsolete() {
                purged.push(parent_key(parent));
                false
            } else {
                true
            }
        });
        let live = parents.clone();
        for key in purged {
            state.subscriptions.drop_parent(key);
        }
        live
    }

    // -----------------------------------------------------------------
    // Will-have-children probing
    // -----------------------------------------------------------------

    /// Updates `will_have_children` for all still-unknown parents of
    /// `item_type`.
    ///
    /// This is a read-only preview walk over its own cursor: it never
    /// advances any parent's position or marks items delivered.  When the
    /// cache runs out before every parent is resolved, one query advance is
    /// joined through the single-flight table and the walk restarts from
    /// position 0 on completion.
    fn update_parents_will_have_children(&self, state: &mut CoordinatorState, item_type: &ItemType) {
        let parents = Self::live_parents(state, item_type);
        let mut unresolved: Vec<Arc<dyn FetchParent>> = parents
            .into_iter()
            .filter(|parent| parent.will_have_children().is_none())
            .collect();
        if unresolved.is_empty() {
            state.probe_advances.remove(item_type);
            return;
        }
        let ctx = FetchContext {
            connection: self.connection,
            store: self.store.as_ref(),
        };
        let mut position = 0usize;
        loop {
            let ids = self.store.cached_ids_from(item_type, position);
            if ids.is_empty() {
                if self.store.is_exhausted(item_type) {
                    for parent in &unresolved {
                        parent.set_will_have_children(Some(false));
                        parent.will_have_children_change();
                        FetchMetrics::inc(&self.metrics.probes_resolved_false);
                    }
                    debug!(%item_type, parents = unresolved.len(), "probe exhausted store; no children");
                    state.probe_advances.remove(item_type);
                } else if self.probe_may_advance(state, item_type) {
                    self.join_advance(state, item_type, AdvanceWaiter::Probe);
                }
                return;
            }
            for id in ids {
                position += 1;
                let Some(item) = self.store.get_item(item_type, id) else {
                    continue;
                };
                unresolved.retain(|parent| {
                    if parent.accepts_item(&item, &ctx) {
                        parent.set_will_have_children(Some(true));
                        parent.will_have_children_change();
                        FetchMetrics::inc(&self.metrics.probes_resolved_true);
                        false
                    } else {
                        true
                    }
                });
                if unresolved.is_empty() {
                    state.probe_advances.remove(item_type);
                    return;
                }
            }
        }
    }

    fn probe_may_advance(&self, state: &mut CoordinatorState, item_type: &ItemType) -> bool {
        let advances = state.probe_advances.entry(item_type.clone()).or_insert(0);
        if self.config.probe_advance_limit > 0 && *advances >= self.config.probe_advance_limit {
            return false;
        }
        *advances += 1;
        true
    }

    // -----------------------------------------------------------------
    // Single-flight dispatch and completion handling
    // -----------------------------------------------------------------

    fn join_advance(
        &self,
        state: &mut CoordinatorState,
        item_type: &ItemType,
        waiter: AdvanceWaiter,
    ) {
        match state.advance_waiters.entry(item_type.clone()) {
            Entry::Occupied(mut in_flight) => {
                let waiters = in_flight.get_mut();
                let duplicate = match &waiter {
                    AdvanceWaiter::Parent(parent) => waiters.iter().any(|known| {
                        matches!(known, AdvanceWaiter::Parent(existing)
                            if parent_key(existing) == parent_key(parent))
                    }),
                    AdvanceWaiter::Probe => waiters
                        .iter()
                        .any(|known| matches!(known, AdvanceWaiter::Probe)),
                };
                if !duplicate {
                    waiters.push(waiter);
                }
                FetchMetrics::inc(&self.metrics.queries_joined);
                trace!(%item_type, "joined in-flight query advance");
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![waiter]);
                self.worker.submit_advance(item_type.clone());
                FetchMetrics::inc(&self.metrics.queries_dispatched);
                debug!(%item_type, "dispatched query advance");
            }
        }
    }

    fn handle_event(&self, event: WorkerEvent) {
        let WorkerEvent::QueryAdvanced { item_type, result } = event;
        match result {
            Ok(chunk) => {
                FetchMetrics::inc(&self.metrics.chunks_received);
                self.commit_cache.lock().record_chunk(&item_type, &chunk);
                let mut state = self.state.lock();
                let Some(waiters) = state.advance_waiters.remove(&item_type) else {
                    // Epoch was bumped while the advance was in flight; the
                    // cache keeps the rows, nobody is fast-forwarded.
                    FetchMetrics::inc(&self.metrics.stale_completions);
                    return;
                };
                for waiter in waiters {
                    match waiter {
                        AdvanceWaiter::Parent(parent) => {
                            self.handle_query_advanced(&mut state, &parent);
                        }
                        AdvanceWaiter::Probe => {
                            self.update_parents_will_have_children(&mut state, &item_type);
                        }
                    }
                }
            }
            Err(error) => {
                warn!(%item_type, %error, "query advance failed");
                let mut state = self.state.lock();
                if let Some(waiters) = state.advance_waiters.remove(&item_type) {
                    for waiter in waiters {
                        if let AdvanceWaiter::Parent(parent) = waiter {
                            parent.set_busy(false);
                        }
                    }
                }
                drop(state);
                self.report_store_error(error);
            }
        }
    }

    fn handle_query_advanced(&self, state: &mut CoordinatorState, parent: &Arc<dyn FetchParent>) {
        if parent.is_obsolete() {
            return;
        }
        let item_type = parent.fetch_item_type();
        if parent.position(self.connection) < self.store.cached_len(&item_type) {
            // More available: drain again.
            parent.set_busy(false);
            self.fetch_more_locked(state, parent);
        } else {
            parent.set_fetched(true);
            parent.set_busy(false);
        }
    }

    /// Apply all completions currently queued.  Returns how many were
    /// processed.
    pub fn pump(&self) -> usize {
        let mut processed = 0;
        loop {
            let event = self
                .events
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .try_recv();
            match event {
                Ok(event) => {
                    self.handle_event(event);
                    processed += 1;
                }
                Err(_) => return processed,
            }
        }
    }

    /// Pump until no advance is outstanding (or the worker stops answering).
    pub fn pump_until_idle(&self) -> usize {
        let mut processed = self.pump();
        while !self.state.lock().advance_waiters.is_empty() {
            let event = self
                .events
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .recv_timeout(IDLE_WAIT);
            match event {
                Ok(event) => {
                    self.handle_event(event);
                    processed += 1;
                }
                Err(_) => break,
            }
            processed += self.pump();
        }
        processed
    }

    // -----------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------

    /// Add items to the store.  Validation failures go to the error channel;
    /// the inserted subset is re-delivered to every registered parent of
    /// that type via `fetch_more` so newly inserted rows reach open views.
    pub fn add_items(&self, item_type: &ItemType, items: Vec<Item>, validate: bool) -> Vec<Item> {
        let t = item_type.clone();
        let result = self.run_store(move |store| store.add_items(&t, items, validate));
        match result {
            Ok((added, errors)) => {
                self.report_item_errors(errors);
                let mut state = self.state.lock();
                for parent in Self::live_parents(&mut state, item_type) {
                    self.fetch_more_locked(&mut state, &parent);
                }
                drop(state);
                let _ = self.session_events.send(SessionEvent::ItemsAdded {
                    item_type: item_type.clone(),
                    items: added.clone(),
                });
                added
            }
            Err(error) => {
                self.report_store_error(error);
                Vec::new()
            }
        }
    }

    /// Update items in the store and push the changes through the bound
    /// mutation callbacks (no re-fetch).
    pub fn update_items(&self, item_type: &ItemType, items: Vec<Item>, validate: bool) -> Vec<Item> {
        let t = item_type.clone();
        let result = self.run_store(move |store| store.update_items(&t, items, validate));
        match result {
            Ok((updated, errors)) => {
                self.report_item_errors(errors);
                self.fire_mutation(item_type, &updated, MutationKind::Update);
                let _ = self.session_events.send(SessionEvent::ItemsUpdated {
                    item_type: item_type.clone(),
                    items: updated.clone(),
                });
                updated
            }
            Err(error) => {
                self.report_store_error(error);
                Vec::new()
            }
        }
    }

    /// Remove items (they stay cached, invalid) and detach them from bound
    /// parents.
    pub fn remove_items(&self, item_type: &ItemType, ids: &[ItemId]) -> Vec<Item> {
        let t = item_type.clone();
        let ids = ids.to_vec();
        let result = self.run_store(move |store| store.remove_items(&t, &ids));
        match result {
            Ok(removed) => {
                self.fire_mutation(item_type, &removed, MutationKind::Remove);
                let _ = self.session_events.send(SessionEvent::ItemsRemoved {
                    item_type: item_type.clone(),
                    items: removed.clone(),
                });
                removed
            }
            Err(error) => {
                self.report_store_error(error);
                Vec::new()
            }
        }
    }

    /// Re-add previously removed items through the bound restore callbacks.
    pub fn restore_items(&self, item_type: &ItemType, ids: &[ItemId]) -> Vec<Item> {
        let t = item_type.clone();
        let ids = ids.to_vec();
        let result = self.run_store(move |store| store.restore_items(&t, &ids));
        match result {
            Ok(restored) => {
                self.fire_mutation(item_type, &restored, MutationKind::Restore);
                let _ = self.session_events.send(SessionEvent::ItemsAdded {
                    item_type: item_type.clone(),
                    items: restored.clone(),
                });
                restored
            }
            Err(error) => {
                self.report_store_error(error);
                Vec::new()
            }
        }
    }

    fn fire_mutation(&self, item_type: &ItemType, items: &[Item], kind: MutationKind) {
        if items.is_empty() {
            return;
        }
        let ctx = FetchContext {
            connection: self.connection,
            store: self.store.as_ref(),
        };
        let mut state = self.state.lock();
        for item in items {
            state.subscriptions.fire(item_type, item, kind, &ctx);
        }
    }

    // -----------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------

    /// Commit the session.  On failure the error is routed out-of-band and
    /// no parent observes a partial commit.
    pub fn commit_session(&self, message: &str) {
        let msg = message.to_string();
        match self.run_store(move |store| store.commit_session(&msg)) {
            Ok(()) => {
                let _ = self.session_events.send(SessionEvent::Committed {
                    message: message.to_string(),
                });
            }
            Err(error) => self.report_store_error(error),
        }
    }

    /// Roll the session back, discarding pending changes.
    pub fn rollback_session(&self) {
        match self.run_store(|store| store.rollback_session()) {
            Ok(()) => {
                let _ = self.session_events.send(SessionEvent::RolledBack);
            }
            Err(error) => self.report_store_error(error),
        }
    }

    /// Refresh the session: bump the epoch and clear all pending
    /// single-flight registrations.  Registered parents self-reset the next
    /// time they are touched; commit membership is re-learned from
    /// re-fetched chunks.
    pub fn refresh_session(&self) {
        match self.run_store(|store| store.refresh_session()) {
            Ok(()) => {
                self.commit_cache.lock().clear();
                let mut state = self.state.lock();
                state.fetch_token += 1;
                state.advance_waiters.clear();
                state.probe_advances.clear();
                let token = state.fetch_token;
                drop(state);
                debug!(epoch = token, "session refreshed");
                let _ = self.session_events.send(SessionEvent::Refreshed);
            }
            Err(error) => self.report_store_error(error),
        }
    }

    /// Synchronously exhaust the store for the given item types (all known
    /// types when `None`), populating the cache and the commit cache.
    pub fn fetch_all(&self, item_types: Option<Vec<ItemType>>) {
        let types = item_types.unwrap_or_else(|| self.store.known_item_types());
        for item_type in types {
            while !self.store.is_exhausted(&item_type) {
                let t = item_type.clone();
                match self.run_store(move |store| store.advance_query(&t)) {
                    Ok(chunk) => {
                        FetchMetrics::inc(&self.metrics.chunks_received);
                        if chunk.is_empty() {
                            break;
                        }
                        self.commit_cache.lock().record_chunk(&item_type, &chunk);
                    }
                    Err(error) => {
                        self.report_store_error(error);
                        return;
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Commit cache access
    // -----------------------------------------------------------------

    /// Ids of `item_type` known to belong to `commit_id`.
    #[must_use]
    pub fn commit_ids_for(&self, commit_id: CommitId, item_type: &ItemType) -> Vec<ItemId> {
        self.commit_cache
            .lock()
            .ids_for(commit_id, item_type)
            .to_vec()
    }

    /// Commits observed in fetched data so far, ascending.
    #[must_use]
    pub fn known_commits(&self) -> Vec<CommitId> {
        self.commit_cache.lock().commits()
    }

    // -----------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------

    fn run_store<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn BackingStore) -> StoreResult<T> + Send + 'static,
    {
        self.worker.run_blocking(op).and_then(|inner| inner)
    }

    fn report_store_error(&self, error: StoreError) {
        FetchMetrics::inc(&self.metrics.store_errors);
        warn!(connection = %self.connection, %error, "store error");
        let _ = self.errors.send(ErrorReport::Store {
            connection: self.connection,
            error,
        });
    }

    fn report_item_errors(&self, errors: Vec<fetchmux_core::ItemError>) {
        if errors.is_empty() {
            return;
        }
        let _ = self.errors.send(ErrorReport::Validation {
            connection: self.connection,
            errors,
        });
    }

    /// Shut the worker down.  Subsequent store operations fail with
    /// [`StoreError::ConnectionClosed`] on the error channel.
    pub(crate) fn close(&self) {
        self.worker.close();
    }
}

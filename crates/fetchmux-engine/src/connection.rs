//! A connection: one backing store, one sequential worker, one coordinator.
//!
//! All consumer-facing calls happen on the caller's side; the store is only
//! ever touched by the connection's worker thread.  Completions, session
//! events, and errors come back over channels and are drained explicitly
//! with [`Connection::pump`] and the `drain_*` methods, so consumers decide
//! when callbacks run.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

use tracing::info;

use fetchmux_core::{CommitId, EngineConfig, Item, ItemId, ItemType};

use crate::coordinator::FetchCoordinator;
use crate::events::{ConnectionId, ErrorReport, SessionEvent};
use crate::metrics::FetchMetricsSnapshot;
use crate::parent::FetchParent;
use crate::store::BackingStore;

pub struct Connection {
    id: ConnectionId,
    coordinator: Arc<FetchCoordinator>,
    session_events: Receiver<SessionEvent>,
    errors: Receiver<ErrorReport>,
}

impl Connection {
    /// Open a connection over `store` with the given config, spawning its
    /// worker thread.
    #[must_use]
    pub fn open(store: Arc<dyn BackingStore>, config: EngineConfig) -> Self {
        let id = ConnectionId::next();
        let (session_tx, session_rx): (Sender<SessionEvent>, _) = channel();
        let (error_tx, error_rx): (Sender<ErrorReport>, _) = channel();
        let coordinator = Arc::new(FetchCoordinator::new(
            id,
            store,
            config,
            session_tx,
            error_tx,
        ));
        info!(connection = %id, "connection opened");
        Self {
            id,
            coordinator,
            session_events: session_rx,
            errors: error_rx,
        }
    }

    #[must_use]
    pub fn open_default(store: Arc<dyn BackingStore>) -> Self {
        Self::open(store, EngineConfig::default())
    }

    /// Open with tunables taken from `FETCHMUX_*` environment variables.
    #[must_use]
    pub fn open_from_env(store: Arc<dyn BackingStore>) -> Self {
        Self::open(store, EngineConfig::from_env())
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// The coordinator driving fetches for this connection.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<FetchCoordinator> {
        &self.coordinator
    }

    // --- Fetching ------------------------------------------------------

    pub fn can_fetch_more(&self, parent: &Arc<dyn FetchParent>) -> bool {
        self.coordinator.can_fetch_more(parent)
    }

    pub fn fetch_more(&self, parent: &Arc<dyn FetchParent>) {
        self.coordinator.fetch_more(parent);
    }

    pub fn fetch_all(&self, item_types: Option<Vec<ItemType>>) {
        self.coordinator.fetch_all(item_types);
    }

    /// Apply queued advance completions.  Returns how many were processed.
    pub fn pump(&self) -> usize {
        self.coordinator.pump()
    }

    /// Pump until no query advance is outstanding.
    pub fn pump_until_idle(&self) -> usize {
        self.coordinator.pump_until_idle()
    }

    // --- Mutations -----------------------------------------------------

    pub fn add_items(&self, item_type: &ItemType, items: Vec<Item>, validate: bool) -> Vec<Item> {
        self.coordinator.add_items(item_type, items, validate)
    }

    pub fn update_items(&self, item_type: &ItemType, items: Vec<Item>, validate: bool) -> Vec<Item> {
        self.coordinator.update_items(item_type, items, validate)
    }

    pub fn remove_items(&self, item_type: &ItemType, ids: &[ItemId]) -> Vec<Item> {
        self.coordinator.remove_items(item_type, ids)
    }

    pub fn restore_items(&self, item_type: &ItemType, ids: &[ItemId]) -> Vec<Item> {
        self.coordinator.restore_items(item_type, ids)
    }

    // --- Sessions ------------------------------------------------------

    pub fn commit_session(&self, message: &str) {
        self.coordinator.commit_session(message);
    }

    pub fn rollback_session(&self) {
        self.coordinator.rollback_session();
    }

    pub fn refresh_session(&self) {
        self.coordinator.refresh_session();
    }

    // --- Events, errors, introspection ---------------------------------

    /// Session events accumulated since the last drain, in order.
    pub fn drain_session_events(&self) -> Vec<SessionEvent> {
        self.session_events.try_iter().collect()
    }

    /// Errors accumulated since the last drain, in order.
    pub fn drain_errors(&self) -> Vec<ErrorReport> {
        self.errors.try_iter().collect()
    }

    #[must_use]
    pub fn metrics(&self) -> FetchMetricsSnapshot {
        self.coordinator.metrics().snapshot()
    }

    #[must_use]
    pub fn commit_ids_for(&self, commit_id: CommitId, item_type: &ItemType) -> Vec<ItemId> {
        self.coordinator.commit_ids_for(commit_id, item_type)
    }

    #[must_use]
    pub fn known_commits(&self) -> Vec<CommitId> {
        self.coordinator.known_commits()
    }

    /// Shut the worker down.  Idempotent; also runs on drop.
    pub fn close(&self) {
        info!(connection = %self.id, "connection closed");
        self.coordinator.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.coordinator.close();
    }
}

//! The fetch-parent contract: what a consumer (tree node, list model, graph
//! view) implements to receive an incrementally-loaded, filtered view of one
//! item type.
//!
//! A parent's lifecycle within one epoch:
//!
//! ```text
//! Fresh → registered → Busy ⇄ MoreAvailable → Fetched
//! ```
//!
//! with `Obsolete` reachable from any state (the owning UI node was
//! discarded) and a lazy **reset** back to `Fresh` whenever the parent's
//! fetch token no longer matches the connection's epoch.  The coordinator is
//! the only mutator of this state; consumers read it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{collections::HashMap, fmt};

use fetchmux_core::{Item, ItemId, ItemType, LockLevel, OrderedMutex};

use crate::events::ConnectionId;
use crate::store::BackingStore;

/// How many shown items one `fetch_more` step may deliver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkSize {
    /// Use the connection's configured default.
    Default,
    Limited(usize),
    /// Drain everything available; such parents keep fetching until the
    /// store is exhausted.
    Unlimited,
}

impl ChunkSize {
    /// Resolve against the connection default.  `None` means unbounded.
    #[must_use]
    pub const fn resolve(self, default_chunk_size: usize) -> Option<usize> {
        match self {
            Self::Default => Some(default_chunk_size),
            Self::Limited(n) => Some(n),
            Self::Unlimited => None,
        }
    }
}

/// Read-only view of the connection handed to parent callbacks, so
/// implementations can look up related items while deciding acceptance or
/// updating their rows.
pub struct FetchContext<'a> {
    pub connection: ConnectionId,
    pub store: &'a dyn BackingStore,
}

/// The consumer contract.  Implementations embed a [`ParentState`] and hand
/// it out through [`FetchParent::state`]; the bookkeeping methods are
/// provided on top of it.
pub trait FetchParent: Send + Sync {
    /// The single item type this parent fetches.
    fn fetch_item_type(&self) -> ItemType;

    /// The shared state record the coordinator drives.
    fn state(&self) -> &ParentState;

    fn chunk_size(&self) -> ChunkSize {
        ChunkSize::Default
    }

    /// Whether this parent wants `item` at all.  Accepted items are bound
    /// for mutation callbacks and delivered via [`FetchParent::add_item`].
    fn accepts_item(&self, item: &Item, ctx: &FetchContext<'_>) -> bool;

    /// Whether an accepted item is currently visible.  Only shown items
    /// count against the chunk size.
    fn shows_item(&self, item: &Item, ctx: &FetchContext<'_>) -> bool {
        let _ = (item, ctx);
        true
    }

    /// Deliver one accepted, valid item (initial fetch or restore).
    fn add_item(&self, item: &Item, ctx: &FetchContext<'_>);

    /// Push field changes for a previously delivered item.
    fn update_item(&self, item: &Item, ctx: &FetchContext<'_>);

    /// Detach a removed item.
    fn remove_item(&self, item: &Item, ctx: &FetchContext<'_>);

    /// Called when `will_have_children` flips, so "expandable?" decorations
    /// can re-render.  Default: ignore.
    fn will_have_children_change(&self) {}

    // --- Bookkeeping, provided on top of `state()` ---------------------

    fn position(&self, connection: ConnectionId) -> usize {
        self.state().position(connection)
    }

    fn increment_position(&self, connection: ConnectionId) {
        self.state().increment_position(connection);
    }

    fn is_busy(&self) -> bool {
        self.state().is_busy()
    }

    fn set_busy(&self, busy: bool) {
        self.state().set_busy(busy);
    }

    fn is_fetched(&self) -> bool {
        self.state().is_fetched()
    }

    fn set_fetched(&self, fetched: bool) {
        self.state().set_fetched(fetched);
    }

    fn is_obsolete(&self) -> bool {
        self.state().is_obsolete()
    }

    fn fetch_token(&self) -> Option<u64> {
        self.state().fetch_token()
    }

    fn set_fetch_token(&self, token: u64) {
        self.state().set_fetch_token(token);
    }

    fn will_have_children(&self) -> Option<bool> {
        self.state().will_have_children()
    }

    fn set_will_have_children(&self, value: Option<bool>) {
        self.state().set_will_have_children(value);
    }

    /// Epoch reset: back to `Fresh` under the new token.
    fn reset(&self, new_token: u64) {
        self.state().reset(new_token);
    }
}

/// Opaque identity of a registered parent, derived from its allocation.
/// Stable for the lifetime of the `Arc`, and never reused while any clone
/// of that `Arc` is alive.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ParentKey(usize);

#[must_use]
pub fn parent_key(parent: &Arc<dyn FetchParent>) -> ParentKey {
    ParentKey(Arc::as_ptr(parent).cast::<()>() as usize)
}

#[derive(Default)]
struct ParentStateInner {
    fetch_token: Option<u64>,
    /// Cursor into the store cache's fixed insertion order, per connection.
    /// Monotonically non-decreasing within one epoch.
    positions: HashMap<ConnectionId, usize>,
    busy: bool,
    fetched: bool,
    /// `None` = unknown, `Some(true/false)` = resolved by probing.
    will_have_children: Option<bool>,
}

/// The per-parent state record driven by the coordinator.
pub struct ParentState {
    inner: OrderedMutex<ParentStateInner>,
    obsolete: AtomicBool,
}

impl Default for ParentState {
    fn default() -> Self {
        Self::new()
    }
}

impl ParentState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: OrderedMutex::new(LockLevel::ParentState, ParentStateInner::default()),
            obsolete: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn position(&self, connection: ConnectionId) -> usize {
        self.inner
            .lock()
            .positions
            .get(&connection)
            .copied()
            .unwrap_or(0)
    }

    pub fn increment_position(&self, connection: ConnectionId) {
        *self.inner.lock().positions.entry(connection).or_insert(0) += 1;
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.lock().busy
    }

    pub fn set_busy(&self, busy: bool) {
        self.inner.lock().busy = busy;
    }

    #[must_use]
    pub fn is_fetched(&self) -> bool {
        self.inner.lock().fetched
    }

    pub fn set_fetched(&self, fetched: bool) {
        self.inner.lock().fetched = fetched;
    }

    #[must_use]
    pub fn fetch_token(&self) -> Option<u64> {
        self.inner.lock().fetch_token
    }

    pub fn set_fetch_token(&self, token: u64) {
        self.inner.lock().fetch_token = Some(token);
    }

    #[must_use]
    pub fn will_have_children(&self) -> Option<bool> {
        self.inner.lock().will_have_children
    }

    pub fn set_will_have_children(&self, value: Option<bool>) {
        self.inner.lock().will_have_children = value;
    }

    /// Mark the owning consumer discarded.  All further callback delivery
    /// for this parent becomes a silent no-op.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    pub fn reset(&self, new_token: u64) {
        let mut inner = self.inner.lock();
        inner.fetch_token = Some(new_token);
        inner.positions.clear();
        inner.busy = false;
        inner.fetched = false;
        inner.will_have_children = None;
    }
}

impl fmt::Debug for ParentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ParentState")
            .field("fetch_token", &inner.fetch_token)
            .field("busy", &inner.busy)
            .field("fetched", &inner.fetched)
            .field("will_have_children", &inner.will_have_children)
            .field("obsolete", &self.is_obsolete())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Stock implementations
// ---------------------------------------------------------------------------

/// An unfiltered, list-model shaped parent: accepts everything, keeps
/// delivered items in delivery order.
pub struct ListParent {
    item_type: ItemType,
    chunk_size: ChunkSize,
    state: ParentState,
    items: OrderedMutex<Vec<Item>>,
}

impl ListParent {
    #[must_use]
    pub fn new(item_type: ItemType, chunk_size: ChunkSize) -> Self {
        Self {
            item_type,
            chunk_size,
            state: ParentState::new(),
            items: OrderedMutex::new(LockLevel::ParentItems, Vec::new()),
        }
    }

    /// Items delivered so far, in delivery order.
    #[must_use]
    pub fn items(&self) -> Vec<Item> {
        self.items.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn mark_obsolete(&self) {
        self.state.mark_obsolete();
    }
}

impl FetchParent for ListParent {
    fn fetch_item_type(&self) -> ItemType {
        self.item_type.clone()
    }

    fn state(&self) -> &ParentState {
        &self.state
    }

    fn chunk_size(&self) -> ChunkSize {
        self.chunk_size
    }

    fn accepts_item(&self, _item: &Item, _ctx: &FetchContext<'_>) -> bool {
        true
    }

    fn add_item(&self, item: &Item, _ctx: &FetchContext<'_>) {
        self.items.lock().push(item.clone());
    }

    fn update_item(&self, item: &Item, _ctx: &FetchContext<'_>) {
        let mut items = self.items.lock();
        if let Some(slot) = items.iter_mut().find(|existing| existing.id == item.id) {
            *slot = item.clone();
        }
    }

    fn remove_item(&self, item: &Item, _ctx: &FetchContext<'_>) {
        self.items.lock().retain(|existing| existing.id != item.id);
    }
}

type AcceptFn = dyn Fn(&Item) -> bool + Send + Sync;

/// A predicate-filtered parent, tree-node shaped: only items matching
/// `accepts` are delivered, and an optional `shows` predicate controls
/// which of them count against the chunk size.
pub struct FilteredParent {
    item_type: ItemType,
    chunk_size: ChunkSize,
    state: ParentState,
    accepts: Box<AcceptFn>,
    shows: Option<Box<AcceptFn>>,
    items: OrderedMutex<Vec<ItemId>>,
}

impl FilteredParent {
    pub fn new(
        item_type: ItemType,
        chunk_size: ChunkSize,
        accepts: impl Fn(&Item) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            item_type,
            chunk_size,
            state: ParentState::new(),
            accepts: Box::new(accepts),
            shows: None,
            items: OrderedMutex::new(LockLevel::ParentItems, Vec::new()),
        }
    }

    #[must_use]
    pub fn with_shows(mut self, shows: impl Fn(&Item) -> bool + Send + Sync + 'static) -> Self {
        self.shows = Some(Box::new(shows));
        self
    }

    /// Ids of delivered items, in delivery order.
    #[must_use]
    pub fn item_ids(&self) -> Vec<ItemId> {
        self.items.lock().clone()
    }

    pub fn mark_obsolete(&self) {
        self.state.mark_obsolete();
    }
}

impl FetchParent for FilteredParent {
    fn fetch_item_type(&self) -> ItemType {
        self.item_type.clone()
    }

    fn state(&self) -> &ParentState {
        &self.state
    }

    fn chunk_size(&self) -> ChunkSize {
        self.chunk_size
    }

    fn accepts_item(&self, item: &Item, _ctx: &FetchContext<'_>) -> bool {
        (self.accepts)(item)
    }

    fn shows_item(&self, item: &Item, _ctx: &FetchContext<'_>) -> bool {
        self.shows.as_ref().is_none_or(|shows| shows(item))
    }

    fn add_item(&self, item: &Item, _ctx: &FetchContext<'_>) {
        self.items.lock().push(item.id);
    }

    fn update_item(&self, _item: &Item, _ctx: &FetchContext<'_>) {}

    fn remove_item(&self, item: &Item, _ctx: &FetchContext<'_>) {
        self.items.lock().retain(|id| *id != item.id);
    }
}

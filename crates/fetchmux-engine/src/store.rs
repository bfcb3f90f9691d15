//! The backing-store adapter boundary.
//!
//! The engine never executes SQL or touches a wire protocol; it talks to a
//! [`BackingStore`] implementation through this trait.  The adapter owns an
//! **ordered, append-only, per-item-type cache** of already-retrieved rows
//! and an `advance_query` primitive that pulls the next batch into that
//! cache.  Everything else (connection establishment, transactions,
//! persistence formats) lives behind the adapter.
//!
//! Thread-safety contract: `advance_query` and the mutation/session
//! primitives are only ever invoked from the connection's sequential worker,
//! so adapters may assume a single caller for those.  The cache read methods
//! (`cached_len`, `cached_ids_from`, `get_item`, `is_exhausted`) are called
//! concurrently from the consumer-facing side and must be safe alongside an
//! in-flight `advance_query`.

use fetchmux_core::{Item, ItemError, ItemId, ItemType, StoreResult};

/// Item type under which the store exposes its commit history rows.
///
/// Chunks of this type are excluded from the commit cache (a commit row does
/// not belong to itself).
pub const COMMIT_ITEM_TYPE: &str = "commit";

/// One relational backing store, as consumed by the fetch coordinator.
pub trait BackingStore: Send + Sync {
    /// Item types this store can serve.  Used by `fetch_all` when the caller
    /// does not name explicit types.
    fn known_item_types(&self) -> Vec<ItemType>;

    /// Number of rows of `item_type` currently in the fetch cache.
    fn cached_len(&self, item_type: &ItemType) -> usize;

    /// Ids of cached rows of `item_type` starting at `position`, in
    /// insertion order.  A parent's position is a pure index into this
    /// fixed order.
    fn cached_ids_from(&self, item_type: &ItemType, position: usize) -> Vec<ItemId>;

    /// Look up one cached row.
    fn get_item(&self, item_type: &ItemType, id: ItemId) -> Option<Item>;

    /// Whether the store has no more rows of `item_type` to fetch.
    fn is_exhausted(&self, item_type: &ItemType) -> bool;

    /// Pull the next batch of rows of `item_type` into the cache and return
    /// it.  An empty chunk means the type is exhausted.
    fn advance_query(&self, item_type: &ItemType) -> StoreResult<Vec<Item>>;

    /// Insert items.  Returns the successfully inserted subset (with ids
    /// assigned) alongside per-item validation errors; the batch never fails
    /// as a whole for validation reasons.
    fn add_items(
        &self,
        item_type: &ItemType,
        items: Vec<Item>,
        validate: bool,
    ) -> StoreResult<(Vec<Item>, Vec<ItemError>)>;

    /// Update items in place, keyed by id.  Same partial-success shape as
    /// [`BackingStore::add_items`].
    fn update_items(
        &self,
        item_type: &ItemType,
        items: Vec<Item>,
        validate: bool,
    ) -> StoreResult<(Vec<Item>, Vec<ItemError>)>;

    /// Mark items removed (rows stay cached, `valid` flips off).  Returns the
    /// affected items; unknown ids are skipped.
    fn remove_items(&self, item_type: &ItemType, ids: &[ItemId]) -> StoreResult<Vec<Item>>;

    /// Re-validate previously removed items.  Returns the affected items.
    fn restore_items(&self, item_type: &ItemType, ids: &[ItemId]) -> StoreResult<Vec<Item>>;

    /// Persist the session's pending changes.
    fn commit_session(&self, message: &str) -> StoreResult<()>;

    /// Discard the session's pending changes.
    fn rollback_session(&self) -> StoreResult<()>;

    /// Drop fetch state so committed data is re-fetched from scratch.
    fn refresh_session(&self) -> StoreResult<()>;

    /// Whether the session holds uncommitted changes.
    fn has_pending_changes(&self) -> bool;
}

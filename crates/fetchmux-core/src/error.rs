//! Error types shared across the engine.
//!
//! Two distinct failure shapes (see also the coordinator's routing rules):
//!
//! - [`StoreError`]: a store-level operation failed as a whole (commit on a
//!   stale session, lost connectivity, closed handle).  Caught at the
//!   coordinator boundary and routed to the connection's error channel;
//!   never raised across the consumer boundary.
//! - [`ItemError`]: one item of a mutation batch was rejected.  Returned
//!   alongside the successfully processed subset; processing continues for
//!   the rest of the batch.

use thiserror::Error;

use crate::intern::ItemType;
use crate::models::ItemId;

/// Store-level error raised by backing-store primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The session is stale: someone else committed since this session
    /// started, so commit/rollback cannot proceed.
    #[error("stale session: {0}")]
    StaleSession(String),

    /// The store is unreachable (connectivity loss, file gone, …).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The connection handle was closed; no further operations are possible.
    #[error("connection closed")]
    ConnectionClosed,

    /// Nothing to commit.
    #[error("nothing to commit")]
    NothingToCommit,

    /// Nothing to roll back.
    #[error("nothing to rollback")]
    NothingToRollback,

    /// Unknown item type for this store.
    #[error("unknown item type: {0}")]
    UnknownItemType(ItemType),

    /// Catch-all for adapter-internal failures.
    #[error("store error: {0}")]
    Internal(String),
}

/// Result alias for store-level operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A per-item validation failure within a mutation batch.  Non-fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {item_type} item{}: {message}", .id.map(|i| format!(" {i}")).unwrap_or_default())]
pub struct ItemError {
    pub item_type: ItemType,
    /// Id of the offending item, when it had one (inserts may fail before
    /// an id is assigned).
    pub id: Option<ItemId>,
    pub message: String,
}

impl ItemError {
    #[must_use]
    pub fn new(item_type: ItemType, id: Option<ItemId>, message: impl Into<String>) -> Self {
        Self {
            item_type,
            id,
            message: message.into(),
        }
    }
}

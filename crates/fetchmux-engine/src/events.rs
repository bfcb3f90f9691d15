//! Message types flowing between the worker, the coordinator, and the
//! application layer.
//!
//! Three channels per connection, all drained by the owning context:
//! - **Worker events**: query-advance completions, consumed by the
//!   coordinator's pump.
//! - **Session events**: mutation/session notifications for the application
//!   (icon refresh, view updates, undo bookkeeping live out there).
//! - **Error reports**: the out-of-band error channel.  Nothing in the
//!   engine raises across the consumer boundary for recoverable conditions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use fetchmux_core::{Item, ItemError, ItemType, StoreError, StoreResult};

/// Identity of one connection handle, unique within the process.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Completion message posted by the sequential worker.
#[derive(Debug)]
pub enum WorkerEvent {
    QueryAdvanced {
        item_type: ItemType,
        result: StoreResult<Vec<Item>>,
    },
}

/// Notification for the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ItemsAdded {
        item_type: ItemType,
        items: Vec<Item>,
    },
    ItemsUpdated {
        item_type: ItemType,
        items: Vec<Item>,
    },
    ItemsRemoved {
        item_type: ItemType,
        items: Vec<Item>,
    },
    Committed {
        message: String,
    },
    RolledBack,
    Refreshed,
}

/// Out-of-band failure report, keyed by connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorReport {
    /// A store-level operation failed as a whole; local state is unchanged.
    Store {
        connection: ConnectionId,
        error: StoreError,
    },
    /// Some items of a mutation batch were rejected; the rest went through.
    Validation {
        connection: ConnectionId,
        errors: Vec<ItemError>,
    },
}

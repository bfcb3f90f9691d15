//! Incremental fetch-and-cache coordination engine.
//!
//! A [`Connection`] wraps one [`BackingStore`] behind a sequential worker
//! thread and a [`FetchCoordinator`].  Consumers implement [`FetchParent`]
//! (or use the stock [`ListParent`]/[`FilteredParent`]) and drive fetching
//! with `can_fetch_more`/`fetch_more`; the engine handles chunking,
//! single-flight query advances, epoch invalidation, will-have-children
//! probing, and mutation propagation to bound parents.
//!
//! Nothing here blocks on the store from the consumer side except the
//! explicitly synchronous mutation and session calls; fetch completions are
//! applied by [`Connection::pump`].

#![forbid(unsafe_code)]

pub mod commit_cache;
pub mod connection;
pub mod coordinator;
pub mod events;
pub mod memstore;
pub mod metrics;
pub mod parent;
pub mod store;
pub mod subscription;
pub mod worker;

pub use commit_cache::CommitCache;
pub use connection::Connection;
pub use coordinator::FetchCoordinator;
pub use events::{ConnectionId, ErrorReport, SessionEvent, WorkerEvent};
pub use memstore::MemoryStore;
pub use metrics::{FetchMetrics, FetchMetricsSnapshot};
pub use parent::{
    ChunkSize, FetchContext, FetchParent, FilteredParent, ListParent, ParentKey, ParentState,
    parent_key,
};
pub use store::{BackingStore, COMMIT_ITEM_TYPE};
pub use subscription::{MutationKind, SubscriptionRegistry};
pub use worker::SequentialWorker;

pub use fetchmux_core::{
    CommitId, EngineConfig, Item, ItemError, ItemId, ItemType, StoreError, StoreResult,
};

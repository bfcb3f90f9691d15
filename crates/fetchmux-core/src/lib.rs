//! Core types for fetchmux
//!
//! This crate provides the primitives shared by the store adapter and the
//! fetch engine:
//! - Interned item-type names ([`ItemType`])
//! - The item model ([`Item`], [`ItemId`], [`CommitId`])
//! - The global lock hierarchy ([`OrderedMutex`], [`OrderedRwLock`])
//! - Engine configuration ([`EngineConfig`])
//! - The shared error taxonomy ([`StoreError`], [`ItemError`])

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod intern;
pub mod lock_order;
pub mod models;

pub use config::{DEFAULT_CHUNK_SIZE, DEFAULT_WORKER_QUEUE_CAPACITY, EngineConfig};
pub use error::{ItemError, StoreError, StoreResult};
pub use intern::{ItemType, intern, intern_count};
pub use lock_order::{LockLevel, OrderedMutex, OrderedRwLock};
pub use models::{CommitId, Item, ItemId};

//! Item model shared between the store adapter and the engine.
//!
//! An [`Item`] is one row of one item type: an id, an ordered field map, and
//! a validity flag.  Removal never deletes a row from the per-type cache
//! (the cache is append-only); it flips `valid` off, and restore flips it
//! back on.  This is what lets a parent that was bound to an item keep
//! receiving restore/update/remove notifications across the item's lifetime.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a single item within its item type.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the commit an item belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(pub u64);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of structured entity/parameter data.
///
/// Field order is preserved (`serde_json::Map` with `preserve_order`), which
/// keeps serialized items stable for diffing and display.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    /// Commit this row was fetched under, if the store tracks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<CommitId>,
    /// Whether the row is currently live.  Removed rows stay cached with
    /// `valid = false` until restored.
    #[serde(default = "default_valid")]
    pub valid: bool,
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
}

const fn default_valid() -> bool {
    true
}

impl Item {
    /// A fresh, valid item with no fields.
    #[must_use]
    pub fn new(id: ItemId) -> Self {
        Self {
            id,
            commit_id: None,
            valid: true,
            fields: serde_json::Map::new(),
        }
    }

    /// Builder-style field insertion.
    #[must_use]
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Builder-style commit stamp.
    #[must_use]
    pub const fn with_commit(mut self, commit_id: CommitId) -> Self {
        self.commit_id = Some(commit_id);
        self
    }

    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Validity flag, matching the store adapter's `item.is_valid()` primitive.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    /// Overlay `patch` onto this item's fields, replacing existing keys.
    pub fn apply_update(&mut self, patch: &serde_json::Map<String, Value>) {
        for (key, value) in patch {
            self.fields.insert(key.clone(), value.clone());
        }
    }
}

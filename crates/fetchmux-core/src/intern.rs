//! Process-global interning for item-type names.
//!
//! Every cache key, registry bucket, worker job, and session event carries
//! the name of an item type ("entity", "parameter_value", "alternative", …).
//! These few dozen strings are duplicated across thousands of places, so
//! `ItemType` is a newtype over `Arc<str>` that deduplicates them in a global
//! intern table.
//!
//! **Clone cost:** one atomic ref-count increment (vs. heap alloc + memcpy for String).
//!
//! **Interning cost:** one mutex acquisition on first encounter; subsequent
//! lookups of the same string value return the existing `Arc` (O(1) amortized).

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, LazyLock, Mutex};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// ItemType
// ---------------------------------------------------------------------------

/// An interned item-type name.
///
/// Cheap to clone (atomic ref-count bump), cheap to compare by pointer when
/// both sides came from the interner, and transparently usable as `&str`.
#[derive(Clone)]
pub struct ItemType(Arc<str>);

impl ItemType {
    /// Intern a type name, returning a shared handle.
    ///
    /// If the name was seen before, the existing `Arc` is reused.
    #[inline]
    #[must_use]
    pub fn new(name: &str) -> Self {
        intern(name)
    }

    /// Return the underlying `Arc<str>` (useful for embedding in structs
    /// that already store `Arc<str>`).
    #[inline]
    #[must_use]
    pub fn into_arc(self) -> Arc<str> {
        self.0
    }

    /// Pointer-equality fast path: true when both handles point to the
    /// same interned allocation.  Falls back to byte comparison otherwise.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// --- Transparent &str access ---

impl Deref for ItemType {
    type Target = str;

    #[inline]
    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ItemType {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for ItemType {
    #[inline]
    fn borrow(&self) -> &str {
        &self.0
    }
}

// --- Equality / Hash (by string content, not pointer) ---

impl PartialEq for ItemType {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        // Fast path: same Arc → same name.
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl Eq for ItemType {}

impl PartialEq<str> for ItemType {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for ItemType {
    #[inline]
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

impl Hash for ItemType {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        (*self.0).hash(state);
    }
}

impl PartialOrd for ItemType {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ItemType {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self.0).cmp(&*other.0)
    }
}

// --- Display / Debug ---

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemType({:?})", &*self.0)
    }
}

// --- From conversions ---

impl From<&str> for ItemType {
    #[inline]
    fn from(s: &str) -> Self {
        intern(s)
    }
}

impl From<String> for ItemType {
    #[inline]
    fn from(s: String) -> Self {
        intern(&s)
    }
}

impl From<ItemType> for String {
    #[inline]
    fn from(t: ItemType) -> Self {
        t.0.to_string()
    }
}

// --- Serde ---

impl Serialize for ItemType {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ItemType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(intern(&s))
    }
}

// ---------------------------------------------------------------------------
// Global interner
// ---------------------------------------------------------------------------

/// The global intern table.  Uses a plain `Mutex` (not `OrderedMutex`) because
/// the interner is a leaf lock that is never held while acquiring other locks.
static INTERNER: LazyLock<Mutex<HashSet<Arc<str>>>> =
    LazyLock::new(|| Mutex::new(HashSet::with_capacity(64)));

/// Intern a type name, returning a shared `ItemType`.
///
/// Thread-safe.  The mutex is only contended on first encounter of a new
/// name; subsequent calls for known names are a hash lookup + Arc clone.
pub fn intern(s: &str) -> ItemType {
    let mut table = INTERNER
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    // Can't use map_or_else: get() borrows immutably, insert() borrows mutably.
    #[allow(clippy::option_if_let_else)]
    let result = if let Some(existing) = table.get(s) {
        ItemType(Arc::clone(existing))
    } else {
        let arc: Arc<str> = Arc::from(s);
        table.insert(Arc::clone(&arc));
        tracing::trace!(name = s, total = table.len(), "interned new item type");
        ItemType(arc)
    };
    drop(table);
    result
}

/// Number of unique type names currently interned.
#[must_use]
pub fn intern_count() -> usize {
    INTERNER
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .len()
}

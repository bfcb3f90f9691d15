//! Lock ordering + debug-only deadlock prevention utilities.
//!
//! This module defines a **global lock hierarchy** for the locks that may be
//! acquired across the engine's layers (store cache / coordinator / sinks).
//! A coordinator pump step can touch the store cache, the parent registry,
//! and the commit cache in one pass; a single inconsistent acquisition order
//! would deadlock the whole connection.
//!
//! Design goals:
//! - **Zero release overhead**: ordering checks compile to no-ops outside
//!   `debug_assertions`.
//! - **Fail fast in debug**: panic *before* attempting an out-of-order lock.
//! - **Incremental adoption**: wrap only the locks that matter.
//!
//! Rule (strict):
//! - When a thread already holds any lock(s), it may only acquire locks with a
//!   strictly higher `LockLevel::rank()`.
//!
//! If you need multiple locks, acquire them in ascending rank order, keep the
//! critical section tiny, and never hold these locks across blocking IO.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Global lock hierarchy.
///
/// Lower rank must be acquired before higher rank when locks are nested.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockLevel {
    // ---------------------------------------------------------------------
    // Coordinator layer
    // ---------------------------------------------------------------------
    CoordinatorRegistry,
    CoordinatorCommitCache,

    // ---------------------------------------------------------------------
    // Store layer (acquired inside registry critical sections when the
    // coordinator drains cached rows into a parent)
    // ---------------------------------------------------------------------
    StoreCache,
    StoreStaged,

    // ---------------------------------------------------------------------
    // Leaf state (never nests further)
    // ---------------------------------------------------------------------
    ParentState,
    ParentItems,
    WorkerHandle,
}

impl LockLevel {
    /// Total order rank. Must be unique per variant.
    #[must_use]
    pub const fn rank(self) -> u16 {
        match self {
            // Coordinator
            Self::CoordinatorRegistry => 10,
            Self::CoordinatorCommitCache => 20,

            // Store
            Self::StoreCache => 30,
            Self::StoreStaged => 31,

            // Leaves
            Self::ParentState => 40,
            Self::ParentItems => 45,
            Self::WorkerHandle => 50,
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}@{}", self.rank())
    }
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD_LOCKS: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
}

#[inline]
fn check_before_acquire(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| {
        let held = held.borrow();
        let Some(&last) = held.last() else {
            return;
        };
        assert!(
            level.rank() > last.rank(),
            "lock order violation: attempting to acquire {} while holding {}. held={:?}",
            level,
            last,
            held.as_slice()
        );
    });
    #[cfg(not(debug_assertions))]
    let _ = level;
}

#[inline]
fn did_acquire(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| held.borrow_mut().push(level));
    #[cfg(not(debug_assertions))]
    let _ = level;
}

#[inline]
fn did_release(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| {
        let mut held = held.borrow_mut();
        let last = held.pop();
        assert!(
            last == Some(level),
            "lock tracking corrupted: expected to release {}, popped={:?}, held={:?}",
            level,
            last,
            held.as_slice()
        );
    });
    #[cfg(not(debug_assertions))]
    let _ = level;
}

/// Mutex wrapper that enforces the global lock hierarchy in debug builds.
#[derive(Debug)]
pub struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    #[must_use]
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    #[must_use]
    pub const fn level(&self) -> LockLevel {
        self.level
    }

    pub fn lock(&self) -> OrderedMutexGuard<'_, T> {
        check_before_acquire(self.level);
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        did_acquire(self.level);
        OrderedMutexGuard {
            level: self.level,
            guard,
        }
    }

}

pub struct OrderedMutexGuard<'a, T> {
    level: LockLevel,
    guard: MutexGuard<'a, T>,
}

impl<T> Drop for OrderedMutexGuard<'_, T> {
    fn drop(&mut self) {
        did_release(self.level);
    }
}

impl<T> Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// `RwLock` wrapper that enforces the global lock hierarchy in debug builds.
#[derive(Debug)]
pub struct OrderedRwLock<T> {
    level: LockLevel,
    inner: RwLock<T>,
}

impl<T> OrderedRwLock<T> {
    #[must_use]
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: RwLock::new(value),
        }
    }

    #[must_use]
    pub const fn level(&self) -> LockLevel {
        self.level
    }

    pub fn read(&self) -> OrderedRwLockReadGuard<'_, T> {
        check_before_acquire(self.level);
        let guard = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        did_acquire(self.level);
        OrderedRwLockReadGuard {
            level: self.level,
            guard,
        }
    }

    pub fn write(&self) -> OrderedRwLockWriteGuard<'_, T> {
        check_before_acquire(self.level);
        let guard = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        did_acquire(self.level);
        OrderedRwLockWriteGuard {
            level: self.level,
            guard,
        }
    }
}

pub struct OrderedRwLockReadGuard<'a, T> {
    level: LockLevel,
    guard: RwLockReadGuard<'a, T>,
}

impl<T> Drop for OrderedRwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        did_release(self.level);
    }
}

impl<T> Deref for OrderedRwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

pub struct OrderedRwLockWriteGuard<'a, T> {
    level: LockLevel,
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> Drop for OrderedRwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        did_release(self.level);
    }
}

impl<T> Deref for OrderedRwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for OrderedRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

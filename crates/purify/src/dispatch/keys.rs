//! Thread-local include/exclude sets of dispatch keys.
//!
//! Backends consult these sets to decide whether a call should be redirected through their
//! functionalization kernels. Every mutation goes through a guard that restores the previous
//! state on drop, so an error or panic inside a guarded scope never leaks policy changes.

use std::cell::Cell;
use std::fmt;

/// Dispatch keys tracked by the local include/exclude sets.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum DispatchKey {
    /// Redirect mutating and aliasing operators through functionalization.
    Functionalize,
}

impl DispatchKey {
    const fn bit(self) -> u64 {
        1 << (self as u8)
    }
}

/// Bit set of dispatch keys.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct DispatchKeySet(u64);

impl DispatchKeySet {
    pub const EMPTY: DispatchKeySet = DispatchKeySet(0);

    pub const fn from_key(key: DispatchKey) -> Self {
        DispatchKeySet(key.bit())
    }

    pub fn contains(self, key: DispatchKey) -> bool {
        self.0 & key.bit() != 0
    }

    pub fn with(self, key: DispatchKey) -> Self {
        DispatchKeySet(self.0 | key.bit())
    }

    pub fn union(self, other: DispatchKeySet) -> Self {
        DispatchKeySet(self.0 | other.0)
    }

    pub fn without(self, other: DispatchKeySet) -> Self {
        DispatchKeySet(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<DispatchKey> for DispatchKeySet {
    fn from(key: DispatchKey) -> Self {
        DispatchKeySet::from_key(key)
    }
}

impl fmt::Debug for DispatchKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = [DispatchKey::Functionalize];
        f.debug_set()
            .entries(keys.iter().filter(|key| self.contains(**key)))
            .finish()
    }
}

/// Snapshot of the thread-local include/exclude sets.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct LocalDispatchKeySet {
    pub included: DispatchKeySet,
    pub excluded: DispatchKeySet,
}

thread_local! {
    static LOCAL_KEYS: Cell<LocalDispatchKeySet> = const {
        Cell::new(LocalDispatchKeySet {
            included: DispatchKeySet::EMPTY,
            excluded: DispatchKeySet::EMPTY,
        })
    };
}

/// Returns the current thread's include/exclude sets.
pub fn local_keys() -> LocalDispatchKeySet {
    LOCAL_KEYS.with(Cell::get)
}

fn set_local_keys(keys: LocalDispatchKeySet) {
    LOCAL_KEYS.with(|cell| cell.set(keys));
}

pub fn is_included(key: DispatchKey) -> bool {
    local_keys().included.contains(key)
}

pub fn is_excluded(key: DispatchKey) -> bool {
    local_keys().excluded.contains(key)
}

/// Whether backends should currently redirect calls through functionalization.
pub fn functionalization_enabled() -> bool {
    is_included(DispatchKey::Functionalize) && !is_excluded(DispatchKey::Functionalize)
}

/// Adds keys to the include set for the lifetime of the guard.
#[must_use = "the keys are only included while the guard is alive"]
pub struct IncludeDispatchKeyGuard {
    previous: DispatchKeySet,
}

impl IncludeDispatchKeyGuard {
    pub fn new(keys: impl Into<DispatchKeySet>) -> Self {
        let mut local = local_keys();
        let previous = local.included;
        local.included = previous.union(keys.into());
        set_local_keys(local);
        IncludeDispatchKeyGuard { previous }
    }
}

impl Drop for IncludeDispatchKeyGuard {
    fn drop(&mut self) {
        let mut local = local_keys();
        local.included = self.previous;
        set_local_keys(local);
    }
}

/// Adds keys to the exclude set for the lifetime of the guard.
#[must_use = "the keys are only excluded while the guard is alive"]
pub struct ExcludeDispatchKeyGuard {
    previous: DispatchKeySet,
}

impl ExcludeDispatchKeyGuard {
    pub fn new(keys: impl Into<DispatchKeySet>) -> Self {
        let mut local = local_keys();
        let previous = local.excluded;
        local.excluded = previous.union(keys.into());
        set_local_keys(local);
        ExcludeDispatchKeyGuard { previous }
    }
}

impl Drop for ExcludeDispatchKeyGuard {
    fn drop(&mut self) {
        let mut local = local_keys();
        local.excluded = self.previous;
        set_local_keys(local);
    }
}

/// Forces a single key's exclusion state to `excluded` for the lifetime of the guard.
#[must_use = "the exclusion state is only forced while the guard is alive"]
pub struct SetExcludeDispatchKeyGuard {
    key: DispatchKey,
    previous: bool,
}

impl SetExcludeDispatchKeyGuard {
    pub fn new(key: DispatchKey, excluded: bool) -> Self {
        let mut local = local_keys();
        let previous = local.excluded.contains(key);
        local.excluded = if excluded {
            local.excluded.with(key)
        } else {
            local.excluded.without(key.into())
        };
        set_local_keys(local);
        SetExcludeDispatchKeyGuard { key, previous }
    }
}

impl Drop for SetExcludeDispatchKeyGuard {
    fn drop(&mut self) {
        let mut local = local_keys();
        local.excluded = if self.previous {
            local.excluded.with(self.key)
        } else {
            local.excluded.without(self.key.into())
        };
        set_local_keys(local);
    }
}

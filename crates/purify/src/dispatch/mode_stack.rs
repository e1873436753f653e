//! Thread-local stack of active dispatch modes, keyed by category.
//!
//! Each [`ModeKey`] category holds at most one active mode. Modes are stored type-erased so that
//! the stack does not depend on any backend; typed access goes through
//! [`peek_dispatch_mode`](super::peek_dispatch_mode).
//!
//! ```rust,ignore
//! let suspended = unset_mode_temporarily(ModeKey::Functional);
//! // Operations issued here bypass the functional mode.
//! drop(suspended); // the mode is restored at its previous stack position
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

/// Categories of infrastructure modes. At most one mode per category is active at a time.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ModeKey {
    Functional,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModeStackError {
    #[error("a {key:?} dispatch mode is already active on this thread")]
    AlreadyActive { key: ModeKey },
}

struct ModeSlot {
    key: ModeKey,
    mode: Rc<dyn Any>,
}

thread_local! {
    static MODE_STACK: RefCell<Vec<ModeSlot>> = const { RefCell::new(Vec::new()) };
}

/// Pushes `mode` as the active mode for `key`.
pub fn push_mode(key: ModeKey, mode: Rc<dyn Any>) -> Result<(), ModeStackError> {
    MODE_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        if stack.iter().any(|slot| slot.key == key) {
            return Err(ModeStackError::AlreadyActive { key });
        }
        log::trace!("pushing {key:?} dispatch mode");
        stack.push(ModeSlot { key, mode });
        Ok(())
    })
}

/// Removes and returns the active mode for `key`, if any.
pub fn pop_mode(key: ModeKey) -> Option<Rc<dyn Any>> {
    MODE_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let index = stack.iter().rposition(|slot| slot.key == key)?;
        log::trace!("popping {key:?} dispatch mode");
        Some(stack.remove(index).mode)
    })
}

/// Returns the active mode for `key` without removing it.
pub fn peek_mode(key: ModeKey) -> Option<Rc<dyn Any>> {
    MODE_STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|slot| slot.key == key)
            .map(|slot| Rc::clone(&slot.mode))
    })
}

pub fn is_mode_active(key: ModeKey) -> bool {
    MODE_STACK.with(|stack| stack.borrow().iter().any(|slot| slot.key == key))
}

/// Active mode categories, innermost (most recently pushed) first.
pub fn active_mode_keys() -> Vec<ModeKey> {
    MODE_STACK.with(|stack| stack.borrow().iter().rev().map(|slot| slot.key).collect())
}

/// Active modes, innermost first.
pub(crate) fn snapshot() -> Vec<(ModeKey, Rc<dyn Any>)> {
    MODE_STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .map(|slot| (slot.key, Rc::clone(&slot.mode)))
            .collect()
    })
}

/// RAII guard returned by [`unset_mode_temporarily`]; puts the suspended mode back on drop.
#[must_use = "the mode is restored as soon as the guard is dropped"]
pub struct SuspendedMode {
    key: ModeKey,
    index: usize,
    mode: Option<Rc<dyn Any>>,
}

impl SuspendedMode {
    /// The mode that was active when the guard was created.
    pub fn mode(&self) -> Option<&Rc<dyn Any>> {
        self.mode.as_ref()
    }

    pub fn key(&self) -> ModeKey {
        self.key
    }
}

impl Drop for SuspendedMode {
    fn drop(&mut self) {
        let Some(mode) = self.mode.take() else {
            return;
        };
        let key = self.key;
        MODE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.iter().any(|slot| slot.key == key) {
                log::error!("cannot restore suspended {key:?} mode: another one became active");
                return;
            }
            let index = self.index.min(stack.len());
            stack.insert(index, ModeSlot { key, mode });
        });
    }
}

/// Removes the active mode for `key` until the returned guard is dropped.
pub fn unset_mode_temporarily(key: ModeKey) -> SuspendedMode {
    MODE_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.iter().rposition(|slot| slot.key == key) {
            Some(index) => SuspendedMode {
                key,
                index,
                mode: Some(stack.remove(index).mode),
            },
            None => SuspendedMode {
                key,
                index: stack.len(),
                mode: None,
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_mode_per_key() {
        push_mode(ModeKey::Functional, Rc::new(1u8)).expect("first push succeeds");
        assert_eq!(
            push_mode(ModeKey::Functional, Rc::new(2u8)),
            Err(ModeStackError::AlreadyActive {
                key: ModeKey::Functional
            })
        );
        let popped = pop_mode(ModeKey::Functional).expect("mode was active");
        assert_eq!(popped.downcast::<u8>().ok().as_deref(), Some(&1u8));
        assert!(pop_mode(ModeKey::Functional).is_none());
    }

    #[test]
    fn suspension_restores_stack_position() {
        push_mode(ModeKey::Functional, Rc::new("functional")).expect("push functional");
        {
            let suspended = unset_mode_temporarily(ModeKey::Functional);
            assert!(suspended.mode().is_some());
            assert!(active_mode_keys().is_empty());
            let nothing = unset_mode_temporarily(ModeKey::Functional);
            assert!(nothing.mode().is_none());
        }
        assert_eq!(active_mode_keys(), vec![ModeKey::Functional]);
        pop_mode(ModeKey::Functional);
        assert!(active_mode_keys().is_empty());
    }
}

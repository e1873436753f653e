//! Runs a single operator with the `Functionalize` dispatch key forced on.
//!
//! The backend sees the key in the thread-local include set and rewrites mutating and aliasing
//! operators into their pure counterparts, recording updates on functional handles instead of
//! writing through to storage. All policy changes are scoped to the call.

use crate::backend::{FunctionalBackend, ReapplyViewsGuard};
use crate::dispatch::keys::{self, DispatchKey, IncludeDispatchKeyGuard, SetExcludeDispatchKeyGuard};
use crate::error::Result;
use crate::ops::{OpArgs, OpName, Value};

/// Panics when functionalization is already enabled above the caller.
///
/// Outputs handed back by the redirecting mode must not be wrapped a second time by an outer
/// functionalization layer, so the key may only be included while it is also excluded.
pub fn assert_functionalization_inactive(op: OpName) {
    let local = keys::local_keys();
    assert!(
        local.excluded.contains(DispatchKey::Functionalize)
            || !local.included.contains(DispatchKey::Functionalize),
        "Functionalize dispatch key is already active while redirecting {op} (local keys: {local:?})"
    );
}

/// Executes `op` on unwrapped arguments with functionalization enabled.
pub fn execute_redirected<B: FunctionalBackend>(
    backend: &B,
    op: OpName,
    args: &OpArgs<B::TensorHandle>,
    reapply_views: bool,
) -> Result<Vec<Value<B::TensorHandle>>> {
    assert_functionalization_inactive(op);
    let outputs = {
        let _unexclude = SetExcludeDispatchKeyGuard::new(DispatchKey::Functionalize, false);
        let _include = IncludeDispatchKeyGuard::new(DispatchKey::Functionalize);
        let _views = ReapplyViewsGuard::new(backend, reapply_views);
        log::trace!(
            "redirecting {op} to {} (reapply_views={reapply_views})",
            backend.backend_name()
        );
        backend.execute(op, args)
    };
    assert_functionalization_inactive(op);
    Ok(outputs?)
}

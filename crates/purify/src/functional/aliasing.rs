//! Restores aliasing on redirected outputs: in-place and `out=` results are the caller's proxies.

use crate::backend::{AliasTarget, AliasingContract, BackendError, FunctionalBackend};
use crate::dispatch::{DispatchArgs, DispatchTensor, DispatchValue};
use crate::error::Result;
use crate::ops::{OpName, Value};

/// Restores the identity contract of mutating operators on wrapped outputs.
///
/// Re-wrapping always produces fresh proxies, but an in-place or `out=` operator must hand back
/// the very object it mutated. For every output the contract marks as mutating an argument, the
/// new inner handle is propagated into the original proxy and that proxy is returned instead.
/// View outputs keep their fresh wrappers.
pub(crate) fn return_and_correct_aliasing<B: FunctionalBackend>(
    op: OpName,
    contract: &AliasingContract,
    args: &DispatchArgs<B>,
    mut outputs: Vec<DispatchValue<B>>,
) -> Result<Vec<DispatchValue<B>>> {
    for alias in contract.mutated_outputs() {
        let produced = outputs.len();
        let slot = outputs.get_mut(alias.output).ok_or_else(|| {
            BackendError::invariant(format!(
                "aliasing contract of {op} names output {} but only {produced} were produced",
                alias.output
            ))
        })?;
        let target = match &alias.target {
            AliasTarget::Positional(index) => args.arg(*index),
            AliasTarget::Keyword(name) => args.kwarg(name),
        };
        let Some(Value::Tensor(DispatchTensor::Functional(input))) = target else {
            continue;
        };
        if let Value::Tensor(DispatchTensor::Functional(fresh)) = &*slot {
            if !fresh.ptr_eq(input) {
                input.replace_elem(fresh.elem());
            }
        }
        log::debug!(
            "returning argument {:?} of {op} as output {}",
            alias.target,
            alias.output
        );
        *slot = Value::Tensor(DispatchTensor::Functional(input.clone()));
    }
    Ok(outputs)
}

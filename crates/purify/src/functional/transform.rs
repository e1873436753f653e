//! Whole-function functionalization transforms.
//!
//! Two flavours exist. [`dispatch_functionalize`] wraps inputs in [`FunctionalTensor`] proxies and
//! relies on [`FunctionalTensorMode`] to intercept every operator. [`functionalize`] instead
//! marks the inputs functional at the backend level and enables the `Functionalize` key for the
//! body, so the backend rewrites operators natively and the caller only ever sees plain handles.

use std::rc::Rc;
use std::sync::Arc;

use crate::backend::{FunctionalBackend, ReapplyViewsGuard};
use crate::config::RemovalPolicy;
use crate::dispatch::keys::{DispatchKey, ExcludeDispatchKeyGuard, IncludeDispatchKeyGuard};
use crate::dispatch::{DispatchTensor, DispatchValue};
use crate::error::Result;
use crate::ops::{OpArgs, OpName};

use super::map_tensors;
use super::mode::FunctionalTensorMode;
use super::tensor::FunctionalTensor;

/// Operator used to write a functionalized input's final value back into the caller's tensor.
pub const COPY_: OpName = OpName::new("aten::copy_");

/// A tensor program over dispatch values.
pub type TensorFn<B> = Rc<dyn Fn(Vec<DispatchValue<B>>) -> Result<Vec<DispatchValue<B>>>>;

/// Functionalizes `f` with proxies and a [`FunctionalTensorMode`].
///
/// Functionalization above the mode is disabled for the duration of the call, so the backend only
/// rewrites operators when the mode redirects them.
pub fn dispatch_functionalize<B: FunctionalBackend>(backend: Arc<B>, f: TensorFn<B>) -> TensorFn<B> {
    Rc::new(move |inputs: Vec<DispatchValue<B>>| -> Result<Vec<DispatchValue<B>>> {
        let wrapped = map_tensors(inputs, |tensor| match tensor {
            DispatchTensor::Plain(handle) => Ok(DispatchTensor::Functional(
                FunctionalTensor::to_functional(&backend, &handle)?,
            )),
            other => Ok(other),
        })?;

        let _disable_above = ExcludeDispatchKeyGuard::new(DispatchKey::Functionalize);
        let mode = FunctionalTensorMode::new(Arc::clone(&backend));
        let _entered = mode.enter();
        let outputs = f(wrapped)?;
        map_tensors(outputs, |tensor| match tensor {
            DispatchTensor::Functional(functional) => {
                Ok(DispatchTensor::Plain(functional.from_functional()?))
            }
            DispatchTensor::Plain(handle) => {
                assert!(
                    !backend.is_functional(&handle),
                    "functionalized program leaked an unwrapped functional handle"
                );
                Ok(DispatchTensor::Plain(handle))
            }
            other => Ok(other),
        })
    })
}

/// Functionalizes `f` natively in the backend.
///
/// Plain tensor inputs are marked functional at `level`, the body runs with the `Functionalize`
/// key included and view re-application set by `policy`, and functional outputs are converted
/// back. Inputs the body mutated are updated in place afterwards through [`COPY_`], so callers
/// observe the same side effects as running `f` directly.
pub fn functionalize<B: FunctionalBackend>(
    backend: Arc<B>,
    f: TensorFn<B>,
    policy: RemovalPolicy,
    level: usize,
) -> TensorFn<B> {
    Rc::new(move |inputs: Vec<DispatchValue<B>>| -> Result<Vec<DispatchValue<B>>> {
        let mut marked = Vec::new();
        let wrapped = map_tensors(inputs, |tensor| match tensor {
            DispatchTensor::Plain(handle) if !backend.is_functional(&handle) => {
                let functional = backend.to_functional(&handle, level)?;
                marked.push((handle, functional.clone()));
                Ok(DispatchTensor::Plain(functional))
            }
            other => Ok(other),
        })?;

        let reapply_views = policy.reapply_views();
        let outputs = {
            let _include = IncludeDispatchKeyGuard::new(DispatchKey::Functionalize);
            let _views = ReapplyViewsGuard::new(backend.as_ref(), reapply_views);
            f(wrapped)?
        };

        for (original, functional) in &marked {
            backend.sync(functional)?;
            if !backend.was_mutated(functional) {
                continue;
            }
            let latest = backend.from_functional(functional, reapply_views)?;
            log::debug!("propagating input mutation back into {original:?}");
            backend.execute(COPY_, &OpArgs::tensors([original.clone(), latest]))?;
        }

        map_tensors(outputs, |tensor| match tensor {
            DispatchTensor::Plain(handle) if backend.is_functional(&handle) => {
                backend.sync(&handle)?;
                Ok(DispatchTensor::Plain(
                    backend.from_functional(&handle, reapply_views)?,
                ))
            }
            other => Ok(other),
        })
    })
}

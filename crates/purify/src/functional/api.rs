//! One calling convention over the three ways of functionalizing a program.
//!
//! Higher-order operators written against [`FunctionalizeApi`] work unchanged whether they run
//! under the proxy-based [`FunctionalTensorMode`](super::FunctionalTensorMode), the backend's
//! native transform, or a nested transform stack.

use std::any::Any;
use std::sync::Arc;

use crate::backend::FunctionalBackend;
use crate::config::RemovalPolicy;
use crate::dispatch::keys::{DispatchKey, ExcludeDispatchKeyGuard};
use crate::dispatch::mode_stack::SuspendedMode;
use crate::dispatch::{DispatchTensor, DispatchValue};
use crate::error::Result;

use super::map_tensors;
use super::mode::unset_functional_temporarily;
use super::tensor::FunctionalTensor;
use super::transform::{dispatch_functionalize, functionalize, TensorFn};

/// Scope returned by [`FunctionalizeApi::redispatch_to_next`]; dropping it undoes the redispatch.
#[must_use = "redispatch only lasts while the guard is alive"]
pub enum RedispatchGuard {
    /// The functional mode is suspended.
    Unset(SuspendedMode),
    /// The `Functionalize` dispatch key is excluded.
    Exclude(ExcludeDispatchKeyGuard),
    /// A transform interpreter lowered itself; the payload restores it on drop.
    Lowered(Box<dyn Any>),
}

pub trait FunctionalizeApi<B: FunctionalBackend> {
    /// Wraps every plain tensor in `values` into the adapter's functional form.
    fn wrap_tensors(&self, values: Vec<DispatchValue<B>>) -> Result<Vec<DispatchValue<B>>>;

    /// Converts every functional tensor in `values` back to a plain tensor.
    fn unwrap_tensors(&self, values: Vec<DispatchValue<B>>) -> Result<Vec<DispatchValue<B>>>;

    /// Returns a functionalized version of `f`.
    fn functionalize(&self, f: TensorFn<B>) -> TensorFn<B>;

    /// Lets operators issued while the guard is alive skip this functionalization layer.
    fn redispatch_to_next(&self) -> RedispatchGuard;
}

/// Proxy-based adapter built on [`FunctionalTensor`] and the functional mode.
pub struct DirectFunctionalizeApi<B: FunctionalBackend> {
    backend: Arc<B>,
}

impl<B: FunctionalBackend> DirectFunctionalizeApi<B> {
    pub fn new(backend: Arc<B>) -> Self {
        DirectFunctionalizeApi { backend }
    }
}

impl<B: FunctionalBackend> FunctionalizeApi<B> for DirectFunctionalizeApi<B> {
    fn wrap_tensors(&self, values: Vec<DispatchValue<B>>) -> Result<Vec<DispatchValue<B>>> {
        map_tensors(values, |tensor| match tensor {
            DispatchTensor::Plain(handle) => Ok(DispatchTensor::Functional(
                FunctionalTensor::to_functional(&self.backend, &handle)?,
            )),
            other => Ok(other),
        })
    }

    fn unwrap_tensors(&self, values: Vec<DispatchValue<B>>) -> Result<Vec<DispatchValue<B>>> {
        map_tensors(values, |tensor| match tensor {
            DispatchTensor::Functional(functional) => {
                Ok(DispatchTensor::Plain(functional.from_functional()?))
            }
            other => Ok(other),
        })
    }

    fn functionalize(&self, f: TensorFn<B>) -> TensorFn<B> {
        dispatch_functionalize(Arc::clone(&self.backend), f)
    }

    fn redispatch_to_next(&self) -> RedispatchGuard {
        let (suspended, _) = unset_functional_temporarily::<B>();
        RedispatchGuard::Unset(suspended)
    }
}

fn wrap_native<B: FunctionalBackend>(
    backend: &B,
    values: Vec<DispatchValue<B>>,
    level: usize,
) -> Result<Vec<DispatchValue<B>>> {
    map_tensors(values, |tensor| match tensor {
        DispatchTensor::Plain(handle) if !backend.is_functional(&handle) => {
            Ok(DispatchTensor::Plain(backend.to_functional(&handle, level)?))
        }
        other => Ok(other),
    })
}

fn unwrap_native<B: FunctionalBackend>(
    backend: &B,
    values: Vec<DispatchValue<B>>,
    reapply_views: bool,
) -> Result<Vec<DispatchValue<B>>> {
    map_tensors(values, |tensor| match tensor {
        DispatchTensor::Plain(handle) if backend.is_functional(&handle) => {
            backend.sync(&handle)?;
            Ok(DispatchTensor::Plain(
                backend.from_functional(&handle, reapply_views)?,
            ))
        }
        other => Ok(other),
    })
}

/// Adapter over the backend's native functional tensors at nesting level 0.
pub struct NativeFunctionalizeApi<B: FunctionalBackend> {
    backend: Arc<B>,
}

impl<B: FunctionalBackend> NativeFunctionalizeApi<B> {
    pub fn new(backend: Arc<B>) -> Self {
        NativeFunctionalizeApi { backend }
    }
}

impl<B: FunctionalBackend> FunctionalizeApi<B> for NativeFunctionalizeApi<B> {
    fn wrap_tensors(&self, values: Vec<DispatchValue<B>>) -> Result<Vec<DispatchValue<B>>> {
        wrap_native(self.backend.as_ref(), values, 0)
    }

    fn unwrap_tensors(&self, values: Vec<DispatchValue<B>>) -> Result<Vec<DispatchValue<B>>> {
        let reapply_views = self.backend.reapply_views();
        unwrap_native(self.backend.as_ref(), values, reapply_views)
    }

    fn functionalize(&self, f: TensorFn<B>) -> TensorFn<B> {
        functionalize(Arc::clone(&self.backend), f, RemovalPolicy::Mutations, 0)
    }

    fn redispatch_to_next(&self) -> RedispatchGuard {
        RedispatchGuard::Exclude(ExcludeDispatchKeyGuard::new(DispatchKey::Functionalize))
    }
}

/// A level of a transform stack that functionalizes the programs it interprets.
pub trait TransformInterpreter {
    /// Nesting level of this transform.
    fn level(&self) -> usize;

    /// Whether views are added back after functionalizing.
    fn functionalize_add_back_views(&self) -> bool;

    /// Temporarily hands control to the next transform down the stack.
    fn lower(&self) -> Box<dyn Any>;
}

/// Adapter for functionalization running as one level of a transform stack.
pub struct TransformFunctionalizeApi<B: FunctionalBackend, I: TransformInterpreter> {
    backend: Arc<B>,
    interpreter: I,
}

impl<B: FunctionalBackend, I: TransformInterpreter> TransformFunctionalizeApi<B, I> {
    pub fn new(backend: Arc<B>, interpreter: I) -> Self {
        TransformFunctionalizeApi {
            backend,
            interpreter,
        }
    }

    pub fn interpreter(&self) -> &I {
        &self.interpreter
    }
}

impl<B: FunctionalBackend, I: TransformInterpreter> FunctionalizeApi<B>
    for TransformFunctionalizeApi<B, I>
{
    fn wrap_tensors(&self, values: Vec<DispatchValue<B>>) -> Result<Vec<DispatchValue<B>>> {
        wrap_native(self.backend.as_ref(), values, self.interpreter.level())
    }

    fn unwrap_tensors(&self, values: Vec<DispatchValue<B>>) -> Result<Vec<DispatchValue<B>>> {
        let reapply_views = self.interpreter.functionalize_add_back_views();
        unwrap_native(self.backend.as_ref(), values, reapply_views)
    }

    fn functionalize(&self, f: TensorFn<B>) -> TensorFn<B> {
        let policy =
            RemovalPolicy::from_add_back_views(self.interpreter.functionalize_add_back_views());
        functionalize(
            Arc::clone(&self.backend),
            f,
            policy,
            self.interpreter.level(),
        )
    }

    fn redispatch_to_next(&self) -> RedispatchGuard {
        RedispatchGuard::Lowered(self.interpreter.lower())
    }
}

//! Functionalization of mutating and aliasing tensor operators.
//!
//! [`FunctionalTensor`] marks a backend handle as functional, [`FunctionalTensorMode`] intercepts
//! operators issued on such tensors and runs them through [`redirect::execute_redirected`], and
//! the [`api`] adapters expose one calling convention over the proxy-based, native and
//! transform-stack flavours.

pub(crate) mod aliasing;
pub mod api;
pub mod mode;
pub mod redirect;
pub mod tensor;
pub mod transform;

use crate::backend::FunctionalBackend;
use crate::dispatch::{DispatchTensor, DispatchValue};
use crate::error::Result;

pub use api::{
    DirectFunctionalizeApi, FunctionalizeApi, NativeFunctionalizeApi, RedispatchGuard,
    TransformFunctionalizeApi, TransformInterpreter,
};
pub use mode::{
    maybe_disable_functional_mode, unset_functional_temporarily, FunctionalModeGuard,
    FunctionalTensorMode,
};
pub use tensor::FunctionalTensor;
pub use transform::{dispatch_functionalize, functionalize, TensorFn};

/// Applies `f` to every tensor in `values`, preserving nesting.
pub(crate) fn map_tensors<B, F>(values: Vec<DispatchValue<B>>, mut f: F) -> Result<Vec<DispatchValue<B>>>
where
    B: FunctionalBackend,
    F: FnMut(DispatchTensor<B>) -> Result<DispatchTensor<B>>,
{
    values
        .into_iter()
        .map(|value| value.try_map(&mut f))
        .collect()
}

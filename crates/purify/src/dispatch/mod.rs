//! Operator dispatch: argument categories, interception modes and the entry point that routes a
//! call to the active modes or straight to the backend.
//!
//! ## Routing
//!
//! [`call`] resolves an operator invocation in this order:
//! 1. Metadata queries on a [`FunctionalTensor`] are answered from its inner handle.
//! 2. Active modes are consulted innermost first. A mode is suspended while it handles a call so
//!    operators issued from inside its handler are not intercepted by it again. A mode may decline
//!    a call (for example when it sees argument categories it does not understand), in which case
//!    the next mode is tried.
//! 3. Calls nobody claimed run directly on the backend when every tensor argument is plain.

pub mod keys;
pub mod mode_stack;

use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::backend::FunctionalBackend;
use crate::error::{FunctionalizeError, Result};
use crate::functional::tensor::{FunctionalTensor, MetadataQuery};
use crate::ops::{OpArgs, OpName, Value};

pub use keys::{
    DispatchKey, DispatchKeySet, ExcludeDispatchKeyGuard, IncludeDispatchKeyGuard,
    LocalDispatchKeySet, SetExcludeDispatchKeyGuard,
};
pub use mode_stack::{ModeKey, ModeStackError, SuspendedMode};

/// Tensor argument as seen by the dispatcher.
pub enum DispatchTensor<B: FunctionalBackend> {
    /// A backend handle that is not wrapped by this layer.
    Plain(B::TensorHandle),
    /// A functionalization proxy.
    Functional(FunctionalTensor<B>),
    /// A tensor owned by some other interception layer.
    Foreign(ForeignTensor),
}

impl<B: FunctionalBackend> DispatchTensor<B> {
    pub fn category(&self) -> ArgCategory {
        match self {
            DispatchTensor::Plain(_) => ArgCategory::Plain,
            DispatchTensor::Functional(_) => ArgCategory::Wrapped,
            DispatchTensor::Foreign(_) => ArgCategory::Other,
        }
    }

    pub fn as_plain(&self) -> Option<&B::TensorHandle> {
        match self {
            DispatchTensor::Plain(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn as_functional(&self) -> Option<&FunctionalTensor<B>> {
        match self {
            DispatchTensor::Functional(tensor) => Some(tensor),
            _ => None,
        }
    }
}

impl<B: FunctionalBackend> Clone for DispatchTensor<B> {
    fn clone(&self) -> Self {
        match self {
            DispatchTensor::Plain(handle) => DispatchTensor::Plain(handle.clone()),
            DispatchTensor::Functional(tensor) => DispatchTensor::Functional(tensor.clone()),
            DispatchTensor::Foreign(tensor) => DispatchTensor::Foreign(tensor.clone()),
        }
    }
}

impl<B: FunctionalBackend> fmt::Debug for DispatchTensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchTensor::Plain(handle) => write!(f, "Plain({handle:?})"),
            DispatchTensor::Functional(tensor) => write!(f, "{tensor:?}"),
            DispatchTensor::Foreign(tensor) => write!(f, "{tensor:?}"),
        }
    }
}

/// Opaque tensor subclass belonging to another interception layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignTensor {
    type_name: String,
}

impl ForeignTensor {
    pub fn new(type_name: impl Into<String>) -> Self {
        ForeignTensor {
            type_name: type_name.into(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

/// Closed set of argument categories recognized by interception logic.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ArgCategory {
    Plain,
    Wrapped,
    Other,
}

pub type DispatchValue<B> = Value<DispatchTensor<B>>;
pub type DispatchArgs<B> = OpArgs<DispatchTensor<B>>;

/// Distinct argument categories of a call, in first-seen order.
pub fn arg_categories<B: FunctionalBackend>(args: &DispatchArgs<B>) -> SmallVec<[ArgCategory; 3]> {
    let mut categories = SmallVec::new();
    args.for_each_tensor(|tensor| {
        let category = tensor.category();
        if !categories.contains(&category) {
            categories.push(category);
        }
    });
    categories
}

/// Result of offering a call to an interception mode.
#[derive(Debug)]
pub enum DispatchOutcome<T> {
    Handled(T),
    /// The mode does not understand the call; another handler should try.
    Declined,
    Failed(FunctionalizeError),
}

impl<T> From<Result<T>> for DispatchOutcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => DispatchOutcome::Handled(value),
            Err(err) => DispatchOutcome::Failed(err),
        }
    }
}

/// An interception scope that may claim operator calls while it is on the mode stack.
pub trait DispatchMode<B: FunctionalBackend>: 'static {
    fn mode_key(&self) -> ModeKey;

    fn dispatch(
        &self,
        op: OpName,
        categories: &[ArgCategory],
        args: &DispatchArgs<B>,
    ) -> DispatchOutcome<Vec<DispatchValue<B>>>;
}

pub type ModeHandle<B> = Rc<dyn DispatchMode<B>>;

/// Pushes a typed dispatch mode onto the mode stack under its own key.
pub fn push_dispatch_mode<B: FunctionalBackend>(
    mode: ModeHandle<B>,
) -> std::result::Result<(), ModeStackError> {
    let key = mode.mode_key();
    mode_stack::push_mode(key, Rc::new(mode))
}

/// Returns the active mode for `key` if it is a dispatch mode for backend `B`.
pub fn peek_dispatch_mode<B: FunctionalBackend>(key: ModeKey) -> Option<ModeHandle<B>> {
    let entry = mode_stack::peek_mode(key)?;
    entry
        .downcast::<ModeHandle<B>>()
        .ok()
        .map(|mode| Rc::clone(&*mode))
}

/// Dispatches `op` through the active modes, falling back to direct backend execution.
pub fn call<B: FunctionalBackend>(
    backend: &B,
    op: OpName,
    args: DispatchArgs<B>,
) -> Result<Vec<DispatchValue<B>>> {
    let categories = arg_categories(&args);
    log::trace!("dispatching {op} with argument categories {categories:?}");

    if let Some(query) = MetadataQuery::from_call(op, &args)? {
        return Ok(vec![query.answer()?]);
    }

    for (key, entry) in mode_stack::snapshot() {
        let Ok(mode) = entry.downcast::<ModeHandle<B>>() else {
            continue;
        };
        let _suspended = mode_stack::unset_mode_temporarily(key);
        match mode.dispatch(op, &categories, &args) {
            DispatchOutcome::Handled(outputs) => return Ok(outputs),
            DispatchOutcome::Failed(err) => return Err(err),
            DispatchOutcome::Declined => {
                log::trace!("{key:?} mode declined {op}");
            }
        }
    }

    if categories.contains(&ArgCategory::Wrapped) {
        return Err(FunctionalizeError::ModeNotActive { op });
    }
    let plain = args.try_map(|tensor| match tensor {
        DispatchTensor::Plain(handle) => Ok(handle),
        DispatchTensor::Functional(_) | DispatchTensor::Foreign(_) => {
            Err(FunctionalizeError::Unhandled {
                op,
                categories: categories.to_vec(),
            })
        }
    })?;
    let outputs = backend.execute(op, &plain)?;
    outputs
        .into_iter()
        .map(|value| value.try_map(|handle| Ok::<_, FunctionalizeError>(DispatchTensor::Plain(handle))))
        .collect()
}

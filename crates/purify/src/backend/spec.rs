use std::fmt;

use crate::ops::{OpArgs, OpName, Value};
use crate::tensor::{GradMeta, TensorMeta};

/// Errors reported by backend executors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    Unimplemented { op: String, reason: String },
    Execution { message: String },
    /// The caller broke a backend precondition (for example wrapping a handle twice).
    Invariant { message: String },
}

impl BackendError {
    pub fn unimplemented(op: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        BackendError::Invariant {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
            BackendError::Invariant { message } => {
                write!(f, "backend invariant violated: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Where an aliased output points to among the call's arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AliasTarget {
    Positional(usize),
    Keyword(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AliasKind {
    /// The output is the argument itself after being written (in-place and `out=` variants).
    Mutates,
    /// The output shares storage with the argument but is a distinct tensor.
    View,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputAlias {
    pub output: usize,
    pub target: AliasTarget,
    pub kind: AliasKind,
}

/// Declared mapping of which outputs of an operator alias which of its arguments.
///
/// Backends declare this per operator; the functionalization layer never infers it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasingContract {
    aliases: Vec<OutputAlias>,
}

impl AliasingContract {
    /// Contract of an operator whose outputs are all fresh tensors.
    pub fn none() -> Self {
        Self::default()
    }

    /// Output 0 is positional argument 0 after mutation (`add_`, `relu_`, ...).
    pub fn inplace() -> Self {
        Self::none().with(0, AliasTarget::Positional(0), AliasKind::Mutates)
    }

    /// Output 0 is the `out=` keyword argument after mutation.
    pub fn out_variant() -> Self {
        Self::none().with(0, AliasTarget::Keyword("out"), AliasKind::Mutates)
    }

    /// Output 0 is a view of positional argument 0.
    pub fn view() -> Self {
        Self::none().with(0, AliasTarget::Positional(0), AliasKind::View)
    }

    pub fn with(mut self, output: usize, target: AliasTarget, kind: AliasKind) -> Self {
        self.aliases.push(OutputAlias {
            output,
            target,
            kind,
        });
        self
    }

    pub fn aliases(&self) -> &[OutputAlias] {
        &self.aliases
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Outputs that must be returned as the very argument object they mutate.
    pub fn mutated_outputs(&self) -> impl Iterator<Item = &OutputAlias> {
        self.aliases
            .iter()
            .filter(|alias| alias.kind == AliasKind::Mutates)
    }
}

/// Executor contract consumed by the functionalization layer.
///
/// A backend owns tensor storage and knows how to run operators, mark handles as functional (so
/// that mutations applied to them are recorded as pure updates), and convert them back. The
/// functionalization core only ever holds handles and forwards metadata queries to the backend.
pub trait FunctionalBackend: Send + Sync + 'static {
    type TensorHandle: Clone + fmt::Debug + 'static;

    /// Returns a human-readable backend identifier.
    fn backend_name(&self) -> &str;

    /// Current metadata of `tensor`. Called on every query; implementations must not assume the
    /// caller caches the answer.
    fn meta(&self, tensor: &Self::TensorHandle) -> TensorMeta;

    fn grad_meta(&self, tensor: &Self::TensorHandle) -> GradMeta;

    fn set_grad_meta(&self, tensor: &Self::TensorHandle, meta: GradMeta);

    /// Whether `tensor` is in functional form.
    fn is_functional(&self, tensor: &Self::TensorHandle) -> bool;

    /// Produces the functional form of a plain tensor at the given transform nesting level.
    fn to_functional(
        &self,
        tensor: &Self::TensorHandle,
        level: usize,
    ) -> BackendResult<Self::TensorHandle>;

    /// Converts a functional tensor back to a plain tensor holding its latest value.
    fn from_functional(
        &self,
        tensor: &Self::TensorHandle,
        reapply_views: bool,
    ) -> BackendResult<Self::TensorHandle>;

    /// Applies pending mutation bookkeeping to a functional tensor.
    fn sync(&self, tensor: &Self::TensorHandle) -> BackendResult<()>;

    /// Whether a functional tensor has been mutated since it was created.
    fn was_mutated(&self, tensor: &Self::TensorHandle) -> bool;

    /// Runs `op`. When the `Functionalize` dispatch key is active, mutations and views of
    /// functional arguments are rewritten into pure operations and reported through functional
    /// outputs.
    fn execute(
        &self,
        op: OpName,
        args: &OpArgs<Self::TensorHandle>,
    ) -> BackendResult<Vec<Value<Self::TensorHandle>>>;

    /// Toggles view re-application for functionalized programs, returning the previous setting.
    fn set_reapply_views(&self, enabled: bool) -> bool;

    fn reapply_views(&self) -> bool;

    /// Declared aliasing of `op`'s outputs onto its arguments.
    fn aliasing_contract(&self, op: OpName) -> AliasingContract;
}

/// Restores a backend's view re-application flag when dropped.
pub struct ReapplyViewsGuard<'a, B: FunctionalBackend + ?Sized> {
    backend: &'a B,
    previous: bool,
}

impl<'a, B: FunctionalBackend + ?Sized> ReapplyViewsGuard<'a, B> {
    pub fn new(backend: &'a B, enabled: bool) -> Self {
        let previous = backend.set_reapply_views(enabled);
        ReapplyViewsGuard { backend, previous }
    }
}

impl<B: FunctionalBackend + ?Sized> Drop for ReapplyViewsGuard<'_, B> {
    fn drop(&mut self) {
        self.backend.set_reapply_views(self.previous);
    }
}

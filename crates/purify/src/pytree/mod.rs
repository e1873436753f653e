//! Matching live container values against recorded tree schemas.
//!
//! [`tree_flatten`] records a [`TreeSpec`] from a value; [`tree_flatten_spec`] later walks a
//! (possibly different) live value against that spec and returns its leaves in the recorded order,
//! so positional consumers such as compiled graphs keep receiving inputs in a stable layout.
//!
//! ```rust,ignore
//! let value = TreeValue::dict([("x", TreeValue::list([1.into(), 2.into()])), ("y", 3.into())]);
//! let (_, spec) = tree_flatten(&value);
//! let leaves = tree_flatten_spec(&value, &spec, true)?; // [1, 2, 3]
//! ```

pub mod flatten;
pub mod registry;
pub mod spec;
pub mod value;

use thiserror::Error;

pub use flatten::{tree_flatten, tree_flatten_spec, tree_flatten_spec_report, FlattenReport};
pub use registry::{is_registered, register_flatten_spec, ChildMatch, FlattenSpecFn};
pub use spec::{NodeSpec, SpecContext, TreeSpec};
pub use value::{Leaf, TreeValue, TypeTag};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PytreeError {
    #[error(
        "{tag} does not have a flatten-spec function associated with it; register one with \
         register_flatten_spec before matching (custom containers in persisted specs must be \
         registered before the spec is used)"
    )]
    MissingRegistration { tag: TypeTag },
    #[error("live value does not match recorded {tag} node: expected {expected} children, found {found}")]
    StructureMismatch {
        tag: TypeTag,
        expected: usize,
        found: usize,
    },
    #[error("spec node {expected} cannot be matched against a {found} value")]
    TypeMismatch { expected: TypeTag, found: String },
    #[error("{tag} spec node declares {expected} children but has {found}")]
    ArityMismatch {
        tag: TypeTag,
        expected: usize,
        found: usize,
    },
}

//! Backend executor contract.
//!
//! Storage, kernels and the native functional-tensor representation live behind
//! [`FunctionalBackend`]; the functionalization layer only sees opaque handles.

pub mod autograd;
pub mod spec;

pub use spec::{
    AliasKind, AliasTarget, AliasingContract, BackendError, BackendResult, FunctionalBackend,
    OutputAlias, ReapplyViewsGuard,
};

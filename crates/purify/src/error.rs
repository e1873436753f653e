use thiserror::Error;

use crate::backend::BackendError;
use crate::dispatch::{ArgCategory, ModeStackError};
use crate::ops::OpName;

/// Errors surfaced by the functionalization layer.
///
/// Misuse variants indicate a programming error in the caller and are never retried.
#[derive(Debug, Error)]
pub enum FunctionalizeError {
    #[error("cannot convert to a functional tensor: the tensor is already functional")]
    AlreadyFunctional,
    #[error("FunctionalTensor must wrap a tensor the backend reports as functional")]
    NotFunctional,
    #[error(
        "attempting to dispatch {op} on a FunctionalTensor on its own; \
         use it with an active FunctionalTensorMode instead"
    )]
    ModeNotActive { op: OpName },
    #[error("no dispatch handler accepted {op} (argument categories: {categories:?})")]
    Unhandled {
        op: OpName,
        categories: Vec<ArgCategory>,
    },
    #[error("metadata query {op} expects exactly one tensor argument")]
    InvalidMetadataQuery { op: OpName },
    #[error(transparent)]
    ModeStack(#[from] ModeStackError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T, E = FunctionalizeError> = std::result::Result<T, E>;

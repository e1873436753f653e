pub mod backend;
pub mod config;
pub mod dispatch;
mod env;
pub mod error;
pub mod functional;
pub mod ops;
pub mod pytree;
pub mod tensor;

pub use backend::spec::FunctionalBackend;
pub use config::{FunctionalizeConfig, RemovalPolicy};
pub use dispatch::{call, ArgCategory, DispatchOutcome, DispatchTensor, DispatchValue};
pub use error::{FunctionalizeError, Result};
pub use functional::{FunctionalTensor, FunctionalTensorMode, FunctionalizeApi};
pub use ops::{OpArgs, OpName, Scalar, Value};
pub use tensor::{DType, Shape, TensorMeta};

//! Operation identifiers and the argument values that flow through dispatch.
//!
//! Values are generic over the tensor representation so the same containers carry proxies at the
//! dispatch layer and raw backend handles once arguments have been unwrapped.

pub mod name;
pub mod value;

pub use name::{metadata, OpName};
pub use value::{OpArgs, Scalar, Value};

//! Tensor metadata shared between the functionalization core and backends.
//!
//! The core never owns storage; these types describe what a backend handle looks like so that
//! wrappers can forward metadata queries without caching them.

pub mod dtype;
pub mod meta;
pub mod shape;

pub use dtype::DType;
pub use meta::{Device, GradMeta, Layout, MemoryFormat, TensorMeta};
pub use shape::Shape;

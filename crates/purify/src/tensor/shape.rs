//! Lightweight wrapper for tensor shapes and dimension bookkeeping.

use serde::{Deserialize, Serialize};

/// Stores the logical dimensions of a tensor. An empty dimension list is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        Shape { dims: dims.into() }
    }

    /// Shape of a zero-dimensional tensor.
    pub fn scalar() -> Self {
        Shape { dims: Vec::new() }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Row-major strides for a dense tensor of this shape.
    pub fn contiguous_strides(&self) -> Vec<usize> {
        let mut strides = vec![0; self.dims.len()];
        let mut acc = 1usize;
        for (i, dim) in self.dims.iter().enumerate().rev() {
            strides[i] = acc;
            acc *= (*dim).max(1);
        }
        strides
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims.to_vec())
    }
}

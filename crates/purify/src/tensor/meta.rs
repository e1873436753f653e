//! Strided tensor metadata and the layout predicates answered on behalf of wrappers.

use serde::{Deserialize, Serialize};

use super::{DType, Shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda(u16),
    /// Shape-only tensors without backing storage.
    Meta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    Strided,
    SparseCoo,
}

/// Memory formats understood by the contiguity predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryFormat {
    Contiguous,
    /// NHWC ordering for rank-4 tensors.
    ChannelsLast,
    /// NDHWC ordering for rank-5 tensors.
    ChannelsLast3d,
}

impl MemoryFormat {
    /// Integer encoding used when a format travels as a scalar operator argument.
    pub fn code(self) -> i64 {
        match self {
            MemoryFormat::Contiguous => 0,
            MemoryFormat::ChannelsLast => 1,
            MemoryFormat::ChannelsLast3d => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(MemoryFormat::Contiguous),
            1 => Some(MemoryFormat::ChannelsLast),
            2 => Some(MemoryFormat::ChannelsLast3d),
            _ => None,
        }
    }
}

/// Shape, strides and placement of a backend tensor handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorMeta {
    shape: Shape,
    strides: Vec<usize>,
    storage_offset: usize,
    dtype: DType,
    layout: Layout,
    device: Device,
}

impl TensorMeta {
    /// Dense row-major metadata for `shape`.
    pub fn contiguous(shape: Shape, dtype: DType, device: Device) -> Self {
        let strides = shape.contiguous_strides();
        TensorMeta {
            shape,
            strides,
            storage_offset: 0,
            dtype,
            layout: Layout::Strided,
            device,
        }
    }

    /// Explicitly strided metadata.
    ///
    /// Panics if the stride count does not match the rank.
    pub fn strided(
        shape: Shape,
        strides: Vec<usize>,
        storage_offset: usize,
        dtype: DType,
        device: Device,
    ) -> Self {
        assert_eq!(
            shape.rank(),
            strides.len(),
            "stride count {} does not match rank {}",
            strides.len(),
            shape.rank()
        );
        TensorMeta {
            shape,
            strides,
            storage_offset,
            dtype,
            layout: Layout::Strided,
            device,
        }
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn numel(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn dim(&self) -> usize {
        self.shape.rank()
    }

    /// Row-major contiguity. Singleton dimensions are contiguous regardless of stride.
    pub fn is_contiguous(&self) -> bool {
        self.is_contiguous_for(MemoryFormat::Contiguous)
    }

    /// Contiguity with respect to a memory format; channels-last formats require rank 4 or 5.
    pub fn is_contiguous_for(&self, format: MemoryFormat) -> bool {
        if self.numel() == 0 {
            return true;
        }
        match dim_order(format, self.dim()) {
            Some(order) => self.dense_in_order(&order),
            None => false,
        }
    }

    /// Whether the strides are ordered like `format`, ignoring gaps between dimensions.
    pub fn is_strides_like(&self, format: MemoryFormat) -> bool {
        if format == MemoryFormat::Contiguous {
            return false;
        }
        let Some(order) = dim_order(format, self.dim()) else {
            return false;
        };
        let mut min = 0usize;
        for &axis in &order {
            let size = self.shape.dims()[axis];
            let stride = self.strides[axis];
            if size == 1 {
                continue;
            }
            if stride < min {
                return false;
            }
            min = stride.saturating_mul(size);
        }
        true
    }

    /// True when every element occupies a distinct storage slot and the slots are packed.
    pub fn is_non_overlapping_and_dense(&self) -> bool {
        if self.dim() <= 1 {
            return self.dim() == 0 || self.shape.dims()[0] < 2 || self.strides[0] == 1;
        }
        let mut order: Vec<usize> = (0..self.dim()).collect();
        order.sort_by_key(|&axis| (self.strides[axis], self.shape.dims()[axis]));
        self.dense_in_order(&order)
    }

    /// Checks that walking `order` (innermost first) yields packed strides.
    fn dense_in_order(&self, order: &[usize]) -> bool {
        let mut expected = 1usize;
        for &axis in order {
            let size = self.shape.dims()[axis];
            if size == 1 {
                continue;
            }
            if self.strides[axis] != expected {
                return false;
            }
            expected = match expected.checked_mul(size) {
                Some(next) => next,
                None => return false,
            };
        }
        true
    }
}

/// Innermost-first dimension order for a memory format.
fn dim_order(format: MemoryFormat, rank: usize) -> Option<Vec<usize>> {
    match (format, rank) {
        (MemoryFormat::Contiguous, _) => Some((0..rank).rev().collect()),
        (MemoryFormat::ChannelsLast, 4) => Some(vec![1, 3, 2, 0]),
        (MemoryFormat::ChannelsLast3d, 5) => Some(vec![1, 4, 3, 2, 0]),
        _ => None,
    }
}

/// Gradient-tracking flags mirrored across the wrap/unwrap boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GradMeta {
    pub requires_grad: bool,
    /// Leaf tensors may be mutated by the autograd engine; non-leaves may not.
    pub is_leaf: bool,
}

impl GradMeta {
    pub fn leaf(requires_grad: bool) -> Self {
        GradMeta {
            requires_grad,
            is_leaf: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(dims: &[usize], strides: &[usize]) -> TensorMeta {
        TensorMeta::strided(
            Shape::new(dims.to_vec()),
            strides.to_vec(),
            0,
            DType::F32,
            Device::Cpu,
        )
    }

    #[test]
    fn contiguous_predicates() {
        let dense = TensorMeta::contiguous(Shape::new([2, 3]), DType::F32, Device::Cpu);
        assert_eq!(dense.strides(), &[3, 1]);
        assert!(dense.is_contiguous());
        assert!(dense.is_non_overlapping_and_dense());

        let transposed = meta(&[3, 2], &[1, 3]);
        assert!(!transposed.is_contiguous());
        assert!(transposed.is_non_overlapping_and_dense());

        let broadcast = meta(&[2, 3], &[0, 1]);
        assert!(!broadcast.is_non_overlapping_and_dense());
    }

    #[test]
    fn channels_last_layouts() {
        // N=2, C=3, H=4, W=5 stored as NHWC.
        let nhwc = meta(&[2, 3, 4, 5], &[60, 1, 15, 3]);
        assert!(nhwc.is_contiguous_for(MemoryFormat::ChannelsLast));
        assert!(nhwc.is_strides_like(MemoryFormat::ChannelsLast));
        assert!(!nhwc.is_contiguous());
        assert!(!meta(&[2, 3], &[3, 1]).is_contiguous_for(MemoryFormat::ChannelsLast));
    }

    #[test]
    fn singleton_dimensions_ignore_stride() {
        assert!(meta(&[1, 4], &[99, 1]).is_contiguous());
        assert!(TensorMeta::contiguous(Shape::scalar(), DType::F32, Device::Cpu).is_contiguous());
    }
}

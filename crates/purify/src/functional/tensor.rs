//! Proxy wrapper that marks a backend handle as participating in functionalization.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::backend::autograd::mirror_autograd_meta;
use crate::backend::FunctionalBackend;
use crate::dispatch::{DispatchArgs, DispatchTensor, DispatchValue};
use crate::error::{FunctionalizeError, Result};
use crate::ops::{metadata, OpName, Scalar, Value};
use crate::tensor::{DType, Device, GradMeta, Layout, MemoryFormat, Shape, TensorMeta};

struct Inner<B: FunctionalBackend> {
    backend: Arc<B>,
    elem: RefCell<B::TensorHandle>,
    grad: Cell<GradMeta>,
}

/// Wraps exactly one functional backend handle.
///
/// Every metadata accessor asks the backend about the current inner handle; the wrapper keeps no
/// copy of shape or stride information, so metadata mutations applied to the inner handle are
/// visible immediately. Clones share identity: two clones compare equal under
/// [`FunctionalTensor::ptr_eq`].
pub struct FunctionalTensor<B: FunctionalBackend> {
    inner: Rc<Inner<B>>,
}

impl<B: FunctionalBackend> FunctionalTensor<B> {
    /// Wraps `elem`, which the backend must already report as functional.
    pub fn new(backend: Arc<B>, elem: B::TensorHandle) -> Result<Self> {
        if !backend.is_functional(&elem) {
            return Err(FunctionalizeError::NotFunctional);
        }
        let grad = backend.grad_meta(&elem);
        Ok(FunctionalTensor {
            inner: Rc::new(Inner {
                backend,
                elem: RefCell::new(elem),
                grad: Cell::new(grad),
            }),
        })
    }

    /// Converts a plain tensor into a wrapped functional one.
    ///
    /// Gradient metadata is mirrored from `x` onto the functional handle and from there onto the
    /// wrapper, so autograd keeps seeing the same `requires_grad`/`is_leaf` flags.
    pub fn to_functional(backend: &Arc<B>, x: &B::TensorHandle) -> Result<Self> {
        if backend.is_functional(x) {
            return Err(FunctionalizeError::AlreadyFunctional);
        }
        let functional = backend.to_functional(x, 0)?;
        mirror_autograd_meta(backend.as_ref(), x, &functional);
        let wrapped = Self::new(Arc::clone(backend), functional)?;
        wrapped.set_grad_meta(backend.grad_meta(&wrapped.elem()));
        Ok(wrapped)
    }

    /// Syncs pending mutations and returns a plain handle holding the latest value.
    pub fn from_functional(&self) -> Result<B::TensorHandle> {
        self.sync()?;
        let backend = &self.inner.backend;
        let plain = backend.from_functional(&self.elem(), backend.reapply_views())?;
        Ok(plain)
    }

    /// Applies pending updates recorded on the inner handle.
    pub fn sync(&self) -> Result<()> {
        self.inner.backend.sync(&self.inner.elem.borrow())?;
        Ok(())
    }

    pub fn elem(&self) -> B::TensorHandle {
        self.inner.elem.borrow().clone()
    }

    pub(crate) fn replace_elem(&self, elem: B::TensorHandle) {
        *self.inner.elem.borrow_mut() = elem;
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }

    /// Identity comparison: true when both values are the same wrapper object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the inner handle saw a mutation since it was made functional.
    pub fn was_mutated(&self) -> bool {
        self.inner.backend.was_mutated(&self.inner.elem.borrow())
    }

    pub fn meta(&self) -> TensorMeta {
        self.inner.backend.meta(&self.inner.elem.borrow())
    }

    pub fn shape(&self) -> Shape {
        self.meta().shape().clone()
    }

    pub fn strides(&self) -> Vec<usize> {
        self.meta().strides().to_vec()
    }

    pub fn storage_offset(&self) -> usize {
        self.meta().storage_offset()
    }

    pub fn numel(&self) -> usize {
        self.meta().numel()
    }

    pub fn dim(&self) -> usize {
        self.meta().dim()
    }

    pub fn dtype(&self) -> DType {
        self.meta().dtype()
    }

    pub fn layout(&self) -> Layout {
        self.meta().layout()
    }

    pub fn device(&self) -> Device {
        self.meta().device()
    }

    pub fn is_contiguous(&self) -> bool {
        self.meta().is_contiguous()
    }

    pub fn is_contiguous_for(&self, format: MemoryFormat) -> bool {
        self.meta().is_contiguous_for(format)
    }

    pub fn is_strides_like(&self, format: MemoryFormat) -> bool {
        self.meta().is_strides_like(format)
    }

    pub fn is_non_overlapping_and_dense(&self) -> bool {
        self.meta().is_non_overlapping_and_dense()
    }

    pub fn grad_meta(&self) -> GradMeta {
        self.inner.grad.get()
    }

    pub fn requires_grad(&self) -> bool {
        self.grad_meta().requires_grad
    }

    pub fn set_grad_meta(&self, meta: GradMeta) {
        self.inner.grad.set(meta);
    }
}

impl<B: FunctionalBackend> Clone for FunctionalTensor<B> {
    fn clone(&self) -> Self {
        FunctionalTensor {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<B: FunctionalBackend> fmt::Debug for FunctionalTensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionalTensor({:?})", self.inner.elem.borrow())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetadataKind {
    Size(Option<i64>),
    Stride(Option<i64>),
    StorageOffset,
    Numel,
    Dim,
    IsContiguous(MemoryFormat),
    IsStridesLike(MemoryFormat),
    IsNonOverlappingAndDense,
}

/// A metadata-only operator invoked on a wrapped tensor, answered from its inner handle.
pub(crate) struct MetadataQuery<B: FunctionalBackend> {
    op: OpName,
    kind: MetadataKind,
    tensor: FunctionalTensor<B>,
}

impl<B: FunctionalBackend> MetadataQuery<B> {
    /// Recognizes metadata operators whose tensor argument is a [`FunctionalTensor`].
    ///
    /// Returns `Ok(None)` for every other call so that it continues through normal dispatch.
    pub(crate) fn from_call(op: OpName, args: &DispatchArgs<B>) -> Result<Option<Self>> {
        let Some(Value::Tensor(DispatchTensor::Functional(tensor))) = args.arg(0) else {
            return Ok(None);
        };
        let is_metadata = matches!(
            op,
            metadata::SIZE
                | metadata::SYM_SIZE
                | metadata::STRIDE
                | metadata::SYM_STRIDE
                | metadata::STORAGE_OFFSET
                | metadata::SYM_STORAGE_OFFSET
                | metadata::NUMEL
                | metadata::SYM_NUMEL
                | metadata::DIM
                | metadata::IS_CONTIGUOUS
                | metadata::IS_CONTIGUOUS_MEMORY_FORMAT
                | metadata::IS_STRIDES_LIKE_FORMAT
                | metadata::IS_NON_OVERLAPPING_AND_DENSE
        );
        if !is_metadata {
            return Ok(None);
        }

        let invalid = || FunctionalizeError::InvalidMetadataQuery { op };
        let extra = args.arg(1).map(|value| value.as_scalar().ok_or_else(invalid));
        let extra: Option<Scalar> = extra.transpose()?;
        let format = || match extra {
            None => Ok(MemoryFormat::Contiguous),
            Some(scalar) => scalar
                .as_i64()
                .and_then(MemoryFormat::from_code)
                .ok_or_else(invalid),
        };
        let axis = || match extra {
            None => Ok(None),
            Some(scalar) => scalar.as_i64().map(Some).ok_or_else(invalid),
        };

        let kind = match op {
            metadata::SIZE | metadata::SYM_SIZE => MetadataKind::Size(axis()?),
            metadata::STRIDE | metadata::SYM_STRIDE => MetadataKind::Stride(axis()?),
            metadata::STORAGE_OFFSET | metadata::SYM_STORAGE_OFFSET => MetadataKind::StorageOffset,
            metadata::NUMEL | metadata::SYM_NUMEL => MetadataKind::Numel,
            metadata::DIM => MetadataKind::Dim,
            metadata::IS_CONTIGUOUS | metadata::IS_CONTIGUOUS_MEMORY_FORMAT => {
                MetadataKind::IsContiguous(format()?)
            }
            metadata::IS_STRIDES_LIKE_FORMAT => MetadataKind::IsStridesLike(format()?),
            _ => MetadataKind::IsNonOverlappingAndDense,
        };

        let takes_extra = matches!(
            kind,
            MetadataKind::Size(_)
                | MetadataKind::Stride(_)
                | MetadataKind::IsContiguous(_)
                | MetadataKind::IsStridesLike(_)
        );
        let max_args = if takes_extra { 2 } else { 1 };
        if args.args.len() > max_args || !args.kwargs.is_empty() {
            return Err(invalid());
        }
        if args.args.iter().skip(1).any(|value| value.as_tensor().is_some()) {
            return Err(invalid());
        }

        Ok(Some(MetadataQuery {
            op,
            kind,
            tensor: tensor.clone(),
        }))
    }

    pub(crate) fn answer(&self) -> Result<DispatchValue<B>> {
        let meta = self.tensor.meta();
        log::trace!("answering {} from {:?}", self.op, self.tensor);
        let int = |value: usize| Value::Scalar(Scalar::Int(value as i64));
        let flag = |value: bool| Value::Scalar(Scalar::Bool(value));
        let per_axis = |values: &[usize], axis: Option<i64>| -> Result<DispatchValue<B>> {
            match axis {
                None => Ok(Value::List(values.iter().map(|&v| int(v)).collect())),
                Some(axis) => {
                    let index = normalize_axis(axis, values.len())
                        .ok_or(FunctionalizeError::InvalidMetadataQuery { op: self.op })?;
                    Ok(int(values[index]))
                }
            }
        };
        match self.kind {
            MetadataKind::Size(axis) => per_axis(meta.shape().dims(), axis),
            MetadataKind::Stride(axis) => per_axis(meta.strides(), axis),
            MetadataKind::StorageOffset => Ok(int(meta.storage_offset())),
            MetadataKind::Numel => Ok(int(meta.numel())),
            MetadataKind::Dim => Ok(int(meta.dim())),
            MetadataKind::IsContiguous(format) => Ok(flag(meta.is_contiguous_for(format))),
            MetadataKind::IsStridesLike(format) => Ok(flag(meta.is_strides_like(format))),
            MetadataKind::IsNonOverlappingAndDense => Ok(flag(meta.is_non_overlapping_and_dense())),
        }
    }
}

fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank = rank as i64;
    let index = if axis < 0 { axis + rank } else { axis };
    (0..rank).contains(&index).then_some(index as usize)
}

#[cfg(test)]
mod tests {
    use super::normalize_axis;

    #[test]
    fn negative_axes_wrap_once() {
        assert_eq!(normalize_axis(-1, 3), Some(2));
        assert_eq!(normalize_axis(2, 3), Some(2));
        assert_eq!(normalize_axis(3, 3), None);
        assert_eq!(normalize_axis(-4, 3), None);
        assert_eq!(normalize_axis(0, 0), None);
    }
}

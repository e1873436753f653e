//! Gradient-tracking metadata carried across the functional wrap/unwrap boundary.
//!
//! Only `requires_grad` and `is_leaf` matter here: the former so autograd keeps running on the
//! functional form, the latter so mutations of non-leaf graph inputs stay permitted.

use super::FunctionalBackend;

/// Copies gradient metadata from `src` onto `dst`, both owned by `backend`.
pub fn mirror_autograd_meta<B: FunctionalBackend + ?Sized>(
    backend: &B,
    src: &B::TensorHandle,
    dst: &B::TensorHandle,
) {
    backend.set_grad_meta(dst, backend.grad_meta(src));
}

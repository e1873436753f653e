//! Reference executor for the purify functionalization layer.
//!
//! Tensors are dense row-major `f32` buffers. Functional tensors queue their updates instead of
//! writing through, and every executed kernel is appended to a trace so callers can check which
//! operators a functionalized program actually ran.

pub mod reference;

pub use reference::{KernelInterceptor, NoopInterceptor, RefBackend, RefTensor};

/// Operators with reference kernels.
pub mod ops {
    use purify::OpName;

    pub const ADD: OpName = OpName::new("aten::add.Tensor");
    pub const ADD_: OpName = OpName::new("aten::add_.Tensor");
    pub const ADD_OUT: OpName = OpName::new("aten::add.out");
    pub const SUB: OpName = OpName::new("aten::sub.Tensor");
    pub const SUB_: OpName = OpName::new("aten::sub_.Tensor");
    pub const MUL: OpName = OpName::new("aten::mul.Tensor");
    pub const MUL_: OpName = OpName::new("aten::mul_.Tensor");
    pub const DIV: OpName = OpName::new("aten::div.Tensor");
    pub const NEG: OpName = OpName::new("aten::neg");
    pub const RELU: OpName = OpName::new("aten::relu");
    pub const RELU_: OpName = OpName::new("aten::relu_");
    pub const ZERO_: OpName = OpName::new("aten::zero_");
    pub const FILL_: OpName = OpName::new("aten::fill_.Scalar");
    pub const CLONE: OpName = OpName::new("aten::clone");
    pub const COPY_: OpName = OpName::new("aten::copy_");
    pub const VIEW: OpName = OpName::new("aten::view");
    pub const RESHAPE: OpName = OpName::new("aten::reshape");
    pub const TRANSPOSE: OpName = OpName::new("aten::transpose.int");
    pub const SUM: OpName = OpName::new("aten::sum");
}

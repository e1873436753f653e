use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use purify::backend::{
    AliasKind, AliasTarget, AliasingContract, BackendError, BackendResult, FunctionalBackend,
};
use purify::dispatch::keys;
use purify::ops::{OpArgs, OpName, Scalar, Value};
use purify::tensor::{DType, Device, GradMeta, Shape, TensorMeta};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(0);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Dense row-major `f32` contents plus their metadata.
#[derive(Clone)]
struct Storage {
    data: Arc<[f32]>,
    meta: TensorMeta,
}

impl Storage {
    fn new(shape: Shape, data: Vec<f32>) -> BackendResult<Self> {
        if shape.num_elements() != data.len() {
            return Err(BackendError::execution(format!(
                "shape {:?} holds {} elements but {} values were provided",
                shape.dims(),
                shape.num_elements(),
                data.len()
            )));
        }
        Ok(Storage {
            data: Arc::from(data),
            meta: TensorMeta::contiguous(shape, DType::F32, Device::Cpu),
        })
    }

    fn dims(&self) -> &[usize] {
        self.meta.shape().dims()
    }
}

struct FunctionalState {
    level: usize,
    pending: Mutex<Option<Storage>>,
    mutated: AtomicBool,
}

struct TensorCell {
    id: u64,
    storage: Mutex<Storage>,
    functional: Option<FunctionalState>,
    grad: Mutex<GradMeta>,
}

/// Handle to a reference-backend tensor. Clones share storage.
///
/// Functional tensors never write through on mutation while functionalization is enabled;
/// updates are queued and applied on the next sync (reads sync implicitly).
#[derive(Clone)]
pub struct RefTensor {
    cell: Arc<TensorCell>,
}

impl RefTensor {
    fn from_storage(storage: Storage, functional_level: Option<usize>) -> Self {
        RefTensor {
            cell: Arc::new(TensorCell {
                id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
                storage: Mutex::new(storage),
                functional: functional_level.map(|level| FunctionalState {
                    level,
                    pending: Mutex::new(None),
                    mutated: AtomicBool::new(false),
                }),
                grad: Mutex::new(GradMeta::leaf(false)),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.cell.id
    }

    pub fn ptr_eq(&self, other: &RefTensor) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    pub fn is_functional(&self) -> bool {
        self.cell.functional.is_some()
    }

    pub fn functional_level(&self) -> Option<usize> {
        self.cell.functional.as_ref().map(|state| state.level)
    }

    pub fn meta(&self) -> TensorMeta {
        self.current().meta
    }

    /// Latest contents in row-major order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.current().data.to_vec()
    }

    fn current(&self) -> Storage {
        self.sync();
        lock(&self.cell.storage).clone()
    }

    /// Applies a queued functional update. Returns whether one was pending.
    fn sync(&self) -> bool {
        let Some(state) = &self.cell.functional else {
            return false;
        };
        match lock(&state.pending).take() {
            Some(update) => {
                *lock(&self.cell.storage) = update;
                true
            }
            None => false,
        }
    }

    fn queue_update(&self, storage: Storage) {
        match &self.cell.functional {
            Some(state) => {
                *lock(&state.pending) = Some(storage);
                state.mutated.store(true, Ordering::Release);
            }
            None => self.write(storage),
        }
    }

    fn write(&self, storage: Storage) {
        if let Some(state) = &self.cell.functional {
            lock(&state.pending).take();
            state.mutated.store(true, Ordering::Release);
        }
        *lock(&self.cell.storage) = storage;
    }
}

impl fmt::Debug for RefTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = lock(&self.cell.storage).dims().to_vec();
        match self.functional_level() {
            Some(level) => write!(f, "RefTensor#{}{dims:?}@functional{level}", self.cell.id),
            None => write!(f, "RefTensor#{}{dims:?}", self.cell.id),
        }
    }
}

/// Hook that may claim an operator before the built-in kernels run.
pub trait KernelInterceptor: Send + Sync + 'static {
    fn try_execute(
        &self,
        op: OpName,
        args: &OpArgs<RefTensor>,
    ) -> Option<BackendResult<Vec<Value<RefTensor>>>>;
}

#[derive(Debug, Default)]
pub struct NoopInterceptor;

impl KernelInterceptor for NoopInterceptor {
    fn try_execute(
        &self,
        _op: OpName,
        _args: &OpArgs<RefTensor>,
    ) -> Option<BackendResult<Vec<Value<RefTensor>>>> {
        None
    }
}

/// Dense `f32` executor with native functional tensors and an execution trace.
pub struct RefBackend<I: KernelInterceptor = NoopInterceptor> {
    interceptor: I,
    reapply_views: AtomicBool,
    trace: Mutex<Vec<String>>,
}

impl RefBackend<NoopInterceptor> {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for RefBackend<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: KernelInterceptor> RefBackend<I> {
    pub fn with_interceptor(interceptor: I) -> Self {
        RefBackend {
            interceptor,
            reapply_views: AtomicBool::new(false),
            trace: Mutex::new(Vec::new()),
        }
    }

    pub fn interceptor(&self) -> &I {
        &self.interceptor
    }

    /// Creates a plain tensor from row-major values.
    pub fn tensor(&self, shape: impl Into<Shape>, data: Vec<f32>) -> BackendResult<RefTensor> {
        Ok(RefTensor::from_storage(Storage::new(shape.into(), data)?, None))
    }

    pub fn scalar_tensor(&self, value: f32) -> RefTensor {
        RefTensor::from_storage(
            Storage {
                data: Arc::from(vec![value]),
                meta: TensorMeta::contiguous(Shape::scalar(), DType::F32, Device::Cpu),
            },
            None,
        )
    }

    /// Names of the kernels executed so far, in order. Functionalized executions record the
    /// pure variant that actually ran.
    pub fn trace(&self) -> Vec<String> {
        lock(&self.trace).clone()
    }

    pub fn clear_trace(&self) {
        lock(&self.trace).clear();
    }

    fn record(&self, name: String) {
        log::trace!("ref backend executing {name}");
        lock(&self.trace).push(name);
    }

    fn run(&self, op: OpName, args: &OpArgs<RefTensor>) -> BackendResult<Vec<Value<RefTensor>>> {
        let kernel = Kernel::resolve(op)?;
        let functionalize = keys::functionalization_enabled();
        let mut functional_level: Option<usize> = None;
        args.for_each_tensor(|tensor| {
            if let Some(level) = tensor.functional_level() {
                functional_level = Some(functional_level.map_or(level, |seen| seen.max(level)));
            }
        });
        let contract = self.aliasing_contract(op);

        let storage = match kernel.compute(op, args)? {
            Computed::Scalar(scalar) => {
                self.record(op.as_str().to_string());
                return Ok(vec![Value::Scalar(scalar)]);
            }
            Computed::Tensor(storage) => storage,
        };

        if let Some(alias) = contract.mutated_outputs().next() {
            let target = alias_target(op, args, &alias.target)?;
            if functionalize && target.is_functional() {
                self.record(format!("{}::{}", op.namespace(), op.functional_base()));
                target.queue_update(storage);
            } else {
                self.record(op.as_str().to_string());
                target.write(storage);
            }
            return Ok(vec![Value::Tensor(target.clone())]);
        }

        let functional_output = if functionalize { functional_level } else { None };
        let is_view = contract
            .aliases()
            .iter()
            .any(|alias| alias.kind == AliasKind::View);
        if functional_output.is_some() && is_view && !self.reapply_views() {
            self.record(format!("{}::{}_copy", op.namespace(), op.base()));
        } else {
            self.record(op.as_str().to_string());
        }
        Ok(vec![Value::Tensor(RefTensor::from_storage(
            storage,
            functional_output,
        ))])
    }
}

impl<I: KernelInterceptor> FunctionalBackend for RefBackend<I> {
    type TensorHandle = RefTensor;

    fn backend_name(&self) -> &str {
        "ref"
    }

    fn meta(&self, tensor: &RefTensor) -> TensorMeta {
        tensor.meta()
    }

    fn grad_meta(&self, tensor: &RefTensor) -> GradMeta {
        *lock(&tensor.cell.grad)
    }

    fn set_grad_meta(&self, tensor: &RefTensor, meta: GradMeta) {
        *lock(&tensor.cell.grad) = meta;
    }

    fn is_functional(&self, tensor: &RefTensor) -> bool {
        tensor.is_functional()
    }

    fn to_functional(&self, tensor: &RefTensor, level: usize) -> BackendResult<RefTensor> {
        if let Some(existing) = tensor.functional_level() {
            if existing >= level {
                return Err(BackendError::invariant(format!(
                    "{tensor:?} is already functional at level {existing}"
                )));
            }
        }
        Ok(RefTensor::from_storage(tensor.current(), Some(level)))
    }

    fn from_functional(&self, tensor: &RefTensor, reapply_views: bool) -> BackendResult<RefTensor> {
        if !tensor.is_functional() {
            return Err(BackendError::invariant(format!(
                "{tensor:?} is not a functional tensor"
            )));
        }
        log::trace!("unwrapping {tensor:?} (reapply_views={reapply_views})");
        Ok(RefTensor::from_storage(tensor.current(), None))
    }

    fn sync(&self, tensor: &RefTensor) -> BackendResult<()> {
        if tensor.sync() {
            log::trace!("applied pending update to {tensor:?}");
        }
        Ok(())
    }

    fn was_mutated(&self, tensor: &RefTensor) -> bool {
        tensor
            .cell
            .functional
            .as_ref()
            .is_some_and(|state| state.mutated.load(Ordering::Acquire))
    }

    fn execute(
        &self,
        op: OpName,
        args: &OpArgs<RefTensor>,
    ) -> BackendResult<Vec<Value<RefTensor>>> {
        if let Some(result) = self.interceptor.try_execute(op, args) {
            return result;
        }
        self.run(op, args)
    }

    fn set_reapply_views(&self, enabled: bool) -> bool {
        self.reapply_views.swap(enabled, Ordering::AcqRel)
    }

    fn reapply_views(&self) -> bool {
        self.reapply_views.load(Ordering::Acquire)
    }

    fn aliasing_contract(&self, op: OpName) -> AliasingContract {
        if op.is_inplace() {
            AliasingContract::inplace()
        } else if op.is_out_variant() {
            AliasingContract::out_variant()
        } else if matches!(op.base(), "view" | "reshape" | "transpose" | "alias") {
            AliasingContract::view()
        } else {
            AliasingContract::none()
        }
    }
}

fn alias_target<'a>(
    op: OpName,
    args: &'a OpArgs<RefTensor>,
    target: &AliasTarget,
) -> BackendResult<&'a RefTensor> {
    let value = match target {
        AliasTarget::Positional(index) => args.arg(*index),
        AliasTarget::Keyword(name) => args.kwarg(name),
    };
    value
        .and_then(Value::as_tensor)
        .ok_or_else(|| BackendError::execution(format!("{op} expects a tensor at {target:?}")))
}

enum Computed {
    Tensor(Storage),
    Scalar(Scalar),
}

#[derive(Debug, Clone, Copy)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Neg,
    Relu,
    Clone,
}

#[derive(Debug, Clone, Copy)]
enum Kernel {
    Binary(BinaryOp),
    Unary(UnaryOp),
    Zero,
    Fill,
    Copy,
    View,
    Transpose,
    Sum,
}

enum Operand {
    Tensor(Storage),
    Scalar(f64),
}

impl Kernel {
    fn resolve(op: OpName) -> BackendResult<Self> {
        let kernel = match op.functional_base() {
            "add" => Kernel::Binary(BinaryOp::Add),
            "sub" => Kernel::Binary(BinaryOp::Sub),
            "mul" => Kernel::Binary(BinaryOp::Mul),
            "div" => Kernel::Binary(BinaryOp::Div),
            "neg" => Kernel::Unary(UnaryOp::Neg),
            "relu" => Kernel::Unary(UnaryOp::Relu),
            "clone" | "alias" => Kernel::Unary(UnaryOp::Clone),
            "zero" => Kernel::Zero,
            "fill" => Kernel::Fill,
            "copy" => Kernel::Copy,
            "view" | "view_copy" | "reshape" => Kernel::View,
            "transpose" | "transpose_copy" => Kernel::Transpose,
            "sum" => Kernel::Sum,
            _ => {
                return Err(BackendError::unimplemented(
                    op.as_str(),
                    "no reference kernel for this operator",
                ))
            }
        };
        Ok(kernel)
    }

    fn compute(self, op: OpName, args: &OpArgs<RefTensor>) -> BackendResult<Computed> {
        match self {
            Kernel::Binary(binary) => op_binary(op, args, binary),
            Kernel::Unary(unary) => {
                let input = tensor_arg(op, args, 0)?;
                let values = input.data.iter().map(|&x| match unary {
                    UnaryOp::Neg => -x,
                    UnaryOp::Relu => x.max(0.0),
                    UnaryOp::Clone => x,
                });
                Ok(Computed::Tensor(Storage::new(
                    input.meta.shape().clone(),
                    values.collect(),
                )?))
            }
            Kernel::Zero => {
                let input = tensor_arg(op, args, 0)?;
                let shape = input.meta.shape().clone();
                let numel = shape.num_elements();
                Ok(Computed::Tensor(Storage::new(shape, vec![0.0; numel])?))
            }
            Kernel::Fill => {
                let input = tensor_arg(op, args, 0)?;
                let value = scalar_arg(op, args, 1)?.as_f64() as f32;
                let shape = input.meta.shape().clone();
                let numel = shape.num_elements();
                Ok(Computed::Tensor(Storage::new(shape, vec![value; numel])?))
            }
            Kernel::Copy => {
                let dst = tensor_arg(op, args, 0)?;
                let src = tensor_arg(op, args, 1)?;
                let numel = dst.meta.numel();
                let values = match src.data.len() {
                    1 => vec![src.data[0]; numel],
                    len if len == numel => src.data.to_vec(),
                    len => {
                        return Err(BackendError::execution(format!(
                            "{op}: cannot copy {len} elements into {numel}"
                        )))
                    }
                };
                Ok(Computed::Tensor(Storage::new(dst.meta.shape().clone(), values)?))
            }
            Kernel::View => op_view(op, args),
            Kernel::Transpose => op_transpose(op, args),
            Kernel::Sum => {
                let input = tensor_arg(op, args, 0)?;
                let total: f32 = input.data.iter().sum();
                Ok(Computed::Tensor(Storage::new(Shape::scalar(), vec![total])?))
            }
        }
    }
}

fn tensor_arg(op: OpName, args: &OpArgs<RefTensor>, index: usize) -> BackendResult<Storage> {
    match args.arg(index) {
        Some(Value::Tensor(tensor)) => Ok(tensor.current()),
        _ => Err(BackendError::execution(format!(
            "{op} expects a tensor at position {index}"
        ))),
    }
}

fn scalar_arg(op: OpName, args: &OpArgs<RefTensor>, index: usize) -> BackendResult<Scalar> {
    args.arg(index).and_then(Value::as_scalar).ok_or_else(|| {
        BackendError::execution(format!("{op} expects a scalar at position {index}"))
    })
}

fn operand(op: OpName, args: &OpArgs<RefTensor>, index: usize) -> BackendResult<Operand> {
    match args.arg(index) {
        Some(Value::Tensor(tensor)) => Ok(Operand::Tensor(tensor.current())),
        Some(Value::Scalar(scalar)) => Ok(Operand::Scalar(scalar.as_f64())),
        _ => Err(BackendError::execution(format!(
            "{op} expects a tensor or scalar at position {index}"
        ))),
    }
}

fn op_binary(op: OpName, args: &OpArgs<RefTensor>, binary: BinaryOp) -> BackendResult<Computed> {
    let apply = |x: f32, y: f32| match binary {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x / y,
    };
    let lhs = operand(op, args, 0)?;
    let rhs = operand(op, args, 1)?;
    let (shape, values) = match (&lhs, &rhs) {
        (Operand::Scalar(a), Operand::Scalar(b)) => {
            let value = apply(*a as f32, *b as f32);
            return Ok(Computed::Scalar(Scalar::Float(f64::from(value))));
        }
        (Operand::Tensor(a), Operand::Scalar(b)) => {
            let b = *b as f32;
            (a.meta.shape().clone(), a.data.iter().map(|&x| apply(x, b)).collect())
        }
        (Operand::Scalar(a), Operand::Tensor(b)) => {
            let a = *a as f32;
            (b.meta.shape().clone(), b.data.iter().map(|&y| apply(a, y)).collect())
        }
        (Operand::Tensor(a), Operand::Tensor(b)) => {
            if a.dims() == b.dims() {
                let values = a.data.iter().zip(b.data.iter()).map(|(&x, &y)| apply(x, y));
                (a.meta.shape().clone(), values.collect())
            } else if b.data.len() == 1 {
                let y = b.data[0];
                (a.meta.shape().clone(), a.data.iter().map(|&x| apply(x, y)).collect())
            } else if a.data.len() == 1 {
                let x = a.data[0];
                (b.meta.shape().clone(), b.data.iter().map(|&y| apply(x, y)).collect())
            } else {
                return Err(BackendError::execution(format!(
                    "{op}: shape mismatch {:?} vs {:?}",
                    a.dims(),
                    b.dims()
                )));
            }
        }
    };
    Ok(Computed::Tensor(Storage::new(shape, values)?))
}

fn op_view(op: OpName, args: &OpArgs<RefTensor>) -> BackendResult<Computed> {
    let input = tensor_arg(op, args, 0)?;
    let requested = match args.arg(1) {
        Some(Value::List(items)) => items
            .iter()
            .map(|item| item.as_scalar().and_then(Scalar::as_i64))
            .collect::<Option<Vec<i64>>>(),
        _ => None,
    }
    .ok_or_else(|| BackendError::execution(format!("{op} expects a list of integer sizes")))?;

    let numel = input.meta.numel();
    let known: usize = requested
        .iter()
        .filter(|&&dim| dim >= 0)
        .map(|&dim| dim as usize)
        .product();
    let inferred = requested.iter().filter(|&&dim| dim < 0).count();
    let dims = requested
        .iter()
        .map(|&dim| match dim {
            -1 if inferred == 1 && known != 0 => Ok(numel / known),
            dim if dim >= 0 => Ok(dim as usize),
            _ => Err(BackendError::execution(format!(
                "{op}: invalid size {dim} in {requested:?}"
            ))),
        })
        .collect::<BackendResult<Vec<usize>>>()?;
    let shape = Shape::new(dims);
    if shape.num_elements() != numel {
        return Err(BackendError::execution(format!(
            "{op}: shape {requested:?} is invalid for input of size {numel}"
        )));
    }
    Ok(Computed::Tensor(Storage::new(shape, input.data.to_vec())?))
}

fn op_transpose(op: OpName, args: &OpArgs<RefTensor>) -> BackendResult<Computed> {
    let input = tensor_arg(op, args, 0)?;
    let rank = input.meta.dim();
    let axis = |index: usize| -> BackendResult<usize> {
        let raw = scalar_arg(op, args, index)?
            .as_i64()
            .ok_or_else(|| BackendError::execution(format!("{op} expects integer dims")))?;
        let wrapped = if raw < 0 { raw + rank as i64 } else { raw };
        if wrapped < 0 || wrapped >= rank as i64 {
            return Err(BackendError::execution(format!(
                "{op}: dim {raw} out of range for rank {rank}"
            )));
        }
        Ok(wrapped as usize)
    };
    let (dim0, dim1) = (axis(1)?, axis(2)?);

    let input_dims = input.dims().to_vec();
    let mut perm: Vec<usize> = (0..rank).collect();
    perm.swap(dim0, dim1);
    let out_dims: Vec<usize> = perm.iter().map(|&axis| input_dims[axis]).collect();
    let input_strides = compute_strides(&input_dims);
    let mut result = vec![0.0f32; input.data.len()];
    for (idx, slot) in result.iter_mut().enumerate() {
        let out_coord = unravel_index(idx, &out_dims);
        let mut in_index = 0usize;
        for (out_axis, &out_c) in out_coord.iter().enumerate() {
            in_index += out_c * input_strides[perm[out_axis]];
        }
        *slot = input.data[in_index];
    }
    Ok(Computed::Tensor(Storage::new(Shape::new(out_dims), result)?))
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

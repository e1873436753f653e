use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use purify::backend::{BackendError, BackendResult};
use purify::dispatch::keys::{DispatchKey, IncludeDispatchKeyGuard};
use purify::dispatch::mode_stack::{active_mode_keys, is_mode_active, ModeKey};
use purify::dispatch::{keys, DispatchArgs, ForeignTensor};
use purify::functional::maybe_disable_functional_mode;
use purify::functional::redirect::execute_redirected;
use purify::ops::metadata;
use purify::{
    call, ArgCategory, DispatchTensor, DispatchValue, FunctionalBackend, FunctionalTensor,
    FunctionalTensorMode, FunctionalizeError, OpArgs, OpName, Scalar, Value,
};
use purify_backend_ref::{ops, KernelInterceptor, RefBackend, RefTensor};

type Ref = RefBackend;

fn functional(backend: &Arc<Ref>, shape: [usize; 2], data: Vec<f32>) -> Result<FunctionalTensor<Ref>> {
    let plain = backend.tensor(shape, data)?;
    Ok(FunctionalTensor::to_functional(backend, &plain)?)
}

fn wrapped(tensor: &FunctionalTensor<Ref>) -> DispatchValue<Ref> {
    Value::Tensor(DispatchTensor::Functional(tensor.clone()))
}

fn single_functional(outputs: Vec<DispatchValue<Ref>>) -> FunctionalTensor<Ref> {
    assert_eq!(outputs.len(), 1);
    match outputs.into_iter().next() {
        Some(Value::Tensor(DispatchTensor::Functional(tensor))) => tensor,
        other => panic!("expected a functional tensor output, got {other:?}"),
    }
}

#[test]
fn to_functional_round_trip_preserves_values() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = backend.tensor([2, 2], vec![1.0, 2.0, 3.0, 4.0])?;
    let fx = FunctionalTensor::to_functional(&backend, &x)?;
    assert!(backend.is_functional(&fx.elem()));

    let back = fx.from_functional()?;
    assert!(!backend.is_functional(&back));
    assert_eq!(back.to_vec(), x.to_vec());
    assert_eq!(back.meta(), x.meta());
    Ok(())
}

#[test]
fn wrapping_functional_or_plain_handles_is_rejected() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = backend.tensor([2], vec![1.0, 2.0])?;
    let already = backend.to_functional(&x, 0)?;

    let err = FunctionalTensor::to_functional(&backend, &already).unwrap_err();
    assert!(matches!(err, FunctionalizeError::AlreadyFunctional));

    let err = FunctionalTensor::new(Arc::clone(&backend), x).unwrap_err();
    assert!(matches!(err, FunctionalizeError::NotFunctional));
    Ok(())
}

#[test]
fn requires_grad_is_mirrored_onto_the_wrapper() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = backend.tensor([2], vec![1.0, 2.0])?;
    backend.set_grad_meta(&x, purify::tensor::GradMeta::leaf(true));
    let fx = FunctionalTensor::to_functional(&backend, &x)?;
    assert!(fx.requires_grad());
    assert!(backend.grad_meta(&fx.elem()).requires_grad);
    Ok(())
}

#[test]
fn entering_an_active_mode_is_a_no_op() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let outer = FunctionalTensorMode::new(Arc::clone(&backend));
    let _outer_guard = outer.enter();
    let keys_before = keys::local_keys();
    let modes_before = active_mode_keys();
    assert_eq!(modes_before, vec![ModeKey::Functional]);

    {
        let _again = outer.enter();
        let inner = FunctionalTensorMode::new(Arc::clone(&backend));
        let inner_guard = inner.enter();
        assert_eq!(keys::local_keys(), keys_before);
        assert_eq!(active_mode_keys(), modes_before);
        drop(inner_guard);
        assert!(is_mode_active(ModeKey::Functional));
    }

    assert!(is_mode_active(ModeKey::Functional));
    Ok(())
}

#[test]
fn mode_exit_restores_the_stack() {
    let backend = Arc::new(Ref::new());
    let mode = FunctionalTensorMode::new(backend);
    mode.scoped(|| assert!(is_mode_active(ModeKey::Functional)));
    assert!(!is_mode_active(ModeKey::Functional));
    assert!(active_mode_keys().is_empty());
}

#[test]
fn inplace_add_returns_the_same_proxy() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = functional(&backend, [2, 2], vec![1.0, 2.0, 3.0, 4.0])?;
    let y = functional(&backend, [2, 2], vec![10.0, 20.0, 30.0, 40.0])?;
    let mode = FunctionalTensorMode::new(Arc::clone(&backend));
    let _guard = mode.enter();

    let pure = single_functional(call(
        backend.as_ref(),
        ops::ADD,
        OpArgs::new(vec![wrapped(&x), wrapped(&y)]),
    )?);
    let mutated = single_functional(call(
        backend.as_ref(),
        ops::ADD_,
        OpArgs::new(vec![wrapped(&x), wrapped(&y)]),
    )?);

    assert!(mutated.ptr_eq(&x));
    assert!(!pure.ptr_eq(&x));
    assert!(x.was_mutated());
    assert_eq!(x.from_functional()?.to_vec(), pure.from_functional()?.to_vec());
    assert_eq!(
        backend.trace(),
        vec!["aten::add.Tensor".to_string(), "aten::add".to_string()]
    );
    Ok(())
}

#[test]
fn out_variant_returns_the_out_argument() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = functional(&backend, [1, 2], vec![1.0, 2.0])?;
    let out = functional(&backend, [1, 2], vec![0.0, 0.0])?;
    let mode = FunctionalTensorMode::new(Arc::clone(&backend));
    let _guard = mode.enter();

    let args = OpArgs::new(vec![wrapped(&x), Value::from(1.0)]).with_kwarg("out", wrapped(&out));
    let result = single_functional(call(backend.as_ref(), ops::ADD_OUT, args)?);
    assert!(result.ptr_eq(&out));
    assert_eq!(out.from_functional()?.to_vec(), vec![2.0, 3.0]);
    Ok(())
}

#[test]
fn view_outputs_are_fresh_proxies() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = functional(&backend, [2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
    let mode = FunctionalTensorMode::new(Arc::clone(&backend));
    let _guard = mode.enter();

    let sizes = Value::List(vec![Value::from(3_i64), Value::from(-1_i64)]);
    let viewed = single_functional(call(
        backend.as_ref(),
        ops::VIEW,
        OpArgs::new(vec![wrapped(&x), sizes]),
    )?);
    assert!(!viewed.ptr_eq(&x));
    assert_eq!(viewed.shape().dims(), &[3, 2]);
    let expected = if mode.config().reapply_views {
        "aten::view"
    } else {
        "aten::view_copy"
    };
    assert_eq!(backend.trace(), vec![expected.to_string()]);
    Ok(())
}

#[test]
fn metadata_queries_are_answered_from_the_inner_tensor() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = functional(&backend, [2, 3], vec![0.0; 6])?;

    let query = |op: OpName, extra: Vec<DispatchValue<Ref>>| -> Result<DispatchValue<Ref>> {
        let mut args = vec![wrapped(&x)];
        args.extend(extra);
        let mut outputs = call(backend.as_ref(), op, OpArgs::new(args))?;
        assert_eq!(outputs.len(), 1);
        Ok(outputs.remove(0))
    };

    let Value::List(sizes) = query(metadata::SIZE, vec![])? else {
        panic!("size without an axis answers a list");
    };
    let sizes: Vec<Option<Scalar>> = sizes.iter().map(Value::as_scalar).collect();
    assert_eq!(sizes, vec![Some(Scalar::Int(2)), Some(Scalar::Int(3))]);
    assert_eq!(query(metadata::SIZE, vec![Value::from(-1_i64)])?.as_scalar(), Some(Scalar::Int(3)));
    assert_eq!(query(metadata::STRIDE, vec![Value::from(0_i64)])?.as_scalar(), Some(Scalar::Int(3)));
    assert_eq!(query(metadata::NUMEL, vec![])?.as_scalar(), Some(Scalar::Int(6)));
    assert_eq!(query(metadata::DIM, vec![])?.as_scalar(), Some(Scalar::Int(2)));
    assert_eq!(
        query(metadata::IS_CONTIGUOUS, vec![])?.as_scalar(),
        Some(Scalar::Bool(true))
    );
    assert_eq!(x.numel(), 6);
    assert!(x.is_contiguous());
    assert!(backend.trace().is_empty());

    let err = query(metadata::NUMEL, vec![Value::from(1_i64)]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FunctionalizeError>(),
        Some(FunctionalizeError::InvalidMetadataQuery { .. })
    ));
    Ok(())
}

#[test]
fn compute_on_a_proxy_without_the_mode_fails() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = functional(&backend, [1, 2], vec![1.0, 2.0])?;
    let err = call(
        backend.as_ref(),
        ops::ADD,
        OpArgs::new(vec![wrapped(&x), wrapped(&x)]),
    )
    .unwrap_err();
    assert!(matches!(err, FunctionalizeError::ModeNotActive { op } if op == ops::ADD));
    Ok(())
}

#[test]
fn adding_two_proxies_requires_the_mode() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = functional(&backend, [1, 2], vec![1.0, 2.0])?;
    let y = functional(&backend, [1, 2], vec![10.0, 20.0])?;
    let args = || OpArgs::new(vec![wrapped(&x), wrapped(&y)]);

    let err = call(backend.as_ref(), ops::ADD, args()).unwrap_err();
    assert!(matches!(err, FunctionalizeError::ModeNotActive { op } if op == ops::ADD));
    assert!(backend.trace().is_empty());

    let mode = FunctionalTensorMode::new(Arc::clone(&backend));
    let _guard = mode.enter();
    let sum = single_functional(call(backend.as_ref(), ops::ADD, args())?);
    assert!(!sum.ptr_eq(&x));
    assert!(!sum.ptr_eq(&y));
    assert!(!x.was_mutated());
    assert_eq!(sum.from_functional()?.to_vec(), vec![11.0, 22.0]);
    Ok(())
}

#[test]
fn foreign_arguments_are_declined() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = backend.tensor([2], vec![1.0, 2.0])?;
    let mode = FunctionalTensorMode::new(Arc::clone(&backend));
    let _guard = mode.enter();

    let args: DispatchArgs<Ref> = OpArgs::new(vec![
        Value::Tensor(DispatchTensor::Plain(x)),
        Value::Tensor(DispatchTensor::Foreign(ForeignTensor::new("SparseProxy"))),
    ]);
    let err = call(backend.as_ref(), ops::ADD, args).unwrap_err();
    match err {
        FunctionalizeError::Unhandled { op, categories } => {
            assert_eq!(op, ops::ADD);
            assert_eq!(categories, vec![ArgCategory::Plain, ArgCategory::Other]);
        }
        other => panic!("expected Unhandled, got {other:?}"),
    }
    assert!(backend.trace().is_empty());
    Ok(())
}

#[test]
fn suspended_mode_lets_plain_calls_reach_the_backend() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = backend.tensor([2], vec![1.0, 2.0])?;
    let mode = FunctionalTensorMode::new(Arc::clone(&backend));
    let _guard = mode.enter();
    {
        let _suspended = maybe_disable_functional_mode();
        assert!(!is_mode_active(ModeKey::Functional));
        let outputs = call(
            backend.as_ref(),
            ops::NEG,
            OpArgs::tensors([DispatchTensor::Plain(x.clone())]),
        )?;
        let Some(Value::Tensor(DispatchTensor::Plain(neg))) = outputs.first() else {
            panic!("expected a plain output");
        };
        assert!(!neg.is_functional());
        assert_eq!(neg.to_vec(), vec![-1.0, -2.0]);
    }
    assert!(is_mode_active(ModeKey::Functional));
    Ok(())
}

const DOUBLE: OpName = OpName::new("test::double");

/// Implements `test::double` as a nested dispatch of `aten::add.Tensor`.
struct NestedAdd {
    backend: Weak<RefBackend<NestedAdd>>,
    mode_seen_active: Mutex<Vec<bool>>,
}

impl KernelInterceptor for NestedAdd {
    fn try_execute(
        &self,
        op: OpName,
        args: &OpArgs<RefTensor>,
    ) -> Option<BackendResult<Vec<Value<RefTensor>>>> {
        if op != DOUBLE {
            return None;
        }
        let backend = self.backend.upgrade()?;
        self.mode_seen_active
            .lock()
            .expect("lock")
            .push(is_mode_active(ModeKey::Functional));
        let x = args.arg(0)?.as_tensor()?.clone();
        let nested = OpArgs::tensors([DispatchTensor::Plain(x.clone()), DispatchTensor::Plain(x)]);
        let result = call(backend.as_ref(), ops::ADD, nested)
            .map_err(|err| BackendError::execution(err.to_string()))
            .and_then(|outputs| {
                outputs
                    .into_iter()
                    .map(|value| {
                        value.try_map(|tensor| match tensor {
                            DispatchTensor::Plain(handle) => Ok(handle),
                            other => Err(BackendError::execution(format!(
                                "unexpected nested output {other:?}"
                            ))),
                        })
                    })
                    .collect()
            });
        Some(result)
    }
}

#[test]
fn nested_dispatch_is_not_intercepted_twice() -> Result<()> {
    let backend = Arc::new_cyclic(|weak| {
        RefBackend::with_interceptor(NestedAdd {
            backend: weak.clone(),
            mode_seen_active: Mutex::new(Vec::new()),
        })
    });
    let plain = backend.tensor([1, 2], vec![1.5, 2.5])?;
    let x = FunctionalTensor::to_functional(&backend, &plain)?;
    let mode = FunctionalTensorMode::new(Arc::clone(&backend));
    let _guard = mode.enter();

    let outputs = call(
        backend.as_ref(),
        DOUBLE,
        OpArgs::tensors([DispatchTensor::Functional(x.clone())]),
    )?;
    let Some(Value::Tensor(DispatchTensor::Functional(doubled))) = outputs.first() else {
        panic!("expected a single wrapped output, got {outputs:?}");
    };
    assert!(backend.is_functional(&doubled.elem()));
    assert_eq!(doubled.from_functional()?.to_vec(), vec![3.0, 5.0]);
    assert_eq!(backend.trace(), vec!["aten::add.Tensor".to_string()]);
    assert_eq!(
        *backend.interceptor().mode_seen_active.lock().expect("lock"),
        vec![false]
    );
    assert!(is_mode_active(ModeKey::Functional));
    Ok(())
}

#[test]
#[should_panic(expected = "Functionalize dispatch key is already active")]
fn redirecting_under_active_functionalization_panics() {
    let backend = Arc::new(Ref::new());
    let x = backend.tensor([1], vec![1.0]).expect("tensor");
    let _include = IncludeDispatchKeyGuard::new(DispatchKey::Functionalize);
    let _ = execute_redirected(backend.as_ref(), ops::NEG, &OpArgs::tensors([x]), true);
}

#[test]
fn redirect_guards_are_released_after_the_call() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = backend.tensor([2], vec![1.0, -2.0])?;
    let before = keys::local_keys();
    let previous_views = backend.reapply_views();
    let outputs = execute_redirected(
        backend.as_ref(),
        ops::RELU,
        &OpArgs::tensors([x]),
        !previous_views,
    )?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(keys::local_keys(), before);
    assert_eq!(backend.reapply_views(), previous_views);
    Ok(())
}

#[test]
fn redirect_guards_are_released_when_the_backend_fails() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = backend.tensor([2], vec![1.0, -2.0])?;
    let before = keys::local_keys();
    let previous_views = backend.reapply_views();

    let err = execute_redirected(
        backend.as_ref(),
        OpName::new("aten::bogus"),
        &OpArgs::tensors([x]),
        !previous_views,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        FunctionalizeError::Backend(BackendError::Unimplemented { .. })
    ));
    assert_eq!(keys::local_keys(), before);
    assert_eq!(backend.reapply_views(), previous_views);
    Ok(())
}

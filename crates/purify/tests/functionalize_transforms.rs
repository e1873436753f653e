use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Result;
use purify::dispatch::keys::{self, DispatchKey};
use purify::dispatch::mode_stack::{is_mode_active, ModeKey};
use purify::functional::{
    DirectFunctionalizeApi, NativeFunctionalizeApi, RedispatchGuard, TensorFn,
    TransformFunctionalizeApi, TransformInterpreter,
};
use purify::{
    call, DispatchTensor, DispatchValue, FunctionalizeApi, FunctionalizeConfig, OpArgs,
    RemovalPolicy, Value,
};
use purify_backend_ref::{ops, RefBackend, RefTensor};
use serde_json::json;

type Ref = RefBackend;

fn plain(tensor: &RefTensor) -> DispatchValue<Ref> {
    Value::Tensor(DispatchTensor::Plain(tensor.clone()))
}

fn tensor_at(values: &[DispatchValue<Ref>], index: usize) -> &DispatchTensor<Ref> {
    match values.get(index) {
        Some(Value::Tensor(tensor)) => tensor,
        other => panic!("expected a tensor at {index}, got {other:?}"),
    }
}

fn plain_at(values: &[DispatchValue<Ref>], index: usize) -> RefTensor {
    match tensor_at(values, index) {
        DispatchTensor::Plain(handle) => handle.clone(),
        other => panic!("expected a plain tensor at {index}, got {other:?}"),
    }
}

fn first_tensor(values: Vec<DispatchValue<Ref>>) -> DispatchValue<Ref> {
    values
        .into_iter()
        .next()
        .unwrap_or_else(|| panic!("program returned no outputs"))
}

/// `y = x.clone(); y.add_(1); return y * x`
fn scale_shifted_clone(backend: Arc<Ref>) -> TensorFn<Ref> {
    Rc::new(move |inputs: Vec<DispatchValue<Ref>>| {
        let x = inputs[0].clone();
        let y = first_tensor(call(backend.as_ref(), ops::CLONE, OpArgs::new(vec![x.clone()]))?);
        let y = first_tensor(call(
            backend.as_ref(),
            ops::ADD_,
            OpArgs::new(vec![y, Value::from(1.0)]),
        )?);
        call(backend.as_ref(), ops::MUL, OpArgs::new(vec![y, x]))
    })
}

/// `x.add_(1); return x`
fn bump_input(backend: Arc<Ref>) -> TensorFn<Ref> {
    Rc::new(move |inputs: Vec<DispatchValue<Ref>>| {
        call(
            backend.as_ref(),
            ops::ADD_,
            OpArgs::new(vec![inputs[0].clone(), Value::from(1.0)]),
        )
    })
}

#[test]
fn native_functionalize_runs_only_pure_kernels() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = backend.tensor([3], vec![1.0, 2.0, 3.0])?;
    let f = purify::functional::functionalize(
        Arc::clone(&backend),
        scale_shifted_clone(Arc::clone(&backend)),
        RemovalPolicy::Mutations,
        0,
    );

    let outputs = f(vec![plain(&x)])?;
    let out = plain_at(&outputs, 0);
    assert!(!out.is_functional());
    assert_eq!(out.to_vec(), vec![2.0, 6.0, 12.0]);
    assert_eq!(x.to_vec(), vec![1.0, 2.0, 3.0]);
    assert_eq!(
        backend.trace(),
        vec![
            "aten::clone".to_string(),
            "aten::add".to_string(),
            "aten::mul.Tensor".to_string(),
        ]
    );
    assert!(!keys::is_included(DispatchKey::Functionalize));
    Ok(())
}

#[test]
fn native_functionalize_copies_input_mutations_back() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = backend.tensor([2], vec![1.0, 2.0])?;
    let f = purify::functional::functionalize(
        Arc::clone(&backend),
        bump_input(Arc::clone(&backend)),
        RemovalPolicy::MutationsAndViews,
        0,
    );

    let outputs = f(vec![plain(&x)])?;
    assert_eq!(plain_at(&outputs, 0).to_vec(), vec![2.0, 3.0]);
    assert_eq!(x.to_vec(), vec![2.0, 3.0]);
    assert_eq!(
        backend.trace(),
        vec!["aten::add".to_string(), "aten::copy_".to_string()]
    );
    Ok(())
}

#[test]
fn removal_policy_controls_view_replay() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let x = backend.tensor([2, 2], vec![1.0, 2.0, 3.0, 4.0])?;
    let transpose = {
        let backend = Arc::clone(&backend);
        Rc::new(move |inputs: Vec<DispatchValue<Ref>>| {
            call(
                backend.as_ref(),
                ops::TRANSPOSE,
                OpArgs::new(vec![inputs[0].clone(), Value::from(0_i64), Value::from(1_i64)]),
            )
        }) as TensorFn<Ref>
    };

    for (policy, expected) in [
        (RemovalPolicy::Mutations, "aten::transpose.int"),
        (RemovalPolicy::MutationsAndViews, "aten::transpose_copy"),
    ] {
        backend.clear_trace();
        let f = purify::functional::functionalize(Arc::clone(&backend), Rc::clone(&transpose), policy, 0);
        let outputs = f(vec![plain(&x)])?;
        assert_eq!(plain_at(&outputs, 0).to_vec(), vec![1.0, 3.0, 2.0, 4.0]);
        assert_eq!(backend.trace(), vec![expected.to_string()]);
    }
    Ok(())
}

#[test]
fn direct_adapter_round_trips_and_functionalizes() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let api = DirectFunctionalizeApi::new(Arc::clone(&backend));
    let x = backend.tensor([2], vec![4.0, 5.0])?;

    let wrapped = api.wrap_tensors(vec![plain(&x), Value::from(2_i64)])?;
    assert!(matches!(tensor_at(&wrapped, 0), DispatchTensor::Functional(_)));
    assert_eq!(wrapped[1].as_scalar(), Some(purify::Scalar::Int(2)));
    let unwrapped = api.unwrap_tensors(wrapped)?;
    let back = plain_at(&unwrapped, 0);
    assert!(!back.is_functional());
    assert_eq!(back.to_vec(), x.to_vec());

    let f = api.functionalize(bump_input(Arc::clone(&backend)));
    let outputs = f(vec![plain(&x)])?;
    let out = plain_at(&outputs, 0);
    assert!(!out.is_functional());
    assert_eq!(out.to_vec(), vec![5.0, 6.0]);
    assert!(!is_mode_active(ModeKey::Functional));
    assert!(!keys::is_excluded(DispatchKey::Functionalize));
    Ok(())
}

#[test]
fn direct_adapter_redispatch_suspends_the_mode() {
    let backend = Arc::new(Ref::new());
    let api = DirectFunctionalizeApi::new(Arc::clone(&backend));
    let mode = purify::FunctionalTensorMode::new(backend);
    let _guard = mode.enter();
    {
        let guard = api.redispatch_to_next();
        assert!(matches!(guard, RedispatchGuard::Unset(_)));
        assert!(!is_mode_active(ModeKey::Functional));
    }
    assert!(is_mode_active(ModeKey::Functional));
}

#[test]
fn native_adapter_wraps_at_level_zero() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let api = NativeFunctionalizeApi::new(Arc::clone(&backend));
    let x = backend.tensor([2], vec![1.0, -1.0])?;

    let wrapped = api.wrap_tensors(vec![plain(&x)])?;
    let functional = plain_at(&wrapped, 0);
    assert_eq!(functional.functional_level(), Some(0));
    let unwrapped = api.unwrap_tensors(wrapped)?;
    assert!(!plain_at(&unwrapped, 0).is_functional());

    {
        let _guard = api.redispatch_to_next();
        assert!(keys::is_excluded(DispatchKey::Functionalize));
    }
    assert!(!keys::is_excluded(DispatchKey::Functionalize));
    Ok(())
}

struct StackLevel {
    level: usize,
    add_back_views: bool,
    lowered: Rc<Cell<usize>>,
}

struct Relift(Rc<Cell<usize>>);

impl Drop for Relift {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

impl TransformInterpreter for StackLevel {
    fn level(&self) -> usize {
        self.level
    }

    fn functionalize_add_back_views(&self) -> bool {
        self.add_back_views
    }

    fn lower(&self) -> Box<dyn Any> {
        self.lowered.set(self.lowered.get() + 1);
        Box::new(Relift(Rc::clone(&self.lowered)))
    }
}

#[test]
fn transform_adapter_uses_the_interpreter_level() -> Result<()> {
    let backend = Arc::new(Ref::new());
    let lowered = Rc::new(Cell::new(0));
    let api = TransformFunctionalizeApi::new(
        Arc::clone(&backend),
        StackLevel {
            level: 2,
            add_back_views: false,
            lowered: Rc::clone(&lowered),
        },
    );
    let x = backend.tensor([2], vec![3.0, 4.0])?;

    let wrapped = api.wrap_tensors(vec![plain(&x)])?;
    assert_eq!(plain_at(&wrapped, 0).functional_level(), Some(2));
    assert!(!plain_at(&api.unwrap_tensors(wrapped)?, 0).is_functional());

    {
        let _guard = api.redispatch_to_next();
        assert_eq!(lowered.get(), 1);
    }
    assert_eq!(lowered.get(), 0);

    let f = api.functionalize(bump_input(Arc::clone(&backend)));
    let outputs = f(vec![plain(&x)])?;
    assert_eq!(plain_at(&outputs, 0).to_vec(), vec![4.0, 5.0]);
    assert_eq!(x.to_vec(), vec![4.0, 5.0]);
    Ok(())
}

#[test]
fn functionalize_config_loads_from_json() -> Result<()> {
    let config = FunctionalizeConfig::from_json_str(&json!({ "reapply_views": true }).to_string())?;
    assert!(config.reapply_views);
    let toggled = config.with_reapply_views(false);
    assert!(!toggled.reapply_views);
    assert!(FunctionalizeConfig::from_json_str("{\"reapply_views\": 3}").is_err());

    assert_eq!(RemovalPolicy::from_add_back_views(true), RemovalPolicy::MutationsAndViews);
    assert!(RemovalPolicy::Mutations.reapply_views());
    assert!(!RemovalPolicy::MutationsAndViews.reapply_views());
    Ok(())
}

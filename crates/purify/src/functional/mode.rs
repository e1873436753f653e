//! The functional dispatch mode and helpers for suspending it.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::backend::FunctionalBackend;
use crate::config::FunctionalizeConfig;
use crate::dispatch::mode_stack::{self, ModeKey, SuspendedMode};
use crate::dispatch::{
    push_dispatch_mode, ArgCategory, DispatchArgs, DispatchMode, DispatchOutcome, DispatchTensor,
    DispatchValue, ModeHandle,
};
use crate::error::{FunctionalizeError, Result};
use crate::ops::OpName;

use super::aliasing::return_and_correct_aliasing;
use super::redirect::execute_redirected;
use super::tensor::FunctionalTensor;

/// Redirecting context: while active, every operator dispatched on this thread is unwrapped,
/// executed with functionalization enabled, re-wrapped and alias-corrected.
///
/// At most one functional mode is active per thread. Entering while another (or the same) mode is
/// already active is a no-op, and only the entry that activated the mode removes it on exit.
pub struct FunctionalTensorMode<B: FunctionalBackend> {
    backend: Arc<B>,
    config: FunctionalizeConfig,
    enter_stack: RefCell<Vec<bool>>,
}

impl<B: FunctionalBackend> FunctionalTensorMode<B> {
    pub fn new(backend: Arc<B>) -> Rc<Self> {
        Self::with_config(backend, FunctionalizeConfig::default())
    }

    pub fn with_config(backend: Arc<B>, config: FunctionalizeConfig) -> Rc<Self> {
        Rc::new(FunctionalTensorMode {
            backend,
            config,
            enter_stack: RefCell::new(Vec::new()),
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &FunctionalizeConfig {
        &self.config
    }

    /// Activates the mode unless a functional mode is already active on this thread.
    pub fn enter(self: &Rc<Self>) -> FunctionalModeGuard<B> {
        let activated = if mode_stack::is_mode_active(ModeKey::Functional) {
            false
        } else {
            let handle: ModeHandle<B> = Rc::clone(self) as ModeHandle<B>;
            push_dispatch_mode(handle).is_ok()
        };
        log::trace!("entering functional mode (activated={activated})");
        self.enter_stack.borrow_mut().push(activated);
        FunctionalModeGuard {
            mode: Rc::clone(self),
        }
    }

    /// Runs `f` with the mode entered.
    pub fn scoped<R>(self: &Rc<Self>, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }

    fn exit(&self) {
        let activated = self.enter_stack.borrow_mut().pop().unwrap_or(false);
        log::trace!("exiting functional mode (deactivating={activated})");
        if activated {
            mode_stack::pop_mode(ModeKey::Functional);
        }
    }

    fn wrap_output(&self, handle: B::TensorHandle) -> Result<DispatchTensor<B>> {
        if self.backend.is_functional(&handle) {
            Ok(DispatchTensor::Functional(FunctionalTensor::new(
                Arc::clone(&self.backend),
                handle,
            )?))
        } else {
            Ok(DispatchTensor::Plain(handle))
        }
    }

    fn redirect(
        &self,
        op: OpName,
        categories: &[ArgCategory],
        args: &DispatchArgs<B>,
    ) -> Result<Vec<DispatchValue<B>>> {
        let unwrapped = args.try_map_ref(|tensor| match tensor {
            DispatchTensor::Functional(functional) => Ok(functional.elem()),
            DispatchTensor::Plain(handle) => Ok(handle.clone()),
            DispatchTensor::Foreign(_) => Err(FunctionalizeError::Unhandled {
                op,
                categories: categories.to_vec(),
            }),
        })?;

        let outputs = execute_redirected(
            self.backend.as_ref(),
            op,
            &unwrapped,
            self.config.reapply_views,
        )?;
        let wrapped = outputs
            .into_iter()
            .map(|value| value.try_map(|handle| self.wrap_output(handle)))
            .collect::<Result<Vec<_>>>()?;

        let contract = self.backend.aliasing_contract(op);
        return_and_correct_aliasing(op, &contract, args, wrapped)
    }
}

impl<B: FunctionalBackend> DispatchMode<B> for FunctionalTensorMode<B> {
    fn mode_key(&self) -> ModeKey {
        ModeKey::Functional
    }

    fn dispatch(
        &self,
        op: OpName,
        categories: &[ArgCategory],
        args: &DispatchArgs<B>,
    ) -> DispatchOutcome<Vec<DispatchValue<B>>> {
        if categories.contains(&ArgCategory::Other) {
            log::debug!(
                target: "purify::not_implemented",
                "FunctionalTensorMode unrecognized argument categories for {op}: {categories:?}"
            );
            return DispatchOutcome::Declined;
        }
        self.redirect(op, categories, args).into()
    }
}

/// Exits the mode entry that created it when dropped.
#[must_use = "the mode entry is exited as soon as the guard is dropped"]
pub struct FunctionalModeGuard<B: FunctionalBackend> {
    mode: Rc<FunctionalTensorMode<B>>,
}

impl<B: FunctionalBackend> FunctionalModeGuard<B> {
    pub fn mode(&self) -> &Rc<FunctionalTensorMode<B>> {
        &self.mode
    }
}

impl<B: FunctionalBackend> Drop for FunctionalModeGuard<B> {
    fn drop(&mut self) {
        self.mode.exit();
    }
}

/// Removes the active functional mode, if any, until the guard is dropped.
pub fn maybe_disable_functional_mode() -> SuspendedMode {
    mode_stack::unset_mode_temporarily(ModeKey::Functional)
}

/// Like [`maybe_disable_functional_mode`], additionally exposing the suspended mode when it is a
/// dispatch mode for backend `B`.
pub fn unset_functional_temporarily<B: FunctionalBackend>() -> (SuspendedMode, Option<ModeHandle<B>>)
{
    let suspended = mode_stack::unset_mode_temporarily(ModeKey::Functional);
    let mode = suspended
        .mode()
        .and_then(|entry| Rc::clone(entry).downcast::<ModeHandle<B>>().ok())
        .map(|handle| Rc::clone(&*handle));
    (suspended, mode)
}

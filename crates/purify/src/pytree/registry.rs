//! Process-wide mapping from container type tags to flatten-spec functions.
//!
//! Registration is append-only (registering a tag again replaces its function) and should happen
//! before the first match, typically at startup or right after loading persisted specs that
//! reference custom containers. The built-in `dict`, `list`, `tuple` and `namedtuple` handlers are
//! installed on first access.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;

use super::spec::{NodeSpec, SpecContext};
use super::value::{TreeValue, TypeTag};
use super::PytreeError;

/// Children of a live value selected according to a spec node.
///
/// `children` is aligned with the node's child specs; `None` marks a child the live value does
/// not provide. `matched` reports whether the live value has exactly the recorded structure.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildMatch<'a> {
    pub children: Vec<Option<&'a TreeValue>>,
    pub matched: bool,
}

/// Extracts ordered children from a live value for one spec node. The flag is the caller's
/// strict setting.
pub type FlattenSpecFn = Arc<
    dyn for<'a> Fn(&'a TreeValue, &NodeSpec, bool) -> Result<ChildMatch<'a>, PytreeError>
        + Send
        + Sync,
>;

static FLATTEN_SPEC_REGISTRY: Lazy<RwLock<HashMap<TypeTag, FlattenSpecFn>>> =
    Lazy::new(|| RwLock::new(builtin_handlers()));

fn builtin_handlers() -> HashMap<TypeTag, FlattenSpecFn> {
    let mut handlers: HashMap<TypeTag, FlattenSpecFn> = HashMap::new();
    handlers.insert(TypeTag::DICT, Arc::new(dict_flatten_spec));
    handlers.insert(TypeTag::LIST, Arc::new(sequence_flatten_spec));
    handlers.insert(TypeTag::TUPLE, Arc::new(sequence_flatten_spec));
    handlers.insert(TypeTag::NAMEDTUPLE, Arc::new(sequence_flatten_spec));
    handlers
}

/// Registers `f` as the flatten-spec function for `tag`, replacing any previous one.
pub fn register_flatten_spec<F>(tag: TypeTag, f: F)
where
    F: for<'a> Fn(&'a TreeValue, &NodeSpec, bool) -> Result<ChildMatch<'a>, PytreeError>
        + Send
        + Sync
        + 'static,
{
    log::debug!("registering flatten-spec function for {tag}");
    FLATTEN_SPEC_REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(tag, Arc::new(f));
}

pub fn is_registered(tag: &TypeTag) -> bool {
    FLATTEN_SPEC_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(tag)
}

pub(crate) fn lookup(tag: &TypeTag) -> Option<FlattenSpecFn> {
    FLATTEN_SPEC_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(tag)
        .cloned()
}

/// Children in recorded key order; matched when the live mapping has exactly the recorded keys.
pub fn dict_flatten_spec<'a>(
    value: &'a TreeValue,
    spec: &NodeSpec,
    _strict: bool,
) -> Result<ChildMatch<'a>, PytreeError> {
    let TreeValue::Dict(entries) = value else {
        return Err(PytreeError::TypeMismatch {
            expected: spec.type_tag().clone(),
            found: value.kind().to_string(),
        });
    };
    let keys = match spec.context() {
        SpecContext::Keys(keys) => keys.as_slice(),
        SpecContext::None | SpecContext::Fields { .. } => &[],
    };
    let children: Vec<Option<&TreeValue>> = keys.iter().map(|key| value.get(key)).collect();
    let matched = entries.len() == keys.len() && children.iter().all(Option::is_some);
    Ok(ChildMatch { children, matched })
}

/// The first N positional elements, N being the recorded child count; matched when the live
/// sequence has exactly N elements.
pub fn sequence_flatten_spec<'a>(
    value: &'a TreeValue,
    spec: &NodeSpec,
    _strict: bool,
) -> Result<ChildMatch<'a>, PytreeError> {
    match value {
        TreeValue::List(_) | TreeValue::Tuple(_) | TreeValue::NamedTuple { .. } => {}
        TreeValue::Leaf(_) | TreeValue::Dict(_) | TreeValue::Custom { .. } => {
            return Err(PytreeError::TypeMismatch {
                expected: spec.type_tag().clone(),
                found: value.kind().to_string(),
            });
        }
    }
    let expected = spec.num_children();
    let children = (0..expected).map(|index| value.get_index(index)).collect();
    Ok(ChildMatch {
        children,
        matched: value.len() == expected,
    })
}

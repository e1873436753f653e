use super::registry::{self, ChildMatch};
use super::spec::{NodeSpec, SpecContext, TreeSpec};
use super::value::{TreeValue, TypeTag};
use super::PytreeError;

/// Leaves of a non-strict match together with whether every node matched its recorded shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FlattenReport<'a> {
    pub leaves: Vec<&'a TreeValue>,
    pub matched: bool,
}

/// Flattens `value` against a recorded `spec`, returning leaves in spec order.
///
/// A leaf spec yields the live value itself, whatever its shape. Internal nodes dispatch to the
/// flatten-spec function registered for their type tag. With `strict` set, a top-level live value
/// that does not have exactly the recorded structure fails with
/// [`PytreeError::StructureMismatch`]. Nested nodes are always matched leniently: children the
/// live value lacks are skipped and extra ones are ignored.
pub fn tree_flatten_spec<'a>(
    value: &'a TreeValue,
    spec: &TreeSpec,
    strict: bool,
) -> Result<Vec<&'a TreeValue>, PytreeError> {
    let mut leaves = Vec::with_capacity(spec.num_leaves());
    let mut matched = true;
    flatten_into(value, spec, strict, &mut leaves, &mut matched)?;
    Ok(leaves)
}

/// Non-strict flatten that also reports whether the live value matched the spec everywhere.
pub fn tree_flatten_spec_report<'a>(
    value: &'a TreeValue,
    spec: &TreeSpec,
) -> Result<FlattenReport<'a>, PytreeError> {
    let mut leaves = Vec::with_capacity(spec.num_leaves());
    let mut matched = true;
    flatten_into(value, spec, false, &mut leaves, &mut matched)?;
    Ok(FlattenReport { leaves, matched })
}

fn flatten_into<'a>(
    value: &'a TreeValue,
    spec: &TreeSpec,
    strict: bool,
    leaves: &mut Vec<&'a TreeValue>,
    matched: &mut bool,
) -> Result<(), PytreeError> {
    let node = match spec {
        TreeSpec::Leaf => {
            leaves.push(value);
            return Ok(());
        }
        TreeSpec::Node(node) => node,
    };
    let flatten_fn =
        registry::lookup(node.type_tag()).ok_or_else(|| PytreeError::MissingRegistration {
            tag: node.type_tag().clone(),
        })?;
    let ChildMatch {
        children,
        matched: node_matched,
    } = flatten_fn(value, node, strict)?;
    if !node_matched {
        if strict {
            return Err(PytreeError::StructureMismatch {
                tag: node.type_tag().clone(),
                expected: node.num_children(),
                found: value.len(),
            });
        }
        log::debug!(
            "{} value does not match recorded {} node; continuing non-strict",
            value.kind(),
            node.type_tag()
        );
        *matched = false;
    }
    for (child, child_spec) in children.into_iter().zip(node.children()) {
        if let Some(child) = child {
            flatten_into(child, child_spec, false, leaves, matched)?;
        }
    }
    Ok(())
}

/// Flattens `value` and records its structure, so it can later be matched with
/// [`tree_flatten_spec`].
pub fn tree_flatten(value: &TreeValue) -> (Vec<&TreeValue>, TreeSpec) {
    let mut leaves = Vec::new();
    let spec = record(value, &mut leaves);
    (leaves, spec)
}

fn record<'a>(value: &'a TreeValue, leaves: &mut Vec<&'a TreeValue>) -> TreeSpec {
    let (tag, context, children) = match value {
        TreeValue::Leaf(_) => {
            leaves.push(value);
            return TreeSpec::Leaf;
        }
        TreeValue::Dict(entries) => {
            let (keys, children) = record_keyed(entries, leaves);
            (TypeTag::DICT, SpecContext::Keys(keys), children)
        }
        TreeValue::List(items) => (
            TypeTag::LIST,
            SpecContext::None,
            items.iter().map(|child| record(child, leaves)).collect(),
        ),
        TreeValue::Tuple(items) => (
            TypeTag::TUPLE,
            SpecContext::None,
            items.iter().map(|child| record(child, leaves)).collect(),
        ),
        TreeValue::NamedTuple { name, fields } => {
            let (field_names, children) = record_keyed(fields, leaves);
            let context = SpecContext::Fields {
                name: name.clone(),
                fields: field_names,
            };
            (TypeTag::NAMEDTUPLE, context, children)
        }
        TreeValue::Custom { tag, entries } => {
            let (keys, children) = record_keyed(entries, leaves);
            (tag.clone(), SpecContext::Keys(keys), children)
        }
    };
    TreeSpec::Node(NodeSpec::recorded(tag, context, children))
}

fn record_keyed<'a>(
    entries: &'a [(String, TreeValue)],
    leaves: &mut Vec<&'a TreeValue>,
) -> (Vec<String>, Vec<TreeSpec>) {
    let keys = entries.iter().map(|(key, _)| key.clone()).collect();
    let children = entries
        .iter()
        .map(|(_, child)| record(child, leaves))
        .collect();
    (keys, children)
}

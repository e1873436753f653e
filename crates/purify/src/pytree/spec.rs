//! Recorded tree schemas.
//!
//! A [`TreeSpec`] is immutable once built. Internal nodes validate that their child count agrees
//! with the arity implied by their context, both on construction and when loaded from JSON.

use serde::{Deserialize, Serialize};

use super::value::TypeTag;
use super::PytreeError;

/// Per-node data recorded alongside the children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecContext {
    None,
    /// Mapping keys in recorded order.
    Keys(Vec<String>),
    /// Named-tuple type name and field names.
    Fields { name: String, fields: Vec<String> },
}

impl SpecContext {
    /// Child count implied by the context, when it implies one.
    pub fn arity(&self) -> Option<usize> {
        match self {
            SpecContext::None => None,
            SpecContext::Keys(keys) => Some(keys.len()),
            SpecContext::Fields { fields, .. } => Some(fields.len()),
        }
    }

    pub fn keys(&self) -> Option<&[String]> {
        match self {
            SpecContext::Keys(keys) => Some(keys),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawNodeSpec")]
pub struct NodeSpec {
    type_tag: TypeTag,
    context: SpecContext,
    children: Vec<TreeSpec>,
}

#[derive(Deserialize)]
struct RawNodeSpec {
    type_tag: TypeTag,
    context: SpecContext,
    children: Vec<TreeSpec>,
}

impl TryFrom<RawNodeSpec> for NodeSpec {
    type Error = PytreeError;

    fn try_from(raw: RawNodeSpec) -> Result<Self, Self::Error> {
        NodeSpec::new(raw.type_tag, raw.context, raw.children)
    }
}

impl NodeSpec {
    pub fn new(
        type_tag: TypeTag,
        context: SpecContext,
        children: Vec<TreeSpec>,
    ) -> Result<Self, PytreeError> {
        if let Some(expected) = context.arity() {
            if expected != children.len() {
                return Err(PytreeError::ArityMismatch {
                    tag: type_tag,
                    expected,
                    found: children.len(),
                });
            }
        }
        Ok(NodeSpec {
            type_tag,
            context,
            children,
        })
    }

    /// Builds a node from a structure walked by the recorder, where arity is consistent by
    /// construction.
    pub(crate) fn recorded(type_tag: TypeTag, context: SpecContext, children: Vec<TreeSpec>) -> Self {
        NodeSpec {
            type_tag,
            context,
            children,
        }
    }

    pub fn type_tag(&self) -> &TypeTag {
        &self.type_tag
    }

    pub fn context(&self) -> &SpecContext {
        &self.context
    }

    pub fn children(&self) -> &[TreeSpec] {
        &self.children
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }
}

/// Recorded shape of a nested container value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeSpec {
    Leaf,
    Node(NodeSpec),
}

impl TreeSpec {
    pub fn node(
        type_tag: TypeTag,
        context: SpecContext,
        children: Vec<TreeSpec>,
    ) -> Result<Self, PytreeError> {
        NodeSpec::new(type_tag, context, children).map(TreeSpec::Node)
    }

    pub fn dict<K: Into<String>>(
        keys: impl IntoIterator<Item = K>,
        children: Vec<TreeSpec>,
    ) -> Result<Self, PytreeError> {
        let keys = keys.into_iter().map(Into::into).collect();
        Self::node(TypeTag::DICT, SpecContext::Keys(keys), children)
    }

    pub fn list(children: Vec<TreeSpec>) -> Self {
        TreeSpec::Node(NodeSpec {
            type_tag: TypeTag::LIST,
            context: SpecContext::None,
            children,
        })
    }

    pub fn tuple(children: Vec<TreeSpec>) -> Self {
        TreeSpec::Node(NodeSpec {
            type_tag: TypeTag::TUPLE,
            context: SpecContext::None,
            children,
        })
    }

    pub fn named_tuple<K: Into<String>>(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = K>,
        children: Vec<TreeSpec>,
    ) -> Result<Self, PytreeError> {
        let context = SpecContext::Fields {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        };
        Self::node(TypeTag::NAMEDTUPLE, context, children)
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, TreeSpec::Leaf)
    }

    pub fn as_node(&self) -> Option<&NodeSpec> {
        match self {
            TreeSpec::Leaf => None,
            TreeSpec::Node(node) => Some(node),
        }
    }

    /// Number of leaves the spec produces when a value matches it exactly.
    pub fn num_leaves(&self) -> usize {
        match self {
            TreeSpec::Leaf => 1,
            TreeSpec::Node(node) => node.children.iter().map(TreeSpec::num_leaves).sum(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_spec_requires_one_child_per_key() {
        let err = TreeSpec::dict(["a", "b"], vec![TreeSpec::Leaf]).unwrap_err();
        assert!(matches!(
            err,
            PytreeError::ArityMismatch {
                expected: 2,
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn json_load_rejects_inconsistent_arity() {
        let raw = r#"{"kind":"node","type_tag":"dict","context":{"keys":["a","b"]},"children":[{"kind":"leaf"}]}"#;
        assert!(TreeSpec::from_json(raw).is_err());
    }

    #[test]
    fn json_round_trip_keeps_structure() {
        let spec = TreeSpec::dict(
            ["x", "y"],
            vec![TreeSpec::list(vec![TreeSpec::Leaf, TreeSpec::Leaf]), TreeSpec::Leaf],
        )
        .expect("valid spec");
        let raw = spec.to_json().expect("serializable");
        assert_eq!(TreeSpec::from_json(&raw).expect("loadable"), spec);
        assert_eq!(spec.num_leaves(), 3);
    }
}

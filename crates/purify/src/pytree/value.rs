use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tensor::TensorMeta;

/// Structural type tag of a container node (`dict`, `list`, a user type name, ...).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(Cow<'static, str>);

impl TypeTag {
    pub const DICT: TypeTag = TypeTag(Cow::Borrowed("dict"));
    pub const LIST: TypeTag = TypeTag(Cow::Borrowed("list"));
    pub const TUPLE: TypeTag = TypeTag(Cow::Borrowed("tuple"));
    pub const NAMEDTUPLE: TypeTag = TypeTag(Cow::Borrowed("namedtuple"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        TypeTag(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal value stored at a leaf of a container tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Leaf {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tensor(TensorMeta),
}

/// A live nested container value.
///
/// Mapping-like nodes keep their entries in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeValue {
    Leaf(Leaf),
    Dict(Vec<(String, TreeValue)>),
    List(Vec<TreeValue>),
    Tuple(Vec<TreeValue>),
    NamedTuple {
        name: String,
        fields: Vec<(String, TreeValue)>,
    },
    /// A user-defined container identified by `tag`; flattening it requires a registered
    /// flatten-spec function for that tag.
    Custom {
        tag: TypeTag,
        entries: Vec<(String, TreeValue)>,
    },
}

impl TreeValue {
    pub fn dict<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, TreeValue)>,
    {
        TreeValue::Dict(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    pub fn list(items: impl IntoIterator<Item = TreeValue>) -> Self {
        TreeValue::List(items.into_iter().collect())
    }

    pub fn tuple(items: impl IntoIterator<Item = TreeValue>) -> Self {
        TreeValue::Tuple(items.into_iter().collect())
    }

    pub fn named_tuple<K, I>(name: impl Into<String>, fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, TreeValue)>,
    {
        TreeValue::NamedTuple {
            name: name.into(),
            fields: fields
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        }
    }

    pub fn custom<K, I>(tag: TypeTag, entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, TreeValue)>,
    {
        TreeValue::Custom {
            tag,
            entries: entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        }
    }

    /// Type tag of a container node; `None` for leaves.
    pub fn type_tag(&self) -> Option<TypeTag> {
        match self {
            TreeValue::Leaf(_) => None,
            TreeValue::Dict(_) => Some(TypeTag::DICT),
            TreeValue::List(_) => Some(TypeTag::LIST),
            TreeValue::Tuple(_) => Some(TypeTag::TUPLE),
            TreeValue::NamedTuple { .. } => Some(TypeTag::NAMEDTUPLE),
            TreeValue::Custom { tag, .. } => Some(tag.clone()),
        }
    }

    /// Short description used in error messages.
    pub fn kind(&self) -> &str {
        match self {
            TreeValue::Leaf(_) => "leaf",
            TreeValue::Dict(_) => "dict",
            TreeValue::List(_) => "list",
            TreeValue::Tuple(_) => "tuple",
            TreeValue::NamedTuple { .. } => "namedtuple",
            TreeValue::Custom { tag, .. } => tag.as_str(),
        }
    }

    pub fn as_leaf(&self) -> Option<&Leaf> {
        match self {
            TreeValue::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    /// Number of direct children; zero for leaves.
    pub fn len(&self) -> usize {
        match self {
            TreeValue::Leaf(_) => 0,
            TreeValue::List(items) | TreeValue::Tuple(items) => items.len(),
            TreeValue::Dict(entries)
            | TreeValue::NamedTuple {
                fields: entries, ..
            }
            | TreeValue::Custom { entries, .. } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a keyed child of a dict, named tuple or custom node.
    pub fn get(&self, key: &str) -> Option<&TreeValue> {
        match self {
            TreeValue::Dict(entries)
            | TreeValue::NamedTuple {
                fields: entries, ..
            }
            | TreeValue::Custom { entries, .. } => entries
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value),
            TreeValue::Leaf(_) | TreeValue::List(_) | TreeValue::Tuple(_) => None,
        }
    }

    /// Positional child of a list, tuple or named tuple.
    pub fn get_index(&self, index: usize) -> Option<&TreeValue> {
        match self {
            TreeValue::List(items) | TreeValue::Tuple(items) => items.get(index),
            TreeValue::NamedTuple { fields, .. } => fields.get(index).map(|(_, value)| value),
            TreeValue::Leaf(_) | TreeValue::Dict(_) | TreeValue::Custom { .. } => None,
        }
    }
}

impl From<Leaf> for TreeValue {
    fn from(leaf: Leaf) -> Self {
        TreeValue::Leaf(leaf)
    }
}

impl From<bool> for TreeValue {
    fn from(value: bool) -> Self {
        TreeValue::Leaf(Leaf::Bool(value))
    }
}

impl From<i64> for TreeValue {
    fn from(value: i64) -> Self {
        TreeValue::Leaf(Leaf::Int(value))
    }
}

impl From<f64> for TreeValue {
    fn from(value: f64) -> Self {
        TreeValue::Leaf(Leaf::Float(value))
    }
}

impl From<&str> for TreeValue {
    fn from(value: &str) -> Self {
        TreeValue::Leaf(Leaf::Str(value.to_string()))
    }
}

impl From<TensorMeta> for TreeValue {
    fn from(meta: TensorMeta) -> Self {
        TreeValue::Leaf(Leaf::Tensor(meta))
    }
}

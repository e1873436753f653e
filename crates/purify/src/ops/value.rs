//! Argument and result containers shared by the dispatcher and backends.

use std::collections::BTreeMap;

/// Non-tensor scalar argument or result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Bool(value) => f64::from(u8::from(value)),
            Scalar::Int(value) => value as f64,
            Scalar::Float(value) => value,
        }
    }

    pub fn as_i64(self) -> Option<i64> {
        match self {
            Scalar::Bool(value) => Some(i64::from(value)),
            Scalar::Int(value) => Some(value),
            Scalar::Float(_) => None,
        }
    }
}

/// A (possibly nested) operator argument or result whose tensors are of type `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<T> {
    None,
    Scalar(Scalar),
    Tensor(T),
    List(Vec<Value<T>>),
}

impl<T> Value<T> {
    pub fn as_tensor(&self) -> Option<&T> {
        match self {
            Value::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn into_tensor(self) -> Option<T> {
        match self {
            Value::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Value::Scalar(scalar) => Some(*scalar),
            _ => None,
        }
    }

    /// Rebuilds the value with every tensor replaced by `f(tensor)`, preserving structure.
    pub fn try_map<U, E, F>(self, mut f: F) -> Result<Value<U>, E>
    where
        F: FnMut(T) -> Result<U, E>,
    {
        self.try_map_with(&mut f)
    }

    /// Borrowing counterpart of [`Value::try_map`].
    pub fn try_map_ref<U, E, F>(&self, mut f: F) -> Result<Value<U>, E>
    where
        F: FnMut(&T) -> Result<U, E>,
    {
        self.try_map_ref_with(&mut f)
    }

    /// Visits every tensor in depth-first, left-to-right order.
    pub fn for_each_tensor<F>(&self, mut f: F)
    where
        F: FnMut(&T),
    {
        self.visit(&mut f);
    }

    pub(crate) fn try_map_with<U, E, F>(self, f: &mut F) -> Result<Value<U>, E>
    where
        F: FnMut(T) -> Result<U, E>,
    {
        Ok(match self {
            Value::None => Value::None,
            Value::Scalar(scalar) => Value::Scalar(scalar),
            Value::Tensor(tensor) => Value::Tensor(f(tensor)?),
            Value::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| item.try_map_with(&mut *f))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    pub(crate) fn try_map_ref_with<U, E, F>(&self, f: &mut F) -> Result<Value<U>, E>
    where
        F: FnMut(&T) -> Result<U, E>,
    {
        Ok(match self {
            Value::None => Value::None,
            Value::Scalar(scalar) => Value::Scalar(*scalar),
            Value::Tensor(tensor) => Value::Tensor(f(tensor)?),
            Value::List(items) => Value::List(
                items
                    .iter()
                    .map(|item| item.try_map_ref_with(&mut *f))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    fn visit<F>(&self, f: &mut F)
    where
        F: FnMut(&T),
    {
        match self {
            Value::Tensor(tensor) => f(tensor),
            Value::List(items) => items.iter().for_each(|item| item.visit(&mut *f)),
            Value::None | Value::Scalar(_) => {}
        }
    }
}

impl<T> From<Scalar> for Value<T> {
    fn from(scalar: Scalar) -> Self {
        Value::Scalar(scalar)
    }
}

impl<T> From<f64> for Value<T> {
    fn from(value: f64) -> Self {
        Value::Scalar(Scalar::Float(value))
    }
}

impl<T> From<i64> for Value<T> {
    fn from(value: i64) -> Self {
        Value::Scalar(Scalar::Int(value))
    }
}

/// Positional and keyword arguments of a single operator call.
#[derive(Debug, Clone, PartialEq)]
pub struct OpArgs<T> {
    pub args: Vec<Value<T>>,
    pub kwargs: BTreeMap<String, Value<T>>,
}

impl<T> OpArgs<T> {
    pub fn new(args: Vec<Value<T>>) -> Self {
        OpArgs {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    /// Convenience constructor for calls whose arguments are all tensors.
    pub fn tensors<I>(tensors: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        Self::new(tensors.into_iter().map(Value::Tensor).collect())
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: Value<T>) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    pub fn arg(&self, index: usize) -> Option<&Value<T>> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value<T>> {
        self.kwargs.get(name)
    }

    pub fn try_map<U, E, F>(self, mut f: F) -> Result<OpArgs<U>, E>
    where
        F: FnMut(T) -> Result<U, E>,
    {
        let args = self
            .args
            .into_iter()
            .map(|value| value.try_map_with(&mut f))
            .collect::<Result<_, _>>()?;
        let kwargs = self
            .kwargs
            .into_iter()
            .map(|(name, value)| -> Result<(String, Value<U>), E> {
                Ok((name, value.try_map_with(&mut f)?))
            })
            .collect::<Result<_, E>>()?;
        Ok(OpArgs { args, kwargs })
    }

    pub fn try_map_ref<U, E, F>(&self, mut f: F) -> Result<OpArgs<U>, E>
    where
        F: FnMut(&T) -> Result<U, E>,
    {
        let args = self
            .args
            .iter()
            .map(|value| value.try_map_ref_with(&mut f))
            .collect::<Result<_, _>>()?;
        let kwargs = self
            .kwargs
            .iter()
            .map(|(name, value)| -> Result<(String, Value<U>), E> {
                Ok((name.clone(), value.try_map_ref_with(&mut f)?))
            })
            .collect::<Result<_, E>>()?;
        Ok(OpArgs { args, kwargs })
    }

    /// Visits positional tensors first, then keyword tensors in key order.
    pub fn for_each_tensor<F>(&self, mut f: F)
    where
        F: FnMut(&T),
    {
        for value in &self.args {
            value.visit(&mut f);
        }
        for value in self.kwargs.values() {
            value.visit(&mut f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_map_preserves_nesting() {
        let value: Value<u32> = Value::List(vec![
            Value::Tensor(1),
            Value::Scalar(Scalar::Int(7)),
            Value::List(vec![Value::Tensor(2), Value::None]),
        ]);
        let mapped = value
            .try_map(|t| Ok::<_, ()>(format!("t{t}")))
            .expect("mapping is infallible");
        assert_eq!(
            mapped,
            Value::List(vec![
                Value::Tensor("t1".to_string()),
                Value::Scalar(Scalar::Int(7)),
                Value::List(vec![Value::Tensor("t2".to_string()), Value::None]),
            ])
        );
    }

    #[test]
    fn visits_positional_then_keyword_tensors() {
        let args = OpArgs::tensors([1, 2]).with_kwarg("out", Value::Tensor(3));
        let mut seen = Vec::new();
        args.for_each_tensor(|t| seen.push(*t));
        assert_eq!(seen, vec![1, 2, 3]);
    }
}

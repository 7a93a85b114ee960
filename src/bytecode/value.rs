//! Literal values and literal array shapes.
//!
//! The rewrite side of the eliminator materializes values it has proven
//! constant: a collapsed array-builder chain becomes a single construction
//! instruction, and a path query with a statically known result becomes a
//! plain literal push. Both rewrites are expressed in terms of [`Value`] and
//! [`ArrayLit`].

use std::fmt;

/// A literal value a single instruction can push.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Integer literal.
    Int(i64),
    /// Floating point literal.
    Dbl(f64),
    /// String literal.
    Str(String),
    /// Boolean literal.
    Bool(bool),
    /// Null literal.
    Null,
    /// Fully known literal array.
    Arr(ArrayLit),
}

impl Value {
    /// Returns `true` if this value is a scalar (not an array).
    #[must_use]
    pub const fn is_scalar(&self) -> bool {
        !matches!(self, Value::Arr(_))
    }
}

/// A key in a literal array entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArrayKey {
    /// Integer key.
    Int(i64),
    /// String key.
    Str(String),
}

impl fmt::Display for ArrayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayKey::Int(i) => write!(f, "{i}"),
            ArrayKey::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// An ordered literal array: the payload of a materialized array push.
///
/// Entry order is insertion order and is observable, so it is preserved by
/// every rewrite that explodes or rebuilds a literal.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArrayLit {
    entries: Vec<(ArrayKey, Value)>,
}

impl ArrayLit {
    /// Creates a literal array from ordered entries.
    #[must_use]
    pub fn new(entries: Vec<(ArrayKey, Value)>) -> Self {
        Self { entries }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the array has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The ordered entries.
    #[must_use]
    pub fn entries(&self) -> &[(ArrayKey, Value)] {
        &self.entries
    }

    /// Returns `true` if the keys are exactly `0..len` in order.
    ///
    /// Packed arrays can be rebuilt from their values alone.
    #[must_use]
    pub fn is_packed(&self) -> bool {
        self.entries
            .iter()
            .enumerate()
            .all(|(i, (k, _))| matches!(k, ArrayKey::Int(n) if *n == i as i64))
    }

    /// The string keys, in order, if every key is a string.
    #[must_use]
    pub fn string_keys(&self) -> Option<Vec<String>> {
        self.entries
            .iter()
            .map(|(k, _)| match k {
                ArrayKey::Str(s) => Some(s.clone()),
                ArrayKey::Int(_) => None,
            })
            .collect()
    }

    /// Iterates the values in entry order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }
}

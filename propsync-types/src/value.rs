//! Values carried over the wire.

use serde::{Deserialize, Serialize};

/// A synchronizable property value.
///
/// Vector and matrix-like host values are flattened to [`SyncValue::Vector`]
/// by [`SyncValue::normalized`] before they are compared or published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncValue {
    Number(f64),
    Integer(i64),
    Bool(bool),
    Vector(Vec<f64>),
    Matrix(Vec<Vec<f64>>),
    Text(String),
}

impl SyncValue {
    /// Flatten matrix-like values into a row-major vector.
    pub fn normalized(self) -> Self {
        match self {
            SyncValue::Matrix(rows) => SyncValue::Vector(rows.into_iter().flatten().collect()),
            other => other,
        }
    }

    /// Change-detection equality.
    ///
    /// Floats compare by bit pattern so a NaN that stays NaN is "unchanged".
    pub fn same_as(&self, other: &SyncValue) -> bool {
        match (self, other) {
            (SyncValue::Number(a), SyncValue::Number(b)) => a.to_bits() == b.to_bits(),
            (SyncValue::Vector(a), SyncValue::Vector(b)) => same_floats(a, b),
            (SyncValue::Matrix(a), SyncValue::Matrix(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| same_floats(x, y))
            }
            _ => self == other,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            SyncValue::Number(n) => Some(*n),
            SyncValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            SyncValue::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SyncValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Short name of the variant, used in type-mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncValue::Number(_) => "number",
            SyncValue::Integer(_) => "integer",
            SyncValue::Bool(_) => "bool",
            SyncValue::Vector(_) => "vector",
            SyncValue::Matrix(_) => "matrix",
            SyncValue::Text(_) => "text",
        }
    }
}

fn same_floats(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}

impl From<f64> for SyncValue {
    fn from(n: f64) -> Self {
        SyncValue::Number(n)
    }
}

impl From<i64> for SyncValue {
    fn from(i: i64) -> Self {
        SyncValue::Integer(i)
    }
}

impl From<bool> for SyncValue {
    fn from(b: bool) -> Self {
        SyncValue::Bool(b)
    }
}

impl From<Vec<f64>> for SyncValue {
    fn from(v: Vec<f64>) -> Self {
        SyncValue::Vector(v)
    }
}

impl<const N: usize> From<[f64; N]> for SyncValue {
    fn from(v: [f64; N]) -> Self {
        SyncValue::Vector(v.to_vec())
    }
}

impl From<&str> for SyncValue {
    fn from(s: &str) -> Self {
        SyncValue::Text(s.to_string())
    }
}

impl From<String> for SyncValue {
    fn from(s: String) -> Self {
        SyncValue::Text(s)
    }
}

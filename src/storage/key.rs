//! Totally ordered keys over JSON values.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

/// Total order used by indexes and sorts: NULL < booleans < numbers < strings.
///
/// Numbers compare by value, so `1` and `1.0` are equal keys.
pub fn compare_total(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => compare_slices(x, y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Lexicographic [`compare_total`] over value slices.
pub fn compare_slices(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = compare_total(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// A composite key usable in ordered maps.
#[derive(Debug, Clone)]
pub struct IndexKey(pub Vec<Value>);

impl IndexKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// True if any component is NULL. NULL keys never match an equality probe.
    pub fn has_null(&self) -> bool {
        self.0.iter().any(Value::is_null)
    }

    /// True if `prefix` equals the leading components of this key.
    pub fn starts_with(&self, prefix: &[Value]) -> bool {
        prefix.len() <= self.0.len()
            && compare_slices(&self.0[..prefix.len()], prefix) == Ordering::Equal
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_slices(&self.0, &other.0)
    }
}

impl std::hash::Hash for IndexKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for value in &self.0 {
            match value {
                Value::Number(n) => {
                    // Whole floats hash like the equal integer.
                    let f = n.as_f64().unwrap_or(f64::NAN);
                    if f.fract() == 0.0 && f.abs() < 9.0e15 {
                        (f as i64).hash(state)
                    } else {
                        f.to_bits().hash(state)
                    }
                }
                other => other.to_string().hash(state),
            }
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        write!(f, "({})", parts.join(", "))
    }
}

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A single column value: a primitive or an opaque JSON document.
///
/// Values carry no declared type of their own; typing lives in
/// [`TableSpec`](crate::TableSpec). Values are totally ordered so that they
/// can serve as sort keys: nulls order first, then booleans, then numbers
/// (integers and doubles compare numerically), then text, then JSON documents
/// (by canonical serialization).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Integer(i64),
    /// A double-precision float.
    Double(f64),
    /// Text.
    Text(Arc<str>),
    /// An opaque JSON document (object or array).
    Json(Arc<serde_json::Value>),
}

impl Value {
    /// Rank used as the first key of the total order.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) | Value::Double(_) => 2,
            Value::Text(_) => 3,
            Value::Json(_) => 4,
        }
    }

    /// True for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The text contents, if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The integer contents, if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Double(a), Double(b)) => a.total_cmp(b),
            // Cross-numeric comparisons are numeric, with the variant tag as
            // a deterministic tiebreaker so that Eq stays consistent with Ord
            // (Integer(1) != Double(1.0)).
            (Integer(a), Double(b)) => (*a as f64).total_cmp(b).then(Ordering::Less),
            (Double(a), Integer(b)) => a.total_cmp(&(*b as f64)).then(Ordering::Greater),
            (Text(a), Text(b)) => a.cmp(b),
            (Json(a), Json(b)) => {
                if a == b {
                    Ordering::Equal
                } else {
                    canonical_json(a).cmp(&canonical_json(b))
                }
            }
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            // Numeric values hash by their f64 bit pattern so that hashing is
            // well-defined; Integer and Double never compare equal anyway.
            Value::Integer(i) => (0u8, *i).hash(state),
            Value::Double(d) => (1u8, d.to_bits()).hash(state),
            Value::Text(s) => s.hash(state),
            Value::Json(v) => canonical_json(v).hash(state),
        }
    }
}

/// Canonical serialization of a JSON document: `serde_json` maps are sorted,
/// so `to_string` is deterministic for equal documents.
fn canonical_json(v: &serde_json::Value) -> String {
    serde_json::to_string(v).expect("serde_json::Value serialization is infallible")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i.into())
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s.into())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(Arc::new(v))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn order_is_type_ranked_with_nulls_first() {
        let mut vals = vec![
            Value::from("a"),
            Value::Null,
            Value::from(2i64),
            Value::from(true),
            Value::from(1.5),
        ];
        vals.sort();
        assert_eq!(
            vals,
            vec![
                Value::Null,
                Value::from(true),
                Value::from(1.5),
                Value::from(2i64),
                Value::from("a"),
            ]
        );
    }

    #[test]
    fn cross_numeric_compare_is_numeric() {
        assert!(Value::from(1i64) < Value::from(1.5));
        assert!(Value::from(2i64) > Value::from(1.5));
        // Equal numerically, but not Eq; the variant tag breaks the tie.
        assert!(Value::from(1i64) < Value::from(1.0));
        assert_ne!(Value::from(1i64), Value::from(1.0));
    }

    #[test]
    fn serde_is_untagged() {
        let v: Value = serde_json::from_str("42").unwrap();
        assert_eq!(v, Value::from(42i64));
        let v: Value = serde_json::from_str("\"x\"").unwrap();
        assert_eq!(v, Value::from("x"));
        let v: Value = serde_json::from_str("null").unwrap();
        assert!(v.is_null());
        assert_eq!(serde_json::to_string(&Value::from(false)).unwrap(), "false");
    }
}

//! Row-level predicate evaluation for the filter operator.

use std::cmp::Ordering;

use viewsync_ast::{CompareOp, Condition};
use viewsync_data::{Row, Value};
use viewsync_errors::{internal, SyncResult};

/// Evaluate a condition against one row.
///
/// `Exists` conditions are compiled into dedicated operators by the pipeline
/// builder and must never reach this evaluator.
pub(crate) fn eval(condition: &Condition, row: &Row) -> SyncResult<bool> {
    match condition {
        Condition::And { conditions } => {
            for c in conditions {
                if !eval(c, row)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Condition::Or { conditions } => {
            for c in conditions {
                if eval(c, row)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Condition::Compare { column, op, value } => {
            let lhs = row.get(column).unwrap_or(&Value::Null);
            Ok(match op {
                CompareOp::Is => lhs.is_null(),
                CompareOp::IsNot => !lhs.is_null(),
                CompareOp::Eq => compare(lhs, value) == Some(Ordering::Equal),
                CompareOp::Ne => {
                    matches!(compare(lhs, value), Some(ord) if ord != Ordering::Equal)
                }
                CompareOp::Lt => compare(lhs, value) == Some(Ordering::Less),
                CompareOp::Le => matches!(
                    compare(lhs, value),
                    Some(Ordering::Less | Ordering::Equal)
                ),
                CompareOp::Gt => compare(lhs, value) == Some(Ordering::Greater),
                CompareOp::Ge => matches!(
                    compare(lhs, value),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
            })
        }
        Condition::In { column, values } => {
            let lhs = row.get(column).unwrap_or(&Value::Null);
            Ok(values
                .iter()
                .any(|v| compare(lhs, v) == Some(Ordering::Equal)))
        }
        Condition::Exists { .. } => {
            internal!("exists condition reached the filter evaluator")
        }
    }
}

/// SQL-flavored comparison: `None` when either side is NULL or the types are
/// incomparable; integers and doubles compare numerically (so `1 = 1.0`).
pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    use Value::*;
    match (a, b) {
        (Null, _) | (_, Null) => None,
        (Bool(x), Bool(y)) => Some(x.cmp(y)),
        (Integer(x), Integer(y)) => Some(x.cmp(y)),
        (Double(x), Double(y)) => Some(x.total_cmp(y)),
        (Integer(x), Double(y)) => Some((*x as f64).total_cmp(y)),
        (Double(x), Integer(y)) => Some(x.total_cmp(&(*y as f64))),
        (Text(x), Text(y)) => Some(x.cmp(y)),
        (Json(_), Json(_)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use viewsync_data::Value;

    use super::*;

    fn row() -> Row {
        Row::from_iter([
            ("id", Value::from(1i64)),
            ("title", Value::from("a")),
            ("closed", Value::from(false)),
            ("assignee", Value::Null),
        ])
    }

    fn compare_cond(column: &str, op: CompareOp, value: impl Into<Value>) -> Condition {
        Condition::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    #[test]
    fn simple_comparisons() {
        assert!(eval(&compare_cond("id", CompareOp::Eq, 1i64), &row()).unwrap());
        assert!(eval(&compare_cond("id", CompareOp::Eq, 1.0), &row()).unwrap());
        assert!(!eval(&compare_cond("id", CompareOp::Gt, 1i64), &row()).unwrap());
        assert!(eval(&compare_cond("title", CompareOp::Ge, "a"), &row()).unwrap());
        assert!(!eval(&compare_cond("closed", CompareOp::Eq, true), &row()).unwrap());
    }

    #[test]
    fn null_never_compares() {
        assert!(!eval(&compare_cond("assignee", CompareOp::Eq, "u1"), &row()).unwrap());
        assert!(!eval(&compare_cond("assignee", CompareOp::Ne, "u1"), &row()).unwrap());
        // ... except through IS / IS NOT.
        assert!(eval(
            &Condition::Compare {
                column: "assignee".into(),
                op: CompareOp::Is,
                value: Value::Null,
            },
            &row()
        )
        .unwrap());
        assert!(!eval(
            &Condition::Compare {
                column: "title".into(),
                op: CompareOp::Is,
                value: Value::Null,
            },
            &row()
        )
        .unwrap());
    }

    #[test]
    fn in_with_literal_array() {
        let cond = Condition::In {
            column: "id".into(),
            values: vec![Value::from(2i64), Value::from(1i64)],
        };
        assert!(eval(&cond, &row()).unwrap());
        let cond = Condition::In {
            column: "id".into(),
            values: vec![Value::from(3i64)],
        };
        assert!(!eval(&cond, &row()).unwrap());
    }

    #[test]
    fn nested_boolean_structure() {
        let cond = Condition::Or {
            conditions: vec![
                compare_cond("id", CompareOp::Eq, 99i64),
                Condition::And {
                    conditions: vec![
                        compare_cond("closed", CompareOp::Eq, false),
                        compare_cond("title", CompareOp::Lt, "z"),
                    ],
                },
            ],
        };
        assert!(eval(&cond, &row()).unwrap());
    }

    #[test]
    fn empty_and_is_true_empty_or_is_false() {
        assert!(eval(&Condition::And { conditions: vec![] }, &row()).unwrap());
        assert!(!eval(&Condition::Or { conditions: vec![] }, &row()).unwrap());
    }
}

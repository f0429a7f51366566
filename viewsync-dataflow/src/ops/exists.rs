//! Correlation plumbing for the exists operator and for related-child joins.
//!
//! A NULL on either side of a correlation never matches anything, so helpers
//! here return `None` instead of a constraint when any correlated value is
//! NULL.

use viewsync_ast::Correlation;
use viewsync_data::{Row, Value};

use crate::types::Constraint;

/// The values of `fields` in `row`, with missing columns read as NULL.
pub(crate) fn field_values(fields: &[String], row: &Row) -> Vec<Value> {
    fields
        .iter()
        .map(|f| row.get(f).cloned().unwrap_or(Value::Null))
        .collect()
}

/// The constraint selecting children of `parent_row` under `correlation`, or
/// `None` if any correlated parent value is NULL.
pub(crate) fn child_constraint(correlation: &Correlation, parent_row: &Row) -> Option<Constraint> {
    let values = field_values(&correlation.parent_fields, parent_row);
    if values.iter().any(Value::is_null) {
        return None;
    }
    Some(Constraint(
        correlation
            .child_fields
            .iter()
            .cloned()
            .zip(values)
            .collect(),
    ))
}

/// The constraint selecting parents of `child_row` under `correlation`, or
/// `None` if any correlated child value is NULL.
pub(crate) fn parent_constraint(correlation: &Correlation, child_row: &Row) -> Option<Constraint> {
    let values = field_values(&correlation.child_fields, child_row);
    if values.iter().any(Value::is_null) {
        return None;
    }
    Some(Constraint(
        correlation
            .parent_fields
            .iter()
            .cloned()
            .zip(values)
            .collect(),
    ))
}

/// True if the correlated values of `old` and `new` differ on the given
/// fields, i.e. an edit moved the row to a different correlation bucket.
pub(crate) fn correlation_moved(fields: &[String], old: &Row, new: &Row) -> bool {
    field_values(fields, old) != field_values(fields, new)
}

#[cfg(test)]
mod tests {
    use vec1::vec1;
    use viewsync_data::Value;

    use super::*;

    fn correlation() -> Correlation {
        Correlation {
            parent_fields: vec1!["id".to_owned()],
            child_fields: vec1!["issueId".to_owned()],
        }
    }

    #[test]
    fn child_constraint_maps_parent_values_to_child_fields() {
        let parent = Row::from_iter([("id", Value::from(7i64))]);
        let constraint = child_constraint(&correlation(), &parent).unwrap();
        assert_eq!(constraint, Constraint::from_iter([("issueId", 7i64)]));
    }

    #[test]
    fn null_correlation_values_match_nothing() {
        let parent = Row::from_iter([("id", Value::Null)]);
        assert!(child_constraint(&correlation(), &parent).is_none());

        let child = Row::from_iter([("issueId", Value::Null)]);
        assert!(parent_constraint(&correlation(), &child).is_none());
    }

    #[test]
    fn correlation_moved_detects_bucket_changes() {
        let old = Row::from_iter([("issueId", Value::from(1i64))]);
        let new = Row::from_iter([("issueId", Value::from(2i64))]);
        assert!(correlation_moved(&["issueId".to_owned()], &old, &new));
        assert!(!correlation_moved(&["issueId".to_owned()], &old, &old));
    }
}

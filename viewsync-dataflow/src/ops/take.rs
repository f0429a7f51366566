//! Window maintenance for the take operator.
//!
//! A take window is the materialized `(limit, start)` slice of its ordered
//! input, stored per scope constraint (so a take on a related child keeps one
//! window per parent row). Pushes recompute the window from the current
//! snapshot and emit the keyed difference against the stored window, which
//! handles every boundary crossing (insert into a full window, removal with
//! refill, reordering edits) uniformly.

use std::collections::BTreeSet;

use viewsync_data::{Row, RowKey, TransformationHash};
use viewsync_errors::SyncResult;

use crate::ops::TakeOp;
use crate::storage::ClientGroupStorage;
use crate::types::{Constraint, SourceChange};

/// Cut the window out of the sorted full input: rows strictly after the
/// `start` cursor, at most `limit` of them.
pub(crate) fn cut(op: &TakeOp, sorted: Vec<Row>) -> Vec<Row> {
    let after_start: Vec<Row> = match &op.start {
        None => sorted,
        Some(cursor) => sorted
            .into_iter()
            .filter(|row| op.order.compare(row, cursor) == std::cmp::Ordering::Greater)
            .collect(),
    };
    match op.limit {
        None => after_start,
        Some(limit) => after_start.into_iter().take(limit as usize).collect(),
    }
}

/// The stored window for a scope, if this scope has ever been hydrated.
pub(crate) fn stored(
    storage: &ClientGroupStorage,
    hash: TransformationHash,
    op: &TakeOp,
    scope: &Constraint,
) -> SyncResult<Option<Vec<Row>>> {
    storage.get(hash, op.id, scope)
}

/// Replace the stored window for a scope.
pub(crate) fn store(
    storage: &mut ClientGroupStorage,
    hash: TransformationHash,
    op: &TakeOp,
    scope: &Constraint,
    window: &[Row],
) -> SyncResult<()> {
    storage.put(hash, op.id, scope, &window.to_vec())
}

/// The events moving a client from `old` to `new`: removals first (freeing
/// window capacity), then additions, then in-place edits, each in window
/// order.
pub(crate) fn diff(
    key_columns: &BTreeSet<String>,
    old: &[Row],
    new: &[Row],
) -> SyncResult<Vec<SourceChange>> {
    let key_of = |row: &Row| row.key(key_columns);
    let old_keys = old
        .iter()
        .map(|r| Ok((key_of(r)?, r.clone())))
        .collect::<SyncResult<Vec<(RowKey, Row)>>>()?;
    let new_keys = new
        .iter()
        .map(|r| Ok((key_of(r)?, r.clone())))
        .collect::<SyncResult<Vec<(RowKey, Row)>>>()?;
    let new_set: BTreeSet<&RowKey> = new_keys.iter().map(|(k, _)| k).collect();
    let old_set: BTreeSet<&RowKey> = old_keys.iter().map(|(k, _)| k).collect();

    let mut events = Vec::new();
    for (key, row) in &old_keys {
        if !new_set.contains(key) {
            events.push(SourceChange::Remove(row.clone()));
        }
    }
    for (key, row) in &new_keys {
        if !old_set.contains(key) {
            events.push(SourceChange::Add(row.clone()));
        } else if let Some((_, old_row)) = old_keys.iter().find(|(k, _)| k == key) {
            if old_row != row {
                events.push(SourceChange::Edit {
                    old: old_row.clone(),
                    new: row.clone(),
                });
            }
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use viewsync_ast::OrderDirection;
    use viewsync_data::Value;

    use super::*;
    use crate::ordering::OrderSpec;
    use crate::pipeline::OpId;

    fn row(id: i64, title: &str) -> Row {
        Row::from_iter([("id", Value::from(id)), ("title", Value::from(title))])
    }

    fn take_op(limit: Option<u64>, start: Option<Row>) -> TakeOp {
        TakeOp {
            id: OpId(1),
            input: OpId(0),
            table: "issue".into(),
            limit,
            start,
            order: OrderSpec::new(
                &[("title".to_owned(), OrderDirection::Asc)],
                ["id".to_owned()],
            ),
        }
    }

    #[test]
    fn cut_applies_exclusive_start_and_limit() {
        let sorted = vec![row(1, "a"), row(2, "b"), row(3, "c"), row(4, "d")];
        let op = take_op(Some(2), Some(row(1, "a")));
        assert_eq!(cut(&op, sorted), vec![row(2, "b"), row(3, "c")]);
    }

    #[test]
    fn cut_limit_zero_is_empty() {
        let op = take_op(Some(0), None);
        assert_eq!(cut(&op, vec![row(1, "a")]), Vec::<Row>::new());
    }

    #[test]
    fn diff_orders_removes_before_adds() {
        let key: BTreeSet<String> = ["id".to_owned()].into();
        let old = vec![row(1, "a"), row(2, "b")];
        let new = vec![row(2, "b"), row(3, "c")];
        let events = diff(&key, &old, &new).unwrap();
        assert_eq!(
            events,
            vec![
                SourceChange::Remove(row(1, "a")),
                SourceChange::Add(row(3, "c")),
            ]
        );
    }

    #[test]
    fn diff_detects_in_place_edits() {
        let key: BTreeSet<String> = ["id".to_owned()].into();
        let old = vec![row(1, "a")];
        let new = vec![row(1, "z")];
        let events = diff(&key, &old, &new).unwrap();
        assert_eq!(
            events,
            vec![SourceChange::Edit {
                old: row(1, "a"),
                new: row(1, "z"),
            }]
        );
    }
}

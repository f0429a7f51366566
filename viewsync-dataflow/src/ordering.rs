//! Total row ordering for `orderBy` and take windows.

use std::cmp::Ordering;

use viewsync_ast::OrderDirection;
use viewsync_data::{Row, Value};

/// The total order of one select: the query's sort columns followed by the
/// table's primary key ascending, so ties are always broken
/// deterministically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct OrderSpec {
    columns: Vec<(String, OrderDirection)>,
}

impl OrderSpec {
    /// Build the order for a select: `order_by` with the primary key appended
    /// ascending (skipping key columns that already appear).
    pub(crate) fn new(
        order_by: &[(String, OrderDirection)],
        primary_key: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut columns: Vec<(String, OrderDirection)> = order_by.to_vec();
        for key_col in primary_key {
            if !columns.iter().any(|(c, _)| *c == key_col) {
                columns.push((key_col, OrderDirection::Asc));
            }
        }
        OrderSpec { columns }
    }

    /// Compare two rows under this order. Missing columns order as NULL.
    pub(crate) fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for (column, direction) in &self.columns {
            let va = a.get(column).unwrap_or(&Value::Null);
            let vb = b.get(column).unwrap_or(&Value::Null);
            let ord = va.cmp(vb);
            let ord = match direction {
                OrderDirection::Asc => ord,
                OrderDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Sort rows in place under this order.
    pub(crate) fn sort(&self, rows: &mut [Row]) {
        rows.sort_by(|a, b| self.compare(a, b));
    }
}

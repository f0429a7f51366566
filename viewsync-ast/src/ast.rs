use std::fmt;

use serde::{Deserialize, Serialize};
use vec1::Vec1;
use viewsync_data::{Row, Value};
use viewsync_errors::{SyncError, SyncResult};

/// A declarative relational query over one table.
///
/// Field order matters: the canonical JSON serialization of this struct is
/// the input to the transformation hash, so reordering or renaming fields
/// changes every persisted hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectAst {
    /// The schema of the table; empty string for the default schema.
    #[serde(default)]
    pub schema: String,
    /// The table to read.
    pub table: String,
    /// Filter condition tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Condition>,
    /// Sort columns, applied in order. The primary key is always appended
    /// (ascending) as a deterministic tiebreaker.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<(String, OrderDirection)>,
    /// Maximum number of rows to produce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Exclusive cursor row: only rows ordering strictly after it (in this
    /// query's sort order) are produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Row>,
    /// Correlated child queries, each surfaced as a named relationship in the
    /// output tree.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<Related>,
}

impl SelectAst {
    /// A bare `SELECT * FROM table` query.
    pub fn table(table: impl Into<String>) -> Self {
        SelectAst {
            schema: String::new(),
            table: table.into(),
            where_clause: None,
            order_by: Vec::new(),
            limit: None,
            start: None,
            related: Vec::new(),
        }
    }

    /// Validate the structural invariants of this query tree.
    ///
    /// * table names are non-empty;
    /// * correlations have equal arity on both sides;
    /// * junction (hidden) edges carry no `limit` or `orderBy`.
    pub fn validate(&self) -> SyncResult<()> {
        self.validate_inner(false)
    }

    fn validate_inner(&self, junction: bool) -> SyncResult<()> {
        if self.table.is_empty() {
            return Err(SyncError::InvalidQuery("empty table name".into()));
        }
        if junction && (self.limit.is_some() || !self.order_by.is_empty()) {
            return Err(SyncError::InvalidQuery(format!(
                "junction edge on {} may not carry limit or orderBy",
                self.table
            )));
        }
        if let Some(cond) = &self.where_clause {
            cond.validate()?;
        }
        for related in &self.related {
            related.validate()?;
        }
        Ok(())
    }

    /// All table names referenced by this query, including related children
    /// and exists subqueries.
    pub fn referenced_tables(&self) -> Vec<String> {
        let mut tables = Vec::new();
        self.collect_tables(&mut tables);
        tables.sort();
        tables.dedup();
        tables
    }

    fn collect_tables(&self, out: &mut Vec<String>) {
        out.push(self.table.clone());
        if let Some(cond) = &self.where_clause {
            cond.collect_tables(out);
        }
        for related in &self.related {
            related.subquery.collect_tables(out);
        }
    }
}

/// Sort direction for one `orderBy` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// The correlation binding a child subquery to its parent: rows are related
/// when the parent's `parent_fields` values equal the child's `child_fields`
/// values positionally. Both sides always have the same arity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    /// Columns on the parent side.
    pub parent_fields: Vec1<String>,
    /// Columns on the child side, positionally matched to `parent_fields`.
    pub child_fields: Vec1<String>,
}

impl Correlation {
    /// Build a correlation, checking arity.
    pub fn new(parent_fields: Vec1<String>, child_fields: Vec1<String>) -> SyncResult<Self> {
        let c = Correlation {
            parent_fields,
            child_fields,
        };
        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> SyncResult<()> {
        if self.parent_fields.len() != self.child_fields.len() {
            return Err(SyncError::InvalidQuery(format!(
                "correlation arity mismatch: {:?} vs {:?}",
                self.parent_fields, self.child_fields
            )));
        }
        Ok(())
    }
}

/// Which system a subquery serves.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SubquerySystem {
    /// Requested by the client; its rows are part of the client output.
    #[default]
    Client,
    /// Injected by permission transformation; constrains visibility but never
    /// contributes rows to the client output.
    Permissions,
}

/// A correlated child query surfaced as a named relationship of its parent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Related {
    /// How child rows bind to parent rows.
    pub correlation: Correlation,
    /// The child query.
    pub subquery: Box<SelectAst>,
    /// Relationship name in the output tree.
    pub alias: String,
    /// True for the intermediate edge of a many-to-many junction; hidden
    /// rows are walked but never emitted.
    #[serde(default)]
    pub hidden: bool,
    /// Who asked for this subquery.
    #[serde(default)]
    pub system: SubquerySystem,
}

impl Related {
    fn validate(&self) -> SyncResult<()> {
        self.correlation.validate()?;
        self.subquery.validate_inner(self.hidden)?;
        Ok(())
    }
}

/// A boolean filter over the columns of one row, with correlated existence
/// tests into other tables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Condition {
    /// All children hold. An empty conjunction is true.
    And {
        /// The conjuncts.
        conditions: Vec<Condition>,
    },
    /// At least one child holds. An empty disjunction is false.
    Or {
        /// The disjuncts.
        conditions: Vec<Condition>,
    },
    /// `column <op> value`.
    Compare {
        /// Left-hand column.
        column: String,
        /// Comparison operator.
        op: CompareOp,
        /// Literal right-hand operand.
        value: Value,
    },
    /// `column IN (values...)` with a literal array.
    In {
        /// Left-hand column.
        column: String,
        /// Literal candidate values.
        values: Vec<Value>,
    },
    /// At least one correlated child row exists, where child existence may
    /// itself be filtered or joined.
    Exists {
        /// How candidate children bind to the row under test.
        correlation: Correlation,
        /// The child query whose non-emptiness is tested.
        subquery: Box<SelectAst>,
        /// When set, the walk is rooted at the subquery side: candidate
        /// children are enumerated and parents looked up, instead of probing
        /// children per parent.
        #[serde(default)]
        flip: bool,
    },
}

impl Condition {
    fn validate(&self) -> SyncResult<()> {
        match self {
            Condition::And { conditions } | Condition::Or { conditions } => {
                conditions.iter().try_for_each(Condition::validate)
            }
            Condition::Compare { op, value, .. } => match op {
                CompareOp::Is | CompareOp::IsNot if !value.is_null() => {
                    Err(SyncError::InvalidQuery(format!(
                        "IS/IS NOT requires a null operand, got {value}"
                    )))
                }
                _ => Ok(()),
            },
            Condition::In { .. } => Ok(()),
            Condition::Exists {
                correlation,
                subquery,
                ..
            } => {
                correlation.validate()?;
                subquery.validate_inner(false)
            }
        }
    }

    fn collect_tables(&self, out: &mut Vec<String>) {
        match self {
            Condition::And { conditions } | Condition::Or { conditions } => {
                for c in conditions {
                    c.collect_tables(out);
                }
            }
            Condition::Compare { .. } | Condition::In { .. } => {}
            Condition::Exists { subquery, .. } => subquery.collect_tables(out),
        }
    }
}

/// Comparison operators for [`Condition::Compare`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "camelCase")]
pub enum CompareOp {
    /// `=`. NULL compares unequal to everything, including NULL.
    Eq,
    /// `!=`. NULL compares unequal to everything, including NULL.
    Ne,
    /// `<`.
    Lt,
    /// `<=`.
    Le,
    /// `>`.
    Gt,
    /// `>=`.
    Ge,
    /// `IS NULL` (three-valued-logic-free null test).
    Is,
    /// `IS NOT NULL`.
    IsNot,
}

impl fmt::Display for SelectAst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)?;
        if self.where_clause.is_some() {
            write!(f, "[filtered]")?;
        }
        if let Some(limit) = self.limit {
            write!(f, "[limit {limit}]")?;
        }
        for r in &self.related {
            write!(f, ".related({})", r.alias)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vec1::vec1;

    use super::*;

    fn correlation(parent: &str, child: &str) -> Correlation {
        Correlation {
            parent_fields: vec1![parent.to_owned()],
            child_fields: vec1![child.to_owned()],
        }
    }

    #[test]
    fn junction_edge_rejects_limit_and_order() {
        let mut junction = SelectAst::table("issueLabel");
        junction.limit = Some(10);
        let ast = SelectAst {
            related: vec![Related {
                correlation: correlation("id", "issueId"),
                subquery: Box::new(junction),
                alias: "labels".into(),
                hidden: true,
                system: SubquerySystem::Client,
            }],
            ..SelectAst::table("issue")
        };
        assert!(matches!(ast.validate(), Err(SyncError::InvalidQuery(_))));
    }

    #[test]
    fn visible_edge_allows_limit() {
        let mut child = SelectAst::table("comment");
        child.limit = Some(10);
        child.order_by = vec![("created".into(), OrderDirection::Desc)];
        let ast = SelectAst {
            related: vec![Related {
                correlation: correlation("id", "issueId"),
                subquery: Box::new(child),
                alias: "comments".into(),
                hidden: false,
                system: SubquerySystem::Client,
            }],
            ..SelectAst::table("issue")
        };
        ast.validate().unwrap();
    }

    #[test]
    fn correlation_arity_is_checked() {
        let c = Correlation {
            parent_fields: vec1!["a".to_owned(), "b".to_owned()],
            child_fields: vec1!["x".to_owned()],
        };
        let ast = SelectAst {
            where_clause: Some(Condition::Exists {
                correlation: c,
                subquery: Box::new(SelectAst::table("other")),
                flip: false,
            }),
            ..SelectAst::table("issue")
        };
        assert!(matches!(ast.validate(), Err(SyncError::InvalidQuery(_))));
    }

    #[test]
    fn is_requires_null_operand() {
        let ast = SelectAst {
            where_clause: Some(Condition::Compare {
                column: "title".into(),
                op: CompareOp::Is,
                value: Value::from("a"),
            }),
            ..SelectAst::table("issue")
        };
        assert!(matches!(ast.validate(), Err(SyncError::InvalidQuery(_))));
    }

    #[test]
    fn referenced_tables_are_deduplicated() {
        let ast = SelectAst {
            where_clause: Some(Condition::Exists {
                correlation: correlation("id", "issueId"),
                subquery: Box::new(SelectAst::table("comment")),
                flip: false,
            }),
            related: vec![Related {
                correlation: correlation("id", "issueId"),
                subquery: Box::new(SelectAst::table("comment")),
                alias: "comments".into(),
                hidden: false,
                system: SubquerySystem::Client,
            }],
            ..SelectAst::table("issue")
        };
        assert_eq!(ast.referenced_tables(), vec!["comment", "issue"]);
    }
}

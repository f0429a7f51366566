//! Compiled query pipelines.
//!
//! A [`Pipeline`] is the IVM instantiation of one transformed query: an arena
//! of operators ([`OperatorNode`]) plus one *select plan* per query block
//! (the root select, each visible/hidden `related` child, and each exists
//! subquery). A select plan's chain runs source → filter → exists* →
//! orderBy → take; related children hang off the plan, not the chain, and
//! are walked when output trees are produced.
//!
//! Execution is scope-driven: every fetch and push runs under a *scope
//! constraint* — empty for the root, the correlation values of one parent row
//! for a related child. Operator state (take windows) is keyed by that scope,
//! which is what makes per-parent windows fall out for free.

use std::collections::{BTreeSet, HashMap, HashSet};

use viewsync_ast::{Condition, Correlation, SelectAst, SubquerySystem};
use viewsync_data::{Row, RowId, RowKey, TransformationHash, TableSpec, Value};
use viewsync_errors::{internal, internal_err, SyncError, SyncResult};

use crate::ops::exists::{
    child_constraint, correlation_moved, field_values, parent_constraint,
};
use crate::ops::{
    filter, take, ExistsOp, FilterOp, OperatorNode, OrderByOp, SourceOp, TakeOp,
};
use crate::ordering::OrderSpec;
use crate::source::TableSource;
use crate::storage::ClientGroupStorage;
use crate::types::{Constraint, FetchRequest, RowChange, SourceChange};

/// Index of an operator within a pipeline's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpId(pub usize);

/// Index of a select plan within a pipeline.
pub(crate) type SelectIdx = usize;

/// Which snapshot state a read runs against during advancement: the state
/// with all changes up to and including the one being pushed (`After`), or
/// the state just before it (`Before`). Outside advancement only `After`
/// exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Before,
    After,
}

/// Everything an operator needs at evaluation time.
pub struct EvalContext<'a> {
    pub(crate) sources: &'a HashMap<String, TableSource>,
    pub(crate) before: Option<&'a HashMap<String, TableSource>>,
    pub(crate) storage: &'a mut ClientGroupStorage,
}

impl<'a> EvalContext<'a> {
    /// Context outside advancement: a single snapshot state.
    pub fn new(
        sources: &'a HashMap<String, TableSource>,
        storage: &'a mut ClientGroupStorage,
    ) -> Self {
        EvalContext {
            sources,
            before: None,
            storage,
        }
    }

    /// Context during advancement, with before/after states.
    pub fn advancing(
        sources: &'a HashMap<String, TableSource>,
        before: &'a HashMap<String, TableSource>,
        storage: &'a mut ClientGroupStorage,
    ) -> Self {
        EvalContext {
            sources,
            before: Some(before),
            storage,
        }
    }

    fn source(&self, table: &str, phase: Phase) -> SyncResult<&TableSource> {
        let map = match phase {
            Phase::After => self.sources,
            Phase::Before => self.before.unwrap_or(self.sources),
        };
        map.get(table)
            .ok_or_else(|| internal_err!("no table source for {table}"))
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RelatedPlan {
    pub(crate) alias: String,
    pub(crate) hidden: bool,
    pub(crate) correlation: Correlation,
    pub(crate) child: SelectIdx,
}

#[derive(Clone, Debug)]
pub(crate) struct SelectPlan {
    pub(crate) table: String,
    /// Operator chain, source first, top last.
    pub(crate) chain: Vec<OpId>,
    pub(crate) top: OpId,
    pub(crate) related: Vec<RelatedPlan>,
    /// All tables referenced by this select and everything below it.
    pub(crate) tables: BTreeSet<String>,
}

/// One instantiated IVM pipeline, keyed by its transformation hash.
#[derive(Clone, Debug)]
pub struct Pipeline {
    hash: TransformationHash,
    ops: Vec<OperatorNode>,
    selects: Vec<SelectPlan>,
    root: SelectIdx,
    tables: BTreeSet<String>,
}

impl Pipeline {
    /// Compile a transformed AST against the given table specs.
    pub fn build(
        hash: TransformationHash,
        ast: &SelectAst,
        specs: &HashMap<String, TableSpec>,
    ) -> SyncResult<Pipeline> {
        ast.validate()?;
        let mut builder = Builder {
            specs,
            ops: Vec::new(),
            selects: Vec::new(),
        };
        let root = builder.build_select(ast, false)?;
        let tables = builder.selects[root].tables.clone();
        tracing::debug!(
            %hash,
            selects = builder.selects.len(),
            ops = ?builder.ops.iter().map(OperatorNode::description).collect::<Vec<_>>(),
            "built pipeline"
        );
        Ok(Pipeline {
            hash,
            ops: builder.ops,
            selects: builder.selects,
            root,
            tables,
        })
    }

    /// The transformation hash this pipeline implements.
    pub fn hash(&self) -> TransformationHash {
        self.hash
    }

    /// All tables this pipeline reads.
    pub fn tables(&self) -> &BTreeSet<String> {
        &self.tables
    }

    /// Drop all operator state. The destroy verb of the operator contract;
    /// idempotent.
    pub fn destroy(&self, storage: &mut ClientGroupStorage) {
        storage.purge_pipeline(self.hash);
    }

    /// Run the initial fetch, emitting an add for every output row, parents
    /// before children. A row reached through N exists paths is emitted N
    /// times so that per-query refcounts equal output path counts. Seeds
    /// take windows as a side effect.
    pub fn hydrate(&self, ctx: &mut EvalContext<'_>) -> SyncResult<Vec<RowChange>> {
        let mut out = Vec::new();
        let rows = self.fetch_select(ctx, self.root, &Constraint::none(), Phase::After)?;
        for row in &rows {
            let multiplicity = self.chain_multiplicity(ctx, self.root, row)?;
            self.emit_subtree(ctx, self.root, row, EmitMode::Add, true, multiplicity, &mut out)?;
        }
        Ok(out)
    }

    /// The number of output paths producing `row` through its select's own
    /// chain: the product of the match counts of the chain's exists gates.
    fn chain_multiplicity(
        &self,
        ctx: &mut EvalContext<'_>,
        sel: SelectIdx,
        row: &Row,
    ) -> SyncResult<usize> {
        let chain = self.selects[sel].chain.clone();
        let mut multiplicity = 1usize;
        for op_id in &chain {
            if let OperatorNode::Exists(op) = &self.ops[op_id.0] {
                let op = op.clone();
                multiplicity *= self.exists_count(ctx, &op, row, Phase::After)?;
            }
        }
        Ok(multiplicity)
    }

    /// Process one normalized source change, emitting the row changes it
    /// causes anywhere in the query tree.
    pub fn push(
        &self,
        ctx: &mut EvalContext<'_>,
        table: &str,
        change: &SourceChange,
    ) -> SyncResult<Vec<RowChange>> {
        if !self.tables.contains(table) {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        self.push_select(
            ctx,
            self.root,
            &[Constraint::none()],
            table,
            change,
            true,
            &mut out,
        )?;
        Ok(out)
    }

    // ===== fetch =====

    fn fetch_select(
        &self,
        ctx: &mut EvalContext<'_>,
        sel: SelectIdx,
        scope: &Constraint,
        phase: Phase,
    ) -> SyncResult<Vec<Row>> {
        self.fetch_op(ctx, self.selects[sel].top, scope, phase)
    }

    fn fetch_op(
        &self,
        ctx: &mut EvalContext<'_>,
        op: OpId,
        scope: &Constraint,
        phase: Phase,
    ) -> SyncResult<Vec<Row>> {
        match &self.ops[op.0] {
            OperatorNode::Source(SourceOp { table }) => {
                let source = ctx.source(table, phase)?;
                let req = FetchRequest::constrained(scope.clone());
                source.fetch(&req)?.collect()
            }
            OperatorNode::Filter(FilterOp { input, condition }) => {
                let rows = self.fetch_op(ctx, *input, scope, phase)?;
                let mut kept = Vec::with_capacity(rows.len());
                for row in rows {
                    if filter::eval(condition, &row)? {
                        kept.push(row);
                    }
                }
                Ok(kept)
            }
            OperatorNode::Exists(op) => {
                let rows = self.fetch_op(ctx, op.input, scope, phase)?;
                if op.flip {
                    // Walk the subquery once and bucket children by their
                    // correlated values, then probe the buckets per parent.
                    let children =
                        self.fetch_select(ctx, op.child, &Constraint::none(), phase)?;
                    let mut buckets: HashMap<Vec<Value>, usize> = HashMap::new();
                    for child in &children {
                        let values = field_values(&op.correlation.child_fields, child);
                        if values.iter().any(Value::is_null) {
                            continue;
                        }
                        *buckets.entry(values).or_default() += 1;
                    }
                    Ok(rows
                        .into_iter()
                        .filter(|row| {
                            let values = field_values(&op.correlation.parent_fields, row);
                            !values.iter().any(Value::is_null)
                                && buckets.get(&values).copied().unwrap_or(0) > 0
                        })
                        .collect())
                } else {
                    let mut kept = Vec::with_capacity(rows.len());
                    for row in rows {
                        if self.exists_count(ctx, op, &row, phase)? > 0 {
                            kept.push(row);
                        }
                    }
                    Ok(kept)
                }
            }
            OperatorNode::OrderBy(OrderByOp { input, order }) => {
                let mut rows = self.fetch_op(ctx, *input, scope, phase)?;
                order.sort(&mut rows);
                Ok(rows)
            }
            OperatorNode::Take(op) => {
                if phase == Phase::Before {
                    internal!("take windows are not readable in the before state");
                }
                if let Some(window) = take::stored(ctx.storage, self.hash, op, scope)? {
                    return Ok(window);
                }
                let rows = self.fetch_op(ctx, op.input, scope, phase)?;
                let window = take::cut(op, rows);
                take::store(ctx.storage, self.hash, op, scope, &window)?;
                Ok(window)
            }
        }
    }

    fn exists_count(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &ExistsOp,
        row: &Row,
        phase: Phase,
    ) -> SyncResult<usize> {
        match child_constraint(&op.correlation, row) {
            None => Ok(0),
            Some(constraint) => Ok(self
                .fetch_select(ctx, op.child, &constraint, phase)?
                .len()),
        }
    }

    // ===== push =====

    fn push_select(
        &self,
        ctx: &mut EvalContext<'_>,
        sel: SelectIdx,
        instances: &[Constraint],
        table: &str,
        change: &SourceChange,
        visible: bool,
        out: &mut Vec<RowChange>,
    ) -> SyncResult<()> {
        let plan = self.selects[sel].clone();
        let union_key = ctx.source(&plan.table, Phase::After)?.spec().union_key();

        // Rows of this select whose own chain events were handled here; their
        // subtrees are already re-emitted, so the related recursion below
        // must not process the same change under them a second time.
        let mut touched: HashSet<RowKey> = HashSet::new();
        for scope in instances {
            let events = self.select_events(ctx, sel, scope, table, change)?;
            for event in &events {
                match event {
                    SourceChange::Add(row) | SourceChange::Remove(row) => {
                        touched.insert(row.key(&union_key)?);
                    }
                    SourceChange::Edit { old, new } => {
                        touched.insert(old.key(&union_key)?);
                        touched.insert(new.key(&union_key)?);
                    }
                }
                self.emit_event(ctx, sel, event, visible, out)?;
            }
        }

        for rel in &plan.related {
            let child_plan = &self.selects[rel.child];
            if !child_plan.tables.contains(table) {
                continue;
            }
            // When the change hits the child's own table, only parents
            // correlated with the changed row can be affected.
            let parent_filters: Option<Vec<Constraint>> = if child_plan.table == table {
                let mut filters = Vec::new();
                let mut push_filter = |row: &Row| {
                    if let Some(c) = parent_constraint(&rel.correlation, row) {
                        if !filters.contains(&c) {
                            filters.push(c);
                        }
                    }
                };
                match change {
                    SourceChange::Add(row) | SourceChange::Remove(row) => push_filter(row),
                    SourceChange::Edit { old, new } => {
                        push_filter(old);
                        push_filter(new);
                    }
                }
                Some(filters)
            } else {
                None
            };
            if matches!(&parent_filters, Some(f) if f.is_empty()) {
                continue;
            }

            let mut child_instances = Vec::new();
            for scope in instances {
                let parents = self.fetch_op(ctx, plan.top, scope, Phase::After)?;
                for parent in parents {
                    if touched.contains(&parent.key(&union_key)?) {
                        continue;
                    }
                    if let Some(filters) = &parent_filters {
                        if !filters.iter().any(|f| f.admits(&parent)) {
                            continue;
                        }
                    }
                    if let Some(c) = child_constraint(&rel.correlation, &parent) {
                        child_instances.push(c);
                    }
                }
            }
            if child_instances.is_empty() {
                continue;
            }
            tracing::trace!(
                relationship = %rel.alias,
                instances = child_instances.len(),
                "pushing change into related child"
            );
            // A hidden edge hides its own select's rows only; rows further
            // down (the far side of a junction) are emitted again.
            self.push_select(
                ctx,
                rel.child,
                &child_instances,
                table,
                change,
                !rel.hidden,
                out,
            )?;
        }
        Ok(())
    }

    /// The output events of one select (under one scope) for a change: its
    /// own chain events plus synthetic events from exists-subquery toggles.
    fn select_events(
        &self,
        ctx: &mut EvalContext<'_>,
        sel: SelectIdx,
        scope: &Constraint,
        table: &str,
        change: &SourceChange,
    ) -> SyncResult<Vec<SourceChange>> {
        let plan = self.selects[sel].clone();
        let mut events = Vec::new();

        if plan.table == table {
            let mut chain_events = constrain_change(scope, change);
            for op in &plan.chain[1..] {
                chain_events = self.op_apply(ctx, *op, scope, chain_events)?;
            }
            events.extend(chain_events);
        }

        for (pos, op_id) in plan.chain.iter().enumerate() {
            let OperatorNode::Exists(exists_op) = self.ops[op_id.0].clone() else {
                continue;
            };
            if !self.selects[exists_op.child].tables.contains(table) {
                continue;
            }
            let child_events =
                self.select_events(ctx, exists_op.child, &Constraint::none(), table, change)?;
            let mut tuples: BTreeSet<Vec<Value>> = BTreeSet::new();
            let mut insert_tuple = |row: &Row| {
                let values = field_values(&exists_op.correlation.child_fields, row);
                if !values.iter().any(Value::is_null) {
                    tuples.insert(values);
                }
            };
            for child_event in &child_events {
                match child_event {
                    SourceChange::Add(row) | SourceChange::Remove(row) => insert_tuple(row),
                    SourceChange::Edit { old, new } => {
                        // An edit that stays in the child output only changes
                        // existence counts when it moves correlation buckets.
                        if correlation_moved(&exists_op.correlation.child_fields, old, new) {
                            insert_tuple(old);
                            insert_tuple(new);
                        }
                    }
                }
            }

            for tuple in tuples {
                let corr_constraint = Constraint(
                    exists_op
                        .correlation
                        .parent_fields
                        .iter()
                        .cloned()
                        .zip(tuple.iter().cloned())
                        .collect(),
                );
                let Some(combined) = merge_constraints(scope, &corr_constraint) else {
                    continue;
                };
                let parents: Vec<Row> = ctx
                    .source(&plan.table, Phase::After)?
                    .fetch(&FetchRequest::constrained(combined))?
                    .collect::<SyncResult<_>>()?;
                for parent in parents {
                    if !self.passes_below(ctx, &plan, pos, &parent, scope)? {
                        continue;
                    }
                    let before = self.exists_count(ctx, &exists_op, &parent, Phase::Before)?;
                    let after = self.exists_count(ctx, &exists_op, &parent, Phase::After)?;
                    let mut synthetic: Vec<SourceChange> = if before == 0 && after > 0 {
                        vec![SourceChange::Add(parent.clone()); after]
                    } else if before > 0 && after == 0 {
                        vec![SourceChange::Remove(parent.clone()); before]
                    } else if after > before {
                        vec![SourceChange::Add(parent.clone()); after - before]
                    } else if before > after {
                        vec![SourceChange::Remove(parent.clone()); before - after]
                    } else {
                        Vec::new()
                    };
                    if synthetic.is_empty() {
                        continue;
                    }
                    for op in &plan.chain[pos + 1..] {
                        synthetic = self.op_apply(ctx, *op, scope, synthetic)?;
                    }
                    events.extend(synthetic);
                }
            }
        }
        Ok(events)
    }

    /// Whether `row` passes the chain segment strictly below `pos` (the
    /// source's scope constraint and any filters/exists gates beneath an
    /// exists operator).
    fn passes_below(
        &self,
        ctx: &mut EvalContext<'_>,
        plan: &SelectPlan,
        pos: usize,
        row: &Row,
        scope: &Constraint,
    ) -> SyncResult<bool> {
        for op_id in &plan.chain[..pos] {
            match &self.ops[op_id.0] {
                OperatorNode::Source(_) => {
                    if !scope.admits(row) {
                        return Ok(false);
                    }
                }
                OperatorNode::Filter(FilterOp { condition, .. }) => {
                    if !filter::eval(condition, row)? {
                        return Ok(false);
                    }
                }
                OperatorNode::Exists(op) => {
                    let op = op.clone();
                    if self.exists_count(ctx, &op, row, Phase::After)? == 0 {
                        return Ok(false);
                    }
                }
                OperatorNode::OrderBy(_) | OperatorNode::Take(_) => {
                    internal!("ordering operator below an exists gate")
                }
            }
        }
        Ok(true)
    }

    /// Apply one operator to a batch of input events, producing its output
    /// events. This is the push verb of the operator contract.
    fn op_apply(
        &self,
        ctx: &mut EvalContext<'_>,
        op: OpId,
        scope: &Constraint,
        events: Vec<SourceChange>,
    ) -> SyncResult<Vec<SourceChange>> {
        match self.ops[op.0].clone() {
            OperatorNode::Source(_) => Ok(events),
            OperatorNode::Filter(FilterOp { condition, .. }) => {
                let mut out = Vec::with_capacity(events.len());
                for event in events {
                    match event {
                        SourceChange::Add(row) => {
                            if filter::eval(&condition, &row)? {
                                out.push(SourceChange::Add(row));
                            }
                        }
                        SourceChange::Remove(row) => {
                            if filter::eval(&condition, &row)? {
                                out.push(SourceChange::Remove(row));
                            }
                        }
                        SourceChange::Edit { old, new } => {
                            match (filter::eval(&condition, &old)?, filter::eval(&condition, &new)?)
                            {
                                (true, true) => out.push(SourceChange::Edit { old, new }),
                                (true, false) => out.push(SourceChange::Remove(old)),
                                (false, true) => out.push(SourceChange::Add(new)),
                                (false, false) => {}
                            }
                        }
                    }
                }
                Ok(out)
            }
            OperatorNode::Exists(exists_op) => {
                let mut out = Vec::new();
                for event in events {
                    match event {
                        SourceChange::Add(row) => {
                            let n = self.exists_count(ctx, &exists_op, &row, Phase::After)?;
                            out.extend(vec![SourceChange::Add(row); n]);
                        }
                        SourceChange::Remove(row) => {
                            let n = self.exists_count(ctx, &exists_op, &row, Phase::After)?;
                            out.extend(vec![SourceChange::Remove(row); n]);
                        }
                        SourceChange::Edit { old, new } => {
                            let m = self.exists_count(ctx, &exists_op, &old, Phase::After)?;
                            let n = self.exists_count(ctx, &exists_op, &new, Phase::After)?;
                            if m == 0 && n > 0 {
                                out.extend(vec![SourceChange::Add(new); n]);
                            } else if m > 0 && n == 0 {
                                out.extend(vec![SourceChange::Remove(old); m]);
                            } else if m > 0 && n > 0 {
                                out.push(SourceChange::Edit {
                                    old: old.clone(),
                                    new: new.clone(),
                                });
                                if n > m {
                                    out.extend(vec![SourceChange::Add(new); n - m]);
                                } else if m > n {
                                    out.extend(vec![SourceChange::Remove(old); m - n]);
                                }
                            }
                        }
                    }
                }
                Ok(out)
            }
            OperatorNode::OrderBy(_) => Ok(events),
            OperatorNode::Take(take_op) => {
                if events.is_empty() {
                    return Ok(events);
                }
                // A window that was never hydrated under this scope has never
                // contributed output; leave it unseeded.
                let Some(old_window) = take::stored(ctx.storage, self.hash, &take_op, scope)?
                else {
                    return Ok(Vec::new());
                };
                let rows = self.fetch_op(ctx, take_op.input, scope, Phase::After)?;
                let new_window = take::cut(&take_op, rows);
                take::store(ctx.storage, self.hash, &take_op, scope, &new_window)?;
                let union_key = ctx
                    .source(&take_op.table, Phase::After)?
                    .spec()
                    .union_key();
                take::diff(&union_key, &old_window, &new_window)
            }
        }
    }

    // ===== output emission =====

    fn row_id(
        &self,
        ctx: &EvalContext<'_>,
        table: &str,
        row: &Row,
    ) -> SyncResult<RowId> {
        let spec = ctx.source(table, Phase::After)?.spec();
        Ok(RowId::new(
            spec.schema.clone(),
            table.to_owned(),
            row.key(&spec.union_key())?,
        ))
    }

    fn emit_event(
        &self,
        ctx: &mut EvalContext<'_>,
        sel: SelectIdx,
        event: &SourceChange,
        visible: bool,
        out: &mut Vec<RowChange>,
    ) -> SyncResult<()> {
        let plan = self.selects[sel].clone();
        match event {
            // Chain events already carry exists-path multiplicity (the
            // exists operator replicates them), so each event emits once.
            SourceChange::Add(row) => {
                self.emit_subtree(ctx, sel, row, EmitMode::Add, visible, 1, out)
            }
            SourceChange::Remove(row) => {
                self.emit_subtree(ctx, sel, row, EmitMode::Remove, visible, 1, out)
            }
            SourceChange::Edit { old, new } => {
                if visible {
                    out.push(RowChange::Edit {
                        hash: self.hash,
                        id: self.row_id(ctx, &plan.table, new)?,
                        row: new.clone(),
                    });
                }
                // Children follow the correlated values; an edit that moves
                // them re-parents the whole child subtree.
                for rel in &plan.related {
                    if !correlation_moved(&rel.correlation.parent_fields, old, new) {
                        continue;
                    }
                    if let Some(c) = child_constraint(&rel.correlation, old) {
                        for child in self.fetch_select(ctx, rel.child, &c, Phase::After)? {
                            let m = self.chain_multiplicity(ctx, rel.child, &child)?;
                            self.emit_subtree(
                                ctx,
                                rel.child,
                                &child,
                                EmitMode::Remove,
                                !rel.hidden,
                                m,
                                out,
                            )?;
                        }
                    }
                    if let Some(c) = child_constraint(&rel.correlation, new) {
                        for child in self.fetch_select(ctx, rel.child, &c, Phase::After)? {
                            let m = self.chain_multiplicity(ctx, rel.child, &child)?;
                            self.emit_subtree(
                                ctx,
                                rel.child,
                                &child,
                                EmitMode::Add,
                                !rel.hidden,
                                m,
                                out,
                            )?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Emit a row and its full related subtree: parents before children for
    /// adds, children before parents for removes. Hidden (junction) rows are
    /// walked but not emitted. `multiplicity` is the number of output paths
    /// producing the row; it compounds down the tree, so per-query refcounts
    /// end up equal to path counts everywhere.
    #[allow(clippy::too_many_arguments)]
    fn emit_subtree(
        &self,
        ctx: &mut EvalContext<'_>,
        sel: SelectIdx,
        row: &Row,
        mode: EmitMode,
        visible: bool,
        multiplicity: usize,
        out: &mut Vec<RowChange>,
    ) -> SyncResult<()> {
        if multiplicity == 0 {
            return Ok(());
        }
        let plan = self.selects[sel].clone();
        let id = self.row_id(ctx, &plan.table, row)?;
        if mode == EmitMode::Add && visible {
            for _ in 0..multiplicity {
                out.push(RowChange::Add {
                    hash: self.hash,
                    id: id.clone(),
                    row: row.clone(),
                });
            }
        }
        for rel in &plan.related {
            if let Some(c) = child_constraint(&rel.correlation, row) {
                for child in self.fetch_select(ctx, rel.child, &c, Phase::After)? {
                    let child_multiplicity =
                        multiplicity * self.chain_multiplicity(ctx, rel.child, &child)?;
                    self.emit_subtree(
                        ctx,
                        rel.child,
                        &child,
                        mode,
                        !rel.hidden,
                        child_multiplicity,
                        out,
                    )?;
                }
            }
        }
        if mode == EmitMode::Remove && visible {
            for _ in 0..multiplicity {
                out.push(RowChange::Remove {
                    hash: self.hash,
                    id: id.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EmitMode {
    Add,
    Remove,
}

/// Events of a raw change as seen through a scope constraint.
fn constrain_change(scope: &Constraint, change: &SourceChange) -> Vec<SourceChange> {
    match change {
        SourceChange::Add(row) => {
            if scope.admits(row) {
                vec![SourceChange::Add(row.clone())]
            } else {
                Vec::new()
            }
        }
        SourceChange::Remove(row) => {
            if scope.admits(row) {
                vec![SourceChange::Remove(row.clone())]
            } else {
                Vec::new()
            }
        }
        SourceChange::Edit { old, new } => match (scope.admits(old), scope.admits(new)) {
            (true, true) => vec![SourceChange::Edit {
                old: old.clone(),
                new: new.clone(),
            }],
            (true, false) => vec![SourceChange::Remove(old.clone())],
            (false, true) => vec![SourceChange::Add(new.clone())],
            (false, false) => Vec::new(),
        },
    }
}

/// Merge two equality constraints; `None` if they bind the same column to
/// different values.
fn merge_constraints(a: &Constraint, b: &Constraint) -> Option<Constraint> {
    let mut merged = a.0.clone();
    for (col, val) in &b.0 {
        match merged.get(col) {
            Some(existing) if existing != val => return None,
            _ => {
                merged.insert(col.clone(), val.clone());
            }
        }
    }
    Some(Constraint(merged))
}

struct Builder<'a> {
    specs: &'a HashMap<String, TableSpec>,
    ops: Vec<OperatorNode>,
    selects: Vec<SelectPlan>,
}

impl Builder<'_> {
    fn push_op(&mut self, op: OperatorNode) -> OpId {
        let id = OpId(self.ops.len());
        self.ops.push(op);
        id
    }

    fn build_select(&mut self, ast: &SelectAst, exists_child: bool) -> SyncResult<SelectIdx> {
        let spec = self
            .specs
            .get(&ast.table)
            .ok_or_else(|| SyncError::InvalidQuery(format!("unknown table {}", ast.table)))?
            .clone();

        let mut chain = Vec::new();
        let mut top = self.push_op(OperatorNode::Source(SourceOp {
            table: ast.table.clone(),
        }));
        chain.push(top);

        let mut plain = Vec::new();
        let mut exists_conds = Vec::new();
        if let Some(cond) = &ast.where_clause {
            split_condition(cond, &mut plain, &mut exists_conds)?;
        }
        if !plain.is_empty() {
            top = self.push_op(OperatorNode::Filter(FilterOp {
                input: top,
                condition: Condition::And { conditions: plain },
            }));
            chain.push(top);
        }
        for (correlation, subquery, flip) in exists_conds {
            let child = self.build_select(&strip_for_exists(&subquery), true)?;
            top = self.push_op(OperatorNode::Exists(ExistsOp {
                input: top,
                child,
                correlation,
                flip,
            }));
            chain.push(top);
        }
        // Permission subqueries constrain visibility but contribute no rows:
        // they compile to exists gates, never to related children.
        for related in &ast.related {
            if related.system != SubquerySystem::Permissions {
                continue;
            }
            let child = self.build_select(&strip_for_exists(&related.subquery), true)?;
            top = self.push_op(OperatorNode::Exists(ExistsOp {
                input: top,
                child,
                correlation: related.correlation.clone(),
                flip: false,
            }));
            chain.push(top);
        }

        if !exists_child {
            let order = OrderSpec::new(&ast.order_by, spec.primary_key.iter().cloned());
            top = self.push_op(OperatorNode::OrderBy(OrderByOp {
                input: top,
                order: order.clone(),
            }));
            chain.push(top);
            if ast.limit.is_some() || ast.start.is_some() {
                let id = OpId(self.ops.len());
                top = self.push_op(OperatorNode::Take(TakeOp {
                    id,
                    input: chain[chain.len() - 1],
                    table: ast.table.clone(),
                    limit: ast.limit,
                    start: ast.start.clone(),
                    order,
                }));
                chain.push(top);
            }
        }

        let mut related_plans = Vec::new();
        let mut tables: BTreeSet<String> = BTreeSet::new();
        tables.insert(ast.table.clone());
        for related in &ast.related {
            if related.system == SubquerySystem::Permissions {
                continue;
            }
            let child = self.build_select(&related.subquery, false)?;
            tables.extend(self.selects[child].tables.iter().cloned());
            related_plans.push(RelatedPlan {
                alias: related.alias.clone(),
                hidden: related.hidden,
                correlation: related.correlation.clone(),
                child,
            });
        }
        // Exists children contribute to the routing table set too.
        for op_id in &chain {
            if let OperatorNode::Exists(e) = &self.ops[op_id.0] {
                tables.extend(self.selects[e.child].tables.iter().cloned());
            }
        }

        let idx = self.selects.len();
        self.selects.push(SelectPlan {
            table: ast.table.clone(),
            chain,
            top,
            related: related_plans,
            tables,
        });
        Ok(idx)
    }
}

/// Split a condition into plain filter conjuncts and exists gates. Exists is
/// only supported at the top level of a conjunction; an exists under `or`
/// has no incremental evaluation strategy here and is rejected.
#[allow(clippy::type_complexity)]
fn split_condition(
    cond: &Condition,
    plain: &mut Vec<Condition>,
    exists: &mut Vec<(Correlation, SelectAst, bool)>,
) -> SyncResult<()> {
    match cond {
        Condition::And { conditions } => {
            for c in conditions {
                split_condition(c, plain, exists)?;
            }
            Ok(())
        }
        Condition::Exists {
            correlation,
            subquery,
            flip,
        } => {
            exists.push((correlation.clone(), (**subquery).clone(), *flip));
            Ok(())
        }
        Condition::Or { conditions } => {
            if conditions.iter().any(contains_exists) {
                return Err(SyncError::InvalidQuery(
                    "exists is not supported under or".into(),
                ));
            }
            plain.push(cond.clone());
            Ok(())
        }
        other => {
            plain.push(other.clone());
            Ok(())
        }
    }
}

fn contains_exists(cond: &Condition) -> bool {
    match cond {
        Condition::Exists { .. } => true,
        Condition::And { conditions } | Condition::Or { conditions } => {
            conditions.iter().any(contains_exists)
        }
        _ => false,
    }
}

/// An exists subquery's output shape is irrelevant; only membership counts.
/// Strip ordering, windowing, and related children so existence probes stay
/// point lookups.
fn strip_for_exists(ast: &SelectAst) -> SelectAst {
    SelectAst {
        schema: ast.schema.clone(),
        table: ast.table.clone(),
        where_clause: ast.where_clause.clone(),
        order_by: Vec::new(),
        limit: None,
        start: None,
        related: Vec::new(),
    }
}


//! The pipeline driver: owns the snapshotter, the table sources, the pipeline
//! set, and the operator scratch storage for one client group.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use viewsync_client::metrics::recorded;
use viewsync_data::{ClientSchema, Row, RowKey, StateVersion, TableSpec, TransformationHash};
use viewsync_errors::{internal_err, SyncResult};

use viewsync_ast::SelectAst;

use crate::pipeline::{EvalContext, Pipeline};
use crate::replica::{DiffOutcome, ReplicaSnapshotter, Snapshot, TableDiff};
use crate::source::{SnapshotReader, TableSource};
use crate::storage::ClientGroupStorage;
use crate::types::{Constraint, FetchRequest, RowChange, SourceChange};

/// How often the advance loop re-checks its progress against the circuit
/// breaker.
pub const ADVANCE_PROGRESS_CHECK_EVERY: usize = 10;

/// The slow-advance circuit breaker: abort (and rebuild from scratch) when
/// elapsed time exceeds half the total prior hydration time while less than
/// half the changes have been processed. Estimated remaining work then
/// exceeds a fresh hydration, and aborting bounds worst-case contention on
/// the replication log.
fn advance_should_reset(
    elapsed: Duration,
    total_hydration_time: Duration,
    processed: usize,
    total: usize,
) -> bool {
    elapsed > total_hydration_time / 2 && processed * 2 < total
}

/// A successful advancement: the new state version and every row change the
/// diff caused across all pipelines.
#[derive(Debug)]
pub struct Advancement {
    /// The state version advanced to.
    pub version: StateVersion,
    /// Number of upstream table diffs processed.
    pub num_changes: usize,
    /// Resulting per-pipeline row changes, in processing order.
    pub changes: Vec<RowChange>,
}

/// The outcome of [`PipelineDriver::advance`].
#[derive(Debug)]
pub enum AdvanceOutcome {
    /// The replica advanced and pipelines were maintained incrementally.
    Advanced(Advancement),
    /// Pipelines must be torn down and re-hydrated: either the diff was not
    /// incrementally expressible (schema change), or the circuit breaker
    /// judged incremental advancement slower than a fresh hydration.
    ResetRequired,
}

/// Owns the IVM state for one client group: one snapshotter, one pipeline per
/// transformation hash, one table source per table, and the operators'
/// scratch storage.
pub struct PipelineDriver {
    snapshotter: Box<dyn ReplicaSnapshotter>,
    pipelines: IndexMap<TransformationHash, Pipeline>,
    sources: HashMap<String, TableSource>,
    storage: ClientGroupStorage,
    current: Option<Snapshot>,
    /// Total wall time spent hydrating the current pipeline set; the advance
    /// circuit breaker's baseline.
    total_hydration_time: Duration,
    slow_hydrate_threshold: Duration,
}

impl PipelineDriver {
    /// Create a driver over the given snapshotter. `slow_hydrate_threshold`
    /// controls when hydrations are logged as slow.
    pub fn new(
        snapshotter: Box<dyn ReplicaSnapshotter>,
        slow_hydrate_threshold: Duration,
    ) -> Self {
        PipelineDriver {
            snapshotter,
            pipelines: IndexMap::new(),
            sources: HashMap::new(),
            storage: ClientGroupStorage::new(),
            current: None,
            total_hydration_time: Duration::ZERO,
            slow_hydrate_threshold,
        }
    }

    /// Attach to the current snapshot and verify the client's schema against
    /// the physical tables.
    pub fn init(&mut self, client_schema: Option<&ClientSchema>) -> SyncResult<()> {
        let snapshot = self.snapshotter.init()?;
        if let Some(schema) = client_schema {
            schema.verify(snapshot.reader.table_specs())?;
        }
        self.install_snapshot(snapshot);
        Ok(())
    }

    /// True once [`init`](Self::init) has succeeded.
    pub fn initialized(&self) -> bool {
        self.current.is_some()
    }

    /// The replica version this driver's snapshotter was initialised at.
    pub fn replica_version(&self) -> StateVersion {
        self.snapshotter.replica_version()
    }

    /// The state version of the current snapshot.
    pub fn current_version(&self) -> SyncResult<StateVersion> {
        self.current
            .as_ref()
            .map(|s| s.version.clone())
            .ok_or_else(|| internal_err!("pipeline driver is not initialized"))
    }

    /// The physical specs of the current snapshot's tables.
    pub fn table_specs(&self) -> SyncResult<&BTreeMap<String, TableSpec>> {
        self.current
            .as_ref()
            .map(|s| s.reader.table_specs())
            .ok_or_else(|| internal_err!("pipeline driver is not initialized"))
    }

    /// The hashes of all instantiated pipelines.
    pub fn pipeline_hashes(&self) -> Vec<TransformationHash> {
        self.pipelines.keys().copied().collect()
    }

    /// True if a pipeline exists for `hash`.
    pub fn has_pipeline(&self, hash: TransformationHash) -> bool {
        self.pipelines.contains_key(&hash)
    }

    /// Build the pipeline for `hash` and run its initial fetch, returning an
    /// add for every output row (nested related rows included, parents before
    /// children). Idempotent: a second add of the same hash returns nothing.
    pub fn add_query(
        &mut self,
        hash: TransformationHash,
        ast: &SelectAst,
    ) -> SyncResult<Vec<RowChange>> {
        if self.pipelines.contains_key(&hash) {
            debug!(%hash, "pipeline already hydrated");
            return Ok(Vec::new());
        }
        let specs: HashMap<String, TableSpec> = self
            .table_specs()?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let pipeline = Pipeline::build(hash, ast, &specs)?;

        let started = Instant::now();
        let mut ctx = EvalContext::new(&self.sources, &mut self.storage);
        let changes = pipeline.hydrate(&mut ctx)?;
        let elapsed = started.elapsed();

        self.total_hydration_time += elapsed;
        histogram!(recorded::HYDRATION_DURATION, "query" => hash.to_string())
            .record(elapsed.as_secs_f64());
        if elapsed > self.slow_hydrate_threshold {
            warn!(%hash, ?elapsed, rows = changes.len(), "slow hydration");
        } else {
            debug!(%hash, ?elapsed, rows = changes.len(), "hydrated query");
        }

        self.pipelines.insert(hash, pipeline);
        Ok(changes)
    }

    /// Point-lookup one row of the current snapshot by its union key.
    /// Used to supply contents for catch-up row patches.
    pub fn get_row(&self, table: &str, key: &RowKey) -> SyncResult<Option<Row>> {
        let Some(source) = self.sources.get(table) else {
            return Ok(None);
        };
        let constraint = Constraint(
            key.iter()
                .map(|(col, val)| (col.clone(), val.clone()))
                .collect(),
        );
        let mut rows = source.fetch(&FetchRequest::constrained(constraint))?;
        rows.next().transpose()
    }

    /// Destroy the pipeline for `hash`, including its operator state.
    /// Idempotent.
    pub fn remove_query(&mut self, hash: TransformationHash) {
        if let Some(pipeline) = self.pipelines.shift_remove(&hash) {
            pipeline.destroy(&mut self.storage);
            debug!(%hash, "destroyed pipeline");
        }
    }

    /// Pull the next diff from the snapshotter and maintain every pipeline
    /// incrementally.
    ///
    /// Progress is re-checked every [`ADVANCE_PROGRESS_CHECK_EVERY`] diffs:
    /// if elapsed time exceeds half the total prior hydration time while less
    /// than half the changes are processed, the advance aborts with
    /// [`AdvanceOutcome::ResetRequired`] — rebuilding is then cheaper than
    /// continuing, and bounds worst-case replication-log contention.
    pub fn advance(&mut self) -> SyncResult<AdvanceOutcome> {
        let diff = match self.snapshotter.advance()? {
            DiffOutcome::ResetRequired(_) => {
                counter!(recorded::ADVANCE_RESETS).increment(1);
                return Ok(AdvanceOutcome::ResetRequired);
            }
            DiffOutcome::Diff(diff) => diff,
        };
        let prev = self
            .current
            .as_ref()
            .ok_or_else(|| internal_err!("advance before init"))?;

        let started = Instant::now();
        let total = diff.changes.len();

        // Two overlays over the previous snapshot track the row states just
        // before and just after the change currently being pushed, so that
        // operators see a consistent sequential history rather than the
        // final state of the whole batch.
        let before_overlay: Arc<OverlayReader> =
            Arc::new(OverlayReader::new(Arc::clone(&prev.reader)));
        let after_overlay: Arc<OverlayReader> =
            Arc::new(OverlayReader::new(Arc::clone(&prev.reader)));
        let specs = prev.reader.table_specs().clone();
        let before_sources = sources_over(&specs, Arc::clone(&before_overlay) as _);
        let after_sources = sources_over(&specs, Arc::clone(&after_overlay) as _);

        let mut out = Vec::new();
        for (i, table_diff) in diff.changes.iter().enumerate() {
            if i > 0
                && i % ADVANCE_PROGRESS_CHECK_EVERY == 0
                && advance_should_reset(started.elapsed(), self.total_hydration_time, i, total)
            {
                warn!(
                    processed = i,
                    total,
                    elapsed = ?started.elapsed(),
                    "advance progress too slow, resetting pipelines"
                );
                counter!(recorded::ADVANCE_RESETS).increment(1);
                return Ok(AdvanceOutcome::ResetRequired);
            }

            after_overlay.apply(table_diff);
            let Some(raw) = to_source_change(table_diff) else {
                before_overlay.apply(table_diff);
                continue;
            };
            let source = after_sources.get(&table_diff.table).ok_or_else(|| {
                internal_err!("diff for unknown table {}", table_diff.table)
            })?;
            for change in source.push(raw)? {
                for pipeline in self.pipelines.values() {
                    let mut ctx = EvalContext::advancing(
                        &after_sources,
                        &before_sources,
                        &mut self.storage,
                    );
                    out.extend(pipeline.push(&mut ctx, &table_diff.table, &change)?);
                }
            }
            before_overlay.apply(table_diff);
        }

        histogram!(recorded::ADVANCE_DURATION).record(started.elapsed().as_secs_f64());
        let version = diff.curr.version.clone();
        self.install_snapshot(diff.curr);
        info!(%version, num_changes = total, emitted = out.len(), "advanced pipelines");
        Ok(AdvanceOutcome::Advanced(Advancement {
            version,
            num_changes: total,
            changes: out,
        }))
    }

    /// Fast-forward the sources to the current snapshot without emitting
    /// changes. Used when the CVR is behind and a fresh hydrate follows.
    pub fn advance_without_diff(&mut self) -> SyncResult<StateVersion> {
        let snapshot = self.snapshotter.advance_without_diff()?;
        let version = snapshot.version.clone();
        self.install_snapshot(snapshot);
        Ok(version)
    }

    /// Destroy all pipelines, operator state, and table sources, then
    /// re-attach to the current snapshot (verifying `client_schema` if
    /// given). Used on schema change and after the advance circuit breaker.
    pub fn reset(&mut self, client_schema: Option<&ClientSchema>) -> SyncResult<()> {
        for (_, pipeline) in self.pipelines.drain(..) {
            pipeline.destroy(&mut self.storage);
        }
        self.storage.clear();
        self.sources.clear();
        self.current = None;
        self.total_hydration_time = Duration::ZERO;
        let snapshot = self.snapshotter.advance_without_diff()?;
        if let Some(schema) = client_schema {
            schema.verify(snapshot.reader.table_specs())?;
        }
        self.install_snapshot(snapshot);
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) {
        let specs = snapshot.reader.table_specs().clone();
        for (table, spec) in &specs {
            match self.sources.get_mut(table) {
                Some(source) => source.set_db(Arc::clone(&snapshot.reader)),
                None => {
                    self.sources.insert(
                        table.clone(),
                        TableSource::new(spec.clone(), Arc::clone(&snapshot.reader)),
                    );
                }
            }
        }
        self.sources.retain(|table, _| specs.contains_key(table));
        self.current = Some(snapshot);
    }
}

impl std::fmt::Debug for PipelineDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDriver")
            .field("pipelines", &self.pipelines.len())
            .field("tables", &self.sources.len())
            .field("current", &self.current.as_ref().map(|s| &s.version))
            .finish()
    }
}

fn sources_over(
    specs: &BTreeMap<String, TableSpec>,
    reader: Arc<dyn SnapshotReader>,
) -> HashMap<String, TableSource> {
    specs
        .iter()
        .map(|(table, spec)| {
            (
                table.clone(),
                TableSource::new(spec.clone(), Arc::clone(&reader)),
            )
        })
        .collect()
}

fn to_source_change(diff: &TableDiff) -> Option<SourceChange> {
    match (&diff.prev, &diff.next) {
        (Some(old), Some(new)) => Some(SourceChange::Edit {
            old: old.clone(),
            new: new.clone(),
        }),
        (Some(prev), None) => Some(SourceChange::Remove(prev.clone())),
        (None, Some(next)) => Some(SourceChange::Add(next.clone())),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        // The breaker is a heuristic; pin its shape rather than its
        // constants: it never trips once half the work is done, never trips
        // within the hydration-time allowance, and is monotonic in elapsed
        // time.
        #[test]
        fn breaker_never_trips_past_half_progress(
            elapsed_ms in 0u64..10_000,
            hydration_ms in 0u64..10_000,
            total in 1usize..10_000,
        ) {
            let processed = total.div_ceil(2);
            prop_assert!(!advance_should_reset(
                Duration::from_millis(elapsed_ms),
                Duration::from_millis(hydration_ms),
                processed,
                total,
            ));
        }

        #[test]
        fn breaker_never_trips_within_allowance(
            elapsed_ms in 0u64..10_000,
            processed in 0usize..100,
            total in 1usize..10_000,
        ) {
            let hydration = Duration::from_millis(elapsed_ms * 2);
            prop_assert!(!advance_should_reset(
                Duration::from_millis(elapsed_ms),
                hydration,
                processed,
                total,
            ));
        }

        #[test]
        fn breaker_is_monotonic_in_elapsed_time(
            elapsed_ms in 0u64..10_000,
            extra_ms in 0u64..10_000,
            hydration_ms in 0u64..10_000,
            processed in 0usize..100,
            total in 1usize..10_000,
        ) {
            let hydration = Duration::from_millis(hydration_ms);
            let early = advance_should_reset(
                Duration::from_millis(elapsed_ms), hydration, processed, total);
            let late = advance_should_reset(
                Duration::from_millis(elapsed_ms + extra_ms), hydration, processed, total);
            // Once tripped, more elapsed time cannot untrip it.
            prop_assert!(!early || late);
        }
    }
}

/// A snapshot reader layering not-yet-visible (or just-became-visible) row
/// states over a base snapshot during advancement.
struct OverlayReader {
    base: Arc<dyn SnapshotReader>,
    overrides: Mutex<HashMap<String, BTreeMap<RowKey, Option<Row>>>>,
}

impl OverlayReader {
    fn new(base: Arc<dyn SnapshotReader>) -> Self {
        OverlayReader {
            base,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    fn apply(&self, diff: &TableDiff) {
        self.overrides
            .lock()
            .entry(diff.table.clone())
            .or_default()
            .insert(diff.row_key.clone(), diff.next.clone());
    }
}

impl SnapshotReader for OverlayReader {
    fn state_version(&self) -> &StateVersion {
        self.base.state_version()
    }

    fn table_specs(&self) -> &BTreeMap<String, TableSpec> {
        self.base.table_specs()
    }

    fn scan(
        &self,
        table: &str,
        request: &FetchRequest,
    ) -> SyncResult<Box<dyn Iterator<Item = Row> + Send>> {
        let spec = self
            .base
            .table_specs()
            .get(table)
            .ok_or_else(|| internal_err!("overlay scan of unknown table {table}"))?
            .clone();
        let union_key = spec.union_key();

        let mut merged: BTreeMap<RowKey, Row> = BTreeMap::new();
        for row in self.base.scan(table, &FetchRequest::all())? {
            merged.insert(row.key(&union_key)?, row);
        }
        if let Some(overrides) = self.overrides.lock().get(table) {
            for (key, row) in overrides {
                match row {
                    Some(row) => {
                        merged.insert(key.clone(), row.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }

        let mut rows: Vec<Row> = merged
            .into_iter()
            .filter(|(key, row)| {
                request.constraint.admits(row)
                    && request.start.as_ref().is_none_or(|start| key > start)
            })
            .map(|(_, row)| row)
            .collect();
        if request.reverse {
            rows.reverse();
        }
        Ok(Box::new(rows.into_iter()))
    }
}

//! The view syncer orchestrator: one per client group.
//!
//! Every state mutation — CVR, pipeline set, TTL clock, client map — happens
//! under one logical lock (a single async mutex), making the service a
//! single-writer serial executor. The reconcile loop reacts to replica
//! version-ready events, connection-driven configuration changes, and TTL
//! eviction wakeups; each reconcile drives the pipeline driver, the CVR
//! updaters, and the pokers in the order fixed by the protocol.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use metrics::{counter, gauge};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use viewsync_ast::{CustomQueryTransformer, QueryTransformer, TransformedQuery};
use viewsync_client::metrics::recorded;
use viewsync_client::{
    DeleteClientsBody, Downstream, InspectOp, InspectRequest, InspectResponse, QueryPatch,
    SchemaVersions, Upstream,
};
use viewsync_cvr::{
    CvrConfigDrivenUpdater, CvrFlush, CvrQueryDrivenUpdater, CvrSnapshot, CvrStore,
    OwnershipToken, Patch, PatchToVersion, QueryKind, TtlClock,
};
use viewsync_data::{
    ClientGroupId, ClientId, CvrVersion, QueryId, RowId, StateVersion, TransformationHash,
};
use viewsync_dataflow::{AdvanceOutcome, PipelineDriver, ReplicaSnapshotter, RowChange};
use viewsync_errors::{internal_err, SyncError, SyncResult};
use viewsync_util::lap::LapTimer;

use crate::client::ClientHandler;
use crate::poker::PokeHandler;
use crate::ttl::{eviction_delay, TtlState, TTL_FLUSH_INTERVAL};

/// Rows accumulated into the CVR updater between scheduler yields.
pub const CVR_ROW_BATCH: usize = 10_000;

/// Row-loop lap budget: how often the clock is checked and how long a lap
/// may run before yielding.
const LAP_CHECK_EVERY: usize = 100;
const LAP_BUDGET: Duration = Duration::from_millis(500);

/// A verified connection token, as far as the view syncer cares: the subject
/// it was issued for and when it was issued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthToken {
    /// The token subject.
    pub sub: String,
    /// Issued-at, seconds since the epoch.
    pub iat: u64,
}

/// Construction-time options of one view syncer.
#[derive(Clone, Debug)]
pub struct ViewSyncerOptions {
    /// The client group served.
    pub client_group_id: ClientGroupId,
    /// Stable id of this task, used in the CVR ownership token.
    pub task_id: String,
    /// How long to linger after the last client disconnects.
    pub keepalive: Duration,
    /// Hydrations slower than this are logged as slow.
    pub slow_hydrate_threshold: Duration,
    /// Supported client schema versions advertised in pokes.
    pub schema_versions: Option<SchemaVersions>,
}

/// One view syncer instance. Cheap to clone; all clones share the instance.
#[derive(Clone)]
pub struct ViewSyncer {
    inner: Arc<Inner>,
}

struct Inner {
    options: ViewSyncerOptions,
    store: Arc<dyn CvrStore>,
    transformer: Arc<dyn QueryTransformer>,
    custom_transformer: Option<Arc<dyn CustomQueryTransformer>>,
    state: Mutex<ServiceState>,
    stopped_tx: watch::Sender<bool>,
}

struct ServiceState {
    active: bool,
    driver: PipelineDriver,
    cvr: Option<CvrSnapshot>,
    token: Option<OwnershipToken>,
    clients: HashMap<(ClientId, String), ClientHandler>,
    ttl: TtlState,
    pinned_token: Option<AuthToken>,
    synced_once: bool,
    poke_counter: u64,
    /// Config-driven patches staged by connection handlers, delivered with
    /// the next poke.
    pending_config_patches: Vec<PatchToVersion>,
    /// The config-driven write set awaiting the next flush, merged into the
    /// query-driven flush so a connect's config bump and its hydration land
    /// atomically.
    pending_config_flush: Option<CvrFlush>,
    /// The CVR version before the first staged config change.
    config_base: Option<CvrVersion>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl ViewSyncer {
    /// Create a view syncer over the given snapshotter and CVR store.
    pub fn new(
        options: ViewSyncerOptions,
        snapshotter: Box<dyn ReplicaSnapshotter>,
        store: Arc<dyn CvrStore>,
        transformer: Arc<dyn QueryTransformer>,
        custom_transformer: Option<Arc<dyn CustomQueryTransformer>>,
    ) -> Self {
        let driver = PipelineDriver::new(snapshotter, options.slow_hydrate_threshold);
        let (stopped_tx, _) = watch::channel(false);
        ViewSyncer {
            inner: Arc::new(Inner {
                options,
                store,
                transformer,
                custom_transformer,
                state: Mutex::new(ServiceState {
                    active: true,
                    driver,
                    cvr: None,
                    token: None,
                    clients: HashMap::new(),
                    ttl: TtlState::resume(TtlClock::ZERO),
                    pinned_token: None,
                    synced_once: false,
                    poke_counter: 0,
                    pending_config_patches: Vec::new(),
                    pending_config_flush: None,
                    config_base: None,
                }),
                stopped_tx,
            }),
        }
    }

    /// The client group this syncer serves.
    pub fn client_group_id(&self) -> &ClientGroupId {
        &self.inner.options.client_group_id
    }

    /// Handle an `initConnection` for a new websocket, returning the
    /// downstream frame stream for the connection.
    ///
    /// Token pinning: the first accepted token pins the subject; later
    /// connections must present the same `sub`, and among accepted tokens the
    /// greater `iat` wins.
    pub async fn init_connection(
        &self,
        client_id: ClientId,
        ws_id: &str,
        base_cookie: Option<&str>,
        auth: Option<AuthToken>,
        msg: Upstream,
    ) -> SyncResult<mpsc::Receiver<SyncResult<Downstream>>> {
        let Upstream::InitConnection {
            desired_queries_patch,
            client_schema,
            deleted,
            active_clients,
        } = msg
        else {
            return Err(SyncError::InvalidPush(
                "first message must be initConnection".into(),
            ));
        };

        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if !state.active {
            return Err(internal_err!("view syncer is stopped"));
        }

        // Token pinning happens before any state is touched: a rejected
        // connection must leave no trace.
        if let Some(token) = &auth {
            match &state.pinned_token {
                Some(pinned) if pinned.sub != token.sub => {
                    return Err(SyncError::Unauthorized(format!(
                        "connection token subject does not match this client group \
                         (got {}, pinned {})",
                        token.sub, pinned.sub
                    )));
                }
                Some(pinned) if token.iat < pinned.iat => {
                    debug!(client = %client_id, "older token accepted alongside pinned one");
                }
                _ => state.pinned_token = Some(token.clone()),
            }
        }

        self.ensure_loaded(&mut state).await?;
        let cvr = state.cvr.as_ref().expect("loaded above");

        let base = match base_cookie {
            None => None,
            Some(cookie) => {
                let base: CvrVersion = cookie.parse().map_err(|_| {
                    SyncError::InvalidConnectionRequestBaseCookie {
                        base_cookie: cookie.to_owned(),
                        server_version: cvr.version.cookie(),
                    }
                })?;
                if cvr.is_empty() {
                    return Err(SyncError::ClientNotFound(
                        inner.options.client_group_id.clone(),
                    ));
                }
                if base > cvr.version {
                    return Err(SyncError::InvalidConnectionRequestBaseCookie {
                        base_cookie: cookie.to_owned(),
                        server_version: cvr.version.cookie(),
                    });
                }
                Some(base)
            }
        };

        let (handler, receiver) = ClientHandler::new(client_id.clone(), ws_id, base);
        state
            .clients
            .insert((client_id.clone(), ws_id.to_owned()), handler);
        state.ttl.start();
        gauge!(recorded::CONNECTED_CLIENTS).set(state.clients.len() as f64);

        let result = self
            .apply_config_change(&mut state, |updater, now| {
                updater.ensure_client(&client_id);
                if let Some(schema) = &client_schema {
                    updater.set_client_schema(schema)?;
                }
                let mut confirmed = DeleteClientsBody::default();
                if let Some(deleted) = &deleted {
                    confirmed.client_ids =
                        updater.delete_clients(&deleted.client_ids, now);
                }
                if let Some(active) = &active_clients {
                    let mut active: BTreeSet<ClientId> = active.iter().cloned().collect();
                    active.insert(client_id.clone());
                    updater.inactivate_clients_outside(&active, now);
                }
                apply_desired_patches(updater, &client_id, &desired_queries_patch, now)?;
                Ok(confirmed)
            })
            .await;

        match result {
            Ok(confirmed) => {
                if !confirmed.client_ids.is_empty() {
                    if let Some(handler) = state.clients.get_mut(&(client_id.clone(), ws_id.to_owned()))
                    {
                        handler.send(Downstream::DeleteClients(confirmed));
                    }
                }
                if let Err(err) = self.reconcile(&mut state).await {
                    self.handle_reconcile_error(&mut state, &client_id, ws_id, err.clone());
                    return Err(err);
                }
                Ok(receiver)
            }
            Err(err) => {
                if let Some(handler) =
                    state.clients.get_mut(&(client_id.clone(), ws_id.to_owned()))
                {
                    handler.fail(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Handle a `changeDesiredQueries` message from a connected client.
    pub async fn change_desired_queries(
        &self,
        client_id: &ClientId,
        ws_id: &str,
        desired_queries_patch: Vec<QueryPatch>,
    ) -> SyncResult<()> {
        let mut state = self.inner.state.lock().await;
        if !state.active {
            return Ok(());
        }
        let result = self
            .apply_config_change(&mut state, |updater, now| {
                apply_desired_patches(updater, client_id, &desired_queries_patch, now)
            })
            .await;
        match result {
            Ok(()) => {
                if let Err(err) = self.reconcile(&mut state).await {
                    self.handle_reconcile_error(&mut state, client_id, ws_id, err.clone());
                    return Err(err);
                }
                Ok(())
            }
            Err(err) => {
                if let Some(handler) = state.clients.get_mut(&(client_id.clone(), ws_id.to_owned()))
                {
                    handler.fail(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Handle a `deleteClients` message: remove the named clients and
    /// confirm what was actually deleted.
    pub async fn delete_clients(
        &self,
        client_id: &ClientId,
        ws_id: &str,
        body: DeleteClientsBody,
    ) -> SyncResult<()> {
        let mut state = self.inner.state.lock().await;
        if !state.active {
            return Ok(());
        }
        let deleted = self
            .apply_config_change(&mut state, |updater, now| {
                Ok(updater.delete_clients(&body.client_ids, now))
            })
            .await?;
        if let Some(handler) = state.clients.get_mut(&(client_id.clone(), ws_id.to_owned())) {
            handler.send(Downstream::DeleteClients(DeleteClientsBody {
                client_ids: deleted,
                client_group_ids: Vec::new(),
            }));
        }
        if let Err(err) = self.reconcile(&mut state).await {
            self.handle_reconcile_error(&mut state, client_id, ws_id, err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Answer an `inspect` request on the requesting connection.
    pub async fn inspect(
        &self,
        client_id: &ClientId,
        ws_id: &str,
        req: InspectRequest,
    ) -> SyncResult<()> {
        let mut state = self.inner.state.lock().await;
        let value = match req.op {
            InspectOp::Version => serde_json::json!(env!("CARGO_PKG_VERSION")),
            InspectOp::Queries => {
                let queries: Vec<serde_json::Value> = state
                    .cvr
                    .as_ref()
                    .map(|cvr| {
                        cvr.queries
                            .values()
                            .map(|q| {
                                serde_json::json!({
                                    "queryID": q.id.as_str(),
                                    "got": q.patch_version.is_some(),
                                    "internal": q.is_internal(),
                                    "clientState": q.client_state,
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                serde_json::Value::Array(queries)
            }
            InspectOp::Metrics => {
                let ttl_clock = state.ttl.read();
                serde_json::json!({
                    "connectedClients": state.clients.len(),
                    "pipelines": state.driver.pipeline_hashes().len(),
                    "rows": state.cvr.as_ref().map(|c| c.rows.len()).unwrap_or(0),
                    "ttlClock": ttl_clock.as_millis(),
                })
            }
        };
        if let Some(handler) = state.clients.get_mut(&(client_id.clone(), ws_id.to_owned())) {
            handler.send(Downstream::InspectResponse(InspectResponse {
                op: req.op,
                id: req.id,
                value,
            }));
        }
        Ok(())
    }

    /// Notify the syncer that the replica has a new version ready.
    pub async fn version_ready(&self) -> SyncResult<()> {
        let mut state = self.inner.state.lock().await;
        if !state.active || state.cvr.is_none() {
            return Ok(());
        }
        if let Err(err) = self.reconcile(&mut state).await {
            self.fail_all_clients(&mut state, &err);
            return Err(err);
        }
        Ok(())
    }

    /// A client's websocket closed. When the last client leaves, the TTL
    /// clock stops and a delayed shutdown check is armed.
    pub async fn client_closed(&self, client_id: &ClientId, ws_id: &str) {
        let mut state = self.inner.state.lock().await;
        state
            .clients
            .remove(&(client_id.clone(), ws_id.to_owned()));
        gauge!(recorded::CONNECTED_CLIENTS).set(state.clients.len() as f64);
        if !state.clients.is_empty() {
            return;
        }
        // Freeze the clock and flush it so disconnected time does not age
        // queries, then linger for the keepalive window.
        let clock = state.ttl.stop();
        self.flush_clock(&mut state, clock).await;
        let syncer = self.clone();
        let keepalive = self.inner.options.keepalive;
        tokio::spawn(async move {
            sleep(keepalive).await;
            let mut state = syncer.inner.state.lock().await;
            if state.active && state.clients.is_empty() {
                info!(group = %syncer.inner.options.client_group_id, "idle past keepalive, stopping");
                syncer.shutdown(&mut state, None);
            }
        });
    }

    /// Run the service loop: reconcile on replica version-ready events,
    /// flush the TTL clock periodically, and fire TTL evictions. Resolves
    /// when the syncer stops.
    pub async fn run(&self, mut replica_state: watch::Receiver<()>) {
        let mut stopped = self.inner.stopped_tx.subscribe();
        loop {
            let wakeup = {
                let mut state = self.inner.state.lock().await;
                if !state.active {
                    break;
                }
                let now = state.ttl.read();
                state
                    .cvr
                    .as_ref()
                    .and_then(|cvr| cvr.earliest_expiration())
                    .map(|earliest| eviction_delay(now, earliest))
                    .unwrap_or(TTL_FLUSH_INTERVAL)
                    .min(TTL_FLUSH_INTERVAL)
            };
            tokio::select! {
                changed = replica_state.changed() => {
                    if changed.is_err() {
                        let mut state = self.inner.state.lock().await;
                        self.shutdown(&mut state, None);
                        break;
                    }
                    if let Err(err) = self.version_ready().await {
                        warn!(error = %err, "reconcile failed");
                        if err.is_fatal_to_client_group() {
                            break;
                        }
                    }
                }
                _ = sleep(wakeup) => {
                    let mut state = self.inner.state.lock().await;
                    if !state.active {
                        break;
                    }
                    let clock = state.ttl.read();
                    self.flush_clock(&mut state, clock).await;
                    if state.cvr.is_some() {
                        if let Err(err) = self.reconcile(&mut state).await {
                            warn!(error = %err, "eviction reconcile failed");
                            if err.is_fatal_to_client_group() {
                                self.fail_all_clients(&mut state, &err);
                                break;
                            }
                        }
                    }
                }
                _ = stopped.changed() => break,
            }
        }
    }

    /// Request a stop. Pending lock work drains, the TTL clock is flushed,
    /// client subscriptions are failed, and [`stopped`](Self::stopped)
    /// resolves.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        self.shutdown(&mut state, None);
    }

    /// Resolves once the syncer has stopped.
    pub async fn stopped(&self) {
        let mut rx = self.inner.stopped_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ===== internals (all called with the state lock held) =====

    async fn ensure_loaded(&self, state: &mut ServiceState) -> SyncResult<()> {
        if state.cvr.is_some() {
            return Ok(());
        }
        let token = OwnershipToken {
            task_id: self.inner.options.task_id.clone(),
            last_connect_time: now_ms(),
        };
        let cvr = self
            .inner
            .store
            .load(&self.inner.options.client_group_id, &token)
            .await?;
        state.ttl = TtlState::resume(cvr.ttl_clock);
        state.token = Some(token);
        state.cvr = Some(cvr);
        Ok(())
    }

    /// Run a config-driven update, staging its write set and patches for the
    /// next reconcile. The actual flush is merged with the query-driven
    /// flush that follows, so configuration and hydration land on one
    /// version when they happen together.
    async fn apply_config_change<T>(
        &self,
        state: &mut ServiceState,
        apply: impl FnOnce(&mut CvrConfigDrivenUpdater, TtlClock) -> SyncResult<T>,
    ) -> SyncResult<T> {
        self.ensure_loaded(state).await?;
        let cvr = state.cvr.clone().expect("loaded above");
        let base = cvr.version.clone();
        let now = state.ttl.read();
        let mut updater = CvrConfigDrivenUpdater::new(cvr);
        let value = apply(&mut updater, now)?;
        let (new_cvr, flush, patches) = updater.done();
        if let Some(flush) = flush {
            state.config_base.get_or_insert(base);
            state.pending_config_flush = Some(match state.pending_config_flush.take() {
                None => flush,
                Some(older) => CvrFlush::merge(older, flush),
            });
            state.cvr = Some(new_cvr);
            state.pending_config_patches.extend(patches);
        }
        Ok(value)
    }

    async fn flush_to_store(
        &self,
        state: &mut ServiceState,
        flush: CvrFlush,
    ) -> SyncResult<()> {
        let token = state
            .token
            .clone()
            .ok_or_else(|| internal_err!("flush without ownership token"))?;
        let ttl_clock = state.ttl.read();
        let rows = flush.rows.len() + flush.deleted_rows.len();
        let result = self
            .inner
            .store
            .flush(
                &self.inner.options.client_group_id,
                &token,
                flush,
                ttl_clock,
                now_ms(),
            )
            .await;
        match result {
            Ok(()) => {
                counter!(recorded::CVR_FLUSHES, "result" => "ok").increment(1);
                metrics::histogram!(recorded::CVR_FLUSH_ROWS).record(rows as f64);
                Ok(())
            }
            Err(err @ SyncError::OwnershipLost { .. }) => {
                counter!(recorded::CVR_FLUSHES, "result" => "conflict").increment(1);
                warn!(group = %self.inner.options.client_group_id, "lost cvr ownership, stopping");
                self.shutdown(state, Some(err.clone()));
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn flush_clock(&self, state: &mut ServiceState, clock: TtlClock) {
        let (Some(token), Some(_)) = (state.token.clone(), state.cvr.as_ref()) else {
            return;
        };
        if let Err(err) = self
            .inner
            .store
            .touch(
                &self.inner.options.client_group_id,
                &token,
                clock,
                now_ms(),
            )
            .await
        {
            if matches!(err, SyncError::OwnershipLost { .. }) {
                self.shutdown(state, Some(err));
            } else {
                warn!(error = %err, "ttl clock flush failed");
            }
        } else if let Some(cvr) = state.cvr.as_mut() {
            cvr.ttl_clock = clock;
        }
    }

    fn shutdown(&self, state: &mut ServiceState, err: Option<SyncError>) {
        if !state.active {
            return;
        }
        state.active = false;
        if let Some(err) = err {
            self.fail_all_clients(state, &err);
        }
        state.clients.clear();
        let _ = self.inner.stopped_tx.send(true);
    }

    fn fail_all_clients(&self, state: &mut ServiceState, err: &SyncError) {
        for handler in state.clients.values_mut() {
            handler.fail(err.clone());
        }
    }

    fn handle_reconcile_error(
        &self,
        state: &mut ServiceState,
        client_id: &ClientId,
        ws_id: &str,
        err: SyncError,
    ) {
        if err.is_fatal_to_client_group() {
            self.fail_all_clients(state, &err);
        } else if let Some(handler) =
            state.clients.get_mut(&(client_id.clone(), ws_id.to_owned()))
        {
            handler.fail(err);
        }
    }

    /// One reconcile pass: initialise pipelines if needed, then either
    /// advance them incrementally or (re)hydrate, then converge the pipeline
    /// set with the desired-query set and poke.
    async fn reconcile(&self, state: &mut ServiceState) -> SyncResult<()> {
        if !state.active {
            return Ok(());
        }
        if state.cvr.is_none() {
            return Ok(());
        }

        loop {
            if !state.driver.initialized() {
                let schema = state.cvr.as_ref().and_then(|c| c.client_schema.clone());
                state.driver.init(schema.as_ref())?;
                let cvr_replica = state.cvr.as_ref().and_then(|c| c.replica_version.clone());
                if let Some(cvr_replica) = cvr_replica {
                    if cvr_replica > state.driver.replica_version() {
                        return Err(SyncError::ClientNotFound(
                            self.inner.options.client_group_id.clone(),
                        ));
                    }
                }
            }

            if !state.synced_once {
                state.driver.advance_without_diff()?;
                self.hydrate_unchanged_queries(state).await?;
                self.sync_query_pipeline_set(state).await?;
                state.synced_once = true;
                return Ok(());
            }

            match state.driver.advance()? {
                AdvanceOutcome::ResetRequired => {
                    let schema = state.cvr.as_ref().and_then(|c| c.client_schema.clone());
                    state.driver.reset(schema.as_ref())?;
                    state.synced_once = false;
                    continue;
                }
                AdvanceOutcome::Advanced(advancement) => {
                    self.apply_advancement(state, advancement).await?;
                    // Staged config changes, expirations, and lagging
                    // clients all converge on the same reconcile tick.
                    self.sync_query_pipeline_set(state).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Rebuild pipelines for queries whose transformation hash is unchanged,
    /// without emitting patches — their rows are already in the CVR.
    async fn hydrate_unchanged_queries(&self, state: &mut ServiceState) -> SyncResult<()> {
        let cvr = state.cvr.clone().expect("caller checked");
        for record in cvr.queries.values() {
            let Some(prev_hash) = record.transformation_hash else {
                continue;
            };
            let transformed = self.transform(record).await?;
            if transformed.hash != prev_hash || state.driver.has_pipeline(prev_hash) {
                continue;
            }
            let changes = state
                .driver
                .add_query(transformed.hash, &transformed.ast)?;
            debug!(
                query = %record.id,
                hash = %transformed.hash,
                rows = changes.len(),
                "silently re-hydrated unchanged query"
            );
        }
        Ok(())
    }

    async fn transform(
        &self,
        record: &viewsync_cvr::QueryRecord,
    ) -> SyncResult<TransformedQuery> {
        match &record.kind {
            QueryKind::Client { ast } | QueryKind::Internal { ast } => {
                self.inner.transformer.transform(ast)
            }
            QueryKind::Custom { name, args } => match &self.inner.custom_transformer {
                Some(transformer) => Ok(transformer.transform_custom(name, args).await?),
                None => Err(SyncError::InvalidQuery(format!(
                    "custom query {name} requires a query resolver"
                ))),
            },
        }
    }

    /// Converge the pipeline set with the CVR's desired-query set: remove
    /// expired/undesired queries, hydrate new ones, drop orphaned pipelines,
    /// flush, and poke.
    async fn sync_query_pipeline_set(&self, state: &mut ServiceState) -> SyncResult<()> {
        let cvr = state.cvr.clone().expect("caller checked");
        let now = state.ttl.read();

        let mut live: Vec<(QueryId, TransformedQuery)> = Vec::new();
        let mut remove: Vec<QueryId> = Vec::new();
        for record in cvr.queries.values() {
            if record.is_undesired() || record.is_expired(now) {
                remove.push(record.id.clone());
            } else {
                live.push((record.id.clone(), self.transform(record).await?));
            }
        }

        let live_hashes: BTreeSet<TransformationHash> =
            live.iter().map(|(_, t)| t.hash).collect();
        let add: Vec<&(QueryId, TransformedQuery)> = live
            .iter()
            .filter(|(_, t)| !state.driver.has_pipeline(t.hash))
            .collect();
        let unhydrate: Vec<TransformationHash> = state
            .driver
            .pipeline_hashes()
            .into_iter()
            .filter(|h| !live_hashes.contains(h))
            .collect();

        if add.is_empty()
            && remove.is_empty()
            && unhydrate.is_empty()
            && state.pending_config_flush.is_none()
        {
            let base_version = cvr.version.clone();
            return self
                .catchup_and_poke(state, base_version, Vec::new(), "catchup")
                .await;
        }

        let target = state.driver.current_version()?;
        let base_version = state
            .config_base
            .clone()
            .unwrap_or_else(|| cvr.version.clone());
        let mut updater =
            CvrQueryDrivenUpdater::with_base(cvr, base_version.clone(), target);
        let mut patches: Vec<PatchToVersion> = Vec::new();

        for query_id in &remove {
            counter!(recorded::QUERIES_EVICTED).increment(1);
            if let Some(patch) = updater.removed(query_id) {
                patches.push(patch);
            }
        }
        for (query_id, transformed) in &live {
            if let Some(patch) = updater.executed(query_id, transformed.hash) {
                patches.push(patch);
            }
        }
        for (_, transformed) in add {
            let changes = state
                .driver
                .add_query(transformed.hash, &transformed.ast)?;
            patches.extend(self.drain_changes(&mut updater, &changes).await?);
        }
        for hash in unhydrate {
            state.driver.remove_query(hash);
        }
        patches.extend(updater.delete_unreferenced_rows());

        let (new_cvr, flush, _) = updater.done();
        let config_flush = state.pending_config_flush.take();
        state.config_base = None;
        let merged = match (config_flush, flush) {
            (None, None) => None,
            (Some(config), None) => Some(config),
            (None, Some(query)) => Some(query),
            (Some(config), Some(query)) => Some(CvrFlush::merge(config, query)),
        };
        if let Some(flush) = merged {
            self.flush_to_store(state, flush).await?;
        }
        state.cvr = Some(new_cvr);
        self.catchup_and_poke(state, base_version, patches, "config")
            .await
    }

    /// Apply an advancement's row changes to the CVR and poke.
    async fn apply_advancement(
        &self,
        state: &mut ServiceState,
        advancement: viewsync_dataflow::Advancement,
    ) -> SyncResult<()> {
        let cvr = state.cvr.clone().expect("caller checked");
        let base_version = state
            .config_base
            .clone()
            .unwrap_or_else(|| cvr.version.clone());
        let mut updater = CvrQueryDrivenUpdater::with_base(
            cvr.clone(),
            base_version.clone(),
            advancement.version.clone(),
        );
        for record in cvr.queries.values() {
            if let Some(hash) = record.transformation_hash {
                updater.unchanged(&record.id, hash);
            }
        }
        let mut patches = self.drain_changes(&mut updater, &advancement.changes).await?;
        patches.extend(updater.delete_unreferenced_rows());

        let (new_cvr, flush, _) = updater.done();
        let config_flush = state.pending_config_flush.take();
        state.config_base = None;
        let merged = match (config_flush, flush) {
            (None, None) => None,
            (Some(config), None) => Some(config),
            (None, Some(query)) => Some(query),
            (Some(config), Some(query)) => Some(CvrFlush::merge(config, query)),
        };
        match merged {
            None => Ok(()),
            Some(flush) => {
                self.flush_to_store(state, flush).await?;
                state.cvr = Some(new_cvr);
                self.catchup_and_poke(state, base_version, patches, "advance")
                    .await
            }
        }
    }

    /// Feed pipeline changes into the updater in laps: the clock is checked
    /// every [`LAP_CHECK_EVERY`] rows, the scheduler is yielded when a lap
    /// exceeds its budget, and a yield always happens per [`CVR_ROW_BATCH`]
    /// rows so outbound frames can drain.
    async fn drain_changes(
        &self,
        updater: &mut CvrQueryDrivenUpdater,
        changes: &[RowChange],
    ) -> SyncResult<Vec<PatchToVersion>> {
        let mut patches = Vec::new();
        let mut timer = LapTimer::new(LAP_CHECK_EVERY, LAP_BUDGET);
        let mut since_batch = 0usize;
        for chunk in changes.chunks(LAP_CHECK_EVERY) {
            patches.extend(updater.received(chunk)?);
            since_batch += chunk.len();
            let mut lap_exceeded = false;
            for _ in 0..chunk.len() {
                lap_exceeded |= timer.tick();
            }
            if lap_exceeded {
                tokio::task::yield_now().await;
                timer.lap();
            }
            if since_batch >= CVR_ROW_BATCH {
                since_batch = 0;
                tokio::task::yield_now().await;
            }
        }
        Ok(patches)
    }

    /// Poke every connected client up to the current CVR version: clients at
    /// the previous version get the new patches; clients further behind (or
    /// brand new) are additionally caught up from the store, with rows
    /// already present in the new patches excluded.
    ///
    /// The `pokeStart` is sent before catch-up assembly reads the store, so
    /// a poke abandoned mid-assembly is closed with `pokeEnd{cancel}` rather
    /// than left dangling.
    async fn catchup_and_poke(
        &self,
        state: &mut ServiceState,
        base_version: CvrVersion,
        new_patches: Vec<PatchToVersion>,
        reason: &'static str,
    ) -> SyncResult<()> {
        let mut new_patches = new_patches;
        new_patches.extend(std::mem::take(&mut state.pending_config_patches));

        let cvr = state.cvr.clone().expect("caller checked");
        let final_version = cvr.version.clone();

        let new_row_ids: HashSet<RowId> = new_patches
            .iter()
            .filter_map(|p| match &p.patch {
                Patch::Row(row_patch) => Some(row_patch.id().clone()),
                _ => None,
            })
            .collect();
        let new_got: HashSet<QueryId> = new_patches
            .iter()
            .filter_map(|p| match &p.patch {
                Patch::GotQuery(patch) => patch.hash().cloned(),
                _ => None,
            })
            .collect();

        let keys: Vec<(ClientId, String)> = state.clients.keys().cloned().collect();
        for key in keys {
            let Some(handler) = state.clients.get(&key) else {
                continue;
            };
            if handler.is_failed() || handler.version() == Some(&final_version) {
                continue;
            }
            let base = handler.version().cloned();

            state.poke_counter += 1;
            let poke_id = format!("{}:{}", self.inner.options.task_id, state.poke_counter);
            let mut poke = PokeHandler::new(
                poke_id,
                base.clone(),
                final_version.clone(),
                self.inner.options.schema_versions,
            );
            counter!(recorded::POKES_STARTED, "reason" => reason).increment(1);
            if let Some(handler) = state.clients.get_mut(&key) {
                handler.send(poke.start_frame());
            }

            // Clients at the pre-change version need only the new patches;
            // anyone further behind (or brand new) is first caught up from
            // the store's historical patch state.
            let after = base
                .clone()
                .unwrap_or_else(|| CvrVersion::initial(StateVersion::new("00")));
            let assembled = if after < base_version {
                self.add_catchup_patches(
                    &state.driver,
                    &cvr,
                    &key.0,
                    &after,
                    &final_version,
                    &new_row_ids,
                    &new_got,
                    &mut poke,
                )
                .await
            } else {
                Ok(())
            };
            if let Err(err) = assembled {
                // The client has seen the pokeStart; tell it to discard the
                // poke before the error propagates.
                counter!(recorded::POKES_CANCELLED).increment(1);
                warn!(client = %key.0, error = %err, "cancelling poke, catch-up failed");
                if let Some(handler) = state.clients.get_mut(&key) {
                    handler.send(poke.cancel());
                }
                return Err(err);
            }

            for patch in &new_patches {
                poke.add_patch(patch);
            }

            let handler = state
                .clients
                .get_mut(&key)
                .expect("checked presence above");
            for frame in poke.finish() {
                handler.send(frame);
            }
            handler.set_version(final_version.clone());
        }
        Ok(())
    }

    /// Stage the catch-up patches bringing one lagging client from `after`
    /// up to the state already persisted for the group: historical row
    /// states (contents re-read from the current snapshot, tombstones as
    /// deletes), got-query changes, and the client's current desired-query
    /// set so a reconnect converges without replaying config history.
    #[allow(clippy::too_many_arguments)]
    async fn add_catchup_patches(
        &self,
        driver: &PipelineDriver,
        cvr: &CvrSnapshot,
        client_id: &ClientId,
        after: &CvrVersion,
        final_version: &CvrVersion,
        new_row_ids: &HashSet<RowId>,
        new_got: &HashSet<QueryId>,
        poke: &mut PokeHandler,
    ) -> SyncResult<()> {
        let catchup_rows = self
            .inner
            .store
            .catchup_rows(&self.inner.options.client_group_id, after, final_version)
            .await?;
        for entry in catchup_rows {
            if new_row_ids.contains(&entry.id) {
                continue;
            }
            let patch = if entry.record.is_referenced() {
                match driver.get_row(&entry.id.table, &entry.id.row_key)? {
                    Some(row) => viewsync_client::RowPatch::Put {
                        id: entry.id.clone(),
                        contents: row.client_contents(),
                    },
                    None => viewsync_client::RowPatch::Del {
                        id: entry.id.clone(),
                    },
                }
            } else {
                viewsync_client::RowPatch::Del {
                    id: entry.id.clone(),
                }
            };
            poke.add_patch(&PatchToVersion {
                patch: Patch::Row(patch),
                to_version: entry.record.patch_version.clone(),
            });
        }

        let catchup_queries = self
            .inner
            .store
            .catchup_queries(&self.inner.options.client_group_id, after, final_version)
            .await?;
        for (record, deleted) in catchup_queries {
            if new_got.contains(&record.id) {
                continue;
            }
            let to_version = record
                .patch_version
                .clone()
                .unwrap_or_else(|| final_version.clone());
            let patch = if deleted {
                QueryPatch::Del {
                    hash: record.id.clone(),
                }
            } else {
                QueryPatch::Put {
                    hash: record.id.clone(),
                    ast: None,
                    name: None,
                    args: None,
                    ttl: None,
                }
            };
            poke.add_patch(&PatchToVersion {
                patch: Patch::GotQuery(patch),
                to_version,
            });
        }

        if let Some(client) = cvr.clients.get(client_id) {
            for query_id in &client.desired {
                if let Some(record) = cvr.queries.get(query_id) {
                    let ttl = record.client_state.get(client_id).and_then(|s| s.ttl);
                    let (ast, name, args) = match &record.kind {
                        QueryKind::Client { ast } | QueryKind::Internal { ast } => {
                            (Some(ast.clone()), None, None)
                        }
                        QueryKind::Custom { name, args } => {
                            (None, Some(name.clone()), Some(args.clone()))
                        }
                    };
                    poke.add_patch(&PatchToVersion {
                        patch: Patch::DesiredQuery {
                            client_id: client_id.clone(),
                            patch: QueryPatch::Put {
                                hash: query_id.clone(),
                                ast,
                                name,
                                args,
                                ttl,
                            },
                        },
                        to_version: final_version.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Apply a desired-queries patch list for one client.
fn apply_desired_patches(
    updater: &mut CvrConfigDrivenUpdater,
    client_id: &ClientId,
    patches: &[QueryPatch],
    now: TtlClock,
) -> SyncResult<()> {
    for patch in patches {
        match patch {
            QueryPatch::Put {
                hash,
                ast,
                name,
                args,
                ttl,
            } => {
                updater.put_desired_query(
                    client_id,
                    hash,
                    ast.as_ref(),
                    name.as_deref(),
                    args.as_ref(),
                    *ttl,
                )?;
            }
            QueryPatch::Del { hash } => {
                updater.del_desired_query(client_id, hash, now);
            }
            QueryPatch::Clear => {
                updater.clear_desired_queries(client_id, now);
            }
        }
    }
    Ok(())
}

impl std::fmt::Debug for ViewSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewSyncer")
            .field("client_group_id", &self.inner.options.client_group_id)
            .finish()
    }
}

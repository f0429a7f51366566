//! A [`CvrStore`] backed by PostgreSQL.
//!
//! Layout (one logical schema per app shard):
//!
//! * `instances(clientGroupID, taskID, lastConnectTime, version,
//!   replicaVersion, ttlClock, lastActive, clientSchema)` — ownership and
//!   versioning, one row per client group.
//! * `clients(clientGroupID, clientID, desired)`.
//! * `queries(clientGroupID, queryHash, record, transformationHash,
//!   patchVersion, internal, deleted)` — `deleted` rows are tombstones.
//! * `rows(clientGroupID, schema, table, rowKey, patchVersion, refCounts)` —
//!   a NULL `refCounts` is a tombstone.
//!
//! Version filtering for catch-up happens in Rust on parsed versions, not on
//! the cookie strings, so the store never depends on the cookie encoding
//! being byte-comparable.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::types::Json;
use tokio_postgres::Client;
use tracing::{debug, info};
use viewsync_data::{ClientGroupId, CvrVersion, RowId, StateVersion};
use viewsync_errors::{SyncError, SyncResult};

use crate::store::{CvrFlush, CvrStore, OwnershipToken, RowCatchup};
use crate::types::{ClientRecord, CvrSnapshot, QueryRecord, RowRecord, TtlClock};

/// A CVR store over one PostgreSQL database, namespaced by app schema.
pub struct PostgresCvrStore {
    client: Mutex<Client>,
    schema: String,
}

fn pg_err(err: tokio_postgres::Error) -> SyncError {
    SyncError::Storage(err.to_string())
}

impl PostgresCvrStore {
    /// Wrap an established connection, namespacing all tables under
    /// `schema` (typically `{appID}_{shardNum}/cvr`).
    pub fn new(client: Client, schema: impl Into<String>) -> Self {
        PostgresCvrStore {
            client: Mutex::new(client),
            schema: schema.into(),
        }
    }

    /// Create the schema and tables if they do not exist.
    pub async fn setup(&self) -> SyncResult<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(&self.ddl())
            .await
            .map_err(pg_err)?;
        info!(schema = %self.schema, "cvr schema ready");
        Ok(())
    }

    fn ddl(&self) -> String {
        let s = &self.schema;
        format!(
            r#"
CREATE SCHEMA IF NOT EXISTS "{s}";
CREATE TABLE IF NOT EXISTS "{s}"."instances" (
    "clientGroupID"   TEXT PRIMARY KEY,
    "taskID"          TEXT NOT NULL,
    "lastConnectTime" BIGINT NOT NULL,
    "version"         TEXT NOT NULL,
    "replicaVersion"  TEXT,
    "ttlClock"        BIGINT NOT NULL,
    "lastActive"      BIGINT NOT NULL,
    "clientSchema"    JSONB
);
CREATE TABLE IF NOT EXISTS "{s}"."clients" (
    "clientGroupID" TEXT NOT NULL,
    "clientID"      TEXT NOT NULL,
    "desired"       JSONB NOT NULL,
    PRIMARY KEY ("clientGroupID", "clientID")
);
CREATE TABLE IF NOT EXISTS "{s}"."queries" (
    "clientGroupID"      TEXT NOT NULL,
    "queryHash"          TEXT NOT NULL,
    "record"             JSONB NOT NULL,
    "transformationHash" TEXT,
    "patchVersion"       TEXT,
    "internal"           BOOLEAN NOT NULL DEFAULT FALSE,
    "deleted"            BOOLEAN NOT NULL DEFAULT FALSE,
    PRIMARY KEY ("clientGroupID", "queryHash")
);
CREATE TABLE IF NOT EXISTS "{s}"."rows" (
    "clientGroupID" TEXT NOT NULL,
    "schema"        TEXT NOT NULL,
    "table"         TEXT NOT NULL,
    "rowKey"        JSONB NOT NULL,
    "patchVersion"  TEXT NOT NULL,
    "refCounts"     JSONB,
    PRIMARY KEY ("clientGroupID", "schema", "table", "rowKey")
);
"#
        )
    }

    fn table(&self, name: &str) -> String {
        format!("\"{}\".\"{}\"", self.schema, name)
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> SyncResult<T> {
    serde_json::from_value(value).map_err(|e| SyncError::Storage(format!("corrupt record: {e}")))
}

#[async_trait]
impl CvrStore for PostgresCvrStore {
    async fn load(
        &self,
        client_group_id: &ClientGroupId,
        token: &OwnershipToken,
    ) -> SyncResult<CvrSnapshot> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(pg_err)?;

        let instances = self.table("instances");
        let row = tx
            .query_opt(
                &format!(
                    r#"SELECT "taskID", "lastConnectTime", "version", "replicaVersion",
                              "ttlClock", "lastActive", "clientSchema"
                       FROM {instances} WHERE "clientGroupID" = $1 FOR UPDATE"#
                ),
                &[client_group_id],
            )
            .await
            .map_err(pg_err)?;

        let mut snapshot = CvrSnapshot::new(client_group_id.clone());
        match row {
            None => {
                tx.execute(
                    &format!(
                        r#"INSERT INTO {instances}
                           ("clientGroupID", "taskID", "lastConnectTime", "version",
                            "replicaVersion", "ttlClock", "lastActive")
                           VALUES ($1, $2, $3, $4, NULL, 0, 0)"#
                    ),
                    &[
                        client_group_id,
                        &token.task_id,
                        &(token.last_connect_time as i64),
                        &snapshot.version.cookie(),
                    ],
                )
                .await
                .map_err(pg_err)?;
            }
            Some(row) => {
                let last_connect: i64 = row.get(1);
                if last_connect as u64 > token.last_connect_time {
                    return Err(SyncError::OwnershipLost {
                        client_group_id: client_group_id.clone(),
                    });
                }
                let version: String = row.get(2);
                snapshot.version = version.parse()?;
                snapshot.replica_version = row
                    .get::<_, Option<String>>(3)
                    .map(StateVersion::new);
                snapshot.ttl_clock = TtlClock::from_millis(row.get::<_, i64>(4) as u64);
                snapshot.last_active = row.get::<_, i64>(5) as u64;
                if let Some(Json(schema)) = row.get::<_, Option<Json<serde_json::Value>>>(6) {
                    snapshot.client_schema = Some(decode_json(schema)?);
                }
                tx.execute(
                    &format!(
                        r#"UPDATE {instances}
                           SET "taskID" = $2, "lastConnectTime" = $3
                           WHERE "clientGroupID" = $1"#
                    ),
                    &[
                        client_group_id,
                        &token.task_id,
                        &(token.last_connect_time as i64),
                    ],
                )
                .await
                .map_err(pg_err)?;

                for row in tx
                    .query(
                        &format!(
                            r#"SELECT "clientID", "desired" FROM {} WHERE "clientGroupID" = $1"#,
                            self.table("clients")
                        ),
                        &[client_group_id],
                    )
                    .await
                    .map_err(pg_err)?
                {
                    let Json(desired) = row.get::<_, Json<serde_json::Value>>(1);
                    let record = ClientRecord {
                        id: row.get(0),
                        desired: decode_json(desired)?,
                    };
                    snapshot.clients.insert(record.id.clone(), record);
                }
                for row in tx
                    .query(
                        &format!(
                            r#"SELECT "record" FROM {}
                               WHERE "clientGroupID" = $1 AND NOT "deleted""#,
                            self.table("queries")
                        ),
                        &[client_group_id],
                    )
                    .await
                    .map_err(pg_err)?
                {
                    let Json(record) = row.get::<_, Json<serde_json::Value>>(0);
                    let record: QueryRecord = decode_json(record)?;
                    snapshot.queries.insert(record.id.clone(), record);
                }
                for row in tx
                    .query(
                        &format!(
                            r#"SELECT "schema", "table", "rowKey", "patchVersion", "refCounts"
                               FROM {} WHERE "clientGroupID" = $1 AND "refCounts" IS NOT NULL"#,
                            self.table("rows")
                        ),
                        &[client_group_id],
                    )
                    .await
                    .map_err(pg_err)?
                {
                    let Json(row_key) = row.get::<_, Json<serde_json::Value>>(2);
                    let Json(ref_counts) = row.get::<_, Json<serde_json::Value>>(4);
                    let id = RowId::new(
                        row.get::<_, String>(0),
                        row.get::<_, String>(1),
                        decode_json(row_key)?,
                    );
                    let patch_version: CvrVersion = row.get::<_, String>(3).parse()?;
                    snapshot.rows.insert(
                        id,
                        RowRecord {
                            patch_version,
                            ref_counts: decode_json(ref_counts)?,
                        },
                    );
                }
            }
        }

        tx.commit().await.map_err(pg_err)?;
        debug!(
            group = %client_group_id,
            version = %snapshot.version,
            rows = snapshot.rows.len(),
            "loaded cvr"
        );
        Ok(snapshot)
    }

    async fn flush(
        &self,
        client_group_id: &ClientGroupId,
        token: &OwnershipToken,
        flush: CvrFlush,
        ttl_clock: TtlClock,
        last_active: u64,
    ) -> SyncResult<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(pg_err)?;

        let instances = self.table("instances");
        let owner = tx
            .query_opt(
                &format!(
                    r#"SELECT "taskID", "lastConnectTime" FROM {instances}
                       WHERE "clientGroupID" = $1 FOR UPDATE"#
                ),
                &[client_group_id],
            )
            .await
            .map_err(pg_err)?;
        let owned = owner.is_some_and(|row| {
            row.get::<_, String>(0) == token.task_id
                && row.get::<_, i64>(1) as u64 == token.last_connect_time
        });
        if !owned {
            return Err(SyncError::OwnershipLost {
                client_group_id: client_group_id.clone(),
            });
        }

        tx.execute(
            &format!(
                r#"UPDATE {instances}
                   SET "version" = $2, "replicaVersion" = $3, "ttlClock" = $4,
                       "lastActive" = $5, "clientSchema" = $6
                   WHERE "clientGroupID" = $1"#
            ),
            &[
                client_group_id,
                &flush.version.cookie(),
                &flush.replica_version.as_ref().map(|v| v.as_str()),
                &(ttl_clock.as_millis() as i64),
                &(last_active as i64),
                &flush
                    .client_schema
                    .as_ref()
                    .map(|s| Json(serde_json::to_value(s).expect("schema serializes"))),
            ],
        )
        .await
        .map_err(pg_err)?;

        let clients = self.table("clients");
        for record in &flush.clients {
            tx.execute(
                &format!(
                    r#"INSERT INTO {clients} ("clientGroupID", "clientID", "desired")
                       VALUES ($1, $2, $3)
                       ON CONFLICT ("clientGroupID", "clientID")
                       DO UPDATE SET "desired" = EXCLUDED."desired""#
                ),
                &[
                    client_group_id,
                    &record.id,
                    &Json(serde_json::to_value(&record.desired).expect("desired serializes")),
                ],
            )
            .await
            .map_err(pg_err)?;
        }
        for client_id in &flush.deleted_clients {
            tx.execute(
                &format!(
                    r#"DELETE FROM {clients} WHERE "clientGroupID" = $1 AND "clientID" = $2"#
                ),
                &[client_group_id, client_id],
            )
            .await
            .map_err(pg_err)?;
        }

        let queries = self.table("queries");
        for record in &flush.queries {
            tx.execute(
                &format!(
                    r#"INSERT INTO {queries}
                       ("clientGroupID", "queryHash", "record", "transformationHash",
                        "patchVersion", "internal", "deleted")
                       VALUES ($1, $2, $3, $4, $5, $6, FALSE)
                       ON CONFLICT ("clientGroupID", "queryHash")
                       DO UPDATE SET "record" = EXCLUDED."record",
                                     "transformationHash" = EXCLUDED."transformationHash",
                                     "patchVersion" = EXCLUDED."patchVersion",
                                     "deleted" = FALSE"#
                ),
                &[
                    client_group_id,
                    &record.id.as_str(),
                    &Json(serde_json::to_value(record).expect("query record serializes")),
                    &record.transformation_hash.map(|h| h.to_string()),
                    &record.patch_version.as_ref().map(|v| v.cookie()),
                    &record.is_internal(),
                ],
            )
            .await
            .map_err(pg_err)?;
        }
        for query_id in &flush.deleted_queries {
            tx.execute(
                &format!(
                    r#"UPDATE {queries} SET "deleted" = TRUE, "patchVersion" = $3
                       WHERE "clientGroupID" = $1 AND "queryHash" = $2"#
                ),
                &[client_group_id, &query_id.as_str(), &flush.version.cookie()],
            )
            .await
            .map_err(pg_err)?;
        }

        let rows = self.table("rows");
        for (id, record) in &flush.rows {
            tx.execute(
                &format!(
                    r#"INSERT INTO {rows}
                       ("clientGroupID", "schema", "table", "rowKey", "patchVersion", "refCounts")
                       VALUES ($1, $2, $3, $4, $5, $6)
                       ON CONFLICT ("clientGroupID", "schema", "table", "rowKey")
                       DO UPDATE SET "patchVersion" = EXCLUDED."patchVersion",
                                     "refCounts" = EXCLUDED."refCounts""#
                ),
                &[
                    client_group_id,
                    &id.schema,
                    &id.table,
                    &Json(serde_json::to_value(&id.row_key).expect("row key serializes")),
                    &record.patch_version.cookie(),
                    &Some(Json(
                        serde_json::to_value(&record.ref_counts).expect("refcounts serialize"),
                    )),
                ],
            )
            .await
            .map_err(pg_err)?;
        }
        for id in &flush.deleted_rows {
            tx.execute(
                &format!(
                    r#"INSERT INTO {rows}
                       ("clientGroupID", "schema", "table", "rowKey", "patchVersion", "refCounts")
                       VALUES ($1, $2, $3, $4, $5, NULL)
                       ON CONFLICT ("clientGroupID", "schema", "table", "rowKey")
                       DO UPDATE SET "patchVersion" = EXCLUDED."patchVersion",
                                     "refCounts" = NULL"#
                ),
                &[
                    client_group_id,
                    &id.schema,
                    &id.table,
                    &Json(serde_json::to_value(&id.row_key).expect("row key serializes")),
                    &flush.version.cookie(),
                ],
            )
            .await
            .map_err(pg_err)?;
        }

        tx.commit().await.map_err(pg_err)?;
        debug!(group = %client_group_id, version = %flush.version, "flushed cvr");
        Ok(())
    }

    async fn touch(
        &self,
        client_group_id: &ClientGroupId,
        token: &OwnershipToken,
        ttl_clock: TtlClock,
        last_active: u64,
    ) -> SyncResult<()> {
        let client = self.client.lock().await;
        let updated = client
            .execute(
                &format!(
                    r#"UPDATE {} SET "ttlClock" = $4, "lastActive" = $5
                       WHERE "clientGroupID" = $1 AND "taskID" = $2 AND "lastConnectTime" = $3"#,
                    self.table("instances")
                ),
                &[
                    client_group_id,
                    &token.task_id,
                    &(token.last_connect_time as i64),
                    &(ttl_clock.as_millis() as i64),
                    &(last_active as i64),
                ],
            )
            .await
            .map_err(pg_err)?;
        if updated == 0 {
            return Err(SyncError::OwnershipLost {
                client_group_id: client_group_id.clone(),
            });
        }
        Ok(())
    }

    async fn catchup_rows(
        &self,
        client_group_id: &ClientGroupId,
        after: &CvrVersion,
        upto: &CvrVersion,
    ) -> SyncResult<Vec<RowCatchup>> {
        let client = self.client.lock().await;
        let mut out = Vec::new();
        for row in client
            .query(
                &format!(
                    r#"SELECT "schema", "table", "rowKey", "patchVersion", "refCounts"
                       FROM {} WHERE "clientGroupID" = $1"#,
                    self.table("rows")
                ),
                &[client_group_id],
            )
            .await
            .map_err(pg_err)?
        {
            let patch_version: CvrVersion = row.get::<_, String>(3).parse()?;
            if patch_version <= *after || patch_version > *upto {
                continue;
            }
            let Json(row_key) = row.get::<_, Json<serde_json::Value>>(2);
            let ref_counts = match row.get::<_, Option<Json<serde_json::Value>>>(4) {
                Some(Json(counts)) => decode_json(counts)?,
                None => BTreeMap::new(),
            };
            out.push(RowCatchup {
                id: RowId::new(
                    row.get::<_, String>(0),
                    row.get::<_, String>(1),
                    decode_json(row_key)?,
                ),
                record: RowRecord {
                    patch_version,
                    ref_counts,
                },
            });
        }
        Ok(out)
    }

    async fn catchup_queries(
        &self,
        client_group_id: &ClientGroupId,
        after: &CvrVersion,
        upto: &CvrVersion,
    ) -> SyncResult<Vec<(QueryRecord, bool)>> {
        let client = self.client.lock().await;
        let mut out = Vec::new();
        for row in client
            .query(
                &format!(
                    r#"SELECT "record", "deleted", "patchVersion"
                       FROM {} WHERE "clientGroupID" = $1 AND "patchVersion" IS NOT NULL"#,
                    self.table("queries")
                ),
                &[client_group_id],
            )
            .await
            .map_err(pg_err)?
        {
            let patch_version: CvrVersion = row.get::<_, String>(2).parse()?;
            if patch_version <= *after || patch_version > *upto {
                continue;
            }
            let Json(record) = row.get::<_, Json<serde_json::Value>>(0);
            out.push((decode_json(record)?, row.get::<_, bool>(1)));
        }
        Ok(out)
    }
}

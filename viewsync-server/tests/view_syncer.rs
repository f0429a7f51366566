//! End-to-end view syncer behavior over an in-memory replica and CVR store:
//! connection pokes, advancement pokes, TTL eviction, junctions, base-cookie
//! validation, token pinning, and concurrent-owner takeover.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use vec1::vec1;
use viewsync_ast::{Correlation, PermissiveAuthorizer, Related, SelectAst, SubquerySystem};
use viewsync_client::{Downstream, QueryPatch, RowPatch, Upstream};
use viewsync_cvr::MemoryCvrStore;
use viewsync_data::{ColumnType, Row, RowId, RowKey, TableSpec, Value};
use viewsync_dataflow::replica::memory::MemoryReplicaHandle;
use viewsync_errors::{SyncError, SyncResult};
use viewsync_server::{AuthToken, ViewSyncer, ViewSyncerOptions};

fn issue_spec() -> TableSpec {
    TableSpec {
        schema: String::new(),
        table: "issue".into(),
        columns: [
            ("id".to_owned(), ColumnType::Integer),
            ("title".to_owned(), ColumnType::Text),
            ("closed".to_owned(), ColumnType::Boolean),
            ("ownerId".to_owned(), ColumnType::Text),
        ]
        .into(),
        primary_key: vec1!["id".to_owned()],
        unique_keys: vec![],
    }
}

fn label_spec() -> TableSpec {
    TableSpec {
        schema: String::new(),
        table: "label".into(),
        columns: [
            ("id".to_owned(), ColumnType::Integer),
            ("name".to_owned(), ColumnType::Text),
        ]
        .into(),
        primary_key: vec1!["id".to_owned()],
        unique_keys: vec![],
    }
}

fn issue_label_spec() -> TableSpec {
    TableSpec {
        schema: String::new(),
        table: "issueLabel".into(),
        columns: [
            ("issueId".to_owned(), ColumnType::Integer),
            ("labelId".to_owned(), ColumnType::Integer),
        ]
        .into(),
        primary_key: vec1!["issueId".to_owned(), "labelId".to_owned()],
        unique_keys: vec![],
    }
}

fn issue(id: i64, title: &str) -> Row {
    Row::from_iter([
        ("id", Value::from(id)),
        ("title", Value::from(title)),
        ("closed", Value::from(false)),
        ("ownerId", Value::from("u1")),
    ])
}

fn issue_row_id(id: i64) -> RowId {
    RowId::new("", "issue", RowKey::from_iter([("id", id)]))
}

fn replica() -> MemoryReplicaHandle {
    MemoryReplicaHandle::new([issue_spec(), label_spec(), issue_label_spec()])
}

fn syncer(
    handle: &MemoryReplicaHandle,
    store: Arc<MemoryCvrStore>,
    task_id: &str,
) -> ViewSyncer {
    ViewSyncer::new(
        ViewSyncerOptions {
            client_group_id: "g1".to_owned(),
            task_id: task_id.to_owned(),
            keepalive: Duration::from_secs(5),
            slow_hydrate_threshold: Duration::from_millis(200),
            schema_versions: None,
        },
        Box::new(handle.snapshotter()),
        store,
        Arc::new(PermissiveAuthorizer),
        None,
    )
}

fn init_msg(patches: Vec<QueryPatch>) -> Upstream {
    Upstream::InitConnection {
        desired_queries_patch: patches,
        client_schema: None,
        deleted: None,
        active_clients: None,
    }
}

fn put_query(hash: &str, ast: SelectAst, ttl: Option<u64>) -> QueryPatch {
    QueryPatch::Put {
        hash: hash.into(),
        ast: Some(ast),
        name: None,
        args: None,
        ttl,
    }
}

fn drain(rx: &mut mpsc::Receiver<SyncResult<Downstream>>) -> Vec<Downstream> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame.expect("subscription failed"));
    }
    frames
}

fn row_puts(frames: &[Downstream]) -> Vec<RowPatch> {
    frames
        .iter()
        .filter_map(|f| match f {
            Downstream::PokePart(part) => part.rows_patch.clone(),
            _ => None,
        })
        .flatten()
        .filter(|p| p.is_put())
        .collect()
}

fn row_dels(frames: &[Downstream]) -> Vec<RowId> {
    frames
        .iter()
        .filter_map(|f| match f {
            Downstream::PokePart(part) => part.rows_patch.clone(),
            _ => None,
        })
        .flatten()
        .filter(|p| !p.is_put())
        .map(|p| p.id().clone())
        .collect()
}

#[tokio::test]
async fn initial_connect_pokes_query_results() {
    let handle = replica();
    handle.put_row("issue", issue(1, "a"));
    handle.commit("00");
    let syncer = syncer(&handle, Arc::new(MemoryCvrStore::new()), "t1");

    let mut rx = syncer
        .init_connection(
            "c1".into(),
            "ws1",
            None,
            None,
            init_msg(vec![put_query("q1", SelectAst::table("issue"), None)]),
        )
        .await
        .unwrap();

    let frames = drain(&mut rx);
    let Downstream::PokeStart(start) = &frames[0] else {
        panic!("expected pokeStart, got {frames:?}");
    };
    assert_eq!(start.base_cookie, None);
    assert_eq!(start.cookie, "00:01");

    // Config frames precede row frames; the got-queries patch confirms q1.
    let got: Vec<&QueryPatch> = frames
        .iter()
        .filter_map(|f| match f {
            Downstream::PokePart(p) => p.got_queries_patch.as_ref(),
            _ => None,
        })
        .flatten()
        .collect();
    assert!(matches!(got[..], [QueryPatch::Put { ref hash, .. }] if hash.as_str() == "q1"));

    let puts = row_puts(&frames);
    assert_eq!(puts.len(), 1);
    let RowPatch::Put { id, contents } = &puts[0] else {
        unreachable!()
    };
    assert_eq!(*id, issue_row_id(1));
    assert_eq!(contents["title"], Value::from("a"));

    let Downstream::PokeEnd(end) = frames.last().unwrap() else {
        panic!("expected pokeEnd");
    };
    assert_eq!(end.cookie.as_deref(), Some("00:01"));
    assert!(!end.cancel);
}

#[tokio::test]
async fn advance_pokes_edit_as_put_without_del() {
    let handle = replica();
    handle.put_row("issue", issue(1, "a"));
    handle.commit("00");
    let syncer = syncer(&handle, Arc::new(MemoryCvrStore::new()), "t1");
    let mut rx = syncer
        .init_connection(
            "c1".into(),
            "ws1",
            None,
            None,
            init_msg(vec![put_query("q1", SelectAst::table("issue"), None)]),
        )
        .await
        .unwrap();
    drain(&mut rx);

    handle.put_row("issue", issue(1, "b"));
    handle.commit("01");
    syncer.version_ready().await.unwrap();

    let frames = drain(&mut rx);
    let Downstream::PokeStart(start) = &frames[0] else {
        panic!("expected pokeStart, got {frames:?}");
    };
    assert_eq!(start.base_cookie.as_deref(), Some("00:01"));
    assert_eq!(start.cookie, "01");

    assert!(row_dels(&frames).is_empty());
    let puts = row_puts(&frames);
    assert_eq!(puts.len(), 1);
    let RowPatch::Put { contents, .. } = &puts[0] else {
        unreachable!()
    };
    assert_eq!(contents["title"], Value::from("b"));
}

#[tokio::test]
async fn poke_ids_frame_exactly_once() {
    let handle = replica();
    handle.put_row("issue", issue(1, "a"));
    handle.commit("00");
    let syncer = syncer(&handle, Arc::new(MemoryCvrStore::new()), "t1");
    let mut rx = syncer
        .init_connection(
            "c1".into(),
            "ws1",
            None,
            None,
            init_msg(vec![put_query("q1", SelectAst::table("issue"), None)]),
        )
        .await
        .unwrap();
    handle.put_row("issue", issue(2, "b"));
    handle.commit("01");
    syncer.version_ready().await.unwrap();

    let frames = drain(&mut rx);
    let mut open: Vec<String> = Vec::new();
    let mut cookies: Vec<String> = Vec::new();
    for frame in &frames {
        match frame {
            Downstream::PokeStart(start) => {
                assert!(!open.contains(&start.poke_id));
                open.push(start.poke_id.clone());
                cookies.push(start.cookie.clone());
            }
            Downstream::PokePart(part) => {
                assert_eq!(open.last(), Some(&part.poke_id));
            }
            Downstream::PokeEnd(end) => {
                assert_eq!(open.last(), Some(&end.poke_id));
                open.pop();
            }
            _ => {}
        }
    }
    assert!(open.is_empty());
    // Cookies strictly increase across pokes.
    let parsed: Vec<viewsync_data::CvrVersion> =
        cookies.iter().map(|c| c.parse().unwrap()).collect();
    for pair in parsed.windows(2) {
        assert!(pair[0] < pair[1]);
    }
}

#[tokio::test]
async fn inactivated_query_survives_until_ttl_then_evicts() {
    let handle = replica();
    handle.put_row("issue", issue(1, "a"));
    handle.commit("00");
    let syncer = syncer(&handle, Arc::new(MemoryCvrStore::new()), "t1");
    let mut rx = syncer
        .init_connection(
            "c1".into(),
            "ws1",
            None,
            None,
            init_msg(vec![put_query("q1", SelectAst::table("issue"), Some(40))]),
        )
        .await
        .unwrap();
    drain(&mut rx);

    // Inactivate: the desired-query del goes out, but rows stay synced.
    syncer
        .change_desired_queries(&"c1".to_owned(), "ws1", vec![QueryPatch::Del {
            hash: "q1".into(),
        }])
        .await
        .unwrap();
    let frames = drain(&mut rx);
    assert!(row_dels(&frames).is_empty());
    let desired: Vec<&QueryPatch> = frames
        .iter()
        .filter_map(|f| match f {
            Downstream::PokePart(p) => p.desired_queries_patches.as_ref(),
            _ => None,
        })
        .flat_map(|m| m.values().flatten())
        .collect();
    assert!(matches!(desired[..], [QueryPatch::Del { ref hash }] if hash.as_str() == "q1"));

    // Before the TTL elapses a reconcile does not evict.
    syncer.version_ready().await.unwrap();
    assert!(drain(&mut rx).is_empty());

    // After the TTL elapses the query and its rows are dropped.
    tokio::time::sleep(Duration::from_millis(60)).await;
    syncer.version_ready().await.unwrap();
    let frames = drain(&mut rx);
    assert_eq!(row_dels(&frames), vec![issue_row_id(1)]);
    let got: Vec<&QueryPatch> = frames
        .iter()
        .filter_map(|f| match f {
            Downstream::PokePart(p) => p.got_queries_patch.as_ref(),
            _ => None,
        })
        .flatten()
        .collect();
    assert!(matches!(got[..], [QueryPatch::Del { ref hash }] if hash.as_str() == "q1"));
}

#[tokio::test]
async fn junction_insert_pokes_only_the_label() {
    let handle = replica();
    handle.put_row("issue", issue(1, "a"));
    handle.put_row(
        "label",
        Row::from_iter([("id", Value::from(10i64)), ("name", Value::from("bug"))]),
    );
    handle.commit("00");
    let syncer = syncer(&handle, Arc::new(MemoryCvrStore::new()), "t1");

    let ast = SelectAst {
        related: vec![Related {
            correlation: Correlation {
                parent_fields: vec1!["id".to_owned()],
                child_fields: vec1!["issueId".to_owned()],
            },
            subquery: Box::new(SelectAst {
                related: vec![Related {
                    correlation: Correlation {
                        parent_fields: vec1!["labelId".to_owned()],
                        child_fields: vec1!["id".to_owned()],
                    },
                    subquery: Box::new(SelectAst::table("label")),
                    alias: "labels".into(),
                    hidden: false,
                    system: SubquerySystem::Client,
                }],
                ..SelectAst::table("issueLabel")
            }),
            alias: "issueLabel".into(),
            hidden: true,
            system: SubquerySystem::Client,
        }],
        ..SelectAst::table("issue")
    };
    let mut rx = syncer
        .init_connection(
            "c1".into(),
            "ws1",
            None,
            None,
            init_msg(vec![put_query("q1", ast, None)]),
        )
        .await
        .unwrap();
    drain(&mut rx);

    handle.put_row(
        "issueLabel",
        Row::from_iter([("issueId", Value::from(1i64)), ("labelId", Value::from(10i64))]),
    );
    handle.commit("01");
    syncer.version_ready().await.unwrap();

    let frames = drain(&mut rx);
    let puts = row_puts(&frames);
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].id().table, "label");
    // The hidden junction row itself is never emitted.
    assert!(frames.iter().all(|f| match f {
        Downstream::PokePart(p) => p
            .rows_patch
            .iter()
            .flatten()
            .all(|patch| patch.id().table != "issueLabel"),
        _ => true,
    }));
}

#[tokio::test]
async fn second_client_is_caught_up_from_the_store() {
    let handle = replica();
    handle.put_row("issue", issue(1, "a"));
    handle.commit("00");
    let syncer = syncer(&handle, Arc::new(MemoryCvrStore::new()), "t1");
    let mut rx1 = syncer
        .init_connection(
            "c1".into(),
            "ws1",
            None,
            None,
            init_msg(vec![put_query("q1", SelectAst::table("issue"), None)]),
        )
        .await
        .unwrap();
    drain(&mut rx1);

    // c2 desires the same query; the pipeline is already hydrated, so its
    // rows come from catch-up.
    let mut rx2 = syncer
        .init_connection(
            "c2".into(),
            "ws2",
            None,
            None,
            init_msg(vec![put_query("q1", SelectAst::table("issue"), None)]),
        )
        .await
        .unwrap();
    let frames = drain(&mut rx2);
    let puts = row_puts(&frames);
    assert_eq!(puts.len(), 1);
    assert_eq!(*puts[0].id(), issue_row_id(1));
}

#[tokio::test]
async fn base_cookie_ahead_of_empty_cvr_is_client_not_found() {
    let handle = replica();
    handle.commit("00");
    let syncer = syncer(&handle, Arc::new(MemoryCvrStore::new()), "t1");
    let err = syncer
        .init_connection("c1".into(), "ws1", Some("01"), None, init_msg(vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ClientNotFound(_)));
}

#[tokio::test]
async fn base_cookie_ahead_of_nonempty_cvr_is_invalid() {
    let handle = replica();
    handle.put_row("issue", issue(1, "a"));
    handle.commit("00");
    let syncer = syncer(&handle, Arc::new(MemoryCvrStore::new()), "t1");
    let mut rx = syncer
        .init_connection(
            "c1".into(),
            "ws1",
            None,
            None,
            init_msg(vec![put_query("q1", SelectAst::table("issue"), None)]),
        )
        .await
        .unwrap();
    drain(&mut rx);

    let err = syncer
        .init_connection("c2".into(), "ws2", Some("99"), None, init_msg(vec![]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::InvalidConnectionRequestBaseCookie { .. }
    ));
}

#[tokio::test]
async fn client_schema_mismatch_fails_the_connection() {
    let handle = replica();
    handle.put_row("issue", issue(1, "a"));
    handle.commit("00");
    let syncer = syncer(&handle, Arc::new(MemoryCvrStore::new()), "t1");

    let schema = viewsync_data::ClientSchema {
        tables: [(
            "issue".to_owned(),
            [("id".to_owned(), ColumnType::Text)].into(),
        )]
        .into(),
    };
    let err = syncer
        .init_connection(
            "c1".into(),
            "ws1",
            None,
            None,
            Upstream::InitConnection {
                desired_queries_patch: vec![put_query("q1", SelectAst::table("issue"), None)],
                client_schema: Some(schema),
                deleted: None,
                active_clients: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ClientSchemaMismatch(_)));
}

#[tokio::test]
async fn token_subject_is_pinned_per_group() {
    let handle = replica();
    handle.commit("00");
    let syncer = syncer(&handle, Arc::new(MemoryCvrStore::new()), "t1");

    syncer
        .init_connection(
            "c1".into(),
            "ws1",
            None,
            Some(AuthToken {
                sub: "u1".into(),
                iat: 10,
            }),
            init_msg(vec![]),
        )
        .await
        .unwrap();

    let err = syncer
        .init_connection(
            "c2".into(),
            "ws2",
            None,
            Some(AuthToken {
                sub: "u2".into(),
                iat: 20,
            }),
            init_msg(vec![]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Unauthorized(_)));

    // Same subject with a newer iat is accepted.
    syncer
        .init_connection(
            "c3".into(),
            "ws3",
            None,
            Some(AuthToken {
                sub: "u1".into(),
                iat: 30,
            }),
            init_msg(vec![]),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn losing_cvr_ownership_stops_the_instance_cleanly() {
    let handle = replica();
    handle.put_row("issue", issue(1, "a"));
    handle.commit("00");
    let store = Arc::new(MemoryCvrStore::new());

    let first = syncer(&handle, Arc::clone(&store), "t1");
    let mut rx1 = first
        .init_connection(
            "c1".into(),
            "ws1",
            None,
            None,
            init_msg(vec![put_query("q1", SelectAst::table("issue"), None)]),
        )
        .await
        .unwrap();
    drain(&mut rx1);

    // A second instance claims the group with a later connect time.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = syncer(&handle, Arc::clone(&store), "t2");
    second
        .init_connection(
            "c1".into(),
            "ws1",
            Some("00:01"),
            None,
            init_msg(vec![put_query("q1", SelectAst::table("issue"), None)]),
        )
        .await
        .unwrap();

    // The first instance's next flush loses the ownership check and the
    // instance stops without further pokes.
    let err = first
        .change_desired_queries(
            &"c1".to_owned(),
            "ws1",
            vec![put_query("q2", SelectAst::table("label"), None)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::OwnershipLost { .. }));
    first.stopped().await;
}

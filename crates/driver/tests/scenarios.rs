use cosmosql_client::DocumentOptions;
use cosmosql_common::models::{PartitionKey, Throughput};
use cosmosql_common::CallContext;
use cosmosql_driver::{Conn, Driver};
use cosmosql_error::ErrorCode;
use cosmosql_testkit::emulator::WRITE_CHARGE;
use cosmosql_testkit::{Emulator, Fault};
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

fn open(emulator: &Arc<Emulator>, extra: &str) -> Conn {
    Driver::default()
        .open_with_sender(
            &format!("{}{}", Emulator::connection_string(), extra),
            emulator.clone(),
        )
        .unwrap()
}

/// 100 documents over `/app,/username`: four apps, sixteen users, grades 0..100 once each.
async fn seed_apps(conn: &Conn) {
    let ctx = CallContext::background();
    conn.exec(&ctx, "CREATE DATABASE IF NOT EXISTS db1", &[])
        .await
        .unwrap();
    conn.exec(&ctx, "CREATE COLLECTION apps WITH PK=/app,/username", &[])
        .await
        .unwrap();
    let insert = conn
        .prepare("INSERT INTO apps (id, app, username, grade) VALUES ($1, $2, $3, $4)")
        .unwrap();
    for i in 0..100 {
        insert
            .exec(
                &ctx,
                &[
                    json!(format!("doc{:03}", i)),
                    json!(format!("app{}", i % 4)),
                    json!(format!("user{}", i % 16)),
                    json!((i * 37) % 100),
                ],
            )
            .await
            .unwrap();
    }
}

fn grades(rows: &[Value]) -> Vec<i64> {
    rows.iter().map(|r| r["grade"].as_i64().unwrap()).collect()
}

#[tokio::test]
async fn test_insert_then_point_read() {
    let emulator = Arc::new(Emulator::new());
    let conn = open(&emulator, "DefaultDb=db1;");
    let ctx = CallContext::background();

    conn.exec(&ctx, "CREATE DATABASE db1", &[]).await.unwrap();
    conn.exec(&ctx, "CREATE COLLECTION db1.users WITH PK=/username", &[])
        .await
        .unwrap();
    let res = conn
        .exec(
            &ctx,
            "INSERT INTO db1.users (id, username, grade) VALUES ($1, $2, $3)",
            &[json!("00001"), json!("user1"), json!(42)],
        )
        .await
        .unwrap();
    assert_eq!(res.rows_affected, 1);
    assert!(res.request_charge > 0.0);

    let read = conn
        .client()
        .get_document::<Value>(
            &ctx,
            "db1",
            "users",
            "00001",
            &DocumentOptions {
                partition_key: Some(PartitionKey::single("user1")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(read.resource["id"], "00001");
    assert_eq!(read.resource["username"], "user1");
    assert_eq!(read.resource["grade"], 42);
    assert!(read.request_charge > 0.0);
}

#[tokio::test]
async fn test_prefix_query_on_hierarchical_key() {
    let emulator = Arc::new(Emulator::new());
    let conn = open(&emulator, "DefaultDb=db1;");
    seed_apps(&conn).await;

    let rows = conn
        .query(
            &CallContext::background(),
            "WITH collection=apps SELECT * FROM c WHERE c.app = 'app0'",
            &[],
        )
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(rows.len(), 25);
    assert!(rows.iter().all(|r| r["app"] == "app0"));
}

#[tokio::test]
async fn test_order_by_offset_limit_and_avg() {
    let emulator = Arc::new(Emulator::new());
    let conn = open(&emulator, "DefaultDb=db1;");
    seed_apps(&conn).await;
    let ctx = CallContext::background();

    let mut rows = conn
        .query(
            &ctx,
            "WITH collection=apps SELECT c.id, c.grade FROM c WHERE c.app = 'app0' ORDER BY c.grade",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(rows.columns().await.unwrap(), vec!["id", "grade"]);
    let mut ordered = Vec::new();
    while rows.next().await.unwrap() {
        let values = rows.scan().unwrap();
        ordered.push(values[1].as_i64().unwrap());
    }
    let expected: Vec<i64> = (0..25).map(|k| k * 4).collect();
    assert_eq!(ordered, expected);

    let window = conn
        .query(
            &ctx,
            "WITH collection=apps SELECT c.id, c.grade FROM c WHERE c.app = 'app0' \
             ORDER BY c.grade OFFSET 10 LIMIT 5",
            &[],
        )
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(grades(&window), expected[10..15].to_vec());

    let all = conn
        .query(
            &ctx,
            "WITH collection=apps SELECT c.id, c.grade FROM c ORDER BY c.grade ASC",
            &[],
        )
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(grades(&all), (0..100).collect::<Vec<i64>>());
    let page = conn
        .query(
            &ctx,
            "WITH collection=apps SELECT * FROM c ORDER BY c.grade ASC OFFSET 10 LIMIT 5",
            &[],
        )
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(page.len(), 5);
    for (row, expected) in page.iter().zip(&all[10..15]) {
        assert_eq!(row["id"], expected["id"]);
    }

    let avg = conn
        .query(&ctx, "WITH collection=apps SELECT VALUE AVG(c.grade) FROM c", &[])
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(avg.len(), 1);
    assert!((avg[0].as_f64().unwrap() - 49.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_throttled_insert_waits_and_sums_charges() {
    let emulator = Arc::new(Emulator::new());
    let conn = open(&emulator, "DefaultDb=db1;");
    seed_apps(&conn).await;
    let ctx = CallContext::background();

    emulator
        .inject(
            Fault::throttle(200)
                .on(Method::POST)
                .path_contains("/docs")
                .charge(0.5),
        )
        .await;
    emulator.clear_requests().await;

    let started = Instant::now();
    let res = conn
        .exec(
            &ctx,
            "INSERT INTO apps (id, app, username) VALUES ('late', 'app9', 'user9')",
            &[],
        )
        .await
        .unwrap();
    assert!(started.elapsed().as_millis() >= 200);
    assert_eq!(res.rows_affected, 1);
    assert!((res.request_charge - (0.5 + WRITE_CHARGE)).abs() < 1e-9);

    let requests = emulator.requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].status, 429);
    let recorded: f64 = requests.iter().map(|r| r.request_charge).sum();
    assert!((recorded - res.request_charge).abs() < 1e-9);
}

#[tokio::test]
async fn test_guarded_ddl_is_a_noop() {
    let emulator = Arc::new(Emulator::new());
    let conn = open(&emulator, "");
    let ctx = CallContext::background();

    assert_eq!(
        conn.exec(&ctx, "CREATE DATABASE db1", &[])
            .await
            .unwrap()
            .rows_affected,
        1
    );
    assert_eq!(
        conn.exec(&ctx, "CREATE DATABASE IF NOT EXISTS db1", &[])
            .await
            .unwrap()
            .rows_affected,
        0
    );
    let err = conn
        .exec(&ctx, "CREATE DATABASE db1", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Conflict);

    assert_eq!(
        conn.exec(&ctx, "DROP COLLECTION IF EXISTS db1.nope", &[])
            .await
            .unwrap()
            .rows_affected,
        0
    );
    let err = conn
        .exec(&ctx, "DROP COLLECTION db1.nope", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn test_list_and_alter_collections() {
    let emulator = Arc::new(Emulator::new());
    let conn = open(&emulator, "DefaultDb=db1;");
    let ctx = CallContext::background();
    conn.exec(&ctx, "CREATE DATABASE db1", &[]).await.unwrap();
    conn.exec(&ctx, "CREATE COLLECTION people WITH PK=/username WITH RU=400", &[])
        .await
        .unwrap();

    let databases = conn
        .query(&ctx, "LIST DATABASES", &[])
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert!(databases.iter().any(|d| d["id"] == "db1"));

    let collections = conn
        .query(&ctx, "LIST COLLECTIONS", &[])
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0]["id"], "people");

    conn.exec(&ctx, "ALTER COLLECTION people WITH RU=1000", &[])
        .await
        .unwrap();
    let offer = conn
        .client()
        .get_offer(&ctx, "db1", Some("people"))
        .await
        .unwrap();
    assert_eq!(offer.resource.throughput(), Some(Throughput::Manual(1000)));

    conn.exec(&ctx, "DROP COLLECTION people", &[]).await.unwrap();
    let collections = conn
        .query(&ctx, "LIST COLLECTIONS FROM db1", &[])
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert!(collections.is_empty());
}

#[tokio::test]
async fn test_update_and_delete_by_key() {
    let emulator = Arc::new(Emulator::new());
    let conn = open(&emulator, "DefaultDb=db1;");
    seed_apps(&conn).await;
    let ctx = CallContext::background();

    let res = conn
        .exec(
            &ctx,
            "UPDATE apps SET grade = 1000, note = 'curved' \
             WHERE id = 'doc000' AND app = 'app0' AND username = 'user0'",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(res.rows_affected, 1);
    let rows = conn
        .query(
            &ctx,
            "WITH collection=apps SELECT c.grade, c.note FROM c WHERE c.id = 'doc000'",
            &[],
        )
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(rows, vec![json!({"grade": 1000, "note": "curved"})]);

    let missing = conn
        .exec(
            &ctx,
            "UPDATE apps SET grade = 1 WHERE id = 'nope' AND app = 'app0' AND username = 'user0'",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(missing.rows_affected, 0);
    assert!(missing.request_charge > 0.0);

    let err = conn
        .exec(
            &ctx,
            "UPDATE apps SET grade = 1 WHERE id = 'doc000' AND grade = 1000",
            &[],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::UnsupportedQuery);

    let delete = "DELETE FROM apps WHERE id = $1 AND app = $2 AND username = $3";
    let args = [json!("doc001"), json!("app1"), json!("user1")];
    assert_eq!(conn.exec(&ctx, delete, &args).await.unwrap().rows_affected, 1);
    assert_eq!(conn.exec(&ctx, delete, &args).await.unwrap().rows_affected, 0);
    assert_eq!(emulator.document_count("db1", "apps").await, 99);
}

#[tokio::test]
async fn test_auto_id_fills_missing_ids() {
    let emulator = Arc::new(Emulator::new());
    let conn = open(&emulator, "DefaultDb=db1;AutoId=true;");
    let ctx = CallContext::background();
    conn.exec(&ctx, "CREATE DATABASE db1", &[]).await.unwrap();
    conn.exec(&ctx, "CREATE COLLECTION notes WITH PK=/topic", &[])
        .await
        .unwrap();
    conn.exec(&ctx, "INSERT INTO notes (topic, body) VALUES ('a', 'hello')", &[])
        .await
        .unwrap();
    conn.exec(&ctx, "UPSERT INTO notes (id, topic) VALUES ('fixed', 'a')", &[])
        .await
        .unwrap();

    let mut ids: Vec<String> = conn
        .query(&ctx, "SELECT VALUE c.id FROM notes c", &[])
        .await
        .unwrap()
        .collect()
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[1], "fixed");
    assert!(uuid::Uuid::parse_str(&ids[0]).is_ok());
}

#[tokio::test]
async fn test_name_resolution_errors() {
    let emulator = Arc::new(Emulator::new());
    let ctx = CallContext::background();

    let conn = open(&emulator, "DefaultDb=db1;");
    seed_apps(&conn).await;
    let err = conn
        .query(&ctx, "WITH database=db2 SELECT * FROM db1.apps c", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::UnsupportedQuery);
    let err = conn
        .query(&ctx, "WITH collection=apps SELECT * FROM other c", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::UnsupportedQuery);

    let bare = open(&emulator, "");
    let err = bare
        .query(&ctx, "WITH collection=apps SELECT * FROM c", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    let rows = bare
        .query(&ctx, "SELECT VALUE COUNT(1) FROM db1.apps c", &[])
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(rows, vec![json!(100)]);
}

#[tokio::test]
async fn test_statement_kinds_and_arguments() {
    let emulator = Arc::new(Emulator::new());
    let conn = open(&emulator, "DefaultDb=db1;");
    let ctx = CallContext::background();
    conn.exec(&ctx, "CREATE DATABASE db1", &[]).await.unwrap();

    assert_eq!(conn.begin_tx().unwrap_err().code, ErrorCode::NotSupported);

    let stmt = conn
        .prepare("INSERT INTO users (id, username) VALUES ($1, $2)")
        .unwrap();
    assert_eq!(stmt.num_input(), 2);
    let err = stmt.exec(&ctx, &[json!("only-one")]).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidParameter);
    stmt.close();

    let err = conn
        .exec(&ctx, "SELECT * FROM users u", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    let err = conn
        .query(&ctx, "CREATE DATABASE db2", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    assert_eq!(
        conn.exec(&ctx, "SELEC * FROM c", &[]).await.unwrap_err().code,
        ErrorCode::UnsupportedQuery
    );
}

#[tokio::test]
async fn test_closed_connection_rejects_calls() {
    let emulator = Arc::new(Emulator::new());
    let conn = open(&emulator, "DefaultDb=db1;");
    let clone = conn.clone();
    conn.close().await;

    let ctx = CallContext::background();
    let err = clone
        .exec(&ctx, "CREATE DATABASE db1", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    assert!(conn.prepare("SELECT * FROM c").is_err());
    assert!(emulator.requests().await.is_empty());
}

#[tokio::test]
async fn test_bad_connection_strings() {
    let emulator = Arc::new(Emulator::new());
    let err = Driver::default()
        .open_with_sender("AccountEndpoint=https://localhost:8081/;", emulator.clone())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidConnectionString);
    let err = Driver::default()
        .open_with_sender(
            "AccountEndpoint=https://localhost:8081/;AccountKey=***;",
            emulator.clone(),
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AuthConfigError);
}

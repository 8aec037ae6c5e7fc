use cosmosql_client::{ContainerProperties, CosmosClient, DocumentOptions, QueryRequest};
use cosmosql_common::config::DriverSettings;
use cosmosql_common::models::{PartitionKey, PartitionKeyDefinition, Throughput};
use cosmosql_common::CallContext;
use cosmosql_error::ErrorCode;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "C2y6yDjf5/R+ob0N8A7Cgv30VRDJIWEHLM+4QDU5DE2nQ9nDuVTqobD4b8mGGyPMbIZnqyMsEcaGQy67XIw/Jw==";

fn client(server: &MockServer) -> CosmosClient {
    CosmosClient::new(
        &server.uri(),
        SecretString::from(KEY.to_string()),
        DriverSettings::default(),
    )
    .unwrap()
}

async fn mount_container(server: &MockServer, def: PartitionKeyDefinition) {
    Mock::given(method("GET"))
        .and(path("/dbs/db/colls/users"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ms-request-charge", "1")
                .set_body_json(json!({
                    "id": "users",
                    "_rid": "coll-rid",
                    "partitionKey": serde_json::to_value(def).unwrap(),
                })),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_create_document_derives_partition_key() {
    let server = MockServer::start().await;
    mount_container(&server, PartitionKeyDefinition::hash("/username")).await;
    Mock::given(method("POST"))
        .and(path("/dbs/db/colls/users/docs"))
        .and(header("x-ms-documentdb-partitionkey", r#"["user1"]"#))
        .and(header("x-ms-version", "2020-07-15"))
        .and(header_exists("authorization"))
        .and(header_exists("x-ms-date"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("x-ms-request-charge", "6.5")
                .insert_header("x-ms-session-token", "0:1#3")
                .insert_header("etag", "\"e1\"")
                .set_body_json(json!({"id": "00001", "username": "user1", "grade": 42})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let doc = json!({"id": "00001", "username": "user1", "grade": 42});
    let resp = client
        .create_document(
            &CallContext::background(),
            "db",
            "users",
            &doc,
            &DocumentOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status, 201);
    assert_eq!(resp.resource["grade"], 42);
    // Metadata lookup plus the write.
    assert_eq!(resp.request_charge, 7.5);
    assert_eq!(resp.session_token.as_deref(), Some("0:1#3"));
    assert_eq!(resp.etag.as_deref(), Some("\"e1\""));
}

#[tokio::test]
async fn test_point_read_with_wrong_arity_sends_nothing() {
    let server = MockServer::start().await;
    mount_container(&server, PartitionKeyDefinition::hash("/username")).await;
    Mock::given(method("GET"))
        .and(path("/dbs/db/colls/users/docs/00001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let client = client(&server);
    let options = DocumentOptions {
        partition_key: Some(PartitionKey::from(vec!["user1", "extra"])),
        ..Default::default()
    };
    let err = client
        .get_document::<Value>(&CallContext::background(), "db", "users", "00001", &options)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PartitionKeyMismatch);
}

#[tokio::test]
async fn test_point_read_sends_key_verbatim() {
    let server = MockServer::start().await;
    mount_container(&server, PartitionKeyDefinition::hash("/username")).await;
    Mock::given(method("GET"))
        .and(path("/dbs/db/colls/users/docs/00001"))
        .and(header("x-ms-documentdb-partitionkey", r#"["user1"]"#))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ms-request-charge", "1")
                .set_body_json(json!({"id": "00001", "username": "user1"})),
        )
        .expect(2)
        .mount(&server)
        .await;

    let client = client(&server);
    let ctx = CallContext::background();
    let options = DocumentOptions {
        partition_key: Some(PartitionKey::single("user1")),
        ..Default::default()
    };
    let first = client
        .get_document::<Value>(&ctx, "db", "users", "00001", &options)
        .await
        .unwrap();
    assert_eq!(first.request_charge, 2.0);
    // Metadata is cached: a warm read costs exactly one request.
    let second = client
        .get_document::<Value>(&ctx, "db", "users", "00001", &options)
        .await
        .unwrap();
    assert_eq!(second.request_charge, 1.0);
    assert_eq!(second.resource["username"], "user1");
}

#[tokio::test]
async fn test_throttled_write_is_retried() {
    let server = MockServer::start().await;
    mount_container(&server, PartitionKeyDefinition::hash("/username")).await;
    Mock::given(method("POST"))
        .and(path("/dbs/db/colls/users/docs"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-ms-retry-after-ms", "100")
                .insert_header("x-ms-request-charge", "0.25"),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/dbs/db/colls/users/docs"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("x-ms-request-charge", "5")
                .set_body_json(json!({"id": "a", "username": "u"})),
        )
        .mount(&server)
        .await;

    let client = client(&server);
    let started = Instant::now();
    let resp = client
        .create_document(
            &CallContext::background(),
            "db",
            "users",
            &json!({"id": "a", "username": "u"}),
            &DocumentOptions::default(),
        )
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(resp.request_charge, 6.25);
}

#[tokio::test]
async fn test_list_databases_follows_continuation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dbs"))
        .and(header("x-ms-continuation", "page-2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ms-request-charge", "1")
                .set_body_json(json!({"Databases": [{"id": "c"}], "_count": 1})),
        )
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dbs"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ms-request-charge", "1")
                .insert_header("x-ms-continuation", "page-2")
                .set_body_json(json!({"Databases": [{"id": "a"}, {"id": "b"}], "_count": 2})),
        )
        .mount(&server)
        .await;

    let client = client(&server);
    let all = client
        .list_databases()
        .collect_all(&CallContext::background())
        .await
        .unwrap();
    let ids: Vec<_> = all.resource.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(all.request_charge, 2.0);
}

#[tokio::test]
async fn test_create_container_with_autoscale() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/dbs/db/colls"))
        .and(header("x-ms-cosmos-offer-autopilot-settings", r#"{"maxThroughput":4000}"#))
        .and(body_partial_json(json!({
            "id": "events",
            "partitionKey": {"paths": ["/app", "/username"], "kind": "MultiHash", "version": 2},
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "events",
            "partitionKey": {"paths": ["/app", "/username"], "kind": "MultiHash", "version": 2},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let props = ContainerProperties::new(
        "events",
        PartitionKeyDefinition::multi_hash(["/app", "/username"]),
    );
    let resp = client
        .create_container(
            &CallContext::background(),
            "db",
            &props,
            Some(Throughput::Autoscale(4000)),
        )
        .await
        .unwrap();
    assert_eq!(resp.resource.partition_key.paths.len(), 2);
}

#[tokio::test]
async fn test_replace_offer_throughput() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dbs/db"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ms-request-charge", "1")
                .set_body_json(json!({"id": "db", "_rid": "dbRid=="})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/offers"))
        .and(header("x-ms-documentdb-isquery", "true"))
        .and(body_partial_json(json!({
            "parameters": [{"name": "@rid", "value": "dbRid=="}],
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ms-request-charge", "2")
                .set_body_json(json!({"Offers": [{
                    "id": "Off1",
                    "_rid": "Off1",
                    "offerResourceId": "dbRid==",
                    "resource": "dbs/dbRid==/",
                    "offerVersion": "V2",
                    "content": {"offerThroughput": 400},
                }]})),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/offers/Off1"))
        .and(body_partial_json(json!({"content": {"offerThroughput": 800}})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ms-request-charge", "3")
                .set_body_json(json!({
                    "id": "Off1",
                    "_rid": "Off1",
                    "offerResourceId": "dbRid==",
                    "content": {"offerThroughput": 800},
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let ctx = CallContext::background();
    let offer = client.get_offer(&ctx, "db", None).await.unwrap();
    assert_eq!(offer.resource.throughput(), Some(Throughput::Manual(400)));
    assert_eq!(offer.request_charge, 3.0);

    let replaced = client
        .replace_offer_throughput(&ctx, "db", None, Throughput::Manual(800))
        .await
        .unwrap();
    assert_eq!(replaced.resource.throughput(), Some(Throughput::Manual(800)));
    assert_eq!(replaced.request_charge, 6.0);
}

#[tokio::test]
async fn test_single_partition_query_uses_key_header() {
    let server = MockServer::start().await;
    mount_container(&server, PartitionKeyDefinition::hash("/username")).await;
    Mock::given(method("POST"))
        .and(path("/dbs/db/colls/users/docs"))
        .and(header("x-ms-documentdb-isquery", "true"))
        .and(header("x-ms-documentdb-partitionkey", r#"["user1"]"#))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ms-request-charge", "2.5")
                .set_body_json(json!({"Documents": [{"id": "1"}, {"id": "2"}], "_count": 2})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let stream = client
        .query_documents(
            &CallContext::background(),
            "db",
            "users",
            QueryRequest::new("SELECT * FROM c WHERE c.username = @u").with_parameter("u", "user1"),
        )
        .await
        .unwrap();
    assert!(!stream.plan().is_cross_partition());
    let rows = stream.collect_rows().await.unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dbs/db"))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("x-ms-activity-id", "a-1")
                .set_body_json(json!({"code": "Unauthorized", "message": "bad signature"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client
        .get_database(&CallContext::background(), "db")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthorized);
    assert_eq!(err.message, "bad signature");
    assert_eq!(err.fingerprint.as_deref(), Some("GET dbs/db"));
}

use cosmosql_client::{ContainerProperties, CosmosClient, DocumentOptions, QueryRequest};
use cosmosql_common::config::DriverSettings;
use cosmosql_common::models::{PartitionKey, PartitionKeyDefinition, Throughput};
use cosmosql_common::CallContext;
use cosmosql_error::ErrorCode;
use cosmosql_testkit::emulator::{METADATA_CHARGE, WRITE_CHARGE};
use cosmosql_testkit::{Emulator, Fault, ENDPOINT};
use reqwest::Method;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::Arc;

async fn setup(emulator: &Arc<Emulator>) -> CosmosClient {
    let client = emulator.client(DriverSettings::default()).unwrap();
    let ctx = CallContext::background();
    client.create_database(&ctx, "db", None).await.unwrap();
    let props = ContainerProperties::new("people", PartitionKeyDefinition::hash("/username"))
        .with_unique_keys(vec![vec!["/email".to_string()]]);
    client
        .create_container(&ctx, "db", &props, None)
        .await
        .unwrap();
    client
}

async fn seed(client: &CosmosClient, n: usize) {
    let ctx = CallContext::background();
    for i in 0..n {
        let doc = json!({
            "id": format!("{:05}", i),
            "username": format!("user{}", i),
            "email": format!("user{}@example.com", i),
            "grade": i,
        });
        client
            .create_document(&ctx, "db", "people", &doc, &DocumentOptions::default())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_rejects_foreign_signature() {
    let emulator = Arc::new(Emulator::new());
    let _client = setup(&emulator).await;
    let rogue = CosmosClient::with_sender(
        ENDPOINT,
        SecretString::from("d3Jvbmcta2V5".to_string()),
        DriverSettings::default(),
        emulator.clone(),
    )
    .unwrap();
    let err = rogue
        .get_database(&CallContext::background(), "db")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthorized);
    assert_eq!(err.status, Some(401));
}

#[tokio::test]
async fn test_cross_partition_count_visits_every_range() {
    let emulator = Arc::new(Emulator::new());
    let client = setup(&emulator).await;
    seed(&client, 40).await;
    emulator.clear_requests().await;

    let rows = client
        .query_documents(
            &CallContext::background(),
            "db",
            "people",
            QueryRequest::new("SELECT VALUE COUNT(1) FROM c"),
        )
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    assert_eq!(rows, vec![json!(40)]);

    let routed: Vec<String> = emulator
        .requests()
        .await
        .iter()
        .filter_map(|r| r.header("x-ms-documentdb-partitionkeyrangeid").map(str::to_string))
        .collect();
    let mut routed_sorted = routed.clone();
    routed_sorted.sort();
    assert_eq!(routed_sorted, vec!["0", "1", "2", "3"]);
}

#[tokio::test]
async fn test_query_survives_partition_split() {
    let emulator = Arc::new(Emulator::new());
    let client = setup(&emulator).await;
    seed(&client, 40).await;
    let ctx = CallContext::background();

    // Warm the routing map, then split behind the client's back.
    assert_eq!(client.partition_key_ranges(&ctx, "db", "people").await.unwrap().len(), 4);
    let (left, right) = emulator.split_range("db", "people", "0", "08").await.unwrap();
    assert_eq!((left.as_str(), right.as_str()), ("4", "5"));

    let mut ids: Vec<String> = client
        .query_documents(
            &ctx,
            "db",
            "people",
            QueryRequest::new("SELECT VALUE c.id FROM c").max_item_count(7),
        )
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    ids.sort();
    let expected: Vec<String> = (0..40).map(|i| format!("{:05}", i)).collect();
    assert_eq!(ids, expected);

    let requests = emulator.requests().await;
    assert!(requests.iter().any(|r| r.status == 410));
    let ranges = client.partition_key_ranges(&ctx, "db", "people").await.unwrap();
    assert_eq!(ranges.len(), 5);
    assert!(ranges.iter().any(|r| r.parents == vec!["0".to_string()]));
}

#[tokio::test]
async fn test_throttled_write_charges_both_attempts() {
    let emulator = Arc::new(Emulator::new());
    let client = setup(&emulator).await;
    let ctx = CallContext::background();
    client.get_container(&ctx, "db", "people").await.unwrap();

    emulator
        .inject(
            Fault::throttle(50)
                .on(Method::POST)
                .path_contains("/docs")
                .charge(0.5),
        )
        .await;
    let doc = json!({"id": "a", "username": "u", "email": "u@example.com"});
    let resp = client
        .create_document(&ctx, "db", "people", &doc, &DocumentOptions::default())
        .await
        .unwrap();
    assert_eq!(resp.status, 201);
    assert!((resp.request_charge - (0.5 + WRITE_CHARGE)).abs() < 1e-9);
    assert_eq!(emulator.document_count("db", "people").await, 1);
}

#[tokio::test]
async fn test_cold_metadata_is_charged_to_the_first_call() {
    let emulator = Arc::new(Emulator::new());
    let client = setup(&emulator).await;
    let doc = json!({"id": "a", "username": "u", "email": "u@example.com"});
    let resp = client
        .create_document(
            &CallContext::background(),
            "db",
            "people",
            &doc,
            &DocumentOptions::default(),
        )
        .await
        .unwrap();
    assert!((resp.request_charge - (METADATA_CHARGE + WRITE_CHARGE)).abs() < 1e-9);
}

#[tokio::test]
async fn test_unique_key_and_etag_conflicts() {
    let emulator = Arc::new(Emulator::new());
    let client = setup(&emulator).await;
    let ctx = CallContext::background();
    let opts = DocumentOptions::default();

    let first = client
        .create_document(
            &ctx,
            "db",
            "people",
            &json!({"id": "1", "username": "u", "email": "same@example.com"}),
            &opts,
        )
        .await
        .unwrap();
    let err = client
        .create_document(
            &ctx,
            "db",
            "people",
            &json!({"id": "2", "username": "u", "email": "same@example.com"}),
            &opts,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Conflict);

    // Another logical partition may reuse the value.
    client
        .create_document(
            &ctx,
            "db",
            "people",
            &json!({"id": "2", "username": "v", "email": "same@example.com"}),
            &opts,
        )
        .await
        .unwrap();

    let stale = DocumentOptions {
        if_match: Some("\"stale\"".to_string()),
        ..Default::default()
    };
    let err = client
        .replace_document(
            &ctx,
            "db",
            "people",
            "1",
            &json!({"id": "1", "username": "u", "email": "new@example.com"}),
            &stale,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PreconditionFailed);

    let current = DocumentOptions {
        if_match: first.etag.clone(),
        ..Default::default()
    };
    let replaced = client
        .replace_document(
            &ctx,
            "db",
            "people",
            "1",
            &json!({"id": "1", "username": "u", "email": "new@example.com"}),
            &current,
        )
        .await
        .unwrap();
    assert_ne!(replaced.etag, first.etag);

    let read = client
        .get_document::<Value>(
            &ctx,
            "db",
            "people",
            "1",
            &DocumentOptions {
                partition_key: Some(PartitionKey::single("u")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(read.resource["email"], "new@example.com");
}

#[tokio::test]
async fn test_offers_follow_throughput_changes() {
    let emulator = Arc::new(Emulator::new());
    let client = setup(&emulator).await;
    let ctx = CallContext::background();

    let offer = client.get_offer(&ctx, "db", Some("people")).await.unwrap();
    assert_eq!(offer.resource.throughput(), Some(Throughput::Manual(400)));
    let err = client.get_offer(&ctx, "db", None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);

    client
        .replace_offer_throughput(&ctx, "db", Some("people"), Throughput::Autoscale(4000))
        .await
        .unwrap();
    let offer = client.get_offer(&ctx, "db", Some("people")).await.unwrap();
    assert_eq!(offer.resource.throughput(), Some(Throughput::Autoscale(4000)));
}

#[tokio::test]
async fn test_document_feed_pages() {
    let emulator = Arc::new(Emulator::new());
    let client = setup(&emulator).await;
    seed(&client, 7).await;
    let all = client
        .list_documents("db", "people", Some(3))
        .collect_all(&CallContext::background())
        .await
        .unwrap();
    assert_eq!(all.resource.len(), 7);
}

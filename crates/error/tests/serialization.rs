use cosmosql_error::{CosmosError, ErrorCode, ErrorContext};
use serde_json::Value;

#[test]
fn test_json_serialization() {
    let error = CosmosError::from_status(404, None, "Resource not found")
        .with_context(ErrorContext::Http {
            method: "GET".to_string(),
            resource_link: "dbs/db1/colls/c1/docs/00001".to_string(),
            pkrange_id: None,
        })
        .with_activity_id(Some("7e4a".to_string()))
        .with_fingerprint("GET dbs/db1/colls/c1/docs/00001")
        .with_request_charge(1.0);

    let json = error.to_json();
    let v: Value = serde_json::from_str(&json).expect("valid json");

    assert_eq!(v["code"], "COSMOSQL-1404");
    assert_eq!(v["status"], 404);
    assert_eq!(v["activity_id"], "7e4a");
    assert_eq!(v["request_charge"], 1.0);
    assert_eq!(v["context"]["type"], "http");
    assert_eq!(v["context"]["resource_link"], "dbs/db1/colls/c1/docs/00001");
}

#[test]
fn test_json_roundtrip_preserves_attributes() {
    let error = CosmosError::from_status(410, Some(1002), "Partition key range is gone")
        .with_request_charge(4.5);
    let back: CosmosError = serde_json::from_str(&error.to_json()).unwrap();
    assert_eq!(back.code, ErrorCode::PartitionKeyRangeGone);
    assert_eq!(back.sub_status, Some(1002));
    assert_eq!(back.request_charge, 4.5);
}

#[test]
fn test_error_code_parsing() {
    let code: ErrorCode = "COSMOSQL-1449".to_string().try_into().unwrap();
    assert_eq!(code, ErrorCode::RetryWith);
}

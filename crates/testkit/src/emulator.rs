//! In-memory emulation of the account REST surface.
//!
//! The emulator verifies master-key signatures, keeps databases, containers,
//! documents and offers in memory, partitions documents across key ranges by
//! effective partition key, and answers per-range queries the way the service
//! does. Tests script failures with [`Fault`]s and partition splits with
//! [`Emulator::split_range`].

use crate::eval::EvalError;
use crate::fault::Fault;
use crate::query::{self, Candidate, QueryToken};
use async_trait::async_trait;
use cosmosql_client::auth::decode_authorization;
use cosmosql_client::epk::{effective_partition_key, murmur3_x64_128, MAX_EPK, MIN_EPK};
use cosmosql_client::transport::{headers, Headers};
use cosmosql_client::{
    CosmosClient, HttpRequest, HttpResponse, HttpSender, MasterKeySigner, PartitionKeyRange,
};
use cosmosql_common::config::DriverSettings;
use cosmosql_common::models::{path_segments, PartitionKey, PartitionKeyDefinition};
use cosmosql_error::{CosmosError, ErrorCode, Result, SUBSTATUS_PARTITION_KEY_RANGE_GONE};
use cosmosql_sql::ast::SelectQuery;
use cosmosql_sql::json::canonical_key;
use cosmosql_sql::{parse_select, QueryParameter};
use reqwest::Method;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;

pub const ENDPOINT: &str = "https://localhost:8081/";

/// Well-known key of the local development emulator.
pub const ACCOUNT_KEY: &str =
    "C2y6yDjf5/R+ob0N8A7Cgv30VRDJIWEHLM+4QDU5DE2nQ9nDuVTqobD4b8mGGyPMbIZnqyMsEcaGQy67XIw/Jw==";

pub const METADATA_CHARGE: f64 = 1.0;
pub const READ_CHARGE: f64 = 1.0;
pub const WRITE_CHARGE: f64 = 5.5;
pub const QUERY_PAGE_CHARGE: f64 = 2.5;
pub const ERROR_CHARGE: f64 = 1.0;

const DEFAULT_PAGE_SIZE: usize = 100;
const DEFAULT_SPLIT_POINTS: [&str; 3] = ["10", "20", "30"];
const DEFAULT_CONTAINER_THROUGHPUT: u32 = 400;

/// One exchange as the emulator saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub headers: Headers,
    pub status: u16,
    pub request_charge: f64,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Debug)]
struct Reply {
    status: u16,
    body: Option<Value>,
    headers: Headers,
    charge: f64,
}

type Served<T = Reply> = std::result::Result<T, Reply>;

impl Reply {
    fn json(status: u16, body: Value, charge: f64) -> Self {
        Self {
            status,
            body: Some(body),
            headers: Headers::new(),
            charge,
        }
    }

    fn empty(status: u16, charge: f64) -> Self {
        Self {
            status,
            body: None,
            headers: Headers::new(),
            charge,
        }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        let code = match status {
            400 => "BadRequest",
            401 => "Unauthorized",
            404 => "NotFound",
            409 => "Conflict",
            410 => "Gone",
            412 => "PreconditionFailed",
            _ => "InternalServerError",
        };
        let charge = if status == 401 { 0.0 } else { ERROR_CHARGE };
        Self::json(status, json!({ "code": code, "message": message.into() }), charge)
    }

    fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    fn into_response(self) -> HttpResponse {
        let mut resp = match &self.body {
            Some(body) => HttpResponse::new(self.status).with_json(body),
            None => HttpResponse::new(self.status),
        };
        resp.headers.extend(self.headers);
        resp.with_header(headers::REQUEST_CHARGE, format!("{}", self.charge))
    }
}

fn not_found(what: &str, id: &str) -> Reply {
    Reply::error(404, format!("{} '{}' does not exist", what, id))
}

fn bad_request(message: impl Into<String>) -> Reply {
    Reply::error(400, message)
}

fn query_error(err: EvalError) -> Reply {
    bad_request(err.to_string())
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn segments(request: &HttpRequest) -> Vec<String> {
    request
        .url
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resource type and link a request must be signed with.
fn signing_target(segments: &[String]) -> (String, String) {
    let n = segments.len();
    if n == 0 {
        return (String::new(), String::new());
    }
    if n % 2 == 0 {
        let resource_type = segments[n - 2].clone();
        let link = if resource_type == "offers" {
            segments[n - 1].to_ascii_lowercase()
        } else {
            segments.join("/")
        };
        (resource_type, link)
    } else {
        (segments[n - 1].clone(), segments[..n - 1].join("/"))
    }
}

fn body_json(request: &HttpRequest) -> Served<Value> {
    let bytes = request.body.as_deref().unwrap_or_default();
    serde_json::from_slice(bytes).map_err(|e| bad_request(format!("Request body is not JSON: {}", e)))
}

fn string_id(body: &Value, what: &str) -> Served<String> {
    body.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| bad_request(format!("{} id is required", what)))
}

fn header_pk(request: &HttpRequest) -> Served<Option<PartitionKey>> {
    let Some(raw) = request.header(headers::PARTITION_KEY) else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw)
        .map_err(|_| bad_request(format!("Partition key header '{}' is not JSON", raw)))?;
    PartitionKey::from_json(&value)
        .map(Some)
        .map_err(|e| bad_request(e.message))
}

fn flag(request: &HttpRequest, name: &str) -> bool {
    request
        .header(name)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn page_size(request: &HttpRequest) -> usize {
    request
        .header(headers::MAX_ITEM_COUNT)
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|n| *n > 0)
        .map_or(DEFAULT_PAGE_SIZE, |n| n as usize)
}

/// Offer content requested by throughput headers, if any.
fn offer_content(request: &HttpRequest) -> Served<Option<Value>> {
    if let Some(raw) = request.header(headers::OFFER_THROUGHPUT) {
        let ru: u32 = raw
            .parse()
            .map_err(|_| bad_request(format!("Invalid throughput '{}'", raw)))?;
        return Ok(Some(json!({ "offerThroughput": ru })));
    }
    if let Some(raw) = request.header(headers::OFFER_AUTOPILOT) {
        let settings: Value = serde_json::from_str(raw)
            .map_err(|_| bad_request(format!("Invalid autoscale settings '{}'", raw)))?;
        return Ok(Some(json!({ "offerAutopilotSettings": settings })));
    }
    Ok(None)
}

/// A page of a list feed; continuation is the index of the next item.
fn list_page(items: Vec<Value>, request: &HttpRequest, key: &str, charge: f64) -> Served {
    let start = match request.header(headers::CONTINUATION) {
        Some(token) => token
            .parse::<usize>()
            .map_err(|_| bad_request("Invalid continuation token"))?,
        None => 0,
    };
    let size = page_size(request);
    let total = items.len();
    let page: Vec<Value> = items.into_iter().skip(start).take(size).collect();
    let end = start + page.len();
    let mut reply = Reply::json(
        200,
        json!({ key: page, "_count": page.len() }),
        charge,
    );
    if end < total {
        reply = reply.with_header(headers::CONTINUATION, end.to_string());
    }
    Ok(reply)
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = Some(doc);
    for seg in path_segments(path) {
        node = node.and_then(|n| n.get(&seg));
    }
    node
}

fn parameters(body: &Value) -> Served<HashMap<String, Value>> {
    let list = match body.get("parameters") {
        Some(list) => serde_json::from_value::<Vec<QueryParameter>>(list.clone())
            .map_err(|e| bad_request(format!("Invalid query parameters: {}", e)))?,
        None => Vec::new(),
    };
    Ok(list
        .into_iter()
        .map(|p| (p.name.trim_start_matches('@').to_string(), p.value))
        .collect())
}

fn parse_query(body: &Value) -> Served<SelectQuery> {
    let text = body
        .get("query")
        .and_then(Value::as_str)
        .ok_or_else(|| bad_request("Query text is required"))?;
    parse_select(text).map_err(|e| bad_request(format!("Syntax error: {}", e)))
}

fn check_etag(request: &HttpRequest, current: Option<&Value>) -> Served<()> {
    match request.header(headers::IF_MATCH) {
        Some(expected) if current.and_then(Value::as_str) != Some(expected) => Err(Reply::error(
            412,
            "Operation cannot be performed because one of the specified precondition is not met.",
        )),
        _ => Ok(()),
    }
}

#[derive(Debug)]
struct StoredDoc {
    body: Value,
    pk: PartitionKey,
    epk: String,
    seq: u64,
}

fn candidate(d: &StoredDoc) -> Candidate<'_> {
    Candidate {
        doc: &d.body,
        seq: d.seq,
    }
}

#[derive(Debug)]
struct Container {
    props: Value,
    def: PartitionKeyDefinition,
    unique_keys: Vec<Vec<String>>,
    ranges: Vec<PartitionKeyRange>,
    gone: HashSet<String>,
    next_range_id: u64,
    lsn: HashMap<String, u64>,
    /// Keyed by (partition key header, id).
    docs: BTreeMap<(String, String), StoredDoc>,
    seq: u64,
}

impl Container {
    fn new(props: Value, def: PartitionKeyDefinition, split_points: &[String]) -> Self {
        let unique_keys = props
            .pointer("/uniqueKeyPolicy/uniqueKeys")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.get("paths").and_then(Value::as_array))
                    .map(|paths| {
                        paths
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut bounds = vec![MIN_EPK.to_string()];
        bounds.extend(split_points.iter().cloned());
        bounds.push(MAX_EPK.to_string());
        let ranges: Vec<PartitionKeyRange> = bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| PartitionKeyRange::new(i.to_string(), w[0].clone(), w[1].clone()))
            .collect();
        let lsn = ranges.iter().map(|r| (r.id.clone(), 1)).collect();
        Self {
            props,
            def,
            unique_keys,
            next_range_id: ranges.len() as u64,
            ranges,
            gone: HashSet::new(),
            lsn,
            docs: BTreeMap::new(),
            seq: 0,
        }
    }

    fn rid(&self) -> String {
        self.props
            .get("_rid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// Version 2 definitions hash the way clients route; anything else gets a
    /// stable stand-in so documents still spread across ranges.
    fn epk_of(&self, pk: &PartitionKey) -> String {
        effective_partition_key(&self.def, pk).unwrap_or_else(|_| {
            let (h1, _) = murmur3_x64_128(pk.to_header().as_bytes(), 0);
            format!("{:016X}", h1 & 0x3FFF_FFFF_FFFF_FFFF)
        })
    }

    fn range_of(&self, epk: &str) -> String {
        self.ranges
            .iter()
            .find(|r| r.contains(epk))
            .map(|r| r.id.clone())
            .unwrap_or_default()
    }

    fn session_token(&self, range: &str) -> String {
        format!("{}:0#{}", range, self.lsn.get(range).copied().unwrap_or(1))
    }

    fn all_session_tokens(&self) -> String {
        self.ranges
            .iter()
            .map(|r| self.session_token(&r.id))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn bump(&mut self, range: &str) {
        *self.lsn.entry(range.to_string()).or_insert(1) += 1;
    }

    /// Partition key of a write: the header must name the document's key.
    fn write_key(&self, request: &HttpRequest, body: &Value) -> Served<PartitionKey> {
        let supplied = header_pk(request)?
            .ok_or_else(|| bad_request("A partition key header is required for this operation"))?;
        let extracted =
            PartitionKey::from_document(&self.def, body).map_err(|e| bad_request(e.message))?;
        if supplied != extracted {
            return Err(bad_request(
                "PartitionKey extracted from document doesn't match the one specified in the header",
            ));
        }
        Ok(supplied)
    }

    fn point_key(&self, request: &HttpRequest, id: &str) -> Served<(String, String)> {
        let pk = header_pk(request)?
            .ok_or_else(|| bad_request("A partition key header is required for this operation"))?;
        if pk.len() != self.def.paths.len() {
            return Err(bad_request("Partition key does not match the container definition"));
        }
        Ok((pk.to_header(), id.to_string()))
    }

    fn check_unique(&self, pk: &PartitionKey, id: &str, body: &Value) -> Served<()> {
        let header = pk.to_header();
        for paths in &self.unique_keys {
            let key = |doc: &Value| -> Vec<String> {
                paths
                    .iter()
                    .map(|p| canonical_key(lookup(doc, p)))
                    .collect()
            };
            let wanted = key(body);
            let clash = self
                .docs
                .iter()
                .any(|((h, other), d)| *h == header && other != id && key(&d.body) == wanted);
            if clash {
                return Err(Reply::error(409, "Unique index constraint violation."));
            }
        }
        Ok(())
    }

    fn store(&mut self, key: (String, String), body: Value, pk: PartitionKey) -> String {
        self.seq += 1;
        let epk = self.epk_of(&pk);
        let range = self.range_of(&epk);
        self.bump(&range);
        self.docs.insert(
            key,
            StoredDoc {
                body,
                pk,
                epk,
                seq: self.seq,
            },
        );
        range
    }

    /// Documents a feed or query request may see, and the session token to return.
    fn scoped(&self, request: &HttpRequest) -> Served<(Vec<Candidate<'_>>, String)> {
        if let Some(id) = request.header(headers::PARTITION_KEY_RANGE_ID) {
            let Some(range) = self.ranges.iter().find(|r| r.id == id) else {
                if self.gone.contains(id) {
                    return Err(Reply::error(410, format!("Partition key range '{}' is gone", id))
                        .with_header(
                            headers::SUB_STATUS,
                            SUBSTATUS_PARTITION_KEY_RANGE_GONE.to_string(),
                        ));
                }
                return Err(bad_request(format!("Partition key range '{}' does not exist", id)));
            };
            let docs = self
                .docs
                .values()
                .filter(|d| range.contains(&d.epk))
                .map(candidate)
                .collect();
            return Ok((docs, self.session_token(&range.id)));
        }
        if let Some(pk) = header_pk(request)? {
            let docs = self
                .docs
                .values()
                .filter(|d| {
                    pk.len() <= d.pk.len()
                        && pk
                            .components()
                            .iter()
                            .zip(d.pk.components())
                            .all(|(a, b)| a == b)
                })
                .map(candidate)
                .collect();
            let range = self.range_of(&self.epk_of(&pk));
            return Ok((docs, self.session_token(&range)));
        }
        if self.ranges.len() > 1
            && flag(request, headers::IS_QUERY)
            && !flag(request, headers::ENABLE_CROSS_PARTITION)
        {
            return Err(bad_request(
                "Cross partition query is required but disabled. Please set x-ms-documentdb-query-enablecrosspartition to true.",
            ));
        }
        let docs = self.docs.values().map(candidate).collect();
        Ok((docs, self.all_session_tokens()))
    }

    fn split(&mut self, id: &str, at: &str) -> Result<(String, String)> {
        let pos = self
            .ranges
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| {
                CosmosError::new(
                    ErrorCode::NotFound,
                    format!("Partition key range '{}' does not exist", id),
                )
            })?;
        let parent = &self.ranges[pos];
        if !(parent.min_inclusive.as_str() < at && at < parent.max_exclusive.as_str()) {
            return Err(CosmosError::new(
                ErrorCode::InvalidArgument,
                format!("Split point '{}' is outside range '{}'", at, id),
            ));
        }
        let parent = self.ranges.remove(pos);
        let mut lineage = parent.parents.clone();
        lineage.push(parent.id.clone());

        let mut child = |min: &str, max: &str| {
            let range = PartitionKeyRange {
                id: self.next_range_id.to_string(),
                min_inclusive: min.to_string(),
                max_exclusive: max.to_string(),
                parents: lineage.clone(),
            };
            self.next_range_id += 1;
            range
        };
        let left = child(&parent.min_inclusive, at);
        let right = child(at, &parent.max_exclusive);

        let lsn = self.lsn.get(&parent.id).copied().unwrap_or(1);
        self.lsn.insert(left.id.clone(), lsn);
        self.lsn.insert(right.id.clone(), lsn);
        let ids = (left.id.clone(), right.id.clone());
        self.ranges.insert(pos, right);
        self.ranges.insert(pos, left);
        self.gone.insert(parent.id);
        Ok(ids)
    }
}

#[derive(Debug)]
struct Database {
    props: Value,
    containers: BTreeMap<String, Container>,
}

impl Database {
    fn rid(&self) -> String {
        self.props
            .get("_rid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Debug)]
struct State {
    split_points: Vec<String>,
    databases: BTreeMap<String, Database>,
    /// Keyed by offer rid.
    offers: BTreeMap<String, Value>,
    counter: u64,
}

impl State {
    fn next(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn rid(&mut self) -> String {
        format!("r{:08x}", self.next())
    }

    fn etag(&mut self) -> String {
        format!("\"{:08x}-0000-0000-0000-000000000000\"", self.next())
    }

    fn database(&self, db: &str) -> Served<&Database> {
        self.databases
            .get(db)
            .ok_or_else(|| not_found("Database", db))
    }

    fn database_mut(&mut self, db: &str) -> Served<&mut Database> {
        self.databases
            .get_mut(db)
            .ok_or_else(|| not_found("Database", db))
    }

    fn container(&self, db: &str, coll: &str) -> Served<&Container> {
        self.database(db)?
            .containers
            .get(coll)
            .ok_or_else(|| not_found("Collection", coll))
    }

    fn container_mut(&mut self, db: &str, coll: &str) -> Served<&mut Container> {
        self.database_mut(db)?
            .containers
            .get_mut(coll)
            .ok_or_else(|| not_found("Collection", coll))
    }

    fn has_offer(&self, resource_rid: &str) -> bool {
        self.offers
            .values()
            .any(|o| o.get("offerResourceId").and_then(Value::as_str) == Some(resource_rid))
    }

    fn add_offer(&mut self, resource_rid: &str, resource_link: String, content: Value) {
        let rid = self.rid();
        let etag = self.etag();
        let offer = json!({
            "id": rid,
            "_rid": rid,
            "_etag": etag,
            "offerResourceId": resource_rid,
            "resource": resource_link,
            "offerType": "Invalid",
            "offerVersion": "V2",
            "content": content,
        });
        self.offers.insert(rid, offer);
    }

    fn drop_offers(&mut self, resource_rids: &HashSet<String>) {
        self.offers.retain(|_, o| {
            o.get("offerResourceId")
                .and_then(Value::as_str)
                .map_or(true, |r| !resource_rids.contains(r))
        });
    }

    // --- databases ---

    fn create_database(&mut self, request: &HttpRequest) -> Served {
        let body = body_json(request)?;
        let id = string_id(&body, "Database")?;
        if self.databases.contains_key(&id) {
            return Err(Reply::error(409, format!("Database '{}' already exists", id)));
        }
        let offer = offer_content(request)?;
        let rid = self.rid();
        let etag = self.etag();
        let props = json!({
            "id": id,
            "_rid": rid,
            "_etag": etag,
            "_self": format!("dbs/{}/", rid),
            "_ts": timestamp(),
        });
        if let Some(content) = offer {
            self.add_offer(&rid, format!("dbs/{}/", rid), content);
        }
        self.databases.insert(
            id,
            Database {
                props: props.clone(),
                containers: BTreeMap::new(),
            },
        );
        Ok(Reply::json(201, props, WRITE_CHARGE).with_header(headers::ETAG, etag))
    }

    fn delete_database(&mut self, db: &str) -> Served {
        let database = self
            .databases
            .remove(db)
            .ok_or_else(|| not_found("Database", db))?;
        let mut rids: HashSet<String> = database.containers.values().map(Container::rid).collect();
        rids.insert(database.rid());
        self.drop_offers(&rids);
        Ok(Reply::empty(204, WRITE_CHARGE))
    }

    // --- containers ---

    fn create_container(&mut self, db: &str, request: &HttpRequest) -> Served {
        let mut body = body_json(request)?;
        let id = string_id(&body, "Collection")?;
        let def: PartitionKeyDefinition = body
            .get("partitionKey")
            .cloned()
            .ok_or_else(|| bad_request("A partition key definition is required"))
            .and_then(|v| {
                serde_json::from_value(v)
                    .map_err(|e| bad_request(format!("Invalid partition key definition: {}", e)))
            })?;
        def.validate().map_err(|e| bad_request(e.message))?;
        let offer = offer_content(request)?;

        let database = self.database(db)?;
        if database.containers.contains_key(&id) {
            return Err(Reply::error(409, format!("Collection '{}' already exists", id)));
        }
        let db_rid = database.rid();

        let rid = self.rid();
        let etag = self.etag();
        let self_link = format!("dbs/{}/colls/{}/", db_rid, rid);
        if let Some(map) = body.as_object_mut() {
            map.insert("_rid".into(), json!(rid));
            map.insert("_etag".into(), json!(etag));
            map.insert("_self".into(), json!(self_link));
            map.insert("_ts".into(), json!(timestamp()));
        }
        let offer = match offer {
            Some(content) => Some(content),
            None if !self.has_offer(&db_rid) => {
                Some(json!({ "offerThroughput": DEFAULT_CONTAINER_THROUGHPUT }))
            }
            None => None,
        };
        if let Some(content) = offer {
            self.add_offer(&rid, self_link, content);
        }
        let container = Container::new(body.clone(), def, &self.split_points);
        self.database_mut(db)?.containers.insert(id, container);
        Ok(Reply::json(201, body, WRITE_CHARGE).with_header(headers::ETAG, etag))
    }

    fn replace_container(&mut self, db: &str, coll: &str, request: &HttpRequest) -> Served {
        let mut body = body_json(request)?;
        if string_id(&body, "Collection")? != coll {
            return Err(bad_request("Collection id in the body does not match the URL"));
        }
        let etag = self.etag();
        let container = self.container_mut(db, coll)?;
        check_etag(request, container.props.get("_etag"))?;
        let def: PartitionKeyDefinition = body
            .get("partitionKey")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| bad_request(format!("Invalid partition key definition: {}", e)))?
            .unwrap_or_else(|| container.def.clone());
        if def.paths != container.def.paths || def.kind != container.def.kind {
            return Err(bad_request("The partition key of a collection cannot be changed"));
        }
        if let Some(map) = body.as_object_mut() {
            for field in ["_rid", "_self"] {
                if let Some(v) = container.props.get(field) {
                    map.insert(field.into(), v.clone());
                }
            }
            map.insert("_etag".into(), json!(etag));
            map.insert("_ts".into(), json!(timestamp()));
        }
        container.props = body.clone();
        Ok(Reply::json(200, body, WRITE_CHARGE).with_header(headers::ETAG, etag))
    }

    fn delete_container(&mut self, db: &str, coll: &str) -> Served {
        let container = self
            .database_mut(db)?
            .containers
            .remove(coll)
            .ok_or_else(|| not_found("Collection", coll))?;
        self.drop_offers(&HashSet::from([container.rid()]));
        Ok(Reply::empty(204, WRITE_CHARGE))
    }

    // --- documents ---

    fn write_document(&mut self, db: &str, coll: &str, request: &HttpRequest) -> Served {
        let upsert = flag(request, headers::IS_UPSERT);
        let mut body = body_json(request)?;
        let id = string_id(&body, "Document")?;
        let rid = self.rid();
        let etag = self.etag();
        let container = self.container_mut(db, coll)?;
        let pk = container.write_key(request, &body)?;
        let key = (pk.to_header(), id.clone());
        let existing = container.docs.get(&key);
        if existing.is_some() && !upsert {
            return Err(Reply::error(
                409,
                "Entity with the specified id already exists in the system.",
            ));
        }
        let rid = existing
            .and_then(|d| d.body.get("_rid").cloned())
            .unwrap_or_else(|| json!(rid));
        let status = if existing.is_some() { 200 } else { 201 };
        container.check_unique(&pk, &id, &body)?;
        if let Some(map) = body.as_object_mut() {
            map.insert("_rid".into(), rid);
            map.insert("_etag".into(), json!(etag));
            map.insert("_ts".into(), json!(timestamp()));
        }
        let range = container.store(key, body.clone(), pk);
        Ok(Reply::json(status, body, WRITE_CHARGE)
            .with_header(headers::ETAG, etag)
            .with_header(headers::SESSION_TOKEN, container.session_token(&range)))
    }

    fn read_document(&self, db: &str, coll: &str, id: &str, request: &HttpRequest) -> Served {
        let container = self.container(db, coll)?;
        let key = container.point_key(request, id)?;
        let doc = container.docs.get(&key).ok_or_else(|| {
            Reply::error(404, "Entity with the specified id does not exist in the system.")
        })?;
        let etag = doc.body.get("_etag").and_then(Value::as_str).unwrap_or_default();
        let range = container.range_of(&doc.epk);
        Ok(Reply::json(200, doc.body.clone(), READ_CHARGE)
            .with_header(headers::ETAG, etag)
            .with_header(headers::SESSION_TOKEN, container.session_token(&range)))
    }

    fn replace_document(
        &mut self,
        db: &str,
        coll: &str,
        id: &str,
        request: &HttpRequest,
    ) -> Served {
        let mut body = body_json(request)?;
        if string_id(&body, "Document")? != id {
            return Err(bad_request("Document id in the body does not match the URL"));
        }
        let etag = self.etag();
        let container = self.container_mut(db, coll)?;
        let pk = container.write_key(request, &body)?;
        let key = (pk.to_header(), id.to_string());
        let existing = container.docs.get(&key).ok_or_else(|| {
            Reply::error(404, "Entity with the specified id does not exist in the system.")
        })?;
        check_etag(request, existing.body.get("_etag"))?;
        let rid = existing.body.get("_rid").cloned().unwrap_or(Value::Null);
        container.check_unique(&pk, id, &body)?;
        if let Some(map) = body.as_object_mut() {
            map.insert("_rid".into(), rid);
            map.insert("_etag".into(), json!(etag));
            map.insert("_ts".into(), json!(timestamp()));
        }
        let range = container.store(key, body.clone(), pk);
        Ok(Reply::json(200, body, WRITE_CHARGE)
            .with_header(headers::ETAG, etag)
            .with_header(headers::SESSION_TOKEN, container.session_token(&range)))
    }

    fn delete_document(&mut self, db: &str, coll: &str, id: &str, request: &HttpRequest) -> Served {
        let container = self.container_mut(db, coll)?;
        let key = container.point_key(request, id)?;
        let existing = container.docs.get(&key).ok_or_else(|| {
            Reply::error(404, "Entity with the specified id does not exist in the system.")
        })?;
        check_etag(request, existing.body.get("_etag"))?;
        let range = container.range_of(&existing.epk);
        container.docs.remove(&key);
        container.bump(&range);
        Ok(Reply::empty(204, WRITE_CHARGE)
            .with_header(headers::SESSION_TOKEN, container.session_token(&range)))
    }

    /// Read feeds and queries share one path: a feed is `SELECT * FROM root`.
    fn query_documents(
        &self,
        db: &str,
        coll: &str,
        request: &HttpRequest,
        feed: bool,
    ) -> Served {
        let (query, params) = if feed {
            let query = parse_select("SELECT * FROM root")
                .map_err(|e| Reply::error(500, e.to_string()))?;
            (query, HashMap::new())
        } else {
            let body = body_json(request)?;
            (parse_query(&body)?, parameters(&body)?)
        };
        let container = self.container(db, coll)?;
        let (candidates, session) = container.scoped(request)?;
        let token = match request.header(headers::CONTINUATION) {
            Some(raw) => Some(
                serde_json::from_str::<QueryToken>(raw)
                    .map_err(|_| bad_request("Invalid continuation token"))?,
            ),
            None => None,
        };
        let page = query::run(&query, &params, candidates, page_size(request), token.as_ref())
            .map_err(query_error)?;
        let count = page.rows.len();
        let mut reply = Reply::json(
            200,
            json!({ "_rid": container.rid(), "Documents": page.rows, "_count": count }),
            if feed { READ_CHARGE } else { QUERY_PAGE_CHARGE },
        )
        .with_header(headers::SESSION_TOKEN, session);
        if let Some(next) = page.continuation {
            let text =
                serde_json::to_string(&next).map_err(|e| Reply::error(500, e.to_string()))?;
            reply = reply.with_header(headers::CONTINUATION, text);
        }
        Ok(reply)
    }

    // --- offers ---

    fn query_offers(&self, request: &HttpRequest) -> Served {
        let body = body_json(request)?;
        let query = parse_query(&body)?;
        let params = parameters(&body)?;
        let candidates = self
            .offers
            .values()
            .enumerate()
            .map(|(i, doc)| Candidate {
                doc,
                seq: i as u64,
            })
            .collect();
        let page = query::run(&query, &params, candidates, usize::MAX, None).map_err(query_error)?;
        let count = page.rows.len();
        Ok(Reply::json(
            200,
            json!({ "Offers": page.rows, "_count": count }),
            QUERY_PAGE_CHARGE,
        ))
    }

    fn replace_offer(&mut self, rid: &str, request: &HttpRequest) -> Served {
        let body = body_json(request)?;
        let content = body
            .get("content")
            .cloned()
            .ok_or_else(|| bad_request("Offer content is required"))?;
        let etag = self.etag();
        let offer = self
            .offers
            .get_mut(rid)
            .ok_or_else(|| not_found("Offer", rid))?;
        check_etag(request, offer.get("_etag"))?;
        if let Some(map) = offer.as_object_mut() {
            map.insert("content".into(), content);
            map.insert("_etag".into(), json!(etag));
        }
        Ok(Reply::json(200, offer.clone(), WRITE_CHARGE).with_header(headers::ETAG, etag))
    }

    fn route(&mut self, request: &HttpRequest) -> Served {
        let segs = segments(request);
        let segs: Vec<&str> = segs.iter().map(String::as_str).collect();
        let is_query = flag(request, headers::IS_QUERY);
        match (request.method.as_str(), segs.as_slice()) {
            ("GET", ["dbs"]) => {
                let items = self.databases.values().map(|d| d.props.clone()).collect();
                list_page(items, request, "Databases", METADATA_CHARGE)
            }
            ("POST", ["dbs"]) => self.create_database(request),
            ("GET", ["dbs", db]) => {
                let props = self.database(db)?.props.clone();
                Ok(Reply::json(200, props, METADATA_CHARGE))
            }
            ("DELETE", ["dbs", db]) => self.delete_database(db),
            ("GET", ["dbs", db, "colls"]) => {
                let items = self
                    .database(db)?
                    .containers
                    .values()
                    .map(|c| c.props.clone())
                    .collect();
                list_page(items, request, "DocumentCollections", METADATA_CHARGE)
            }
            ("POST", ["dbs", db, "colls"]) => self.create_container(db, request),
            ("GET", ["dbs", db, "colls", coll]) => {
                let props = self.container(db, coll)?.props.clone();
                Ok(Reply::json(200, props, METADATA_CHARGE))
            }
            ("PUT", ["dbs", db, "colls", coll]) => self.replace_container(db, coll, request),
            ("DELETE", ["dbs", db, "colls", coll]) => self.delete_container(db, coll),
            ("GET", ["dbs", db, "colls", coll, "pkranges"]) => {
                let items = self
                    .container(db, coll)?
                    .ranges
                    .iter()
                    .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
                    .collect();
                list_page(items, request, "PartitionKeyRanges", METADATA_CHARGE)
            }
            ("GET", ["dbs", db, "colls", coll, "docs"]) => {
                self.query_documents(db, coll, request, true)
            }
            ("POST", ["dbs", db, "colls", coll, "docs"]) if is_query => {
                self.query_documents(db, coll, request, false)
            }
            ("POST", ["dbs", db, "colls", coll, "docs"]) => self.write_document(db, coll, request),
            ("GET", ["dbs", db, "colls", coll, "docs", id]) => {
                self.read_document(db, coll, id, request)
            }
            ("PUT", ["dbs", db, "colls", coll, "docs", id]) => {
                self.replace_document(db, coll, id, request)
            }
            ("DELETE", ["dbs", db, "colls", coll, "docs", id]) => {
                self.delete_document(db, coll, id, request)
            }
            ("GET", ["offers"]) => {
                let items = self.offers.values().cloned().collect();
                list_page(items, request, "Offers", METADATA_CHARGE)
            }
            ("POST", ["offers"]) if is_query => self.query_offers(request),
            ("GET", ["offers", rid]) => {
                let offer = self
                    .offers
                    .get(*rid)
                    .cloned()
                    .ok_or_else(|| not_found("Offer", rid))?;
                Ok(Reply::json(200, offer, METADATA_CHARGE))
            }
            ("PUT", ["offers", rid]) => self.replace_offer(rid, request),
            (method, _) => Err(bad_request(format!(
                "Unsupported operation {} {}",
                method,
                request.url.path()
            ))),
        }
    }
}

/// In-memory account. Share it through an `Arc` between clients and the test body.
#[derive(Debug)]
pub struct Emulator {
    key: SecretString,
    state: Mutex<State>,
    faults: Mutex<Vec<Fault>>,
    log: Mutex<Vec<RecordedRequest>>,
    latency_ms: AtomicU64,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Emulator {
    /// Containers start with four ranges split at `10`, `20` and `30`.
    pub fn new() -> Self {
        Self::with_split_points(DEFAULT_SPLIT_POINTS)
    }

    /// Containers start with one range per gap between the given EPK boundaries.
    pub fn with_split_points<I, S>(points: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: SecretString::from(ACCOUNT_KEY.to_string()),
            state: Mutex::new(State {
                split_points: points.into_iter().map(Into::into).collect(),
                databases: BTreeMap::new(),
                offers: BTreeMap::new(),
                counter: 0,
            }),
            faults: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// A client that talks to this emulator.
    pub fn client(self: &Arc<Self>, settings: DriverSettings) -> Result<CosmosClient> {
        CosmosClient::with_sender(
            ENDPOINT,
            SecretString::from(ACCOUNT_KEY.to_string()),
            settings,
            self.clone(),
        )
    }

    pub fn connection_string() -> String {
        format!("AccountEndpoint={};AccountKey={};", ENDPOINT, ACCOUNT_KEY)
    }

    pub async fn inject(&self, fault: Fault) {
        self.faults.lock().await.push(fault);
    }

    pub async fn clear_faults(&self) {
        self.faults.lock().await.clear();
    }

    /// Delay applied to every request before it is served.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().await.clone()
    }

    pub async fn clear_requests(&self) {
        self.log.lock().await.clear();
    }

    /// Split range `id` of a container at EPK `at`. The old id answers 410/1002
    /// from then on. Returns the ids of the two children.
    pub async fn split_range(
        &self,
        database: &str,
        container: &str,
        id: &str,
        at: &str,
    ) -> Result<(String, String)> {
        let mut state = self.state.lock().await;
        let container = state.container_mut(database, container).map_err(|_| {
            CosmosError::new(
                ErrorCode::NotFound,
                format!("Collection '{}/{}' does not exist", database, container),
            )
        })?;
        container.split(id, at)
    }

    pub async fn range_ids(&self, database: &str, container: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .container(database, container)
            .map(|c| c.ranges.iter().map(|r| r.id.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn document_count(&self, database: &str, container: &str) -> usize {
        let state = self.state.lock().await;
        state
            .container(database, container)
            .map(|c| c.docs.len())
            .unwrap_or_default()
    }

    fn authorize(&self, request: &HttpRequest) -> Served<()> {
        let (Some(date), Some(auth)) = (
            request.header(headers::DATE),
            request.header(headers::AUTHORIZATION),
        ) else {
            return Err(Reply::error(401, "Required authorization headers are missing"));
        };
        if request.header(headers::VERSION).is_none() {
            return Err(bad_request("The x-ms-version header is required"));
        }
        let signer = MasterKeySigner::new(&self.key).map_err(|e| Reply::error(500, e.message))?;
        let (resource_type, link) = signing_target(&segments(request));
        let expected = signer.token(request.method.as_str(), &resource_type, &link, date);
        if decode_authorization(auth) != expected {
            return Err(Reply::error(
                401,
                "The input authorization token can't serve the request.",
            ));
        }
        Ok(())
    }

    async fn take_fault(&self, request: &HttpRequest) -> Option<HttpResponse> {
        let mut faults = self.faults.lock().await;
        let fault = faults.iter_mut().find(|f| f.matches(request))?;
        let response = fault.fire();
        faults.retain(|f| !f.is_spent());
        Some(response)
    }
}

#[async_trait]
impl HttpSender for Emulator {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let mut response = match self.authorize(&request) {
            Err(reply) => reply.into_response(),
            Ok(()) => match self.take_fault(&request).await {
                Some(injected) => injected,
                None => {
                    let mut state = self.state.lock().await;
                    match state.route(&request) {
                        Ok(reply) | Err(reply) => reply.into_response(),
                    }
                }
            },
        };
        response
            .headers
            .entry(headers::ACTIVITY_ID.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string());

        let request_charge = response
            .header(headers::REQUEST_CHARGE)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        debug!(
            method = %request.method,
            path = request.url.path(),
            status = response.status,
            request_charge,
            "Emulated request"
        );
        self.log.lock().await.push(RecordedRequest {
            method: request.method.clone(),
            path: request.url.path().to_string(),
            headers: request.headers.clone(),
            status: response.status,
            request_charge,
        });
        Ok(response)
    }
}


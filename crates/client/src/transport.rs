//! HTTP abstraction and wire-level request/response shapes.

use async_trait::async_trait;
use cosmosql_common::config::TransportSettings;
use cosmosql_error::{CosmosError, ErrorCode, Result};
use reqwest::Method;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;
use url::Url;

pub mod headers {
    pub const AUTHORIZATION: &str = "authorization";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const USER_AGENT: &str = "user-agent";
    pub const IF_MATCH: &str = "if-match";
    pub const IF_NONE_MATCH: &str = "if-none-match";
    pub const ETAG: &str = "etag";
    pub const DATE: &str = "x-ms-date";
    pub const VERSION: &str = "x-ms-version";
    pub const PARTITION_KEY: &str = "x-ms-documentdb-partitionkey";
    pub const PARTITION_KEY_RANGE_ID: &str = "x-ms-documentdb-partitionkeyrangeid";
    pub const IS_UPSERT: &str = "x-ms-documentdb-isupsert";
    pub const IS_QUERY: &str = "x-ms-documentdb-isquery";
    pub const ENABLE_CROSS_PARTITION: &str = "x-ms-documentdb-query-enablecrosspartition";
    pub const PARALLELIZE_CROSS_PARTITION: &str =
        "x-ms-documentdb-query-parallelizecrosspartitionquery";
    pub const MAX_ITEM_COUNT: &str = "x-ms-max-item-count";
    pub const CONTINUATION: &str = "x-ms-continuation";
    pub const SESSION_TOKEN: &str = "x-ms-session-token";
    pub const CONSISTENCY_LEVEL: &str = "x-ms-consistency-level";
    pub const REQUEST_CHARGE: &str = "x-ms-request-charge";
    pub const ACTIVITY_ID: &str = "x-ms-activity-id";
    pub const RETRY_AFTER_MS: &str = "x-ms-retry-after-ms";
    pub const SUB_STATUS: &str = "x-ms-substatus";
    pub const OFFER_THROUGHPUT: &str = "x-ms-offer-throughput";
    pub const OFFER_AUTOPILOT: &str = "x-ms-cosmos-offer-autopilot-settings";
}

/// Header names are stored lower-cased.
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_json(mut self, body: &serde_json::Value) -> Self {
        self.body = body.to_string().into_bytes();
        self.headers
            .insert(headers::CONTENT_TYPE.to_string(), "application/json".to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one HTTP exchange. Implemented over reqwest for real accounts and by
/// in-memory fakes in tests.
#[async_trait]
pub trait HttpSender: Send + Sync + Debug {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[derive(Debug, Clone)]
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new(settings: &TransportSettings) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
            .danger_accept_invalid_certs(settings.insecure_skip_verify);
        if let Some(proxy) = &settings.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str()).map_err(|e| {
                CosmosError::new(ErrorCode::InvalidSettings, format!("Invalid proxy: {}", e))
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| {
            CosmosError::new(
                ErrorCode::InvalidSettings,
                format!("Failed to build HTTP client: {}", e),
            )
        })?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn network_error(err: reqwest::Error) -> CosmosError {
    if err.is_timeout() {
        CosmosError::new(ErrorCode::RequestTimeout, format!("Request timed out: {}", err))
    } else {
        CosmosError::new(ErrorCode::NetworkError, format!("HTTP request failed: {}", err))
    }
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self.client.request(request.method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(network_error)?;
        let status = resp.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }
        let body = resp.bytes().await.map_err(network_error)?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Response attributes every operation reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMeta {
    pub status: u16,
    pub request_charge: f64,
    pub session_token: Option<String>,
    pub continuation: Option<String>,
    pub etag: Option<String>,
    pub activity_id: Option<String>,
    pub retry_after_ms: Option<u64>,
    pub sub_status: Option<u32>,
}

impl ResponseMeta {
    pub fn from_response(resp: &HttpResponse) -> Self {
        let non_empty = |name: &str| {
            resp.header(name)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            status: resp.status,
            request_charge: resp
                .header(headers::REQUEST_CHARGE)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|c| c.is_finite() && *c >= 0.0)
                .unwrap_or(0.0),
            session_token: non_empty(headers::SESSION_TOKEN),
            continuation: non_empty(headers::CONTINUATION),
            etag: non_empty(headers::ETAG),
            activity_id: non_empty(headers::ACTIVITY_ID),
            retry_after_ms: resp
                .header(headers::RETRY_AFTER_MS)
                .and_then(|v| v.trim().parse().ok()),
            sub_status: resp
                .header(headers::SUB_STATUS)
                .and_then(|v| v.trim().parse().ok()),
        }
    }
}

/// Map a non-success response to a typed error. The one place statuses become errors.
pub fn error_from_response(resp: &HttpResponse, meta: &ResponseMeta) -> CosmosError {
    let body: Option<serde_json::Value> = serde_json::from_slice(&resp.body).ok();
    let message = body
        .as_ref()
        .and_then(|b| b.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let text = String::from_utf8_lossy(&resp.body);
            if text.trim().is_empty() {
                format!("Service returned status {}", resp.status)
            } else {
                text.chars().take(512).collect()
            }
        });
    CosmosError::from_status(resp.status, meta.sub_status, message)
        .with_activity_id(meta.activity_id.clone())
        .with_retry_after_ms(meta.retry_after_ms)
}

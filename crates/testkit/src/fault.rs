//! Scripted failures.

use cosmosql_client::transport::headers;
use cosmosql_client::{HttpRequest, HttpResponse};
use reqwest::Method;
use serde_json::json;

/// A canned error response returned instead of serving matching requests.
#[derive(Debug, Clone)]
pub struct Fault {
    status: u16,
    sub_status: Option<u32>,
    retry_after_ms: Option<u64>,
    charge: f64,
    method: Option<Method>,
    path_contains: Option<String>,
    header: Option<(String, String)>,
    remaining: Option<usize>,
}

impl Fault {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            sub_status: None,
            retry_after_ms: None,
            charge: 0.0,
            method: None,
            path_contains: None,
            header: None,
            remaining: Some(1),
        }
    }

    /// 429 with a retry-after hint.
    pub fn throttle(retry_after_ms: u64) -> Self {
        Self {
            retry_after_ms: Some(retry_after_ms),
            ..Self::status(429)
        }
    }

    /// 410 with a sub-status, e.g. 1000 (name cache stale) or 1002 (range gone).
    pub fn gone(sub_status: u32) -> Self {
        Self {
            sub_status: Some(sub_status),
            ..Self::status(410)
        }
    }

    pub fn on(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path_contains(mut self, fragment: impl Into<String>) -> Self {
        self.path_contains = Some(fragment.into());
        self
    }

    /// Only requests carrying `name: value`.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.header = Some((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    pub fn always(mut self) -> Self {
        self.remaining = None;
        self
    }

    /// RU reported on the error response.
    pub fn charge(mut self, ru: f64) -> Self {
        self.charge = ru;
        self
    }

    pub(crate) fn matches(&self, request: &HttpRequest) -> bool {
        if self.remaining == Some(0) {
            return false;
        }
        if self.method.as_ref().is_some_and(|m| *m != request.method) {
            return false;
        }
        if let Some(fragment) = &self.path_contains {
            if !request.url.path().contains(fragment.as_str()) {
                return false;
            }
        }
        if let Some((name, value)) = &self.header {
            if request.header(name) != Some(value.as_str()) {
                return false;
            }
        }
        true
    }

    /// Consume one use and build the response.
    pub(crate) fn fire(&mut self) -> HttpResponse {
        if let Some(n) = self.remaining.as_mut() {
            *n = n.saturating_sub(1);
        }
        let mut resp = HttpResponse::new(self.status)
            .with_json(&json!({
                "code": format!("Injected{}", self.status),
                "message": format!("Injected fault with status {}", self.status),
            }))
            .with_header(headers::REQUEST_CHARGE, format!("{}", self.charge));
        if let Some(sub) = self.sub_status {
            resp = resp.with_header(headers::SUB_STATUS, sub.to_string());
        }
        if let Some(ms) = self.retry_after_ms {
            resp = resp.with_header(headers::RETRY_AFTER_MS, ms.to_string());
        }
        resp
    }

    pub(crate) fn is_spent(&self) -> bool {
        self.remaining == Some(0)
    }
}

//! Resource links and per-operation request descriptions.

use crate::transport::{headers, Headers};
use cosmosql_common::models::{ConsistencyLevel, PartitionKey, Throughput};
use reqwest::Method;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Database,
    Container,
    Document,
    PartitionKeyRange,
    Offer,
}

impl ResourceType {
    /// Path segment and signing name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "dbs",
            Self::Container => "colls",
            Self::Document => "docs",
            Self::PartitionKeyRange => "pkranges",
            Self::Offer => "offers",
        }
    }
}

pub fn database_link(database: &str) -> String {
    format!("dbs/{}", database)
}

pub fn container_link(database: &str, container: &str) -> String {
    format!("dbs/{}/colls/{}", database, container)
}

pub fn document_link(database: &str, container: &str, id: &str) -> String {
    format!("dbs/{}/colls/{}/docs/{}", database, container, id)
}

/// Operation-specific headers.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub partition_key: Option<PartitionKey>,
    pub upsert: bool,
    pub max_item_count: Option<u32>,
    pub continuation: Option<String>,
    /// Overrides the connection's session token for the container.
    pub session_token: Option<String>,
    pub consistency: Option<ConsistencyLevel>,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub query: bool,
    pub cross_partition: bool,
    pub pk_range_id: Option<String>,
    pub offer_throughput: Option<Throughput>,
}

impl RequestOptions {
    pub fn apply(&self, out: &mut Headers) {
        let mut set = |name: &str, value: String| {
            out.insert(name.to_string(), value);
        };
        if let Some(pk) = &self.partition_key {
            set(headers::PARTITION_KEY, pk.to_header());
        }
        if self.upsert {
            set(headers::IS_UPSERT, "true".into());
        }
        if let Some(n) = self.max_item_count {
            set(headers::MAX_ITEM_COUNT, n.to_string());
        }
        if let Some(c) = &self.continuation {
            set(headers::CONTINUATION, c.clone());
        }
        if let Some(t) = &self.session_token {
            set(headers::SESSION_TOKEN, t.clone());
        }
        if let Some(level) = self.consistency {
            set(headers::CONSISTENCY_LEVEL, level.as_str().into());
        }
        if let Some(etag) = &self.if_match {
            set(headers::IF_MATCH, etag.clone());
        }
        if let Some(etag) = &self.if_none_match {
            set(headers::IF_NONE_MATCH, etag.clone());
        }
        if self.query {
            set(headers::IS_QUERY, "true".into());
            set(headers::CONTENT_TYPE, "application/query+json".into());
        }
        if self.cross_partition {
            set(headers::ENABLE_CROSS_PARTITION, "true".into());
            set(headers::PARALLELIZE_CROSS_PARTITION, "true".into());
        }
        if let Some(id) = &self.pk_range_id {
            set(headers::PARTITION_KEY_RANGE_ID, id.clone());
        }
        match self.offer_throughput {
            Some(Throughput::Manual(ru)) => set(headers::OFFER_THROUGHPUT, ru.to_string()),
            Some(Throughput::Autoscale(max)) => set(
                headers::OFFER_AUTOPILOT,
                json!({ "maxThroughput": max }).to_string(),
            ),
            None => {}
        }
    }
}

/// One logical request: everything the pipeline needs to sign, send and retry it.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub resource_type: ResourceType,
    /// Link used in the signature.
    pub resource_link: String,
    /// Path appended to the endpoint.
    pub path: String,
    pub options: RequestOptions,
    pub body: Option<Vec<u8>>,
    /// Safe to resend after a timeout, 5xx or network failure.
    pub idempotent: bool,
    /// Container link for session tokens and range invalidation.
    pub container: Option<String>,
    /// Routing map generation the request was addressed with.
    pub generation: Option<u64>,
}

impl RequestSpec {
    /// Request against the feed of `resource_type` under `parent` (empty for the account).
    pub fn feed(method: Method, resource_type: ResourceType, parent: &str) -> Self {
        let path = if parent.is_empty() {
            resource_type.as_str().to_string()
        } else {
            format!("{}/{}", parent, resource_type.as_str())
        };
        let idempotent = method != Method::POST;
        Self {
            method,
            resource_type,
            resource_link: parent.to_string(),
            path,
            options: RequestOptions::default(),
            body: None,
            idempotent,
            container: None,
            generation: None,
        }
    }

    /// Request against a single resource.
    pub fn item(method: Method, resource_type: ResourceType, link: &str) -> Self {
        // Offers sign with the lower-cased resource id rather than the path.
        let resource_link = match resource_type {
            ResourceType::Offer => link
                .rsplit('/')
                .next()
                .unwrap_or(link)
                .to_ascii_lowercase(),
            _ => link.to_string(),
        };
        let idempotent = method != Method::POST;
        Self {
            method,
            resource_type,
            resource_link,
            path: link.to_string(),
            options: RequestOptions::default(),
            body: None,
            idempotent,
            container: None,
            generation: None,
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Reads carry the container's session token.
    pub fn is_read(&self) -> bool {
        self.method == Method::GET || self.options.query
    }

    /// `"<VERB> <resource-link>[ @pkrange <id>]"`.
    pub fn fingerprint(&self) -> String {
        match &self.options.pk_range_id {
            Some(id) => format!("{} {} @pkrange {}", self.method, self.path, id),
            None => format!("{} {}", self.method, self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_and_item_links() {
        let spec = RequestSpec::feed(Method::POST, ResourceType::Document, "dbs/db/colls/c");
        assert_eq!(spec.path, "dbs/db/colls/c/docs");
        assert_eq!(spec.resource_link, "dbs/db/colls/c");
        assert!(!spec.idempotent);

        let spec = RequestSpec::feed(Method::GET, ResourceType::Database, "");
        assert_eq!(spec.path, "dbs");
        assert_eq!(spec.resource_link, "");
        assert!(spec.idempotent);

        let spec = RequestSpec::item(Method::GET, ResourceType::Document, "dbs/db/colls/c/docs/1");
        assert_eq!(spec.path, spec.resource_link);

        let spec = RequestSpec::item(Method::PUT, ResourceType::Offer, "offers/AbCd");
        assert_eq!(spec.path, "offers/AbCd");
        assert_eq!(spec.resource_link, "abcd");
    }

    #[test]
    fn test_option_headers() {
        let options = RequestOptions {
            partition_key: Some(PartitionKey::from(vec!["app0", "user0"])),
            upsert: true,
            max_item_count: Some(10),
            query: true,
            cross_partition: true,
            pk_range_id: Some("3".into()),
            offer_throughput: Some(Throughput::Autoscale(4000)),
            ..Default::default()
        };
        let mut out = Headers::new();
        options.apply(&mut out);
        assert_eq!(out[headers::PARTITION_KEY], r#"["app0","user0"]"#);
        assert_eq!(out[headers::IS_UPSERT], "true");
        assert_eq!(out[headers::MAX_ITEM_COUNT], "10");
        assert_eq!(out[headers::CONTENT_TYPE], "application/query+json");
        assert_eq!(out[headers::ENABLE_CROSS_PARTITION], "true");
        assert_eq!(out[headers::PARALLELIZE_CROSS_PARTITION], "true");
        assert_eq!(out[headers::PARTITION_KEY_RANGE_ID], "3");
        assert_eq!(out[headers::OFFER_AUTOPILOT], r#"{"maxThroughput":4000}"#);
        assert!(!out.contains_key(headers::IF_MATCH));
    }

    #[test]
    fn test_fingerprint() {
        let mut spec = RequestSpec::feed(Method::POST, ResourceType::Document, "dbs/db/colls/c");
        assert_eq!(spec.fingerprint(), "POST dbs/db/colls/c/docs");
        spec.options.pk_range_id = Some("2".into());
        assert_eq!(spec.fingerprint(), "POST dbs/db/colls/c/docs @pkrange 2");
    }
}

//! The request pipeline: sign, send, meter, retry.

use crate::auth::{rfc1123_date, MasterKeySigner};
use crate::pkranges::{PartitionKeyRange, PartitionKeyRangeCache, RangeFetcher};
use crate::request::{RequestOptions, RequestSpec, ResourceType};
use crate::resources::ContainerProperties;
use crate::session::SessionContainer;
use crate::transport::{error_from_response, headers, Headers, HttpRequest, HttpSender, ResponseMeta};
use async_trait::async_trait;
use chrono::Utc;
use cosmosql_common::config::DriverSettings;
use cosmosql_common::retry::{RetryDecision, RetryPolicy, RetryState};
use cosmosql_common::{CallContext, ChargeMeter};
use cosmosql_error::{CosmosError, ErrorCode, ErrorContext, Result};
use moka::future::Cache;
use reqwest::Method;
use secrecy::SecretString;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use url::Url;

/// A successful response, with the charge of every attempt it took.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub meta: ResponseMeta,
    pub body: Vec<u8>,
    pub request_charge: f64,
}

impl RawResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            CosmosError::new(
                ErrorCode::SerializationFailed,
                format!("Failed to decode response body: {}", e),
            )
            .with_request_charge(self.request_charge)
        })
    }
}

pub(crate) struct Pipeline {
    sender: Arc<dyn HttpSender>,
    signer: MasterKeySigner,
    endpoint: Url,
    settings: DriverSettings,
    policy: RetryPolicy,
    pub(crate) sessions: SessionContainer,
    pub(crate) pkranges: PartitionKeyRangeCache,
    pub(crate) containers: Cache<String, Arc<ContainerProperties>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("endpoint", &self.endpoint.as_str())
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

/// Parse and normalize an account endpoint so resource paths join beneath it.
pub fn parse_endpoint(endpoint: &str) -> Result<Url> {
    if endpoint.trim().is_empty() {
        return Err(CosmosError::new(
            ErrorCode::AuthConfigError,
            "Account endpoint is missing",
        ));
    }
    let mut url = Url::parse(endpoint.trim()).map_err(|e| {
        CosmosError::new(
            ErrorCode::AuthConfigError,
            format!("Account endpoint '{}' is not a valid URL: {}", endpoint, e),
        )
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CosmosError::new(
            ErrorCode::AuthConfigError,
            format!("Account endpoint scheme '{}' is not http(s)", url.scheme()),
        ));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    Ok(url)
}

impl Pipeline {
    pub(crate) fn new(
        endpoint: &str,
        key: &SecretString,
        settings: DriverSettings,
        sender: Arc<dyn HttpSender>,
    ) -> Result<Self> {
        let endpoint = parse_endpoint(endpoint)?;
        let signer = MasterKeySigner::new(key)?;
        let policy = RetryPolicy::new(settings.retry);
        let containers = Cache::builder()
            .max_capacity(settings.transport.metadata_cache_capacity)
            .build();
        Ok(Self {
            sender,
            signer,
            endpoint,
            policy,
            settings,
            sessions: SessionContainer::new(),
            pkranges: PartitionKeyRangeCache::new(),
            containers,
        })
    }

    pub(crate) fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub(crate) fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn build_request(&self, spec: &RequestSpec, session: Option<String>) -> Result<HttpRequest> {
        let url = self.endpoint.join(&spec.path)?;
        let date = rfc1123_date(Utc::now());
        let transport = &self.settings.transport;

        let mut out = Headers::new();
        out.insert(headers::DATE.into(), date.clone());
        out.insert(headers::VERSION.into(), transport.api_version.clone());
        out.insert(headers::USER_AGENT.into(), transport.user_agent.clone());
        out.insert(
            headers::AUTHORIZATION.into(),
            self.signer.authorization(
                spec.method.as_str(),
                spec.resource_type.as_str(),
                &spec.resource_link,
                &date,
            ),
        );
        spec.options.apply(&mut out);
        if let Some(token) = session {
            out.entry(headers::SESSION_TOKEN.into()).or_insert(token);
        }
        if spec.body.is_some() {
            out.entry(headers::CONTENT_TYPE.into())
                .or_insert_with(|| "application/json".into());
        }

        Ok(HttpRequest {
            method: spec.method.clone(),
            url,
            headers: out,
            body: spec.body.clone(),
        })
    }

    async fn session_for(&self, spec: &RequestSpec) -> Option<String> {
        if spec.options.session_token.is_some() || !spec.is_read() {
            return None;
        }
        match &spec.container {
            Some(container) => self.sessions.get(container).await,
            None => None,
        }
    }

    async fn invalidate_topology(&self, spec: &RequestSpec, err: &CosmosError) {
        let Some(container) = &spec.container else {
            return;
        };
        if err.code == ErrorCode::NameCacheStale {
            self.containers.invalidate(container).await;
        }
        match spec.generation {
            Some(generation) => {
                self.pkranges.invalidate(container, generation).await;
            }
            None => self.pkranges.remove(container).await,
        }
    }

    /// Send `spec` until it succeeds, the retry budget runs out or `ctx` finishes.
    ///
    /// Errors carry the charge of every attempt. A range-addressed request that
    /// hits a split returns the error after invalidating, so the caller can
    /// re-route.
    #[instrument(name = "pipeline.execute", skip_all, fields(op = %spec.fingerprint()))]
    pub(crate) async fn execute(&self, ctx: &CallContext, spec: &RequestSpec) -> Result<RawResponse> {
        let mut state = RetryState::default();
        let mut charge = 0.0;
        loop {
            if let Err(err) = ctx.check() {
                return Err(err
                    .with_fingerprint(spec.fingerprint())
                    .with_request_charge(charge));
            }
            let session = self.session_for(spec).await;
            let request = self.build_request(spec, session)?;
            debug!(attempt = state.attempts(), "Sending request");

            let err = match ctx.run(self.sender.send(request)).await {
                Ok(resp) => {
                    let meta = ResponseMeta::from_response(&resp);
                    charge += meta.request_charge;
                    if let (Some(container), Some(token)) = (&spec.container, &meta.session_token)
                    {
                        self.sessions.observe(container, token).await;
                    }
                    if resp.is_success() {
                        debug!(status = resp.status, charge = meta.request_charge, "Request succeeded");
                        return Ok(RawResponse {
                            meta,
                            body: resp.body,
                            request_charge: charge,
                        });
                    }
                    error_from_response(&resp, &meta)
                }
                Err(err) => err,
            };
            let err = err
                .with_fingerprint(spec.fingerprint())
                .with_context(ErrorContext::Http {
                    method: spec.method.to_string(),
                    resource_link: spec.path.clone(),
                    pkrange_id: spec.options.pk_range_id.clone(),
                });
            if err.code == ErrorCode::Canceled {
                return Err(err.with_request_charge(charge));
            }

            match self.policy.evaluate(&err, &mut state, spec.idempotent) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        code = %err.code,
                        attempt = state.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Retrying request"
                    );
                    if let Err(canceled) = ctx.sleep(delay).await {
                        return Err(canceled
                            .with_fingerprint(spec.fingerprint())
                            .with_request_charge(charge));
                    }
                }
                RetryDecision::InvalidateAndRetry => {
                    warn!(code = %err.code, "Partition topology changed");
                    self.invalidate_topology(spec, &err).await;
                    if spec.options.pk_range_id.is_some() {
                        return Err(err.with_request_charge(charge));
                    }
                }
                RetryDecision::Fail => {
                    let err = if state.attempts() > 1 {
                        err.with_context(ErrorContext::Retry {
                            attempts: state.attempts(),
                            waited_ms: state.waited.as_millis() as u64,
                        })
                    } else {
                        err
                    };
                    return Err(err.with_request_charge(charge));
                }
            }
        }
    }

    /// Drain a feed, following continuations. Returns items and the total charge.
    pub(crate) async fn read_feed<T: serde::de::DeserializeOwned>(
        &self,
        ctx: &CallContext,
        spec: RequestSpec,
        key: &str,
    ) -> Result<(Vec<T>, f64)> {
        let mut items = Vec::new();
        let mut charge = 0.0;
        let mut spec = spec;
        loop {
            let resp = self.execute(ctx, &spec).await.map_err(|mut e| {
                e.add_request_charge(charge);
                e
            })?;
            charge += resp.request_charge;
            let page: serde_json::Value = resp.json().map_err(|e| e.with_request_charge(charge))?;
            if let Some(list) = page.get(key) {
                let decoded: Vec<T> = serde_json::from_value(list.clone())
                    .map_err(|e| CosmosError::from(e).with_request_charge(charge))?;
                items.extend(decoded);
            }
            match resp.meta.continuation {
                Some(token) => spec.options.continuation = Some(token),
                None => return Ok((items, charge)),
            }
        }
    }
}

#[derive(Deserialize)]
struct RangesPage {
    #[serde(rename = "PartitionKeyRanges", default)]
    ranges: Vec<PartitionKeyRange>,
}

impl Pipeline {
    async fn fetch_ranges_charged(
        &self,
        ctx: &CallContext,
        container: &str,
        meter: &ChargeMeter,
    ) -> Result<Vec<PartitionKeyRange>> {
        let mut spec = RequestSpec::feed(Method::GET, ResourceType::PartitionKeyRange, container)
            .with_container(container);
        let mut ranges = Vec::new();
        loop {
            let resp = self.execute(ctx, &spec).await.inspect_err(|e| {
                meter.add(e.request_charge);
            })?;
            meter.add(resp.request_charge);
            let page: RangesPage = resp.json()?;
            ranges.extend(page.ranges);
            match resp.meta.continuation {
                Some(token) => {
                    spec.options = RequestOptions {
                        continuation: Some(token),
                        ..Default::default()
                    }
                }
                None => break,
            }
        }
        // A split can briefly list a parent next to its children; keep the leaves.
        let parents: std::collections::HashSet<String> =
            ranges.iter().flat_map(|r| r.parents.iter().cloned()).collect();
        ranges.retain(|r| !parents.contains(&r.id));
        Ok(ranges)
    }
}

#[async_trait]
impl RangeFetcher for Pipeline {
    async fn fetch_ranges(
        &self,
        ctx: &CallContext,
        container: &str,
    ) -> Result<Vec<PartitionKeyRange>> {
        self.fetch_ranges_charged(ctx, container, &ChargeMeter::new())
            .await
    }
}

/// Range fetches made on behalf of one logical operation, charged to its meter.
pub(crate) struct MeteredFetcher<'a> {
    pub pipeline: &'a Pipeline,
    pub meter: &'a ChargeMeter,
}

#[async_trait]
impl RangeFetcher for MeteredFetcher<'_> {
    async fn fetch_ranges(
        &self,
        ctx: &CallContext,
        container: &str,
    ) -> Result<Vec<PartitionKeyRange>> {
        self.pipeline
            .fetch_ranges_charged(ctx, container, self.meter)
            .await
    }
}

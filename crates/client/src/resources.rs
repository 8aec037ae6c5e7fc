//! Typed database, container, document and offer operations.

use crate::pipeline::{Pipeline, RawResponse};
use crate::pkranges::PartitionKeyRange;
use crate::request::{
    container_link, database_link, document_link, RequestOptions, RequestSpec, ResourceType,
};
use crate::transport::{HttpSender, ReqwestSender};
use cosmosql_common::config::DriverSettings;
use cosmosql_common::models::{
    ConsistencyLevel, PartitionKey, PartitionKeyDefinition, Throughput,
};
use cosmosql_common::{CallContext, ChargeMeter};
use cosmosql_error::{CosmosError, ErrorCode, Result};
use cosmosql_sql::sanitize::validate_resource_id;
use cosmosql_sql::QueryParameter;
use futures::Stream;
use reqwest::Method;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;
use validator::Validate;

/// Outcome of one logical operation.
#[derive(Debug, Clone)]
pub struct ResourceResponse<T> {
    pub resource: T,
    /// RU of every request the operation issued, retries included.
    pub request_charge: f64,
    pub session_token: Option<String>,
    pub continuation: Option<String>,
    pub etag: Option<String>,
    pub status: u16,
    pub activity_id: Option<String>,
}

impl<T> ResourceResponse<T> {
    fn from_raw(raw: &RawResponse, resource: T) -> Self {
        Self {
            resource,
            request_charge: raw.request_charge,
            session_token: raw.meta.session_token.clone(),
            continuation: raw.meta.continuation.clone(),
            etag: raw.meta.etag.clone(),
            status: raw.meta.status,
            activity_id: raw.meta.activity_id.clone(),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ResourceResponse<U> {
        ResourceResponse {
            resource: f(self.resource),
            request_charge: self.request_charge,
            session_token: self.session_token,
            continuation: self.continuation,
            etag: self.etag,
            status: self.status,
            activity_id: self.activity_id,
        }
    }

    fn charged(mut self, extra: f64) -> Self {
        self.request_charge += extra;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseProperties {
    pub id: String,
    #[serde(rename = "_rid", default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueKey {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UniqueKeyPolicy {
    #[serde(rename = "uniqueKeys", default)]
    pub unique_keys: Vec<UniqueKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerProperties {
    pub id: String,
    #[serde(rename = "partitionKey")]
    pub partition_key: PartitionKeyDefinition,
    #[serde(rename = "uniqueKeyPolicy", default, skip_serializing_if = "Option::is_none")]
    pub unique_key_policy: Option<UniqueKeyPolicy>,
    #[serde(rename = "_rid", default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContainerProperties {
    pub fn new(id: impl Into<String>, partition_key: PartitionKeyDefinition) -> Self {
        Self {
            id: id.into(),
            partition_key,
            unique_key_policy: None,
            rid: None,
            etag: None,
            extra: Map::new(),
        }
    }

    /// Each inner list is one unique key over several paths.
    pub fn with_unique_keys(mut self, keys: Vec<Vec<String>>) -> Self {
        if !keys.is_empty() {
            self.unique_key_policy = Some(UniqueKeyPolicy {
                unique_keys: keys.into_iter().map(|paths| UniqueKey { paths }).collect(),
            });
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutopilotSettings {
    #[serde(rename = "maxThroughput")]
    pub max_throughput: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OfferContent {
    #[serde(rename = "offerThroughput", default, skip_serializing_if = "Option::is_none")]
    pub offer_throughput: Option<u32>,
    #[serde(
        rename = "offerAutopilotSettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub autopilot: Option<AutopilotSettings>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Throughput provisioning of a database or container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    #[serde(rename = "_rid", default)]
    pub rid: String,
    #[serde(rename = "offerResourceId")]
    pub offer_resource_id: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub content: OfferContent,
    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Offer {
    pub fn throughput(&self) -> Option<Throughput> {
        match (&self.content.autopilot, self.content.offer_throughput) {
            (Some(auto), _) => Some(Throughput::Autoscale(auto.max_throughput)),
            (None, Some(ru)) => Some(Throughput::Manual(ru)),
            (None, None) => None,
        }
    }

    fn set_throughput(&mut self, throughput: Throughput) {
        match throughput {
            Throughput::Manual(ru) => {
                self.content.offer_throughput = Some(ru);
                self.content.autopilot = None;
            }
            Throughput::Autoscale(max) => {
                self.content.offer_throughput = None;
                self.content.autopilot = Some(AutopilotSettings {
                    max_throughput: max,
                    extra: Map::new(),
                });
            }
        }
    }
}

/// Options of point document operations.
#[derive(Debug, Clone, Default)]
pub struct DocumentOptions {
    /// Required for reads and deletes; derived from the document for writes when absent.
    pub partition_key: Option<PartitionKey>,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub session_token: Option<String>,
    pub consistency: Option<ConsistencyLevel>,
}

/// Account handle. Cheap to clone; clones share caches and session tokens.
#[derive(Debug, Clone)]
pub struct CosmosClient {
    inner: Arc<Pipeline>,
}

fn check_id(id: &str) -> Result<()> {
    validate_resource_id(id).map_err(CosmosError::from)
}

impl CosmosClient {
    /// Client over the reqwest transport.
    pub fn new(endpoint: &str, key: SecretString, settings: DriverSettings) -> Result<Self> {
        let sender = ReqwestSender::new(&settings.transport)?;
        Self::with_sender(endpoint, key, settings, Arc::new(sender))
    }

    pub fn with_sender(
        endpoint: &str,
        key: SecretString,
        settings: DriverSettings,
        sender: Arc<dyn HttpSender>,
    ) -> Result<Self> {
        settings.validate().map_err(|e| {
            CosmosError::new(
                ErrorCode::InvalidSettings,
                format!("Driver settings validation failed: {}", e),
            )
        })?;
        let pipeline = Pipeline::new(endpoint, &key, settings, sender)?;
        debug!(endpoint = %pipeline.endpoint(), "Created client");
        Ok(Self {
            inner: Arc::new(pipeline),
        })
    }

    pub fn settings(&self) -> &DriverSettings {
        self.inner.settings()
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.inner
    }

    async fn send<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        spec: &RequestSpec,
    ) -> Result<ResourceResponse<T>> {
        let raw = self.inner.execute(ctx, spec).await?;
        let resource = raw.json()?;
        Ok(ResourceResponse::from_raw(&raw, resource))
    }

    async fn send_empty(
        &self,
        ctx: &CallContext,
        spec: &RequestSpec,
    ) -> Result<ResourceResponse<()>> {
        let raw = self.inner.execute(ctx, spec).await?;
        Ok(ResourceResponse::from_raw(&raw, ()))
    }

    // --- databases ---

    pub async fn create_database(
        &self,
        ctx: &CallContext,
        id: &str,
        throughput: Option<Throughput>,
    ) -> Result<ResourceResponse<DatabaseProperties>> {
        check_id(id)?;
        let spec = RequestSpec::feed(Method::POST, ResourceType::Database, "")
            .with_options(RequestOptions {
                offer_throughput: throughput,
                ..Default::default()
            })
            .with_body(json!({ "id": id }).to_string().into_bytes());
        self.send(ctx, &spec).await
    }

    pub async fn get_database(
        &self,
        ctx: &CallContext,
        id: &str,
    ) -> Result<ResourceResponse<DatabaseProperties>> {
        let spec = RequestSpec::item(Method::GET, ResourceType::Database, &database_link(id));
        self.send(ctx, &spec).await
    }

    pub async fn delete_database(
        &self,
        ctx: &CallContext,
        id: &str,
    ) -> Result<ResourceResponse<()>> {
        let spec = RequestSpec::item(Method::DELETE, ResourceType::Database, &database_link(id));
        let resp = self.send_empty(ctx, &spec).await?;
        // Container entries of the database are gone with it.
        self.inner.containers.invalidate_all();
        self.inner.pkranges.clear().await;
        Ok(resp)
    }

    pub fn list_databases(&self) -> FeedPager<DatabaseProperties> {
        let spec = RequestSpec::feed(Method::GET, ResourceType::Database, "");
        FeedPager::new(self.clone(), spec, "Databases")
    }

    // --- containers ---

    pub async fn create_container(
        &self,
        ctx: &CallContext,
        database: &str,
        properties: &ContainerProperties,
        throughput: Option<Throughput>,
    ) -> Result<ResourceResponse<ContainerProperties>> {
        check_id(&properties.id)?;
        properties.partition_key.validate()?;
        let spec = RequestSpec::feed(
            Method::POST,
            ResourceType::Container,
            &database_link(database),
        )
        .with_options(RequestOptions {
            offer_throughput: throughput,
            ..Default::default()
        })
        .with_body(serde_json::to_vec(properties)?);
        self.send(ctx, &spec).await
    }

    pub async fn replace_container(
        &self,
        ctx: &CallContext,
        database: &str,
        properties: &ContainerProperties,
    ) -> Result<ResourceResponse<ContainerProperties>> {
        let link = container_link(database, &properties.id);
        let spec = RequestSpec::item(Method::PUT, ResourceType::Container, &link)
            .with_body(serde_json::to_vec(properties)?);
        let resp = self.send(ctx, &spec).await?;
        self.inner.containers.invalidate(&link).await;
        Ok(resp)
    }

    pub async fn get_container(
        &self,
        ctx: &CallContext,
        database: &str,
        id: &str,
    ) -> Result<ResourceResponse<ContainerProperties>> {
        let link = container_link(database, id);
        let spec = RequestSpec::item(Method::GET, ResourceType::Container, &link);
        let resp: ResourceResponse<ContainerProperties> = self.send(ctx, &spec).await?;
        self.inner
            .containers
            .insert(link, Arc::new(resp.resource.clone()))
            .await;
        Ok(resp)
    }

    pub async fn delete_container(
        &self,
        ctx: &CallContext,
        database: &str,
        id: &str,
    ) -> Result<ResourceResponse<()>> {
        let link = container_link(database, id);
        let spec = RequestSpec::item(Method::DELETE, ResourceType::Container, &link);
        let resp = self.send_empty(ctx, &spec).await?;
        self.forget_container(&link).await;
        Ok(resp)
    }

    pub fn list_containers(&self, database: &str) -> FeedPager<ContainerProperties> {
        let spec = RequestSpec::feed(
            Method::GET,
            ResourceType::Container,
            &database_link(database),
        );
        FeedPager::new(self.clone(), spec, "DocumentCollections")
    }

    async fn forget_container(&self, link: &str) {
        self.inner.containers.invalidate(link).await;
        self.inner.pkranges.remove(link).await;
        self.inner.sessions.clear(link).await;
    }

    /// Container metadata, served from cache when warm. The charge of a fetch
    /// made on behalf of this call is added to `meter`.
    pub(crate) async fn container_metadata(
        &self,
        ctx: &CallContext,
        database: &str,
        container: &str,
        meter: &ChargeMeter,
    ) -> Result<Arc<ContainerProperties>> {
        let link = container_link(database, container);
        let init = async {
            let spec = RequestSpec::item(Method::GET, ResourceType::Container, &link);
            let raw = self.inner.execute(ctx, &spec).await.inspect_err(|e| {
                meter.add(e.request_charge);
            })?;
            meter.add(raw.request_charge);
            let props: ContainerProperties = raw.json()?;
            Ok::<_, CosmosError>(Arc::new(props))
        };
        self.inner
            .containers
            .try_get_with(link.clone(), init)
            .await
            .map_err(|e: Arc<CosmosError>| (*e).clone())
    }

    /// Partition key definition of a container. A metadata fetch made to
    /// answer it is charged to `meter`.
    pub async fn partition_key_definition(
        &self,
        ctx: &CallContext,
        database: &str,
        container: &str,
        meter: &ChargeMeter,
    ) -> Result<PartitionKeyDefinition> {
        let props = self
            .container_metadata(ctx, database, container, meter)
            .await?;
        Ok(props.partition_key.clone())
    }

    /// Current partition key ranges of a container.
    pub async fn partition_key_ranges(
        &self,
        ctx: &CallContext,
        database: &str,
        container: &str,
    ) -> Result<Vec<PartitionKeyRange>> {
        let link = container_link(database, container);
        let map = self
            .inner
            .pkranges
            .ranges_for(ctx, &link, self.pipeline())
            .await?;
        Ok(map.ranges().to_vec())
    }

    // --- documents ---

    async fn resolve_partition_key(
        &self,
        ctx: &CallContext,
        database: &str,
        container: &str,
        supplied: Option<&PartitionKey>,
        document: Option<&Value>,
        meter: &ChargeMeter,
    ) -> Result<PartitionKey> {
        let props = self
            .container_metadata(ctx, database, container, meter)
            .await?;
        let def = &props.partition_key;
        match (supplied, document) {
            (Some(pk), _) => {
                pk.check_arity(def, false)?;
                Ok(pk.clone())
            }
            (None, Some(doc)) => PartitionKey::from_document(def, doc),
            (None, None) => Err(CosmosError::new(
                ErrorCode::PartitionKeyMismatch,
                "A partition key is required for this document operation",
            )
            .with_hint(format!(
                "Supply values for {}",
                def.paths.join(", ")
            ))),
        }
    }

    fn document_options(options: &DocumentOptions, pk: PartitionKey) -> RequestOptions {
        RequestOptions {
            partition_key: Some(pk),
            if_match: options.if_match.clone(),
            if_none_match: options.if_none_match.clone(),
            session_token: options.session_token.clone(),
            consistency: options.consistency,
            ..Default::default()
        }
    }

    async fn write_document<T: Serialize>(
        &self,
        ctx: &CallContext,
        database: &str,
        container: &str,
        document: &T,
        options: &DocumentOptions,
        upsert: bool,
    ) -> Result<ResourceResponse<Value>> {
        let body = serde_json::to_value(document)?;
        let id = document_id(&body)?;
        check_id(id)?;
        let meter = ChargeMeter::new();
        let pk = self
            .resolve_partition_key(
                ctx,
                database,
                container,
                options.partition_key.as_ref(),
                Some(&body),
                &meter,
            )
            .await?;
        let link = container_link(database, container);
        let mut request = Self::document_options(options, pk);
        request.upsert = upsert;
        let spec = RequestSpec::feed(Method::POST, ResourceType::Document, &link)
            .with_container(link.clone())
            .with_options(request)
            .with_body(serde_json::to_vec(&body)?)
            .idempotent(upsert);
        let resp = self
            .send(ctx, &spec)
            .await
            .map_err(|e| with_extra_charge(e, meter.total()))?;
        Ok(resp.charged(meter.total()))
    }

    /// Insert a new document; fails with Conflict when the id exists in its partition.
    pub async fn create_document<T: Serialize>(
        &self,
        ctx: &CallContext,
        database: &str,
        container: &str,
        document: &T,
        options: &DocumentOptions,
    ) -> Result<ResourceResponse<Value>> {
        self.write_document(ctx, database, container, document, options, false)
            .await
    }

    pub async fn upsert_document<T: Serialize>(
        &self,
        ctx: &CallContext,
        database: &str,
        container: &str,
        document: &T,
        options: &DocumentOptions,
    ) -> Result<ResourceResponse<Value>> {
        self.write_document(ctx, database, container, document, options, true)
            .await
    }

    /// Replace document `id`. Conditional when `options.if_match` carries an ETag.
    pub async fn replace_document<T: Serialize>(
        &self,
        ctx: &CallContext,
        database: &str,
        container: &str,
        id: &str,
        document: &T,
        options: &DocumentOptions,
    ) -> Result<ResourceResponse<Value>> {
        let body = serde_json::to_value(document)?;
        if document_id(&body)? != id {
            return Err(CosmosError::new(
                ErrorCode::InvalidArgument,
                format!("Document id does not match '{}'", id),
            ));
        }
        let meter = ChargeMeter::new();
        let pk = self
            .resolve_partition_key(
                ctx,
                database,
                container,
                options.partition_key.as_ref(),
                Some(&body),
                &meter,
            )
            .await?;
        let spec = RequestSpec::item(
            Method::PUT,
            ResourceType::Document,
            &document_link(database, container, id),
        )
        .with_container(container_link(database, container))
        .with_options(Self::document_options(options, pk))
        .with_body(serde_json::to_vec(&body)?);
        let resp = self
            .send(ctx, &spec)
            .await
            .map_err(|e| with_extra_charge(e, meter.total()))?;
        Ok(resp.charged(meter.total()))
    }

    pub async fn get_document<D: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        database: &str,
        container: &str,
        id: &str,
        options: &DocumentOptions,
    ) -> Result<ResourceResponse<D>> {
        let meter = ChargeMeter::new();
        let pk = self
            .resolve_partition_key(
                ctx,
                database,
                container,
                options.partition_key.as_ref(),
                None,
                &meter,
            )
            .await?;
        let spec = RequestSpec::item(
            Method::GET,
            ResourceType::Document,
            &document_link(database, container, id),
        )
        .with_container(container_link(database, container))
        .with_options(Self::document_options(options, pk));
        let resp = self
            .send(ctx, &spec)
            .await
            .map_err(|e| with_extra_charge(e, meter.total()))?;
        Ok(resp.charged(meter.total()))
    }

    pub async fn delete_document(
        &self,
        ctx: &CallContext,
        database: &str,
        container: &str,
        id: &str,
        options: &DocumentOptions,
    ) -> Result<ResourceResponse<()>> {
        let meter = ChargeMeter::new();
        let pk = self
            .resolve_partition_key(
                ctx,
                database,
                container,
                options.partition_key.as_ref(),
                None,
                &meter,
            )
            .await?;
        let spec = RequestSpec::item(
            Method::DELETE,
            ResourceType::Document,
            &document_link(database, container, id),
        )
        .with_container(container_link(database, container))
        .with_options(Self::document_options(options, pk));
        let resp = self
            .send_empty(ctx, &spec)
            .await
            .map_err(|e| with_extra_charge(e, meter.total()))?;
        Ok(resp.charged(meter.total()))
    }

    /// All documents of a container, page by page.
    pub fn list_documents(
        &self,
        database: &str,
        container: &str,
        max_item_count: Option<u32>,
    ) -> FeedPager<Value> {
        let link = container_link(database, container);
        let spec = RequestSpec::feed(Method::GET, ResourceType::Document, &link)
            .with_container(link.clone())
            .with_options(RequestOptions {
                max_item_count,
                ..Default::default()
            });
        FeedPager::new(self.clone(), spec, "Documents")
    }

    // --- offers ---

    async fn resource_rid(
        &self,
        ctx: &CallContext,
        database: &str,
        container: Option<&str>,
    ) -> Result<(String, f64)> {
        let (rid, charge) = match container {
            Some(container) => {
                let resp = self.get_container(ctx, database, container).await?;
                (resp.resource.rid, resp.request_charge)
            }
            None => {
                let resp = self.get_database(ctx, database).await?;
                (resp.resource.rid, resp.request_charge)
            }
        };
        let rid = rid.ok_or_else(|| {
            CosmosError::new(
                ErrorCode::Internal,
                "Service response did not include a resource id",
            )
            .with_request_charge(charge)
        })?;
        Ok((rid, charge))
    }

    /// The offer of a database (`container = None`) or container.
    pub async fn get_offer(
        &self,
        ctx: &CallContext,
        database: &str,
        container: Option<&str>,
    ) -> Result<ResourceResponse<Offer>> {
        let (rid, rid_charge) = self.resource_rid(ctx, database, container).await?;
        let body = json!({
            "query": "SELECT * FROM root WHERE root.offerResourceId = @rid",
            "parameters": [QueryParameter::new("@rid", rid.clone())],
        });
        let spec = RequestSpec::feed(Method::POST, ResourceType::Offer, "")
            .with_options(RequestOptions {
                query: true,
                ..Default::default()
            })
            .with_body(body.to_string().into_bytes())
            .idempotent(true);
        let raw = self
            .inner
            .execute(ctx, &spec)
            .await
            .map_err(|e| with_extra_charge(e, rid_charge))?;
        let charge = raw.request_charge + rid_charge;
        let page: Value = raw.json()?;
        let offer = page
            .get("Offers")
            .and_then(Value::as_array)
            .and_then(|offers| offers.first())
            .cloned()
            .ok_or_else(|| {
                CosmosError::new(
                    ErrorCode::NotFound,
                    format!("No offer found for resource {}", rid),
                )
                .with_hint("Resources provisioned with shared database throughput have no offer of their own")
                .with_request_charge(charge)
            })?;
        let offer: Offer = serde_json::from_value(offer)?;
        Ok(ResourceResponse::from_raw(&raw, offer).charged(rid_charge))
    }

    /// Switch the throughput of a database or container offer.
    pub async fn replace_offer_throughput(
        &self,
        ctx: &CallContext,
        database: &str,
        container: Option<&str>,
        throughput: Throughput,
    ) -> Result<ResourceResponse<Offer>> {
        let current = self.get_offer(ctx, database, container).await?;
        let spent = current.request_charge;
        let mut offer = current.resource;
        offer.set_throughput(throughput);
        let spec = RequestSpec::item(
            Method::PUT,
            ResourceType::Offer,
            &format!("offers/{}", offer.rid),
        )
        .with_body(serde_json::to_vec(&offer)?);
        let resp: ResourceResponse<Offer> = self
            .send(ctx, &spec)
            .await
            .map_err(|e| with_extra_charge(e, spent))?;
        Ok(resp.charged(spent))
    }

    pub fn list_offers(&self) -> FeedPager<Offer> {
        let spec = RequestSpec::feed(Method::GET, ResourceType::Offer, "");
        FeedPager::new(self.clone(), spec, "Offers")
    }

    /// Drop cached metadata, routing maps and session tokens.
    pub async fn close(&self) {
        self.inner.containers.invalidate_all();
        self.inner.pkranges.clear().await;
        self.inner.sessions.clear_all().await;
    }
}

fn document_id(body: &Value) -> Result<&str> {
    body.get("id").and_then(Value::as_str).ok_or_else(|| {
        CosmosError::new(
            ErrorCode::InvalidArgument,
            "Document must be a JSON object with a string 'id'",
        )
    })
}

fn with_extra_charge(mut err: CosmosError, extra: f64) -> CosmosError {
    err.add_request_charge(extra);
    err
}

/// Pages of a list endpoint, following continuation tokens.
#[derive(Debug)]
pub struct FeedPager<T> {
    client: CosmosClient,
    spec: RequestSpec,
    key: &'static str,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned + Send + 'static> FeedPager<T> {
    fn new(client: CosmosClient, spec: RequestSpec, key: &'static str) -> Self {
        Self {
            client,
            spec,
            key,
            done: false,
            _marker: PhantomData,
        }
    }

    /// The next page, or `None` once the feed is drained.
    pub async fn next_page(
        &mut self,
        ctx: &CallContext,
    ) -> Result<Option<ResourceResponse<Vec<T>>>> {
        if self.done {
            return Ok(None);
        }
        let raw = self.client.inner.execute(ctx, &self.spec).await?;
        let mut page: Value = raw.json()?;
        let items = match page.get_mut(self.key).map(Value::take) {
            Some(list) => serde_json::from_value(list)
                .map_err(|e| CosmosError::from(e).with_request_charge(raw.request_charge))?,
            None => Vec::new(),
        };
        match &raw.meta.continuation {
            Some(token) => self.spec.options.continuation = Some(token.clone()),
            None => self.done = true,
        }
        Ok(Some(ResourceResponse::from_raw(&raw, items)))
    }

    /// Drain every page into one response whose charge is the sum of the pages.
    pub async fn collect_all(mut self, ctx: &CallContext) -> Result<ResourceResponse<Vec<T>>> {
        let mut acc: Option<ResourceResponse<Vec<T>>> = None;
        loop {
            let spent = acc.as_ref().map_or(0.0, |r| r.request_charge);
            let Some(page) = self
                .next_page(ctx)
                .await
                .map_err(|e| with_extra_charge(e, spent))?
            else {
                break;
            };
            acc = Some(match acc.take() {
                None => page,
                Some(mut all) => {
                    all.resource.extend(page.resource);
                    all.request_charge += page.request_charge;
                    all.session_token = page.session_token.or(all.session_token);
                    all.activity_id = page.activity_id;
                    all
                }
            });
        }
        let mut all = acc.ok_or_else(|| CosmosError::internal("Feed produced no pages"))?;
        all.continuation = None;
        Ok(all)
    }

    pub fn into_stream(
        self,
        ctx: CallContext,
    ) -> impl Stream<Item = Result<ResourceResponse<Vec<T>>>> {
        futures::stream::try_unfold(self, move |mut pager| {
            let ctx = ctx.clone();
            async move {
                let page = pager.next_page(&ctx).await?;
                Ok(page.map(|p| (p, pager)))
            }
        })
    }
}

//! Cross-partition query execution.
//!
//! A query is planned once, then sent to every targeted partition key range.
//! Each range has a cursor that fetches pages into the [`Merger`], which
//! applies the plan's merge operators and yields the global result.

use crate::epk::effective_range;
use crate::pipeline::MeteredFetcher;
use crate::pkranges::PartitionKeyRange;
use crate::request::{container_link, RequestOptions, RequestSpec, ResourceType};
use crate::resources::CosmosClient;
use cosmosql_common::models::{ConsistencyLevel, PartitionKey};
use cosmosql_common::{CallContext, ChargeMeter};
use cosmosql_error::{CosmosError, ErrorCode, Result};
use cosmosql_sql::{plan_query, FanOut, MergeStep, Merger, QueryParameter, QueryPlan};
use futures::Stream;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, debug_span, info, instrument, Instrument};

/// A query and its per-call options.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub parameters: Vec<QueryParameter>,
    /// Allow fan-out to more than one partition.
    pub cross_partition: bool,
    pub max_item_count: Option<u32>,
    pub max_concurrency: Option<usize>,
    pub consistency: Option<ConsistencyLevel>,
    pub session_token: Option<String>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            parameters: Vec::new(),
            cross_partition: true,
            max_item_count: None,
            max_concurrency: None,
            consistency: None,
            session_token: None,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.push(QueryParameter::new(name, value));
        self
    }

    pub fn cross_partition(mut self, enabled: bool) -> Self {
        self.cross_partition = enabled;
        self
    }

    pub fn max_item_count(mut self, n: u32) -> Self {
        self.max_item_count = Some(n);
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }
}

#[derive(Debug, Clone)]
enum Target {
    Range {
        range: PartitionKeyRange,
        generation: u64,
    },
    Key(PartitionKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Idle,
    Fetching,
    Exhausted,
    Retired,
}

#[derive(Debug)]
struct Cursor {
    target: Target,
    continuation: Option<String>,
    state: CursorState,
    /// Already re-routed once; a second topology change fails the query.
    restarted: bool,
}

impl Cursor {
    fn new(target: Target, continuation: Option<String>, restarted: bool) -> Self {
        Self {
            target,
            continuation,
            state: CursorState::Idle,
            restarted,
        }
    }
}

#[derive(Debug)]
struct Page {
    rows: Vec<Value>,
    continuation: Option<String>,
}

#[derive(Deserialize)]
struct QueryPage {
    #[serde(rename = "Documents", default)]
    documents: Vec<Value>,
}

/// Rows of a running query. Dropping the stream cancels outstanding page fetches.
pub struct QueryStream {
    client: CosmosClient,
    ctx: CallContext,
    container: String,
    plan: QueryPlan,
    body: Arc<Vec<u8>>,
    template: RequestOptions,
    /// Bounds of the partition key prefix a query is restricted to.
    epk_bounds: Option<(String, String)>,
    merger: Merger,
    cursors: Vec<Cursor>,
    in_flight: JoinSet<(usize, Result<Page>)>,
    max_concurrency: usize,
    low_water_mark: usize,
    meter: ChargeMeter,
    finished: bool,
}

impl std::fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream")
            .field("container", &self.container)
            .field("query", &self.plan.query)
            .field("cursors", &self.cursors.len())
            .field("in_flight", &self.in_flight.len())
            .field("request_charge", &self.meter.total())
            .finish()
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        self.ctx.cancel();
        self.in_flight.abort_all();
    }
}

impl CosmosClient {
    /// Plan `request` against the container and start executing it.
    #[instrument(name = "executor.query", skip_all, fields(container = container))]
    pub async fn query_documents(
        &self,
        ctx: &CallContext,
        database: &str,
        container: &str,
        request: QueryRequest,
    ) -> Result<QueryStream> {
        let meter = ChargeMeter::new();
        let link = container_link(database, container);
        let charged = |e: CosmosError| e.with_request_charge(meter.total());

        let props = self
            .container_metadata(ctx, database, container, &meter)
            .await
            .map_err(charged)?;
        let def = &props.partition_key;
        let plan = plan_query(&request.query, &request.parameters, def).map_err(charged)?;
        if plan.is_cross_partition() && !request.cross_partition {
            return Err(charged(
                CosmosError::new(
                    ErrorCode::UnsupportedQuery,
                    "Query spans several partitions but cross-partition execution is disabled",
                )
                .with_hint("Fix the full partition key in WHERE or enable cross_partition"),
            ));
        }

        let fetcher = MeteredFetcher {
            pipeline: self.pipeline(),
            meter: &meter,
        };
        let (targets, epk_bounds) = match &plan.fan_out {
            FanOut::Single(pk) => (vec![Target::Key(pk.clone())], None),
            FanOut::Prefix(pk) => {
                let bounds = effective_range(def, pk).map_err(charged)?;
                let (ranges, generation) = self
                    .pipeline()
                    .pkranges
                    .overlapping(ctx, &link, &bounds.min, &bounds.max, &fetcher)
                    .await
                    .map_err(charged)?;
                let targets = ranges
                    .into_iter()
                    .map(|range| Target::Range { range, generation })
                    .collect();
                (targets, Some((bounds.min, bounds.max)))
            }
            FanOut::All => {
                let map = self
                    .pipeline()
                    .pkranges
                    .ranges_for(ctx, &link, &fetcher)
                    .await
                    .map_err(charged)?;
                let generation = map.generation();
                let targets = map
                    .ranges()
                    .iter()
                    .cloned()
                    .map(|range| Target::Range { range, generation })
                    .collect();
                (targets, None)
            }
        };

        let settings = &self.settings().executor;
        let max_concurrency = request
            .max_concurrency
            .or(settings.max_concurrency)
            .unwrap_or(targets.len())
            .max(1);
        let template = RequestOptions {
            query: true,
            cross_partition: plan.is_cross_partition(),
            max_item_count: request.max_item_count.or(settings.max_item_count),
            consistency: request.consistency,
            session_token: request.session_token.clone(),
            ..Default::default()
        };
        let body = json!({ "query": plan.query, "parameters": plan.parameters });
        info!(
            targets = targets.len(),
            cross_partition = plan.is_cross_partition(),
            merge_ops = plan.merge.len(),
            "Planned query"
        );

        Ok(QueryStream {
            client: self.clone(),
            ctx: ctx.child(),
            container: link,
            merger: Merger::new(plan.merge.clone(), targets.len()),
            cursors: targets
                .into_iter()
                .map(|t| Cursor::new(t, None, false))
                .collect(),
            plan,
            body: Arc::new(body.to_string().into_bytes()),
            template,
            epk_bounds,
            in_flight: JoinSet::new(),
            max_concurrency,
            low_water_mark: settings.low_water_mark,
            meter,
            finished: false,
        })
    }
}

impl QueryStream {
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    /// Column names fixed by the projection, if any.
    pub fn columns(&self) -> Option<&[String]> {
        self.plan.columns.as_deref()
    }

    /// RU consumed so far, metadata lookups included.
    pub fn request_charge(&self) -> f64 {
        self.meter.total()
    }

    /// Abandon the query. Later calls to [`Self::next_row`] return Canceled.
    pub fn cancel(&mut self) {
        self.ctx.cancel();
        self.in_flight.abort_all();
    }

    fn fail(&mut self, err: CosmosError) -> CosmosError {
        self.in_flight.abort_all();
        self.finished = true;
        err.with_request_charge(self.meter.total())
    }

    pub async fn next_row(&mut self) -> Result<Option<Value>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            if let Err(err) = self.ctx.check() {
                return Err(self.fail(err));
            }
            match self.merger.next() {
                MergeStep::Row(row) => {
                    self.prefetch();
                    return Ok(Some(row));
                }
                MergeStep::Done => {
                    self.in_flight.abort_all();
                    self.finished = true;
                    debug!(charge = self.meter.total(), "Query complete");
                    return Ok(None);
                }
                MergeStep::Pending(streams) => {
                    for idx in streams {
                        self.start_fetch(idx);
                    }
                    self.await_page().await?;
                }
            }
        }
    }

    /// Refill cursors whose buffers fell below the low-water mark.
    fn prefetch(&mut self) {
        for idx in 0..self.cursors.len() {
            if self.cursors[idx].state == CursorState::Idle
                && self.merger.buffered(idx) < self.low_water_mark
            {
                self.start_fetch(idx);
            }
        }
    }

    fn start_fetch(&mut self, idx: usize) {
        if self.in_flight.len() >= self.max_concurrency {
            return;
        }
        let Some(cursor) = self.cursors.get_mut(idx) else {
            return;
        };
        if cursor.state != CursorState::Idle {
            return;
        }
        cursor.state = CursorState::Fetching;

        let mut options = self.template.clone();
        options.continuation = cursor.continuation.clone();
        let (spec, label) = match &cursor.target {
            Target::Range { range, generation } => {
                options.pk_range_id = Some(range.id.clone());
                let spec = RequestSpec::feed(Method::POST, ResourceType::Document, &self.container)
                    .with_generation(*generation);
                (spec, range.id.clone())
            }
            Target::Key(pk) => {
                options.partition_key = Some(pk.clone());
                let spec = RequestSpec::feed(Method::POST, ResourceType::Document, &self.container);
                (spec, pk.to_header())
            }
        };
        let spec = spec
            .with_container(self.container.clone())
            .with_options(options)
            .with_body(self.body.as_ref().clone())
            .idempotent(true);

        let client = self.client.clone();
        let ctx = self.ctx.clone();
        let meter = self.meter.clone();
        let fetch = async move {
            let result = match client.pipeline().execute(&ctx, &spec).await {
                Ok(raw) => {
                    meter.add(raw.request_charge);
                    raw.json::<QueryPage>().map(|page| Page {
                        rows: page.documents,
                        continuation: raw.meta.continuation.clone(),
                    })
                }
                Err(err) => {
                    meter.add(err.request_charge);
                    Err(err)
                }
            };
            (idx, result)
        };
        self.in_flight
            .spawn(fetch.instrument(debug_span!("executor.fetch_page", route = %label)));
    }

    async fn await_page(&mut self) -> Result<()> {
        let joined = tokio::select! {
            biased;
            err = self.ctx.done() => Err(err),
            joined = self.in_flight.join_next() => Ok(joined),
        };
        match joined {
            Err(err) => Err(self.fail(err)),
            Ok(None) => Err(self.fail(CosmosError::internal(
                "Query is waiting for input but no page fetch is running",
            ))),
            Ok(Some(Err(join_err))) => Err(self.fail(CosmosError::internal(format!(
                "Page fetch task failed: {}",
                join_err
            )))),
            Ok(Some(Ok((idx, result)))) => self.on_page(idx, result).await,
        }
    }

    async fn on_page(&mut self, idx: usize, result: Result<Page>) -> Result<()> {
        match result {
            Ok(page) => {
                let exhausted = page.continuation.is_none();
                if let Some(cursor) = self.cursors.get_mut(idx) {
                    cursor.state = if exhausted {
                        CursorState::Exhausted
                    } else {
                        CursorState::Idle
                    };
                    cursor.continuation = page.continuation;
                }
                self.merger.provide(idx, page.rows, exhausted);
                Ok(())
            }
            Err(err) if err.is_partition_topology_change() => {
                self.restart_cursor(idx, err).await
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Replace the cursor of a gone or stale range by cursors over the ranges
    /// now covering it, each resuming from the parent's continuation. When the
    /// range did not split this is the same range again.
    async fn restart_cursor(&mut self, idx: usize, err: CosmosError) -> Result<()> {
        let (parent, continuation) = match self.cursors.get(idx) {
            Some(Cursor {
                target: Target::Range { range, .. },
                continuation,
                restarted: false,
                ..
            }) => (range.clone(), continuation.clone()),
            _ => return Err(self.fail(err)),
        };

        let ctx = self.ctx.clone();
        let fetcher = MeteredFetcher {
            pipeline: self.client.pipeline(),
            meter: &self.meter,
        };
        let refreshed = self
            .client
            .pipeline()
            .pkranges
            .ranges_for(&ctx, &self.container, &fetcher)
            .await;
        let map = match refreshed {
            Ok(map) => map,
            Err(e) => return Err(self.fail(e)),
        };
        let children: Vec<PartitionKeyRange> = map
            .ranges()
            .iter()
            .filter(|r| {
                r.min_inclusive < parent.max_exclusive && parent.min_inclusive < r.max_exclusive
            })
            .filter(|r| match &self.epk_bounds {
                Some((min, max)) => r.overlaps(min, max),
                None => true,
            })
            .cloned()
            .collect();
        if children.is_empty() {
            return Err(self.fail(err));
        }

        info!(
            parent = %parent.id,
            children = children.len(),
            generation = map.generation(),
            "Re-routing query cursor after partition topology change"
        );
        if let Some(cursor) = self.cursors.get_mut(idx) {
            cursor.state = CursorState::Retired;
        }
        self.merger.retire(idx);
        for range in children {
            let stream = self.merger.add_stream();
            debug_assert_eq!(stream, self.cursors.len());
            self.cursors.push(Cursor::new(
                Target::Range {
                    range,
                    generation: map.generation(),
                },
                continuation.clone(),
                true,
            ));
        }
        Ok(())
    }

    /// Drain the query into a vector.
    pub async fn collect_rows(mut self) -> Result<Vec<Value>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> {
        futures::stream::try_unfold(self, |mut stream| async move {
            let row = stream.next_row().await?;
            Ok(row.map(|r| (r, stream)))
        })
    }
}

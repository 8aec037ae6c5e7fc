//! Connections and statement dispatch.

use crate::connstr::ConnectionString;
use crate::rows::Rows;
use cosmosql_client::{
    ContainerProperties, CosmosClient, DocumentOptions, HttpSender, QueryRequest,
    ResourceResponse,
};
use cosmosql_common::config::DriverSettings;
use cosmosql_common::models::{path_segments, PartitionKey, PartitionKeyValue};
use cosmosql_common::{CallContext, ChargeMeter};
use cosmosql_error::{CosmosError, ErrorCode, Result};
use cosmosql_sql::lexer::tokenize;
use cosmosql_sql::placeholder::count_placeholders;
use cosmosql_sql::{parse_statement, QueryOptions, Statement, TableRef};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Outcome of a statement that returns no rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecResult {
    /// 0 when an `IF [NOT] EXISTS` guard turned the statement into a no-op
    /// or the targeted document does not exist.
    pub rows_affected: u64,
    pub request_charge: f64,
}

impl ExecResult {
    fn affected<T>(resp: &ResourceResponse<T>) -> Self {
        Self {
            rows_affected: 1,
            request_charge: resp.request_charge,
        }
    }

    fn noop(err: &CosmosError) -> Self {
        Self {
            rows_affected: 0,
            request_charge: err.request_charge,
        }
    }
}

/// Opens connections with shared driver settings.
#[derive(Debug, Clone, Default)]
pub struct Driver {
    settings: DriverSettings,
}

impl Driver {
    pub fn new(settings: DriverSettings) -> Self {
        Self { settings }
    }

    /// Open a connection over HTTPS.
    pub fn open(&self, connection_string: &str) -> Result<Conn> {
        let (cs, settings) = self.prepare_settings(connection_string)?;
        let client = CosmosClient::new(&cs.endpoint, cs.key, settings)?;
        Ok(Conn::new(client, cs.default_db, cs.auto_id))
    }

    /// Open a connection that sends requests through `sender`.
    pub fn open_with_sender(
        &self,
        connection_string: &str,
        sender: Arc<dyn HttpSender>,
    ) -> Result<Conn> {
        let (cs, settings) = self.prepare_settings(connection_string)?;
        let client = CosmosClient::with_sender(&cs.endpoint, cs.key, settings, sender)?;
        Ok(Conn::new(client, cs.default_db, cs.auto_id))
    }

    fn prepare_settings(&self, connection_string: &str) -> Result<(ConnectionString, DriverSettings)> {
        let cs: ConnectionString = connection_string.parse()?;
        let mut settings = self.settings.clone();
        cs.apply(&mut settings);
        Ok((cs, settings))
    }
}

/// A connection to one account. Clones share the client, its caches and
/// session tokens, and are safe to use concurrently.
#[derive(Debug, Clone)]
pub struct Conn {
    client: CosmosClient,
    default_db: Option<String>,
    auto_id: bool,
    closed: Arc<AtomicBool>,
}

impl Conn {
    fn new(client: CosmosClient, default_db: Option<String>, auto_id: bool) -> Self {
        info!(
            default_db = default_db.as_deref().unwrap_or(""),
            auto_id, "Opened connection"
        );
        Self {
            client,
            default_db,
            auto_id,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The underlying resource client.
    pub fn client(&self) -> &CosmosClient {
        &self.client
    }

    pub fn default_db(&self) -> Option<&str> {
        self.default_db.as_deref()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CosmosError::new(
                ErrorCode::InvalidArgument,
                "Connection is closed",
            ));
        }
        Ok(())
    }

    /// Drop cached metadata and session tokens. Later calls fail.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.client.close().await;
            debug!("Closed connection");
        }
    }

    /// The service has no cross-partition transactions.
    pub fn begin_tx(&self) -> Result<()> {
        Err(CosmosError::new(
            ErrorCode::NotSupported,
            "Transactions are not supported",
        ))
    }

    /// Validate `sql` and count its placeholders.
    pub fn prepare(&self, sql: &str) -> Result<Stmt> {
        self.check_open()?;
        let tokens = tokenize(sql).map_err(|e| e.to_cosmos_error(sql))?;
        let num_input = count_placeholders(&tokens).map_err(|e| e.to_cosmos_error(sql))?;
        Ok(Stmt {
            conn: self.clone(),
            sql: sql.to_string(),
            num_input,
        })
    }

    fn parse(&self, sql: &str, args: &[Value]) -> Result<Statement> {
        self.check_open()?;
        parse_statement(sql, args).map_err(|e| e.to_cosmos_error(sql))
    }

    /// Run a statement that returns no rows.
    #[instrument(name = "driver.exec", skip_all)]
    pub async fn exec(&self, ctx: &CallContext, sql: &str, args: &[Value]) -> Result<ExecResult> {
        let stmt = self.parse(sql, args)?;
        if stmt.is_query() {
            return Err(CosmosError::new(
                ErrorCode::InvalidArgument,
                "Statement returns rows; use query instead of exec",
            ));
        }
        self.exec_statement(ctx, stmt).await
    }

    /// Run a statement that returns rows.
    #[instrument(name = "driver.query", skip_all)]
    pub async fn query(&self, ctx: &CallContext, sql: &str, args: &[Value]) -> Result<Rows> {
        let stmt = self.parse(sql, args)?;
        match stmt {
            Statement::Select { options, query } => {
                let database = resolve(
                    "database",
                    &[
                        query.from.database(),
                        options.database.as_deref(),
                        self.default_db.as_deref(),
                    ],
                )?;
                let collection = select_collection(&query.from, &options)?;
                debug!(database = %database, collection = %collection, "Dispatching query");
                let request = query_request(query.to_string(), &options);
                let stream = self
                    .client
                    .query_documents(ctx, &database, &collection, request)
                    .await?;
                Ok(Rows::from_query(stream))
            }
            Statement::ListDatabases => {
                let all = self.client.list_databases().collect_all(ctx).await?;
                let rows = all
                    .resource
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(Rows::buffered(rows, all.request_charge))
            }
            Statement::ListCollections { database } => {
                let database = self.database_of(database.as_deref())?;
                let all = self.client.list_containers(&database).collect_all(ctx).await?;
                let rows = all
                    .resource
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(Rows::buffered(rows, all.request_charge))
            }
            _ => Err(CosmosError::new(
                ErrorCode::InvalidArgument,
                "Statement returns no rows; use exec instead of query",
            )),
        }
    }

    fn database_of(&self, named: Option<&str>) -> Result<String> {
        resolve("database", &[named, self.default_db.as_deref()])
    }

    async fn exec_statement(&self, ctx: &CallContext, stmt: Statement) -> Result<ExecResult> {
        let client = &self.client;
        match stmt {
            Statement::CreateDatabase {
                name,
                if_not_exists,
                throughput,
            } => match client.create_database(ctx, &name, throughput).await {
                Ok(resp) => Ok(ExecResult::affected(&resp)),
                Err(e) if if_not_exists && e.code == ErrorCode::Conflict => Ok(ExecResult::noop(&e)),
                Err(e) => Err(e),
            },
            Statement::AlterDatabase { name, throughput } => {
                let resp = client
                    .replace_offer_throughput(ctx, &name, None, throughput)
                    .await?;
                Ok(ExecResult::affected(&resp))
            }
            Statement::DropDatabase { name, if_exists } => {
                match client.delete_database(ctx, &name).await {
                    Ok(resp) => Ok(ExecResult::affected(&resp)),
                    Err(e) if if_exists && e.code == ErrorCode::NotFound => Ok(ExecResult::noop(&e)),
                    Err(e) => Err(e),
                }
            }
            Statement::CreateCollection {
                target,
                if_not_exists,
                partition_key,
                throughput,
                unique_keys,
            } => {
                let database = self.database_of(target.database.as_deref())?;
                let props =
                    ContainerProperties::new(target.name, partition_key).with_unique_keys(unique_keys);
                match client
                    .create_container(ctx, &database, &props, throughput)
                    .await
                {
                    Ok(resp) => Ok(ExecResult::affected(&resp)),
                    Err(e) if if_not_exists && e.code == ErrorCode::Conflict => {
                        Ok(ExecResult::noop(&e))
                    }
                    Err(e) => Err(e),
                }
            }
            Statement::AlterCollection { target, throughput } => {
                let database = self.database_of(target.database.as_deref())?;
                let resp = client
                    .replace_offer_throughput(ctx, &database, Some(&target.name), throughput)
                    .await?;
                Ok(ExecResult::affected(&resp))
            }
            Statement::DropCollection { target, if_exists } => {
                let database = self.database_of(target.database.as_deref())?;
                match client.delete_container(ctx, &database, &target.name).await {
                    Ok(resp) => Ok(ExecResult::affected(&resp)),
                    Err(e) if if_exists && e.code == ErrorCode::NotFound => Ok(ExecResult::noop(&e)),
                    Err(e) => Err(e),
                }
            }
            Statement::Insert {
                target,
                upsert,
                document,
            } => self.insert(ctx, target, upsert, document).await,
            Statement::Update {
                target,
                set,
                id,
                keys,
            } => self.update(ctx, target, set, id, keys).await,
            Statement::Delete { target, id, keys } => self.delete(ctx, target, id, keys).await,
            Statement::Select { .. } | Statement::ListDatabases | Statement::ListCollections { .. } => {
                Err(CosmosError::internal("query statement reached exec dispatch"))
            }
        }
    }

    async fn insert(
        &self,
        ctx: &CallContext,
        target: TableRef,
        upsert: bool,
        mut document: Map<String, Value>,
    ) -> Result<ExecResult> {
        let database = self.database_of(target.database.as_deref())?;
        if self.auto_id && !document.contains_key("id") {
            document.insert("id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
        }
        let document = Value::Object(document);
        let options = DocumentOptions::default();
        let resp = if upsert {
            self.client
                .upsert_document(ctx, &database, &target.name, &document, &options)
                .await?
        } else {
            self.client
                .create_document(ctx, &database, &target.name, &document, &options)
                .await?
        };
        Ok(ExecResult::affected(&resp))
    }

    /// Partition key of the document a `WHERE id = .. AND field = ..` clause names.
    async fn key_of(
        &self,
        ctx: &CallContext,
        database: &str,
        collection: &str,
        id: &str,
        keys: &[(String, Value)],
        meter: &ChargeMeter,
    ) -> Result<PartitionKey> {
        let def = self
            .client
            .partition_key_definition(ctx, database, collection, meter)
            .await?;
        let field_of = |path: &str| path_segments(path).join(".");

        if let Some((field, _)) = keys
            .iter()
            .find(|(field, _)| !def.paths.iter().any(|p| field_of(p) == *field))
        {
            return Err(CosmosError::new(
                ErrorCode::UnsupportedQuery,
                format!("'{}' is not a partition key field", field),
            )
            .with_hint(format!("Partition key paths: {}", def.paths.join(", "))));
        }

        let mut values = Vec::with_capacity(def.paths.len());
        for path in &def.paths {
            let field = field_of(path);
            let value = match keys.iter().find(|(f, _)| *f == field) {
                Some((_, v)) => PartitionKeyValue::from_json(v)?,
                None if field == "id" => PartitionKeyValue::from(id),
                None => break,
            };
            values.push(value);
        }
        let pk = PartitionKey::new(values);
        pk.check_arity(&def, false)?;
        Ok(pk)
    }

    async fn update(
        &self,
        ctx: &CallContext,
        target: TableRef,
        set: Vec<(String, Value)>,
        id: Value,
        keys: Vec<(String, Value)>,
    ) -> Result<ExecResult> {
        let database = self.database_of(target.database.as_deref())?;
        let id = id_text(&id)?;
        let meter = ChargeMeter::new();
        let charged = |e: CosmosError| with_extra_charge(e, meter.total());
        let pk = self
            .key_of(ctx, &database, &target.name, &id, &keys, &meter)
            .await
            .map_err(charged)?;
        let read_options = DocumentOptions {
            partition_key: Some(pk.clone()),
            ..Default::default()
        };

        let current = match self
            .client
            .get_document::<Value>(ctx, &database, &target.name, &id, &read_options)
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.code == ErrorCode::NotFound => {
                return Ok(ExecResult {
                    rows_affected: 0,
                    request_charge: e.request_charge + meter.total(),
                })
            }
            Err(e) => return Err(charged(e)),
        };
        meter.add(current.request_charge);

        let mut document = current.resource;
        let Some(fields) = document.as_object_mut() else {
            return Err(charged(CosmosError::internal("Stored document is not an object")));
        };
        for (field, value) in set {
            fields.insert(field, value);
        }
        let write_options = DocumentOptions {
            partition_key: Some(pk),
            if_match: current.etag,
            ..Default::default()
        };
        let resp = self
            .client
            .replace_document(ctx, &database, &target.name, &id, &document, &write_options)
            .await
            .map_err(charged)?;
        Ok(ExecResult {
            rows_affected: 1,
            request_charge: resp.request_charge + meter.total(),
        })
    }

    async fn delete(
        &self,
        ctx: &CallContext,
        target: TableRef,
        id: Value,
        keys: Vec<(String, Value)>,
    ) -> Result<ExecResult> {
        let database = self.database_of(target.database.as_deref())?;
        let id = id_text(&id)?;
        let meter = ChargeMeter::new();
        let pk = self
            .key_of(ctx, &database, &target.name, &id, &keys, &meter)
            .await
            .map_err(|e| with_extra_charge(e, meter.total()))?;
        let options = DocumentOptions {
            partition_key: Some(pk),
            ..Default::default()
        };
        match self
            .client
            .delete_document(ctx, &database, &target.name, &id, &options)
            .await
        {
            Ok(resp) => Ok(ExecResult {
                rows_affected: 1,
                request_charge: resp.request_charge + meter.total(),
            }),
            Err(e) if e.code == ErrorCode::NotFound => Ok(ExecResult {
                rows_affected: 0,
                request_charge: e.request_charge + meter.total(),
            }),
            Err(e) => Err(with_extra_charge(e, meter.total())),
        }
    }
}

fn with_extra_charge(mut err: CosmosError, extra: f64) -> CosmosError {
    err.add_request_charge(extra);
    err
}

fn id_text(id: &Value) -> Result<String> {
    match id {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(CosmosError::new(
            ErrorCode::InvalidArgument,
            format!("Document id must be a string, got {}", other),
        )),
    }
}

/// The single name `sources` agree on. Two different names are ambiguous.
fn resolve(what: &str, sources: &[Option<&str>]) -> Result<String> {
    let mut named = sources.iter().flatten();
    let Some(first) = named.next() else {
        return Err(CosmosError::new(
            ErrorCode::InvalidArgument,
            format!("No {} given", what),
        )
        .with_hint(format!(
            "Qualify the name, add WITH {}=<name>, or set DefaultDb in the connection string",
            what
        )));
    };
    if let Some(other) = named.find(|n| *n != first) {
        return Err(CosmosError::unsupported_query(format!(
            "Ambiguous {}: both '{}' and '{}' are named",
            what, first, other
        )));
    }
    Ok(first.to_string())
}

/// `FROM coll c`, `FROM db.coll`, or a lone `FROM coll` without `WITH collection=`.
fn select_collection(from: &cosmosql_sql::ast::FromClause, options: &QueryOptions) -> Result<String> {
    let named = from.explicit_collection().or_else(|| {
        if options.collection.is_none() {
            from.path.last().map(String::as_str)
        } else {
            None
        }
    });
    resolve("collection", &[named, options.collection.as_deref()])
}

fn query_request(text: String, options: &QueryOptions) -> QueryRequest {
    let mut request = QueryRequest::new(text);
    if let Some(enabled) = options.cross_partition {
        request = request.cross_partition(enabled);
    }
    if let Some(n) = options.max_item_count {
        request = request.max_item_count(n);
    }
    if let Some(n) = options.max_concurrency {
        request = request.max_concurrency(n);
    }
    request.consistency = options.consistency;
    request
}

/// A validated statement bound to its connection.
#[derive(Debug, Clone)]
pub struct Stmt {
    conn: Conn,
    sql: String,
    num_input: usize,
}

impl Stmt {
    /// Number of placeholder arguments the statement takes.
    pub fn num_input(&self) -> usize {
        self.num_input
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    fn check_args(&self, args: &[Value]) -> Result<()> {
        if args.len() != self.num_input {
            return Err(CosmosError::new(
                ErrorCode::InvalidParameter,
                format!(
                    "Statement expects {} argument(s), got {}",
                    self.num_input,
                    args.len()
                ),
            ));
        }
        Ok(())
    }

    pub async fn exec(&self, ctx: &CallContext, args: &[Value]) -> Result<ExecResult> {
        self.check_args(args)?;
        self.conn.exec(ctx, &self.sql, args).await
    }

    pub async fn query(&self, ctx: &CallContext, args: &[Value]) -> Result<Rows> {
        self.check_args(args)?;
        self.conn.query(ctx, &self.sql, args).await
    }

    /// Statements hold no server-side resources.
    pub fn close(self) {}
}

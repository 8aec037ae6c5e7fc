//! Query planning: rewrite a SELECT into the per-partition form and the merge
//! operators that reassemble the partitions' answers.

use crate::ast::{
    AggregateKind, BinaryOp, Expr, Projection, SelectItem, SelectQuery, SortOrder,
};
use crate::merge::{
    aggregate_field, group_key_field, GroupOutput, GroupSpec, MergeOp, OutputField,
    ORDER_BY_ITEMS, PAYLOAD,
};
use crate::parser::parse_select;
use cosmosql_common::models::{
    PartitionKey, PartitionKeyDefinition, PartitionKeyValue, PartitionKind,
};
use cosmosql_error::{CosmosError, ErrorCode, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A named `@parameter` value, serialized the way the query body carries it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParameter {
    pub name: String,
    pub value: Value,
}

impl QueryParameter {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let name = if name.starts_with('@') {
            name
        } else {
            format!("@{}", name)
        };
        Self {
            name,
            value: value.into(),
        }
    }

    fn matches(&self, bare: &str) -> bool {
        self.name.trim_start_matches('@') == bare
    }
}

/// Which partition key ranges a query must visit.
#[derive(Debug, Clone, PartialEq)]
pub enum FanOut {
    All,
    /// The full key tuple is fixed by the WHERE clause.
    Single(PartitionKey),
    /// A leading subset of a MultiHash key is fixed.
    Prefix(PartitionKey),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Text sent to every targeted partition.
    pub query: String,
    pub parameters: Vec<QueryParameter>,
    /// Applied in order by [`crate::merge::Merger`].
    pub merge: Vec<MergeOp>,
    pub fan_out: FanOut,
    /// Column names when the projection fixes them.
    pub columns: Option<Vec<String>>,
    pub source: SelectQuery,
}

impl QueryPlan {
    pub fn is_cross_partition(&self) -> bool {
        !matches!(self.fan_out, FanOut::Single(_))
    }

    pub fn is_ordered(&self) -> bool {
        self.merge
            .iter()
            .any(|op| matches!(op, MergeOp::SortedMerge { .. }))
    }
}

/// Parse and plan `sql` against a container's partition key definition.
pub fn plan_query(
    sql: &str,
    parameters: &[QueryParameter],
    partition_key: &PartitionKeyDefinition,
) -> Result<QueryPlan> {
    let query = parse_select(sql).map_err(|e| e.to_cosmos_error(sql))?;
    plan_select(query, parameters, partition_key)
}

pub fn plan_select(
    query: SelectQuery,
    parameters: &[QueryParameter],
    partition_key: &PartitionKeyDefinition,
) -> Result<QueryPlan> {
    check_parameters(&query, parameters)?;

    let aggregated = !query.group_by.is_empty() || projection_has_aggregate(&query.projection);
    let (text, mut merge, columns) = if aggregated {
        rewrite_aggregate(&query)?
    } else if !query.order_by.is_empty() {
        rewrite_order_by(&query)?
    } else {
        rewrite_plain(&query)
    };

    if let Some(window) = offset_limit(&query) {
        merge.push(window);
    }

    let plan = QueryPlan {
        query: text,
        parameters: parameters.to_vec(),
        merge,
        fan_out: fan_out(&query, parameters, partition_key),
        columns,
        source: query,
    };
    debug!(
        cross_partition = plan.is_cross_partition(),
        merge_ops = plan.merge.len(),
        query = %plan.query,
        "Planned query"
    );
    Ok(plan)
}

fn projection_has_aggregate(projection: &Projection) -> bool {
    match projection {
        Projection::Star => false,
        Projection::Value(e) => e.contains_aggregate(),
        Projection::Items(items) => items.iter().any(|i| i.expr.contains_aggregate()),
    }
}

fn check_parameters(query: &SelectQuery, parameters: &[QueryParameter]) -> Result<()> {
    let mut missing: Option<String> = None;
    let mut visit = |e: &Expr| {
        if let Expr::Parameter(p) = e {
            if missing.is_none() && !parameters.iter().any(|q| q.matches(p)) {
                missing = Some(p.clone());
            }
        }
    };
    match &query.projection {
        Projection::Star => {}
        Projection::Value(e) => e.walk(&mut visit),
        Projection::Items(items) => {
            for item in items {
                item.expr.walk(&mut visit);
            }
        }
    }
    if let Some(w) = &query.where_clause {
        w.walk(&mut visit);
    }
    for k in &query.group_by {
        k.walk(&mut visit);
    }
    for s in &query.order_by {
        s.expr.walk(&mut visit);
    }
    match missing {
        Some(p) => Err(CosmosError::new(
            ErrorCode::InvalidParameter,
            format!("Query parameter '@{}' has no value", p),
        )),
        None => Ok(()),
    }
}

fn offset_limit(query: &SelectQuery) -> Option<MergeOp> {
    match (query.top, query.offset_limit) {
        (Some(n), _) => Some(MergeOp::OffsetLimit {
            offset: 0,
            limit: Some(n),
        }),
        (None, Some((offset, limit))) => Some(MergeOp::OffsetLimit {
            offset,
            limit: Some(limit),
        }),
        (None, None) => None,
    }
}

/// Each partition must return enough rows to cover the global window.
fn partition_window(query: &SelectQuery) -> Option<(u64, u64)> {
    query
        .offset_limit
        .map(|(offset, limit)| (0, offset.saturating_add(limit)))
}

fn column_name(item: &SelectItem, unnamed: &mut usize) -> String {
    if let Some(alias) = &item.alias {
        return alias.clone();
    }
    if let Some(name) = item.expr.output_name() {
        return name.to_string();
    }
    if let Expr::Ident(name) = &item.expr {
        return name.clone();
    }
    *unnamed += 1;
    format!("${}", unnamed)
}

fn column_names(items: &[SelectItem]) -> Vec<String> {
    let mut unnamed = 0;
    items.iter().map(|i| column_name(i, &mut unnamed)).collect()
}

type Rewrite = (String, Vec<MergeOp>, Option<Vec<String>>);

fn rewrite_plain(query: &SelectQuery) -> Rewrite {
    let mut partition = query.clone();
    partition.offset_limit = partition_window(query);

    let mut merge = Vec::new();
    if query.distinct {
        merge.push(MergeOp::DistinctFold);
    }
    let columns = match &query.projection {
        Projection::Items(items) => Some(column_names(items)),
        _ => None,
    };
    (partition.to_string(), merge, columns)
}

fn rewrite_order_by(query: &SelectQuery) -> Result<Rewrite> {
    if query
        .order_by
        .iter()
        .any(|s| s.expr.contains_aggregate())
    {
        return Err(CosmosError::unsupported_query(
            "Aggregates are not supported in ORDER BY",
        ));
    }

    let (payload, columns) = match &query.projection {
        Projection::Star => (Expr::Ident(query.from.alias().to_string()), None),
        Projection::Value(e) => (e.clone(), None),
        Projection::Items(items) => {
            let names = column_names(items);
            let fields = names
                .iter()
                .cloned()
                .zip(items.iter().map(|i| i.expr.clone()))
                .collect();
            (Expr::Object(fields), Some(names))
        }
    };

    let order_items = Expr::Array(
        query
            .order_by
            .iter()
            .map(|s| Expr::Object(vec![("item".to_string(), s.expr.clone())]))
            .collect(),
    );

    let mut partition = query.clone();
    partition.projection = Projection::Items(vec![
        SelectItem {
            expr: order_items,
            alias: Some(ORDER_BY_ITEMS.to_string()),
        },
        SelectItem {
            expr: payload,
            alias: Some(PAYLOAD.to_string()),
        },
    ]);
    partition.offset_limit = partition_window(query);

    let mut merge = vec![MergeOp::SortedMerge {
        orders: query.order_by.iter().map(|s| s.order).collect::<Vec<SortOrder>>(),
    }];
    if query.distinct {
        merge.push(MergeOp::DistinctFold);
    }
    Ok((partition.to_string(), merge, columns))
}

fn rewrite_aggregate(query: &SelectQuery) -> Result<Rewrite> {
    if query.distinct {
        return Err(CosmosError::unsupported_query(
            "DISTINCT cannot be combined with aggregates or GROUP BY",
        ));
    }
    if !query.order_by.is_empty() {
        return Err(CosmosError::unsupported_query(
            "ORDER BY cannot be combined with aggregates or GROUP BY",
        ));
    }
    if query
        .where_clause
        .as_ref()
        .is_some_and(Expr::contains_aggregate)
        || query.group_by.iter().any(Expr::contains_aggregate)
    {
        return Err(CosmosError::unsupported_query(
            "Aggregates are only supported in the SELECT list",
        ));
    }

    let keys = &query.group_by;
    let mut aggregates: Vec<(AggregateKind, Expr)> = Vec::new();
    let mut field_of = |expr: &Expr| -> Result<OutputField> {
        if let Expr::Aggregate { kind, arg } = expr {
            aggregates.push((*kind, arg.as_ref().clone()));
            return Ok(OutputField::Aggregate(aggregates.len() - 1));
        }
        if let Some(i) = keys.iter().position(|k| k == expr) {
            return Ok(OutputField::Key(i));
        }
        Err(CosmosError::unsupported_query(format!(
            "'{}' must appear in GROUP BY or be an aggregate",
            expr
        )))
    };

    let (output, columns) = match &query.projection {
        Projection::Star => {
            return Err(CosmosError::unsupported_query(
                "SELECT * cannot be combined with aggregates or GROUP BY",
            ))
        }
        Projection::Value(e) => (GroupOutput::Value(field_of(e)?), None),
        Projection::Items(items) => {
            let names = column_names(items);
            let mut fields = Vec::with_capacity(items.len());
            for (name, item) in names.iter().zip(items) {
                fields.push((name.clone(), field_of(&item.expr)?));
            }
            (GroupOutput::Object(fields), Some(names))
        }
    };

    let mut partial = Vec::with_capacity(keys.len() + aggregates.len());
    for (i, k) in keys.iter().enumerate() {
        partial.push((group_key_field(i), k.clone()));
    }
    for (j, (kind, arg)) in aggregates.iter().enumerate() {
        let expr = match kind {
            AggregateKind::Avg => Expr::Object(vec![
                (
                    "sum".to_string(),
                    Expr::Aggregate {
                        kind: AggregateKind::Sum,
                        arg: Box::new(arg.clone()),
                    },
                ),
                (
                    "count".to_string(),
                    Expr::Aggregate {
                        kind: AggregateKind::Count,
                        arg: Box::new(arg.clone()),
                    },
                ),
            ]),
            other => Expr::Aggregate {
                kind: *other,
                arg: Box::new(arg.clone()),
            },
        };
        partial.push((aggregate_field(j), expr));
    }

    let partition = SelectQuery {
        distinct: false,
        top: None,
        projection: Projection::Value(Expr::Object(partial)),
        from: query.from.clone(),
        where_clause: query.where_clause.clone(),
        group_by: query.group_by.clone(),
        order_by: Vec::new(),
        offset_limit: None,
    };

    let spec = GroupSpec {
        keys: keys.len(),
        aggregates: aggregates.into_iter().map(|(k, _)| k).collect(),
        output,
    };
    Ok((partition.to_string(), vec![MergeOp::GroupFold(spec)], columns))
}

fn constant(expr: &Expr, parameters: &[QueryParameter]) -> Option<Value> {
    let value = match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Parameter(p) => parameters.iter().find(|q| q.matches(p))?.value.clone(),
        _ => return None,
    };
    match value {
        Value::Array(_) | Value::Object(_) => None,
        scalar => Some(scalar),
    }
}

fn collect_equalities(
    expr: &Expr,
    alias: &str,
    parameters: &[QueryParameter],
    out: &mut Vec<(Vec<String>, Value)>,
) {
    match expr {
        Expr::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            collect_equalities(left, alias, parameters, out);
            collect_equalities(right, alias, parameters, out);
        }
        Expr::Binary {
            op: BinaryOp::Eq,
            left,
            right,
        } => {
            let bound = match (left.property_path(alias), right.property_path(alias)) {
                (Some(path), None) => constant(right, parameters).map(|v| (path, v)),
                (None, Some(path)) => constant(left, parameters).map(|v| (path, v)),
                _ => None,
            };
            if let Some((path, value)) = bound {
                if !path.is_empty() {
                    out.push((path, value));
                }
            }
        }
        _ => {}
    }
}

/// Routing derived from equalities on partition key paths joined by AND.
pub fn fan_out(
    query: &SelectQuery,
    parameters: &[QueryParameter],
    partition_key: &PartitionKeyDefinition,
) -> FanOut {
    let Some(predicate) = &query.where_clause else {
        return FanOut::All;
    };
    let mut bound = Vec::new();
    collect_equalities(predicate, query.from.alias(), parameters, &mut bound);

    let mut values = Vec::new();
    for i in 0..partition_key.paths.len() {
        let segments = partition_key.segments(i);
        let Some((_, value)) = bound.iter().find(|(path, _)| *path == segments) else {
            break;
        };
        match PartitionKeyValue::from_json(value) {
            Ok(v) => values.push(v),
            Err(_) => break,
        }
    }

    if values.is_empty() {
        FanOut::All
    } else if values.len() == partition_key.paths.len() {
        FanOut::Single(PartitionKey::new(values))
    } else if partition_key.kind == PartitionKind::MultiHash {
        FanOut::Prefix(PartitionKey::new(values))
    } else {
        FanOut::All
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_pk() -> PartitionKeyDefinition {
        PartitionKeyDefinition::hash("/username")
    }

    fn multi_pk() -> PartitionKeyDefinition {
        PartitionKeyDefinition::multi_hash(["/app", "/username"])
    }

    #[test]
    fn test_point_query_routes_to_single_partition() {
        let plan = plan_query(
            "SELECT * FROM c WHERE c.username = 'user1' AND c.grade > 3",
            &[],
            &hash_pk(),
        )
        .unwrap();
        assert_eq!(plan.fan_out, FanOut::Single(PartitionKey::single("user1")));
        assert!(!plan.is_cross_partition());
        assert!(plan.merge.is_empty());
    }

    #[test]
    fn test_parameter_equality_routes() {
        let params = [QueryParameter::new("u", "user7")];
        let plan = plan_query("SELECT * FROM c WHERE @u = c.username", &params, &hash_pk()).unwrap();
        assert_eq!(plan.fan_out, FanOut::Single(PartitionKey::single("user7")));
        assert_eq!(plan.parameters[0].name, "@u");
    }

    #[test]
    fn test_missing_parameter_rejected() {
        let err = plan_query("SELECT * FROM c WHERE c.a = @nope", &[], &hash_pk()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
    }

    #[test]
    fn test_or_does_not_route() {
        let plan = plan_query(
            "SELECT * FROM c WHERE c.username = 'a' OR c.username = 'b'",
            &[],
            &hash_pk(),
        )
        .unwrap();
        assert_eq!(plan.fan_out, FanOut::All);
    }

    #[test]
    fn test_multi_hash_prefix() {
        let pk = multi_pk();
        let plan = plan_query(r#"SELECT * FROM c WHERE c.app = "app0""#, &[], &pk).unwrap();
        assert_eq!(plan.fan_out, FanOut::Prefix(PartitionKey::single("app0")));

        let plan = plan_query(
            r#"SELECT * FROM c WHERE c.username = "user0" AND c.app = "app0""#,
            &[],
            &pk,
        )
        .unwrap();
        assert_eq!(
            plan.fan_out,
            FanOut::Single(PartitionKey::from(vec!["app0", "user0"]))
        );

        // A non-leading component alone cannot route.
        let plan = plan_query(r#"SELECT * FROM c WHERE c.username = "user0""#, &[], &pk).unwrap();
        assert_eq!(plan.fan_out, FanOut::All);
    }

    #[test]
    fn test_order_by_rewrite() {
        let plan = plan_query(
            "SELECT c.id, c.grade FROM c ORDER BY c.grade ASC OFFSET 10 LIMIT 5",
            &[],
            &hash_pk(),
        )
        .unwrap();
        assert_eq!(
            plan.query,
            r#"SELECT [{"item": c.grade}] AS orderByItems, {"id": c.id, "grade": c.grade} AS payload FROM c ORDER BY c.grade ASC OFFSET 0 LIMIT 15"#
        );
        assert_eq!(
            plan.merge,
            vec![
                MergeOp::SortedMerge {
                    orders: vec![SortOrder::Ascending]
                },
                MergeOp::OffsetLimit {
                    offset: 10,
                    limit: Some(5)
                },
            ]
        );
        assert_eq!(plan.columns, Some(vec!["id".to_string(), "grade".to_string()]));
        assert!(plan.is_ordered());
    }

    #[test]
    fn test_order_by_star_uses_alias_payload() {
        let plan = plan_query("SELECT TOP 3 * FROM c ORDER BY c.a DESC", &[], &hash_pk()).unwrap();
        assert_eq!(
            plan.query,
            r#"SELECT TOP 3 [{"item": c.a}] AS orderByItems, c AS payload FROM c ORDER BY c.a DESC"#
        );
        assert_eq!(
            plan.merge.last(),
            Some(&MergeOp::OffsetLimit {
                offset: 0,
                limit: Some(3)
            })
        );
    }

    #[test]
    fn test_avg_rewrite() {
        let plan = plan_query("SELECT VALUE AVG(c.grade) FROM c", &[], &hash_pk()).unwrap();
        assert_eq!(
            plan.query,
            r#"SELECT VALUE {"a0": {"sum": SUM(c.grade), "count": COUNT(c.grade)}} FROM c"#
        );
        assert_eq!(
            plan.merge,
            vec![MergeOp::GroupFold(GroupSpec {
                keys: 0,
                aggregates: vec![AggregateKind::Avg],
                output: GroupOutput::Value(OutputField::Aggregate(0)),
            })]
        );
    }

    #[test]
    fn test_group_by_rewrite() {
        let plan = plan_query(
            "SELECT c.app, COUNT(1) AS n, MAX(c.grade) FROM c GROUP BY c.app OFFSET 1 LIMIT 2",
            &[],
            &hash_pk(),
        )
        .unwrap();
        assert_eq!(
            plan.query,
            r#"SELECT VALUE {"g0": c.app, "a0": COUNT(1), "a1": MAX(c.grade)} FROM c GROUP BY c.app"#
        );
        assert_eq!(
            plan.columns,
            Some(vec!["app".to_string(), "n".to_string(), "$1".to_string()])
        );
        assert_eq!(plan.merge.len(), 2);
    }

    #[test]
    fn test_plain_rewrite_widens_window() {
        let plan = plan_query(
            "SELECT DISTINCT VALUE c.app FROM c OFFSET 5 LIMIT 5",
            &[],
            &hash_pk(),
        )
        .unwrap();
        assert_eq!(
            plan.query,
            "SELECT DISTINCT VALUE c.app FROM c OFFSET 0 LIMIT 10"
        );
        assert_eq!(plan.merge[0], MergeOp::DistinctFold);
    }

    #[test]
    fn test_rejected_aggregate_shapes() {
        for sql in [
            "SELECT c.a, COUNT(1) FROM c",
            "SELECT * FROM c GROUP BY c.a",
            "SELECT DISTINCT COUNT(1) FROM c",
            "SELECT c.a, COUNT(1) FROM c GROUP BY c.a ORDER BY c.a",
            "SELECT VALUE COUNT(1) + 1 FROM c",
        ] {
            let err = plan_query(sql, &[], &hash_pk()).unwrap_err();
            assert_eq!(err.code, ErrorCode::UnsupportedQuery, "{}", sql);
        }
    }

    #[test]
    fn test_parse_errors_surface_as_unsupported() {
        let err = plan_query("SELECT * FROM c JOIN t IN c.tags", &[], &hash_pk()).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedQuery);
        assert!(err.context.is_some());
    }
}

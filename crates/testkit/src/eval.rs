//! Query evaluation over in-memory documents.
//!
//! Values are `Option<Value>`; `None` is `undefined`. Operators follow the
//! service's rules: mismatched types compare as undefined and only `true`
//! passes a filter.

use cosmosql_sql::ast::{
    AggregateKind, BinaryOp, Expr, Projection, SelectItem, SelectQuery, SortOrder, UnaryOp,
};
use cosmosql_sql::json::{canonical_key, compare, number_value};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EvalError {
    #[error("Identifier '{0}' could not be resolved")]
    UnknownIdentifier(String),

    #[error("Parameter '@{0}' was not supplied")]
    MissingParameter(String),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Function '{name}' expects {expected} arguments")]
    Arity { name: String, expected: String },

    #[error("Aggregate '{0}' is not allowed here")]
    MisplacedAggregate(String),
}

pub type Result<T> = std::result::Result<T, EvalError>;

/// Bindings visible to an expression: the FROM alias and query parameters.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub alias: &'a str,
    pub doc: &'a Value,
    pub params: &'a HashMap<String, Value>,
}

impl<'a> Scope<'a> {
    pub fn with_doc(self, doc: &'a Value) -> Self {
        Scope { doc, ..self }
    }
}

fn same_type(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Null, Value::Null)
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_))
    )
}

fn equals(a: &Value, b: &Value) -> Option<bool> {
    same_type(a, b).then(|| compare(Some(a), Some(b)) == Ordering::Equal)
}

fn ordered(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Array(_), _) | (Value::Object(_), _) => None,
        _ if same_type(a, b) => Some(compare(Some(a), Some(b))),
        _ => None,
    }
}

fn num(v: &Option<Value>) -> Option<f64> {
    v.as_ref().and_then(Value::as_f64)
}

fn int(v: &Option<Value>) -> Option<i64> {
    match v {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

fn boolean(b: Option<bool>) -> Option<Value> {
    b.map(Value::Bool)
}

/// `true` only when the expression evaluates to boolean true.
pub fn is_true(v: &Option<Value>) -> bool {
    matches!(v, Some(Value::Bool(true)))
}

pub fn eval(expr: &Expr, scope: Scope<'_>) -> Result<Option<Value>> {
    Ok(match expr {
        Expr::Literal(v) => Some(v.clone()),
        Expr::Undefined => None,
        Expr::Parameter(p) => Some(
            scope
                .params
                .get(p)
                .cloned()
                .ok_or_else(|| EvalError::MissingParameter(p.clone()))?,
        ),
        Expr::Ident(name) => {
            if name == scope.alias {
                Some(scope.doc.clone())
            } else {
                return Err(EvalError::UnknownIdentifier(name.clone()));
            }
        }
        Expr::Property { base, name } => match eval(base, scope)? {
            Some(Value::Object(map)) => map.get(name).cloned(),
            _ => None,
        },
        Expr::Index { base, index } => {
            let base = eval(base, scope)?;
            match (base, eval(index, scope)?) {
                (Some(Value::Object(map)), Some(Value::String(key))) => map.get(&key).cloned(),
                (Some(Value::Array(items)), Some(Value::Number(n))) => n
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned(),
                _ => None,
            }
        }
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if let Some(v) = eval(item, scope)? {
                    out.push(v);
                }
            }
            Some(Value::Array(out))
        }
        Expr::Object(fields) => {
            let mut out = Map::new();
            for (name, e) in fields {
                if let Some(v) = eval(e, scope)? {
                    out.insert(name.clone(), v);
                }
            }
            Some(Value::Object(out))
        }
        Expr::Unary { op, expr } => {
            let v = eval(expr, scope)?;
            match op {
                UnaryOp::Not => match v {
                    Some(Value::Bool(b)) => Some(Value::Bool(!b)),
                    _ => None,
                },
                UnaryOp::Neg => num(&v).and_then(|f| number_value(-f)),
                UnaryOp::Plus => num(&v).and_then(number_value),
                UnaryOp::BitNot => int(&v).map(|i| Value::from(!i)),
            }
        }
        Expr::Binary { op, left, right } => binary(*op, left, right, scope)?,
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let v = eval(expr, scope)?;
            let lo = eval(low, scope)?;
            let hi = eval(high, scope)?;
            let inside = match (&v, &lo, &hi) {
                (Some(v), Some(lo), Some(hi)) => ordered(v, lo)
                    .zip(ordered(v, hi))
                    .map(|(a, b)| a != Ordering::Less && b != Ordering::Greater),
                _ => None,
            };
            boolean(inside.map(|b| b != *negated))
        }
        Expr::In {
            expr,
            list,
            negated,
        } => {
            let Some(v) = eval(expr, scope)? else {
                return Ok(None);
            };
            let mut found = false;
            for item in list {
                if let Some(candidate) = eval(item, scope)? {
                    if equals(&v, &candidate) == Some(true) {
                        found = true;
                        break;
                    }
                }
            }
            Some(Value::Bool(found != *negated))
        }
        Expr::Like {
            expr,
            pattern,
            escape,
            negated,
        } => {
            let escape = match escape {
                Some(e) => match eval(e, scope)? {
                    Some(Value::String(s)) => s.chars().next(),
                    _ => None,
                },
                None => None,
            };
            match (eval(expr, scope)?, eval(pattern, scope)?) {
                (Some(Value::String(s)), Some(Value::String(p))) => {
                    let text: Vec<char> = s.chars().collect();
                    let pat: Vec<char> = p.chars().collect();
                    Some(Value::Bool(like(&text, &pat, escape) != *negated))
                }
                _ => None,
            }
        }
        Expr::Function { name, args, udf } => {
            if *udf {
                return Err(EvalError::UnknownFunction(format!("udf.{}", name)));
            }
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(eval(a, scope)?);
            }
            function(name, values)?
        }
        Expr::Aggregate { kind, .. } => {
            return Err(EvalError::MisplacedAggregate(kind.as_str().to_string()))
        }
    })
}

fn binary(op: BinaryOp, left: &Expr, right: &Expr, scope: Scope<'_>) -> Result<Option<Value>> {
    let l = eval(left, scope)?;
    if op == BinaryOp::Coalesce {
        return match l {
            Some(v) => Ok(Some(v)),
            None => eval(right, scope),
        };
    }
    let r = eval(right, scope)?;
    let as_bool = |v: &Option<Value>| v.as_ref().and_then(Value::as_bool);
    Ok(match op {
        BinaryOp::And => match (as_bool(&l), as_bool(&r)) {
            (Some(false), _) | (_, Some(false)) => Some(Value::Bool(false)),
            (Some(true), Some(true)) => Some(Value::Bool(true)),
            _ => None,
        },
        BinaryOp::Or => match (as_bool(&l), as_bool(&r)) {
            (Some(true), _) | (_, Some(true)) => Some(Value::Bool(true)),
            (Some(false), Some(false)) => Some(Value::Bool(false)),
            _ => None,
        },
        BinaryOp::Eq | BinaryOp::NotEq => match (&l, &r) {
            (Some(a), Some(b)) => boolean(equals(a, b).map(|eq| eq == (op == BinaryOp::Eq))),
            _ => None,
        },
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ord = match (&l, &r) {
                (Some(a), Some(b)) => ordered(a, b),
                _ => None,
            };
            boolean(ord.map(|o| match op {
                BinaryOp::Lt => o == Ordering::Less,
                BinaryOp::LtEq => o != Ordering::Greater,
                BinaryOp::Gt => o == Ordering::Greater,
                _ => o != Ordering::Less,
            }))
        }
        BinaryOp::Concat => match (l, r) {
            (Some(Value::String(a)), Some(Value::String(b))) => Some(Value::String(a + &b)),
            _ => None,
        },
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let (Some(a), Some(b)) = (num(&l), num(&r)) else {
                return Ok(None);
            };
            match op {
                BinaryOp::Add => number_value(a + b),
                BinaryOp::Sub => number_value(a - b),
                BinaryOp::Mul => number_value(a * b),
                BinaryOp::Div if b != 0.0 => number_value(a / b),
                BinaryOp::Mod if b != 0.0 => number_value(a % b),
                _ => None,
            }
        }
        BinaryOp::BitOr
        | BinaryOp::BitXor
        | BinaryOp::BitAnd
        | BinaryOp::Shl
        | BinaryOp::Shr
        | BinaryOp::ShrZero => {
            let (Some(a), Some(b)) = (int(&l), int(&r)) else {
                return Ok(None);
            };
            let shift = (b & 63) as u32;
            Some(Value::from(match op {
                BinaryOp::BitOr => a | b,
                BinaryOp::BitXor => a ^ b,
                BinaryOp::BitAnd => a & b,
                BinaryOp::Shl => a.wrapping_shl(shift),
                BinaryOp::Shr => a.wrapping_shr(shift),
                _ => ((a as u64).wrapping_shr(shift)) as i64,
            }))
        }
        BinaryOp::Coalesce => None,
    })
}

fn like(text: &[char], pat: &[char], escape: Option<char>) -> bool {
    match pat.split_first() {
        None => text.is_empty(),
        Some((&c, rest)) if Some(c) == escape => match rest.split_first() {
            Some((&lit, after)) => text.first() == Some(&lit) && like(&text[1..], after, escape),
            None => false,
        },
        Some(('%', rest)) => (0..=text.len()).any(|i| like(&text[i..], rest, escape)),
        Some(('_', rest)) => !text.is_empty() && like(&text[1..], rest, escape),
        Some((&c, rest)) => text.first() == Some(&c) && like(&text[1..], rest, escape),
    }
}

fn arity(name: &str, args: &[Option<Value>], expected: std::ops::RangeInclusive<usize>) -> Result<()> {
    if expected.contains(&args.len()) {
        Ok(())
    } else {
        Err(EvalError::Arity {
            name: name.to_string(),
            expected: format!("{}..={}", expected.start(), expected.end()),
        })
    }
}

fn string(v: &Option<Value>) -> Option<&str> {
    v.as_ref().and_then(Value::as_str)
}

fn function(name: &str, args: Vec<Option<Value>>) -> Result<Option<Value>> {
    let upper = name.to_ascii_uppercase();
    let type_check = |f: fn(&Value) -> bool| -> Result<Option<Value>> {
        arity(name, &args, 1..=1)?;
        Ok(Some(Value::Bool(args[0].as_ref().is_some_and(f))))
    };
    match upper.as_str() {
        "IS_DEFINED" => {
            arity(name, &args, 1..=1)?;
            Ok(Some(Value::Bool(args[0].is_some())))
        }
        "IS_NULL" => type_check(Value::is_null),
        "IS_BOOL" => type_check(Value::is_boolean),
        "IS_NUMBER" => type_check(Value::is_number),
        "IS_STRING" => type_check(Value::is_string),
        "IS_ARRAY" => type_check(Value::is_array),
        "IS_OBJECT" => type_check(Value::is_object),
        "LOWER" | "UPPER" => {
            arity(name, &args, 1..=1)?;
            Ok(string(&args[0]).map(|s| {
                Value::String(if upper == "LOWER" {
                    s.to_lowercase()
                } else {
                    s.to_uppercase()
                })
            }))
        }
        "LENGTH" => {
            arity(name, &args, 1..=1)?;
            Ok(string(&args[0]).map(|s| Value::from(s.chars().count() as u64)))
        }
        "CONTAINS" | "STARTSWITH" | "ENDSWITH" => {
            arity(name, &args, 2..=3)?;
            let ignore_case = matches!(args.get(2), Some(Some(Value::Bool(true))));
            let (Some(s), Some(p)) = (string(&args[0]), string(&args[1])) else {
                return Ok(None);
            };
            let (s, p) = if ignore_case {
                (s.to_lowercase(), p.to_lowercase())
            } else {
                (s.to_string(), p.to_string())
            };
            Ok(Some(Value::Bool(match upper.as_str() {
                "CONTAINS" => s.contains(&p),
                "STARTSWITH" => s.starts_with(&p),
                _ => s.ends_with(&p),
            })))
        }
        "CONCAT" => {
            let mut out = String::new();
            for a in &args {
                match string(a) {
                    Some(s) => out.push_str(s),
                    None => return Ok(None),
                }
            }
            Ok(Some(Value::String(out)))
        }
        "SUBSTRING" => {
            arity(name, &args, 3..=3)?;
            let (Some(s), Some(start), Some(len)) =
                (string(&args[0]), int(&args[1]), int(&args[2]))
            else {
                return Ok(None);
            };
            let out: String = s
                .chars()
                .skip(start.max(0) as usize)
                .take(len.max(0) as usize)
                .collect();
            Ok(Some(Value::String(out)))
        }
        "TOSTRING" => {
            arity(name, &args, 1..=1)?;
            Ok(args[0].as_ref().map(|v| match v {
                Value::String(s) => Value::String(s.clone()),
                other => Value::String(other.to_string()),
            }))
        }
        "ABS" | "FLOOR" | "CEILING" | "ROUND" => {
            arity(name, &args, 1..=1)?;
            Ok(num(&args[0]).and_then(|f| {
                number_value(match upper.as_str() {
                    "ABS" => f.abs(),
                    "FLOOR" => f.floor(),
                    "CEILING" => f.ceil(),
                    _ => f.round(),
                })
            }))
        }
        "ARRAY_LENGTH" => {
            arity(name, &args, 1..=1)?;
            Ok(match &args[0] {
                Some(Value::Array(items)) => Some(Value::from(items.len() as u64)),
                _ => None,
            })
        }
        "ARRAY_CONTAINS" => {
            arity(name, &args, 2..=3)?;
            let partial = matches!(args.get(2), Some(Some(Value::Bool(true))));
            let (Some(Value::Array(items)), Some(needle)) = (&args[0], &args[1]) else {
                return Ok(None);
            };
            let hit = items.iter().any(|item| {
                if partial {
                    contains_fields(item, needle)
                } else {
                    equals(item, needle) == Some(true)
                }
            });
            Ok(Some(Value::Bool(hit)))
        }
        _ => Err(EvalError::UnknownFunction(name.to_string())),
    }
}

fn contains_fields(item: &Value, needle: &Value) -> bool {
    match (item, needle) {
        (Value::Object(have), Value::Object(want)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|h| equals(h, v) == Some(true))),
        _ => equals(item, needle) == Some(true),
    }
}

/// Fold one aggregate over the documents of a group.
fn aggregate(kind: AggregateKind, arg: &Expr, docs: &[&Value], scope: Scope<'_>) -> Result<Option<Value>> {
    let mut values = Vec::with_capacity(docs.len());
    for &doc in docs {
        if let Some(v) = eval(arg, scope.with_doc(doc))? {
            values.push(v);
        }
    }
    Ok(match kind {
        AggregateKind::Count => Some(Value::from(values.len() as u64)),
        AggregateKind::Sum => {
            let mut total = 0.0;
            for v in &values {
                match v.as_f64() {
                    Some(f) => total += f,
                    None => return Ok(None),
                }
            }
            number_value(total)
        }
        AggregateKind::Avg => {
            let nums: Option<Vec<f64>> = values.iter().map(Value::as_f64).collect();
            match nums {
                Some(nums) if !nums.is_empty() => {
                    number_value(nums.iter().sum::<f64>() / nums.len() as f64)
                }
                _ => None,
            }
        }
        AggregateKind::Min => values
            .into_iter()
            .min_by(|a, b| compare(Some(a), Some(b))),
        AggregateKind::Max => values
            .into_iter()
            .max_by(|a, b| compare(Some(a), Some(b))),
    })
}

/// Evaluate a projection expression over a whole group.
fn eval_grouped(expr: &Expr, docs: &[&Value], scope: Scope<'_>) -> Result<Option<Value>> {
    match expr {
        Expr::Aggregate { kind, arg } => aggregate(*kind, arg, docs, scope),
        Expr::Object(fields) => {
            let mut out = Map::new();
            for (name, e) in fields {
                if let Some(v) = eval_grouped(e, docs, scope)? {
                    out.insert(name.clone(), v);
                }
            }
            Ok(Some(Value::Object(out)))
        }
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for e in items {
                if let Some(v) = eval_grouped(e, docs, scope)? {
                    out.push(v);
                }
            }
            Ok(Some(Value::Array(out)))
        }
        other => match docs.first() {
            Some(&doc) => eval(other, scope.with_doc(doc)),
            None => Ok(None),
        },
    }
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

/// Project one document. `None` means the row is dropped (`SELECT VALUE undefined`).
pub fn project(query: &SelectQuery, scope: Scope<'_>) -> Result<Option<Value>> {
    match &query.projection {
        Projection::Star => Ok(Some(scope.doc.clone())),
        Projection::Value(e) => eval(e, scope),
        Projection::Items(items) => {
            let mut out = Map::new();
            let mut unnamed = 0;
            for item in items {
                let name = column_name(item, &mut unnamed);
                if let Some(v) = eval(&item.expr, scope)? {
                    out.insert(name, v);
                }
            }
            Ok(Some(Value::Object(out)))
        }
    }
}

pub fn is_aggregate(query: &SelectQuery) -> bool {
    !query.group_by.is_empty()
        || match &query.projection {
            Projection::Star => false,
            Projection::Value(e) => e.contains_aggregate(),
            Projection::Items(items) => items.iter().any(|i| i.expr.contains_aggregate()),
        }
}

/// Group `docs` and project each group. Without GROUP BY a single row is
/// produced even when `docs` is empty.
pub fn project_groups(query: &SelectQuery, docs: &[&Value], scope: Scope<'_>) -> Result<Vec<Value>> {
    let mut groups: Vec<Vec<&Value>> = Vec::new();
    if query.group_by.is_empty() {
        groups.push(docs.to_vec());
    } else {
        let mut index: HashMap<String, usize> = HashMap::new();
        for &doc in docs {
            let mut key = Vec::with_capacity(query.group_by.len());
            for k in &query.group_by {
                key.push(canonical_key(eval(k, scope.with_doc(doc))?.as_ref()));
            }
            let key = key.join("\u{1f}");
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(doc);
        }
    }

    let mut rows = Vec::with_capacity(groups.len());
    for group in &groups {
        let row = match &query.projection {
            Projection::Star => None,
            Projection::Value(e) => eval_grouped(e, group, scope)?,
            Projection::Items(items) => {
                let mut out = Map::new();
                let mut unnamed = 0;
                for item in items {
                    let name = column_name(item, &mut unnamed);
                    if let Some(v) = eval_grouped(&item.expr, group, scope)? {
                        out.insert(name, v);
                    }
                }
                Some(Value::Object(out))
            }
        };
        rows.extend(row);
    }
    Ok(rows)
}

/// Sort key of a document under the query's ORDER BY.
pub fn sort_key(query: &SelectQuery, scope: Scope<'_>) -> Result<Vec<Option<Value>>> {
    query
        .order_by
        .iter()
        .map(|s| eval(&s.expr, scope))
        .collect()
}

pub fn compare_keys(a: &[Option<Value>], b: &[Option<Value>], query: &SelectQuery) -> Ordering {
    for ((l, r), item) in a.iter().zip(b).zip(&query.order_by) {
        let ord = compare(l.as_ref(), r.as_ref());
        let ord = match item.order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

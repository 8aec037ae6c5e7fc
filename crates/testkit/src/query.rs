//! Paged execution of one partition's share of a query.
//!
//! Continuation tokens name the last consumed document by sequence number and
//! sort key rather than by position, so a range produced by a split can resume
//! its parent's token.

use crate::eval::{
    compare_keys, eval, is_aggregate, is_true, project, project_groups, sort_key, Result, Scope,
};
use cosmosql_sql::ast::SelectQuery;
use cosmosql_sql::json::canonical;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryToken {
    /// Sequence number of the last consumed document.
    pub seq: u64,
    /// ORDER BY key of that document; an undefined component is `[]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<Vec<Value>>,
    /// Rows consumed so far, including rows skipped by OFFSET.
    pub consumed: u64,
}

impl QueryToken {
    fn new(seq: u64, key: Vec<Option<Value>>, consumed: u64) -> Self {
        Self {
            seq,
            key: key.into_iter().map(|k| k.into_iter().collect()).collect(),
            consumed,
        }
    }

    fn sort_key(&self) -> Vec<Option<Value>> {
        self.key.iter().map(|k| k.first().cloned()).collect()
    }
}

/// A stored document visible to the query, with its write sequence number.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub doc: &'a Value,
    pub seq: u64,
}

#[derive(Debug, Default)]
pub struct Page {
    pub rows: Vec<Value>,
    pub continuation: Option<QueryToken>,
}

fn bounds(query: &SelectQuery) -> (u64, Option<u64>) {
    match (query.top, query.offset_limit) {
        (Some(n), _) => (0, Some(n)),
        (None, Some((offset, limit))) => (offset, Some(limit)),
        (None, None) => (0, None),
    }
}

fn window(query: &SelectQuery, rows: Vec<Value>) -> Vec<Value> {
    let (offset, limit) = bounds(query);
    let rows = rows.into_iter().skip(offset as usize);
    match limit {
        Some(n) => rows.take(n as usize).collect(),
        None => rows.collect(),
    }
}

/// Evaluate `query` over `candidates`, returning at most `page_size` rows.
/// Aggregates and DISTINCT are answered in a single page.
pub fn run(
    query: &SelectQuery,
    params: &HashMap<String, Value>,
    candidates: Vec<Candidate<'_>>,
    page_size: usize,
    token: Option<&QueryToken>,
) -> Result<Page> {
    let null = Value::Null;
    let scope = Scope {
        alias: query.from.alias(),
        doc: &null,
        params,
    };

    let mut matched = Vec::with_capacity(candidates.len());
    for c in candidates {
        let keep = match &query.where_clause {
            Some(filter) => is_true(&eval(filter, scope.with_doc(c.doc))?),
            None => true,
        };
        if keep {
            matched.push(c);
        }
    }

    if is_aggregate(query) {
        let docs: Vec<&Value> = matched.iter().map(|c| c.doc).collect();
        let rows = project_groups(query, &docs, scope)?;
        return Ok(Page {
            rows: window(query, rows),
            continuation: None,
        });
    }

    let mut keyed = Vec::with_capacity(matched.len());
    for c in matched {
        keyed.push((sort_key(query, scope.with_doc(c.doc))?, c));
    }
    keyed.sort_by(|(ka, a), (kb, b)| compare_keys(ka, kb, query).then(a.seq.cmp(&b.seq)));

    if query.distinct {
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for (_, c) in &keyed {
            if let Some(row) = project(query, scope.with_doc(c.doc))? {
                if seen.insert(canonical(&row)) {
                    rows.push(row);
                }
            }
        }
        return Ok(Page {
            rows: window(query, rows),
            continuation: None,
        });
    }

    if let Some(t) = token {
        let after = t.sort_key();
        keyed.retain(|(k, c)| {
            compare_keys(k, &after, query).then(c.seq.cmp(&t.seq)) == Ordering::Greater
        });
    }

    let (offset, limit) = bounds(query);
    let end = limit.map(|l| offset.saturating_add(l));
    let mut consumed = token.map_or(0, |t| t.consumed);
    let mut rows = Vec::new();
    let mut last = None;
    let mut remaining = keyed.into_iter().peekable();
    while let Some((key, c)) = remaining
        .next_if(|_| rows.len() < page_size && end.map_or(true, |e| consumed < e))
    {
        consumed += 1;
        if consumed > offset {
            if let Some(row) = project(query, scope.with_doc(c.doc))? {
                rows.push(row);
            }
        }
        last = Some((key, c.seq));
    }

    let window_open = end.map_or(true, |e| consumed < e);
    let continuation = match (remaining.peek(), last) {
        (Some(_), Some((key, seq))) if window_open => Some(QueryToken::new(seq, key, consumed)),
        _ => None,
    };
    Ok(Page { rows, continuation })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosmosql_sql::parse_select;
    use serde_json::json;

    fn docs() -> Vec<Value> {
        (0..7)
            .map(|i| json!({"id": format!("d{}", i), "grade": (i * 3) % 7}))
            .collect()
    }

    fn candidates(docs: &[Value]) -> Vec<Candidate<'_>> {
        docs.iter()
            .enumerate()
            .map(|(i, doc)| Candidate { doc, seq: i as u64 + 1 })
            .collect()
    }

    fn drain(sql: &str, docs: &[Value], page_size: usize) -> (Vec<Value>, usize) {
        let q = parse_select(sql).unwrap();
        let params = HashMap::new();
        let mut token = None;
        let mut rows = Vec::new();
        let mut pages = 0;
        loop {
            let page = run(&q, &params, candidates(docs), page_size, token.as_ref()).unwrap();
            pages += 1;
            rows.extend(page.rows);
            match page.continuation {
                Some(t) => {
                    // Tokens travel as header text.
                    let text = serde_json::to_string(&t).unwrap();
                    token = Some(serde_json::from_str(&text).unwrap());
                }
                None => return (rows, pages),
            }
        }
    }

    #[test]
    fn test_pages_follow_write_order() {
        let docs = docs();
        let (rows, pages) = drain("SELECT VALUE c.id FROM c", &docs, 3);
        assert_eq!(pages, 3);
        assert_eq!(rows, vec!["d0", "d1", "d2", "d3", "d4", "d5", "d6"]);
    }

    #[test]
    fn test_ordered_pages_resume_after_key() {
        let docs = docs();
        let (rows, _) = drain("SELECT VALUE c.grade FROM c ORDER BY c.grade DESC", &docs, 2);
        assert_eq!(rows, vec![6, 5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_offset_limit_spans_pages() {
        let docs = docs();
        let (rows, _) = drain(
            "SELECT VALUE c.grade FROM c ORDER BY c.grade OFFSET 2 LIMIT 3",
            &docs,
            2,
        );
        assert_eq!(rows, vec![2, 3, 4]);
        let (rows, pages) = drain("SELECT TOP 2 VALUE c.id FROM c", &docs, 10);
        assert_eq!((rows.len(), pages), (2, 1));
    }

    #[test]
    fn test_token_resumes_on_subset() {
        // A child range sees only part of its parent's documents but can
        // continue from the parent's token.
        let docs = docs();
        let q = parse_select("SELECT VALUE c.grade FROM c ORDER BY c.grade").unwrap();
        let params = HashMap::new();
        let first = run(&q, &params, candidates(&docs), 3, None).unwrap();
        assert_eq!(first.rows, vec![0, 1, 2]);
        let token = first.continuation.unwrap();

        let child: Vec<Candidate<'_>> = candidates(&docs)
            .into_iter()
            .filter(|c| c.seq % 2 == 0)
            .collect();
        let rest = run(&q, &params, child, 10, Some(&token)).unwrap();
        assert!(rest.rows.iter().all(|v| v.as_i64().unwrap() > 2));
        assert!(rest.continuation.is_none());
    }

    #[test]
    fn test_distinct_is_single_page() {
        let docs = vec![json!({"v": 1}), json!({"v": 2}), json!({"v": 1})];
        let (rows, pages) = drain("SELECT DISTINCT VALUE c.v FROM c", &docs, 1);
        assert_eq!((rows, pages), (vec![json!(1), json!(2)], 1));
    }
}
